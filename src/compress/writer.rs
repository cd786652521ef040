use std::io::{self, Write};

use log::trace;

use crate::pool::BufferPool;

use super::{
    CHECKSUM_SIZE, DEFAULT_BLOCK_SIZE, FrameError, FrameHeader, HEADER_SIZE, MAX_BLOCK_SIZE,
    METHOD_LZ4, checksum,
};

/// Accumulates bytes into blocks and writes each full block to a caller-supplied stream
/// as one LZ4 frame.
pub struct CompressWriter {
    pool: BufferPool,
    block: Vec<u8>,
    block_size: usize,
    // Header followed by the compressed payload of the frame being emitted.
    frame: Vec<u8>,
}

impl CompressWriter {
    pub fn new(pool: &BufferPool) -> Self {
        Self::with_block_size(pool, DEFAULT_BLOCK_SIZE)
    }

    /// Block size is clamped to `1..=MAX_BLOCK_SIZE`.
    pub fn with_block_size(pool: &BufferPool, block_size: usize) -> Self {
        let block_size = block_size.clamp(1, MAX_BLOCK_SIZE);
        Self {
            pool: pool.clone(),
            block: Vec::new(),
            block_size,
            frame: Vec::new(),
        }
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Bytes waiting for the current block to fill.
    pub fn pending(&self) -> usize {
        self.block.len()
    }

    /// Buffers `data`, emitting a frame to `out` each time the block fills.
    pub fn write_to<W: Write + ?Sized>(
        &mut self,
        out: &mut W,
        mut data: &[u8],
    ) -> io::Result<()> {
        if self.block.capacity() == 0 && !data.is_empty() {
            self.block = self.pool.get(0, self.block_size);
        }
        while !data.is_empty() {
            let room = self.block_size - self.block.len();
            let n = room.min(data.len());
            self.block.extend_from_slice(&data[..n]);
            data = &data[n..];
            if self.block.len() >= self.block_size {
                self.emit(out)?;
            }
        }
        Ok(())
    }

    /// Emits whatever is buffered as a final, possibly short, frame. Nothing is written
    /// when the block is empty.
    pub fn flush_to<W: Write + ?Sized>(&mut self, out: &mut W) -> io::Result<()> {
        if self.block.is_empty() {
            return Ok(());
        }
        self.emit(out)
    }

    fn emit<W: Write + ?Sized>(&mut self, out: &mut W) -> io::Result<()> {
        let bound = lz4_flex::block::get_maximum_output_size(self.block.len());
        let frame_len = HEADER_SIZE + bound;
        if self.frame.capacity() < frame_len {
            let old = std::mem::replace(&mut self.frame, self.pool.get(0, frame_len));
            self.pool.put(old);
        }
        self.frame.clear();
        self.frame.resize(frame_len, 0);

        let compressed =
            lz4_flex::block::compress_into(&self.block, &mut self.frame[HEADER_SIZE..])
                .map_err(FrameError::from)?;
        let header = FrameHeader {
            checksum: 0,
            method: METHOD_LZ4,
            compressed_size: compressed,
            decompressed_size: self.block.len(),
        };
        header.encode_sizes(&mut self.frame);

        let frame = &mut self.frame[..HEADER_SIZE + compressed];
        let sum = checksum(&frame[CHECKSUM_SIZE..]);
        frame[..CHECKSUM_SIZE].copy_from_slice(&sum.to_le_bytes());

        trace!(
            "writing frame: {} bytes compressed to {}",
            self.block.len(),
            compressed
        );
        // The block is consumed even if the write fails; the stream is broken by then.
        self.block.clear();
        out.write_all(frame)
    }
}

impl Drop for CompressWriter {
    fn drop(&mut self) {
        self.pool.put(std::mem::take(&mut self.block));
        self.pool.put(std::mem::take(&mut self.frame));
    }
}
