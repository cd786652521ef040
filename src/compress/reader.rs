use std::io::{self, Read};

use log::trace;

use crate::{
    io::{ByteSource, MAX_VARINT_LEN, decode_uvarint, read_uvarint_bytewise},
    pool::BufferPool,
};

use super::{CHECKSUM_SIZE, FrameError, FrameHeader, HEADER_SIZE, checksum};

/// Reads LZ4 frames from a stream supplied on every call and serves their
/// decompressed bytes.
///
/// Working buffers come from the pool and are only replaced when a frame declares a
/// larger block than the current ones can hold.
pub struct CompressReader {
    pool: BufferPool,
    data: Vec<u8>,
    pos: usize,
    // Method byte, sizes and payload: exactly the checksummed bytes.
    frame: Vec<u8>,
    verify: bool,
}

impl CompressReader {
    pub fn new(pool: &BufferPool) -> Self {
        Self {
            pool: pool.clone(),
            data: Vec::new(),
            pos: 0,
            frame: Vec::new(),
            verify: true,
        }
    }

    /// Enables or disables checksum verification of incoming frames.
    pub fn verify_checksum(&mut self, verify: bool) {
        self.verify = verify;
    }

    /// Decompressed bytes not yet consumed.
    pub fn buffered(&self) -> usize {
        self.data.len() - self.pos
    }

    /// Reads decompressed bytes into `buf`, pulling the next frame from `input` when the
    /// current block is exhausted. Returns 0 only at a clean end-of-stream between
    /// frames.
    pub fn read_from<R: Read + ?Sized>(
        &mut self,
        input: &mut R,
        buf: &mut [u8],
    ) -> io::Result<usize> {
        if buf.is_empty() || !self.ensure_block(input)? {
            return Ok(0);
        }
        let available = &self.data[self.pos..];
        let n = available.len().min(buf.len());
        buf[..n].copy_from_slice(&available[..n]);
        self.pos += n;
        Ok(n)
    }

    pub fn read_byte_from<R: Read + ?Sized>(&mut self, input: &mut R) -> io::Result<u8> {
        if !self.ensure_block(input)? {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
        let byte = self.data[self.pos];
        self.pos += 1;
        Ok(byte)
    }

    fn ensure_block<R: Read + ?Sized>(&mut self, input: &mut R) -> io::Result<bool> {
        // Empty blocks are legal; keep reading until one has data.
        while self.pos >= self.data.len() {
            if !self.read_block(input)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Reads and decompresses one frame. `false` means the stream ended cleanly
    /// before a header started.
    fn read_block<R: Read + ?Sized>(&mut self, input: &mut R) -> io::Result<bool> {
        let mut raw = [0_u8; HEADER_SIZE];
        if !read_header(input, &mut raw)? {
            return Ok(false);
        }
        let header = FrameHeader::parse(&raw)?;

        let frame_len = HEADER_SIZE - CHECKSUM_SIZE + header.compressed_size;
        if self.frame.capacity() < frame_len {
            let old = std::mem::replace(&mut self.frame, self.pool.get(0, frame_len));
            self.pool.put(old);
        }
        self.frame.clear();
        self.frame.extend_from_slice(&raw[CHECKSUM_SIZE..]);
        self.frame.resize(frame_len, 0);
        input.read_exact(&mut self.frame[HEADER_SIZE - CHECKSUM_SIZE..])?;

        if self.verify {
            let actual = checksum(&self.frame);
            if actual != header.checksum {
                return Err(FrameError::ChecksumMismatch {
                    expected: header.checksum,
                    actual,
                }
                .into());
            }
        }

        if self.data.capacity() < header.decompressed_size {
            let old = std::mem::replace(
                &mut self.data,
                self.pool.get(0, header.decompressed_size),
            );
            self.pool.put(old);
        }
        self.data.clear();
        self.data.resize(header.decompressed_size, 0);
        self.pos = 0;

        let decompressed = lz4_flex::block::decompress_into(
            &self.frame[HEADER_SIZE - CHECKSUM_SIZE..],
            &mut self.data,
        );
        let failure = match decompressed {
            Ok(n) if n == header.decompressed_size => None,
            Ok(n) => Some(FrameError::SizeMismatch {
                expected: header.decompressed_size,
                actual: n,
            }),
            Err(e) => Some(FrameError::from(e)),
        };
        if let Some(err) = failure {
            // A broken block must never be served.
            self.data.clear();
            return Err(err.into());
        }

        trace!(
            "read frame: {} compressed, {} decompressed",
            header.compressed_size, header.decompressed_size
        );
        Ok(true)
    }
}

/// Fills `raw` with a frame header. Returns `false` if the stream ends before the
/// first byte; a header cut short is `UnexpectedEof`.
pub fn read_header<R: Read + ?Sized>(
    input: &mut R,
    raw: &mut [u8; HEADER_SIZE],
) -> io::Result<bool> {
    let mut filled = 0;
    while filled < HEADER_SIZE {
        match input.read(&mut raw[filled..]) {
            Ok(0) if filled == 0 => return Ok(false),
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("truncated compression header: {filled} of {HEADER_SIZE} bytes"),
                ));
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(true)
}

impl Drop for CompressReader {
    fn drop(&mut self) {
        self.pool.put(std::mem::take(&mut self.data));
        self.pool.put(std::mem::take(&mut self.frame));
    }
}

/// A [`CompressReader`] bound to its input for the duration of a borrow.
pub(crate) struct Framed<'a, R: ?Sized> {
    pub reader: &'a mut CompressReader,
    pub input: &'a mut R,
}

impl<R: Read + ?Sized> Read for Framed<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.reader.read_from(self.input, buf)
    }
}

impl<R: Read + ?Sized> ByteSource for Framed<'_, R> {
    fn read_byte(&mut self) -> io::Result<u8> {
        self.reader.read_byte_from(self.input)
    }

    fn read_uvarint(&mut self) -> io::Result<u64> {
        let reader = &mut *self.reader;
        if reader.buffered() >= MAX_VARINT_LEN {
            if let Some((value, n)) = decode_uvarint(&reader.data[reader.pos..])? {
                reader.pos += n;
                return Ok(value);
            }
        }
        read_uvarint_bytewise(self)
    }
}
