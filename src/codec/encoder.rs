use std::io::{self, Write};

use crate::{
    compress::{CompressWriter, DEFAULT_BLOCK_SIZE},
    error::Result,
    io::{MAX_VARINT_LEN, encode_uvarint},
    pool::BufferPool,
};

/// Writes protocol primitives to `W`, optionally through LZ4 framing.
pub struct Encoder<W: Write> {
    output: W,
    compress: bool,
    compressor: CompressWriter,
}

impl<W: Write> Encoder<W> {
    pub fn new(output: W, pool: &BufferPool) -> Self {
        Self::with_block_size(output, pool, DEFAULT_BLOCK_SIZE)
    }

    /// Like [`Encoder::new`] with a custom block size for compressed segments.
    pub fn with_block_size(output: W, pool: &BufferPool, block_size: usize) -> Self {
        Self {
            output,
            compress: false,
            compressor: CompressWriter::with_block_size(pool, block_size),
        }
    }

    /// Switches compression on or off for subsequent writes. Turning it off emits any
    /// pending compressed block first, so segments reach the stream in write order.
    pub fn set_compress(&mut self, compress: bool) -> Result<()> {
        if self.compress && !compress {
            self.compressor.flush_to(&mut self.output)?;
        }
        self.compress = compress;
        Ok(())
    }

    pub fn is_compressed(&self) -> bool {
        self.compress
    }

    pub fn write_uvarint(&mut self, value: u64) -> Result<()> {
        let mut buf = [0_u8; MAX_VARINT_LEN];
        let n = encode_uvarint(value, &mut buf);
        self.put(&buf[..n])
    }

    pub fn write_bool(&mut self, value: bool) -> Result<()> {
        self.write_u8(value as u8)
    }

    pub fn write_u8(&mut self, value: u8) -> Result<()> {
        self.put(&[value])
    }

    pub fn write_i8(&mut self, value: i8) -> Result<()> {
        self.put(&value.to_le_bytes())
    }

    pub fn write_u16(&mut self, value: u16) -> Result<()> {
        self.put(&value.to_le_bytes())
    }

    pub fn write_i16(&mut self, value: i16) -> Result<()> {
        self.put(&value.to_le_bytes())
    }

    pub fn write_u32(&mut self, value: u32) -> Result<()> {
        self.put(&value.to_le_bytes())
    }

    pub fn write_i32(&mut self, value: i32) -> Result<()> {
        self.put(&value.to_le_bytes())
    }

    pub fn write_u64(&mut self, value: u64) -> Result<()> {
        self.put(&value.to_le_bytes())
    }

    pub fn write_i64(&mut self, value: i64) -> Result<()> {
        self.put(&value.to_le_bytes())
    }

    pub fn write_f32(&mut self, value: f32) -> Result<()> {
        self.write_u32(value.to_bits())
    }

    pub fn write_f64(&mut self, value: f64) -> Result<()> {
        self.write_u64(value.to_bits())
    }

    /// Varint length followed by the UTF-8 bytes.
    pub fn write_string(&mut self, value: &str) -> Result<()> {
        self.write_bytes_with_len(value.as_bytes())
    }

    pub fn write_bytes_with_len(&mut self, value: &[u8]) -> Result<()> {
        self.write_uvarint(value.len() as u64)?;
        self.put(value)
    }

    /// Bytes without a length prefix.
    pub fn write_raw(&mut self, value: &[u8]) -> Result<()> {
        self.put(value)
    }

    pub fn get_ref(&self) -> &W {
        &self.output
    }

    /// Emits any pending compressed block, flushes and returns the output.
    pub fn finish(mut self) -> Result<W> {
        Write::flush(&mut self)?;
        Ok(self.output)
    }

    fn put(&mut self, bytes: &[u8]) -> Result<()> {
        self.put_io(bytes)?;
        Ok(())
    }

    fn put_io(&mut self, bytes: &[u8]) -> io::Result<()> {
        if self.compress {
            self.compressor.write_to(&mut self.output, bytes)
        } else {
            self.output.write_all(bytes)
        }
    }
}

/// Raw bytes through the current (compressed or plain) stream.
impl<W: Write> Write for Encoder<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.put_io(buf)?;
        Ok(buf.len())
    }

    /// Emits the pending compressed block, if any, then flushes the output.
    fn flush(&mut self) -> io::Result<()> {
        self.compressor.flush_to(&mut self.output)?;
        self.output.flush()
    }
}

#[cfg(test)]
mod tests {
    use crate::compress::{CHECKSUM_SIZE, HEADER_SIZE, METHOD_LZ4};

    use super::*;

    #[test]
    fn writes_primitives_little_endian() {
        let pool = BufferPool::default();
        let mut encoder = Encoder::new(Vec::new(), &pool);

        encoder.write_bool(true).unwrap();
        encoder.write_i8(-2).unwrap();
        encoder.write_u16(0x0102).unwrap();
        encoder.write_i32(-1).unwrap();
        encoder.write_u64(1).unwrap();
        encoder.write_f32(1.0).unwrap();

        let wire = encoder.finish().unwrap();
        assert_eq!(
            wire,
            [
                1, 0xfe, 0x02, 0x01, 0xff, 0xff, 0xff, 0xff, 1, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0x80,
                0x3f
            ]
        );
    }

    #[test]
    fn writes_varints() {
        let pool = BufferPool::default();
        let mut encoder = Encoder::new(Vec::new(), &pool);

        encoder.write_uvarint(0).unwrap();
        encoder.write_uvarint(127).unwrap();
        encoder.write_uvarint(300).unwrap();
        encoder.write_uvarint(u64::MAX).unwrap();

        let wire = encoder.finish().unwrap();
        assert_eq!(&wire[..4], [0x00, 0x7f, 0xac, 0x02]);
        assert_eq!(wire.len(), 4 + MAX_VARINT_LEN);
        assert_eq!(wire[wire.len() - 1], 0x01);
    }

    #[test]
    fn compression_applies_between_toggles() {
        let pool = BufferPool::default();
        let mut encoder = Encoder::new(Vec::new(), &pool);

        encoder.write_string("plain").unwrap();
        encoder.set_compress(true).unwrap();
        assert!(encoder.is_compressed());
        encoder.write_raw(&[0; 1000]).unwrap();
        // Nothing reaches the stream until the block is closed.
        assert_eq!(encoder.get_ref().len(), 6);
        encoder.set_compress(false).unwrap();
        encoder.write_u8(9).unwrap();

        let wire = encoder.finish().unwrap();
        assert_eq!(&wire[..6], b"\x05plain");
        assert_eq!(wire[6 + CHECKSUM_SIZE], METHOD_LZ4);
        assert!(wire.len() < 6 + HEADER_SIZE + 1000);
        assert_eq!(wire[wire.len() - 1], 9);
    }

    #[test]
    fn io_write_goes_through_current_stream() {
        let pool = BufferPool::default();
        let mut encoder = Encoder::new(Vec::new(), &pool);
        encoder.set_compress(true).unwrap();
        encoder.write_all(b"bulk column data").unwrap();
        encoder.flush().unwrap();

        assert_eq!(encoder.get_ref()[CHECKSUM_SIZE], METHOD_LZ4);
    }
}
