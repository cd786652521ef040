use std::io::{self, Read};

use crate::{
    compress::{CompressReader, Framed},
    error::{Error, Result},
    io::{ByteReader, ByteSource},
    pool::BufferPool,
};

/// Reads protocol primitives from `S`, optionally through LZ4 framing.
///
/// Sources with their own fast varint path ([`ZReader`](crate::io::ZReader),
/// [`ZBufferReader`](crate::io::ZBufferReader)) are used directly; plain readers go
/// through [`Decoder::from_reader`].
pub struct Decoder<S: ByteSource> {
    input: S,
    compress: bool,
    decompressor: CompressReader,
}

impl<R: Read> Decoder<ByteReader<R>> {
    /// Wraps a plain reader, decoding varints one byte at a time.
    pub fn from_reader(reader: R, pool: &BufferPool) -> Self {
        Self::new(ByteReader::new(reader), pool)
    }
}

impl<S: ByteSource> Decoder<S> {
    pub fn new(input: S, pool: &BufferPool) -> Self {
        Self {
            input,
            compress: false,
            decompressor: CompressReader::new(pool),
        }
    }

    /// Switches subsequent reads between the raw stream and its LZ4 frames.
    pub fn set_compress(&mut self, compress: bool) {
        self.compress = compress;
    }

    pub fn is_compressed(&self) -> bool {
        self.compress
    }

    /// Enables or disables checksum verification of compressed frames.
    pub fn verify_checksum(&mut self, verify: bool) {
        self.decompressor.verify_checksum(verify);
    }

    pub fn read_uvarint(&mut self) -> Result<u64> {
        Ok(self.current().read_uvarint()?)
    }

    /// Any non-zero byte is `true`.
    pub fn read_bool(&mut self) -> Result<bool> {
        Ok(self.read_u8()? > 0)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.current().read_byte()?)
    }

    pub fn read_i8(&mut self) -> Result<i8> {
        Ok(i8::from_le_bytes(self.read_array()?))
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.read_array()?))
    }

    pub fn read_i16(&mut self) -> Result<i16> {
        Ok(i16::from_le_bytes(self.read_array()?))
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.read_array()?))
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        Ok(i32::from_le_bytes(self.read_array()?))
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.read_array()?))
    }

    pub fn read_i64(&mut self) -> Result<i64> {
        Ok(i64::from_le_bytes(self.read_array()?))
    }

    pub fn read_f32(&mut self) -> Result<f32> {
        Ok(f32::from_bits(self.read_u32()?))
    }

    pub fn read_f64(&mut self) -> Result<f64> {
        Ok(f64::from_bits(self.read_u64()?))
    }

    pub fn read_string(&mut self) -> Result<String> {
        Ok(String::from_utf8(self.read_bytes_with_len()?)?)
    }

    /// Reads a varint length and then that many bytes.
    ///
    /// The buffer grows as bytes arrive, so a corrupt length fails with
    /// `UnexpectedEof` at the end of the stream instead of allocating up front.
    pub fn read_bytes_with_len(&mut self) -> Result<Vec<u8>> {
        let len = self.read_uvarint()?;
        if len > isize::MAX as u64 {
            return Err(Error::LengthOverflow(len));
        }

        let mut buf = Vec::new();
        let mut current = self.current();
        (&mut current).take(len).read_to_end(&mut buf)?;
        if buf.len() as u64 != len {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("expected {len} bytes, stream ended after {}", buf.len()),
            )
            .into());
        }
        Ok(buf)
    }

    /// Fills `buf` completely.
    pub fn read_full(&mut self, buf: &mut [u8]) -> Result<()> {
        self.current().read_exact(buf)?;
        Ok(())
    }

    pub fn get_ref(&self) -> &S {
        &self.input
    }

    pub fn into_inner(self) -> S {
        self.input
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut buf = [0_u8; N];
        self.current().read_exact(&mut buf)?;
        Ok(buf)
    }

    fn current(&mut self) -> Current<'_, S> {
        if self.compress {
            Current::Framed(Framed {
                reader: &mut self.decompressor,
                input: &mut self.input,
            })
        } else {
            Current::Raw(&mut self.input)
        }
    }
}

/// Raw bytes from the current (compressed or plain) stream.
impl<S: ByteSource> Read for Decoder<S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.current().read(buf)
    }
}

/// The stream primitives read from, picked by the compression toggle.
enum Current<'a, S> {
    Raw(&'a mut S),
    Framed(Framed<'a, S>),
}

impl<S: ByteSource> Read for Current<'_, S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Current::Raw(input) => input.read(buf),
            Current::Framed(framed) => framed.read(buf),
        }
    }
}

impl<S: ByteSource> ByteSource for Current<'_, S> {
    fn read_byte(&mut self) -> io::Result<u8> {
        match self {
            Current::Raw(input) => input.read_byte(),
            Current::Framed(framed) => framed.read_byte(),
        }
    }

    fn read_uvarint(&mut self) -> io::Result<u64> {
        match self {
            Current::Raw(input) => input.read_uvarint(),
            Current::Framed(framed) => framed.read_uvarint(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{io::Write, thread};

    use crate::{
        codec::Encoder,
        compress::{CHECKSUM_SIZE, FrameError, METHOD_LZ4},
        io::{PipelineConfig, ZReader, ZWriter, zbuffer},
    };

    use super::*;

    #[test]
    fn decodes_mixed_stream() {
        let pool = BufferPool::default();
        let wire = b"\xac\x02\x02hi\x07\0\0\0";
        let mut decoder = Decoder::from_reader(&wire[..], &pool);

        assert_eq!(decoder.read_uvarint().unwrap(), 300);
        assert_eq!(decoder.read_string().unwrap(), "hi");
        assert_eq!(decoder.read_u32().unwrap(), 7);
        assert!(decoder.read_u8().unwrap_err().is_eof());
    }

    #[test]
    fn primitives_roundtrip() {
        let pool = BufferPool::default();
        let mut encoder = Encoder::new(Vec::new(), &pool);
        encoder.write_bool(false).unwrap();
        encoder.write_i8(i8::MIN).unwrap();
        encoder.write_u16(u16::MAX).unwrap();
        encoder.write_i16(-300).unwrap();
        encoder.write_i32(i32::MIN).unwrap();
        encoder.write_i64(-42).unwrap();
        encoder.write_f32(-0.5).unwrap();
        encoder.write_f64(f64::MAX).unwrap();
        encoder.write_bytes_with_len(&[]).unwrap();
        let wire = encoder.finish().unwrap();

        let mut decoder = Decoder::from_reader(&wire[..], &pool);
        assert!(!decoder.read_bool().unwrap());
        assert_eq!(decoder.read_i8().unwrap(), i8::MIN);
        assert_eq!(decoder.read_u16().unwrap(), u16::MAX);
        assert_eq!(decoder.read_i16().unwrap(), -300);
        assert_eq!(decoder.read_i32().unwrap(), i32::MIN);
        assert_eq!(decoder.read_i64().unwrap(), -42);
        assert_eq!(decoder.read_f32().unwrap(), -0.5);
        assert_eq!(decoder.read_f64().unwrap(), f64::MAX);
        assert!(decoder.read_bytes_with_len().unwrap().is_empty());
    }

    #[test]
    fn any_nonzero_byte_is_true() {
        let pool = BufferPool::default();
        let mut decoder = Decoder::from_reader(&[2_u8, 0][..], &pool);

        assert!(decoder.read_bool().unwrap());
        assert!(!decoder.read_bool().unwrap());
    }

    #[test]
    fn compression_toggles_mid_message() {
        let pool = BufferPool::default();
        let column: Vec<u8> = (0..5000).map(|i| (i % 10) as u8).collect();

        let mut encoder = Encoder::with_block_size(Vec::new(), &pool, 1024);
        encoder.write_string("block header").unwrap();
        encoder.set_compress(true).unwrap();
        encoder.write_uvarint(column.len() as u64).unwrap();
        encoder.write_raw(&column).unwrap();
        encoder.set_compress(false).unwrap();
        encoder.write_u64(99).unwrap();
        let wire = encoder.finish().unwrap();

        let mut decoder = Decoder::from_reader(&wire[..], &pool);
        assert_eq!(decoder.read_string().unwrap(), "block header");
        decoder.set_compress(true);
        let len = decoder.read_uvarint().unwrap() as usize;
        let mut out = vec![0; len];
        decoder.read_full(&mut out).unwrap();
        assert_eq!(out, column);
        decoder.set_compress(false);
        assert_eq!(decoder.read_u64().unwrap(), 99);
    }

    #[test]
    fn compressed_primitives_roundtrip() {
        let pool = BufferPool::default();
        // Tiny blocks split most values across frames.
        let mut encoder = Encoder::with_block_size(Vec::new(), &pool, 7);
        encoder.set_compress(true).unwrap();
        encoder.write_bool(true).unwrap();
        encoder.write_u8(0xab).unwrap();
        encoder.write_i8(-7).unwrap();
        encoder.write_u16(0xbeef).unwrap();
        encoder.write_i16(i16::MIN).unwrap();
        encoder.write_u32(u32::MAX).unwrap();
        encoder.write_i32(-123_456).unwrap();
        encoder.write_u64(1 << 63).unwrap();
        encoder.write_i64(i64::MIN).unwrap();
        encoder.write_f32(3.5).unwrap();
        encoder.write_f64(-1e300).unwrap();
        encoder.write_uvarint(u64::MAX).unwrap();
        encoder.write_string("").unwrap();
        encoder.write_string("compressed").unwrap();
        let wire = encoder.finish().unwrap();
        assert_eq!(wire[CHECKSUM_SIZE], METHOD_LZ4);

        let mut decoder = Decoder::from_reader(&wire[..], &pool);
        decoder.set_compress(true);
        assert!(decoder.is_compressed());
        assert!(decoder.read_bool().unwrap());
        assert_eq!(decoder.read_u8().unwrap(), 0xab);
        assert_eq!(decoder.read_i8().unwrap(), -7);
        assert_eq!(decoder.read_u16().unwrap(), 0xbeef);
        assert_eq!(decoder.read_i16().unwrap(), i16::MIN);
        assert_eq!(decoder.read_u32().unwrap(), u32::MAX);
        assert_eq!(decoder.read_i32().unwrap(), -123_456);
        assert_eq!(decoder.read_u64().unwrap(), 1 << 63);
        assert_eq!(decoder.read_i64().unwrap(), i64::MIN);
        assert_eq!(decoder.read_f32().unwrap(), 3.5);
        assert_eq!(decoder.read_f64().unwrap(), -1e300);
        assert_eq!(decoder.read_uvarint().unwrap(), u64::MAX);
        assert_eq!(decoder.read_string().unwrap(), "");
        assert_eq!(decoder.read_string().unwrap(), "compressed");
        assert!(decoder.read_u8().unwrap_err().is_eof());
    }

    #[test]
    fn unknown_method_is_typed_error() {
        let pool = BufferPool::default();
        let mut encoder = Encoder::new(Vec::new(), &pool);
        encoder.set_compress(true).unwrap();
        encoder.write_u32(1).unwrap();
        let mut wire = encoder.finish().unwrap();
        wire[CHECKSUM_SIZE] = 0x90;

        let mut decoder = Decoder::from_reader(&wire[..], &pool);
        decoder.set_compress(true);
        let err = decoder.read_u32().unwrap_err();
        assert!(matches!(err, Error::Frame(FrameError::UnsupportedMethod(0x90))));
        assert!(err.to_string().contains("0x90"));
    }

    #[test]
    fn invalid_utf8_string() {
        let pool = BufferPool::default();
        let mut decoder = Decoder::from_reader(&b"\x02\xff\xfe"[..], &pool);

        assert!(matches!(
            decoder.read_string().unwrap_err(),
            Error::InvalidString(_)
        ));
    }

    #[test]
    fn oversized_length_is_rejected() {
        let pool = BufferPool::default();
        let mut wire = Vec::new();
        let mut encoder = Encoder::new(&mut wire, &pool);
        encoder.write_uvarint(u64::MAX).unwrap();
        encoder.finish().unwrap();

        let mut decoder = Decoder::from_reader(&wire[..], &pool);
        assert!(matches!(
            decoder.read_bytes_with_len().unwrap_err(),
            Error::LengthOverflow(u64::MAX)
        ));
    }

    #[test]
    fn truncated_string_is_eof() {
        let pool = BufferPool::default();
        let mut decoder = Decoder::from_reader(&b"\x05ab"[..], &pool);

        assert!(decoder.read_string().unwrap_err().is_eof());
    }

    #[test]
    fn decodes_from_pipelines() {
        let pool = BufferPool::default();
        let (sink, source) = zbuffer(&pool, PipelineConfig::new(16, 2));
        let writer = ZWriter::new(sink, &pool, PipelineConfig::new(10, 2)).unwrap();
        let reader = ZReader::new(source, &pool, PipelineConfig::new(12, 2)).unwrap();

        let producer = thread::spawn({
            let pool = pool.clone();
            move || {
                let mut encoder = Encoder::with_block_size(writer, &pool, 64);
                for i in 0..200_u64 {
                    encoder.write_uvarint(i << 20).unwrap();
                    encoder.set_compress(i % 2 == 0).unwrap();
                    encoder.write_string(&format!("row {i}")).unwrap();
                    encoder.set_compress(false).unwrap();
                }
                encoder.flush().unwrap();
                encoder.finish().unwrap().close().unwrap();
            }
        });

        let mut decoder = Decoder::new(reader, &pool);
        for i in 0..200_u64 {
            assert_eq!(decoder.read_uvarint().unwrap(), i << 20);
            decoder.set_compress(i % 2 == 0);
            assert_eq!(decoder.read_string().unwrap(), format!("row {i}"));
            decoder.set_compress(false);
        }
        producer.join().unwrap();
        decoder.into_inner().close().unwrap();
    }
}
