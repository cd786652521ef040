//! Streaming pipelines over pooled buffers.
//!
//! This module decouples blocking I/O from parsing. Each pipeline owns a small ring of
//! pooled buffers that cycles between two bounded queues:
//!
//! - [`ZReader`]: a background thread refills buffers from a source while the caller drains
//!   them lazily.
//! - [`ZWriter`]: the caller fills buffers while a background thread performs the blocking
//!   writes on the sink.
//! - [`zbuffer`]: an in-memory pipe between a producer and a consumer on different threads,
//!   without a socket and without unbounded buffering.
//!
//! Within one pipeline buffers are consumed in exactly the order they were produced.
//! Background threads never return errors directly; they record the first error and close
//! their output queue so the owner observes it on its next blocking call.
//!
//! The [`ByteSource`] trait is the fast single-value capability the codec looks for.
//! Pipelines implement it over their active buffer; any other reader can be wrapped in a
//! [`ByteReader`], which decodes varints one byte at a time.
pub mod task;

mod reader;
mod writer;
mod zbuffer;

use std::{
    io::{self, Read},
    sync::{Arc, Mutex, PoisonError},
};

pub use reader::ZReader;
pub use writer::ZWriter;
pub use zbuffer::{ZBufferReader, ZBufferWriter, zbuffer};

/// Longest LEB128 encoding of a `u64`.
pub const MAX_VARINT_LEN: usize = 10;

pub const DEFAULT_BUFFER_SIZE: usize = 64 * 1024;
pub const DEFAULT_CHANNEL_SIZE: usize = 4;

/// Sizing of a pipeline's buffer ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineConfig {
    /// Capacity of every buffer in the ring.
    pub buffer_size: usize,
    /// Number of buffers in flight between the caller and the background side.
    pub channel_size: usize,
}

impl PipelineConfig {
    pub fn new(buffer_size: usize, channel_size: usize) -> Self {
        Self {
            buffer_size,
            channel_size,
        }
    }

    fn buffer_size(&self) -> usize {
        self.buffer_size.max(1)
    }

    fn channel_size(&self) -> usize {
        self.channel_size.max(1)
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER_SIZE, DEFAULT_CHANNEL_SIZE)
    }
}

/// A byte stream with single-value fast paths.
pub trait ByteSource: Read {
    /// Reads one byte. End-of-stream is [`io::ErrorKind::UnexpectedEof`].
    fn read_byte(&mut self) -> io::Result<u8>;

    /// Reads an unsigned LEB128 varint.
    fn read_uvarint(&mut self) -> io::Result<u64> {
        read_uvarint_bytewise(self)
    }
}

impl<S: ByteSource + ?Sized> ByteSource for &mut S {
    fn read_byte(&mut self) -> io::Result<u8> {
        (**self).read_byte()
    }

    fn read_uvarint(&mut self) -> io::Result<u64> {
        (**self).read_uvarint()
    }
}

/// Adapts any reader to [`ByteSource`] with byte-at-a-time varint decoding.
#[derive(Debug)]
pub struct ByteReader<R> {
    inner: R,
}

impl<R: Read> ByteReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    pub fn get_ref(&self) -> &R {
        &self.inner
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: Read> Read for ByteReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf)
    }
}

impl<R: Read> ByteSource for ByteReader<R> {
    fn read_byte(&mut self) -> io::Result<u8> {
        let mut byte = [0_u8; 1];
        self.inner.read_exact(&mut byte)?;
        Ok(byte[0])
    }
}

/// Decodes a varint by pulling one byte at a time from `source`.
pub(crate) fn read_uvarint_bytewise<S: ByteSource + ?Sized>(source: &mut S) -> io::Result<u64> {
    let mut value = 0_u64;
    for i in 0..MAX_VARINT_LEN {
        let byte = source.read_byte()?;
        if let Some(v) = varint_step(value, i, byte)? {
            return Ok(v);
        }
        value |= u64::from(byte & 0x7f) << (7 * i);
    }
    Err(varint_overflow())
}

/// Handles byte `i` of a varint. Returns the finished value when `byte` is the last one.
fn varint_step(value: u64, i: usize, byte: u8) -> io::Result<Option<u64>> {
    if byte >= 0x80 {
        return Ok(None);
    }
    if i == MAX_VARINT_LEN - 1 && byte > 1 {
        return Err(varint_overflow());
    }
    Ok(Some(value | (u64::from(byte) << (7 * i))))
}

fn varint_overflow() -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, "varint overflows a 64-bit integer")
}

/// Decodes a varint held entirely in `buf`. Returns the value and the bytes consumed,
/// or `None` when `buf` ends before the varint does.
pub(crate) fn decode_uvarint(buf: &[u8]) -> io::Result<Option<(u64, usize)>> {
    let mut value = 0_u64;
    for (i, &byte) in buf.iter().take(MAX_VARINT_LEN).enumerate() {
        if let Some(v) = varint_step(value, i, byte)? {
            return Ok(Some((v, i + 1)));
        }
        value |= u64::from(byte & 0x7f) << (7 * i);
    }
    if buf.len() >= MAX_VARINT_LEN {
        return Err(varint_overflow());
    }
    Ok(None)
}

/// Writes the LEB128 encoding of `value` into `out`, returning its length.
pub(crate) fn encode_uvarint(mut value: u64, out: &mut [u8; MAX_VARINT_LEN]) -> usize {
    let mut i = 0;
    while value >= 0x80 {
        out[i] = (value as u8) | 0x80;
        value >>= 7;
        i += 1;
    }
    out[i] = value as u8;
    i + 1
}

/// First error recorded by a background task.
///
/// The error is reported to every later caller with the same kind and message, since
/// `io::Error` itself cannot be cloned.
#[derive(Debug, Clone, Default)]
pub(crate) struct ErrorSlot(Arc<Mutex<Option<io::Error>>>);

impl ErrorSlot {
    pub fn set(&self, err: io::Error) {
        let mut slot = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_none() {
            *slot = Some(err);
        }
    }

    pub fn get(&self) -> Option<io::Error> {
        let slot = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        slot.as_ref()
            .map(|e| io::Error::new(e.kind(), e.to_string()))
    }
}
