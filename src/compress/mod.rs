//! LZ4 block-compression framing.
//!
//! Compressed data travels as a sequence of self-describing frames. Each frame carries a
//! fixed 25-byte header followed by one LZ4 block:
//!
//! ```text
//! +-------------+--------+---------------------+-----------------------+---------+
//! | checksum 16 | method | compressed size u32 | decompressed size u32 | payload |
//! +-------------+--------+---------------------+-----------------------+---------+
//! ```
//!
//! - Integers are little-endian.
//! - The compressed size counts the 9 header bytes after the checksum (method and both
//!   sizes) plus the payload.
//! - The checksum is CityHash128 (v1.0.2) over those same bytes: method, sizes and payload.
//! - Only [`METHOD_LZ4`] is understood; any other method byte is a decode error.
//!
//! [`CompressWriter`] accumulates bytes into blocks and emits frames; [`CompressReader`]
//! reads frames back. Neither owns the underlying stream: the codec hands them its raw
//! stream on every call, which lets compression be switched on and off mid-message.
mod reader;
mod writer;

use std::io;

use cityhash_rs::cityhash_102_128;
use thiserror::Error;

pub(crate) use reader::Framed;
pub use reader::{CompressReader, read_header};
pub use writer::CompressWriter;

pub const CHECKSUM_SIZE: usize = 16;
/// Method byte plus the two size fields.
pub const COMPRESSED_HEADER_SIZE: usize = 9;
pub const HEADER_SIZE: usize = CHECKSUM_SIZE + COMPRESSED_HEADER_SIZE;

pub const METHOD_LZ4: u8 = 0x82;

/// Largest block, compressed or not, a frame may declare.
pub const MAX_BLOCK_SIZE: usize = 1 << 30;
pub const DEFAULT_BLOCK_SIZE: usize = 1 << 20;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("unsupported compression method 0x{0:02x}")]
    UnsupportedMethod(u8),

    #[error("declared compressed size {0} is smaller than the 9 byte header")]
    InvalidSize(u32),

    #[error("declared block of {0} bytes exceeds the 1 GiB limit")]
    TooLarge(usize),

    #[error("block decompressed to {actual} bytes, header declared {expected}")]
    SizeMismatch { expected: usize, actual: usize },

    #[error("checksum mismatch: expected {expected:032x}, computed {actual:032x}")]
    ChecksumMismatch { expected: u128, actual: u128 },

    #[error("lz4 decompression failed: {0}")]
    Decompress(#[from] lz4_flex::block::DecompressError),

    #[error("lz4 compression failed: {0}")]
    Compress(#[from] lz4_flex::block::CompressError),
}

impl From<FrameError> for io::Error {
    fn from(value: FrameError) -> Self {
        io::Error::new(io::ErrorKind::InvalidData, value)
    }
}

/// Parsed 25-byte frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub checksum: u128,
    pub method: u8,
    /// Payload bytes following the header.
    pub compressed_size: usize,
    pub decompressed_size: usize,
}

impl FrameHeader {
    /// Validates and parses a raw header.
    pub fn parse(raw: &[u8; HEADER_SIZE]) -> Result<Self, FrameError> {
        let mut checksum = [0_u8; CHECKSUM_SIZE];
        checksum.copy_from_slice(&raw[..CHECKSUM_SIZE]);
        let checksum = u128::from_le_bytes(checksum);
        let method = raw[CHECKSUM_SIZE];
        if method != METHOD_LZ4 {
            return Err(FrameError::UnsupportedMethod(method));
        }

        let declared = read_u32(raw, CHECKSUM_SIZE + 1);
        let compressed_size = (declared as usize)
            .checked_sub(COMPRESSED_HEADER_SIZE)
            .ok_or(FrameError::InvalidSize(declared))?;
        let decompressed_size = read_u32(raw, CHECKSUM_SIZE + 5) as usize;

        for size in [compressed_size, decompressed_size] {
            if size > MAX_BLOCK_SIZE {
                return Err(FrameError::TooLarge(size));
            }
        }

        Ok(Self {
            checksum,
            method,
            compressed_size,
            decompressed_size,
        })
    }

    /// Writes the method and size fields into `out[CHECKSUM_SIZE..HEADER_SIZE]`.
    /// The checksum is filled in separately once the payload is known.
    fn encode_sizes(&self, out: &mut [u8]) {
        out[CHECKSUM_SIZE] = self.method;
        let declared = (self.compressed_size + COMPRESSED_HEADER_SIZE) as u32;
        out[CHECKSUM_SIZE + 1..CHECKSUM_SIZE + 5].copy_from_slice(&declared.to_le_bytes());
        out[CHECKSUM_SIZE + 5..HEADER_SIZE]
            .copy_from_slice(&(self.decompressed_size as u32).to_le_bytes());
    }
}

fn read_u32(raw: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([raw[at], raw[at + 1], raw[at + 2], raw[at + 3]])
}

/// CityHash128 of the bytes following the checksum field, in wire order.
pub fn checksum(data: &[u8]) -> u128 {
    cityhash_102_128(data).rotate_right(64)
}
