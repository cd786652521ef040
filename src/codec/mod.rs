//! Primitive wire types of the native protocol.
//!
//! [`Encoder`] and [`Decoder`] read and write:
//!
//! - unsigned LEB128 varints
//! - little-endian fixed-width integers
//! - IEEE-754 floats by bit pattern
//! - single-byte booleans
//! - varint length-prefixed strings and byte slices
//!
//! Each side carries a compression toggle. While it is on, bytes go through the LZ4
//! framing of [`crate::compress`] instead of the raw stream; the toggle is consulted on
//! every call, so a message can compress its bulk data and leave its header plain.
//!
//! ```rust
//! use wirebuf::{codec::{Decoder, Encoder}, pool::BufferPool};
//!
//! let pool = BufferPool::default();
//! let mut encoder = Encoder::new(Vec::new(), &pool);
//! encoder.write_uvarint(300).unwrap();
//! encoder.write_string("hi").unwrap();
//! encoder.write_u32(7).unwrap();
//! let wire = encoder.finish().unwrap();
//! assert_eq!(wire, b"\xac\x02\x02hi\x07\0\0\0");
//!
//! let mut decoder = Decoder::from_reader(&wire[..], &pool);
//! assert_eq!(decoder.read_uvarint().unwrap(), 300);
//! assert_eq!(decoder.read_string().unwrap(), "hi");
//! assert_eq!(decoder.read_u32().unwrap(), 7);
//! ```
mod decoder;
mod encoder;

pub use decoder::Decoder;
pub use encoder::Encoder;
