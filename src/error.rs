//! Error types shared by the codec layers.
//!
//! Byte-stream operations (`Read`/`Write` implementations, the pipelines) report
//! [`std::io::Error`] so they compose with the standard library adapters. The codec
//! wraps those into [`Error`], pulling typed [`FrameError`]s back out of the I/O error
//! they travelled in.
use std::{io, string::FromUtf8Error};

use thiserror::Error;

use crate::compress::FrameError;

/// Errors surfaced by [`Encoder`](crate::codec::Encoder) and
/// [`Decoder`](crate::codec::Decoder) primitives.
#[derive(Debug, Error)]
pub enum Error {
    #[error("transport error: {0}")]
    Io(io::Error),

    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("invalid string: {0}")]
    InvalidString(#[from] FromUtf8Error),

    #[error("declared length {0} does not fit in memory")]
    LengthOverflow(u64),
}

impl Error {
    /// True when the underlying stream ended before the value was complete.
    pub fn is_eof(&self) -> bool {
        matches!(self, Error::Io(e) if e.kind() == io::ErrorKind::UnexpectedEof)
    }
}

impl From<io::Error> for Error {
    fn from(value: io::Error) -> Self {
        if value.kind() != io::ErrorKind::InvalidData
            || !value
                .get_ref()
                .is_some_and(|inner| inner.is::<FrameError>())
        {
            return Error::Io(value);
        }

        match value.into_inner().map(|inner| inner.downcast::<FrameError>()) {
            Some(Ok(frame)) => Error::Frame(*frame),
            Some(Err(inner)) => Error::Io(io::Error::new(io::ErrorKind::InvalidData, inner)),
            None => Error::Io(io::Error::from(io::ErrorKind::InvalidData)),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_error_is_recovered_from_io() {
        let io_err: io::Error = FrameError::UnsupportedMethod(0x90).into();
        let err: Error = io_err.into();

        assert!(matches!(err, Error::Frame(FrameError::UnsupportedMethod(0x90))));
    }

    #[test]
    fn plain_io_error_is_kept() {
        let err: Error = io::Error::from(io::ErrorKind::UnexpectedEof).into();

        assert!(err.is_eof());
    }

    #[test]
    fn invalid_data_without_frame_is_io() {
        let err: Error = io::Error::new(io::ErrorKind::InvalidData, "bad varint").into();

        assert!(matches!(err, Error::Io(ref e) if e.kind() == io::ErrorKind::InvalidData));
    }
}
