pub mod codec;
pub mod compress;
pub mod error;
pub mod io;
pub mod pool;

pub use codec::{Decoder, Encoder};
pub use error::{Error, Result};
pub use io::{PipelineConfig, ZReader, ZWriter, zbuffer};
pub use pool::{BufferPool, PoolConfig};
