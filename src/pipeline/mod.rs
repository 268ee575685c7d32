pub mod pool;
pub mod writer;

pub use pool::{BufferPool, FrameBuffer, PoolStats, ShutdownPolicy};
pub use writer::{FileStore, FramePersister, NamingPolicy};
