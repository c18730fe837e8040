//! Batch file reading on top of the cache and the parser loader

mod batch;
pub mod dispatch;
mod storage;
mod types;

pub use batch::{FileReader, ReaderConfig};
pub use dispatch::{CachedParse, DispatchError};
pub use storage::{ByteStream, FileStat, FileStorage, LocalFileStorage, StorageError};
pub use types::{BatchError, BatchRequest, BatchResult, ErrorKind, FileError, FileOutcome, FileStatus};
