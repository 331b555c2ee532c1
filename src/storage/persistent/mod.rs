//! Directory-backed storage.
//!
//! One file per key, each framed with a CRC32 checksum and replaced through a
//! temp-file rename so readers never see a half-written entry. Concurrent
//! writers (threads or processes) race per key and the last rename wins.

mod codec;
mod dir_store;

pub use dir_store::DirectoryStore;
