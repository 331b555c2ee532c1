//! Key/value storage backing the module cache.
//!
//! The cache treats its store as advisory. Backends report failures through
//! `StorageError`, and the cache decides whether to demote itself or count a
//! miss.

mod memory;
#[cfg(feature = "persistent")]
pub mod persistent;
mod traits;

pub use memory::InMemoryKvStore;
pub use traits::{KeyValueStore, StorageError};
