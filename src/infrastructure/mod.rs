//! Adapters: in-memory implementations of the engine's ports (the default
//! backend, also used by tests) and an optional RocksDB-backed session store.

pub mod in_memory;
#[cfg(feature = "storage-rocksdb")]
pub mod rocksdb;
