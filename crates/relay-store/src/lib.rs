pub mod backend;
pub mod cluster;
pub mod error;
pub mod factory;
pub mod keyspace;
pub mod kv;
pub mod lock;
pub mod memory;
pub mod monitoring;
mod sweeper;
pub mod typing;

pub use backend::{CacheBackend, KeyTtl, MemoryCache, RedisCache, SqliteCache};
pub use cluster::ClusterStore;
pub use error::StoreError;
pub use factory::{open_stores, BackendConfig, StoreOptions, Stores};
pub use keyspace::Keyspace;
pub use kv::KvStore;
pub use lock::{DistributedLock, LockConfig, LockGuard};
pub use memory::MemoryStore;
pub use monitoring::{MonitoringConfig, MonitoringStore};
pub use typing::{TypingConfig, TypingStore};
