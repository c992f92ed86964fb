//! # Infrastructure Adapters
//!
//! Implementations of the queue store and point store interfaces.

pub mod filesystem_queue_store;
pub mod memory_point_store;
pub mod memory_queue_store;

#[cfg(feature = "postgres")]
pub mod postgres_point_store;

pub use filesystem_queue_store::FilesystemQueueStore;
pub use memory_point_store::MemoryPointStore;
pub use memory_queue_store::MemoryQueueStore;

#[cfg(feature = "postgres")]
pub use postgres_point_store::PostgresPointStore;
