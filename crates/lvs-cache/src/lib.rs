//! Transactional block cache for the Large Value Store.
//!
//! Storage is a set of fixed-size blocks addressed by [`BlockId`]. A
//! [`Transaction`] hands out blocks as [`BlockBuf`] handles locked for shared
//! reading or exclusive writing. An acquisition either completes right away
//! or is deferred: the cache keeps a [`BlockWaiter`] and delivers the buffer
//! through a tokio channel once the block is unlocked and loaded.
//!
//! # Backends
//!
//! - [`MemoryCache`] -- `HashMap`-based cache for tests and embedding, with
//!   optional asynchronous loads and an event log
//!
//! # Rules
//!
//! 1. A deferred acquisition is delivered exactly once. There is no cancel.
//! 2. Buffers return to the cache on drop; dirty data is written back then.
//! 3. A buffer marked deleted frees its block on drop and the id is reused.
//!
//! [`BlockId`]: lvs_types::BlockId

pub mod config;
pub mod error;
pub mod memory;
pub mod traits;
pub mod waiter;

pub use config::CacheConfig;
pub use error::{CacheError, CacheResult};
pub use memory::{CacheEvent, MemoryBuf, MemoryCache, MemoryTransaction};
pub use traits::{Acquisition, BlockBuf, LoadMode, Transaction};
pub use waiter::{delivery_channel, BlockWaiter, Delivery, DeliveryReceiver, DeliverySender};
