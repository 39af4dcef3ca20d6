//! # Memcached Connection Pool
//!
//! Purpose: Share a growable set of memcached connections between async
//! callers and expose text, JSON and list operations on top of them.
//!
//! ## Design Principles
//! 1. **Object Pool Pattern**: Reuse connections; grow on demand instead of waiting.
//! 2. **Scoped Acquisition**: A held slot is always released, even on failure.
//! 3. **Strategy Pattern**: The pool is generic over the `CacheClient` seam.
//! 4. **Protocol Clarity**: Encode/parse the memcached text protocol explicitly.

mod client;
mod config;
mod error;
mod pool;
mod protocol;

pub use client::{CacheClient, GetOptions, MemcachedClient};
pub use config::{ClientConfig, PoolConfig, Target, DEFAULT_HOST, DEFAULT_POOL_SIZE, DEFAULT_PORT};
pub use error::{ClientError, ClientResult, PoolError, PoolResult};
pub use pool::{MemcachedPool, PooledClient, SlotStatus};
