//! Frontier store implementations.
//!
//! Available backends:
//! - `MemoryFrontierStore` - in-process, for tests and single-node development
//! - `RedisFrontierStore` - shared Redis instance used by every worker

pub mod memory;
pub mod redis;

pub use self::memory::MemoryFrontierStore;
pub use self::redis::RedisFrontierStore;
