//! Reader Cache Library
//!
//! Reference-counted resource cache with hierarchical ownership and bounded
//! retention of unreferenced entries.

pub mod config;
pub mod error;
pub mod queue;
pub mod resource;

pub use config::{CacheConfig, ConfigError, RetentionConfig};
pub use error::{CacheError, CacheResult};
pub use queue::KeyQueue;
pub use resource::{Acquisition, CacheStats, Creation, ResourceCache, RevokeFn};
