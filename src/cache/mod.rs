//! Bounded response cache.
//!
//! Stores byte bodies keyed by request signature, expires them after a TTL
//! and evicts when either bound is reached.
//!
//! ## Configuration
//!
//! Cache behavior is controlled via `tollgate.toml`:
//!
//! ```toml
//! [cache]
//! max_entries = 1000
//! max_size_bytes = 52428800
//! eviction_policy = "scored"
//! # ... see config.rs for all options
//! ```

mod config;
mod keys;
mod store;

pub use config::{CacheConfig, EvictionPolicy, TtlClass};
pub use keys::{CacheKey, canonical_json, normalize_path};
pub(crate) use store::log_store_failure;
pub use store::{CacheError, CacheHit, CacheStats, CachedResponse, ResponseCache};
