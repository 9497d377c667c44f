//! Resource governance for expensive, rate-sensitive operations.
//!
//! [`application::quota`] enforces token-bucket quotas per subject and per
//! action, [`cache`] keeps a bounded TTL cache of responses, and
//! [`application::admission`] composes the two so a cache hit is never
//! charged.

pub mod application;
pub mod cache;
pub mod config;
pub mod domain;
pub mod infra;
pub mod util;
