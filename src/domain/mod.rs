//! Domain types for quota governance.

pub mod error;
pub mod quota;
