//! Small shared helpers.

pub mod clock;
pub(crate) mod lock;
