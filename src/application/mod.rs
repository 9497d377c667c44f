//! Application services: quota admission, response caching facade, persistence seams.

pub mod admission;
pub mod error;
pub mod quota;
pub mod repos;
