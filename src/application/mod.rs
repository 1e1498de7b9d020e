//! Application services and the event handlers each service registers.

pub mod error;
pub mod media;
pub mod posts;
pub mod repos;
pub mod search;
