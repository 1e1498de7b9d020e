//! Ripple: event propagation and cache consistency shared by the posts, search
//! and media services.

pub mod application;
pub mod broker;
pub mod cache;
pub mod config;
pub mod domain;
pub mod infra;
pub(crate) mod util;
