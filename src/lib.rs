//! regiocache library
//!
//! Freshness-aware caching of daily regional case data. The binary and the
//! integration tests build on the modules exposed here.

pub mod activity;
pub mod cache;
pub mod cli;
pub mod clock;
pub mod config;
pub mod coordinator;
pub mod data;
pub mod error;
pub mod refresh;

pub use coordinator::{CacheStatus, QueryOutcome, RefreshCoordinator};
pub use error::QueryError;
