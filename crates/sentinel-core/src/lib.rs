//! Sentinel Core Library
//!
//! Shared types, the correlation store, and database access for the
//! Wallet Sentinel signal engine.

pub mod config;
pub mod db;
pub mod error;
pub mod store;
pub mod types;

pub use error::{Error, Result};
pub use store::{CorrelationStore, GraphLink, MemoryStore};
