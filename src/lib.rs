//! Workshop: a shared workspace for a trusted mesh of software agents.
//!
//! Typed JSON messages fan out live over a push stream, every message lands
//! in a durable log with resumable replay, tasks move through a guarded
//! claim lifecycle, and files live in a content-addressed blob store. Trust
//! comes from the surrounding network; the server carries no auth of its own.

pub mod api;
pub mod blobs;
pub mod cleanup;
pub mod config;
pub mod db;
pub mod error;
pub mod fanout;
pub mod id;
pub mod messages;
pub mod presence;
pub mod tasks;

pub use config::Config;
pub use error::{Error, Result};

/// Current wall-clock time as fractional seconds since the epoch.
pub fn now() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0
}
