//! Environment-driven configuration.
//!
//! Every knob has a default so the server starts with no environment at all.
//! Unparseable values fall back to the default with a warning rather than
//! refusing to start.

use std::path::PathBuf;
use std::str::FromStr;

#[derive(Debug, Clone)]
pub struct Config {
    /// Listening port (`WORKSHOP_PORT`).
    pub port: u16,
    /// SQLite file path (`WORKSHOP_DB`).
    pub db_path: PathBuf,
    /// Blob directory (`WORKSHOP_BLOBS`).
    pub blob_dir: PathBuf,
    /// Message retention window in days (`WORKSHOP_RETENTION_DAYS`).
    pub retention_days: f64,
    /// Maximum accepted blob size in bytes (`WORKSHOP_MAX_UPLOAD`).
    pub max_upload_bytes: usize,
    /// Per-request log lines (`WORKSHOP_VERBOSE`).
    pub verbose: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 4242,
            db_path: PathBuf::from("workshop.db"),
            blob_dir: PathBuf::from("blobs"),
            retention_days: 30.0,
            max_upload_bytes: 32 * 1024 * 1024,
            verbose: false,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            port: env_parse("WORKSHOP_PORT", defaults.port),
            db_path: env_path("WORKSHOP_DB", defaults.db_path),
            blob_dir: env_path("WORKSHOP_BLOBS", defaults.blob_dir),
            retention_days: env_parse("WORKSHOP_RETENTION_DAYS", defaults.retention_days),
            max_upload_bytes: env_parse("WORKSHOP_MAX_UPLOAD", defaults.max_upload_bytes),
            verbose: env_flag("WORKSHOP_VERBOSE"),
        }
    }
}

fn env_parse<T: FromStr + Copy>(name: &str, default: T) -> T {
    match std::env::var(name) {
        Ok(raw) => match raw.trim().parse() {
            Ok(value) => value,
            Err(_) => {
                tracing::warn!(name, value = %raw, "unparseable setting, using default");
                default
            }
        },
        Err(_) => default,
    }
}

fn env_path(name: &str, default: PathBuf) -> PathBuf {
    match std::env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => PathBuf::from(raw),
        _ => default,
    }
}

fn env_flag(name: &str) -> bool {
    matches!(
        std::env::var(name).as_deref(),
        Ok("1") | Ok("true") | Ok("yes") | Ok("on")
    )
}
