//! TestForge Common Library
//!
//! Shared types, errors, and persistence for the TestForge platform.

pub mod db;
pub mod error;
pub mod types;

pub use db::Database;
pub use error::{Error, Result};
pub use types::*;

/// TestForge version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default store path
pub fn default_store_path() -> std::path::PathBuf {
    std::env::var_os("HOME")
        .map(std::path::PathBuf::from)
        .unwrap_or_else(|| std::path::PathBuf::from("."))
        .join(".testforge")
}

/// Default database path
pub fn default_db_path() -> std::path::PathBuf {
    default_store_path().join("state.db")
}

/// Hex-encoded SHA-256, used for password and API key storage.
pub fn sha256_hex(input: &str) -> String {
    use sha2::{Digest, Sha256};
    hex::encode(Sha256::digest(input.as_bytes()))
}
