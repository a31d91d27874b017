//! Common utilities and types shared across the vaultsync crates.
//!
//! This crate provides the foundational pieces every other crate builds on:
//! the error type, vault-relative paths, device identifiers, content hashing
//! and the ignore/document filter used by both change detectors.

pub mod error;
pub mod filter;
pub mod hash;
pub mod types;

pub use error::{Error, Result};
pub use filter::PathFilter;
pub use hash::{content_hash, hash_file};
pub use types::{DeviceId, VaultPath};
