//! # Common Components
//!
//! Shared data structures used by every layer of the sync engine.
//!
//! ## Modules
//!
//! - [`models`]: user and device records plus the vendor CGI payloads
//! - [`error`]: the [`SyncError`](error::SyncError) taxonomy
//! - [`config`]: TOML configuration parsing

pub mod config;
pub mod error;
pub mod models;
