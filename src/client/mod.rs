//! # Client Components
//!
//! Everything that talks to terminals, bottom-up:
//!
//! ## Transfer ([`transfer`])
//! Buffered HTTP exchanges with per-attempt deadlines, retry and backoff.
//!
//! ## Digest ([`digest`])
//! RFC 2617 challenge/response on top of the transfer client.
//!
//! ## Device Adapter ([`device`])
//! Terminal CGI operations: user batches, face add/update, ping.
//!
//! ## Scheduler ([`scheduler`])
//! Fan-out of a user list across the device fleet with bounded concurrency.
//!
//! ## Reports ([`metrics`])
//! Per-(device, user) outcomes and their aggregation.

pub mod device;
pub mod digest;
pub mod metrics;
pub mod scheduler;
pub mod transfer;

// Re-export for convenience
pub use device::{DeviceAdapter, DeviceReply, FaceUpsert};
pub use digest::{DigestChallenge, DigestClient};
pub use metrics::{DeviceReport, SyncOutcome, SyncPhase, SyncReport};
pub use scheduler::{FaceLimiter, SyncScheduler};
pub use transfer::{HttpRequest, HttpResponse, RetryPolicy, TransferClient};
