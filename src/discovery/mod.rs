//! # Device Discovery
//!
//! Where the list of terminals for a sync run comes from.

pub mod registry;

pub use registry::{DeviceDirectory, DeviceRegistry};
