//! # Face Image Processing
//!
//! Validation and normalization of face payloads before they reach a terminal.

pub mod face;

// Re-export main functions for convenience
pub use face::{validate_face, FaceValidation, NormalizedFace};
