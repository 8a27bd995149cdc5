//! # Face Payload Validation
//!
//! Sanitizes and bounds-checks a face image before it is sent to any terminal.
//!
//! ## Pipeline
//!
//! 1. Person id must match `^[\w\-:.@]{1,64}$`
//! 2. Base64 is cleaned: `data:...;base64,` prefix and all whitespace removed,
//!    then re-padded with `=` to a multiple of 4. Charset and decoded size are checked
//! 3. Name is trimmed; required, and cut to 32 characters when longer
//! 4. Decoded bytes must start with the JPEG start-of-image marker `FF D8`
//! 5. Image dimensions are probed; width and height must both be ≤ 2000 px
//!
//! Every check runs and appends to `issues`; a later check is only skipped when
//! it cannot be evaluated without an earlier one (no bytes to inspect). The
//! probe in step 5 never panics: a corrupt image is reported as an issue.
//!
//! A payload with any issue must not be sent. [`NormalizedFace`] is therefore
//! only produced when `issues` is empty.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use std::io::Cursor;

use crate::common::models::{is_valid_person_id, MAX_NAME_CHARS};

/// Largest decoded image accepted, in bytes.
pub const MAX_IMAGE_BYTES: usize = 350_000;

/// Largest normalized base64 payload accepted, in characters.
pub const MAX_BASE64_CHARS: usize = 200_000;

/// Largest width or height accepted, in pixels.
pub const MAX_DIMENSION: u32 = 2000;

/// JPEG start-of-image marker.
pub const JPEG_SOI: [u8; 2] = [0xFF, 0xD8];

/// Cleaned base64 with its decoded size, computed from the padding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanBase64 {
    pub b64: String,
    pub bytes: usize,
}

/// A validated face image, ready to be sent to a terminal.
///
/// `base64` always decodes to `bytes`, which start with [`JPEG_SOI`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedFace {
    pub bytes: Vec<u8>,
    pub base64: String,
    pub width: u32,
    pub height: u32,
}

/// Outcome of [`validate_face`].
#[derive(Debug, Clone, Default)]
pub struct FaceValidation {
    /// Every problem found; empty means the face may be sent
    pub issues: Vec<String>,
    /// Present only when `issues` is empty
    pub normalized: Option<NormalizedFace>,
    /// Trimmed name, cut to 32 characters; usable even when too long
    pub name: Option<String>,
}

impl FaceValidation {
    pub fn is_valid(&self) -> bool {
        self.issues.is_empty() && self.normalized.is_some()
    }
}

/// Strips a data-URI prefix and whitespace, re-pads, and checks charset and size.
///
/// # Returns
/// - `Ok(CleanBase64)`: cleaned string and its decoded byte count
/// - `Err(String)`: the issue text to report
pub fn normalize_base64_jpeg(input: &str) -> Result<CleanBase64, String> {
    let without_prefix = strip_data_uri(input.trim());
    let mut cleaned: String = without_prefix
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect();

    let pad = cleaned.len() % 4;
    if pad != 0 {
        cleaned.extend(std::iter::repeat('=').take(4 - pad));
    }

    if cleaned.is_empty()
        || !cleaned
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'+' | b'/' | b'='))
    {
        return Err("face_image_b64 contains invalid base64 characters".to_string());
    }

    let pad_chars = if cleaned.ends_with("==") {
        2
    } else if cleaned.ends_with('=') {
        1
    } else {
        0
    };
    let bytes = (cleaned.len() * 3 / 4).saturating_sub(pad_chars);
    if bytes > MAX_IMAGE_BYTES {
        return Err(format!("face_image_b64 too large: {} bytes", bytes));
    }

    Ok(CleanBase64 { b64: cleaned, bytes })
}

/// Removes a leading `data:<mime>;base64,` prefix, if any.
fn strip_data_uri(input: &str) -> &str {
    if input.starts_with("data:") {
        if let Some(idx) = input.find(";base64,") {
            return &input[idx + ";base64,".len()..];
        }
    }
    input
}

/// Probes JPEG dimensions without decoding pixel data.
pub fn probe_jpeg_dimensions(bytes: &[u8]) -> Result<(u32, u32), String> {
    image::io::Reader::with_format(Cursor::new(bytes), image::ImageFormat::Jpeg)
        .into_dimensions()
        .map_err(|e| format!("image decode failed: {}", e))
}

/// Runs the complete validation pipeline for one face.
///
/// # Arguments
/// - `person_id`: identifier the face will be enrolled under
/// - `name`: display name, may be absent
/// - `image_b64`: raw base64, optionally with a data-URI prefix
///
/// # Example
/// ```ignore
/// let result = validate_face("emp-1", Some("Alice"), &b64);
/// if let Some(face) = result.normalized {
///     adapter.upsert_face(&device, "emp-1", &face, result.name.as_deref()).await?;
/// }
/// ```
pub fn validate_face(person_id: &str, name: Option<&str>, image_b64: &str) -> FaceValidation {
    let mut issues = Vec::new();

    // Step 1: identifier
    if !is_valid_person_id(person_id) {
        issues.push("personId invalid (expect ASCII word chars, <=64)".to_string());
    }

    // Step 2: base64 sanitation
    let cleaned = match normalize_base64_jpeg(image_b64) {
        Ok(cleaned) => Some(cleaned),
        Err(issue) => {
            issues.push(issue);
            None
        }
    };
    if let Some(cleaned) = &cleaned {
        if cleaned.b64.len() > MAX_BASE64_CHARS {
            issues.push(format!(
                "face_image_b64 too large: {} base64 chars (max {})",
                cleaned.b64.len(),
                MAX_BASE64_CHARS
            ));
        }
    }

    // Step 3: name
    let trimmed = name.map(str::trim).filter(|n| !n.is_empty());
    let safe_name = match trimmed {
        None => {
            issues.push("name required".to_string());
            None
        }
        Some(n) if n.chars().count() > MAX_NAME_CHARS => {
            issues.push(format!("name too long (>{})", MAX_NAME_CHARS));
            Some(n.chars().take(MAX_NAME_CHARS).collect::<String>())
        }
        Some(n) => Some(n.to_string()),
    };

    // Steps 4 and 5 need decoded bytes
    let mut decoded = None;
    if let Some(cleaned) = cleaned {
        match STANDARD.decode(cleaned.b64.as_bytes()) {
            Ok(bytes) if bytes.len() < 2 || bytes[..2] != JPEG_SOI => {
                issues.push("photo not JPEG".to_string());
            }
            Ok(bytes) => match probe_jpeg_dimensions(&bytes) {
                Ok((width, height)) if width > MAX_DIMENSION || height > MAX_DIMENSION => {
                    issues.push(format!(
                        "dimensions exceed limit ({}x{}, max {}x{})",
                        width, height, MAX_DIMENSION, MAX_DIMENSION
                    ));
                }
                Ok((width, height)) => {
                    decoded = Some(NormalizedFace {
                        bytes,
                        base64: cleaned.b64,
                        width,
                        height,
                    });
                }
                Err(issue) => issues.push(issue),
            },
            Err(e) => issues.push(format!("face_image_b64 is not decodable base64: {}", e)),
        }
    }

    let normalized = if issues.is_empty() { decoded } else { None };
    FaceValidation {
        issues,
        normalized,
        name: safe_name,
    }
}

/// Encodes raw image bytes for [`validate_face`].
pub fn encode_image(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn jpeg_bytes(width: u32, height: u32) -> Vec<u8> {
        let img = image::RgbImage::from_pixel(width, height, image::Rgb([90, 120, 150]));
        let mut out = Vec::new();
        image::DynamicImage::ImageRgb8(img)
            .write_to(&mut Cursor::new(&mut out), image::ImageFormat::Jpeg)
            .unwrap();
        out
    }

    pub(crate) fn jpeg_base64(width: u32, height: u32) -> String {
        STANDARD.encode(jpeg_bytes(width, height))
    }

    #[test]
    fn test_valid_face_passes() {
        let b64 = jpeg_base64(64, 48);
        let result = validate_face("emp-1", Some("  Alice  "), &b64);

        assert!(result.issues.is_empty(), "{:?}", result.issues);
        let face = result.normalized.unwrap();
        assert_eq!((face.width, face.height), (64, 48));
        assert_eq!(face.base64, b64);
        assert_eq!(&face.bytes[..2], &JPEG_SOI);
        assert_eq!(result.name.as_deref(), Some("Alice"));
    }

    #[test]
    fn test_normalization_round_trips() {
        let bytes = jpeg_bytes(32, 32);
        let b64 = STANDARD.encode(&bytes);
        let wrapped: String = b64
            .as_bytes()
            .chunks(60)
            .map(|c| std::str::from_utf8(c).unwrap())
            .collect::<Vec<_>>()
            .join("\r\n");
        let input = format!("data:image/jpeg;base64,{}", wrapped);

        let face = validate_face("p1", Some("P"), &input).normalized.unwrap();
        assert_eq!(face.bytes, bytes);
        assert_eq!(STANDARD.encode(&face.bytes), face.base64);
        assert_eq!(face.base64, b64);
    }

    #[test]
    fn test_missing_padding_is_restored() {
        let b64 = jpeg_base64(16, 16);
        let unpadded = b64.trim_end_matches('=');
        let cleaned = normalize_base64_jpeg(unpadded).unwrap();
        assert_eq!(cleaned.b64, b64);
    }

    #[test]
    fn test_invalid_characters_rejected() {
        for bad in ["abc$def", "/9j/4AAQ*", "ÿØÿà", "-_-_"] {
            let result = validate_face("p1", Some("P"), bad);
            assert!(
                result
                    .issues
                    .iter()
                    .any(|i| i.contains("contains invalid base64 characters")),
                "{bad}: {:?}",
                result.issues
            );
            assert!(result.normalized.is_none());
        }
    }

    #[test]
    fn test_decoded_size_limit() {
        let big = "A".repeat(480_000);
        let err = normalize_base64_jpeg(&big).unwrap_err();
        assert!(err.contains("too large"));
    }

    #[test]
    fn test_base64_char_limit() {
        // 240k chars decode to 180k bytes: under the byte cap, over the char cap
        let mut payload = STANDARD.encode(JPEG_SOI);
        payload.truncate(2);
        payload.push_str(&"A".repeat(240_000 - 2));
        let result = validate_face("p1", Some("P"), &payload);
        assert!(result.issues.iter().any(|i| i.contains("base64 chars")));
        assert!(result.normalized.is_none());
    }

    #[test]
    fn test_name_rules() {
        let b64 = jpeg_base64(8, 8);

        let result = validate_face("p1", None, &b64);
        assert_eq!(result.issues, vec!["name required".to_string()]);
        assert!(result.normalized.is_none());

        let result = validate_face("p1", Some("   "), &b64);
        assert_eq!(result.issues, vec!["name required".to_string()]);

        let long = "x".repeat(40);
        let result = validate_face("p1", Some(&long), &b64);
        assert_eq!(result.issues.len(), 1);
        assert!(result.issues[0].contains("too long"));
        assert_eq!(result.name.unwrap().len(), MAX_NAME_CHARS);
        assert!(result.normalized.is_none());
    }

    #[test]
    fn test_person_id_rule() {
        let result = validate_face("not valid!", Some("P"), &jpeg_base64(8, 8));
        assert_eq!(result.issues.len(), 1);
        assert!(result.issues[0].starts_with("personId invalid"));
    }

    #[test]
    fn test_non_jpeg_rejected() {
        let png = STANDARD.encode(b"\x89PNG\r\n\x1a\n0000");
        let result = validate_face("p1", Some("P"), &png);
        assert_eq!(result.issues, vec!["photo not JPEG".to_string()]);
    }

    #[test]
    fn test_corrupt_jpeg_is_an_issue_not_a_panic() {
        let corrupt = STANDARD.encode([0xFF, 0xD8, 0xFF, 0x00, 0x13, 0x37]);
        let result = validate_face("p1", Some("P"), &corrupt);
        assert_eq!(result.issues.len(), 1);
        assert!(result.issues[0].starts_with("image decode failed"));
    }

    #[test]
    fn test_dimension_limit() {
        let result = validate_face("p1", Some("P"), &jpeg_base64(2001, 8));
        assert_eq!(result.issues.len(), 1);
        assert!(result.issues[0].starts_with("dimensions exceed limit"));

        let result = validate_face("p1", Some("P"), &jpeg_base64(2000, 8));
        assert!(result.is_valid());
    }

    #[test]
    fn test_all_checks_run() {
        let result = validate_face("bad id", None, "###");
        assert_eq!(result.issues.len(), 3, "{:?}", result.issues);
    }
}
