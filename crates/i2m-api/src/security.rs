//! Input validation for ids and uploaded images.

use image::ImageFormat;

use i2m_models::{is_valid_id, JobId, SessionId};

use crate::error::{ApiError, ApiResult};

/// Content types accepted for upload.
pub const ACCEPTED_CONTENT_TYPES: &[&str] = &["image/jpeg", "image/png", "image/webp"];

/// Parse a job id taken from the path.
pub fn parse_job_id(raw: &str) -> ApiResult<JobId> {
    if !is_valid_id(raw) {
        return Err(ApiError::bad_request("Invalid job ID format"));
    }
    Ok(JobId::from_string(raw))
}

/// Parse a session id taken from the `X-Session-ID` header.
pub fn parse_session_id(raw: &str) -> ApiResult<SessionId> {
    let raw = raw.trim();
    if !is_valid_id(raw) {
        return Err(ApiError::bad_request("Invalid session ID format"));
    }
    Ok(SessionId::from_string(raw))
}

/// Validate a model filename from the download path.
///
/// Only a single path component made of `[A-Za-z0-9._-]` without a leading
/// dot is accepted.
pub fn is_valid_model_filename(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 128
        && !name.starts_with('.')
        && !name.contains("..")
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
}

/// Image accepted by [`validate_image`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DetectedImage {
    pub content_type: &'static str,
    pub extension: &'static str,
}

/// Check an uploaded file's size, declared type and magic bytes.
///
/// The content type stored with the job is the one detected from the bytes.
/// A declared image type that disagrees with the bytes is rejected.
pub fn validate_image(
    bytes: &[u8],
    declared_content_type: Option<&str>,
    max_bytes: usize,
) -> ApiResult<DetectedImage> {
    if bytes.is_empty() {
        return Err(ApiError::bad_request("Uploaded file is empty"));
    }
    if bytes.len() > max_bytes {
        return Err(ApiError::payload_too_large(format!(
            "File exceeds the {} limit",
            i2m_models::format_bytes(max_bytes as u64)
        )));
    }

    let detected = match image::guess_format(bytes) {
        Ok(ImageFormat::Jpeg) => DetectedImage {
            content_type: "image/jpeg",
            extension: "jpg",
        },
        Ok(ImageFormat::Png) => DetectedImage {
            content_type: "image/png",
            extension: "png",
        },
        Ok(ImageFormat::WebP) => DetectedImage {
            content_type: "image/webp",
            extension: "webp",
        },
        _ => {
            return Err(ApiError::unsupported_media_type(
                "Only JPEG, PNG and WebP images are supported",
            ))
        }
    };

    if let Some(declared) = declared_content_type {
        let declared = declared.split(';').next().unwrap_or(declared).trim();
        let declared = if declared == "image/jpg" {
            "image/jpeg"
        } else {
            declared
        };
        if declared.starts_with("image/") && declared != detected.content_type {
            return Err(ApiError::unsupported_media_type(format!(
                "Declared type {} does not match file content ({})",
                declared, detected.content_type
            )));
        }
        if !declared.starts_with("image/") && declared != "application/octet-stream" {
            return Err(ApiError::unsupported_media_type(format!(
                "Unsupported content type: {}",
                declared
            )));
        }
    }

    Ok(detected)
}

#[cfg(test)]
mod tests {
    use super::*;

    const PNG: &[u8] = &[0x89, b'P', b'N', b'G', 0x0d, 0x0a, 0x1a, 0x0a, 0, 0, 0, 0];
    const JPEG: &[u8] = &[0xff, 0xd8, 0xff, 0xe0, 0, 0x10, b'J', b'F', b'I', b'F'];
    const WEBP: &[u8] = b"RIFF\x24\x00\x00\x00WEBPVP8 ";

    #[test]
    fn test_parse_job_id() {
        assert!(parse_job_id("550e8400-e29b-41d4-a716-446655440000").is_ok());
        assert!(parse_job_id("short").is_err());
        assert!(parse_job_id("../../etc/passwd").is_err());
        assert!(parse_job_id("job:12345678").is_err());
    }

    #[test]
    fn test_parse_session_id_trims() {
        let id = parse_session_id(" abcdef12-3456 ").unwrap();
        assert_eq!(id.as_str(), "abcdef12-3456");
    }

    #[test]
    fn test_model_filename() {
        assert!(is_valid_model_filename("cat_model.glb"));
        assert!(!is_valid_model_filename("../secret.glb"));
        assert!(!is_valid_model_filename(".hidden"));
        assert!(!is_valid_model_filename("a/b.glb"));
        assert!(!is_valid_model_filename(""));
    }

    #[test]
    fn test_detects_supported_formats() {
        assert_eq!(validate_image(PNG, Some("image/png"), 1024).unwrap().extension, "png");
        assert_eq!(validate_image(JPEG, Some("image/jpg"), 1024).unwrap().content_type, "image/jpeg");
        assert_eq!(validate_image(WEBP, None, 1024).unwrap().content_type, "image/webp");
        assert!(validate_image(PNG, Some("application/octet-stream"), 1024).is_ok());
    }

    #[test]
    fn test_rejects_mismatched_magic_bytes() {
        let err = validate_image(PNG, Some("image/jpeg"), 1024).unwrap_err();
        assert_eq!(err.code(), "UNSUPPORTED_MEDIA_TYPE");

        let err = validate_image(b"GIF89a......", Some("image/gif"), 1024).unwrap_err();
        assert_eq!(err.code(), "UNSUPPORTED_MEDIA_TYPE");

        let err = validate_image(PNG, Some("text/plain"), 1024).unwrap_err();
        assert_eq!(err.code(), "UNSUPPORTED_MEDIA_TYPE");
    }

    #[test]
    fn test_rejects_empty_and_oversized() {
        assert_eq!(validate_image(&[], None, 1024).unwrap_err().code(), "BAD_REQUEST");
        assert_eq!(validate_image(PNG, None, 4).unwrap_err().code(), "PAYLOAD_TOO_LARGE");
    }
}
