//! Proof artifact validation (media type and size ceiling).

use super::error::MarketError;
use super::types::ProofArtifact;

/// Largest accepted proof file (2 MB).
pub const MAX_PROOF_BYTES: u64 = 2 * 1024 * 1024;

pub const ALLOWED_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "webp"];

const ALLOWED_CONTENT_TYPES: &[&str] = &["image/jpeg", "image/jpg", "image/png", "image/webp"];

/// Rejection for a file above [`MAX_PROOF_BYTES`].
pub fn oversized() -> MarketError {
    MarketError::InvalidArtifact(format!("file exceeds {} KB", MAX_PROOF_BYTES / 1024))
}

/// Lowercased extension of a file name, if any.
pub fn extension_of(file_name: &str) -> Option<String> {
    let (stem, ext) = file_name.rsplit_once('.')?;
    if stem.is_empty() || ext.is_empty() {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}

/// Check the declared metadata of an uploaded proof.
///
/// The extension must be one of [`ALLOWED_EXTENSIONS`]. A declared content type,
/// when present, must be an image type from the same set.
pub fn validate(file_name: &str, content_type: Option<&str>, size_bytes: u64) -> Result<String, MarketError> {
    if size_bytes == 0 {
        return Err(MarketError::InvalidArtifact("file is empty".to_string()));
    }
    if size_bytes > MAX_PROOF_BYTES {
        return Err(oversized());
    }

    let ext = extension_of(file_name)
        .filter(|ext| ALLOWED_EXTENSIONS.contains(&ext.as_str()))
        .ok_or_else(|| {
            MarketError::InvalidArtifact(format!(
                "file type must be one of {}",
                ALLOWED_EXTENSIONS.join(", ")
            ))
        })?;

    if let Some(ct) = content_type {
        let ct = ct.split(';').next().unwrap_or("").trim().to_ascii_lowercase();
        if !ct.is_empty() && ct != "application/octet-stream" && !ALLOWED_CONTENT_TYPES.contains(&ct.as_str()) {
            return Err(MarketError::InvalidArtifact(format!(
                "content type {} is not an accepted image type",
                ct
            )));
        }
    }

    Ok(ext)
}

/// Re-validate an artifact that already went through storage.
pub fn validate_artifact(artifact: &ProofArtifact) -> Result<(), MarketError> {
    if artifact.reference.trim().is_empty() {
        return Err(MarketError::InvalidArtifact("missing file reference".to_string()));
    }
    validate(
        &artifact.file_name,
        artifact.content_type.as_deref(),
        artifact.size_bytes,
    )
    .map(|_| ())
}
