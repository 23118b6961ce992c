//! Upload validation: file-type allow-list, size ceiling, parameters.
//!
//! All checks run before any job state exists, so a rejected upload leaves
//! nothing behind.

use validator::Validate;

use crate::error::CoreError;
use crate::job::JobParams;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Default media extensions accepted for transcription.
pub const DEFAULT_ALLOWED_EXTENSIONS: &[&str] = &[
    "mp3", "wav", "m4a", "flac", "ogg", "opus", "webm", "mp4", "aac",
];

/// Default upload ceiling (500 MiB).
pub const DEFAULT_MAX_UPLOAD_BYTES: u64 = 500 * 1024 * 1024;

/// Longest accepted original file name.
pub const MAX_FILENAME_LENGTH: usize = 255;

// ---------------------------------------------------------------------------
// Policy
// ---------------------------------------------------------------------------

/// Acceptance rules for incoming media artifacts.
#[derive(Debug, Clone)]
pub struct UploadPolicy {
    /// Lower-case extensions without the leading dot.
    pub allowed_extensions: Vec<String>,
    pub max_bytes: u64,
}

impl Default for UploadPolicy {
    fn default() -> Self {
        Self {
            allowed_extensions: DEFAULT_ALLOWED_EXTENSIONS
                .iter()
                .map(|ext| ext.to_string())
                .collect(),
            max_bytes: DEFAULT_MAX_UPLOAD_BYTES,
        }
    }
}

impl UploadPolicy {
    /// Validate a file name and size. Returns the normalised extension.
    pub fn validate_file(&self, filename: &str, size: u64) -> Result<String, CoreError> {
        if filename.trim().is_empty() {
            return Err(CoreError::Validation("File name must not be empty".into()));
        }
        if filename.len() > MAX_FILENAME_LENGTH {
            return Err(CoreError::Validation(format!(
                "File name exceeds maximum length of {MAX_FILENAME_LENGTH} characters"
            )));
        }

        let ext = file_extension(filename).ok_or_else(|| {
            CoreError::Validation(format!("File '{filename}' has no extension"))
        })?;
        if !self.allowed_extensions.iter().any(|allowed| *allowed == ext) {
            return Err(CoreError::Validation(format!(
                "Unsupported file type '.{ext}'. Allowed: {}",
                self.allowed_extensions.join(", ")
            )));
        }

        if size == 0 {
            return Err(CoreError::Validation("Uploaded file is empty".into()));
        }
        if size > self.max_bytes {
            return Err(CoreError::Validation(format!(
                "File size {size} bytes exceeds the maximum of {} bytes",
                self.max_bytes
            )));
        }

        Ok(ext)
    }
}

/// Lower-cased extension of `filename`, ignoring any directory components.
pub fn file_extension(filename: &str) -> Option<String> {
    let base = filename.rsplit(['/', '\\']).next().unwrap_or(filename);
    let (stem, ext) = base.rsplit_once('.')?;
    if stem.is_empty() || ext.is_empty() {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}

/// Validate optional submission parameters.
pub fn validate_params(params: &JobParams) -> Result<(), CoreError> {
    params.validate()?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
