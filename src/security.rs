use regex::Regex;
use std::path::{Path, PathBuf};

use crate::errors::{AppError, AppResult};

pub struct InputValidator;

impl InputValidator {
    /// Validate a client-supplied map file name before it is used to derive
    /// any filesystem path on the relay.
    pub fn validate_file_name(name: &str) -> AppResult<()> {
        let trimmed = name.trim();

        if trimmed.is_empty() {
            return Err(AppError::validation("fileName", "File name cannot be empty"));
        }

        if trimmed.len() > 255 {
            return Err(AppError::validation(
                "fileName",
                "File name too long (max 255 characters)",
            ));
        }

        // Check for path traversal attempts
        if trimmed.contains("..") || trimmed.contains('/') || trimmed.contains('\\') {
            return Err(AppError::validation("fileName", "Invalid file name detected"));
        }

        Ok(())
    }

    pub fn sanitize_file_name(name: &str) -> String {
        // Remove or replace unsafe characters in filenames
        let unsafe_chars = Regex::new(r#"[<>:"/\\|?*\x00-\x1f]"#).unwrap();
        let sanitized = unsafe_chars.replace_all(name.trim(), "_");

        // Limit length, cutting only on a char boundary
        if sanitized.len() > 255 {
            let mut cut = 252;
            while !sanitized.is_char_boundary(cut) {
                cut -= 1;
            }
            format!("{}...", &sanitized[..cut])
        } else {
            sanitized.to_string()
        }
    }

    /// Validate a local file selected for upload on the client side.
    pub fn validate_upload_source(path: &Path) -> AppResult<()> {
        if !path.exists() {
            return Err(AppError::validation(
                "file",
                &format!("File not found: {}", path.display()),
            ));
        }

        if !path.is_file() {
            return Err(AppError::validation("file", "Path is not a file"));
        }

        if path.file_name().is_none() {
            return Err(AppError::validation("file", "File must have a name"));
        }

        Ok(())
    }
}

// File system utilities for the relay's temp artifacts
pub struct FileSystemGuard;

impl FileSystemGuard {
    /// Build a unique spool path for a whole-file upload inside the relay's
    /// working directory. The random prefix keeps concurrent uploads of the
    /// same file name from clobbering each other.
    pub fn spool_path(dir: &Path, file_name: &str) -> PathBuf {
        let random_name = uuid::Uuid::new_v4().to_string();
        dir.join(format!("{}-{}.spool", random_name, file_name))
    }

    pub fn get_file_size(path: &Path) -> AppResult<u64> {
        let metadata = std::fs::metadata(path)?;
        Ok(metadata.len())
    }
}
