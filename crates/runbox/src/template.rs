//! Build a job submission from a packaged directory of files.
//!
//! Lesson content and other pre-authored bundles live on disk; this module
//! walks such a directory into a [`JobSubmission`] and pushes it through
//! the same validator as the public submission boundary, so a template can
//! never smuggle in what a client could not.

use std::path::Path;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use thiserror::Error;
use walkdir::WalkDir;

use crate::error::ValidationError;
use crate::job::{FileEncoding, JobSubmission, PROTOCOL_VERSION, RunFile, SanitizedJob};
use crate::validate::sanitize_submission;

/// Extensions stored base64-encoded rather than as UTF-8 text.
const BINARY_EXTENSIONS: [&str; 12] = [
    "png", "jpg", "jpeg", "gif", "webp", "bmp", "wav", "mp3", "ogg", "mp4", "avi", "pdf",
];

/// Failure while turning a directory into a submission.
#[derive(Debug, Error)]
pub enum TemplateError {
    /// Directory walk or file read failed.
    #[error("failed to read template files: {0}")]
    Io(#[from] std::io::Error),

    /// A file path could not be expressed relative to the template root.
    #[error("template file escapes its root: {0}")]
    PathOutsideRoot(String),

    /// The resulting submission failed validation.
    #[error(transparent)]
    Invalid(#[from] ValidationError),
}

/// Walk `root` into a sanitized job with the given entry path.
///
/// Symbolic links are skipped rather than followed, so a template cannot
/// pull in files from outside its own tree. Files with a known binary
/// extension are base64-encoded; everything else is read as UTF-8 text
/// (lossily, template content is expected to be text).
///
/// # Errors
///
/// Returns a [`TemplateError`] if the walk fails or the collected files do
/// not form a valid submission.
pub fn submission_from_dir(root: &Path, entry_path: &str) -> Result<SanitizedJob, TemplateError> {
    let mut files = Vec::new();
    for entry in WalkDir::new(root).follow_links(false) {
        let entry = entry.map_err(std::io::Error::from)?;
        if entry.path_is_symlink() || !entry.file_type().is_file() {
            continue;
        }
        files.push(read_template_file(entry.path(), root)?);
    }

    let submission = JobSubmission {
        protocol_version: PROTOCOL_VERSION,
        language: "python".to_string(),
        files,
        entry_path: entry_path.to_string(),
    };
    Ok(sanitize_submission(&submission)?)
}

fn read_template_file(path: &Path, root: &Path) -> Result<RunFile, TemplateError> {
    let relative = path
        .strip_prefix(root)
        .map_err(|_| TemplateError::PathOutsideRoot(path.display().to_string()))?;
    let posix_path = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/");

    let bytes = std::fs::read(path)?;
    if is_binary_file(&posix_path) {
        Ok(RunFile {
            path: posix_path,
            content: BASE64.encode(&bytes),
            encoding: FileEncoding::Base64,
        })
    } else {
        Ok(RunFile {
            path: posix_path,
            content: String::from_utf8_lossy(&bytes).into_owned(),
            encoding: FileEncoding::Utf8,
        })
    }
}

fn is_binary_file(path: &str) -> bool {
    path.rsplit_once('.')
        .is_some_and(|(_, ext)| BINARY_EXTENSIONS.contains(&ext.to_lowercase().as_str()))
}
