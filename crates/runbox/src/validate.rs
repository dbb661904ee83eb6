//! Submission sanitization.
//!
//! [`sanitize_submission`] is the single gate between untrusted input and
//! everything that touches a filesystem. It is a pure function: no request
//! context, no I/O, so the server boundary and programmatic builders (such
//! as [`crate::template`]) share it unchanged.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;

use crate::error::ValidationError;
use crate::job::{FileEncoding, JobSubmission, PROTOCOL_VERSION, RunFile, SanitizedJob};

/// Maximum number of files per submission.
pub const MAX_FILE_COUNT: usize = 30;
/// Maximum decoded size of a UTF-8 text file.
pub const MAX_TEXT_FILE_BYTES: usize = 200 * 1024;
/// Maximum decoded size of a base64 binary file.
pub const MAX_BINARY_FILE_BYTES: usize = 2 * 1024 * 1024;

/// Source extension required of the entry file.
const ENTRY_EXTENSION: &str = ".py";

/// Validate and normalize an untrusted submission.
///
/// Rules are applied in a fixed order and each failure maps to a distinct
/// [`ValidationError`] variant. On success every path is normalized,
/// paths are unique, and the entry path is a member of the file set.
///
/// # Errors
///
/// Returns the first rule violation encountered.
pub fn sanitize_submission(submission: &JobSubmission) -> Result<SanitizedJob, ValidationError> {
    if submission.protocol_version != PROTOCOL_VERSION {
        return Err(ValidationError::UnsupportedProtocol(PROTOCOL_VERSION));
    }
    if submission.language != "python" {
        return Err(ValidationError::UnsupportedLanguage(
            submission.language.clone(),
        ));
    }
    if submission.files.is_empty() {
        return Err(ValidationError::EmptyFiles);
    }
    if submission.files.len() > MAX_FILE_COUNT {
        return Err(ValidationError::FileCountExceeded(MAX_FILE_COUNT));
    }

    let mut sanitized = Vec::with_capacity(submission.files.len());
    let mut seen = std::collections::HashSet::new();
    for file in &submission.files {
        let path = sanitize_relative_path(&file.path)?;
        if !seen.insert(path.clone()) {
            return Err(ValidationError::DuplicateFilePath(path));
        }
        check_content_size(&path, &file.content, file.encoding)?;
        sanitized.push(RunFile {
            path,
            content: file.content.clone(),
            encoding: file.encoding,
        });
    }

    let entry_path = sanitize_relative_path(&submission.entry_path)?;
    if !entry_path.to_lowercase().ends_with(ENTRY_EXTENSION) {
        return Err(ValidationError::InvalidEntry);
    }
    if !seen.contains(&entry_path) {
        return Err(ValidationError::EntryNotFound);
    }

    Ok(SanitizedJob {
        protocol_version: PROTOCOL_VERSION,
        language: "python".to_string(),
        files: sanitized,
        entry_path,
    })
}

/// Normalize a workspace-relative path, rejecting anything that could
/// escape the workspace root once joined onto it.
///
/// Rejected outright: empty paths, a leading `/`, a Windows drive prefix,
/// and backslashes. Normalization drops `.` segments and empty segments;
/// any `..` segment rejects the whole path rather than being resolved.
///
/// # Errors
///
/// Returns [`ValidationError::InvalidFilePath`] with the offending input.
pub fn sanitize_relative_path(path: &str) -> Result<String, ValidationError> {
    let trimmed = path.trim();
    if trimmed.is_empty() {
        return Err(ValidationError::InvalidFilePath(path.to_string()));
    }
    if trimmed.starts_with('/') || has_drive_prefix(trimmed) {
        return Err(ValidationError::InvalidFilePath(trimmed.to_string()));
    }
    if trimmed.contains('\\') {
        return Err(ValidationError::InvalidFilePath(trimmed.to_string()));
    }

    let mut segments = Vec::new();
    for segment in trimmed.split('/') {
        match segment {
            "" | "." => {}
            ".." => return Err(ValidationError::InvalidFilePath(trimmed.to_string())),
            other => segments.push(other),
        }
    }
    if segments.is_empty() {
        return Err(ValidationError::InvalidFilePath(trimmed.to_string()));
    }
    Ok(segments.join("/"))
}

fn has_drive_prefix(path: &str) -> bool {
    let mut chars = path.chars();
    matches!(
        (chars.next(), chars.next()),
        (Some(c), Some(':')) if c.is_ascii_alphabetic()
    )
}

fn check_content_size(
    path: &str,
    content: &str,
    encoding: FileEncoding,
) -> Result<(), ValidationError> {
    let (decoded_len, limit) = match encoding {
        FileEncoding::Utf8 => (content.len(), MAX_TEXT_FILE_BYTES),
        FileEncoding::Base64 => {
            let decoded = BASE64
                .decode(content.trim())
                .map_err(|_| ValidationError::InvalidFileContent(path.to_string()))?;
            (decoded.len(), MAX_BINARY_FILE_BYTES)
        }
    };
    if decoded_len > limit {
        return Err(ValidationError::FileTooLarge {
            path: path.to_string(),
            limit,
        });
    }
    Ok(())
}

/// Decode a run file's content into raw bytes.
///
/// # Errors
///
/// Returns [`ValidationError::InvalidFileContent`] if declared base64
/// content does not decode.
pub fn decode_content(file: &RunFile) -> Result<Vec<u8>, ValidationError> {
    match file.encoding {
        FileEncoding::Utf8 => Ok(file.content.as_bytes().to_vec()),
        FileEncoding::Base64 => BASE64
            .decode(file.content.trim())
            .map_err(|_| ValidationError::InvalidFileContent(file.path.clone())),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn submission(files: Vec<RunFile>, entry: &str) -> JobSubmission {
        JobSubmission {
            protocol_version: PROTOCOL_VERSION,
            language: "python".to_string(),
            files,
            entry_path: entry.to_string(),
        }
    }

    fn text_file(path: &str, content: &str) -> RunFile {
        RunFile {
            path: path.to_string(),
            content: content.to_string(),
            encoding: FileEncoding::Utf8,
        }
    }

    #[test]
    fn accepts_minimal_submission() {
        let out = sanitize_submission(&submission(
            vec![text_file("main.py", "print('hi')")],
            "main.py",
        ))
        .unwrap();
        assert_eq!(out.entry_path, "main.py");
        assert_eq!(out.files.len(), 1);
    }

    #[test]
    fn normalizes_redundant_segments() {
        let out = sanitize_submission(&submission(
            vec![text_file("./pkg//mod.py", "x = 1"), text_file("main.py", "")],
            "main.py",
        ))
        .unwrap();
        assert_eq!(out.files[0].path, "pkg/mod.py");
    }

    #[test]
    fn rejects_traversal_paths() {
        for bad in ["../evil.py", "a/../../evil.py", "a/b/../../../c.py"] {
            let err = sanitize_submission(&submission(
                vec![text_file(bad, ""), text_file("main.py", "")],
                "main.py",
            ))
            .unwrap_err();
            assert_eq!(err.code(), "INVALID_FILE_PATH", "path {bad:?}");
        }
    }

    #[test]
    fn rejects_absolute_drive_and_backslash_paths() {
        for bad in ["/etc/passwd", "C:evil.py", "c:/evil.py", "pkg\\mod.py", "", "   "] {
            let err = sanitize_relative_path(bad).unwrap_err();
            assert_eq!(err.code(), "INVALID_FILE_PATH", "path {bad:?}");
        }
    }

    #[test]
    fn rejects_duplicate_normalized_paths() {
        let err = sanitize_submission(&submission(
            vec![text_file("main.py", ""), text_file("./main.py", "")],
            "main.py",
        ))
        .unwrap_err();
        assert_eq!(err.code(), "DUPLICATE_FILE_PATH");
    }

    #[test]
    fn rejects_wrong_protocol_and_language() {
        let mut sub = submission(vec![text_file("main.py", "")], "main.py");
        sub.protocol_version = 1;
        assert_eq!(
            sanitize_submission(&sub).unwrap_err().code(),
            "UNSUPPORTED_PROTOCOL"
        );

        let mut sub = submission(vec![text_file("main.py", "")], "main.py");
        sub.language = "ruby".to_string();
        assert_eq!(
            sanitize_submission(&sub).unwrap_err().code(),
            "UNSUPPORTED_LANGUAGE"
        );
    }

    #[test]
    fn rejects_empty_and_oversized_file_lists() {
        let err = sanitize_submission(&submission(vec![], "main.py")).unwrap_err();
        assert_eq!(err.code(), "EMPTY_FILES");

        let mut files: Vec<RunFile> = (0..=MAX_FILE_COUNT)
            .map(|i| text_file(&format!("f{i}.py"), ""))
            .collect();
        files[0] = text_file("main.py", "");
        let err = sanitize_submission(&submission(files, "main.py")).unwrap_err();
        assert_eq!(err.code(), "FILE_COUNT_EXCEEDED");
    }

    #[test]
    fn rejects_oversized_text_content() {
        let big = "x".repeat(MAX_TEXT_FILE_BYTES + 1);
        let err = sanitize_submission(&submission(
            vec![text_file("main.py", &big)],
            "main.py",
        ))
        .unwrap_err();
        assert_eq!(err.code(), "FILE_TOO_LARGE");
    }

    #[test]
    fn rejects_invalid_base64() {
        let err = sanitize_submission(&submission(
            vec![
                RunFile {
                    path: "blob.bin".to_string(),
                    content: "not base64 at all!!!".to_string(),
                    encoding: FileEncoding::Base64,
                },
                text_file("main.py", ""),
            ],
            "main.py",
        ))
        .unwrap_err();
        assert_eq!(err.code(), "INVALID_FILE_CONTENT");
    }

    #[test]
    fn binary_files_get_the_larger_limit() {
        use base64::Engine as _;
        let payload = vec![0u8; MAX_TEXT_FILE_BYTES + 1];
        let encoded = base64::engine::general_purpose::STANDARD.encode(&payload);
        let out = sanitize_submission(&submission(
            vec![
                RunFile {
                    path: "blob.bin".to_string(),
                    content: encoded,
                    encoding: FileEncoding::Base64,
                },
                text_file("main.py", ""),
            ],
            "main.py",
        ));
        assert!(out.is_ok());
    }

    #[test]
    fn entry_rules() {
        let err = sanitize_submission(&submission(
            vec![text_file("main.py", "")],
            "main.txt",
        ))
        .unwrap_err();
        assert_eq!(err.code(), "INVALID_ENTRY");

        let err = sanitize_submission(&submission(
            vec![text_file("main.py", "")],
            "other.py",
        ))
        .unwrap_err();
        assert_eq!(err.code(), "ENTRY_NOT_FOUND");

        // entry path is normalized before the membership check
        let out = sanitize_submission(&submission(
            vec![text_file("main.py", "")],
            "./main.py",
        ))
        .unwrap();
        assert_eq!(out.entry_path, "main.py");
    }
}
