// src/workspace/bundle.rs
//! Packaging course materials into a zip archive
//!
//! Batch semantics: an item that fails sandbox validation (or is not a
//! regular file) is skipped and reported, the rest of the batch carries on.
//! Only exceeding the total size limit aborts the whole bundle.

use crate::identity::CourseId;
use crate::utils::errors::SandboxError;
use crate::workspace::sandbox::{normalize, resolve};
use std::collections::HashSet;
use std::fs;
use std::io::{self, Cursor, Read, Write};
use std::path::Path;
use tracing::{debug, warn};
use zip::write::SimpleFileOptions;
use zip::ZipWriter;

/// Why an item was left out of a bundle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedItem {
    pub path: String,
    pub reason: String,
}

/// Finished archive
#[derive(Debug, Clone)]
pub struct Bundle {
    /// Zip bytes
    pub data: Vec<u8>,

    /// Archive entry names (normalized relative paths), in insertion order
    pub included: Vec<String>,

    /// Items that were skipped
    pub skipped: Vec<SkippedItem>,

    /// Sum of the uncompressed sizes of included files
    pub total_bytes: u64,
}

/// Zip the given material paths (relative to `root`) into memory
pub fn bundle_materials<I, S>(root: &Path, files: I, max_total_bytes: u64) -> Result<Bundle, SandboxError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
    let options = SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated)
        .unix_permissions(0o644);

    let mut seen = HashSet::new();
    let mut included = Vec::new();
    let mut skipped = Vec::new();
    let mut total_bytes = 0u64;

    for file in files {
        let relative = file.as_ref();
        // `x`, `./x` and `d/../x` all name the same entry
        let name = match normalize(relative) {
            Ok(normalized) => normalized.to_string_lossy().into_owned(),
            Err(_) => relative.to_string(),
        };
        if !seen.insert(name.clone()) {
            continue;
        }

        let path = match resolve(root, relative) {
            Ok(path) => path,
            Err(err) => {
                warn!("Skipping {:?} in bundle: {}", relative, err);
                skipped.push(SkippedItem {
                    path: relative.to_string(),
                    reason: err.to_string(),
                });
                continue;
            }
        };

        let meta = match fs::metadata(&path) {
            Ok(meta) if meta.is_file() => meta,
            _ => {
                debug!("Skipping {:?}: not a regular file", relative);
                skipped.push(SkippedItem {
                    path: relative.to_string(),
                    reason: "not a regular file".to_string(),
                });
                continue;
            }
        };

        let remaining = max_total_bytes.saturating_sub(total_bytes);
        if meta.len() > remaining {
            return Err(SandboxError::BundleTooLarge {
                limit: max_total_bytes,
            });
        }

        zip.start_file(name.as_str(), options).map_err(zip_error)?;
        let input = fs::File::open(&path)?;
        total_bytes += copy_within(input, &mut zip, remaining, max_total_bytes)?;
        included.push(name);
    }

    let mut cursor = zip.finish().map_err(zip_error)?;
    cursor.flush()?;

    Ok(Bundle {
        data: cursor.into_inner(),
        included,
        skipped,
        total_bytes,
    })
}

/// Download name for a course bundle: `<course>-materials.zip`, lowercased
pub fn bundle_file_name(course: &CourseId) -> String {
    let safe: String = course
        .as_str()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect();
    format!("{}-materials.zip", safe)
}

/// Copy at most `remaining` bytes. The file may have grown since it was
/// measured, so the cap is enforced on what is actually read.
fn copy_within<R: Read, W: Write>(
    input: R,
    output: &mut W,
    remaining: u64,
    limit: u64,
) -> Result<u64, SandboxError> {
    let mut capped = input.take(remaining.saturating_add(1));
    let copied = io::copy(&mut capped, output)?;
    if copied > remaining {
        return Err(SandboxError::BundleTooLarge { limit });
    }
    Ok(copied)
}

fn zip_error(error: zip::result::ZipError) -> SandboxError {
    SandboxError::Io(io::Error::new(io::ErrorKind::Other, error.to_string()))
}
