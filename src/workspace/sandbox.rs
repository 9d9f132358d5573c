// src/workspace/sandbox.rs
//! Path validation for user-supplied relative paths
//!
//! Every path handed out by [`resolve`] has been symlink-resolved and is
//! either the canonical root itself or a descendant of it. Checks are made
//! on the *resolved* path, so a symlink anywhere along the way (including a
//! dangling one) cannot be used to step outside the root.
//!
//! [`safe_copy`] never writes anything at the destination unless the whole
//! source fits within the size limit.

use crate::utils::errors::SandboxError;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::VecDeque;
use std::ffi::OsString;
use std::fs;
use std::io::{self, Read};
use std::path::{Component, Path, PathBuf};
use tracing::{debug, warn};

/// Longest accepted identifier (lab ids, course ids)
pub const MAX_IDENTIFIER_LEN: usize = 100;

/// More symlink expansions than this are treated as a loop
const MAX_SYMLINK_HOPS: usize = 40;

static COMPONENT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_.\-]+$").expect("static regex"));

static IDENTIFIER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_\-]+$").expect("static regex"));

type Result<T> = std::result::Result<T, SandboxError>;

/// Resolve `relative` inside `root`.
///
/// Fails when the input is empty, absolute, escapes with `..`, or resolves
/// (after following symlinks) to anything other than `root` or a path below
/// it. The target itself does not need to exist.
pub fn resolve(root: &Path, relative: &str) -> Result<PathBuf> {
    if relative.is_empty() {
        return Err(SandboxError::EmptyPath);
    }
    if relative.contains('\0') {
        warn!("Path contains null byte");
        return Err(SandboxError::InvalidComponent(relative.replace('\0', "\\0")));
    }

    let normalized = normalize(relative)?;

    let root_real = root.canonicalize()?;
    let real = real_path(&root_real.join(&normalized))?;

    if real != root_real && !real.starts_with(&root_real) {
        warn!(
            "Path escape attempt: {:?} resolved to {:?} outside {:?}",
            relative, real, root_real
        );
        return Err(SandboxError::Escape(relative.to_string()));
    }

    Ok(real)
}

/// Collapse `.` and `..` lexically.
///
/// The result is relative and never starts with `..`; an input that
/// collapses to nothing yields an empty path (the root itself).
pub fn normalize(relative: &str) -> Result<PathBuf> {
    let mut parts: Vec<OsString> = Vec::new();
    let mut escapes = false;

    for component in Path::new(relative).components() {
        match component {
            Component::Prefix(_) | Component::RootDir => {
                return Err(SandboxError::AbsolutePath(relative.to_string()));
            }
            Component::CurDir => {}
            Component::ParentDir => {
                if parts.pop().is_none() {
                    escapes = true;
                }
            }
            Component::Normal(name) => {
                if escapes {
                    break;
                }
                parts.push(name.to_os_string());
            }
        }
    }

    if escapes {
        warn!("Path traversal attempt: {:?}", relative);
        return Err(SandboxError::Traversal(relative.to_string()));
    }

    Ok(parts.iter().collect())
}

/// Resolve symlinks like `realpath(3)`, tolerating a missing tail.
///
/// Components are walked left to right. Symlinks are expanded in place
/// (including dangling ones, so their destination is what gets checked),
/// `..` pops the already-resolved prefix, and components that do not exist
/// are appended as-is.
pub fn real_path(path: &Path) -> Result<PathBuf> {
    let mut resolved = PathBuf::new();
    let mut pending: VecDeque<OsString> = VecDeque::new();
    absorb(path, &mut resolved, &mut pending, false);

    let mut hops = 0usize;
    while let Some(name) = pending.pop_front() {
        if name == ".." {
            resolved.pop();
            continue;
        }

        let candidate = resolved.join(&name);
        match fs::symlink_metadata(&candidate) {
            Ok(meta) if meta.file_type().is_symlink() => {
                hops += 1;
                if hops > MAX_SYMLINK_HOPS {
                    return Err(SandboxError::Io(io::Error::new(
                        io::ErrorKind::Other,
                        format!("too many levels of symbolic links: {}", path.display()),
                    )));
                }
                let target = fs::read_link(&candidate)?;
                debug!("Following symlink {:?} -> {:?}", candidate, target);
                absorb(&target, &mut resolved, &mut pending, true);
            }
            Ok(_) => resolved = candidate,
            Err(err) if err.kind() == io::ErrorKind::NotFound => resolved = candidate,
            Err(err) => return Err(SandboxError::Io(err)),
        }
    }

    Ok(resolved)
}

/// Queue the components of `path` ahead of whatever is still pending.
///
/// An absolute `path` resets `resolved` to its root first.
fn absorb(path: &Path, resolved: &mut PathBuf, pending: &mut VecDeque<OsString>, front: bool) {
    let mut names = Vec::new();
    for component in path.components() {
        match component {
            Component::Prefix(prefix) => *resolved = PathBuf::from(prefix.as_os_str()),
            Component::RootDir => resolved.push(Component::RootDir.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => names.push(OsString::from("..")),
            Component::Normal(name) => names.push(name.to_os_string()),
        }
    }

    if front {
        for name in names.into_iter().rev() {
            pending.push_front(name);
        }
    } else {
        pending.extend(names);
    }
}

/// Validate a single file or directory name
pub fn sanitize_component(component: &str) -> Result<&str> {
    if component.is_empty() {
        return Err(SandboxError::InvalidComponent(String::new()));
    }
    if component == "." || component == ".." {
        return Err(SandboxError::InvalidComponent(component.to_string()));
    }
    if component.contains(['/', '\\', '\0']) || !COMPONENT_RE.is_match(component) {
        return Err(SandboxError::InvalidComponent(component.replace('\0', "\\0")));
    }
    Ok(component)
}

/// Validate an identifier such as a lab id or course id: `^[A-Za-z0-9_-]{1,100}$`
pub fn validate_identifier(id: &str) -> Result<&str> {
    if id.is_empty() {
        return Err(SandboxError::InvalidIdentifier(String::new()));
    }
    if id.chars().count() > MAX_IDENTIFIER_LEN {
        return Err(SandboxError::IdentifierTooLong {
            len: id.chars().count(),
            max: MAX_IDENTIFIER_LEN,
        });
    }
    if !IDENTIFIER_RE.is_match(id) {
        return Err(SandboxError::InvalidIdentifier(id.to_string()));
    }
    Ok(id)
}

/// Copy `src` to `dst` when `src` is a regular file of at most `max_bytes`.
///
/// Parent directories of `dst` are created. The data goes to a temporary
/// sibling first and is renamed into place, so `dst` is either untouched or
/// complete. Returns the number of bytes copied.
pub fn safe_copy(src: &Path, dst: &Path, max_bytes: u64) -> Result<u64> {
    let meta = match fs::metadata(src) {
        Ok(meta) => meta,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            return Err(SandboxError::NotAFile(src.to_path_buf()));
        }
        Err(err) => return Err(err.into()),
    };
    if !meta.is_file() {
        return Err(SandboxError::NotAFile(src.to_path_buf()));
    }
    if meta.len() > max_bytes {
        return Err(SandboxError::FileTooLarge {
            size: meta.len(),
            limit: max_bytes,
        });
    }

    if let Some(parent) = dst.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let tmp = temp_sibling(dst);
    let copied = copy_bounded(src, &tmp, max_bytes);
    let copied = match copied {
        Ok(n) if n <= max_bytes => n,
        Ok(n) => {
            // source grew after the size check
            let _ = fs::remove_file(&tmp);
            return Err(SandboxError::FileTooLarge {
                size: n,
                limit: max_bytes,
            });
        }
        Err(err) => {
            let _ = fs::remove_file(&tmp);
            return Err(err.into());
        }
    };

    if let Err(err) = fs::rename(&tmp, dst) {
        let _ = fs::remove_file(&tmp);
        return Err(err.into());
    }

    debug!("Copied {} bytes from {:?} to {:?}", copied, src, dst);
    Ok(copied)
}

/// Copy at most `max_bytes + 1` bytes so oversize input is detectable
fn copy_bounded(src: &Path, dst: &Path, max_bytes: u64) -> io::Result<u64> {
    let input = fs::File::open(src)?;
    let mut limited = input.take(max_bytes.saturating_add(1));
    let mut output = fs::File::create(dst)?;
    let copied = io::copy(&mut limited, &mut output)?;
    output.sync_all()?;
    if let Ok(meta) = fs::metadata(src) {
        let _ = fs::set_permissions(dst, meta.permissions());
    }
    Ok(copied)
}

/// `<dir>/.<name>.<ulid>.tmp` next to `path`
pub(crate) fn temp_sibling(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "file".to_string());
    path.with_file_name(format!(".{}.{}.tmp", name, ulid::Ulid::new()))
}
