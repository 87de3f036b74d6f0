//! Path resolution: raw user input to canonical absolute paths.
//!
//! Canonical paths start with `/`, have no trailing slash (except the root
//! itself), and contain no `.`, `..` or empty segments. `..` above the root
//! clamps to the root. Segment comparison is byte-wise and case-sensitive.
//! Resolution never touches the tree, so symlinks are left for
//! [`super::symlink`].

use std::borrow::Cow;

use super::error::{VfsError, VfsResult};

/// The root path.
pub const ROOT: &str = "/";

/// Longest allowed single segment, in bytes.
pub const MAX_NAME_LEN: usize = 255;

/// Resolve `raw` against `cwd`, expanding a leading `~` to `home`.
pub fn resolve(raw: &str, cwd: &str, home: &str) -> VfsResult<String> {
    if raw.is_empty() {
        return Err(VfsError::invalid_path("empty path"));
    }
    check_chars(raw)?;

    let expanded: Cow<'_, str> = shellexpand::tilde_with_context(raw, || Some(home));
    if expanded.starts_with('/') {
        normalize(&expanded)
    } else {
        check_chars(cwd)?;
        normalize(&format!("{cwd}/{expanded}"))
    }
}

/// Normalize a path, treating it as absolute.
pub fn normalize(path: &str) -> VfsResult<String> {
    check_chars(path)?;
    let mut stack: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                // clamps at root
                stack.pop();
            }
            name => {
                if name.len() > MAX_NAME_LEN {
                    return Err(VfsError::NameTooLong(name.to_string()));
                }
                stack.push(name);
            }
        }
    }
    Ok(from_segments(&stack))
}

/// Build a canonical path from segments.
pub fn from_segments<S: AsRef<str>>(segments: &[S]) -> String {
    if segments.is_empty() {
        return ROOT.to_string();
    }
    let mut out = String::new();
    for s in segments {
        out.push('/');
        out.push_str(s.as_ref());
    }
    out
}

/// Segments of a canonical path (empty for the root).
pub fn segments(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|s| !s.is_empty())
}

/// Split a canonical path into its parent path and final name.
///
/// Returns `None` for the root.
pub fn split_parent(path: &str) -> Option<(&str, &str)> {
    if path == ROOT {
        return None;
    }
    let idx = path.rfind('/')?;
    let parent = if idx == 0 { ROOT } else { &path[..idx] };
    Some((parent, &path[idx + 1..]))
}

/// Join a canonical directory path and a child name.
pub fn join(dir: &str, name: &str) -> String {
    if dir == ROOT {
        format!("/{name}")
    } else {
        format!("{dir}/{name}")
    }
}

/// True if `path` equals `prefix` or lies beneath it.
pub fn is_within(path: &str, prefix: &str) -> bool {
    if prefix == ROOT {
        return true;
    }
    path == prefix
        || (path.starts_with(prefix) && path.as_bytes().get(prefix.len()) == Some(&b'/'))
}

/// Validate a single name for insertion into a directory.
pub fn validate_name(name: &str) -> VfsResult<()> {
    if name.is_empty() || name == "." || name == ".." || name.contains('/') {
        return Err(VfsError::invalid_path(format!("invalid name: {name:?}")));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(VfsError::NameTooLong(name.to_string()));
    }
    check_chars(name)
}

fn check_chars(s: &str) -> VfsResult<()> {
    if s.contains('\0') {
        return Err(VfsError::invalid_path(s.replace('\0', "\\0")));
    }
    Ok(())
}
