//! Canonical namespace paths.
//!
//! A canonical path is absolute, uses `/` as separator, has no `.`/`..`
//! components, no empty components and no trailing separator. The root is `/`.

use crate::error::{Result, SyncError};

pub const ROOT: &str = "/";
pub const SEPARATOR: char = '/';

/// Clean an incoming folder path into canonical form.
///
/// `""`, `"."` and `"/"` all mean the root. `..` above the root stays at the
/// root, the same way a lexical clean of an absolute path does.
pub fn canonical_folder(raw: &str) -> Result<String> {
    if raw.contains('\0') {
        return Err(SyncError::InvalidPath("path contains NUL byte".to_string()));
    }
    let mut parts: Vec<&str> = Vec::new();
    for component in raw.split(SEPARATOR) {
        match component {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    if parts.is_empty() {
        return Ok(ROOT.to_string());
    }
    Ok(format!("/{}", parts.join("/")))
}

/// Validate a single entry name (a file name or the last component of a folder).
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(SyncError::EmptyName);
    }
    if name == "." || name == ".." || name.contains(SEPARATOR) || name.contains('\0') {
        return Err(SyncError::InvalidPath(format!("bad entry name {name:?}")));
    }
    Ok(())
}

pub fn is_root(path: &str) -> bool {
    path == ROOT
}

/// Join a canonical folder and a validated name.
pub fn join(folder: &str, name: &str) -> String {
    if name.is_empty() {
        return folder.to_string();
    }
    if is_root(folder) {
        format!("/{name}")
    } else {
        format!("{folder}/{name}")
    }
}

/// Split a canonical path into `(parent, name)`. The root has no parent.
pub fn split(path: &str) -> Option<(String, String)> {
    if is_root(path) {
        return None;
    }
    let idx = path.rfind(SEPARATOR)?;
    let parent = if idx == 0 { ROOT } else { &path[..idx] };
    Some((parent.to_string(), path[idx + 1..].to_string()))
}

/// Parent of a canonical path; the root is its own parent.
pub fn parent_of(path: &str) -> String {
    split(path)
        .map(|(parent, _)| parent)
        .unwrap_or_else(|| ROOT.to_string())
}

/// Prefix every direct or indirect descendant of `folder` starts with.
pub fn child_prefix(folder: &str) -> String {
    if is_root(folder) {
        ROOT.to_string()
    } else {
        format!("{folder}/")
    }
}
