//! Frame header codec and content-root path mapping
//!
//! Transport-agnostic helpers used by the framed connection on both ends and
//! by the server when it maps namespace paths onto the content directory.

use std::path::{Component, Path, PathBuf};

use crate::error::{Result, SyncError};
use crate::protocol::{HEADER_LEN, MAGIC, MAX_FRAME_SIZE, VERSION};

/// Map a canonical namespace path onto the content directory.
/// This prevents path traversal by:
/// 1. Rejecting parent directory components and NUL bytes
/// 2. On Windows, rejecting ':' in path components (ADS defense)
/// 3. Canonicalizing existing ancestors to resolve symlinks
/// 4. Ensuring the result is under the root
pub fn normalize_under_root(root: &Path, p: &str) -> Result<PathBuf> {
    if p.contains('\0') {
        return Err(SyncError::InvalidPath("path contains NUL byte".to_string()));
    }

    let mut safe = PathBuf::new();
    for component in Path::new(p).components() {
        match component {
            Component::CurDir | Component::RootDir => {}
            Component::Normal(s) => {
                #[cfg(windows)]
                if s.to_string_lossy().contains(':') {
                    return Err(SyncError::InvalidPath(
                        "path component contains colon".to_string(),
                    ));
                }
                safe.push(s);
            }
            Component::ParentDir | Component::Prefix(_) => {
                return Err(SyncError::InvalidPath(format!(
                    "path contains disallowed component: {component:?}"
                )));
            }
        }
    }

    let joined = root.join(&safe);
    let canon_root = std::fs::canonicalize(root).unwrap_or_else(|_| root.to_path_buf());

    // Existing paths: resolve symlinks and check containment
    if let Ok(canon) = std::fs::canonicalize(&joined) {
        if !canon.starts_with(&canon_root) {
            return Err(SyncError::InvalidPath(format!("{p} escapes content root")));
        }
        return Ok(joined);
    }

    // New paths: the parent must resolve under root
    if let Some(parent) = joined.parent() {
        if let Ok(canon_parent) = std::fs::canonicalize(parent) {
            if !canon_parent.starts_with(&canon_root) {
                return Err(SyncError::InvalidPath(format!(
                    "{p} parent escapes content root"
                )));
            }
        }
    }

    Ok(joined)
}

/// Validate frame payload size against protocol::MAX_FRAME_SIZE
pub fn validate_frame_size(size: usize) -> Result<()> {
    if size > MAX_FRAME_SIZE {
        return Err(SyncError::Protocol(format!(
            "frame payload too large: {size} bytes (max: {MAX_FRAME_SIZE})"
        )));
    }
    Ok(())
}

/// Build frame header (11 bytes)
/// Format: MAGIC (4) | VERSION (2) | TYPE (1) | LENGTH (4)
pub fn build_frame_header(frame_type: u8, payload_len: u32) -> [u8; HEADER_LEN] {
    let mut header = [0u8; HEADER_LEN];
    header[0..4].copy_from_slice(MAGIC);
    header[4..6].copy_from_slice(&VERSION.to_le_bytes());
    header[6] = frame_type;
    header[7..11].copy_from_slice(&payload_len.to_le_bytes());
    header
}

/// Parse frame header
/// Returns: (frame_type, payload_length)
pub fn parse_frame_header(header: &[u8; HEADER_LEN]) -> Result<(u8, u32)> {
    if &header[0..4] != MAGIC {
        return Err(SyncError::Protocol("invalid magic in frame header".to_string()));
    }

    let version = u16::from_le_bytes([header[4], header[5]]);
    if version != VERSION {
        return Err(SyncError::Protocol(format!(
            "protocol version mismatch: got {version}, expected {VERSION}"
        )));
    }

    let frame_type = header[6];
    let payload_len = u32::from_le_bytes([header[7], header[8], header[9], header[10]]);
    validate_frame_size(payload_len as usize)?;

    Ok((frame_type, payload_len))
}
