//! Reconciliation of the content tree against the namespace table.
//!
//! Every inconsistency window of the commit protocol leaves the disk ahead
//! of the metadata, so repair treats the disk as authoritative.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::checksum::hash_file;
use crate::commit::CommitCoordinator;
use crate::error::{Result, SyncError};
use crate::paths;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Discrepancy {
    /// Bytes on disk with no file row.
    OrphanFile { path: String, hash: String },
    /// File row with no bytes on disk.
    MissingFile { path: String },
    /// Bytes on disk whose digest differs from the recorded one.
    HashDrift {
        path: String,
        recorded: String,
        actual: String,
    },
    /// Folder row with no directory on disk.
    MissingDirectory { path: String },
    /// Directory on disk with no folder row.
    OrphanDirectory { path: String },
}

impl Discrepancy {
    pub fn path(&self) -> &str {
        match self {
            Discrepancy::OrphanFile { path, .. }
            | Discrepancy::MissingFile { path }
            | Discrepancy::HashDrift { path, .. }
            | Discrepancy::MissingDirectory { path }
            | Discrepancy::OrphanDirectory { path } => path,
        }
    }

    // Folders before files, parents before children.
    fn repair_rank(&self) -> u8 {
        match self {
            Discrepancy::OrphanDirectory { .. } => 0,
            Discrepancy::MissingDirectory { .. } => 1,
            Discrepancy::OrphanFile { .. } => 2,
            Discrepancy::HashDrift { .. } => 3,
            Discrepancy::MissingFile { .. } => 4,
        }
    }
}

#[derive(Debug, Default)]
pub struct ReconcileReport {
    pub discrepancies: Vec<Discrepancy>,
    pub repaired: usize,
}

impl ReconcileReport {
    pub fn is_clean(&self) -> bool {
        self.discrepancies.is_empty()
    }
}

#[derive(Default)]
struct DiskTree {
    dirs: BTreeSet<String>,
    files: BTreeSet<String>,
}

fn walk_content(root: PathBuf) -> Result<DiskTree> {
    let mut tree = DiskTree::default();
    for entry in WalkDir::new(&root).min_depth(1).follow_links(false) {
        let entry = entry.map_err(|e| {
            SyncError::Io(
                e.into_io_error()
                    .unwrap_or_else(|| std::io::Error::other("walkdir loop")),
            )
        })?;
        let Some(path) = namespace_path(&root, entry.path()) else {
            tracing::warn!(path = %entry.path().display(), "skipping non UTF-8 path");
            continue;
        };
        let file_type = entry.file_type();
        if file_type.is_dir() {
            tree.dirs.insert(path);
        } else if file_type.is_file() {
            tree.files.insert(path);
        }
    }
    Ok(tree)
}

fn namespace_path(root: &Path, disk: &Path) -> Option<String> {
    let rel = disk.strip_prefix(root).ok()?;
    let mut out = String::new();
    for component in rel.components() {
        out.push(paths::SEPARATOR);
        out.push_str(component.as_os_str().to_str()?);
    }
    Some(out)
}

/// Compare the content tree with the namespace without changing either.
pub async fn scan(coordinator: &CommitCoordinator) -> Result<Vec<Discrepancy>> {
    let root = coordinator.content_root().to_path_buf();
    let disk = tokio::task::spawn_blocking(move || walk_content(root))
        .await
        .map_err(|e| SyncError::Io(std::io::Error::other(format!("spawn_blocking failed: {e}"))))??;

    let mut folders = BTreeSet::new();
    let mut files = BTreeMap::new();
    for row in coordinator.store().all_entries().await? {
        if row.is_self_row() {
            if !paths::is_root(&row.parent_path) {
                folders.insert(row.parent_path);
            }
        } else if !row.is_directory {
            files.insert(row.path(), row.content_hash);
        }
    }

    let mut found = Vec::new();
    for dir in disk.dirs.difference(&folders) {
        found.push(Discrepancy::OrphanDirectory { path: dir.clone() });
    }
    for dir in folders.difference(&disk.dirs) {
        found.push(Discrepancy::MissingDirectory { path: dir.clone() });
    }
    for file in &disk.files {
        let actual = hash_file(&coordinator.content_root().join(file.trim_start_matches('/'))).await?;
        match files.get(file) {
            None => found.push(Discrepancy::OrphanFile {
                path: file.clone(),
                hash: actual,
            }),
            Some(recorded) if *recorded != actual => found.push(Discrepancy::HashDrift {
                path: file.clone(),
                recorded: recorded.clone(),
                actual,
            }),
            Some(_) => {}
        }
    }
    for file in files.keys() {
        if !disk.files.contains(file) {
            found.push(Discrepancy::MissingFile { path: file.clone() });
        }
    }

    for d in &found {
        tracing::warn!(discrepancy = ?d, "namespace and content tree disagree");
    }
    Ok(found)
}

/// Apply disk-authoritative fixes. Returns how many were applied.
pub async fn repair(coordinator: &CommitCoordinator, discrepancies: &[Discrepancy]) -> Result<usize> {
    let mut ordered: Vec<&Discrepancy> = discrepancies.iter().collect();
    ordered.sort_by(|a, b| {
        a.repair_rank()
            .cmp(&b.repair_rank())
            .then_with(|| a.path().cmp(b.path()))
    });

    let store = coordinator.store();
    let mut repaired = 0;
    for d in ordered {
        let _guard = coordinator.locks().lock(d.path()).await;
        match d {
            Discrepancy::OrphanDirectory { path } => {
                let mut tx = store.begin().await?;
                store.insert_folder(&mut tx, path).await?;
                tx.commit().await?;
            }
            Discrepancy::MissingDirectory { path } => {
                let dir = coordinator.content_root().join(path.trim_start_matches('/'));
                tokio::fs::create_dir_all(&dir).await?;
            }
            Discrepancy::OrphanFile { path, hash: actual }
            | Discrepancy::HashDrift { path, actual, .. } => {
                let Some((parent, name)) = paths::split(path) else {
                    continue;
                };
                let mut tx = store.begin().await?;
                store.upsert_file(&mut tx, &parent, &name, actual).await?;
                tx.commit().await?;
            }
            Discrepancy::MissingFile { path } => {
                let Some((parent, name)) = paths::split(path) else {
                    continue;
                };
                let mut tx = store.begin().await?;
                store.remove_file(&mut tx, &parent, &name).await?;
                tx.commit().await?;
            }
        }
        tracing::info!(discrepancy = ?d, "repaired");
        repaired += 1;
    }
    Ok(repaired)
}

/// Scan, and optionally repair what the scan found.
pub async fn reconcile(coordinator: &CommitCoordinator, apply: bool) -> Result<ReconcileReport> {
    let discrepancies = scan(coordinator).await?;
    let repaired = if apply && !discrepancies.is_empty() {
        repair(coordinator, &discrepancies).await?
    } else {
        0
    };
    if discrepancies.is_empty() {
        tracing::info!("content tree matches namespace");
    } else {
        tracing::info!(found = discrepancies.len(), repaired, "reconciliation finished");
    }
    Ok(ReconcileReport {
        discrepancies,
        repaired,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::hash_bytes;
    use crate::namespace::NamespaceStore;
    use crate::transfer::ScratchDir;
    use tempfile::TempDir;

    async fn coordinator() -> (TempDir, CommitCoordinator) {
        let dir = tempfile::tempdir().unwrap();
        let files = dir.path().join("files");
        std::fs::create_dir_all(&files).unwrap();
        let scratch = ScratchDir::new(dir.path().join("tmp"));
        scratch.ensure().await.unwrap();
        let store = NamespaceStore::open(dir.path().join("files.db")).await.unwrap();
        (dir, CommitCoordinator::new(store, files, scratch))
    }

    #[tokio::test]
    async fn clean_store_has_no_discrepancies() {
        let (_dir, c) = coordinator().await;
        c.make_directory("/docs").await.unwrap();
        let report = reconcile(&c, false).await.unwrap();
        assert!(report.is_clean());
    }

    #[tokio::test]
    async fn finds_and_repairs_every_kind() {
        let (_dir, c) = coordinator().await;
        let root = c.content_root().to_path_buf();

        // Folder row whose directory is gone
        c.make_directory("/gone").await.unwrap();
        std::fs::remove_dir(root.join("gone")).unwrap();
        // Directory and file nobody recorded
        std::fs::create_dir_all(root.join("stray")).unwrap();
        std::fs::write(root.join("stray/a.txt"), b"hello").unwrap();
        // Rows for files that are missing or changed on disk
        let mut tx = c.store().begin().await.unwrap();
        c.store().upsert_file(&mut tx, "/", "lost.txt", "00").await.unwrap();
        c.store().upsert_file(&mut tx, "/", "drift.txt", "11").await.unwrap();
        tx.commit().await.unwrap();
        std::fs::write(root.join("drift.txt"), b"new bytes").unwrap();

        let found = scan(&c).await.unwrap();
        assert_eq!(found.len(), 5);
        assert!(found.contains(&Discrepancy::MissingDirectory { path: "/gone".into() }));
        assert!(found.contains(&Discrepancy::OrphanDirectory { path: "/stray".into() }));
        assert!(found.contains(&Discrepancy::OrphanFile {
            path: "/stray/a.txt".into(),
            hash: hash_bytes(b"hello"),
        }));
        assert!(found.contains(&Discrepancy::MissingFile { path: "/lost.txt".into() }));
        assert!(found.contains(&Discrepancy::HashDrift {
            path: "/drift.txt".into(),
            recorded: "11".into(),
            actual: hash_bytes(b"new bytes"),
        }));

        let report = reconcile(&c, true).await.unwrap();
        assert_eq!(report.repaired, 5);
        assert!(scan(&c).await.unwrap().is_empty());

        assert!(root.join("gone").is_dir());
        let stray = c.store().query_file("/stray", "a.txt").await.unwrap();
        assert_eq!(stray[0].content_hash, hash_bytes(b"hello"));
        assert!(c.store().query_file("/", "lost.txt").await.unwrap().is_empty());
        assert_eq!(
            c.store().query_file("/", "drift.txt").await.unwrap()[0].content_hash,
            hash_bytes(b"new bytes")
        );
    }

    #[test]
    fn disk_paths_map_to_namespace_paths() {
        let root = Path::new("/srv/files");
        assert_eq!(
            namespace_path(root, Path::new("/srv/files/docs/a.txt")).unwrap(),
            "/docs/a.txt"
        );
        assert!(namespace_path(root, Path::new("/elsewhere")).is_none());
    }
}
