//! Commit protocol: keeps the content tree and the namespace table in step.
//!
//! Upload:   begin tx -> upsert row -> rename staged bytes -> commit.
//! Mkdir:    begin tx -> insert self-row -> commit -> create directory.
//! Removal:  begin tx -> delete row -> remove from disk -> commit.
//!
//! A failure before the filesystem step rolls the transaction back. A failure
//! after it (commit error, mkdir error) leaves the disk ahead of the metadata;
//! that window is logged and later picked up by [`crate::reconcile`].

use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::error::{Result, SyncError};
use crate::namespace::{NamespaceEntry, NamespaceStore, NamespaceTx};
use crate::paths;
use crate::protocol_core::normalize_under_root;
use crate::transfer::{stage_copy, ScratchDir, StagedFile, TransferHeader, VerifiedFile};

/// Table of per-path async locks. Entries are dropped once nobody holds or
/// waits on them.
#[derive(Default)]
pub struct PathLocks {
    slots: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl PathLocks {
    pub async fn lock(&self, path: &str) -> PathGuard<'_> {
        let slot = {
            let mut slots = self.slots.lock();
            slots
                .entry(path.to_string())
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };
        let guard = slot.clone().lock_owned().await;
        PathGuard {
            locks: self,
            path: path.to_string(),
            slot,
            guard: Some(guard),
        }
    }

    /// Number of paths currently locked or awaited.
    pub fn active(&self) -> usize {
        self.slots.lock().len()
    }
}

pub struct PathGuard<'a> {
    locks: &'a PathLocks,
    path: String,
    slot: Arc<AsyncMutex<()>>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for PathGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();
        let mut slots = self.locks.slots.lock();
        // Only the table and this guard still reference the slot
        if Arc::strong_count(&self.slot) == 2 {
            slots.remove(&self.path);
        }
    }
}

/// Server-side coordinator over the namespace store and the content tree.
pub struct CommitCoordinator {
    store: NamespaceStore,
    content_root: PathBuf,
    scratch: ScratchDir,
    locks: PathLocks,
}

impl CommitCoordinator {
    pub fn new(store: NamespaceStore, content_root: impl Into<PathBuf>, scratch: ScratchDir) -> Self {
        Self {
            store,
            content_root: content_root.into(),
            scratch,
            locks: PathLocks::default(),
        }
    }

    pub fn store(&self) -> &NamespaceStore {
        &self.store
    }

    pub fn scratch(&self) -> &ScratchDir {
        &self.scratch
    }

    pub fn content_root(&self) -> &Path {
        &self.content_root
    }

    pub fn locks(&self) -> &PathLocks {
        &self.locks
    }

    fn disk_path(&self, path: &str) -> Result<PathBuf> {
        normalize_under_root(&self.content_root, path)
    }

    /// Children of the folder `folder_name` under `parent_path`.
    pub async fn list_folder(&self, parent_path: &str, folder_name: &str) -> Result<Vec<NamespaceEntry>> {
        let folder = paths::canonical_folder(&paths::join(
            &paths::canonical_folder(parent_path)?,
            folder_name,
        ))?;
        self.store.query_folder(&folder, "").await?;
        self.store.list_children(&folder).await
    }

    /// Canonicalize an upload's target folder and check that it exists.
    pub async fn check_upload_target(&self, folder: &str) -> Result<String> {
        let folder = paths::canonical_folder(folder)?;
        self.store.query_folder(&folder, "").await?;
        Ok(folder)
    }

    /// Place a verified upload and record it in the namespace.
    pub async fn commit_upload(&self, verified: VerifiedFile) -> Result<NamespaceEntry> {
        let folder = paths::canonical_folder(&verified.header().folder)?;
        let name = verified.header().filename.clone();
        paths::validate_name(&name)?;
        let path = paths::join(&folder, &name);
        let dest = self.disk_path(&path)?;
        let hash = verified.hash().to_string();

        let _guard = self.locks.lock(&path).await;
        let mut tx = self.store.begin().await?;
        if self.store.folder_in_tx(&mut tx, &folder).await?.is_none() {
            return Err(SyncError::NotFound(folder));
        }
        if self.store.folder_in_tx(&mut tx, &path).await?.is_some() {
            return Err(SyncError::AlreadyExists(format!("{path} is a folder")));
        }
        let entry = self.store.upsert_file(&mut tx, &folder, &name, &hash).await?;

        if let Err(e) = verified.place_at(&dest).await {
            rollback(tx, &path).await;
            return Err(e);
        }
        tracing::debug!(path = %path, dest = %dest.display(), "placed upload");

        if let Err(e) = tx.commit().await {
            tracing::warn!(
                path = %path,
                error = %e,
                "upload bytes placed but namespace commit failed; file is orphaned until repaired"
            );
            return Err(e.into());
        }
        tracing::info!(path = %path, hash = %hash, "committed upload");
        Ok(entry)
    }

    /// Create a folder. Creating an existing folder returns its entry.
    pub async fn make_directory(&self, raw: &str) -> Result<NamespaceEntry> {
        let path = paths::canonical_folder(raw)?;
        let Some((parent, name)) = paths::split(&path) else {
            return self.store.query_folder(&path, "").await;
        };
        paths::validate_name(&name)?;
        let dir = self.disk_path(&path)?;

        let _guard = self.locks.lock(&path).await;
        let mut tx = self.store.begin().await?;
        if self.store.folder_in_tx(&mut tx, &parent).await?.is_none() {
            return Err(SyncError::NotFound(parent));
        }
        if self.store.child_in_tx(&mut tx, &parent, &name).await?.is_some() {
            return Err(SyncError::AlreadyExists(format!("{path} is a file")));
        }
        let entry = self.store.insert_folder(&mut tx, &path).await?;
        tx.commit().await?;

        match tokio::fs::create_dir(&dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
            Err(e) => {
                tracing::warn!(
                    path = %path,
                    error = %e,
                    "folder committed but directory creation failed; namespace is ahead of disk"
                );
                return Err(e.into());
            }
        }
        tracing::info!(path = %path, "created folder");
        Ok(entry.as_child_view())
    }

    pub async fn remove_file(&self, folder: &str, filename: &str) -> Result<()> {
        let folder = paths::canonical_folder(folder)?;
        paths::validate_name(filename)?;
        let path = paths::join(&folder, filename);
        let target = self.disk_path(&path)?;

        let _guard = self.locks.lock(&path).await;
        let mut tx = self.store.begin().await?;
        self.store.remove_file(&mut tx, &folder, filename).await?;
        match tokio::fs::remove_file(&target).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(path = %path, "file row had no bytes on disk; dropping row");
            }
            Err(e) => {
                rollback(tx, &path).await;
                return Err(e.into());
            }
        }
        tx.commit().await?;
        tracing::info!(path = %path, "removed file");
        Ok(())
    }

    /// Remove an empty folder. The root is refused.
    pub async fn remove_directory(&self, raw: &str) -> Result<()> {
        let path = paths::canonical_folder(raw)?;
        if paths::is_root(&path) {
            return Err(SyncError::RootProtected);
        }
        let dir = self.disk_path(&path)?;

        let _guard = self.locks.lock(&path).await;
        let mut tx = self.store.begin().await?;
        self.store.remove_folder(&mut tx, &path).await?;
        match tokio::fs::remove_dir(&dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(path = %path, "folder row had no directory on disk; dropping row");
            }
            Err(e) => {
                rollback(tx, &path).await;
                return Err(e.into());
            }
        }
        tx.commit().await?;
        tracing::info!(path = %path, "removed folder");
        Ok(())
    }

    /// Copy the file at `folder/filename` into scratch for streaming. The
    /// header carries the hash recorded in the namespace.
    pub async fn stage_download(&self, folder: &str, filename: &str) -> Result<(StagedFile, TransferHeader)> {
        let folder = paths::canonical_folder(folder)?;
        let rows = self.store.query_file(&folder, filename).await?;
        let path = paths::join(&folder, filename);
        let Some(row) = rows.into_iter().next() else {
            return Err(SyncError::NotFound(path));
        };
        let source = self.disk_path(&path)?;
        let (staged, staged_hash, len) = match stage_copy(&source, &self.scratch).await {
            Ok(staged) => staged,
            Err(SyncError::NotFound(_)) => {
                tracing::warn!(path = %path, "namespace row has no bytes on disk");
                return Err(SyncError::NotFound(path));
            }
            Err(e) => return Err(e),
        };
        if staged_hash != row.content_hash {
            tracing::warn!(
                path = %path,
                recorded = %row.content_hash,
                on_disk = %staged_hash,
                "content drifted from recorded hash"
            );
        }
        tracing::debug!(path = %path, bytes = len, "staged download");
        Ok((
            staged,
            TransferHeader {
                folder,
                filename: filename.to_string(),
                filehash: row.content_hash,
            },
        ))
    }
}

async fn rollback(tx: NamespaceTx, path: &str) {
    if let Err(e) = tx.rollback().await {
        tracing::error!(path = %path, error = %e, "namespace rollback failed");
    } else {
        tracing::debug!(path = %path, "rolled back namespace transaction");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::hash_bytes;
    use crate::error::ErrorKind;
    use crate::transfer::ChunkReceiver;
    use crate::wire::FileBytesMessage;
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

    async fn verified(c: &CommitCoordinator, folder: &str, name: &str, data: &[u8]) -> VerifiedFile {
        let mut receiver = ChunkReceiver::new(c.scratch()).await.unwrap();
        receiver
            .absorb(FileBytesMessage {
                folder: folder.into(),
                filename: name.into(),
                filehash: hash_bytes(data),
                chunk: data.to_vec(),
                done: true,
            })
            .await
            .unwrap();
        receiver.finalize().await.unwrap()
    }

    #[tokio::test]
    async fn upload_commit_places_bytes_and_row() {
        let (_dir, c) = coordinator().await;
        c.make_directory("/docs").await.unwrap();
        let entry = c
            .commit_upload(verified(&c, "/docs", "report.txt", b"hello").await)
            .await
            .unwrap();
        assert_eq!(entry.content_hash, hash_bytes(b"hello"));

        let on_disk = std::fs::read(c.content_root().join("docs/report.txt")).unwrap();
        assert_eq!(on_disk, b"hello");
        assert_eq!(hash_bytes(&on_disk), entry.content_hash);
        assert_eq!(c.locks().active(), 0);
        assert_eq!(c.scratch().sweep().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn second_upload_wins() {
        let (_dir, c) = coordinator().await;
        c.commit_upload(verified(&c, "/", "a.txt", b"one").await).await.unwrap();
        c.commit_upload(verified(&c, "/", "a.txt", b"two").await).await.unwrap();

        let rows = c.list_folder("/", "").await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].content_hash, hash_bytes(b"two"));
        assert_eq!(std::fs::read(c.content_root().join("a.txt")).unwrap(), b"two");
    }

    #[tokio::test]
    async fn upload_into_missing_folder_leaves_nothing() {
        let (_dir, c) = coordinator().await;
        assert_eq!(
            c.check_upload_target("/nope").await.unwrap_err().kind(),
            ErrorKind::NotFound
        );
        let err = c
            .commit_upload(verified(&c, "/nope", "a.txt", b"x").await)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!(c.scratch().sweep().await.unwrap(), 0);
        assert!(c.store().all_entries().await.unwrap().len() == 1);
    }

    #[tokio::test]
    async fn failed_rename_rolls_back_the_row() {
        let (_dir, c) = coordinator().await;
        c.make_directory("/docs").await.unwrap();
        // Directory vanished from disk: the rename fails after the upsert
        std::fs::remove_dir(c.content_root().join("docs")).unwrap();

        let err = c
            .commit_upload(verified(&c, "/docs", "a.txt", b"x").await)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Storage);
        assert!(c.store().query_file("/docs", "a.txt").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn upload_onto_a_folder_name_is_rejected() {
        let (_dir, c) = coordinator().await;
        c.make_directory("/docs").await.unwrap();
        let err = c
            .commit_upload(verified(&c, "/", "docs", b"x").await)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyExists);
    }

    #[tokio::test]
    async fn make_directory_rules() {
        let (_dir, c) = coordinator().await;
        let first = c.make_directory("/a").await.unwrap();
        let again = c.make_directory("a/").await.unwrap();
        assert_eq!(first.id, again.id);
        assert_eq!(first.parent_path, "/");
        assert_eq!(first.name, "a");
        assert!(c.content_root().join("a").is_dir());

        assert_eq!(
            c.make_directory("/missing/child").await.unwrap_err().kind(),
            ErrorKind::NotFound
        );
        c.commit_upload(verified(&c, "/a", "f", b"x").await).await.unwrap();
        assert_eq!(
            c.make_directory("/a/f").await.unwrap_err().kind(),
            ErrorKind::AlreadyExists
        );
        assert!(c.make_directory("/").await.unwrap().is_self_row());
        assert_eq!(c.list_folder("/", "").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn removal_rules() {
        let (_dir, c) = coordinator().await;
        c.make_directory("/docs").await.unwrap();
        c.commit_upload(verified(&c, "/docs", "a.txt", b"x").await).await.unwrap();

        assert!(matches!(c.remove_directory("/").await, Err(SyncError::RootProtected)));
        assert!(matches!(c.remove_directory("/./").await, Err(SyncError::RootProtected)));
        assert_eq!(
            c.remove_directory("/docs").await.unwrap_err().kind(),
            ErrorKind::NotEmpty
        );
        assert_eq!(
            c.remove_file("/docs", "missing").await.unwrap_err().kind(),
            ErrorKind::NotFound
        );

        c.remove_file("/docs", "a.txt").await.unwrap();
        assert!(!c.content_root().join("docs/a.txt").exists());
        c.remove_directory("/docs").await.unwrap();
        assert!(!c.content_root().join("docs").exists());
        assert_eq!(
            c.remove_directory("/docs").await.unwrap_err().kind(),
            ErrorKind::NotFound
        );
    }

    #[tokio::test]
    async fn removing_a_file_already_gone_from_disk_drops_the_row() {
        let (_dir, c) = coordinator().await;
        c.commit_upload(verified(&c, "/", "a.txt", b"x").await).await.unwrap();
        std::fs::remove_file(c.content_root().join("a.txt")).unwrap();
        c.remove_file("/", "a.txt").await.unwrap();
        assert!(c.list_folder("/", "").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn stage_download_uses_recorded_hash() {
        let (_dir, c) = coordinator().await;
        c.commit_upload(verified(&c, "/", "a.txt", b"hello").await).await.unwrap();
        let (staged, header) = c.stage_download("/", "a.txt").await.unwrap();
        assert_eq!(header.filehash, hash_bytes(b"hello"));
        assert_eq!(std::fs::read(staged.path()).unwrap(), b"hello");
        drop(staged);
        assert_eq!(c.scratch().sweep().await.unwrap(), 0);

        std::fs::remove_file(c.content_root().join("a.txt")).unwrap();
        assert_eq!(
            c.stage_download("/", "a.txt").await.unwrap_err().kind(),
            ErrorKind::NotFound
        );
        assert!(matches!(
            c.stage_download("/", "").await,
            Err(SyncError::EmptyName)
        ));
    }

    #[tokio::test]
    async fn path_locks_serialize_and_clean_up() {
        let locks = Arc::new(PathLocks::default());
        let guard = locks.lock("/a").await;
        assert_eq!(locks.active(), 1);

        let waiter = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _g = locks.lock("/a").await;
            })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());
        drop(guard);
        waiter.await.unwrap();
        assert_eq!(locks.active(), 0);
    }
}
