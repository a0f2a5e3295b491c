//! Client session: working directory, path resolution and the listing cache.

use async_trait::async_trait;
use std::collections::HashMap;

use crate::error::{Result, SyncError};
use crate::paths;
use crate::wire::FileEntry;

/// The one remote call a session needs.
#[async_trait]
pub trait RemoteNamespace: Send + Sync {
    async fn list_folder(&self, folder: &str) -> Result<Vec<FileEntry>>;
}

/// Working directory plus the entries last listed for it.
#[derive(Debug, Clone)]
pub struct Session {
    current_directory: String,
    directory_entries: HashMap<String, FileEntry>,
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    pub fn new() -> Self {
        Self {
            current_directory: paths::ROOT.to_string(),
            directory_entries: HashMap::new(),
        }
    }

    pub fn current_directory(&self) -> &str {
        &self.current_directory
    }

    pub fn cached(&self, name: &str) -> Option<&FileEntry> {
        self.directory_entries.get(name)
    }

    /// Cached entries, sorted by name.
    pub fn entries(&self) -> Vec<&FileEntry> {
        let mut entries: Vec<&FileEntry> = self.directory_entries.values().collect();
        entries.sort_by(|a, b| a.filename.cmp(&b.filename));
        entries
    }

    /// Turn a user-typed path into a canonical absolute path.
    ///
    /// A leading `.` means the working directory, a leading `..` its parent
    /// and a leading separator an absolute path; anything else is relative
    /// to the working directory.
    pub fn resolve(&self, raw: &str) -> Result<String> {
        let (first, rest) = match raw.split_once(paths::SEPARATOR) {
            Some((first, rest)) => (first, rest),
            None => (raw, ""),
        };
        let base = match first {
            "." => self.current_directory.clone(),
            ".." => paths::parent_of(&self.current_directory),
            "" => paths::ROOT.to_string(),
            other => paths::join(&self.current_directory, other),
        };
        paths::canonical_folder(&format!("{base}/{rest}"))
    }

    fn replace_cache(&mut self, directory: String, entries: Vec<FileEntry>) {
        self.current_directory = directory;
        self.directory_entries = entries
            .into_iter()
            .map(|e| (e.filename.clone(), e))
            .collect();
    }

    /// Re-list the working directory into the cache.
    pub async fn refresh<R: RemoteNamespace + ?Sized>(&mut self, remote: &R) -> Result<()> {
        let entries = remote.list_folder(&self.current_directory).await?;
        let dir = self.current_directory.clone();
        self.replace_cache(dir, entries);
        Ok(())
    }

    /// Move to `raw`. The target must appear as a folder in its parent's
    /// listing. On any failure the directory and cache are left untouched.
    pub async fn change_directory<R: RemoteNamespace + ?Sized>(
        &mut self,
        remote: &R,
        raw: &str,
    ) -> Result<&str> {
        let target = self.resolve(raw)?;
        if let Some((parent, _)) = paths::split(&target) {
            let siblings = remote.list_folder(&parent).await?;
            match siblings.iter().find(|e| e.path() == target) {
                Some(e) if e.is_directory => {}
                Some(_) => {
                    return Err(SyncError::InvalidPath(format!("{target} is not a folder")));
                }
                None => return Err(SyncError::NotFound(target)),
            }
        }
        let entries = remote.list_folder(&target).await?;
        tracing::debug!(from = %self.current_directory, to = %target, "changed directory");
        self.replace_cache(target, entries);
        Ok(&self.current_directory)
    }

    /// Find the file `name` in `folder` (default: the working directory).
    /// The working directory is answered from the cache; any other folder is
    /// listed first.
    pub async fn lookup_file<R: RemoteNamespace + ?Sized>(
        &self,
        remote: &R,
        name: &str,
        folder: Option<&str>,
    ) -> Result<FileEntry> {
        paths::validate_name(name)?;
        let folder = match folder {
            Some(raw) => self.resolve(raw)?,
            None => self.current_directory.clone(),
        };
        let found = if folder == self.current_directory {
            self.cached(name).cloned()
        } else {
            remote
                .list_folder(&folder)
                .await?
                .into_iter()
                .find(|e| e.filename == name)
        };
        match found {
            Some(entry) if !entry.is_directory => Ok(entry),
            Some(_) => Err(SyncError::InvalidPath(format!(
                "{} is a folder",
                paths::join(&folder, name)
            ))),
            None => Err(SyncError::NotFound(paths::join(&folder, name))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use parking_lot::Mutex;

    /// In-memory namespace: folder path -> children.
    #[derive(Default)]
    struct FakeRemote {
        folders: HashMap<String, Vec<FileEntry>>,
        calls: Mutex<Vec<String>>,
    }

    impl FakeRemote {
        fn entry(folder: &str, name: &str, is_directory: bool) -> FileEntry {
            FileEntry {
                id: 0,
                is_directory,
                folder: folder.into(),
                filename: name.into(),
                filehash: if is_directory { String::new() } else { "aa".into() },
                timestamp: 0,
            }
        }

        fn with_tree() -> Self {
            let mut folders = HashMap::new();
            folders.insert(
                "/".to_string(),
                vec![Self::entry("/", "docs", true), Self::entry("/", "notes.txt", false)],
            );
            folders.insert(
                "/docs".to_string(),
                vec![Self::entry("/docs", "report.txt", false), Self::entry("/docs", "old", true)],
            );
            folders.insert("/docs/old".to_string(), Vec::new());
            Self {
                folders,
                calls: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().clone()
        }
    }

    #[async_trait]
    impl RemoteNamespace for FakeRemote {
        async fn list_folder(&self, folder: &str) -> Result<Vec<FileEntry>> {
            self.calls.lock().push(folder.to_string());
            self.folders
                .get(folder)
                .cloned()
                .ok_or_else(|| SyncError::NotFound(folder.to_string()))
        }
    }

    fn session_at(dir: &str) -> Session {
        let mut s = Session::new();
        s.current_directory = dir.to_string();
        s
    }

    #[test]
    fn resolves_relative_and_absolute_paths() {
        let s = session_at("/docs");
        assert_eq!(s.resolve(".").unwrap(), "/docs");
        assert_eq!(s.resolve("./old").unwrap(), "/docs/old");
        assert_eq!(s.resolve("..").unwrap(), "/");
        assert_eq!(s.resolve("../x").unwrap(), "/x");
        assert_eq!(s.resolve("/abs/path/").unwrap(), "/abs/path");
        assert_eq!(s.resolve("old").unwrap(), "/docs/old");
        assert_eq!(s.resolve("old/../new").unwrap(), "/docs/new");
        assert_eq!(s.resolve("").unwrap(), "/");
    }

    #[test]
    fn parent_of_root_is_root() {
        let s = Session::new();
        assert_eq!(s.resolve("..").unwrap(), "/");
        assert_eq!(s.resolve("../..").unwrap(), "/");
        assert_eq!(s.resolve("docs").unwrap(), "/docs");
    }

    #[tokio::test]
    async fn cd_validates_against_parent_and_fills_cache() {
        let remote = FakeRemote::with_tree();
        let mut s = Session::new();
        assert_eq!(s.change_directory(&remote, "docs").await.unwrap(), "/docs");
        assert_eq!(remote.calls(), vec!["/".to_string(), "/docs".to_string()]);
        assert!(s.cached("report.txt").is_some());
        assert_eq!(s.entries().len(), 2);

        s.change_directory(&remote, "old").await.unwrap();
        assert_eq!(s.current_directory(), "/docs/old");
        assert!(s.entries().is_empty());

        s.change_directory(&remote, "/").await.unwrap();
        assert_eq!(s.current_directory(), "/");
        assert!(s.cached("docs").is_some());
    }

    #[tokio::test]
    async fn failed_cd_leaves_state_unchanged() {
        let remote = FakeRemote::with_tree();
        let mut s = Session::new();
        s.change_directory(&remote, "/docs").await.unwrap();

        let err = s.change_directory(&remote, "nowhere").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!(s.current_directory(), "/docs");
        assert!(s.cached("report.txt").is_some());

        let err = s.change_directory(&remote, "report.txt").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidPath);
        assert_eq!(s.current_directory(), "/docs");

        let err = s.change_directory(&remote, "/missing/deeper").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!(s.current_directory(), "/docs");
    }

    #[tokio::test]
    async fn lookup_uses_cache_for_working_directory() {
        let remote = FakeRemote::with_tree();
        let mut s = Session::new();
        s.change_directory(&remote, "docs").await.unwrap();
        let before = remote.calls().len();

        let entry = s.lookup_file(&remote, "report.txt", None).await.unwrap();
        assert_eq!(entry.path(), "/docs/report.txt");
        assert_eq!(remote.calls().len(), before);

        let entry = s.lookup_file(&remote, "notes.txt", Some("..")).await.unwrap();
        assert_eq!(entry.path(), "/notes.txt");
        assert_eq!(remote.calls().len(), before + 1);

        assert_eq!(
            s.lookup_file(&remote, "missing", None).await.unwrap_err().kind(),
            ErrorKind::NotFound
        );
        assert_eq!(
            s.lookup_file(&remote, "old", None).await.unwrap_err().kind(),
            ErrorKind::InvalidPath
        );
    }

    #[tokio::test]
    async fn refresh_relists_working_directory() {
        let mut remote = FakeRemote::with_tree();
        let mut s = Session::new();
        s.refresh(&remote).await.unwrap();
        assert!(s.cached("notes.txt").is_some());

        remote.folders.insert("/".into(), Vec::new());
        s.refresh(&remote).await.unwrap();
        assert!(s.entries().is_empty());
    }
}
