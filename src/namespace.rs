//! Namespace store: one SQLite table holding files and folders.
//!
//! A folder is a *self-row*: `is_directory = 1`, `name = ''`, `parent_path`
//! set to the folder's own canonical path. A file is a row with a non-empty
//! `name` under its containing folder. `(parent_path, name)` is unique.
//!
//! Mutations take a caller-owned [`NamespaceTx`]; the store never commits on
//! its own. The pool holds a single connection, so nothing may read through
//! the pool while the same task holds an open transaction.

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Executor, FromRow, Pool, Sqlite, Transaction};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Result, SyncError};
use crate::paths;

pub type NamespaceTx = Transaction<'static, Sqlite>;

const COLUMNS: &str = "id, is_directory, parent_path, name, content_hash, created_at";

#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct NamespaceEntry {
    pub id: i64,
    pub is_directory: bool,
    pub parent_path: String,
    pub name: String,
    pub content_hash: String,
    pub created_at: i64,
}

impl NamespaceEntry {
    pub fn is_self_row(&self) -> bool {
        self.is_directory && self.name.is_empty()
    }

    /// Canonical path of the entry. For a self-row that is `parent_path`.
    pub fn path(&self) -> String {
        paths::join(&self.parent_path, &self.name)
    }

    /// Present a folder self-row the way its parent's listing shows it:
    /// `parent_path` is the containing folder and `name` the basename.
    /// The root and file rows are returned unchanged.
    pub fn as_child_view(self) -> Self {
        if !self.is_self_row() {
            return self;
        }
        match paths::split(&self.parent_path) {
            Some((parent, name)) => Self {
                parent_path: parent,
                name,
                ..self
            },
            None => self,
        }
    }
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

async fn fetch_folder<'e, E>(exec: E, path: &str) -> Result<Option<NamespaceEntry>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let row = sqlx::query_as::<_, NamespaceEntry>(&format!(
        "SELECT {COLUMNS} FROM entries WHERE parent_path = ?1 AND name = '' AND is_directory = 1"
    ))
    .bind(path)
    .fetch_optional(exec)
    .await?;
    Ok(row)
}

async fn fetch_child<'e, E>(exec: E, parent: &str, name: &str) -> Result<Option<NamespaceEntry>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let row = sqlx::query_as::<_, NamespaceEntry>(&format!(
        "SELECT {COLUMNS} FROM entries WHERE parent_path = ?1 AND name = ?2"
    ))
    .bind(parent)
    .bind(name)
    .fetch_optional(exec)
    .await?;
    Ok(row)
}

/// SQLite-backed namespace.
#[derive(Clone)]
pub struct NamespaceStore {
    pool: Pool<Sqlite>,
}

impl NamespaceStore {
    /// Open (creating if missing) the database at `path`, apply the schema and
    /// bootstrap the root folder.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let opts = SqliteConnectOptions::from_str(&format!("sqlite:{}?mode=rwc", path.display()))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(opts)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        store.bootstrap().await?;
        tracing::debug!(db = %path.display(), "namespace store opened");
        Ok(store)
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS entries (
                id            INTEGER PRIMARY KEY AUTOINCREMENT,
                is_directory  INTEGER NOT NULL DEFAULT 0,
                parent_path   TEXT    NOT NULL,
                name          TEXT    NOT NULL DEFAULT '',
                content_hash  TEXT    NOT NULL DEFAULT '',
                created_at    INTEGER NOT NULL,
                UNIQUE(parent_path, name)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_entries_parent ON entries(parent_path)")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Ensure the root self-row exists. Safe to call repeatedly.
    pub async fn bootstrap(&self) -> Result<()> {
        let inserted = sqlx::query(
            "INSERT INTO entries (is_directory, parent_path, name, content_hash, created_at)
             VALUES (1, ?1, '', '', ?2)
             ON CONFLICT(parent_path, name) DO NOTHING",
        )
        .bind(paths::ROOT)
        .bind(now())
        .execute(&self.pool)
        .await?
        .rows_affected();
        if inserted > 0 {
            tracing::info!("bootstrapped root folder");
        }
        Ok(())
    }

    pub async fn begin(&self) -> Result<NamespaceTx> {
        Ok(self.pool.begin().await?)
    }

    /// Insert a self-row for `path` if absent. The parent must already exist;
    /// that is the caller's check.
    pub async fn insert_folder(&self, tx: &mut NamespaceTx, path: &str) -> Result<NamespaceEntry> {
        sqlx::query(
            "INSERT INTO entries (is_directory, parent_path, name, content_hash, created_at)
             VALUES (1, ?1, '', '', ?2)
             ON CONFLICT(parent_path, name) DO NOTHING",
        )
        .bind(path)
        .bind(now())
        .execute(&mut **tx)
        .await?;
        fetch_folder(&mut **tx, path)
            .await?
            .ok_or_else(|| SyncError::NotFound(path.to_string()))
    }

    /// Self-row of folder `name` under `parent`. An empty `name` means
    /// `parent` itself.
    pub async fn query_folder(&self, parent: &str, name: &str) -> Result<NamespaceEntry> {
        let path = paths::join(parent, name);
        fetch_folder(&self.pool, &path)
            .await?
            .ok_or(SyncError::NotFound(path))
    }

    /// Transaction-scoped folder lookup.
    pub async fn folder_in_tx(&self, tx: &mut NamespaceTx, path: &str) -> Result<Option<NamespaceEntry>> {
        fetch_folder(&mut **tx, path).await
    }

    /// Transaction-scoped lookup of the non-self row `name` under `parent`.
    pub async fn child_in_tx(
        &self,
        tx: &mut NamespaceTx,
        parent: &str,
        name: &str,
    ) -> Result<Option<NamespaceEntry>> {
        fetch_child(&mut **tx, parent, name).await
    }

    /// File rows named `name` under `parent`; empty when there is none.
    pub async fn query_file(&self, parent: &str, name: &str) -> Result<Vec<NamespaceEntry>> {
        if name.is_empty() {
            return Err(SyncError::EmptyName);
        }
        let rows = sqlx::query_as::<_, NamespaceEntry>(&format!(
            "SELECT {COLUMNS} FROM entries
             WHERE parent_path = ?1 AND name = ?2 AND is_directory = 0
             ORDER BY created_at DESC, id DESC"
        ))
        .bind(parent)
        .bind(name)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Children of `parent`, newest first: file rows stored under it plus
    /// every folder whose self-row sits directly below it, shown by basename.
    pub async fn list_children(&self, parent: &str) -> Result<Vec<NamespaceEntry>> {
        let prefix = paths::child_prefix(parent);
        let prefix_chars = prefix.chars().count() as i64;
        let rows = sqlx::query_as::<_, NamespaceEntry>(
            r#"
            SELECT id, is_directory, parent_path, name, content_hash, created_at
              FROM entries
             WHERE parent_path = ?1 AND name <> ''
            UNION ALL
            SELECT id, is_directory, ?1 AS parent_path,
                   substr(parent_path, ?3 + 1) AS name, content_hash, created_at
              FROM entries
             WHERE is_directory = 1 AND name = ''
               AND substr(parent_path, 1, ?3) = ?2
               AND length(parent_path) > ?3
               AND instr(substr(parent_path, ?3 + 1), '/') = 0
             ORDER BY created_at DESC, id DESC
            "#,
        )
        .bind(parent)
        .bind(&prefix)
        .bind(prefix_chars)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Insert or overwrite the file row at `(parent, name)`. An existing row
    /// keeps its id and takes the new hash and timestamp.
    pub async fn upsert_file(
        &self,
        tx: &mut NamespaceTx,
        parent: &str,
        name: &str,
        content_hash: &str,
    ) -> Result<NamespaceEntry> {
        paths::validate_name(name)?;
        let row = sqlx::query_as::<_, NamespaceEntry>(&format!(
            "INSERT INTO entries (is_directory, parent_path, name, content_hash, created_at)
             VALUES (0, ?1, ?2, ?3, ?4)
             ON CONFLICT(parent_path, name) DO UPDATE
                SET content_hash = excluded.content_hash,
                    created_at = excluded.created_at
             RETURNING {COLUMNS}"
        ))
        .bind(parent)
        .bind(name)
        .bind(content_hash)
        .bind(now())
        .fetch_one(&mut **tx)
        .await?;
        Ok(row)
    }

    pub async fn remove_file(&self, tx: &mut NamespaceTx, parent: &str, name: &str) -> Result<()> {
        if name.is_empty() {
            return Err(SyncError::EmptyName);
        }
        let removed = sqlx::query(
            "DELETE FROM entries WHERE parent_path = ?1 AND name = ?2 AND is_directory = 0",
        )
        .bind(parent)
        .bind(name)
        .execute(&mut **tx)
        .await?
        .rows_affected();
        if removed == 0 {
            return Err(SyncError::NotFound(paths::join(parent, name)));
        }
        Ok(())
    }

    /// Whether anything other than the folder's own self-row lives under `path`.
    pub async fn has_children(&self, tx: &mut NamespaceTx, path: &str) -> Result<bool> {
        let prefix = paths::child_prefix(path);
        let prefix_chars = prefix.chars().count() as i64;
        let found: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS(
                SELECT 1 FROM entries
                 WHERE (parent_path = ?1 AND name <> '')
                    OR (substr(parent_path, 1, ?3) = ?2 AND parent_path <> ?1)
            )
            "#,
        )
        .bind(path)
        .bind(&prefix)
        .bind(prefix_chars)
        .fetch_one(&mut **tx)
        .await?;
        Ok(found)
    }

    /// Delete an empty folder's self-row. The root can never be removed.
    pub async fn remove_folder(&self, tx: &mut NamespaceTx, path: &str) -> Result<()> {
        if paths::is_root(path) {
            return Err(SyncError::RootProtected);
        }
        if fetch_folder(&mut **tx, path).await?.is_none() {
            return Err(SyncError::NotFound(path.to_string()));
        }
        if self.has_children(tx, path).await? {
            return Err(SyncError::NotEmpty(path.to_string()));
        }
        sqlx::query("DELETE FROM entries WHERE parent_path = ?1 AND name = '' AND is_directory = 1")
            .bind(path)
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    /// Every row, ordered by path. Used by the reconciliation pass.
    pub async fn all_entries(&self) -> Result<Vec<NamespaceEntry>> {
        let rows = sqlx::query_as::<_, NamespaceEntry>(&format!(
            "SELECT {COLUMNS} FROM entries ORDER BY parent_path, name"
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}
