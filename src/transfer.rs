//! Chunked transfer engine shared by uploads and downloads.
//!
//! Outbound bytes are first staged into a private scratch file, then read back
//! in `CHUNK_SIZE` pieces. Inbound chunks are written to a scratch file while
//! being hashed; the file only leaves the scratch directory once the stream
//! has ended with `done=true` and the digest matches the claimed hash.
//!
//! Every staging file is a [`TempPath`]: dropping it on any exit path (error,
//! hash mismatch, task cancellation) deletes it.

use async_trait::async_trait;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use tempfile::TempPath;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use crate::checksum::{digests_match, ContentHasher};
use crate::error::{Result, SyncError};
use crate::protocol::CHUNK_SIZE;
use crate::wire::FileBytesMessage;

const STAGING_PREFIX: &str = ".staging-";

/// Destination for outbound chunk messages.
#[async_trait]
pub trait ChunkSink: Send {
    async fn send_chunk(&mut self, msg: &FileBytesMessage) -> Result<()>;
}

/// Origin of inbound chunk messages. `None` means the transport closed.
#[async_trait]
pub trait ChunkSource: Send {
    async fn next_chunk(&mut self) -> Result<Option<FileBytesMessage>>;
}

/// Progress hooks for a single transfer.
pub trait TransferObserver: Send + Sync {
    fn started(&self, _name: &str, _total: Option<u64>) {}
    fn chunk(&self, _bytes: u64) {}
    fn finished(&self, _bytes: u64) {}
}

pub struct NoopObserver;
impl TransferObserver for NoopObserver {}

/// Metadata repeated on every chunk message of one transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferHeader {
    pub folder: String,
    pub filename: String,
    pub filehash: String,
}

impl TransferHeader {
    fn of(msg: &FileBytesMessage) -> Self {
        Self {
            folder: msg.folder.clone(),
            filename: msg.filename.clone(),
            filehash: msg.filehash.clone(),
        }
    }

    fn matches(&self, msg: &FileBytesMessage) -> bool {
        self.folder == msg.folder && self.filename == msg.filename && self.filehash == msg.filehash
    }

    fn message(&self, chunk: Vec<u8>, done: bool) -> FileBytesMessage {
        FileBytesMessage {
            folder: self.folder.clone(),
            filename: self.filename.clone(),
            filehash: self.filehash.clone(),
            chunk,
            done,
        }
    }
}

/// Dedicated directory for in-flight staging files.
#[derive(Debug, Clone)]
pub struct ScratchDir {
    dir: PathBuf,
}

impl ScratchDir {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    pub async fn ensure(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        Ok(())
    }

    /// Create a uniquely named staging file.
    pub async fn staging_file(&self) -> Result<StagedFile> {
        let dir = self.dir.clone();
        let named = tokio::task::spawn_blocking(move || {
            tempfile::Builder::new()
                .prefix(STAGING_PREFIX)
                .tempfile_in(dir)
        })
        .await
        .map_err(|e| SyncError::Io(std::io::Error::other(format!("spawn_blocking failed: {e}"))))??;
        let (file, path) = named.into_parts();
        tracing::debug!(path = %path.display(), "created staging file");
        Ok(StagedFile {
            path,
            file: File::from_std(file),
        })
    }

    /// Remove staging files left behind by a crash. Returns the number removed.
    pub async fn sweep(&self) -> Result<usize> {
        let mut removed = 0;
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            if !name.to_string_lossy().starts_with(STAGING_PREFIX) {
                continue;
            }
            if entry.file_type().await?.is_file() {
                tokio::fs::remove_file(entry.path()).await?;
                removed += 1;
            }
        }
        if removed > 0 {
            tracing::info!(removed, dir = %self.dir.display(), "swept stale staging files");
        }
        Ok(removed)
    }
}

/// An open staging file that is deleted when dropped.
#[derive(Debug)]
pub struct StagedFile {
    path: TempPath,
    file: File,
}

impl StagedFile {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Fill `buf` from `file`, stopping early only at EOF.
async fn fill_chunk(file: &mut File, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = file.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// Copy `src` into a fresh staging file, hashing the staged bytes on the way.
/// Returns the staging file, its digest and its length.
pub async fn stage_copy(src: &Path, scratch: &ScratchDir) -> Result<(StagedFile, String, u64)> {
    let mut source = File::open(src).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            SyncError::NotFound(src.display().to_string())
        } else {
            SyncError::Io(e)
        }
    })?;
    let mut staged = scratch.staging_file().await?;
    let mut hasher = ContentHasher::new();
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        let n = source.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        staged.file.write_all(&buf[..n]).await?;
    }
    staged.file.flush().await?;
    let len = hasher.absorbed();
    Ok((staged, hasher.finalize_hex(), len))
}

/// Stream a staged file as chunk messages. The final message carries
/// `done=true`; it is empty when the length is a multiple of `CHUNK_SIZE`.
pub async fn send_staged<K: ChunkSink + ?Sized>(
    mut staged: StagedFile,
    header: &TransferHeader,
    sink: &mut K,
    observer: &dyn TransferObserver,
) -> Result<u64> {
    staged.file.seek(SeekFrom::Start(0)).await?;
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut sent = 0u64;
    loop {
        let n = fill_chunk(&mut staged.file, &mut buf).await?;
        let done = n < CHUNK_SIZE;
        sink.send_chunk(&header.message(buf[..n].to_vec(), done))
            .await?;
        sent += n as u64;
        observer.chunk(n as u64);
        if done {
            break;
        }
    }
    tracing::debug!(filename = %header.filename, bytes = sent, "sent staged file");
    Ok(sent)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveState {
    /// Accumulating chunks until a message with `done=true`.
    Receiving,
    /// Terminator seen; ready to verify.
    Finalizing,
}

/// Receiving side of one transfer.
pub struct ChunkReceiver {
    state: ReceiveState,
    staged: StagedFile,
    hasher: ContentHasher,
    header: Option<TransferHeader>,
}

impl ChunkReceiver {
    pub async fn new(scratch: &ScratchDir) -> Result<Self> {
        Ok(Self {
            state: ReceiveState::Receiving,
            staged: scratch.staging_file().await?,
            hasher: ContentHasher::new(),
            header: None,
        })
    }

    pub fn state(&self) -> ReceiveState {
        self.state
    }

    /// Metadata of the first absorbed message.
    pub fn header(&self) -> Option<&TransferHeader> {
        self.header.as_ref()
    }

    pub fn received(&self) -> u64 {
        self.hasher.absorbed()
    }

    pub async fn absorb(&mut self, msg: FileBytesMessage) -> Result<ReceiveState> {
        if self.state == ReceiveState::Finalizing {
            return Err(SyncError::Protocol("chunk received after done".to_string()));
        }
        match &self.header {
            None => self.header = Some(TransferHeader::of(&msg)),
            Some(header) if !header.matches(&msg) => {
                return Err(SyncError::Protocol(
                    "transfer metadata changed mid-stream".to_string(),
                ));
            }
            Some(_) => {}
        }
        self.staged.file.write_all(&msg.chunk).await?;
        self.hasher.update(&msg.chunk);
        if msg.done {
            self.staged.file.flush().await?;
            self.state = ReceiveState::Finalizing;
        }
        Ok(self.state)
    }

    /// Verify the digest of everything received against the claimed hash.
    /// On mismatch the staging file is dropped, which deletes it.
    pub async fn finalize(self) -> Result<VerifiedFile> {
        if self.state != ReceiveState::Finalizing {
            return Err(SyncError::Protocol(
                "finalize called before done".to_string(),
            ));
        }
        let header = self
            .header
            .ok_or_else(|| SyncError::Protocol("no chunks received".to_string()))?;
        let len = self.hasher.absorbed();
        let actual = self.hasher.finalize_hex();
        if !digests_match(&header.filehash, &actual) {
            tracing::warn!(
                filename = %header.filename,
                expected = %header.filehash,
                actual = %actual,
                "discarding transfer with mismatched hash"
            );
            return Err(SyncError::HashMismatch {
                expected: header.filehash,
                actual,
            });
        }
        let StagedFile { path, file } = self.staged;
        file.sync_all().await?;
        drop(file);
        Ok(VerifiedFile {
            path,
            header,
            hash: actual,
            len,
        })
    }
}

/// Pump `source` into `receiver` until the terminator, then verify.
/// A transport close before `done=true` is a disconnection.
pub async fn receive_stream<S: ChunkSource + ?Sized>(
    source: &mut S,
    mut receiver: ChunkReceiver,
    observer: &dyn TransferObserver,
) -> Result<VerifiedFile> {
    while receiver.state() == ReceiveState::Receiving {
        let msg = source.next_chunk().await?.ok_or_else(|| {
            SyncError::Disconnected(format!(
                "stream closed after {} bytes without done",
                receiver.received()
            ))
        })?;
        let n = msg.chunk.len() as u64;
        receiver.absorb(msg).await?;
        observer.chunk(n);
    }
    receiver.finalize().await
}

/// A fully received staging file whose digest matched.
pub struct VerifiedFile {
    path: TempPath,
    header: TransferHeader,
    hash: String,
    len: u64,
}

impl VerifiedFile {
    pub fn header(&self) -> &TransferHeader {
        &self.header
    }

    /// Lowercase hex digest of the received bytes.
    pub fn hash(&self) -> &str {
        &self.hash
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Atomically rename the staging file to `dest`, replacing any file there.
    pub async fn place_at(self, dest: &Path) -> Result<()> {
        let dest = dest.to_path_buf();
        let from = self.path.to_path_buf();
        let temp = self.path;
        tokio::task::spawn_blocking(move || temp.persist(&dest))
            .await
            .map_err(|e| SyncError::Io(std::io::Error::other(format!("spawn_blocking failed: {e}"))))?
            .map_err(|e| SyncError::Io(e.error))?;
        tracing::debug!(from = %from.display(), "placed staging file");
        Ok(())
    }
}
