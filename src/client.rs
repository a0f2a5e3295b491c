//! Client side of the RPC surface. Every call opens its own connection.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::net::TcpStream;

use crate::config::{ClientConfig, ClientLayout};
use crate::error::{Result, SyncError, WireError};
use crate::paths;
use crate::protocol::frame;
use crate::session::RemoteNamespace;
use crate::transfer::{
    receive_stream, send_staged, stage_copy, ChunkReceiver, ScratchDir, TransferHeader,
    TransferObserver,
};
use crate::transport::{self, FramedConn};
use crate::wire::{self, Ack, FileEntry, Request};

#[derive(Debug, Clone)]
pub struct RemoteClient {
    addr: String,
    idle_ms: u64,
    scratch: ScratchDir,
    downloads: PathBuf,
}

impl RemoteClient {
    pub fn new(addr: impl Into<String>, idle_ms: u64, layout: &ClientLayout) -> Self {
        Self {
            addr: addr.into(),
            idle_ms,
            scratch: ScratchDir::new(&layout.scratch),
            downloads: layout.downloads.clone(),
        }
    }

    pub fn from_config(config: &ClientConfig) -> Self {
        Self::new(&config.server, config.idle_timeout_ms, &config.layout())
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn downloads(&self) -> &Path {
        &self.downloads
    }

    async fn open(&self, request: &Request) -> Result<FramedConn<TcpStream>> {
        let mut conn = transport::connect(&self.addr, self.idle_ms).await?;
        tracing::debug!(op = request.name(), addr = %self.addr, "sending request");
        conn.send(frame::REQUEST, request).await?;
        Ok(conn)
    }

    async fn ack(&self, request: &Request) -> Result<Ack> {
        let mut conn = self.open(request).await?;
        let payload = conn.expect_frame(frame::OK).await?;
        let ack = wire::decode(&payload)?;
        conn.shutdown().await;
        Ok(ack)
    }

    /// Entries of the folder at canonical path `folder`.
    pub async fn list_folder(&self, folder: &str) -> Result<Vec<FileEntry>> {
        let folder = paths::canonical_folder(folder)?;
        let (parent_path, folder_name) =
            paths::split(&folder).unwrap_or_else(|| (paths::ROOT.to_string(), String::new()));
        let mut conn = self
            .open(&Request::ListFolder {
                parent_path,
                folder_name,
            })
            .await?;
        let mut entries = Vec::new();
        loop {
            let (typ, payload) = conn.read_frame().await?;
            match typ {
                frame::ENTRY => entries.push(wire::decode(&payload)?),
                frame::END => break,
                frame::ERROR => return Err(wire::decode::<WireError>(&payload)?.into()),
                other => {
                    return Err(SyncError::Protocol(format!(
                        "unexpected {} frame in listing",
                        frame::name(other)
                    )))
                }
            }
        }
        conn.shutdown().await;
        Ok(entries)
    }

    /// Download `entry` into the downloads directory. The file only appears
    /// there once its digest has been verified.
    pub async fn download_file(&self, entry: &FileEntry, observer: &dyn TransferObserver) -> Result<PathBuf> {
        paths::validate_name(&entry.filename)?;
        if entry.is_directory {
            return Err(SyncError::InvalidPath(format!("{} is a folder", entry.path())));
        }
        self.scratch.ensure().await?;
        tokio::fs::create_dir_all(&self.downloads).await?;

        let mut conn = self.open(&Request::DownloadFile(entry.clone())).await?;
        observer.started(&entry.filename, None);
        let receiver = ChunkReceiver::new(&self.scratch).await?;
        let verified = receive_stream(&mut conn, receiver, observer).await?;
        if verified.header().filehash != entry.filehash {
            tracing::debug!(
                listed = %entry.filehash,
                streamed = %verified.header().filehash,
                "file changed since it was listed"
            );
        }
        let bytes = verified.len();
        let dest = self.downloads.join(&entry.filename);
        verified.place_at(&dest).await?;
        observer.finished(bytes);
        tracing::info!(path = %entry.path(), dest = %dest.display(), bytes, "downloaded");
        Ok(dest)
    }

    /// Upload the local file at `local` into remote folder `folder`.
    pub async fn upload_file(
        &self,
        local: &Path,
        folder: &str,
        observer: &dyn TransferObserver,
    ) -> Result<FileEntry> {
        let filename = local
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| SyncError::InvalidPath(local.display().to_string()))?
            .to_string();
        paths::validate_name(&filename)?;
        self.scratch.ensure().await?;

        let (staged, filehash, len) = stage_copy(local, &self.scratch).await?;
        let header = TransferHeader {
            folder: paths::canonical_folder(folder)?,
            filename,
            filehash,
        };
        observer.started(&header.filename, Some(len));

        let mut conn = self.open(&Request::UploadFile).await?;
        if let Err(e) = send_staged(staged, &header, &mut conn, observer).await {
            // The server may already have rejected the upload
            return Err(pending_error(&mut conn).await.unwrap_or(e));
        }
        let payload = conn.expect_frame(frame::OK).await?;
        conn.shutdown().await;
        match wire::decode(&payload)? {
            Ack::Uploaded(entry) => {
                observer.finished(len);
                tracing::info!(path = %entry.path(), hash = %entry.filehash, bytes = len, "uploaded");
                Ok(entry)
            }
            other => Err(SyncError::Protocol(format!("unexpected upload ack {other:?}"))),
        }
    }

    pub async fn make_directory(&self, path: &str) -> Result<FileEntry> {
        let path = paths::canonical_folder(path)?;
        match self.ack(&Request::MakeDirectory { path }).await? {
            Ack::Directory(entry) => Ok(entry),
            other => Err(SyncError::Protocol(format!("unexpected mkdir ack {other:?}"))),
        }
    }

    pub async fn remove_file(&self, folder: &str, filename: &str) -> Result<()> {
        let request = Request::RemoveFile {
            folder: paths::canonical_folder(folder)?,
            filename: filename.to_string(),
        };
        self.ack(&request).await.map(|_| ())
    }

    pub async fn remove_directory(&self, path: &str) -> Result<()> {
        let path = paths::canonical_folder(path)?;
        self.ack(&Request::RemoveDirectory { path }).await.map(|_| ())
    }
}

/// An ERROR frame the server sent before the connection broke, if any.
async fn pending_error(conn: &mut FramedConn<TcpStream>) -> Option<SyncError> {
    match conn.read_frame_opt().await {
        Ok(Some((frame::ERROR, payload))) => wire::decode::<WireError>(&payload).ok().map(Into::into),
        _ => None,
    }
}

#[async_trait]
impl RemoteNamespace for RemoteClient {
    async fn list_folder(&self, folder: &str) -> Result<Vec<FileEntry>> {
        RemoteClient::list_folder(self, folder).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::transfer::NoopObserver;

    #[tokio::test]
    async fn unreachable_server_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        // Bind then drop to get a port nobody listens on
        let port = {
            let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap().port()
        };
        let client = RemoteClient::new(
            format!("127.0.0.1:{port}"),
            1_000,
            &ClientLayout::new(dir.path()),
        );
        assert!(client.list_folder("/").await.is_err());
    }

    #[tokio::test]
    async fn folders_cannot_be_downloaded() {
        let dir = tempfile::tempdir().unwrap();
        let client = RemoteClient::new("127.0.0.1:1", 1_000, &ClientLayout::new(dir.path()));
        let entry = FileEntry {
            id: 1,
            is_directory: true,
            folder: "/".into(),
            filename: "docs".into(),
            filehash: String::new(),
            timestamp: 0,
        };
        let err = client.download_file(&entry, &NoopObserver).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidPath);
    }
}
