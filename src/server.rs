//! Daemon side: accept loop and per-request handlers.
//!
//! Each connection carries exactly one request and is served on its own task
//! inside a span tagged with a fresh `request_id`.

use std::future::Future;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tracing::Instrument;
use uuid::Uuid;

use crate::commit::CommitCoordinator;
use crate::config::ServerConfig;
use crate::error::{Result, SyncError};
use crate::namespace::NamespaceStore;
use crate::protocol::frame;
use crate::reconcile::{self, ReconcileReport};
use crate::transfer::{receive_stream, send_staged, ChunkReceiver, ChunkSource, NoopObserver, ScratchDir};
use crate::transport::FramedConn;
use crate::wire::{self, Ack, FileEntry, Request};

pub struct Server {
    coordinator: Arc<CommitCoordinator>,
    idle_ms: u64,
}

impl Server {
    /// Prepare the on-disk layout, open the namespace, sweep stale staging
    /// files and run a reconciliation pass.
    pub async fn open(config: &ServerConfig) -> Result<Self> {
        let layout = config.layout();
        layout.create().await?;
        let store = NamespaceStore::open(&layout.database).await?;
        let scratch = ScratchDir::new(&layout.scratch);
        scratch.sweep().await?;

        let coordinator = CommitCoordinator::new(store, &layout.content, scratch);
        let report = reconcile::reconcile(&coordinator, config.repair_on_start).await?;
        if !report.is_clean() && !config.repair_on_start {
            tracing::warn!(
                found = report.discrepancies.len(),
                "namespace and content tree disagree; start with repair_on_start to fix"
            );
        }
        Ok(Self {
            coordinator: Arc::new(coordinator),
            idle_ms: config.idle_timeout_ms,
        })
    }

    pub fn coordinator(&self) -> &CommitCoordinator {
        &self.coordinator
    }

    /// Re-run reconciliation against the live store.
    pub async fn reconcile(&self, apply: bool) -> Result<ReconcileReport> {
        reconcile::reconcile(&self.coordinator, apply).await
    }

    /// Accept connections until `shutdown` resolves.
    pub async fn serve<F>(self, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        if let Ok(addr) = listener.local_addr() {
            tracing::info!(addr = %addr, "filesync daemon listening");
        }
        tokio::pin!(shutdown);
        loop {
            let (stream, peer) = tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        tracing::warn!(error = %e, "accept failed");
                        continue;
                    }
                },
                _ = &mut shutdown => {
                    tracing::info!("shutting down");
                    return Ok(());
                }
            };
            let _ = stream.set_nodelay(true);
            let coordinator = self.coordinator.clone();
            let idle_ms = self.idle_ms;
            let span = tracing::info_span!("conn", request_id = %Uuid::new_v4(), peer = %peer);
            tokio::spawn(
                async move {
                    let mut conn = FramedConn::new(stream, idle_ms);
                    handle_connection(&mut conn, &coordinator).await;
                    conn.shutdown().await;
                }
                .instrument(span),
            );
        }
    }
}

/// Serve a single request on `conn`. Failures are logged and, where the
/// connection still works, reported to the client as an ERROR frame.
pub async fn handle_connection<S>(conn: &mut FramedConn<S>, coordinator: &CommitCoordinator)
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let request = match conn.expect_frame(frame::REQUEST).await {
        Ok(payload) => wire::decode::<Request>(&payload),
        Err(e) => Err(e),
    };
    let result = match request {
        Ok(request) => {
            let op = request.name();
            tracing::debug!(op, "request received");
            dispatch(conn, coordinator, request).await.map(|_| op)
        }
        Err(e) => Err(e),
    };
    match result {
        Ok(op) => tracing::debug!(op, "request completed"),
        Err(e) => {
            tracing::warn!(error = %e, kind = %e.kind(), "request failed");
            if !matches!(e, SyncError::Disconnected(_) | SyncError::Timeout(_)) {
                if let Err(send_err) = conn.send_error(&e).await {
                    tracing::debug!(error = %send_err, "could not report error to client");
                }
            }
        }
    }
}

async fn dispatch<S>(conn: &mut FramedConn<S>, c: &CommitCoordinator, request: Request) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    match request {
        Request::ListFolder {
            parent_path,
            folder_name,
        } => {
            let entries = c.list_folder(&parent_path, &folder_name).await?;
            for entry in entries {
                conn.send(frame::ENTRY, &FileEntry::from(entry)).await?;
            }
            conn.write_frame(frame::END, &[]).await
        }
        Request::DownloadFile(entry) => {
            let (staged, header) = c.stage_download(&entry.folder, &entry.filename).await?;
            send_staged(staged, &header, conn, &NoopObserver).await?;
            Ok(())
        }
        Request::UploadFile => {
            let first = conn.next_chunk().await?.ok_or_else(|| {
                SyncError::Disconnected("upload closed before first chunk".to_string())
            })?;
            c.check_upload_target(&first.folder).await?;
            let mut receiver = ChunkReceiver::new(c.scratch()).await?;
            receiver.absorb(first).await?;
            let verified = receive_stream(conn, receiver, &NoopObserver).await?;
            let entry = c.commit_upload(verified).await?;
            conn.send(frame::OK, &Ack::Uploaded(entry.into())).await
        }
        Request::MakeDirectory { path } => {
            let entry = c.make_directory(&path).await?;
            conn.send(frame::OK, &Ack::Directory(entry.into())).await
        }
        Request::RemoveFile { folder, filename } => {
            c.remove_file(&folder, &filename).await?;
            conn.send(frame::OK, &Ack::Done).await
        }
        Request::RemoveDirectory { path } => {
            c.remove_directory(&path).await?;
            conn.send(frame::OK, &Ack::Done).await
        }
    }
}
