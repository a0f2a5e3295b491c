//! Payload types carried inside frames (bincode-encoded).

use serde::{Deserialize, Serialize};

use crate::namespace::NamespaceEntry;

/// One namespace entry as seen by clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub id: i64,
    pub is_directory: bool,
    pub folder: String,
    pub filename: String,
    pub filehash: String,
    pub timestamp: i64,
}

impl FileEntry {
    /// Canonical absolute path of the entry.
    pub fn path(&self) -> String {
        crate::paths::join(&self.folder, &self.filename)
    }
}

impl From<NamespaceEntry> for FileEntry {
    fn from(entry: NamespaceEntry) -> Self {
        FileEntry {
            id: entry.id,
            is_directory: entry.is_directory,
            folder: entry.parent_path,
            filename: entry.name,
            filehash: entry.content_hash,
            timestamp: entry.created_at,
        }
    }
}

/// One chunk of a file transfer. Folder, filename and hash are repeated on
/// every message; there is no separate header frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileBytesMessage {
    pub folder: String,
    pub filename: String,
    pub filehash: String,
    pub chunk: Vec<u8>,
    pub done: bool,
}

/// First frame of every connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Request {
    ListFolder {
        parent_path: String,
        folder_name: String,
    },
    DownloadFile(FileEntry),
    UploadFile,
    MakeDirectory {
        path: String,
    },
    RemoveFile {
        folder: String,
        filename: String,
    },
    RemoveDirectory {
        path: String,
    },
}

impl Request {
    pub fn name(&self) -> &'static str {
        match self {
            Request::ListFolder { .. } => "ListFolder",
            Request::DownloadFile(_) => "DownloadFile",
            Request::UploadFile => "UploadFile",
            Request::MakeDirectory { .. } => "MakeDirectory",
            Request::RemoveFile { .. } => "RemoveFile",
            Request::RemoveDirectory { .. } => "RemoveDirectory",
        }
    }
}

/// Payload of a successful OK frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Ack {
    Done,
    Uploaded(FileEntry),
    Directory(FileEntry),
}

pub fn encode<T: Serialize>(value: &T) -> crate::error::Result<Vec<u8>> {
    Ok(bincode::serialize(value)?)
}

pub fn decode<T: serde::de::DeserializeOwned>(payload: &[u8]) -> crate::error::Result<T> {
    Ok(bincode::deserialize(payload)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_path_joins_folder_and_name() {
        let entry = FileEntry {
            id: 3,
            is_directory: false,
            folder: "/docs".into(),
            filename: "report.txt".into(),
            filehash: String::new(),
            timestamp: 0,
        };
        assert_eq!(entry.path(), "/docs/report.txt");
    }

    #[test]
    fn empty_final_chunk_survives_encoding() {
        let msg = FileBytesMessage {
            folder: "/".into(),
            filename: "a".into(),
            filehash: "00".into(),
            chunk: Vec::new(),
            done: true,
        };
        let back: FileBytesMessage = decode(&encode(&msg).unwrap()).unwrap();
        assert!(back.chunk.is_empty());
        assert!(back.done);
    }

    #[test]
    fn garbage_payload_is_a_codec_error() {
        let err = decode::<Request>(&[0xff, 0xff, 0xff, 0xff, 0xff]).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Protocol);
    }
}
