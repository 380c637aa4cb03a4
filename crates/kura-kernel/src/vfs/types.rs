//! Core namespace types.
//!
//! Inodes serialize to the same JSON shape whether they are persisted to the
//! `inodes` store or announced to replicas: `{"type": "file" | "dir", ...}`.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use kura_cas::Digest;

/// Default MIME type for raw bytes.
pub const OCTET_STREAM: &str = "application/octet-stream";

/// Default MIME type for text content.
pub const TEXT_PLAIN: &str = "text/plain";

/// Type of a namespace entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum InodeType {
    /// Regular file.
    File,
    /// Directory.
    Dir,
}

/// Metadata record for one path.
///
/// Timestamps are milliseconds since the Unix epoch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Inode {
    /// Directory.
    Dir {
        /// Creation time.
        cdate: i64,
        /// Last modification time.
        mdate: i64,
    },
    /// Regular file.
    File {
        /// Creation time.
        cdate: i64,
        /// Last modification time.
        mdate: i64,
        /// Size in bytes.
        size: u64,
        /// Ordered block digests; concatenated they form the content.
        blocks: Vec<Digest>,
        /// MIME type.
        #[serde(default = "default_mime")]
        mime: String,
        /// Chunk size the content was split with.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        chunk_size: Option<u64>,
    },
}

fn default_mime() -> String {
    OCTET_STREAM.to_string()
}

impl Inode {
    /// Create a directory inode.
    pub fn dir(cdate: i64, mdate: i64) -> Self {
        Inode::Dir { cdate, mdate }
    }

    /// Create a file inode.
    pub fn file(
        cdate: i64,
        mdate: i64,
        size: u64,
        blocks: Vec<Digest>,
        mime: impl Into<String>,
        chunk_size: Option<u64>,
    ) -> Self {
        Inode::File {
            cdate,
            mdate,
            size,
            blocks,
            mime: mime.into(),
            chunk_size,
        }
    }

    /// Entry type.
    pub fn kind(&self) -> InodeType {
        match self {
            Inode::Dir { .. } => InodeType::Dir,
            Inode::File { .. } => InodeType::File,
        }
    }

    /// Returns true if this is a regular file.
    pub fn is_file(&self) -> bool {
        matches!(self, Inode::File { .. })
    }

    /// Returns true if this is a directory.
    pub fn is_dir(&self) -> bool {
        matches!(self, Inode::Dir { .. })
    }

    /// Creation time.
    pub fn cdate(&self) -> i64 {
        match self {
            Inode::Dir { cdate, .. } | Inode::File { cdate, .. } => *cdate,
        }
    }

    /// Last modification time.
    pub fn mdate(&self) -> i64 {
        match self {
            Inode::Dir { mdate, .. } | Inode::File { mdate, .. } => *mdate,
        }
    }

    /// Size in bytes (zero for directories).
    pub fn size(&self) -> u64 {
        match self {
            Inode::Dir { .. } => 0,
            Inode::File { size, .. } => *size,
        }
    }

    /// Block digests (empty for directories).
    pub fn blocks(&self) -> &[Digest] {
        match self {
            Inode::Dir { .. } => &[],
            Inode::File { blocks, .. } => blocks,
        }
    }

    /// Copy of this inode with new timestamps.
    pub fn restamped(&self, cdate: i64, mdate: i64) -> Self {
        let mut inode = self.clone();
        match &mut inode {
            Inode::Dir { cdate: c, mdate: m } | Inode::File { cdate: c, mdate: m, .. } => {
                *c = cdate;
                *m = mdate;
            }
        }
        inode
    }

    /// Copy of this inode with a new modification time.
    pub fn touched(&self, mdate: i64) -> Self {
        self.restamped(self.cdate(), mdate)
    }
}

/// Deletion marker carried by delete events and replicated to peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tombstone {
    /// When the deletion was recorded.
    pub ctime: i64,
    /// Deletion time compared against inode `mdate`s.
    pub mtime: i64,
}

impl Tombstone {
    /// Tombstone stamped at `time`.
    pub fn at(time: i64) -> Self {
        Self {
            ctime: time,
            mtime: time,
        }
    }
}

/// Content accepted by `write_file`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileContent {
    /// Raw bytes (`application/octet-stream`).
    Bytes(Vec<u8>),
    /// UTF-8 text (`text/plain`).
    Text(String),
    /// Bytes with an explicit MIME type.
    Blob {
        /// Content.
        data: Vec<u8>,
        /// MIME type.
        mime: String,
    },
}

impl FileContent {
    /// Bytes with an explicit MIME type.
    pub fn blob(data: impl Into<Vec<u8>>, mime: impl Into<String>) -> Self {
        FileContent::Blob {
            data: data.into(),
            mime: mime.into(),
        }
    }

    /// Split into raw bytes and MIME type.
    pub fn into_parts(self) -> (Vec<u8>, String) {
        match self {
            FileContent::Bytes(data) => (data, OCTET_STREAM.to_string()),
            FileContent::Text(text) => (text.into_bytes(), TEXT_PLAIN.to_string()),
            FileContent::Blob { data, mime } => (data, mime),
        }
    }
}

impl From<Vec<u8>> for FileContent {
    fn from(data: Vec<u8>) -> Self {
        FileContent::Bytes(data)
    }
}

impl From<&[u8]> for FileContent {
    fn from(data: &[u8]) -> Self {
        FileContent::Bytes(data.to_vec())
    }
}

impl<const N: usize> From<&[u8; N]> for FileContent {
    fn from(data: &[u8; N]) -> Self {
        FileContent::Bytes(data.to_vec())
    }
}

impl From<String> for FileContent {
    fn from(text: String) -> Self {
        FileContent::Text(text)
    }
}

impl From<&str> for FileContent {
    fn from(text: &str) -> Self {
        FileContent::Text(text.to_string())
    }
}

/// Reconstructed file returned by `read_file`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileHandle {
    /// Absolute path the file was read from.
    pub path: String,
    /// Final path component.
    pub name: String,
    /// MIME type.
    pub mime: String,
    /// Last modification time.
    pub last_modified: i64,
    /// Content.
    pub data: Vec<u8>,
}

impl FileHandle {
    /// Content length in bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns true if the file is empty.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Content as UTF-8.
    pub fn text(&self) -> Result<&str, std::str::Utf8Error> {
        std::str::from_utf8(&self.data)
    }

    /// Consume the handle, returning the content.
    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }
}

/// Inode metadata without the block list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Metainfo {
    /// Absolute path.
    pub path: String,
    /// Entry type.
    #[serde(rename = "type")]
    pub kind: InodeType,
    /// Creation time.
    pub cdate: i64,
    /// Last modification time.
    pub mdate: i64,
    /// Size in bytes (files only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    /// MIME type (files only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mime: Option<String>,
}

impl Metainfo {
    /// Build metainfo for `inode` at `path`.
    pub fn new(path: impl Into<String>, inode: &Inode) -> Self {
        let (size, mime) = match inode {
            Inode::Dir { .. } => (None, None),
            Inode::File { size, mime, .. } => (Some(*size), Some(mime.clone())),
        };
        Self {
            path: path.into(),
            kind: inode.kind(),
            cdate: inode.cdate(),
            mdate: inode.mdate(),
            size,
            mime,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inode_json_shape() {
        let dir = Inode::dir(1, 2);
        let json = serde_json::to_value(&dir).unwrap();
        assert_eq!(json, serde_json::json!({"type": "dir", "cdate": 1, "mdate": 2}));

        let file = Inode::file(1, 2, 3, vec!["abc".into()], TEXT_PLAIN, None);
        let json = serde_json::to_value(&file).unwrap();
        assert_eq!(json["type"], "file");
        assert_eq!(json["blocks"][0], "abc");
        assert!(json.get("chunk_size").is_none());
    }

    #[test]
    fn test_file_mime_defaults() {
        let json = r#"{"type":"file","cdate":0,"mdate":0,"size":0,"blocks":[]}"#;
        let inode: Inode = serde_json::from_str(json).unwrap();
        assert!(matches!(inode, Inode::File { ref mime, .. } if mime == OCTET_STREAM));
    }

    #[test]
    fn test_restamp() {
        let inode = Inode::dir(1, 2).touched(9);
        assert_eq!(inode.cdate(), 1);
        assert_eq!(inode.mdate(), 9);
        assert_eq!(inode.restamped(5, 6), Inode::dir(5, 6));
    }

    #[test]
    fn test_content_parts() {
        assert_eq!(
            FileContent::from("hi").into_parts(),
            (b"hi".to_vec(), TEXT_PLAIN.to_string())
        );
        assert_eq!(
            FileContent::from(vec![1u8]).into_parts(),
            (vec![1], OCTET_STREAM.to_string())
        );
        assert_eq!(
            FileContent::blob(vec![2u8], "image/png").into_parts(),
            (vec![2], "image/png".to_string())
        );
    }

    #[test]
    fn test_inode_type_strings() {
        assert_eq!(InodeType::File.to_string(), "file");
        assert_eq!("dir".parse::<InodeType>().unwrap(), InodeType::Dir);
    }
}
