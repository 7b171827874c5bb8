//! Multipart form data
//!
//! Callers hand over [`FormPart`]s, which may borrow live resources such as an open
//! reader or a path on disk. Before a request is journaled every part is materialized
//! into a [`FormItem`]: a tagged value that carries its bytes (inline, or spooled to a
//! content-addressed file) and survives a process restart.
//!
//! Spooled items record only the digest and length of their bytes, so where the spool
//! directory lives never affects a request's id.

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{JournalError, Result, TransportError};

/// Default largest attachment kept inline in the journal (8 MiB)
pub const DEFAULT_INLINE_LIMIT_BYTES: u64 = 8 * 1024 * 1024;

/// Default largest attachment accepted at all (40 MiB)
pub const DEFAULT_MAX_BYTES: u64 = 40 * 1024 * 1024;

/// A multipart part as supplied by a caller
pub enum FormPart {
    Field {
        name: String,
        value: String,
    },
    Binary {
        name: String,
        file_name: Option<String>,
        content_type: Option<String>,
        bytes: Vec<u8>,
    },
    File {
        name: String,
        path: PathBuf,
        content_type: Option<String>,
    },
    Channel {
        name: String,
        file_name: Option<String>,
        content_type: Option<String>,
        reader: Box<dyn AsyncRead + Send + Unpin>,
    },
}

impl FormPart {
    pub fn field(name: impl Into<String>, value: impl Into<String>) -> Self {
        FormPart::Field {
            name: name.into(),
            value: value.into(),
        }
    }

    pub fn binary(name: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        FormPart::Binary {
            name: name.into(),
            file_name: None,
            content_type: None,
            bytes: bytes.into(),
        }
    }

    pub fn file(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        FormPart::File {
            name: name.into(),
            path: path.into(),
            content_type: None,
        }
    }

    pub fn channel(name: impl Into<String>, reader: impl AsyncRead + Send + Unpin + 'static) -> Self {
        FormPart::Channel {
            name: name.into(),
            file_name: None,
            content_type: None,
            reader: Box::new(reader),
        }
    }

    /// Set the file name sent in `Content-Disposition`. File parts use their path's name.
    pub fn with_file_name(mut self, new_name: impl Into<String>) -> Self {
        match &mut self {
            FormPart::Binary { file_name, .. } | FormPart::Channel { file_name, .. } => {
                *file_name = Some(new_name.into());
            }
            FormPart::Field { .. } | FormPart::File { .. } => {}
        }
        self
    }

    pub fn with_content_type(mut self, new_type: impl Into<String>) -> Self {
        match &mut self {
            FormPart::Binary { content_type, .. }
            | FormPart::File { content_type, .. }
            | FormPart::Channel { content_type, .. } => {
                *content_type = Some(new_type.into());
            }
            FormPart::Field { .. } => {}
        }
        self
    }

    pub fn name(&self) -> &str {
        match self {
            FormPart::Field { name, .. }
            | FormPart::Binary { name, .. }
            | FormPart::File { name, .. }
            | FormPart::Channel { name, .. } => name,
        }
    }
}

impl fmt::Debug for FormPart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FormPart::Field { name, value } => f
                .debug_struct("Field")
                .field("name", name)
                .field("value", value)
                .finish(),
            FormPart::Binary { name, bytes, .. } => f
                .debug_struct("Binary")
                .field("name", name)
                .field("len", &bytes.len())
                .finish(),
            FormPart::File { name, path, .. } => f
                .debug_struct("File")
                .field("name", name)
                .field("path", path)
                .finish(),
            FormPart::Channel { name, .. } => f
                .debug_struct("Channel")
                .field("name", name)
                .finish_non_exhaustive(),
        }
    }
}

/// Attachment bytes in a form that can be written to the journal
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "storage", rename_all = "snake_case")]
pub enum StoredBytes {
    /// Base64 of the bytes, with their length
    Inline { len: u64, data: String },

    /// Bytes written to a file in the spool directory, named after their SHA-256 digest
    Spooled { len: u64, sha256: String },
}

impl StoredBytes {
    pub fn len(&self) -> u64 {
        match self {
            StoredBytes::Inline { len, .. } | StoredBytes::Spooled { len, .. } => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Digest of spooled bytes
    pub fn spooled_digest(&self) -> Option<&str> {
        match self {
            StoredBytes::Spooled { sha256, .. } => Some(sha256),
            StoredBytes::Inline { .. } => None,
        }
    }

    /// Read the bytes back, checking them against the recorded length (and digest)
    pub async fn load(&self, spool_dir: Option<&Path>) -> std::result::Result<Vec<u8>, TransportError> {
        let (bytes, expected) = match self {
            StoredBytes::Inline { len, data } => {
                let bytes = BASE64.decode(data).map_err(|e| {
                    TransportError::Attachment(format!("Corrupt inline attachment: {}", e))
                })?;
                (bytes, *len)
            }
            StoredBytes::Spooled { len, sha256 } => {
                let path = spool_dir
                    .map(|dir| dir.join(sha256))
                    .ok_or_else(|| {
                        TransportError::Attachment(format!(
                            "Attachment {} is spooled but no spool directory is configured",
                            sha256
                        ))
                    })?;
                let bytes = tokio::fs::read(&path).await.map_err(|e| {
                    TransportError::Attachment(format!(
                        "Failed to read spooled attachment {}: {}",
                        path.display(),
                        e
                    ))
                })?;
                let digest = format!("{:x}", Sha256::digest(&bytes));
                if &digest != sha256 {
                    return Err(TransportError::Attachment(format!(
                        "Spooled attachment {} does not match its digest",
                        path.display()
                    )));
                }
                (bytes, *len)
            }
        };

        if bytes.len() as u64 != expected {
            return Err(TransportError::Attachment(format!(
                "Attachment length mismatch: expected {} bytes, found {}",
                expected,
                bytes.len()
            )));
        }

        Ok(bytes)
    }
}

/// Binary multipart payload with its disposition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Blob {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    pub bytes: StoredBytes,
}

/// A storable multipart item. The variant records what kind of part it came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FormItem {
    Field { name: String, value: String },
    Binary(Blob),
    File(Blob),
    Channel(Blob),
}

impl FormItem {
    pub fn name(&self) -> &str {
        match self {
            FormItem::Field { name, .. } => name,
            FormItem::Binary(blob) | FormItem::File(blob) | FormItem::Channel(blob) => &blob.name,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            FormItem::Field { .. } => "field",
            FormItem::Binary(_) => "binary",
            FormItem::File(_) => "file",
            FormItem::Channel(_) => "channel",
        }
    }

    pub fn spooled_digest(&self) -> Option<&str> {
        match self {
            FormItem::Field { .. } => None,
            FormItem::Binary(blob) | FormItem::File(blob) | FormItem::Channel(blob) => {
                blob.bytes.spooled_digest()
            }
        }
    }

    /// Resolve the item into a part ready to be sent
    pub async fn load(&self, spool_dir: Option<&Path>) -> std::result::Result<LoadedPart, TransportError> {
        let content = match self {
            FormItem::Field { value, .. } => PartContent::Text(value.clone()),
            FormItem::Binary(blob) | FormItem::File(blob) | FormItem::Channel(blob) => {
                PartContent::Bytes {
                    bytes: blob.bytes.load(spool_dir).await?,
                    file_name: blob.file_name.clone(),
                    content_type: blob.content_type.clone(),
                }
            }
        };

        Ok(LoadedPart {
            name: self.name().to_string(),
            content,
        })
    }
}

/// Canonical JSON encoding of a list of items
pub fn encode_items(items: &[FormItem]) -> Result<String> {
    serde_json::to_string(items)
        .map_err(|e| JournalError::Encoding(format!("form data: {}", e)).into())
}

pub fn decode_items(encoded: &str) -> Result<Vec<FormItem>> {
    serde_json::from_str(encoded)
        .map_err(|e| JournalError::Encoding(format!("form data: {}", e)).into())
}

/// Digests of the spooled items in an encoded form; malformed forms reference nothing
pub fn spooled_digests(encoded: &str) -> HashSet<String> {
    decode_items(encoded)
        .map(|items| {
            items
                .iter()
                .filter_map(|item| item.spooled_digest().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

/// A multipart part with its bytes in memory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedPart {
    pub name: String,
    pub content: PartContent,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PartContent {
    Text(String),
    Bytes {
        bytes: Vec<u8>,
        file_name: Option<String>,
        content_type: Option<String>,
    },
}

/// Limits and placement for attachment bytes captured at journal-write time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachmentPolicy {
    /// Attachments up to this size are stored inline
    pub inline_limit_bytes: u64,

    /// Attachments above this size are rejected
    pub max_bytes: u64,

    /// Directory for larger attachments; without one, everything is inline
    pub spool_dir: Option<PathBuf>,
}

impl Default for AttachmentPolicy {
    fn default() -> Self {
        Self {
            inline_limit_bytes: DEFAULT_INLINE_LIMIT_BYTES,
            max_bytes: DEFAULT_MAX_BYTES,
            spool_dir: None,
        }
    }
}

impl AttachmentPolicy {
    /// Capture every part into a storable item, in order
    pub async fn materialize(
        &self,
        parts: Vec<FormPart>,
    ) -> std::result::Result<Vec<FormItem>, TransportError> {
        let mut items = Vec::with_capacity(parts.len());
        for part in parts {
            items.push(self.materialize_part(part).await?);
        }
        Ok(items)
    }

    async fn materialize_part(&self, part: FormPart) -> std::result::Result<FormItem, TransportError> {
        match part {
            FormPart::Field { name, value } => Ok(FormItem::Field { name, value }),
            FormPart::Binary {
                name,
                file_name,
                content_type,
                bytes,
            } => Ok(FormItem::Binary(Blob {
                name,
                file_name,
                content_type,
                bytes: self.store(bytes).await?,
            })),
            FormPart::File {
                name,
                path,
                content_type,
            } => {
                let metadata = tokio::fs::metadata(&path).await.map_err(|e| {
                    TransportError::Attachment(format!("Failed to read {}: {}", path.display(), e))
                })?;
                if metadata.len() > self.max_bytes {
                    return Err(too_large(metadata.len(), self.max_bytes));
                }

                let bytes = tokio::fs::read(&path).await.map_err(|e| {
                    TransportError::Attachment(format!("Failed to read {}: {}", path.display(), e))
                })?;

                Ok(FormItem::File(Blob {
                    name,
                    file_name: path
                        .file_name()
                        .map(|file_name| file_name.to_string_lossy().into_owned()),
                    content_type: content_type.or_else(|| guess_content_type(&path)),
                    bytes: self.store(bytes).await?,
                }))
            }
            FormPart::Channel {
                name,
                file_name,
                content_type,
                reader,
            } => {
                // One byte past the limit is enough to tell that the channel is too long
                let mut bytes = Vec::new();
                reader
                    .take(self.max_bytes.saturating_add(1))
                    .read_to_end(&mut bytes)
                    .await
                    .map_err(|e| {
                        TransportError::Attachment(format!("Failed to read channel '{}': {}", name, e))
                    })?;

                Ok(FormItem::Channel(Blob {
                    name,
                    file_name,
                    content_type,
                    bytes: self.store(bytes).await?,
                }))
            }
        }
    }

    async fn store(&self, bytes: Vec<u8>) -> std::result::Result<StoredBytes, TransportError> {
        let len = bytes.len() as u64;
        if len > self.max_bytes {
            return Err(too_large(len, self.max_bytes));
        }

        match &self.spool_dir {
            Some(dir) if len > self.inline_limit_bytes => {
                let sha256 = format!("{:x}", Sha256::digest(&bytes));
                let path = dir.join(&sha256);

                if tokio::fs::metadata(&path).await.is_err() {
                    tokio::fs::create_dir_all(dir).await.map_err(|e| {
                        TransportError::Attachment(format!(
                            "Failed to create spool directory {}: {}",
                            dir.display(),
                            e
                        ))
                    })?;
                    tokio::fs::write(&path, &bytes).await.map_err(|e| {
                        TransportError::Attachment(format!(
                            "Failed to spool attachment to {}: {}",
                            path.display(),
                            e
                        ))
                    })?;
                    tracing::debug!("Spooled {} byte attachment to {}", len, path.display());
                }

                Ok(StoredBytes::Spooled { len, sha256 })
            }
            _ => Ok(StoredBytes::Inline {
                len,
                data: BASE64.encode(&bytes),
            }),
        }
    }
}

impl AttachmentPolicy {
    /// Delete the spool files of `released` that nothing in `retained` still uses.
    ///
    /// Returns how many files were removed.
    pub async fn release(&self, released: &HashSet<String>, retained: &HashSet<String>) -> usize {
        let Some(dir) = &self.spool_dir else {
            return 0;
        };

        let mut removed = 0;
        for digest in released.difference(retained) {
            let path = dir.join(digest);
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {
                    tracing::debug!("Removed spooled attachment {}", path.display());
                    removed += 1;
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    tracing::warn!("Failed to remove spooled attachment {}: {}", path.display(), e)
                }
            }
        }
        removed
    }
}

fn too_large(len: u64, max: u64) -> TransportError {
    TransportError::Attachment(format!(
        "Attachment is {} bytes, larger than the {} byte limit",
        len, max
    ))
}

fn guess_content_type(path: &Path) -> Option<String> {
    let extension = path.extension()?.to_str()?.to_ascii_lowercase();
    let content_type = match extension.as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "avif" => "image/avif",
        "mp4" => "video/mp4",
        "webm" => "video/webm",
        "mp3" => "audio/mpeg",
        "ogg" => "audio/ogg",
        "txt" => "text/plain",
        _ => return None,
    };
    Some(content_type.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tempfile::TempDir;

    fn spooling_policy(dir: &TempDir) -> AttachmentPolicy {
        AttachmentPolicy {
            inline_limit_bytes: 4,
            max_bytes: 16,
            spool_dir: Some(dir.path().join("spool")),
        }
    }

    #[test]
    fn test_items_record_their_kind() {
        let items = vec![
            FormItem::Field {
                name: "description".to_string(),
                value: "A cat".to_string(),
            },
            FormItem::Channel(Blob {
                name: "file".to_string(),
                file_name: Some("cat.png".to_string()),
                content_type: None,
                bytes: StoredBytes::Inline {
                    len: 3,
                    data: BASE64.encode(b"cat"),
                },
            }),
        ];

        let encoded = encode_items(&items).unwrap();
        assert!(encoded.contains(r#""kind":"field""#));
        assert!(encoded.contains(r#""kind":"channel""#));
        assert!(encoded.contains(r#""storage":"inline""#));

        let decoded = decode_items(&encoded).unwrap();
        assert_eq!(decoded, items);
        assert_eq!(decoded[1].kind(), "channel");
    }

    #[test]
    fn test_decode_rejects_unknown_kind() {
        let result = decode_items(r#"[{"kind":"socket","name":"x"}]"#);
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_binary_part_is_stored_inline() {
        let policy = AttachmentPolicy::default();
        let items = policy
            .materialize(vec![FormPart::binary("file", b"hello".to_vec())
                .with_file_name("hello.txt")
                .with_content_type("text/plain")])
            .await
            .unwrap();

        let FormItem::Binary(blob) = &items[0] else {
            panic!("Expected a binary item, got {:?}", items[0]);
        };
        assert_eq!(blob.bytes.len(), 5);
        assert!(matches!(blob.bytes, StoredBytes::Inline { .. }));
        assert_eq!(blob.file_name.as_deref(), Some("hello.txt"));

        let loaded = items[0].load(None).await.unwrap();
        assert_eq!(
            loaded.content,
            PartContent::Bytes {
                bytes: b"hello".to_vec(),
                file_name: Some("hello.txt".to_string()),
                content_type: Some("text/plain".to_string()),
            }
        );
    }

    #[tokio::test]
    async fn test_channel_is_captured_at_materialization() {
        let policy = AttachmentPolicy::default();
        let items = policy
            .materialize(vec![FormPart::channel("file", Cursor::new(b"streamed".to_vec()))])
            .await
            .unwrap();

        assert_eq!(items[0].kind(), "channel");
        let loaded = items[0].load(None).await.unwrap();
        match loaded.content {
            PartContent::Bytes { bytes, .. } => assert_eq!(bytes, b"streamed"),
            other => panic!("Expected bytes, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_file_part_takes_name_and_type_from_path() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("avatar.PNG");
        std::fs::write(&path, b"png!").unwrap();

        let items = AttachmentPolicy::default()
            .materialize(vec![FormPart::file("file", &path)])
            .await
            .unwrap();

        let FormItem::File(blob) = &items[0] else {
            panic!("Expected a file item, got {:?}", items[0]);
        };
        assert_eq!(blob.file_name.as_deref(), Some("avatar.PNG"));
        assert_eq!(blob.content_type.as_deref(), Some("image/png"));

        // The original file is no longer needed once captured
        std::fs::remove_file(&path).unwrap();
        assert!(items[0].load(None).await.is_ok());
    }

    #[tokio::test]
    async fn test_missing_file_fails() {
        let result = AttachmentPolicy::default()
            .materialize(vec![FormPart::file("file", "/nonexistent/fedisend/cat.png")])
            .await;

        assert!(matches!(result, Err(TransportError::Attachment(_))));
    }

    #[tokio::test]
    async fn test_large_attachment_is_spooled() {
        let dir = TempDir::new().unwrap();
        let policy = spooling_policy(&dir);

        let items = policy
            .materialize(vec![
                FormPart::binary("small", b"abc".to_vec()),
                FormPart::binary("large", b"0123456789".to_vec()),
            ])
            .await
            .unwrap();

        let FormItem::Binary(small) = &items[0] else {
            panic!("Expected a binary item");
        };
        assert!(matches!(small.bytes, StoredBytes::Inline { .. }));

        let FormItem::Binary(large) = &items[1] else {
            panic!("Expected a binary item");
        };
        let StoredBytes::Spooled { sha256, len } = &large.bytes else {
            panic!("Expected spooled bytes, got {:?}", large.bytes);
        };
        assert_eq!(*len, 10);
        let spool_dir = policy.spool_dir.as_deref();
        assert_eq!(
            std::fs::read(dir.path().join("spool").join(sha256)).unwrap(),
            b"0123456789"
        );
        assert_eq!(large.bytes.load(spool_dir).await.unwrap(), b"0123456789");
        assert!(large.bytes.load(None).await.is_err());
    }

    #[tokio::test]
    async fn test_spool_location_does_not_change_the_form() {
        let first = TempDir::new().unwrap();
        let second = TempDir::new().unwrap();

        let mut encoded = Vec::new();
        for dir in [&first, &second] {
            let items = spooling_policy(dir)
                .materialize(vec![FormPart::binary("file", b"0123456789".to_vec())])
                .await
                .unwrap();
            encoded.push(encode_items(&items).unwrap());
        }

        assert_eq!(encoded[0], encoded[1]);
        assert!(!encoded[0].contains(&first.path().to_string_lossy().to_string()));
        assert_eq!(spooled_digests(&encoded[0]).len(), 1);
    }

    #[tokio::test]
    async fn test_release_keeps_files_still_in_use() {
        let dir = TempDir::new().unwrap();
        let policy = spooling_policy(&dir);
        let items = policy
            .materialize(vec![
                FormPart::binary("kept", b"0123456789".to_vec()),
                FormPart::binary("dropped", b"abcdefghij".to_vec()),
            ])
            .await
            .unwrap();
        let released = spooled_digests(&encode_items(&items).unwrap());
        let kept: HashSet<String> = items[0].spooled_digest().map(str::to_string).into_iter().collect();

        assert_eq!(policy.release(&released, &kept).await, 1);
        assert!(items[0].load(policy.spool_dir.as_deref()).await.is_ok());
        assert!(items[1].load(policy.spool_dir.as_deref()).await.is_err());

        // Already gone: nothing to do
        assert_eq!(policy.release(&released, &kept).await, 0);
    }

    #[tokio::test]
    async fn test_without_spool_dir_everything_is_inline() {
        let policy = AttachmentPolicy {
            inline_limit_bytes: 1,
            max_bytes: 16,
            spool_dir: None,
        };
        let items = policy
            .materialize(vec![FormPart::binary("file", b"0123456789".to_vec())])
            .await
            .unwrap();

        let FormItem::Binary(blob) = &items[0] else {
            panic!("Expected a binary item");
        };
        assert!(matches!(blob.bytes, StoredBytes::Inline { len: 10, .. }));
    }

    #[tokio::test]
    async fn test_oversized_attachments_are_rejected() {
        let dir = TempDir::new().unwrap();
        let policy = spooling_policy(&dir);

        let result = policy
            .materialize(vec![FormPart::binary("file", vec![0u8; 17])])
            .await;
        assert!(matches!(result, Err(TransportError::Attachment(_))));

        let result = policy
            .materialize(vec![FormPart::channel("file", Cursor::new(vec![0u8; 64]))])
            .await;
        assert!(matches!(result, Err(TransportError::Attachment(_))));
    }

    #[tokio::test]
    async fn test_tampered_spool_file_is_detected() {
        let dir = TempDir::new().unwrap();
        let policy = spooling_policy(&dir);
        let items = policy
            .materialize(vec![FormPart::binary("file", b"0123456789".to_vec())])
            .await
            .unwrap();

        let FormItem::Binary(blob) = &items[0] else {
            panic!("Expected a binary item");
        };
        let StoredBytes::Spooled { sha256, .. } = &blob.bytes else {
            panic!("Expected spooled bytes");
        };
        std::fs::write(dir.path().join("spool").join(sha256), b"9876543210").unwrap();

        assert!(items[0].load(policy.spool_dir.as_deref()).await.is_err());
    }

    #[tokio::test]
    async fn test_inline_length_is_checked() {
        let bytes = StoredBytes::Inline {
            len: 4,
            data: BASE64.encode(b"abc"),
        };
        assert!(bytes.load(None).await.is_err());
    }

    #[test]
    fn test_form_part_debug_hides_bytes() {
        let part = FormPart::binary("file", vec![1u8; 1024]);
        let debug = format!("{:?}", part);
        assert!(debug.contains("1024"));
        assert!(!debug.contains("1, 1, 1"));
        assert_eq!(part.name(), "file");
    }
}
