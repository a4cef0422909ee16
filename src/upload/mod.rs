//! Multipart upload validation and conflict-safe persistence.
//!
//! [`UploadedFile`] collects one file from a multipart form; "no file
//! submitted" is represented, not an error. [`Uploader`] wraps the maybe-file
//! with a target directory and a generated destination name, validates size
//! and sniffed MIME type, and persists with refuse-to-overwrite semantics.
//! Failed deletes can be parked on a cache-backed queue for out-of-band
//! retry.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use axum::body::Bytes;
use axum::extract::Multipart;
use axum::http::StatusCode;
use bytesize::ByteSize;
use thiserror::Error;
use tokio::fs;
use tracing::{debug, warn};

use crate::cache::CacheStore;
use crate::error::HttpError;

/// Upload failures.
#[derive(Debug, Error)]
pub enum UploadError {
    /// The destination already exists; nothing was written.
    #[error("{} file exists", .0.display())]
    Conflict(PathBuf),

    /// A size bound string didn't parse.
    #[error("invalid size bound {bound:?}: {reason}")]
    InvalidSize { bound: String, reason: String },

    /// The multipart stream failed mid-read.
    #[error("failed to read multipart field: {0}")]
    Multipart(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<UploadError> for HttpError {
    fn from(err: UploadError) -> Self {
        let status = match &err {
            UploadError::Conflict(_) => StatusCode::CONFLICT,
            UploadError::Multipart(_) => StatusCode::BAD_REQUEST,
            UploadError::InvalidSize { .. } | UploadError::Io(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        HttpError::with_status(err.to_string(), status)
    }
}

/// One file collected from a multipart form.
#[derive(Debug, Clone)]
pub struct UploadedFile {
    /// Form field the file arrived under.
    pub field: String,
    /// Client-supplied file name.
    pub file_name: String,
    /// Declared content type; informational only, validation sniffs bytes.
    pub content_type: Option<String>,
    pub bytes: Bytes,
}

impl UploadedFile {
    /// Collect the named file field from a multipart form.
    ///
    /// Returns `Ok(None)` when the field is absent.
    pub async fn from_multipart(
        multipart: &mut Multipart,
        field: &str,
    ) -> Result<Option<Self>, UploadError> {
        while let Some(part) = multipart
            .next_field()
            .await
            .map_err(|err| UploadError::Multipart(err.to_string()))?
        {
            if part.name() != Some(field) {
                continue;
            }

            let file_name = part.file_name().unwrap_or(field).to_string();
            let content_type = part.content_type().map(str::to_string);
            let bytes = part
                .bytes()
                .await
                .map_err(|err| UploadError::Multipart(err.to_string()))?;

            return Ok(Some(Self {
                field: field.to_string(),
                file_name,
                content_type,
                bytes,
            }));
        }
        Ok(None)
    }
}

/// Destination name generation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum NamingScheme {
    /// `{unix-millis}-{unique}-{sanitized-name}`.
    #[default]
    Timestamped,
    /// First free `{stem}-{n}.{ext}` in the target directory.
    Numbered,
}

/// Cache-backed queue of paths whose deletion failed.
#[derive(Clone)]
pub struct ReclaimQueue {
    store: Arc<dyn CacheStore>,
    queue: String,
}

impl ReclaimQueue {
    pub fn new(store: Arc<dyn CacheStore>, queue: impl Into<String>) -> Self {
        Self {
            store,
            queue: queue.into(),
        }
    }

    /// Park a path for out-of-band deletion.
    pub async fn push(&self, path: &str) -> Result<()> {
        self.store.enqueue(&self.queue, path).await
    }

    /// Take the oldest parked path, if any.
    pub async fn pop(&self) -> Result<Option<String>> {
        self.store.dequeue(&self.queue).await
    }
}

impl std::fmt::Debug for ReclaimQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReclaimQueue")
            .field("queue", &self.queue)
            .finish()
    }
}

/// Uploader behavior knobs.
#[derive(Clone, Debug, Default)]
pub struct UploadConfig {
    pub naming: NamingScheme,
    /// Path prefix excluded from public URLs.
    pub url_prefix: String,
    /// Deferred-delete queue; without one, failed deletes are only logged.
    pub reclaim: Option<ReclaimQueue>,
}

/// Wraps one possibly-absent uploaded file with save/delete lifecycle.
pub struct Uploader {
    file: Option<UploadedFile>,
    root: PathBuf,
    name: String,
    saved: bool,
    config: UploadConfig,
}

impl Uploader {
    /// Create an uploader for the given target directory.
    ///
    /// Numbered naming probes the directory for the first free name, so
    /// construction can do IO.
    pub async fn new(
        root: impl Into<PathBuf>,
        file: Option<UploadedFile>,
        config: UploadConfig,
    ) -> Result<Self, UploadError> {
        let root = root.into();
        let name = match &file {
            None => String::new(),
            Some(file) => match config.naming {
                NamingScheme::Timestamped => timestamped_name(&file.file_name),
                NamingScheme::Numbered => numbered_name(&root, &file.file_name).await?,
            },
        };

        Ok(Self {
            file,
            root,
            name,
            saved: false,
            config,
        })
    }

    /// Whether a file was actually submitted.
    pub fn has_file(&self) -> bool {
        self.file.is_some()
    }

    pub fn file(&self) -> Option<&UploadedFile> {
        self.file.as_ref()
    }

    /// Destination path; None when no file was submitted.
    pub fn path(&self) -> Option<PathBuf> {
        self.file.as_ref()?;
        Some(self.root.join(&self.name))
    }

    /// Public URL for the saved file, with the configured prefix stripped.
    pub fn url(&self) -> Option<String> {
        let path = self.path()?;
        let path = path.to_string_lossy().replace('\\', "/");
        let prefix = self.config.url_prefix.trim_end_matches('/');
        let trimmed = path.strip_prefix(prefix).unwrap_or(&path);
        Some(format!("/{}", trimmed.trim_start_matches('/')))
    }

    /// Whether the file size falls within the closed `[min, max]` interval.
    ///
    /// Bounds are human-readable sizes ("1KB", "10MB"). A missing file is
    /// simply out of bounds, not an error.
    pub fn validate_size(&self, min: &str, max: &str) -> Result<bool, UploadError> {
        let Some(file) = &self.file else {
            return Ok(false);
        };

        let min = parse_size(min)?;
        let max = parse_size(max)?;
        let size = file.bytes.len() as u64;
        Ok(size >= min && size <= max)
    }

    /// Whether the sniffed content type is in the allow-list.
    ///
    /// The client-declared type is never consulted.
    pub fn validate_mime(&self, allowed: &[&str]) -> bool {
        let Some(file) = &self.file else {
            return false;
        };
        let Some(kind) = infer::get(&file.bytes) else {
            return false;
        };
        allowed
            .iter()
            .any(|mime| mime.eq_ignore_ascii_case(kind.mime_type()))
    }

    /// Persist the file, refusing to overwrite an existing destination.
    ///
    /// No-op without a file or once saved.
    pub async fn save(&mut self) -> Result<(), UploadError> {
        let Some(file) = &self.file else {
            return Ok(());
        };
        if self.saved {
            return Ok(());
        }

        let dest = self.root.join(&self.name);
        if fs::try_exists(&dest).await? {
            return Err(UploadError::Conflict(dest));
        }

        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&dest, &file.bytes).await?;

        debug!(path = ?dest, size = file.bytes.len(), "upload saved");
        self.saved = true;
        Ok(())
    }

    /// Remove the saved file. An already-absent file counts as success.
    pub async fn delete(&self) -> Result<(), UploadError> {
        if self.file.is_none() || !self.saved {
            return Ok(());
        }

        let dest = self.root.join(&self.name);
        match fs::remove_file(&dest).await {
            Ok(()) => {
                debug!(path = ?dest, "upload deleted");
                Ok(())
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Delete, parking the path on the reclaim queue instead of failing.
    pub async fn safe_delete(&self) {
        let Err(err) = self.delete().await else {
            return;
        };
        warn!(error = %err, "failed to delete upload");

        let Some(queue) = &self.config.reclaim else {
            return;
        };
        if let Some(path) = self.path()
            && let Err(err) = queue.push(&path.to_string_lossy()).await
        {
            warn!(error = %err, "failed to queue upload for deferred delete");
        }
    }
}

impl std::fmt::Debug for Uploader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Uploader")
            .field("root", &self.root)
            .field("name", &self.name)
            .field("saved", &self.saved)
            .field("has_file", &self.file.is_some())
            .finish()
    }
}

fn parse_size(bound: &str) -> Result<u64, UploadError> {
    bound
        .parse::<ByteSize>()
        .map(|size| size.as_u64())
        .map_err(|reason| UploadError::InvalidSize {
            bound: bound.to_string(),
            reason,
        })
}

/// `{unix-millis}-{unique}-{sanitized}` destination name.
///
/// The random component keeps same-millisecond uploads from colliding.
fn timestamped_name(file_name: &str) -> String {
    let unique = uuid::Uuid::new_v4().simple().to_string();
    format!(
        "{}-{}-{}",
        chrono::Utc::now().timestamp_millis(),
        &unique[..8],
        sanitize_filename(file_name)
    )
}

/// First free `{stem}-{n}.{ext}` in the target directory.
async fn numbered_name(root: &Path, file_name: &str) -> Result<String, UploadError> {
    let sanitized = sanitize_filename(file_name);
    let (stem, ext) = match sanitized.rsplit_once('.') {
        Some((stem, ext)) => (stem.to_string(), format!(".{ext}")),
        None => (sanitized, String::new()),
    };

    let mut n: u32 = 1;
    loop {
        let candidate = format!("{stem}-{n}{ext}");
        if !fs::try_exists(&root.join(&candidate)).await? {
            return Ok(candidate);
        }
        n += 1;
    }
}

/// Strip path components and unsafe characters from a client file name.
pub(crate) fn sanitize_filename(filename: &str) -> String {
    let name = Path::new(filename)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(filename);

    name.chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '.' | '-' | '_' => c,
            _ => '_',
        })
        .collect::<String>()
        .chars()
        .take(200)
        .collect()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    const PNG_MAGIC: &[u8] = &[0x89, b'P', b'N', b'G', 0x0d, 0x0a, 0x1a, 0x0a, 0, 0, 0, 0];

    fn file_of(len: usize) -> UploadedFile {
        UploadedFile {
            field: "file".to_string(),
            file_name: "report.bin".to_string(),
            content_type: Some("application/octet-stream".to_string()),
            bytes: Bytes::from(vec![0u8; len]),
        }
    }

    async fn uploader_in(dir: &Path, file: Option<UploadedFile>) -> Uploader {
        Uploader::new(dir, file, UploadConfig::default())
            .await
            .unwrap()
    }

    #[test]
    fn test_sanitize_filename() {
        assert_eq!(sanitize_filename("test.jpg"), "test.jpg");
        assert_eq!(sanitize_filename("my file.jpg"), "my_file.jpg");
        assert_eq!(sanitize_filename("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_filename("test<script>.jpg"), "test_script_.jpg");
    }

    #[tokio::test]
    async fn test_validate_size_bounds() {
        let dir = tempfile::tempdir().unwrap();

        let empty = uploader_in(dir.path(), Some(file_of(0))).await;
        assert!(!empty.validate_size("1KB", "1MB").unwrap());

        let eleven_mb = uploader_in(dir.path(), Some(file_of(11 * 1024 * 1024))).await;
        assert!(!eleven_mb.validate_size("1KB", "1MB").unwrap());

        let five_hundred_kb = uploader_in(dir.path(), Some(file_of(500 * 1024))).await;
        assert!(five_hundred_kb.validate_size("1KB", "1MB").unwrap());
    }

    #[tokio::test]
    async fn test_validate_size_without_file_is_false_not_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = uploader_in(dir.path(), None).await;
        assert!(!missing.validate_size("1KB", "1MB").unwrap());
    }

    #[tokio::test]
    async fn test_validate_size_rejects_bad_bound() {
        let dir = tempfile::tempdir().unwrap();
        let uploader = uploader_in(dir.path(), Some(file_of(10))).await;
        assert!(matches!(
            uploader.validate_size("one kilobyte", "1MB"),
            Err(UploadError::InvalidSize { .. })
        ));
    }

    #[tokio::test]
    async fn test_validate_mime_sniffs_content() {
        let dir = tempfile::tempdir().unwrap();
        let file = UploadedFile {
            field: "file".to_string(),
            file_name: "fake.txt".to_string(),
            content_type: Some("text/plain".to_string()),
            bytes: Bytes::from_static(PNG_MAGIC),
        };
        let uploader = uploader_in(dir.path(), Some(file)).await;

        // Declared text/plain is ignored; the bytes say PNG.
        assert!(uploader.validate_mime(&["image/png"]));
        assert!(!uploader.validate_mime(&["text/plain"]));
    }

    #[tokio::test]
    async fn test_save_refuses_to_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let mut uploader = uploader_in(dir.path(), Some(file_of(10))).await;

        let dest = uploader.path().unwrap();
        fs::write(&dest, b"existing").await.unwrap();

        let err = uploader.save().await.unwrap_err();
        assert!(matches!(err, UploadError::Conflict(_)));
        assert_eq!(fs::read(&dest).await.unwrap(), b"existing");
    }

    #[tokio::test]
    async fn test_save_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let mut uploader = uploader_in(dir.path(), Some(file_of(10))).await;
        uploader.save().await.unwrap();

        let dest = uploader.path().unwrap();
        fs::write(&dest, b"tampered").await.unwrap();
        uploader.save().await.unwrap();
        assert_eq!(fs::read(&dest).await.unwrap(), b"tampered");
    }

    #[tokio::test]
    async fn test_delete_tolerates_absent_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut uploader = uploader_in(dir.path(), Some(file_of(10))).await;
        uploader.save().await.unwrap();

        let dest = uploader.path().unwrap();
        fs::remove_file(&dest).await.unwrap();

        uploader.delete().await.unwrap();
    }

    #[tokio::test]
    async fn test_delete_skips_unsaved() {
        let dir = tempfile::tempdir().unwrap();
        let uploader = uploader_in(dir.path(), Some(file_of(10))).await;
        uploader.delete().await.unwrap();
    }

    #[tokio::test]
    async fn test_numbered_names_advance() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("report-1.bin"), b"x").await.unwrap();

        let config = UploadConfig {
            naming: NamingScheme::Numbered,
            ..UploadConfig::default()
        };
        let uploader = Uploader::new(dir.path(), Some(file_of(10)), config)
            .await
            .unwrap();
        assert!(uploader.path().unwrap().ends_with("report-2.bin"));
    }

    #[tokio::test]
    async fn test_url_strips_prefix() {
        let config = UploadConfig {
            url_prefix: "storage".to_string(),
            ..UploadConfig::default()
        };
        let uploader = Uploader::new("storage/uploads", Some(file_of(1)), config)
            .await
            .unwrap();
        let url = uploader.url().unwrap();
        assert!(url.starts_with("/uploads/"));
    }

    #[tokio::test]
    async fn test_safe_delete_queues_failures() {
        use crate::cache::MemoryStore;

        let store = Arc::new(MemoryStore::new());
        let queue = ReclaimQueue::new(store.clone(), "upload:reclaim");

        // Point the uploader at a directory that is actually a file, so
        // the delete fails with something other than NotFound.
        let dir = tempfile::tempdir().unwrap();
        let bogus_root = dir.path().join("not-a-dir");
        fs::write(&bogus_root, b"x").await.unwrap();

        let config = UploadConfig {
            reclaim: Some(queue.clone()),
            ..UploadConfig::default()
        };
        let mut uploader = Uploader::new(&bogus_root, Some(file_of(1)), config)
            .await
            .unwrap();
        // Force the saved flag by attempting a save; it fails (root is a
        // file), so fabricate the state transition delete needs.
        uploader.saved = true;

        uploader.safe_delete().await;
        let parked = queue.pop().await.unwrap();
        let expected = uploader.path().unwrap().to_string_lossy().to_string();
        assert_eq!(parked.as_deref(), Some(expected.as_str()));
    }
}
