//! File abstraction consumed by the upload engine.

use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;

use tokio::io::{AsyncReadExt, AsyncSeekExt};

/// Future returned by [`UploadSource`] methods.
pub type SourceFuture<'a, T> = Pin<Box<dyn Future<Output = io::Result<T>> + Send + 'a>>;

/// A single file to upload: identity attributes plus ranged byte reads.
///
/// The size is fixed for the duration of an upload, and `read_range(start,
/// end)` must return exactly `end - start` bytes for any range within
/// `[0, len)`.
pub trait UploadSource: Send + Sync {
    /// File name used for fingerprinting (not a path).
    fn name(&self) -> &str;

    /// Size in bytes as known at construction, or `None` when unknown.
    fn size_hint(&self) -> Option<u64>;

    /// MIME type, if known.
    fn content_type(&self) -> Option<&str>;

    /// Resolves the definitive byte length, reading the source if its size
    /// was unknown (or reported as zero) at construction.
    fn resolve_len(&self) -> SourceFuture<'_, u64>;

    /// Reads bytes `[start, end)`.
    fn read_range(&self, start: u64, end: u64) -> SourceFuture<'_, Vec<u8>>;
}

// ---------------------------------------------------------------------------
// FileSource
// ---------------------------------------------------------------------------

/// Upload source backed by a file on disk.
///
/// Each range read reopens the file, so a file that disappears between
/// chunks surfaces as an I/O error on the next read.
#[derive(Debug, Clone)]
pub struct FileSource {
    path: PathBuf,
    name: String,
    size: u64,
    content_type: Option<String>,
}

impl FileSource {
    /// Opens `path`, capturing its current length and guessing the MIME
    /// type from the extension.
    pub async fn open(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        let meta = tokio::fs::metadata(&path).await?;
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .map(str::to_string)
            .ok_or_else(|| {
                io::Error::new(io::ErrorKind::InvalidInput, "path has no file name")
            })?;
        let content_type = content_type_for(&path).map(str::to_string);
        Ok(Self {
            path,
            name,
            size: meta.len(),
            content_type,
        })
    }

    /// Path of the underlying file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl UploadSource for FileSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn size_hint(&self) -> Option<u64> {
        Some(self.size)
    }

    fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    fn resolve_len(&self) -> SourceFuture<'_, u64> {
        Box::pin(async move { Ok(tokio::fs::metadata(&self.path).await?.len()) })
    }

    fn read_range(&self, start: u64, end: u64) -> SourceFuture<'_, Vec<u8>> {
        Box::pin(async move {
            let mut file = tokio::fs::File::open(&self.path).await?;
            file.seek(io::SeekFrom::Start(start)).await?;
            let mut buf = vec![0u8; end.saturating_sub(start) as usize];
            file.read_exact(&mut buf).await?;
            Ok(buf)
        })
    }
}

/// Guesses a MIME type from the file extension.
fn content_type_for(path: &Path) -> Option<&'static str> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase());

    match ext.as_deref() {
        Some("txt") => Some("text/plain"),
        Some("html" | "htm") => Some("text/html"),
        Some("json") => Some("application/json"),
        Some("pdf") => Some("application/pdf"),
        Some("zip") => Some("application/zip"),
        Some("png") => Some("image/png"),
        Some("jpg" | "jpeg") => Some("image/jpeg"),
        Some("webp") => Some("image/webp"),
        Some("gif") => Some("image/gif"),
        Some("mp4") => Some("video/mp4"),
        Some("webm") => Some("video/webm"),
        Some("mp3") => Some("audio/mpeg"),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// BytesSource
// ---------------------------------------------------------------------------

/// In-memory upload source, for small payloads and tests.
#[derive(Debug, Clone)]
pub struct BytesSource {
    name: String,
    data: Vec<u8>,
    content_type: Option<String>,
}

impl BytesSource {
    /// Creates a source over an owned buffer.
    pub fn new(name: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            data,
            content_type: None,
        }
    }

    /// Sets the MIME type.
    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }
}

impl UploadSource for BytesSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn size_hint(&self) -> Option<u64> {
        Some(self.data.len() as u64)
    }

    fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    fn resolve_len(&self) -> SourceFuture<'_, u64> {
        Box::pin(async move { Ok(self.data.len() as u64) })
    }

    fn read_range(&self, start: u64, end: u64) -> SourceFuture<'_, Vec<u8>> {
        Box::pin(async move {
            let len = self.data.len() as u64;
            if start > end || end > len {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("range [{start}, {end}) out of bounds for {len} bytes"),
                ));
            }
            Ok(self.data[start as usize..end as usize].to_vec())
        })
    }
}
