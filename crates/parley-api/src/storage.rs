use std::path::{Path, PathBuf};

use thiserror::Error;
use tokio::fs;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::{info, warn};
use uuid::Uuid;

use parley_types::models::MediaCategory;

/// Bytes inspected when sniffing a file's content type.
const SNIFF_LEN: usize = 512;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid stored file name: {0}")]
    InvalidName(String),
}

/// A content type the chat accepts, with where it is filed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaKind {
    pub mime: &'static str,
    pub ext: &'static str,
    pub category: MediaCategory,
}

const ALLOWED: &[MediaKind] = &[
    MediaKind { mime: "image/jpeg", ext: ".jpeg", category: MediaCategory::Image },
    MediaKind { mime: "image/png", ext: ".png", category: MediaCategory::Image },
    MediaKind { mime: "image/webp", ext: ".webp", category: MediaCategory::Image },
    MediaKind { mime: "video/mp4", ext: ".mp4", category: MediaCategory::Video },
    MediaKind { mime: "video/webm", ext: ".webm", category: MediaCategory::Video },
    MediaKind { mime: "video/quicktime", ext: ".mov", category: MediaCategory::Video },
    MediaKind { mime: "audio/mpeg", ext: ".mp3", category: MediaCategory::Audio },
    MediaKind { mime: "audio/wav", ext: ".wav", category: MediaCategory::Audio },
    MediaKind { mime: "audio/ogg", ext: ".ogg", category: MediaCategory::Audio },
    MediaKind { mime: "application/pdf", ext: ".pdf", category: MediaCategory::Document },
    MediaKind { mime: "application/msword", ext: ".doc", category: MediaCategory::Document },
    MediaKind {
        mime: "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        ext: ".docx",
        category: MediaCategory::Document,
    },
    MediaKind { mime: "text/plain", ext: ".txt", category: MediaCategory::Document },
];

/// Content type of `data` judged from its leading bytes.
pub fn sniff_mime(data: &[u8]) -> &'static str {
    let head = &data[..data.len().min(SNIFF_LEN)];

    if head.starts_with(&[0xFF, 0xD8, 0xFF]) {
        return "image/jpeg";
    }
    if head.starts_with(b"\x89PNG\r\n\x1a\n") {
        return "image/png";
    }
    if head.len() >= 12 && head.starts_with(b"RIFF") {
        match &head[8..12] {
            b"WEBP" => return "image/webp",
            b"WAVE" => return "audio/wav",
            _ => {}
        }
    }
    if head.len() >= 12 && &head[4..8] == b"ftyp" {
        return match &head[8..12] {
            b"qt  " => "video/quicktime",
            _ => "video/mp4",
        };
    }
    if head.starts_with(&[0x1A, 0x45, 0xDF, 0xA3]) {
        return "video/webm";
    }
    if head.starts_with(b"OggS") {
        return "audio/ogg";
    }
    if head.starts_with(b"ID3") || (head.len() >= 2 && head[0] == 0xFF && head[1] & 0xE0 == 0xE0) {
        return "audio/mpeg";
    }
    if head.starts_with(b"%PDF-") {
        return "application/pdf";
    }
    if head.starts_with(&[0xD0, 0xCF, 0x11, 0xE0, 0xA1, 0xB1, 0x1A, 0xE1]) {
        return "application/msword";
    }
    if head.starts_with(b"PK\x03\x04") {
        if head.windows(5).any(|w| w == b"word/") {
            return "application/vnd.openxmlformats-officedocument.wordprocessingml.document";
        }
        return "application/zip";
    }
    if !head.is_empty() && looks_like_text(head) {
        return "text/plain";
    }
    "application/octet-stream"
}

fn looks_like_text(head: &[u8]) -> bool {
    let binary = head
        .iter()
        .any(|&b| b < 0x20 && !matches!(b, b'\t' | b'\n' | b'\r' | 0x0C | 0x1B));
    if binary {
        return false;
    }
    match std::str::from_utf8(head) {
        Ok(_) => true,
        // A multi-byte character cut off by the sniff window is fine.
        Err(e) => e.error_len().is_none(),
    }
}

/// The accepted kind for `data`, or the sniffed type it was rejected as.
pub fn classify(data: &[u8]) -> Result<MediaKind, &'static str> {
    let mime = sniff_mime(data);
    ALLOWED.iter().find(|k| k.mime == mime).copied().ok_or(mime)
}

/// Private attachment files on local disk, one flat directory, named
/// `<uuid><ext>`.
pub struct MediaStorage {
    dir: PathBuf,
}

impl MediaStorage {
    pub async fn new(upload_root: &Path) -> Result<Self, StorageError> {
        let dir = upload_root.join("private").join("chat_attachment");
        fs::create_dir_all(&dir).await?;
        info!("Chat attachment directory: {}", dir.display());
        Ok(Self { dir })
    }

    /// On-disk path of a stored file. Names that could escape the directory
    /// are refused.
    pub fn path_of(&self, name: &str) -> Result<PathBuf, StorageError> {
        let safe = !name.is_empty()
            && !name.starts_with('.')
            && name.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
        if !safe {
            return Err(StorageError::InvalidName(name.to_string()));
        }
        Ok(self.dir.join(name))
    }

    /// Write `data` under a fresh name and return that name.
    pub async fn save(&self, data: &[u8], ext: &str) -> Result<String, StorageError> {
        let name = format!("{}{}", Uuid::new_v4(), ext);
        let path = self.path_of(&name)?;
        let file = fs::File::create(&path).await?;
        write_or_discard(&path, file, data).await?;
        Ok(name)
    }

    pub async fn delete(&self, name: &str) -> Result<(), StorageError> {
        let path = self.path_of(name)?;
        match fs::remove_file(&path).await {
            Ok(()) => {
                info!("Deleted attachment {}", name);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!("Attachment {} already gone", name);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Best effort: failures are logged, the rest still get deleted.
    pub async fn delete_all(&self, names: &[String]) {
        for name in names {
            if let Err(e) = self.delete(name).await {
                warn!("Failed to delete attachment {}: {}", name, e);
            }
        }
    }
}

/// Write and flush `data` into `file`, which was just created at `path`.
/// A failed write removes the file so no truncated attachment is left behind.
async fn write_or_discard<W>(path: &Path, mut file: W, data: &[u8]) -> Result<(), StorageError>
where
    W: AsyncWrite + Unpin,
{
    let written: std::io::Result<()> = async {
        file.write_all(data).await?;
        file.flush().await
    }
    .await;

    if let Err(e) = written {
        drop(file);
        if let Err(rm) = fs::remove_file(path).await {
            warn!("Failed to remove partial file {}: {}", path.display(), rm);
        }
        return Err(e.into());
    }
    Ok(())
}
