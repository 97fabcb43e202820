//! Firmware image loading and chunking.
//!
//! An image is read and checked once at load time. Chunks are re-read from
//! the source file on demand, so an upload can restart at any chunk index;
//! every re-read chunk is checked against the CRC recorded at load time.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

/// Upgrade files start with `APPUHDR` followed by a format revision digit.
pub const IMAGE_MAGIC: &[u8; 7] = b"APPUHDR";
const HEADER_PREFIX_LEN: usize = 8;
/// Sizes and chunk counts go over the wire as u32.
pub const MAX_IMAGE_SIZE: u64 = u32::MAX as u64;

#[derive(Debug, thiserror::Error)]
pub enum ImageError {
    #[error("Firmware file not found: {0}")]
    FileNotFound(PathBuf),

    #[error("Unreadable firmware format: {0}")]
    UnreadableFormat(String),

    #[error("Integrity check failed: {0}")]
    IntegrityCheckFailed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ImageError>;

/// Loaded, verified firmware image. Immutable for the lifetime of a session.
///
/// Only ever built by [`ImageLoader::load`], so it serializes for snapshots
/// but cannot be deserialized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FirmwareImage {
    pub source_path: PathBuf,
    pub total_size: u64,
    pub chunk_size: usize,
    /// SHA-256 over the whole file.
    #[serde(with = "hex::serde")]
    pub digest: [u8; 32],
    #[serde(skip)]
    chunk_crcs: Vec<u32>,
}

impl FirmwareImage {
    pub fn chunk_count(&self) -> u32 {
        self.chunk_crcs.len() as u32
    }

    /// Identifier announced to the device at INITIALISATION.
    pub fn image_id(&self) -> u32 {
        u32::from_be_bytes([self.digest[0], self.digest[1], self.digest[2], self.digest[3]])
    }

    pub fn digest_hex(&self) -> String {
        hex::encode(self.digest)
    }

    pub fn offset_of(&self, index: u32) -> u64 {
        index as u64 * self.chunk_size as u64
    }

    /// Length of chunk `index`; the last chunk may be short.
    pub fn chunk_len(&self, index: u32) -> usize {
        let remaining = self.total_size.saturating_sub(self.offset_of(index));
        remaining.min(self.chunk_size as u64) as usize
    }

    pub fn chunk_crc(&self, index: u32) -> Option<u32> {
        self.chunk_crcs.get(index as usize).copied()
    }

    /// Sequential reader starting at chunk `start`.
    pub fn chunks_from(self: &Arc<Self>, start: u32) -> ChunkReader {
        ChunkReader {
            image: Arc::clone(self),
            next_index: start,
            file: None,
        }
    }
}

/// One transfer unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub index: u32,
    pub offset: u64,
    pub data: Vec<u8>,
    pub crc: u32,
}

#[derive(Debug, Clone)]
pub struct ImageLoader {
    chunk_size: usize,
    expected_digest: Option<String>,
}

impl ImageLoader {
    pub fn new(chunk_size: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
            expected_digest: None,
        }
    }

    /// Require the image to match this SHA-256 (hex).
    pub fn with_expected_digest(mut self, digest_hex: impl Into<String>) -> Self {
        self.expected_digest = Some(digest_hex.into().trim().to_lowercase());
        self
    }

    /// Read, check and index an image file.
    pub async fn load(&self, path: impl AsRef<Path>) -> Result<FirmwareImage> {
        let path = path.as_ref();
        let metadata = match tokio::fs::metadata(path).await {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ImageError::FileNotFound(path.to_path_buf()))
            }
            Err(e) => return Err(ImageError::Io(e)),
        };
        check_size(metadata.len())?;

        let bytes = tokio::fs::read(path).await?;
        check_header(&bytes)?;

        let digest: [u8; 32] = Sha256::digest(&bytes).into();
        let computed = hex::encode(digest);

        let expected = match &self.expected_digest {
            Some(expected) => Some(expected.clone()),
            None => read_sidecar_digest(path).await?,
        };
        if let Some(expected) = expected {
            if expected != computed {
                log::error!(
                    "Firmware digest mismatch for {} - expected: {}, computed: {}",
                    path.display(),
                    expected,
                    computed
                );
                return Err(ImageError::IntegrityCheckFailed(format!(
                    "SHA-256 mismatch: expected {}, computed {}",
                    expected, computed
                )));
            }
            log::debug!("Firmware digest verified: {}", computed);
        }

        let chunk_crcs = bytes.chunks(self.chunk_size).map(crc32fast::hash).collect::<Vec<_>>();

        log::info!(
            "Loaded firmware image {} ({} bytes, {} chunks of {} bytes)",
            path.display(),
            bytes.len(),
            chunk_crcs.len(),
            self.chunk_size
        );

        Ok(FirmwareImage {
            source_path: path.to_path_buf(),
            total_size: bytes.len() as u64,
            chunk_size: self.chunk_size,
            digest,
            chunk_crcs,
        })
    }
}

fn check_size(len: u64) -> Result<()> {
    if len > MAX_IMAGE_SIZE {
        return Err(ImageError::UnreadableFormat(format!(
            "image of {} bytes exceeds the {} byte limit",
            len, MAX_IMAGE_SIZE
        )));
    }
    Ok(())
}

fn check_header(bytes: &[u8]) -> Result<()> {
    if bytes.len() < HEADER_PREFIX_LEN {
        return Err(ImageError::UnreadableFormat(format!(
            "file too short ({} bytes)",
            bytes.len()
        )));
    }
    if &bytes[..IMAGE_MAGIC.len()] != IMAGE_MAGIC || !bytes[IMAGE_MAGIC.len()].is_ascii_digit() {
        return Err(ImageError::UnreadableFormat(
            "missing APPUHDR upgrade header".to_string(),
        ));
    }
    Ok(())
}

/// `<image>.sha256` next to the image, in `sha256sum` format.
async fn read_sidecar_digest(path: &Path) -> Result<Option<String>> {
    let mut sidecar = path.as_os_str().to_owned();
    sidecar.push(".sha256");

    match tokio::fs::read_to_string(&sidecar).await {
        Ok(content) => {
            let digest = content
                .split_whitespace()
                .next()
                .map(|token| token.to_lowercase())
                .filter(|token| token.len() == 64 && token.chars().all(|c| c.is_ascii_hexdigit()))
                .ok_or_else(|| {
                    ImageError::IntegrityCheckFailed("sidecar digest file is malformed".to_string())
                })?;
            Ok(Some(digest))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(ImageError::Io(e)),
    }
}

/// Restartable chunk sequence over the image's source file.
pub struct ChunkReader {
    image: Arc<FirmwareImage>,
    next_index: u32,
    file: Option<File>,
}

impl ChunkReader {
    pub fn next_index(&self) -> u32 {
        self.next_index
    }

    pub async fn next_chunk(&mut self) -> Result<Option<Chunk>> {
        let index = self.next_index;
        if index >= self.image.chunk_count() {
            return Ok(None);
        }

        let offset = self.image.offset_of(index);
        let len = self.image.chunk_len(index);

        let mut file = match self.file.take() {
            Some(file) => file,
            None => {
                let mut file = File::open(&self.image.source_path).await.map_err(|e| {
                    ImageError::IntegrityCheckFailed(format!("image source unavailable: {}", e))
                })?;
                file.seek(SeekFrom::Start(offset)).await?;
                file
            }
        };

        let mut data = vec![0u8; len];
        file.read_exact(&mut data).await.map_err(|e| {
            ImageError::IntegrityCheckFailed(format!("chunk {} could not be re-read: {}", index, e))
        })?;
        self.file = Some(file);

        let crc = crc32fast::hash(&data);
        if Some(crc) != self.image.chunk_crc(index) {
            return Err(ImageError::IntegrityCheckFailed(format!(
                "chunk {} changed since the image was loaded",
                index
            )));
        }

        self.next_index += 1;
        Ok(Some(Chunk {
            index,
            offset,
            data,
            crc,
        }))
    }
}
