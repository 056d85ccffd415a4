//! Artifact storage
//!
//! Durable local copies of generated images. The orchestrator hands bytes to
//! an [`ArtifactSink`] under a logical key (the backend-native artifact id)
//! and keeps only the returned [`ArtifactHandle`].

use crate::error::StorageError;
use crate::gateway::ArtifactMetadata;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Handle to a locally stored artifact
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactHandle {
    /// Logical key (backend-native artifact id)
    pub key: String,
    /// blake3 of the stored bytes, hex encoded
    pub content_hash: String,
    pub size_bytes: u64,
    pub path: PathBuf,
}

/// Storage collaborator: store bytes at a logical key, return a handle
pub trait ArtifactSink: Send + Sync {
    fn store(
        &self,
        key: &str,
        bytes: &[u8],
        metadata: &ArtifactMetadata,
    ) -> Result<ArtifactHandle, StorageError>;
}

/// Content-addressed artifact storage on the local filesystem
///
/// Blobs live at `{root}/artifacts/{hex[0..2]}/{hex[2..4]}/{hash}.bin` and
/// identical bytes share one file. Metadata is per key, at
/// `{root}/artifacts/meta/{blake3(key)}.json`.
pub struct FsArtifactStorage {
    root: PathBuf,
}

impl FsArtifactStorage {
    pub fn new<P: AsRef<Path>>(root: P) -> Result<Self, StorageError> {
        let root = root.as_ref().to_path_buf();
        let artifacts_dir = root.join("artifacts");
        fs::create_dir_all(&artifacts_dir).map_err(|e| {
            StorageError::IoError(std::io::Error::new(
                e.kind(),
                format!("Failed to create artifacts directory at {:?}: {}", artifacts_dir, e),
            ))
        })?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Read back stored bytes, verifying the content hash.
    pub fn read(&self, handle: &ArtifactHandle) -> Result<Vec<u8>, StorageError> {
        let bytes = fs::read(&handle.path).map_err(|e| {
            StorageError::IoError(std::io::Error::new(
                e.kind(),
                format!("Failed to read artifact from {:?}: {}", handle.path, e),
            ))
        })?;
        let actual = blake3::hash(&bytes).to_hex().to_string();
        if actual != handle.content_hash {
            return Err(StorageError::IoError(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!(
                    "Artifact {} is corrupt: expected hash {}, got {}",
                    handle.key, handle.content_hash, actual
                ),
            )));
        }
        Ok(bytes)
    }

    /// Metadata stored alongside the artifact at `key`.
    pub fn read_metadata(&self, key: &str) -> Result<ArtifactMetadata, StorageError> {
        let path = self.metadata_path(key);
        let bytes = fs::read(&path).map_err(|e| {
            StorageError::IoError(std::io::Error::new(
                e.kind(),
                format!("Failed to read artifact metadata from {:?}: {}", path, e),
            ))
        })?;
        serde_json::from_slice(&bytes).map_err(|e| {
            StorageError::IoError(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("Failed to parse artifact metadata for {}: {}", key, e),
            ))
        })
    }

    fn metadata_path(&self, key: &str) -> PathBuf {
        let key_hash = blake3::hash(key.as_bytes()).to_hex();
        self.root
            .join("artifacts")
            .join("meta")
            .join(format!("{}.json", key_hash))
    }

    fn blob_path(&self, hash_hex: &str) -> PathBuf {
        self.root
            .join("artifacts")
            .join(&hash_hex[0..2])
            .join(&hash_hex[2..4])
            .join(format!("{}.bin", hash_hex))
    }
}

impl ArtifactSink for FsArtifactStorage {
    fn store(
        &self,
        key: &str,
        bytes: &[u8],
        metadata: &ArtifactMetadata,
    ) -> Result<ArtifactHandle, StorageError> {
        if key.is_empty() {
            return Err(StorageError::InvalidPath("empty artifact key".to_string()));
        }

        let hash_hex = blake3::hash(bytes).to_hex().to_string();
        let blob_path = self.blob_path(&hash_hex);
        let handle = ArtifactHandle {
            key: key.to_string(),
            content_hash: hash_hex,
            size_bytes: bytes.len() as u64,
            path: blob_path.clone(),
        };

        let metadata_path = self.metadata_path(key);
        for dir in [blob_path.parent(), metadata_path.parent()].into_iter().flatten() {
            fs::create_dir_all(dir).map_err(|e| {
                StorageError::IoError(std::io::Error::new(
                    e.kind(),
                    format!("Failed to create parent directory {:?}: {}", dir, e),
                ))
            })?;
        }

        if !blob_path.exists() {
            write_atomic(&blob_path, bytes)?;
        }

        let sidecar = serde_json::to_vec_pretty(metadata).map_err(|e| {
            StorageError::IoError(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("Failed to serialize artifact metadata: {}", e),
            ))
        })?;
        write_atomic(&metadata_path, &sidecar)?;

        Ok(handle)
    }
}

/// Write to `{path}.tmp`, then rename over the final path.
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StorageError> {
    let mut temp_name = path.as_os_str().to_owned();
    temp_name.push(".tmp");
    let temp_path = PathBuf::from(temp_name);

    fs::write(&temp_path, bytes).map_err(|e| {
        StorageError::IoError(std::io::Error::new(
            e.kind(),
            format!("Failed to write {:?}: {}", temp_path, e),
        ))
    })?;

    fs::rename(&temp_path, path).map_err(|e| {
        let _ = fs::remove_file(&temp_path);
        StorageError::IoError(std::io::Error::new(
            e.kind(),
            format!("Failed to rename temp file to {:?}: {}", path, e),
        ))
    })
}
