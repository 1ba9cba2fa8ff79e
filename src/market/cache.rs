use crate::error::AppError;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheDocument {
    Markets,
    Watchlist,
}

impl CacheDocument {
    pub fn file_name(self) -> &'static str {
        match self {
            Self::Markets => "markets.json",
            Self::Watchlist => "watchlist.json",
        }
    }
}

/// JSON documents under one directory. Writes land in a sibling `.tmp` file that is
/// renamed over the target, so readers never see a half-written document.
#[derive(Debug, Clone)]
pub struct CacheStore {
    dir: PathBuf,
}

impl CacheStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_of(&self, document: CacheDocument) -> PathBuf {
        self.dir.join(document.file_name())
    }

    fn temp_path_of(&self, document: CacheDocument) -> PathBuf {
        self.dir.join(format!("{}.tmp", document.file_name()))
    }

    /// Missing and corrupt documents both read as `None`.
    pub async fn read<T: DeserializeOwned>(&self, document: CacheDocument) -> Option<T> {
        let path = self.path_of(document);
        let mut bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(error) if error.kind() == ErrorKind::NotFound => return None,
            Err(error) => {
                warn!(path = %path.display(), error = %error, "cache read failed");
                return None;
            }
        };

        match simd_json::serde::from_slice::<T>(bytes.as_mut_slice()) {
            Ok(value) => Some(value),
            Err(error) => {
                warn!(path = %path.display(), error = %error, "ignoring corrupt cache document");
                None
            }
        }
    }

    pub async fn write<T: Serialize>(
        &self,
        document: CacheDocument,
        value: &T,
    ) -> Result<(), AppError> {
        tokio::fs::create_dir_all(&self.dir).await?;

        let bytes = simd_json::serde::to_vec(value)?;
        let temp_path = self.temp_path_of(document);
        tokio::fs::write(&temp_path, &bytes).await?;
        tokio::fs::rename(&temp_path, self.path_of(document)).await?;

        debug!(document = document.file_name(), bytes = bytes.len(), "cache document written");
        Ok(())
    }

    pub async fn remove(&self, document: CacheDocument) -> Result<(), AppError> {
        match tokio::fs::remove_file(self.path_of(document)).await {
            Ok(()) => Ok(()),
            Err(error) if error.kind() == ErrorKind::NotFound => Ok(()),
            Err(error) => Err(error.into()),
        }
    }
}
