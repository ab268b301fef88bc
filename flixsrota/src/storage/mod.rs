//! Locator resolution.
//!
//! Jobs carry opaque input and output locators; the storage adapter turns
//! them into filesystem paths ffmpeg can read from and write to.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::debug;

use crate::{Error, Result};

/// Variant placeholder understood by the HLS muxer.
pub const VARIANT_PLACEHOLDER: &str = "%v";

/// Playlist path used when an output locator names a directory.
const DEFAULT_VARIANT_PLAYLIST: &str = "v%v/index.m3u8";

#[async_trait]
pub trait StorageAdapter: Send + Sync {
    /// Resolve an input locator to an existing file.
    async fn resolve_input(&self, locator: &str) -> Result<PathBuf>;

    /// Resolve an output locator to a variant playlist path and create the
    /// directories for `variants` renditions.
    async fn prepare_output(&self, locator: &str, variants: usize) -> Result<PathBuf>;

    /// Scratch directory for intermediate files.
    fn temp_dir(&self) -> &Path;
}

/// Storage on the local filesystem.
///
/// Relative locators are joined onto `base_path`; absolute ones are used as-is.
#[derive(Debug, Clone)]
pub struct LocalStorage {
    base_path: PathBuf,
    temp_path: PathBuf,
}

impl LocalStorage {
    /// Create the adapter, creating both directories if needed.
    pub async fn new(base_path: impl Into<PathBuf>, temp_path: impl Into<PathBuf>) -> Result<Self> {
        let base_path = base_path.into();
        let temp_path = temp_path.into();
        ensure_dir_all_with_op("creating base directory", &base_path).await?;
        ensure_dir_all_with_op("creating temp directory", &temp_path).await?;
        Ok(Self {
            base_path,
            temp_path,
        })
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn resolve(&self, locator: &str) -> Result<PathBuf> {
        let locator = locator.trim();
        if locator.is_empty() {
            return Err(Error::validation("locator must not be empty"));
        }
        let path = Path::new(locator);
        Ok(if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_path.join(path)
        })
    }
}

#[async_trait]
impl StorageAdapter for LocalStorage {
    async fn resolve_input(&self, locator: &str) -> Result<PathBuf> {
        let path = self.resolve(locator)?;
        let metadata = tokio::fs::metadata(&path)
            .await
            .map_err(|e| Error::io_path("reading input", &path, e))?;
        if !metadata.is_file() {
            return Err(Error::validation(format!(
                "input '{}' is not a file",
                path.display()
            )));
        }
        Ok(path)
    }

    async fn prepare_output(&self, locator: &str, variants: usize) -> Result<PathBuf> {
        let mut path = self.resolve(locator)?;
        if !locator.contains(VARIANT_PLACEHOLDER) {
            path = path.join(DEFAULT_VARIANT_PLAYLIST);
        }

        let Some(variant_dir) = path.parent() else {
            return Ok(path);
        };
        let template = variant_dir.to_string_lossy();
        for i in 0..variants.max(1) {
            let dir = PathBuf::from(template.replace(VARIANT_PLACEHOLDER, &i.to_string()));
            ensure_dir_all_with_op("creating output directory", &dir).await?;
        }

        debug!(output = %path.display(), variants, "Prepared output");
        Ok(path)
    }

    fn temp_dir(&self) -> &Path {
        &self.temp_path
    }
}

async fn ensure_dir_all_with_op(op: &'static str, path: &Path) -> Result<()> {
    tokio::fs::create_dir_all(path)
        .await
        .map_err(|e| Error::io_path(op, path, e))
}
