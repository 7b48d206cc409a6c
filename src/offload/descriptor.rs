use crate::core::errors::{BuildError, Result};
use std::path::Path;
use tempfile::{Builder, TempPath};
use tracing::debug;

/// A `<prefix><random>.json` file handed to an external tool; removed when dropped.
#[derive(Debug)]
pub struct DescriptorFile {
    path: TempPath,
}

impl DescriptorFile {
    /// Create an empty descriptor for a tool to fill in.
    pub fn empty(dir: &Path, prefix: &str) -> Result<Self> {
        let path = Builder::new()
            .prefix(prefix)
            .suffix(".json")
            .rand_bytes(10)
            .tempfile_in(dir)
            .map_err(|e| BuildError::io(format!("create descriptor in {}", dir.display()), e))?
            .into_temp_path();
        Ok(Self { path })
    }

    /// Create a descriptor holding `contents`.
    pub async fn create(dir: &Path, prefix: &str, contents: &[u8]) -> Result<Self> {
        let file = Self::empty(dir, prefix)?;
        tokio::fs::write(file.path(), contents)
            .await
            .map_err(|e| BuildError::io(format!("write {}", file.path().display()), e))?;
        debug!(path = %file.path().display(), bytes = contents.len(), "Wrote descriptor file");
        Ok(file)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// True once something has been written into the file.
    pub fn has_contents(&self) -> bool {
        std::fs::metadata(self.path())
            .map(|meta| meta.len() > 0)
            .unwrap_or(false)
    }
}
