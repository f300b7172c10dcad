//! Base environment acquisition.

use async_trait::async_trait;
use dockhand_models::{DockhandError, EnvironmentDescriptor};
use std::path::PathBuf;
use tracing::{info, instrument};

/// Supplies the root filesystem for a base environment as a gzip tarball.
#[async_trait]
pub trait BaseEnvironmentProvider: Send + Sync {
    async fn fetch(&self, descriptor: &EnvironmentDescriptor) -> Result<Vec<u8>, DockhandError>;
}

/// Serves bases from a local directory of `<runtime>-<version>-<os>.tar.gz`
/// archives.
pub struct CatalogProvider {
    catalog_dir: PathBuf,
}

impl CatalogProvider {
    pub fn new(catalog_dir: impl Into<PathBuf>) -> Self {
        Self {
            catalog_dir: catalog_dir.into(),
        }
    }
}

#[async_trait]
impl BaseEnvironmentProvider for CatalogProvider {
    #[instrument(skip(self), fields(base = %descriptor))]
    async fn fetch(&self, descriptor: &EnvironmentDescriptor) -> Result<Vec<u8>, DockhandError> {
        let path = self.catalog_dir.join(descriptor.archive_name());

        let data = tokio::fs::read(&path)
            .await
            .map_err(|e| DockhandError::BaseUnavailable {
                descriptor: descriptor.to_string(),
                reason: format!("{}: {e}", path.display()),
            })?;

        info!(
            base = %descriptor,
            archive = %path.display(),
            bytes = data.len(),
            "Base environment fetched"
        );
        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_catalog_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let descriptor = EnvironmentDescriptor::parse("python:3.11.9-slim").unwrap();
        std::fs::write(dir.path().join(descriptor.archive_name()), b"archive").unwrap();

        let provider = CatalogProvider::new(dir.path());
        assert_eq!(provider.fetch(&descriptor).await.unwrap(), b"archive");

        let missing = EnvironmentDescriptor::parse("python:3.12.0-slim").unwrap();
        match provider.fetch(&missing).await {
            Err(DockhandError::BaseUnavailable { descriptor, .. }) => {
                assert_eq!(descriptor, "python:3.12.0-slim")
            }
            other => panic!("unexpected: {other:?}"),
        }
    }
}
