//! Lock-exact dependency installation.
//!
//! Packages are gzip tarballs addressed by normalized name and exact version.
//! Each one is checked against the lock's pinned hashes before it is unpacked
//! into the install prefix.

use crate::lockfile::{LockFile, PinnedPackage};
use async_trait::async_trait;
use dockhand_models::{DependenciesConfig, DockhandError};
use flate2::read::GzDecoder;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, instrument};

/// Record written into the install prefix after a successful install.
pub const INSTALL_RECORD: &str = ".dockhand-installed.json";

#[async_trait]
pub trait PackageIndex: Send + Sync {
    /// Raw archive bytes for an exact pin.
    async fn fetch(&self, package: &PinnedPackage) -> Result<Vec<u8>, DockhandError>;

    fn describe(&self) -> String;
}

/// `<root>/<normalized-name>/<version>.tar.gz`
pub struct LocalIndex {
    root: PathBuf,
}

impl LocalIndex {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl PackageIndex for LocalIndex {
    async fn fetch(&self, package: &PinnedPackage) -> Result<Vec<u8>, DockhandError> {
        let path = self
            .root
            .join(&package.name)
            .join(format!("{}.tar.gz", package.version));

        tokio::fs::read(&path)
            .await
            .map_err(|e| DockhandError::PackageUnavailable {
                package: package.name.clone(),
                version: package.version.clone(),
                reason: format!("{}: {e}", path.display()),
            })
    }

    fn describe(&self) -> String {
        self.root.display().to_string()
    }
}

/// Same layout as [`LocalIndex`], served over HTTP.
pub struct HttpIndex {
    base_url: String,
    client: reqwest::Client,
}

impl HttpIndex {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl PackageIndex for HttpIndex {
    async fn fetch(&self, package: &PinnedPackage) -> Result<Vec<u8>, DockhandError> {
        let url = format!(
            "{}/{}/{}.tar.gz",
            self.base_url, package.name, package.version
        );
        let unavailable = |reason: String| DockhandError::PackageUnavailable {
            package: package.name.clone(),
            version: package.version.clone(),
            reason,
        };

        debug!(url = %url, "Fetching package");
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| unavailable(e.to_string()))?;

        if !response.status().is_success() {
            return Err(unavailable(format!("{url} returned {}", response.status())));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| unavailable(e.to_string()))?;
        Ok(bytes.to_vec())
    }

    fn describe(&self) -> String {
        self.base_url.clone()
    }
}

/// `http(s)://` selects [`HttpIndex`]; anything else is a local directory.
pub fn index_from_config(config: &DependenciesConfig) -> Arc<dyn PackageIndex> {
    if config.index.starts_with("http://") || config.index.starts_with("https://") {
        Arc::new(HttpIndex::new(&config.index))
    } else {
        Arc::new(LocalIndex::new(&config.index))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct InstallReport {
    /// `name==version`, in lock order.
    pub installed: Vec<String>,
    pub files: usize,
}

#[async_trait]
pub trait DependencyInstaller: Send + Sync {
    /// Installs exactly the lock's pins into `prefix`, a host directory.
    async fn install(&self, lock: &LockFile, prefix: &Path)
        -> Result<InstallReport, DockhandError>;
}

pub struct IndexInstaller {
    index: Arc<dyn PackageIndex>,
}

impl IndexInstaller {
    pub fn new(index: Arc<dyn PackageIndex>) -> Self {
        Self { index }
    }
}

#[async_trait]
impl DependencyInstaller for IndexInstaller {
    #[instrument(skip(self, lock), fields(index = %self.index.describe(), packages = lock.packages.len()))]
    async fn install(
        &self,
        lock: &LockFile,
        prefix: &Path,
    ) -> Result<InstallReport, DockhandError> {
        tokio::fs::create_dir_all(prefix).await?;

        let mut report = InstallReport::default();
        for package in &lock.packages {
            let archive = self.index.fetch(package).await?;
            verify_hash(package, &archive)?;

            let dest = prefix.to_path_buf();
            let files = tokio::task::spawn_blocking(move || unpack_package(&archive, &dest))
                .await
                .map_err(|e| DockhandError::InternalError {
                    reason: e.to_string(),
                })?
                .map_err(|reason| DockhandError::InstallFailed {
                    reason: format!("{}: {reason}", package.pin()),
                })?;

            info!(
                package = %package.name,
                version = %package.version,
                files = files,
                "Installed package"
            );
            report.installed.push(package.pin());
            report.files += files;
        }

        let record = serde_json::to_vec_pretty(&lock.packages).map_err(|e| {
            DockhandError::InternalError {
                reason: e.to_string(),
            }
        })?;
        tokio::fs::write(prefix.join(INSTALL_RECORD), record).await?;

        Ok(report)
    }
}

fn verify_hash(package: &PinnedPackage, archive: &[u8]) -> Result<(), DockhandError> {
    if package.hashes.is_empty() {
        return Ok(());
    }
    let mut hasher = Sha256::new();
    hasher.update(archive);
    let actual = format!("{:x}", hasher.finalize());

    if package.hashes.iter().any(|h| h == &actual) {
        Ok(())
    } else {
        Err(DockhandError::HashMismatch {
            package: package.name.clone(),
            version: package.version.clone(),
            actual,
        })
    }
}

/// Unpacks one archive, refusing entries that would leave `dest`.
fn unpack_package(archive: &[u8], dest: &Path) -> Result<usize, String> {
    let mut tar = tar::Archive::new(GzDecoder::new(archive));
    let mut files = 0;
    for entry in tar.entries().map_err(|e| e.to_string())? {
        let mut entry = entry.map_err(|e| e.to_string())?;
        let is_file = entry.header().entry_type().is_file();
        // unpack_in skips entries with `..` or absolute paths.
        if !entry.unpack_in(dest).map_err(|e| e.to_string())? {
            let path = entry
                .path()
                .map(|p| p.display().to_string())
                .unwrap_or_default();
            return Err(format!("archive entry escapes install prefix: {path}"));
        }
        if is_file {
            files += 1;
        }
    }
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    fn package_archive(files: &[(&str, &str)]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        for (path, content) in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(content.len() as u64);
            header.set_mode(0o644);
            builder
                .append_data(&mut header, path, content.as_bytes())
                .unwrap();
        }
        let tar = builder.into_inner().unwrap();
        let mut gz = GzEncoder::new(Vec::new(), Compression::default());
        gz.write_all(&tar).unwrap();
        gz.finish().unwrap()
    }

    fn sha(data: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(data);
        format!("{:x}", hasher.finalize())
    }

    fn index_with(root: &Path, name: &str, version: &str, archive: &[u8]) {
        std::fs::create_dir_all(root.join(name)).unwrap();
        std::fs::write(root.join(name).join(format!("{version}.tar.gz")), archive).unwrap();
    }

    #[tokio::test]
    async fn test_install_from_local_index() {
        let index = tempfile::tempdir().unwrap();
        let prefix = tempfile::tempdir().unwrap();
        let archive = package_archive(&[("x/__init__.py", "VERSION = '1.2.3'\n")]);
        index_with(index.path(), "x", "1.2.3", &archive);

        let lock = LockFile::parse(
            "requirements.lock",
            &format!("x==1.2.3 --hash=sha256:{}", sha(&archive)),
        )
        .unwrap();

        let installer = IndexInstaller::new(Arc::new(LocalIndex::new(index.path())));
        let report = installer.install(&lock, prefix.path()).await.unwrap();

        assert_eq!(report.installed, vec!["x==1.2.3"]);
        assert_eq!(report.files, 1);
        assert!(prefix.path().join("x/__init__.py").is_file());

        let record: Vec<PinnedPackage> = serde_json::from_slice(
            &std::fs::read(prefix.path().join(INSTALL_RECORD)).unwrap(),
        )
        .unwrap();
        assert_eq!(record, lock.packages);
    }

    #[tokio::test]
    async fn test_hash_mismatch_is_rejected() {
        let index = tempfile::tempdir().unwrap();
        let prefix = tempfile::tempdir().unwrap();
        index_with(
            index.path(),
            "x",
            "1.2.3",
            &package_archive(&[("x/__init__.py", "tampered")]),
        );

        let lock = LockFile::parse("l", &format!("x==1.2.3 --hash=sha256:{}", "0".repeat(64)))
            .unwrap();
        let installer = IndexInstaller::new(Arc::new(LocalIndex::new(index.path())));
        let err = installer.install(&lock, prefix.path()).await.unwrap_err();
        assert!(matches!(err, DockhandError::HashMismatch { .. }));
        assert!(!prefix.path().join("x").exists());
    }

    #[tokio::test]
    async fn test_missing_package() {
        let index = tempfile::tempdir().unwrap();
        let prefix = tempfile::tempdir().unwrap();
        let lock = LockFile::parse("l", "x==9.9.9").unwrap();
        let installer = IndexInstaller::new(Arc::new(LocalIndex::new(index.path())));
        let err = installer.install(&lock, prefix.path()).await.unwrap_err();
        assert!(matches!(err, DockhandError::PackageUnavailable { .. }));
    }

    #[test]
    fn test_index_from_config() {
        let mut config = DependenciesConfig::default();
        config.index = "https://packages.example.test/simple/".to_string();
        assert_eq!(
            index_from_config(&config).describe(),
            "https://packages.example.test/simple"
        );
        config.index = "/srv/index".to_string();
        assert_eq!(index_from_config(&config).describe(), "/srv/index");
    }
}
