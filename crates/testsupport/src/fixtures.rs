use anyhow::{Context, Result};
use dockhand_models::{Config, EnvironmentDescriptor};
use flate2::write::GzEncoder;
use flate2::Compression;
use sha2::{Digest, Sha256};
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// The reference service: one pinned dependency, `python app.py` in `/app`
/// on port 5000.
pub const SERVICE_BUILD_FILE: &str = r#"# reference service
FROM python:3.11.9-slim-bookworm
ENV APP_HOME=/app
WORKDIR $APP_HOME

COPY requirements.txt requirements.lock ./
RUN test -f requirements.lock

COPY . .
EXPOSE 5000
ENTRYPOINT ["python", "app.py"]
"#;

pub const SERVICE_BASE: &str = "python:3.11.9-slim-bookworm";

pub const SERVICE_APP: &str = "print('address book')\n";

/// A file or symlink to place in a fixture archive.
pub struct ArchiveFile<'a> {
    pub path: &'a str,
    pub content: &'a [u8],
    pub mode: u32,
    /// Symlink target; `content` is ignored when set.
    pub link: Option<&'a str>,
}

impl<'a> ArchiveFile<'a> {
    pub fn new(path: &'a str, content: &'a [u8]) -> Self {
        Self {
            path,
            content,
            mode: 0o644,
            link: None,
        }
    }

    pub fn executable(path: &'a str, content: &'a [u8]) -> Self {
        Self {
            path,
            content,
            mode: 0o755,
            link: None,
        }
    }

    pub fn symlink(path: &'a str, target: &'a str) -> Self {
        Self {
            path,
            content: b"",
            mode: 0o777,
            link: Some(target),
        }
    }
}

pub fn gzip_tar(files: &[ArchiveFile<'_>]) -> Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());
    for file in files {
        let mut header = tar::Header::new_gnu();
        header.set_mode(file.mode);
        header.set_mtime(1_700_000_000);
        match file.link {
            Some(target) => {
                header.set_entry_type(tar::EntryType::Symlink);
                header.set_size(0);
                builder.append_link(&mut header, file.path, target)?;
            }
            None => {
                header.set_size(file.content.len() as u64);
                builder.append_data(&mut header, file.path, file.content)?;
            }
        }
    }
    let tar = builder.into_inner()?;

    let mut gz = GzEncoder::new(Vec::new(), Compression::default());
    gz.write_all(&tar)?;
    Ok(gz.finish()?)
}

pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

pub fn read_json(path: &Path) -> Result<serde_json::Value> {
    let data = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    Ok(serde_json::from_slice(&data)?)
}

/// Scratch workspace with a build context, base catalog, package index,
/// layer store and output directory, plus a `Config` pointing at them.
#[derive(Debug)]
pub struct TestWorkspace {
    pub root: TempDir,
    pub config: Config,
}

impl TestWorkspace {
    pub fn new() -> Result<Self> {
        let root = tempfile::tempdir()?;
        let path = root.path();

        let mut config = Config::default();
        config.store.dir = dir(path, "store")?;
        config.base.catalog_dir = dir(path, "bases")?;
        config.dependencies.index = dir(path, "index")?;
        config.output.dir = dir(path, "images")?;
        std::fs::create_dir_all(path.join("context"))?;

        Ok(Self { root, config })
    }

    pub fn context_dir(&self) -> PathBuf {
        self.root.path().join("context")
    }

    pub fn index_dir(&self) -> PathBuf {
        PathBuf::from(&self.config.dependencies.index)
    }

    pub fn write_context_file(&self, relative: &str, content: &str) -> Result<PathBuf> {
        let path = self.context_dir().join(relative);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, content)?;
        Ok(path)
    }

    pub fn remove_context_file(&self, relative: &str) -> Result<()> {
        std::fs::remove_file(self.context_dir().join(relative))?;
        Ok(())
    }

    /// Adds a minimal root filesystem for `reference` to the base catalog.
    /// Like real python images, `python` is a symlink to `python3`.
    pub fn add_base(&self, reference: &str) -> Result<PathBuf> {
        let descriptor = EnvironmentDescriptor::parse(reference)?;
        let os_release = format!("ID=dockhand-fixture\nRUNTIME={descriptor}\n");
        let archive = gzip_tar(&[
            ArchiveFile::new("etc/os-release", os_release.as_bytes()),
            ArchiveFile::executable("usr/local/bin/python3", b"#!/bin/sh\nexit 0\n"),
            ArchiveFile::symlink("usr/local/bin/python", "python3"),
        ])?;

        let path = PathBuf::from(&self.config.base.catalog_dir).join(descriptor.archive_name());
        std::fs::write(&path, archive)?;
        Ok(path)
    }

    /// Publishes `name==version` to the local index. Returns the archive's
    /// sha256 for use in `--hash` pins.
    pub fn add_package(&self, name: &str, version: &str, files: &[(&str, &str)]) -> Result<String> {
        let entries: Vec<ArchiveFile<'_>> = files
            .iter()
            .map(|(path, content)| ArchiveFile::new(path, content.as_bytes()))
            .collect();
        let archive = gzip_tar(&entries)?;

        let package_dir = self.index_dir().join(name);
        std::fs::create_dir_all(&package_dir)?;
        std::fs::write(package_dir.join(format!("{version}.tar.gz")), &archive)?;
        Ok(sha256_hex(&archive))
    }

    /// Writes the reference service context. `hashed` pins the package hash
    /// in the lock file.
    pub fn write_service_context(&self, hashed: bool) -> Result<()> {
        let hash = self.add_package("x", "1.2.3", &[("x/__init__.py", "VERSION = '1.2.3'\n")])?;

        self.write_context_file("Dockhandfile", SERVICE_BUILD_FILE)?;
        self.write_context_file("app.py", SERVICE_APP)?;
        self.write_context_file("requirements.txt", "X==1.2.3\n")?;
        let lock = if hashed {
            format!("x==1.2.3 \\\n    --hash=sha256:{hash}\n")
        } else {
            "x==1.2.3\n".to_string()
        };
        self.write_context_file("requirements.lock", &lock)?;
        self.write_context_file(".dockerignore", "__pycache__/\n*.pyc\n")?;
        self.add_base(SERVICE_BASE)?;
        Ok(())
    }

    /// Serializes the workspace config as `dockhand.toml` under the root.
    pub fn write_config_file(&self) -> Result<PathBuf> {
        let path = self.root.path().join("dockhand.toml");
        std::fs::write(&path, toml::to_string(&self.config)?)?;
        Ok(path)
    }
}

fn dir(root: &Path, name: &str) -> Result<String> {
    let path = root.join(name);
    std::fs::create_dir_all(&path)?;
    Ok(path.to_string_lossy().into_owned())
}
