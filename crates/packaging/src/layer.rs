//! Deterministic layer archives.
//!
//! A layer is a directory tree sealed into a tar stream with sorted entries
//! and zeroed timestamps and ownership. Directories are 0755. Files keep
//! their permission bits minus group/other write, so umask differences do not
//! leak into digests. Symlinks are stored as links with their target as-is.
//! The tar is then gzip-compressed with a zero header mtime, so the same tree
//! always yields the same digest.

use dockhand_models::{DockhandError, StageKind};
use flate2::read::GzDecoder;
use flate2::{Compression, GzBuilder};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::io::Write;
use std::path::Path;
use tracing::{debug, instrument};

pub const LAYER_MEDIA_TYPE: &str = "application/vnd.oci.image.layer.v1.tar+gzip";

#[derive(Debug, Clone)]
pub struct SealedLayer {
    pub stage: StageKind,
    /// `sha256:` digest of the compressed blob.
    pub digest: String,
    /// `sha256:` digest of the uncompressed tar.
    pub diff_id: String,
    pub blob: Vec<u8>,
}

impl SealedLayer {
    pub fn size(&self) -> u64 {
        self.blob.len() as u64
    }
}

fn archive_error(e: std::io::Error) -> DockhandError {
    DockhandError::InternalError {
        reason: format!("layer archive: {e}"),
    }
}

/// Seals the tree under `root` into a compressed layer.
#[instrument(skip(root), fields(root = %root.display()))]
pub fn seal(stage: StageKind, root: &Path) -> Result<SealedLayer, DockhandError> {
    let tar = write_tar(root)?;
    let diff_id = format!("sha256:{}", hex_digest(&tar));

    let mut encoder = GzBuilder::new()
        .mtime(0)
        .write(Vec::new(), Compression::default());
    encoder.write_all(&tar).map_err(archive_error)?;
    let blob = encoder.finish().map_err(archive_error)?;
    let digest = format!("sha256:{}", hex_digest(&blob));

    debug!(
        stage = %stage,
        digest = %digest,
        tar_bytes = tar.len(),
        blob_bytes = blob.len(),
        "Layer sealed"
    );

    Ok(SealedLayer {
        stage,
        digest,
        diff_id,
        blob,
    })
}

fn write_tar(root: &Path) -> Result<Vec<u8>, DockhandError> {
    let mut entries = Vec::new();
    collect_entries(root, "", &mut entries)?;

    let mut builder = tar::Builder::new(Vec::new());
    for entry in entries {
        let mut header = tar::Header::new_gnu();
        header.set_mtime(0);
        header.set_uid(0);
        header.set_gid(0);

        match entry {
            TreeEntry::Dir(path) => {
                header.set_entry_type(tar::EntryType::Directory);
                header.set_mode(0o755);
                header.set_size(0);
                builder
                    .append_data(&mut header, format!("{path}/"), std::io::empty())
                    .map_err(archive_error)?;
            }
            TreeEntry::File { path, host, mode } => {
                let data = std::fs::read(&host)?;
                header.set_entry_type(tar::EntryType::Regular);
                header.set_mode(mode);
                header.set_size(data.len() as u64);
                builder
                    .append_data(&mut header, &path, data.as_slice())
                    .map_err(archive_error)?;
            }
            TreeEntry::Symlink { path, target } => {
                header.set_entry_type(tar::EntryType::Symlink);
                header.set_mode(0o777);
                header.set_size(0);
                builder
                    .append_link(&mut header, &path, &target)
                    .map_err(archive_error)?;
            }
        }
    }

    builder.into_inner().map_err(archive_error)
}

enum TreeEntry {
    Dir(String),
    File {
        path: String,
        host: std::path::PathBuf,
        mode: u32,
    },
    Symlink {
        path: String,
        target: std::path::PathBuf,
    },
}

/// Depth-first walk with children in byte order of their names.
fn collect_entries(
    dir: &Path,
    prefix: &str,
    out: &mut Vec<TreeEntry>,
) -> Result<(), DockhandError> {
    let mut children: Vec<(String, std::path::PathBuf)> = std::fs::read_dir(dir)?
        .map(|entry| {
            entry.map(|e| (e.file_name().to_string_lossy().into_owned(), e.path()))
        })
        .collect::<Result<_, _>>()?;
    children.sort();

    for (name, host) in children {
        let path = if prefix.is_empty() {
            name
        } else {
            format!("{prefix}/{name}")
        };
        let metadata = std::fs::symlink_metadata(&host)?;

        if metadata.is_dir() {
            out.push(TreeEntry::Dir(path.clone()));
            collect_entries(&host, &path, out)?;
        } else if metadata.file_type().is_symlink() {
            let target = std::fs::read_link(&host)?;
            out.push(TreeEntry::Symlink { path, target });
        } else if metadata.is_file() {
            out.push(TreeEntry::File {
                path,
                host,
                mode: file_mode(&metadata),
            });
        }
    }
    Ok(())
}

/// Unpacks a compressed layer blob on top of `dest`.
pub fn unpack_blob(blob: &[u8], dest: &Path) -> Result<(), DockhandError> {
    std::fs::create_dir_all(dest)?;
    let mut archive = tar::Archive::new(GzDecoder::new(blob));
    archive.set_preserve_permissions(true);
    archive.set_preserve_mtime(false);
    archive.unpack(dest).map_err(archive_error)
}

/// File and symlink paths contained in a compressed layer blob.
pub fn list_blob_paths(blob: &[u8]) -> Result<BTreeSet<String>, DockhandError> {
    let mut archive = tar::Archive::new(GzDecoder::new(blob));
    let mut paths = BTreeSet::new();
    for entry in archive.entries().map_err(archive_error)? {
        let entry = entry.map_err(archive_error)?;
        let kind = entry.header().entry_type();
        if kind.is_file() || kind.is_symlink() {
            let path = entry.path().map_err(archive_error)?;
            paths.insert(path.to_string_lossy().trim_start_matches("./").to_string());
        }
    }
    Ok(paths)
}

/// File and symlink paths under `root`, relative and `/`-separated.
pub fn list_layer_paths(root: &Path) -> Result<BTreeSet<String>, DockhandError> {
    let mut entries = Vec::new();
    collect_entries(root, "", &mut entries)?;
    Ok(entries
        .into_iter()
        .filter_map(|entry| match entry {
            TreeEntry::File { path, .. } | TreeEntry::Symlink { path, .. } => Some(path),
            TreeEntry::Dir(_) => None,
        })
        .collect())
}

pub fn hex_digest(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

#[cfg(unix)]
fn file_mode(metadata: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o7755
}

#[cfg(not(unix))]
fn file_mode(_metadata: &std::fs::Metadata) -> u32 {
    0o644
}
