//! Snapshot of the build context directory.
//!
//! The walk honours `.dockerignore` and skips symlinks. Paths are
//! context-relative with `/` separators and kept sorted so that every
//! consumer sees the same order.

use dockhand_models::DockhandError;
use ignore::WalkBuilder;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, instrument};

pub const IGNORE_FILE: &str = ".dockerignore";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextFile {
    pub host_path: PathBuf,
    pub size: u64,
    pub executable: bool,
}

/// A file selected by a `COPY` source, with its path relative to that source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedSource<'a> {
    pub context_path: &'a str,
    pub relative: String,
    pub file: &'a ContextFile,
    /// The source named this file directly rather than a directory.
    pub direct: bool,
}

#[derive(Debug, Clone)]
pub struct BuildContext {
    root: PathBuf,
    files: BTreeMap<String, ContextFile>,
}

impl BuildContext {
    #[instrument]
    pub fn open(root: &Path) -> Result<Self, DockhandError> {
        if !root.is_dir() {
            return Err(DockhandError::SourceTreeMissing {
                path: root.display().to_string(),
            });
        }

        let mut files = BTreeMap::new();
        let walker = WalkBuilder::new(root)
            .standard_filters(false)
            .add_custom_ignore_filename(IGNORE_FILE)
            .follow_links(false)
            .build();

        for entry in walker {
            let entry = entry.map_err(|e| DockhandError::InternalError {
                reason: format!("walking build context: {e}"),
            })?;
            let Some(file_type) = entry.file_type() else {
                continue;
            };
            if file_type.is_symlink() {
                debug!(path = %entry.path().display(), "Skipping symlink in build context");
                continue;
            }
            if !file_type.is_file() {
                continue;
            }

            let relative = relative_key(root, entry.path())?;
            let metadata = entry.metadata().map_err(|e| DockhandError::InternalError {
                reason: e.to_string(),
            })?;
            files.insert(
                relative,
                ContextFile {
                    host_path: entry.path().to_path_buf(),
                    size: metadata.len(),
                    executable: is_executable(&metadata),
                },
            );
        }

        info!(
            root = %root.display(),
            files = files.len(),
            "Build context loaded"
        );

        Ok(Self {
            root: root.to_path_buf(),
            files,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn contains(&self, path: &str) -> bool {
        self.files.contains_key(path)
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.files.keys().map(String::as_str)
    }

    /// Files selected by a normalized source (`.` selects everything).
    pub fn resolve(&self, source: &str) -> Result<Vec<ResolvedSource<'_>>, DockhandError> {
        if source == "." {
            return Ok(self
                .files
                .iter()
                .map(|(path, file)| ResolvedSource {
                    context_path: path,
                    relative: path.clone(),
                    file,
                    direct: false,
                })
                .collect());
        }

        if let Some((path, file)) = self.files.get_key_value(source) {
            let name = source.rsplit('/').next().unwrap_or(source);
            return Ok(vec![ResolvedSource {
                context_path: path,
                relative: name.to_string(),
                file,
                direct: true,
            }]);
        }

        let prefix = format!("{source}/");
        let selected: Vec<ResolvedSource<'_>> = self
            .files
            .range(prefix.clone()..)
            .take_while(|(path, _)| path.starts_with(&prefix))
            .map(|(path, file)| ResolvedSource {
                context_path: path,
                relative: path[prefix.len()..].to_string(),
                file,
                direct: false,
            })
            .collect();

        if selected.is_empty() {
            return Err(DockhandError::CopySourceMissing {
                path: source.to_string(),
            });
        }
        Ok(selected)
    }

    pub fn read(&self, path: &str) -> Result<Option<Vec<u8>>, DockhandError> {
        match self.files.get(path) {
            Some(file) => Ok(Some(std::fs::read(&file.host_path)?)),
            None => Ok(None),
        }
    }

    /// Content hash over every file the sources select, in path order.
    pub fn hash_sources(&self, sources: &[String]) -> Result<String, DockhandError> {
        let mut selected: BTreeMap<&str, &ContextFile> = BTreeMap::new();
        for source in sources {
            for resolved in self.resolve(source)? {
                selected.insert(resolved.context_path, resolved.file);
            }
        }

        let mut hasher = Sha256::new();
        for (path, file) in selected {
            let content = std::fs::read(&file.host_path)?;
            hasher.update(path.as_bytes());
            hasher.update([0, u8::from(file.executable)]);
            hasher.update(sha256_hex(&content).as_bytes());
        }
        Ok(format!("{:x}", hasher.finalize()))
    }
}

pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

fn relative_key(root: &Path, path: &Path) -> Result<String, DockhandError> {
    let relative = path
        .strip_prefix(root)
        .map_err(|e| DockhandError::InternalError {
            reason: e.to_string(),
        })?;
    let parts: Vec<String> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    Ok(parts.join("/"))
}

#[cfg(unix)]
fn is_executable(metadata: &std::fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
fn is_executable(_metadata: &std::fs::Metadata) -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn context() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("app.py"), "print('hi')\n").unwrap();
        fs::create_dir_all(dir.path().join("pkg/sub")).unwrap();
        fs::write(dir.path().join("pkg/__init__.py"), "").unwrap();
        fs::write(dir.path().join("pkg/sub/mod.py"), "x = 1\n").unwrap();
        fs::create_dir_all(dir.path().join("__pycache__")).unwrap();
        fs::write(dir.path().join("__pycache__/app.pyc"), "junk").unwrap();
        fs::write(dir.path().join(".dockerignore"), "__pycache__/\n*.log\n").unwrap();
        fs::write(dir.path().join("debug.log"), "noise").unwrap();
        dir
    }

    #[test]
    fn test_snapshot_honours_dockerignore() {
        let dir = context();
        let ctx = BuildContext::open(dir.path()).unwrap();
        let paths: Vec<&str> = ctx.paths().collect();
        assert_eq!(
            paths,
            vec![".dockerignore", "app.py", "pkg/__init__.py", "pkg/sub/mod.py"]
        );
    }

    #[test]
    fn test_resolve_file_and_directory() {
        let dir = context();
        let ctx = BuildContext::open(dir.path()).unwrap();

        let file = ctx.resolve("app.py").unwrap();
        assert_eq!(file.len(), 1);
        assert!(file[0].direct);
        assert_eq!(file[0].relative, "app.py");

        let pkg = ctx.resolve("pkg").unwrap();
        let rel: Vec<&str> = pkg.iter().map(|r| r.relative.as_str()).collect();
        assert_eq!(rel, vec!["__init__.py", "sub/mod.py"]);

        assert!(matches!(
            ctx.resolve("missing.txt"),
            Err(DockhandError::CopySourceMissing { .. })
        ));
    }

    #[test]
    fn test_hash_sources_tracks_content_only() {
        let dir = context();
        let ctx = BuildContext::open(dir.path()).unwrap();
        let before = ctx.hash_sources(&["app.py".to_string()]).unwrap();

        fs::write(dir.path().join("pkg/sub/mod.py"), "x = 2\n").unwrap();
        let ctx = BuildContext::open(dir.path()).unwrap();
        assert_eq!(ctx.hash_sources(&["app.py".to_string()]).unwrap(), before);

        fs::write(dir.path().join("app.py"), "print('bye')\n").unwrap();
        let ctx = BuildContext::open(dir.path()).unwrap();
        assert_ne!(ctx.hash_sources(&["app.py".to_string()]).unwrap(), before);
    }

    #[test]
    fn test_missing_root() {
        let err = BuildContext::open(Path::new("/definitely/not/here")).unwrap_err();
        assert!(matches!(err, DockhandError::SourceTreeMissing { .. }));
    }
}
