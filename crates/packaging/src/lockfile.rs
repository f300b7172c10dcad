//! Dependency manifest and lock file, in pip requirements syntax.

use dockhand_models::DockhandError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// PEP 503 name normalization: lowercase, runs of `-_.` become `-`.
pub fn normalize_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut last_sep = false;
    for c in name.trim().chars() {
        if matches!(c, '-' | '_' | '.') {
            if !last_sep {
                out.push('-');
            }
            last_sep = true;
        } else {
            out.push(c.to_ascii_lowercase());
            last_sep = false;
        }
    }
    out
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Constraint {
    Any,
    Exact(String),
    /// Loose specifier such as `>=2.0,<3`; satisfied by the lock, not checked.
    Range(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Requirement {
    pub name: String,
    pub constraint: Constraint,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DependencyManifest {
    pub requirements: Vec<Requirement>,
}

impl DependencyManifest {
    pub fn load(path: &Path) -> Result<Self, DockhandError> {
        let content = std::fs::read_to_string(path).map_err(|e| DockhandError::ManifestInvalid {
            reason: format!("{}: {e}", path.display()),
        })?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, DockhandError> {
        let mut requirements: Vec<Requirement> = Vec::new();

        for (idx, line) in requirement_lines(content).into_iter().enumerate() {
            let invalid = |reason: String| DockhandError::ManifestInvalid {
                reason: format!("entry {}: {reason}", idx + 1),
            };

            if line.starts_with('-') {
                return Err(invalid(format!("option lines are not supported: {line}")));
            }

            // Environment markers do not take part in lock matching.
            let spec = line.split(';').next().unwrap_or_default().trim();
            let (name, rest) = split_name(spec).map_err(invalid)?;
            let rest = rest.trim();

            let constraint = if rest.is_empty() {
                Constraint::Any
            } else if let Some(version) = rest.strip_prefix("==") {
                let version = version.trim();
                if version.contains([',', '*']) {
                    Constraint::Range(rest.to_string())
                } else {
                    Constraint::Exact(version.to_string())
                }
            } else {
                Constraint::Range(rest.to_string())
            };

            if requirements.iter().any(|r| r.name == name) {
                return Err(invalid(format!("{name} is listed twice")));
            }
            requirements.push(Requirement { name, constraint });
        }

        Ok(Self { requirements })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PinnedPackage {
    pub name: String,
    pub version: String,
    /// Accepted sha256 digests (hex). Empty means unhashed.
    pub hashes: Vec<String>,
}

impl PinnedPackage {
    pub fn pin(&self) -> String {
        format!("{}=={}", self.name, self.version)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LockFile {
    pub packages: Vec<PinnedPackage>,
}

impl LockFile {
    pub fn load(path: &Path) -> Result<Self, DockhandError> {
        let label = path.display().to_string();
        if !path.exists() {
            return Err(DockhandError::LockFileMissing { path: label });
        }
        let content =
            std::fs::read_to_string(path).map_err(|e| DockhandError::LockFileUnreadable {
                path: label.clone(),
                reason: e.to_string(),
            })?;
        Self::parse(&label, &content)
    }

    /// Every entry must be an exact `name==version` pin, optionally followed
    /// by `--hash=sha256:<hex>` options.
    pub fn parse(label: &str, content: &str) -> Result<Self, DockhandError> {
        let mut packages: BTreeMap<String, PinnedPackage> = BTreeMap::new();

        for line in requirement_lines(content) {
            let unreadable = |reason: String| DockhandError::LockFileUnreadable {
                path: label.to_string(),
                reason,
            };

            let mut tokens = line.split_whitespace();
            let spec = tokens.next().unwrap_or_default();
            let spec = spec.split(';').next().unwrap_or_default();
            let (name, rest) = split_name(spec).map_err(&unreadable)?;
            let version = rest
                .strip_prefix("==")
                .filter(|v| !v.is_empty() && !v.contains([',', '*', '<', '>', '=']))
                .ok_or_else(|| unreadable(format!("{spec} is not an exact pin")))?;

            let mut hashes = Vec::new();
            for option in tokens {
                if option.starts_with(';') {
                    break;
                }
                let digest = option
                    .strip_prefix("--hash=sha256:")
                    .ok_or_else(|| unreadable(format!("unsupported option {option}")))?;
                if digest.len() != 64 || !digest.chars().all(|c| c.is_ascii_hexdigit()) {
                    return Err(unreadable(format!("malformed sha256 for {name}")));
                }
                hashes.push(digest.to_ascii_lowercase());
            }

            let package = PinnedPackage {
                name: name.clone(),
                version: version.to_string(),
                hashes,
            };
            if packages.insert(name.clone(), package).is_some() {
                return Err(unreadable(format!("{name} is pinned twice")));
            }
        }

        Ok(Self {
            packages: packages.into_values().collect(),
        })
    }

    pub fn get(&self, name: &str) -> Option<&PinnedPackage> {
        let name = normalize_name(name);
        self.packages.iter().find(|p| p.name == name)
    }

    pub fn pins(&self) -> Vec<String> {
        self.packages.iter().map(PinnedPackage::pin).collect()
    }

    /// Every manifest entry must be pinned, and exact manifest constraints
    /// must agree with the pin. The lock may hold more (transitive) entries.
    pub fn verify_against(&self, manifest: &DependencyManifest) -> Result<(), DockhandError> {
        let mut missing = Vec::new();

        for requirement in &manifest.requirements {
            match self.get(&requirement.name) {
                None => missing.push(requirement.name.clone()),
                Some(pinned) => {
                    if let Constraint::Exact(version) = &requirement.constraint {
                        if version != &pinned.version {
                            return Err(DockhandError::LockMismatch {
                                reason: format!(
                                    "manifest requires {}=={} but lock pins {}",
                                    requirement.name, version, pinned.version
                                ),
                            });
                        }
                    }
                }
            }
        }

        if !missing.is_empty() {
            return Err(DockhandError::LockMismatch {
                reason: format!("not pinned in lock file: {}", missing.join(", ")),
            });
        }
        Ok(())
    }
}

/// Strips comments, joins `\` continuations and drops blank lines.
fn requirement_lines(content: &str) -> Vec<String> {
    let mut lines = Vec::new();
    let mut pending = String::new();

    for raw in content.lines() {
        let without_comment = match raw.find(" #") {
            Some(idx) => &raw[..idx],
            None if raw.trim_start().starts_with('#') => "",
            None => raw,
        };
        let trimmed = without_comment.trim();

        match trimmed.strip_suffix('\\') {
            Some(head) => {
                pending.push_str(head.trim());
                pending.push(' ');
            }
            None => {
                pending.push_str(trimmed);
                let line = std::mem::take(&mut pending).trim().to_string();
                if !line.is_empty() {
                    lines.push(line);
                }
            }
        }
    }

    let tail = pending.trim();
    if !tail.is_empty() {
        lines.push(tail.to_string());
    }
    lines
}

/// Splits `name[extras]rest` into the normalized name and the remainder.
fn split_name(spec: &str) -> Result<(String, &str), String> {
    let end = spec
        .find(|c: char| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')))
        .unwrap_or(spec.len());
    let name = &spec[..end];
    if name.is_empty() {
        return Err(format!("missing package name in {spec:?}"));
    }

    let mut rest = &spec[end..];
    if rest.starts_with('[') {
        let close = rest
            .find(']')
            .ok_or_else(|| format!("unterminated extras in {spec:?}"))?;
        rest = &rest[close + 1..];
    }

    Ok((normalize_name(name), rest.trim()))
}
