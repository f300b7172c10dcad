//! Configuration-class checks that do not stop a build.

use crate::buildfile::BuildFile;
use crate::context::BuildContext;
use crate::lockfile::{DependencyManifest, LockFile};
use crate::plan::{normalize_source, BuildPlan};
use dockhand_models::{Config, DockhandError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LintCode {
    UnpinnedBase,
    ManifestWithoutLock,
    LockOutOfDate,
    NoExposedPort,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LintFinding {
    pub code: LintCode,
    pub message: String,
}

impl fmt::Display for LintFinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let code = serde_json::to_value(self.code)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default();
        write!(f, "{code}: {}", self.message)
    }
}

/// Lints the build file and dependency files of a context. Structural errors
/// in the build file are returned as `Err`, not as findings.
pub fn lint(
    context_dir: &Path,
    build_file: &Path,
    config: &Config,
) -> Result<Vec<LintFinding>, DockhandError> {
    let file = BuildFile::load(build_file)?;
    let plan = BuildPlan::from_build_file(&file, &config.build.shell)?;
    let context = BuildContext::open(context_dir)?;
    let mut findings = Vec::new();

    if !plan.base.is_pinned() {
        findings.push(LintFinding {
            code: LintCode::UnpinnedBase,
            message: format!(
                "base {} is not pinned to an exact runtime version and OS",
                plan.base
            ),
        });
    }

    let manifest_path = normalize_source(&config.dependencies.manifest)?;
    let lock_path = normalize_source(&config.dependencies.lock)?;
    let manifest = context.read(&manifest_path)?;
    let lock = context.read(&lock_path)?;

    match (manifest, lock) {
        (Some(_), None) => findings.push(LintFinding {
            code: LintCode::ManifestWithoutLock,
            message: format!("{manifest_path} has no {lock_path}; the build will fail"),
        }),
        (Some(manifest), Some(lock)) => {
            let manifest = DependencyManifest::parse(&String::from_utf8_lossy(&manifest))?;
            let lock = LockFile::parse(&lock_path, &String::from_utf8_lossy(&lock))?;
            if let Err(err) = lock.verify_against(&manifest) {
                findings.push(LintFinding {
                    code: LintCode::LockOutOfDate,
                    message: err.to_string(),
                });
            }
        }
        _ => {}
    }

    if plan.network.is_none() {
        findings.push(LintFinding {
            code: LintCode::NoExposedPort,
            message: "no EXPOSE instruction; the image declares no network contract"
                .to_string(),
        });
    }

    Ok(findings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write_context(build_file: &str, files: &[(&str, &str)]) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("Dockhandfile"), build_file).unwrap();
        for (name, content) in files {
            fs::write(dir.path().join(name), content).unwrap();
        }
        dir
    }

    fn codes(findings: &[LintFinding]) -> Vec<LintCode> {
        findings.iter().map(|f| f.code).collect()
    }

    #[test]
    fn test_clean_context_has_no_findings() {
        let dir = write_context(
            "FROM python:3.11.9-slim\nWORKDIR /app\nCOPY requirements.txt requirements.lock ./\nCOPY . .\nEXPOSE 5000\nCMD [\"python\", \"app.py\"]\n",
            &[("requirements.txt", "X==1.2.3\n"), ("requirements.lock", "x==1.2.3\n")],
        );
        let findings = lint(
            dir.path(),
            &dir.path().join("Dockhandfile"),
            &Config::default(),
        )
        .unwrap();
        assert!(findings.is_empty(), "{findings:?}");
    }

    #[test]
    fn test_reports_configuration_findings() {
        let dir = write_context(
            "FROM python\nWORKDIR /app\nCOPY . .\nCMD [\"python\", \"app.py\"]\n",
            &[("requirements.txt", "X==1.2.3\n")],
        );
        let findings = lint(
            dir.path(),
            &dir.path().join("Dockhandfile"),
            &Config::default(),
        )
        .unwrap();
        assert_eq!(
            codes(&findings),
            vec![
                LintCode::UnpinnedBase,
                LintCode::ManifestWithoutLock,
                LintCode::NoExposedPort
            ]
        );
        assert!(findings[0].to_string().starts_with("unpinned-base: "));
    }

    #[test]
    fn test_stale_lock() {
        let dir = write_context(
            "FROM python:3.11.9-slim\nWORKDIR /app\nCOPY . .\nEXPOSE 5000\nCMD [\"python\"]\n",
            &[("requirements.txt", "X==1.2.3\n"), ("requirements.lock", "x==1.0.0\n")],
        );
        let findings = lint(
            dir.path(),
            &dir.path().join("Dockhandfile"),
            &Config::default(),
        )
        .unwrap();
        assert_eq!(codes(&findings), vec![LintCode::LockOutOfDate]);
    }
}
