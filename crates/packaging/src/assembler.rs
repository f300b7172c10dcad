//! Places build context files into a layer directory.

use crate::context::BuildContext;
use crate::plan::CopyOp;
use dockhand_metrics::TracingService;
use dockhand_models::{DockhandError, ImagePath, StageKind};
use std::collections::BTreeSet;
use std::path::Path;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AssemblyReport {
    pub copied: usize,
    /// Image paths replaced by a copy, sorted.
    pub overwritten: Vec<String>,
}

impl AssemblyReport {
    pub fn merge(&mut self, other: AssemblyReport) {
        self.copied += other.copied;
        self.overwritten.extend(other.overwritten);
        self.overwritten.sort();
        self.overwritten.dedup();
    }
}

/// Tracks which image paths exist below and within the layer being built.
#[derive(Debug, Clone, Default)]
pub struct PathLedger {
    lower: BTreeSet<String>,
    written: BTreeSet<String>,
}

impl PathLedger {
    pub fn new(lower: BTreeSet<String>) -> Self {
        Self {
            lower,
            written: BTreeSet::new(),
        }
    }

    /// Records a write; true when the path already existed.
    fn record(&mut self, path: &str) -> bool {
        let existed = self.lower.contains(path) || self.written.contains(path);
        self.written.insert(path.to_string());
        existed
    }
}

/// Copies every file `op` selects into `layer_root`. Later copies win;
/// each replaced path is reported and logged.
pub fn apply_copy(
    context: &BuildContext,
    op: &CopyOp,
    stage: StageKind,
    layer_root: &Path,
    ledger: &mut PathLedger,
) -> Result<AssemblyReport, DockhandError> {
    let mut report = AssemblyReport::default();

    for source in &op.sources {
        for resolved in context.resolve(source)? {
            let target: ImagePath = if resolved.direct && !op.into_directory {
                op.destination.clone()
            } else {
                op.destination.join(&resolved.relative)
            };
            if target.is_root() {
                return Err(DockhandError::InvalidInstruction {
                    instruction: "COPY".to_string(),
                    reason: format!("cannot copy {} onto /", resolved.context_path),
                });
            }

            let host = target.to_host(layer_root);
            if host.is_dir() {
                return Err(DockhandError::InvalidInstruction {
                    instruction: "COPY".to_string(),
                    reason: format!("{target} is a directory in the image"),
                });
            }
            if let Some(parent) = host.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(&resolved.file.host_path, &host)?;
            set_mode(&host, resolved.file.executable)?;

            if ledger.record(target.relative()) {
                TracingService::log_overwrite(stage, target.as_str());
                report.overwritten.push(target.as_str().to_string());
            }
            report.copied += 1;
        }
    }

    report.overwritten.sort();
    report.overwritten.dedup();
    Ok(report)
}

/// Creates the working directory inside the layer so it exists in the image
/// even when nothing was copied into it.
pub fn ensure_directory(layer_root: &Path, dir: &ImagePath) -> Result<(), DockhandError> {
    std::fs::create_dir_all(dir.to_host(layer_root))?;
    Ok(())
}

#[cfg(unix)]
fn set_mode(path: &Path, executable: bool) -> Result<(), DockhandError> {
    use std::os::unix::fs::PermissionsExt;
    let mode = if executable { 0o755 } else { 0o644 };
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))?;
    Ok(())
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _executable: bool) -> Result<(), DockhandError> {
    Ok(())
}
