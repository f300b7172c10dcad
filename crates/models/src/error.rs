use crate::state::PipelineState;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Pipeline step an error is attributed to when it is reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildPhase {
    Parse,
    Base,
    Dependencies,
    Assembly,
    Export,
    Config,
    Internal,
}

impl fmt::Display for BuildPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BuildPhase::Parse => "parse",
            BuildPhase::Base => "base",
            BuildPhase::Dependencies => "dependencies",
            BuildPhase::Assembly => "assembly",
            BuildPhase::Export => "export",
            BuildPhase::Config => "config",
            BuildPhase::Internal => "internal",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ErrorShape {
    pub error_message: String,
    pub error_type: String,
    pub phase: BuildPhase,
}

#[derive(Error, Debug)]
pub enum DockhandError {
    #[error("Build file error at line {line}: {reason}")]
    Parse { line: usize, reason: String },

    #[error("Invalid {instruction} instruction: {reason}")]
    InvalidInstruction { instruction: String, reason: String },

    #[error("Base environment unavailable: {descriptor} ({reason})")]
    BaseUnavailable { descriptor: String, reason: String },

    #[error("Invalid dependency manifest: {reason}")]
    ManifestInvalid { reason: String },

    #[error("Lock file missing: {path}")]
    LockFileMissing { path: String },

    #[error("Lock file unreadable: {path}: {reason}")]
    LockFileUnreadable { path: String, reason: String },

    #[error("Lock file does not match manifest: {reason}")]
    LockMismatch { reason: String },

    #[error("Package unavailable: {package}=={version} ({reason})")]
    PackageUnavailable {
        package: String,
        version: String,
        reason: String,
    },

    #[error("Hash mismatch for {package}=={version}: got sha256:{actual}")]
    HashMismatch {
        package: String,
        version: String,
        actual: String,
    },

    #[error("Dependency installation failed: {reason}")]
    InstallFailed { reason: String },

    #[error("Source tree missing: {path}")]
    SourceTreeMissing { path: String },

    #[error("Working directory is not set before {instruction}")]
    WorkingDirUnset { instruction: String },

    #[error("Copy source not found in build context: {path}")]
    CopySourceMissing { path: String },

    #[error("Command `{command}` exited with status {status}: {stderr}")]
    CommandFailed {
        phase: BuildPhase,
        command: String,
        status: i32,
        stderr: String,
    },

    #[error("Illegal pipeline transition from {from} to {to}")]
    IllegalTransition {
        from: PipelineState,
        to: PipelineState,
    },

    #[error("Image error: {reason}")]
    ImageError { reason: String },

    #[error("Docker error: {message}")]
    DockerError { message: String },

    #[error("Configuration error: {reason}")]
    ConfigError { reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("I/O error in {phase} step: {source}")]
    StepIo {
        phase: BuildPhase,
        #[source]
        source: std::io::Error,
    },

    #[error("Internal error: {reason}")]
    InternalError { reason: String },
}

impl DockhandError {
    pub fn to_error_shape(&self) -> ErrorShape {
        ErrorShape {
            error_message: self.to_string(),
            error_type: self.error_type().to_string(),
            phase: self.phase(),
        }
    }

    /// Attributes a bare I/O error to the step it happened in. Other
    /// errors already carry their phase and pass through unchanged.
    pub fn in_phase(self, phase: BuildPhase) -> Self {
        match self {
            DockhandError::Io(source) => DockhandError::StepIo { phase, source },
            other => other,
        }
    }

    pub fn error_type(&self) -> &'static str {
        match self {
            DockhandError::Parse { .. } => "BuildFileError",
            DockhandError::InvalidInstruction { .. } => "BuildFileError",
            DockhandError::BaseUnavailable { .. } => "EnvironmentError",
            DockhandError::ManifestInvalid { .. } => "DependencyError",
            DockhandError::LockFileMissing { .. } => "DependencyError",
            DockhandError::LockFileUnreadable { .. } => "DependencyError",
            DockhandError::LockMismatch { .. } => "DependencyError",
            DockhandError::PackageUnavailable { .. } => "DependencyError",
            DockhandError::HashMismatch { .. } => "DependencyError",
            DockhandError::InstallFailed { .. } => "DependencyError",
            DockhandError::SourceTreeMissing { .. } => "AssemblyError",
            DockhandError::WorkingDirUnset { .. } => "AssemblyError",
            DockhandError::CopySourceMissing { .. } => "AssemblyError",
            DockhandError::CommandFailed { .. } => "CommandError",
            DockhandError::IllegalTransition { .. } => "PipelineError",
            DockhandError::ImageError { .. } => "ImageError",
            DockhandError::DockerError { .. } => "ImageError",
            DockhandError::ConfigError { .. } => "ConfigurationError",
            DockhandError::Io(_) => "InternalError",
            DockhandError::StepIo { .. } => "IoError",
            DockhandError::InternalError { .. } => "InternalError",
        }
    }

    pub fn phase(&self) -> BuildPhase {
        match self {
            DockhandError::Parse { .. } | DockhandError::InvalidInstruction { .. } => {
                BuildPhase::Parse
            }
            DockhandError::BaseUnavailable { .. } => BuildPhase::Base,
            DockhandError::ManifestInvalid { .. }
            | DockhandError::LockFileMissing { .. }
            | DockhandError::LockFileUnreadable { .. }
            | DockhandError::LockMismatch { .. }
            | DockhandError::PackageUnavailable { .. }
            | DockhandError::HashMismatch { .. }
            | DockhandError::InstallFailed { .. } => BuildPhase::Dependencies,
            DockhandError::SourceTreeMissing { .. }
            | DockhandError::WorkingDirUnset { .. }
            | DockhandError::CopySourceMissing { .. } => BuildPhase::Assembly,
            DockhandError::CommandFailed { phase, .. } | DockhandError::StepIo { phase, .. } => {
                *phase
            }
            DockhandError::ImageError { .. } | DockhandError::DockerError { .. } => {
                BuildPhase::Export
            }
            DockhandError::ConfigError { .. } => BuildPhase::Config,
            DockhandError::IllegalTransition { .. }
            | DockhandError::Io(_)
            | DockhandError::InternalError { .. } => BuildPhase::Internal,
        }
    }
}
