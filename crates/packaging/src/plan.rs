//! Lowers a parsed build file into the three pipeline stages.
//!
//! Environment variables and the working directory are not ambient state:
//! they live in an explicit [`BuildConfig`] that is threaded through the
//! instructions in order, and every planned step captures the values it
//! depends on at the point it was declared.

use crate::buildfile::{BuildFile, EntrypointForm, Instruction};
use dockhand_models::{
    DockhandError, EntrypointCommand, EnvironmentDescriptor, ImagePath, NetworkContract, StageKind,
};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildConfig {
    pub env: BTreeMap<String, String>,
    pub working_dir: Option<ImagePath>,
}

impl BuildConfig {
    /// Expands `$VAR` and `${VAR}`. `$$` yields a literal `$`.
    pub fn expand(&self, input: &str, instruction: &str) -> Result<String, DockhandError> {
        let unknown = |name: &str| DockhandError::InvalidInstruction {
            instruction: instruction.to_string(),
            reason: format!("undefined variable ${name}"),
        };

        let mut out = String::with_capacity(input.len());
        let mut chars = input.chars().peekable();

        while let Some(c) = chars.next() {
            if c != '$' {
                out.push(c);
                continue;
            }
            match chars.peek() {
                Some('$') => {
                    chars.next();
                    out.push('$');
                }
                Some('{') => {
                    chars.next();
                    let mut name = String::new();
                    loop {
                        match chars.next() {
                            Some('}') => break,
                            Some(ch) => name.push(ch),
                            None => {
                                return Err(DockhandError::InvalidInstruction {
                                    instruction: instruction.to_string(),
                                    reason: "unterminated ${".to_string(),
                                })
                            }
                        }
                    }
                    out.push_str(self.env.get(&name).ok_or_else(|| unknown(&name))?);
                }
                Some(ch) if ch.is_ascii_alphabetic() || *ch == '_' => {
                    let mut name = String::new();
                    while let Some(ch) = chars.peek() {
                        if ch.is_ascii_alphanumeric() || *ch == '_' {
                            name.push(*ch);
                            chars.next();
                        } else {
                            break;
                        }
                    }
                    out.push_str(self.env.get(&name).ok_or_else(|| unknown(&name))?);
                }
                _ => out.push('$'),
            }
        }

        Ok(out)
    }

    pub fn require_working_dir(&self, instruction: &str) -> Result<&ImagePath, DockhandError> {
        self.working_dir
            .as_ref()
            .ok_or_else(|| DockhandError::WorkingDirUnset {
                instruction: instruction.to_string(),
            })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyOp {
    pub line: usize,
    /// Build-context relative sources, normalized (`.` is the whole context).
    pub sources: Vec<String>,
    pub destination: ImagePath,
    /// Sources land inside `destination` rather than replacing it.
    pub into_directory: bool,
}

impl CopyOp {
    pub fn is_whole_context(&self) -> bool {
        self.sources.iter().any(|s| s == ".")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOp {
    pub line: usize,
    pub stage: StageKind,
    pub command: String,
    pub cwd: ImagePath,
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlannedStep {
    SetWorkdir(ImagePath),
    Copy(CopyOp),
    Run(RunOp),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stage {
    pub kind: StageKind,
    pub steps: Vec<PlannedStep>,
    /// Canonical instruction text, in order, for cache keys.
    pub fingerprint: Vec<String>,
}

impl Stage {
    fn new(kind: StageKind) -> Self {
        Self {
            kind,
            steps: Vec::new(),
            fingerprint: Vec::new(),
        }
    }

    pub fn copies(&self) -> impl Iterator<Item = &CopyOp> {
        self.steps.iter().filter_map(|s| match s {
            PlannedStep::Copy(op) => Some(op),
            _ => None,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildPlan {
    pub base: EnvironmentDescriptor,
    pub dependencies: Stage,
    pub assembly: Stage,
    /// Configuration after the last instruction.
    pub config: BuildConfig,
    pub working_dir: ImagePath,
    pub network: Option<NetworkContract>,
    pub entrypoint: EntrypointCommand,
}

impl BuildPlan {
    /// The dependency stage runs from `FROM` up to the first `COPY` of the
    /// whole build context; that copy and everything after it is assembly.
    pub fn from_build_file(file: &BuildFile, shell: &[String]) -> Result<Self, DockhandError> {
        let mut steps = file.steps.iter();

        let base = match steps.next() {
            Some(step) => match &step.instruction {
                Instruction::From(reference) => EnvironmentDescriptor::parse(reference)?,
                other => {
                    return Err(DockhandError::Parse {
                        line: step.line,
                        reason: format!("build file must start with FROM, found {}", other.keyword()),
                    })
                }
            },
            None => {
                return Err(DockhandError::Parse {
                    line: 0,
                    reason: "build file contains no instructions".to_string(),
                })
            }
        };

        let mut config = BuildConfig::default();
        let mut dependencies = Stage::new(StageKind::Dependencies);
        let mut assembly = Stage::new(StageKind::Assembly);
        let mut in_assembly = false;
        let mut network: Option<NetworkContract> = None;
        let mut entrypoint: Option<EntrypointCommand> = None;

        for step in steps {
            let keyword = step.instruction.keyword();

            let planned = match &step.instruction {
                Instruction::From(_) => {
                    return Err(DockhandError::Parse {
                        line: step.line,
                        reason: "only one FROM is allowed".to_string(),
                    })
                }
                Instruction::Env(pairs) => {
                    for (key, value) in pairs {
                        let value = config.expand(value, keyword)?;
                        config.env.insert(key.clone(), value);
                    }
                    None
                }
                Instruction::Workdir(path) => {
                    let expanded = config.expand(path, keyword)?;
                    let dir = match &config.working_dir {
                        Some(current) => current.join(&expanded),
                        None => ImagePath::parse(&expanded)?,
                    };
                    config.working_dir = Some(dir.clone());
                    Some(PlannedStep::SetWorkdir(dir))
                }
                Instruction::Copy {
                    sources,
                    destination,
                } => {
                    let op = plan_copy(&config, step.line, sources, destination)?;
                    if op.is_whole_context() {
                        in_assembly = true;
                    }
                    Some(PlannedStep::Copy(op))
                }
                Instruction::Run(command) => {
                    let stage = if in_assembly {
                        StageKind::Assembly
                    } else {
                        StageKind::Dependencies
                    };
                    Some(PlannedStep::Run(RunOp {
                        line: step.line,
                        stage,
                        command: command.clone(),
                        cwd: config.working_dir.clone().unwrap_or_else(ImagePath::root),
                        env: config.env.clone(),
                    }))
                }
                Instruction::Expose(spec) => {
                    let contract = NetworkContract::parse(&config.expand(spec, keyword)?)?;
                    match network {
                        Some(existing) if existing != contract => {
                            return Err(DockhandError::InvalidInstruction {
                                instruction: keyword.to_string(),
                                reason: format!(
                                    "port already declared as {}, cannot redeclare as {}",
                                    existing.key(),
                                    contract.key()
                                ),
                            })
                        }
                        _ => network = Some(contract),
                    }
                    None
                }
                Instruction::Entrypoint(form) => {
                    let args = match form {
                        EntrypointForm::Exec(args) => args.clone(),
                        EntrypointForm::Shell(text) => {
                            let mut args = shell.to_vec();
                            args.push(text.clone());
                            args
                        }
                    };
                    entrypoint = Some(EntrypointCommand::new(args)?);
                    None
                }
            };

            let stage = if in_assembly {
                &mut assembly
            } else {
                &mut dependencies
            };
            stage.fingerprint.push(step.instruction.canonical());
            if let Some(planned) = planned {
                stage.steps.push(planned);
            }
        }

        if !in_assembly {
            return Err(DockhandError::SourceTreeMissing {
                path: "build file never copies the build context (COPY . <dest>)".to_string(),
            });
        }
        let working_dir = config.require_working_dir("image assembly")?.clone();
        let entrypoint = entrypoint.ok_or_else(|| DockhandError::InvalidInstruction {
            instruction: "ENTRYPOINT".to_string(),
            reason: "build file declares no entrypoint".to_string(),
        })?;

        Ok(Self {
            base,
            dependencies,
            assembly,
            config,
            working_dir,
            network,
            entrypoint,
        })
    }
}

fn plan_copy(
    config: &BuildConfig,
    line: usize,
    sources: &[String],
    destination: &str,
) -> Result<CopyOp, DockhandError> {
    let destination_raw = config.expand(destination, "COPY")?;

    let destination = if destination_raw.starts_with('/') {
        ImagePath::parse(&destination_raw)?
    } else {
        config.require_working_dir("COPY")?.join(&destination_raw)
    };

    let into_directory = sources.len() > 1
        || destination_raw.ends_with('/')
        || destination_raw == "."
        || destination_raw.ends_with("/.");

    let sources = sources
        .iter()
        .map(|s| normalize_source(&config.expand(s, "COPY")?))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(CopyOp {
        line,
        sources,
        destination,
        into_directory,
    })
}

/// Normalizes a context-relative source; refuses to leave the context.
pub fn normalize_source(source: &str) -> Result<String, DockhandError> {
    if source.contains(&['*', '?', '['][..]) {
        return Err(DockhandError::InvalidInstruction {
            instruction: "COPY".to_string(),
            reason: format!("wildcards are not supported: {source:?}"),
        });
    }

    let mut parts: Vec<&str> = Vec::new();
    for part in source.trim_start_matches('/').split('/') {
        match part {
            "" | "." => {}
            ".." => {
                if parts.pop().is_none() {
                    return Err(DockhandError::InvalidInstruction {
                        instruction: "COPY".to_string(),
                        reason: format!("source escapes the build context: {source:?}"),
                    });
                }
            }
            other => parts.push(other),
        }
    }

    if parts.is_empty() {
        Ok(".".to_string())
    } else {
        Ok(parts.join("/"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shell() -> Vec<String> {
        vec!["/bin/sh".into(), "-c".into()]
    }

    fn plan(src: &str) -> Result<BuildPlan, DockhandError> {
        BuildPlan::from_build_file(&BuildFile::parse(src).unwrap(), &shell())
    }

    const SERVICE: &str = "FROM python:3.11.9-slim-bookworm
ENV APP_HOME=/app
WORKDIR $APP_HOME
COPY requirements.txt requirements.lock ./
RUN echo deps
COPY . .
RUN echo assembled
EXPOSE 5000
ENTRYPOINT [\"python\", \"app.py\"]
";

    #[test]
    fn test_stage_split_at_context_copy() {
        let plan = plan(SERVICE).unwrap();
        assert_eq!(plan.base.to_string(), "python:3.11.9-slim-bookworm");
        assert_eq!(plan.working_dir.as_str(), "/app");
        assert_eq!(plan.network.unwrap().port, 5000);
        assert_eq!(plan.entrypoint.as_slice(), ["python", "app.py"]);

        assert_eq!(plan.dependencies.steps.len(), 3);
        assert_eq!(plan.assembly.steps.len(), 2);
        assert_eq!(plan.dependencies.fingerprint.len(), 4);
        assert_eq!(plan.assembly.fingerprint.len(), 4);

        let seed = plan.dependencies.copies().next().unwrap();
        assert_eq!(seed.sources, vec!["requirements.txt", "requirements.lock"]);
        assert_eq!(seed.destination.as_str(), "/app");
        assert!(seed.into_directory);

        match &plan.assembly.steps[1] {
            PlannedStep::Run(op) => {
                assert_eq!(op.stage, StageKind::Assembly);
                assert_eq!(op.cwd.as_str(), "/app");
                assert_eq!(op.env.get("APP_HOME").map(String::as_str), Some("/app"));
            }
            other => panic!("unexpected step {other:?}"),
        }
    }

    #[test]
    fn test_relative_copy_without_workdir_fails() {
        let err = plan("FROM python:3.11.9-slim\nCOPY . .\nCMD [\"python\"]").unwrap_err();
        assert!(matches!(err, DockhandError::WorkingDirUnset { .. }));
    }

    #[test]
    fn test_missing_context_copy_is_source_tree_missing() {
        let err = plan("FROM python:3.11.9-slim\nWORKDIR /app\nCOPY app.py .\nCMD [\"python\"]")
            .unwrap_err();
        assert!(matches!(err, DockhandError::SourceTreeMissing { .. }));
    }

    #[test]
    fn test_shell_form_entrypoint_is_wrapped() {
        let plan = plan("FROM python:3.11.9-slim\nWORKDIR /app\nCOPY . .\nCMD python app.py").unwrap();
        assert_eq!(plan.entrypoint.as_slice(), ["/bin/sh", "-c", "python app.py"]);
    }

    #[test]
    fn test_from_must_be_first_and_unique() {
        assert!(plan("WORKDIR /app\nFROM python:3.11.9-slim").is_err());
        assert!(plan("FROM a:1.0.0-x\nFROM b:1.0.0-x").is_err());
    }

    #[test]
    fn test_conflicting_expose_rejected() {
        let err = plan("FROM python:3.11.9-slim\nWORKDIR /app\nCOPY . .\nEXPOSE 5000\nEXPOSE 8080\nCMD [\"python\"]")
            .unwrap_err();
        assert!(matches!(err, DockhandError::InvalidInstruction { .. }));
    }

    #[test]
    fn test_expand_variables() {
        let mut config = BuildConfig::default();
        config.env.insert("HOME_DIR".into(), "/srv".into());
        assert_eq!(config.expand("${HOME_DIR}/x", "ENV").unwrap(), "/srv/x");
        assert_eq!(config.expand("$HOME_DIR-y", "ENV").unwrap(), "/srv-y");
        assert_eq!(config.expand("cost $$5", "ENV").unwrap(), "cost $5");
        assert!(config.expand("$MISSING", "ENV").is_err());
    }

    #[test]
    fn test_normalize_source() {
        assert_eq!(normalize_source("./").unwrap(), ".");
        assert_eq!(normalize_source("src/../app.py").unwrap(), "app.py");
        assert!(normalize_source("../secret").is_err());
        assert!(normalize_source("*.py").is_err());
    }
}
