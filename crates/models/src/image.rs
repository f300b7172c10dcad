use crate::environment::EnvironmentDescriptor;
use crate::error::DockhandError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

/// Absolute, lexically normalized POSIX path inside an image.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ImagePath(String);

impl ImagePath {
    pub fn root() -> Self {
        ImagePath("/".to_string())
    }

    pub fn parse(path: &str) -> Result<Self, DockhandError> {
        if !path.starts_with('/') {
            return Err(DockhandError::InvalidInstruction {
                instruction: "path".to_string(),
                reason: format!("{path:?} is not absolute"),
            });
        }
        Ok(Self::normalize(path))
    }

    fn normalize(path: &str) -> Self {
        let mut parts: Vec<&str> = Vec::new();
        for part in path.split('/') {
            match part {
                "" | "." => {}
                // `..` cannot climb above the image root.
                ".." => {
                    parts.pop();
                }
                other => parts.push(other),
            }
        }
        ImagePath(format!("/{}", parts.join("/")))
    }

    /// Resolves `path` against `self`; absolute input replaces the base.
    pub fn join(&self, path: &str) -> Self {
        if path.starts_with('/') {
            Self::normalize(path)
        } else {
            Self::normalize(&format!("{}/{}", self.0, path))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Path without the leading `/`, suitable for joining onto a host directory.
    pub fn relative(&self) -> &str {
        &self.0[1..]
    }

    pub fn is_root(&self) -> bool {
        self.0 == "/"
    }

    pub fn to_host(&self, root: &Path) -> PathBuf {
        if self.is_root() {
            root.to_path_buf()
        } else {
            root.join(self.relative())
        }
    }

    pub fn file_name(&self) -> Option<&str> {
        self.0.rsplit('/').next().filter(|s| !s.is_empty())
    }
}

impl TryFrom<String> for ImagePath {
    type Error = DockhandError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        ImagePath::parse(&value)
    }
}

impl From<ImagePath> for String {
    fn from(value: ImagePath) -> Self {
        value.0
    }
}

impl fmt::Display for ImagePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => f.write_str("tcp"),
            Protocol::Udp => f.write_str("udp"),
        }
    }
}

/// Port the service is expected to listen on. Advisory at build time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NetworkContract {
    pub port: u16,
    pub protocol: Protocol,
}

impl NetworkContract {
    /// Parses `5000`, `5000/tcp` or `5000/udp`.
    pub fn parse(spec: &str) -> Result<Self, DockhandError> {
        let invalid = |reason: &str| DockhandError::InvalidInstruction {
            instruction: "EXPOSE".to_string(),
            reason: format!("{reason}: {spec:?}"),
        };

        let (port, protocol) = match spec.trim().split_once('/') {
            Some((port, proto)) => {
                let protocol = match proto.to_ascii_lowercase().as_str() {
                    "tcp" => Protocol::Tcp,
                    "udp" => Protocol::Udp,
                    _ => return Err(invalid("unknown protocol")),
                };
                (port, protocol)
            }
            None => (spec.trim(), Protocol::Tcp),
        };

        let port: u16 = port.parse().map_err(|_| invalid("port is not a number"))?;
        if port == 0 {
            return Err(invalid("port must be between 1 and 65535"));
        }

        Ok(Self { port, protocol })
    }

    /// Key used in the OCI `ExposedPorts` map, e.g. `5000/tcp`.
    pub fn key(&self) -> String {
        format!("{}/{}", self.port, self.protocol)
    }
}

/// Argument vector the container runtime executes on start. Never parsed or
/// interpreted by the build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<String>", into = "Vec<String>")]
pub struct EntrypointCommand(Vec<String>);

impl EntrypointCommand {
    pub fn new(args: Vec<String>) -> Result<Self, DockhandError> {
        let invalid = |reason: &str| DockhandError::InvalidInstruction {
            instruction: "ENTRYPOINT".to_string(),
            reason: reason.to_string(),
        };

        match args.first() {
            None => return Err(invalid("argument list is empty")),
            Some(program) if program.trim().is_empty() => {
                return Err(invalid("program name is empty"))
            }
            Some(_) => {}
        }
        if args.iter().any(|a| a.contains('\0')) {
            return Err(invalid("arguments must not contain NUL bytes"));
        }

        Ok(Self(args))
    }

    pub fn program(&self) -> &str {
        &self.0[0]
    }

    pub fn args(&self) -> &[String] {
        &self.0[1..]
    }

    pub fn as_slice(&self) -> &[String] {
        &self.0
    }
}

impl TryFrom<Vec<String>> for EntrypointCommand {
    type Error = DockhandError;

    fn try_from(value: Vec<String>) -> Result<Self, Self::Error> {
        EntrypointCommand::new(value)
    }
}

impl From<EntrypointCommand> for Vec<String> {
    fn from(value: EntrypointCommand) -> Self {
        value.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageKind {
    Base,
    Dependencies,
    Assembly,
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StageKind::Base => f.write_str("base"),
            StageKind::Dependencies => f.write_str("dependencies"),
            StageKind::Assembly => f.write_str("assembly"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerDescriptor {
    pub stage: StageKind,
    /// Digest of the compressed blob.
    pub digest: String,
    /// Digest of the uncompressed tar.
    pub diff_id: String,
    pub size: u64,
}

/// Everything a container runtime needs to know about a built image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageMetadata {
    pub base: EnvironmentDescriptor,
    pub working_dir: ImagePath,
    pub network: Option<NetworkContract>,
    pub entrypoint: EntrypointCommand,
    pub env: BTreeMap<String, String>,
    /// `name==version` pins installed by the dependency stage.
    pub installed: Vec<String>,
    pub layers: Vec<LayerDescriptor>,
}

impl ImageMetadata {
    pub fn runtime_spec(&self) -> RuntimeSpec {
        RuntimeSpec {
            cwd: self.working_dir.clone(),
            args: self.entrypoint.as_slice().to_vec(),
            env: self
                .env
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect(),
            exposed_port: self.network.map(|n| n.port),
        }
    }
}

/// Process contract a runtime applies when starting a container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeSpec {
    pub cwd: ImagePath,
    pub args: Vec<String>,
    pub env: Vec<String>,
    pub exposed_port: Option<u16>,
}
