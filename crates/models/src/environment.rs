use crate::error::DockhandError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Runtime + OS layer an image is built on, e.g. `python:3.11.9-slim-bookworm`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EnvironmentDescriptor {
    pub runtime_name: String,
    pub runtime_version: String,
    pub os_base: String,
}

impl EnvironmentDescriptor {
    /// Parses `name[:version[-os]]`. A missing tag reads as `latest`; whether
    /// the result is acceptable is a review concern, see [`Self::is_pinned`].
    pub fn parse(reference: &str) -> Result<Self, DockhandError> {
        let reference = reference.trim();
        let invalid = |reason: &str| DockhandError::InvalidInstruction {
            instruction: "FROM".to_string(),
            reason: format!("{reason}: {reference:?}"),
        };

        if reference.is_empty() {
            return Err(invalid("empty base reference"));
        }
        if reference.contains('@') {
            return Err(invalid("digest references are not supported"));
        }

        let (name, tag) = match reference.split_once(':') {
            Some((name, tag)) => (name, tag),
            None => (reference, "latest"),
        };
        if name.is_empty() || tag.is_empty() {
            return Err(invalid("malformed base reference"));
        }
        if !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-' | '/'))
        {
            return Err(invalid("runtime name has invalid characters"));
        }

        let (version, os_base) = match tag.split_once('-') {
            Some((version, os)) => (version, os),
            None => (tag, ""),
        };
        if version.is_empty() {
            return Err(invalid("missing runtime version"));
        }

        Ok(Self {
            runtime_name: name.to_string(),
            runtime_version: version.to_string(),
            os_base: os_base.to_string(),
        })
    }

    /// True when version has at least `major.minor.patch` numeric components
    /// and an OS base is named.
    pub fn is_pinned(&self) -> bool {
        if self.runtime_version.eq_ignore_ascii_case("latest") || self.os_base.is_empty() {
            return false;
        }
        let parts: Vec<&str> = self.runtime_version.split('.').collect();
        parts.len() >= 3
            && parts
                .iter()
                .all(|p| !p.is_empty() && p.chars().all(|c| c.is_ascii_digit()))
    }

    /// File name of the root filesystem archive in a base catalog.
    pub fn archive_name(&self) -> String {
        let name = self.runtime_name.replace('/', "_");
        if self.os_base.is_empty() {
            format!("{}-{}.tar.gz", name, self.runtime_version)
        } else {
            format!("{}-{}-{}.tar.gz", name, self.runtime_version, self.os_base)
        }
    }
}

impl fmt::Display for EnvironmentDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.os_base.is_empty() {
            write!(f, "{}:{}", self.runtime_name, self.runtime_version)
        } else {
            write!(
                f,
                "{}:{}-{}",
                self.runtime_name, self.runtime_version, self.os_base
            )
        }
    }
}
