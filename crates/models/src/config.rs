use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct Config {
    pub store: StoreConfig,
    pub base: BaseConfig,
    pub dependencies: DependenciesConfig,
    pub build: BuildSettings,
    pub output: OutputConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct StoreConfig {
    /// Layer cache and blob store.
    pub dir: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct BaseConfig {
    /// Directory of `<runtime>-<version>-<os>.tar.gz` root filesystems.
    pub catalog_dir: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct DependenciesConfig {
    /// Manifest path, relative to the build context.
    pub manifest: String,
    /// Lock file path, relative to the build context.
    pub lock: String,
    /// Absolute image path packages are unpacked into.
    pub install_prefix: String,
    /// Local directory or `http(s)://` base URL of the package index.
    pub index: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct BuildSettings {
    /// Build file looked up in the context when `-f` is not given.
    pub file_name: String,
    /// Shell prefix for `RUN` commands.
    pub shell: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct OutputConfig {
    /// Parent directory of exported OCI image layouts.
    pub dir: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            store: StoreConfig {
                dir: ".dockhand/store".to_string(),
            },
            base: BaseConfig {
                catalog_dir: ".dockhand/bases".to_string(),
            },
            dependencies: DependenciesConfig {
                manifest: "requirements.txt".to_string(),
                lock: "requirements.lock".to_string(),
                install_prefix: "/usr/local/lib/dockhand/site-packages".to_string(),
                index: ".dockhand/index".to_string(),
            },
            build: BuildSettings {
                file_name: "Dockhandfile".to_string(),
                shell: vec!["/bin/sh".to_string(), "-c".to_string()],
            },
            output: OutputConfig {
                dir: ".dockhand/images".to_string(),
            },
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Config::default().store
    }
}

impl Default for BaseConfig {
    fn default() -> Self {
        Config::default().base
    }
}

impl Default for DependenciesConfig {
    fn default() -> Self {
        Config::default().dependencies
    }
}

impl Default for BuildSettings {
    fn default() -> Self {
        Config::default().build
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Config::default().output
    }
}
