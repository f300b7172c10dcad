use anyhow::{Context, Result};
use dockhand_models::Config;
use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use std::path::Path;

pub const DEFAULT_CONFIG_FILE: &str = "dockhand.toml";
pub const ENV_PREFIX: &str = "DOCKHAND_";

/// Defaults, then `dockhand.toml` (or `path`), then `DOCKHAND_*` variables.
/// Nested keys use `__`, e.g. `DOCKHAND_STORE__DIR`.
pub fn load_config(path: Option<&Path>) -> Result<Config> {
    let mut figment = Figment::from(Serialized::defaults(Config::default()));

    figment = match path {
        Some(path) => {
            if !path.is_file() {
                anyhow::bail!("config file not found: {}", path.display());
            }
            figment.merge(Toml::file(path))
        }
        None => figment.merge(Toml::file(DEFAULT_CONFIG_FILE)),
    };

    figment
        .merge(Env::prefixed(ENV_PREFIX).split("__"))
        .extract::<Config>()
        .context("Failed to extract valid configuration")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("custom.toml");
        std::fs::write(
            &path,
            "[store]\ndir = \"/var/cache/dockhand\"\n\n[build]\nshell = [\"/bin/bash\", \"-c\"]\n",
        )
        .unwrap();

        let config = load_config(Some(&path)).unwrap();
        assert_eq!(config.store.dir, "/var/cache/dockhand");
        assert_eq!(config.build.shell, vec!["/bin/bash", "-c"]);
        assert_eq!(config.build.file_name, "Dockhandfile");
        assert_eq!(config.dependencies.lock, "requirements.lock");
    }

    #[test]
    fn test_unknown_keys_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "[store]\npath = \"/tmp\"\n").unwrap();
        assert!(load_config(Some(&path)).is_err());
    }

    #[test]
    fn test_missing_explicit_file() {
        assert!(load_config(Some(Path::new("/nonexistent/dockhand.toml"))).is_err());
    }
}
