use dockhand_models::{BuildPhase, DockhandError, StageKind};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

pub struct TracingService;

impl TracingService {
    /// Installs the global subscriber. `RUST_LOG` overrides the default
    /// `info` filter. Calling it twice is harmless.
    pub fn init(format: LogFormat) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        let result = match format {
            LogFormat::Json => tracing_subscriber::fmt()
                .json()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .try_init(),
            LogFormat::Text => tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .try_init(),
        };

        if let Err(e) = result {
            debug!(error = %e, "Global subscriber already installed");
        }
        Ok(())
    }

    pub fn log_build_started(tag: &str, context: &str, base: &str) {
        info!(
            tag = %tag,
            context = %context,
            base = %base,
            "Build started"
        );
    }

    pub fn log_step_started(stage: StageKind, cache_key: &str) {
        info!(
            stage = %stage,
            cache_key = %short(cache_key),
            "Step started"
        );
    }

    pub fn log_step_completed(stage: StageKind, digest: &str, size: u64, duration_ms: u64) {
        info!(
            stage = %stage,
            digest = %digest,
            size = size,
            duration_ms = duration_ms,
            "Step completed"
        );
    }

    pub fn log_cache_hit(stage: StageKind, cache_key: &str, digest: &str) {
        info!(
            stage = %stage,
            cache_key = %short(cache_key),
            digest = %digest,
            "Step reused from cache"
        );
    }

    pub fn log_step_failed(stage: StageKind, err: &DockhandError) {
        error!(
            stage = %stage,
            phase = %err.phase(),
            error_type = %err.error_type(),
            error_message = %err,
            "Step failed; build aborted"
        );
    }

    pub fn log_overwrite(stage: StageKind, path: &str) {
        warn!(
            stage = %stage,
            path = %path,
            "Copy overwrites an existing path"
        );
    }

    pub fn log_build_failed(tag: &str, phase: BuildPhase, message: &str) {
        error!(
            tag = %tag,
            phase = %phase,
            error_message = %message,
            "Build failed"
        );
    }

    pub fn log_build_completed(tag: &str, layers: usize, image_dir: &str) {
        info!(
            tag = %tag,
            layers = layers,
            image_dir = %image_dir,
            "Build completed"
        );
    }
}

fn short(key: &str) -> &str {
    key.get(..12).unwrap_or(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_twice_is_ok() {
        assert!(TracingService::init(LogFormat::Text).is_ok());
        assert!(TracingService::init(LogFormat::Json).is_ok());
    }

    #[test]
    fn test_short_key() {
        assert_eq!(short("0123456789abcdef"), "0123456789ab");
        assert_eq!(short("abc"), "abc");
    }
}
