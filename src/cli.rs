use crate::config::load_config;
use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use dockhand_metrics::{LogFormat, MetricsService, TracingService};
use dockhand_models::Config;
use dockhand_packaging::{
    lint, load_into_docker, read_image, unpack_rootfs, BuildOutcome, BuildPipeline, BuildRequest,
    LayerCache, LintFinding,
};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

#[derive(Parser)]
#[command(name = "dockhand")]
#[command(about = "Reproducible build-and-bootstrap pipeline for service images")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Configuration file (default: ./dockhand.toml when present)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Log output format
    #[arg(long, value_enum, default_value = "text", global = true)]
    pub log_format: LogFormatArg,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum LogFormatArg {
    Text,
    Json,
}

impl From<LogFormatArg> for LogFormat {
    fn from(value: LogFormatArg) -> Self {
        match value {
            LogFormatArg::Text => LogFormat::Text,
            LogFormatArg::Json => LogFormat::Json,
        }
    }
}

#[derive(Subcommand)]
pub enum Commands {
    /// Build an image from a context directory
    Build(BuildArgs),

    /// Print image metadata and the runtime spec as JSON
    Inspect {
        /// Exported OCI image layout
        image_dir: PathBuf,
    },

    /// Report configuration problems without building
    Lint {
        /// Build file (default: <context>/Dockhandfile)
        #[arg(short, long)]
        file: Option<PathBuf>,

        /// Build context directory
        context: PathBuf,
    },

    /// Materialise an image's root filesystem into a directory
    Unpack {
        image_dir: PathBuf,
        dest: PathBuf,
    },

    /// Manage the layer cache
    Cache {
        #[command(subcommand)]
        command: CacheCommands,
    },
}

#[derive(Args, Debug, Clone)]
pub struct BuildArgs {
    /// Build file (default: <context>/Dockhandfile)
    #[arg(short, long)]
    pub file: Option<PathBuf>,

    /// Image reference (default: <context dir name>:latest)
    #[arg(short, long)]
    pub tag: Option<String>,

    /// Pipe the exported image into `docker load`
    #[arg(long)]
    pub load: bool,

    /// Write Prometheus metrics here after the build
    #[arg(long)]
    pub metrics_file: Option<PathBuf>,

    /// Build context directory
    pub context: PathBuf,
}

#[derive(Subcommand)]
pub enum CacheCommands {
    /// Drop cached layers older than the given age
    Prune {
        #[arg(long, default_value = "30")]
        max_age_days: u64,
    },
}

pub fn default_tag(context: &Path) -> String {
    let name = std::fs::canonicalize(context)
        .ok()
        .and_then(|p| p.file_name().map(|n| n.to_string_lossy().to_lowercase()))
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| "image".to_string());
    format!("{name}:latest")
}

/// Runs one build. Metrics are written even when the build fails.
pub async fn build(config: &Config, args: &BuildArgs) -> Result<BuildOutcome> {
    let metrics = Arc::new(MetricsService::new()?);
    let mut pipeline = BuildPipeline::from_config(config.clone())?.with_metrics(metrics.clone());

    let request = BuildRequest {
        context_dir: args.context.clone(),
        build_file: args.file.clone(),
        tag: args
            .tag
            .clone()
            .unwrap_or_else(|| default_tag(&args.context)),
    };
    let result = pipeline.build(&request).await;

    if let Some(path) = &args.metrics_file {
        std::fs::write(path, metrics.get_prometheus_metrics()?)
            .with_context(|| format!("writing metrics to {}", path.display()))?;
    }

    let outcome = result?;
    if args.load {
        load_into_docker(&outcome.image_dir).await?;
    }
    Ok(outcome)
}

pub fn inspect(image_dir: &Path) -> Result<serde_json::Value> {
    let image = read_image(image_dir)?;
    let runtime = image.runtime_spec();
    Ok(json!({
        "image": image,
        "runtime": runtime,
    }))
}

pub fn lint_context(config: &Config, context: &Path, file: Option<&Path>) -> Result<Vec<LintFinding>> {
    let build_file = file
        .map(Path::to_path_buf)
        .unwrap_or_else(|| context.join(&config.build.file_name));
    Ok(lint(context, &build_file, config)?)
}

pub fn prune_cache(config: &Config, max_age_days: u64) -> Result<usize> {
    let mut cache = LayerCache::new(PathBuf::from(&config.store.dir))?;
    Ok(cache.cleanup_old_cache(max_age_days)?)
}

pub async fn run_cli(cli: Cli) -> Result<()> {
    TracingService::init(cli.log_format.into())
        .map_err(|e| anyhow::anyhow!("failed to initialise logging: {e}"))?;
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Build(args) => {
            let outcome = build(&config, &args).await?;
            for layer in &outcome.layers {
                println!(
                    "{:<13} {} {}",
                    layer.stage.to_string(),
                    layer.record.digest,
                    if layer.cached { "(cached)" } else { "" }
                );
            }
            for path in &outcome.report.overwritten {
                println!("overwritten   {path}");
            }
            println!("image         {}", outcome.image_dir.display());
        }

        Commands::Inspect { image_dir } => {
            println!("{}", serde_json::to_string_pretty(&inspect(&image_dir)?)?);
        }

        Commands::Lint { file, context } => {
            let findings = lint_context(&config, &context, file.as_deref())?;
            if findings.is_empty() {
                println!("no findings");
            }
            for finding in &findings {
                println!("{finding}");
            }
        }

        Commands::Unpack { image_dir, dest } => {
            let layers = unpack_rootfs(&image_dir, &dest)?;
            println!("unpacked {layers} layers into {}", dest.display());
        }

        Commands::Cache {
            command: CacheCommands::Prune { max_age_days },
        } => {
            let removed = prune_cache(&config, max_age_days)?;
            info!(removed = removed, "Cache pruned");
            println!("removed {removed} blobs");
        }
    }

    Ok(())
}
