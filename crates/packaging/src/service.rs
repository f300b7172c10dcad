use crate::assembler::{apply_copy, ensure_directory, AssemblyReport, PathLedger};
use crate::base::{BaseEnvironmentProvider, CatalogProvider};
use crate::buildfile::BuildFile;
use crate::cache::{cache_key, LayerCache, LayerRecord};
use crate::context::{sha256_hex, BuildContext};
use crate::installer::{index_from_config, DependencyInstaller, IndexInstaller};
use crate::layer::{list_blob_paths, seal, unpack_blob};
use crate::lockfile::{DependencyManifest, LockFile};
use crate::oci::OciExporter;
use crate::plan::{normalize_source, BuildPlan, PlannedStep, Stage};
use crate::runner::{phase_for, CommandRunner, HostShellRunner};
use dockhand_metrics::{MetricsService, TracingService};
use dockhand_models::{
    Config, DockhandError, ImageMetadata, ImagePath, PipelineState, StageKind,
};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::instrument;

#[derive(Debug, Clone)]
pub struct BuildRequest {
    pub context_dir: PathBuf,
    /// Defaults to `<context>/<build.file_name>`.
    pub build_file: Option<PathBuf>,
    pub tag: String,
}

#[derive(Debug, Clone)]
pub struct StageOutcome {
    pub stage: StageKind,
    pub cache_key: String,
    pub record: LayerRecord,
    pub cached: bool,
    /// Copies performed by this stage; only overwrites survive a cache hit.
    pub report: AssemblyReport,
}

#[derive(Debug, Clone)]
pub struct BuildOutcome {
    pub image: ImageMetadata,
    pub layers: Vec<StageOutcome>,
    pub state: PipelineState,
    pub report: AssemblyReport,
    pub image_dir: PathBuf,
}

impl BuildOutcome {
    pub fn stage(&self, stage: StageKind) -> Option<&StageOutcome> {
        self.layers.iter().find(|l| l.stage == stage)
    }
}

/// Lock set resolved from the build context for the dependency stage.
struct DependencyInputs {
    lock: LockFile,
    lock_hash: String,
    manifest_hash: Option<String>,
}

/// Drives a build through base, dependency and assembly stages and exports
/// the result. Each stage is a cached layer; only a fully assembled image is
/// exported.
pub struct BuildPipeline {
    config: Config,
    cache: LayerCache,
    provider: Arc<dyn BaseEnvironmentProvider>,
    installer: Arc<dyn DependencyInstaller>,
    runner: Arc<dyn CommandRunner>,
    exporter: OciExporter,
    metrics: Option<Arc<MetricsService>>,
}

impl BuildPipeline {
    pub fn new(
        config: Config,
        cache: LayerCache,
        provider: Arc<dyn BaseEnvironmentProvider>,
        installer: Arc<dyn DependencyInstaller>,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        let exporter = OciExporter::new(&config.output.dir);
        Self {
            config,
            cache,
            provider,
            installer,
            runner,
            exporter,
            metrics: None,
        }
    }

    /// Wires the default catalog, package index and host shell.
    pub fn from_config(config: Config) -> Result<Self, DockhandError> {
        let cache = LayerCache::new(PathBuf::from(&config.store.dir))?;
        let provider = Arc::new(CatalogProvider::new(&config.base.catalog_dir));
        let installer = Arc::new(IndexInstaller::new(index_from_config(&config.dependencies)));
        let runner = Arc::new(HostShellRunner::new(config.build.shell.clone()));
        Ok(Self::new(config, cache, provider, installer, runner))
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsService>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn cache(&self) -> &LayerCache {
        &self.cache
    }

    pub fn cache_mut(&mut self) -> &mut LayerCache {
        &mut self.cache
    }

    #[instrument(skip(self), fields(tag = %request.tag))]
    pub async fn build(&mut self, request: &BuildRequest) -> Result<BuildOutcome, DockhandError> {
        if let Some(metrics) = &self.metrics {
            metrics.record_build_started();
        }

        match self.run_build(request).await {
            Ok(outcome) => {
                TracingService::log_build_completed(
                    &request.tag,
                    outcome.layers.len(),
                    &outcome.image_dir.display().to_string(),
                );
                Ok(outcome)
            }
            Err(err) => {
                if let Some(metrics) = &self.metrics {
                    metrics.record_build_failure(&err);
                }
                TracingService::log_build_failed(&request.tag, err.phase(), &err.to_string());
                Err(err)
            }
        }
    }

    async fn run_build(&mut self, request: &BuildRequest) -> Result<BuildOutcome, DockhandError> {
        let context = BuildContext::open(&request.context_dir)?;
        let build_file_path = request
            .build_file
            .clone()
            .unwrap_or_else(|| request.context_dir.join(&self.config.build.file_name));
        let file = BuildFile::load(&build_file_path)?;
        let plan = BuildPlan::from_build_file(&file, &self.config.build.shell)?;

        TracingService::log_build_started(
            &request.tag,
            &request.context_dir.display().to_string(),
            &plan.base.to_string(),
        );

        let mut state = PipelineState::Uninitialized;
        let mut layers = Vec::new();

        let base = self.base_stage(&plan).await?;
        let mut lower = self.layer_paths(&base.record)?;
        state = state.advance(PipelineState::BaseReady)?;
        layers.push(base);

        // Resolved before the stage runs so a missing or inconsistent lock
        // fails ahead of any install or assembly work.
        let inputs = self
            .dependency_inputs(&context, &plan.dependencies)
            .map_err(|e| e.in_phase(phase_for(StageKind::Dependencies)))?;
        let parent = layers[0].record.digest.clone();
        let dependencies = self
            .materialize_stage(
                &context,
                &plan.dependencies,
                &parent,
                lower.clone(),
                inputs.as_ref(),
                None,
            )
            .await?;
        lower.extend(self.layer_paths(&dependencies.record)?);
        state = state.advance(PipelineState::DependenciesInstalled)?;
        let installed = dependencies.record.installed.clone();
        layers.push(dependencies);

        let parent = layers[1].record.digest.clone();
        let assembly = self
            .materialize_stage(
                &context,
                &plan.assembly,
                &parent,
                lower,
                None,
                Some(&plan.working_dir),
            )
            .await?;
        state = state.advance(PipelineState::Assembled)?;
        let report = assembly.report.clone();
        layers.push(assembly);

        let image = ImageMetadata {
            base: plan.base.clone(),
            working_dir: plan.working_dir.clone(),
            network: plan.network,
            entrypoint: plan.entrypoint.clone(),
            env: plan.config.env.clone(),
            installed,
            layers: layers.iter().map(|l| l.record.descriptor()).collect(),
        };

        let image_dir = self.exporter.export(&request.tag, &image, &self.cache)?;

        Ok(BuildOutcome {
            image,
            layers,
            state,
            report,
            image_dir,
        })
    }

    #[instrument(skip(self, plan), fields(base = %plan.base))]
    async fn base_stage(&mut self, plan: &BuildPlan) -> Result<StageOutcome, DockhandError> {
        let stage = StageKind::Base;
        let archive = self.provider.fetch(&plan.base).await?;
        let key = cache_key(["base".to_string(), sha256_hex(&archive)]);

        if let Some(outcome) = self.cache_hit(stage, &key) {
            return Ok(outcome);
        }

        TracingService::log_step_started(stage, &key);
        let started = Instant::now();
        let staging = self.staging_dir()?;
        unpack_blob(&archive, staging.path()).map_err(|e| DockhandError::BaseUnavailable {
            descriptor: plan.base.to_string(),
            reason: format!("archive cannot be unpacked: {e}"),
        })?;

        let layer = seal(stage, staging.path()).map_err(|e| e.in_phase(phase_for(stage)))?;
        let record = LayerRecord::from_sealed(&layer);
        self.cache.insert(&key, &layer, record.clone())?;
        self.step_completed(stage, &record, started);

        Ok(StageOutcome {
            stage,
            cache_key: key,
            record,
            cached: false,
            report: AssemblyReport::default(),
        })
    }

    /// Reads the manifest and the lock from the build context. A manifest
    /// anywhere in the context requires a lock, whether or not the stage
    /// copies it. Returns `None` when the context has neither and the stage
    /// names neither.
    fn dependency_inputs(
        &self,
        context: &BuildContext,
        stage: &Stage,
    ) -> Result<Option<DependencyInputs>, DockhandError> {
        let manifest_path = normalize_source(&self.config.dependencies.manifest)?;
        let lock_path = normalize_source(&self.config.dependencies.lock)?;

        // A source missing from the context still counts as named, so an
        // absent lock surfaces as LockFileMissing rather than a copy error.
        let mut named = BTreeSet::new();
        for op in stage.copies() {
            for source in &op.sources {
                match context.resolve(source) {
                    Ok(resolved) => named.extend(
                        resolved.into_iter().map(|r| r.context_path.to_string()),
                    ),
                    Err(_) => {
                        named.insert(source.clone());
                    }
                }
            }
        }
        let manifest_present = context.contains(&manifest_path);
        let wanted = manifest_present
            || context.contains(&lock_path)
            || named.contains(&manifest_path)
            || named.contains(&lock_path);
        if !wanted {
            return Ok(None);
        }

        let lock_bytes = context
            .read(&lock_path)?
            .ok_or_else(|| DockhandError::LockFileMissing {
                path: lock_path.clone(),
            })?;
        let lock_text =
            String::from_utf8(lock_bytes.clone()).map_err(|e| DockhandError::LockFileUnreadable {
                path: lock_path.clone(),
                reason: e.to_string(),
            })?;
        let lock = LockFile::parse(&lock_path, &lock_text)?;

        let manifest_hash = if manifest_present {
            let bytes = context.read(&manifest_path)?.unwrap_or_default();
            let text = String::from_utf8(bytes.clone()).map_err(|e| {
                DockhandError::ManifestInvalid {
                    reason: e.to_string(),
                }
            })?;
            lock.verify_against(&DependencyManifest::parse(&text)?)?;
            Some(sha256_hex(&bytes))
        } else {
            None
        };

        Ok(Some(DependencyInputs {
            lock,
            lock_hash: sha256_hex(&lock_bytes),
            manifest_hash,
        }))
    }

    /// Builds (or reuses) the layer for one planned stage on top of `parent`.
    #[instrument(skip_all, fields(stage = %stage.kind))]
    async fn materialize_stage(
        &mut self,
        context: &BuildContext,
        stage: &Stage,
        parent: &str,
        lower: BTreeSet<String>,
        dependencies: Option<&DependencyInputs>,
        working_dir: Option<&ImagePath>,
    ) -> Result<StageOutcome, DockhandError> {
        let kind = stage.kind;
        let key = self.stage_key(context, stage, parent, dependencies, working_dir)?;

        if let Some(outcome) = self.cache_hit(kind, &key) {
            return Ok(outcome);
        }

        TracingService::log_step_started(kind, &key);
        let started = Instant::now();
        let staging = self.staging_dir()?;

        let result = self
            .run_steps(context, stage, staging.path(), lower, dependencies, working_dir)
            .await
            .and_then(|(installed, report)| {
                seal(kind, staging.path()).map(|layer| (installed, report, layer))
            });
        let (installed, report, layer) = match result {
            Ok(done) => done,
            Err(err) => {
                let err = err.in_phase(phase_for(kind));
                TracingService::log_step_failed(kind, &err);
                return Err(err);
            }
        };

        let mut record = LayerRecord::from_sealed(&layer);
        record.installed = installed;
        record.overwritten = report.overwritten.clone();
        self.cache.insert(&key, &layer, record.clone())?;
        self.step_completed(kind, &record, started);

        Ok(StageOutcome {
            stage: kind,
            cache_key: key,
            record,
            cached: false,
            report,
        })
    }

    async fn run_steps(
        &self,
        context: &BuildContext,
        stage: &Stage,
        layer_root: &Path,
        lower: BTreeSet<String>,
        dependencies: Option<&DependencyInputs>,
        working_dir: Option<&ImagePath>,
    ) -> Result<(Vec<String>, AssemblyReport), DockhandError> {
        let mut ledger = PathLedger::new(lower);
        let mut report = AssemblyReport::default();
        let mut installed: Option<Vec<String>> = None;

        for step in &stage.steps {
            match step {
                PlannedStep::SetWorkdir(dir) => ensure_directory(layer_root, dir)?,
                PlannedStep::Copy(op) => {
                    report.merge(apply_copy(context, op, stage.kind, layer_root, &mut ledger)?);
                }
                PlannedStep::Run(op) => {
                    if installed.is_none() {
                        installed = Some(self.install(dependencies, layer_root).await?);
                    }
                    self.runner.run(op, layer_root).await?;
                }
            }
        }

        let installed = match installed {
            Some(pins) => pins,
            None => self.install(dependencies, layer_root).await?,
        };
        if let Some(dir) = working_dir {
            ensure_directory(layer_root, dir)?;
        }

        Ok((installed, report))
    }

    async fn install(
        &self,
        dependencies: Option<&DependencyInputs>,
        layer_root: &Path,
    ) -> Result<Vec<String>, DockhandError> {
        let Some(inputs) = dependencies else {
            return Ok(Vec::new());
        };
        let prefix = ImagePath::parse(&self.config.dependencies.install_prefix)?;
        let report = self
            .installer
            .install(&inputs.lock, &prefix.to_host(layer_root))
            .await?;
        Ok(report.installed)
    }

    fn stage_key(
        &self,
        context: &BuildContext,
        stage: &Stage,
        parent: &str,
        dependencies: Option<&DependencyInputs>,
        working_dir: Option<&ImagePath>,
    ) -> Result<String, DockhandError> {
        let mut parts = vec![stage.kind.to_string(), parent.to_string()];
        parts.extend(stage.fingerprint.iter().cloned());
        for op in stage.copies() {
            parts.push(context.hash_sources(&op.sources)?);
        }
        if let Some(inputs) = dependencies {
            parts.push(format!("lock:{}", inputs.lock_hash));
            parts.push(format!(
                "manifest:{}",
                inputs.manifest_hash.as_deref().unwrap_or("-")
            ));
            parts.push(format!(
                "prefix:{}",
                self.config.dependencies.install_prefix
            ));
        }
        if let Some(dir) = working_dir {
            parts.push(format!("workdir:{dir}"));
        }
        parts.push(format!("shell:{}", self.config.build.shell.join(" ")));
        Ok(cache_key(parts))
    }

    fn cache_hit(&self, stage: StageKind, key: &str) -> Option<StageOutcome> {
        let record = self.cache.get(key)?.clone();
        TracingService::log_cache_hit(stage, key, &record.digest);
        if let Some(metrics) = &self.metrics {
            metrics.record_cache_hit(stage);
        }
        let report = AssemblyReport {
            copied: 0,
            overwritten: record.overwritten.clone(),
        };
        Some(StageOutcome {
            stage,
            cache_key: key.to_string(),
            record,
            cached: true,
            report,
        })
    }

    fn step_completed(&self, stage: StageKind, record: &LayerRecord, started: Instant) {
        let elapsed = started.elapsed();
        TracingService::log_step_completed(
            stage,
            &record.digest,
            record.size,
            elapsed.as_millis() as u64,
        );
        if let Some(metrics) = &self.metrics {
            metrics.record_step_duration(stage, elapsed.as_secs_f64() * 1000.0);
        }
    }

    /// Dropped on every exit path, so a failed stage leaves nothing behind.
    fn staging_dir(&self) -> Result<tempfile::TempDir, DockhandError> {
        tempfile::Builder::new()
            .prefix("stage-")
            .tempdir_in(self.cache.tmp_dir())
            .map_err(|e| DockhandError::InternalError {
                reason: format!("cannot create staging directory: {e}"),
            })
    }

    fn layer_paths(&self, record: &LayerRecord) -> Result<BTreeSet<String>, DockhandError> {
        list_blob_paths(&self.cache.read_blob(&record.digest)?)
    }
}
