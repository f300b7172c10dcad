//! OCI image layout export and inspection.
//!
//! An exported image is a directory holding `oci-layout`, `index.json` and
//! `blobs/sha256/*`. It is staged next to its final location and renamed
//! into place, so a half-written image is never visible.

use crate::cache::LayerCache;
use crate::layer::{hex_digest, unpack_blob, LAYER_MEDIA_TYPE};
use dockhand_models::{
    DockhandError, EntrypointCommand, EnvironmentDescriptor, ImageMetadata, ImagePath,
    LayerDescriptor, NetworkContract, StageKind,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{error, info, instrument};

const OCI_SCHEMA_VERSION: u32 = 2;
const OCI_INDEX_MEDIA_TYPE: &str = "application/vnd.oci.image.index.v1+json";
const OCI_MANIFEST_MEDIA_TYPE: &str = "application/vnd.oci.image.manifest.v1+json";
const OCI_CONFIG_MEDIA_TYPE: &str = "application/vnd.oci.image.config.v1+json";
const ANNOTATION_REF_NAME: &str = "org.opencontainers.image.ref.name";
const ANNOTATION_STAGE: &str = "dev.dockhand.stage";
const LABEL_BASE: &str = "dev.dockhand.base";
const LABEL_INSTALLED: &str = "dev.dockhand.installed";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OciDescriptor {
    pub media_type: String,
    pub digest: String,
    pub size: u64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OciIndex {
    pub schema_version: u32,
    #[serde(default)]
    pub media_type: Option<String>,
    pub manifests: Vec<OciDescriptor>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OciManifest {
    pub schema_version: u32,
    #[serde(default)]
    pub media_type: Option<String>,
    pub config: OciDescriptor,
    pub layers: Vec<OciDescriptor>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Empty {}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerConfig {
    #[serde(default)]
    pub env: Vec<String>,
    pub entrypoint: Vec<String>,
    pub working_dir: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub exposed_ports: BTreeMap<String, Empty>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RootFs {
    #[serde(rename = "type")]
    pub kind: String,
    pub diff_ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct History {
    pub created_by: String,
}

/// No `created` timestamp, so identical inputs give an identical config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageConfig {
    pub architecture: String,
    pub os: String,
    pub config: ContainerConfig,
    pub rootfs: RootFs,
    #[serde(default)]
    pub history: Vec<History>,
}

fn image_error(reason: impl std::fmt::Display) -> DockhandError {
    DockhandError::ImageError {
        reason: reason.to_string(),
    }
}

pub struct OciExporter {
    output_dir: PathBuf,
}

impl OciExporter {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
        }
    }

    /// `name:tag` maps to `<output>/name_tag`.
    pub fn image_dir(&self, tag: &str) -> PathBuf {
        let name: String = tag
            .chars()
            .map(|c| if matches!(c, ':' | '/' | '@') { '_' } else { c })
            .collect();
        self.output_dir.join(name)
    }

    #[instrument(skip(self, metadata, cache), fields(layers = metadata.layers.len()))]
    pub fn export(
        &self,
        tag: &str,
        metadata: &ImageMetadata,
        cache: &LayerCache,
    ) -> Result<PathBuf, DockhandError> {
        std::fs::create_dir_all(&self.output_dir).map_err(image_error)?;
        let staging = tempfile::Builder::new()
            .prefix(".staging-")
            .tempdir_in(&self.output_dir)
            .map_err(image_error)?;
        let blobs = staging.path().join("blobs").join("sha256");
        std::fs::create_dir_all(&blobs).map_err(image_error)?;

        let mut layers = Vec::new();
        for layer in &metadata.layers {
            let hex = layer.digest.trim_start_matches("sha256:");
            std::fs::copy(cache.blob_path(&layer.digest), blobs.join(hex)).map_err(|e| {
                image_error(format!("copying layer {}: {e}", layer.digest))
            })?;
            let mut annotations = BTreeMap::new();
            annotations.insert(ANNOTATION_STAGE.to_string(), layer.stage.to_string());
            layers.push(OciDescriptor {
                media_type: LAYER_MEDIA_TYPE.to_string(),
                digest: layer.digest.clone(),
                size: layer.size,
                annotations,
            });
        }

        let config = image_config(metadata);
        let config_descriptor = write_json_blob(&blobs, OCI_CONFIG_MEDIA_TYPE, &config)?;

        let manifest = OciManifest {
            schema_version: OCI_SCHEMA_VERSION,
            media_type: Some(OCI_MANIFEST_MEDIA_TYPE.to_string()),
            config: config_descriptor,
            layers,
        };
        let mut manifest_descriptor =
            write_json_blob(&blobs, OCI_MANIFEST_MEDIA_TYPE, &manifest)?;
        manifest_descriptor
            .annotations
            .insert(ANNOTATION_REF_NAME.to_string(), tag.to_string());

        let index = OciIndex {
            schema_version: OCI_SCHEMA_VERSION,
            media_type: Some(OCI_INDEX_MEDIA_TYPE.to_string()),
            manifests: vec![manifest_descriptor],
        };
        write_json(&staging.path().join("index.json"), &index)?;
        std::fs::write(
            staging.path().join("oci-layout"),
            br#"{"imageLayoutVersion":"1.0.0"}"#,
        )
        .map_err(image_error)?;

        let final_dir = self.image_dir(tag);
        publish(&self.output_dir, staging.path(), &final_dir)?;

        info!(
            tag = %tag,
            image_dir = %final_dir.display(),
            "Exported OCI image layout"
        );
        Ok(final_dir)
    }
}

fn image_config(metadata: &ImageMetadata) -> ImageConfig {
    let spec = metadata.runtime_spec();

    let mut labels = BTreeMap::new();
    labels.insert(LABEL_BASE.to_string(), metadata.base.to_string());
    labels.insert(LABEL_INSTALLED.to_string(), metadata.installed.join(","));

    let exposed_ports = metadata
        .network
        .iter()
        .map(|n| (n.key(), Empty {}))
        .collect();

    ImageConfig {
        architecture: oci_architecture().to_string(),
        os: "linux".to_string(),
        config: ContainerConfig {
            env: spec.env,
            entrypoint: spec.args,
            working_dir: spec.cwd.to_string(),
            exposed_ports,
            labels,
        },
        rootfs: RootFs {
            kind: "layers".to_string(),
            diff_ids: metadata.layers.iter().map(|l| l.diff_id.clone()).collect(),
        },
        history: metadata
            .layers
            .iter()
            .map(|l| History {
                created_by: format!("dockhand {} stage", l.stage),
            })
            .collect(),
    }
}

fn oci_architecture() -> &'static str {
    match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        other => other,
    }
}

fn write_json_blob<T: Serialize>(
    blobs: &Path,
    media_type: &str,
    value: &T,
) -> Result<OciDescriptor, DockhandError> {
    let data = serde_json::to_vec(value).map_err(image_error)?;
    let hex = hex_digest(&data);
    std::fs::write(blobs.join(&hex), &data).map_err(image_error)?;
    Ok(OciDescriptor {
        media_type: media_type.to_string(),
        digest: format!("sha256:{hex}"),
        size: data.len() as u64,
        annotations: BTreeMap::new(),
    })
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), DockhandError> {
    let data = serde_json::to_vec_pretty(value).map_err(image_error)?;
    std::fs::write(path, data).map_err(image_error)
}

/// Renames `staged` onto `final_dir`, retiring any previous image first.
fn publish(output_dir: &Path, staged: &Path, final_dir: &Path) -> Result<(), DockhandError> {
    let retired = tempfile::Builder::new()
        .prefix(".retired-")
        .tempdir_in(output_dir)
        .map_err(image_error)?;
    if final_dir.exists() {
        std::fs::rename(final_dir, retired.path().join("previous")).map_err(image_error)?;
    }
    std::fs::rename(staged, final_dir).map_err(image_error)
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T, DockhandError> {
    let data = std::fs::read(path).map_err(|e| image_error(format!("{}: {e}", path.display())))?;
    serde_json::from_slice(&data).map_err(|e| image_error(format!("{}: {e}", path.display())))
}

fn blob_file(image_dir: &Path, digest: &str) -> Result<PathBuf, DockhandError> {
    let hex = digest
        .strip_prefix("sha256:")
        .ok_or_else(|| image_error(format!("unsupported digest {digest}")))?;
    Ok(image_dir.join("blobs").join("sha256").join(hex))
}

fn read_verified_blob(image_dir: &Path, digest: &str) -> Result<Vec<u8>, DockhandError> {
    let path = blob_file(image_dir, digest)?;
    let data = std::fs::read(&path).map_err(|e| image_error(format!("{}: {e}", path.display())))?;
    let actual = format!("sha256:{}", hex_digest(&data));
    if actual != digest {
        return Err(image_error(format!(
            "blob {digest} is corrupt (found {actual})"
        )));
    }
    Ok(data)
}

fn read_manifest(image_dir: &Path) -> Result<(OciManifest, ImageConfig), DockhandError> {
    let index: OciIndex = read_json(&image_dir.join("index.json"))?;
    let descriptor = index
        .manifests
        .first()
        .ok_or_else(|| image_error("index.json lists no manifests"))?;

    let manifest: OciManifest =
        serde_json::from_slice(&read_verified_blob(image_dir, &descriptor.digest)?)
            .map_err(image_error)?;
    let config: ImageConfig =
        serde_json::from_slice(&read_verified_blob(image_dir, &manifest.config.digest)?)
            .map_err(image_error)?;
    Ok((manifest, config))
}

/// Reconstructs image metadata from an exported layout.
#[instrument]
pub fn read_image(image_dir: &Path) -> Result<ImageMetadata, DockhandError> {
    let (manifest, config) = read_manifest(image_dir)?;
    let labels = &config.config.labels;

    let base = labels
        .get(LABEL_BASE)
        .ok_or_else(|| image_error(format!("missing {LABEL_BASE} label")))
        .and_then(|b| EnvironmentDescriptor::parse(b))?;
    let installed = labels
        .get(LABEL_INSTALLED)
        .map(|s| {
            s.split(',')
                .filter(|p| !p.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    let env = config
        .config
        .env
        .iter()
        .map(|pair| {
            pair.split_once('=')
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .ok_or_else(|| image_error(format!("malformed Env entry {pair:?}")))
        })
        .collect::<Result<BTreeMap<_, _>, _>>()?;

    let network = match config.config.exposed_ports.keys().next() {
        Some(key) => Some(NetworkContract::parse(key)?),
        None => None,
    };

    if manifest.layers.len() != config.rootfs.diff_ids.len() {
        return Err(image_error("layer count does not match rootfs diff_ids"));
    }
    let layers = manifest
        .layers
        .iter()
        .zip(&config.rootfs.diff_ids)
        .map(|(layer, diff_id)| {
            let stage = match layer.annotations.get(ANNOTATION_STAGE).map(String::as_str) {
                Some("base") => StageKind::Base,
                Some("dependencies") => StageKind::Dependencies,
                Some("assembly") => StageKind::Assembly,
                other => {
                    return Err(image_error(format!(
                        "layer {} has unknown stage {other:?}",
                        layer.digest
                    )))
                }
            };
            Ok(LayerDescriptor {
                stage,
                digest: layer.digest.clone(),
                diff_id: diff_id.clone(),
                size: layer.size,
            })
        })
        .collect::<Result<Vec<_>, DockhandError>>()?;

    Ok(ImageMetadata {
        base,
        working_dir: ImagePath::parse(&config.config.working_dir)?,
        network,
        entrypoint: EntrypointCommand::new(config.config.entrypoint)?,
        env,
        installed,
        layers,
    })
}

/// Applies every layer, in order, onto `dest`.
#[instrument]
pub fn unpack_rootfs(image_dir: &Path, dest: &Path) -> Result<usize, DockhandError> {
    let (manifest, _) = read_manifest(image_dir)?;
    for layer in &manifest.layers {
        let blob = read_verified_blob(image_dir, &layer.digest)?;
        unpack_blob(&blob, dest)?;
    }
    info!(
        layers = manifest.layers.len(),
        dest = %dest.display(),
        "Unpacked image root filesystem"
    );
    Ok(manifest.layers.len())
}

/// Pipes the layout, as a tar stream, into `docker load`.
#[instrument]
pub async fn load_into_docker(image_dir: &Path) -> Result<String, DockhandError> {
    let mut builder = tar::Builder::new(Vec::new());
    builder
        .append_dir_all(".", image_dir)
        .map_err(|e| DockhandError::DockerError {
            message: e.to_string(),
        })?;
    let archive = builder
        .into_inner()
        .map_err(|e| DockhandError::DockerError {
            message: e.to_string(),
        })?;

    let mut child = Command::new("docker")
        .arg("load")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| DockhandError::DockerError {
            message: e.to_string(),
        })?;

    if let Some(mut stdin) = child.stdin.take() {
        stdin
            .write_all(&archive)
            .await
            .map_err(|e| DockhandError::DockerError {
                message: e.to_string(),
            })?;
    }

    let output = child
        .wait_with_output()
        .await
        .map_err(|e| DockhandError::DockerError {
            message: e.to_string(),
        })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        error!("docker load failed: {}", stderr);
        return Err(DockhandError::DockerError {
            message: format!("docker load failed: {stderr}"),
        });
    }

    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    info!("{}", stdout);
    Ok(stdout)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::LayerRecord;
    use crate::layer::seal;

    fn metadata_with_layer(cache: &mut LayerCache) -> ImageMetadata {
        let tree = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(tree.path().join("app")).unwrap();
        std::fs::write(tree.path().join("app/app.py"), "print('hi')\n").unwrap();
        let layer = seal(StageKind::Assembly, tree.path()).unwrap();
        let record = LayerRecord::from_sealed(&layer);
        cache.insert("k", &layer, record.clone()).unwrap();

        let mut env = BTreeMap::new();
        env.insert("APP_HOME".to_string(), "/app".to_string());
        ImageMetadata {
            base: EnvironmentDescriptor::parse("python:3.11.9-slim-bookworm").unwrap(),
            working_dir: ImagePath::parse("/app").unwrap(),
            network: Some(NetworkContract::parse("5000").unwrap()),
            entrypoint: EntrypointCommand::new(vec!["python".into(), "app.py".into()]).unwrap(),
            env,
            installed: vec!["x==1.2.3".to_string()],
            layers: vec![record.descriptor()],
        }
    }

    #[test]
    fn test_export_then_read_back() {
        let store = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        let mut cache = LayerCache::new(store.path().to_path_buf()).unwrap();
        let metadata = metadata_with_layer(&mut cache);

        let exporter = OciExporter::new(out.path());
        let dir = exporter.export("svc:dev", &metadata, &cache).unwrap();
        assert_eq!(dir, out.path().join("svc_dev"));
        assert!(dir.join("oci-layout").is_file());

        let read = read_image(&dir).unwrap();
        assert_eq!(read, metadata);

        let rootfs = tempfile::tempdir().unwrap();
        assert_eq!(unpack_rootfs(&dir, rootfs.path()).unwrap(), 1);
        assert!(rootfs.path().join("app/app.py").is_file());
    }

    #[test]
    fn test_reexport_replaces_previous_image() {
        let store = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        let mut cache = LayerCache::new(store.path().to_path_buf()).unwrap();
        let metadata = metadata_with_layer(&mut cache);
        let exporter = OciExporter::new(out.path());

        let first = exporter.export("svc", &metadata, &cache).unwrap();
        let index_before = std::fs::read(first.join("index.json")).unwrap();
        let second = exporter.export("svc", &metadata, &cache).unwrap();
        assert_eq!(first, second);
        assert_eq!(std::fs::read(second.join("index.json")).unwrap(), index_before);

        let leftovers: Vec<_> = std::fs::read_dir(out.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(leftovers, vec![std::ffi::OsString::from("svc")]);
    }

    #[test]
    fn test_corrupt_blob_detected() {
        let store = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        let mut cache = LayerCache::new(store.path().to_path_buf()).unwrap();
        let metadata = metadata_with_layer(&mut cache);
        let dir = OciExporter::new(out.path())
            .export("svc", &metadata, &cache)
            .unwrap();

        let layer_blob = blob_file(&dir, &metadata.layers[0].digest).unwrap();
        std::fs::write(layer_blob, b"garbage").unwrap();
        let rootfs = tempfile::tempdir().unwrap();
        assert!(matches!(
            unpack_rootfs(&dir, rootfs.path()),
            Err(DockhandError::ImageError { .. })
        ));
    }
}
