#![cfg(unix)]

use dockhand::cli::{self, BuildArgs};
use dockhand_testsupport::*;

fn build_args(ws: &TestWorkspace) -> BuildArgs {
    BuildArgs {
        file: None,
        tag: Some("addressbook:1.0".to_string()),
        load: false,
        metrics_file: Some(ws.root.path().join("metrics.prom")),
        context: ws.context_dir(),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn reference_service_builds_and_inspects() -> anyhow::Result<()> {
    let ws = TestWorkspace::new()?;
    ws.write_service_context(true)?;

    let outcome = cli::build(&ws.config, &build_args(&ws)).await?;
    assert!(outcome.image_dir.ends_with("addressbook_1.0"));
    assert_eq!(outcome.layers.len(), 3);

    let inspected = cli::inspect(&outcome.image_dir)?;
    assert_eq!(inspected["runtime"]["cwd"], "/app");
    assert_eq!(
        inspected["runtime"]["args"],
        serde_json::json!(["python", "app.py"])
    );
    assert_eq!(inspected["runtime"]["exposed_port"], 5000);
    assert_eq!(inspected["image"]["installed"], serde_json::json!(["x==1.2.3"]));

    let metrics = std::fs::read_to_string(ws.root.path().join("metrics.prom"))?;
    assert!(metrics.contains("dockhand_builds_total"));
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn default_tag_follows_context_dir() -> anyhow::Result<()> {
    let ws = TestWorkspace::new()?;
    ws.write_service_context(true)?;

    let mut args = build_args(&ws);
    args.tag = None;
    let outcome = cli::build(&ws.config, &args).await?;
    assert!(outcome.image_dir.ends_with("context_latest"));
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn config_file_drives_build() -> anyhow::Result<()> {
    let ws = TestWorkspace::new()?;
    ws.write_service_context(true)?;
    let path = ws.write_config_file()?;

    let config = dockhand::load_config(Some(&path))?;
    assert_eq!(config, ws.config);
    let outcome = cli::build(&config, &build_args(&ws)).await?;
    assert!(outcome.image_dir.starts_with(&config.output.dir));
    Ok(())
}
