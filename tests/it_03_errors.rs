#![cfg(unix)]

use dockhand::cli::{self, BuildArgs};
use dockhand_models::{BuildPhase, DockhandError};
use dockhand_testsupport::*;

fn build_args(ws: &TestWorkspace) -> BuildArgs {
    BuildArgs {
        file: None,
        tag: Some("addressbook:dev".to_string()),
        load: false,
        metrics_file: Some(ws.root.path().join("metrics.prom")),
        context: ws.context_dir(),
    }
}

fn dockhand_error(err: &anyhow::Error) -> &DockhandError {
    err.downcast_ref::<DockhandError>()
        .unwrap_or_else(|| panic!("not a build error: {err:#}"))
}

#[tokio::test(flavor = "multi_thread")]
async fn missing_lock_is_reported_and_counted() -> anyhow::Result<()> {
    let ws = TestWorkspace::new()?;
    ws.write_service_context(true)?;
    ws.remove_context_file("requirements.lock")?;

    let err = cli::build(&ws.config, &build_args(&ws)).await.unwrap_err();
    let err = dockhand_error(&err);
    assert!(matches!(err, DockhandError::LockFileMissing { .. }));
    assert_eq!(err.phase(), BuildPhase::Dependencies);

    // Metrics are still written for failed builds.
    let metrics = std::fs::read_to_string(ws.root.path().join("metrics.prom"))?;
    assert!(metrics.contains("dockhand_build_failures_total"));
    assert!(metrics.contains(r#"phase="dependencies""#));
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn malformed_build_file_fails_in_parse_phase() -> anyhow::Result<()> {
    let ws = TestWorkspace::new()?;
    ws.write_service_context(true)?;
    ws.write_context_file("Dockhandfile", "WORKDIR /app\nFROM python:3.11.9-slim-bookworm\n")?;

    let err = cli::build(&ws.config, &build_args(&ws)).await.unwrap_err();
    assert_eq!(dockhand_error(&err).phase(), BuildPhase::Parse);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn copy_before_workdir_is_rejected() -> anyhow::Result<()> {
    let ws = TestWorkspace::new()?;
    ws.write_service_context(true)?;
    ws.write_context_file(
        "Dockhandfile",
        "FROM python:3.11.9-slim-bookworm\nCOPY . .\nENTRYPOINT [\"python\", \"app.py\"]\n",
    )?;

    let err = cli::build(&ws.config, &build_args(&ws)).await.unwrap_err();
    assert!(matches!(
        dockhand_error(&err),
        DockhandError::WorkingDirUnset { .. }
    ));
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn unknown_package_fails_dependency_stage() -> anyhow::Result<()> {
    let ws = TestWorkspace::new()?;
    ws.write_service_context(false)?;
    ws.write_context_file("requirements.txt", "x==1.2.3\nflask==3.0.0\n")?;
    ws.write_context_file("requirements.lock", "x==1.2.3\nflask==3.0.0\n")?;

    let err = cli::build(&ws.config, &build_args(&ws)).await.unwrap_err();
    let err = dockhand_error(&err);
    assert!(
        matches!(err, DockhandError::PackageUnavailable { package, .. } if package == "flask"),
        "{err:?}"
    );
    assert!(!ws.root.path().join("images/addressbook_dev").exists());
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn failed_rebuild_keeps_previous_image() -> anyhow::Result<()> {
    let ws = TestWorkspace::new()?;
    ws.write_service_context(true)?;
    let good = cli::build(&ws.config, &build_args(&ws)).await?;

    ws.write_context_file(
        "Dockhandfile",
        &SERVICE_BUILD_FILE.replace("EXPOSE 5000", "RUN false\nEXPOSE 5000"),
    )?;
    let err = cli::build(&ws.config, &build_args(&ws)).await.unwrap_err();
    assert!(matches!(
        dockhand_error(&err),
        DockhandError::CommandFailed { phase: BuildPhase::Assembly, .. }
    ));

    let inspected = cli::inspect(&good.image_dir)?;
    assert_eq!(inspected["runtime"]["exposed_port"], 5000);
    Ok(())
}
