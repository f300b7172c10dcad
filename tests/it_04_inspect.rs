#![cfg(unix)]

use dockhand::cli::{self, BuildArgs};
use dockhand_packaging::{unpack_rootfs, LintCode, INSTALL_RECORD};
use dockhand_testsupport::*;

fn build_args(ws: &TestWorkspace) -> BuildArgs {
    BuildArgs {
        file: None,
        tag: Some("addressbook:dev".to_string()),
        load: false,
        metrics_file: None,
        context: ws.context_dir(),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn unpacked_rootfs_matches_layers() -> anyhow::Result<()> {
    let ws = TestWorkspace::new()?;
    ws.write_service_context(true)?;
    let outcome = cli::build(&ws.config, &build_args(&ws)).await?;

    let dest = tempfile::tempdir()?;
    assert_eq!(unpack_rootfs(&outcome.image_dir, dest.path())?, 3);

    let root = dest.path();
    assert!(root.join("usr/local/bin/python").is_file());
    assert_eq!(
        std::fs::read_link(root.join("usr/local/bin/python"))?,
        std::path::Path::new("python3")
    );
    assert_eq!(std::fs::read_to_string(root.join("app/app.py"))?, SERVICE_APP);
    assert!(root.join("app/Dockhandfile").is_file());
    assert!(root
        .join("usr/local/lib/dockhand/site-packages")
        .join(INSTALL_RECORD)
        .is_file());
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn inspect_reports_layers_in_order() -> anyhow::Result<()> {
    let ws = TestWorkspace::new()?;
    ws.write_service_context(true)?;
    let outcome = cli::build(&ws.config, &build_args(&ws)).await?;

    let inspected = cli::inspect(&outcome.image_dir)?;
    let stages: Vec<&str> = inspected["image"]["layers"]
        .as_array()
        .expect("layers array")
        .iter()
        .filter_map(|l| l["stage"].as_str())
        .collect();
    assert_eq!(stages, vec!["base", "dependencies", "assembly"]);
    assert_eq!(inspected["image"]["base"]["runtime_version"], "3.11.9");
    assert_eq!(inspected["image"]["base"]["os_base"], "slim-bookworm");
    Ok(())
}

#[test]
fn lint_clean_context() -> anyhow::Result<()> {
    let ws = TestWorkspace::new()?;
    ws.write_service_context(true)?;
    assert!(cli::lint_context(&ws.config, &ws.context_dir(), None)?.is_empty());
    Ok(())
}

#[test]
fn lint_flags_configuration_problems() -> anyhow::Result<()> {
    let ws = TestWorkspace::new()?;
    ws.write_service_context(true)?;
    ws.remove_context_file("requirements.lock")?;
    ws.write_context_file(
        "Dockhandfile",
        &SERVICE_BUILD_FILE
            .replace(SERVICE_BASE, "python:3.11")
            .replace("EXPOSE 5000\n", ""),
    )?;

    let codes: Vec<LintCode> = cli::lint_context(&ws.config, &ws.context_dir(), None)?
        .into_iter()
        .map(|f| f.code)
        .collect();
    assert!(codes.contains(&LintCode::UnpinnedBase));
    assert!(codes.contains(&LintCode::ManifestWithoutLock));
    assert!(codes.contains(&LintCode::NoExposedPort));
    Ok(())
}

#[test]
fn lint_detects_stale_lock() -> anyhow::Result<()> {
    let ws = TestWorkspace::new()?;
    ws.write_service_context(false)?;
    ws.write_context_file("requirements.txt", "x==1.2.3\nflask==3.0.0\n")?;

    let findings = cli::lint_context(&ws.config, &ws.context_dir(), None)?;
    assert_eq!(findings.len(), 1);
    assert_eq!(findings[0].code, LintCode::LockOutOfDate);
    assert!(findings[0].to_string().starts_with("lock-out-of-date: "));
    Ok(())
}
