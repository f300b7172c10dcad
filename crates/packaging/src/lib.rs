pub mod assembler;
pub mod base;
pub mod buildfile;
pub mod cache;
pub mod context;
pub mod installer;
pub mod layer;
pub mod lint;
pub mod lockfile;
pub mod oci;
pub mod plan;
pub mod runner;
pub mod service;

pub use assembler::*;
pub use base::*;
pub use buildfile::*;
pub use cache::*;
pub use context::*;
pub use installer::*;
pub use layer::*;
pub use lint::*;
pub use lockfile::*;
pub use oci::*;
pub use plan::*;
pub use runner::*;
pub use service::*;

#[cfg(test)]
mod tests {
    use super::*;
    use dockhand_models::StageKind;

    #[test]
    fn test_seeded_files_only_in_dependency_stage() {
        let file = BuildFile::parse(
            "FROM python:3.11.9-slim\n\
             WORKDIR /app\n\
             COPY requirements.txt requirements.lock ./\n\
             COPY . .\n\
             CMD [\"python\", \"app.py\"]\n",
        )
        .unwrap();
        let plan = BuildPlan::from_build_file(&file, &["/bin/sh".into(), "-c".into()]).unwrap();

        assert_eq!(plan.dependencies.kind, StageKind::Dependencies);
        let seeded: Vec<&String> = plan
            .dependencies
            .copies()
            .flat_map(|op| op.sources.iter())
            .collect();
        assert_eq!(seeded, vec!["requirements.txt", "requirements.lock"]);
        assert!(plan.assembly.copies().all(CopyOp::is_whole_context));
    }

    #[test]
    fn test_cache_key_ignores_source_edits() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("requirements.txt"), "X==1.2.3\n").unwrap();
        std::fs::write(dir.path().join("app.py"), "v1").unwrap();
        let seed = vec!["requirements.txt".to_string()];

        let before = BuildContext::open(dir.path()).unwrap().hash_sources(&seed).unwrap();
        std::fs::write(dir.path().join("app.py"), "v2").unwrap();
        let after = BuildContext::open(dir.path()).unwrap().hash_sources(&seed).unwrap();
        assert_eq!(cache_key(["deps", &before]), cache_key(["deps", &after]));
    }
}
