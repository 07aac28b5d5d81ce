//! Scatter runner on the local container backend. The docker test skips
//! when no docker daemon is reachable.

use std::sync::Arc;

use serde_json::json;

use assay_core::config::{ContainerConfig, RunConfig};
use assay_core::{scatter, JobState, Tool};
use assay_services::backend::ContainerBackend;
use assay_services::Runner;

use crate::*;

fn copy_tool() -> Tool {
    serde_json::from_value(json!({
        "name": "copy",
        "baseCommand": ["sh", "-c"],
        "arguments": ["cp $(inputs.text.filepath) /outputs/$(inputs.text.basename).copy"],
        "dockerPull": "busybox:1.36",
        "inputs": { "text": { "type": "File", "glob": ["*.txt"] } },
        "outputs": { "copied": { "type": "File", "glob": ["*.copy"] } }
    }))
    .unwrap()
}

fn runner(root: &std::path::Path) -> Runner {
    let backend = ContainerBackend::new(&ContainerConfig::default());
    let config = RunConfig {
        work_dir: root.join("work"),
        concurrency: 2,
    };
    Runner::new(Arc::new(backend), &config)
}

#[test]
fn test_container_dry_run_matches_executed_argv() {
    let root = temp_dir("container-dry");
    write_files(&root.join("in"), &[("a.txt", "alpha")]);
    let tool = copy_tool();
    let list = scatter::expand_dir(&root.join("in"), &tool).unwrap().descriptors;

    let lines = runner(&root).dry_run(&tool, &list).unwrap();
    let work = root.join("work").join("0");
    let expected = format!(
        "docker run -v {}:/inputs -v {}:/outputs busybox:1.36 sh -c \"cp /inputs/a.txt /outputs/a.copy\"",
        work.join("inputs").display(),
        work.join("outputs").display()
    );
    assert_eq!(lines, vec![expected]);
}

#[tokio::test]
async fn test_container_jobs_run_and_resolve_outputs() {
    if !docker_available() {
        eprintln!("SKIP: docker not available");
        return;
    }

    let root = temp_dir("container-run");
    write_files(&root.join("in"), &[("a.txt", "alpha"), ("b.txt", "beta")]);
    let tool = copy_tool();
    let mut list = scatter::expand_dir(&root.join("in"), &tool).unwrap().descriptors;

    let summary = runner(&root).run(&tool, &mut list).await.unwrap();
    assert_eq!(summary.completed, 2, "jobs: {list:#?}");

    for job in &list {
        assert_eq!(job.state, JobState::Completed);
        let copied = job.outputs["copied"].file_path().unwrap();
        let original = job.inputs["text"].file_path().unwrap();
        assert_eq!(
            std::fs::read_to_string(copied).unwrap(),
            std::fs::read_to_string(original).unwrap()
        );
    }
}

#[tokio::test]
async fn test_container_nonzero_exit_is_reported() {
    if !docker_available() {
        eprintln!("SKIP: docker not available");
        return;
    }

    let root = temp_dir("container-fail");
    write_files(&root.join("in"), &[("a.txt", "alpha")]);
    let mut tool = copy_tool();
    tool.arguments = vec!["echo boom >&2; exit 3".into()];
    let mut list = scatter::expand_dir(&root.join("in"), &tool).unwrap().descriptors;

    let summary = runner(&root).run(&tool, &mut list).await.unwrap();
    assert_eq!(summary.failed, 1);
    let err = list[0].err_msg.as_deref().unwrap();
    assert!(err.contains("code 3"), "unexpected error: {err}");
    assert!(err.contains("boom"));
}
