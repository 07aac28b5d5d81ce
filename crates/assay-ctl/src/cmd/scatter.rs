//! Scatter commands: expand, render, run.

use std::path::Path;

use anyhow::{bail, Context, Result};

use assay_core::{io, scatter, JobState, Tool};
use assay_services::{RunSummary, Runner};

fn load_tool(path: &str) -> Result<Tool> {
    Tool::from_path(Path::new(path)).with_context(|| format!("failed to load tool {path}"))
}

pub fn cmd_expand(tool_path: &str, input_dir: &str, out: &str) -> Result<()> {
    let tool = load_tool(tool_path)?;
    let expansion = scatter::expand_dir(Path::new(input_dir), &tool)
        .with_context(|| format!("failed to match inputs in {input_dir}"))?;

    if !expansion.empty_slots.is_empty() {
        bail!(
            "no files matched input slot(s) {} in {input_dir}; nothing to run",
            expansion.empty_slots.join(", ")
        );
    }

    io::write_io_list(Path::new(out), &expansion.descriptors)?;
    println!(
        "Expanded {} into {} job(s) → {}",
        tool.name,
        expansion.descriptors.len(),
        out
    );
    Ok(())
}

pub fn cmd_render(tool_path: &str, io_path: &str, backend: &str) -> Result<()> {
    let config = super::load_config()?;
    let tool = load_tool(tool_path)?;
    let list = io::read_io_list(Path::new(io_path))?;
    let runner = Runner::new(super::backend(backend, &config)?, &config.run);

    let lines = runner.dry_run(&tool, &list)?;
    if lines.is_empty() {
        println!("No pending jobs in {io_path}.");
    }
    for line in lines {
        println!("{line}");
    }
    Ok(())
}

pub async fn cmd_run(tool_path: &str, io_path: &str, backend: &str, retry: bool) -> Result<()> {
    let config = super::load_config()?;
    let tool = load_tool(tool_path)?;
    let runner = Runner::new(super::backend(backend, &config)?, &config.run);
    let path = Path::new(io_path);

    let summary = if retry {
        runner.retry_failed(&tool, path).await?
    } else {
        runner.run_io_list(&tool, path).await?
    };
    print_summary(&summary);

    let list = io::read_io_list(path)?;
    for (i, job) in list.iter().enumerate() {
        if matches!(job.state, JobState::Failed | JobState::Error) {
            println!(
                "  job {i} {}: {}",
                job.state,
                job.err_msg.as_deref().unwrap_or("no message")
            );
        }
    }
    Ok(())
}

fn print_summary(summary: &RunSummary) {
    println!("═══════════════════════════════════════");
    println!("  Run Summary");
    println!("═══════════════════════════════════════");
    println!("  Completed : {}", summary.completed);
    println!("  Failed    : {}", summary.failed);
    println!("  Errored   : {}", summary.errored);
    println!("  Skipped   : {}", summary.skipped);
}
