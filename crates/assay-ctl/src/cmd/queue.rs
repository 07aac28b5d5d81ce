//! Inference queue commands. These talk to the job store directly; assayd
//! picks up whatever is enqueued here.

use anyhow::{Context, Result};
use serde_json::{Map, Value};

use assay_core::JobState;
use assay_services::job_store::{JobRecord, ModelRef, NewJob};
use assay_services::JobStore;

pub fn cmd_enqueue(
    model: &str,
    storage_uri: &str,
    inputs: &str,
    endpoint: Option<&str>,
    owner: Option<&str>,
) -> Result<()> {
    let inputs: Map<String, Value> =
        serde_json::from_str(inputs).context("inputs must be a JSON object")?;
    let store = super::open_store(&super::load_config()?)?;
    let record = store.enqueue(NewJob {
        model: ModelRef {
            name: model.to_string(),
            storage_uri: storage_uri.to_string(),
            endpoint: endpoint.map(String::from),
        },
        inputs,
        owner: owner.map(String::from),
    })?;
    println!("Enqueued job {} ({})", record.id, record.model.name);
    Ok(())
}

pub fn cmd_jobs(state: Option<&str>) -> Result<()> {
    let state: Option<JobState> = state
        .map(|s| s.parse::<JobState>().map_err(anyhow::Error::msg))
        .transpose()?;
    let store = super::open_store(&super::load_config()?)?;
    let jobs = store.list(state)?;

    if jobs.is_empty() {
        println!("No jobs.");
        return Ok(());
    }

    println!("═══════════════════════════════════════");
    println!("  Jobs ({})", jobs.len());
    println!("═══════════════════════════════════════");
    for job in &jobs {
        print_job(job);
    }
    Ok(())
}

fn print_job(job: &JobRecord) {
    println!("  ┌─ {} {}", job.id, job.model.name);
    println!("  │  state     : {}", job.state);
    println!("  │  retries   : {}", job.retry_count);
    if let Some(remote) = &job.remote_job_id {
        println!("  │  remote id : {remote}");
    }
    if let Some(error) = &job.error {
        println!("  │  error     : {error}");
    }
    println!("  └─ created   : {}", job.created_at.to_rfc3339());
}

pub fn cmd_events(id: i64) -> Result<()> {
    let config = super::load_config()?;
    let store = super::open_store(&config)?;
    let events = store.events(id)?;

    println!("═══════════════════════════════════════");
    println!("  Events for job {id}");
    println!("═══════════════════════════════════════");
    for event in &events {
        let code = event
            .response_code
            .map(|c| format!(" HTTP {c}"))
            .unwrap_or_default();
        println!(
            "  {}  {:<14} {:<9} retry={}{}",
            event.at.to_rfc3339(),
            event.event_type.as_str(),
            event.state.as_str(),
            event.retry_count,
            code
        );
        if let Some(message) = &event.message {
            println!("      {message}");
        }
    }

    if let Some(output) = events.last().and_then(|e| e.output_json.as_deref()) {
        match assay_services::response::parse(output, &config.queue.primary_key) {
            Ok(parsed) => println!("\n{}", parsed.pretty()),
            Err(e) => println!("\n  unparseable output: {e}"),
        }
    }
    Ok(())
}

pub fn cmd_files(id: i64) -> Result<()> {
    let store = super::open_store(&super::load_config()?)?;
    let files = store.output_files(id)?;
    if files.is_empty() {
        println!("No output files for job {id}.");
        return Ok(());
    }
    for file in &files {
        let tags: Vec<String> = file.tags.iter().map(|t| format!("{}:{}", t.kind, t.name)).collect();
        println!("  {}  {}  [{}]", file.file_type, file.uri, tags.join(", "));
    }
    Ok(())
}

pub fn cmd_cancel(id: i64, reason: &str) -> Result<()> {
    let store = super::open_store(&super::load_config()?)?;
    let record = store.cancel(id, reason)?;
    println!("Cancelled job {} ({})", record.id, record.model.name);
    Ok(())
}
