//! assay-ctl: command-line interface for scatter runs and the inference queue.

use anyhow::{Context, Result};

mod cmd;

const DEFAULT_BACKEND: &str = "container";
const DEFAULT_IO_LIST: &str = "io.json";

fn print_usage() {
    println!("Usage: assay-ctl <command> [options]");
    println!();
    println!("Scatter:");
    println!("  expand <tool.json> <input-dir> [-o <io.json>]   Expand inputs into an IO list");
    println!("  render <tool.json> <io.json>                    Print the command each pending job would run");
    println!("  run <tool.json> <io.json> [--retry]             Run pending jobs (or re-run failed ones)");
    println!();
    println!("Inference queue:");
    println!("  enqueue <model> <storage-uri> <inputs-json>     Queue a job for assayd");
    println!("          [--endpoint <path-or-url>] [--owner <id>]");
    println!("  jobs [state]                                    List jobs, optionally by state");
    println!("  events <id>                                     Show a job's event history");
    println!("  files <id>                                      Show a job's output files");
    println!("  cancel <id> [reason]                            Cancel a queued or running job");
    println!();
    println!("Options:");
    println!("  --backend <container|network>   Execution backend (default: {DEFAULT_BACKEND})");
}

/// Flags pulled out of the argument list; everything else is positional.
#[derive(Default)]
struct Flags {
    backend: Option<String>,
    out: Option<String>,
    endpoint: Option<String>,
    owner: Option<String>,
    retry: bool,
}

fn parse_args(args: &[String]) -> Result<(Flags, Vec<&str>)> {
    let mut flags = Flags::default();
    let mut positional = Vec::new();
    let mut i = 0;
    while i < args.len() {
        let arg = args[i].as_str();
        match arg {
            "--backend" | "-o" | "--out" | "--endpoint" | "--owner" => {
                i += 1;
                let value = args
                    .get(i)
                    .cloned()
                    .with_context(|| format!("{arg} requires a value"))?;
                match arg {
                    "--backend" => flags.backend = Some(value),
                    "--endpoint" => flags.endpoint = Some(value),
                    "--owner" => flags.owner = Some(value),
                    _ => flags.out = Some(value),
                }
            }
            "--retry" => flags.retry = true,
            other => positional.push(other),
        }
        i += 1;
    }
    Ok((flags, positional))
}

fn job_id(raw: &str) -> Result<i64> {
    raw.parse()
        .with_context(|| format!("job id must be a number, got {raw:?}"))
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let (flags, positional) = parse_args(&args)?;
    let backend = flags.backend.as_deref().unwrap_or(DEFAULT_BACKEND);

    match positional.as_slice() {
        ["expand", tool, dir] => {
            cmd::scatter::cmd_expand(tool, dir, flags.out.as_deref().unwrap_or(DEFAULT_IO_LIST))
        }
        ["render", tool, io] => cmd::scatter::cmd_render(tool, io, backend),
        ["run", tool, io] => cmd::scatter::cmd_run(tool, io, backend, flags.retry).await,
        ["enqueue", model, uri, inputs] => cmd::queue::cmd_enqueue(
            model,
            uri,
            inputs,
            flags.endpoint.as_deref(),
            flags.owner.as_deref(),
        ),
        ["jobs"] => cmd::queue::cmd_jobs(None),
        ["jobs", state] => cmd::queue::cmd_jobs(Some(*state)),
        ["events", id] => cmd::queue::cmd_events(job_id(id)?),
        ["files", id] => cmd::queue::cmd_files(job_id(id)?),
        ["cancel", id] => cmd::queue::cmd_cancel(job_id(id)?, "cancelled by operator"),
        ["cancel", id, reason] => cmd::queue::cmd_cancel(job_id(id)?, reason),
        ["help"] | ["--help"] | ["-h"] | [] => {
            print_usage();
            Ok(())
        }
        other => {
            eprintln!("Unknown command: {}", other.join(" "));
            eprintln!();
            print_usage();
            std::process::exit(1);
        }
    }
}
