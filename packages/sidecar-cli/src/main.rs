//! Command-line tools for the sidecar.
//!
//! Results go to stdout as JSON; logs go to stderr.

use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use sidecar::scripted::ScriptedSurface;
use sidecar::{build_prompt, parse_response, JobId, MemoryJobStore, SidecarBuilder, SidecarConfig};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "sidecar")]
#[command(about = "Run and inspect sidecar jobs")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Parse a raw response (file or stdin) and print the result
    Parse {
        /// Read from this file instead of stdin
        file: Option<PathBuf>,
    },

    /// Print the prompt that would be sent for a topic
    Prompt {
        #[arg(long)]
        topic: String,
        #[arg(long, default_value_t = 1)]
        prompt_version: i32,
    },

    /// Run one job end to end against a scripted surface
    Simulate {
        #[arg(long)]
        topic: String,

        /// Delay between streamed chunks
        #[arg(long, default_value_t = 200)]
        chunk_ms: u64,

        /// Number of chunks the answer is streamed in
        #[arg(long, default_value_t = 8)]
        chunks: usize,

        /// Make the surface refuse the submission
        #[arg(long)]
        fail_submit: bool,

        /// Accept the submission but never answer
        #[arg(long)]
        silent: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,sidecar=debug".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_line_number(true),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Parse { file } => parse(file),
        Commands::Prompt {
            topic,
            prompt_version,
        } => {
            println!("{}", build_prompt(&topic, JobId::new_v4(), prompt_version));
            Ok(())
        }
        Commands::Simulate {
            topic,
            chunk_ms,
            chunks,
            fail_submit,
            silent,
        } => simulate(&topic, chunk_ms, chunks, fail_submit, silent).await,
    }
}

fn parse(file: Option<PathBuf>) -> Result<()> {
    let raw = match file {
        Some(path) => std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?,
        None => {
            let mut buf = String::new();
            std::io::stdin()
                .read_to_string(&mut buf)
                .context("failed to read stdin")?;
            buf
        }
    };

    let parsed = parse_response(&raw);
    println!("{}", serde_json::to_string_pretty(&parsed)?);
    Ok(())
}

/// A plausible answer: prose around a fenced JSON block.
fn canned_answer(topic: &str) -> Result<String> {
    let payload = serde_json::json!({
        "v": 1,
        "concept": topic,
        "simple": format!("{topic}, explained with an everyday analogy."),
        "technical": format!("{topic}, explained precisely with the underlying mechanics."),
    });
    Ok(format!(
        "Here is the structured explanation you asked for.\n\n```json\n{}\n```\n\nLet me know if you want more detail.",
        serde_json::to_string_pretty(&payload)?
    ))
}

async fn simulate(
    topic: &str,
    chunk_ms: u64,
    chunks: usize,
    fail_submit: bool,
    silent: bool,
) -> Result<()> {
    let config = SidecarConfig::from_env()?;

    let mut surface = if silent {
        ScriptedSurface::silent()
    } else {
        ScriptedSurface::answering(&canned_answer(topic)?, chunks)
            .with_chunk_interval(Duration::from_millis(chunk_ms))
    };
    if fail_submit {
        surface = surface.failing_submit("submit button not found");
    }

    let store = Arc::new(MemoryJobStore::new());
    let sidecar = SidecarBuilder::new(store, Arc::new(surface))
        .with_config(config.clone())
        .launch()
        .await
        .context("failed to start sidecar")?;

    let Some(job_id) = sidecar.trigger(topic).await? else {
        sidecar.shutdown().await;
        bail!("topic is empty");
    };

    // Long enough for the watchdog or a capture failure to settle the job
    let limit = config.watchdog_delay.max(config.new_unit_timeout + config.stabilization_timeout)
        + Duration::from_secs(1);
    let record = sidecar.wait_for_terminal(job_id, limit).await?;

    sidecar.shutdown().await;

    match record {
        Some(record) => {
            tracing::info!(job_id = %job_id, status = %record.status, "simulation finished");
            println!("{}", serde_json::to_string_pretty(&record)?);
            Ok(())
        }
        None => bail!("job {job_id} disappeared from the store"),
    }
}
