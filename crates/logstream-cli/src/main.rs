//! logstream - CI build-log tooling
//!
//! ## Commands
//!
//! - `parse`: split a saved console log into stages with a pass/fail verdict
//! - `tail`: follow a running build's console log until it finishes

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use logstream_core::{
    classify, ChunkFetcher, JenkinsFetcher, StageBlock, UpstreamConfig, VerdictRule,
};
use serde::Serialize;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, Level};

#[derive(Parser)]
#[command(name = "logstream")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "CI build-log streaming and stage analysis", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Split a saved console log into stages
    Parse {
        /// Console log file
        file: PathBuf,

        /// Print stages as JSON
        #[arg(long)]
        json: bool,
    },

    /// Follow a build's console log until the build finishes
    Tail {
        /// Job name; folders separated by '/'
        #[arg(long)]
        job: String,

        /// Build number
        #[arg(long)]
        build: u64,

        /// CI server base URL
        #[arg(long, env = "LOGSTREAM_UPSTREAM_URL")]
        url: String,

        #[arg(long, env = "LOGSTREAM_UPSTREAM_USER")]
        user: Option<String>,

        #[arg(long, env = "LOGSTREAM_UPSTREAM_TOKEN", hide_env_values = true)]
        token: Option<String>,

        /// Sleep between fetches, in milliseconds
        #[arg(long, default_value_t = 1000)]
        interval_ms: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { Level::DEBUG } else { Level::WARN };
    logstream_core::init_tracing(cli.json_logs, level);

    match cli.command {
        Commands::Parse { file, json } => {
            let stdout = std::io::stdout();
            cmd_parse(&file, json, &mut stdout.lock())
        }
        Commands::Tail {
            job,
            build,
            url,
            user,
            token,
            interval_ms,
        } => {
            let mut config = UpstreamConfig::new(&url);
            if let (Some(user), Some(token)) = (user, token) {
                config = config.with_credentials(&user, &token);
            }
            let fetcher = JenkinsFetcher::new(config)
                .context("Failed to build upstream client")?;
            let stdout = std::io::stdout();
            let bytes = cmd_tail(
                &fetcher,
                &job,
                build,
                Duration::from_millis(interval_ms),
                &mut stdout.lock(),
            )
            .await?;
            debug!(bytes, "build log finished");
            Ok(())
        }
    }
}

/// Stage row printed by `parse --json`.
#[derive(Debug, Serialize)]
struct StageReport {
    #[serde(flatten)]
    stage: StageBlock,
    rule: VerdictRule,
}

fn stage_reports(raw: &str) -> Vec<StageReport> {
    logstream_core::parse(&logstream_core::clean(raw))
        .into_iter()
        .map(|stage| StageReport {
            rule: classify(&stage.log).rule,
            stage,
        })
        .collect()
}

/// Parse a saved console log
fn cmd_parse(path: &Path, json: bool, out: &mut impl Write) -> Result<()> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read console log: {:?}", path))?;
    let reports = stage_reports(&raw);

    if json {
        serde_json::to_writer_pretty(&mut *out, &reports)
            .context("Failed to encode stages")?;
        writeln!(out)?;
        return Ok(());
    }

    if reports.is_empty() {
        writeln!(out, "No stages found in {:?}", path)?;
        return Ok(());
    }

    for report in &reports {
        let verdict = if report.stage.success { "PASS" } else { "FAIL" };
        // A stage can fail on the pipeline-wide marker even though its own
        // log passed the rules.
        let forced = if report.stage.success != classify(&report.stage.log).success {
            " (pipeline failed)"
        } else {
            ""
        };
        writeln!(
            out,
            "{:>3}  {}  {:<24} {:?}{}",
            report.stage.order_index, verdict, report.stage.name, report.rule, forced
        )?;
    }

    let failed = reports.iter().filter(|r| !r.stage.success).count();
    writeln!(out)?;
    writeln!(out, "{} stages, {} failed", reports.len(), failed)?;
    Ok(())
}

/// Print a build's log progressively. Returns the final byte offset.
async fn cmd_tail(
    fetcher: &dyn ChunkFetcher,
    job: &str,
    build: u64,
    interval: Duration,
    out: &mut impl Write,
) -> Result<u64> {
    let mut offset = 0;
    loop {
        let chunk = fetcher
            .fetch(job, build, offset)
            .await
            .with_context(|| format!("Failed to fetch {} #{} at offset {}", job, build, offset))?;

        let text = logstream_core::clean(&chunk.text);
        if !text.is_empty() {
            out.write_all(text.as_bytes())?;
            out.flush()?;
        }
        offset = chunk.next_offset;

        if !chunk.has_more {
            return Ok(offset);
        }
        tokio::time::sleep(interval).await;
    }
}
