//! simcall - run a simulation program over a sample of input points
//!
//! ## Commands
//!
//! - `run`: evaluate a host-in job and write its host-out results
//! - `split`: stage one host-in job per host
//! - `gather`: merge the host-out results of a split job

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn, Level};

use simcall_core::descriptor::{read_json, write_json_atomic};
use simcall_core::{
    gather, partition, stage_jobs, CoreDispatcher, DispatchConfig, DispatchError, HostDescriptor,
    JobDescriptor, ReplyTo, SampleResult,
};

#[derive(Parser)]
#[command(name = "simcall")]
#[command(version = simcall_core::VERSION)]
#[command(about = "Evaluate an external simulation code over a sample of points", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Evaluate a job and write its result descriptor
    Run {
        /// Job descriptor (host-in.json)
        #[arg(long)]
        job: PathBuf,

        /// Result path (default: the destination named by the job)
        #[arg(short, long)]
        out: Option<PathBuf>,

        #[command(flatten)]
        dispatch: DispatchArgs,
    },

    /// Split a job across hosts and stage one host-in.json per host
    Split {
        #[command(flatten)]
        hosts: HostArgs,
    },

    /// Merge the results of a split job
    Gather {
        #[command(flatten)]
        hosts: HostArgs,

        /// Where to write the merged result descriptor
        #[arg(short, long)]
        out: PathBuf,
    },
}

/// Overrides for the job's `dispatch` section.
#[derive(clap::Args, Debug, Default)]
struct DispatchArgs {
    /// Maximum number of points evaluated at once
    #[arg(long, env = "SIMCALL_WORKERS")]
    workers: Option<usize>,

    /// Per-point timeout in milliseconds
    #[arg(long, env = "SIMCALL_TIMEOUT_MS")]
    timeout_ms: Option<u64>,

    /// Timeout for the whole sample in milliseconds
    #[arg(long, env = "SIMCALL_BATCH_TIMEOUT_MS")]
    batch_timeout_ms: Option<u64>,

    /// Abort on the first failing point
    #[arg(long, env = "SIMCALL_FAIL_FAST")]
    fail_fast: bool,

    /// Keep per-point workspaces
    #[arg(long, env = "SIMCALL_RETAIN")]
    retain: bool,
}

impl DispatchArgs {
    fn apply(&self, config: &mut DispatchConfig) {
        if let Some(workers) = self.workers {
            config.max_concurrent_workers = workers;
        }
        if self.timeout_ms.is_some() {
            config.per_point_timeout_ms = self.timeout_ms;
        }
        if self.batch_timeout_ms.is_some() {
            config.batch_timeout_ms = self.batch_timeout_ms;
        }
        config.fail_fast |= self.fail_fast;
        config.retain_workspaces |= self.retain;
    }
}

#[derive(clap::Args, Debug)]
struct HostArgs {
    /// Job descriptor covering the whole sample
    #[arg(long)]
    job: PathBuf,

    /// JSON array of {"name", "workdir"} host entries
    #[arg(long)]
    hosts: PathBuf,

    /// Directory hosts write their results under (default: <job dir>/replies)
    #[arg(long)]
    reply_dir: Option<PathBuf>,

    /// Host name recorded as the results' destination
    #[arg(long, default_value = "localhost")]
    reply_host: String,
}

impl HostArgs {
    fn load(&self) -> Result<(JobDescriptor, Vec<HostDescriptor>, ReplyTo)> {
        let job = JobDescriptor::load(&self.job)
            .with_context(|| format!("Failed to load job {}", self.job.display()))?;
        let hosts = load_hosts(&self.hosts)?;
        let directory = match &self.reply_dir {
            Some(dir) => dir.clone(),
            None => parent_dir(&self.job).join("replies"),
        };
        let reply = ReplyTo {
            host: self.reply_host.clone(),
            directory,
        };
        Ok((job, hosts, reply))
    }
}

fn parent_dir(path: &Path) -> PathBuf {
    match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

/// Read a hosts file; relative workdirs are taken relative to the file.
fn load_hosts(path: &Path) -> Result<Vec<HostDescriptor>> {
    let mut hosts: Vec<HostDescriptor> = read_json(path)
        .with_context(|| format!("Failed to load hosts {}", path.display()))?;
    let base = parent_dir(path);
    for host in &mut hosts {
        if host.workdir.is_relative() {
            host.workdir = base.join(&host.workdir);
        }
    }
    Ok(hosts)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    simcall_core::init_tracing(cli.json, level);

    match cli.command {
        Commands::Run { job, out, dispatch } => cmd_run(&job, out.as_deref(), &dispatch).await,
        Commands::Split { hosts } => cmd_split(&hosts),
        Commands::Gather { hosts, out } => cmd_gather(&hosts, &out),
    }
}

async fn cmd_run(job_path: &Path, out: Option<&Path>, overrides: &DispatchArgs) -> Result<()> {
    let mut job = JobDescriptor::load(job_path)
        .with_context(|| format!("Failed to load job {}", job_path.display()))?;
    overrides.apply(&mut job.dispatch);

    let mut dispatcher = CoreDispatcher::for_job(&job);
    dispatcher.load(&job).context("Job rejected")?;

    let aborted = match dispatcher.exec_sample().await {
        Ok(_) => None,
        Err(DispatchError::FailFast { index, source, .. }) => Some((index, source)),
        Err(e) => return Err(e).context("Dispatch failed"),
    };

    let written = match out {
        Some(path) => dispatcher.write_to(path).map(|()| path.to_path_buf()),
        None => dispatcher.write(),
    }
    .context("Failed to write results")?;
    info!(path = %written.display(), "result descriptor written");

    let result = dispatcher.result().cloned().unwrap_or_default();
    print_summary(&result);
    println!("Results: {}", written.display());

    if let Some((index, source)) = aborted {
        anyhow::bail!("Aborted after point {index} failed: {source}");
    }
    if result.failed() > 0 {
        anyhow::bail!("{} of {} points failed", result.failed(), result.len());
    }
    Ok(())
}

fn print_summary(result: &SampleResult) {
    println!("{}", result.summary());
    for (index, error) in result.failures() {
        println!("  [{index}] {}: {}", error.kind, error.message);
        let stderr = error.stderr.trim();
        if !stderr.is_empty() {
            println!("      stderr: {}", stderr.lines().last().unwrap_or(stderr));
        }
    }
}

fn cmd_split(args: &HostArgs) -> Result<()> {
    let (job, hosts, reply) = args.load()?;
    let host_jobs = partition(&job, &hosts, &reply).context("Failed to partition job")?;
    if host_jobs.len() < hosts.len() {
        warn!(
            hosts = hosts.len(),
            used = host_jobs.len(),
            "fewer points than hosts; some hosts stay idle"
        );
    }
    let staged = stage_jobs(&host_jobs).context("Failed to stage host jobs")?;

    for (host_job, path) in host_jobs.iter().zip(&staged) {
        let points = host_job.job.sample.resolve().map(|s| s.len()).unwrap_or(0);
        println!(
            "{:<16} points {}..{}  {}",
            host_job.host.name,
            host_job.job.first_index,
            host_job.job.first_index + points,
            path.display()
        );
    }
    println!("Staged {} host job(s)", staged.len());
    Ok(())
}

fn cmd_gather(args: &HostArgs, out: &Path) -> Result<()> {
    let (job, hosts, reply) = args.load()?;
    let merged = gather(&job, &hosts, &reply).context("Failed to gather host results")?;
    write_json_atomic(out, &merged)
        .with_context(|| format!("Failed to write {}", out.display()))?;

    print_summary(&merged.sample_result());
    println!("Results: {}", out.display());
    if merged.failed > 0 {
        anyhow::bail!("{} of {} points failed", merged.failed, merged.outcomes.len());
    }
    Ok(())
}
