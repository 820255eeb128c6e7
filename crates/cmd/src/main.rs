// Copyright 2025 Crrow
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::{
    io::{BufRead, Write},
    path::PathBuf,
};

use clap::{Args, Parser, Subcommand};
use shardkeep_base::readable_size::ReadableSize;
use shardkeep_common_telemetry::{
    ConsoleStream, LogFormat, LoggingOptions, init_global_logging, set_panic_hook,
};
use shardkeep_job::{
    ChecksumMode, DEFAULT_SEGMENT_SIZE, Error, HistoryStore, JobConfig, JobController,
    StoreConfig,
};
use snafu::{ResultExt, Whatever, ensure_whatever, whatever};
use tracing::{info, warn};

mod build_info;
mod process;

#[derive(Debug, Parser)]
#[clap(
name = "shardkeep",
about= "Split a file into parts, process them resumably, and put the results back together",
author = build_info::AUTHOR,
version = build_info::FULL_VERSION)]
struct Cli {
    #[command(flatten)]
    logging: LogArgs,

    #[command(subcommand)]
    commands: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    Plan(PlanArgs),
    Status(StatusArgs),
    Run(RunArgs),
    Verify(VerifyArgs),
    Finalize(FinalizeArgs),
    Reset(ResetArgs),
    History(HistoryArgs),
}

#[derive(Debug, Clone, Args)]
struct LogArgs {
    /// Log filter, e.g. "info" or "info,shardkeep_job=debug"
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Also write hourly rolling log files into this directory
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,
}

impl LogArgs {
    fn options(&self) -> LoggingOptions {
        LoggingOptions::builder()
            .dir(
                self.log_dir
                    .as_ref()
                    .map(|d| d.to_string_lossy().into_owned())
                    .unwrap_or_default(),
            )
            .maybe_level(self.log_level.clone())
            .log_format(if self.json_logs {
                LogFormat::Json
            } else {
                LogFormat::Text
            })
            .console(ConsoleStream::Stderr)
            .build()
    }
}

/// Options shared by every command that works on one target.
#[derive(Debug, Clone, Args)]
struct JobArgs {
    /// File to split
    target: PathBuf,

    /// Root directory holding one work directory per target
    #[arg(long, default_value = "workdir")]
    workdir: PathBuf,

    /// Maximum part size for a new plan, e.g. "64MiB" [default: 64MiB].
    /// A planned job keeps the size it was planned with.
    #[arg(long)]
    segment_size: Option<ReadableSize>,

    /// Integrity token recorded per part: "length" or "sha256"
    #[arg(long, default_value_t = ChecksumMode::Length)]
    checksum: ChecksumMode,

    /// Extension of part files and of the final output
    #[arg(long, default_value = "zst")]
    extension: String,

    /// Discard an existing final output without asking
    #[arg(long, short)]
    yes: bool,
}

impl JobArgs {
    fn config(&self) -> JobConfig {
        JobConfig::builder()
            .workspace_root(self.workdir.clone())
            .segment_size(self.segment_size.unwrap_or(DEFAULT_SEGMENT_SIZE))
            .checksum_mode(self.checksum)
            .output_extension(self.extension.clone())
            .build()
    }

    async fn open(&self) -> Result<JobController, Whatever> {
        let job = JobController::open(self.config(), &self.target)
            .await
            .with_whatever_context(|_| format!("Failed to open job for {}", self.target.display()))?;
        if job.reset_occurred() {
            warn!("Previous progress for {} was discarded", self.target.display());
        }
        self.ensure_planned_size(&job)?;
        Ok(job)
    }

    /// Open a planned job read-only; `None` when nothing is planned yet.
    async fn open_existing(&self) -> Result<Option<JobController>, Whatever> {
        match JobController::open_existing(self.config(), &self.target).await {
            Ok(job) => Ok(Some(job)),
            Err(Error::JobNotFound { .. }) => Ok(None),
            Err(e) => Err(e).with_whatever_context(|_| {
                format!("Failed to open job for {}", self.target.display())
            }),
        }
    }

    /// An explicit `--segment-size` must agree with the recorded plan.
    fn ensure_planned_size(&self, job: &JobController) -> Result<(), Whatever> {
        if let Some(requested) = self.segment_size {
            ensure_whatever!(
                requested == job.segment_size(),
                "{} was planned with --segment-size {}; pass that size or remove {}",
                self.target.display(),
                job.segment_size(),
                job.layout().job_dir().display()
            );
        }
        Ok(())
    }

    /// Open the job and, if a stale final output blocks it, get consent to
    /// discard it.
    async fn open_unblocked(&self) -> Result<JobController, Whatever> {
        let mut job = self.open().await?;
        if let Some(path) = job.blocked_on() {
            let path = path.to_path_buf();
            ensure_whatever!(
                self.yes || confirm(&format!("{} already exists. Discard it?", path.display()))?,
                "Refusing to overwrite {}",
                path.display()
            );
            job.discard_existing_output()
                .await
                .whatever_context("Failed to discard existing output")?;
        }
        Ok(job)
    }
}

fn confirm(question: &str) -> Result<bool, Whatever> {
    let mut stdout = std::io::stdout().lock();
    write!(stdout, "{question} [y/N] ").whatever_context("Failed to write prompt")?;
    stdout.flush().whatever_context("Failed to write prompt")?;

    let mut answer = String::new();
    std::io::stdin()
        .lock()
        .read_line(&mut answer)
        .whatever_context("Failed to read answer")?;
    Ok(matches!(answer.trim(), "y" | "Y" | "yes"))
}

#[derive(Debug, Clone, Args)]
#[command(flatten_help = true)]
#[command(long_about = r"

Record the part plan for a file and print it.
Examples:

shardkeep plan big.iso --segment-size 128MiB

")]
struct PlanArgs {
    #[command(flatten)]
    job: JobArgs,
}

impl PlanArgs {
    async fn run(&self) -> Result<(), Whatever> {
        let job = self.job.open().await?;
        let parts = job.parts().await.whatever_context("Failed to read plan")?;
        println!(
            "{} ({} bytes) -> {}",
            self.job.target.display(),
            job.total_length(),
            job.layout().job_dir().display()
        );
        for (part_id, range) in parts {
            println!("{part_id:>6}  {range}  {}", ReadableSize(range.len()));
        }
        job.close().await;
        Ok(())
    }
}

#[derive(Debug, Clone, Args)]
#[command(flatten_help = true)]
#[command(long_about = r"

Show progress of the job for a file.
Examples:

shardkeep status big.iso

")]
struct StatusArgs {
    #[command(flatten)]
    job: JobArgs,
}

impl StatusArgs {
    async fn run(&self) -> Result<(), Whatever> {
        let Some(job) = self.job.open_existing().await? else {
            println!("no job recorded for {}", self.job.target.display());
            return Ok(());
        };
        let status = job.status().await.whatever_context("Failed to read status")?;
        println!("job:     {}", job.layout().job_dir().display());
        println!("segment: {}", job.segment_size());
        println!("parts:   {status}");
        if let Some(path) = job.blocked_on() {
            println!("blocked: {} already exists", path.display());
        } else if let Ok(len) = job.final_output_len().await {
            println!("final:   {} ({})", job.layout().final_output_path().display(), ReadableSize(len));
        }
        job.close().await;
        Ok(())
    }
}

#[derive(Debug, Clone, Args)]
#[command(flatten_help = true)]
#[command(long_about = r"

Compress every pending part with zstd, then verify and assemble the output.
Interrupted runs pick up where they stopped.
Examples:

shardkeep run big.iso --jobs 8

")]
struct RunArgs {
    #[command(flatten)]
    job: JobArgs,

    /// Parts processed concurrently (default: available parallelism)
    #[arg(long)]
    jobs: Option<usize>,

    /// zstd compression level
    #[arg(long, default_value_t = process::DEFAULT_LEVEL)]
    level: i32,
}

impl RunArgs {
    async fn run(&self) -> Result<(), Whatever> {
        let mut job = self.job.open_unblocked().await?;
        if job.is_resuming() {
            info!("Resuming {}", self.job.target.display());
        }

        let jobs = self.jobs.unwrap_or_else(|| {
            std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get)
        });
        let processed = process::process_pending(&job, jobs, self.level).await?;
        info!(processed, "No parts pending");

        let verification = process::verify_and_repair(&job, jobs, self.level).await?;
        if !verification.is_complete() {
            whatever!("Verification failed: {verification}; run `shardkeep reset` and retry");
        }
        let final_path = job.finalize().await.whatever_context("Failed to finalize")?;
        println!("{}", final_path.display());

        let history = HistoryStore::open(&self.job.workdir, &StoreConfig::default())
            .await
            .whatever_context("Failed to open run history")?;
        if history
            .record_run_completion()
            .await
            .whatever_context("Failed to record run")?
        {
            info!("Recorded run completion");
        }
        history.close().await;
        job.close().await;
        Ok(())
    }
}

#[derive(Debug, Clone, Args)]
#[command(flatten_help = true)]
#[command(long_about = r"

Check every recorded part output against its integrity token.
Examples:

shardkeep verify big.iso --checksum sha256

")]
struct VerifyArgs {
    #[command(flatten)]
    job: JobArgs,
}

impl VerifyArgs {
    async fn run(&self) -> Result<(), Whatever> {
        let Some(job) = self.job.open_existing().await? else {
            whatever!("No job recorded for {}", self.job.target.display());
        };
        let verification = job.verify().await.whatever_context("Failed to verify")?;
        job.close().await;
        ensure_whatever!(verification.is_complete(), "{verification}");
        println!("{verification}");
        Ok(())
    }
}

#[derive(Debug, Clone, Args)]
#[command(flatten_help = true)]
#[command(long_about = r"

Assemble verified part outputs into the final output.
Examples:

shardkeep finalize big.iso

")]
struct FinalizeArgs {
    #[command(flatten)]
    job: JobArgs,
}

impl FinalizeArgs {
    async fn run(&self) -> Result<(), Whatever> {
        let mut job = self.job.open_unblocked().await?;
        let final_path = job.finalize().await.whatever_context("Failed to finalize")?;
        println!("{}", final_path.display());
        job.close().await;
        Ok(())
    }
}

#[derive(Debug, Clone, Args)]
#[command(flatten_help = true)]
#[command(long_about = r"

Delete part outputs and forget all progress for a file.
Examples:

shardkeep reset big.iso --keep-final

")]
struct ResetArgs {
    #[command(flatten)]
    job: JobArgs,

    /// Leave an assembled final output in place
    #[arg(long)]
    keep_final: bool,
}

impl ResetArgs {
    async fn run(&self) -> Result<(), Whatever> {
        let mut job = self.job.open().await?;
        job.reset(self.keep_final)
            .await
            .whatever_context("Failed to reset")?;
        job.close().await;
        Ok(())
    }
}

#[derive(Debug, Clone, Args)]
#[command(flatten_help = true)]
#[command(long_about = r"

Print when a run last completed.
Examples:

shardkeep history --workdir /data/work

")]
struct HistoryArgs {
    /// Root directory holding one work directory per target
    #[arg(long, default_value = "workdir")]
    workdir: PathBuf,
}

impl HistoryArgs {
    async fn run(&self) -> Result<(), Whatever> {
        let history = HistoryStore::open(&self.workdir, &StoreConfig::default())
            .await
            .whatever_context("Failed to open run history")?;
        match history
            .last_run()
            .await
            .whatever_context("Failed to read run history")?
        {
            Some(at) => println!("last run completed at {at}"),
            None => println!("no completed runs"),
        }
        history.close().await;
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<(), Whatever> {
    let cli = Cli::parse();
    let _guards = init_global_logging(&cli.logging.options());
    set_panic_hook();

    match cli.commands {
        Commands::Plan(pa) => pa.run().await,
        Commands::Status(sa) => sa.run().await,
        Commands::Run(ra) => ra.run().await,
        Commands::Verify(va) => va.run().await,
        Commands::Finalize(fa) => fa.run().await,
        Commands::Reset(ra) => ra.run().await,
        Commands::History(ha) => ha.run().await,
    }
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn cli_is_well_formed() { Cli::command().debug_assert(); }

    #[test]
    fn job_args_parse_sizes_and_modes() {
        let cli = Cli::try_parse_from([
            "shardkeep",
            "run",
            "input.bin",
            "--segment-size",
            "1MiB",
            "--checksum",
            "sha256",
            "--yes",
        ])
        .unwrap();
        let Commands::Run(run) = cli.commands else {
            panic!("expected run");
        };
        let config = run.job.config();
        assert_eq!(run.job.segment_size, Some(ReadableSize::mb(1)));
        assert_eq!(config.segment_size, ReadableSize::mb(1));
        assert_eq!(config.checksum_mode, ChecksumMode::Sha256);
        assert_eq!(config.output_extension, "zst");
        assert!(run.job.yes);
        assert_eq!(run.level, process::DEFAULT_LEVEL);
    }

    #[test]
    fn segment_size_defaults_only_for_new_plans() {
        let cli = Cli::try_parse_from(["shardkeep", "status", "input.bin"]).unwrap();
        let Commands::Status(status) = cli.commands else {
            panic!("expected status");
        };
        assert_eq!(status.job.segment_size, None);
        assert_eq!(status.job.config().segment_size, DEFAULT_SEGMENT_SIZE);
        assert_eq!(cli.logging.options().console, ConsoleStream::Stderr);
    }

    #[tokio::test]
    async fn explicit_segment_size_must_match_plan() {
        let dir = tempfile::TempDir::new().unwrap();
        let target = dir.path().join("input.bin");
        tokio::fs::write(&target, vec![3u8; 100]).await.unwrap();
        let workdir = dir.path().join("work");
        let args = |size: &str| {
            let cli = Cli::try_parse_from([
                "shardkeep",
                "plan",
                target.to_str().unwrap(),
                "--workdir",
                workdir.to_str().unwrap(),
                "--segment-size",
                size,
            ])
            .unwrap();
            let Commands::Plan(plan) = cli.commands else {
                panic!("expected plan");
            };
            plan.job
        };

        args("40B").open().await.unwrap().close().await;
        args("40B").open().await.unwrap().close().await;
        assert!(args("10B").open().await.is_err());

        let job = args("10B").open_existing().await.unwrap().unwrap();
        assert_eq!(job.segment_size(), ReadableSize(40));
        assert_eq!(job.status().await.unwrap().total, 3);
    }
}
