//! Rodentprep command-line entrypoint.

use anyhow::Context;
use clap::{Parser, ValueEnum};
use rodentprep::cancellation::CancellationToken;
use rodentprep::config::EngineConfig;
use rodentprep::coordinator::{cleanup, RunCoordinator, RunOptions, RunReport};
use rodentprep::core::Budget;
use rodentprep::observability::{init_logging, LogFormat};
use rodentprep::scheduler::CrashPolicy;
use rodentprep::workflows::{build_workflow, BidsDataset, WorkflowOptions, DEFAULT_TEMPLATE};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Exit status for usage, configuration and graph errors.
const EXIT_USAGE: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum AnalysisLevel {
    Participant,
}

#[derive(Debug, Parser)]
#[command(name = "rodentprep")]
#[command(author, version, about = "Preprocessing of rodent anatomical and functional MRI", long_about = None)]
struct Cli {
    /// Root of the input BIDS dataset
    bids_dir: PathBuf,

    /// Root of the derivatives tree
    output_dir: PathBuf,

    /// Processing stage
    #[arg(value_enum)]
    analysis_level: AnalysisLevel,

    /// Working directory holding the cache, step outputs and reports
    #[arg(short = 'w', long, default_value = "./work")]
    work_dir: PathBuf,

    /// Faster, less accurate registration (for testing)
    #[arg(long)]
    sloppy: bool,

    /// Run anatomical steps only
    #[arg(long)]
    anat_only: bool,

    /// Maximum threads per step
    #[arg(long)]
    omp_nthreads: Option<usize>,

    /// Maximum threads across all running steps
    #[arg(long)]
    nprocs: Option<usize>,

    /// Memory available to running steps, in GB
    #[arg(long)]
    mem_gb: Option<f64>,

    /// Skip dataset validation
    #[arg(long)]
    skip_bids_validation: bool,

    /// Opt out of usage tracking (accepted for compatibility; nothing is tracked)
    #[arg(long)]
    notrack: bool,

    /// Increase log verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Process only these participants (with or without the `sub-` prefix)
    #[arg(long, num_args = 1..)]
    participant_label: Vec<String>,

    /// YAML engine configuration
    #[arg(long)]
    config_file: Option<PathBuf>,

    /// License file passed to licensed tools
    #[arg(long, env = "FS_LICENSE")]
    fs_license_file: Option<PathBuf>,

    /// Output spaces; each gets its own normalisation
    #[arg(long = "template", visible_alias = "output-spaces", num_args = 1.., default_value = DEFAULT_TEMPLATE)]
    templates: Vec<String>,

    /// Stop scheduling new steps after the first failure
    #[arg(long)]
    stop_on_first_crash: bool,

    /// Truncate volumetric images left by failed steps
    #[arg(long)]
    truncate_failed_outputs: bool,

    /// Remove failed cache entries after the run
    #[arg(long)]
    clean_failed_cache: bool,

    /// Log line format (text or json)
    #[arg(long, default_value = "text")]
    log_format: LogFormat,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.log_format);

    match run(cli).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("rodentprep: {e:#}");
            ExitCode::from(EXIT_USAGE)
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<u8> {
    if cli.notrack {
        debug!("Usage tracking disabled");
    }

    let config = match &cli.config_file {
        Some(path) => EngineConfig::load(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => EngineConfig::default(),
    };

    let nprocs = cli.nprocs.unwrap_or_else(|| {
        std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get)
    });
    let mut budget = Budget::new(nprocs, cli.omp_nthreads.unwrap_or(nprocs));
    if let Some(mem_gb) = cli.mem_gb {
        budget = budget.with_mem_gb(mem_gb);
    }

    let crash_policy = if cli.stop_on_first_crash {
        CrashPolicy::StopOnFirstCrash
    } else {
        config.execution.crash_policy()
    };

    if let Some(license) = &cli.fs_license_file {
        if !license.is_file() {
            warn!(path = %license.display(), "License file does not exist");
        }
    }

    let dataset = BidsDataset::discover(&cli.bids_dir, &cli.participant_label)
        .await
        .context("indexing the input dataset")?;

    let workflow_options = WorkflowOptions::new(&cli.output_dir)
        .with_sloppy(cli.sloppy)
        .with_anat_only(cli.anat_only)
        .with_skip_bids_validation(cli.skip_bids_validation)
        .with_omp_nthreads(budget.omp_nthreads)
        .with_templates(&cli.templates);
    let graph = build_workflow(&dataset, &workflow_options, &config)
        .context("building the workflow")?;

    let run_options = RunOptions::new(&cli.work_dir, budget)
        .with_crash_policy(crash_policy)
        .with_hash_method(config.execution.hash_method)
        .with_poll_sleep(config.execution.poll_sleep())
        .with_license_file(cli.fs_license_file.clone());

    let cancel = Arc::new(CancellationToken::new());
    let interrupt = Arc::clone(&cancel);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            interrupt.cancel("interrupted");
        }
    });

    let coordinator = RunCoordinator::open(run_options)
        .await
        .context("opening the working directory")?
        .with_cancellation(cancel);

    info!(
        subjects = dataset.subjects.len(),
        steps = graph.len(),
        nprocs = budget.nprocs,
        omp_nthreads = budget.omp_nthreads,
        "Starting rodentprep"
    );
    let report = coordinator.run(&graph).await.context("running the workflow")?;

    if cli.truncate_failed_outputs {
        cleanup::truncate_indeterminate(&report)
            .await
            .context("truncating failed outputs")?;
    }
    if cli.clean_failed_cache {
        cleanup::invalidate_failed(&report, coordinator.store().as_ref())
            .await
            .context("cleaning failed cache entries")?;
    }

    match coordinator.store().entries().await {
        Ok(entries) => info!(entries = entries.len(), "Cache holds entries"),
        Err(e) => warn!(error = %e, "Cannot list cache entries"),
    }

    print_summary(&report);
    Ok(u8::try_from(report.exit_code()).unwrap_or(1))
}

fn print_summary(report: &RunReport) {
    println!(
        "Run {} finished: {:?} ({} executed, {} cached, {} failed, {} not run)",
        report.run_id,
        report.status,
        report.executed().len(),
        report.cached().len(),
        report.failed().len(),
        report.not_run().len(),
    );
    for step in report.own_failures() {
        println!(
            "  {} failed: {}",
            step.name,
            step.error.as_ref().map(ToString::to_string).unwrap_or_default()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_flags() {
        let cli = Cli::try_parse_from([
            "rodentprep",
            "/data/bids",
            "/data/out",
            "participant",
            "-w",
            "/scratch",
            "--sloppy",
            "--anat-only",
            "--nprocs",
            "8",
            "--omp-nthreads",
            "4",
            "-vv",
            "--participant-label",
            "01",
            "sub-02",
            "--log-format",
            "json",
        ])
        .unwrap();

        assert_eq!(cli.work_dir, PathBuf::from("/scratch"));
        assert!(cli.sloppy && cli.anat_only);
        assert_eq!(cli.nprocs, Some(8));
        assert_eq!(cli.omp_nthreads, Some(4));
        assert_eq!(cli.verbose, 2);
        assert_eq!(cli.participant_label, vec!["01", "sub-02"]);
        assert_eq!(cli.log_format, LogFormat::Json);
        assert_eq!(cli.analysis_level, AnalysisLevel::Participant);
        assert_eq!(cli.templates, vec![DEFAULT_TEMPLATE]);
    }

    #[test]
    fn test_parse_output_spaces() {
        let cli = Cli::try_parse_from([
            "rodentprep",
            "/in",
            "/out",
            "participant",
            "--template",
            "Fischer344",
            "SIGMA",
            "--output-spaces",
            "WHS",
        ])
        .unwrap();

        assert_eq!(cli.templates, vec!["Fischer344", "SIGMA", "WHS"]);
    }

    #[test]
    fn test_rejects_unknown_analysis_level() {
        assert!(Cli::try_parse_from(["rodentprep", "/in", "/out", "group"]).is_err());
    }
}
