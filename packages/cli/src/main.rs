#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! CLI entry point for the POS report sync engine.

mod config;

use std::path::PathBuf;
use std::time::Instant;

use clap::{Args, Parser, Subcommand};
use pos_sync::stage::EXTRACT_STAGE_VERSION;
use pos_sync::{ChunkOutcome, StageOutcome, SyncRequest, SyncSummary, run_extract_stage};
use pos_sync_branch::BranchRegistry;
use pos_sync_cli_utils::IndicatifProgress;
use pos_sync_interval::{DATE_FORMAT, DateInterval};
use pos_sync_portal::{PortalClient, ReportKind};

use crate::config::{Overrides, Settings};

#[derive(Parser)]
#[command(name = "pos_sync", about = "Incremental POS report sync")]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct GlobalArgs {
    /// TOML settings file (values there are overridden by `WS_*` env vars and flags)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Branch configuration JSON (overrides `WS_SUCURSALES`)
    #[arg(long, global = true)]
    branches_file: Option<PathBuf>,
    /// Root of the data tree (overrides `POS_SYNC_DATA_ROOT`)
    #[arg(long, global = true)]
    data_root: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Download every missing chunk of a report for a date range
    Sync {
        /// Report kind: Detail, Consolidated, Payments or `TransfersIssued`
        #[arg(long)]
        report: ReportKind,
        /// First day of the range (YYYY-MM-DD)
        #[arg(long)]
        start: String,
        /// Last day of the range, inclusive (YYYY-MM-DD)
        #[arg(long)]
        end: String,
        /// Comma-separated list of branches to sync (default: all)
        #[arg(long)]
        branches: Option<String>,
        /// Maximum days per export request
        #[arg(long)]
        chunk_size_days: Option<u32>,
        /// Run even if the ledger says this range is already done
        #[arg(long)]
        force: bool,
        /// Stage version recorded in the ledger
        #[arg(long, default_value = EXTRACT_STAGE_VERSION)]
        stage_version: String,
        /// Portal base URL (overrides `WS_BASE`)
        #[arg(long)]
        base_url: Option<String>,
    },
    /// List configured branches and their code windows
    Branches {
        /// Only show the code each branch used on this day (YYYY-MM-DD)
        #[arg(long)]
        date: Option<String>,
    },
    /// Resolve the provider code a branch used on a given day
    CodeAt {
        /// Branch name (e.g., "Kavia")
        branch: String,
        /// Day to resolve (YYYY-MM-DD)
        date: String,
    },
    /// Show on-disk coverage per code, and what is missing for a range
    Coverage {
        /// Report kind whose output tree is scanned
        #[arg(long)]
        report: ReportKind,
        /// First day of the range to check for gaps
        #[arg(long, requires = "end")]
        start: Option<String>,
        /// Last day of the range to check for gaps
        #[arg(long, requires = "start")]
        end: Option<String>,
    },
    /// Show the extract stage record for a range
    Ledger {
        /// Report kind whose ledger is read
        #[arg(long)]
        report: ReportKind,
        /// First day of the range
        #[arg(long)]
        start: String,
        /// Last day of the range
        #[arg(long)]
        end: String,
        /// Stage version to compare against
        #[arg(long, default_value = EXTRACT_STAGE_VERSION)]
        stage_version: String,
    },
}

#[allow(clippy::too_many_lines)]
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let multi = pos_sync_cli_utils::init_logger();
    let cli = Cli::parse();

    let mut overrides = Overrides {
        branches_file: cli.global.branches_file,
        data_root: cli.global.data_root,
        ..Overrides::default()
    };

    match cli.command {
        Commands::Sync {
            report,
            start,
            end,
            branches,
            chunk_size_days,
            force,
            stage_version,
            base_url,
        } => {
            overrides.base_url = base_url;
            overrides.chunk_size_days = chunk_size_days;
            let settings = Settings::load(cli.global.config.as_deref(), &overrides)?;
            log::debug!("{settings:?}");

            let registry = BranchRegistry::from_path(&settings.branches_file)?;
            let range = DateInterval::parse(&start, &end)?;
            let client = PortalClient::new(settings.portal_config()?)?;

            let mut request = SyncRequest::new(report, range, settings.raw_root(report));
            request.branches = branches.as_deref().map(split_list);
            request.chunk_size_days = settings.chunk_size_days;

            let started = Instant::now();
            let progress = IndicatifProgress::windows_bar(&multi, &format!("{report} {range}"));
            let outcome = run_extract_stage(
                &registry,
                &client,
                &request,
                &stage_version,
                force,
                Some(progress),
            )
            .await?;

            match outcome {
                StageOutcome::Skipped(record) => {
                    println!(
                        "{report} {range}: already extracted ({}, {} branch(es), last run {})",
                        record.stage_version,
                        record.branches.len(),
                        record.last_run.format("%Y-%m-%d %H:%M:%S"),
                    );
                    println!("Use --force to run it again.");
                }
                StageOutcome::Ran(summary) => {
                    print_summary(&summary);
                    log::info!(
                        "{report} {range}: finished in {:.1}s",
                        started.elapsed().as_secs_f64()
                    );
                    if summary.failed() > 0 {
                        return Err(format!(
                            "{} of {} chunk(s) failed; run again to retry them",
                            summary.failed(),
                            summary.chunks().count()
                        )
                        .into());
                    }
                }
            }
        }
        Commands::Branches { date } => {
            let settings = Settings::load(cli.global.config.as_deref(), &overrides)?;
            let registry = BranchRegistry::from_path(&settings.branches_file)?;

            if let Some(date) = date {
                let day = pos_sync_interval::parse_date(&date)?;
                println!("{:<24} CODE", "BRANCH");
                println!("{}", "-".repeat(40));
                for (branch, code) in registry.codes_on(day) {
                    println!("{branch:<24} {code}");
                }
                return Ok(());
            }

            println!("{:<24} {:<10} {:<12} {:<12} KEY", "BRANCH", "CODE", "FROM", "TO");
            println!("{}", "-".repeat(72));
            for (branch, windows) in registry.iter() {
                for window in windows {
                    let from = if window.starts_unbounded() {
                        "-".to_owned()
                    } else {
                        window.valid_from.format(DATE_FORMAT).to_string()
                    };
                    let to = window
                        .valid_to
                        .map_or_else(|| "-".to_owned(), |to| to.format(DATE_FORMAT).to_string());
                    println!(
                        "{branch:<24} {:<10} {from:<12} {to:<12} {}",
                        window.code, window.source_key
                    );
                }
            }
        }
        Commands::CodeAt { branch, date } => {
            let settings = Settings::load(cli.global.config.as_deref(), &overrides)?;
            let registry = BranchRegistry::from_path(&settings.branches_file)?;
            let day = pos_sync_interval::parse_date(&date)?;
            println!("{}", registry.code_at(&branch, day)?);
        }
        Commands::Coverage { report, start, end } => {
            let settings = Settings::load(cli.global.config.as_deref(), &overrides)?;
            let root = settings.raw_root(report);
            let coverage = pos_sync_coverage::scan_all(&root);

            println!("{}", root.display());
            println!("{:<10} COVERED", "CODE");
            println!("{}", "-".repeat(50));
            for (code, spans) in &coverage {
                println!("{code:<10} {}", join(spans));
            }

            let (Some(start), Some(end)) = (start, end) else {
                return Ok(());
            };
            let range = DateInterval::parse(&start, &end)?;
            let registry = BranchRegistry::from_path(&settings.branches_file)?;

            println!();
            println!("{:<24} {:<10} {:<24} MISSING", "BRANCH", "CODE", "WINDOW");
            println!("{}", "-".repeat(80));
            for (branch, _) in registry.iter() {
                for window in registry.windows_for(branch, &range)? {
                    let Some(span) = window.overlap(&range) else {
                        continue;
                    };
                    let covered = coverage.get(&window.code).map_or(&[][..], Vec::as_slice);
                    let gaps = pos_sync_interval::subtract(span, covered);
                    println!(
                        "{branch:<24} {:<10} {:<24} {}",
                        window.code,
                        span.to_string(),
                        join(&gaps)
                    );
                }
            }
        }
        Commands::Ledger {
            report,
            start,
            end,
            stage_version,
        } => {
            let settings = Settings::load(cli.global.config.as_deref(), &overrides)?;
            let root = settings.raw_root(report);
            let range = DateInterval::parse(&start, &end)?;

            match pos_sync_ledger::read(&root, &range) {
                Some(record) => {
                    println!("{}", pos_sync_ledger::record_path(&root, &range).display());
                    println!("  status:   {:?}", record.status);
                    println!("  version:  {}", record.stage_version);
                    println!("  last run: {}", record.last_run.to_rfc3339());
                    println!("  branches: {}", record.branches.join(", "));
                }
                None => println!("{report} {range}: no record"),
            }
            let would_run = pos_sync_ledger::should_run(&root, &range, &stage_version, false);
            println!(
                "{report} {range}: {} for version {stage_version}",
                if would_run { "would run" } else { "up to date" }
            );
        }
    }

    Ok(())
}

fn print_summary(summary: &SyncSummary) {
    println!(
        "{:<24} {:<10} {:<24} {:>5} {:>5} {:>6}",
        "BRANCH", "CODE", "WINDOW", "GAPS", "OK", "FAILED"
    );
    println!("{}", "-".repeat(80));
    for window in &summary.windows {
        let failed = window.chunks.iter().filter(|c| c.is_failed()).count();
        println!(
            "{:<24} {:<10} {:<24} {:>5} {:>5} {:>6}",
            window.branch,
            window.code,
            window.window.to_string(),
            window.gaps.len(),
            window.chunks.len() - failed,
            failed,
        );
        for chunk in &window.chunks {
            if let ChunkOutcome::Failed { chunk, error } = chunk {
                let note = if error.is_fatal() { " (needs attention)" } else { "" };
                println!("    {chunk}: {error}{note}");
            }
        }
    }
    for name in &summary.unknown_branches {
        println!("{name}: not in the branch configuration");
    }
    println!(
        "{} chunk(s) downloaded, {} failed",
        summary.downloaded(),
        summary.failed()
    );
}

fn split_list(list: &str) -> Vec<String> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
        .collect()
}

fn join(intervals: &[DateInterval]) -> String {
    if intervals.is_empty() {
        return "none".to_owned();
    }
    intervals
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_sync_arguments() {
        let cli = Cli::try_parse_from([
            "pos_sync",
            "--data-root",
            "/srv/data",
            "sync",
            "--report",
            "payments",
            "--start",
            "2025-01-01",
            "--end",
            "2025-01-31",
            "--branches",
            "Kavia, Punto Valle,",
            "--force",
        ])
        .unwrap();

        assert_eq!(cli.global.data_root, Some(PathBuf::from("/srv/data")));
        let Commands::Sync {
            report,
            branches,
            force,
            stage_version,
            chunk_size_days,
            ..
        } = cli.command
        else {
            panic!("expected sync");
        };
        assert_eq!(report, ReportKind::Payments);
        assert!(force);
        assert_eq!(stage_version, EXTRACT_STAGE_VERSION);
        assert_eq!(chunk_size_days, None);
        assert_eq!(
            split_list(&branches.unwrap()),
            vec!["Kavia".to_owned(), "Punto Valle".to_owned()]
        );
    }

    #[test]
    fn rejects_unknown_report() {
        assert!(
            Cli::try_parse_from([
                "pos_sync", "sync", "--report", "Inventory", "--start", "2025-01-01", "--end",
                "2025-01-02",
            ])
            .is_err()
        );
    }

    #[test]
    fn coverage_range_needs_both_ends() {
        assert!(
            Cli::try_parse_from(["pos_sync", "coverage", "--report", "Detail", "--start", "2025-01-01"])
                .is_err()
        );
    }

    #[test]
    fn joins_intervals_for_display() {
        assert_eq!(join(&[]), "none");
        let a = DateInterval::parse("2025-01-01", "2025-01-05").unwrap();
        let b = DateInterval::parse("2025-02-01", "2025-02-02").unwrap();
        assert_eq!(join(&[a, b]), "2025-01-01_2025-01-05, 2025-02-01_2025-02-02");
    }
}
