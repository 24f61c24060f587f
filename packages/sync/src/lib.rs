#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Incremental report synchronization.
//!
//! For every branch, the orchestrator resolves the provider codes that were
//! valid during the requested range, looks at what is already on disk for
//! each code, and downloads only the missing days in chunks no longer than
//! the configured maximum. A run that finds everything on disk makes no
//! requests at all.

pub mod exporter;
pub mod partition;
pub mod progress;
pub mod stage;

use std::path::PathBuf;
use std::sync::Arc;

use pos_sync_branch::BranchRegistry;
use pos_sync_interval::{DateInterval, IntervalError};
use pos_sync_ledger::{LedgerError, StageStatus};
use pos_sync_portal::{ExtractionError, ReportKind};

pub use exporter::ReportExporter;
pub use progress::ProgressCallback;
pub use stage::{StageOutcome, run_extract_stage};

/// Default maximum number of days per export request.
pub const DEFAULT_CHUNK_SIZE_DAYS: u32 = 180;

/// Errors that stop a sync run before any download starts.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// The request itself is invalid (e.g., zero chunk size).
    #[error(transparent)]
    Interval(#[from] IntervalError),

    /// The output root could not be prepared.
    #[error("I/O error at {path}: {source}")]
    Io {
        /// Path being accessed.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// The stage record could not be written.
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

/// Why a single chunk failed.
#[derive(Debug, thiserror::Error)]
pub enum ChunkError {
    /// The portal export failed.
    #[error(transparent)]
    Extraction(#[from] ExtractionError),

    /// The downloaded file could not be stored.
    #[error("failed to store download: {0}")]
    Io(#[from] std::io::Error),
}

impl ChunkError {
    /// Whether re-running the chunk cannot succeed until someone fixes
    /// credentials, configuration or the portal itself.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::Extraction(e) if e.is_fatal())
    }
}

/// What to synchronize.
#[derive(Debug, Clone)]
pub struct SyncRequest {
    /// Report family to download.
    pub report: ReportKind,
    /// Requested date range (inclusive).
    pub range: DateInterval,
    /// Root of the partitioned output tree for this report.
    pub output_root: PathBuf,
    /// Restrict the run to these branches. `None` means every branch.
    pub branches: Option<Vec<String>>,
    /// Maximum days per export request.
    pub chunk_size_days: u32,
}

impl SyncRequest {
    /// Request for every branch with the default chunk size.
    #[must_use]
    pub fn new(report: ReportKind, range: DateInterval, output_root: impl Into<PathBuf>) -> Self {
        Self {
            report,
            range,
            output_root: output_root.into(),
            branches: None,
            chunk_size_days: DEFAULT_CHUNK_SIZE_DAYS,
        }
    }
}

/// Result of one chunk.
#[derive(Debug)]
pub enum ChunkOutcome {
    /// The chunk was downloaded and stored.
    Downloaded {
        /// Days covered.
        chunk: DateInterval,
        /// Where the file was written.
        path: PathBuf,
        /// File size.
        bytes: usize,
    },
    /// The chunk failed; sibling chunks were still attempted.
    Failed {
        /// Days that were requested.
        chunk: DateInterval,
        /// Cause.
        error: ChunkError,
    },
}

impl ChunkOutcome {
    /// Days this outcome is about.
    #[must_use]
    pub const fn chunk(&self) -> &DateInterval {
        match self {
            Self::Downloaded { chunk, .. } | Self::Failed { chunk, .. } => chunk,
        }
    }

    /// Whether the chunk failed.
    #[must_use]
    pub const fn is_failed(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }
}

/// Work done for one code window of one branch.
#[derive(Debug)]
pub struct WindowOutcome {
    /// Logical branch.
    pub branch: String,
    /// Provider code valid during `window`.
    pub code: String,
    /// The window, clamped to the requested range.
    pub window: DateInterval,
    /// Uncovered sub-ranges found at the start of the window's work.
    pub gaps: Vec<DateInterval>,
    /// One entry per attempted chunk, in request order.
    pub chunks: Vec<ChunkOutcome>,
}

impl WindowOutcome {
    /// Whether the window was already fully on disk.
    #[must_use]
    pub fn was_covered(&self) -> bool {
        self.gaps.is_empty()
    }
}

/// Everything a sync run did.
#[derive(Debug, Default)]
pub struct SyncSummary {
    /// Branches that were processed, sorted.
    pub branches: Vec<String>,
    /// Requested branches that are not in the registry.
    pub unknown_branches: Vec<String>,
    /// One entry per code window, in processing order.
    pub windows: Vec<WindowOutcome>,
}

impl SyncSummary {
    /// Every chunk outcome across all windows.
    pub fn chunks(&self) -> impl Iterator<Item = &ChunkOutcome> {
        self.windows.iter().flat_map(|w| w.chunks.iter())
    }

    /// Number of chunks downloaded.
    #[must_use]
    pub fn downloaded(&self) -> usize {
        self.chunks().filter(|c| !c.is_failed()).count()
    }

    /// Number of chunks that failed.
    #[must_use]
    pub fn failed(&self) -> usize {
        self.chunks().filter(|c| c.is_failed()).count()
    }

    /// Ledger status for this run: `Ok` when nothing failed, `Failed` when
    /// nothing succeeded, `Partial` otherwise.
    #[must_use]
    pub fn status(&self) -> StageStatus {
        match (self.downloaded(), self.failed()) {
            (_, 0) => StageStatus::Ok,
            (0, _) => StageStatus::Failed,
            _ => StageStatus::Partial,
        }
    }
}

/// Downloads every missing chunk of `request`.
///
/// Branches are processed in name order, each branch's code windows in date
/// order. Coverage is read from disk at the start of each window. Failed
/// chunks are logged and recorded in the summary without stopping the run.
///
/// # Errors
///
/// * [`SyncError::Interval`] if `chunk_size_days` is zero
/// * [`SyncError::Io`] if the output root cannot be created
pub async fn sync_report(
    registry: &BranchRegistry,
    exporter: &dyn ReportExporter,
    request: &SyncRequest,
    progress: Option<Arc<dyn ProgressCallback>>,
) -> Result<SyncSummary, SyncError> {
    if request.chunk_size_days == 0 {
        return Err(IntervalError::InvalidChunkSize(0).into());
    }

    std::fs::create_dir_all(&request.output_root).map_err(|source| SyncError::Io {
        path: request.output_root.clone(),
        source,
    })?;

    let progress = progress.unwrap_or_else(progress::null_progress);
    let mut summary = SyncSummary::default();
    let (branches, unknown) = select_branches(registry, request.branches.as_deref());
    summary.unknown_branches = unknown;

    let mut plan = Vec::new();
    for branch in &branches {
        match registry.windows_for(branch, &request.range) {
            Ok(windows) if windows.is_empty() => {
                log::debug!("{branch}: no code valid during {}", request.range);
            }
            Ok(windows) => {
                for window in windows {
                    if let Some(span) = window.overlap(&request.range) {
                        plan.push((branch.clone(), window.code, span));
                    }
                }
            }
            Err(e) => log::warn!("{branch}: skipped ({e})"),
        }
    }
    summary.branches = branches;

    log::info!(
        "{} {}: {} branch(es), {} code window(s)",
        request.report,
        request.range,
        summary.branches.len(),
        plan.len(),
    );
    progress.set_total(plan.len() as u64);

    for (branch, code, window) in plan {
        let outcome = sync_window(exporter, request, &branch, code, window, progress.as_ref()).await;
        summary.windows.push(outcome);
        progress.inc(1);
    }

    log::info!(
        "{} {}: {} chunk(s) downloaded, {} failed",
        request.report,
        request.range,
        summary.downloaded(),
        summary.failed(),
    );
    progress.finish(format!(
        "{} downloaded, {} failed",
        summary.downloaded(),
        summary.failed()
    ));

    Ok(summary)
}

async fn sync_window(
    exporter: &dyn ReportExporter,
    request: &SyncRequest,
    branch: &str,
    code: String,
    window: DateInterval,
    progress: &dyn ProgressCallback,
) -> WindowOutcome {
    let covered = pos_sync_coverage::scan_code(&request.output_root, &code);
    let gaps = if pos_sync_interval::is_covered(&window, &covered) {
        Vec::new()
    } else {
        pos_sync_interval::subtract(window, &covered)
    };

    let mut outcome = WindowOutcome {
        branch: branch.to_owned(),
        code,
        window,
        gaps,
        chunks: Vec::new(),
    };
    let code = outcome.code.as_str();

    if outcome.gaps.is_empty() {
        log::debug!("{branch}: code={code} window {window} already fully covered, skipping");
        return outcome;
    }

    log::info!("{branch}: code={code} window {window}");
    log::debug!("  existing: {}", join(&pos_sync_interval::merge(&covered)));
    log::debug!("  missing: {}", join(&outcome.gaps));

    for gap in &outcome.gaps {
        // chunk_size_days was validated by the caller.
        let Ok(chunks) = pos_sync_interval::chunk(*gap, request.chunk_size_days) else {
            continue;
        };

        for chunk in chunks {
            progress.set_message(format!("{branch} {code} {chunk}"));
            log::info!("  downloading {chunk}");

            let result = match exporter.export(request.report, code, &chunk).await {
                Ok(payload) => partition::write_partition(
                    &request.output_root,
                    branch,
                    code,
                    request.report,
                    &chunk,
                    payload.bytes(),
                )
                .map(|path| (path, payload.bytes().len()))
                .map_err(ChunkError::from),
                Err(e) => Err(ChunkError::from(e)),
            };

            match result {
                Ok((path, bytes)) => {
                    log::debug!("  saved {} ({bytes} bytes)", path.display());
                    outcome
                        .chunks
                        .push(ChunkOutcome::Downloaded { chunk, path, bytes });
                }
                Err(error) if error.is_fatal() => {
                    log::error!(
                        "{branch}: code={code} window {window} chunk {chunk} failed: {error}"
                    );
                    outcome.chunks.push(ChunkOutcome::Failed { chunk, error });
                }
                Err(error) => {
                    log::warn!(
                        "{branch}: code={code} window {window} chunk {chunk} failed, will retry on the next run: {error}"
                    );
                    outcome.chunks.push(ChunkOutcome::Failed { chunk, error });
                }
            }
        }
    }

    outcome
}

/// Resolves the branch allow-list against the registry.
///
/// Returns the branches to process (sorted, deduplicated) and the requested
/// names the registry does not know.
fn select_branches(
    registry: &BranchRegistry,
    requested: Option<&[String]>,
) -> (Vec<String>, Vec<String>) {
    let Some(requested) = requested else {
        return (
            registry.branches().into_iter().map(str::to_owned).collect(),
            Vec::new(),
        );
    };

    let mut known = Vec::new();
    let mut unknown = Vec::new();
    for name in requested {
        if registry.windows(name).is_some() {
            known.push(name.clone());
        } else {
            log::warn!("Unknown branch '{name}' requested, skipping");
            unknown.push(name.clone());
        }
    }
    known.sort();
    known.dedup();
    (known, unknown)
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
