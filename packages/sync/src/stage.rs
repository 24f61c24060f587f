//! The extract stage: a ledger-guarded [`sync_report`](crate::sync_report).

use std::sync::Arc;

use pos_sync_branch::BranchRegistry;
use pos_sync_ledger::{StageRecord, StageStatus};

use crate::{ProgressCallback, ReportExporter, SyncError, SyncRequest, SyncSummary};

/// Version recorded for the extract stage. Bump it when the layout or
/// content of downloaded files changes so that existing ranges re-run.
pub const EXTRACT_STAGE_VERSION: &str = "extract_v1";

/// What [`run_extract_stage`] did.
#[derive(Debug)]
pub enum StageOutcome {
    /// The ledger already had a successful record for this range and
    /// version.
    Skipped(StageRecord),
    /// The sync ran and its record was written.
    Ran(SyncSummary),
}

/// Runs the extract stage for `request` unless the ledger says it is done.
///
/// The ledger lives under the request's output root. After a run, a record
/// is written with status `ok`, `partial`, or `failed` depending on how many
/// chunks succeeded, so a later invocation retries anything that did not
/// finish. A run that errors out before producing a summary is recorded as
/// `failed` before the error is returned.
///
/// # Errors
///
/// Returns [`SyncError`] if the request is invalid, the output root cannot
/// be created, or the stage record cannot be written.
pub async fn run_extract_stage(
    registry: &BranchRegistry,
    exporter: &dyn ReportExporter,
    request: &SyncRequest,
    version: &str,
    force: bool,
    progress: Option<Arc<dyn ProgressCallback>>,
) -> Result<StageOutcome, SyncError> {
    let stage_dir = &request.output_root;
    let label = request.report;

    if !pos_sync_ledger::should_run(stage_dir, &request.range, version, force) {
        if let Some(record) = pos_sync_ledger::read(stage_dir, &request.range) {
            log::info!(
                "{label}: extract already complete for {} (version {version}, last run {})",
                request.range,
                record.last_run.format("%Y-%m-%d %H:%M:%S"),
            );
            return Ok(StageOutcome::Skipped(record));
        }
    }

    let summary = match crate::sync_report(registry, exporter, request, progress).await {
        Ok(summary) => summary,
        Err(e) => {
            let branches = request.branches.clone().unwrap_or_default();
            let record = StageRecord::new(&request.range, branches, version, StageStatus::Failed);
            if let Err(write_err) = pos_sync_ledger::write(stage_dir, &request.range, &record) {
                log::warn!("{label}: could not record failed extract for {}: {write_err}", request.range);
            }
            log::error!("{label}: extract for {} failed: {e}", request.range);
            return Err(e);
        }
    };

    let status = summary.status();
    let record = StageRecord::new(&request.range, summary.branches.clone(), version, status);
    pos_sync_ledger::write(stage_dir, &request.range, &record)?;
    log::info!("{label}: extract for {} recorded as {status:?}", request.range);

    Ok(StageOutcome::Ran(summary))
}

#[cfg(test)]
mod tests {
    use pos_sync_interval::IntervalError;
    use pos_sync_portal::ReportKind;

    use super::*;
    use crate::tests::{BRANCHES, FakeExporter, iv};

    fn request(root: &std::path::Path) -> SyncRequest {
        let mut request = SyncRequest::new(ReportKind::Payments, iv("2025-01-01", "2025-01-10"), root);
        request.branches = Some(vec!["QIN".to_owned()]);
        request.chunk_size_days = 5;
        request
    }

    #[tokio::test]
    async fn runs_once_then_skips() {
        let dir = tempfile::tempdir().unwrap();
        let registry = BranchRegistry::from_json_str(BRANCHES).unwrap();
        let req = request(dir.path());

        let exporter = FakeExporter::default();
        let outcome = run_extract_stage(&registry, &exporter, &req, "v1", false, None)
            .await
            .unwrap();
        assert!(matches!(outcome, StageOutcome::Ran(_)));
        assert_eq!(exporter.calls().len(), 2);

        let record = pos_sync_ledger::read(dir.path(), &req.range).unwrap();
        assert_eq!(record.status, StageStatus::Ok);
        assert_eq!(record.branches, vec!["QIN".to_owned()]);
        assert_eq!(record.stage_version, "v1");

        let again = FakeExporter::default();
        let outcome = run_extract_stage(&registry, &again, &req, "v1", false, None)
            .await
            .unwrap();
        assert!(matches!(outcome, StageOutcome::Skipped(_)));
        assert!(again.calls().is_empty());
    }

    #[tokio::test]
    async fn partial_run_is_retried_next_time() {
        let dir = tempfile::tempdir().unwrap();
        let registry = BranchRegistry::from_json_str(BRANCHES).unwrap();
        let req = request(dir.path());

        let flaky = FakeExporter {
            fail_on: vec![iv("2025-01-06", "2025-01-10")],
            ..FakeExporter::default()
        };
        run_extract_stage(&registry, &flaky, &req, "v1", false, None)
            .await
            .unwrap();
        let record = pos_sync_ledger::read(dir.path(), &req.range).unwrap();
        assert_eq!(record.status, StageStatus::Partial);

        let healthy = FakeExporter::default();
        let outcome = run_extract_stage(&registry, &healthy, &req, "v1", false, None)
            .await
            .unwrap();
        assert!(matches!(outcome, StageOutcome::Ran(_)));
        assert_eq!(
            healthy.calls(),
            vec![("6190".to_owned(), iv("2025-01-06", "2025-01-10"))]
        );
        let record = pos_sync_ledger::read(dir.path(), &req.range).unwrap();
        assert_eq!(record.status, StageStatus::Ok);
    }

    #[tokio::test]
    async fn version_bump_or_force_reruns() {
        let dir = tempfile::tempdir().unwrap();
        let registry = BranchRegistry::from_json_str(BRANCHES).unwrap();
        let req = request(dir.path());

        run_extract_stage(&registry, &FakeExporter::default(), &req, "v1", false, None)
            .await
            .unwrap();

        let bumped = run_extract_stage(&registry, &FakeExporter::default(), &req, "v2", false, None)
            .await
            .unwrap();
        assert!(matches!(bumped, StageOutcome::Ran(_)));

        let forced = run_extract_stage(&registry, &FakeExporter::default(), &req, "v2", true, None)
            .await
            .unwrap();
        assert!(matches!(forced, StageOutcome::Ran(_)));
        assert_eq!(
            pos_sync_ledger::read(dir.path(), &req.range)
                .unwrap()
                .stage_version,
            "v2"
        );
    }

    #[tokio::test]
    async fn failed_attempt_is_recorded() {
        let dir = tempfile::tempdir().unwrap();
        let registry = BranchRegistry::from_json_str(BRANCHES).unwrap();
        let mut req = request(dir.path());
        req.chunk_size_days = 0;

        let exporter = FakeExporter::default();
        let err = run_extract_stage(&registry, &exporter, &req, "v1", false, None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SyncError::Interval(IntervalError::InvalidChunkSize(0))
        ));
        assert!(exporter.calls().is_empty());

        let record = pos_sync_ledger::read(dir.path(), &req.range).unwrap();
        assert_eq!(record.status, StageStatus::Failed);
        assert_eq!(record.branches, vec!["QIN".to_owned()]);
        assert!(pos_sync_ledger::should_run(dir.path(), &req.range, "v1", false));
    }
}
