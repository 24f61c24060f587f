//! The seam between the orchestrator and the portal.

use async_trait::async_trait;
use pos_sync_interval::DateInterval;
use pos_sync_portal::{ExportPayload, ExtractionError, PortalClient, ReportKind};

/// Something that can download one report chunk for one provider code.
#[async_trait]
pub trait ReportExporter: Send + Sync {
    /// Downloads `kind` for `code` covering exactly `range`.
    ///
    /// # Errors
    ///
    /// Returns [`ExtractionError`] if the download fails.
    async fn export(
        &self,
        kind: ReportKind,
        code: &str,
        range: &DateInterval,
    ) -> Result<ExportPayload, ExtractionError>;
}

#[async_trait]
impl ReportExporter for PortalClient {
    async fn export(
        &self,
        kind: ReportKind,
        code: &str,
        range: &DateInterval,
    ) -> Result<ExportPayload, ExtractionError> {
        Self::export(self, kind, code, range).await
    }
}
