#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Client for the point-of-sale back-office reporting portal.
//!
//! The portal is an ASP.NET MVC application. Exporting a report means
//! logging in through its HTML form, scraping an anti-forgery token from the
//! report page, replaying the same "apply" calls the browser makes to warm up
//! the server-side report state, and finally posting to the export endpoint.
//! [`PortalClient`] drives that sequence; [`retry`] wraps every request with
//! backoff for transient failures.

pub mod client;
pub mod html;
pub mod retry;

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::NaiveDate;

pub use client::PortalClient;

/// Protected page used both to detect whether login is needed and as the
/// token source for sales reports.
pub const REPORT_PAGE_PATH: &str = "/Reports/ConsolidatedSalesMasterReport";

/// Path fragment identifying the portal's login page.
pub const LOGIN_PATH: &str = "/Account/LogOn";

/// Page that carries the token for inventory transfer exports.
pub const TRANSFERS_PAGE_PATH: &str = "/Inventory/Transfers";

/// Warm-up endpoints under `/Reports/`, in the order the browser calls them.
pub const WARMUP_ENDPOINTS: &[&str] = &[
    "GetConsolidatedSales",
    "CancelSalesDetail",
    "CourtesiesDetail",
    "SalesByHours",
    "SalesByGroup",
    "SalesByGroupType",
    "SalesByArea",
    "SalesBySaucer",
    "SalesByUser",
    "SalesByTypeOfOrder",
    "DiscountsDetail",
    "PersonsByHour",
    "PersonsByDay",
    "PersonsByDayName",
    "SalesByPaymentType",
    "SalesByModifiers",
    "SalesByTerminal",
    "MegaPointsReport",
    "TipByUser",
    "Promotions",
    "ChargePaymentMethod",
    "SaleNullificationDetail",
];

/// Default per-request timeout in seconds.
pub const DEFAULT_TIMEOUT_SECS: u64 = 60;

/// Default number of retries for transient failures.
pub const DEFAULT_RETRIES: u32 = 3;

/// Default base delay between retries.
pub const DEFAULT_BACKOFF: Duration = Duration::from_millis(800);

/// Errors raised while talking to the portal.
#[derive(Debug, thiserror::Error)]
pub enum ExtractionError {
    /// Login is required but no username/password was configured.
    #[error("login required but no credentials were provided (set WS_USER/WS_PASS)")]
    MissingCredentials,

    /// The login form was submitted but the session is still not
    /// authenticated.
    #[error("login failed: {message}")]
    LoginFailed {
        /// What went wrong, including auth-cookie diagnostics.
        message: String,
    },

    /// No anti-forgery token could be found on a page that must carry one.
    #[error("{0}")]
    TokenMissing(Box<TokenDiagnostics>),

    /// The portal answered 401.
    #[error("401 unauthorized on {context} (auth cookie present: {auth_cookie_present})")]
    Unauthorized {
        /// Request that was rejected.
        context: String,
        /// Whether an `.ASPXAUTH` cookie was held at the time.
        auth_cookie_present: bool,
    },

    /// The portal answered 400 or 403, which it uses for token and policy
    /// rejections.
    #[error("HTTP {status} (token/policy block) on {endpoint}")]
    Forbidden {
        /// Response status.
        status: u16,
        /// Endpoint that was rejected.
        endpoint: String,
    },

    /// The export response was neither a JSON envelope nor a file.
    #[error("unexpected export response ({content_type}): {preview}")]
    UnexpectedContentType {
        /// Content type reported by the server.
        content_type: String,
        /// Start of the body, or the JSON keys that were present.
        preview: String,
    },

    /// A non-success status that is neither retryable nor specially handled.
    #[error("HTTP {status} from {url}: {preview}")]
    HttpStatus {
        /// Response status.
        status: u16,
        /// Final request URL.
        url: String,
        /// Start of the response body.
        preview: String,
    },

    /// A transient failure persisted through every retry.
    #[error("giving up after {attempts} attempts: {last}")]
    RetriesExhausted {
        /// Requests sent, including the first.
        attempts: u32,
        /// Description of the last failure.
        last: String,
    },

    /// Transport-level failure.
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The export payload could not be decoded.
    #[error("failed to decode export payload: {0}")]
    Decode(String),

    /// The client configuration is unusable (e.g., malformed base URL).
    #[error("invalid portal configuration: {0}")]
    ConfigInvalid(String),

    /// A required page element was not found.
    #[error("not found: {0}")]
    NotFound(String),
}

impl ExtractionError {
    /// Whether retrying the same unit of work cannot succeed without
    /// operator intervention.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::MissingCredentials
                | Self::LoginFailed { .. }
                | Self::TokenMissing(_)
                | Self::Unauthorized { .. }
                | Self::Forbidden { .. }
                | Self::UnexpectedContentType { .. }
                | Self::Decode(_)
                | Self::ConfigInvalid(_)
                | Self::NotFound(_)
        )
    }

    /// Whether the failure is of the kind the retry layer retries.
    ///
    /// [`ExtractionError::RetriesExhausted`] is not retryable: the retry
    /// budget has already been spent.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Http(e) => retry::is_transient(e),
            Self::HttpStatus { status, .. } => retry::RETRYABLE_STATUSES.contains(status),
            _ => false,
        }
    }
}

/// Context gathered when a page that must carry an anti-forgery token does
/// not.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenDiagnostics {
    /// Which page was inspected.
    pub context: String,
    /// Response status.
    pub status: u16,
    /// Final URL after redirects.
    pub url: String,
    /// Whether the request ended on the login page.
    pub login_redirected: bool,
    /// Whether an `.ASPXAUTH` cookie was held.
    pub auth_cookie_present: bool,
    /// Response content type.
    pub content_type: Option<String>,
    /// `<title>` of the page, if any.
    pub title: Option<String>,
    /// Start of the body with line breaks flattened.
    pub snippet: String,
}

impl fmt::Display for TokenDiagnostics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "anti-forgery token not found on {}: status={}, url={}, login_redirected={}, \
             auth_cookie_present={}, content_type={}, title={}. Body start: {}",
            self.context,
            self.status,
            self.url,
            self.login_redirected,
            self.auth_cookie_present,
            self.content_type.as_deref().unwrap_or("n/a"),
            self.title.as_deref().unwrap_or("n/a"),
            self.snippet,
        )
    }
}

/// Report families the portal can export.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ReportKind {
    /// Ticket-level sales detail.
    Detail,
    /// Consolidated sales summary.
    Consolidated,
    /// Sales by payment method.
    Payments,
    /// Inventory transfers issued to other branches.
    TransfersIssued,
}

impl ReportKind {
    /// Every report kind.
    pub const ALL: [Self; 4] = [
        Self::Detail,
        Self::Consolidated,
        Self::Payments,
        Self::TransfersIssued,
    ];

    /// Name used on the command line and in output file names.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Detail => "Detail",
            Self::Consolidated => "Consolidated",
            Self::Payments => "Payments",
            Self::TransfersIssued => "TransfersIssued",
        }
    }

    /// Page that must be loaded first to obtain a token.
    #[must_use]
    pub const fn page_path(self) -> &'static str {
        match self {
            Self::Detail | Self::Consolidated | Self::Payments => REPORT_PAGE_PATH,
            Self::TransfersIssued => TRANSFERS_PAGE_PATH,
        }
    }

    /// Export endpoint path.
    #[must_use]
    pub const fn export_path(self) -> &'static str {
        match self {
            Self::Detail => "/Reports/ExportSalesDetailReport",
            Self::Consolidated => "/Reports/Export",
            Self::Payments => "/Reports/ExportSalesReport",
            Self::TransfersIssued => "/Inventory/ExportTransfersIssued",
        }
    }

    /// Whether the warm-up sequence must run before exporting.
    #[must_use]
    pub const fn needs_warmup(self) -> bool {
        !matches!(self, Self::TransfersIssued)
    }

    /// Whether the export parameters are also sent in the query string.
    #[must_use]
    pub const fn params_in_query(self) -> bool {
        !matches!(self, Self::TransfersIssued)
    }

    /// Additional form fields the export endpoint expects.
    #[must_use]
    pub const fn extra_fields(self) -> &'static [(&'static str, &'static str)] {
        match self {
            Self::TransfersIssued => &[("transferReference", ""), ("status", "0")],
            Self::Detail | Self::Consolidated | Self::Payments => &[],
        }
    }

    /// End date to send for a request whose last wanted day is `end`.
    ///
    /// The payments endpoint treats its end date as exclusive.
    #[must_use]
    pub fn api_end_date(self, end: NaiveDate) -> NaiveDate {
        match self {
            Self::Payments => end.succ_opt().unwrap_or(end),
            Self::Detail | Self::Consolidated | Self::TransfersIssued => end,
        }
    }

    /// Output directory name under the raw data root. Each kind gets its own
    /// tree because coverage is read from partition names alone.
    #[must_use]
    pub const fn dir_name(self) -> &'static str {
        match self {
            Self::Detail => "sales",
            Self::Consolidated => "sales_consolidated",
            Self::Payments => "payments",
            Self::TransfersIssued => "transfers",
        }
    }
}

impl fmt::Display for ReportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReportKind {
    type Err = ExtractionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| {
                ExtractionError::ConfigInvalid(format!(
                    "unknown report '{s}' (expected one of: Detail, Consolidated, Payments, TransfersIssued)"
                ))
            })
    }
}

/// A downloaded report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExportPayload {
    /// The portal returned a JSON envelope with a base64-encoded file.
    Json {
        /// Suggested file name from the envelope.
        file_name: Option<String>,
        /// Decoded file contents.
        bytes: Vec<u8>,
    },
    /// The portal returned the file directly.
    Binary {
        /// File name from `Content-Disposition`, if any.
        file_name: Option<String>,
        /// Response body.
        bytes: Vec<u8>,
    },
}

impl ExportPayload {
    /// File contents.
    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        match self {
            Self::Json { bytes, .. } | Self::Binary { bytes, .. } => bytes,
        }
    }

    /// Suggested file name, if the portal provided one.
    #[must_use]
    pub fn file_name(&self) -> Option<&str> {
        match self {
            Self::Json { file_name, .. } | Self::Binary { file_name, .. } => file_name.as_deref(),
        }
    }
}

/// Portal login.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    /// Account name.
    pub username: String,
    /// Account password.
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// Settings for a [`PortalClient`].
#[derive(Debug, Clone)]
pub struct PortalConfig {
    /// Tenant base URL, e.g. `https://tenant.example.com`.
    pub base_url: String,
    /// Login, if the tenant requires one.
    pub credentials: Option<Credentials>,
    /// Per-request timeout.
    pub timeout: Duration,
    /// Retries for transient failures.
    pub retries: u32,
    /// Base delay between retries; doubles on each attempt.
    pub backoff_base: Duration,
}

impl PortalConfig {
    /// Config for `base_url` with default timeout and retry settings.
    #[must_use]
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            credentials: None,
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            retries: DEFAULT_RETRIES,
            backoff_base: DEFAULT_BACKOFF,
        }
    }

    /// Sets the login.
    #[must_use]
    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.credentials = Some(Credentials {
            username: username.into(),
            password: password.into(),
        });
        self
    }
}

/// First `max` characters of `text` on one line.
pub(crate) fn preview(text: &str, max: usize) -> String {
    text.chars()
        .take(max)
        .map(|c| if c == '\r' || c == '\n' { ' ' } else { c })
        .collect()
}
