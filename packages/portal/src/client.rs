//! Session-holding portal client.
//!
//! One [`PortalClient`] is created per run. It logs in lazily on the first
//! export and then reuses the session cookies for every later request.

use std::sync::{Arc, LazyLock};

use base64::Engine as _;
use pos_sync_interval::{DATE_FORMAT, DateInterval};
use regex::Regex;
use reqwest::cookie::{CookieStore, Jar};
use reqwest::header::{ACCEPT, CONTENT_DISPOSITION, CONTENT_TYPE, HeaderName, ORIGIN, REFERER};
use reqwest::{StatusCode, Url};
use tokio::sync::Mutex;

use crate::html::{self, LoginForm};
use crate::retry::{self, RetryPolicy};
use crate::{
    Credentials, ExportPayload, ExtractionError, LOGIN_PATH, PortalConfig, REPORT_PAGE_PATH,
    ReportKind, TokenDiagnostics, WARMUP_ENDPOINTS, preview,
};

const USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36";

/// Name prefix of the forms-authentication cookie.
const AUTH_COOKIE_PREFIX: &str = ".ASPXAUTH";

const TOKEN_FIELD: &str = "__RequestVerificationToken";
const TOKEN_HEADER: &str = "RequestVerificationToken";

const BODY_PREVIEW_LEN: usize = 300;
const SNIPPET_LEN: usize = 240;

static FILENAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)filename\*?=(?:UTF-8'')?"?([^";]+)"?"#).unwrap_or_else(|_| unreachable!())
});

#[derive(Debug, Default)]
struct SessionState {
    authenticated: bool,
}

/// Authenticated client for one portal tenant.
pub struct PortalClient {
    http: reqwest::Client,
    jar: Arc<Jar>,
    /// Base URL without a trailing slash; paths are appended verbatim.
    base: String,
    cookie_url: Url,
    origin: String,
    credentials: Option<Credentials>,
    policy: RetryPolicy,
    session: Mutex<SessionState>,
}

impl std::fmt::Debug for PortalClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortalClient")
            .field("base", &self.base)
            .field("credentials", &self.credentials)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl PortalClient {
    /// Builds a client. No request is sent until the first export.
    ///
    /// # Errors
    ///
    /// * [`ExtractionError::ConfigInvalid`] if the base URL is not an
    ///   absolute http(s) URL
    /// * [`ExtractionError::Http`] if the HTTP client cannot be built
    pub fn new(config: PortalConfig) -> Result<Self, ExtractionError> {
        let base = config.base_url.trim().trim_end_matches('/').to_owned();
        let cookie_url = Url::parse(&base).map_err(|e| {
            ExtractionError::ConfigInvalid(format!("base URL '{}': {e}", config.base_url))
        })?;
        if !matches!(cookie_url.scheme(), "http" | "https") {
            return Err(ExtractionError::ConfigInvalid(format!(
                "base URL '{}' must use http or https",
                config.base_url
            )));
        }
        let origin = cookie_url.origin().ascii_serialization();

        let jar = Arc::new(Jar::default());
        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(config.timeout)
            .cookie_provider(Arc::clone(&jar))
            .build()?;

        Ok(Self {
            http,
            jar,
            base,
            cookie_url,
            origin,
            credentials: config.credentials,
            policy: RetryPolicy {
                retries: config.retries,
                backoff_base: config.backoff_base,
            },
            session: Mutex::new(SessionState::default()),
        })
    }

    /// Logs in if the tenant requires it. Later calls are no-ops once the
    /// session is authenticated.
    ///
    /// # Errors
    ///
    /// * [`ExtractionError::MissingCredentials`] if login is required and no
    ///   credentials were configured
    /// * [`ExtractionError::LoginFailed`] if the portal rejects the login
    /// * [`ExtractionError::NotFound`] if the login form cannot be parsed
    pub async fn authenticate(&self) -> Result<(), ExtractionError> {
        let mut session = self.session.lock().await;
        self.ensure_authenticated(&mut session).await
    }

    /// Exports `kind` for subsidiary `code` over `range`.
    ///
    /// The session lock is held for the whole export: the subsidiary cookie
    /// and warm-up state are per-session on the server.
    ///
    /// # Errors
    ///
    /// Returns [`ExtractionError`] for authentication failures, a missing
    /// token, rejected warm-up calls, a non-success export status, an
    /// unrecognized response body, or exhausted retries.
    pub async fn export(
        &self,
        kind: ReportKind,
        code: &str,
        range: &DateInterval,
    ) -> Result<ExportPayload, ExtractionError> {
        let mut session = self.session.lock().await;
        self.ensure_authenticated(&mut session).await?;

        let result = self.export_authenticated(kind, code, range).await;
        if matches!(result, Err(ExtractionError::Unauthorized { .. })) {
            log::warn!("Session rejected; will log in again on the next export");
            session.authenticated = false;
        }
        result
    }

    async fn ensure_authenticated(&self, session: &mut SessionState) -> Result<(), ExtractionError> {
        if session.authenticated {
            return Ok(());
        }
        self.login_if_needed().await?;
        session.authenticated = true;
        Ok(())
    }

    async fn login_if_needed(&self) -> Result<(), ExtractionError> {
        // Some tenants only hand out their session cookies from the root.
        let seed_url = format!("{}/", self.base);
        let seed = retry::send(&self.policy, || self.http.get(&seed_url)).await?;
        log::debug!("Seed GET {seed_url} returned {}", seed.status());

        let page_url = self.url(REPORT_PAGE_PATH);
        let probe = retry::send(&self.policy, || self.http.get(&page_url)).await?;
        if !needs_login(&probe) {
            log::info!("No login required");
            return Ok(());
        }

        let Some(credentials) = &self.credentials else {
            return Err(ExtractionError::MissingCredentials);
        };

        let login_page = probe.url().clone();
        let body = probe.text().await?;
        let mut form = LoginForm::parse(&body)
            .ok_or_else(|| ExtractionError::NotFound(format!("login form on {login_page}")))?;

        let action = match &form.action {
            Some(action) => login_page.join(action).map_err(|e| {
                ExtractionError::ConfigInvalid(format!("login form action '{action}': {e}"))
            })?,
            None => login_page.clone(),
        };

        let (Some(user_field), Some(password_field)) = (form.user_field(), form.password_field())
        else {
            return Err(ExtractionError::NotFound(format!(
                "username/password fields in login form (found: {})",
                form.field_names().join(", ")
            )));
        };
        if !form.has(&password_field) {
            return Err(ExtractionError::NotFound(format!(
                "password field '{password_field}' inside the login form (found: {})",
                form.field_names().join(", ")
            )));
        }

        form.set(user_field, credentials.username.clone());
        form.set(&password_field, credentials.password.clone());
        if form.get("ReturnUrl") == Some("") {
            form.set("ReturnUrl", REPORT_PAGE_PATH.to_owned());
        }

        log::info!("Logging in as {} via {action}", credentials.username);
        let referer = login_page.to_string();
        let response = retry::send(&self.policy, || {
            self.http
                .post(action.clone())
                .header(REFERER, &referer)
                .header(ORIGIN, &self.origin)
                .form(&form.fields)
        })
        .await?;

        let status = response.status();
        if status != StatusCode::OK && status != StatusCode::FOUND {
            return Err(ExtractionError::LoginFailed {
                message: format!("login POST returned HTTP {status}"),
            });
        }

        let check = retry::send(&self.policy, || self.http.get(&page_url)).await?;
        if check.status() == StatusCode::OK && !is_login_url(check.url()) {
            log::info!("Login succeeded");
            return Ok(());
        }

        Err(ExtractionError::LoginFailed {
            message: format!(
                "still redirected to login (status={}, auth cookie present: {}, final URL checked: {})",
                check.status(),
                self.auth_cookie_present(),
                check.url(),
            ),
        })
    }

    async fn export_authenticated(
        &self,
        kind: ReportKind,
        code: &str,
        range: &DateInterval,
    ) -> Result<ExportPayload, ExtractionError> {
        self.set_subsidiary_cookie(code);

        let (referer, token) = self.open_page(kind.page_path()).await?;

        let params = vec![
            ("subsidiaryId", code.to_owned()),
            ("startDate", range.start().format(DATE_FORMAT).to_string()),
            (
                "endDate",
                kind.api_end_date(range.end()).format(DATE_FORMAT).to_string(),
            ),
        ];

        if kind.needs_warmup() {
            self.warm_up(&referer, &token, &params).await?;
        }

        let mut body = params.clone();
        body.extend(
            kind.extra_fields()
                .iter()
                .map(|(name, value)| (*name, (*value).to_owned())),
        );
        body.push((TOKEN_FIELD, token.clone()));

        let url = self.url(kind.export_path());
        log::debug!("{kind} export for {code} {range}: POST {url}");

        let response = retry::send(&self.policy, || {
            let request = self.ajax_post(&url, &referer, &token);
            let request = if kind.params_in_query() {
                request.query(&params)
            } else {
                request
            };
            request.form(&body)
        })
        .await?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            return Err(ExtractionError::Unauthorized {
                context: format!("{kind} export for {code} {range}"),
                auth_cookie_present: self.auth_cookie_present(),
            });
        }
        if !status.is_success() {
            let final_url = response.url().to_string();
            let text = match response.text().await {
                Ok(text) => text,
                Err(e) => {
                    log::warn!("could not read body of HTTP {status} from {final_url}: {e}");
                    String::new()
                }
            };
            return Err(ExtractionError::HttpStatus {
                status: status.as_u16(),
                url: final_url,
                preview: preview(&text, BODY_PREVIEW_LEN),
            });
        }

        let content_type = header_str(&response, &CONTENT_TYPE).unwrap_or_default();
        let disposition = header_str(&response, &CONTENT_DISPOSITION).unwrap_or_default();
        let bytes = response.bytes().await?.to_vec();
        decode_payload(&content_type, &disposition, bytes)
    }

    /// Loads a page and returns its URL (for `Referer`) and anti-forgery
    /// token.
    async fn open_page(&self, path: &str) -> Result<(String, String), ExtractionError> {
        let url = self.url(path);
        let response = retry::send(&self.policy, || self.http.get(&url)).await?;

        let status = response.status();
        let final_url = response.url().clone();
        let login_redirected = is_login_url(&final_url);

        if status == StatusCode::UNAUTHORIZED || login_redirected {
            return Err(ExtractionError::Unauthorized {
                context: format!("GET {path}"),
                auth_cookie_present: self.auth_cookie_present(),
            });
        }

        let content_type = header_str(&response, &CONTENT_TYPE);
        let body = response.text().await?;

        if !status.is_success() {
            return Err(ExtractionError::HttpStatus {
                status: status.as_u16(),
                url: final_url.to_string(),
                preview: preview(&body, BODY_PREVIEW_LEN),
            });
        }

        match html::find_csrf_token(&body) {
            Some(token) => Ok((url, token)),
            None => Err(ExtractionError::TokenMissing(Box::new(TokenDiagnostics {
                context: path.to_owned(),
                status: status.as_u16(),
                url: final_url.to_string(),
                login_redirected,
                auth_cookie_present: self.auth_cookie_present(),
                content_type,
                title: html::page_title(&body),
                snippet: preview(&body, SNIPPET_LEN),
            }))),
        }
    }

    /// Replays the browser's "apply" calls: one probe, then the full list.
    async fn warm_up(
        &self,
        referer: &str,
        token: &str,
        params: &[(&str, String)],
    ) -> Result<(), ExtractionError> {
        let mut body = params.to_vec();
        body.push((TOKEN_FIELD, token.to_owned()));

        let probe = WARMUP_ENDPOINTS.first().copied();
        for name in probe.into_iter().chain(WARMUP_ENDPOINTS.iter().copied()) {
            let url = self.url(&format!("/Reports/{name}"));
            let response = retry::send(&self.policy, || {
                self.ajax_post(&url, referer, token).query(params).form(&body)
            })
            .await?;

            let status = response.status();
            match status.as_u16() {
                401 => {
                    return Err(ExtractionError::Unauthorized {
                        context: format!("warm-up {name}"),
                        auth_cookie_present: self.auth_cookie_present(),
                    });
                }
                400 | 403 => {
                    return Err(ExtractionError::Forbidden {
                        status: status.as_u16(),
                        endpoint: name.to_owned(),
                    });
                }
                _ if status.is_success() => {}
                _ => log::warn!("Warm-up {name} returned {status}"),
            }
        }

        log::debug!("Warm-up complete ({} calls)", WARMUP_ENDPOINTS.len() + 1);
        Ok(())
    }

    fn ajax_post(&self, url: &str, referer: &str, token: &str) -> reqwest::RequestBuilder {
        self.http
            .post(url)
            .header(ORIGIN, &self.origin)
            .header(REFERER, referer)
            .header("X-Requested-With", "XMLHttpRequest")
            .header(ACCEPT, "*/*")
            .header(TOKEN_HEADER, token)
    }

    fn set_subsidiary_cookie(&self, code: &str) {
        self.jar
            .add_cookie_str(&format!("SubsidiaryId={code}; Path=/"), &self.cookie_url);
        log::debug!("Set cookie SubsidiaryId={code} for {}", self.origin);
    }

    fn auth_cookie_present(&self) -> bool {
        self.jar
            .cookies(&self.cookie_url)
            .and_then(|value| value.to_str().ok().map(str::to_owned))
            .is_some_and(|cookies| {
                cookies
                    .split(';')
                    .filter_map(|pair| pair.trim().split('=').next())
                    .any(|name| name.to_ascii_uppercase().starts_with(AUTH_COOKIE_PREFIX))
            })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base)
    }
}

fn needs_login(response: &reqwest::Response) -> bool {
    response.status() == StatusCode::UNAUTHORIZED || is_login_url(response.url())
}

fn is_login_url(url: &Url) -> bool {
    url.path().contains(LOGIN_PATH)
}

fn header_str(response: &reqwest::Response, name: &HeaderName) -> Option<String> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned)
}

/// Decides the payload shape from the response headers.
fn decode_payload(
    content_type: &str,
    disposition: &str,
    bytes: Vec<u8>,
) -> Result<ExportPayload, ExtractionError> {
    let content_type = content_type.to_ascii_lowercase();

    if content_type.contains("application/json") {
        let value: serde_json::Value = serde_json::from_slice(&bytes)
            .map_err(|e| ExtractionError::Decode(format!("export JSON: {e}")))?;

        let Some(encoded) = value.get("fileBase64").and_then(serde_json::Value::as_str) else {
            let keys = value
                .as_object()
                .map(|o| o.keys().cloned().collect::<Vec<_>>().join(", "))
                .unwrap_or_default();
            return Err(ExtractionError::UnexpectedContentType {
                content_type,
                preview: format!("JSON without fileBase64 (keys: {keys})"),
            });
        };

        let decoded = base64::engine::general_purpose::STANDARD
            .decode(encoded.trim())
            .map_err(|e| ExtractionError::Decode(format!("fileBase64: {e}")))?;
        let file_name = value
            .get("fileName")
            .and_then(serde_json::Value::as_str)
            .filter(|name| !name.is_empty())
            .map(str::to_owned);

        return Ok(ExportPayload::Json {
            file_name,
            bytes: decoded,
        });
    }

    let is_file = content_type.contains("application/vnd")
        || content_type.contains("application/octet-stream")
        || disposition.to_ascii_lowercase().contains("attachment");
    if is_file {
        return Ok(ExportPayload::Binary {
            file_name: disposition_filename(disposition),
            bytes,
        });
    }

    Err(ExtractionError::UnexpectedContentType {
        content_type: if content_type.is_empty() {
            "none".to_owned()
        } else {
            content_type
        },
        preview: preview(&String::from_utf8_lossy(&bytes), BODY_PREVIEW_LEN),
    })
}

fn disposition_filename(header: &str) -> Option<String> {
    FILENAME_RE
        .captures(header)
        .map(|caps| caps[1].trim().to_owned())
        .filter(|name| !name.is_empty())
}
