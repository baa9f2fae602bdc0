//! crcwatch API façade.
//!
//! This crate defines the two dashboard collaborators the client depends on:
//! the State Query (full list of case run configurations) and the Cancel
//! Command. Implementations talk HTTP to a live dashboard, read a saved
//! dashboard directory, or replay scripted responses in tests.

#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crcwatch_core::{decode_case_runs, CancelEndpoint, CancelRequest, CaseRunConfiguration, CaseRunsPayload, DecodeError, LinkMode};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// API errors suitable for transport and for display in the CLI.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
pub enum ApiError {
    #[error("transport: {0}")]
    Transport(String),
    #[error("http status {0}")]
    Http(u16),
    #[error("decode: {0}")]
    Decode(String),
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("io: {0}")]
    Io(String),
}

impl From<DecodeError> for ApiError {
    fn from(e: DecodeError) -> Self { ApiError::Decode(e.to_string()) }
}

pub type ApiResult<T> = Result<T, ApiError>;

/// Dashboard collaborators.
#[async_trait::async_trait]
pub trait DashboardApi: Send + Sync {
    /// Fetch every case run configuration, normalized to one shape.
    async fn fetch_state(&self) -> ApiResult<Vec<CaseRunConfiguration>>;

    /// Send a cancel command. Nothing in the response is relied upon.
    async fn cancel(&self, request: &CancelRequest) -> ApiResult<()>;

    /// Whether the backend accepts filtered batch cancels. Older dashboards
    /// only know the three plain scopes.
    fn supports_filtered_cancel(&self) -> bool { true }

    /// How log references of this source become links.
    fn link_mode(&self) -> LinkMode { LinkMode::Live }

    /// Root the live log links are built from.
    fn logs_root(&self) -> String { String::new() }
}

// ----------------- Configuration -----------------

/// Endpoint layout of one dashboard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    pub base_url: String,
    pub data_path: String,
    pub cancel_path: String,
    pub cancel_filtered_path: String,
    pub logs_path: String,
    pub timeout: Duration,
    pub mode: LinkMode,
    /// False for older dashboards without the filtered cancel endpoint.
    pub filtered_cancel: bool,
}

impl ClientConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            data_path: "pipeline_data".into(),
            cancel_path: "cancel".into(),
            cancel_filtered_path: "cancel_filtered".into(),
            logs_path: "logs".into(),
            timeout: Duration::from_secs(5),
            mode: LinkMode::Live,
            filtered_cancel: true,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self { self.timeout = timeout; self }

    pub fn with_mode(mut self, mode: LinkMode) -> Self { self.mode = mode; self }

    pub fn with_filtered_cancel(mut self, enabled: bool) -> Self { self.filtered_cancel = enabled; self }

    /// Join `path` onto the base url.
    pub fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), path.trim_start_matches('/'))
    }

    pub fn endpoint_url(&self, endpoint: CancelEndpoint) -> String {
        match endpoint {
            CancelEndpoint::Cancel => self.url(&self.cancel_path),
            CancelEndpoint::CancelFiltered => self.url(&self.cancel_filtered_path),
        }
    }
}

// ----------------- HTTP implementation -----------------

/// Live dashboard over HTTP. A dashboard saved as static files and served
/// over HTTP uses `LinkMode::Static` and rejects cancels.
pub struct HttpApi {
    cfg: ClientConfig,
    client: reqwest::Client,
}

impl HttpApi {
    pub fn new(cfg: ClientConfig) -> ApiResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(cfg.timeout)
            .build()
            .map_err(|e| ApiError::Transport(e.to_string()))?;
        Ok(Self { cfg, client })
    }

    pub fn config(&self) -> &ClientConfig { &self.cfg }

    fn transport(e: reqwest::Error) -> ApiError {
        if e.is_decode() { ApiError::Decode(e.to_string()) } else { ApiError::Transport(e.to_string()) }
    }
}

#[async_trait::async_trait]
impl DashboardApi for HttpApi {
    async fn fetch_state(&self) -> ApiResult<Vec<CaseRunConfiguration>> {
        let t0 = Instant::now();
        let url = self.cfg.url(&self.cfg.data_path);
        debug!(url = %url, "api: fetch start");
        let resp = self.client.get(&url).send().await.map_err(Self::transport)?;
        let status = resp.status();
        if !status.is_success() {
            warn!(url = %url, status = status.as_u16(), "api: fetch rejected");
            return Err(ApiError::Http(status.as_u16()));
        }
        let payload = resp.json::<CaseRunsPayload>().await.map_err(Self::transport)?;
        let items = payload.into_items();
        debug!(items = items.len(), took_ms = %t0.elapsed().as_millis(), "api: fetch ok");
        Ok(items)
    }

    async fn cancel(&self, request: &CancelRequest) -> ApiResult<()> {
        if self.cfg.mode == LinkMode::Static {
            return Err(ApiError::Unsupported("saved dashboards cannot cancel".into()));
        }
        if request.endpoint() == CancelEndpoint::CancelFiltered && !self.cfg.filtered_cancel {
            return Err(ApiError::Unsupported("this dashboard has no filtered cancel".into()));
        }
        let t0 = Instant::now();
        let url = self.cfg.endpoint_url(request.endpoint());
        let pairs = request.query_pairs();
        info!(url = %url, scope = request.scope(), "api: cancel start");
        let resp = self.client.get(&url).query(&pairs).send().await.map_err(Self::transport)?;
        let status = resp.status();
        if !status.is_success() {
            warn!(url = %url, status = status.as_u16(), "api: cancel rejected");
            return Err(ApiError::Http(status.as_u16()));
        }
        info!(scope = request.scope(), took_ms = %t0.elapsed().as_millis(), "api: cancel ok");
        Ok(())
    }

    fn supports_filtered_cancel(&self) -> bool { self.cfg.filtered_cancel }

    fn link_mode(&self) -> LinkMode { self.cfg.mode }

    fn logs_root(&self) -> String { self.cfg.url(&self.cfg.logs_path) }
}

// ----------------- Saved dashboard directory -----------------

/// Saved dashboard on disk: state is read from `<dir>/pipeline_data`.
pub struct StaticDirApi {
    dir: PathBuf,
    data_file: String,
}

impl StaticDirApi {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into(), data_file: "pipeline_data".into() }
    }

    pub fn data_path(&self) -> PathBuf { self.dir.join(&self.data_file) }
}

#[async_trait::async_trait]
impl DashboardApi for StaticDirApi {
    async fn fetch_state(&self) -> ApiResult<Vec<CaseRunConfiguration>> {
        let path = self.data_path();
        let bytes = tokio::fs::read(&path)
            .await
            .map_err(|e| ApiError::Io(format!("{}: {}", path.display(), e)))?;
        let items = decode_case_runs(&bytes)?;
        debug!(path = %path.display(), items = items.len(), "api: static read ok");
        Ok(items)
    }

    async fn cancel(&self, request: &CancelRequest) -> ApiResult<()> {
        Err(ApiError::Unsupported(format!("cancel {} on a saved dashboard", request.scope())))
    }

    fn link_mode(&self) -> LinkMode { LinkMode::Static }
}

// ----------------- Mock -----------------

/// One scripted State Query outcome.
#[derive(Debug, Clone)]
pub enum MockResponse {
    Items(Vec<CaseRunConfiguration>),
    /// Items delivered after a delay, for response-ordering tests.
    Delayed(Duration, Vec<CaseRunConfiguration>),
    Fail(ApiError),
}

/// In-memory dashboard for tests and demos.
///
/// Scripted responses are consumed in order; once exhausted, the last
/// successful item list is served again. Every cancel request is recorded.
#[derive(Default)]
pub struct MockApi {
    script: Mutex<VecDeque<MockResponse>>,
    last: Mutex<Vec<CaseRunConfiguration>>,
    cancels: Mutex<Vec<CancelRequest>>,
    fetches: AtomicUsize,
    legacy_filter_backend: bool,
    cancel_error: Option<ApiError>,
}

impl MockApi {
    pub fn new() -> Self { Self::default() }

    /// Serve `items` on every fetch.
    pub fn with_items(items: Vec<CaseRunConfiguration>) -> Self {
        let api = Self::default();
        *lock(&api.last) = items;
        api
    }

    /// Append scripted responses.
    pub fn script(self, responses: impl IntoIterator<Item = MockResponse>) -> Self {
        lock(&self.script).extend(responses);
        self
    }

    /// Behave like a dashboard without the filtered cancel endpoint.
    pub fn without_filtered_cancel(mut self) -> Self { self.legacy_filter_backend = true; self }

    /// Fail every cancel with `err` (still recorded).
    pub fn failing_cancels(mut self, err: ApiError) -> Self { self.cancel_error = Some(err); self }

    pub fn push(&self, response: MockResponse) { lock(&self.script).push_back(response); }

    pub fn cancels(&self) -> Vec<CancelRequest> { lock(&self.cancels).clone() }

    pub fn fetch_count(&self) -> usize { self.fetches.load(Ordering::SeqCst) }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait::async_trait]
impl DashboardApi for MockApi {
    async fn fetch_state(&self) -> ApiResult<Vec<CaseRunConfiguration>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let next = lock(&self.script).pop_front();
        match next {
            Some(MockResponse::Items(items)) => {
                *lock(&self.last) = items.clone();
                Ok(items)
            }
            Some(MockResponse::Delayed(delay, items)) => {
                tokio::time::sleep(delay).await;
                *lock(&self.last) = items.clone();
                Ok(items)
            }
            Some(MockResponse::Fail(err)) => Err(err),
            None => Ok(lock(&self.last).clone()),
        }
    }

    async fn cancel(&self, request: &CancelRequest) -> ApiResult<()> {
        lock(&self.cancels).push(request.clone());
        match &self.cancel_error {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    fn supports_filtered_cancel(&self) -> bool { !self.legacy_filter_backend }

    fn logs_root(&self) -> String { "http://mock/logs".into() }
}
