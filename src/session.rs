use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;
use time::{format_description::well_known, OffsetDateTime};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::aggregator::{AggregationState, MergeStats};
use crate::client::{FetchOutcome, PageSource};
use crate::config::FofaConfig;
use crate::decoder::{parse_page, DecodeError};
use crate::export::{export_txt, export_xlsx, normalized_urls, ExportOutcome};
use crate::query::{search_url, SearchRequest};
use crate::types::{ExportRecord, Record, ServiceEntry};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session closed")]
    Cancelled,
    #[error("invalid search url: {0}")]
    Url(#[from] url::ParseError),
    #[error("page {page} failed to load: {message}")]
    Fetch { page: u32, message: String },
    #[error("page {page}: {source}")]
    Decode {
        page: u32,
        #[source]
        source: DecodeError,
    },
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    Xlsx,
    Txt,
}

impl ExportFormat {
    pub fn extension(self) -> &'static str {
        match self {
            ExportFormat::Xlsx => "xlsx",
            ExportFormat::Txt => "txt",
        }
    }
}

/// Snapshot of a session for listings and status output.
#[derive(Serialize, Debug, Clone)]
pub struct SessionSummary {
    pub title: String,
    pub created_at: String,
    pub records: usize,
    pub total: u64,
    pub pages_loaded: u32,
    pub has_more_data: bool,
    /// A page request is out and its response has not been merged yet.
    pub loading: bool,
    pub failed_page: Option<u32>,
    pub last_error: Option<String>,
}

/// A page request handed out by [`Session::begin_fetch`].
#[derive(Debug, Clone)]
pub struct PendingPage {
    pub page: u32,
    pub url: Url,
}

/// One open query: owns its aggregation state and requests pages strictly
/// one after another.
#[derive(Debug)]
pub struct Session<T = Record> {
    request: SearchRequest,
    config: FofaConfig,
    state: AggregationState<T>,
    cancel: CancellationToken,
    exhausted: bool,
    loading: bool,
    failed_page: Option<u32>,
    last_error: Option<String>,
    created_at: String,
}

impl<T: ServiceEntry> Session<T> {
    pub fn new(request: SearchRequest, config: FofaConfig) -> Self {
        Self::with_cancel(request, config, CancellationToken::new())
    }

    pub fn with_cancel(request: SearchRequest, config: FofaConfig, cancel: CancellationToken) -> Self {
        Self {
            request,
            config,
            state: AggregationState::new(),
            cancel,
            exhausted: false,
            loading: false,
            failed_page: None,
            last_error: None,
            created_at: now_rfc3339(),
        }
    }

    pub fn title(&self) -> String {
        self.request.title()
    }

    pub fn config(&self) -> &FofaConfig {
        &self.config
    }

    pub fn state(&self) -> &AggregationState<T> {
        &self.state
    }

    pub fn records(&self) -> &[T] {
        self.state.records()
    }

    pub fn failed_page(&self) -> Option<u32> {
        self.failed_page
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Stop any further page requests; an in-flight fetch is abandoned.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn has_more(&self) -> bool {
        !self.exhausted && self.state.has_more_data && !self.is_closed()
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            title: self.title(),
            created_at: self.created_at.clone(),
            records: self.state.len(),
            total: self.state.total,
            pages_loaded: self.state.page - 1,
            has_more_data: self.has_more(),
            loading: self.loading,
            failed_page: self.failed_page,
            last_error: self.last_error.clone(),
        }
    }

    /// Reserve the next page request: the page index and the URL to fetch.
    ///
    /// Returns `Ok(None)` when nothing is left to request. The state is not
    /// touched until the fetched body is handed to [`apply_outcome`].
    ///
    /// [`apply_outcome`]: Self::apply_outcome
    pub fn begin_fetch(&mut self) -> Result<Option<PendingPage>, SessionError> {
        if self.is_closed() {
            return Err(SessionError::Cancelled);
        }
        if !self.has_more() {
            return Ok(None);
        }
        let url = search_url(&self.config, &self.request, self.state.next.as_deref())?;
        debug!(title = %self.title(), page = self.state.page, "requesting page");
        self.loading = true;
        Ok(Some(PendingPage {
            page: self.state.page,
            url,
        }))
    }

    /// Merge the response of a page reserved with [`begin_fetch`].
    ///
    /// On error the aggregated state is left exactly as it was and the same
    /// page is requested again on the next call.
    ///
    /// [`begin_fetch`]: Self::begin_fetch
    pub fn apply_outcome(
        &mut self,
        pending: PendingPage,
        outcome: FetchOutcome,
    ) -> Result<Option<MergeStats>, SessionError> {
        self.loading = false;
        // A close that raced the fetch still wins; the page is dropped.
        if self.is_closed() {
            return Err(SessionError::Cancelled);
        }
        let page_no = pending.page;
        if page_no != self.state.page {
            debug!(title = %self.title(), page = page_no, "stale page dropped");
            return Ok(None);
        }

        if !outcome.is_success() {
            return Err(self.fail(SessionError::Fetch {
                page: page_no,
                message: outcome.body,
            }));
        }
        let page = match parse_page(&outcome.body) {
            Ok(p) => p,
            Err(err) => {
                return Err(self.fail(SessionError::Decode {
                    page: page_no,
                    source: err,
                }))
            }
        };

        if page.results.is_empty() {
            self.exhausted = true;
        }
        let stats = self.state.apply_page(&page, &self.config);
        self.failed_page = None;
        self.last_error = None;
        info!(
            title = %self.title(),
            page = page_no,
            records = self.state.len(),
            total = self.state.total,
            "page merged"
        );
        Ok(Some(stats))
    }

    /// Fetch and merge the next page.
    ///
    /// Returns `Ok(None)` when nothing is left to request.
    pub async fn fetch_next<S: PageSource>(
        &mut self,
        source: &S,
    ) -> Result<Option<MergeStats>, SessionError> {
        let Some(pending) = self.begin_fetch()? else {
            return Ok(None);
        };
        let outcome = tokio::select! {
            _ = self.cancel.cancelled() => return Err(SessionError::Cancelled),
            outcome = source.fetch(pending.url.clone()) => outcome,
        };
        self.apply_outcome(pending, outcome)
    }

    /// Keep fetching until the query is exhausted, closed, or `max_pages`
    /// pages were loaded by this call. Returns how many pages were merged.
    pub async fn run<S: PageSource>(
        &mut self,
        source: &S,
        max_pages: Option<u32>,
    ) -> Result<u32, SessionError> {
        let mut loaded = 0;
        while max_pages.map_or(true, |m| loaded < m) {
            match self.fetch_next(source).await? {
                Some(_) => loaded += 1,
                None => break,
            }
        }
        Ok(loaded)
    }

    pub fn export_records(&self) -> Vec<ExportRecord> {
        self.records()
            .iter()
            .map(|r| ExportRecord::from_service(r.service().clone()))
            .collect()
    }

    /// Export everything aggregated so far. A page that failed to load is
    /// named in the outcome message.
    pub fn export(&self, format: ExportFormat, path: &Path) -> ExportOutcome {
        let urls = normalized_urls(self.records());
        match format {
            ExportFormat::Xlsx => export_xlsx(
                path,
                &self.export_records(),
                &urls,
                &self.config.additional_fields,
                self.failed_page,
            ),
            ExportFormat::Txt => export_txt(path, &urls, self.failed_page),
        }
    }

    fn fail(&mut self, err: SessionError) -> SessionError {
        warn!(title = %self.title(), error = %err, "page failed");
        if let SessionError::Fetch { page, .. } | SessionError::Decode { page, .. } = &err {
            self.failed_page = Some(*page);
        }
        self.last_error = Some(err.to_string());
        err
    }
}

fn now_rfc3339() -> String {
    OffsetDateTime::now_utc()
        .format(&well_known::Rfc3339)
        .unwrap_or_else(|_| String::from("1970-01-01T00:00:00Z"))
}
