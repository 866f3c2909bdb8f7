use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tracing::{debug, warn};
use url::Url;

use crate::config::FofaConfig;
use crate::query::{account_url, cert_query, cert_target, icon_query, QueryError};

const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0 Safari/537.36";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);
const PIVOT_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_PAGE_BYTES: usize = 10 * 1024 * 1024;
const MAX_ICON_BYTES: usize = 5 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("http client error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("request failed: {0}")]
    Request(String),
    #[error("failed to parse response: {0}")]
    Parse(#[from] serde_json::Error),
    #[error(transparent)]
    Query(#[from] QueryError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("tls error: {0}")]
    Tls(#[from] native_tls::Error),
    #[error("certificate: {0}")]
    Certificate(String),
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FetchStatus {
    Success,
    Http(u16),
    Error,
}

/// Result of one HTTP fetch: the raw body on success, a readable message otherwise.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct FetchOutcome {
    pub status: FetchStatus,
    pub body: String,
}

impl FetchOutcome {
    pub fn success(body: impl Into<String>) -> Self {
        Self {
            status: FetchStatus::Success,
            body: body.into(),
        }
    }

    pub fn error(msg: impl Into<String>) -> Self {
        Self {
            status: FetchStatus::Error,
            body: msg.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == FetchStatus::Success
    }
}

/// Anything that can fetch one search page.
pub trait PageSource: Send + Sync + 'static {
    fn fetch(&self, url: Url) -> impl Future<Output = FetchOutcome> + Send;
}

/// Remaining API quota of the configured account.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct AccountQuota {
    #[serde(default)]
    pub remain_api_query: i64,
    #[serde(default)]
    pub remain_api_data: i64,
}

/// `reqwest` backed [`PageSource`] talking to the FOFA API.
#[derive(Debug, Clone)]
pub struct FofaClient {
    http: reqwest::Client,
}

impl FofaClient {
    pub fn new(config: &FofaConfig) -> Result<Self, ClientError> {
        let mut builder = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(REQUEST_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .danger_accept_invalid_certs(true);
        if let Some(proxy) = config.proxy.url() {
            debug!(kind = ?config.proxy.kind, "using proxy");
            builder = builder.proxy(reqwest::Proxy::all(proxy)?);
        } else {
            builder = builder.no_proxy();
        }
        Ok(Self {
            http: builder.build()?,
        })
    }

    /// Ask the account endpoint how much query budget is left.
    pub async fn account_quota(&self, config: &FofaConfig) -> Result<AccountQuota, ClientError> {
        let outcome = self.fetch(account_url(config)?).await;
        if !outcome.is_success() {
            return Err(ClientError::Request(outcome.body));
        }
        Ok(serde_json::from_str(&outcome.body)?)
    }

    /// `icon_hash="<n>"` for the favicon of the site at `target`.
    ///
    /// The icon is taken from the page's `<link rel="icon">`, falling back to
    /// `/favicon.ico`.
    pub async fn favicon_query(&self, target: &str) -> Result<String, ClientError> {
        let page = Url::parse(target.trim())?;
        if !matches!(page.scheme(), "http" | "https") {
            return Err(ClientError::Request(format!(
                "unsupported scheme: {}",
                page.scheme()
            )));
        }
        let icon_url = match self.icon_link(&page).await {
            Some(link) => link,
            None => page.join("/favicon.ico")?,
        };
        debug!(url = %icon_url, "fetching favicon");
        let icon = self.get_bytes(icon_url, MAX_ICON_BYTES).await?;
        if icon.is_empty() {
            return Err(ClientError::Request("favicon is empty".into()));
        }
        Ok(icon_query(&icon))
    }

    async fn icon_link(&self, page: &Url) -> Option<Url> {
        match self.get_bytes(page.clone(), MAX_PAGE_BYTES).await {
            Ok(body) => find_icon_link(page, &String::from_utf8_lossy(&body)),
            Err(e) => {
                debug!(url = %page, error = %e, "page not readable, trying /favicon.ico");
                None
            }
        }
    }

    async fn get_bytes(&self, url: Url, limit: usize) -> Result<Vec<u8>, ClientError> {
        let resp = self.http.get(url).timeout(PIVOT_TIMEOUT).send().await?;
        let code = resp.status().as_u16();
        if code != 200 {
            return Err(ClientError::Request(format!("HTTP {code}")));
        }
        let too_large = || ClientError::Request(format!("response larger than {limit} bytes"));
        if resp.content_length().is_some_and(|n| n > limit as u64) {
            return Err(too_large());
        }
        let body = resp.bytes().await?;
        if body.len() > limit {
            return Err(too_large());
        }
        Ok(body.to_vec())
    }
}

/// First `<link rel="icon">` (or `shortcut icon`) of `html`, resolved
/// against the page URL.
pub fn find_icon_link(page: &Url, html: &str) -> Option<Url> {
    let doc = Html::parse_document(html);
    let selector = Selector::parse("link[rel][href]").ok()?;
    doc.select(&selector)
        .filter(|el| {
            el.value()
                .attr("rel")
                .is_some_and(|rel| rel.split_whitespace().any(|t| t.eq_ignore_ascii_case("icon")))
        })
        .filter_map(|el| el.value().attr("href"))
        .map(str::trim)
        .find(|href| !href.is_empty() && href.len() <= 2048)
        .and_then(|href| page.join(href).ok())
}

/// Read the certificate served on `host` (`host`, `host:port` or a URL) and
/// turn its serial into a `cert="<n>"` query. Certificate validity is not
/// checked.
pub async fn cert_query_for_host(host: &str) -> Result<String, ClientError> {
    let (name, port) = cert_target(host)?;
    debug!(host = %name, port, "reading certificate");
    let der = tokio::time::timeout(PIVOT_TIMEOUT, peer_certificate(&name, port))
        .await
        .map_err(|_| ClientError::Request(format!("{name}:{port}: certificate read timed out")))??;
    cert_query_from_der(&der)
}

async fn peer_certificate(host: &str, port: u16) -> Result<Vec<u8>, ClientError> {
    let tcp = TcpStream::connect((host, port)).await?;
    let connector = native_tls::TlsConnector::builder()
        .danger_accept_invalid_certs(true)
        .danger_accept_invalid_hostnames(true)
        .build()?;
    let tls = tokio_native_tls::TlsConnector::from(connector)
        .connect(host, tcp)
        .await?;
    let cert = tls
        .get_ref()
        .peer_certificate()?
        .ok_or_else(|| ClientError::Certificate("server sent no certificate".into()))?;
    Ok(cert.to_der()?)
}

pub fn cert_query_from_der(der: &[u8]) -> Result<String, ClientError> {
    let (_, cert) = x509_parser::parse_x509_certificate(der)
        .map_err(|e| ClientError::Certificate(e.to_string()))?;
    Ok(cert_query(&cert.tbs_certificate.serial))
}

impl PageSource for FofaClient {
    async fn fetch(&self, url: Url) -> FetchOutcome {
        let resp = match self.http.get(url).send().await {
            Ok(r) => r,
            Err(e) if e.is_timeout() => return FetchOutcome::error("request timed out"),
            Err(e) => {
                warn!(error = %e, "search request failed");
                return FetchOutcome::error(e.to_string());
            }
        };

        let code = resp.status().as_u16();
        if code != 200 {
            return FetchOutcome {
                status: FetchStatus::Http(code),
                body: status_message(code),
            };
        }
        match resp.text().await {
            Ok(body) => FetchOutcome::success(body),
            Err(e) => FetchOutcome::error(e.to_string()),
        }
    }
}

fn status_message(code: u16) -> String {
    match code {
        401 => "status 401: no valid key is configured, or the account is not allowed to use the API".to_string(),
        502 => "status 502: the account may limit rows per request, try max_size=100".to_string(),
        _ => format!("request failed with status {code}"),
    }
}
