use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use crate::types::{AdditionalField, Service, ServiceEntry};

/// Why a response body could not be turned into a page.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("failed to parse response: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("search API error: {0}")]
    Api(String),
}

/// One page of search results as returned by the API.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Page {
    #[serde(default)]
    pub error: bool,
    #[serde(default)]
    pub errmsg: Option<String>,
    /// Total number of results the server reports for the query.
    #[serde(default)]
    pub size: u64,
    /// Opaque cursor for the following page.
    #[serde(default)]
    pub next: Option<String>,
    #[serde(default)]
    pub results: Vec<Vec<Value>>,
}

/// Parse a raw response body. Pages flagged with `error` are surfaced as
/// [`DecodeError::Api`] so callers never merge them.
pub fn parse_page(body: &str) -> Result<Page, DecodeError> {
    let page: Page = serde_json::from_str(body)?;
    if page.error {
        let msg = page
            .errmsg
            .clone()
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| "query failed".to_string());
        return Err(DecodeError::Api(msg));
    }
    Ok(page)
}

/// Decode every usable row of `page` into `T`, in response order.
///
/// Rows shorter than the fixed column set are skipped, as are http(s) rows
/// on a non-default port whose host does not spell out that port.
pub fn decode_page<T: ServiceEntry>(page: &Page, fields: &[AdditionalField]) -> Vec<T> {
    page.results
        .iter()
        .filter_map(|row| Service::from_row(row, fields))
        .filter(keep_service)
        .map(T::from_service)
        .collect()
}

fn keep_service(s: &Service) -> bool {
    if s.port == 80 || s.port == 443 {
        return true;
    }
    if s.protocol != "http" && s.protocol != "https" {
        return true;
    }
    s.host.ends_with(&format!(":{}", s.port))
}
