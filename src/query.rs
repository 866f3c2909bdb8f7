use base64::prelude::*;
use serde::{Deserialize, Serialize};
use std::io::Cursor;
use thiserror::Error;
use url::Url;
use x509_parser::der_parser::num_bigint::BigUint;

use crate::config::FofaConfig;
use crate::types::FIXED_FIELDS;

pub const SEARCH_PATH: &str = "/api/v1/search/next";
pub const ACCOUNT_PATH: &str = "/api/v1/info/my";

/// Marker prepended to session titles whose query excludes honeypot and
/// fraud results.
pub const EXCLUDE_MARKER: &str = "(*)";

/// Characters refused in a host handed to the certificate lookup.
const HOST_REJECT: &[char] = &['<', '>', '"', '\'', '&', '|', ';', '`', '$', '(', ')', ' '];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueryError {
    #[error("certificate serial must be hexadecimal: {0:?}")]
    InvalidSerial(String),
    #[error("invalid host: {0:?}")]
    InvalidHost(String),
}

/// What the user asked for in one query session.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchRequest {
    pub query: String,
    /// Ask the API to match all historical data rather than the last year.
    #[serde(default)]
    pub full: bool,
    #[serde(default)]
    pub exclude_honeypot: bool,
}

impl SearchRequest {
    pub fn new(query: impl Into<String>) -> Self {
        let query: String = query.into();
        Self {
            query: query.trim().to_string(),
            ..Default::default()
        }
    }

    /// Session title: the query, prefixed with the exclusion marker when
    /// honeypots are filtered out.
    pub fn title(&self) -> String {
        if self.exclude_honeypot && !self.query.starts_with(EXCLUDE_MARKER) {
            format!("{EXCLUDE_MARKER}{}", self.query)
        } else {
            self.query.clone()
        }
    }

    /// Query string actually sent to the API.
    pub fn effective_query(&self) -> String {
        query_from_title(&self.title())
    }
}

/// Recover the API query from a session title.
pub fn query_from_title(title: &str) -> String {
    match title.strip_prefix(EXCLUDE_MARKER) {
        Some(q) => format!("({q}) && (is_honeypot=false && is_fraud=false)"),
        None => title.to_string(),
    }
}

pub fn encode_query(query: &str) -> String {
    BASE64_STANDARD.encode(query.as_bytes())
}

/// Comma separated field list: the fixed columns then the additional ones
/// in the order the decoder will read them back.
pub fn fields_param(config: &FofaConfig) -> String {
    FIXED_FIELDS
        .iter()
        .copied()
        .chain(config.additional_fields.iter().map(|f| f.api_name()))
        .collect::<Vec<_>>()
        .join(",")
}

/// Build the URL of one search page. `next` is the cursor returned by the
/// previous page, if any.
pub fn search_url(
    config: &FofaConfig,
    request: &SearchRequest,
    next: Option<&str>,
) -> Result<Url, url::ParseError> {
    let mut url = Url::parse(&format!("{}{SEARCH_PATH}", config.api.trim_end_matches('/')))?;
    {
        let mut q = url.query_pairs_mut();
        q.append_pair("key", &config.key);
        if request.full {
            q.append_pair("full", "true");
        }
        q.append_pair("size", &config.page_size.to_string());
        q.append_pair("fields", &fields_param(config));
        q.append_pair("qbase64", &encode_query(&request.effective_query()));
        if let Some(cursor) = next {
            q.append_pair("next", cursor);
        }
    }
    Ok(url)
}

pub fn account_url(config: &FofaConfig) -> Result<Url, url::ParseError> {
    let mut url = Url::parse(&format!("{}{ACCOUNT_PATH}", config.api.trim_end_matches('/')))?;
    url.query_pairs_mut().append_pair("key", &config.key);
    Ok(url)
}

/// `cert="<decimal serial>"` from a hex serial as printed by browsers and
/// openssl. Whitespace and `:` separators are ignored.
pub fn cert_query_from_hex(serial: &str) -> Result<String, QueryError> {
    let hex: String = serial
        .chars()
        .filter(|c| !c.is_whitespace() && *c != ':')
        .collect();
    if hex.is_empty() || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(QueryError::InvalidSerial(serial.to_string()));
    }
    BigUint::parse_bytes(hex.as_bytes(), 16)
        .map(|n| cert_query(&n))
        .ok_or_else(|| QueryError::InvalidSerial(serial.to_string()))
}

pub fn cert_query(serial: &BigUint) -> String {
    format!("cert=\"{serial}\"")
}

/// Host and port to read a certificate from. Accepts `host`, `host:port`
/// or a URL; the port defaults to 443.
pub fn cert_target(input: &str) -> Result<(String, u16), QueryError> {
    let invalid = || QueryError::InvalidHost(input.to_string());
    let trimmed = input.trim();
    let rest = trimmed
        .strip_prefix("https://")
        .or_else(|| trimmed.strip_prefix("http://"))
        .unwrap_or(trimmed);
    let authority = rest.split(['/', '?', '#']).next().unwrap_or_default();
    if authority.is_empty() || authority.len() > 255 || authority.contains(HOST_REJECT) {
        return Err(invalid());
    }
    let (host, port) = match authority.rsplit_once(':') {
        Some((h, p)) => (h, p.parse::<u16>().map_err(|_| invalid())?),
        None => (authority, 443),
    };
    if host.is_empty() || port == 0 {
        return Err(invalid());
    }
    Ok((host.to_string(), port))
}

/// FOFA favicon hash: murmur3 (x86, 32 bit, seed 0) over the base64 of the
/// icon bytes followed by a newline, read as unsigned.
pub fn icon_hash(icon: &[u8]) -> u32 {
    let mut text = BASE64_STANDARD.encode(icon);
    text.push('\n');
    murmur3_32(text.as_bytes())
}

pub fn icon_query(icon: &[u8]) -> String {
    format!("icon_hash=\"{}\"", icon_hash(icon))
}

fn murmur3_32(data: &[u8]) -> u32 {
    // Reading from memory cannot fail.
    murmur3::murmur3_32(&mut Cursor::new(data), 0).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::AdditionalField;

    #[test]
    fn exclusion_round_trips_through_title() {
        let req = SearchRequest {
            query: "app=\"nginx\"".into(),
            exclude_honeypot: true,
            ..Default::default()
        };
        assert_eq!(req.title(), "(*)app=\"nginx\"");
        assert_eq!(
            req.effective_query(),
            "(app=\"nginx\") && (is_honeypot=false && is_fraud=false)"
        );
        assert_eq!(query_from_title("port=80"), "port=80");
    }

    #[test]
    fn search_url_carries_all_params() {
        let cfg = FofaConfig {
            key: "k".into(),
            page_size: 100,
            additional_fields: vec![AdditionalField::Os, AdditionalField::Fid],
            ..Default::default()
        };
        let req = SearchRequest {
            query: "port=443".into(),
            full: true,
            ..Default::default()
        };
        let url = search_url(&cfg, &req, Some("cur+/=")).unwrap();
        let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        let get = |k: &str| pairs.iter().find(|(n, _)| n == k).map(|(_, v)| v.clone());

        assert!(url.as_str().starts_with("https://fofa.info/api/v1/search/next?"));
        assert_eq!(get("key").as_deref(), Some("k"));
        assert_eq!(get("full").as_deref(), Some("true"));
        assert_eq!(get("size").as_deref(), Some("100"));
        assert_eq!(
            get("fields").as_deref(),
            Some("host,title,ip,domain,port,protocol,server,link,os,fid")
        );
        assert_eq!(get("qbase64"), Some(encode_query("port=443")));
        assert_eq!(get("next").as_deref(), Some("cur+/="));
    }

    #[test]
    fn full_flag_is_optional() {
        let url = search_url(&FofaConfig::default(), &SearchRequest::new("x"), None).unwrap();
        assert!(!url.as_str().contains("full="));
        assert!(!url.as_str().contains("next="));
    }

    #[test]
    fn hex_serial_becomes_decimal_cert_query() {
        assert_eq!(cert_query_from_hex("0A1B2C3D4E5F").unwrap(), "cert=\"11111822610015\"");
        assert_eq!(cert_query_from_hex(" 0a:1b:2c:3d:4e:5f\n").unwrap(), "cert=\"11111822610015\"");
        // 160-bit serials do not fit any primitive integer.
        assert_eq!(
            cert_query_from_hex("4b2e3f1a9c8d7e6f5a4b3c2d1e0f9a8b7c6d5e4f").unwrap(),
            "cert=\"429205639220369859427316211785881138689624333903\""
        );
        assert!(matches!(cert_query_from_hex("xyz"), Err(QueryError::InvalidSerial(_))));
        assert!(cert_query_from_hex("  ").is_err());
    }

    #[test]
    fn cert_target_accepts_hosts_and_urls() {
        assert_eq!(cert_target("example.com").unwrap(), ("example.com".into(), 443));
        assert_eq!(cert_target("https://example.com:8443/login").unwrap(), ("example.com".into(), 8443));
        assert_eq!(cert_target("http://10.0.0.1").unwrap(), ("10.0.0.1".into(), 443));
        assert!(cert_target("").is_err());
        assert!(cert_target("a.com:notaport").is_err());
        assert!(cert_target("a.com;rm").is_err());
        assert!(cert_target(":443").is_err());
    }

    #[test]
    fn murmur3_matches_known_answers() {
        assert_eq!(murmur3_32(b""), 0);
        assert_eq!(murmur3_32(b"hello"), 613153351);
        assert_eq!(murmur3_32(b"foo"), 4138058784);
    }

    #[test]
    fn icon_hash_covers_base64_with_trailing_newline() {
        assert_eq!(icon_hash(b"fofa-favicon"), 2854341567);
        assert_eq!(murmur3_32(b"Zm9mYS1mYXZpY29u\n"), 2854341567);
        let all: Vec<u8> = (0..=255).collect();
        assert_eq!(icon_query(&all), "icon_hash=\"2693690620\"");
    }
}
