#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::Mutex;

use fofa_view_rs::client::{FetchOutcome, FetchStatus, PageSource};
use serde_json::{json, Value};
use url::Url;

/// Replays canned responses in order and records every requested URL.
#[derive(Default)]
pub struct ScriptedSource {
    responses: Mutex<VecDeque<FetchOutcome>>,
    pub urls: Mutex<Vec<Url>>,
}

impl ScriptedSource {
    pub fn new(responses: Vec<FetchOutcome>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            urls: Mutex::new(Vec::new()),
        }
    }

    pub fn requested(&self) -> Vec<Url> {
        self.urls.lock().unwrap().clone()
    }
}

impl PageSource for ScriptedSource {
    async fn fetch(&self, url: Url) -> FetchOutcome {
        self.urls.lock().unwrap().push(url);
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| FetchOutcome::error("no scripted response left"))
    }
}

/// Never answers; used to exercise cancellation of in-flight fetches.
pub struct PendingSource;

impl PageSource for PendingSource {
    async fn fetch(&self, _url: Url) -> FetchOutcome {
        std::future::pending().await
    }
}

pub fn row(host: &str, title: &str, ip: &str, port: u16, protocol: &str) -> Value {
    let link = if host.starts_with("http") {
        host.to_string()
    } else {
        format!("{protocol}://{host}")
    };
    json!([host, title, ip, "", port.to_string(), protocol, "nginx", link])
}

pub fn page_body(size: u64, next: Option<&str>, rows: Vec<Value>) -> String {
    json!({
        "error": false,
        "size": size,
        "next": next,
        "results": rows,
    })
    .to_string()
}

pub fn ok(body: String) -> FetchOutcome {
    FetchOutcome::success(body)
}

pub fn http_error(code: u16) -> FetchOutcome {
    FetchOutcome {
        status: FetchStatus::Http(code),
        body: format!("request failed with status {code}"),
    }
}
