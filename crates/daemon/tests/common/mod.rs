//! In-process ILIAS gateway for provider tests

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::header::{ACCEPT_RANGES, CONTENT_LENGTH, CONTENT_RANGE, COOKIE, RANGE, RETRY_AFTER};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use parking_lot::Mutex;
use url::Url;

use ilias_fuse_daemon::provider::wire::{TreeResponse, WireEntry, WireKind};

pub const SESSION: &str = "PHPSESSID=abc123";

#[derive(Default)]
pub struct Gateway {
    pub cookie: Mutex<String>,
    pub trees: Mutex<HashMap<String, Vec<WireEntry>>>,
    pub contents: Mutex<HashMap<String, Vec<u8>>>,
    /// Advertise and honor `Range` requests
    pub ranged: bool,
    /// Keep advertising ranges but answer them with the whole body
    pub ignore_range: AtomicBool,
    /// Status (and Retry-After) for the next request
    pub fail_next: Mutex<Option<(StatusCode, Option<&'static str>)>>,
    pub requests: AtomicUsize,
}

impl Gateway {
    pub fn new(ranged: bool) -> Arc<Self> {
        let gateway = Self {
            ranged,
            ..Self::default()
        };
        *gateway.cookie.lock() = SESSION.to_string();
        Arc::new(gateway)
    }

    pub fn entry(id: &str, name: &str, kind: WireKind) -> WireEntry {
        WireEntry {
            id: id.into(),
            name: name.into(),
            kind,
            size: None,
            modified: None,
            url: None,
        }
    }

    pub fn set_tree(&self, id: &str, children: Vec<WireEntry>) {
        self.trees.lock().insert(id.to_string(), children);
    }

    pub fn set_content(&self, id: &str, content: Vec<u8>) {
        self.contents.lock().insert(id.to_string(), content);
    }

    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    fn check(&self, headers: &HeaderMap) -> Option<Response> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        if let Some((status, retry_after)) = self.fail_next.lock().take() {
            let mut response = status.into_response();
            if let Some(retry_after) = retry_after {
                response
                    .headers_mut()
                    .insert(RETRY_AFTER, retry_after.parse().unwrap());
            }
            return Some(response);
        }
        let sent = headers.get(COOKIE).and_then(|value| value.to_str().ok());
        if sent != Some(self.cookie.lock().as_str()) {
            return Some(StatusCode::UNAUTHORIZED.into_response());
        }
        None
    }
}

async fn tree(
    State(gateway): State<Arc<Gateway>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Response {
    if let Some(rejected) = gateway.check(&headers) {
        return rejected;
    }
    match gateway.trees.lock().get(&id) {
        Some(children) => Json(TreeResponse {
            children: children.clone(),
        })
        .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn content(
    State(gateway): State<Arc<Gateway>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Response {
    if let Some(rejected) = gateway.check(&headers) {
        return rejected;
    }
    let Some(body) = gateway.contents.lock().get(&id).cloned() else {
        return StatusCode::NOT_FOUND.into_response();
    };
    if !gateway.ranged {
        return body.into_response();
    }

    let requested = headers
        .get(RANGE)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("bytes="))
        .and_then(|value| value.split_once('-'))
        .and_then(|(start, end)| Some((start.parse::<usize>().ok()?, end.parse::<usize>().ok()?)));

    if gateway.ignore_range.load(Ordering::SeqCst) {
        return ([(ACCEPT_RANGES, "bytes")], body).into_response();
    }
    match requested {
        None => ([(ACCEPT_RANGES, "bytes")], body).into_response(),
        Some((start, _)) if start >= body.len() => StatusCode::RANGE_NOT_SATISFIABLE.into_response(),
        Some((start, end)) => {
            let end = end.min(body.len() - 1);
            let range = format!("bytes {}-{}/{}", start, end, body.len());
            (
                StatusCode::PARTIAL_CONTENT,
                [(ACCEPT_RANGES, "bytes".to_string()), (CONTENT_RANGE, range)],
                body[start..=end].to_vec(),
            )
                .into_response()
        }
    }
}

async fn content_head(
    State(gateway): State<Arc<Gateway>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Response {
    if let Some(rejected) = gateway.check(&headers) {
        return rejected;
    }
    match gateway.contents.lock().get(&id) {
        Some(body) => (StatusCode::OK, [(CONTENT_LENGTH, body.len().to_string())]).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

/// Serve `gateway` on an ephemeral port; returns its base URL
pub async fn serve(gateway: Arc<Gateway>) -> Url {
    let app = Router::new()
        .route("/api/v0/tree/:id", get(tree))
        .route("/api/v0/content/:id", get(content).head(content_head))
        .with_state(gateway);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    Url::parse(&format!("http://{}/", addr)).unwrap()
}

/// Cookie file holding the gateway's session
pub fn cookie_file(dir: &tempfile::TempDir) -> std::path::PathBuf {
    let path = dir.path().join("cookies.txt");
    std::fs::write(&path, format!("{}\n", SESSION)).unwrap();
    path
}
