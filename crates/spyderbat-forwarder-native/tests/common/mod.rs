// Copyright 2022-Present Spyderbat, Inc. https://www.spyderbat.com/
// SPDX-License-Identifier: Apache-2.0

//! Mock upstream API and webhook receiver for integration tests.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::Router;

/// Mock Spyderbat API: reachability probe, source list, and NDJSON event
/// pages served from a queue.
pub struct MockUpstream {
    pub addr: SocketAddr,
    state: Arc<UpstreamState>,
}

#[derive(Default)]
struct UpstreamState {
    pages: Mutex<VecDeque<String>>,
    sources: Mutex<String>,
    unreachable: AtomicBool,
    events_requests: AtomicUsize,
}

impl MockUpstream {
    pub async fn start() -> Self {
        let state = Arc::new(UpstreamState {
            sources: Mutex::new("[]".to_string()),
            ..UpstreamState::default()
        });

        let app = Router::new()
            .route("/api/v1/org/{org}", get(org_handler))
            .route("/api/v1/org/{org}/source/", get(sources_handler))
            .route("/api/v1/org/{org}/events/{iterator}", get(events_handler))
            .with_state(Arc::clone(&state));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        MockUpstream { addr, state }
    }

    /// Base URL of the form the API client expects, ending in the org uid.
    pub fn base_url(&self, org_uid: &str) -> String {
        format!("http://{}/api/v1/org/{org_uid}", self.addr)
    }

    /// Makes the reachability probe fail: responses stop carrying the
    /// context uid header.
    pub fn set_unreachable(&self) {
        self.state.unreachable.store(true, Ordering::SeqCst);
    }

    pub fn set_sources(&self, sources: serde_json::Value) {
        *self.state.sources.lock().unwrap() = sources.to_string();
    }

    /// Queues one NDJSON page: the records followed by an iterator
    /// envelope. Once the queue is empty the events endpoint serves empty
    /// pages with no envelope.
    pub fn push_page(&self, records: &[serde_json::Value], next_iterator: &str) {
        let mut body = String::new();
        for record in records {
            body.push_str(&record.to_string());
            body.push('\n');
        }
        body.push_str(&serde_json::json!({ "iterator": next_iterator }).to_string());
        body.push('\n');
        self.state.pages.lock().unwrap().push_back(body);
    }

    pub fn events_requests(&self) -> usize {
        self.state.events_requests.load(Ordering::SeqCst)
    }
}

async fn org_handler(State(state): State<Arc<UpstreamState>>) -> impl IntoResponse {
    if state.unreachable.load(Ordering::SeqCst) {
        (
            StatusCode::FORBIDDEN,
            [
                ("X-Jwt-Expiration", "2021-01-01T00:00:00Z"),
                ("Server", "mock-upstream"),
            ],
            "forbidden",
        )
            .into_response()
    } else {
        ([("X-Context-Uid", "ctx-test-1234")], "{}").into_response()
    }
}

async fn sources_handler(State(state): State<Arc<UpstreamState>>) -> impl IntoResponse {
    let body = state.sources.lock().unwrap().clone();
    ([("Content-Type", "application/json")], body)
}

async fn events_handler(
    Path((_org, _iterator)): Path<(String, String)>,
    State(state): State<Arc<UpstreamState>>,
) -> impl IntoResponse {
    state.events_requests.fetch_add(1, Ordering::SeqCst);
    let body = state
        .pages
        .lock()
        .unwrap()
        .pop_front()
        .unwrap_or_default();
    ([("Content-Type", "application/x-ndjson")], body)
}

/// One request captured by the mock webhook receiver.
#[derive(Debug, Clone)]
pub struct ReceivedRequest {
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl ReceivedRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Mock webhook receiver capturing every POST body and its headers.
pub struct MockWebhook {
    pub addr: SocketAddr,
    state: Arc<WebhookState>,
}

#[derive(Default)]
struct WebhookState {
    requests: Mutex<Vec<ReceivedRequest>>,
    remaining_failures: AtomicUsize,
}

impl MockWebhook {
    pub async fn start() -> Self {
        let state = Arc::new(WebhookState::default());

        let app = Router::new()
            .route("/ingest", post(ingest_handler))
            .with_state(Arc::clone(&state));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        MockWebhook { addr, state }
    }

    pub fn url(&self) -> String {
        format!("http://{}/ingest", self.addr)
    }

    /// The next `count` requests are answered with 500 before being
    /// recorded; used to exercise the retry path.
    pub fn fail_next(&self, count: usize) {
        self.state.remaining_failures.store(count, Ordering::SeqCst);
    }

    pub fn requests(&self) -> Vec<ReceivedRequest> {
        self.state.requests.lock().unwrap().clone()
    }

    pub fn request_count(&self) -> usize {
        self.state.requests.lock().unwrap().len()
    }

    pub fn total_body_bytes(&self) -> usize {
        self.state
            .requests
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.body.len())
            .sum()
    }
}

async fn ingest_handler(
    State(state): State<Arc<WebhookState>>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    let failing = state
        .remaining_failures
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok();
    if failing {
        return (StatusCode::INTERNAL_SERVER_ERROR, "try again").into_response();
    }

    let headers = headers
        .iter()
        .map(|(k, v)| {
            (
                k.as_str().to_string(),
                v.to_str().unwrap_or_default().to_string(),
            )
        })
        .collect();
    state.requests.lock().unwrap().push(ReceivedRequest {
        headers,
        body: body.to_vec(),
    });

    (StatusCode::OK, r#"{"ok":true}"#).into_response()
}

/// Polls `predicate` until it returns true or the timeout elapses.
pub async fn wait_for(timeout: std::time::Duration, mut predicate: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if predicate() {
            return true;
        }
        tokio::time::sleep(std::time::Duration::from_millis(25)).await;
    }
    predicate()
}
