// Copyright 2022-Present Spyderbat, Inc. https://www.spyderbat.com/
// SPDX-License-Identifier: Apache-2.0

//! Batching webhook dispatcher.
//!
//! Enriched records are buffered and delivered to an HTTPS endpoint in
//! batches bounded by a size budget and an age budget, optionally
//! compressed, authenticated by one of several schemes, with retries and a
//! graceful drain on shutdown.
//!
//! # Architecture
//!
//! ```text
//!   send()                ingest worker               sender worker
//!     │                        │                           │
//!     v                        v                           v
//!   ┌──────────────┐    ┌─────────────┐    ┌─────────────────────────┐
//!   │ message queue│───>│ accumulate  │───>│ compress + auth + POST  │
//!   │  (cap 10000) │    │ size/age cut│    │ retry w/ backoff        │
//!   └──────────────┘    └─────────────┘    └─────────────────────────┘
//!                          payload queue (cap 10)
//! ```
//!
//! Two cooperating workers own all mutable state. The ingest worker folds
//! messages into the current payload buffer, cutting a payload when the
//! next message would exceed the size cap or when the buffer outlives the
//! age cap. The sender worker delivers payloads in FIFO order, one at a
//! time. `send` is non-blocking while the message queue has room; a full
//! queue applies backpressure to the poll loop.
//!
//! Messages are appended without separators: callers hand in complete
//! newline-terminated NDJSON lines and the receiving endpoint parses the
//! concatenation. A single message larger than the payload cap is accepted
//! and shipped alone in an over-cap request; splitting it would corrupt
//! the record.

use std::sync::Arc;
use std::time::{Duration, Instant};

use data_encoding::HEXLOWER;
use flate2::write::GzEncoder;
use hmac::{Hmac, Mac};
use reqwest::header::{
    HeaderMap, HeaderName, HeaderValue, ACCEPT, CONTENT_ENCODING, CONTENT_TYPE,
};
use reqwest::Client;
use sha2::Sha256;
use std::io::Write;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::{AuthMethod, CompressionAlgo, WebhookConfig};

/// Pending-message queue depth; `send` blocks once this many messages are
/// waiting to be folded into payloads.
pub const MESSAGE_QUEUE_DEPTH: usize = 10_000;
/// Formed-payload queue depth. At the default 1 MiB cap this bounds the
/// formed-but-unsent backlog to ~10 MiB.
pub const PAYLOAD_QUEUE_DEPTH: usize = 10;

const MAX_RESPONSE_BYTES: usize = 1024 * 1024;
const RETRY_MAX: u32 = 5;
const RETRY_BASE_DELAY: Duration = Duration::from_millis(500);

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("empty payload")]
    EmptyPayload,

    #[error("webhook is shut down")]
    Closed,

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error("invalid webhook header: {0}")]
    Header(String),

    #[error("failed to compress payload: {0}")]
    Compression(#[from] std::io::Error),

    #[error(
        "webhook returned status code {status}; request headers {request_headers:?}; \
         response headers {response_headers:?}; body {body}"
    )]
    Status {
        status: u16,
        request_headers: HeaderMap,
        response_headers: HeaderMap,
        body: String,
    },
}

/// Timing knobs for batch formation. Production uses the defaults; tests
/// shrink them to exercise age-based flushing quickly.
#[derive(Debug, Clone, Copy)]
pub struct WebhookTuning {
    /// A non-empty payload older than this is flushed by the sweep.
    pub max_payload_age: Duration,
    /// How often the ingest worker checks the payload age.
    pub sweep_interval: Duration,
}

impl Default for WebhookTuning {
    fn default() -> Self {
        WebhookTuning {
            max_payload_age: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(1),
        }
    }
}

/// One formed request body plus its event count.
#[derive(Debug)]
struct Payload {
    bytes: Vec<u8>,
    count: usize,
}

/// Cloneable sending side of the dispatcher. An inert handle (from a
/// webhook constructed without configuration) accepts and discards
/// everything.
#[derive(Debug, Clone, Default)]
pub struct WebhookHandle {
    tx: Option<mpsc::Sender<Vec<u8>>>,
}

impl WebhookHandle {
    /// Queues one event for asynchronous delivery. Blocks only when the
    /// message queue is full. Calling this after shutdown returns
    /// [`WebhookError::Closed`].
    pub async fn send(&self, event: Vec<u8>) -> Result<(), WebhookError> {
        let Some(tx) = &self.tx else {
            return Ok(());
        };
        if event.is_empty() {
            return Err(WebhookError::EmptyPayload);
        }
        tx.send(event).await.map_err(|_| WebhookError::Closed)
    }
}

struct WebhookCore {
    message_tx: mpsc::Sender<Vec<u8>>,
    cancel: CancellationToken,
    ingest: JoinHandle<()>,
    sender: JoinHandle<()>,
}

/// Batching webhook dispatcher. Constructed from an optional config so
/// call sites need no branching: without a config every operation is a
/// no-op.
pub struct Webhook {
    core: Option<WebhookCore>,
}

impl Webhook {
    /// Builds the dispatcher and starts its workers, or an inert instance
    /// when `config` is `None`.
    pub fn new(config: Option<&WebhookConfig>, user_agent: &str) -> Result<Self, WebhookError> {
        Self::with_tuning(config, user_agent, WebhookTuning::default())
    }

    /// [`Webhook::new`] with explicit batch-formation timing.
    pub fn with_tuning(
        config: Option<&WebhookConfig>,
        user_agent: &str,
        tuning: WebhookTuning,
    ) -> Result<Self, WebhookError> {
        let Some(config) = config else {
            return Ok(Webhook { core: None });
        };
        let config = Arc::new(config.clone());

        let client = crate::http::webhook_client(user_agent, config.insecure)?;
        let (message_tx, message_rx) = mpsc::channel(MESSAGE_QUEUE_DEPTH);
        let (payload_tx, payload_rx) = mpsc::channel(PAYLOAD_QUEUE_DEPTH);
        let cancel = CancellationToken::new();

        let ingest_worker = IngestWorker::new(Arc::clone(&config), message_rx, payload_tx, tuning);
        let sender_worker = SenderWorker {
            config,
            client,
            payload_rx,
        };

        let ingest = tokio::spawn(ingest_worker.run(cancel.clone()));
        let sender = tokio::spawn(sender_worker.run());

        Ok(Webhook {
            core: Some(WebhookCore {
                message_tx,
                cancel,
                ingest,
                sender,
            }),
        })
    }

    /// Cloneable sender for the pipeline.
    #[must_use]
    pub fn handle(&self) -> WebhookHandle {
        WebhookHandle {
            tx: self.core.as_ref().map(|c| c.message_tx.clone()),
        }
    }

    /// Queues one event for asynchronous delivery. See
    /// [`WebhookHandle::send`].
    pub async fn send(&self, event: Vec<u8>) -> Result<(), WebhookError> {
        self.handle().send(event).await
    }

    /// Drains queued messages into final payloads, delivers them, and
    /// stops both workers. `send` must not be called afterwards.
    pub async fn shutdown(self) {
        let Some(core) = self.core else {
            return;
        };
        info!("shutting down webhook");
        core.cancel.cancel();
        drop(core.message_tx);
        if let Err(e) = core.ingest.await {
            error!(error = %e, "webhook ingest worker failed");
        }
        if let Err(e) = core.sender.await {
            error!(error = %e, "webhook sender worker failed");
        }
    }
}

/// Folds messages into size- and age-bounded payloads.
struct IngestWorker {
    config: Arc<WebhookConfig>,
    message_rx: mpsc::Receiver<Vec<u8>>,
    payload_tx: mpsc::Sender<Payload>,
    tuning: WebhookTuning,
    payload: Vec<u8>,
    count: usize,
    created: Instant,
}

impl IngestWorker {
    fn new(
        config: Arc<WebhookConfig>,
        message_rx: mpsc::Receiver<Vec<u8>>,
        payload_tx: mpsc::Sender<Payload>,
        tuning: WebhookTuning,
    ) -> Self {
        IngestWorker {
            config,
            message_rx,
            payload_tx,
            tuning,
            payload: Vec::new(),
            count: 0,
            created: Instant::now(),
        }
    }

    async fn run(mut self, cancel: CancellationToken) {
        let mut sweep = tokio::time::interval(self.tuning.sweep_interval);

        loop {
            tokio::select! {
                _ = sweep.tick() => {
                    if self.created.elapsed() > self.tuning.max_payload_age {
                        self.queue_payload().await;
                    }
                }
                message = self.message_rx.recv() => {
                    match message {
                        Some(message) => self.append(message).await,
                        // All senders dropped without an explicit
                        // shutdown; flush what we have and exit.
                        None => break,
                    }
                }
                _ = cancel.cancelled() => {
                    // Refuse new messages, then drain everything already
                    // queued with the same size-aware append.
                    self.message_rx.close();
                    while let Some(message) = self.message_rx.recv().await {
                        self.append(message).await;
                    }
                    break;
                }
            }
        }

        self.queue_payload().await;
        // Dropping self closes the payload queue, stopping the sender.
    }

    async fn append(&mut self, message: Vec<u8>) {
        if self.payload.len() + message.len() > self.config.max_payload_bytes {
            self.queue_payload().await;
        }
        self.payload.extend_from_slice(&message);
        self.count += 1;
    }

    async fn queue_payload(&mut self) {
        let bytes = std::mem::take(&mut self.payload);
        let count = std::mem::take(&mut self.count);
        self.created = Instant::now();
        if bytes.is_empty() {
            return;
        }
        if self.payload_tx.send(Payload { bytes, count }).await.is_err() {
            error!("webhook payload queue closed; dropping payload");
        }
    }
}

/// Delivers payloads in FIFO order until the payload queue closes.
struct SenderWorker {
    config: Arc<WebhookConfig>,
    client: Client,
    payload_rx: mpsc::Receiver<Payload>,
}

impl SenderWorker {
    async fn run(mut self) {
        while let Some(payload) = self.payload_rx.recv().await {
            if let Err(e) = self.send_payload(&payload).await {
                error!(error = %e, "failed to send events to webhook");
            }
        }
    }

    async fn send_payload(&self, payload: &Payload) -> Result<(), WebhookError> {
        // The HMAC covers the plaintext, not the compressed body.
        let hmac_tag = match self.config.auth_method() {
            AuthMethod::Hmac => Some(hmac_hex(
                &self.config.authentication.parameters.secret_key_bytes().unwrap_or_default(),
                &payload.bytes,
            )?),
            _ => None,
        };

        let body = match self.config.compression() {
            CompressionAlgo::None => payload.bytes.clone(),
            CompressionAlgo::Gzip => gzip_encode(&payload.bytes)?,
            CompressionAlgo::Zstd => zstd_encode(&payload.bytes)?,
        };
        let compressed_bytes = body.len();

        let builder = self
            .request_builder(hmac_tag.as_deref())?
            .body(body);

        let mut attempts: u32 = 0;
        loop {
            attempts += 1;

            let request = builder
                .try_clone()
                .ok_or_else(|| WebhookError::Header("request not cloneable".to_string()))?
                .build()?;
            let request_headers = request.headers().clone();

            match self.client.execute(request).await {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        info!(
                            events = payload.count,
                            bytes = payload.bytes.len(),
                            compressed_bytes,
                            status_code = status.as_u16(),
                            "published to webhook"
                        );
                        return Ok(());
                    }
                    if status.is_server_error() && attempts <= RETRY_MAX {
                        tokio::time::sleep(backoff(attempts)).await;
                        continue;
                    }
                    let response_headers = resp.headers().clone();
                    let mut snippet = resp.bytes().await.unwrap_or_default().to_vec();
                    snippet.truncate(MAX_RESPONSE_BYTES);
                    return Err(WebhookError::Status {
                        status: status.as_u16(),
                        request_headers,
                        response_headers,
                        body: String::from_utf8_lossy(&snippet).into_owned(),
                    });
                }
                Err(e) => {
                    if attempts <= RETRY_MAX {
                        warn!(error = %e, attempt = attempts, "webhook request failed; retrying");
                        tokio::time::sleep(backoff(attempts)).await;
                        continue;
                    }
                    return Err(e.into());
                }
            }
        }
    }

    fn request_builder(
        &self,
        hmac_tag: Option<&str>,
    ) -> Result<reqwest::RequestBuilder, WebhookError> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        match self.config.compression() {
            CompressionAlgo::Gzip => {
                headers.insert(CONTENT_ENCODING, HeaderValue::from_static("gzip"));
            }
            CompressionAlgo::Zstd => {
                headers.insert(CONTENT_ENCODING, HeaderValue::from_static("zstd"));
            }
            CompressionAlgo::None => {}
        }

        let params = &self.config.authentication.parameters;
        let mut builder = self.client.post(&self.config.endpoint).headers(headers);
        builder = match self.config.auth_method() {
            AuthMethod::None => builder,
            AuthMethod::Basic => {
                let password = params.password_bytes().unwrap_or_default();
                builder.basic_auth(
                    &params.username,
                    Some(String::from_utf8_lossy(&password).into_owned()),
                )
            }
            AuthMethod::SharedSecret => {
                let secret = params.secret_key_bytes().unwrap_or_default();
                builder.header(
                    parse_header_name(&params.header_name)?,
                    HeaderValue::from_bytes(&secret)
                        .map_err(|e| WebhookError::Header(e.to_string()))?,
                )
            }
            // The configured bearer key is sent verbatim, unlike the other
            // schemes which send the decoded secret. Historic behavior;
            // receivers depend on it.
            AuthMethod::Bearer => builder.bearer_auth(&params.secret_key),
            AuthMethod::Hmac => builder.header(
                parse_header_name(&params.header_name)?,
                HeaderValue::from_str(hmac_tag.unwrap_or_default())
                    .map_err(|e| WebhookError::Header(e.to_string()))?,
            ),
        };

        Ok(builder)
    }
}

fn parse_header_name(name: &str) -> Result<HeaderName, WebhookError> {
    HeaderName::from_bytes(name.as_bytes()).map_err(|e| WebhookError::Header(e.to_string()))
}

fn backoff(attempt: u32) -> Duration {
    RETRY_BASE_DELAY * 2u32.saturating_pow(attempt.saturating_sub(1)).min(64)
}

fn hmac_hex(key: &[u8], plaintext: &[u8]) -> Result<String, WebhookError> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|e| WebhookError::Header(e.to_string()))?;
    mac.update(plaintext);
    Ok(HEXLOWER.encode(&mac.finalize().into_bytes()))
}

fn gzip_encode(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), flate2::Compression::fast());
    encoder.write_all(data)?;
    encoder.finish()
}

fn zstd_encode(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = zstd::stream::write::Encoder::new(Vec::new(), 1)?;
    encoder.write_all(data)?;
    encoder.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WebhookAuthentication;

    fn test_config(max_payload_bytes: usize) -> WebhookConfig {
        WebhookConfig {
            endpoint: "https://hooks.example.com/ingest".to_string(),
            max_payload_bytes,
            ..WebhookConfig::default()
        }
    }

    fn spawn_ingest(
        config: WebhookConfig,
        tuning: WebhookTuning,
    ) -> (
        mpsc::Sender<Vec<u8>>,
        mpsc::Receiver<Payload>,
        CancellationToken,
        JoinHandle<()>,
    ) {
        let (message_tx, message_rx) = mpsc::channel(MESSAGE_QUEUE_DEPTH);
        let (payload_tx, payload_rx) = mpsc::channel(PAYLOAD_QUEUE_DEPTH);
        let cancel = CancellationToken::new();
        let worker = IngestWorker::new(Arc::new(config), message_rx, payload_tx, tuning);
        let handle = tokio::spawn(worker.run(cancel.clone()));
        (message_tx, payload_rx, cancel, handle)
    }

    #[tokio::test]
    async fn test_inert_webhook_accepts_everything() {
        let webhook = Webhook::new(None, "sef/test").unwrap();
        for _ in 0..100 {
            webhook.send(b"{}".to_vec()).await.unwrap();
        }
        let handle = webhook.handle();
        handle.send(b"{}".to_vec()).await.unwrap();
        webhook.shutdown().await;
    }

    #[tokio::test]
    async fn test_empty_event_rejected() {
        let webhook = Webhook::new(Some(&test_config(1024 * 1024)), "sef/test").unwrap();
        assert!(matches!(
            webhook.send(Vec::new()).await,
            Err(WebhookError::EmptyPayload)
        ));
        webhook.shutdown().await;
    }

    #[tokio::test]
    async fn test_size_based_payload_formation() {
        // Cap of 40 bytes with 13-byte messages: three fit, the fourth
        // starts a new payload.
        let (tx, mut rx, cancel, handle) =
            spawn_ingest(test_config(40), WebhookTuning::default());

        let message = b"{\"foo\":\"bar\"}".to_vec();
        assert_eq!(message.len(), 13);
        for _ in 0..4 {
            tx.send(message.clone()).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        handle.await.unwrap();

        let mut payloads = Vec::new();
        while let Some(p) = rx.recv().await {
            payloads.push(p);
        }
        assert_eq!(payloads.len(), 2);
        assert_eq!(payloads[0].count, 3);
        assert_eq!(payloads[1].count, 1);
        for p in &payloads {
            assert!(p.bytes.len() <= 40);
        }
        let total: usize = payloads.iter().map(|p| p.bytes.len()).sum();
        assert_eq!(total, 4 * 13);
    }

    #[tokio::test]
    async fn test_oversize_message_ships_alone() {
        let (tx, mut rx, cancel, handle) =
            spawn_ingest(test_config(40), WebhookTuning::default());

        let oversize = vec![b'x'; 100];
        tx.send(oversize.clone()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        handle.await.unwrap();

        let payload = rx.recv().await.unwrap();
        assert_eq!(payload.bytes, oversize);
        assert_eq!(payload.count, 1);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_age_based_flush() {
        let tuning = WebhookTuning {
            max_payload_age: Duration::from_millis(5),
            sweep_interval: Duration::from_millis(25),
        };
        let (tx, mut rx, cancel, handle) = spawn_ingest(test_config(1024 * 1024), tuning);

        tx.send(b"{\"foo\":\"bar\"}".to_vec()).await.unwrap();
        let payload = tokio::time::timeout(Duration::from_millis(500), rx.recv())
            .await
            .expect("sweep should flush within one interval")
            .unwrap();
        assert_eq!(payload.bytes, b"{\"foo\":\"bar\"}");

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_cancel_drains_queued_messages() {
        let (tx, mut rx, cancel, handle) =
            spawn_ingest(test_config(1024 * 1024), WebhookTuning::default());

        for i in 0..50 {
            tx.send(format!("{{\"n\":{i}}}\n").into_bytes()).await.unwrap();
        }
        cancel.cancel();
        handle.await.unwrap();

        let mut total_events = 0;
        while let Some(p) = rx.recv().await {
            total_events += p.count;
        }
        assert_eq!(total_events, 50);
    }

    #[test]
    fn test_hmac_hex_matches_known_vector() {
        // HMAC-SHA-256("key", "The quick brown fox jumps over the lazy dog")
        let tag = hmac_hex(b"key", b"The quick brown fox jumps over the lazy dog").unwrap();
        assert_eq!(
            tag,
            "f7bc83f430538424b13298e6aa6fb143ef4d59a14946175997479dbc2d1a3cd8"
        );
    }

    #[test]
    fn test_gzip_round_trip() {
        let data = b"{\"foo\":\"bar\"}";
        let compressed = gzip_encode(data).unwrap();
        let mut decoder = flate2::read::GzDecoder::new(&compressed[..]);
        let mut out = Vec::new();
        std::io::Read::read_to_end(&mut decoder, &mut out).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn test_zstd_round_trip() {
        let data = b"{\"foo\":\"bar\"}";
        let compressed = zstd_encode(data).unwrap();
        let out = zstd::stream::decode_all(&compressed[..]).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn test_backoff_is_exponential() {
        assert_eq!(backoff(1), Duration::from_millis(500));
        assert_eq!(backoff(2), Duration::from_secs(1));
        assert_eq!(backoff(3), Duration::from_secs(2));
        assert!(backoff(10) <= Duration::from_secs(32));
    }

    #[tokio::test]
    async fn test_bearer_auth_uses_configured_key_verbatim() {
        let config = WebhookConfig {
            endpoint: "https://hooks.example.com/ingest".to_string(),
            max_payload_bytes: 1024 * 1024,
            authentication: WebhookAuthentication {
                method: "bearer".to_string(),
                parameters: crate::config::AuthParameters {
                    secret_key: "raw-token".to_string(),
                    ..crate::config::AuthParameters::default()
                },
            },
            ..WebhookConfig::default()
        };
        let mut config = config;
        config.prepare_and_validate().unwrap();

        let worker = SenderWorker {
            config: Arc::new(config),
            client: Client::new(),
            payload_rx: mpsc::channel(1).1,
        };
        let request = worker
            .request_builder(None)
            .unwrap()
            .body(Vec::new())
            .build()
            .unwrap();
        assert_eq!(
            request.headers().get("authorization").unwrap(),
            "Bearer raw-token"
        );
    }
}
