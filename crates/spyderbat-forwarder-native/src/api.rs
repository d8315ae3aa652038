// Copyright 2022-Present Spyderbat, Inc. https://www.spyderbat.com/
// SPDX-License-Identifier: Apache-2.0

//! Client for the Spyderbat event-source API.
//!
//! Three operations against `https://{api_host}/api/v1/org/{org_uid}`:
//!
//! - [`EventsApi::validate_reachability`]: unauthenticated probe; the
//!   server attaches an `X-Context-Uid` header to every response it
//!   produces, so its presence proves reachability regardless of status.
//! - [`EventsApi::fetch_sources`]: authenticated source list.
//! - [`EventsApi::load_events`]: authenticated NDJSON event page anchored
//!   on an opaque server-issued iterator.
//!
//! Failures carry the server's diagnostic headers (support context id, JWT
//! expiration, server time) so operators can correlate with Spyderbat
//! support.

use reqwest::header::HeaderMap;
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use thiserror::Error;

use crate::config::Config;
use crate::sources::Source;

const URL_BASE: &str = "/api/v1/org/";

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error("{0}")]
    Api(ApiDiagnostic),
}

/// Diagnostic details extracted from an API response.
#[derive(Debug, Default)]
pub struct ApiDiagnostic {
    pub status: Option<StatusCode>,
    pub context_uid: String,
    pub jwt_expiration: String,
    pub server_time: String,
    pub server: String,
}

impl ApiDiagnostic {
    fn from_response(resp: &Response) -> Self {
        let headers = resp.headers();
        ApiDiagnostic {
            status: Some(resp.status()),
            context_uid: header_value(headers, "x-context-uid"),
            jwt_expiration: header_value(headers, "x-jwt-expiration"),
            server_time: header_value(headers, "x-server-time"),
            server: header_value(headers, "server"),
        }
    }
}

impl std::fmt::Display for ApiDiagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.status {
            Some(status) => write!(f, "{status}")?,
            None => write!(f, "no response")?,
        }
        if !self.context_uid.is_empty() {
            write!(f, "; spyderbat support id {}", self.context_uid)?;
        }
        if !self.jwt_expiration.is_empty() {
            write!(f, "; expiration {}", self.jwt_expiration)?;
        }
        if !self.server_time.is_empty() {
            write!(f, "; server time {}", self.server_time)?;
        }
        if matches!(
            self.status,
            Some(StatusCode::FORBIDDEN | StatusCode::UNAUTHORIZED)
        ) {
            write!(f, "; check your host clock, your org uid, and your api key")?;
        }
        if !self.server.is_empty() {
            write!(f, "; server {}", self.server)?;
        }
        Ok(())
    }
}

// reqwest stores header names lowercased, so lookups here are inherently
// case-insensitive even though the upstream server does not canonicalize
// the names it sends.
fn header_value(headers: &HeaderMap, name: &str) -> String {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct IteratorEnvelope {
    iterator: String,
}

/// Spyderbat event-source API client for one organization.
#[derive(Debug, Clone)]
pub struct EventsApi {
    client: Client,
    base_url: String,
    api_key: String,
}

impl EventsApi {
    /// Builds a client for the configured organization.
    pub fn new(config: &Config, user_agent: &str) -> reqwest::Result<Self> {
        Self::with_base_url(
            format!("https://{}{}{}", config.api_host, URL_BASE, config.org_uid),
            config.api_key.clone(),
            user_agent,
        )
    }

    /// Builds a client against an explicit base URL of the form
    /// `{scheme}://{host}/api/v1/org/{org_uid}`. Used by tests to point at
    /// a local server.
    pub fn with_base_url(
        base_url: String,
        api_key: String,
        user_agent: &str,
    ) -> reqwest::Result<Self> {
        Ok(EventsApi {
            client: crate::http::api_client(user_agent)?,
            base_url,
            api_key,
        })
    }

    /// Probes the API. Succeeds when the response carries a non-empty
    /// `X-Context-Uid` header; everything else becomes a diagnostic error.
    pub async fn validate_reachability(&self) -> Result<(), ApiError> {
        let resp = self
            .client
            .get(&self.base_url)
            .header("Accept", "application/json")
            .send()
            .await?;

        let diagnostic = ApiDiagnostic::from_response(&resp);
        if diagnostic.context_uid.is_empty() {
            return Err(ApiError::Api(diagnostic));
        }
        Ok(())
    }

    /// Fetches all sources for the organization.
    pub async fn fetch_sources(&self) -> Result<Vec<Source>, ApiError> {
        let resp = self
            .client
            .get(format!("{}/source/", self.base_url))
            .bearer_auth(&self.api_key)
            .header("Accept", "application/json")
            .send()
            .await?;

        if resp.status() != StatusCode::OK {
            return Err(ApiError::Api(ApiDiagnostic::from_response(&resp)));
        }

        Ok(resp.json().await?)
    }

    /// Fetches one page of events anchored on `iterator`.
    ///
    /// Record lines are appended verbatim to `out`, each followed by a
    /// newline. Returns the record count and the next iterator; when the
    /// stream carried no iterator envelope, the caller's iterator is
    /// returned unchanged.
    pub async fn load_events(
        &self,
        iterator: &str,
        limit: usize,
        out: &mut Vec<u8>,
    ) -> Result<(usize, String), ApiError> {
        let mut url = format!("{}/events/{}", self.base_url, iterator);
        if limit > 0 {
            url.push_str(&format!("?limit={limit}"));
        }

        let resp = self
            .client
            .get(url)
            .bearer_auth(&self.api_key)
            .header("Accept", "application/x-ndjson, application/ndjson")
            .send()
            .await?;

        if resp.status() != StatusCode::OK {
            return Err(ApiError::Api(ApiDiagnostic::from_response(&resp)));
        }

        let body = resp.bytes().await?;
        let (records, next) = scan_events(&body, out);
        Ok((records, next.unwrap_or_else(|| iterator.to_string())))
    }
}

// Splits an NDJSON body into iterator envelopes and record lines. Envelope
// lines look like `{"iterator":"…"}`; anything else is a record and is
// copied to `out` with a trailing newline.
fn scan_events(body: &[u8], out: &mut Vec<u8>) -> (usize, Option<String>) {
    let mut records = 0;
    let mut next_iterator = None;

    for line in body.split(|&b| b == b'\n') {
        if line.is_empty() {
            continue;
        }
        let envelope = serde_json::from_slice::<IteratorEnvelope>(line)
            .ok()
            .filter(|e| !e.iterator.is_empty());
        match envelope {
            Some(envelope) => next_iterator = Some(envelope.iterator),
            None => {
                records += 1;
                out.extend_from_slice(line);
                out.push(b'\n');
            }
        }
    }

    (records, next_iterator)
}
