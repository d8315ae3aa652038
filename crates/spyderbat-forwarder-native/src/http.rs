// Copyright 2022-Present Spyderbat, Inc. https://www.spyderbat.com/
// SPDX-License-Identifier: Apache-2.0

//! Shared HTTP client construction.
//!
//! Both the upstream API client and the webhook dispatcher use reqwest
//! clients built here: identical timeouts and keep-alive behavior, the
//! forwarder's `User-Agent` applied to every request, proxy settings taken
//! from the standard environment variables, and transparent response
//! decompression. The webhook variant additionally supports disabling TLS
//! certificate verification for endpoints with private CAs.

use std::time::Duration;

use reqwest::Client;

/// Total per-request budget, including body transfer.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);
/// TCP connect budget.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

const TCP_KEEPALIVE: Duration = Duration::from_secs(30);

/// Client for the upstream event API.
pub fn api_client(user_agent: &str) -> reqwest::Result<Client> {
    builder(user_agent).build()
}

/// Client for the downstream webhook. `insecure` skips certificate
/// verification.
pub fn webhook_client(user_agent: &str, insecure: bool) -> reqwest::Result<Client> {
    builder(user_agent)
        .danger_accept_invalid_certs(insecure)
        .build()
}

fn builder(user_agent: &str) -> reqwest::ClientBuilder {
    // Proxy discovery from HTTP_PROXY / HTTPS_PROXY / NO_PROXY is
    // reqwest's default behavior and is left enabled.
    Client::builder()
        .user_agent(user_agent)
        .timeout(REQUEST_TIMEOUT)
        .connect_timeout(CONNECT_TIMEOUT)
        .tcp_keepalive(TCP_KEEPALIVE)
}
