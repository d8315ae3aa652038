// Copyright 2022-Present Spyderbat, Inc. https://www.spyderbat.com/
// SPDX-License-Identifier: Apache-2.0

//! Webhook destination configuration.
//!
//! Validation normalizes the compression and authentication selectors to
//! lowercase, enforces the payload size bounds, and checks that every
//! base64-encoded secret actually decodes, so the dispatcher never has to
//! re-validate at send time.

use data_encoding::BASE64;
use serde::Deserialize;

use super::ConfigError;

/// Default batch payload cap: 1 MiB.
pub const DEFAULT_MAX_PAYLOAD_BYTES: usize = 1024 * 1024;
/// Smallest accepted payload cap: 32 KiB.
pub const MIN_MAX_PAYLOAD_BYTES: usize = 32 * 1024;
/// Largest accepted payload cap: 10 MiB.
pub const MAX_MAX_PAYLOAD_BYTES: usize = 10 * 1024 * 1024;

/// Payload compression, fixed at config load.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CompressionAlgo {
    #[default]
    None,
    Gzip,
    Zstd,
}

/// Authentication scheme, fixed at config load.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AuthMethod {
    #[default]
    None,
    Basic,
    Hmac,
    Bearer,
    SharedSecret,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct WebhookConfig {
    /// Destination URL; must be `https://`.
    #[serde(rename = "endpoint_url")]
    pub endpoint: String,

    /// Skip TLS certificate verification.
    pub insecure: bool,

    /// `gzip`, `zstd`, `none`, or empty (case-insensitive).
    pub compression_algo: String,

    /// Maximum request body size before compression. Zero means default.
    pub max_payload_bytes: usize,

    pub authentication: WebhookAuthentication,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct WebhookAuthentication {
    /// `none`, `basic`, `hmac`, `bearer`, or `shared_secret`
    /// (case-insensitive; empty means none).
    pub method: String,
    pub parameters: AuthParameters,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AuthParameters {
    /// Header carrying the hmac or shared secret.
    pub header_name: String,
    /// Base64-encoded secret (hmac, shared_secret). For bearer auth the
    /// configured string is sent verbatim, preserving historic behavior.
    pub secret_key: String,
    /// `sha256` is the only supported algorithm.
    #[serde(rename = "hash_algo")]
    pub hash_algorithm: String,
    pub username: String,
    /// Base64-encoded password for basic auth.
    pub password: String,
}

impl AuthParameters {
    /// Decoded secret key, or `None` when the value is not valid base64.
    #[must_use]
    pub fn secret_key_bytes(&self) -> Option<Vec<u8>> {
        BASE64.decode(self.secret_key.as_bytes()).ok()
    }

    /// Decoded password, or `None` when the value is not valid base64.
    #[must_use]
    pub fn password_bytes(&self) -> Option<Vec<u8>> {
        BASE64.decode(self.password.as_bytes()).ok()
    }
}

impl WebhookConfig {
    /// Compression selected by the config. Values are checked at load
    /// time; an unvalidated unknown value reads as no compression.
    #[must_use]
    pub fn compression(&self) -> CompressionAlgo {
        match self.compression_algo.to_lowercase().as_str() {
            "gzip" => CompressionAlgo::Gzip,
            "zstd" => CompressionAlgo::Zstd,
            _ => CompressionAlgo::None,
        }
    }

    /// Authentication method selected by the config. Values are checked at
    /// load time; an unvalidated unknown value reads as no auth.
    #[must_use]
    pub fn auth_method(&self) -> AuthMethod {
        match self.authentication.method.to_lowercase().as_str() {
            "basic" => AuthMethod::Basic,
            "hmac" => AuthMethod::Hmac,
            "bearer" => AuthMethod::Bearer,
            "shared_secret" => AuthMethod::SharedSecret,
            _ => AuthMethod::None,
        }
    }

    /// Normalizes and validates the webhook block.
    pub fn prepare_and_validate(&mut self) -> Result<(), ConfigError> {
        if self.max_payload_bytes == 0 {
            self.max_payload_bytes = DEFAULT_MAX_PAYLOAD_BYTES;
        }
        if self.max_payload_bytes > MAX_MAX_PAYLOAD_BYTES {
            return Err(ConfigError::Webhook(format!(
                "webhook.max_payload_bytes cannot be greater than {MAX_MAX_PAYLOAD_BYTES}"
            )));
        }
        if self.max_payload_bytes < MIN_MAX_PAYLOAD_BYTES {
            return Err(ConfigError::Webhook(format!(
                "webhook.max_payload_bytes cannot be less than {MIN_MAX_PAYLOAD_BYTES}"
            )));
        }

        if self.endpoint.is_empty() {
            return Err(ConfigError::Webhook(
                "webhook.endpoint_url is required".to_string(),
            ));
        }
        let url = reqwest::Url::parse(&self.endpoint).map_err(|e| {
            ConfigError::Webhook(format!("failed to parse webhook.endpoint_url: {e}"))
        })?;
        if url.scheme() != "https" {
            return Err(ConfigError::Webhook(
                "webhook.endpoint_url must use https scheme".to_string(),
            ));
        }
        if url.host_str().unwrap_or_default().is_empty() {
            return Err(ConfigError::Webhook(
                "webhook.endpoint_url must include a hostname".to_string(),
            ));
        }

        self.compression_algo = self.compression_algo.to_lowercase();
        match self.compression_algo.as_str() {
            "gzip" | "zstd" | "none" => {}
            "" => self.compression_algo = "none".to_string(),
            other => {
                return Err(ConfigError::Webhook(format!(
                    "unsupported compression algorithm '{other}'"
                )))
            }
        }

        self.authentication.method = self.authentication.method.to_lowercase();
        let params = &mut self.authentication.parameters;
        match self.authentication.method.as_str() {
            "" | "none" => {}
            "basic" => {
                if params.username.is_empty() {
                    return Err(ConfigError::Webhook(
                        "webhook.authentication.username is required for basic auth".to_string(),
                    ));
                }
                if params.password.is_empty() {
                    return Err(ConfigError::Webhook(
                        "webhook.authentication.password is required for basic auth".to_string(),
                    ));
                }
                if params.password_bytes().is_none() {
                    return Err(ConfigError::Webhook(
                        "webhook.authentication.password must be base64 encoded".to_string(),
                    ));
                }
            }
            "hmac" => {
                if params.header_name.is_empty() {
                    return Err(ConfigError::Webhook(
                        "webhook.authentication.header_name is required for hmac auth".to_string(),
                    ));
                }
                if params.secret_key.is_empty() {
                    return Err(ConfigError::Webhook(
                        "webhook.authentication.secret_key is required for hmac auth".to_string(),
                    ));
                }
                if params.secret_key_bytes().is_none() {
                    return Err(ConfigError::Webhook(
                        "webhook.authentication.secret_key must be base64 encoded".to_string(),
                    ));
                }
                params.hash_algorithm = params.hash_algorithm.to_lowercase();
                if params.hash_algorithm != "sha256" {
                    return Err(ConfigError::Webhook(format!(
                        "unsupported hash algorithm '{}'",
                        params.hash_algorithm
                    )));
                }
            }
            "bearer" => {
                if params.secret_key.is_empty() {
                    return Err(ConfigError::Webhook(
                        "webhook.authentication.secret_key is required for bearer auth"
                            .to_string(),
                    ));
                }
            }
            "shared_secret" => {
                if params.secret_key.is_empty() {
                    return Err(ConfigError::Webhook(
                        "webhook.authentication.secret_key is required for shared secret auth"
                            .to_string(),
                    ));
                }
                if params.secret_key_bytes().is_none() {
                    return Err(ConfigError::Webhook(
                        "webhook.authentication.secret_key must be base64 encoded".to_string(),
                    ));
                }
                if params.header_name.is_empty() {
                    return Err(ConfigError::Webhook(
                        "webhook.authentication.header_name is required for shared secret auth"
                            .to_string(),
                    ));
                }
            }
            other => {
                return Err(ConfigError::Webhook(format!(
                    "unsupported authentication method '{other}'"
                )))
            }
        };

        Ok(())
    }
}
