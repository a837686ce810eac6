//! HTTP plumbing shared by the REST adapters.

use std::time::Duration;

use reqwest::{Client, RequestBuilder, Response, StatusCode, header::HeaderMap};
use serde::de::DeserializeOwned;
use tracing::{error, warn};

use super::retry::RetryPolicy;
use super::trait_::PlatformError;
use crate::models::connection::Provider;

const USER_AGENT: &str = "playlist-sync/0.1";

/// Builds the client every adapter shares, with the per-call timeout applied.
pub fn build_client(timeout: Duration) -> Result<Client, reqwest::Error> {
    Client::builder()
        .timeout(timeout)
        .user_agent(USER_AGENT)
        .build()
}

/// Maps a transport failure onto the adapter taxonomy.
pub(crate) fn transport_error(provider: Provider, err: reqwest::Error) -> PlatformError {
    if err.is_timeout() {
        warn!(provider = %provider, "request timed out");
        PlatformError::Timeout { provider }
    } else if err.is_decode() {
        PlatformError::MalformedResponse {
            provider,
            message: err.to_string(),
        }
    } else {
        PlatformError::Transient {
            provider,
            message: err.to_string(),
        }
    }
}

/// Reads an integer `Retry-After` header.
pub(crate) fn retry_after_secs(headers: &HeaderMap) -> Option<u64> {
    headers
        .get("Retry-After")
        .and_then(|h| h.to_str().ok())
        .and_then(|s| s.trim().parse::<u64>().ok())
}

/// Passes successful responses through and classifies the rest.
///
/// `resource` names what was requested so `NotFound` errors say which
/// playlist or track went missing.
pub(crate) async fn check_status(
    provider: Provider,
    response: Response,
    resource: &str,
    default_retry_after_secs: u64,
) -> Result<Response, PlatformError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    if status == StatusCode::TOO_MANY_REQUESTS {
        let retry_after =
            retry_after_secs(response.headers()).unwrap_or(default_retry_after_secs);
        warn!(
            provider = %provider,
            retry_after_secs = retry_after,
            "rate limited by provider"
        );
        return Err(PlatformError::RateLimited {
            provider,
            retry_after_secs: retry_after,
        });
    }

    let body = response.text().await.unwrap_or_default();

    // Google reports quota exhaustion as 403 with a reason in the body
    if provider == Provider::Youtube
        && status == StatusCode::FORBIDDEN
        && (body.contains("quotaExceeded") || body.contains("rateLimitExceeded"))
    {
        warn!(provider = %provider, "quota exhausted");
        return Err(PlatformError::RateLimited {
            provider,
            retry_after_secs: default_retry_after_secs,
        });
    }

    Err(classify_failure(provider, status, body, resource))
}

pub(crate) fn classify_failure(
    provider: Provider,
    status: StatusCode,
    body: String,
    resource: &str,
) -> PlatformError {
    match status.as_u16() {
        401 => {
            error!(provider = %provider, "provider rejected access token");
            PlatformError::Auth {
                provider,
                message: truncate(&body),
            }
        }
        404 => PlatformError::NotFound {
            provider,
            resource: resource.to_string(),
        },
        408 => PlatformError::Timeout { provider },
        500..=599 => {
            warn!(provider = %provider, status = status.as_u16(), "provider server error");
            PlatformError::Transient {
                provider,
                message: format!("server error {}: {}", status, truncate(&body)),
            }
        }
        code => PlatformError::Permanent {
            provider,
            status: code,
            message: truncate(&body),
        },
    }
}

/// Decodes a JSON body, reporting shape mismatches as malformed responses.
pub(crate) async fn read_json<T: DeserializeOwned>(
    provider: Provider,
    response: Response,
) -> Result<T, PlatformError> {
    let bytes = response
        .bytes()
        .await
        .map_err(|e| transport_error(provider, e))?;
    serde_json::from_slice(&bytes).map_err(|e| PlatformError::MalformedResponse {
        provider,
        message: e.to_string(),
    })
}

/// A provider's HTTP client together with its retry policy.
#[derive(Debug, Clone)]
pub struct ApiClient {
    provider: Provider,
    http: Client,
    retry: RetryPolicy,
}

impl ApiClient {
    pub fn new(provider: Provider, http: Client, retry: RetryPolicy) -> Self {
        Self {
            provider,
            http,
            retry,
        }
    }

    pub(crate) fn http(&self) -> &Client {
        &self.http
    }

    pub(crate) fn retry(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Sends one request without retrying and decodes the JSON body.
    pub(crate) async fn send_once<T: DeserializeOwned>(
        &self,
        resource: &str,
        request: RequestBuilder,
    ) -> Result<T, PlatformError> {
        let response = self.dispatch(resource, request).await?;
        read_json(self.provider, response).await
    }

    /// Sends a request built by `build`, retrying per policy, and decodes
    /// the JSON body.
    pub(crate) async fn json<T, B>(
        &self,
        operation: &'static str,
        resource: &str,
        build: B,
    ) -> Result<T, PlatformError>
    where
        T: DeserializeOwned,
        B: Fn(&Client) -> RequestBuilder,
    {
        self.retry
            .run(operation, || {
                let request = build(&self.http);
                async move { self.send_once(resource, request).await }
            })
            .await
    }

    /// Like [`ApiClient::json`] for endpoints whose body is ignored.
    pub(crate) async fn execute<B>(
        &self,
        operation: &'static str,
        resource: &str,
        build: B,
    ) -> Result<(), PlatformError>
    where
        B: Fn(&Client) -> RequestBuilder,
    {
        self.retry
            .run(operation, || {
                let request = build(&self.http);
                async move { self.dispatch(resource, request).await.map(|_| ()) }
            })
            .await
    }

    async fn dispatch(
        &self,
        resource: &str,
        request: RequestBuilder,
    ) -> Result<Response, PlatformError> {
        let response = request
            .send()
            .await
            .map_err(|e| transport_error(self.provider, e))?;
        check_status(
            self.provider,
            response,
            resource,
            self.retry.default_retry_after_secs(),
        )
        .await
    }
}

fn truncate(body: &str) -> String {
    const MAX: usize = 512;
    if body.len() <= MAX {
        return body.to_string();
    }
    let mut end = MAX;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &body[..end])
}
