//! Shared plumbing for outbound HTTP providers (AI model, mail relay):
//! error type, environment URL parsing and retry with exponential backoff.
//!
//! Retries only on transient transport errors (connection failures,
//! timeouts). Non-success responses and deserialization failures are
//! returned immediately.

use std::time::Duration;

use thiserror::Error;
use url::Url;

use crate::error::AppError;

/// Maximum number of retry attempts after the initial request.
const MAX_RETRIES: u32 = 3;

/// Base delay between retries (doubles each attempt: 200ms, 400ms, 800ms).
const BASE_DELAY_MS: u64 = 200;

/// Provider configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} environment variable is required")]
    Missing(&'static str),
    #[error("invalid URL for {0}: {1}")]
    InvalidUrl(&'static str, String),
}

/// Errors talking to an external provider.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("HTTP error calling {endpoint}: {source}")]
    Http {
        endpoint: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{endpoint} returned {status}: {body}")]
    ApiError {
        endpoint: String,
        status: u16,
        body: String,
    },
    #[error("failed to decode response from {endpoint}: {source}")]
    Deserialization {
        endpoint: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("unexpected response from {endpoint}: {reason}")]
    Protocol { endpoint: String, reason: String },
}

impl From<ProviderError> for AppError {
    fn from(err: ProviderError) -> Self {
        Self::Upstream(err.to_string())
    }
}

/// Read a required URL from the environment.
pub fn env_url(var: &'static str) -> Result<Url, ConfigError> {
    let raw = std::env::var(var)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .ok_or(ConfigError::Missing(var))?;
    Url::parse(raw.trim()).map_err(|e| ConfigError::InvalidUrl(var, e.to_string()))
}

/// Send an HTTP request with exponential backoff retry on transport errors.
///
/// The closure `f` is called up to `MAX_RETRIES + 1` times. The caller is
/// responsible for inspecting the response status code.
pub(crate) async fn retry_send<F, Fut>(f: F) -> Result<reqwest::Response, reqwest::Error>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<reqwest::Response, reqwest::Error>>,
{
    for attempt in 0..MAX_RETRIES {
        match f().await {
            Ok(resp) => return Ok(resp),
            Err(e) => {
                let delay = Duration::from_millis(BASE_DELAY_MS * 2u64.pow(attempt));
                tracing::warn!(
                    attempt = attempt + 1,
                    max_retries = MAX_RETRIES,
                    "provider request failed, retrying in {delay:?}: {e}"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
    f().await
}

/// Turn a non-success response into [`ProviderError::ApiError`].
pub(crate) async fn ensure_success(
    endpoint: &str,
    resp: reqwest::Response,
) -> Result<reqwest::Response, ProviderError> {
    if resp.status().is_success() {
        return Ok(resp);
    }
    let status = resp.status().as_u16();
    let body = resp.text().await.unwrap_or_default();
    Err(ProviderError::ApiError {
        endpoint: endpoint.to_string(),
        status,
        body,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn retry_exhausts_all_attempts_on_transport_failure() {
        let call_count = Arc::new(AtomicU32::new(0));
        let cc = call_count.clone();

        let result = retry_send(|| {
            let cc = cc.clone();
            async move {
                cc.fetch_add(1, Ordering::SeqCst);
                reqwest::Client::builder()
                    .timeout(Duration::from_millis(50))
                    .build()
                    .unwrap()
                    .get("http://127.0.0.1:1/")
                    .send()
                    .await
            }
        })
        .await;

        assert!(result.is_err(), "request to closed port must fail");
        assert_eq!(call_count.load(Ordering::SeqCst), MAX_RETRIES + 1);
    }

    #[test]
    fn missing_url_is_reported() {
        let err = env_url("NUTRI_TEST_UNSET_URL_VAR").unwrap_err();
        assert!(matches!(err, ConfigError::Missing("NUTRI_TEST_UNSET_URL_VAR")));
    }

    #[test]
    fn provider_errors_map_to_upstream() {
        let err = AppError::from(ProviderError::ApiError {
            endpoint: "chat".into(),
            status: 500,
            body: "boom".into(),
        });
        assert!(matches!(err, AppError::Upstream(_)));
    }
}
