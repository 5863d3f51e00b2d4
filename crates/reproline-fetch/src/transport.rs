//! Shared blocking HTTP transport.
//!
//! One lazily-built reqwest client and one tokio runtime serve the whole
//! process; workers are plain threads that block on the async call. Page
//! fetchers are free to ignore this module and speak their own protocol;
//! it exists so typical JSON-over-HTTP sources do not each rebuild the
//! same plumbing.

use std::sync::LazyLock;
use std::time::Duration;

use log::debug;

use crate::error::FetchError;

static SHARED_CLIENT: LazyLock<reqwest::Client> = LazyLock::new(|| {
    reqwest::Client::builder()
        .user_agent(concat!("reproline/", env!("CARGO_PKG_VERSION")))
        .build()
        .expect("failed to build HTTP client")
});

static SHARED_RUNTIME: LazyLock<tokio::runtime::Runtime> = LazyLock::new(|| {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("failed to build tokio runtime")
});

pub fn http_client() -> &'static reqwest::Client {
    &SHARED_CLIENT
}

/// Blocking JSON GET with a hard deadline covering connect, transfer, and
/// decode. Non-success statuses become [`FetchError::Http`], with any
/// `Retry-After` hint preserved for the retry policy.
pub fn get_json(
    url: &str,
    headers: &[(&str, String)],
    deadline: Duration,
) -> Result<serde_json::Value, FetchError> {
    debug!("GET {url}");
    SHARED_RUNTIME.block_on(async {
        match tokio::time::timeout(deadline, get_json_inner(url, headers)).await {
            Ok(result) => result,
            Err(_) => Err(FetchError::Timeout(deadline)),
        }
    })
}

async fn get_json_inner(
    url: &str,
    headers: &[(&str, String)],
) -> Result<serde_json::Value, FetchError> {
    let mut request = SHARED_CLIENT.get(url);
    for (name, value) in headers {
        request = request.header(*name, value);
    }
    let response = request
        .send()
        .await
        .map_err(|e| FetchError::from_reqwest(&e))?;
    let status = response.status();
    if !status.is_success() {
        let retry_after = parse_retry_after(response.headers());
        return Err(FetchError::Http {
            status: Some(status.as_u16()),
            message: status
                .canonical_reason()
                .unwrap_or("unexpected status")
                .to_string(),
            retry_after,
        });
    }
    let body = response
        .text()
        .await
        .map_err(|e| FetchError::from_reqwest(&e))?;
    serde_json::from_str(&body).map_err(|e| FetchError::Malformed(e.to_string()))
}

/// Delta-seconds form only; the HTTP-date form is rare enough upstream
/// that it falls back to the computed backoff.
fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    headers
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::{HeaderMap, HeaderValue, RETRY_AFTER};

    #[test]
    fn parses_delta_seconds() {
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from_static("7"));
        assert_eq!(parse_retry_after(&headers), Some(Duration::from_secs(7)));
    }

    #[test]
    fn ignores_http_date_and_garbage() {
        let mut headers = HeaderMap::new();
        headers.insert(
            RETRY_AFTER,
            HeaderValue::from_static("Wed, 21 Oct 2026 07:28:00 GMT"),
        );
        assert_eq!(parse_retry_after(&headers), None);

        headers.insert(RETRY_AFTER, HeaderValue::from_static("soon"));
        assert_eq!(parse_retry_after(&headers), None);

        assert_eq!(parse_retry_after(&HeaderMap::new()), None);
    }
}
