use chrono::{DateTime, Utc};
use reqwest::{Client, Response, StatusCode};
use std::time::Duration;

use crate::ProviderError;

pub(crate) fn build_client() -> Result<Client, ProviderError> {
    // Every call is bounded; a stalled API fails the call instead of hanging the run.
    Client::builder()
        .connect_timeout(Duration::from_secs(5))
        .timeout(Duration::from_secs(30))
        .build()
        .map_err(ProviderError::Transport)
}

pub(crate) fn base_url(endpoint: &str) -> String {
    endpoint.trim().trim_end_matches('/').to_string()
}

/// Pass successful responses through; log and classify everything else.
pub(crate) async fn expect_success<F>(
    label: &str,
    method: &str,
    url: &str,
    resp: Response,
    classify: F,
) -> Result<Response, ProviderError>
where
    F: FnOnce(StatusCode, String) -> ProviderError,
{
    let status = resp.status();
    if status.is_success() {
        tracing::debug!("✅ [{}] {} {} succeeded: status={}", label, method, url, status.as_u16());
        return Ok(resp);
    }
    let text = resp.text().await.unwrap_or_default();
    tracing::error!(
        "❌ [{}] {} {} failed: status={}, response={}",
        label,
        method,
        url,
        status.as_u16(),
        text
    );
    Err(classify(status, text))
}

/// Fallback mapping by HTTP status, used once a backend's own error codes
/// did not match.
pub(crate) fn classify_status(provider: &'static str, status: StatusCode, body: String) -> ProviderError {
    match status.as_u16() {
        401 | 403 => ProviderError::AuthenticationFailed(body),
        404 => ProviderError::NotFound(body),
        400 | 422 => ProviderError::InvalidSpec(body),
        429 | 500..=599 => ProviderError::Unavailable(format!(
            "{} status={} body={}",
            provider,
            status.as_u16(),
            body
        )),
        code => ProviderError::Api {
            provider,
            status: code,
            body,
        },
    }
}

/// Provider timestamp, or the observation time when absent or unparsable.
pub(crate) fn parse_timestamp(raw: Option<&str>) -> DateTime<Utc> {
    raw.and_then(|s| DateTime::parse_from_rfc3339(s.trim()).ok())
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(Utc::now)
}

pub(crate) fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}
