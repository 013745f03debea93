// HTTP access for manifests, fragments and keys, behind a trait so the
// pipeline can be driven by mock sources in tests.

use crate::config::RetryPolicy;
use crate::error::CollectorError;
use crate::events::TrackKind;
use async_trait::async_trait;
use bytes::Bytes;
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// A `<length>[@<offset>]` byte range attached to a fragment. An absent
/// offset means zero, continuing the original collector's behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ByteRange {
    pub length: u64,
    pub offset: u64,
}

impl ByteRange {
    /// HTTP `Range` header value for this span.
    pub fn to_http_range(self) -> String {
        format!("bytes={}-{}", self.offset, self.offset + self.length - 1)
    }
}

#[derive(Debug, Clone)]
pub struct FetchedFile {
    pub body: Bytes,
    /// Final URL after redirects; relative fragment URIs resolve against it.
    pub effective_url: String,
    pub status: u16,
}

/// External HTTP client contract: fetch a URL with an optional byte range
/// and report body, effective URL and status.
#[async_trait]
pub trait FragmentSource: Send + Sync {
    async fn get_file(
        &self,
        url: &str,
        byte_range: Option<ByteRange>,
        track: TrackKind,
        is_manifest: bool,
        token: &CancellationToken,
    ) -> Result<FetchedFile, CollectorError>;
}

pub struct HttpFragmentSource {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpFragmentSource {
    pub fn new(client: reqwest::Client, timeout: Duration) -> Self {
        Self { client, timeout }
    }
}

#[async_trait]
impl FragmentSource for HttpFragmentSource {
    async fn get_file(
        &self,
        url: &str,
        byte_range: Option<ByteRange>,
        _track: TrackKind,
        _is_manifest: bool,
        token: &CancellationToken,
    ) -> Result<FetchedFile, CollectorError> {
        let mut request = self.client.get(url).timeout(self.timeout);
        if let Some(range) = byte_range {
            request = request.header(reqwest::header::RANGE, range.to_http_range());
        }

        let response = tokio::select! {
            _ = token.cancelled() => return Err(CollectorError::Cancelled),
            response = request.send() => response?,
        };

        let status = response.status();
        let effective_url = response.url().to_string();
        if !status.is_success() {
            return Err(CollectorError::HttpStatus {
                status,
                url: url.to_string(),
            });
        }

        let body = tokio::select! {
            _ = token.cancelled() => return Err(CollectorError::Cancelled),
            body = response.bytes() => body?,
        };

        Ok(FetchedFile {
            body,
            effective_url,
            status: status.as_u16(),
        })
    }
}

impl RetryPolicy {
    /// Delay before retry `attempt` (0-indexed), capped at `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let multiplier = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        let exp_delay = self
            .base_delay
            .checked_mul(multiplier)
            .unwrap_or(self.max_delay);
        let capped = exp_delay.min(self.max_delay);

        if !self.jitter {
            return capped;
        }
        let jitter_range_ms = u64::try_from(self.base_delay.as_millis()).unwrap_or(u64::MAX) / 2;
        let remaining_ms =
            u64::try_from(self.max_delay.saturating_sub(capped).as_millis()).unwrap_or(0);
        let jitter_limit_ms = jitter_range_ms.min(remaining_ms);
        if jitter_limit_ms == 0 {
            return capped;
        }
        let jitter_ms = rand::rng().random_range(0..jitter_limit_ms);
        (capped + Duration::from_millis(jitter_ms)).min(self.max_delay)
    }
}

/// Result of a single download attempt.
pub enum RetryAction<T> {
    Success(T),
    /// Retryable failure (404 during manifest retry, 5xx, timeout).
    Retry(CollectorError),
    /// Permanent failure.
    Fail(CollectorError),
}

/// Run `operation` until success, a permanent failure, exhaustion of the
/// policy, or cancellation. The closure receives the attempt number and
/// decides retryability per attempt.
pub async fn retry_with_backoff<F, Fut, T>(
    policy: &RetryPolicy,
    token: &CancellationToken,
    operation: F,
) -> Result<T, CollectorError>
where
    F: Fn(u32) -> Fut,
    Fut: Future<Output = RetryAction<T>>,
{
    for attempt in 0..=policy.max_retries {
        if token.is_cancelled() {
            return Err(CollectorError::Cancelled);
        }
        match operation(attempt).await {
            RetryAction::Success(value) => return Ok(value),
            RetryAction::Fail(err) => return Err(err),
            RetryAction::Retry(err) => {
                if attempt >= policy.max_retries {
                    return Err(err);
                }
                let delay = policy.delay_for_attempt(attempt);
                warn!(
                    attempt = attempt + 1,
                    max = policy.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "retrying download after failure"
                );
                tokio::select! {
                    _ = token.cancelled() => return Err(CollectorError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
    Err(CollectorError::Internal {
        reason: "retry loop exited without result".to_string(),
    })
}

/// Resolve a possibly-relative fragment URI against the playlist's
/// effective URL.
pub fn resolve_url(base: &str, uri: &str) -> Result<String, CollectorError> {
    if uri.starts_with("http://") || uri.starts_with("https://") {
        return Ok(uri.to_string());
    }
    let base = url::Url::parse(base).map_err(|e| CollectorError::Playlist {
        reason: format!("invalid base URL {base}: {e}"),
    })?;
    let joined = base.join(uri).map_err(|e| CollectorError::Playlist {
        reason: format!("could not join {uri} against {base}: {e}"),
    })?;
    Ok(joined.to_string())
}
