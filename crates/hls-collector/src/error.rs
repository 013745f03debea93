use reqwest::StatusCode;

/// Top-level error type for the fragment collection pipeline.
///
/// Fatal variants terminate the session; the recoverable ones
/// (`TransientNetworkDown`, sub-threshold download failures) are handled
/// locally and only reach the host as events.
#[derive(Debug, thiserror::Error)]
pub enum CollectorError {
    #[error("download cancelled")]
    Cancelled,

    #[error("manifest download failed with HTTP {status}")]
    ManifestDownloadFailed { status: u16 },

    #[error("invalid manifest: {reason}")]
    InvalidManifest { reason: String },

    #[error("manifest has no media fragments")]
    ManifestContentError,

    #[error("unsupported encryption method `{method}`")]
    UnsupportedCrypto { method: String },

    #[error("fragment downloads failing: {count} consecutive failures, last HTTP {status}")]
    FragmentDownloadFailed { count: u32, status: u16 },

    #[error("license acquisition timed out")]
    LicenseTimeout,

    #[error("fragment decryption failed {count} times")]
    DecryptFailed { count: u32 },

    #[error("track synchronization failed: {reason}")]
    TracksSyncError { reason: String },

    #[error("seek target {target_seconds}s beyond stream window {window_seconds}s")]
    SeekRangeError {
        target_seconds: f64,
        window_seconds: f64,
    },

    #[error("transient network failure: {reason}")]
    TransientNetworkDown { reason: String },

    #[error("HTTP request failed: {source}")]
    Network {
        #[from]
        source: reqwest::Error,
    },

    #[error("request failed with HTTP {status} for {url}")]
    HttpStatus { status: StatusCode, url: String },

    #[error("playlist error: {reason}")]
    Playlist { reason: String },

    #[error("drm error: {source}")]
    Drm {
        #[from]
        source: DrmError,
    },

    #[error("internal error: {reason}")]
    Internal { reason: String },
}

impl CollectorError {
    /// Whether this failure came from the transport layer in a way the
    /// refresh loop treats as a temporary network outage rather than a
    /// genuine fetch error (the previous playlist stays in service).
    pub fn is_transient_network(&self) -> bool {
        match self {
            CollectorError::TransientNetworkDown { .. } => true,
            CollectorError::Network { source } => source.is_timeout() || source.is_connect(),
            _ => false,
        }
    }

    /// HTTP status associated with the failure, when one exists.
    pub fn http_status(&self) -> u16 {
        match self {
            CollectorError::HttpStatus { status, .. } => status.as_u16(),
            CollectorError::ManifestDownloadFailed { status } => *status,
            CollectorError::FragmentDownloadFailed { status, .. } => *status,
            CollectorError::Network { source } => {
                source.status().map(|s| s.as_u16()).unwrap_or(0)
            }
            _ => 0,
        }
    }
}

/// Decryption outcome used by the track pipeline to decide between the
/// license-timeout escalation path and the repeated-failure path.
#[derive(Debug, thiserror::Error)]
pub enum DrmError {
    #[error("key acquisition timed out")]
    KeyAcquisitionTimeout,

    #[error("key acquisition failed: {reason}")]
    KeyAcquisitionFailed { reason: String },

    #[error("no usable decryption context: {reason}")]
    NoContext { reason: String },

    #[error("decrypt failed: {reason}")]
    Decrypt { reason: String },

    #[error("key wait aborted")]
    Aborted,
}
