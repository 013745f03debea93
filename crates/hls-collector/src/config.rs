use std::path::PathBuf;
use std::time::Duration;

/// Fragments whose start lands within this many seconds before the play
/// target are considered reached by the playlist walk.
pub const PLAYLIST_TIME_DIFF_THRESHOLD_SECONDS: f64 = 0.1;

/// Retries for the master manifest and media playlists on HTTP 404.
pub const MAX_MANIFEST_DOWNLOAD_RETRY: u32 = 3;

/// Spacing between manifest/playlist download retries.
pub const MANIFEST_RETRY_DELAY: Duration = Duration::from_millis(500);

pub const MAX_DELAY_BETWEEN_PLAYLIST_UPDATE_MS: u64 = 6_000;
pub const MIN_DELAY_BETWEEN_PLAYLIST_UPDATE_MS: u64 = 500;

pub const DRM_IV_LEN: usize = 16;
/// SHA1 hash of DRM metadata, hex encoded.
pub const DRM_SHA1_HASH_LEN: usize = 40;

/// Upper bound on blocking for a license inside decrypt.
pub const MAX_LICENSE_ACQ_WAIT_TIME: Duration = Duration::from_millis(12_000);

/// Cap on fragment-by-fragment catch-up during sequence-number sync; lag
/// beyond this is unsyncable by sequence number.
pub const MAX_SEQ_NUMBER_LAG_COUNT: i64 = 50;

/// Sequence lag above which start-time sync is preferred when both tracks
/// carry program-date-time.
pub const MAX_SEQ_NUMBER_DIFF_FOR_SEQ_NUM_BASED_SYNC: i64 = 2;

/// Both tracks must carry a discontinuity tag within this window of each
/// other for the discontinuity to be honored.
pub const DISCONTINUITY_DISCARD_TOLERANCE_SECONDS: f64 = 30.0;

/// Playlist refreshes to wait for the other track's discontinuity marker.
pub const MAX_PLAYLIST_REFRESH_FOR_DISCONTINUITY_CHECK_EVENT: u32 = 5;
pub const MAX_PLAYLIST_REFRESH_FOR_DISCONTINUITY_CHECK_LIVE: u32 = 1;

/// Consecutive fragment download failures before the session reports a
/// fatal download error.
pub const MAX_SEG_DOWNLOAD_FAIL_COUNT: u32 = 10;

/// Non-timeout decrypt failures before the session reports a fatal
/// decrypt error.
pub const MAX_SEG_DRM_DECRYPT_FAIL_COUNT: u32 = 10;

pub const NORMAL_PLAY_RATE: f64 = 1.0;

/// Retry behavior for a single URL, shared by playlist and key downloads.
/// Delay grows as `base * 2^attempt` capped at `max_delay`, with optional
/// jitter.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: MAX_MANIFEST_DOWNLOAD_RETRY,
            base_delay: MANIFEST_RETRY_DELAY,
            max_delay: MANIFEST_RETRY_DELAY,
            jitter: false,
        }
    }
}

/// Optional pass-through persistence of downloaded manifests/fragments.
#[derive(Debug, Clone)]
pub struct HarvestConfig {
    /// Directory harvested files are written into.
    pub directory: PathBuf,
    pub harvest_fragments: bool,
    pub harvest_manifests: bool,
}

#[derive(Debug, Clone)]
pub struct CollectorConfig {
    /// Distance from the live edge the session tunes to, in seconds.
    pub live_offset_seconds: f64,
    /// Capacity of the per-track cached fragment ring.
    pub max_cached_fragments_per_track: usize,
    /// Frames per second presented during trick play on VOD assets.
    pub vod_trick_play_fps: u32,
    /// Frames per second presented during trick play against a TSB.
    pub linear_trick_play_fps: u32,
    /// Fetch both media playlists concurrently during tune.
    pub parallel_playlist_fetch: bool,
    /// Prefer program-date-time over sequence numbers for A/V sync.
    pub sync_using_start_time: bool,
    /// Custom `#EXT-` prefixes reported to the host as timed metadata.
    pub subscribed_tags: Vec<String>,
    /// Preferred audio language (BCP-47), empty for rendition default.
    pub preferred_audio_language: String,
    pub fragment_retry: RetryPolicy,
    pub playlist_retry: RetryPolicy,
    pub download_timeout: Duration,
    pub harvest: Option<HarvestConfig>,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            live_offset_seconds: 15.0,
            max_cached_fragments_per_track: 3,
            vod_trick_play_fps: 4,
            linear_trick_play_fps: 8,
            parallel_playlist_fetch: true,
            sync_using_start_time: false,
            subscribed_tags: Vec::new(),
            preferred_audio_language: String::new(),
            fragment_retry: RetryPolicy::default(),
            playlist_retry: RetryPolicy::default(),
            download_timeout: Duration::from_secs(10),
            harvest: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = CollectorConfig::default();
        assert!(cfg.max_cached_fragments_per_track >= 1);
        assert!(cfg.live_offset_seconds > 0.0);
        assert_eq!(cfg.playlist_retry.max_retries, 3);
    }
}
