use crate::error::CollectorError;

/// Track identity. Index order matters: video first, audio second, matching
/// the collector's track array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackKind {
    Video = 0,
    Audio = 1,
}

impl TrackKind {
    pub fn other(self) -> TrackKind {
        match self {
            TrackKind::Video => TrackKind::Audio,
            TrackKind::Audio => TrackKind::Video,
        }
    }

    pub fn index(self) -> usize {
        self as usize
    }
}

impl std::fmt::Display for TrackKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TrackKind::Video => write!(f, "video"),
            TrackKind::Audio => write!(f, "audio"),
        }
    }
}

/// Which kind of download failed, for host error events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadErrorKind {
    Manifest,
    Playlist,
    InitFragment,
    Fragment,
}

/// Media-level metadata reported once after the first successful indexing.
#[derive(Debug, Clone, Default)]
pub struct MediaMetadata {
    pub duration_ms: u64,
    pub languages: Vec<String>,
    pub bitrates: Vec<u64>,
    pub has_drm: bool,
    pub has_iframe_track: bool,
}

/// A subscribed custom tag observed while indexing, timestamped with the
/// cumulative playlist duration at the point it appeared.
#[derive(Debug, Clone)]
pub struct TimedMetadata {
    pub time_ms: u64,
    pub tag: String,
    pub raw_line: String,
}

/// Host application contract. The collector consumes live/TSB state and
/// playback position from the host and pushes session-level events back.
///
/// Implementations must be cheap and non-blocking; everything here is
/// called from the collector and injector tasks.
pub trait SessionHost: Send + Sync {
    fn is_live(&self) -> bool;
    fn set_is_live(&self, live: bool);

    fn is_tsb_supported(&self) -> bool {
        false
    }
    fn is_in_progress_cdvr(&self) -> bool {
        false
    }

    /// Current playback position in milliseconds.
    fn position_ms(&self) -> i64;

    /// Bandwidth persisted from a previous session, used to seed profile
    /// selection on retunes.
    fn persisted_bandwidth(&self) -> Option<u64> {
        None
    }

    fn update_duration(&self, duration_seconds: f64);

    /// Amount of content culled from the head of a live playlist since the
    /// previous refresh.
    fn update_culling_state(&self, culled_seconds: f64);

    fn send_download_error(&self, kind: DownloadErrorKind, http_status: u16);
    fn send_error(&self, error: &CollectorError, fatal: bool);
    fn send_media_metadata(&self, metadata: MediaMetadata);
    fn send_timed_metadata(&self, metadata: TimedMetadata);

    fn notify_first_fragment_decrypted(&self);
    fn notify_entering_live(&self);
    fn update_audio_language_selection(&self, language: &str);

    /// Invoked when live playback risks stalling: `fragment_parsed` is true
    /// when a fragment was found and false when the playlist ran dry.
    fn check_for_playback_stall(&self, _fragment_parsed: bool) {}

    /// Bandwidth hint recovered from a TSB fragment URL.
    fn update_tsb_bandwidth(&self, _bandwidth_bits_per_second: u64) {}
}
