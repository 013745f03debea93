// HLS fragment-collection core for an adaptive-bitrate streaming player:
// manifest parsing and indexing, per-track download pipelines, A/V
// synchronization across discontinuities, and DRM-aware fragment delivery
// to a downstream demuxer.

pub mod config;
pub mod drm;
pub mod error;
pub mod events;
pub mod harvest;
pub mod http;
pub mod index;
pub mod master;
pub mod output;
pub mod pipeline;
pub mod refresh;
pub mod session;
pub mod sync;
pub mod tags;
pub mod track;

pub use config::CollectorConfig;
pub use drm::{DrmRegistry, FragmentDecrypter, KeyContext, LicenseProvider};
pub use error::{CollectorError, DrmError};
pub use events::{
    DownloadErrorKind, MediaMetadata, SessionHost, TimedMetadata, TrackKind,
};
pub use harvest::{DirectoryHarvester, HarvestKind, HarvestSink};
pub use http::{ByteRange, FetchedFile, FragmentSource, HttpFragmentSource};
pub use index::{DrmMetadataNode, IndexNode, PlaylistIndex, PlaylistType};
pub use master::{MasterManifest, MediaInfo, StreamFormat, StreamInfo};
pub use output::{CachedFragment, FragmentSink};
pub use session::{AbrPolicy, HlsSession, SessionParams, TuneType};
pub use track::{FetchCursor, Track};
