// Master manifest parsing: variant streams, alternate renditions, and the
// codec/extension driven elementary-stream format decision.

use crate::error::CollectorError;
use crate::events::TrackKind;
use crate::tags::{AttributeList, LineScanner, PlaylistLine, PlaylistTag, classify_line};
use tracing::{debug, info, warn};

/// Elementary stream format handed to the downstream demuxer/renderer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamFormat {
    None,
    Invalid,
    MpegTs,
    IsoBmff,
    AudioEsAac,
    AudioEsAc3,
    AudioEsEc3,
    AudioEsAtmos,
    VideoEsH264,
    VideoEsHevc,
    VideoEsMpeg2,
}

const AUDIO_FORMAT_MAP: &[(&str, StreamFormat)] = &[
    ("mp4a.40.2", StreamFormat::AudioEsAac),
    ("mp4a.40.5", StreamFormat::AudioEsAac),
    ("ac-3", StreamFormat::AudioEsAc3),
    ("mp4a.a5", StreamFormat::AudioEsAc3),
    ("ec-3", StreamFormat::AudioEsEc3),
    ("ec+3", StreamFormat::AudioEsAtmos),
    ("eac3", StreamFormat::AudioEsEc3),
];

const VIDEO_FORMAT_MAP: &[(&str, StreamFormat)] = &[
    ("avc1.", StreamFormat::VideoEsH264),
    ("hvc1.", StreamFormat::VideoEsHevc),
    ("mpeg2v", StreamFormat::VideoEsMpeg2),
];

/// One `#EXT-X-STREAM-INF` / `#EXT-X-I-FRAME-STREAM-INF` variant.
#[derive(Debug, Clone, Default)]
pub struct StreamInfo {
    pub uri: String,
    pub bandwidth_bits_per_second: u64,
    pub average_bandwidth: Option<u64>,
    pub program_id: Option<u64>,
    pub resolution: Option<(u32, u32)>,
    pub frame_rate: Option<f64>,
    pub codecs: Option<String>,
    pub audio_group: Option<String>,
    pub closed_captions: Option<String>,
    pub subtitles: Option<String>,
    pub is_iframe_track: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Audio,
    Video,
}

/// One `#EXT-X-MEDIA` alternate rendition.
#[derive(Debug, Clone, Default)]
pub struct MediaInfo {
    pub kind: Option<MediaKind>,
    pub group_id: Option<String>,
    pub name: Option<String>,
    /// BCP-47 language tag.
    pub language: Option<String>,
    pub autoselect: bool,
    pub is_default: bool,
    pub forced: bool,
    pub channels: Option<u32>,
    pub instream_id: Option<String>,
    pub uri: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct MasterManifest {
    pub streams: Vec<StreamInfo>,
    pub media: Vec<MediaInfo>,
    /// Set when the master carries an `#EXT-X-FAXS-CM` marker.
    pub has_drm_metadata: bool,
    pub independent_segments: bool,
}

/// Outcome of the playlist-URI decision for one track.
#[derive(Debug, Clone)]
pub struct TrackSelection {
    pub uri: String,
    pub format: StreamFormat,
    /// Language the session settled on, reported to the host when it
    /// differs from the preference.
    pub selected_language: Option<String>,
}

impl MasterManifest {
    /// Parse a master manifest. Unknown tags are logged and skipped; a
    /// missing `#EXTM3U` header fails the whole manifest.
    pub fn parse(text: &str) -> Result<Self, CollectorError> {
        if !text.starts_with("#EXTM3U") {
            return Err(CollectorError::InvalidManifest {
                reason: "manifest does not begin with #EXTM3U".to_string(),
            });
        }
        let mut manifest = MasterManifest::default();
        let mut pending_stream: Option<StreamInfo> = None;
        let mut unknown_logged = false;

        for (_, line) in LineScanner::new(text) {
            match classify_line(line) {
                PlaylistLine::Uri(uri) => {
                    // URI line completes the preceding STREAM-INF
                    if let Some(mut stream) = pending_stream.take() {
                        stream.uri = uri.to_string();
                        manifest.streams.push(stream);
                    }
                }
                PlaylistLine::Tag(tag) => {
                    if let Some(stream) = pending_stream.take() {
                        // I-FRAME variants carry their URI in attributes and
                        // are complete without a following URI line.
                        if !stream.uri.is_empty() {
                            manifest.streams.push(stream);
                        } else {
                            warn!("variant stream without URI dropped");
                        }
                    }
                    match tag {
                        PlaylistTag::StreamInf(attrs) => {
                            let stream = parse_stream_inf(attrs, false);
                            if stream.uri.is_empty() {
                                pending_stream = Some(stream);
                            } else {
                                manifest.streams.push(stream);
                            }
                        }
                        PlaylistTag::IFrameStreamInf(attrs) => {
                            let stream = parse_stream_inf(attrs, true);
                            if stream.uri.is_empty() {
                                pending_stream = Some(stream);
                            } else {
                                manifest.streams.push(stream);
                            }
                        }
                        PlaylistTag::Media(attrs) => {
                            manifest.media.push(parse_media(attrs));
                        }
                        PlaylistTag::FaxsContentMetadata(_) => {
                            manifest.has_drm_metadata = true;
                        }
                        PlaylistTag::IndependentSegments => {
                            manifest.independent_segments = true;
                        }
                        PlaylistTag::ExtM3u | PlaylistTag::Version(_) => {}
                        PlaylistTag::Unknown(raw) => {
                            if !unknown_logged {
                                info!(tag = %truncate(raw, 24), "unknown master manifest tag");
                                unknown_logged = true;
                            }
                        }
                        other => {
                            debug!(?other, "media-playlist tag in master manifest ignored");
                        }
                    }
                }
                PlaylistLine::Comment(_) | PlaylistLine::Blank => {}
            }
        }
        if let Some(stream) = pending_stream.take()
            && !stream.uri.is_empty()
        {
            manifest.streams.push(stream);
        }
        Ok(manifest)
    }

    /// ABR profile table: non-iframe variants in manifest order.
    pub fn abr_profiles(&self) -> Vec<&StreamInfo> {
        self.streams.iter().filter(|s| !s.is_iframe_track).collect()
    }

    /// First I-frame-only variant, used for trick play.
    pub fn iframe_profile(&self) -> Option<usize> {
        self.streams.iter().position(|s| s.is_iframe_track)
    }

    pub fn has_iframe_track(&self) -> bool {
        self.iframe_profile().is_some()
    }

    /// Distinct audio languages advertised by the renditions.
    pub fn audio_languages(&self) -> Vec<String> {
        let mut languages = Vec::new();
        for media in &self.media {
            if media.kind == Some(MediaKind::Audio)
                && let Some(lang) = &media.language
                && !languages.contains(lang)
            {
                languages.push(lang.clone());
            }
        }
        languages
    }

    /// Non-iframe variant bitrates.
    pub fn bitrates(&self) -> Vec<u64> {
        self.streams
            .iter()
            .filter(|s| !s.is_iframe_track)
            .map(|s| s.bandwidth_bits_per_second)
            .collect()
    }

    /// Resolve the playlist URI and elementary-stream format for a track
    /// against the currently selected variant.
    ///
    /// Video uses the variant URI directly. Audio walks the variant's audio
    /// group twice: first for the preferred language, then for the group
    /// default; the settled language is reported so the host can update its
    /// selection.
    pub fn track_selection(
        &self,
        track: TrackKind,
        profile: &StreamInfo,
        preferred_language: &str,
    ) -> Option<TrackSelection> {
        match track {
            TrackKind::Video => Some(TrackSelection {
                uri: profile.uri.clone(),
                format: StreamFormat::MpegTs,
                selected_language: None,
            }),
            TrackKind::Audio => {
                let group = profile.audio_group.as_deref()?;
                let lang_checks = if preferred_language.is_empty() { 1 } else { 2 };
                for check in (1..=lang_checks).rev() {
                    for media in &self.media {
                        if media.group_id.as_deref() != Some(group) {
                            continue;
                        }
                        let language_match = !preferred_language.is_empty()
                            && media.language.as_deref() == Some(preferred_language);
                        let default_fallback = check == 1 && media.is_default;
                        if !(language_match || default_fallback) {
                            continue;
                        }
                        let uri = media.uri.clone()?;
                        let format = profile
                            .codecs
                            .as_deref()
                            .map(audio_format_from_codecs)
                            .unwrap_or(StreamFormat::None);
                        let selected_language = if check == 1 {
                            Some(
                                media
                                    .language
                                    .clone()
                                    .unwrap_or_else(|| "en".to_string()),
                            )
                        } else {
                            None
                        };
                        return Some(TrackSelection {
                            uri,
                            format,
                            selected_language,
                        });
                    }
                }
                None
            }
        }
    }
}

fn parse_stream_inf(attrs: &str, is_iframe: bool) -> StreamInfo {
    let mut stream = StreamInfo {
        is_iframe_track: is_iframe,
        ..StreamInfo::default()
    };
    for (name, value) in AttributeList::new(attrs) {
        match name {
            "URI" => stream.uri = value.as_str().to_string(),
            "BANDWIDTH" => stream.bandwidth_bits_per_second = value.as_u64().unwrap_or(0),
            "AVERAGE-BANDWIDTH" => stream.average_bandwidth = value.as_u64(),
            "PROGRAM-ID" => stream.program_id = value.as_u64(),
            "RESOLUTION" => {
                stream.resolution = value
                    .as_str()
                    .split_once('x')
                    .and_then(|(w, h)| Some((w.parse().ok()?, h.parse().ok()?)));
            }
            "FRAME-RATE" => stream.frame_rate = value.as_f64(),
            "CODECS" => stream.codecs = Some(value.as_str().to_string()),
            "AUDIO" => stream.audio_group = Some(value.as_str().to_string()),
            "CLOSED-CAPTIONS" => stream.closed_captions = Some(value.as_str().to_string()),
            "SUBTITLES" => stream.subtitles = Some(value.as_str().to_string()),
            other => debug!(attr = other, "unknown STREAM-INF attribute"),
        }
    }
    stream
}

fn parse_media(attrs: &str) -> MediaInfo {
    let mut media = MediaInfo::default();
    for (name, value) in AttributeList::new(attrs) {
        match name {
            "TYPE" => {
                media.kind = match value.as_str() {
                    "AUDIO" => Some(MediaKind::Audio),
                    "VIDEO" => Some(MediaKind::Video),
                    _ => None,
                };
            }
            "GROUP-ID" => media.group_id = Some(value.as_str().to_string()),
            "NAME" => media.name = Some(value.as_str().to_string()),
            "LANGUAGE" => media.language = Some(value.as_str().to_string()),
            "AUTOSELECT" => media.autoselect = value.is_yes(),
            "DEFAULT" => media.is_default = value.is_yes(),
            "FORCED" => media.forced = value.is_yes(),
            "CHANNELS" => media.channels = value.as_u64().map(|c| c as u32),
            "INSTREAM-ID" => media.instream_id = Some(value.as_str().to_string()),
            "URI" => media.uri = Some(value.as_str().to_string()),
            other => debug!(attr = other, "unknown MEDIA attribute"),
        }
    }
    media
}

/// Audio elementary-stream format from a variant's CODECS string.
pub fn audio_format_from_codecs(codecs: &str) -> StreamFormat {
    for (needle, format) in AUDIO_FORMAT_MAP {
        if codecs.contains(needle) {
            return *format;
        }
    }
    StreamFormat::None
}

/// Video elementary-stream format from a variant's CODECS string.
pub fn video_format_from_codecs(codecs: &str) -> StreamFormat {
    for (needle, format) in VIDEO_FORMAT_MAP {
        if codecs.contains(needle) {
            return *format;
        }
    }
    StreamFormat::Invalid
}

/// Infer the container format from the first fragment URI's extension:
/// `.ts` is MPEG-TS, `.mp4` fragmented MP4, `.aac` raw AAC.
pub fn format_from_fragment_extension(playlist_text: &str) -> StreamFormat {
    for (_, line) in LineScanner::new(playlist_text) {
        let line = line.trim_end();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let without_query = line.split('?').next().unwrap_or(line);
        return match without_query.rsplit_once('.').map(|(_, ext)| ext) {
            Some("ts") => StreamFormat::MpegTs,
            Some("mp4") => StreamFormat::IsoBmff,
            Some("aac") => StreamFormat::AudioEsAac,
            _ => StreamFormat::Invalid,
        };
    }
    StreamFormat::Invalid
}

fn truncate(s: &str, max: usize) -> &str {
    s.get(..max).unwrap_or(s)
}
