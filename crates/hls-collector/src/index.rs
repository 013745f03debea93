// One-pass media playlist indexing: fragment nodes with cumulative
// durations, discontinuity markers, and DRM metadata extraction.
//
// Index nodes store byte offsets into the owned playlist text so the index
// remains valid while the text buffer is swapped on refresh.

use crate::drm::KeyContext;
use crate::error::CollectorError;
use crate::events::TimedMetadata;
use crate::http::ByteRange;
use crate::tags::{
    AttributeList, LineScanner, PlaylistLine, PlaylistTag, classify_line, parse_byte_range,
    parse_program_date_time,
};
use base64::Engine as _;
use bytes::Bytes;
use sha1::{Digest, Sha1};
use tracing::{debug, info, warn};

/// One fragment in the indexed playlist. `byte_offset` addresses the
/// `#EXTINF` line that opens the fragment's info block.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IndexNode {
    pub byte_offset: usize,
    pub completion_time_seconds_from_start: f64,
    /// Position in the DRM metadata vector, -1 for clear fragments.
    pub drm_metadata_idx: i32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DiscontinuityIndexNode {
    /// Fragment index the discontinuity applies to.
    pub fragment_idx: usize,
    /// Cumulative position at the discontinuity, seconds.
    pub position: f64,
    pub program_date_time: Option<String>,
}

/// Opaque license metadata keyed by the SHA1 of its decoded bytes,
/// hex-encoded lowercase (40 chars).
#[derive(Debug, Clone, PartialEq)]
pub struct DrmMetadataNode {
    pub metadata: Bytes,
    pub sha1_hash: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaylistType {
    Undefined,
    Vod,
    Event,
}

/// `#EXT-X-MAP` contents for fragmented-MP4 content.
#[derive(Debug, Clone, PartialEq)]
pub struct InitFragmentInfo {
    pub uri: String,
    pub byte_range: Option<ByteRange>,
}

#[derive(Debug, Clone, Default)]
pub struct PlaylistIndex {
    pub nodes: Vec<IndexNode>,
    pub discontinuities: Vec<DiscontinuityIndexNode>,
    pub drm_metadata: Vec<DrmMetadataNode>,
    pub first_media_sequence_number: i64,
    pub target_duration_seconds: f64,
    pub total_duration_seconds: f64,
    pub playlist_type: Option<PlaylistType>,
    pub has_end_list: bool,
    pub init_fragment: Option<InitFragmentInfo>,
    pub drm_key_tag_count: u32,
    /// First program-date-time in the playlist, epoch seconds.
    pub first_program_date_time: Option<f64>,
    pub iframes_only: bool,
}

impl PlaylistIndex {
    /// Completion time of the fragment carrying `sequence_number`, clamped
    /// to the last entry, zero when the index is empty or the sequence
    /// precedes the window.
    pub fn completion_time_for_sequence(&self, sequence_number: i64) -> f64 {
        if self.nodes.is_empty() {
            return 0.0;
        }
        let idx = sequence_number - self.first_media_sequence_number;
        if idx < 0 {
            warn!(sequence_number, "sequence number precedes indexed window");
            return 0.0;
        }
        let idx = (idx as usize).min(self.nodes.len() - 1);
        self.nodes[idx].completion_time_seconds_from_start
    }

    /// Discontinuity periods in this playlist.
    pub fn number_of_periods(&self) -> usize {
        self.discontinuities.len()
    }

    /// Cumulative start position of the given discontinuity period.
    pub fn period_start_position(&self, period_idx: usize) -> f64 {
        match self.discontinuities.get(period_idx) {
            Some(node) => node.position,
            None => {
                warn!(
                    period_idx,
                    period_count = self.discontinuities.len(),
                    "period index out of range"
                );
                0.0
            }
        }
    }

    /// Locate the discontinuity period containing `play_target` and the
    /// offset of the next fragment from that period's start. Returns a
    /// period index of -1 while the target sits before the first marker.
    pub fn next_fragment_period_info(&self, play_target: f64) -> (i32, f64) {
        let mut period_idx = -1i32;
        let mut offset_from_period_start = 0.0;
        let mut prev_completion = 0.0;
        let mut found = None;
        for (idx, node) in self.nodes.iter().enumerate() {
            if node.completion_time_seconds_from_start >= play_target {
                found = Some(idx);
                break;
            }
            prev_completion = node.completion_time_seconds_from_start;
        }
        if let Some(idx) = found
            && idx > 0
        {
            offset_from_period_start = prev_completion;
            let mut period_start = 0.0;
            for (i, disc) in self.discontinuities.iter().enumerate() {
                if disc.fragment_idx > idx {
                    break;
                }
                period_idx = i as i32;
                period_start = disc.position;
            }
            offset_from_period_start -= period_start;
        }
        (period_idx, offset_from_period_start)
    }
}

/// Position of a metadata hash in the DRM metadata vector.
pub fn metadata_index_for_hash(nodes: &[DrmMetadataNode], hash: &str) -> Option<usize> {
    nodes.iter().position(|node| node.sha1_hash == hash)
}

pub struct IndexOptions<'a> {
    /// Custom `#EXT-` prefixes the host subscribed to; matched lines are
    /// reported as timed metadata. Only collected on the video track.
    pub subscribed_tags: &'a [String],
    pub collect_subscribed: bool,
    pub track_name: &'a str,
}

pub struct IndexOutcome {
    pub index: PlaylistIndex,
    pub timed_metadata: Vec<TimedMetadata>,
    /// Seconds from a `#EXT-X-X1-LIN-CK` tag when one was present.
    pub defer_window_seconds: Option<i64>,
}

/// Index a media playlist in one pass.
///
/// The key context carries `#EXT-X-KEY` state across refreshes of the same
/// track and is left holding the last key seen, matching the walk order a
/// fetch pass would observe.
pub fn index_playlist(
    text: &str,
    key_ctx: &mut KeyContext,
    opts: &IndexOptions<'_>,
) -> Result<IndexOutcome, CollectorError> {
    if !text.starts_with("#EXTM3U") {
        return Err(CollectorError::InvalidManifest {
            reason: format!(
                "playlist does not begin with #EXTM3U: {}",
                text.get(..64).unwrap_or(text)
            ),
        });
    }

    let mut index = PlaylistIndex::default();
    let mut timed_metadata = Vec::new();
    let mut defer_window_seconds = None;

    // header + DRM metadata pass
    for (_, line) in LineScanner::new(text) {
        match classify_line(line) {
            PlaylistLine::Tag(PlaylistTag::MediaSequence(seq)) => {
                index.first_media_sequence_number = seq;
            }
            PlaylistLine::Tag(PlaylistTag::TargetDuration(seconds)) => {
                index.target_duration_seconds = seconds;
            }
            PlaylistLine::Tag(PlaylistTag::Map(attrs)) => {
                index.init_fragment = parse_map(attrs);
            }
            PlaylistLine::Tag(PlaylistTag::PlaylistType(value)) => {
                index.playlist_type = Some(match value.trim() {
                    "VOD" => PlaylistType::Vod,
                    "EVENT" => PlaylistType::Event,
                    other => {
                        return Err(CollectorError::InvalidManifest {
                            reason: format!("unknown PLAYLIST-TYPE `{other}`"),
                        });
                    }
                });
            }
            PlaylistLine::Tag(PlaylistTag::EndList) => index.has_end_list = true,
            PlaylistLine::Tag(PlaylistTag::IFramesOnly) => index.iframes_only = true,
            PlaylistLine::Tag(PlaylistTag::FaxsContentMetadata(body)) => {
                match decode_metadata(body) {
                    Some(node) => index.drm_metadata.push(node),
                    None => warn!(
                        track = opts.track_name,
                        "undecodable DRM metadata entry skipped"
                    ),
                }
            }
            _ => {}
        }
    }
    if index.first_media_sequence_number == 0 && !text.contains("#EXT-X-MEDIA-SEQUENCE:") {
        info!(track = opts.track_name, "no EXT-X-MEDIA-SEQUENCE tag, assuming 0");
    }

    // body pass: fragment nodes, discontinuities, key rotation
    let mut total_duration = 0.0f64;
    let mut current_drm_idx = current_metadata_idx(key_ctx, &index.drm_metadata);
    let mut pending_discontinuity = false;
    let mut fragment_pdt: Option<&str> = None;
    let mut unknown_logged = false;

    for (offset, line) in LineScanner::new(text) {
        let PlaylistLine::Tag(tag) = classify_line(line) else {
            continue;
        };
        match tag {
            PlaylistTag::Inf { duration, .. } => {
                if pending_discontinuity {
                    debug!(
                        track = opts.track_name,
                        fragment_idx = index.nodes.len(),
                        position = total_duration,
                        "discontinuity indexed"
                    );
                    index.discontinuities.push(DiscontinuityIndexNode {
                        fragment_idx: index.nodes.len(),
                        position: total_duration,
                        program_date_time: fragment_pdt.map(str::to_string),
                    });
                    pending_discontinuity = false;
                }
                fragment_pdt = None;
                total_duration += duration;
                index.nodes.push(IndexNode {
                    byte_offset: offset,
                    completion_time_seconds_from_start: total_duration,
                    drm_metadata_idx: current_drm_idx,
                });
            }
            PlaylistTag::Discontinuity => {
                // a marker before any content is a false leading edge
                if total_duration != 0.0 {
                    pending_discontinuity = true;
                }
            }
            PlaylistTag::ProgramDateTime(value) => {
                fragment_pdt = Some(value);
                if index.first_program_date_time.is_none() {
                    index.first_program_date_time = parse_program_date_time(value);
                }
            }
            PlaylistTag::Key(attrs) => {
                key_ctx.apply_key_attributes(attrs, opts.track_name)?;
                current_drm_idx = current_metadata_idx(key_ctx, &index.drm_metadata);
                index.drm_key_tag_count += 1;
            }
            PlaylistTag::DeferredLicenseWindow(body) => {
                let seconds = body.trim().parse::<i64>().unwrap_or(0);
                if seconds != 0 {
                    defer_window_seconds = Some(seconds);
                } else {
                    warn!(track = opts.track_name, "deferred-license tag with invalid time");
                }
            }
            PlaylistTag::Unknown(raw) => {
                if opts.collect_subscribed {
                    for tag_name in opts.subscribed_tags {
                        if raw.starts_with(tag_name.as_str()) {
                            timed_metadata.push(TimedMetadata {
                                time_ms: (total_duration * 1000.0) as u64,
                                tag: tag_name.clone(),
                                raw_line: raw.to_string(),
                            });
                            break;
                        }
                    }
                }
                if !unknown_logged {
                    info!(
                        track = opts.track_name,
                        tag = raw.get(..24).unwrap_or(raw),
                        "unknown playlist tag"
                    );
                    unknown_logged = true;
                }
            }
            _ => {}
        }
    }

    index.total_duration_seconds = total_duration;
    Ok(IndexOutcome {
        index,
        timed_metadata,
        defer_window_seconds,
    })
}

/// DRM slot for the key context's current state: -1 while clear, else the
/// position of the current metadata hash. An encrypted context without a
/// registered hash (vanilla AES) also maps to -1; its encryption state
/// travels in the key context instead.
fn current_metadata_idx(key_ctx: &KeyContext, nodes: &[DrmMetadataNode]) -> i32 {
    if !key_ctx.fragment_encrypted {
        return -1;
    }
    key_ctx
        .cm_sha1_hash
        .as_deref()
        .and_then(|hash| metadata_index_for_hash(nodes, hash))
        .map(|idx| idx as i32)
        .unwrap_or(-1)
}

fn parse_map(attrs: &str) -> Option<InitFragmentInfo> {
    let mut uri = None;
    let mut byte_range = None;
    for (name, value) in AttributeList::new(attrs) {
        match name {
            "URI" => uri = Some(value.as_str().to_string()),
            "BYTERANGE" => byte_range = parse_byte_range(value.as_str()),
            _ => {}
        }
    }
    Some(InitFragmentInfo {
        uri: uri?,
        byte_range,
    })
}

fn decode_metadata(body: &str) -> Option<DrmMetadataNode> {
    let metadata = base64::engine::general_purpose::STANDARD
        .decode(body.trim())
        .ok()?;
    let mut hasher = Sha1::new();
    hasher.update(&metadata);
    let sha1_hash = hex::encode(hasher.finalize());
    Some(DrmMetadataNode {
        metadata: Bytes::from(metadata),
        sha1_hash,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drm::KeyContext;

    fn opts() -> IndexOptions<'static> {
        IndexOptions {
            subscribed_tags: &[],
            collect_subscribed: false,
            track_name: "video",
        }
    }

    fn simple_playlist(fragments: usize, duration: f64) -> String {
        let mut text = String::from(
            "#EXTM3U\n#EXT-X-TARGETDURATION:6\n#EXT-X-MEDIA-SEQUENCE:100\n",
        );
        for i in 0..fragments {
            text.push_str(&format!("#EXTINF:{duration},\nseg{i}.ts\n"));
        }
        text.push_str("#EXT-X-ENDLIST\n");
        text
    }

    #[test]
    fn cumulative_durations_are_non_decreasing_and_sum_to_total() {
        let text = simple_playlist(10, 6.0);
        let mut ctx = KeyContext::default();
        let outcome = index_playlist(&text, &mut ctx, &opts()).unwrap();
        let index = outcome.index;

        assert_eq!(index.nodes.len(), 10);
        assert_eq!(index.first_media_sequence_number, 100);
        assert!((index.total_duration_seconds - 60.0).abs() < 1e-6);

        let mut prev = 0.0;
        let mut sum = 0.0;
        for node in &index.nodes {
            assert!(node.completion_time_seconds_from_start >= prev);
            sum += node.completion_time_seconds_from_start - prev;
            prev = node.completion_time_seconds_from_start;
        }
        assert!((sum - index.total_duration_seconds).abs() < 1e-6);
    }

    #[test]
    fn rejects_playlist_without_header() {
        let mut ctx = KeyContext::default();
        assert!(matches!(
            index_playlist("#EXTINF:6,\nseg.ts\n", &mut ctx, &opts()),
            Err(CollectorError::InvalidManifest { .. })
        ));
    }

    #[test]
    fn rejects_unknown_playlist_type() {
        let text = "#EXTM3U\n#EXT-X-PLAYLIST-TYPE:LINEAR\n#EXTINF:6,\nseg.ts\n";
        let mut ctx = KeyContext::default();
        assert!(matches!(
            index_playlist(text, &mut ctx, &opts()),
            Err(CollectorError::InvalidManifest { .. })
        ));
    }

    #[test]
    fn leading_discontinuity_is_discarded() {
        let text = "#EXTM3U\n#EXT-X-DISCONTINUITY\n#EXTINF:6,\nseg0.ts\n\
#EXT-X-DISCONTINUITY\n#EXTINF:6,\nseg1.ts\n";
        let mut ctx = KeyContext::default();
        let outcome = index_playlist(text, &mut ctx, &opts()).unwrap();
        assert_eq!(outcome.index.discontinuities.len(), 1);
        let disc = &outcome.index.discontinuities[0];
        assert_eq!(disc.fragment_idx, 1);
        assert!((disc.position - 6.0).abs() < 1e-9);
    }

    #[test]
    fn discontinuity_captures_program_date_time() {
        let text = "#EXTM3U\n#EXTINF:6,\nseg0.ts\n#EXT-X-DISCONTINUITY\n\
#EXT-X-PROGRAM-DATE-TIME:2024-03-01T10:00:06.000Z\n#EXTINF:6,\nseg1.ts\n";
        let mut ctx = KeyContext::default();
        let outcome = index_playlist(text, &mut ctx, &opts()).unwrap();
        let disc = &outcome.index.discontinuities[0];
        assert_eq!(
            disc.program_date_time.as_deref(),
            Some("2024-03-01T10:00:06.000Z")
        );
        assert!(outcome.index.first_program_date_time.is_some());
    }

    #[test]
    fn key_none_clears_drm_index() {
        // metadata body is base64 of arbitrary bytes
        let metadata_b64 = base64::engine::general_purpose::STANDARD.encode(b"meta-bytes");
        let mut hasher = Sha1::new();
        hasher.update(b"meta-bytes");
        let hash = hex::encode(hasher.finalize());

        let text = format!(
            "#EXTM3U\n#EXT-X-FAXS-CM:{metadata_b64}\n\
#EXT-X-KEY:METHOD=AES-128,URI=\"https://keys/1\",CMSha1Hash=0x{hash}\n\
#EXTINF:6,\nseg0.ts\n\
#EXT-X-KEY:METHOD=NONE\n\
#EXTINF:6,\nseg1.ts\n"
        );
        let mut ctx = KeyContext::default();
        let outcome = index_playlist(&text, &mut ctx, &opts()).unwrap();
        let index = outcome.index;
        assert_eq!(index.drm_metadata.len(), 1);
        assert_eq!(index.drm_metadata[0].sha1_hash, hash);
        assert_eq!(index.nodes[0].drm_metadata_idx, 0);
        assert_eq!(index.nodes[1].drm_metadata_idx, -1);
        assert_eq!(index.drm_key_tag_count, 2);
        assert!(!ctx.fragment_encrypted);
    }

    #[test]
    fn map_tag_is_parsed() {
        let text = "#EXTM3U\n#EXT-X-MAP:URI=\"init.mp4\",BYTERANGE=\"720@0\"\n\
#EXTINF:6,\nseg0.mp4\n";
        let mut ctx = KeyContext::default();
        let outcome = index_playlist(text, &mut ctx, &opts()).unwrap();
        let init = outcome.index.init_fragment.unwrap();
        assert_eq!(init.uri, "init.mp4");
        assert_eq!(init.byte_range.unwrap().length, 720);
    }

    #[test]
    fn defer_tag_is_surfaced() {
        let text = "#EXTM3U\n#EXT-X-X1-LIN-CK:30\n#EXTINF:6,\nseg0.ts\n";
        let mut ctx = KeyContext::default();
        let outcome = index_playlist(text, &mut ctx, &opts()).unwrap();
        assert_eq!(outcome.defer_window_seconds, Some(30));
    }

    #[test]
    fn subscribed_tags_are_timed() {
        let text = "#EXTM3U\n#EXTINF:6,\nseg0.ts\n#EXT-X-CUE:ID=7\n#EXTINF:6,\nseg1.ts\n";
        let subscribed = vec!["#EXT-X-CUE".to_string()];
        let opts = IndexOptions {
            subscribed_tags: &subscribed,
            collect_subscribed: true,
            track_name: "video",
        };
        let mut ctx = KeyContext::default();
        let outcome = index_playlist(text, &mut ctx, &opts).unwrap();
        assert_eq!(outcome.timed_metadata.len(), 1);
        assert_eq!(outcome.timed_metadata[0].time_ms, 6000);
        assert_eq!(outcome.timed_metadata[0].raw_line, "#EXT-X-CUE:ID=7");
    }

    #[test]
    fn completion_time_lookup_clamps() {
        let text = simple_playlist(5, 2.0);
        let mut ctx = KeyContext::default();
        let index = index_playlist(&text, &mut ctx, &opts()).unwrap().index;
        assert!((index.completion_time_for_sequence(100) - 2.0).abs() < 1e-9);
        assert!((index.completion_time_for_sequence(104) - 10.0).abs() < 1e-9);
        // beyond the window clamps to the last node
        assert!((index.completion_time_for_sequence(200) - 10.0).abs() < 1e-9);
        assert_eq!(index.completion_time_for_sequence(50), 0.0);
    }

    #[test]
    fn period_info_resolution() {
        let text = "#EXTM3U\n\
#EXTINF:6,\nseg0.ts\n#EXTINF:6,\nseg1.ts\n\
#EXT-X-DISCONTINUITY\n#EXTINF:6,\nseg2.ts\n#EXTINF:6,\nseg3.ts\n";
        let mut ctx = KeyContext::default();
        let index = index_playlist(text, &mut ctx, &opts()).unwrap().index;
        assert_eq!(index.number_of_periods(), 1);
        assert!((index.period_start_position(0) - 12.0).abs() < 1e-9);

        // play target inside second period
        let (period_idx, offset) = index.next_fragment_period_info(15.0);
        assert_eq!(period_idx, 0);
        assert!((offset - 0.0).abs() < 1e-9);
    }
}
