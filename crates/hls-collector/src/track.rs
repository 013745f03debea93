// Per-track state: the owned playlist text with its index, the fetch
// cursor the collector loop advances, and the playlist operations
// (next-fragment walk, sequence relocation, trick-play index walk,
// live refresh with culling).

use crate::config::{
    DISCONTINUITY_DISCARD_TOLERANCE_SECONDS, MAX_PLAYLIST_REFRESH_FOR_DISCONTINUITY_CHECK_EVENT,
    MAX_PLAYLIST_REFRESH_FOR_DISCONTINUITY_CHECK_LIVE, PLAYLIST_TIME_DIFF_THRESHOLD_SECONDS,
};
use crate::drm::KeyContext;
use crate::error::CollectorError;
use crate::events::{DownloadErrorKind, TrackKind};
use crate::harvest::HarvestKind;
use crate::http::{ByteRange, RetryAction, retry_with_backoff};
use crate::index::{IndexOptions, PlaylistIndex, PlaylistType, index_playlist};
use crate::refresh::max_interval_between_playlist_updates_ms;
use crate::session::StreamContext;
use crate::tags::{
    LineScanner, PlaylistLine, PlaylistTag, classify_line, parse_byte_range,
    parse_program_date_time,
};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

/// Playlist text and index, replaced wholesale on refresh. Guarded by a
/// plain mutex; nothing async runs while it is held, and the cross-track
/// discontinuity probe pairs it with the index epoch channel so it sees
/// either the pre- or post-refresh index, never a partial one.
pub struct TrackPlaylist {
    pub text: String,
    pub effective_url: String,
    pub index: PlaylistIndex,
    pub culled_seconds: f64,
    pub first_index_done: bool,
    /// Discontinuity match cursor used by the cross-track probe.
    pub last_matched_discontinuity_position: f64,
}

impl Default for TrackPlaylist {
    fn default() -> Self {
        Self {
            text: String::new(),
            effective_url: String::new(),
            index: PlaylistIndex::default(),
            culled_seconds: 0.0,
            first_index_done: false,
            last_matched_discontinuity_position: -1.0,
        }
    }
}

/// The collector loop's mutable position inside the playlist. Owned by the
/// per-track pipeline task; the synchronizer adjusts it before the task
/// spawns.
#[derive(Debug, Clone)]
pub struct FetchCursor {
    /// Byte offset of the current fragment URI line, None when the walk
    /// ran out of fragments.
    pub fragment_offset: Option<usize>,
    /// Cumulative position the walk has parsed up to, None before the
    /// first fragment.
    pub playlist_position: Option<f64>,
    pub play_target: f64,
    pub play_target_offset: f64,
    pub next_media_sequence_number: i64,
    pub fragment_duration_seconds: f64,
    pub target_duration_seconds: f64,
    pub byte_range: Option<ByteRange>,
    pub discontinuity: bool,
    pub key: KeyContext,
    /// Position in the DRM metadata vector for the current key.
    pub current_metadata_idx: i32,
    /// Wall clock from the first program-date-time, for start-time sync.
    pub start_time_for_playlist_sync: Option<f64>,
    pub eos_reached: bool,
    /// Trick-play cursor into the fragment index.
    pub current_idx: Option<usize>,
    pub sync_after_discontinuity: bool,
    pub seg_dl_fail_count: u32,
    pub seg_drm_decrypt_fail_count: u32,
    pub manifest_dl_fail_count: u32,
    pub last_playlist_download: Option<Instant>,
    pub inject_init_fragment: bool,
    pub refresh_requested: bool,
    pub force_process_drm_metadata: bool,
    pub license_request_pending: bool,
    /// Set while a rampdown retry is in flight so the periodic profile
    /// check does not fight it.
    pub check_for_rampdown: bool,
}

impl Default for FetchCursor {
    fn default() -> Self {
        Self {
            fragment_offset: Some(0),
            playlist_position: None,
            play_target: 0.0,
            play_target_offset: 0.0,
            next_media_sequence_number: 0,
            fragment_duration_seconds: 0.0,
            // avoid a tight refresh loop before the first index
            target_duration_seconds: 1.0,
            byte_range: None,
            discontinuity: false,
            key: KeyContext::default(),
            current_metadata_idx: 0,
            start_time_for_playlist_sync: None,
            eos_reached: false,
            current_idx: None,
            sync_after_discontinuity: false,
            seg_dl_fail_count: 0,
            seg_drm_decrypt_fail_count: 0,
            manifest_dl_fail_count: 0,
            last_playlist_download: None,
            inject_init_fragment: true,
            refresh_requested: false,
            force_process_drm_metadata: false,
            license_request_pending: false,
            check_for_rampdown: false,
        }
    }
}

/// A fragment selected for download.
#[derive(Debug, Clone)]
pub struct FragmentPlan {
    pub uri: String,
    pub byte_range: Option<ByteRange>,
    pub discontinuity: bool,
    pub fragment_duration_seconds: f64,
}

struct WalkCandidate {
    uri: String,
    byte_range: Option<ByteRange>,
    discontinuity: bool,
    program_date_time: Option<String>,
}

pub struct RefreshOutcome {
    pub success: bool,
    pub transient_network_failure: bool,
}

pub struct Track {
    pub kind: TrackKind,
    pub name: &'static str,
    pub enabled: AtomicBool,
    pub playlist_url: Mutex<String>,
    playlist: Mutex<TrackPlaylist>,
    /// Bumped after every successful index; discontinuity probes and
    /// stop wake-ups ride on it.
    index_epoch: watch::Sender<u64>,
}

impl Track {
    pub fn new(kind: TrackKind, name: &'static str) -> Self {
        let (index_epoch, _) = watch::channel(0u64);
        Self {
            kind,
            name,
            enabled: AtomicBool::new(false),
            playlist_url: Mutex::new(String::new()),
            playlist: Mutex::new(TrackPlaylist::default()),
            index_epoch,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn with_playlist<R>(&self, f: impl FnOnce(&TrackPlaylist) -> R) -> R {
        f(&self.playlist.lock().expect("track playlist poisoned"))
    }

    pub fn duration(&self) -> f64 {
        self.with_playlist(|p| p.index.total_duration_seconds)
    }

    pub fn culled_seconds(&self) -> f64 {
        self.with_playlist(|p| p.culled_seconds)
    }

    pub fn effective_url(&self) -> String {
        self.with_playlist(|p| p.effective_url.clone())
    }

    /// Wake anyone blocked on a playlist refresh (used during stop).
    pub fn stop_wait_for_playlist_refresh(&self) {
        self.index_epoch.send_modify(|epoch| *epoch += 1);
    }

    /// Download the media playlist, retrying on 404 with fixed spacing.
    pub async fn fetch_playlist(
        &self,
        ctx: &StreamContext,
    ) -> Result<(String, String), CollectorError> {
        let url = self.playlist_url.lock().expect("playlist url poisoned").clone();
        debug!(track = self.name, url = %url, "fetching playlist");
        let fetched = retry_with_backoff(&ctx.config.playlist_retry, &ctx.token, |_| {
            let url = url.clone();
            async move {
                match ctx
                    .source
                    .get_file(&url, None, self.kind, true, &ctx.token)
                    .await
                {
                    Ok(file) => RetryAction::Success(file),
                    Err(e) if e.http_status() == 404 => RetryAction::Retry(e),
                    Err(e) => RetryAction::Fail(e),
                }
            }
        })
        .await?;
        let text = String::from_utf8(fetched.body.to_vec()).map_err(|e| {
            CollectorError::InvalidManifest {
                reason: format!("playlist is not UTF-8: {e}"),
            }
        })?;
        Ok((text, fetched.effective_url))
    }

    /// Index `text` and install it as the track's playlist. Runs the DRM
    /// metadata bookkeeping that brackets an index cycle and reports
    /// duration, liveness and timed metadata to the host.
    pub fn index_and_install(
        &self,
        ctx: &StreamContext,
        cursor: &mut FetchCursor,
        text: String,
        effective_url: String,
    ) -> Result<(), CollectorError> {
        let subscribed = &ctx.config.subscribed_tags;
        let opts = IndexOptions {
            subscribed_tags: subscribed,
            collect_subscribed: !subscribed.is_empty() && self.kind == TrackKind::Video,
            track_name: self.name,
        };

        let first_index_done = self.with_playlist(|p| p.first_index_done);
        // only multi-key streams register metadata across refreshes;
        // single-key streams never re-run SetMetadata, so the registry
        // generation pass would collect live entries
        let rotating = first_index_done && cursor.key.cm_sha1_hash.is_some();
        if rotating {
            ctx.registry.mark_before_index(self.kind);
        }

        cursor.key.indexing_in_progress = true;
        let outcome = index_playlist(&text, &mut cursor.key, &opts);
        cursor.key.indexing_in_progress = false;
        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(e) => {
                ctx.host.send_error(&e, true);
                return Err(e);
            }
        };

        cursor.target_duration_seconds = outcome.index.target_duration_seconds.max(1.0);

        // playlist type: ENDLIST forces VOD so live adjust never kicks in
        {
            let mut playlist_type = ctx.playlist_type.lock().expect("playlist type poisoned");
            if let Some(parsed) = outcome.index.playlist_type {
                *playlist_type = Some(parsed);
            }
            if outcome.index.has_end_list && *playlist_type != Some(PlaylistType::Vod) {
                info!(track = self.name, "ENDLIST present, treating playlist as VOD");
                *playlist_type = Some(PlaylistType::Vod);
            }
            ctx.host
                .set_is_live(*playlist_type != Some(PlaylistType::Vod));
        }
        if outcome.index.has_end_list {
            ctx.has_end_list.store(true, Ordering::Release);
        }

        // deferred licensing: only live, normal rate, fresh tunes
        let defer_gate = ctx.host.is_live()
            && ctx.rate == crate::config::NORMAL_PLAY_RATE
            && ctx.tune_type.allows_deferred_licensing();
        let defer_tag_present = defer_gate && outcome.defer_window_seconds.is_some();
        if let Some(seconds) = outcome.defer_window_seconds.filter(|_| defer_gate) {
            ctx.registry
                .process_defer_window(&outcome.index.drm_metadata, seconds, first_index_done);
        }
        ctx.registry.clear_defer_if_tag_absent(defer_tag_present);

        if self.kind == TrackKind::Video {
            ctx.host
                .update_duration(outcome.index.total_duration_seconds);
            ctx.max_interval_between_playlist_updates_ms.store(
                max_interval_between_playlist_updates_ms(outcome.index.target_duration_seconds),
                Ordering::Release,
            );
        }
        for metadata in outcome.timed_metadata {
            ctx.host.send_timed_metadata(metadata);
        }

        if (first_index_done && cursor.key.cm_sha1_hash.is_some())
            || cursor.force_process_drm_metadata
        {
            let processed = ctx.registry.process_metadata(
                &outcome.index.drm_metadata,
                cursor.key.cm_sha1_hash.as_deref(),
                false,
                self.kind,
            );
            if let Some(idx) = processed.current_index {
                cursor.current_metadata_idx = idx as i32;
            }
            if processed.hash_mismatch {
                ctx.host.send_error(
                    &CollectorError::InvalidManifest {
                        reason: "current key hash matches no DRM metadata".to_string(),
                    },
                    true,
                );
            }
            cursor.license_request_pending = processed.license_request_pending;
            cursor.force_process_drm_metadata = false;
        }

        {
            let mut playlist = self.playlist.lock().expect("track playlist poisoned");
            playlist.text = text;
            playlist.effective_url = effective_url;
            playlist.index = outcome.index;
            playlist.first_index_done = true;
        }
        if rotating {
            ctx.registry.flush_after_index(self.kind);
        }
        self.index_epoch.send_modify(|epoch| *epoch += 1);
        Ok(())
    }

    /// Acquire licenses after indexing; `acquire_current_only` pre-warms
    /// just the current period's license at tune time.
    pub fn process_drm_metadata(
        &self,
        ctx: &StreamContext,
        cursor: &mut FetchCursor,
        acquire_current_only: bool,
    ) {
        let nodes = self.with_playlist(|p| p.index.drm_metadata.clone());
        let processed = ctx.registry.process_metadata(
            &nodes,
            cursor.key.cm_sha1_hash.as_deref(),
            acquire_current_only,
            self.kind,
        );
        if let Some(idx) = processed.current_index {
            cursor.current_metadata_idx = idx as i32;
        }
        if processed.hash_mismatch {
            ctx.host.send_error(
                &CollectorError::InvalidManifest {
                    reason: "current key hash matches no DRM metadata".to_string(),
                },
                true,
            );
        }
        cursor.license_request_pending = processed.license_request_pending;
    }

    /// Walk the playlist from the cursor to the first fragment at or past
    /// the play target. Returns the candidate without committing its
    /// discontinuity flag; `select_next_fragment` finishes the job.
    fn walk_next(&self, ctx: &StreamContext, cursor: &mut FetchCursor) -> Option<WalkCandidate> {
        let playlist = self.playlist.lock().expect("track playlist poisoned");
        let text = &playlist.text;

        if cursor.play_target < 0.0 {
            warn!(track = self.name, play_target = cursor.play_target, "negative play target");
            cursor.play_target = 0.0;
        }
        let start = cursor.fragment_offset?;
        if cursor.playlist_position == Some(cursor.play_target) {
            // re-presenting the current fragment
            let uri = uri_line_at(text, start)?;
            return Some(WalkCandidate {
                uri: uri.to_string(),
                byte_range: cursor.byte_range,
                discontinuity: cursor.discontinuity,
                program_date_time: None,
            });
        }

        let mut scanner = LineScanner::from_offset(text, start);
        if cursor.playlist_position.is_some() {
            // already presenting, skip past the previous fragment URI
            scanner.next();
        }

        let mut byte_range: Option<ByteRange> = None;
        let mut discontinuity = false;
        let mut program_date_time: Option<&str> = None;

        for (offset, line) in scanner {
            match classify_line(line) {
                PlaylistLine::Tag(tag) => match tag {
                    PlaylistTag::Inf { duration, .. } => {
                        cursor.playlist_position = Some(match cursor.playlist_position {
                            Some(position) => position + cursor.fragment_duration_seconds,
                            None => 0.0,
                        });
                        cursor.fragment_duration_seconds = duration;
                    }
                    PlaylistTag::ByteRange(body) => byte_range = parse_byte_range(body),
                    PlaylistTag::TargetDuration(seconds) => {
                        cursor.target_duration_seconds = seconds;
                    }
                    PlaylistTag::MediaSequence(seq) => {
                        cursor.next_media_sequence_number = seq;
                    }
                    PlaylistTag::Key(attrs) => {
                        if let Err(e) = cursor.key.apply_key_attributes(attrs, self.name) {
                            warn!(track = self.name, error = %e, "key tag rejected");
                        }
                        cursor.current_metadata_idx = cursor
                            .key
                            .cm_sha1_hash
                            .as_deref()
                            .and_then(|hash| {
                                crate::index::metadata_index_for_hash(
                                    &playlist.index.drm_metadata,
                                    hash,
                                )
                            })
                            .map(|idx| idx as i32)
                            .unwrap_or(cursor.current_metadata_idx);
                    }
                    PlaylistTag::ProgramDateTime(value) => {
                        if ctx.number_of_tracks.load(Ordering::Acquire) > 1 {
                            program_date_time = Some(value);
                            if cursor.start_time_for_playlist_sync.is_none() {
                                cursor.start_time_for_playlist_sync =
                                    parse_program_date_time(value);
                            }
                        }
                    }
                    PlaylistTag::EndList => {
                        ctx.has_end_list.store(true, Ordering::Release);
                    }
                    PlaylistTag::Discontinuity => discontinuity = true,
                    _ => {}
                },
                PlaylistLine::Uri(uri) => {
                    cursor.next_media_sequence_number += 1;
                    let position = cursor.playlist_position.unwrap_or(0.0);
                    if position >= cursor.play_target
                        || (cursor.play_target - position) < PLAYLIST_TIME_DIFF_THRESHOLD_SECONDS
                    {
                        cursor.fragment_offset = Some(offset);
                        cursor.byte_range = byte_range;
                        return Some(WalkCandidate {
                            uri: uri.to_string(),
                            byte_range,
                            discontinuity,
                            program_date_time: program_date_time.map(str::to_string),
                        });
                    }
                    byte_range = None;
                    discontinuity = false;
                    program_date_time = None;
                }
                PlaylistLine::Comment(_) | PlaylistLine::Blank => {}
            }
        }
        cursor.fragment_offset = None;
        None
    }

    /// Select the next fragment at normal rate, running the cross-track
    /// discontinuity check. `other` is the other enabled track, if any.
    pub async fn select_next_fragment(
        &self,
        ctx: &StreamContext,
        cursor: &mut FetchCursor,
        other: Option<&Track>,
        ignore_discontinuity: bool,
    ) -> Option<FragmentPlan> {
        loop {
            let mut candidate = self.walk_next(ctx, cursor)?;
            if candidate.discontinuity {
                if ignore_discontinuity {
                    candidate.discontinuity = false;
                } else if let Some(other) = other {
                    let culled = self.culled_seconds();
                    let play_position = cursor.play_target - culled;
                    let pdt_position = candidate
                        .program_date_time
                        .as_deref()
                        .and_then(parse_program_date_time);
                    let position = pdt_position.unwrap_or(play_position);
                    info!(
                        track = self.name,
                        play_target = cursor.play_target,
                        culled,
                        use_start_time = pdt_position.is_some(),
                        "fragment carries discontinuity, probing other track"
                    );
                    match other
                        .has_discontinuity_around(
                            ctx,
                            position,
                            pdt_position.is_some(),
                            play_position,
                        )
                        .await
                    {
                        None => {
                            info!(
                                track = self.name,
                                "other track has no discontinuity nearby, clearing flag"
                            );
                            candidate.discontinuity = false;
                        }
                        Some(diff) if pdt_position.is_some() => {
                            // positive diff: the other track's marker is ahead
                            if diff > cursor.fragment_duration_seconds / 2.0 {
                                let playlist_position = cursor.playlist_position.unwrap_or(0.0);
                                info!(
                                    track = self.name,
                                    diff,
                                    from = cursor.play_target,
                                    to = playlist_position + diff,
                                    "other track's discontinuity ahead, skipping fragment"
                                );
                                cursor.sync_after_discontinuity = true;
                                cursor.play_target = playlist_position + diff;
                                continue;
                            }
                        }
                        Some(_) => {}
                    }
                }
            }
            cursor.discontinuity = candidate.discontinuity || cursor.sync_after_discontinuity;
            cursor.sync_after_discontinuity = false;
            return Some(FragmentPlan {
                uri: candidate.uri,
                byte_range: candidate.byte_range,
                discontinuity: cursor.discontinuity,
                fragment_duration_seconds: cursor.fragment_duration_seconds,
            });
        }
    }

    /// Probe for a discontinuity within the tolerance window around
    /// `position`. Waits across playlist refreshes (bounded) when the
    /// marker may not have arrived yet. Returns the signed distance from
    /// `position` in start-time mode.
    pub async fn has_discontinuity_around(
        &self,
        ctx: &StreamContext,
        position: f64,
        use_start_time: bool,
        play_position: f64,
    ) -> Option<f64> {
        let low = position - DISCONTINUITY_DISCARD_TOLERANCE_SECONDS;
        let high = position + DISCONTINUITY_DISCARD_TOLERANCE_SECONDS;
        let mut refresh_count = 0u32;

        while !ctx.token.is_cancelled() {
            let mut epoch_rx = self.index_epoch.subscribe();
            epoch_rx.borrow_and_update();

            let (found, duration) = {
                let mut playlist = self.playlist.lock().expect("track playlist poisoned");
                let duration = playlist.index.total_duration_seconds;
                let culled = playlist.culled_seconds;
                let last_matched = playlist.last_matched_discontinuity_position;
                let mut best: Option<f64> = None;
                let mut new_last_matched = None;
                for disc in &playlist.index.discontinuities {
                    let absolute = disc.position + culled;
                    if last_matched >= 0.0 && absolute <= last_matched {
                        continue;
                    }
                    if !use_start_time {
                        if low < disc.position && high > disc.position {
                            new_last_matched = Some(absolute);
                            best = Some(f64::MAX);
                            break;
                        }
                    } else if let Some(disc_time) = disc
                        .program_date_time
                        .as_deref()
                        .and_then(parse_program_date_time)
                    {
                        if low < disc_time && high > disc_time {
                            let diff = disc_time - position;
                            match best {
                                Some(current) if diff.abs() >= current.abs() => break,
                                _ => {
                                    best = Some(diff);
                                    new_last_matched = Some(absolute);
                                }
                            }
                        }
                    }
                }
                if let Some(matched) = new_last_matched {
                    playlist.last_matched_discontinuity_position = matched;
                }
                (best, duration)
            };
            if found.is_some() {
                return found;
            }

            let playlist_type = *ctx.playlist_type.lock().expect("playlist type poisoned");
            if playlist_type == Some(PlaylistType::Vod) {
                return None;
            }
            let (max_refresh_count, live_without_tsb) =
                if ctx.host.is_tsb_supported() || ctx.host.is_in_progress_cdvr() {
                    (MAX_PLAYLIST_REFRESH_FOR_DISCONTINUITY_CHECK_EVENT, false)
                } else {
                    (MAX_PLAYLIST_REFRESH_FOR_DISCONTINUITY_CHECK_LIVE, true)
                };
            let may_wait = refresh_count < max_refresh_count
                && (live_without_tsb
                    || duration < play_position + DISCONTINUITY_DISCARD_TOLERANCE_SECONDS);
            if !may_wait {
                info!(
                    track = self.name,
                    low, high, position, refresh_count,
                    "no discontinuity in window"
                );
                return None;
            }
            debug!(track = self.name, refresh_count, "waiting for playlist refresh");
            tokio::select! {
                _ = ctx.token.cancelled() => return None,
                changed = epoch_rx.changed() => {
                    if changed.is_err() {
                        return None;
                    }
                }
            }
            refresh_count += 1;
        }
        None
    }

    /// Relocate the fragment cursor after a live refresh, by media
    /// sequence number. Re-applies the governing key tag on multi-key
    /// playlists and heals sequence gaps.
    pub fn find_media_for_sequence_number(&self, cursor: &mut FetchCursor) {
        let playlist = self.playlist.lock().expect("track playlist poisoned");
        let text = &playlist.text;
        let target = cursor.next_media_sequence_number - 1;
        let multi_key = playlist.index.drm_key_tag_count > 1;

        let mut seq = 0i64;
        let mut last_key: Option<&str> = None;
        for (offset, line) in LineScanner::new(text) {
            match classify_line(line) {
                PlaylistLine::Tag(PlaylistTag::Inf { duration, .. }) => {
                    cursor.fragment_duration_seconds = duration;
                }
                PlaylistLine::Tag(PlaylistTag::MediaSequence(s)) => seq = s,
                PlaylistLine::Tag(PlaylistTag::Key(attrs)) => last_key = Some(attrs),
                PlaylistLine::Uri(_) => {
                    if seq >= target {
                        if multi_key
                            && let Some(attrs) = last_key
                            && let Err(e) = cursor.key.apply_key_attributes(attrs, self.name)
                        {
                            warn!(track = self.name, error = %e, "key tag rejected");
                        }
                        if seq != target {
                            warn!(track = self.name, seq, target, "sequence gap across refresh");
                            cursor.next_media_sequence_number = seq + 1;
                        }
                        cursor.fragment_offset = Some(offset);
                        return;
                    }
                    seq += 1;
                }
                _ => {}
            }
        }
        cursor.fragment_offset = None;
    }

    /// Trick-play selection from the fragment index of the I-frame
    /// playlist. Advances `cursor.current_idx` in the direction of `rate`
    /// to the first node crossing the play target.
    pub fn fragment_from_index(
        &self,
        ctx: &StreamContext,
        cursor: &mut FetchCursor,
        rate: f64,
        live_offset_seconds: f64,
    ) -> Option<FragmentPlan> {
        let playlist = self.playlist.lock().expect("track playlist poisoned");
        let index = &playlist.index;
        if index.nodes.is_empty() {
            return None;
        }

        let (found, idx) = if rate > 0.0 {
            let last = index.nodes.last()?;
            let seek_window_end =
                last.completion_time_seconds_from_start - live_offset_seconds;
            if ctx.host.is_live() && cursor.play_target > seek_window_end {
                info!(
                    track = self.name,
                    play_target = cursor.play_target,
                    seek_window_end,
                    "play target beyond live window, forcing EOS"
                );
                return None;
            }
            let start = cursor.current_idx.unwrap_or(0);
            let mut hit = None;
            for idx in start..index.nodes.len() {
                if index.nodes[idx].completion_time_seconds_from_start >= cursor.play_target {
                    hit = Some(idx);
                    break;
                }
            }
            (hit, hit.unwrap_or(0))
        } else {
            let start = cursor.current_idx.unwrap_or(index.nodes.len() - 1);
            let mut hit = None;
            for idx in (0..=start.min(index.nodes.len() - 1)).rev() {
                if index.nodes[idx].completion_time_seconds_from_start <= cursor.play_target {
                    hit = Some(idx);
                    break;
                }
            }
            (hit, hit.unwrap_or(0))
        };
        found?;

        cursor.current_idx = Some(idx);
        let node = &index.nodes[idx];
        cursor.fragment_duration_seconds = if idx > 0 {
            node.completion_time_seconds_from_start
                - index.nodes[idx - 1].completion_time_seconds_from_start
        } else {
            node.completion_time_seconds_from_start
        };

        // fragment info block: tag lines from the EXTINF down to the URI
        let mut byte_range = None;
        let mut uri = None;
        for (_, line) in LineScanner::from_offset(&playlist.text, node.byte_offset) {
            match classify_line(line) {
                PlaylistLine::Tag(PlaylistTag::ByteRange(body)) => {
                    byte_range = parse_byte_range(body);
                }
                PlaylistLine::Uri(value) => {
                    uri = Some(value.to_string());
                    break;
                }
                _ => {}
            }
        }
        let uri = match uri {
            Some(uri) => uri,
            None => {
                warn!(track = self.name, "no URI after indexed fragment info");
                return None;
            }
        };

        if node.drm_metadata_idx >= 0 {
            cursor.key.fragment_encrypted = true;
            cursor.current_metadata_idx = node.drm_metadata_idx;
        } else {
            // vanilla AES carries no metadata slot; the key context still
            // knows the method
            cursor.key.fragment_encrypted = cursor.key.method == crate::drm::DrmMethod::Aes128
                && index.drm_metadata.is_empty()
                && cursor.key.fragment_encrypted;
        }
        cursor.byte_range = byte_range;
        Some(FragmentPlan {
            uri,
            byte_range,
            discontinuity: false,
            fragment_duration_seconds: cursor.fragment_duration_seconds,
        })
    }

    /// Redownload and reindex the playlist, accounting culled content
    /// against the fragment the cursor sits on.
    pub async fn refresh_playlist(
        &self,
        ctx: &StreamContext,
        cursor: &mut FetchCursor,
    ) -> RefreshOutcome {
        // current, not next position: the next fragment typically isn't in
        // both the old and new playlist
        let common_play_position = cursor.next_media_sequence_number - 1;
        let prev_seconds_before_play_point = self
            .with_playlist(|p| p.index.completion_time_for_sequence(common_play_position));

        // stamped before the download to avoid back-to-back retries
        cursor.last_playlist_download = Some(Instant::now());

        let fetched = {
            let url = self.playlist_url.lock().expect("playlist url poisoned").clone();
            ctx.source
                .get_file(&url, None, self.kind, true, &ctx.token)
                .await
        };

        let (text, effective_url) = match fetched {
            Ok(file) => match String::from_utf8(file.body.to_vec()) {
                Ok(text) => (text, file.effective_url),
                Err(e) => {
                    warn!(track = self.name, error = %e, "refreshed playlist not UTF-8");
                    return RefreshOutcome {
                        success: false,
                        transient_network_failure: false,
                    };
                }
            },
            Err(e) => {
                if ctx.token.is_cancelled() {
                    return RefreshOutcome {
                        success: false,
                        transient_network_failure: false,
                    };
                }
                if e.is_transient_network() {
                    info!(track = self.name, error = %e, "transient network failure on refresh");
                    ctx.network_down.store(true, Ordering::Release);
                    return RefreshOutcome {
                        success: false,
                        transient_network_failure: true,
                    };
                }
                cursor.manifest_dl_fail_count += 1;
                warn!(
                    track = self.name,
                    failures = cursor.manifest_dl_fail_count,
                    error = %e,
                    "playlist refresh failed"
                );
                if cursor.fragment_offset.is_none()
                    && cursor.manifest_dl_fail_count
                        > crate::config::MAX_MANIFEST_DOWNLOAD_RETRY
                {
                    ctx.host
                        .send_download_error(DownloadErrorKind::Playlist, e.http_status());
                }
                return RefreshOutcome {
                    success: false,
                    transient_network_failure: false,
                };
            }
        };

        ctx.network_down.store(false, Ordering::Release);
        if let Some(harvest) = &ctx.harvest {
            let prefix = match (self.kind, ctx.trickplay_mode) {
                (TrackKind::Audio, _) => "aud-",
                (_, true) => "ifr-",
                _ => "vid-",
            };
            harvest.harvest(
                &self.playlist_url.lock().expect("playlist url poisoned"),
                text.as_bytes(),
                HarvestKind::Manifest,
                prefix,
            );
        }
        if self
            .index_and_install(ctx, cursor, text, effective_url)
            .is_err()
        {
            return RefreshOutcome {
                success: false,
                transient_network_failure: false,
            };
        }

        let (new_seconds_before_play_point, duration) = self.with_playlist(|p| {
            (
                p.index.completion_time_for_sequence(common_play_position),
                p.index.total_duration_seconds,
            )
        });
        if duration > 0.0 {
            let playlist_type = *ctx.playlist_type.lock().expect("playlist type poisoned");
            if playlist_type == Some(PlaylistType::Vod) {
                cursor.fragment_offset = Some(0);
                cursor.playlist_position = None;
            } else {
                self.find_media_for_sequence_number(cursor);
            }
            cursor.manifest_dl_fail_count = 0;
        }

        let culled =
            (prev_seconds_before_play_point - new_seconds_before_play_point).max(0.0);
        {
            let mut playlist = self.playlist.lock().expect("track playlist poisoned");
            playlist.culled_seconds += culled;
        }
        if self.kind == TrackKind::Video {
            trace!(track = self.name, culled, "refresh culling");
            ctx.host.update_culling_state(culled);
        }
        RefreshOutcome {
            success: true,
            transient_network_failure: false,
        }
    }
}

/// The URI line starting at `offset`, when there is one.
fn uri_line_at(text: &str, offset: usize) -> Option<&str> {
    let (_, line) = LineScanner::from_offset(text, offset).next()?;
    match classify_line(line) {
        PlaylistLine::Uri(uri) => Some(uri),
        _ => None,
    }
}
