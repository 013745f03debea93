// Session coordinator: tune sequence, live-edge adjustment, track
// lifecycle, and error escalation.

use crate::config::CollectorConfig;
use crate::drm::{DrmRegistry, LicenseProvider};
use crate::error::CollectorError;
use crate::events::{DownloadErrorKind, MediaMetadata, SessionHost, TrackKind};
use crate::harvest::{DirectoryHarvester, HarvestKind, HarvestSink};
use crate::http::{FragmentSource, RetryAction, resolve_url, retry_with_backoff};
use crate::index::PlaylistType;
use crate::master::{
    MasterManifest, StreamFormat, StreamInfo, format_from_fragment_extension,
};
use crate::output::{FragmentRing, FragmentSink};
use crate::pipeline::run_fetch_loop;
use crate::sync::{sync_tracks, sync_tracks_for_discontinuity};
use crate::track::{FetchCursor, Track};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TuneType {
    NewNormal,
    NewSeek,
    Seek,
    SeekToLive,
    Retune,
}

impl TuneType {
    pub fn is_new_tune(self) -> bool {
        matches!(self, TuneType::NewNormal | TuneType::NewSeek)
    }

    /// Deferred license scheduling only applies to fresh live tunes.
    pub fn allows_deferred_licensing(self) -> bool {
        matches!(self, TuneType::NewNormal | TuneType::SeekToLive)
    }
}

/// ABR profile selection policy. Indices refer to the master manifest's
/// stream table; implementations must skip I-frame-only variants.
pub trait AbrPolicy: Send + Sync {
    fn initial_profile(
        &self,
        streams: &[StreamInfo],
        persisted_bandwidth: Option<u64>,
    ) -> usize;

    /// Lower profile to retry a failed video fragment on, if any.
    fn rampdown_profile(
        &self,
        streams: &[StreamInfo],
        current: usize,
        http_status: u16,
    ) -> Option<usize>;

    /// Periodic profile change check at normal rate.
    fn next_profile(&self, streams: &[StreamInfo], current: usize) -> Option<usize>;
}

/// Bandwidth-threshold policy: start at the best profile within the
/// persisted (or a conservative default) bandwidth, ramp down one step on
/// persistent fragment failures.
pub struct DefaultAbrPolicy {
    pub default_bitrate: u64,
}

impl Default for DefaultAbrPolicy {
    fn default() -> Self {
        Self {
            default_bitrate: 2_500_000,
        }
    }
}

impl AbrPolicy for DefaultAbrPolicy {
    fn initial_profile(
        &self,
        streams: &[StreamInfo],
        persisted_bandwidth: Option<u64>,
    ) -> usize {
        let budget = persisted_bandwidth.unwrap_or(self.default_bitrate);
        let mut best: Option<usize> = None;
        let mut lowest: Option<usize> = None;
        for (idx, stream) in streams.iter().enumerate() {
            if stream.is_iframe_track {
                continue;
            }
            if lowest
                .map(|l| stream.bandwidth_bits_per_second < streams[l].bandwidth_bits_per_second)
                .unwrap_or(true)
            {
                lowest = Some(idx);
            }
            if stream.bandwidth_bits_per_second <= budget
                && best
                    .map(|b| {
                        stream.bandwidth_bits_per_second > streams[b].bandwidth_bits_per_second
                    })
                    .unwrap_or(true)
            {
                best = Some(idx);
            }
        }
        best.or(lowest).unwrap_or(0)
    }

    fn rampdown_profile(
        &self,
        streams: &[StreamInfo],
        current: usize,
        _http_status: u16,
    ) -> Option<usize> {
        let current_bandwidth = streams.get(current)?.bandwidth_bits_per_second;
        let mut candidate: Option<usize> = None;
        for (idx, stream) in streams.iter().enumerate() {
            if stream.is_iframe_track
                || stream.bandwidth_bits_per_second >= current_bandwidth
            {
                continue;
            }
            if candidate
                .map(|c| {
                    stream.bandwidth_bits_per_second > streams[c].bandwidth_bits_per_second
                })
                .unwrap_or(true)
            {
                candidate = Some(idx);
            }
        }
        candidate
    }

    fn next_profile(&self, _streams: &[StreamInfo], _current: usize) -> Option<usize> {
        None
    }
}

pub struct ProfileState {
    pub master: MasterManifest,
    pub current_profile: usize,
    pub last_selected_profile: usize,
    pub iframe_profile: Option<usize>,
}

/// Shared state every track and pipeline task sees.
pub struct StreamContext {
    pub config: Arc<CollectorConfig>,
    pub source: Arc<dyn FragmentSource>,
    pub host: Arc<dyn SessionHost>,
    pub registry: Arc<DrmRegistry>,
    pub harvest: Option<Arc<dyn HarvestSink>>,
    pub abr: Arc<dyn AbrPolicy>,
    pub token: CancellationToken,
    pub rate: f64,
    pub trickplay_mode: bool,
    pub trick_play_fps: u32,
    pub tune_type: TuneType,
    pub manifest_url: Mutex<String>,
    pub playlist_type: Mutex<Option<PlaylistType>>,
    pub has_end_list: AtomicBool,
    pub network_down: AtomicBool,
    pub number_of_tracks: AtomicUsize,
    pub max_interval_between_playlist_updates_ms: AtomicU64,
    pub first_fragment_decrypted: AtomicBool,
    pub profiles: Mutex<ProfileState>,
    pub stream_formats: Mutex<[StreamFormat; 2]>,
}

impl StreamContext {
    pub fn current_profile(&self) -> (usize, StreamInfo) {
        let profiles = self.profiles.lock().expect("profiles poisoned");
        (
            profiles.current_profile,
            profiles.master.streams[profiles.current_profile].clone(),
        )
    }

    pub fn is_vod(&self) -> bool {
        *self.playlist_type.lock().expect("playlist type poisoned") == Some(PlaylistType::Vod)
    }
}

pub struct SessionParams {
    pub manifest_url: String,
    pub seek_position_seconds: f64,
    pub rate: f64,
    pub tune_type: TuneType,
    pub config: CollectorConfig,
    pub source: Arc<dyn FragmentSource>,
    pub host: Arc<dyn SessionHost>,
    pub sink: Arc<dyn FragmentSink>,
    pub license_provider: Option<Arc<dyn LicenseProvider>>,
    pub abr: Option<Arc<dyn AbrPolicy>>,
}

pub struct HlsSession {
    ctx: Arc<StreamContext>,
    sink: Arc<dyn FragmentSink>,
    video: Arc<Track>,
    audio: Arc<Track>,
    cursors: Option<(FetchCursor, FetchCursor)>,
    seek_position_seconds: f64,
    handles: Vec<JoinHandle<()>>,
}

impl HlsSession {
    pub fn new(params: SessionParams) -> Self {
        let token = CancellationToken::new();
        let registry = Arc::new(DrmRegistry::new(
            Arc::clone(&params.source),
            params.license_provider.clone(),
            token.clone(),
        ));
        let harvest: Option<Arc<dyn HarvestSink>> = params
            .config
            .harvest
            .clone()
            .map(|cfg| Arc::new(DirectoryHarvester::new(cfg)) as Arc<dyn HarvestSink>);
        let trickplay_mode = params.rate != crate::config::NORMAL_PLAY_RATE;
        let trick_play_fps = if params.host.is_tsb_supported() {
            params.config.linear_trick_play_fps
        } else {
            params.config.vod_trick_play_fps
        };
        let ctx = Arc::new(StreamContext {
            config: Arc::new(params.config),
            source: params.source,
            host: params.host,
            registry,
            harvest,
            abr: params
                .abr
                .unwrap_or_else(|| Arc::new(DefaultAbrPolicy::default())),
            token,
            rate: params.rate,
            trickplay_mode,
            trick_play_fps,
            tune_type: params.tune_type,
            manifest_url: Mutex::new(params.manifest_url),
            playlist_type: Mutex::new(None),
            has_end_list: AtomicBool::new(false),
            network_down: AtomicBool::new(false),
            number_of_tracks: AtomicUsize::new(0),
            max_interval_between_playlist_updates_ms: AtomicU64::new(
                crate::config::MAX_DELAY_BETWEEN_PLAYLIST_UPDATE_MS,
            ),
            first_fragment_decrypted: AtomicBool::new(false),
            profiles: Mutex::new(ProfileState {
                master: MasterManifest::default(),
                current_profile: 0,
                last_selected_profile: 0,
                iframe_profile: None,
            }),
            stream_formats: Mutex::new([StreamFormat::None, StreamFormat::None]),
        });
        Self {
            ctx,
            sink: params.sink,
            video: Arc::new(Track::new(TrackKind::Video, "video")),
            audio: Arc::new(Track::new(TrackKind::Audio, "audio")),
            cursors: None,
            seek_position_seconds: params.seek_position_seconds,
            handles: Vec::new(),
        }
    }

    pub fn context(&self) -> &Arc<StreamContext> {
        &self.ctx
    }

    /// Tune: fetch and parse the master manifest, select profiles and
    /// renditions, index both media playlists, synchronize the tracks and
    /// position them for playback.
    pub async fn init(&mut self) -> Result<(), CollectorError> {
        let ctx = Arc::clone(&self.ctx);
        let tune_type = ctx.tune_type;
        let new_tune = tune_type.is_new_tune();
        if new_tune {
            ctx.registry.reset_all();
        }

        // master manifest, retrying 404s with fixed spacing
        let manifest_url = ctx.manifest_url.lock().expect("manifest url poisoned").clone();
        let master_file = retry_with_backoff(&ctx.config.playlist_retry, &ctx.token, |_| {
            let url = manifest_url.clone();
            let ctx = Arc::clone(&ctx);
            async move {
                match ctx
                    .source
                    .get_file(&url, None, TrackKind::Video, true, &ctx.token)
                    .await
                {
                    Ok(file) => RetryAction::Success(file),
                    Err(e) if e.http_status() == 404 => RetryAction::Retry(e),
                    Err(e) => RetryAction::Fail(e),
                }
            }
        })
        .await;
        let master_file = match master_file {
            Ok(file) => file,
            Err(e) => {
                let status = e.http_status();
                ctx.host
                    .send_download_error(DownloadErrorKind::Manifest, status);
                return Err(CollectorError::ManifestDownloadFailed { status });
            }
        };
        *ctx.manifest_url.lock().expect("manifest url poisoned") =
            master_file.effective_url.clone();
        let master_text = String::from_utf8(master_file.body.to_vec()).map_err(|e| {
            CollectorError::InvalidManifest {
                reason: format!("master manifest is not UTF-8: {e}"),
            }
        })?;
        if let Some(harvest) = &ctx.harvest {
            harvest.harvest(
                &master_file.effective_url,
                master_text.as_bytes(),
                HarvestKind::Manifest,
                "main-",
            );
        }

        let master = MasterManifest::parse(&master_text).inspect_err(|e| {
            ctx.host.send_error(e, true);
        })?;
        if master.streams.is_empty() {
            let e = CollectorError::InvalidManifest {
                reason: "master manifest has no variant streams".to_string(),
            };
            ctx.host.send_error(&e, true);
            return Err(e);
        }

        // initial profile: resume-bitrate aware on retunes
        let persisted = if new_tune {
            None
        } else {
            ctx.host.persisted_bandwidth()
        };
        let initial_profile = ctx.abr.initial_profile(&master.streams, persisted);
        let iframe_profile = master.iframe_profile();
        let has_drm = master.has_drm_metadata;
        let has_iframe = master.has_iframe_track();
        let languages = master.audio_languages();
        let bitrates = master.bitrates();
        info!(
            profile = initial_profile,
            bandwidth = master.streams[initial_profile].bandwidth_bits_per_second,
            variants = master.streams.len(),
            renditions = master.media.len(),
            "master manifest parsed"
        );

        // playlist URI selection per track
        let profile = master.streams[initial_profile].clone();
        let video_selection = if ctx.trickplay_mode && iframe_profile.is_some() {
            master.track_selection(
                TrackKind::Video,
                &master.streams[iframe_profile.unwrap_or(initial_profile)],
                "",
            )
        } else {
            master.track_selection(TrackKind::Video, &profile, "")
        };
        let audio_selection = if ctx.trickplay_mode {
            debug!("audio disabled for trick play");
            None
        } else {
            master.track_selection(
                TrackKind::Audio,
                &profile,
                &ctx.config.preferred_audio_language,
            )
        };
        if audio_selection.is_none() && !ctx.trickplay_mode {
            // no matching rendition: the session runs muxed audio
            ctx.host.update_audio_language_selection("en");
        }

        {
            let mut profiles = ctx.profiles.lock().expect("profiles poisoned");
            profiles.master = master;
            profiles.current_profile = initial_profile;
            profiles.last_selected_profile = initial_profile;
            profiles.iframe_profile = iframe_profile;
        }

        let manifest_base = ctx.manifest_url.lock().expect("manifest url poisoned").clone();
        let mut formats = [StreamFormat::None, StreamFormat::None];
        if let Some(selection) = &video_selection {
            *self.video.playlist_url.lock().expect("playlist url poisoned") =
                resolve_url(&manifest_base, &selection.uri)?;
            self.video.enabled.store(true, Ordering::Release);
            formats[TrackKind::Video.index()] = selection.format;
        }
        if let Some(selection) = &audio_selection {
            if let Some(language) = &selection.selected_language {
                ctx.host.update_audio_language_selection(language);
            }
            if selection.format != StreamFormat::None {
                *self.audio.playlist_url.lock().expect("playlist url poisoned") =
                    resolve_url(&manifest_base, &selection.uri)?;
                self.audio.enabled.store(true, Ordering::Release);
                formats[TrackKind::Audio.index()] = selection.format;
            } else {
                info!("audio rendition format undetermined, track disabled");
            }
        }
        let enabled_tracks =
            self.video.is_enabled() as usize + self.audio.is_enabled() as usize;
        if enabled_tracks == 0 {
            let e = CollectorError::InvalidManifest {
                reason: "no playable track in master manifest".to_string(),
            };
            ctx.host.send_error(&e, true);
            return Err(e);
        }
        ctx.number_of_tracks.store(enabled_tracks, Ordering::Release);

        // media playlists, concurrently when configured
        let mut video_cursor = FetchCursor {
            play_target: self.seek_position_seconds,
            ..FetchCursor::default()
        };
        let mut audio_cursor = FetchCursor {
            play_target: self.seek_position_seconds,
            ..FetchCursor::default()
        };
        let (video_playlist, audio_playlist) = if self.video.is_enabled()
            && self.audio.is_enabled()
            && ctx.config.parallel_playlist_fetch
        {
            let (v, a) = tokio::join!(
                self.video.fetch_playlist(&ctx),
                self.audio.fetch_playlist(&ctx)
            );
            (Some(v), Some(a))
        } else {
            let v = if self.video.is_enabled() {
                Some(self.video.fetch_playlist(&ctx).await)
            } else {
                None
            };
            let a = if self.audio.is_enabled() {
                Some(self.audio.fetch_playlist(&ctx).await)
            } else {
                None
            };
            (v, a)
        };
        for (track, cursor, fetched) in [
            (&self.video, &mut video_cursor, video_playlist),
            (&self.audio, &mut audio_cursor, audio_playlist),
        ] {
            let Some(fetched) = fetched else { continue };
            let (text, effective_url) = match fetched {
                Ok(ok) => ok,
                Err(e) => {
                    let status = e.http_status();
                    warn!(track = track.name, error = %e, "playlist download failed");
                    ctx.host
                        .send_download_error(DownloadErrorKind::Playlist, status);
                    return Err(CollectorError::ManifestDownloadFailed { status });
                }
            };
            if let Some(harvest) = &ctx.harvest {
                let prefix = match (track.kind, ctx.trickplay_mode) {
                    (TrackKind::Audio, _) => "aud-",
                    (_, true) => "ifr-",
                    _ => "vid-",
                };
                harvest.harvest(
                    &track.playlist_url.lock().expect("playlist url poisoned"),
                    text.as_bytes(),
                    HarvestKind::Manifest,
                    prefix,
                );
            }
            track.index_and_install(&ctx, cursor, text, effective_url)?;
            if track.duration() == 0.0 {
                let e = CollectorError::ManifestContentError;
                ctx.host.send_error(&e, true);
                return Err(e);
            }
            // container format from the first fragment's extension wins
            // over the codec-derived guess
            let by_extension =
                track.with_playlist(|p| format_from_fragment_extension(&p.text));
            if matches!(by_extension, StreamFormat::IsoBmff | StreamFormat::AudioEsAac) {
                formats[track.kind.index()] = by_extension;
            }
        }
        *ctx.stream_formats.lock().expect("formats poisoned") = formats;

        if new_tune {
            let metadata = MediaMetadata {
                duration_ms: (self.video.duration() * 1000.0) as u64,
                languages,
                bitrates,
                has_drm,
                has_iframe_track: has_iframe,
            };
            ctx.host.send_media_metadata(metadata);
        }

        // live adjust / seek window checks
        let playlist_type = *ctx.playlist_type.lock().expect("playlist type poisoned");
        let mut live_adjust = tune_type == TuneType::NewNormal
            && playlist_type.is_none()
            && !ctx.host.is_in_progress_cdvr();
        if tune_type == TuneType::SeekToLive && ctx.host.is_live() {
            info!("seek to live: resetting play targets");
            live_adjust = true;
            video_cursor.play_target = 0.0;
            audio_cursor.play_target = 0.0;
            ctx.host.notify_entering_live();
        } else if matches!(
            tune_type,
            TuneType::Seek | TuneType::Retune | TuneType::NewSeek
        ) && ctx.rate > 0.0
        {
            let mut seek_window_end = self.video.duration();
            if ctx.host.is_live() {
                seek_window_end -= ctx.config.live_offset_seconds;
            }
            if video_cursor.play_target > seek_window_end {
                if ctx.host.is_live() {
                    info!(
                        play_target = video_cursor.play_target,
                        seek_window_end, "seek beyond live window, adjusting to live edge"
                    );
                    live_adjust = true;
                    video_cursor.play_target = 0.0;
                    audio_cursor.play_target = 0.0;
                    if tune_type == TuneType::Seek {
                        ctx.host.notify_entering_live();
                    }
                } else {
                    video_cursor.eos_reached = true;
                    video_cursor.fragment_offset = None;
                    audio_cursor.eos_reached = true;
                    audio_cursor.fragment_offset = None;
                    let e = CollectorError::SeekRangeError {
                        target_seconds: video_cursor.play_target,
                        window_seconds: seek_window_end,
                    };
                    ctx.host.send_error(&e, true);
                    return Err(e);
                }
            }
        }

        // track synchronization
        if self.audio.is_enabled() && self.video.is_enabled() {
            if playlist_type == Some(PlaylistType::Vod) {
                if let Err(e) = sync_tracks_for_discontinuity(
                    &self.video,
                    &self.audio,
                    &video_cursor,
                    &mut audio_cursor,
                ) {
                    debug!(error = %e, "VOD discontinuity sync unavailable");
                }
            } else {
                let mut sync_done = false;
                let video_periods = self.video.with_playlist(|p| p.index.number_of_periods());
                let audio_periods = self.audio.with_playlist(|p| p.index.number_of_periods());
                if !live_adjust && video_periods > 0 && video_periods == audio_periods {
                    sync_done = sync_tracks_for_discontinuity(
                        &self.video,
                        &self.audio,
                        &video_cursor,
                        &mut audio_cursor,
                    )
                    .is_ok();
                }
                if !sync_done {
                    sync_tracks(
                        &ctx,
                        &self.video,
                        &self.audio,
                        &mut video_cursor,
                        &mut audio_cursor,
                        ctx.config.sync_using_start_time,
                    )
                    .await?;
                }
            }
        }

        // live-edge adjust: minimum of the per-track offsets to live
        if live_adjust {
            let offset_from_live = ctx.config.live_offset_seconds;
            let video_duration = self.video.duration();
            if video_duration > offset_from_live + video_cursor.play_target_offset {
                let offset_to_live_video =
                    video_duration - offset_from_live - video_cursor.play_target_offset;
                let mut offset_to_live = offset_to_live_video;
                if self.audio.is_enabled() {
                    let audio_duration = self.audio.duration();
                    let offset_to_live_audio = if audio_duration
                        > offset_from_live + audio_cursor.play_target_offset
                    {
                        audio_duration - offset_from_live - audio_cursor.play_target_offset
                    } else {
                        warn!(
                            audio_duration,
                            "audio too short for live adjust, starting from beginning"
                        );
                        0.0
                    };
                    offset_to_live = offset_to_live_video.min(offset_to_live_audio);
                }
                video_cursor.play_target += offset_to_live;
                if self.audio.is_enabled() {
                    audio_cursor.play_target += offset_to_live;
                }
                info!(
                    video_play_target = video_cursor.play_target,
                    audio_play_target = audio_cursor.play_target,
                    offset_to_live,
                    "live adjust applied"
                );
            } else {
                warn!(
                    video_duration,
                    offset_from_live, "live adjust not possible, playlist too short"
                );
            }
        }

        // discontinuity-period alignment for live content
        if self.audio.is_enabled() && playlist_type != Some(PlaylistType::Vod) {
            let video_periods = self.video.with_playlist(|p| p.index.number_of_periods());
            let audio_periods = self.audio.with_playlist(|p| p.index.number_of_periods());
            if video_periods > 0 && video_periods == audio_periods {
                if live_adjust
                    && let Err(e) = sync_tracks_for_discontinuity(
                        &self.video,
                        &self.audio,
                        &video_cursor,
                        &mut audio_cursor,
                    )
                {
                    debug!(error = %e, "post-adjust discontinuity sync unavailable");
                }
                let video_discs = self
                    .video
                    .with_playlist(|p| p.index.discontinuities.clone());
                let audio_discs = self
                    .audio
                    .with_playlist(|p| p.index.discontinuities.clone());
                let video_end = self.video.duration();
                let audio_end = self.audio.duration();
                let mut video_prev = 0.0f64;
                let mut audio_prev = 0.0f64;
                for i in 0..=video_periods {
                    let (video_next, audio_next) = if i < video_periods {
                        (video_discs[i].position, audio_discs[i].position)
                    } else {
                        (video_end, audio_end)
                    };
                    if video_next > video_cursor.play_target + 5.0
                        && audio_next > audio_cursor.play_target + 5.0
                    {
                        if video_cursor.play_target < video_prev {
                            info!(
                                from = video_cursor.play_target,
                                to = video_prev,
                                "video play target advanced to period boundary"
                            );
                            video_cursor.play_target = video_prev;
                        }
                        if audio_cursor.play_target < audio_prev {
                            info!(
                                from = audio_cursor.play_target,
                                to = audio_prev,
                                "audio play target advanced to period boundary"
                            );
                            audio_cursor.play_target = audio_prev;
                        }
                        break;
                    }
                    video_prev = video_next;
                    audio_prev = audio_next;
                }
            } else if video_periods > 0 {
                debug!(
                    video_periods,
                    audio_periods, "period counts differ, skipping alignment"
                );
            }
        }

        // pre-warm the current period's licenses
        if self.audio.is_enabled() {
            self.audio
                .process_drm_metadata(&ctx, &mut audio_cursor, true);
        }
        if self.video.is_enabled() {
            self.video
                .process_drm_metadata(&ctx, &mut video_cursor, true);
        }

        let now = Instant::now();
        video_cursor.last_playlist_download = Some(now);
        audio_cursor.last_playlist_download = Some(now);
        self.cursors = Some((video_cursor, audio_cursor));
        Ok(())
    }

    /// Spawn one fragment-collector task and one injector task per enabled
    /// track.
    pub fn start(&mut self) {
        let Some((video_cursor, audio_cursor)) = self.cursors.take() else {
            warn!("start called before init");
            return;
        };
        for (track, other, cursor) in [
            (
                Arc::clone(&self.video),
                Arc::clone(&self.audio),
                video_cursor,
            ),
            (
                Arc::clone(&self.audio),
                Arc::clone(&self.video),
                audio_cursor,
            ),
        ] {
            if !track.is_enabled() {
                continue;
            }
            let other = other.is_enabled().then_some(other);
            let (ring, injector) = FragmentRing::start(
                track.kind,
                self.ctx.config.max_cached_fragments_per_track,
                Arc::clone(&self.sink),
                self.ctx.token.clone(),
            );
            let ctx = Arc::clone(&self.ctx);
            let collector =
                tokio::spawn(
                    async move { run_fetch_loop(track, other, cursor, ring, ctx).await },
                );
            self.handles.push(collector);
            self.handles.push(injector);
        }
    }

    /// Stop the session: disable downloads, wake all waiters, join the
    /// tasks and optionally release all DRM state.
    pub async fn stop(&mut self, clear_channel_data: bool) {
        self.ctx.token.cancel();
        self.video.stop_wait_for_playlist_refresh();
        self.audio.stop_wait_for_playlist_refresh();
        self.ctx.registry.cancel_wait_all();
        for handle in self.handles.drain(..) {
            let _ = handle.await;
        }
        if clear_channel_data {
            self.ctx.registry.reset_all();
        } else {
            self.ctx.registry.restore_key_state();
        }
        info!(clear_channel_data, "session stopped");
    }
}

#[cfg(test)]
pub mod test_support {
    use super::*;
    use crate::http::{ByteRange, FetchedFile};
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::collections::HashMap;
    use std::sync::Mutex as StdMutex;

    /// Source with no content; tests that only exercise parsing use it.
    pub struct EmptySource;

    #[async_trait]
    impl FragmentSource for EmptySource {
        async fn get_file(
            &self,
            url: &str,
            _byte_range: Option<ByteRange>,
            _track: TrackKind,
            _is_manifest: bool,
            _token: &CancellationToken,
        ) -> Result<FetchedFile, CollectorError> {
            Err(CollectorError::HttpStatus {
                status: reqwest::StatusCode::NOT_FOUND,
                url: url.to_string(),
            })
        }
    }

    /// In-memory CDN keyed by absolute URL.
    #[derive(Default)]
    pub struct MapSource {
        pub files: StdMutex<HashMap<String, Bytes>>,
    }

    impl MapSource {
        pub fn insert(&self, url: &str, body: impl Into<Bytes>) {
            self.files
                .lock()
                .unwrap()
                .insert(url.to_string(), body.into());
        }
    }

    #[async_trait]
    impl FragmentSource for MapSource {
        async fn get_file(
            &self,
            url: &str,
            _byte_range: Option<ByteRange>,
            _track: TrackKind,
            _is_manifest: bool,
            _token: &CancellationToken,
        ) -> Result<FetchedFile, CollectorError> {
            match self.files.lock().unwrap().get(url) {
                Some(body) => Ok(FetchedFile {
                    body: body.clone(),
                    effective_url: url.to_string(),
                    status: 200,
                }),
                None => Err(CollectorError::HttpStatus {
                    status: reqwest::StatusCode::NOT_FOUND,
                    url: url.to_string(),
                }),
            }
        }
    }

    /// Host recording every interaction.
    #[derive(Default)]
    pub struct RecordingHost {
        pub live: AtomicBool,
        pub position_ms: std::sync::atomic::AtomicI64,
        pub duration: StdMutex<f64>,
        pub culled: StdMutex<Vec<f64>>,
        pub errors: StdMutex<Vec<(String, bool)>>,
        pub download_errors: StdMutex<Vec<(DownloadErrorKind, u16)>>,
        pub media_metadata: StdMutex<Vec<MediaMetadata>>,
        pub timed_metadata: StdMutex<Vec<crate::events::TimedMetadata>>,
        pub first_fragment_decrypted: std::sync::atomic::AtomicU32,
        pub entered_live: AtomicBool,
        pub languages: StdMutex<Vec<String>>,
    }

    impl SessionHost for RecordingHost {
        fn is_live(&self) -> bool {
            self.live.load(Ordering::Acquire)
        }
        fn set_is_live(&self, live: bool) {
            self.live.store(live, Ordering::Release);
        }
        fn position_ms(&self) -> i64 {
            self.position_ms.load(Ordering::Acquire)
        }
        fn update_duration(&self, duration_seconds: f64) {
            *self.duration.lock().unwrap() = duration_seconds;
        }
        fn update_culling_state(&self, culled_seconds: f64) {
            self.culled.lock().unwrap().push(culled_seconds);
        }
        fn send_download_error(&self, kind: DownloadErrorKind, http_status: u16) {
            self.download_errors.lock().unwrap().push((kind, http_status));
        }
        fn send_error(&self, error: &CollectorError, fatal: bool) {
            self.errors.lock().unwrap().push((error.to_string(), fatal));
        }
        fn send_media_metadata(&self, metadata: MediaMetadata) {
            self.media_metadata.lock().unwrap().push(metadata);
        }
        fn send_timed_metadata(&self, metadata: crate::events::TimedMetadata) {
            self.timed_metadata.lock().unwrap().push(metadata);
        }
        fn notify_first_fragment_decrypted(&self) {
            self.first_fragment_decrypted.fetch_add(1, Ordering::Relaxed);
        }
        fn notify_entering_live(&self) {
            self.entered_live.store(true, Ordering::Release);
        }
        fn update_audio_language_selection(&self, language: &str) {
            self.languages.lock().unwrap().push(language.to_string());
        }
    }

    /// Context with inert collaborators, for track/sync level tests.
    pub fn test_context() -> Arc<StreamContext> {
        test_context_with(Arc::new(EmptySource), Arc::new(RecordingHost::default()))
    }

    pub fn test_context_with(
        source: Arc<dyn FragmentSource>,
        host: Arc<dyn SessionHost>,
    ) -> Arc<StreamContext> {
        let token = CancellationToken::new();
        let registry = Arc::new(DrmRegistry::new(Arc::clone(&source), None, token.clone()));
        Arc::new(StreamContext {
            config: Arc::new(CollectorConfig::default()),
            source,
            host,
            registry,
            harvest: None,
            abr: Arc::new(DefaultAbrPolicy::default()),
            token,
            rate: crate::config::NORMAL_PLAY_RATE,
            trickplay_mode: false,
            trick_play_fps: 4,
            tune_type: TuneType::NewNormal,
            manifest_url: Mutex::new("https://cdn.example.com/master.m3u8".to_string()),
            playlist_type: Mutex::new(None),
            has_end_list: AtomicBool::new(false),
            network_down: AtomicBool::new(false),
            number_of_tracks: AtomicUsize::new(1),
            max_interval_between_playlist_updates_ms: AtomicU64::new(
                crate::config::MAX_DELAY_BETWEEN_PLAYLIST_UPDATE_MS,
            ),
            first_fragment_decrypted: AtomicBool::new(false),
            profiles: Mutex::new(ProfileState {
                master: MasterManifest::default(),
                current_profile: 0,
                last_selected_profile: 0,
                iframe_profile: None,
            }),
            stream_formats: Mutex::new([StreamFormat::None, StreamFormat::None]),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::output::CachedFragment;
    use bytes::Bytes;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingSink {
        fragments: StdMutex<Vec<(TrackKind, CachedFragment)>>,
    }

    impl FragmentSink for RecordingSink {
        fn send_fragment(&self, track: TrackKind, fragment: CachedFragment) -> bool {
            self.fragments.lock().unwrap().push((track, fragment));
            false
        }
    }

    const BASE: &str = "https://cdn.example.com";

    fn master_with_audio() -> String {
        "#EXTM3U\n\
#EXT-X-MEDIA:TYPE=AUDIO,GROUP-ID=\"aud\",NAME=\"English\",LANGUAGE=\"en\",DEFAULT=YES,URI=\"audio.m3u8\"\n\
#EXT-X-STREAM-INF:BANDWIDTH=2000000,CODECS=\"avc1.4d401f,mp4a.40.2\",AUDIO=\"aud\"\n\
video.m3u8\n"
            .to_string()
    }

    fn vod_media_playlist(fragments: usize, duration: f64, prefix: &str) -> String {
        let mut text =
            String::from("#EXTM3U\n#EXT-X-TARGETDURATION:6\n#EXT-X-MEDIA-SEQUENCE:0\n#EXT-X-PLAYLIST-TYPE:VOD\n");
        for i in 0..fragments {
            text.push_str(&format!("#EXTINF:{duration},\n{prefix}{i}.ts\n"));
        }
        text.push_str("#EXT-X-ENDLIST\n");
        text
    }

    fn populate_vod(source: &MapSource, fragments: usize, duration: f64) {
        source.insert(&format!("{BASE}/master.m3u8"), master_with_audio());
        source.insert(
            &format!("{BASE}/video.m3u8"),
            vod_media_playlist(fragments, duration, "v"),
        );
        source.insert(
            &format!("{BASE}/audio.m3u8"),
            vod_media_playlist(fragments, duration, "a"),
        );
        for i in 0..fragments {
            source.insert(&format!("{BASE}/v{i}.ts"), Bytes::from(vec![0u8; 188]));
            source.insert(&format!("{BASE}/a{i}.ts"), Bytes::from(vec![1u8; 188]));
        }
    }

    fn session(
        source: Arc<MapSource>,
        host: Arc<RecordingHost>,
        sink: Arc<RecordingSink>,
        seek: f64,
        tune_type: TuneType,
    ) -> HlsSession {
        HlsSession::new(SessionParams {
            manifest_url: format!("{BASE}/master.m3u8"),
            seek_position_seconds: seek,
            rate: 1.0,
            tune_type,
            config: CollectorConfig::default(),
            source,
            host,
            sink,
            license_provider: None,
            abr: None,
        })
    }

    async fn wait_for_fragments(sink: &RecordingSink, count: usize) {
        for _ in 0..200 {
            if sink.fragments.lock().unwrap().len() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn basic_vod_delivers_all_fragments_in_order() {
        let source = Arc::new(MapSource::default());
        populate_vod(&source, 10, 6.0);
        let host = Arc::new(RecordingHost::default());
        let sink = Arc::new(RecordingSink::default());

        let mut session = session(source, host.clone(), sink.clone(), 0.0, TuneType::NewNormal);
        session.init().await.unwrap();
        assert!((session.video.duration() - 60.0).abs() < 1e-6);
        assert!(!host.is_live());

        session.start();
        wait_for_fragments(&sink, 20).await;
        session.stop(true).await;

        let fragments = sink.fragments.lock().unwrap();
        let video_positions: Vec<f64> = fragments
            .iter()
            .filter(|(track, _)| *track == TrackKind::Video)
            .map(|(_, f)| f.position)
            .collect();
        assert_eq!(video_positions.len(), 10);
        assert_eq!(video_positions[0], 0.0);
        assert_eq!(video_positions[9], 54.0);
        for pair in video_positions.windows(2) {
            assert!(pair[1] >= pair[0]);
        }

        let metadata = host.media_metadata.lock().unwrap();
        assert_eq!(metadata.len(), 1);
        assert_eq!(metadata[0].duration_ms, 60_000);
        assert_eq!(metadata[0].languages, vec!["en"]);
        assert!(!metadata[0].has_drm);
    }

    #[tokio::test]
    async fn seek_beyond_vod_window_is_a_range_error() {
        let source = Arc::new(MapSource::default());
        populate_vod(&source, 25, 6.0); // 150s asset
        let host = Arc::new(RecordingHost::default());
        let sink = Arc::new(RecordingSink::default());

        let mut session = session(source, host, sink.clone(), 200.0, TuneType::NewSeek);
        let err = session.init().await.unwrap_err();
        assert!(matches!(err, CollectorError::SeekRangeError { .. }));
        session.start();
        session.stop(false).await;
        assert!(sink.fragments.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn missing_master_manifest_reports_download_failure() {
        let source = Arc::new(MapSource::default());
        let host = Arc::new(RecordingHost::default());
        let sink = Arc::new(RecordingSink::default());
        let mut session = session(source, host.clone(), sink, 0.0, TuneType::NewNormal);
        let err = session.init().await.unwrap_err();
        assert!(matches!(err, CollectorError::ManifestDownloadFailed { status: 404 }));
        let download_errors = host.download_errors.lock().unwrap();
        assert_eq!(download_errors[0].0, DownloadErrorKind::Manifest);
    }

    #[tokio::test]
    async fn empty_media_playlist_is_a_content_error() {
        let source = Arc::new(MapSource::default());
        source.insert(&format!("{BASE}/master.m3u8"), master_with_audio());
        source.insert(
            &format!("{BASE}/video.m3u8"),
            "#EXTM3U\n#EXT-X-TARGETDURATION:6\n#EXT-X-ENDLIST\n",
        );
        source.insert(
            &format!("{BASE}/audio.m3u8"),
            vod_media_playlist(5, 6.0, "a"),
        );
        let host = Arc::new(RecordingHost::default());
        let sink = Arc::new(RecordingSink::default());
        let mut session = session(source, host, sink, 0.0, TuneType::NewNormal);
        let err = session.init().await.unwrap_err();
        assert!(matches!(err, CollectorError::ManifestContentError));
    }

    #[tokio::test]
    async fn default_abr_policy_selects_within_budget() {
        let streams = vec![
            StreamInfo {
                bandwidth_bits_per_second: 800_000,
                ..StreamInfo::default()
            },
            StreamInfo {
                bandwidth_bits_per_second: 2_400_000,
                ..StreamInfo::default()
            },
            StreamInfo {
                bandwidth_bits_per_second: 6_000_000,
                ..StreamInfo::default()
            },
        ];
        let policy = DefaultAbrPolicy::default();
        assert_eq!(policy.initial_profile(&streams, None), 1);
        assert_eq!(policy.initial_profile(&streams, Some(700_000)), 0);
        assert_eq!(policy.rampdown_profile(&streams, 1, 503), Some(0));
        assert_eq!(policy.rampdown_profile(&streams, 0, 503), None);
    }

    #[tokio::test]
    async fn fmp4_extension_overrides_format() {
        let source = Arc::new(MapSource::default());
        source.insert(&format!("{BASE}/master.m3u8"), master_with_audio());
        let mut video = String::from(
            "#EXTM3U\n#EXT-X-TARGETDURATION:6\n#EXT-X-PLAYLIST-TYPE:VOD\n\
#EXT-X-MAP:URI=\"init.mp4\"\n",
        );
        video.push_str("#EXTINF:6,\nv0.mp4\n#EXT-X-ENDLIST\n");
        source.insert(&format!("{BASE}/video.m3u8"), video);
        source.insert(
            &format!("{BASE}/audio.m3u8"),
            vod_media_playlist(1, 6.0, "a"),
        );
        source.insert(&format!("{BASE}/init.mp4"), Bytes::from_static(b"ftypinit"));
        source.insert(&format!("{BASE}/v0.mp4"), Bytes::from_static(b"moofmdat"));
        source.insert(&format!("{BASE}/a0.ts"), Bytes::from_static(b"ts"));

        let host = Arc::new(RecordingHost::default());
        let sink = Arc::new(RecordingSink::default());
        let mut session = session(source, host, sink.clone(), 0.0, TuneType::NewNormal);
        session.init().await.unwrap();
        assert_eq!(
            session.ctx.stream_formats.lock().unwrap()[TrackKind::Video.index()],
            StreamFormat::IsoBmff
        );

        session.start();
        wait_for_fragments(&sink, 3).await;
        session.stop(true).await;

        let fragments = sink.fragments.lock().unwrap();
        let video_fragments: Vec<_> = fragments
            .iter()
            .filter(|(track, _)| *track == TrackKind::Video)
            .collect();
        // init fragment first, flagged as a discontinuity
        assert_eq!(video_fragments[0].1.payload.as_ref(), b"ftypinit");
        assert!(video_fragments[0].1.discontinuity);
        assert_eq!(video_fragments[1].1.payload.as_ref(), b"moofmdat");
    }
}
