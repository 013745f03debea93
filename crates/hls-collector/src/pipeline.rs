// The per-track fragment collector loop: select, fetch, decrypt, enqueue,
// with the live refresh gate, deferred license polling and video ABR
// handling woven through it.

use crate::config::{
    MAX_SEG_DOWNLOAD_FAIL_COUNT, MAX_SEG_DRM_DECRYPT_FAIL_COUNT, NORMAL_PLAY_RATE,
};
use crate::error::{CollectorError, DrmError};
use crate::events::{DownloadErrorKind, TrackKind};
use crate::harvest::HarvestKind;
use crate::http::resolve_url;
use crate::index::InitFragmentInfo;
use crate::output::{CachedFragment, FragmentRing, SlotWait};
use crate::refresh::next_refresh_delay_ms;
use crate::session::StreamContext;
use crate::track::{FetchCursor, FragmentPlan, Track};
use bytes::Bytes;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// TSB fragment URLs carry the profile bandwidth inline.
const TSB_FRAGMENT_BW_IDENTIFIER: &str = "bandwidth-";

/// Fragment collector task body. Runs until EOS, an end-list tag, or
/// cancellation.
pub async fn run_fetch_loop(
    track: Arc<Track>,
    other: Option<Arc<Track>>,
    mut cursor: FetchCursor,
    ring: FragmentRing,
    ctx: Arc<StreamContext>,
) {
    info!(track = track.name, "fragment collector started");
    loop {
        while cursor.fragment_offset.is_some() && !ctx.token.is_cancelled() {
            if cursor.inject_init_fragment
                && let Some(init) = track.with_playlist(|p| p.index.init_fragment.clone())
            {
                match fetch_init_fragment(&track, &ctx, &mut cursor, &ring, &init).await {
                    Ok(true) => cursor.inject_init_fragment = false,
                    Ok(false) => {}
                    Err(status) => {
                        warn!(track = track.name, status, "init fragment fetch failed");
                        ctx.host
                            .send_download_error(DownloadErrorKind::InitFragment, status);
                    }
                }
            }

            fetch_fragment(&track, other.as_deref(), &ctx, &mut cursor, &ring).await;

            // fetching involves several waits; recheck before continuing
            if ctx.token.is_cancelled() {
                break;
            }

            let metadata_nodes = track.with_playlist(|p| p.index.drm_metadata.clone());
            ctx.registry.poll_deferred(&metadata_nodes, track.kind);
            if cursor.license_request_pending {
                info!(track = track.name, "acquiring held-back licenses");
                cursor.license_request_pending = false;
                track.process_drm_metadata(&ctx, &mut cursor, false);
            }

            // profile change checks apply to video at normal rate only
            if track.kind == TrackKind::Video && !ctx.trickplay_mode {
                let next = {
                    let mut profiles = ctx.profiles.lock().expect("profiles poisoned");
                    profiles.last_selected_profile = profiles.current_profile;
                    if cursor.check_for_rampdown {
                        None
                    } else {
                        ctx.abr
                            .next_profile(&profiles.master.streams, profiles.current_profile)
                    }
                };
                if let Some(profile) = next {
                    info!(track = track.name, profile, "profile change requested");
                    abr_profile_changed(&ctx, &track, &mut cursor, profile);
                }
            }

            if !ctx.is_vod()
                && let Some(last) = cursor.last_playlist_download
            {
                let max_interval =
                    ctx.max_interval_between_playlist_updates_ms.load(Ordering::Acquire);
                if last.elapsed() >= Duration::from_millis(max_interval) {
                    debug!(track = track.name, "maximum refresh delay exceeded");
                    track.refresh_playlist(&ctx, &mut cursor).await;
                }
            }
            if cursor.refresh_requested {
                cursor.refresh_requested = false;
                let outcome = track.refresh_playlist(&ctx, &mut cursor).await;
                if !outcome.success && !outcome.transient_network_failure {
                    // profile switch without a playlist: let ABR try again
                    let mut profiles = ctx.profiles.lock().expect("profiles poisoned");
                    profiles.current_profile = profiles.last_selected_profile;
                }
            }
        }

        if cursor.eos_reached
            || ctx.has_end_list.load(Ordering::Acquire)
            || ctx.token.is_cancelled()
        {
            break;
        }

        // ran out of fragments on a live playlist: pace the next refresh
        // by buffer depth
        if let Some(last) = cursor.last_playlist_download {
            let end_position_ms = ((track.culled_seconds() + track.duration()) * 1000.0) as i64;
            let play_position_ms = ctx.host.position_ms();
            let buffer_available_ms = end_position_ms - play_position_ms;
            let delay = next_refresh_delay_ms(
                buffer_available_ms,
                cursor.target_duration_seconds,
                last.elapsed().as_millis() as i64,
            );
            trace!(
                track = track.name,
                buffer_available_ms,
                delay_ms = delay,
                "waiting before playlist refresh"
            );
            tokio::select! {
                _ = ctx.token.cancelled() => break,
                _ = tokio::time::sleep(Duration::from_millis(delay)) => {}
            }
        }
        track.refresh_playlist(&ctx, &mut cursor).await;

        if cursor.fragment_offset.is_none()
            && ctx.host.is_live()
            && track.kind == TrackKind::Video
        {
            warn!(track = track.name, "no fragment after refresh, playback may stall");
            ctx.host.check_for_playback_stall(false);
        }
    }
    info!(track = track.name, "fragment collector done");
}

/// Fetch the `#EXT-X-MAP` init fragment. `Ok(true)` on success, `Ok(false)`
/// when the wait was interrupted, `Err(status)` on download failure.
async fn fetch_init_fragment(
    track: &Track,
    ctx: &StreamContext,
    cursor: &mut FetchCursor,
    ring: &FragmentRing,
    init: &InitFragmentInfo,
) -> Result<bool, u16> {
    let permit = match ring.wait_for_free_slot(None).await {
        SlotWait::Ready(permit) => permit,
        _ => return Ok(false),
    };
    let base = effective_base(track);
    let url = match resolve_url(&base, &init.uri) {
        Ok(url) => url,
        Err(e) => {
            warn!(track = track.name, error = %e, "bad init fragment URI");
            return Err(0);
        }
    };
    debug!(track = track.name, url = %url, "fetching init fragment");
    match ctx
        .source
        .get_file(&url, init.byte_range, track.kind, false, &ctx.token)
        .await
    {
        Ok(file) => {
            if let Some(harvest) = &ctx.harvest {
                harvest.harvest(&url, &file.body, HarvestKind::Fragment, "");
            }
            permit.send(CachedFragment {
                payload: file.body,
                position: cursor.play_target,
                duration: 0.0,
                discontinuity: true,
            });
            Ok(true)
        }
        Err(CollectorError::Cancelled) => Ok(false),
        Err(e) => Err(e.http_status()),
    }
}

/// One iteration of the select/fetch/decrypt/enqueue machine.
async fn fetch_fragment(
    track: &Track,
    other: Option<&Track>,
    ctx: &StreamContext,
    cursor: &mut FetchCursor,
    ring: &FragmentRing,
) {
    // bound the slot wait by the refresh deadline so a full buffer cannot
    // starve a due playlist update
    let slot_timeout = if ctx.host.is_live() {
        let max_interval = ctx.max_interval_between_playlist_updates_ms.load(Ordering::Acquire);
        let elapsed = cursor
            .last_playlist_download
            .map(|last| last.elapsed().as_millis() as u64)
            .unwrap_or(0);
        Some(Duration::from_millis(max_interval.saturating_sub(elapsed)))
    } else {
        None
    };
    let permit = match ring.wait_for_free_slot(slot_timeout).await {
        SlotWait::Ready(permit) => permit,
        SlotWait::TimedOut => return,
        SlotWait::Cancelled => return,
    };

    cursor.check_for_rampdown = false;
    let trick_play = ctx.trickplay_mode
        && ctx
            .profiles
            .lock()
            .expect("profiles poisoned")
            .iframe_profile
            .is_some();

    let plan: Option<FragmentPlan> = if trick_play {
        let plan = track.fragment_from_index(
            ctx,
            cursor,
            ctx.rate,
            ctx.config.live_offset_seconds,
        );
        if plan.is_none() {
            cursor.fragment_offset = None;
        }
        let delta = ctx.rate / ctx.trick_play_fps as f64;
        if ctx.rate < 0.0 {
            if plan.is_none() || cursor.play_target == 0.0 {
                info!(track = track.name, "rewind reached the beginning");
                cursor.eos_reached = true;
            } else if cursor.play_target > -delta {
                cursor.play_target += delta;
            } else {
                cursor.play_target = 0.0;
            }
        } else if plan.is_none() {
            info!(track = track.name, "fast-forward reached the end");
            cursor.eos_reached = true;
        } else {
            cursor.play_target += delta;
        }
        plan
    } else {
        let plan = track.select_next_fragment(ctx, cursor, other, false).await;
        match &plan {
            Some(plan) => {
                cursor.play_target =
                    cursor.playlist_position.unwrap_or(0.0) + plan.fragment_duration_seconds;
                if ctx.host.is_live() {
                    ctx.host.check_for_playback_stall(true);
                }
            }
            None => {
                if (ctx.is_vod() || ctx.has_end_list.load(Ordering::Acquire))
                    && cursor.playlist_position.is_some()
                {
                    info!(
                        track = track.name,
                        play_target = cursor.play_target,
                        "played to end"
                    );
                    cursor.eos_reached = true;
                } else if ctx.host.is_live() && track.kind == TrackKind::Video {
                    // live playlist may simply not have rolled forward yet
                    ctx.host.check_for_playback_stall(false);
                }
            }
        }
        plan
    };
    let Some(plan) = plan else {
        drop(permit);
        return;
    };

    let base = effective_base(track);
    let url = match resolve_url(&base, &plan.uri) {
        Ok(url) => url,
        Err(e) => {
            warn!(track = track.name, error = %e, "unresolvable fragment URI");
            drop(permit);
            return;
        }
    };
    trace!(
        track = track.name,
        url = %url,
        encrypted = cursor.key.fragment_encrypted,
        discontinuity = plan.discontinuity,
        "fetching fragment"
    );

    let file = match ctx
        .source
        .get_file(&url, plan.byte_range, track.kind, false, &ctx.token)
        .await
    {
        Ok(file) => file,
        Err(CollectorError::Cancelled) => {
            drop(permit);
            return;
        }
        Err(e) => {
            cursor.seg_dl_fail_count += 1;
            warn!(
                track = track.name,
                failures = cursor.seg_dl_fail_count,
                error = %e,
                "fragment download failed"
            );
            if cursor.seg_dl_fail_count >= MAX_SEG_DOWNLOAD_FAIL_COUNT
                && !ctx.token.is_cancelled()
            {
                ctx.host
                    .send_download_error(DownloadErrorKind::Fragment, e.http_status());
            }
            // video only: try a lower profile and refetch the same span
            if track.kind == TrackKind::Video && cursor.fragment_offset.is_some() {
                let lower = {
                    let mut profiles = ctx.profiles.lock().expect("profiles poisoned");
                    profiles.last_selected_profile = profiles.current_profile;
                    ctx.abr.rampdown_profile(
                        &profiles.master.streams,
                        profiles.current_profile,
                        e.http_status(),
                    )
                };
                if let Some(profile) = lower {
                    info!(track = track.name, profile, "ramping down after failure");
                    abr_profile_changed(ctx, track, cursor, profile);
                    if ctx.rate == NORMAL_PLAY_RATE {
                        cursor.play_target -= cursor.fragment_duration_seconds;
                    } else {
                        cursor.play_target -= ctx.rate / ctx.trick_play_fps as f64;
                    }
                    cursor.check_for_rampdown = true;
                }
            }
            drop(permit);
            return;
        }
    };
    cursor.seg_dl_fail_count = 0;

    if track.kind == TrackKind::Video
        && ctx.host.is_tsb_supported()
        && let Some(bandwidth) = tsb_bandwidth_from_url(&file.effective_url)
    {
        ctx.host.update_tsb_bandwidth(bandwidth);
    }

    let mut payload = file.body;
    if payload.is_empty() {
        warn!(track = track.name, url = %url, "zero length fragment");
    } else if cursor.key.fragment_encrypted {
        let metadata = track.with_playlist(|p| {
            usize::try_from(cursor.current_metadata_idx)
                .ok()
                .and_then(|idx| p.index.drm_metadata.get(idx).cloned())
        });
        let sequence = cursor.next_media_sequence_number - 1;
        match ctx
            .registry
            .decrypt(
                metadata.as_ref(),
                &cursor.key,
                payload.to_vec(),
                track.kind,
                sequence,
            )
            .await
        {
            Ok(clear) => {
                cursor.seg_drm_decrypt_fail_count = 0;
                payload = Bytes::from(clear);
                if !ctx.first_fragment_decrypted.swap(true, Ordering::AcqRel) {
                    ctx.host.notify_first_fragment_decrypted();
                }
            }
            Err(DrmError::Aborted) => {
                drop(permit);
                return;
            }
            Err(DrmError::KeyAcquisitionTimeout) => {
                warn!(track = track.name, "license acquisition timed out");
                if !ctx.token.is_cancelled() {
                    ctx.host.send_error(&CollectorError::LicenseTimeout, false);
                }
                drop(permit);
                return;
            }
            Err(e) => {
                cursor.seg_drm_decrypt_fail_count += 1;
                warn!(
                    track = track.name,
                    failures = cursor.seg_drm_decrypt_fail_count,
                    error = %e,
                    "fragment decryption failed"
                );
                if cursor.seg_drm_decrypt_fail_count >= MAX_SEG_DRM_DECRYPT_FAIL_COUNT
                    && !ctx.token.is_cancelled()
                {
                    ctx.host.send_error(
                        &CollectorError::DecryptFailed {
                            count: cursor.seg_drm_decrypt_fail_count,
                        },
                        true,
                    );
                }
                drop(permit);
                return;
            }
        }
    }

    if let Some(harvest) = &ctx.harvest {
        harvest.harvest(&url, &payload, HarvestKind::Fragment, "");
    }

    let (position, duration, discontinuity) = if ctx.rate == NORMAL_PLAY_RATE {
        (
            cursor.play_target - cursor.play_target_offset - cursor.fragment_duration_seconds,
            cursor.fragment_duration_seconds,
            plan.discontinuity,
        )
    } else {
        let step = ctx.rate / ctx.trick_play_fps as f64;
        // the renderer treats every trick-play fragment as discontinuous
        (
            cursor.play_target - cursor.play_target_offset - step,
            (cursor.fragment_duration_seconds * ctx.rate / ctx.trick_play_fps as f64).trunc(),
            true,
        )
    };
    permit.send(CachedFragment {
        payload,
        position,
        duration,
        discontinuity,
    });
}

/// Re-point the video track at a new profile's playlist and arm the flags
/// a profile switch requires.
pub fn abr_profile_changed(
    ctx: &StreamContext,
    track: &Track,
    cursor: &mut FetchCursor,
    new_profile: usize,
) {
    let selection = {
        let mut profiles = ctx.profiles.lock().expect("profiles poisoned");
        profiles.current_profile = new_profile;
        let stream = profiles.master.streams[new_profile].clone();
        profiles
            .master
            .track_selection(TrackKind::Video, &stream, "")
    };
    if let Some(selection) = selection {
        let base = ctx.manifest_url.lock().expect("manifest url poisoned").clone();
        match resolve_url(&base, &selection.uri) {
            Ok(url) => {
                *track.playlist_url.lock().expect("playlist url poisoned") = url;
            }
            Err(e) => warn!(error = %e, "could not resolve new profile playlist"),
        }
    }
    // the refresh will reset positions; different profiles may also carry
    // different DRM metadata
    cursor.refresh_requested = true;
    cursor.inject_init_fragment = true;
    cursor.force_process_drm_metadata = true;
}

fn effective_base(track: &Track) -> String {
    let effective = track.effective_url();
    if effective.is_empty() {
        track
            .playlist_url
            .lock()
            .expect("playlist url poisoned")
            .clone()
    } else {
        effective
    }
}

fn tsb_bandwidth_from_url(url: &str) -> Option<u64> {
    let idx = url.find(TSB_FRAGMENT_BW_IDENTIFIER)?;
    let digits: String = url[idx + TSB_FRAGMENT_BW_IDENTIFIER.len()..]
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().ok()
}
