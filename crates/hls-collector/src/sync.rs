// Audio/video synchronization at tune time: sequence-number catch-up,
// program-date-time alignment, and discontinuity-period alignment.

use crate::config::{
    MAX_SEQ_NUMBER_DIFF_FOR_SEQ_NUM_BASED_SYNC, MAX_SEQ_NUMBER_LAG_COUNT,
};
use crate::error::CollectorError;
use crate::events::TrackKind;
use crate::session::StreamContext;
use crate::track::{FetchCursor, Track};
use tracing::{debug, info, warn};

/// Align the audio track to the video track by discontinuity period.
/// Both tracks must carry the same number of periods; audio's play target
/// becomes that period's start plus video's offset into it.
pub fn sync_tracks_for_discontinuity(
    video: &Track,
    audio: &Track,
    video_cursor: &FetchCursor,
    audio_cursor: &mut FetchCursor,
) -> Result<(), CollectorError> {
    let video_periods = video.with_playlist(|p| p.index.number_of_periods());
    let audio_periods = audio.with_playlist(|p| p.index.number_of_periods());
    if video_periods != audio_periods {
        warn!(
            video_periods,
            audio_periods, "period count mismatch, cannot sync by discontinuity"
        );
        return Err(CollectorError::TracksSyncError {
            reason: format!(
                "discontinuity period mismatch: video {video_periods}, audio {audio_periods}"
            ),
        });
    }
    let (period_idx, offset_from_period) = video
        .with_playlist(|p| p.index.next_fragment_period_info(video_cursor.play_target));
    if period_idx < 0 {
        return Err(CollectorError::TracksSyncError {
            reason: "no discontinuity period at play target".to_string(),
        });
    }
    let audio_period_start =
        audio.with_playlist(|p| p.index.period_start_position(period_idx as usize));
    if audio_period_start == 0.0 {
        warn!(period_idx, "audio period start unavailable");
        return Err(CollectorError::TracksSyncError {
            reason: "audio period start position is zero".to_string(),
        });
    }
    audio_cursor.play_target = audio_period_start + offset_from_period;
    info!(
        period_idx,
        offset_from_period,
        audio_play_target = audio_cursor.play_target,
        video_play_target = video_cursor.play_target,
        "synced tracks by discontinuity period"
    );
    Ok(())
}

/// Synchronize audio and video for live/event content.
///
/// Sequence-number sync advances the lagging track fragment by fragment
/// (re-running the playlist walk so discontinuity boundaries are crossed
/// correctly). When program-date-times are available and the lag exceeds
/// the small-diff bound, start-time sync shifts the lagging play target by
/// the residual wall-clock difference instead; repeating the pass without
/// an intervening fetch is a no-op.
pub async fn sync_tracks(
    ctx: &StreamContext,
    video: &Track,
    audio: &Track,
    video_cursor: &mut FetchCursor,
    audio_cursor: &mut FetchCursor,
    use_program_date_time: bool,
) -> Result<(), CollectorError> {
    // advance both tracks by one parse pass; this also populates the
    // start time from the first program-date-time
    for (track, cursor) in [(video, &mut *video_cursor), (audio, &mut *audio_cursor)] {
        track.select_next_fragment(ctx, cursor, None, true).await;
        cursor.play_target = cursor.playlist_position.unwrap_or(cursor.play_target);
        debug!(
            track = track.name,
            playlist_position = cursor.playlist_position,
            play_target = cursor.play_target,
            next_sequence = cursor.next_media_sequence_number,
            "sync parse pass"
        );
    }

    let video_seq = video_cursor.next_media_sequence_number - 1;
    let audio_seq = audio_cursor.next_media_sequence_number - 1;
    let start_time_available = video_cursor.start_time_for_playlist_sync.is_some()
        && audio_cursor.start_time_for_playlist_sync.is_some();
    let diff_between_start_times = if start_time_available {
        audio_cursor.start_time_for_playlist_sync.unwrap_or(0.0)
            - video_cursor.start_time_for_playlist_sync.unwrap_or(0.0)
    } else {
        0.0
    };

    if start_time_available {
        if !use_program_date_time {
            if video_cursor.target_duration_seconds != audio_cursor.target_duration_seconds {
                warn!(
                    video_target = video_cursor.target_duration_seconds,
                    audio_target = audio_cursor.target_duration_seconds,
                    "sequence sync with mismatched target durations"
                );
            } else {
                let diff_by_seq =
                    (audio_seq - video_seq) as f64 * video_cursor.fragment_duration_seconds;
                if (diff_by_seq - diff_between_start_times).abs()
                    > video_cursor.fragment_duration_seconds
                {
                    warn!(
                        diff_by_seq,
                        diff_between_start_times,
                        "start time and sequence numbers disagree"
                    );
                }
            }
        }
        if !(-10.0..=10.0).contains(&diff_between_start_times) {
            info!(
                audio_start = audio_cursor.start_time_for_playlist_sync,
                video_start = video_cursor.start_time_for_playlist_sync,
                "large start time difference between tracks"
            );
        }
    }

    let mut synced_using_seq_num = false;
    if !start_time_available || !use_program_date_time {
        let (lagging, diff) = if audio_seq > video_seq {
            info!(diff = audio_seq - video_seq, "video lags in sequence number");
            (Some(TrackKind::Video), audio_seq - video_seq)
        } else if video_seq > audio_seq {
            info!(diff = video_seq - audio_seq, "audio lags in sequence number");
            (Some(TrackKind::Audio), video_seq - audio_seq)
        } else {
            (None, 0)
        };
        match lagging {
            None => synced_using_seq_num = true,
            Some(kind) => {
                let (track, cursor) = match kind {
                    TrackKind::Video => (video, &mut *video_cursor),
                    TrackKind::Audio => (audio, &mut *audio_cursor),
                };
                if start_time_available && diff > MAX_SEQ_NUMBER_DIFF_FOR_SEQ_NUM_BASED_SYNC {
                    info!(diff, "lag too large for sequence sync, using start time");
                } else if diff > 0 && diff <= MAX_SEQ_NUMBER_LAG_COUNT {
                    let mut remaining = diff;
                    while remaining > 0 {
                        cursor.play_target += cursor.fragment_duration_seconds;
                        cursor.play_target_offset += cursor.fragment_duration_seconds;
                        if cursor.fragment_offset.is_some() {
                            track.select_next_fragment(ctx, cursor, None, true).await;
                        } else {
                            warn!(
                                track = track.name,
                                "lagging track ran out of fragments during catch-up"
                            );
                        }
                        remaining -= 1;
                    }
                    synced_using_seq_num = true;
                } else {
                    warn!(
                        %kind,
                        diff,
                        max = MAX_SEQ_NUMBER_LAG_COUNT,
                        "sequence lag beyond catch-up bound"
                    );
                }
            }
        }
    }

    if !synced_using_seq_num {
        if !start_time_available {
            return Err(CollectorError::TracksSyncError {
                reason: "no sequence-number path and no program-date-time".to_string(),
            });
        }
        if diff_between_start_times > 0.0 {
            // audio ahead: video catches up by the residual shift
            let residual = diff_between_start_times - video_cursor.play_target_offset;
            if residual > video_cursor.fragment_duration_seconds / 2.0 {
                let video_duration = video.duration();
                if video_duration > video_cursor.play_target + residual {
                    info!(residual, "audio track ahead, advancing video");
                    video_cursor.play_target += residual;
                    video_cursor.play_target_offset = diff_between_start_times;
                } else {
                    warn!(
                        residual,
                        play_target = video_cursor.play_target,
                        video_duration,
                        "video too short to absorb start-time shift"
                    );
                    return Err(CollectorError::TracksSyncError {
                        reason: "video duration cannot cover start-time shift".to_string(),
                    });
                }
            } else {
                debug!(residual, "start-time shift below half a fragment, skipping");
            }
        } else if diff_between_start_times < 0.0 {
            let residual = -diff_between_start_times - audio_cursor.play_target_offset;
            if residual > audio_cursor.fragment_duration_seconds / 2.0 {
                let audio_duration = audio.duration();
                if audio_duration > audio_cursor.play_target + residual {
                    info!(residual, "video track ahead, advancing audio");
                    audio_cursor.play_target += residual;
                    audio_cursor.play_target_offset = -diff_between_start_times;
                } else {
                    warn!(
                        residual,
                        play_target = audio_cursor.play_target,
                        audio_duration,
                        "audio too short to absorb start-time shift"
                    );
                    return Err(CollectorError::TracksSyncError {
                        reason: "audio duration cannot cover start-time shift".to_string(),
                    });
                }
            } else {
                debug!(residual, "start-time shift below half a fragment, skipping");
            }
        }
    }
    info!(
        audio_play_target = audio_cursor.play_target,
        video_play_target = video_cursor.play_target,
        synced_using_seq_num,
        "track sync complete"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::test_support::test_context;
    use std::sync::atomic::Ordering;

    fn playlist(seq_base: i64, fragments: usize, pdt: Option<&str>) -> String {
        let mut text = format!(
            "#EXTM3U\n#EXT-X-TARGETDURATION:6\n#EXT-X-MEDIA-SEQUENCE:{seq_base}\n"
        );
        for i in 0..fragments {
            if i == 0 && let Some(pdt) = pdt {
                text.push_str(&format!("#EXT-X-PROGRAM-DATE-TIME:{pdt}\n"));
            }
            text.push_str(&format!("#EXTINF:6,\nseg{}.ts\n", seq_base + i as i64));
        }
        text
    }

    fn track_with(kind: TrackKind, name: &'static str, text: &str) -> (Track, FetchCursor) {
        let ctx = test_context();
        ctx.number_of_tracks.store(2, Ordering::Release);
        let track = Track::new(kind, name);
        track.enabled.store(true, Ordering::Release);
        let mut cursor = FetchCursor::default();
        track
            .index_and_install(&ctx, &mut cursor, text.to_string(), "https://cdn/p.m3u8".into())
            .unwrap();
        (track, cursor)
    }

    #[tokio::test]
    async fn sequence_number_sync_advances_lagging_track() {
        let ctx = test_context();
        ctx.number_of_tracks.store(2, Ordering::Release);
        // audio starts two fragments behind video
        let (video, mut vc) = track_with(TrackKind::Video, "video", &playlist(102, 6, None));
        let (audio, mut ac) = track_with(TrackKind::Audio, "audio", &playlist(100, 8, None));

        sync_tracks(&ctx, &video, &audio, &mut vc, &mut ac, false)
            .await
            .unwrap();

        // audio advanced two fragments of 6s and now matches video's
        // sequence position
        assert!((ac.play_target - 12.0).abs() < 1e-6);
        assert!((vc.play_target - 0.0).abs() < 1e-6);
        assert_eq!(ac.next_media_sequence_number, vc.next_media_sequence_number);
        assert!((ac.play_target_offset - 12.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn equal_sequences_need_no_adjustment() {
        let ctx = test_context();
        ctx.number_of_tracks.store(2, Ordering::Release);
        let (video, mut vc) = track_with(TrackKind::Video, "video", &playlist(100, 6, None));
        let (audio, mut ac) = track_with(TrackKind::Audio, "audio", &playlist(100, 6, None));
        sync_tracks(&ctx, &video, &audio, &mut vc, &mut ac, false)
            .await
            .unwrap();
        assert_eq!(vc.play_target, ac.play_target);
        assert_eq!(ac.play_target_offset, 0.0);
    }

    #[tokio::test]
    async fn large_lag_with_start_times_falls_back_to_start_time_sync() {
        let ctx = test_context();
        ctx.number_of_tracks.store(2, Ordering::Release);
        // audio is 4 fragments (24s) ahead by sequence number, and its
        // start time is 24s later
        let (video, mut vc) = track_with(
            TrackKind::Video,
            "video",
            &playlist(100, 10, Some("2024-03-01T10:00:00.000Z")),
        );
        let (audio, mut ac) = track_with(
            TrackKind::Audio,
            "audio",
            &playlist(104, 10, Some("2024-03-01T10:00:24.000Z")),
        );

        sync_tracks(&ctx, &video, &audio, &mut vc, &mut ac, true)
            .await
            .unwrap();

        // video shifted forward by the wall-clock difference
        assert!((vc.play_target - 24.0).abs() < 1e-6);
        assert!((vc.play_target_offset - 24.0).abs() < 1e-6);

        // running the pass again without fetching is a no-op
        let (target, offset) = (vc.play_target, vc.play_target_offset);
        sync_tracks(&ctx, &video, &audio, &mut vc, &mut ac, true)
            .await
            .unwrap();
        assert!((vc.play_target - target).abs() < 1e-6);
        assert!((vc.play_target_offset - offset).abs() < 1e-6);
    }

    #[tokio::test]
    async fn no_sync_path_is_an_error() {
        let ctx = test_context();
        ctx.number_of_tracks.store(2, Ordering::Release);
        // lag of 60 fragments exceeds the catch-up bound, and no PDT
        let (video, mut vc) = track_with(TrackKind::Video, "video", &playlist(160, 5, None));
        let (audio, mut ac) = track_with(TrackKind::Audio, "audio", &playlist(100, 5, None));
        let err = sync_tracks(&ctx, &video, &audio, &mut vc, &mut ac, false)
            .await
            .unwrap_err();
        assert!(matches!(err, CollectorError::TracksSyncError { .. }));
    }

    #[tokio::test]
    async fn discontinuity_period_sync_aligns_audio() {
        let video_text = "#EXTM3U\n#EXT-X-TARGETDURATION:6\n\
#EXTINF:6,\nv0.ts\n#EXTINF:6,\nv1.ts\n\
#EXT-X-DISCONTINUITY\n#EXTINF:6,\nv2.ts\n#EXTINF:6,\nv3.ts\n";
        let audio_text = "#EXTM3U\n#EXT-X-TARGETDURATION:6\n\
#EXTINF:4,\na0.ts\n#EXTINF:4,\na1.ts\n#EXTINF:4,\na2.ts\n\
#EXT-X-DISCONTINUITY\n#EXTINF:4,\na3.ts\n#EXTINF:4,\na4.ts\n";
        let (video, mut vc) = track_with(TrackKind::Video, "video", video_text);
        let (audio, mut ac) = track_with(TrackKind::Audio, "audio", audio_text);

        // video target lands on the fragment ending at 18s; the fragment
        // starts exactly at the period boundary, so the offset is zero
        vc.play_target = 13.0;
        sync_tracks_for_discontinuity(&video, &audio, &vc, &mut ac).unwrap();
        // audio's second period starts at 12s
        assert!((ac.play_target - 12.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn discontinuity_period_count_mismatch_is_an_error() {
        let with_disc = "#EXTM3U\n#EXTINF:6,\nv0.ts\n#EXT-X-DISCONTINUITY\n#EXTINF:6,\nv1.ts\n";
        let without = "#EXTM3U\n#EXTINF:6,\na0.ts\n#EXTINF:6,\na1.ts\n";
        let (video, vc) = track_with(TrackKind::Video, "video", with_disc);
        let (audio, mut ac) = track_with(TrackKind::Audio, "audio", without);
        assert!(sync_tracks_for_discontinuity(&video, &audio, &vc, &mut ac).is_err());
    }
}
