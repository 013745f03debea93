// Live playlist refresh cadence.
//
// A new playlist with at least one additional fragment is available no
// earlier than 0.5x and no later than 1.5x the target duration after the
// previous fetch; the delay adapts to how much buffer the player holds.

use crate::config::{
    MAX_DELAY_BETWEEN_PLAYLIST_UPDATE_MS, MIN_DELAY_BETWEEN_PLAYLIST_UPDATE_MS,
};

/// Cap for the periodic mid-fetch refresh gate: twice the target duration,
/// bounded by the global maximum.
pub fn max_interval_between_playlist_updates_ms(target_duration_seconds: f64) -> u64 {
    let interval = (2.0 * target_duration_seconds * 1000.0) as u64;
    interval.min(MAX_DELAY_BETWEEN_PLAYLIST_UPDATE_MS)
}

/// Delay before the next refresh once a track ran out of fragments.
///
/// `buffer_available_ms` is the distance between the playlist end position
/// and the current play position; `time_since_last_refresh_ms` is
/// subtracted so refreshes stay anchored to the previous download. The
/// result is clamped to `[500, 6000]` ms.
pub fn next_refresh_delay_ms(
    buffer_available_ms: i64,
    target_duration_seconds: f64,
    time_since_last_refresh_ms: i64,
) -> u64 {
    let target_ms = target_duration_seconds * 1000.0;
    let mut delay_ms: i64 = if buffer_available_ms as f64 > target_ms * 2.0 {
        (1.5 * target_ms) as i64
    } else if buffer_available_ms as f64 > target_ms {
        (0.5 * target_ms) as i64
    } else if buffer_available_ms > 2 * MAX_DELAY_BETWEEN_PLAYLIST_UPDATE_MS as i64 {
        MAX_DELAY_BETWEEN_PLAYLIST_UPDATE_MS as i64
    } else if buffer_available_ms > 0 {
        // buffer below one target duration: close to a freeze, poll fast
        buffer_available_ms / 3
    } else {
        MIN_DELAY_BETWEEN_PLAYLIST_UPDATE_MS as i64
    };

    delay_ms -= time_since_last_refresh_ms;

    delay_ms
        .clamp(
            MIN_DELAY_BETWEEN_PLAYLIST_UPDATE_MS as i64,
            MAX_DELAY_BETWEEN_PLAYLIST_UPDATE_MS as i64,
        ) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deep_buffer_waits_one_and_a_half_targets() {
        // 12s buffer against a 4s target: 1.5 * 4000 = 6000, at the cap
        assert_eq!(next_refresh_delay_ms(12_000, 4.0, 0), 6_000);
        // 30s buffer against 2s target: 3000ms
        assert_eq!(next_refresh_delay_ms(30_000, 2.0, 0), 3_000);
    }

    #[test]
    fn single_target_buffer_waits_half_target() {
        assert_eq!(next_refresh_delay_ms(5_000, 4.0, 0), 2_000);
    }

    #[test]
    fn huge_target_with_modest_buffer_uses_cap() {
        // buffer > 2 * 6000 but below one 60s target
        assert_eq!(next_refresh_delay_ms(20_000, 60.0, 0), 6_000);
    }

    #[test]
    fn low_buffer_polls_at_a_third() {
        assert_eq!(next_refresh_delay_ms(3_000, 4.0, 0), 1_000);
    }

    #[test]
    fn empty_buffer_uses_minimum() {
        assert_eq!(next_refresh_delay_ms(0, 4.0, 0), 500);
        assert_eq!(next_refresh_delay_ms(-100, 4.0, 0), 500);
    }

    #[test]
    fn elapsed_time_is_subtracted_and_clamped() {
        // 1.5 * 4s = 6000, minus 5800 elapsed = 200 -> clamped to 500
        assert_eq!(next_refresh_delay_ms(12_000, 4.0, 5_800), 500);
        assert_eq!(next_refresh_delay_ms(12_000, 4.0, 1_000), 5_000);
    }

    #[test]
    fn delay_is_always_within_bounds() {
        for buffer in [-1000, 0, 100, 2_000, 8_000, 13_000, 50_000] {
            for target in [0.5, 2.0, 4.0, 10.0, 60.0] {
                for elapsed in [0, 500, 7_000] {
                    let delay = next_refresh_delay_ms(buffer, target, elapsed);
                    assert!((500..=6_000).contains(&delay));
                }
            }
        }
    }

    #[test]
    fn update_interval_capped() {
        assert_eq!(max_interval_between_playlist_updates_ms(2.0), 4_000);
        assert_eq!(max_interval_between_playlist_updates_ms(6.0), 6_000);
    }
}
