// Cached-fragment ring and the injector task feeding the downstream
// demuxer/renderer. The bounded channel is the ring: the collector blocks
// on a full buffer, the injector on an empty one, and cancellation wakes
// both sides.

use crate::events::TrackKind;
use bytes::Bytes;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

/// One downloaded (and decrypted) fragment ready for injection.
#[derive(Debug, Clone)]
pub struct CachedFragment {
    pub payload: Bytes,
    /// Presentation position in seconds.
    pub position: f64,
    pub duration: f64,
    pub discontinuity: bool,
}

/// Downstream demuxer/renderer contract. Returns true when the fragment
/// was discarded rather than consumed.
pub trait FragmentSink: Send + Sync {
    fn send_fragment(&self, track: TrackKind, fragment: CachedFragment) -> bool;
    /// Flush/abort any buffered state; called on shutdown.
    fn abort(&self) {}
}

pub struct FragmentRing {
    tx: mpsc::Sender<CachedFragment>,
    token: CancellationToken,
}

/// Outcome of waiting for a free ring slot.
pub enum SlotWait {
    Ready(mpsc::OwnedPermit<CachedFragment>),
    /// The wait hit its deadline (a playlist refresh is due first).
    TimedOut,
    Cancelled,
}

impl FragmentRing {
    /// Build the ring and spawn the injector task draining it into `sink`.
    pub fn start(
        track: TrackKind,
        capacity: usize,
        sink: std::sync::Arc<dyn FragmentSink>,
        token: CancellationToken,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let injector_token = token.clone();
        let handle = tokio::spawn(run_injector(track, rx, sink, injector_token));
        (Self { tx, token }, handle)
    }

    /// Wait for a free slot, bounded by an optional deadline so a due
    /// playlist refresh is not starved by a full buffer.
    pub async fn wait_for_free_slot(&self, timeout: Option<Duration>) -> SlotWait {
        let reserve = self.tx.clone().reserve_owned();
        match timeout {
            Some(timeout) => {
                tokio::select! {
                    _ = self.token.cancelled() => SlotWait::Cancelled,
                    _ = tokio::time::sleep(timeout) => SlotWait::TimedOut,
                    permit = reserve => match permit {
                        Ok(permit) => SlotWait::Ready(permit),
                        Err(_) => SlotWait::Cancelled,
                    },
                }
            }
            None => {
                tokio::select! {
                    _ = self.token.cancelled() => SlotWait::Cancelled,
                    permit = reserve => match permit {
                        Ok(permit) => SlotWait::Ready(permit),
                        Err(_) => SlotWait::Cancelled,
                    },
                }
            }
        }
    }
}

async fn run_injector(
    track: TrackKind,
    mut rx: mpsc::Receiver<CachedFragment>,
    sink: std::sync::Arc<dyn FragmentSink>,
    token: CancellationToken,
) {
    loop {
        let fragment = tokio::select! {
            _ = token.cancelled() => break,
            fragment = rx.recv() => match fragment {
                Some(fragment) => fragment,
                None => break,
            },
        };
        trace!(
            %track,
            position = fragment.position,
            duration = fragment.duration,
            discontinuity = fragment.discontinuity,
            bytes = fragment.payload.len(),
            "injecting fragment"
        );
        if sink.send_fragment(track, fragment) {
            debug!(%track, "fragment discarded by sink");
        }
    }
    sink.abort();
    info!(%track, "injector finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct RecordingSink {
        received: Mutex<Vec<CachedFragment>>,
    }

    impl FragmentSink for RecordingSink {
        fn send_fragment(&self, _track: TrackKind, fragment: CachedFragment) -> bool {
            self.received.lock().unwrap().push(fragment);
            false
        }
    }

    fn fragment(position: f64) -> CachedFragment {
        CachedFragment {
            payload: Bytes::from_static(b"payload"),
            position,
            duration: 6.0,
            discontinuity: false,
        }
    }

    #[tokio::test]
    async fn fragments_flow_in_order() {
        let sink = Arc::new(RecordingSink::default());
        let token = CancellationToken::new();
        let (ring, handle) =
            FragmentRing::start(TrackKind::Video, 3, sink.clone(), token.clone());

        for i in 0..5 {
            match ring.wait_for_free_slot(None).await {
                SlotWait::Ready(permit) => {
                    permit.send(fragment(i as f64 * 6.0));
                }
                _ => panic!("slot expected"),
            }
        }
        drop(ring);
        handle.await.unwrap();

        let received = sink.received.lock().unwrap();
        assert_eq!(received.len(), 5);
        let positions: Vec<f64> = received.iter().map(|f| f.position).collect();
        assert_eq!(positions, vec![0.0, 6.0, 12.0, 18.0, 24.0]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn producer_times_out_when_ring_full_and_consumer_stalled() {
        struct BlockedSink {
            release: Mutex<Option<std::sync::mpsc::Receiver<()>>>,
        }
        impl FragmentSink for BlockedSink {
            fn send_fragment(&self, _track: TrackKind, _fragment: CachedFragment) -> bool {
                if let Some(release) = self.release.lock().unwrap().take() {
                    let _ = release.recv();
                }
                false
            }
        }
        let (release_tx, release_rx) = std::sync::mpsc::channel();
        let token = CancellationToken::new();
        let (ring, handle) = FragmentRing::start(
            TrackKind::Audio,
            1,
            Arc::new(BlockedSink {
                release: Mutex::new(Some(release_rx)),
            }),
            token.clone(),
        );
        // first fragment parks the injector inside the sink; the second
        // fills the single slot
        let SlotWait::Ready(permit) = ring.wait_for_free_slot(None).await else {
            panic!("first slot expected");
        };
        permit.send(fragment(0.0));
        let SlotWait::Ready(permit) = ring.wait_for_free_slot(None).await else {
            panic!("second slot expected");
        };
        permit.send(fragment(6.0));

        match ring
            .wait_for_free_slot(Some(Duration::from_millis(20)))
            .await
        {
            SlotWait::TimedOut => {}
            _ => panic!("expected timeout while ring is full"),
        }
        drop(release_tx);
        token.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn cancellation_wakes_blocked_producer() {
        let sink = Arc::new(RecordingSink::default());
        let token = CancellationToken::new();
        let (ring, handle) =
            FragmentRing::start(TrackKind::Video, 1, sink, token.clone());
        token.cancel();
        // injector exits; a waiting producer observes cancellation
        match ring.wait_for_free_slot(None).await {
            SlotWait::Cancelled => {}
            SlotWait::Ready(_) => {
                // the permit may win the race; the cancelled injector will
                // never drain it, but the producer must not hang
            }
            SlotWait::TimedOut => panic!("no timeout configured"),
        }
        handle.await.unwrap();
    }
}
