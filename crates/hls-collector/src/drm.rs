// DRM metadata registry and fragment decryption.
//
// The registry is owned by the session and shared with both tracks. It maps
// metadata SHA1 hashes to license state (`Pending -> Acquired -> Failed`),
// schedules deferred license acquisition for the linear key-rotation tag,
// and carries the vanilla AES-128 path for playlists without license
// metadata.

use crate::config::{DRM_SHA1_HASH_LEN, MAX_LICENSE_ACQ_WAIT_TIME};
use crate::error::{CollectorError, DrmError};
use crate::events::TrackKind;
use crate::http::FragmentSource;
use crate::index::DrmMetadataNode;
use crate::tags::{AttributeList, parse_iv_hex};
use aes::Aes128;
use async_trait::async_trait;
use cipher::{BlockDecryptMut, KeyIvInit, block_padding::Pkcs7};
use rand::Rng;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

type Aes128CbcDec = cbc::Decryptor<Aes128>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DrmMethod {
    #[default]
    None,
    Aes128,
    SampleAes,
}

/// Per-track `#EXT-X-KEY` state, updated as key tags are encountered both
/// while indexing and while walking for the next fragment.
#[derive(Debug, Clone, Default)]
pub struct KeyContext {
    pub method: DrmMethod,
    pub uri: Option<String>,
    pub iv: Option<[u8; 16]>,
    /// Current license metadata hash (40 hex chars), None for clear
    /// content and for vanilla AES.
    pub cm_sha1_hash: Option<String>,
    pub fragment_encrypted: bool,
    /// Mutes state-transition logging while a full-playlist index pass
    /// replays the key tags.
    pub indexing_in_progress: bool,
}

impl KeyContext {
    /// Apply one `#EXT-X-KEY` attribute list.
    pub fn apply_key_attributes(
        &mut self,
        attrs: &str,
        track_name: &str,
    ) -> Result<(), CollectorError> {
        for (name, value) in AttributeList::new(attrs) {
            match name {
                "METHOD" => match value.as_str() {
                    "NONE" => {
                        if self.fragment_encrypted {
                            if !self.indexing_in_progress {
                                info!(track = track_name, "encrypted to clear transition");
                            }
                            self.fragment_encrypted = false;
                            self.cm_sha1_hash = None;
                        }
                        self.method = DrmMethod::None;
                    }
                    "AES-128" => {
                        if !self.fragment_encrypted && !self.indexing_in_progress {
                            warn!(track = track_name, "clear to encrypted transition");
                        }
                        self.fragment_encrypted = true;
                        self.method = DrmMethod::Aes128;
                    }
                    "SAMPLE-AES" => {
                        return Err(CollectorError::UnsupportedCrypto {
                            method: "SAMPLE-AES".to_string(),
                        });
                    }
                    other => {
                        return Err(CollectorError::UnsupportedCrypto {
                            method: other.to_string(),
                        });
                    }
                },
                "URI" => self.uri = Some(value.as_str().to_string()),
                "IV" => self.iv = Some(parse_iv_hex(value.as_str())?),
                "CMSha1Hash" => self.update_metadata_hash(value.as_str(), track_name)?,
                _ => {}
            }
        }
        Ok(())
    }

    fn update_metadata_hash(
        &mut self,
        value: &str,
        track_name: &str,
    ) -> Result<(), CollectorError> {
        let digits = value
            .strip_prefix("0x")
            .or_else(|| value.strip_prefix("0X"))
            .unwrap_or(value);
        if digits.len() != DRM_SHA1_HASH_LEN || !digits.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(CollectorError::InvalidManifest {
                reason: format!("CMSha1Hash must be {DRM_SHA1_HASH_LEN} hex chars"),
            });
        }
        let hash = digits.to_ascii_lowercase();
        match &self.cm_sha1_hash {
            Some(current) if *current == hash => {}
            Some(current) => {
                if !self.indexing_in_progress {
                    info!(
                        track = track_name,
                        old = %current,
                        new = %hash,
                        "license metadata hash changed"
                    );
                }
                self.cm_sha1_hash = Some(hash);
            }
            None => {
                if !self.indexing_in_progress {
                    info!(track = track_name, hash = %hash, "new license metadata hash");
                }
                self.cm_sha1_hash = Some(hash);
            }
        }
        Ok(())
    }
}

/// A decryption context for one key, produced by license acquisition or by
/// the vanilla AES key fetch.
pub trait FragmentDecrypter: Send + Sync {
    fn decrypt(&self, payload: Vec<u8>, iv: Option<&[u8; 16]>) -> Result<Vec<u8>, DrmError>;
}

/// AES-128-CBC with PKCS7 padding.
pub struct AesCbcDecrypter {
    key: [u8; 16],
}

impl AesCbcDecrypter {
    pub fn new(key: [u8; 16]) -> Self {
        Self { key }
    }
}

impl FragmentDecrypter for AesCbcDecrypter {
    fn decrypt(&self, mut payload: Vec<u8>, iv: Option<&[u8; 16]>) -> Result<Vec<u8>, DrmError> {
        let iv = iv.ok_or_else(|| DrmError::NoContext {
            reason: "missing IV for AES-128 decryption".to_string(),
        })?;
        let cipher =
            Aes128CbcDec::new_from_slices(&self.key, iv).map_err(|e| DrmError::Decrypt {
                reason: format!("failed to initialize AES decryptor: {e}"),
            })?;
        let len = cipher
            .decrypt_padded_mut::<Pkcs7>(&mut payload)
            .map_err(|e| DrmError::Decrypt {
                reason: format!("decrypt failed: {e}"),
            })?
            .len();
        payload.truncate(len);
        Ok(payload)
    }
}

/// External DRM manager contract: turn license metadata into a decrypter.
/// At most one acquisition per hash is in flight at any time.
#[async_trait]
pub trait LicenseProvider: Send + Sync {
    async fn acquire(
        &self,
        metadata: DrmMetadataNode,
        track: TrackKind,
    ) -> Result<Arc<dyn FragmentDecrypter>, DrmError>;
}

#[derive(Clone)]
enum LicenseState {
    Pending,
    Acquired(Arc<dyn FragmentDecrypter>),
    Failed(String),
}

struct LicenseEntry {
    state: watch::Sender<LicenseState>,
    /// Which tracks referenced this hash during their latest index cycle.
    referenced: [bool; 2],
}

#[derive(Default)]
struct DeferredLicense {
    hash: Option<String>,
    deadline: Option<Instant>,
    request_pending: bool,
    /// The gating tag has been seen and handled; cleared on a refresh
    /// where the tag is absent.
    tag_under_processing: bool,
}

struct RegistryInner {
    entries: HashMap<String, LicenseEntry>,
    deferred: DeferredLicense,
    /// Vanilla AES keys cached by key URI.
    aes_keys: HashMap<String, [u8; 16]>,
}

/// Outcome of a metadata processing pass for one track.
#[derive(Debug, Clone, Default)]
pub struct MetadataProcessOutcome {
    /// Position of the track's current hash in its metadata vector.
    pub current_index: Option<usize>,
    /// Remaining licenses are deliberately unacquired and must be picked
    /// up by the pipeline later.
    pub license_request_pending: bool,
    /// The current hash matched no metadata entry.
    pub hash_mismatch: bool,
}

pub struct DrmRegistry {
    inner: Mutex<RegistryInner>,
    provider: Option<Arc<dyn LicenseProvider>>,
    source: Arc<dyn FragmentSource>,
    /// Broadcast used by `cancel_wait_all` to break license waits.
    abort: watch::Sender<bool>,
    token: CancellationToken,
}

impl DrmRegistry {
    pub fn new(
        source: Arc<dyn FragmentSource>,
        provider: Option<Arc<dyn LicenseProvider>>,
        token: CancellationToken,
    ) -> Self {
        let (abort, _) = watch::channel(false);
        Self {
            inner: Mutex::new(RegistryInner {
                entries: HashMap::new(),
                deferred: DeferredLicense::default(),
                aes_keys: HashMap::new(),
            }),
            provider,
            source,
            abort,
            token,
        }
    }

    /// Register metadata and start license acquisition unless one is
    /// already in flight or complete for this hash.
    pub fn set_metadata(&self, node: &DrmMetadataNode, track: TrackKind) {
        let mut inner = self.inner.lock().expect("drm registry poisoned");
        self.set_metadata_locked(&mut inner, node, track);
    }

    fn set_metadata_locked(
        &self,
        inner: &mut RegistryInner,
        node: &DrmMetadataNode,
        track: TrackKind,
    ) {
        let entry = inner
            .entries
            .entry(node.sha1_hash.clone())
            .or_insert_with(|| {
                let (state, _) = watch::channel(LicenseState::Pending);
                match &self.provider {
                    Some(provider) => {
                        debug!(hash = %node.sha1_hash, %track, "starting license acquisition");
                        let provider = Arc::clone(provider);
                        let node = node.clone();
                        let state_tx = state.clone();
                        tokio::spawn(async move {
                            let result = provider.acquire(node, track).await;
                            let next = match result {
                                Ok(decrypter) => LicenseState::Acquired(decrypter),
                                Err(e) => LicenseState::Failed(e.to_string()),
                            };
                            state_tx.send_replace(next);
                        });
                    }
                    None => {
                        state.send_replace(LicenseState::Failed(
                            "no license provider configured".to_string(),
                        ));
                    }
                }
                LicenseEntry {
                    state,
                    referenced: [false; 2],
                }
            });
        entry.referenced[track.index()] = true;
    }

    /// Whether a hash has ever been registered.
    pub fn is_registered(&self, hash: &str) -> bool {
        self.inner
            .lock()
            .expect("drm registry poisoned")
            .entries
            .contains_key(hash)
    }

    /// Forget which entries the track referenced; run before re-indexing
    /// so `flush_after_index` can collect metadata that vanished from the
    /// refreshed playlist.
    pub fn mark_before_index(&self, track: TrackKind) {
        let mut inner = self.inner.lock().expect("drm registry poisoned");
        for entry in inner.entries.values_mut() {
            entry.referenced[track.index()] = false;
        }
    }

    /// Drop entries no track references anymore.
    pub fn flush_after_index(&self, track: TrackKind) {
        let mut inner = self.inner.lock().expect("drm registry poisoned");
        let before = inner.entries.len();
        inner
            .entries
            .retain(|_, entry| entry.referenced.iter().any(|r| *r));
        let dropped = before - inner.entries.len();
        if dropped > 0 {
            debug!(%track, dropped, "flushed unreferenced license metadata");
        }
    }

    /// Process a track's metadata vector after indexing.
    ///
    /// Acquires every license except: non-current entries when
    /// `acquire_current_only` is set, and the entry held back by the
    /// deferred-license scheduler.
    pub fn process_metadata(
        &self,
        nodes: &[DrmMetadataNode],
        current_hash: Option<&str>,
        acquire_current_only: bool,
        track: TrackKind,
    ) -> MetadataProcessOutcome {
        let mut inner = self.inner.lock().expect("drm registry poisoned");
        let mut outcome = MetadataProcessOutcome::default();
        for (i, node) in nodes.iter().enumerate() {
            if let Some(hash) = current_hash {
                if outcome.current_index.is_none() && node.sha1_hash == hash {
                    outcome.current_index = Some(i);
                } else {
                    if acquire_current_only {
                        debug!(index = i, "skipping non-current license metadata");
                        continue;
                    }
                    if inner.deferred.tag_under_processing
                        && inner.deferred.request_pending
                        && inner.deferred.hash.as_deref() == Some(node.sha1_hash.as_str())
                    {
                        info!(index = i, "license deferred, not acquiring");
                        continue;
                    }
                }
            }
            self.set_metadata_locked(&mut inner, node, track);
        }
        outcome.license_request_pending =
            current_hash.is_some() && acquire_current_only && nodes.len() > 1;
        outcome.hash_mismatch = current_hash.is_some() && outcome.current_index.is_none();
        if outcome.hash_mismatch {
            warn!(
                hash = current_hash.unwrap_or(""),
                available = nodes.len(),
                "no metadata entry matches current hash"
            );
        }
        outcome
    }

    /// Handle a `#EXT-X-X1-LIN-CK:<seconds>` tag seen while indexing a
    /// multi-metadata live playlist. Picks the first never-registered
    /// metadata entry and schedules its acquisition at a randomized point
    /// inside the window.
    pub fn process_defer_window(
        &self,
        nodes: &[DrmMetadataNode],
        window_seconds: i64,
        first_index_done: bool,
    ) {
        let mut inner = self.inner.lock().expect("drm registry poisoned");
        if inner.deferred.tag_under_processing {
            return;
        }
        if nodes.len() <= 1 {
            warn!(
                metadata_count = nodes.len(),
                "deferred-license tag on single-metadata playlist"
            );
            return;
        }
        if !first_index_done {
            // tag on the very first index: acquire normally, nothing to defer
            info!("deferred-license tag on first index, not deferring");
            inner.deferred.request_pending = false;
        } else {
            let fresh = nodes
                .iter()
                .find(|node| !inner.entries.contains_key(&node.sha1_hash));
            match fresh {
                Some(node) => {
                    let delay = defer_time(window_seconds);
                    info!(
                        hash = %node.sha1_hash,
                        delay_ms = delay.as_millis() as u64,
                        "deferring license acquisition"
                    );
                    inner.deferred.hash = Some(node.sha1_hash.clone());
                    inner.deferred.deadline = Some(Instant::now() + delay);
                    inner.deferred.request_pending = true;
                }
                None => warn!("no unregistered metadata to defer"),
            }
        }
        inner.deferred.tag_under_processing = true;
    }

    /// Clear the defer gate on a refresh where the tag is absent.
    pub fn clear_defer_if_tag_absent(&self, tag_present: bool) {
        if tag_present {
            return;
        }
        let mut inner = self.inner.lock().expect("drm registry poisoned");
        if inner.deferred.tag_under_processing {
            debug!("deferred-license tag gone from playlist, clearing gate");
            inner.deferred.tag_under_processing = false;
        }
    }

    /// Pipeline poll: when the deferred deadline has passed, start the
    /// held-back acquisition.
    pub fn poll_deferred(&self, nodes: &[DrmMetadataNode], track: TrackKind) {
        let mut inner = self.inner.lock().expect("drm registry poisoned");
        if !(inner.deferred.tag_under_processing && inner.deferred.request_pending) {
            return;
        }
        let due = inner
            .deferred
            .deadline
            .map(|deadline| Instant::now() >= deadline)
            .unwrap_or(false);
        if !due {
            return;
        }
        self.start_deferred_locked(&mut inner, nodes, track);
    }

    fn start_deferred_locked(
        &self,
        inner: &mut RegistryInner,
        nodes: &[DrmMetadataNode],
        track: TrackKind,
    ) {
        let Some(hash) = inner.deferred.hash.clone() else {
            return;
        };
        // search from the newest entry, matching rotation order
        match nodes.iter().rev().find(|node| node.sha1_hash == hash) {
            Some(node) => {
                info!(hash = %hash, "starting deferred license acquisition");
                let node = node.clone();
                self.set_metadata_locked(inner, &node, track);
                inner.deferred.request_pending = false;
            }
            None => warn!(hash = %hash, "deferred hash missing from metadata vector"),
        }
    }

    /// Decrypt one fragment. The metadata path waits for its license up to
    /// the acquisition timeout; the vanilla path fetches and caches the key
    /// named by the key URI.
    pub async fn decrypt(
        &self,
        metadata: Option<&DrmMetadataNode>,
        key: &KeyContext,
        payload: Vec<u8>,
        track: TrackKind,
        sequence_number: i64,
    ) -> Result<Vec<u8>, DrmError> {
        match metadata {
            Some(node) => {
                let decrypter = self.wait_for_license(node, track).await?;
                decrypter.decrypt(payload, key.iv.as_ref())
            }
            None if key.method == DrmMethod::Aes128 => {
                let decrypter = self.vanilla_decrypter(key, track).await?;
                let derived_iv;
                let iv = match &key.iv {
                    Some(iv) => iv,
                    None => {
                        derived_iv = iv_from_sequence(sequence_number);
                        &derived_iv
                    }
                };
                decrypter.decrypt(payload, Some(iv))
            }
            None => Err(DrmError::NoContext {
                reason: "encrypted fragment without key method".to_string(),
            }),
        }
    }

    async fn wait_for_license(
        &self,
        node: &DrmMetadataNode,
        track: TrackKind,
    ) -> Result<Arc<dyn FragmentDecrypter>, DrmError> {
        let mut state_rx = {
            let mut inner = self.inner.lock().expect("drm registry poisoned");
            if !inner.entries.contains_key(&node.sha1_hash) {
                // License never acquired for this hash: either it was the
                // deferred one (start it now) or a pending acquisition the
                // pipeline has not caught up with.
                if inner.deferred.request_pending
                    && inner.deferred.hash.as_deref() == Some(node.sha1_hash.as_str())
                {
                    self.start_deferred_locked(&mut inner, std::slice::from_ref(node), track);
                } else {
                    self.set_metadata_locked(&mut inner, node, track);
                }
            }
            match inner.entries.get(&node.sha1_hash) {
                Some(entry) => entry.state.subscribe(),
                None => {
                    return Err(DrmError::NoContext {
                        reason: format!("no license entry for {}", node.sha1_hash),
                    });
                }
            }
        };

        let mut abort_rx = self.abort.subscribe();
        let deadline = Instant::now() + MAX_LICENSE_ACQ_WAIT_TIME;
        loop {
            match &*state_rx.borrow_and_update() {
                LicenseState::Acquired(decrypter) => return Ok(Arc::clone(decrypter)),
                LicenseState::Failed(reason) => {
                    return Err(DrmError::KeyAcquisitionFailed {
                        reason: reason.clone(),
                    });
                }
                LicenseState::Pending => {}
            }
            if *abort_rx.borrow_and_update() {
                return Err(DrmError::Aborted);
            }
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => {
                    return Err(DrmError::KeyAcquisitionTimeout);
                }
                changed = state_rx.changed() => {
                    if changed.is_err() {
                        return Err(DrmError::Aborted);
                    }
                }
                _ = abort_rx.changed() => {}
                _ = self.token.cancelled() => return Err(DrmError::Aborted),
            }
        }
    }

    async fn vanilla_decrypter(
        &self,
        key: &KeyContext,
        track: TrackKind,
    ) -> Result<AesCbcDecrypter, DrmError> {
        let uri = key.uri.as_deref().ok_or_else(|| DrmError::NoContext {
            reason: "AES-128 key without URI".to_string(),
        })?;
        let cached = self
            .inner
            .lock()
            .expect("drm registry poisoned")
            .aes_keys
            .get(uri)
            .copied();
        if let Some(key_bytes) = cached {
            return Ok(AesCbcDecrypter::new(key_bytes));
        }
        let fetched = self
            .source
            .get_file(uri, None, track, false, &self.token)
            .await
            .map_err(|e| DrmError::KeyAcquisitionFailed {
                reason: format!("key fetch failed: {e}"),
            })?;
        let key_bytes: [u8; 16] =
            fetched
                .body
                .as_ref()
                .try_into()
                .map_err(|_| DrmError::KeyAcquisitionFailed {
                    reason: format!(
                        "key from {uri} has length {}, expected 16",
                        fetched.body.len()
                    ),
                })?;
        self.inner
            .lock()
            .expect("drm registry poisoned")
            .aes_keys
            .insert(uri.to_string(), key_bytes);
        Ok(AesCbcDecrypter::new(key_bytes))
    }

    /// Break every in-flight license wait. `restore_key_state` re-arms.
    pub fn cancel_wait_all(&self) {
        self.abort.send_replace(true);
    }

    pub fn restore_key_state(&self) {
        self.abort.send_replace(false);
    }

    /// Drop all license state and cached keys.
    pub fn release_all(&self) {
        let mut inner = self.inner.lock().expect("drm registry poisoned");
        inner.entries.clear();
        inner.aes_keys.clear();
    }

    /// Full teardown: licenses, cached keys and deferred scheduling.
    pub fn reset_all(&self) {
        let mut inner = self.inner.lock().expect("drm registry poisoned");
        inner.entries.clear();
        inner.aes_keys.clear();
        inner.deferred = DeferredLicense::default();
    }

    /// Deferred state snapshot for tests and diagnostics:
    /// `(hash, request_pending, tag_under_processing)`.
    pub fn deferred_state(&self) -> (Option<String>, bool, bool) {
        let inner = self.inner.lock().expect("drm registry poisoned");
        (
            inner.deferred.hash.clone(),
            inner.deferred.request_pending,
            inner.deferred.tag_under_processing,
        )
    }
}

/// Randomized point inside the defer window, spreading licensing load at
/// live-edge key rotations.
fn defer_time(window_seconds: i64) -> Duration {
    let window_ms = (window_seconds.max(1) as u64) * 1000;
    Duration::from_millis(rand::rng().random_range(0..window_ms))
}

/// Big-endian media sequence number in the low 8 bytes, the standard HLS
/// IV derivation when the key tag carries none.
fn iv_from_sequence(sequence_number: i64) -> [u8; 16] {
    let mut iv = [0u8; 16];
    iv[8..].copy_from_slice(&(sequence_number as u64).to_be_bytes());
    iv
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::{ByteRange, FetchedFile};
    use bytes::Bytes;
    use cipher::BlockEncryptMut;
    use std::sync::atomic::{AtomicU32, Ordering};

    type Aes128CbcEnc = cbc::Encryptor<Aes128>;

    fn encrypt(plaintext: &[u8], key: &[u8; 16], iv: &[u8; 16]) -> Vec<u8> {
        let cipher = Aes128CbcEnc::new_from_slices(key, iv).unwrap();
        let padded_len = (plaintext.len() / 16 + 1) * 16;
        let mut buffer = vec![0u8; padded_len];
        buffer[..plaintext.len()].copy_from_slice(plaintext);
        cipher
            .encrypt_padded_mut::<Pkcs7>(&mut buffer, plaintext.len())
            .unwrap()
            .to_vec()
    }

    fn metadata_node(bytes: &[u8]) -> DrmMetadataNode {
        use sha1::{Digest, Sha1};
        let mut hasher = Sha1::new();
        hasher.update(bytes);
        DrmMetadataNode {
            metadata: Bytes::copy_from_slice(bytes),
            sha1_hash: hex::encode(hasher.finalize()),
        }
    }

    struct KeyServer {
        key: [u8; 16],
        fetches: AtomicU32,
    }

    #[async_trait]
    impl FragmentSource for KeyServer {
        async fn get_file(
            &self,
            url: &str,
            _byte_range: Option<ByteRange>,
            _track: TrackKind,
            _is_manifest: bool,
            _token: &CancellationToken,
        ) -> Result<FetchedFile, CollectorError> {
            self.fetches.fetch_add(1, Ordering::Relaxed);
            Ok(FetchedFile {
                body: Bytes::copy_from_slice(&self.key),
                effective_url: url.to_string(),
                status: 200,
            })
        }
    }

    struct InstantProvider {
        key: [u8; 16],
    }

    #[async_trait]
    impl LicenseProvider for InstantProvider {
        async fn acquire(
            &self,
            _metadata: DrmMetadataNode,
            _track: TrackKind,
        ) -> Result<Arc<dyn FragmentDecrypter>, DrmError> {
            Ok(Arc::new(AesCbcDecrypter::new(self.key)))
        }
    }

    struct StalledProvider;

    #[async_trait]
    impl LicenseProvider for StalledProvider {
        async fn acquire(
            &self,
            _metadata: DrmMetadataNode,
            _track: TrackKind,
        ) -> Result<Arc<dyn FragmentDecrypter>, DrmError> {
            std::future::pending().await
        }
    }

    fn registry_with(
        key: [u8; 16],
        provider: Option<Arc<dyn LicenseProvider>>,
    ) -> DrmRegistry {
        DrmRegistry::new(
            Arc::new(KeyServer {
                key,
                fetches: AtomicU32::new(0),
            }),
            provider,
            CancellationToken::new(),
        )
    }

    #[test]
    fn key_attributes_round_trip() {
        let mut ctx = KeyContext::default();
        ctx.apply_key_attributes(
            "METHOD=AES-128,URI=\"https://keys/1\",IV=0x00112233445566778899AABBCCDDEEFF",
            "video",
        )
        .unwrap();
        assert!(ctx.fragment_encrypted);
        assert_eq!(ctx.method, DrmMethod::Aes128);
        assert_eq!(ctx.uri.as_deref(), Some("https://keys/1"));
        assert_eq!(ctx.iv.unwrap()[1], 0x11);

        ctx.apply_key_attributes("METHOD=NONE", "video").unwrap();
        assert!(!ctx.fragment_encrypted);
        assert!(ctx.cm_sha1_hash.is_none());
    }

    #[test]
    fn sample_aes_is_rejected() {
        let mut ctx = KeyContext::default();
        let err = ctx
            .apply_key_attributes("METHOD=SAMPLE-AES,URI=\"x\"", "video")
            .unwrap_err();
        assert!(matches!(err, CollectorError::UnsupportedCrypto { .. }));
    }

    #[test]
    fn metadata_hash_requires_forty_hex_chars() {
        let mut ctx = KeyContext::default();
        assert!(ctx
            .apply_key_attributes("METHOD=AES-128,CMSha1Hash=0x1234", "video")
            .is_err());
        let hash = "a".repeat(40);
        ctx.apply_key_attributes(&format!("METHOD=AES-128,CMSha1Hash=0x{hash}"), "video")
            .unwrap();
        assert_eq!(ctx.cm_sha1_hash.as_deref(), Some(hash.as_str()));
    }

    #[tokio::test]
    async fn vanilla_aes_decrypts_and_caches_key() {
        let key = [0x42u8; 16];
        let iv = [0x24u8; 16];
        let plaintext = b"vanilla aes fragment payload";
        let encrypted = encrypt(plaintext, &key, &iv);

        let server = Arc::new(KeyServer {
            key,
            fetches: AtomicU32::new(0),
        });
        let registry = DrmRegistry::new(server.clone(), None, CancellationToken::new());
        let ctx = KeyContext {
            method: DrmMethod::Aes128,
            uri: Some("https://keys/1".to_string()),
            iv: Some(iv),
            fragment_encrypted: true,
            ..KeyContext::default()
        };

        let out = registry
            .decrypt(None, &ctx, encrypted.clone(), TrackKind::Video, 0)
            .await
            .unwrap();
        assert_eq!(out, plaintext);

        let _ = registry
            .decrypt(None, &ctx, encrypted, TrackKind::Video, 1)
            .await
            .unwrap();
        assert_eq!(server.fetches.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn vanilla_aes_derives_iv_from_sequence() {
        let key = [7u8; 16];
        let seq = 1043i64;
        let iv = iv_from_sequence(seq);
        let plaintext = b"derived iv";
        let encrypted = encrypt(plaintext, &key, &iv);

        let registry = registry_with(key, None);
        let ctx = KeyContext {
            method: DrmMethod::Aes128,
            uri: Some("https://keys/seq".to_string()),
            iv: None,
            fragment_encrypted: true,
            ..KeyContext::default()
        };
        let out = registry
            .decrypt(None, &ctx, encrypted, TrackKind::Audio, seq)
            .await
            .unwrap();
        assert_eq!(out, plaintext);
    }

    #[tokio::test]
    async fn metadata_license_acquisition_and_decrypt() {
        let key = [9u8; 16];
        let iv = [3u8; 16];
        let plaintext = b"licensed payload";
        let encrypted = encrypt(plaintext, &key, &iv);

        let registry = registry_with(key, Some(Arc::new(InstantProvider { key })));
        let node = metadata_node(b"license-metadata");
        registry.set_metadata(&node, TrackKind::Video);

        let ctx = KeyContext {
            method: DrmMethod::Aes128,
            iv: Some(iv),
            cm_sha1_hash: Some(node.sha1_hash.clone()),
            fragment_encrypted: true,
            ..KeyContext::default()
        };
        let out = registry
            .decrypt(Some(&node), &ctx, encrypted, TrackKind::Video, 0)
            .await
            .unwrap();
        assert_eq!(out, plaintext);
    }

    #[tokio::test(start_paused = true)]
    async fn license_wait_times_out() {
        let registry = registry_with([0u8; 16], Some(Arc::new(StalledProvider)));
        let node = metadata_node(b"stalled");
        registry.set_metadata(&node, TrackKind::Video);
        let ctx = KeyContext {
            method: DrmMethod::Aes128,
            iv: Some([0u8; 16]),
            cm_sha1_hash: Some(node.sha1_hash.clone()),
            fragment_encrypted: true,
            ..KeyContext::default()
        };
        let result = registry
            .decrypt(Some(&node), &ctx, vec![0u8; 16], TrackKind::Video, 0)
            .await;
        assert!(matches!(result, Err(DrmError::KeyAcquisitionTimeout)));
    }

    #[tokio::test]
    async fn cancel_wait_all_breaks_license_wait() {
        let registry = Arc::new(registry_with([0u8; 16], Some(Arc::new(StalledProvider))));
        let node = metadata_node(b"cancel-me");
        registry.set_metadata(&node, TrackKind::Video);
        let ctx = KeyContext {
            method: DrmMethod::Aes128,
            iv: Some([0u8; 16]),
            cm_sha1_hash: Some(node.sha1_hash.clone()),
            fragment_encrypted: true,
            ..KeyContext::default()
        };
        let registry2 = Arc::clone(&registry);
        let node2 = node.clone();
        let waiter = tokio::spawn(async move {
            registry2
                .decrypt(Some(&node2), &ctx, vec![0u8; 16], TrackKind::Video, 0)
                .await
        });
        tokio::task::yield_now().await;
        registry.cancel_wait_all();
        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(DrmError::Aborted)));
    }

    #[tokio::test]
    async fn generational_flush_collects_vanished_metadata() {
        let registry = registry_with([0u8; 16], Some(Arc::new(InstantProvider { key: [0; 16] })));
        let a = metadata_node(b"metadata-a");
        let b = metadata_node(b"metadata-b");
        registry.set_metadata(&a, TrackKind::Video);
        registry.set_metadata(&b, TrackKind::Video);
        assert!(registry.is_registered(&a.sha1_hash));

        registry.mark_before_index(TrackKind::Video);
        registry.set_metadata(&b, TrackKind::Video);
        registry.flush_after_index(TrackKind::Video);

        assert!(!registry.is_registered(&a.sha1_hash));
        assert!(registry.is_registered(&b.sha1_hash));
    }

    #[tokio::test]
    async fn deferred_license_lifecycle() {
        let registry = registry_with([0u8; 16], Some(Arc::new(InstantProvider { key: [0; 16] })));
        let current = metadata_node(b"current-period");
        let fresh = metadata_node(b"next-period");
        registry.set_metadata(&current, TrackKind::Video);

        let nodes = vec![current.clone(), fresh.clone()];
        registry.process_defer_window(&nodes, 30, true);
        let (hash, pending, under_processing) = registry.deferred_state();
        assert_eq!(hash.as_deref(), Some(fresh.sha1_hash.as_str()));
        assert!(pending);
        assert!(under_processing);
        assert!(!registry.is_registered(&fresh.sha1_hash));

        // tag still present on next refresh: state stays
        registry.process_defer_window(&nodes, 30, true);
        assert!(registry.deferred_state().1);

        // force the deadline into the past and poll
        {
            let mut inner = registry.inner.lock().unwrap();
            inner.deferred.deadline = Some(Instant::now() - Duration::from_millis(1));
        }
        registry.poll_deferred(&nodes, TrackKind::Video);
        assert!(registry.is_registered(&fresh.sha1_hash));
        assert!(!registry.deferred_state().1);

        // refresh without the tag clears the gate
        registry.clear_defer_if_tag_absent(false);
        assert!(!registry.deferred_state().2);
    }

    #[tokio::test]
    async fn process_metadata_current_only_holds_back_others() {
        let registry = registry_with([0u8; 16], Some(Arc::new(InstantProvider { key: [0; 16] })));
        let a = metadata_node(b"aaa");
        let b = metadata_node(b"bbb");
        let nodes = vec![a.clone(), b.clone()];

        let outcome = registry.process_metadata(
            &nodes,
            Some(a.sha1_hash.as_str()),
            true,
            TrackKind::Video,
        );
        assert_eq!(outcome.current_index, Some(0));
        assert!(outcome.license_request_pending);
        assert!(!outcome.hash_mismatch);
        assert!(registry.is_registered(&a.sha1_hash));
        assert!(!registry.is_registered(&b.sha1_hash));

        let outcome = registry.process_metadata(
            &nodes,
            Some(a.sha1_hash.as_str()),
            false,
            TrackKind::Video,
        );
        assert!(!outcome.license_request_pending);
        assert!(registry.is_registered(&b.sha1_hash));
    }

    #[tokio::test]
    async fn process_metadata_reports_hash_mismatch() {
        let registry = registry_with([0u8; 16], Some(Arc::new(InstantProvider { key: [0; 16] })));
        let a = metadata_node(b"aaa");
        let outcome = registry.process_metadata(
            std::slice::from_ref(&a),
            Some("f".repeat(40).as_str()),
            false,
            TrackKind::Video,
        );
        assert!(outcome.hash_mismatch);
    }
}
