use async_trait::async_trait;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use strum::{AsRefStr, Display, EnumString};
use thiserror::Error;
use tracing::{debug, info, warn};
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, AsRefStr)]
#[strum(serialize_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRefStr)]
#[strum(serialize_all = "lowercase")]
pub enum Facing {
    User,
    Environment,
}

impl Facing {
    pub fn opposite(self) -> Self {
        match self {
            Self::User => Self::Environment,
            Self::Environment => Self::User,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MediaError {
    #[error("permission to capture {0} was denied")]
    PermissionDenied(TrackKind),
    #[error("{kind} device unavailable: {reason}")]
    DeviceUnavailable { kind: TrackKind, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
    pub facing: Facing,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self { audio: true, video: true, facing: Facing::User }
    }
}

/// A local track handle. Muting keeps the RTP sender in place and drops the
/// samples instead, so it never touches the negotiated session.
pub struct MediaTrack {
    kind: TrackKind,
    facing: Option<Facing>,
    enabled: AtomicBool,
    live: AtomicBool,
    rtc: Arc<TrackLocalStaticSample>,
}

impl MediaTrack {
    pub fn new(kind: TrackKind, facing: Option<Facing>, track_id: String, stream_id: String) -> Self {
        let capability = match kind {
            TrackKind::Audio => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: 48000,
                channels: 2,
                ..Default::default()
            },
            TrackKind::Video => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_owned(),
                clock_rate: 90000,
                ..Default::default()
            },
        };
        Self {
            kind,
            facing,
            enabled: AtomicBool::new(true),
            live: AtomicBool::new(true),
            rtc: Arc::new(TrackLocalStaticSample::new(capability, track_id, stream_id)),
        }
    }

    pub fn id(&self) -> &str {
        self.rtc.id()
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    pub fn facing(&self) -> Option<Facing> {
        self.facing
    }

    /// `None` once the track has been released.
    pub fn enabled(&self) -> Option<bool> {
        self.is_live().then(|| self.enabled.load(Ordering::SeqCst))
    }

    /// Returns false, and does nothing, on a released track.
    pub fn set_enabled(&self, enabled: bool) -> bool {
        if !self.is_live() {
            return false;
        }
        self.enabled.store(enabled, Ordering::SeqCst);
        true
    }

    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    pub fn stop(&self) {
        if self.live.swap(false, Ordering::SeqCst) {
            debug!("{} track {} stopped", self.kind, self.id());
        }
    }

    pub fn rtc_track(&self) -> Arc<dyn TrackLocal + Send + Sync> {
        self.rtc.clone()
    }

    /// Feeds one encoded sample. Returns `Ok(false)` when the sample was dropped
    /// because the track is muted or released.
    pub async fn write_sample(&self, sample: &Sample) -> Result<bool, webrtc::Error> {
        if self.enabled() != Some(true) {
            return Ok(false);
        }
        self.rtc.write_sample(sample).await?;
        Ok(true)
    }
}

impl fmt::Debug for MediaTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaTrack")
            .field("id", &self.id())
            .field("kind", &self.kind)
            .field("facing", &self.facing)
            .field("enabled", &self.enabled())
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct MediaTrackSet {
    pub stream_id: String,
    pub audio: Option<Arc<MediaTrack>>,
    pub video: Option<Arc<MediaTrack>>,
}

impl MediaTrackSet {
    pub fn track(&self, kind: TrackKind) -> Option<&Arc<MediaTrack>> {
        match kind {
            TrackKind::Audio => self.audio.as_ref(),
            TrackKind::Video => self.video.as_ref(),
        }
    }

    pub fn tracks(&self) -> impl Iterator<Item = &Arc<MediaTrack>> {
        self.audio.iter().chain(self.video.iter())
    }

    pub fn stop_all(&self) {
        self.tracks().for_each(|t| t.stop());
    }
}

/// Source of local tracks (camera/microphone or an application encoder).
#[async_trait]
pub trait MediaCapture: Send + Sync {
    async fn acquire(&self, constraints: &MediaConstraints) -> Result<MediaTrackSet, MediaError>;

    async fn acquire_video(
        &self,
        facing: Facing,
        stream_id: &str,
    ) -> Result<Arc<MediaTrack>, MediaError>;
}

/// Capture provider whose tracks are fed by the application through
/// [`MediaTrack::write_sample`].
#[derive(Debug)]
pub struct SampleCapture {
    label: String,
    generation: AtomicU64,
}

impl SampleCapture {
    pub fn new(label: impl Into<String>) -> Self {
        Self { label: label.into(), generation: AtomicU64::new(0) }
    }

    fn next_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::SeqCst)
    }
}

#[async_trait]
impl MediaCapture for SampleCapture {
    async fn acquire(&self, constraints: &MediaConstraints) -> Result<MediaTrackSet, MediaError> {
        let n = self.next_generation();
        let stream_id = format!("stream-{}-{}", self.label, n);
        let audio = constraints.audio.then(|| {
            Arc::new(MediaTrack::new(
                TrackKind::Audio,
                None,
                format!("audio-{}-{}", self.label, n),
                stream_id.clone(),
            ))
        });
        let video = if constraints.video {
            Some(self.acquire_video(constraints.facing, &stream_id).await?)
        } else {
            None
        };
        Ok(MediaTrackSet { stream_id, audio, video })
    }

    async fn acquire_video(
        &self,
        facing: Facing,
        stream_id: &str,
    ) -> Result<Arc<MediaTrack>, MediaError> {
        let n = self.next_generation();
        Ok(Arc::new(MediaTrack::new(
            TrackKind::Video,
            Some(facing),
            format!("video-{}-{}-{}", facing, self.label, n),
            stream_id.to_string(),
        )))
    }
}

/// Owns the local tracks of the current call.
#[derive(Debug, Default)]
pub struct MediaTrackController {
    tracks: Option<MediaTrackSet>,
}

impl MediaTrackController {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(
        &mut self,
        capture: &dyn MediaCapture,
        constraints: &MediaConstraints,
    ) -> Result<MediaTrackSet, MediaError> {
        self.release();
        let set = capture.acquire(constraints).await?;
        info!(
            "Local media acquired: stream={}, audio={}, video={}",
            set.stream_id,
            set.audio.is_some(),
            set.video.is_some()
        );
        self.tracks = Some(set.clone());
        Ok(set)
    }

    pub fn tracks(&self) -> Option<&MediaTrackSet> {
        self.tracks.as_ref()
    }

    /// Flips `enabled` on the track of `kind`; returns the new value, or `None`
    /// when there is no such live track.
    pub fn toggle(&self, kind: TrackKind) -> Option<bool> {
        let track = self.tracks.as_ref()?.track(kind)?;
        let enabled = !track.enabled()?;
        track.set_enabled(enabled);
        debug!("{} track {} enabled={}", kind, track.id(), enabled);
        Some(enabled)
    }

    /// Reacquires video with the opposite facing and stops the current capture
    /// once the new track is up. The mute state carries over. If the camera
    /// cannot be opened the current track stays in place.
    pub async fn switch_facing(
        &mut self,
        capture: &dyn MediaCapture,
    ) -> Result<Arc<MediaTrack>, MediaError> {
        let set = self.tracks.as_mut().ok_or_else(|| MediaError::DeviceUnavailable {
            kind: TrackKind::Video,
            reason: "no local media".to_string(),
        })?;

        let current = set.video.as_ref();
        let facing = current.and_then(|t| t.facing()).unwrap_or(Facing::User).opposite();
        let enabled = current.and_then(|t| t.enabled()).unwrap_or(true);

        let track = match capture.acquire_video(facing, &set.stream_id).await {
            Ok(track) => track,
            Err(e) => {
                warn!("Could not switch video to {} facing: {}", facing, e);
                return Err(e);
            }
        };
        track.set_enabled(enabled);
        if let Some(old) = set.video.replace(track.clone()) {
            old.stop();
        }
        info!("Video capture switched to {} facing: {}", facing, track.id());
        Ok(track)
    }

    /// Stops every track. Returns false if nothing was held.
    pub fn release(&mut self) -> bool {
        match self.tracks.take() {
            Some(set) => {
                set.stop_all();
                info!("Local media released: {}", set.stream_id);
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_toggle_flips_enabled() {
        let capture = SampleCapture::new("t");
        let mut media = MediaTrackController::new();
        media.acquire(&capture, &MediaConstraints::default()).await.unwrap();

        assert_eq!(media.toggle(TrackKind::Audio), Some(false));
        assert_eq!(media.toggle(TrackKind::Video), Some(false));
        assert_eq!(media.toggle(TrackKind::Audio), Some(true));

        let set = media.tracks().unwrap();
        assert_eq!(set.audio.as_ref().unwrap().enabled(), Some(true));
        assert_eq!(set.video.as_ref().unwrap().enabled(), Some(false));
    }

    #[tokio::test]
    async fn test_toggle_without_track() {
        let capture = SampleCapture::new("t");
        let mut media = MediaTrackController::new();
        assert_eq!(media.toggle(TrackKind::Audio), None);

        let constraints = MediaConstraints { video: false, ..Default::default() };
        media.acquire(&capture, &constraints).await.unwrap();
        assert_eq!(media.toggle(TrackKind::Video), None);
        assert_eq!(media.toggle(TrackKind::Audio), Some(false));
    }

    #[tokio::test]
    async fn test_release_stops_tracks() {
        let capture = SampleCapture::new("t");
        let mut media = MediaTrackController::new();
        let set = media.acquire(&capture, &MediaConstraints::default()).await.unwrap();

        assert!(media.release());
        assert!(!media.release());
        for track in set.tracks() {
            assert_eq!(track.enabled(), None);
            assert!(!track.set_enabled(true));
            assert_eq!(track.enabled(), None);
        }
        assert_eq!(media.toggle(TrackKind::Audio), None);
    }

    #[tokio::test]
    async fn test_switch_facing_replaces_video() {
        let capture = SampleCapture::new("t");
        let mut media = MediaTrackController::new();
        let set = media.acquire(&capture, &MediaConstraints::default()).await.unwrap();
        let old = set.video.clone().unwrap();
        media.toggle(TrackKind::Video);

        let new = media.switch_facing(&capture).await.unwrap();
        assert!(!old.is_live());
        assert_eq!(new.facing(), Some(Facing::Environment));
        assert_eq!(new.enabled(), Some(false));
        assert_ne!(new.id(), old.id());
        assert_eq!(media.tracks().unwrap().video.as_ref().unwrap().id(), new.id());

        let back = media.switch_facing(&capture).await.unwrap();
        assert_eq!(back.facing(), Some(Facing::User));
    }

    struct BrokenCamera;

    #[async_trait]
    impl MediaCapture for BrokenCamera {
        async fn acquire(&self, _: &MediaConstraints) -> Result<MediaTrackSet, MediaError> {
            Err(MediaError::PermissionDenied(TrackKind::Video))
        }

        async fn acquire_video(&self, _: Facing, _: &str) -> Result<Arc<MediaTrack>, MediaError> {
            Err(MediaError::DeviceUnavailable {
                kind: TrackKind::Video,
                reason: "camera busy".to_string(),
            })
        }
    }

    #[tokio::test]
    async fn test_switch_facing_keeps_track_when_camera_fails() {
        let capture = SampleCapture::new("t");
        let mut media = MediaTrackController::new();
        let set = media.acquire(&capture, &MediaConstraints::default()).await.unwrap();
        let old = set.video.clone().unwrap();
        media.toggle(TrackKind::Video);

        assert!(matches!(
            media.switch_facing(&BrokenCamera).await,
            Err(MediaError::DeviceUnavailable { kind: TrackKind::Video, .. })
        ));
        assert!(old.is_live());
        assert_eq!(media.tracks().unwrap().video.as_ref().unwrap().id(), old.id());
        assert_eq!(media.toggle(TrackKind::Video), Some(true));
    }

    #[tokio::test]
    async fn test_switch_facing_without_media() {
        let capture = SampleCapture::new("t");
        let mut media = MediaTrackController::new();
        assert!(matches!(
            media.switch_facing(&capture).await,
            Err(MediaError::DeviceUnavailable { kind: TrackKind::Video, .. })
        ));
    }

    #[tokio::test]
    async fn test_muted_track_drops_samples() {
        let track =
            MediaTrack::new(TrackKind::Audio, None, "a".to_string(), "s".to_string());
        track.set_enabled(false);
        assert!(!track.write_sample(&Sample::default()).await.unwrap());
        track.set_enabled(true);
        track.stop();
        assert!(!track.write_sample(&Sample::default()).await.unwrap());
    }
}
