use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use super::{
    LocalTrack, MediaConstraints, MediaDevices, MediaError, MediaHandle, TrackInfo, TrackKind,
};

/// Capture backend for hosts without devices: hands out sample tracks the
/// webrtc adapter can send, with nothing written to them.
#[derive(Debug, Default)]
pub struct SyntheticMedia;

fn sample_track(kind: TrackKind, stream_id: &str) -> LocalTrack {
    let (mime_type, id) = match kind {
        TrackKind::Audio => (MIME_TYPE_OPUS, "audio"),
        TrackKind::Video => (MIME_TYPE_VP8, "video"),
    };
    let track = Arc::new(TrackLocalStaticSample::new(
        RTCRtpCodecCapability {
            mime_type: mime_type.to_owned(),
            ..Default::default()
        },
        id.to_owned(),
        stream_id.to_owned(),
    ));
    LocalTrack::new(
        TrackInfo {
            id: id.to_owned(),
            stream_id: stream_id.to_owned(),
            kind,
        },
        track,
    )
}

#[async_trait]
impl MediaDevices for SyntheticMedia {
    async fn acquire_local_media(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<MediaHandle, MediaError> {
        if !constraints.audio && !constraints.video {
            return Err(MediaError::DeviceUnavailable(
                "no audio or video requested".into(),
            ));
        }
        let stream_id = format!("tandem-{}", Uuid::new_v4());
        let mut tracks = Vec::new();
        if constraints.audio {
            tracks.push(sample_track(TrackKind::Audio, &stream_id));
        }
        if constraints.video {
            tracks.push(sample_track(TrackKind::Video, &stream_id));
        }
        tracing::debug!(
            target: "tandem::media",
            stream = %stream_id,
            tracks = tracks.len(),
            "synthetic media acquired"
        );
        Ok(MediaHandle { stream_id, tracks })
    }

    async fn release_media(&self, handle: MediaHandle) {
        tracing::debug!(
            target: "tandem::media",
            stream = %handle.stream_id,
            "synthetic media released"
        );
    }
}
