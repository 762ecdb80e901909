//! In-memory doubles for transport traits, shared by the unit tests.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use webrtc::api::media_engine::MIME_TYPE_VP8;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;

use crate::message::WireMessage;
use crate::peer::{SignalStream, SignalWriter};

/// Writer that records every frame it is handed.
#[derive(Default)]
pub struct CollectingWriter {
    frames: Mutex<Vec<WireMessage>>,
}

impl CollectingWriter {
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn frames(&self) -> Vec<WireMessage> {
        self.frames.lock().clone()
    }
}

impl SignalWriter for CollectingWriter {
    fn send(&self, frame: &WireMessage) -> Result<(), String> {
        self.frames.lock().push(frame.clone());
        Ok(())
    }
}

/// Stream that replays a fixed script of frames and then reports a clean
/// close.
pub struct ScriptedStream {
    frames: VecDeque<WireMessage>,
}

impl ScriptedStream {
    pub fn new(frames: Vec<WireMessage>) -> Self {
        Self {
            frames: frames.into(),
        }
    }

    pub fn remaining(&self) -> usize {
        self.frames.len()
    }
}

#[async_trait::async_trait]
impl SignalStream for ScriptedStream {
    async fn recv(&mut self) -> Option<Result<WireMessage, String>> {
        self.frames.pop_front().map(Ok)
    }
}

/// A VP8 forwarding track with the given ID, detached from any publisher.
pub fn forwarding_track(id: &str) -> Arc<TrackLocalStaticRTP> {
    Arc::new(TrackLocalStaticRTP::new(
        RTCRtpCodecCapability {
            mime_type: MIME_TYPE_VP8.to_string(),
            ..Default::default()
        },
        id.to_string(),
        format!("stream-{id}"),
    ))
}
