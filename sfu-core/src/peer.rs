//! Per-client peer sessions.
//!
//! One task per socket. A client session owns the peer connection, pumps
//! RTP from its remote tracks into the track registry and drains the
//! signaling inbox; a server session drives the room-registration control
//! loop. Both run over the [`SignalStream`] / [`SignalWriter`] traits so
//! the transport (WebSocket today) stays out of this crate.

use async_trait::async_trait;
use std::sync::{Arc, Weak};
use tracing::{debug, error, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::{TrackLocal, TrackLocalWriter};
use webrtc::track::track_remote::TrackRemote;

use crate::error::Result;
use crate::message::{
    ClientJoin, WireMessage, EVENT_ANSWER, EVENT_CANDIDATE, EVENT_CLIENT_JOIN, EVENT_KEEP_ALIVE,
    EVENT_SERVER_REGISTER,
};
use crate::message::ServerRegistration;
use crate::models::{ClientId, RoomId, TrackId};
use crate::room::PeerHandle;
use crate::system::System;

/// Sink for outbound frames.
///
/// Several tasks write to the same socket (the inbox loop, the ICE
/// candidate callback, the coordinator); implementations must make each
/// `send` atomic with respect to the others and must not block, so it is
/// safe to call from WebRTC callbacks.
pub trait SignalWriter: Send + Sync {
    fn send(&self, frame: &WireMessage) -> std::result::Result<(), String>;
}

/// Source of inbound frames.
///
/// `recv` returns `None` when the connection closed cleanly and
/// `Some(Err(_))` for transport or framing errors, which are fatal to the
/// session.
#[async_trait]
pub trait SignalStream: Send {
    async fn recv(&mut self) -> Option<std::result::Result<WireMessage, String>>;
}

/// Build a peer connection with the default codec set and interceptors,
/// prepared to receive one audio and one video track without further
/// negotiation.
pub async fn create_peer_connection(
    ice_servers: Vec<RTCIceServer>,
) -> Result<Arc<RTCPeerConnection>> {
    let mut media_engine = MediaEngine::default();
    media_engine.register_default_codecs()?;

    let mut registry = Registry::new();
    registry = register_default_interceptors(registry, &mut media_engine)?;

    let api = APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build();

    let pc = Arc::new(
        api.new_peer_connection(RTCConfiguration {
            ice_servers,
            ..Default::default()
        })
        .await?,
    );

    for kind in [RTPCodecType::Video, RTPCodecType::Audio] {
        pc.add_transceiver_from_kind(
            kind,
            Some(RTCRtpTransceiverInit {
                direction: RTCRtpTransceiverDirection::Recvonly,
                send_encodings: vec![],
            }),
        )
        .await?;
    }

    Ok(pc)
}

/// Session for a client socket: join handshake, peer connection lifecycle
/// and the signaling inbox.
pub struct ClientSession {
    system: Arc<System>,
    client_id: ClientId,
    writer: Arc<dyn SignalWriter>,
}

impl ClientSession {
    pub fn new(system: Arc<System>, client_id: ClientId, writer: Arc<dyn SignalWriter>) -> Self {
        Self {
            system,
            client_id,
            writer,
        }
    }

    /// Run the session to completion. Returns when the socket closes, the
    /// peer misbehaves, or the peer connection dies; all paths release the
    /// room membership and trigger a final reconcile.
    pub async fn run<S: SignalStream>(self, stream: &mut S) {
        let Some(first) = stream.recv().await else {
            return;
        };
        let first = match first {
            Ok(frame) => frame,
            Err(e) => {
                debug!(client_id = %self.client_id, error = %e, "client socket failed before join");
                return;
            }
        };

        if first.event != EVENT_CLIENT_JOIN {
            warn!(client_id = %self.client_id, event = %first.event, "first frame was not client_join");
            let _ = self
                .writer
                .send(&WireMessage::room_error("expected client_join event"));
            return;
        }

        let join: ClientJoin = match first.payload() {
            Ok(join) => join,
            Err(e) => {
                warn!(client_id = %self.client_id, error = %e, "invalid join payload");
                let _ = self.writer.send(&WireMessage::room_error("invalid join data"));
                return;
            }
        };
        let room_id = RoomId::from(join.room_id);

        if let Err(e) =
            self.system
                .rooms()
                .validate_client_join(&room_id, &join.server_id, &join.server_token)
        {
            warn!(client_id = %self.client_id, room_id = %room_id, error = %e, "join rejected");
            let _ = self
                .writer
                .send(&WireMessage::room_error(format!("join rejected: {e}")));
            return;
        }

        let pc = match create_peer_connection(self.system.config().webrtc.ice_servers()).await {
            Ok(pc) => pc,
            Err(e) => {
                error!(client_id = %self.client_id, error = %e, "failed to create peer connection");
                let _ = self
                    .writer
                    .send(&WireMessage::room_error("failed to create peer connection"));
                return;
            }
        };

        self.bind_callbacks(&pc, &room_id);

        let handle = PeerHandle::new(Arc::clone(&pc), Arc::clone(&self.writer));
        if let Err(e) = self
            .system
            .rooms()
            .add_peer(&room_id, self.client_id.clone(), handle)
        {
            warn!(client_id = %self.client_id, room_id = %room_id, error = %e, "could not join room");
            let _ = self
                .writer
                .send(&WireMessage::room_error(format!("join rejected: {e}")));
            let _ = pc.close().await;
            return;
        }

        let _ = self
            .writer
            .send(&WireMessage::room_joined(format!("joined room {room_id}")));
        self.system.coordinator().schedule(&room_id);
        info!(client_id = %self.client_id, room_id = %room_id, "client joined");

        self.drive(stream, &pc).await;

        // Teardown, on every exit path of the inbox loop.
        self.system.rooms().remove_peer(&room_id, &self.client_id);
        if let Err(e) = pc.close().await {
            debug!(client_id = %self.client_id, error = %e, "peer connection close failed");
        }
        self.system.coordinator().schedule(&room_id);
        info!(client_id = %self.client_id, room_id = %room_id, "client left");
    }

    /// Drain the signaling inbox until the socket closes or a protocol
    /// violation ends the session.
    async fn drive<S: SignalStream>(&self, stream: &mut S, pc: &Arc<RTCPeerConnection>) {
        while let Some(frame) = stream.recv().await {
            let frame = match frame {
                Ok(frame) => frame,
                Err(e) => {
                    debug!(client_id = %self.client_id, error = %e, "client socket read failed");
                    return;
                }
            };

            match frame.event.as_str() {
                EVENT_CANDIDATE => {
                    let candidate: RTCIceCandidateInit = match frame.payload() {
                        Ok(candidate) => candidate,
                        Err(e) => {
                            warn!(client_id = %self.client_id, error = %e, "malformed ICE candidate");
                            return;
                        }
                    };
                    if let Err(e) = pc.add_ice_candidate(candidate).await {
                        warn!(client_id = %self.client_id, error = %e, "failed to add ICE candidate");
                        return;
                    }
                }
                EVENT_ANSWER => {
                    let answer: RTCSessionDescription = match frame.payload() {
                        Ok(answer) => answer,
                        Err(e) => {
                            warn!(client_id = %self.client_id, error = %e, "malformed answer");
                            return;
                        }
                    };
                    if let Err(e) = pc.set_remote_description(answer).await {
                        warn!(client_id = %self.client_id, error = %e, "failed to apply answer");
                        return;
                    }
                }
                EVENT_KEEP_ALIVE => {}
                other => {
                    debug!(client_id = %self.client_id, event = other, "unknown event ignored");
                }
            }
        }
    }

    /// Wire the peer-connection callbacks. Handlers only enqueue work and
    /// return promptly; the RTP pump runs in its own task.
    fn bind_callbacks(&self, pc: &Arc<RTCPeerConnection>, room_id: &RoomId) {
        // Trickle ICE: forward every discovered candidate to the client.
        {
            let writer = Arc::clone(&self.writer);
            let client_id = self.client_id.clone();
            pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                let writer = Arc::clone(&writer);
                let client_id = client_id.clone();
                Box::pin(async move {
                    let Some(candidate) = candidate else {
                        return;
                    };
                    let frame = candidate
                        .to_json()
                        .map_err(crate::Error::from)
                        .and_then(|init| WireMessage::candidate(&init));
                    match frame {
                        Ok(frame) => {
                            if let Err(e) = writer.send(&frame) {
                                debug!(client_id = %client_id, error = %e, "failed to send ICE candidate");
                            }
                        }
                        Err(e) => {
                            debug!(client_id = %client_id, error = %e, "failed to encode ICE candidate");
                        }
                    }
                })
            }));
        }

        {
            let system = Arc::clone(&self.system);
            let client_id = self.client_id.clone();
            let room_id = room_id.clone();
            let weak_pc: Weak<RTCPeerConnection> = Arc::downgrade(pc);
            pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
                let system = Arc::clone(&system);
                let client_id = client_id.clone();
                let room_id = room_id.clone();
                let weak_pc = weak_pc.clone();
                Box::pin(async move {
                    debug!(client_id = %client_id, ?state, "peer connection state changed");
                    match state {
                        RTCPeerConnectionState::Failed => {
                            if let Some(pc) = weak_pc.upgrade() {
                                if let Err(e) = pc.close().await {
                                    debug!(client_id = %client_id, error = %e, "close after failure");
                                }
                            }
                        }
                        RTCPeerConnectionState::Closed => {
                            system.coordinator().schedule(&room_id);
                        }
                        RTCPeerConnectionState::Connected => {
                            info!(client_id = %client_id, room_id = %room_id, "peer connected");
                        }
                        _ => {}
                    }
                })
            }));
        }

        {
            let system = Arc::clone(&self.system);
            let client_id = self.client_id.clone();
            let room_id = room_id.clone();
            pc.on_track(Box::new(move |track, _receiver, _transceiver| {
                let system = Arc::clone(&system);
                let client_id = client_id.clone();
                let room_id = room_id.clone();
                Box::pin(async move {
                    info!(
                        client_id = %client_id,
                        room_id = %room_id,
                        track_id = %track.id(),
                        kind = %track.kind(),
                        ssrc = track.ssrc(),
                        "incoming track"
                    );

                    let forward = system.tracks().add_to_room(&room_id, &track);
                    system.rooms().touch(&room_id);
                    system.coordinator().schedule(&room_id);

                    // The read loop must not run inside the callback; it
                    // would hold the handler slot for the connection's
                    // lifetime and starve later tracks.
                    tokio::spawn(forward_rtp(system, room_id, client_id, track, forward));
                })
            }));
        }
    }
}

/// Pump RTP from a publisher's remote track into its forwarding track
/// until the remote side ends, then retire the forwarding track.
async fn forward_rtp(
    system: Arc<System>,
    room_id: RoomId,
    client_id: ClientId,
    remote: Arc<TrackRemote>,
    forward: Arc<TrackLocalStaticRTP>,
) {
    let verbose = system.config().logging.verbose_rtp;
    let mut buf = vec![0u8; 1500];
    let mut forwarded: u64 = 0;

    loop {
        let (packet, _) = match remote.read(&mut buf).await {
            Ok(read) => read,
            Err(e) => {
                debug!(client_id = %client_id, track_id = %remote.id(), error = %e, "track read ended");
                break;
            }
        };
        if let Err(e) = forward.write_rtp(&packet).await {
            debug!(client_id = %client_id, track_id = %remote.id(), error = %e, "forwarding write failed");
            break;
        }
        forwarded += 1;
        if verbose && forwarded % 1000 == 0 {
            debug!(client_id = %client_id, track_id = %remote.id(), forwarded, "RTP packets forwarded");
        }
    }

    let track_id = TrackId::from(forward.id());
    system.tracks().remove_from_room(&room_id, &track_id);
    system.rooms().touch(&room_id);
    system.coordinator().schedule(&room_id);
}

/// Session for a server socket: the room-registration control loop. One
/// socket may register any number of rooms over its lifetime.
pub struct ServerSession {
    system: Arc<System>,
    client_id: ClientId,
    writer: Arc<dyn SignalWriter>,
}

impl ServerSession {
    pub fn new(system: Arc<System>, client_id: ClientId, writer: Arc<dyn SignalWriter>) -> Self {
        Self {
            system,
            client_id,
            writer,
        }
    }

    pub async fn run<S: SignalStream>(self, stream: &mut S) {
        while let Some(frame) = stream.recv().await {
            let frame = match frame {
                Ok(frame) => frame,
                Err(e) => {
                    debug!(client_id = %self.client_id, error = %e, "server socket read failed");
                    return;
                }
            };

            match frame.event.as_str() {
                EVENT_SERVER_REGISTER => {
                    let registration: ServerRegistration = match frame.payload() {
                        Ok(registration) => registration,
                        Err(e) => {
                            warn!(client_id = %self.client_id, error = %e, "invalid registration payload");
                            let _ = self
                                .writer
                                .send(&WireMessage::room_error("invalid registration data"));
                            continue;
                        }
                    };
                    let room_id = RoomId::from(registration.room_id);
                    match self.system.rooms().register_server(
                        &registration.server_id,
                        &registration.server_token,
                        &room_id,
                    ) {
                        Ok(()) => {
                            info!(
                                server_id = %registration.server_id,
                                room_id = %room_id,
                                "server registered room"
                            );
                            let _ = self
                                .writer
                                .send(&WireMessage::room_joined("server registered successfully"));
                        }
                        Err(e) => {
                            warn!(server_id = %registration.server_id, room_id = %room_id, error = %e, "registration failed");
                            let _ = self
                                .writer
                                .send(&WireMessage::room_error(format!("registration failed: {e}")));
                        }
                    }
                }
                EVENT_KEEP_ALIVE => {}
                other => {
                    debug!(client_id = %self.client_id, event = other, "unknown server event ignored");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::message::EVENT_ROOM_ERROR;
    use crate::message::EVENT_ROOM_JOINED;
    use crate::test_helpers::{CollectingWriter, ScriptedStream};

    fn join_frame(room: &str, server: &str, token: &str) -> WireMessage {
        let join = ClientJoin {
            room_id: room.to_string(),
            server_id: server.to_string(),
            server_token: token.to_string(),
            user_token: String::new(),
        };
        WireMessage::new(EVENT_CLIENT_JOIN, serde_json::to_string(&join).unwrap())
    }

    #[tokio::test]
    async fn test_recvonly_transceivers_prepared() {
        let pc = create_peer_connection(vec![]).await.unwrap();
        let transceivers = pc.get_transceivers().await;
        assert_eq!(transceivers.len(), 2);
        pc.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_first_frame_must_be_join() {
        let system = System::new(Config::default());
        let writer = CollectingWriter::shared();
        let session = ClientSession::new(system, ClientId::generate(), writer.clone());

        let mut stream = ScriptedStream::new(vec![WireMessage::keep_alive()]);
        session.run(&mut stream).await;

        let frames = writer.frames();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].event, EVENT_ROOM_ERROR);
    }

    #[tokio::test]
    async fn test_join_rejected_for_unregistered_server() {
        let system = System::new(Config::default());
        let writer = CollectingWriter::shared();
        let session = ClientSession::new(system.clone(), ClientId::generate(), writer.clone());

        let mut stream = ScriptedStream::new(vec![join_frame("r1", "ghost", "tok")]);
        session.run(&mut stream).await;

        let frames = writer.frames();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].event, EVENT_ROOM_ERROR);
        assert!(frames[0].data.contains("not registered"));
        assert!(!system.rooms().contains(&RoomId::from("r1")));
    }

    #[tokio::test]
    async fn test_join_and_clean_leave() {
        let system = System::new(Config::default());
        let room = RoomId::from("r1");
        system.rooms().register_server("s1", "t1", &room).unwrap();

        let writer = CollectingWriter::shared();
        let client_id = ClientId::generate();
        let session = ClientSession::new(system.clone(), client_id.clone(), writer.clone());

        // Join, one keep-alive, then the socket closes.
        let mut stream = ScriptedStream::new(vec![
            join_frame("r1", "s1", "t1"),
            WireMessage::keep_alive(),
        ]);
        session.run(&mut stream).await;

        let frames = writer.frames();
        assert_eq!(frames[0].event, EVENT_ROOM_JOINED);
        // Membership released on socket close.
        assert!(system.rooms().snapshot_peers(&room).is_empty());
    }

    #[tokio::test]
    async fn test_malformed_candidate_ends_session() {
        let system = System::new(Config::default());
        let room = RoomId::from("r1");
        system.rooms().register_server("s1", "t1", &room).unwrap();

        let writer = CollectingWriter::shared();
        let session = ClientSession::new(system.clone(), ClientId::generate(), writer.clone());

        let mut stream = ScriptedStream::new(vec![
            join_frame("r1", "s1", "t1"),
            WireMessage::new(EVENT_CANDIDATE, "not json"),
            WireMessage::keep_alive(),
        ]);
        session.run(&mut stream).await;

        // The keep-alive after the bad candidate was never consumed.
        assert_eq!(stream.remaining(), 1);
        assert!(system.rooms().snapshot_peers(&room).is_empty());
    }

    #[tokio::test]
    async fn test_server_session_registers_rooms() {
        let system = System::new(Config::default());
        let writer = CollectingWriter::shared();
        let session = ServerSession::new(system.clone(), ClientId::generate(), writer.clone());

        let reg = |room: &str, token: &str| {
            let payload = ServerRegistration {
                server_id: "s1".to_string(),
                server_token: token.to_string(),
                room_id: room.to_string(),
            };
            WireMessage::new(
                EVENT_SERVER_REGISTER,
                serde_json::to_string(&payload).unwrap(),
            )
        };

        let mut stream = ScriptedStream::new(vec![
            reg("r1", "t1"),
            reg("r2", "t1"),
            reg("r3", "t2"), // token mismatch
        ]);
        session.run(&mut stream).await;

        let frames = writer.frames();
        assert_eq!(frames[0].event, EVENT_ROOM_JOINED);
        assert_eq!(frames[1].event, EVENT_ROOM_JOINED);
        assert_eq!(frames[2].event, EVENT_ROOM_ERROR);
        assert!(system.rooms().contains(&RoomId::from("r1")));
        assert!(system.rooms().contains(&RoomId::from("r2")));
        assert!(!system.rooms().contains(&RoomId::from("r3")));
    }
}
