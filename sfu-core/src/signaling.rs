//! Signaling coordinator.
//!
//! Whenever a room's track set or membership changes, the coordinator
//! reconciles every peer in that room: it diffs each peer's senders
//! against the room's forwarding tracks, applies the diff, and drives the
//! peer back to a stable offer/answer state. Reconciles are serialized
//! per room through a capacity-1 mailbox so concurrent triggers collapse
//! into a single pending pass.

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::TrackLocal;

use crate::config::SignalingConfig;
use crate::error::{Error, Result};
use crate::message::WireMessage;
use crate::models::{ClientId, RoomId, TrackId};
use crate::room::{PeerHandle, RoomRegistry};
use crate::track::TrackRegistry;

enum SyncOutcome {
    /// Every peer converged.
    Clean,
    /// The room has no members; nothing to do.
    Empty,
    /// At least one hard operation failed; worth another pass.
    NeedsRetry,
}

pub struct Coordinator {
    rooms: Arc<RoomRegistry>,
    tracks: Arc<TrackRegistry>,
    mailboxes: Mutex<HashMap<RoomId, mpsc::Sender<()>>>,
    max_attempts: u32,
    keyframe_interval: Duration,
}

impl Coordinator {
    pub fn new(
        rooms: Arc<RoomRegistry>,
        tracks: Arc<TrackRegistry>,
        config: &SignalingConfig,
    ) -> Self {
        Self {
            rooms,
            tracks,
            mailboxes: Mutex::new(HashMap::new()),
            max_attempts: config.max_reconcile_attempts.max(1),
            keyframe_interval: Duration::from_secs(config.keyframe_interval_seconds.max(1)),
        }
    }

    /// Request a reconcile of `room_id`. Non-blocking and safe to call
    /// from WebRTC callbacks: the token lands in a capacity-1 mailbox, and
    /// a token already queued covers the new change too.
    pub fn schedule(self: &Arc<Self>, room_id: &RoomId) {
        let sender = {
            let mut mailboxes = self.mailboxes.lock();
            match mailboxes.get(room_id) {
                Some(sender) => sender.clone(),
                None => {
                    let (tx, rx) = mpsc::channel(1);
                    mailboxes.insert(room_id.clone(), tx.clone());
                    tokio::spawn(Arc::clone(self).run_mailbox(room_id.clone(), rx));
                    tx
                }
            }
        };

        match sender.try_send(()) {
            Ok(()) | Err(mpsc::error::TrySendError::Full(())) => {}
            Err(mpsc::error::TrySendError::Closed(())) => {
                debug!(room_id = %room_id, "reconcile mailbox closed, room gone");
            }
        }
    }

    /// Drop a room's mailbox; its consumer task ends once drained. Called
    /// when the room is reaped.
    pub fn forget_room(&self, room_id: &RoomId) {
        self.mailboxes.lock().remove(room_id);
    }

    async fn run_mailbox(self: Arc<Self>, room_id: RoomId, mut rx: mpsc::Receiver<()>) {
        while rx.recv().await.is_some() {
            if self.rooms.contains(&room_id) {
                self.reconcile(&room_id).await;
            }
        }
        debug!(room_id = %room_id, "reconcile mailbox drained");
    }

    /// Bring every peer of `room_id` in line with the room's track set,
    /// retrying up to the configured bound. After the last pass a PLI
    /// round asks every publisher for a fresh keyframe so late joiners
    /// get a decodable picture.
    pub async fn reconcile(&self, room_id: &RoomId) {
        for attempt in 1..=self.max_attempts {
            match self.attempt_sync(room_id).await {
                SyncOutcome::Empty => return,
                SyncOutcome::Clean => {
                    debug!(room_id = %room_id, attempt, "reconcile converged");
                    break;
                }
                SyncOutcome::NeedsRetry if attempt == self.max_attempts => {
                    // Give up for this trigger; the next track or peer
                    // change re-enters reconcile anyway.
                    warn!(room_id = %room_id, attempts = attempt, "reconcile did not converge, giving up");
                }
                SyncOutcome::NeedsRetry => {}
            }
        }

        self.dispatch_keyframes(room_id).await;
    }

    async fn attempt_sync(&self, room_id: &RoomId) -> SyncOutcome {
        let peers = self.rooms.snapshot_peers(room_id);
        if peers.is_empty() {
            return SyncOutcome::Empty;
        }
        let tracks = self.tracks.snapshot_room(room_id);

        let mut needs_retry = false;
        for (client_id, handle) in &peers {
            if let Err(e) = self.sync_peer(client_id, handle, &tracks).await {
                debug!(room_id = %room_id, client_id = %client_id, error = %e, "peer sync failed");
                needs_retry = true;
            }
        }

        if needs_retry {
            SyncOutcome::NeedsRetry
        } else {
            SyncOutcome::Clean
        }
    }

    /// Align one peer's sender set with the room's tracks and, when the
    /// peer is stable and owes an offer, emit one.
    async fn sync_peer(
        &self,
        client_id: &ClientId,
        handle: &PeerHandle,
        tracks: &HashMap<TrackId, Arc<TrackLocalStaticRTP>>,
    ) -> Result<()> {
        let pc = &handle.pc;

        match pc.connection_state() {
            RTCPeerConnectionState::Closed | RTCPeerConnectionState::Failed => return Ok(()),
            _ => {}
        }

        // Track IDs this peer already has a sender or receiver for. The
        // receiver side covers the peer's own published tracks, so a
        // publisher is never re-sent its own media.
        let mut existing: HashSet<TrackId> = HashSet::new();
        let mut changed = false;

        for sender in pc.get_senders().await {
            let Some(track) = sender.track().await else {
                continue;
            };
            let track_id = TrackId::from(track.id());
            if tracks.contains_key(&track_id) {
                existing.insert(track_id);
            } else {
                debug!(client_id = %client_id, track_id = %track_id, "removing obsolete sender");
                pc.remove_track(&sender).await?;
                changed = true;
            }
        }

        for receiver in pc.get_receivers().await {
            let Some(track) = receiver.tracks().await.into_iter().next() else {
                continue;
            };
            let id = track.id();
            if !id.is_empty() {
                existing.insert(TrackId::from(id));
            }
        }

        for (track_id, track) in tracks {
            if !existing.contains(track_id) {
                debug!(client_id = %client_id, track_id = %track_id, "adding track");
                pc.add_track(Arc::clone(track) as Arc<dyn TrackLocal + Send + Sync>)
                    .await?;
                changed = true;
            }
        }

        if changed {
            handle.needs_offer.store(true, Ordering::Relaxed);
        }

        // Mid-negotiation peers keep their sender diff and get the offer
        // on a later reconcile.
        if pc.signaling_state() != RTCSignalingState::Stable {
            debug!(client_id = %client_id, state = %pc.signaling_state(), "not stable, offer deferred");
            return Ok(());
        }
        if !handle.needs_offer.load(Ordering::Relaxed) {
            return Ok(());
        }

        let offer = pc.create_offer(None).await?;
        let frame = WireMessage::offer(&offer)?;
        pc.set_local_description(offer).await?;
        handle
            .writer
            .send(&frame)
            .map_err(Error::Transport)?;
        handle.needs_offer.store(false, Ordering::Relaxed);
        debug!(client_id = %client_id, "offer sent");
        Ok(())
    }

    /// Send an RTCP Picture Loss Indication for every live receiver track
    /// in the room. Errors are per peer, per track and non-fatal.
    pub async fn dispatch_keyframes(&self, room_id: &RoomId) {
        let peers = self.rooms.snapshot_peers(room_id);
        for (client_id, handle) in peers {
            for receiver in handle.pc.get_receivers().await {
                let Some(track) = receiver.tracks().await.into_iter().next() else {
                    continue;
                };
                if track.id().is_empty() {
                    continue;
                }
                let pli = PictureLossIndication {
                    sender_ssrc: 0,
                    media_ssrc: track.ssrc(),
                };
                if let Err(e) = handle.pc.write_rtcp(&[Box::new(pli)]).await {
                    debug!(room_id = %room_id, client_id = %client_id, error = %e, "PLI send failed");
                }
            }
        }
    }

    /// Process-wide keyframe ticker: every interval, snapshot the room
    /// list and run a PLI round for each room.
    pub fn spawn_keyframe_ticker(self: &Arc<Self>) -> JoinHandle<()> {
        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(coordinator.keyframe_interval);
            loop {
                ticker.tick().await;
                for room_id in coordinator.rooms.room_ids() {
                    coordinator.dispatch_keyframes(&room_id).await;
                }
            }
        })
    }
}
