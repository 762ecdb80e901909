//! Room registry: which rooms exist, which application server owns them,
//! and which peers are currently members.
//!
//! Locking is two-level: one write-preferring registry lock over the room
//! and server maps, and a per-room mutex over the member map. The order is
//! always registry first, room second, and every iteration outside this
//! module goes through snapshot copies taken here.

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};
use webrtc::peer_connection::RTCPeerConnection;

use crate::error::{Error, Result};
use crate::models::{ClientId, RoomId};
use crate::peer::SignalWriter;

/// A member entry: the peer connection, the serialized socket writer, and
/// the pending-offer marker consumed by the signaling coordinator.
#[derive(Clone)]
pub struct PeerHandle {
    pub pc: Arc<RTCPeerConnection>,
    pub writer: Arc<dyn SignalWriter>,
    pub needs_offer: Arc<AtomicBool>,
}

impl PeerHandle {
    pub fn new(pc: Arc<RTCPeerConnection>, writer: Arc<dyn SignalWriter>) -> Self {
        Self {
            pc,
            writer,
            // A fresh member always needs its initial offer.
            needs_offer: Arc::new(AtomicBool::new(true)),
        }
    }
}

pub struct Room {
    pub id: RoomId,
    pub server_id: String,
    created_at: Instant,
    state: Mutex<RoomState>,
}

struct RoomState {
    peers: HashMap<ClientId, PeerHandle>,
    last_activity: Instant,
}

impl Room {
    fn new(id: RoomId, server_id: String) -> Arc<Self> {
        let now = Instant::now();
        Arc::new(Self {
            id,
            server_id,
            created_at: now,
            state: Mutex::new(RoomState {
                peers: HashMap::new(),
                last_activity: now,
            }),
        })
    }
}

#[derive(Default)]
struct RegistryInner {
    rooms: HashMap<RoomId, Arc<Room>>,
    /// serverID -> serverToken; tokens are opaque bearer strings compared
    /// for equality.
    server_tokens: HashMap<String, String>,
    server_rooms: HashMap<String, Vec<RoomId>>,
}

/// Authoritative registry of rooms, their owning servers and their members.
#[derive(Default)]
pub struct RoomRegistry {
    inner: RwLock<RegistryInner>,
    /// Auto-create a missing room on a validated client join.
    auto_create_on_join: bool,
}

impl RoomRegistry {
    #[must_use]
    pub fn new(auto_create_on_join: bool) -> Self {
        Self {
            inner: RwLock::default(),
            auto_create_on_join,
        }
    }

    /// Register a server and bind `room_id` to it, creating the room if
    /// absent. Re-registering with an identical token is a no-op success;
    /// a differing token fails, as does a room owned by another server.
    pub fn register_server(
        &self,
        server_id: &str,
        server_token: &str,
        room_id: &RoomId,
    ) -> Result<()> {
        let mut inner = self.inner.write();

        match inner.server_tokens.get(server_id) {
            Some(existing) if existing != server_token => {
                return Err(Error::TokenMismatch(server_id.to_string()));
            }
            Some(_) => {}
            None => {
                inner
                    .server_tokens
                    .insert(server_id.to_string(), server_token.to_string());
                debug!(server_id, "server registered");
            }
        }

        if let Some(room) = inner.rooms.get(room_id) {
            if room.server_id != server_id {
                return Err(Error::RoomOwnedByOtherServer(room_id.clone()));
            }
            return Ok(());
        }

        Self::create_room(&mut inner, room_id, server_id);
        info!(room_id = %room_id, server_id, total_rooms = inner.rooms.len(), "room created");
        Ok(())
    }

    /// Check that a client may join `room_id` on behalf of `server_id`.
    ///
    /// Succeeds iff the server is registered under `server_token` and the
    /// room is owned by that server. A missing room is auto-created under
    /// the joining server when the policy flag allows it.
    pub fn validate_client_join(
        &self,
        room_id: &RoomId,
        server_id: &str,
        server_token: &str,
    ) -> Result<()> {
        let mut inner = self.inner.write();

        match inner.server_tokens.get(server_id) {
            None => return Err(Error::ServerNotRegistered(server_id.to_string())),
            Some(token) if token != server_token => {
                return Err(Error::InvalidToken(server_id.to_string()));
            }
            Some(_) => {}
        }

        match inner.rooms.get(room_id) {
            Some(room) if room.server_id == server_id => Ok(()),
            Some(_) => Err(Error::RoomOwnedByOtherServer(room_id.clone())),
            None if self.auto_create_on_join => {
                Self::create_room(&mut inner, room_id, server_id);
                info!(room_id = %room_id, server_id, "room auto-created on client join");
                Ok(())
            }
            None => Err(Error::RoomNotFound(room_id.clone())),
        }
    }

    fn create_room(inner: &mut RegistryInner, room_id: &RoomId, server_id: &str) {
        let room = Room::new(room_id.clone(), server_id.to_string());
        inner.rooms.insert(room_id.clone(), room);
        inner
            .server_rooms
            .entry(server_id.to_string())
            .or_default()
            .push(room_id.clone());
    }

    pub fn add_peer(&self, room_id: &RoomId, client_id: ClientId, handle: PeerHandle) -> Result<()> {
        let inner = self.inner.read();
        let room = inner
            .rooms
            .get(room_id)
            .ok_or_else(|| Error::RoomNotFound(room_id.clone()))?;

        let mut state = room.state.lock();
        state.peers.insert(client_id.clone(), handle);
        state.last_activity = Instant::now();
        debug!(room_id = %room_id, client_id = %client_id, peers = state.peers.len(), "peer added");
        Ok(())
    }

    pub fn remove_peer(&self, room_id: &RoomId, client_id: &ClientId) {
        let inner = self.inner.read();
        let Some(room) = inner.rooms.get(room_id) else {
            return;
        };

        let mut state = room.state.lock();
        if state.peers.remove(client_id).is_some() {
            state.last_activity = Instant::now();
            debug!(room_id = %room_id, client_id = %client_id, peers = state.peers.len(), "peer removed");
        }
    }

    /// Bump a room's activity clock. Called on track mutations, which live
    /// in the track registry but count as room activity.
    pub fn touch(&self, room_id: &RoomId) {
        let inner = self.inner.read();
        if let Some(room) = inner.rooms.get(room_id) {
            room.state.lock().last_activity = Instant::now();
        }
    }

    /// Defensive copy of a room's member map.
    #[must_use]
    pub fn snapshot_peers(&self, room_id: &RoomId) -> HashMap<ClientId, PeerHandle> {
        let inner = self.inner.read();
        inner
            .rooms
            .get(room_id)
            .map(|room| room.state.lock().peers.clone())
            .unwrap_or_default()
    }

    /// Defensive copy of the socket writers of a room's members.
    #[must_use]
    pub fn snapshot_writers(&self, room_id: &RoomId) -> HashMap<ClientId, Arc<dyn SignalWriter>> {
        let inner = self.inner.read();
        inner
            .rooms
            .get(room_id)
            .map(|room| {
                room.state
                    .lock()
                    .peers
                    .iter()
                    .map(|(id, handle)| (id.clone(), Arc::clone(&handle.writer)))
                    .collect()
            })
            .unwrap_or_default()
    }

    #[must_use]
    pub fn contains(&self, room_id: &RoomId) -> bool {
        self.inner.read().rooms.contains_key(room_id)
    }

    #[must_use]
    pub fn room_owner(&self, room_id: &RoomId) -> Option<String> {
        self.inner
            .read()
            .rooms
            .get(room_id)
            .map(|room| room.server_id.clone())
    }

    #[must_use]
    pub fn room_ids(&self) -> Vec<RoomId> {
        self.inner.read().rooms.keys().cloned().collect()
    }

    #[must_use]
    pub fn rooms_of_server(&self, server_id: &str) -> Vec<RoomId> {
        self.inner
            .read()
            .server_rooms
            .get(server_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Delete every room that has no members and has been idle for longer
    /// than `max_idle`, unlinking it from its server's room list. Returns
    /// the reaped room IDs so the caller can release associated resources.
    pub fn reap_idle(&self, max_idle: Duration) -> Vec<RoomId> {
        let mut inner = self.inner.write();

        let reap: Vec<RoomId> = inner
            .rooms
            .iter()
            .filter(|(_, room)| {
                let state = room.state.lock();
                state.peers.is_empty() && state.last_activity.elapsed() > max_idle
            })
            .map(|(id, _)| id.clone())
            .collect();

        for room_id in &reap {
            let Some(room) = inner.rooms.remove(room_id) else {
                continue;
            };
            if let Some(rooms) = inner.server_rooms.get_mut(&room.server_id) {
                rooms.retain(|id| id != room_id);
                if rooms.is_empty() {
                    inner.server_rooms.remove(&room.server_id);
                }
            }
            info!(
                room_id = %room_id,
                server_id = %room.server_id,
                lifetime_secs = room.created_at.elapsed().as_secs(),
                "idle room reaped"
            );
        }

        reap
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::create_peer_connection;
    use crate::test_helpers::CollectingWriter;

    async fn test_handle() -> PeerHandle {
        let pc = create_peer_connection(vec![]).await.unwrap();
        PeerHandle::new(pc, CollectingWriter::shared())
    }

    #[test]
    fn test_register_is_idempotent_with_same_token() {
        let registry = RoomRegistry::new(true);
        let room = RoomId::from("r1");
        registry.register_server("s1", "t1", &room).unwrap();
        registry.register_server("s1", "t1", &room).unwrap();
        assert_eq!(registry.room_owner(&room).as_deref(), Some("s1"));
    }

    #[test]
    fn test_register_token_mismatch_keeps_first_registration() {
        let registry = RoomRegistry::new(true);
        let room = RoomId::from("r1");
        registry.register_server("s1", "t1", &room).unwrap();

        let err = registry.register_server("s1", "t2", &room).unwrap_err();
        assert!(matches!(err, Error::TokenMismatch(_)));
        assert_eq!(registry.room_owner(&room).as_deref(), Some("s1"));
        assert!(registry
            .validate_client_join(&room, "s1", "t1")
            .is_ok());
    }

    #[test]
    fn test_room_ownership_is_stable() {
        let registry = RoomRegistry::new(true);
        let room = RoomId::from("r1");
        registry.register_server("s1", "t1", &room).unwrap();

        let err = registry.register_server("s2", "t2", &room).unwrap_err();
        assert!(matches!(err, Error::RoomOwnedByOtherServer(_)));
        assert_eq!(registry.room_owner(&room).as_deref(), Some("s1"));
    }

    #[test]
    fn test_join_requires_ownership() {
        let registry = RoomRegistry::new(true);
        let room = RoomId::from("r1");
        registry.register_server("s1", "t1", &room).unwrap();
        registry
            .register_server("s2", "t2", &RoomId::from("other"))
            .unwrap();

        let err = registry
            .validate_client_join(&room, "s2", "t2")
            .unwrap_err();
        assert!(matches!(err, Error::RoomOwnedByOtherServer(_)));
    }

    #[test]
    fn test_join_rejects_unknown_server_and_bad_token() {
        let registry = RoomRegistry::new(true);
        let room = RoomId::from("r1");
        registry.register_server("s1", "t1", &room).unwrap();

        assert!(matches!(
            registry.validate_client_join(&room, "ghost", "t1"),
            Err(Error::ServerNotRegistered(_))
        ));
        assert!(matches!(
            registry.validate_client_join(&room, "s1", "wrong"),
            Err(Error::InvalidToken(_))
        ));
    }

    #[test]
    fn test_join_auto_creates_when_policy_allows() {
        let registry = RoomRegistry::new(true);
        registry
            .register_server("s1", "t1", &RoomId::from("seed"))
            .unwrap();

        let room = RoomId::from("fresh");
        registry.validate_client_join(&room, "s1", "t1").unwrap();
        assert_eq!(registry.room_owner(&room).as_deref(), Some("s1"));
        assert!(registry.rooms_of_server("s1").contains(&room));
    }

    #[test]
    fn test_join_missing_room_fails_when_policy_forbids() {
        let registry = RoomRegistry::new(false);
        registry
            .register_server("s1", "t1", &RoomId::from("seed"))
            .unwrap();

        let err = registry
            .validate_client_join(&RoomId::from("fresh"), "s1", "t1")
            .unwrap_err();
        assert!(matches!(err, Error::RoomNotFound(_)));
    }

    #[tokio::test]
    async fn test_add_peer_requires_room() {
        let registry = RoomRegistry::new(true);
        let err = registry
            .add_peer(&RoomId::from("nope"), ClientId::generate(), test_handle().await)
            .unwrap_err();
        assert!(matches!(err, Error::RoomNotFound(_)));
    }

    #[tokio::test]
    async fn test_membership_snapshot() {
        let registry = RoomRegistry::new(true);
        let room = RoomId::from("r1");
        registry.register_server("s1", "t1", &room).unwrap();

        let a = ClientId::generate();
        let b = ClientId::generate();
        registry.add_peer(&room, a.clone(), test_handle().await).unwrap();
        registry.add_peer(&room, b.clone(), test_handle().await).unwrap();

        let peers = registry.snapshot_peers(&room);
        assert_eq!(peers.len(), 2);
        assert!(peers.contains_key(&a));
        assert!(peers.contains_key(&b));
        assert_eq!(registry.snapshot_writers(&room).len(), 2);

        registry.remove_peer(&room, &a);
        assert_eq!(registry.snapshot_peers(&room).len(), 1);
    }

    #[tokio::test]
    async fn test_reaper_spares_active_and_occupied_rooms() {
        let registry = RoomRegistry::new(true);
        let occupied = RoomId::from("occupied");
        let fresh = RoomId::from("fresh");
        registry.register_server("s1", "t1", &occupied).unwrap();
        registry.register_server("s1", "t1", &fresh).unwrap();
        registry
            .add_peer(&occupied, ClientId::generate(), test_handle().await)
            .unwrap();

        // Zero threshold reaps anything idle, but a room with a member and
        // a room younger than the threshold both survive.
        let reaped = registry.reap_idle(Duration::from_secs(60));
        assert!(reaped.is_empty());

        std::thread::sleep(Duration::from_millis(5));
        let reaped = registry.reap_idle(Duration::ZERO);
        assert_eq!(reaped, vec![fresh.clone()]);
        assert!(!registry.contains(&fresh));
        assert!(registry.contains(&occupied));
        assert!(!registry.rooms_of_server("s1").contains(&fresh));
    }

    #[test]
    fn test_reaped_room_fails_join_when_auto_create_off() {
        let registry = RoomRegistry::new(false);
        let room = RoomId::from("r1");
        registry.register_server("s1", "t1", &room).unwrap();

        std::thread::sleep(Duration::from_millis(5));
        let reaped = registry.reap_idle(Duration::ZERO);
        assert_eq!(reaped, vec![room.clone()]);
        assert!(matches!(
            registry.validate_client_join(&room, "s1", "t1"),
            Err(Error::RoomNotFound(_))
        ));
    }
}
