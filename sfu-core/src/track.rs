//! Per-room forwarding track registry.
//!
//! Each publisher's remote track is mirrored by a local forwarding track
//! with the same codec, track ID and stream ID. Subscribers in the same
//! room are bound to the forwarding track; the RTP pump in the peer
//! session writes every packet it reads from the remote side into it.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_remote::TrackRemote;

use crate::models::{RoomId, TrackId};

/// Registry of forwarding tracks, scoped per room.
///
/// A forwarding track is reachable only through its owning room; tracks
/// are never visible across rooms. Mutation and snapshot are serialized
/// by the registry lock, so snapshots never observe a torn map.
#[derive(Default)]
pub struct TrackRegistry {
    rooms: RwLock<HashMap<RoomId, HashMap<TrackId, Arc<TrackLocalStaticRTP>>>>,
}

impl TrackRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a forwarding track mirroring `remote` and insert it into the
    /// room. Concurrent adds with the same track ID collapse to a single
    /// entry; the IDs are publisher-unique so last-writer-wins is fine.
    pub fn add_to_room(
        &self,
        room_id: &RoomId,
        remote: &Arc<TrackRemote>,
    ) -> Arc<TrackLocalStaticRTP> {
        let local = Arc::new(TrackLocalStaticRTP::new(
            remote.codec().capability,
            remote.id(),
            remote.stream_id(),
        ));
        let track_id = TrackId::from(remote.id());

        let mut rooms = self.rooms.write();
        rooms
            .entry(room_id.clone())
            .or_default()
            .insert(track_id.clone(), Arc::clone(&local));

        debug!(room_id = %room_id, track_id = %track_id, codec = %remote.codec().capability.mime_type, "forwarding track added");
        local
    }

    /// Delete a track by ID. Idempotent; removing from a missing room or a
    /// missing track is a no-op.
    pub fn remove_from_room(&self, room_id: &RoomId, track_id: &TrackId) {
        let mut rooms = self.rooms.write();
        if let Some(tracks) = rooms.get_mut(room_id) {
            if tracks.remove(track_id).is_some() {
                debug!(room_id = %room_id, track_id = %track_id, "forwarding track removed");
            }
            if tracks.is_empty() {
                rooms.remove(room_id);
            }
        }
    }

    /// Defensive copy of a room's track set, suitable for reconcile
    /// iteration without holding the registry lock.
    #[must_use]
    pub fn snapshot_room(&self, room_id: &RoomId) -> HashMap<TrackId, Arc<TrackLocalStaticRTP>> {
        self.rooms
            .read()
            .get(room_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Drop every track of a room. Used when the room itself is reaped.
    pub fn remove_room(&self, room_id: &RoomId) {
        self.rooms.write().remove(room_id);
    }

    #[must_use]
    pub fn track_count(&self, room_id: &RoomId) -> usize {
        self.rooms.read().get(room_id).map_or(0, HashMap::len)
    }

    #[cfg(test)]
    pub(crate) fn insert_for_test(&self, room_id: &RoomId, track: Arc<TrackLocalStaticRTP>) {
        use webrtc::track::track_local::TrackLocal;
        let track_id = TrackId::from(track.id());
        self.rooms
            .write()
            .entry(room_id.clone())
            .or_default()
            .insert(track_id, track);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::forwarding_track;

    fn insert(registry: &TrackRegistry, room: &RoomId, id: &str) {
        registry.insert_for_test(room, forwarding_track(id));
    }

    #[test]
    fn test_snapshot_is_room_local() {
        let registry = TrackRegistry::new();
        let room_a = RoomId::from("a");
        let room_b = RoomId::from("b");
        insert(&registry, &room_a, "v1");
        insert(&registry, &room_b, "v2");

        let snapshot = registry.snapshot_room(&room_a);
        assert_eq!(snapshot.len(), 1);
        assert!(snapshot.contains_key(&TrackId::from("v1")));
        assert!(!snapshot.contains_key(&TrackId::from("v2")));
    }

    #[test]
    fn test_remove_is_idempotent() {
        let registry = TrackRegistry::new();
        let room = RoomId::from("a");
        insert(&registry, &room, "v1");

        registry.remove_from_room(&room, &TrackId::from("v1"));
        registry.remove_from_room(&room, &TrackId::from("v1"));
        registry.remove_from_room(&RoomId::from("missing"), &TrackId::from("v1"));
        assert_eq!(registry.track_count(&room), 0);
    }

    #[test]
    fn test_duplicate_ids_collapse() {
        let registry = TrackRegistry::new();
        let room = RoomId::from("a");
        insert(&registry, &room, "v1");
        insert(&registry, &room, "v1");
        assert_eq!(registry.track_count(&room), 1);
    }

    #[test]
    fn test_remove_room_drops_all() {
        let registry = TrackRegistry::new();
        let room = RoomId::from("a");
        insert(&registry, &room, "v1");
        insert(&registry, &room, "a1");
        registry.remove_room(&room);
        assert!(registry.snapshot_room(&room).is_empty());
    }
}
