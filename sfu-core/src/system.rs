//! The process-wide root object.
//!
//! A single `System` owns the room registry, the track registry and the
//! signaling coordinator, and is handed to every component at
//! construction. Nothing in this crate is a global, so tests instantiate
//! isolated systems side by side.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::config::Config;
use crate::room::RoomRegistry;
use crate::signaling::Coordinator;
use crate::track::TrackRegistry;

pub struct System {
    config: Config,
    rooms: Arc<RoomRegistry>,
    tracks: Arc<TrackRegistry>,
    coordinator: Arc<Coordinator>,
}

impl System {
    #[must_use]
    pub fn new(config: Config) -> Arc<Self> {
        let rooms = Arc::new(RoomRegistry::new(config.rooms.auto_create_on_join));
        let tracks = Arc::new(TrackRegistry::new());
        let coordinator = Arc::new(Coordinator::new(
            Arc::clone(&rooms),
            Arc::clone(&tracks),
            &config.signaling,
        ));
        Arc::new(Self {
            config,
            rooms,
            tracks,
            coordinator,
        })
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    #[must_use]
    pub fn rooms(&self) -> &RoomRegistry {
        &self.rooms
    }

    #[must_use]
    pub fn tracks(&self) -> &TrackRegistry {
        &self.tracks
    }

    #[must_use]
    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.coordinator
    }

    /// Reap idle rooms and release everything tied to them: forwarding
    /// tracks and the reconcile mailbox.
    pub fn reap_idle(&self) -> usize {
        let max_idle = Duration::from_secs(self.config.rooms.max_idle_seconds);
        let reaped = self.rooms.reap_idle(max_idle);
        for room_id in &reaped {
            self.tracks.remove_room(room_id);
            self.coordinator.forget_room(room_id);
        }
        reaped.len()
    }

    /// Spawn the periodic keyframe dispatcher and the idle-room reaper.
    pub fn spawn_background_tasks(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let keyframes = self.coordinator.spawn_keyframe_ticker();

        let system = Arc::clone(self);
        let reaper = tokio::spawn(async move {
            let interval = Duration::from_secs(system.config.rooms.reap_interval_seconds.max(1));
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let reaped = system.reap_idle();
                if reaped > 0 {
                    debug!(reaped, "idle room cleanup finished");
                }
            }
        });

        vec![keyframes, reaper]
    }
}
