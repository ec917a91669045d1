use std::sync::Arc;

use dashmap::DashMap;

use crate::{
    config::SfuConfig,
    room::{Room, RoomMap},
};

/// Process-wide map of live rooms. Cloning shares the same map.
#[derive(Debug, Clone)]
pub struct RoomRegistry {
    rooms: Arc<RoomMap>,
    config: Arc<SfuConfig>,
}

impl RoomRegistry {
    pub fn new(config: SfuConfig) -> Self {
        Self {
            rooms: Arc::new(DashMap::new()),
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &SfuConfig {
        &self.config
    }

    /// Returns the room with `room_id`, creating it when absent.
    /// Concurrent callers for the same ID always get the same room.
    pub fn get_or_create(&self, room_id: &str) -> Arc<Room> {
        let room = self
            .rooms
            .entry(room_id.to_string())
            .or_insert_with(|| {
                tracing::info!("Room {} is created", room_id);
                Room::new(
                    room_id.to_string(),
                    Arc::clone(&self.config),
                    Arc::downgrade(&self.rooms),
                )
            });
        Arc::clone(room.value())
    }

    pub fn get(&self, room_id: &str) -> Option<Arc<Room>> {
        self.rooms.get(room_id).map(|room| Arc::clone(room.value()))
    }

    pub fn len(&self) -> usize {
        self.rooms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rooms.is_empty()
    }

    pub fn room_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.rooms.iter().map(|room| room.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Removes `peer_id` from `room_id`. Returns false when either is unknown.
    pub async fn remove_peer(&self, room_id: &str, peer_id: &str) -> bool {
        match self.get(room_id) {
            Some(room) => room.remove_peer(peer_id).await,
            None => false,
        }
    }
}
