//! Project rooms for the relay: fan-out of text frames to every member.
//!
//! Each room owns one tokio broadcast channel. A member's receiver buffers
//! up to `capacity` frames; a lagging member loses the oldest frames
//! rather than stalling the room.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use indexmap::IndexMap;
use thiserror::Error;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::protocol::{ParticipantInfo, ProjectId};

/// A frame fanned out to a room.
#[derive(Debug, Clone)]
pub struct RelayFrame {
    /// Connection that caused the frame.
    pub origin: Uuid,
    pub text: Arc<str>,
    /// Whether the origin connection receives it too.
    pub include_origin: bool,
}

impl RelayFrame {
    /// Should connection `connection_id` forward this frame to its socket?
    pub fn is_for(&self, connection_id: Uuid) -> bool {
        self.include_origin || self.origin != connection_id
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("project is full ({limit} participants)")]
pub struct RoomFull {
    pub limit: usize,
}

#[derive(Debug, Clone, Default)]
pub struct RoomStats {
    pub frames_sent: u64,
    pub frames_dropped: u64,
    pub members: usize,
}

struct AtomicRoomStats {
    frames_sent: AtomicU64,
    frames_dropped: AtomicU64,
}

/// One project's members and fan-out channel.
pub struct ProjectRoom {
    project_id: ProjectId,
    sender: broadcast::Sender<RelayFrame>,
    /// Connection id → participant, in join order.
    members: RwLock<IndexMap<Uuid, ParticipantInfo>>,
    capacity: usize,
    stats: AtomicRoomStats,
}

impl ProjectRoom {
    /// Create an empty room whose channel buffers `capacity` frames.
    pub fn new(project_id: ProjectId, capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            project_id,
            sender,
            members: RwLock::new(IndexMap::new()),
            capacity,
            stats: AtomicRoomStats {
                frames_sent: AtomicU64::new(0),
                frames_dropped: AtomicU64::new(0),
            },
        }
    }

    pub fn project_id(&self) -> &ProjectId {
        &self.project_id
    }

    /// Add a member and hand back its receiver. `limit == 0` means unbounded.
    pub async fn join(
        &self,
        connection_id: Uuid,
        info: ParticipantInfo,
        limit: usize,
    ) -> Result<broadcast::Receiver<RelayFrame>, RoomFull> {
        let mut members = self.members.write().await;
        if limit > 0 && members.len() >= limit {
            return Err(RoomFull { limit });
        }
        members.insert(connection_id, info);
        Ok(self.sender.subscribe())
    }

    /// Remove a member. Returns who left.
    pub async fn leave(&self, connection_id: &Uuid) -> Option<ParticipantInfo> {
        self.members.write().await.shift_remove(connection_id)
    }

    fn send(&self, frame: RelayFrame) -> usize {
        self.stats.frames_sent.fetch_add(1, Ordering::Relaxed);
        self.sender.send(frame).unwrap_or(0)
    }

    /// Forward a member's frame to everyone else.
    pub fn relay(&self, origin: Uuid, text: impl Into<Arc<str>>) -> usize {
        self.send(RelayFrame {
            origin,
            text: text.into(),
            include_origin: false,
        })
    }

    /// Send a frame to every member, origin included.
    pub fn announce(&self, origin: Uuid, text: impl Into<Arc<str>>) -> usize {
        self.send(RelayFrame {
            origin,
            text: text.into(),
            include_origin: true,
        })
    }

    /// Count frames a lagging member skipped.
    pub fn record_lag(&self, skipped: u64) {
        self.stats.frames_dropped.fetch_add(skipped, Ordering::Relaxed);
    }

    /// Members in join order.
    pub async fn members(&self) -> Vec<ParticipantInfo> {
        self.members.read().await.values().cloned().collect()
    }

    /// Number of current members.
    pub async fn member_count(&self) -> usize {
        self.members.read().await.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Get room statistics.
    pub async fn stats(&self) -> RoomStats {
        RoomStats {
            frames_sent: self.stats.frames_sent.load(Ordering::Relaxed),
            frames_dropped: self.stats.frames_dropped.load(Ordering::Relaxed),
            members: self.member_count().await,
        }
    }
}

/// Maps project ids to rooms. Rooms are created on first join and removed
/// when the last member leaves.
pub struct RoomManager {
    rooms: RwLock<HashMap<ProjectId, Arc<ProjectRoom>>>,
    capacity: usize,
}

impl RoomManager {
    /// Create a manager; every room gets a channel of `capacity` frames.
    pub fn new(capacity: usize) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            capacity,
        }
    }

    /// Join (creating the room if needed). The room map stays locked for the
    /// whole join so a concurrent last-leave cannot orphan the newcomer.
    pub async fn join(
        &self,
        project_id: &ProjectId,
        connection_id: Uuid,
        info: ParticipantInfo,
        limit: usize,
    ) -> Result<(Arc<ProjectRoom>, broadcast::Receiver<RelayFrame>), RoomFull> {
        let mut rooms = self.rooms.write().await;
        let room = rooms
            .entry(project_id.clone())
            .or_insert_with(|| {
                log::info!("Room {project_id} created");
                Arc::new(ProjectRoom::new(project_id.clone(), self.capacity))
            })
            .clone();
        let joined = room.join(connection_id, info, limit).await;
        if joined.is_err() && room.member_count().await == 0 {
            rooms.remove(project_id);
        }
        joined.map(|rx| (room, rx))
    }

    /// Remove a member. Returns the departed participant and, when members
    /// remain, the room to notify.
    pub async fn leave(
        &self,
        project_id: &ProjectId,
        connection_id: &Uuid,
    ) -> Option<(ParticipantInfo, Option<Arc<ProjectRoom>>)> {
        let mut rooms = self.rooms.write().await;
        let room = rooms.get(project_id)?.clone();
        let info = room.leave(connection_id).await?;
        if room.member_count().await == 0 {
            rooms.remove(project_id);
            log::info!("Room {project_id} removed (empty)");
            return Some((info, None));
        }
        Some((info, Some(room)))
    }

    /// Get the room for a project, if it has members.
    pub async fn get(&self, project_id: &ProjectId) -> Option<Arc<ProjectRoom>> {
        self.rooms.read().await.get(project_id).cloned()
    }

    /// Number of live rooms.
    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    /// Projects that currently have a room.
    pub async fn active_projects(&self) -> Vec<ProjectId> {
        self.rooms.read().await.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(id: &str) -> ParticipantInfo {
        ParticipantInfo::new(id, id.to_uppercase())
    }

    #[tokio::test]
    async fn test_room_join_leave_keeps_order() {
        let room = ProjectRoom::new(ProjectId::from("1"), 16);
        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let _rx_a = room.join(a, info("a"), 0).await.unwrap();
        let _rx_b = room.join(b, info("b"), 0).await.unwrap();
        let _rx_c = room.join(c, info("c"), 0).await.unwrap();

        room.leave(&b).await;
        let ids: Vec<String> = room.members().await.into_iter().map(|m| m.id.to_string()).collect();
        assert_eq!(ids, vec!["a", "c"]);
    }

    #[tokio::test]
    async fn test_room_limit() {
        let room = ProjectRoom::new(ProjectId::from("1"), 16);
        let _rx = room.join(Uuid::new_v4(), info("a"), 1).await.unwrap();
        assert_eq!(
            room.join(Uuid::new_v4(), info("b"), 1).await.err(),
            Some(RoomFull { limit: 1 })
        );
        assert_eq!(room.member_count().await, 1);
    }

    #[tokio::test]
    async fn test_relay_excludes_origin() {
        let room = ProjectRoom::new(ProjectId::from("1"), 16);
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let mut rx_a = room.join(a, info("a"), 0).await.unwrap();
        let mut rx_b = room.join(b, info("b"), 0).await.unwrap();

        assert_eq!(room.relay(a, "hello"), 2);
        let at_a = rx_a.recv().await.unwrap();
        let at_b = rx_b.recv().await.unwrap();
        assert!(!at_a.is_for(a));
        assert!(at_b.is_for(b));
        assert_eq!(&*at_b.text, "hello");

        room.announce(a, "joined");
        assert!(rx_a.recv().await.unwrap().is_for(a));
        assert_eq!(room.stats().await.frames_sent, 2);
    }

    #[tokio::test]
    async fn test_manager_creates_and_removes_rooms() {
        let manager = RoomManager::new(16);
        let project = ProjectId::from("42");
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());

        let (room1, _rx1) = manager.join(&project, a, info("a"), 0).await.unwrap();
        let (room2, _rx2) = manager.join(&project, b, info("b"), 0).await.unwrap();
        assert!(Arc::ptr_eq(&room1, &room2));
        assert_eq!(manager.room_count().await, 1);

        let (left, remaining) = manager.leave(&project, &a).await.unwrap();
        assert_eq!(left.id.as_str(), "a");
        assert!(remaining.is_some());

        let (_, remaining) = manager.leave(&project, &b).await.unwrap();
        assert!(remaining.is_none());
        assert_eq!(manager.room_count().await, 0);
        assert!(manager.leave(&project, &b).await.is_none());
    }

    #[tokio::test]
    async fn test_manager_rejects_full_project_without_leaking_room() {
        let manager = RoomManager::new(16);
        let project = ProjectId::from("p");
        assert!(manager
            .join(&project, Uuid::new_v4(), info("a"), 0)
            .await
            .is_ok());
        let full = manager.join(&project, Uuid::new_v4(), info("b"), 1).await;
        assert!(full.is_err());
        assert_eq!(manager.room_count().await, 1);
        assert_eq!(manager.active_projects().await, vec![project]);
    }
}
