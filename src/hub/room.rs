//! Room registry
//!
//! Maps room codes to their member sets and canvas logs. The outer map lock is
//! only held for writing when a room is created or deleted; everything else
//! takes the read lock plus the room's own mutex.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;

use super::ParticipantId;
use crate::server::DrawOp;

/// Characters used in generated room codes (no 0/O, 1/I/L)
const CODE_ALPHABET: &[u8] = b"ABCDEFGHJKMNPQRSTUVWXYZ23456789";

/// Reserved id of the lobby room; never generated since the alphabet has no L or O
const LOBBY_ID: &str = "LOBBY";

/// Failed attempts before a generated code grows by one character
const CODE_ATTEMPTS_PER_LENGTH: usize = 64;

/// Errors that can occur during room operations
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RoomError {
    #[error("Room not found: {0}")]
    NotFound(RoomId),
}

/// Result type for room operations
pub type RoomResult<T> = Result<T, RoomError>;

/// Short shareable room code
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(String);

impl RoomId {
    /// Normalize a user-supplied code
    pub fn parse(code: &str) -> Self {
        Self(code.trim().to_ascii_uppercase())
    }

    /// The single room behind the lobby protocol
    pub fn lobby() -> Self {
        Self(LOBBY_ID.to_string())
    }

    /// Whether this is the lobby, which room codes never address
    pub fn is_lobby(&self) -> bool {
        self.0 == LOBBY_ID
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What a leave did to the room
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaveOutcome {
    /// The room lives on with this many members
    Remaining(usize),
    /// The leaver was the last member and the room is gone
    Deleted,
}

#[derive(Debug)]
struct Room {
    members: HashSet<ParticipantId>,
    canvas: Vec<DrawOp>,
    created: Instant,
}

impl Room {
    fn new() -> Self {
        Self {
            members: HashSet::new(),
            canvas: Vec::new(),
            created: Instant::now(),
        }
    }
}

/// Registry of live rooms
pub struct RoomRegistry {
    rooms: RwLock<HashMap<RoomId, Arc<Mutex<Room>>>>,
    code_length: usize,
}

impl RoomRegistry {
    pub fn new(code_length: usize) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            code_length: code_length.max(1),
        }
    }

    /// Number of live rooms
    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    /// Create an empty room under a fresh code
    pub async fn create_room(&self) -> RoomId {
        let mut rooms = self.rooms.write().await;
        let mut length = self.code_length;
        let mut attempts = 0;

        loop {
            let id = RoomId(generate_code(length));
            if !rooms.contains_key(&id) {
                rooms.insert(id.clone(), Arc::new(Mutex::new(Room::new())));
                return id;
            }

            attempts += 1;
            if attempts % CODE_ATTEMPTS_PER_LENGTH == 0 {
                length += 1;
            }
        }
    }

    /// Check if a room exists
    pub async fn room_exists(&self, id: &RoomId) -> bool {
        self.rooms.read().await.contains_key(id)
    }

    /// Number of members, or `None` if the room does not exist
    pub async fn member_count(&self, id: &RoomId) -> Option<usize> {
        let room = self.rooms.read().await.get(id).cloned()?;
        let count = room.lock().await.members.len();
        Some(count)
    }

    /// Add a participant to an existing room
    ///
    /// The lobby is only joined through `join_or_create` and is reported as
    /// not found here. `replay` sees the canvas log while the room is still locked, so anything
    /// it queues for the joiner lands before any draw appended afterwards.
    /// Returns the new member count.
    pub async fn join_room<F>(&self, id: &RoomId, participant: ParticipantId, replay: F) -> RoomResult<usize>
    where
        F: FnOnce(&[DrawOp]),
    {
        if id.is_lobby() {
            return Err(RoomError::NotFound(id.clone()));
        }

        let rooms = self.rooms.read().await;
        let room = rooms.get(id).ok_or_else(|| RoomError::NotFound(id.clone()))?;
        let mut room = room.lock().await;

        room.members.insert(participant);
        replay(&room.canvas);
        Ok(room.members.len())
    }

    /// Add a participant to a room, creating the room under `id` if needed
    pub async fn join_or_create(&self, id: &RoomId, participant: ParticipantId) -> usize {
        let mut rooms = self.rooms.write().await;
        let room = rooms
            .entry(id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(Room::new())));
        let mut room = room.lock().await;

        room.members.insert(participant);
        room.members.len()
    }

    /// Remove a participant from a room
    ///
    /// A room left empty is removed from the registry before the map lock is
    /// released, so no caller ever observes an empty room.
    pub async fn leave_room(&self, id: &RoomId, participant: ParticipantId) -> RoomResult<LeaveOutcome> {
        let mut rooms = self.rooms.write().await;
        let room = rooms.get(id).ok_or_else(|| RoomError::NotFound(id.clone()))?;

        let remaining = {
            let mut room = room.lock().await;
            room.members.remove(&participant);
            room.members.len()
        };

        if remaining == 0 {
            rooms.remove(id);
            Ok(LeaveOutcome::Deleted)
        } else {
            Ok(LeaveOutcome::Remaining(remaining))
        }
    }

    /// Delete rooms that have had no member for `grace` since creation
    ///
    /// A room that had members is deleted by its last leave, so an empty room
    /// here is one that was created and never joined. Returns the deleted ids.
    pub async fn sweep_unjoined(&self, grace: Duration) -> Vec<RoomId> {
        let mut rooms = self.rooms.write().await;

        let mut expired = Vec::new();
        for (id, room) in rooms.iter() {
            let room = room.lock().await;
            if room.members.is_empty() && room.created.elapsed() >= grace {
                expired.push(id.clone());
            }
        }
        for id in &expired {
            rooms.remove(id);
        }
        expired
    }

    /// Snapshot of the room's members
    pub async fn members(&self, id: &RoomId) -> RoomResult<Vec<ParticipantId>> {
        let room = self.room(id).await?;
        let members = room.lock().await.members.iter().copied().collect();
        Ok(members)
    }

    /// Append a segment to the canvas log
    ///
    /// Returns the members at the moment of the append, which is exactly the
    /// audience that did not get this segment through a replay.
    pub async fn append_draw(&self, id: &RoomId, op: DrawOp) -> RoomResult<Vec<ParticipantId>> {
        let room = self.room(id).await?;
        let mut room = room.lock().await;
        room.canvas.push(op);
        Ok(room.members.iter().copied().collect())
    }

    /// Empty the canvas log, returning the members at that moment
    pub async fn clear_canvas(&self, id: &RoomId) -> RoomResult<Vec<ParticipantId>> {
        let room = self.room(id).await?;
        let mut room = room.lock().await;
        room.canvas.clear();
        Ok(room.members.iter().copied().collect())
    }

    /// Point-in-time copy of the canvas log
    pub async fn snapshot_canvas(&self, id: &RoomId) -> RoomResult<Vec<DrawOp>> {
        let room = self.room(id).await?;
        let canvas = room.lock().await.canvas.clone();
        Ok(canvas)
    }

    async fn room(&self, id: &RoomId) -> RoomResult<Arc<Mutex<Room>>> {
        self.rooms
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| RoomError::NotFound(id.clone()))
    }
}

fn generate_code(length: usize) -> String {
    let mut rng = rand::rng();
    (0..length)
        .map(|_| CODE_ALPHABET[rng.random_range(0..CODE_ALPHABET.len())] as char)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn stroke(n: f64) -> DrawOp {
        DrawOp::line(n, n, n + 1.0, n + 1.0)
    }

    #[test]
    fn test_room_id_parse_normalizes() {
        assert_eq!(RoomId::parse("  ab3xyz "), RoomId::parse("AB3XYZ"));
        assert_eq!(RoomId::parse("ab3xyz").as_str(), "AB3XYZ");
    }

    #[test]
    fn test_generated_codes_use_alphabet() {
        let code = generate_code(6);
        assert_eq!(code.len(), 6);
        assert!(code.bytes().all(|b| CODE_ALPHABET.contains(&b)));
    }

    #[tokio::test]
    async fn test_create_room() {
        let registry = RoomRegistry::new(6);
        let id = registry.create_room().await;

        assert_eq!(id.as_str().len(), 6);
        assert!(registry.room_exists(&id).await);
        assert_eq!(registry.member_count(&id).await, Some(0));
        assert!(registry.snapshot_canvas(&id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_create_room_retries_collisions() {
        // A one-character code space is exhausted quickly, forcing retries and growth
        let registry = RoomRegistry::new(1);
        let mut ids = HashSet::new();
        for _ in 0..CODE_ALPHABET.len() + 5 {
            ids.insert(registry.create_room().await);
        }
        assert_eq!(ids.len(), CODE_ALPHABET.len() + 5);
        assert_eq!(registry.room_count().await, CODE_ALPHABET.len() + 5);
    }

    #[tokio::test]
    async fn test_join_unknown_room() {
        let registry = RoomRegistry::new(6);
        let id = RoomId::parse("NOPE42");
        let result = registry.join_room(&id, Uuid::new_v4(), |_| {}).await;
        assert_eq!(result, Err(RoomError::NotFound(id.clone())));
        assert_eq!(registry.member_count(&id).await, None);
    }

    #[tokio::test]
    async fn test_membership_tracks_joins_and_leaves() {
        let registry = RoomRegistry::new(6);
        let id = registry.create_room().await;
        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());

        assert_eq!(registry.join_room(&id, a, |_| {}).await, Ok(1));
        assert_eq!(registry.join_room(&id, b, |_| {}).await, Ok(2));
        assert_eq!(registry.join_room(&id, c, |_| {}).await, Ok(3));
        assert_eq!(registry.leave_room(&id, b).await, Ok(LeaveOutcome::Remaining(2)));

        let mut members = registry.members(&id).await.unwrap();
        members.sort();
        let mut expected = vec![a, c];
        expected.sort();
        assert_eq!(members, expected);

        assert_eq!(registry.leave_room(&id, a).await, Ok(LeaveOutcome::Remaining(1)));
        assert_eq!(registry.leave_room(&id, c).await, Ok(LeaveOutcome::Deleted));
        assert!(!registry.room_exists(&id).await);
        assert_eq!(registry.room_count().await, 0);

        // Leaving a deleted room is reported, not ignored
        assert_eq!(registry.leave_room(&id, c).await, Err(RoomError::NotFound(id)));
    }

    #[tokio::test]
    async fn test_canvas_log_order_and_clear() {
        let registry = RoomRegistry::new(6);
        let id = registry.create_room().await;
        let a = Uuid::new_v4();
        registry.join_room(&id, a, |_| {}).await.unwrap();

        for n in 0..5 {
            let audience = registry.append_draw(&id, stroke(n as f64)).await.unwrap();
            assert_eq!(audience, vec![a]);
        }
        let snapshot = registry.snapshot_canvas(&id).await.unwrap();
        assert_eq!(snapshot, (0..5).map(|n| stroke(n as f64)).collect::<Vec<_>>());

        registry.clear_canvas(&id).await.unwrap();
        assert!(registry.snapshot_canvas(&id).await.unwrap().is_empty());

        registry.append_draw(&id, stroke(9.0)).await.unwrap();
        assert_eq!(registry.snapshot_canvas(&id).await.unwrap(), vec![stroke(9.0)]);
    }

    #[tokio::test]
    async fn test_join_replays_canvas() {
        let registry = RoomRegistry::new(6);
        let id = registry.create_room().await;
        registry.join_room(&id, Uuid::new_v4(), |ops| assert!(ops.is_empty())).await.unwrap();
        registry.append_draw(&id, stroke(1.0)).await.unwrap();
        registry.append_draw(&id, stroke(2.0)).await.unwrap();

        let mut replayed = Vec::new();
        registry
            .join_room(&id, Uuid::new_v4(), |ops| replayed.extend_from_slice(ops))
            .await
            .unwrap();
        assert_eq!(replayed, vec![stroke(1.0), stroke(2.0)]);
    }

    #[tokio::test]
    async fn test_draw_on_missing_room() {
        let registry = RoomRegistry::new(6);
        let id = RoomId::parse("GONE22");
        assert!(registry.append_draw(&id, stroke(0.0)).await.is_err());
        assert!(registry.clear_canvas(&id).await.is_err());
        assert!(registry.snapshot_canvas(&id).await.is_err());
    }

    #[tokio::test]
    async fn test_join_or_create_lobby() {
        let registry = RoomRegistry::new(6);
        let lobby = RoomId::lobby();
        let a = Uuid::new_v4();

        assert_eq!(registry.join_or_create(&lobby, a).await, 1);
        assert_eq!(registry.join_or_create(&lobby, Uuid::new_v4()).await, 2);
        assert!(registry.room_exists(&lobby).await);
        assert_eq!(registry.leave_room(&lobby, a).await, Ok(LeaveOutcome::Remaining(1)));
    }

    #[tokio::test]
    async fn test_sweep_removes_only_unjoined_rooms() {
        let registry = RoomRegistry::new(6);
        let unjoined = registry.create_room().await;
        let joined = registry.create_room().await;
        registry.join_room(&joined, Uuid::new_v4(), |_| {}).await.unwrap();
        registry.join_or_create(&RoomId::lobby(), Uuid::new_v4()).await;

        // Still inside the grace period
        assert!(registry.sweep_unjoined(Duration::from_secs(3600)).await.is_empty());
        assert!(registry.room_exists(&unjoined).await);

        assert_eq!(registry.sweep_unjoined(Duration::ZERO).await, vec![unjoined.clone()]);
        assert!(!registry.room_exists(&unjoined).await);
        assert!(registry.room_exists(&joined).await);
        assert!(registry.room_exists(&RoomId::lobby()).await);
        assert_eq!(registry.room_count().await, 2);
    }

    #[tokio::test]
    async fn test_lobby_is_not_joinable_by_code() {
        let registry = RoomRegistry::new(6);
        registry.join_or_create(&RoomId::lobby(), Uuid::new_v4()).await;

        let by_code = RoomId::parse(" lobby ");
        assert!(by_code.is_lobby());
        assert_eq!(
            registry.join_room(&by_code, Uuid::new_v4(), |_| {}).await,
            Err(RoomError::NotFound(by_code))
        );
        assert_eq!(registry.member_count(&RoomId::lobby()).await, Some(1));
    }
}
