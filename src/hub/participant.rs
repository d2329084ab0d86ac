//! Participant registry
//!
//! One entry per open connection: identity, display name, room membership and
//! the handle used to reach it.

use std::collections::HashMap;

use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{ConnectionHandle, RoomId};

/// Participant identity, independent of the display name
pub type ParticipantId = Uuid;

/// Errors that can occur during participant operations
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParticipantError {
    #[error("Participant not found: {0}")]
    NotFound(ParticipantId),
}

/// Result type for participant operations
pub type ParticipantResult<T> = Result<T, ParticipantError>;

/// A connected participant
#[derive(Debug, Clone)]
pub struct Participant {
    pub id: ParticipantId,
    pub username: String,
    pub room: Option<RoomId>,
    pub handle: ConnectionHandle,
}

/// Display name change that actually took effect
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Renamed {
    pub old: String,
    pub new: String,
}

/// Placeholder name derived from the identity
pub fn default_username(id: ParticipantId) -> String {
    let simple = id.simple().to_string();
    format!("User_{}", &simple[..8])
}

/// Registry of connected participants
#[derive(Default)]
pub struct ParticipantRegistry {
    participants: RwLock<HashMap<ParticipantId, Participant>>,
}

impl ParticipantRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the number of connected participants
    pub async fn count(&self) -> usize {
        self.participants.read().await.len()
    }

    /// Register a connection under a fresh identity
    pub async fn register(&self, handle: ConnectionHandle, room: Option<RoomId>) -> Participant {
        let id = Uuid::new_v4();
        let participant = Participant {
            id,
            username: default_username(id),
            room,
            handle,
        };

        self.participants
            .write()
            .await
            .insert(id, participant.clone());
        participant
    }

    /// Change a participant's display name
    ///
    /// The name is trimmed; a blank or unchanged name keeps the current one and
    /// yields `None`.
    pub async fn rename(&self, id: ParticipantId, name: &str) -> ParticipantResult<Option<Renamed>> {
        let mut participants = self.participants.write().await;
        let participant = participants
            .get_mut(&id)
            .ok_or(ParticipantError::NotFound(id))?;

        let name = name.trim();
        if name.is_empty() || name == participant.username {
            return Ok(None);
        }

        let old = std::mem::replace(&mut participant.username, name.to_string());
        Ok(Some(Renamed {
            old,
            new: name.to_string(),
        }))
    }

    /// Remove a participant, returning its last known state
    pub async fn unregister(&self, id: ParticipantId) -> Option<Participant> {
        self.participants.write().await.remove(&id)
    }

    /// Look up a participant
    pub async fn lookup(&self, id: ParticipantId) -> ParticipantResult<Participant> {
        self.participants
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(ParticipantError::NotFound(id))
    }

    /// Handles for the given participants; unknown ids are skipped
    pub async fn handles(&self, ids: &[ParticipantId]) -> Vec<(ParticipantId, ConnectionHandle)> {
        let participants = self.participants.read().await;
        ids.iter()
            .filter_map(|id| participants.get(id).map(|p| (*id, p.handle.clone())))
            .collect()
    }

    /// Handles of every connected participant
    pub async fn all_handles(&self) -> Vec<ConnectionHandle> {
        self.participants
            .read()
            .await
            .values()
            .map(|p| p.handle.clone())
            .collect()
    }
}
