//! Shared session state
//!
//! The `Hub` owns the room and participant registries and the delivery
//! settings. One instance is created at startup and shared by every
//! connection's session loop.

mod connection;
mod fanout;
mod participant;
mod room;

pub use connection::*;
pub use fanout::*;
pub use participant::*;
pub use room::*;

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::ServerConfig;

/// A participant removed from the registries, with what its leave did to its room
#[derive(Debug, Clone)]
pub struct Departed {
    pub participant: Participant,
    pub outcome: Option<LeaveOutcome>,
}

impl Departed {
    /// Room and remaining member count, if anyone is left to be told
    pub fn remaining(&self) -> Option<(&RoomId, usize)> {
        match (&self.participant.room, self.outcome) {
            (Some(room), Some(LeaveOutcome::Remaining(count))) => Some((room, count)),
            _ => None,
        }
    }
}

/// Registries plus delivery settings
pub struct Hub {
    rooms: RoomRegistry,
    participants: ParticipantRegistry,
    send_timeout: Duration,
    outbound_queue: usize,
    max_frame_bytes: usize,
    unjoined_room_ttl: Duration,
    sweep_interval: Duration,
}

impl Hub {
    pub fn new(config: &ServerConfig) -> Self {
        Self {
            rooms: RoomRegistry::new(config.room_code_length),
            participants: ParticipantRegistry::new(),
            send_timeout: config.send_timeout(),
            outbound_queue: config.outbound_queue,
            max_frame_bytes: config.max_frame_bytes,
            unjoined_room_ttl: config.unjoined_room_ttl(),
            sweep_interval: config.sweep_interval().max(Duration::from_millis(1)),
        }
    }

    pub fn rooms(&self) -> &RoomRegistry {
        &self.rooms
    }

    pub fn participants(&self) -> &ParticipantRegistry {
        &self.participants
    }

    /// Largest inbound frame a session accepts
    pub fn max_frame_bytes(&self) -> usize {
        self.max_frame_bytes
    }

    /// Create an outbound queue with this hub's capacity and deadline
    pub fn connection(&self) -> (ConnectionHandle, Outlet) {
        ConnectionHandle::channel(self.outbound_queue, self.send_timeout)
    }

    /// Remove a participant from the participant table and its room
    ///
    /// Returns `None` if the participant was already gone, which makes the
    /// call safe to repeat from every exit path.
    pub async fn depart(&self, id: ParticipantId) -> Option<Departed> {
        let participant = self.participants.unregister(id).await?;

        let outcome = match &participant.room {
            Some(room) => match self.rooms.leave_room(room, id).await {
                Ok(outcome) => {
                    if outcome == LeaveOutcome::Deleted {
                        debug!("Room {} deleted after last member left", room);
                    }
                    Some(outcome)
                }
                Err(e) => {
                    warn!("Participant {} left a missing room: {}", id, e);
                    None
                }
            },
            None => None,
        };

        Some(Departed {
            participant,
            outcome,
        })
    }

    /// Delete rooms nobody joined within the configured grace period
    pub async fn sweep_rooms(&self) -> usize {
        let expired = self.rooms.sweep_unjoined(self.unjoined_room_ttl).await;
        for id in &expired {
            info!("Room {} expired without being joined", id);
        }
        expired.len()
    }

    /// Start the background loop that sweeps unjoined rooms
    pub fn start_sweeper(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.sweep_interval);
            loop {
                interval.tick().await;
                self.sweep_rooms().await;
            }
        })
    }

    /// Close every live connection
    ///
    /// Each session loop notices its writer stopping and runs its own cleanup.
    pub async fn close_all(&self) {
        let handles = self.participants.all_handles().await;
        debug!("Closing {} connections", handles.len());
        for handle in handles {
            handle.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_depart_removes_from_both_registries() {
        let hub = Hub::new(&ServerConfig::default());
        let room = hub.rooms().create_room().await;
        let (handle, _rx) = hub.connection();

        let a = hub.participants().register(handle.clone(), Some(room.clone())).await;
        let b = hub.participants().register(handle, Some(room.clone())).await;
        hub.rooms().join_room(&room, a.id, |_| {}).await.unwrap();
        hub.rooms().join_room(&room, b.id, |_| {}).await.unwrap();

        let departed = hub.depart(a.id).await.unwrap();
        assert_eq!(departed.remaining(), Some((&room, 1)));
        assert!(hub.participants().lookup(a.id).await.is_err());

        // Second call is a no-op
        assert!(hub.depart(a.id).await.is_none());

        let departed = hub.depart(b.id).await.unwrap();
        assert_eq!(departed.outcome, Some(LeaveOutcome::Deleted));
        assert_eq!(departed.remaining(), None);
        assert!(!hub.rooms().room_exists(&room).await);
    }

    #[tokio::test]
    async fn test_sweeper_expires_unjoined_room() {
        let mut config = ServerConfig::default();
        config.unjoined_room_ttl_ms = 20;
        config.sweep_interval_ms = 5;
        let hub = Arc::new(Hub::new(&config));

        let unjoined = hub.rooms().create_room().await;
        let joined = hub.rooms().create_room().await;
        hub.rooms().join_room(&joined, uuid::Uuid::new_v4(), |_| {}).await.unwrap();

        let sweeper = Arc::clone(&hub).start_sweeper();
        for _ in 0..100 {
            if !hub.rooms().room_exists(&unjoined).await {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        sweeper.abort();

        assert!(!hub.rooms().room_exists(&unjoined).await);
        assert!(hub.rooms().room_exists(&joined).await);
    }

    #[tokio::test]
    async fn test_close_all_signals_writers() {
        let hub = Hub::new(&ServerConfig::default());
        let (handle, mut outlet) = hub.connection();
        hub.participants().register(handle, None).await;

        hub.close_all().await;
        assert_eq!(outlet.recv().await, Outbound::Close);
    }
}
