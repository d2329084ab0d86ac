//! Fan-out engine
//!
//! Delivers one frame to a set of participants. Sends run concurrently, each
//! bounded by the connection's deadline. A recipient whose send fails is treated
//! as disconnected: its connection is closed and it is removed from both
//! registries before the call returns.

use futures_util::future::join_all;
use tracing::{debug, warn};

use super::{Departed, Hub, ParticipantId, RoomId};

/// Who receives a broadcast
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Audience {
    Everyone,
    AllExcept(ParticipantId),
}

impl Audience {
    fn includes(&self, id: ParticipantId) -> bool {
        match self {
            Audience::Everyone => true,
            Audience::AllExcept(excluded) => *excluded != id,
        }
    }
}

/// Serialized frame(s) for a broadcast
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// Everyone gets the same frame
    Uniform(String),
    /// The sender gets its own variant of the frame
    Echoed {
        sender: ParticipantId,
        own: String,
        others: String,
    },
}

impl Payload {
    fn frame_for(&self, id: ParticipantId) -> &str {
        match self {
            Payload::Uniform(frame) => frame,
            Payload::Echoed { sender, own, .. } if *sender == id => own,
            Payload::Echoed { others, .. } => others,
        }
    }
}

/// Outcome of one fan-out
#[derive(Debug, Default)]
pub struct FanoutReport {
    /// Recipients whose queue accepted the frame
    pub delivered: usize,
    /// Recipients removed because delivery failed
    pub reaped: Vec<Departed>,
}

impl Hub {
    /// Deliver to the current members of a room
    ///
    /// A missing room has no audience and delivers nothing.
    pub async fn broadcast_to_room(&self, room: &RoomId, payload: &Payload, audience: Audience) -> FanoutReport {
        match self.rooms().members(room).await {
            Ok(members) => self.deliver(&members, payload, audience).await,
            Err(e) => {
                debug!("Skipping broadcast: {}", e);
                FanoutReport::default()
            }
        }
    }

    /// Deliver to an explicit member snapshot
    pub async fn deliver(&self, members: &[ParticipantId], payload: &Payload, audience: Audience) -> FanoutReport {
        let targets: Vec<_> = self
            .participants()
            .handles(members)
            .await
            .into_iter()
            .filter(|(id, _)| audience.includes(*id))
            .collect();

        let sends = targets.iter().map(|(id, handle)| async move {
            (*id, handle.send(payload.frame_for(*id).to_string()).await)
        });

        let mut report = FanoutReport::default();
        for (id, result) in join_all(sends).await {
            match result {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    warn!("Delivery to {} failed ({}), reaping", id, e);
                    if let Some(departed) = self.reap(id).await {
                        report.reaped.push(departed);
                    }
                }
            }
        }

        report
    }

    async fn reap(&self, id: ParticipantId) -> Option<Departed> {
        let departed = self.depart(id).await?;
        departed.participant.handle.close();
        Some(departed)
    }
}
