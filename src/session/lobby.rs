//! Lobby session
//!
//! Control loop for the single global room. Every lobby connection shares one
//! implicit room; drawings are relayed but never logged, and notices are tagged
//! `sent` on the sender's own copy and `received` on everyone else's.

use std::fmt::Display;
use std::sync::Arc;

use futures_util::Stream;
use tracing::{debug, error, info, warn};

use super::{announce_departures, next_frame, Departure, Inbound};
use crate::hub::{Audience, ConnectionHandle, Departed, Hub, ParticipantId, Payload, RoomId};
use crate::server::{LobbyEnvelope, LobbyMessage};

/// Run a lobby session until the connection ends
pub async fn run_lobby_session<S, E>(hub: Arc<Hub>, handle: ConnectionHandle, mut inbound: S)
where
    S: Stream<Item = Result<Inbound, E>> + Unpin,
    E: Display,
{
    let room = RoomId::lobby();
    let participant = hub
        .participants()
        .register(handle.clone(), Some(room.clone()))
        .await;
    let departure = Departure::new(Arc::clone(&hub), participant.id, leave_notice);

    let count = hub.rooms().join_or_create(&room, participant.id).await;
    info!("Participant {} joined the lobby ({} members)", participant.id, count);

    let session = LobbySession {
        hub: Arc::clone(&hub),
        room,
        me: participant.id,
    };
    session
        .notify(format!("[SERVER] {} joined the chat", participant.username))
        .await;

    while let Some(text) = next_frame(&mut inbound, &handle, session.me, hub.max_frame_bytes()).await {
        session.handle_frame(&text).await;
    }

    departure.run().await;
}

fn leave_notice(departed: &Departed) -> Option<Payload> {
    departed.remaining()?;
    let notice = format!("[SERVER] {} left the chat", departed.participant.username);
    match LobbyEnvelope::received(notice).to_json() {
        Ok(frame) => Some(Payload::Uniform(frame)),
        Err(e) => {
            error!("Failed to serialize lobby notice: {}", e);
            None
        }
    }
}

struct LobbySession {
    hub: Arc<Hub>,
    room: RoomId,
    me: ParticipantId,
}

impl LobbySession {
    async fn handle_frame(&self, text: &str) {
        let message = match LobbyMessage::parse(text) {
            Ok(message) => message,
            Err(e) => {
                warn!("Dropping lobby frame from {}: {}", self.me, e);
                return;
            }
        };

        match message {
            LobbyMessage::Username { username } => {
                match self.hub.participants().rename(self.me, &username).await {
                    Ok(Some(renamed)) => {
                        self.notify(format!(
                            "[SERVER] {} changed name to {}",
                            renamed.old, renamed.new
                        ))
                        .await
                    }
                    Ok(None) => debug!("Ignoring no-op rename from {}", self.me),
                    Err(e) => debug!("Rename skipped: {}", e),
                }
            }
            LobbyMessage::Draw(object) => self.relay(LobbyEnvelope::relay(object)).await,
            LobbyMessage::Clear => {
                self.relay(LobbyEnvelope::clear()).await;
                if let Some(name) = self.username().await {
                    self.notify(format!("[SERVER] {} cleared the canvas", name))
                        .await;
                }
            }
            LobbyMessage::Text { content } => {
                if let Some(name) = self.username().await {
                    self.notify(format!("[{}] {}", name, content)).await;
                }
            }
            LobbyMessage::Unknown => debug!("Ignoring unknown lobby message from {}", self.me),
        }
    }

    async fn username(&self) -> Option<String> {
        self.hub
            .participants()
            .lookup(self.me)
            .await
            .ok()
            .map(|participant| participant.username)
    }

    /// Send a notice to everyone, tagged as `sent` for this participant
    async fn notify(&self, notice: String) {
        let frames = LobbyEnvelope::sent(notice.clone())
            .to_json()
            .and_then(|own| Ok((own, LobbyEnvelope::received(notice).to_json()?)));
        match frames {
            Ok((own, others)) => {
                let payload = Payload::Echoed {
                    sender: self.me,
                    own,
                    others,
                };
                self.broadcast(&payload, Audience::Everyone).await;
            }
            Err(e) => error!("Failed to serialize lobby notice: {}", e),
        }
    }

    /// Pass a drawing directive to everyone else
    async fn relay(&self, envelope: LobbyEnvelope) {
        match envelope.to_json() {
            Ok(frame) => {
                self.broadcast(&Payload::Uniform(frame), Audience::AllExcept(self.me))
                    .await
            }
            Err(e) => error!("Failed to serialize lobby relay: {}", e),
        }
    }

    async fn broadcast(&self, payload: &Payload, audience: Audience) {
        let report = self
            .hub
            .broadcast_to_room(&self.room, payload, audience)
            .await;
        if !report.reaped.is_empty() {
            announce_departures(&self.hub, report.reaped, leave_notice).await;
        }
    }
}
