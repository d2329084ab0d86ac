//! Room session
//!
//! Control loop for one connection speaking the room protocol. The participant
//! joins the room named in the connection URL, gets the canvas replayed, and
//! then exchanges chat and drawing with the other members.

use std::fmt::Display;
use std::sync::Arc;

use futures_util::Stream;
use tracing::{debug, error, info, warn};

use super::{announce_departures, next_frame, Departure, Inbound};
use crate::hub::{Audience, ConnectionHandle, Departed, FanoutReport, Hub, ParticipantId, Payload, RoomId};
use crate::server::{ClientMessage, DrawOp, ServerMessage};

/// Run a room session until the connection ends
///
/// An unknown room code is answered with an `error` message and the
/// connection is closed without registering anything.
pub async fn run_room_session<S, E>(hub: Arc<Hub>, code: &str, handle: ConnectionHandle, mut inbound: S)
where
    S: Stream<Item = Result<Inbound, E>> + Unpin,
    E: Display,
{
    let room = RoomId::parse(code);
    if room.is_lobby() || !hub.rooms().room_exists(&room).await {
        reject(&handle, &room).await;
        return;
    }

    let participant = hub
        .participants()
        .register(handle.clone(), Some(room.clone()))
        .await;
    let departure = Departure::new(Arc::clone(&hub), participant.id, leave_notice);

    let replay = handle.clone();
    let joined = hub
        .rooms()
        .join_room(&room, participant.id, |operations| {
            if operations.is_empty() {
                return;
            }
            let state = ServerMessage::CanvasState {
                operations: operations.to_vec(),
            };
            match state.to_json() {
                Ok(frame) => {
                    if let Err(e) = replay.try_send(frame) {
                        warn!("Failed to queue canvas state for {}: {}", participant.id, e);
                    }
                }
                Err(e) => error!("Failed to serialize canvas state: {}", e),
            }
        })
        .await;

    let user_count = match joined {
        Ok(count) => count,
        Err(e) => {
            // The room vanished between the check and the join
            debug!("Join failed for {}: {}", participant.id, e);
            reject(&handle, &room).await;
            departure.run().await;
            return;
        }
    };

    info!(
        "Participant {} joined room {} ({} members)",
        participant.id, room, user_count
    );

    let session = RoomSession {
        hub: Arc::clone(&hub),
        room,
        me: participant.id,
    };

    session
        .broadcast(
            &ServerMessage::UserJoined {
                user_id: participant.id,
                username: participant.username,
                user_count,
            },
            Audience::Everyone,
        )
        .await;

    while let Some(text) = next_frame(&mut inbound, &handle, session.me, hub.max_frame_bytes()).await {
        session.handle_frame(&text).await;
    }

    departure.run().await;
}

async fn reject(handle: &ConnectionHandle, room: &RoomId) {
    info!("Rejecting connection to unknown room {}", room);
    let message = ServerMessage::error(format!("Room {} does not exist", room));
    match message.to_json() {
        Ok(frame) => {
            if let Err(e) = handle.send(frame).await {
                debug!("Could not deliver rejection: {}", e);
            }
        }
        Err(e) => error!("Failed to serialize rejection: {}", e),
    }
    handle.close();
}

fn leave_notice(departed: &Departed) -> Option<Payload> {
    let (_, user_count) = departed.remaining()?;
    let message = ServerMessage::UserLeft {
        user_id: departed.participant.id,
        username: departed.participant.username.clone(),
        user_count,
    };
    uniform(&message)
}

fn uniform(message: &ServerMessage) -> Option<Payload> {
    match message.to_json() {
        Ok(frame) => Some(Payload::Uniform(frame)),
        Err(e) => {
            error!("Failed to serialize message: {}", e);
            None
        }
    }
}

struct RoomSession {
    hub: Arc<Hub>,
    room: RoomId,
    me: ParticipantId,
}

impl RoomSession {
    async fn handle_frame(&self, text: &str) {
        let message = match ClientMessage::from_json(text) {
            Ok(message) => message,
            Err(e) => {
                warn!("Dropping frame from {}: {}", self.me, e);
                return;
            }
        };

        match message {
            ClientMessage::UsernameChange { username } => self.rename(&username).await,
            ClientMessage::Draw(op) => self.draw(op).await,
            ClientMessage::ClearCanvas => self.clear().await,
            ClientMessage::Chat { message } => self.chat(message).await,
            ClientMessage::Unknown => debug!("Ignoring unknown message type from {}", self.me),
        }
    }

    async fn rename(&self, username: &str) {
        match self.hub.participants().rename(self.me, username).await {
            Ok(Some(renamed)) => {
                let notice = format!("{} is now known as {}", renamed.old, renamed.new);
                self.broadcast(&ServerMessage::system(notice), Audience::Everyone)
                    .await;
            }
            Ok(None) => debug!("Ignoring no-op rename from {}", self.me),
            Err(e) => debug!("Rename skipped: {}", e),
        }
    }

    async fn draw(&self, op: DrawOp) {
        let members = match self.hub.rooms().append_draw(&self.room, op.clone()).await {
            Ok(members) => members,
            Err(e) => {
                debug!("Draw skipped: {}", e);
                return;
            }
        };

        let message = ServerMessage::Draw { user_id: self.me, op };
        if let Some(payload) = uniform(&message) {
            let report = self
                .hub
                .deliver(&members, &payload, Audience::AllExcept(self.me))
                .await;
            self.settle(report).await;
        }
    }

    async fn clear(&self) {
        let members = match self.hub.rooms().clear_canvas(&self.room).await {
            Ok(members) => members,
            Err(e) => {
                debug!("Clear skipped: {}", e);
                return;
            }
        };

        if let Some(payload) = uniform(&ServerMessage::ClearCanvas { user_id: self.me }) {
            let report = self
                .hub
                .deliver(&members, &payload, Audience::AllExcept(self.me))
                .await;
            self.settle(report).await;
        }

        if let Some(name) = self.username().await {
            self.broadcast(
                &ServerMessage::system(format!("{} cleared the canvas", name)),
                Audience::Everyone,
            )
            .await;
        }
    }

    async fn chat(&self, message: String) {
        if message.trim().is_empty() {
            return;
        }
        let Some(username) = self.username().await else {
            return;
        };

        let chat = ServerMessage::Chat {
            user_id: self.me,
            username,
            message,
        };
        self.broadcast(&chat, Audience::Everyone).await;
    }

    async fn username(&self) -> Option<String> {
        self.hub
            .participants()
            .lookup(self.me)
            .await
            .ok()
            .map(|participant| participant.username)
    }

    async fn broadcast(&self, message: &ServerMessage, audience: Audience) {
        if let Some(payload) = uniform(message) {
            let report = self
                .hub
                .broadcast_to_room(&self.room, &payload, audience)
                .await;
            self.settle(report).await;
        }
    }

    async fn settle(&self, report: FanoutReport) {
        if !report.reaped.is_empty() {
            announce_departures(&self.hub, report.reaped, leave_notice).await;
        }
    }
}
