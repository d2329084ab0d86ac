//! Per-connection session loops
//!
//! A session registers its participant, pumps inbound frames through the
//! protocol handler, and on every exit path removes the participant and tells
//! the rest of the room.

mod lobby;
mod room;

pub use lobby::*;
pub use room::*;

use std::fmt::Display;
use std::sync::Arc;

use futures_util::{Stream, StreamExt};
use tracing::{debug, info, warn};

use crate::hub::{Audience, ConnectionHandle, Departed, Hub, ParticipantId, Payload};
use crate::server::ProtocolError;

/// Transport-neutral inbound event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// Text frame
    Text(String),
    /// Remote end closed the channel
    Close,
    /// Control or binary frame with no meaning to the session
    Other,
}

/// Builds the leave notice for a departed participant, if one is due
pub(crate) type LeaveNotice = fn(&Departed) -> Option<Payload>;

/// Wait for the next text frame
///
/// Returns `None` once the session should end: the remote closed, receiving
/// failed, or the server closed the connection (shutdown or reaping).
pub(crate) async fn next_frame<S, E>(
    inbound: &mut S,
    handle: &ConnectionHandle,
    peer: ParticipantId,
    max_bytes: usize,
) -> Option<String>
where
    S: Stream<Item = Result<Inbound, E>> + Unpin,
    E: Display,
{
    loop {
        tokio::select! {
            frame = inbound.next() => match frame {
                Some(Ok(Inbound::Text(text))) if text.len() > max_bytes => {
                    warn!("Dropping frame from {}: {}", peer, ProtocolError::FrameTooLarge(text.len()));
                }
                Some(Ok(Inbound::Text(text))) => return Some(text),
                Some(Ok(Inbound::Other)) => {}
                Some(Ok(Inbound::Close)) | None => {
                    info!("Participant {} closed the connection", peer);
                    return None;
                }
                Some(Err(e)) => {
                    warn!("Receive from {} failed: {}", peer, e);
                    return None;
                }
            },
            _ = handle.closed() => {
                info!("Connection to {} closed by server", peer);
                return None;
            }
        }
    }
}

/// Tell each departed participant's room that it left
///
/// Announcing can itself reap more participants; those are announced in turn.
pub(crate) async fn announce_departures(hub: &Hub, mut pending: Vec<Departed>, notice: LeaveNotice) {
    while let Some(departed) = pending.pop() {
        let Some((room, _)) = departed.remaining() else {
            continue;
        };
        let Some(payload) = notice(&departed) else {
            continue;
        };

        let report = hub.broadcast_to_room(room, &payload, Audience::Everyone).await;
        pending.extend(report.reaped);
    }
}

/// Closing transition for one participant
///
/// `run` performs it on the normal path. If the session future is dropped or
/// panics before that, `Drop` spawns the same cleanup on the runtime.
pub(crate) struct Departure {
    hub: Arc<Hub>,
    id: ParticipantId,
    notice: LeaveNotice,
    armed: bool,
}

impl Departure {
    pub(crate) fn new(hub: Arc<Hub>, id: ParticipantId, notice: LeaveNotice) -> Self {
        Self {
            hub,
            id,
            notice,
            armed: true,
        }
    }

    pub(crate) async fn run(mut self) {
        self.armed = false;
        depart(&self.hub, self.id, self.notice).await;
    }
}

impl Drop for Departure {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let hub = Arc::clone(&self.hub);
        let (id, notice) = (self.id, self.notice);
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                debug!("Session for {} ended abnormally, scheduling cleanup", id);
                runtime.spawn(async move { depart(&hub, id, notice).await });
            }
            Err(_) => warn!("No runtime to clean up participant {}", id),
        }
    }
}

async fn depart(hub: &Hub, id: ParticipantId, notice: LeaveNotice) {
    let Some(departed) = hub.depart(id).await else {
        debug!("Participant {} already removed", id);
        return;
    };
    departed.participant.handle.close();
    info!("Participant {} ({}) left", id, departed.participant.username);
    announce_departures(hub, vec![departed], notice).await;
}

#[cfg(test)]
pub(crate) mod testing {
    //! Channel-backed inbound streams for driving sessions without sockets

    use futures_util::stream::{self, Stream};
    use tokio::sync::mpsc;

    use super::Inbound;
    use crate::hub::{Outbound, Outlet};
    use crate::server::ServerMessage;

    pub type InboundTx = mpsc::UnboundedSender<Result<Inbound, String>>;

    pub fn inbound() -> (InboundTx, impl Stream<Item = Result<Inbound, String>> + Unpin) {
        let (tx, rx) = mpsc::unbounded_channel();
        let stream = stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|item| (item, rx)) });
        (tx, Box::pin(stream))
    }

    pub fn send_text(tx: &InboundTx, text: impl Into<String>) {
        tx.send(Ok(Inbound::Text(text.into()))).unwrap();
    }

    /// Next frame on an outlet, waiting briefly for it
    pub async fn next_raw(outlet: &mut Outlet) -> Outbound {
        tokio::time::timeout(std::time::Duration::from_secs(2), outlet.recv())
            .await
            .expect("timed out waiting for outbound frame")
    }

    pub async fn next_message(outlet: &mut Outlet) -> ServerMessage {
        match next_raw(outlet).await {
            Outbound::Frame(frame) => serde_json::from_str(&frame).unwrap(),
            Outbound::Close => panic!("expected a frame, connection closed"),
        }
    }

    pub async fn next_json(outlet: &mut Outlet) -> serde_json::Value {
        match next_raw(outlet).await {
            Outbound::Frame(frame) => serde_json::from_str(&frame).unwrap(),
            Outbound::Close => panic!("expected a frame, connection closed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::config::ServerConfig;

    #[tokio::test]
    async fn test_next_frame_skips_oversized_and_control_frames() {
        let mut config = ServerConfig::default();
        config.max_frame_bytes = 8;
        let hub = Hub::new(&config);
        let (handle, _outlet) = hub.connection();
        let (tx, mut stream) = inbound();
        let peer = ParticipantId::new_v4();

        send_text(&tx, "this frame is far too long");
        tx.send(Ok(Inbound::Other)).unwrap();
        send_text(&tx, "short");
        tx.send(Ok(Inbound::Close)).unwrap();

        let max = hub.max_frame_bytes();
        assert_eq!(next_frame(&mut stream, &handle, peer, max).await, Some("short".to_string()));
        assert_eq!(next_frame(&mut stream, &handle, peer, max).await, None);
    }

    #[tokio::test]
    async fn test_next_frame_ends_on_receive_error_and_server_close() {
        let hub = Hub::new(&ServerConfig::default());
        let (handle, _outlet) = hub.connection();
        let (tx, mut stream) = inbound();
        let peer = ParticipantId::new_v4();

        tx.send(Err("connection reset".to_string())).unwrap();
        assert_eq!(next_frame(&mut stream, &handle, peer, 1024).await, None);

        handle.close();
        assert_eq!(next_frame(&mut stream, &handle, peer, 1024).await, None);
    }

    #[tokio::test]
    async fn test_dropped_departure_still_cleans_up() {
        let hub = Arc::new(Hub::new(&ServerConfig::default()));
        let room = hub.rooms().create_room().await;
        let (handle, _outlet) = hub.connection();
        let participant = hub.participants().register(handle, Some(room.clone())).await;
        hub.rooms().join_room(&room, participant.id, |_| {}).await.unwrap();

        drop(Departure::new(Arc::clone(&hub), participant.id, |_| None));

        for _ in 0..50 {
            if !hub.rooms().room_exists(&room).await {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(hub.participants().lookup(participant.id).await.is_err());
        assert!(!hub.rooms().room_exists(&room).await);
    }
}
