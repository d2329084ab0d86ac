//! WebSocket endpoints
//!
//! Upgrades HTTP requests and bridges each socket to a session loop: a writer
//! task drains the connection's outlet into the socket while the session reads
//! from the socket's stream.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::IntoResponse;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tracing::{debug, info, warn};

use crate::hub::{Hub, Outbound, Outlet};
use crate::session::{run_lobby_session, run_room_session, Inbound};

/// How long a finished session waits for its writer to flush
const WRITER_FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

enum Route {
    Room(String),
    Lobby,
}

/// `GET /ws/{code}`
pub async fn room_ws(
    Path(code): Path<String>,
    State(hub): State<Arc<Hub>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| serve_socket(socket, hub, Route::Room(code)))
}

/// `GET /ws`
pub async fn lobby_ws(State(hub): State<Arc<Hub>>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| serve_socket(socket, hub, Route::Lobby))
}

async fn serve_socket(socket: WebSocket, hub: Arc<Hub>, route: Route) {
    let (sink, stream) = socket.split();
    let (handle, outlet) = hub.connection();
    let mut writer = tokio::spawn(write_frames(sink, outlet));
    let inbound = stream.map(|message| message.map(classify));

    match route {
        Route::Room(code) => {
            debug!("New room connection for {}", code);
            run_room_session(hub, &code, handle, inbound).await
        }
        Route::Lobby => {
            debug!("New lobby connection");
            run_lobby_session(hub, handle, inbound).await
        }
    }

    match tokio::time::timeout(WRITER_FLUSH_TIMEOUT, &mut writer).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("Writer task failed: {}", e),
        Err(_) => {
            warn!("Writer did not flush in time, aborting");
            writer.abort();
        }
    }
}

fn classify(message: Message) -> Inbound {
    match message {
        Message::Text(text) => Inbound::Text(text.as_str().to_owned()),
        Message::Binary(data) => {
            warn!("Received binary message ({} bytes), ignoring", data.len());
            Inbound::Other
        }
        Message::Close(_) => Inbound::Close,
        // Pings are answered by the protocol layer
        Message::Ping(_) | Message::Pong(_) => Inbound::Other,
    }
}

async fn write_frames(mut sink: SplitSink<WebSocket, Message>, mut outlet: Outlet) {
    loop {
        match outlet.recv().await {
            Outbound::Frame(frame) => {
                if let Err(e) = sink.send(Message::Text(frame.into())).await {
                    info!("Socket write failed: {}", e);
                    break;
                }
            }
            Outbound::Close => {
                let _ = sink.send(Message::Close(None)).await;
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify() {
        assert_eq!(
            classify(Message::Text("hi".to_string().into())),
            Inbound::Text("hi".to_string())
        );
        assert_eq!(classify(Message::Close(None)), Inbound::Close);
        assert_eq!(classify(Message::Binary(vec![1, 2, 3].into())), Inbound::Other);
        assert_eq!(classify(Message::Ping(Vec::new().into())), Inbound::Other);
    }
}
