//! Connection handle
//!
//! The sending half of one participant's channel. Frames are queued to a writer
//! task that owns the socket; the handle never touches the socket itself. Close
//! requests travel on a separate flag so a full queue cannot hold them back.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, watch};

/// Errors returned when a frame cannot be delivered to a connection
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum SendError {
    #[error("Connection closed")]
    Closed,

    #[error("Send timed out after {0:?}")]
    TimedOut(Duration),
}

/// Item consumed by a connection's writer task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// Serialized text frame
    Frame(String),
    /// Send a close frame and stop writing
    Close,
}

/// Cloneable handle to a connection's outbound queue
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    tx: mpsc::Sender<String>,
    closing: Arc<watch::Sender<bool>>,
    send_timeout: Duration,
}

/// Receiving end of a connection, drained by its writer task
#[derive(Debug)]
pub struct Outlet {
    rx: mpsc::Receiver<String>,
    closing: watch::Receiver<bool>,
}

impl ConnectionHandle {
    /// Create a handle and the outlet its writer task drains
    pub fn channel(capacity: usize, send_timeout: Duration) -> (Self, Outlet) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let (closing_tx, closing_rx) = watch::channel(false);
        let handle = Self {
            tx,
            closing: Arc::new(closing_tx),
            send_timeout,
        };
        (
            handle,
            Outlet {
                rx,
                closing: closing_rx,
            },
        )
    }

    /// Queue a frame, waiting at most the configured deadline for space
    pub async fn send(&self, frame: String) -> Result<(), SendError> {
        if self.is_closed() {
            return Err(SendError::Closed);
        }
        self.tx
            .send_timeout(frame, self.send_timeout)
            .await
            .map_err(|e| match e {
                mpsc::error::SendTimeoutError::Closed(_) => SendError::Closed,
                mpsc::error::SendTimeoutError::Timeout(_) => SendError::TimedOut(self.send_timeout),
            })
    }

    /// Queue a frame without waiting
    ///
    /// Used where the caller holds a lock and must not suspend.
    pub fn try_send(&self, frame: String) -> Result<(), SendError> {
        if self.is_closed() {
            return Err(SendError::Closed);
        }
        self.tx.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Closed(_) => SendError::Closed,
            mpsc::error::TrySendError::Full(_) => SendError::TimedOut(Duration::ZERO),
        })
    }

    /// Ask the writer task to close the socket once queued frames are flushed
    pub fn close(&self) {
        self.closing.send_replace(true);
    }

    /// Whether the connection is closing or its writer has stopped
    pub fn is_closed(&self) -> bool {
        *self.closing.borrow() || self.tx.is_closed()
    }

    /// Resolves once the connection is closing or its writer has stopped
    pub async fn closed(&self) {
        let mut closing = self.closing.subscribe();
        tokio::select! {
            _ = self.tx.closed() => {}
            _ = closing.wait_for(|closing| *closing) => {}
        }
    }
}

impl Outlet {
    /// Wait for the next item; queued frames are drained before a close
    pub async fn recv(&mut self) -> Outbound {
        tokio::select! {
            biased;
            frame = self.rx.recv() => match frame {
                Some(frame) => Outbound::Frame(frame),
                None => Outbound::Close,
            },
            _ = self.closing.wait_for(|closing| *closing) => Outbound::Close,
        }
    }

    /// Take the next item if one is ready
    #[cfg(test)]
    pub fn try_recv(&mut self) -> Option<Outbound> {
        match self.rx.try_recv() {
            Ok(frame) => Some(Outbound::Frame(frame)),
            Err(mpsc::error::TryRecvError::Disconnected) => Some(Outbound::Close),
            Err(mpsc::error::TryRecvError::Empty) if *self.closing.borrow() => Some(Outbound::Close),
            Err(mpsc::error::TryRecvError::Empty) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frames_flush_before_close() {
        let (handle, mut outlet) = ConnectionHandle::channel(4, Duration::from_millis(50));
        handle.send("one".to_string()).await.unwrap();
        handle.try_send("two".to_string()).unwrap();
        handle.close();

        assert_eq!(outlet.recv().await, Outbound::Frame("one".to_string()));
        assert_eq!(outlet.recv().await, Outbound::Frame("two".to_string()));
        assert_eq!(outlet.recv().await, Outbound::Close);
        assert!(handle.is_closed());
        assert_eq!(handle.send("late".to_string()).await, Err(SendError::Closed));
    }

    #[tokio::test]
    async fn test_send_to_dropped_outlet() {
        let (handle, outlet) = ConnectionHandle::channel(4, Duration::from_millis(50));
        drop(outlet);

        assert!(handle.is_closed());
        assert_eq!(handle.send("x".to_string()).await, Err(SendError::Closed));
        assert_eq!(handle.try_send("x".to_string()), Err(SendError::Closed));
        handle.closed().await;
    }

    #[tokio::test]
    async fn test_send_times_out_when_queue_is_full() {
        let timeout = Duration::from_millis(20);
        let (handle, _outlet) = ConnectionHandle::channel(1, timeout);
        handle.send("fills the queue".to_string()).await.unwrap();

        let result = handle.send("stalls".to_string()).await;
        assert_eq!(result, Err(SendError::TimedOut(timeout)));
    }

    #[tokio::test]
    async fn test_close_is_not_blocked_by_full_queue() {
        let (handle, mut outlet) = ConnectionHandle::channel(1, Duration::from_millis(20));
        handle.try_send("queued".to_string()).unwrap();
        handle.close();

        // Resolves immediately even though the queue is full
        handle.closed().await;
        assert_eq!(outlet.try_recv(), Some(Outbound::Frame("queued".to_string())));
        assert_eq!(outlet.try_recv(), Some(Outbound::Close));
    }

    #[tokio::test]
    async fn test_try_recv_on_idle_outlet() {
        let (_handle, mut outlet) = ConnectionHandle::channel(1, Duration::from_millis(20));
        assert_eq!(outlet.try_recv(), None);
    }
}
