// ABOUTME: Streaming adapter relaying session events to a client as JSON frames
// ABOUTME: Preserves emission order and paces output frames; never cancels the session

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use coderun_sandbox::ExecutionEvent;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, trace};

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Failed to encode frame: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("Connection closed: {0}")]
    Closed(String),
}

/// Outbound half of an execution channel
#[async_trait]
pub trait FrameTransport: Send {
    async fn send_frame(&mut self, frame: String) -> Result<(), TransportError>;

    async fn close(&mut self) -> Result<(), TransportError>;
}

#[async_trait]
impl FrameTransport for WebSocket {
    async fn send_frame(&mut self, frame: String) -> Result<(), TransportError> {
        self.send(Message::Text(frame.into()))
            .await
            .map_err(|e| TransportError::Closed(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.send(Message::Close(None))
            .await
            .map_err(|e| TransportError::Closed(e.to_string()))
    }
}

pub fn encode_frame(event: &ExecutionEvent) -> Result<String, TransportError> {
    Ok(serde_json::to_string(event)?)
}

/// What the relay managed to deliver
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RelayReport {
    pub frames_sent: usize,
    pub disconnected: bool,
}

/// Forward every event from `events` to `transport` until the session drops
/// its sender.
///
/// Once the transport fails the remaining events are drained and discarded so
/// the session keeps running to its own cleanup.
pub async fn relay_events<T>(
    mut events: mpsc::Receiver<ExecutionEvent>,
    transport: &mut T,
    pacing: Duration,
) -> RelayReport
where
    T: FrameTransport + ?Sized,
{
    let mut report = RelayReport::default();

    while let Some(event) = events.recv().await {
        if report.disconnected {
            trace!(kind = event.kind(), "Dropping event for disconnected client");
            continue;
        }

        let frame = match encode_frame(&event) {
            Ok(frame) => frame,
            Err(e) => {
                debug!("Skipping unencodable event: {}", e);
                continue;
            }
        };

        if let Err(e) = transport.send_frame(frame).await {
            debug!("Client went away: {}", e);
            report.disconnected = true;
            continue;
        }
        report.frames_sent += 1;

        if event.is_output() && !pacing.is_zero() {
            tokio::time::sleep(pacing).await;
        }
    }

    report
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// In-memory transport that records frames and can fail on demand
    #[derive(Default)]
    pub struct RecordingTransport {
        pub frames: Vec<String>,
        pub fail_after: Option<usize>,
        pub closed: bool,
    }

    impl RecordingTransport {
        pub fn events(&self) -> Vec<ExecutionEvent> {
            self.frames
                .iter()
                .map(|f| serde_json::from_str(f).unwrap())
                .collect()
        }
    }

    #[async_trait]
    impl FrameTransport for RecordingTransport {
        async fn send_frame(&mut self, frame: String) -> Result<(), TransportError> {
            if self.fail_after.is_some_and(|limit| self.frames.len() >= limit) {
                return Err(TransportError::Closed("peer reset".to_string()));
            }
            self.frames.push(frame);
            Ok(())
        }

        async fn close(&mut self) -> Result<(), TransportError> {
            self.closed = true;
            Ok(())
        }
    }
}
