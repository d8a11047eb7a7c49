// ABOUTME: WebSocket execution channel: one initiation message in, ordered frames out
// ABOUTME: Runs the session and the frame relay side by side and closes after cleanup

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use coderun_sandbox::{ExecutionEvent, ExecutionRequest, Readiness, EVENT_BUFFER};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::stream::{encode_frame, relay_events, FrameTransport};
use crate::AppState;

pub async fn execute_ws(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: AppState) {
    debug!("Execution channel opened");
    let Some(initiation) = read_initiation(&mut socket).await else {
        debug!("Client left before sending a request");
        return;
    };
    serve_channel(&initiation, &mut socket, &state).await;
}

/// First text payload from the client, skipping control frames
async fn read_initiation(socket: &mut WebSocket) -> Option<String> {
    while let Some(message) = socket.recv().await {
        match message {
            Ok(Message::Text(text)) => return Some(text.as_str().to_owned()),
            Ok(Message::Binary(bytes)) => {
                return Some(String::from_utf8_lossy(&bytes).into_owned())
            }
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => continue,
            Ok(Message::Close(_)) => return None,
            Err(e) => {
                debug!("WebSocket receive failed: {}", e);
                return None;
            }
        }
    }
    None
}

async fn reject<T>(transport: &mut T, message: String)
where
    T: FrameTransport + ?Sized,
{
    warn!("Refusing execution request: {}", message);
    let event = ExecutionEvent::error(format!("Server error: {}", message));
    if let Ok(frame) = encode_frame(&event) {
        let _ = transport.send_frame(frame).await;
    }
    let _ = transport.close().await;
}

/// Drive one execution channel to completion over `transport`.
///
/// The transport is closed only after the session has cleaned up.
pub async fn serve_channel<T>(initiation: &str, transport: &mut T, state: &AppState)
where
    T: FrameTransport + ?Sized,
{
    match state.readiness.get().await {
        Readiness::Ready => {}
        Readiness::Preparing => {
            return reject(transport, "language images are still being prepared".to_string())
                .await;
        }
        Readiness::Failed(reason) => {
            return reject(transport, format!("language images unavailable: {}", reason)).await;
        }
    }

    let request: ExecutionRequest = match serde_json::from_str(initiation) {
        Ok(request) => request,
        Err(e) => return reject(transport, e.to_string()).await,
    };

    let (tx, rx) = mpsc::channel(EVENT_BUFFER);
    let (summary, report) = tokio::join!(
        state.manager.start(request, tx),
        relay_events(rx, &mut *transport, state.output_pacing)
    );

    info!(
        session_id = %summary.session_id,
        frames = report.frames_sent,
        client_disconnected = report.disconnected,
        "Execution channel finished"
    );

    if !report.disconnected {
        let _ = transport.close().await;
    }
}
