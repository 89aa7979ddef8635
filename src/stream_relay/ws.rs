//! Per-relay WebSocket server
//!
//! Every relay gets its own tiny axum server on the port the pool bound
//! for it. Viewers receive the transcoder's output verbatim as binary
//! frames. A slow viewer only lags its own broadcast cursor; when the
//! channel wraps it silently skips ahead instead of stalling the reader.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

#[derive(Clone)]
struct RelayWsState {
    frames: broadcast::Sender<Bytes>,
    viewers: Arc<AtomicUsize>,
    shutdown: watch::Receiver<bool>,
}

/// Running WS server for one relay
pub struct WsServerHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl WsServerHandle {
    /// Stop accepting viewers, disconnect the connected ones and wait for
    /// the server to wind down.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            warn!(error = %e, "Relay WS server task failed");
        }
    }
}

/// Serve viewers on an already-bound listener.
pub fn serve(
    listener: TcpListener,
    frames: broadcast::Sender<Bytes>,
    viewers: Arc<AtomicUsize>,
) -> WsServerHandle {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let state = RelayWsState {
        frames,
        viewers,
        shutdown: shutdown_rx.clone(),
    };
    let app = Router::new().route("/", get(ws_handler)).with_state(state);

    let mut signal = shutdown_rx;
    let task = tokio::spawn(async move {
        let serve = axum::serve(listener, app).with_graceful_shutdown(async move {
            let _ = signal.changed().await;
        });
        if let Err(e) = serve.await {
            warn!(error = %e, "Relay WS server exited with error");
        }
    });

    WsServerHandle {
        shutdown: shutdown_tx,
        task,
    }
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<RelayWsState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_viewer(socket, state))
}

async fn handle_viewer(socket: WebSocket, state: RelayWsState) {
    let viewer_no = state.viewers.fetch_add(1, Ordering::SeqCst) + 1;
    debug!(viewers = viewer_no, "Stream viewer connected");

    let (mut sender, mut receiver) = socket.split();
    let mut frames = state.frames.subscribe();
    let mut shutdown = state.shutdown.clone();

    let send_task = tokio::spawn(async move {
        loop {
            tokio::select! {
                frame = frames.recv() => match frame {
                    Ok(frame) => {
                        if sender.send(Message::Binary(frame.to_vec())).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        trace!(skipped = skipped, "Viewer lagged, skipping frames");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                _ = shutdown.changed() => {
                    let _ = sender.send(Message::Close(None)).await;
                    break;
                }
            }
        }
    });

    // Drain the client side; viewers are read-only.
    let recv_task = tokio::spawn(async move {
        while let Some(result) = receiver.next().await {
            match result {
                Ok(Message::Close(_)) | Err(_) => break,
                Ok(_) => {}
            }
        }
    });

    tokio::select! {
        _ = send_task => {}
        _ = recv_task => {}
    }

    let remaining = state.viewers.fetch_sub(1, Ordering::SeqCst) - 1;
    debug!(viewers = remaining, "Stream viewer disconnected");
}
