use axum::{
    Router,
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
    routing::get,
};
use lib_tagwall::{Broadcaster, ChannelId, ChannelSink, SubscriberSink};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio_util::sync::CancellationToken;

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Clone)]
pub struct AppState {
    pub broadcaster: Broadcaster,
    pub shutdown: CancellationToken,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

pub async fn run(port: u16, state: AppState) -> anyhow::Result<()> {
    let shutdown = state.shutdown.clone();
    let app = router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    log::info!("Downstream server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown.cancelled().await;
            log::info!("Downstream server shutting down.");
        })
        .await?;
    Ok(())
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

async fn health_handler() -> impl IntoResponse {
    (axum::http::StatusCode::OK, "OK")
}

async fn handle_socket(mut socket: WebSocket, state: AppState) {
    let channel = ChannelId(NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed));
    let (sink, mut outbound) = ChannelSink::new(channel);
    let sink: Arc<dyn SubscriberSink> = Arc::new(sink);
    log::info!("Subscriber {} connected", channel);

    loop {
        tokio::select! {
            _ = state.shutdown.cancelled() => {
                let _ = socket.send(Message::Close(None)).await;
                break;
            }
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Text(line))) => {
                    match state.broadcaster.on_subscriber_message(&sink, line.as_str()) {
                        Ok(accepted) => log::debug!("Subscriber {}: {:?} -> {}", channel, line.as_str(), accepted),
                        Err(e) => log::info!("Subscriber {} sent a bad command: {}", channel, e),
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    log::debug!("Subscriber {} socket error: {}", channel, e);
                    break;
                }
            },
            Some(payload) = outbound.recv() => {
                let text = match std::str::from_utf8(&payload) {
                    Ok(text) => text,
                    Err(e) => {
                        log::warn!("Dropping non-UTF-8 payload for {}: {}", channel, e);
                        continue;
                    }
                };
                if socket.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
        }
    }

    let released = state.broadcaster.on_subscriber_disconnect(channel);
    log::info!("Subscriber {} disconnected ({} tags released)", channel, released);
}
