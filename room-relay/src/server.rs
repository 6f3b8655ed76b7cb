use std::{future::Future, net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, State,
    },
    http::{HeaderValue, Method},
    response::Response,
    routing::get,
    Router,
};
use futures_util::{
    stream::{SplitSink, SplitStream},
    Sink, SinkExt, StreamExt,
};
use tokio::{
    net::TcpListener,
    select,
    sync::mpsc,
    time::{interval_at, timeout, Instant, MissedTickBehavior},
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{debug, info, warn};

use crate::{
    lifecycle::{Lifecycle, Session},
    message::{decode_client_event, encode, ServerEvent},
    relay::Relay,
};

/// How long a finished session waits for its writer to flush queued events.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub frontend_url: Option<String>,
    pub max_connections: Option<usize>,
    pub outbox_capacity: usize,
    pub heartbeat_interval: Duration,
    pub idle_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            frontend_url: None,
            max_connections: None,
            outbox_capacity: 128,
            heartbeat_interval: Duration::from_secs(25),
            idle_timeout: Duration::from_secs(45),
        }
    }
}

/// HTTP front of the relay: a health route and the WebSocket endpoint.
pub struct RelayServer {
    listener: TcpListener,
    lifecycle: Lifecycle,
    config: Arc<ServerConfig>,
}

impl RelayServer {
    pub fn new(listener: TcpListener, config: ServerConfig) -> Self {
        let relay = Arc::new(Relay::new(config.max_connections));
        Self {
            listener,
            lifecycle: Lifecycle::new(relay),
            config: Arc::new(config),
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn relay(&self) -> Arc<Relay> {
        Arc::clone(self.lifecycle.relay())
    }

    /// Serves until `shutdown` resolves, then waits for every upgraded
    /// session to finish so the shutdown notice reaches connected clients.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let RelayServer {
            listener,
            lifecycle,
            config,
        } = self;

        let sessions = CancellationToken::new();
        let tracker = TaskTracker::new();
        let relay = Arc::clone(lifecycle.relay());
        let app = router(AppState {
            lifecycle,
            config,
            sessions: sessions.clone(),
            tracker: tracker.clone(),
        });

        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            shutdown.await;
            handle_shutdown(&relay, &sessions).await;
        })
        .await
        .context("relay server failed")?;

        tracker.close();
        tracker.wait().await;
        debug!("all sessions finished");

        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

async fn handle_shutdown(relay: &Relay, sessions: &CancellationToken) {
    info!("relay shutting down");
    let report = relay.shutdown().await;
    debug!(?report, "notified connections of shutdown");
    sessions.cancel();
}

#[derive(Clone)]
struct AppState {
    lifecycle: Lifecycle,
    config: Arc<ServerConfig>,
    sessions: CancellationToken,
    tracker: TaskTracker,
}

fn router(state: AppState) -> Router {
    let cors = cors_layer(state.config.frontend_url.as_deref());
    Router::new()
        .route("/", get(health))
        .route("/ws", get(websocket_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}

fn cors_layer(frontend_url: Option<&str>) -> CorsLayer {
    let Some(origin) = frontend_url else {
        return CorsLayer::permissive();
    };

    match HeaderValue::from_str(origin) {
        Ok(origin) => CorsLayer::new()
            .allow_origin(origin)
            .allow_methods([Method::GET, Method::POST])
            .allow_credentials(true),
        Err(err) => {
            warn!(origin, error = %err, "invalid frontend origin, allowing any origin");
            CorsLayer::permissive()
        }
    }
}

async fn health() -> &'static str {
    "hello world"
}

async fn websocket_handler(
    State(state): State<AppState>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    ws: WebSocketUpgrade,
) -> Response {
    let peer = connect_info.map(|ConnectInfo(addr)| addr);
    let tracker = state.tracker.clone();
    ws.on_upgrade(move |socket| tracker.track_future(run_session(socket, peer, state)))
}

#[derive(Debug)]
enum SessionEnd {
    Closed,
    IdleTimeout,
    TransportError,
    Shutdown,
}

async fn run_session(socket: WebSocket, peer: Option<SocketAddr>, state: AppState) {
    let (outbox, inbox) = mpsc::channel(state.config.outbox_capacity);
    let (mut sink, mut stream) = socket.split();

    let session = match state.lifecycle.connect(outbox, peer).await {
        Ok(session) => session,
        Err(err) => {
            warn!(?peer, error = %err, "refusing connection");
            if let Err(err) = send_event(&mut sink, &ServerEvent::error(&err)).await {
                debug!(?peer, ?err, "failed to report refusal");
            }
            let _ = sink.send(Message::Close(None)).await;
            return;
        }
    };
    let id = session.id();

    // The greeting goes out before the writer starts so it is always the first frame.
    if let Err(err) = send_event(&mut sink, &ServerEvent::Connected { id }).await {
        debug!(connection = %id, ?err, "failed to greet connection");
        session.close().await;
        return;
    }

    let writer = tokio::spawn(write_outbound(sink, inbox, state.config.heartbeat_interval));
    let writer_abort = writer.abort_handle();

    let end = read_inbound(&mut stream, &session, &state).await;
    debug!(connection = %id, ?end, "session ending");
    session.close().await;

    // The writer stops on its own once the registry drops the outbox sender.
    if timeout(WRITER_DRAIN_TIMEOUT, writer).await.is_err() {
        debug!(connection = %id, "writer did not drain in time");
        writer_abort.abort();
    }
}

async fn read_inbound(
    stream: &mut SplitStream<WebSocket>,
    session: &Session,
    state: &AppState,
) -> SessionEnd {
    loop {
        let frame = select! {
            _ = state.sessions.cancelled() => return SessionEnd::Shutdown,
            frame = timeout(state.config.idle_timeout, stream.next()) => frame,
        };

        let message = match frame {
            Err(_) => return SessionEnd::IdleTimeout,
            Ok(None) => return SessionEnd::Closed,
            Ok(Some(Err(err))) => {
                debug!(connection = %session.id(), ?err, "websocket read failed");
                return SessionEnd::TransportError;
            }
            Ok(Some(Ok(message))) => message,
        };

        match message {
            Message::Text(text) => handle_text(&text, session).await,
            Message::Close(_) => return SessionEnd::Closed,
            Message::Binary(_) => debug!(connection = %session.id(), "ignoring binary frame"),
            Message::Ping(_) | Message::Pong(_) => {}
        }
    }
}

async fn handle_text(text: &str, session: &Session) {
    let id = session.id();
    let outcome = match decode_client_event(text) {
        Ok(Some(event)) => session.relay().handle(id, event).await.map(|_| ()),
        Ok(None) => {
            debug!(connection = %id, "ignoring unhandled event");
            Ok(())
        }
        Err(err) => Err(err),
    };

    if let Err(err) = outcome {
        debug!(connection = %id, error = %err, "rejected client event");
        session.relay().notify(id, ServerEvent::error(&err)).await;
    }
}

async fn write_outbound(
    mut sink: SplitSink<WebSocket, Message>,
    mut inbox: mpsc::Receiver<Arc<ServerEvent>>,
    heartbeat: Duration,
) {
    let mut ticker = interval_at(Instant::now() + heartbeat, heartbeat);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        select! {
            event = inbox.recv() => {
                let Some(event) = event else {
                    break;
                };
                if let Err(err) = send_event(&mut sink, &event).await {
                    debug!(?err, "failed to deliver event");
                    return;
                }
            }
            _ = ticker.tick() => {
                if let Err(err) = sink.send(Message::Ping(Vec::new())).await {
                    debug!(?err, "failed to send keepalive");
                    return;
                }
            }
        }
    }

    let _ = sink.send(Message::Close(None)).await;
}

async fn send_event<S>(sink: &mut S, event: &ServerEvent) -> Result<()>
where
    S: Sink<Message, Error = axum::Error> + Unpin,
{
    let text = encode(event).context("failed to encode event")?;
    sink.send(Message::Text(text)).await?;
    Ok(())
}
