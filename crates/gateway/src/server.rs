use std::sync::{Arc, Weak};

use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info};

use nerva_config::GatewayConfig;
use nerva_core::{Event, Hub, payload};
use nerva_permissions::PermissionManager;

use crate::{GatewayPhase, PROPOSAL_TYPE, Shared};

pub(crate) struct ServerCtx {
    pub shared: Arc<Shared>,
    pub config: GatewayConfig,
    pub hub: Weak<Hub>,
    pub sessions: Option<Arc<PermissionManager>>,
    pub shutdown: watch::Receiver<bool>,
}

/// Worker thread entry point. Builds a single-threaded runtime of its own
/// and drives the listener to completion inside it.
pub(crate) fn run(ctx: ServerCtx) {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            error!(?err, "gateway runtime construction failed");
            ctx.shared.set_phase(GatewayPhase::Failed);
            return;
        }
    };
    runtime.block_on(serve(ctx));
}

async fn serve(ctx: ServerCtx) {
    ctx.shared.set_phase(GatewayPhase::Starting);

    let addr = format!("{}:{}", ctx.config.host, ctx.config.port);
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err) => {
            error!(%addr, ?err, "gateway bind failed");
            ctx.shared.set_phase(GatewayPhase::Failed);
            return;
        }
    };
    let local_addr = listener.local_addr().ok();
    ctx.shared.set_bound_addr(local_addr);

    // Announced before the phase flip: the event lands in the pending queue
    // and reaches clients as backlog, so a caller that observed `Listening`
    // never sees it arrive late on the bus.
    let port = local_addr.map_or(ctx.config.port, |a| a.port());
    if let Some(hub) = ctx.hub.upgrade() {
        hub.emit(
            "system.started",
            payload(json!({
                "component": "local_event_gateway",
                "host": ctx.config.host,
                "port": port,
            })),
        );
    }
    ctx.shared.go_listening();
    info!(host = %ctx.config.host, port, "gateway listening");

    let state = AppState {
        shared: ctx.shared.clone(),
        hub: ctx.hub.clone(),
        sessions: ctx.sessions.clone(),
    };
    let app = Router::new().route("/", get(ws_handler)).with_state(state);

    let mut shutdown = ctx.shutdown.clone();
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await;
    if let Err(err) = served {
        error!(?err, "gateway server error");
    }

    ctx.shared.set_phase(GatewayPhase::Stopped);
    info!("gateway stopped");
    if let Some(hub) = ctx.hub.upgrade() {
        hub.emit(
            "system.stopped",
            payload(json!({"component": "local_event_gateway"})),
        );
    }
}

#[derive(Clone)]
struct AppState {
    shared: Arc<Shared>,
    hub: Weak<Hub>,
    sessions: Option<Arc<PermissionManager>>,
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_client(socket, state))
}

/// One task per connection. The client is registered before the handshake
/// frame so live events published during backlog replay land in its channel
/// and drain afterwards, preserving order.
async fn handle_client(mut socket: WebSocket, state: AppState) {
    let (client_id, mut rx) = state.shared.register_client();
    info!(client_id, "gateway client connected");

    let hello = Event::new("gateway.hello", payload(json!({"status": "connected"})));
    if send_event(&mut socket, &hello).await.is_err() {
        state.shared.remove_client(client_id);
        return;
    }
    for event in state.shared.backlog_snapshot() {
        if send_event(&mut socket, &event).await.is_err() {
            state.shared.remove_client(client_id);
            return;
        }
    }

    loop {
        tokio::select! {
            frame = rx.recv() => match frame {
                Some(text) => {
                    if socket.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
            inbound = socket.recv() => match inbound {
                Some(Ok(Message::Text(text))) => {
                    let reply = handle_inbound(&state, client_id, &text);
                    if send_event(&mut socket, &reply).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    debug!(client_id, ?err, "gateway client read error");
                    break;
                }
            }
        }
    }

    state.shared.remove_client(client_id);
    info!(client_id, "gateway client disconnected");
}

async fn send_event(socket: &mut WebSocket, event: &Event) -> Result<(), axum::Error> {
    match serde_json::to_string(event) {
        Ok(frame) => socket.send(Message::Text(frame)).await,
        Err(err) => {
            error!(?err, "unserializable gateway frame");
            Ok(())
        }
    }
}

/// Validate an inbound frame and, for proposals, re-emit it onto the bus.
/// Always produces a direct reply frame for the submitting client.
fn handle_inbound(state: &AppState, client_id: u64, text: &str) -> Event {
    let value: Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(_) => return error_frame("invalid JSON frame"),
    };
    let Some(frame) = value.as_object() else {
        return error_frame("frame must be a JSON object");
    };
    let Some(event_type) = frame.get("type").and_then(Value::as_str) else {
        return error_frame("frame missing type");
    };
    if event_type != PROPOSAL_TYPE {
        return error_frame(&format!("unsupported inbound type: {event_type}"));
    }

    let mut proposal = frame
        .get("payload")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();

    if let Some(sessions) = &state.sessions {
        let action = proposal
            .get("intent")
            .and_then(Value::as_str)
            .unwrap_or(PROPOSAL_TYPE);
        if let Some(level) = sessions.evaluate_sessions(action) {
            if !level.grants_access() {
                debug!(client_id, action, "proposal declined by session policy");
                return error_frame("proposal declined by session policy");
            }
        }
    }

    // Fold the sender's identity into the re-emitted payload.
    if let Some(agent) = frame.get("agent") {
        proposal.insert("_agent".to_string(), agent.clone());
    } else if !proposal.contains_key("_agent") {
        proposal.insert(
            "_agent".to_string(),
            json!({"transport": "websocket", "client_id": client_id}),
        );
    }

    match state.hub.upgrade() {
        Some(hub) => {
            hub.emit(PROPOSAL_TYPE, proposal);
            Event::new("gateway.ack", payload(json!({"received": PROPOSAL_TYPE})))
        }
        None => error_frame("hub is gone"),
    }
}

fn error_frame(message: &str) -> Event {
    Event::new("gateway.error", payload(json!({"error": message})))
}
