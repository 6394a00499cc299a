//! WebSocket transport carrying JSON-RPC 2.0.
//!
//! ## Connection lifecycle
//!
//! 1. Client connects to `GET /ws`. A session is allocated before the
//!    socket is serviced; when the pool is full the connection is closed
//!    with a `SESSION_LIMIT` close reason and nothing else happens.
//! 2. The server sends the `connected` notification, then services
//!    requests. One JSON-RPC message per text frame, both directions.
//! 3. On disconnect the session is destroyed and any running process group
//!    is cancelled.
//!
//! ## Methods (client → server)
//!
//! | Method    | Params                                              | Result                              |
//! |-----------|-----------------------------------------------------|-------------------------------------|
//! | `execute` | `command`, `timeout?`, `env?`, `cwd?`, hint fields  | `{status:"started", pid, pgid}`     |
//! | `control` | `type` = `"PAUSE"` \| `"RESUME"` \| `"CANCEL"`      | `{status:"ok", state}`              |
//! | `hook`    | `phase` = `"pre"` \| `"post"` \| `"error"`          | `{status:"ok", phase}`              |
//!
//! ## Notifications (server → client)
//!
//! | Method                           | Key params                                    |
//! |----------------------------------|-----------------------------------------------|
//! | `connected`                      | `session_id`, `version`, `capabilities`       |
//! | `process.output`                 | `stream`, `data`, `seq`, `truncated`          |
//! | `process.early_completion`       | `marker`, `time_saved_ms`                     |
//! | `process.cancelled`              | `reason`                                      |
//! | `process.failed_after_completion`| `exit_code`                                   |
//! | `process.completed`              | `exit_code`, `reason`, `partial`, …           |
//! | `error.stream_buffer_overflow`   | `limit_bytes`                                 |
//! | `error.token_limit_exceeded`     | `expected_tokens`, `observed_tokens`          |
//!
//! `process.completed` is the terminal notification of an execution; no
//! further notifications for that execution follow it.
//!
//! ## Heartbeat
//!
//! The sink task pings on `heartbeat_secs`; the read loop records pongs.
//! A connection that misses pongs for `idle_close_secs` is closed.

pub mod jsonrpc;

use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::hooks::HookPhase;
use crate::proc::{ControlError, ControlKind};
use crate::sessions::runner::{start_execution, ExecuteError};
use crate::sessions::Session;
use crate::state::AppState;
use crate::timeout::TaskDescriptor;
use jsonrpc::{error_response, notification, result_response, RpcRequest};

/// `GET /ws` — WebSocket upgrade handler.
pub async fn ws_upgrade(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    let max_frame = state.config.server.max_frame_bytes;
    ws.max_message_size(max_frame)
        .max_frame_size(max_frame)
        .on_upgrade(move |socket| handle_ws(socket, state))
}

/// Policy close code used for the session-limit rejection (RFC 6455 "try
/// again later").
const CLOSE_TRY_AGAIN_LATER: u16 = 1013;

async fn handle_ws(socket: WebSocket, state: AppState) {
    // Allocate the session before anything is serviced; a full pool refuses
    // the connection with a typed close reason and existing sessions are
    // untouched.
    let session = match state.session_manager.create().await {
        Ok(session) => session,
        Err(e) => {
            warn!("connection refused: {e}");
            let (mut sink, _) = socket.split();
            let _ = sink
                .send(Message::Close(Some(CloseFrame {
                    code: CLOSE_TRY_AGAIN_LATER,
                    reason: format!("SESSION_LIMIT: {e}").into(),
                })))
                .await;
            return;
        }
    };
    let session_id = session.id.clone();

    let (mut ws_sink, mut ws_stream) = socket.split();

    // All outgoing JSON funnels through one unbounded channel so execution
    // drivers can emit without ever blocking on the socket.
    let (tx, mut rx) = mpsc::unbounded_channel::<Value>();

    let last_pong = Arc::new(StdMutex::new(Instant::now()));

    // Sink task: forwards channel messages and owns the heartbeat.
    let heartbeat = Duration::from_secs(state.config.server.heartbeat_secs);
    let idle_close = Duration::from_secs(state.config.server.idle_close_secs);
    let pong_seen = Arc::clone(&last_pong);
    let sink_session = session_id.clone();
    let send_task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(heartbeat);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                msg = rx.recv() => {
                    let Some(msg) = msg else { break };
                    let text = match serde_json::to_string(&msg) {
                        Ok(t) => t,
                        Err(e) => {
                            warn!("WS send: failed to serialize message: {e}");
                            continue;
                        }
                    };
                    if ws_sink.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    let idle = pong_seen.lock().map_or(Duration::ZERO, |at| at.elapsed());
                    if idle > idle_close {
                        info!("Session {sink_session}: no pong for {idle:?}, closing");
                        let _ = ws_sink.send(Message::Close(None)).await;
                        break;
                    }
                    if ws_sink.send(Message::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    let _ = tx.send(notification(
        "connected",
        json!({
            "session_id": session_id,
            "version": env!("CARGO_PKG_VERSION"),
            "capabilities": ["execute", "control", "hook"],
        }),
    ));

    loop {
        tokio::select! {
            ws_msg = ws_stream.next() => {
                match ws_msg {
                    Some(Ok(Message::Text(text))) => {
                        session.touch();
                        dispatch(&state, &session, &tx, &text).await;
                    }
                    Some(Ok(Message::Pong(_))) => {
                        if let Ok(mut at) = last_pong.lock() {
                            *at = Instant::now();
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        // Oversize frames and malformed websocket data land
                        // here — protocol error, close the connection.
                        debug!("Session {session_id}: websocket error: {e}");
                        break;
                    }
                }
            }
            // Reaper or shutdown asked this connection to close.
            () = session.closed.notified() => {
                info!("Session {session_id}: server-side close");
                break;
            }
        }
    }

    // Connection gone: destroy the session, cancelling any running process.
    state.session_manager.remove(&session_id).await;
    send_task.abort();
}

/// Parse and dispatch one JSON-RPC frame, sending whatever responses it
/// produces through `tx`.
async fn dispatch(
    state: &AppState,
    session: &Arc<Session>,
    tx: &mpsc::UnboundedSender<Value>,
    text: &str,
) {
    let request = match RpcRequest::parse(text) {
        Ok(request) => request,
        Err(code) => {
            let message = if code == jsonrpc::PARSE_ERROR {
                "failed to parse JSON-RPC frame"
            } else {
                "not a JSON-RPC 2.0 request"
            };
            let _ = tx.send(error_response(None, code, message));
            return;
        }
    };

    let id = request.id.clone();
    let reply = handle_method(state, session, tx, &request).await;

    // Client notifications (no id) get no response, per JSON-RPC 2.0.
    if let Some(id) = id {
        let message = match reply {
            Ok(result) => result_response(&id, result),
            Err((code, message)) => error_response(Some(&id), code, &message),
        };
        let _ = tx.send(message);
    }
}

type MethodReply = Result<Value, (i64, String)>;

async fn handle_method(
    state: &AppState,
    session: &Arc<Session>,
    tx: &mpsc::UnboundedSender<Value>,
    request: &RpcRequest,
) -> MethodReply {
    match request.method.as_str() {
        "execute" => handle_execute(state, session, tx, request.params.clone()).await,
        "control" => handle_control(session, request.params.clone()).await,
        "hook" => handle_hook(state, session, request.params.clone()),
        other => Err((
            jsonrpc::METHOD_NOT_FOUND,
            format!("unknown method: {other}"),
        )),
    }
}

async fn handle_execute(
    state: &AppState,
    session: &Arc<Session>,
    tx: &mpsc::UnboundedSender<Value>,
    params: Option<Value>,
) -> MethodReply {
    let params: jsonrpc::ExecuteParams =
        serde_json::from_value(params.unwrap_or(Value::Null))
            .map_err(|e| (jsonrpc::INVALID_PARAMS, format!("invalid execute params: {e}")))?;
    if params.command.trim().is_empty() {
        return Err((jsonrpc::INVALID_PARAMS, "command must not be empty".into()));
    }

    let task = TaskDescriptor {
        command: params.command,
        complexity: params.complexity,
        expected_output_tokens: params.expected_output_tokens,
        tools_allowed: params.tools_allowed,
        timeout_secs: params.timeout,
        structured: params.structured,
        env: params.env,
        cwd: params.cwd,
    };

    match start_execution(state, Arc::clone(session), task, tx.clone()).await {
        Ok(started) => Ok(json!({
            "status": "started",
            "pid": started.pid,
            "pgid": started.pgid,
            "timeout_ms": started.timeout.as_millis() as u64,
        })),
        Err(ExecuteError::Busy) => Err((jsonrpc::SESSION_BUSY, ExecuteError::Busy.to_string())),
        Err(ExecuteError::NotAllowed) => Err((
            jsonrpc::COMMAND_NOT_ALLOWED,
            ExecuteError::NotAllowed.to_string(),
        )),
        Err(e @ ExecuteError::SpawnFailed(_)) => Err((jsonrpc::SPAWN_FAILED, e.to_string())),
    }
}

async fn handle_control(session: &Arc<Session>, params: Option<Value>) -> MethodReply {
    let params: jsonrpc::ControlParams = serde_json::from_value(params.unwrap_or(Value::Null))
        .map_err(|e| (jsonrpc::INVALID_PARAMS, format!("invalid control params: {e}")))?;
    let kind: ControlKind = params.control_type.parse().map_err(|()| {
        (
            jsonrpc::INVALID_PARAMS,
            format!("unknown control type: {}", params.control_type),
        )
    })?;

    let Some(controller) = session.controller().await else {
        return Err((
            jsonrpc::INVALID_STATE,
            "no active process on this session".into(),
        ));
    };

    match controller.apply(kind).await {
        Ok(new_state) => Ok(json!({
            "status": "ok",
            "state": new_state.as_str(),
        })),
        Err(e @ ControlError::InvalidState { .. }) => Err((jsonrpc::INVALID_STATE, e.to_string())),
        Err(e @ ControlError::SignalFailed(_)) => {
            // Details go to the log; the client gets an opaque reference.
            let correlation = uuid::Uuid::new_v4();
            warn!("Session {}: control failed [{correlation}]: {e}", session.id);
            Err((
                jsonrpc::INTERNAL_ERROR,
                format!("internal error (ref {correlation})"),
            ))
        }
    }
}

fn handle_hook(state: &AppState, session: &Arc<Session>, params: Option<Value>) -> MethodReply {
    let params: jsonrpc::HookParams = serde_json::from_value(params.unwrap_or(Value::Null))
        .map_err(|e| (jsonrpc::INVALID_PARAMS, format!("invalid hook params: {e}")))?;
    let phase = HookPhase::from_wire(&params.phase).ok_or_else(|| {
        (
            jsonrpc::INVALID_PARAMS,
            format!("unknown hook phase: {}", params.phase),
        )
    })?;

    state.hooks.fire(phase, &session.id, "", None);
    Ok(json!({ "status": "ok", "phase": phase.as_str() }))
}
