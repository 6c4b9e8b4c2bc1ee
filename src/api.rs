//! HTTP front-end — task inspection, message ingestion, and a WebSocket
//! feed of task events.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{
        Path, Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;
use tokio::sync::broadcast;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tower_http::cors::CorsLayer;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::channels::{InboundEvent, InboundMessage};
use crate::error::{Error, TaskError};
use crate::inbox::{Inbox, InboxOutcome};
use crate::store::TaskStore;
use crate::tasks::{TaskEvent, TaskStatus};
use crate::worker::QueueScheduler;

const DEFAULT_LIST_LIMIT: usize = 50;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn TaskStore>,
    pub inbox: Arc<Inbox>,
    pub scheduler: Arc<QueueScheduler>,
    pub events: broadcast::Sender<TaskEvent>,
}

/// Build the router with REST and WebSocket routes.
pub fn api_routes(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ws", get(ws_handler))
        .route("/api/tasks", get(list_tasks))
        .route("/api/tasks/{id}", get(get_task))
        .route("/api/tasks/{id}/reject", post(reject_task))
        .route("/api/messages", post(post_message))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(serde_json::json!({ "error": message.into() }))).into_response()
}

fn parse_id(id: &str) -> Result<Uuid, Response> {
    Uuid::parse_str(id).map_err(|_| error_response(StatusCode::BAD_REQUEST, "Invalid task ID"))
}

// ── Health ──────────────────────────────────────────────────────────────

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "inbox-assist",
        "running": state.scheduler.running_count(),
    }))
}

// ── Tasks ───────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ListQuery {
    status: Option<String>,
    limit: Option<usize>,
}

/// Without `status`, newest first. With `status`, oldest first (queue
/// order). `limit` caps both.
async fn list_tasks(State(state): State<AppState>, Query(query): Query<ListQuery>) -> Response {
    let limit = query.limit.unwrap_or(DEFAULT_LIST_LIMIT);
    let result = match query.status.as_deref() {
        Some(raw) => match raw.parse::<TaskStatus>() {
            Ok(status) => state.store.all_by_status(status).await.map(|mut tasks| {
                tasks.truncate(limit);
                tasks
            }),
            Err(e) => return error_response(StatusCode::BAD_REQUEST, e),
        },
        None => state.store.list_recent(limit).await,
    };
    match result {
        Ok(tasks) => Json(tasks).into_response(),
        Err(e) => {
            warn!(error = %e, "Failed to list tasks");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

async fn get_task(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match state.store.get(id).await {
        Ok(Some(task)) => Json(task).into_response(),
        Ok(None) => error_response(StatusCode::NOT_FOUND, "Task not found"),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

async fn reject_task(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match state.inbox.reject_task(id).await {
        Ok(outcome @ InboxOutcome::Rejected { .. }) => Json(outcome).into_response(),
        Ok(_) => error_response(StatusCode::CONFLICT, "Task is no longer rejectable"),
        Err(Error::Task(TaskError::NotFound { .. })) => {
            error_response(StatusCode::NOT_FOUND, "Task not found")
        }
        Err(e @ Error::Task(TaskError::InvalidTransition { .. })) => {
            error_response(StatusCode::CONFLICT, e.to_string())
        }
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

// ── Messages ────────────────────────────────────────────────────────────

/// New messages are stored before responding (201). Threaded replies may run
/// the agent, so they are accepted (202) and answered on the event stream.
async fn post_message(State(state): State<AppState>, Json(msg): Json<InboundMessage>) -> Response {
    if msg.thread_id.trim().is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "thread_id is required");
    }
    if msg.text.trim().is_empty() && msg.attachments.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "Message is empty");
    }
    if msg.is_reply {
        let thread_id = msg.thread_id.clone();
        let inbox = Arc::clone(&state.inbox);
        tokio::spawn(async move {
            let outcome = inbox.dispatch(InboundEvent::Message(msg)).await;
            debug!(?outcome, "Threaded reply handled");
        });
        return (
            StatusCode::ACCEPTED,
            Json(serde_json::json!({ "status": "accepted", "thread_id": thread_id })),
        )
            .into_response();
    }
    match state.inbox.handle(InboundEvent::Message(msg)).await {
        Ok(outcome @ InboxOutcome::Created { .. }) => {
            (StatusCode::CREATED, Json(outcome)).into_response()
        }
        Ok(outcome) => Json(outcome).into_response(),
        Err(e) => {
            warn!(error = %e, "Failed to handle posted message");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

// ── WebSocket ───────────────────────────────────────────────────────────

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    info!("WebSocket client connecting");
    let events = state.events.subscribe();
    ws.on_upgrade(move |socket| handle_socket(socket, events))
}

async fn handle_socket(mut socket: WebSocket, events: broadcast::Receiver<TaskEvent>) {
    info!("WebSocket client connected");
    let mut events = BroadcastStream::new(events);

    loop {
        tokio::select! {
            next = events.next() => {
                match next {
                    Some(Ok(event)) => {
                        let Ok(json) = serde_json::to_string(&event) else {
                            continue;
                        };
                        if socket.send(Message::Text(json.into())).await.is_err() {
                            debug!("Client disconnected during send");
                            break;
                        }
                    }
                    Some(Err(BroadcastStreamRecvError::Lagged(n))) => {
                        warn!(missed = n, "WS client lagged behind task events");
                    }
                    None => {
                        debug!("Event channel closed");
                        break;
                    }
                }
            }

            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Ping(data))) => {
                        if socket.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        info!("WebSocket client disconnected");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "WebSocket error");
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    info!("WebSocket connection closed");
}
