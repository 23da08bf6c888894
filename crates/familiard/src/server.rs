//! HTTP control plane for familiard.
//!
//! A thin local API over the workflow engine. Bound to 127.0.0.1; when an auth token is
//! configured every request must carry `Authorization: Bearer <token>`.

use std::collections::VecDeque;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use familiar_core::loader::GrimoireSummary;
use familiar_core::{Event, Question, TaskInfo, Workflow, WorkflowStatus};
use futures_util::stream::{self, Stream};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::agent::OutputLine;
use crate::engine::{Engine, EngineError};
use crate::events::EventBus;
use crate::recovery::RecoveryCoordinator;
use crate::worktree::{CleanupReport, OrphanWorktree};

/// Events fetched per storage read while replaying history.
const REPLAY_PAGE: i64 = 500;

/// Default number of output lines returned by the tail endpoint.
const DEFAULT_TAIL_LINES: usize = 200;

/// Shared state for HTTP handlers.
#[derive(Debug)]
pub struct AppState {
    pub engine: Engine,
    pub recovery: Arc<RecoveryCoordinator>,
    pub auth_token: Option<String>,
}

type ApiError = (StatusCode, Json<ErrorResponse>);
type ApiResult<T> = Result<T, ApiError>;

/// Create the router with all endpoints.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/workflows", post(start_workflow).get(list_workflows))
        .route("/workflows/{task_id}", get(get_workflow))
        .route("/workflows/{task_id}/cancel", post(cancel_workflow))
        .route("/workflows/{task_id}/retry", post(retry_workflow))
        .route("/workflows/{task_id}/approve-merge", post(approve_merge))
        .route("/workflows/{task_id}/reject-merge", post(reject_merge))
        .route("/workflows/{task_id}/cleanup", post(cleanup_workflow))
        .route("/workflows/{task_id}/output", get(workflow_output))
        .route("/questions", get(list_questions))
        .route("/questions/{id}/answer", post(answer_question))
        .route("/grimoires", get(list_grimoires))
        .route("/worktrees/orphans", get(list_orphans))
        .route("/events", get(stream_events))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve the API on 127.0.0.1 until `shutdown` is cancelled.
pub async fn start_server(
    state: Arc<AppState>,
    port: u16,
    shutdown: CancellationToken,
) -> Result<(), std::io::Error> {
    let app = create_router(state);
    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    info!(addr = %addr, "HTTP server listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

fn authorized(expected: Option<&str>, headers: &HeaderMap) -> bool {
    let Some(expected) = expected else {
        return true;
    };
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .is_some_and(|token| token == expected)
}

/// Check the bearer token if one is configured.
fn check_auth(state: &AppState, headers: &HeaderMap) -> ApiResult<()> {
    if authorized(state.auth_token.as_deref(), headers) {
        return Ok(());
    }
    let message = if headers.contains_key("authorization") {
        "invalid auth token"
    } else {
        "missing or invalid Authorization header"
    };
    Err((
        StatusCode::UNAUTHORIZED,
        Json(ErrorResponse {
            error: message.to_string(),
        }),
    ))
}

fn api_error(status: StatusCode, error: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: error.into(),
        }),
    )
}

/// Map an engine failure to a response. Caller mistakes log at `warn`, everything else
/// at `error`.
fn engine_error(e: EngineError) -> ApiError {
    let status = if e.is_not_found() {
        StatusCode::NOT_FOUND
    } else if e.is_conflict() {
        StatusCode::CONFLICT
    } else if e.is_invalid() {
        StatusCode::BAD_REQUEST
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    if status.is_server_error() {
        error!(error = %e, "request failed");
    } else {
        warn!(status = status.as_u16(), error = %e, "request rejected");
    }
    api_error(status, e.to_string())
}

/// Decode an optional JSON body. An empty body yields the default.
fn optional_body<T: DeserializeOwned + Default>(body: &Bytes) -> ApiResult<T> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body)
        .map_err(|e| api_error(StatusCode::BAD_REQUEST, format!("invalid request body: {e}")))
}

// --- Request/Response types ---

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// Request body for POST /workflows.
#[derive(Debug, Deserialize)]
pub struct StartWorkflowRequest {
    pub task_id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub acceptance_criteria: String,
    /// Grimoire to run; the configured default when absent.
    #[serde(default)]
    pub grimoire: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct WorkflowResponse {
    pub workflow: Workflow,
}

#[derive(Debug, Deserialize, Default)]
pub struct ListWorkflowsQuery {
    #[serde(default)]
    pub status: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ListWorkflowsResponse {
    pub workflows: Vec<Workflow>,
}

#[derive(Debug, Deserialize, Default)]
pub struct ReasonRequest {
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
pub struct CleanupRequest {
    /// Also delete an unmerged task branch.
    #[serde(default)]
    pub discard: bool,
}

#[derive(Debug, Serialize)]
pub struct CleanupResponse {
    pub task_id: String,
    #[serde(flatten)]
    pub report: CleanupReport,
}

#[derive(Debug, Deserialize, Default)]
pub struct OutputQuery {
    #[serde(default)]
    pub lines: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct OutputResponse {
    pub task_id: String,
    pub lines: Vec<OutputLine>,
}

#[derive(Debug, Deserialize, Default)]
pub struct QuestionsQuery {
    #[serde(default)]
    pub task_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct QuestionsResponse {
    pub questions: Vec<Question>,
}

#[derive(Debug, Deserialize)]
pub struct AnswerRequest {
    pub answer: String,
}

#[derive(Debug, Serialize)]
pub struct QuestionResponse {
    pub question: Question,
}

#[derive(Debug, Serialize)]
pub struct GrimoiresResponse {
    pub grimoires: Vec<GrimoireSummary>,
}

#[derive(Debug, Serialize)]
pub struct OrphansResponse {
    pub orphans: Vec<OrphanWorktree>,
}

// --- Handlers ---

async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let slots = &state.engine.deps().slots;
    Json(serde_json::json!({
        "status": "ok",
        "workflows": state.engine.list(None).len(),
        "agents_running": slots.in_use(),
        "agent_capacity": slots.capacity(),
    }))
}

/// POST /workflows - Start a workflow for a task.
async fn start_workflow(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<StartWorkflowRequest>,
) -> ApiResult<impl IntoResponse> {
    check_auth(&state, &headers)?;

    let task = TaskInfo {
        id: req.task_id,
        title: req.title,
        description: req.description,
        acceptance_criteria: req.acceptance_criteria,
    };
    let workflow = state
        .engine
        .start(task, req.grimoire.as_deref())
        .await
        .map_err(engine_error)?;

    info!(task_id = %workflow.task_id, grimoire = %workflow.grimoire_name, "workflow started via API");
    Ok((StatusCode::CREATED, Json(WorkflowResponse { workflow })))
}

/// GET /workflows - List workflows, optionally filtered by status.
async fn list_workflows(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<ListWorkflowsQuery>,
) -> ApiResult<impl IntoResponse> {
    check_auth(&state, &headers)?;

    let status = match query.status.as_deref() {
        None => None,
        Some(s) => Some(WorkflowStatus::parse(s).ok_or_else(|| {
            api_error(StatusCode::BAD_REQUEST, format!("unknown status: {s}"))
        })?),
    };
    Ok(Json(ListWorkflowsResponse {
        workflows: state.engine.list(status),
    }))
}

/// GET /workflows/{task_id}
async fn get_workflow(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(task_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    check_auth(&state, &headers)?;

    let workflow = state.engine.get(&task_id).map_err(engine_error)?;
    Ok(Json(WorkflowResponse { workflow }))
}

/// POST /workflows/{task_id}/cancel - Body `{"reason": ...}` is optional.
async fn cancel_workflow(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(task_id): Path<String>,
    body: Bytes,
) -> ApiResult<impl IntoResponse> {
    check_auth(&state, &headers)?;

    let req: ReasonRequest = optional_body(&body)?;
    let reason = req.reason.unwrap_or_else(|| "cancelled via API".to_string());
    let workflow = state
        .engine
        .cancel(&task_id, &reason)
        .await
        .map_err(engine_error)?;
    Ok(Json(WorkflowResponse { workflow }))
}

/// POST /workflows/{task_id}/retry
async fn retry_workflow(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(task_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    check_auth(&state, &headers)?;

    let workflow = state.engine.retry(&task_id).await.map_err(engine_error)?;
    Ok(Json(WorkflowResponse { workflow }))
}

/// POST /workflows/{task_id}/approve-merge
async fn approve_merge(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(task_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    check_auth(&state, &headers)?;

    let workflow = state
        .engine
        .approve_merge(&task_id)
        .await
        .map_err(engine_error)?;
    Ok(Json(WorkflowResponse { workflow }))
}

/// POST /workflows/{task_id}/reject-merge - Body `{"reason": ...}` is optional.
async fn reject_merge(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(task_id): Path<String>,
    body: Bytes,
) -> ApiResult<impl IntoResponse> {
    check_auth(&state, &headers)?;

    let req: ReasonRequest = optional_body(&body)?;
    let workflow = state
        .engine
        .reject_merge(&task_id, req.reason.as_deref().unwrap_or_default())
        .await
        .map_err(engine_error)?;
    Ok(Json(WorkflowResponse { workflow }))
}

/// POST /workflows/{task_id}/cleanup - Remove a finished workflow's worktree.
async fn cleanup_workflow(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(task_id): Path<String>,
    body: Bytes,
) -> ApiResult<impl IntoResponse> {
    check_auth(&state, &headers)?;

    let req: CleanupRequest = optional_body(&body)?;
    let report = state
        .engine
        .cleanup(&task_id, req.discard)
        .await
        .map_err(engine_error)?;
    Ok(Json(CleanupResponse { task_id, report }))
}

/// GET /workflows/{task_id}/output?lines=N - Tail of the agent output buffer.
async fn workflow_output(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(task_id): Path<String>,
    Query(query): Query<OutputQuery>,
) -> ApiResult<impl IntoResponse> {
    check_auth(&state, &headers)?;

    let lines = state
        .engine
        .output_tail(&task_id, query.lines.unwrap_or(DEFAULT_TAIL_LINES))
        .map_err(engine_error)?;
    Ok(Json(OutputResponse { task_id, lines }))
}

/// GET /questions?task_id=T - Pending questions.
async fn list_questions(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<QuestionsQuery>,
) -> ApiResult<impl IntoResponse> {
    check_auth(&state, &headers)?;

    Ok(Json(QuestionsResponse {
        questions: state.engine.pending_questions(query.task_id.as_deref()),
    }))
}

/// POST /questions/{id}/answer
async fn answer_question(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(req): Json<AnswerRequest>,
) -> ApiResult<impl IntoResponse> {
    check_auth(&state, &headers)?;

    let question = state
        .engine
        .answer_question(&id, &req.answer)
        .await
        .map_err(engine_error)?;
    Ok(Json(QuestionResponse { question }))
}

/// GET /grimoires
async fn list_grimoires(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> ApiResult<impl IntoResponse> {
    check_auth(&state, &headers)?;

    Ok(Json(GrimoiresResponse {
        grimoires: state.engine.deps().loader.list(),
    }))
}

/// GET /worktrees/orphans - Run an orphan scan now.
async fn list_orphans(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> ApiResult<impl IntoResponse> {
    check_auth(&state, &headers)?;

    let orphans = state.recovery.scan_orphans().await.map_err(|e| {
        error!(error = %e, "orphan scan failed");
        api_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("orphan scan failed: {e}"),
        )
    })?;
    Ok(Json(OrphansResponse { orphans }))
}

// --- Event stream ---

/// Query params for GET /events.
#[derive(Debug, Deserialize, Default)]
pub struct StreamEventsQuery {
    /// Sequence number to resume after. Falls back to the `Last-Event-ID` header.
    #[serde(default)]
    pub after: Option<i64>,
    /// Only events for this task.
    #[serde(default)]
    pub task_id: Option<String>,
}

/// SSE event data wrapper for structured events.
#[derive(Debug, Serialize)]
struct SseEventData {
    seq: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    task_id: Option<String>,
    event_type: String,
    timestamp: i64,
    payload: serde_json::Value,
}

impl From<&Event> for SseEventData {
    fn from(event: &Event) -> Self {
        let payload: serde_json::Value =
            serde_json::from_str(&event.payload_json).unwrap_or(serde_json::Value::Null);
        SseEventData {
            seq: event.seq,
            task_id: event.task_id.clone(),
            event_type: event.event_type.clone(),
            timestamp: event.timestamp.timestamp_millis(),
            payload,
        }
    }
}

fn to_sse(event: &Event) -> SseEvent {
    let data = SseEventData::from(event);
    let json = serde_json::to_string(&data).unwrap_or_default();
    SseEvent::default()
        .event(&data.event_type)
        .data(json)
        .id(data.seq.to_string())
}

/// Cursor over the ordered event log: replays persisted history, then follows the
/// live broadcast. Falls back to storage whenever it lags behind the broadcast.
struct EventCursor {
    bus: Arc<EventBus>,
    rx: broadcast::Receiver<Event>,
    last_seq: i64,
    task_id: Option<String>,
    backlog: VecDeque<Event>,
    catching_up: bool,
}

impl EventCursor {
    fn wants(&self, event: &Event) -> bool {
        event.seq > self.last_seq
            && self
                .task_id
                .as_deref()
                .map_or(true, |task| event.task_id.as_deref() == Some(task))
    }

    async fn next_event(&mut self) -> Option<Event> {
        loop {
            while let Some(event) = self.backlog.pop_front() {
                if self.wants(&event) {
                    self.last_seq = event.seq;
                    return Some(event);
                }
                // Filtered events still advance the cursor.
                self.last_seq = self.last_seq.max(event.seq);
            }

            if self.catching_up {
                match self.bus.history(self.last_seq, REPLAY_PAGE).await {
                    Ok(page) => {
                        self.catching_up = page.len() as i64 >= REPLAY_PAGE;
                        self.backlog.extend(page);
                    }
                    Err(e) => {
                        error!(error = %e, "failed to read event history");
                        return None;
                    }
                }
                continue;
            }

            match self.rx.recv().await {
                Ok(event) => self.backlog.push_back(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, after = self.last_seq, "event subscriber lagged, resyncing");
                    self.catching_up = true;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// GET /events?after=N - Stream the ordered event log (SSE).
///
/// Replays events with `seq > after` and then follows live events. Each SSE message
/// carries the event's `seq` as its id, so reconnecting clients resume with
/// `Last-Event-ID`.
async fn stream_events(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<StreamEventsQuery>,
) -> ApiResult<Sse<impl Stream<Item = Result<SseEvent, Infallible>>>> {
    check_auth(&state, &headers)?;

    let after = query
        .after
        .or_else(|| {
            headers
                .get("last-event-id")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse().ok())
        })
        .unwrap_or(0);

    let bus = Arc::clone(&state.engine.deps().bus);
    // Subscribe before reading history so nothing published in between is missed.
    let cursor = EventCursor {
        rx: bus.subscribe(),
        bus,
        last_seq: after,
        task_id: query.task_id,
        backlog: VecDeque::new(),
        catching_up: true,
    };

    let stream = stream::unfold(cursor, |mut cursor| async move {
        let event = cursor.next_event().await?;
        Some((Ok::<_, Infallible>(to_sse(&event)), cursor))
    });

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}
