//! Request orchestration
//!
//! Every generative request follows the same spine: make sure a session
//! channel is usable (waiting out grace windows and rotations, or
//! running recovery), count usage, translate the body, create the
//! request's queue, then dispatch with retry. Buffered completion lives
//! here; the two streaming modes live in `stream`.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Instant;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Json, Response};
use driver::{ControlEvent, Dialect, FormatTranslator, SessionDriver};
use metrics_exporter_prometheus::PrometheusHandle;
use rotation::{SwitchOutcome, Switcher};
use serde_json::{Value, json};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::config::{Config, DeliveryMode};
use crate::dialect::formatter;
use crate::error::GatewayError;
use crate::metrics::ServiceMetrics;
use crate::queue::{Message, MessageQueue};
use crate::registry::Registry;
use crate::stream;

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<Registry>,
    pub switcher: Arc<Switcher>,
    pub driver: Arc<dyn SessionDriver>,
    pub translator: Arc<dyn FormatTranslator>,
    pub config: Arc<Config>,
    pub metrics: Arc<ServiceMetrics>,
    pub prometheus: PrometheusHandle,
}

/// One normalized request, ready to serialize onto the channel.
#[derive(Debug, Clone)]
pub struct ProxyRequest {
    pub request_id: String,
    pub method: String,
    pub path: String,
    pub headers: Value,
    pub query: Option<String>,
    pub body: Value,
    pub is_generative: bool,
    pub streaming: bool,
}

impl ProxyRequest {
    pub fn control_event(&self) -> ControlEvent {
        ControlEvent::ProxyRequest {
            request_id: self.request_id.clone(),
            method: self.method.clone(),
            path: self.path.clone(),
            headers: self.headers.clone(),
            query: self.query.clone(),
            body: self.body.clone(),
            is_generative: self.is_generative,
            streaming: self.streaming,
        }
    }
}

fn new_request_id() -> String {
    format!("req_{}", Uuid::new_v4().simple())
}

/// Headers the automation peer has no use for; everything else is
/// forwarded in the envelope.
const STRIPPED_HEADERS: [&str; 3] = ["host", "content-length", "connection"];

fn header_map_json(headers: &HeaderMap) -> Value {
    let mut map = serde_json::Map::new();
    for (name, value) in headers {
        if STRIPPED_HEADERS.contains(&name.as_str()) {
            continue;
        }
        if let Ok(v) = value.to_str() {
            map.insert(name.as_str().to_owned(), Value::String(v.to_owned()));
        }
    }
    Value::Object(map)
}

/// Generative endpoints count toward usage rotation; management
/// endpoints never do.
fn is_generative_path(path: &str) -> bool {
    matches!(
        path,
        "/api/generate" | "/v1/chat/completions" | "/v1/messages"
    )
}

fn accepts_event_stream(headers: &HeaderMap) -> bool {
    headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.contains("text/event-stream"))
}

fn body_stream_flag(body: &Value) -> bool {
    body.get("stream").and_then(Value::as_bool).unwrap_or(false)
}

pub async fn native_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    let streaming = accepts_event_stream(&headers);
    dispatch(state, Dialect::Native, "/api/generate", headers, body, streaming).await
}

pub async fn native_stream_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    dispatch(state, Dialect::Native, "/api/generate", headers, body, true).await
}

pub async fn openai_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    let streaming = body_stream_flag(&body);
    dispatch(state, Dialect::OpenAi, "/v1/chat/completions", headers, body, streaming).await
}

pub async fn claude_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    let streaming = body_stream_flag(&body);
    dispatch(state, Dialect::Claude, "/v1/messages", headers, body, streaming).await
}

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Broadcast a verbosity change to every connected session.
pub async fn log_level_handler(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> Response {
    let Some(level) = body.get("level").and_then(Value::as_str) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "missing level field"})),
        )
            .into_response();
    };
    if !LOG_LEVELS.contains(&level) {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": format!("unknown level {level:?}")})),
        )
            .into_response();
    }
    let delivered = state.registry.broadcast(&ControlEvent::SetLogLevel {
        level: level.to_owned(),
    });
    info!(level, delivered, "log level broadcast");
    Json(json!({"status": "ok", "delivered": delivered})).into_response()
}

/// Entry point shared by every generative route.
#[instrument(skip(state, headers, body), fields(dialect = dialect.label()))]
pub async fn dispatch(
    state: AppState,
    dialect: Dialect,
    path: &'static str,
    headers: HeaderMap,
    body: Value,
    streaming: bool,
) -> Response {
    let request_id = new_request_id();
    let started = Instant::now();
    state.metrics.requests_total.fetch_add(1, Ordering::Relaxed);
    state.metrics.in_flight.fetch_add(1, Ordering::Relaxed);
    debug!(%request_id, streaming, "request accepted");

    match prepare(&state, dialect, path, &headers, &body, streaming, &request_id).await {
        Ok((req, queue, conn_index, deferred)) => {
            if streaming {
                match state.config.delivery.mode {
                    DeliveryMode::Verbatim => {
                        stream::verbatim(state, dialect, req, queue, conn_index, deferred, started)
                    }
                    DeliveryMode::Buffered => {
                        stream::pseudo(state, dialect, req, queue, conn_index, deferred, started)
                    }
                }
            } else {
                run_buffered(state, dialect, req, queue, conn_index, deferred, started).await
            }
        }
        Err(err) => {
            // No RequestGuard exists yet on this path.
            state.metrics.in_flight.fetch_sub(1, Ordering::Relaxed);
            finalize(&state, dialect, err.status().as_u16(), started, Some(&err), false).await;
            error_response(dialect, &err, &request_id)
        }
    }
}

/// Readiness, usage accounting, translation, and queue creation.
async fn prepare(
    state: &AppState,
    dialect: Dialect,
    path: &'static str,
    headers: &HeaderMap,
    body: &Value,
    streaming: bool,
    request_id: &str,
) -> Result<(ProxyRequest, MessageQueue, usize, bool), GatewayError> {
    let conn_index = ensure_ready(state).await?;

    let native_body = state
        .translator
        .request_to_native(dialect, body)
        .map_err(|e| GatewayError::BadRequest(e.to_string()))?;

    let req = ProxyRequest {
        request_id: request_id.to_owned(),
        method: "POST".into(),
        path: path.into(),
        headers: header_map_json(headers),
        query: None,
        body: native_body,
        is_generative: is_generative_path(path),
        streaming,
    };

    let deferred = if req.is_generative {
        let usage = state.switcher.increment_usage();
        let deferred = state.switcher.should_switch_by_usage();
        if deferred {
            debug!(usage, "usage threshold reached, rotation deferred until completion");
        }
        deferred
    } else {
        false
    };

    let queue = state
        .registry
        .create_queue(request_id)
        .map_err(|e| GatewayError::BadRequest(e.to_string()))?;

    Ok((req, queue, conn_index, deferred))
}

/// Gate every request on a usable session channel.
///
/// Order matters: an open channel wins immediately; a grace window or
/// reconnect gets a bounded wait; a rotation in progress gets a bounded
/// wait; only then does recovery run.
async fn ensure_ready(state: &AppState) -> Result<usize, GatewayError> {
    let timeouts = &state.config.timeouts;
    let current = state.switcher.current_index();
    if current >= 0 && state.registry.has_open_connection(current as usize) {
        return Ok(current as usize);
    }

    if current >= 0 && (state.registry.in_grace() || state.registry.is_reconnecting()) {
        debug!(index = current, "channel reconnecting, holding request");
        if state
            .registry
            .wait_for_connection(current as usize, timeouts.reconnect_wait())
            .await
        {
            return Ok(current as usize);
        }
    }

    if state.switcher.is_busy() {
        debug!("rotation in progress, holding request");
        state.switcher.wait_until_idle(timeouts.busy_wait()).await;
        let current = state.switcher.current_index();
        if current >= 0 && state.registry.has_open_connection(current as usize) {
            return Ok(current as usize);
        }
    }

    recover(state).await
}

/// Last resort: re-activate the current session, or rotate to another
/// account.
async fn recover(state: &AppState) -> Result<usize, GatewayError> {
    let current = state.switcher.current_index();
    if current >= 0 {
        match direct_recovery(state, current as usize).await {
            Ok(index) => return Ok(index),
            Err(err) => {
                if state.driver.rotation_candidates().len() <= 1 {
                    return Err(err);
                }
                warn!(index = current, "direct recovery failed, rotating instead");
            }
        }
    }
    rotate_recovery(state).await
}

/// Re-activate the session the gateway believes is current.
async fn direct_recovery(state: &AppState, index: usize) -> Result<usize, GatewayError> {
    let Some(_guard) = state.switcher.try_claim() else {
        // Someone else is already recovering; wait for them.
        state
            .switcher
            .wait_until_idle(state.config.timeouts.busy_wait())
            .await;
        let current = state.switcher.current_index();
        if current >= 0 && state.registry.has_open_connection(current as usize) {
            return Ok(current as usize);
        }
        return Err(GatewayError::RecoveryExhausted(
            "concurrent recovery did not produce a usable session".into(),
        ));
    };

    info!(index, "re-activating current session");
    state
        .driver
        .launch_or_switch_context(index)
        .await
        .map_err(|e| GatewayError::RecoveryExhausted(e.to_string()))?;
    if state
        .registry
        .wait_for_connection(index, state.config.timeouts.activation_wait())
        .await
    {
        Ok(index)
    } else {
        Err(GatewayError::RecoveryExhausted(format!(
            "session {index} activated but its channel never opened"
        )))
    }
}

/// Rotate to the next account and wait for its channel.
async fn rotate_recovery(state: &AppState) -> Result<usize, GatewayError> {
    match state.switcher.switch_to_next().await {
        SwitchOutcome::Switched { new_index } => {
            if state
                .registry
                .wait_for_connection(new_index, state.config.timeouts.activation_wait())
                .await
            {
                Ok(new_index)
            } else {
                Err(GatewayError::RecoveryExhausted(format!(
                    "account {new_index} activated but its channel never opened"
                )))
            }
        }
        SwitchOutcome::InProgress => {
            state
                .switcher
                .wait_until_idle(state.config.timeouts.busy_wait())
                .await;
            let current = state.switcher.current_index();
            if current >= 0 && state.registry.has_open_connection(current as usize) {
                Ok(current as usize)
            } else {
                Err(GatewayError::RecoveryExhausted(
                    "concurrent rotation did not produce a usable session".into(),
                ))
            }
        }
        SwitchOutcome::Failed { reason } => Err(GatewayError::RecoveryExhausted(reason)),
    }
}

/// Cleanup that must run however the request ends, including the
/// handler future being dropped by a departing client. An unfinished
/// drop means the client went away or the handler bailed early: tell
/// the session to stop generating, then release the queue. The
/// in-flight gauge is released from `drop` on every path.
pub(crate) struct RequestGuard {
    registry: Arc<Registry>,
    metrics: Arc<ServiceMetrics>,
    conn_index: usize,
    request_id: String,
    finished: bool,
}

impl RequestGuard {
    pub(crate) fn new(
        registry: Arc<Registry>,
        metrics: Arc<ServiceMetrics>,
        conn_index: usize,
        request_id: String,
    ) -> Self {
        Self {
            registry,
            metrics,
            conn_index,
            request_id,
            finished: false,
        }
    }

    pub(crate) fn finish(&mut self) {
        self.finished = true;
        self.registry.remove_queue(&self.request_id);
    }
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        self.metrics.in_flight.fetch_sub(1, Ordering::Relaxed);
        if self.finished {
            return;
        }
        debug!(request_id = %self.request_id, "request abandoned, cancelling upstream");
        let _ = self.registry.send_to(
            self.conn_index,
            &ControlEvent::CancelRequest {
                request_id: self.request_id.clone(),
            },
        );
        self.registry.remove_queue(&self.request_id);
    }
}

/// Send the request and wait for its first message, retrying on
/// retryable failures with a fixed delay. On success returns the first
/// chunk, or None when the response ended with no output.
pub(crate) async fn dispatch_with_retry(
    state: &AppState,
    conn_index: usize,
    req: &ProxyRequest,
    queue: &mut MessageQueue,
) -> Result<Option<String>, GatewayError> {
    let retry = &state.config.retry;
    let mut retained = GatewayError::Timeout;

    for attempt in 1..=retry.max_retries {
        if attempt > 1 {
            tokio::time::sleep(retry.delay()).await;
            debug!(request_id = %req.request_id, attempt, "retrying dispatch");
        }
        if state.registry.send_to(conn_index, &req.control_event()).is_err() {
            return Err(GatewayError::Transport);
        }

        match queue.dequeue(state.config.timeouts.first_response()).await {
            Ok(Message::Chunk { data }) => return Ok(Some(data)),
            Ok(Message::StreamEnd) => return Ok(None),
            Ok(Message::Error { status, message }) => {
                if state.config.pool.immediate_switch_statuses.contains(&status) {
                    // Retrying the same account cannot help these.
                    return Err(GatewayError::Backend { status, message });
                }
                warn!(request_id = %req.request_id, attempt, status, "backend error, will retry");
                retained = GatewayError::Backend { status, message };
            }
            Ok(Message::Timeout) => {
                warn!(request_id = %req.request_id, attempt, "backend reported timeout");
                retained = GatewayError::Timeout;
            }
            Ok(Message::ChannelClosed) => return Err(GatewayError::Transport),
            Err(_) => {
                warn!(request_id = %req.request_id, attempt, "no first response in time");
                retained = GatewayError::Timeout;
            }
        }
    }
    Err(retained)
}

/// Collect the rest of a response after its first message. A quiet
/// stream-chunk window after at least one chunk is treated as a benign
/// end: some sessions drop the end sentinel.
pub(crate) async fn drain_remaining(
    state: &AppState,
    queue: &mut MessageQueue,
    first_chunk: Option<String>,
) -> Result<String, GatewayError> {
    let mut collected = first_chunk.unwrap_or_default();
    if collected.is_empty() {
        return Ok(collected);
    }
    loop {
        match queue.dequeue(state.config.timeouts.stream_chunk()).await {
            Ok(Message::Chunk { data }) => collected.push_str(&data),
            Ok(Message::StreamEnd) => return Ok(collected),
            Ok(Message::Error { status, message }) => {
                return Err(GatewayError::Backend { status, message });
            }
            Ok(Message::Timeout) => return Err(GatewayError::Timeout),
            Ok(Message::ChannelClosed) => return Err(GatewayError::Transport),
            Err(_) => {
                debug!(request_id = queue.request_id(), "stream went quiet, treating as complete");
                return Ok(collected);
            }
        }
    }
}

async fn run_buffered(
    state: AppState,
    dialect: Dialect,
    req: ProxyRequest,
    mut queue: MessageQueue,
    conn_index: usize,
    deferred: bool,
    started: Instant,
) -> Response {
    let request_id = req.request_id.clone();
    let mut guard = RequestGuard::new(
        Arc::clone(&state.registry),
        Arc::clone(&state.metrics),
        conn_index,
        request_id.clone(),
    );

    let result = async {
        let first = dispatch_with_retry(&state, conn_index, &req, &mut queue).await?;
        drain_remaining(&state, &mut queue, first).await
    }
    .await;

    match result {
        Ok(text) => {
            guard.finish();
            let native = parse_native_body(&text);
            match state.translator.response_from_native(dialect, &native) {
                Ok(body) => {
                    finalize(&state, dialect, 200, started, None, deferred).await;
                    Json(body).into_response()
                }
                Err(e) => {
                    let err = GatewayError::Backend {
                        status: 502,
                        message: e.to_string(),
                    };
                    finalize(&state, dialect, 502, started, Some(&err), deferred).await;
                    error_response(dialect, &err, &request_id)
                }
            }
        }
        Err(err) => {
            finalize(&state, dialect, err.status().as_u16(), started, Some(&err), deferred).await;
            error_response(dialect, &err, &request_id)
        }
    }
}

/// A collected response that is valid JSON passes through; anything
/// else is wrapped as plain content.
pub(crate) fn parse_native_body(text: &str) -> Value {
    serde_json::from_str(text).unwrap_or_else(|_| json!({"content": text}))
}

/// Accounting shared by every completion path. The in-flight gauge is
/// not touched here: `RequestGuard` releases it so that a dropped
/// handler future still balances the count.
pub(crate) async fn finalize(
    state: &AppState,
    dialect: Dialect,
    status: u16,
    started: Instant,
    err: Option<&GatewayError>,
    deferred: bool,
) {
    if matches!(err, Some(GatewayError::Cancelled)) {
        // A client that walked away says nothing about account health.
        crate::metrics::record_request(status, dialect.label(), started.elapsed().as_secs_f64());
        return;
    }

    crate::metrics::record_request(status, dialect.label(), started.elapsed().as_secs_f64());
    match err {
        None => state.switcher.reset_failures(),
        Some(err) => {
            state.metrics.errors_total.fetch_add(1, Ordering::Relaxed);
            if matches!(err, GatewayError::Transport) {
                crate::metrics::record_transport_fault();
            }
            state.switcher.handle_request_failure(&err.failure_kind()).await;
        }
    }

    if deferred && err.is_none() {
        spawn_deferred_switch(state.clone());
    }
}

/// Usage-driven rotation runs after the response is already on the
/// wire; its outcome is logged, never surfaced to any client.
fn spawn_deferred_switch(state: AppState) {
    tokio::spawn(async move {
        match state.switcher.switch_to_next().await {
            SwitchOutcome::Switched { new_index } => {
                info!(new_index, "usage-driven rotation complete");
            }
            SwitchOutcome::InProgress => {
                debug!("usage-driven rotation skipped, one already in progress");
            }
            SwitchOutcome::Failed { reason } => {
                warn!(%reason, "usage-driven rotation failed");
            }
        }
    });
}

pub(crate) fn error_response(dialect: Dialect, err: &GatewayError, request_id: &str) -> Response {
    let status = err.status();
    let body = formatter(dialect).error_body(status.as_u16(), &err.public_message(), request_id);
    (status, Json(body)).into_response()
}
