//! Streaming delivery
//!
//! Two modes behind the same SSE surface. Verbatim relays chunks as the
//! backend produces them. Pseudo collects the whole response while
//! emitting jittered keepalive pings, then replays it as a short
//! synthetic stream (thought segment first, then content).
//!
//! Each response is produced by a worker task pushing SSE events into an
//! unbounded mailbox; the HTTP body just drains the mailbox. A send
//! failure means the client is gone: the worker cancels upstream once
//! and keeps draining the queue so late frames are consumed, not leaked.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use driver::{ControlEvent, Dialect, TranslateState};
use rand::Rng;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::dialect::{ResponseFormat, formatter};
use crate::error::GatewayError;
use crate::handler::{
    AppState, ProxyRequest, RequestGuard, dispatch_with_retry, drain_remaining, finalize,
    parse_native_body,
};
use crate::queue::{Message, MessageQueue};
use crate::registry::Registry;

/// Keepalive spacing for pseudo-streaming, jittered per response.
const PING_MIN_MS: u64 = 12_000;
const PING_MAX_MS: u64 = 18_000;

pub fn verbatim(
    state: AppState,
    dialect: Dialect,
    req: ProxyRequest,
    queue: MessageQueue,
    conn_index: usize,
    deferred: bool,
    started: Instant,
) -> Response {
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(run_verbatim(
        state, dialect, req, queue, conn_index, deferred, started, tx,
    ));
    sse_response(rx)
}

pub fn pseudo(
    state: AppState,
    dialect: Dialect,
    req: ProxyRequest,
    queue: MessageQueue,
    conn_index: usize,
    deferred: bool,
    started: Instant,
) -> Response {
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(run_pseudo(
        state, dialect, req, queue, conn_index, deferred, started, tx,
    ));
    sse_response(rx)
}

fn sse_response(rx: mpsc::UnboundedReceiver<Event>) -> Response {
    let stream = futures_util::stream::unfold(rx, |mut rx| async move {
        rx.recv()
            .await
            .map(|event| (Ok::<_, Infallible>(event), rx))
    });
    Sse::new(stream).into_response()
}

/// Client-side half of a streaming response. Tracks whether the client
/// is still listening; the first send failure triggers one upstream
/// cancel.
struct EventSink {
    tx: mpsc::UnboundedSender<Event>,
    registry: Arc<Registry>,
    conn_index: usize,
    request_id: String,
    cancelled: bool,
}

impl EventSink {
    fn new(
        tx: mpsc::UnboundedSender<Event>,
        registry: Arc<Registry>,
        conn_index: usize,
        request_id: String,
    ) -> Self {
        Self {
            tx,
            registry,
            conn_index,
            request_id,
            cancelled: false,
        }
    }

    fn send(&mut self, event: Event) {
        if self.cancelled {
            return;
        }
        if self.tx.send(event).is_err() {
            debug!(request_id = %self.request_id, "client disconnected mid-stream");
            self.cancelled = true;
            let _ = self.registry.send_to(
                self.conn_index,
                &ControlEvent::CancelRequest {
                    request_id: self.request_id.clone(),
                },
            );
        }
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_verbatim(
    state: AppState,
    dialect: Dialect,
    req: ProxyRequest,
    mut queue: MessageQueue,
    conn_index: usize,
    deferred: bool,
    started: Instant,
    tx: mpsc::UnboundedSender<Event>,
) {
    let fmt = formatter(dialect);
    let request_id = req.request_id.clone();
    let mut guard = RequestGuard::new(
        Arc::clone(&state.registry),
        Arc::clone(&state.metrics),
        conn_index,
        request_id.clone(),
    );
    let mut sink = EventSink::new(tx, Arc::clone(&state.registry), conn_index, request_id.clone());
    let mut translate = TranslateState::default();

    let outcome = relay_chunks(&state, dialect, &req, &mut queue, conn_index, &mut sink, &mut translate).await;

    settle(
        &state, dialect, fmt, &mut guard, &mut sink, &request_id, outcome, started, deferred,
    )
    .await;
}

/// The verbatim relay loop: first message through retry, then chunks
/// until the end sentinel. A quiet window after output has flowed is a
/// benign end.
async fn relay_chunks(
    state: &AppState,
    dialect: Dialect,
    req: &ProxyRequest,
    queue: &mut MessageQueue,
    conn_index: usize,
    sink: &mut EventSink,
    translate: &mut TranslateState,
) -> Result<(), GatewayError> {
    let first = dispatch_with_retry(state, conn_index, req, queue).await?;
    let Some(first) = first else {
        return Ok(());
    };
    forward_chunk(state, dialect, sink, translate, &first);

    loop {
        if sink.is_cancelled() {
            return Err(GatewayError::Cancelled);
        }
        match queue.dequeue(state.config.timeouts.stream_chunk()).await {
            Ok(Message::Chunk { data }) => forward_chunk(state, dialect, sink, translate, &data),
            Ok(Message::StreamEnd) => return Ok(()),
            Ok(Message::Error { status, message }) => {
                return Err(GatewayError::Backend { status, message });
            }
            Ok(Message::Timeout) => return Err(GatewayError::Timeout),
            Ok(Message::ChannelClosed) => return Err(GatewayError::Transport),
            Err(_) => {
                if translate.chunks_seen > 0 {
                    debug!(request_id = queue.request_id(), "stream went quiet, closing");
                    return Ok(());
                }
                return Err(GatewayError::Timeout);
            }
        }
    }
}

fn forward_chunk(
    state: &AppState,
    dialect: Dialect,
    sink: &mut EventSink,
    translate: &mut TranslateState,
    chunk: &str,
) {
    match state.translator.chunk_from_native(dialect, translate, chunk) {
        Ok(frames) => {
            let fmt = formatter(dialect);
            for frame in frames {
                sink.send(fmt.data_event(&frame));
            }
        }
        Err(e) => warn!(error = %e, "dropping untranslatable chunk"),
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_pseudo(
    state: AppState,
    dialect: Dialect,
    req: ProxyRequest,
    mut queue: MessageQueue,
    conn_index: usize,
    deferred: bool,
    started: Instant,
    tx: mpsc::UnboundedSender<Event>,
) {
    let fmt = formatter(dialect);
    let request_id = req.request_id.clone();
    let mut guard = RequestGuard::new(
        Arc::clone(&state.registry),
        Arc::clone(&state.metrics),
        conn_index,
        request_id.clone(),
    );
    let mut sink = EventSink::new(tx, Arc::clone(&state.registry), conn_index, request_id.clone());

    let ping_ms = rand::rng().random_range(PING_MIN_MS..=PING_MAX_MS);
    let mut ticker = tokio::time::interval(Duration::from_millis(ping_ms));
    ticker.tick().await;

    let collect = async {
        let first = dispatch_with_retry(&state, conn_index, &req, &mut queue).await?;
        drain_remaining(&state, &mut queue, first).await
    };
    tokio::pin!(collect);

    let collected = loop {
        tokio::select! {
            result = &mut collect => break result,
            _ = ticker.tick() => sink.send(fmt.ping_event()),
        }
    };

    let outcome = collected.and_then(|text| {
        let native = parse_native_body(&text);
        let segments = state
            .translator
            .pseudo_stream_segments(dialect, &native)
            .map_err(|e| GatewayError::Backend {
                status: 502,
                message: e.to_string(),
            })?;
        for segment in segments {
            sink.send(fmt.data_event(&segment));
        }
        Ok(())
    });

    settle(
        &state, dialect, fmt, &mut guard, &mut sink, &request_id, outcome, started, deferred,
    )
    .await;
}

/// Shared stream epilogue: terminal frames, cleanup, accounting.
#[allow(clippy::too_many_arguments)]
async fn settle(
    state: &AppState,
    dialect: Dialect,
    fmt: &'static dyn ResponseFormat,
    guard: &mut RequestGuard,
    sink: &mut EventSink,
    request_id: &str,
    outcome: Result<(), GatewayError>,
    started: Instant,
    deferred: bool,
) {
    let outcome = if sink.is_cancelled() {
        Err(GatewayError::Cancelled)
    } else {
        outcome
    };

    match outcome {
        Ok(()) => {
            for event in fmt.terminal_events() {
                sink.send(event);
            }
            guard.finish();
            finalize(state, dialect, 200, started, None, deferred).await;
        }
        Err(err) => {
            sink.send(fmt.error_event(err.status().as_u16(), &err.public_message(), request_id));
            for event in fmt.terminal_events() {
                sink.send(event);
            }
            // Guard left unfinished: its drop cancels upstream and
            // removes the queue.
            finalize(state, dialect, err.status().as_u16(), started, Some(&err), deferred).await;
        }
    }
}
