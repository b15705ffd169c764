//! Connection registry: channel state, queue demultiplexing, grace period
//!
//! One registry instance owns every per-index channel connection and
//! every per-request message queue. The channel reader task routes
//! inbound frames through `route`; request handlers own the consumer
//! half of their queue.
//!
//! Locking: both maps use `std::sync::Mutex` so cleanup can run from
//! `Drop` impls. No lock is held across an await point.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use driver::{ChannelEvent, ControlEvent};
use thiserror::Error;
use tokio::sync::{Notify, mpsc};
use tracing::{debug, info, warn};

use crate::queue::{Message, MessageQueue};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Registered but waiting for the session to come (back) up.
    Connecting,
    /// Live socket; requests may be dispatched.
    Open,
}

/// One registered channel. The sender feeds the socket's writer task.
#[derive(Clone)]
pub struct Connection {
    pub state: ConnState,
    pub tx: mpsc::UnboundedSender<String>,
}

#[derive(Debug, Error)]
#[error("no open channel for index {index}")]
pub struct SendFailed {
    pub index: usize,
}

#[derive(Debug, Error)]
#[error("a request with id {request_id} is already in flight")]
pub struct QueueExists {
    pub request_id: String,
}

pub struct Registry {
    connections: Mutex<HashMap<usize, Connection>>,
    queues: Mutex<HashMap<String, mpsc::UnboundedSender<Message>>>,
    /// True while an unexpected disconnect is inside its grace window.
    grace: AtomicBool,
    /// True from unexpected disconnect until reconnect or grace expiry.
    reconnecting: AtomicBool,
    /// Bumped on every register and disconnect; a grace timer only acts
    /// if the epoch it captured is still current.
    grace_epoch: AtomicU64,
    /// Woken whenever a connection opens.
    ready: Notify,
    grace_period: Duration,
}

impl Registry {
    pub fn new(grace_period: Duration) -> Self {
        Self {
            connections: Mutex::new(HashMap::new()),
            queues: Mutex::new(HashMap::new()),
            grace: AtomicBool::new(false),
            reconnecting: AtomicBool::new(false),
            grace_epoch: AtomicU64::new(0),
            ready: Notify::new(),
            grace_period,
        }
    }

    /// Register a freshly opened channel for `index`. Replaces any
    /// previous connection on the same index and ends any grace window.
    pub fn register(&self, index: usize, tx: mpsc::UnboundedSender<String>) {
        self.grace_epoch.fetch_add(1, Ordering::AcqRel);
        self.grace.store(false, Ordering::Release);
        self.reconnecting.store(false, Ordering::Release);
        {
            let mut conns = self.connections.lock().unwrap_or_else(|p| p.into_inner());
            let replaced = conns
                .insert(
                    index,
                    Connection {
                        state: ConnState::Open,
                        tx,
                    },
                )
                .is_some();
            if replaced {
                debug!(index, "replaced existing channel connection");
            }
        }
        info!(index, "channel connected");
        self.ready.notify_waiters();
    }

    /// Handle a channel going away. `tx` identifies the socket that
    /// disconnected: if a replacement has already registered on the
    /// same index, the stale socket's disconnect is a no-op.
    ///
    /// A deliberate close (the peer sent a Close frame) removes the
    /// connection outright. An unexpected drop starts the grace window:
    /// new requests hold off on recovery, but queues already in flight
    /// get `ChannelClosed` immediately since a reconnected session
    /// cannot resume a half-finished generation.
    pub fn handle_disconnect(
        self: &std::sync::Arc<Self>,
        index: usize,
        tx: &mpsc::UnboundedSender<String>,
        deliberate: bool,
    ) {
        {
            let conns = self.connections.lock().unwrap_or_else(|p| p.into_inner());
            match conns.get(&index) {
                Some(conn) if conn.tx.same_channel(tx) => {}
                _ => {
                    debug!(index, "ignoring disconnect from a replaced socket");
                    return;
                }
            }
        }
        let epoch = self.grace_epoch.fetch_add(1, Ordering::AcqRel) + 1;

        if deliberate {
            info!(index, "channel closed deliberately");
            let mut conns = self.connections.lock().unwrap_or_else(|p| p.into_inner());
            conns.remove(&index);
            self.fail_all_queues();
            return;
        }

        warn!(index, grace_secs = self.grace_period.as_secs(), "channel dropped unexpectedly");
        {
            let mut conns = self.connections.lock().unwrap_or_else(|p| p.into_inner());
            if let Some(conn) = conns.get_mut(&index) {
                conn.state = ConnState::Connecting;
            }
        }
        self.grace.store(true, Ordering::Release);
        self.reconnecting.store(true, Ordering::Release);
        self.fail_all_queues();

        let registry = std::sync::Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(registry.grace_period).await;
            // A register or another disconnect moved the epoch on: this
            // timer is stale.
            if registry.grace_epoch.load(Ordering::Acquire) != epoch {
                return;
            }
            warn!(index, "grace period expired without reconnect");
            registry.grace.store(false, Ordering::Release);
            registry.reconnecting.store(false, Ordering::Release);
            let mut conns = registry
                .connections
                .lock()
                .unwrap_or_else(|p| p.into_inner());
            if let Some(conn) = conns.get(&index) {
                if conn.state == ConnState::Connecting {
                    conns.remove(&index);
                }
            }
        });
    }

    fn fail_all_queues(&self) {
        let queues: Vec<(String, mpsc::UnboundedSender<Message>)> = {
            let mut map = self.queues.lock().unwrap_or_else(|p| p.into_inner());
            map.drain().collect()
        };
        for (request_id, tx) in queues {
            debug!(%request_id, "failing in-flight request after channel loss");
            let _ = tx.send(Message::ChannelClosed);
        }
    }

    /// Whether an unexpected disconnect is inside its grace window.
    pub fn in_grace(&self) -> bool {
        self.grace.load(Ordering::Acquire)
    }

    pub fn is_reconnecting(&self) -> bool {
        self.reconnecting.load(Ordering::Acquire)
    }

    /// Snapshot of the connection registered for `index`.
    pub fn connection(&self, index: usize) -> Option<Connection> {
        let conns = self.connections.lock().unwrap_or_else(|p| p.into_inner());
        conns.get(&index).cloned()
    }

    pub fn has_open_connection(&self, index: usize) -> bool {
        self.connection(index)
            .is_some_and(|c| c.state == ConnState::Open)
    }

    /// Wait up to `timeout` for an open connection on `index`.
    pub async fn wait_for_connection(&self, index: usize, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.ready.notified();
            if self.has_open_connection(index) {
                return true;
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return false;
            }
            if tokio::time::timeout(deadline - now, notified).await.is_err() {
                return self.has_open_connection(index);
            }
        }
    }

    /// Send a control event to the channel for `index`.
    pub fn send_to(&self, index: usize, event: &ControlEvent) -> Result<(), SendFailed> {
        let text = serde_json::to_string(event).map_err(|e| {
            warn!(index, error = %e, "failed to serialize control event");
            SendFailed { index }
        })?;
        let conns = self.connections.lock().unwrap_or_else(|p| p.into_inner());
        match conns.get(&index) {
            Some(conn) if conn.state == ConnState::Open => {
                conn.tx.send(text).map_err(|_| SendFailed { index })
            }
            _ => Err(SendFailed { index }),
        }
    }

    /// Send a control event to every open channel. Returns how many
    /// channels it was delivered to.
    pub fn broadcast(&self, event: &ControlEvent) -> usize {
        let Ok(text) = serde_json::to_string(event) else {
            return 0;
        };
        let conns = self.connections.lock().unwrap_or_else(|p| p.into_inner());
        conns
            .values()
            .filter(|c| c.state == ConnState::Open)
            .filter(|c| c.tx.send(text.clone()).is_ok())
            .count()
    }

    /// Create the queue for a new request. Fails if the id is already
    /// in flight.
    pub fn create_queue(&self, request_id: &str) -> Result<MessageQueue, QueueExists> {
        let mut queues = self.queues.lock().unwrap_or_else(|p| p.into_inner());
        if queues.contains_key(request_id) {
            return Err(QueueExists {
                request_id: request_id.to_owned(),
            });
        }
        let (tx, rx) = mpsc::unbounded_channel();
        queues.insert(request_id.to_owned(), tx);
        Ok(MessageQueue::new(request_id.to_owned(), rx))
    }

    /// Remove a request's queue. Idempotent.
    pub fn remove_queue(&self, request_id: &str) {
        let mut queues = self.queues.lock().unwrap_or_else(|p| p.into_inner());
        queues.remove(request_id);
    }

    /// Route one inbound channel frame to its request's queue. Frames
    /// for unknown request ids are dropped; late frames after cleanup
    /// are expected.
    pub fn route(&self, event: ChannelEvent) {
        let request_id = event.request_id().to_owned();
        let msg = match event {
            ChannelEvent::Chunk { data, .. } => Message::Chunk { data },
            ChannelEvent::Error {
                status, message, ..
            } => Message::Error { status, message },
            ChannelEvent::Timeout { .. } => Message::Timeout,
            ChannelEvent::StreamEnd { .. } => Message::StreamEnd,
        };
        let tx = {
            let queues = self.queues.lock().unwrap_or_else(|p| p.into_inner());
            queues.get(&request_id).cloned()
        };
        match tx {
            Some(tx) => {
                let _ = tx.send(msg);
            }
            None => debug!(%request_id, "dropping frame for unknown request"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn registry() -> Arc<Registry> {
        Arc::new(Registry::new(Duration::from_secs(15)))
    }

    fn connect(
        reg: &Registry,
        index: usize,
    ) -> (mpsc::UnboundedSender<String>, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        reg.register(index, tx.clone());
        (tx, rx)
    }

    #[tokio::test]
    async fn register_opens_connection() {
        let reg = registry();
        assert!(!reg.has_open_connection(0));
        let (_tx, _rx) = connect(&reg, 0);
        assert!(reg.has_open_connection(0));
        assert!(!reg.in_grace());
    }

    #[tokio::test]
    async fn send_to_delivers_serialized_event() {
        let reg = registry();
        let (_tx, mut rx) = connect(&reg, 0);

        reg.send_to(
            0,
            &ControlEvent::CancelRequest {
                request_id: "req_1".into(),
            },
        )
        .unwrap();

        let frame = rx.recv().await.unwrap();
        let value: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["event_type"], "cancel_request");
        assert_eq!(value["request_id"], "req_1");
    }

    #[tokio::test]
    async fn send_to_unknown_index_fails() {
        let reg = registry();
        let err = reg
            .send_to(
                5,
                &ControlEvent::CancelRequest {
                    request_id: "req_1".into(),
                },
            )
            .unwrap_err();
        assert_eq!(err.index, 5);
    }

    #[tokio::test]
    async fn broadcast_reaches_only_open_connections() {
        let reg = registry();
        let (_tx0, mut rx0) = connect(&reg, 0);
        let (_tx1, mut rx1) = connect(&reg, 1);

        let delivered = reg.broadcast(&ControlEvent::SetLogLevel {
            level: "debug".into(),
        });
        assert_eq!(delivered, 2);
        assert!(rx0.recv().await.unwrap().contains("set_log_level"));
        assert!(rx1.recv().await.unwrap().contains("set_log_level"));
    }

    #[tokio::test]
    async fn duplicate_request_id_rejected() {
        let reg = registry();
        let _q = reg.create_queue("req_dup").unwrap();
        assert!(reg.create_queue("req_dup").is_err());
        reg.remove_queue("req_dup");
        assert!(reg.create_queue("req_dup").is_ok());
    }

    #[tokio::test]
    async fn route_delivers_to_matching_queue_only() {
        let reg = registry();
        let mut qa = reg.create_queue("req_a").unwrap();
        let mut qb = reg.create_queue("req_b").unwrap();

        reg.route(ChannelEvent::Chunk {
            request_id: "req_a".into(),
            data: "hello".into(),
        });
        reg.route(ChannelEvent::StreamEnd {
            request_id: "req_b".into(),
        });

        assert_eq!(
            qa.dequeue(Duration::from_secs(1)).await.unwrap(),
            Message::Chunk {
                data: "hello".into()
            }
        );
        assert_eq!(
            qb.dequeue(Duration::from_secs(1)).await.unwrap(),
            Message::StreamEnd
        );
    }

    #[tokio::test]
    async fn route_drops_unknown_request_id() {
        let reg = registry();
        // No queue exists; must not panic.
        reg.route(ChannelEvent::Chunk {
            request_id: "req_gone".into(),
            data: "late".into(),
        });
    }

    #[tokio::test]
    async fn unexpected_disconnect_enters_grace_and_fails_queues() {
        let reg = registry();
        let (tx, _rx) = connect(&reg, 0);
        let mut q = reg.create_queue("req_x").unwrap();

        reg.handle_disconnect(0, &tx, false);

        assert!(reg.in_grace());
        assert!(reg.is_reconnecting());
        assert!(!reg.has_open_connection(0));
        assert_eq!(
            q.dequeue(Duration::from_secs(1)).await.unwrap(),
            Message::ChannelClosed
        );
    }

    #[tokio::test]
    async fn deliberate_close_removes_connection_without_grace() {
        let reg = registry();
        let (tx, _rx) = connect(&reg, 0);
        reg.handle_disconnect(0, &tx, true);
        assert!(!reg.in_grace());
        assert!(!reg.has_open_connection(0));
    }

    #[tokio::test(start_paused = true)]
    async fn grace_expires_and_clears_flags() {
        let reg = Arc::new(Registry::new(Duration::from_secs(15)));
        let (tx, _rx) = connect(&reg, 0);
        reg.handle_disconnect(0, &tx, false);
        assert!(reg.in_grace());

        tokio::time::sleep(Duration::from_secs(16)).await;
        assert!(!reg.in_grace());
        assert!(!reg.is_reconnecting());
        assert!(!reg.has_open_connection(0));
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_within_grace_cancels_the_timer() {
        let reg = Arc::new(Registry::new(Duration::from_secs(15)));
        let (tx, _rx) = connect(&reg, 0);
        reg.handle_disconnect(0, &tx, false);

        tokio::time::sleep(Duration::from_secs(5)).await;
        let (_tx2, _rx2) = connect(&reg, 0);
        assert!(!reg.in_grace());
        assert!(reg.has_open_connection(0));

        // The stale timer must not tear the new connection down.
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert!(reg.has_open_connection(0));
    }

    #[tokio::test]
    async fn wait_for_connection_wakes_on_register() {
        let reg = registry();
        let waiter = {
            let reg = Arc::clone(&reg);
            tokio::spawn(async move { reg.wait_for_connection(0, Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        let (_tx, _rx) = connect(&reg, 0);
        assert!(waiter.await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn wait_for_connection_times_out() {
        let reg = registry();
        assert!(!reg.wait_for_connection(0, Duration::from_secs(60)).await);
    }

    #[tokio::test]
    async fn stale_disconnect_does_not_down_replacement_connection() {
        let reg = registry();
        let (tx1, _rx1) = connect(&reg, 0);
        let (_tx2, _rx2) = connect(&reg, 0);
        let mut q = reg.create_queue("req_live").unwrap();

        // The first socket's reader exits after the replacement has
        // registered on the same index.
        reg.handle_disconnect(0, &tx1, false);

        assert!(reg.has_open_connection(0));
        assert!(!reg.in_grace());
        assert!(!reg.is_reconnecting());

        // The in-flight queue survives and still receives frames.
        reg.route(ChannelEvent::Chunk {
            request_id: "req_live".into(),
            data: "still here".into(),
        });
        assert_eq!(
            q.dequeue(Duration::from_secs(1)).await.unwrap(),
            Message::Chunk {
                data: "still here".into()
            }
        );
    }

    #[tokio::test]
    async fn stale_deliberate_close_keeps_replacement_registered() {
        let reg = registry();
        let (tx1, _rx1) = connect(&reg, 0);
        let (_tx2, _rx2) = connect(&reg, 0);

        reg.handle_disconnect(0, &tx1, true);
        assert!(reg.has_open_connection(0));
    }

    #[tokio::test]
    async fn connection_snapshot_reports_state() {
        let reg = registry();
        assert!(reg.connection(0).is_none());

        let (tx, _rx) = connect(&reg, 0);
        let conn = reg.connection(0).unwrap();
        assert_eq!(conn.state, ConnState::Open);

        reg.handle_disconnect(0, &tx, false);
        let conn = reg.connection(0).unwrap();
        assert_eq!(conn.state, ConnState::Connecting);
    }
}
