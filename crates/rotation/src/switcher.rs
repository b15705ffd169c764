//! Rotation state machine and round-robin account selection
//!
//! The switcher holds the active account index, the usage/failure
//! counters, and the busy lock. The Session Driver is the single source
//! of truth for which account indices are valid rotation targets; the
//! switcher reads the candidate set at selection time.
//!
//! The busy lock is claimed with one `compare_exchange` — a single atomic
//! test-and-set with no suspension between check and set — and released
//! by an RAII guard on every exit path, including panics.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use driver::{FailureKind, SessionDriver};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

/// Thresholds and the immediate-switch status set, from config.
#[derive(Debug, Clone)]
pub struct SwitcherConfig {
    /// Generative requests per account before a deferred rotation is
    /// scheduled. 0 disables usage-driven rotation.
    pub usage_threshold: u32,
    /// Counted failures before a failure-driven rotation fires.
    /// 0 disables failure-driven rotation (immediate statuses still fire).
    pub failure_threshold: u32,
    /// Backend statuses that rotate on the first occurrence.
    pub immediate_switch_statuses: Vec<u16>,
}

/// Outcome of a rotation attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SwitchOutcome {
    /// The active account changed (or was re-activated) successfully.
    Switched { new_index: usize },
    /// Another rotation holds the busy lock; no state was mutated.
    InProgress,
    /// The rotation ran and failed (no candidates, or activation error).
    Failed { reason: String },
}

/// RAII claim on the busy lock. Dropping it clears the lock and wakes
/// every task waiting for the rotation to finish.
pub struct BusyGuard<'a> {
    switcher: &'a Switcher,
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.switcher.busy.store(false, Ordering::Release);
        self.switcher.rotation_done.notify_waiters();
    }
}

/// Process-wide rotation state. Single instance, process lifetime.
pub struct Switcher {
    driver: std::sync::Arc<dyn SessionDriver>,
    config: SwitcherConfig,
    current: AtomicI64,
    failure_count: AtomicU32,
    usage_count: AtomicU32,
    busy: AtomicBool,
    rotation_done: Notify,
    last_switch_at: Mutex<Option<Instant>>,
}

enum Target {
    Next,
    Specific(usize),
}

impl Switcher {
    /// Create a switcher with no active account (index -1).
    pub fn new(driver: std::sync::Arc<dyn SessionDriver>, config: SwitcherConfig) -> Self {
        Self {
            driver,
            config,
            current: AtomicI64::new(-1),
            failure_count: AtomicU32::new(0),
            usage_count: AtomicU32::new(0),
            busy: AtomicBool::new(false),
            rotation_done: Notify::new(),
            last_switch_at: Mutex::new(None),
        }
    }

    /// The active account index; -1 means none is active.
    pub fn current_index(&self) -> i64 {
        self.current.load(Ordering::Acquire)
    }

    /// Whether a rotation or recovery currently holds the busy lock.
    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    pub fn failure_count(&self) -> u32 {
        self.failure_count.load(Ordering::Acquire)
    }

    pub fn usage_count(&self) -> u32 {
        self.usage_count.load(Ordering::Acquire)
    }

    /// Claim the busy lock without rotating. Used by the gateway's
    /// direct-recovery path, which re-activates the current session
    /// itself and only needs the mutual exclusion.
    pub fn try_claim(&self) -> Option<BusyGuard<'_>> {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()?;
        Some(BusyGuard { switcher: self })
    }

    /// Wait until no rotation holds the busy lock, up to `timeout`.
    /// Returns true if the lock is free on return.
    pub async fn wait_until_idle(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            // Subscribe before checking, or a release between the check
            // and the wait is missed.
            let notified = self.rotation_done.notified();
            if !self.is_busy() {
                return true;
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return !self.is_busy();
            }
            if tokio::time::timeout(deadline - now, notified).await.is_err() {
                return !self.is_busy();
            }
        }
    }

    /// Count one generative request against the active account.
    /// Returns the new total.
    pub fn increment_usage(&self) -> u32 {
        self.usage_count.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// True iff the configured positive usage threshold is reached.
    pub fn should_switch_by_usage(&self) -> bool {
        self.config.usage_threshold > 0 && self.usage_count() >= self.config.usage_threshold
    }

    /// Clear the failure counter. Called after any successful generative
    /// response.
    pub fn reset_failures(&self) {
        self.failure_count.store(0, Ordering::Release);
    }

    /// Rotate to the next valid candidate, round-robin from the current
    /// index. A concurrent caller observes the busy lock held and gets
    /// `InProgress` without any state mutation.
    pub async fn switch_to_next(&self) -> SwitchOutcome {
        self.rotate(Target::Next).await
    }

    /// Rotate to an explicit account index. Same guard and flow as
    /// `switch_to_next`.
    pub async fn switch_to_specific(&self, target: usize) -> SwitchOutcome {
        self.rotate(Target::Specific(target)).await
    }

    async fn rotate(&self, target: Target) -> SwitchOutcome {
        let Some(_guard) = self.try_claim() else {
            debug!("rotation already in progress");
            return SwitchOutcome::InProgress;
        };

        let old = self.current_index();
        if old >= 0 {
            // Best effort: the outgoing session's state is worth keeping
            // but never blocks the switch.
            if let Err(e) = self.driver.save_context_state(old as usize).await {
                warn!(index = old, error = %e, "failed to persist outgoing session state");
            }
        }

        let candidates = self.driver.rotation_candidates();
        let next = match target {
            Target::Next => match next_candidate(&candidates, old) {
                Some(i) => i,
                None => {
                    metrics::counter!("gateway_rotations_total", "outcome" => "failed")
                        .increment(1);
                    return SwitchOutcome::Failed {
                        reason: "no available accounts".into(),
                    };
                }
            },
            Target::Specific(i) => {
                if !candidates.contains(&i) {
                    metrics::counter!("gateway_rotations_total", "outcome" => "failed")
                        .increment(1);
                    return SwitchOutcome::Failed {
                        reason: format!("account index {i} is not a valid rotation candidate"),
                    };
                }
                i
            }
        };

        info!(from = old, to = next, "switching active account");
        match self.driver.launch_or_switch_context(next).await {
            Ok(()) => {
                self.current.store(next as i64, Ordering::Release);
                self.failure_count.store(0, Ordering::Release);
                self.usage_count.store(0, Ordering::Release);
                if let Ok(mut at) = self.last_switch_at.lock() {
                    *at = Some(Instant::now());
                }
                metrics::counter!("gateway_rotations_total", "outcome" => "switched").increment(1);
                SwitchOutcome::Switched { new_index: next }
            }
            Err(e) => {
                warn!(index = next, error = %e, "account activation failed");
                metrics::counter!("gateway_rotations_total", "outcome" => "failed").increment(1);
                SwitchOutcome::Failed {
                    reason: e.to_string(),
                }
            }
        }
    }

    /// Record a terminal request failure and rotate if warranted.
    ///
    /// Transport faults and user cancellations are excluded from failure
    /// statistics and never rotate. Counted failures rotate once the
    /// threshold is crossed, or immediately for statuses in the
    /// immediate-switch set. Safe to call from many failed requests at
    /// once: the busy guard inside `switch_to_next` lets only one
    /// resulting rotation proceed.
    ///
    /// Returns true if a rotation was attempted.
    pub async fn handle_request_failure(&self, kind: &FailureKind) -> bool {
        if !kind.counts_toward_failures() {
            debug!(?kind, "failure excluded from rotation statistics");
            return false;
        }

        let failures = self.failure_count.fetch_add(1, Ordering::AcqRel) + 1;
        let immediate = matches!(
            kind,
            FailureKind::Backend { status } if self.config.immediate_switch_statuses.contains(status)
        );
        let threshold_hit =
            self.config.failure_threshold > 0 && failures >= self.config.failure_threshold;

        if !(immediate || threshold_hit) {
            debug!(failures, "failure recorded, below rotation threshold");
            return false;
        }

        warn!(failures, immediate, "failure limit reached, rotating account");
        match self.switch_to_next().await {
            SwitchOutcome::Switched { new_index } => {
                info!(new_index, "failure-driven rotation complete");
            }
            SwitchOutcome::InProgress => {
                debug!("failure-driven rotation skipped, one already in progress");
            }
            SwitchOutcome::Failed { ref reason } => {
                warn!(%reason, "failure-driven rotation failed");
            }
        }
        true
    }

    /// Rotation state summary for the health endpoint.
    pub fn health(&self) -> serde_json::Value {
        let since_switch = self
            .last_switch_at
            .lock()
            .ok()
            .and_then(|at| at.map(|t| t.elapsed().as_secs()));
        serde_json::json!({
            "current_index": self.current_index(),
            "usage_count": self.usage_count(),
            "failure_count": self.failure_count(),
            "rotation_in_progress": self.is_busy(),
            "candidates": self.driver.rotation_candidates(),
            "seconds_since_last_switch": since_switch,
        })
    }
}

/// Round-robin: the candidate after `current`, wrapping; the first
/// candidate when `current` is absent from the set (or -1).
fn next_candidate(candidates: &[usize], current: i64) -> Option<usize> {
    if candidates.is_empty() {
        return None;
    }
    let pos = if current >= 0 {
        candidates.iter().position(|&c| c as i64 == current)
    } else {
        None
    };
    match pos {
        Some(p) => Some(candidates[(p + 1) % candidates.len()]),
        None => Some(candidates[0]),
    }
}
