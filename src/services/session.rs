//! Per-attempt session state and the timers it owns.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

use crate::payments::types::ResultKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    Disabled,
    Armed,
    Processed,
}

/// State of the current payment attempt.
///
/// Reset on every `arm()`; nothing in here survives into the next attempt
/// except the generation counter.
#[derive(Debug, Clone)]
pub struct SessionState {
    pub phase: SessionPhase,
    pub attempt_id: Option<Uuid>,
    /// Bumped on every arm so timers of an old attempt can recognise themselves.
    pub generation: u64,
    pub started_at: Option<Instant>,
    /// Wall-clock arm time, compared against slot write stamps.
    pub armed_at: Option<DateTime<Utc>>,
    pub max_wait: Duration,
    pub processed: bool,
    pub last_accepted_key: Option<ResultKey>,
}

impl SessionState {
    pub fn disabled() -> Self {
        Self {
            phase: SessionPhase::Disabled,
            attempt_id: None,
            generation: 0,
            started_at: None,
            armed_at: None,
            max_wait: Duration::ZERO,
            processed: false,
            last_accepted_key: None,
        }
    }

    pub fn armed(&self) -> bool {
        self.phase == SessionPhase::Armed
    }

    pub fn begin(
        &mut self,
        max_wait: Duration,
        now: Instant,
        armed_at: DateTime<Utc>,
    ) -> (Uuid, u64) {
        let attempt_id = Uuid::new_v4();
        self.generation += 1;
        self.phase = SessionPhase::Armed;
        self.attempt_id = Some(attempt_id);
        self.started_at = Some(now);
        self.armed_at = Some(armed_at);
        self.max_wait = max_wait;
        self.processed = false;
        self.last_accepted_key = None;
        (attempt_id, self.generation)
    }

    /// `None` while disabled, and for a max wait too large to represent.
    pub fn deadline(&self) -> Option<Instant> {
        self.started_at.and_then(|started| started.checked_add(self.max_wait))
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        self.deadline().is_some_and(|deadline| now > deadline)
    }

    /// True for deliveries that arrived before this attempt was armed.
    pub fn received_before_start(&self, received_at: Instant) -> bool {
        self.started_at.is_some_and(|started| received_at < started)
    }

    /// True for slot values written before this attempt was armed.
    pub fn written_before_start(&self, written_at: DateTime<Utc>) -> bool {
        self.armed_at.is_some_and(|armed_at| written_at < armed_at)
    }

    pub fn mark_processed(&mut self, key: ResultKey) {
        self.processed = true;
        self.last_accepted_key = Some(key);
        self.phase = SessionPhase::Processed;
    }

    pub fn end(&mut self) {
        self.phase = SessionPhase::Disabled;
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            phase: self.phase,
            attempt_id: self.attempt_id,
            processed: self.processed,
            max_wait_ms: u64::try_from(self.max_wait.as_millis()).unwrap_or(u64::MAX),
        }
    }
}

impl Default for SessionState {
    fn default() -> Self {
        Self::disabled()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub phase: SessionPhase,
    pub attempt_id: Option<Uuid>,
    pub processed: bool,
    pub max_wait_ms: u64,
}

/// Background tasks (poller, soft timeout) that live exactly as long as one
/// armed attempt.
pub struct SessionTimers {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl SessionTimers {
    pub fn new() -> (Self, watch::Receiver<bool>) {
        let (shutdown, shutdown_rx) = watch::channel(false);
        (
            Self {
                shutdown,
                tasks: Vec::new(),
            },
            shutdown_rx,
        )
    }

    pub fn track(&mut self, task: JoinHandle<()>) {
        self.tasks.push(task);
    }

    pub fn cancel(self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            task.abort();
        }
    }
}
