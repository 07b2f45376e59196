//! Query engine interface and the blocking poll loop over it.
//!
//! Statements are submitted asynchronously and identified by an
//! [`ExecutionId`]. [`await_terminal`] polls the status at a fixed interval
//! until the execution reaches `SUCCEEDED`, `FAILED` or `CANCELLED`, the poll
//! cap is hit, or the caller cancels.

pub mod local;
pub mod sql;

pub use local::LocalQueryEngine;

use polars::prelude::DataFrame;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionState {
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl ExecutionState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ExecutionState::Succeeded | ExecutionState::Failed | ExecutionState::Cancelled
        )
    }
}

impl fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExecutionState::Queued => "QUEUED",
            ExecutionState::Running => "RUNNING",
            ExecutionState::Succeeded => "SUCCEEDED",
            ExecutionState::Failed => "FAILED",
            ExecutionState::Cancelled => "CANCELLED",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionStatus {
    pub state: ExecutionState,
    pub state_change_reason: Option<String>,
}

impl ExecutionStatus {
    pub fn new(state: ExecutionState) -> Self {
        Self {
            state,
            state_change_reason: None,
        }
    }

    pub fn with_reason(state: ExecutionState, reason: impl Into<String>) -> Self {
        Self {
            state,
            state_change_reason: Some(reason.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ExecutionId(pub String);

impl fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A statement plus the context the engine runs it in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryRequest {
    pub sql: String,
    pub database: String,
    pub output_location: String,
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("unknown execution id {0}")]
    UnknownExecution(ExecutionId),

    #[error("execution {id} has no results (state {state})")]
    NoResults { id: ExecutionId, state: ExecutionState },

    #[error("engine unavailable: {0}")]
    Unavailable(String),

    #[error("engine I/O: {0}")]
    Io(#[from] std::io::Error),
}

/// SQL engine that executes statements asynchronously.
pub trait QueryEngine: Send + Sync {
    fn start_query(&self, request: &QueryRequest) -> Result<ExecutionId, EngineError>;

    fn get_status(&self, id: &ExecutionId) -> Result<ExecutionStatus, EngineError>;

    /// Result set of a succeeded execution.
    fn get_results(&self, id: &ExecutionId) -> Result<DataFrame, EngineError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollConfig {
    pub interval: Duration,
    pub max_polls: u32,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            max_polls: 30,
        }
    }
}

/// A terminal-success poll result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollOutcome {
    pub status: ExecutionStatus,
    pub polls: u32,
}

#[derive(Debug, Error)]
pub enum PollError {
    #[error("execution {id} failed after {polls} poll(s): {reason}")]
    Failed {
        id: ExecutionId,
        reason: String,
        polls: u32,
    },

    #[error("execution {id} was cancelled by the engine after {polls} poll(s)")]
    EngineCancelled { id: ExecutionId, polls: u32 },

    #[error("execution {id} still not terminal after {polls} poll(s)")]
    Timeout { id: ExecutionId, polls: u32 },

    #[error("polling of execution {id} was cancelled")]
    Cancelled { id: ExecutionId },

    #[error(transparent)]
    Engine(#[from] EngineError),
}

/// Shared cancellation flag for poll loops.
///
/// Cancelling wakes any thread blocked in [`CancellationToken::wait`].
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        let (flag, cvar) = &*self.inner;
        *flag.lock().unwrap_or_else(|p| p.into_inner()) = true;
        cvar.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        *self.inner.0.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Sleep for `timeout` or until cancelled. Returns `true` if cancelled.
    pub fn wait(&self, timeout: Duration) -> bool {
        let (flag, cvar) = &*self.inner;
        let guard = flag.lock().unwrap_or_else(|p| p.into_inner());
        let (guard, _) = cvar
            .wait_timeout_while(guard, timeout, |cancelled| !*cancelled)
            .unwrap_or_else(|p| p.into_inner());
        *guard
    }
}

/// Poll `id` until it reaches a terminal state.
///
/// Each status request counts as one poll. The loop sleeps `poll.interval`
/// between polls and gives up with [`PollError::Timeout`] after
/// `poll.max_polls`. Cancellation is checked before every poll and while
/// sleeping; once cancelled the engine is not queried again.
pub fn await_terminal(
    engine: &dyn QueryEngine,
    id: &ExecutionId,
    poll: PollConfig,
    cancel: &CancellationToken,
) -> Result<PollOutcome, PollError> {
    let mut polls = 0;
    while polls < poll.max_polls {
        if cancel.is_cancelled() {
            return Err(PollError::Cancelled { id: id.clone() });
        }

        let status = engine.get_status(id)?;
        polls += 1;
        tracing::debug!(execution_id = %id, state = %status.state, polls, "poll");

        match status.state {
            ExecutionState::Succeeded => return Ok(PollOutcome { status, polls }),
            ExecutionState::Failed => {
                return Err(PollError::Failed {
                    id: id.clone(),
                    reason: status
                        .state_change_reason
                        .unwrap_or_else(|| "no reason given".to_string()),
                    polls,
                })
            }
            ExecutionState::Cancelled => {
                return Err(PollError::EngineCancelled {
                    id: id.clone(),
                    polls,
                })
            }
            ExecutionState::Queued | ExecutionState::Running => {}
        }

        if polls < poll.max_polls && cancel.wait(poll.interval) {
            return Err(PollError::Cancelled { id: id.clone() });
        }
    }

    Err(PollError::Timeout {
        id: id.clone(),
        polls,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Replays a fixed status sequence; the last entry repeats.
    struct ScriptedEngine {
        script: Vec<ExecutionStatus>,
        calls: AtomicU32,
    }

    impl ScriptedEngine {
        fn new(script: Vec<ExecutionStatus>) -> Self {
            Self {
                script,
                calls: AtomicU32::new(0),
            }
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl QueryEngine for ScriptedEngine {
        fn start_query(&self, _request: &QueryRequest) -> Result<ExecutionId, EngineError> {
            Ok(ExecutionId("q-1".into()))
        }

        fn get_status(&self, _id: &ExecutionId) -> Result<ExecutionStatus, EngineError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) as usize;
            Ok(self.script[n.min(self.script.len() - 1)].clone())
        }

        fn get_results(&self, id: &ExecutionId) -> Result<DataFrame, EngineError> {
            Err(EngineError::UnknownExecution(id.clone()))
        }
    }

    fn fast() -> PollConfig {
        PollConfig {
            interval: Duration::from_millis(1),
            max_polls: 30,
        }
    }

    fn id() -> ExecutionId {
        ExecutionId("q-1".into())
    }

    #[test]
    fn running_running_succeeded_takes_three_polls() {
        let engine = ScriptedEngine::new(vec![
            ExecutionStatus::new(ExecutionState::Running),
            ExecutionStatus::new(ExecutionState::Running),
            ExecutionStatus::new(ExecutionState::Succeeded),
        ]);

        let outcome = await_terminal(&engine, &id(), fast(), &CancellationToken::new()).unwrap();

        assert_eq!(outcome.polls, 3);
        assert_eq!(outcome.status.state, ExecutionState::Succeeded);
        assert_eq!(engine.calls(), 3);
    }

    #[test]
    fn failure_surfaces_engine_reason() {
        let engine = ScriptedEngine::new(vec![
            ExecutionStatus::new(ExecutionState::Running),
            ExecutionStatus::with_reason(ExecutionState::Failed, "Table not found"),
        ]);

        let err = await_terminal(&engine, &id(), fast(), &CancellationToken::new()).unwrap_err();

        match err {
            PollError::Failed { reason, polls, .. } => {
                assert_eq!(reason, "Table not found");
                assert_eq!(polls, 2);
            }
            other => panic!("expected Failed, got {other:?}"),
        }
    }

    #[test]
    fn engine_cancellation_is_a_failure() {
        let engine = ScriptedEngine::new(vec![ExecutionStatus::new(ExecutionState::Cancelled)]);
        let err = await_terminal(&engine, &id(), fast(), &CancellationToken::new()).unwrap_err();
        assert!(matches!(err, PollError::EngineCancelled { polls: 1, .. }));
    }

    #[test]
    fn never_terminal_times_out_at_poll_cap() {
        let engine = ScriptedEngine::new(vec![ExecutionStatus::new(ExecutionState::Running)]);
        let poll = PollConfig {
            interval: Duration::from_millis(1),
            max_polls: 4,
        };

        let err = await_terminal(&engine, &id(), poll, &CancellationToken::new()).unwrap_err();

        assert!(matches!(err, PollError::Timeout { polls: 4, .. }));
        assert_eq!(engine.calls(), 4);
    }

    #[test]
    fn cancelled_token_stops_before_querying() {
        let engine = ScriptedEngine::new(vec![ExecutionStatus::new(ExecutionState::Running)]);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = await_terminal(&engine, &id(), fast(), &cancel).unwrap_err();

        assert!(matches!(err, PollError::Cancelled { .. }));
        assert_eq!(engine.calls(), 0);
    }

    #[test]
    fn cancel_during_wait_interrupts_the_sleep() {
        let engine = ScriptedEngine::new(vec![ExecutionStatus::new(ExecutionState::Running)]);
        let cancel = CancellationToken::new();
        let poll = PollConfig {
            interval: Duration::from_secs(60),
            max_polls: 30,
        };

        let canceller = cancel.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            canceller.cancel();
        });

        let started = std::time::Instant::now();
        let err = await_terminal(&engine, &id(), poll, &cancel).unwrap_err();
        handle.join().unwrap();

        assert!(matches!(err, PollError::Cancelled { .. }));
        assert!(started.elapsed() < Duration::from_secs(30));
        assert_eq!(engine.calls(), 1);
    }

    #[test]
    fn state_serializes_screaming_case() {
        let json = serde_json::to_string(&ExecutionState::Succeeded).unwrap();
        assert_eq!(json, "\"SUCCEEDED\"");
        assert!(ExecutionState::Cancelled.is_terminal());
        assert!(!ExecutionState::Queued.is_terminal());
    }
}
