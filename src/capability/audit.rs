//! Ordered record of every capability call a session made.
//!
//! A call is staged before the implementation runs and completed afterwards.
//! Completed entries are immutable and appended in sequence order, which is
//! the guest's dispatch order since the guest has a single thread of control.
//!
//! When a session ends the log is sealed. A call still in flight at that
//! point (the interpreter backend can leave one running past its deadline) is
//! recorded as [`AuditOutcome::Unfinished`] so the report still shows it was
//! issued; its eventual result only reaches the sinks.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// How a call ended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    Result(Value),
    Error(String),
    /// Still running when the session ended
    Unfinished,
}

/// One capability call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Starts at 1, strictly increasing
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub tool_name: String,
    pub args: Value,
    pub outcome: AuditOutcome,
    pub duration: Duration,
}

impl AuditEntry {
    pub fn is_error(&self) -> bool {
        matches!(self.outcome, AuditOutcome::Error(_))
    }
}

/// Receives every completed entry.
pub trait AuditSink: Send + Sync {
    fn record(&self, session_id: &str, entry: &AuditEntry, late: bool);
}

/// Default sink: one `tracing` event per call.
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, session_id: &str, entry: &AuditEntry, late: bool) {
        let duration_us = entry.duration.as_micros() as u64;
        match &entry.outcome {
            AuditOutcome::Error(error) => tracing::warn!(
                session_id = %session_id,
                seq = entry.sequence,
                tool = %entry.tool_name,
                duration_us,
                late,
                error = %error,
                "capability call failed"
            ),
            _ => tracing::info!(
                session_id = %session_id,
                seq = entry.sequence,
                tool = %entry.tool_name,
                duration_us,
                late,
                "capability call"
            ),
        }
    }
}

struct Staged {
    timestamp: DateTime<Utc>,
    tool_name: String,
    args: Value,
    started: Instant,
}

#[derive(Default)]
struct LogState {
    next_sequence: u64,
    entries: Vec<AuditEntry>,
    pending: BTreeMap<u64, Staged>,
    sealed: bool,
}

/// Handle for a staged call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallTicket {
    sequence: u64,
}

impl CallTicket {
    pub fn sequence(&self) -> u64 {
        self.sequence
    }
}

/// Append-only audit log owned by one session.
pub struct AuditLog {
    session_id: String,
    state: Mutex<LogState>,
    sinks: Vec<Arc<dyn AuditSink>>,
}

impl AuditLog {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self::with_sinks(session_id, Vec::new())
    }

    pub fn with_sinks(session_id: impl Into<String>, sinks: Vec<Arc<dyn AuditSink>>) -> Self {
        Self {
            session_id: session_id.into(),
            state: Mutex::new(LogState {
                next_sequence: 1,
                ..LogState::default()
            }),
            sinks,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Stage a call before invoking it. Returns `None` once sealed.
    pub fn stage(&self, tool_name: &str, args: Value) -> Option<CallTicket> {
        let mut state = self.state.lock();
        if state.sealed {
            return None;
        }
        let sequence = state.next_sequence;
        state.next_sequence += 1;
        state.pending.insert(
            sequence,
            Staged {
                timestamp: Utc::now(),
                tool_name: tool_name.to_string(),
                args,
                started: Instant::now(),
            },
        );
        Some(CallTicket { sequence })
    }

    /// Complete a staged call and append it.
    pub fn complete(&self, ticket: CallTicket, outcome: AuditOutcome) {
        let (entry, late) = {
            let mut state = self.state.lock();
            let Some(staged) = state.pending.remove(&ticket.sequence) else {
                return;
            };
            let entry = AuditEntry {
                sequence: ticket.sequence,
                timestamp: staged.timestamp,
                tool_name: staged.tool_name,
                args: staged.args,
                outcome,
                duration: staged.started.elapsed(),
            };
            let late = state.sealed;
            if !late {
                state.entries.push(entry.clone());
            }
            (entry, late)
        };
        for sink in &self.sinks {
            sink.record(&self.session_id, &entry, late);
        }
    }

    /// Stop accepting calls. In-flight calls are appended as unfinished.
    pub fn seal(&self) {
        let mut state = self.state.lock();
        if state.sealed {
            return;
        }
        state.sealed = true;
        let unfinished: Vec<AuditEntry> = state
            .pending
            .iter()
            .map(|(sequence, staged)| AuditEntry {
                sequence: *sequence,
                timestamp: staged.timestamp,
                tool_name: staged.tool_name.clone(),
                args: staged.args.clone(),
                outcome: AuditOutcome::Unfinished,
                duration: staged.started.elapsed(),
            })
            .collect();
        state.entries.extend(unfinished);
        state.entries.sort_by_key(|e| e.sequence);
    }

    pub fn is_sealed(&self) -> bool {
        self.state.lock().sealed
    }

    /// Snapshot of the completed entries.
    pub fn entries(&self) -> Vec<AuditEntry> {
        self.state.lock().entries.clone()
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
