//! Live scan events.
//!
//! The orchestrator publishes these on a `tokio::sync::broadcast` channel so
//! any number of observers (CLI progress, a UI, a recorder) can follow a run.
//! Slow subscribers lag and drop events; the run never waits for them.

use scope_core::error::AbortReason;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::report::{FieldResult, ScanOutcome};

/// Orchestrator state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanState {
    /// No run in progress.
    #[default]
    Idle,
    /// Moving the stage to the next field.
    Positioning,
    /// Waiting for the stage to stop and settle.
    Settling,
    /// Running or reusing autofocus.
    Focusing,
    /// Taking the still.
    Capturing,
    /// Field finished, choosing the next one.
    Advancing,
    /// Every field visited.
    Completed,
    /// Run ended early.
    Aborted,
}

impl ScanState {
    /// True for `Completed` and `Aborted`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ScanState::Completed | ScanState::Aborted)
    }
}

impl std::fmt::Display for ScanState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            ScanState::Idle => "idle",
            ScanState::Positioning => "positioning",
            ScanState::Settling => "settling",
            ScanState::Focusing => "focusing",
            ScanState::Capturing => "capturing",
            ScanState::Advancing => "advancing",
            ScanState::Completed => "completed",
            ScanState::Aborted => "aborted",
        };
        f.write_str(label)
    }
}

/// Event emitted during a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ScanEvent {
    /// Run accepted and starting.
    Started {
        /// Run identifier
        run_id: Uuid,
        /// Grid rows
        rows: u32,
        /// Grid columns
        columns: u32,
    },
    /// State transition, with the field in progress if any.
    State {
        /// Run identifier
        run_id: Uuid,
        /// New state
        state: ScanState,
        /// Field in progress
        #[serde(default, skip_serializing_if = "Option::is_none")]
        field: Option<(u32, u32)>,
    },
    /// A field finished.
    Field {
        /// Run identifier
        run_id: Uuid,
        /// The immutable result
        result: Box<FieldResult>,
    },
    /// Run finished, teardown done.
    Finished {
        /// Run identifier
        run_id: Uuid,
        /// Terminal outcome
        outcome: ScanOutcome,
    },
}

impl ScanEvent {
    /// Reason code carried by a `Finished` event for an unsuccessful run.
    pub fn abort_reason(&self) -> Option<AbortReason> {
        match self {
            ScanEvent::Finished { outcome, .. } => outcome.reason(),
            _ => None,
        }
    }
}
