//! Run results handed to the persistence collaborator.

use chrono::{DateTime, Utc};
use scope_core::config::ScanConfiguration;
use scope_core::data::ImageHandle;
use scope_core::error::AbortReason;
use scope_core::types::BoardStatus;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::grid::GridPosition;

/// How a single field ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FieldOutcome {
    /// In focus and imaged.
    Captured,
    /// Autofocus did not converge. The field may still carry an image taken
    /// at the best-effort focus position.
    AutofocusFailed,
    /// Hardware fault on the field: a limit switch or motion timeout while
    /// positioning, or no frame from the camera or the sink. The run's
    /// abort reason tells the two apart.
    StageFault,
    /// The run stopped while this field was in progress.
    Aborted,
}

/// Image-quality flags. Informational only, never change the outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FieldAnnotation {
    /// No structure in view.
    Empty,
    /// Field overlaps the specimen boundary.
    Boundary,
}

/// Result for one visited field. Immutable once emitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldResult {
    /// Cell and stage target
    pub position: GridPosition,
    /// Image stored by the sink, if one was taken
    pub image: Option<ImageHandle>,
    /// Focus score when the field was finished
    pub focus_metric: f64,
    /// Focus actuator position used
    pub focus_position: Option<f64>,
    /// Autofocus attempts consumed on this field
    pub autofocus_attempts: u32,
    /// Outcome tag
    pub outcome: FieldOutcome,
    /// Quality flags
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub annotations: Vec<FieldAnnotation>,
    /// When the field was finished
    pub finished_at: DateTime<Utc>,
}

impl FieldResult {
    /// Result without image or focus data.
    pub fn bare(position: GridPosition, outcome: FieldOutcome, autofocus_attempts: u32) -> Self {
        Self {
            position,
            image: None,
            focus_metric: 0.0,
            focus_position: None,
            autofocus_attempts,
            outcome,
            annotations: Vec::new(),
            finished_at: Utc::now(),
        }
    }
}

/// How the whole run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "kebab-case")]
pub enum ScanOutcome {
    /// Every field was visited.
    Completed,
    /// Stopped at a field.
    AbortedAt {
        /// Row of the field in progress
        row: u32,
        /// Column of the field in progress
        column: u32,
        /// Why
        reason: AbortReason,
    },
    /// Hardware became unusable.
    FatalHardwareError {
        /// Why
        reason: AbortReason,
        /// Field in progress, if the grid had been reached
        #[serde(default, skip_serializing_if = "Option::is_none")]
        at: Option<(u32, u32)>,
    },
}

impl ScanOutcome {
    /// True for [`ScanOutcome::Completed`].
    pub fn is_completed(&self) -> bool {
        matches!(self, ScanOutcome::Completed)
    }

    /// Reason code for any non-completed outcome.
    pub fn reason(&self) -> Option<AbortReason> {
        match self {
            ScanOutcome::Completed => None,
            ScanOutcome::AbortedAt { reason, .. } | ScanOutcome::FatalHardwareError { reason, .. } => {
                Some(*reason)
            }
        }
    }
}

/// Complete record of one scan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanRun {
    /// Run identifier
    pub id: Uuid,
    /// Start time
    pub started_at: DateTime<Utc>,
    /// End time, after teardown
    pub finished_at: DateTime<Utc>,
    /// Configuration the run used
    pub configuration: ScanConfiguration,
    /// Visited fields in order
    pub fields: Vec<FieldResult>,
    /// Terminal outcome
    pub outcome: ScanOutcome,
    /// Failed autofocus attempts over the run
    pub autofocus_failures: u32,
    /// Stage board readings taken at start
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub board_status: Option<BoardStatus>,
}

impl ScanRun {
    /// Number of fields with `outcome`.
    pub fn count(&self, outcome: FieldOutcome) -> usize {
        self.fields.iter().filter(|f| f.outcome == outcome).count()
    }

    /// Number of fields that carry an image.
    pub fn images(&self) -> usize {
        self.fields.iter().filter(|f| f.image.is_some()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scope_core::types::StagePosition;

    #[test]
    fn outcome_serializes_with_reason_code() {
        let outcome = ScanOutcome::AbortedAt {
            row: 1,
            column: 0,
            reason: AbortReason::StageFault,
        };
        let json = serde_json::to_value(outcome).unwrap();
        assert_eq!(json["outcome"], "aborted-at");
        assert_eq!(json["reason"], "stage-fault");
        assert_eq!(outcome.reason(), Some(AbortReason::StageFault));
        assert!(!outcome.is_completed());
    }

    #[test]
    fn fatal_outcome_without_field() {
        let outcome = ScanOutcome::FatalHardwareError {
            reason: AbortReason::HardwareDisconnected,
            at: None,
        };
        let json = serde_json::to_value(outcome).unwrap();
        assert_eq!(json["outcome"], "fatal-hardware-error");
        assert!(json.get("at").is_none());
    }

    #[test]
    fn field_outcome_tags() {
        let field = FieldResult::bare(
            GridPosition {
                row: 0,
                column: 1,
                target: StagePosition::new(100, 0, 0),
            },
            FieldOutcome::AutofocusFailed,
            1,
        );
        let json = serde_json::to_value(&field).unwrap();
        assert_eq!(json["outcome"], "autofocus-failed");
        assert!(json.get("annotations").is_none());
    }
}
