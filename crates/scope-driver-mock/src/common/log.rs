//! Command log shared by the simulated stage and camera.
//!
//! Both devices append every accepted command to one [`CommandLog`], so a test
//! can check the interleaving of stage and camera traffic: for example that
//! nothing moves, focuses or captures after a run has aborted.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use scope_core::types::{FocusMode, Led, NamedPosition, StageDirection, StagePosition};

/// A command accepted by the simulated stage.
#[derive(Debug, Clone, PartialEq)]
pub enum StageCommand {
    /// Absolute move
    MoveTo(StagePosition),
    /// Relative move
    MoveRelative {
        /// Board direction
        direction: StageDirection,
        /// Step count
        steps: u32,
        /// Halt on limit switch
        stop_on_limit: bool,
        /// Release motors afterwards
        disable_after: bool,
    },
    /// Preset move
    MoveToNamed(NamedPosition),
    /// Motion-complete wait
    WaitForMotion,
    /// Step pacing change
    SetStepInterval(Duration),
    /// Motors released
    DisableMotors,
    /// LED level change
    SetLed(Led, u8),
    /// Status query
    RequestStatus,
}

impl StageCommand {
    /// True for commands that move the stage.
    pub fn is_motion(&self) -> bool {
        matches!(
            self,
            StageCommand::MoveTo(_) | StageCommand::MoveRelative { .. } | StageCommand::MoveToNamed(_)
        )
    }
}

/// A command accepted by the simulated camera.
#[derive(Debug, Clone, PartialEq)]
pub enum CameraCommand {
    /// Device acquired
    SetUp,
    /// Device released
    TakeDown,
    /// Preview started
    StartPreview,
    /// Preview stopped
    StopPreview,
    /// Focus actuator moved
    SetFocusPosition(f64),
    /// Focus lock changed
    SetFocusLock(bool),
    /// Exposure lock changed
    SetExposureLock(bool),
    /// Manual exposure
    SetExposure {
        /// Milliseconds
        exposure_ms: f64,
        /// Sensor ISO
        iso: u32,
    },
    /// White balance gains
    SetWhiteBalance(u32, u32, u32),
    /// Still captured
    CaptureImage,
    /// Metric selected
    SetFocusMode(FocusMode),
}

/// One entry in the shared log.
#[derive(Debug, Clone, PartialEq)]
pub enum LoggedCommand {
    /// Sent to the stage
    Stage(StageCommand),
    /// Sent to the camera
    Camera(CameraCommand),
}

/// Append-only command log. Clones share the same entries.
#[derive(Debug, Clone, Default)]
pub struct CommandLog {
    entries: Arc<Mutex<Vec<LoggedCommand>>>,
}

impl CommandLog {
    /// Empty log.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn stage(&self, command: StageCommand) {
        self.entries.lock().push(LoggedCommand::Stage(command));
    }

    pub(crate) fn camera(&self, command: CameraCommand) {
        self.entries.lock().push(LoggedCommand::Camera(command));
    }

    /// Snapshot of every entry in order.
    pub fn entries(&self) -> Vec<LoggedCommand> {
        self.entries.lock().clone()
    }

    /// Stage commands in order.
    pub fn stage_commands(&self) -> Vec<StageCommand> {
        self.entries
            .lock()
            .iter()
            .filter_map(|e| match e {
                LoggedCommand::Stage(c) => Some(c.clone()),
                LoggedCommand::Camera(_) => None,
            })
            .collect()
    }

    /// Camera commands in order.
    pub fn camera_commands(&self) -> Vec<CameraCommand> {
        self.entries
            .lock()
            .iter()
            .filter_map(|e| match e {
                LoggedCommand::Camera(c) => Some(c.clone()),
                LoggedCommand::Stage(_) => None,
            })
            .collect()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// True when nothing was logged.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Drop every entry.
    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}
