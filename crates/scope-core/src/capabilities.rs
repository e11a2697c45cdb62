//! Hardware capability traits.
//!
//! The scan engine drives two devices through these traits:
//!
//! - [`StageDriver`]: the three-axis stage board. Motion, limit switches,
//!   named positions, illumination LEDs and board status.
//! - [`CameraDriver`]: preview, still capture, exposure and white balance,
//!   the focus actuator and the live focus/quality signal.
//!
//! Each trait has a live implementation (serial stage board, device camera)
//! and a simulated one. The orchestrator receives `Arc<dyn StageDriver>` and
//! `Arc<dyn CameraDriver>` at construction and never inspects which variant
//! it was given.
//!
//! Every method is async, returns [`DriverResult`], and must be safe to call
//! from any task (`Send + Sync`). A driver that has lost its device answers
//! with [`DriverErrorKind::Disconnected`](crate::error::DriverErrorKind).

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;

use crate::data::{Frame, ImageQuality};
use crate::error::DriverResult;
use crate::focus::FocusReading;
use crate::types::{
    BoardStatus, FocusMode, Led, LimitFlags, NamedPosition, StageDirection, StagePosition,
    StageState,
};

/// Capability: three-axis motorized stage.
///
/// # Contract
/// - Motion commands return once the motion has been accepted, not when it
///   ends. Call [`wait_for_motion_complete`](Self::wait_for_motion_complete)
///   to block until the stage stops.
/// - Limit flags describe the most recent motion and are cleared when the
///   next one starts.
/// - The driver owns [`StageState`]; callers only read snapshots.
#[async_trait]
pub trait StageDriver: Send + Sync {
    /// Move to an absolute position in steps.
    async fn move_to(&self, target: StagePosition) -> DriverResult<()>;

    /// Move `steps` in one board direction.
    ///
    /// # Arguments
    /// * `stop_on_limit` - halt the motion when a limit switch closes
    /// * `disable_after` - de-energize the motors once the move ends
    async fn move_relative(
        &self,
        direction: StageDirection,
        steps: u32,
        stop_on_limit: bool,
        disable_after: bool,
    ) -> DriverResult<()>;

    /// Block until the current motion has finished.
    ///
    /// # Returns
    /// - Ok(()) when the stage is idle
    /// - Err with `Timeout` when it is still moving after `timeout`
    async fn wait_for_motion_complete(&self, timeout: Duration) -> DriverResult<()>;

    /// Current position.
    async fn read_position(&self) -> DriverResult<StagePosition>;

    /// Limit switches closed during the last motion.
    async fn read_limit_flags(&self) -> DriverResult<LimitFlags>;

    /// Snapshot of the driver-owned stage state.
    async fn state(&self) -> DriverResult<StageState>;

    /// Link to the stage board is up.
    async fn is_connected(&self) -> bool;

    /// Pause between motor steps. Longer intervals move more gently.
    async fn set_step_interval(&self, interval: Duration) -> DriverResult<()>;

    /// De-energize all stepper motors.
    async fn disable_motors(&self) -> DriverResult<()>;

    /// Move to a firmware preset position.
    async fn move_to_named(&self, position: NamedPosition) -> DriverResult<()>;

    /// Set an illumination LED level, 0 switches it off.
    async fn set_led(&self, led: Led, level: u8) -> DriverResult<()>;

    /// Battery, environment and firmware readings.
    async fn request_status(&self) -> DriverResult<BoardStatus>;
}

/// Capability: camera with a motorized focus actuator.
///
/// # Contract
/// - The focus actuator range is `[0, INFINITY_FOCUS_POSITION]`; positions
///   outside it are rejected with `InvalidParameter`.
/// - While the preview runs the camera scores frames with the active
///   [`FocusMode`] and publishes the window-averaged [`FocusReading`] on a
///   `watch` channel. Consumers always see the latest value and never block
///   the camera.
#[async_trait]
pub trait CameraDriver: Send + Sync {
    /// Acquire the device.
    async fn set_up(&self) -> DriverResult<()>;

    /// Release the device.
    async fn take_down(&self) -> DriverResult<()>;

    /// Start streaming preview frames and focus readings.
    async fn start_preview(&self) -> DriverResult<()>;

    /// Stop the preview stream.
    async fn stop_preview(&self) -> DriverResult<()>;

    /// Command the focus actuator.
    async fn set_focus_position(&self, position: f64) -> DriverResult<()>;

    /// Last commanded focus actuator position.
    async fn focus_position(&self) -> DriverResult<f64>;

    /// Hold the focus actuator against automatic adjustment.
    async fn set_focus_lock(&self, locked: bool) -> DriverResult<()>;

    /// Hold exposure against automatic adjustment.
    async fn set_exposure_lock(&self, locked: bool) -> DriverResult<()>;

    /// Manual exposure.
    async fn set_exposure(&self, exposure_ms: f64, iso: u32) -> DriverResult<()>;

    /// Manual white balance gains.
    async fn set_white_balance(&self, red: u32, green: u32, blue: u32) -> DriverResult<()>;

    /// Take one still image.
    ///
    /// # Errors
    /// `NoFrame` when the camera produced nothing.
    async fn capture_image(&self) -> DriverResult<Frame>;

    /// Subscribe to the live focus signal.
    fn focus_readings(&self) -> watch::Receiver<FocusReading>;

    /// Latest averaged focus score.
    async fn current_focus_metric(&self) -> DriverResult<f64>;

    /// Quality figures of the latest preview frame.
    async fn current_image_quality(&self) -> DriverResult<ImageQuality>;

    /// Select which metric the live focus signal reports.
    async fn set_focus_mode(&self, mode: FocusMode) -> DriverResult<()>;

    /// Device is reachable.
    async fn is_connected(&self) -> bool;
}
