//! Shared hard limits and timeout constants.
//!
//! Every blocking wait in a scan is bounded. The per-run values come from
//! `ScanConfiguration`; the constants here are the fixed margins and caps
//! that sit on top of them.

use std::time::Duration;

use crate::error::{DriverError, DriverErrorKind, DriverResult};

// =============================================================================
// Timeout Constants
// =============================================================================

/// Slack added to the computed travel time before a motion is declared hung.
pub const MOTION_TIMEOUT_MARGIN: Duration = Duration::from_secs(2);

/// Floor for any motion timeout, however short the move.
pub const MIN_MOTION_TIMEOUT: Duration = Duration::from_millis(500);

/// Timeout for a single command round-trip on the serial link.
pub const COMMAND_TIMEOUT: Duration = Duration::from_secs(2);

/// Time allowed for teardown commands on a terminal path.
pub const TEARDOWN_TIMEOUT: Duration = Duration::from_secs(2);

// =============================================================================
// Focus
// =============================================================================

/// Number of frames averaged into one focus score.
pub const FOCUS_WINDOW_FRAMES: usize = 3;

/// Upper end of the focus actuator range ("infinity").
pub const INFINITY_FOCUS_POSITION: f64 = 1.0;

// =============================================================================
// Size Limits
// =============================================================================

/// Maximum supported width/height for frames.
pub const MAX_FRAME_DIMENSION: u32 = 16_384;

/// Maximum allowed frame payload in bytes (256 MB).
pub const MAX_FRAME_BYTES: usize = 256 * 1024 * 1024;

/// Validated frame sizing information.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameSize {
    /// Pixel count
    pub pixels: usize,
    /// Byte count
    pub bytes: usize,
}

/// Validate frame dimensions and calculate pixel/byte sizes without overflow.
pub fn validate_frame_size(
    width: u32,
    height: u32,
    bytes_per_pixel: usize,
) -> DriverResult<FrameSize> {
    if width > MAX_FRAME_DIMENSION || height > MAX_FRAME_DIMENSION {
        return Err(DriverError::new(
            "frame",
            DriverErrorKind::InvalidParameter,
            format!("frame dimensions {}x{} exceed {}", width, height, MAX_FRAME_DIMENSION),
        ));
    }

    let pixels = (width as usize)
        .checked_mul(height as usize)
        .ok_or_else(|| overflow(width, height))?;
    let bytes = pixels
        .checked_mul(bytes_per_pixel)
        .ok_or_else(|| overflow(width, height))?;

    if bytes > MAX_FRAME_BYTES {
        return Err(DriverError::new(
            "frame",
            DriverErrorKind::InvalidParameter,
            format!("frame of {} bytes exceeds {}", bytes, MAX_FRAME_BYTES),
        ));
    }

    Ok(FrameSize { pixels, bytes })
}

fn overflow(width: u32, height: u32) -> DriverError {
    DriverError::new(
        "frame",
        DriverErrorKind::InvalidParameter,
        format!("frame size overflow for {}x{}", width, height),
    )
}

/// Time budget for a motion of `steps` at `step_duration` per step.
pub fn motion_timeout(step_duration: Duration, steps: u64) -> Duration {
    let steps = u32::try_from(steps).unwrap_or(u32::MAX);
    let travel = step_duration.saturating_mul(steps);
    (travel + MOTION_TIMEOUT_MARGIN).max(MIN_MOTION_TIMEOUT)
}
