//! Delays used by the simulated devices in Realistic and Chaos modes.

use std::time::Duration;

/// Hardware-like timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimingConfig {
    /// Preview frame period (camera)
    pub frame_period: Duration,
    /// Round-trip delay of every command
    pub command_delay: Duration,
    /// Default pause between stepper pulses (stage)
    pub step_interval: Duration,
    /// Upper bound on the simulated duration of a single motion
    pub max_motion: Duration,
}

impl TimingConfig {
    /// Camera at roughly 30 frames per second.
    pub fn camera() -> Self {
        Self {
            frame_period: Duration::from_millis(33),
            command_delay: Duration::from_millis(2),
            ..Self::default()
        }
    }

    /// Stepper stage board.
    pub fn stage() -> Self {
        Self {
            command_delay: Duration::from_millis(5),
            step_interval: Duration::from_micros(200),
            max_motion: Duration::from_secs(5),
            ..Self::default()
        }
    }

    /// Time a motion of `steps` takes at `interval` per step.
    pub fn motion_time(&self, interval: Duration, steps: u64) -> Duration {
        let steps = u32::try_from(steps).unwrap_or(u32::MAX);
        interval.saturating_mul(steps).min(self.max_motion)
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            frame_period: Duration::from_millis(10),
            command_delay: Duration::ZERO,
            step_interval: Duration::ZERO,
            max_motion: Duration::from_secs(1),
        }
    }
}
