//! Closed-loop autofocus.
//!
//! The controller searches the camera's focus actuator for the position that
//! maximizes the live focus score (sharpness in brightfield, contrast in
//! fluorescence). It is a coarse-to-fine hill climb:
//!
//! 1. Measure at the current actuator position (clamped into range).
//! 2. Step in the current direction. A significant improvement keeps the
//!    direction; anything else reverses it and shrinks the step by
//!    `refine_factor`.
//! 3. Stop once the step drops below `fine_step` or `max_steps` probes have
//!    been measured.
//!
//! Every commanded position is clamped to `[min_position, max_position]`.
//! The controller only ever touches the focus actuator.
//!
//! A measurement is only accepted once the camera has published a reading
//! whose whole averaging window was taken at the commanded position, so a
//! score is never attributed to the wrong actuator position.

use std::sync::Arc;
use std::time::Duration;

use scope_core::capabilities::CameraDriver;
use scope_core::config::AutofocusConfig;
use scope_core::error::DriverError;
use scope_core::focus::FocusReading;
use scope_core::limits::FOCUS_WINDOW_FRAMES;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::stop::{StopSignal, Stopped};

/// Positions closer than this are the same actuator setting.
const POSITION_EPSILON: f64 = 1e-9;

/// Controller state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AutofocusState {
    /// No attempt running.
    Idle,
    /// Probing actuator positions.
    Searching,
    /// Last attempt found a peak.
    Converged,
    /// Last attempt gave up.
    Failed,
}

/// Why an attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AutofocusFailure {
    /// Best score never exceeded the usable threshold.
    NoUsableSignal,
    /// Best score sits on a travel bound, no peak was bracketed.
    PinnedAtBound,
    /// Attempt or sample deadline expired.
    Timeout,
}

/// Result of one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AutofocusOutcome {
    /// Best position found. The actuator is left here.
    pub position: f64,
    /// Score measured at `position`
    pub score: f64,
    /// Positions measured
    pub measurements: u32,
    /// Set when the attempt failed
    pub failure: Option<AutofocusFailure>,
}

impl AutofocusOutcome {
    /// True when the attempt found a usable peak.
    pub fn converged(&self) -> bool {
        self.failure.is_none()
    }
}

/// Errors that end an attempt without a verdict.
#[derive(Debug, Error)]
pub enum AutofocusError {
    /// The camera failed or disconnected.
    #[error(transparent)]
    Driver(#[from] DriverError),
    /// A stop was requested.
    #[error("autofocus cancelled")]
    Cancelled,
}

impl From<Stopped> for AutofocusError {
    fn from(_: Stopped) -> Self {
        AutofocusError::Cancelled
    }
}

#[derive(Debug, Clone, Copy)]
struct Probe {
    position: f64,
    score: f64,
}

/// Hill-climbing focus search over a [`CameraDriver`].
pub struct AutofocusController {
    camera: Arc<dyn CameraDriver>,
    config: AutofocusConfig,
    settling: Duration,
    state: AutofocusState,
}

impl AutofocusController {
    /// Controller for `camera`. `settling` is waited after every actuator move.
    pub fn new(camera: Arc<dyn CameraDriver>, config: AutofocusConfig, settling: Duration) -> Self {
        Self {
            camera,
            config,
            settling,
            state: AutofocusState::Idle,
        }
    }

    /// Current state.
    pub fn state(&self) -> AutofocusState {
        self.state
    }

    fn clamp(&self, position: f64) -> f64 {
        position.clamp(self.config.min_position, self.config.max_position)
    }

    fn at_bound(&self, position: f64) -> bool {
        (position - self.config.min_position).abs() < POSITION_EPSILON
            || (position - self.config.max_position).abs() < POSITION_EPSILON
    }

    /// Run one attempt.
    ///
    /// Each call starts from scratch; nothing is carried over from earlier
    /// attempts.
    ///
    /// # Errors
    ///
    /// `Cancelled` when `stop` fires, `Driver` when the camera fails.
    pub async fn run(&mut self, stop: &mut StopSignal) -> Result<AutofocusOutcome, AutofocusError> {
        self.state = AutofocusState::Searching;
        let result = self.search(stop).await;
        self.state = match &result {
            Ok(outcome) if outcome.converged() => AutofocusState::Converged,
            _ => AutofocusState::Failed,
        };
        result
    }

    async fn search(&self, stop: &mut StopSignal) -> Result<AutofocusOutcome, AutofocusError> {
        let cfg = self.config;
        let deadline = Instant::now() + cfg.attempt_timeout;
        let mut readings = self.camera.focus_readings();

        let start = self.clamp(self.camera.focus_position().await?);
        let mut measurements = 1;
        let Some(score) = self.sample(start, deadline, &mut readings, stop).await? else {
            warn!(position = start, "autofocus timed out on first sample");
            return Ok(AutofocusOutcome {
                position: start,
                score: 0.0,
                measurements,
                failure: Some(AutofocusFailure::Timeout),
            });
        };

        let mut best = Probe {
            position: start,
            score,
        };
        let mut last_commanded = start;
        let mut direction = 1.0;
        let mut step = cfg.coarse_step;
        let mut timed_out = false;

        while step >= cfg.fine_step && measurements < cfg.max_steps {
            let target = self.clamp(best.position + direction * step);
            if (target - best.position).abs() < POSITION_EPSILON {
                direction = -direction;
                step *= cfg.refine_factor;
                continue;
            }

            measurements += 1;
            last_commanded = target;
            let Some(score) = self.sample(target, deadline, &mut readings, stop).await? else {
                timed_out = true;
                break;
            };
            debug!(position = target, score, step, "focus probe");

            if score > best.score + cfg.tolerance * best.score.abs() {
                best = Probe {
                    position: target,
                    score,
                };
            } else {
                if score > best.score {
                    best = Probe {
                        position: target,
                        score,
                    };
                }
                direction = -direction;
                step *= cfg.refine_factor;
            }
        }

        if (last_commanded - best.position).abs() >= POSITION_EPSILON {
            self.camera.set_focus_position(best.position).await?;
        }

        let failure = if timed_out {
            Some(AutofocusFailure::Timeout)
        } else if best.score <= cfg.min_usable_metric {
            Some(AutofocusFailure::NoUsableSignal)
        } else if self.at_bound(best.position) {
            Some(AutofocusFailure::PinnedAtBound)
        } else {
            None
        };

        match failure {
            None => info!(
                position = best.position,
                score = best.score,
                measurements,
                "autofocus converged"
            ),
            Some(reason) => warn!(
                ?reason,
                position = best.position,
                score = best.score,
                measurements,
                "autofocus failed"
            ),
        }

        Ok(AutofocusOutcome {
            position: best.position,
            score: best.score,
            measurements,
            failure,
        })
    }

    /// Move to `position`, settle, then wait for a reading taken entirely at
    /// `position`. `None` when the deadline expires first.
    async fn sample(
        &self,
        position: f64,
        deadline: Instant,
        readings: &mut watch::Receiver<FocusReading>,
        stop: &mut StopSignal,
    ) -> Result<Option<f64>, AutofocusError> {
        let before = readings.borrow_and_update().sequence;
        self.camera.set_focus_position(position).await?;
        stop.sleep(self.settling).await?;

        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Ok(None);
        }
        let wait = self.config.sample_timeout.min(remaining);

        let fresh = async {
            readings
                .wait_for(|r| {
                    r.sequence > before
                        && r.settled_frames >= FOCUS_WINDOW_FRAMES
                        && (r.position - position).abs() < POSITION_EPSILON
                })
                .await
                .map(|r| r.score)
        };

        match stop.race(tokio::time::timeout(wait, fresh)).await? {
            Ok(Ok(score)) => Ok(Some(score)),
            Ok(Err(_closed)) => Err(DriverError::disconnected("camera").into()),
            Err(_elapsed) => Ok(None),
        }
    }
}

impl std::fmt::Debug for AutofocusController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AutofocusController")
            .field("config", &self.config)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}
