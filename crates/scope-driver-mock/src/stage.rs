//! Simulated three-axis stage board.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use scope_core::capabilities::StageDriver;
use scope_core::error::{DriverError, DriverErrorKind, DriverResult};
use scope_core::types::{
    Axis, AxisDirection, BoardStatus, Led, LimitFlags, NamedPosition, StageDirection,
    StagePosition, StageState,
};
use tokio::time::Instant;

use crate::common::{CommandLog, ErrorConfig, MockMode, StageCommand, TimingConfig};

const DRIVER_TYPE: &str = "simulated_stage";

// =============================================================================
// Configuration
// =============================================================================

/// Travel range per axis. Moves beyond it stop at the bound and close that
/// axis's limit switch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TravelBounds {
    /// Lowest reachable position
    pub min: StagePosition,
    /// Highest reachable position
    pub max: StagePosition,
}

impl TravelBounds {
    /// Symmetric range `[-extent, extent]` on every axis.
    pub fn symmetric(extent: i64) -> Self {
        Self {
            min: StagePosition::new(-extent, -extent, -extent),
            max: StagePosition::new(extent, extent, extent),
        }
    }

    fn clamp(&self, axis: Axis, value: i64) -> i64 {
        value.clamp(self.min.get(axis), self.max.get(axis))
    }
}

impl Default for TravelBounds {
    fn default() -> Self {
        Self::symmetric(100_000)
    }
}

/// A scripted limit-switch closure: the next motion whose target is
/// `target` stops on `axis` before moving it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct LimitTrigger {
    target: StagePosition,
    axis: Axis,
}

// =============================================================================
// Internal State
// =============================================================================

#[derive(Debug)]
struct Inner {
    state: StageState,
    motors_enabled: bool,
    step_interval: Duration,
    moving_until: Option<Instant>,
    stalled: bool,
    leds: HashMap<Led, u8>,
    status: BoardStatus,
    limit_triggers: Vec<LimitTrigger>,
}

// =============================================================================
// SimulatedStage
// =============================================================================

/// Simulated stage board.
///
/// Simulates:
/// - three stepper axes with travel bounds and limit switches
/// - motion time proportional to the step count (Realistic mode)
/// - firmware preset positions
/// - illumination LEDs and board status
/// - link loss, stalled motions and scripted limit hits
///
/// Every accepted command is appended to the [`CommandLog`].
///
/// # Example
///
/// ```rust,ignore
/// let log = CommandLog::new();
/// let stage = SimulatedStage::builder()
///     .bounds(TravelBounds::symmetric(5_000))
///     .command_log(log.clone())
///     .build();
///
/// stage.move_to(StagePosition::new(100, 0, 0)).await?;
/// stage.wait_for_motion_complete(Duration::from_secs(1)).await?;
/// ```
#[derive(Clone)]
pub struct SimulatedStage {
    inner: Arc<Mutex<Inner>>,
    bounds: TravelBounds,
    presets: Arc<HashMap<NamedPosition, StagePosition>>,
    mode: MockMode,
    timing: TimingConfig,
    error_config: ErrorConfig,
    log: CommandLog,
}

impl SimulatedStage {
    /// Stage at the origin with default bounds, Instant mode.
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Builder for configuring the stage.
    pub fn builder() -> SimulatedStageBuilder {
        SimulatedStageBuilder::default()
    }

    /// Shared command log.
    pub fn command_log(&self) -> &CommandLog {
        &self.log
    }

    /// Drop the link. Every later command fails with `Disconnected`.
    pub fn disconnect(&self) {
        self.inner.lock().state.connected = false;
    }

    /// Restore the link.
    pub fn reconnect(&self) {
        self.inner.lock().state.connected = true;
    }

    /// Make every later motion hang so that motion-complete waits time out.
    pub fn stall_motion(&self, stalled: bool) {
        self.inner.lock().stalled = stalled;
    }

    /// Close the limit switch on `axis` during the next move whose target is `target`.
    pub fn trigger_limit_at(&self, target: StagePosition, axis: Axis) {
        self.inner
            .lock()
            .limit_triggers
            .push(LimitTrigger { target, axis });
    }

    /// Current LED level.
    pub fn led_level(&self, led: Led) -> u8 {
        self.inner.lock().leds.get(&led).copied().unwrap_or(0)
    }

    /// Whether the steppers are energized.
    pub fn motors_enabled(&self) -> bool {
        self.inner.lock().motors_enabled
    }

    async fn check(&self, operation: &'static str) -> DriverResult<()> {
        if !self.inner.lock().state.connected {
            return Err(DriverError::disconnected(DRIVER_TYPE));
        }
        self.error_config.check_operation(DRIVER_TYPE, operation)?;
        if self.mode.is_timed() && !self.timing.command_delay.is_zero() {
            tokio::time::sleep(self.timing.command_delay).await;
        }
        Ok(())
    }

    /// Apply a motion to the internal state. Returns the number of steps travelled.
    fn apply_motion(&self, inner: &mut Inner, requested: StagePosition, stop_on_limit: bool) -> u64 {
        let start = inner.state.position;
        inner.state.limits = LimitFlags::default();

        let trigger = inner
            .limit_triggers
            .iter()
            .position(|t| t.target == requested)
            .map(|i| inner.limit_triggers.remove(i));

        let mut reached = start;
        for axis in Axis::ALL {
            let delta = requested.get(axis) - start.get(axis);
            if let Some(direction) = AxisDirection::of_delta(delta) {
                inner.state.last_direction.set(axis, direction);
            }

            if trigger.is_some_and(|t| t.axis == axis) {
                inner.state.limits.set(axis, true);
                continue;
            }

            let clamped = self.bounds.clamp(axis, requested.get(axis));
            if clamped != requested.get(axis) {
                inner.state.limits.set(axis, true);
                if !stop_on_limit {
                    tracing::debug!(%axis, "limit reached while ignoring limit switches");
                }
            }
            reached = reached.with(axis, clamped);
        }

        inner.state.position = reached;
        inner.motors_enabled = true;

        Axis::ALL
            .iter()
            .map(|&a| (reached.get(a) - start.get(a)).unsigned_abs())
            .max()
            .unwrap_or(0)
    }

    fn schedule(&self, inner: &mut Inner, steps: u64) {
        inner.moving_until = if self.mode.is_timed() {
            Some(Instant::now() + self.timing.motion_time(inner.step_interval, steps))
        } else {
            None
        };
    }

    fn preset(&self, position: NamedPosition) -> DriverResult<StagePosition> {
        self.presets.get(&position).copied().ok_or_else(|| {
            DriverError::new(
                DRIVER_TYPE,
                DriverErrorKind::InvalidParameter,
                format!("no preset for {:?}", position),
            )
        })
    }
}

impl Default for SimulatedStage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StageDriver for SimulatedStage {
    async fn move_to(&self, target: StagePosition) -> DriverResult<()> {
        self.check("move_to").await?;
        let mut inner = self.inner.lock();
        let steps = self.apply_motion(&mut inner, target, true);
        self.schedule(&mut inner, steps);
        tracing::debug!(%target, reached = %inner.state.position, "simulated stage move");
        drop(inner);
        self.log.stage(StageCommand::MoveTo(target));
        Ok(())
    }

    async fn move_relative(
        &self,
        direction: StageDirection,
        steps: u32,
        stop_on_limit: bool,
        disable_after: bool,
    ) -> DriverResult<()> {
        self.check("move_relative").await?;
        let mut inner = self.inner.lock();
        let axis = direction.axis();
        let start = inner.state.position;
        let delta = direction.axis_direction().sign() * i64::from(steps);
        let target = start.with(axis, start.get(axis) + delta);
        let travelled = self.apply_motion(&mut inner, target, stop_on_limit);
        self.schedule(&mut inner, travelled);
        if disable_after {
            inner.motors_enabled = false;
        }
        drop(inner);
        self.log.stage(StageCommand::MoveRelative {
            direction,
            steps,
            stop_on_limit,
            disable_after,
        });
        Ok(())
    }

    async fn wait_for_motion_complete(&self, timeout: Duration) -> DriverResult<()> {
        self.check("wait_for_motion_complete").await?;
        self.log.stage(StageCommand::WaitForMotion);

        let (stalled, until) = {
            let inner = self.inner.lock();
            (inner.stalled, inner.moving_until)
        };

        if stalled {
            tokio::time::sleep(timeout).await;
            return Err(DriverError::new(
                DRIVER_TYPE,
                DriverErrorKind::Timeout,
                format!("motion did not complete within {:?}", timeout),
            ));
        }

        if let Some(until) = until {
            let remaining = until.saturating_duration_since(Instant::now());
            if remaining > timeout {
                tokio::time::sleep(timeout).await;
                return Err(DriverError::new(
                    DRIVER_TYPE,
                    DriverErrorKind::Timeout,
                    format!("motion did not complete within {:?}", timeout),
                ));
            }
            tokio::time::sleep(remaining).await;
            self.inner.lock().moving_until = None;
        }
        Ok(())
    }

    async fn read_position(&self) -> DriverResult<StagePosition> {
        self.check("read_position").await?;
        Ok(self.inner.lock().state.position)
    }

    async fn read_limit_flags(&self) -> DriverResult<LimitFlags> {
        self.check("read_limit_flags").await?;
        Ok(self.inner.lock().state.limits)
    }

    async fn state(&self) -> DriverResult<StageState> {
        self.check("state").await?;
        Ok(self.inner.lock().state)
    }

    async fn is_connected(&self) -> bool {
        self.inner.lock().state.connected && !self.error_config.link_lost()
    }

    async fn set_step_interval(&self, interval: Duration) -> DriverResult<()> {
        self.check("set_step_interval").await?;
        self.inner.lock().step_interval = interval;
        self.log.stage(StageCommand::SetStepInterval(interval));
        Ok(())
    }

    async fn disable_motors(&self) -> DriverResult<()> {
        self.check("disable_motors").await?;
        self.inner.lock().motors_enabled = false;
        self.log.stage(StageCommand::DisableMotors);
        tracing::debug!("simulated stage motors disabled");
        Ok(())
    }

    async fn move_to_named(&self, position: NamedPosition) -> DriverResult<()> {
        self.check("move_to_named").await?;
        let preset = self.preset(position)?;
        let mut inner = self.inner.lock();
        let current = inner.state.position;
        let target = match position {
            NamedPosition::ZHome | NamedPosition::ZDown => current.with(Axis::Z, preset.z),
            _ => StagePosition::new(preset.x, preset.y, current.z),
        };
        let steps = self.apply_motion(&mut inner, target, true);
        self.schedule(&mut inner, steps);
        drop(inner);
        self.log.stage(StageCommand::MoveToNamed(position));
        Ok(())
    }

    async fn set_led(&self, led: Led, level: u8) -> DriverResult<()> {
        self.check("set_led").await?;
        self.inner.lock().leds.insert(led, level);
        self.log.stage(StageCommand::SetLed(led, level));
        Ok(())
    }

    async fn request_status(&self) -> DriverResult<BoardStatus> {
        self.check("request_status").await?;
        self.log.stage(StageCommand::RequestStatus);
        Ok(self.inner.lock().status)
    }
}

// =============================================================================
// Builder
// =============================================================================

/// Builder for [`SimulatedStage`].
#[derive(Default)]
pub struct SimulatedStageBuilder {
    initial: StagePosition,
    bounds: TravelBounds,
    presets: HashMap<NamedPosition, StagePosition>,
    mode: MockMode,
    timing: Option<TimingConfig>,
    error_config: ErrorConfig,
    log: Option<CommandLog>,
    status: Option<BoardStatus>,
}

impl SimulatedStageBuilder {
    /// Starting position.
    pub fn initial_position(mut self, position: StagePosition) -> Self {
        self.initial = position;
        self
    }

    /// Travel range.
    pub fn bounds(mut self, bounds: TravelBounds) -> Self {
        self.bounds = bounds;
        self
    }

    /// Override a firmware preset.
    pub fn preset(mut self, name: NamedPosition, position: StagePosition) -> Self {
        self.presets.insert(name, position);
        self
    }

    /// Operating mode.
    pub fn mode(mut self, mode: MockMode) -> Self {
        self.mode = mode;
        self
    }

    /// Realistic-mode timing.
    pub fn timing(mut self, timing: TimingConfig) -> Self {
        self.timing = Some(timing);
        self
    }

    /// Error injection.
    pub fn error_config(mut self, config: ErrorConfig) -> Self {
        self.error_config = config;
        self
    }

    /// Share a command log with other devices.
    pub fn command_log(mut self, log: CommandLog) -> Self {
        self.log = Some(log);
        self
    }

    /// Board status readings.
    pub fn status(mut self, status: BoardStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Build the stage.
    pub fn build(self) -> SimulatedStage {
        let bounds = self.bounds;
        let mut presets = default_presets(&bounds);
        presets.extend(self.presets);
        let timing = self.timing.unwrap_or_else(TimingConfig::stage);

        let state = StageState {
            position: self.initial,
            connected: true,
            ..StageState::default()
        };

        SimulatedStage {
            inner: Arc::new(Mutex::new(Inner {
                state,
                motors_enabled: false,
                step_interval: timing.step_interval,
                moving_until: None,
                stalled: false,
                leds: HashMap::new(),
                status: self.status.unwrap_or(BoardStatus {
                    battery_voltage: 7.4,
                    temperature: 24.0,
                    humidity: 40.0,
                    firmware_version: 1,
                }),
                limit_triggers: Vec::new(),
            })),
            bounds,
            presets: Arc::new(presets),
            mode: self.mode,
            timing,
            error_config: self.error_config,
            log: self.log.unwrap_or_default(),
        }
    }
}

fn default_presets(bounds: &TravelBounds) -> HashMap<NamedPosition, StagePosition> {
    let centre = |axis: Axis| (bounds.min.get(axis) + bounds.max.get(axis)) / 2;
    HashMap::from([
        (NamedPosition::Home, StagePosition::new(0, 0, 0)),
        (
            NamedPosition::Loading,
            StagePosition::new(bounds.min.x, bounds.max.y, 0),
        ),
        (
            NamedPosition::SlideCenter,
            StagePosition::new(centre(Axis::X), centre(Axis::Y), 0),
        ),
        (NamedPosition::TestTarget, StagePosition::new(0, 0, 0)),
        (NamedPosition::ZHome, StagePosition::new(0, 0, 0)),
        (NamedPosition::ZDown, StagePosition::new(0, 0, bounds.min.z)),
    ])
}
