//! ScanOrchestrator - state machine for a slide scan.
//!
//! The orchestrator plans the grid, drives the stage from field to field,
//! focuses each field, captures it and hands the frame to an [`ImageSink`].
//! Progress is published as [`ScanEvent`]s and the run ends with a
//! [`ScanRun`] for the persistence collaborator.
//!
//! # State Machine
//!
//! ```text
//! ┌──────┐ run() ┌─────────────┐      ┌──────────┐      ┌──────────┐
//! │ Idle │──────▶│ Positioning │─────▶│ Settling │─────▶│ Focusing │
//! └──────┘       └─────────────┘      └──────────┘      └────┬─────┘
//!                       ▲                                    │
//!                       │ next field ┌───────────┐      ┌────▼──────┐
//!                       └────────────│ Advancing │◀─────│ Capturing │
//!                                    └─────┬─────┘      └───────────┘
//!                                          │ last field
//!                                          ▼
//!                                    ┌───────────┐
//!                                    │ Completed │
//!                                    └───────────┘
//!
//!  any state ── stop / disconnect / fault (abort policy) ──▶ Aborted
//! ```
//!
//! Every terminal path runs the same teardown exactly once: camera locks are
//! released, the preview is stopped, LEDs are switched off and, last, a
//! single `disable_motors()` is sent. Commands only go to devices that are
//! still connected.
//!
//! # Usage
//!
//! ```rust,ignore
//! let orchestrator = ScanOrchestrator::new(stage, camera, sink);
//! let mut events = orchestrator.subscribe();
//! let stop = orchestrator.stop_handle();
//!
//! let run = orchestrator.run(config).await?;
//! println!("{}", serde_json::to_string_pretty(&run)?);
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use scope_core::capabilities::{CameraDriver, StageDriver};
use scope_core::config::{FocusPolicy, QualityThresholds, ScanConfiguration, StageFaultPolicy};
use scope_core::data::ImageQuality;
use scope_core::error::{AbortReason, DriverError, DriverErrorKind, ScopeError, ScopeResult};
use scope_core::limits;
use scope_core::types::{Axis, BoardStatus, Led, NamedPosition};
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::autofocus::{AutofocusController, AutofocusError};
use crate::backlash;
use crate::events::{ScanEvent, ScanState};
use crate::grid::{GridPlan, GridPosition};
use crate::lease::{ExecutionLease, LeaseProvider, NoopLeaseProvider};
use crate::report::{FieldAnnotation, FieldOutcome, FieldResult, ScanOutcome, ScanRun};
use crate::sink::ImageSink;
use crate::stop::{StopHandle, StopSignal, Stopped};

/// Event channel depth. Lagging subscribers lose the oldest events.
const EVENT_CAPACITY: usize = 1024;

/// Why the run loop stopped early.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Halt {
    /// External stop request.
    Stopped,
    /// Stage or camera went away.
    Disconnected,
    /// Field-level fault under the abort policy.
    Fault(AbortReason),
    /// Run-level failure.
    Fatal(AbortReason),
}

impl From<Stopped> for Halt {
    fn from(_: Stopped) -> Self {
        Halt::Stopped
    }
}

impl Halt {
    /// Classify a driver error outside of motion and capture.
    fn driver(err: DriverError) -> Self {
        if err.is_disconnect() {
            Halt::Disconnected
        } else {
            error!(error = %err, "unrecoverable driver error");
            Halt::Fatal(AbortReason::DriverFault)
        }
    }

    /// Classify a driver error raised while the stage moves.
    fn motion(err: DriverError) -> Self {
        match err.kind {
            DriverErrorKind::Disconnected => Halt::Disconnected,
            DriverErrorKind::Timeout | DriverErrorKind::Limit => {
                warn!(error = %err, "stage fault");
                Halt::Fault(AbortReason::StageFault)
            }
            _ => Halt::driver(err),
        }
    }

    fn into_outcome(self, at: Option<&GridPosition>) -> ScanOutcome {
        let cell = at.map(|f| (f.row, f.column));
        let (row, column) = cell.unwrap_or((0, 0));
        match self {
            Halt::Stopped => ScanOutcome::AbortedAt {
                row,
                column,
                reason: AbortReason::Cancelled,
            },
            Halt::Fault(reason) => ScanOutcome::AbortedAt {
                row,
                column,
                reason,
            },
            Halt::Disconnected => ScanOutcome::FatalHardwareError {
                reason: AbortReason::HardwareDisconnected,
                at: cell,
            },
            Halt::Fatal(reason) => ScanOutcome::FatalHardwareError { reason, at: cell },
        }
    }
}

/// Focus decision for one field.
#[derive(Debug, Clone, Copy)]
struct FocusStep {
    converged: bool,
    attempts: u32,
    position: Option<f64>,
}

/// Per-run mutable state.
struct RunContext {
    run_id: Uuid,
    config: Arc<ScanConfiguration>,
    stop: StopSignal,
    fields: Vec<FieldResult>,
    autofocus_failures: u32,
    last_focus: Option<f64>,
    board_status: Option<BoardStatus>,
}

impl RunContext {
    fn has_result(&self, field: &GridPosition) -> bool {
        self.fields.last().is_some_and(|r| r.position == *field)
    }
}

/// Clears the running flag on every exit path.
struct RunningFlag<'a>(&'a AtomicBool);

impl Drop for RunningFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Drives a stage and a camera through a slide scan.
pub struct ScanOrchestrator {
    stage: Arc<dyn StageDriver>,
    camera: Arc<dyn CameraDriver>,
    sink: Arc<dyn ImageSink>,
    leases: Arc<dyn LeaseProvider>,
    events: broadcast::Sender<ScanEvent>,
    state: watch::Sender<ScanState>,
    stop: StopHandle,
    running: AtomicBool,
}

impl ScanOrchestrator {
    /// Orchestrator over the given devices. The orchestrator is the only
    /// user of the drivers while a run is in progress.
    pub fn new(
        stage: Arc<dyn StageDriver>,
        camera: Arc<dyn CameraDriver>,
        sink: Arc<dyn ImageSink>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (state, _) = watch::channel(ScanState::Idle);
        Self {
            stage,
            camera,
            sink,
            leases: Arc::new(NoopLeaseProvider),
            events,
            state,
            stop: StopHandle::new(),
            running: AtomicBool::new(false),
        }
    }

    /// Hold a host execution lease from `provider` for the length of each run.
    pub fn with_lease_provider(mut self, provider: Arc<dyn LeaseProvider>) -> Self {
        self.leases = provider;
        self
    }

    /// Subscribe to live events.
    pub fn subscribe(&self) -> broadcast::Receiver<ScanEvent> {
        self.events.subscribe()
    }

    /// Watch the state machine.
    pub fn state(&self) -> watch::Receiver<ScanState> {
        self.state.subscribe()
    }

    /// Handle that can stop the current run from another task.
    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Ask the current run to stop at the next state boundary.
    pub fn request_stop(&self) {
        info!("scan stop requested");
        self.stop.request_stop();
    }

    /// True while [`run`](Self::run) is executing.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Execute one scan.
    ///
    /// Run outcomes, including aborts, are reported inside the returned
    /// [`ScanRun`]. A stop requested before the run reaches its first state
    /// boundary aborts it there.
    ///
    /// # Errors
    ///
    /// - `ConfigurationInvalid` before any hardware command
    /// - `ScanInProgress` when another run is executing
    pub async fn run(&self, config: ScanConfiguration) -> ScopeResult<ScanRun> {
        config.validate()?;
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(ScopeError::ScanInProgress);
        }
        let _running = RunningFlag(&self.running);
        let _lease = ExecutionLease::acquire(self.leases.clone(), "slide-scan");

        let run = self.execute(config).await;
        self.stop.clear();
        Ok(run)
    }

    async fn execute(&self, config: ScanConfiguration) -> ScanRun {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let config = Arc::new(config);
        info!(
            run_uid = %run_id,
            rows = config.rows,
            columns = config.columns,
            mode = %config.imaging_mode,
            "scan starting"
        );
        self.emit(ScanEvent::Started {
            run_id,
            rows: config.rows,
            columns: config.columns,
        });

        let mut ctx = RunContext {
            run_id,
            config: config.clone(),
            stop: self.stop.signal(),
            fields: Vec::with_capacity(config.field_count()),
            autofocus_failures: 0,
            last_focus: None,
            board_status: None,
        };

        let outcome = match self.prepare(&mut ctx).await {
            Ok(plan) => self.traverse(&mut ctx, &plan).await,
            Err(halt) => halt.into_outcome(None),
        };

        if outcome.is_completed() {
            if let Some(park) = config.park_position {
                self.park(park).await;
            }
        }
        self.teardown().await;

        let terminal = if outcome.is_completed() {
            ScanState::Completed
        } else {
            ScanState::Aborted
        };
        self.set_state(&ctx, terminal, None);

        match outcome.reason() {
            None => info!(
                run_uid = %run_id,
                fields = ctx.fields.len(),
                autofocus_failures = ctx.autofocus_failures,
                "scan completed"
            ),
            Some(reason) => warn!(
                run_uid = %run_id,
                reason = %reason,
                fields = ctx.fields.len(),
                "scan aborted"
            ),
        }
        self.emit(ScanEvent::Finished { run_id, outcome });

        ScanRun {
            id: run_id,
            started_at,
            finished_at: Utc::now(),
            configuration: (*config).clone(),
            fields: ctx.fields,
            outcome,
            autofocus_failures: ctx.autofocus_failures,
            board_status: ctx.board_status,
        }
    }

    // =========================================================================
    // Setup
    // =========================================================================

    async fn prepare(&self, ctx: &mut RunContext) -> Result<GridPlan, Halt> {
        let config = ctx.config.clone();
        ctx.stop.check()?;
        self.ensure_connected().await?;

        match self.stage.request_status().await {
            Ok(status) => {
                info!(
                    battery_voltage = status.battery_voltage,
                    temperature = status.temperature,
                    humidity = status.humidity,
                    firmware = status.firmware_version,
                    "stage board status"
                );
                ctx.board_status = Some(status);
            }
            Err(err) if err.is_disconnect() => return Err(Halt::Disconnected),
            Err(err) => warn!(error = %err, "board status unavailable"),
        }

        self.stage
            .set_step_interval(config.stage_step_duration)
            .await
            .map_err(Halt::driver)?;

        let mode = config.imaging_mode;
        let settings = config.mode_settings();
        let wb = settings.white_balance;
        self.camera.set_up().await.map_err(Halt::driver)?;
        self.camera
            .set_focus_mode(mode.focus_mode())
            .await
            .map_err(Halt::driver)?;
        self.camera
            .set_exposure(settings.exposure_ms, settings.iso)
            .await
            .map_err(Halt::driver)?;
        self.camera
            .set_white_balance(wb.red, wb.green, wb.blue)
            .await
            .map_err(Halt::driver)?;
        self.camera
            .set_exposure_lock(true)
            .await
            .map_err(Halt::driver)?;
        self.camera.set_focus_lock(true).await.map_err(Halt::driver)?;
        self.camera.start_preview().await.map_err(Halt::driver)?;

        let active = mode.led();
        let inactive = match active {
            Led::Brightfield => Led::Fluorescent,
            Led::Fluorescent => Led::Brightfield,
        };
        self.stage.set_led(inactive, 0).await.map_err(Halt::driver)?;
        self.stage
            .set_led(active, settings.illumination)
            .await
            .map_err(Halt::driver)?;

        let origin = match config.origin {
            Some(origin) => origin,
            None => self.stage.read_position().await.map_err(Halt::driver)?,
        };
        let plan = GridPlan::new(&config, origin).map_err(|err| {
            error!(error = %err, %origin, "grid cannot start at the stage position");
            Halt::Fatal(AbortReason::StageFault)
        })?;
        info!(
            run_uid = %ctx.run_id,
            %origin,
            fields = plan.len(),
            order = ?config.order,
            "grid planned"
        );
        Ok(plan)
    }

    // =========================================================================
    // Field loop
    // =========================================================================

    async fn traverse(&self, ctx: &mut RunContext, plan: &GridPlan) -> ScanOutcome {
        for (index, field) in plan.fields().iter().enumerate() {
            if ctx.stop.is_stopped() {
                return Halt::Stopped.into_outcome(Some(field));
            }

            if let Err(halt) = self.visit(ctx, index, field).await {
                if !ctx.has_result(field) {
                    self.record(ctx, FieldResult::bare(*field, FieldOutcome::Aborted, 0));
                }
                return halt.into_outcome(Some(field));
            }
            self.set_state(ctx, ScanState::Advancing, Some(field));
        }
        ScanOutcome::Completed
    }

    async fn visit(&self, ctx: &mut RunContext, index: usize, field: &GridPosition) -> Result<(), Halt> {
        self.ensure_connected().await?;
        debug!(row = field.row, col = field.column, target = %field.target, "visiting field");

        self.set_state(ctx, ScanState::Positioning, Some(field));
        match self.position(ctx, field).await {
            Ok(()) => {}
            Err(Halt::Fault(reason)) => return self.field_fault(ctx, field, reason, 0),
            Err(halt) => return Err(halt),
        }

        self.set_state(ctx, ScanState::Focusing, Some(field));
        ctx.stop.check()?;
        let focus = self.focus(ctx, index, field).await?;

        if !focus.converged && !ctx.config.capture_on_autofocus_failure {
            let mut result = FieldResult::bare(*field, FieldOutcome::AutofocusFailed, focus.attempts);
            result.focus_position = focus.position;
            result.focus_metric = self.camera.current_focus_metric().await.map_err(Halt::driver)?;
            self.record(ctx, result);
            return Ok(());
        }

        self.set_state(ctx, ScanState::Capturing, Some(field));
        ctx.stop.check()?;
        self.capture(ctx, field, focus).await
    }

    async fn position(&self, ctx: &mut RunContext, field: &GridPosition) -> Result<(), Halt> {
        let config = ctx.config.clone();
        let snapshot = self.stage.state().await.map_err(Halt::driver)?;

        let take_ups = backlash::plan(&snapshot, field.target, config.backlash);
        for take_up in &take_ups {
            debug!(
                axis = %take_up.axis,
                direction = ?take_up.direction,
                steps = take_up.steps,
                "backlash pre-load"
            );
            self.stage
                .move_relative(take_up.direction, take_up.steps, true, false)
                .await
                .map_err(Halt::motion)?;
            self.await_motion(ctx, u64::from(take_up.steps)).await?;
            self.check_limits(&[take_up.axis]).await?;
        }

        self.stage
            .move_to(field.target)
            .await
            .map_err(Halt::motion)?;

        self.set_state(ctx, ScanState::Settling, Some(field));
        let start = backlash::approach_start(snapshot.position, &take_ups);
        self.await_motion(ctx, backlash::max_travel(start, field.target))
            .await?;

        let moved: Vec<Axis> = Axis::ALL
            .into_iter()
            .filter(|&axis| field.target.get(axis) != snapshot.position.get(axis))
            .collect();
        self.check_limits(&moved).await?;

        ctx.stop.sleep(config.stage_settling_time).await?;
        Ok(())
    }

    async fn await_motion(&self, ctx: &mut RunContext, steps: u64) -> Result<(), Halt> {
        let timeout = limits::motion_timeout(ctx.config.stage_step_duration, steps);
        let guarded = tokio::time::timeout(
            timeout + limits::COMMAND_TIMEOUT,
            self.stage.wait_for_motion_complete(timeout),
        );
        match ctx.stop.race(guarded).await? {
            Ok(result) => result.map_err(Halt::motion),
            Err(_elapsed) => {
                warn!(?timeout, "stage did not answer the motion wait");
                Err(Halt::Fault(AbortReason::StageFault))
            }
        }
    }

    async fn check_limits(&self, moved: &[Axis]) -> Result<(), Halt> {
        let flags = self.stage.read_limit_flags().await.map_err(Halt::driver)?;
        if let Some(axis) = moved.iter().find(|&&axis| flags.get(axis)) {
            warn!(%axis, "limit switch closed during move");
            return Err(Halt::Fault(AbortReason::StageFault));
        }
        Ok(())
    }

    /// Record a field-level fault and apply the stage fault policy.
    fn field_fault(
        &self,
        ctx: &mut RunContext,
        field: &GridPosition,
        reason: AbortReason,
        attempts: u32,
    ) -> Result<(), Halt> {
        let outcome = match reason {
            AbortReason::StageFault | AbortReason::CaptureFailed => FieldOutcome::StageFault,
            _ => FieldOutcome::Aborted,
        };
        self.record(ctx, FieldResult::bare(*field, outcome, attempts));

        match ctx.config.stage_fault_policy {
            StageFaultPolicy::Abort => Err(Halt::Fault(reason)),
            StageFaultPolicy::Skip => {
                warn!(row = field.row, col = field.column, %reason, "skipping field");
                Ok(())
            }
        }
    }

    async fn focus(&self, ctx: &mut RunContext, index: usize, field: &GridPosition) -> Result<FocusStep, Halt> {
        let config = ctx.config.clone();
        let scheduled = index % config.refocus_interval as usize == 0;
        let reuse = match ctx.last_focus {
            Some(position) if !scheduled && config.focus_policy == FocusPolicy::ReuseBetweenRefocus => {
                Some(position)
            }
            _ => None,
        };

        if let Some(position) = reuse {
            debug!(row = field.row, col = field.column, position, "reusing focus position");
            self.camera
                .set_focus_position(position)
                .await
                .map_err(Halt::driver)?;
            ctx.stop.sleep(config.focus_settling_time).await?;
            return Ok(FocusStep {
                converged: true,
                attempts: 0,
                position: Some(position),
            });
        }

        let mut controller = AutofocusController::new(
            self.camera.clone(),
            config.autofocus,
            config.focus_settling_time,
        );
        let mut best_effort = None;

        for attempt in 1..=config.autofocus_attempts_per_field {
            let outcome = match controller.run(&mut ctx.stop).await {
                Ok(outcome) => outcome,
                Err(AutofocusError::Cancelled) => return Err(Halt::Stopped),
                Err(AutofocusError::Driver(err)) if err.is_disconnect() => {
                    return Err(Halt::Disconnected)
                }
                Err(AutofocusError::Driver(err)) => {
                    warn!(error = %err, "autofocus attempt hit a camera error");
                    ctx.autofocus_failures += 1;
                    if ctx.autofocus_failures > config.max_autofocus_failures {
                        return self.budget_exceeded(ctx, field, attempt);
                    }
                    continue;
                }
            };

            if outcome.converged() {
                ctx.last_focus = Some(outcome.position);
                return Ok(FocusStep {
                    converged: true,
                    attempts: attempt,
                    position: Some(outcome.position),
                });
            }

            ctx.autofocus_failures += 1;
            warn!(
                row = field.row,
                col = field.column,
                attempt,
                failures = ctx.autofocus_failures,
                reason = ?outcome.failure,
                "autofocus attempt failed"
            );
            if ctx.autofocus_failures > config.max_autofocus_failures {
                return self.budget_exceeded(ctx, field, attempt);
            }
            best_effort = Some(outcome.position);
        }

        Ok(FocusStep {
            converged: false,
            attempts: config.autofocus_attempts_per_field,
            position: best_effort,
        })
    }

    fn budget_exceeded(
        &self,
        ctx: &mut RunContext,
        field: &GridPosition,
        attempts: u32,
    ) -> Result<FocusStep, Halt> {
        error!(
            row = field.row,
            col = field.column,
            failures = ctx.autofocus_failures,
            budget = ctx.config.max_autofocus_failures,
            "autofocus failure budget exceeded"
        );
        self.record(ctx, FieldResult::bare(*field, FieldOutcome::Aborted, attempts));
        Err(Halt::Fatal(AbortReason::AutofocusBudgetExceeded))
    }

    async fn capture(&self, ctx: &mut RunContext, field: &GridPosition, focus: FocusStep) -> Result<(), Halt> {
        let frame = match self.camera.capture_image().await {
            Ok(frame) => frame,
            Err(err) if err.is_disconnect() => return Err(Halt::Disconnected),
            Err(err) => {
                warn!(row = field.row, col = field.column, error = %err, "capture failed");
                return self.field_fault(ctx, field, AbortReason::CaptureFailed, focus.attempts);
            }
        };

        let image = match self.sink.store(field, frame).await {
            Ok(handle) => handle,
            Err(err) => {
                warn!(row = field.row, col = field.column, error = %err, "image sink rejected frame");
                return self.field_fault(ctx, field, AbortReason::CaptureFailed, focus.attempts);
            }
        };

        let focus_metric = self
            .camera
            .current_focus_metric()
            .await
            .map_err(Halt::driver)?;
        let annotations = match self.camera.current_image_quality().await {
            Ok(quality) => annotate(&quality, &ctx.config.quality),
            Err(err) if err.is_disconnect() => return Err(Halt::Disconnected),
            Err(err) => {
                warn!(error = %err, "image quality unavailable");
                Vec::new()
            }
        };

        let outcome = if focus.converged {
            FieldOutcome::Captured
        } else {
            FieldOutcome::AutofocusFailed
        };
        info!(
            row = field.row,
            col = field.column,
            score = focus_metric,
            outcome = ?outcome,
            "field captured"
        );
        self.record(
            ctx,
            FieldResult {
                position: *field,
                image: Some(image),
                focus_metric,
                focus_position: focus.position,
                autofocus_attempts: focus.attempts,
                outcome,
                annotations,
                finished_at: Utc::now(),
            },
        );
        Ok(())
    }

    // =========================================================================
    // Teardown
    // =========================================================================

    async fn park(&self, position: NamedPosition) {
        if !self.stage.is_connected().await {
            return;
        }
        info!(?position, "parking stage");
        if let Err(err) = self.stage.move_to_named(position).await {
            warn!(error = %err, "park move failed");
            return;
        }
        if let Err(err) = self
            .stage
            .wait_for_motion_complete(limits::TEARDOWN_TIMEOUT)
            .await
        {
            warn!(error = %err, "park move did not complete");
        }
    }

    /// Leave the hardware safe. Runs once per run on every exit path.
    async fn teardown(&self) {
        if self.camera.is_connected().await {
            bounded("release focus lock", self.camera.set_focus_lock(false)).await;
            bounded("release exposure lock", self.camera.set_exposure_lock(false)).await;
            bounded("stop preview", self.camera.stop_preview()).await;
            bounded("take down camera", self.camera.take_down()).await;
        } else {
            warn!("camera unreachable, skipping camera teardown");
        }

        if self.stage.is_connected().await {
            bounded("brightfield led off", self.stage.set_led(Led::Brightfield, 0)).await;
            bounded("fluorescent led off", self.stage.set_led(Led::Fluorescent, 0)).await;
            bounded("disable motors", self.stage.disable_motors()).await;
        } else {
            warn!("stage unreachable, motors left as they are");
        }
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    async fn ensure_connected(&self) -> Result<(), Halt> {
        if !self.stage.is_connected().await {
            error!("stage disconnected");
            return Err(Halt::Disconnected);
        }
        if !self.camera.is_connected().await {
            error!("camera disconnected");
            return Err(Halt::Disconnected);
        }
        Ok(())
    }

    fn record(&self, ctx: &mut RunContext, result: FieldResult) {
        debug!(
            row = result.position.row,
            col = result.position.column,
            outcome = ?result.outcome,
            "field result"
        );
        ctx.fields.push(result.clone());
        self.emit(ScanEvent::Field {
            run_id: ctx.run_id,
            result: Box::new(result),
        });
    }

    fn set_state(&self, ctx: &RunContext, state: ScanState, field: Option<&GridPosition>) {
        self.state.send_replace(state);
        self.emit(ScanEvent::State {
            run_id: ctx.run_id,
            state,
            field: field.map(|f| (f.row, f.column)),
        });
    }

    fn emit(&self, event: ScanEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

/// Await a teardown step with a deadline, logging instead of failing.
async fn bounded<F>(label: &str, step: F)
where
    F: std::future::Future<Output = Result<(), DriverError>>,
{
    match tokio::time::timeout(limits::TEARDOWN_TIMEOUT, step).await {
        Ok(Ok(())) => debug!(step = label, "teardown step done"),
        Ok(Err(err)) => warn!(step = label, error = %err, "teardown step failed"),
        Err(_) => warn!(step = label, "teardown step timed out"),
    }
}

/// Quality flags for a captured field.
fn annotate(quality: &ImageQuality, thresholds: &QualityThresholds) -> Vec<FieldAnnotation> {
    let mut annotations = Vec::new();
    if quality.sharpness < thresholds.empty_field_threshold {
        annotations.push(FieldAnnotation::Empty);
    }
    if quality.boundary_score > thresholds.boundary_field_threshold {
        annotations.push(FieldAnnotation::Boundary);
    }
    annotations
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn halt_maps_to_outcome() {
        let field = GridPosition {
            row: 1,
            column: 2,
            target: Default::default(),
        };
        assert_eq!(
            Halt::Stopped.into_outcome(Some(&field)),
            ScanOutcome::AbortedAt {
                row: 1,
                column: 2,
                reason: AbortReason::Cancelled
            }
        );
        assert_eq!(
            Halt::Disconnected.into_outcome(None),
            ScanOutcome::FatalHardwareError {
                reason: AbortReason::HardwareDisconnected,
                at: None
            }
        );
    }

    #[test]
    fn motion_errors_classify_as_stage_faults() {
        let timeout = DriverError::new("stage", DriverErrorKind::Timeout, "slow");
        let limit = DriverError::new("stage", DriverErrorKind::Limit, "switch");
        let proto = DriverError::new("stage", DriverErrorKind::Protocol, "garbled");
        assert_eq!(Halt::motion(timeout), Halt::Fault(AbortReason::StageFault));
        assert_eq!(Halt::motion(limit), Halt::Fault(AbortReason::StageFault));
        assert_eq!(Halt::motion(proto), Halt::Fatal(AbortReason::DriverFault));
        assert_eq!(Halt::motion(DriverError::disconnected("stage")), Halt::Disconnected);
    }

    #[test]
    fn annotations_follow_thresholds() {
        let thresholds = QualityThresholds::default();
        let empty = ImageQuality {
            sharpness: 0.0,
            boundary_score: 0.9,
            ..ImageQuality::default()
        };
        assert_eq!(
            annotate(&empty, &thresholds),
            vec![FieldAnnotation::Empty, FieldAnnotation::Boundary]
        );

        let good = ImageQuality {
            sharpness: 1.0,
            boundary_score: 0.0,
            ..ImageQuality::default()
        };
        assert!(annotate(&good, &thresholds).is_empty());
    }
}
