//! Simulated camera with a motorized focus actuator.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use scope_core::capabilities::CameraDriver;
use scope_core::data::{Frame, ImageQuality};
use scope_core::error::{DriverError, DriverErrorKind, DriverResult};
use scope_core::focus::{self, FocusMetricEstimator, FocusReading};
use scope_core::limits::{FOCUS_WINDOW_FRAMES, INFINITY_FOCUS_POSITION};
use scope_core::types::{FocusMode, WhiteBalance};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::common::{CameraCommand, CommandLog, ErrorConfig, MockMode, TimingConfig};
use crate::specimen::{Specimen, SpecimenKind};

const DRIVER_TYPE: &str = "simulated_camera";

#[derive(Debug)]
struct Inner {
    connected: bool,
    set_up: bool,
    previewing: bool,
    focus_position: f64,
    focus_locked: bool,
    exposure_locked: bool,
    exposure_ms: f64,
    iso: u32,
    white_balance: WhiteBalance,
    specimen: Specimen,
    estimator: FocusMetricEstimator,
    last_frame: Option<Frame>,
    captures: u64,
}

/// Simulated camera looking at a synthetic [`Specimen`].
///
/// The rendered frame blurs with the distance between the focus actuator and
/// the specimen's focal plane, so autofocus has a real peak to find.
///
/// While the preview runs, frames are scored with the active focus metric
/// and the window-averaged [`FocusReading`] is published on a `watch`
/// channel:
///
/// - **Instant** mode publishes a full window of frames synchronously inside
///   every `set_focus_position` call and on `start_preview`.
/// - **Realistic/Chaos** modes stream frames from a background task at the
///   configured frame period.
#[derive(Clone)]
pub struct SimulatedCamera {
    inner: Arc<Mutex<Inner>>,
    readings_tx: Arc<watch::Sender<FocusReading>>,
    streaming_task: Arc<Mutex<Option<JoinHandle<()>>>>,
    mode: MockMode,
    timing: TimingConfig,
    error_config: ErrorConfig,
    log: CommandLog,
}

impl SimulatedCamera {
    /// Camera over a brightfield specimen focused at 0.5, Instant mode.
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Builder for configuring the camera.
    pub fn builder() -> SimulatedCameraBuilder {
        SimulatedCameraBuilder::default()
    }

    /// Shared command log.
    pub fn command_log(&self) -> &CommandLog {
        &self.log
    }

    /// Drop the link. Every later command fails with `Disconnected`.
    pub fn disconnect(&self) {
        self.inner.lock().connected = false;
    }

    /// Restore the link.
    pub fn reconnect(&self) {
        self.inner.lock().connected = true;
    }

    /// Swap the specimen under the objective.
    pub fn set_specimen(&self, specimen: Specimen) {
        self.inner.lock().specimen = specimen;
    }

    /// Move the focal plane of the current specimen.
    pub fn set_best_focus(&self, best_focus: f64) {
        self.inner.lock().specimen.best_focus = best_focus;
    }

    /// Whether the preview is streaming.
    pub fn is_previewing(&self) -> bool {
        self.inner.lock().previewing
    }

    /// Focus lock state.
    pub fn focus_locked(&self) -> bool {
        self.inner.lock().focus_locked
    }

    /// Exposure lock state.
    pub fn exposure_locked(&self) -> bool {
        self.inner.lock().exposure_locked
    }

    /// Stills captured so far.
    pub fn captures(&self) -> u64 {
        self.inner.lock().captures
    }

    async fn check(&self, operation: &'static str) -> DriverResult<()> {
        if !self.inner.lock().connected {
            return Err(DriverError::disconnected(DRIVER_TYPE));
        }
        self.error_config.check_operation(DRIVER_TYPE, operation)?;
        if self.mode.is_timed() && !self.timing.command_delay.is_zero() {
            tokio::time::sleep(self.timing.command_delay).await;
        }
        Ok(())
    }

    /// Render the current view, score it and publish the reading.
    fn publish_frame(inner: &Arc<Mutex<Inner>>, tx: &watch::Sender<FocusReading>) {
        let mut guard = inner.lock();
        let position = guard.focus_position;
        let frame = guard.specimen.frame_at(position);
        let reading = guard.estimator.observe(&frame, position);
        guard.last_frame = Some(frame);
        drop(guard);
        tx.send_replace(reading);
    }

    fn halt_stream(&self) {
        if let Some(handle) = self.streaming_task.lock().take() {
            handle.abort();
        }
        self.inner.lock().previewing = false;
    }

    fn publish_window(&self) {
        for _ in 0..FOCUS_WINDOW_FRAMES {
            Self::publish_frame(&self.inner, &self.readings_tx);
        }
    }
}

impl Default for SimulatedCamera {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CameraDriver for SimulatedCamera {
    async fn set_up(&self) -> DriverResult<()> {
        self.check("set_up").await?;
        self.inner.lock().set_up = true;
        self.log.camera(CameraCommand::SetUp);
        Ok(())
    }

    async fn take_down(&self) -> DriverResult<()> {
        self.check("take_down").await?;
        self.halt_stream();
        self.inner.lock().set_up = false;
        self.log.camera(CameraCommand::TakeDown);
        Ok(())
    }

    async fn start_preview(&self) -> DriverResult<()> {
        self.check("start_preview").await?;
        if !self.inner.lock().set_up {
            return Err(DriverError::new(
                DRIVER_TYPE,
                DriverErrorKind::Initialization,
                "preview requested before set_up",
            ));
        }
        self.log.camera(CameraCommand::StartPreview);

        {
            let mut inner = self.inner.lock();
            if inner.previewing {
                return Ok(());
            }
            inner.previewing = true;
        }

        if self.mode.is_timed() {
            let inner = self.inner.clone();
            let tx = self.readings_tx.clone();
            let period = self.timing.frame_period;
            let handle = tokio::spawn(async move {
                let mut ticker = tokio::time::interval(period);
                loop {
                    ticker.tick().await;
                    SimulatedCamera::publish_frame(&inner, &tx);
                }
            });
            *self.streaming_task.lock() = Some(handle);
        } else {
            self.publish_window();
        }
        Ok(())
    }

    async fn stop_preview(&self) -> DriverResult<()> {
        self.check("stop_preview").await?;
        self.halt_stream();
        self.log.camera(CameraCommand::StopPreview);
        Ok(())
    }

    async fn set_focus_position(&self, position: f64) -> DriverResult<()> {
        self.check("set_focus_position").await?;
        if !(0.0..=INFINITY_FOCUS_POSITION).contains(&position) {
            return Err(DriverError::new(
                DRIVER_TYPE,
                DriverErrorKind::InvalidParameter,
                format!(
                    "focus position {} outside [0, {}]",
                    position, INFINITY_FOCUS_POSITION
                ),
            ));
        }
        self.inner.lock().focus_position = position;
        self.log.camera(CameraCommand::SetFocusPosition(position));

        if !self.mode.is_timed() && self.is_previewing() {
            self.publish_window();
        }
        Ok(())
    }

    async fn focus_position(&self) -> DriverResult<f64> {
        self.check("focus_position").await?;
        Ok(self.inner.lock().focus_position)
    }

    async fn set_focus_lock(&self, locked: bool) -> DriverResult<()> {
        self.check("set_focus_lock").await?;
        self.inner.lock().focus_locked = locked;
        self.log.camera(CameraCommand::SetFocusLock(locked));
        Ok(())
    }

    async fn set_exposure_lock(&self, locked: bool) -> DriverResult<()> {
        self.check("set_exposure_lock").await?;
        self.inner.lock().exposure_locked = locked;
        self.log.camera(CameraCommand::SetExposureLock(locked));
        Ok(())
    }

    async fn set_exposure(&self, exposure_ms: f64, iso: u32) -> DriverResult<()> {
        self.check("set_exposure").await?;
        if !(exposure_ms.is_finite() && exposure_ms > 0.0) || iso == 0 {
            return Err(DriverError::new(
                DRIVER_TYPE,
                DriverErrorKind::InvalidParameter,
                format!("invalid exposure {} ms at ISO {}", exposure_ms, iso),
            ));
        }
        {
            let mut inner = self.inner.lock();
            inner.exposure_ms = exposure_ms;
            inner.iso = iso;
        }
        self.log
            .camera(CameraCommand::SetExposure { exposure_ms, iso });
        Ok(())
    }

    async fn set_white_balance(&self, red: u32, green: u32, blue: u32) -> DriverResult<()> {
        self.check("set_white_balance").await?;
        self.inner.lock().white_balance = WhiteBalance { red, green, blue };
        self.log
            .camera(CameraCommand::SetWhiteBalance(red, green, blue));
        Ok(())
    }

    async fn capture_image(&self) -> DriverResult<Frame> {
        self.check("capture_image").await?;
        let frame = {
            let mut inner = self.inner.lock();
            if !inner.set_up {
                return Err(DriverError::new(
                    DRIVER_TYPE,
                    DriverErrorKind::NoFrame,
                    "camera is not set up",
                ));
            }
            inner.captures += 1;
            inner.specimen.frame_at(inner.focus_position)
        };
        if self.mode.is_timed() {
            let exposure = self.inner.lock().exposure_ms;
            tokio::time::sleep(std::time::Duration::from_secs_f64(exposure / 1000.0)).await;
        }
        self.log.camera(CameraCommand::CaptureImage);
        Ok(frame)
    }

    fn focus_readings(&self) -> watch::Receiver<FocusReading> {
        self.readings_tx.subscribe()
    }

    async fn current_focus_metric(&self) -> DriverResult<f64> {
        self.check("current_focus_metric").await?;
        Ok(self.readings_tx.borrow().score)
    }

    async fn current_image_quality(&self) -> DriverResult<ImageQuality> {
        self.check("current_image_quality").await?;
        let inner = self.inner.lock();
        let quality = match &inner.last_frame {
            Some(frame) => focus::image_quality(frame),
            None => focus::image_quality(&inner.specimen.frame_at(inner.focus_position)),
        };
        Ok(quality)
    }

    async fn set_focus_mode(&self, mode: FocusMode) -> DriverResult<()> {
        self.check("set_focus_mode").await?;
        self.inner.lock().estimator.set_mode(mode);
        self.log.camera(CameraCommand::SetFocusMode(mode));
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        self.inner.lock().connected && !self.error_config.link_lost()
    }
}

// =============================================================================
// Builder
// =============================================================================

/// Builder for [`SimulatedCamera`].
pub struct SimulatedCameraBuilder {
    specimen: Option<Specimen>,
    kind: SpecimenKind,
    resolution: (u32, u32),
    seed: u64,
    best_focus: f64,
    initial_focus: f64,
    mode: MockMode,
    timing: Option<TimingConfig>,
    error_config: ErrorConfig,
    log: Option<CommandLog>,
}

impl Default for SimulatedCameraBuilder {
    fn default() -> Self {
        Self {
            specimen: None,
            kind: SpecimenKind::Brightfield,
            resolution: (64, 64),
            seed: 0x5eed,
            best_focus: 0.5,
            initial_focus: 0.3,
            mode: MockMode::Instant,
            timing: None,
            error_config: ErrorConfig::none(),
            log: None,
        }
    }
}

impl SimulatedCameraBuilder {
    /// Kind of specimen to render.
    pub fn specimen_kind(mut self, kind: SpecimenKind) -> Self {
        self.kind = kind;
        self
    }

    /// Use a prepared specimen instead of rendering one.
    pub fn specimen(mut self, specimen: Specimen) -> Self {
        self.specimen = Some(specimen);
        self
    }

    /// Frame size in pixels.
    pub fn resolution(mut self, width: u32, height: u32) -> Self {
        self.resolution = (width, height);
        self
    }

    /// Texture seed.
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Actuator position of the focal plane.
    pub fn best_focus(mut self, best_focus: f64) -> Self {
        self.best_focus = best_focus;
        self
    }

    /// Actuator position at start-up.
    pub fn initial_focus(mut self, position: f64) -> Self {
        self.initial_focus = position;
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

    /// Build the camera.
    pub fn build(self) -> SimulatedCamera {
        let (width, height) = self.resolution;
        let specimen = self.specimen.unwrap_or_else(|| {
            Specimen::new(self.kind, width, height, self.seed).with_best_focus(self.best_focus)
        });
        let (tx, _rx) = watch::channel(FocusReading::default());

        SimulatedCamera {
            inner: Arc::new(Mutex::new(Inner {
                connected: true,
                set_up: false,
                previewing: false,
                focus_position: self.initial_focus.clamp(0.0, INFINITY_FOCUS_POSITION),
                focus_locked: false,
                exposure_locked: false,
                exposure_ms: 10.0,
                iso: 100,
                white_balance: WhiteBalance::default(),
                specimen,
                estimator: FocusMetricEstimator::new(FocusMode::Sharpness),
                last_frame: None,
                captures: 0,
            })),
            readings_tx: Arc::new(tx),
            streaming_task: Arc::new(Mutex::new(None)),
            mode: self.mode,
            timing: self.timing.unwrap_or_else(TimingConfig::camera),
            error_config: self.error_config,
            log: self.log.unwrap_or_default(),
        }
    }
}
