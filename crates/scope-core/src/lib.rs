//! `scope-core`
//!
//! Shared building blocks for the slide scanner: the stage and camera
//! capability traits, the data model, focus metric estimation, scan
//! configuration and error types.
//!
//! ## Key Types
//!
//! - [`StageDriver`] / [`CameraDriver`]: hardware capabilities consumed by the
//!   scan engine. Live and simulated drivers implement the same traits.
//! - [`FocusMetricEstimator`]: frame → sharpness or contrast score, averaged
//!   over the most recent frames.
//! - [`ScanConfiguration`]: per-run settings, loaded with Figment.
//! - [`DriverError`] / [`ScopeError`] / [`AbortReason`]: failures and run
//!   outcome reasons.

pub mod capabilities;
pub mod config;
pub mod data;
pub mod error;
pub mod focus;
pub mod limits;
#[cfg(feature = "serial")]
pub mod serial;
pub mod types;

pub use capabilities::{CameraDriver, StageDriver};
pub use config::{
    AutofocusConfig, FieldSpacing, FocusPolicy, ModeSettings, QualityThresholds, RasterOrder,
    ScanConfiguration, StageFaultPolicy,
};
pub use data::{Frame, ImageHandle, ImageQuality};
pub use error::{
    AbortReason, DriverError, DriverErrorKind, DriverResult, ScopeError, ScopeResult,
};
pub use focus::{FocusMetricEstimator, FocusReading, FocusSample, FocusWindow};
pub use types::{
    Axis, AxisDirection, AxisDirections, BoardStatus, FocusMode, ImagingMode, Led, LimitFlags,
    NamedPosition, StageDirection, StagePosition, StageState, WhiteBalance,
};
