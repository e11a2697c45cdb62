//! Simulated hardware for the slide scanner.
//!
//! Drop-in implementations of the `scope-core` capability traits that run
//! without a microscope attached:
//!
//! - [`SimulatedStage`]: three stepper axes with travel bounds, limit
//!   switches, presets, LEDs and board status
//! - [`SimulatedCamera`]: a camera over a synthetic [`Specimen`] whose blur
//!   follows the focus actuator's distance from the focal plane
//!
//! Both devices take a [`MockMode`], an [`ErrorConfig`] for fault injection
//! and an optional shared [`CommandLog`] recording every accepted command.
//!
//! ```rust,ignore
//! use scope_driver_mock::{CommandLog, SimulatedCamera, SimulatedStage};
//!
//! let log = CommandLog::new();
//! let stage = Arc::new(SimulatedStage::builder().command_log(log.clone()).build());
//! let camera = Arc::new(SimulatedCamera::builder().command_log(log.clone()).build());
//! ```

pub mod common;
mod camera;
mod specimen;
mod stage;

pub use common::{
    CameraCommand, CommandLog, ErrorConfig, ErrorScenario, LoggedCommand, MockMode, MockRng,
    StageCommand, TimingConfig,
};

pub use camera::{SimulatedCamera, SimulatedCameraBuilder};
pub use specimen::{Specimen, SpecimenKind};
pub use stage::{SimulatedStage, SimulatedStageBuilder, TravelBounds};
