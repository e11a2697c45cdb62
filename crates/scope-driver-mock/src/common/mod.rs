//! Shared infrastructure for the simulated devices.
//!
//! - **mode**: Instant, Realistic and Chaos operation
//! - **timing**: hardware-like delays for Realistic mode
//! - **errors**: error injection
//! - **rng**: seeded random source
//! - **log**: command log shared by stage and camera

pub mod errors;
pub mod log;
pub mod mode;
pub mod rng;
pub mod timing;

pub use errors::{ErrorConfig, ErrorScenario};
pub use log::{CameraCommand, CommandLog, LoggedCommand, StageCommand};
pub use mode::MockMode;
pub use rng::MockRng;
pub use timing::TimingConfig;
