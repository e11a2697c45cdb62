//! Slide scan and autofocus orchestration.
//!
//! This crate is the control loop of the scanner. Given a stage and a camera
//! through the `scope-core` capability traits, it visits a raster grid of
//! fields across a slide, focuses each one and captures it.
//!
//! - [`grid`]: deterministic field ordering (boustrophedon or row-major)
//! - [`backlash`]: pre-load moves when an axis reverses
//! - [`autofocus`]: coarse-to-fine hill climb over the focus actuator
//! - [`orchestrator`]: the scan state machine, events and teardown
//! - [`report`]: per-field results and the final [`ScanRun`]
//! - [`sink`]: where captured frames go
//! - [`stop`] and [`lease`]: cancellation and host execution grants

pub mod autofocus;
pub mod backlash;
pub mod events;
pub mod grid;
pub mod lease;
pub mod orchestrator;
pub mod report;
pub mod sink;
pub mod stop;

pub use autofocus::{
    AutofocusController, AutofocusError, AutofocusFailure, AutofocusOutcome, AutofocusState,
};
pub use events::{ScanEvent, ScanState};
pub use grid::{GridPlan, GridPosition};
pub use lease::{ExecutionLease, LeaseProvider, LeaseToken, NoopLeaseProvider};
pub use orchestrator::ScanOrchestrator;
pub use report::{FieldAnnotation, FieldOutcome, FieldResult, ScanOutcome, ScanRun};
pub use sink::{DirectoryImageSink, ImageSink, MemoryImageSink};
pub use stop::{StopHandle, StopSignal, Stopped};
