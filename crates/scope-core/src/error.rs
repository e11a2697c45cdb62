//! Error types for the scanner.
//!
//! Two layers, mirroring how the drivers and the orchestrator see failures:
//!
//! - **`DriverError`**: returned by every capability method on a stage or
//!   camera driver. It carries a [`DriverErrorKind`] so the orchestrator can
//!   classify a failure (disconnect, timeout, limit, ...) without inspecting
//!   message strings.
//! - **`ScopeError`**: the application error. Wraps configuration loading,
//!   semantic validation, driver failures and I/O.
//!
//! Run outcomes never surface as `Err`. A scan that stops early reports an
//! [`AbortReason`] inside its `ScanRun` so the reporting collaborator can
//! consume it as data.

use serde::{Deserialize, Serialize};
use thiserror::Error;

// =============================================================================
// Driver Errors
// =============================================================================

/// Failure category reported by a hardware driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriverErrorKind {
    /// Driver could not be brought up.
    Initialization,
    /// Device is not connected, or the link dropped mid-command.
    Disconnected,
    /// Command was not answered or motion did not complete in time.
    Timeout,
    /// A limit switch stopped the motion.
    Limit,
    /// Device reported a fault.
    Hardware,
    /// Argument outside what the device accepts.
    InvalidParameter,
    /// Device answered with something the driver cannot parse.
    Protocol,
    /// The camera produced no frame.
    NoFrame,
}

impl std::fmt::Display for DriverErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            DriverErrorKind::Initialization => "initialization",
            DriverErrorKind::Disconnected => "disconnected",
            DriverErrorKind::Timeout => "timeout",
            DriverErrorKind::Limit => "limit",
            DriverErrorKind::Hardware => "hardware",
            DriverErrorKind::InvalidParameter => "invalid_parameter",
            DriverErrorKind::Protocol => "protocol",
            DriverErrorKind::NoFrame => "no_frame",
        };
        write!(f, "{}", label)
    }
}

/// Structured error returned by stage and camera drivers.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("Driver '{driver_type}' {kind} error: {message}")]
pub struct DriverError {
    /// Driver identifier, e.g. `"simulated_stage"`.
    pub driver_type: String,
    /// Failure category.
    pub kind: DriverErrorKind,
    /// Human readable detail.
    pub message: String,
}

impl DriverError {
    /// Create a new driver error.
    pub fn new(
        driver_type: impl Into<String>,
        kind: DriverErrorKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            driver_type: driver_type.into(),
            kind,
            message: message.into(),
        }
    }

    /// Shorthand for a [`DriverErrorKind::Disconnected`] error.
    pub fn disconnected(driver_type: impl Into<String>) -> Self {
        Self::new(driver_type, DriverErrorKind::Disconnected, "device not connected")
    }

    /// True when the device is no longer reachable.
    pub fn is_disconnect(&self) -> bool {
        self.kind == DriverErrorKind::Disconnected
    }
}

/// Result alias used by every capability trait method.
pub type DriverResult<T> = std::result::Result<T, DriverError>;

// =============================================================================
// Application Error
// =============================================================================

/// Convenience alias for results using the application error type.
pub type ScopeResult<T> = std::result::Result<T, ScopeError>;

/// Primary error type for the scanner.
#[derive(Error, Debug)]
pub enum ScopeError {
    /// Configuration file or environment could not be parsed.
    ///
    /// **Recovery Strategy**: fix the TOML file or the `SCOPE_*` variables.
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// Configuration parsed but is semantically invalid (rows = 0, negative
    /// spacing, inverted focus range, ...). Always raised before a run starts.
    #[error("Configuration validation error: {0}")]
    ConfigurationInvalid(String),

    /// Structured driver error.
    #[error("{0}")]
    Driver(#[from] DriverError),

    /// Standard I/O failure (sinks, serial port opening).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A scan is already in progress on this orchestrator.
    #[error("A scan is already running")]
    ScanInProgress,
}

impl From<figment::Error> for ScopeError {
    fn from(err: figment::Error) -> Self {
        ScopeError::Config(Box::new(err))
    }
}

// =============================================================================
// Run Abort Reasons
// =============================================================================

/// Machine-readable reason attached to every non-completed scan outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AbortReason {
    /// Stage or camera reported not-connected.
    HardwareDisconnected,
    /// Limit switch hit or motion timed out on a field (abort policy).
    StageFault,
    /// Camera returned no frame (abort policy).
    CaptureFailed,
    /// More autofocus failures than the configured budget allows.
    AutofocusBudgetExceeded,
    /// External stop request.
    Cancelled,
    /// A driver reported an error the run cannot classify as a field fault.
    DriverFault,
}

impl AbortReason {
    /// Stable reason code, identical to the serialized form.
    pub fn code(&self) -> &'static str {
        match self {
            AbortReason::HardwareDisconnected => "hardware-disconnected",
            AbortReason::StageFault => "stage-fault",
            AbortReason::CaptureFailed => "capture-failed",
            AbortReason::AutofocusBudgetExceeded => "autofocus-budget-exceeded",
            AbortReason::Cancelled => "cancelled",
            AbortReason::DriverFault => "driver-fault",
        }
    }
}

impl std::fmt::Display for AbortReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}
