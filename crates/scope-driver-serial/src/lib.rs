//! Serial stage-board driver.
//!
//! Implements [`scope_core::StageDriver`] for the stepper board over an ASCII
//! line protocol. Open a real port with [`SerialStage::new_async`], or hand
//! [`SerialStage::connect`] any `AsyncRead + AsyncWrite` transport.

pub mod protocol;
pub mod stage;

pub use stage::{RetryPolicy, SerialStage, DEFAULT_BAUD_RATE};
