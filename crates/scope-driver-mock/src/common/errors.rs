//! Error injection for the simulated devices.
//!
//! Every device operation calls [`ErrorConfig::check_operation`] with its
//! operation name (`"move_to"`, `"capture_image"`, ...) before acting. The
//! config decides from its scenarios and failure rates whether the call
//! fails and with which [`DriverErrorKind`].

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use scope_core::error::{DriverError, DriverErrorKind};

use super::rng::MockRng;

/// A scripted failure.
#[derive(Debug, Clone, PartialEq)]
pub enum ErrorScenario {
    /// `operation` succeeds `count` times, then fails with a hardware error.
    FailAfterN {
        /// Operation name
        operation: &'static str,
        /// Successful calls before failures start
        count: u32,
    },
    /// `operation` always times out.
    Timeout {
        /// Operation name
        operation: &'static str,
    },
    /// The link drops after `after` successful operations of any kind and
    /// stays down until [`ErrorConfig::reset`].
    CommunicationLoss {
        /// Successful operations before the drop
        after: u32,
    },
    /// The device latches a fault code on its first operation.
    HardwareFault {
        /// Fault code reported by the device
        code: u32,
    },
}

#[derive(Default, Debug)]
struct ErrorState {
    operation_counts: HashMap<&'static str, u32>,
    total_operations: u32,
    link_lost: bool,
    fault_code: u32,
}

/// Error injection configuration. Clones share state.
#[derive(Clone, Debug)]
pub struct ErrorConfig {
    failure_rates: Arc<HashMap<&'static str, f64>>,
    scenarios: Arc<Vec<ErrorScenario>>,
    rng: Arc<MockRng>,
    state: Arc<Mutex<ErrorState>>,
}

impl ErrorConfig {
    /// No injected failures.
    pub fn none() -> Self {
        Self::build(HashMap::new(), Vec::new(), None)
    }

    /// Every operation fails with probability `rate`.
    pub fn random_failures_seeded(rate: f64, seed: Option<u64>) -> Self {
        let mut rates = HashMap::new();
        rates.insert("*", rate);
        Self::build(rates, Vec::new(), seed)
    }

    /// Per-operation failure rates; `"*"` applies to operations not listed.
    pub fn with_rates(rates: HashMap<&'static str, f64>, seed: Option<u64>) -> Self {
        Self::build(rates, Vec::new(), seed)
    }

    /// A single scripted failure.
    pub fn scenario(scenario: ErrorScenario) -> Self {
        Self::scenarios(vec![scenario])
    }

    /// Several scripted failures, checked in order.
    pub fn scenarios(scenarios: Vec<ErrorScenario>) -> Self {
        Self::build(HashMap::new(), scenarios, None)
    }

    fn build(
        rates: HashMap<&'static str, f64>,
        scenarios: Vec<ErrorScenario>,
        seed: Option<u64>,
    ) -> Self {
        Self {
            failure_rates: Arc::new(rates),
            scenarios: Arc::new(scenarios),
            rng: Arc::new(MockRng::new(seed)),
            state: Arc::new(Mutex::new(ErrorState::default())),
        }
    }

    /// True once a communication-loss scenario has fired.
    pub fn link_lost(&self) -> bool {
        self.state.lock().link_lost
    }

    /// Decide whether `operation` fails.
    pub fn check_operation(
        &self,
        driver_type: &str,
        operation: &'static str,
    ) -> Result<(), DriverError> {
        let mut state = self.state.lock();

        if state.link_lost {
            return Err(DriverError::disconnected(driver_type));
        }
        if state.fault_code != 0 {
            return Err(DriverError::new(
                driver_type,
                DriverErrorKind::Hardware,
                format!("latched hardware fault {}", state.fault_code),
            ));
        }

        for scenario in self.scenarios.iter() {
            match scenario {
                ErrorScenario::FailAfterN {
                    operation: op,
                    count,
                } if *op == operation => {
                    let seen = state.operation_counts.entry(operation).or_insert(0);
                    *seen += 1;
                    if *seen > *count {
                        return Err(DriverError::new(
                            driver_type,
                            DriverErrorKind::Hardware,
                            format!("injected failure after {} '{}' calls", count, operation),
                        ));
                    }
                }
                ErrorScenario::Timeout { operation: op } if *op == operation => {
                    return Err(DriverError::new(
                        driver_type,
                        DriverErrorKind::Timeout,
                        format!("'{}' timed out", operation),
                    ));
                }
                ErrorScenario::CommunicationLoss { after } => {
                    if state.total_operations >= *after {
                        state.link_lost = true;
                        return Err(DriverError::disconnected(driver_type));
                    }
                }
                ErrorScenario::HardwareFault { code } => {
                    state.fault_code = *code;
                    return Err(DriverError::new(
                        driver_type,
                        DriverErrorKind::Hardware,
                        format!("hardware fault {}", code),
                    ));
                }
                _ => {}
            }
        }

        let rate = self
            .failure_rates
            .get(operation)
            .or_else(|| self.failure_rates.get("*"))
            .copied()
            .unwrap_or(0.0);
        if self.rng.should_fail(rate) {
            return Err(DriverError::new(
                driver_type,
                DriverErrorKind::Hardware,
                format!("random failure on '{}'", operation),
            ));
        }

        state.total_operations += 1;
        Ok(())
    }

    /// Clear counters, latched faults and lost links.
    pub fn reset(&self) {
        *self.state.lock() = ErrorState::default();
    }
}

impl Default for ErrorConfig {
    fn default() -> Self {
        Self::none()
    }
}
