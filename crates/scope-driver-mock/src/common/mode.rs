//! Operating modes of the simulated devices.

/// How a simulated device behaves in time and under failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MockMode {
    /// No delays. Focus readings are published synchronously with every
    /// actuator move, which makes scan tests deterministic.
    #[default]
    Instant,
    /// Motion takes `steps × step interval`; the camera streams preview
    /// frames from a background task at the configured frame period.
    Realistic,
    /// Realistic timing plus the random failures of the error config.
    Chaos,
}

impl MockMode {
    /// True when the device should spend wall-clock time.
    pub fn is_timed(&self) -> bool {
        !matches!(self, MockMode::Instant)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instant_is_default_and_untimed() {
        assert_eq!(MockMode::default(), MockMode::Instant);
        assert!(!MockMode::Instant.is_timed());
        assert!(MockMode::Chaos.is_timed());
    }
}
