//! Scan configuration.
//!
//! Loaded with Figment from a TOML file merged with `SCOPE_`-prefixed
//! environment variables (nested keys separated by `__`, e.g.
//! `SCOPE_AUTOFOCUS__MAX_STEPS=30`). Durations use humantime strings
//! (`"250ms"`, `"2s"`).
//!
//! A configuration is validated once before a run and is immutable for the
//! duration of that run.
//!
//! ```toml
//! rows = 4
//! columns = 6
//! spacing = { x = 500, y = 500 }
//! refocus_interval = 3
//! imaging_mode = "fluorescence"
//!
//! [fluorescence]
//! exposure_ms = 250.0
//! iso = 800
//! illumination = 255
//! ```

use std::path::Path;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{ScopeError, ScopeResult};
use crate::limits::INFINITY_FOCUS_POSITION;
use crate::types::{ImagingMode, NamedPosition, StagePosition, WhiteBalance};

/// Environment variable prefix for configuration overrides.
pub const ENV_PREFIX: &str = "SCOPE_";

// =============================================================================
// Policies
// =============================================================================

/// Order in which grid cells are visited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RasterOrder {
    /// Alternate column direction on every row (snake).
    #[default]
    Boustrophedon,
    /// Every row left to right.
    RowMajor,
}

/// What happens on fields between scheduled refocus points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FocusPolicy {
    /// Keep the last converged actuator position.
    #[default]
    ReuseBetweenRefocus,
    /// Run autofocus on every field.
    EveryField,
}

/// Response to a limit hit, motion timeout or missing frame on a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageFaultPolicy {
    /// End the run at the faulting field.
    #[default]
    Abort,
    /// Record the fault and continue with the next field.
    Skip,
}

// =============================================================================
// Sections
// =============================================================================

/// Distance between neighbouring fields, in stage steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSpacing {
    /// Column pitch
    pub x: i64,
    /// Row pitch
    pub y: i64,
}

impl Default for FieldSpacing {
    fn default() -> Self {
        Self { x: 100, y: 100 }
    }
}

/// Camera and illumination settings for one imaging mode.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModeSettings {
    /// Exposure duration in milliseconds
    pub exposure_ms: f64,
    /// Sensor ISO
    pub iso: u32,
    /// White balance gains
    pub white_balance: WhiteBalance,
    /// LED level, 0-255
    pub illumination: u8,
}

impl ModeSettings {
    fn brightfield() -> Self {
        Self {
            exposure_ms: 5.0,
            iso: 100,
            white_balance: WhiteBalance::default(),
            illumination: 60,
        }
    }

    fn fluorescence() -> Self {
        Self {
            exposure_ms: 200.0,
            iso: 800,
            white_balance: WhiteBalance::default(),
            illumination: 255,
        }
    }
}

impl Default for ModeSettings {
    fn default() -> Self {
        Self::brightfield()
    }
}

/// Autofocus search parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutofocusConfig {
    /// Lower bound of the actuator range
    pub min_position: f64,
    /// Upper bound of the actuator range (infinity)
    pub max_position: f64,
    /// Initial step size
    pub coarse_step: f64,
    /// Smallest step before the search is considered converged
    pub fine_step: f64,
    /// Step multiplier applied on every reversal (0 < f < 1)
    pub refine_factor: f64,
    /// Relative improvement below which a step counts as "no improvement"
    pub tolerance: f64,
    /// Actuator moves allowed per attempt
    pub max_steps: u32,
    /// Scores at or below this are not usable
    pub min_usable_metric: f64,
    /// Wait for a fresh focus reading after a move
    #[serde(with = "humantime_serde")]
    pub sample_timeout: Duration,
    /// Wall-clock limit for one attempt
    #[serde(with = "humantime_serde")]
    pub attempt_timeout: Duration,
}

impl Default for AutofocusConfig {
    fn default() -> Self {
        Self {
            min_position: 0.0,
            max_position: INFINITY_FOCUS_POSITION,
            coarse_step: 0.1,
            fine_step: 0.005,
            refine_factor: 0.5,
            tolerance: 0.01,
            max_steps: 40,
            min_usable_metric: 1e-4,
            sample_timeout: Duration::from_secs(2),
            attempt_timeout: Duration::from_secs(30),
        }
    }
}

/// Thresholds for the empty-field and boundary-field annotations.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityThresholds {
    /// Sharpness below which a field is annotated `empty`
    pub empty_field_threshold: f64,
    /// Boundary score above which a field is annotated `boundary`
    pub boundary_field_threshold: f64,
}

impl Default for QualityThresholds {
    fn default() -> Self {
        Self {
            empty_field_threshold: 1e-4,
            boundary_field_threshold: 0.5,
        }
    }
}

// =============================================================================
// Scan Configuration
// =============================================================================

/// Everything a scan run needs to know, fixed for the run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfiguration {
    /// Grid rows (≥ 1)
    pub rows: u32,
    /// Grid columns (≥ 1)
    pub columns: u32,
    /// Field pitch in steps (> 0 on both axes)
    pub spacing: FieldSpacing,
    /// Stage position of field (0, 0). `None` starts from wherever the stage is.
    pub origin: Option<StagePosition>,
    /// Traversal order
    pub order: RasterOrder,

    /// Autofocus on the first field and every Nth field after it
    pub refocus_interval: u32,
    /// Behaviour on fields between refocus points
    pub focus_policy: FocusPolicy,
    /// Autofocus attempts on one field before it is recorded as failed
    pub autofocus_attempts_per_field: u32,
    /// Failed attempts tolerated before the run is aborted
    pub max_autofocus_failures: u32,
    /// Capture at the best-effort position when autofocus fails
    pub capture_on_autofocus_failure: bool,

    /// Wait after a focus actuator move
    #[serde(with = "humantime_serde")]
    pub focus_settling_time: Duration,
    /// Wait after a stage move completes
    #[serde(with = "humantime_serde")]
    pub stage_settling_time: Duration,
    /// Actuator step pacing
    #[serde(with = "humantime_serde")]
    pub focus_step_duration: Duration,
    /// Stage step pacing, also used to size motion timeouts
    #[serde(with = "humantime_serde")]
    pub stage_step_duration: Duration,
    /// Backlash compensation in stage steps, applied when an axis reverses
    pub backlash: u32,
    /// Response to stage faults and capture failures
    pub stage_fault_policy: StageFaultPolicy,

    /// Active imaging mode
    pub imaging_mode: ImagingMode,
    /// Brightfield camera/illumination settings
    pub brightfield: ModeSettings,
    /// Fluorescence camera/illumination settings
    pub fluorescence: ModeSettings,

    /// Autofocus search parameters
    pub autofocus: AutofocusConfig,
    /// Field annotation thresholds
    pub quality: QualityThresholds,
    /// Preset visited after a completed run
    pub park_position: Option<NamedPosition>,
}

impl Default for ScanConfiguration {
    fn default() -> Self {
        Self {
            rows: 1,
            columns: 1,
            spacing: FieldSpacing::default(),
            origin: None,
            order: RasterOrder::default(),
            refocus_interval: 1,
            focus_policy: FocusPolicy::default(),
            autofocus_attempts_per_field: 1,
            max_autofocus_failures: 3,
            capture_on_autofocus_failure: true,
            focus_settling_time: Duration::from_millis(100),
            stage_settling_time: Duration::from_millis(200),
            focus_step_duration: Duration::from_millis(10),
            stage_step_duration: Duration::from_micros(500),
            backlash: 0,
            stage_fault_policy: StageFaultPolicy::default(),
            imaging_mode: ImagingMode::default(),
            brightfield: ModeSettings::brightfield(),
            fluorescence: ModeSettings::fluorescence(),
            autofocus: AutofocusConfig::default(),
            quality: QualityThresholds::default(),
            park_position: None,
        }
    }
}

impl ScanConfiguration {
    /// Load from a TOML file, overridden by `SCOPE_*` environment variables.
    ///
    /// The result is validated.
    pub fn load_from<P: AsRef<Path>>(path: P) -> ScopeResult<Self> {
        let config: Self = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;
        config.validate()?;
        debug!(
            path = %path.as_ref().display(),
            rows = config.rows,
            columns = config.columns,
            mode = %config.imaging_mode,
            "scan configuration loaded"
        );
        Ok(config)
    }

    /// Parse a TOML document (no environment overrides). The result is validated.
    pub fn from_toml_str(toml: &str) -> ScopeResult<Self> {
        let config: Self = Figment::new()
            .merge(Toml::string(toml))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Settings of the active imaging mode.
    pub fn mode_settings(&self) -> &ModeSettings {
        match self.imaging_mode {
            ImagingMode::Brightfield => &self.brightfield,
            ImagingMode::Fluorescence => &self.fluorescence,
        }
    }

    /// Number of fields in the grid.
    pub fn field_count(&self) -> usize {
        self.rows as usize * self.columns as usize
    }

    /// Stage position of the grid corner opposite `origin`.
    ///
    /// `None` when some field target would leave the `i64` step range.
    pub fn grid_extent(&self, origin: StagePosition) -> Option<StagePosition> {
        let far = |count: u32, spacing: i64, start: i64| {
            i64::from(count.saturating_sub(1))
                .checked_mul(spacing)
                .and_then(|span| start.checked_add(span))
        };
        Some(StagePosition::new(
            far(self.columns, self.spacing.x, origin.x)?,
            far(self.rows, self.spacing.y, origin.y)?,
            origin.z,
        ))
    }

    /// Semantic validation. Run before any hardware command.
    pub fn validate(&self) -> ScopeResult<()> {
        let invalid = |msg: String| {
            warn!(reason = %msg, "scan configuration rejected");
            Err(ScopeError::ConfigurationInvalid(msg))
        };

        if self.rows == 0 || self.columns == 0 {
            return invalid(format!(
                "grid must have at least one row and column, got {}x{}",
                self.rows, self.columns
            ));
        }
        if self.spacing.x <= 0 || self.spacing.y <= 0 {
            return invalid(format!(
                "field spacing must be positive, got ({}, {})",
                self.spacing.x, self.spacing.y
            ));
        }
        // Without a fixed origin the grid starts wherever the stage is, so
        // only the span itself can be checked here.
        let origin = self.origin.unwrap_or_default();
        if self.grid_extent(origin).is_none() {
            return invalid(format!(
                "{}x{} grid with spacing ({}, {}) from {} overflows the stage range",
                self.rows, self.columns, self.spacing.x, self.spacing.y, origin
            ));
        }
        if self.refocus_interval == 0 {
            return invalid("refocus_interval must be at least 1".into());
        }
        if self.autofocus_attempts_per_field == 0 {
            return invalid("autofocus_attempts_per_field must be at least 1".into());
        }

        let af = &self.autofocus;
        let finite = [
            af.min_position,
            af.max_position,
            af.coarse_step,
            af.fine_step,
            af.refine_factor,
            af.tolerance,
            af.min_usable_metric,
        ];
        if finite.iter().any(|v| !v.is_finite()) {
            return invalid("autofocus parameters must be finite".into());
        }
        if af.min_position < 0.0 || af.max_position > INFINITY_FOCUS_POSITION {
            return invalid(format!(
                "focus range must lie within [0, {}], got [{}, {}]",
                INFINITY_FOCUS_POSITION, af.min_position, af.max_position
            ));
        }
        if af.min_position >= af.max_position {
            return invalid(format!(
                "focus range is empty: min {} >= max {}",
                af.min_position, af.max_position
            ));
        }
        if af.fine_step <= 0.0 || af.coarse_step < af.fine_step {
            return invalid(format!(
                "focus steps must satisfy 0 < fine_step <= coarse_step, got fine {} coarse {}",
                af.fine_step, af.coarse_step
            ));
        }
        if !(af.refine_factor > 0.0 && af.refine_factor < 1.0) {
            return invalid(format!(
                "refine_factor must be in (0, 1), got {}",
                af.refine_factor
            ));
        }
        if af.tolerance < 0.0 {
            return invalid("autofocus tolerance must not be negative".into());
        }
        if af.max_steps == 0 {
            return invalid("autofocus max_steps must be at least 1".into());
        }
        if af.sample_timeout.is_zero() || af.attempt_timeout.is_zero() {
            return invalid("autofocus timeouts must be non-zero".into());
        }

        let modes = [
            ("brightfield", &self.brightfield),
            ("fluorescence", &self.fluorescence),
        ];
        for (name, mode) in modes {
            if !(mode.exposure_ms.is_finite() && mode.exposure_ms > 0.0) {
                return invalid(format!("{} exposure_ms must be positive", name));
            }
            if mode.iso == 0 {
                return invalid(format!("{} iso must be positive", name));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_valid() {
        ScanConfiguration::default().validate().unwrap();
    }

    #[test]
    fn parses_toml_with_durations_and_sections() {
        let config = ScanConfiguration::from_toml_str(
            r#"
            rows = 2
            columns = 3
            spacing = { x = 250, y = 400 }
            order = "row_major"
            stage_settling_time = "1s"
            focus_settling_time = "50ms"
            stage_fault_policy = "skip"
            imaging_mode = "fluorescence"
            park_position = "loading"

            [fluorescence]
            exposure_ms = 120.0
            iso = 1600

            [autofocus]
            coarse_step = 0.2
            "#,
        )
        .unwrap();

        assert_eq!(config.field_count(), 6);
        assert_eq!(config.spacing, FieldSpacing { x: 250, y: 400 });
        assert_eq!(config.order, RasterOrder::RowMajor);
        assert_eq!(config.stage_settling_time, Duration::from_secs(1));
        assert_eq!(config.focus_settling_time, Duration::from_millis(50));
        assert_eq!(config.stage_fault_policy, StageFaultPolicy::Skip);
        assert_eq!(config.park_position, Some(NamedPosition::Loading));
        assert_eq!(config.mode_settings().iso, 1600);
        // Unspecified keys in a section keep their defaults.
        assert_eq!(config.fluorescence.illumination, 255);
        assert_eq!(config.autofocus.coarse_step, 0.2);
        assert_eq!(config.autofocus.max_position, INFINITY_FOCUS_POSITION);
    }

    #[test]
    fn rejects_empty_grid() {
        let err = ScanConfiguration::from_toml_str("rows = 0").unwrap_err();
        assert!(matches!(err, ScopeError::ConfigurationInvalid(_)));
    }

    #[test]
    fn rejects_non_positive_spacing() {
        let mut config = ScanConfiguration::default();
        config.spacing.y = 0;
        assert!(matches!(
            config.validate(),
            Err(ScopeError::ConfigurationInvalid(_))
        ));
    }

    #[test]
    fn rejects_grid_beyond_step_range() {
        let mut config = ScanConfiguration {
            rows: 1,
            columns: 4,
            ..ScanConfiguration::default()
        };
        config.spacing.x = i64::MAX / 2;
        assert!(matches!(
            config.validate(),
            Err(ScopeError::ConfigurationInvalid(_))
        ));
        assert_eq!(config.grid_extent(StagePosition::default()), None);

        // The same span fits once it is three columns wide.
        config.columns = 3;
        config.validate().unwrap();

        // A fixed origin counts toward the range.
        config.origin = Some(StagePosition::new(10, 0, 0));
        assert!(config.validate().is_err());
        config.origin = Some(StagePosition::new(-10, 0, 0));
        config.validate().unwrap();
    }

    #[test]
    fn grid_extent_is_the_far_corner() {
        let mut config = ScanConfiguration {
            rows: 3,
            columns: 2,
            ..ScanConfiguration::default()
        };
        config.spacing.x = 100;
        config.spacing.y = 250;
        assert_eq!(
            config.grid_extent(StagePosition::new(10, 20, 7)),
            Some(StagePosition::new(110, 520, 7))
        );
    }

    #[test]
    fn rejects_inverted_focus_range() {
        let mut config = ScanConfiguration::default();
        config.autofocus.min_position = 0.8;
        config.autofocus.max_position = 0.2;
        assert!(config.validate().is_err());

        config.autofocus.min_position = 0.0;
        config.autofocus.max_position = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn malformed_toml_is_a_config_error() {
        let err = ScanConfiguration::from_toml_str("rows = \"many\"").unwrap_err();
        assert!(matches!(err, ScopeError::Config(_)));
    }

    #[test]
    fn loads_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "rows = 3\ncolumns = 2\nbacklash = 12").unwrap();

        let config = ScanConfiguration::load_from(file.path()).unwrap();
        assert_eq!(config.rows, 3);
        assert_eq!(config.columns, 2);
        assert_eq!(config.backlash, 12);
    }
}
