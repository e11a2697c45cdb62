//! Stage, illumination and imaging-mode types shared by drivers and the scan engine.
//!
//! Stage coordinates are integer motor steps:
//!
//! - x: left (-) / right (+)
//! - y: down (-) / up (+)
//! - z: focus down (-) / focus up (+)

use serde::{Deserialize, Serialize};

// =============================================================================
// Axes and Directions
// =============================================================================

/// A stage axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Axis {
    /// Horizontal slide axis
    X,
    /// Vertical slide axis
    Y,
    /// Focus axis
    Z,
}

impl Axis {
    /// All axes in x, y, z order.
    pub const ALL: [Axis; 3] = [Axis::X, Axis::Y, Axis::Z];
}

impl std::fmt::Display for Axis {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Axis::X => write!(f, "x"),
            Axis::Y => write!(f, "y"),
            Axis::Z => write!(f, "z"),
        }
    }
}

/// Sign of a motion along a single axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AxisDirection {
    /// Decreasing step count
    Negative,
    /// Increasing step count
    Positive,
}

impl AxisDirection {
    /// Direction of travel for a signed step delta. `None` when the delta is zero.
    pub fn of_delta(delta: i64) -> Option<Self> {
        match delta.signum() {
            1 => Some(AxisDirection::Positive),
            -1 => Some(AxisDirection::Negative),
            _ => None,
        }
    }

    /// +1 or -1.
    pub fn sign(&self) -> i64 {
        match self {
            AxisDirection::Negative => -1,
            AxisDirection::Positive => 1,
        }
    }

    /// The opposite direction.
    pub fn reversed(&self) -> Self {
        match self {
            AxisDirection::Negative => AxisDirection::Positive,
            AxisDirection::Positive => AxisDirection::Negative,
        }
    }
}

/// Direction argument of the relative-move command, as the stage board names it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageDirection {
    /// +y
    Up,
    /// -y
    Down,
    /// -x
    Left,
    /// +x
    Right,
    /// +z
    FocusUp,
    /// -z
    FocusDown,
}

impl StageDirection {
    /// Board direction for an axis moving in `direction`.
    pub fn from_axis(axis: Axis, direction: AxisDirection) -> Self {
        match (axis, direction) {
            (Axis::X, AxisDirection::Negative) => StageDirection::Left,
            (Axis::X, AxisDirection::Positive) => StageDirection::Right,
            (Axis::Y, AxisDirection::Negative) => StageDirection::Down,
            (Axis::Y, AxisDirection::Positive) => StageDirection::Up,
            (Axis::Z, AxisDirection::Negative) => StageDirection::FocusDown,
            (Axis::Z, AxisDirection::Positive) => StageDirection::FocusUp,
        }
    }

    /// Axis this direction moves.
    pub fn axis(&self) -> Axis {
        match self {
            StageDirection::Left | StageDirection::Right => Axis::X,
            StageDirection::Up | StageDirection::Down => Axis::Y,
            StageDirection::FocusUp | StageDirection::FocusDown => Axis::Z,
        }
    }

    /// Sign of the motion along [`Self::axis`].
    pub fn axis_direction(&self) -> AxisDirection {
        match self {
            StageDirection::Right | StageDirection::Up | StageDirection::FocusUp => {
                AxisDirection::Positive
            }
            StageDirection::Left | StageDirection::Down | StageDirection::FocusDown => {
                AxisDirection::Negative
            }
        }
    }
}

// =============================================================================
// Positions and Stage State
// =============================================================================

/// Absolute stage position in motor steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct StagePosition {
    /// Left (-) / right (+)
    pub x: i64,
    /// Down (-) / up (+)
    pub y: i64,
    /// Focus down (-) / focus up (+)
    pub z: i64,
}

impl StagePosition {
    /// Create a position.
    pub const fn new(x: i64, y: i64, z: i64) -> Self {
        Self { x, y, z }
    }

    /// Coordinate along one axis.
    pub fn get(&self, axis: Axis) -> i64 {
        match axis {
            Axis::X => self.x,
            Axis::Y => self.y,
            Axis::Z => self.z,
        }
    }

    /// Copy with one coordinate replaced.
    pub fn with(mut self, axis: Axis, value: i64) -> Self {
        match axis {
            Axis::X => self.x = value,
            Axis::Y => self.y = value,
            Axis::Z => self.z = value,
        }
        self
    }
}

impl std::fmt::Display for StagePosition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {}, {})", self.x, self.y, self.z)
    }
}

/// Limit-switch state per axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LimitFlags {
    /// X limit switch closed
    pub x: bool,
    /// Y limit switch closed
    pub y: bool,
    /// Z limit switch closed
    pub z: bool,
}

impl LimitFlags {
    /// Flag for one axis.
    pub fn get(&self, axis: Axis) -> bool {
        match axis {
            Axis::X => self.x,
            Axis::Y => self.y,
            Axis::Z => self.z,
        }
    }

    /// Set the flag for one axis.
    pub fn set(&mut self, axis: Axis, value: bool) {
        match axis {
            Axis::X => self.x = value,
            Axis::Y => self.y = value,
            Axis::Z => self.z = value,
        }
    }

    /// True when any switch is closed.
    pub fn any(&self) -> bool {
        self.x || self.y || self.z
    }
}

/// Last commanded direction per axis. `None` until the axis has been moved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AxisDirections {
    /// X axis
    pub x: Option<AxisDirection>,
    /// Y axis
    pub y: Option<AxisDirection>,
    /// Z axis
    pub z: Option<AxisDirection>,
}

impl AxisDirections {
    /// Direction for one axis.
    pub fn get(&self, axis: Axis) -> Option<AxisDirection> {
        match axis {
            Axis::X => self.x,
            Axis::Y => self.y,
            Axis::Z => self.z,
        }
    }

    /// Record a commanded direction.
    pub fn set(&mut self, axis: Axis, direction: AxisDirection) {
        match axis {
            Axis::X => self.x = Some(direction),
            Axis::Y => self.y = Some(direction),
            Axis::Z => self.z = Some(direction),
        }
    }
}

/// Snapshot of the stage as owned by its driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StageState {
    /// Current position
    pub position: StagePosition,
    /// Limit switches observed during the last motion
    pub limits: LimitFlags,
    /// Link to the stage board is up
    pub connected: bool,
    /// Last commanded direction per axis
    pub last_direction: AxisDirections,
}

/// Preset stage positions known to the board firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NamedPosition {
    /// Slide loading position
    Loading,
    /// X/Y home
    Home,
    /// Calibration target
    TestTarget,
    /// Centre of a loaded slide
    SlideCenter,
    /// Focus axis home
    ZHome,
    /// Focus axis fully lowered
    ZDown,
}

// =============================================================================
// Illumination and Imaging Mode
// =============================================================================

/// Illumination LEDs on the stage board.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Led {
    /// Fluorescence excitation LED
    Fluorescent,
    /// Transmitted-light LED
    Brightfield,
}

/// Imaging mode of a scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImagingMode {
    /// Transmitted light; focus on sharpness
    #[default]
    Brightfield,
    /// Epi-fluorescence; focus on contrast
    Fluorescence,
}

impl ImagingMode {
    /// Focus metric the camera must publish for this mode.
    pub fn focus_mode(&self) -> FocusMode {
        match self {
            ImagingMode::Brightfield => FocusMode::Sharpness,
            ImagingMode::Fluorescence => FocusMode::Contrast,
        }
    }

    /// LED that illuminates this mode.
    pub fn led(&self) -> Led {
        match self {
            ImagingMode::Brightfield => Led::Brightfield,
            ImagingMode::Fluorescence => Led::Fluorescent,
        }
    }
}

impl std::fmt::Display for ImagingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ImagingMode::Brightfield => write!(f, "brightfield"),
            ImagingMode::Fluorescence => write!(f, "fluorescence"),
        }
    }
}

/// Which metric the camera's live focus signal reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FocusMode {
    /// Edge-gradient energy (brightfield)
    #[default]
    Sharpness,
    /// Normalized intensity spread (fluorescence)
    Contrast,
}

/// Per-channel white balance gains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WhiteBalance {
    /// Red gain
    pub red: u32,
    /// Green gain
    pub green: u32,
    /// Blue gain
    pub blue: u32,
}

impl Default for WhiteBalance {
    fn default() -> Self {
        Self {
            red: 1,
            green: 1,
            blue: 1,
        }
    }
}

/// Environmental and power readings reported by the stage board.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct BoardStatus {
    /// Battery voltage in volts
    pub battery_voltage: f32,
    /// Enclosure temperature in °C
    pub temperature: f32,
    /// Relative humidity in %
    pub humidity: f32,
    /// Firmware version reported by the board
    pub firmware_version: u32,
}
