//! Backlash compensation planning.
//!
//! Lead-screw slack shows up whenever an axis reverses. Before the absolute
//! move to a field, every reversing axis is first pre-loaded: it steps
//! `backlash` further in the direction it was last commanded in, so the
//! following approach to the target travels the nominal distance plus
//! `backlash` in the new direction. The extra steps are absorbed by the
//! slack and the carriage stops on the target. The final approach always
//! runs in the new direction, so repeating a direction never triggers
//! compensation.

use scope_core::types::{Axis, AxisDirection, StageDirection, StagePosition, StageState};

/// One pre-load move issued before the absolute move to a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TakeUp {
    /// Axis being compensated
    pub axis: Axis,
    /// Board direction of the pre-load (the previous travel direction)
    pub direction: StageDirection,
    /// Backlash in steps
    pub steps: u32,
}

impl TakeUp {
    /// Position the stage reports once this pre-load has run from `from`.
    pub fn apply(&self, from: StagePosition) -> StagePosition {
        let sign = self.direction.axis_direction().sign();
        let value = from
            .get(self.axis)
            .saturating_add(sign.saturating_mul(i64::from(self.steps)));
        from.with(self.axis, value)
    }
}

/// Pre-load moves needed before travelling from `state` to `target`.
///
/// Compensation applies to an axis iff it has a recorded last direction and
/// the move to `target` reverses it. Axes that do not move are untouched.
pub fn plan(state: &StageState, target: StagePosition, backlash: u32) -> Vec<TakeUp> {
    if backlash == 0 {
        return Vec::new();
    }

    Axis::ALL
        .iter()
        .filter_map(|&axis| {
            let delta = target.get(axis) - state.position.get(axis);
            let direction = AxisDirection::of_delta(delta)?;
            let last = state.last_direction.get(axis)?;
            if last == direction {
                return None;
            }
            Some(TakeUp {
                axis,
                direction: StageDirection::from_axis(axis, last),
                steps: backlash,
            })
        })
        .collect()
}

/// Where the absolute approach starts once every pre-load in `take_ups` ran.
pub fn approach_start(from: StagePosition, take_ups: &[TakeUp]) -> StagePosition {
    take_ups.iter().fold(from, |position, take_up| take_up.apply(position))
}

/// Largest single-axis travel from `from` to `to`, in steps.
pub fn max_travel(from: StagePosition, to: StagePosition) -> u64 {
    Axis::ALL
        .iter()
        .map(|&axis| (to.get(axis) - from.get(axis)).unsigned_abs())
        .max()
        .unwrap_or(0)
}
