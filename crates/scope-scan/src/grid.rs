//! Grid planning.
//!
//! The grid is computed once per run from the configuration and the origin
//! and is read-only during traversal. Both raster orders are deterministic:
//! the same configuration and origin always yield the same sequence.

use scope_core::config::{RasterOrder, ScanConfiguration};
use scope_core::error::{ScopeError, ScopeResult};
use scope_core::types::StagePosition;
use serde::{Deserialize, Serialize};

/// One cell of the scan grid with its absolute stage target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GridPosition {
    /// Zero-based row
    pub row: u32,
    /// Zero-based column
    pub column: u32,
    /// Stage target for this field
    pub target: StagePosition,
}

impl std::fmt::Display for GridPosition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {}) @ {}", self.row, self.column, self.target)
    }
}

/// Ordered list of fields to visit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GridPlan {
    fields: Vec<GridPosition>,
}

impl GridPlan {
    /// Plan the grid of `config` starting at `origin` (field (0, 0)).
    ///
    /// Rows advance along +y, columns along +x. The focus axis keeps the
    /// origin's z for every field.
    ///
    /// # Errors
    ///
    /// `ConfigurationInvalid` when a field target would leave the step range.
    pub fn new(config: &ScanConfiguration, origin: StagePosition) -> ScopeResult<Self> {
        if config.grid_extent(origin).is_none() {
            return Err(ScopeError::ConfigurationInvalid(format!(
                "{}x{} grid from {} overflows the stage range",
                config.rows, config.columns, origin
            )));
        }

        // Every target lies between the origin and the checked extent.
        let mut fields = Vec::with_capacity(config.field_count());
        for row in 0..config.rows {
            let reversed = config.order == RasterOrder::Boustrophedon && row % 2 == 1;
            for i in 0..config.columns {
                let column = if reversed { config.columns - 1 - i } else { i };
                fields.push(GridPosition {
                    row,
                    column,
                    target: StagePosition::new(
                        origin.x + i64::from(column) * config.spacing.x,
                        origin.y + i64::from(row) * config.spacing.y,
                        origin.z,
                    ),
                });
            }
        }
        Ok(Self { fields })
    }

    /// Fields in traversal order.
    pub fn fields(&self) -> &[GridPosition] {
        &self.fields
    }

    /// Number of fields.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// True for an empty plan.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}
