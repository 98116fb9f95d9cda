//! Destination layouts for capture commands.
//!
//! A [`Grid`] is the ordered list of cells a capture fills, plus the one-way
//! `Filling -> Complete` state machine that guarantees the completion event
//! fires exactly once.

use crate::command::AllocationRequest;
use crate::sink::{CellPos, CellSink, CellValue};
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Last addressable row and column of a host sheet.
pub const MAX_ROW: u32 = 1_048_576;
pub const MAX_COL: u32 = 16_384;

/// Default cap on sample targets per grid.
pub const DEFAULT_MAX_TARGETS: usize = 1_048_576;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum GridError {
    #[error("a {rows}x{cols} grid anchored at {anchor} runs past the sheet edge")]
    OutOfRange { anchor: CellPos, rows: u32, cols: u32 },
    #[error("a grid of {targets} cells exceeds the limit of {limit}")]
    TooLarge { targets: u64, limit: usize },
}

/// Cell layout of a request, before anything is written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Layout {
    /// Sample targets in fill order (row-major).
    pub positions: Vec<CellPos>,
    /// One leading cell per row when the request carries a timestamp column.
    pub timestamp_cells: Vec<CellPos>,
}

/// Reject a request that leaves the sheet or holds more than `max_targets`
/// cells. Allocates nothing.
pub fn check_bounds(
    anchor: CellPos,
    request: &AllocationRequest,
    max_targets: usize,
) -> Result<(), GridError> {
    let targets = u64::from(request.rows) * u64::from(request.cols);
    if targets > max_targets as u64 {
        return Err(GridError::TooLarge {
            targets,
            limit: max_targets,
        });
    }

    let out_of_range = GridError::OutOfRange {
        anchor,
        rows: request.rows,
        cols: request.cols,
    };
    let last_row = anchor.row.checked_add(request.rows.saturating_sub(1));
    let last_col = anchor
        .col
        .checked_add(u32::from(request.include_timestamp_column))
        .and_then(|col| col.checked_add(request.cols.saturating_sub(1)));
    match (last_row, last_col) {
        (Some(row), Some(col)) if row <= MAX_ROW && col <= MAX_COL => Ok(()),
        _ => Err(out_of_range),
    }
}

/// Compute the cells a request occupies when anchored at `anchor`.
pub fn layout(
    anchor: CellPos,
    request: &AllocationRequest,
    max_targets: usize,
) -> Result<Layout, GridError> {
    check_bounds(anchor, request, max_targets)?;
    let col_offset = u32::from(request.include_timestamp_column);

    let mut positions = Vec::with_capacity(request.target_count());
    let mut timestamp_cells = Vec::new();

    // Bounds are checked above, so none of this can wrap.
    for row in (0..request.rows).map(|r| anchor.row + r) {
        if request.include_timestamp_column {
            timestamp_cells.push(CellPos::new(row, anchor.col));
        }
        for c in 0..request.cols {
            positions.push(CellPos::new(row, anchor.col + col_offset + c));
        }
    }

    Ok(Layout {
        positions,
        timestamp_cells,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GridState {
    Filling,
    Complete,
}

/// Outcome of claiming the next target cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FillStep {
    /// Cell claimed; more remain.
    Filled(CellPos),
    /// Cell claimed and it was the last one. Reported once per grid.
    Completed(CellPos),
    /// Nothing left to claim.
    Full,
}

/// Built only by [`GridAllocator`]. `next_index` never exceeds
/// `positions.len()`, and `state` is `Filling` only while targets remain.
#[derive(Debug, Clone, Serialize)]
pub struct Grid {
    id: u64,
    sheet: String,
    anchor: CellPos,
    request: AllocationRequest,
    positions: Vec<CellPos>,
    timestamp_cells: Vec<CellPos>,
    next_index: usize,
    state: GridState,
}

impl Grid {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn sheet(&self) -> &str {
        &self.sheet
    }

    pub fn anchor(&self) -> CellPos {
        self.anchor
    }

    pub fn request(&self) -> &AllocationRequest {
        &self.request
    }

    pub fn positions(&self) -> &[CellPos] {
        &self.positions
    }

    pub fn timestamp_cells(&self) -> &[CellPos] {
        &self.timestamp_cells
    }

    pub fn next_index(&self) -> usize {
        self.next_index
    }

    pub fn remaining(&self) -> usize {
        self.positions.len() - self.next_index
    }

    pub fn state(&self) -> GridState {
        self.state
    }

    pub fn is_complete(&self) -> bool {
        self.state == GridState::Complete
    }

    /// Claim the next target cell.
    pub fn advance(&mut self) -> FillStep {
        match self.state {
            GridState::Complete => FillStep::Full,
            GridState::Filling => {
                let pos = self.positions[self.next_index];
                self.next_index += 1;
                if self.next_index == self.positions.len() {
                    self.state = GridState::Complete;
                    FillStep::Completed(pos)
                } else {
                    FillStep::Filled(pos)
                }
            }
        }
    }
}

/// Turns allocation requests into fresh grids.
#[derive(Debug)]
pub struct GridAllocator {
    next_id: u64,
    max_targets: usize,
}

impl Default for GridAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl GridAllocator {
    pub fn new() -> Self {
        Self {
            next_id: 1,
            max_targets: DEFAULT_MAX_TARGETS,
        }
    }

    pub fn with_max_targets(mut self, max_targets: usize) -> Self {
        self.max_targets = max_targets;
        self
    }

    pub fn max_targets(&self) -> usize {
        self.max_targets
    }

    /// Validate a request against the sheet edge and the target cap.
    pub fn check(&self, anchor: CellPos, request: &AllocationRequest) -> Result<(), GridError> {
        check_bounds(anchor, request, self.max_targets)
    }

    /// Lay out a new grid at `anchor` on `sheet`.
    ///
    /// Timestamp cells are written with `stamped_at` and every sample target
    /// is cleared, both immediately.
    pub fn allocate<S: CellSink + ?Sized>(
        &mut self,
        sink: &mut S,
        sheet: &str,
        anchor: CellPos,
        request: AllocationRequest,
        stamped_at: NaiveDateTime,
    ) -> Result<Grid, GridError> {
        let Layout {
            positions,
            timestamp_cells,
        } = layout(anchor, &request, self.max_targets)?;

        let stamp = stamped_at.format(TIMESTAMP_FORMAT).to_string();
        for &cell in &timestamp_cells {
            sink.set_value(sheet, cell, CellValue::Text(stamp.clone()));
        }
        for &cell in &positions {
            sink.set_value(sheet, cell, CellValue::Empty);
        }

        let id = self.next_id.max(1);
        self.next_id = id.wrapping_add(1);

        let state = if positions.is_empty() {
            GridState::Complete
        } else {
            GridState::Filling
        };

        info!(
            "Grid #{} allocated on {} at {}: {}x{} ({} targets{})",
            id,
            sheet,
            anchor,
            request.rows,
            request.cols,
            positions.len(),
            if request.include_timestamp_column {
                ", timestamped"
            } else {
                ""
            }
        );

        Ok(Grid {
            id,
            sheet: sheet.to_string(),
            anchor,
            request,
            positions,
            timestamp_cells,
            next_index: 0,
            state,
        })
    }
}
