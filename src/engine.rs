//! The fill engine: owns the active grid, applies capture commands, and
//! writes samples into the grid in arrival order.

use crate::command::CommandParser;
use crate::grid::{FillStep, Grid, GridAllocator};
use crate::packet::Sample;
use crate::queue::SampleConsumer;
use crate::sink::{CellPos, CellSink, CellValue, ChangeHandler, ChangeNotification, CompletionNotifier};
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiscardReason {
    NoGrid,
    GridFull,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FillOutcome {
    Written(CellPos),
    /// Written, and the grid is now complete. The notifier has been fired.
    Completed(CellPos),
    Discarded(DiscardReason),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FillStats {
    pub samples_written: u64,
    pub samples_discarded: u64,
    pub grids_allocated: u32,
    pub grids_completed: u32,
    pub grids_retired: u32,
    pub commands_ignored: u32,
}

type Clock = Box<dyn Fn() -> NaiveDateTime + Send>;

fn local_now() -> NaiveDateTime {
    chrono::Local::now().naive_local()
}

pub struct FillEngine<S: CellSink, N: CompletionNotifier> {
    parser: CommandParser,
    allocator: GridAllocator,
    sink: S,
    notifier: N,
    grid: Option<Grid>,
    clock: Clock,
    stats: FillStats,
}

impl<S: CellSink, N: CompletionNotifier> FillEngine<S, N> {
    pub fn new(parser: CommandParser, sink: S, notifier: N) -> Self {
        Self {
            parser,
            allocator: GridAllocator::new(),
            sink,
            notifier,
            grid: None,
            clock: Box::new(local_now),
            stats: FillStats::default(),
        }
    }

    /// Cap the number of sample targets a single command may reserve.
    pub fn with_max_targets(mut self, max_targets: usize) -> Self {
        self.allocator = self.allocator.with_max_targets(max_targets);
        self
    }

    /// Replace the wall clock used for timestamp cells.
    pub fn with_clock(mut self, clock: impl Fn() -> NaiveDateTime + Send + 'static) -> Self {
        self.clock = Box::new(clock);
        self
    }

    pub fn active_grid(&self) -> Option<&Grid> {
        self.grid.as_ref()
    }

    pub fn stats(&self) -> &FillStats {
        &self.stats
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }

    pub fn notifier(&self) -> &N {
        &self.notifier
    }

    pub fn into_sink(self) -> S {
        self.sink
    }

    /// Apply one host edit. Returns the new grid if the edit was a capture
    /// command; anything else is ignored without side effects.
    pub fn handle_change(&mut self, change: &ChangeNotification) -> Option<&Grid> {
        let Some(request) = self.parser.parse(&change.new_text) else {
            if self.parser.looks_like_command(&change.new_text) {
                debug!(
                    "Ignoring unrecognised command {:?} at {}!{}",
                    change.new_text, change.sheet, change.address
                );
                self.stats.commands_ignored = self.stats.commands_ignored.saturating_add(1);
            }
            return None;
        };

        if let Err(e) = self.allocator.check(change.address, &request) {
            warn!("Ignoring command {:?}: {}", change.new_text, e);
            self.stats.commands_ignored = self.stats.commands_ignored.saturating_add(1);
            return None;
        }

        // The command text is consumed; the grid may reuse this cell.
        self.sink
            .set_value(&change.sheet, change.address, CellValue::Empty);

        let stamped_at = (self.clock)();
        let grid = match self.allocator.allocate(
            &mut self.sink,
            &change.sheet,
            change.address,
            request,
            stamped_at,
        ) {
            Ok(grid) => grid,
            Err(e) => {
                warn!("Ignoring command {:?}: {}", change.new_text, e);
                self.stats.commands_ignored = self.stats.commands_ignored.saturating_add(1);
                return None;
            }
        };

        if let Some(old) = self.grid.replace(grid) {
            if !old.is_complete() {
                info!(
                    "Retired grid #{} with {}/{} cells filled",
                    old.id(),
                    old.next_index(),
                    old.positions().len()
                );
                self.stats.grids_retired = self.stats.grids_retired.saturating_add(1);
            }
        }
        self.stats.grids_allocated = self.stats.grids_allocated.saturating_add(1);

        self.grid.as_ref()
    }

    /// Route one sample into the active grid.
    pub fn on_sample(&mut self, sample: &Sample) -> FillOutcome {
        let Some(grid) = self.grid.as_mut() else {
            debug!("No active grid; discarding {:.1} nSv/h", sample.dose_nsv_per_h);
            self.stats.samples_discarded += 1;
            return FillOutcome::Discarded(DiscardReason::NoGrid);
        };

        let value = CellValue::Number(sample.dose_nsv_per_h);
        match grid.advance() {
            FillStep::Filled(pos) => {
                self.sink.set_value(grid.sheet(), pos, value);
                self.stats.samples_written += 1;
                FillOutcome::Written(pos)
            }
            FillStep::Completed(pos) => {
                self.sink.set_value(grid.sheet(), pos, value);
                self.stats.samples_written += 1;
                self.stats.grids_completed = self.stats.grids_completed.saturating_add(1);
                info!("Last sample collected for grid #{}", grid.id());
                self.notifier.notify_complete();
                FillOutcome::Completed(pos)
            }
            FillStep::Full => {
                debug!(
                    "Grid #{} already full; discarding {:.1} nSv/h",
                    grid.id(),
                    sample.dose_nsv_per_h
                );
                self.stats.samples_discarded += 1;
                FillOutcome::Discarded(DiscardReason::GridFull)
            }
        }
    }

    /// Drain every sample currently queued. Returns how many were taken.
    pub fn drain(&mut self, consumer: &SampleConsumer) -> usize {
        let mut taken = 0;
        while let Ok(sample) = consumer.try_pop() {
            self.on_sample(&sample);
            taken += 1;
        }
        taken
    }
}

impl<S: CellSink, N: CompletionNotifier> ChangeHandler for FillEngine<S, N> {
    fn on_change(&mut self, change: &ChangeNotification) {
        self.handle_change(change);
    }
}
