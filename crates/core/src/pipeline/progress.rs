//! Progress folding.
//!
//! Stage percentages are `floor((done + in-flight fractions) / total * 100)`
//! and the overall percentage is the floored mean of the two stages. The
//! reported values never go backwards within a run.

use std::collections::HashMap;

/// Percentage of a stage, floored and clamped to 0..=100.
pub fn stage_percent(done: u32, total: u32, in_flight: f64) -> u8 {
    if total == 0 {
        return 0;
    }
    let value = (done as f64 + in_flight.max(0.0)) / total as f64 * 100.0;
    value.floor().clamp(0.0, 100.0) as u8
}

/// Overall percentage from the download and convert stage percentages.
pub fn overall_percent(download: u8, convert: u8) -> u8 {
    ((download.min(100) as u16 + convert.min(100) as u16) / 2) as u8
}

/// Monotonic progress of one stage across many items.
#[derive(Debug, Clone, Default)]
pub struct StageProgress {
    total: u32,
    done: u32,
    in_flight: HashMap<u32, f64>,
    reported: u8,
}

impl StageProgress {
    pub fn new(total: u32) -> Self {
        Self {
            total,
            ..Default::default()
        }
    }

    pub fn total(&self) -> u32 {
        self.total
    }

    pub fn done(&self) -> u32 {
        self.done
    }

    /// Current reported percentage.
    pub fn percent(&self) -> u8 {
        self.reported
    }

    pub fn set_total(&mut self, total: u32) -> u8 {
        self.total = total.max(self.done);
        self.recompute()
    }

    /// Records partial progress (0.0..=1.0) for an item still in flight.
    pub fn update(&mut self, index: u32, fraction: f64) -> u8 {
        self.in_flight.insert(index, fraction.clamp(0.0, 1.0));
        self.recompute()
    }

    /// Counts an item as done in this stage.
    pub fn complete(&mut self, index: u32) -> u8 {
        self.in_flight.remove(&index);
        self.done = (self.done + 1).min(self.total);
        self.recompute()
    }

    /// Counts an item that never reported in-flight progress as done.
    pub fn count_done(&mut self) -> u8 {
        self.done = (self.done + 1).min(self.total);
        self.recompute()
    }

    /// Drops an item from this stage without counting it as done.
    pub fn abandon(&mut self, index: u32) -> u8 {
        self.in_flight.remove(&index);
        self.recompute()
    }

    /// Maps a direct percentage, for single-item jobs.
    pub fn set_percent(&mut self, percent: f64) -> u8 {
        let value = percent.floor().clamp(0.0, 100.0) as u8;
        self.reported = self.reported.max(value);
        self.reported
    }

    /// Marks the stage finished.
    pub fn finish(&mut self) -> u8 {
        self.in_flight.clear();
        self.done = self.total;
        self.reported = 100;
        self.reported
    }

    fn recompute(&mut self) -> u8 {
        let partial: f64 = self.in_flight.values().sum();
        let value = stage_percent(self.done, self.total, partial);
        self.reported = self.reported.max(value);
        self.reported
    }
}
