//! Log record model.

use serde::{Deserialize, Serialize};

use super::Value;

/// One value occupying `[start_time, start_time + duration)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogRecord {
    pub item_id: i64,
    pub start_time: i64,
    pub duration: i64,
    pub value: Value,
    /// The item's latest record, still waiting for its closing change.
    pub open: bool,
    /// Wall-clock time the record was written, when known.
    #[serde(default)]
    pub changed: Option<i64>,
}

impl LogRecord {
    pub fn end_time(&self) -> i64 {
        self.start_time + self.duration
    }

    /// Overlap with `[start, end)`. Open records run until `now`; closed
    /// zero-duration records are point samples that intersect with weight 0
    /// when they fall inside the window.
    pub fn intersection(&self, start: i64, end: i64, now: i64) -> Option<i64> {
        if self.start_time >= end {
            return None;
        }

        let record_end = if self.open {
            now.max(self.end_time())
        } else {
            self.end_time()
        };

        if record_end == self.start_time {
            return (self.start_time >= start).then_some(0);
        }

        if record_end <= start {
            return None;
        }

        Some((end.min(record_end) - start.max(self.start_time)).max(0))
    }

    /// True when the record lies entirely before `bound` and can never
    /// intersect a window starting there.
    pub(crate) fn ends_before(&self, bound: i64) -> bool {
        if self.open {
            return false;
        }
        if self.duration == 0 {
            self.start_time < bound
        } else {
            self.end_time() <= bound
        }
    }
}
