//! Running state of one aggregate over the records of a window.

use crate::db::{LogRecord, StoreError, StoreResult, Value};

use super::AggregateFunc;

// Set to true to enable verbose logging in this module
const ENABLE_LOGS: bool = true;

use crate::log_warn;

#[derive(Debug, Clone)]
pub struct Accumulator {
    func: AggregateFunc,
    samples: u64,
    matched: u64,
    skipped: u64,
    sum: f64,
    weighted_sum: f64,
    weight: i64,
    min: Option<f64>,
    max: Option<f64>,
    last: Option<f64>,
    any_truthy: bool,
}

impl Accumulator {
    pub fn new(func: AggregateFunc) -> Self {
        Self {
            func,
            samples: 0,
            matched: 0,
            skipped: 0,
            sum: 0.0,
            weighted_sum: 0.0,
            weight: 0,
            min: None,
            max: None,
            last: None,
            any_truthy: false,
        }
    }

    /// Adds one intersecting record with its intersected duration.
    ///
    /// Fails with `BadValue` when the value has no numeric reading and the
    /// function needs one; the accumulator is left unchanged in that case.
    pub fn push(&mut self, value: &Value, weight: i64) -> StoreResult<()> {
        if self.func == AggregateFunc::CountAll {
            self.samples += 1;
            return Ok(());
        }

        let v = value.as_f64().ok_or_else(|| {
            StoreError::BadValue(format!("'{value}' has no numeric value for {}", self.func))
        })?;

        self.samples += 1;
        self.sum += v;
        self.weighted_sum += v * weight as f64;
        self.weight += weight;
        self.last = Some(v);

        // Ties keep the later record.
        if self.min.map_or(true, |min| v <= min) {
            self.min = Some(v);
        }
        if self.max.map_or(true, |max| v >= max) {
            self.max = Some(v);
        }
        if value.is_truthy().unwrap_or(false) {
            self.any_truthy = true;
        }
        if let AggregateFunc::Count { op, operand } = self.func {
            if op.matches(v, operand) {
                self.matched += 1;
            }
        }
        Ok(())
    }

    /// `push` that logs and skips malformed values.
    pub fn push_lossy(&mut self, record: &LogRecord, weight: i64) {
        if let Err(err) = self.push(&record.value, weight) {
            self.skipped += 1;
            log_warn!(
                "skipping record of item {} at {}: {}",
                record.item_id,
                record.start_time,
                err
            );
        }
    }

    pub fn skip_bad(&mut self) {
        self.skipped += 1;
    }

    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    /// Final value, or `None` when no record contributed.
    pub fn finish(&self) -> Option<f64> {
        if self.samples == 0 {
            return None;
        }

        match self.func {
            AggregateFunc::Avg => {
                if self.weight > 0 {
                    Some(self.weighted_sum / self.weight as f64)
                } else {
                    Some(self.sum / self.samples as f64)
                }
            }
            AggregateFunc::Min => self.min,
            AggregateFunc::Max => self.max,
            AggregateFunc::On => Some(if self.any_truthy { 1.0 } else { 0.0 }),
            AggregateFunc::Sum => Some(self.sum),
            AggregateFunc::Integrate => Some(self.weighted_sum),
            AggregateFunc::Count { .. } => Some(self.matched as f64),
            AggregateFunc::CountAll => Some(self.samples as f64),
            AggregateFunc::Raw => self.last,
        }
    }
}

/// Aggregates `records` (ascending `start_time`) over `[start, end)`.
pub fn evaluate<'a>(
    func: AggregateFunc,
    records: impl IntoIterator<Item = &'a LogRecord>,
    start: i64,
    end: i64,
    now: i64,
) -> Option<f64> {
    let mut acc = Accumulator::new(func);
    for record in records {
        if record.start_time >= end {
            break;
        }
        if let Some(weight) = record.intersection(start, end, now) {
            acc.push_lossy(record, weight);
        }
    }
    acc.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::CountOp;

    fn record(start_time: i64, duration: i64, value: Value) -> LogRecord {
        LogRecord {
            item_id: 1,
            start_time,
            duration,
            value,
            open: false,
            changed: None,
        }
    }

    #[test]
    fn test_avg_is_duration_weighted() {
        let records = vec![
            record(0, 3000, Value::Num(10.0)),
            record(3000, 1000, Value::Num(30.0)),
        ];
        assert_eq!(evaluate(AggregateFunc::Avg, &records, 0, 4000, 4000), Some(15.0));
    }

    #[test]
    fn test_avg_of_point_samples_falls_back_to_mean() {
        let records = vec![
            record(100, 0, Value::Num(1.0)),
            record(200, 0, Value::Num(3.0)),
        ];
        assert_eq!(evaluate(AggregateFunc::Avg, &records, 0, 1000, 1000), Some(2.0));
    }

    #[test]
    fn test_min_max_on() {
        let records = vec![
            record(0, 10, Value::Num(0.0)),
            record(10, 10, Value::Num(-4.0)),
            record(20, 10, Value::Num(7.5)),
        ];
        assert_eq!(evaluate(AggregateFunc::Min, &records, 0, 30, 30), Some(-4.0));
        assert_eq!(evaluate(AggregateFunc::Max, &records, 0, 30, 30), Some(7.5));
        assert_eq!(evaluate(AggregateFunc::On, &records, 0, 30, 30), Some(1.0));
        assert_eq!(evaluate(AggregateFunc::On, &records[..1], 0, 30, 30), Some(0.0));
    }

    #[test]
    fn test_bool_values_are_numeric() {
        let records = vec![
            record(0, 10, Value::Bool(false)),
            record(10, 30, Value::Bool(true)),
        ];
        assert_eq!(evaluate(AggregateFunc::Avg, &records, 0, 40, 40), Some(0.75));
        assert_eq!(evaluate(AggregateFunc::On, &records, 0, 40, 40), Some(1.0));
    }

    #[test]
    fn test_string_values_are_skipped() {
        let records = vec![
            record(0, 10, Value::Str("n/a".into())),
            record(10, 10, Value::Num(4.0)),
        ];
        assert_eq!(evaluate(AggregateFunc::Avg, &records, 0, 20, 20), Some(4.0));
        assert_eq!(evaluate(AggregateFunc::CountAll, &records, 0, 20, 20), Some(2.0));
        assert_eq!(evaluate(AggregateFunc::Max, &records[..1], 0, 20, 20), None);
    }

    #[test]
    fn test_sum_integrate_count() {
        let records = vec![
            record(0, 10, Value::Num(2.0)),
            record(10, 10, Value::Num(0.0)),
            record(20, 10, Value::Num(6.0)),
        ];
        assert_eq!(evaluate(AggregateFunc::Sum, &records, 0, 30, 30), Some(8.0));
        assert_eq!(evaluate(AggregateFunc::Integrate, &records, 0, 30, 30), Some(80.0));
        assert_eq!(
            evaluate(
                AggregateFunc::Count {
                    op: CountOp::Ne,
                    operand: 0.0
                },
                &records,
                0,
                30,
                30
            ),
            Some(2.0)
        );
        assert_eq!(
            evaluate(
                AggregateFunc::Count {
                    op: CountOp::Gt,
                    operand: 5.0
                },
                &records,
                0,
                30,
                30
            ),
            Some(1.0)
        );
    }

    #[test]
    fn test_no_intersecting_record_is_empty() {
        let records = vec![record(0, 10, Value::Num(2.0))];
        assert_eq!(evaluate(AggregateFunc::Avg, &records, 100, 200, 200), None);
        assert_eq!(evaluate(AggregateFunc::CountAll, &records, 100, 200, 200), None);
    }

    #[test]
    fn test_raw_is_latest_value_in_window() {
        let records = vec![
            record(0, 10, Value::Num(2.0)),
            record(10, 10, Value::Num(9.0)),
            record(20, 10, Value::Num(6.0)),
        ];
        assert_eq!(evaluate(AggregateFunc::Raw, &records, 0, 20, 30), Some(9.0));
        assert_eq!(evaluate(AggregateFunc::Raw, &records, 5, 30, 30), Some(6.0));
    }
}
