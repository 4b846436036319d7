pub mod accumulate;
mod func;
mod series;
mod single;
mod timespec;

pub use accumulate::Accumulator;
pub use func::{AggregateFunc, CountOp, Finalizer, FuncSpec};
pub use series::{
    SeriesBuilder, SeriesParams, SeriesRequest, SeriesResponse, DEFAULT_COUNT, MAX_BUCKETS,
};
pub use single::Aggregator;
pub use timespec::TimeSpec;

use crate::db::{Database, StoreResult};

/// Rounds to `digits` decimals; negative `digits` leaves the value as is.
pub fn round_to(value: f64, digits: i32) -> f64 {
    if digits < 0 {
        return value;
    }
    let factor = 10f64.powi(digits);
    (value * factor).round() / factor
}

/// Resolves a query window against one `now`. A start at the origin means
/// the item's earliest record; `None` when the window is empty.
pub(crate) async fn resolve_window(
    db: &Database,
    item_id: i64,
    start: TimeSpec,
    end: TimeSpec,
    now: i64,
) -> StoreResult<Option<(i64, i64)>> {
    let end = end.resolve(now);
    let start = if start.is_origin() {
        match db.oldest_log(item_id).await? {
            Some(oldest) => oldest,
            None => return Ok(None),
        }
    } else {
        start.resolve(now)
    };

    if start >= end {
        return Ok(None);
    }
    Ok(Some((start, end)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_to() {
        assert_eq!(round_to(1.23456, 2), 1.23);
        assert_eq!(round_to(2.5, 0), 3.0);
        assert_eq!(round_to(1.23456, -1), 1.23456);
    }
}
