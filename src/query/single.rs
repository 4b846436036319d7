use crate::db::{helpers::now_ms, Database, StoreError, StoreResult};

use super::{resolve_window, round_to, Accumulator, AggregateFunc, TimeSpec};

// Set to true to enable verbose logging in this module
const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_warn};

/// Scalar aggregates over one window of an item's log.
#[derive(Clone)]
pub struct Aggregator {
    db: Database,
    precision: i32,
}

impl Aggregator {
    pub fn new(db: Database, precision: i32) -> Self {
        Self { db, precision }
    }

    pub async fn single(
        &self,
        func: AggregateFunc,
        start: TimeSpec,
        end: TimeSpec,
        item: &str,
    ) -> StoreResult<Option<f64>> {
        self.single_at(func, start, end, item, now_ms()).await
    }

    /// `single` against a fixed wall-clock.
    ///
    /// Returns `None` for an unknown item, an empty window, or a window
    /// whose records were all skipped.
    pub async fn single_at(
        &self,
        func: AggregateFunc,
        start: TimeSpec,
        end: TimeSpec,
        item: &str,
        now: i64,
    ) -> StoreResult<Option<f64>> {
        let item_id = match self.db.id(item, false).await {
            Ok(id) => id,
            Err(StoreError::NotFound(_)) => return Ok(None),
            Err(err) => return Err(err),
        };

        let Some((start, end)) = resolve_window(&self.db, item_id, start, end, now).await? else {
            return Ok(None);
        };

        let mut acc = Accumulator::new(func);
        let mut scan = self.db.range_scan(item_id, start, end)?;
        while let Some(next) = scan.next().await {
            match next {
                Ok(record) => {
                    if let Some(weight) = record.intersection(start, end, now) {
                        acc.push_lossy(&record, weight);
                    }
                }
                Err(StoreError::BadValue(reason)) => {
                    log_warn!("skipping undecodable record of '{item}': {reason}");
                    acc.skip_bad();
                }
                Err(err) => return Err(err),
            }
        }

        if acc.skipped() > 0 {
            log_debug!("{func} on '{item}' skipped {} records", acc.skipped());
        }

        let value = acc.finish();
        Ok(match value {
            Some(v) if func.is_rounded() => Some(round_to(v, self.precision)),
            other => other,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{Value, ValueKind};

    async fn setup() -> (Aggregator, i64) {
        let db = Database::open_in_memory().unwrap();
        let id = db.id("main.num", true).await.unwrap();
        (Aggregator::new(db, 2), id)
    }

    #[tokio::test]
    async fn test_unknown_item_is_empty() {
        let (aggregator, _) = setup().await;
        let value = aggregator
            .single(AggregateFunc::Avg, TimeSpec::At(0), TimeSpec::Now, "main.unknown")
            .await
            .unwrap();
        assert_eq!(value, None);
    }

    #[tokio::test]
    async fn test_partial_overlap_is_weighted() {
        let (aggregator, id) = setup().await;
        aggregator
            .db
            .insert_log(id, 0, 1000, Value::Num(10.0), ValueKind::Num)
            .await
            .unwrap();
        aggregator
            .db
            .insert_log(id, 1000, 1000, Value::Num(40.0), ValueKind::Num)
            .await
            .unwrap();

        let value = aggregator
            .single_at(
                AggregateFunc::Avg,
                TimeSpec::At(500),
                TimeSpec::At(1500),
                "main.num",
                10_000,
            )
            .await
            .unwrap();
        assert_eq!(value, Some(25.0));
    }

    #[tokio::test]
    async fn test_avg_is_rounded_to_precision() {
        let (aggregator, id) = setup().await;
        aggregator
            .db
            .insert_log(id, 0, 1000, Value::Num(1.0), ValueKind::Num)
            .await
            .unwrap();
        aggregator
            .db
            .insert_log(id, 1000, 2000, Value::Num(2.0), ValueKind::Num)
            .await
            .unwrap();

        let value = aggregator
            .single_at(AggregateFunc::Avg, TimeSpec::At(0), TimeSpec::Now, "main.num", 3000)
            .await
            .unwrap();
        assert_eq!(value, Some(1.67));
    }

    #[tokio::test]
    async fn test_open_record_extends_to_now() {
        let (aggregator, id) = setup().await;
        aggregator
            .db
            .append_change(id, 1000, Value::Num(10.0), 1000)
            .await
            .unwrap();
        aggregator
            .db
            .append_change(id, 2000, Value::Num(20.0), 2000)
            .await
            .unwrap();

        let value = aggregator
            .single_at(AggregateFunc::Avg, TimeSpec::At(0), TimeSpec::Now, "main.num", 5000)
            .await
            .unwrap();
        // 10 over 1000ms, 20 over 3000ms.
        assert_eq!(value, Some(17.5));
    }

    #[tokio::test]
    async fn test_inverted_window_is_empty() {
        let (aggregator, id) = setup().await;
        aggregator
            .db
            .insert_log(id, 0, 1000, Value::Num(1.0), ValueKind::Num)
            .await
            .unwrap();

        let value = aggregator
            .single_at(
                AggregateFunc::Max,
                TimeSpec::At(900),
                TimeSpec::At(100),
                "main.num",
                5000,
            )
            .await
            .unwrap();
        assert_eq!(value, None);
    }
}
