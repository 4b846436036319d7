use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::db::{helpers::now_ms, LogFilter, StoreResult};

use super::LogWriter;

// Set to true to enable verbose logging in this module
const ENABLE_LOGS: bool = true;

use crate::{log_error, log_info};

pub const DEFAULT_RETENTION_INTERVAL: Duration = Duration::from_secs(91);

const DAY_MS: f64 = 24.0 * 60.0 * 60.0 * 1000.0;

/// Deletes records older than each bound item's `maxage`.
#[derive(Clone)]
pub struct Retention {
    writer: LogWriter,
    interval: Duration,
}

impl Retention {
    pub fn new(writer: LogWriter, interval: Duration) -> Self {
        Self { writer, interval }
    }

    /// One pass over all bound items; returns the number of deleted records.
    pub async fn sweep_once(&self, now: i64) -> StoreResult<usize> {
        let mut deleted = 0;
        for binding in self.writer.bindings() {
            let Some(maxage) = binding.definition.maxage else {
                continue;
            };
            if maxage <= 0.0 {
                continue;
            }

            let cutoff = now - (maxage * DAY_MS) as i64;
            let removed = self
                .writer
                .db
                .delete_logs(binding.item_id, LogFilter::before(cutoff))
                .await?;
            if removed > 0 {
                log_info!(
                    "retention removed {} records of '{}' older than {}",
                    removed,
                    binding.definition.name,
                    cutoff
                );
            }
            deleted += removed;
        }
        Ok(deleted)
    }

    /// Sweeps every `interval` until `cancel_token` fires.
    pub async fn run(&self, cancel_token: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(err) = self.sweep_once(now_ms()).await {
                        log_error!("retention sweep failed: {err}");
                    }
                }
                _ = cancel_token.cancelled() => {
                    log_info!("retention loop shutting down");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        db::{Database, Value, ValueKind},
        writer::ItemDefinition,
    };

    #[tokio::test]
    async fn test_sweep_removes_records_past_maxage() {
        let db = Database::open_in_memory().unwrap();
        let writer = LogWriter::new(db.clone());
        let mut definition = ItemDefinition::new("main.num", ValueKind::Num);
        definition.maxage = Some(1.0);
        writer.bind(definition).await.unwrap();
        writer
            .bind(ItemDefinition::new("main.keep", ValueKind::Num))
            .await
            .unwrap();

        let day = DAY_MS as i64;
        for (time, value) in [(0, 1.0), (day, 2.0), (3 * day, 3.0)] {
            writer.on_change("main.num", Value::Num(value), time).await.unwrap();
            writer.on_change("main.keep", Value::Num(value), time).await.unwrap();
        }

        let retention = Retention::new(writer, DEFAULT_RETENTION_INTERVAL);
        let deleted = retention.sweep_once(3 * day + 1).await.unwrap();
        assert_eq!(deleted, 2);

        let num = db.id("main.num", false).await.unwrap();
        let keep = db.id("main.keep", false).await.unwrap();
        assert_eq!(db.log_count(num).await.unwrap(), 1);
        assert_eq!(db.log_count(keep).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let writer = LogWriter::new(Database::open_in_memory().unwrap());
        let retention = Retention::new(writer, Duration::from_millis(10));
        let token = CancellationToken::new();

        let handle = {
            let retention = retention.clone();
            let token = token.clone();
            tokio::spawn(async move { retention.run(token).await })
        };
        token.cancel();
        handle.await.unwrap();
    }
}
