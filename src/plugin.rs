//! Host-facing surface: item binding, change hooks and the query calls.

use std::collections::HashSet;

use anyhow::Result;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::{
    db::{Database, ItemDescriptor, LogFilter, LogRecord, StoreError, StoreResult, Value},
    query::{AggregateFunc, Aggregator, FuncSpec, SeriesBuilder, SeriesRequest, SeriesResponse, TimeSpec},
    settings::PluginConfig,
    writer::{ItemDefinition, LogWriter, Retention, WriteOutcome},
};

// Set to true to enable verbose logging in this module
const ENABLE_LOGS: bool = true;

use crate::log_info;

/// One exported log record together with its item's name.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DumpEntry {
    pub item_name: String,
    #[serde(flatten)]
    pub record: LogRecord,
}

pub struct Plugin {
    config: PluginConfig,
    db: Database,
    writer: LogWriter,
    aggregator: Aggregator,
    series: SeriesBuilder,
    retention: Retention,
}

impl Plugin {
    pub fn open(config: PluginConfig) -> Result<Self> {
        let db = Database::open(&config.database, config.query_timeout())?;
        let writer = LogWriter::new(db.clone());
        let retention = Retention::new(writer.clone(), config.retention_interval());

        Ok(Self {
            aggregator: Aggregator::new(db.clone(), config.precision),
            series: SeriesBuilder::new(db.clone(), config.precision, config.count),
            config,
            db,
            writer,
            retention,
        })
    }

    pub fn config(&self) -> &PluginConfig {
        &self.config
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn writer(&self) -> &LogWriter {
        &self.writer
    }

    pub fn retention(&self) -> &Retention {
        &self.retention
    }

    /// Binds `item` using its configured attributes. Returns the value to
    /// restore for `init` items.
    pub async fn parse_item(&self, item: &str) -> StoreResult<Option<Value>> {
        self.bind(self.config.definition_for(item)).await
    }

    pub async fn bind(&self, definition: ItemDefinition) -> StoreResult<Option<Value>> {
        self.writer.bind(definition).await
    }

    /// Stops logging `item`; a later `cleanup` deletes it.
    pub fn unbind(&self, item: &str) -> bool {
        self.writer.unbind(item).is_some()
    }

    pub async fn on_change(&self, item: &str, value: Value, time: i64) -> StoreResult<WriteOutcome> {
        self.writer.on_change(item, value, time).await
    }

    pub async fn id(&self, item: &str, create: bool) -> StoreResult<i64> {
        self.db.id(item, create).await
    }

    pub async fn items(&self) -> StoreResult<Vec<ItemDescriptor>> {
        self.db.list_items().await
    }

    /// Scalar aggregate of `item` over `[start, end)`; `None` is the empty
    /// result.
    pub async fn single(
        &self,
        func: &str,
        start: &str,
        end: &str,
        item: &str,
    ) -> StoreResult<Option<f64>> {
        let (func, start, end) = Self::parse_single(func, start, end)?;
        self.aggregator.single(func, start, end, item).await
    }

    pub async fn single_at(
        &self,
        func: &str,
        start: &str,
        end: &str,
        item: &str,
        now: i64,
    ) -> StoreResult<Option<f64>> {
        let (func, start, end) = Self::parse_single(func, start, end)?;
        self.aggregator.single_at(func, start, end, item, now).await
    }

    fn parse_single(
        func: &str,
        start: &str,
        end: &str,
    ) -> StoreResult<(AggregateFunc, TimeSpec, TimeSpec)> {
        let spec: FuncSpec = func.parse()?;
        if spec.finalizer.is_some() {
            return Err(StoreError::InvalidQuery(format!(
                "finalizers apply to series only, got '{func}'"
            )));
        }
        Ok((spec.func, start.parse()?, end.parse()?))
    }

    pub async fn series(&self, request: &SeriesRequest) -> StoreResult<SeriesResponse> {
        self.series_with(request, &CancellationToken::new()).await
    }

    pub async fn series_with(
        &self,
        request: &SeriesRequest,
        cancel: &CancellationToken,
    ) -> StoreResult<SeriesResponse> {
        self.series.series(request, cancel).await
    }

    pub async fn series_at(
        &self,
        request: &SeriesRequest,
        now: i64,
        cancel: &CancellationToken,
    ) -> StoreResult<SeriesResponse> {
        self.series.series_at(request, now, cancel).await
    }

    /// Log records matching `filter`, for one item or all of them in
    /// identity order.
    pub async fn dump(&self, item: Option<&str>, filter: LogFilter) -> StoreResult<Vec<DumpEntry>> {
        let items = match item {
            Some(name) => vec![self
                .db
                .read_item_by_name(name)
                .await?
                .ok_or_else(|| StoreError::NotFound(name.to_string()))?],
            None => self.db.list_items().await?,
        };

        let mut entries = Vec::new();
        for item in &items {
            for record in self.db.read_logs(item.id, filter).await? {
                entries.push(DumpEntry {
                    item_name: item.name.clone(),
                    record,
                });
            }
        }
        log_info!("dumped {} records of {} items", entries.len(), items.len());
        Ok(entries)
    }

    /// Deletes items (and their logs) that are no longer bound.
    pub async fn cleanup(&self) -> StoreResult<usize> {
        let bound: HashSet<String> = self.writer.bound_items().into_iter().collect();
        let mut removed = 0;
        for item in self.db.list_items().await? {
            if bound.contains(&item.name) {
                continue;
            }
            self.db.delete_item(item.id).await?;
            log_info!("removed unbound item '{}' (#{})", item.name, item.id);
            removed += 1;
        }
        Ok(removed)
    }
}
