use std::time::Duration;

use rusqlite::{params, params_from_iter, Connection, OptionalExtension, ParamsFromIter};
use tokio::sync::mpsc;

use crate::db::{
    error::map_insert_error,
    helpers::{row_to_record, to_u64},
    models::{LogRecord, Value, ValueKind},
    Database, StoreError, StoreResult,
};

// Set to true to enable verbose logging in this module
const ENABLE_LOGS: bool = true;

use crate::log_debug;

/// Column order expected by `row_to_record`; `open` is derived from the
/// item's `open_time`.
const LOG_COLUMNS: &str = "l.item_id, l.start_time, l.duration, l.value_num, l.value_str, l.kind,
     (i.open_time IS NOT NULL AND i.open_time = l.start_time) AS open, l.changed";

/// Slice of an item's log. Every bound is optional; `*_start` is inclusive
/// and `*_end` exclusive. `time` and `changed` select one exact value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LogFilter {
    pub time: Option<i64>,
    pub time_start: Option<i64>,
    pub time_end: Option<i64>,
    pub changed: Option<i64>,
    pub changed_start: Option<i64>,
    pub changed_end: Option<i64>,
}

impl LogFilter {
    pub fn between(time_start: i64, time_end: i64) -> Self {
        Self {
            time_start: Some(time_start),
            time_end: Some(time_end),
            ..Self::default()
        }
    }

    pub fn before(time_end: i64) -> Self {
        Self {
            time_end: Some(time_end),
            ..Self::default()
        }
    }

    pub fn changed_between(mut self, changed_start: Option<i64>, changed_end: Option<i64>) -> Self {
        self.changed_start = changed_start;
        self.changed_end = changed_end;
        self
    }

    /// `?1` is the item; `?2..?7` carry the bounds, NULL disables one.
    fn params(&self, item_id: i64) -> ParamsFromIter<[Option<i64>; 7]> {
        params_from_iter([
            Some(item_id),
            self.time,
            self.time_start,
            self.time_end,
            self.changed,
            self.changed_start,
            self.changed_end,
        ])
    }

    /// `WHERE` fragment over `?2..?7`, columns qualified with `prefix`.
    fn clause(prefix: &str) -> String {
        format!(
            "AND (?2 IS NULL OR {prefix}start_time = ?2)
             AND (?3 IS NULL OR {prefix}start_time >= ?3)
             AND (?4 IS NULL OR {prefix}start_time < ?4)
             AND (?5 IS NULL OR {prefix}changed = ?5)
             AND (?6 IS NULL OR {prefix}changed >= ?6)
             AND (?7 IS NULL OR {prefix}changed < ?7)"
        )
    }
}

/// What `append_change` did to the item's log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppendOutcome {
    /// `(start_time, duration)` of the record that was closed, if any.
    pub closed: Option<(i64, i64)>,
    pub opened: i64,
}

/// Ordered records of one range scan, streamed from the store worker.
///
/// The worker reads the whole range inside one transaction, so the sequence
/// is a consistent snapshot. It is consumed once; re-issue the scan to read
/// it again.
pub struct LogScan {
    rx: mpsc::UnboundedReceiver<StoreResult<LogRecord>>,
    op_timeout: Duration,
}

impl LogScan {
    pub async fn next(&mut self) -> Option<StoreResult<LogRecord>> {
        match tokio::time::timeout(self.op_timeout, self.rx.recv()).await {
            Ok(next) => next,
            Err(_) => Some(Err(StoreError::StoreTimeout(self.op_timeout))),
        }
    }
}

/// `(start_time, duration)` of the item's latest record.
fn last_record(conn: &Connection, item_id: i64) -> StoreResult<Option<(i64, i64)>> {
    Ok(conn
        .query_row(
            "SELECT start_time, duration FROM log
             WHERE item_id = ?1
             ORDER BY start_time DESC
             LIMIT 1",
            params![item_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?)
}

fn insert_record(
    conn: &Connection,
    item_id: i64,
    time: i64,
    duration: i64,
    value: &Value,
    changed: Option<i64>,
) -> StoreResult<()> {
    if let Some((last, last_duration)) = last_record(conn, item_id)? {
        if time < last {
            return Err(StoreError::Conflict(format!(
                "item {item_id}: record at {time} precedes latest record at {last}"
            )));
        }
        let last_end = last.saturating_add(last_duration);
        if time < last_end {
            return Err(StoreError::Conflict(format!(
                "item {item_id}: record at {time} overlaps [{last}, {last_end})"
            )));
        }
    }

    let (value_num, value_str) = value.to_columns();
    conn.execute(
        "INSERT INTO log (item_id, start_time, duration, value_num, value_str, kind, changed)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            item_id,
            time,
            duration,
            value_num,
            value_str,
            value.kind().as_str(),
            changed,
        ],
    )
    .map_err(|err| {
        map_insert_error(err, || format!("item {item_id} already has a record at {time}"))
    })?;
    Ok(())
}

fn check_duration(duration: i64) -> StoreResult<()> {
    if duration < 0 {
        return Err(StoreError::BadValue(format!("negative duration {duration}")));
    }
    Ok(())
}

impl Database {
    /// Inserts one record. Fails with `Conflict` when `(item_id, time)`
    /// exists or `time` falls before the end of the item's latest record.
    pub async fn insert_log(
        &self,
        item_id: i64,
        time: i64,
        duration: i64,
        value: Value,
        kind: ValueKind,
    ) -> StoreResult<()> {
        check_duration(duration)?;
        let value = value.coerce(kind)?;
        self.execute(move |conn| insert_record(conn, item_id, time, duration, &value, None))
            .await
    }

    pub async fn update_log(
        &self,
        item_id: i64,
        time: i64,
        duration: i64,
        value: Value,
        kind: ValueKind,
    ) -> StoreResult<()> {
        check_duration(duration)?;
        let value = value.coerce(kind)?;
        self.execute(move |conn| {
            let (value_num, value_str) = value.to_columns();
            let rows_affected = conn.execute(
                "UPDATE log
                 SET duration = ?1,
                     value_num = ?2,
                     value_str = ?3,
                     kind = ?4
                 WHERE item_id = ?5 AND start_time = ?6",
                params![duration, value_num, value_str, kind.as_str(), item_id, time],
            )?;

            if rows_affected == 0 {
                return Err(StoreError::NotFound(format!("log record {item_id}@{time}")));
            }
            Ok(())
        })
        .await
    }

    /// Closes the item's open record at `time` and opens a new one holding
    /// `value`, all in one transaction. The item's last value cache follows.
    pub async fn append_change(
        &self,
        item_id: i64,
        time: i64,
        value: Value,
        changed: i64,
    ) -> StoreResult<AppendOutcome> {
        self.execute(move |conn| {
            let tx = conn.transaction()?;

            let open_time: Option<i64> = tx
                .query_row(
                    "SELECT open_time FROM item WHERE id = ?1",
                    params![item_id],
                    |row| row.get(0),
                )
                .optional()?
                .ok_or_else(|| StoreError::NotFound(format!("#{item_id}")))?;

            let mut closed = None;
            if let Some(open_time) = open_time {
                if time <= open_time {
                    return Err(StoreError::Conflict(format!(
                        "item {item_id}: change at {time} does not follow open record at {open_time}"
                    )));
                }
                let duration = time - open_time;
                tx.execute(
                    "UPDATE log SET duration = ?1 WHERE item_id = ?2 AND start_time = ?3",
                    params![duration, item_id, open_time],
                )?;
                closed = Some((open_time, duration));
            }

            insert_record(&tx, item_id, time, 0, &value, Some(changed))?;

            let (value_num, value_str) = value.to_columns();
            tx.execute(
                "UPDATE item
                 SET open_time = ?1,
                     last_time = ?1,
                     value_num = ?2,
                     value_str = ?3,
                     changed = ?4
                 WHERE id = ?5",
                params![time, value_num, value_str, changed, item_id],
            )?;

            tx.commit()?;
            Ok(AppendOutcome {
                closed,
                opened: time,
            })
        })
        .await
    }

    pub async fn read_log(&self, item_id: i64, time: i64) -> StoreResult<Option<LogRecord>> {
        self.execute(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {LOG_COLUMNS}
                 FROM log l JOIN item i ON i.id = l.item_id
                 WHERE l.item_id = ?1 AND l.start_time = ?2"
            ))?;
            let mut rows = stmt.query(params![item_id, time])?;
            match rows.next()? {
                Some(row) => Ok(Some(row_to_record(row)?)),
                None => Ok(None),
            }
        })
        .await
    }

    pub async fn read_logs(&self, item_id: i64, filter: LogFilter) -> StoreResult<Vec<LogRecord>> {
        self.execute(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {LOG_COLUMNS}
                 FROM log l JOIN item i ON i.id = l.item_id
                 WHERE l.item_id = ?1 {}
                 ORDER BY l.start_time ASC",
                LogFilter::clause("l.")
            ))?;
            let mut rows = stmt.query(filter.params(item_id))?;
            let mut records = Vec::new();
            while let Some(row) = rows.next()? {
                records.push(row_to_record(row)?);
            }
            Ok(records)
        })
        .await
    }

    pub async fn oldest_log(&self, item_id: i64) -> StoreResult<Option<i64>> {
        self.execute(move |conn| {
            Ok(conn.query_row(
                "SELECT MIN(start_time) FROM log WHERE item_id = ?1",
                params![item_id],
                |row| row.get(0),
            )?)
        })
        .await
    }

    pub async fn log_count(&self, item_id: i64) -> StoreResult<u64> {
        self.execute(move |conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM log WHERE item_id = ?1",
                params![item_id],
                |row| row.get(0),
            )?;
            to_u64(count, "log count")
        })
        .await
    }

    /// Deletes records matching `filter`. The item's open record is kept so
    /// the next change can still close it.
    pub async fn delete_logs(&self, item_id: i64, filter: LogFilter) -> StoreResult<usize> {
        self.execute(move |conn| {
            let sql = format!(
                "DELETE FROM log
                 WHERE item_id = ?1 {}
                   AND start_time IS NOT (SELECT open_time FROM item WHERE id = ?1)",
                LogFilter::clause("")
            );
            let deleted = conn.execute(&sql, filter.params(item_id))?;
            Ok(deleted)
        })
        .await
    }

    /// Streams the records of `item_id` intersecting `[start, end)` in
    /// ascending `start_time` order.
    pub fn range_scan(&self, item_id: i64, start: i64, end: i64) -> StoreResult<LogScan> {
        let (tx, rx) = mpsc::unbounded_channel();

        self.dispatch(Box::new(move |conn: &mut Connection| {
            let sender = tx;
            let result = (|| -> StoreResult<usize> {
                let snapshot = conn.transaction()?;
                let mut sent = 0;
                {
                    let mut stmt = snapshot.prepare_cached(&format!(
                        "SELECT {LOG_COLUMNS}
                         FROM log l JOIN item i ON i.id = l.item_id
                         WHERE l.item_id = ?1
                           AND l.start_time < ?3
                           AND (l.start_time + l.duration > ?2
                                OR (l.duration = 0 AND l.start_time >= ?2)
                                OR l.start_time = i.open_time)
                         ORDER BY l.start_time ASC"
                    ))?;
                    let mut rows = stmt.query(params![item_id, start, end])?;
                    while let Some(row) = rows.next()? {
                        if sender.send(row_to_record(row)).is_err() {
                            // Consumer dropped the scan.
                            break;
                        }
                        sent += 1;
                    }
                }
                snapshot.finish()?;
                Ok(sent)
            })();

            match result {
                Ok(sent) => log_debug!("scan item {item_id} [{start}, {end}) yielded {sent} rows"),
                Err(err) => {
                    let _ = sender.send(Err(err));
                }
            }
        }))?;

        Ok(LogScan {
            rx,
            op_timeout: self.op_timeout(),
        })
    }
}
