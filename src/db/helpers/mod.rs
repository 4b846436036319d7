use std::convert::TryFrom;

use chrono::Utc;
use rusqlite::Row;

use crate::db::{
    models::{ItemDescriptor, LogRecord, Value, ValueKind},
    StoreError, StoreResult,
};

pub fn to_u64(value: i64, field: &str) -> StoreResult<u64> {
    u64::try_from(value)
        .map_err(|_| StoreError::BadValue(format!("{field} contains negative value {value}")))
}

/// Current wall-clock in milliseconds since the epoch.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

pub fn parse_kind(value: &str) -> StoreResult<ValueKind> {
    value.parse()
}

/// Expects the column order of `ITEM_COLUMNS`.
pub fn row_to_item(row: &Row) -> StoreResult<ItemDescriptor> {
    let kind = parse_kind(&row.get::<_, String>("kind")?)?;
    let value_num: Option<f64> = row.get("value_num")?;
    let value_str: Option<String> = row.get("value_str")?;
    let last_value = if value_num.is_none() && value_str.is_none() {
        None
    } else {
        Value::from_columns(kind, value_num, value_str).ok()
    };

    Ok(ItemDescriptor {
        id: row.get("id")?,
        name: row.get("name")?,
        kind,
        open_time: row.get("open_time")?,
        last_time: row.get("last_time")?,
        last_value,
        changed: row.get("changed")?,
    })
}

/// Expects the column order of `LOG_COLUMNS`.
pub fn row_to_record(row: &Row) -> StoreResult<LogRecord> {
    let item_id: i64 = row.get(0)?;
    let start_time: i64 = row.get(1)?;
    let duration: i64 = row.get(2)?;
    let kind = parse_kind(&row.get::<_, String>(5)?)?;
    let value = Value::from_columns(kind, row.get(3)?, row.get(4)?).map_err(|err| {
        StoreError::BadValue(format!("item {item_id} at {start_time}: {err}"))
    })?;

    Ok(LogRecord {
        item_id,
        start_time,
        duration,
        value,
        open: row.get(6)?,
        changed: row.get(7)?,
    })
}
