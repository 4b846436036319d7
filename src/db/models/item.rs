//! Item descriptor model.

use serde::{Deserialize, Serialize};

use super::{Value, ValueKind};

/// A logged signal: its host path, the numeric identity assigned on first
/// persistence, and the cached last value.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemDescriptor {
    pub id: i64,
    pub name: String,
    pub kind: ValueKind,
    /// Start of the record whose duration is still provisional.
    pub open_time: Option<i64>,
    pub last_time: Option<i64>,
    pub last_value: Option<Value>,
    pub changed: Option<i64>,
}
