//! Turns host value changes into log records.

mod retention;

pub use retention::{Retention, DEFAULT_RETENTION_INTERVAL};

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
};

use serde::{Deserialize, Serialize};

use crate::db::{helpers::now_ms, Database, StoreError, StoreResult, Value, ValueKind};

// Set to true to enable verbose logging in this module
const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_info, log_warn};

/// Whether changes of an item are logged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Acl {
    #[default]
    Rw,
    Ro,
}

/// `init` restores the cached last value into the host on bind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BindMode {
    #[default]
    Log,
    Init,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ItemDefinition {
    pub name: String,
    pub kind: ValueKind,
    pub acl: Acl,
    pub mode: BindMode,
    /// Retention in days.
    pub maxage: Option<f64>,
}

impl ItemDefinition {
    pub fn new(name: &str, kind: ValueKind) -> Self {
        Self {
            name: name.to_string(),
            kind,
            acl: Acl::default(),
            mode: BindMode::default(),
            maxage: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Binding {
    pub item_id: i64,
    pub definition: ItemDefinition,
}

/// Result of one change notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// A record was opened; `closed` is the record it terminated.
    Appended { closed: Option<(i64, i64)> },
    /// The change was malformed or ran backwards and was discarded.
    Dropped,
    /// The item is unbound or read-only.
    Ignored,
}

/// Time of the item's latest record, guarded per item so changes of one
/// item are appended strictly in arrival order.
#[derive(Debug, Default)]
struct ItemCursor {
    last_time: Option<i64>,
}

#[derive(Clone)]
pub struct LogWriter {
    db: Database,
    bindings: Arc<Mutex<HashMap<String, Binding>>>,
    cursors: Arc<Mutex<HashMap<i64, Arc<tokio::sync::Mutex<ItemCursor>>>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl LogWriter {
    pub fn new(db: Database) -> Self {
        Self {
            db,
            bindings: Arc::new(Mutex::new(HashMap::new())),
            cursors: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Binds an item, creating its identity on first use.
    ///
    /// For `init` bindings the cached last value is returned so the host can
    /// restore it.
    pub async fn bind(&self, definition: ItemDefinition) -> StoreResult<Option<Value>> {
        let item_id = self
            .db
            .resolve_item(&definition.name, Some(definition.kind))
            .await?;
        let item = self
            .db
            .read_item(item_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(definition.name.clone()))?;

        // Items allocated through `id` carry a placeholder kind until their
        // first record.
        if item.kind != definition.kind {
            if self.db.set_kind_if_unlogged(item_id, definition.kind).await? {
                log_info!(
                    "item '{}' changed from {} to {}",
                    definition.name,
                    item.kind,
                    definition.kind
                );
            } else {
                log_warn!(
                    "item '{}' is stored as {} but bound as {}",
                    definition.name,
                    item.kind,
                    definition.kind
                );
            }
        }

        let restored = match definition.mode {
            BindMode::Init => item.last_value.clone(),
            BindMode::Log => None,
        };

        {
            let mut cursors = lock(&self.cursors);
            cursors.entry(item_id).or_insert_with(|| {
                Arc::new(tokio::sync::Mutex::new(ItemCursor {
                    last_time: item.open_time.or(item.last_time),
                }))
            });
        }

        log_info!(
            "bound item '{}' as #{} ({}, {:?})",
            definition.name,
            item_id,
            definition.kind,
            definition.acl
        );
        lock(&self.bindings).insert(
            definition.name.clone(),
            Binding {
                item_id,
                definition,
            },
        );

        Ok(restored)
    }

    pub fn binding(&self, name: &str) -> Option<Binding> {
        lock(&self.bindings).get(name).cloned()
    }

    pub fn bound_items(&self) -> Vec<String> {
        let mut names: Vec<String> = lock(&self.bindings).keys().cloned().collect();
        names.sort();
        names
    }

    pub fn bindings(&self) -> Vec<Binding> {
        lock(&self.bindings).values().cloned().collect()
    }

    /// Records a value change of `name` at `time`.
    ///
    /// The item's open record is closed at `time` and a new open record
    /// holding `value` starts there. A store conflict is reported as
    /// `WriteFailed` with the record dropped; the writer stays usable.
    pub async fn on_change(&self, name: &str, value: Value, time: i64) -> StoreResult<WriteOutcome> {
        let Some(binding) = self.binding(name) else {
            log_debug!("change of unbound item '{name}' ignored");
            return Ok(WriteOutcome::Ignored);
        };
        if binding.definition.acl == Acl::Ro {
            return Ok(WriteOutcome::Ignored);
        }

        let value = match value.coerce(binding.definition.kind) {
            Ok(value) => value,
            Err(err) => {
                log_warn!("dropping change of '{name}' at {time}: {err}");
                return Ok(WriteOutcome::Dropped);
            }
        };

        let cursor = {
            let mut cursors = lock(&self.cursors);
            cursors
                .entry(binding.item_id)
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(ItemCursor::default())))
                .clone()
        };
        let mut cursor = cursor.lock().await;

        if let Some(last_time) = cursor.last_time {
            if time < last_time {
                log_warn!(
                    "dropping change of '{name}': interval runs backwards ({time} < {last_time})"
                );
                return Ok(WriteOutcome::Dropped);
            }
        }

        match self
            .db
            .append_change(binding.item_id, time, value, now_ms())
            .await
        {
            Ok(outcome) => {
                cursor.last_time = Some(outcome.opened);
                log_debug!("'{name}' changed at {time}, closed {:?}", outcome.closed);
                Ok(WriteOutcome::Appended {
                    closed: outcome.closed,
                })
            }
            Err(err @ (StoreError::StoreTimeout(_) | StoreError::Closed)) => Err(err),
            Err(err) => {
                log_warn!("dropping change of '{name}' at {time}: {err}");
                Err(StoreError::write_failed(name, err))
            }
        }
    }

    /// Forgets a binding; the item's log stays in the store until a
    /// cleanup removes unbound items.
    pub fn unbind(&self, name: &str) -> Option<Binding> {
        lock(&self.bindings).remove(name)
    }
}
