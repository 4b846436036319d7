use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, fs, path::Path, time::Duration};

use crate::{
    db::{ValueKind, MEMORY_DATABASE},
    query::DEFAULT_COUNT,
    writer::{Acl, BindMode, ItemDefinition, DEFAULT_RETENTION_INTERVAL},
};

/// Per-item overrides keyed by item path.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ItemAttributes {
    #[serde(default)]
    pub kind: Option<ValueKind>,
    /// Retention in days.
    #[serde(default)]
    pub maxage: Option<f64>,
    #[serde(default)]
    pub acl: Option<Acl>,
    #[serde(default)]
    pub mode: Option<BindMode>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PluginConfig {
    pub database: String,
    #[serde(default)]
    pub item_attributes: HashMap<String, ItemAttributes>,
    #[serde(default = "default_precision")]
    pub precision: i32,
    #[serde(default = "default_count")]
    pub count: u32,
    #[serde(default = "default_query_timeout_ms")]
    pub query_timeout_ms: u64,
    #[serde(default = "default_retention_interval_secs")]
    pub retention_interval_secs: u64,
}

fn default_precision() -> i32 {
    2
}

fn default_count() -> u32 {
    DEFAULT_COUNT
}

fn default_query_timeout_ms() -> u64 {
    5000
}

fn default_retention_interval_secs() -> u64 {
    DEFAULT_RETENTION_INTERVAL.as_secs()
}

impl PluginConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;
        Self::from_json(&contents)
            .with_context(|| format!("Invalid config in {}", path.display()))
    }

    pub fn from_json(contents: &str) -> Result<Self> {
        let config: PluginConfig = serde_json::from_str(contents)?;
        if config.database.trim().is_empty() {
            bail!("`database` must name a file or {MEMORY_DATABASE}");
        }
        if config.query_timeout_ms == 0 {
            bail!("`query_timeout_ms` must be positive");
        }
        if config.retention_interval_secs == 0 {
            bail!("`retention_interval_secs` must be positive");
        }
        Ok(config)
    }

    pub fn in_memory() -> Self {
        Self {
            database: MEMORY_DATABASE.to_string(),
            item_attributes: HashMap::new(),
            precision: default_precision(),
            count: default_count(),
            query_timeout_ms: default_query_timeout_ms(),
            retention_interval_secs: default_retention_interval_secs(),
        }
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }

    pub fn retention_interval(&self) -> Duration {
        Duration::from_secs(self.retention_interval_secs)
    }

    /// Binding definition for `item`, with configured overrides applied.
    pub fn definition_for(&self, item: &str) -> ItemDefinition {
        let mut definition = ItemDefinition::new(item, ValueKind::default());
        if let Some(attributes) = self.item_attributes.get(item) {
            if let Some(kind) = attributes.kind {
                definition.kind = kind;
            }
            if let Some(acl) = attributes.acl {
                definition.acl = acl;
            }
            if let Some(mode) = attributes.mode {
                definition.mode = mode;
            }
            definition.maxage = attributes.maxage;
        }
        definition
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_defaults() {
        let config = PluginConfig::from_json(r#"{ "database": ":memory:" }"#).unwrap();
        assert_eq!(config.precision, 2);
        assert_eq!(config.count, 100);
        assert_eq!(config.query_timeout(), Duration::from_secs(5));
        assert_eq!(config.retention_interval(), Duration::from_secs(91));
        assert!(config.item_attributes.is_empty());
    }

    #[test]
    fn test_missing_database_is_rejected() {
        assert!(PluginConfig::from_json(r#"{ "precision": 3 }"#).is_err());
        assert!(PluginConfig::from_json(r#"{ "database": "  " }"#).is_err());
    }

    #[test]
    fn test_unknown_keys_are_rejected() {
        assert!(PluginConfig::from_json(r#"{ "database": ":memory:", "dbtype": "sqlite3" }"#).is_err());
    }

    #[test]
    fn test_item_attributes_shape_definitions() {
        let config = PluginConfig::from_json(
            r#"{
                "database": ":memory:",
                "item_attributes": {
                    "main.bool": { "kind": "bool", "mode": "init", "maxage": 7 },
                    "main.ro": { "acl": "ro" }
                }
            }"#,
        )
        .unwrap();

        let bool_item = config.definition_for("main.bool");
        assert_eq!(bool_item.kind, ValueKind::Bool);
        assert_eq!(bool_item.mode, BindMode::Init);
        assert_eq!(bool_item.maxage, Some(7.0));

        assert_eq!(config.definition_for("main.ro").acl, Acl::Ro);
        assert_eq!(config.definition_for("main.other").kind, ValueKind::Num);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("itemlog.json");
        fs::write(&path, r#"{ "database": "log.sqlite3", "precision": -1 }"#).unwrap();

        let config = PluginConfig::load(&path).unwrap();
        assert_eq!(config.database, "log.sqlite3");
        assert_eq!(config.precision, -1);
    }
}
