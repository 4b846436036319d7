use rusqlite::{params, Connection, OptionalExtension};

use crate::db::{
    error::map_insert_error,
    helpers::row_to_item,
    models::{ItemDescriptor, Value, ValueKind},
    Database, StoreError, StoreResult,
};

const ITEM_COLUMNS: &str =
    "id, name, kind, open_time, last_time, value_num, value_str, changed";

fn find_item_id(conn: &Connection, name: &str) -> StoreResult<Option<i64>> {
    Ok(conn
        .query_row(
            "SELECT id FROM item WHERE name = ?1",
            params![name],
            |row| row.get(0),
        )
        .optional()?)
}

fn create_item(conn: &Connection, name: &str, kind: ValueKind) -> StoreResult<i64> {
    conn.execute(
        "INSERT INTO item (name, kind) VALUES (?1, ?2)",
        params![name, kind.as_str()],
    )
    .map_err(|err| map_insert_error(err, || format!("item '{name}' already exists")))?;
    Ok(conn.last_insert_rowid())
}

impl Database {
    /// Numeric identity of `name`; with `create`, unknown items are
    /// allocated as `num` items. The first bind may still change that kind
    /// while the item has no log (see `set_kind_if_unlogged`).
    pub async fn id(&self, name: &str, create: bool) -> StoreResult<i64> {
        let kind = create.then_some(ValueKind::Num);
        self.resolve_item(name, kind).await
    }

    /// Looks `name` up and, when `create_as` is set, allocates it with that
    /// kind if unknown. Lookup and allocation run in the same store task.
    pub async fn resolve_item(&self, name: &str, create_as: Option<ValueKind>) -> StoreResult<i64> {
        let name = name.to_string();
        self.execute(move |conn| {
            if let Some(id) = find_item_id(conn, &name)? {
                return Ok(id);
            }
            match create_as {
                Some(kind) => create_item(conn, &name, kind),
                None => Err(StoreError::NotFound(name)),
            }
        })
        .await
    }

    pub async fn insert_item(&self, name: &str, kind: ValueKind) -> StoreResult<i64> {
        let name = name.to_string();
        self.execute(move |conn| create_item(conn, &name, kind)).await
    }

    pub async fn read_item(&self, item_id: i64) -> StoreResult<Option<ItemDescriptor>> {
        self.execute(move |conn| {
            let mut stmt = conn.prepare(&format!("SELECT {ITEM_COLUMNS} FROM item WHERE id = ?1"))?;
            let mut rows = stmt.query(params![item_id])?;
            match rows.next()? {
                Some(row) => Ok(Some(row_to_item(row)?)),
                None => Ok(None),
            }
        })
        .await
    }

    pub async fn read_item_by_name(&self, name: &str) -> StoreResult<Option<ItemDescriptor>> {
        let name = name.to_string();
        self.execute(move |conn| {
            let mut stmt =
                conn.prepare(&format!("SELECT {ITEM_COLUMNS} FROM item WHERE name = ?1"))?;
            let mut rows = stmt.query(params![name])?;
            match rows.next()? {
                Some(row) => Ok(Some(row_to_item(row)?)),
                None => Ok(None),
            }
        })
        .await
    }

    /// Changes the kind of an item that has no records yet. Returns whether
    /// the kind was changed.
    pub async fn set_kind_if_unlogged(&self, item_id: i64, kind: ValueKind) -> StoreResult<bool> {
        self.execute(move |conn| {
            let rows_affected = conn.execute(
                "UPDATE item SET kind = ?1
                 WHERE id = ?2
                   AND NOT EXISTS (SELECT 1 FROM log WHERE item_id = ?2)",
                params![kind.as_str(), item_id],
            )?;
            Ok(rows_affected > 0)
        })
        .await
    }

    pub async fn list_items(&self) -> StoreResult<Vec<ItemDescriptor>> {
        self.execute(|conn| {
            let mut stmt = conn.prepare(&format!("SELECT {ITEM_COLUMNS} FROM item ORDER BY id ASC"))?;
            let mut rows = stmt.query([])?;
            let mut items = Vec::new();
            while let Some(row) = rows.next()? {
                items.push(row_to_item(row)?);
            }
            Ok(items)
        })
        .await
    }

    /// Updates the last value cache that `init` bindings restore from.
    pub async fn update_item_value(
        &self,
        item_id: i64,
        time: i64,
        value: Value,
        changed: i64,
    ) -> StoreResult<()> {
        self.execute(move |conn| {
            let (value_num, value_str) = value.to_columns();
            let rows_affected = conn.execute(
                "UPDATE item
                 SET last_time = ?1,
                     value_num = ?2,
                     value_str = ?3,
                     changed = ?4
                 WHERE id = ?5",
                params![time, value_num, value_str, changed, item_id],
            )?;

            if rows_affected == 0 {
                return Err(StoreError::NotFound(format!("#{item_id}")));
            }
            Ok(())
        })
        .await
    }

    /// Deletes an item together with its whole log.
    pub async fn delete_item(&self, item_id: i64) -> StoreResult<()> {
        self.execute(move |conn| {
            let tx = conn.transaction()?;

            tx.execute("DELETE FROM log WHERE item_id = ?1", params![item_id])?;
            tx.execute("DELETE FROM item WHERE id = ?1", params![item_id])?;
            tx.commit()?;
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_id_not_creating_unknown_item() {
        let db = Database::open_in_memory().unwrap();
        let result = db.id("main.num", false).await;
        assert!(matches!(result, Err(StoreError::NotFound(name)) if name == "main.num"));
    }

    #[tokio::test]
    async fn test_id_assigns_sequential_identities() {
        let db = Database::open_in_memory().unwrap();
        assert_eq!(db.id("main.num", true).await.unwrap(), 1);
        assert_eq!(db.id("main.str", true).await.unwrap(), 2);
        assert_eq!(db.id("main.bool", true).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_id_round_trip() {
        let db = Database::open_in_memory().unwrap();
        let created = db.id("main.num", true).await.unwrap();
        assert_eq!(db.id("main.num", false).await.unwrap(), created);
        assert_eq!(db.id("main.num", true).await.unwrap(), created);
    }

    #[tokio::test]
    async fn test_insert_duplicate_item_conflicts() {
        let db = Database::open_in_memory().unwrap();
        db.insert_item("manually.inserted", ValueKind::Str).await.unwrap();
        let duplicate = db.insert_item("manually.inserted", ValueKind::Str).await;
        assert!(matches!(duplicate, Err(StoreError::Conflict(_))));
    }

    #[tokio::test]
    async fn test_read_item_unknown_is_none() {
        let db = Database::open_in_memory().unwrap();
        assert!(db.read_item(1).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_update_item_value_is_cached() {
        let db = Database::open_in_memory().unwrap();
        let id = db.insert_item("manually.inserted", ValueKind::Str).await.unwrap();
        db.update_item_value(id, 0, Value::from("test"), 5).await.unwrap();

        let item = db.read_item(id).await.unwrap().unwrap();
        assert_eq!(item.name, "manually.inserted");
        assert_eq!(item.kind, ValueKind::Str);
        assert_eq!(item.last_time, Some(0));
        assert_eq!(item.last_value, Some(Value::from("test")));
        assert_eq!(item.changed, Some(5));
    }

    #[tokio::test]
    async fn test_delete_item_removes_identity() {
        let db = Database::open_in_memory().unwrap();
        let id = db.id("main.num", true).await.unwrap();
        db.insert_log(id, 0, 3600, Value::Num(10.0), ValueKind::Num)
            .await
            .unwrap();

        db.delete_item(id).await.unwrap();

        assert!(matches!(
            db.id("main.num", false).await,
            Err(StoreError::NotFound(_))
        ));
        assert_eq!(db.log_count(id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_list_items_in_identity_order() {
        let db = Database::open_in_memory().unwrap();
        db.id("main.num", true).await.unwrap();
        db.insert_item("main.str", ValueKind::Str).await.unwrap();
        db.insert_item("main.bool", ValueKind::Bool).await.unwrap();

        let items = db.list_items().await.unwrap();
        let names: Vec<_> = items.iter().map(|item| item.name.as_str()).collect();
        assert_eq!(names, vec!["main.num", "main.str", "main.bool"]);
        assert_eq!(items[2].kind, ValueKind::Bool);
    }

    #[tokio::test]
    async fn test_read_item_by_name() {
        let db = Database::open_in_memory().unwrap();
        let id = db.insert_item("main.str", ValueKind::Str).await.unwrap();

        let item = db.read_item_by_name("main.str").await.unwrap().unwrap();
        assert_eq!(item.id, id);
        assert_eq!(item.kind, ValueKind::Str);
        assert!(db.read_item_by_name("main.unknown").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_set_kind_only_before_first_record() {
        let db = Database::open_in_memory().unwrap();
        let id = db.id("main.bool", true).await.unwrap();

        assert!(db.set_kind_if_unlogged(id, ValueKind::Bool).await.unwrap());
        assert_eq!(db.read_item(id).await.unwrap().unwrap().kind, ValueKind::Bool);

        db.insert_log(id, 0, 10, Value::Bool(true), ValueKind::Bool)
            .await
            .unwrap();
        assert!(!db.set_kind_if_unlogged(id, ValueKind::Str).await.unwrap());
        assert_eq!(db.read_item(id).await.unwrap().unwrap().kind, ValueKind::Bool);
    }
}
