//! SQLite storage backend implementation.
//!
//! Each collection is a table of JSON text documents. Declared indexes become
//! SQLite expression indexes over `json_extract`, so unique constraints are
//! enforced by the database itself and hold across processes sharing the file.

use super::{
    Clause, CollectionOptions, Document, DocumentStore, Filter, FindOptions, IndexSpec,
    SortOrder, StorageStats, Update, UpdateResult, check_name,
};
use crate::CredentialError;
use async_trait::async_trait;
use rusqlite::types::Value as SqlValue;
use rusqlite::{
    Connection, OptionalExtension, TransactionBehavior, params, params_from_iter,
};
use serde_json::Value;
use std::sync::{Arc, Mutex, MutexGuard};

/// SQLite-based document store.
///
/// # Features
///
/// - **Persistent storage**: Data survives application restarts
/// - **Database-enforced uniqueness**: Unique indexes are SQLite `UNIQUE` indexes
/// - **Atomic updates**: Every read-modify-write runs in an immediate transaction
/// - **Thread-safe**: Uses `Arc<Mutex<Connection>>` for concurrent access
///
/// # Example
///
/// ```rust
/// use credential_core::storage::SqliteStore;
/// use std::sync::Arc;
///
/// # fn example() -> Result<(), credential_core::CredentialError> {
/// // File-based storage
/// let store = Arc::new(SqliteStore::new("credentials.db")?);
///
/// // Or in-memory SQLite (for testing)
/// let memory_store = Arc::new(SqliteStore::new(":memory:")?);
/// # Ok(())
/// # }
/// ```
pub struct SqliteStore {
    connection: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Opens (or creates) a SQLite database.
    ///
    /// # Arguments
    ///
    /// * `db_path` - Path to the SQLite database file, or ":memory:" for an in-memory database
    pub fn new(db_path: &str) -> Result<Self, CredentialError> {
        let connection = if db_path == ":memory:" {
            Connection::open_in_memory()
        } else {
            Connection::open(db_path)
        }
        .map_err(storage_err)?;

        init_schema(&connection)?;

        Ok(Self {
            connection: Arc::new(Mutex::new(connection)),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, CredentialError> {
        self.connection
            .lock()
            .map_err(|_| CredentialError::from_storage_message("SQLite connection lock poisoned"))
    }
}

fn init_schema(conn: &Connection) -> Result<(), CredentialError> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS _credential_indexes (
            collection TEXT NOT NULL,
            name TEXT NOT NULL,
            keys TEXT NOT NULL,
            is_unique INTEGER NOT NULL,
            expire_after_ms INTEGER,
            PRIMARY KEY (collection, name)
        );
        CREATE TABLE IF NOT EXISTS _credential_collections (
            collection TEXT PRIMARY KEY,
            max_bytes INTEGER NOT NULL,
            max_documents INTEGER
        );
        "#,
    )
    .map_err(storage_err)
}

fn storage_err(e: rusqlite::Error) -> CredentialError {
    CredentialError::from_storage_message(e.to_string())
}

/// Maps unique constraint failures to `DuplicateKey`.
fn write_err(collection: &str, e: rusqlite::Error) -> CredentialError {
    if let rusqlite::Error::SqliteFailure(err, message) = &e {
        if err.code == rusqlite::ErrorCode::ConstraintViolation {
            return CredentialError::DuplicateKey(format!(
                "{collection}: {}",
                message.as_deref().unwrap_or("unique constraint failed")
            ));
        }
    }
    storage_err(e)
}

// Names are spliced into SQL; `check_name` keeps them to plain identifiers.
fn field_expr(field: &str) -> Result<String, CredentialError> {
    Ok(format!("json_extract(doc, '$.{}')", check_name(field)?))
}

fn ensure_collection(conn: &Connection, collection: &str) -> Result<(), CredentialError> {
    check_name(collection)?;
    conn.execute(
        &format!(
            "CREATE TABLE IF NOT EXISTS \"{collection}\" (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                doc TEXT NOT NULL
            )"
        ),
        [],
    )
    .map_err(storage_err)?;
    Ok(())
}

fn to_sql_value(value: &Value) -> Result<SqlValue, CredentialError> {
    Ok(match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => SqlValue::Real(n.as_f64().unwrap_or(f64::NAN)),
        },
        Value::String(s) => SqlValue::Text(s.clone()),
        other => SqlValue::Text(serde_json::to_string(other)?),
    })
}

/// Translates a filter into a SQL predicate with positional parameters.
fn where_clause(filter: &Filter) -> Result<(String, Vec<SqlValue>), CredentialError> {
    let mut predicates = Vec::new();
    let mut params = Vec::new();

    for clause in filter.clauses() {
        let expr = field_expr(clause.field())?;
        let path = format!("'$.{}'", clause.field());
        let (op, value) = match clause {
            Clause::Eq { value, .. } => ("=", value),
            Clause::Gte { value, .. } => (">=", value),
            Clause::Lte { value, .. } => ("<=", value),
        };

        match (clause, value) {
            (Clause::Eq { .. }, Value::Null) => predicates.push(format!("{expr} IS NULL")),
            (Clause::Eq { .. }, _) => {
                predicates.push(format!("{expr} = ?"));
                params.push(to_sql_value(value)?);
            }
            // Range clauses only compare values of the same JSON type.
            (_, Value::Number(_)) => {
                predicates.push(format!(
                    "json_type(doc, {path}) IN ('integer', 'real') AND {expr} {op} ?"
                ));
                params.push(to_sql_value(value)?);
            }
            (_, Value::String(_)) => {
                predicates.push(format!("json_type(doc, {path}) = 'text' AND {expr} {op} ?"));
                params.push(to_sql_value(value)?);
            }
            _ => predicates.push("0".to_string()),
        }
    }

    if predicates.is_empty() {
        Ok(("1".to_string(), params))
    } else {
        Ok((predicates.join(" AND "), params))
    }
}

fn parse_document(raw: &str) -> Result<Document, CredentialError> {
    Ok(serde_json::from_str(raw)?)
}

fn select_first(
    conn: &Connection,
    collection: &str,
    filter: &Filter,
) -> Result<Option<(i64, Document)>, CredentialError> {
    let (predicate, params) = where_clause(filter)?;
    let mut stmt = conn
        .prepare(&format!(
            "SELECT id, doc FROM \"{collection}\" WHERE {predicate} ORDER BY id LIMIT 1"
        ))
        .map_err(storage_err)?;
    let row = stmt
        .query_row(params_from_iter(params.iter()), |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
        })
        .optional()
        .map_err(storage_err)?;

    row.map(|(id, raw)| Ok((id, parse_document(&raw)?)))
        .transpose()
}

fn insert_document(
    conn: &Connection,
    collection: &str,
    document: &Document,
) -> Result<(), CredentialError> {
    conn.execute(
        &format!("INSERT INTO \"{collection}\" (doc) VALUES (?1)"),
        params![serde_json::to_string(document)?],
    )
    .map_err(|e| write_err(collection, e))?;
    Ok(())
}

/// Evicts the oldest documents of a capped collection.
fn enforce_cap(conn: &Connection, collection: &str) -> Result<(), CredentialError> {
    let limits: Option<(i64, Option<i64>)> = conn
        .query_row(
            "SELECT max_bytes, max_documents FROM _credential_collections WHERE collection = ?1",
            params![collection],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()
        .map_err(storage_err)?;
    let Some((max_bytes, max_documents)) = limits else {
        return Ok(());
    };

    if let Some(max) = max_documents {
        conn.execute(
            &format!(
                "DELETE FROM \"{collection}\" WHERE id IN
                    (SELECT id FROM \"{collection}\" ORDER BY id DESC LIMIT -1 OFFSET ?1)"
            ),
            params![max],
        )
        .map_err(storage_err)?;
    }

    loop {
        let (bytes, count): (i64, i64) = conn
            .query_row(
                &format!(
                    "SELECT COALESCE(SUM(length(CAST(doc AS BLOB))), 0), COUNT(*) FROM \"{collection}\""
                ),
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .map_err(storage_err)?;
        if bytes <= max_bytes || count <= 1 {
            return Ok(());
        }
        conn.execute(
            &format!(
                "DELETE FROM \"{collection}\" WHERE id = (SELECT MIN(id) FROM \"{collection}\")"
            ),
            [],
        )
        .map_err(storage_err)?;
    }
}

#[async_trait]
impl DocumentStore for SqliteStore {
    async fn init(&self) -> Result<(), CredentialError> {
        let conn = self.lock()?;
        init_schema(&conn)
    }

    async fn create_collection(
        &self,
        collection: &str,
        options: CollectionOptions,
    ) -> Result<(), CredentialError> {
        let mut conn = self.lock()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(storage_err)?;
        ensure_collection(&tx, collection)?;

        match options.capped {
            Some(capped) => {
                tx.execute(
                    "INSERT INTO _credential_collections (collection, max_bytes, max_documents)
                     VALUES (?1, ?2, ?3)
                     ON CONFLICT(collection) DO UPDATE
                     SET max_bytes = excluded.max_bytes, max_documents = excluded.max_documents",
                    params![
                        collection,
                        capped.max_bytes as i64,
                        capped.max_documents.map(|m| m as i64)
                    ],
                )
                .map_err(storage_err)?;
                enforce_cap(&tx, collection)?;
            }
            None => {
                tx.execute(
                    "DELETE FROM _credential_collections WHERE collection = ?1",
                    params![collection],
                )
                .map_err(storage_err)?;
            }
        }

        tx.commit().map_err(storage_err)
    }

    async fn create_index(
        &self,
        collection: &str,
        index: IndexSpec,
    ) -> Result<(), CredentialError> {
        index.validate()?;
        check_name(&index.name)?;
        let expressions = index
            .keys
            .iter()
            .map(|key| field_expr(key))
            .collect::<Result<Vec<_>, _>>()?
            .join(", ");

        let mut conn = self.lock()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(storage_err)?;
        ensure_collection(&tx, collection)?;

        let sql_name = format!("{collection}__{}", index.name);
        tx.execute(&format!("DROP INDEX IF EXISTS \"{sql_name}\""), [])
            .map_err(storage_err)?;
        tx.execute(
            &format!(
                "CREATE {}INDEX \"{sql_name}\" ON \"{collection}\" ({expressions})",
                if index.unique { "UNIQUE " } else { "" }
            ),
            [],
        )
        .map_err(|e| write_err(collection, e))?;

        tx.execute(
            "INSERT OR REPLACE INTO _credential_indexes
                (collection, name, keys, is_unique, expire_after_ms)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                collection,
                index.name,
                serde_json::to_string(&index.keys)?,
                index.unique,
                index.expire_after.map(|ttl| ttl.as_millis() as i64)
            ],
        )
        .map_err(storage_err)?;

        tx.commit().map_err(storage_err)
    }

    async fn insert(&self, collection: &str, document: Document) -> Result<(), CredentialError> {
        let mut conn = self.lock()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(storage_err)?;
        ensure_collection(&tx, collection)?;
        insert_document(&tx, collection, &document)?;
        enforce_cap(&tx, collection)?;
        tx.commit().map_err(storage_err)
    }

    async fn insert_many(
        &self,
        collection: &str,
        documents: Vec<Document>,
    ) -> Result<(), CredentialError> {
        let mut conn = self.lock()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(storage_err)?;
        ensure_collection(&tx, collection)?;
        for document in &documents {
            // Dropping the transaction on error rolls the whole batch back.
            insert_document(&tx, collection, document)?;
        }
        enforce_cap(&tx, collection)?;
        tx.commit().map_err(storage_err)
    }

    async fn find_one(
        &self,
        collection: &str,
        filter: &Filter,
    ) -> Result<Option<Document>, CredentialError> {
        let conn = self.lock()?;
        ensure_collection(&conn, collection)?;
        Ok(select_first(&conn, collection, filter)?.map(|(_, document)| document))
    }

    async fn find(
        &self,
        collection: &str,
        filter: &Filter,
        options: FindOptions,
    ) -> Result<Vec<Document>, CredentialError> {
        let (predicate, mut params) = where_clause(filter)?;
        let order = match &options.sort {
            Some((field, SortOrder::Ascending)) => format!("{} ASC, id ASC", field_expr(field)?),
            Some((field, SortOrder::Descending)) => {
                format!("{} DESC, id DESC", field_expr(field)?)
            }
            None => "id ASC".to_string(),
        };
        params.push(SqlValue::Integer(
            options.limit.map_or(-1, |limit| limit as i64),
        ));
        params.push(SqlValue::Integer(options.skip as i64));

        let conn = self.lock()?;
        ensure_collection(&conn, collection)?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT doc FROM \"{collection}\" WHERE {predicate} ORDER BY {order} LIMIT ? OFFSET ?"
            ))
            .map_err(storage_err)?;
        let rows = stmt
            .query_map(params_from_iter(params.iter()), |row| row.get::<_, String>(0))
            .map_err(storage_err)?;

        let mut documents = Vec::new();
        for raw in rows {
            documents.push(parse_document(&raw.map_err(storage_err)?)?);
        }
        Ok(documents)
    }

    async fn update_one(
        &self,
        collection: &str,
        filter: &Filter,
        update: &Update,
        upsert: bool,
    ) -> Result<UpdateResult, CredentialError> {
        let mut conn = self.lock()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(storage_err)?;
        ensure_collection(&tx, collection)?;

        let result = match select_first(&tx, collection, filter)? {
            Some((id, mut document)) => {
                if update.apply(&mut document) {
                    tx.execute(
                        &format!("UPDATE \"{collection}\" SET doc = ?1 WHERE id = ?2"),
                        params![serde_json::to_string(&document)?, id],
                    )
                    .map_err(|e| write_err(collection, e))?;
                    UpdateResult {
                        matched_count: 1,
                        modified_count: 1,
                        upserted: false,
                    }
                } else {
                    UpdateResult {
                        matched_count: 1,
                        modified_count: 0,
                        upserted: false,
                    }
                }
            }
            None if upsert => {
                let mut seeded = filter.seed_document();
                update.apply(&mut seeded);
                insert_document(&tx, collection, &seeded)?;
                enforce_cap(&tx, collection)?;
                UpdateResult {
                    matched_count: 0,
                    modified_count: 0,
                    upserted: true,
                }
            }
            None => UpdateResult::default(),
        };

        tx.commit().map_err(storage_err)?;
        Ok(result)
    }

    async fn find_one_and_delete(
        &self,
        collection: &str,
        filter: &Filter,
    ) -> Result<Option<Document>, CredentialError> {
        let mut conn = self.lock()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(storage_err)?;
        ensure_collection(&tx, collection)?;

        let found = select_first(&tx, collection, filter)?;
        if let Some((id, _)) = &found {
            tx.execute(
                &format!("DELETE FROM \"{collection}\" WHERE id = ?1"),
                params![id],
            )
            .map_err(storage_err)?;
        }

        tx.commit().map_err(storage_err)?;
        Ok(found.map(|(_, document)| document))
    }

    async fn purge_expired(&self, collection: &str, now: i64) -> Result<usize, CredentialError> {
        let conn = self.lock()?;
        ensure_collection(&conn, collection)?;

        let ttl_indexes: Vec<(String, i64)> = {
            let mut stmt = conn
                .prepare(
                    "SELECT keys, expire_after_ms FROM _credential_indexes
                     WHERE collection = ?1 AND expire_after_ms IS NOT NULL",
                )
                .map_err(storage_err)?;
            let rows = stmt
                .query_map(params![collection], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
                })
                .map_err(storage_err)?;
            rows.collect::<Result<_, _>>().map_err(storage_err)?
        };

        let mut removed = 0;
        for (keys, ttl_ms) in ttl_indexes {
            let keys: Vec<String> = serde_json::from_str(&keys)?;
            let Some(field) = keys.first() else {
                continue;
            };
            let expr = field_expr(field)?;
            removed += conn
                .execute(
                    &format!(
                        "DELETE FROM \"{collection}\"
                         WHERE json_type(doc, '$.{field}') = 'integer' AND {expr} < ?1"
                    ),
                    params![now.saturating_sub(ttl_ms)],
                )
                .map_err(storage_err)?;
        }

        Ok(removed)
    }

    async fn get_stats(&self, collection: &str) -> Result<StorageStats, CredentialError> {
        let conn = self.lock()?;
        ensure_collection(&conn, collection)?;

        let count: usize = conn
            .query_row(&format!("SELECT COUNT(*) FROM \"{collection}\""), [], |row| {
                row.get(0)
            })
            .map_err(storage_err)?;

        // Get additional SQLite-specific stats
        let db_size: i64 = conn
            .query_row("PRAGMA page_count", [], |row| row.get(0))
            .unwrap_or(0);

        let page_size: i64 = conn
            .query_row("PRAGMA page_size", [], |row| row.get(0))
            .unwrap_or(4096);

        let size_bytes = db_size * page_size;

        Ok(StorageStats {
            total_records: count,
            backend_info: format!("SQLite storage ({size_bytes} bytes, {db_size} pages)"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credential::storage::CappedOptions;
    use serde_json::json;
    use std::time::Duration;

    fn doc(value: Value) -> Document {
        match value {
            Value::Object(map) => map,
            _ => panic!("not an object"),
        }
    }

    async fn store_with_unique_code() -> Result<SqliteStore, CredentialError> {
        let store = SqliteStore::new(":memory:")?;
        store.init().await?;
        store
            .create_index("codes", IndexSpec::new(&["owner", "code"]).unique())
            .await?;
        Ok(store)
    }

    #[tokio::test]
    async fn test_sqlite_store_basic_operations() -> Result<(), CredentialError> {
        let store = store_with_unique_code().await?;

        store
            .insert("codes", doc(json!({"owner": "a", "code": "X", "n": 1})))
            .await?;
        let found = store
            .find_one("codes", &Filter::new().eq("owner", "a").eq("code", "X"))
            .await?
            .unwrap();
        assert_eq!(found["n"], 1);

        assert!(
            store
                .find_one("codes", &Filter::new().eq("code", "Y"))
                .await?
                .is_none()
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_sqlite_store_duplicate_key() -> Result<(), CredentialError> {
        let store = store_with_unique_code().await?;

        store
            .insert("codes", doc(json!({"owner": "a", "code": "X"})))
            .await?;
        let result = store
            .insert("codes", doc(json!({"owner": "a", "code": "X"})))
            .await;
        assert!(matches!(result, Err(CredentialError::DuplicateKey(_))));

        // A different owner may hold the same code.
        store
            .insert("codes", doc(json!({"owner": "b", "code": "X"})))
            .await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_sqlite_store_insert_many_rolls_back() -> Result<(), CredentialError> {
        let store = store_with_unique_code().await?;

        let result = store
            .insert_many(
                "codes",
                vec![
                    doc(json!({"owner": "a", "code": "1"})),
                    doc(json!({"owner": "a", "code": "1"})),
                ],
            )
            .await;
        assert!(matches!(result, Err(CredentialError::DuplicateKey(_))));
        assert_eq!(store.get_stats("codes").await?.total_records, 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_sqlite_store_conditional_update() -> Result<(), CredentialError> {
        let store = store_with_unique_code().await?;
        store
            .insert(
                "codes",
                doc(json!({"owner": "a", "code": "X", "status": "issued"})),
            )
            .await?;

        let issued = Filter::new().eq("code", "X").eq("status", "issued");
        let update = Update::new().set("status", "used").set("usedAt", 5);

        let first = store.update_one("codes", &issued, &update, false).await?;
        assert_eq!(first.modified_count, 1);
        let second = store.update_one("codes", &issued, &update, false).await?;
        assert_eq!(second.matched_count, 0);

        let stored = store
            .find_one("codes", &Filter::new().eq("code", "X"))
            .await?
            .unwrap();
        assert_eq!(stored["status"], "used");
        assert_eq!(stored["usedAt"], 5);
        Ok(())
    }

    #[tokio::test]
    async fn test_sqlite_store_upsert_and_null_match() -> Result<(), CredentialError> {
        let store = SqliteStore::new(":memory:")?;
        let filter = Filter::new().eq("user", "alice");

        let result = store
            .update_one("users", &filter, &Update::new().set("verified", true), true)
            .await?;
        assert!(result.upserted);

        let found = store
            .find_one(
                "users",
                &Filter::new().eq("user", "alice").eq("email", Value::Null),
            )
            .await?
            .unwrap();
        assert_eq!(found["verified"], true);
        Ok(())
    }

    #[tokio::test]
    async fn test_sqlite_store_find_one_and_delete() -> Result<(), CredentialError> {
        let store = store_with_unique_code().await?;
        store
            .insert("codes", doc(json!({"owner": "a", "code": "X"})))
            .await?;

        let filter = Filter::new().eq("owner", "a").eq("code", "X");
        assert!(store.find_one_and_delete("codes", &filter).await?.is_some());
        assert!(store.find_one_and_delete("codes", &filter).await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_sqlite_store_find_range_sorted() -> Result<(), CredentialError> {
        let store = SqliteStore::new(":memory:")?;
        for i in 0..5 {
            store
                .insert("logs", doc(json!({"n": i, "createdAt": 100 + i})))
                .await?;
        }
        store.insert("logs", doc(json!({"n": 99, "createdAt": "late"}))).await?;

        let found = store
            .find(
                "logs",
                &Filter::new().gte("createdAt", 101).lte("createdAt", 103),
                FindOptions::new().sort("createdAt", SortOrder::Descending),
            )
            .await?;
        let ns: Vec<i64> = found.iter().map(|d| d["n"].as_i64().unwrap()).collect();
        assert_eq!(ns, vec![3, 2, 1]);

        let page = store
            .find(
                "logs",
                &Filter::new(),
                FindOptions::new().skip(4).limit(10),
            )
            .await?;
        assert_eq!(page.len(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_sqlite_store_purge_expired() -> Result<(), CredentialError> {
        let store = SqliteStore::new(":memory:")?;
        store
            .create_index(
                "codes",
                IndexSpec::new(&["createdAt"]).expire_after(Duration::from_secs(10)),
            )
            .await?;
        store.insert("codes", doc(json!({"createdAt": 0}))).await?;
        store.insert("codes", doc(json!({"createdAt": 5_000}))).await?;

        assert_eq!(store.purge_expired("codes", 10_000).await?, 0);
        assert_eq!(store.purge_expired("codes", 10_001).await?, 1);
        assert_eq!(store.get_stats("codes").await?.total_records, 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_sqlite_store_capped_collection() -> Result<(), CredentialError> {
        let store = SqliteStore::new(":memory:")?;
        store
            .create_collection(
                "logs",
                CollectionOptions {
                    capped: Some(CappedOptions {
                        max_bytes: 1 << 20,
                        max_documents: Some(2),
                    }),
                },
            )
            .await?;
        for i in 0..4 {
            store.insert("logs", doc(json!({"n": i}))).await?;
        }

        let remaining = store.find("logs", &Filter::new(), FindOptions::new()).await?;
        let ns: Vec<i64> = remaining.iter().map(|d| d["n"].as_i64().unwrap()).collect();
        assert_eq!(ns, vec![2, 3]);
        Ok(())
    }

    #[tokio::test]
    async fn test_sqlite_store_rejects_unsafe_names() -> Result<(), CredentialError> {
        let store = SqliteStore::new(":memory:")?;
        let result = store
            .insert("codes\"; DROP TABLE x; --", doc(json!({"a": 1})))
            .await;
        assert!(matches!(result, Err(CredentialError::InvalidConfiguration(_))));

        let result = store
            .find_one("codes", &Filter::new().eq("a') OR 1=1 --", 1))
            .await;
        assert!(matches!(result, Err(CredentialError::InvalidConfiguration(_))));
        Ok(())
    }

    #[tokio::test]
    async fn test_sqlite_store_persistence() -> Result<(), CredentialError> {
        let dir = tempfile::tempdir()
            .map_err(|e| CredentialError::from_storage_message(e.to_string()))?;
        let path = dir.path().join("credentials.db");
        let path = path.to_str().unwrap();

        {
            let store = SqliteStore::new(path)?;
            store
                .create_index("codes", IndexSpec::new(&["code"]).unique())
                .await?;
            store.insert("codes", doc(json!({"code": "kept"}))).await?;
        }

        {
            let store = SqliteStore::new(path)?;
            assert!(
                store
                    .find_one("codes", &Filter::new().eq("code", "kept"))
                    .await?
                    .is_some()
            );
            // The unique index survives the reopen.
            let result = store.insert("codes", doc(json!({"code": "kept"}))).await;
            assert!(matches!(result, Err(CredentialError::DuplicateKey(_))));
        }

        Ok(())
    }
}
