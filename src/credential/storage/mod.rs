//! Pluggable document stores for credential persistence.
//!
//! Services in this crate never talk to a database directly. They go through
//! the [`DocumentStore`] trait, which models a collection-of-JSON-documents
//! store with unique indexes, TTL indexes and a handful of single-document
//! atomic operations. The available backends depend on the enabled features.

use std::cmp::Ordering;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::CredentialError;

// Always available
mod memory;
pub use memory::MemoryStore;

// Feature-gated storage backends
#[cfg(feature = "sqlite-store")]
mod sqlite;
#[cfg(feature = "sqlite-store")]
pub use sqlite::SqliteStore;

#[cfg(feature = "redis-store")]
mod redis;
#[cfg(feature = "redis-store")]
pub use redis::RedisStore;

/// A stored record: a JSON object keyed by field name.
pub type Document = serde_json::Map<String, Value>;

/// Converts a serializable record into a [`Document`].
pub fn to_document<T: Serialize>(record: &T) -> Result<Document, CredentialError> {
    match serde_json::to_value(record)? {
        Value::Object(map) => Ok(map),
        other => Err(CredentialError::SerializationError(format!(
            "Expected a JSON object, got {other}"
        ))),
    }
}

/// Checks a collection, index or field name.
///
/// Names must be ASCII letters, digits and `_`, and may not start with the
/// reserved `_credential` prefix. Every backend accepts exactly these names.
pub fn check_name(name: &str) -> Result<&str, CredentialError> {
    let valid = !name.is_empty()
        && !name.starts_with("_credential")
        && name.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_');
    if valid {
        Ok(name)
    } else {
        Err(CredentialError::InvalidConfiguration(format!(
            "'{name}' is not a valid collection or field name (use ASCII letters, digits and '_')"
        )))
    }
}

/// Converts a [`Document`] back into a typed record.
pub fn from_document<T: DeserializeOwned>(document: Document) -> Result<T, CredentialError> {
    Ok(serde_json::from_value(Value::Object(document))?)
}

/// One predicate of a [`Filter`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum Clause {
    Eq { field: String, value: Value },
    Gte { field: String, value: Value },
    Lte { field: String, value: Value },
}

impl Clause {
    pub fn field(&self) -> &str {
        match self {
            Self::Eq { field, .. } | Self::Gte { field, .. } | Self::Lte { field, .. } => field,
        }
    }

    fn matches(&self, document: &Document) -> bool {
        match self {
            Self::Eq { field, value } => field_value(document, field) == value,
            Self::Gte { field, value } => matches!(
                compare_values(field_value(document, field), value),
                Some(Ordering::Greater | Ordering::Equal)
            ),
            Self::Lte { field, value } => matches!(
                compare_values(field_value(document, field), value),
                Some(Ordering::Less | Ordering::Equal)
            ),
        }
    }
}

/// A conjunction of field predicates.
///
/// Filters carry both identity and expected-state predicates, which is what
/// makes conditional updates possible:
///
/// ```rust
/// use credential_core::storage::Filter;
///
/// let filter = Filter::new().eq("code", "X").eq("status", "issued");
/// assert_eq!(filter.clauses().len(), 2);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Filter {
    clauses: Vec<Clause>,
}

impl Filter {
    /// An empty filter matches every document.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn eq(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.clauses.push(Clause::Eq {
            field: field.into(),
            value: value.into(),
        });
        self
    }

    pub fn gte(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.clauses.push(Clause::Gte {
            field: field.into(),
            value: value.into(),
        });
        self
    }

    pub fn lte(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.clauses.push(Clause::Lte {
            field: field.into(),
            value: value.into(),
        });
        self
    }

    pub fn clauses(&self) -> &[Clause] {
        &self.clauses
    }

    /// Returns `true` if every clause holds for `document`.
    pub fn matches(&self, document: &Document) -> bool {
        self.clauses.iter().all(|clause| clause.matches(document))
    }

    /// Seeds a new document from the equality clauses (used by upserts).
    pub fn seed_document(&self) -> Document {
        self.clauses
            .iter()
            .filter_map(|clause| match clause {
                Clause::Eq { field, value } => Some((field.clone(), value.clone())),
                _ => None,
            })
            .collect()
    }
}

/// A field-assignment mutation, applied atomically by
/// [`DocumentStore::update_one`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Update {
    set: Document,
}

impl Update {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set.insert(field.into(), value.into());
        self
    }

    /// Applies the assignments to `document`, returning `true` if anything
    /// changed.
    pub fn apply(&self, document: &mut Document) -> bool {
        let mut changed = false;
        for (field, value) in &self.set {
            if document.get(field) != Some(value) {
                document.insert(field.clone(), value.clone());
                changed = true;
            }
        }
        changed
    }
}

/// Outcome of [`DocumentStore::update_one`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpdateResult {
    /// Documents that matched the filter (0 or 1).
    pub matched_count: u64,
    /// Documents actually changed by the update (0 or 1).
    pub modified_count: u64,
    /// Whether a new document was inserted because nothing matched.
    pub upserted: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Ascending,
    Descending,
}

/// Sorting and pagination for [`DocumentStore::find`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FindOptions {
    pub sort: Option<(String, SortOrder)>,
    pub skip: usize,
    /// `None` returns every remaining document.
    pub limit: Option<usize>,
}

impl FindOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sort(mut self, field: impl Into<String>, order: SortOrder) -> Self {
        self.sort = Some((field.into(), order));
        self
    }

    pub fn skip(mut self, skip: usize) -> Self {
        self.skip = skip;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Sorts, skips and truncates an already filtered result set in memory.
    ///
    /// The input is expected in insertion order; ties keep that order
    /// (ascending) or its reverse (descending), so the newest document comes
    /// first on a descending sort.
    pub fn apply(&self, mut documents: Vec<Document>) -> Vec<Document> {
        if let Some((field, order)) = &self.sort {
            match order {
                SortOrder::Ascending => documents.sort_by(|a, b| {
                    compare_for_sort(field_value(a, field), field_value(b, field))
                }),
                SortOrder::Descending => {
                    documents.reverse();
                    documents.sort_by(|a, b| {
                        compare_for_sort(field_value(b, field), field_value(a, field))
                    });
                }
            }
        }
        documents
            .into_iter()
            .skip(self.skip)
            .take(self.limit.unwrap_or(usize::MAX))
            .collect()
    }
}

/// Declares a secondary index on a collection.
///
/// ```rust
/// use credential_core::storage::IndexSpec;
/// use std::time::Duration;
///
/// let unique = IndexSpec::new(&["owner", "type", "code"]).unique();
/// assert_eq!(unique.name, "owner_type_code");
///
/// let ttl = IndexSpec::new(&["createdAt"]).expire_after(Duration::from_secs(600));
/// assert!(ttl.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexSpec {
    pub name: String,
    pub keys: Vec<String>,
    pub unique: bool,
    /// Documents whose first key (a Unix-millisecond timestamp) is older than
    /// this become eligible for automatic removal.
    pub expire_after: Option<Duration>,
}

impl IndexSpec {
    pub fn new(keys: &[&str]) -> Self {
        Self {
            name: keys.join("_"),
            keys: keys.iter().map(|k| k.to_string()).collect(),
            unique: false,
            expire_after: None,
        }
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn expire_after(mut self, ttl: Duration) -> Self {
        self.expire_after = Some(ttl);
        self
    }

    /// Checks that the index is well formed.
    pub fn validate(&self) -> Result<(), CredentialError> {
        if self.keys.is_empty() {
            return Err(CredentialError::InvalidConfiguration(
                "An index needs at least one key".to_string(),
            ));
        }
        if self.expire_after.is_some() && self.keys.len() != 1 {
            return Err(CredentialError::InvalidConfiguration(format!(
                "TTL index '{}' must have exactly one key",
                self.name
            )));
        }
        Ok(())
    }

    /// The values this index keys `document` on; missing fields are `null`.
    pub fn key_of(&self, document: &Document) -> Vec<Value> {
        self.keys
            .iter()
            .map(|key| field_value(document, key).clone())
            .collect()
    }
}

/// Size limits of a capped collection. Oldest documents are evicted first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CappedOptions {
    pub max_bytes: u64,
    pub max_documents: Option<u64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CollectionOptions {
    pub capped: Option<CappedOptions>,
}

/// Statistics about one collection of a storage backend.
#[derive(Debug, Clone)]
pub struct StorageStats {
    /// Total number of documents in the collection
    pub total_records: usize,
    /// Additional backend-specific information
    pub backend_info: String,
}

/// Abstract document store shared by every credential service.
///
/// # Atomicity
///
/// Correctness of the services rests entirely on these guarantees:
///
/// - [`insert`](Self::insert) checks every unique index and inserts in one
///   step, failing with [`CredentialError::DuplicateKey`] on a violation.
/// - [`update_one`](Self::update_one) matches and mutates in one step, so a
///   filter on `(code, expected status)` has at most one winner.
/// - [`find_one_and_delete`](Self::find_one_and_delete) removes the document
///   it returns; two concurrent callers can never both receive it.
///
/// # Thread Safety
///
/// All methods are async and must be safe to call concurrently from many
/// tasks and, for persistent backends, from many processes.
///
/// # Available Implementations
///
/// - [`MemoryStore`] - Always available, in-process storage
/// - `SqliteStore` - Available with `sqlite-store` feature, persistent SQLite storage
/// - `RedisStore` - Available with `redis-store` feature, shared Redis storage
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Optional backend initialization (schema creation, connection checks).
    async fn init(&self) -> Result<(), CredentialError> {
        Ok(())
    }

    /// Creates a collection with explicit options, such as a size cap.
    ///
    /// Collections are otherwise created implicitly on first write.
    async fn create_collection(
        &self,
        collection: &str,
        options: CollectionOptions,
    ) -> Result<(), CredentialError>;

    /// Declares an index. Re-declaring an index with the same name replaces it.
    ///
    /// Declaring a unique index over existing duplicates fails with
    /// `DuplicateKey`.
    async fn create_index(&self, collection: &str, index: IndexSpec)
    -> Result<(), CredentialError>;

    /// Inserts one document, honoring unique indexes.
    async fn insert(&self, collection: &str, document: Document) -> Result<(), CredentialError>;

    /// Inserts a batch of documents; either all of them land or none do.
    async fn insert_many(
        &self,
        collection: &str,
        documents: Vec<Document>,
    ) -> Result<(), CredentialError>;

    /// Returns the first document matching `filter`, in insertion order.
    async fn find_one(
        &self,
        collection: &str,
        filter: &Filter,
    ) -> Result<Option<Document>, CredentialError>;

    /// Returns every document matching `filter`, sorted and paginated.
    async fn find(
        &self,
        collection: &str,
        filter: &Filter,
        options: FindOptions,
    ) -> Result<Vec<Document>, CredentialError>;

    /// Atomically applies `update` to the first document matching `filter`.
    ///
    /// With `upsert`, a document seeded from the filter's equality clauses is
    /// inserted when nothing matches.
    async fn update_one(
        &self,
        collection: &str,
        filter: &Filter,
        update: &Update,
        upsert: bool,
    ) -> Result<UpdateResult, CredentialError>;

    /// Atomically removes and returns the first document matching `filter`.
    async fn find_one_and_delete(
        &self,
        collection: &str,
        filter: &Filter,
    ) -> Result<Option<Document>, CredentialError>;

    /// Removes documents that outlived a TTL index as of `now` (Unix ms).
    ///
    /// Backends with native expiry use this to reconcile their bookkeeping.
    ///
    /// # Returns
    ///
    /// * `Ok(count)` - Number of documents that were removed
    async fn purge_expired(&self, collection: &str, now: i64) -> Result<usize, CredentialError>;

    /// Returns statistics about a collection.
    async fn get_stats(&self, collection: &str) -> Result<StorageStats, CredentialError>;
}

static NULL: Value = Value::Null;

/// Looks up a top-level field, treating a missing field as `null`.
pub(crate) fn field_value<'a>(document: &'a Document, field: &str) -> &'a Value {
    document.get(field).unwrap_or(&NULL)
}

/// Orders two scalars of the same kind; `None` for anything else.
fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_i64(), y.as_i64()) {
            (Some(x), Some(y)) => Some(x.cmp(&y)),
            _ => x.as_f64()?.partial_cmp(&y.as_f64()?),
        },
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

/// Total order for sorting: null < bool < number < string < everything else.
fn compare_for_sort(a: &Value, b: &Value) -> Ordering {
    fn rank(v: &Value) -> u8 {
        match v {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Number(_) => 2,
            Value::String(_) => 3,
            Value::Array(_) => 4,
            Value::Object(_) => 5,
        }
    }
    compare_values(a, b).unwrap_or_else(|| rank(a).cmp(&rank(b)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(value: Value) -> Document {
        match value {
            Value::Object(map) => map,
            _ => panic!("not an object"),
        }
    }

    #[test]
    fn test_filter_equality_and_missing_fields() {
        let d = doc(json!({"code": "X", "status": "issued"}));
        assert!(Filter::new().matches(&d));
        assert!(Filter::new().eq("code", "X").eq("status", "issued").matches(&d));
        assert!(!Filter::new().eq("code", "X").eq("status", "used").matches(&d));
        assert!(Filter::new().eq("request", Value::Null).matches(&d));
    }

    #[test]
    fn test_filter_ranges() {
        let d = doc(json!({"createdAt": 1_000}));
        assert!(Filter::new().gte("createdAt", 1_000).lte("createdAt", 1_000).matches(&d));
        assert!(!Filter::new().gte("createdAt", 1_001).matches(&d));
        assert!(!Filter::new().lte("createdAt", 999).matches(&d));
        // Ranges never match across types or on missing fields.
        assert!(!Filter::new().gte("createdAt", "0").matches(&d));
        assert!(!Filter::new().gte("updatedAt", 0).matches(&d));
    }

    #[test]
    fn test_update_apply_reports_changes() {
        let mut d = doc(json!({"status": "issued"}));
        let update = Update::new().set("status", "processing");
        assert!(update.apply(&mut d));
        assert_eq!(d["status"], "processing");
        assert!(!update.apply(&mut d));
    }

    #[test]
    fn test_find_options_sort_skip_limit() {
        let docs: Vec<Document> = (0..5)
            .map(|i| doc(json!({"n": i, "createdAt": i / 2})))
            .collect();

        let newest_first = FindOptions::new()
            .sort("createdAt", SortOrder::Descending)
            .apply(docs.clone());
        let order: Vec<i64> = newest_first.iter().map(|d| d["n"].as_i64().unwrap()).collect();
        assert_eq!(order, vec![4, 3, 2, 1, 0]);

        let page = FindOptions::new()
            .sort("createdAt", SortOrder::Ascending)
            .skip(1)
            .limit(2)
            .apply(docs);
        let order: Vec<i64> = page.iter().map(|d| d["n"].as_i64().unwrap()).collect();
        assert_eq!(order, vec![1, 2]);
    }

    #[test]
    fn test_index_spec_validation() {
        assert!(IndexSpec::new(&[]).validate().is_err());
        assert!(
            IndexSpec::new(&["a", "b"])
                .expire_after(Duration::from_secs(1))
                .validate()
                .is_err()
        );
        let spec = IndexSpec::new(&["owner", "code"]).unique();
        assert!(spec.validate().is_ok());
        assert_eq!(
            spec.key_of(&doc(json!({"owner": "a"}))),
            vec![json!("a"), Value::Null]
        );
    }

    #[test]
    fn test_check_name() {
        for name in ["onetime_code", "createdAt", "v2"] {
            assert_eq!(check_name(name).ok(), Some(name));
        }
        for name in ["", "login-codes", "a.b", "with space", "_credential_meta", "naïve"] {
            assert!(
                matches!(check_name(name), Err(CredentialError::InvalidConfiguration(_))),
                "{name:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_seed_document_uses_equality_clauses() {
        let seed = Filter::new().eq("user", "alice").gte("createdAt", 5).seed_document();
        assert_eq!(Value::Object(seed), json!({"user": "alice"}));
    }

    #[test]
    fn test_filter_serializes_for_scripts() {
        let filter = Filter::new().eq("code", "X").lte("createdAt", 5);
        assert_eq!(
            serde_json::to_value(&filter).unwrap(),
            json!([
                {"op": "eq", "field": "code", "value": "X"},
                {"op": "lte", "field": "createdAt", "value": 5}
            ])
        );
    }
}
