//! In-memory storage backend implementation.
//!
//! This module provides a document store that keeps every collection in a
//! `HashMap` behind a single async lock. It's ideal for testing, development
//! and single-instance applications where persistence across restarts is not
//! required.

use super::{
    CollectionOptions, Document, DocumentStore, Filter, FindOptions, IndexSpec, StorageStats,
    Update, UpdateResult,
};
use crate::CredentialError;
use crate::credential::time_utils::is_expired;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;

/// A simple in-memory document store.
///
/// All collections live in one `HashMap` wrapped in `Arc<RwLock<>>`. Every
/// mutating operation holds the write lock for its whole duration, which is
/// what makes check-and-insert, conditional updates and take-once deletes
/// atomic. Expired documents are only removed by
/// [`purge_expired`](DocumentStore::purge_expired).
///
/// # Features
///
/// - **Zero dependencies**: No external storage dependencies required
/// - **Thread-safe**: Uses tokio's RwLock for concurrent access
/// - **Cheap clones**: Clones share the same underlying data
/// - **No persistence**: Data is lost when the application restarts
///
/// # Example
///
/// ```rust
/// use credential_core::storage::{DocumentStore, Filter, IndexSpec, MemoryStore, to_document};
/// use serde_json::json;
///
/// # async fn example() -> Result<(), credential_core::CredentialError> {
/// let store = MemoryStore::new();
/// store.create_index("users", IndexSpec::new(&["user"]).unique()).await?;
///
/// store.insert("users", to_document(&json!({"user": "alice"}))?).await?;
/// assert!(store.insert("users", to_document(&json!({"user": "alice"}))?).await.is_err());
///
/// let found = store.find_one("users", &Filter::new().eq("user", "alice")).await?;
/// assert!(found.is_some());
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    data: Arc<RwLock<HashMap<String, Collection>>>,
}

#[derive(Debug, Default)]
struct Collection {
    /// Documents in insertion order.
    documents: Vec<Document>,
    indexes: Vec<IndexSpec>,
    capped: Option<super::CappedOptions>,
}

impl Collection {
    fn unique_indexes(&self) -> impl Iterator<Item = &IndexSpec> {
        self.indexes.iter().filter(|index| index.unique)
    }

    /// Finds a unique index that `candidate` would violate, ignoring the
    /// document at position `skip` (the one being replaced).
    fn violated_index(&self, candidate: &Document, skip: Option<usize>) -> Option<&IndexSpec> {
        self.unique_indexes().find(|index| {
            let key = index.key_of(candidate);
            self.documents
                .iter()
                .enumerate()
                .any(|(pos, existing)| Some(pos) != skip && index.key_of(existing) == key)
        })
    }

    fn position(&self, filter: &Filter) -> Option<usize> {
        self.documents.iter().position(|doc| filter.matches(doc))
    }

    fn enforce_cap(&mut self) {
        let Some(capped) = self.capped else {
            return;
        };
        if let Some(max) = capped.max_documents {
            let excess = self.documents.len().saturating_sub(max as usize);
            if excess > 0 {
                self.documents = self.documents.split_off(excess);
            }
        }
        let mut total: u64 = self.documents.iter().map(document_size).sum();
        while total > capped.max_bytes && self.documents.len() > 1 {
            total -= document_size(&self.documents.remove(0));
        }
    }
}

fn document_size(document: &Document) -> u64 {
    serde_json::to_vec(document).map_or(0, |bytes| bytes.len() as u64)
}

fn duplicate(collection: &str, index: &IndexSpec) -> CredentialError {
    CredentialError::DuplicateKey(format!("{collection}.{}", index.name))
}

impl MemoryStore {
    /// Creates a new, empty in-memory store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn create_collection(
        &self,
        collection: &str,
        options: CollectionOptions,
    ) -> Result<(), CredentialError> {
        let mut data = self.data.write().await;
        let entry = data.entry(collection.to_string()).or_default();
        entry.capped = options.capped;
        entry.enforce_cap();
        Ok(())
    }

    async fn create_index(
        &self,
        collection: &str,
        index: IndexSpec,
    ) -> Result<(), CredentialError> {
        index.validate()?;
        let mut data = self.data.write().await;
        let entry = data.entry(collection.to_string()).or_default();

        if index.unique {
            let mut seen = HashSet::new();
            for doc in &entry.documents {
                let key = serde_json::to_string(&index.key_of(doc))?;
                if !seen.insert(key) {
                    return Err(duplicate(collection, &index));
                }
            }
        }

        entry.indexes.retain(|existing| existing.name != index.name);
        entry.indexes.push(index);
        Ok(())
    }

    async fn insert(&self, collection: &str, document: Document) -> Result<(), CredentialError> {
        let mut data = self.data.write().await;
        let entry = data.entry(collection.to_string()).or_default();
        if let Some(index) = entry.violated_index(&document, None) {
            return Err(duplicate(collection, index));
        }
        entry.documents.push(document);
        entry.enforce_cap();
        Ok(())
    }

    async fn insert_many(
        &self,
        collection: &str,
        documents: Vec<Document>,
    ) -> Result<(), CredentialError> {
        let mut data = self.data.write().await;
        let entry = data.entry(collection.to_string()).or_default();

        for index in entry.unique_indexes() {
            let mut batch_keys = HashSet::new();
            for doc in &documents {
                let key = index.key_of(doc);
                let in_store = entry.documents.iter().any(|e| index.key_of(e) == key);
                if in_store || !batch_keys.insert(serde_json::to_string(&key)?) {
                    return Err(duplicate(collection, index));
                }
            }
        }

        entry.documents.extend(documents);
        entry.enforce_cap();
        Ok(())
    }

    async fn find_one(
        &self,
        collection: &str,
        filter: &Filter,
    ) -> Result<Option<Document>, CredentialError> {
        let data = self.data.read().await;
        Ok(data
            .get(collection)
            .and_then(|entry| entry.documents.iter().find(|doc| filter.matches(doc)))
            .cloned())
    }

    async fn find(
        &self,
        collection: &str,
        filter: &Filter,
        options: FindOptions,
    ) -> Result<Vec<Document>, CredentialError> {
        let data = self.data.read().await;
        let matching = data
            .get(collection)
            .map(|entry| {
                entry
                    .documents
                    .iter()
                    .filter(|doc| filter.matches(doc))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        Ok(options.apply(matching))
    }

    async fn update_one(
        &self,
        collection: &str,
        filter: &Filter,
        update: &Update,
        upsert: bool,
    ) -> Result<UpdateResult, CredentialError> {
        let mut data = self.data.write().await;
        let entry = data.entry(collection.to_string()).or_default();

        match entry.position(filter) {
            Some(pos) => {
                let mut updated = entry.documents[pos].clone();
                if !update.apply(&mut updated) {
                    return Ok(UpdateResult {
                        matched_count: 1,
                        modified_count: 0,
                        upserted: false,
                    });
                }
                if let Some(index) = entry.violated_index(&updated, Some(pos)) {
                    return Err(duplicate(collection, index));
                }
                entry.documents[pos] = updated;
                Ok(UpdateResult {
                    matched_count: 1,
                    modified_count: 1,
                    upserted: false,
                })
            }
            None if upsert => {
                let mut seeded = filter.seed_document();
                update.apply(&mut seeded);
                if let Some(index) = entry.violated_index(&seeded, None) {
                    return Err(duplicate(collection, index));
                }
                entry.documents.push(seeded);
                entry.enforce_cap();
                Ok(UpdateResult {
                    matched_count: 0,
                    modified_count: 0,
                    upserted: true,
                })
            }
            None => Ok(UpdateResult::default()),
        }
    }

    async fn find_one_and_delete(
        &self,
        collection: &str,
        filter: &Filter,
    ) -> Result<Option<Document>, CredentialError> {
        let mut data = self.data.write().await;
        let Some(entry) = data.get_mut(collection) else {
            return Ok(None);
        };
        Ok(entry
            .position(filter)
            .map(|pos| entry.documents.remove(pos)))
    }

    async fn purge_expired(&self, collection: &str, now: i64) -> Result<usize, CredentialError> {
        let mut data = self.data.write().await;
        let Some(entry) = data.get_mut(collection) else {
            return Ok(0);
        };

        let ttl_indexes: Vec<(String, std::time::Duration)> = entry
            .indexes
            .iter()
            .filter_map(|index| Some((index.keys[0].clone(), index.expire_after?)))
            .collect();

        let initial_count = entry.documents.len();
        entry.documents.retain(|doc| {
            !ttl_indexes.iter().any(|(field, ttl)| {
                doc.get(field)
                    .and_then(|v| v.as_i64())
                    .is_some_and(|created_at| is_expired(created_at, now, *ttl))
            })
        });
        Ok(initial_count - entry.documents.len())
    }

    async fn get_stats(&self, collection: &str) -> Result<StorageStats, CredentialError> {
        let data = self.data.read().await;
        let (count, bytes) = data.get(collection).map_or((0, 0), |entry| {
            (
                entry.documents.len(),
                entry.documents.iter().map(document_size).sum::<u64>(),
            )
        });
        Ok(StorageStats {
            total_records: count,
            backend_info: format!("In-memory document storage (~{bytes} bytes)"),
        })
    }
}
