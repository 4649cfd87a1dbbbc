use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::CredentialError;
use super::config::ActivityConfig;
use super::service::StoreService;
use super::time_utils::{TimeProviderFn, parse_period, system_time_provider};
use crate::storage::{
    CappedOptions, CollectionOptions, DocumentStore, Filter, FindOptions, IndexSpec, SortOrder,
    from_document, to_document,
};

/// One audit entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityLogRecord {
    pub user: String,
    pub target: String,
    #[serde(rename = "createdAt")]
    pub created_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Value>,
}

/// Append-only audit log of user actions.
///
/// Old entries are dropped either by TTL expiry or by a capped collection,
/// never both.
///
/// # Example
///
/// ```rust
/// use credential_core::{ActivityConfig, ActivityLogger, current_timestamp_millis};
/// use credential_core::storage::MemoryStore;
/// use std::sync::Arc;
///
/// # async fn example() -> Result<(), credential_core::CredentialError> {
/// let logger = ActivityLogger::new_and_init(Arc::new(MemoryStore::new()), ActivityConfig::default()).await?;
/// logger.log_activity("alice", "login", None).await?;
///
/// let logs = logger.fetch_logs(current_timestamp_millis()?, "1h").await?;
/// assert_eq!(logs.len(), 1);
/// # Ok(())
/// # }
/// ```
pub struct ActivityLogger<S: DocumentStore> {
    store: Arc<S>,
    config: ActivityConfig,
    time_provider: TimeProviderFn,
}

impl<S: DocumentStore> ActivityLogger<S> {
    /// # Errors
    ///
    /// `InvalidConfiguration` when both retention policies are enabled.
    pub fn new(store: Arc<S>, config: ActivityConfig) -> Result<Self, CredentialError> {
        config.validate()?;
        Ok(Self {
            store,
            config,
            time_provider: system_time_provider(),
        })
    }

    /// Creates the logger, initializes the store and prepares the collection
    /// with its `createdAt` index and retention policy.
    pub async fn new_and_init(store: Arc<S>, config: ActivityConfig) -> Result<Self, CredentialError> {
        let logger = Self::new(store, config)?;
        logger.store.init().await?;
        logger.setup().await?;
        Ok(logger)
    }

    /// Replaces the system clock. The function returns Unix milliseconds.
    pub fn with_time_provider<F>(mut self, provider: F) -> Self
    where
        F: Fn() -> Result<i64, CredentialError> + Send + Sync + 'static,
    {
        self.time_provider = Arc::new(provider);
        self
    }

    pub async fn log_activity(
        &self,
        user: &str,
        target: &str,
        meta: Option<Value>,
    ) -> Result<(), CredentialError> {
        let record = ActivityLogRecord {
            user: user.to_string(),
            target: target.to_string(),
            created_at: (self.time_provider)()?,
            meta,
        };
        self.store
            .insert(&self.config.collection, to_document(&record)?)
            .await
    }

    /// Returns entries created within `period` before `end` (inclusive at
    /// both ends), newest first.
    ///
    /// # Errors
    ///
    /// `InvalidConfiguration` for a malformed period such as `10x`.
    pub async fn fetch_logs(
        &self,
        end: i64,
        period: &str,
    ) -> Result<Vec<ActivityLogRecord>, CredentialError> {
        let span = i64::try_from(parse_period(period)?.as_millis()).unwrap_or(i64::MAX);
        let filter = Filter::new()
            .gte("createdAt", end.saturating_sub(span))
            .lte("createdAt", end);
        let options = FindOptions::new().sort("createdAt", SortOrder::Descending);

        self.store
            .find(&self.config.collection, &filter, options)
            .await?
            .into_iter()
            .map(from_document)
            .collect()
    }

    /// Removes entries past the retention period. A no-op for capped logs.
    pub async fn purge_expired(&self) -> Result<usize, CredentialError> {
        let now = (self.time_provider)()?;
        self.store
            .purge_expired(&self.config.collection, now)
            .await
    }

    pub fn collection(&self) -> &str {
        &self.config.collection
    }
}

#[async_trait]
impl<S: DocumentStore> StoreService for ActivityLogger<S> {
    async fn build_index(&self) -> Result<(), CredentialError> {
        let mut index = IndexSpec::new(&["createdAt"]);
        if self.config.use_ttl {
            index = index.expire_after(self.config.ttl);
        }
        self.store.create_index(&self.config.collection, index).await?;
        tracing::info!(collection = %self.config.collection, "Activity log indexes ready");
        Ok(())
    }

    async fn create_collections(&self) -> Result<(), CredentialError> {
        if !self.config.use_capped {
            return Ok(());
        }
        let options = CollectionOptions {
            capped: Some(CappedOptions {
                max_bytes: self.config.capped_max_bytes,
                max_documents: Some(self.config.capped_max_records),
            }),
        };
        self.store
            .create_collection(&self.config.collection, options)
            .await
    }
}
