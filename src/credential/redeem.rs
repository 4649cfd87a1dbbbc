//! Redeem code lifecycle.
//!
//! A redeem code moves through a small state machine:
//!
//! ```text
//! issued ──start_processing_code──▶ processing ──mark_processing_done───▶ used
//!    │                                   └────────mark_processing_failed─▶ error
//!    └──mark_expired──▶ expired
//! ```
//!
//! Every transition is a single conditional update on `(code, expected
//! status)`, so two callers racing on the same code can never both win, and a
//! terminal code can never be reprocessed.

use std::sync::Arc;

use async_trait::async_trait;
use rand::RngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::CredentialError;
use super::config::RedeemConfig;
use super::service::StoreService;
use super::time_utils::{TimeProviderFn, system_time_provider};
use crate::storage::{
    DocumentStore, Filter, FindOptions, IndexSpec, SortOrder, Update, from_document, to_document,
};

/// Default page size of [`RedeemCodeService::list_codes_by_creator`].
pub const DEFAULT_LIST_LIMIT: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RedeemStatus {
    Issued,
    Used,
    Expired,
    Processing,
    Error,
}

impl RedeemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Issued => "issued",
            Self::Used => "used",
            Self::Expired => "expired",
            Self::Processing => "processing",
            Self::Error => "error",
        }
    }

    /// States reachable from this one.
    pub fn allowed_next(&self) -> &'static [RedeemStatus] {
        match self {
            Self::Issued => &[Self::Processing, Self::Expired],
            Self::Processing => &[Self::Used, Self::Error],
            Self::Used | Self::Expired | Self::Error => &[],
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.allowed_next().is_empty()
    }
}

/// A stored redeem code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RedeemCodeRecord {
    pub code: String,
    /// Which product the code redeems.
    pub code_type: String,
    pub creator: String,
    pub status: RedeemStatus,
    /// Mirrors `status == used`.
    #[serde(default)]
    pub used: bool,
    #[serde(rename = "createdAt")]
    pub created_at: i64,
    #[serde(rename = "updatedAt", default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
}

/// Produces a random redeem code: `bytes` bytes of OS randomness as lowercase
/// hex, in dash-separated groups of four.
///
/// ```rust
/// use credential_core::generate_secure_code;
///
/// let code = generate_secure_code(4);
/// assert_eq!(code.len(), "xxxx-xxxx".len());
/// assert_eq!(code.as_bytes()[4], b'-');
/// ```
pub fn generate_secure_code(bytes: usize) -> String {
    let mut raw = vec![0u8; bytes];
    OsRng.fill_bytes(&mut raw);
    let hex = hex::encode(raw);

    let mut code = String::with_capacity(hex.len() + hex.len() / 4);
    for (i, c) in hex.chars().enumerate() {
        if i > 0 && i % 4 == 0 {
            code.push('-');
        }
        code.push(c);
    }
    code
}

/// Manages redeem codes and their processing lifecycle.
///
/// Code identifiers are supplied by the caller and must be globally unique;
/// a duplicate is reported as [`CredentialError::DuplicateKey`] and never
/// retried.
///
/// # Example
///
/// ```rust
/// use credential_core::{RedeemCodeService, RedeemStatus};
/// use credential_core::storage::MemoryStore;
/// use serde_json::json;
/// use std::sync::Arc;
///
/// # async fn example() -> Result<(), credential_core::CredentialError> {
/// let service = RedeemCodeService::new_and_init(Arc::new(MemoryStore::new())).await?;
/// service.create_code("GIFT-0001", "premium_month", "admin").await?;
///
/// assert!(service.start_processing_code("GIFT-0001", json!({"user": "alice"})).await?);
/// assert!(service.mark_processing_done("GIFT-0001", json!({"granted": true})).await?);
///
/// // A used code cannot be processed again.
/// assert!(!service.start_processing_code("GIFT-0001", json!({"user": "bob"})).await?);
///
/// let record = service.get_code("GIFT-0001").await?.unwrap();
/// assert_eq!(record.status, RedeemStatus::Used);
/// # Ok(())
/// # }
/// ```
pub struct RedeemCodeService<S: DocumentStore> {
    store: Arc<S>,
    config: RedeemConfig,
    time_provider: TimeProviderFn,
}

impl<S: DocumentStore> RedeemCodeService<S> {
    /// Creates a service with [`RedeemConfig::default()`].
    pub fn new(store: Arc<S>) -> Result<Self, CredentialError> {
        Self::with_config(store, RedeemConfig::default())
    }

    pub fn with_config(store: Arc<S>, config: RedeemConfig) -> Result<Self, CredentialError> {
        config.validate()?;
        Ok(Self {
            store,
            config,
            time_provider: system_time_provider(),
        })
    }

    /// Creates a service with [`RedeemConfig::default()`], initializes the
    /// store and declares the unique `code` index.
    ///
    /// Prefer this over [`new`](Self::new): without the index a duplicate
    /// code is only rejected by backends that enforce uniqueness on their own.
    pub async fn new_and_init(store: Arc<S>) -> Result<Self, CredentialError> {
        Self::with_config_and_init(store, RedeemConfig::default()).await
    }

    /// Like [`with_config`](Self::with_config), then runs `init` and `setup`.
    pub async fn with_config_and_init(
        store: Arc<S>,
        config: RedeemConfig,
    ) -> Result<Self, CredentialError> {
        let service = Self::with_config(store, config)?;
        service.store.init().await?;
        service.setup().await?;
        Ok(service)
    }

    /// Replaces the system clock. The function returns Unix milliseconds.
    pub fn with_time_provider<F>(mut self, provider: F) -> Self
    where
        F: Fn() -> Result<i64, CredentialError> + Send + Sync + 'static,
    {
        self.time_provider = Arc::new(provider);
        self
    }

    fn new_record(&self, code: &str, code_type: &str, creator: &str, now: i64) -> RedeemCodeRecord {
        RedeemCodeRecord {
            code: code.to_string(),
            code_type: code_type.to_string(),
            creator: creator.to_string(),
            status: RedeemStatus::Issued,
            used: false,
            created_at: now,
            updated_at: None,
            request: None,
            response: None,
            error: None,
        }
    }

    /// Stores a new code in the `issued` state and returns it.
    pub async fn create_code(
        &self,
        code: &str,
        code_type: &str,
        creator: &str,
    ) -> Result<String, CredentialError> {
        let record = self.new_record(code, code_type, creator, (self.time_provider)()?);
        self.store
            .insert(&self.config.collection, to_document(&record)?)
            .await?;
        Ok(record.code)
    }

    /// Stores a batch of new codes, all or nothing.
    ///
    /// An empty batch returns immediately without touching the store.
    pub async fn create_codes<C: AsRef<str>>(
        &self,
        codes: &[C],
        code_type: &str,
        creator: &str,
    ) -> Result<Vec<RedeemCodeRecord>, CredentialError> {
        if codes.is_empty() {
            return Ok(Vec::new());
        }

        let now = (self.time_provider)()?;
        let records: Vec<RedeemCodeRecord> = codes
            .iter()
            .map(|code| self.new_record(code.as_ref(), code_type, creator, now))
            .collect();
        let documents = records
            .iter()
            .map(to_document)
            .collect::<Result<Vec<_>, _>>()?;

        self.store
            .insert_many(&self.config.collection, documents)
            .await?;
        Ok(records)
    }

    /// `issued → processing`, storing the redemption request.
    pub async fn start_processing_code(
        &self,
        code: &str,
        request: Value,
    ) -> Result<bool, CredentialError> {
        self.transition(
            code,
            RedeemStatus::Issued,
            RedeemStatus::Processing,
            Some(("request", request)),
        )
        .await
    }

    /// `processing → used`, storing the fulfilment response.
    pub async fn mark_processing_done(
        &self,
        code: &str,
        response: Value,
    ) -> Result<bool, CredentialError> {
        self.transition(
            code,
            RedeemStatus::Processing,
            RedeemStatus::Used,
            Some(("response", response)),
        )
        .await
    }

    /// `processing → error`, storing the failure details.
    pub async fn mark_processing_failed(
        &self,
        code: &str,
        error: Value,
    ) -> Result<bool, CredentialError> {
        self.transition(
            code,
            RedeemStatus::Processing,
            RedeemStatus::Error,
            Some(("error", error)),
        )
        .await
    }

    /// `issued → expired`.
    pub async fn mark_expired(&self, code: &str) -> Result<bool, CredentialError> {
        self.transition(code, RedeemStatus::Issued, RedeemStatus::Expired, None)
            .await
    }

    /// Applies one lifecycle step as a conditional update.
    ///
    /// Returns `Ok(false)` when the code does not exist, is in another state,
    /// or another caller moved it first.
    async fn transition(
        &self,
        code: &str,
        from: RedeemStatus,
        to: RedeemStatus,
        payload: Option<(&str, Value)>,
    ) -> Result<bool, CredentialError> {
        debug_assert!(from.allowed_next().contains(&to));

        let filter = Filter::new().eq("code", code).eq("status", from.as_str());
        let mut update = Update::new()
            .set("status", to.as_str())
            .set("used", to == RedeemStatus::Used)
            .set("updatedAt", (self.time_provider)()?);
        if let Some((field, value)) = payload {
            update = update.set(field, value);
        }

        let result = self
            .store
            .update_one(&self.config.collection, &filter, &update, false)
            .await?;

        let applied = result.modified_count > 0;
        if !applied {
            tracing::debug!(
                code,
                from = from.as_str(),
                to = to.as_str(),
                "Redeem code transition refused"
            );
        }
        Ok(applied)
    }

    pub async fn get_code(&self, code: &str) -> Result<Option<RedeemCodeRecord>, CredentialError> {
        self.store
            .find_one(&self.config.collection, &Filter::new().eq("code", code))
            .await?
            .map(from_document)
            .transpose()
    }

    /// Lists the codes created by `creator`, newest first.
    ///
    /// A `limit` of 0 returns every code after `skip`.
    pub async fn list_codes_by_creator(
        &self,
        creator: &str,
        skip: usize,
        limit: usize,
    ) -> Result<Vec<RedeemCodeRecord>, CredentialError> {
        let mut options = FindOptions::new()
            .sort("createdAt", SortOrder::Descending)
            .skip(skip);
        if limit > 0 {
            options = options.limit(limit);
        }

        self.store
            .find(
                &self.config.collection,
                &Filter::new().eq("creator", creator),
                options,
            )
            .await?
            .into_iter()
            .map(from_document)
            .collect()
    }

    /// The first [`DEFAULT_LIST_LIMIT`] codes created by `creator`.
    pub async fn codes_by_creator(
        &self,
        creator: &str,
    ) -> Result<Vec<RedeemCodeRecord>, CredentialError> {
        self.list_codes_by_creator(creator, 0, DEFAULT_LIST_LIMIT)
            .await
    }

    pub fn collection(&self) -> &str {
        &self.config.collection
    }
}

#[async_trait]
impl<S: DocumentStore> StoreService for RedeemCodeService<S> {
    async fn build_index(&self) -> Result<(), CredentialError> {
        let collection = &self.config.collection;
        self.store
            .create_index(collection, IndexSpec::new(&["code"]).unique())
            .await?;
        for key in ["creator", "createdAt", "status"] {
            self.store
                .create_index(collection, IndexSpec::new(&[key]))
                .await?;
        }
        tracing::info!(%collection, "Redeem code indexes ready");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use serde_json::json;
    use std::sync::atomic::{AtomicI64, Ordering};

    async fn service() -> Result<RedeemCodeService<MemoryStore>, CredentialError> {
        let service = RedeemCodeService::with_config(
            Arc::new(MemoryStore::new()),
            RedeemConfig {
                collection: "redeem_codes".to_string(),
            },
        )?;
        service.setup().await?;
        Ok(service)
    }

    #[test]
    fn test_status_table() {
        assert_eq!(
            RedeemStatus::Issued.allowed_next(),
            &[RedeemStatus::Processing, RedeemStatus::Expired]
        );
        assert!(!RedeemStatus::Processing.is_terminal());
        for terminal in [RedeemStatus::Used, RedeemStatus::Expired, RedeemStatus::Error] {
            assert!(terminal.is_terminal());
        }
        assert_eq!(serde_json::to_value(RedeemStatus::Processing).unwrap(), "processing");
    }

    #[test]
    fn test_generate_secure_code() {
        let code = generate_secure_code(16);
        assert_eq!(code.len(), 32 + 7);
        let groups: Vec<&str> = code.split('-').collect();
        assert_eq!(groups.len(), 8);
        assert!(groups.iter().all(|g| g.len() == 4));
        assert_ne!(code, generate_secure_code(16));

        assert_eq!(generate_secure_code(3).len(), 7);
        assert_eq!(generate_secure_code(0), "");
    }

    #[tokio::test]
    async fn test_happy_path() -> Result<(), CredentialError> {
        let service = service().await?;
        assert_eq!(service.create_code("X", "gift", "admin").await?, "X");

        let record = service.get_code("X").await?.unwrap();
        assert_eq!(record.status, RedeemStatus::Issued);
        assert!(!record.used);
        assert!(record.updated_at.is_none());

        assert!(service.start_processing_code("X", json!({"user": "alice"})).await?);
        assert!(service.mark_processing_done("X", json!({"ok": true})).await?);

        let record = service.get_code("X").await?.unwrap();
        assert_eq!(record.status, RedeemStatus::Used);
        assert!(record.used);
        assert_eq!(record.request, Some(json!({"user": "alice"})));
        assert_eq!(record.response, Some(json!({"ok": true})));
        assert!(record.updated_at.is_some());
        Ok(())
    }

    #[tokio::test]
    async fn test_used_code_is_never_reprocessed() -> Result<(), CredentialError> {
        let service = service().await?;
        service.create_code("X", "gift", "admin").await?;
        assert!(service.start_processing_code("X", json!({})).await?);
        assert!(service.mark_processing_done("X", json!({})).await?);

        assert!(!service.start_processing_code("X", json!({"again": 1})).await?);
        assert!(!service.mark_processing_failed("X", json!({})).await?);
        assert!(!service.mark_processing_done("X", json!({})).await?);

        let record = service.get_code("X").await?.unwrap();
        assert_eq!(record.status, RedeemStatus::Used);
        assert_eq!(record.request, Some(json!({})));
        Ok(())
    }

    #[tokio::test]
    async fn test_failure_path_and_wrong_states() -> Result<(), CredentialError> {
        let service = service().await?;
        service.create_code("X", "gift", "admin").await?;

        // Cannot finish what has not started.
        assert!(!service.mark_processing_done("X", json!({})).await?);
        assert!(!service.mark_processing_failed("X", json!({})).await?);

        assert!(service.start_processing_code("X", json!({})).await?);
        assert!(!service.start_processing_code("X", json!({})).await?);
        assert!(!service.mark_expired("X").await?);
        assert!(service.mark_processing_failed("X", json!({"reason": "timeout"})).await?);

        let record = service.get_code("X").await?.unwrap();
        assert_eq!(record.status, RedeemStatus::Error);
        assert_eq!(record.error, Some(json!({"reason": "timeout"})));
        assert!(!service.start_processing_code("X", json!({})).await?);
        Ok(())
    }

    #[tokio::test]
    async fn test_mark_expired() -> Result<(), CredentialError> {
        let service = service().await?;
        service.create_code("X", "gift", "admin").await?;
        assert!(service.mark_expired("X").await?);
        assert!(!service.start_processing_code("X", json!({})).await?);
        assert_eq!(
            service.get_code("X").await?.unwrap().status,
            RedeemStatus::Expired
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_unknown_code() -> Result<(), CredentialError> {
        let service = service().await?;
        assert!(service.get_code("nope").await?.is_none());
        assert!(!service.start_processing_code("nope", json!({})).await?);
        assert!(!service.mark_expired("nope").await?);
        Ok(())
    }

    #[tokio::test]
    async fn test_duplicate_code_is_an_error() -> Result<(), CredentialError> {
        let service = service().await?;
        service.create_code("X", "gift", "admin").await?;
        let result = service.create_code("X", "other", "someone").await;
        assert!(matches!(result, Err(CredentialError::DuplicateKey(_))));
        Ok(())
    }

    #[tokio::test]
    async fn test_create_codes_batch() -> Result<(), CredentialError> {
        let service = service().await?;

        let empty: [&str; 0] = [];
        assert!(service.create_codes(&empty, "gift", "admin").await?.is_empty());

        let records = service.create_codes(&["A", "B", "C"], "gift", "admin").await?;
        assert_eq!(records.len(), 3);
        assert!(records.iter().all(|r| r.status == RedeemStatus::Issued));

        // One duplicate rejects the whole batch.
        let result = service.create_codes(&["D", "A"], "gift", "admin").await;
        assert!(matches!(result, Err(CredentialError::DuplicateKey(_))));
        assert!(service.get_code("D").await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_list_codes_by_creator_newest_first() -> Result<(), CredentialError> {
        let clock = Arc::new(AtomicI64::new(1_000));
        let handle = Arc::clone(&clock);
        let service = service()
            .await?
            .with_time_provider(move || Ok(handle.fetch_add(10, Ordering::SeqCst)));

        for code in ["A", "B", "C", "D"] {
            service.create_code(code, "gift", "admin").await?;
        }
        service.create_code("Z", "gift", "someone_else").await?;

        let codes: Vec<String> = service
            .codes_by_creator("admin")
            .await?
            .into_iter()
            .map(|r| r.code)
            .collect();
        assert_eq!(codes, vec!["D", "C", "B", "A"]);

        let page: Vec<String> = service
            .list_codes_by_creator("admin", 1, 2)
            .await?
            .into_iter()
            .map(|r| r.code)
            .collect();
        assert_eq!(page, vec!["C", "B"]);
        Ok(())
    }

    #[tokio::test]
    async fn test_list_codes_zero_limit_returns_all() -> Result<(), CredentialError> {
        let service = service().await?;
        service.create_code("ONLY", "gift", "admin").await?;

        let all = service.list_codes_by_creator("admin", 0, 0).await?;
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].code, "ONLY");
        assert!(service.list_codes_by_creator("admin", 1, 0).await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_new_and_init_enforces_unique_code() -> Result<(), CredentialError> {
        let store = Arc::new(MemoryStore::new());
        let service = RedeemCodeService::new_and_init(Arc::clone(&store)).await?;

        service.create_code("GIFT-0001", "premium_month", "admin").await?;
        let result = service.create_code("GIFT-0001", "premium_year", "admin").await;
        assert!(matches!(result, Err(CredentialError::DuplicateKey(_))));
        assert_eq!(store.get_stats(service.collection()).await?.total_records, 1);
        assert_eq!(
            service.get_code("GIFT-0001").await?.map(|r| r.code_type),
            Some("premium_month".to_string())
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_concurrent_start_processing_has_one_winner() -> Result<(), CredentialError> {
        let service = Arc::new(service().await?);
        service.create_code("X", "gift", "admin").await?;

        let mut handles = Vec::new();
        for i in 0..20 {
            let service = Arc::clone(&service);
            handles.push(tokio::spawn(async move {
                service.start_processing_code("X", json!({"worker": i})).await
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap()? {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
        Ok(())
    }
}
