use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::RngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};

use super::cleanup::BoxedCleanupStrategy;
use super::config::OneTimeConfig;
use super::service::StoreService;
use super::time_utils::{TimeProviderFn, is_expired};
use super::{CredentialError, OneTimeCodeServiceBuilder};
use crate::storage::{DocumentStore, Filter, IndexSpec, MemoryStore, from_document, to_document};

/// Number of inserts attempted before giving up on a colliding generator.
pub const MAX_CREATE_ATTEMPTS: u32 = 3;

/// A function that produces candidate one-time codes.
pub type CodeGeneratorFn = Arc<dyn Fn() -> String + Send + Sync>;

/// Produces a 32-character lowercase hex code from 16 bytes of OS randomness.
pub fn generate_onetime_code() -> String {
    let mut bytes = [0u8; 16];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// A stored one-time code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OneTimeCodeRecord {
    pub owner: String,
    #[serde(rename = "type")]
    pub code_type: String,
    pub code: String,
    /// Unix milliseconds.
    #[serde(rename = "createdAt")]
    pub created_at: i64,
}

/// Issues short-lived verification codes bound to an owner and a purpose.
///
/// A code is valid for `ttl_limit` after issuance and can be consumed at most
/// once. Uniqueness of `(owner, type, code)` is enforced by the store; the
/// service retries a colliding candidate up to [`MAX_CREATE_ATTEMPTS`] times.
///
/// The service includes automatic expiry sweeping that triggers based on a
/// configurable strategy. By default it sweeps after 100 issued codes or
/// 5 minutes, whichever comes first.
///
/// To create an instance, use [`OneTimeCodeService::builder()`].
///
/// # Example
///
/// ```rust
/// use credential_core::OneTimeCodeService;
/// use std::time::Duration;
///
/// # async fn example() -> Result<(), credential_core::CredentialError> {
/// let service = OneTimeCodeService::builder()
///     .with_ttl_limit(Duration::from_secs(300))
///     .build_and_init()
///     .await?;
///
/// let code = service.create_code("alice@example.com", "email_verify").await?;
/// assert!(service.verify_code("alice@example.com", "email_verify", &code).await?);
/// assert!(service.consume_code("alice@example.com", "email_verify", &code).await?);
/// assert!(!service.consume_code("alice@example.com", "email_verify", &code).await?);
/// # Ok(())
/// # }
/// ```
pub struct OneTimeCodeService<S: DocumentStore> {
    pub(crate) store: Arc<S>,
    pub(crate) config: OneTimeConfig,
    pub(crate) code_generator: CodeGeneratorFn,
    pub(crate) time_provider: TimeProviderFn,
    pub(crate) cleanup_strategy: BoxedCleanupStrategy,
}

impl OneTimeCodeService<MemoryStore> {
    /// Creates a new builder.
    ///
    /// The builder defaults to `MemoryStore`. Provide a different backend
    /// with `.with_store()`.
    pub fn builder() -> OneTimeCodeServiceBuilder<MemoryStore> {
        OneTimeCodeServiceBuilder::new()
    }
}

impl<S: DocumentStore + 'static> OneTimeCodeService<S> {
    fn owner_filter(owner: &str, code_type: &str, code: &str) -> Filter {
        Filter::new()
            .eq("owner", owner)
            .eq("type", code_type)
            .eq("code", code)
    }

    /// Issues a new code for `owner` and `code_type`.
    ///
    /// # Errors
    ///
    /// - `CodeGenerationExhausted` if every attempt collided
    /// - Any non-duplicate store error, immediately and without retry
    pub async fn create_code(&self, owner: &str, code_type: &str) -> Result<String, CredentialError> {
        for attempt in 1..=MAX_CREATE_ATTEMPTS {
            let record = OneTimeCodeRecord {
                owner: owner.to_string(),
                code_type: code_type.to_string(),
                code: (self.code_generator)(),
                created_at: (self.time_provider)()?,
            };

            match self
                .store
                .insert(&self.config.collection, to_document(&record)?)
                .await
            {
                Ok(()) => {
                    self.maybe_trigger_cleanup().await;
                    return Ok(record.code);
                }
                Err(CredentialError::DuplicateKey(key)) => {
                    tracing::debug!(attempt, owner, code_type, %key, "One-time code collided, retrying");
                }
                Err(e) => return Err(e),
            }
        }

        Err(CredentialError::CodeGenerationExhausted {
            attempts: MAX_CREATE_ATTEMPTS,
        })
    }

    /// Returns `true` if the code exists and is at most `ttl_limit` old.
    ///
    /// Verification never consumes the code.
    pub async fn verify_code(
        &self,
        owner: &str,
        code_type: &str,
        code: &str,
    ) -> Result<bool, CredentialError> {
        let Some(document) = self
            .store
            .find_one(
                &self.config.collection,
                &Self::owner_filter(owner, code_type, code),
            )
            .await?
        else {
            return Ok(false);
        };

        let record: OneTimeCodeRecord = from_document(document)?;
        let now = (self.time_provider)()?;
        Ok(!is_expired(record.created_at, now, self.config.ttl_limit))
    }

    /// Removes the code atomically, returning `true` if this call removed it.
    ///
    /// Concurrent calls for the same code succeed at most once. The age of the
    /// code is not checked here; verify it first.
    pub async fn consume_code(
        &self,
        owner: &str,
        code_type: &str,
        code: &str,
    ) -> Result<bool, CredentialError> {
        let removed = self
            .store
            .find_one_and_delete(
                &self.config.collection,
                &Self::owner_filter(owner, code_type, code),
            )
            .await?;
        Ok(removed.is_some())
    }

    /// Removes every code older than `ttl_limit` from the store.
    pub async fn purge_expired(&self) -> Result<usize, CredentialError> {
        let now = (self.time_provider)()?;
        self.store
            .purge_expired(&self.config.collection, now)
            .await
    }

    async fn maybe_trigger_cleanup(&self) {
        if self.cleanup_strategy.should_cleanup().await {
            self.spawn_background_cleanup();
            self.cleanup_strategy.mark_as_cleaned().await;
        }
    }

    fn spawn_background_cleanup(&self) {
        let store = Arc::clone(&self.store);
        let collection = self.config.collection.clone();
        let time_provider = Arc::clone(&self.time_provider);

        tokio::spawn(async move {
            let result = match time_provider() {
                Ok(now) => store.purge_expired(&collection, now).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(removed) => tracing::debug!(removed, %collection, "Purged expired one-time codes"),
                Err(e) => tracing::warn!("Background cleanup failed: {}", e),
            }
        });
    }

    /// Returns the validity window of issued codes.
    pub fn ttl_limit(&self) -> Duration {
        self.config.ttl_limit
    }

    pub fn collection(&self) -> &str {
        &self.config.collection
    }

    /// Returns a reference to the storage backend.
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }
}

#[async_trait]
impl<S: DocumentStore + 'static> StoreService for OneTimeCodeService<S> {
    async fn build_index(&self) -> Result<(), CredentialError> {
        let collection = &self.config.collection;
        self.store
            .create_index(collection, IndexSpec::new(&["owner", "type", "code"]).unique())
            .await?;
        self.store
            .create_index(
                collection,
                IndexSpec::new(&["createdAt"]).expire_after(self.config.ttl_limit),
            )
            .await?;
        tracing::info!(%collection, ttl = ?self.config.ttl_limit, "One-time code indexes ready");
        Ok(())
    }
}
