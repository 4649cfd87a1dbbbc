use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::credential::cleanup::{BoxedCleanupStrategy, CustomCleanupStrategy, HybridCleanupStrategy};
use crate::credential::config::OneTimeConfig;
use crate::credential::onetime::{CodeGeneratorFn, generate_onetime_code};
use crate::credential::service::StoreService;
use crate::credential::time_utils::{TimeProviderFn, system_time_provider};
use crate::credential::{CredentialError, OneTimeCodeService};
use crate::storage::{DocumentStore, MemoryStore};

/// A builder for creating a [`OneTimeCodeService`].
///
/// Starts from [`OneTimeConfig::default()`] (environment variables, then
/// built-in defaults) and an in-memory store.
#[must_use = "The builder does nothing unless `.build()` or `.build_and_init()` is called."]
pub struct OneTimeCodeServiceBuilder<S: DocumentStore> {
    store: Arc<S>,
    config: OneTimeConfig,
    code_generator: Option<CodeGeneratorFn>,
    time_provider: Option<TimeProviderFn>,
    hybrid_thresholds: Option<(u32, Duration)>,
    cleanup_strategy: Option<BoxedCleanupStrategy>,
}

impl OneTimeCodeServiceBuilder<MemoryStore> {
    pub(crate) fn new() -> Self {
        Self {
            store: Arc::new(MemoryStore::new()),
            config: OneTimeConfig::default(),
            code_generator: None,
            time_provider: None,
            hybrid_thresholds: None,
            cleanup_strategy: None, // Defaults to HybridCleanupStrategy in build
        }
    }
}

impl<S: DocumentStore + 'static> OneTimeCodeServiceBuilder<S> {
    /// Specifies a storage backend to use instead of the default `MemoryStore`.
    pub fn with_store<T: DocumentStore + 'static>(self, store: Arc<T>) -> OneTimeCodeServiceBuilder<T> {
        OneTimeCodeServiceBuilder {
            store,
            config: self.config,
            code_generator: self.code_generator,
            time_provider: self.time_provider,
            hybrid_thresholds: self.hybrid_thresholds,
            cleanup_strategy: self.cleanup_strategy,
        }
    }

    /// Replaces the whole configuration, e.g. with a preset.
    ///
    /// ```rust
    /// use credential_core::{ConfigPreset, OneTimeCodeService};
    ///
    /// # fn example() -> Result<(), credential_core::CredentialError> {
    /// let service = OneTimeCodeService::builder()
    ///     .with_config(ConfigPreset::HighSecurity.into())
    ///     .build()?;
    /// assert_eq!(service.ttl_limit().as_secs(), 120);
    /// # Ok(())
    /// # }
    /// ```
    pub fn with_config(mut self, config: OneTimeConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets how long an issued code stays valid. Defaults to 10 minutes.
    pub fn with_ttl_limit(mut self, ttl_limit: Duration) -> Self {
        self.config.ttl_limit = ttl_limit;
        self
    }

    /// Sets the collection name. Defaults to `onetime_code`.
    pub fn with_collection(mut self, collection: impl Into<String>) -> Self {
        self.config.collection = collection.into();
        self
    }

    /// Replaces the default 128-bit random hex code generator.
    pub fn with_code_generator<F>(mut self, generator: F) -> Self
    where
        F: Fn() -> String + Send + Sync + 'static,
    {
        self.code_generator = Some(Arc::new(generator));
        self
    }

    /// Replaces the system clock. The function returns Unix milliseconds.
    ///
    /// The default hybrid sweep measures its time threshold with the same
    /// clock.
    pub fn with_time_provider<F>(mut self, provider: F) -> Self
    where
        F: Fn() -> Result<i64, CredentialError> + Send + Sync + 'static,
    {
        self.time_provider = Some(Arc::new(provider));
        self
    }

    /// Configures the automatic expiry sweep with custom hybrid thresholds.
    ///
    /// By default the service sweeps after 100 issued codes or 5 minutes.
    ///
    /// # Example
    ///
    /// ```rust
    /// # use std::time::Duration;
    /// # use credential_core::OneTimeCodeService;
    /// #
    /// # async fn example() -> Result<(), credential_core::CredentialError> {
    /// // Sweep every 50 codes or every 2 minutes
    /// let service = OneTimeCodeService::builder()
    ///     .with_hybrid_cleanup_thresholds(50, Duration::from_secs(120))
    ///     .build_and_init()
    ///     .await?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn with_hybrid_cleanup_thresholds(
        mut self,
        count_threshold: u32,
        time_threshold: Duration,
    ) -> Self {
        self.hybrid_thresholds = Some((count_threshold, time_threshold));
        self.cleanup_strategy = None;
        self
    }

    /// Replaces the sweep trigger with a closure, consulted after each
    /// issued code.
    pub fn with_custom_cleanup_strategy<F, Fut>(mut self, strategy_fn: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        let strategy = CustomCleanupStrategy::new(strategy_fn);
        self.cleanup_strategy = Some(Box::new(strategy));
        self.hybrid_thresholds = None;
        self
    }

    /// Validates the configuration and builds the service without touching
    /// the store.
    ///
    /// # Errors
    ///
    /// `InvalidConfiguration` for a zero validity window or an empty
    /// collection name.
    pub fn build(self) -> Result<OneTimeCodeService<S>, CredentialError> {
        self.config.validate()?;
        for warning in self.config.warnings() {
            tracing::warn!("{}", warning);
        }

        let time_provider = self.time_provider.unwrap_or_else(system_time_provider);
        let cleanup_strategy = self.cleanup_strategy.unwrap_or_else(|| {
            let strategy = match self.hybrid_thresholds {
                Some((count, time)) => HybridCleanupStrategy::new(count, time),
                None => HybridCleanupStrategy::default(),
            };
            Box::new(strategy.with_time_provider(Arc::clone(&time_provider)))
        });

        Ok(OneTimeCodeService {
            store: self.store,
            config: self.config,
            code_generator: self
                .code_generator
                .unwrap_or_else(|| Arc::new(generate_onetime_code) as CodeGeneratorFn),
            time_provider,
            cleanup_strategy,
        })
    }

    /// Builds the service, initializes the store and declares the indexes.
    pub async fn build_and_init(self) -> Result<OneTimeCodeService<S>, CredentialError> {
        let service = self.build()?;
        service.store.init().await?;
        service.setup().await?;
        Ok(service)
    }
}
