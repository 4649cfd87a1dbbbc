use std::future::Future;
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use crate::credential::time_utils::{TimeProviderFn, system_time_provider};

/// Decides when the one-time code issuer sweeps expired codes.
///
/// The issuer consults the strategy after every successful issuance. When it
/// answers `true`, a background task calls
/// [`DocumentStore::purge_expired`](crate::storage::DocumentStore::purge_expired)
/// and the strategy is told to reset.
#[async_trait]
pub trait CleanupStrategy: Send + Sync {
    /// Called once per issued code; returns `true` to trigger a sweep.
    async fn should_cleanup(&self) -> bool;

    /// Called when a sweep has been scheduled.
    async fn mark_as_cleaned(&self);
}

/// Sweeps after a number of issuances or after a period of time, whichever
/// comes first.
pub struct HybridCleanupStrategy {
    count_threshold: u32,
    time_threshold: Duration,
    issued_count: AtomicU32,
    last_cleanup_millis: AtomicI64,
    time_provider: TimeProviderFn,
}

impl HybridCleanupStrategy {
    /// Creates a strategy with the given thresholds.
    ///
    /// # Example
    ///
    /// ```
    /// use std::time::Duration;
    /// use credential_core::cleanup::HybridCleanupStrategy;
    ///
    /// // Sweep every 100 issued codes or every 5 minutes
    /// let strategy = HybridCleanupStrategy::new(100, Duration::from_secs(300));
    /// assert_eq!(strategy.count_threshold(), 100);
    /// ```
    pub fn new(count_threshold: u32, time_threshold: Duration) -> Self {
        let time_provider = system_time_provider();
        Self {
            count_threshold,
            time_threshold,
            issued_count: AtomicU32::new(0),
            last_cleanup_millis: AtomicI64::new(time_provider().unwrap_or_default()),
            time_provider,
        }
    }

    /// Measures the time threshold with `provider` instead of the system
    /// clock. The timer restarts at the provider's current time.
    pub fn with_time_provider(mut self, provider: TimeProviderFn) -> Self {
        self.last_cleanup_millis = AtomicI64::new(provider().unwrap_or_default());
        self.time_provider = provider;
        self
    }

    fn now_millis(&self) -> i64 {
        (self.time_provider)().unwrap_or_default()
    }

    pub fn count_threshold(&self) -> u32 {
        self.count_threshold
    }

    pub fn time_threshold(&self) -> Duration {
        self.time_threshold
    }
}

#[async_trait]
impl CleanupStrategy for HybridCleanupStrategy {
    async fn should_cleanup(&self) -> bool {
        let count = self.issued_count.fetch_add(1, Ordering::SeqCst) + 1;
        if count >= self.count_threshold {
            return true;
        }

        let elapsed = self.now_millis().saturating_sub(self.last_cleanup_millis.load(Ordering::SeqCst));
        elapsed >= self.time_threshold.as_millis() as i64
    }

    async fn mark_as_cleaned(&self) {
        self.issued_count.store(0, Ordering::SeqCst);
        self.last_cleanup_millis
            .store(self.now_millis(), Ordering::SeqCst);
    }
}

impl Default for HybridCleanupStrategy {
    /// 100 issuances or 5 minutes.
    fn default() -> Self {
        Self::new(100, Duration::from_secs(300))
    }
}

/// A cleanup strategy backed by a closure.
///
/// The closure owns whatever state it needs; `mark_as_cleaned` does nothing.
pub struct CustomCleanupStrategy<F, Fut>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = bool> + Send + 'static,
{
    strategy_fn: F,
}

impl<F, Fut> CustomCleanupStrategy<F, Fut>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = bool> + Send + 'static,
{
    /// # Example
    ///
    /// ```
    /// use credential_core::cleanup::CustomCleanupStrategy;
    ///
    /// // Never sweep from the issuer; an external job calls purge_expired.
    /// let strategy = CustomCleanupStrategy::new(|| async { false });
    /// ```
    pub fn new(strategy_fn: F) -> Self {
        Self { strategy_fn }
    }
}

#[async_trait]
impl<F, Fut> CleanupStrategy for CustomCleanupStrategy<F, Fut>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = bool> + Send + 'static,
{
    async fn should_cleanup(&self) -> bool {
        (self.strategy_fn)().await
    }

    async fn mark_as_cleaned(&self) {}
}

pub type BoxedCleanupStrategy = Box<dyn CleanupStrategy>;
