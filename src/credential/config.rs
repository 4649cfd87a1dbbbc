//! Service configuration.
//!
//! Every service has a plain configuration struct whose `Default` reads
//! environment variables, a `validate()` step that rejects unusable settings
//! with [`CredentialError::InvalidConfiguration`], and (where it makes sense)
//! a `warnings()` step with advice that does not block construction.

use std::str::FromStr;
use std::time::Duration;

use crate::credential::error::CredentialError;
use crate::credential::password::{DEFAULT_METHOD, DEFAULT_SALT_LENGTH, HashMethod};
use crate::credential::storage::check_name;

/// Default collection of one-time codes.
pub const DEFAULT_ONETIME_COLLECTION: &str = "onetime_code";
/// Default validity window of a one-time code (10 minutes).
pub const DEFAULT_ONETIME_TTL: Duration = Duration::from_secs(600);
pub const DEFAULT_REDEEM_COLLECTION: &str = "redeem_codes";
pub const DEFAULT_USERS_COLLECTION: &str = "users";
pub const DEFAULT_ACTIVITY_COLLECTION: &str = "activity_logs";
/// Default retention of activity records under TTL retention (10 days).
pub const DEFAULT_ACTIVITY_TTL: Duration = Duration::from_secs(10 * 24 * 60 * 60);
/// Default size of a capped activity collection (1 GiB).
pub const DEFAULT_CAPPED_MAX_BYTES: u64 = 1 << 30;
pub const DEFAULT_CAPPED_MAX_RECORDS: u64 = 1000;

fn env_or<T: FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn env_string_or(name: &str, default: &str) -> String {
    std::env::var(name)
        .ok()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn require_collection(collection: &str) -> Result<(), CredentialError> {
    if collection.trim().is_empty() {
        return Err(CredentialError::InvalidConfiguration(
            "Collection name must not be empty".to_string(),
        ));
    }
    check_name(collection).map(|_| ())
}

/// Predefined one-time code configurations for common deployments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigPreset {
    /// Production-ready configuration.
    ///
    /// - Validity window: 10 minutes (time to read an email or SMS)
    Production,

    /// Development-friendly configuration.
    ///
    /// - Validity window: 30 minutes (longer window for manual testing)
    Development,

    /// High-security configuration.
    ///
    /// - Validity window: 2 minutes (minimal exposure of intercepted codes)
    HighSecurity,

    /// Load configuration from environment variables.
    ///
    /// Reads configuration from:
    /// - `CREDENTIAL_ONETIME_TTL`: Validity window in seconds (default: 600)
    /// - `CREDENTIAL_ONETIME_COLLECTION`: Collection name (default: `onetime_code`)
    FromEnv,
}

/// Configuration of the one-time code issuer.
///
/// # Environment Variables
///
/// - `CREDENTIAL_ONETIME_TTL`: Validity window in seconds (default: 600)
/// - `CREDENTIAL_ONETIME_COLLECTION`: Collection name (default: `onetime_code`)
///
/// # Example
///
/// ```rust
/// use credential_core::{ConfigPreset, OneTimeConfig};
/// use std::time::Duration;
///
/// let config = OneTimeConfig::from(ConfigPreset::HighSecurity);
/// assert_eq!(config.ttl_limit, Duration::from_secs(120));
///
/// let config = OneTimeConfig {
///     ttl_limit: Duration::from_secs(300),
///     collection: "email_codes".to_string(),
/// };
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone)]
pub struct OneTimeConfig {
    /// Maximum age of a code that still verifies.
    pub ttl_limit: Duration,
    pub collection: String,
}

impl Default for OneTimeConfig {
    fn default() -> Self {
        Self {
            ttl_limit: Duration::from_secs(env_or(
                "CREDENTIAL_ONETIME_TTL",
                DEFAULT_ONETIME_TTL.as_secs(),
            )),
            collection: env_string_or("CREDENTIAL_ONETIME_COLLECTION", DEFAULT_ONETIME_COLLECTION),
        }
    }
}

impl OneTimeConfig {
    /// Rejects settings the issuer cannot work with.
    pub fn validate(&self) -> Result<(), CredentialError> {
        if self.ttl_limit.is_zero() {
            return Err(CredentialError::InvalidConfiguration(
                "One-time code validity window must be greater than zero".to_string(),
            ));
        }
        require_collection(&self.collection)
    }

    /// Returns warnings for settings that work but are probably unintended.
    pub fn warnings(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.ttl_limit < Duration::from_secs(60) {
            warnings.push(
                "Very short validity window (< 1 minute) may expire codes before users enter them"
                    .to_string(),
            );
        }
        if self.ttl_limit > Duration::from_secs(3600) {
            warnings.push(
                "Long validity window (> 1 hour) gives intercepted codes more time to be used"
                    .to_string(),
            );
        }

        warnings
    }

    /// Returns a summary of the current configuration.
    pub fn summary(&self) -> String {
        format!(
            "OneTimeConfig {{ TTL: {}s, Collection: {} }}",
            self.ttl_limit.as_secs(),
            self.collection,
        )
    }
}

impl From<ConfigPreset> for OneTimeConfig {
    fn from(preset: ConfigPreset) -> Self {
        let ttl_limit = match preset {
            ConfigPreset::Production => DEFAULT_ONETIME_TTL,
            ConfigPreset::Development => Duration::from_secs(1800),
            ConfigPreset::HighSecurity => Duration::from_secs(120),
            ConfigPreset::FromEnv => return Self::default(),
        };
        Self {
            ttl_limit,
            collection: DEFAULT_ONETIME_COLLECTION.to_string(),
        }
    }
}

/// Configuration of the redeem code lifecycle manager.
///
/// `collection` defaults to `CREDENTIAL_REDEEM_COLLECTION` or `redeem_codes`.
#[derive(Debug, Clone)]
pub struct RedeemConfig {
    pub collection: String,
}

impl Default for RedeemConfig {
    fn default() -> Self {
        Self {
            collection: env_string_or("CREDENTIAL_REDEEM_COLLECTION", DEFAULT_REDEEM_COLLECTION),
        }
    }
}

impl RedeemConfig {
    pub fn validate(&self) -> Result<(), CredentialError> {
        require_collection(&self.collection)
    }
}

/// Configuration of the account service.
#[derive(Debug, Clone)]
pub struct UserConfig {
    /// Defaults to `CREDENTIAL_USERS_COLLECTION` or `users`.
    pub collection: String,
    /// Method string handed to the hasher, e.g. `scrypt` or `pbkdf2:sha512`.
    pub hash_method: String,
    pub salt_length: usize,
}

impl Default for UserConfig {
    fn default() -> Self {
        Self {
            collection: env_string_or("CREDENTIAL_USERS_COLLECTION", DEFAULT_USERS_COLLECTION),
            hash_method: DEFAULT_METHOD.to_string(),
            salt_length: DEFAULT_SALT_LENGTH,
        }
    }
}

impl UserConfig {
    /// Rejects an unusable collection, salt length or hash method.
    pub fn validate(&self) -> Result<(), CredentialError> {
        require_collection(&self.collection)?;
        if self.salt_length == 0 {
            return Err(CredentialError::InvalidConfiguration(
                "Salt length must be greater than zero".to_string(),
            ));
        }
        HashMethod::from_str(&self.hash_method)
            .map(|_| ())
            .map_err(|e| CredentialError::InvalidConfiguration(e.to_string()))
    }
}

/// Configuration of the activity log.
///
/// Exactly one retention policy may be active: TTL expiry or a capped
/// collection (or neither).
///
/// ```rust
/// use credential_core::ActivityConfig;
///
/// let config = ActivityConfig {
///     use_capped: true,
///     ..ActivityConfig::default()
/// };
/// // TTL retention is on by default, so this conflicts.
/// assert!(config.validate().is_err());
/// ```
#[derive(Debug, Clone)]
pub struct ActivityConfig {
    pub collection: String,
    pub use_ttl: bool,
    /// Retention under TTL; `CREDENTIAL_ACTIVITY_TTL` seconds, default 10 days.
    pub ttl: Duration,
    pub use_capped: bool,
    pub capped_max_bytes: u64,
    pub capped_max_records: u64,
}

impl Default for ActivityConfig {
    fn default() -> Self {
        Self {
            collection: DEFAULT_ACTIVITY_COLLECTION.to_string(),
            use_ttl: true,
            ttl: Duration::from_secs(env_or(
                "CREDENTIAL_ACTIVITY_TTL",
                DEFAULT_ACTIVITY_TTL.as_secs(),
            )),
            use_capped: false,
            capped_max_bytes: DEFAULT_CAPPED_MAX_BYTES,
            capped_max_records: DEFAULT_CAPPED_MAX_RECORDS,
        }
    }
}

impl ActivityConfig {
    pub fn validate(&self) -> Result<(), CredentialError> {
        require_collection(&self.collection)?;
        if self.use_ttl && self.use_capped {
            return Err(CredentialError::InvalidConfiguration(
                "TTL retention and capped retention cannot both be enabled".to_string(),
            ));
        }
        if self.use_ttl && self.ttl.is_zero() {
            return Err(CredentialError::InvalidConfiguration(
                "Activity retention period must be greater than zero".to_string(),
            ));
        }
        if self.use_capped && (self.capped_max_bytes == 0 || self.capped_max_records == 0) {
            return Err(CredentialError::InvalidConfiguration(
                "Capped activity collection needs non-zero size limits".to_string(),
            ));
        }
        Ok(())
    }
}
