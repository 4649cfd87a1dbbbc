//! # Credential Core
//!
//! Password hashing, one-time verification codes and redeem-code lifecycles
//! for authentication backends, persisted through a pluggable document store.
//!
//! ## Features
//!
//! - **Password Hashing**: Salted `scrypt` and `pbkdf2` hashes in a
//!   self-describing `method$salt$digest` format, checked in constant time
//! - **One-Time Codes**: Short-lived codes bound to an owner and a purpose,
//!   consumable at most once
//! - **Redeem Codes**: An `issued → processing → used | error` lifecycle with
//!   exactly one winner per transition under concurrency
//! - **Accounts and Audit Log**: A user service and an activity log with TTL or
//!   capped retention
//! - **Pluggable Storage**: In-memory, SQLite and Redis backends behind one
//!   [`DocumentStore`] trait
//! - **Async Support**: Fully asynchronous API on tokio
//!
//! ## Quick Start
//!
//! ```rust
//! use credential_core::{OneTimeCodeService, check_password_hash, generate_password_hash};
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), credential_core::CredentialError> {
//! // Hash and verify a password
//! let hash = generate_password_hash("hunter2", "pbkdf2:sha256:1000", 16)?;
//! assert!(check_password_hash(&hash, "hunter2"));
//!
//! // Issue and consume a one-time code
//! let service = OneTimeCodeService::builder()
//!     .with_ttl_limit(Duration::from_secs(300))
//!     .build_and_init()
//!     .await?;
//! let code = service.create_code("alice@example.com", "password_reset").await?;
//! assert!(service.consume_code("alice@example.com", "password_reset", &code).await?);
//! # Ok(())
//! # }
//! ```
//!
//! ## Storage Backends
//!
//! [`storage::MemoryStore`] is always available. Enable `sqlite-store` for
//! `SqliteStore` or `redis-store` for `RedisStore`. Every service
//! takes an `Arc<S: DocumentStore>`, so several services can share one
//! backend.
//!
//! ## Configuration
//!
//! Collection names and validity windows default to environment variables:
//!
//! ```bash
//! export CREDENTIAL_ONETIME_TTL=600
//! export CREDENTIAL_ONETIME_COLLECTION="onetime_code"
//! export CREDENTIAL_REDEEM_COLLECTION="redeem_codes"
//! export CREDENTIAL_USERS_COLLECTION="users"
//! export CREDENTIAL_ACTIVITY_TTL=864000
//! ```
//!
//! ## Architecture
//!
//! - **[`OneTimeCodeService`]**: Issues, verifies and consumes one-time codes
//! - **[`RedeemCodeService`]**: Drives redeem codes through their lifecycle
//! - **[`UserService`]**: Stores accounts and checks passwords
//! - **[`ActivityLogger`]**: Records and queries user activity
//! - **[`StoreService`]**: Collection and index setup shared by all services
//! - **[`CredentialError`]**: Error type for every fallible operation

pub mod credential;

pub use credential::{cleanup, storage};

// Re-export commonly used types
pub use credential::{
    ActivityConfig, ActivityLogRecord, ActivityLogger, CodeGeneratorFn, ConfigPreset,
    CredentialError, DocumentStore, HashDiagnostic, HashMethod, HashVerification,
    MAX_CREATE_ATTEMPTS, OneTimeCodeRecord, OneTimeCodeService, OneTimeCodeServiceBuilder, OneTimeConfig,
    RedeemCodeRecord, RedeemCodeService, RedeemConfig, RedeemStatus, StoreService,
    TimeProviderFn, UserConfig, UserRecord, UserService, check_password_hash,
    current_timestamp_millis, gen_salt, generate_onetime_code, generate_password_hash,
    generate_secure_code, hash_password, parse_period, verify_password_hash,
};
