// Core components
mod accounts;
mod activity;
mod config;
mod error;
mod onetime;
mod onetime_builder;
mod password;
mod redeem;
mod service;
mod time_utils;

// Storage and cleanup systems
pub mod cleanup;
pub mod storage;

// Core components exports
pub use accounts::{UserRecord, UserService};
pub use activity::{ActivityLogRecord, ActivityLogger};
pub use config::{
    ActivityConfig, ConfigPreset, DEFAULT_ACTIVITY_COLLECTION, DEFAULT_ACTIVITY_TTL,
    DEFAULT_CAPPED_MAX_BYTES, DEFAULT_CAPPED_MAX_RECORDS, DEFAULT_ONETIME_COLLECTION,
    DEFAULT_ONETIME_TTL, DEFAULT_REDEEM_COLLECTION, DEFAULT_USERS_COLLECTION, OneTimeConfig,
    RedeemConfig, UserConfig,
};
pub use error::CredentialError;
pub use onetime::{
    CodeGeneratorFn, MAX_CREATE_ATTEMPTS, OneTimeCodeRecord, OneTimeCodeService,
    generate_onetime_code,
};
pub use onetime_builder::OneTimeCodeServiceBuilder;
pub use redeem::{
    DEFAULT_LIST_LIMIT, RedeemCodeRecord, RedeemCodeService, RedeemStatus, generate_secure_code,
};
pub use service::StoreService;
pub use time_utils::{TimeProviderFn, current_timestamp_millis, parse_period, system_time_provider};

// Hashing exports
pub use password::{
    DEFAULT_METHOD, DEFAULT_SALT_LENGTH, HashDiagnostic, HashMethod, HashVerification,
    Pbkdf2Digest, SALT_CHARS, check_password_hash, gen_salt, generate_password_hash,
    hash_password, verify_password_hash,
};

// Storage and cleanup exports
pub use cleanup::{
    BoxedCleanupStrategy, CleanupStrategy, CustomCleanupStrategy, HybridCleanupStrategy,
};
pub use storage::{DocumentStore, MemoryStore, StorageStats};
