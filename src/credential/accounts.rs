use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::CredentialError;
use super::config::UserConfig;
use super::password::{check_password_hash, generate_password_hash};
use super::service::StoreService;
use super::time_utils::current_timestamp_millis;
use crate::storage::{DocumentStore, Filter, IndexSpec, Update, from_document, to_document};

/// A stored account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    pub user: String,
    pub email: String,
    /// `method$salt$digest`, never the plain password.
    pub hashed_password: String,
    pub verified: bool,
    #[serde(rename = "createdAt")]
    pub created_at: i64,
}

/// Stores accounts and verifies their passwords.
///
/// Key derivation is CPU-bound and deliberately slow, so hashing and
/// verification run on tokio's blocking thread pool.
///
/// # Example
///
/// ```rust
/// use credential_core::{UserConfig, UserService};
/// use credential_core::storage::MemoryStore;
/// use std::sync::Arc;
///
/// # async fn example() -> Result<(), credential_core::CredentialError> {
/// let service = UserService::new_and_init(Arc::new(MemoryStore::new()), UserConfig::default()).await?;
/// service.create_user("alice", "alice@example.com", "hunter2", false).await?;
///
/// assert!(service.verify_user_password("alice", "hunter2").await?);
/// assert!(!service.verify_user_password("alice", "wrong").await?);
/// # Ok(())
/// # }
/// ```
pub struct UserService<S: DocumentStore> {
    store: Arc<S>,
    config: UserConfig,
}

impl<S: DocumentStore> UserService<S> {
    /// Creates the service after validating the hash method, salt length and
    /// collection name.
    pub fn new(store: Arc<S>, config: UserConfig) -> Result<Self, CredentialError> {
        config.validate()?;
        Ok(Self { store, config })
    }

    /// Creates the service, initializes the store and declares the unique
    /// `user` index, so a second account with the same name is rejected as
    /// [`CredentialError::DuplicateKey`].
    pub async fn new_and_init(store: Arc<S>, config: UserConfig) -> Result<Self, CredentialError> {
        let service = Self::new(store, config)?;
        service.store.init().await?;
        service.setup().await?;
        Ok(service)
    }

    fn user_filter(user: &str) -> Filter {
        Filter::new().eq("user", user)
    }

    async fn hash(&self, password: &str) -> Result<String, CredentialError> {
        let password = password.to_string();
        let method = self.config.hash_method.clone();
        let salt_length = self.config.salt_length;
        tokio::task::spawn_blocking(move || {
            generate_password_hash(&password, &method, salt_length)
        })
        .await
        .map_err(|e| CredentialError::CryptoError(format!("Hashing task failed: {e}")))?
    }

    /// Creates an account and returns its name.
    ///
    /// # Errors
    ///
    /// `DuplicateKey` if the user name is taken.
    pub async fn create_user(
        &self,
        user: &str,
        email: &str,
        password: &str,
        verified: bool,
    ) -> Result<String, CredentialError> {
        let record = UserRecord {
            user: user.to_string(),
            email: email.to_string(),
            hashed_password: self.hash(password).await?,
            verified,
            created_at: current_timestamp_millis()?,
        };
        self.store
            .insert(&self.config.collection, to_document(&record)?)
            .await?;
        tracing::debug!(user, "Created user");
        Ok(record.user)
    }

    async fn set_field(
        &self,
        user: &str,
        field: &str,
        value: serde_json::Value,
    ) -> Result<bool, CredentialError> {
        let result = self
            .store
            .update_one(
                &self.config.collection,
                &Self::user_filter(user),
                &Update::new().set(field, value),
                false,
            )
            .await?;
        Ok(result.modified_count > 0)
    }

    /// Replaces the password hash. Returns `false` for an unknown user.
    pub async fn update_user_password(
        &self,
        user: &str,
        password: &str,
    ) -> Result<bool, CredentialError> {
        let hashed = self.hash(password).await?;
        self.set_field(user, "hashed_password", hashed.into()).await
    }

    /// Checks a password. An unknown user never verifies.
    pub async fn verify_user_password(
        &self,
        user: &str,
        password: &str,
    ) -> Result<bool, CredentialError> {
        let Some(record) = self.get_user(user).await? else {
            return Ok(false);
        };

        let password = password.to_string();
        tokio::task::spawn_blocking(move || check_password_hash(&record.hashed_password, &password))
            .await
            .map_err(|e| CredentialError::CryptoError(format!("Verification task failed: {e}")))
    }

    /// Returns `true` if the address changed.
    pub async fn change_user_email(&self, user: &str, email: &str) -> Result<bool, CredentialError> {
        self.set_field(user, "email", email.into()).await
    }

    /// Returns `true` if the flag changed.
    pub async fn change_user_verification_status(
        &self,
        user: &str,
        verified: bool,
    ) -> Result<bool, CredentialError> {
        self.set_field(user, "verified", verified.into()).await
    }

    pub async fn get_user(&self, user: &str) -> Result<Option<UserRecord>, CredentialError> {
        self.store
            .find_one(&self.config.collection, &Self::user_filter(user))
            .await?
            .map(from_document)
            .transpose()
    }
}

#[async_trait]
impl<S: DocumentStore> StoreService for UserService<S> {
    async fn build_index(&self) -> Result<(), CredentialError> {
        let collection = &self.config.collection;
        self.store
            .create_index(collection, IndexSpec::new(&["user"]).unique())
            .await?;
        for key in ["email", "verified", "createdAt"] {
            self.store
                .create_index(collection, IndexSpec::new(&[key]))
                .await?;
        }
        tracing::info!(%collection, "User indexes ready");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;

    /// Cheap parameters keep the tests fast.
    async fn service() -> Result<UserService<MemoryStore>, CredentialError> {
        let service = UserService::new(
            Arc::new(MemoryStore::new()),
            UserConfig {
                collection: "users".to_string(),
                hash_method: "pbkdf2:sha256:1000".to_string(),
                salt_length: 16,
            },
        )?;
        service.setup().await?;
        Ok(service)
    }

    #[test]
    fn test_new_rejects_unknown_hash_method() {
        let result = UserService::new(
            Arc::new(MemoryStore::new()),
            UserConfig {
                hash_method: "bcrypt".to_string(),
                ..UserConfig::default()
            },
        );
        assert!(matches!(
            result,
            Err(CredentialError::InvalidConfiguration(_))
        ));
    }

    #[tokio::test]
    async fn test_create_and_verify_user() -> Result<(), CredentialError> {
        let service = service().await?;
        assert_eq!(
            service.create_user("alice", "a@example.com", "s3cret", false).await?,
            "alice"
        );

        let record = service.get_user("alice").await?.unwrap();
        assert_eq!(record.email, "a@example.com");
        assert!(!record.verified);
        assert!(record.hashed_password.starts_with("pbkdf2:sha256:1000$"));
        assert!(!record.hashed_password.contains("s3cret"));

        assert!(service.verify_user_password("alice", "s3cret").await?);
        assert!(!service.verify_user_password("alice", "S3cret").await?);
        assert!(!service.verify_user_password("nobody", "s3cret").await?);
        Ok(())
    }

    #[tokio::test]
    async fn test_duplicate_user() -> Result<(), CredentialError> {
        let service = service().await?;
        service.create_user("alice", "a@example.com", "pw", false).await?;
        let result = service.create_user("alice", "other@example.com", "pw", true).await;
        assert!(matches!(result, Err(CredentialError::DuplicateKey(_))));
        Ok(())
    }

    #[tokio::test]
    async fn test_new_and_init_enforces_unique_user() -> Result<(), CredentialError> {
        let store = Arc::new(MemoryStore::new());
        let service = UserService::new_and_init(
            Arc::clone(&store),
            UserConfig {
                collection: "accounts".to_string(),
                hash_method: "pbkdf2:sha256:1000".to_string(),
                salt_length: 16,
            },
        )
        .await?;

        service.create_user("alice", "a@example.com", "pw", false).await?;
        let result = service.create_user("alice", "b@example.com", "pw", false).await;
        assert!(matches!(result, Err(CredentialError::DuplicateKey(_))));
        assert_eq!(store.get_stats("accounts").await?.total_records, 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_update_password() -> Result<(), CredentialError> {
        let service = service().await?;
        service.create_user("alice", "a@example.com", "old", false).await?;

        assert!(service.update_user_password("alice", "new").await?);
        assert!(service.verify_user_password("alice", "new").await?);
        assert!(!service.verify_user_password("alice", "old").await?);

        assert!(!service.update_user_password("nobody", "new").await?);
        Ok(())
    }

    #[tokio::test]
    async fn test_change_email_and_verification() -> Result<(), CredentialError> {
        let service = service().await?;
        service.create_user("alice", "a@example.com", "pw", false).await?;

        assert!(service.change_user_email("alice", "b@example.com").await?);
        // Setting the same value modifies nothing.
        assert!(!service.change_user_email("alice", "b@example.com").await?);
        assert!(service.change_user_verification_status("alice", true).await?);
        assert!(!service.change_user_verification_status("nobody", true).await?);

        let record = service.get_user("alice").await?.unwrap();
        assert_eq!(record.email, "b@example.com");
        assert!(record.verified);
        Ok(())
    }
}
