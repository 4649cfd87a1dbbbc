use async_trait::async_trait;

use crate::credential::error::CredentialError;

/// Lifecycle hooks shared by every service that owns a collection.
///
/// Call [`setup`](Self::setup) once at deployment time, before the service
/// handles traffic. Both steps are idempotent.
#[async_trait]
pub trait StoreService: Send + Sync {
    /// Declares the indexes the service relies on.
    async fn build_index(&self) -> Result<(), CredentialError>;

    /// Creates collections that need explicit options, such as a size cap.
    async fn create_collections(&self) -> Result<(), CredentialError> {
        Ok(())
    }

    /// Creates collections first, then indexes.
    async fn setup(&self) -> Result<(), CredentialError> {
        self.create_collections().await?;
        self.build_index().await
    }
}
