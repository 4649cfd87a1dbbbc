use thiserror::Error;

/// Error types that can occur while issuing or validating credentials.
///
/// Every fallible operation in this crate returns `Result<T, CredentialError>`.
/// Each variant corresponds to one failure mode so that callers can tell a
/// logical conflict apart from a system failure.
///
/// # Error Categories
///
/// - **Configuration Errors**: `InvalidConfiguration`, `InvalidHashMethod`
/// - **Logical Conflicts**: `DuplicateKey`, `CodeGenerationExhausted`
/// - **System Errors**: `StorageError`, `SerializationError`, `CryptoError`
///
/// A lifecycle transition whose precondition does not hold is *not* an error:
/// the transition methods return `Ok(false)`.
///
/// # Example
///
/// ```rust
/// use credential_core::{CredentialError, OneTimeCodeService};
///
/// # async fn example() -> Result<(), CredentialError> {
/// let service = OneTimeCodeService::builder()
///     .with_code_generator(|| "fixed".to_string())
///     .build_and_init()
///     .await?;
///
/// service.create_code("alice", "email").await?;
/// match service.create_code("alice", "email").await {
///     Ok(code) => println!("issued {code}"),
///     Err(CredentialError::CodeGenerationExhausted { attempts }) => {
///         println!("no unique code after {attempts} attempts")
///     }
///     Err(e) => println!("other error: {e}"),
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Error, Debug)]
pub enum CredentialError {
    /// Options passed to a builder or constructor conflict or are out of range.
    ///
    /// Raised before any collection or index is touched, never resolved
    /// silently.
    ///
    /// # When This Occurs
    ///
    /// - TTL retention and capped retention enabled together on an activity log
    /// - A zero validity window for one-time codes
    /// - An empty collection name
    /// - A zero salt length
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Unknown key-derivation method or wrong parameters at hash generation.
    ///
    /// Only [`generate_password_hash`](crate::generate_password_hash) raises
    /// this. Verification reports the same condition as a failed match.
    #[error("Invalid hash method: {0}")]
    InvalidHashMethod(String),

    /// A uniqueness constraint declared on the store was violated.
    ///
    /// Propagated for caller-supplied identifiers (redeem codes, user names).
    /// The one-time code issuer catches it internally and retries.
    #[error("Duplicate key: {0}")]
    DuplicateKey(String),

    /// Every generated candidate collided with an existing record.
    ///
    /// # Resolution
    ///
    /// Check the configured code generator; the default one produces 128 bits
    /// of randomness and should never exhaust.
    #[error("Failed to generate unique code after {attempts} attempts")]
    CodeGenerationExhausted {
        /// Number of insert attempts made.
        attempts: u32,
    },

    /// A store operation failed.
    ///
    /// Transient failures are not retried by this crate; retry policy is left
    /// to the caller or the storage backend.
    #[error("Storage error: {0}")]
    StorageError(String),

    /// A record could not be converted to or from a stored document.
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Random number generation, key derivation or the system clock failed.
    #[error("Crypto error: {0}")]
    CryptoError(String),
}

impl CredentialError {
    /// Wraps a backend-specific failure message.
    pub fn from_storage_message(message: impl Into<String>) -> Self {
        Self::StorageError(message.into())
    }

    /// Returns `true` for logical conflicts that a caller can act on, as
    /// opposed to system failures.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            Self::DuplicateKey(_) | Self::CodeGenerationExhausted { .. }
        )
    }
}

impl From<serde_json::Error> for CredentialError {
    fn from(e: serde_json::Error) -> Self {
        Self::SerializationError(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(
            CredentialError::CodeGenerationExhausted { attempts: 3 }.to_string(),
            "Failed to generate unique code after 3 attempts"
        );
        assert_eq!(
            CredentialError::DuplicateKey("onetime_code".to_string()).to_string(),
            "Duplicate key: onetime_code"
        );
        assert_eq!(
            CredentialError::InvalidHashMethod("md5".to_string()).to_string(),
            "Invalid hash method: md5"
        );

        let storage_error = CredentialError::from_storage_message("disk full");
        assert_eq!(storage_error.to_string(), "Storage error: disk full");
    }

    #[test]
    fn test_conflicts_are_distinguishable() {
        assert!(CredentialError::DuplicateKey("x".to_string()).is_conflict());
        assert!(CredentialError::CodeGenerationExhausted { attempts: 3 }.is_conflict());
        assert!(!CredentialError::StorageError("x".to_string()).is_conflict());
        assert!(!CredentialError::InvalidConfiguration("x".to_string()).is_conflict());
    }

    #[test]
    fn test_serde_error_conversion() {
        let err: CredentialError = serde_json::from_str::<serde_json::Value>("{")
            .unwrap_err()
            .into();
        assert!(matches!(err, CredentialError::SerializationError(_)));
    }

    #[test]
    fn test_error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<CredentialError>();
    }
}
