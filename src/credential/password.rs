//! Password hashing with self-describing credential strings.
//!
//! A credential string has the form `method$salt$digest`, for example
//! `scrypt:32768:8:1$Xq3...$9f86d0...`. The method part always carries the
//! resolved parameters, so hashes stay verifiable after defaults change.

use std::fmt;
use std::str::FromStr;

use rand::Rng;
use rand::distributions::Alphanumeric;
use rand::rngs::OsRng;
use subtle::ConstantTimeEq;

use crate::credential::error::CredentialError;

/// Method used when the caller does not name one.
pub const DEFAULT_METHOD: &str = "scrypt";
/// Salt length used when the caller does not name one.
pub const DEFAULT_SALT_LENGTH: usize = 16;
/// The 62-character alphabet salts are drawn from.
pub const SALT_CHARS: &str = "abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

const KEY_LENGTH: usize = 32;

const DEFAULT_SCRYPT_N: u64 = 1 << 15;
const DEFAULT_SCRYPT_R: u32 = 8;
const DEFAULT_SCRYPT_P: u32 = 1;
const DEFAULT_PBKDF2_ITERATIONS: u32 = 1_000_000;

// 128 * N * r * p bytes of scratch memory; anything above this is refused.
const MAX_SCRYPT_MEMORY: u64 = 1 << 30;

/// Digest algorithms accepted by `pbkdf2`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pbkdf2Digest {
    Sha224,
    Sha256,
    Sha384,
    Sha512,
}

impl Pbkdf2Digest {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Sha224 => "sha224",
            Self::Sha256 => "sha256",
            Self::Sha384 => "sha384",
            Self::Sha512 => "sha512",
        }
    }

    fn from_name(name: &str) -> Option<Self> {
        match name {
            "sha224" => Some(Self::Sha224),
            "sha256" => Some(Self::Sha256),
            "sha384" => Some(Self::Sha384),
            "sha512" => Some(Self::Sha512),
            _ => None,
        }
    }
}

/// A key-derivation method with fully resolved parameters.
///
/// Parsed from the method part of a credential string. Omitted parameters are
/// filled in with the current defaults, and [`Display`](fmt::Display) always
/// writes every parameter back out.
///
/// ```rust
/// use credential_core::HashMethod;
///
/// let method: HashMethod = "pbkdf2:sha512".parse()?;
/// assert_eq!(method.to_string(), "pbkdf2:sha512:1000000");
/// # Ok::<(), credential_core::CredentialError>(())
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashMethod {
    Scrypt { n: u64, r: u32, p: u32 },
    Pbkdf2 { digest: Pbkdf2Digest, iterations: u32 },
}

/// Why a stored credential string could not be checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashDiagnostic {
    /// The string did not split into exactly `method$salt$digest`.
    WrongPartCount,
    /// The method name is not known (or its feature is disabled).
    UnknownMethod,
    /// Wrong argument count or out-of-range parameters for a known method.
    InvalidParameters,
    /// The salt part is empty.
    EmptySalt,
}

/// Detailed outcome of checking a password against a credential string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashVerification {
    Match,
    Mismatch,
    Malformed(HashDiagnostic),
}

impl HashVerification {
    pub fn is_match(&self) -> bool {
        matches!(self, Self::Match)
    }
}

struct MethodParseError {
    diagnostic: HashDiagnostic,
    message: String,
}

impl MethodParseError {
    fn unknown(message: String) -> Self {
        Self {
            diagnostic: HashDiagnostic::UnknownMethod,
            message,
        }
    }

    fn invalid(message: String) -> Self {
        Self {
            diagnostic: HashDiagnostic::InvalidParameters,
            message,
        }
    }
}

impl HashMethod {
    /// Returns the bare method name (`scrypt` or `pbkdf2`).
    pub fn name(&self) -> &'static str {
        match self {
            Self::Scrypt { .. } => "scrypt",
            Self::Pbkdf2 { .. } => "pbkdf2",
        }
    }

    fn parse_detailed(method: &str) -> Result<Self, MethodParseError> {
        let mut parts = method.split(':');
        let name = parts.next().unwrap_or_default();
        let args: Vec<&str> = parts.collect();

        match name {
            "scrypt" if cfg!(feature = "kdf-scrypt") => Self::parse_scrypt(&args),
            "pbkdf2" if cfg!(feature = "kdf-pbkdf2") => Self::parse_pbkdf2(&args),
            _ => Err(MethodParseError::unknown(format!(
                "Invalid hash method '{name}'."
            ))),
        }
    }

    fn parse_scrypt(args: &[&str]) -> Result<Self, MethodParseError> {
        let (n, r, p) = match args {
            [] => (DEFAULT_SCRYPT_N, DEFAULT_SCRYPT_R, DEFAULT_SCRYPT_P),
            [n, r, p] => (
                parse_number::<u64>("scrypt N", n)?,
                parse_number::<u32>("scrypt r", r)?,
                parse_number::<u32>("scrypt p", p)?,
            ),
            _ => {
                return Err(MethodParseError::invalid(
                    "'scrypt' takes 3 arguments.".to_string(),
                ));
            }
        };

        if n < 2 || !n.is_power_of_two() {
            return Err(MethodParseError::invalid(format!(
                "scrypt N must be a power of two greater than 1, got {n}"
            )));
        }
        if r == 0 || p == 0 {
            return Err(MethodParseError::invalid(
                "scrypt r and p must be at least 1".to_string(),
            ));
        }
        let memory = 128u64
            .checked_mul(n)
            .and_then(|m| m.checked_mul(u64::from(r)))
            .and_then(|m| m.checked_mul(u64::from(p)));
        match memory {
            Some(bytes) if bytes <= MAX_SCRYPT_MEMORY => Ok(Self::Scrypt { n, r, p }),
            _ => Err(MethodParseError::invalid(format!(
                "scrypt parameters N={n} r={r} p={p} exceed the memory limit"
            ))),
        }
    }

    fn parse_pbkdf2(args: &[&str]) -> Result<Self, MethodParseError> {
        let (digest_name, iterations) = match args {
            [] => ("sha256", DEFAULT_PBKDF2_ITERATIONS),
            [digest] => (*digest, DEFAULT_PBKDF2_ITERATIONS),
            [digest, iterations] => (*digest, parse_number::<u32>("pbkdf2 iterations", iterations)?),
            _ => {
                return Err(MethodParseError::invalid(
                    "'pbkdf2' takes 2 arguments.".to_string(),
                ));
            }
        };

        let digest = Pbkdf2Digest::from_name(digest_name).ok_or_else(|| {
            MethodParseError::invalid(format!("Unsupported pbkdf2 digest '{digest_name}'"))
        })?;
        if iterations == 0 {
            return Err(MethodParseError::invalid(
                "pbkdf2 iterations must be at least 1".to_string(),
            ));
        }
        Ok(Self::Pbkdf2 { digest, iterations })
    }

    /// Derives the 32-byte key for `password` and `salt`.
    fn derive_key(&self, password: &[u8], salt: &[u8]) -> Result<[u8; KEY_LENGTH], CredentialError> {
        let mut key = [0u8; KEY_LENGTH];
        match *self {
            #[cfg(feature = "kdf-scrypt")]
            Self::Scrypt { n, r, p } => {
                let params = scrypt::Params::new(n.trailing_zeros() as u8, r, p, KEY_LENGTH)
                    .map_err(|e| {
                        CredentialError::InvalidHashMethod(format!("scrypt parameters rejected: {e}"))
                    })?;
                scrypt::scrypt(password, salt, &params, &mut key)
                    .map_err(|e| CredentialError::CryptoError(format!("scrypt failed: {e}")))?;
            }
            #[cfg(feature = "kdf-pbkdf2")]
            Self::Pbkdf2 { digest, iterations } => match digest {
                Pbkdf2Digest::Sha224 => {
                    pbkdf2::pbkdf2_hmac::<sha2::Sha224>(password, salt, iterations, &mut key)
                }
                Pbkdf2Digest::Sha256 => {
                    pbkdf2::pbkdf2_hmac::<sha2::Sha256>(password, salt, iterations, &mut key)
                }
                Pbkdf2Digest::Sha384 => {
                    pbkdf2::pbkdf2_hmac::<sha2::Sha384>(password, salt, iterations, &mut key)
                }
                Pbkdf2Digest::Sha512 => {
                    pbkdf2::pbkdf2_hmac::<sha2::Sha512>(password, salt, iterations, &mut key)
                }
            },
            #[allow(unreachable_patterns)]
            _ => {
                return Err(CredentialError::InvalidHashMethod(format!(
                    "'{}' support is not enabled",
                    self.name()
                )));
            }
        }
        Ok(key)
    }
}

fn parse_number<T: FromStr>(label: &str, raw: &str) -> Result<T, MethodParseError> {
    raw.parse()
        .map_err(|_| MethodParseError::invalid(format!("Invalid {label} '{raw}'")))
}

impl FromStr for HashMethod {
    type Err = CredentialError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse_detailed(s).map_err(|e| CredentialError::InvalidHashMethod(e.message))
    }
}

impl fmt::Display for HashMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Scrypt { n, r, p } => write!(f, "scrypt:{n}:{r}:{p}"),
            Self::Pbkdf2 { digest, iterations } => {
                write!(f, "pbkdf2:{}:{iterations}", digest.name())
            }
        }
    }
}

/// Generates a salt of `length` characters from [`SALT_CHARS`] using the
/// operating system's CSPRNG.
pub fn gen_salt(length: usize) -> Result<String, CredentialError> {
    if length == 0 {
        return Err(CredentialError::InvalidConfiguration(
            "Salt length must be at least 1.".to_string(),
        ));
    }
    Ok(OsRng
        .sample_iter(&Alphanumeric)
        .take(length)
        .map(char::from)
        .collect())
}

/// Hashes `password` into a `method$salt$digest` credential string.
///
/// # Errors
///
/// - `InvalidHashMethod` for an unknown method, wrong argument count or
///   unusable parameters
/// - `InvalidConfiguration` for a zero `salt_length`
///
/// # Example
///
/// ```rust
/// use credential_core::{check_password_hash, generate_password_hash};
///
/// let hash = generate_password_hash("hunter2", "pbkdf2:sha256:1000", 16)?;
/// assert!(hash.starts_with("pbkdf2:sha256:1000$"));
/// assert!(check_password_hash(&hash, "hunter2"));
/// # Ok::<(), credential_core::CredentialError>(())
/// ```
pub fn generate_password_hash(
    password: &str,
    method: &str,
    salt_length: usize,
) -> Result<String, CredentialError> {
    let method: HashMethod = method.parse()?;
    let salt = gen_salt(salt_length)?;
    let key = method.derive_key(password.as_bytes(), salt.as_bytes())?;
    Ok(format!("{method}${salt}${}", hex::encode(key)))
}

/// Hashes `password` with [`DEFAULT_METHOD`] and [`DEFAULT_SALT_LENGTH`].
pub fn hash_password(password: &str) -> Result<String, CredentialError> {
    generate_password_hash(password, DEFAULT_METHOD, DEFAULT_SALT_LENGTH)
}

/// Checks `password` against a stored credential string, reporting why a
/// malformed string could not be checked.
pub fn verify_password_hash(pwhash: &str, password: &str) -> HashVerification {
    let parts: Vec<&str> = pwhash.split('$').collect();
    let [method, salt, digest] = parts.as_slice() else {
        return HashVerification::Malformed(HashDiagnostic::WrongPartCount);
    };
    if salt.is_empty() {
        return HashVerification::Malformed(HashDiagnostic::EmptySalt);
    }
    let method = match HashMethod::parse_detailed(method) {
        Ok(method) => method,
        Err(e) => return HashVerification::Malformed(e.diagnostic),
    };
    let computed = match method.derive_key(password.as_bytes(), salt.as_bytes()) {
        Ok(key) => hex::encode(key),
        Err(_) => return HashVerification::Malformed(HashDiagnostic::InvalidParameters),
    };

    if digests_equal(computed.as_bytes(), digest.as_bytes()) {
        HashVerification::Match
    } else {
        HashVerification::Mismatch
    }
}

/// Checks `password` against a stored credential string.
///
/// Never fails: malformed input, unknown methods and bad parameters all yield
/// `false`. The reason is logged at `debug` level; use
/// [`verify_password_hash`] to inspect it.
pub fn check_password_hash(pwhash: &str, password: &str) -> bool {
    match verify_password_hash(pwhash, password) {
        HashVerification::Match => true,
        HashVerification::Mismatch => false,
        HashVerification::Malformed(diagnostic) => {
            tracing::debug!(?diagnostic, "Rejected malformed password hash");
            false
        }
    }
}

/// Constant-time comparison; unequal lengths never match.
fn digests_equal(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && bool::from(a.ct_eq(b))
}
