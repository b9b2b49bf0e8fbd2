//! Password-based key derivation.
//!
//! Two algorithms are supported. PBKDF2-HMAC-SHA256 is the default for new
//! vaults; Argon2id is a memory-hard alternative that resists GPU and
//! time-memory trade-off attacks. Whichever is chosen at `init` is frozen in
//! the manifest together with its cost parameters, so a later change of the
//! defaults never desynchronizes an existing vault.

use argon2::{Algorithm, Argon2, Params, Version};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::keys::{MasterKey, Salt, VerificationToken, KEY_LENGTH};
use casevault_common::{Error, Result};

/// Lowest PBKDF2 iteration count accepted for a new vault.
pub const MIN_PBKDF2_ITERATIONS: u32 = 480_000;

/// Parameters for key derivation, persisted with the vault.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "algorithm")]
pub enum KdfParams {
    /// PBKDF2 with HMAC-SHA256.
    #[serde(rename = "pbkdf2-hmac-sha256")]
    Pbkdf2Sha256 {
        /// Number of iterations.
        iterations: u32,
    },
    /// Argon2id, version 0x13.
    #[serde(rename = "argon2id")]
    Argon2id {
        /// Memory cost in KiB (e.g., 65536 = 64 MiB).
        memory_cost: u32,
        /// Number of iterations.
        time_cost: u32,
        /// Degree of parallelism.
        parallelism: u32,
    },
}

impl KdfParams {
    /// PBKDF2-HMAC-SHA256 with the given iteration count.
    pub fn pbkdf2(iterations: u32) -> Self {
        Self::Pbkdf2Sha256 { iterations }
    }

    /// Argon2id with explicit costs.
    pub fn argon2id(memory_cost: u32, time_cost: u32, parallelism: u32) -> Self {
        Self::Argon2id {
            memory_cost,
            time_cost,
            parallelism,
        }
    }

    /// Argon2id parameters suitable for interactive use.
    ///
    /// Targets approximately 0.5-1 second of derivation time.
    pub fn interactive() -> Self {
        Self::argon2id(65536, 3, 4)
    }

    /// Stable algorithm identifier, as stored in the manifest.
    pub fn algorithm_id(&self) -> &'static str {
        match self {
            Self::Pbkdf2Sha256 { .. } => "pbkdf2-hmac-sha256",
            Self::Argon2id { .. } => "argon2id",
        }
    }

    /// Iteration count (PBKDF2 rounds or Argon2 passes).
    pub fn iterations(&self) -> u32 {
        match self {
            Self::Pbkdf2Sha256 { iterations } => *iterations,
            Self::Argon2id { time_cost, .. } => *time_cost,
        }
    }

    /// Check the parameters are acceptable for a new vault.
    ///
    /// # Errors
    /// - PBKDF2 below MIN_PBKDF2_ITERATIONS
    /// - Argon2id costs rejected by the Argon2 implementation
    pub fn validate(&self) -> Result<()> {
        match self {
            Self::Pbkdf2Sha256 { iterations } => {
                if *iterations < MIN_PBKDF2_ITERATIONS {
                    return Err(Error::InvalidInput(format!(
                        "PBKDF2 iterations must be at least {}, got {}",
                        MIN_PBKDF2_ITERATIONS, iterations
                    )));
                }
                Ok(())
            }
            Self::Argon2id { .. } => self.argon2_params().map(|_| ()),
        }
    }

    fn argon2_params(&self) -> Result<Params> {
        match self {
            Self::Argon2id {
                memory_cost,
                time_cost,
                parallelism,
            } => Params::new(*memory_cost, *time_cost, *parallelism, Some(KEY_LENGTH))
                .map_err(|e| Error::Crypto(format!("Invalid KDF parameters: {}", e))),
            Self::Pbkdf2Sha256 { .. } => Err(Error::Crypto(
                "Not an Argon2id parameter set".to_string(),
            )),
        }
    }
}

impl Default for KdfParams {
    fn default() -> Self {
        Self::pbkdf2(MIN_PBKDF2_ITERATIONS)
    }
}

/// Derive a master key from a password and salt.
///
/// # Postconditions
/// - The derived key is deterministic given the same inputs
///
/// # Errors
/// - Returns error if password is empty
/// - Returns error if the parameters are invalid
///
/// # Security
/// - Password is not stored or logged
/// - Intermediate key bytes are zeroized
pub fn derive_key(password: &[u8], salt: &Salt, params: &KdfParams) -> Result<MasterKey> {
    use zeroize::Zeroize;

    if password.is_empty() {
        return Err(Error::InvalidInput("Password cannot be empty".to_string()));
    }

    let mut key_bytes = [0u8; KEY_LENGTH];
    match params {
        KdfParams::Pbkdf2Sha256 { iterations } => {
            if *iterations == 0 {
                return Err(Error::Crypto(
                    "Invalid KDF parameters: zero iterations".to_string(),
                ));
            }
            pbkdf2::pbkdf2_hmac::<Sha256>(password, salt.as_bytes(), *iterations, &mut key_bytes);
        }
        KdfParams::Argon2id { .. } => {
            let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params.argon2_params()?);
            argon2
                .hash_password_into(password, salt.as_bytes(), &mut key_bytes)
                .map_err(|e| Error::Crypto(format!("Key derivation failed: {}", e)))?;
        }
    }

    let key = MasterKey::from_bytes(key_bytes);
    key_bytes.zeroize();
    Ok(key)
}

/// Derive the key for `password` and accept it only if it reproduces `expected`.
///
/// The comparison runs in constant time. No content is touched, so a wrong
/// password is rejected before any ciphertext is read.
///
/// # Errors
/// - `Error::Authentication` when the token does not match
pub fn unlock_key(
    password: &[u8],
    salt: &Salt,
    params: &KdfParams,
    expected: &VerificationToken,
) -> Result<MasterKey> {
    let derived = derive_key(password, salt, params)?;
    if derived.verification_token().matches(expected) {
        Ok(derived)
    } else {
        Err(Error::Authentication)
    }
}
