//! PIN custody: hashing and verification of 4-digit wallet PINs.
//!
//! A PIN has only 10,000 possible values, so the cost of the hash is the only
//! thing standing between a leaked credential table and every PIN in it.
//! Credentials are Argon2id PHC strings with a fresh OS-random salt per hash.

use crate::config::PinConfig;
use crate::error::{Result, WalletError};
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::{Algorithm, Argon2, Params, Version};
use rand_core::OsRng;

/// Number of digits in a wallet PIN.
pub const PIN_LENGTH: usize = 4;

/// Hash, verify and upgrade-check wallet PIN credentials.
pub trait PinCustody: Send + Sync {
    /// Hash a PIN into a storage-safe credential.
    fn hash(&self, pin: &str) -> Result<String>;

    /// Check a candidate PIN against a stored credential.
    ///
    /// Never fails: malformed input of either kind is simply `false`.
    fn verify(&self, candidate: &str, credential: &str) -> bool;

    /// True when `credential` was produced with weaker parameters than the
    /// ones currently configured.
    fn needs_upgrade(&self, credential: &str) -> bool;
}

/// Reject anything that is not exactly four ASCII digits.
pub fn validate_pin_format(pin: &str) -> Result<()> {
    if pin.len() == PIN_LENGTH && pin.bytes().all(|b| b.is_ascii_digit()) {
        Ok(())
    } else {
        Err(WalletError::InvalidPinFormat)
    }
}

/// Argon2id-backed [`PinCustody`].
#[derive(Clone)]
pub struct Argon2Custody {
    params: Params,
}

impl Argon2Custody {
    pub fn new(config: &PinConfig) -> Result<Self> {
        let params = Params::new(config.memory_kib, config.iterations, config.parallelism, None)
            .map_err(|e| WalletError::StorageFailure(format!("Invalid Argon2 parameters: {}", e)))?;
        Ok(Self { params })
    }

    fn hasher(&self) -> Argon2<'static> {
        Argon2::new(Algorithm::Argon2id, Version::V0x13, self.params.clone())
    }

    pub fn params(&self) -> &Params {
        &self.params
    }
}

impl std::fmt::Debug for Argon2Custody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Argon2Custody")
            .field("m_cost", &self.params.m_cost())
            .field("t_cost", &self.params.t_cost())
            .field("p_cost", &self.params.p_cost())
            .finish()
    }
}

impl PinCustody for Argon2Custody {
    fn hash(&self, pin: &str) -> Result<String> {
        validate_pin_format(pin)?;

        let salt = SaltString::generate(&mut OsRng);
        let hash = self
            .hasher()
            .hash_password(pin.as_bytes(), &salt)
            .map_err(|e| WalletError::StorageFailure(format!("Failed to hash PIN: {}", e)))?;

        Ok(hash.to_string())
    }

    fn verify(&self, candidate: &str, credential: &str) -> bool {
        if validate_pin_format(candidate).is_err() {
            return false;
        }
        let parsed = match PasswordHash::new(credential) {
            Ok(parsed) => parsed,
            Err(_) => return false,
        };
        // Cost parameters come from the credential itself, so hashes made
        // under older settings still verify.
        self.hasher()
            .verify_password(candidate.as_bytes(), &parsed)
            .is_ok()
    }

    fn needs_upgrade(&self, credential: &str) -> bool {
        let parsed = match PasswordHash::new(credential) {
            Ok(parsed) => parsed,
            Err(_) => return true,
        };

        if parsed.algorithm != Algorithm::Argon2id.ident() {
            return true;
        }
        if parsed.version != Some(Version::V0x13.into()) {
            return true;
        }

        match Params::try_from(&parsed) {
            Ok(stored) => {
                stored.m_cost() < self.params.m_cost()
                    || stored.t_cost() < self.params.t_cost()
                    || stored.p_cost() < self.params.p_cost()
            }
            Err(_) => true,
        }
    }
}
