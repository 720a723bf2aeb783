//! One-way salted password hashing with Argon2id.
//!
//! Hashes are stored in the PHC string format, e.g.
//! `$argon2id$v=19$m=65536,t=3,p=2$<salt>$<key>`, so the algorithm, version,
//! tuning parameters, salt, and derived key all travel with the stored value.
//! Verification re-derives with the embedded parameters, which keeps old hashes
//! verifiable after the defaults change.

use argon2::{
    password_hash::{self, PasswordHash, SaltString},
    Algorithm, Argon2, Params, PasswordHasher as _, PasswordVerifier as _, Version,
    ARGON2ID_IDENT,
};
use rand::{rngs::OsRng, RngCore};
use thiserror::Error;

/// Memory cost in KiB (64 MiB).
pub const MEMORY_COST_KIB: u32 = 64 * 1024;
pub const ITERATIONS: u32 = 3;
pub const PARALLELISM: u32 = 2;
pub const SALT_LEN: usize = 16;
pub const KEY_LEN: usize = 32;

#[derive(Debug, Error)]
pub enum HashError {
    #[error("invalid password hash format: {0}")]
    Parse(String),
    #[error("invalid argon2 parameters: {0}")]
    Params(String),
    #[error("failed to generate salt")]
    Salt,
    #[error("failed to hash password: {0}")]
    Hash(String),
}

/// Password hashing capability consumed by the auth engine.
pub trait PasswordHasher: Send + Sync + 'static {
    /// Hash a password with a fresh random salt.
    ///
    /// # Errors
    /// Returns an error if salt generation or key derivation fails.
    fn hash(&self, password: &str) -> Result<String, HashError>;

    /// Check a password against an encoded hash.
    ///
    /// Returns `Ok(false)` on mismatch.
    ///
    /// # Errors
    /// Returns [`HashError::Parse`] when `encoded` is not an Argon2id PHC string.
    fn verify(&self, password: &str, encoded: &str) -> Result<bool, HashError>;
}

#[derive(Clone)]
pub struct Argon2Hasher {
    params: Params,
}

impl Argon2Hasher {
    /// Hasher with the production cost parameters.
    ///
    /// # Errors
    /// Never fails with the built-in constants; the `Result` mirrors [`Self::with_params`].
    pub fn new() -> Result<Self, HashError> {
        Self::with_params(MEMORY_COST_KIB, ITERATIONS, PARALLELISM)
    }

    /// Hasher with custom cost parameters. Verification always uses the
    /// parameters embedded in the stored hash, not these.
    ///
    /// # Errors
    /// Returns an error if argon2 rejects the parameters.
    pub fn with_params(memory_kib: u32, iterations: u32, parallelism: u32) -> Result<Self, HashError> {
        let params = Params::new(memory_kib, iterations, parallelism, Some(KEY_LEN))
            .map_err(|err| HashError::Params(err.to_string()))?;
        Ok(Self { params })
    }

    fn argon2(&self) -> Argon2<'static> {
        Argon2::new(Algorithm::Argon2id, Version::V0x13, self.params.clone())
    }
}

impl std::fmt::Debug for Argon2Hasher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Argon2Hasher")
            .field("m_cost", &self.params.m_cost())
            .field("t_cost", &self.params.t_cost())
            .field("p_cost", &self.params.p_cost())
            .finish()
    }
}

impl PasswordHasher for Argon2Hasher {
    fn hash(&self, password: &str) -> Result<String, HashError> {
        let mut salt = [0u8; SALT_LEN];
        OsRng.try_fill_bytes(&mut salt).map_err(|_| HashError::Salt)?;
        let salt = SaltString::encode_b64(&salt).map_err(|_| HashError::Salt)?;

        let hash = self
            .argon2()
            .hash_password(password.as_bytes(), &salt)
            .map_err(|err| HashError::Hash(err.to_string()))?;

        Ok(hash.to_string())
    }

    fn verify(&self, password: &str, encoded: &str) -> Result<bool, HashError> {
        let parsed = PasswordHash::new(encoded).map_err(|err| HashError::Parse(err.to_string()))?;

        if parsed.algorithm != ARGON2ID_IDENT {
            return Err(HashError::Parse(format!(
                "unsupported algorithm: {}",
                parsed.algorithm
            )));
        }
        if parsed.salt.is_none() || parsed.hash.is_none() {
            return Err(HashError::Parse("missing salt or key".to_string()));
        }

        // `verify_password` derives with the parameters embedded in `parsed`
        // and compares outputs in constant time.
        match Argon2::default().verify_password(password.as_bytes(), &parsed) {
            Ok(()) => Ok(true),
            Err(password_hash::Error::Password) => Ok(false),
            Err(err @ (password_hash::Error::ParamValueInvalid(_)
            | password_hash::Error::ParamNameInvalid
            | password_hash::Error::ParamsMaxExceeded
            | password_hash::Error::Version
            | password_hash::Error::OutputSize { .. })) => Err(HashError::Parse(err.to_string())),
            Err(err) => Err(HashError::Hash(err.to_string())),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    // Cheap parameters keep the suite fast; production parameters are covered once below.
    fn fast_hasher() -> Argon2Hasher {
        Argon2Hasher::with_params(8 * 1024, 1, 1).unwrap()
    }

    #[test]
    fn hash_then_verify() {
        let hasher = Argon2Hasher::new().unwrap();
        let encoded = hasher.hash("pw123").unwrap();

        assert!(encoded.starts_with("$argon2id$v=19$m=65536,t=3,p=2$"));
        assert!(hasher.verify("pw123", &encoded).unwrap());
        assert!(!hasher.verify("pw124", &encoded).unwrap());
    }

    #[test]
    fn encoded_hash_carries_salt_and_key() {
        let encoded = fast_hasher().hash("secret").unwrap();
        let parsed = PasswordHash::new(&encoded).unwrap();

        let mut salt = [0u8; 64];
        let salt = parsed.salt.unwrap().decode_b64(&mut salt).unwrap();
        assert_eq!(salt.len(), SALT_LEN);
        assert_eq!(parsed.hash.unwrap().len(), KEY_LEN);
    }

    #[test]
    fn same_password_gets_distinct_salts() {
        let hasher = fast_hasher();
        let first = hasher.hash("same password").unwrap();
        let second = hasher.hash("same password").unwrap();

        assert_ne!(first, second);
        assert!(hasher.verify("same password", &first).unwrap());
        assert!(hasher.verify("same password", &second).unwrap());
    }

    #[test]
    fn verify_uses_embedded_parameters() {
        let encoded = fast_hasher().hash("portable").unwrap();

        // A hasher configured with different costs still verifies the stored hash.
        let other = Argon2Hasher::with_params(16 * 1024, 2, 1).unwrap();
        assert!(other.verify("portable", &encoded).unwrap());
        assert!(!other.verify("Portable", &encoded).unwrap());
    }

    #[test]
    fn empty_password_round_trips() {
        let hasher = fast_hasher();
        let encoded = hasher.hash("").unwrap();
        assert!(hasher.verify("", &encoded).unwrap());
        assert!(!hasher.verify(" ", &encoded).unwrap());
    }

    #[test]
    fn malformed_hash_is_parse_error() {
        let hasher = fast_hasher();

        for encoded in [
            "",
            "plaintext",
            "$argon2id$v=19$m=65536,t=3,p=2",
            "$argon2id$v=19$m=65536,t=3,p=2$!!!$!!!",
        ] {
            let result = hasher.verify("pw", encoded);
            assert!(matches!(result, Err(HashError::Parse(_))), "{encoded:?}");
        }
    }

    #[test]
    fn other_algorithms_are_rejected() {
        let encoded = fast_hasher().hash("pw").unwrap().replacen("argon2id", "argon2i", 1);
        assert!(matches!(
            fast_hasher().verify("pw", &encoded),
            Err(HashError::Parse(_))
        ));
    }

    #[test]
    fn debug_does_not_leak_anything_but_costs() {
        let rendered = format!("{:?}", fast_hasher());
        assert!(rendered.contains("m_cost"));
    }
}
