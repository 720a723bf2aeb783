//! Credential hashing primitives.

pub mod password;

pub use password::{Argon2Hasher, HashError, PasswordHasher};
