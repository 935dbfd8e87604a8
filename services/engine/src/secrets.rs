//! Secrets held outside deployment records.
//!
//! Provider credentials and the passwords generated for platform resources
//! are stored here and referenced from records by [`SecretId`] only.

use std::collections::BTreeMap;

use async_trait::async_trait;
use hyde_id::SecretId;
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::db::DbError;

const USERNAME_KEY: &str = "username";
const PASSWORD_KEY: &str = "password";

const LETTERS: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";
const DIGITS: &[u8] = b"0123456789";
const SYMBOLS: &[u8] = b"~!@#$%^&*()_+-={}[]:<>?,.";

/// Opaque credential bundle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Secret {
    #[serde(default)]
    pub description: Option<String>,
    pub data: BTreeMap<String, String>,
}

impl Secret {
    pub fn new(data: BTreeMap<String, String>) -> Self {
        Self {
            description: None,
            data,
        }
    }

    pub fn basic_auth(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self::new(BTreeMap::from([
            (USERNAME_KEY.to_string(), username.into()),
            (PASSWORD_KEY.to_string(), password.into()),
        ]))
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.data.get(key).map(String::as_str)
    }

    /// Username and password, if this secret holds basic credentials.
    pub fn as_basic_auth(&self) -> Option<(&str, &str)> {
        Some((self.get(USERNAME_KEY)?, self.get(PASSWORD_KEY)?))
    }
}

/// Secret store.
#[async_trait]
pub trait Vault: Send + Sync {
    /// Stores a new secret and returns its generated id.
    async fn add_secret(&self, secret: &Secret) -> Result<SecretId, DbError>;

    async fn get_secret(&self, id: &SecretId) -> Result<Secret, DbError>;

    async fn update_secret(&self, id: &SecretId, secret: &Secret) -> Result<(), DbError>;

    async fn delete_secret(&self, id: &SecretId) -> Result<(), DbError>;
}

/// Random password of `len` characters with at least `digits` digits and
/// `symbols` symbols.
pub fn generate_password(len: usize, digits: usize, symbols: usize) -> String {
    let mut rng = rand::rng();
    let letters = len.saturating_sub(digits + symbols);

    let mut pick = |set: &[u8], count: usize| -> Vec<u8> {
        (0..count)
            .map(|_| set[rng.random_range(0..set.len())])
            .collect()
    };

    let mut chars = pick(LETTERS, letters);
    chars.extend(pick(DIGITS, digits));
    chars.extend(pick(SYMBOLS, symbols));
    chars.shuffle(&mut rand::rng());

    chars.into_iter().map(char::from).collect()
}

/// Administrative password for a fresh compute node.
pub fn node_password() -> String {
    generate_password(10, 3, 2)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_password_composition() {
        for _ in 0..50 {
            let password = generate_password(10, 3, 2);
            assert_eq!(password.len(), 10);
            assert!(password.chars().filter(char::is_ascii_digit).count() >= 3);
            assert!(password.bytes().filter(|b| SYMBOLS.contains(b)).count() >= 2);
        }
    }

    #[test]
    fn test_basic_auth_roundtrip() {
        let secret = Secret::basic_auth("admin", "s3cret");
        assert_eq!(secret.as_basic_auth(), Some(("admin", "s3cret")));
        assert_eq!(Secret::default().as_basic_auth(), None);
    }
}
