//! In-memory per-container authentication tokens
//!
//! Tokens are never persisted. After a restart they are rebuilt from the
//! environment of the live containers.

use std::collections::HashMap;

use parking_lot::RwLock;
use rand::Rng;

/// Hex characters in a generated token
pub const AUTH_KEY_LENGTH: usize = 128;

#[derive(Default)]
pub struct CredentialVault {
    keys: RwLock<HashMap<String, String>>,
}

impl CredentialVault {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fresh random token of `AUTH_KEY_LENGTH` hex characters
    pub fn generate() -> String {
        let mut rng = rand::rng();
        let bytes: Vec<u8> = (0..AUTH_KEY_LENGTH / 2).map(|_| rng.random()).collect();
        hex::encode(bytes)
    }

    pub fn bind(&self, container_id: impl Into<String>, token: impl Into<String>) {
        self.keys.write().insert(container_id.into(), token.into());
    }

    pub fn lookup(&self, container_id: &str) -> Option<String> {
        self.keys.read().get(container_id).cloned()
    }

    pub fn unbind(&self, container_id: &str) -> Option<String> {
        self.keys.write().remove(container_id)
    }

    pub fn len(&self) -> usize {
        self.keys.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.read().is_empty()
    }
}
