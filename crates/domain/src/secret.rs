//! Secret store capability.
//!
//! The core never stores secret bytes: entities hold references, and
//! resolution goes through this trait. The gateway wires a
//! keyring-backed implementation; tests use an in-memory map.

use parking_lot::Mutex;
use std::collections::HashMap;

use crate::error::Result;

pub trait SecretStore: Send + Sync {
    fn get(&self, reference: &str) -> Result<Vec<u8>>;
    fn put(&self, reference: &str, secret: &[u8]) -> Result<()>;
    fn delete(&self, reference: &str) -> Result<()>;
}

/// In-memory secret store for tests and ephemeral setups.
#[derive(Default)]
pub struct MemorySecretStore {
    entries: Mutex<HashMap<String, Vec<u8>>>,
}

impl SecretStore for MemorySecretStore {
    fn get(&self, reference: &str) -> Result<Vec<u8>> {
        self.entries
            .lock()
            .get(reference)
            .cloned()
            .ok_or_else(|| crate::Error::NotFound(format!("secret {reference}")))
    }

    fn put(&self, reference: &str, secret: &[u8]) -> Result<()> {
        self.entries
            .lock()
            .insert(reference.to_owned(), secret.to_vec());
        Ok(())
    }

    fn delete(&self, reference: &str) -> Result<()> {
        self.entries.lock().remove(reference);
        Ok(())
    }
}
