//! Keyring-backed secret store with a read-through cache (TTL 60 s).
//!
//! References are `"<service>/<entry>"`; writes invalidate the cached
//! value. Secret bytes never reach logs or telemetry.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use hearth_domain::error::{Error, Result};
use hearth_domain::secret::SecretStore;

const CACHE_TTL: Duration = Duration::from_secs(60);

struct CachedSecret {
    bytes: Vec<u8>,
    fetched_at: Instant,
}

pub struct KeyringSecretStore {
    service: String,
    cache: Mutex<HashMap<String, CachedSecret>>,
}

impl KeyringSecretStore {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            cache: Mutex::new(HashMap::new()),
        }
    }

    fn entry(&self, reference: &str) -> Result<keyring::Entry> {
        keyring::Entry::new(&self.service, reference)
            .map_err(|e| Error::Auth(format!("keychain entry {reference}: {e}")))
    }
}

impl SecretStore for KeyringSecretStore {
    fn get(&self, reference: &str) -> Result<Vec<u8>> {
        {
            let cache = self.cache.lock();
            if let Some(cached) = cache.get(reference) {
                if cached.fetched_at.elapsed() < CACHE_TTL {
                    return Ok(cached.bytes.clone());
                }
            }
        }

        let secret = self
            .entry(reference)?
            .get_secret()
            .map_err(|e| match e {
                keyring::Error::NoEntry => Error::NotFound(format!("secret {reference}")),
                other => Error::Auth(format!("keychain read failed: {other}")),
            })?;

        self.cache.lock().insert(
            reference.to_owned(),
            CachedSecret {
                bytes: secret.clone(),
                fetched_at: Instant::now(),
            },
        );
        Ok(secret)
    }

    fn put(&self, reference: &str, secret: &[u8]) -> Result<()> {
        self.entry(reference)?
            .set_secret(secret)
            .map_err(|e| Error::Auth(format!("keychain write failed: {e}")))?;
        self.cache.lock().remove(reference);
        Ok(())
    }

    fn delete(&self, reference: &str) -> Result<()> {
        self.entry(reference)?
            .delete_credential()
            .map_err(|e| match e {
                keyring::Error::NoEntry => Error::NotFound(format!("secret {reference}")),
                other => Error::Auth(format!("keychain delete failed: {other}")),
            })?;
        self.cache.lock().remove(reference);
        Ok(())
    }
}
