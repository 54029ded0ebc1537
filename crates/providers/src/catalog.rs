//! Model catalog client.
//!
//! The catalog is fetched from a configured URL at startup and cached
//! to disk with a TTL. On fetch failure the cached copy is used; absent
//! both, the runtime fails to start (exit code 1).

use std::path::{Path, PathBuf};
use std::time::Duration;

use hearth_domain::catalog::ModelCatalog;
use hearth_domain::error::{Error, Result};

pub const CACHE_FILE: &str = "catalog.json";

pub struct CatalogClient {
    url: String,
    cache_path: PathBuf,
    ttl: Duration,
    client: reqwest::Client,
}

impl CatalogClient {
    pub fn new(url: &str, data_dir: &Path, ttl: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .map_err(crate::from_reqwest)?;
        Ok(Self {
            url: url.to_owned(),
            cache_path: data_dir.join(CACHE_FILE),
            ttl,
            client,
        })
    }

    /// Load the catalog: fresh cache → cache; otherwise fetch, falling
    /// back to a stale cache; absent both → error.
    pub async fn load(&self) -> Result<ModelCatalog> {
        if let Some(cached) = self.read_cache(true) {
            tracing::debug!("model catalog served from fresh cache");
            return Ok(cached);
        }

        match self.fetch().await {
            Ok(catalog) => {
                self.write_cache(&catalog);
                Ok(catalog)
            }
            Err(fetch_err) => match self.read_cache(false) {
                Some(stale) => {
                    tracing::warn!(
                        error = %fetch_err,
                        "catalog fetch failed, using stale cached copy"
                    );
                    Ok(stale)
                }
                None => Err(Error::Catalog(format!(
                    "fetch failed and no cached copy exists: {fetch_err}"
                ))),
            },
        }
    }

    async fn fetch(&self) -> Result<ModelCatalog> {
        let resp = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(crate::from_reqwest)?;
        let status = resp.status();
        if !status.is_success() {
            return Err(Error::Http(format!(
                "catalog endpoint returned HTTP {}",
                status.as_u16()
            )));
        }
        let catalog: ModelCatalog = resp.json().await.map_err(crate::from_reqwest)?;
        if catalog.models.is_empty() {
            return Err(Error::Catalog("catalog document lists no models".into()));
        }
        tracing::info!(models = catalog.models.len(), "model catalog fetched");
        Ok(catalog)
    }

    fn read_cache(&self, require_fresh: bool) -> Option<ModelCatalog> {
        let metadata = std::fs::metadata(&self.cache_path).ok()?;
        if require_fresh {
            let age = metadata.modified().ok()?.elapsed().ok()?;
            if age > self.ttl {
                return None;
            }
        }
        let raw = std::fs::read_to_string(&self.cache_path).ok()?;
        serde_json::from_str(&raw).ok()
    }

    fn write_cache(&self, catalog: &ModelCatalog) {
        match serde_json::to_string_pretty(catalog) {
            Ok(json) => {
                if let Err(e) = std::fs::write(&self.cache_path, json) {
                    tracing::warn!(error = %e, "failed to write catalog cache");
                }
            }
            Err(e) => tracing::warn!(error = %e, "failed to serialize catalog cache"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hearth_domain::catalog::ModelDescriptor;

    fn catalog_json() -> String {
        let catalog = ModelCatalog {
            models: vec![ModelDescriptor {
                id: "m1".into(),
                provider: "openai".into(),
                context_length: 4000,
                tokenizer: "cl100k".into(),
                max_completion_tokens: 1000,
                max_tools_per_request: 128,
                max_parallel_tool_calls: 4,
                max_images_per_request: 20,
                pricing_input_per_million: 1.0,
                pricing_output_per_million: 2.0,
                supports_streaming: true,
                supports_tools: true,
                supports_caching: false,
                provider_overrides: Default::default(),
            }],
        };
        serde_json::to_string(&catalog).unwrap()
    }

    #[tokio::test]
    async fn fresh_cache_is_served_without_fetching() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(CACHE_FILE), catalog_json()).unwrap();

        // Unreachable URL: load must still succeed from cache.
        let client = CatalogClient::new(
            "http://127.0.0.1:1/catalog.json",
            dir.path(),
            Duration::from_secs(3600),
        )
        .unwrap();
        let catalog = client.load().await.unwrap();
        assert_eq!(catalog.models[0].id, "m1");
    }

    #[tokio::test]
    async fn stale_cache_is_fallback_after_fetch_failure() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(CACHE_FILE), catalog_json()).unwrap();

        // TTL zero: cache is stale, fetch fails, stale copy is used.
        let client = CatalogClient::new(
            "http://127.0.0.1:1/catalog.json",
            dir.path(),
            Duration::ZERO,
        )
        .unwrap();
        let catalog = client.load().await.unwrap();
        assert_eq!(catalog.models.len(), 1);
    }

    #[tokio::test]
    async fn no_cache_and_no_endpoint_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let client = CatalogClient::new(
            "http://127.0.0.1:1/catalog.json",
            dir.path(),
            Duration::from_secs(3600),
        )
        .unwrap();
        let err = client.load().await.unwrap_err();
        assert!(matches!(err, Error::Catalog(_)));
    }
}
