//! Tool dispatch: routing, per-provider concurrency, timeouts, and
//! execution heartbeats.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Semaphore;

use hearth_domain::error::{Error, Result};

use crate::registry::ToolRegistry;
use crate::ToolOutput;

/// Heartbeat cadence for long-running calls.
const HEARTBEAT_EVERY: Duration = Duration::from_secs(2);

pub struct Dispatcher {
    registry: Arc<ToolRegistry>,
    /// Per-provider concurrency gates.
    semaphores: Mutex<HashMap<String, Arc<Semaphore>>>,
    per_provider_limit: usize,
    default_timeout: Duration,
}

impl Dispatcher {
    pub fn new(registry: Arc<ToolRegistry>, per_provider_limit: usize, default_timeout: Duration) -> Self {
        Self {
            registry,
            semaphores: Mutex::new(HashMap::new()),
            per_provider_limit: per_provider_limit.max(1),
            default_timeout,
        }
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    fn semaphore_for(&self, provider: &str) -> Arc<Semaphore> {
        self.semaphores
            .lock()
            .entry(provider.to_owned())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_provider_limit)))
            .clone()
    }

    /// Execute an approved tool call to terminal output.
    ///
    /// `heartbeat` fires every 2 s while the call runs (the caller
    /// publishes `tool.executing` from it). On timeout the call fails
    /// with reason `timeout`; a stdio provider's late response is
    /// discarded by its reader.
    pub async fn dispatch(
        &self,
        tool_name: &str,
        arguments: &serde_json::Value,
        heartbeat: impl Fn() + Send + Sync,
    ) -> Result<ToolOutput> {
        let (provider, _definition) = self
            .registry
            .lookup(tool_name)
            .ok_or_else(|| Error::NotFound(format!("tool {tool_name}")))?;

        let semaphore = self.semaphore_for(provider.name());
        let _permit = semaphore
            .acquire()
            .await
            .map_err(|_| Error::Other("dispatcher shutting down".into()))?;

        let call = provider.call(tool_name, arguments);
        tokio::pin!(call);

        let mut ticker = tokio::time::interval(HEARTBEAT_EVERY);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ticker.tick().await; // first tick is immediate; skip it

        let deadline = tokio::time::sleep(self.default_timeout);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                result = &mut call => return result,
                _ = ticker.tick() => heartbeat(),
                _ = &mut deadline => {
                    return Err(Error::Timeout(format!(
                        "tool {tool_name} exceeded {}s",
                        self.default_timeout.as_secs()
                    )));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builtin::BuiltinProvider;
    use crate::ToolProvider;
    use hearth_domain::tool::{ToolCapability, ToolDefinition};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn slow_provider(delay: Duration) -> BuiltinProvider {
        let mut provider = BuiltinProvider::new("slow");
        provider.register(
            ToolDefinition {
                name: "slow.sleep".into(),
                description: "sleeps".into(),
                parameters: serde_json::json!({"type": "object"}),
                capability: ToolCapability::ReadOnly,
                critical: false,
            },
            move |_args| async move {
                tokio::time::sleep(delay).await;
                Ok(ToolOutput::ok("done"))
            },
        );
        provider
    }

    async fn dispatcher(provider: BuiltinProvider, timeout: Duration) -> Dispatcher {
        let registry = Arc::new(ToolRegistry::new(vec![Arc::new(provider)]));
        registry.refresh_all().await;
        Dispatcher::new(registry, 4, timeout)
    }

    #[tokio::test]
    async fn dispatch_returns_output() {
        let d = dispatcher(slow_provider(Duration::from_millis(1)), Duration::from_secs(5)).await;
        let output = d
            .dispatch("slow.sleep", &serde_json::json!({}), || {})
            .await
            .unwrap();
        assert_eq!(output.content, "done");
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_fails_the_call() {
        let d = dispatcher(slow_provider(Duration::from_secs(120)), Duration::from_secs(60)).await;
        let err = d
            .dispatch("slow.sleep", &serde_json::json!({}), || {})
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeats_fire_while_running() {
        let d = dispatcher(slow_provider(Duration::from_secs(7)), Duration::from_secs(60)).await;
        let beats = AtomicU32::new(0);
        d.dispatch("slow.sleep", &serde_json::json!({}), || {
            beats.fetch_add(1, Ordering::SeqCst);
        })
        .await
        .unwrap();
        // ~7 s run with a 2 s cadence → 3 beats.
        assert!(beats.load(Ordering::SeqCst) >= 3);
    }

    #[tokio::test]
    async fn unknown_tool_is_not_found() {
        let d = dispatcher(slow_provider(Duration::from_millis(1)), Duration::from_secs(5)).await;
        assert!(matches!(
            d.dispatch("nope", &serde_json::json!({}), || {}).await,
            Err(Error::NotFound(_))
        ));
    }
}
