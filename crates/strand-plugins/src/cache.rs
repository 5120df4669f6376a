use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use futures::future::BoxFuture;
use serde_json::Value;
use tracing::debug;

use strand_core::error::Result;
use strand_core::plugin::{
    HookAction, HookContext, HookPoint, Plugin, PluginConfig, PluginMetadata,
};

struct CacheEntry {
    response: String,
    cached_at: DateTime<Utc>,
}

/// Response cache keyed by agent id and prompt. A hit short-circuits the
/// model call by tagging the `before_agent_execute` payload with `cached`.
pub struct CachePlugin {
    metadata: PluginMetadata,
    config: PluginConfig,
    ttl: Duration,
    max_entries: usize,
    entries: Mutex<HashMap<String, CacheEntry>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl CachePlugin {
    pub fn new(ttl: std::time::Duration, max_entries: usize) -> Self {
        Self {
            metadata: PluginMetadata::new("cache", "0.1.0")
                .with_description("Caches agent responses by agent id and prompt"),
            config: PluginConfig::default(),
            ttl: Duration::from_std(ttl).unwrap_or(Duration::zero()),
            max_entries,
            entries: Mutex::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn with_config(mut self, config: PluginConfig) -> Self {
        self.config = config;
        self
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    fn key(agent_id: &str, prompt: &str) -> String {
        format!("{agent_id}:{prompt}")
    }

    fn lookup(&self, key: &str) -> Option<String> {
        let mut entries = self.entries.lock().unwrap();
        match entries.get(key) {
            Some(entry) if Utc::now() - entry.cached_at < self.ttl => {
                Some(entry.response.clone())
            }
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    fn store(&self, key: String, response: String) {
        let mut entries = self.entries.lock().unwrap();
        entries.insert(
            key,
            CacheEntry {
                response,
                cached_at: Utc::now(),
            },
        );
        // Oldest-first eviction once over capacity.
        while entries.len() > self.max_entries {
            let oldest = entries
                .iter()
                .min_by_key(|(_, e)| e.cached_at)
                .map(|(k, _)| k.clone());
            match oldest {
                Some(k) => entries.remove(&k),
                None => break,
            };
        }
    }
}

impl Default for CachePlugin {
    fn default() -> Self {
        Self::new(std::time::Duration::from_secs(300), 1000)
    }
}

impl Plugin for CachePlugin {
    fn metadata(&self) -> &PluginMetadata {
        &self.metadata
    }

    fn config(&self) -> &PluginConfig {
        &self.config
    }

    fn hooks(&self) -> Vec<HookPoint> {
        vec![HookPoint::BeforeAgentExecute, HookPoint::AfterAgentExecute]
    }

    fn cleanup(&self) -> Result<()> {
        self.entries.lock().unwrap().clear();
        Ok(())
    }

    fn on_hook(
        &self,
        hook: HookPoint,
        mut payload: Value,
        _ctx: HookContext,
    ) -> BoxFuture<'_, Result<HookAction>> {
        Box::pin(async move {
            let agent_id = payload.get("agent_id").and_then(Value::as_str);
            let prompt = payload.get("prompt").and_then(Value::as_str);
            let (Some(agent_id), Some(prompt)) = (agent_id, prompt) else {
                return Ok(HookAction::Continue(payload));
            };
            let key = Self::key(agent_id, prompt);

            match hook {
                HookPoint::BeforeAgentExecute => {
                    if let Some(response) = self.lookup(&key) {
                        self.hits.fetch_add(1, Ordering::Relaxed);
                        debug!(agent_id, "Cache hit");
                        payload["cached"] = Value::String(response);
                    } else {
                        self.misses.fetch_add(1, Ordering::Relaxed);
                    }
                }
                HookPoint::AfterAgentExecute => {
                    if let Some(response) = payload.get("response").and_then(Value::as_str) {
                        self.store(key, response.to_string());
                    }
                }
                _ => {}
            }
            Ok(HookAction::Continue(payload))
        })
    }
}
