use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use futures::future::BoxFuture;
use serde_json::Value;
use tracing::warn;

use strand_core::error::{Result, StrandError};
use strand_core::plugin::{
    HookAction, HookContext, HookPoint, Plugin, PluginConfig, PluginMetadata,
};

struct RateLimitEntry {
    count: u32,
    reset_at: DateTime<Utc>,
    burst_count: u32,
    burst_reset_at: DateTime<Utc>,
}

/// Per-caller, per-agent rate limiter over `before_agent_execute`. Tracks a
/// rolling hourly window plus a 60-second burst window; exceeding either
/// rejects the call, which fails the agent step.
///
/// The caller identity comes from the execution metadata key `caller` and
/// defaults to `anonymous`.
pub struct RateLimitPlugin {
    metadata: PluginMetadata,
    config: PluginConfig,
    max_per_hour: u32,
    max_per_minute: u32,
    entries: Mutex<HashMap<String, RateLimitEntry>>,
}

impl RateLimitPlugin {
    pub fn new(max_per_hour: u32, max_per_minute: u32) -> Self {
        Self {
            metadata: PluginMetadata::new("rate-limit", "0.1.0")
                .with_description("Limits agent calls per caller per agent"),
            config: PluginConfig::default(),
            max_per_hour,
            max_per_minute,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_config(mut self, config: PluginConfig) -> Self {
        self.config = config;
        self
    }

    /// Record one call against `key` at time `now`. Returns the veto error
    /// when a window is exhausted; the call that overflows is the one
    /// rejected.
    fn check(&self, key: &str, now: DateTime<Utc>) -> Option<StrandError> {
        let mut entries = self.entries.lock().unwrap();
        let entry = entries.entry(key.to_string()).or_insert(RateLimitEntry {
            count: 0,
            reset_at: now + Duration::hours(1),
            burst_count: 0,
            burst_reset_at: now + Duration::seconds(60),
        });

        if now >= entry.reset_at {
            entry.count = 0;
            entry.reset_at = now + Duration::hours(1);
        }
        if now >= entry.burst_reset_at {
            entry.burst_count = 0;
            entry.burst_reset_at = now + Duration::seconds(60);
        }

        entry.count += 1;
        entry.burst_count += 1;

        if entry.burst_count > self.max_per_minute {
            return Some(StrandError::RateLimited {
                key: key.to_string(),
                message: format!(
                    "burst limit of {} calls per minute exceeded",
                    self.max_per_minute
                ),
            });
        }
        if entry.count > self.max_per_hour {
            return Some(StrandError::RateLimited {
                key: key.to_string(),
                message: format!("limit of {} calls per hour exceeded", self.max_per_hour),
            });
        }
        None
    }
}

impl Default for RateLimitPlugin {
    fn default() -> Self {
        Self::new(1000, 60)
    }
}

impl Plugin for RateLimitPlugin {
    fn metadata(&self) -> &PluginMetadata {
        &self.metadata
    }

    fn config(&self) -> &PluginConfig {
        &self.config
    }

    fn hooks(&self) -> Vec<HookPoint> {
        vec![HookPoint::BeforeAgentExecute]
    }

    fn cleanup(&self) -> Result<()> {
        self.entries.lock().unwrap().clear();
        Ok(())
    }

    fn on_hook(
        &self,
        _hook: HookPoint,
        payload: Value,
        ctx: HookContext,
    ) -> BoxFuture<'_, Result<HookAction>> {
        Box::pin(async move {
            let agent_id = payload
                .get("agent_id")
                .and_then(Value::as_str)
                .unwrap_or("unknown");
            let caller = match &ctx.execution {
                Some(execution) => execution
                    .metadata("caller")
                    .await
                    .and_then(|v| v.as_str().map(str::to_string))
                    .unwrap_or_else(|| "anonymous".to_string()),
                None => "anonymous".to_string(),
            };
            let key = format!("{agent_id}:{caller}");

            match self.check(&key, Utc::now()) {
                Some(e) => {
                    warn!(key = %key, "Rate limit exceeded");
                    Ok(HookAction::Reject(e))
                }
                None => Ok(HookAction::Continue(payload)),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    async fn call(plugin: &RateLimitPlugin, agent_id: &str) -> Result<HookAction> {
        plugin
            .on_hook(
                HookPoint::BeforeAgentExecute,
                json!({"agent_id": agent_id, "prompt": "x"}),
                HookContext::default(),
            )
            .await
    }

    #[tokio::test]
    async fn test_allows_up_to_burst_limit() {
        let plugin = RateLimitPlugin::new(100, 3);
        for _ in 0..3 {
            assert!(matches!(
                call(&plugin, "a").await.unwrap(),
                HookAction::Continue(_)
            ));
        }
        match call(&plugin, "a").await.unwrap() {
            HookAction::Reject(StrandError::RateLimited { key, message }) => {
                assert_eq!(key, "a:anonymous");
                assert!(message.contains("per minute"));
            }
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_limits_are_per_agent() {
        let plugin = RateLimitPlugin::new(100, 1);
        assert!(matches!(
            call(&plugin, "a").await.unwrap(),
            HookAction::Continue(_)
        ));
        // A different agent has its own window.
        assert!(matches!(
            call(&plugin, "b").await.unwrap(),
            HookAction::Continue(_)
        ));
        assert!(matches!(
            call(&plugin, "a").await.unwrap(),
            HookAction::Reject(_)
        ));
    }

    #[tokio::test]
    async fn test_hourly_limit_rejects_past_bursts() {
        // Burst window wide open; hourly cap is the binding one.
        let plugin = RateLimitPlugin::new(2, 100);
        for _ in 0..2 {
            assert!(matches!(
                call(&plugin, "a").await.unwrap(),
                HookAction::Continue(_)
            ));
        }
        match call(&plugin, "a").await.unwrap() {
            HookAction::Reject(StrandError::RateLimited { message, .. }) => {
                assert!(message.contains("per hour"));
            }
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[test]
    fn test_burst_window_rolls_over() {
        let plugin = RateLimitPlugin::new(100, 3);
        let start = Utc::now();
        for _ in 0..3 {
            assert!(plugin.check("a:anonymous", start).is_none());
        }
        assert!(plugin.check("a:anonymous", start).is_some());

        // The next minute window admits again.
        let next_window = start + Duration::seconds(61);
        assert!(plugin.check("a:anonymous", next_window).is_none());
    }

    #[test]
    fn test_hourly_window_rolls_over() {
        let plugin = RateLimitPlugin::new(2, 100);
        let start = Utc::now();
        assert!(plugin.check("k", start).is_none());
        assert!(plugin.check("k", start).is_none());
        assert!(plugin.check("k", start).is_some());

        let next_hour = start + Duration::hours(1) + Duration::seconds(1);
        assert!(plugin.check("k", next_hour).is_none());
    }

    #[tokio::test]
    async fn test_cleanup_resets_windows() {
        let plugin = RateLimitPlugin::new(100, 1);
        call(&plugin, "a").await.unwrap();
        assert!(matches!(
            call(&plugin, "a").await.unwrap(),
            HookAction::Reject(_)
        ));
        plugin.cleanup().unwrap();
        assert!(matches!(
            call(&plugin, "a").await.unwrap(),
            HookAction::Continue(_)
        ));
    }
}
