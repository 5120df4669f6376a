use std::sync::Arc;

use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use strand_core::error::Result;
use strand_core::plugin::{HookAction, HookContext, HookPoint, Plugin};

/// The unified ordered-interceptor pipeline.
///
/// Plugins are kept sorted by descending priority (stable for ties, so equal
/// priorities keep registration order). Dispatch pipes a payload through
/// every enabled plugin that declares the hook point: each interceptor's
/// `Continue` payload feeds the next, and the last one is returned. With no
/// interceptors registered the payload passes through unchanged.
pub struct HookPipeline {
    plugins: RwLock<Vec<Arc<dyn Plugin>>>,
}

impl HookPipeline {
    pub fn new() -> Self {
        Self {
            plugins: RwLock::new(Vec::new()),
        }
    }

    /// Register a plugin: run `init()`, then insert and re-sort. A plugin
    /// with the same metadata name replaces the old one (which is cleaned
    /// up).
    pub async fn register(&self, plugin: Arc<dyn Plugin>) -> Result<()> {
        plugin.init()?;
        let mut plugins = self.plugins.write().await;
        if let Some(pos) = plugins
            .iter()
            .position(|p| p.metadata().name == plugin.metadata().name)
        {
            let old = plugins.remove(pos);
            if let Err(e) = old.cleanup() {
                warn!(plugin = %old.metadata().name, error = %e, "Cleanup of replaced plugin failed");
            }
        }
        debug!(plugin = %plugin.metadata().name, priority = plugin.config().priority, "Plugin registered");
        plugins.push(plugin);
        plugins.sort_by_key(|p| std::cmp::Reverse(p.config().priority));
        Ok(())
    }

    /// Unregister by name, running the plugin's `cleanup()`.
    pub async fn unregister(&self, name: &str) -> Result<bool> {
        let mut plugins = self.plugins.write().await;
        if let Some(pos) = plugins.iter().position(|p| p.metadata().name == name) {
            let plugin = plugins.remove(pos);
            plugin.cleanup()?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    pub async fn plugin_names(&self) -> Vec<String> {
        self.plugins
            .read()
            .await
            .iter()
            .map(|p| p.metadata().name.clone())
            .collect()
    }

    /// Run one hook point. Disabled plugins and plugins that do not declare
    /// the hook are skipped. A hook returning `Err` is logged and swallowed
    /// unless the hook point is error-class; a `Reject` always aborts.
    pub async fn dispatch(
        &self,
        hook: HookPoint,
        payload: Value,
        ctx: &HookContext,
    ) -> Result<Value> {
        let interceptors: Vec<Arc<dyn Plugin>> = self
            .plugins
            .read()
            .await
            .iter()
            .filter(|p| p.config().enabled && p.hooks().contains(&hook))
            .cloned()
            .collect();

        let mut payload = payload;
        for plugin in interceptors {
            match plugin.on_hook(hook, payload.clone(), ctx.clone()).await {
                Ok(HookAction::Continue(next)) => payload = next,
                Ok(HookAction::Reject(e)) => {
                    debug!(plugin = %plugin.metadata().name, ?hook, error = %e, "Hook rejected operation");
                    return Err(e);
                }
                Err(e) if hook.is_error_hook() => {
                    return Err(e);
                }
                Err(e) => {
                    warn!(plugin = %plugin.metadata().name, ?hook, error = %e, "Hook failed, skipping");
                }
            }
        }
        Ok(payload)
    }

    /// Clean up every plugin; used on orchestrator shutdown.
    pub async fn cleanup_all(&self) {
        let plugins = std::mem::take(&mut *self.plugins.write().await);
        for plugin in plugins {
            if let Err(e) = plugin.cleanup() {
                warn!(plugin = %plugin.metadata().name, error = %e, "Plugin cleanup failed");
            }
        }
    }
}

impl Default for HookPipeline {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use futures::future::BoxFuture;
    use serde_json::json;

    use strand_core::error::StrandError;
    use strand_core::plugin::{PluginConfig, PluginMetadata};

    use super::*;

    /// Appends its tag to a payload array so tests can observe ordering.
    struct TagPlugin {
        metadata: PluginMetadata,
        config: PluginConfig,
        tag: &'static str,
        behavior: Behavior,
    }

    enum Behavior {
        Append,
        Fail,
        Reject,
    }

    impl TagPlugin {
        fn new(tag: &'static str, priority: i32, behavior: Behavior) -> Arc<Self> {
            Arc::new(Self {
                metadata: PluginMetadata::new(tag, "1.0"),
                config: PluginConfig::default().with_priority(priority),
                tag,
                behavior,
            })
        }
    }

    impl Plugin for TagPlugin {
        fn metadata(&self) -> &PluginMetadata {
            &self.metadata
        }

        fn config(&self) -> &PluginConfig {
            &self.config
        }

        fn hooks(&self) -> Vec<HookPoint> {
            vec![HookPoint::BeforeStep, HookPoint::OnError]
        }

        fn on_hook(
            &self,
            _hook: HookPoint,
            payload: Value,
            _ctx: HookContext,
        ) -> BoxFuture<'_, Result<HookAction>> {
            Box::pin(async move {
                match self.behavior {
                    Behavior::Append => {
                        let mut list = payload.as_array().cloned().unwrap_or_default();
                        list.push(json!(self.tag));
                        Ok(HookAction::Continue(Value::Array(list)))
                    }
                    Behavior::Fail => Err(StrandError::Plugin {
                        plugin: self.tag.into(),
                        message: "boom".into(),
                    }),
                    Behavior::Reject => Ok(HookAction::Reject(StrandError::RateLimited {
                        key: self.tag.into(),
                        message: "no".into(),
                    })),
                }
            })
        }
    }

    #[tokio::test]
    async fn test_priority_order_and_piping() {
        let pipeline = HookPipeline::new();
        pipeline
            .register(TagPlugin::new("low", 1, Behavior::Append))
            .await
            .unwrap();
        pipeline
            .register(TagPlugin::new("high", 10, Behavior::Append))
            .await
            .unwrap();

        let result = pipeline
            .dispatch(HookPoint::BeforeStep, json!([]), &HookContext::default())
            .await
            .unwrap();
        assert_eq!(result, json!(["high", "low"]));
    }

    #[tokio::test]
    async fn test_equal_priority_keeps_registration_order() {
        let pipeline = HookPipeline::new();
        pipeline
            .register(TagPlugin::new("first", 5, Behavior::Append))
            .await
            .unwrap();
        pipeline
            .register(TagPlugin::new("second", 5, Behavior::Append))
            .await
            .unwrap();

        let result = pipeline
            .dispatch(HookPoint::BeforeStep, json!([]), &HookContext::default())
            .await
            .unwrap();
        assert_eq!(result, json!(["first", "second"]));
    }

    #[tokio::test]
    async fn test_no_hooks_passes_payload_through() {
        let pipeline = HookPipeline::new();
        let payload = json!({"untouched": true});
        let result = pipeline
            .dispatch(HookPoint::AfterStep, payload.clone(), &HookContext::default())
            .await
            .unwrap();
        assert_eq!(result, payload);
    }

    #[tokio::test]
    async fn test_failing_hook_is_swallowed() {
        let pipeline = HookPipeline::new();
        pipeline
            .register(TagPlugin::new("boom", 10, Behavior::Fail))
            .await
            .unwrap();
        pipeline
            .register(TagPlugin::new("after", 1, Behavior::Append))
            .await
            .unwrap();

        // The failing hook is skipped; the later hook still sees the
        // original payload.
        let result = pipeline
            .dispatch(HookPoint::BeforeStep, json!([]), &HookContext::default())
            .await
            .unwrap();
        assert_eq!(result, json!(["after"]));
    }

    #[tokio::test]
    async fn test_error_hook_failure_reraises() {
        let pipeline = HookPipeline::new();
        pipeline
            .register(TagPlugin::new("boom", 10, Behavior::Fail))
            .await
            .unwrap();

        let result = pipeline
            .dispatch(HookPoint::OnError, json!([]), &HookContext::default())
            .await;
        assert!(matches!(result, Err(StrandError::Plugin { .. })));
    }

    #[tokio::test]
    async fn test_reject_aborts_pipeline() {
        let pipeline = HookPipeline::new();
        pipeline
            .register(TagPlugin::new("gate", 10, Behavior::Reject))
            .await
            .unwrap();
        pipeline
            .register(TagPlugin::new("never", 1, Behavior::Append))
            .await
            .unwrap();

        let result = pipeline
            .dispatch(HookPoint::BeforeStep, json!([]), &HookContext::default())
            .await;
        assert!(matches!(result, Err(StrandError::RateLimited { .. })));
    }

    #[tokio::test]
    async fn test_unregister_removes_plugin() {
        let pipeline = HookPipeline::new();
        pipeline
            .register(TagPlugin::new("only", 0, Behavior::Append))
            .await
            .unwrap();
        assert!(pipeline.unregister("only").await.unwrap());
        assert!(!pipeline.unregister("only").await.unwrap());
        assert!(pipeline.plugin_names().await.is_empty());
    }
}
