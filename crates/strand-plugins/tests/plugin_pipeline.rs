use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use strand_core::config::{AgentConfig, StepConfig, WorkflowConfig};
use strand_core::error::StrandError;
use strand_engine::{Agent, ExecuteOptions, Orchestrator, Workflow};
use strand_plugins::{CachePlugin, MetricsPlugin, RateLimitPlugin};
use strand_test_utils::ScriptedProvider;

async fn orchestrator_with_agent(provider: Arc<ScriptedProvider>) -> Orchestrator {
    let orchestrator = Orchestrator::default();
    orchestrator
        .register_agent(Agent::new(
            AgentConfig::new("assistant", "Assistant"),
            provider,
        ))
        .await
        .unwrap();
    orchestrator
        .register_workflow(Workflow::new(
            WorkflowConfig::new("wf", "Test")
                .with_steps(vec![StepConfig::agent("respond", "assistant")]),
        ))
        .await
        .unwrap();
    orchestrator
}

#[tokio::test]
async fn test_cache_short_circuits_second_call() {
    let provider = Arc::new(ScriptedProvider::always("expensive answer"));
    let orchestrator = orchestrator_with_agent(provider.clone()).await;

    let cache = Arc::new(CachePlugin::new(Duration::from_secs(60), 100));
    orchestrator.register_plugin(cache.clone()).await.unwrap();

    let first = orchestrator
        .execute("wf", json!("question"), ExecuteOptions::default())
        .await
        .unwrap();
    assert_eq!(
        first.variable("respond").await,
        Some(json!("expensive answer"))
    );
    assert_eq!(first.metadata("cache_hit").await, None);
    assert_eq!(provider.calls(), 1);

    let second = orchestrator
        .execute("wf", json!("question"), ExecuteOptions::default())
        .await
        .unwrap();
    assert_eq!(
        second.variable("respond").await,
        Some(json!("expensive answer"))
    );
    assert_eq!(second.metadata("cache_hit").await, Some(json!(true)));
    // The model was not consulted again.
    assert_eq!(provider.calls(), 1);
    assert_eq!(cache.hits(), 1);
}

#[tokio::test]
async fn test_cache_misses_on_different_input() {
    let provider = Arc::new(ScriptedProvider::always("answer"));
    let orchestrator = orchestrator_with_agent(provider.clone()).await;
    orchestrator
        .register_plugin(Arc::new(CachePlugin::default()))
        .await
        .unwrap();

    orchestrator
        .execute("wf", json!("first"), ExecuteOptions::default())
        .await
        .unwrap();
    orchestrator
        .execute("wf", json!("second"), ExecuteOptions::default())
        .await
        .unwrap();
    assert_eq!(provider.calls(), 2);
}

#[tokio::test]
async fn test_rate_limit_fails_the_step() {
    let provider = Arc::new(ScriptedProvider::always("ok"));
    let orchestrator = orchestrator_with_agent(provider.clone()).await;
    orchestrator
        .register_plugin(Arc::new(RateLimitPlugin::new(100, 2)))
        .await
        .unwrap();

    for _ in 0..2 {
        orchestrator
            .execute("wf", json!("q"), ExecuteOptions::default())
            .await
            .unwrap();
    }

    let third = orchestrator
        .execute("wf", json!("q"), ExecuteOptions::default())
        .await
        .unwrap_err();
    match third.error {
        StrandError::RateLimited { key, .. } => {
            assert_eq!(key, "assistant:anonymous");
        }
        other => panic!("expected rate limit error, got {other:?}"),
    }
    assert_eq!(provider.calls(), 2);
}

#[tokio::test]
async fn test_rate_limit_keys_on_caller_metadata() {
    let provider = Arc::new(ScriptedProvider::always("ok"));
    let orchestrator = orchestrator_with_agent(provider.clone()).await;
    orchestrator
        .register_plugin(Arc::new(RateLimitPlugin::new(100, 1)))
        .await
        .unwrap();

    orchestrator
        .execute(
            "wf",
            json!("q"),
            ExecuteOptions::default().with_metadata("caller", json!("alice")),
        )
        .await
        .unwrap();
    // A different caller has a fresh window for the same agent.
    orchestrator
        .execute(
            "wf",
            json!("q"),
            ExecuteOptions::default().with_metadata("caller", json!("bob")),
        )
        .await
        .unwrap();
    let repeat = orchestrator
        .execute(
            "wf",
            json!("q"),
            ExecuteOptions::default().with_metadata("caller", json!("alice")),
        )
        .await
        .unwrap_err();
    assert!(matches!(repeat.error, StrandError::RateLimited { .. }));
}

#[tokio::test]
async fn test_metrics_observe_workflow_lifecycle() {
    let provider = Arc::new(ScriptedProvider::always("ok"));
    let orchestrator = orchestrator_with_agent(provider).await;

    let metrics = Arc::new(MetricsPlugin::new());
    orchestrator.register_plugin(metrics.clone()).await.unwrap();

    orchestrator
        .execute("wf", json!("q"), ExecuteOptions::default())
        .await
        .unwrap();
    orchestrator
        .execute("wf", json!("q"), ExecuteOptions::default())
        .await
        .unwrap();

    assert_eq!(metrics.counter("workflows_started"), 2);
    assert_eq!(metrics.counter("workflows_completed"), 2);
    assert_eq!(metrics.counter("workflows_failed"), 0);
    assert_eq!(metrics.counter("agent_calls"), 2);
    assert_eq!(metrics.counter("steps_completed"), 2);

    let export = metrics.export();
    assert_eq!(export["timers"]["workflow_duration_ms"]["count"], json!(2));
    assert_eq!(export["timers"]["agent_duration_ms"]["count"], json!(2));
}

#[tokio::test]
async fn test_metrics_count_failures() {
    let orchestrator = Orchestrator::default();
    orchestrator
        .register_workflow(Workflow::new(
            WorkflowConfig::new("wf", "Test")
                .with_steps(vec![StepConfig::agent("respond", "ghost")]),
        ))
        .await
        .unwrap();

    let metrics = Arc::new(MetricsPlugin::new());
    orchestrator.register_plugin(metrics.clone()).await.unwrap();

    let result = orchestrator
        .execute("wf", json!("q"), ExecuteOptions::default())
        .await;
    assert!(result.is_err());
    assert_eq!(metrics.counter("workflows_failed"), 1);
    assert_eq!(metrics.counter("workflows_completed"), 0);
}

#[tokio::test]
async fn test_plugins_compose_by_priority() {
    let provider = Arc::new(ScriptedProvider::always("ok"));
    let orchestrator = orchestrator_with_agent(provider.clone()).await;

    // Rate limiter first so a rejected call never touches the cache.
    orchestrator
        .register_plugin(Arc::new(RateLimitPlugin::new(100, 1).with_config(
            strand_core::plugin::PluginConfig::default().with_priority(10),
        )))
        .await
        .unwrap();
    let cache = Arc::new(CachePlugin::default());
    orchestrator.register_plugin(cache.clone()).await.unwrap();

    orchestrator
        .execute("wf", json!("q"), ExecuteOptions::default())
        .await
        .unwrap();
    let second = orchestrator
        .execute("wf", json!("q"), ExecuteOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(second.error, StrandError::RateLimited { .. }));
    // The veto short-circuited the pipeline before the cache hook ran.
    assert_eq!(cache.hits(), 0);
    assert_eq!(
        orchestrator.plugin_names().await,
        vec!["rate-limit".to_string(), "cache".to_string()]
    );
}
