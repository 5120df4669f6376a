use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

use futures::future::BoxFuture;
use serde_json::{json, Value};

use strand_core::error::Result;
use strand_core::plugin::{
    HookAction, HookContext, HookPoint, Plugin, PluginConfig, PluginMetadata,
};

#[derive(Default)]
struct MetricsState {
    counters: HashMap<String, u64>,
    gauges: HashMap<String, f64>,
    histograms: HashMap<String, Vec<f64>>,
    timer_series: HashMap<String, Vec<f64>>,
    active_timers: HashMap<String, Instant>,
}

/// Collects counters, gauges, histograms, and timers from lifecycle hooks.
/// Workflow and agent durations land in timer series, measured between the
/// matching before/after hook pair.
pub struct MetricsPlugin {
    metadata: PluginMetadata,
    config: PluginConfig,
    state: Mutex<MetricsState>,
}

impl MetricsPlugin {
    pub fn new() -> Self {
        Self {
            metadata: PluginMetadata::new("metrics", "0.1.0")
                .with_description("Execution counters, histograms, and duration timers"),
            config: PluginConfig::default(),
            state: Mutex::new(MetricsState::default()),
        }
    }

    pub fn with_config(mut self, config: PluginConfig) -> Self {
        self.config = config;
        self
    }

    pub fn increment(&self, name: &str) {
        let mut state = self.state.lock().unwrap();
        *state.counters.entry(name.to_string()).or_insert(0) += 1;
    }

    pub fn set_gauge(&self, name: &str, value: f64) {
        self.state
            .lock()
            .unwrap()
            .gauges
            .insert(name.to_string(), value);
    }

    pub fn observe(&self, name: &str, value: f64) {
        self.state
            .lock()
            .unwrap()
            .histograms
            .entry(name.to_string())
            .or_default()
            .push(value);
    }

    /// Record one timer measurement in milliseconds.
    pub fn record_timer(&self, name: &str, elapsed_ms: f64) {
        self.state
            .lock()
            .unwrap()
            .timer_series
            .entry(name.to_string())
            .or_default()
            .push(elapsed_ms);
    }

    pub fn counter(&self, name: &str) -> u64 {
        self.state
            .lock()
            .unwrap()
            .counters
            .get(name)
            .copied()
            .unwrap_or(0)
    }

    fn start_timer(&self, key: String) {
        let mut state = self.state.lock().unwrap();
        state.active_timers.insert(key, Instant::now());
    }

    fn stop_timer(&self, key: &str, timer: &str) {
        let elapsed_ms = {
            let mut state = self.state.lock().unwrap();
            state
                .active_timers
                .remove(key)
                .map(|start| start.elapsed().as_secs_f64() * 1000.0)
        };
        if let Some(ms) = elapsed_ms {
            self.record_timer(timer, ms);
        }
    }

    /// Summary of one histogram or timer series, or None if nothing was
    /// observed under that name.
    pub fn get_summary(&self, name: &str) -> Option<Value> {
        let state = self.state.lock().unwrap();
        state
            .histograms
            .get(name)
            .or_else(|| state.timer_series.get(name))
            .map(|series| summarize(series))
    }

    /// Snapshot of everything collected so far.
    pub fn export(&self) -> Value {
        let state = self.state.lock().unwrap();
        let histograms: serde_json::Map<String, Value> = state
            .histograms
            .iter()
            .map(|(name, series)| (name.clone(), summarize(series)))
            .collect();
        let timers: serde_json::Map<String, Value> = state
            .timer_series
            .iter()
            .map(|(name, series)| (name.clone(), summarize(series)))
            .collect();
        json!({
            "counters": &state.counters,
            "gauges": &state.gauges,
            "histograms": histograms,
            "timers": timers,
        })
    }

    fn timer_key(ctx: &HookContext, scope: &str) -> String {
        // Step id disambiguates concurrent agent calls within one execution.
        format!(
            "{scope}:{}:{}",
            ctx.workflow_id.as_deref().unwrap_or(""),
            ctx.step_id.as_deref().unwrap_or("")
        )
    }
}

impl Default for MetricsPlugin {
    fn default() -> Self {
        Self::new()
    }
}

fn summarize(series: &[f64]) -> Value {
    if series.is_empty() {
        return json!({ "count": 0 });
    }
    let mut sorted = series.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let count = sorted.len();
    let sum: f64 = sorted.iter().sum();
    json!({
        "count": count,
        "sum": sum,
        "min": sorted[0],
        "max": sorted[count - 1],
        "avg": sum / count as f64,
        "p50": percentile(&sorted, 0.50),
        "p95": percentile(&sorted, 0.95),
        "p99": percentile(&sorted, 0.99),
    })
}

// Nearest-rank percentile over an already sorted series.
fn percentile(sorted: &[f64], p: f64) -> f64 {
    let rank = (sorted.len() as f64 * p).ceil() as usize;
    sorted[rank.saturating_sub(1).min(sorted.len() - 1)]
}

impl Plugin for MetricsPlugin {
    fn metadata(&self) -> &PluginMetadata {
        &self.metadata
    }

    fn config(&self) -> &PluginConfig {
        &self.config
    }

    fn hooks(&self) -> Vec<HookPoint> {
        vec![
            HookPoint::BeforeWorkflowExecute,
            HookPoint::AfterWorkflowExecute,
            HookPoint::BeforeAgentExecute,
            HookPoint::AfterAgentExecute,
            HookPoint::BeforeStep,
            HookPoint::AfterStep,
            HookPoint::OnWorkflowError,
            HookPoint::OnAgentError,
        ]
    }

    fn on_hook(
        &self,
        hook: HookPoint,
        payload: Value,
        ctx: HookContext,
    ) -> BoxFuture<'_, Result<HookAction>> {
        Box::pin(async move {
            match hook {
                HookPoint::BeforeWorkflowExecute => {
                    self.increment("workflows_started");
                    self.start_timer(Self::timer_key(&ctx, "workflow"));
                }
                HookPoint::AfterWorkflowExecute => {
                    self.increment("workflows_completed");
                    self.stop_timer(&Self::timer_key(&ctx, "workflow"), "workflow_duration_ms");
                }
                HookPoint::OnWorkflowError => {
                    self.increment("workflows_failed");
                    self.stop_timer(&Self::timer_key(&ctx, "workflow"), "workflow_duration_ms");
                }
                HookPoint::BeforeAgentExecute => {
                    self.increment("agent_calls");
                    self.start_timer(Self::timer_key(&ctx, "agent"));
                }
                HookPoint::AfterAgentExecute => {
                    self.stop_timer(&Self::timer_key(&ctx, "agent"), "agent_duration_ms");
                }
                HookPoint::OnAgentError => {
                    self.increment("agent_errors");
                    self.stop_timer(&Self::timer_key(&ctx, "agent"), "agent_duration_ms");
                }
                HookPoint::BeforeStep => {
                    self.increment("steps_started");
                }
                HookPoint::AfterStep => {
                    self.increment("steps_completed");
                }
                _ => {}
            }
            Ok(HookAction::Continue(payload))
        })
    }
}
