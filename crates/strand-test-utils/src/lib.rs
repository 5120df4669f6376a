//! Mocks and fixtures shared by Strand crate tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use strand_core::error::{Result, StrandError};
use strand_core::traits::{ModelProvider, ToolHandler};
use strand_core::types::GenerateOptions;
use strand_core::ExecutionContext;

/// Initialize tracing for tests. Safe to call repeatedly.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with_test_writer()
        .try_init();
}

/// A provider that replays a scripted sequence of results, then repeats the
/// last one. Records every prompt it receives.
pub struct ScriptedProvider {
    script: Mutex<VecDeque<Result<String>>>,
    last: Mutex<Option<String>>,
    prompts: Mutex<Vec<String>>,
    calls: AtomicUsize,
    delay: Option<Duration>,
}

impl ScriptedProvider {
    /// Always responds with `response`.
    pub fn always(response: &str) -> Self {
        let mut script = VecDeque::new();
        script.push_back(Ok(response.to_string()));
        Self::from_script(script)
    }

    /// Fails `failures` times with a retryable error, then responds.
    pub fn failing_then(failures: usize, response: &str) -> Self {
        let mut script = VecDeque::new();
        for _ in 0..failures {
            script.push_back(Err(StrandError::ModelRequest("HTTP 503".into())));
        }
        script.push_back(Ok(response.to_string()));
        Self::from_script(script)
    }

    pub fn from_script(script: VecDeque<Result<String>>) -> Self {
        Self {
            script: Mutex::new(script),
            last: Mutex::new(None),
            prompts: Mutex::new(vec![]),
            calls: AtomicUsize::new(0),
            delay: None,
        }
    }

    /// Delay each call, so tests can exercise timeouts and cancellation.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }

    fn next_result(&self) -> Result<String> {
        let mut script = self.script.lock().unwrap();
        match script.pop_front() {
            Some(Ok(text)) => {
                *self.last.lock().unwrap() = Some(text.clone());
                Ok(text)
            }
            Some(Err(e)) => Err(e),
            None => match self.last.lock().unwrap().clone() {
                Some(text) => Ok(text),
                None => Err(StrandError::ModelRequest("script exhausted".into())),
            },
        }
    }
}

impl ModelProvider for ScriptedProvider {
    fn generate(
        &self,
        prompt: String,
        _options: GenerateOptions,
        cancel: CancellationToken,
    ) -> BoxFuture<'_, Result<String>> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.prompts.lock().unwrap().push(prompt);
            if let Some(delay) = self.delay {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.cancelled() => return Err(StrandError::Cancelled),
                }
            }
            self.next_result()
        })
    }

    fn generate_stream(
        &self,
        prompt: String,
        _options: GenerateOptions,
    ) -> BoxFuture<'_, Result<BoxStream<'static, Result<String>>>> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.prompts.lock().unwrap().push(prompt);
            let text = self.next_result()?;
            // Fragment on whitespace to exercise multi-chunk consumers.
            let fragments: Vec<Result<String>> = text
                .split_inclusive(' ')
                .map(|s| Ok(s.to_string()))
                .collect();
            Ok(stream::iter(fragments).boxed())
        })
    }
}

/// A tool handler that echoes its params back under `{"echo": ...}`.
pub struct EchoTool;

impl ToolHandler for EchoTool {
    fn call(&self, params: Value, _ctx: ExecutionContext) -> BoxFuture<'_, Result<Value>> {
        Box::pin(async move { Ok(serde_json::json!({ "echo": params })) })
    }
}

/// A tool handler that always fails.
pub struct FailingTool;

impl ToolHandler for FailingTool {
    fn call(&self, _params: Value, _ctx: ExecutionContext) -> BoxFuture<'_, Result<Value>> {
        Box::pin(async {
            Err(StrandError::ToolExecution {
                tool: "failing".into(),
                message: "intentional failure".into(),
            })
        })
    }
}

/// A tool handler that records every params value it receives.
#[derive(Default)]
pub struct RecordingTool {
    pub seen: Arc<Mutex<Vec<Value>>>,
}

impl RecordingTool {
    pub fn new() -> (Self, Arc<Mutex<Vec<Value>>>) {
        let seen = Arc::new(Mutex::new(vec![]));
        (
            Self { seen: seen.clone() },
            seen,
        )
    }
}

impl ToolHandler for RecordingTool {
    fn call(&self, params: Value, _ctx: ExecutionContext) -> BoxFuture<'_, Result<Value>> {
        let seen = self.seen.clone();
        Box::pin(async move {
            seen.lock().unwrap().push(params.clone());
            Ok(params)
        })
    }
}
