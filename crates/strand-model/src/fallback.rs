use std::sync::Arc;

use futures::future::BoxFuture;
use futures::stream::BoxStream;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use strand_core::error::{Result, StrandError};
use strand_core::traits::ModelProvider;
use strand_core::types::GenerateOptions;

/// One model a [`FallbackProvider`] may route to.
pub struct Candidate {
    /// Identifier used for logging only; the provider owns the binding.
    pub model_id: String,
    pub provider: Arc<dyn ModelProvider>,
}

impl Candidate {
    pub fn new(model_id: impl Into<String>, provider: Arc<dyn ModelProvider>) -> Self {
        Self {
            model_id: model_id.into(),
            provider,
        }
    }
}

fn is_quota_error(e: &StrandError) -> bool {
    match e {
        StrandError::QuotaExhausted(_) => true,
        StrandError::ModelRequest(msg) => {
            let msg = msg.to_lowercase();
            msg.contains("quota")
                || msg.contains("credit")
                || msg.contains("insufficient")
                || msg.contains("402")
        }
        _ => false,
    }
}

/// A provider that cascades across candidate models on quota/credit errors.
///
/// For each candidate, the request is tried at the caller's token budget and
/// then at each configured ceiling below it, in descending order; a quota
/// error moves down the ceilings, then on to the next candidate. Any other
/// error fails fast; transient-error retry belongs to the layer above.
pub struct FallbackProvider {
    candidates: Vec<Candidate>,
    /// Descending max-token ceilings tried after a quota error.
    token_ceilings: Vec<u32>,
}

impl FallbackProvider {
    pub fn new(candidates: Vec<Candidate>, mut token_ceilings: Vec<u32>) -> Self {
        token_ceilings.sort_unstable_by(|a, b| b.cmp(a));
        Self {
            candidates,
            token_ceilings,
        }
    }

    /// Token budgets to try for one candidate: the requested budget first,
    /// then each ceiling strictly below it.
    fn budgets(&self, requested: u32) -> Vec<u32> {
        let mut budgets = vec![requested];
        budgets.extend(self.token_ceilings.iter().copied().filter(|c| *c < requested));
        budgets
    }
}

impl ModelProvider for FallbackProvider {
    fn generate(
        &self,
        prompt: String,
        options: GenerateOptions,
        cancel: CancellationToken,
    ) -> BoxFuture<'_, Result<String>> {
        Box::pin(async move {
            let mut last_err = None;

            for candidate in &self.candidates {
                for budget in self.budgets(options.max_tokens) {
                    let mut opts = options.clone();
                    opts.max_tokens = budget;

                    match candidate
                        .provider
                        .generate(prompt.clone(), opts, cancel.child_token())
                        .await
                    {
                        Ok(text) => {
                            if budget != options.max_tokens {
                                info!(
                                    model = %candidate.model_id,
                                    max_tokens = budget,
                                    "Succeeded at reduced token ceiling"
                                );
                            }
                            return Ok(text);
                        }
                        Err(e) if is_quota_error(&e) => {
                            warn!(
                                model = %candidate.model_id,
                                max_tokens = budget,
                                error = %e,
                                "Quota error, stepping down"
                            );
                            last_err = Some(e);
                        }
                        Err(e) => return Err(e),
                    }
                }
            }

            Err(last_err
                .unwrap_or_else(|| StrandError::ModelRequest("no candidates configured".into())))
        })
    }

    fn generate_stream(
        &self,
        prompt: String,
        options: GenerateOptions,
    ) -> BoxFuture<'_, Result<BoxStream<'static, Result<String>>>> {
        Box::pin(async move {
            let mut last_err = None;

            for candidate in &self.candidates {
                for budget in self.budgets(options.max_tokens) {
                    let mut opts = options.clone();
                    opts.max_tokens = budget;

                    match candidate
                        .provider
                        .generate_stream(prompt.clone(), opts)
                        .await
                    {
                        Ok(stream) => return Ok(stream),
                        Err(e) if is_quota_error(&e) => {
                            warn!(
                                model = %candidate.model_id,
                                max_tokens = budget,
                                error = %e,
                                "Quota error on stream open, stepping down"
                            );
                            last_err = Some(e);
                        }
                        Err(e) => return Err(e),
                    }
                }
            }

            Err(last_err
                .unwrap_or_else(|| StrandError::ModelRequest("no candidates configured".into())))
        })
    }
}
