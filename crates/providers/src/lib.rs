//! Embedding and text-generation providers used by the auto-reply engine.

use std::sync::Arc;

use {anyhow::Result, async_trait::async_trait, switchboard_config::{AiConfig, AiProviderKind}};

pub mod gemini;
pub mod openai;

pub use {gemini::GeminiProvider, openai::OpenAiProvider};

/// Turns text into a vector for knowledge retrieval.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    fn model_name(&self) -> &str;
}

/// Produces a single completion for a prompt.
#[async_trait]
pub trait GenerationProvider: Send + Sync {
    async fn generate(&self, prompt: &str) -> Result<String>;

    fn model_name(&self) -> &str;
}

/// The embedder and generator configured for this process.
#[derive(Clone)]
pub struct AiProviders {
    pub embedder: Arc<dyn EmbeddingProvider>,
    pub generator: Arc<dyn GenerationProvider>,
}

/// Build the providers described by `[ai]`.
pub fn from_config(config: &AiConfig) -> Result<AiProviders> {
    let timeout = config.request_timeout();
    let providers = match config.provider {
        AiProviderKind::Gemini => {
            let mut provider = GeminiProvider::new(
                config.api_key.clone(),
                config.embedding_model.clone(),
                config.generation_model.clone(),
                timeout,
            )?;
            if let Some(base_url) = &config.base_url {
                provider = provider.with_base_url(base_url.clone());
            }
            let provider = Arc::new(provider);
            AiProviders {
                embedder: provider.clone(),
                generator: provider,
            }
        },
        AiProviderKind::Openai => {
            let mut provider = OpenAiProvider::new(
                config.api_key.clone(),
                config.embedding_model.clone(),
                config.generation_model.clone(),
                timeout,
            )?;
            if let Some(base_url) = &config.base_url {
                provider = provider.with_base_url(base_url.clone());
            }
            let provider = Arc::new(provider);
            AiProviders {
                embedder: provider.clone(),
                generator: provider,
            }
        },
    };
    tracing::info!(
        provider = ?config.provider,
        embedding_model = providers.embedder.model_name(),
        generation_model = providers.generator.model_name(),
        "AI providers configured"
    );
    Ok(providers)
}

/// Read an error response body for the error message, tolerating failures.
pub(crate) async fn error_body(resp: reqwest::Response) -> String {
    resp.text().await.unwrap_or_default()
}

#[cfg(feature = "metrics")]
pub(crate) fn record_call(
    provider: &'static str,
    operation: &'static str,
    started: std::time::Instant,
    ok: bool,
) {
    use switchboard_metrics::{ai, counter, histogram, labels};

    counter!(ai::REQUESTS_TOTAL, labels::PROVIDER => provider, labels::OPERATION => operation)
        .increment(1);
    if !ok {
        counter!(ai::ERRORS_TOTAL, labels::PROVIDER => provider, labels::OPERATION => operation)
            .increment(1);
    }
    histogram!(
        ai::REQUEST_DURATION_SECONDS,
        labels::PROVIDER => provider,
        labels::OPERATION => operation
    )
    .record(started.elapsed().as_secs_f64());
}
