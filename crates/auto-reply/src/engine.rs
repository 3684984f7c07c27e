//! Retrieval-gated reply engine.

use std::{sync::Arc, time::Duration};

use {
    switchboard_config::ReplyConfig,
    switchboard_providers::{EmbeddingProvider, GenerationProvider},
    switchboard_store::Store,
    tracing::{debug, warn},
};

use crate::prompt::{build_prompt, normalize_answer};

#[derive(Debug, Clone)]
pub struct ReplySettings {
    pub confidence_threshold: f32,
    pub top_k: usize,
    pub min_answer_chars: usize,
    pub sentinel: String,
    /// Upper bound for each embedding or generation call.
    pub call_timeout: Duration,
}

impl ReplySettings {
    pub fn from_config(reply: &ReplyConfig, call_timeout: Duration) -> Self {
        Self {
            confidence_threshold: reply.confidence_threshold,
            top_k: reply.top_k,
            min_answer_chars: reply.min_answer_chars,
            sentinel: reply.no_answer_sentinel.clone(),
            call_timeout,
        }
    }
}

impl Default for ReplySettings {
    fn default() -> Self {
        Self::from_config(&ReplyConfig::default(), Duration::from_secs(20))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoAnswerReason {
    /// No knowledge chunk cleared the confidence threshold.
    NoContext,
    /// The model returned the sentinel.
    Sentinel,
    TooShort,
    EmbedFailed,
    RetrievalFailed,
    GenerateFailed,
    Timeout,
}

impl NoAnswerReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NoContext => "no_context",
            Self::Sentinel => "sentinel",
            Self::TooShort => "too_short",
            Self::EmbedFailed => "embed_failed",
            Self::RetrievalFailed => "retrieval_failed",
            Self::GenerateFailed => "generate_failed",
            Self::Timeout => "timeout",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyOutcome {
    Answer(String),
    NoAnswer(NoAnswerReason),
}

/// Answers a question from one device's knowledge base, or declines.
///
/// Every failure folds into [`ReplyOutcome::NoAnswer`]; the caller hands the
/// conversation over instead of surfacing an error to the user.
pub struct ReplyEngine {
    store: Arc<dyn Store>,
    embedder: Arc<dyn EmbeddingProvider>,
    generator: Arc<dyn GenerationProvider>,
    settings: ReplySettings,
}

impl ReplyEngine {
    pub fn new(
        store: Arc<dyn Store>,
        embedder: Arc<dyn EmbeddingProvider>,
        generator: Arc<dyn GenerationProvider>,
        settings: ReplySettings,
    ) -> Self {
        Self {
            store,
            embedder,
            generator,
            settings,
        }
    }

    pub fn settings(&self) -> &ReplySettings {
        &self.settings
    }

    pub async fn answer(&self, device_id: &str, question: &str) -> ReplyOutcome {
        let outcome = self.run(device_id, question).await;
        #[cfg(feature = "metrics")]
        {
            use switchboard_metrics::{counter, labels, reply};
            let label = match &outcome {
                ReplyOutcome::Answer(_) => "answer",
                ReplyOutcome::NoAnswer(reason) => reason.as_str(),
            };
            counter!(reply::DECISIONS_TOTAL, labels::OUTCOME => label).increment(1);
        }
        outcome
    }

    async fn run(&self, device_id: &str, question: &str) -> ReplyOutcome {
        let limit = self.settings.call_timeout;

        let query = match tokio::time::timeout(limit, self.embedder.embed(question)).await {
            Ok(Ok(vector)) => vector,
            Ok(Err(e)) => {
                warn!(device_id, error = %e, "embedding failed");
                return ReplyOutcome::NoAnswer(NoAnswerReason::EmbedFailed);
            },
            Err(_) => {
                warn!(device_id, "embedding timed out");
                return ReplyOutcome::NoAnswer(NoAnswerReason::Timeout);
            },
        };

        let matches = match self
            .store
            .match_knowledge(
                device_id,
                &query,
                self.settings.confidence_threshold,
                self.settings.top_k,
            )
            .await
        {
            Ok(matches) => matches,
            Err(e) => {
                warn!(device_id, error = %e, "knowledge retrieval failed");
                return ReplyOutcome::NoAnswer(NoAnswerReason::RetrievalFailed);
            },
        };
        if matches.is_empty() {
            debug!(device_id, "no knowledge above threshold");
            return ReplyOutcome::NoAnswer(NoAnswerReason::NoContext);
        }
        debug!(
            device_id,
            chunks = matches.len(),
            best = matches[0].similarity,
            "knowledge matched"
        );

        let context: Vec<&str> = matches.iter().map(|m| m.content.as_str()).collect();
        let prompt = build_prompt(&context, question, &self.settings.sentinel);
        let raw = match tokio::time::timeout(limit, self.generator.generate(&prompt)).await {
            Ok(Ok(text)) => text,
            Ok(Err(e)) => {
                warn!(device_id, error = %e, "generation failed");
                return ReplyOutcome::NoAnswer(NoAnswerReason::GenerateFailed);
            },
            Err(_) => {
                warn!(device_id, "generation timed out");
                return ReplyOutcome::NoAnswer(NoAnswerReason::Timeout);
            },
        };

        match normalize_answer(&raw, &self.settings.sentinel, self.settings.min_answer_chars) {
            Some(answer) => ReplyOutcome::Answer(answer),
            None if raw.contains(&self.settings.sentinel) => {
                ReplyOutcome::NoAnswer(NoAnswerReason::Sentinel)
            },
            None => ReplyOutcome::NoAnswer(NoAnswerReason::TooShort),
        }
    }
}
