//! OpenAI-compatible `/v1/embeddings` and `/v1/chat/completions`.

use std::time::Duration;

use {
    anyhow::{Context, Result, anyhow, bail},
    async_trait::async_trait,
    secrecy::{ExposeSecret, Secret},
    serde::{Deserialize, Serialize, de::DeserializeOwned},
};

use crate::{EmbeddingProvider, GenerationProvider, error_body};

const DEFAULT_BASE_URL: &str = "https://api.openai.com";

pub struct OpenAiProvider {
    client: reqwest::Client,
    api_key: Option<Secret<String>>,
    base_url: String,
    embedding_model: String,
    generation_model: String,
}

impl OpenAiProvider {
    pub fn new(
        api_key: Option<Secret<String>>,
        embedding_model: String,
        generation_model: String,
        timeout: Duration,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("building HTTP client")?;
        Ok(Self {
            client,
            api_key,
            base_url: DEFAULT_BASE_URL.to_string(),
            embedding_model,
            generation_model,
        })
    }

    pub fn with_base_url(mut self, url: String) -> Self {
        self.base_url = url.trim_end_matches('/').to_string();
        self
    }

    async fn post<B: Serialize, R: DeserializeOwned>(&self, path: &str, body: &B) -> Result<R> {
        let key = self
            .api_key
            .as_ref()
            .map(|k| k.expose_secret().as_str())
            .filter(|k| !k.is_empty())
            .ok_or_else(|| anyhow!("OpenAI API key is not configured"))?;
        let resp = self
            .client
            .post(format!("{}{path}", self.base_url))
            .bearer_auth(key)
            .json(body)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let body = error_body(resp).await;
            bail!("OpenAI API error HTTP {status}: {body}");
        }
        Ok(resp.json::<R>().await?)
    }
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: Vec<&'a str>,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[async_trait]
impl EmbeddingProvider for OpenAiProvider {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        #[cfg(feature = "metrics")]
        let started = std::time::Instant::now();

        let req = EmbeddingRequest {
            model: &self.embedding_model,
            input: vec![text],
        };
        let result = self.post::<_, EmbeddingResponse>("/v1/embeddings", &req).await;

        #[cfg(feature = "metrics")]
        crate::record_call("openai", "embed", started, result.is_ok());

        result?
            .data
            .pop()
            .map(|d| d.embedding)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| anyhow!("empty embedding response"))
    }

    fn model_name(&self) -> &str {
        &self.embedding_model
    }
}

#[async_trait]
impl GenerationProvider for OpenAiProvider {
    async fn generate(&self, prompt: &str) -> Result<String> {
        #[cfg(feature = "metrics")]
        let started = std::time::Instant::now();

        let req = ChatRequest {
            model: &self.generation_model,
            messages: vec![ChatMessage {
                role: "user",
                content: prompt,
            }],
        };
        let result = self
            .post::<_, ChatResponse>("/v1/chat/completions", &req)
            .await;

        #[cfg(feature = "metrics")]
        crate::record_call("openai", "generate", started, result.is_ok());

        result?
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| anyhow!("completion has no content"))
    }

    fn model_name(&self) -> &str {
        &self.generation_model
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, mockito::Matcher};

    fn provider(server: &mockito::Server) -> OpenAiProvider {
        OpenAiProvider::new(
            Some(Secret::new("sk-test".to_string())),
            "text-embedding-3-small".into(),
            "gpt-4o-mini".into(),
            Duration::from_secs(5),
        )
        .unwrap()
        .with_base_url(format!("{}/", server.url()))
    }

    #[tokio::test]
    async fn embeds_with_bearer_auth() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/embeddings")
            .match_header("authorization", "Bearer sk-test")
            .match_body(Matcher::PartialJson(serde_json::json!({
                "model": "text-embedding-3-small",
                "input": ["hello"]
            })))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"data":[{"embedding":[1.0,0.0]}]}"#)
            .create_async()
            .await;

        assert_eq!(provider(&server).embed("hello").await.unwrap(), vec![1.0, 0.0]);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn generates_first_choice() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/v1/chat/completions")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"choices":[{"message":{"role":"assistant","content":"Hi there"}}]}"#)
            .create_async()
            .await;

        assert_eq!(provider(&server).generate("hey").await.unwrap(), "Hi there");
    }

    #[tokio::test]
    async fn server_error_is_reported() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/v1/embeddings")
            .with_status(500)
            .with_body("boom")
            .create_async()
            .await;

        let err = provider(&server).embed("hello").await.unwrap_err();
        assert!(err.to_string().contains("500"));
    }
}
