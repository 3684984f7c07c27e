//! Google Gemini via the Generative Language REST API.

use std::time::Duration;

use {
    anyhow::{Context, Result, anyhow, bail},
    async_trait::async_trait,
    secrecy::{ExposeSecret, Secret},
    serde::{Deserialize, Serialize, de::DeserializeOwned},
    tracing::debug,
};

use crate::{EmbeddingProvider, GenerationProvider, error_body};

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";

pub struct GeminiProvider {
    client: reqwest::Client,
    api_key: Option<Secret<String>>,
    base_url: String,
    embedding_model: String,
    generation_model: String,
}

impl GeminiProvider {
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

    fn api_key(&self) -> Result<&str> {
        self.api_key
            .as_ref()
            .map(|k| k.expose_secret().as_str())
            .filter(|k| !k.is_empty())
            .ok_or_else(|| anyhow!("Gemini API key is not configured"))
    }

    async fn post<B: Serialize, R: DeserializeOwned>(
        &self,
        model: &str,
        method: &str,
        body: &B,
    ) -> Result<R> {
        let url = format!("{}/v1beta/models/{model}:{method}", self.base_url);
        let resp = self
            .client
            .post(&url)
            .header("x-goog-api-key", self.api_key()?)
            .json(body)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let body = error_body(resp).await;
            bail!("Gemini API error HTTP {status}: {body}");
        }
        Ok(resp.json::<R>().await?)
    }
}

#[derive(Serialize, Deserialize)]
struct Part {
    #[serde(default)]
    text: String,
}

#[derive(Serialize, Deserialize)]
struct Content {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    role: Option<String>,
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Serialize)]
struct EmbedRequest {
    model: String,
    content: Content,
}

#[derive(Deserialize)]
struct EmbedResponse {
    embedding: EmbeddingValues,
}

#[derive(Deserialize)]
struct EmbeddingValues {
    values: Vec<f32>,
}

#[derive(Serialize)]
struct GenerateRequest {
    contents: Vec<Content>,
}

#[derive(Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Deserialize)]
struct Candidate {
    content: Option<Content>,
}

fn user_content(text: &str) -> Content {
    Content {
        role: Some("user".into()),
        parts: vec![Part {
            text: text.to_string(),
        }],
    }
}

#[async_trait]
impl EmbeddingProvider for GeminiProvider {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        #[cfg(feature = "metrics")]
        let started = std::time::Instant::now();

        let req = EmbedRequest {
            model: format!("models/{}", self.embedding_model),
            content: Content {
                role: None,
                parts: vec![Part {
                    text: text.to_string(),
                }],
            },
        };
        let result = self
            .post::<_, EmbedResponse>(&self.embedding_model, "embedContent", &req)
            .await
            .map(|r| r.embedding.values);

        #[cfg(feature = "metrics")]
        crate::record_call("gemini", "embed", started, result.is_ok());

        let values = result?;
        if values.is_empty() {
            bail!("Gemini returned an empty embedding");
        }
        debug!(dims = values.len(), "embedded text");
        Ok(values)
    }

    fn model_name(&self) -> &str {
        &self.embedding_model
    }
}

#[async_trait]
impl GenerationProvider for GeminiProvider {
    async fn generate(&self, prompt: &str) -> Result<String> {
        #[cfg(feature = "metrics")]
        let started = std::time::Instant::now();

        let req = GenerateRequest {
            contents: vec![user_content(prompt)],
        };
        let result = self
            .post::<_, GenerateResponse>(&self.generation_model, "generateContent", &req)
            .await;

        #[cfg(feature = "metrics")]
        crate::record_call("gemini", "generate", started, result.is_ok());

        let text: String = result?
            .candidates
            .into_iter()
            .next()
            .and_then(|c| c.content)
            .map(|c| c.parts.into_iter().map(|p| p.text).collect())
            .ok_or_else(|| anyhow!("Gemini returned no candidates"))?;
        Ok(text)
    }

    fn model_name(&self) -> &str {
        &self.generation_model
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, mockito::Matcher};

    fn provider(server: &mockito::Server, key: Option<&str>) -> GeminiProvider {
        GeminiProvider::new(
            key.map(|k| Secret::new(k.to_string())),
            "text-embedding-004".into(),
            "gemini-2.5-flash".into(),
            Duration::from_secs(5),
        )
        .unwrap()
        .with_base_url(server.url())
    }

    #[tokio::test]
    async fn embed_sends_key_and_parses_values() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1beta/models/text-embedding-004:embedContent")
            .match_header("x-goog-api-key", "k1")
            .match_body(Matcher::PartialJson(serde_json::json!({
                "model": "models/text-embedding-004",
                "content": { "parts": [{ "text": "jam buka?" }] }
            })))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"embedding":{"values":[0.25,0.5,0.75]}}"#)
            .create_async()
            .await;

        let values = provider(&server, Some("k1")).embed("jam buka?").await.unwrap();
        assert_eq!(values, vec![0.25, 0.5, 0.75]);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn generate_joins_candidate_parts() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/v1beta/models/gemini-2.5-flash:generateContent")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                serde_json::json!({
                    "candidates": [{
                        "content": { "role": "model", "parts": [{ "text": "Buka " }, { "text": "jam 9." }] }
                    }]
                })
                .to_string(),
            )
            .create_async()
            .await;

        let text = provider(&server, Some("k1")).generate("prompt").await.unwrap();
        assert_eq!(text, "Buka jam 9.");
    }

    #[tokio::test]
    async fn http_errors_carry_status() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/v1beta/models/gemini-2.5-flash:generateContent")
            .with_status(429)
            .with_body("quota exceeded")
            .create_async()
            .await;

        let err = provider(&server, Some("k1")).generate("prompt").await.unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("429"), "{msg}");
        assert!(msg.contains("quota exceeded"), "{msg}");
    }

    #[tokio::test]
    async fn missing_key_fails_without_request() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", Matcher::Any)
            .expect(0)
            .create_async()
            .await;

        assert!(provider(&server, None).embed("x").await.is_err());
        mock.assert_async().await;
    }
}
