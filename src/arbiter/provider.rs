use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::json;
use reqwest::Client;
use std::time::Duration;

#[async_trait]
pub trait LLMProvider: Send + Sync {
    async fn generate(&self, model: &str, prompt: String, system: Option<String>) -> Result<String>;
}

pub struct OllamaProvider {
    client: ollama_rs::Ollama,
}

impl OllamaProvider {
    pub fn new(client: ollama_rs::Ollama) -> Self {
        Self { client }
    }

    /// Client for an Ollama server at `url`, e.g. `http://localhost:11434`.
    pub fn from_url(url: &str) -> Result<Self> {
        let client = ollama_rs::Ollama::try_new(url)
            .with_context(|| format!("Invalid Ollama URL '{}'", url))?;
        Ok(Self::new(client))
    }
}

#[async_trait]
impl LLMProvider for OllamaProvider {
    async fn generate(&self, model: &str, prompt: String, system: Option<String>) -> Result<String> {
        use ollama_rs::generation::chat::{request::ChatMessageRequest, ChatMessage};

        let mut messages = Vec::new();
        if let Some(sys) = system {
            messages.push(ChatMessage::system(sys));
        }
        messages.push(ChatMessage::user(prompt));

        let res = self
            .client
            .send_chat_messages(ChatMessageRequest::new(model.to_string(), messages))
            .await
            .context("Ollama chat request failed")?;

        if res.message.content.trim().is_empty() {
            anyhow::bail!("Ollama returned an empty message");
        }
        Ok(res.message.content)
    }
}

/// Any `/chat/completions` endpoint speaking the OpenAI schema (Groq, vLLM, ...).
pub struct OpenAICompatibleProvider {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    temperature: f32,
}

impl OpenAICompatibleProvider {
    pub fn new(base_url: String, api_key: Option<String>) -> Self {
        Self {
            client: Client::new(),
            base_url,
            api_key,
            temperature: 0.3,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Result<Self> {
        self.client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build chat HTTP client")?;
        Ok(self)
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }
}

#[async_trait]
impl LLMProvider for OpenAICompatibleProvider {
    async fn generate(&self, model: &str, prompt: String, system: Option<String>) -> Result<String> {
        let mut messages = Vec::new();
        if let Some(sys) = system {
            messages.push(json!({ "role": "system", "content": sys }));
        }
        messages.push(json!({ "role": "user", "content": prompt }));

        let body = json!({
            "model": model,
            "messages": messages,
            "temperature": self.temperature,
        });

        let mut request = self.client.post(format!("{}/chat/completions", self.base_url.trim_end_matches('/')))
            .json(&body);

        if let Some(ref key) = self.api_key {
            request = request.bearer_auth(key);
        }

        let res = request.send().await?.error_for_status()?;
        let text = res.text().await?;
        if text.trim().is_empty() {
            anyhow::bail!("Chat completion returned an empty body");
        }

        let json: serde_json::Value = serde_json::from_str(&text)
            .context("Chat completion body is not JSON")?;
        let content = json["choices"][0]["message"]["content"]
            .as_str()
            .context("Failed to parse content from OpenAI response")?;

        Ok(content.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_openai_provider_extracts_message_content() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(header("Authorization", "Bearer key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{ "message": { "role": "assistant", "content": "{\"id\": 2, \"reason\": \"closest\"}" } }]
            })))
            .mount(&server)
            .await;

        let provider = OpenAICompatibleProvider::new(server.uri(), Some("key".into()));
        let content = provider.generate("m", "pick".into(), None).await.unwrap();
        assert_eq!(content, "{\"id\": 2, \"reason\": \"closest\"}");
    }

    #[tokio::test]
    async fn test_openai_provider_surfaces_http_errors() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let provider = OpenAICompatibleProvider::new(server.uri(), None);
        assert!(provider.generate("m", "pick".into(), None).await.is_err());
    }

    #[tokio::test]
    async fn test_openai_provider_rejects_empty_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string("   "))
            .mount(&server)
            .await;

        let provider = OpenAICompatibleProvider::new(server.uri(), None);
        let err = provider.generate("m", "pick".into(), None).await.unwrap_err();
        assert!(err.to_string().contains("empty"));
    }

    fn ollama_reply(content: &str) -> serde_json::Value {
        json!({
            "model": "llama3",
            "created_at": "2026-01-01T00:00:00Z",
            "message": { "role": "assistant", "content": content, "tool_calls": [] },
            "done": true,
            "total_duration": 1,
            "load_duration": 1,
            "prompt_eval_count": 1,
            "prompt_eval_duration": 1,
            "eval_count": 1,
            "eval_duration": 1
        })
    }

    #[tokio::test]
    async fn test_ollama_provider_talks_to_configured_server() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .respond_with(ResponseTemplate::new(200).set_body_json(ollama_reply("{\"id\": 5}")))
            .expect(1)
            .mount(&server)
            .await;

        let provider = OllamaProvider::from_url(&server.uri()).unwrap();
        let content = provider.generate("llama3", "pick".into(), Some("dispatcher".into())).await.unwrap();
        assert_eq!(content, "{\"id\": 5}");
    }

    #[tokio::test]
    async fn test_ollama_provider_rejects_blank_message() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .respond_with(ResponseTemplate::new(200).set_body_json(ollama_reply("  ")))
            .mount(&server)
            .await;

        let provider = OllamaProvider::from_url(&server.uri()).unwrap();
        assert!(provider.generate("llama3", "pick".into(), None).await.is_err());
    }

    #[test]
    fn test_ollama_provider_rejects_bad_url() {
        assert!(OllamaProvider::from_url("not a url").is_err());
    }
}
