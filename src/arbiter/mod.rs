//! Selection Arbiter
//!
//! Asks a chat model to pick one technician from the shortlist. Any failure
//! (timeout, transport, empty or malformed output, an id outside the shortlist)
//! falls back to the nearest technician.

mod provider;

pub use provider::{LLMProvider, OllamaProvider, OpenAICompatibleProvider};

use anyhow::Result;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::config::{DispatchConfig, LlmBackend};
use crate::models::{ArbiterFailure, RankedShortlist, Selection, SelectionSource};

pub const FALLBACK_JUSTIFICATION: &str = "model unavailable — assigned nearest";
pub const DEFAULT_REASON: &str = "Chosen based on proximity";

#[derive(Debug, Deserialize)]
struct ModelChoice {
    id: Value,
    #[serde(default)]
    reason: Option<String>,
}

pub struct SelectionArbiter {
    provider: Arc<dyn LLMProvider>,
    model: String,
    timeout: Duration,
}

impl SelectionArbiter {
    pub fn new(provider: Arc<dyn LLMProvider>, model: impl Into<String>, timeout: Duration) -> Self {
        Self {
            provider,
            model: model.into(),
            timeout,
        }
    }

    pub fn from_config(config: &DispatchConfig) -> Result<Self> {
        let provider: Arc<dyn LLMProvider> = match config.llm_backend {
            LlmBackend::OpenAiCompatible => Arc::new(
                OpenAICompatibleProvider::new(config.llm_base_url.clone(), config.llm_api_key.clone())
                    .with_timeout(config.llm_timeout)?
                    .with_temperature(config.llm_temperature),
            ),
            LlmBackend::Ollama => Arc::new(OllamaProvider::from_url(&config.llm_base_url)?),
        };
        Ok(Self::new(provider, config.llm_model.clone(), config.llm_timeout))
    }

    pub fn build_prompt(shortlist: &RankedShortlist) -> String {
        let candidates: Vec<Value> = shortlist
            .entries()
            .iter()
            .map(|e| json!({
                "id": e.technician.id,
                "name": e.technician.name,
                "distance_km": e.distance_km,
            }))
            .collect();
        let listing = serde_json::to_string_pretty(&candidates).unwrap_or_default();

        format!(
            "You are a smart dispatcher.\n\
             Here are the {} nearest technicians to a customer based on driving distance.\n\
             Choose the best technician and write the reason.\n\n\
             Technicians:\n{}\n\n\
             Respond with a single JSON object and nothing else:\n\
             {{\"id\": <best_id>, \"reason\": \"<why>\"}}\n",
            shortlist.len(),
            listing
        )
    }

    /// Never fails: model problems resolve to the nearest technician.
    pub async fn choose(&self, shortlist: &RankedShortlist) -> Selection {
        match self.ask(shortlist).await {
            Ok(selection) => {
                info!(technician_id = selection.technician_id, "Model selected technician");
                selection
            }
            Err(failure) => {
                let nearest = shortlist.nearest();
                warn!(
                    technician_id = nearest.technician.id,
                    reason = %failure,
                    "Arbiter fell back to nearest technician"
                );
                Selection {
                    technician_id: nearest.technician.id,
                    justification: FALLBACK_JUSTIFICATION.to_string(),
                    source: SelectionSource::Fallback(failure),
                }
            }
        }
    }

    async fn ask(&self, shortlist: &RankedShortlist) -> std::result::Result<Selection, ArbiterFailure> {
        let prompt = Self::build_prompt(shortlist);
        let call = self.provider.generate(&self.model, prompt, None);

        let content = match tokio::time::timeout(self.timeout, call).await {
            Err(_) => return Err(ArbiterFailure::Timeout),
            Ok(Err(e)) => return Err(ArbiterFailure::Unavailable(format!("{:#}", e))),
            Ok(Ok(content)) => content,
        };

        let choice = parse_choice(&content)?;
        let id = choice_id(&choice.id)
            .ok_or_else(|| ArbiterFailure::MalformedResponse(format!("id is not an integer: {}", choice.id)))?;

        if shortlist.find(id).is_none() {
            return Err(ArbiterFailure::UnknownCandidate(id));
        }

        let justification = choice
            .reason
            .map(|r| r.trim().to_string())
            .filter(|r| !r.is_empty())
            .unwrap_or_else(|| DEFAULT_REASON.to_string());

        Ok(Selection {
            technician_id: id,
            justification,
            source: SelectionSource::Model,
        })
    }
}

/// Parses the model's reply. Prose or code fences around one JSON object are tolerated.
fn parse_choice(content: &str) -> std::result::Result<ModelChoice, ArbiterFailure> {
    let trimmed = content.trim();
    if trimmed.is_empty() {
        return Err(ArbiterFailure::EmptyResponse);
    }

    let object = match (trimmed.find('{'), trimmed.rfind('}')) {
        (Some(start), Some(end)) if start < end => &trimmed[start..=end],
        _ => return Err(ArbiterFailure::MalformedResponse("no JSON object in reply".to_string())),
    };

    serde_json::from_str(object).map_err(|e| ArbiterFailure::MalformedResponse(e.to_string()))
}

fn choice_id(id: &Value) -> Option<i64> {
    match id {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Availability, ProviderTag, ShortlistEntry, Technician};
    use async_trait::async_trait;

    struct ScriptedProvider {
        reply: Result<String, String>,
        delay: Duration,
    }

    impl ScriptedProvider {
        fn replying(reply: &str) -> Arc<Self> {
            Arc::new(Self { reply: Ok(reply.to_string()), delay: Duration::ZERO })
        }

        fn failing(error: &str) -> Arc<Self> {
            Arc::new(Self { reply: Err(error.to_string()), delay: Duration::ZERO })
        }
    }

    #[async_trait]
    impl LLMProvider for ScriptedProvider {
        async fn generate(&self, _model: &str, _prompt: String, _system: Option<String>) -> anyhow::Result<String> {
            tokio::time::sleep(self.delay).await;
            self.reply.clone().map_err(|e| anyhow::anyhow!(e))
        }
    }

    fn shortlist() -> RankedShortlist {
        let entry = |id: i64, km: f64| ShortlistEntry {
            technician: Technician {
                id,
                name: format!("Tech {}", id),
                latitude: Some(0.0),
                longitude: Some(km),
                availability: Availability::Free,
                assigned_customer: None,
            },
            distance_km: km,
            provider: ProviderTag::GeometricFallback,
            failures: vec![],
        };
        RankedShortlist::new(vec![entry(7, 1.1), entry(3, 5.0), entry(9, 20.0)], vec![], vec![]).unwrap()
    }

    fn arbiter(provider: Arc<dyn LLMProvider>) -> SelectionArbiter {
        SelectionArbiter::new(provider, "test-model", Duration::from_secs(5))
    }

    #[tokio::test]
    async fn test_model_choice_is_honoured() {
        let arbiter = arbiter(ScriptedProvider::replying(r#"{"id": 3, "reason": "Knows the area"}"#));
        let selection = arbiter.choose(&shortlist()).await;
        assert_eq!(selection.technician_id, 3);
        assert_eq!(selection.justification, "Knows the area");
        assert_eq!(selection.source, SelectionSource::Model);
    }

    #[tokio::test]
    async fn test_fenced_reply_and_string_id_are_accepted() {
        let arbiter = arbiter(ScriptedProvider::replying("Sure!\n```json\n{\"id\": \"9\"}\n```"));
        let selection = arbiter.choose(&shortlist()).await;
        assert_eq!(selection.technician_id, 9);
        assert_eq!(selection.justification, DEFAULT_REASON);
    }

    #[tokio::test]
    async fn test_unreachable_model_falls_back_to_nearest() {
        let arbiter = arbiter(ScriptedProvider::failing("connection refused"));
        let selection = arbiter.choose(&shortlist()).await;
        assert_eq!(selection.technician_id, 7);
        assert_eq!(selection.justification, FALLBACK_JUSTIFICATION);
        assert!(matches!(selection.source, SelectionSource::Fallback(ArbiterFailure::Unavailable(_))));
    }

    #[tokio::test]
    async fn test_real_http_endpoint_down_falls_back() {
        let provider = OpenAICompatibleProvider::new("http://127.0.0.1:9".into(), None)
            .with_timeout(Duration::from_secs(2))
            .unwrap();
        let selection = arbiter(Arc::new(provider)).choose(&shortlist()).await;
        assert_eq!(selection.technician_id, 7);
        assert!(selection.is_fallback());
    }

    #[tokio::test]
    async fn test_id_outside_shortlist_falls_back() {
        let arbiter = arbiter(ScriptedProvider::replying(r#"{"id": 42, "reason": "best"}"#));
        let selection = arbiter.choose(&shortlist()).await;
        assert_eq!(selection.technician_id, 7);
        assert_eq!(selection.source, SelectionSource::Fallback(ArbiterFailure::UnknownCandidate(42)));
    }

    #[tokio::test]
    async fn test_empty_and_malformed_replies_fall_back() {
        let empty = arbiter(ScriptedProvider::replying("  \n")).choose(&shortlist()).await;
        assert_eq!(empty.source, SelectionSource::Fallback(ArbiterFailure::EmptyResponse));

        let prose = arbiter(ScriptedProvider::replying("Technician 3 is best")).choose(&shortlist()).await;
        assert_eq!(prose.technician_id, 7);
        assert!(matches!(prose.source, SelectionSource::Fallback(ArbiterFailure::MalformedResponse(_))));
    }

    #[tokio::test]
    async fn test_slow_model_times_out() {
        let provider = Arc::new(ScriptedProvider {
            reply: Ok(r#"{"id": 3}"#.to_string()),
            delay: Duration::from_secs(30),
        });
        let arbiter = SelectionArbiter::new(provider, "m", Duration::from_millis(50));
        let selection = arbiter.choose(&shortlist()).await;
        assert_eq!(selection.technician_id, 7);
        assert_eq!(selection.source, SelectionSource::Fallback(ArbiterFailure::Timeout));
    }

    #[test]
    fn test_prompt_lists_every_candidate() {
        let prompt = SelectionArbiter::build_prompt(&shortlist());
        assert!(prompt.contains("\"id\": 7"));
        assert!(prompt.contains("Tech 9"));
        assert!(prompt.contains("\"reason\""));
    }

    #[tokio::test]
    async fn test_ollama_backend_uses_configured_base_url() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "model": "llama3",
                "created_at": "2026-01-01T00:00:00Z",
                "message": { "role": "assistant", "content": "{\"id\": 9, \"reason\": \"on site\"}", "tool_calls": [] },
                "done": true,
                "total_duration": 1,
                "load_duration": 1,
                "prompt_eval_count": 1,
                "prompt_eval_duration": 1,
                "eval_count": 1,
                "eval_duration": 1
            })))
            .expect(1)
            .mount(&server)
            .await;

        let config = DispatchConfig {
            llm_backend: LlmBackend::Ollama,
            llm_base_url: server.uri(),
            llm_model: "llama3".into(),
            ..DispatchConfig::default()
        };
        let selection = SelectionArbiter::from_config(&config).unwrap().choose(&shortlist()).await;
        assert_eq!(selection.technician_id, 9);
        assert_eq!(selection.source, SelectionSource::Model);
    }
}
