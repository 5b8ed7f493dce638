// AI Provider Service
// Remote tone conversion and ambiguous-case decisions over OpenAI-compatible
// and Anthropic chat APIs

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{info, warn};

use crate::models::{DecideAction, DecideResponse};
use crate::services::config_store::{AppConfig, ConfigStore};

const OPENAI_DEFAULT_URL: &str = "https://api.openai.com/v1/chat/completions";
const DEEPSEEK_DEFAULT_URL: &str = "https://api.deepseek.com/chat/completions";
const GLM_DEFAULT_URL: &str = "https://open.bigmodel.cn/api/paas/v4/chat/completions";
const ANTHROPIC_DEFAULT_URL: &str = "https://api.anthropic.com/v1/messages";

const MAX_ATTEMPTS: u32 = 3;
const ATTEMPT_TIMEOUT_SECS: u64 = 8;
const MIN_ATTEMPT_TIMEOUT_MS: u64 = 500;
const BACKOFF_STEP_MS: u64 = 400;
const MAX_TOKENS: i32 = 512;

const CONVERT_PROMPT: &str = "You rewrite chat messages before they are sent. Rewrite the user's \
message into a polite, professional tone in the same language. Remove profanity, insults and \
sexual content but keep the intent. Reply with the rewritten message only, no quotes or notes.";

const DECIDE_PROMPT: &str = "You review chat messages before they are sent. Decide whether the \
message is acceptable as written or should be rewritten into a polite, professional tone. Reply \
with a json object only: {\"action\": \"send\"} or {\"action\": \"convert\", \"convertedText\": \
\"<rewritten message in the same language>\"}.";

#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("HTTP request failed: {0}")]
    HttpError(#[from] reqwest::Error),
    #[error("API error: {status} - {message}")]
    ApiError { status: u16, message: String },
    #[error("Missing content in response")]
    MissingContent,
    #[error("JSON parse error: {0}")]
    JsonError(String),
    #[error("API key not configured for {0}")]
    MissingApiKey(String),
    #[error("request timed out after {0}ms")]
    Timeout(u64),
    #[error("tone service unavailable: {0}")]
    Unavailable(String),
}

impl ProviderError {
    /// Transient failures worth another attempt
    pub fn is_retryable(&self) -> bool {
        match self {
            ProviderError::HttpError(_) | ProviderError::Timeout(_) | ProviderError::MissingContent => true,
            ProviderError::ApiError { status, .. } => *status == 429 || *status >= 500,
            ProviderError::JsonError(_) => true,
            ProviderError::MissingApiKey(_) | ProviderError::Unavailable(_) => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderSpec {
    pub name: String,
    pub model: String,
}

pub fn parse_provider(spec: &str) -> ProviderSpec {
    let parts: Vec<&str> = spec.trim().splitn(2, ':').collect();
    if parts.len() == 2 {
        ProviderSpec {
            name: parts[0].to_lowercase(),
            model: parts[1].to_string(),
        }
    } else {
        ProviderSpec {
            name: spec.trim().to_lowercase(),
            model: String::new(),
        }
    }
}

pub fn default_model(provider: &str) -> &'static str {
    match provider {
        "openai" => "gpt-4o-mini",
        "deepseek" => "deepseek-chat",
        "glm" => "glm-4-flash",
        "anthropic" | "claude" => "claude-3-5-haiku-latest",
        _ => "",
    }
}

#[derive(Debug, Clone, Serialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Clone, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    max_tokens: i32,
    temperature: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

#[derive(Debug, Clone, Serialize)]
struct ResponseFormat {
    r#type: String,
}

#[derive(Debug, Clone, Deserialize)]
struct ChatResponse {
    choices: Option<Vec<ChatChoice>>,
}

#[derive(Debug, Clone, Deserialize)]
struct ChatChoice {
    message: Option<ChatMessageResponse>,
}

#[derive(Debug, Clone, Deserialize)]
struct ChatMessageResponse {
    content: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatResult {
    pub content: String,
    pub latency_ms: i64,
}

pub struct ProviderClient {
    client: Client,
    openai_url: String,
    deepseek_url: String,
    glm_url: String,
    anthropic_url: String,
}

impl Default for ProviderClient {
    fn default() -> Self {
        Self::new()
    }
}

impl ProviderClient {
    pub fn new() -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();
        Self::with_client(client)
    }

    pub fn with_proxy(proxy_url: &str) -> Result<Self, ProviderError> {
        let proxy = reqwest::Proxy::all(proxy_url)?;
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .proxy(proxy)
            .build()?;
        Ok(Self::with_client(client))
    }

    fn with_client(client: Client) -> Self {
        Self {
            client,
            openai_url: env::var("OPENAI_API_URL").unwrap_or_else(|_| OPENAI_DEFAULT_URL.to_string()),
            deepseek_url: env::var("DEEPSEEK_API_URL").unwrap_or_else(|_| DEEPSEEK_DEFAULT_URL.to_string()),
            glm_url: env::var("GLM_API_URL").unwrap_or_else(|_| GLM_DEFAULT_URL.to_string()),
            anthropic_url: env::var("ANTHROPIC_API_URL").unwrap_or_else(|_| ANTHROPIC_DEFAULT_URL.to_string()),
        }
    }

    /// Dispatch one completion to the provider named in `spec`. Unknown
    /// providers are accepted as OpenAI-compatible when `base_url` is set.
    pub async fn complete(
        &self,
        spec: &ProviderSpec,
        api_key: &str,
        base_url: Option<&str>,
        system: &str,
        user: &str,
        json_mode: bool,
    ) -> Result<ChatResult, ProviderError> {
        let model = if spec.model.trim().is_empty() {
            default_model(&spec.name)
        } else {
            spec.model.as_str()
        };
        match spec.name.as_str() {
            "anthropic" | "claude" => {
                let url = base_url.unwrap_or(self.anthropic_url.as_str());
                self.call_anthropic_api(url, model, api_key, system, user, MAX_TOKENS)
                    .await
            }
            name => {
                let default_url = match name {
                    "openai" => Some(self.openai_url.as_str()),
                    "deepseek" => Some(self.deepseek_url.as_str()),
                    "glm" => Some(self.glm_url.as_str()),
                    _ => None,
                };
                let url = base_url
                    .or(default_url)
                    .ok_or_else(|| ProviderError::Unavailable(format!("unknown provider {}", name)))?;
                self.call_chat_api(url, model, api_key, system, user, MAX_TOKENS, json_mode)
                    .await
            }
        }
    }

    async fn call_anthropic_api(
        &self,
        url: &str,
        model: &str,
        api_key: &str,
        system: &str,
        user: &str,
        max_tokens: i32,
    ) -> Result<ChatResult, ProviderError> {
        #[derive(Serialize)]
        struct AnthropicRequest {
            model: String,
            max_tokens: i32,
            #[serde(skip_serializing_if = "String::is_empty")]
            system: String,
            messages: Vec<ChatMessage>,
        }

        #[derive(Deserialize)]
        struct AnthropicResponse {
            content: Option<Vec<AnthropicContent>>,
        }

        #[derive(Deserialize)]
        struct AnthropicContent {
            text: Option<String>,
        }

        let request = AnthropicRequest {
            model: model.to_string(),
            max_tokens,
            system: system.to_string(),
            messages: vec![ChatMessage {
                role: "user".to_string(),
                content: user.to_string(),
            }],
        };

        let start = Instant::now();

        let response = self
            .client
            .post(url)
            .header("x-api-key", api_key)
            .header("anthropic-version", "2023-06-01")
            .header("Content-Type", "application/json")
            .json(&request)
            .send()
            .await?;

        let latency_ms = start.elapsed().as_millis() as i64;
        let status = response.status();

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::ApiError {
                status: status.as_u16(),
                message: body,
            });
        }

        let data: AnthropicResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::JsonError(e.to_string()))?;

        let content = data
            .content
            .and_then(|c| c.into_iter().find_map(|part| part.text))
            .filter(|text| !text.trim().is_empty())
            .ok_or(ProviderError::MissingContent)?;

        Ok(ChatResult { content, latency_ms })
    }

    #[allow(clippy::too_many_arguments)]
    async fn call_chat_api(
        &self,
        url: &str,
        model: &str,
        api_key: &str,
        system: &str,
        user: &str,
        max_tokens: i32,
        use_json_format: bool,
    ) -> Result<ChatResult, ProviderError> {
        let request = ChatRequest {
            model: model.to_string(),
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: system.to_string(),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: user.to_string(),
                },
            ],
            max_tokens,
            temperature: 0.2,
            response_format: if use_json_format {
                Some(ResponseFormat {
                    r#type: "json_object".to_string(),
                })
            } else {
                None
            },
        };

        let start = Instant::now();

        let response = self
            .client
            .post(url)
            .header("Authorization", format!("Bearer {}", api_key))
            .header("Content-Type", "application/json")
            .json(&request)
            .send()
            .await?;

        let latency_ms = start.elapsed().as_millis() as i64;
        let status = response.status();

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::ApiError {
                status: status.as_u16(),
                message: body,
            });
        }

        let data: ChatResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::JsonError(e.to_string()))?;

        let content = data
            .choices
            .as_ref()
            .and_then(|c| c.first())
            .and_then(|c| c.message.as_ref())
            .and_then(|m| m.content.clone())
            .filter(|text| !text.trim().is_empty())
            .ok_or(ProviderError::MissingContent)?;

        Ok(ChatResult { content, latency_ms })
    }
}

/// Get API key from environment or config file
pub fn get_api_key(provider: &str, store: Option<&ConfigStore>) -> Option<String> {
    let upper = provider.to_uppercase();
    let mut env_keys = vec![format!("CLEANCHAT_{}_API_KEY", upper)];
    match provider {
        "anthropic" | "claude" => env_keys.push("ANTHROPIC_API_KEY".to_string()),
        _ => env_keys.push(format!("{}_API_KEY", upper)),
    }

    for key in env_keys {
        if let Ok(val) = env::var(&key) {
            let v = val.trim();
            if !v.is_empty() {
                return Some(v.to_string());
            }
        }
    }

    store
        .and_then(|s| s.get_api_key(provider).ok().flatten())
        .map(|k| k.trim().to_string())
        .filter(|k| !k.is_empty())
}

/// Slice the outermost JSON object out of a model reply
pub fn extract_json(content: &str) -> Result<&str, ProviderError> {
    let trimmed = content.trim();
    let start = trimmed
        .find('{')
        .ok_or_else(|| ProviderError::JsonError("No JSON in response".to_string()))?;
    let end = trimmed
        .rfind('}')
        .filter(|end| *end > start)
        .ok_or_else(|| ProviderError::JsonError("Invalid JSON response".to_string()))?;
    Ok(&trimmed[start..=end])
}

pub fn parse_decide_reply(content: &str) -> Result<DecideResponse, ProviderError> {
    let json = extract_json(content)?;
    let mut reply: DecideResponse =
        serde_json::from_str(json).map_err(|e| ProviderError::JsonError(e.to_string()))?;
    reply.converted_text = reply
        .converted_text
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty());
    if reply.action == DecideAction::Convert && reply.converted_text.is_none() {
        return Err(ProviderError::MissingContent);
    }
    Ok(reply)
}

/// Strip wrapping quotes / code fences models like to add
pub fn clean_converted(content: &str) -> Result<String, ProviderError> {
    let mut text = content.trim();
    if let Some(inner) = text.strip_prefix("```") {
        // Drop the info string (```json, ```text) along with the fence
        let body = inner.split_once('\n').map_or(inner, |(_, rest)| rest);
        text = body.strip_suffix("```").unwrap_or(body).trim();
    }
    for (open, close) in [('"', '"'), ('“', '”'), ('\'', '\'')] {
        if text.len() >= 2 && text.starts_with(open) && text.ends_with(close) {
            text = text[open.len_utf8()..text.len() - close.len_utf8()].trim();
        }
    }
    if text.is_empty() {
        return Err(ProviderError::MissingContent);
    }
    Ok(text.to_string())
}

// ============ Tone Service ============

/// Remote collaborator that rewrites or adjudicates risky text
#[async_trait]
pub trait ToneService: Send + Sync {
    async fn convert(&self, text: &str) -> Result<String, ProviderError>;
    async fn decide(&self, text: &str) -> Result<DecideResponse, ProviderError>;
}

/// Always fails; used when no provider is configured
#[derive(Debug, Default)]
pub struct UnavailableToneService;

#[async_trait]
impl ToneService for UnavailableToneService {
    async fn convert(&self, _text: &str) -> Result<String, ProviderError> {
        Err(ProviderError::Unavailable("no provider configured".to_string()))
    }

    async fn decide(&self, _text: &str) -> Result<DecideResponse, ProviderError> {
        Err(ProviderError::Unavailable("no provider configured".to_string()))
    }
}

/// Per-attempt timeout so that every attempt plus the backoff between them
/// fits inside `budget`
pub fn attempt_timeout_within(budget: Duration) -> Duration {
    let backoff_ms: u64 = (1..MAX_ATTEMPTS as u64).map(|a| BACKOFF_STEP_MS * a).sum();
    let per_attempt = budget.as_millis().saturating_sub(backoff_ms as u128) / MAX_ATTEMPTS as u128;
    let per_attempt = u64::try_from(per_attempt).unwrap_or(u64::MAX);
    Duration::from_millis(per_attempt.clamp(MIN_ATTEMPT_TIMEOUT_MS, ATTEMPT_TIMEOUT_SECS * 1000))
}

pub struct LlmToneService {
    client: ProviderClient,
    spec: ProviderSpec,
    api_key: String,
    base_url: Option<String>,
    attempt_timeout: Duration,
}

impl LlmToneService {
    pub fn new(client: ProviderClient, spec: ProviderSpec, api_key: String) -> Self {
        Self {
            client,
            spec,
            api_key,
            base_url: None,
            attempt_timeout: Duration::from_secs(ATTEMPT_TIMEOUT_SECS),
        }
    }

    pub fn with_base_url(mut self, base_url: Option<String>) -> Self {
        self.base_url = base_url.filter(|u| !u.trim().is_empty());
        self
    }

    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = timeout;
        self
    }

    /// Build from config: `provider` overrides `defaultProvider`
    pub fn from_config(
        config: &AppConfig,
        store: Option<&ConfigStore>,
        provider: Option<&str>,
    ) -> Result<Self, ProviderError> {
        let raw = provider
            .map(str::to_string)
            .or_else(|| config.default_provider.clone())
            .filter(|p| !p.trim().is_empty())
            .ok_or_else(|| ProviderError::Unavailable("no provider configured".to_string()))?;
        let mut spec = parse_provider(&raw);

        let provider_config = config.providers.get(&spec.name);
        if spec.model.is_empty() {
            if let Some(model) = provider_config.and_then(|p| p.model.clone()) {
                spec.model = model;
            }
        }
        let api_key = get_api_key(&spec.name, store)
            .or_else(|| config.api_keys.get(&spec.name).cloned())
            .ok_or_else(|| ProviderError::MissingApiKey(spec.name.clone()))?;

        let client = match config.proxy.as_ref().and_then(|p| p.active_url()) {
            Some(url) => ProviderClient::with_proxy(&url)?,
            None => ProviderClient::new(),
        };
        let attempt_timeout = attempt_timeout_within(Duration::from_millis(config.guard.service_timeout_ms));
        info!(
            "[providers] Tone service using {} {} (attempt timeout {}ms)",
            spec.name,
            spec.model,
            attempt_timeout.as_millis()
        );
        Ok(Self::new(client, spec, api_key)
            .with_base_url(provider_config.and_then(|p| p.base_url.clone()))
            .with_attempt_timeout(attempt_timeout))
    }

    async fn call_with_retry(&self, what: &str, system: &str, user: &str, json_mode: bool) -> Result<String, ProviderError> {
        let mut last_err = ProviderError::Timeout(self.attempt_timeout.as_millis() as u64);

        for attempt in 1..=MAX_ATTEMPTS {
            // Timeout applies per attempt, not to the whole retry window
            let fut = self.client.complete(
                &self.spec,
                &self.api_key,
                self.base_url.as_deref(),
                system,
                user,
                json_mode,
            );
            match tokio::time::timeout(self.attempt_timeout, fut).await {
                Ok(Ok(result)) => {
                    info!(
                        "[providers] {} ok provider={} attempt={} latency_ms={}",
                        what, self.spec.name, attempt, result.latency_ms
                    );
                    return Ok(result.content);
                }
                Ok(Err(e)) => {
                    warn!(
                        "[providers] {} error provider={} attempt={} : {}",
                        what, self.spec.name, attempt, e
                    );
                    if !e.is_retryable() {
                        return Err(e);
                    }
                    last_err = e;
                }
                Err(_) => {
                    warn!(
                        "[providers] {} timeout provider={} attempt={} ({}ms)",
                        what,
                        self.spec.name,
                        attempt,
                        self.attempt_timeout.as_millis()
                    );
                    last_err = ProviderError::Timeout(self.attempt_timeout.as_millis() as u64);
                }
            }

            if attempt < MAX_ATTEMPTS {
                let backoff_ms = BACKOFF_STEP_MS * attempt as u64;
                tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
            }
        }

        Err(last_err)
    }
}

#[async_trait]
impl ToneService for LlmToneService {
    async fn convert(&self, text: &str) -> Result<String, ProviderError> {
        let content = self.call_with_retry("convert", CONVERT_PROMPT, text, false).await?;
        clean_converted(&content)
    }

    async fn decide(&self, text: &str) -> Result<DecideResponse, ProviderError> {
        let content = self.call_with_retry("decide", DECIDE_PROMPT, text, true).await?;
        parse_decide_reply(&content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::config_store::ProviderConfig;

    #[test]
    fn test_parse_provider() {
        let spec = parse_provider("GLM:glm-4-plus");
        assert_eq!(spec.name, "glm");
        assert_eq!(spec.model, "glm-4-plus");

        let spec2 = parse_provider("deepseek");
        assert_eq!(spec2.name, "deepseek");
        assert_eq!(spec2.model, "");
    }

    #[test]
    fn test_extract_json() {
        assert_eq!(extract_json("sure: {\"action\":\"send\"} ok").unwrap(), "{\"action\":\"send\"}");
        assert!(extract_json("no json here").is_err());
        assert!(extract_json("} backwards {").is_err());
    }

    #[test]
    fn test_parse_decide_reply() {
        let send = parse_decide_reply("{\"action\": \"send\"}").unwrap();
        assert_eq!(send.action, DecideAction::Send);

        let convert = parse_decide_reply("```json\n{\"action\": \"convert\", \"convertedText\": \" 그만해 주세요 \"}\n```").unwrap();
        assert_eq!(convert.action, DecideAction::Convert);
        assert_eq!(convert.converted_text.as_deref(), Some("그만해 주세요"));

        assert!(matches!(
            parse_decide_reply("{\"action\": \"convert\"}"),
            Err(ProviderError::MissingContent)
        ));
        assert!(matches!(
            parse_decide_reply("{\"action\": \"maybe\"}"),
            Err(ProviderError::JsonError(_))
        ));
    }

    #[test]
    fn test_clean_converted() {
        assert_eq!(clean_converted("  \"Please stop.\" ").unwrap(), "Please stop.");
        assert_eq!(clean_converted("```\n조용히 해 주세요\n```").unwrap(), "조용히 해 주세요");
        assert!(matches!(clean_converted("  \"\" "), Err(ProviderError::MissingContent)));
    }

    #[test]
    fn test_retryable_errors() {
        assert!(ProviderError::Timeout(100).is_retryable());
        assert!(ProviderError::ApiError { status: 503, message: String::new() }.is_retryable());
        assert!(ProviderError::ApiError { status: 429, message: String::new() }.is_retryable());
        assert!(!ProviderError::ApiError { status: 401, message: String::new() }.is_retryable());
        assert!(!ProviderError::MissingApiKey("openai".to_string()).is_retryable());
    }

    #[test]
    fn test_from_config_requires_provider_and_key() {
        let config = AppConfig::default();
        assert!(matches!(
            LlmToneService::from_config(&config, None, None),
            Err(ProviderError::Unavailable(_))
        ));

        let mut config = AppConfig::default();
        config.default_provider = Some("cleanchat-test-provider".to_string());
        assert!(matches!(
            LlmToneService::from_config(&config, None, None),
            Err(ProviderError::MissingApiKey(_))
        ));

        config.api_keys.insert("cleanchat-test-provider".to_string(), "k".to_string());
        config.providers.insert(
            "cleanchat-test-provider".to_string(),
            ProviderConfig {
                enabled: true,
                model: Some("local-model".to_string()),
                base_url: Some("http://127.0.0.1:9/v1/chat/completions".to_string()),
            },
        );
        let service = LlmToneService::from_config(&config, None, None).unwrap();
        assert_eq!(service.spec.model, "local-model");
        assert!(service.base_url.is_some());
        assert_eq!(
            service.attempt_timeout,
            attempt_timeout_within(Duration::from_millis(config.guard.service_timeout_ms))
        );
    }

    #[test]
    fn test_retries_fit_the_service_timeout() {
        // 3 attempts plus 400ms + 800ms of backoff
        let budget = Duration::from_millis(10_000);
        let per_attempt = attempt_timeout_within(budget);
        assert_eq!(per_attempt, Duration::from_millis(2_933));
        assert!(per_attempt * MAX_ATTEMPTS + Duration::from_millis(1_200) <= budget);

        assert_eq!(attempt_timeout_within(Duration::from_secs(600)), Duration::from_secs(ATTEMPT_TIMEOUT_SECS));
        assert_eq!(attempt_timeout_within(Duration::ZERO), Duration::from_millis(MIN_ATTEMPT_TIMEOUT_MS));
    }

    #[tokio::test]
    async fn test_unavailable_service_always_fails() {
        let service = UnavailableToneService;
        assert!(service.convert("x").await.is_err());
        assert!(service.decide("x").await.is_err());
    }

    #[tokio::test]
    async fn test_unknown_provider_without_url_is_unavailable() {
        let client = ProviderClient::new();
        let spec = parse_provider("nowhere:model");
        let result = client.complete(&spec, "key", None, "s", "u", false).await;
        assert!(matches!(result, Err(ProviderError::Unavailable(_))));
    }
}
