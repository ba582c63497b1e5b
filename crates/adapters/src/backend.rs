use std::time::Duration;

use log::warn;
use reqwest::blocking::Client;
use reqwest::header::{self, HeaderValue};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use drama_core::{
    BackendError, CancelToken, Config, GenerationRequest, GenerativeBackend, LlmConfig,
};

use crate::base_url::normalize_base_url;
use crate::error::AdapterError;
use crate::retry::{call_with_retry, RetryConfig};

const DEFAULT_GEMINI_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";
const DEFAULT_GEMINI_MODEL: &str = "gemini-3-pro-preview";

/// Cross-cutting knobs shared by every backend: the retry envelope and the
/// caller's cancellation token.
#[derive(Clone, Debug, Default)]
pub struct BackendOptions {
    pub retry: RetryConfig,
    pub cancel: CancelToken,
}

impl BackendOptions {
    pub fn new(retry: RetryConfig, cancel: CancelToken) -> Self {
        Self { retry, cancel }
    }
}

pub fn create_backend(
    config: &Config,
    profile_name: &str,
    options: BackendOptions,
) -> Result<Box<dyn GenerativeBackend>, AdapterError> {
    let profile = config.get_llm_profile(profile_name).ok_or_else(|| {
        AdapterError::InvalidConfig(format!("unknown LLM profile `{}`", profile_name))
    })?;
    create_backend_from_profile(profile, options)
}

pub fn create_backend_from_profile(
    profile: &LlmConfig,
    options: BackendOptions,
) -> Result<Box<dyn GenerativeBackend>, AdapterError> {
    let fmt = profile.interface_format.trim().to_lowercase();
    let timeout = profile.timeout.max(1);

    match fmt.as_str() {
        "gemini" => Ok(Box::new(GeminiBackend::new(
            profile.api_key.clone(),
            &profile.base_url,
            &profile.model_name,
            profile.max_tokens,
            profile.temperature,
            timeout,
            options,
        )?)),
        "openai" => Ok(Box::new(OpenAiCompatibleBackend::new(
            resolve_base_url(&profile.base_url, "https://api.openai.com/v1"),
            optional_string(&profile.api_key),
            profile.model_name.clone(),
            profile.max_tokens,
            profile.temperature,
            timeout,
            options,
        )?)),
        "deepseek" => Ok(Box::new(OpenAiCompatibleBackend::new(
            resolve_base_url(&profile.base_url, "https://api.deepseek.com/v1"),
            optional_string(&profile.api_key),
            profile.model_name.clone(),
            profile.max_tokens,
            profile.temperature,
            timeout,
            options,
        )?)),
        "ollama" => Ok(Box::new(OpenAiCompatibleBackend::new(
            resolve_base_url(&profile.base_url, "http://localhost:11434/v1"),
            optional_string(&profile.api_key),
            profile.model_name.clone(),
            profile.max_tokens,
            profile.temperature,
            timeout,
            options,
        )?)),
        other => Err(AdapterError::InvalidConfig(format!(
            "unknown interface_format: {}",
            other
        ))),
    }
}

fn optional_string(value: &str) -> Option<String> {
    if value.trim().is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

fn resolve_base_url(base_url: &str, default: &str) -> String {
    let raw = if base_url.trim().is_empty() {
        default.to_string()
    } else {
        base_url.to_string()
    };
    normalize_base_url(&raw)
}

/// Native Gemini backend. Structured output goes through the API's
/// `responseMimeType`/`responseSchema` support instead of prompt text.
pub struct GeminiBackend {
    client: Client,
    url: String,
    temperature: f32,
    max_tokens: u32,
    retry: RetryConfig,
    cancel: CancelToken,
}

impl GeminiBackend {
    pub fn new(
        api_key: String,
        base_url: &str,
        model_name: &str,
        max_tokens: u32,
        temperature: f32,
        timeout: u64,
        options: BackendOptions,
    ) -> Result<Self, AdapterError> {
        if api_key.trim().is_empty() {
            return Err(AdapterError::InvalidConfig(
                "Gemini api_key must not be empty".to_string(),
            ));
        }

        let base = if base_url.trim().is_empty() {
            DEFAULT_GEMINI_BASE.to_string()
        } else {
            base_url.trim().trim_end_matches('/').to_string()
        };
        let model = if model_name.trim().is_empty() {
            DEFAULT_GEMINI_MODEL
        } else {
            model_name.trim()
        };

        let client = Client::builder()
            .timeout(Duration::from_secs(timeout))
            .build()?;

        Ok(Self {
            client,
            url: format!("{base}/models/{model}:generateContent?key={api_key}"),
            temperature,
            max_tokens,
            retry: options.retry,
            cancel: options.cancel,
        })
    }

    fn generate_once(&self, request: &GenerationRequest) -> Result<String, AdapterError> {
        let body = build_gemini_body(
            request,
            self.max_tokens,
            self.temperature,
        );

        let response = self.client.post(&self.url).json(&body).send()?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().unwrap_or_default();
            return Err(AdapterError::HttpStatus { status, body });
        }

        let parsed: GeminiResponse = response.json()?;
        collect_gemini_text(parsed)
    }
}

impl GenerativeBackend for GeminiBackend {
    fn generate(&self, request: &GenerationRequest) -> Result<String, BackendError> {
        call_with_retry(|| self.generate_once(request), &self.retry, &self.cancel)
            .map_err(BackendError::new)
    }
}

/// Chat-completions backend for OpenAI-compatible endpoints (OpenAI,
/// DeepSeek, Ollama). These have no reliable structured-output mode, so the
/// response schema is spelled out in the system message and the caller
/// parses defensively.
pub struct OpenAiCompatibleBackend {
    client: Client,
    url: String,
    api_key: Option<String>,
    model_name: String,
    max_tokens: Option<u32>,
    temperature: f32,
    retry: RetryConfig,
    cancel: CancelToken,
}

impl OpenAiCompatibleBackend {
    pub fn new(
        base_url: String,
        api_key: Option<String>,
        model_name: String,
        max_tokens: u32,
        temperature: f32,
        timeout: u64,
        options: BackendOptions,
    ) -> Result<Self, AdapterError> {
        if base_url.trim().is_empty() {
            return Err(AdapterError::InvalidConfig(
                "base_url must not be empty".to_string(),
            ));
        }
        if model_name.trim().is_empty() {
            return Err(AdapterError::InvalidConfig(
                "model_name must not be empty".to_string(),
            ));
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(timeout))
            .build()?;

        Ok(Self {
            client,
            url: format!("{}/chat/completions", base_url.trim_end_matches('/')),
            api_key,
            model_name,
            max_tokens: if max_tokens == 0 {
                None
            } else {
                Some(max_tokens)
            },
            temperature,
            retry: options.retry,
            cancel: options.cancel,
        })
    }

    fn generate_once(&self, request: &GenerationRequest) -> Result<String, AdapterError> {
        let system = compose_instruction(request);
        let body = ChatCompletionRequest {
            model: Some(self.model_name.as_str()),
            messages: vec![
                ChatMessageRequest {
                    role: "system",
                    content: &system,
                },
                ChatMessageRequest {
                    role: "user",
                    content: &request.user_content,
                },
            ],
            max_tokens: self.max_tokens,
            temperature: Some(self.temperature),
        };

        let mut http = self.client.post(&self.url).header(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        if let Some(key) = &self.api_key {
            if !key.is_empty() {
                http = http.bearer_auth(key);
            }
        }

        let response = http.json(&body).send()?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().unwrap_or_default();
            return Err(AdapterError::HttpStatus { status, body });
        }

        let parsed: ChatCompletionResponse = response.json()?;
        extract_choice_content(parsed).ok_or(AdapterError::EmptyResponse)
    }
}

impl GenerativeBackend for OpenAiCompatibleBackend {
    fn generate(&self, request: &GenerationRequest) -> Result<String, BackendError> {
        call_with_retry(|| self.generate_once(request), &self.retry, &self.cancel)
            .map_err(BackendError::new)
    }
}

/// System text with the response schema spliced in for backends that cannot
/// enforce one natively.
fn compose_instruction(request: &GenerationRequest) -> String {
    match &request.response_schema {
        Some(schema) => format!(
            "{}\n\n【输出格式】：只输出一个符合以下 JSON Schema 的 JSON 对象，不要输出任何其他文字、注释或 Markdown 代码块。\n{}",
            request.system_instruction, schema
        ),
        None => request.system_instruction.clone(),
    }
}

#[derive(Serialize)]
struct ChatCompletionRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    model: Option<&'a str>,
    messages: Vec<ChatMessageRequest<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Serialize)]
struct ChatMessageRequest<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    #[serde(default)]
    message: Option<ChatMessage>,
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
}

fn extract_choice_content(response: ChatCompletionResponse) -> Option<String> {
    for choice in response.choices {
        if let Some(message) = choice.message {
            if let Some(content) = message.content {
                if !content.trim().is_empty() {
                    return Some(content);
                }
            }
        }
        if let Some(content) = choice.content {
            if !content.trim().is_empty() {
                return Some(content);
            }
        }
    }
    None
}

#[derive(Serialize)]
struct GeminiRequestBody<'a> {
    #[serde(rename = "systemInstruction")]
    system_instruction: GeminiContentBlock<'a>,
    contents: Vec<GeminiContentBlock<'a>>,
    #[serde(rename = "generationConfig")]
    generation_config: GeminiGenerationConfig<'a>,
}

#[derive(Serialize)]
struct GeminiContentBlock<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<&'static str>,
    parts: Vec<GeminiRequestPart<'a>>,
}

#[derive(Serialize)]
struct GeminiRequestPart<'a> {
    text: &'a str,
}

#[derive(Serialize)]
struct GeminiGenerationConfig<'a> {
    #[serde(rename = "maxOutputTokens")]
    max_output_tokens: u32,
    temperature: f32,
    #[serde(rename = "responseMimeType")]
    #[serde(skip_serializing_if = "Option::is_none")]
    response_mime_type: Option<&'static str>,
    #[serde(rename = "responseSchema")]
    #[serde(skip_serializing_if = "Option::is_none")]
    response_schema: Option<&'a Value>,
}

fn build_gemini_body<'a>(
    request: &'a GenerationRequest,
    max_tokens: u32,
    temperature: f32,
) -> GeminiRequestBody<'a> {
    GeminiRequestBody {
        system_instruction: GeminiContentBlock {
            role: None,
            parts: vec![GeminiRequestPart {
                text: &request.system_instruction,
            }],
        },
        contents: vec![GeminiContentBlock {
            role: Some("user"),
            parts: vec![GeminiRequestPart {
                text: &request.user_content,
            }],
        }],
        generation_config: GeminiGenerationConfig {
            max_output_tokens: max_tokens,
            temperature,
            response_mime_type: request
                .response_schema
                .as_ref()
                .map(|_| "application/json"),
            response_schema: request.response_schema.as_ref(),
        },
    }
}

#[derive(Debug, Deserialize)]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
}

#[derive(Debug, Deserialize)]
struct GeminiCandidate {
    #[serde(default)]
    content: Option<GeminiContent>,
    #[serde(rename = "finishReason")]
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GeminiContent {
    #[serde(default)]
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum GeminiPart {
    Text { text: String },
    Other(Value),
}

fn collect_gemini_text(response: GeminiResponse) -> Result<String, AdapterError> {
    for candidate in response.candidates {
        if let Some(reason) = candidate.finish_reason.as_deref() {
            match reason {
                "MAX_TOKENS" => warn!("Gemini response truncated due to max_tokens limit"),
                "SAFETY" => warn!("Gemini response blocked by safety filters"),
                "RECITATION" => warn!("Gemini response blocked due to recitation concerns"),
                _ => {}
            }
        }

        if let Some(content) = candidate.content {
            let mut text = String::new();
            for part in content.parts {
                if let GeminiPart::Text { text: part_text } = part {
                    text.push_str(&part_text);
                }
            }
            if !text.trim().is_empty() {
                return Ok(text);
            }
        }
    }

    Err(AdapterError::EmptyResponse)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn schema_request() -> GenerationRequest {
        GenerationRequest::new("系统指令", "用户内容")
            .with_schema(json!({ "type": "object" }))
    }

    #[test]
    fn gemini_body_enables_structured_output_with_schema() {
        let request = schema_request();
        let body = build_gemini_body(&request, 8192, 0.7);
        let value = serde_json::to_value(&body).unwrap();
        assert_eq!(
            value["generationConfig"]["responseMimeType"],
            "application/json"
        );
        assert_eq!(value["generationConfig"]["responseSchema"]["type"], "object");
        assert_eq!(value["systemInstruction"]["parts"][0]["text"], "系统指令");
        assert_eq!(value["contents"][0]["role"], "user");
    }

    #[test]
    fn gemini_body_omits_schema_fields_without_schema() {
        let request = GenerationRequest::new("系统指令", "用户内容");
        let value = serde_json::to_value(build_gemini_body(&request, 1024, 0.5)).unwrap();
        assert!(value["generationConfig"]
            .as_object()
            .unwrap()
            .get("responseMimeType")
            .is_none());
    }

    #[test]
    fn compose_instruction_embeds_schema_for_chat_backends() {
        let composed = compose_instruction(&schema_request());
        assert!(composed.starts_with("系统指令"));
        assert!(composed.contains("【输出格式】"));
        assert!(composed.contains("\"type\":\"object\""));

        let plain = compose_instruction(&GenerationRequest::new("系统指令", "内容"));
        assert_eq!(plain, "系统指令");
    }

    #[test]
    fn gemini_text_collection_joins_parts() {
        let response: GeminiResponse = serde_json::from_value(json!({
            "candidates": [{
                "content": { "parts": [{ "text": "{\"a\":" }, { "text": "1}" }] },
                "finishReason": "STOP"
            }]
        }))
        .unwrap();
        assert_eq!(collect_gemini_text(response).unwrap(), "{\"a\":1}");
    }

    #[test]
    fn empty_gemini_candidates_are_an_error() {
        let response: GeminiResponse = serde_json::from_value(json!({ "candidates": [] })).unwrap();
        assert!(matches!(
            collect_gemini_text(response),
            Err(AdapterError::EmptyResponse)
        ));
    }

    #[test]
    fn chat_choice_content_falls_back_to_bare_content() {
        let response: ChatCompletionResponse = serde_json::from_value(json!({
            "choices": [{ "content": "直接内容" }]
        }))
        .unwrap();
        assert_eq!(extract_choice_content(response).unwrap(), "直接内容");
    }

    #[test]
    fn factory_rejects_unknown_interface_format() {
        let profile = LlmConfig {
            interface_format: "telepathy".into(),
            ..LlmConfig::default()
        };
        let err = create_backend_from_profile(&profile, BackendOptions::default())
            .err()
            .unwrap();
        assert!(matches!(err, AdapterError::InvalidConfig(_)));
    }

    #[test]
    fn gemini_requires_api_key_and_defaults_model() {
        let missing_key = LlmConfig {
            interface_format: "gemini".into(),
            ..LlmConfig::default()
        };
        assert!(create_backend_from_profile(&missing_key, BackendOptions::default()).is_err());

        let backend = GeminiBackend::new(
            "key-123".into(),
            "",
            "",
            8192,
            0.7,
            300,
            BackendOptions::default(),
        )
        .unwrap();
        assert!(backend.url.contains("gemini-3-pro-preview"));
        assert!(backend.url.starts_with(DEFAULT_GEMINI_BASE));
    }
}
