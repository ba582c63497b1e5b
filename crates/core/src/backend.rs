use serde_json::Value;
use std::error::Error as StdError;
use std::fmt;

/// One request/response cycle against a generative-text backend.
///
/// The model identifier, sampling parameters, and per-attempt timeout are
/// configuration of the concrete backend (see the adapters crate); the
/// request carries only what changes per call.
#[derive(Clone, Debug)]
pub struct GenerationRequest {
    pub system_instruction: String,
    pub user_content: String,
    /// JSON schema the response must conform to. Backends without native
    /// structured-output support embed it into the instruction text.
    pub response_schema: Option<Value>,
}

impl GenerationRequest {
    pub fn new(system_instruction: impl Into<String>, user_content: impl Into<String>) -> Self {
        Self {
            system_instruction: system_instruction.into(),
            user_content: user_content.into(),
            response_schema: None,
        }
    }

    pub fn with_schema(mut self, schema: Value) -> Self {
        self.response_schema = Some(schema);
        self
    }
}

#[derive(Debug)]
pub struct BackendError {
    inner: Box<dyn StdError + Send + Sync>,
}

impl BackendError {
    pub fn new<E>(error: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self {
            inner: Box::new(error),
        }
    }

    pub fn into_inner(self) -> Box<dyn StdError + Send + Sync> {
        self.inner
    }

    pub fn as_inner(&self) -> &(dyn StdError + Send + Sync + 'static) {
        self.inner.as_ref()
    }
}

impl fmt::Display for BackendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.inner)
    }
}

impl StdError for BackendError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        Some(self.inner.as_ref())
    }
}

pub trait GenerativeBackend: Send + Sync {
    fn generate(&self, request: &GenerationRequest) -> Result<String, BackendError>;
}

/// Trims a model response down to the JSON document it carries.
///
/// Models routinely wrap structured output in Markdown code fences or add a
/// sentence of commentary around it; callers parse the returned slice instead
/// of the raw text.
pub fn extract_json(text: &str) -> &str {
    let trimmed = text.trim();
    let inner = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .map(str::trim_start)
        .unwrap_or(trimmed);
    let inner = inner
        .strip_suffix("```")
        .map(str::trim_end)
        .unwrap_or(inner);

    match (inner.find(['{', '[']), inner.rfind(['}', ']'])) {
        (Some(start), Some(end)) if end >= start => &inner[start..=end],
        _ => inner,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_json_strips_code_fences() {
        let raw = "```json\n{\"episodes\": []}\n```";
        assert_eq!(extract_json(raw), "{\"episodes\": []}");
    }

    #[test]
    fn extract_json_drops_surrounding_prose() {
        let raw = "好的，以下是结果：\n{\"content\": \"大纲\"}\n希望有帮助。";
        assert_eq!(extract_json(raw), "{\"content\": \"大纲\"}");
    }

    #[test]
    fn extract_json_keeps_plain_document() {
        assert_eq!(extract_json("{\"a\": 1}"), "{\"a\": 1}");
    }

    #[test]
    fn extract_json_passes_through_non_json() {
        assert_eq!(extract_json("纯文本响应"), "纯文本响应");
    }
}
