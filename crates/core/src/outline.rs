use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

use crate::backend::{extract_json, BackendError, GenerationRequest, GenerativeBackend};
use crate::logging::{LogLevel, LogRecord, LogSink};
use crate::prompts::{PromptError, PromptRegistry};

/// Target audience preset, baked into the outline instruction.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudienceMode {
    #[default]
    Male,
    Female,
}

impl AudienceMode {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Male => "男频",
            Self::Female => "女频",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CharacterBio {
    pub name: String,
    pub gender: String,
    pub age: String,
    pub identity: String,
    pub appearance: String,
    pub growth: String,
    pub motivation: String,
}

/// One contiguous block of episodes generated together. Part of the outline,
/// immutable once produced.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhasePlan {
    #[serde(rename = "phaseIndex")]
    pub phase_index: u32,
    pub episodes: u32,
    pub description: String,
    pub climax: String,
}

/// Whole-series plan: produced once per project, replaced wholesale on
/// regeneration, consumed read-only by every phase generation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Outline {
    pub content: String,
    pub characters: Vec<CharacterBio>,
    #[serde(rename = "phasePlans")]
    pub phase_plans: Vec<PhasePlan>,
}

impl Outline {
    pub fn plan(&self, phase_index: u32) -> Option<&PhasePlan> {
        self.phase_plans
            .iter()
            .find(|plan| plan.phase_index == phase_index)
    }

    pub fn total_episodes(&self) -> u32 {
        self.phase_plans.iter().map(|plan| plan.episodes).sum()
    }
}

#[derive(Clone, Debug)]
pub struct OutlineRequest {
    pub novel_text: String,
    pub mode: AudienceMode,
}

impl OutlineRequest {
    pub fn new(novel_text: impl Into<String>, mode: AudienceMode) -> Self {
        Self {
            novel_text: novel_text.into(),
            mode,
        }
    }
}

#[derive(Debug, Error)]
pub enum OutlineError {
    #[error("渲染大纲提示词失败: {source}")]
    Prompt {
        #[source]
        source: PromptError,
    },
    #[error("生成大纲时模型调用失败: {source}")]
    Backend {
        #[source]
        source: BackendError,
    },
    #[error("大纲响应不是合法的 JSON: {source}")]
    Parse {
        #[source]
        source: serde_json::Error,
    },
    #[error("大纲响应不符合约定结构: {reason}")]
    Invalid { reason: String },
}

impl OutlineError {
    /// Format-class failures: the backend answered, but the payload failed
    /// schema validation. The transport-class counterpart is `Backend`.
    pub fn is_format_error(&self) -> bool {
        matches!(self, Self::Parse { .. } | Self::Invalid { .. })
    }
}

pub struct OutlineService<'a> {
    prompts: &'a PromptRegistry,
    sink: &'a dyn LogSink,
}

impl<'a> OutlineService<'a> {
    pub fn new(prompts: &'a PromptRegistry, sink: &'a dyn LogSink) -> Self {
        Self { prompts, sink }
    }

    /// Requests a full-series outline. Either a complete, schema-valid
    /// outline is returned, or an error with no partial result.
    pub fn generate(
        &self,
        backend: &dyn GenerativeBackend,
        request: &OutlineRequest,
    ) -> Result<Outline, OutlineError> {
        let instruction = self
            .prompts
            .format_with("outline_instruction", [("mode", request.mode.label())])
            .map_err(|source| OutlineError::Prompt { source })?;
        let content = self
            .prompts
            .format_with(
                "outline_content",
                [("novel_text", request.novel_text.as_str())],
            )
            .map_err(|source| OutlineError::Prompt { source })?;

        self.log(
            LogLevel::Info,
            format!("开始生成全案大纲（受众：{}）...", request.mode.label()),
        );

        let generation = GenerationRequest::new(instruction, content)
            .with_schema(outline_response_schema());
        let response = backend
            .generate(&generation)
            .map_err(|source| OutlineError::Backend { source })?;

        let outline = parse_outline_response(&response)?;
        self.log(
            LogLevel::Info,
            format!(
                "大纲生成完成：{} 个阶段，共 {} 集。",
                outline.phase_plans.len(),
                outline.total_episodes()
            ),
        );
        Ok(outline)
    }

    fn log(&self, level: LogLevel, message: impl Into<String>) {
        self.sink.log(LogRecord::new(level, message.into()));
    }
}

pub fn parse_outline_response(response: &str) -> Result<Outline, OutlineError> {
    let mut outline: Outline = serde_json::from_str(extract_json(response))
        .map_err(|source| OutlineError::Parse { source })?;
    outline
        .phase_plans
        .sort_by_key(|plan| plan.phase_index);
    validate_outline(&outline)?;
    Ok(outline)
}

fn validate_outline(outline: &Outline) -> Result<(), OutlineError> {
    if outline.content.trim().is_empty() {
        return Err(OutlineError::Invalid {
            reason: "全局内容概要为空".to_string(),
        });
    }
    if outline.phase_plans.is_empty() {
        return Err(OutlineError::Invalid {
            reason: "阶段规划为空".to_string(),
        });
    }

    for (position, plan) in outline.phase_plans.iter().enumerate() {
        let expected = position as u32 + 1;
        if plan.phase_index != expected {
            return Err(OutlineError::Invalid {
                reason: format!(
                    "阶段编号必须从 1 连续递增，位置 {} 上出现了阶段 {}",
                    position + 1,
                    plan.phase_index
                ),
            });
        }
        if plan.episodes == 0 {
            return Err(OutlineError::Invalid {
                reason: format!("阶段 {} 的集数必须大于 0", plan.phase_index),
            });
        }
    }

    Ok(())
}

/// Structured-output schema for the outline request, mirrored by the
/// defensive validation above for backends without native schema support.
pub fn outline_response_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "content": { "type": "string" },
            "characters": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "name": { "type": "string" },
                        "gender": { "type": "string" },
                        "age": { "type": "string" },
                        "identity": { "type": "string" },
                        "appearance": { "type": "string" },
                        "growth": { "type": "string" },
                        "motivation": { "type": "string" }
                    },
                    "required": ["name", "gender", "age", "identity", "appearance", "growth", "motivation"]
                }
            },
            "phasePlans": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "phaseIndex": { "type": "number" },
                        "episodes": { "type": "number" },
                        "description": { "type": "string" },
                        "climax": { "type": "string" }
                    },
                    "required": ["phaseIndex", "episodes", "description", "climax"]
                }
            }
        },
        "required": ["content", "characters", "phasePlans"]
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_response() -> String {
        serde_json::json!({
            "content": "全剧围绕判官笔展开",
            "characters": [{
                "name": "林川",
                "gender": "男",
                "age": "22",
                "identity": "落魄判官传人",
                "appearance": "青衫执笔",
                "growth": "从逃避到执掌生死",
                "motivation": "查清师门灭门真相"
            }],
            "phasePlans": [
                { "phaseIndex": 1, "episodes": 10, "description": "开篇建模", "climax": "判官笔觉醒" },
                { "phaseIndex": 2, "episodes": 8, "description": "宗门对抗", "climax": "身份暴露" }
            ]
        })
        .to_string()
    }

    #[test]
    fn parses_valid_response() {
        let outline = parse_outline_response(&sample_response()).unwrap();
        assert_eq!(outline.phase_plans.len(), 2);
        assert_eq!(outline.total_episodes(), 18);
        assert_eq!(outline.plan(2).unwrap().episodes, 8);
    }

    #[test]
    fn parses_fenced_response() {
        let fenced = format!("```json\n{}\n```", sample_response());
        assert!(parse_outline_response(&fenced).is_ok());
    }

    #[test]
    fn missing_required_field_is_format_error() {
        let err = parse_outline_response(r#"{"content": "只有概要"}"#).unwrap_err();
        assert!(err.is_format_error());
        assert!(matches!(err, OutlineError::Parse { .. }));
    }

    #[test]
    fn non_contiguous_phases_are_rejected() {
        let response = serde_json::json!({
            "content": "概要",
            "characters": [],
            "phasePlans": [
                { "phaseIndex": 1, "episodes": 10, "description": "a", "climax": "b" },
                { "phaseIndex": 3, "episodes": 8, "description": "c", "climax": "d" }
            ]
        })
        .to_string();
        let err = parse_outline_response(&response).unwrap_err();
        assert!(matches!(err, OutlineError::Invalid { .. }));
    }

    #[test]
    fn zero_episode_phase_is_rejected() {
        let response = serde_json::json!({
            "content": "概要",
            "characters": [],
            "phasePlans": [
                { "phaseIndex": 1, "episodes": 0, "description": "a", "climax": "b" }
            ]
        })
        .to_string();
        assert!(parse_outline_response(&response).is_err());
    }

    #[test]
    fn out_of_order_plans_are_sorted_before_validation() {
        let response = serde_json::json!({
            "content": "概要",
            "characters": [],
            "phasePlans": [
                { "phaseIndex": 2, "episodes": 8, "description": "c", "climax": "d" },
                { "phaseIndex": 1, "episodes": 10, "description": "a", "climax": "b" }
            ]
        })
        .to_string();
        let outline = parse_outline_response(&response).unwrap();
        assert_eq!(outline.phase_plans[0].phase_index, 1);
    }
}
