use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use uuid::Uuid;

use crate::backend::{extract_json, BackendError, GenerationRequest, GenerativeBackend};
use crate::logging::{LogLevel, LogRecord, LogSink};
use crate::outline::Outline;
use crate::project::{FileCategory, Project};
use crate::prompts::{PromptError, PromptRegistry};

/// Placeholder fed into prompt sections that have no material, so the model
/// always sees the same section layout.
const EMPTY_SECTION: &str = "无";

const CONTEXT_EPISODES: usize = 3;

/// Tonal preset for phase generation. Exactly one applies per phase.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScriptStyle {
    #[default]
    Emotional,
    Comedic,
}

impl ScriptStyle {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Emotional => "情绪流",
            Self::Comedic => "非情绪流",
        }
    }

    pub fn prompt_key(&self) -> &'static str {
        match self {
            Self::Emotional => "phase_style_emotional",
            Self::Comedic => "phase_style_comedic",
        }
    }
}

/// What to do when the backend answers but the payload fails JSON parsing or
/// schema validation. Failing is the default; callers that must never crash
/// can opt into an empty result instead.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FormatPolicy {
    #[default]
    Fail,
    DefaultEmpty,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Episode {
    /// Globally unique across the project, derived from the phase plan.
    /// Model-supplied numbers are discarded.
    pub number: u32,
    pub title: String,
    pub content: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhaseScript {
    pub phase_index: u32,
    pub episodes: Vec<Episode>,
    pub style: ScriptStyle,
    pub generated_at: DateTime<Utc>,
}

/// Reference material and style the caller picked for one generation run.
#[derive(Clone, Debug)]
pub struct GenerationSelections {
    /// Subset of the project's reference files to feed into the prompt.
    pub file_ids: Vec<Uuid>,
    pub style: ScriptStyle,
}

impl GenerationSelections {
    pub fn new(file_ids: Vec<Uuid>, style: ScriptStyle) -> Self {
        Self { file_ids, style }
    }

    /// Convenience for the common case of feeding every project file in.
    pub fn all_files(project: &Project, style: ScriptStyle) -> Self {
        Self {
            file_ids: project.files.iter().map(|file| file.id).collect(),
            style,
        }
    }
}

#[derive(Debug, Error)]
pub enum ScriptError {
    #[error("项目还没有大纲，请先生成全案大纲")]
    MissingOutline,
    #[error("大纲中不存在阶段 {phase_index}")]
    UnknownPhase { phase_index: u32 },
    #[error("未选择任何原著小说文件，无法生成脚本")]
    MissingSourceNovel,
    #[error("渲染阶段提示词失败: {source}")]
    Prompt {
        #[source]
        source: PromptError,
    },
    #[error("生成阶段 {phase_index} 时模型调用失败: {source}")]
    Backend {
        phase_index: u32,
        #[source]
        source: BackendError,
    },
    #[error("阶段 {phase_index} 响应不是合法的 JSON: {source}")]
    Parse {
        phase_index: u32,
        #[source]
        source: serde_json::Error,
    },
}

impl ScriptError {
    /// Precondition failures are reported before any request is sent.
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            Self::MissingOutline | Self::UnknownPhase { .. } | Self::MissingSourceNovel
        )
    }

    pub fn is_format_error(&self) -> bool {
        matches!(self, Self::Parse { .. })
    }
}

/// First episode number of a phase: one past every episode planned for the
/// phases before it. Derived from the plan alone, so regenerating one phase
/// never disturbs the numbering base of another.
pub fn start_episode_number(outline: &Outline, phase_index: u32) -> u32 {
    1 + outline
        .phase_plans
        .iter()
        .filter(|plan| plan.phase_index < phase_index)
        .map(|plan| plan.episodes)
        .sum::<u32>()
}

pub struct PhaseScriptService<'a> {
    prompts: &'a PromptRegistry,
    sink: &'a dyn LogSink,
    format_policy: FormatPolicy,
}

impl<'a> PhaseScriptService<'a> {
    pub fn new(prompts: &'a PromptRegistry, sink: &'a dyn LogSink) -> Self {
        Self {
            prompts,
            sink,
            format_policy: FormatPolicy::default(),
        }
    }

    pub fn with_format_policy(mut self, policy: FormatPolicy) -> Self {
        self.format_policy = policy;
        self
    }

    /// Generates the script for one phase. The returned script is not yet
    /// committed; callers hand it to the project store, so a failure at any
    /// point here leaves stored state untouched.
    pub fn generate(
        &self,
        backend: &dyn GenerativeBackend,
        project: &Project,
        phase_index: u32,
        selections: &GenerationSelections,
    ) -> Result<PhaseScript, ScriptError> {
        let outline = project.outline.as_ref().ok_or(ScriptError::MissingOutline)?;
        let plan = outline
            .plan(phase_index)
            .ok_or(ScriptError::UnknownPhase { phase_index })?;

        let novel_text = self.selected_text(project, selections, FileCategory::SourceNovel);
        if novel_text.trim().is_empty() {
            return Err(ScriptError::MissingSourceNovel);
        }
        let layout_ref = self.selected_text(project, selections, FileCategory::LayoutReference);
        let style_ref = self.selected_text(project, selections, FileCategory::StyleReference);

        let start = start_episode_number(outline, phase_index);
        let prev_context = render_context(project, start);
        let is_opening = phase_index == 1;

        let style_rule = self
            .prompts
            .format_with(selections.style.prompt_key(), empty_args())
            .map_err(|source| ScriptError::Prompt { source })?;
        let continuity_key = if is_opening {
            "phase_opening"
        } else {
            "phase_continuation"
        };
        let continuity_rule = self
            .prompts
            .format_with(continuity_key, empty_args())
            .map_err(|source| ScriptError::Prompt { source })?;

        let instruction = self
            .prompts
            .format_with(
                "phase_instruction",
                [
                    ("phase_index", phase_index.to_string()),
                    ("episodes", plan.episodes.to_string()),
                    ("layout_ref", or_empty_section(&layout_ref)),
                    ("style_rule", style_rule),
                    ("continuity_rule", continuity_rule),
                ],
            )
            .map_err(|source| ScriptError::Prompt { source })?;

        let plan_brief = format!(
            "阶段 {}（共 {} 集）：{}\n本阶段高潮卡点：{}",
            plan.phase_index, plan.episodes, plan.description, plan.climax
        );
        let content = self
            .prompts
            .format_with(
                "phase_content",
                [
                    ("prev_context", or_empty_section(&prev_context)),
                    ("outline", plan_brief),
                    ("novel_text", novel_text),
                    ("style_ref", or_empty_section(&style_ref)),
                ],
            )
            .map_err(|source| ScriptError::Prompt { source })?;

        self.log(
            LogLevel::Info,
            format!(
                "开始生成阶段 {}（{} 集，起始第 {} 集，{}）...",
                phase_index,
                plan.episodes,
                start,
                selections.style.label()
            ),
        );

        let request =
            GenerationRequest::new(instruction, content).with_schema(phase_response_schema());
        let response = backend
            .generate(&request)
            .map_err(|source| ScriptError::Backend {
                phase_index,
                source,
            })?;

        let raw_episodes = match parse_phase_response(&response) {
            Ok(episodes) => episodes,
            Err(source) => match self.format_policy {
                FormatPolicy::Fail => {
                    return Err(ScriptError::Parse {
                        phase_index,
                        source,
                    })
                }
                FormatPolicy::DefaultEmpty => {
                    self.log(
                        LogLevel::Warn,
                        format!("阶段 {phase_index} 响应解析失败，按空结果处理: {source}"),
                    );
                    Vec::new()
                }
            },
        };

        if raw_episodes.len() != plan.episodes as usize {
            self.log(
                LogLevel::Warn,
                format!(
                    "阶段 {} 期望 {} 集，模型返回 {} 集，按实际返回重新编号。",
                    phase_index,
                    plan.episodes,
                    raw_episodes.len()
                ),
            );
        }

        let episodes = raw_episodes
            .into_iter()
            .enumerate()
            .map(|(offset, raw)| Episode {
                number: start + offset as u32,
                title: raw.title,
                content: raw.content,
            })
            .collect::<Vec<_>>();

        self.log(
            LogLevel::Info,
            format!("阶段 {} 生成完成，共 {} 集。", phase_index, episodes.len()),
        );

        Ok(PhaseScript {
            phase_index,
            episodes,
            style: selections.style,
            generated_at: Utc::now(),
        })
    }

    fn selected_text(
        &self,
        project: &Project,
        selections: &GenerationSelections,
        category: FileCategory,
    ) -> String {
        project
            .files_in(category)
            .filter(|file| selections.file_ids.contains(&file.id))
            .map(|file| file.content.as_str())
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    fn log(&self, level: LogLevel, message: impl Into<String>) {
        self.sink.log(LogRecord::new(level, message.into()));
    }
}

/// Trailing-episode excerpts for the continuity section, ascending, capped at
/// three. Empty when the phase opens the series.
pub fn render_context(project: &Project, before_episode: u32) -> String {
    project
        .recent_episodes(before_episode, CONTEXT_EPISODES)
        .iter()
        .map(|episode| {
            format!(
                "第{}集（{}）：{}",
                episode.number, episode.title, episode.content
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn or_empty_section(text: &str) -> String {
    if text.trim().is_empty() {
        EMPTY_SECTION.to_string()
    } else {
        text.to_string()
    }
}

fn empty_args() -> [(&'static str, &'static str); 0] {
    []
}

#[derive(Debug, Deserialize)]
struct RawEpisode {
    #[serde(default, alias = "episodeNumber", alias = "number")]
    #[allow(dead_code)]
    episode_number: Option<u32>,
    title: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct PhaseResponse {
    episodes: Vec<RawEpisode>,
}

fn parse_phase_response(response: &str) -> Result<Vec<RawEpisode>, serde_json::Error> {
    let parsed: PhaseResponse = serde_json::from_str(extract_json(response))?;
    Ok(parsed.episodes)
}

/// Structured-output schema for a phase request. Episode numbers are still
/// requested so lenient models keep their ordering stable, but the values are
/// discarded on parse.
pub fn phase_response_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "episodes": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "episodeNumber": { "type": "number" },
                        "title": { "type": "string" },
                        "content": { "type": "string" }
                    },
                    "required": ["episodeNumber", "title", "content"]
                }
            }
        },
        "required": ["episodes"]
    })
}
