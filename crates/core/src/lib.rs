pub mod backend;
pub mod cancel;
pub mod config;
pub mod export;
pub mod logging;
pub mod outline;
pub mod project;
pub mod prompts;
pub mod script;

pub use backend::{extract_json, BackendError, GenerationRequest, GenerativeBackend};
pub use cancel::CancelToken;
pub use config::{
    Config, ConfigError, ConfigStore, GenerationConfig, LlmConfig, PromptConfig, RecentUsage,
};
pub use export::{render_phase_document, write_phase_document, ExportError};
pub use logging::{
    LogLevel, LogRecord, LogSink, NullLogSink, SharedLogSink, StdoutLogSink, VecLogSink,
};
pub use outline::{
    AudienceMode, CharacterBio, Outline, OutlineError, OutlineRequest, OutlineService, PhasePlan,
};
pub use project::{
    FileCategory, GenerationGuard, Project, ProjectError, ProjectStore, ReferenceFile,
};
pub use prompts::{PromptArguments, PromptError, PromptRegistry, PromptSource, PromptTemplate};
pub use script::{
    start_episode_number, Episode, FormatPolicy, GenerationSelections, PhaseScript,
    PhaseScriptService, ScriptError, ScriptStyle,
};
