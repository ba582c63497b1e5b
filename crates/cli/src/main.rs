use clap::{Args, Parser, Subcommand};
use drama_adapters::{create_backend, AdapterError, BackendOptions, CancelToken, RetryConfig};
use drama_core::{
    write_phase_document, AudienceMode, ConfigStore, ExportError, FileCategory,
    GenerationSelections, LogLevel, LogRecord, LogSink, OutlineError, OutlineRequest,
    OutlineService, PhaseScriptService, Project, ProjectError, ProjectStore, PromptError,
    PromptRegistry, ReferenceFile, ScriptError, ScriptStyle, StdoutLogSink,
};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

fn main() {
    env_logger::init();
    if let Err(err) = run() {
        eprintln!("Error: {err}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), CliError> {
    let cli = Cli::parse();
    let sink = StdoutLogSink::new();

    match cli.command {
        Command::Config(command) => handle_config(&cli.config, command, &sink),
        Command::Project(command) => handle_project(command, &sink),
        Command::Outline(command) => handle_outline(&cli.config, command, &sink),
        Command::Script(command) => handle_script(&cli.config, command, &sink),
        Command::Export(command) => handle_export(command, &sink),
    }
}

fn handle_config(
    config_path: &Path,
    command: ConfigCommand,
    sink: &dyn LogSink,
) -> Result<(), CliError> {
    match command {
        ConfigCommand::TestLlm(args) => run_test_llm(config_path, args, sink),
    }
}

fn handle_project(command: ProjectCommand, sink: &dyn LogSink) -> Result<(), CliError> {
    match command {
        ProjectCommand::New(args) => run_project_new(args, sink),
        ProjectCommand::AddFile(args) => run_project_add_file(args, sink),
        ProjectCommand::Show(args) => run_project_show(args, sink),
    }
}

fn handle_outline(
    config_path: &Path,
    command: OutlineCommand,
    sink: &dyn LogSink,
) -> Result<(), CliError> {
    match command {
        OutlineCommand::Generate(args) => run_generate_outline(config_path, args, sink),
    }
}

fn handle_script(
    config_path: &Path,
    command: ScriptCommand,
    sink: &dyn LogSink,
) -> Result<(), CliError> {
    match command {
        ScriptCommand::Generate(args) => run_generate_script(config_path, args, sink),
    }
}

fn handle_export(command: ExportCommand, sink: &dyn LogSink) -> Result<(), CliError> {
    match command {
        ExportCommand::Phase(args) => run_export_phase(args, sink),
    }
}

fn run_project_new(args: ProjectNewArgs, sink: &dyn LogSink) -> Result<(), CliError> {
    let mut project = Project::new(args.name.clone());
    if let Some(mode) = args.mode {
        project.mode = parse_mode(&mode)?;
    }
    if let Some(style) = args.style {
        project.script_style = parse_style(&style)?;
    }

    ProjectStore::create(&args.project, project)?;
    sink.log(LogRecord::new(
        LogLevel::Info,
        format!("项目 `{}` 已创建：{}", args.name, args.project.display()),
    ));
    Ok(())
}

fn run_project_add_file(args: ProjectAddFileArgs, sink: &dyn LogSink) -> Result<(), CliError> {
    let category = parse_category(&args.category)?;
    let content = fs::read_to_string(&args.file).map_err(|source| CliError::Io {
        path: args.file.clone(),
        source,
    })?;
    let name = args
        .file
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| args.file.display().to_string());

    let store = ProjectStore::open(&args.project)?;
    let file = ReferenceFile::new(name.clone(), category, content);
    let size = file.size_label.clone();
    store.update(|project| project.add_file(file))?;

    sink.log(LogRecord::new(
        LogLevel::Info,
        format!("已添加{}：{}（{}）", category.label(), name, size),
    ));
    Ok(())
}

fn run_project_show(args: ProjectShowArgs, sink: &dyn LogSink) -> Result<(), CliError> {
    let store = ProjectStore::open(&args.project)?;
    let project = store.snapshot()?;

    sink.log(LogRecord::new(
        LogLevel::Info,
        format!(
            "项目：{}（受众：{}，默认风格：{}）",
            project.name,
            project.mode.label(),
            project.script_style.label()
        ),
    ));
    for file in &project.files {
        sink.log(LogRecord::new(
            LogLevel::Info,
            format!(
                "  参考文件 [{}] {}（{}）",
                file.category.label(),
                file.name,
                file.size_label
            ),
        ));
    }
    match &project.outline {
        Some(outline) => {
            sink.log(LogRecord::new(
                LogLevel::Info,
                format!(
                    "  大纲：{} 个阶段，共 {} 集",
                    outline.phase_plans.len(),
                    outline.total_episodes()
                ),
            ));
            for plan in &outline.phase_plans {
                let status = if project.script(plan.phase_index).is_some() {
                    "已生成"
                } else {
                    "未生成"
                };
                sink.log(LogRecord::new(
                    LogLevel::Info,
                    format!(
                        "    阶段 {}：{} 集，{} —— {}",
                        plan.phase_index, plan.episodes, status, plan.description
                    ),
                ));
            }
        }
        None => {
            sink.log(LogRecord::new(
                LogLevel::Info,
                "  大纲：尚未生成".to_string(),
            ));
        }
    }
    Ok(())
}

fn run_generate_outline(
    config_path: &Path,
    args: OutlineGenerateArgs,
    sink: &dyn LogSink,
) -> Result<(), CliError> {
    let mut config_store = ConfigStore::open(config_path.to_path_buf())?;
    config_store.ensure_recent_defaults();

    let selected = select_llm_interface(&config_store, args.llm_interface.clone())?;
    let prompts = PromptRegistry::from_prompt_config(&config_store.config().prompts)?;

    let store = ProjectStore::open(&args.project)?;
    let _guard = store
        .begin_generation()
        .ok_or(CliError::GenerationBusy)?;
    let project = store.snapshot()?;

    let novel_text = project.combined_text(FileCategory::SourceNovel);
    if novel_text.trim().is_empty() {
        return Err(CliError::MissingSourceNovel);
    }

    sink.log(LogRecord::new(
        LogLevel::Info,
        format!("使用 LLM 接口：{selected}"),
    ));

    let backend = create_backend(
        config_store.config(),
        &selected,
        BackendOptions::new(
            RetryConfig::from(&config_store.config().generation),
            CancelToken::new(),
        ),
    )?;

    let service = OutlineService::new(&prompts, sink);
    let outline = service.generate(
        backend.as_ref(),
        &OutlineRequest::new(novel_text, project.mode),
    )?;
    store.commit_outline(outline)?;

    sink.log(LogRecord::new(
        LogLevel::Info,
        format!("大纲已写入项目：{}", args.project.display()),
    ));

    config_store.touch_llm_interface(selected);
    config_store.save()?;
    Ok(())
}

fn run_generate_script(
    config_path: &Path,
    args: ScriptGenerateArgs,
    sink: &dyn LogSink,
) -> Result<(), CliError> {
    if args.phase == 0 {
        return Err(CliError::InvalidPhaseNumber(args.phase));
    }

    let mut config_store = ConfigStore::open(config_path.to_path_buf())?;
    config_store.ensure_recent_defaults();

    let selected = select_llm_interface(&config_store, args.llm_interface.clone())?;
    let prompts = PromptRegistry::from_prompt_config(&config_store.config().prompts)?;

    let store = ProjectStore::open(&args.project)?;
    let _guard = store
        .begin_generation()
        .ok_or(CliError::GenerationBusy)?;
    let project = store.snapshot()?;

    let style = match args.style {
        Some(style) => parse_style(&style)?,
        None => project.script_style,
    };

    sink.log(LogRecord::new(
        LogLevel::Info,
        format!("使用 LLM 接口：{selected}"),
    ));

    let backend = create_backend(
        config_store.config(),
        &selected,
        BackendOptions::new(
            RetryConfig::from(&config_store.config().generation),
            CancelToken::new(),
        ),
    )?;

    let service = PhaseScriptService::new(&prompts, sink)
        .with_format_policy(config_store.config().generation.format_policy);
    let selections = GenerationSelections::all_files(&project, style);
    let script = service.generate(backend.as_ref(), &project, args.phase, &selections)?;
    let episode_count = script.episodes.len();
    store.commit_script(script)?;

    sink.log(LogRecord::new(
        LogLevel::Info,
        format!(
            "阶段 {} 脚本已写入项目（{} 集）：{}",
            args.phase,
            episode_count,
            args.project.display()
        ),
    ));

    config_store.touch_llm_interface(selected);
    config_store.save()?;
    Ok(())
}

fn run_export_phase(args: ExportPhaseArgs, sink: &dyn LogSink) -> Result<(), CliError> {
    let store = ProjectStore::open(&args.project)?;
    let project = store.snapshot()?;
    let script = project
        .script(args.phase)
        .ok_or(CliError::MissingPhaseScript(args.phase))?;

    write_phase_document(&args.output, &project.name, script)?;
    sink.log(LogRecord::new(
        LogLevel::Info,
        format!(
            "阶段 {} 脚本已导出：{}",
            args.phase,
            args.output.display()
        ),
    ));
    Ok(())
}

fn run_test_llm(config_path: &Path, args: TestLlmArgs, sink: &dyn LogSink) -> Result<(), CliError> {
    let mut store = ConfigStore::open(config_path.to_path_buf())?;
    store.ensure_recent_defaults();

    let selected = select_llm_interface(&store, args.interface)?;
    let profile = store
        .config()
        .get_llm_profile(&selected)
        .cloned()
        .ok_or_else(|| CliError::UnknownInterface(selected.clone()))?;

    sink.log(LogRecord::new(
        LogLevel::Info,
        format!("开始测试 LLM 配置：{selected}"),
    ));
    sink.log(LogRecord::new(
        LogLevel::Debug,
        format!(
            "模型: {} | 接口模式: {} | Base URL: {}",
            profile.model_name, profile.interface_format, profile.base_url
        ),
    ));

    let backend = create_backend(store.config(), &selected, BackendOptions::default())?;
    sink.log(LogRecord::new(
        LogLevel::Info,
        "发送测试提示词: Please reply 'OK'".to_string(),
    ));

    let request = drama_core::GenerationRequest::new(
        "You are a helpful assistant.",
        "Please reply 'OK'",
    );
    match backend.generate(&request) {
        Ok(response) => {
            if response.trim().is_empty() {
                sink.log(LogRecord::new(
                    LogLevel::Error,
                    "❌ LLM配置测试失败：未获取到响应".to_string(),
                ));
                return Err(CliError::TestFailed(
                    "LLM配置测试失败：未获取到响应".to_string(),
                ));
            }

            sink.log(LogRecord::new(
                LogLevel::Info,
                "✅ LLM配置测试成功！".to_string(),
            ));
            sink.log(LogRecord::new(
                LogLevel::Debug,
                format!("测试回复: {response}"),
            ));
        }
        Err(err) => {
            sink.log(LogRecord::new(
                LogLevel::Error,
                format!("❌ LLM配置测试出错: {err}"),
            ));
            return Err(CliError::TestFailed(err.to_string()));
        }
    }

    store.touch_llm_interface(selected);
    store.save()?;
    Ok(())
}

fn select_llm_interface(
    store: &ConfigStore,
    preferred: Option<String>,
) -> Result<String, CliError> {
    if let Some(name) = normalize_preference(preferred) {
        if store.config().llm_profiles.contains_key(&name) {
            return Ok(name);
        }
        return Err(CliError::UnknownInterface(name));
    }

    if let Some(name) = store.last_llm_interface() {
        return Ok(name.to_string());
    }

    if let Some(name) = store.config().llm_profiles.keys().next() {
        return Ok(name.clone());
    }

    Err(CliError::MissingLlmProfile)
}

fn normalize_preference(value: Option<String>) -> Option<String> {
    value.and_then(|raw| {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn parse_mode(value: &str) -> Result<AudienceMode, CliError> {
    match value.trim().to_lowercase().as_str() {
        "male" | "男频" => Ok(AudienceMode::Male),
        "female" | "女频" => Ok(AudienceMode::Female),
        other => Err(CliError::UnknownMode(other.to_string())),
    }
}

fn parse_style(value: &str) -> Result<ScriptStyle, CliError> {
    match value.trim().to_lowercase().as_str() {
        "emotional" | "情绪流" => Ok(ScriptStyle::Emotional),
        "comedic" | "非情绪流" => Ok(ScriptStyle::Comedic),
        other => Err(CliError::UnknownStyle(other.to_string())),
    }
}

fn parse_category(value: &str) -> Result<FileCategory, CliError> {
    match value.trim().to_lowercase().as_str() {
        "source" | "novel" | "原著小说" => Ok(FileCategory::SourceNovel),
        "layout" | "排版参考" => Ok(FileCategory::LayoutReference),
        "style" | "文笔参考" => Ok(FileCategory::StyleReference),
        other => Err(CliError::UnknownCategory(other.to_string())),
    }
}

#[derive(Debug, Error)]
enum CliError {
    #[error("配置文件错误: {0}")]
    Config(#[from] drama_core::ConfigError),
    #[error("项目文件错误: {0}")]
    Project(#[from] ProjectError),
    #[error("缺少可用的 LLM 配置，无法执行该操作。")]
    MissingLlmProfile,
    #[error("未找到名为 `{0}` 的接口配置")]
    UnknownInterface(String),
    #[error("项目中没有原著小说文件，请先通过 project add-file 添加。")]
    MissingSourceNovel,
    #[error("该项目已有一个生成任务在执行中。")]
    GenerationBusy,
    #[error("阶段编号必须从 1 开始，收到 {0}")]
    InvalidPhaseNumber(u32),
    #[error("阶段 {0} 尚未生成脚本，无法导出。")]
    MissingPhaseScript(u32),
    #[error("未知的受众模式 `{0}`，可选值：male / female")]
    UnknownMode(String),
    #[error("未知的脚本风格 `{0}`，可选值：emotional / comedic")]
    UnknownStyle(String),
    #[error("未知的文件类别 `{0}`，可选值：source / layout / style")]
    UnknownCategory(String),
    #[error("读取文件 `{path}` 失败: {source}")]
    Io { path: PathBuf, source: io::Error },
    #[error("适配器调用失败: {0}")]
    Adapter(#[from] AdapterError),
    #[error("提示词加载失败: {0}")]
    Prompt(#[from] PromptError),
    #[error("大纲生成失败: {0}")]
    Outline(#[from] OutlineError),
    #[error("脚本生成失败: {0}")]
    Script(#[from] ScriptError),
    #[error("导出失败: {0}")]
    Export(#[from] ExportError),
    #[error("{0}")]
    TestFailed(String),
}

#[derive(Parser)]
#[command(name = "dramactl", version, about = "小说改编漫剧脚本生成命令行工具")]
struct Cli {
    /// 指定配置文件路径
    #[arg(long, global = true, default_value = "config.json")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// 配置相关操作
    #[command(subcommand)]
    Config(ConfigCommand),
    /// 项目管理相关操作
    #[command(subcommand)]
    Project(ProjectCommand),
    /// 全案大纲相关操作
    #[command(subcommand)]
    Outline(OutlineCommand),
    /// 阶段脚本相关操作
    #[command(subcommand)]
    Script(ScriptCommand),
    /// 导出相关操作
    #[command(subcommand)]
    Export(ExportCommand),
}

#[derive(Subcommand)]
enum ConfigCommand {
    /// 测试当前 LLM 接口配置
    TestLlm(TestLlmArgs),
}

#[derive(Subcommand)]
enum ProjectCommand {
    /// 创建一个新项目文件
    New(ProjectNewArgs),
    /// 向项目添加参考文件
    AddFile(ProjectAddFileArgs),
    /// 查看项目状态
    Show(ProjectShowArgs),
}

#[derive(Subcommand)]
enum OutlineCommand {
    /// 基于原著素材生成全案大纲
    Generate(OutlineGenerateArgs),
}

#[derive(Subcommand)]
enum ScriptCommand {
    /// 生成指定阶段的脚本
    Generate(ScriptGenerateArgs),
}

#[derive(Subcommand)]
enum ExportCommand {
    /// 将阶段脚本导出为纯文本文档
    Phase(ExportPhaseArgs),
}

#[derive(Args)]
struct TestLlmArgs {
    /// 指定要测试的接口名称，默认为最近使用的接口
    #[arg(long)]
    interface: Option<String>,
}

#[derive(Args)]
struct ProjectNewArgs {
    /// 项目文件路径
    #[arg(long, value_name = "FILE")]
    project: PathBuf,
    /// 项目名称
    #[arg(long)]
    name: String,
    /// 受众模式：male / female
    #[arg(long)]
    mode: Option<String>,
    /// 默认脚本风格：emotional / comedic
    #[arg(long)]
    style: Option<String>,
}

#[derive(Args)]
struct ProjectAddFileArgs {
    /// 项目文件路径
    #[arg(long, value_name = "FILE")]
    project: PathBuf,
    /// 待导入的参考文件
    #[arg(long, value_name = "FILE")]
    file: PathBuf,
    /// 文件类别：source / layout / style
    #[arg(long)]
    category: String,
}

#[derive(Args)]
struct ProjectShowArgs {
    /// 项目文件路径
    #[arg(long, value_name = "FILE")]
    project: PathBuf,
}

#[derive(Args)]
struct OutlineGenerateArgs {
    /// 项目文件路径
    #[arg(long, value_name = "FILE")]
    project: PathBuf,
    /// 指定用于生成大纲的 LLM 接口名称
    #[arg(long)]
    llm_interface: Option<String>,
}

#[derive(Args)]
struct ScriptGenerateArgs {
    /// 项目文件路径
    #[arg(long, value_name = "FILE")]
    project: PathBuf,
    /// 需要生成的阶段编号
    #[arg(long, value_name = "N")]
    phase: u32,
    /// 覆盖项目默认的脚本风格：emotional / comedic
    #[arg(long)]
    style: Option<String>,
    /// 指定用于生成脚本的 LLM 接口名称
    #[arg(long)]
    llm_interface: Option<String>,
}

#[derive(Args)]
struct ExportPhaseArgs {
    /// 项目文件路径
    #[arg(long, value_name = "FILE")]
    project: PathBuf,
    /// 需要导出的阶段编号
    #[arg(long, value_name = "N")]
    phase: u32,
    /// 导出文件路径
    #[arg(long, value_name = "FILE")]
    output: PathBuf,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_mode_style_and_category() {
        assert_eq!(parse_mode("Male").unwrap(), AudienceMode::Male);
        assert_eq!(parse_mode("女频").unwrap(), AudienceMode::Female);
        assert!(parse_mode("both").is_err());

        assert_eq!(parse_style("emotional").unwrap(), ScriptStyle::Emotional);
        assert_eq!(parse_style("非情绪流").unwrap(), ScriptStyle::Comedic);
        assert!(parse_style("noir").is_err());

        assert_eq!(parse_category("source").unwrap(), FileCategory::SourceNovel);
        assert_eq!(
            parse_category("排版参考").unwrap(),
            FileCategory::LayoutReference
        );
        assert!(parse_category("music").is_err());
    }

    #[test]
    fn preference_normalization_drops_blank_values() {
        assert_eq!(normalize_preference(Some("  ".into())), None);
        assert_eq!(
            normalize_preference(Some(" gemini ".into())),
            Some("gemini".to_string())
        );
        assert_eq!(normalize_preference(None), None);
    }
}
