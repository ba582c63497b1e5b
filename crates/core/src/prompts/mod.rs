use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::config::PromptConfig;

const BUILT_IN_PROMPTS: &str = include_str!("../../prompts/default.toml");

pub type PromptArguments = HashMap<String, String>;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PromptSource {
    BuiltIn,
    File(PathBuf),
}

impl PromptSource {
    pub fn is_builtin(&self) -> bool {
        matches!(self, Self::BuiltIn)
    }

    pub fn as_path(&self) -> Option<&Path> {
        match self {
            Self::BuiltIn => None,
            Self::File(path) => Some(path.as_path()),
        }
    }
}

/// A prompt template with `{placeholder}` substitution. Placeholders are
/// required by default; `{{` and `}}` escape literal braces.
#[derive(Clone, Debug)]
pub struct PromptTemplate {
    key: String,
    template: String,
    segments: Vec<TemplateSegment>,
    placeholders: BTreeSet<String>,
    source: PromptSource,
}

impl PromptTemplate {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn template(&self) -> &str {
        &self.template
    }

    pub fn placeholders(&self) -> impl Iterator<Item = &str> {
        self.placeholders.iter().map(|s| s.as_str())
    }

    pub fn source(&self) -> &PromptSource {
        &self.source
    }

    pub fn render(&self, arguments: &PromptArguments) -> Result<String, PromptError> {
        for placeholder in &self.placeholders {
            if !arguments.contains_key(placeholder) {
                return Err(PromptError::MissingArgument {
                    key: self.key.clone(),
                    argument: placeholder.clone(),
                });
            }
        }

        let mut output = String::with_capacity(self.template.len());
        for segment in &self.segments {
            match segment {
                TemplateSegment::Literal(text) => output.push_str(text),
                TemplateSegment::Placeholder(name) => {
                    if let Some(value) = arguments.get(name) {
                        output.push_str(value);
                    }
                }
            }
        }

        Ok(output)
    }

    pub fn render_with<I, K, V>(&self, arguments: I) -> Result<String, PromptError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut map = PromptArguments::new();
        for (key, value) in arguments {
            map.insert(key.into(), value.into());
        }
        self.render(&map)
    }

    fn from_raw(key: String, raw: RawPrompt, source: PromptSource) -> Self {
        let (segments, placeholders) = parse_template(&raw.template);
        Self {
            key,
            template: raw.template,
            segments,
            placeholders,
            source,
        }
    }
}

#[derive(Debug, Error)]
pub enum PromptError {
    #[error("prompt `{0}` not found")]
    NotFound(String),
    #[error("missing argument `{argument}` when rendering prompt `{key}`")]
    MissingArgument { key: String, argument: String },
    #[error("failed to read prompt file `{path}`: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse built-in prompt definitions: {0}")]
    ParseBuiltIn(toml::de::Error),
    #[error("failed to parse prompt file `{path}`: {source}")]
    ParseToml {
        path: PathBuf,
        source: toml::de::Error,
    },
}

/// Prompt store: built-in TOML templates, overridable per key from custom
/// directories listed in the prompt configuration.
#[derive(Debug)]
pub struct PromptRegistry {
    prompts: BTreeMap<String, PromptTemplate>,
    directories: Vec<PathBuf>,
}

impl PromptRegistry {
    pub fn new() -> Result<Self, PromptError> {
        Self::from_prompt_config(&PromptConfig::default())
    }

    pub fn from_prompt_config(config: &PromptConfig) -> Result<Self, PromptError> {
        Self::with_custom_directories(&config.custom_directories)
    }

    pub fn with_custom_directories<P: AsRef<Path>>(directories: &[P]) -> Result<Self, PromptError> {
        let mut registry = Self {
            prompts: BTreeMap::new(),
            directories: directories
                .iter()
                .map(|p| p.as_ref().to_path_buf())
                .collect(),
        };
        registry.reload()?;
        Ok(registry)
    }

    pub fn custom_directories(&self) -> &[PathBuf] {
        &self.directories
    }

    pub fn reload(&mut self) -> Result<(), PromptError> {
        let mut prompts = BTreeMap::new();

        let document: PromptDocument =
            toml::from_str(BUILT_IN_PROMPTS).map_err(PromptError::ParseBuiltIn)?;
        for (key, raw) in document.prompts {
            let template = PromptTemplate::from_raw(key.clone(), raw, PromptSource::BuiltIn);
            prompts.insert(key, template);
        }

        for dir in &self.directories {
            load_directory(dir, &mut prompts)?;
        }

        self.prompts = prompts;
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<&PromptTemplate> {
        self.prompts.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.prompts.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.prompts.keys().map(|k| k.as_str())
    }

    pub fn format(&self, key: &str, args: &PromptArguments) -> Result<String, PromptError> {
        let template = self
            .get(key)
            .ok_or_else(|| PromptError::NotFound(key.to_string()))?;
        template.render(args)
    }

    pub fn format_with<I, K, V>(&self, key: &str, arguments: I) -> Result<String, PromptError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let template = self
            .get(key)
            .ok_or_else(|| PromptError::NotFound(key.to_string()))?;
        template.render_with(arguments)
    }
}

fn load_directory(
    dir: &Path,
    prompts: &mut BTreeMap<String, PromptTemplate>,
) -> Result<(), PromptError> {
    if !dir.is_dir() {
        return Ok(());
    }

    let mut files = Vec::new();
    let read_dir = fs::read_dir(dir).map_err(|source| PromptError::Io {
        path: dir.to_path_buf(),
        source,
    })?;
    for entry in read_dir {
        let entry = entry.map_err(|source| PromptError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
        let path = entry.path();
        if path.extension().and_then(|ext| ext.to_str()) == Some("toml") && path.is_file() {
            files.push(path);
        }
    }

    // Deterministic override order across files.
    files.sort();

    for path in files {
        let contents = fs::read_to_string(&path).map_err(|source| PromptError::Io {
            path: path.clone(),
            source,
        })?;
        let document: PromptDocument =
            toml::from_str(&contents).map_err(|source| PromptError::ParseToml {
                path: path.clone(),
                source,
            })?;
        for (key, raw) in document.prompts {
            let template =
                PromptTemplate::from_raw(key.clone(), raw, PromptSource::File(path.clone()));
            prompts.insert(key, template);
        }
    }

    Ok(())
}

#[derive(Debug, Deserialize)]
struct PromptDocument {
    #[serde(default)]
    prompts: BTreeMap<String, RawPrompt>,
}

#[derive(Debug, Deserialize)]
struct RawPrompt {
    #[serde(alias = "text")]
    template: String,
    #[serde(default)]
    #[allow(dead_code)]
    description: Option<String>,
}

#[derive(Clone, Debug)]
enum TemplateSegment {
    Literal(String),
    Placeholder(String),
}

fn parse_template(template: &str) -> (Vec<TemplateSegment>, BTreeSet<String>) {
    let mut segments = Vec::new();
    let mut placeholders = BTreeSet::new();
    let mut buffer = String::new();
    let mut chars = template.chars().peekable();

    while let Some(ch) = chars.next() {
        match ch {
            '{' => {
                if matches!(chars.peek(), Some('{')) {
                    chars.next();
                    buffer.push('{');
                    continue;
                }

                let mut placeholder = String::new();
                let mut closed = false;
                for next in chars.by_ref() {
                    if next == '}' {
                        closed = true;
                        break;
                    }
                    placeholder.push(next);
                }

                let name = placeholder.trim();
                if closed && !name.is_empty() {
                    if !buffer.is_empty() {
                        segments.push(TemplateSegment::Literal(std::mem::take(&mut buffer)));
                    }
                    placeholders.insert(name.to_string());
                    segments.push(TemplateSegment::Placeholder(name.to_string()));
                } else {
                    buffer.push('{');
                    buffer.push_str(&placeholder);
                    if closed {
                        buffer.push('}');
                    }
                }
            }
            '}' => {
                if matches!(chars.peek(), Some('}')) {
                    chars.next();
                }
                buffer.push('}');
            }
            _ => buffer.push(ch),
        }
    }

    if !buffer.is_empty() {
        segments.push(TemplateSegment::Literal(buffer));
    }

    (segments, placeholders)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn renders_builtin_outline_instruction() {
        let registry = PromptRegistry::new().expect("registry");
        let output = registry
            .format_with("outline_instruction", [("mode", "男频")])
            .expect("rendered");
        assert!(output.contains("65-80 集"));
        assert!(output.contains("男频模式"));
    }

    #[test]
    fn all_expected_builtin_keys_exist() {
        let registry = PromptRegistry::new().expect("registry");
        for key in [
            "outline_instruction",
            "outline_content",
            "phase_instruction",
            "phase_style_emotional",
            "phase_style_comedic",
            "phase_opening",
            "phase_continuation",
            "phase_content",
        ] {
            assert!(registry.contains(key), "missing built-in prompt `{key}`");
        }
    }

    #[test]
    fn missing_argument_fails() {
        let registry = PromptRegistry::new().expect("registry");
        let template = registry.get("phase_instruction").expect("template");
        let error = template
            .render(&PromptArguments::from([(
                "phase_index".into(),
                "1".into(),
            )]))
            .expect_err("missing args");
        assert!(matches!(error, PromptError::MissingArgument { .. }));
    }

    #[test]
    fn custom_directory_overrides_builtin() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("custom.toml");
        fs::write(
            &path,
            "[prompts.outline_instruction]\ntemplate = \"定制指令 {mode}\"\n",
        )
        .unwrap();

        let registry = PromptRegistry::with_custom_directories(&[dir.path()]).unwrap();
        let output = registry
            .format_with("outline_instruction", [("mode", "女频")])
            .unwrap();
        assert_eq!(output, "定制指令 女频");
        assert!(!registry
            .get("outline_instruction")
            .unwrap()
            .source()
            .is_builtin());
    }

    #[test]
    fn escaped_braces_render_literally() {
        let (_, placeholders) = parse_template("字面量 {{episodes}} 与 {count}");
        assert_eq!(placeholders.len(), 1);
        assert!(placeholders.contains("count"));
    }
}
