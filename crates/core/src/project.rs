use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use uuid::Uuid;

use crate::outline::{AudienceMode, Outline};
use crate::script::{Episode, PhaseScript, ScriptStyle};

#[derive(Debug, Error)]
pub enum ProjectError {
    #[error("读取项目文件 `{path}` 失败: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("写入项目文件 `{path}` 失败: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("解析项目文件 `{path}` 失败: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("序列化项目失败: {0}")]
    Serialize(#[source] serde_json::Error),
    #[error("项目状态锁已损坏")]
    Poisoned,
}

/// Role a reference file plays when prompts are assembled.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileCategory {
    SourceNovel,
    LayoutReference,
    StyleReference,
}

impl FileCategory {
    pub fn label(&self) -> &'static str {
        match self {
            Self::SourceNovel => "原著小说",
            Self::LayoutReference => "排版参考",
            Self::StyleReference => "文笔参考",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceFile {
    pub id: Uuid,
    pub name: String,
    pub category: FileCategory,
    pub content: String,
    pub size_label: String,
}

impl ReferenceFile {
    pub fn new(
        name: impl Into<String>,
        category: FileCategory,
        content: impl Into<String>,
    ) -> Self {
        let content = content.into();
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            category,
            size_label: size_label(content.len()),
            content,
        }
    }
}

fn size_label(bytes: usize) -> String {
    if bytes < 1024 {
        format!("{bytes} B")
    } else {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    }
}

/// One drama-adaptation project: reference material, generation presets, the
/// outline, and the phase scripts produced so far.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub id: Uuid,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub files: Vec<ReferenceFile>,
    #[serde(default)]
    pub mode: AudienceMode,
    #[serde(default)]
    pub script_style: ScriptStyle,
    #[serde(default)]
    pub outline: Option<Outline>,
    /// Kept sorted by phase index; at most one script per phase.
    #[serde(default)]
    pub scripts: Vec<PhaseScript>,
}

impl Project {
    pub fn new(name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            created_at: now,
            updated_at: now,
            files: Vec::new(),
            mode: AudienceMode::default(),
            script_style: ScriptStyle::default(),
            outline: None,
            scripts: Vec::new(),
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    pub fn add_file(&mut self, file: ReferenceFile) {
        self.files.push(file);
        self.touch();
    }

    pub fn remove_file(&mut self, id: Uuid) -> Option<ReferenceFile> {
        let position = self.files.iter().position(|file| file.id == id)?;
        let removed = self.files.remove(position);
        self.touch();
        Some(removed)
    }

    pub fn files_in(&self, category: FileCategory) -> impl Iterator<Item = &ReferenceFile> {
        self.files
            .iter()
            .filter(move |file| file.category == category)
    }

    /// Concatenated text of all files in a category, in upload order.
    pub fn combined_text(&self, category: FileCategory) -> String {
        self.files_in(category)
            .map(|file| file.content.as_str())
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    /// Installs a new outline. Scripts from a previous outline are discarded:
    /// their numbering and planning no longer line up.
    pub fn set_outline(&mut self, outline: Outline) {
        self.outline = Some(outline);
        self.scripts.clear();
        self.touch();
    }

    pub fn script(&self, phase_index: u32) -> Option<&PhaseScript> {
        self.scripts
            .iter()
            .find(|script| script.phase_index == phase_index)
    }

    /// Replaces the script for its phase, or inserts it. Regenerating a phase
    /// never appends a duplicate.
    pub fn replace_phase_script(&mut self, script: PhaseScript) {
        self.scripts.retain(|s| s.phase_index != script.phase_index);
        self.scripts.push(script);
        self.scripts.sort_by_key(|s| s.phase_index);
        self.touch();
    }

    /// Last `count` episodes numbered below `before_episode`, in ascending
    /// episode order. Feeds the continuity context of the next phase; the
    /// bound is an episode number so that a stale later-phase script can
    /// never leak into an earlier phase's context.
    pub fn recent_episodes(&self, before_episode: u32, count: usize) -> Vec<&Episode> {
        let mut episodes: Vec<&Episode> = self
            .scripts
            .iter()
            .flat_map(|script| script.episodes.iter())
            .filter(|episode| episode.number < before_episode)
            .collect();
        episodes.sort_by_key(|episode| episode.number);
        let skip = episodes.len().saturating_sub(count);
        episodes.split_off(skip)
    }
}

/// Guard for the single in-flight generation a project allows. Dropping it
/// releases the slot.
pub struct GenerationGuard {
    flag: Arc<AtomicBool>,
}

impl Drop for GenerationGuard {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

/// Owns the persisted project state. Mutations go through closures that run
/// against a working copy; the in-memory state only advances after the copy
/// has been written to disk, so a failed save leaves the last committed state
/// untouched.
pub struct ProjectStore {
    path: PathBuf,
    project: Mutex<Project>,
    generating: Arc<AtomicBool>,
}

impl ProjectStore {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, ProjectError> {
        let path = path.into();
        let data = fs::read_to_string(&path).map_err(|source| ProjectError::Read {
            path: path.clone(),
            source,
        })?;
        let project = serde_json::from_str(&data).map_err(|source| ProjectError::Parse {
            path: path.clone(),
            source,
        })?;

        Ok(Self {
            path,
            project: Mutex::new(project),
            generating: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn create(path: impl Into<PathBuf>, project: Project) -> Result<Self, ProjectError> {
        let path = path.into();
        persist(&path, &project)?;
        Ok(Self {
            path,
            project: Mutex::new(project),
            generating: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn snapshot(&self) -> Result<Project, ProjectError> {
        let guard = self.project.lock().map_err(|_| ProjectError::Poisoned)?;
        Ok(guard.clone())
    }

    pub fn update<F>(&self, mutate: F) -> Result<(), ProjectError>
    where
        F: FnOnce(&mut Project),
    {
        let mut guard = self.project.lock().map_err(|_| ProjectError::Poisoned)?;
        let mut working = guard.clone();
        mutate(&mut working);
        persist(&self.path, &working)?;
        *guard = working;
        Ok(())
    }

    pub fn commit_outline(&self, outline: Outline) -> Result<(), ProjectError> {
        self.update(|project| project.set_outline(outline))
    }

    pub fn commit_script(&self, script: PhaseScript) -> Result<(), ProjectError> {
        self.update(|project| project.replace_phase_script(script))
    }

    /// Claims the generation slot. `None` means another generation for this
    /// project is already running.
    pub fn begin_generation(&self) -> Option<GenerationGuard> {
        self.generating
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| GenerationGuard {
                flag: Arc::clone(&self.generating),
            })
    }

    pub fn is_generating(&self) -> bool {
        self.generating.load(Ordering::SeqCst)
    }
}

fn persist(path: &Path, project: &Project) -> Result<(), ProjectError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(|source| ProjectError::Write {
                path: path.to_path_buf(),
                source,
            })?;
        }
    }
    let serialized = serde_json::to_string_pretty(project).map_err(ProjectError::Serialize)?;
    fs::write(path, serialized).map_err(|source| ProjectError::Write {
        path: path.to_path_buf(),
        source,
    })
}
