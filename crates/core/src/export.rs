use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::script::PhaseScript;

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("写入导出文件 `{path}` 失败: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Renders a phase script as a plain-text document: a heading line followed
/// by one block per episode, in episode order. A pure read of the data model.
pub fn render_phase_document(title: &str, script: &PhaseScript) -> String {
    let mut document = String::new();
    document.push_str(&format!(
        "{}  第 {} 阶段（{}）\n",
        title,
        script.phase_index,
        script.style.label()
    ));
    document.push_str(&format!(
        "生成时间：{}\n",
        script.generated_at.format("%Y-%m-%d %H:%M:%S UTC")
    ));

    for episode in &script.episodes {
        document.push('\n');
        document.push_str(&format!("第{}集 {}\n", episode.number, episode.title));
        document.push_str(&episode.content);
        document.push('\n');
    }

    document
}

pub fn write_phase_document(
    path: &Path,
    title: &str,
    script: &PhaseScript,
) -> Result<(), ExportError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(|source| ExportError::Write {
                path: path.to_path_buf(),
                source,
            })?;
        }
    }
    fs::write(path, render_phase_document(title, script)).map_err(|source| ExportError::Write {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::{Episode, ScriptStyle};
    use chrono::Utc;
    use tempfile::tempdir;

    fn sample_script() -> PhaseScript {
        PhaseScript {
            phase_index: 2,
            episodes: vec![
                Episode {
                    number: 11,
                    title: "风起".into(),
                    content: "第一场正文".into(),
                },
                Episode {
                    number: 12,
                    title: "雷动".into(),
                    content: "第二场正文".into(),
                },
            ],
            style: ScriptStyle::Emotional,
            generated_at: Utc::now(),
        }
    }

    #[test]
    fn renders_episodes_in_order() {
        let document = render_phase_document("判官", &sample_script());
        assert!(document.starts_with("判官  第 2 阶段（情绪流）"));
        let pos11 = document.find("第11集 风起").unwrap();
        let pos12 = document.find("第12集 雷动").unwrap();
        assert!(pos11 < pos12);
        assert!(document.contains("第一场正文"));
    }

    #[test]
    fn writes_document_to_disk() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("exports").join("phase-2.txt");
        write_phase_document(&path, "判官", &sample_script()).unwrap();
        let written = fs::read_to_string(&path).unwrap();
        assert!(written.contains("第12集 雷动"));
    }
}
