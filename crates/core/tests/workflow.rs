use std::collections::VecDeque;
use std::sync::Mutex;

use chrono::Utc;
use drama_core::{
    start_episode_number, AudienceMode, BackendError, FileCategory, GenerationRequest,
    GenerationSelections, GenerativeBackend, OutlineRequest, OutlineService, PhaseScriptService,
    Project, ProjectStore, PromptRegistry, ReferenceFile, ScriptStyle, VecLogSink,
};
use serde_json::json;
use tempfile::tempdir;

struct ScriptedBackend {
    responses: Mutex<VecDeque<Result<String, String>>>,
    requests: Mutex<Vec<GenerationRequest>>,
}

impl ScriptedBackend {
    fn new<I: IntoIterator<Item = Result<String, String>>>(responses: I) -> Self {
        Self {
            responses: Mutex::new(responses.into_iter().collect()),
            requests: Mutex::new(Vec::new()),
        }
    }

    fn requests(&self) -> Vec<GenerationRequest> {
        self.requests.lock().unwrap().clone()
    }
}

impl GenerativeBackend for ScriptedBackend {
    fn generate(&self, request: &GenerationRequest) -> Result<String, BackendError> {
        self.requests.lock().unwrap().push(request.clone());
        match self.responses.lock().unwrap().pop_front() {
            Some(Ok(text)) => Ok(text),
            Some(Err(message)) => Err(BackendError::new(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                message,
            ))),
            None => panic!("scripted backend exhausted"),
        }
    }
}

fn outline_response() -> String {
    json!({
        "content": "判官传人复仇记",
        "characters": [{
            "name": "林川",
            "gender": "男",
            "age": "22",
            "identity": "判官传人",
            "appearance": "青衫执笔",
            "growth": "从逃避到执掌",
            "motivation": "查清灭门真相"
        }],
        "phasePlans": [
            { "phaseIndex": 1, "episodes": 10, "description": "开篇建模", "climax": "判官笔觉醒" },
            { "phaseIndex": 2, "episodes": 8, "description": "宗门对抗", "climax": "身份暴露" }
        ]
    })
    .to_string()
}

fn phase_response(titles: &[&str]) -> String {
    let episodes: Vec<serde_json::Value> = titles
        .iter()
        .map(|title| {
            json!({ "episodeNumber": 1, "title": title, "content": format!("{title}正文") })
        })
        .collect();
    json!({ "episodes": episodes }).to_string()
}

fn seeded_project() -> Project {
    let mut project = Project::new("判官");
    project.mode = AudienceMode::Male;
    project.add_file(ReferenceFile::new(
        "novel.txt",
        FileCategory::SourceNovel,
        "原著：判官笔认主，少年入局。",
    ));
    project.add_file(ReferenceFile::new(
        "layout.txt",
        FileCategory::LayoutReference,
        "第X集 剧名 正文",
    ));
    project
}

#[test]
fn outline_then_phases_then_regeneration() {
    let temp = tempdir().unwrap();
    let store = ProjectStore::create(temp.path().join("project.json"), seeded_project()).unwrap();
    let prompts = PromptRegistry::new().unwrap();
    let sink = VecLogSink::new();

    let backend = ScriptedBackend::new([
        Ok(outline_response()),
        Ok(phase_response(&["开局", "立威", "结仇"])),
        Ok(phase_response(&["宗门", "对峙", "暴露"])),
        Ok(phase_response(&["重写一", "重写二"])),
    ]);

    // Outline.
    let project = store.snapshot().unwrap();
    let outline_service = OutlineService::new(&prompts, &sink);
    let outline = outline_service
        .generate(
            &backend,
            &OutlineRequest::new(
                project.combined_text(FileCategory::SourceNovel),
                project.mode,
            ),
        )
        .unwrap();
    assert_eq!(outline.total_episodes(), 18);
    store.commit_outline(outline).unwrap();

    let script_service = PhaseScriptService::new(&prompts, &sink);

    // Phase 1 opens the series.
    let project = store.snapshot().unwrap();
    let selections = GenerationSelections::all_files(&project, ScriptStyle::Emotional);
    let script = script_service
        .generate(&backend, &project, 1, &selections)
        .unwrap();
    let numbers: Vec<u32> = script.episodes.iter().map(|e| e.number).collect();
    assert_eq!(numbers, vec![1, 2, 3]);
    store.commit_script(script).unwrap();

    let phase1_request = &backend.requests()[1];
    assert!(phase1_request.system_instruction.contains("开篇指令"));
    assert!(phase1_request.user_content.contains("无"));

    // Phase 2 starts at 11 because the plan says 10 episodes come first,
    // even though phase 1 actually returned 3.
    let project = store.snapshot().unwrap();
    assert_eq!(
        start_episode_number(project.outline.as_ref().unwrap(), 2),
        11
    );
    let script = script_service
        .generate(&backend, &project, 2, &selections)
        .unwrap();
    let numbers: Vec<u32> = script.episodes.iter().map(|e| e.number).collect();
    assert_eq!(numbers, vec![11, 12, 13]);
    store.commit_script(script).unwrap();

    let phase2_request = &backend.requests()[2];
    assert!(phase2_request.system_instruction.contains("无缝衔接指令"));
    assert!(phase2_request.user_content.contains("第3集（结仇）：结仇正文"));

    // Regenerating phase 2 replaces it and leaves phase 1 untouched.
    let project = store.snapshot().unwrap();
    let script = script_service
        .generate(&backend, &project, 2, &selections)
        .unwrap();
    store.commit_script(script).unwrap();

    let project = store.snapshot().unwrap();
    assert_eq!(project.scripts.len(), 2);
    assert_eq!(project.script(2).unwrap().episodes.len(), 2);
    assert_eq!(project.script(2).unwrap().episodes[0].title, "重写一");
    assert_eq!(project.script(1).unwrap().episodes.len(), 3);
}

#[test]
fn backend_failure_leaves_stored_state_unchanged() {
    let temp = tempdir().unwrap();
    let mut project = seeded_project();
    project.outline = Some({
        let backend = ScriptedBackend::new([Ok(outline_response())]);
        let prompts = PromptRegistry::new().unwrap();
        let sink = VecLogSink::new();
        OutlineService::new(&prompts, &sink)
            .generate(
                &backend,
                &OutlineRequest::new("原著素材", AudienceMode::Male),
            )
            .unwrap()
    });
    let store = ProjectStore::create(temp.path().join("project.json"), project).unwrap();

    let before = store.snapshot().unwrap();
    let backend = ScriptedBackend::new([Err("connection reset".to_string())]);
    let prompts = PromptRegistry::new().unwrap();
    let sink = VecLogSink::new();
    let service = PhaseScriptService::new(&prompts, &sink);

    let project = store.snapshot().unwrap();
    let result = service.generate(
        &backend,
        &project,
        1,
        &GenerationSelections::all_files(&project, ScriptStyle::Emotional),
    );
    assert!(result.is_err());
    assert_eq!(store.snapshot().unwrap(), before);
}

#[test]
fn generation_slot_blocks_a_second_run() {
    let temp = tempdir().unwrap();
    let store = ProjectStore::create(temp.path().join("project.json"), seeded_project()).unwrap();

    let guard = store.begin_generation().expect("slot free");
    assert!(store.begin_generation().is_none());
    drop(guard);
    assert!(store.begin_generation().is_some());

    // Sanity: timestamps on fresh projects are coherent.
    let project = store.snapshot().unwrap();
    assert!(project.created_at <= Utc::now());
}
