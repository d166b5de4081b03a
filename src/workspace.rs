//! Project workspaces on local disk: `<projects_root>/<user_id>/<project_id>`.

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use tracing::{debug, info};
use uuid::Uuid;
use walkdir::WalkDir;

use crate::collaborators::{ContextCollector, PromptEnrichment};
use crate::error::FlowError;
use crate::scanner::{is_ignored_dir, relative_key};

/// Normalises a project-relative path, or `None` when it is absolute, empty
/// or climbs out of the root.
pub fn relative_path(path: &str) -> Option<String> {
    let mut parts = Vec::new();
    for component in Path::new(path).components() {
        match component {
            Component::Normal(part) => parts.push(part.to_string_lossy().into_owned()),
            Component::CurDir => {}
            _ => return None,
        }
    }
    (!parts.is_empty()).then(|| parts.join("/"))
}

/// Files above this size are left out of the context.
pub const MAX_CONTEXT_FILE_BYTES: u64 = 256 * 1024;

#[derive(Debug, Clone)]
pub struct ProjectPaths {
    root: PathBuf,
}

impl ProjectPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory of an existing project. Both ids must be UUIDs.
    pub fn resolve(&self, user_id: &str, project_id: &str) -> Result<PathBuf, FlowError> {
        let (Ok(user), Ok(project)) = (Uuid::parse_str(user_id), Uuid::parse_str(project_id))
        else {
            return Err(FlowError::Collaborator(
                "Invalid user_id or project_id format.".into(),
            ));
        };
        let path = self.root.join(user.to_string()).join(project.to_string());
        if !path.is_dir() {
            return Err(FlowError::Collaborator(format!(
                "Project directory not found for project_id: {project_id}"
            )));
        }
        Ok(path)
    }
}

/// Collects every readable project file as context.
///
/// There is no relevance ranking yet; the prompt is only logged.
pub struct WorkspaceContextCollector {
    paths: ProjectPaths,
    max_file_bytes: u64,
}

impl WorkspaceContextCollector {
    pub fn new(paths: ProjectPaths) -> Self {
        Self {
            paths,
            max_file_bytes: MAX_CONTEXT_FILE_BYTES,
        }
    }

    pub fn with_max_file_bytes(mut self, max: u64) -> Self {
        self.max_file_bytes = max;
        self
    }
}

fn collect_files(root: &Path, max_file_bytes: u64) -> Result<BTreeMap<String, String>, FlowError> {
    let mut files = BTreeMap::new();
    let walker = WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| {
            !(e.file_type().is_dir() && is_ignored_dir(&e.file_name().to_string_lossy()))
        });

    for entry in walker {
        let entry = entry.map_err(|e| FlowError::collaborator("Failed to walk project", e))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let Some(key) = relative_key(root, entry.path()) else {
            continue;
        };
        let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
        if size > max_file_bytes {
            debug!(file = %key, size, "skipping large file");
            continue;
        }
        let content = match std::fs::read(entry.path()).map(String::from_utf8) {
            Ok(Ok(text)) => text,
            Ok(Err(_)) => "[binary file omitted]".to_string(),
            Err(e) => format!("[unreadable file omitted: {e}]"),
        };
        files.insert(key, content);
    }
    Ok(files)
}

#[async_trait]
impl ContextCollector for WorkspaceContextCollector {
    async fn build(
        &self,
        user_id: &str,
        project_id: &str,
        prompt: &str,
    ) -> Result<BTreeMap<String, String>, FlowError> {
        let root = self.paths.resolve(user_id, project_id)?;
        debug!(project_id, prompt_len = prompt.len(), "building context");
        let max = self.max_file_bytes;
        let files = tokio::task::spawn_blocking(move || collect_files(&root, max))
            .await
            .map_err(|e| FlowError::collaborator("Context collection aborted", e))??;
        info!(project_id, files = files.len(), "context built");
        Ok(files)
    }
}

const GUIDELINES: &[&str] = &[
    "Keep changes minimal and focused on the request.",
    "Preserve existing public interfaces unless the request says otherwise.",
    "Follow the style and conventions already used in the project.",
    "Handle errors explicitly instead of ignoring them.",
    "Add or update tests when behaviour changes.",
];

/// Appends a fixed list of engineering guidelines to every prompt.
pub struct GuidelineEnricher {
    guidelines: Vec<String>,
}

impl Default for GuidelineEnricher {
    fn default() -> Self {
        Self {
            guidelines: GUIDELINES.iter().map(|g| g.to_string()).collect(),
        }
    }
}

impl GuidelineEnricher {
    pub fn new(guidelines: Vec<String>) -> Self {
        Self { guidelines }
    }
}

impl PromptEnrichment for GuidelineEnricher {
    fn enrich(&self, prompt: &str) -> String {
        if self.guidelines.is_empty() {
            return prompt.to_string();
        }
        let mut enriched = format!("{}\n\nGuidelines:\n", prompt.trim_end());
        for guideline in &self.guidelines {
            enriched.push_str("- ");
            enriched.push_str(guideline);
            enriched.push('\n');
        }
        enriched
    }
}
