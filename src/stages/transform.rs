use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tracing::{debug, info, warn};

use super::ModelSettings;
use crate::anthropic::client::parse_json_object;
use crate::collaborators::{
    ChatMessage, Completion, CompletionRequest, PullRequest, ResponseFormat, SourceHosting,
    TextCompletion,
};
use crate::error::FlowError;
use crate::orchestrator::{StageContext, StageExecutor};
use crate::process::run_with_timeout;
use crate::scanner::{ArchitectureMap, scan_repository};
use crate::state_machine::{Job, JobPatch, Stage, State};
use crate::workspace::relative_path;

/// Clones the repository, records the checkout, then scans it.
pub struct CloneAndScan {
    hosting: Arc<dyn SourceHosting>,
}

impl CloneAndScan {
    pub fn new(hosting: Arc<dyn SourceHosting>) -> Self {
        Self { hosting }
    }
}

#[async_trait]
impl StageExecutor for CloneAndScan {
    fn stage(&self) -> Stage {
        Stage::CloneAndScan
    }

    async fn execute(&self, job: &Job, ctx: &StageContext) -> Result<JobPatch, FlowError> {
        let repo_url = job.inputs.repo_url()?;
        let checkout = self.hosting.clone_repo(repo_url).await?;
        ctx.checkpoint(
            State::Scanning,
            JobPatch {
                cloned_repo_path: Some(checkout.clone()),
                ..Default::default()
            },
        )
        .await?;

        let root = checkout.clone();
        let map = tokio::task::spawn_blocking(move || scan_repository(&root))
            .await
            .map_err(|e| FlowError::collaborator("Scan aborted", e))?;
        let failed = map.values().filter(|s| s.error.is_some()).count();
        if failed > 0 {
            warn!(job_id = %job.id, failed, "some files could not be scanned");
        }
        info!(job_id = %job.id, files = map.len(), "repository scanned");
        Ok(JobPatch {
            architecture_map: Some(map),
            ..Default::default()
        })
    }
}

const REFACTOR_SYSTEM_PROMPT: &str = "You are a senior software engineer performing a \
refactoring across a repository. You receive an architecture map of the source files and the \
full contents of some of them. Return a JSON object whose keys are file paths relative to the \
repository root and whose values are the complete new contents of those files. Include only \
files you changed or created.";

/// Asks the model for whole-file rewrites and writes them into the checkout.
pub struct Refactor {
    completion: Arc<dyn TextCompletion>,
    model: ModelSettings,
    /// Files sent in full, taken in architecture-map order.
    file_limit: usize,
}

impl Refactor {
    pub fn new(completion: Arc<dyn TextCompletion>, model: ModelSettings, file_limit: usize) -> Self {
        Self {
            completion,
            model,
            file_limit,
        }
    }

    async fn build_prompt(
        &self,
        checkout: &Path,
        map: &ArchitectureMap,
        goal: &str,
    ) -> Result<String, FlowError> {
        let mut prompt = format!(
            "Refactoring goal:\n{goal}\n\nArchitecture map:\n{}\n\nFile contents:\n",
            serde_json::to_string_pretty(map)?
        );
        for path in map.keys().take(self.file_limit) {
            let content = match tokio::fs::read_to_string(checkout.join(path)).await {
                Ok(content) => content,
                Err(e) => {
                    debug!(file = %path, "leaving unreadable file out of the prompt: {e}");
                    continue;
                }
            };
            prompt.push_str(&format!("\n--- {path} ---\n{content}\n"));
        }
        Ok(prompt)
    }
}

/// Checks the reply is a non-empty object of path to contents with safe paths.
fn file_rewrites(value: Value) -> Result<Vec<(String, String)>, FlowError> {
    let Value::Object(entries) = value else {
        return Err(FlowError::Collaborator(
            "Malformed refactor response: expected a JSON object".into(),
        ));
    };
    if entries.is_empty() {
        return Err(FlowError::Collaborator(
            "Malformed refactor response: no files returned".into(),
        ));
    }
    let mut files = Vec::with_capacity(entries.len());
    for (path, content) in entries {
        let Value::String(content) = content else {
            return Err(FlowError::Collaborator(format!(
                "Malformed refactor response: contents of {path} is not a string"
            )));
        };
        let Some(safe) = relative_path(&path) else {
            return Err(FlowError::Collaborator(format!(
                "Malformed refactor response: path {path} escapes the repository"
            )));
        };
        files.push((safe, content));
    }
    Ok(files)
}

fn leaves_checkout(path: &str) -> FlowError {
    FlowError::Collaborator(format!(
        "Refusing to write {path}: it resolves outside the repository"
    ))
}

/// Joins `path` onto the checkout, refusing any existing component that is a
/// symbolic link. Cloned repositories may contain links pointing anywhere.
async fn contained_target(checkout: &Path, path: &str) -> Result<PathBuf, FlowError> {
    let mut current = checkout.to_path_buf();
    for component in Path::new(path).components() {
        current.push(component);
        match tokio::fs::symlink_metadata(&current).await {
            Ok(meta) if meta.file_type().is_symlink() => return Err(leaves_checkout(path)),
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => break,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(current)
}

#[async_trait]
impl StageExecutor for Refactor {
    fn stage(&self) -> Stage {
        Stage::Refactor
    }

    async fn execute(&self, job: &Job, _ctx: &StageContext) -> Result<JobPatch, FlowError> {
        let goal = job.inputs.prompt()?;
        let checkout = job.accumulated.cloned_repo_path()?;
        let map = job.accumulated.architecture_map()?;

        let prompt = self.build_prompt(checkout, map, goal).await?;
        debug!(job_id = %job.id, chars = prompt.len(), "requesting refactor");
        let reply = self
            .completion
            .complete(CompletionRequest {
                model: self.model.model.clone(),
                max_tokens: self.model.max_tokens,
                system: Some(REFACTOR_SYSTEM_PROMPT.to_string()),
                messages: vec![ChatMessage::user(prompt)],
                format: ResponseFormat::Json,
            })
            .await?;
        let value = match reply {
            Completion::Json(value) => value,
            Completion::Text(text) => parse_json_object(&text)?,
        };
        let files = file_rewrites(value)?;

        // Every target is checked before anything is written.
        let root = tokio::fs::canonicalize(checkout).await?;
        let mut targets = Vec::with_capacity(files.len());
        for (path, content) in files {
            let target = contained_target(&root, &path).await?;
            targets.push((path, target, content));
        }

        let mut written = Vec::with_capacity(targets.len());
        for (path, target, content) in targets {
            if let Some(parent) = target.parent() {
                tokio::fs::create_dir_all(parent).await?;
                if !tokio::fs::canonicalize(parent).await?.starts_with(&root) {
                    return Err(leaves_checkout(&path));
                }
            }
            tokio::fs::write(&target, content).await?;
            debug!(job_id = %job.id, file = %path, "file rewritten");
            written.push(path);
        }
        written.sort();
        info!(job_id = %job.id, files = written.len(), "refactor written");
        Ok(JobPatch {
            refactored_files: Some(written),
            ..Default::default()
        })
    }
}

/// Runs the test command inside the checkout.
pub struct Validate {
    command: Vec<String>,
    timeout: Duration,
}

impl Validate {
    pub fn new(command: Vec<String>, timeout: Duration) -> Self {
        Self { command, timeout }
    }
}

#[async_trait]
impl StageExecutor for Validate {
    fn stage(&self) -> Stage {
        Stage::Validate
    }

    async fn execute(&self, job: &Job, _ctx: &StageContext) -> Result<JobPatch, FlowError> {
        let checkout = job.accumulated.cloned_repo_path()?;
        let output = run_with_timeout(&self.command, checkout, self.timeout).await?;
        if !output.success() {
            let code = output
                .code
                .map_or_else(|| "killed by signal".to_string(), |c| c.to_string());
            return Err(FlowError::Validation(format!(
                "Tests failed (exit code {code}):\n{}",
                output.combined()
            )));
        }
        info!(job_id = %job.id, "tests passed");
        Ok(JobPatch {
            validation_log: Some(output.combined()),
            ..Default::default()
        })
    }
}

/// Pushes the refactor to a fresh branch and opens a pull request.
pub struct CreatePr {
    hosting: Arc<dyn SourceHosting>,
    base_branch: String,
    branch_prefix: String,
}

impl CreatePr {
    pub fn new(
        hosting: Arc<dyn SourceHosting>,
        base_branch: impl Into<String>,
        branch_prefix: impl Into<String>,
    ) -> Self {
        Self {
            hosting,
            base_branch: base_branch.into(),
            branch_prefix: branch_prefix.into(),
        }
    }
}

fn pull_request_body(goal: &str, files: &[String], validated: bool) -> String {
    let mut body = format!("## Goal\n\n{goal}\n\n## Files changed\n\n");
    if files.is_empty() {
        body.push_str("_none recorded_\n");
    }
    for file in files {
        body.push_str(&format!("- `{file}`\n"));
    }
    let status = if validated { "passed" } else { "not run" };
    body.push_str(&format!("\n## Validation\n\nTest suite: {status}\n"));
    body
}

#[async_trait]
impl StageExecutor for CreatePr {
    fn stage(&self) -> Stage {
        Stage::CreatePr
    }

    async fn execute(&self, job: &Job, _ctx: &StageContext) -> Result<JobPatch, FlowError> {
        let repo_url = job.inputs.repo_url()?;
        let goal = job.inputs.prompt()?;
        let checkout = job.accumulated.cloned_repo_path()?;

        let branch = format!("{}-{}", self.branch_prefix, Utc::now().timestamp());
        let message = format!("Automated refactoring by patchwright\n\n{goal}");
        self.hosting
            .commit_and_push(checkout, &branch, &message)
            .await?;

        let summary: String = goal.chars().take(50).collect();
        let files = job.accumulated.refactored_files.as_deref().unwrap_or(&[]);
        let request = PullRequest {
            repo_url: repo_url.to_string(),
            branch: branch.clone(),
            base: self.base_branch.clone(),
            title: format!("[patchwright] Automated refactoring: {summary}"),
            body: pull_request_body(goal, files, job.accumulated.validation_log.is_some()),
        };
        let url = self.hosting.open_pull_request(&request).await?;
        info!(job_id = %job.id, %branch, %url, "pull request opened");
        Ok(JobPatch {
            pull_request_branch: Some(branch),
            pull_request_url: Some(url),
            ..Default::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::Mutex;

    use tempfile::TempDir;

    use crate::orchestrator::{Orchestrator, StageRun};
    use crate::queue::RecordingQueue;
    use crate::state_machine::{FailureKind, JobInputs, TRANSFORM};
    use crate::store::{JobStore, MemoryStore};

    const REPO: &str = "https://github.com/acme/toy.git";

    /// Hosting double: "clones" by copying a fixture and records pushes.
    struct Fixture {
        source: PathBuf,
        scratch: PathBuf,
        pushed: Mutex<Vec<(String, String)>>,
        opened: Mutex<Vec<PullRequest>>,
    }

    impl Fixture {
        fn new(source: &Path, scratch: &Path) -> Arc<Self> {
            Arc::new(Self {
                source: source.to_path_buf(),
                scratch: scratch.to_path_buf(),
                pushed: Mutex::new(Vec::new()),
                opened: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl SourceHosting for Fixture {
        async fn clone_repo(&self, url: &str) -> Result<PathBuf, FlowError> {
            if url.contains("missing") {
                return Err(FlowError::Collaborator(
                    "Failed to clone repository: not found".into(),
                ));
            }
            let dest = self.scratch.join("checkout");
            std::fs::create_dir_all(&dest)?;
            for entry in std::fs::read_dir(&self.source)? {
                let entry = entry?;
                std::fs::copy(entry.path(), dest.join(entry.file_name()))?;
            }
            Ok(dest)
        }

        async fn commit_and_push(
            &self,
            _checkout: &Path,
            branch: &str,
            message: &str,
        ) -> Result<(), FlowError> {
            self.pushed
                .lock()
                .unwrap()
                .push((branch.to_string(), message.to_string()));
            Ok(())
        }

        async fn open_pull_request(&self, request: &PullRequest) -> Result<String, FlowError> {
            self.opened.lock().unwrap().push(request.clone());
            Ok("https://github.com/acme/toy/pull/7".into())
        }
    }

    /// Hosting double standing in for a second worker that reaches the scan
    /// checkpoint while this one is still cloning.
    struct Overtaken {
        store: Arc<MemoryStore>,
        checkout: PathBuf,
    }

    #[async_trait]
    impl SourceHosting for Overtaken {
        async fn clone_repo(&self, _url: &str) -> Result<PathBuf, FlowError> {
            for job in self.store.list().await? {
                self.store
                    .update(
                        &job.id,
                        Box::new(|j: &mut Job| {
                            j.transition(State::Scanning);
                            Ok(())
                        }),
                    )
                    .await?;
            }
            Ok(self.checkout.clone())
        }

        async fn commit_and_push(&self, _: &Path, _: &str, _: &str) -> Result<(), FlowError> {
            Ok(())
        }

        async fn open_pull_request(&self, _: &PullRequest) -> Result<String, FlowError> {
            Ok(String::new())
        }
    }

    struct Reply(Completion);

    #[async_trait]
    impl TextCompletion for Reply {
        async fn complete(&self, request: CompletionRequest) -> Result<Completion, FlowError> {
            assert_eq!(request.format, ResponseFormat::Json);
            Ok(self.0.clone())
        }
    }

    fn settings() -> ModelSettings {
        ModelSettings {
            model: "test-model".into(),
            max_tokens: 4096,
        }
    }

    fn harness(executor: Arc<dyn StageExecutor>) -> (Orchestrator, Arc<RecordingQueue>) {
        let queue = Arc::new(RecordingQueue::new());
        let orch = Orchestrator::new(&TRANSFORM, Arc::new(MemoryStore::new()), queue.clone())
            .with_executor(executor);
        (orch, queue)
    }

    async fn job_at(orch: &Orchestrator, state: State, patch: JobPatch) -> String {
        let id = orch
            .start_workflow(JobInputs::transform(REPO, "use pathlib everywhere"))
            .await
            .unwrap();
        if state != State::Cloning {
            orch.update_job_state(&id, state, patch).await.unwrap();
        }
        id
    }

    fn toy_repo(tmp: &TempDir) -> PathBuf {
        let source = tmp.path().join("source");
        std::fs::create_dir_all(&source).unwrap();
        std::fs::write(source.join("app.py"), "import os\n\ndef main():\n    pass\n").unwrap();
        source
    }

    fn checkout_patch(path: &Path) -> JobPatch {
        JobPatch {
            cloned_repo_path: Some(path.to_path_buf()),
            architecture_map: Some(scan_repository(path)),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn clone_and_scan_records_checkout_and_map() {
        let tmp = TempDir::new().unwrap();
        let hosting = Fixture::new(&toy_repo(&tmp), tmp.path());
        let (orch, queue) = harness(Arc::new(CloneAndScan::new(hosting)));
        let id = job_at(&orch, State::Cloning, JobPatch::default()).await;
        queue.pop();

        let run = orch.run_stage(Stage::CloneAndScan, &id).await.unwrap();
        assert_eq!(run, StageRun::Completed(State::Refactoring));
        let job = orch.get_job_status(&id).await.unwrap();
        assert_eq!(
            job.states_seen(),
            vec![State::Cloning, State::Scanning, State::Refactoring]
        );
        assert!(job.accumulated.cloned_repo_path.unwrap().ends_with("checkout"));
        let map = job.accumulated.architecture_map.unwrap();
        assert_eq!(map["app.py"].imports, vec!["os"]);
        assert_eq!(queue.pop().unwrap().stage, Stage::Refactor);
    }

    #[tokio::test]
    async fn losing_the_scan_checkpoint_skips_instead_of_failing() {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::new());
        let hosting = Arc::new(Overtaken {
            store: store.clone(),
            checkout: toy_repo(&tmp),
        });
        let queue = Arc::new(RecordingQueue::new());
        let orch = Orchestrator::new(&TRANSFORM, store.clone(), queue.clone())
            .with_executor(Arc::new(CloneAndScan::new(hosting)));
        let id = job_at(&orch, State::Cloning, JobPatch::default()).await;
        queue.pop();

        let run = orch.run_stage(Stage::CloneAndScan, &id).await.unwrap();
        assert!(matches!(run, StageRun::Skipped(_)), "{run:?}");
        let job = orch.get_job_status(&id).await.unwrap();
        assert_eq!(job.state, State::Scanning);
        assert!(job.error_message.is_none());
        assert!(job.failure_kind.is_none());
        assert!(queue.pop().is_none());
    }

    #[tokio::test]
    async fn clone_failure_errors_the_job() {
        let tmp = TempDir::new().unwrap();
        let hosting = Fixture::new(&toy_repo(&tmp), tmp.path());
        let (orch, _) = harness(Arc::new(CloneAndScan::new(hosting)));
        let id = orch
            .start_workflow(JobInputs::transform("https://github.com/acme/missing", "x"))
            .await
            .unwrap();

        orch.run_stage(Stage::CloneAndScan, &id).await.unwrap();
        let job = orch.get_job_status(&id).await.unwrap();
        assert_eq!(job.state, State::Error);
        assert!(job.error_message.unwrap().contains("Failed to clone"));
    }

    #[tokio::test]
    async fn refactor_writes_files_and_creates_directories() {
        let tmp = TempDir::new().unwrap();
        let checkout = toy_repo(&tmp);
        let reply = Completion::Text(
            "```json\n{\"app.py\": \"from pathlib import Path\\n\", \"pkg/util.py\": \"X = 1\\n\"}\n```"
                .into(),
        );
        let (orch, queue) = harness(Arc::new(Refactor::new(Arc::new(Reply(reply)), settings(), 10)));
        let id = job_at(&orch, State::Refactoring, checkout_patch(&checkout)).await;
        queue.pop();

        let run = orch.run_stage(Stage::Refactor, &id).await.unwrap();
        assert_eq!(run, StageRun::Completed(State::Validating));
        assert_eq!(
            std::fs::read_to_string(checkout.join("app.py")).unwrap(),
            "from pathlib import Path\n"
        );
        assert!(checkout.join("pkg/util.py").is_file());
        let job = orch.get_job_status(&id).await.unwrap();
        assert_eq!(
            job.accumulated.refactored_files.unwrap(),
            vec!["app.py", "pkg/util.py"]
        );
    }

    #[tokio::test]
    async fn refactor_rejects_malformed_replies() {
        for reply in [
            Completion::Text("I refactored it for you!".into()),
            Completion::Json(serde_json::json!({ "app.py": 3 })),
            Completion::Json(serde_json::json!({})),
            Completion::Json(serde_json::json!({ "../outside.py": "x" })),
        ] {
            let tmp = TempDir::new().unwrap();
            let checkout = toy_repo(&tmp);
            let (orch, _) =
                harness(Arc::new(Refactor::new(Arc::new(Reply(reply)), settings(), 10)));
            let id = job_at(&orch, State::Refactoring, checkout_patch(&checkout)).await;

            orch.run_stage(Stage::Refactor, &id).await.unwrap();
            let job = orch.get_job_status(&id).await.unwrap();
            assert_eq!(job.state, State::Error);
            assert!(!tmp.path().join("outside.py").exists());
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn refactor_refuses_to_follow_symlinks_out_of_the_checkout() {
        let tmp = TempDir::new().unwrap();
        let checkout = toy_repo(&tmp);
        let outside = tmp.path().join("outside");
        std::fs::create_dir_all(&outside).unwrap();
        std::fs::write(outside.join("victim.py"), "safe\n").unwrap();
        std::os::unix::fs::symlink(&outside, checkout.join("link")).unwrap();
        std::os::unix::fs::symlink(outside.join("victim.py"), checkout.join("victim.py"))
            .unwrap();

        for reply in [
            serde_json::json!({ "app.py": "X = 1\n", "link/pwned.py": "owned\n" }),
            serde_json::json!({ "link/deeper/pwned.py": "owned\n" }),
            serde_json::json!({ "victim.py": "owned\n" }),
        ] {
            let (orch, _) = harness(Arc::new(Refactor::new(
                Arc::new(Reply(Completion::Json(reply))),
                settings(),
                10,
            )));
            let id = job_at(&orch, State::Refactoring, checkout_patch(&checkout)).await;

            orch.run_stage(Stage::Refactor, &id).await.unwrap();
            let job = orch.get_job_status(&id).await.unwrap();
            assert_eq!(job.state, State::Error);
            assert!(job.error_message.unwrap().contains("outside the repository"));
        }
        assert!(!outside.join("pwned.py").exists());
        assert!(!outside.join("deeper").exists());
        assert_eq!(
            std::fs::read_to_string(outside.join("victim.py")).unwrap(),
            "safe\n"
        );
        // Nothing is written when any target is refused.
        assert_eq!(
            std::fs::read_to_string(checkout.join("app.py")).unwrap(),
            "import os\n\ndef main():\n    pass\n"
        );
    }

    #[tokio::test]
    async fn failing_tests_report_both_streams() {
        let tmp = TempDir::new().unwrap();
        let command = vec![
            "sh".to_string(),
            "-c".to_string(),
            "echo '1 failed'; echo 'AssertionError' >&2; exit 1".to_string(),
        ];
        let (orch, _) = harness(Arc::new(Validate::new(command, Duration::from_secs(10))));
        let patch = JobPatch {
            cloned_repo_path: Some(tmp.path().to_path_buf()),
            ..Default::default()
        };
        let id = job_at(&orch, State::Validating, patch).await;

        orch.run_stage(Stage::Validate, &id).await.unwrap();
        let job = orch.get_job_status(&id).await.unwrap();
        assert_eq!(job.failure_kind, Some(FailureKind::Validation));
        let message = job.error_message.unwrap();
        assert!(message.contains("exit code 1"));
        assert!(message.contains("1 failed"));
        assert!(message.contains("AssertionError"));
    }

    #[tokio::test]
    async fn slow_tests_time_out() {
        let tmp = TempDir::new().unwrap();
        let command = vec!["sh".to_string(), "-c".to_string(), "sleep 5".to_string()];
        let (orch, _) = harness(Arc::new(Validate::new(command, Duration::from_millis(100))));
        let patch = JobPatch {
            cloned_repo_path: Some(tmp.path().to_path_buf()),
            ..Default::default()
        };
        let id = job_at(&orch, State::Validating, patch).await;

        orch.run_stage(Stage::Validate, &id).await.unwrap();
        let job = orch.get_job_status(&id).await.unwrap();
        assert_eq!(job.failure_kind, Some(FailureKind::Timeout));
    }

    #[tokio::test]
    async fn create_pr_pushes_branch_and_records_url() {
        let tmp = TempDir::new().unwrap();
        let hosting = Fixture::new(&toy_repo(&tmp), tmp.path());
        let (orch, _) = harness(Arc::new(CreatePr::new(
            hosting.clone(),
            "main",
            "patchwright-refactor",
        )));
        let patch = JobPatch {
            cloned_repo_path: Some(tmp.path().join("source")),
            refactored_files: Some(vec!["app.py".into()]),
            validation_log: Some("Stdout:\n1 passed\n\nStderr:\n".into()),
            ..Default::default()
        };
        let id = job_at(&orch, State::CreatingPr, patch).await;

        let run = orch.run_stage(Stage::CreatePr, &id).await.unwrap();
        assert_eq!(run, StageRun::Completed(State::Done));
        let job = orch.get_job_status(&id).await.unwrap();
        assert_eq!(
            job.accumulated.pull_request_url.as_deref(),
            Some("https://github.com/acme/toy/pull/7")
        );

        let pushed = hosting.pushed.lock().unwrap().clone();
        let (branch, message) = &pushed[0];
        assert!(branch.starts_with("patchwright-refactor-"));
        assert_eq!(job.accumulated.pull_request_branch.as_ref(), Some(branch));
        assert!(message.ends_with("use pathlib everywhere"));

        let opened = hosting.opened.lock().unwrap().clone();
        assert_eq!(opened[0].base, "main");
        assert_eq!(
            opened[0].title,
            "[patchwright] Automated refactoring: use pathlib everywhere"
        );
        assert!(opened[0].body.contains("- `app.py`"));
        assert!(opened[0].body.contains("Test suite: passed"));
    }
}
