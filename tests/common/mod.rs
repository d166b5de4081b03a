#![allow(dead_code)]

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use git2::build::RepoBuilder;
use git2::{Repository, Signature};

use patchwright::collaborators::{
    Completion, CompletionRequest, ContextCollector, TextCompletion,
};
use patchwright::config::PatchwrightConfig;
use patchwright::queue::{LocalQueue, TaskQueue, WorkerPool};
use patchwright::store::{JobStore, MemoryStore};
use patchwright::workflows::{Collaborators, Workflows};
use patchwright::FlowError;
use patchwright::state_machine::RetryConfig;

pub const USER: &str = "6f1c5a4e-93a1-4a55-8a4b-1d2f3e4a5b6c";
pub const PROJECT: &str = "0b7d9c1e-2f3a-4b5c-8d6e-7f8091a2b3c4";
pub const SETTLE: Duration = Duration::from_secs(20);

/// Completion double that answers every request with the same reply and
/// remembers what it was asked.
pub struct FixedCompletion {
    reply: Completion,
    pub requests: Mutex<Vec<CompletionRequest>>,
}

impl FixedCompletion {
    pub fn new(reply: Completion) -> Arc<Self> {
        Arc::new(Self {
            reply,
            requests: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl TextCompletion for FixedCompletion {
    async fn complete(&self, request: CompletionRequest) -> Result<Completion, FlowError> {
        self.requests.lock().unwrap().push(request);
        Ok(self.reply.clone())
    }
}

/// Context collector that counts calls and returns one file.
#[derive(Default)]
pub struct CountingCollector {
    pub calls: AtomicUsize,
}

impl CountingCollector {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ContextCollector for CountingCollector {
    async fn build(
        &self,
        _user_id: &str,
        _project_id: &str,
        _prompt: &str,
    ) -> Result<BTreeMap<String, String>, FlowError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(BTreeMap::from([(
            "app.py".to_string(),
            "print('hi')\n".to_string(),
        )]))
    }
}

/// Settings pointing every directory into `root`.
pub fn config(root: &Path) -> PatchwrightConfig {
    PatchwrightConfig {
        projects_root: root.join("projects"),
        scratch_root: root.join("scratch"),
        store_dir: root.join("jobs"),
        workers: 2,
        base_delay_ms: 10,
        ..PatchwrightConfig::default()
    }
}

/// Creates `<projects_root>/USER/PROJECT` holding `files`.
pub fn project(config: &PatchwrightConfig, files: &[(&str, &str)]) -> PathBuf {
    let dir = config.projects_root.join(USER).join(PROJECT);
    std::fs::create_dir_all(&dir).unwrap();
    for (name, content) in files {
        let path = dir.join(name);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }
    dir
}

/// Production collaborators with the model swapped for `completion`.
pub fn collaborators(
    config: &PatchwrightConfig,
    completion: Arc<dyn TextCompletion>,
) -> Collaborators {
    let mut collaborators = Collaborators::from_config(config).unwrap();
    collaborators.completion = completion;
    collaborators
}

/// Both pipelines on a memory store, run by an in-process worker pool.
pub fn engine(
    config: &PatchwrightConfig,
    collaborators: Collaborators,
) -> (Arc<Workflows>, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let (queue, deliveries) = LocalQueue::channel();
    let workflows = Arc::new(
        Workflows::build(store.clone(), Arc::new(queue), collaborators, config).unwrap(),
    );
    WorkerPool::spawn(
        deliveries,
        workflows.clone(),
        config.workers,
        RetryConfig {
            max_retries: 1,
            base_delay_ms: 10,
        },
    );
    (workflows, store)
}

/// Both pipelines on a memory store with a queue nobody consumes.
pub fn stepped(
    config: &PatchwrightConfig,
    collaborators: Collaborators,
    queue: Arc<dyn TaskQueue>,
) -> (Workflows, Arc<dyn JobStore>) {
    let store: Arc<dyn JobStore> = Arc::new(MemoryStore::new());
    let workflows = Workflows::build(store.clone(), queue, collaborators, config).unwrap();
    (workflows, store)
}

/// A bare repository at `<root>/acme/toy.git` whose single commit holds `files`.
pub fn origin(root: &Path, files: &[(&str, &str)]) -> PathBuf {
    let seed = root.join("seed");
    let repo = Repository::init(&seed).unwrap();
    let mut index = repo.index().unwrap();
    for (name, content) in files {
        std::fs::write(seed.join(name), content).unwrap();
        index.add_path(Path::new(name)).unwrap();
    }
    index.write().unwrap();
    let tree = repo.find_tree(index.write_tree().unwrap()).unwrap();
    let sig = Signature::now("test", "test@test.com").unwrap();
    repo.commit(Some("HEAD"), &sig, &sig, "initial", &tree, &[])
        .unwrap();

    let bare = root.join("acme").join("toy.git");
    RepoBuilder::new()
        .bare(true)
        .clone(seed.to_str().unwrap(), &bare)
        .unwrap();
    bare
}
