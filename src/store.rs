//! Keyed job storage.
//!
//! [`JobStore`] is the only shared mutable resource in the engine. Updates go
//! through [`JobStore::update`], which applies a mutation to the current record
//! atomically, so concurrent writers never replace each other's fields.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use fs2::FileExt;
use tokio::sync::RwLock;

use crate::error::FlowError;
use crate::state_machine::Job;

/// Mutation applied to a job under the store's write lock. Returning an error
/// leaves the stored record untouched.
pub type UpdateFn<'a> = Box<dyn FnOnce(&mut Job) -> Result<(), FlowError> + Send + 'a>;

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Stores a new job. Fails if the id is already taken.
    async fn insert(&self, job: Job) -> Result<(), FlowError>;

    async fn get(&self, id: &str) -> Result<Option<Job>, FlowError>;

    /// Applies `apply` to the job and persists the result, returning it.
    async fn update(&self, id: &str, apply: UpdateFn<'_>) -> Result<Job, FlowError>;

    async fn list(&self) -> Result<Vec<Job>, FlowError>;
}

#[derive(Default)]
pub struct MemoryStore {
    jobs: RwLock<HashMap<String, Job>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn insert(&self, job: Job) -> Result<(), FlowError> {
        let mut jobs = self.jobs.write().await;
        if jobs.contains_key(&job.id) {
            return Err(FlowError::DuplicateJob(job.id));
        }
        jobs.insert(job.id.clone(), job);
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<Job>, FlowError> {
        Ok(self.jobs.read().await.get(id).cloned())
    }

    async fn update(&self, id: &str, apply: UpdateFn<'_>) -> Result<Job, FlowError> {
        let mut jobs = self.jobs.write().await;
        let current = jobs
            .get_mut(id)
            .ok_or_else(|| FlowError::JobNotFound(id.to_string()))?;
        let mut next = current.clone();
        apply(&mut next)?;
        *current = next.clone();
        Ok(next)
    }

    async fn list(&self) -> Result<Vec<Job>, FlowError> {
        let mut jobs: Vec<Job> = self.jobs.read().await.values().cloned().collect();
        jobs.sort_by_key(|j| j.created_at);
        Ok(jobs)
    }
}

/// Durable store keeping one JSON document per job under `dir`.
///
/// Writes go through a temporary file in the same directory followed by a
/// rename, so readers in other processes never observe a torn record.
/// Inserts and updates hold an exclusive lock on `dir/.lock` for the whole
/// read, mutate and write, so several processes can share one directory.
pub struct FileStore {
    dir: PathBuf,
}

const LOCK_FILE: &str = ".lock";

/// Runs blocking file work off the async runtime.
async fn blocking<T, F>(work: F) -> Result<T, FlowError>
where
    F: FnOnce() -> Result<T, FlowError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| FlowError::Io(std::io::Error::other(e)))?
}

/// Blocks until this process holds the store lock. Released when the
/// returned handle is dropped.
fn lock_store(dir: &Path) -> Result<File, FlowError> {
    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(dir.join(LOCK_FILE))?;
    file.lock_exclusive()?;
    Ok(file)
}

fn read_job(path: &Path) -> Result<Option<Job>, FlowError> {
    match std::fs::read_to_string(path) {
        Ok(contents) => Ok(Some(serde_json::from_str(&contents)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn write_job(dir: &Path, path: &Path, job: &Job) -> Result<(), FlowError> {
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    serde_json::to_writer_pretty(&mut tmp, job)?;
    tmp.flush()?;
    tmp.persist(path).map_err(|e| FlowError::Io(e.error))?;
    Ok(())
}

impl FileStore {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, FlowError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, id: &str) -> Result<PathBuf, FlowError> {
        let valid = !id.is_empty()
            && id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(FlowError::InvalidInput(format!("invalid job id: {id:?}")));
        }
        Ok(self.dir.join(format!("{id}.json")))
    }
}

#[async_trait]
impl JobStore for FileStore {
    async fn insert(&self, job: Job) -> Result<(), FlowError> {
        let path = self.path_for(&job.id)?;
        let dir = self.dir.clone();
        blocking(move || {
            let _lock = lock_store(&dir)?;
            if path.exists() {
                return Err(FlowError::DuplicateJob(job.id));
            }
            write_job(&dir, &path, &job)
        })
        .await
    }

    async fn get(&self, id: &str) -> Result<Option<Job>, FlowError> {
        let path = self.path_for(id)?;
        blocking(move || read_job(&path)).await
    }

    async fn update(&self, id: &str, apply: UpdateFn<'_>) -> Result<Job, FlowError> {
        let path = self.path_for(id)?;
        let dir = self.dir.clone();
        let read_path = path.clone();
        let (lock, current) = blocking(move || {
            let lock = lock_store(&dir)?;
            Ok((lock, read_job(&read_path)?))
        })
        .await?;

        // `apply` is not 'static, so it runs here while the lock is held.
        let mut job = current.ok_or_else(|| FlowError::JobNotFound(id.to_string()))?;
        apply(&mut job)?;

        let dir = self.dir.clone();
        blocking(move || {
            write_job(&dir, &path, &job)?;
            drop(lock);
            Ok(job)
        })
        .await
    }

    async fn list(&self) -> Result<Vec<Job>, FlowError> {
        let dir = self.dir.clone();
        blocking(move || {
            let mut jobs = Vec::new();
            for entry in std::fs::read_dir(&dir)? {
                let path = entry?.path();
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                if let Some(job) = read_job(&path)? {
                    jobs.push(job);
                }
            }
            jobs.sort_by_key(|j| j.created_at);
            Ok(jobs)
        })
        .await
    }
}
