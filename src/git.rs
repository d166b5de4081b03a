//! Git plumbing via libgit2 and the GitHub pull-request API.
//!
//! [`GitManager`] wraps one working copy: clone, branch, commit, push.
//! [`GitHubHosting`] drives it from async code and opens pull requests.

use std::cell::RefCell;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use git2::build::{CheckoutBuilder, RepoBuilder};
use git2::{Cred, FetchOptions, IndexAddOption, PushOptions, RemoteCallbacks, Repository, Signature};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::collaborators::{PullRequest, SourceHosting};
use crate::error::FlowError;

const GITHUB_API_URL: &str = "https://api.github.com";

/// Files never staged, so secrets do not end up in a pushed branch.
fn is_sensitive(path: &Path) -> bool {
    let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
    ["patchwright.toml", ".env", ".env.local"].contains(&name) || name.ends_with(".key")
}

fn callbacks(token: Option<&str>) -> RemoteCallbacks<'_> {
    let mut callbacks = RemoteCallbacks::new();
    if let Some(token) = token {
        callbacks.credentials(move |_url, _username, _allowed| {
            Cred::userpass_plaintext("x-access-token", token)
        });
    }
    callbacks
}

pub struct GitManager {
    repo: Repository,
}

impl GitManager {
    pub fn open(path: &Path) -> Result<Self, FlowError> {
        Ok(Self {
            repo: Repository::open(path)?,
        })
    }

    /// Clones `url` into `dest`, authenticating with `token` when the remote asks.
    pub fn clone_url(url: &str, dest: &Path, token: Option<&str>) -> Result<Self, FlowError> {
        let mut fetch = FetchOptions::new();
        fetch.remote_callbacks(callbacks(token));
        let repo = RepoBuilder::new().fetch_options(fetch).clone(url, dest)?;
        Ok(Self { repo })
    }

    /// Stages every change except sensitive files and commits it on HEAD.
    /// Returns the short hash.
    pub fn commit_all(&self, message: &str) -> Result<String, FlowError> {
        let mut index = self.repo.index()?;
        index.add_all(
            ["*"].iter(),
            IndexAddOption::DEFAULT,
            Some(&mut |path: &Path, _: &[u8]| -> i32 {
                if is_sensitive(path) { 1 } else { 0 }
            }),
        )?;
        index.update_all(["*"].iter(), None)?;
        index.write()?;

        let tree_oid = index.write_tree()?;
        let tree = self.repo.find_tree(tree_oid)?;

        let sig = self
            .repo
            .signature()
            .or_else(|_| Signature::now("patchwright", "patchwright@localhost"))?;

        let parents = match self.repo.head() {
            Ok(head) => vec![head.peel_to_commit()?],
            Err(_) => Vec::new(),
        };
        let parent_refs: Vec<&git2::Commit<'_>> = parents.iter().collect();
        let commit_oid = self
            .repo
            .commit(Some("HEAD"), &sig, &sig, message, &tree, &parent_refs)?;

        Ok(commit_oid.to_string()[..7].to_string())
    }

    /// Creates a branch at HEAD and checks it out.
    pub fn create_branch(&self, name: &str) -> Result<(), FlowError> {
        let head_commit = self.repo.head()?.peel_to_commit()?;
        self.repo.branch(name, &head_commit, false)?;
        self.repo.set_head(&format!("refs/heads/{name}"))?;
        self.repo
            .checkout_head(Some(CheckoutBuilder::default().safe()))?;
        Ok(())
    }

    /// Pushes `branch` to `origin`. A ref the remote refuses is an error.
    pub fn push(&self, branch: &str, token: Option<&str>) -> Result<(), FlowError> {
        let mut remote = self.repo.find_remote("origin")?;
        let rejected = RefCell::new(None);
        {
            let mut cbs = callbacks(token);
            cbs.push_update_reference(|refname, status| {
                if let Some(status) = status {
                    *rejected.borrow_mut() = Some(format!("{refname}: {status}"));
                }
                Ok(())
            });
            let mut options = PushOptions::new();
            options.remote_callbacks(cbs);
            let refspec = format!("refs/heads/{branch}:refs/heads/{branch}");
            remote.push(&[refspec.as_str()], Some(&mut options))?;
        }
        match rejected.into_inner() {
            Some(reason) => Err(FlowError::Collaborator(format!("push rejected: {reason}"))),
            None => Ok(()),
        }
    }

    pub fn current_branch(&self) -> Result<String, FlowError> {
        let head = self.repo.head()?;
        head.shorthand()
            .map(str::to_string)
            .ok_or_else(|| FlowError::Collaborator("branch name is not valid UTF-8".into()))
    }
}

/// `owner` and `repo` from the last two path segments of a clone URL.
pub fn repo_slug(url: &str) -> Result<(String, String), FlowError> {
    let trimmed = url.trim().trim_end_matches('/');
    let trimmed = trimmed.strip_suffix(".git").unwrap_or(trimmed);
    let mut segments = trimmed
        .rsplit(['/', ':'])
        .filter(|s| !s.is_empty());
    match (segments.next(), segments.next()) {
        (Some(repo), Some(owner)) if !owner.contains('.') => {
            Ok((owner.to_string(), repo.to_string()))
        }
        _ => Err(FlowError::InvalidInput(format!(
            "cannot derive owner/repo from {url}"
        ))),
    }
}

#[derive(Debug, Serialize)]
struct CreatePull<'a> {
    title: &'a str,
    head: &'a str,
    base: &'a str,
    body: &'a str,
}

#[derive(Debug, Deserialize)]
struct PullResponse {
    html_url: String,
}

/// GitHub-backed [`SourceHosting`]. Clones land in fresh directories under
/// `scratch_root`.
pub struct GitHubHosting {
    scratch_root: PathBuf,
    token: Option<String>,
    api_url: String,
    client: reqwest::Client,
}

impl GitHubHosting {
    pub fn new(scratch_root: impl Into<PathBuf>, token: Option<String>) -> Result<Self, FlowError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(Self {
            scratch_root: scratch_root.into(),
            token: token.filter(|t| !t.is_empty()),
            api_url: GITHUB_API_URL.to_string(),
            client,
        })
    }

    /// Points the pull-request calls at another API root (GitHub Enterprise, tests).
    pub fn with_api_url(mut self, api_url: impl Into<String>) -> Self {
        self.api_url = api_url.into().trim_end_matches('/').to_string();
        self
    }
}

#[async_trait]
impl SourceHosting for GitHubHosting {
    async fn clone_repo(&self, url: &str) -> Result<PathBuf, FlowError> {
        std::fs::create_dir_all(&self.scratch_root)?;
        let dest = self.scratch_root.join(Uuid::new_v4().to_string());
        let (url, target, token) = (url.to_string(), dest.clone(), self.token.clone());
        tokio::task::spawn_blocking(move || GitManager::clone_url(&url, &target, token.as_deref()))
            .await
            .map_err(|e| FlowError::collaborator("Clone aborted", e))?
            .map_err(|e| FlowError::collaborator("Failed to clone repository", e))?;
        info!(path = %dest.display(), "repository cloned");
        Ok(dest)
    }

    async fn commit_and_push(
        &self,
        checkout: &Path,
        branch: &str,
        message: &str,
    ) -> Result<(), FlowError> {
        let (checkout, branch, message) =
            (checkout.to_path_buf(), branch.to_string(), message.to_string());
        let token = self.token.clone();
        tokio::task::spawn_blocking(move || -> Result<String, FlowError> {
            let git = GitManager::open(&checkout)?;
            git.create_branch(&branch)?;
            let hash = git.commit_all(&message)?;
            git.push(&branch, token.as_deref())?;
            Ok(hash)
        })
        .await
        .map_err(|e| FlowError::collaborator("Push aborted", e))?
        .map(|hash| info!(commit = %hash, "changes pushed"))
        .map_err(|e| FlowError::collaborator("Git operation failed", e))
    }

    async fn open_pull_request(&self, request: &PullRequest) -> Result<String, FlowError> {
        let (owner, repo) = repo_slug(&request.repo_url)?;
        let url = format!("{}/repos/{owner}/{repo}/pulls", self.api_url);
        let mut call = self
            .client
            .post(&url)
            .header("accept", "application/vnd.github+json")
            .header("user-agent", "patchwright")
            .json(&CreatePull {
                title: &request.title,
                head: &request.branch,
                base: &request.base,
                body: &request.body,
            });
        if let Some(token) = &self.token {
            call = call.bearer_auth(token);
        }
        let response = call
            .send()
            .await
            .map_err(|e| FlowError::collaborator("Failed to create pull request", e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(%owner, %repo, status = status.as_u16(), "pull request rejected");
            return Err(FlowError::Collaborator(format!(
                "Failed to create pull request: GitHub API error (status {}): {body}",
                status.as_u16()
            )));
        }
        let pull: PullResponse = response
            .json()
            .await
            .map_err(|e| FlowError::collaborator("Failed to read pull request response", e))?;
        info!(url = %pull.html_url, "pull request opened");
        Ok(pull.html_url)
    }
}
