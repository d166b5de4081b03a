//! Configuration loaded from `patchwright.toml`.
//!
//! Every field has a default, so a missing file or a partial one is fine.
//! `ANTHROPIC_API_KEY` and `GITHUB_TOKEN` from the environment take precedence
//! over the file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::FlowError;
use crate::stages::ModelSettings;
use crate::state_machine::RetryConfig;

pub const CONFIG_FILE: &str = "patchwright.toml";

#[derive(Debug, Clone, Deserialize)]
pub struct PatchwrightConfig {
    /// Anthropic API key.
    #[serde(default)]
    pub api_key: String,

    #[serde(default = "default_model")]
    pub model: String,

    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    /// Token used for clone/push credentials and the pull-request API.
    #[serde(default)]
    pub github_token: String,

    #[serde(default = "default_github_api_url")]
    pub github_api_url: String,

    /// Branch pull requests are opened against.
    #[serde(default = "default_base_branch")]
    pub base_branch: String,

    #[serde(default = "default_branch_prefix")]
    pub branch_prefix: String,

    /// Holds `<user_id>/<project_id>` project directories.
    #[serde(default = "default_projects_root")]
    pub projects_root: PathBuf,

    /// Fresh clones for transform jobs land here.
    #[serde(default = "default_scratch_root")]
    pub scratch_root: PathBuf,

    /// One JSON file per job.
    #[serde(default = "default_store_dir")]
    pub store_dir: PathBuf,

    /// Stage deliveries run concurrently, across jobs.
    #[serde(default = "default_workers")]
    pub workers: usize,

    #[serde(default = "default_validate_timeout_secs")]
    pub validate_timeout_secs: u64,

    #[serde(default = "default_review_timeout_secs")]
    pub review_timeout_secs: u64,

    /// Files sent in full to the model during a refactor.
    #[serde(default = "default_refactor_file_limit")]
    pub refactor_file_limit: usize,

    /// Run inside the checkout by the validate stage.
    #[serde(default = "default_test_command")]
    pub test_command: Vec<String>,

    /// Run against a patched copy of the project during review, if set.
    #[serde(default)]
    pub review_test_command: Option<Vec<String>>,

    /// Redeliveries of a stage whose handler could not reach the store.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
}

fn default_model() -> String {
    "claude-sonnet-4-5-20250929".to_string()
}

fn default_max_tokens() -> u32 {
    8192
}

fn default_github_api_url() -> String {
    "https://api.github.com".to_string()
}

fn default_base_branch() -> String {
    "main".to_string()
}

fn default_branch_prefix() -> String {
    "patchwright-refactor".to_string()
}

fn default_projects_root() -> PathBuf {
    PathBuf::from("workspace/projects")
}

fn default_scratch_root() -> PathBuf {
    std::env::temp_dir().join("patchwright")
}

fn default_store_dir() -> PathBuf {
    PathBuf::from(".patchwright/jobs")
}

fn default_workers() -> usize {
    4
}

fn default_validate_timeout_secs() -> u64 {
    300
}

fn default_review_timeout_secs() -> u64 {
    120
}

fn default_refactor_file_limit() -> usize {
    10
}

fn default_test_command() -> Vec<String> {
    vec!["pytest".to_string()]
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    1000
}

impl Default for PatchwrightConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            model: default_model(),
            max_tokens: default_max_tokens(),
            github_token: String::new(),
            github_api_url: default_github_api_url(),
            base_branch: default_base_branch(),
            branch_prefix: default_branch_prefix(),
            projects_root: default_projects_root(),
            scratch_root: default_scratch_root(),
            store_dir: default_store_dir(),
            workers: default_workers(),
            validate_timeout_secs: default_validate_timeout_secs(),
            review_timeout_secs: default_review_timeout_secs(),
            refactor_file_limit: default_refactor_file_limit(),
            test_command: default_test_command(),
            review_test_command: None,
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
        }
    }
}

impl PatchwrightConfig {
    /// Loads `patchwright.toml` from the working directory.
    pub fn load() -> Result<Self, FlowError> {
        Self::load_from(Path::new(CONFIG_FILE))
    }

    /// Loads `path`, falling back to defaults when it does not exist.
    pub fn load_from(path: &Path) -> Result<Self, FlowError> {
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(path)?;
            toml::from_str::<PatchwrightConfig>(&contents)?
        } else {
            Self::default()
        };
        config.apply_env(|name| std::env::var(name).ok());
        config.validate()?;
        Ok(config)
    }

    fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(key) = lookup("ANTHROPIC_API_KEY")
            && !key.is_empty()
        {
            self.api_key = key;
        }
        if let Some(token) = lookup("GITHUB_TOKEN")
            && !token.is_empty()
        {
            self.github_token = token;
        }
    }

    fn validate(&self) -> Result<(), FlowError> {
        if self.test_command.is_empty() {
            return Err(FlowError::Config("test_command must not be empty".into()));
        }
        if self.review_test_command.as_ref().is_some_and(Vec::is_empty) {
            return Err(FlowError::Config(
                "review_test_command must not be empty when set".into(),
            ));
        }
        if self.workers == 0 {
            return Err(FlowError::Config("workers must be at least 1".into()));
        }
        Ok(())
    }

    pub fn retry(&self) -> RetryConfig {
        RetryConfig {
            max_retries: self.max_retries,
            base_delay_ms: self.base_delay_ms,
        }
    }

    pub fn model_settings(&self) -> ModelSettings {
        ModelSettings {
            model: self.model.clone(),
            max_tokens: self.max_tokens,
        }
    }

    pub fn validate_timeout(&self) -> Duration {
        Duration::from_secs(self.validate_timeout_secs)
    }

    pub fn review_timeout(&self) -> Duration {
        Duration::from_secs(self.review_timeout_secs)
    }

    pub fn github_token(&self) -> Option<String> {
        (!self.github_token.is_empty()).then(|| self.github_token.clone())
    }
}
