use serde::{Deserialize, Serialize};

use crate::models::BackendConnection;

use super::constants::{
    DEFAULT_CONTEXT_BUDGET, FAILURE_ANSWER, GENERATION_TIMEOUT_SECS, KEEP_RECENT_TURNS,
    LOG_FILE_PATH, PASSAGE_MAX_CHARS, RETRIEVAL_TOP_K, SYSTEM_PROMPT, TITLE_MAX_CHARS,
};
use super::defaults::*;

#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct Configuration {
    #[serde(default)]
    pub general: GeneralConfig,

    #[serde(default)]
    pub log: LogConfig,

    #[serde(default)]
    pub backend: BackendConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub context: ContextConfig,

    #[serde(default)]
    pub retrieval: RetrievalConfig,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct GeneralConfig {
    #[serde(default = "system_prompt")]
    pub system_prompt: String,

    /// Answer persisted in place of a generation that failed
    #[serde(default = "failure_answer")]
    pub failure_answer: String,

    #[serde(default = "title_max_chars")]
    pub title_max_chars: usize,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct ContextConfig {
    #[serde(default = "keep_recent_turns")]
    pub keep_recent_turns: usize,

    #[serde(default = "passage_max_chars")]
    pub passage_max_chars: usize,

    #[serde(default = "default_context_budget")]
    pub default_context_budget: usize,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct LogConfig {
    #[serde(default = "log_level")]
    pub level: Option<String>,

    #[serde(default)]
    pub filters: Option<Vec<LogFilter>>,

    #[serde(default)]
    pub file: LogFile,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct LogFilter {
    #[serde(default)]
    pub module: Option<String>,

    #[serde(default)]
    pub level: Option<String>,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct LogFile {
    #[serde(default = "log_file_path")]
    pub path: String,

    #[serde(default)]
    pub append: bool,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct BackendConfig {
    /// Wall-clock budget of a single generation
    #[serde(default = "generation_timeout_secs")]
    pub generation_timeout_secs: u64,

    /// HTTP timeout applied to connections that don't set their own
    #[serde(default)]
    pub timeout_secs: Option<u64>,

    #[serde(default)]
    pub connections: Vec<BackendConnection>,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub enum StorageConfig {
    #[serde(rename = "sqlite")]
    Sqlite(SqliteStorage),
}

#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct SqliteStorage {
    pub path: Option<String>,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct RetrievalConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default)]
    pub endpoint: String,

    #[serde(default = "retrieval_top_k")]
    pub top_k: usize,

    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl SqliteStorage {
    pub fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            system_prompt: SYSTEM_PROMPT.to_string(),
            failure_answer: FAILURE_ANSWER.to_string(),
            title_max_chars: TITLE_MAX_CHARS,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Some("info".to_string()),
            file: LogFile::default(),
            filters: None,
        }
    }
}

impl Default for LogFile {
    fn default() -> Self {
        Self {
            path: LOG_FILE_PATH.to_string(),
            append: false,
        }
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            generation_timeout_secs: GENERATION_TIMEOUT_SECS,
            timeout_secs: None,
            connections: vec![],
        }
    }
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            keep_recent_turns: KEEP_RECENT_TURNS,
            passage_max_chars: PASSAGE_MAX_CHARS,
            default_context_budget: DEFAULT_CONTEXT_BUDGET,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self::Sqlite(SqliteStorage::default())
    }
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: String::new(),
            top_k: RETRIEVAL_TOP_K,
            timeout_secs: None,
        }
    }
}
