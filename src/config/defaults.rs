use super::constants::*;

pub(crate) fn system_prompt() -> String {
    SYSTEM_PROMPT.to_string()
}

pub(crate) fn failure_answer() -> String {
    FAILURE_ANSWER.to_string()
}

pub(crate) fn title_max_chars() -> usize {
    TITLE_MAX_CHARS
}

pub(crate) fn keep_recent_turns() -> usize {
    KEEP_RECENT_TURNS
}

pub(crate) fn passage_max_chars() -> usize {
    PASSAGE_MAX_CHARS
}

pub(crate) fn default_context_budget() -> usize {
    DEFAULT_CONTEXT_BUDGET
}

pub(crate) fn generation_timeout_secs() -> u64 {
    GENERATION_TIMEOUT_SECS
}

pub(crate) fn retrieval_top_k() -> usize {
    RETRIEVAL_TOP_K
}

pub(crate) fn log_level() -> Option<String> {
    Some("info".to_string())
}

pub(crate) fn log_file_path() -> String {
    LOG_FILE_PATH.to_string()
}
