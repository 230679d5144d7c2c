/// Characters handed to a model when its catalog entry has no budget
pub const DEFAULT_CONTEXT_BUDGET: usize = 24_000;

/// Most recent turns that survive prompt truncation
pub const KEEP_RECENT_TURNS: usize = 4;

/// Max characters of a single retrieved passage
pub const PASSAGE_MAX_CHARS: usize = 500;

/// Max characters of a derived session title
pub const TITLE_MAX_CHARS: usize = 50;

pub const GENERATION_TIMEOUT_SECS: u64 = 120;

pub const RETRIEVAL_TOP_K: usize = 5;

pub const MAX_OUTPUT_TOKENS: usize = 1024;

pub const DEFAULT_TEMPERATURE: f32 = 0.7;

pub const DEFAULT_TOP_P: f32 = 0.9;

pub const LOG_FILE_PATH: &str = "/tmp/palaver.log";

pub const SYSTEM_PROMPT: &str = "You are a helpful assistant. Answer accurately and concisely. \
When reference material is provided, prefer it over general knowledge and say so when it does \
not cover the question.\nCurrent time: {current_time}";

pub const FAILURE_ANSWER: &str = "Sorry, an error occurred while generating the response.";
