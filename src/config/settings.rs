// Runtime configuration assembled from CLI flags and the environment.

use std::time::Duration;

/// Everything the wrapper needs at runtime. Built once in main and owned
/// by the multiplexer session.
#[derive(Debug, Clone)]
pub struct Config {
    /// API key for the completion service.
    pub api_key: String,
    /// Base URL for an OpenAI-compatible API.
    pub base_url: String,
    /// Shell binary the wrapper spawns (e.g. /bin/zsh).
    pub shell_binary: String,
    /// Model used when the user enters a prompt.
    pub prompt_model: String,
    /// Don't install the sentinel PS1 into the child shell.
    pub leave_prompt_alone: bool,
    /// Dark (default) vs light terminal background.
    pub color_dark: bool,
    /// Verbosity from repeated -v flags.
    pub verbose: u8,
    /// Hard cap on total request tokens, regardless of model window.
    pub max_prompt_tokens: usize,
    /// Per-history-block token cap.
    pub max_history_block_tokens: usize,
    /// Tokens reserved for the model's answer.
    pub max_response_tokens: usize,
    /// Budget for the first token and each inter-token gap.
    pub token_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: "https://api.openai.com/v1".to_string(),
            shell_binary: String::new(),
            prompt_model: "gpt-4.1-mini".to_string(),
            leave_prompt_alone: false,
            color_dark: true,
            verbose: 0,
            max_prompt_tokens: 16384,
            max_history_block_tokens: 1024,
            max_response_tokens: 2048,
            token_timeout: Duration::from_millis(10_000),
        }
    }
}
