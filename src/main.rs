// Butterfish - shell wrapper with in-line LLM prompting
// Main entry point

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use butterfish::config::{load_api_key, Config};
use butterfish::llm::openai::OpenAiClient;
use butterfish::prompts::{default_library_path, PromptLibrary};
use butterfish::pty::PtyShell;
use butterfish::shell::readers::reader_to_channel_with_position;
use butterfish::shell::{ShellChannels, ShellState};

const ABOUT: &str = "A simple shell wrapper to chat with an LLM.

Butterfish wraps your local shell. Start a command with a capital letter to \
send it as a prompt to the configured LLM, using your shell history as \
context.

Butterfish looks for an API key in OPENAI_TOKEN or OPENAI_API_KEY, or stores \
one at ~/.config/butterfish/butterfish.env. Prompts are stored in \
~/.config/butterfish/prompts.yaml. Butterfish logs to the system temp dir.";

#[derive(Parser)]
#[command(name = "butterfish", version, about = ABOUT)]
struct Cli {
    /// Verbose mode, prints full LLM prompts to the log file. Use multiple
    /// times for more verbosity, e.g. -vv.
    #[arg(short = 'v', action = ArgAction::Count)]
    verbose: u8,

    /// Base URL for an OpenAI-compatible API. Enables local models with a
    /// compatible interface.
    #[arg(short = 'u', long, default_value = "https://api.openai.com/v1")]
    base_url: String,

    /// Timeout before the first prompt token is received and between
    /// individual tokens, in milliseconds.
    #[arg(short = 'z', long, default_value_t = 10000)]
    token_timeout: u64,

    /// API key, overrides environment variables and the config file.
    #[arg(short = 'k', long)]
    api_key: Option<String>,

    /// Light color mode, appropriate for a terminal with a white(ish)
    /// background.
    #[arg(short = 'l', long, default_value_t = false)]
    light_color: bool,

    /// Shell to use (e.g. /bin/zsh), defaults to $SHELL.
    #[arg(short = 'b', long)]
    bin: Option<String>,

    /// Model for when the user manually enters a prompt.
    #[arg(short = 'm', long, default_value = "gpt-4.1-mini")]
    model: String,

    /// Don't change the command prompt (shell PS1 variable). If not set,
    /// an emoji is added to the prompt as a reminder you're in shell mode.
    #[arg(short = 'p', long, default_value_t = false)]
    no_command_prompt: bool,

    /// Maximum number of prompt tokens, calls are restricted to this size
    /// regardless of model capabilities.
    #[arg(short = 'P', long, default_value_t = 16384)]
    max_prompt_tokens: usize,

    /// Maximum number of tokens of each block of history, long command
    /// output is truncated to this length.
    #[arg(short = 'H', long, default_value_t = 1024)]
    max_history_block_tokens: usize,

    /// Maximum number of tokens in a response when prompting.
    #[arg(short = 'R', long, default_value_t = 2048)]
    max_response_tokens: usize,
}

fn init_logging(verbose: u8) -> Result<PathBuf> {
    let path = std::env::temp_dir().join("butterfish.log");
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("failed to open log file {}", path.display()))?;
    let level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(level))
        .with_writer(std::sync::Mutex::new(file))
        .with_ansi(false)
        .init();
    Ok(path)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_path = init_logging(cli.verbose)?;
    println!("Logging to {}", log_path.display());

    // Refuse to wrap a shell that is already wrapped.
    if std::env::var("BUTTERFISH_SHELL").map(|v| !v.is_empty()).unwrap_or(false) {
        eprintln!(
            "Butterfish shell is already running, cannot wrap shell again \
             (detected with BUTTERFISH_SHELL env var)."
        );
        std::process::exit(8);
    }

    let shell_binary = cli
        .bin
        .clone()
        .or_else(|| std::env::var("SHELL").ok())
        .unwrap_or_default();
    if shell_binary.is_empty() {
        eprintln!("No shell found, please specify one with -b or $SHELL");
        std::process::exit(7);
    }

    let api_key = load_api_key(cli.api_key.as_deref())?;

    let config = Config {
        api_key,
        base_url: cli.base_url.clone(),
        shell_binary: shell_binary.clone(),
        prompt_model: cli.model.clone(),
        leave_prompt_alone: cli.no_command_prompt,
        color_dark: !cli.light_color,
        verbose: cli.verbose,
        max_prompt_tokens: cli.max_prompt_tokens,
        max_history_block_tokens: cli.max_history_block_tokens,
        max_response_tokens: cli.max_response_tokens,
        token_timeout: std::time::Duration::from_millis(cli.token_timeout),
    };

    let prompt_library = Arc::new(PromptLibrary::load(&default_library_path()?)?);
    let client = Arc::new(OpenAiClient::new(
        config.api_key.clone(),
        config.base_url.clone(),
    )?);

    let (cols, rows) = crossterm::terminal::size().unwrap_or((80, 24));

    let (child_out_tx, child_out_rx) = mpsc::channel(8);
    let (pty, child_in) = PtyShell::spawn(
        &shell_binary,
        cols,
        rows,
        &[("BUTTERFISH_SHELL", "1")],
        child_out_tx,
    )?;

    crossterm::terminal::enable_raw_mode().context("failed to enable raw mode")?;
    // A panic mid-session would otherwise leave the terminal raw.
    let default_panic = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let _ = crossterm::terminal::disable_raw_mode();
        default_panic(info);
    }));

    let (parent_in_tx, parent_in_rx) = mpsc::channel(8);
    let (cursor_pos_tx, cursor_pos_rx) = mpsc::channel(128);
    tokio::spawn(reader_to_channel_with_position(
        tokio::io::stdin(),
        parent_in_tx,
        cursor_pos_tx,
    ));

    let (sigwinch_tx, sigwinch_rx) = mpsc::channel(1);
    let mut winch = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::window_change())
        .context("failed to install SIGWINCH handler")?;
    tokio::spawn(async move {
        // The PTY lives here so resizes reach the child; dropping it at
        // session end kills the shell.
        let pty = pty;
        while winch.recv().await.is_some() {
            if let Ok((cols, rows)) = crossterm::terminal::size() {
                let _ = pty.resize(cols, rows);
            }
            if sigwinch_tx.send(()).await.is_err() {
                break;
            }
        }
    });

    let session_cancel = CancellationToken::new();
    let channels = ShellChannels {
        child_out_rx,
        parent_in_rx,
        cursor_pos_rx,
        sigwinch_rx,
    };
    let width_fn = Box::new(|| {
        crossterm::terminal::size()
            .map(|(cols, _)| cols as usize)
            .unwrap_or(80)
    });

    let mut shell_state = ShellState::new(
        config,
        Box::new(std::io::stdout()),
        child_in,
        channels,
        client,
        prompt_library,
        session_cancel,
        cols as usize,
        width_fn,
    );

    let result = shell_state.run().await;

    crossterm::terminal::disable_raw_mode().context("failed to restore terminal")?;
    result
}
