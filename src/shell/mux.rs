// The shell multiplexer: sits between the user's terminal and the child
// shell, forwarding keystrokes until a line starts with an uppercase
// letter, at which point the line becomes an LLM prompt and the reply is
// streamed back inline. One select loop owns all mutable state; readers,
// the signal handler, and the in-flight completion feed it through
// bounded channels.

use std::io::Write;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Result};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::{Config, ShellColorScheme};
use crate::llm::driver::completion_routine;
use crate::llm::{
    CompletionRequest, CompletionResponse, SharedAnswerWriter, StreamingClient,
};
use crate::prompts::{system_info, PromptLibrary, SHELL_SYSTEM_MESSAGE};
use crate::shell::assemble::assemble_chat;
use crate::shell::history::{HistoryKind, ShellHistory};
use crate::shell::ps1::{is_zsh_clear_noise, parse_ps1, ps1_assignment, ShellKind};
use crate::shell::readers::CursorPosition;
use crate::term::{
    incomplete_ansi_sequence, CarriageReturnWriter, ShellBuffer, StyleCodeblocksWriter,
};
use crate::tokenizer::{max_tokens_for_model, BytePackEncoder, Tokenizer};

const ESC_CUP: &[u8] = b"\x1b[6n";
const ESC_CLEAR_SCREEN: &[u8] = b"\x1b[2J\x1b[H";
const CTRL_C: u8 = 0x03;
const FORM_FEED: u8 = 0x0c;
/// Prompts are small; the per-request cap below belongs to history.
const MAX_USER_PROMPT_TOKENS: usize = 512;
const DSR_TIMEOUT: Duration = Duration::from_secs(5);
const PROMPT_TEMPERATURE: f32 = 0.7;

/// Where the multiplexer is in the keystroke/prompt/response cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// At a shell prompt, nothing typed yet.
    Normal,
    /// Mid-command entry; bytes pass through to the child.
    Shell,
    /// Composing an LLM prompt after an uppercase trigger.
    Prompting,
    /// A completion is streaming to the terminal.
    PromptResponse,
}

impl State {
    fn name(&self) -> &'static str {
        match self {
            State::Normal => "Normal",
            State::Shell => "Shell",
            State::Prompting => "Prompting",
            State::PromptResponse => "PromptResponse",
        }
    }
}

/// Shared handle on the parent terminal so the select loop and the
/// completion driver can interleave writes without tearing bytes.
#[derive(Clone)]
pub struct SharedOutput(Arc<Mutex<Box<dyn Write + Send>>>);

impl SharedOutput {
    pub fn new(writer: Box<dyn Write + Send>) -> Self {
        Self(Arc::new(Mutex::new(writer)))
    }
}

impl Write for SharedOutput {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.0.lock().unwrap().flush()
    }
}

/// Input channels wired up by main (or a test harness).
pub struct ShellChannels {
    pub child_out_rx: mpsc::Receiver<Vec<u8>>,
    pub parent_in_rx: mpsc::Receiver<Vec<u8>>,
    pub cursor_pos_rx: mpsc::Receiver<CursorPosition>,
    pub sigwinch_rx: mpsc::Receiver<()>,
}

enum Event {
    Canceled,
    Error(anyhow::Error),
    CursorPos(Option<CursorPosition>),
    Winch,
    Completion(Option<CompletionResponse>),
    ChildOut(Option<Vec<u8>>),
    ParentIn(Option<Vec<u8>>),
}

pub struct ShellState {
    config: Config,
    color: ShellColorScheme,
    parent_out: SharedOutput,
    child_in: Box<dyn Write + Send>,
    channels: ShellChannels,

    state: State,
    prompt: ShellBuffer,
    command: ShellBuffer,
    prompt_suffix_counter: i64,
    last_exit_status: i32,
    terminal_width: usize,
    width_fn: Box<dyn Fn() -> usize + Send>,
    parent_in_buffer: Vec<u8>,
    child_out_buffer: Vec<u8>,

    history: Arc<ShellHistory>,
    style_writer: SharedAnswerWriter,
    encoder: Arc<dyn Tokenizer>,
    prompt_max_tokens: usize,
    client: Arc<dyn StreamingClient>,
    prompt_library: Arc<PromptLibrary>,

    prompt_response_cancel: Option<CancellationToken>,
    session_cancel: CancellationToken,
    error_tx: mpsc::Sender<anyhow::Error>,
    error_rx: mpsc::Receiver<anyhow::Error>,
    prompt_output_tx: mpsc::Sender<CompletionResponse>,
    prompt_output_rx: mpsc::Receiver<CompletionResponse>,
}

impl ShellState {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Config,
        parent_out: Box<dyn Write + Send>,
        child_in: Box<dyn Write + Send>,
        channels: ShellChannels,
        client: Arc<dyn StreamingClient>,
        prompt_library: Arc<PromptLibrary>,
        session_cancel: CancellationToken,
        terminal_width: usize,
        width_fn: Box<dyn Fn() -> usize + Send>,
    ) -> Self {
        let color = ShellColorScheme::for_dark_background(config.color_dark);
        let parent_out = SharedOutput::new(parent_out);

        let answer_writer = StyleCodeblocksWriter::new(
            CarriageReturnWriter::new(parent_out.clone()),
            terminal_width,
            color.answer,
            color.answer_highlight,
        );
        let style_writer: SharedAnswerWriter = Arc::new(Mutex::new(answer_writer));

        let encoder: Arc<dyn Tokenizer> = Arc::new(BytePackEncoder);
        let prompt_max_tokens = max_tokens_for_model(&config.prompt_model)
            .min(config.max_prompt_tokens);

        let (error_tx, error_rx) = mpsc::channel(8);
        let (prompt_output_tx, prompt_output_rx) = mpsc::channel(1);

        let mut prompt = ShellBuffer::new();
        prompt.set_terminal_width(terminal_width);
        prompt.set_color(color.prompt);
        let mut command = ShellBuffer::new();
        command.set_terminal_width(terminal_width);

        Self {
            config,
            color,
            parent_out,
            child_in,
            channels,
            state: State::Normal,
            prompt,
            command,
            prompt_suffix_counter: 0,
            last_exit_status: 0,
            terminal_width,
            width_fn,
            parent_in_buffer: Vec::new(),
            child_out_buffer: Vec::new(),
            history: Arc::new(ShellHistory::new()),
            style_writer,
            encoder,
            prompt_max_tokens,
            client,
            prompt_library,
            prompt_response_cancel: None,
            session_cancel,
            error_tx,
            error_rx,
            prompt_output_tx,
            prompt_output_rx,
        }
    }

    pub fn history(&self) -> Arc<ShellHistory> {
        Arc::clone(&self.history)
    }

    pub fn current_state(&self) -> State {
        self.state
    }

    pub fn prompt_suffix_counter(&self) -> i64 {
        self.prompt_suffix_counter
    }

    pub fn last_exit_status(&self) -> i32 {
        self.last_exit_status
    }

    /// Install the sentinel PS1, hide the assignment echo, then run the
    /// select loop until the session ends.
    pub async fn run(&mut self) -> Result<()> {
        self.install_ps1();
        self.drain_child_startup(Duration::from_millis(1000)).await;
        self.mux().await
    }

    fn install_ps1(&mut self) {
        let kind = ShellKind::from_binary(&self.config.shell_binary);
        match ps1_assignment(kind, self.config.leave_prompt_alone) {
            Some(assignment) => self.write_child(assignment.as_bytes()),
            None => tracing::warn!(
                "unknown shell {}, leaving PS1 alone; prompt detection and \
                 exit-status capture are unavailable",
                self.config.shell_binary
            ),
        }
    }

    /// Swallow initial child output so the PS1 assignment echo never
    /// reaches the user. Stops after two newline-bearing frames or the
    /// timeout, whichever comes first.
    async fn drain_child_startup(&mut self, timeout: Duration) {
        let mut newline_frames = 0;
        loop {
            match tokio::time::timeout(timeout, self.channels.child_out_rx.recv()).await {
                Err(_) | Ok(None) => return,
                Ok(Some(data)) => {
                    if data.contains(&b'\n') {
                        newline_frames += 1;
                        if newline_frames >= 2 {
                            return;
                        }
                    }
                }
            }
        }
    }

    /// The select loop. Returns when the session is canceled or either
    /// byte stream closes.
    pub async fn mux(&mut self) -> Result<()> {
        tracing::info!("started shell mux");
        loop {
            let event = {
                let channels = &mut self.channels;
                tokio::select! {
                    _ = self.session_cancel.cancelled() => Event::Canceled,
                    err = self.error_rx.recv() => match err {
                        Some(err) => Event::Error(err),
                        None => Event::Canceled,
                    },
                    pos = channels.cursor_pos_rx.recv() => Event::CursorPos(pos),
                    winch = channels.sigwinch_rx.recv() => match winch {
                        Some(()) => Event::Winch,
                        // The signal task is gone; treat it as shutdown.
                        None => Event::Canceled,
                    },
                    output = self.prompt_output_rx.recv() => Event::Completion(output),
                    data = channels.child_out_rx.recv() => Event::ChildOut(data),
                    data = channels.parent_in_rx.recv() => Event::ParentIn(data),
                }
            };

            match event {
                Event::Canceled => return Ok(()),

                Event::Error(err) => self.handle_error(err),

                // A cursor report with nobody waiting on it belongs to the
                // child (it may have issued its own DSR).
                Event::CursorPos(Some(pos)) => {
                    let reply = format!("\x1b[{};{}R", pos.row, pos.col);
                    self.write_child(reply.as_bytes());
                }
                Event::CursorPos(None) => {}

                Event::Winch => self.handle_resize(),

                Event::Completion(Some(output)) => self.handle_completion(output).await,
                Event::Completion(None) => {}

                Event::ChildOut(Some(data)) => self.handle_child_output(&data),
                Event::ChildOut(None) => {
                    tracing::info!("child output closed");
                    self.session_cancel.cancel();
                    return Ok(());
                }

                Event::ParentIn(Some(data)) => self.parent_input_loop(data).await,
                Event::ParentIn(None) => {
                    tracing::info!("parent input closed");
                    self.session_cancel.cancel();
                    return Ok(());
                }
            }
        }
    }

    fn set_state(&mut self, state: State) {
        if self.state == state {
            return;
        }
        if self.config.verbose > 1 {
            tracing::debug!("state change: {} -> {}", self.state.name(), state.name());
        }
        self.state = state;
    }

    fn write_parent(&mut self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        if let Err(err) = self.parent_out.write_all(data).and_then(|_| self.parent_out.flush()) {
            tracing::error!("parent write failed: {}", err);
        }
    }

    fn write_child(&mut self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        if let Err(err) = self.child_in.write_all(data).and_then(|_| self.child_in.flush()) {
            tracing::error!("child write failed: {}", err);
        }
    }

    fn report_error(&mut self, err: anyhow::Error) {
        if self.error_tx.try_send(err).is_err() {
            tracing::error!("error channel full, dropping error");
        }
    }

    fn handle_error(&mut self, err: anyhow::Error) {
        tracing::error!("{}", err);
        let message = err.to_string();
        self.history.append(HistoryKind::ShellOutput, &message);
        let styled = format!("{}{}", self.color.error, message);
        self.write_parent(styled.as_bytes());
        self.set_state(State::Normal);
        self.write_child(b"\n");
    }

    fn handle_resize(&mut self) {
        let width = (self.width_fn)();
        if self.config.verbose > 0 {
            tracing::debug!("got SIGWINCH with new width {}", width);
        }
        self.terminal_width = width;
        self.prompt.set_terminal_width(width);
        self.command.set_terminal_width(width);
        self.style_writer.lock().unwrap().set_width(width);
    }

    /// A completion finished: record it, release any buffered child
    /// output, nudge the child for a fresh prompt, and go back to Normal.
    /// Keystrokes that arrived during streaming were dropped, so the
    /// re-entry into the input loop runs with an empty buffer.
    async fn handle_completion(&mut self, output: CompletionResponse) {
        if !output.completion.is_empty() {
            self.history
                .append(HistoryKind::LlmOutput, &output.completion);
        }
        self.prompt_response_cancel = None;

        if !self.child_out_buffer.is_empty() {
            let buffered = std::mem::take(&mut self.child_out_buffer);
            self.write_parent(&buffered);
            self.history
                .append(HistoryKind::ShellOutput, &String::from_utf8_lossy(&buffered));
        }

        self.write_child(b"\n");
        self.set_state(State::Normal);
        self.parent_input_loop(Vec::new()).await;
    }

    fn handle_child_output(&mut self, data: &[u8]) {
        if self.config.verbose > 2 {
            tracing::trace!("child out: {:02x?}", data);
        }
        let text = String::from_utf8_lossy(data);
        let scan = parse_ps1(&text, self.config.leave_prompt_alone);
        self.prompt_suffix_counter += scan.prompts as i64;
        if scan.prompts > 0 {
            self.last_exit_status = scan.last_status;
        }

        // While an answer is streaming, shell output waits; the whole
        // response reaches the terminal before any post-response output.
        if self.state == State::PromptResponse {
            self.child_out_buffer.extend_from_slice(scan.cleaned.as_bytes());
            return;
        }

        // Mid-edit child output is paging or completion redraws, too
        // ambiguous for history.
        if self.state != State::Shell && !is_zsh_clear_noise(&text) {
            self.history.append(HistoryKind::ShellOutput, &scan.cleaned);
        }

        self.write_parent(scan.cleaned.as_bytes());
    }

    /// Entry point for parent-terminal bytes: prepend any held partial
    /// ANSI sequence, hold the whole buffer if it still ends mid-sequence,
    /// then dispatch repeatedly until the input is consumed.
    async fn parent_input_loop(&mut self, data: Vec<u8>) {
        if self.config.verbose > 2 {
            tracing::trace!("parent in: {:02x?}", data);
        }

        let mut data = if self.parent_in_buffer.is_empty() {
            data
        } else {
            let mut joined = std::mem::take(&mut self.parent_in_buffer);
            joined.extend_from_slice(&data);
            joined
        };

        if data.is_empty() {
            return;
        }
        if incomplete_ansi_sequence(&data) {
            self.parent_in_buffer = data;
            return;
        }

        loop {
            let leftover = self.parent_input(&data).await;
            if leftover.is_empty() {
                break;
            }
            if leftover.len() == data.len() {
                // Nothing consumed; hold and wait for more input.
                self.parent_in_buffer = leftover;
                break;
            }
            data = leftover;
        }
    }

    /// Dispatch one chunk of parent input by state; returns the leftover
    /// bytes to reprocess.
    async fn parent_input(&mut self, data: &[u8]) -> Vec<u8> {
        let first = data[0];
        match self.state {
            State::PromptResponse => {
                // Ctrl-C at either end cancels the stream.
                if first == CTRL_C || data[data.len() - 1] == CTRL_C {
                    tracing::info!("canceling prompt response");
                    if let Some(cancel) = self.prompt_response_cancel.take() {
                        cancel.cancel();
                    }
                    self.set_state(State::Normal);
                    return if first == CTRL_C {
                        data[1..].to_vec()
                    } else {
                        data[..data.len() - 1].to_vec()
                    };
                }
                // Typing during streaming is discarded.
                Vec::new()
            }

            State::Normal => self.parent_input_normal(data).await,
            State::Prompting => self.parent_input_prompting(data),
            State::Shell => self.parent_input_shell(data),
        }
    }

    async fn parent_input_normal(&mut self, data: &[u8]) -> Vec<u8> {
        let first = data[0];

        if first == CTRL_C {
            let _ = self.command.clear();
            let _ = self.prompt.clear();
            self.set_state(State::Normal);
            self.write_child(&[CTRL_C]);
            return data[1..].to_vec();
        }

        if first == FORM_FEED {
            self.write_parent(ESC_CLEAR_SCREEN);
            let _ = self.command.clear();
            let _ = self.prompt.clear();
            // CR forces the child to redraw its prompt.
            self.write_child(b"\r");
            return data[1..].to_vec();
        }

        if first.is_ascii_uppercase() {
            self.set_state(State::Prompting);
            let _ = self.prompt.clear();
            self.prompt.set_color(self.color.prompt);
            let echo = self.prompt.write(&data[..1]);
            let styled = self.color.prompt.as_bytes().to_vec();
            self.write_parent(&styled);
            self.write_parent(&echo);

            // Learn where input starts on this line so the prompt buffer
            // can wrap and clear correctly. Column is 1-based.
            let (_row, col) = self.get_cursor_position().await;
            self.prompt
                .set_prompt_length(col.saturating_sub(1 + self.prompt.size()));
            return data[1..].to_vec();
        }

        if first == b'\t' || first == b'\r' {
            // Shell-side completion and bare returns pass through.
            self.write_child(&data[..1]);
            return data[1..].to_vec();
        }

        // Ordinary command entry. Consume up to any carriage return so a
        // pasted "cmd\r" still lands in history as one ShellInput block.
        let split = data.iter().position(|&b| b == b'\r').unwrap_or(data.len());
        self.command = ShellBuffer::new();
        self.command.set_terminal_width(self.terminal_width);
        self.command.write(&data[..split]);
        if self.command.size() > 0 {
            self.set_state(State::Shell);
        }
        let color = self.color.command.as_bytes().to_vec();
        self.write_parent(&color);
        self.write_child(&data[..split]);
        data[split..].to_vec()
    }

    fn parent_input_prompting(&mut self, data: &[u8]) -> Vec<u8> {
        if let Some(index) = data.iter().position(|&b| b == b'\r') {
            let echo = self.prompt.write(&data[..index]);
            self.write_parent(&echo);
            self.write_parent(b"\n\r");
            self.send_prompt();
            return data[index + 1..].to_vec();
        }

        let first = data[0];
        if first == CTRL_C {
            if let Some(cancel) = self.prompt_response_cancel.take() {
                cancel.cancel();
            }
            let erase = self.prompt.clear();
            self.write_parent(&erase);
            let color = self.color.command.as_bytes().to_vec();
            self.write_parent(&color);
            self.set_state(State::Normal);
            return data[1..].to_vec();
        }

        if first == FORM_FEED {
            self.write_parent(ESC_CLEAR_SCREEN);
            let redraw = format!("{}{}", self.color.prompt, self.prompt.string());
            self.write_parent(redraw.as_bytes());
            return data[1..].to_vec();
        }

        let echo = self.prompt.write(data);
        self.write_parent(&echo);
        if self.prompt.size() == 0 {
            // Backspaced past the trigger character.
            let color = self.color.command.as_bytes().to_vec();
            self.write_parent(&color);
            self.set_state(State::Normal);
        }
        Vec::new()
    }

    fn parent_input_shell(&mut self, data: &[u8]) -> Vec<u8> {
        if let Some(index) = data.iter().position(|&b| b == b'\r') {
            self.set_state(State::Normal);
            self.write_child(&data[..=index]);
            let command = self.command.string();
            self.history.append(HistoryKind::ShellInput, &command);
            self.command = ShellBuffer::new();
            self.command.set_terminal_width(self.terminal_width);
            return data[index + 1..].to_vec();
        }

        let first = data[0];
        if first == CTRL_C {
            let _ = self.command.clear();
            self.set_state(State::Normal);
            self.write_child(&[CTRL_C]);
            return data[1..].to_vec();
        }

        if first == b'\t' {
            self.write_child(&[b'\t']);
            return data[1..].to_vec();
        }

        self.command.write(data);
        self.write_child(data);
        if self.command.size() == 0 {
            self.set_state(State::Normal);
        }
        Vec::new()
    }

    /// Issue a DSR and wait for the terminal's cursor report, draining any
    /// stale reports so the newest wins. A terminal that never answers is
    /// unusable, so the timeout is fatal.
    async fn get_cursor_position(&mut self) -> (usize, usize) {
        self.write_parent(ESC_CUP);

        let position =
            match tokio::time::timeout(DSR_TIMEOUT, self.channels.cursor_pos_rx.recv()).await {
                Ok(Some(position)) => position,
                Ok(None) | Err(_) => panic!(
                    "Timeout waiting for cursor position response, this means that either:\n\
                     - Butterfish has frozen due to a bug.\n\
                     - You're using a terminal emulator that doesn't work well with butterfish.\n\
                     Please submit an issue."
                ),
            };

        let mut newest = position;
        while let Ok(position) = self.channels.cursor_pos_rx.try_recv() {
            newest = position;
        }
        (newest.row, newest.col)
    }

    /// Assemble the chat request from the prompt buffer plus history and
    /// hand it to the completion driver.
    fn send_prompt(&mut self) {
        self.set_state(State::PromptResponse);

        let cancel = CancellationToken::new();
        self.prompt_response_cancel = Some(cancel.clone());

        let sysinfo = system_info();
        let sys_msg = match self
            .prompt_library
            .get(SHELL_SYSTEM_MESSAGE, &[("sysinfo", &sysinfo)])
        {
            Ok(message) => message,
            Err(err) => {
                self.report_error(anyhow!(
                    "could not retrieve prompting system message: {}",
                    err
                ));
                return;
            }
        };

        let prompt_text = self.prompt.string();
        let reserved_for_answer = self.config.max_response_tokens;
        let max_combined = self.prompt_max_tokens.saturating_sub(reserved_for_answer);

        let assembled = assemble_chat(
            &prompt_text,
            &sys_msg,
            &self.history,
            &self.config.prompt_model,
            self.encoder.as_ref(),
            MAX_USER_PROMPT_TOKENS,
            self.config.max_history_block_tokens,
            max_combined,
        );
        let (request_prompt, history_blocks) = match assembled {
            Ok(assembled) => assembled,
            Err(err) => {
                self.report_error(err);
                return;
            }
        };

        self.history.append(HistoryKind::UserPrompt, &prompt_text);
        if self.config.verbose > 1 {
            self.history.log_recent();
        }

        let request = CompletionRequest {
            cancel,
            prompt: request_prompt,
            model: self.config.prompt_model.clone(),
            max_tokens: reserved_for_answer,
            temperature: PROMPT_TEMPERATURE,
            history_blocks,
            system_message: sys_msg,
            verbose: self.config.verbose > 0,
            token_timeout: self.config.token_timeout,
        };

        tokio::spawn(completion_routine(
            request,
            Arc::clone(&self.client),
            Arc::clone(&self.style_writer),
            self.prompt_output_tx.clone(),
            self.color.answer.to_string(),
            self.color.error.to_string(),
        ));

        let _ = self.prompt.clear();
    }
}
