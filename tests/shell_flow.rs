// End-to-end multiplexer scenarios over in-memory streams: keystrokes go
// in through the parent-input channel, child output through its channel,
// and a scripted client stands in for the completion service.

use std::io::Write;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use butterfish::config::Config;
use butterfish::llm::{
    CompletionRequest, CompletionResponse, SharedAnswerWriter, StreamingClient,
};
use butterfish::prompts::PromptLibrary;
use butterfish::shell::assemble::assemble_chat;
use butterfish::shell::{
    CursorPosition, HistoryBlock, HistoryKind, ShellChannels, ShellHistory, ShellState, State,
};
use butterfish::tokenizer::BytePackEncoder;

#[derive(Clone, Default)]
struct SharedBuf(Arc<Mutex<Vec<u8>>>);

impl SharedBuf {
    fn text(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

impl Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }
    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Scripted completion client: records requests, then either answers
/// after `delay` or, if canceled first, returns the first half of the
/// reply as the partial completion.
struct ScriptedClient {
    reply: String,
    delay: Duration,
    requests: Arc<Mutex<Vec<(String, Vec<HistoryBlock>)>>>,
}

impl ScriptedClient {
    fn new(reply: &str, delay: Duration) -> Self {
        Self {
            reply: reply.to_string(),
            delay,
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

#[async_trait]
impl StreamingClient for ScriptedClient {
    async fn completion_stream(
        &self,
        request: &CompletionRequest,
        writer: SharedAnswerWriter,
    ) -> Result<CompletionResponse> {
        self.requests
            .lock()
            .unwrap()
            .push((request.prompt.clone(), request.history_blocks.clone()));

        tokio::select! {
            _ = request.cancel.cancelled() => {
                let partial = self.reply[..self.reply.len() / 2].to_string();
                writer.lock().unwrap().write_all(partial.as_bytes())?;
                Ok(CompletionResponse { completion: partial })
            }
            _ = tokio::time::sleep(self.delay) => {
                writer.lock().unwrap().write_all(self.reply.as_bytes())?;
                Ok(CompletionResponse {
                    completion: self.reply.clone(),
                })
            }
        }
    }
}

struct Harness {
    parent_in_tx: mpsc::Sender<Vec<u8>>,
    child_out_tx: mpsc::Sender<Vec<u8>>,
    cursor_pos_tx: mpsc::Sender<CursorPosition>,
    _sigwinch_tx: mpsc::Sender<()>,
    parent_out: SharedBuf,
    child_in: SharedBuf,
    history: Arc<ShellHistory>,
    cancel: CancellationToken,
    handle: JoinHandle<ShellState>,
}

impl Harness {
    fn start(client: Arc<dyn StreamingClient>) -> Self {
        let (parent_in_tx, parent_in_rx) = mpsc::channel(8);
        let (child_out_tx, child_out_rx) = mpsc::channel(8);
        let (cursor_pos_tx, cursor_pos_rx) = mpsc::channel(128);
        let (sigwinch_tx, sigwinch_rx) = mpsc::channel(1);

        let parent_out = SharedBuf::default();
        let child_in = SharedBuf::default();
        let cancel = CancellationToken::new();

        let config = Config {
            shell_binary: "/bin/bash".to_string(),
            ..Config::default()
        };

        let mut state = ShellState::new(
            config,
            Box::new(parent_out.clone()),
            Box::new(child_in.clone()),
            ShellChannels {
                child_out_rx,
                parent_in_rx,
                cursor_pos_rx,
                sigwinch_rx,
            },
            client,
            Arc::new(PromptLibrary::defaults()),
            cancel.clone(),
            80,
            Box::new(|| 80),
        );
        let history = state.history();

        let handle = tokio::spawn(async move {
            let _ = state.mux().await;
            state
        });

        Self {
            parent_in_tx,
            child_out_tx,
            cursor_pos_tx,
            _sigwinch_tx: sigwinch_tx,
            parent_out,
            child_in,
            history,
            cancel,
            handle,
        }
    }

    async fn type_bytes(&self, bytes: &[u8]) {
        self.parent_in_tx.send(bytes.to_vec()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
    }

    async fn child_prints(&self, bytes: &[u8]) {
        self.child_out_tx.send(bytes.to_vec()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
    }

    /// Start prompt entry: send the whole line, then satisfy the cursor
    /// query the first uppercase byte triggers.
    async fn type_prompt_line(&self, line: &[u8]) {
        self.parent_in_tx.send(line.to_vec()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        self.cursor_pos_tx
            .send(CursorPosition { row: 1, col: 4 })
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
    }

    fn blocks(&self) -> Vec<HistoryBlock> {
        self.history.last_n_bytes(100_000, 100_000)
    }

    async fn finish(self) -> ShellState {
        self.cancel.cancel();
        self.handle.await.unwrap()
    }
}

#[tokio::test]
async fn plain_command_passthrough() {
    let harness = Harness::start(Arc::new(ScriptedClient::new(
        "unused",
        Duration::from_millis(10),
    )));

    harness.type_bytes(b"ls -l\r").await;

    assert_eq!(harness.child_in.text(), "ls -l\r");
    let blocks = harness.blocks();
    assert_eq!(blocks.len(), 1);
    assert_eq!(blocks[0].kind, HistoryKind::ShellInput);
    assert_eq!(blocks[0].content, "ls -l");

    let state = harness.finish().await;
    assert_eq!(state.current_state(), State::Normal);
}

#[tokio::test]
async fn uppercase_triggers_prompt_and_streams_reply() {
    let client = Arc::new(ScriptedClient::new("use ls -la", Duration::from_millis(50)));
    let harness = Harness::start(client.clone());

    harness.type_prompt_line(b"How are you?\r").await;
    tokio::time::sleep(Duration::from_millis(150)).await;

    // The client saw exactly one request with the composed prompt text
    let requests = client.requests.lock().unwrap().clone();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].0, "How are you?");

    // History: the prompt, then the model's answer
    let blocks = harness.blocks();
    assert_eq!(blocks.len(), 2);
    assert_eq!(blocks[0].kind, HistoryKind::UserPrompt);
    assert_eq!(blocks[0].content, "How are you?");
    assert_eq!(blocks[1].kind, HistoryKind::LlmOutput);
    assert_eq!(blocks[1].content, "use ls -la");

    // The streamed answer reached the parent terminal
    assert!(harness.parent_out.text().contains("use ls -la"));
    // And the child was nudged for a fresh prompt
    assert!(harness.child_in.text().ends_with('\n'));

    let state = harness.finish().await;
    assert_eq!(state.current_state(), State::Normal);
}

#[tokio::test]
async fn ctrl_c_cancels_streaming_response() {
    let client = Arc::new(ScriptedClient::new(
        "a very long answer",
        Duration::from_secs(30),
    ));
    let harness = Harness::start(client.clone());

    harness.type_prompt_line(b"Tell me everything\r").await;
    harness.type_bytes(&[0x03]).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    // The partial completion was recorded
    let blocks = harness.blocks();
    assert!(blocks
        .iter()
        .any(|b| b.kind == HistoryKind::LlmOutput && b.content == "a very lo"));

    let state = harness.finish().await;
    assert_eq!(state.current_state(), State::Normal);
}

#[tokio::test]
async fn input_during_streaming_is_discarded() {
    let client = Arc::new(ScriptedClient::new("answer", Duration::from_millis(200)));
    let harness = Harness::start(client.clone());

    harness.type_prompt_line(b"Question\r").await;
    let child_before = harness.child_in.text();
    // These keystrokes arrive mid-stream and must not replay afterwards
    harness.type_bytes(b"echo hi").await;
    tokio::time::sleep(Duration::from_millis(300)).await;

    let child_after = harness.child_in.text();
    assert!(!child_after.contains("echo hi"));
    // Only the fresh-prompt newline was added
    assert_eq!(format!("{}\n", child_before), child_after);

    let state = harness.finish().await;
    assert_eq!(state.current_state(), State::Normal);
}

#[tokio::test]
async fn child_output_buffered_until_response_finishes() {
    let client = Arc::new(ScriptedClient::new("the answer", Duration::from_millis(150)));
    let harness = Harness::start(client.clone());

    harness.type_prompt_line(b"Q\r").await;
    // Child talks while the response is streaming
    harness.child_prints(b"background output\n").await;

    let so_far = harness.parent_out.text();
    assert!(!so_far.contains("background output"));

    tokio::time::sleep(Duration::from_millis(250)).await;
    let after = harness.parent_out.text();
    // Both made it out, answer strictly before the buffered child output
    let answer_at = after.find("the answer").unwrap();
    let output_at = after.find("background output").unwrap();
    assert!(answer_at < output_at);

    harness.finish().await;
}

#[tokio::test]
async fn shell_output_recorded_but_never_sent_to_llm() {
    let harness = Harness::start(Arc::new(ScriptedClient::new(
        "unused",
        Duration::from_millis(10),
    )));

    harness.type_bytes(b"cat secrets.txt\r").await;
    harness.child_prints(b"hunter2\n").await;

    // The debugging view shows the output
    let blocks = harness.blocks();
    assert!(blocks
        .iter()
        .any(|b| b.kind == HistoryKind::ShellOutput && b.content.contains("hunter2")));

    // But an assembled chat never includes it
    let encoder = BytePackEncoder;
    let (_, chat_blocks) = assemble_chat(
        "What was that?",
        "sys",
        &harness.history,
        "gpt-4.1-mini",
        &encoder,
        512,
        1024,
        8192,
    )
    .unwrap();
    assert!(!chat_blocks.is_empty());
    assert!(chat_blocks.iter().all(|b| !b.content.contains("hunter2")));
    assert!(chat_blocks.iter().all(|b| b.kind != HistoryKind::ShellOutput));

    harness.finish().await;
}

#[tokio::test]
async fn ps1_sentinels_parsed_and_stripped() {
    let harness = Harness::start(Arc::new(ScriptedClient::new(
        "unused",
        Duration::from_millis(10),
    )));

    harness.child_prints("\x1bQ🐠 127\x1bR $ ".as_bytes()).await;

    assert_eq!(harness.parent_out.text(), "🐠 $ ");

    let state = harness.finish().await;
    assert_eq!(state.prompt_suffix_counter(), 1);
    assert_eq!(state.last_exit_status(), 127);
}

#[tokio::test]
async fn ctrl_c_while_prompting_returns_to_normal() {
    let harness = Harness::start(Arc::new(ScriptedClient::new(
        "unused",
        Duration::from_millis(10),
    )));

    harness.type_prompt_line(b"Half a quest").await;
    harness.type_bytes(&[0x03]).await;

    // No request was ever sent, no prompt recorded
    assert!(harness.blocks().is_empty());

    let state = harness.finish().await;
    assert_eq!(state.current_state(), State::Normal);
}

#[tokio::test]
async fn prompt_uses_prior_exchange_as_context() {
    let client = Arc::new(ScriptedClient::new("try ls -a", Duration::from_millis(20)));
    let harness = Harness::start(client.clone());

    harness.type_bytes(b"ls\r").await;
    harness.type_prompt_line(b"What else?\r").await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let requests = client.requests.lock().unwrap().clone();
    assert_eq!(requests.len(), 1);
    let (_, blocks) = &requests[0];
    assert!(blocks
        .iter()
        .any(|b| b.kind == HistoryKind::ShellInput && b.content == "ls"));

    harness.finish().await;
}

#[tokio::test]
async fn child_eof_ends_the_session() {
    let harness = Harness::start(Arc::new(ScriptedClient::new(
        "unused",
        Duration::from_millis(10),
    )));

    drop(harness.child_out_tx);
    let state = tokio::time::timeout(Duration::from_secs(1), harness.handle)
        .await
        .expect("mux should exit on child EOF")
        .unwrap();
    assert_eq!(state.current_state(), State::Normal);
}
