// Streaming-completion contract between the multiplexer and whatever
// speaks to the model service. The multiplexer only needs: build a
// request, stream tokens into a writer, get exactly one response back,
// and be able to cancel mid-flight.

pub mod driver;
pub mod openai;

use std::io::Write;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::shell::history::HistoryBlock;

/// Answer sink shared between the multiplexer and the completion driver:
/// a writer that also knows how to reset its styling between completions
/// and track terminal resizes.
pub trait AnswerWriter: Write + Send {
    fn reset_style(&mut self) -> std::io::Result<()>;
    fn set_width(&mut self, width: usize);
}

pub type SharedAnswerWriter = Arc<Mutex<dyn AnswerWriter>>;

impl<W: Write + Send> AnswerWriter for crate::term::StyleCodeblocksWriter<W> {
    fn reset_style(&mut self) -> std::io::Result<()> {
        self.reset()
    }

    fn set_width(&mut self, width: usize) {
        self.set_terminal_width(width)
    }
}

/// Everything needed for one streamed completion.
pub struct CompletionRequest {
    /// Cooperative cancellation; fired on Ctrl-C.
    pub cancel: CancellationToken,
    pub prompt: String,
    pub model: String,
    pub max_tokens: usize,
    pub temperature: f32,
    pub history_blocks: Vec<HistoryBlock>,
    pub system_message: String,
    pub verbose: bool,
    /// Budget for the first token and for each inter-token gap.
    pub token_timeout: Duration,
}

#[derive(Debug, Clone, Default)]
pub struct CompletionResponse {
    pub completion: String,
}

/// A client that streams a completion into the writer as tokens arrive
/// and returns the concatenated text when the stream ends. Cancellation
/// must yield a response carrying whatever was streamed so far.
#[async_trait]
pub trait StreamingClient: Send + Sync {
    async fn completion_stream(
        &self,
        request: &CompletionRequest,
        writer: SharedAnswerWriter,
    ) -> Result<CompletionResponse>;
}
