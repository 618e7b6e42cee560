// Completion driver: adapts the streaming client into a spawned task that
// ends with exactly one value on the completion channel, so the
// multiplexer can never get stuck in the response state.

use std::io::Write as _;

use tokio::sync::mpsc;

use super::{CompletionRequest, CompletionResponse, SharedAnswerWriter, StreamingClient};

/// Stream one completion into `writer` and deliver the result on
/// `output_tx`. Errors are rendered to the terminal in the error color
/// (silently for cancellation) and still produce a completion result so
/// the state machine always advances.
pub async fn completion_routine(
    request: CompletionRequest,
    client: std::sync::Arc<dyn StreamingClient>,
    writer: SharedAnswerWriter,
    output_tx: mpsc::Sender<CompletionResponse>,
    normal_color: String,
    error_color: String,
) {
    {
        let mut writer = writer.lock().unwrap();
        let _ = writer.write_all(normal_color.as_bytes());
    }

    let result = client.completion_stream(&request, writer.clone()).await;

    let response = match result {
        Ok(response) => response,
        Err(err) => {
            let err_str = format!("Error prompting LLM: {}\n", err);
            tracing::error!("{}", err_str);
            if !err_str.contains("context canceled") {
                let mut writer = writer.lock().unwrap();
                let _ = writer.write_all(error_color.as_bytes());
                let _ = writer.write_all(err_str.as_bytes());
            }
            CompletionResponse {
                completion: err.to_string(),
            }
        }
    };

    {
        let mut writer = writer.lock().unwrap();
        let _ = writer.reset_style();
    }

    // Exactly once per SendPrompt; the mux leaves PromptResponse only on
    // receipt of this value (or Ctrl-C, which also ends here).
    let _ = output_tx.send(response).await;
}
