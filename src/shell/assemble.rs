// Token-budget packer for LLM requests: system message + user prompt +
// as much recent history as fits. History is walked newest-first and the
// result is returned oldest-first. Shell output never leaves the machine.

use anyhow::{bail, Result};

use crate::shell::history::{clip_bytes, HistoryBlock, HistoryKind, ShellHistory};
use crate::term::sanitize_tty;
use crate::tokenizer::{count_and_truncate, tokens_per_message, Tokenizer};

/// Chat role for a history kind; `None` means the block is never sent.
pub fn role_for_kind(kind: HistoryKind) -> Option<&'static str> {
    match kind {
        HistoryKind::UserPrompt => Some("user"),
        HistoryKind::ShellInput => Some("user"),
        HistoryKind::LlmOutput => Some("assistant"),
        HistoryKind::ShellOutput => None,
    }
}

/// Pack a chat request under `max_tokens`. Returns the possibly-truncated
/// prompt and the oldest-first history blocks that fit.
pub fn assemble_chat(
    prompt: &str,
    sys_msg: &str,
    history: &ShellHistory,
    model: &str,
    encoder: &dyn Tokenizer,
    max_prompt_tokens: usize,
    max_history_block_tokens: usize,
    max_tokens: usize,
) -> Result<(String, Vec<HistoryBlock>)> {
    let per_message = tokens_per_message(model);
    let mut used_tokens = 3; // baseline framing for a chat request

    let (num_prompt_tokens, prompt, truncated) =
        count_and_truncate(prompt, encoder, max_prompt_tokens);
    if truncated {
        tracing::warn!("truncated the prompt to {} tokens", num_prompt_tokens);
    }
    used_tokens += num_prompt_tokens;

    let sys_msg_tokens = encoder.encode(sys_msg).len();
    if sys_msg_tokens > 1028 {
        tracing::warn!(
            "the system message is very long ({} tokens), this may cause you to hit the token limit; consider reducing it in prompts.yaml",
            sys_msg_tokens
        );
    }
    used_tokens += sys_msg_tokens + per_message;
    if used_tokens > max_tokens {
        bail!(
            "System message too long, {} tokens, max is {}",
            used_tokens,
            max_tokens
        );
    }

    let (blocks, history_tokens) = history_blocks_by_tokens(
        history,
        encoder,
        max_history_block_tokens,
        max_tokens - used_tokens,
        per_message,
    );
    used_tokens += history_tokens;

    if used_tokens > max_tokens {
        tracing::warn!(
            "history truncated significantly due to token limits, used {} of {}",
            used_tokens,
            max_tokens
        );
    }

    Ok((prompt, blocks))
}

/// Walk history newest-first, collecting blocks until the budget runs out;
/// the returned list is oldest-first. Per-block content is hard-capped at
/// `max_block_tokens * 4` bytes before tokenizing, then truncated to
/// `max_block_tokens` tokens, with the result cached on the block.
fn history_blocks_by_tokens(
    history: &ShellHistory,
    encoder: &dyn Tokenizer,
    max_block_tokens: usize,
    max_tokens: usize,
    per_message: usize,
) -> (Vec<HistoryBlock>, usize) {
    let mut blocks: Vec<HistoryBlock> = Vec::new();
    let mut used_tokens = 0usize;

    history.iterate_blocks(|block| {
        // Privacy: command output stays local.
        if block.kind == HistoryKind::ShellOutput {
            return true;
        }
        if block.content.size() == 0 {
            return true;
        }

        let role = match role_for_kind(block.kind) {
            Some(role) => role,
            None => return true,
        };
        let mut msg_tokens = per_message + encoder.encode(role).len();

        let content_len = block.content.size();
        let (content, content_tokens) = match block.tokenization(encoder.name(), content_len) {
            Some(cached) => cached,
            None => {
                let mut raw = block.content.string();
                clip_bytes(&mut raw, max_block_tokens * 4);
                let sanitized = sanitize_tty(&raw);
                let (tokens, data, _) = count_and_truncate(&sanitized, encoder, max_block_tokens);
                block.set_tokenization(encoder.name(), content_len, tokens, data.clone());
                (data, tokens)
            }
        };
        msg_tokens += content_tokens;

        if used_tokens + msg_tokens > max_tokens {
            return false;
        }
        used_tokens += msg_tokens;
        blocks.push(HistoryBlock {
            kind: block.kind,
            content,
        });
        true
    });

    blocks.reverse();
    (blocks, used_tokens)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tokenizer::BytePackEncoder;

    fn seeded_history() -> ShellHistory {
        let history = ShellHistory::new();
        history.append(HistoryKind::UserPrompt, "how do I list files");
        history.append(HistoryKind::LlmOutput, "use ls");
        history.append(HistoryKind::ShellInput, "ls -l");
        history.append(HistoryKind::ShellOutput, "total 0\nfile.txt");
        history
    }

    #[test]
    fn test_shell_output_never_included() {
        let history = seeded_history();
        let enc = BytePackEncoder;
        let (_, blocks) =
            assemble_chat("Why?", "assist", &history, "gpt-4.1-mini", &enc, 512, 64, 4096)
                .unwrap();
        assert!(!blocks.is_empty());
        assert!(blocks.iter().all(|b| b.kind != HistoryKind::ShellOutput));
    }

    #[test]
    fn test_blocks_come_back_oldest_first() {
        let history = seeded_history();
        let enc = BytePackEncoder;
        let (_, blocks) =
            assemble_chat("Why?", "assist", &history, "gpt-4.1-mini", &enc, 512, 64, 4096)
                .unwrap();
        assert_eq!(blocks[0].kind, HistoryKind::UserPrompt);
        assert_eq!(blocks.last().unwrap().kind, HistoryKind::ShellInput);
    }

    #[test]
    fn test_budget_is_respected() {
        let history = ShellHistory::new();
        for i in 0..50 {
            history.append(HistoryKind::UserPrompt, &format!("question number {}", i));
            history.append(HistoryKind::LlmOutput, &format!("answer number {}", i));
        }
        let enc = BytePackEncoder;
        let model = "gpt-4.1-mini";
        let max_tokens = 100;
        let (prompt, blocks) =
            assemble_chat("Hi", "sys", &history, model, &enc, 512, 64, max_tokens).unwrap();

        let per_message = tokens_per_message(model);
        let mut total = 3 + enc.encode(&prompt).len() + enc.encode("sys").len() + per_message;
        for block in &blocks {
            let role = role_for_kind(block.kind).unwrap();
            total += per_message + enc.encode(role).len() + enc.encode(&block.content).len();
        }
        assert!(total <= max_tokens, "total {} > max {}", total, max_tokens);
        // The budget is tight enough that something had to be dropped
        assert!(blocks.len() < 100);
    }

    #[test]
    fn test_newest_blocks_survive_budget_pressure() {
        let history = ShellHistory::new();
        history.append(HistoryKind::UserPrompt, "old old old old old old old old");
        history.append(HistoryKind::LlmOutput, "ancient answer text here");
        history.append(HistoryKind::UserPrompt, "newest");
        let enc = BytePackEncoder;
        let (_, blocks) =
            assemble_chat("Hi", "s", &history, "gpt-4.1-mini", &enc, 512, 64, 20).unwrap();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].content, "newest");
    }

    #[test]
    fn test_prompt_truncated_to_limit() {
        let history = ShellHistory::new();
        let enc = BytePackEncoder;
        let long_prompt = "word ".repeat(100);
        let (prompt, _) =
            assemble_chat(&long_prompt, "s", &history, "gpt-4.1-mini", &enc, 10, 64, 4096)
                .unwrap();
        assert_eq!(enc.encode(&prompt).len(), 10);
        assert!(long_prompt.starts_with(&prompt));
    }

    #[test]
    fn test_oversized_system_message_fails() {
        let history = ShellHistory::new();
        let enc = BytePackEncoder;
        let huge_sys = "x".repeat(4000);
        let result = assemble_chat("Hi", &huge_sys, &history, "gpt-4.1-mini", &enc, 512, 64, 100);
        assert!(result.is_err());
    }

    #[test]
    fn test_per_block_truncation() {
        let history = ShellHistory::new();
        history.append(HistoryKind::LlmOutput, &"y".repeat(1000));
        let enc = BytePackEncoder;
        let (_, blocks) =
            assemble_chat("Hi", "s", &history, "gpt-4.1-mini", &enc, 512, 8, 4096).unwrap();
        assert_eq!(blocks.len(), 1);
        assert!(enc.encode(&blocks[0].content).len() <= 8);
    }

    #[test]
    fn test_tokenization_cache_reused() {
        let history = ShellHistory::new();
        history.append(HistoryKind::UserPrompt, "cache me");
        let enc = BytePackEncoder;
        for _ in 0..2 {
            let (_, blocks) =
                assemble_chat("Hi", "s", &history, "gpt-4.1-mini", &enc, 512, 64, 4096).unwrap();
            assert_eq!(blocks[0].content, "cache me");
        }
        // After assembly the cache holds a valid entry for the encoder
        history.iterate_blocks(|block| {
            let len = block.content.size();
            assert!(block.tokenization(enc.name(), len).is_some());
            false
        });
    }

    #[test]
    fn test_roles() {
        assert_eq!(role_for_kind(HistoryKind::UserPrompt), Some("user"));
        assert_eq!(role_for_kind(HistoryKind::ShellInput), Some("user"));
        assert_eq!(role_for_kind(HistoryKind::LlmOutput), Some("assistant"));
        assert_eq!(role_for_kind(HistoryKind::ShellOutput), None);
    }
}
