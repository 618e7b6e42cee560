// Conversation history: what the user typed at the shell, what they asked
// the model, and what the model said, kept as typed blocks of terminal
// bytes. Shell output is recorded too, but the assembler filters it out of
// LLM requests (see assemble.rs).

use std::collections::HashMap;
use std::sync::Mutex;

use crate::term::{sanitize_tty, ShellBuffer};

/// What a history block contains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HistoryKind {
    UserPrompt,
    ShellInput,
    ShellOutput,
    LlmOutput,
}

impl HistoryKind {
    pub fn label(&self) -> &'static str {
        match self {
            HistoryKind::UserPrompt => "Prompt",
            HistoryKind::ShellInput => "Shell Input",
            HistoryKind::ShellOutput => "Shell Output",
            HistoryKind::LlmOutput => "LLM Output",
        }
    }
}

/// Cached tokenization of a block's content for one encoder. Valid only
/// while `input_len` still matches the content size.
#[derive(Debug, Clone)]
pub struct Tokenization {
    pub input_len: usize,
    pub num_tokens: usize,
    pub data: String,
}

/// One run of same-kind content plus its tokenization cache.
#[derive(Debug)]
pub struct HistoryBuffer {
    pub kind: HistoryKind,
    pub content: ShellBuffer,
    tokenizations: HashMap<String, Tokenization>,
}

impl HistoryBuffer {
    fn new(kind: HistoryKind) -> Self {
        Self {
            kind,
            content: ShellBuffer::new(),
            tokenizations: HashMap::new(),
        }
    }

    pub fn set_tokenization(&mut self, encoding: &str, input_len: usize, num_tokens: usize, data: String) {
        self.tokenizations.insert(
            encoding.to_string(),
            Tokenization {
                input_len,
                num_tokens,
                data,
            },
        );
    }

    /// Cached tokenization for `encoding`, if it was computed against the
    /// current content length.
    pub fn tokenization(&self, encoding: &str, len: usize) -> Option<(String, usize)> {
        let cached = self.tokenizations.get(encoding)?;
        if cached.input_len != len {
            return None;
        }
        Some((cached.data.clone(), cached.num_tokens))
    }
}

/// A plain snapshot of a block, handed to request assembly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryBlock {
    pub kind: HistoryKind,
    pub content: String,
}

/// Mutex-guarded ordered block list spanning one multiplexer session.
pub struct ShellHistory {
    blocks: Mutex<Vec<HistoryBuffer>>,
}

impl Default for ShellHistory {
    fn default() -> Self {
        Self::new()
    }
}

impl ShellHistory {
    pub fn new() -> Self {
        Self {
            blocks: Mutex::new(Vec::new()),
        }
    }

    /// Append content; consecutive appends of the same kind merge into the
    /// last block. Empty input is a no-op.
    pub fn append(&self, kind: HistoryKind, data: &str) {
        if data.is_empty() {
            return;
        }
        let mut blocks = self.blocks.lock().unwrap();
        if let Some(last) = blocks.last_mut() {
            if last.kind == kind {
                last.content.write(data.as_bytes());
                return;
            }
        }
        let mut buffer = HistoryBuffer::new(kind);
        buffer.content.write(data.as_bytes());
        blocks.push(buffer);
    }

    /// Walk blocks newest-first under the mutex. The callback may mutate
    /// the tokenization cache; returning false stops the walk.
    pub fn iterate_blocks<F>(&self, mut callback: F)
    where
        F: FnMut(&mut HistoryBuffer) -> bool,
    {
        let mut blocks = self.blocks.lock().unwrap();
        for block in blocks.iter_mut().rev() {
            if !callback(block) {
                break;
            }
        }
    }

    /// Debugging view: most recent blocks, oldest-first, each sanitized
    /// and cut to `truncate_len`. Stops before a block that would push the
    /// total past `max_bytes`.
    pub fn last_n_bytes(&self, max_bytes: usize, truncate_len: usize) -> Vec<HistoryBlock> {
        let blocks = self.blocks.lock().unwrap();
        let mut out = Vec::new();
        let mut remaining = max_bytes;
        for block in blocks.iter().rev() {
            if remaining == 0 {
                break;
            }
            let mut content = sanitize_tty(&block.content.string());
            clip_bytes(&mut content, truncate_len);
            if content.len() > remaining {
                break;
            }
            remaining -= content.len();
            out.push(HistoryBlock {
                kind: block.kind,
                content,
            });
        }
        out.reverse();
        out
    }

    pub fn block_count(&self) -> usize {
        self.blocks.lock().unwrap().len()
    }

    /// Recent-history trace line for verbose mode.
    pub fn log_recent(&self) {
        let blocks = self.last_n_bytes(2000, 512);
        let mut summary = String::new();
        for block in &blocks {
            summary.push_str(&format!("{}: {}\n", block.kind.label(), block.content));
        }
        tracing::debug!("recent history:\n{}", summary);
    }
}

/// Byte-length cap that respects UTF-8 character boundaries.
pub(crate) fn clip_bytes(text: &mut String, max_bytes: usize) {
    if text.len() <= max_bytes {
        return;
    }
    let mut end = max_bytes;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    text.truncate(end);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clip_bytes_respects_char_boundaries() {
        let mut s = "aᐅb".to_string(); // 1 + 3 + 1 bytes
        clip_bytes(&mut s, 3);
        assert_eq!(s, "a");
        let mut s = "aᐅb".to_string();
        clip_bytes(&mut s, 4);
        assert_eq!(s, "aᐅ");
    }

    #[test]
    fn test_same_kind_appends_merge() {
        let history = ShellHistory::new();
        history.append(HistoryKind::UserPrompt, "prompt1");
        history.append(HistoryKind::ShellInput, "shell1");
        history.append(HistoryKind::ShellOutput, "output1");
        history.append(HistoryKind::LlmOutput, "llm1");
        assert_eq!(history.block_count(), 4);

        history.append(HistoryKind::LlmOutput, " llm2");
        assert_eq!(history.block_count(), 4);

        history.append(HistoryKind::UserPrompt, "prompt2");
        assert_eq!(history.block_count(), 5);
    }

    #[test]
    fn test_no_adjacent_blocks_share_kind() {
        let history = ShellHistory::new();
        let kinds = [
            HistoryKind::UserPrompt,
            HistoryKind::UserPrompt,
            HistoryKind::ShellInput,
            HistoryKind::ShellInput,
            HistoryKind::ShellOutput,
            HistoryKind::LlmOutput,
            HistoryKind::LlmOutput,
        ];
        for (i, kind) in kinds.iter().enumerate() {
            history.append(*kind, &format!("data{}", i));
        }
        let blocks = history.last_n_bytes(10_000, 10_000);
        for pair in blocks.windows(2) {
            assert_ne!(pair[0].kind, pair[1].kind);
        }
    }

    #[test]
    fn test_empty_append_is_noop() {
        let history = ShellHistory::new();
        history.append(HistoryKind::ShellInput, "");
        assert_eq!(history.block_count(), 0);
    }

    #[test]
    fn test_iterate_newest_first() {
        let history = ShellHistory::new();
        history.append(HistoryKind::UserPrompt, "first");
        history.append(HistoryKind::LlmOutput, "second");
        history.append(HistoryKind::ShellInput, "third");

        let mut seen = Vec::new();
        history.iterate_blocks(|block| {
            seen.push(block.content.string());
            true
        });
        assert_eq!(seen, vec!["third", "second", "first"]);
    }

    #[test]
    fn test_iterate_early_abort() {
        let history = ShellHistory::new();
        history.append(HistoryKind::UserPrompt, "a");
        history.append(HistoryKind::LlmOutput, "b");
        let mut count = 0;
        history.iterate_blocks(|_| {
            count += 1;
            false
        });
        assert_eq!(count, 1);
    }

    #[test]
    fn test_last_n_bytes_truncates_and_orders() {
        let history = ShellHistory::new();
        history.append(HistoryKind::UserPrompt, "aaaa");
        history.append(HistoryKind::LlmOutput, "bbbbbbbb");
        let blocks = history.last_n_bytes(100, 4);
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].content, "aaaa");
        assert_eq!(blocks[1].content, "bbbb");
    }

    #[test]
    fn test_last_n_bytes_skips_partial_block() {
        let history = ShellHistory::new();
        history.append(HistoryKind::UserPrompt, "oldest-block");
        history.append(HistoryKind::LlmOutput, "12345678");
        // Budget fits the newest block only; the older one would overflow
        let blocks = history.last_n_bytes(10, 100);
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].content, "12345678");
    }

    #[test]
    fn test_last_n_bytes_sanitizes() {
        let history = ShellHistory::new();
        history.append(HistoryKind::ShellOutput, "\x1b[31mred\x1b[0m");
        let blocks = history.last_n_bytes(100, 100);
        assert_eq!(blocks[0].content, "red");
    }

    #[test]
    fn test_tokenization_cache_validity() {
        let history = ShellHistory::new();
        history.append(HistoryKind::UserPrompt, "hello");
        history.iterate_blocks(|block| {
            let len = block.content.size();
            assert!(block.tokenization("enc", len).is_none());
            block.set_tokenization("enc", len, 2, "hello".to_string());
            assert_eq!(block.tokenization("enc", len), Some(("hello".to_string(), 2)));
            // Stale when length changes
            assert!(block.tokenization("enc", len + 1).is_none());
            false
        });
    }
}
