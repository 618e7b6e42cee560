// Byte-pair encoder contract consumed by chat assembly.
//
// The history store caches tokenizations keyed by encoder name, and the
// assembler truncates text by token count, so the only operations the
// core needs are encode, decode, and a stable name.

/// Minimal tokenizer contract: `decode(encode(s))` must reproduce `s`,
/// and `decode(encode(s)[..n])` must be a prefix of `s`.
pub trait Tokenizer: Send + Sync {
    fn encode(&self, text: &str) -> Vec<u32>;
    fn decode(&self, tokens: &[u32]) -> String;
    /// Stable identifier used as the tokenization cache key.
    fn name(&self) -> &str;
}

/// Default encoder: packs up to four UTF-8 bytes (always whole characters)
/// into each token id. This keeps the usual ~4-characters-per-token ratio
/// for budgeting while making truncation by token count exact.
///
/// Unused high bytes of a token hold `PAD`, which is never a valid UTF-8
/// byte, so every payload byte — including NUL — survives the round trip.
pub struct BytePackEncoder;

/// 0xFF cannot occur in well-formed UTF-8, making it safe as padding.
const PAD: u8 = 0xff;

impl Tokenizer for BytePackEncoder {
    fn encode(&self, text: &str) -> Vec<u32> {
        let mut tokens = Vec::with_capacity(text.len() / 4 + 1);
        let mut packed: u32 = u32::from_be_bytes([PAD; 4]);
        let mut filled = 0usize;
        for ch in text.chars() {
            let mut utf8 = [0u8; 4];
            let encoded = ch.encode_utf8(&mut utf8).as_bytes();
            if filled + encoded.len() > 4 {
                tokens.push(packed);
                packed = u32::from_be_bytes([PAD; 4]);
                filled = 0;
            }
            for &b in encoded {
                packed = (packed << 8) | u32::from(b);
                filled += 1;
            }
        }
        if filled > 0 {
            tokens.push(packed);
        }
        tokens
    }

    fn decode(&self, tokens: &[u32]) -> String {
        let mut bytes = Vec::with_capacity(tokens.len() * 4);
        for &token in tokens {
            for b in token.to_be_bytes() {
                if b != PAD {
                    bytes.push(b);
                }
            }
        }
        String::from_utf8_lossy(&bytes).into_owned()
    }

    fn name(&self) -> &str {
        "bytepack-4"
    }
}

/// Per-message framing overhead in tokens for a chat request.
pub fn tokens_per_message(model: &str) -> usize {
    if model.starts_with("gpt-3.5") {
        4
    } else {
        3
    }
}

/// Context-window size for known models; a conservative default otherwise.
pub fn max_tokens_for_model(model: &str) -> usize {
    if model.starts_with("gpt-4.1") {
        1_000_000
    } else if model.starts_with("gpt-4o") || model.starts_with("gpt-4-turbo") {
        128_000
    } else if model.starts_with("gpt-4") {
        8_192
    } else if model.starts_with("gpt-3.5") {
        16_385
    } else {
        128_000
    }
}

/// Count tokens in `text`, truncating to `max_tokens` when it would exceed
/// them. Returns the token count, the (possibly truncated) text, and
/// whether truncation happened.
pub fn count_and_truncate(
    text: &str,
    encoder: &dyn Tokenizer,
    max_tokens: usize,
) -> (usize, String, bool) {
    let tokens = encoder.encode(text);
    if tokens.len() >= max_tokens {
        let kept = &tokens[..max_tokens];
        (kept.len(), encoder.decode(kept), true)
    } else {
        (tokens.len(), text.to_string(), false)
    }
}
