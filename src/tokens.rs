//! Thin wrapper around tiktoken for fast, cached token counting.

use once_cell::sync::Lazy;
use std::sync::Mutex;
use tiktoken_rs::{cl100k_base, CoreBPE};

/// Cached encoder, created once per process. `None` if the bundled ranks fail to load.
static ENCODER: Lazy<Option<Mutex<CoreBPE>>> = Lazy::new(|| match cl100k_base() {
    Ok(bpe) => Some(Mutex::new(bpe)),
    Err(e) => {
        tracing::error!("Failed to initialize cl100k encoder: {:?}", e);
        None
    }
});

/// Count tokens for a piece of UTF-8 text.
///
/// Falls back to a whitespace word count if the encoder is unavailable, so chunk sizing
/// stays deterministic within a process.
pub fn count_tokens(text: &str) -> usize {
    match ENCODER.as_ref() {
        Some(encoder) => encoder
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .encode_with_special_tokens(text)
            .len(),
        None => text.split_whitespace().count(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_count_tokens_basic() {
        assert_eq!(count_tokens("Hello, world!"), 4); // "Hello", ",", " world", "!"
        assert_eq!(count_tokens(""), 0);
        assert_eq!(count_tokens("Hello"), 1);
    }

    #[test]
    fn test_count_tokens_grows_with_text() {
        let short = count_tokens("The quick brown fox");
        let long = count_tokens("The quick brown fox jumps over the lazy dog");
        assert!(long > short);
        assert_eq!(long, count_tokens("The quick brown fox jumps over the lazy dog"));
    }
}
