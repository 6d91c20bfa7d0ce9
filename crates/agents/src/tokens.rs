//! Token accounting for history sizing.
//!
//! Counts are advisory: the orchestrator never enforces a budget, it only
//! reports. The accurate path uses `tiktoken-rs`, looking the encoding up by
//! model name and falling back to `o200k_base`, then to a byte-length
//! heuristic when no tokenizer is available at all.

use {tokio::task, tracing::warn};

/// Bytes-per-token heuristic used by the cheap path and as the final
/// fallback for the accurate one.
const BYTES_PER_TOKEN: usize = 4;

#[derive(Debug, thiserror::Error)]
pub enum TokenCountError {
    #[error("unknown token counting method `{0}`; expected `accurate` or `simple`")]
    InvalidMethod(String),

    #[error("token counting task failed: {0}")]
    Task(#[from] task::JoinError),
}

/// How to count tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CountMethod {
    /// Real tokenizer via `tiktoken-rs`.
    Accurate,
    /// Byte-length heuristic; no tokenizer involved.
    Simple,
}

impl std::str::FromStr for CountMethod {
    type Err = TokenCountError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "accurate" => Ok(Self::Accurate),
            "simple" => Ok(Self::Simple),
            other => Err(TokenCountError::InvalidMethod(other.to_string())),
        }
    }
}

/// Tokenize `text` with the model's encoding and count the tokens.
///
/// Unknown models fall back to the `o200k_base` encoding; if that is also
/// unavailable the byte-length heuristic answers instead.
pub fn accurate_token_count(text: &str, model: &str) -> usize {
    let bpe = match tiktoken_rs::get_bpe_from_model(model) {
        Ok(bpe) => bpe,
        Err(_) => match tiktoken_rs::o200k_base() {
            Ok(bpe) => bpe,
            Err(e) => {
                warn!(model, error = %e, "no tokenizer available, using length heuristic");
                return simple_token_count(text);
            },
        },
    };
    bpe.encode_with_special_tokens(text).len()
}

/// Cheap byte-length estimate: one token per four bytes of text.
pub fn simple_token_count(text: &str) -> usize {
    text.len() / BYTES_PER_TOKEN
}

/// Count tokens across a batch of history texts.
///
/// The accurate method runs on the blocking pool; tokenizing a long history
/// is CPU work that must not stall the runtime.
pub async fn history_token_count(
    texts: Vec<String>,
    model: &str,
    method: &str,
) -> Result<usize, TokenCountError> {
    match method.parse::<CountMethod>()? {
        CountMethod::Simple => Ok(texts.iter().map(|t| simple_token_count(t)).sum()),
        CountMethod::Accurate => {
            let model = model.to_string();
            let total = task::spawn_blocking(move || {
                texts
                    .iter()
                    .map(|t| accurate_token_count(t, &model))
                    .sum::<usize>()
            })
            .await?;
            Ok(total)
        },
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simple_count_is_length_over_four() {
        assert_eq!(simple_token_count(""), 0);
        assert_eq!(simple_token_count("abcd"), 1);
        assert_eq!(simple_token_count("abcdefgh"), 2);
    }

    #[test]
    fn accurate_count_is_positive_for_text() {
        let count = accurate_token_count("The quick brown fox jumps over the lazy dog.", "gpt-4o");
        assert!(count > 0);
        // Tokenizers compress common English well below one token per byte.
        assert!(count < 45);
    }

    #[test]
    fn unknown_model_falls_back_to_default_encoding() {
        let known = accurate_token_count("hello world", "gpt-4o");
        let unknown = accurate_token_count("hello world", "totally-made-up-model");
        assert!(unknown > 0);
        // Both answer; they may differ if the encodings differ.
        assert!(known > 0);
    }

    #[test]
    fn method_parsing_is_case_insensitive() {
        assert_eq!("accurate".parse::<CountMethod>().unwrap(), CountMethod::Accurate);
        assert_eq!("SIMPLE".parse::<CountMethod>().unwrap(), CountMethod::Simple);
        let err = "guess".parse::<CountMethod>().unwrap_err();
        assert!(matches!(err, TokenCountError::InvalidMethod(m) if m == "guess"));
    }

    #[tokio::test]
    async fn batch_count_sums_across_texts() {
        let texts = vec!["abcd".to_string(), "efghijkl".to_string()];
        let total = history_token_count(texts, "gpt-4o", "simple").await.unwrap();
        assert_eq!(total, 3);
    }

    #[tokio::test]
    async fn batch_count_accurate_runs_off_the_runtime() {
        let texts = vec!["hello world".to_string(), "goodbye".to_string()];
        let total = history_token_count(texts, "gpt-4o", "accurate")
            .await
            .unwrap();
        assert!(total > 0);
    }

    #[tokio::test]
    async fn bogus_method_is_rejected() {
        let err = history_token_count(vec!["x".to_string()], "gpt-4o", "estimate")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("unknown token counting method"));
    }
}
