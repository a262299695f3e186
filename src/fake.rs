//! Deterministic [`TokenSource`] for tests and the demo binary.

use anyhow::{Result, bail};

use crate::batch::{Generation, TokenSource};
use crate::request::Request;
use crate::token::{FinishReason, Token, TokenEntry};

const VOCAB: &[&str] = &[
    " the", " quick", " brown", " fox", " jumps", " over", " a", " lazy", " dog", ".",
];

/// Cycles through a fixed vocabulary, starting at an offset derived from the
/// request id so concurrent requests produce different text.
#[derive(Debug, Clone, Default)]
pub struct FakeTokenSource {
    steps: usize,
    fail_after: Option<usize>,
    eos_after: Option<usize>,
}

impl FakeTokenSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every call once `steps` tokens have been produced in total.
    pub fn failing_after(steps: usize) -> Self {
        Self {
            fail_after: Some(steps),
            ..Self::default()
        }
    }

    /// Report `eos_token` on the `tokens`-th token of each request.
    pub fn with_eos_after(mut self, tokens: usize) -> Self {
        self.eos_after = Some(tokens);
        self
    }

    /// Tokens produced so far across all requests.
    pub fn steps(&self) -> usize {
        self.steps
    }
}

impl TokenSource for FakeTokenSource {
    fn next_token(&mut self, request: &Request) -> Result<Generation> {
        if self.fail_after.is_some_and(|n| self.steps >= n) {
            bail!("fake model failed after {} steps", self.steps);
        }
        self.steps += 1;

        let n = request.generated_tokens();
        let idx = (request.id() as usize + n) % VOCAB.len();
        let log_prob = -((idx + 1) as f64) / 10.0;
        let token = Token::new(idx as u32 + 100, VOCAB[idx], Some(log_prob));
        match self.eos_after {
            Some(limit) if n + 1 >= limit => Ok(Generation::finished(token, FinishReason::EosToken)),
            _ => Ok(Generation::next(token)),
        }
    }

    fn prompt_tokens_details(&mut self, request: &Request) -> Result<Vec<TokenEntry>> {
        Ok(request
            .input_text()
            .split_whitespace()
            .enumerate()
            .map(|(i, word)| TokenEntry {
                id: vec![i as u32],
                text: word.to_string(),
                log_prob: (i > 0).then_some(-0.5),
            })
            .collect())
    }
}
