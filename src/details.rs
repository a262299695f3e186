//! Per-request diagnostic state.

use serde::Serialize;
use serde_json::{Map, Value};

use crate::token::{FinishReason, Token, TokenEntry};

/// Caller supplied generation options, kept verbatim.
pub type Parameters = Map<String, Value>;

/// Snapshot handed to every formatter.
///
/// Serializes to the shape custom formatters see: `finish_reason` is `null`
/// until the terminal token, `prompt_tokens` and `prefill` only appear when
/// known.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Details {
    pub finish_reason: Option<FinishReason>,
    pub generated_tokens: usize,
    pub inputs: String,
    pub tokens: Vec<TokenEntry>,
    pub parameters: Parameters,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt_tokens: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prefill: Option<Vec<TokenEntry>>,
}

/// Reads a boolean switch from `parameters`; anything but `true` is off.
pub(crate) fn flag(parameters: &Parameters, key: &str) -> bool {
    parameters.get(key).and_then(Value::as_bool).unwrap_or(false)
}

/// Accumulates [`Details`] as tokens are accepted. Token history is only
/// retained when details are enabled; the count is always kept.
#[derive(Debug, Clone)]
pub(crate) struct DetailsTracker {
    details: Details,
    enabled: bool,
}

/// Tracker state before a step, used to undo it when formatting fails.
#[derive(Debug, Clone)]
pub(crate) struct Checkpoint {
    generated_tokens: usize,
    tokens_len: usize,
    finish_reason: Option<FinishReason>,
    prefill: Option<Vec<TokenEntry>>,
}

impl DetailsTracker {
    pub fn new(
        inputs: String,
        parameters: Parameters,
        prompt_tokens: Option<usize>,
        enabled: bool,
    ) -> Self {
        Self {
            details: Details {
                inputs,
                parameters,
                prompt_tokens,
                ..Details::default()
            },
            enabled,
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn details(&self) -> &Details {
        &self.details
    }

    pub fn accept(&mut self, token: &Token) {
        self.details.generated_tokens += 1;
        if self.enabled {
            self.details.tokens.push(token.as_entry());
        }
    }

    pub fn finish(&mut self, reason: Option<FinishReason>, prefill: Option<Vec<TokenEntry>>) {
        self.details.finish_reason = reason;
        self.details.prefill = prefill;
    }

    pub fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            generated_tokens: self.details.generated_tokens,
            tokens_len: self.details.tokens.len(),
            finish_reason: self.details.finish_reason.clone(),
            prefill: self.details.prefill.clone(),
        }
    }

    pub fn restore(&mut self, checkpoint: Checkpoint) {
        self.details.generated_tokens = checkpoint.generated_tokens;
        self.details.tokens.truncate(checkpoint.tokens_len);
        self.details.finish_reason = checkpoint.finish_reason;
        self.details.prefill = checkpoint.prefill;
    }
}
