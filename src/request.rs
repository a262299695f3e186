//! One client generation job and its output buffer.
//!
//! The scheduler drives a [`Request`] with three calls:
//!
//! 1. [`Request::set_next_token`] formats the accepted token and appends the
//!    fragment to the buffer;
//! 2. [`Request::get_next_token`] reads the buffer for transmission;
//! 3. [`Request::reset_next_token`] clears it once transmitted.
//!
//! Skipping the reset is legal: the next fragment is appended to the pending
//! one, so a slow consumer receives several steps in a single write.

use serde_json::Value;
use tracing::{debug, info, trace, warn};

use crate::config;
use crate::details::{Details, DetailsTracker, Parameters, flag};
use crate::formatter::{FormatContext, FormatError, FormatOptions, FormatterKind, OutputFormatter};
use crate::token::{FinishReason, Token, TokenEntry};

#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    #[error("request {request_id}: prompt token details are only accepted with the terminal token")]
    PrefillOnNonTerminal { request_id: u64 },
    #[error("request {request_id} already finished")]
    AlreadyFinished { request_id: u64 },
    #[error("unknown output formatter {0}")]
    UnknownFormatter(String),
    #[error("output formatter failed: {0}")]
    Formatter(#[source] FormatError),
    #[error("failed to encode output: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Builder for [`Request`]. The formatter and the compatibility switch are
/// resolved in [`RequestBuilder::build`] and never change afterwards.
#[derive(Debug)]
pub struct RequestBuilder {
    id: u64,
    input_text: String,
    parameters: Parameters,
    details: bool,
    input_ids: Option<Vec<u32>>,
    formatter: Option<OutputFormatter>,
    default_formatter: Option<FormatterKind>,
    strict_compat_mode: Option<bool>,
}

impl RequestBuilder {
    pub fn parameters(mut self, parameters: Parameters) -> Self {
        self.parameters = parameters;
        self
    }

    /// Retain per-token history and expose it in the output.
    pub fn details(mut self, enabled: bool) -> Self {
        self.details = enabled;
        self
    }

    pub fn input_ids(mut self, ids: Vec<u32>) -> Self {
        self.input_ids = Some(ids);
        self
    }

    /// Use `formatter` regardless of what the parameters ask for.
    pub fn formatter(mut self, formatter: impl Into<OutputFormatter>) -> Self {
        self.formatter = Some(formatter.into());
        self
    }

    /// Fallback when the parameters name neither a formatter nor `stream`.
    pub fn default_formatter(mut self, kind: FormatterKind) -> Self {
        self.default_formatter = Some(kind);
        self
    }

    /// Pin the compatibility switch instead of reading the process-wide one.
    pub fn strict_compat_mode(mut self, on: bool) -> Self {
        self.strict_compat_mode = Some(on);
        self
    }

    pub fn build(self) -> Result<Request, RequestError> {
        let formatter = resolve_formatter(self.formatter, &self.parameters, self.default_formatter)?;
        let options = FormatOptions {
            return_full_text: flag(&self.parameters, "return_full_text"),
            details_enabled: self.details,
            strict_compat_mode: self
                .strict_compat_mode
                .unwrap_or_else(config::strict_compat_mode),
        };
        let prompt_tokens = self.input_ids.as_ref().map(Vec::len);
        let tracker = DetailsTracker::new(
            self.input_text.clone(),
            self.parameters,
            prompt_tokens,
            self.details,
        );
        Ok(Request {
            id: self.id,
            input_text: self.input_text,
            input_ids: self.input_ids,
            formatter,
            options,
            tracker,
            generated_text: String::new(),
            buffer: String::new(),
            finished: false,
            cancelled: false,
        })
    }
}

/// Selection order: explicit formatter, `output_formatter` parameter,
/// `stream` parameter, configured default, document output.
fn resolve_formatter(
    explicit: Option<OutputFormatter>,
    parameters: &Parameters,
    default: Option<FormatterKind>,
) -> Result<OutputFormatter, RequestError> {
    if let Some(formatter) = explicit {
        return Ok(formatter);
    }
    if let Some(named) = parameters.get("output_formatter") {
        let kind = match named {
            Value::String(name) => name
                .parse::<FormatterKind>()
                .map_err(RequestError::UnknownFormatter)?,
            other => return Err(RequestError::UnknownFormatter(other.to_string())),
        };
        return Ok(kind.into());
    }
    let formatter = match parameters.get("stream").and_then(Value::as_bool) {
        Some(true) => OutputFormatter::JsonLines,
        Some(false) => OutputFormatter::Json,
        None => default.map_or(OutputFormatter::Json, OutputFormatter::from),
    };
    Ok(formatter)
}

#[derive(Debug)]
pub struct Request {
    id: u64,
    input_text: String,
    input_ids: Option<Vec<u32>>,
    formatter: OutputFormatter,
    options: FormatOptions,
    tracker: DetailsTracker,
    generated_text: String,
    buffer: String,
    finished: bool,
    cancelled: bool,
}

impl Request {
    pub fn builder(id: u64, input_text: impl Into<String>) -> RequestBuilder {
        RequestBuilder {
            id,
            input_text: input_text.into(),
            parameters: Parameters::new(),
            details: false,
            input_ids: None,
            formatter: None,
            default_formatter: None,
            strict_compat_mode: None,
        }
    }

    /// Shorthand for a request without input ids or an explicit formatter.
    pub fn new(
        id: u64,
        input_text: impl Into<String>,
        parameters: Parameters,
        details: bool,
    ) -> Result<Self, RequestError> {
        Self::builder(id, input_text)
            .parameters(parameters)
            .details(details)
            .build()
    }

    /// Accept one generated token and append its formatted output.
    ///
    /// `prompt_tokens_details` is only valid together with `last`. On error
    /// the buffer and the details are left as they were.
    pub fn set_next_token(
        &mut self,
        mut token: Token,
        last: bool,
        finish_reason: Option<FinishReason>,
        prompt_tokens_details: Option<Vec<TokenEntry>>,
    ) -> Result<(), RequestError> {
        if self.finished {
            warn!(request_id = self.id, "token offered to a finished request");
            return Err(RequestError::AlreadyFinished { request_id: self.id });
        }
        if !last && prompt_tokens_details.is_some() {
            warn!(request_id = self.id, "prompt token details on a non-terminal token");
            return Err(RequestError::PrefillOnNonTerminal { request_id: self.id });
        }

        token.request_id = Some(self.id);
        let first = self.tracker.details().generated_tokens == 0;
        let checkpoint = self.tracker.checkpoint();
        let text_len = self.generated_text.len();

        self.tracker.accept(&token);
        self.generated_text.push_str(&token.text);
        if last {
            self.tracker.finish(finish_reason, prompt_tokens_details);
        }

        let ctx = FormatContext {
            token: &token,
            first,
            last,
            details: self.tracker.details(),
            generated_text: &self.generated_text,
            request_id: self.id,
            options: self.options,
        };
        let fragment = match self.formatter.format(&ctx) {
            Ok(fragment) => fragment,
            Err(err) => {
                self.tracker.restore(checkpoint);
                self.generated_text.truncate(text_len);
                return Err(err);
            }
        };

        if !self.buffer.is_empty() {
            debug!(
                request_id = self.id,
                pending = self.buffer.len(),
                "coalescing with untransmitted output"
            );
        }
        self.buffer.push_str(&fragment);
        trace!(request_id = self.id, text = %token.text, "token accepted");

        if last {
            self.finished = true;
            debug!(
                request_id = self.id,
                generated_tokens = self.tracker.details().generated_tokens,
                finish_reason = ?self.tracker.details().finish_reason,
                "request finished"
            );
        }
        Ok(())
    }

    /// Output produced since the last reset. Does not consume it.
    pub fn get_next_token(&self) -> &str {
        &self.buffer
    }

    pub fn reset_next_token(&mut self) {
        self.buffer.clear();
    }

    /// Move the pending output out, leaving the buffer empty.
    pub fn take_next_token(&mut self) -> String {
        std::mem::take(&mut self.buffer)
    }

    pub fn has_pending_output(&self) -> bool {
        !self.buffer.is_empty()
    }

    /// Finish the request early with a `cancelled` finish reason, closing
    /// whatever structure the formatter has opened. If the terminal fragment
    /// cannot be formatted the request is left neither cancelled nor finished.
    pub fn cancel(&mut self) -> Result<(), RequestError> {
        if self.finished {
            return Err(RequestError::AlreadyFinished { request_id: self.id });
        }
        self.set_next_token(Token::empty(), true, Some(FinishReason::Cancelled), None)?;
        self.cancelled = true;
        info!(request_id = self.id, "request cancelled");
        Ok(())
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn input_text(&self) -> &str {
        &self.input_text
    }

    pub fn input_ids(&self) -> Option<&[u32]> {
        self.input_ids.as_deref()
    }

    pub fn parameters(&self) -> &Parameters {
        &self.tracker.details().parameters
    }

    pub fn details(&self) -> &Details {
        self.tracker.details()
    }

    pub fn details_enabled(&self) -> bool {
        self.tracker.enabled()
    }

    pub fn formatter(&self) -> &OutputFormatter {
        &self.formatter
    }

    pub fn content_type(&self) -> Option<&'static str> {
        self.formatter.content_type()
    }

    pub fn strict_compat_mode(&self) -> bool {
        self.options.strict_compat_mode
    }

    pub fn is_last_token(&self) -> bool {
        self.finished
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }

    pub fn finish_reason(&self) -> Option<&FinishReason> {
        self.tracker.details().finish_reason.as_ref()
    }

    pub fn generated_tokens(&self) -> usize {
        self.tracker.details().generated_tokens
    }

    pub fn generated_text(&self) -> &str {
        &self.generated_text
    }
}
