//! Rolling batch hosting many in-flight [`Request`]s.
//!
//! The serving loop calls [`RollingBatch::step`] once per iteration; every
//! unfinished request receives one token from the [`TokenSource`] and its
//! formatted output accumulates until taken.

use anyhow::Result;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::config::{self, RollingConfig};
use crate::details::{Parameters, flag};
use crate::formatter::OutputFormatter;
use crate::request::{Request, RequestError};
use crate::token::{FinishReason, Token, TokenEntry};

/// One step of model output for a request.
#[derive(Debug, Clone, PartialEq)]
pub struct Generation {
    pub token: Token,
    /// Set when the model decided the request is done.
    pub finish_reason: Option<FinishReason>,
}

impl Generation {
    pub fn next(token: Token) -> Self {
        Self {
            token,
            finish_reason: None,
        }
    }

    pub fn finished(token: Token, reason: FinishReason) -> Self {
        Self {
            token,
            finish_reason: Some(reason),
        }
    }
}

/// The model behind a batch.
pub trait TokenSource {
    /// Produce the next token for `request`.
    fn next_token(&mut self, request: &Request) -> Result<Generation>;

    /// Per-token details of the prompt, attached to the terminal output when
    /// the request asks for `decoder_input_details`.
    fn prompt_tokens_details(&mut self, _request: &Request) -> Result<Vec<TokenEntry>> {
        Ok(Vec::new())
    }
}

impl<S: TokenSource + ?Sized> TokenSource for Box<S> {
    fn next_token(&mut self, request: &Request) -> Result<Generation> {
        (**self).next_token(request)
    }

    fn prompt_tokens_details(&mut self, request: &Request) -> Result<Vec<TokenEntry>> {
        (**self).prompt_tokens_details(request)
    }
}

/// A request as submitted to the batch.
#[derive(Debug, Clone)]
pub struct GenerationInput {
    pub id: u64,
    pub inputs: String,
    pub parameters: Parameters,
    pub input_ids: Option<Vec<u32>>,
    pub formatter: Option<OutputFormatter>,
}

impl GenerationInput {
    pub fn new(id: u64, inputs: impl Into<String>) -> Self {
        Self {
            id,
            inputs: inputs.into(),
            parameters: Parameters::new(),
            input_ids: None,
            formatter: None,
        }
    }

    pub fn parameters(mut self, parameters: Parameters) -> Self {
        self.parameters = parameters;
        self
    }

    /// Set one parameter, keeping the others.
    pub fn param(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.parameters.insert(key.to_string(), value.into());
        self
    }

    pub fn input_ids(mut self, ids: Vec<u32>) -> Self {
        self.input_ids = Some(ids);
        self
    }

    pub fn formatter(mut self, formatter: impl Into<OutputFormatter>) -> Self {
        self.formatter = Some(formatter.into());
        self
    }
}

/// Output taken from one request.
#[derive(Debug, Clone, PartialEq)]
pub struct StepOutput {
    pub request_id: u64,
    pub data: String,
    /// No further output follows for this request.
    pub last: bool,
    pub content_type: Option<&'static str>,
}

#[derive(Debug, thiserror::Error)]
pub enum BatchError {
    #[error("batch is full ({capacity} requests)")]
    Full { capacity: usize },
    #[error("request {0} is already in the batch")]
    Duplicate(u64),
    #[error("request {0} is not in the batch")]
    UnknownRequest(u64),
    #[error(transparent)]
    Request(#[from] RequestError),
}

/// A request whose own output failed during a step.
///
/// The request is closed with an `error` finish reason when its formatter
/// still accepts a terminal token; otherwise it is dropped from the batch.
#[derive(Debug)]
pub struct RequestFailure {
    pub request_id: u64,
    pub error: RequestError,
}

pub struct RollingBatch<S> {
    source: S,
    config: RollingConfig,
    requests: Vec<Request>,
}

impl<S: TokenSource> RollingBatch<S> {
    pub fn new(source: S, config: RollingConfig) -> Self {
        info!(
            max_rolling_batch_size = config.max_rolling_batch_size,
            max_new_tokens = config.max_new_tokens,
            "rolling batch created"
        );
        Self {
            source,
            config,
            requests: Vec::new(),
        }
    }

    pub fn config(&self) -> &RollingConfig {
        &self.config
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    pub fn request_ids(&self) -> Vec<u64> {
        self.requests.iter().map(Request::id).collect()
    }

    pub fn get(&self, id: u64) -> Option<&Request> {
        self.requests.iter().find(|r| r.id() == id)
    }

    /// Create a request for `input` and add it to the batch.
    pub fn admit(&mut self, input: GenerationInput) -> Result<(), BatchError> {
        let capacity = self.config.max_rolling_batch_size;
        if self.requests.len() >= capacity {
            warn!(request_id = input.id, capacity, "batch full; request refused");
            return Err(BatchError::Full { capacity });
        }
        if self.get(input.id).is_some() {
            return Err(BatchError::Duplicate(input.id));
        }

        let details = flag(&input.parameters, "details");
        let mut builder = Request::builder(input.id, input.inputs)
            .parameters(input.parameters)
            .details(details)
            .strict_compat_mode(self.config.strict_compat_mode || config::strict_compat_mode());
        if let Some(kind) = self.config.output_formatter {
            builder = builder.default_formatter(kind);
        }
        if let Some(ids) = input.input_ids {
            builder = builder.input_ids(ids);
        }
        if let Some(formatter) = input.formatter {
            builder = builder.formatter(formatter);
        }
        let request = builder.build()?;
        info!(
            request_id = request.id(),
            content_type = ?request.content_type(),
            details,
            "request admitted"
        );
        self.requests.push(request);
        Ok(())
    }

    /// Advance every unfinished request by one token.
    ///
    /// A failing source finishes every unfinished request with an `error`
    /// finish reason; the failure is logged, not returned. A request whose
    /// formatter fails is settled on its own and reported in the returned
    /// list; the other requests still advance.
    pub fn step(&mut self) -> Vec<RequestFailure> {
        let mut failures = Vec::new();
        if let Err(err) = self.advance(&mut failures) {
            error!(error = ?err, "token source failed; finishing active requests");
            for req in self.requests.iter_mut().filter(|r| !r.is_last_token()) {
                if failures.iter().any(|f| f.request_id == req.id()) {
                    continue;
                }
                if let Err(error) =
                    req.set_next_token(Token::empty(), true, Some(FinishReason::Error), None)
                {
                    failures.push(RequestFailure {
                        request_id: req.id(),
                        error,
                    });
                }
            }
        }
        for failure in &failures {
            self.settle(failure);
        }
        failures
    }

    fn advance(&mut self, failures: &mut Vec<RequestFailure>) -> Result<()> {
        let default_limit = self.config.max_new_tokens;
        for req in self.requests.iter_mut().filter(|r| !r.is_last_token()) {
            let generation = self.source.next_token(req)?;
            let limit = max_new_tokens(req.parameters()).unwrap_or(default_limit);
            let finish_reason = match generation.finish_reason {
                Some(reason) => Some(reason),
                None if req.generated_tokens() + 1 >= limit => Some(FinishReason::Length),
                None => None,
            };
            let last = finish_reason.is_some();
            let prefill = if last && flag(req.parameters(), "decoder_input_details") {
                Some(self.source.prompt_tokens_details(req)?)
            } else {
                None
            };
            if let Err(error) = req.set_next_token(generation.token, last, finish_reason, prefill) {
                failures.push(RequestFailure {
                    request_id: req.id(),
                    error,
                });
            }
        }
        Ok(())
    }

    /// Close a failed request with an `error` token, or drop it when even
    /// that cannot be formatted.
    fn settle(&mut self, failure: &RequestFailure) {
        let id = failure.request_id;
        let Some(pos) = self.requests.iter().position(|r| r.id() == id) else {
            return;
        };
        warn!(request_id = id, error = %failure.error, "request output failed");
        let req = &mut self.requests[pos];
        if req.is_last_token() {
            return;
        }
        if req
            .set_next_token(Token::empty(), true, Some(FinishReason::Error), None)
            .is_err()
        {
            warn!(request_id = id, "request output cannot be closed; dropping request");
            self.requests.remove(pos);
        }
    }

    /// Move out the pending output of `id`. A finished request leaves the
    /// batch once its terminal output is taken.
    pub fn take_output(&mut self, id: u64) -> Result<Option<StepOutput>, BatchError> {
        let pos = self
            .requests
            .iter()
            .position(|r| r.id() == id)
            .ok_or(BatchError::UnknownRequest(id))?;
        let req = &mut self.requests[pos];
        if !req.has_pending_output() {
            return Ok(None);
        }
        let output = StepOutput {
            request_id: id,
            data: req.take_next_token(),
            last: req.is_last_token(),
            content_type: req.content_type(),
        };
        if output.last {
            debug!(request_id = id, "request retired");
            self.requests.remove(pos);
        }
        Ok(Some(output))
    }

    /// Take the pending output of every request.
    pub fn drain(&mut self) -> Vec<StepOutput> {
        let mut outputs = Vec::new();
        for id in self.request_ids() {
            if let Ok(Some(output)) = self.take_output(id) {
                outputs.push(output);
            }
        }
        outputs
    }

    /// One serving iteration: admit `inputs`, step, and drain.
    pub fn inference(&mut self, inputs: Vec<GenerationInput>) -> Result<Vec<StepOutput>, BatchError> {
        for input in inputs {
            self.admit(input)?;
        }
        self.step();
        Ok(self.drain())
    }

    /// Finish `id` with a `cancelled` reason. A request whose formatter
    /// rejects the cancellation is dropped so it receives no further tokens.
    pub fn cancel(&mut self, id: u64) -> Result<(), BatchError> {
        let pos = self
            .requests
            .iter()
            .position(|r| r.id() == id)
            .ok_or(BatchError::UnknownRequest(id))?;
        if let Err(err) = self.requests[pos].cancel() {
            if !self.requests[pos].is_last_token() {
                warn!(request_id = id, error = %err, "cancellation failed; dropping request");
                self.requests.remove(pos);
            }
            return Err(err.into());
        }
        Ok(())
    }

    /// Drop every in-flight request.
    pub fn reset(&mut self) {
        if !self.requests.is_empty() {
            info!(dropped = self.requests.len(), "rolling batch reset");
        }
        self.requests.clear();
    }
}

fn max_new_tokens(parameters: &Parameters) -> Option<usize> {
    parameters
        .get("max_new_tokens")
        .and_then(Value::as_u64)
        .map(|n| n as usize)
}
