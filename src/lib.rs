//! Per-request response encoding for a rolling-batch inference server.
//!
//! Each [`Request`] turns the tokens it accepts into output fragments using an
//! [`OutputFormatter`], buffering them until the transport takes them. A
//! [`RollingBatch`] hosts many requests over a [`TokenSource`], and
//! [`stream_batch`] drives one against a bounded channel.

pub mod batch;
pub mod config;
pub mod details;
pub mod fake;
pub mod formatter;
pub mod request;
pub mod stream;
pub mod token;

pub use batch::{
    BatchError, Generation, GenerationInput, RequestFailure, RollingBatch, StepOutput, TokenSource,
};
pub use config::{ConfigError, RollingConfig};
pub use details::{Details, Parameters};
pub use fake::FakeTokenSource;
pub use formatter::{
    CustomFormatter, FormatContext, FormatError, FormatOptions, FormatterKind, OutputFormatter,
};
pub use request::{Request, RequestBuilder, RequestError};
pub use stream::stream_batch;
pub use token::{FinishReason, Token, TokenEntry};
