//! Output formatters turning accepted tokens into wire fragments.
//!
//! Every variant is a pure function of a [`FormatContext`]. The document
//! variant ([`OutputFormatter::Json`]) emits pieces of one JSON document that
//! only parse once concatenated; the record variants ([`OutputFormatter::JsonLines`]
//! and [`OutputFormatter::Sse`]) emit self-contained records per token.

use clap::ValueEnum;
use serde::{Deserialize, Deserializer, Serialize, Serializer, de};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::details::Details;
use crate::request::RequestError;
use crate::token::{FinishReason, Token, TokenEntry};

/// Error type returned by custom formatters.
pub type FormatError = Box<dyn std::error::Error + Send + Sync>;

/// Per-request switches fixed when the request is built.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FormatOptions {
    pub return_full_text: bool,
    pub details_enabled: bool,
    pub strict_compat_mode: bool,
}

/// Everything a formatter may look at for one accepted token.
#[derive(Debug)]
pub struct FormatContext<'a> {
    pub token: &'a Token,
    pub first: bool,
    pub last: bool,
    pub details: &'a Details,
    /// Text of every accepted token so far, this one included.
    pub generated_text: &'a str,
    pub request_id: u64,
    pub options: FormatOptions,
}

type CustomFn = dyn for<'a> Fn(&FormatContext<'a>) -> Result<String, FormatError> + Send + Sync;

/// Caller supplied formatter. Its output is appended to the buffer verbatim.
#[derive(Clone)]
pub struct CustomFormatter(Arc<CustomFn>);

impl CustomFormatter {
    pub fn new<F>(f: F) -> Self
    where
        F: for<'a> Fn(&FormatContext<'a>) -> Result<String, FormatError> + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }
}

impl fmt::Debug for CustomFormatter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CustomFormatter")
    }
}

/// Name of a built-in formatter as it appears in parameters and config.
///
/// The `#[value(name)]` attributes are the only spelling of each name;
/// parsing and serde both go through them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum FormatterKind {
    #[value(name = "json")]
    Json,
    #[value(name = "jsonlines")]
    JsonLines,
    #[value(name = "sse")]
    Sse,
    #[value(name = "none")]
    Raw,
}

impl FromStr for FormatterKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        <Self as ValueEnum>::from_str(s, false).map_err(|_| s.to_string())
    }
}

impl fmt::Display for FormatterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_possible_value() {
            Some(value) => f.write_str(value.get_name()),
            None => Err(fmt::Error),
        }
    }
}

impl Serialize for FormatterKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for FormatterKind {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        name.parse()
            .map_err(|name| de::Error::custom(format!("unknown output formatter {name:?}")))
    }
}

/// Resolved output strategy of a request.
#[derive(Debug, Clone)]
pub enum OutputFormatter {
    Json,
    JsonLines,
    Sse,
    Raw,
    Custom(CustomFormatter),
}

impl From<FormatterKind> for OutputFormatter {
    fn from(kind: FormatterKind) -> Self {
        match kind {
            FormatterKind::Json => OutputFormatter::Json,
            FormatterKind::JsonLines => OutputFormatter::JsonLines,
            FormatterKind::Sse => OutputFormatter::Sse,
            FormatterKind::Raw => OutputFormatter::Raw,
        }
    }
}

impl From<CustomFormatter> for OutputFormatter {
    fn from(custom: CustomFormatter) -> Self {
        OutputFormatter::Custom(custom)
    }
}

impl OutputFormatter {
    /// Content type the transport should announce, if the format has one.
    pub fn content_type(&self) -> Option<&'static str> {
        match self {
            OutputFormatter::Json => Some("application/json"),
            OutputFormatter::JsonLines => Some("application/jsonlines"),
            OutputFormatter::Sse => Some("text/event-stream"),
            OutputFormatter::Raw | OutputFormatter::Custom(_) => None,
        }
    }

    pub fn format(&self, ctx: &FormatContext<'_>) -> Result<String, RequestError> {
        match self {
            OutputFormatter::Json => Ok(document_fragment(ctx)?),
            OutputFormatter::JsonLines => {
                let mut line = record(ctx)?;
                line.push('\n');
                Ok(line)
            }
            OutputFormatter::Sse => Ok(format!("data: {}\n\n", record(ctx)?)),
            OutputFormatter::Raw => Ok(raw_fragment(ctx)),
            OutputFormatter::Custom(custom) => (custom.0)(ctx).map_err(RequestError::Formatter),
        }
    }
}

/// Append `text` JSON-escaped, without the surrounding quotes.
fn push_escaped(out: &mut String, text: &str) -> Result<(), serde_json::Error> {
    let quoted = serde_json::to_string(text)?;
    out.push_str(&quoted[1..quoted.len() - 1]);
    Ok(())
}

#[derive(Serialize)]
struct DocumentDetails<'a> {
    inputs: &'a str,
    finish_reason: Option<&'a FinishReason>,
    generated_tokens: usize,
    tokens: &'a [TokenEntry],
    #[serde(skip_serializing_if = "Option::is_none")]
    prefill: Option<&'a [TokenEntry]>,
}

fn document_fragment(ctx: &FormatContext<'_>) -> Result<String, serde_json::Error> {
    let opts = ctx.options;
    let mut out = String::new();
    if ctx.first {
        if opts.strict_compat_mode {
            out.push('[');
        }
        out.push_str("{\"generated_text\": \"");
        if opts.return_full_text {
            push_escaped(&mut out, &ctx.details.inputs)?;
        }
    }
    push_escaped(&mut out, &ctx.token.text)?;
    if ctx.last {
        out.push('"');
        if opts.details_enabled {
            let details = DocumentDetails {
                inputs: &ctx.details.inputs,
                finish_reason: ctx.details.finish_reason.as_ref(),
                generated_tokens: ctx.details.generated_tokens,
                tokens: &ctx.details.tokens,
                prefill: ctx.details.prefill.as_deref(),
            };
            out.push_str(", \"details\": ");
            out.push_str(&serde_json::to_string(&details)?);
        }
        out.push('}');
        if opts.strict_compat_mode {
            out.push(']');
        }
    }
    Ok(out)
}

#[derive(Serialize)]
struct RecordDetails<'a> {
    finish_reason: Option<&'a FinishReason>,
    generated_tokens: usize,
    inputs: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    prefill: Option<&'a [TokenEntry]>,
}

#[derive(Serialize)]
struct Record<'a> {
    token: TokenEntry,
    #[serde(skip_serializing_if = "Option::is_none")]
    generated_text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<RecordDetails<'a>>,
}

/// One self-contained JSON object for the token, without framing.
fn record(ctx: &FormatContext<'_>) -> Result<String, serde_json::Error> {
    let opts = ctx.options;
    let mut rec = Record {
        token: ctx.token.as_entry(),
        generated_text: None,
        details: None,
    };
    if ctx.last {
        rec.generated_text = Some(if opts.return_full_text {
            format!("{}{}", ctx.details.inputs, ctx.generated_text)
        } else {
            ctx.generated_text.to_string()
        });
        if opts.details_enabled {
            rec.details = Some(RecordDetails {
                finish_reason: ctx.details.finish_reason.as_ref(),
                generated_tokens: ctx.details.generated_tokens,
                inputs: &ctx.details.inputs,
                prefill: ctx.details.prefill.as_deref(),
            });
        }
    }
    serde_json::to_string(&rec)
}

fn raw_fragment(ctx: &FormatContext<'_>) -> String {
    if ctx.first && ctx.options.return_full_text {
        format!("{}{}", ctx.details.inputs, ctx.token.text)
    } else {
        ctx.token.text.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Value, json};

    fn details(inputs: &str) -> Details {
        Details {
            inputs: inputs.into(),
            ..Details::default()
        }
    }

    fn ctx<'a>(
        token: &'a Token,
        details: &'a Details,
        generated: &'a str,
        first: bool,
        last: bool,
        options: FormatOptions,
    ) -> FormatContext<'a> {
        FormatContext {
            token,
            first,
            last,
            details,
            generated_text: generated,
            request_id: 7,
            options,
        }
    }

    #[test]
    fn document_escapes_token_text() {
        let tok = Token::new(1, "say \"hi\"\n", None);
        let d = details("p");
        let out = OutputFormatter::Json
            .format(&ctx(&tok, &d, "", true, true, FormatOptions::default()))
            .unwrap();
        let parsed: Value = serde_json::from_str(&out).unwrap();
        assert_eq!(parsed, json!({"generated_text": "say \"hi\"\n"}));
    }

    #[test]
    fn document_first_and_last_in_one_call() {
        let tok = Token::new(1, "x", None);
        let d = details("p");
        let opts = FormatOptions {
            strict_compat_mode: true,
            return_full_text: true,
            ..FormatOptions::default()
        };
        let out = OutputFormatter::Json
            .format(&ctx(&tok, &d, "x", true, true, opts))
            .unwrap();
        assert_eq!(out, "[{\"generated_text\": \"px\"}]");
    }

    #[test]
    fn document_middle_token_is_bare_text() {
        let tok = Token::new(1, "llo", None);
        let d = details("p");
        let out = OutputFormatter::Json
            .format(&ctx(&tok, &d, "Hello", false, false, FormatOptions::default()))
            .unwrap();
        assert_eq!(out, "llo");
    }

    #[test]
    fn sse_frames_records() {
        let tok = Token::new(5, "hi", Some(-1.0));
        let d = details("p");
        let out = OutputFormatter::Sse
            .format(&ctx(&tok, &d, "hi", true, true, FormatOptions::default()))
            .unwrap();
        assert!(out.starts_with("data: "));
        assert!(out.ends_with("\n\n"));
        let body: Value = serde_json::from_str(out.trim_start_matches("data: ").trim()).unwrap();
        assert_eq!(
            body,
            json!({"token": {"id": [5], "text": "hi", "log_prob": -1.0}, "generated_text": "hi"})
        );
    }

    #[test]
    fn raw_prefixes_prompt_once() {
        let d = details("Q: ");
        let opts = FormatOptions {
            return_full_text: true,
            ..FormatOptions::default()
        };
        let first = Token::new(1, "A", None);
        let second = Token::new(2, "B", None);
        let a = OutputFormatter::Raw
            .format(&ctx(&first, &d, "A", true, false, opts))
            .unwrap();
        let b = OutputFormatter::Raw
            .format(&ctx(&second, &d, "AB", false, true, opts))
            .unwrap();
        assert_eq!(a + &b, "Q: AB");
    }

    #[test]
    fn custom_errors_propagate() {
        let custom = OutputFormatter::Custom(CustomFormatter::new(|_| Err("boom".into())));
        let tok = Token::new(1, "x", None);
        let d = details("p");
        let err = custom
            .format(&ctx(&tok, &d, "x", true, false, FormatOptions::default()))
            .unwrap_err();
        assert!(matches!(err, RequestError::Formatter(_)));
        assert!(err.to_string().contains("boom"));
    }

    #[test]
    fn kinds_parse_from_names() {
        assert_eq!("jsonlines".parse::<FormatterKind>(), Ok(FormatterKind::JsonLines));
        assert_eq!("none".parse::<FormatterKind>(), Ok(FormatterKind::Raw));
        assert!("xml".parse::<FormatterKind>().is_err());
        for kind in FormatterKind::value_variants() {
            let name = kind.to_string();
            assert_eq!(name.parse::<FormatterKind>(), Ok(*kind));
            assert_eq!(serde_json::to_value(kind).unwrap(), Value::String(name.clone()));
            assert_eq!(serde_json::from_value::<FormatterKind>(Value::String(name)).unwrap(), *kind);
        }
        assert_eq!(OutputFormatter::from(FormatterKind::Sse).content_type(), Some("text/event-stream"));
        assert_eq!(OutputFormatter::Raw.content_type(), None);
    }
}
