use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// One generation step's output.
///
/// A step may map to several vocabulary ids (merged sub-words), so ids are
/// always kept as a list even when there is only one.
#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub id: Vec<u32>,
    pub text: String,
    pub log_prob: Option<f64>,
    /// Stamped by the owning [`Request`](crate::Request) when accepted.
    pub request_id: Option<u64>,
}

impl Token {
    /// Token for a single vocabulary id.
    ///
    /// ```
    /// use rolling_output::Token;
    /// let tok = Token::new(244, "He", Some(-0.334532));
    /// assert_eq!(tok.id, vec![244]);
    /// assert!(tok.request_id.is_none());
    /// ```
    pub fn new(id: u32, text: impl Into<String>, log_prob: Option<f64>) -> Self {
        Self::with_ids(vec![id], text, log_prob)
    }

    /// Token spanning several vocabulary ids.
    pub fn with_ids(ids: Vec<u32>, text: impl Into<String>, log_prob: Option<f64>) -> Self {
        Self {
            id: ids,
            text: text.into(),
            log_prob,
            request_id: None,
        }
    }

    /// Token with no ids and no text, used for terminal calls that carry no
    /// generated output.
    pub fn empty() -> Self {
        Self::with_ids(Vec::new(), String::new(), None)
    }

    /// The `{id, text, log_prob?}` entry used in every wire format.
    pub fn as_entry(&self) -> TokenEntry {
        TokenEntry {
            id: self.id.clone(),
            text: self.text.clone(),
            log_prob: self.log_prob,
        }
    }
}

/// Serialized shape of a [`Token`]. `log_prob` is left out entirely when
/// absent, never written as `null`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenEntry {
    pub id: Vec<u32>,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_prob: Option<f64>,
}

impl From<&Token> for TokenEntry {
    fn from(token: &Token) -> Self {
        token.as_entry()
    }
}

/// Why a request stopped generating.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinishReason {
    Length,
    EosToken,
    StopSequence,
    Error,
    Cancelled,
    Other(String),
}

impl FinishReason {
    pub fn as_str(&self) -> &str {
        match self {
            FinishReason::Length => "length",
            FinishReason::EosToken => "eos_token",
            FinishReason::StopSequence => "stop_sequence",
            FinishReason::Error => "error",
            FinishReason::Cancelled => "cancelled",
            FinishReason::Other(s) => s,
        }
    }
}

impl From<&str> for FinishReason {
    fn from(s: &str) -> Self {
        match s {
            "length" => FinishReason::Length,
            "eos_token" => FinishReason::EosToken,
            "stop_sequence" => FinishReason::StopSequence,
            "error" => FinishReason::Error,
            "cancelled" => FinishReason::Cancelled,
            other => FinishReason::Other(other.to_string()),
        }
    }
}

impl fmt::Display for FinishReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for FinishReason {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for FinishReason {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(FinishReason::from(s.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn entry_omits_missing_log_prob() {
        let entry = Token::new(123, "This", None).as_entry();
        let value = serde_json::to_value(&entry).unwrap();
        assert_eq!(value, json!({"id": [123], "text": "This"}));
        assert!(value.get("log_prob").is_none());
    }

    #[test]
    fn entry_keeps_present_log_prob() {
        let entry = Token::with_ids(vec![1, 2], "ab", Some(0.5)).as_entry();
        let value = serde_json::to_value(&entry).unwrap();
        assert_eq!(value, json!({"id": [1, 2], "text": "ab", "log_prob": 0.5}));
    }

    #[test]
    fn finish_reason_uses_string_tags() {
        assert_eq!(
            serde_json::to_string(&FinishReason::EosToken).unwrap(),
            "\"eos_token\""
        );
        let custom: FinishReason = serde_json::from_str("\"timeout\"").unwrap();
        assert_eq!(custom, FinishReason::Other("timeout".into()));
        assert_eq!(FinishReason::from("length"), FinishReason::Length);
    }
}
