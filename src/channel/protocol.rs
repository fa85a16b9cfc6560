//! Wire format between the client and the remote executor.
//!
//! Outbound: `{ tool, target, parameters }`.
//! Inbound: `{ tool, target, parameters, output?, error?, endTime? }` where a
//! present `error` marks failure, `endTime` marks completion and `output`
//! alone marks a fragment.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

use crate::session::{Command, DiagnosticKind, Parameters};

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("malformed inbound message: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Serialize)]
struct OutboundFrame<'a> {
    tool: DiagnosticKind,
    target: &'a str,
    parameters: &'a Parameters,
}

/// Serialize a command for the executor.
pub fn encode(command: &Command) -> Result<String, serde_json::Error> {
    serde_json::to_string(&OutboundFrame {
        tool: command.kind(),
        target: command.target(),
        parameters: command.parameters(),
    })
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InboundFrame {
    tool: DiagnosticKind,
    #[serde(default)]
    target: String,
    #[serde(default, deserialize_with = "lenient_parameters")]
    parameters: Parameters,
    #[serde(default)]
    output: Option<String>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    end_time: Option<EndTime>,
}

/// Executors report the end either as epoch milliseconds or as an RFC 3339 string.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum EndTime {
    Millis(f64),
    Text(String),
}

impl EndTime {
    fn to_datetime(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Millis(ms) => DateTime::<Utc>::from_timestamp_millis(*ms as i64),
            Self::Text(s) => DateTime::parse_from_rfc3339(s)
                .ok()
                .map(|dt| dt.with_timezone(&Utc)),
        }
    }
}

/// Parameter values may arrive as numbers; keep them as strings.
fn lenient_parameters<'de, D>(deserializer: D) -> Result<Parameters, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<BTreeMap<String, serde_json::Value>> = Option::deserialize(deserializer)?;
    Ok(raw
        .unwrap_or_default()
        .into_iter()
        .map(|(k, v)| {
            let value = match v {
                serde_json::Value::String(s) => s,
                other => other.to_string(),
            };
            (k, value)
        })
        .collect())
}

/// A decoded executor event.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    Fragment {
        kind: DiagnosticKind,
        target: String,
        parameters: Parameters,
        text: String,
    },
    Error {
        kind: DiagnosticKind,
        message: String,
    },
    Completion {
        kind: DiagnosticKind,
        target: String,
        parameters: Parameters,
        ended_at: Option<DateTime<Utc>>,
    },
}

impl InboundMessage {
    pub fn kind(&self) -> DiagnosticKind {
        match self {
            Self::Fragment { kind, .. } | Self::Error { kind, .. } | Self::Completion { kind, .. } => *kind,
        }
    }
}

/// Decode one inbound frame. `Ok(None)` is a well-formed frame carrying
/// neither output, error nor end time.
pub fn decode(text: &str) -> Result<Option<InboundMessage>, ProtocolError> {
    let frame: InboundFrame = serde_json::from_str(text)?;
    let kind = frame.tool;

    if let Some(message) = frame.error.filter(|e| !e.is_empty()) {
        return Ok(Some(InboundMessage::Error { kind, message }));
    }
    if let Some(end_time) = frame.end_time {
        return Ok(Some(InboundMessage::Completion {
            kind,
            target: frame.target,
            parameters: frame.parameters,
            ended_at: end_time.to_datetime(),
        }));
    }
    match frame.output.filter(|o| !o.is_empty()) {
        Some(text) => Ok(Some(InboundMessage::Fragment {
            kind,
            target: frame.target,
            parameters: frame.parameters,
            text,
        })),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_command() {
        let command = Command::new(
            DiagnosticKind::Traceroute,
            "example.com".to_string(),
            DiagnosticKind::Traceroute.default_parameters(),
        );
        let value: serde_json::Value = serde_json::from_str(&encode(&command).unwrap()).unwrap();
        assert_eq!(
            value,
            serde_json::json!({
                "tool": "traceroute",
                "target": "example.com",
                "parameters": { "maxHops": "30" }
            })
        );
    }

    #[test]
    fn test_decode_fragment() {
        let msg = decode(r#"{"tool":"ping","target":"8.8.8.8","parameters":{"count":4},"output":"64 bytes from 8.8.8.8"}"#)
            .unwrap()
            .unwrap();
        let InboundMessage::Fragment { kind, parameters, text, .. } = msg else {
            panic!("expected fragment");
        };
        assert_eq!(kind, DiagnosticKind::Ping);
        assert_eq!(parameters["count"], "4");
        assert_eq!(text, "64 bytes from 8.8.8.8");
    }

    #[test]
    fn test_error_wins_over_end_time() {
        let msg = decode(r#"{"tool":"dig","target":"x.com","error":"exit status 9","endTime":1700000000000}"#)
            .unwrap()
            .unwrap();
        assert_eq!(
            msg,
            InboundMessage::Error {
                kind: DiagnosticKind::Dig,
                message: "exit status 9".to_string()
            }
        );
    }

    #[test]
    fn test_decode_completion_formats() {
        let numeric = decode(r#"{"tool":"ping","target":"a","parameters":{},"output":"","endTime":1700000000000}"#)
            .unwrap()
            .unwrap();
        let InboundMessage::Completion { ended_at, .. } = numeric else {
            panic!("expected completion");
        };
        assert_eq!(ended_at.unwrap().timestamp(), 1_700_000_000);

        let text = decode(r#"{"tool":"traceroute","target":"a","endTime":"2024-05-01T10:00:00Z"}"#)
            .unwrap()
            .unwrap();
        assert!(matches!(text, InboundMessage::Completion { ended_at: Some(_), .. }));
    }

    #[test]
    fn test_empty_event_is_ignored() {
        assert_eq!(decode(r#"{"tool":"ping","target":"a","parameters":{}}"#).unwrap(), None);
        assert_eq!(decode(r#"{"tool":"ping","output":"","error":""}"#).unwrap(), None);
    }

    #[test]
    fn test_malformed_frames() {
        assert!(decode("not json").is_err());
        assert!(decode(r#"{"target":"a","output":"x"}"#).is_err());
        assert!(decode(r#"{"tool":"nmap","output":"x"}"#).is_err());
    }
}
