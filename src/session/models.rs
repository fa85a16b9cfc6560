//! Session model types.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::stats::Stats;

/// Kind-specific command parameters, e.g. `count`, `type`, `maxHops`.
pub type Parameters = BTreeMap<String, String>;

/// The diagnostic tools the remote executor can run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiagnosticKind {
    Ping,
    Dig,
    Traceroute,
}

#[derive(Error, Debug, PartialEq)]
#[error("unknown diagnostic kind: {0}")]
pub struct UnknownKind(pub String);

impl DiagnosticKind {
    pub const ALL: [DiagnosticKind; 3] = [Self::Ping, Self::Dig, Self::Traceroute];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ping => "ping",
            Self::Dig => "dig",
            Self::Traceroute => "traceroute",
        }
    }

    /// Name of the single parameter each tool takes.
    pub fn parameter_name(&self) -> &'static str {
        match self {
            Self::Ping => "count",
            Self::Dig => "type",
            Self::Traceroute => "maxHops",
        }
    }

    pub fn default_parameters(&self) -> Parameters {
        let value = match self {
            Self::Ping => "4",
            Self::Dig => "A",
            Self::Traceroute => "30",
        };
        let mut params = Parameters::new();
        params.insert(self.parameter_name().to_string(), value.to_string());
        params
    }
}

impl fmt::Display for DiagnosticKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DiagnosticKind {
    type Err = UnknownKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ping" => Ok(Self::Ping),
            "dig" => Ok(Self::Dig),
            "traceroute" => Ok(Self::Traceroute),
            other => Err(UnknownKind(other.to_string())),
        }
    }
}

/// A validated command ready for dispatch.
///
/// Only the validation service constructs commands, so holding one means the
/// target and parameters passed every check.
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    kind: DiagnosticKind,
    target: String,
    parameters: Parameters,
    /// Validation ticket the command was admitted under
    ticket: u64,
}

impl Command {
    pub(crate) fn new(kind: DiagnosticKind, target: String, parameters: Parameters) -> Self {
        Self {
            kind,
            target,
            parameters,
            ticket: 0,
        }
    }

    pub(crate) fn with_ticket(mut self, ticket: u64) -> Self {
        self.ticket = ticket;
        self
    }

    pub(crate) fn ticket(&self) -> u64 {
        self.ticket
    }

    pub fn kind(&self) -> DiagnosticKind {
        self.kind
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn parameters(&self) -> &Parameters {
        &self.parameters
    }
}

/// One ping reply (or lost probe).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PingSample {
    /// 1-based position of the sample within the run
    pub sequence_implied: u32,
    pub round_trip_ms: Option<f64>,
    pub received_at: DateTime<Utc>,
}

/// One answer record from a dig query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DnsRecord {
    pub name: String,
    pub ttl_seconds: u32,
    pub record_type: String,
    pub value: String,
    pub observed_at: DateTime<Utc>,
}

/// One intermediate node of a path trace, keyed by `hop_number`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Hop {
    pub hop_number: u32,
    pub hostname: Option<String>,
    pub address: Option<String>,
    pub latency_ms: Option<f64>,
    pub is_timeout: bool,
}

/// A typed record produced by a stream parser.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ParsedRecord {
    Ping(PingSample),
    Dns(DnsRecord),
    Hop(Hop),
}

/// Per-kind state: the current (or last) run and its derived data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub target: String,
    pub parameters: Parameters,
    #[serde(default)]
    pub raw_output: Vec<String>,
    #[serde(default)]
    pub running: bool,
    #[serde(default)]
    pub records: Vec<ParsedRecord>,
    pub aggregates: Stats,
    /// Set when the tool printed its closing summary; the run still ends
    /// only on completion or error.
    #[serde(default)]
    pub output_complete: bool,
}

impl Session {
    pub fn empty(kind: DiagnosticKind) -> Self {
        Self {
            target: String::new(),
            parameters: kind.default_parameters(),
            raw_output: Vec::new(),
            running: false,
            records: Vec::new(),
            aggregates: Stats::empty(kind),
            output_complete: false,
        }
    }

    /// Recompute aggregates from the records they derive from.
    pub fn refresh_aggregates(&mut self, kind: DiagnosticKind) {
        self.aggregates = Stats::compute(kind, &self.records);
    }
}

/// A completed dig query kept for quick re-submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryHistoryEntry {
    pub target: String,
    pub record_type: String,
    pub completed_at: DateTime<Utc>,
    pub record_count: usize,
}

impl QueryHistoryEntry {
    /// Parameters to repeat this query with.
    pub fn parameters(&self) -> Parameters {
        let mut parameters = Parameters::new();
        parameters.insert(
            DiagnosticKind::Dig.parameter_name().to_string(),
            self.record_type.clone(),
        );
        parameters
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_round_trip_names() {
        for kind in DiagnosticKind::ALL {
            assert_eq!(kind.as_str().parse::<DiagnosticKind>(), Ok(kind));
        }
        assert_eq!("PING".parse::<DiagnosticKind>(), Ok(DiagnosticKind::Ping));
        assert!("nslookup".parse::<DiagnosticKind>().is_err());
    }

    #[test]
    fn test_default_parameters() {
        assert_eq!(DiagnosticKind::Ping.default_parameters()["count"], "4");
        assert_eq!(DiagnosticKind::Dig.default_parameters()["type"], "A");
        assert_eq!(DiagnosticKind::Traceroute.default_parameters()["maxHops"], "30");
    }

    #[test]
    fn test_record_serializes_with_discriminant() {
        let hop = ParsedRecord::Hop(Hop {
            hop_number: 1,
            hostname: None,
            address: None,
            latency_ms: None,
            is_timeout: true,
        });
        let json = serde_json::to_value(&hop).unwrap();
        assert_eq!(json["kind"], "hop");
        assert_eq!(json["hopNumber"], 1);
        assert_eq!(json["isTimeout"], true);
    }
}
