//! Aggregate statistics derived from parsed records.
//!
//! Stats are always recomputed from the full record sequence so the same
//! records produce bit-identical aggregates, including after a reload.

use serde::{Deserialize, Serialize};

use super::models::{DiagnosticKind, ParsedRecord};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PingStats {
    pub sent: usize,
    pub received: usize,
    pub loss_percent: f64,
    pub min_ms: Option<f64>,
    pub max_ms: Option<f64>,
    pub mean_ms: Option<f64>,
    /// Population standard deviation; undefined below two samples
    pub jitter_ms: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DigStats {
    pub record_count: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TracerouteStats {
    pub hop_count: usize,
    pub timeout_count: usize,
    pub mean_latency_ms: Option<f64>,
    pub max_latency_ms: Option<f64>,
}

/// Running aggregates for one session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Stats {
    Ping(PingStats),
    Dig(DigStats),
    Traceroute(TracerouteStats),
}

impl Stats {
    pub fn empty(kind: DiagnosticKind) -> Self {
        Self::compute(kind, &[])
    }

    pub fn compute(kind: DiagnosticKind, records: &[ParsedRecord]) -> Self {
        match kind {
            DiagnosticKind::Ping => Self::Ping(ping_stats(records)),
            DiagnosticKind::Dig => Self::Dig(DigStats {
                record_count: records
                    .iter()
                    .filter(|r| matches!(r, ParsedRecord::Dns(_)))
                    .count(),
            }),
            DiagnosticKind::Traceroute => Self::Traceroute(traceroute_stats(records)),
        }
    }
}

fn ping_stats(records: &[ParsedRecord]) -> PingStats {
    let samples: Vec<_> = records
        .iter()
        .filter_map(|r| match r {
            ParsedRecord::Ping(sample) => Some(sample),
            _ => None,
        })
        .collect();
    let times: Vec<f64> = samples.iter().filter_map(|s| s.round_trip_ms).collect();

    let sent = samples.len();
    let received = times.len();
    let loss_percent = if sent > 0 {
        (sent - received) as f64 / sent as f64 * 100.0
    } else {
        0.0
    };

    let mean = mean(&times);
    PingStats {
        sent,
        received,
        loss_percent,
        min_ms: times.iter().copied().reduce(f64::min),
        max_ms: times.iter().copied().reduce(f64::max),
        mean_ms: mean,
        jitter_ms: match mean {
            Some(mean) if times.len() >= 2 => Some(population_stddev(&times, mean)),
            _ => None,
        },
    }
}

fn traceroute_stats(records: &[ParsedRecord]) -> TracerouteStats {
    let hops: Vec<_> = records
        .iter()
        .filter_map(|r| match r {
            ParsedRecord::Hop(hop) => Some(hop),
            _ => None,
        })
        .collect();
    let latencies: Vec<f64> = hops
        .iter()
        .filter(|h| !h.is_timeout)
        .filter_map(|h| h.latency_ms)
        .collect();

    TracerouteStats {
        hop_count: hops.len(),
        timeout_count: hops.iter().filter(|h| h.is_timeout).count(),
        mean_latency_ms: mean(&latencies),
        max_latency_ms: latencies.iter().copied().reduce(f64::max),
    }
}

fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}

fn population_stddev(values: &[f64], mean: f64) -> f64 {
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64;
    variance.sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{Hop, PingSample};
    use chrono::Utc;

    fn sample(seq: u32, rtt: Option<f64>) -> ParsedRecord {
        ParsedRecord::Ping(PingSample {
            sequence_implied: seq,
            round_trip_ms: rtt,
            received_at: Utc::now(),
        })
    }

    fn hop(n: u32, latency: Option<f64>, timeout: bool) -> ParsedRecord {
        ParsedRecord::Hop(Hop {
            hop_number: n,
            hostname: None,
            address: None,
            latency_ms: latency,
            is_timeout: timeout,
        })
    }

    #[test]
    fn test_ping_mean_and_jitter() {
        let records = vec![sample(1, Some(10.0)), sample(2, Some(20.0)), sample(3, Some(30.0))];
        let Stats::Ping(stats) = Stats::compute(DiagnosticKind::Ping, &records) else {
            panic!("expected ping stats");
        };
        assert_eq!(stats.mean_ms, Some(20.0));
        assert_eq!(stats.min_ms, Some(10.0));
        assert_eq!(stats.max_ms, Some(30.0));
        let jitter = stats.jitter_ms.unwrap();
        assert!((jitter - 8.16497).abs() < 1e-4, "jitter was {}", jitter);
    }

    #[test]
    fn test_ping_jitter_undefined_below_two_samples() {
        let Stats::Ping(stats) = Stats::compute(DiagnosticKind::Ping, &[sample(1, Some(5.0))]) else {
            panic!("expected ping stats");
        };
        assert_eq!(stats.mean_ms, Some(5.0));
        assert_eq!(stats.jitter_ms, None);
    }

    #[test]
    fn test_ping_loss() {
        let records = vec![sample(1, Some(1.0)), sample(2, None), sample(3, Some(3.0)), sample(4, None)];
        let Stats::Ping(stats) = Stats::compute(DiagnosticKind::Ping, &records) else {
            panic!("expected ping stats");
        };
        assert_eq!(stats.sent, 4);
        assert_eq!(stats.received, 2);
        assert_eq!(stats.loss_percent, 50.0);
    }

    #[test]
    fn test_traceroute_skips_timeouts() {
        let records = vec![hop(1, Some(2.0), false), hop(2, None, true), hop(3, Some(6.0), false)];
        let Stats::Traceroute(stats) = Stats::compute(DiagnosticKind::Traceroute, &records) else {
            panic!("expected traceroute stats");
        };
        assert_eq!(stats.hop_count, 3);
        assert_eq!(stats.timeout_count, 1);
        assert_eq!(stats.mean_latency_ms, Some(4.0));
        assert_eq!(stats.max_latency_ms, Some(6.0));
    }

    #[test]
    fn test_empty_stats() {
        assert_eq!(
            Stats::empty(DiagnosticKind::Dig),
            Stats::Dig(DigStats { record_count: 0 })
        );
    }
}
