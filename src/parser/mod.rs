//! Incremental parsers for streamed diagnostic output.
//!
//! All three kinds share one line discipline: the first line of a run echoes
//! the invoked command and is stored but never parsed; every later non-empty
//! line goes to the kind's recognizer, and unrecognized lines are kept as raw
//! output only.

pub mod dig;
pub mod ping;
pub mod traceroute;

use chrono::{DateTime, Utc};

use crate::session::{DiagnosticKind, ParsedRecord, PingSample, Session};

use ping::PingLine;

/// Fold one output fragment into `session`.
///
/// Appends every line to the raw output, appends (or, for hops,
/// replaces) records, and recomputes aggregates. Returns how many records
/// were produced.
pub fn consume(
    kind: DiagnosticKind,
    session: &mut Session,
    fragment: &str,
    now: DateTime<Utc>,
) -> usize {
    let mut produced = 0;

    for line in fragment.lines().map(str::trim) {
        // Blank lines keep the tool's section spacing but carry no data
        if line.is_empty() {
            session.raw_output.push(String::new());
            continue;
        }
        let is_echo = session.raw_output.iter().all(String::is_empty);
        session.raw_output.push(line.to_string());
        if is_echo {
            continue;
        }

        let matched = match kind {
            DiagnosticKind::Ping => apply_ping(session, line, now),
            DiagnosticKind::Dig => match dig::recognize(line, &session.target, now) {
                Some(record) => {
                    session.records.push(ParsedRecord::Dns(record));
                    true
                }
                None => false,
            },
            DiagnosticKind::Traceroute => match traceroute::recognize(line) {
                Some(hop) => {
                    upsert_hop(&mut session.records, hop);
                    true
                }
                None => false,
            },
        };
        if matched {
            produced += 1;
        }
    }

    session.refresh_aggregates(kind);
    produced
}

fn apply_ping(session: &mut Session, line: &str, now: DateTime<Utc>) -> bool {
    let round_trip_ms = match ping::recognize(line) {
        Some(PingLine::Reply(rtt)) => rtt,
        Some(PingLine::Lost) => None,
        Some(PingLine::Summary { .. }) => {
            session.output_complete = true;
            return false;
        }
        None => return false,
    };

    let sequence_implied = session
        .records
        .iter()
        .filter(|r| matches!(r, ParsedRecord::Ping(_)))
        .count() as u32
        + 1;
    session.records.push(ParsedRecord::Ping(PingSample {
        sequence_implied,
        round_trip_ms,
        received_at: now,
    }));
    true
}

/// A later report for the same hop number replaces the earlier one in place.
fn upsert_hop(records: &mut Vec<ParsedRecord>, hop: crate::session::Hop) {
    let existing = records.iter_mut().find_map(|r| match r {
        ParsedRecord::Hop(h) if h.hop_number == hop.hop_number => Some(h),
        _ => None,
    });
    match existing {
        Some(slot) => *slot = hop,
        None => records.push(ParsedRecord::Hop(hop)),
    }
}
