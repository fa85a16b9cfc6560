//! Dig answer-section recognizer.

use chrono::{DateTime, Utc};

use crate::session::DnsRecord;

/// Recognize a `name ttl IN type value...` answer line.
///
/// A bare `@` owner name is the queried target.
pub fn recognize(line: &str, target: &str, observed_at: DateTime<Utc>) -> Option<DnsRecord> {
    if line.starts_with(';') || !line.contains("IN") {
        return None;
    }

    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() < 5 || fields[2] != "IN" {
        return None;
    }
    let ttl_seconds = fields[1].parse::<u32>().ok()?;

    let name = if fields[0] == "@" {
        target.to_string()
    } else {
        fields[0].to_string()
    };

    Some(DnsRecord {
        name,
        ttl_seconds,
        record_type: fields[3].to_string(),
        value: fields[4..].join(" "),
        observed_at,
    })
}
