//! Ping output recognizer.

use std::sync::OnceLock;

use regex::Regex;

/// A structured ping output line.
#[derive(Debug, Clone, PartialEq)]
pub enum PingLine {
    /// An echo reply, with its round trip when the line carried one
    Reply(Option<f64>),
    /// A probe reported as lost before the summary
    Lost,
    /// Closing "N packets transmitted, M received" summary
    Summary { transmitted: u32, received: u32 },
}

pub fn recognize(line: &str) -> Option<PingLine> {
    if line.contains("bytes from") {
        return Some(PingLine::Reply(parse_round_trip(line)));
    }

    static LOST: OnceLock<Regex> = OnceLock::new();
    let lost = LOST.get_or_init(|| {
        Regex::new(r"(?i)(request timeout|no answer yet) for icmp_seq").expect("valid regex")
    });
    if lost.is_match(line) {
        return Some(PingLine::Lost);
    }

    static SUMMARY: OnceLock<Regex> = OnceLock::new();
    let summary = SUMMARY.get_or_init(|| {
        Regex::new(r"(?P<tx>\d+)\s+packets transmitted,\s+(?P<rx>\d+)\s+(?:packets\s+)?received")
            .expect("valid regex")
    });
    let caps = summary.captures(line)?;
    Some(PingLine::Summary {
        transmitted: caps["tx"].parse().ok()?,
        received: caps["rx"].parse().ok()?,
    })
}

/// Extract the "time=X ms" latency of a reply line, in milliseconds.
fn parse_round_trip(line: &str) -> Option<f64> {
    // Linux and macOS print "time=12.3 ms"; sub-millisecond replies may print "time<1 ms"
    static TIME: OnceLock<Regex> = OnceLock::new();
    let re = TIME.get_or_init(|| Regex::new(r"time[=<](?P<val>[0-9.]+)\s*ms").expect("valid regex"));

    re.captures(line)
        .and_then(|caps| caps.name("val"))
        .and_then(|m| m.as_str().parse::<f64>().ok())
}
