//! Traceroute hop recognizer.

use std::sync::OnceLock;

use regex::Regex;

use crate::session::Hop;

/// Recognize a hop line: `N host (addr) [latency ms]` or `N *`.
///
/// Lines with a hop number but neither form are not hops.
pub fn recognize(line: &str) -> Option<Hop> {
    static HOP: OnceLock<Regex> = OnceLock::new();
    let re = HOP.get_or_init(|| {
        Regex::new(
            r"^\s*(?P<num>\d+)\s+(?:(?P<host>\S+)\s+\((?P<addr>[^)\s]+)\)|(?P<star>\*))(?:\s+(?P<ms>[0-9.]+)\s*ms)?",
        )
        .expect("valid regex")
    });

    let caps = re.captures(line)?;
    let hop_number = caps["num"].parse::<u32>().ok().filter(|n| *n > 0)?;

    if caps.name("star").is_some() {
        return Some(Hop {
            hop_number,
            hostname: None,
            address: None,
            latency_ms: None,
            is_timeout: true,
        });
    }

    Some(Hop {
        hop_number,
        hostname: caps.name("host").map(|m| m.as_str().to_string()),
        address: caps.name("addr").map(|m| m.as_str().to_string()),
        latency_ms: caps.name("ms").and_then(|m| m.as_str().parse().ok()),
        is_timeout: false,
    })
}
