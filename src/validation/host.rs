//! Target and parameter syntax checks.

use std::net::IpAddr;

use crate::session::{DiagnosticKind, Parameters};

use super::ValidationError;

const MAX_HOST_LEN: usize = 253;
const MAX_LABEL_LEN: usize = 63;
const DIG_RECORD_TYPES: [&str; 6] = ["A", "AAAA", "MX", "NS", "TXT", "SOA"];

/// How a syntactically valid target was recognized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostForm {
    /// An IPv4 or IPv6 literal; never needs resolving
    Literal,
    DomainName,
}

/// Check `target` and return it normalized (one trailing dot stripped).
pub fn check_host(target: &str) -> Result<(String, HostForm), ValidationError> {
    let host = target.strip_suffix('.').unwrap_or(target);

    if host.is_empty() || host.len() > MAX_HOST_LEN {
        return Err(ValidationError::InvalidHost);
    }
    // IPv6 literals contain ':', so literals are recognized before the charset check
    if host.parse::<IpAddr>().is_ok() {
        return Ok((host.to_string(), HostForm::Literal));
    }
    if !host.chars().all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-') {
        return Err(ValidationError::InvalidHost);
    }
    if !is_domain_name(host) {
        return Err(ValidationError::InvalidHost);
    }

    Ok((host.to_string(), HostForm::DomainName))
}

/// Dotted RFC 1123 name with an alphabetic top-level label of two or more characters.
fn is_domain_name(host: &str) -> bool {
    let labels: Vec<&str> = host.split('.').collect();
    let Some((tld, rest)) = labels.split_last() else {
        return false;
    };
    if rest.is_empty() {
        return false;
    }

    let tld_ok = tld.len() >= 2
        && tld.len() <= MAX_LABEL_LEN
        && tld.chars().all(|c| c.is_ascii_alphabetic());

    tld_ok && rest.iter().all(|label| is_label(label))
}

fn is_label(label: &str) -> bool {
    !label.is_empty()
        && label.len() <= MAX_LABEL_LEN
        && !label.starts_with('-')
        && !label.ends_with('-')
        && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
}

/// Check the kind's parameter and return the normalized parameter set.
pub fn check_parameters(
    kind: DiagnosticKind,
    parameters: &Parameters,
) -> Result<Parameters, ValidationError> {
    let name = kind.parameter_name();
    let raw = parameters
        .get(name)
        .map(|v| v.trim())
        .ok_or_else(|| invalid("Invalid parameters"))?;

    let value = match kind {
        DiagnosticKind::Ping => bounded_int(raw, 1, 10)
            .ok_or_else(|| invalid("Ping count must be between 1 and 10"))?
            .to_string(),
        DiagnosticKind::Dig => {
            let upper = raw.to_ascii_uppercase();
            if !DIG_RECORD_TYPES.contains(&upper.as_str()) {
                return Err(invalid("Invalid DNS record type"));
            }
            upper
        }
        DiagnosticKind::Traceroute => bounded_int(raw, 1, 30)
            .ok_or_else(|| invalid("Max hops must be between 1 and 30"))?
            .to_string(),
    };

    let mut normalized = Parameters::new();
    normalized.insert(name.to_string(), value);
    Ok(normalized)
}

fn bounded_int(raw: &str, min: i64, max: i64) -> Option<i64> {
    raw.parse::<i64>().ok().filter(|n| (min..=max).contains(n))
}

fn invalid(reason: &str) -> ValidationError {
    ValidationError::InvalidParameters(reason.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(kind: DiagnosticKind, value: &str) -> Parameters {
        let mut p = Parameters::new();
        p.insert(kind.parameter_name().to_string(), value.to_string());
        p
    }

    #[test]
    fn test_ip_literals() {
        for ip in ["8.8.8.8", "192.168.1.254", "::1", "2001:db8::8a2e:370:7334", "fe80::1"] {
            assert_eq!(check_host(ip).unwrap().1, HostForm::Literal, "{}", ip);
        }
    }

    #[test]
    fn test_domain_names() {
        for host in ["example.com", "a-b.example.co.uk", "xn--bcher-kva.example", "EXAMPLE.COM."] {
            assert_eq!(check_host(host).unwrap().1, HostForm::DomainName, "{}", host);
        }
        assert_eq!(check_host("example.com.").unwrap().0, "example.com");
    }

    #[test]
    fn test_rejected_hosts() {
        let too_long = format!("{}.com", "a.".repeat(130));
        let long_label = format!("{}.com", "a".repeat(64));
        for host in [
            "",
            ".",
            "localhost",
            "exa_mple.com",
            "example.com/path",
            "ex ample.com",
            "-bad.example.com",
            "bad-.example.com",
            "example..com",
            "example.c0m",
            "example.c",
            "1.2.3",
            "256.1.1.1",
            too_long.as_str(),
            long_label.as_str(),
        ] {
            assert_eq!(check_host(host), Err(ValidationError::InvalidHost), "{:?}", host);
        }
    }

    #[test]
    fn test_ping_count_bounds() {
        assert!(check_parameters(DiagnosticKind::Ping, &params(DiagnosticKind::Ping, "1")).is_ok());
        assert!(check_parameters(DiagnosticKind::Ping, &params(DiagnosticKind::Ping, "10")).is_ok());
        for bad in ["0", "11", "4abc", "", "-1", "2.5"] {
            assert!(
                matches!(
                    check_parameters(DiagnosticKind::Ping, &params(DiagnosticKind::Ping, bad)),
                    Err(ValidationError::InvalidParameters(_))
                ),
                "{:?}",
                bad
            );
        }
        assert_eq!(
            check_parameters(DiagnosticKind::Ping, &Parameters::new()),
            Err(ValidationError::InvalidParameters("Invalid parameters".to_string()))
        );
    }

    #[test]
    fn test_dig_type_case_insensitive() {
        let normalized = check_parameters(DiagnosticKind::Dig, &params(DiagnosticKind::Dig, "aaaa")).unwrap();
        assert_eq!(normalized["type"], "AAAA");
        assert_eq!(
            check_parameters(DiagnosticKind::Dig, &params(DiagnosticKind::Dig, "CNAME")),
            Err(ValidationError::InvalidParameters("Invalid DNS record type".to_string()))
        );
    }

    #[test]
    fn test_traceroute_max_hops() {
        assert!(check_parameters(DiagnosticKind::Traceroute, &params(DiagnosticKind::Traceroute, "30")).is_ok());
        assert!(check_parameters(DiagnosticKind::Traceroute, &params(DiagnosticKind::Traceroute, "31")).is_err());
    }
}
