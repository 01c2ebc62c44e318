use std::collections::BTreeSet;
use std::net::Ipv4Addr;

use ipnet::Ipv4Net;

/// The wildcard literal. An actual value set containing it subsumes any
/// requested set.
pub const ANY: &str = "any";

/// An IPv4 host, network or range as an inclusive numeric interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Span {
    start: u32,
    end: u32,
}

impl Ipv4Span {
    /// Parse `a.b.c.d`, `a.b.c.d/len` or `a.b.c.d-e.f.g.h`.
    ///
    /// A bare address is a /32 host route. Host bits set in a CIDR value are
    /// ignored (`10.0.0.5/24` spans the whole /24). A range whose start is
    /// above its end is not a valid span.
    pub fn parse(value: &str) -> Option<Self> {
        let value = value.trim();
        if let Some((first, last)) = value.split_once('-') {
            let start = u32::from(first.trim().parse::<Ipv4Addr>().ok()?);
            let end = u32::from(last.trim().parse::<Ipv4Addr>().ok()?);
            return (start <= end).then_some(Self { start, end });
        }
        if value.contains('/') {
            let net: Ipv4Net = value.parse().ok()?;
            return Some(Self {
                start: u32::from(net.network()),
                end: u32::from(net.broadcast()),
            });
        }
        let host = u32::from(value.parse::<Ipv4Addr>().ok()?);
        Some(Self {
            start: host,
            end: host,
        })
    }

    /// True when `other` lies entirely within `self` (equality included).
    pub fn contains(&self, other: &Ipv4Span) -> bool {
        self.start <= other.start && other.end <= self.end
    }
}

/// Returns true if `value` is any kind of IPv4 value: host, network or range.
pub fn is_ipv4(value: &str) -> bool {
    Ipv4Span::parse(value).is_some()
}

/// Normalize an address literal for comparison and value-index lookups.
///
/// A bare IPv4 host gains an explicit `/32`. Hostnames are lowercased, as
/// DNS names are case-insensitive.
pub fn normalize_address(value: &str) -> String {
    let value = value.trim();
    if !value.contains('/') && !value.contains('-') && value.parse::<Ipv4Addr>().is_ok() {
        format!("{value}/32")
    } else {
        value.to_ascii_lowercase()
    }
}

/// Compare a requested value set against the values an existing rule holds.
///
/// * An `actual` set holding [`ANY`] matches whatever was requested.
/// * With `network_aware`, IPv4 values use one-directional containment
///   (every requested network must sit inside some actual network) while
///   hostnames use equality (`exact`) or subset (`!exact`).
/// * Otherwise the comparison is plain set equality (`exact`) or subset.
pub fn matches(
    requested: &BTreeSet<String>,
    actual: &BTreeSet<String>,
    exact: bool,
    network_aware: bool,
) -> bool {
    if actual.contains(ANY) {
        return true;
    }
    if network_aware {
        return network_matches(requested, actual, exact);
    }
    if exact {
        requested == actual
    } else {
        requested.is_subset(actual)
    }
}

fn network_matches(requested: &BTreeSet<String>, actual: &BTreeSet<String>, exact: bool) -> bool {
    let (requested_spans, requested_hosts) = partition(requested);
    let (actual_spans, actual_hosts) = partition(actual);

    let contained = requested_spans
        .iter()
        .all(|r| actual_spans.iter().any(|a| a.contains(r)));
    if !contained {
        return false;
    }

    if exact {
        requested_hosts == actual_hosts
    } else {
        requested_hosts.is_subset(&actual_hosts)
    }
}

/// Split a value set into parsed IPv4 spans and everything else (hostnames,
/// lowercased).
fn partition(values: &BTreeSet<String>) -> (Vec<Ipv4Span>, BTreeSet<String>) {
    let mut spans = Vec::new();
    let mut hosts = BTreeSet::new();
    for value in values {
        match Ipv4Span::parse(value) {
            Some(span) => spans.push(span),
            None => {
                hosts.insert(value.to_ascii_lowercase());
            }
        }
    }
    (spans, hosts)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(values: &[&str]) -> BTreeSet<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    // ---- span parsing ----

    #[test]
    fn parse_host_network_and_range() {
        assert_eq!(
            Ipv4Span::parse("10.0.0.1"),
            Ipv4Span::parse("10.0.0.1/32")
        );
        assert!(Ipv4Span::parse("10.0.0.0/24").is_some());
        assert!(Ipv4Span::parse("10.0.0.10-10.0.0.20").is_some());
        assert!(Ipv4Span::parse("10.0.0.20-10.0.0.10").is_none());
        assert!(Ipv4Span::parse("www.example.com").is_none());
        assert!(Ipv4Span::parse("any").is_none());
    }

    #[test]
    fn host_bits_are_ignored() {
        let loose = Ipv4Span::parse("10.0.0.5/24").unwrap();
        let strict = Ipv4Span::parse("10.0.0.0/24").unwrap();
        assert_eq!(loose, strict);
    }

    #[test]
    fn normalize_adds_host_prefix_only_to_bare_hosts() {
        assert_eq!(normalize_address("10.1.1.1"), "10.1.1.1/32");
        assert_eq!(normalize_address(" 10.1.1.0/24 "), "10.1.1.0/24");
        assert_eq!(normalize_address("10.1.1.1-10.1.1.9"), "10.1.1.1-10.1.1.9");
        assert_eq!(normalize_address("db.example.com"), "db.example.com");
        assert_eq!(normalize_address("DB.Example.com "), "db.example.com");
    }

    // ---- network-aware matching ----

    #[test]
    fn containment_is_reflexive() {
        for v in ["10.0.0.0/8", "10.0.0.1/32", "10.0.0.1-10.0.0.4", "app.example.com"] {
            assert!(matches(&set(&[v]), &set(&[v]), true, true), "{v}");
        }
    }

    #[test]
    fn containment_direction_matters() {
        assert!(matches(&set(&["10.0.0.1/32"]), &set(&["10.0.0.0/24"]), true, true));
        assert!(!matches(&set(&["10.0.0.0/24"]), &set(&["10.0.0.1/32"]), true, true));
    }

    #[test]
    fn any_subsumes_everything() {
        let requested = set(&["10.9.9.9/32", "host.example.com"]);
        assert!(matches(&requested, &set(&["any"]), true, true));
        assert!(matches(&requested, &set(&["any"]), false, true));
        assert!(matches(&requested, &set(&["any"]), true, false));
    }

    #[test]
    fn missing_prefix_is_a_host_route() {
        assert!(matches(&set(&["10.1.1.1"]), &set(&["10.1.1.1/32"]), true, true));
    }

    #[test]
    fn range_inside_network() {
        assert!(matches(
            &set(&["10.0.0.10-10.0.0.20"]),
            &set(&["10.0.0.0/24"]),
            true,
            true
        ));
        assert!(!matches(
            &set(&["10.0.0.250-10.0.1.5"]),
            &set(&["10.0.0.0/24"]),
            true,
            true
        ));
    }

    #[test]
    fn every_requested_network_needs_a_container() {
        let actual = set(&["10.0.0.0/24", "192.168.0.0/16"]);
        assert!(matches(&set(&["10.0.0.4", "192.168.7.7"]), &actual, false, true));
        assert!(!matches(&set(&["10.0.0.4", "172.16.0.1"]), &actual, false, true));
    }

    #[test]
    fn hostnames_exact_versus_subset() {
        let actual = set(&["a.example.com", "b.example.com"]);
        assert!(!matches(&set(&["a.example.com"]), &actual, true, true));
        assert!(matches(&set(&["a.example.com"]), &actual, false, true));
        assert!(!matches(&set(&["c.example.com"]), &actual, false, true));
    }

    #[test]
    fn hostnames_ignore_case() {
        let actual = set(&["portal.example.com"]);
        assert!(matches(&set(&["Portal.Example.com"]), &actual, false, true));
        assert!(matches(&set(&["PORTAL.example.COM"]), &actual, true, true));
        assert!(!matches(&set(&["Portal.Example.org"]), &actual, false, true));
    }

    #[test]
    fn requested_any_is_not_covered_by_a_narrower_rule() {
        assert!(!matches(&set(&["any"]), &set(&["10.0.0.0/8"]), false, true));
    }

    // ---- plain set matching ----

    #[test]
    fn plain_exact_is_set_equality() {
        assert!(matches(&set(&["tcp/80", "tcp/443"]), &set(&["tcp/443", "tcp/80"]), true, false));
        assert!(!matches(&set(&["tcp/80"]), &set(&["tcp/443", "tcp/80"]), true, false));
    }

    #[test]
    fn plain_subset() {
        assert!(matches(&set(&["tcp/80"]), &set(&["tcp/443", "tcp/80"]), false, false));
        assert!(!matches(&set(&["udp/53"]), &set(&["tcp/443", "tcp/80"]), false, false));
    }

    #[test]
    fn plain_mode_has_no_ip_semantics() {
        assert!(!matches(&set(&["10.0.0.1/32"]), &set(&["10.0.0.0/24"]), false, false));
    }
}
