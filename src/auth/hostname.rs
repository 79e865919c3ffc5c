//! Subdomain gateway resolution
//!
//! Hosts of the form `{root}.{ns}.{gateway}` address content by subdomain
//! (`bafy....ipfs.dweb.link`). The gateway table holds exact hostnames and
//! wildcard patterns where each `*` stands for exactly one label.

use std::collections::HashSet;

/// Namespaces recognized in the label before a known gateway
const SUBDOMAIN_NAMESPACES: &[&str] = &["ipfs", "ipns", "p2p", "ipld"];

/// Components of a subdomain gateway host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubdomainDetails {
    /// The matched gateway hostname (port kept when present)
    pub gateway_host: String,
    pub namespace: String,
    /// Everything left of the namespace label; may itself contain dots
    pub root_id: String,
}

/// Known subdomain gateway hostnames
#[derive(Debug, Clone, Default)]
pub struct SubdomainGateways {
    exact: HashSet<String>,
    wildcard: Vec<Vec<String>>,
}

impl SubdomainGateways {
    /// Build the table from configured hostnames
    pub fn new<I, S>(hostnames: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut gws = Self::default();
        for hostname in hostnames {
            let hostname = hostname.as_ref().trim();
            if hostname.is_empty() {
                continue;
            }
            if hostname.contains('*') {
                gws.wildcard
                    .push(hostname.split('.').map(str::to_string).collect());
            } else {
                gws.exact.insert(hostname.to_string());
            }
        }
        gws
    }

    pub fn is_empty(&self) -> bool {
        self.exact.is_empty() && self.wildcard.is_empty()
    }

    /// Whether `hostname` (host with optional port) is a configured gateway
    pub fn is_known_hostname(&self, hostname: &str) -> bool {
        if self.exact.contains(hostname) || self.exact.contains(strip_port(hostname)) {
            return true;
        }

        let bare = strip_numeric_port(hostname);
        let labels: Vec<&str> = bare.split('.').collect();
        self.wildcard.iter().any(|pattern| {
            pattern.len() == labels.len()
                && pattern.iter().zip(&labels).all(|(p, l)| {
                    if p == "*" {
                        !l.is_empty()
                    } else {
                        p == l
                    }
                })
        })
    }

    /// Resolve `{root}.{ns}.{gateway}` against the table.
    ///
    /// Scans from the right so the shortest matching gateway suffix wins,
    /// and needs at least a root and a namespace label in front of it.
    pub fn known_subdomain_details(&self, hostname: &str) -> Option<SubdomainDetails> {
        let labels: Vec<&str> = hostname.split('.').collect();

        for i in (2..labels.len()).rev() {
            let fqdn = labels[i..].join(".");
            if !self.is_known_hostname(&fqdn) {
                continue;
            }

            let ns = labels[i - 1];
            if !is_subdomain_namespace(ns) {
                continue;
            }

            return Some(SubdomainDetails {
                gateway_host: fqdn,
                namespace: ns.to_string(),
                root_id: labels[..i - 1].join("."),
            });
        }

        None
    }
}

pub fn is_subdomain_namespace(ns: &str) -> bool {
    SUBDOMAIN_NAMESPACES.contains(&ns)
}

/// Remove a `:port` suffix, handling bracketed IPv6 literals.
///
/// Inputs that are not `host:port` shaped come back unchanged.
pub fn strip_port(hostname: &str) -> &str {
    if let Some(rest) = hostname.strip_prefix('[') {
        return match rest.find(']') {
            Some(end) if rest[end + 1..].starts_with(':') => &rest[..end],
            _ => hostname,
        };
    }

    match hostname.rfind(':') {
        Some(i) if !hostname[..i].contains(':') => &hostname[..i],
        _ => hostname,
    }
}

/// Wildcards only tolerate a numeric port
fn strip_numeric_port(hostname: &str) -> &str {
    match hostname.rsplit_once(':') {
        Some((host, port)) if !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) => {
            host
        }
        _ => hostname,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CID: &str = "bafkreicysg23kiwv34eg2d7qweipxwosdo2py4ldv42nbauguluen5v6am";
    const IPNS_KEY: &str = "bafzbeihe35nmjqar22thmxsnlsgxppd66pseq6tscs4mo25y55juhh6bju";

    #[test]
    fn test_strip_port() {
        let cases = [
            ("localhost:8080", "localhost"),
            (
                "bafkreicysg23kiwv34eg2d7qweipxwosdo2py4ldv42nbauguluen5v6am.ipfs.localhost:8080",
                "bafkreicysg23kiwv34eg2d7qweipxwosdo2py4ldv42nbauguluen5v6am.ipfs.localhost",
            ),
            ("example.com:443", "example.com"),
            ("example.com", "example.com"),
            ("foo-dweb.ipfs.pvt.k12.ma.us:8080", "foo-dweb.ipfs.pvt.k12.ma.us"),
            ("localhost", "localhost"),
            ("[::1]:8080", "::1"),
        ];
        for (input, expected) in cases {
            assert_eq!(strip_port(input), expected, "input: {input}");
        }
    }

    fn gateways() -> SubdomainGateways {
        SubdomainGateways::new([
            "localhost",
            "dweb.link",
            "devgateway.dweb.link",
            "dweb.ipfs.pvt.k12.ma.us",
            "*.wildcard1.tld",
            "*.*.wildcard2.tld",
        ])
    }

    #[test]
    fn test_unknown_hosts() {
        let gws = gateways();
        let misses = [
            "127.0.0.1:8080",
            "[::1]:8080",
            "hey.look.example.com",
            "dweb.link",
            ".....dweb.link",
            "link",
            "8080:dweb.link",
            " ",
            "",
            &format!("{CID}.ipfs.unknown.example.com"),
            "foo.dweb.ipfs.pvt.k12.ma.us",
            "api.localhost",
            "wildcard1.tld",
            ".wildcard1.tld",
            &format!("{CID}.ipfs.wildcard1.tld"),
            &format!("{CID}.ipfs.sub1.sub2.wildcard1.tld"),
        ];
        for host in misses {
            assert_eq!(gws.known_subdomain_details(host), None, "host: {host}");
        }
    }

    #[test]
    fn test_known_subdomain_details() {
        let gws = gateways();
        let hits = [
            (format!("{CID}.ipfs.localhost:8080"), "localhost:8080", "ipfs", CID.to_string()),
            (format!("{CID}.ipfs.dweb.link"), "dweb.link", "ipfs", CID.to_string()),
            (
                format!("{CID}.ipfs.devgateway.dweb.link"),
                "devgateway.dweb.link",
                "ipfs",
                CID.to_string(),
            ),
            (
                "foo.bar.boo-buzz.ipfs.dweb.link".to_string(),
                "dweb.link",
                "ipfs",
                "foo.bar.boo-buzz".to_string(),
            ),
            (format!("{IPNS_KEY}.ipns.localhost:8080"), "localhost:8080", "ipns", IPNS_KEY.to_string()),
            (format!("{IPNS_KEY}.ipns.dweb.link"), "dweb.link", "ipns", IPNS_KEY.to_string()),
            (
                format!("{CID}.ipfs.dweb.ipfs.pvt.k12.ma.us"),
                "dweb.ipfs.pvt.k12.ma.us",
                "ipfs",
                CID.to_string(),
            ),
            (
                "en.wikipedia-on-ipfs.org.ipns.localhost".to_string(),
                "localhost",
                "ipns",
                "en.wikipedia-on-ipfs.org".to_string(),
            ),
            (
                "dist.ipfs.tech.ipns.localhost:8080".to_string(),
                "localhost:8080",
                "ipns",
                "dist.ipfs.tech".to_string(),
            ),
            ("peerid.p2p.localhost".to_string(), "localhost", "p2p", "peerid".to_string()),
            (
                format!("{CID}.ipfs.sub.wildcard1.tld"),
                "sub.wildcard1.tld",
                "ipfs",
                CID.to_string(),
            ),
            (
                format!("{CID}.ipfs.sub1.sub2.wildcard2.tld"),
                "sub1.sub2.wildcard2.tld",
                "ipfs",
                CID.to_string(),
            ),
        ];

        for (host, gw, ns, root) in hits {
            let details = gws
                .known_subdomain_details(&host)
                .unwrap_or_else(|| panic!("expected match for {host}"));
            assert_eq!(details.gateway_host, gw, "host: {host}");
            assert_eq!(details.namespace, ns, "host: {host}");
            assert_eq!(details.root_id, root, "host: {host}");
        }
    }

    #[test]
    fn test_wildcard_accepts_numeric_port_only() {
        let gws = gateways();
        assert!(gws.is_known_hostname("sub.wildcard1.tld:8080"));
        assert!(!gws.is_known_hostname("sub.wildcard1.tld:http"));
    }
}
