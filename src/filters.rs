//! Result filtering: wildcard DNS, CDN fronting, scope patterns, unique IPs.
//!
//! Wildcard detection probes a handful of random labels under the apex and
//! profiles whatever answers come back: exact IPs, /24 IPv4 prefixes, the
//! first 64 bits of IPv6 addresses, and CNAME targets. Later resolutions
//! matching the profile are treated as wildcard noise. Profiles are cached
//! per apex for the lifetime of the process.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::IpAddr;
use std::sync::Arc;
use std::sync::Mutex;

use futures::stream::StreamExt;
use once_cell::sync::Lazy;
use rand::Rng;
use tokio_util::sync::CancellationToken;

use crate::resolver::{Resolution, Resolver};

static WILDCARD_CACHE: Lazy<Mutex<HashMap<String, WildcardProfile>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

const KNOWN_CDN_MARKERS: [&str; 15] = [
    "cloudflare",
    "cloudfront",
    "akamai",
    "edgesuite",
    "akamaiedge",
    "fastly",
    "cdn77",
    "cdn.cloudflare",
    "azureedge",
    "azurefd",
    "trafficmanager.net",
    "amazonaws.com",
    "cloudapp.net",
    "googleusercontent.com",
    "cdngc.net",
];

/// DNS answers observed for random-label probes under one apex.
#[derive(Debug, Clone, Default)]
pub struct WildcardProfile {
    active: bool,
    ips: HashSet<String>,
    ipv4_prefixes: HashSet<String>,
    ipv6_prefixes: HashSet<String>,
    cnames: HashSet<String>,
}

impl WildcardProfile {
    /// Whether any probe produced answers.
    pub fn active(&self) -> bool {
        self.active
    }

    /// Whether `resolution` looks like the wildcard answer set: any exact
    /// IP match, any IP falling into a profiled prefix, or any CNAME from
    /// the profiled set.
    pub fn matches(&self, resolution: &Resolution) -> bool {
        if !self.active {
            return false;
        }
        if self.ips.is_empty()
            && self.cnames.is_empty()
            && self.ipv4_prefixes.is_empty()
            && self.ipv6_prefixes.is_empty()
        {
            return false;
        }

        for ip in &resolution.ip_addresses {
            let ip = ip.trim();
            if ip.is_empty() {
                continue;
            }
            if self.ips.contains(ip) {
                return true;
            }
            if let Some(prefix) = ipv4_prefix(ip) {
                if self.ipv4_prefixes.contains(&prefix) {
                    return true;
                }
            }
            if let Some(prefix) = ipv6_prefix(ip) {
                if self.ipv6_prefixes.contains(&prefix) {
                    return true;
                }
            }
        }

        if let Some(cnames) = resolution.dns_records.get("CNAME") {
            for cname in cnames {
                if self.cnames.contains(&cname.trim().to_ascii_lowercase()) {
                    return true;
                }
            }
        }

        false
    }
}

/// Probes `samples` random labels under `apex` (clamped to 3..=5, at most
/// `batch` in flight) and builds the wildcard profile. Cached per apex.
pub async fn detect_wildcard(
    cancel: &CancellationToken,
    resolver: &Arc<Resolver>,
    apex: &str,
    samples: usize,
    batch: usize,
) -> WildcardProfile {
    let apex = apex.trim().to_ascii_lowercase();
    if apex.is_empty() {
        return WildcardProfile::default();
    }

    if let Some(cached) = WILDCARD_CACHE
        .lock()
        .expect("wildcard cache poisoned")
        .get(&apex)
    {
        return cached.clone();
    }

    let samples = samples.clamp(3, 5);
    let batch = if batch == 0 { samples } else { batch.min(samples) };

    let probes: Vec<String> = (0..samples)
        .map(|_| format!("{}.{}", random_label(), apex))
        .collect();

    let results: Vec<Resolution> = futures::stream::iter(probes)
        .map(|hostname| {
            let resolver = Arc::clone(resolver);
            let cancel = cancel.clone();
            async move { resolver.resolve(&cancel, &hostname).await }
        })
        .buffer_unordered(batch)
        .collect()
        .await;

    let mut profile = WildcardProfile::default();
    let mut successes = 0;

    for resolution in results {
        if !resolution.is_resolved() {
            continue;
        }
        successes += 1;

        for ip in &resolution.ip_addresses {
            let ip = ip.trim();
            if ip.is_empty() {
                continue;
            }
            profile.ips.insert(ip.to_string());
            if let Some(prefix) = ipv4_prefix(ip) {
                profile.ipv4_prefixes.insert(prefix);
            }
            if let Some(prefix) = ipv6_prefix(ip) {
                profile.ipv6_prefixes.insert(prefix);
            }
        }

        if let Some(cnames) = resolution.dns_records.get("CNAME") {
            for cname in cnames {
                let cleaned = cname.trim().to_ascii_lowercase();
                if !cleaned.is_empty() {
                    profile.cnames.insert(cleaned);
                }
            }
        }
    }

    profile.active = successes > 0;

    WILDCARD_CACHE
        .lock()
        .expect("wildcard cache poisoned")
        .insert(apex, profile.clone());
    profile
}

/// Heuristic: any CNAME or TXT value containing a known CDN marker makes
/// per-host distinctions meaningless.
pub fn is_cdn_response(records: &BTreeMap<String, Vec<String>>) -> bool {
    records
        .iter()
        .filter(|(record_type, _)| record_type.as_str() == "CNAME" || record_type.as_str() == "TXT")
        .flat_map(|(_, values)| values)
        .map(|value| value.to_ascii_lowercase())
        .any(|value| KNOWN_CDN_MARKERS.iter().any(|marker| value.contains(marker)))
}

/// Scope patterns: glob (`*?[]`), leading-dot suffix, or case-insensitive
/// substring. An empty pattern list matches everything.
pub fn matches_scope(subdomain: &str, patterns: &[String]) -> bool {
    if patterns.is_empty() {
        return true;
    }

    let candidate = subdomain.trim().to_ascii_lowercase();
    if candidate.is_empty() {
        return false;
    }

    for pattern in patterns {
        let pattern = pattern.trim().to_ascii_lowercase();
        if pattern.is_empty() {
            continue;
        }

        if pattern.contains(['*', '?', '[', ']']) {
            if glob_match(&pattern, &candidate) {
                return true;
            }
            continue;
        }

        if pattern.starts_with('.') {
            if candidate.ends_with(&pattern) {
                return true;
            }
            continue;
        }

        if candidate.contains(&pattern) {
            return true;
        }
    }

    false
}

/// Keeps only IPs unseen in this run and prunes the A/AAAA record lists to
/// match. Returns the surviving IPs; an empty result means the record
/// should be dropped.
pub fn filter_unique_ips(
    ips: Vec<String>,
    records: &mut BTreeMap<String, Vec<String>>,
    seen: &mut HashSet<String>,
) -> Vec<String> {
    if ips.is_empty() {
        return ips;
    }

    let filtered: Vec<String> = ips
        .into_iter()
        .map(|ip| ip.trim().to_string())
        .filter(|ip| !ip.is_empty() && seen.insert(ip.clone()))
        .collect();

    if filtered.is_empty() {
        return filtered;
    }

    let allowed: HashSet<&str> = filtered.iter().map(String::as_str).collect();
    for record_type in ["A", "AAAA"] {
        if let Some(values) = records.get_mut(record_type) {
            values.retain(|value| allowed.contains(value.trim()));
        }
    }
    records.retain(|_, values| !values.is_empty());

    filtered
}

fn random_label() -> String {
    let mut rng = rand::thread_rng();
    (0..12)
        .map(|_| {
            let nibble: u8 = rng.gen_range(0..16);
            char::from_digit(u32::from(nibble), 16).unwrap_or('0')
        })
        .collect()
}

fn ipv4_prefix(ip: &str) -> Option<String> {
    match ip.parse::<IpAddr>() {
        Ok(IpAddr::V4(v4)) => {
            let octets = v4.octets();
            Some(format!("{}.{}.{}", octets[0], octets[1], octets[2]))
        }
        _ => None,
    }
}

fn ipv6_prefix(ip: &str) -> Option<String> {
    match ip.parse::<IpAddr>() {
        Ok(IpAddr::V6(v6)) => Some(hex::encode(&v6.octets()[..8])),
        _ => None,
    }
}

/// Minimal glob matcher covering `*`, `?`, and `[...]` classes, the subset
/// scope patterns use. Matching is over the whole candidate.
fn glob_match(pattern: &str, candidate: &str) -> bool {
    fn inner(pattern: &[char], candidate: &[char]) -> bool {
        match pattern.split_first() {
            None => candidate.is_empty(),
            Some((&'*', rest)) => (0..=candidate.len()).any(|i| inner(rest, &candidate[i..])),
            Some((&'?', rest)) => match candidate.split_first() {
                Some((_, tail)) => inner(rest, tail),
                None => false,
            },
            Some((&'[', rest)) => {
                let Some(end) = rest.iter().position(|&c| c == ']') else {
                    return false;
                };
                let (class, remainder) = rest.split_at(end);
                let remainder = &remainder[1..];
                let Some((&head, tail)) = candidate.split_first() else {
                    return false;
                };
                let (negated, class) = match class.split_first() {
                    Some((&'!', inverted)) => (true, inverted),
                    _ => (false, class),
                };
                let mut matched = false;
                let mut i = 0;
                while i < class.len() {
                    if i + 2 < class.len() && class[i + 1] == '-' {
                        if class[i] <= head && head <= class[i + 2] {
                            matched = true;
                        }
                        i += 3;
                    } else {
                        if class[i] == head {
                            matched = true;
                        }
                        i += 1;
                    }
                }
                if matched != negated {
                    inner(remainder, tail)
                } else {
                    false
                }
            }
            Some((&ch, rest)) => match candidate.split_first() {
                Some((&head, tail)) if head == ch => inner(rest, tail),
                _ => false,
            },
        }
    }

    let pattern: Vec<char> = pattern.chars().collect();
    let candidate: Vec<char> = candidate.chars().collect();
    inner(&pattern, &candidate)
}

#[cfg(test)]
pub(crate) fn reset_wildcard_cache() {
    WILDCARD_CACHE
        .lock()
        .expect("wildcard cache poisoned")
        .clear();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolution(ips: &[&str], cnames: &[&str]) -> Resolution {
        let mut dns_records = BTreeMap::new();
        if !cnames.is_empty() {
            dns_records.insert(
                "CNAME".to_string(),
                cnames.iter().map(|c| c.to_string()).collect(),
            );
        }
        Resolution {
            subdomain: "probe.example.com".into(),
            ip_addresses: ips.iter().map(|ip| ip.to_string()).collect(),
            dns_records,
            error: None,
        }
    }

    fn profile_from(ips: &[&str], cnames: &[&str]) -> WildcardProfile {
        let mut profile = WildcardProfile {
            active: true,
            ..WildcardProfile::default()
        };
        for ip in ips {
            profile.ips.insert(ip.to_string());
            if let Some(prefix) = ipv4_prefix(ip) {
                profile.ipv4_prefixes.insert(prefix);
            }
            if let Some(prefix) = ipv6_prefix(ip) {
                profile.ipv6_prefixes.insert(prefix);
            }
        }
        for cname in cnames {
            profile.cnames.insert(cname.to_string());
        }
        profile
    }

    #[test]
    fn profile_matches_ipv4_prefix_and_exact() {
        let profile = profile_from(&["203.0.113.10", "203.0.113.200", "2001:db8::1"], &[]);

        assert!(profile.matches(&resolution(&["203.0.113.55"], &[])));
        assert!(profile.matches(&resolution(&["203.0.113.10"], &[])));
        assert!(profile.matches(&resolution(&["2001:db8::abcd"], &[])));
        assert!(!profile.matches(&resolution(&["198.51.100.1"], &[])));
    }

    #[test]
    fn profile_matches_cname() {
        let profile = profile_from(&[], &["wildcard.parking.example.net"]);
        assert!(profile.matches(&resolution(&[], &["Wildcard.Parking.example.NET"])));
        assert!(!profile.matches(&resolution(&[], &["real.example.net"])));
    }

    #[test]
    fn inactive_profile_never_matches() {
        let profile = WildcardProfile::default();
        assert!(!profile.matches(&resolution(&["203.0.113.10"], &[])));
    }

    #[test]
    fn cdn_detection_scans_cname_and_txt_only() {
        let mut records = BTreeMap::new();
        records.insert(
            "CNAME".to_string(),
            vec!["edge.site.cloudfront.net".to_string()],
        );
        assert!(is_cdn_response(&records));

        let mut records = BTreeMap::new();
        records.insert("A".to_string(), vec!["cloudflare".to_string()]);
        assert!(!is_cdn_response(&records));

        let mut records = BTreeMap::new();
        records.insert(
            "TXT".to_string(),
            vec!["verification=Akamai-Edge".to_string()],
        );
        assert!(is_cdn_response(&records));

        assert!(!is_cdn_response(&BTreeMap::new()));
    }

    #[test]
    fn scope_glob_suffix_and_substring() {
        let globs = vec!["api-*.example.com".to_string()];
        assert!(matches_scope("api-1.example.com", &globs));
        assert!(!matches_scope("www.example.com", &globs));

        let suffix = vec![".example.com".to_string()];
        assert!(matches_scope("deep.sub.example.com", &suffix));
        assert!(!matches_scope("example.org", &suffix));

        let substring = vec!["staging".to_string()];
        assert!(matches_scope("app.STAGING.example.com", &substring));
        assert!(!matches_scope("app.prod.example.com", &substring));

        assert!(matches_scope("anything.example.com", &[]));
    }

    #[test]
    fn glob_char_classes() {
        assert!(glob_match("db[0-9].example.com", "db3.example.com"));
        assert!(!glob_match("db[0-9].example.com", "dbx.example.com"));
        assert!(glob_match("??.example.com", "eu.example.com"));
    }

    #[test]
    fn unique_ip_filter_prunes_records() {
        let mut seen = HashSet::new();
        let mut records = BTreeMap::new();
        records.insert(
            "A".to_string(),
            vec!["192.0.2.1".to_string(), "192.0.2.2".to_string()],
        );

        let surviving = filter_unique_ips(
            vec!["192.0.2.1".to_string(), "192.0.2.2".to_string()],
            &mut records,
            &mut seen,
        );
        assert_eq!(surviving.len(), 2);

        // Second record resolving to the same IPs loses everything.
        let mut records2 = BTreeMap::new();
        records2.insert("A".to_string(), vec!["192.0.2.1".to_string()]);
        let surviving = filter_unique_ips(vec!["192.0.2.1".to_string()], &mut records2, &mut seen);
        assert!(surviving.is_empty());
    }

    #[tokio::test]
    async fn detect_wildcard_inactive_when_probes_fail() {
        use crate::resolver::LookupBackend;
        use async_trait::async_trait;
        use std::net::IpAddr;

        struct DeadBackend;
        #[async_trait]
        impl LookupBackend for DeadBackend {
            async fn lookup_ip(&self, _h: &str) -> Result<Vec<IpAddr>, crate::dns::DnsError> {
                Err(crate::dns::DnsError::NoRecords)
            }
            async fn lookup_cname(
                &self,
                _h: &str,
            ) -> Result<Option<String>, crate::dns::DnsError> {
                Ok(None)
            }
            async fn lookup_mx(
                &self,
                _h: &str,
            ) -> Result<Vec<(u16, String)>, crate::dns::DnsError> {
                Err(crate::dns::DnsError::NoRecords)
            }
            async fn lookup_txt(&self, _h: &str) -> Result<Vec<String>, crate::dns::DnsError> {
                Err(crate::dns::DnsError::NoRecords)
            }
            async fn lookup_ns(&self, _h: &str) -> Result<Vec<String>, crate::dns::DnsError> {
                Err(crate::dns::DnsError::NoRecords)
            }
        }

        reset_wildcard_cache();
        let resolver = Resolver::with_backend(Arc::new(DeadBackend), None);
        let cancel = CancellationToken::new();
        let profile =
            detect_wildcard(&cancel, &resolver, "nowild.example.com", 3, 3).await;
        assert!(!profile.active());
    }
}
