//! Baseline loading and change classification.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};

use super::{HttpService, Record};
use crate::resolver::unique_sorted;

/// Counters accumulated while diffing a run against a baseline.
#[derive(Debug, Default)]
pub struct DiffSummary {
    pub added: usize,
    pub updated: usize,
    pub removed: Vec<String>,
}

/// Reads records from a prior run: either a JSON array or newline-delimited
/// JSON, detected by the first non-whitespace byte.
pub fn load_records(path: &Path) -> Result<Vec<Record>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("reading baseline {}", path.display()))?;
    let trimmed = content.trim_start();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }

    if trimmed.starts_with('[') {
        return serde_json::from_str(trimmed)
            .with_context(|| format!("parsing baseline array {}", path.display()));
    }

    let mut records = Vec::new();
    for record in serde_json::Deserializer::from_str(trimmed).into_iter::<Record>() {
        records.push(record.with_context(|| format!("parsing baseline {}", path.display()))?);
    }
    Ok(records)
}

/// Canonicalizes a record for comparison: lower-cased subdomain and URLs,
/// upper-cased record-type keys, sorted deduplicated lists, trimmed
/// strings. Timestamps, change tags, and screenshot paths do not take part
/// in diffing.
pub fn normalize_record(record: &Record) -> Record {
    let mut dns_records = BTreeMap::new();
    for (record_type, values) in &record.dns_records {
        let record_type = record_type.trim().to_ascii_uppercase();
        dns_records.insert(record_type, unique_sorted(values.clone()));
    }

    let mut http_services: Vec<HttpService> = record
        .http_services
        .iter()
        .map(|service| HttpService {
            url: service.url.trim().to_ascii_lowercase(),
            status_code: service.status_code,
            error: service.error.trim().to_string(),
            banner: service.banner.trim().to_string(),
            title: service.title.trim().to_string(),
            snippet: service.snippet.trim().to_string(),
            screenshot_path: String::new(),
        })
        .collect();
    http_services.sort_by(|a, b| {
        a.url
            .cmp(&b.url)
            .then_with(|| a.status_code.cmp(&b.status_code))
    });

    Record {
        subdomain: record.subdomain.trim().to_ascii_lowercase(),
        source: normalize_sources(&record.source),
        ip_addresses: unique_sorted(record.ip_addresses.clone()),
        timestamp: String::new(),
        dns_records,
        http_services,
        change: String::new(),
    }
}

/// Classifies a record against the baseline: `Some("new")` when the
/// subdomain is absent, `Some("updated")` when present but different,
/// `None` when unchanged. `record` must already be normalized.
pub fn classify_change(
    baseline: &std::collections::HashMap<String, Record>,
    record: &Record,
) -> Option<&'static str> {
    match baseline.get(&record.subdomain) {
        None => Some("new"),
        Some(previous) if !records_equal(previous, record) => Some("updated"),
        Some(_) => None,
    }
}

/// Diff equality over normalized records.
pub fn records_equal(a: &Record, b: &Record) -> bool {
    let a = normalize_record(a);
    let b = normalize_record(b);

    a.subdomain == b.subdomain
        && a.source == b.source
        && a.ip_addresses == b.ip_addresses
        && a.dns_records == b.dns_records
        && a.http_services == b.http_services
}

fn normalize_sources(source: &str) -> String {
    if source.trim().is_empty() {
        return String::new();
    }
    let parts: Vec<String> = source.split(',').map(str::to_string).collect();
    unique_sorted(parts).join(",")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn record(subdomain: &str, a_records: &[&str]) -> Record {
        let mut dns_records = BTreeMap::new();
        if !a_records.is_empty() {
            dns_records.insert(
                "a".to_string(),
                a_records.iter().map(|v| v.to_string()).collect(),
            );
        }
        Record {
            subdomain: subdomain.to_string(),
            ip_addresses: a_records.iter().map(|v| v.to_string()).collect(),
            source: "crtsh,active:bruteforce,crtsh".to_string(),
            timestamp: "2024-06-01T00:00:00Z".to_string(),
            dns_records,
            http_services: Vec::new(),
            change: "new".to_string(),
        }
    }

    #[test]
    fn normalize_is_idempotent() {
        let original = record("WWW.Example.COM", &["192.0.2.2", "192.0.2.1"]);
        let once = normalize_record(&original);
        let twice = normalize_record(&once);
        assert_eq!(once, twice);
        assert_eq!(once.subdomain, "www.example.com");
        assert_eq!(once.source, "active:bruteforce,crtsh");
        assert_eq!(once.dns_records["A"], vec!["192.0.2.1", "192.0.2.2"]);
        assert!(once.change.is_empty());
        assert!(once.timestamp.is_empty());
    }

    #[test]
    fn equal_normalized_records_compare_equal() {
        let a = record("www.example.com", &["192.0.2.1", "192.0.2.2"]);
        let b = record("WWW.EXAMPLE.COM", &["192.0.2.2", "192.0.2.1"]);
        assert!(records_equal(&a, &b));

        let c = record("www.example.com", &["192.0.2.1"]);
        assert!(!records_equal(&a, &c));
    }

    #[test]
    fn load_detects_array_format() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            "  [{{\"subdomain\":\"a.example.com\"}},{{\"subdomain\":\"b.example.com\"}}]"
        )
        .unwrap();
        let records = load_records(file.path()).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].subdomain, "a.example.com");
    }

    #[test]
    fn load_detects_ndjson_format() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "{{\"subdomain\":\"a.example.com\"}}").unwrap();
        writeln!(file, "{{\"subdomain\":\"b.example.com\"}}").unwrap();
        let records = load_records(file.path()).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].subdomain, "b.example.com");
    }

    #[test]
    fn load_empty_file_is_empty() {
        let file = tempfile::NamedTempFile::new().unwrap();
        assert!(load_records(file.path()).unwrap().is_empty());
    }

    #[test]
    fn load_rejects_garbage() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "not json at all").unwrap();
        assert!(load_records(file.path()).is_err());
    }
}
