// Bruteforce engine against a scripted local resolver.

mod helpers;

use std::io::Write;
use std::time::Duration;

use domain_recon::active::bruteforce::{self, BruteforceOptions};
use hickory_proto::op::ResponseCode;
use hickory_proto::rr::RecordType;
use tokio_util::sync::CancellationToken;

use helpers::{a_record, cname_record, MockDnsServer, Zone};

fn wordlist_file(words: &[&str]) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    for word in words {
        writeln!(file, "{word}").unwrap();
    }
    file.flush().unwrap();
    file
}

#[tokio::test]
async fn discovers_and_sorts_hits_from_wordlist() {
    let mut zone = Zone::new();
    zone.insert(
        ("www.example.com".to_string(), RecordType::A),
        vec![a_record("www.example.com", [192, 0, 2, 1], 60)],
    );
    zone.insert(
        ("api.example.com".to_string(), RecordType::A),
        vec![cname_record("api.example.com", "alias.example.com", 60)],
    );
    let server = MockDnsServer::spawn(zone, Duration::ZERO, ResponseCode::NXDomain).await;

    let wordlist = wordlist_file(&["www", "api", "missing"]);
    let cancel = CancellationToken::new();

    let results = bruteforce::run(
        &cancel,
        BruteforceOptions {
            domain: "example.com".into(),
            wordlist_path: Some(wordlist.path().to_path_buf()),
            permutations: false,
            dns_server: Some(server.addr.to_string()),
            timeout: Duration::from_secs(2),
            workers: 4,
            auto_tune: false,
            progress: None,
            rate_limiter: None,
        },
    )
    .await
    .unwrap();

    let summary: Vec<(String, Vec<String>)> = results
        .iter()
        .map(|result| {
            (
                result.subdomain.to_string(),
                result
                    .answers
                    .iter()
                    .map(|answer| answer.to_string())
                    .collect(),
            )
        })
        .collect();

    assert_eq!(
        summary,
        vec![
            (
                "api.example.com".to_string(),
                vec!["alias.example.com".to_string()]
            ),
            (
                "www.example.com".to_string(),
                vec!["192.0.2.1".to_string()]
            ),
        ]
    );
    assert!(results.iter().all(|r| r.rcode == ResponseCode::NoError));
}

#[tokio::test]
async fn no_hostname_appears_twice() {
    let mut zone = Zone::new();
    zone.insert(
        ("www.example.com".to_string(), RecordType::A),
        vec![a_record("www.example.com", [192, 0, 2, 1], 60)],
    );
    let server = MockDnsServer::spawn(zone, Duration::ZERO, ResponseCode::NXDomain).await;

    // Duplicate words collapse through the intern-backed label dedup.
    let wordlist = wordlist_file(&["www", "WWW", "www"]);
    let cancel = CancellationToken::new();

    let results = bruteforce::run(
        &cancel,
        BruteforceOptions {
            domain: "EXAMPLE.com".into(),
            wordlist_path: Some(wordlist.path().to_path_buf()),
            permutations: false,
            dns_server: Some(server.addr.to_string()),
            timeout: Duration::from_secs(2),
            workers: 8,
            auto_tune: false,
            progress: None,
            rate_limiter: None,
        },
    )
    .await
    .unwrap();

    assert_eq!(results.len(), 1);
    assert_eq!(&*results[0].subdomain, "www.example.com");
}

#[tokio::test]
async fn cancellation_stops_the_run_cleanly() {
    let server = MockDnsServer::spawn(Zone::new(), Duration::from_millis(200), ResponseCode::NXDomain).await;

    let words: Vec<String> = (0..500).map(|i| format!("label{i}")).collect();
    let word_refs: Vec<&str> = words.iter().map(String::as_str).collect();
    let wordlist = wordlist_file(&word_refs);

    let cancel = CancellationToken::new();
    let cancel_clone = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel_clone.cancel();
    });

    let results = bruteforce::run(
        &cancel,
        BruteforceOptions {
            domain: "example.com".into(),
            wordlist_path: Some(wordlist.path().to_path_buf()),
            permutations: false,
            dns_server: Some(server.addr.to_string()),
            timeout: Duration::from_secs(1),
            workers: 4,
            auto_tune: false,
            progress: None,
            rate_limiter: None,
        },
    )
    .await
    .unwrap();

    // A cancelled run returns whatever it found so far instead of hanging.
    assert!(results.len() < 500);
}
