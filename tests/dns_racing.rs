// Resolver behaviour against scripted UDP servers: racing, caching, and
// full-failure aggregation.

mod helpers;

use std::collections::HashMap;
use std::time::{Duration, Instant};

use domain_recon::dns::{DnsClient, DnsClientOptions};
use domain_recon::resolver::Resolver;
use hickory_proto::op::ResponseCode;
use hickory_proto::rr::RecordType;
use tokio_util::sync::CancellationToken;

use helpers::{a_record, MockDnsServer, Zone};

fn zone_with_a(name: &str, ip: [u8; 4], ttl: u32) -> Zone {
    let mut zone = Zone::new();
    zone.insert(
        (name.to_string(), RecordType::A),
        vec![a_record(name, ip, ttl)],
    );
    zone
}

#[tokio::test]
async fn first_noerror_server_wins_the_race() {
    let fast = MockDnsServer::spawn(
        zone_with_a("www.example.com", [192, 0, 2, 1], 60),
        Duration::ZERO,
        ResponseCode::NoError,
    )
    .await;
    let slow = MockDnsServer::spawn(
        zone_with_a("www.example.com", [203, 0, 113, 9], 60),
        Duration::from_secs(3),
        ResponseCode::NoError,
    )
    .await;

    let client = DnsClient::new(DnsClientOptions {
        servers: vec![slow.addr, fast.addr],
        timeout: Duration::from_secs(5),
        cache_enabled: false,
        cache_size: 0,
    })
    .unwrap();

    let resolver = Resolver::with_backend(std::sync::Arc::new(client), None);
    let cancel = CancellationToken::new();

    let start = Instant::now();
    let result = resolver.resolve(&cancel, "www.example.com").await;

    assert!(result.error.is_none());
    assert_eq!(result.ip_addresses, vec!["192.0.2.1"]);
    assert_eq!(result.dns_records["A"], vec!["192.0.2.1"]);
    // The slow server never gates the lookup; its in-flight query is
    // dropped once the fast server answers.
    assert!(
        start.elapsed() < Duration::from_secs(2),
        "race took {:?}",
        start.elapsed()
    );
}

#[tokio::test]
async fn ip_addresses_union_a_and_aaaa_sorted() {
    let mut zone = zone_with_a("dual.example.com", [192, 0, 2, 7], 60);
    zone.insert(
        ("dual.example.com".to_string(), RecordType::AAAA),
        vec![hickory_proto::rr::Record::from_rdata(
            hickory_proto::rr::Name::from_ascii("dual.example.com.").unwrap(),
            60,
            hickory_proto::rr::RData::AAAA(hickory_proto::rr::rdata::AAAA(
                "2001:db8::1".parse().unwrap(),
            )),
        )],
    );
    let server = MockDnsServer::spawn(zone, Duration::ZERO, ResponseCode::NoError).await;

    let client = DnsClient::new(DnsClientOptions {
        servers: vec![server.addr],
        timeout: Duration::from_secs(2),
        cache_enabled: false,
        cache_size: 0,
    })
    .unwrap();
    let resolver = Resolver::with_backend(std::sync::Arc::new(client), None);
    let cancel = CancellationToken::new();

    let result = resolver.resolve(&cancel, "dual.example.com").await;
    let mut expected: Vec<String> = result.dns_records["A"].clone();
    expected.extend(result.dns_records["AAAA"].clone());
    expected.sort();
    expected.dedup();
    assert_eq!(result.ip_addresses, expected);
}

#[tokio::test]
async fn cached_answers_skip_the_network() {
    let server = MockDnsServer::spawn(
        zone_with_a("cached.example.com", [192, 0, 2, 5], 300),
        Duration::ZERO,
        ResponseCode::NoError,
    )
    .await;

    let client = DnsClient::new(DnsClientOptions {
        servers: vec![server.addr],
        timeout: Duration::from_secs(2),
        cache_enabled: true,
        cache_size: 128,
    })
    .unwrap();

    let first = client.lookup_ip("cached.example.com").await.unwrap();
    assert_eq!(first.len(), 1);

    // Kill the server; the answer must now come from the TTL cache.
    drop(server);
    tokio::time::sleep(Duration::from_millis(50)).await;

    let second = client.lookup_ip("cached.example.com").await.unwrap();
    assert_eq!(first, second);
}

#[tokio::test]
async fn all_servers_failing_aggregates_errors() {
    let refusing = MockDnsServer::spawn(Zone::new(), Duration::ZERO, ResponseCode::Refused).await;
    let client = DnsClient::new(DnsClientOptions {
        servers: vec![refusing.addr],
        timeout: Duration::from_millis(500),
        cache_enabled: false,
        cache_size: 0,
    })
    .unwrap();

    let err = client.lookup_ip("nope.example.com").await.unwrap_err();
    assert!(err.to_string().to_ascii_lowercase().contains("refused"));
}

#[tokio::test]
async fn hostnames_are_normalized_before_query() {
    let server = MockDnsServer::spawn(
        zone_with_a("upper.example.com", [192, 0, 2, 8], 60),
        Duration::ZERO,
        ResponseCode::NoError,
    )
    .await;

    let client = DnsClient::new(DnsClientOptions {
        servers: vec![server.addr],
        timeout: Duration::from_secs(2),
        cache_enabled: false,
        cache_size: 0,
    })
    .unwrap();

    let ips = client.lookup_ip("  UPPER.Example.COM. ").await.unwrap();
    assert_eq!(ips.len(), 1);

    let mut zone = HashMap::new();
    zone.insert(
        ("self.example.com".to_string(), RecordType::CNAME),
        vec![helpers::cname_record("self.example.com", "SELF.example.com", 60)],
    );
    let server2 = MockDnsServer::spawn(zone, Duration::ZERO, ResponseCode::NoError).await;
    let client2 = DnsClient::new(DnsClientOptions {
        servers: vec![server2.addr],
        timeout: Duration::from_secs(2),
        cache_enabled: false,
        cache_size: 0,
    })
    .unwrap();

    // A CNAME pointing at the queried hostname itself is treated as absent.
    let cname = client2.lookup_cname("self.example.com").await.unwrap();
    assert_eq!(cname, None);
}
