//! The racing DNS client.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use futures::stream::FuturesUnordered;
use futures::StreamExt;
use hickory_proto::op::{Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::{Name, RData, Record, RecordType};
use log::trace;
use rand::Rng;
use tokio::net::UdpSocket;

use super::cache::DnsCache;
use super::pool::SocketPool;

const SOCKET_POOL_CAPACITY: usize = 64;
const MAX_UDP_PAYLOAD: usize = 4096;

/// Errors surfaced by [`DnsClient`] lookups.
#[derive(Debug, thiserror::Error)]
pub enum DnsError {
    #[error("empty hostname")]
    EmptyHostname,
    #[error("invalid hostname {0:?}")]
    InvalidName(String),
    #[error("dns query timed out")]
    Timeout,
    #[error("{qtype} lookup failed with {rcode}")]
    LookupFailed { qtype: RecordType, rcode: ResponseCode },
    #[error("no such host")]
    NoRecords,
    #[error("no dns response for {0}")]
    NoResponse(String),
    #[error("{0}")]
    Aggregate(String),
    #[error("dns message encoding failed: {0}")]
    Proto(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Options for [`DnsClient::new`].
pub struct DnsClientOptions {
    /// Upstream servers, caller-preferred order. Must be non-empty.
    pub servers: Vec<SocketAddr>,
    /// Per-query timeout.
    pub timeout: Duration,
    pub cache_enabled: bool,
    pub cache_size: usize,
}

/// Multi-server UDP DNS client with racing, pooling, and a TTL cache.
pub struct DnsClient {
    servers: Vec<SocketAddr>,
    timeout: Duration,
    cache: Option<DnsCache>,
    pool: SocketPool,
}

type TypedRecords = HashMap<RecordType, (Vec<Record>, Duration)>;

impl DnsClient {
    pub fn new(options: DnsClientOptions) -> Result<Self, DnsError> {
        if options.servers.is_empty() {
            return Err(DnsError::Aggregate(
                "at least one DNS server must be configured".into(),
            ));
        }
        let timeout = if options.timeout.is_zero() {
            Duration::from_secs(5)
        } else {
            options.timeout
        };
        let cache = (options.cache_enabled && options.cache_size > 0)
            .then(|| DnsCache::new(options.cache_size));

        Ok(Self {
            servers: options.servers,
            timeout,
            cache,
            pool: SocketPool::new(SOCKET_POOL_CAPACITY),
        })
    }

    /// Fused A + AAAA lookup. Both record types are answered by the same
    /// winning server over one pooled socket.
    pub async fn lookup_ip(&self, host: &str) -> Result<Vec<IpAddr>, DnsError> {
        let host = normalize_host(host).ok_or(DnsError::EmptyHostname)?;

        let qtypes = [RecordType::A, RecordType::AAAA];
        let mut resolved: HashMap<RecordType, Vec<Record>> = HashMap::new();
        let mut missing = Vec::new();

        for qtype in qtypes {
            match self.cached(&host, qtype) {
                Some(records) => {
                    resolved.insert(qtype, records);
                }
                None => missing.push(qtype),
            }
        }

        let mut lookup_err = None;
        if !missing.is_empty() {
            match self.query_racing(&host, &missing).await {
                Ok(results) => {
                    for (qtype, (records, ttl)) in results {
                        self.store(&host, qtype, &records, ttl);
                        resolved.insert(qtype, records);
                    }
                }
                Err(err) => lookup_err = Some(err),
            }
        }

        let mut ips = Vec::new();
        for qtype in qtypes {
            for record in resolved.get(&qtype).into_iter().flatten() {
                match record.data() {
                    Some(RData::A(a)) => ips.push(IpAddr::V4(a.0)),
                    Some(RData::AAAA(aaaa)) => ips.push(IpAddr::V6(aaaa.0)),
                    _ => {}
                }
            }
        }

        if ips.is_empty() {
            return Err(lookup_err.unwrap_or(DnsError::NoRecords));
        }
        Ok(ips)
    }

    /// CNAME target with the trailing dot stripped. `Ok(None)` when there is
    /// no CNAME or the target equals the queried hostname.
    pub async fn lookup_cname(&self, host: &str) -> Result<Option<String>, DnsError> {
        let host = normalize_host(host).ok_or(DnsError::EmptyHostname)?;
        let (records, ttl) = self.fetch_records(&host, RecordType::CNAME).await?;
        if records.is_empty() {
            return Ok(None);
        }

        if let Some(ttl) = ttl {
            self.store(&host, RecordType::CNAME, &records, ttl);
        }

        let target = match records[0].data() {
            Some(RData::CNAME(cname)) => trim_dot(&cname.0.to_utf8()),
            _ => return Ok(None),
        };
        if target.is_empty() || target.eq_ignore_ascii_case(&host) {
            return Ok(None);
        }
        Ok(Some(target))
    }

    /// MX records as `(preference, exchange host)` pairs.
    pub async fn lookup_mx(&self, host: &str) -> Result<Vec<(u16, String)>, DnsError> {
        let host = normalize_host(host).ok_or(DnsError::EmptyHostname)?;
        let (records, ttl) = self.fetch_records(&host, RecordType::MX).await?;

        let mx: Vec<(u16, String)> = records
            .iter()
            .filter_map(|record| match record.data() {
                Some(RData::MX(mx)) => {
                    Some((mx.preference(), trim_dot(&mx.exchange().to_utf8())))
                }
                _ => None,
            })
            .collect();

        if !mx.is_empty() {
            if let Some(ttl) = ttl {
                self.store(&host, RecordType::MX, &records, ttl);
            }
        }
        if mx.is_empty() {
            return Err(DnsError::NoRecords);
        }
        Ok(mx)
    }

    /// TXT values; the character strings of each record are concatenated
    /// with no separator.
    pub async fn lookup_txt(&self, host: &str) -> Result<Vec<String>, DnsError> {
        let host = normalize_host(host).ok_or(DnsError::EmptyHostname)?;
        let (records, ttl) = self.fetch_records(&host, RecordType::TXT).await?;

        let values: Vec<String> = records
            .iter()
            .filter_map(|record| match record.data() {
                Some(RData::TXT(txt)) => Some(
                    txt.txt_data()
                        .iter()
                        .map(|part| String::from_utf8_lossy(part).into_owned())
                        .collect::<String>(),
                ),
                _ => None,
            })
            .collect();

        if !values.is_empty() {
            if let Some(ttl) = ttl {
                self.store(&host, RecordType::TXT, &records, ttl);
            }
        }
        if values.is_empty() {
            return Err(DnsError::NoRecords);
        }
        Ok(values)
    }

    /// NS hostnames with trailing dots stripped.
    pub async fn lookup_ns(&self, host: &str) -> Result<Vec<String>, DnsError> {
        let host = normalize_host(host).ok_or(DnsError::EmptyHostname)?;
        let (records, ttl) = self.fetch_records(&host, RecordType::NS).await?;

        let hosts: Vec<String> = records
            .iter()
            .filter_map(|record| match record.data() {
                Some(RData::NS(ns)) => Some(trim_dot(&ns.0.to_utf8())),
                _ => None,
            })
            .collect();

        if !hosts.is_empty() {
            if let Some(ttl) = ttl {
                self.store(&host, RecordType::NS, &records, ttl);
            }
        }
        if hosts.is_empty() {
            return Err(DnsError::NoRecords);
        }
        Ok(hosts)
    }

    /// Cached records, or a fresh racing query. The TTL is `None` for cache
    /// hits so callers do not re-insert them.
    async fn fetch_records(
        &self,
        host: &str,
        qtype: RecordType,
    ) -> Result<(Vec<Record>, Option<Duration>), DnsError> {
        if let Some(records) = self.cached(host, qtype) {
            return Ok((records, None));
        }

        let mut results = self.query_racing(host, &[qtype]).await?;
        let (records, ttl) = results.remove(&qtype).unwrap_or_default();
        Ok((records, Some(ttl)))
    }

    /// Races all configured servers. The first server to answer with
    /// NOERROR wins; the remaining in-flight queries are dropped. When
    /// every server fails the per-server errors are aggregated.
    async fn query_racing(
        &self,
        host: &str,
        qtypes: &[RecordType],
    ) -> Result<TypedRecords, DnsError> {
        let mut in_flight: FuturesUnordered<_> = self
            .servers
            .iter()
            .map(|&server| async move {
                self.query_server_multi(server, host, qtypes)
                    .await
                    .map_err(|err| (server, err))
            })
            .collect();

        let mut errors = Vec::new();
        while let Some(result) = in_flight.next().await {
            match result {
                Ok(records) => return Ok(records),
                Err((server, err)) => errors.push(format!("{server}: {err}")),
            }
        }

        if errors.is_empty() {
            return Err(DnsError::NoResponse(host.to_string()));
        }
        Err(DnsError::Aggregate(errors.join("; ")))
    }

    /// Queries one server for every requested type sequentially over a
    /// single pooled socket. The socket returns to the pool only on success.
    async fn query_server_multi(
        &self,
        server: SocketAddr,
        host: &str,
        qtypes: &[RecordType],
    ) -> Result<TypedRecords, DnsError> {
        let name = Name::from_ascii(format!("{host}."))
            .map_err(|_| DnsError::InvalidName(host.to_string()))?;
        let socket = self.pool.get(server).await?;

        let mut results = TypedRecords::new();
        for &qtype in qtypes {
            let query = build_query(name.clone(), qtype);
            let response = match self.exchange(&socket, &query).await {
                Ok(response) => response,
                Err(err) => return Err(err), // socket dropped, not pooled
            };

            if response.response_code() != ResponseCode::NoError {
                return Err(DnsError::LookupFailed {
                    qtype,
                    rcode: response.response_code(),
                });
            }

            let answers: Vec<Record> = response
                .answers()
                .iter()
                .filter(|record| record.record_type() == qtype)
                .cloned()
                .collect();
            let ttl = min_ttl(&answers);
            trace!("{server} answered {} {qtype} record(s) for {host}", answers.len());
            results.insert(qtype, (answers, ttl));
        }

        self.pool.put(server, socket);
        Ok(results)
    }

    async fn exchange(&self, socket: &UdpSocket, query: &Message) -> Result<Message, DnsError> {
        let wire = query.to_vec().map_err(|err| DnsError::Proto(err.to_string()))?;
        socket.send(&wire).await?;

        let mut buf = [0u8; MAX_UDP_PAYLOAD];
        let response = tokio::time::timeout(self.timeout, async {
            loop {
                let len = socket.recv(&mut buf).await?;
                match Message::from_vec(&buf[..len]) {
                    // A stale datagram from an earlier timed-out query on a
                    // pooled socket carries a different id; keep reading.
                    Ok(message) if message.id() == query.id() => return Ok(message),
                    _ => continue,
                }
            }
        })
        .await
        .map_err(|_| DnsError::Timeout)?;

        response
    }

    fn cached(&self, host: &str, qtype: RecordType) -> Option<Vec<Record>> {
        self.cache.as_ref()?.get(host, qtype)
    }

    fn store(&self, host: &str, qtype: RecordType, records: &[Record], ttl: Duration) {
        if let Some(cache) = &self.cache {
            cache.set(host, qtype, records, ttl);
        }
    }
}

fn build_query(name: Name, qtype: RecordType) -> Message {
    let mut message = Message::new();
    message
        .set_id(rand::thread_rng().gen())
        .set_message_type(MessageType::Query)
        .set_op_code(OpCode::Query)
        .set_recursion_desired(true)
        .add_query(Query::query(name, qtype));
    message
}

/// Minimum TTL across the answer set; zero when the set is empty or any
/// record carries a zero TTL (such answers are not cacheable).
fn min_ttl(records: &[Record]) -> Duration {
    let min = records.iter().map(Record::ttl).min().unwrap_or(0);
    Duration::from_secs(u64::from(min))
}

/// Lower-cases, trims whitespace, and strips the trailing dot. Returns
/// `None` for an effectively empty hostname.
pub(crate) fn normalize_host(host: &str) -> Option<String> {
    let normalized = host.trim().trim_end_matches('.').to_ascii_lowercase();
    (!normalized.is_empty()).then_some(normalized)
}

fn trim_dot(name: &str) -> String {
    name.trim_end_matches('.').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::rr::rdata::A;
    use std::str::FromStr;

    #[test]
    fn normalize_host_canonicalizes() {
        assert_eq!(normalize_host(" WWW.Example.COM. "), Some("www.example.com".into()));
        assert_eq!(normalize_host("."), None);
        assert_eq!(normalize_host("   "), None);
    }

    #[test]
    fn min_ttl_takes_smallest_answer() {
        let records: Vec<Record> = [30u32, 300, 60]
            .iter()
            .map(|&ttl| {
                Record::from_rdata(
                    Name::from_str("www.example.com.").unwrap(),
                    ttl,
                    RData::A(A([192, 0, 2, 1].into())),
                )
            })
            .collect();
        assert_eq!(min_ttl(&records), Duration::from_secs(30));
        assert_eq!(min_ttl(&[]), Duration::ZERO);
    }

    #[test]
    fn new_requires_servers() {
        let result = DnsClient::new(DnsClientOptions {
            servers: vec![],
            timeout: Duration::from_secs(5),
            cache_enabled: false,
            cache_size: 0,
        });
        assert!(result.is_err());
    }

    #[test]
    fn build_query_sets_recursion() {
        let name = Name::from_str("example.com.").unwrap();
        let query = build_query(name, RecordType::A);
        assert!(query.recursion_desired());
        assert_eq!(query.queries().len(), 1);
        assert_eq!(query.queries()[0].query_type(), RecordType::A);
    }
}
