//! AXFR zone transfer attempts.
//!
//! For each nameserver of the apex an AXFR is attempted over TCP. Most
//! servers refuse; the occasional misconfigured one hands over the whole
//! zone. Failures are logged and skipped, never fatal.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use hickory_proto::op::{Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::{Name, RData, Record, RecordType};
use log::debug;
use rand::Rng;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use crate::ratelimit::RateLimiter;
use crate::resolver::{parse_server, unique_sorted, DEFAULT_DNS_SERVERS};

/// Inputs for [`run`].
pub struct ZoneTransferOptions {
    pub domain: String,
    pub dns_server: Option<String>,
    pub timeout: Duration,
    pub rate_limiter: Option<Arc<RateLimiter>>,
}

/// Records obtained from one cooperating nameserver.
#[derive(Debug)]
pub struct ZoneTransferResult {
    pub nameserver: String,
    /// hostname -> record type -> sorted values
    pub records: BTreeMap<String, BTreeMap<String, Vec<String>>>,
}

/// Attempts AXFR against every nameserver of the apex.
pub async fn run(
    cancel: &CancellationToken,
    options: ZoneTransferOptions,
) -> Result<Vec<ZoneTransferResult>> {
    let domain = options.domain.trim().to_ascii_lowercase();
    if domain.is_empty() {
        return Err(anyhow!("domain is required"));
    }

    let timeout = if options.timeout.is_zero() {
        Duration::from_secs(5)
    } else {
        options.timeout
    };

    let server = resolve_query_server(options.dns_server.as_deref()).await?;

    if let Some(limiter) = &options.rate_limiter {
        limiter.acquire(cancel).await?;
    }

    let nameservers = lookup_nameservers(server, &domain, timeout).await?;
    if nameservers.is_empty() {
        return Ok(Vec::new());
    }

    let mut results = Vec::new();
    for nameserver in nameservers {
        if cancel.is_cancelled() {
            return Ok(results);
        }

        if let Some(limiter) = &options.rate_limiter {
            limiter.acquire(cancel).await?;
        }

        match attempt_transfer(&nameserver, &domain, timeout).await {
            Ok(records) if records.is_empty() => {
                debug!("zone transfer {nameserver} returned no records");
            }
            Ok(records) => {
                results.push(ZoneTransferResult {
                    nameserver,
                    records,
                });
            }
            Err(err) => {
                debug!("zone transfer {nameserver} failed: {err}");
            }
        }
    }

    Ok(results)
}

async fn resolve_query_server(server: Option<&str>) -> Result<SocketAddr> {
    let entry = match server.and_then(|s| parse_server(s).transpose()) {
        Some(parsed) => parsed?,
        None => DEFAULT_DNS_SERVERS[0].to_string(),
    };
    let mut addrs = tokio::net::lookup_host(entry.as_str())
        .await
        .with_context(|| format!("resolving dns server {entry}"))?;
    addrs
        .next()
        .ok_or_else(|| anyhow!("dns server {entry} resolved to no addresses"))
}

async fn lookup_nameservers(
    server: SocketAddr,
    domain: &str,
    timeout: Duration,
) -> Result<Vec<String>> {
    let socket = crate::dns::dial(server).await.context("dialling dns server")?;

    let name = Name::from_ascii(format!("{domain}."))
        .map_err(|_| anyhow!("invalid domain {domain:?}"))?;
    let mut query = Message::new();
    query
        .set_id(rand::thread_rng().gen())
        .set_message_type(MessageType::Query)
        .set_op_code(OpCode::Query)
        .set_recursion_desired(true)
        .add_query(Query::query(name, RecordType::NS));

    let wire = query.to_vec().context("encoding ns query")?;
    socket.send(&wire).await.context("sending ns query")?;

    let mut buf = [0u8; 4096];
    let response = tokio::time::timeout(timeout, async {
        loop {
            let len = socket.recv(&mut buf).await?;
            match Message::from_vec(&buf[..len]) {
                Ok(message) if message.id() == query.id() => {
                    return Ok::<Message, std::io::Error>(message)
                }
                _ => continue,
            }
        }
    })
    .await
    .map_err(|_| anyhow!("ns query timed out"))?
    .context("receiving ns response")?;

    if response.response_code() != ResponseCode::NoError {
        return Err(anyhow!(
            "ns query failed with rcode {}",
            response.response_code()
        ));
    }

    let nameservers: Vec<String> = response
        .answers()
        .iter()
        .filter_map(|record| match record.data() {
            Some(RData::NS(ns)) => {
                let name = sanitize_name(&ns.0.to_utf8());
                (!name.is_empty()).then_some(name)
            }
            _ => None,
        })
        .collect();

    Ok(unique_sorted(nameservers))
}

/// Performs the AXFR over TCP with 2-byte length framing, collecting every
/// record until the closing SOA or connection end.
async fn attempt_transfer(
    nameserver: &str,
    domain: &str,
    timeout: Duration,
) -> Result<BTreeMap<String, BTreeMap<String, Vec<String>>>> {
    let address = if nameserver.contains(':') {
        nameserver.to_string()
    } else {
        format!("{nameserver}:53")
    };

    let mut stream = tokio::time::timeout(timeout, TcpStream::connect(&address))
        .await
        .map_err(|_| anyhow!("connect to {address} timed out"))?
        .with_context(|| format!("connecting to {address}"))?;

    let name = Name::from_ascii(format!("{domain}."))
        .map_err(|_| anyhow!("invalid domain {domain:?}"))?;
    let mut request = Message::new();
    request
        .set_id(rand::thread_rng().gen())
        .set_message_type(MessageType::Query)
        .set_op_code(OpCode::Query)
        .add_query(Query::query(name, RecordType::AXFR));

    let wire = request.to_vec().context("encoding axfr request")?;
    let mut framed = Vec::with_capacity(wire.len() + 2);
    framed.extend_from_slice(&(wire.len() as u16).to_be_bytes());
    framed.extend_from_slice(&wire);

    tokio::time::timeout(timeout, stream.write_all(&framed))
        .await
        .map_err(|_| anyhow!("axfr write timed out"))?
        .context("sending axfr request")?;

    let mut records: BTreeMap<String, BTreeMap<String, Vec<String>>> = BTreeMap::new();
    let mut soa_count = 0usize;

    'messages: loop {
        let mut length_prefix = [0u8; 2];
        match tokio::time::timeout(timeout, stream.read_exact(&mut length_prefix)).await {
            Ok(Ok(_)) => {}
            Ok(Err(_)) | Err(_) => break, // connection closed or stalled
        }
        let length = usize::from(u16::from_be_bytes(length_prefix));
        if length == 0 {
            break;
        }

        let mut payload = vec![0u8; length];
        tokio::time::timeout(timeout, stream.read_exact(&mut payload))
            .await
            .map_err(|_| anyhow!("axfr read timed out"))?
            .context("reading axfr message")?;

        let message = Message::from_vec(&payload).context("decoding axfr message")?;
        if message.response_code() != ResponseCode::NoError {
            return Err(anyhow!(
                "axfr failed with rcode {}",
                message.response_code()
            ));
        }

        for record in message.answers() {
            if record.record_type() == RecordType::SOA {
                soa_count += 1;
            }
            add_record(&mut records, record);
            // The zone is bracketed by the SOA; the second one ends it.
            if soa_count >= 2 {
                break 'messages;
            }
        }
    }

    for type_records in records.values_mut() {
        for values in type_records.values_mut() {
            *values = unique_sorted(std::mem::take(values));
        }
    }

    Ok(records)
}

fn add_record(records: &mut BTreeMap<String, BTreeMap<String, Vec<String>>>, record: &Record) {
    let name = sanitize_name(&record.name().to_utf8());
    if name.is_empty() {
        return;
    }

    let record_type = record.record_type().to_string();
    let Some(value) = record_value(record) else {
        return;
    };

    records
        .entry(name)
        .or_default()
        .entry(record_type)
        .or_default()
        .push(value);
}

fn record_value(record: &Record) -> Option<String> {
    let value = match record.data()? {
        RData::A(a) => a.0.to_string(),
        RData::AAAA(aaaa) => aaaa.0.to_string(),
        RData::CNAME(cname) => sanitize_name(&cname.0.to_utf8()),
        RData::MX(mx) => format!(
            "{} {}",
            mx.preference(),
            sanitize_name(&mx.exchange().to_utf8())
        ),
        RData::NS(ns) => sanitize_name(&ns.0.to_utf8()),
        RData::SOA(soa) => format!(
            "{} {} {} {} {} {} {}",
            sanitize_name(&soa.mname().to_utf8()),
            sanitize_name(&soa.rname().to_utf8()),
            soa.serial(),
            soa.refresh(),
            soa.retry(),
            soa.expire(),
            soa.minimum()
        ),
        RData::SRV(srv) => format!(
            "{} {} {} {}",
            srv.priority(),
            srv.weight(),
            srv.port(),
            sanitize_name(&srv.target().to_utf8())
        ),
        RData::TXT(txt) => txt
            .txt_data()
            .iter()
            .map(|part| String::from_utf8_lossy(part).into_owned())
            .collect::<Vec<_>>()
            .join(" "),
        other => other.to_string().trim().to_string(),
    };

    let value = value.trim().to_string();
    (!value.is_empty()).then_some(value)
}

fn sanitize_name(name: &str) -> String {
    name.trim().trim_end_matches('.').to_ascii_lowercase()
}
