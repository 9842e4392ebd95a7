// Shared test helpers: an in-process UDP DNS responder.

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use hickory_proto::op::{Message, MessageType, OpCode, ResponseCode};
use hickory_proto::rr::{Name, RData, Record, RecordType};
use tokio::net::UdpSocket;

/// Scripted answers keyed by `(lowercased name, record type)`.
pub type Zone = HashMap<(String, RecordType), Vec<Record>>;

/// Minimal authoritative-style UDP responder for resolver tests.
pub struct MockDnsServer {
    pub addr: SocketAddr,
    task: tokio::task::JoinHandle<()>,
}

impl MockDnsServer {
    /// Answers from `zone` after `delay`; names missing from the zone get
    /// `miss_rcode` with an empty answer section.
    pub async fn spawn(zone: Zone, delay: Duration, miss_rcode: ResponseCode) -> Self {
        let socket = UdpSocket::bind("127.0.0.1:0").await.expect("bind mock dns");
        let addr = socket.local_addr().expect("mock dns addr");
        let socket = Arc::new(socket);
        let zone = Arc::new(zone);

        let task = tokio::spawn(async move {
            let mut buf = [0u8; 4096];
            loop {
                let Ok((len, peer)) = socket.recv_from(&mut buf).await else {
                    return;
                };
                let Ok(query) = Message::from_vec(&buf[..len]) else {
                    continue;
                };

                let socket = Arc::clone(&socket);
                let zone = Arc::clone(&zone);
                tokio::spawn(async move {
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }

                    let mut response = Message::new();
                    response
                        .set_id(query.id())
                        .set_message_type(MessageType::Response)
                        .set_op_code(OpCode::Query)
                        .set_recursion_available(true);

                    if let Some(question) = query.queries().first() {
                        let key = (
                            question
                                .name()
                                .to_utf8()
                                .trim_end_matches('.')
                                .to_ascii_lowercase(),
                            question.query_type(),
                        );
                        response.add_query(question.clone());
                        match zone.get(&key) {
                            Some(records) => {
                                response.set_response_code(ResponseCode::NoError);
                                response.add_answers(records.iter().cloned());
                            }
                            None => {
                                response.set_response_code(miss_rcode);
                            }
                        }
                    }

                    if let Ok(wire) = response.to_vec() {
                        let _ = socket.send_to(&wire, peer).await;
                    }
                });
            }
        });

        Self { addr, task }
    }
}

impl Drop for MockDnsServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

pub fn a_record(name: &str, ip: [u8; 4], ttl: u32) -> Record {
    Record::from_rdata(
        Name::from_ascii(format!("{name}.")).unwrap(),
        ttl,
        RData::A(hickory_proto::rr::rdata::A(ip.into())),
    )
}

pub fn cname_record(name: &str, target: &str, ttl: u32) -> Record {
    Record::from_rdata(
        Name::from_ascii(format!("{name}.")).unwrap(),
        ttl,
        RData::CNAME(hickory_proto::rr::rdata::CNAME(
            Name::from_ascii(format!("{target}.")).unwrap(),
        )),
    )
}
