//! Raw multi-server DNS client.
//!
//! Unlike a recursive resolver wrapper, this client owns its UDP sockets:
//! every query races all configured upstream servers, the first NOERROR
//! response wins, and losing queries are cancelled. Sockets are pooled per
//! server and answers are cached by `(hostname, record type)` with the
//! minimum answer TTL.

mod cache;
mod client;
mod pool;

pub use client::{DnsClient, DnsClientOptions, DnsError};
pub(crate) use pool::dial;
