//! Per-server UDP socket pools.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Mutex;

use tokio::net::UdpSocket;

/// Bounded pool of connected UDP sockets per upstream server.
///
/// `get` hands out exclusive ownership of a pooled socket or dials a fresh
/// one. `put` returns the socket unless the pool is full, in which case it
/// is dropped. A socket that saw an error must not be returned.
pub(crate) struct SocketPool {
    pools: Mutex<HashMap<SocketAddr, Vec<UdpSocket>>>,
    capacity: usize,
}

impl SocketPool {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            pools: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    pub(crate) async fn get(&self, server: SocketAddr) -> io::Result<UdpSocket> {
        if let Some(socket) = self
            .pools
            .lock()
            .expect("socket pool poisoned")
            .get_mut(&server)
            .and_then(Vec::pop)
        {
            return Ok(socket);
        }
        dial(server).await
    }

    pub(crate) fn put(&self, server: SocketAddr, socket: UdpSocket) {
        let mut pools = self.pools.lock().expect("socket pool poisoned");
        let pool = pools.entry(server).or_default();
        if pool.len() < self.capacity {
            pool.push(socket);
        }
        // full pool: socket drops and closes here
    }
}

pub(crate) async fn dial(server: SocketAddr) -> io::Result<UdpSocket> {
    let local: SocketAddr = if server.is_ipv4() {
        "0.0.0.0:0".parse().expect("ipv4 wildcard addr")
    } else {
        "[::]:0".parse().expect("ipv6 wildcard addr")
    };
    let socket = UdpSocket::bind(local).await?;
    socket.connect(server).await?;
    Ok(socket)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn get_dials_and_put_reuses() {
        let server: SocketAddr = "127.0.0.1:5353".parse().unwrap();
        let pool = SocketPool::new(2);

        let socket = pool.get(server).await.unwrap();
        let local = socket.local_addr().unwrap();
        pool.put(server, socket);

        let reused = pool.get(server).await.unwrap();
        assert_eq!(reused.local_addr().unwrap(), local);
    }

    #[tokio::test]
    async fn put_drops_beyond_capacity() {
        let server: SocketAddr = "127.0.0.1:5353".parse().unwrap();
        let pool = SocketPool::new(1);

        let first = pool.get(server).await.unwrap();
        let second = pool.get(server).await.unwrap();
        pool.put(server, first);
        pool.put(server, second);

        let pools = pool.pools.lock().unwrap();
        assert_eq!(pools.get(&server).map(Vec::len), Some(1));
    }
}
