//! Pluggable "raw socket / datagram transport" the engine calls into.
//!
//! Out of scope per spec §1 ("the raw socket / datagram transport... delivers opaque bytes with a
//! source address"), but the engine needs *something* concrete to send/receive through.
//! [`Transport`] is the seam, grounded in the teacher's own pluggable-backend pattern
//! (`event::EventQueue` trait with swappable `BasicEventQueue`/`ConcurrentEventQueue`
//! implementations): [`UdpTransport`] is the production default, [`ChannelTransport`] an
//! in-memory loopback for tests that never touches a real socket.

use std::collections::HashMap;
use std::future::Future;
use std::net::{IpAddr, Ipv4Addr};
use std::pin::Pin;
use std::sync::Arc;

use parking_lot::Mutex as SyncMutex;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Mutex as AsyncMutex};

/// A boxed, `Send` future — this crate's stand-in for `async fn` in a trait object, since trait
/// objects here need to be stored behind `Arc<dyn Transport>` in [`crate::engine::Engine`].
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Delivers opaque bytes with a source address, and can be asked to send some.
pub trait Transport: Send + Sync {
    /// Send `bytes` to `dst`. A single send failure is a [`crate::error`] `LinkDown`-class event:
    /// the caller logs it and continues (spec §4.5, §7) rather than treating it as fatal.
    fn send_to<'a>(&'a self, dst: Ipv4Addr, bytes: Vec<u8>) -> BoxFuture<'a, std::io::Result<()>>;

    /// Receive the next datagram and the address it arrived from.
    fn recv<'a>(&'a self) -> BoxFuture<'a, std::io::Result<(Ipv4Addr, Vec<u8>)>>;
}

/// Production transport: a real UDP socket bound to `ntk_udp_port`, talking to peers on the same
/// port (spec §6).
#[derive(Debug)]
pub struct UdpTransport {
    socket: UdpSocket,
    port: u16,
}

impl UdpTransport {
    /// Bind a UDP socket on `port`, on every local interface.
    pub async fn bind(port: u16) -> std::io::Result<Self> {
        let socket = UdpSocket::bind(("0.0.0.0", port)).await?;
        Ok(Self { socket, port })
    }
}

impl Transport for UdpTransport {
    fn send_to<'a>(&'a self, dst: Ipv4Addr, bytes: Vec<u8>) -> BoxFuture<'a, std::io::Result<()>> {
        Box::pin(async move {
            self.socket.send_to(&bytes, (dst, self.port)).await?;
            Ok(())
        })
    }

    fn recv<'a>(&'a self) -> BoxFuture<'a, std::io::Result<(Ipv4Addr, Vec<u8>)>> {
        Box::pin(async move {
            let mut buf = vec![0u8; u16::MAX as usize];
            let (n, from) = self.socket.recv_from(&mut buf).await?;
            buf.truncate(n);
            match from.ip() {
                IpAddr::V4(v4) => Ok((v4, buf)),
                IpAddr::V6(_) => Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    "qspn-engine only speaks IPv4",
                )),
            }
        })
    }
}

/// Shared registry behind every [`ChannelTransport`] drawn from the same [`ChannelNetwork`] — the
/// in-memory equivalent of "packets addressed to this IP arrive at this socket".
#[derive(Clone, Default)]
pub struct ChannelNetwork {
    routes: Arc<SyncMutex<HashMap<Ipv4Addr, mpsc::UnboundedSender<(Ipv4Addr, Vec<u8>)>>>>,
}

impl ChannelNetwork {
    /// An empty network with no registered addresses yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `addr` and hand back its transport. Registering the same address twice replaces
    /// the previous receiver, exactly as binding a second real socket to an address would.
    pub fn transport(&self, addr: Ipv4Addr) -> ChannelTransport {
        let (tx, rx) = mpsc::unbounded_channel();
        self.routes.lock().insert(addr, tx);
        ChannelTransport {
            addr,
            network: self.clone(),
            rx: AsyncMutex::new(rx),
        }
    }
}

/// In-memory loopback transport for tests and simulations: `send_to` looks the destination up in
/// the shared [`ChannelNetwork`] and posts directly to its channel, with no serialization round
/// trip through an actual socket.
pub struct ChannelTransport {
    addr: Ipv4Addr,
    network: ChannelNetwork,
    rx: AsyncMutex<mpsc::UnboundedReceiver<(Ipv4Addr, Vec<u8>)>>,
}

impl ChannelTransport {
    /// The address this transport answers to.
    pub fn address(&self) -> Ipv4Addr {
        self.addr
    }
}

impl Transport for ChannelTransport {
    fn send_to<'a>(&'a self, dst: Ipv4Addr, bytes: Vec<u8>) -> BoxFuture<'a, std::io::Result<()>> {
        Box::pin(async move {
            let tx = self.network.routes.lock().get(&dst).cloned();
            match tx {
                Some(tx) => {
                    let _ = tx.send((self.addr, bytes));
                    Ok(())
                }
                None => Err(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("no registered peer at {dst}"),
                )),
            }
        })
    }

    fn recv<'a>(&'a self) -> BoxFuture<'a, std::io::Result<(Ipv4Addr, Vec<u8>)>> {
        Box::pin(async move {
            self.rx.lock().await.recv().await.ok_or_else(|| {
                std::io::Error::new(std::io::ErrorKind::BrokenPipe, "channel network torn down")
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn channel_transport_delivers_to_the_registered_peer() {
        let net = ChannelNetwork::new();
        let a = net.transport(Ipv4Addr::new(10, 0, 0, 1));
        let b = net.transport(Ipv4Addr::new(10, 0, 0, 2));

        a.send_to(b.address(), vec![1, 2, 3]).await.unwrap();
        let (from, bytes) = b.recv().await.unwrap();
        assert_eq!(from, a.address());
        assert_eq!(bytes, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn channel_transport_errors_on_unknown_destination() {
        let net = ChannelNetwork::new();
        let a = net.transport(Ipv4Addr::new(10, 0, 0, 1));
        let err = a
            .send_to(Ipv4Addr::new(10, 0, 0, 99), vec![0])
            .await
            .unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::NotFound);
    }
}
