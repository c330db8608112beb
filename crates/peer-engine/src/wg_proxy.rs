use std::net::SocketAddr;

use async_trait::async_trait;
use bytes::BytesMut;
use tokio::io::AsyncRead;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWrite;
use tokio::io::AsyncWriteExt;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;

use crate::error::WgError;

/// A byte-stream transport produced by a TURN candidate or the relay
/// server, bridged to WireGuard by [`WgProxy`] (spec.md §4.6).
pub trait TurnStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}
impl<T> TurnStream for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// Bridges a `net.Conn`-style byte stream to WireGuard by presenting a
/// loopback UDP endpoint: bytes read from the stream are forwarded to WG's
/// listen port, and WG's outbound UDP on that loopback port is forwarded
/// back into the stream (spec.md §4.6). Grounded on the UDP-socket/stream
/// bridging pattern of this pack's WireGuard event loop example
/// (`sockrats`' `transport/wireguard/event_loop.rs`).
#[async_trait]
pub trait WgProxy: Send {
    /// Starts the two-way forwarder and returns the loopback UDP address to
    /// hand to `WgInterface::update_peer` as the new endpoint.
    async fn add_turn_conn(&mut self, stream: Box<dyn TurnStream>) -> Result<SocketAddr, WgError>;

    /// Terminates the forwarder and frees the loopback port.
    async fn close_conn(&mut self) -> Result<(), WgError>;
}

/// Constructs fresh [`WgProxy`] instances. A new proxy is created per
/// transport-install attempt so the old one can keep forwarding until the
/// new one is confirmed up (spec.md §4.6 "installed before the old is
/// closed").
pub trait WgProxyFactory: Send + Sync {
    fn new_proxy(&self) -> Box<dyn WgProxy>;
}

pub struct LoopbackWgProxyFactory {
    pub wg_listen_port: u16,
}

impl WgProxyFactory for LoopbackWgProxyFactory {
    fn new_proxy(&self) -> Box<dyn WgProxy> {
        Box::new(LoopbackWgProxy::new(self.wg_listen_port))
    }
}

pub struct LoopbackWgProxy {
    wg_listen_port: u16,
    forwarder: Option<JoinHandle<()>>,
}

impl LoopbackWgProxy {
    pub fn new(wg_listen_port: u16) -> Self {
        Self {
            wg_listen_port,
            forwarder: None,
        }
    }
}

#[async_trait]
impl WgProxy for LoopbackWgProxy {
    async fn add_turn_conn(&mut self, stream: Box<dyn TurnStream>) -> Result<SocketAddr, WgError> {
        let socket = UdpSocket::bind(("127.0.0.1", 0))
            .await
            .map_err(|e| WgError::UpdatePeer(format!("bind loopback proxy socket: {e}")))?;
        let local_addr = socket
            .local_addr()
            .map_err(|e| WgError::UpdatePeer(format!("read loopback proxy addr: {e}")))?;
        socket
            .connect(("127.0.0.1", self.wg_listen_port))
            .await
            .map_err(|e| WgError::UpdatePeer(format!("connect loopback proxy socket: {e}")))?;

        let (mut stream_rx, mut stream_tx) = tokio::io::split(stream);

        let task = tokio::spawn(async move {
            let mut from_wg = BytesMut::zeroed(65_536);
            let mut from_stream = BytesMut::zeroed(65_536);
            loop {
                tokio::select! {
                    res = socket.recv(&mut from_wg) => {
                        match res {
                            Ok(n) if stream_tx.write_all(&from_wg[..n]).await.is_ok() => {}
                            _ => break,
                        }
                    }
                    res = stream_rx.read(&mut from_stream) => {
                        match res {
                            Ok(n) if n > 0 && socket.send(&from_stream[..n]).await.is_ok() => {}
                            _ => break,
                        }
                    }
                }
            }
            tracing::debug!("WireGuard TURN proxy forwarder stopped");
        });

        self.forwarder = Some(task);
        Ok(local_addr)
    }

    async fn close_conn(&mut self) -> Result<(), WgError> {
        if let Some(task) = self.forwarder.take() {
            task.abort();
        }
        Ok(())
    }
}

impl Drop for LoopbackWgProxy {
    fn drop(&mut self) {
        if let Some(task) = self.forwarder.take() {
            task.abort();
        }
    }
}
