//! Transport abstraction: send/receive/broadcast of [`Message`]s between [`Peer`]s.
//!
//! Mirrors `ipc::IpcTransport`'s trait — a small `async_trait` virtual surface plus a name-keyed
//! factory — generalized from a connection-id-routed interface to a peer-addressed
//! send/receive/buffer contract.

pub mod tcp;

#[cfg(feature = "mpi")]
pub mod mpi_backend;

use crate::config::TransportKind;
use crate::error::TransportError;
use crate::message::Message;
use crate::peer::Peer;
use async_trait::async_trait;
use std::net::SocketAddr;

/// Default flush threshold for [`Transport::buffered_send`]: 64 MiB.
pub const DEFAULT_BUFFER_THRESHOLD: usize = 64 * 1024 * 1024;

/// Send/receive/broadcast of [`Message`]s between [`Peer`]s. Implementations must guarantee
/// FIFO delivery per (source, destination) pair; no ordering guarantee is required across
/// distinct source peers.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Blocking-delivery semantics for a single destination.
    async fn send(&self, msg: Message) -> Result<(), TransportError>;

    /// Coalesces into a per-destination buffer, flushed automatically past the configured
    /// threshold or explicitly via [`Transport::flush`].
    async fn buffered_send(&self, msg: Message) -> Result<(), TransportError>;

    /// Flushes all per-destination buffers built up by [`Transport::buffered_send`].
    async fn flush(&self) -> Result<(), TransportError>;

    /// Blocks until the next message is available from any peer.
    async fn receive(&self) -> Result<Message, TransportError>;

    /// Records the dial-in address for an outbound peer. A no-op for backends (like MPI) whose
    /// addressing is implicit in the rank space rather than dialed.
    async fn register_peer_address(&self, _peer: Peer, _addr: SocketAddr) {}

    fn local_peer(&self) -> &Peer;

    fn server_peers(&self) -> &[Peer];

    fn client_count(&self) -> usize;

    fn server_count(&self) -> usize {
        self.server_peers().len()
    }
}

/// Name-keyed constructor table for transport backends, mirroring
/// `TransportFactory`.
pub struct TransportFactory;

impl TransportFactory {
    pub async fn create(
        kind: TransportKind,
        local_peer: Peer,
        server_peers: Vec<Peer>,
        client_count: usize,
        bind_host: &str,
        bind_port: u16,
    ) -> anyhow::Result<Box<dyn Transport>> {
        match kind {
            TransportKind::Tcp => {
                let t = tcp::TcpTransport::bind(
                    local_peer,
                    server_peers,
                    client_count,
                    bind_host,
                    bind_port,
                )
                .await?;
                Ok(Box::new(t))
            }
            #[cfg(feature = "mpi")]
            TransportKind::Mpi => {
                let t = mpi_backend::MpiTransport::new(local_peer, server_peers, client_count)?;
                Ok(Box::new(t))
            }
            #[cfg(not(feature = "mpi"))]
            TransportKind::Mpi => Err(anyhow::anyhow!(
                "MPI transport requested but the crate was built without the `mpi` feature"
            )),
        }
    }
}
