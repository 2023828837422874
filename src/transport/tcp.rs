//! TCP backend, adapted from `ipc::tcp_socket::TcpSocketTransport`:
//! same accept-loop-plus-per-connection-reader shape and `socket2` `TCP_NODELAY` tuning,
//! generalized from connection-id routing to peer-addressed send/receive and a
//! length-prefixed framing instead of bincode.

use super::{Transport, DEFAULT_BUFFER_THRESHOLD};
use crate::error::TransportError;
use crate::message::{Message, Tag};
use crate::peer::Peer;
use async_trait::async_trait;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, warn};

/// Connect retry policy: 5 attempts, 10s apart.
pub const CONNECT_RETRIES: u32 = 5;
pub const CONNECT_RETRY_INTERVAL: Duration = Duration::from_secs(10);

struct BufferedQueue {
    messages: Vec<Message>,
    bytes: usize,
}

impl BufferedQueue {
    fn new() -> Self {
        Self {
            messages: Vec::new(),
            bytes: 0,
        }
    }
}

/// TCP transport: a listening endpoint for inbound traffic plus lazily-established outbound
/// connections, one per destination peer, each serialized behind its own lock to preserve FIFO
/// delivery per (source, destination) pair.
pub struct TcpTransport {
    local_peer: Peer,
    server_peers: Vec<Peer>,
    client_count: usize,
    address_book: Mutex<HashMap<Peer, SocketAddr>>,
    outbound: Mutex<HashMap<Peer, TcpStream>>,
    buffers: Mutex<HashMap<Peer, BufferedQueue>>,
    buffer_threshold: usize,
    inbox: Mutex<mpsc::Receiver<Message>>,
    closed: AtomicBool,
}

impl TcpTransport {
    /// Binds the listening endpoint and starts the background accept loop. Outbound peer
    /// addresses are registered separately via [`TcpTransport::register_peer_address`], since
    /// this process may act purely as a receiver (a server only ever accepts).
    pub async fn bind(
        local_peer: Peer,
        server_peers: Vec<Peer>,
        client_count: usize,
        host: &str,
        port: u16,
    ) -> anyhow::Result<Self> {
        let listener = TcpListener::bind((host, port)).await?;
        debug!("TCP transport for {local_peer} listening on {host}:{port}");

        let (inbox_tx, inbox_rx) = mpsc::channel(1024);
        tokio::spawn(accept_loop(listener, inbox_tx));

        Ok(Self {
            local_peer,
            server_peers,
            client_count,
            address_book: Mutex::new(HashMap::new()),
            outbound: Mutex::new(HashMap::new()),
            buffers: Mutex::new(HashMap::new()),
            buffer_threshold: DEFAULT_BUFFER_THRESHOLD,
            inbox: Mutex::new(inbox_rx),
            closed: AtomicBool::new(false),
        })
    }

    pub fn with_buffer_threshold(mut self, threshold: usize) -> Self {
        self.buffer_threshold = threshold;
        self
    }

    async fn ensure_connected(&self, peer: &Peer) -> Result<(), TransportError> {
        if self.outbound.lock().await.contains_key(peer) {
            return Ok(());
        }
        let addr = *self
            .address_book
            .lock()
            .await
            .get(peer)
            .ok_or(TransportError::Unreachable)?;

        let stream = connect_with_retry(addr, CONNECT_RETRIES, CONNECT_RETRY_INTERVAL).await?;
        self.outbound.lock().await.insert(peer.clone(), stream);
        Ok(())
    }

    async fn send_now(&self, destination: Peer, msg: Message) -> Result<(), TransportError> {
        self.ensure_connected(&destination).await?;
        let mut outbound = self.outbound.lock().await;
        let stream = outbound.get_mut(&destination).ok_or(TransportError::Unreachable)?;
        match write_message(stream, &msg).await {
            Ok(()) => Ok(()),
            Err(e) => {
                outbound.remove(&destination);
                Err(e)
            }
        }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn send(&self, msg: Message) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(TransportError::Closed);
        }
        let destination = msg.destination().clone();
        self.send_now(destination, msg).await
    }

    async fn buffered_send(&self, msg: Message) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(TransportError::Closed);
        }
        let destination = msg.destination().clone();
        let should_flush = {
            let mut buffers = self.buffers.lock().await;
            let queue = buffers
                .entry(destination.clone())
                .or_insert_with(BufferedQueue::new);
            queue.bytes += msg.payload.len();
            queue.messages.push(msg);
            queue.bytes >= self.buffer_threshold
        };
        if should_flush {
            self.flush_destination(&destination).await?;
        }
        Ok(())
    }

    async fn flush(&self) -> Result<(), TransportError> {
        let destinations: Vec<Peer> = self.buffers.lock().await.keys().cloned().collect();
        for destination in destinations {
            self.flush_destination(&destination).await?;
        }
        Ok(())
    }

    async fn receive(&self) -> Result<Message, TransportError> {
        let mut inbox = self.inbox.lock().await;
        inbox.recv().await.ok_or(TransportError::Closed)
    }

    async fn register_peer_address(&self, peer: Peer, addr: SocketAddr) {
        self.address_book.lock().await.insert(peer, addr);
    }

    fn local_peer(&self) -> &Peer {
        &self.local_peer
    }

    fn server_peers(&self) -> &[Peer] {
        &self.server_peers
    }

    fn client_count(&self) -> usize {
        self.client_count
    }
}

impl TcpTransport {
    async fn flush_destination(&self, destination: &Peer) -> Result<(), TransportError> {
        let queued = {
            let mut buffers = self.buffers.lock().await;
            buffers
                .get_mut(destination)
                .map(|q| std::mem::take(&mut q.messages))
        };
        let Some(queued) = queued else { return Ok(()) };
        for msg in queued {
            self.send_now(destination.clone(), msg).await?;
        }
        if let Some(queue) = self.buffers.lock().await.get_mut(destination) {
            queue.bytes = 0;
        }
        Ok(())
    }
}

async fn accept_loop(listener: TcpListener, inbox_tx: mpsc::Sender<Message>) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                debug!("accepted TCP connection from {addr}");
                tokio::spawn(read_loop(stream, inbox_tx.clone()));
            }
            Err(e) => {
                error!("TCP accept failed: {e}");
                break;
            }
        }
    }
}

async fn read_loop(mut stream: TcpStream, inbox_tx: mpsc::Sender<Message>) {
    if let Err(e) = configure_socket(&stream) {
        warn!("failed to tune accepted socket: {e}");
    }
    loop {
        match read_message(&mut stream).await {
            Ok(msg) => {
                let is_close = msg.tag() == Tag::Close;
                if inbox_tx.send(msg).await.is_err() {
                    break;
                }
                if is_close {
                    debug!("peer sent Close, unregistering connection");
                    break;
                }
            }
            Err(TransportError::Framing(reason)) => {
                warn!("closing connection after framing error: {reason}");
                break;
            }
            Err(e) => {
                debug!("connection closed: {e}");
                break;
            }
        }
    }
}

fn configure_socket(stream: &TcpStream) -> std::io::Result<()> {
    let sock = socket2::SockRef::from(stream);
    sock.set_nodelay(true)
}

async fn connect_with_retry(
    addr: SocketAddr,
    attempts: u32,
    interval: Duration,
) -> Result<TcpStream, TransportError> {
    let mut last_err = None;
    for attempt in 1..=attempts {
        match TcpStream::connect(addr).await {
            Ok(stream) => {
                configure_socket(&stream).map_err(TransportError::Io)?;
                return Ok(stream);
            }
            Err(e) => {
                warn!("connect attempt {attempt}/{attempts} to {addr} failed: {e}");
                last_err = Some(e);
                if attempt < attempts {
                    tokio::time::sleep(interval).await;
                }
            }
        }
    }
    Err(TransportError::Io(last_err.unwrap_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::Other, "connect failed")
    })))
}

async fn write_message(stream: &mut TcpStream, msg: &Message) -> Result<(), TransportError> {
    let framed = msg.to_bytes();
    stream.write_all(&framed).await.map_err(TransportError::Io)?;
    stream.flush().await.map_err(TransportError::Io)
}

/// A `read_exact` that hits EOF before filling its buffer is a truncated message, not a plain
/// I/O failure: classify it as `TransportError::Framing` so the caller closes just this
/// connection and keeps serving other peers, per the framing-resync contract.
fn classify_read_error(e: std::io::Error) -> TransportError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        TransportError::Framing(format!("short read: {e}"))
    } else {
        TransportError::Io(e)
    }
}

async fn read_message(stream: &mut TcpStream) -> Result<Message, TransportError> {
    let mut size_buf = [0u8; 8];
    stream
        .read_exact(&mut size_buf)
        .await
        .map_err(classify_read_error)?;
    let size = u64::from_le_bytes(size_buf) as usize;

    const MAX_MESSAGE_SIZE: usize = 256 * 1024 * 1024;
    if size > MAX_MESSAGE_SIZE {
        return Err(TransportError::Framing(format!(
            "message size {size} exceeds maximum {MAX_MESSAGE_SIZE}"
        )));
    }

    let mut body = vec![0u8; size];
    stream.read_exact(&mut body).await.map_err(classify_read_error)?;
    Message::from_body_bytes(&body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Header;
    use crate::metadata::Metadata;

    async fn pick_local_addr() -> SocketAddr {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        listener.local_addr().unwrap()
    }

    fn test_message(from: &Peer, to: &Peer, payload: Vec<u8>) -> Message {
        Message::new(
            Header {
                tag: Tag::Field,
                source: from.clone(),
                destination: to.clone(),
                metadata: Metadata::new(),
            },
            payload,
        )
    }

    #[tokio::test]
    async fn send_and_receive_round_trip() {
        let server_peer = Peer::new("server", 0);
        let client_peer = Peer::new("client", 0);

        let server_addr = pick_local_addr().await;
        let server = TcpTransport::bind(
            server_peer.clone(),
            vec![],
            1,
            &server_addr.ip().to_string(),
            server_addr.port(),
        )
        .await
        .unwrap();

        let client_addr = pick_local_addr().await;
        let client = TcpTransport::bind(
            client_peer.clone(),
            vec![server_peer.clone()],
            1,
            &client_addr.ip().to_string(),
            client_addr.port(),
        )
        .await
        .unwrap();
        client.register_peer_address(server_peer.clone(), server_addr).await;

        let msg = test_message(&client_peer, &server_peer, vec![1, 2, 3]);
        client.send(msg.clone()).await.unwrap();

        let received = server.receive().await.unwrap();
        assert_eq!(received.payload, vec![1, 2, 3]);
        assert_eq!(received.source(), &client_peer);
    }

    #[tokio::test]
    async fn buffered_send_flushes_past_threshold() {
        let server_peer = Peer::new("server", 0);
        let client_peer = Peer::new("client", 0);

        let server_addr = pick_local_addr().await;
        let server = TcpTransport::bind(
            server_peer.clone(),
            vec![],
            1,
            &server_addr.ip().to_string(),
            server_addr.port(),
        )
        .await
        .unwrap();

        let client_addr = pick_local_addr().await;
        let client = TcpTransport::bind(
            client_peer.clone(),
            vec![server_peer.clone()],
            1,
            &client_addr.ip().to_string(),
            client_addr.port(),
        )
        .await
        .unwrap()
        .with_buffer_threshold(4); // tiny threshold forces an immediate flush
        client.register_peer_address(server_peer.clone(), server_addr).await;

        let msg = test_message(&client_peer, &server_peer, vec![1, 2, 3, 4, 5]);
        client.buffered_send(msg).await.unwrap();

        let received = server.receive().await.unwrap();
        assert_eq!(received.payload, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn read_message_classifies_a_truncated_body_as_a_framing_error() {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let addr = listener.local_addr().unwrap();

        let mut client = TcpStream::connect(addr).await.unwrap();
        let (mut accepted, _) = listener.accept().await.unwrap();

        let msg = test_message(&Peer::new("client", 0), &Peer::new("server", 0), vec![1, 2, 3]);
        let framed = msg.to_bytes();
        // Claim the full body length in the size prefix but only write half of it, then close.
        client.write_all(&framed[..framed.len() - 1]).await.unwrap();
        client.shutdown().await.unwrap();
        drop(client);

        let err = read_message(&mut accepted).await.unwrap_err();
        assert!(matches!(err, TransportError::Framing(_)), "expected Framing, got {err:?}");
    }

    #[tokio::test]
    async fn framing_error_on_one_connection_does_not_stop_the_server_accepting_others() {
        let server_peer = Peer::new("server", 0);
        let server_addr = pick_local_addr().await;
        let server = TcpTransport::bind(
            server_peer.clone(),
            vec![],
            2,
            &server_addr.ip().to_string(),
            server_addr.port(),
        )
        .await
        .unwrap();

        // First connection: a valid message followed by a truncated one, then the socket closes.
        let mut bad_conn = TcpStream::connect(server_addr).await.unwrap();
        let good_msg = test_message(&Peer::new("client", 0), &server_peer, vec![9, 9]);
        bad_conn.write_all(&good_msg.to_bytes()).await.unwrap();

        let truncated = test_message(&Peer::new("client", 0), &server_peer, vec![1, 2, 3, 4, 5]);
        let framed = truncated.to_bytes();
        bad_conn.write_all(&framed[..framed.len() - 2]).await.unwrap();
        bad_conn.shutdown().await.unwrap();
        drop(bad_conn);

        let received = server.receive().await.unwrap();
        assert_eq!(received.payload, vec![9, 9]);

        // The framing error closed only that connection; a second connection still works.
        let client_peer = Peer::new("client", 1);
        let client_addr = pick_local_addr().await;
        let client = TcpTransport::bind(
            client_peer.clone(),
            vec![server_peer.clone()],
            1,
            &client_addr.ip().to_string(),
            client_addr.port(),
        )
        .await
        .unwrap();
        client.register_peer_address(server_peer.clone(), server_addr).await;

        let msg = test_message(&client_peer, &server_peer, vec![7, 7, 7]);
        client.send(msg).await.unwrap();

        let received = server.receive().await.unwrap();
        assert_eq!(received.payload, vec![7, 7, 7]);
        assert_eq!(received.source(), &client_peer);
    }
}
