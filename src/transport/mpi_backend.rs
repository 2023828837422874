//! MPI backend (feature `mpi`, one of the pluggable transport backends), grounded on the published `mpi`
//! crate's point-to-point API shown in
//! `examples/other_examples/b8fe9af4_rsmpi-rsmpi__src-point_to_point.rs.rs`
//! (`Source::matched_probe`/`matched_receive_into`, `Destination::send_with_tag`).
//!
//! `libmpi` without an `MPI_THREAD_MULTIPLE` build is not safe to call concurrently from more
//! than one thread, so unlike [`super::tcp::TcpTransport`] this backend does not spawn one task
//! per peer. A single dedicated OS thread owns the `SystemCommunicator` and alternates between
//! draining a queue of outbound sends and polling for inbound messages; [`MpiTransport`] only
//! ever talks to that thread over channels.

use super::{Transport, DEFAULT_BUFFER_THRESHOLD};
use crate::error::TransportError;
use crate::message::{Message, Tag};
use crate::peer::Peer;
use async_trait::async_trait;
use mpi::topology::SystemCommunicator;
use mpi::traits::*;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc as std_mpsc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

/// All fieldmux traffic shares one MPI tag; framing, not tag matching, disambiguates messages.
const WIRE_TAG: i32 = 7;
const POLL_INTERVAL: Duration = Duration::from_millis(1);

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

enum MpiCommand {
    Send { destination_rank: i32, body: Vec<u8> },
}

/// MPI transport: peer ids are MPI ranks in the world communicator. Outbound sends are queued to
/// the event-loop thread; inbound messages arrive on `inbox` the same way [`TcpTransport`]'s
/// accept loop feeds its own.
///
/// [`TcpTransport`]: super::tcp::TcpTransport
pub struct MpiTransport {
    local_peer: Peer,
    server_peers: Vec<Peer>,
    client_count: usize,
    buffers: Mutex<HashMap<Peer, BufferedQueue>>,
    buffer_threshold: usize,
    inbox: Mutex<mpsc::Receiver<Message>>,
    outbound: std_mpsc::Sender<MpiCommand>,
    closed: AtomicBool,
}

impl MpiTransport {
    pub fn new(local_peer: Peer, server_peers: Vec<Peer>, client_count: usize) -> anyhow::Result<Self> {
        let universe = mpi::initialize()
            .ok_or_else(|| anyhow::anyhow!("MPI_Init failed or was already called on this process"))?;
        let world = universe.world();
        debug!(
            "MPI transport for {local_peer} bound to rank {} of {}",
            world.rank(),
            world.size()
        );

        let (inbox_tx, inbox_rx) = mpsc::channel(1024);
        let (outbound_tx, outbound_rx) = std_mpsc::channel();

        std::thread::spawn(move || {
            let _keep_alive = universe;
            event_loop(world, inbox_tx, outbound_rx);
        });

        Ok(Self {
            local_peer,
            server_peers,
            client_count,
            buffers: Mutex::new(HashMap::new()),
            buffer_threshold: DEFAULT_BUFFER_THRESHOLD,
            inbox: Mutex::new(inbox_rx),
            outbound: outbound_tx,
            closed: AtomicBool::new(false),
        })
    }

    fn send_now(&self, destination: Peer, msg: Message) -> Result<(), TransportError> {
        let framed = msg.to_bytes();
        let body = framed[8..].to_vec();
        self.outbound
            .send(MpiCommand::Send {
                destination_rank: destination.id() as i32,
                body,
            })
            .map_err(|_| TransportError::Closed)
    }
}

#[async_trait]
impl Transport for MpiTransport {
    async fn send(&self, msg: Message) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(TransportError::Closed);
        }
        let destination = msg.destination().clone();
        self.send_now(destination, msg)
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

impl MpiTransport {
    async fn flush_destination(&self, destination: &Peer) -> Result<(), TransportError> {
        let queued = {
            let mut buffers = self.buffers.lock().await;
            buffers
                .get_mut(destination)
                .map(|q| std::mem::take(&mut q.messages))
        };
        let Some(queued) = queued else { return Ok(()) };
        for msg in queued {
            self.send_now(destination.clone(), msg)?;
        }
        if let Some(queue) = self.buffers.lock().await.get_mut(destination) {
            queue.bytes = 0;
        }
        Ok(())
    }
}

/// Runs on its own dedicated thread for the lifetime of the process: the only thread allowed to
/// touch `world`. Drains queued sends, then polls once for an inbound message, then sleeps —
/// never blocks indefinitely, so a flood of outbound sends cannot starve inbound delivery.
fn event_loop(
    world: SystemCommunicator,
    inbox_tx: mpsc::Sender<Message>,
    outbound_rx: std_mpsc::Receiver<MpiCommand>,
) {
    loop {
        while let Ok(cmd) = outbound_rx.try_recv() {
            match cmd {
                MpiCommand::Send { destination_rank, body } => {
                    world.process_at_rank(destination_rank).send_with_tag(&body[..], WIRE_TAG);
                }
            }
        }

        if let Some((probed, status)) = world.any_process().immediate_matched_probe_with_tag(WIRE_TAG) {
            let count = status.count(u8::equivalent_datatype()) as usize;
            let mut buf = vec![0u8; count];
            probed.matched_receive_into(&mut buf[..]);

            match Message::from_body_bytes(&buf) {
                Ok(decoded) => {
                    if decoded.tag() == Tag::Close {
                        debug!("Close received from {}, continuing to serve other peers", decoded.source());
                    }
                    if inbox_tx.blocking_send(decoded).is_err() {
                        break;
                    }
                }
                Err(e) => warn!("dropping malformed MPI message: {e}"),
            }
            continue;
        }

        std::thread::sleep(POLL_INTERVAL);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_tag_and_poll_interval_are_sane() {
        assert!(WIRE_TAG >= 0);
        assert!(POLL_INTERVAL.as_millis() > 0);
    }
}
