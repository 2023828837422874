//! Client facade: the client-visible entry points, all serialized behind one `tokio::sync::Mutex`,
//! with a scoped timer recording elapsed time on every exit path even when the guarded call
//! errors, the same `std::lock_guard`-around-every-public-method and RAII-timer shape as
//! `multio::MultIO`'s `StatsTimer` around `write`/`flush`/the `i*fdb` family.

use crate::action::client_transport::ClientTransportAction;
use crate::action::Action;
use crate::config::Config;
use crate::message::{Header, Message, Tag};
use crate::metadata::Metadata;
use crate::peer::Peer;
use crate::transport::{Transport, TransportFactory};
use anyhow::Context;
use std::sync::Arc;
use std::time::Instant;
use tracing::info;

/// Wall-time and invocation count for one client-facing operation, recorded by [`ScopedTiming`]
/// on every exit path.
#[derive(Default)]
pub struct OperationStats {
    invocations: std::sync::atomic::AtomicU64,
    total_nanos: std::sync::atomic::AtomicU64,
}

impl OperationStats {
    fn record(&self, elapsed: std::time::Duration) {
        self.invocations.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        self.total_nanos
            .fetch_add(elapsed.as_nanos() as u64, std::sync::atomic::Ordering::Relaxed);
    }

    pub fn invocations(&self) -> u64 {
        self.invocations.load(std::sync::atomic::Ordering::Relaxed)
    }
}

/// Per-operation wall-time and invocation counters, mirroring `IOStats`'s per-call tallies.
#[derive(Default)]
pub struct ClientStats {
    pub open: OperationStats,
    pub close: OperationStats,
    pub write_field: OperationStats,
    pub write_grib: OperationStats,
    pub flush: OperationStats,
    pub notify: OperationStats,
}

struct ScopedTiming<'a> {
    started: Instant,
    stats: &'a OperationStats,
}

impl<'a> ScopedTiming<'a> {
    fn start(stats: &'a OperationStats) -> Self {
        Self {
            started: Instant::now(),
            stats,
        }
    }
}

impl Drop for ScopedTiming<'_> {
    fn drop(&mut self) {
        self.stats.record(self.started.elapsed());
    }
}

struct ClientState {
    transport_action: ClientTransportAction,
    local_peer: Peer,
    opened: bool,
}

/// The client-visible entry points: `write_field`, `write_grib`, `flush`, `notify`,
/// `open`/`close`. Owns its transport action exclusively — never shared across facade instances.
pub struct FieldmuxClient {
    state: tokio::sync::Mutex<ClientState>,
    stats: ClientStats,
}

impl FieldmuxClient {
    pub async fn new(config: &Config, bind_host: &str, bind_port: u16, client_id: u64) -> anyhow::Result<Self> {
        let local_peer = Peer::new(config.group.clone(), client_id);
        let server_peers: Vec<Peer> = (0..config.server_count())
            .map(|i| Peer::new("server", i as u64))
            .collect();

        let transport: Arc<dyn Transport> = Arc::from(
            TransportFactory::create(
                config.transport,
                local_peer.clone(),
                server_peers,
                config.count,
                bind_host,
                bind_port,
            )
            .await?,
        );

        if config.transport == crate::config::TransportKind::Tcp {
            for (peer, addr) in resolve_server_addresses(config).await? {
                transport.register_peer_address(peer, addr).await;
            }
        }

        let transport_action = ClientTransportAction::new(
            transport,
            config.count,
            config.hash_keys.clone(),
            config.distribution,
            config.used_server_count,
        );

        Ok(Self {
            state: tokio::sync::Mutex::new(ClientState {
                transport_action,
                local_peer,
                opened: false,
            }),
            stats: ClientStats::default(),
        })
    }

    pub async fn open(&self) -> anyhow::Result<()> {
        let mut state = self.state.lock().await;
        let _timing = ScopedTiming::start(&self.stats.open);
        let msg = control_message(Tag::Open, &state.local_peer);
        state.transport_action.execute(msg).await?;
        state.opened = true;
        Ok(())
    }

    pub async fn close(&self) -> anyhow::Result<()> {
        let mut state = self.state.lock().await;
        let _timing = ScopedTiming::start(&self.stats.close);
        state.transport_action.flush_buffers().await?;
        let msg = control_message(Tag::Close, &state.local_peer);
        state.transport_action.execute(msg).await?;
        state.opened = false;
        Ok(())
    }

    /// Registers this client's local-to-global index translation for `domain_name`, fanned out to
    /// every configured server, since domain maps are installed per server process.
    pub async fn write_domain(
        &self,
        domain_name: &str,
        global_size: usize,
        indices: Vec<usize>,
        expected_peers: usize,
    ) -> anyhow::Result<()> {
        let mut metadata = Metadata::new();
        metadata.set("domain", domain_name);
        metadata.set("global_size", global_size as i64);
        metadata.set("expected_peers", expected_peers as i64);
        metadata.set(
            "indices",
            crate::metadata::Value::List(indices.into_iter().map(|i| crate::metadata::Value::Int(i as i64)).collect()),
        );
        metadata.set("toAllServers", true);

        let state = self.state.lock().await;
        let msg = Message::new(
            Header {
                tag: Tag::Domain,
                source: state.local_peer.clone(),
                destination: Peer::new("server", 0),
                metadata,
            },
            vec![],
        );
        state.transport_action.execute(msg).await?;
        Ok(())
    }

    pub async fn write_field(&self, metadata: Metadata, data: &[f64]) -> anyhow::Result<()> {
        let payload = data.iter().flat_map(|v| v.to_le_bytes()).collect();
        let state = self.state.lock().await;
        let _timing = ScopedTiming::start(&self.stats.write_field);
        let msg = Message::new(
            Header {
                tag: Tag::Field,
                source: state.local_peer.clone(),
                destination: Peer::new("server", 0),
                metadata,
            },
            payload,
        );
        state.transport_action.execute(msg).await?;
        Ok(())
    }

    pub async fn write_grib(&self, metadata: Metadata, bytes: Vec<u8>) -> anyhow::Result<()> {
        let state = self.state.lock().await;
        let _timing = ScopedTiming::start(&self.stats.write_grib);
        let msg = Message::new(
            Header {
                tag: Tag::Grib,
                source: state.local_peer.clone(),
                destination: Peer::new("server", 0),
                metadata,
            },
            bytes,
        );
        state.transport_action.execute(msg).await?;
        Ok(())
    }

    pub async fn flush(&self, mut metadata: Metadata) -> anyhow::Result<()> {
        let state = self.state.lock().await;
        let _timing = ScopedTiming::start(&self.stats.flush);
        state.transport_action.flush_buffers().await?;
        metadata.try_set("toAllServers", true);
        let msg = Message::new(
            Header {
                tag: Tag::StepComplete,
                source: state.local_peer.clone(),
                destination: Peer::new("server", 0),
                metadata,
            },
            vec![],
        );
        state.transport_action.execute(msg).await?;
        Ok(())
    }

    pub async fn notify(&self, mut metadata: Metadata, event_name: &str) -> anyhow::Result<()> {
        let state = self.state.lock().await;
        let _timing = ScopedTiming::start(&self.stats.notify);
        metadata.set("event", event_name);
        let msg = Message::new(
            Header {
                tag: Tag::StatisticsUpdate,
                source: state.local_peer.clone(),
                destination: Peer::new("server", 0),
                metadata,
            },
            vec![],
        );
        state.transport_action.execute(msg).await?;
        info!("notify '{event_name}' sent");
        Ok(())
    }

    pub fn stats(&self) -> &ClientStats {
        &self.stats
    }

    pub fn version() -> &'static str {
        env!("CARGO_PKG_VERSION")
    }
}

/// Flattens `config.servers[*].ports` into the same `server:0, server:1, ...` numbering used
/// everywhere else and resolves each to a dialable address, so a TCP-backed client can
/// populate its address book before the first send.
async fn resolve_server_addresses(config: &Config) -> anyhow::Result<Vec<(Peer, std::net::SocketAddr)>> {
    let mut out = Vec::new();
    let mut index = 0u64;
    for group in &config.servers {
        for &port in &group.ports {
            let addr = tokio::net::lookup_host((group.host.as_str(), port))
                .await?
                .next()
                .with_context(|| format!("could not resolve server address {}:{port}", group.host))?;
            out.push((Peer::new("server", index), addr));
            index += 1;
        }
    }
    Ok(out)
}

/// `Open`/`Close` are fanned to every configured server: a client's field parts may be routed to
/// any server under hash distribution, so every server must see a client's full session lifecycle.
/// This bypasses the hash-based single-server routing that field/grib writes use.
fn control_message(tag: Tag, local_peer: &Peer) -> Message {
    let mut metadata = Metadata::new();
    metadata.set("toAllServers", true);
    Message::new(
        Header {
            tag,
            source: local_peer.clone(),
            destination: Peer::new("server", 0),
            metadata,
        },
        vec![],
    )
}
