//! Client-side transport action: hash-based server selection routing each field part
//! to a specific server while keeping all parts of one field on the same server. Formulas
//! reproduced from `original_source/src/multio/action/transport/Transport.cc`
//! (`serverIdDenom`, `chooseServer`) one-for-one.

use super::{Action, ActionError, ActionStats};
use crate::config::DistributionKind;
use crate::error::MetadataError;
use crate::message::Message;
use crate::peer::Peer;
use crate::transport::Transport;
use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use tokio::sync::Mutex;

/// `ceil(client_count / server_count)`, collapsing to 1 if there are no servers — the documented
/// behavior when `client_count < server_count`: every client then gets
/// `server_id = 0`.
fn server_id_denom(client_count: usize, server_count: usize) -> usize {
    if server_count == 0 {
        1
    } else {
        (client_count.saturating_sub(1)) / server_count + 1
    }
}

fn string_hash(s: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    s.hash(&mut hasher);
    hasher.finish()
}

struct EvenState {
    counters: Vec<u64>,
    destinations: HashMap<String, Peer>,
}

pub struct ClientTransportAction {
    transport: Arc<dyn Transport>,
    client: Peer,
    server_peers: Vec<Peer>,
    server_id: usize,
    used_server_count: usize,
    hash_keys: Vec<String>,
    distribution: DistributionKind,
    even_state: Mutex<EvenState>,
    stats: ActionStats,
}

impl ClientTransportAction {
    pub fn new(
        transport: Arc<dyn Transport>,
        client_count: usize,
        hash_keys: Vec<String>,
        distribution: DistributionKind,
        used_server_count: usize,
    ) -> Self {
        let server_peers = transport.server_peers().to_vec();
        let server_count = server_peers.len();
        let denom = server_id_denom(client_count, server_count);
        let server_id = transport.local_peer().id() as usize / denom;
        Self {
            client: transport.local_peer().clone(),
            transport,
            server_peers,
            server_id,
            used_server_count: used_server_count.max(1),
            hash_keys,
            distribution,
            even_state: Mutex::new(EvenState {
                counters: vec![0; server_count],
                destinations: HashMap::new(),
            }),
            stats: ActionStats::default(),
        }
    }

    /// Drains every per-destination buffer built up by `buffered_send`. Called before a
    /// `StepComplete` control message is sent, so the step's field parts are guaranteed to be on
    /// the wire first: `StepComplete` is guaranteed to arrive after all `Field` messages of that
    /// step from the same client.
    pub async fn flush_buffers(&self) -> Result<(), crate::error::TransportError> {
        self.transport.flush().await
    }

    fn hash_string(&self, msg: &Message) -> Result<String, MetadataError> {
        use crate::metadata::Value;
        let mut out = String::new();
        for key in &self.hash_keys {
            let raw = msg
                .metadata()
                .get_raw(key)
                .ok_or_else(|| MetadataError::MissingKey(key.clone()))?;
            out.push_str(&match raw {
                Value::Bool(b) => b.to_string(),
                Value::Int(i) => i.to_string(),
                Value::Double(d) => d.to_string(),
                Value::String(s) => s.clone(),
                Value::Nested(_) | Value::List(_) => format!("{raw:?}"),
            });
        }
        Ok(out)
    }

    async fn choose_server(&self, msg: &Message) -> Result<Peer, ActionError> {
        let server_count = self.server_peers.len();
        assert!(server_count > 0, "no server to choose from");
        let hash_string = self.hash_string(msg)?;

        let index = match self.distribution {
            DistributionKind::HashedCyclic => {
                assert!(self.used_server_count <= server_count);
                let offset = (string_hash(&hash_string) as usize) % self.used_server_count;
                (self.server_id + offset) % server_count
            }
            DistributionKind::HashedToSingle => (string_hash(&hash_string) as usize) % server_count,
            DistributionKind::Even => {
                let mut state = self.even_state.lock().await;
                if let Some(peer) = state.destinations.get(&hash_string) {
                    return Ok(peer.clone());
                }
                let (index, _) = state
                    .counters
                    .iter()
                    .enumerate()
                    .min_by_key(|(_, count)| **count)
                    .expect("counters is non-empty");
                state.counters[index] += 1;
                let dest = self.server_peers[index].clone();
                state.destinations.insert(hash_string, dest.clone());
                return Ok(dest);
            }
        };
        Ok(self.server_peers[index].clone())
    }
}

#[async_trait::async_trait]
impl Action for ClientTransportAction {
    async fn execute_impl(&self, msg: Message) -> Result<(), ActionError> {
        let to_all = msg
            .metadata()
            .get_opt::<bool>("toAllServers")?
            .unwrap_or(false);

        if to_all {
            for server in &self.server_peers {
                let fanned = msg.cloned_for(server.clone());
                self.transport.send(fanned).await?;
            }
        } else {
            let server = self.choose_server(&msg).await?;
            let routed = crate::message::Message::new(
                crate::message::Header {
                    tag: msg.tag(),
                    source: self.client.clone(),
                    destination: server,
                    metadata: msg.metadata().clone(),
                },
                msg.payload,
            );
            self.transport.buffered_send(routed).await?;
        }
        Ok(())
    }

    fn next(&self) -> Option<&(dyn Action)> {
        None
    }

    fn stats(&self) -> &ActionStats {
        &self.stats
    }
}
