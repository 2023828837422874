//! Dispatcher and server main loop, grounded on `multio::server::Dispatcher`
//! (`registeredPlans_`, `feedPlan`, `listen`): an ordered list of plans, every matching plan fed
//! on each received message, driven here by a top-level orchestration loop over received
//! transport messages.

use crate::config::Config;
use crate::domain::{DomainDescriptor, DomainMapRegistry};
use crate::error::DomainError;
use crate::message::{Message, Tag};
use crate::metadata::Value;
use crate::peer::Peer;
use crate::plan::Plan;
use crate::transport::Transport;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{info, warn};

/// Owns every configured [`Plan`] and feeds each received message to every plan that matches it.
pub struct Dispatcher {
    plans: Vec<Plan>,
}

impl Dispatcher {
    pub fn from_config(
        config: &Config,
        domain_maps: Arc<DomainMapRegistry>,
    ) -> anyhow::Result<Self> {
        let expected_peers = config.count;
        let plans = config
            .plans
            .iter()
            .map(|p| {
                Plan::build(
                    p,
                    domain_maps.clone(),
                    expected_peers,
                    &config.hash_keys,
                    &config.group,
                )
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { plans })
    }

    /// Feeds `msg` to every plan whose predicate matches it. A field may feed multiple plans.
    pub async fn feed(&self, msg: Message) {
        for plan in &self.plans {
            if plan.matches(&msg) {
                if let Err(e) = plan.feed(msg.clone()).await {
                    warn!("plan '{}' failed to process message: {e}", plan.name());
                }
            }
        }
    }
}

/// Runs the server event loop: `while not stopped: msg = transport.receive(); dispatcher.feed(msg)`,
/// stopping once every known client has sent `Close`. `Domain` messages are a side channel onto
/// `domain_maps`, installed on receipt at server startup, rather than plan content, and never
/// reach the plans.
pub async fn run_server(
    transport: Arc<dyn Transport>,
    dispatcher: Dispatcher,
    domain_maps: Arc<DomainMapRegistry>,
    expected_clients: usize,
) -> anyhow::Result<()> {
    let mut closed: HashSet<Peer> = HashSet::new();
    info!(
        "server {} listening for {} client(s)",
        transport.local_peer(),
        expected_clients
    );

    loop {
        let msg = match transport.receive().await {
            Ok(msg) => msg,
            Err(e) => {
                warn!("transport receive failed, stopping server loop: {e}");
                break;
            }
        };

        if msg.tag() == Tag::Domain {
            if let Err(e) = install_domain(&domain_maps, &msg).await {
                warn!("dropping malformed domain message from {}: {e}", msg.source());
            }
            continue;
        }

        if msg.tag() == Tag::Close {
            closed.insert(msg.source().clone());
        }
        let is_close = msg.tag() == Tag::Close;
        dispatcher.feed(msg).await;

        if is_close && closed.len() >= expected_clients {
            info!("all clients closed, stopping server loop");
            break;
        }
    }
    Ok(())
}

async fn install_domain(domain_maps: &DomainMapRegistry, msg: &Message) -> Result<(), DomainError> {
    let domain_name = msg
        .metadata()
        .get::<&str>("domain")
        .map_err(|_| DomainError::UnknownDomain("<missing domain name>".to_string()))?
        .to_string();
    let global_size = msg
        .metadata()
        .get::<i64>("global_size")
        .map_err(|_| DomainError::GlobalSizeMismatch {
            domain: domain_name.clone(),
            expected: 0,
            got: 0,
        })? as usize;
    let expected_peers = msg.metadata().get_opt::<i64>("expected_peers").ok().flatten().unwrap_or(0) as usize;
    let indices_raw = msg
        .metadata()
        .get::<&[Value]>("indices")
        .map_err(|_| DomainError::GlobalSizeMismatch {
            domain: domain_name.clone(),
            expected: global_size,
            got: 0,
        })?;
    let indices: Vec<usize> = indices_raw
        .iter()
        .filter_map(|v| match v {
            Value::Int(i) => Some(*i as usize),
            _ => None,
        })
        .collect();

    let descriptor = DomainDescriptor::new(global_size, indices);
    domain_maps
        .install(&domain_name, msg.source().clone(), descriptor, expected_peers)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Header;
    use crate::metadata::Metadata;

    fn domain_message(source: Peer, indices: Vec<i64>) -> Message {
        let mut metadata = Metadata::new();
        metadata.set("domain", "grid");
        metadata.set("global_size", 8_i64);
        metadata.set("expected_peers", 2_i64);
        metadata.set(
            "indices",
            Value::List(indices.into_iter().map(Value::Int).collect()),
        );
        Message::new(
            Header {
                tag: Tag::Domain,
                source,
                destination: Peer::new("server", 0),
                metadata,
            },
            vec![],
        )
    }

    #[tokio::test]
    async fn install_domain_registers_a_descriptor_for_its_source_peer() {
        let registry = DomainMapRegistry::new();
        let client = Peer::new("client", 0);
        install_domain(&registry, &domain_message(client.clone(), vec![0, 1, 2, 3]))
            .await
            .unwrap();

        let size = registry
            .with_domain("grid", |map| map.get(&client).map(|d| d.global_size()))
            .await
            .unwrap();
        assert_eq!(size, Some(8));
    }

    #[tokio::test]
    async fn install_domain_rejects_a_message_missing_the_domain_name() {
        let registry = DomainMapRegistry::new();
        let mut msg = domain_message(Peer::new("client", 0), vec![0, 1, 2, 3]);
        msg.metadata_mut().set("domain", 5_i64); // wrong type, not a string
        let err = install_domain(&registry, &msg).await.unwrap_err();
        assert!(matches!(err, DomainError::UnknownDomain(_)));
    }
}
