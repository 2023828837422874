//! Aggregation action: reassembles a global field from the partial contributions of
//! every client, ported structurally from `original_source/src/multio/action/Aggregation.cc`
//! (`handleField`/`handleFlush`/`allPartsArrived`/`createGlobalField`) with a `HashMap` in place
//! of the C++ `MessageMap` and `Result`/`tracing::warn!` in place of exceptions.

use super::{Action, ActionError, ActionStats};
use crate::domain::DomainMapRegistry;
use crate::error::DomainError;
use crate::message::{Header, Message, Tag};
use crate::peer::Peer;
use std::collections::{HashMap, HashSet};
use tokio::sync::Mutex;
use tracing::warn;

#[derive(Default)]
struct FieldState {
    message: Message,
    processed_parts: HashSet<Peer>,
    level_count: i64,
}

#[derive(Default)]
struct AggregationState {
    msg_map: HashMap<String, FieldState>,
    flushes: HashMap<String, usize>,
}

pub struct AggregationAction {
    domain_maps: std::sync::Arc<DomainMapRegistry>,
    expected_peers: usize,
    hash_keys: Vec<String>,
    server_group: String,
    state: Mutex<AggregationState>,
    stats: ActionStats,
    next: Option<Box<dyn Action>>,
}

impl AggregationAction {
    pub fn new(
        domain_maps: std::sync::Arc<DomainMapRegistry>,
        expected_peers: usize,
        hash_keys: Vec<String>,
        server_group: String,
        next: Option<Box<dyn Action>>,
    ) -> Self {
        Self {
            domain_maps,
            expected_peers,
            hash_keys,
            server_group,
            state: Mutex::new(AggregationState::default()),
            stats: ActionStats::default(),
            next,
        }
    }

    fn domain_name(msg: &Message) -> Result<String, crate::error::MetadataError> {
        msg.metadata().get::<&str>("domain").map(|s| s.to_string())
    }

    fn level_count(msg: &Message) -> Result<i64, crate::error::MetadataError> {
        Ok(msg.metadata().get_opt::<i64>("level_count")?.unwrap_or(1))
    }

    /// Returns `Some(global field)` once every expected peer's part for this field has arrived.
    async fn handle_field(&self, msg: Message) -> Result<Option<Message>, ActionError> {
        let field_id = msg.field_id(&self.hash_keys)?;
        let domain_name = Self::domain_name(&msg)?;
        let level_count = Self::level_count(&msg)?;
        let source = msg.source().clone();

        let global_size = self
            .domain_maps
            .with_domain(&domain_name, |map| map.global_size())
            .await?
            .ok_or_else(|| DomainError::UnknownPeer {
                domain: domain_name.clone(),
                peer: source.to_string(),
            })?;

        let mut state = self.state.lock().await;

        if !state.msg_map.contains_key(&field_id) {
            let header = Header {
                tag: Tag::Field,
                source: Peer::new(self.server_group.clone(), 0),
                destination: msg.destination().clone(),
                metadata: msg.metadata().clone(),
            };
            let payload = vec![0u8; global_size * level_count as usize * std::mem::size_of::<f64>()];
            state.msg_map.insert(
                field_id.clone(),
                FieldState {
                    message: Message::new(header, payload),
                    processed_parts: HashSet::new(),
                    level_count,
                },
            );
        }

        let entry = state.msg_map.get_mut(&field_id).expect("just inserted");

        if entry.level_count != level_count {
            let err = DomainError::LevelCountMismatch {
                field: field_id,
                expected: entry.level_count as usize,
                got: level_count as usize,
            };
            warn!("{err}, dropping part from {source}");
            return Ok(None);
        }

        if entry.processed_parts.contains(&source) {
            let err = DomainError::DuplicatePart {
                field: field_id,
                peer: source.to_string(),
            };
            warn!("{err}, dropping part");
            return Ok(None);
        }

        let descriptor = self
            .domain_maps
            .with_domain(&domain_name, |map| map.get(&source).cloned())
            .await?
            .ok_or_else(|| DomainError::UnknownPeer {
                domain: domain_name.clone(),
                peer: source.to_string(),
            })?;

        let local: Vec<f64> = bytes_to_f64(&msg.payload);
        let mut global: Vec<f64> = bytes_to_f64(&entry.message.payload);
        descriptor.expand(&local, &mut global)?;
        entry.message.payload = f64_to_bytes(&global);
        entry.processed_parts.insert(source);

        let parts_count = entry.processed_parts.len();
        let complete = self
            .domain_maps
            .with_domain(&domain_name, |map| {
                map.is_complete() && parts_count == map.size()
            })
            .await?;

        if complete {
            let field_state = state.msg_map.remove(&field_id).expect("present");
            return Ok(Some(field_state.message));
        }
        Ok(None)
    }

    /// Returns `true` once every expected client has flushed this field's step.
    async fn handle_flush(&self, msg: &Message) -> Result<bool, ActionError> {
        let field_id = msg.field_id(&self.hash_keys)?;
        let domain_name = Self::domain_name(msg)?;

        let mut state = self.state.lock().await;
        let count = {
            let entry = state.flushes.entry(field_id).or_insert(0);
            *entry += 1;
            *entry
        };

        let complete = self
            .domain_maps
            .with_domain(&domain_name, |map| map.is_complete() && count == map.size())
            .await
            .unwrap_or(false);
        Ok(complete)
    }
}

#[async_trait::async_trait]
impl Action for AggregationAction {
    async fn execute_impl(&self, msg: Message) -> Result<(), ActionError> {
        match msg.tag() {
            Tag::Field => {
                if let Some(global_field) = self.handle_field(msg).await? {
                    self.execute_next(global_field).await?;
                }
            }
            Tag::StepComplete => {
                let should_forward = self.handle_flush(&msg).await?;
                if should_forward {
                    self.execute_next(msg).await?;
                }
            }
            _ => self.execute_next(msg).await?,
        }
        Ok(())
    }

    fn next(&self) -> Option<&(dyn Action)> {
        self.next.as_deref()
    }

    fn stats(&self) -> &ActionStats {
        &self.stats
    }
}

fn bytes_to_f64(bytes: &[u8]) -> Vec<f64> {
    bytes
        .chunks_exact(8)
        .map(|c| f64::from_le_bytes(c.try_into().unwrap()))
        .collect()
}

fn f64_to_bytes(values: &[f64]) -> Vec<u8> {
    let mut out = Vec::with_capacity(values.len() * 8);
    for v in values {
        out.extend_from_slice(&v.to_le_bytes());
    }
    out
}
