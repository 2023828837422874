//! Action chain: a composable per-field processing step with per-action wall-time statistics,
//! mirrored on `ipc::IpcTransport`'s trait-plus-factory shape but restructured as a chain of
//! responsibility rather than a flat dispatch table.

pub mod aggregation;
pub mod client_transport;
pub mod encode;
pub mod select;
pub mod sink;
pub mod statistics;

use crate::config::ActionConfig;
use crate::error::{ConfigurationError, DomainError, MetadataError, SinkError, TransportError};
use crate::message::Message;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use thiserror::Error;

/// Errors an action chain can surface while processing one message.
#[derive(Debug, Error)]
pub enum ActionError {
    #[error(transparent)]
    Metadata(#[from] MetadataError),
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error(transparent)]
    Sink(#[from] SinkError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Running wall-time and invocation count for one action instance, captured around every
/// `execute_impl` call by [`ScopedTiming`].
#[derive(Debug, Default)]
pub struct ActionStats {
    invocations: AtomicU64,
    total_nanos: AtomicU64,
}

impl ActionStats {
    fn record(&self, elapsed: std::time::Duration) {
        self.invocations.fetch_add(1, Ordering::Relaxed);
        self.total_nanos
            .fetch_add(elapsed.as_nanos() as u64, Ordering::Relaxed);
    }

    pub fn invocations(&self) -> u64 {
        self.invocations.load(Ordering::Relaxed)
    }

    pub fn total_nanos(&self) -> u64 {
        self.total_nanos.load(Ordering::Relaxed)
    }
}

/// RAII scoped timer: records elapsed wall time into `stats` on every exit path, including a
/// panic unwind, matching the "acquire → execute → record on all exit paths" contract of
/// `util::ScopedTiming`.
struct ScopedTiming<'a> {
    started: Instant,
    stats: &'a ActionStats,
}

impl<'a> ScopedTiming<'a> {
    fn start(stats: &'a ActionStats) -> Self {
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

/// A composable pipeline step. Concrete actions implement [`Action::execute_impl`] and
/// explicitly call [`Action::execute_next`] to pass control down the chain; `execute` is the
/// entry point that wraps `execute_impl` in a [`ScopedTiming`] guard.
#[async_trait]
pub trait Action: Send + Sync {
    /// Runs this action's own logic; explicitly forwards to the next action via
    /// [`Action::execute_next`] when the message should continue down the chain.
    async fn execute_impl(&self, msg: Message) -> Result<(), ActionError>;

    /// The next action in the chain, if any.
    fn next(&self) -> Option<&(dyn Action)>;

    /// Passes `msg` to [`Action::next`], if present. A no-op at the tail of a chain.
    async fn execute_next(&self, msg: Message) -> Result<(), ActionError> {
        match self.next() {
            Some(next) => next.execute(msg).await,
            None => Ok(()),
        }
    }

    /// Per-action timing and invocation counters.
    fn stats(&self) -> &ActionStats;

    /// Entry point: times and runs [`Action::execute_impl`].
    async fn execute(&self, msg: Message) -> Result<(), ActionError> {
        let _timing = ScopedTiming::start(self.stats());
        self.execute_impl(msg).await
    }
}

/// Builds one [`Action`] (with the rest of `tail` chained behind it) per [`ActionConfig`]
/// variant, mirroring `TransportFactory`'s constructor table.
pub struct ActionFactory;

impl ActionFactory {
    pub fn build(
        configs: &[ActionConfig],
        domain_maps: std::sync::Arc<crate::domain::DomainMapRegistry>,
        expected_peers: usize,
        hash_keys: &[String],
        server_group: &str,
    ) -> Result<Option<Box<dyn Action>>, ConfigurationError> {
        build_chain(
            configs,
            0,
            domain_maps,
            expected_peers,
            hash_keys,
            server_group,
        )
    }
}

fn build_chain(
    configs: &[ActionConfig],
    index: usize,
    domain_maps: std::sync::Arc<crate::domain::DomainMapRegistry>,
    expected_peers: usize,
    hash_keys: &[String],
    server_group: &str,
) -> Result<Option<Box<dyn Action>>, ConfigurationError> {
    let Some(config) = configs.get(index) else {
        return Ok(None);
    };
    let next = build_chain(
        configs,
        index + 1,
        domain_maps.clone(),
        expected_peers,
        hash_keys,
        server_group,
    )?;

    let action: Box<dyn Action> = match config {
        ActionConfig::Aggregation => Box::new(aggregation::AggregationAction::new(
            domain_maps,
            expected_peers,
            hash_keys.to_vec(),
            server_group.to_string(),
            next,
        )),
        ActionConfig::Select { predicate } => {
            let parsed = predicate
                .iter()
                .map(|(k, v)| (k.clone(), match_value_to_set(v)))
                .collect::<HashMap<_, _>>();
            Box::new(select::SelectAction::new(parsed, next))
        }
        ActionConfig::Encode { format, template } => {
            Box::new(encode::EncodeAction::new(*format, template.clone(), next))
        }
        ActionConfig::Statistics {
            operations,
            output_frequency,
        } => Box::new(statistics::StatisticsAction::new(
            operations.clone(),
            output_frequency.clone(),
            hash_keys.to_vec(),
            next,
        )),
        ActionConfig::Sink { sinks, on_error } => {
            Box::new(sink::SinkAction::new(sinks, *on_error, next)?)
        }
        ActionConfig::Transport => {
            return Err(ConfigurationError::UnknownActionType(
                "transport".to_string(),
                "server-side plan (transport is client-side only)".to_string(),
            ))
        }
    };
    Ok(Some(action))
}

fn match_value_to_set(value: &crate::config::MatchValue) -> Vec<String> {
    match value {
        crate::config::MatchValue::One(v) => vec![v.clone()],
        crate::config::MatchValue::Many(vs) => vs.clone(),
    }
}
