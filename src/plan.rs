//! Plan: pairs a predicate over metadata with a head [`Action`], instantiated from configuration
//! at server startup. Grounded on `multio::server::Dispatcher`'s `registeredPlans_` map — one
//! plan per configured name, fed independently by the dispatcher.

use crate::action::{Action, ActionError};
use crate::config::{ActionConfig, MatchValue, PlanConfig};
use crate::domain::DomainMapRegistry;
use crate::error::ConfigurationError;
use crate::message::{Message, Tag};
use std::collections::HashMap;
use std::sync::Arc;

/// A field-class selector: `None` matches every field; `Some(predicate)` requires equality or
/// membership on every named key, the same semantics as the `select` action, derived here from a
/// plan's leading `select` action when present.
pub struct Plan {
    name: String,
    predicate: Option<HashMap<String, Vec<String>>>,
    head: Box<dyn Action>,
}

impl Plan {
    pub fn build(
        config: &PlanConfig,
        domain_maps: Arc<DomainMapRegistry>,
        expected_peers: usize,
        hash_keys: &[String],
        server_group: &str,
    ) -> Result<Self, ConfigurationError> {
        let predicate = config.actions.iter().find_map(|a| match a {
            ActionConfig::Select { predicate } => Some(
                predicate
                    .iter()
                    .map(|(k, v)| (k.clone(), match_value_to_vec(v)))
                    .collect(),
            ),
            _ => None,
        });

        let head = crate::action::ActionFactory::build(
            &config.actions,
            domain_maps,
            expected_peers,
            hash_keys,
            server_group,
        )?
        .ok_or_else(|| ConfigurationError::Invalid {
            path: format!("plans[{}]", config.name),
            reason: "a plan must have at least one action".to_string(),
        })?;

        Ok(Self {
            name: config.name.clone(),
            predicate,
            head,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Control messages always match; field-class messages are filtered by the plan's predicate.
    pub fn matches(&self, msg: &Message) -> bool {
        if !matches!(msg.tag(), Tag::Field | Tag::Grib) {
            return true;
        }
        let Some(predicate) = &self.predicate else {
            return true;
        };
        predicate.iter().all(|(key, allowed)| {
            msg.metadata()
                .get_raw(key)
                .map(|v| allowed.iter().any(|a| value_as_string(v) == *a))
                .unwrap_or(false)
        })
    }

    pub async fn feed(&self, msg: Message) -> Result<(), ActionError> {
        self.head.execute(msg).await
    }
}

fn match_value_to_vec(value: &MatchValue) -> Vec<String> {
    match value {
        MatchValue::One(v) => vec![v.clone()],
        MatchValue::Many(vs) => vs.clone(),
    }
}

fn value_as_string(value: &crate::metadata::Value) -> String {
    use crate::metadata::Value;
    match value {
        Value::String(s) => s.clone(),
        Value::Int(i) => i.to_string(),
        Value::Double(d) => d.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Nested(_) | Value::List(_) => format!("{value:?}"),
    }
}
