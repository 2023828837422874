//! Typed configuration tree, deserialized with `serde_yaml`/`serde_json` rather than hand-parsed:
//! one value type per recognized top-level key, an enum over each pluggable unit (transport kind,
//! distribution, action type), the same shape as a `clap`-derived arg struct but sourced from a
//! document instead of flags.

use serde::{Deserialize, Serialize};
use tracing::warn;

/// `transport: "mpi" | "tcp"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Tcp,
    Mpi,
}

/// One `{host, ports}` entry in the `servers` list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerGroupConfig {
    pub host: String,
    pub ports: Vec<u16>,
}

/// `MULTIO_SERVER_DISTRIBUTION`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistributionKind {
    HashedToSingle,
    HashedCyclic,
    Even,
}

impl Default for DistributionKind {
    fn default() -> Self {
        DistributionKind::HashedToSingle
    }
}

impl DistributionKind {
    fn from_env_value(value: &str) -> Option<Self> {
        match value {
            "hashed_to_single" => Some(DistributionKind::HashedToSingle),
            "hashed_cyclic" => Some(DistributionKind::HashedCyclic),
            "even" => Some(DistributionKind::Even),
            _ => None,
        }
    }
}

/// `{key: value | [values]}` for the `select` action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MatchValue {
    One(String),
    Many(Vec<String>),
}

/// Recognized codec identifiers for the `encode` action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EncodeFormat {
    Grib,
    Raw,
}

/// Temporal aggregates computed by the `statistics` action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatisticOperation {
    Mean,
    Min,
    Max,
    Accumulate,
}

/// One destination for the `sink` action. The file-backed variant is real; `Null` exists for
/// tests and dry runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SinkConfig {
    File { path: String },
    Null,
}

/// What happens when a `SinkError` propagates out of a `sink` action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OnSinkError {
    Continue,
    Abort,
}

impl Default for OnSinkError {
    fn default() -> Self {
        OnSinkError::Abort
    }
}

/// One recognized action type, tagged on `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ActionConfig {
    Aggregation,
    Select {
        #[serde(rename = "match")]
        predicate: std::collections::HashMap<String, MatchValue>,
    },
    Encode {
        format: EncodeFormat,
        template: Option<String>,
    },
    Statistics {
        operations: Vec<StatisticOperation>,
        #[serde(rename = "output-frequency")]
        output_frequency: String,
    },
    Sink {
        sinks: Vec<SinkConfig>,
        #[serde(rename = "on-error", default)]
        on_error: OnSinkError,
    },
    Transport,
}

/// `{name, actions}` — one chain bound to a field-class selector via its head action: the
/// predicate itself lives on [`Plan`](crate::plan::Plan), derived from the first `select` action
/// if present, otherwise "matches everything".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanConfig {
    pub name: String,
    pub actions: Vec<ActionConfig>,
}

/// Top-level configuration tree: `{transport, group, count, servers, plans, hash_keys}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub transport: TransportKind,
    pub group: String,
    pub count: usize,
    pub servers: Vec<ServerGroupConfig>,
    pub plans: Vec<PlanConfig>,
    #[serde(default = "default_hash_keys")]
    pub hash_keys: Vec<String>,
    #[serde(default)]
    pub distribution: DistributionKind,
    #[serde(default = "default_used_server_count")]
    pub used_server_count: usize,
}

fn default_hash_keys() -> Vec<String> {
    vec!["category".into(), "name".into(), "level".into()]
}

fn default_used_server_count() -> usize {
    1
}

impl Config {
    pub fn from_yaml(text: &str) -> Result<Self, crate::error::ConfigurationError> {
        let mut config: Self = serde_yaml::from_str(text)?;
        config.apply_env_overrides();
        Ok(config)
    }

    pub fn from_json(text: &str) -> Result<Self, crate::error::ConfigurationError> {
        let mut config: Self =
            serde_json::from_str(text).map_err(|e| crate::error::ConfigurationError::Invalid {
                path: "<json>".to_string(),
                reason: e.to_string(),
            })?;
        config.apply_env_overrides();
        Ok(config)
    }

    pub fn server_count(&self) -> usize {
        self.servers.iter().map(|g| g.ports.len()).sum()
    }

    /// `MULTIO_SERVER_DISTRIBUTION` overrides `distribution`; `MULTIO_USED_SERVERS` overrides
    /// `used_server_count`. Mirrors `multio::action::transport::Transport`'s
    /// `std::getenv("MULTIO_SERVER_DISTRIBUTION")` / `eckit::Resource<size_t>` lookups.
    /// Unrecognized or non-positive values are logged and left at the document's own setting.
    fn apply_env_overrides(&mut self) {
        if let Ok(value) = std::env::var("MULTIO_SERVER_DISTRIBUTION") {
            match DistributionKind::from_env_value(&value) {
                Some(kind) => self.distribution = kind,
                None => warn!("ignoring unrecognized MULTIO_SERVER_DISTRIBUTION value '{value}'"),
            }
        }
        if let Ok(value) = std::env::var("MULTIO_USED_SERVERS") {
            match value.parse::<usize>() {
                Ok(n) if n > 0 => self.used_server_count = n,
                _ => warn!("ignoring invalid MULTIO_USED_SERVERS value '{value}'"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_representative_document() {
        let yaml = r#"
transport: tcp
group: clients
count: 2
servers:
  - host: 127.0.0.1
    ports: [9001, 9002]
hash_keys: [category, name, level]
distribution: hashed_cyclic
used_server_count: 2
plans:
  - name: ocean
    actions:
      - type: aggregation
      - type: select
        match:
          category: ocean
      - type: statistics
        operations: [mean]
        output-frequency: "6h"
      - type: sink
        sinks:
          - type: file
            path: /tmp/out.grib
        on-error: continue
"#;
        let config = Config::from_yaml(yaml).unwrap();
        assert_eq!(config.transport, TransportKind::Tcp);
        assert_eq!(config.server_count(), 2);
        assert_eq!(config.plans.len(), 1);
        assert_eq!(config.plans[0].actions.len(), 4);
        assert!(matches!(
            config.plans[0].actions[3],
            ActionConfig::Sink {
                on_error: OnSinkError::Continue,
                ..
            }
        ));
    }

    #[test]
    fn hash_keys_default_when_absent() {
        let yaml = r#"
transport: mpi
group: servers
count: 4
servers: []
plans: []
"#;
        let config = Config::from_yaml(yaml).unwrap();
        assert_eq!(config.hash_keys, vec!["category", "name", "level"]);
        assert_eq!(config.used_server_count, 1);
    }

    #[test]
    fn malformed_document_is_a_configuration_error() {
        let err = Config::from_yaml("not: [valid").unwrap_err();
        assert!(matches!(err, crate::error::ConfigurationError::Parse(_)));
    }

    // Both env vars are process-global, so the valid and invalid cases run in one test to avoid
    // racing against each other under a parallel test runner.
    #[test]
    fn environment_overrides_distribution_and_used_server_count() {
        let yaml = r#"
transport: tcp
group: clients
count: 2
servers: []
plans: []
distribution: hashed_cyclic
used_server_count: 5
"#;

        std::env::set_var("MULTIO_SERVER_DISTRIBUTION", "even");
        std::env::set_var("MULTIO_USED_SERVERS", "3");
        let config = Config::from_yaml(yaml).unwrap();
        assert_eq!(config.distribution, DistributionKind::Even);
        assert_eq!(config.used_server_count, 3);

        std::env::set_var("MULTIO_SERVER_DISTRIBUTION", "bogus");
        std::env::set_var("MULTIO_USED_SERVERS", "0");
        let config = Config::from_yaml(yaml).unwrap();
        assert_eq!(config.distribution, DistributionKind::HashedCyclic);
        assert_eq!(config.used_server_count, 5);

        std::env::remove_var("MULTIO_SERVER_DISTRIBUTION");
        std::env::remove_var("MULTIO_USED_SERVERS");
    }
}
