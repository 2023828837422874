//! Error taxonomy for the fieldmux core.
//!
//! Each kind corresponds to one of the failure domains in the design: malformed
//! configuration, metadata access, transport delivery, domain/aggregation bookkeeping, and
//! sink back-ends. Call sites close to the wire or to action execution return these typed
//! errors; `anyhow::Result` takes over at the outer boundaries (CLI entry points, the
//! dispatcher loop) the same way a top-level `main.rs` wraps typed library errors.

use thiserror::Error;

/// Fatal at startup: malformed configuration or an unknown action/transport type.
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("unknown action type '{0}' at {1}")]
    UnknownActionType(String, String),

    #[error("unknown transport kind '{0}'")]
    UnknownTransport(String),

    #[error("invalid configuration at {path}: {reason}")]
    Invalid { path: String, reason: String },

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_yaml::Error),
}

/// Missing key or type mismatch on a `Metadata` access.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum MetadataError {
    #[error("metadata key '{0}' not found")]
    MissingKey(String),

    #[error("metadata key '{key}' has the wrong type: expected {expected}, found {found}")]
    TypeMismatch {
        key: String,
        expected: &'static str,
        found: &'static str,
    },
}

/// Connection- and framing-level failures.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("destination peer is unreachable")]
    Unreachable,

    #[error("transport is closed")]
    Closed,

    #[error("framing error: {0}")]
    Framing(String),

    #[error("operation timed out")]
    Timeout,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Aggregation bookkeeping errors: the field is dropped, the server continues.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum DomainError {
    #[error("global size mismatch for domain '{domain}': expected {expected}, got {got}")]
    GlobalSizeMismatch {
        domain: String,
        expected: usize,
        got: usize,
    },

    #[error("accumulated size {accumulated} exceeds global size {global} for field '{field}'")]
    SizeOverflow {
        field: String,
        accumulated: usize,
        global: usize,
    },

    #[error("duplicate part from peer {peer} for field '{field}'")]
    DuplicatePart { field: String, peer: String },

    #[error("level count mismatch for field '{field}': expected {expected}, got {got}")]
    LevelCountMismatch {
        field: String,
        expected: usize,
        got: usize,
    },

    #[error("no domain map registered for domain '{0}'")]
    UnknownDomain(String),

    #[error("no descriptor registered for peer {peer} in domain '{domain}'")]
    UnknownPeer { domain: String, peer: String },
}

/// Policy for the error is per-plan (`on-error: continue|abort`).
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("sink write failed: {0}")]
    Write(String),

    #[error("sink flush failed: {0}")]
    Flush(String),
}
