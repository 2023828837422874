//! # fieldmux
//!
//! A multiplexing I/O server for gridded scientific fields: clients write partial fields over
//! a pluggable transport, servers reassemble and reshape them through a configurable plan of
//! actions (aggregation, selection, encoding, statistics, sinks).

pub mod action;
pub mod client;
pub mod config;
pub mod dispatcher;
pub mod domain;
pub mod error;
#[cfg(feature = "capi")]
pub mod ffi;
pub mod logging;
pub mod message;
pub mod metadata;
pub mod peer;
pub mod plan;
pub mod transport;

pub use client::FieldmuxClient;
pub use config::Config;
pub use dispatcher::{run_server, Dispatcher};
pub use error::{ConfigurationError, DomainError, MetadataError, SinkError, TransportError};
pub use message::{Header, Message, Tag};
pub use metadata::{Metadata, Value};
pub use peer::Peer;
pub use transport::{Transport, TransportFactory};

/// The current version of fieldmux.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
