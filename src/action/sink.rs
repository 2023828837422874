//! Sink action: writes a message's payload to one or more external sinks; issues a `flush()` on
//! `StepComplete`. Policy on a sink error is per-plan (`on-error: continue|abort`), grounded on
//! `multio::server::actions::Sink` for the write/flush shape, generalized from a single-sink
//! design to the configured list.

use super::{Action, ActionError, ActionStats};
use crate::config::{OnSinkError, SinkConfig};
use crate::error::SinkError;
use crate::message::{Message, Tag};
use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tracing::warn;

/// An external write destination. The real implementations this crate ships with are a
/// file-backed sink and a null sink for tests; anything richer (object storage, FDB) is an
/// external collaborator out of scope here.
#[async_trait]
pub trait Sink: Send + Sync {
    async fn write(&self, payload: &[u8]) -> Result<(), SinkError>;
    async fn flush(&self) -> Result<(), SinkError>;
}

pub struct FileSink {
    path: String,
}

impl FileSink {
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl Sink for FileSink {
    async fn write(&self, payload: &[u8]) -> Result<(), SinkError> {
        let mut file = tokio::fs::OpenOptions::new()
            .append(true)
            .create(true)
            .open(&self.path)
            .await
            .map_err(|e| SinkError::Write(e.to_string()))?;
        file.write_all(payload)
            .await
            .map_err(|e| SinkError::Write(e.to_string()))
    }

    async fn flush(&self) -> Result<(), SinkError> {
        let mut file = tokio::fs::OpenOptions::new()
            .append(true)
            .create(true)
            .open(&self.path)
            .await
            .map_err(|e| SinkError::Flush(e.to_string()))?;
        file.flush().await.map_err(|e| SinkError::Flush(e.to_string()))
    }
}

/// Discards every write; used for tests and `type: null` configuration entries.
pub struct NullSink;

#[async_trait]
impl Sink for NullSink {
    async fn write(&self, _payload: &[u8]) -> Result<(), SinkError> {
        Ok(())
    }

    async fn flush(&self) -> Result<(), SinkError> {
        Ok(())
    }
}

pub struct SinkAction {
    sinks: Vec<Box<dyn Sink>>,
    on_error: OnSinkError,
    stats: ActionStats,
    next: Option<Box<dyn Action>>,
}

impl SinkAction {
    pub fn new(
        configs: &[SinkConfig],
        on_error: OnSinkError,
        next: Option<Box<dyn Action>>,
    ) -> Result<Self, crate::error::ConfigurationError> {
        let sinks = configs
            .iter()
            .map(|c| -> Box<dyn Sink> {
                match c {
                    SinkConfig::File { path } => Box::new(FileSink::new(path.clone())),
                    SinkConfig::Null => Box::new(NullSink),
                }
            })
            .collect();
        Ok(Self {
            sinks,
            on_error,
            stats: ActionStats::default(),
            next,
        })
    }

    async fn write_all(&self, payload: &[u8]) -> Result<(), ActionError> {
        for sink in &self.sinks {
            if let Err(e) = sink.write(payload).await {
                warn!("sink write failed: {e}");
                if self.on_error == OnSinkError::Abort {
                    return Err(ActionError::Sink(e));
                }
            }
        }
        Ok(())
    }

    async fn flush_all(&self) -> Result<(), ActionError> {
        for sink in &self.sinks {
            if let Err(e) = sink.flush().await {
                warn!("sink flush failed: {e}");
                if self.on_error == OnSinkError::Abort {
                    return Err(ActionError::Sink(e));
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Action for SinkAction {
    async fn execute_impl(&self, msg: Message) -> Result<(), ActionError> {
        match msg.tag() {
            Tag::Field | Tag::Grib => self.write_all(&msg.payload).await?,
            Tag::StepComplete => self.flush_all().await?,
            _ => {}
        }
        self.execute_next(msg).await
    }

    fn next(&self) -> Option<&(dyn Action)> {
        self.next.as_deref()
    }

    fn stats(&self) -> &ActionStats {
        &self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Header;
    use crate::metadata::Metadata;
    use crate::peer::Peer;

    fn field(payload: Vec<u8>) -> Message {
        Message::new(
            Header {
                tag: Tag::Field,
                source: Peer::new("server", 0),
                destination: Peer::new("sink", 0),
                metadata: Metadata::new(),
            },
            payload,
        )
    }

    #[tokio::test]
    async fn file_sink_writes_payload_to_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.bin");
        let action = SinkAction::new(
            &[SinkConfig::File {
                path: path.to_string_lossy().to_string(),
            }],
            OnSinkError::Abort,
            None,
        )
        .unwrap();

        action.execute_impl(field(vec![1, 2, 3])).await.unwrap();
        let written = std::fs::read(&path).unwrap();
        assert_eq!(written, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn null_sink_never_errors() {
        let action = SinkAction::new(&[SinkConfig::Null], OnSinkError::Abort, None).unwrap();
        action.execute_impl(field(vec![9, 9])).await.unwrap();
    }
}
