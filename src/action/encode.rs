//! Encode action: calls an external codec with `(payload, metadata)`, returning a
//! new byte buffer, and retags the message (`Field → Grib` for the GRIB codec). The codec itself
//! is an external collaborator out of scope here: modeled as a trait with a pass-through
//! `raw` implementation and a stub `grib` implementation standing in for the real encoder.

use super::{Action, ActionError, ActionStats};
use crate::config::EncodeFormat;
use crate::message::{Message, Tag};

/// An external codec turning a raw field buffer into an encoded byte buffer. The real GRIB
/// encoder lives outside this crate's scope; this trait is the seam.
pub trait Codec: Send + Sync {
    fn encode(&self, payload: &[u8], metadata: &crate::metadata::Metadata) -> Vec<u8>;
    fn output_tag(&self) -> Tag;
}

/// Pass-through codec: the payload is forwarded unchanged.
pub struct RawCodec;

impl Codec for RawCodec {
    fn encode(&self, payload: &[u8], _metadata: &crate::metadata::Metadata) -> Vec<u8> {
        payload.to_vec()
    }

    fn output_tag(&self) -> Tag {
        Tag::Field
    }
}

/// Stub GRIB codec: prefixes the payload with a fixed marker rather than producing a real GRIB
/// message, since the real encoder is an external collaborator outside this crate's scope.
pub struct StubGribCodec {
    pub template: Option<String>,
}

impl Codec for StubGribCodec {
    fn encode(&self, payload: &[u8], _metadata: &crate::metadata::Metadata) -> Vec<u8> {
        let mut out = b"GRIB".to_vec();
        out.extend_from_slice(payload);
        out
    }

    fn output_tag(&self) -> Tag {
        Tag::Grib
    }
}

pub struct EncodeAction {
    codec: Box<dyn Codec>,
    stats: ActionStats,
    next: Option<Box<dyn Action>>,
}

impl EncodeAction {
    pub fn new(format: EncodeFormat, template: Option<String>, next: Option<Box<dyn Action>>) -> Self {
        let codec: Box<dyn Codec> = match format {
            EncodeFormat::Raw => Box::new(RawCodec),
            EncodeFormat::Grib => Box::new(StubGribCodec { template }),
        };
        Self {
            codec,
            stats: ActionStats::default(),
            next,
        }
    }
}

#[async_trait::async_trait]
impl Action for EncodeAction {
    async fn execute_impl(&self, mut msg: Message) -> Result<(), ActionError> {
        if msg.tag() == Tag::Field {
            let encoded = self.codec.encode(&msg.payload, msg.metadata());
            msg.payload = encoded;
            msg.header.tag = self.codec.output_tag();
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
    use std::sync::{Arc, Mutex};

    struct CapturingSink(Arc<Mutex<Option<Message>>>);

    #[async_trait::async_trait]
    impl Action for CapturingSink {
        async fn execute_impl(&self, msg: Message) -> Result<(), ActionError> {
            *self.0.lock().unwrap() = Some(msg);
            Ok(())
        }
        fn next(&self) -> Option<&(dyn Action)> {
            None
        }
        fn stats(&self) -> &ActionStats {
            unreachable!()
        }
    }

    fn field() -> Message {
        Message::new(
            Header {
                tag: Tag::Field,
                source: Peer::new("server", 0),
                destination: Peer::new("sink", 0),
                metadata: Metadata::new(),
            },
            vec![1, 2, 3],
        )
    }

    #[tokio::test]
    async fn grib_encoding_retags_and_prefixes_payload() {
        let captured = Arc::new(Mutex::new(None));
        let action = EncodeAction::new(
            EncodeFormat::Grib,
            None,
            Some(Box::new(CapturingSink(captured.clone())) as Box<dyn Action>),
        );
        action.execute_impl(field()).await.unwrap();

        let out = captured.lock().unwrap().take().unwrap();
        assert_eq!(out.tag(), Tag::Grib);
        assert_eq!(out.payload, b"GRIB\x01\x02\x03".to_vec());
    }

    #[tokio::test]
    async fn raw_encoding_passes_payload_through_unchanged() {
        let captured = Arc::new(Mutex::new(None));
        let action = EncodeAction::new(
            EncodeFormat::Raw,
            None,
            Some(Box::new(CapturingSink(captured.clone())) as Box<dyn Action>),
        );
        action.execute_impl(field()).await.unwrap();

        let out = captured.lock().unwrap().take().unwrap();
        assert_eq!(out.tag(), Tag::Field);
        assert_eq!(out.payload, vec![1, 2, 3]);
    }
}
