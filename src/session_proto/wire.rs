use anyhow::{Context, Result};
use bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

use crate::session_proto::rpc::SessionMessage;

/// Maximum frame payload size: 4 MB (namespaces and page errors can be large).
const MAX_FRAME_SIZE: usize = 4 * 1_048_576;

/// Length-prefixed frame codec for the automation session protocol.
pub struct SessionCodec {
    inner: LengthDelimitedCodec,
}

impl Default for SessionCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionCodec {
    pub fn new() -> Self {
        let inner = LengthDelimitedCodec::builder()
            .big_endian()
            .length_field_length(4)
            .max_frame_length(MAX_FRAME_SIZE)
            .length_adjustment(0)
            .new_codec();

        Self { inner }
    }
}

impl Encoder<SessionMessage> for SessionCodec {
    type Error = anyhow::Error;

    fn encode(&mut self, item: SessionMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let json = serde_json::to_vec(&item).context("failed to serialize session message")?;
        self.inner
            .encode(Bytes::from(json), dst)
            .map_err(|e| anyhow::anyhow!(e))
    }
}

impl Decoder for SessionCodec {
    type Item = SessionMessage;
    type Error = anyhow::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.inner.decode(src).map_err(|e| anyhow::anyhow!(e))? {
            Some(bytes) => {
                let msg = serde_json::from_slice(&bytes)
                    .context("failed to deserialize session message")?;
                Ok(Some(msg))
            }
            None => Ok(None),
        }
    }
}
