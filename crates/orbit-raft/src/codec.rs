use crate::message::RaftMessage;
use crate::RaftError;
use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Raft frames can carry whole snapshots, so the limit is generous.
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Codec for Raft RPC frames with length-prefixed framing
///
/// Frame format: [4-byte length (big-endian)] [bincode payload]
#[derive(Debug, Default, Clone, Copy)]
pub struct RaftCodec;

impl Decoder for RaftCodec {
    type Item = RaftMessage;
    type Error = RaftError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < 4 {
            return Ok(None);
        }

        let mut length_bytes = [0u8; 4];
        length_bytes.copy_from_slice(&src[0..4]);
        let length = u32::from_be_bytes(length_bytes) as usize;

        if length > MAX_FRAME_SIZE {
            return Err(RaftError::Transport(format!(
                "frame of {} bytes exceeds limit of {}",
                length, MAX_FRAME_SIZE
            )));
        }

        if src.len() < 4 + length {
            src.reserve(4 + length - src.len());
            return Ok(None);
        }

        src.advance(4);
        let payload = src.split_to(length);
        let message = bincode::deserialize(&payload)
            .map_err(|e| RaftError::Transport(format!("malformed frame: {}", e)))?;

        Ok(Some(message))
    }
}

impl Encoder<RaftMessage> for RaftCodec {
    type Error = RaftError;

    fn encode(&mut self, item: RaftMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let payload = bincode::serialize(&item)
            .map_err(|e| RaftError::Transport(format!("could not encode frame: {}", e)))?;

        if payload.len() > MAX_FRAME_SIZE {
            return Err(RaftError::Transport(format!(
                "frame of {} bytes exceeds limit of {}",
                payload.len(),
                MAX_FRAME_SIZE
            )));
        }

        dst.reserve(4 + payload.len());
        dst.put_u32(payload.len() as u32);
        dst.put_slice(&payload);

        Ok(())
    }
}
