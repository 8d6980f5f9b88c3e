use bytes::{Buf as _, BufMut as _, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::Error;

const HEADER_SIZE: usize = 2;

/// Largest payload the length field can express.
pub const DEFAULT_MAX_FRAME: u16 = u16::MAX;

/// Codec for `len: u16 big-endian || payload[len]` frames.
///
/// A frame carries exactly one IP datagram; `len = 0` is the keepalive.
/// Decoding a length above `max_frame` fails with [`Error::Corrupt`] and
/// MUST terminate the session: the byte stream cannot be re-synchronised
/// after a bad header.
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_frame: u16,
}

impl FrameCodec {
    pub fn new(max_frame: u16) -> Self {
        Self { max_frame }
    }

    pub fn max_frame(&self) -> u16 {
        self.max_frame
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME)
    }
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, Error> {
        if src.len() < HEADER_SIZE {
            src.reserve(HEADER_SIZE - src.len());

            return Ok(None);
        }

        let len = u16::from_be_bytes([src[0], src[1]]);

        if len > self.max_frame {
            return Err(Error::Corrupt {
                len,
                max: self.max_frame,
            });
        }

        let frame_len = HEADER_SIZE + usize::from(len);
        if src.len() < frame_len {
            src.reserve(frame_len - src.len());

            return Ok(None);
        }

        src.advance(HEADER_SIZE);
        let payload = src.split_to(usize::from(len)).freeze();

        Ok(Some(payload))
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = Error;

    fn encode(&mut self, payload: Bytes, dst: &mut BytesMut) -> Result<(), Error> {
        let Ok(len) = u16::try_from(payload.len()) else {
            return Err(too_large(payload.len()));
        };

        if len > self.max_frame {
            return Err(too_large(payload.len()));
        }

        dst.reserve(HEADER_SIZE + payload.len());
        dst.put_u16(len);
        dst.extend_from_slice(&payload);

        Ok(())
    }
}

fn too_large(len: usize) -> Error {
    Error::Io(std::io::Error::new(
        std::io::ErrorKind::InvalidInput,
        format!("refusing to send frame of {len} bytes"),
    ))
}
