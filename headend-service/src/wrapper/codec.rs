use std::io;

use bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::{WrapperHeader, HEADER_LEN};

/// Splits a TCP byte stream into whole frames using the header length field.
///
/// Handshake and application frames share the header, so one codec serves
/// both; classification happens after a frame is complete.
#[derive(Debug, Clone)]
pub struct WrapperFrameCodec {
    max_frame_len: usize,
}

impl WrapperFrameCodec {
    pub fn new(max_frame_len: usize) -> Self {
        Self {
            max_frame_len: max_frame_len.max(HEADER_LEN),
        }
    }
}

impl Decoder for WrapperFrameCodec {
    type Item = Bytes;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some(header) = WrapperHeader::decode(src) else {
            return Ok(None);
        };

        let total = HEADER_LEN + usize::from(header.length);
        if total > self.max_frame_len {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("frame of {total} bytes exceeds limit of {}", self.max_frame_len),
            ));
        }

        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        Ok(Some(src.split_to(total).freeze()))
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(buf)? {
            Some(frame) => Ok(Some(frame)),
            None => {
                if !buf.is_empty() {
                    tracing::debug!(bytes = buf.len(), "discarding partial frame at end of stream");
                    buf.advance(buf.len());
                }
                Ok(None)
            }
        }
    }
}

impl Encoder<Bytes> for WrapperFrameCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.extend_from_slice(&item);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(payload: &[u8]) -> Vec<u8> {
        let header = WrapperHeader {
            version: 1,
            destination: 1,
            source: 16,
            length: payload.len() as u16,
        };
        let mut out = header.encode().to_vec();
        out.extend_from_slice(payload);
        out
    }

    #[test]
    fn waits_for_complete_frame() {
        let mut codec = WrapperFrameCodec::new(1024);
        let bytes = frame(&[0xC4, 0x01, 0xC1, 0x00]);
        let mut buf = BytesMut::from(&bytes[..6]);
        assert_eq!(codec.decode(&mut buf).unwrap(), None);

        buf.extend_from_slice(&bytes[6..10]);
        assert_eq!(codec.decode(&mut buf).unwrap(), None);

        buf.extend_from_slice(&bytes[10..]);
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap().as_ref(), &bytes[..]);
        assert!(buf.is_empty());
    }

    #[test]
    fn splits_back_to_back_frames() {
        let mut codec = WrapperFrameCodec::new(1024);
        let a = frame(&[0x01, 0x02]);
        let b = frame(&[0x03, 0x04, 0x05]);
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&a);
        buf.extend_from_slice(&b);

        assert_eq!(codec.decode(&mut buf).unwrap().unwrap().as_ref(), &a[..]);
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap().as_ref(), &b[..]);
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn rejects_oversized_frames() {
        let mut codec = WrapperFrameCodec::new(16);
        let mut buf = BytesMut::from(&frame(&[0u8; 32])[..]);
        let err = codec.decode(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
