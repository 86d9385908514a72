//! Frame codec: one JSON document per frame, terminated by `\n\r`.
//!
//! Compact JSON never contains a raw newline, so the terminator can not occur
//! inside a frame.

use crate::error::{Error, NetworkError};
use bytes::{Buf, BufMut, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;
use tokio_util::codec::{Decoder, Encoder};

/// Two-byte frame terminator.
pub const FRAME_TERMINATOR: &[u8; 2] = b"\n\r";

/// Default maximum frame size. Leaves room for a maximal value even when
/// JSON escaping inflates it.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 1024 * 1024;

/// Codec for terminator-delimited JSON frames of `T`.
#[derive(Debug)]
pub struct FrameCodec<T> {
    max_frame_bytes: usize,
    /// How far the buffer was already scanned for a terminator.
    scanned: usize,
    _marker: PhantomData<fn() -> T>,
}

impl<T> FrameCodec<T> {
    /// Create a codec with the default frame limit.
    pub fn new() -> Self {
        Self::with_max_frame(DEFAULT_MAX_FRAME_BYTES)
    }

    /// Create a codec with a custom frame limit.
    pub fn with_max_frame(max_frame_bytes: usize) -> Self {
        Self {
            max_frame_bytes,
            scanned: 0,
            _marker: PhantomData,
        }
    }
}

impl<T> Default for FrameCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: DeserializeOwned> Decoder for FrameCodec<T> {
    type Item = T;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<T>, Error> {
        // Back up one byte in case the terminator straddles two reads.
        let start = self.scanned.saturating_sub(1);
        let found = src[start..]
            .windows(FRAME_TERMINATOR.len())
            .position(|w| w == FRAME_TERMINATOR)
            .map(|pos| start + pos);

        let Some(end) = found else {
            if src.len() > self.max_frame_bytes {
                return Err(NetworkError::FrameTooLarge {
                    size: src.len(),
                    max: self.max_frame_bytes,
                }
                .into());
            }
            self.scanned = src.len();
            return Ok(None);
        };

        self.scanned = 0;
        if end > self.max_frame_bytes {
            return Err(NetworkError::FrameTooLarge {
                size: end,
                max: self.max_frame_bytes,
            }
            .into());
        }

        let frame = src.split_to(end);
        src.advance(FRAME_TERMINATOR.len());
        serde_json::from_slice(&frame)
            .map(Some)
            .map_err(|e| NetworkError::Deserialization(e.to_string()).into())
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<T>, Error> {
        match self.decode(src)? {
            Some(item) => Ok(Some(item)),
            None if src.is_empty() => Ok(None),
            // Peer closed in the middle of a frame.
            None => Err(NetworkError::ConnectionClosed.into()),
        }
    }
}

impl<T: Serialize> Encoder<T> for FrameCodec<T> {
    type Error = Error;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), Error> {
        let body =
            serde_json::to_vec(&item).map_err(|e| NetworkError::Serialization(e.to_string()))?;
        if body.len() > self.max_frame_bytes {
            return Err(NetworkError::FrameTooLarge {
                size: body.len(),
                max: self.max_frame_bytes,
            }
            .into());
        }
        dst.reserve(body.len() + FRAME_TERMINATOR.len());
        dst.put_slice(&body);
        dst.put_slice(FRAME_TERMINATOR);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::rpc::{Identification, Message};

    fn ident(id: &str) -> Message {
        Message::Identification(Identification {
            client_id: id.to_string(),
        })
    }

    #[test]
    fn test_decode_waits_for_terminator() {
        let mut codec = FrameCodec::<Message>::new();
        let mut wire = BytesMut::new();
        codec.encode(ident("a"), &mut wire).unwrap();
        let full = wire.clone();

        let mut partial = BytesMut::from(&full[..full.len() - 1]);
        assert!(codec.decode(&mut partial).unwrap().is_none());
        partial.extend_from_slice(&full[full.len() - 1..]);
        assert_eq!(codec.decode(&mut partial).unwrap(), Some(ident("a")));
        assert!(partial.is_empty());
    }

    #[test]
    fn test_decode_two_frames_in_one_buffer() {
        let mut codec = FrameCodec::<Message>::new();
        let mut wire = BytesMut::new();
        codec.encode(ident("a"), &mut wire).unwrap();
        codec.encode(ident("b"), &mut wire).unwrap();
        assert_eq!(codec.decode(&mut wire).unwrap(), Some(ident("a")));
        assert_eq!(codec.decode(&mut wire).unwrap(), Some(ident("b")));
        assert_eq!(codec.decode(&mut wire).unwrap(), None);
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let mut codec = FrameCodec::<Message>::with_max_frame(16);
        let mut buf = BytesMut::from(&[b'x'; 32][..]);
        assert!(codec.decode(&mut buf).is_err());

        let mut out = BytesMut::new();
        assert!(codec.encode(ident("a-long-client-name"), &mut out).is_err());
    }

    #[test]
    fn test_malformed_frame_rejected() {
        let mut codec = FrameCodec::<Message>::new();
        let mut buf = BytesMut::from(&b"{oops}\n\r"[..]);
        assert!(codec.decode(&mut buf).is_err());
    }

    #[test]
    fn test_premature_close() {
        let mut codec = FrameCodec::<Message>::new();
        let mut buf = BytesMut::from(&b"{\"type\":"[..]);
        assert!(codec.decode_eof(&mut buf).is_err());

        let mut empty = BytesMut::new();
        assert!(codec.decode_eof(&mut empty).unwrap().is_none());
    }
}
