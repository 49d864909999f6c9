use std::io;

use bytes::{Buf as _, BufMut as _, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::mux::StatusCode;
use crate::Error;

/// Hard ceiling on the length-delimited frame body.
pub const MAX_FRAME_SIZE: usize = 4 * 1024 * 1024;

const KIND_INVOKE: u8 = 1;
const KIND_RESPONSE: u8 = 2;
const KIND_ERROR: u8 = 3;

/// Request metadata carried by an invoke frame.
///
/// Keys are free-form; the serving engine gives meaning to
/// [`crate::TRACE_ID_KEY`] and [`crate::EXPERIMENT_KEY`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Metadata(Vec<(String, String)>);

impl Metadata {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.push((key.into(), value.into()));
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// A single wire frame.
///
/// Layout on the wire: `u32` big-endian body length, `u8` kind, body.
/// An invoke body is `u16` method length, method, `u16` metadata entry
/// count, entries (`u16`-prefixed key and value), then the payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Invoke {
        method: String,
        metadata: Metadata,
        payload: Bytes,
    },
    Response {
        payload: Bytes,
    },
    Error {
        code: StatusCode,
        message: String,
    },
}

impl Frame {
    fn decode(mut body: Bytes) -> Result<Self, Error> {
        if body.is_empty() {
            return Err(Error::Malformed { reason: "empty frame body" });
        }

        let kind = body.get_u8();

        match kind {
            KIND_INVOKE => {
                let method = take_string(&mut body, "method")?;

                if body.remaining() < 2 {
                    return Err(Error::Malformed { reason: "truncated metadata count" });
                }
                let count = body.get_u16();

                let mut metadata = Metadata::new();
                for _ in 0..count {
                    let key = take_string(&mut body, "metadata key")?;
                    let value = take_string(&mut body, "metadata value")?;
                    metadata.insert(key, value);
                }

                Ok(Frame::Invoke {
                    method,
                    metadata,
                    payload: body,
                })
            }
            KIND_RESPONSE => Ok(Frame::Response { payload: body }),
            KIND_ERROR => {
                if body.remaining() < 2 {
                    return Err(Error::Malformed { reason: "truncated status code" });
                }
                let code = StatusCode::from_u16(body.get_u16());
                let message = String::from_utf8(body.to_vec())
                    .map_err(|_| Error::Malformed { reason: "status message is not utf-8" })?;
                Ok(Frame::Error { code, message })
            }
            kind => Err(Error::UnexpectedKind { kind }),
        }
    }

    fn encode_body(&self, dst: &mut BytesMut) -> Result<(), Error> {
        match self {
            Frame::Invoke {
                method,
                metadata,
                payload,
            } => {
                dst.put_u8(KIND_INVOKE);
                put_string(dst, method, "method")?;
                let count = u16::try_from(metadata.len())
                    .map_err(|_| Error::Malformed { reason: "too many metadata entries" })?;
                dst.put_u16(count);
                for (key, value) in metadata.iter() {
                    put_string(dst, key, "metadata key")?;
                    put_string(dst, value, "metadata value")?;
                }
                dst.put_slice(payload);
            }
            Frame::Response { payload } => {
                dst.put_u8(KIND_RESPONSE);
                dst.put_slice(payload);
            }
            Frame::Error { code, message } => {
                dst.put_u8(KIND_ERROR);
                dst.put_u16(code.as_u16());
                dst.put_slice(message.as_bytes());
            }
        }

        Ok(())
    }
}

fn take_string(src: &mut Bytes, what: &'static str) -> Result<String, Error> {
    if src.remaining() < 2 {
        return Err(Error::Malformed { reason: what });
    }
    let len = src.get_u16() as usize;
    if src.remaining() < len {
        return Err(Error::Malformed { reason: what });
    }
    let raw = src.split_to(len);
    String::from_utf8(raw.to_vec()).map_err(|_| Error::Malformed { reason: what })
}

fn put_string(dst: &mut BytesMut, s: &str, what: &'static str) -> Result<(), Error> {
    let len = u16::try_from(s.len()).map_err(|_| Error::Malformed { reason: what })?;
    dst.put_u16(len);
    dst.put_slice(s.as_bytes());
    Ok(())
}

pub struct FrameCodec;

impl Decoder for FrameCodec {
    type Item = Frame;

    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        const MAX_RESERVE_CHUNK_IN_BYTES: usize = 8 * 1024; // 8 kiB

        if src.len() < 4 {
            // Not enough data to read the length marker.
            return Ok(None);
        }

        let mut length_bytes = [0u8; 4];
        length_bytes.copy_from_slice(&src[..4]);
        let length = u32::from_be_bytes(length_bytes) as usize;

        if length > MAX_FRAME_SIZE {
            return Err(io::Error::other(Error::FrameTooLarge { size: length }));
        }

        if src.len() < 4 + length {
            // The full frame has not arrived yet.
            // Reserve more space in the buffer (good performance-wise).
            let additional = core::cmp::min(MAX_RESERVE_CHUNK_IN_BYTES, 4 + length - src.len());
            src.reserve(additional);

            // Inform the Framed that more bytes are required to form the next frame.
            return Ok(None);
        }

        src.advance(4);
        let body = src.split_to(length).freeze();

        Frame::decode(body).map(Some).map_err(io::Error::other)
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let start = dst.len();
        dst.put_u32(0);
        if let Err(error) = item.encode_body(dst) {
            dst.truncate(start);
            return Err(io::Error::other(error));
        }

        let length = dst.len() - start - 4;
        if length > MAX_FRAME_SIZE {
            dst.truncate(start);
            return Err(io::Error::other(Error::FrameTooLarge { size: length }));
        }

        let length = u32::try_from(length).expect("frame length fits u32 after size check");
        dst[start..start + 4].copy_from_slice(&length.to_be_bytes());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use bytes::BufMut as _;
    use futures_util::StreamExt as _;
    use tokio_util::codec::FramedRead;

    fn encode(frame: Frame) -> BytesMut {
        let mut buf = BytesMut::new();
        FrameCodec.encode(frame, &mut buf).unwrap();
        buf
    }

    #[tokio::test]
    async fn invoke_round_trip() {
        let mut metadata = Metadata::new();
        metadata.insert("trace-id", "00f067aa0ba902b7");

        let frame = Frame::Invoke {
            method: "catalog.Health".to_owned(),
            metadata,
            payload: Bytes::from_static(b"\x01\x02\x03"),
        };

        let raw = encode(frame.clone());

        let mut framed = FramedRead::new(&raw[..], FrameCodec);
        let decoded = framed.next().await.unwrap().unwrap();

        assert_eq!(frame, decoded);
    }

    #[tokio::test]
    async fn error_round_trip() {
        let frame = Frame::Error {
            code: StatusCode::Unimplemented,
            message: "no such method".to_owned(),
        };

        let raw = encode(frame.clone());
        let mut framed = FramedRead::new(&raw[..], FrameCodec);
        let decoded = framed.next().await.unwrap().unwrap();

        assert_eq!(frame, decoded);
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let mut raw = BytesMut::new();
        raw.put_u32(u32::try_from(MAX_FRAME_SIZE + 1).unwrap());
        raw.put_u8(KIND_RESPONSE);

        let error = FrameCodec.decode(&mut raw).unwrap_err();
        assert!(error.to_string().contains("byte limit"));
    }

    #[test]
    fn partial_frame_waits_for_more() {
        let full = encode(Frame::Response {
            payload: Bytes::from_static(b"partial"),
        });

        let mut partial = BytesMut::from(&full[..full.len() - 2]);
        assert!(FrameCodec.decode(&mut partial).unwrap().is_none());

        partial.extend_from_slice(&full[full.len() - 2..]);
        assert!(FrameCodec.decode(&mut partial).unwrap().is_some());
    }
}
