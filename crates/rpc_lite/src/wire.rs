//! Envelopes and length-delimited framing on a byte stream.
//!
//! Each frame on the wire is a big-endian `u32` length followed by one
//! protobuf-encoded [`RequestFrame`] or [`ResponseFrame`]. The payload inside
//! an envelope is opaque to this layer.

use async_stream::stream;
use bytes::Bytes;
use futures::{SinkExt, Stream, StreamExt};
use prost::Message;
use std::collections::HashMap;
use std::pin::Pin;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use tonic::Code;

use crate::error::RpcError;

pub const DEFAULT_MAX_FRAME_LENGTH: usize = 4 * 1024 * 1024;

/// A call as sent by the client.
#[derive(Clone, PartialEq, prost::Message)]
pub struct RequestFrame {
    #[prost(uint64, tag = "1")]
    pub call_id: u64,
    #[prost(string, tag = "2")]
    pub method: String,
    /// Zero means no deadline.
    #[prost(uint64, tag = "3")]
    pub timeout_ms: u64,
    #[prost(map = "string, string", tag = "4")]
    pub metadata: HashMap<String, String>,
    #[prost(bytes = "bytes", tag = "5")]
    pub payload: Bytes,
}

impl RequestFrame {
    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_ms > 0).then(|| Duration::from_millis(self.timeout_ms))
    }
}

/// The outcome of a call, correlated by `call_id`.
#[derive(Clone, PartialEq, prost::Message)]
pub struct ResponseFrame {
    #[prost(uint64, tag = "1")]
    pub call_id: u64,
    /// A `tonic::Code` value; `Ok` carries a payload.
    #[prost(int32, tag = "2")]
    pub code: i32,
    #[prost(string, tag = "3")]
    pub message: String,
    #[prost(bytes = "bytes", tag = "4")]
    pub payload: Bytes,
}

impl ResponseFrame {
    pub fn ok(call_id: u64, payload: Bytes) -> Self {
        Self {
            call_id,
            code: Code::Ok as i32,
            message: String::new(),
            payload,
        }
    }

    pub fn error(call_id: u64, err: &RpcError) -> Self {
        Self {
            call_id,
            code: err.code() as i32,
            message: err.wire_message(),
            payload: Bytes::new(),
        }
    }

    pub fn from_result(call_id: u64, result: &Result<Bytes, RpcError>) -> Self {
        match result {
            Ok(payload) => Self::ok(call_id, payload.clone()),
            Err(e) => Self::error(call_id, e),
        }
    }

    pub fn into_result(self) -> Result<Bytes, RpcError> {
        if self.code == Code::Ok as i32 {
            Ok(self.payload)
        } else {
            Err(RpcError::from_wire(self.code, self.message))
        }
    }
}

pub fn codec(max_frame_length: usize) -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(max_frame_length)
        .new_codec()
}

/// A stream of decoded envelopes read from a byte stream.
///
/// The stream ends after the first transport or decode error.
pub struct FrameReader<M> {
    inner: Pin<Box<dyn Stream<Item = Result<M, RpcError>> + Send>>,
}

impl<M: Message + Default + Send + 'static> FrameReader<M> {
    pub fn new<R>(io: R, max_frame_length: usize) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let mut frames = FramedRead::new(io, codec(max_frame_length));
        let inner = stream! {
            while let Some(frame) = frames.next().await {
                match frame {
                    Ok(buf) => match M::decode(buf.freeze()) {
                        Ok(msg) => yield Ok(msg),
                        Err(e) => {
                            yield Err(RpcError::from(e));
                            break;
                        }
                    },
                    Err(e) => {
                        yield Err(RpcError::Transport(e));
                        break;
                    }
                }
            }
        };

        Self {
            inner: Box::pin(inner),
        }
    }
}

impl<M> Stream for FrameReader<M> {
    type Item = Result<M, RpcError>;

    fn poll_next(
        mut self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}

/// Writes envelopes to a byte stream.
pub struct FrameWriter<W> {
    inner: FramedWrite<W, LengthDelimitedCodec>,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(io: W, max_frame_length: usize) -> Self {
        Self {
            inner: FramedWrite::new(io, codec(max_frame_length)),
        }
    }

    /// Encode and flush one envelope.
    pub async fn send<M: Message>(&mut self, msg: &M) -> Result<(), RpcError> {
        self.inner.send(Bytes::from(msg.encode_to_vec())).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frames_cross_a_duplex_pipe() {
        let (client, server) = tokio::io::duplex(1024);
        let mut writer = FrameWriter::new(client, DEFAULT_MAX_FRAME_LENGTH);
        let mut reader = FrameReader::<RequestFrame>::new(server, DEFAULT_MAX_FRAME_LENGTH);

        let mut metadata = HashMap::new();
        metadata.insert("authorization".to_string(), "Bearer t".to_string());
        let sent = RequestFrame {
            call_id: 3,
            method: "user.User/Ping".into(),
            timeout_ms: 250,
            metadata,
            payload: Bytes::from_static(b"\x0a\x01x"),
        };
        writer.send(&sent).await.unwrap();
        drop(writer);

        let received = reader.next().await.unwrap().unwrap();
        assert_eq!(received, sent);
        assert_eq!(received.timeout(), Some(Duration::from_millis(250)));
        assert!(reader.next().await.is_none());
    }

    #[tokio::test]
    async fn test_oversized_frame_ends_stream() {
        let (client, server) = tokio::io::duplex(4096);
        let mut writer = FrameWriter::new(client, DEFAULT_MAX_FRAME_LENGTH);
        let mut reader = FrameReader::<RequestFrame>::new(server, 16);

        writer
            .send(&RequestFrame {
                method: "x".repeat(64),
                ..Default::default()
            })
            .await
            .unwrap();

        assert!(matches!(reader.next().await, Some(Err(RpcError::Transport(_)))));
        assert!(reader.next().await.is_none());
    }

    #[test]
    fn test_response_frame_carries_error_kind() {
        let frame = ResponseFrame::error(9, &RpcError::UnknownMethod("user.User/Echo".into()));
        assert_eq!(frame.call_id, 9);
        assert!(matches!(
            frame.into_result(),
            Err(RpcError::UnknownMethod(name)) if name == "user.User/Echo"
        ));

        let ok = ResponseFrame::ok(1, Bytes::from_static(b"pong"));
        assert_eq!(ok.into_result().unwrap(), Bytes::from_static(b"pong"));
    }

    #[test]
    fn test_zero_timeout_means_none() {
        assert_eq!(RequestFrame::default().timeout(), None);
    }
}
