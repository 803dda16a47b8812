//! Wire codec: length-prefixed frames with a checksummed payload.
//!
//! [`encode`] and [`decode`] work on plain byte slices; [`FrameCodec`]
//! adapts them to `tokio_util` framing. Decoding is streaming-safe: a
//! partial frame yields [`LoopError::NeedMoreData`] and consumes nothing,
//! so callers keep appending to the same buffer.

use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::LoopError;
use crate::header::{FrameHeader, FrameHeaderBytes, HEADER_SIZE};
use crate::message::Message;

/// Largest payload a single frame may carry (1 MiB).
pub const MAX_PAYLOAD_SIZE: usize = 1024 * 1024;

/// Largest complete frame.
pub const MAX_FRAME_SIZE: usize = HEADER_SIZE + MAX_PAYLOAD_SIZE;

/// Serialize `message` into one complete frame.
pub fn encode(message: &Message) -> Result<Vec<u8>, LoopError> {
    let payload = message.payload_bytes()?;
    if payload.len() > MAX_PAYLOAD_SIZE {
        return Err(LoopError::PayloadTooLarge {
            size: payload.len(),
            max: MAX_PAYLOAD_SIZE,
        });
    }
    let header = FrameHeader::for_payload(message.kind(), &payload)?;
    let mut frame = Vec::with_capacity(HEADER_SIZE + payload.len());
    frame.extend_from_slice(&header.to_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Decode the first frame in `src`.
///
/// Returns the message and the number of bytes it occupied. Trailing
/// bytes belong to the next frame and are left alone.
pub fn decode(src: &[u8]) -> Result<(Message, usize), LoopError> {
    if src.len() < HEADER_SIZE {
        return Err(LoopError::NeedMoreData {
            needed: HEADER_SIZE - src.len(),
        });
    }

    let mut header_bytes: FrameHeaderBytes = [0; HEADER_SIZE];
    header_bytes.copy_from_slice(&src[..HEADER_SIZE]);
    let header = FrameHeader::from_bytes(&header_bytes)?;

    let length = header.payload_length();
    if length > MAX_PAYLOAD_SIZE {
        return Err(LoopError::PayloadTooLarge {
            size: length,
            max: MAX_PAYLOAD_SIZE,
        });
    }

    let total = HEADER_SIZE + length;
    if src.len() < total {
        return Err(LoopError::NeedMoreData {
            needed: total - src.len(),
        });
    }

    let payload = &src[HEADER_SIZE..total];
    if !header.verify(payload) {
        return Err(LoopError::MalformedFrame("checksum mismatch"));
    }

    let message = Message::from_payload(header.kind(), payload)?;
    Ok((message, total))
}

// ── FrameCodec ───────────────────────────────────────────────────

/// `tokio_util` codec for framed TCP I/O.
#[derive(Debug, Default, Clone, Copy)]
pub struct FrameCodec;

impl FrameCodec {
    pub fn new() -> Self {
        Self
    }
}

impl Decoder for FrameCodec {
    type Item = Message;
    type Error = LoopError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match decode(&src[..]) {
            Ok((message, consumed)) => {
                src.advance(consumed);
                Ok(Some(message))
            }
            Err(LoopError::NeedMoreData { needed }) => {
                src.reserve(needed);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}

impl Encoder<Message> for FrameCodec {
    type Error = LoopError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let frame = encode(&item)?;
        dst.extend_from_slice(&frame);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::PROTOCOL_VERSION;
    use crate::message::{CommandFrame, CommandKind, Hello, ResponseFrame, Status, Welcome};
    use futures::StreamExt;
    use tokio_util::codec::FramedRead;

    fn sample_messages() -> Vec<Message> {
        vec![
            Message::Hello(Hello {
                client_name: "tests".into(),
                token: Some("secret".into()),
                resume: Some(12),
                capabilities: 0b101,
            }),
            Message::Welcome(Welcome {
                session_id: 12,
                last_applied: 5,
                resumed: true,
                capabilities: 1,
            }),
            Message::Command(CommandFrame {
                id: 6,
                kind: CommandKind::InjectEvent,
                args: br#"{"method":"set_title","args":["x"]}"#.to_vec(),
            }),
            Message::Response(ResponseFrame::rejected(6, Status::Stale, "already applied")),
            Message::Ping { nonce: u64::MAX },
            Message::Pong { nonce: 0 },
            Message::Shutdown {
                reason: String::new(),
            },
        ]
    }

    #[test]
    fn decode_inverts_encode() {
        for message in sample_messages() {
            let frame = encode(&message).unwrap();
            let (decoded, consumed) = decode(&frame).unwrap();
            assert_eq!(decoded, message);
            assert_eq!(consumed, frame.len());
        }
    }

    #[test]
    fn partial_frame_needs_more_data() {
        let frame = encode(&Message::Ping { nonce: 1 }).unwrap();
        assert!(matches!(
            decode(&frame[..4]),
            Err(LoopError::NeedMoreData { needed }) if needed == HEADER_SIZE - 4
        ));
        assert!(matches!(
            decode(&frame[..frame.len() - 1]),
            Err(LoopError::NeedMoreData { needed: 1 })
        ));
    }

    #[test]
    fn checksum_mismatch_is_malformed() {
        let mut frame = encode(&Message::Shutdown {
            reason: "bye".into(),
        })
        .unwrap();
        let last = frame.len() - 1;
        frame[last] ^= 0xFF;
        assert!(matches!(decode(&frame), Err(LoopError::MalformedFrame(_))));
    }

    #[test]
    fn unknown_version_is_unsupported() {
        let mut frame = encode(&Message::Ping { nonce: 1 }).unwrap();
        frame[0..2].copy_from_slice(&(PROTOCOL_VERSION + 1).to_le_bytes());
        assert!(matches!(
            decode(&frame),
            Err(LoopError::UnsupportedVersion(v)) if v == PROTOCOL_VERSION + 1
        ));
    }

    #[test]
    fn oversized_length_rejected_from_header_alone() {
        let mut frame = encode(&Message::Ping { nonce: 1 }).unwrap();
        frame[3..7].copy_from_slice(&((MAX_PAYLOAD_SIZE as u32) + 1).to_le_bytes());
        assert!(matches!(
            decode(&frame[..HEADER_SIZE]),
            Err(LoopError::PayloadTooLarge { .. })
        ));
    }

    #[test]
    fn codec_keeps_partial_bytes_between_calls() {
        let mut codec = FrameCodec::new();
        let first = encode(&Message::Ping { nonce: 1 }).unwrap();
        let second = encode(&Message::Pong { nonce: 2 }).unwrap();
        let mut stream = first.clone();
        stream.extend_from_slice(&second);

        let mut buf = BytesMut::new();
        let mut decoded = Vec::new();
        for byte in stream {
            buf.extend_from_slice(&[byte]);
            while let Some(message) = codec.decode(&mut buf).unwrap() {
                decoded.push(message);
            }
        }
        assert_eq!(
            decoded,
            vec![Message::Ping { nonce: 1 }, Message::Pong { nonce: 2 }]
        );
        assert!(buf.is_empty());
    }

    #[tokio::test]
    async fn framed_read_over_fragmented_stream() {
        let frame = encode(&Message::Command(CommandFrame {
            id: 1,
            kind: CommandKind::Ping,
            args: vec![9; 64],
        }))
        .unwrap();
        let (head, tail) = frame.split_at(HEADER_SIZE + 3);
        let mock = tokio_test::io::Builder::new()
            .read(&head[..5])
            .read(&head[5..])
            .read(tail)
            .build();

        let mut reader = FramedRead::new(mock, FrameCodec::new());
        let message = reader.next().await.unwrap().unwrap();
        assert!(matches!(message, Message::Command(ref c) if c.id == 1 && c.args.len() == 64));
        assert!(reader.next().await.is_none());
    }
}
