use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::channel::Channel;
use crate::error::{Result, WireError};
use crate::message::RawMessage;

/// Frame header: magic (2) + length (4) + channel (2) = 8 bytes.
pub const HEADER_SIZE: usize = 8;

/// Magic bytes: "KM" (0x4B 0x4D).
pub const MAGIC: [u8; 2] = [0x4B, 0x4D];

/// Default maximum payload size: 16 MiB.
pub const DEFAULT_MAX_PAYLOAD: usize = 16 * 1024 * 1024;

const PART_COUNT_SIZE: usize = 2;
const PART_LEN_SIZE: usize = 4;

/// A kernel message tagged with the channel it travels on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// The channel this message belongs to.
    pub channel: Channel,
    /// The multipart message.
    pub message: RawMessage,
}

impl Envelope {
    /// Create a new envelope.
    pub fn new(channel: Channel, message: RawMessage) -> Self {
        Self { channel, message }
    }

    /// The total wire size of this envelope (header + payload).
    pub fn wire_size(&self) -> usize {
        HEADER_SIZE + payload_len(&self.message)
    }
}

fn payload_len(message: &RawMessage) -> usize {
    PART_COUNT_SIZE
        + message
            .parts()
            .iter()
            .map(|p| PART_LEN_SIZE + p.len())
            .sum::<usize>()
}

/// Encode an envelope into the wire format.
///
/// Wire format:
/// ```text
/// ┌──────────────┬───────────┬──────────┬──────────────────────────────┐
/// │ Magic (2B)   │ Length    │ Channel  │ Payload                      │
/// │ 0x4B 0x4D    │ (4B LE)   │ (2B LE)  │ count (2B LE)                │
/// │ "KM"         │           │          │ { len (4B LE) | part bytes } │
/// └──────────────┴───────────┴──────────┴──────────────────────────────┘
/// ```
pub fn encode_frame(envelope: &Envelope, max_payload: usize, dst: &mut BytesMut) -> Result<()> {
    let parts = envelope.message.parts();
    if parts.len() > usize::from(u16::MAX) {
        return Err(WireError::MalformedParts(format!(
            "{} parts exceed the limit of {}",
            parts.len(),
            u16::MAX
        )));
    }

    let len = payload_len(&envelope.message);
    let max = max_payload.min(u32::MAX as usize);
    if len > max {
        return Err(WireError::PayloadTooLarge { size: len, max });
    }

    dst.reserve(HEADER_SIZE + len);
    dst.put_slice(&MAGIC);
    dst.put_u32_le(len as u32);
    dst.put_u16_le(envelope.channel.id());
    dst.put_u16_le(parts.len() as u16);
    for part in parts {
        dst.put_u32_le(part.len() as u32);
        dst.put_slice(part);
    }
    Ok(())
}

/// Decode an envelope from a buffer.
///
/// Returns `Ok(None)` if the buffer doesn't contain a complete frame yet.
/// On success, consumes the frame bytes from the buffer. A complete frame
/// with an unknown channel or malformed parts is consumed before the error
/// is returned.
pub fn decode_frame(src: &mut BytesMut, max_payload: usize) -> Result<Option<Envelope>> {
    if src.len() < HEADER_SIZE {
        return Ok(None); // Need more data
    }

    if src[0..2] != MAGIC {
        return Err(WireError::InvalidMagic);
    }

    let payload_len = u32::from_le_bytes([src[2], src[3], src[4], src[5]]) as usize;
    let channel_id = u16::from_le_bytes([src[6], src[7]]);

    if payload_len > max_payload {
        return Err(WireError::PayloadTooLarge {
            size: payload_len,
            max: max_payload,
        });
    }

    let total = HEADER_SIZE + payload_len;
    if src.len() < total {
        src.reserve(total - src.len());
        return Ok(None); // Need more data
    }

    src.advance(HEADER_SIZE);
    let payload = src.split_to(payload_len).freeze();

    let channel = Channel::from_id(channel_id).ok_or(WireError::UnknownChannelId(channel_id))?;
    let parts = decode_parts(payload)?;

    Ok(Some(Envelope::new(channel, RawMessage::new(parts))))
}

fn decode_parts(mut payload: Bytes) -> Result<Vec<Bytes>> {
    if payload.len() < PART_COUNT_SIZE {
        return Err(WireError::MalformedParts("missing part count".into()));
    }
    let count = usize::from(payload.get_u16_le());

    let mut parts = Vec::with_capacity(count);
    for index in 0..count {
        if payload.len() < PART_LEN_SIZE {
            return Err(WireError::MalformedParts(format!(
                "part {index} of {count}: missing length"
            )));
        }
        let len = payload.get_u32_le() as usize;
        if payload.len() < len {
            return Err(WireError::MalformedParts(format!(
                "part {index} of {count}: {len} bytes declared, {} available",
                payload.len()
            )));
        }
        parts.push(payload.split_to(len));
    }

    if !payload.is_empty() {
        return Err(WireError::MalformedParts(format!(
            "{} trailing bytes after {count} parts",
            payload.len()
        )));
    }
    Ok(parts)
}

/// `tokio_util` codec for the kernel stream.
#[derive(Debug, Clone)]
pub struct KernelCodec {
    max_payload_size: usize,
}

impl KernelCodec {
    /// Create a codec with an explicit payload limit.
    pub fn new(max_payload_size: usize) -> Self {
        Self { max_payload_size }
    }

    /// Maximum accepted payload size in bytes.
    pub fn max_payload_size(&self) -> usize {
        self.max_payload_size
    }
}

impl Default for KernelCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PAYLOAD)
    }
}

impl Decoder for KernelCodec {
    type Item = Envelope;
    type Error = WireError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Envelope>> {
        decode_frame(src, self.max_payload_size)
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Envelope>> {
        match self.decode(buf)? {
            Some(envelope) => Ok(Some(envelope)),
            None if buf.is_empty() => Ok(None),
            None => Err(WireError::ConnectionClosed),
        }
    }
}

impl Encoder<Envelope> for KernelCodec {
    type Error = WireError;

    fn encode(&mut self, item: Envelope, dst: &mut BytesMut) -> Result<()> {
        encode_frame(&item, self.max_payload_size, dst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope(channel: Channel, parts: &[&'static [u8]]) -> Envelope {
        Envelope::new(
            channel,
            RawMessage::new(parts.iter().map(|p| Bytes::from_static(p)).collect()),
        )
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let mut buf = BytesMut::new();
        let original = envelope(Channel::Shell, &[b"{\"msg_id\":\"a\"}", b"{}", b"{}", b"{}"]);

        encode_frame(&original, DEFAULT_MAX_PAYLOAD, &mut buf).unwrap();
        assert_eq!(buf.len(), original.wire_size());

        let decoded = decode_frame(&mut buf, DEFAULT_MAX_PAYLOAD)
            .unwrap()
            .unwrap();
        assert_eq!(decoded, original);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_incomplete_header() {
        let mut buf = BytesMut::from(&[0x4B, 0x4D, 0x00][..]);
        let result = decode_frame(&mut buf, DEFAULT_MAX_PAYLOAD).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn test_decode_incomplete_payload() {
        let mut buf = BytesMut::new();
        encode_frame(
            &envelope(Channel::Iopub, &[b"hello"]),
            DEFAULT_MAX_PAYLOAD,
            &mut buf,
        )
        .unwrap();
        buf.truncate(HEADER_SIZE + 2);

        let result = decode_frame(&mut buf, DEFAULT_MAX_PAYLOAD).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn test_decode_invalid_magic() {
        let mut buf = BytesMut::from(&[0x49, 0x50, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00][..]);
        let result = decode_frame(&mut buf, DEFAULT_MAX_PAYLOAD);
        assert!(matches!(result, Err(WireError::InvalidMagic)));
    }

    #[test]
    fn test_decode_payload_too_large() {
        let mut buf = BytesMut::new();
        buf.put_slice(&MAGIC);
        buf.put_u32_le(1024 * 1024 * 32); // 32 MiB
        buf.put_u16_le(0);

        let result = decode_frame(&mut buf, DEFAULT_MAX_PAYLOAD);
        assert!(matches!(result, Err(WireError::PayloadTooLarge { .. })));
    }

    #[test]
    fn test_encode_respects_limit() {
        let mut buf = BytesMut::new();
        let result = encode_frame(&envelope(Channel::Shell, &[b"0123456789"]), 8, &mut buf);
        assert!(matches!(
            result,
            Err(WireError::PayloadTooLarge { size: 16, max: 8 })
        ));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_unknown_channel_consumes_frame() {
        let mut buf = BytesMut::new();
        buf.put_slice(&MAGIC);
        buf.put_u32_le(2);
        buf.put_u16_le(9);
        buf.put_u16_le(0);

        let result = decode_frame(&mut buf, DEFAULT_MAX_PAYLOAD);
        assert!(matches!(result, Err(WireError::UnknownChannelId(9))));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_malformed_parts() {
        let mut buf = BytesMut::new();
        buf.put_slice(&MAGIC);
        buf.put_u32_le(6);
        buf.put_u16_le(Channel::Shell.id());
        buf.put_u16_le(1);
        buf.put_u32_le(100); // declares more bytes than present

        let result = decode_frame(&mut buf, DEFAULT_MAX_PAYLOAD);
        assert!(matches!(result, Err(WireError::MalformedParts(_))));
    }

    #[test]
    fn test_multiple_frames_keep_order() {
        let mut buf = BytesMut::new();
        let first = envelope(Channel::Shell, &[b"first"]);
        let second = envelope(Channel::Heartbeat, &[b"second"]);
        encode_frame(&first, DEFAULT_MAX_PAYLOAD, &mut buf).unwrap();
        encode_frame(&second, DEFAULT_MAX_PAYLOAD, &mut buf).unwrap();

        let f1 = decode_frame(&mut buf, DEFAULT_MAX_PAYLOAD)
            .unwrap()
            .unwrap();
        let f2 = decode_frame(&mut buf, DEFAULT_MAX_PAYLOAD)
            .unwrap()
            .unwrap();
        assert_eq!(f1, first);
        assert_eq!(f2, second);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_empty_message() {
        let mut buf = BytesMut::new();
        let empty = Envelope::new(Channel::Control, RawMessage::default());
        encode_frame(&empty, DEFAULT_MAX_PAYLOAD, &mut buf).unwrap();
        assert_eq!(buf.len(), HEADER_SIZE + 2);

        let decoded = decode_frame(&mut buf, DEFAULT_MAX_PAYLOAD)
            .unwrap()
            .unwrap();
        assert!(decoded.message.is_empty());
    }

    #[test]
    fn test_decode_eof_with_partial_frame() {
        let mut codec = KernelCodec::default();
        let mut buf = BytesMut::from(&MAGIC[..]);
        assert!(matches!(
            codec.decode_eof(&mut buf),
            Err(WireError::ConnectionClosed)
        ));
        assert!(codec.decode_eof(&mut BytesMut::new()).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_framed_over_duplex() {
        use futures_util::{SinkExt, StreamExt};
        use tokio_util::codec::Framed;

        let (a, b) = tokio::io::duplex(64);
        let mut left = Framed::new(a, KernelCodec::default());
        let mut right = Framed::new(b, KernelCodec::default());

        let big = vec![7u8; 1000];
        let sent = Envelope::new(
            Channel::Stdin,
            RawMessage::new(vec![Bytes::from_static(b"{}"), Bytes::from(big)]),
        );
        let send = tokio::spawn(async move {
            left.send(sent).await.unwrap();
            left
        });

        let received = right.next().await.unwrap().unwrap();
        assert_eq!(received.channel, Channel::Stdin);
        assert_eq!(received.message.parts()[1].len(), 1000);
        send.await.unwrap();
    }
}
