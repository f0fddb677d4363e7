//! Frame layout shared by every endpoint.
//!
//! A frame is a `u32` big-endian length prefix (handled by
//! [`LengthDelimitedCodec`]) followed by a fixed 20 byte header and the body:
//!
//! ```text
//! kind:u8 | status:u8 | topic_len:u16 | id:u64 | sequence:u64 | topic | payload
//! ```
//!
//! The header is fixed width so it can be parsed without scanning, and the
//! topic and payload are sliced out of the received buffer without copying.

use byteorder::{BigEndian, ByteOrder};
use bytes::{BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

use crate::errors::{TransportError, WireError};

pub const HEADER_LEN: usize = 20;
pub const DEFAULT_MAX_FRAME_LENGTH: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageKind {
    Request = 1,
    Reply = 2,
    Subscribe = 3,
    Unsubscribe = 4,
    Event = 5,
    Ready = 6,
    Cancel = 7,
}

impl TryFrom<u8> for MessageKind {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Request),
            2 => Ok(Self::Reply),
            3 => Ok(Self::Subscribe),
            4 => Ok(Self::Unsubscribe),
            5 => Ok(Self::Event),
            6 => Ok(Self::Ready),
            7 => Ok(Self::Cancel),
            other => Err(WireError::UnknownKind(other)),
        }
    }
}

/// Outcome carried by reply frames. Other kinds always use `Ok`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Status {
    Ok = 0,
    TimedOut = 1,
    QueueFull = 2,
    Cancelled = 3,
    UnknownRequest = 4,
    Failed = 5,
}

impl TryFrom<u8> for Status {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Ok),
            1 => Ok(Self::TimedOut),
            2 => Ok(Self::QueueFull),
            3 => Ok(Self::Cancelled),
            4 => Ok(Self::UnknownRequest),
            5 => Ok(Self::Failed),
            other => Err(WireError::UnknownStatus(other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: MessageKind,
    pub status: Status,
    pub id: u64,
    pub sequence: u64,
    topic: Bytes,
    pub payload: Bytes,
}

impl Frame {
    fn new(kind: MessageKind, id: u64, payload: Bytes) -> Self {
        Self {
            kind,
            status: Status::Ok,
            id,
            sequence: 0,
            topic: Bytes::new(),
            payload,
        }
    }

    pub fn request(id: u64, payload: impl Into<Bytes>) -> Self {
        Self::new(MessageKind::Request, id, payload.into())
    }

    pub fn reply(id: u64, status: Status, payload: impl Into<Bytes>) -> Self {
        let mut frame = Self::new(MessageKind::Reply, id, payload.into());
        frame.status = status;
        frame
    }

    pub fn subscribe(filter: &str) -> Self {
        let mut frame = Self::new(MessageKind::Subscribe, 0, Bytes::new());
        frame.topic = Bytes::copy_from_slice(filter.as_bytes());
        frame
    }

    pub fn unsubscribe(filter: &str) -> Self {
        let mut frame = Self::new(MessageKind::Unsubscribe, 0, Bytes::new());
        frame.topic = Bytes::copy_from_slice(filter.as_bytes());
        frame
    }

    pub fn event(topic: &str, sequence: u64, body: Bytes) -> Self {
        let mut frame = Self::new(MessageKind::Event, 0, body);
        frame.topic = Bytes::copy_from_slice(topic.as_bytes());
        frame.sequence = sequence;
        frame
    }

    pub fn ready() -> Self {
        Self::new(MessageKind::Ready, 0, Bytes::new())
    }

    pub fn cancel(id: u64) -> Self {
        Self::new(MessageKind::Cancel, id, Bytes::new())
    }

    pub fn topic(&self) -> &str {
        // validated as UTF-8 on decode and built from &str otherwise
        std::str::from_utf8(&self.topic).unwrap_or_default()
    }

    pub fn encoded_len(&self) -> usize {
        HEADER_LEN + self.topic.len() + self.payload.len()
    }

    pub fn encode(&self, dst: &mut BytesMut) -> Result<(), WireError> {
        let topic_len =
            u16::try_from(self.topic.len()).map_err(|_| WireError::TopicTooLong(self.topic.len()))?;

        let mut header = [0u8; HEADER_LEN];
        header[0] = self.kind as u8;
        header[1] = self.status as u8;
        BigEndian::write_u16(&mut header[2..4], topic_len);
        BigEndian::write_u64(&mut header[4..12], self.id);
        BigEndian::write_u64(&mut header[12..20], self.sequence);

        dst.reserve(self.encoded_len());
        dst.put_slice(&header);
        dst.put_slice(&self.topic);
        dst.put_slice(&self.payload);
        Ok(())
    }

    /// Parses one frame body (length prefix already stripped).
    pub fn decode(mut buf: Bytes) -> Result<Self, WireError> {
        if buf.len() < HEADER_LEN {
            return Err(WireError::Truncated(buf.len()));
        }

        let header = buf.split_to(HEADER_LEN);
        let kind = MessageKind::try_from(header[0])?;
        let status = Status::try_from(header[1])?;
        let topic_len = BigEndian::read_u16(&header[2..4]) as usize;
        let id = BigEndian::read_u64(&header[4..12]);
        let sequence = BigEndian::read_u64(&header[12..20]);

        if topic_len > buf.len() {
            return Err(WireError::TopicOverflow {
                topic_len,
                body_len: buf.len(),
            });
        }

        let topic = buf.split_to(topic_len);
        if std::str::from_utf8(&topic).is_err() {
            return Err(WireError::InvalidTopic);
        }

        Ok(Self {
            kind,
            status,
            id,
            sequence,
            topic,
            payload: buf,
        })
    }
}

/// Length-delimited framing plus header parsing.
#[derive(Debug)]
pub struct FrameCodec {
    inner: LengthDelimitedCodec,
}

impl FrameCodec {
    pub fn new(max_frame_length: usize) -> Self {
        Self {
            inner: LengthDelimitedCodec::builder()
                .length_field_type::<u32>()
                .max_frame_length(max_frame_length)
                .new_codec(),
        }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_LENGTH)
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = TransportError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, TransportError> {
        match self.inner.decode(src)? {
            Some(body) => Ok(Some(Frame::decode(body.freeze())?)),
            None => Ok(None),
        }
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = TransportError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), TransportError> {
        let mut body = BytesMut::with_capacity(frame.encoded_len());
        frame.encode(&mut body)?;
        self.inner.encode(body.freeze(), dst)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_frame(frame: Frame) -> BytesMut {
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::new();
        codec.encode(frame, &mut buf).unwrap();
        buf
    }

    #[test]
    fn header_is_fixed_width() {
        let buf = encode_frame(Frame::request(7, Bytes::from_static(b"Hello")));
        // 4 byte length prefix, 20 byte header, 5 byte payload
        assert_eq!(buf.len(), 4 + HEADER_LEN + 5);
        assert_eq!(BigEndian::read_u32(&buf[0..4]) as usize, HEADER_LEN + 5);
        assert_eq!(buf[4], MessageKind::Request as u8);
        assert_eq!(BigEndian::read_u64(&buf[8..16]), 7);
    }

    #[test]
    fn event_carries_topic_and_sequence() {
        let mut buf = encode_frame(Frame::event("weather", 42, Bytes::from_static(b"10001 21 40")));
        let frame = FrameCodec::default().decode(&mut buf).unwrap().unwrap();

        assert_eq!(frame.kind, MessageKind::Event);
        assert_eq!(frame.topic(), "weather");
        assert_eq!(frame.sequence, 42);
        assert_eq!(&frame.payload[..], b"10001 21 40");
    }

    #[test]
    fn fragmented_stream_yields_whole_frames() {
        let mut stream = encode_frame(Frame::reply(1, Status::Ok, Bytes::from_static(b"World")));
        stream.extend_from_slice(&encode_frame(Frame::reply(2, Status::TimedOut, Bytes::new())));

        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::new();
        let mut frames = Vec::new();
        for byte in stream.iter() {
            buf.put_u8(*byte);
            while let Some(frame) = codec.decode(&mut buf).unwrap() {
                frames.push(frame);
            }
        }

        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].id, 1);
        assert_eq!(&frames[0].payload[..], b"World");
        assert_eq!(frames[1].status, Status::TimedOut);
        assert!(frames[1].payload.is_empty());
    }

    #[test]
    fn large_payload_survives_framing() {
        let payload = Bytes::from(vec![0xAB; 200 * 1024]);
        let mut buf = encode_frame(Frame::request(3, payload.clone()));
        let frame = FrameCodec::default().decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.payload, payload);
    }

    #[test]
    fn rejects_short_header() {
        let err = Frame::decode(Bytes::from_static(&[1, 0, 0])).unwrap_err();
        assert_eq!(err, WireError::Truncated(3));
    }

    #[test]
    fn rejects_unknown_kind_and_status() {
        let mut raw = [0u8; HEADER_LEN];
        raw[0] = 99;
        assert_eq!(
            Frame::decode(Bytes::copy_from_slice(&raw)).unwrap_err(),
            WireError::UnknownKind(99)
        );

        raw[0] = MessageKind::Reply as u8;
        raw[1] = 77;
        assert_eq!(
            Frame::decode(Bytes::copy_from_slice(&raw)).unwrap_err(),
            WireError::UnknownStatus(77)
        );
    }

    #[test]
    fn rejects_topic_longer_than_body() {
        let mut raw = [0u8; HEADER_LEN + 2];
        raw[0] = MessageKind::Subscribe as u8;
        BigEndian::write_u16(&mut raw[2..4], 10);
        assert_eq!(
            Frame::decode(Bytes::copy_from_slice(&raw)).unwrap_err(),
            WireError::TopicOverflow {
                topic_len: 10,
                body_len: 2
            }
        );
    }

    #[test]
    fn rejects_invalid_utf8_topic() {
        let mut raw = vec![0u8; HEADER_LEN];
        raw[0] = MessageKind::Subscribe as u8;
        BigEndian::write_u16(&mut raw[2..4], 2);
        raw.extend_from_slice(&[0xff, 0xfe]);
        assert_eq!(
            Frame::decode(Bytes::from(raw)).unwrap_err(),
            WireError::InvalidTopic
        );
    }

    #[test]
    fn oversized_frames_are_rejected() {
        let mut codec = FrameCodec::new(64);
        let mut buf = BytesMut::new();
        let result = codec.encode(Frame::request(1, Bytes::from(vec![0; 128])), &mut buf);
        assert!(matches!(result, Err(TransportError::Io(_))));
    }
}
