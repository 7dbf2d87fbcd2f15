//! Binary frame codec spoken by the speech upstream
//!
//! Every frame starts with a header of `header_size * 4` bytes. The first
//! four bytes pack `version | header_size`, `message_type | flags` and
//! `serialization | compression` into nibbles, followed by a reserved byte.
//! Longer headers carry extension bytes that are skipped. After the header
//! come an error code (error frames only), a sequence number (when flagged),
//! a big-endian `u32` payload length and the payload itself. All integers are
//! big-endian. Gzip-compressed payloads are inflated on decode; this codec
//! always writes uncompressed frames.

use std::io::{self, Read};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use flate2::read::GzDecoder;
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

pub const PROTOCOL_VERSION: u8 = 0b0001;

/// Header length of the frames this codec writes, in 4-byte words
const HEADER_WORDS: u8 = 1;
const HEADER_LEN: usize = 4;

const FLAG_SEQUENCE: u8 = 0b0001;
const FLAG_LAST: u8 = 0b0010;

const COMPRESSION_NONE: u8 = 0b0000;
const COMPRESSION_GZIP: u8 = 0b0001;

/// Largest payload accepted from the wire
pub const MAX_PAYLOAD_LEN: usize = 32 << 20;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u8),

    #[error("invalid header size {0}")]
    InvalidHeaderSize(u8),

    #[error("unknown message type {0:#x}")]
    UnknownMessageType(u8),

    #[error("unknown serialization {0:#x}")]
    UnknownSerialization(u8),

    #[error("unsupported compression {0:#x}")]
    UnsupportedCompression(u8),

    #[error("payload of {0} bytes exceeds the frame limit")]
    PayloadTooLarge(usize),

    #[error("gzip payload could not be inflated: {0}")]
    Inflate(#[source] io::Error),

    /// Error frame sent by the upstream
    #[error("upstream error {code}: {message}")]
    Remote { code: u32, message: String },

    #[error("stream ended before the final frame")]
    MissingFinalFrame,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    FullClientRequest,
    AudioOnlyRequest,
    FullServerResponse,
    AudioOnlyResponse,
    Error,
}

impl MessageType {
    const fn code(self) -> u8 {
        match self {
            Self::FullClientRequest => 0x1,
            Self::AudioOnlyRequest => 0x2,
            Self::FullServerResponse => 0x9,
            Self::AudioOnlyResponse => 0xB,
            Self::Error => 0xF,
        }
    }

    const fn from_code(code: u8) -> Option<Self> {
        match code {
            0x1 => Some(Self::FullClientRequest),
            0x2 => Some(Self::AudioOnlyRequest),
            0x9 => Some(Self::FullServerResponse),
            0xB => Some(Self::AudioOnlyResponse),
            0xF => Some(Self::Error),
            _ => None,
        }
    }
}

/// Payload encoding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Serialization {
    Raw,
    Json,
}

impl Serialization {
    const fn code(self) -> u8 {
        match self {
            Self::Raw => 0x0,
            Self::Json => 0x1,
        }
    }

    const fn from_code(code: u8) -> Option<Self> {
        match code {
            0x0 => Some(Self::Raw),
            0x1 => Some(Self::Json),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub message_type: MessageType,
    pub serialization: Serialization,
    /// Wire sequence number; negative marks the last frame
    pub sequence: Option<i32>,
    pub last: bool,
    /// Present on error frames only
    pub error_code: Option<u32>,
    pub payload: Bytes,
}

impl Frame {
    /// JSON request that opens a call
    pub fn client_request(payload: impl Into<Bytes>) -> Self {
        Self::new(MessageType::FullClientRequest, Serialization::Json, payload)
    }

    /// Raw audio sent by the client
    pub fn audio_request(payload: impl Into<Bytes>, last: bool) -> Self {
        Self {
            last,
            ..Self::new(MessageType::AudioOnlyRequest, Serialization::Raw, payload)
        }
    }

    /// JSON result sent by the server
    pub fn server_response(payload: impl Into<Bytes>) -> Self {
        Self {
            last: true,
            ..Self::new(MessageType::FullServerResponse, Serialization::Json, payload)
        }
    }

    /// Numbered chunk of synthesized audio
    pub fn audio_response(sequence: i32, last: bool, payload: impl Into<Bytes>) -> Self {
        let sequence = if last { -sequence.abs() } else { sequence.abs() };
        Self {
            sequence: Some(sequence),
            last,
            ..Self::new(MessageType::AudioOnlyResponse, Serialization::Raw, payload)
        }
    }

    pub fn error(code: u32, message: &str) -> Self {
        Self {
            error_code: Some(code),
            last: true,
            ..Self::new(MessageType::Error, Serialization::Raw, Bytes::copy_from_slice(message.as_bytes()))
        }
    }

    fn new(message_type: MessageType, serialization: Serialization, payload: impl Into<Bytes>) -> Self {
        Self {
            message_type,
            serialization,
            sequence: None,
            last: false,
            error_code: None,
            payload: payload.into(),
        }
    }

    /// Whether no further frame follows in this direction
    pub fn is_last(&self) -> bool {
        self.last || self.sequence.is_some_and(i32::is_negative)
    }

    /// Turn an error frame into the error it carries
    pub fn into_remote_error(self) -> Option<FrameError> {
        let code = self.error_code?;
        Some(FrameError::Remote {
            code,
            message: String::from_utf8_lossy(&self.payload).into_owned(),
        })
    }

    /// Encode into a standalone buffer
    pub fn to_bytes(&self) -> Result<Bytes, FrameError> {
        let mut buf = BytesMut::new();
        FrameCodec.encode(self.clone(), &mut buf)?;
        Ok(buf.freeze())
    }

    const fn flags(&self) -> u8 {
        let mut flags = 0;
        if self.sequence.is_some() {
            flags |= FLAG_SEQUENCE;
        }
        if self.last {
            flags |= FLAG_LAST;
        }
        flags
    }
}

/// Incremental codec for [`Frame`]s
///
/// Decoding consumes nothing until a whole frame is buffered, so it can be
/// fed arbitrarily split network chunks.
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameCodec;

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, FrameError> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        let version = src[0] >> 4;
        if version != PROTOCOL_VERSION {
            return Err(FrameError::UnsupportedVersion(version));
        }

        let header_words = src[0] & 0x0f;
        if header_words == 0 {
            return Err(FrameError::InvalidHeaderSize(header_words));
        }
        let header_len = usize::from(header_words) * 4;

        let message_type = MessageType::from_code(src[1] >> 4).ok_or(FrameError::UnknownMessageType(src[1] >> 4))?;
        let flags = src[1] & 0x0f;
        let serialization =
            Serialization::from_code(src[2] >> 4).ok_or(FrameError::UnknownSerialization(src[2] >> 4))?;
        let compression = src[2] & 0x0f;
        if !matches!(compression, COMPRESSION_NONE | COMPRESSION_GZIP) {
            return Err(FrameError::UnsupportedCompression(compression));
        }

        let mut prefix_len = header_len;
        if message_type == MessageType::Error {
            prefix_len += 4;
        }
        if flags & FLAG_SEQUENCE != 0 {
            prefix_len += 4;
        }
        prefix_len += 4;

        if src.len() < prefix_len {
            src.reserve(prefix_len - src.len());
            return Ok(None);
        }

        let mut length_field = &src[prefix_len - 4..prefix_len];
        let payload_len = usize::try_from(length_field.get_u32()).unwrap_or(usize::MAX);
        if payload_len > MAX_PAYLOAD_LEN {
            return Err(FrameError::PayloadTooLarge(payload_len));
        }

        let frame_len = prefix_len + payload_len;
        if src.len() < frame_len {
            src.reserve(frame_len - src.len());
            return Ok(None);
        }

        let mut frame = src.split_to(frame_len);
        frame.advance(header_len);
        let error_code = (message_type == MessageType::Error).then(|| frame.get_u32());
        let sequence = (flags & FLAG_SEQUENCE != 0).then(|| frame.get_i32());
        frame.advance(4);

        let payload = if compression == COMPRESSION_GZIP {
            inflate(&frame)?
        } else {
            frame.freeze()
        };

        Ok(Some(Frame {
            message_type,
            serialization,
            sequence,
            last: flags & FLAG_LAST != 0,
            error_code,
            payload,
        }))
    }
}

/// Inflate a gzip payload, refusing output past the payload limit
fn inflate(compressed: &[u8]) -> Result<Bytes, FrameError> {
    let limit = u64::try_from(MAX_PAYLOAD_LEN).unwrap_or(u64::MAX).saturating_add(1);
    let mut inflated = Vec::new();
    GzDecoder::new(compressed)
        .take(limit)
        .read_to_end(&mut inflated)
        .map_err(FrameError::Inflate)?;

    if inflated.len() > MAX_PAYLOAD_LEN {
        return Err(FrameError::PayloadTooLarge(inflated.len()));
    }
    Ok(Bytes::from(inflated))
}

impl Encoder<Frame> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), FrameError> {
        if frame.payload.len() > MAX_PAYLOAD_LEN {
            return Err(FrameError::PayloadTooLarge(frame.payload.len()));
        }
        let payload_len =
            u32::try_from(frame.payload.len()).map_err(|_| FrameError::PayloadTooLarge(frame.payload.len()))?;

        dst.reserve(HEADER_LEN + 12 + frame.payload.len());
        dst.put_u8((PROTOCOL_VERSION << 4) | HEADER_WORDS);
        dst.put_u8((frame.message_type.code() << 4) | frame.flags());
        dst.put_u8((frame.serialization.code() << 4) | COMPRESSION_NONE);
        dst.put_u8(0);

        if frame.message_type == MessageType::Error {
            dst.put_u32(frame.error_code.unwrap_or_default());
        }
        if let Some(sequence) = frame.sequence {
            dst.put_i32(sequence);
        }
        dst.put_u32(payload_len);
        dst.put_slice(&frame.payload);
        Ok(())
    }
}

/// Decode every complete frame of a fully buffered body
///
/// Trailing bytes that do not form a whole frame are an error.
pub fn decode_all(body: &[u8]) -> Result<Vec<Frame>, FrameError> {
    let mut codec = FrameCodec;
    let mut buf = BytesMut::from(body);
    let mut frames = Vec::new();
    while let Some(frame) = codec.decode_eof(&mut buf)? {
        frames.push(frame);
    }
    Ok(frames)
}
