//! Wire protocol shared by the editor and the engine process.
//!
//! Every message on the channel is a fixed eight byte header followed by the
//! payload:
//! - a 4-byte little-endian type tag
//! - a 4-byte little-endian payload length
//!
//! Tags are stable identifiers. A peer speaking a newer protocol may send tags
//! this crate does not know; those still frame correctly and surface as
//! [`WireError::UnknownType`] when typed decoding is attempted.

mod packet;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

pub use packet::{
    CursorPos, CursorState, DmaBuffer, Extent, ForeignKind, FramePixels, KeyboardState, LogLine,
    LogSeverity, MouseState, Packet, ProfileSample, TimingSample,
};

/// Size of the frame header in bytes.
pub const HEADER_LEN: usize = 8;

/// Largest payload accepted from a peer. Big enough for an uncompressed 8K RGBA frame.
pub const MAX_PAYLOAD: usize = 256 * 1024 * 1024;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("unknown message type {tag} ({len} bytes)")]
    UnknownType { tag: u32, len: usize },
    #[error("{kind:?} payload truncated: expected {expected} bytes, got {actual}")]
    Truncated {
        kind: MessageType,
        expected: usize,
        actual: usize,
    },
    #[error("payload too large: {0} bytes")]
    PayloadTooLarge(usize),
    #[error("invalid data: {0}")]
    InvalidData(&'static str),
}

macro_rules! message_types {
    ($($name:ident = $tag:literal),+ $(,)?) => {
        /// Stable message type tags.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u32)]
        pub enum MessageType {
            $($name = $tag),+
        }

        impl MessageType {
            pub const ALL: &'static [MessageType] = &[$(MessageType::$name),+];

            pub fn from_tag(tag: u32) -> Option<Self> {
                match tag {
                    $($tag => Some(MessageType::$name),)+
                    _ => None,
                }
            }

            pub fn name(self) -> &'static str {
                match self {
                    $(MessageType::$name => stringify!($name),)+
                }
            }
        }
    };
}

message_types! {
    Null = 0,
    Resize = 1,
    CursorPos = 2,
    MouseState = 3,
    KeyboardState = 4,
    Close = 5,
    UnlockFrame = 6,
    PushFrame = 7,
    FrameData = 8,
    UpdateData = 9,
    Message = 10,
    ProfileScope = 11,
    SetCursorState = 12,
    PushDmaSwapFdBuffer = 13,
    PushDmaSwapHandleBuffer = 14,
    FlushDmaSwapFdBuffer = 15,
    FlushDmaSwapHandleBuffer = 16,
    DmaSwap = 17,
}

impl MessageType {
    pub const fn tag(self) -> u32 {
        self as u32
    }
}

/// One framed message. The tag is kept raw so unknown types survive framing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    tag: u32,
    data: Bytes,
}

impl Message {
    pub fn new(kind: MessageType, data: impl Into<Bytes>) -> Self {
        Self {
            tag: kind.tag(),
            data: data.into(),
        }
    }

    pub fn empty(kind: MessageType) -> Self {
        Self::new(kind, Bytes::new())
    }

    pub fn from_raw(tag: u32, data: Bytes) -> Self {
        Self { tag, data }
    }

    pub fn tag(&self) -> u32 {
        self.tag
    }

    pub fn kind(&self) -> Option<MessageType> {
        MessageType::from_tag(self.tag)
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn into_data(self) -> Bytes {
        self.data
    }

    /// Appends header and payload to `buf`.
    pub fn encode_into(&self, buf: &mut BytesMut) -> Result<(), WireError> {
        if self.data.len() > MAX_PAYLOAD {
            return Err(WireError::PayloadTooLarge(self.data.len()));
        }
        buf.reserve(HEADER_LEN + self.data.len());
        FrameHeader {
            tag: self.tag,
            len: self.data.len() as u32,
        }
        .write(buf);
        buf.put_slice(&self.data);
        Ok(())
    }

    pub fn to_frame(&self) -> Result<Bytes, WireError> {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + self.data.len());
        self.encode_into(&mut buf)?;
        Ok(buf.freeze())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub tag: u32,
    pub len: u32,
}

impl FrameHeader {
    /// Reads a header from the front of `bytes` without consuming it.
    pub fn peek(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < HEADER_LEN {
            return None;
        }
        let mut head = &bytes[..HEADER_LEN];
        Some(Self {
            tag: head.get_u32_le(),
            len: head.get_u32_le(),
        })
    }

    pub fn write(&self, buf: &mut impl BufMut) {
        buf.put_u32_le(self.tag);
        buf.put_u32_le(self.len);
    }
}

/// Splits one complete frame off the front of `buf`.
///
/// Returns `Ok(None)` when the buffer holds only part of a frame; the partial
/// bytes stay in place for the next read.
pub fn decode_frame(buf: &mut BytesMut) -> Result<Option<Message>, WireError> {
    let Some(header) = FrameHeader::peek(buf) else {
        return Ok(None);
    };
    let len = header.len as usize;
    if len > MAX_PAYLOAD {
        return Err(WireError::PayloadTooLarge(len));
    }
    if buf.len() < HEADER_LEN + len {
        return Ok(None);
    }
    buf.advance(HEADER_LEN);
    let data = buf.split_to(len).freeze();
    Ok(Some(Message::from_raw(header.tag, data)))
}
