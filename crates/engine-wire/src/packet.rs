use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::{Message, MessageType, WireError};

/// Render target size in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Extent {
    pub width: u32,
    pub height: u32,
}

impl Extent {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Size of a tightly packed RGBA8 image of this extent, or `None` when it
    /// does not fit in `usize`.
    pub fn pixel_bytes(&self) -> Option<usize> {
        (self.width as usize)
            .checked_mul(self.height as usize)?
            .checked_mul(4)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct CursorPos {
    pub x: f64,
    pub y: f64,
}

/// Mouse buttons as a bitmask (bit 0 = left, 1 = right, 2 = middle, ...) plus wheel deltas.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct MouseState {
    pub buttons: u8,
    pub wheel_x: f32,
    pub wheel_y: f32,
}

impl MouseState {
    pub fn is_pressed(&self, button: u8) -> bool {
        button < 8 && self.buttons & (1 << button) != 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct KeyboardState {
    pub pressed: Vec<u16>,
}

/// Raw RGBA8 pixels for the copy path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FramePixels {
    pub extent: Extent,
    pub pixels: Bytes,
}

/// Engine-measured time since the previous frame or update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TimingSample {
    pub delta_micros: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogSeverity {
    Message,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLine {
    pub severity: LogSeverity,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfileSample {
    pub start_micros: u64,
    pub duration_micros: u64,
    pub depth: u32,
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorState {
    Normal,
    Hidden,
    Locked,
}

/// Which native reference family a DMA buffer message carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForeignKind {
    /// POSIX file descriptors, valid inside the engine process.
    Fd,
    /// Windows handles, valid inside the engine process.
    Handle,
}

/// One shared swap image exported by the engine. References are only
/// meaningful inside the engine process until remapped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmaBuffer {
    pub kind: ForeignKind,
    pub memory: u64,
    pub start_semaphore: u64,
    pub end_semaphore: u64,
    pub size: u64,
    pub offset: u64,
    pub extent: Extent,
}

const DMA_BUFFER_LEN: usize = 48;

/// Typed view of every message body.
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    Null,
    Resize(Extent),
    CursorPos(CursorPos),
    MouseState(MouseState),
    KeyboardState(KeyboardState),
    Close,
    UnlockFrame,
    PushFrame(FramePixels),
    FrameData(TimingSample),
    UpdateData(TimingSample),
    Message(LogLine),
    ProfileScope(ProfileSample),
    SetCursorState(CursorState),
    PushDmaSwapBuffer(DmaBuffer),
    FlushDmaSwapBuffers(ForeignKind),
    DmaSwap,
}

impl Packet {
    pub fn kind(&self) -> MessageType {
        match self {
            Packet::Null => MessageType::Null,
            Packet::Resize(_) => MessageType::Resize,
            Packet::CursorPos(_) => MessageType::CursorPos,
            Packet::MouseState(_) => MessageType::MouseState,
            Packet::KeyboardState(_) => MessageType::KeyboardState,
            Packet::Close => MessageType::Close,
            Packet::UnlockFrame => MessageType::UnlockFrame,
            Packet::PushFrame(_) => MessageType::PushFrame,
            Packet::FrameData(_) => MessageType::FrameData,
            Packet::UpdateData(_) => MessageType::UpdateData,
            Packet::Message(_) => MessageType::Message,
            Packet::ProfileScope(_) => MessageType::ProfileScope,
            Packet::SetCursorState(_) => MessageType::SetCursorState,
            Packet::PushDmaSwapBuffer(buffer) => match buffer.kind {
                ForeignKind::Fd => MessageType::PushDmaSwapFdBuffer,
                ForeignKind::Handle => MessageType::PushDmaSwapHandleBuffer,
            },
            Packet::FlushDmaSwapBuffers(ForeignKind::Fd) => MessageType::FlushDmaSwapFdBuffer,
            Packet::FlushDmaSwapBuffers(ForeignKind::Handle) => {
                MessageType::FlushDmaSwapHandleBuffer
            }
            Packet::DmaSwap => MessageType::DmaSwap,
        }
    }

    pub fn encode(&self) -> Message {
        let mut buf = BytesMut::new();
        match self {
            Packet::Null
            | Packet::Close
            | Packet::UnlockFrame
            | Packet::FlushDmaSwapBuffers(_)
            | Packet::DmaSwap => {}
            Packet::Resize(extent) => put_extent(&mut buf, extent),
            Packet::CursorPos(pos) => {
                buf.put_f64_le(pos.x);
                buf.put_f64_le(pos.y);
            }
            Packet::MouseState(state) => {
                buf.put_u8(state.buttons);
                buf.put_f32_le(state.wheel_x);
                buf.put_f32_le(state.wheel_y);
            }
            Packet::KeyboardState(state) => {
                buf.put_u32_le(state.pressed.len() as u32);
                for key in &state.pressed {
                    buf.put_u16_le(*key);
                }
            }
            Packet::PushFrame(frame) => {
                put_extent(&mut buf, &frame.extent);
                buf.put_slice(&frame.pixels);
            }
            Packet::FrameData(sample) | Packet::UpdateData(sample) => {
                buf.put_u64_le(sample.delta_micros);
            }
            Packet::Message(line) => {
                buf.put_u8(match line.severity {
                    LogSeverity::Message => 0,
                    LogSeverity::Warning => 1,
                    LogSeverity::Error => 2,
                });
                buf.put_slice(line.text.as_bytes());
            }
            Packet::ProfileScope(sample) => {
                buf.put_u64_le(sample.start_micros);
                buf.put_u64_le(sample.duration_micros);
                buf.put_u32_le(sample.depth);
                buf.put_slice(sample.name.as_bytes());
            }
            Packet::SetCursorState(state) => buf.put_u32_le(match state {
                CursorState::Normal => 0,
                CursorState::Hidden => 1,
                CursorState::Locked => 2,
            }),
            Packet::PushDmaSwapBuffer(buffer) => {
                buf.put_u64_le(buffer.memory);
                buf.put_u64_le(buffer.start_semaphore);
                buf.put_u64_le(buffer.end_semaphore);
                buf.put_u64_le(buffer.size);
                buf.put_u64_le(buffer.offset);
                put_extent(&mut buf, &buffer.extent);
            }
        }
        Message::new(self.kind(), buf.freeze())
    }

    /// Decodes a message body. Fixed-layout payloads may carry trailing bytes
    /// from a newer peer; those are ignored.
    pub fn decode(message: &Message) -> Result<Self, WireError> {
        let Some(kind) = message.kind() else {
            return Err(WireError::UnknownType {
                tag: message.tag(),
                len: message.len(),
            });
        };
        let mut data = message.data().clone();
        let packet = match kind {
            MessageType::Null => Packet::Null,
            MessageType::Close => Packet::Close,
            MessageType::UnlockFrame => Packet::UnlockFrame,
            MessageType::DmaSwap => Packet::DmaSwap,
            MessageType::FlushDmaSwapFdBuffer => Packet::FlushDmaSwapBuffers(ForeignKind::Fd),
            MessageType::FlushDmaSwapHandleBuffer => {
                Packet::FlushDmaSwapBuffers(ForeignKind::Handle)
            }
            MessageType::Resize => {
                require(kind, &data, 8)?;
                Packet::Resize(get_extent(&mut data))
            }
            MessageType::CursorPos => {
                require(kind, &data, 16)?;
                Packet::CursorPos(CursorPos {
                    x: data.get_f64_le(),
                    y: data.get_f64_le(),
                })
            }
            MessageType::MouseState => {
                require(kind, &data, 9)?;
                Packet::MouseState(MouseState {
                    buttons: data.get_u8(),
                    wheel_x: data.get_f32_le(),
                    wheel_y: data.get_f32_le(),
                })
            }
            MessageType::KeyboardState => {
                require(kind, &data, 4)?;
                let count = data.get_u32_le() as usize;
                require(kind, &data, count.saturating_mul(2))?;
                let pressed = (0..count).map(|_| data.get_u16_le()).collect();
                Packet::KeyboardState(KeyboardState { pressed })
            }
            MessageType::PushFrame => {
                require(kind, &data, 8)?;
                let extent = get_extent(&mut data);
                let Some(expected) = extent.pixel_bytes() else {
                    return Err(WireError::InvalidData("frame extent overflows"));
                };
                if data.len() != expected {
                    return Err(WireError::InvalidData("frame pixel count does not match extent"));
                }
                Packet::PushFrame(FramePixels {
                    extent,
                    pixels: data,
                })
            }
            MessageType::FrameData | MessageType::UpdateData => {
                require(kind, &data, 8)?;
                let sample = TimingSample {
                    delta_micros: data.get_u64_le(),
                };
                if kind == MessageType::FrameData {
                    Packet::FrameData(sample)
                } else {
                    Packet::UpdateData(sample)
                }
            }
            MessageType::Message => {
                require(kind, &data, 1)?;
                let severity = match data.get_u8() {
                    0 => LogSeverity::Message,
                    1 => LogSeverity::Warning,
                    2 => LogSeverity::Error,
                    _ => return Err(WireError::InvalidData("unknown log severity")),
                };
                Packet::Message(LogLine {
                    severity,
                    text: String::from_utf8_lossy(&data).into_owned(),
                })
            }
            MessageType::ProfileScope => {
                require(kind, &data, 20)?;
                Packet::ProfileScope(ProfileSample {
                    start_micros: data.get_u64_le(),
                    duration_micros: data.get_u64_le(),
                    depth: data.get_u32_le(),
                    name: String::from_utf8_lossy(&data).into_owned(),
                })
            }
            MessageType::SetCursorState => {
                require(kind, &data, 4)?;
                Packet::SetCursorState(match data.get_u32_le() {
                    0 => CursorState::Normal,
                    1 => CursorState::Hidden,
                    2 => CursorState::Locked,
                    _ => return Err(WireError::InvalidData("unknown cursor state")),
                })
            }
            MessageType::PushDmaSwapFdBuffer | MessageType::PushDmaSwapHandleBuffer => {
                require(kind, &data, DMA_BUFFER_LEN)?;
                let kind = if kind == MessageType::PushDmaSwapFdBuffer {
                    ForeignKind::Fd
                } else {
                    ForeignKind::Handle
                };
                Packet::PushDmaSwapBuffer(DmaBuffer {
                    kind,
                    memory: data.get_u64_le(),
                    start_semaphore: data.get_u64_le(),
                    end_semaphore: data.get_u64_le(),
                    size: data.get_u64_le(),
                    offset: data.get_u64_le(),
                    extent: get_extent(&mut data),
                })
            }
        };
        Ok(packet)
    }
}

impl From<Packet> for Message {
    fn from(packet: Packet) -> Self {
        packet.encode()
    }
}

fn require(kind: MessageType, data: &Bytes, expected: usize) -> Result<(), WireError> {
    if data.len() < expected {
        return Err(WireError::Truncated {
            kind,
            expected,
            actual: data.len(),
        });
    }
    Ok(())
}

fn put_extent(buf: &mut BytesMut, extent: &Extent) {
    buf.put_u32_le(extent.width);
    buf.put_u32_le(extent.height);
}

fn get_extent(data: &mut Bytes) -> Extent {
    Extent {
        width: data.get_u32_le(),
        height: data.get_u32_le(),
    }
}
