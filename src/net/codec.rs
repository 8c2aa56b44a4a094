//! Game frame codec
//!
//! A frame is an opcode byte, an optional length prefix (one byte or a
//! big-endian short depending on the opcode) and the payload. Every byte of
//! the frame is run through the direction's ISAAC keystream, so the decoder
//! keeps partial state between calls: once a byte has been decrypted it must
//! never be decrypted again.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::crypto::Isaac;
use crate::error::ProtocolError;
use crate::net::buffer::MAX_PACKET_SIZE;

/// How the payload length of an opcode is determined
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameSize {
    /// Known length, no prefix
    Fixed(usize),
    /// One length byte follows the opcode
    VarByte,
    /// Two length bytes follow the opcode
    VarShort,
}

impl FrameSize {
    fn max_len(self) -> usize {
        match self {
            FrameSize::Fixed(len) => len,
            FrameSize::VarByte => u8::MAX as usize,
            FrameSize::VarShort => MAX_PACKET_SIZE,
        }
    }
}

/// Opcode to frame size lookup for one direction
pub type SizeLookup = fn(u8) -> Option<FrameSize>;

/// A decoded, decrypted frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GameMessage {
    pub opcode: u8,
    pub payload: Bytes,
}

impl GameMessage {
    pub fn new(opcode: u8, payload: impl Into<Bytes>) -> Self {
        Self {
            opcode,
            payload: payload.into(),
        }
    }
}

/// A frame ready to be encrypted and written
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub opcode: u8,
    pub size: FrameSize,
    pub payload: Bytes,
}

impl Frame {
    pub fn fixed(opcode: u8, payload: impl Into<Bytes>) -> Self {
        let payload = payload.into();
        Self {
            opcode,
            size: FrameSize::Fixed(payload.len()),
            payload,
        }
    }

    pub fn var_byte(opcode: u8, payload: impl Into<Bytes>) -> Self {
        Self {
            opcode,
            size: FrameSize::VarByte,
            payload: payload.into(),
        }
    }

    pub fn var_short(opcode: u8, payload: impl Into<Bytes>) -> Self {
        Self {
            opcode,
            size: FrameSize::VarShort,
            payload: payload.into(),
        }
    }

    /// Bytes this frame occupies on the wire
    pub fn wire_len(&self) -> usize {
        let prefix = match self.size {
            FrameSize::Fixed(_) => 0,
            FrameSize::VarByte => 1,
            FrameSize::VarShort => 2,
        };
        1 + prefix + self.payload.len()
    }
}

#[derive(Debug, Clone, Copy)]
enum DecodeState {
    Opcode,
    Length { opcode: u8, size: FrameSize },
    Payload { opcode: u8, length: usize },
}

/// Incremental decoder for one connection's inbound stream
#[derive(Debug)]
pub struct FrameDecoder {
    cipher: Isaac,
    sizes: SizeLookup,
    state: DecodeState,
}

impl FrameDecoder {
    pub fn new(cipher: Isaac, sizes: SizeLookup) -> Self {
        Self {
            cipher,
            sizes,
            state: DecodeState::Opcode,
        }
    }

    /// Decode the next complete frame from `src`.
    ///
    /// Returns `Ok(None)` when more bytes are needed. Any error leaves the
    /// keystream out of step with the peer, so the connection must be closed.
    pub fn decode(&mut self, src: &mut BytesMut) -> Result<Option<GameMessage>, ProtocolError> {
        loop {
            match self.state {
                DecodeState::Opcode => {
                    if src.is_empty() {
                        return Ok(None);
                    }
                    let opcode = self.cipher.decrypt_byte(src.get_u8());
                    let size = (self.sizes)(opcode).ok_or(ProtocolError::UnknownOpcode(opcode))?;
                    self.state = match size {
                        FrameSize::Fixed(length) => DecodeState::Payload { opcode, length },
                        _ => DecodeState::Length { opcode, size },
                    };
                }
                DecodeState::Length { opcode, size } => {
                    let width = if size == FrameSize::VarShort { 2 } else { 1 };
                    if src.len() < width {
                        return Ok(None);
                    }
                    let mut prefix = [0u8; 2];
                    src.copy_to_slice(&mut prefix[..width]);
                    self.cipher.decrypt(&mut prefix[..width]);
                    let length = if width == 2 {
                        u16::from_be_bytes(prefix) as usize
                    } else {
                        prefix[0] as usize
                    };
                    self.state = DecodeState::Payload { opcode, length };
                }
                DecodeState::Payload { opcode, length } => {
                    if src.len() < length {
                        src.reserve(length - src.len());
                        return Ok(None);
                    }
                    let mut payload = src.split_to(length);
                    self.cipher.decrypt(&mut payload);
                    self.state = DecodeState::Opcode;
                    return Ok(Some(GameMessage {
                        opcode,
                        payload: payload.freeze(),
                    }));
                }
            }
        }
    }
}

/// Encrypting encoder for one connection's outbound stream
#[derive(Debug)]
pub struct FrameEncoder {
    cipher: Isaac,
}

impl FrameEncoder {
    pub fn new(cipher: Isaac) -> Self {
        Self { cipher }
    }

    /// Append the encrypted frame to `dst`
    pub fn encode(&mut self, frame: &Frame, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        let len = frame.payload.len();
        if len > frame.size.max_len() {
            return Err(ProtocolError::PacketTooLarge {
                size: len,
                max: frame.size.max_len(),
            });
        }
        if let FrameSize::Fixed(expected) = frame.size {
            if expected != len {
                return Err(ProtocolError::InvalidPacketSize {
                    expected,
                    actual: len,
                });
            }
        }

        let start = dst.len();
        dst.reserve(frame.wire_len());
        dst.put_u8(frame.opcode);
        match frame.size {
            FrameSize::Fixed(_) => {}
            FrameSize::VarByte => dst.put_u8(len as u8),
            FrameSize::VarShort => dst.put_u16(len as u16),
        }
        dst.put_slice(&frame.payload);
        self.cipher.encrypt(&mut dst[start..]);
        Ok(())
    }
}
