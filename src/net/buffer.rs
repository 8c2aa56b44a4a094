//! Packet buffers
//!
//! `PacketWriter` builds frame payloads and `PacketReader` consumes them.
//! Both understand the protocol's byte transforms (A, C, S), both byte orders
//! and the newline-terminated string format. The writer also has a bit access
//! mode used by the player and npc update messages.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::ProtocolError;

/// Largest payload a variable-short frame can carry
pub const MAX_PACKET_SIZE: usize = 65535;

/// Strings on the wire end with a newline
const STRING_TERMINATOR: u8 = 10;

/// Obfuscation applied to the least significant byte of a value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Transform {
    #[default]
    Normal,
    /// value + 128
    A,
    /// -value
    C,
    /// 128 - value
    S,
}

impl Transform {
    #[inline]
    fn encode(self, byte: u8) -> u8 {
        match self {
            Transform::Normal => byte,
            Transform::A => byte.wrapping_add(128),
            Transform::C => 0u8.wrapping_sub(byte),
            Transform::S => 128u8.wrapping_sub(byte),
        }
    }

    #[inline]
    fn decode(self, byte: u8) -> u8 {
        match self {
            Transform::Normal => byte,
            Transform::A => byte.wrapping_sub(128),
            Transform::C => 0u8.wrapping_sub(byte),
            Transform::S => 128u8.wrapping_sub(byte),
        }
    }
}

/// Byte order of multi-byte values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Order {
    #[default]
    Big,
    Little,
}

/// Builder for outgoing payloads
#[derive(Debug, Clone, Default)]
pub struct PacketWriter {
    data: BytesMut,
    /// Set while in bit access mode
    bit_index: Option<usize>,
}

impl PacketWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: BytesMut::with_capacity(capacity),
            bit_index: None,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn freeze(self) -> Bytes {
        self.data.freeze()
    }

    /// Write one byte
    pub fn put_u8(&mut self, value: u8) -> &mut Self {
        self.data.put_u8(value);
        self
    }

    /// Write one byte with a transform
    pub fn put_u8_t(&mut self, value: u8, transform: Transform) -> &mut Self {
        self.data.put_u8(transform.encode(value));
        self
    }

    /// Write a 16-bit value. The transform applies to the low byte.
    pub fn put_u16(&mut self, value: u16, order: Order, transform: Transform) -> &mut Self {
        let high = (value >> 8) as u8;
        let low = transform.encode(value as u8);
        match order {
            Order::Big => {
                self.data.put_u8(high);
                self.data.put_u8(low);
            }
            Order::Little => {
                self.data.put_u8(low);
                self.data.put_u8(high);
            }
        }
        self
    }

    /// Write a big-endian 16-bit value
    pub fn put_short(&mut self, value: u16) -> &mut Self {
        self.data.put_u16(value);
        self
    }

    pub fn put_int(&mut self, value: u32, order: Order) -> &mut Self {
        match order {
            Order::Big => self.data.put_u32(value),
            Order::Little => self.data.put_u32_le(value),
        }
        self
    }

    pub fn put_long(&mut self, value: u64) -> &mut Self {
        self.data.put_u64(value);
        self
    }

    /// Write a newline-terminated string
    pub fn put_string(&mut self, value: &str) -> &mut Self {
        self.data.put_slice(value.as_bytes());
        self.data.put_u8(STRING_TERMINATOR);
        self
    }

    pub fn put_bytes(&mut self, bytes: &[u8]) -> &mut Self {
        self.data.put_slice(bytes);
        self
    }

    /// Write `bytes` back to front with a transform, as chat text is sent
    pub fn put_bytes_reversed(&mut self, bytes: &[u8], transform: Transform) -> &mut Self {
        for &byte in bytes.iter().rev() {
            self.data.put_u8(transform.encode(byte));
        }
        self
    }

    /// Enter bit access mode at the next byte boundary
    pub fn start_bit_access(&mut self) -> &mut Self {
        debug_assert!(self.bit_index.is_none(), "already in bit access mode");
        self.bit_index = Some(self.data.len() * 8);
        self
    }

    /// Leave bit access mode; partially written bytes are zero padded
    pub fn end_bit_access(&mut self) -> &mut Self {
        debug_assert!(self.bit_index.is_some(), "not in bit access mode");
        self.bit_index = None;
        self
    }

    /// Write the low `count` bits of `value`, most significant first
    pub fn put_bits(&mut self, count: usize, value: u32) -> &mut Self {
        debug_assert!(count <= 32);
        let Some(start) = self.bit_index else {
            debug_assert!(false, "put_bits outside bit access mode");
            return self;
        };

        let end = start + count;
        let needed = end.div_ceil(8);
        if self.data.len() < needed {
            self.data.resize(needed, 0);
        }

        for bit in 0..count {
            let set = (value >> (count - 1 - bit)) & 1 == 1;
            let index = start + bit;
            let mask = 0x80u8 >> (index & 7);
            if set {
                self.data[index >> 3] |= mask;
            } else {
                self.data[index >> 3] &= !mask;
            }
        }

        self.bit_index = Some(end);
        self
    }
}

/// Cursor over an incoming payload.
///
/// Reading past the end is a protocol violation rather than a silent zero.
#[derive(Debug, Clone)]
pub struct PacketReader {
    data: Bytes,
}

impl PacketReader {
    pub fn new(data: Bytes) -> Self {
        Self { data }
    }

    #[inline]
    pub fn remaining(&self) -> usize {
        self.data.remaining()
    }

    #[inline]
    pub fn has_remaining(&self) -> bool {
        self.data.has_remaining()
    }

    fn ensure(&self, count: usize) -> Result<(), ProtocolError> {
        if self.data.remaining() < count {
            return Err(ProtocolError::InvalidPacketSize {
                expected: count,
                actual: self.data.remaining(),
            });
        }
        Ok(())
    }

    pub fn get_u8(&mut self) -> Result<u8, ProtocolError> {
        self.ensure(1)?;
        Ok(self.data.get_u8())
    }

    pub fn get_u8_t(&mut self, transform: Transform) -> Result<u8, ProtocolError> {
        Ok(transform.decode(self.get_u8()?))
    }

    pub fn get_i8(&mut self) -> Result<i8, ProtocolError> {
        Ok(self.get_u8()? as i8)
    }

    /// Read a 16-bit value. The transform applies to the low byte.
    pub fn get_u16(&mut self, order: Order, transform: Transform) -> Result<u16, ProtocolError> {
        self.ensure(2)?;
        let (high, low) = match order {
            Order::Big => {
                let high = self.data.get_u8();
                (high, self.data.get_u8())
            }
            Order::Little => {
                let low = self.data.get_u8();
                (self.data.get_u8(), low)
            }
        };
        Ok(((high as u16) << 8) | transform.decode(low) as u16)
    }

    pub fn get_short(&mut self) -> Result<u16, ProtocolError> {
        self.get_u16(Order::Big, Transform::Normal)
    }

    pub fn get_int(&mut self, order: Order) -> Result<u32, ProtocolError> {
        self.ensure(4)?;
        Ok(match order {
            Order::Big => self.data.get_u32(),
            Order::Little => self.data.get_u32_le(),
        })
    }

    pub fn get_long(&mut self) -> Result<u64, ProtocolError> {
        self.ensure(8)?;
        Ok(self.data.get_u64())
    }

    /// Read a newline-terminated string
    pub fn get_string(&mut self) -> Result<String, ProtocolError> {
        let end = self
            .data
            .iter()
            .position(|&b| b == STRING_TERMINATOR)
            .ok_or(ProtocolError::InvalidStringEncoding)?;
        let raw = self.data.split_to(end);
        self.data.advance(1);
        String::from_utf8(raw.to_vec()).map_err(|_| ProtocolError::InvalidStringEncoding)
    }

    pub fn get_bytes(&mut self, count: usize) -> Result<Bytes, ProtocolError> {
        self.ensure(count)?;
        Ok(self.data.split_to(count))
    }

    /// Read `count` bytes written back to front with a transform
    pub fn get_bytes_reversed(
        &mut self,
        count: usize,
        transform: Transform,
    ) -> Result<Vec<u8>, ProtocolError> {
        let raw = self.get_bytes(count)?;
        Ok(raw.iter().rev().map(|&b| transform.decode(b)).collect())
    }

    /// Everything not read yet
    pub fn rest(&mut self) -> Bytes {
        self.data.split_off(0)
    }
}
