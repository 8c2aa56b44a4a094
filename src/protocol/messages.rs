//! Inbound game messages
//!
//! The size table decides how the frame decoder splits the stream; the
//! decoded `InboundMessage` is what the tick-side handlers act on. Handlers
//! are plain function pointers registered once per opcode.

use std::fmt;

use tracing::{debug, trace};

use crate::error::{ProtocolError, WorldError};
use crate::game::entity::EntityId;
use crate::game::events::Event;
use crate::game::world::World;
use crate::net::buffer::{Order, PacketReader, Transform};
use crate::net::codec::{FrameSize, GameMessage};

/// Interface button that logs the player out
pub const LOGOUT_BUTTON: u16 = 2458;

/// Bytes of minimap data trailing a minimap walk
const MINIMAP_TRAILER: usize = 14;

/// Payload sizes per inbound opcode; -1 marks a byte-length prefix
#[rustfmt::skip]
const INCOMING_SIZES: [i8; 256] = [
    0, 0, 0, 1, -1, 0, 0, 0, 0, 0,
    0, 0, 0, 0, 8, 0, 6, 2, 2, 0,
    0, 2, 0, 6, 0, 12, 0, 0, 0, 0,
    0, 0, 0, 0, 0, 8, 4, 0, 0, 2,
    2, 6, 0, 6, 0, -1, 0, 0, 0, 0,
    0, 0, 0, 12, 0, 0, 0, 8, 8, 12,
    8, 8, 0, 0, 0, 0, 0, 0, 0, 0,
    6, 0, 2, 2, 8, 6, 0, -1, 0, 6,
    0, 0, 0, 0, 0, 1, 4, 6, 0, 0,
    0, 0, 0, 0, 0, 3, 0, 0, -1, 0,
    0, 13, 0, -1, 0, 0, 0, 0, 0, 0,
    0, 0, 0, 0, 0, 0, 0, 6, 0, 0,
    1, 0, 6, 0, 0, 0, -1, 0, 2, 6,
    0, 4, 6, 8, 0, 6, 0, 0, 0, 2,
    0, 0, 0, 0, 0, 6, 0, 0, 0, 0,
    0, 0, 1, 2, 0, 2, 6, 0, 0, 0,
    0, 0, 0, 0, -1, -1, 0, 0, 0, 0,
    0, 0, 0, 0, 0, 0, 0, 0, 0, 0,
    0, 8, 0, 3, 0, 2, 0, 0, 8, 1,
    0, 0, 12, 0, 0, 0, 0, 0, 0, 0,
    2, 0, 0, 0, 0, 0, 0, 0, 4, 0,
    4, 0, 0, 0, 7, 8, 0, 0, 10, 0,
    0, 0, 0, 0, 0, 0, -1, 0, 6, 0,
    1, 0, 0, 0, 6, 0, 6, 8, 1, 0,
    0, 4, 0, 0, 0, 0, -1, 0, -1, 4,
    0, 0, 6, 6, 0, 0,
];

/// Opcodes the client sends without any payload
const EMPTY_OPCODES: [u8; 4] = [0, 121, 130, 202];

/// Frame size of an inbound opcode, `None` when the client never sends it
pub fn incoming_size(opcode: u8) -> Option<FrameSize> {
    match INCOMING_SIZES[opcode as usize] {
        -1 => Some(FrameSize::VarByte),
        0 if EMPTY_OPCODES.contains(&opcode) => Some(FrameSize::Fixed(0)),
        0 => None,
        size => Some(FrameSize::Fixed(size as usize)),
    }
}

/// A decoded inbound message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundMessage {
    KeepAlive,
    FocusChange { focused: bool },
    Chat { color: u8, effects: u8, text: Vec<u8> },
    /// Absolute waypoints, first step first
    Walk { waypoints: Vec<(i32, i32)>, run: bool },
    Command { name: String, args: Vec<String> },
    Button { id: u16 },
    /// Screen click packed with the time since the previous one
    MouseClick { delay: u16, right: bool, coordinate: u32 },
    CameraMoved { pitch: u16, yaw: u16 },
    RegionLoaded,
    IdleLogout,
    /// Valid opcode with no dedicated reader
    Unhandled { opcode: u8 },
}

impl InboundMessage {
    pub fn decode(message: &GameMessage) -> Result<Self, ProtocolError> {
        let mut reader = PacketReader::new(message.payload.clone());
        let decoded = match message.opcode {
            0 => InboundMessage::KeepAlive,
            3 => InboundMessage::FocusChange {
                focused: reader.get_u8()? == 1,
            },
            4 => decode_chat(&mut reader, message.payload.len())?,
            98 | 164 | 248 => decode_walk(&mut reader, message.opcode, message.payload.len())?,
            103 => decode_command(&mut reader)?,
            185 => InboundMessage::Button {
                id: reader.get_short()?,
            },
            241 => {
                let packed = reader.get_int(Order::Big)?;
                InboundMessage::MouseClick {
                    delay: (packed >> 20) as u16,
                    right: (packed >> 19) & 1 == 1,
                    coordinate: packed & 0x7ffff,
                }
            }
            86 => InboundMessage::CameraMoved {
                pitch: reader.get_short()?,
                yaw: reader.get_u16(Order::Big, Transform::A)?,
            },
            121 => InboundMessage::RegionLoaded,
            202 => InboundMessage::IdleLogout,
            opcode => InboundMessage::Unhandled { opcode },
        };
        Ok(decoded)
    }
}

fn decode_chat(reader: &mut PacketReader, size: usize) -> Result<InboundMessage, ProtocolError> {
    if size < 2 {
        return Err(ProtocolError::MalformedPacket("chat message too short".into()));
    }
    let effects = reader.get_u8_t(Transform::S)?;
    let color = reader.get_u8_t(Transform::S)?;
    let text = reader.get_bytes_reversed(size - 2, Transform::A)?;
    Ok(InboundMessage::Chat {
        color,
        effects,
        text,
    })
}

fn decode_walk(
    reader: &mut PacketReader,
    opcode: u8,
    size: usize,
) -> Result<InboundMessage, ProtocolError> {
    let size = if opcode == 248 {
        size.checked_sub(MINIMAP_TRAILER)
    } else {
        Some(size)
    };
    let steps = size
        .and_then(|size| size.checked_sub(5))
        .ok_or_else(|| ProtocolError::MalformedPacket("walk path too short".into()))?
        / 2;

    let first_x = reader.get_u16(Order::Little, Transform::A)? as i32;
    let mut offsets = Vec::with_capacity(steps);
    for _ in 0..steps {
        let dx = reader.get_i8()? as i32;
        let dy = reader.get_i8()? as i32;
        offsets.push((dx, dy));
    }
    let first_y = reader.get_u16(Order::Little, Transform::Normal)? as i32;
    let run = reader.get_u8_t(Transform::C)? == 1;

    let mut waypoints = Vec::with_capacity(steps + 1);
    waypoints.push((first_x, first_y));
    waypoints.extend(
        offsets
            .into_iter()
            .map(|(dx, dy)| (first_x + dx, first_y + dy)),
    );
    Ok(InboundMessage::Walk { waypoints, run })
}

fn decode_command(reader: &mut PacketReader) -> Result<InboundMessage, ProtocolError> {
    let line = reader.get_string()?;
    let mut parts = line.split_whitespace();
    let name = parts.next().unwrap_or_default().to_lowercase();
    let args = parts.map(str::to_string).collect();
    Ok(InboundMessage::Command { name, args })
}

/// Tick-side reaction to one decoded message
pub type MessageHandler = fn(&mut World, EntityId, InboundMessage) -> Result<(), WorldError>;

/// Opcode to handler table
#[derive(Clone)]
pub struct MessageRepository {
    handlers: [MessageHandler; 256],
}

impl MessageRepository {
    /// Table with the built-in handlers; every other opcode is a no-op
    pub fn new() -> Self {
        let mut repository = Self {
            handlers: [handle_nothing as MessageHandler; 256],
        };
        repository
            .register(4, handle_chat)
            .register(98, handle_walk)
            .register(164, handle_walk)
            .register(248, handle_walk)
            .register(103, handle_command)
            .register(185, handle_button)
            .register(202, handle_idle);
        repository
    }

    pub fn register(&mut self, opcode: u8, handler: MessageHandler) -> &mut Self {
        self.handlers[opcode as usize] = handler;
        self
    }

    pub fn handler(&self, opcode: u8) -> MessageHandler {
        self.handlers[opcode as usize]
    }
}

impl Default for MessageRepository {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for MessageRepository {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageRepository").finish_non_exhaustive()
    }
}

fn handle_nothing(_: &mut World, player: EntityId, message: InboundMessage) -> Result<(), WorldError> {
    trace!(%player, ?message, "No handler for message");
    Ok(())
}

fn handle_chat(world: &mut World, player: EntityId, message: InboundMessage) -> Result<(), WorldError> {
    let InboundMessage::Chat {
        color,
        effects,
        text,
    } = message
    else {
        return Ok(());
    };
    world.chat(player, color, effects, text)
}

fn handle_walk(world: &mut World, player: EntityId, message: InboundMessage) -> Result<(), WorldError> {
    let InboundMessage::Walk { waypoints, run } = message else {
        return Ok(());
    };
    world.walk(player, &waypoints, run)
}

fn handle_command(
    world: &mut World,
    player: EntityId,
    message: InboundMessage,
) -> Result<(), WorldError> {
    let InboundMessage::Command { name, args } = message else {
        return Ok(());
    };
    debug!(%player, command = %name, "Command received");
    if name == "pos" {
        let position = world
            .mob(player)
            .and_then(|mob| mob.position())
            .ok_or(WorldError::EntityNotFound(player))?;
        world.send_message(player, format!("You are at {position}."))?;
    }
    world.post(Event::Command { name, args }, Some(player));
    Ok(())
}

fn handle_button(world: &mut World, player: EntityId, message: InboundMessage) -> Result<(), WorldError> {
    if let InboundMessage::Button { id: LOGOUT_BUTTON } = message {
        world.queue_logout(player);
    }
    Ok(())
}

fn handle_idle(world: &mut World, player: EntityId, _: InboundMessage) -> Result<(), WorldError> {
    debug!(%player, "Idle logout");
    world.queue_logout(player);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::buffer::PacketWriter;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_size_table() {
        assert_eq!(incoming_size(0), Some(FrameSize::Fixed(0)));
        assert_eq!(incoming_size(3), Some(FrameSize::Fixed(1)));
        assert_eq!(incoming_size(4), Some(FrameSize::VarByte));
        assert_eq!(incoming_size(185), Some(FrameSize::Fixed(2)));
        assert_eq!(incoming_size(202), Some(FrameSize::Fixed(0)));
        assert_eq!(incoming_size(248), Some(FrameSize::VarByte));
        assert_eq!(incoming_size(1), None);
        assert_eq!(incoming_size(255), None);
    }

    #[test]
    fn test_decode_chat() {
        let mut writer = PacketWriter::new();
        writer
            .put_u8_t(1, Transform::S)
            .put_u8_t(9, Transform::S)
            .put_bytes_reversed(&[10, 20, 30], Transform::A);
        let message = GameMessage::new(4, writer.freeze());

        assert_eq!(
            InboundMessage::decode(&message).unwrap(),
            InboundMessage::Chat {
                color: 9,
                effects: 1,
                text: vec![10, 20, 30],
            }
        );
    }

    #[test]
    fn test_decode_walk_with_path() {
        let mut writer = PacketWriter::new();
        writer
            .put_u16(3200, Order::Little, Transform::A)
            .put_u8(2)
            .put_u8(0xff)
            .put_u16(3210, Order::Little, Transform::Normal)
            .put_u8_t(1, Transform::C);
        let message = GameMessage::new(98, writer.freeze());

        assert_eq!(
            InboundMessage::decode(&message).unwrap(),
            InboundMessage::Walk {
                waypoints: vec![(3200, 3210), (3202, 3209)],
                run: true,
            }
        );
    }

    #[test]
    fn test_decode_minimap_walk_ignores_trailer() {
        let mut writer = PacketWriter::new();
        writer
            .put_u16(3100, Order::Little, Transform::A)
            .put_u16(3300, Order::Little, Transform::Normal)
            .put_u8_t(0, Transform::C)
            .put_bytes(&[0u8; 14]);
        let message = GameMessage::new(248, writer.freeze());

        assert_eq!(
            InboundMessage::decode(&message).unwrap(),
            InboundMessage::Walk {
                waypoints: vec![(3100, 3300)],
                run: false,
            }
        );
    }

    #[test]
    fn test_decode_command_splits_args() {
        let mut writer = PacketWriter::new();
        writer.put_string("Tele 3222 3218");
        let message = GameMessage::new(103, writer.freeze());

        assert_eq!(
            InboundMessage::decode(&message).unwrap(),
            InboundMessage::Command {
                name: "tele".into(),
                args: vec!["3222".into(), "3218".into()],
            }
        );
    }

    #[test]
    fn test_truncated_walk_is_malformed() {
        let message = GameMessage::new(98, vec![1u8, 2]);
        assert!(InboundMessage::decode(&message).is_err());
    }

    #[test]
    fn test_unknown_reader_falls_back() {
        let message = GameMessage::new(14, vec![0u8; 8]);
        assert_eq!(
            InboundMessage::decode(&message).unwrap(),
            InboundMessage::Unhandled { opcode: 14 }
        );
    }

    #[test]
    fn test_decode_mouse_click_and_camera() {
        // 12 ticks since the last click, right button, pixel 765 * 20 + 300
        let packed: u32 = (12 << 20) | (1 << 19) | (765 * 20 + 300);
        let click = GameMessage::new(241, packed.to_be_bytes().to_vec());
        assert_eq!(
            InboundMessage::decode(&click).unwrap(),
            InboundMessage::MouseClick {
                delay: 12,
                right: true,
                coordinate: 765 * 20 + 300,
            }
        );

        // pitch 0x0180 plain, yaw 0x0400 with the low byte offset by 128
        let camera = GameMessage::new(86, vec![0x01, 0x80, 0x04, 0x80]);
        assert_eq!(
            InboundMessage::decode(&camera).unwrap(),
            InboundMessage::CameraMoved {
                pitch: 0x0180,
                yaw: 0x0400,
            }
        );
    }
}
