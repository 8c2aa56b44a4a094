//! Outbound game messages
//!
//! Each message knows how to turn itself into a frame for one player.
//! Queueing the frame is cheap; the bytes only leave when the session is
//! flushed at the end of the tick.

use bytes::Bytes;

use crate::game::mob::Player;
use crate::game::position::Position;
use crate::net::buffer::{Order, PacketWriter, Transform};
use crate::net::codec::{Frame, FrameSize};

pub const NPC_UPDATE_OPCODE: u8 = 65;
pub const REGION_OPCODE: u8 = 73;
pub const PLAYER_UPDATE_OPCODE: u8 = 81;
pub const LOGOUT_OPCODE: u8 = 109;
pub const SYSTEM_MESSAGE_OPCODE: u8 = 253;

/// Frame size of an opcode the server sends
pub fn outgoing_size(opcode: u8) -> Option<FrameSize> {
    match opcode {
        NPC_UPDATE_OPCODE | PLAYER_UPDATE_OPCODE => Some(FrameSize::VarShort),
        REGION_OPCODE => Some(FrameSize::Fixed(4)),
        LOGOUT_OPCODE => Some(FrameSize::Fixed(0)),
        SYSTEM_MESSAGE_OPCODE => Some(FrameSize::VarByte),
        _ => None,
    }
}

/// Something the server can send a player
pub trait OutboundMessage {
    fn write(&self, player: &Player) -> Frame;
}

/// Tells the client to return to the login screen
#[derive(Debug, Clone, Copy, Default)]
pub struct LogoutMessage;

impl OutboundMessage for LogoutMessage {
    fn write(&self, _: &Player) -> Frame {
        Frame::fixed(LOGOUT_OPCODE, Bytes::new())
    }
}

/// Line of text in the chat box
#[derive(Debug, Clone)]
pub struct SystemMessage(pub String);

impl SystemMessage {
    pub fn new(text: impl Into<String>) -> Self {
        Self(text.into())
    }
}

impl OutboundMessage for SystemMessage {
    fn write(&self, _: &Player) -> Frame {
        let mut out = PacketWriter::with_capacity(self.0.len() + 1);
        out.put_string(&self.0);
        Frame::var_byte(SYSTEM_MESSAGE_OPCODE, out.freeze())
    }
}

/// Loads the map area around a position
#[derive(Debug, Clone, Copy)]
pub struct RegionMessage {
    pub position: Position,
}

impl OutboundMessage for RegionMessage {
    fn write(&self, _: &Player) -> Frame {
        let mut out = PacketWriter::with_capacity(4);
        out.put_u16(self.position.chunk_x() as u16, Order::Big, Transform::A)
            .put_short(self.position.chunk_y() as u16);
        Frame::fixed(REGION_OPCODE, out.freeze())
    }
}

/// Player synchronization built by the update engine
#[derive(Debug, Clone)]
pub struct PlayerUpdateMessage(pub Bytes);

impl OutboundMessage for PlayerUpdateMessage {
    fn write(&self, _: &Player) -> Frame {
        Frame::var_short(PLAYER_UPDATE_OPCODE, self.0.clone())
    }
}

/// Npc synchronization built by the update engine
#[derive(Debug, Clone)]
pub struct NpcUpdateMessage(pub Bytes);

impl OutboundMessage for NpcUpdateMessage {
    fn write(&self, _: &Player) -> Frame {
        Frame::var_short(NPC_UPDATE_OPCODE, self.0.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::persistence::PlayerSave;
    use pretty_assertions::assert_eq;

    fn player() -> Player {
        Player::new(1, PlayerSave::new("alice", "hash"), None)
    }

    #[test]
    fn test_frames_match_size_table() {
        let player = player();
        let frames = [
            LogoutMessage.write(&player),
            SystemMessage::new("hi").write(&player),
            RegionMessage {
                position: Position::new(3222, 3218, 0).unwrap(),
            }
            .write(&player),
            PlayerUpdateMessage(Bytes::from_static(&[0])).write(&player),
            NpcUpdateMessage(Bytes::from_static(&[0])).write(&player),
        ];
        for frame in frames {
            assert_eq!(outgoing_size(frame.opcode).map(|_| ()), Some(()));
            if let Some(FrameSize::Fixed(len)) = outgoing_size(frame.opcode) {
                assert_eq!(frame.payload.len(), len);
            }
        }
    }

    #[test]
    fn test_region_payload() {
        let frame = RegionMessage {
            position: Position::new(3222, 3218, 0).unwrap(),
        }
        .write(&player());
        // both chunks are 402 = 0x0192; the low byte of x is offset by 128
        assert_eq!(frame.payload.as_ref(), &[0x01, 0x12, 0x01, 0x92]);
    }

    #[test]
    fn test_system_message_is_terminated() {
        let frame = SystemMessage::new("hi").write(&player());
        assert_eq!(frame.payload.as_ref(), b"hi\n");
        assert_eq!(frame.size, FrameSize::VarByte);
    }
}
