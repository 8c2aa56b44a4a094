//! Update block encoding
//!
//! A block is a mask followed by the payload of every set flag, always in
//! the order the client reads them. Players and npcs use different mask
//! bits and a different order.

use bytes::Bytes;

use crate::game::mob::{Actor, Gender, Npc, Player};
use crate::game::update::flags::{Hit, UpdateFlags, UpdateState};
use crate::net::buffer::{Order, PacketWriter, Transform};

/// Player flags in read order with their mask bits
const PLAYER_ORDER: [(UpdateFlags, u16); 10] = [
    (UpdateFlags::FORCED_MOVEMENT, 0x400),
    (UpdateFlags::GRAPHICS, 0x100),
    (UpdateFlags::ANIMATION, 0x8),
    (UpdateFlags::FORCED_CHAT, 0x4),
    (UpdateFlags::CHAT, 0x80),
    (UpdateFlags::FACE_ENTITY, 0x1),
    (UpdateFlags::APPEARANCE, 0x10),
    (UpdateFlags::FACE_COORDINATE, 0x2),
    (UpdateFlags::PRIMARY_HIT, 0x20),
    (UpdateFlags::SECONDARY_HIT, 0x200),
];

/// Npc flags in read order with their mask bits
const NPC_ORDER: [(UpdateFlags, u8); 8] = [
    (UpdateFlags::ANIMATION, 0x10),
    (UpdateFlags::PRIMARY_HIT, 0x8),
    (UpdateFlags::GRAPHICS, 0x80),
    (UpdateFlags::FACE_ENTITY, 0x20),
    (UpdateFlags::FORCED_CHAT, 0x1),
    (UpdateFlags::SECONDARY_HIT, 0x40),
    (UpdateFlags::TRANSFORM, 0x2),
    (UpdateFlags::FACE_COORDINATE, 0x4),
];

/// Marks a two-byte player mask
const EXTENDED_MASK: u16 = 0x40;

/// Standing, turning, walking and running animations
const MOVEMENT_ANIMATIONS: [u16; 7] = [0x328, 0x337, 0x333, 0x334, 0x335, 0x336, 0x338];

fn player_mask(flags: UpdateFlags) -> u16 {
    PLAYER_ORDER
        .iter()
        .filter(|(flag, _)| flags.contains(*flag))
        .fold(0, |mask, (_, bit)| mask | bit)
}

/// Encode `player`'s block for the flags in `flags`.
///
/// Flags without a payload are skipped; returns `None` when nothing is left
/// to send.
pub fn encode_player_block(player: &Player, flags: UpdateFlags) -> Option<Bytes> {
    let state = &player.mob().update;
    let flags = present_flags(state, flags);
    if flags.is_empty() {
        return None;
    }

    let mut out = PacketWriter::new();
    let mut mask = player_mask(flags);
    if mask >= 0x100 {
        mask |= EXTENDED_MASK;
        out.put_u16(mask, Order::Little, Transform::Normal);
    } else {
        out.put_u8(mask as u8);
    }

    for (flag, _) in PLAYER_ORDER {
        if !flags.contains(flag) {
            continue;
        }
        match flag {
            UpdateFlags::FORCED_MOVEMENT => put_forced_movement(player, &mut out),
            UpdateFlags::GRAPHICS => {
                if let Some(graphic) = state.graphic {
                    out.put_u16(graphic.id, Order::Little, Transform::Normal)
                        .put_int(
                            (graphic.height as u32) << 16 | graphic.delay as u32,
                            Order::Big,
                        );
                }
            }
            UpdateFlags::ANIMATION => {
                if let Some(animation) = state.animation {
                    out.put_u16(animation.id, Order::Little, Transform::Normal)
                        .put_u8_t(animation.delay, Transform::C);
                }
            }
            UpdateFlags::FORCED_CHAT => {
                if let Some(text) = &state.forced_chat {
                    out.put_string(text);
                }
            }
            UpdateFlags::CHAT => {
                if let Some(chat) = &state.chat {
                    out.put_u16(
                        (chat.color as u16) << 8 | chat.effects as u16,
                        Order::Little,
                        Transform::Normal,
                    )
                    .put_u8(chat.rights)
                    .put_u8_t(chat.text.len() as u8, Transform::C)
                    .put_bytes_reversed(&chat.text, Transform::Normal);
                }
            }
            UpdateFlags::FACE_ENTITY => {
                if let Some(target) = state.face_target {
                    out.put_u16(target.wire_index(), Order::Little, Transform::Normal);
                }
            }
            UpdateFlags::APPEARANCE => {
                let appearance = appearance_block(player);
                out.put_u8_t(appearance.len() as u8, Transform::C)
                    .put_bytes(&appearance);
            }
            UpdateFlags::FACE_COORDINATE => {
                if let Some(position) = state.face_position {
                    out.put_u16((position.x() * 2 + 1) as u16, Order::Little, Transform::A)
                        .put_u16((position.y() * 2 + 1) as u16, Order::Little, Transform::Normal);
                }
            }
            UpdateFlags::PRIMARY_HIT => {
                if let Some(hit) = state.primary_hit {
                    put_player_primary_hit(&hit, &mut out);
                }
            }
            UpdateFlags::SECONDARY_HIT => {
                if let Some(hit) = state.secondary_hit {
                    out.put_u8(hit.damage)
                        .put_u8_t(hit.kind as u8, Transform::S)
                        .put_u8(hit.hitpoints)
                        .put_u8_t(hit.max_hitpoints, Transform::C);
                }
            }
            _ => {}
        }
    }
    Some(out.freeze())
}

fn put_player_primary_hit(hit: &Hit, out: &mut PacketWriter) {
    out.put_u8(hit.damage)
        .put_u8_t(hit.kind as u8, Transform::A)
        .put_u8_t(hit.hitpoints, Transform::C)
        .put_u8(hit.max_hitpoints);
}

fn put_forced_movement(player: &Player, out: &mut PacketWriter) {
    let Some(movement) = player.mob().update.forced_movement else {
        return;
    };
    let base = player.map_base.unwrap_or(movement.start);
    out.put_u8_t(movement.start.local_x(&base) as u8, Transform::S)
        .put_u8_t(movement.start.local_y(&base) as u8, Transform::S)
        .put_u8_t(movement.end.local_x(&base) as u8, Transform::S)
        .put_u8_t(movement.end.local_y(&base) as u8, Transform::S)
        .put_u16(movement.duration_x, Order::Little, Transform::A)
        .put_u16(movement.duration_y, Order::Big, Transform::A)
        .put_u8_t(movement.direction.id() as u8, Transform::S);
}

/// Drop flags whose payload is missing
fn present_flags(state: &UpdateState, flags: UpdateFlags) -> UpdateFlags {
    let mut present = flags;
    let missing = [
        (UpdateFlags::ANIMATION, state.animation.is_none()),
        (UpdateFlags::GRAPHICS, state.graphic.is_none()),
        (UpdateFlags::CHAT, state.chat.is_none()),
        (UpdateFlags::FACE_ENTITY, state.face_target.is_none()),
        (UpdateFlags::FACE_COORDINATE, state.face_position.is_none()),
        (UpdateFlags::PRIMARY_HIT, state.primary_hit.is_none()),
        (UpdateFlags::SECONDARY_HIT, state.secondary_hit.is_none()),
        (UpdateFlags::FORCED_MOVEMENT, state.forced_movement.is_none()),
        (UpdateFlags::FORCED_CHAT, state.forced_chat.is_none()),
        (UpdateFlags::TRANSFORM, state.transform.is_none()),
    ];
    for (flag, absent) in missing {
        if absent {
            present.remove(flag);
        }
    }
    present
}

/// Body, colours, movement animations, name and combat level
fn appearance_block(player: &Player) -> Bytes {
    let appearance = player.appearance();
    let [hair, beard, torso, arms, hands, legs, feet] = appearance.styles;

    let mut out = PacketWriter::with_capacity(64);
    out.put_u8(match appearance.gender {
        Gender::Male => 0,
        Gender::Female => 1,
    })
    // head icon
    .put_u8(0);

    // hat, cape, amulet, weapon
    for _ in 0..4 {
        out.put_u8(0);
    }
    out.put_short(0x100 + torso).put_u8(0);
    out.put_short(0x100 + arms)
        .put_short(0x100 + legs)
        .put_short(0x100 + hair)
        .put_short(0x100 + hands)
        .put_short(0x100 + feet);
    match appearance.gender {
        Gender::Male => out.put_short(0x100 + beard),
        Gender::Female => out.put_u8(0),
    };

    for color in appearance.colors {
        out.put_u8(color);
    }
    for animation in MOVEMENT_ANIMATIONS {
        out.put_short(animation);
    }

    out.put_long(name_to_long(player.username()))
        .put_u8(player.mob().combat_level().min(u8::MAX as u16) as u8)
        // total level
        .put_short(0);
    out.freeze()
}

/// Base-37 packed name as the client displays it
pub fn name_to_long(name: &str) -> u64 {
    let mut packed: u64 = 0;
    for c in name.chars().take(12) {
        packed = packed.wrapping_mul(37);
        packed += match c {
            'A'..='Z' => c as u64 - 'A' as u64 + 1,
            'a'..='z' => c as u64 - 'a' as u64 + 1,
            '0'..='9' => c as u64 - '0' as u64 + 27,
            _ => 0,
        };
    }
    while packed != 0 && packed % 37 == 0 {
        packed /= 37;
    }
    packed
}

/// Encode `npc`'s block for the flags in `flags`
pub fn encode_npc_block(npc: &Npc, flags: UpdateFlags) -> Option<Bytes> {
    let state = &npc.mob().update;
    let flags = present_flags(state, flags);
    if flags.is_empty() {
        return None;
    }

    let mask = NPC_ORDER
        .iter()
        .filter(|(flag, _)| flags.contains(*flag))
        .fold(0u8, |mask, (_, bit)| mask | bit);
    if mask == 0 {
        return None;
    }

    let mut out = PacketWriter::new();
    out.put_u8(mask);
    for (flag, _) in NPC_ORDER {
        if !flags.contains(flag) {
            continue;
        }
        match flag {
            UpdateFlags::ANIMATION => {
                if let Some(animation) = state.animation {
                    out.put_u16(animation.id, Order::Little, Transform::Normal)
                        .put_u8(animation.delay);
                }
            }
            UpdateFlags::PRIMARY_HIT => {
                if let Some(hit) = state.primary_hit {
                    out.put_u8_t(hit.damage, Transform::A)
                        .put_u8_t(hit.kind as u8, Transform::C)
                        .put_u8_t(hit.hitpoints, Transform::A)
                        .put_u8(hit.max_hitpoints);
                }
            }
            UpdateFlags::GRAPHICS => {
                if let Some(graphic) = state.graphic {
                    out.put_short(graphic.id).put_int(
                        (graphic.height as u32) << 16 | graphic.delay as u32,
                        Order::Big,
                    );
                }
            }
            UpdateFlags::FACE_ENTITY => {
                if let Some(target) = state.face_target {
                    out.put_short(target.wire_index());
                }
            }
            UpdateFlags::FORCED_CHAT => {
                if let Some(text) = &state.forced_chat {
                    out.put_string(text);
                }
            }
            UpdateFlags::SECONDARY_HIT => {
                if let Some(hit) = state.secondary_hit {
                    out.put_u8_t(hit.damage, Transform::C)
                        .put_u8_t(hit.kind as u8, Transform::S)
                        .put_u8_t(hit.hitpoints, Transform::S)
                        .put_u8_t(hit.max_hitpoints, Transform::C);
                }
            }
            UpdateFlags::TRANSFORM => {
                if let Some(definition) = state.transform {
                    out.put_u16(definition, Order::Little, Transform::A);
                }
            }
            UpdateFlags::FACE_COORDINATE => {
                if let Some(position) = state.face_position {
                    out.put_u16((position.x() * 2 + 1) as u16, Order::Little, Transform::Normal)
                        .put_u16((position.y() * 2 + 1) as u16, Order::Little, Transform::Normal);
                }
            }
            _ => {}
        }
    }
    Some(out.freeze())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::content::ContentDefinitions;
    use crate::game::persistence::PlayerSave;
    use crate::game::position::Position;
    use crate::game::update::flags::{Animation, ChatMessage, Graphic, HitType};
    use pretty_assertions::assert_eq;

    fn player() -> Player {
        Player::new(1, PlayerSave::new("alice", "hash"), None)
    }

    fn npc() -> Npc {
        Npc::new(1, 1, Position::new(3200, 3200, 0).unwrap(), &ContentDefinitions::default())
    }

    #[test]
    fn test_name_to_long() {
        assert_eq!(name_to_long("a"), 1);
        assert_eq!(name_to_long("ab"), 37 + 2);
        assert_eq!(name_to_long("A"), name_to_long("a"));
        assert_eq!(name_to_long("0"), 27);
        assert_eq!(name_to_long(""), 0);
    }

    #[test]
    fn test_nothing_flagged_is_none() {
        let player = player();
        assert_eq!(encode_player_block(&player, UpdateFlags::empty()), None);
        // flagged without payload
        assert_eq!(encode_player_block(&player, UpdateFlags::ANIMATION), None);
    }

    #[test]
    fn test_single_byte_mask_and_animation() {
        let mut player = player();
        player.mob_mut().update.set_animation(Animation::new(0x1234, 5));
        let flags = player.mob().update.flags;

        let block = encode_player_block(&player, flags).unwrap();
        assert_eq!(block.as_ref(), &[0x8, 0x34, 0x12, 0u8.wrapping_sub(5)]);
    }

    #[test]
    fn test_extended_mask_is_little_endian() {
        let mut player = player();
        player.mob_mut().update.set_graphic(Graphic::new(1, 100, 0));
        let flags = player.mob().update.flags;

        let block = encode_player_block(&player, flags).unwrap();
        // 0x100 | 0x40 little endian
        assert_eq!(&block[..2], &[0x40, 0x01]);
        assert_eq!(&block[2..4], &[0x01, 0x00]);
        assert_eq!(&block[4..8], &[0, 100, 0, 0]);
    }

    #[test]
    fn test_order_is_fixed_not_insertion() {
        let mut player = player();
        let hit = Hit {
            damage: 4,
            kind: HitType::Normal,
            hitpoints: 6,
            max_hitpoints: 10,
        };
        // raised in reverse of the read order
        player.mob_mut().update.push_hit(hit);
        player.mob_mut().update.set_chat(ChatMessage {
            color: 0,
            effects: 0,
            rights: 0,
            text: vec![1, 2],
        });
        player.mob_mut().update.set_animation(Animation::new(7, 0));
        let flags = player.mob().update.flags;

        let block = encode_player_block(&player, flags).unwrap();
        assert_eq!(block[0], 0x8 | 0x80 | 0x20);
        // animation first
        assert_eq!(&block[1..3], &[7, 0]);
        // then chat: effects/colour, rights, length, reversed text
        assert_eq!(&block[4..9], &[0, 0, 0, 0u8.wrapping_sub(2), 2]);
        // hit last
        assert_eq!(&block[10..], &[4, 1 + 128, 0u8.wrapping_sub(6), 10]);
    }

    #[test]
    fn test_appearance_block_is_length_prefixed() {
        let mut player = player();
        player.mob_mut().update.flag(UpdateFlags::APPEARANCE);

        let block = encode_player_block(&player, UpdateFlags::APPEARANCE).unwrap();
        assert_eq!(block[0], 0x10);
        let len = 0u8.wrapping_sub(block[1]) as usize;
        assert_eq!(block.len(), 2 + len);
        // name sits before the combat level and total level
        let name = &block[block.len() - 11..block.len() - 3];
        assert_eq!(name, &name_to_long("alice").to_be_bytes());
    }

    #[test]
    fn test_npc_mask_and_order() {
        let mut npc = npc();
        npc.mob_mut().update.set_forced_chat("Hi");
        npc.mob_mut().update.set_animation(Animation::new(0x0102, 0));
        let flags = npc.mob().update.flags;

        let block = encode_npc_block(&npc, flags).unwrap();
        assert_eq!(block[0], 0x10 | 0x1);
        assert_eq!(&block[1..4], &[0x02, 0x01, 0]);
        assert_eq!(&block[4..], b"Hi\n");
    }

    #[test]
    fn test_npc_transform() {
        let mut npc = npc();
        npc.transform(300);
        let flags = npc.mob().update.flags;
        let block = encode_npc_block(&npc, flags).unwrap();
        assert_eq!(block.as_ref(), &[0x2, (300u16 as u8).wrapping_add(128), 1]);
    }
}
