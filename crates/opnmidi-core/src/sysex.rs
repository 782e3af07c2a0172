//! System-exclusive message recognition.
//!
//! Parsing is pure: a complete `F0 .. F7` message comes in, a
//! [`SysExAction`] comes out, and the player applies it. Only the
//! messages the driver reacts to are recognized: the GM/GS/XG reset
//! family, the universal master-volume message, and the GS/XG part-mode
//! messages that switch a channel into percussion.

const MANUFACTURER_UNIVERSAL_NON_REALTIME: u8 = 0x7E;
const MANUFACTURER_UNIVERSAL_REALTIME: u8 = 0x7F;
const MANUFACTURER_ROLAND: u8 = 0x41;
const MANUFACTURER_YAMAHA: u8 = 0x43;

const ROLAND_MODEL_GS: u8 = 0x42;
const ROLAND_MODE_DATA_SET: u8 = 0x12;
const YAMAHA_MODEL_XG: u8 = 0x4C;

/// GS part blocks in address nibble order. Block 0 is part 10, the drum
/// part, hence the leading 9.
const GS_PART_TO_CHANNEL: [u8; 16] = [9, 0, 1, 2, 3, 4, 5, 6, 7, 8, 10, 11, 12, 13, 14, 15];

/// Driver reaction to a recognized SysEx message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SysExAction {
    /// Full state reset (GM on/off, GM2 on, GS reset, XG on).
    ResetState,
    /// Universal device master volume, MSB of the 14-bit value.
    MasterVolume(u8),
    /// GS or XG part setup switching a channel's percussion mode.
    PartPercussion { channel: u8, percussion: bool },
}

/// Recognizes a complete SysEx message addressed to `device_id`.
///
/// # Returns
/// `None` for malformed, foreign-device or unrecognized messages.
pub(crate) fn parse(device_id: u8, msg: &[u8]) -> Option<SysExAction> {
    if msg.len() < 4 || msg[0] != 0xF0 || msg[msg.len() - 1] != 0xF7 {
        return None;
    }
    let manufacturer = msg[1];
    let dev = msg[2];
    let data = &msg[3..msg.len() - 1];
    match manufacturer {
        MANUFACTURER_UNIVERSAL_NON_REALTIME => parse_universal(device_id, dev, false, data),
        MANUFACTURER_UNIVERSAL_REALTIME => parse_universal(device_id, dev, true, data),
        MANUFACTURER_ROLAND => parse_roland(device_id, dev, data),
        MANUFACTURER_YAMAHA => parse_yamaha(device_id, dev, data),
        _ => None,
    }
}

fn parse_universal(device_id: u8, dev: u8, realtime: bool, data: &[u8]) -> Option<SysExAction> {
    if !(dev == 0x7F || dev == device_id) || data.len() < 2 {
        return None;
    }
    let address = (u16::from(data[0]) << 8) | u16::from(data[1]);
    let payload = &data[2..];
    match (realtime, address) {
        // GM System On / Off, GM2 System On.
        (false, 0x0901) | (false, 0x0902) | (false, 0x0903) => Some(SysExAction::ResetState),
        (true, 0x0401) if payload.len() == 2 => {
            let value = (u16::from(payload[1] & 0x7F) << 7) | u16::from(payload[0] & 0x7F);
            Some(SysExAction::MasterVolume((value >> 7) as u8))
        }
        _ => None,
    }
}

fn parse_roland(device_id: u8, dev: u8, data: &[u8]) -> Option<SysExAction> {
    if !(dev == 0x7F || (dev & 0x0F) == device_id) || data.len() < 6 {
        return None;
    }
    let model = data[0] & 0x7F;
    let mode = data[1] & 0x7F;
    let checksum = data[data.len() - 1] & 0x7F;
    let body = &data[2..data.len() - 1];

    // Roland checksum: address, payload and checksum sum to 0 mod 128.
    let sum: u32 = body.iter().map(|&b| u32::from(b & 0x7F)).sum();
    if (sum + u32::from(checksum)) % 128 != 0 {
        return None;
    }
    if mode != ROLAND_MODE_DATA_SET || model != ROLAND_MODEL_GS {
        return None;
    }

    let address =
        (u32::from(body[0]) << 16) | (u32::from(body[1]) << 8) | u32::from(body[2]);
    let payload = &body[3..];

    if address == 0x40_00_7F && payload.len() == 1 {
        return Some(SysExAction::ResetState);
    }
    if (address & 0xFF_F0_FF) == 0x40_10_15 && payload.len() == 1 {
        let part = ((address >> 8) & 0x0F) as usize;
        return Some(SysExAction::PartPercussion {
            channel: GS_PART_TO_CHANNEL[part],
            percussion: (payload[0] & 0x7F) > 0,
        });
    }
    None
}

fn parse_yamaha(device_id: u8, dev: u8, data: &[u8]) -> Option<SysExAction> {
    if !(dev == 0x7F || (dev & 0x0F) == device_id) || data.is_empty() {
        return None;
    }
    let model = data[0] & 0x7F;
    let body = &data[1..];
    if model != YAMAHA_MODEL_XG || body.len() != 4 {
        return None;
    }
    let address =
        (u32::from(body[0]) << 16) | (u32::from(body[1]) << 8) | u32::from(body[2]);
    let value = body[3] & 0x7F;

    if address == 0x00_00_7E {
        return Some(SysExAction::ResetState);
    }
    if (address & 0xFF_00_FF) == 0x08_00_07 {
        let part = (address >> 8) & 0x7F;
        if part > 15 {
            return None;
        }
        return Some(SysExAction::PartPercussion {
            channel: part as u8,
            percussion: value >= 1,
        });
    }
    None
}
