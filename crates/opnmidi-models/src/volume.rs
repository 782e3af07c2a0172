//! Legacy volume models for OPN-family MIDI drivers.
//!
//! Each model maps MIDI loudness inputs (velocity, channel volume CC7,
//! expression CC11, master volume) onto the 0..=127 total-level bytes of the
//! four FM operators. The historic models reproduce the integer arithmetic
//! of their source drivers bit-for-bit, quirks included; do not "fix" them.
//!
//! A model only rewrites the operators flagged in [`VoiceLevels::scale_op`].
//! Callers flag carriers always and modulators only when modulator scaling
//! is enabled (see [`carriers`]).

/// Volume calculation context, mutated in place by [`VolumeModel::apply`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoiceLevels {
    /// MIDI key velocity (0..=127).
    pub velocity: u8,
    /// MIDI channel volume, CC7 (0..=127).
    pub channel_volume: u8,
    /// MIDI channel expression, CC11 (0..=127).
    pub expression: u8,
    /// Master volume level (0..=127).
    pub master: u8,
    /// FM connection algorithm (0..=7).
    pub algorithm: u8,
    /// Total-level byte per operator, KSL bits stripped (0..=127).
    pub op_levels: [u8; 4],
    /// Which operators the model may rewrite.
    pub scale_op: [bool; 4],
}

/// Carrier operators per connection algorithm.
///
/// Index order follows the chip's operator register order (OP1, OP3, OP2,
/// OP4), which is why algorithm 4 reads as if operators 2 and 3 were
/// swapped.
///
/// # Returns
/// `true` for every operator that feeds the output mix directly.
pub fn carriers(algorithm: u8) -> [bool; 4] {
    const ALG_DO: [[bool; 4]; 8] = [
        //OP1    OP3    OP2    OP4
        [false, false, false, true], // 0:  1 > 2 > 3 > 4
        [false, false, false, true], // 1:  (1 + 2) > 3 > 4
        [false, false, false, true], // 2:  (1 + (2 > 3)) > 4
        [false, false, false, true], // 3:  ((1 > 2) + 3) > 4
        [false, false, true, true],  // 4:  (1 > 2) + (3 > 4)
        [false, true, true, true],   // 5:  1 > (2 + 3 + 4)
        [false, true, true, true],   // 6:  (1 > 2) + 3 + 4
        [true, true, true, true],    // 7:  1 + 2 + 3 + 4
    ];
    ALG_DO[usize::from(algorithm & 0x07)]
}

/// DMX driver loudness table (Doom, Heretic).
static DMX_VOLUME_MODEL: [u32; 128] = [
    0, 1, 3, 5, 6, 8, 10, 11, //
    13, 14, 16, 17, 19, 20, 22, 23, //
    25, 26, 27, 29, 30, 32, 33, 34, //
    36, 37, 39, 41, 43, 45, 47, 49, //
    50, 52, 54, 55, 57, 59, 60, 61, //
    63, 64, 66, 67, 68, 69, 71, 72, //
    73, 74, 75, 76, 77, 79, 80, 81, //
    82, 83, 84, 84, 85, 86, 87, 88, //
    89, 90, 91, 92, 92, 93, 94, 95, //
    96, 96, 97, 98, 99, 99, 100, 101, //
    101, 102, 103, 103, 104, 105, 105, 106, //
    107, 107, 108, 109, 109, 110, 110, 111, //
    112, 112, 113, 113, 114, 114, 115, 115, //
    116, 117, 117, 118, 118, 119, 119, 120, //
    120, 121, 121, 122, 122, 123, 123, 123, //
    124, 124, 125, 125, 126, 126, 127, 127, //
];

/// SB16 Windows 9x driver attenuation table (indexed by value >> 2).
static W9X_VOLUME_MAPPING_TABLE: [u32; 32] = [
    63, 63, 40, 36, 32, 28, 23, 21, //
    19, 17, 15, 14, 13, 12, 11, 10, //
    9, 8, 7, 6, 5, 5, 4, 4, //
    3, 3, 2, 2, 1, 1, 0, 0, //
];

/// Loudness curve selection.
///
/// Dispatch is a plain tagged enum; embedders choose a model once per
/// player and every `touch` recomputes operator levels through it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum VolumeModel {
    /// Linearized scaling, the default for general MIDI playback.
    #[default]
    Generic,
    /// No scaling at all; levels come straight from the instrument.
    NativeOpn2,
    /// DMX driver curve (Doom).
    Dmx,
    /// Apogee Sound System curve (Duke Nukem 3D era).
    Apogee,
    /// SB16 Windows 9x FM driver curve.
    Win9x,
}

impl VolumeModel {
    /// Applies the model to `v`, rewriting the flagged operator levels.
    pub fn apply(self, v: &mut VoiceLevels) {
        match self {
            VolumeModel::Generic => generic_volume(v),
            VolumeModel::NativeOpn2 => {}
            VolumeModel::Dmx => dmx_like_volume(v),
            VolumeModel::Apogee => apogee_like_volume(v),
            VolumeModel::Win9x => w9x_like_volume(v),
        }
    }
}

/// Blend helper shared by the generic and DMX models:
/// `127 - scalar * (127 - tl) / 127` with `scalar` in 0..=127.
fn blend_level(tl: u8, scalar: u32) -> u8 {
    (127 - (scalar * (127 - u32::from(tl & 127))) / 127) as u8
}

fn generic_volume(v: &mut VoiceLevels) {
    let scalar = u32::from(v.velocity)
        * u32::from(v.channel_volume)
        * u32::from(v.expression)
        * u32::from(v.master)
        / (127 * 127 * 127);

    for i in 0..4 {
        if v.scale_op[i] {
            v.op_levels[i] = blend_level(v.op_levels[i], scalar);
        }
    }
}

fn dmx_like_volume(v: &mut VoiceLevels) {
    let mut volume =
        u32::from(v.channel_volume) * u32::from(v.expression) * u32::from(v.master) / 16129;

    if volume > 127 {
        volume = 127;
    }

    volume = (DMX_VOLUME_MODEL[volume as usize] + 1) << 1;
    volume = (DMX_VOLUME_MODEL[usize::from(v.velocity.min(127))] * volume) >> 9;

    // 0..=63 is near silence on OPN; shift audible results into 64..=127.
    if volume > 0 {
        volume += 64;
    }

    if volume > 127 {
        volume = 127;
    }

    for i in 0..4 {
        if v.scale_op[i] {
            v.op_levels[i] = blend_level(v.op_levels[i], volume);
        }
    }
}

fn apogee_like_volume(v: &mut VoiceLevels) {
    let mut volume =
        u32::from(v.channel_volume) * u32::from(v.expression) * u32::from(v.master) / 16129;

    if volume > 127 {
        volume = 127;
    }

    for i in 0..4 {
        if v.scale_op[i] {
            let mut op = u32::from(v.op_levels[i]);
            op = (127 - op) / 2;
            op *= u32::from(v.velocity) + 0x80;
            op = (volume * op) >> 15;
            op ^= 63;
            op = 64 - op;

            if op > 0 {
                op += 64;
            }

            if op > 127 {
                op = 127;
            }

            v.op_levels[i] = (127 - op) as u8;
        }
    }
}

fn w9x_like_volume(v: &mut VoiceLevels) {
    let mut volume =
        u32::from(v.channel_volume) * u32::from(v.expression) * u32::from(v.master) / 16129;
    volume = W9X_VOLUME_MAPPING_TABLE[(volume >> 2) as usize];

    for i in 0..4 {
        if v.scale_op[i] {
            // Unsigned wrap cancels out; `op` ends up equal to the raw level.
            let mut op = 63u32
                .wrapping_sub(127u32.wrapping_sub(u32::from(v.op_levels[i])).wrapping_sub(64));
            op = op.wrapping_add(volume + W9X_VOLUME_MAPPING_TABLE[usize::from(v.velocity >> 2)]);

            if op > 0x3F {
                op = 0x3F;
            }

            op = 63 - op;

            if op > 0 {
                op += 64;
            }

            v.op_levels[i] = (127 - op) as u8;
        }
    }
}
