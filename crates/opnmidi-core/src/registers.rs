//! Register-level programming of the chip array.
//!
//! [`Synth`] owns the chip instances and turns driver intent (patch, pan,
//! key state, loudness) into register writes. Channels are addressed by a
//! flat global index; channel `c` lives on chip `c / 6`, and within a chip
//! the six FM channels split across two ports of three channels each.
//!
//! Writes follow the chip's programming rules: frequency MSB before LSB,
//! key state through register 0x28 on port 0, and the shared 0xB4 byte
//! (pan bits plus LFO sensitivity) kept in a per-channel cache so pan and
//! patch updates can merge their halves.

use opnmidi_models::{carriers, ChipFamily, VoiceLevels, VolumeModel};

use crate::backend::{ChipFactory, OpnChip};
use crate::bank::Timbre;

/// Pan bit for the left speaker in the 0xB4 register.
pub const PAN_LEFT: u8 = 0x80;
/// Pan bit for the right speaker in the 0xB4 register.
pub const PAN_RIGHT: u8 = 0x40;

/// FM channels per chip.
pub const CHANNELS_PER_CHIP: usize = 6;

/// Key-on/off channel codes for register 0x28. The third bit selects the
/// second port, so the sequence skips value 3.
const KEY_CHANNEL_MAP: [u8; 6] = [0, 1, 2, 4, 5, 6];

/// Converts a MIDI pan position into 0xB4 speaker-enable bits.
///
/// The center band (32..=95) enables both speakers; hard edges mute one
/// side entirely.
pub fn panning_to_bits(panning: u8) -> u8 {
    let mut bits = 0;
    if panning < 96 {
        bits |= PAN_LEFT;
    }
    if panning >= 32 {
        bits |= PAN_RIGHT;
    }
    bits
}

#[inline]
fn chan_address(c: usize) -> (usize, u8, u8, usize) {
    let chip = c / CHANNELS_PER_CHIP;
    let ch4 = c % CHANNELS_PER_CHIP;
    let port = if ch4 < 3 { 0 } else { 1 };
    let cc = (ch4 % 3) as u8;
    (chip, port, cc, ch4)
}

/// Programs and mixes an array of OPN chips.
pub struct Synth {
    family: ChipFamily,
    chips: Vec<Box<dyn OpnChip>>,
    sample_rate: u32,
    /// Last patch programmed per channel; pan and touch updates read
    /// their register bytes from here.
    ins_cache: Vec<Timbre>,
    /// Image of the 0xB4 byte per channel: pan bits in the top two bits,
    /// LFO sensitivity below.
    lfo_sens_cache: Vec<u8>,
    lfo_enabled: bool,
    lfo_frequency: u8,
    master_volume: u8,
    volume_model: VolumeModel,
    scale_modulators: bool,
    scratch: Vec<i16>,
}

impl Synth {
    /// A synth with no chips yet; call [`Self::rebuild`] before use.
    pub fn new(family: ChipFamily) -> Self {
        Self {
            family,
            chips: Vec::new(),
            sample_rate: 0,
            ins_cache: Vec::new(),
            lfo_sens_cache: Vec::new(),
            lfo_enabled: false,
            lfo_frequency: 0,
            master_volume: 127,
            volume_model: VolumeModel::default(),
            scale_modulators: false,
            scratch: Vec::new(),
        }
    }

    /// Chip family the synth programs for.
    #[inline]
    pub fn family(&self) -> ChipFamily {
        self.family
    }

    /// Switches the chip family. Takes effect on the next [`Self::rebuild`].
    pub fn set_family(&mut self, family: ChipFamily) {
        self.family = family;
    }

    /// Output sample rate of the current chip array.
    #[inline]
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Number of addressable FM channels.
    #[inline]
    pub fn num_channels(&self) -> usize {
        self.chips.len() * CHANNELS_PER_CHIP
    }

    /// Loudness curve applied by [`Self::touch_note`].
    #[inline]
    pub fn volume_model(&self) -> VolumeModel {
        self.volume_model
    }

    /// Selects the loudness curve.
    pub fn set_volume_model(&mut self, model: VolumeModel) {
        self.volume_model = model;
    }

    /// Applies the loudness curve to modulator operators as well.
    pub fn set_scale_modulators(&mut self, scale: bool) {
        self.scale_modulators = scale;
    }

    /// Master volume, 0..=127.
    #[inline]
    pub fn master_volume(&self) -> u8 {
        self.master_volume
    }

    /// Sets the master volume; existing notes pick it up on their next
    /// volume update.
    pub fn set_master_volume(&mut self, volume: u8) {
        self.master_volume = volume.min(127);
    }

    /// Tears down the chip array and builds `num_chips` fresh instances
    /// through `factory`, putting each into its power-on state.
    pub fn rebuild(&mut self, factory: &ChipFactory, num_chips: usize, sample_rate: u32) {
        self.chips.clear();
        for id in 0..num_chips {
            let mut chip = factory(self.family);
            chip.set_chip_id(id as u32);
            chip.reset(sample_rate, self.family.clock());
            self.chips.push(chip);
        }
        self.sample_rate = sample_rate;
        self.ins_cache = vec![Timbre::default(); self.num_channels()];
        self.lfo_sens_cache = vec![0; self.num_channels()];
        self.reset_registers();
    }

    /// Writes the power-on register sequence to every chip: LFO setup,
    /// channel 3 in normal mode, DAC off, every key released.
    pub fn reset_registers(&mut self) {
        let lfo_setup = self.lfo_setup_byte();
        for chip in 0..self.chips.len() {
            self.write_reg(chip, 0, 0x22, lfo_setup);
            self.write_reg(chip, 0, 0x27, 0x00);
            self.write_reg(chip, 0, 0x2B, 0x00);
            for code in KEY_CHANNEL_MAP {
                self.write_reg(chip, 0, 0x28, code);
            }
        }
        for cache in &mut self.ins_cache {
            *cache = Timbre::default();
        }
        for cache in &mut self.lfo_sens_cache {
            *cache = 0;
        }
    }

    fn lfo_setup_byte(&self) -> u8 {
        (if self.lfo_enabled { 0x08 } else { 0x00 }) | (self.lfo_frequency & 0x07)
    }

    /// `true` when the global LFO is running.
    #[inline]
    pub fn lfo_enabled(&self) -> bool {
        self.lfo_enabled
    }

    /// Current LFO rate selection, 0..=7.
    #[inline]
    pub fn lfo_frequency(&self) -> u8 {
        self.lfo_frequency
    }

    /// Enables or disables the global LFO and sets its rate (0..=7),
    /// committing register 0x22 on every chip.
    pub fn set_lfo(&mut self, enabled: bool, frequency: u8) {
        self.lfo_enabled = enabled;
        self.lfo_frequency = frequency & 0x07;
        let byte = self.lfo_setup_byte();
        for chip in 0..self.chips.len() {
            self.write_reg(chip, 0, 0x22, byte);
        }
    }

    fn write_reg(&mut self, chip: usize, port: u8, addr: u8, value: u8) {
        if let Some(chip) = self.chips.get_mut(chip) {
            chip.write_reg(port, addr, value);
        }
    }

    /// Programs a full voice onto channel `c`: all 28 operator bytes,
    /// feedback/algorithm, and the instrument's LFO sensitivity merged
    /// under the channel's current pan bits.
    pub fn set_patch(&mut self, c: usize, timbre: &Timbre) {
        let (chip, port, cc, _) = chan_address(c);
        self.ins_cache[c] = *timbre;
        let ops = [
            timbre.operators[0].register_bytes(),
            timbre.operators[1].register_bytes(),
            timbre.operators[2].register_bytes(),
            timbre.operators[3].register_bytes(),
        ];
        for d in 0..7u8 {
            for op in 0..4u8 {
                let addr = 0x30 + 0x10 * d + 4 * op + cc;
                self.write_reg(chip, port, addr, ops[usize::from(op)][usize::from(d)]);
            }
        }
        self.write_reg(chip, port, 0xB0 + cc, timbre.fbalg);
        let lfo = (self.lfo_sens_cache[c] & 0xC0) | (timbre.lfosens & 0x3F);
        self.lfo_sens_cache[c] = lfo;
        self.write_reg(chip, port, 0xB4 + cc, lfo);
    }

    /// Sets the channel's pan bits (see [`panning_to_bits`]), keeping the
    /// programmed instrument's LFO sensitivity.
    pub fn set_pan(&mut self, c: usize, bits: u8) {
        let (chip, port, cc, _) = chan_address(c);
        let value = (bits & 0xC0) | (self.ins_cache[c].lfosens & 0x3F);
        self.lfo_sens_cache[c] = value;
        self.write_reg(chip, port, 0xB4 + cc, value);
    }

    /// Keys the channel off.
    pub fn note_off(&mut self, c: usize) {
        let (chip, _, _, ch4) = chan_address(c);
        self.write_reg(chip, 0, 0x28, KEY_CHANNEL_MAP[ch4]);
    }

    /// Programs the channel frequency for `tone` (fractional semitones)
    /// and keys all four operators on. Tones outside the chip's range are
    /// ignored entirely.
    pub fn note_on(&mut self, c: usize, tone: f64) {
        let Some(word) = self.family.tone_to_freq_word(tone) else {
            return;
        };
        let (chip, port, cc, ch4) = chan_address(c);
        self.write_reg(chip, port, 0xA4 + cc, (word >> 8) as u8);
        self.write_reg(chip, port, 0xA0 + cc, (word & 0xFF) as u8);
        self.write_reg(chip, 0, 0x28, 0xF0 + KEY_CHANNEL_MAP[ch4]);
    }

    /// Recomputes the four operator level registers of channel `c` from
    /// the programmed instrument and the given loudness inputs.
    ///
    /// The volume model rewrites carriers (and modulators too when
    /// modulator scaling is on); a brightness below 127 then darkens the
    /// remaining pure modulators along the XG curve.
    pub fn touch_note(
        &mut self,
        c: usize,
        velocity: u8,
        channel_volume: u8,
        channel_expression: u8,
        brightness: u8,
    ) {
        let (chip, port, cc, _) = chan_address(c);
        let timbre = self.ins_cache[c];
        let algorithm = timbre.algorithm();
        let do_op = carriers(algorithm);

        let mut levels = VoiceLevels {
            velocity,
            channel_volume,
            expression: channel_expression,
            master: self.master_volume,
            algorithm,
            op_levels: [
                timbre.operators[0].level & 0x7F,
                timbre.operators[1].level & 0x7F,
                timbre.operators[2].level & 0x7F,
                timbre.operators[3].level & 0x7F,
            ],
            scale_op: [
                do_op[0] || self.scale_modulators,
                do_op[1] || self.scale_modulators,
                do_op[2] || self.scale_modulators,
                do_op[3] || self.scale_modulators,
            ],
        };
        self.volume_model.apply(&mut levels);

        let curve = if brightness == 127 {
            127
        } else {
            opnmidi_models::xg_brightness_curve(brightness)
        };
        for op in 0..4 {
            let mut level = u32::from(levels.op_levels[op]);
            if curve != 127 && !levels.scale_op[op] {
                level = 127 - (u32::from(curve) * (127 - (level & 127))) / 127;
            }
            let addr = 0x40 + cc + 4 * (op as u8);
            self.write_reg(chip, port, addr, level as u8);
        }
    }

    /// Keys every channel off and pulls its operator levels to silence.
    pub fn silence_all(&mut self) {
        for c in 0..self.num_channels() {
            self.note_off(c);
            self.touch_note(c, 0, 127, 127, 127);
        }
    }

    /// Renders interleaved stereo frames from all chips, mixed with
    /// saturation. With no chips configured the output is silence.
    pub fn generate(&mut self, output: &mut [i16]) {
        output.fill(0);
        if self.chips.is_empty() {
            return;
        }
        self.scratch.resize(output.len(), 0);
        for chip in &mut self.chips {
            chip.generate(&mut self.scratch);
            for (out, &add) in output.iter_mut().zip(self.scratch.iter()) {
                *out = (i32::from(*out) + i32::from(add))
                    .clamp(i32::from(i16::MIN), i32::from(i16::MAX)) as i16;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{RegisterCapture, RegisterLog};
    use crate::bank::Operator;

    fn capture_synth(chips: usize) -> (Synth, RegisterLog) {
        let log = RegisterLog::new();
        let factory = RegisterCapture::factory(log.clone());
        let mut synth = Synth::new(ChipFamily::Opn2);
        synth.rebuild(&factory, chips, 44_100);
        log.clear();
        (synth, log)
    }

    fn test_timbre() -> Timbre {
        let mut t = Timbre::default();
        for (i, op) in t.operators.iter_mut().enumerate() {
            op.dtfm = 0x71;
            op.level = 0x10 + i as u8;
            op.rsatk = 0x1F;
            op.amdecay1 = 0x05;
            op.decay2 = 0x02;
            op.susrel = 0x11;
            op.ssgeg = 0x00;
        }
        t.fbalg = 0x38 | 0x04;
        t.lfosens = 0x02;
        t
    }

    #[test]
    fn test_pan_bits() {
        assert_eq!(panning_to_bits(64), PAN_LEFT | PAN_RIGHT);
        assert_eq!(panning_to_bits(0), PAN_LEFT);
        assert_eq!(panning_to_bits(31), PAN_LEFT);
        assert_eq!(panning_to_bits(32), PAN_LEFT | PAN_RIGHT);
        assert_eq!(panning_to_bits(95), PAN_LEFT | PAN_RIGHT);
        assert_eq!(panning_to_bits(96), PAN_RIGHT);
        assert_eq!(panning_to_bits(127), PAN_RIGHT);
    }

    #[test]
    fn test_reset_sequence() {
        let log = RegisterLog::new();
        let factory = RegisterCapture::factory(log.clone());
        let mut synth = Synth::new(ChipFamily::Opn2);
        synth.rebuild(&factory, 1, 44_100);

        let writes = log.snapshot();
        let bytes: Vec<(u8, u8)> = writes.iter().map(|w| (w.addr, w.value)).collect();
        assert_eq!(
            bytes,
            vec![
                (0x22, 0x00),
                (0x27, 0x00),
                (0x2B, 0x00),
                (0x28, 0),
                (0x28, 1),
                (0x28, 2),
                (0x28, 4),
                (0x28, 5),
                (0x28, 6),
            ]
        );
        assert!(writes.iter().all(|w| w.port == 0));
    }

    #[test]
    fn test_key_codes_skip_value_three() {
        let (mut synth, log) = capture_synth(1);
        for c in 0..6 {
            synth.note_on(c, 69.0);
        }
        let keys: Vec<u8> = log
            .snapshot()
            .iter()
            .filter(|w| w.addr == 0x28)
            .map(|w| w.value)
            .collect();
        assert_eq!(keys, vec![0xF0, 0xF1, 0xF2, 0xF4, 0xF5, 0xF6]);
    }

    #[test]
    fn test_note_on_frequency_write_order() {
        let (mut synth, log) = capture_synth(1);
        synth.note_on(0, 69.0);

        let writes = log.snapshot();
        assert_eq!(writes.len(), 3);
        // A440: F-number 541 in block 5.
        assert_eq!(writes[0].addr, 0xA4);
        assert_eq!(writes[0].value, 0x2A);
        assert_eq!(writes[1].addr, 0xA0);
        assert_eq!(writes[1].value, 0x1D);
        assert_eq!(writes[2].addr, 0x28);
        assert_eq!(writes[2].value, 0xF0);
    }

    #[test]
    fn test_out_of_range_tone_writes_nothing() {
        let (mut synth, log) = capture_synth(1);
        synth.note_on(0, 127.0 + 60.0);
        assert!(log.is_empty());
    }

    #[test]
    fn test_second_chip_and_port_addressing() {
        let (mut synth, log) = capture_synth(2);
        // Channel 4 = chip 0 port 1 cc 1; channel 8 = chip 1 port 0 cc 2.
        synth.note_on(4, 69.0);
        synth.note_on(8, 69.0);

        let writes = log.snapshot();
        assert_eq!(writes[0].chip_id, 0);
        assert_eq!(writes[0].port, 1);
        assert_eq!(writes[0].addr, 0xA5);
        assert_eq!(writes[2].chip_id, 0);
        assert_eq!(writes[2].port, 0);
        assert_eq!(writes[2].value, 0xF5);
        assert_eq!(writes[3].chip_id, 1);
        assert_eq!(writes[3].port, 0);
        assert_eq!(writes[3].addr, 0xA6);
        assert_eq!(writes[5].value, 0xF2);
    }

    #[test]
    fn test_set_patch_register_image() {
        let (mut synth, log) = capture_synth(1);
        let timbre = test_timbre();
        synth.set_patch(2, &timbre);

        let image = log.port_image(0);
        for op in 0..4u8 {
            let base = usize::from(4 * op + 2);
            assert_eq!(image[0][0x30 + base], 0x71);
            assert_eq!(image[0][0x40 + base], 0x10 + op);
            assert_eq!(image[0][0x50 + base], 0x1F);
            assert_eq!(image[0][0x60 + base], 0x05);
            assert_eq!(image[0][0x70 + base], 0x02);
            assert_eq!(image[0][0x80 + base], 0x11);
            assert_eq!(image[0][0x90 + base], 0x00);
        }
        assert_eq!(image[0][0xB0 + 2], timbre.fbalg);
        // Fresh channel has no pan bits yet.
        assert_eq!(image[0][0xB4 + 2], 0x02);
    }

    #[test]
    fn test_pan_patch_byte_merge() {
        let (mut synth, log) = capture_synth(1);
        let timbre = test_timbre();
        synth.set_patch(0, &timbre);
        synth.set_pan(0, PAN_LEFT | PAN_RIGHT);
        // A later patch write keeps the pan bits.
        synth.set_patch(0, &timbre);

        let writes = log.snapshot();
        let b4: Vec<u8> = writes
            .iter()
            .filter(|w| w.addr == 0xB4)
            .map(|w| w.value)
            .collect();
        assert_eq!(b4, vec![0x02, 0xC2, 0xC2]);
    }

    #[test]
    fn test_touch_note_writes_level_block() {
        let (mut synth, log) = capture_synth(1);
        let timbre = test_timbre();
        synth.set_patch(1, &timbre);
        log.clear();

        synth.touch_note(1, 127, 127, 127, 127);
        let writes = log.snapshot();
        assert_eq!(writes.len(), 4);
        let addrs: Vec<u8> = writes.iter().map(|w| w.addr).collect();
        assert_eq!(addrs, vec![0x41, 0x45, 0x49, 0x4D]);
        // Algorithm 4 in register order: OP1 and OP3 modulate, OP2 and
        // OP4 carry. Full loudness leaves the carriers at their patch
        // levels and modulators untouched.
        assert_eq!(writes[0].value, 0x10);
        assert_eq!(writes[1].value, 0x11);
        assert_eq!(writes[2].value, 0x12);
        assert_eq!(writes[3].value, 0x13);
    }

    #[test]
    fn test_touch_note_zero_velocity_mutes_carriers() {
        let (mut synth, log) = capture_synth(1);
        let timbre = test_timbre();
        synth.set_patch(0, &timbre);
        log.clear();

        synth.touch_note(0, 0, 127, 127, 127);
        let writes = log.snapshot();
        // Modulators (OP1, OP3) keep their levels; carriers attenuate fully.
        assert_eq!(writes[0].value, 0x10);
        assert_eq!(writes[1].value, 0x11);
        assert_eq!(writes[2].value, 127);
        assert_eq!(writes[3].value, 127);
    }

    #[test]
    fn test_brightness_darkens_pure_modulators() {
        let (mut synth, log) = capture_synth(1);
        let timbre = test_timbre();
        synth.set_patch(0, &timbre);
        log.clear();

        synth.touch_note(0, 127, 127, 127, 0);
        let writes = log.snapshot();
        // Curve value 0 pulls modulators to full attenuation.
        assert_eq!(writes[0].value, 127);
        assert_eq!(writes[1].value, 127);
        // Carriers are untouched by brightness.
        assert_eq!(writes[2].value, 0x12);
        assert_eq!(writes[3].value, 0x13);
    }

    #[test]
    fn test_lfo_commit_reaches_all_chips() {
        let (mut synth, log) = capture_synth(2);
        synth.set_lfo(true, 5);
        let writes = log.snapshot();
        assert_eq!(writes.len(), 2);
        assert!(writes.iter().all(|w| w.addr == 0x22 && w.value == 0x0D));
        assert_eq!(writes[0].chip_id, 0);
        assert_eq!(writes[1].chip_id, 1);
    }

    #[test]
    fn test_silence_all_releases_and_mutes() {
        let (mut synth, log) = capture_synth(1);
        let timbre = test_timbre();
        for c in 0..6 {
            synth.set_patch(c, &timbre);
            synth.note_on(c, 60.0);
        }
        log.clear();

        synth.silence_all();
        let writes = log.snapshot();
        let key_offs = writes
            .iter()
            .filter(|w| w.addr == 0x28 && w.value < 0x10)
            .count();
        assert_eq!(key_offs, 6);
        // Each channel also gets its four level registers muted.
        assert_eq!(writes.len(), 6 + 6 * 4);
    }

    #[test]
    fn test_generate_without_chips_is_silent() {
        let mut synth = Synth::new(ChipFamily::Opn2);
        let mut frames = [123i16; 16];
        synth.generate(&mut frames);
        assert!(frames.iter().all(|&s| s == 0));
    }
}
