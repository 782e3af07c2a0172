//! MIDI tone to OPN block/f-number encoding.
//!
//! The OPN channel frequency register pair packs an 11-bit f-number and a
//! 3-bit block (octave) into one 14-bit word; the high byte goes to
//! 0xA4+c, the low byte to 0xA0+c. The conversion here follows the classic
//! driver formula: tone to hertz through an exponential with a per-family
//! coefficient, then repeated halving into the f-number range while the
//! block counts octaves.

/// OPN2 (YM2612) master clock in Hz.
pub const OPN2_CLOCK: u32 = 7_670_454;
/// OPNA (YM2608) master clock in Hz.
pub const OPNA_CLOCK: u32 = 7_987_200;

/// OPN2 (YM2612) native output sample rate in Hz.
pub const OPN2_NATIVE_RATE: u32 = 53_267;
/// OPNA (YM2608) native output sample rate in Hz.
pub const OPNA_NATIVE_RATE: u32 = 55_466;

/// Tone-to-hertz coefficient calibrated for the OPN2 clock.
const OPN2_BEND_COEFFICIENT: f64 = 321.88557;

/// Chip family an engine drives. Families share the register map; clock
/// rate and therefore frequency encoding differ.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ChipFamily {
    /// YM2612, the Sega Mega Drive FM chip.
    #[default]
    Opn2,
    /// YM2608, the PC-98 FM+ADPCM chip (FM section only).
    Opna,
}

impl ChipFamily {
    /// Master clock in Hz fed to the chip.
    #[inline]
    pub fn clock(self) -> u32 {
        match self {
            ChipFamily::Opn2 => OPN2_CLOCK,
            ChipFamily::Opna => OPNA_CLOCK,
        }
    }

    /// Native output sample rate in Hz at that clock.
    #[inline]
    pub fn native_sample_rate(self) -> u32 {
        match self {
            ChipFamily::Opn2 => OPN2_NATIVE_RATE,
            ChipFamily::Opna => OPNA_NATIVE_RATE,
        }
    }

    /// Tone-to-hertz coefficient for this family.
    ///
    /// The f-number needed for a given pitch scales inversely with the
    /// master clock, so the OPNA coefficient is the OPN2 one scaled by the
    /// clock ratio.
    #[inline]
    pub fn bend_coefficient(self) -> f64 {
        match self {
            ChipFamily::Opn2 => OPN2_BEND_COEFFICIENT,
            ChipFamily::Opna => OPN2_BEND_COEFFICIENT * (OPN2_CLOCK as f64 / OPNA_CLOCK as f64),
        }
    }

    /// Converts a MIDI tone (semitones, fractional detune allowed) into the
    /// combined block/f-number word.
    ///
    /// # Returns
    /// `None` when the tone falls outside the encodable range; callers are
    /// expected to skip the register write and keep their bookkeeping.
    pub fn tone_to_freq_word(self, tone: f64) -> Option<u16> {
        let mut hertz = self.bend_coefficient() * f64::exp(0.057762265 * tone);
        let mut word: u32 = 0x0000;

        if !hertz.is_finite() || hertz < 0.0 || hertz > 262143.0 {
            return None;
        }

        while hertz >= 1023.75 && word < 0x3800 {
            hertz /= 2.0; // next octave up
            word += 0x800;
        }

        word += (hertz + 0.5) as u32;
        Some(word as u16)
    }

    /// Decodes a block/f-number word back into output hertz at the native
    /// clock. Diagnostic counterpart of [`Self::tone_to_freq_word`].
    pub fn freq_word_to_hertz(self, word: u16) -> f64 {
        let fnum = f64::from(word & 0x7FF);
        let block = i32::from(word >> 11);
        fnum * f64::from(self.clock()) / (144.0 * f64::from(1u32 << 20))
            * f64::powi(2.0, block - 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_a4_encodes_to_fnum_541_block_5() {
        let word = ChipFamily::Opn2.tone_to_freq_word(69.0).unwrap();
        assert_eq!(word & 0x7FF, 541);
        assert_eq!(word >> 11, 5);
    }

    #[test]
    fn test_a4_decodes_near_440_hz() {
        let word = ChipFamily::Opn2.tone_to_freq_word(69.0).unwrap();
        let hertz = ChipFamily::Opn2.freq_word_to_hertz(word);
        assert_relative_eq!(hertz, 439.7, epsilon = 0.5);
    }

    #[test]
    fn test_octave_doubles_block() {
        let a4 = ChipFamily::Opn2.tone_to_freq_word(69.0).unwrap();
        let a5 = ChipFamily::Opn2.tone_to_freq_word(81.0).unwrap();
        assert_eq!(a5 >> 11, (a4 >> 11) + 1);
        // Same f-number one octave apart, within rounding.
        let diff = i32::from(a5 & 0x7FF) - i32::from(a4 & 0x7FF);
        assert!(diff.abs() <= 1, "fnum drifted by {diff}");
    }

    #[test]
    fn test_detune_moves_fnum() {
        let plain = ChipFamily::Opn2.tone_to_freq_word(60.0).unwrap();
        let detuned = ChipFamily::Opn2.tone_to_freq_word(60.5).unwrap();
        assert!(detuned > plain);
    }

    #[test]
    fn test_out_of_range_tone_is_rejected() {
        assert_eq!(ChipFamily::Opn2.tone_to_freq_word(127.0), None);
        assert_eq!(ChipFamily::Opn2.tone_to_freq_word(f64::NAN), None);
        assert_eq!(ChipFamily::Opn2.tone_to_freq_word(f64::INFINITY), None);
    }

    #[test]
    fn test_low_tones_stay_in_block_zero() {
        let word = ChipFamily::Opn2.tone_to_freq_word(0.0).unwrap();
        assert_eq!(word >> 11, 0);
        assert!((word & 0x7FF) > 0);
    }

    #[test]
    fn test_opna_coefficient_tracks_clock_ratio() {
        // Equal pitch needs a smaller f-number on the faster clock.
        let opn2 = ChipFamily::Opn2.tone_to_freq_word(69.0).unwrap();
        let opna = ChipFamily::Opna.tone_to_freq_word(69.0).unwrap();
        assert!((opna & 0x7FF) < (opn2 & 0x7FF));
        let hertz = ChipFamily::Opna.freq_word_to_hertz(opna);
        assert_relative_eq!(hertz, 439.7, epsilon = 1.0);
    }
}
