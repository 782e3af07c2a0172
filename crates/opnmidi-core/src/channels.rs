//! Channel state on both sides of the driver.
//!
//! A [`ChipChannel`] tracks who currently owns one physical FM channel:
//! an ordered list of [`NoteClaim`]s plus the release-tail countdown used
//! by the allocator. A [`MidiChannelState`] tracks one of the sixteen MIDI
//! channels: controllers, pitch wheel, vibrato phase and the list of
//! active [`NoteState`]s. The player wires the two together.

use bitflags::bitflags;

use crate::arena::{ClaimArena, Handle};
use crate::bank::{Instrument, Timbre};

/// Lowest value the age countdowns saturate at, microseconds.
const AGE_FLOOR_US: i64 = -0x1FFF_FFFF * 1000;

bitflags! {
    /// Why a claim keeps sounding after its key went up.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SustainFlags: u8 {
        /// Held by the damper pedal (CC64).
        const PEDAL = 0x01;
        /// Held by the sostenuto pedal (CC66).
        const SOSTENUTO = 0x02;
    }
}

/// Address of a note: source MIDI channel plus note number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NoteLocation {
    /// MIDI channel the note arrived on.
    pub midi_channel: u16,
    /// MIDI note number.
    pub note: u8,
}

/// One voice of one note occupying a chip channel.
#[derive(Debug, Clone)]
pub struct NoteClaim {
    /// The note this claim belongs to.
    pub loc: NoteLocation,
    /// Pedals currently holding the claim past its key-off.
    pub sustained: SustainFlags,
    /// Register data the channel is programmed with, compared when the
    /// allocator looks for same-instrument channels.
    pub timbre: Timbre,
    /// The sound holds indefinitely while keyed; its age never counts
    /// against it.
    pub fixed_sustain: bool,
    /// Estimated audible time left while keyed, microseconds. Runs
    /// negative once the sound has decayed on its own.
    pub kon_remaining_us: i64,
    /// Time since the claim was created, microseconds. Gates the vibrato
    /// delay and the arpeggio keep-alive rules.
    pub vibrato_age_us: i64,
}

impl NoteClaim {
    fn new(loc: NoteLocation) -> Self {
        Self {
            loc,
            sustained: SustainFlags::empty(),
            timbre: Timbre::default(),
            fixed_sustain: false,
            kon_remaining_us: 0,
            vibrato_age_us: 0,
        }
    }
}

/// Occupancy state of one physical FM channel.
#[derive(Debug, Clone)]
pub struct ChipChannel {
    /// Claims currently sounding on this channel, oldest first.
    pub claims: ClaimArena<NoteClaim>,
    /// Release-tail countdown, microseconds. Positive while the last
    /// released note is still audible, negative once it has died away.
    pub koff_remaining_us: i64,
    /// Timbre of the last patch programmed on this channel.
    pub recent_timbre: Option<Timbre>,
}

impl ChipChannel {
    /// Claims per channel.
    pub const CLAIM_CAPACITY: usize = 64;

    /// An unoccupied channel.
    pub fn new() -> Self {
        Self {
            claims: ClaimArena::new(Self::CLAIM_CAPACITY),
            koff_remaining_us: 0,
            recent_timbre: None,
        }
    }

    /// `true` when no claim occupies the channel. The release tail may
    /// still be sounding.
    #[inline]
    pub fn is_free(&self) -> bool {
        self.claims.is_empty()
    }

    /// The claim for `loc`, if present.
    pub fn find_claim(&self, loc: NoteLocation) -> Option<Handle> {
        self.claims.find(|claim| claim.loc == loc)
    }

    /// The claim for `loc`, created at the end of the list when missing.
    ///
    /// # Returns
    /// `None` when the claim list is full; the caller drops the claim.
    pub fn find_or_create_claim(&mut self, loc: NoteLocation) -> Option<Handle> {
        if let Some(handle) = self.find_claim(loc) {
            return Some(handle);
        }
        self.claims.push_back(NoteClaim::new(loc))
    }

    /// Advances the channel clocks by `us` microseconds.
    ///
    /// A free channel runs down its release tail; an occupied one ages
    /// every claim instead and keeps the tail at zero.
    pub fn add_age(&mut self, us: i64) {
        if self.claims.is_empty() {
            self.koff_remaining_us = (self.koff_remaining_us - us).max(AGE_FLOOR_US);
        } else {
            self.koff_remaining_us = 0;
            let mut cursor = self.claims.first();
            while let Some(handle) = cursor {
                cursor = self.claims.next(handle);
                if let Some(claim) = self.claims.get_mut(handle) {
                    if !claim.fixed_sustain {
                        claim.kon_remaining_us = (claim.kon_remaining_us - us).max(AGE_FLOOR_US);
                    }
                    claim.vibrato_age_us += us;
                }
            }
        }
    }
}

impl Default for ChipChannel {
    fn default() -> Self {
        Self::new()
    }
}

/// One physical voice assignment of an active note.
#[derive(Debug, Clone, Copy)]
pub struct NoteVoice {
    /// Global chip channel index the voice plays on.
    pub chan: u16,
    /// Register data programmed for this voice.
    pub timbre: Timbre,
    /// Semitone detune of this voice against the played tone.
    pub phase: f64,
}

/// A currently held note on one MIDI channel.
#[derive(Debug, Clone)]
pub struct NoteState {
    /// MIDI note number, the key identity.
    pub note: u8,
    /// Velocity after the instrument's offset, drives the volume model.
    pub velocity: u8,
    /// Per-note vibrato depth from polyphonic aftertouch.
    pub vibrato: u8,
    /// Tone actually sounding, in semitones. Differs from `note` for
    /// fixed-key percussion.
    pub tone: f64,
    /// Program (melodic) or note number (percussive) the instrument was
    /// looked up with.
    pub program: u8,
    /// The instrument resolved at note-on; updates read its metadata.
    pub instrument: Instrument,
    /// Physical voices carrying the note.
    pub voices: [Option<NoteVoice>; 2],
}

/// Default vibrato oscillator rate, radians per second (5 Hz).
pub(crate) const DEFAULT_VIBRATO_SPEED: f64 = 2.0 * std::f64::consts::PI * 5.0;
/// Default vibrato depth, semitones per unit of modulation depth.
pub(crate) const DEFAULT_VIBRATO_DEPTH: f64 = 0.5 / 127.0;

/// Control state of one MIDI channel.
#[derive(Debug, Clone)]
pub struct MidiChannelState {
    /// Bank select MSB (CC0).
    pub bank_msb: u8,
    /// Bank select LSB (CC32).
    pub bank_lsb: u8,
    /// Current program.
    pub patch: u8,
    /// Channel volume (CC7).
    pub volume: u8,
    /// Expression (CC11).
    pub expression: u8,
    /// Pan position (CC10), 64 is center.
    pub panning: u8,
    /// Pitch wheel, centered at zero (-8192..=8191).
    pub pitch_bend: i32,
    /// Semitones per pitch-wheel unit, derived from the bend-range RPN.
    pub bendsense: f64,
    /// Bend range semitones (RPN 0 MSB).
    pub bendsense_msb: u8,
    /// Bend range cents (RPN 0 LSB).
    pub bendsense_lsb: u8,
    /// Modulation wheel depth (CC1).
    pub vibrato: u8,
    /// Channel aftertouch depth.
    pub aftertouch: u8,
    /// Running vibrato oscillator phase, radians.
    pub vibrato_pos: f64,
    /// Vibrato oscillator rate, radians per second.
    pub vibrato_speed: f64,
    /// Vibrato depth, semitones per unit.
    pub vibrato_depth: f64,
    /// Delay before vibrato reaches a fresh note, microseconds.
    pub vibrato_delay_us: i64,
    /// Damper pedal down (CC64).
    pub sustain: bool,
    /// Brightness (CC74).
    pub brightness: u8,
    /// Channel forced into percussion mode by SysEx part setup.
    pub percussion: bool,
    /// Last NRPN/RPN select touched NRPN (CC98/99) rather than RPN.
    pub nrpn: bool,
    /// Active RPN MSB (CC101).
    pub last_rpn_msb: u8,
    /// Active RPN LSB (CC100).
    pub last_rpn_lsb: u8,
    /// Currently held notes.
    pub notes: ClaimArena<NoteState>,
}

impl MidiChannelState {
    /// Held notes per channel.
    pub const NOTE_CAPACITY: usize = 128;

    /// A channel in its power-on state.
    pub fn new() -> Self {
        let mut state = Self {
            bank_msb: 0,
            bank_lsb: 0,
            patch: 0,
            volume: 100,
            expression: 127,
            panning: 64,
            pitch_bend: 0,
            bendsense: 0.0,
            bendsense_msb: 2,
            bendsense_lsb: 0,
            vibrato: 0,
            aftertouch: 0,
            vibrato_pos: 0.0,
            vibrato_speed: DEFAULT_VIBRATO_SPEED,
            vibrato_depth: DEFAULT_VIBRATO_DEPTH,
            vibrato_delay_us: 0,
            sustain: false,
            brightness: 127,
            percussion: false,
            nrpn: false,
            last_rpn_msb: 255,
            last_rpn_lsb: 255,
            notes: ClaimArena::new(Self::NOTE_CAPACITY),
        };
        state.update_bend_sensitivity();
        state
    }

    /// Recomputes [`Self::bendsense`] from the RPN 0 registers.
    pub fn update_bend_sensitivity(&mut self) {
        let units = f64::from(self.bendsense_msb) * 128.0 + f64::from(self.bendsense_lsb);
        self.bendsense = units / (128.0 * 8192.0);
    }

    /// Controller reset per CC121: expression, pedals, wheel state and
    /// brightness return to defaults; volume, pan, bank and program stay.
    pub fn reset_controllers(&mut self) {
        self.expression = 127;
        self.sustain = false;
        self.pitch_bend = 0;
        self.bendsense_msb = 2;
        self.bendsense_lsb = 0;
        self.update_bend_sensitivity();
        self.vibrato = 0;
        self.aftertouch = 0;
        self.vibrato_speed = DEFAULT_VIBRATO_SPEED;
        self.vibrato_depth = DEFAULT_VIBRATO_DEPTH;
        self.vibrato_delay_us = 0;
        self.brightness = 127;
        self.nrpn = false;
        self.last_rpn_msb = 255;
        self.last_rpn_lsb = 255;
    }

    /// Full reset to the power-on state, including volume, pan, bank,
    /// program and the note list.
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// The active note for `note`, if held.
    pub fn find_note(&self, note: u8) -> Option<Handle> {
        self.notes.find(|state| state.note == note)
    }
}

impl Default for MidiChannelState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loc(ch: u16, note: u8) -> NoteLocation {
        NoteLocation {
            midi_channel: ch,
            note,
        }
    }

    #[test]
    fn test_claim_find_or_create() {
        let mut chan = ChipChannel::new();
        let a = chan.find_or_create_claim(loc(0, 60)).unwrap();
        let again = chan.find_or_create_claim(loc(0, 60)).unwrap();
        assert_eq!(a, again);
        assert_eq!(chan.claims.len(), 1);

        let b = chan.find_or_create_claim(loc(0, 64)).unwrap();
        assert_ne!(a, b);
        assert_eq!(chan.claims.len(), 2);
        assert_eq!(chan.find_claim(loc(0, 64)), Some(b));
        assert_eq!(chan.find_claim(loc(1, 64)), None);
    }

    #[test]
    fn test_free_channel_runs_down_release_tail() {
        let mut chan = ChipChannel::new();
        chan.koff_remaining_us = 500_000;
        chan.add_age(200_000);
        assert_eq!(chan.koff_remaining_us, 300_000);
        chan.add_age(400_000);
        assert_eq!(chan.koff_remaining_us, -100_000);
        // Saturates instead of wrapping.
        chan.add_age(i64::MAX / 2);
        assert_eq!(chan.koff_remaining_us, -0x1FFF_FFFF * 1000);
    }

    #[test]
    fn test_occupied_channel_ages_claims() {
        let mut chan = ChipChannel::new();
        chan.koff_remaining_us = 500_000;
        let handle = chan.find_or_create_claim(loc(0, 60)).unwrap();
        {
            let claim = chan.claims.get_mut(handle).unwrap();
            claim.kon_remaining_us = 1_000_000;
        }
        chan.add_age(250_000);
        assert_eq!(chan.koff_remaining_us, 0);
        let claim = chan.claims.get(handle).unwrap();
        assert_eq!(claim.kon_remaining_us, 750_000);
        assert_eq!(claim.vibrato_age_us, 250_000);
    }

    #[test]
    fn test_fixed_sustain_claims_do_not_decay() {
        let mut chan = ChipChannel::new();
        let handle = chan.find_or_create_claim(loc(3, 40)).unwrap();
        {
            let claim = chan.claims.get_mut(handle).unwrap();
            claim.fixed_sustain = true;
            claim.kon_remaining_us = 0;
        }
        chan.add_age(2_000_000);
        let claim = chan.claims.get(handle).unwrap();
        assert_eq!(claim.kon_remaining_us, 0);
        assert_eq!(claim.vibrato_age_us, 2_000_000);
    }

    #[test]
    fn test_channel_defaults() {
        let ch = MidiChannelState::new();
        assert_eq!(ch.volume, 100);
        assert_eq!(ch.expression, 127);
        assert_eq!(ch.panning, 64);
        assert_eq!(ch.brightness, 127);
        assert!(!ch.sustain);
        // Two semitones over the full wheel throw.
        let semitones = ch.bendsense * 8192.0;
        assert!((semitones - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_reset_controllers_keeps_mix_state() {
        let mut ch = MidiChannelState::new();
        ch.volume = 40;
        ch.panning = 10;
        ch.patch = 25;
        ch.bank_msb = 8;
        ch.expression = 50;
        ch.sustain = true;
        ch.pitch_bend = 4000;
        ch.brightness = 30;

        ch.reset_controllers();
        assert_eq!(ch.volume, 40);
        assert_eq!(ch.panning, 10);
        assert_eq!(ch.patch, 25);
        assert_eq!(ch.bank_msb, 8);
        assert_eq!(ch.expression, 127);
        assert!(!ch.sustain);
        assert_eq!(ch.pitch_bend, 0);
        assert_eq!(ch.brightness, 127);
    }

    #[test]
    fn test_bend_sensitivity_rpn_units() {
        let mut ch = MidiChannelState::new();
        ch.bendsense_msb = 12;
        ch.bendsense_lsb = 0;
        ch.update_bend_sensitivity();
        // A full octave up at maximum wheel deflection.
        let semitones = ch.bendsense * 8192.0;
        assert!((semitones - 12.0).abs() < 1e-9);
    }

    #[test]
    fn test_find_note() {
        let mut ch = MidiChannelState::new();
        assert!(ch.find_note(60).is_none());
        ch.notes
            .push_back(NoteState {
                note: 60,
                velocity: 100,
                vibrato: 0,
                tone: 60.0,
                program: 0,
                instrument: Instrument::default(),
                voices: [None, None],
            })
            .unwrap();
        let handle = ch.find_note(60).unwrap();
        assert_eq!(ch.notes.get(handle).unwrap().velocity, 100);
    }
}
