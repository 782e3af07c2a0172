//! Instruments, banks and the bank registry.
//!
//! An [`Instrument`] carries up to two FM voices ([`Timbre`]) worth of raw
//! register data plus the driver-side metadata the allocator needs: flags,
//! percussion key, detune of the second voice, velocity offset and the
//! audible-life hints used for channel scoring. Banks group 128 instruments
//! (melodic by program number, percussive by note number) and the
//! [`BankStore`] keys them by MIDI bank number and kind.
//!
//! Binary bank formats stay outside this crate; loaders fill these types
//! and hand the finished [`BankStore`] to the player.

use std::collections::BTreeMap;

use bitflags::bitflags;

/// Raw register data of a single FM operator.
///
/// Field names follow the register blocks the bytes land in (0x30 through
/// 0x90, stride 0x10).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Operator {
    /// Detune and frequency multiplication (0x30 block).
    pub dtfm: u8,
    /// Total level (0x40 block).
    pub level: u8,
    /// Rate scaling and attack rate (0x50 block).
    pub rsatk: u8,
    /// Amplitude modulation enable and first decay rate (0x60 block).
    pub amdecay1: u8,
    /// Second decay rate (0x70 block).
    pub decay2: u8,
    /// Sustain level and release rate (0x80 block).
    pub susrel: u8,
    /// SSG-EG mode (0x90 block).
    pub ssgeg: u8,
}

impl Operator {
    /// Register bytes in block order (0x30, 0x40, ... 0x90).
    #[inline]
    pub fn register_bytes(&self) -> [u8; 7] {
        [
            self.dtfm,
            self.level,
            self.rsatk,
            self.amdecay1,
            self.decay2,
            self.susrel,
            self.ssgeg,
        ]
    }
}

/// One complete FM voice: four operators plus the two channel registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Timbre {
    /// Operator data in register order (OP1, OP3, OP2, OP4).
    pub operators: [Operator; 4],
    /// Feedback and algorithm (0xB0 block).
    pub fbalg: u8,
    /// LFO sensitivity bits (low 6 bits of the 0xB4 block).
    pub lfosens: u8,
    /// Semitone offset added to the played note.
    pub note_offset: i16,
}

impl Timbre {
    /// Connection algorithm, the low three bits of `fbalg`.
    #[inline]
    pub fn algorithm(&self) -> u8 {
        self.fbalg & 0x07
    }
}

bitflags! {
    /// Instrument behavior flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub struct InstrumentFlags: u8 {
        /// Layer both voices on two physical channels per note.
        const DOUBLE_VOICE = 0x01;
        /// Placeholder that produces no sound; note-ons are dropped.
        const BLANK = 0x02;
    }
}

/// A playable instrument: one or two voices plus driver metadata.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Instrument {
    /// Voice data; the second entry is used only with
    /// [`InstrumentFlags::DOUBLE_VOICE`].
    pub voices: [Timbre; 2],
    /// Behavior flags.
    pub flags: InstrumentFlags,
    /// Fixed percussion tone; 0 keeps the played note.
    pub percussion_key: u8,
    /// Semitone detune applied to the second voice.
    pub second_voice_detune: f64,
    /// Added to incoming velocities before the volume model runs.
    pub velocity_offset: i8,
    /// Estimated audible time while the key is held, in ms. 0 means the
    /// sound never decays on its own.
    pub kon_ms: u16,
    /// Estimated release tail after key-off, in ms.
    pub koff_ms: u16,
}

impl Instrument {
    /// Default audible-life hints for instruments without measurements.
    pub const DEFAULT_KON_MS: u16 = 1000;
    /// Default release-tail hint for instruments without measurements.
    pub const DEFAULT_KOFF_MS: u16 = 500;

    /// A silent placeholder instrument.
    pub fn blank() -> Self {
        Self {
            voices: [Timbre::default(); 2],
            flags: InstrumentFlags::BLANK,
            percussion_key: 0,
            second_voice_detune: 0.0,
            velocity_offset: 0,
            kon_ms: 0,
            koff_ms: 0,
        }
    }

    /// A single-voice instrument with default metadata.
    pub fn single(voice: Timbre) -> Self {
        Self {
            voices: [voice, voice],
            flags: InstrumentFlags::empty(),
            percussion_key: 0,
            second_voice_detune: 0.0,
            velocity_offset: 0,
            kon_ms: Self::DEFAULT_KON_MS,
            koff_ms: Self::DEFAULT_KOFF_MS,
        }
    }

    /// A layered two-voice instrument with default metadata.
    pub fn double(first: Timbre, second: Timbre, detune: f64) -> Self {
        Self {
            voices: [first, second],
            flags: InstrumentFlags::DOUBLE_VOICE,
            percussion_key: 0,
            second_voice_detune: detune,
            velocity_offset: 0,
            kon_ms: Self::DEFAULT_KON_MS,
            koff_ms: Self::DEFAULT_KOFF_MS,
        }
    }

    /// `true` when this instrument produces no sound and note-ons for it
    /// are silently ignored. Besides the explicit flag, an instrument whose
    /// audible-life hints are both zero counts as silent, matching the
    /// convention of WOPN-style bank data.
    #[inline]
    pub fn is_silent(&self) -> bool {
        self.flags.contains(InstrumentFlags::BLANK) || (self.kon_ms == 0 && self.koff_ms == 0)
    }

    /// Number of physical voices a note of this instrument claims.
    #[inline]
    pub fn voice_count(&self) -> usize {
        if self.flags.contains(InstrumentFlags::DOUBLE_VOICE) {
            2
        } else {
            1
        }
    }
}

impl Default for Instrument {
    fn default() -> Self {
        Self::blank()
    }
}

/// Identifier of a bank inside a [`BankStore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BankId {
    /// Percussion bank (keyed by note) instead of melodic (keyed by program).
    pub percussive: bool,
    /// Bank select MSB, CC0 (7 bits).
    pub msb: u8,
    /// Bank select LSB, CC32 (7 bits).
    pub lsb: u8,
}

impl BankId {
    /// Key bit marking percussion banks in the registry.
    const PERCUSSION_TAG: u16 = 1 << 15;

    /// Melodic bank identifier.
    pub fn melodic(msb: u8, lsb: u8) -> Self {
        Self {
            percussive: false,
            msb,
            lsb,
        }
    }

    /// Percussion bank identifier.
    pub fn percussion(msb: u8, lsb: u8) -> Self {
        Self {
            percussive: true,
            msb,
            lsb,
        }
    }

    fn key(self) -> u16 {
        let number = u16::from(self.msb & 0x7F) * 256 + u16::from(self.lsb & 0x7F);
        if self.percussive {
            number | Self::PERCUSSION_TAG
        } else {
            number
        }
    }
}

/// 128 instrument slots: programs for melodic banks, note numbers for
/// percussion banks.
#[derive(Clone)]
pub struct Bank {
    instruments: [Instrument; 128],
}

impl Bank {
    /// A bank of blank instruments.
    pub fn new() -> Self {
        Self {
            instruments: [Instrument::blank(); 128],
        }
    }

    /// The instrument at `index` (program or note number, 0..=127).
    #[inline]
    pub fn instrument(&self, index: u8) -> &Instrument {
        &self.instruments[usize::from(index & 0x7F)]
    }

    /// Replaces the instrument at `index`.
    ///
    /// # Returns
    /// An error when `index` exceeds the 128 slots; the bank is unchanged.
    pub fn set_instrument(&mut self, index: u8, instrument: Instrument) -> crate::Result<()> {
        if index > 127 {
            return Err(crate::OpnMidiError::ProgramOutOfRange {
                requested: index,
            });
        }
        self.instruments[usize::from(index)] = instrument;
        Ok(())
    }
}

impl Default for Bank {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Bank {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let filled = self.instruments.iter().filter(|i| !i.is_silent()).count();
        f.debug_struct("Bank").field("filled", &filled).finish()
    }
}

/// Registry of banks keyed by bank number and kind.
///
/// Iteration order is the key order of the underlying map, so lookups and
/// fallbacks behave identically from run to run.
#[derive(Debug, Clone, Default)]
pub struct BankStore {
    banks: BTreeMap<u16, Bank>,
}

impl BankStore {
    /// An empty registry. Players treat note-ons against an empty registry
    /// as silent no-ops.
    pub fn new() -> Self {
        Self::default()
    }

    /// `true` when no banks are installed.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.banks.is_empty()
    }

    /// Number of installed banks.
    #[inline]
    pub fn len(&self) -> usize {
        self.banks.len()
    }

    /// The bank for `id`, creating a blank one when missing.
    pub fn bank_mut(&mut self, id: BankId) -> &mut Bank {
        self.banks.entry(id.key()).or_insert_with(Bank::new)
    }

    /// The bank for `id`, if installed.
    pub fn bank(&self, id: BankId) -> Option<&Bank> {
        self.banks.get(&id.key())
    }

    /// Removes the bank for `id`.
    pub fn remove(&mut self, id: BankId) -> Option<Bank> {
        self.banks.remove(&id.key())
    }

    /// Looks up the instrument for a note, walking the standard fallback
    /// chain: the exact bank, then the same MSB with LSB 0, then bank 0 of
    /// the same kind.
    ///
    /// # Returns
    /// `None` when no candidate bank is installed.
    pub fn lookup(&self, id: BankId, index: u8) -> Option<&Instrument> {
        if let Some(bank) = self.bank(id) {
            return Some(bank.instrument(index));
        }
        if id.lsb != 0 {
            if let Some(bank) = self.bank(BankId { lsb: 0, ..id }) {
                return Some(bank.instrument(index));
            }
        }
        if id.msb != 0 || id.lsb != 0 {
            if let Some(bank) = self.bank(BankId {
                msb: 0,
                lsb: 0,
                ..id
            }) {
                return Some(bank.instrument(index));
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn marked(level: u8) -> Instrument {
        let mut t = Timbre::default();
        t.operators[0].level = level;
        Instrument::single(t)
    }

    #[test]
    fn test_operator_register_bytes_order() {
        let op = Operator {
            dtfm: 1,
            level: 2,
            rsatk: 3,
            amdecay1: 4,
            decay2: 5,
            susrel: 6,
            ssgeg: 7,
        };
        assert_eq!(op.register_bytes(), [1, 2, 3, 4, 5, 6, 7]);
    }

    #[test]
    fn test_blank_rule() {
        assert!(Instrument::blank().is_silent());
        let mut ins = marked(8);
        assert!(!ins.is_silent());
        ins.kon_ms = 0;
        ins.koff_ms = 0;
        assert!(ins.is_silent());
    }

    #[test]
    fn test_voice_count_follows_flag() {
        assert_eq!(marked(1).voice_count(), 1);
        let double = Instrument::double(Timbre::default(), Timbre::default(), 0.14);
        assert_eq!(double.voice_count(), 2);
    }

    #[test]
    fn test_bank_set_and_get() {
        let mut bank = Bank::new();
        bank.set_instrument(5, marked(33)).unwrap();
        assert_eq!(bank.instrument(5).voices[0].operators[0].level, 33);
        assert!(bank.instrument(6).is_silent());
        assert!(bank.set_instrument(200, marked(1)).is_err());
    }

    #[test]
    fn test_store_melodic_and_percussion_do_not_collide() {
        let mut store = BankStore::new();
        store
            .bank_mut(BankId::melodic(0, 0))
            .set_instrument(10, marked(1))
            .unwrap();
        store
            .bank_mut(BankId::percussion(0, 0))
            .set_instrument(10, marked(2))
            .unwrap();

        let mel = store.lookup(BankId::melodic(0, 0), 10).unwrap();
        let perc = store.lookup(BankId::percussion(0, 0), 10).unwrap();
        assert_eq!(mel.voices[0].operators[0].level, 1);
        assert_eq!(perc.voices[0].operators[0].level, 2);
    }

    #[test]
    fn test_lookup_fallback_chain() {
        let mut store = BankStore::new();
        store
            .bank_mut(BankId::melodic(8, 0))
            .set_instrument(1, marked(80))
            .unwrap();
        store
            .bank_mut(BankId::melodic(0, 0))
            .set_instrument(1, marked(99))
            .unwrap();

        // Exact LSB miss falls back to LSB 0 of the same MSB.
        let ins = store.lookup(BankId::melodic(8, 3), 1).unwrap();
        assert_eq!(ins.voices[0].operators[0].level, 80);

        // Unknown MSB falls back to bank 0.
        let ins = store.lookup(BankId::melodic(64, 9), 1).unwrap();
        assert_eq!(ins.voices[0].operators[0].level, 99);
    }

    #[test]
    fn test_lookup_empty_store() {
        let store = BankStore::new();
        assert!(store.lookup(BankId::melodic(0, 0), 0).is_none());
    }
}
