//! The MIDI driver: event intake, voice allocation and note upkeep.
//!
//! [`OpnMidiPlayer`] accepts real-time MIDI events on sixteen channels and
//! drives an array of OPN chips through [`Synth`]. Every note-on picks the
//! physical channel with the best score for the incoming timbre, evicting
//! or sharing existing claims according to the allocation policy; pedals,
//! pitch updates, vibrato and the channel-sharing arpeggio all operate on
//! the claim lists afterwards.
//!
//! Time advances through [`OpnMidiPlayer::tick`] (or implicitly through
//! [`OpnMidiPlayer::generate`]), which ages the claims, runs the vibrato
//! oscillators and steps the arpeggio.

use bitflags::bitflags;

use opnmidi_models::{effective_brightness, ChipFamily, VolumeModel};

use crate::arena::Handle;
use crate::backend::ChipFactory;
use crate::bank::{BankId, BankStore, Timbre};
use crate::channels::{
    ChipChannel, MidiChannelState, NoteLocation, NoteState, NoteVoice, SustainFlags,
};
use crate::registers::{panning_to_bits, Synth, CHANNELS_PER_CHIP};
use crate::sysex::{self, SysExAction};
use crate::{OpnMidiError, Result};

/// Channel-allocation policy for incoming notes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ChannelAllocMode {
    /// Let the driver pick; currently resolves to [`Self::OffDelay`].
    #[default]
    Auto,
    /// Prefer channels whose release tail has run out, weighted by how
    /// much tail is left.
    OffDelay,
    /// Prefer releasing channels that last played the same instrument.
    SameInstrument,
    /// Treat any releasing channel as equally good.
    AnyReleased,
}

impl ChannelAllocMode {
    fn resolved(self) -> Self {
        match self {
            Self::Auto => Self::OffDelay,
            mode => mode,
        }
    }
}

bitflags! {
    /// Aspects of a sounding note refreshed by a single update pass.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct NoteUpdateFlags: u8 {
        /// Reprogram the instrument and (re)create the channel claim.
        const PATCH = 0x01;
        /// Rewrite the pan bits.
        const PAN = 0x02;
        /// Recompute operator levels through the volume model.
        const VOLUME = 0x04;
        /// Reprogram frequency and key the note on.
        const PITCH = 0x08;
        /// Release the note: drop the claim (pedals permitting) and key
        /// the channel off when it empties.
        const OFF = 0x20;
        /// With `OFF`: ignore pedals, zero the release tail and pull the
        /// levels silent immediately.
        const MUTE = 0x40;
        /// Everything a freshly placed note needs besides the patch.
        const SOUNDING = Self::PAN.bits() | Self::VOLUME.bits() | Self::PITCH.bits();
    }
}

/// Arpeggio step rate upper limit, in steps per second.
const ARPEGGIO_RATE_HZ: f64 = 40.0;

/// Claims younger than this keep ringing when a same-instrument note
/// shares their channel, microseconds.
const SHARE_YOUNG_AGE_US: i64 = 70_000;
/// Claims with more audible time left than this keep ringing when a
/// same-instrument note shares their channel, microseconds.
const SHARE_LONG_LIFE_US: i64 = 20_000_000;

fn fail<T>(err: OpnMidiError) -> Result<T> {
    crate::set_last_error(err.to_string());
    Err(err)
}

/// Real-time MIDI driver over an array of OPN chips.
pub struct OpnMidiPlayer {
    synth: Synth,
    factory: ChipFactory,
    sample_rate: u32,
    banks: BankStore,
    midi_channels: Vec<MidiChannelState>,
    chip_channels: Vec<ChipChannel>,
    allocation_mode: ChannelAllocMode,
    auto_arpeggio: bool,
    full_range_brightness: bool,
    device_id: u8,
    arpeggio_counter: u32,
    arpeggio_accum: f64,
}

impl OpnMidiPlayer {
    /// Chips created by [`Self::new`] before any reconfiguration.
    pub const DEFAULT_NUM_CHIPS: usize = 2;
    /// Largest accepted chip count.
    pub const MAX_NUM_CHIPS: usize = 100;

    /// A player over [`Self::DEFAULT_NUM_CHIPS`] OPN2 chips built through
    /// `factory`, with an empty bank registry. Note-ons stay silent until
    /// banks are installed.
    pub fn new(factory: ChipFactory, sample_rate: u32) -> Self {
        let mut synth = Synth::new(ChipFamily::default());
        synth.rebuild(&factory, Self::DEFAULT_NUM_CHIPS, sample_rate);
        let num_channels = synth.num_channels();
        Self {
            synth,
            factory,
            sample_rate,
            banks: BankStore::new(),
            midi_channels: (0..16).map(|_| MidiChannelState::new()).collect(),
            chip_channels: (0..num_channels).map(|_| ChipChannel::new()).collect(),
            allocation_mode: ChannelAllocMode::default(),
            auto_arpeggio: false,
            full_range_brightness: false,
            device_id: 0,
            arpeggio_counter: 0,
            arpeggio_accum: 0.0,
        }
    }

    /// Installs the bank registry, silencing everything first.
    pub fn install_banks(&mut self, banks: BankStore) {
        self.panic();
        self.banks = banks;
    }

    /// The installed bank registry.
    pub fn banks(&self) -> &BankStore {
        &self.banks
    }

    /// Number of chips in the array.
    #[inline]
    pub fn num_chips(&self) -> usize {
        self.synth.num_channels() / CHANNELS_PER_CHIP
    }

    /// Number of physical FM channels.
    #[inline]
    pub fn num_channels(&self) -> usize {
        self.synth.num_channels()
    }

    /// Output sample rate.
    #[inline]
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Chip family of the array.
    #[inline]
    pub fn chip_family(&self) -> ChipFamily {
        self.synth.family()
    }

    /// Current allocation policy.
    #[inline]
    pub fn allocation_mode(&self) -> ChannelAllocMode {
        self.allocation_mode
    }

    /// Current loudness curve.
    #[inline]
    pub fn volume_model(&self) -> VolumeModel {
        self.synth.volume_model()
    }

    /// `true` when overloaded channels arpeggiate instead of evicting.
    #[inline]
    pub fn auto_arpeggio(&self) -> bool {
        self.auto_arpeggio
    }

    /// Master volume, 0..=127.
    #[inline]
    pub fn master_volume(&self) -> u8 {
        self.synth.master_volume()
    }

    /// Resizes the chip array, silencing everything first. All channel
    /// occupancy is forgotten.
    ///
    /// # Returns
    /// An error when `count` is outside `1..=100`; the array is unchanged.
    pub fn set_num_chips(&mut self, count: usize) -> Result<()> {
        if count == 0 || count > Self::MAX_NUM_CHIPS {
            return fail(OpnMidiError::ChipCountOutOfRange { requested: count });
        }
        self.panic();
        self.synth.rebuild(&self.factory, count, self.sample_rate);
        self.chip_channels = (0..self.synth.num_channels())
            .map(|_| ChipChannel::new())
            .collect();
        Ok(())
    }

    /// Switches the chip family and rebuilds the array, silencing
    /// everything first.
    pub fn set_chip_family(&mut self, family: ChipFamily) {
        self.panic();
        let count = self.num_chips();
        self.synth.set_family(family);
        self.synth.rebuild(&self.factory, count, self.sample_rate);
        self.chip_channels = (0..self.synth.num_channels())
            .map(|_| ChipChannel::new())
            .collect();
    }

    /// Selects the loudness curve for subsequent volume updates.
    pub fn set_volume_model(&mut self, model: VolumeModel) {
        self.synth.set_volume_model(model);
    }

    /// Selects the channel-allocation policy.
    pub fn set_allocation_mode(&mut self, mode: ChannelAllocMode) {
        self.allocation_mode = mode;
    }

    /// Applies the loudness curve to modulator operators as well.
    pub fn set_scale_modulators(&mut self, scale: bool) {
        self.synth.set_scale_modulators(scale);
    }

    /// Uses the full CC74 range instead of the coarse two-step mapping.
    pub fn set_full_range_brightness(&mut self, full: bool) {
        self.full_range_brightness = full;
    }

    /// Arpeggiates overloaded channels instead of evicting their notes.
    pub fn set_auto_arpeggio(&mut self, enabled: bool) {
        self.auto_arpeggio = enabled;
    }

    /// Switches the global LFO on or off at its current rate.
    pub fn set_lfo_enabled(&mut self, enabled: bool) {
        let frequency = self.synth.lfo_frequency();
        self.synth.set_lfo(enabled, frequency);
    }

    /// Sets the global LFO rate.
    ///
    /// # Returns
    /// An error when `frequency` exceeds 7; the LFO is unchanged.
    pub fn set_lfo_frequency(&mut self, frequency: u8) -> Result<()> {
        if frequency > 7 {
            return fail(OpnMidiError::LfoFrequencyOutOfRange {
                requested: frequency,
            });
        }
        let enabled = self.synth.lfo_enabled();
        self.synth.set_lfo(enabled, frequency);
        Ok(())
    }

    /// Sets the master volume and refreshes every sounding note.
    ///
    /// # Returns
    /// An error when `volume` exceeds 127; the volume is unchanged.
    pub fn set_master_volume(&mut self, volume: u8) -> Result<()> {
        if volume > 127 {
            return fail(OpnMidiError::MasterVolumeOutOfRange { requested: volume });
        }
        self.synth.set_master_volume(volume);
        for ch in 0..16u16 {
            self.note_update_all(ch, NoteUpdateFlags::VOLUME);
        }
        Ok(())
    }

    /// Sets the SysEx device identifier this player answers to.
    ///
    /// # Returns
    /// An error when `id` exceeds 15; the identifier is unchanged.
    pub fn set_device_identifier(&mut self, id: u8) -> Result<()> {
        if id > 15 {
            return fail(OpnMidiError::DeviceIdOutOfRange { requested: id });
        }
        self.device_id = id;
        Ok(())
    }

    /// Starts a note.
    ///
    /// A zero velocity is a note-off. Re-striking a held key kills the
    /// previous instance first. The note is dropped silently when no
    /// banks are installed, the instrument is blank, or no physical
    /// channel could be claimed.
    ///
    /// # Returns
    /// `true` when the note begins sounding.
    pub fn note_on(&mut self, channel: u16, note: u8, velocity: u8) -> bool {
        let channel = channel % 16;
        let mc = usize::from(channel);
        if velocity == 0 {
            self.note_off(channel, note);
            return false;
        }
        let note = note.min(127);
        let velocity = velocity.min(127);

        // Kill a previous instance of the same key outright.
        if let Some(existing) = self.midi_channels[mc].find_note(note) {
            self.note_update(
                channel,
                existing,
                NoteUpdateFlags::OFF | NoteUpdateFlags::MUTE,
                None,
            );
        }

        if self.banks.is_empty() {
            return false;
        }

        let (bank_msb, bank_lsb, patch, forced_percussion) = {
            let ch = &self.midi_channels[mc];
            (ch.bank_msb, ch.bank_lsb, ch.patch, ch.percussion)
        };
        let is_percussion = mc == 9 || forced_percussion;
        let (bank_id, index) = if is_percussion {
            (BankId::percussion(bank_msb, bank_lsb), note)
        } else {
            (BankId::melodic(bank_msb, bank_lsb), patch)
        };
        let Some(instrument) = self.banks.lookup(bank_id, index).copied() else {
            return false;
        };
        if instrument.is_silent() {
            return false;
        }

        let velocity =
            (i16::from(velocity) + i16::from(instrument.velocity_offset)).clamp(1, 127) as u8;
        let mut tone = f64::from(note);
        if is_percussion && instrument.percussion_key != 0 {
            tone = f64::from(instrument.percussion_key & 0x7F);
        }

        // One channel per voice, each picked by score; the second voice
        // may go unplaced on a starved array.
        let voices_wanted = instrument.voice_count();
        let mut assigned: [Option<u16>; 2] = [None, None];
        for vi in 0..voices_wanted {
            let timbre = instrument.voices[vi];
            let mut best: Option<(i64, u16)> = None;
            for c in 0..self.synth.num_channels() {
                if vi == 1 && assigned[0] == Some(c as u16) {
                    continue;
                }
                let score = self.channel_goodness(c, &timbre);
                if best.map_or(true, |(bs, _)| score > bs) {
                    best = Some((score, c as u16));
                }
            }
            if let Some((_, c)) = best {
                self.prepare_chip_channel(c, &timbre);
                assigned[vi] = Some(c);
            }
        }
        if assigned.iter().all(Option::is_none) {
            return false;
        }

        let mut voices: [Option<NoteVoice>; 2] = [None, None];
        for vi in 0..voices_wanted {
            if let Some(chan) = assigned[vi] {
                voices[vi] = Some(NoteVoice {
                    chan,
                    timbre: instrument.voices[vi],
                    phase: if vi == 1 {
                        instrument.second_voice_detune
                    } else {
                        0.0
                    },
                });
            }
        }

        let state = NoteState {
            note,
            velocity,
            vibrato: 0,
            tone,
            program: index,
            instrument,
            voices,
        };
        let Some(handle) = self.midi_channels[mc].notes.push_back(state) else {
            return false;
        };
        self.note_update(
            channel,
            handle,
            NoteUpdateFlags::PATCH | NoteUpdateFlags::SOUNDING,
            None,
        );
        true
    }

    /// Releases a note. With the damper pedal down the claim stays and is
    /// released when the pedal lifts.
    pub fn note_off(&mut self, channel: u16, note: u8) {
        let channel = channel % 16;
        let mc = usize::from(channel);
        if let Some(handle) = self.midi_channels[mc].find_note(note.min(127)) {
            self.note_update(channel, handle, NoteUpdateFlags::OFF, None);
        }
    }

    /// Sets the per-note vibrato depth (polyphonic aftertouch).
    pub fn note_aftertouch(&mut self, channel: u16, note: u8, value: u8) {
        let mc = usize::from(channel % 16);
        if let Some(handle) = self.midi_channels[mc].find_note(note.min(127)) {
            if let Some(state) = self.midi_channels[mc].notes.get_mut(handle) {
                state.vibrato = value & 0x7F;
            }
        }
    }

    /// Sets the channel vibrato depth (channel aftertouch).
    pub fn channel_aftertouch(&mut self, channel: u16, value: u8) {
        self.midi_channels[usize::from(channel % 16)].aftertouch = value & 0x7F;
    }

    /// Selects the program for subsequent notes on the channel.
    pub fn patch_change(&mut self, channel: u16, patch: u8) {
        self.midi_channels[usize::from(channel % 16)].patch = patch & 0x7F;
    }

    /// Selects the bank MSB (CC0) for subsequent notes on the channel.
    pub fn bank_change_msb(&mut self, channel: u16, msb: u8) {
        self.midi_channels[usize::from(channel % 16)].bank_msb = msb & 0x7F;
    }

    /// Selects the bank LSB (CC32) for subsequent notes on the channel.
    pub fn bank_change_lsb(&mut self, channel: u16, lsb: u8) {
        self.midi_channels[usize::from(channel % 16)].bank_lsb = lsb & 0x7F;
    }

    /// Selects both bank bytes at once; `bank` is `MSB * 256 + LSB`.
    pub fn bank_change(&mut self, channel: u16, bank: u16) {
        let mc = usize::from(channel % 16);
        self.midi_channels[mc].bank_lsb = (bank as u8) & 0x7F;
        self.midi_channels[mc].bank_msb = ((bank >> 8) as u8) & 0x7F;
    }

    /// Applies the pitch wheel (14-bit, 8192 is center) and retunes the
    /// channel's sounding notes.
    pub fn pitch_bend(&mut self, channel: u16, value: u16) {
        let channel = channel % 16;
        self.midi_channels[usize::from(channel)].pitch_bend = i32::from(value.min(16383)) - 8192;
        self.note_update_all(channel, NoteUpdateFlags::PITCH);
    }

    /// Applies the pitch wheel from its raw MSB/LSB data bytes.
    pub fn pitch_bend_parts(&mut self, channel: u16, msb: u8, lsb: u8) {
        self.pitch_bend(
            channel,
            (u16::from(msb & 0x7F) << 7) | u16::from(lsb & 0x7F),
        );
    }

    /// Handles a control change.
    pub fn controller_change(&mut self, channel: u16, controller: u8, value: u8) {
        let channel = channel % 16;
        let mc = usize::from(channel);
        let value = value & 0x7F;
        match controller {
            0 => self.midi_channels[mc].bank_msb = value,
            32 => self.midi_channels[mc].bank_lsb = value,
            1 => self.midi_channels[mc].vibrato = value,
            6 => self.set_rpn(channel, value, true),
            38 => self.set_rpn(channel, value, false),
            7 => {
                self.midi_channels[mc].volume = value;
                self.note_update_all(channel, NoteUpdateFlags::VOLUME);
            }
            10 => {
                self.midi_channels[mc].panning = value;
                self.note_update_all(channel, NoteUpdateFlags::PAN);
            }
            11 => {
                self.midi_channels[mc].expression = value;
                self.note_update_all(channel, NoteUpdateFlags::VOLUME);
            }
            64 => {
                let pressed = value >= 64;
                self.midi_channels[mc].sustain = pressed;
                if !pressed {
                    self.kill_sustaining(Some(channel), None, SustainFlags::PEDAL);
                }
            }
            66 => {
                if value >= 64 {
                    self.mark_sostenuto(channel);
                } else {
                    self.kill_sustaining(Some(channel), None, SustainFlags::SOSTENUTO);
                }
            }
            74 => {
                self.midi_channels[mc].brightness = value;
                self.note_update_all(channel, NoteUpdateFlags::VOLUME);
            }
            98 => {
                self.midi_channels[mc].last_rpn_lsb = value;
                self.midi_channels[mc].nrpn = true;
            }
            99 => {
                self.midi_channels[mc].last_rpn_msb = value;
                self.midi_channels[mc].nrpn = true;
            }
            100 => {
                self.midi_channels[mc].last_rpn_lsb = value;
                self.midi_channels[mc].nrpn = false;
            }
            101 => {
                self.midi_channels[mc].last_rpn_msb = value;
                self.midi_channels[mc].nrpn = false;
            }
            120 => {
                // All sound off: claims die regardless of pedals.
                self.note_update_all(channel, NoteUpdateFlags::OFF | NoteUpdateFlags::MUTE);
                self.kill_sustaining(Some(channel), None, SustainFlags::all());
            }
            121 => {
                self.midi_channels[mc].reset_controllers();
                self.note_update_all(channel, NoteUpdateFlags::VOLUME | NoteUpdateFlags::PITCH);
                self.kill_sustaining(Some(channel), None, SustainFlags::all());
            }
            123 | 126 | 127 => {
                self.note_update_all(channel, NoteUpdateFlags::OFF);
            }
            _ => {}
        }
    }

    /// RPN data entry; only the pitch-bend range (RPN 0) is interpreted.
    fn set_rpn(&mut self, channel: u16, value: u8, msb: bool) {
        let ch = &mut self.midi_channels[usize::from(channel)];
        if ch.nrpn || ch.last_rpn_msb != 0 || ch.last_rpn_lsb != 0 {
            return;
        }
        if msb {
            ch.bendsense_msb = value;
        } else {
            ch.bendsense_lsb = value;
        }
        ch.update_bend_sensitivity();
    }

    /// Handles a complete `F0 .. F7` system-exclusive message.
    ///
    /// # Returns
    /// `true` when the message was recognized and applied.
    pub fn sysex(&mut self, message: &[u8]) -> bool {
        match sysex::parse(self.device_id, message) {
            Some(SysExAction::ResetState) => {
                self.reset_state();
                true
            }
            Some(SysExAction::MasterVolume(volume)) => {
                self.synth.set_master_volume(volume);
                for ch in 0..16u16 {
                    self.note_update_all(ch, NoteUpdateFlags::VOLUME);
                }
                true
            }
            Some(SysExAction::PartPercussion {
                channel,
                percussion,
            }) => {
                self.midi_channels[usize::from(channel)].percussion = percussion;
                true
            }
            None => false,
        }
    }

    /// Releases every note, drops every claim (pedals included) and
    /// silences the hardware.
    pub fn panic(&mut self) {
        for ch in 0..16u16 {
            for note in 0..128u8 {
                self.note_off(ch, note);
            }
        }
        self.kill_sustaining(None, None, SustainFlags::all());
        self.synth.silence_all();
        for chan in &mut self.chip_channels {
            chan.koff_remaining_us = 0;
        }
    }

    /// Full reset: panic, then every channel back to its power-on
    /// controller state, master volume to 127, arpeggio rewound.
    pub fn reset_state(&mut self) {
        self.panic();
        for state in &mut self.midi_channels {
            state.reset();
        }
        self.synth.set_master_volume(127);
        self.arpeggio_counter = 0;
        self.arpeggio_accum = 0.0;
    }

    /// Advances driver time by `seconds`: ages every claim, runs the
    /// vibrato oscillators and steps the arpeggio.
    pub fn tick(&mut self, seconds: f64) {
        if seconds <= 0.0 {
            return;
        }
        let us = (seconds * 1e6) as i64;
        for chan in &mut self.chip_channels {
            chan.add_age(us);
        }
        self.update_vibrato(seconds);
        self.update_arpeggio(seconds);
    }

    /// Renders interleaved stereo frames and advances driver time by the
    /// rendered duration. Use [`Self::tick`] directly when driving the
    /// player without audio.
    pub fn generate(&mut self, output: &mut [i16]) {
        self.synth.generate(output);
        if self.sample_rate > 0 {
            let frames = output.len() / 2;
            self.tick(frames as f64 / f64::from(self.sample_rate));
        }
    }

    /// Writes one cell per physical channel: `-` free, `+` playing, `@`
    /// held by a pedal; `attr` receives the owning MIDI channel (0 when
    /// free). The last claim decides, since it is the one audible.
    ///
    /// # Returns
    /// The number of cells written, bounded by both buffers.
    pub fn describe_channels(&self, text: &mut [u8], attr: &mut [u8]) -> usize {
        let cells = self.chip_channels.len().min(text.len()).min(attr.len());
        for c in 0..cells {
            let chan = &self.chip_channels[c];
            match chan.claims.last().and_then(|h| chan.claims.get(h)) {
                None => {
                    text[c] = b'-';
                    attr[c] = 0;
                }
                Some(claim) => {
                    text[c] = if claim.sustained.is_empty() { b'+' } else { b'@' };
                    attr[c] = (claim.loc.midi_channel & 0x0F) as u8;
                }
            }
        }
        cells
    }

    /// Scores a physical channel for an incoming voice. Higher is better;
    /// a free and silent channel scores zero, occupied channels go deeply
    /// negative, and same-instrument matches claw part of it back.
    fn channel_goodness(&self, c: usize, timbre: &Timbre) -> i64 {
        let chan = &self.chip_channels[c];
        let koff_ms = chan.koff_remaining_us / 1000;
        let mut s = -koff_ms;
        let mode = self.allocation_mode.resolved();

        // A channel still ringing out a released note.
        if s < 0 && chan.claims.is_empty() {
            let same = chan.recent_timbre.as_ref() == Some(timbre);
            s -= 40_000;
            match mode {
                ChannelAllocMode::SameInstrument if same => s = 0,
                ChannelAllocMode::AnyReleased => s = 0,
                ChannelAllocMode::OffDelay if same => s = -koff_ms,
                _ => {}
            }
        }

        for (_, claim) in chan.claims.iter() {
            let kon_ms = claim.kon_remaining_us / 1000;
            s -= if claim.sustained.is_empty() {
                4_000_000 + kon_ms
            } else {
                500_000 + kon_ms / 2
            };
            if claim.timbre == *timbre {
                s += 300;
            }
        }
        s
    }

    /// Clears a channel for an incoming voice. Without sharing, every
    /// claim dies. With sharing (auto-arpeggio or the same-instrument
    /// policy), same-instrument claims that are young or long-lived keep
    /// ringing and the arpeggio will alternate them.
    fn prepare_chip_channel(&mut self, chan: u16, timbre: &Timbre) {
        let ci = usize::from(chan);
        if self.chip_channels[ci].claims.is_empty() {
            return;
        }

        let mode = self.allocation_mode.resolved();
        let share = self.auto_arpeggio || mode == ChannelAllocMode::SameInstrument;

        if !share {
            let mut cursor = self.chip_channels[ci].claims.first();
            while let Some(handle) = cursor {
                cursor = self.chip_channels[ci].claims.next(handle);
                let Some(claim) = self.chip_channels[ci].claims.get(handle) else {
                    continue;
                };
                if claim.sustained.is_empty() {
                    let loc = claim.loc;
                    self.kill_claim(chan, loc);
                }
            }
            self.kill_sustaining(None, Some(chan), SustainFlags::all());
            self.synth.note_off(ci);
            return;
        }

        let mut cursor = self.chip_channels[ci].claims.first();
        while let Some(handle) = cursor {
            cursor = self.chip_channels[ci].claims.next(handle);
            let Some(claim) = self.chip_channels[ci].claims.get(handle) else {
                continue;
            };
            if !claim.sustained.is_empty() {
                continue;
            }
            let keep = claim.timbre == *timbre
                && (mode == ChannelAllocMode::SameInstrument
                    || claim.vibrato_age_us < SHARE_YOUNG_AGE_US
                    || claim.kon_remaining_us > SHARE_LONG_LIFE_US);
            if !keep {
                let loc = claim.loc;
                self.kill_claim(chan, loc);
            }
        }
        self.kill_sustaining(None, Some(chan), SustainFlags::all());
        if self.chip_channels[ci].claims.is_empty() {
            self.synth.note_off(ci);
        }
    }

    /// Kills one claim on one channel, going through the note so its
    /// voice entry disappears with it.
    fn kill_claim(&mut self, chan: u16, loc: NoteLocation) {
        let mc = usize::from(loc.midi_channel);
        match self.midi_channels[mc].find_note(loc.note) {
            Some(handle) => self.note_update(
                loc.midi_channel,
                handle,
                NoteUpdateFlags::OFF | NoteUpdateFlags::MUTE,
                Some(chan),
            ),
            None => {
                // Claim without a live note; drop it directly.
                if let Some(handle) = self.chip_channels[usize::from(chan)].find_claim(loc) {
                    self.chip_channels[usize::from(chan)].claims.remove(handle);
                }
            }
        }
    }

    /// Strips `which` from matching sustained claims, erasing claims left
    /// with no hold and keying off channels that empty out.
    fn kill_sustaining(
        &mut self,
        midi_channel: Option<u16>,
        chan: Option<u16>,
        which: SustainFlags,
    ) {
        let range = match chan {
            Some(c) => usize::from(c)..usize::from(c) + 1,
            None => 0..self.chip_channels.len(),
        };
        for c in range {
            if self.chip_channels[c].claims.is_empty() {
                continue;
            }
            let mut cursor = self.chip_channels[c].claims.first();
            while let Some(handle) = cursor {
                cursor = self.chip_channels[c].claims.next(handle);
                let mut erase = false;
                if let Some(claim) = self.chip_channels[c].claims.get_mut(handle) {
                    let matches = midi_channel.map_or(true, |m| claim.loc.midi_channel == m)
                        && claim.sustained.intersects(which);
                    if matches {
                        claim.sustained.remove(which);
                        erase = claim.sustained.is_empty();
                    }
                }
                if erase {
                    self.chip_channels[c].claims.remove(handle);
                }
            }
            if self.chip_channels[c].claims.is_empty() {
                self.synth.note_off(c);
                self.chip_channels[c].koff_remaining_us = 0;
            }
        }
    }

    /// Flags every unheld claim of the channel as sostenuto-held.
    fn mark_sostenuto(&mut self, midi_channel: u16) {
        for chan in &mut self.chip_channels {
            let mut cursor = chan.claims.first();
            while let Some(handle) = cursor {
                cursor = chan.claims.next(handle);
                if let Some(claim) = chan.claims.get_mut(handle) {
                    if claim.loc.midi_channel == midi_channel && claim.sustained.is_empty() {
                        claim.sustained |= SustainFlags::SOSTENUTO;
                    }
                }
            }
        }
    }

    /// Applies `props` to every voice of one note (or the single physical
    /// channel `select`), then drops the note once no voices remain.
    fn note_update(
        &mut self,
        midi_channel: u16,
        note: Handle,
        props: NoteUpdateFlags,
        select: Option<u16>,
    ) {
        let mc = usize::from(midi_channel);
        let Some(state) = self.midi_channels[mc].notes.get(note) else {
            return;
        };
        let key = state.note;
        let velocity = state.velocity;
        let tone = state.tone;
        let note_vibrato = state.vibrato;
        let instrument = state.instrument;
        let voices = state.voices;
        let loc = NoteLocation {
            midi_channel,
            note: key,
        };

        // Program all patches before touching key state, so layered
        // voices start coherently.
        if props.contains(NoteUpdateFlags::PATCH) {
            for voice in voices.iter().flatten() {
                if select.is_some_and(|s| s != voice.chan) {
                    continue;
                }
                let c = usize::from(voice.chan);
                self.synth.set_patch(c, &voice.timbre);
                let chip = &mut self.chip_channels[c];
                if let Some(handle) = chip.find_or_create_claim(loc) {
                    if let Some(claim) = chip.claims.get_mut(handle) {
                        claim.sustained = SustainFlags::empty();
                        claim.vibrato_age_us = 0;
                        claim.fixed_sustain = instrument.kon_ms == 0;
                        claim.kon_remaining_us = i64::from(instrument.kon_ms) * 1000;
                        claim.timbre = voice.timbre;
                    }
                }
                chip.recent_timbre = Some(voice.timbre);
            }
        }

        let mut removed = [false; 2];
        for (vi, slot) in voices.iter().enumerate() {
            let Some(voice) = slot else { continue };
            if select.is_some_and(|s| s != voice.chan) {
                continue;
            }
            let c = usize::from(voice.chan);

            if props.contains(NoteUpdateFlags::OFF) {
                let pedal_held =
                    self.midi_channels[mc].sustain && !props.contains(NoteUpdateFlags::MUTE);
                if !pedal_held {
                    let claim_handle = self.chip_channels[c].find_claim(loc);
                    let erase = match claim_handle {
                        Some(handle) => {
                            props.contains(NoteUpdateFlags::MUTE)
                                || self.chip_channels[c].claims.get(handle).map_or(false, |d| {
                                    !d.sustained.contains(SustainFlags::SOSTENUTO)
                                })
                        }
                        None => false,
                    };
                    if erase {
                        if let Some(handle) = claim_handle {
                            self.chip_channels[c].claims.remove(handle);
                        }
                        if self.chip_channels[c].is_free() {
                            self.synth.note_off(c);
                            if props.contains(NoteUpdateFlags::MUTE) {
                                self.synth.touch_note(c, 0, 127, 127, 127);
                                self.chip_channels[c].koff_remaining_us = 0;
                            } else {
                                self.chip_channels[c].koff_remaining_us =
                                    i64::from(instrument.koff_ms) * 1000;
                            }
                        }
                    }
                } else if let Some(handle) = self.chip_channels[c].find_claim(loc) {
                    if let Some(claim) = self.chip_channels[c].claims.get_mut(handle) {
                        claim.sustained |= SustainFlags::PEDAL;
                    }
                }
                removed[vi] = true;
                continue;
            }

            if props.contains(NoteUpdateFlags::PAN) {
                let bits = panning_to_bits(self.midi_channels[mc].panning);
                self.synth.set_pan(c, bits);
            }

            if props.contains(NoteUpdateFlags::VOLUME) {
                let ch = &self.midi_channels[mc];
                let is_percussion = mc == 9 || ch.percussion;
                let source = if is_percussion { 127 } else { ch.brightness };
                let brightness = effective_brightness(source, self.full_range_brightness);
                let (volume, expression) = (ch.volume, ch.expression);
                self.synth
                    .touch_note(c, velocity, volume, expression, brightness);
            }

            if props.contains(NoteUpdateFlags::PITCH) {
                let (bendable, vibrato_ready) = {
                    let chip = &self.chip_channels[c];
                    match chip.find_claim(loc).and_then(|h| chip.claims.get(h)) {
                        Some(claim) => (
                            claim.sustained.is_empty(),
                            claim.vibrato_age_us >= self.midi_channels[mc].vibrato_delay_us,
                        ),
                        None => (true, true),
                    }
                };
                // Pedal-held notes are never retuned.
                if bendable {
                    let target = {
                        let ch = &self.midi_channels[mc];
                        let mut bend = f64::from(ch.pitch_bend) * ch.bendsense
                            + f64::from(voice.timbre.note_offset);
                        let vibrato = ch.vibrato.max(ch.aftertouch).max(note_vibrato);
                        if vibrato != 0 && vibrato_ready {
                            bend +=
                                f64::from(vibrato) * ch.vibrato_depth * ch.vibrato_pos.sin();
                        }
                        tone + bend + voice.phase
                    };
                    self.synth.note_on(c, target);
                }
            }
        }

        if removed.iter().any(|&r| r) {
            if let Some(state) = self.midi_channels[mc].notes.get_mut(note) {
                for (vi, r) in removed.iter().enumerate() {
                    if *r {
                        state.voices[vi] = None;
                    }
                }
            }
        }
        let empty = self.midi_channels[mc]
            .notes
            .get(note)
            .map_or(true, |state| state.voices.iter().all(Option::is_none));
        if empty {
            self.midi_channels[mc].notes.remove(note);
        }
    }

    /// Applies `props` to every active note of a MIDI channel.
    fn note_update_all(&mut self, midi_channel: u16, props: NoteUpdateFlags) {
        let mc = usize::from(midi_channel);
        let mut cursor = self.midi_channels[mc].notes.first();
        while let Some(handle) = cursor {
            cursor = self.midi_channels[mc].notes.next(handle);
            self.note_update(midi_channel, handle, props, None);
        }
    }

    fn update_vibrato(&mut self, dt: f64) {
        for ch in 0..16u16 {
            let mc = usize::from(ch);
            let (has_notes, wants_vibrato) = {
                let state = &self.midi_channels[mc];
                let wants = state.vibrato != 0
                    || state.aftertouch != 0
                    || state.notes.iter().any(|(_, n)| n.vibrato != 0);
                (!state.notes.is_empty(), wants)
            };
            if has_notes && wants_vibrato {
                self.note_update_all(ch, NoteUpdateFlags::PITCH);
                let state = &mut self.midi_channels[mc];
                state.vibrato_pos += dt * state.vibrato_speed;
            } else {
                self.midi_channels[mc].vibrato_pos = 0.0;
            }
        }
    }

    /// One arpeggio step per quantum: on every channel carrying several
    /// claims, re-key the claim whose turn it is. Expired claims are
    /// released on the spot and the channel retried.
    fn update_arpeggio(&mut self, dt: f64) {
        if !self.auto_arpeggio {
            return;
        }
        self.arpeggio_accum += dt;
        let quantum = 1.0 / ARPEGGIO_RATE_HZ;
        while self.arpeggio_accum >= quantum {
            self.arpeggio_accum -= quantum;
            self.arpeggio_step();
        }
    }

    fn arpeggio_step(&mut self) {
        self.arpeggio_counter = self.arpeggio_counter.wrapping_add(1);
        let mut c = 0usize;
        while c < self.chip_channels.len() {
            let users = self.chip_channels[c].claims.len();
            if users <= 1 {
                c += 1;
                continue;
            }
            // Fewer stacked notes alternate slower.
            let rate_reduction = match users {
                2 => 3,
                3 => 2,
                _ => 1,
            };
            let target = (self.arpeggio_counter as usize / rate_reduction) % users;
            let mut handle = self.chip_channels[c].claims.first();
            for _ in 0..target {
                handle = handle.and_then(|h| self.chip_channels[c].claims.next(h));
            }
            let Some(handle) = handle else {
                c += 1;
                continue;
            };
            let Some(claim) = self.chip_channels[c].claims.get(handle) else {
                c += 1;
                continue;
            };
            if !claim.sustained.is_empty() {
                c += 1;
                continue;
            }
            let loc = claim.loc;
            let expired = claim.kon_remaining_us <= 0;
            let note = self.midi_channels[usize::from(loc.midi_channel)].find_note(loc.note);
            if expired {
                match note {
                    Some(nh) => {
                        self.note_update(loc.midi_channel, nh, NoteUpdateFlags::OFF, Some(c as u16))
                    }
                    None => {
                        self.chip_channels[c].claims.remove(handle);
                    }
                }
                // Retry the same channel with one claim fewer.
                continue;
            }
            if let Some(nh) = note {
                self.note_update(loc.midi_channel, nh, NoteUpdateFlags::SOUNDING, Some(c as u16));
            }
            c += 1;
        }
    }
}

impl std::fmt::Debug for OpnMidiPlayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpnMidiPlayer")
            .field("num_chips", &self.num_chips())
            .field("family", &self.chip_family())
            .field("allocation_mode", &self.allocation_mode)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{RegisterCapture, RegisterLog};
    use crate::bank::{Instrument, InstrumentFlags};

    fn test_instrument(level: u8) -> Instrument {
        let mut timbre = Timbre::default();
        timbre.fbalg = 0x04;
        for op in &mut timbre.operators {
            op.level = level;
        }
        Instrument::single(timbre)
    }

    fn test_banks() -> BankStore {
        let mut store = BankStore::new();
        let melodic = store.bank_mut(BankId::melodic(0, 0));
        melodic.set_instrument(0, test_instrument(8)).unwrap();
        melodic.set_instrument(1, test_instrument(16)).unwrap();
        let mut drum = test_instrument(24);
        drum.percussion_key = 40;
        store
            .bank_mut(BankId::percussion(0, 0))
            .set_instrument(35, drum)
            .unwrap();
        store
    }

    fn test_player(chips: usize) -> (OpnMidiPlayer, RegisterLog) {
        let log = RegisterLog::new();
        let mut player = OpnMidiPlayer::new(RegisterCapture::factory(log.clone()), 44_100);
        player.set_num_chips(chips).unwrap();
        player.install_banks(test_banks());
        log.clear();
        (player, log)
    }

    #[test]
    fn test_defaults() {
        let log = RegisterLog::new();
        let player = OpnMidiPlayer::new(RegisterCapture::factory(log), 44_100);
        assert_eq!(player.num_chips(), OpnMidiPlayer::DEFAULT_NUM_CHIPS);
        assert_eq!(player.num_channels(), 12);
        assert_eq!(player.chip_family(), ChipFamily::Opn2);
        assert_eq!(player.allocation_mode(), ChannelAllocMode::Auto);
        assert_eq!(player.master_volume(), 127);
        assert!(!player.auto_arpeggio());
    }

    #[test]
    fn test_config_validation() {
        let (mut player, _log) = test_player(1);
        assert!(player.set_num_chips(0).is_err());
        assert!(player.set_num_chips(101).is_err());
        assert!(crate::last_error_message().contains("chip count"));
        assert_eq!(player.num_chips(), 1);

        assert!(player.set_lfo_frequency(8).is_err());
        assert!(player.set_master_volume(128).is_err());
        assert!(player.set_device_identifier(16).is_err());
        assert!(player.set_lfo_frequency(7).is_ok());
        assert!(player.set_master_volume(100).is_ok());
        assert_eq!(player.master_volume(), 100);
    }

    #[test]
    fn test_note_on_without_banks_is_silent() {
        let log = RegisterLog::new();
        let mut player = OpnMidiPlayer::new(RegisterCapture::factory(log.clone()), 44_100);
        log.clear();
        assert!(!player.note_on(0, 60, 100));
        assert!(log.is_empty());
    }

    #[test]
    fn test_note_on_places_a_note() {
        let (mut player, log) = test_player(1);
        assert!(player.note_on(0, 60, 100));
        assert!(!log.is_empty());

        let mut text = [0u8; 8];
        let mut attr = [0xFFu8; 8];
        let cells = player.describe_channels(&mut text, &mut attr);
        assert_eq!(cells, 6);
        assert_eq!(text[0], b'+');
        assert_eq!(attr[0], 0);
        assert!(text[1..6].iter().all(|&t| t == b'-'));
        assert!(attr[1..6].iter().all(|&a| a == 0));
    }

    #[test]
    fn test_blank_instrument_is_dropped() {
        let (mut player, log) = test_player(1);
        // Program 5 was never filled in, so the slot holds a blank.
        player.patch_change(0, 5);
        assert!(!player.note_on(0, 60, 100));
        assert!(log.is_empty());
    }

    #[test]
    fn test_explicit_blank_flag_is_dropped() {
        let (mut player, log) = test_player(1);
        let mut banks = test_banks();
        let mut ins = test_instrument(8);
        ins.flags |= InstrumentFlags::BLANK;
        banks
            .bank_mut(BankId::melodic(0, 0))
            .set_instrument(2, ins)
            .unwrap();
        player.install_banks(banks);
        player.patch_change(0, 2);
        log.clear();
        assert!(!player.note_on(0, 60, 100));
        assert!(log.is_empty());
    }

    #[test]
    fn test_velocity_zero_releases() {
        let (mut player, _log) = test_player(1);
        assert!(player.note_on(0, 60, 100));
        assert!(!player.note_on(0, 60, 0));

        let mut text = [0u8; 6];
        let mut attr = [0u8; 6];
        player.describe_channels(&mut text, &mut attr);
        assert!(text.iter().all(|&t| t == b'-'));
    }

    #[test]
    fn test_percussion_uses_note_keyed_bank() {
        let (mut player, _log) = test_player(1);
        assert!(player.note_on(9, 35, 100));
        // Note 36 has no percussion instrument installed.
        assert!(!player.note_on(9, 36, 100));

        let mut text = [0u8; 6];
        let mut attr = [0u8; 6];
        player.describe_channels(&mut text, &mut attr);
        assert_eq!(text[0], b'+');
        assert_eq!(attr[0], 9);
    }

    #[test]
    fn test_describe_reports_pedal_hold() {
        let (mut player, _log) = test_player(1);
        player.controller_change(0, 64, 127);
        player.note_on(0, 60, 100);
        player.note_off(0, 60);

        let mut text = [0u8; 6];
        let mut attr = [0u8; 6];
        player.describe_channels(&mut text, &mut attr);
        assert_eq!(text[0], b'@');

        // Lifting the pedal releases the claim.
        player.controller_change(0, 64, 0);
        player.describe_channels(&mut text, &mut attr);
        assert_eq!(text[0], b'-');
    }

    #[test]
    fn test_bank_change_falls_back_to_bank_zero() {
        let (mut player, _log) = test_player(1);
        // Bank (5, 0) was never installed; lookup falls back to bank 0.
        player.bank_change(0, 5 * 256);
        assert!(player.note_on(0, 60, 100));
    }

    #[test]
    fn test_pitch_bend_forms_agree() {
        let (mut player, _log) = test_player(1);
        player.pitch_bend_parts(0, 0x40, 0x01);
        let from_parts = player.midi_channels[0].pitch_bend;
        player.pitch_bend(0, (0x40 << 7) | 0x01);
        assert_eq!(player.midi_channels[0].pitch_bend, from_parts);
        assert_eq!(from_parts, 1);
    }

    #[test]
    fn test_sysex_reset_reaches_channels() {
        let (mut player, _log) = test_player(1);
        player.controller_change(0, 7, 20);
        player.pitch_bend(0, 16383);
        assert!(player.sysex(&[0xF0, 0x7E, 0x7F, 0x09, 0x01, 0xF7]));
        // A fresh note now sounds with default channel volume.
        assert!(player.note_on(0, 60, 100));
    }

    #[test]
    fn test_sysex_part_percussion() {
        let (mut player, _log) = test_player(1);
        // Switch channel 0 into percussion via XG part mode.
        assert!(player.sysex(&[0xF0, 0x43, 0x10, 0x4C, 0x08, 0x00, 0x07, 0x01, 0xF7]));
        // Note 35 resolves through the percussion bank now.
        assert!(player.note_on(0, 35, 100));
        assert!(!player.note_on(0, 36, 100));
    }
}
