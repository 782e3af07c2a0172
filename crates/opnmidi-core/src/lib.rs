//! MIDI driver for OPN2/OPNA FM synthesizer chips
//!
//! A real-time MIDI synthesizer engine targeting the Yamaha YM2612 (OPN2)
//! and YM2608 (OPNA) four-operator FM chips. The driver accepts MIDI
//! events on sixteen channels, allocates notes onto the six FM channels
//! each chip provides, and programs chip registers through a pluggable
//! backend, so it runs equally well over an emulator core or a register
//! logger.
//!
//! # Features
//! - Scored voice allocation across an array of up to 100 chips
//! - WOPN-style instrument banks with melodic/percussion split and
//!   two-voice (pseudo-4op) layering
//! - Five loudness curves matching classic DOS/Windows drivers
//! - Damper and sostenuto pedals, pitch bend with RPN 0 range,
//!   vibrato from CC1 and aftertouch, CC74 brightness
//! - GM/GS/XG System Exclusive resets, GS/XG drum-part switching and
//!   universal device master volume
//! - Optional channel-sharing arpeggio instead of voice stealing
//!
//! # Crate feature flags
//! - `serde` (optional): Serialize/Deserialize for instrument and bank
//!   data types
//!
//! # Backend Trait
//! The [`OpnChip`] trait decouples the driver from any particular chip
//! core. [`RegisterCapture`] implements it as a pure register logger,
//! which the test suite uses to assert on exact write sequences.
//!
//! # Quick start
//! ```
//! use opnmidi::{
//!     BankId, BankStore, Instrument, OpnMidiPlayer, RegisterCapture, RegisterLog, Timbre,
//! };
//!
//! let log = RegisterLog::new();
//! let mut player = OpnMidiPlayer::new(RegisterCapture::factory(log.clone()), 44_100);
//!
//! let mut banks = BankStore::new();
//! let mut timbre = Timbre::default();
//! timbre.fbalg = 0x07; // algorithm 7: four parallel carriers
//! banks
//!     .bank_mut(BankId::melodic(0, 0))
//!     .set_instrument(0, Instrument::single(timbre))?;
//! player.install_banks(banks);
//!
//! assert!(player.note_on(0, 69, 100)); // A4
//! let mut frames = [0i16; 512];
//! player.generate(&mut frames);
//! assert!(!log.is_empty());
//! # Ok::<(), opnmidi::OpnMidiError>(())
//! ```
//!
//! Frequency math, loudness curves and the brightness mapping live in the
//! `opnmidi-models` crate and are re-exported where they appear in this
//! crate's API.

#![warn(missing_docs)]

use parking_lot::Mutex;

mod arena;
pub mod backend;
pub mod bank;
mod channels;
pub mod player;
pub mod registers;
mod sysex;

/// Error types for driver configuration
///
/// Real-time MIDI events never fail; out-of-range event data is clamped
/// or ignored instead. Errors arise only from configuration setters.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpnMidiError {
    /// Chip array size outside the supported range
    #[error("chip count {requested} is out of range (1..=100)")]
    ChipCountOutOfRange {
        /// The rejected chip count
        requested: usize,
    },

    /// Hardware LFO rate outside the 3-bit register range
    #[error("LFO frequency {requested} is out of range (0..=7)")]
    LfoFrequencyOutOfRange {
        /// The rejected rate value
        requested: u8,
    },

    /// Master volume above the MIDI data-byte range
    #[error("master volume {requested} is out of range (0..=127)")]
    MasterVolumeOutOfRange {
        /// The rejected volume
        requested: u8,
    },

    /// Program number above the MIDI data-byte range
    #[error("program {requested} is out of range (0..=127)")]
    ProgramOutOfRange {
        /// The rejected program number
        requested: u8,
    },

    /// SysEx device identifier above the 4-bit range
    #[error("device identifier {requested} is out of range (0..=15)")]
    DeviceIdOutOfRange {
        /// The rejected identifier
        requested: u8,
    },
}

/// Result type for driver configuration operations
pub type Result<T> = std::result::Result<T, OpnMidiError>;

static LAST_ERROR: Mutex<String> = Mutex::new(String::new());

pub(crate) fn set_last_error(message: impl Into<String>) {
    *LAST_ERROR.lock() = message.into();
}

/// The text of the most recent configuration error, empty when none has
/// occurred yet. Shared across all players in the process.
pub fn last_error_message() -> String {
    LAST_ERROR.lock().clone()
}

// Public API exports
pub use backend::{ChipFactory, OpnChip, RegisterCapture, RegisterLog, RegisterWrite};
pub use bank::{Bank, BankId, BankStore, Instrument, InstrumentFlags, Operator, Timbre};
pub use player::{ChannelAllocMode, OpnMidiPlayer};
pub use registers::{Synth, CHANNELS_PER_CHIP};

pub use opnmidi_models::{ChipFamily, VolumeModel};
