//! Conversion models for OPN2/OPNA FM synthesis drivers
//!
//! A small pure-math library shared by MIDI drivers targeting the Yamaha
//! OPN family (YM2612 "OPN2", YM2608 "OPNA"). It collects the conversion
//! curves those drivers need but the chips do not provide:
//!
//! - Legacy volume models: the loudness curves of the historic DOS/Win9x
//!   drivers (DMX, Apogee Sound System, SB16 Win9x) plus a generic linear
//!   model, reproduced with their exact integer arithmetic.
//! - Frequency encoding: MIDI tone (semitones, fractional detune allowed)
//!   to the chip's combined block/f-number word.
//! - XG brightness (CC74): the square-root curve applied to modulator
//!   total levels.
//!
//! No I/O, no chip state, no allocation. Everything here is deterministic
//! and unit-testable in isolation.
//!
//! # Quick start
//! ```
//! use opnmidi_models::{ChipFamily, VoiceLevels, VolumeModel, carriers};
//!
//! // Scale a fully-carried algorithm 7 voice by velocity and CC7/CC11.
//! let mut levels = VoiceLevels {
//!     velocity: 100,
//!     channel_volume: 127,
//!     expression: 127,
//!     master: 127,
//!     algorithm: 7,
//!     op_levels: [16, 16, 16, 16],
//!     scale_op: carriers(7),
//! };
//! VolumeModel::Generic.apply(&mut levels);
//!
//! // A4 lands on f-number 541, block 5.
//! let word = ChipFamily::Opn2.tone_to_freq_word(69.0).unwrap();
//! assert_eq!(word & 0x7FF, 541);
//! assert_eq!(word >> 11, 5);
//! ```

#![warn(missing_docs)]

pub mod brightness;
pub mod frequency;
pub mod volume;

pub use brightness::{effective_brightness, xg_brightness_curve};
pub use frequency::ChipFamily;
pub use volume::{carriers, VoiceLevels, VolumeModel};
