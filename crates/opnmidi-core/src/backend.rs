//! Chip emulation backends.
//!
//! The player talks to hardware through the [`OpnChip`] trait: register
//! writes plus stereo sample generation. Real emulator cores live in other
//! crates and plug in through a [`ChipFactory`]; this crate ships
//! [`RegisterCapture`], a silent backend that records the register stream
//! so tests and dump tools can inspect exactly what the driver programmed.

use std::sync::Arc;

use parking_lot::Mutex;

use opnmidi_models::ChipFamily;

/// A single OPN2/OPNA chip instance.
///
/// Implementations are free to run any emulation core; the driver only
/// needs register access and interleaved stereo output.
pub trait OpnChip: Send {
    /// Chip family this instance emulates.
    fn family(&self) -> ChipFamily;

    /// Position of this chip in the player's chip array. Backends that
    /// tag their output (dump writers, debuggers) can pick this up;
    /// others ignore it.
    fn set_chip_id(&mut self, _id: u32) {}

    /// Puts the chip into its power-on state and sets the output sample
    /// rate and master clock.
    fn reset(&mut self, sample_rate: u32, clock: u32);

    /// Writes `value` to register `addr` on `port` (0 for channels 1-3,
    /// 1 for channels 4-6).
    fn write_reg(&mut self, port: u8, addr: u8, value: u8);

    /// Fills `buffer` with interleaved stereo frames. The slice length is
    /// always even.
    fn generate(&mut self, buffer: &mut [i16]);
}

/// Constructor for chip instances, called once per chip on (re)configure.
pub type ChipFactory = Box<dyn Fn(ChipFamily) -> Box<dyn OpnChip> + Send>;

/// One recorded register write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterWrite {
    /// Index of the chip that received the write.
    pub chip_id: u32,
    /// Register port, 0 or 1.
    pub port: u8,
    /// Register address.
    pub addr: u8,
    /// Register value.
    pub value: u8,
}

/// Shared log of register writes.
///
/// Cloning is cheap and every clone sees the same stream, so a test can
/// keep one handle while the chip owning the other lives inside the
/// player.
#[derive(Debug, Clone, Default)]
pub struct RegisterLog {
    writes: Arc<Mutex<Vec<RegisterWrite>>>,
}

impl RegisterLog {
    /// An empty log.
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, write: RegisterWrite) {
        self.writes.lock().push(write);
    }

    /// Copy of everything recorded so far.
    pub fn snapshot(&self) -> Vec<RegisterWrite> {
        self.writes.lock().clone()
    }

    /// Drains the log, returning the recorded writes.
    pub fn take(&self) -> Vec<RegisterWrite> {
        std::mem::take(&mut *self.writes.lock())
    }

    /// Discards everything recorded so far.
    pub fn clear(&self) {
        self.writes.lock().clear();
    }

    /// Number of recorded writes.
    pub fn len(&self) -> usize {
        self.writes.lock().len()
    }

    /// `true` when nothing has been recorded.
    pub fn is_empty(&self) -> bool {
        self.writes.lock().is_empty()
    }

    /// Replays the log for one chip into a register image, last write per
    /// address wins. Index the result as `[port][addr]`.
    pub fn port_image(&self, chip_id: u32) -> [[u8; 256]; 2] {
        let mut image = [[0u8; 256]; 2];
        for write in self.writes.lock().iter() {
            if write.chip_id == chip_id {
                image[usize::from(write.port & 1)][usize::from(write.addr)] = write.value;
            }
        }
        image
    }
}

/// Backend that records register writes and renders silence.
pub struct RegisterCapture {
    family: ChipFamily,
    chip_id: u32,
    log: RegisterLog,
}

impl RegisterCapture {
    /// A capture backend writing into `log`.
    pub fn new(family: ChipFamily, log: RegisterLog) -> Self {
        Self {
            family,
            chip_id: 0,
            log,
        }
    }

    /// Factory producing capture backends that share `log`.
    pub fn factory(log: RegisterLog) -> ChipFactory {
        Box::new(move |family| Box::new(RegisterCapture::new(family, log.clone())))
    }
}

impl OpnChip for RegisterCapture {
    fn family(&self) -> ChipFamily {
        self.family
    }

    fn set_chip_id(&mut self, id: u32) {
        self.chip_id = id;
    }

    fn reset(&mut self, _sample_rate: u32, _clock: u32) {}

    fn write_reg(&mut self, port: u8, addr: u8, value: u8) {
        self.log.push(RegisterWrite {
            chip_id: self.chip_id,
            port,
            addr,
            value,
        });
    }

    fn generate(&mut self, buffer: &mut [i16]) {
        buffer.fill(0);
    }
}
