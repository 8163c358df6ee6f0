//! Persistent SWPSTAT command log (spec.md §4.4): a flat, append-only
//! sequence of `{cmd1, cmd2, cmd3, crc8}` records written one at a time
//! as the swap state machine advances, so a reboot mid-swap can resume
//! from the last durable command instead of restarting the whole swap.

use common::flash::Flash;
use common::slotmap::SlotView;
use common::Error;

/// Size in bytes of one command record.
pub const RECORD_SIZE: usize = 4;

pub const CMD1_SWAP: u8 = 0x7F;
pub const CMD1_ERROR: u8 = 0x00;
pub const CMD1_EMPTY: u8 = 0xFF;

/// The swap's current phase, stored as `cmd2` (spec.md §4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Phase {
    Empty = 0xFF,
    Run2Mov = 0x7F,
    Upg2Run = 0x3E,
    Mov2Upg = 0x1F,
    Finalise = 0x0F,
    SwpEnd = 0x00,
}

impl Phase {
    fn from_byte(b: u8) -> Option<Phase> {
        match b {
            0xFF => Some(Phase::Empty),
            0x7F => Some(Phase::Run2Mov),
            0x3E => Some(Phase::Upg2Run),
            0x1F => Some(Phase::Mov2Upg),
            0x0F => Some(Phase::Finalise),
            0x00 => Some(Phase::SwpEnd),
            _ => None,
        }
    }
}

/// One durable command: a phase transition, or progress within a phase
/// (`sector_index`, the `k` of spec.md's per-sector walk).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Command {
    pub cmd1: u8,
    pub phase: Phase,
    pub sector_index: u8,
}

impl Command {
    fn encode(&self) -> [u8; RECORD_SIZE] {
        let mut buf = [self.cmd1, self.phase as u8, self.sector_index, 0];
        buf[3] = common::crc::crc8_ccitt(&buf[..3]);
        buf
    }

    fn decode(buf: &[u8; RECORD_SIZE]) -> Option<Command> {
        if common::crc::crc8_ccitt(&buf[..3]) != buf[3] {
            return None;
        }
        Some(Command {
            cmd1: buf[0],
            phase: Phase::from_byte(buf[1])?,
            sector_index: buf[2],
        })
    }

    fn is_empty_pattern(buf: &[u8; RECORD_SIZE]) -> bool {
        buf.iter().all(|&b| b == 0xFF)
    }
}

/// A mounted view over one image's SWPSTAT area, positioned just past
/// the last durable command.
pub struct CommandLog {
    area: SlotView,
    record_size: u32,
    next_offset: u32,
    last: Option<Command>,
}

impl CommandLog {
    /// Scans `area` from its start for the last valid, non-erased
    /// command record, mirroring the sfcb mount scan but over a flat
    /// (non-circular) append log. `area.size == 0` areas (inplace slots
    /// with no persisted SWPSTAT) are rejected; callers should check
    /// that case and use [`crate::swap::SwapEngine::run_unpersisted`]
    /// instead.
    pub fn mount<F: Flash>(flash: &mut F, area: SlotView, wbs: u32) -> Result<Self, Error<F::Error>> {
        if area.size == 0 {
            return Err(Error::InvalidArgument);
        }
        let record_size = common::flash::align_up(RECORD_SIZE as u32, wbs.max(1));
        let mut offset = 0u32;
        let mut last = None;
        let mut buf = [0u8; RECORD_SIZE];
        while offset + record_size as u32 <= area.size {
            flash.read(area.offset + offset, &mut buf)?;
            if Command::is_empty_pattern(&buf) {
                break;
            }
            match Command::decode(&buf) {
                Some(cmd) => last = Some(cmd),
                None => break,
            }
            offset += record_size;
        }
        Ok(CommandLog { area, record_size, next_offset: offset, last })
    }

    /// The last durably-written command, if any.
    pub fn last(&self) -> Option<Command> {
        self.last
    }

    /// Appends a new command. If the area is full, it is erased first
    /// and the log restarts from the beginning (valid because a full
    /// log always ends in `Phase::SwpEnd`, whose progress need not
    /// survive into the next swap).
    pub fn append<F: Flash>(&mut self, flash: &mut F, cmd: Command) -> Result<(), Error<F::Error>> {
        if self.next_offset + self.record_size > self.area.size {
            self.reset(flash)?;
        }
        let buf = cmd.encode();
        flash.write(self.area.offset + self.next_offset, &buf)?;
        self.next_offset += self.record_size;
        self.last = Some(cmd);
        Ok(())
    }

    /// Erases the whole SWPSTAT area and resets the append cursor, used
    /// once a swap reaches `Phase::SwpEnd` and its history is no longer
    /// needed.
    pub fn reset<F: Flash>(&mut self, flash: &mut F) -> Result<(), Error<F::Error>> {
        common::debug!("cmdlog: resetting log area at offset {}", self.area.offset);
        flash.erase(self.area.offset, self.area.size)?;
        self.next_offset = 0;
        self.last = None;
        Ok(())
    }
}
