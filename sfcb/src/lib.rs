//! Simple Flash Circular Buffer: a log-structured key/value store spanning
//! an integer number of erase sectors (spec.md §4.1). Independent of the
//! swap engine; `settings` and the demos are its only consumers in this
//! workspace.
#![cfg_attr(not(test), no_std)]

pub mod ate;
pub mod location;

use common::flash::{align_up, Flash};
use common::Error;

use ate::{record_size, sec_id_cmp, Ate, SectorStart, MAX_RECORD_SIZE};
use location::{Location, WriteState};

/// Static configuration of one SFCB filesystem (spec.md §3.1, §6).
#[derive(Debug, Clone, Copy)]
pub struct Config {
    /// Absolute flash offset of sector 0.
    pub offset: u32,
    /// Size of each erase sector, in bytes.
    pub sector_size: u32,
    /// Number of sectors in the filesystem.
    pub sector_cnt: u16,
    /// Write-block size of the underlying flash, a power of two.
    pub wbs: u32,
}

impl Config {
    fn record_size(&self) -> u32 {
        record_size(self.wbs)
    }

    fn sector_offset(&self, sector: u16) -> u32 {
        self.offset + sector as u32 * self.sector_size
    }
}

/// A registered garbage-collection routine, invoked under the write lock
/// whenever `open_loc` rotates into a new sector (spec.md §4.1
/// "Compaction hook"). Implementors typically iterate the target
/// sector's live entries and re-append the ones worth keeping via
/// [`Sfcb::copy_loc`].
pub trait Compressor<F: Flash> {
    fn compress(&mut self, fs: &mut Sfcb<'_, F>, target_sector: u16) -> Result<(), Error<F::Error>>;
}

/// The filesystem handle. Owns the flash device for as long as it is
/// mounted — mount either returns a fully live handle or fails outright,
/// per the atomic-mount design decision in `SPEC_FULL.md`.
pub struct Sfcb<'c, F: Flash> {
    flash: F,
    cfg: Config,
    wr_sector: u16,
    wr_sector_id: u16,
    wr_data_offset: u32,
    wr_ate_offset: u32,
    compress: Option<&'c mut dyn Compressor<F>>,
}

impl<'c, F: Flash> Sfcb<'c, F> {
    /// Registers (or replaces) the compaction callback invoked on sector
    /// rotation.
    pub fn set_compressor(&mut self, compressor: &'c mut dyn Compressor<F>) {
        self.compress = Some(compressor);
    }

    /// Scans all sectors, selects the write sector by maximal `sec_id`,
    /// and replays the ATE/payload regions to recover the write cursors.
    /// Fails with `NoFilesystem` if no sector has a valid sector-start
    /// record.
    pub fn mount(mut flash: F, cfg: Config) -> Result<Self, Error<F::Error>> {
        let record_size = cfg.record_size();
        let mut buf = [0u8; MAX_RECORD_SIZE];

        let mut best: Option<(u16, u16)> = None; // (sector, sec_id)
        for sector in 0..cfg.sector_cnt {
            flash.read(cfg.sector_offset(sector), &mut buf[..record_size as usize])?;
            if let Some(start) = SectorStart::decode(&buf[..record_size as usize]) {
                let better = match best {
                    None => true,
                    Some((_, best_id)) => sec_id_cmp(start.sec_id, best_id) == core::cmp::Ordering::Greater,
                };
                if better {
                    best = Some((sector, start.sec_id));
                }
            }
        }

        let (wr_sector, wr_sector_id) = best.ok_or(Error::NoFilesystem)?;
        common::debug!("sfcb: mounted at sector {} (sec_id {})", wr_sector, wr_sector_id);

        let (wr_data_offset, wr_ate_offset) =
            Self::recover_cursors(&mut flash, &cfg, wr_sector)?;

        Ok(Sfcb {
            flash,
            cfg,
            wr_sector,
            wr_sector_id,
            wr_data_offset,
            wr_ate_offset,
            compress: None,
        })
    }

    /// Recovers `(wr_data_offset, wr_ate_offset)`, both relative to the
    /// start of `sector`, per the mount recovery algorithm in spec.md
    /// §4.1 steps 3-4.
    fn recover_cursors(flash: &mut F, cfg: &Config, sector: u16) -> Result<(u32, u32), Error<F::Error>> {
        let record_size = cfg.record_size();
        let base = cfg.sector_offset(sector);
        let mut ate_offset = cfg.sector_size - record_size;
        let mut data_candidate = record_size; // just past the sector-start record
        let mut buf = [0u8; MAX_RECORD_SIZE];

        loop {
            flash.read(base + ate_offset, &mut buf[..record_size as usize])?;
            if Ate::is_empty_pattern(&buf[..record_size as usize]) {
                break;
            }
            if let Some(ate) = Ate::decode(&buf[..record_size as usize]) {
                let end = ate.offset as u32 + align_up(ate.len as u32, cfg.wbs);
                if end > data_candidate {
                    data_candidate = end;
                }
            }
            if ate_offset < record_size {
                break;
            }
            ate_offset -= record_size;
            if ate_offset < data_candidate {
                // ATE region has met the data region: fully used sector
                // with no terminator slot, nothing further to recover.
                break;
            }
        }

        // Refine past the last ATE-implied boundary in case payload
        // bytes were written but their ATE was never committed.
        let mut data_offset = data_candidate;
        let mut word = [0u8; location::MAX_WBS];
        let wbs = cfg.wbs as usize;
        while data_offset + cfg.wbs <= ate_offset {
            flash.read(base + data_offset, &mut word[..wbs])?;
            if word[..wbs].iter().all(|&b| b == 0xFF) {
                break;
            }
            data_offset += cfg.wbs;
        }

        Ok((data_offset, ate_offset))
    }

    /// Erases sector 0 unconditionally, plus any sector whose terminal
    /// (topmost) ATE slot is non-empty, and writes a fresh sector-start
    /// into sector 0.
    pub fn format(flash: &mut F, cfg: Config) -> Result<(), Error<F::Error>> {
        let record_size = cfg.record_size();
        let mut buf = [0u8; MAX_RECORD_SIZE];

        for sector in 0..cfg.sector_cnt {
            let top = cfg.sector_offset(sector) + cfg.sector_size - record_size;
            flash.read(top, &mut buf[..record_size as usize])?;
            if sector == 0 || !Ate::is_empty_pattern(&buf[..record_size as usize]) {
                flash.erase(cfg.sector_offset(sector), cfg.sector_size)?;
            }
        }

        SectorStart { sec_id: 0 }.encode(record_size as usize, &mut buf[..record_size as usize]);
        flash.write(cfg.sector_offset(0), &buf[..record_size as usize])?;
        Ok(())
    }

    /// Releases the flash device. No pending state to flush: every
    /// commit (§5) durably writes before returning.
    pub fn unmount(self) -> F {
        self.flash
    }

    fn ate_size(&self) -> u32 {
        self.cfg.record_size()
    }

    /// Reserves `align_up(len, wbs) + 2 * ATE_SIZE` bytes in the current
    /// write sector (the entry's own data+ATE, plus one extra ATE slot so
    /// an empty terminator always remains); rotates sectors, invoking the
    /// registered compactor, if the current one has no room. Fails
    /// `OutOfSpace` after `sector_cnt` unsuccessful rotations.
    pub fn open_loc(&mut self, id: u16, len: u16) -> Result<Location, Error<F::Error>> {
        let ate_size = self.ate_size();
        let needed = align_up(len as u32, self.cfg.wbs) + 2 * ate_size;

        for _ in 0..=self.cfg.sector_cnt {
            let free = self.wr_ate_offset.saturating_sub(self.wr_data_offset);
            if free >= needed {
                let ate_offset = self.wr_ate_offset;
                let data_offset = self.wr_data_offset;
                return Ok(Location::for_write(
                    self.wr_sector,
                    self.wr_sector_id,
                    ate_offset,
                    data_offset,
                    id,
                    len,
                ));
            }
            self.rotate()?;
        }
        Err(Error::OutOfSpace)
    }

    fn rotate(&mut self) -> Result<(), Error<F::Error>> {
        let next_sector = (self.wr_sector + 1) % self.cfg.sector_cnt;
        let next_id = self.wr_sector_id.wrapping_add(1);
        common::debug!("sfcb: rotate sector {} -> {} (sec_id {})", self.wr_sector, next_sector, next_id);
        self.flash.erase(self.cfg.sector_offset(next_sector), self.cfg.sector_size)?;

        let record_size = self.ate_size();
        let mut buf = [0u8; MAX_RECORD_SIZE];
        SectorStart { sec_id: next_id }.encode(record_size as usize, &mut buf[..record_size as usize]);
        self.flash.write(self.cfg.sector_offset(next_sector), &buf[..record_size as usize])?;

        self.wr_sector = next_sector;
        self.wr_sector_id = next_id;
        self.wr_data_offset = record_size;
        self.wr_ate_offset = self.cfg.sector_size - record_size;

        if self.cfg.sector_cnt >= 2 {
            if let Some(mut compressor) = self.compress.take() {
                let target = (self.wr_sector + 1) % self.cfg.sector_cnt;
                common::debug!("sfcb: compressing sector {} ahead of next rotation", target);
                let result = compressor.compress(self, target);
                self.compress = Some(compressor);
                result?;
            }
        }
        Ok(())
    }

    /// Reports the sector that the next rotation would overwrite — the
    /// compaction target (`sfcb_compress_sector`).
    pub fn compress_sector(&self) -> u16 {
        (self.wr_sector + 1) % self.cfg.sector_cnt
    }

    /// Appends bytes to a reserved location. May be called repeatedly;
    /// the sum of all `data.len()` across calls must equal the `len`
    /// passed to `open_loc`. Sub-WBS tails are buffered in `loc.dcache`
    /// when the flash device requires aligned writes.
    pub fn write_loc(&mut self, loc: &mut Location, data: &[u8]) -> Result<usize, Error<F::Error>> {
        match loc.write_state {
            Some(WriteState::Reserved) => loc.write_state = Some(WriteState::Writing),
            Some(WriteState::Writing) => {}
            _ => return Err(Error::PermissionDenied),
        }

        let base = self.cfg.sector_offset(loc.sector) + loc.data_offset;
        let wbs = self.cfg.wbs as usize;
        let mut written = 0;

        if self.flash.supports_unaligned_write() {
            self.flash.write(base + loc.pos, data)?;
            loc.pos += data.len() as u32;
            return Ok(data.len());
        }

        let mut input = data;
        while !input.is_empty() {
            let room = wbs - loc.dcache.len();
            let take = room.min(input.len());
            loc.dcache.extend_from_slice(&input[..take]).ok();
            input = &input[take..];
            written += take;

            if loc.dcache.len() == wbs {
                self.flash.write(base + loc.pos, &loc.dcache)?;
                loc.pos += wbs as u32;
                loc.dcache.clear();
            }
        }
        Ok(written)
    }

    /// Flushes any buffered sub-WBS tail, writes the ATE, and advances
    /// the write cursors. The location becomes unusable for further
    /// writes.
    pub fn close_loc(&mut self, mut loc: Location) -> Result<(), Error<F::Error>> {
        if loc.write_state != Some(WriteState::Writing) && loc.write_state != Some(WriteState::Reserved) {
            return Err(Error::PermissionDenied);
        }
        if loc.sector != self.wr_sector || loc.sector_id != self.wr_sector_id {
            return Err(Error::PermissionDenied);
        }

        let base = self.cfg.sector_offset(loc.sector) + loc.data_offset;
        let wbs = self.cfg.wbs as usize;
        if !loc.dcache.is_empty() && !self.flash.supports_unaligned_write() {
            let mut tail = [0u8; location::MAX_WBS];
            tail[..loc.dcache.len()].copy_from_slice(&loc.dcache);
            self.flash.write(base + loc.pos, &tail[..wbs])?;
            loc.pos += wbs as u32;
            loc.dcache.clear();
        }

        let ate = Ate { id: loc.id, offset: loc.data_offset as u16, len: loc.len };
        let record_size = self.ate_size();
        let mut buf = [0u8; MAX_RECORD_SIZE];
        ate.encode(record_size as usize, &mut buf[..record_size as usize]);
        self.flash.write(
            self.cfg.sector_offset(loc.sector) + loc.ate_offset,
            &buf[..record_size as usize],
        )?;

        self.wr_data_offset = loc.data_offset + align_up(loc.len as u32, self.cfg.wbs);
        self.wr_ate_offset = loc.ate_offset - record_size;
        loc.write_state = Some(WriteState::Closed);
        Ok(())
    }

    /// Positions an iterator at the oldest sector: `(wr_sector + 1) mod
    /// sector_cnt`.
    pub fn first_loc(&mut self) -> Result<Location, Error<F::Error>> {
        let oldest = (self.wr_sector + 1) % self.cfg.sector_cnt;
        let record_size = self.ate_size();
        let mut buf = [0u8; MAX_RECORD_SIZE];
        self.flash.read(self.cfg.sector_offset(oldest), &mut buf[..record_size as usize])?;
        let sector_id = SectorStart::decode(&buf[..record_size as usize])
            .map(|s| s.sec_id)
            .unwrap_or(0);

        let mut loc = Location::for_write(oldest, sector_id, self.cfg.sector_size - record_size, record_size, 0, 0);
        loc.write_state = None;
        self.next_loc(&mut loc)?;
        Ok(loc)
    }

    /// Advances `loc` to the next valid, CRC-verified ATE, skipping
    /// corrupt ones and crossing sector boundaries as needed. Returns
    /// `Err(NotFound)` once it reaches the current write position.
    pub fn next_loc(&mut self, loc: &mut Location) -> Result<(), Error<F::Error>> {
        if loc.write_state.is_some() {
            return Err(Error::PermissionDenied);
        }
        let record_size = self.ate_size();

        loop {
            if loc.sector == self.wr_sector && loc.ate_offset <= self.wr_ate_offset {
                return Err(Error::NotFound);
            }

            let mut buf = [0u8; MAX_RECORD_SIZE];
            self.flash.read(
                self.cfg.sector_offset(loc.sector) + loc.ate_offset,
                &mut buf[..record_size as usize],
            )?;

            if loc.ate_offset < record_size {
                // exhausted this sector's ATE region, move to the next
                loc.sector = (loc.sector + 1) % self.cfg.sector_cnt;
                let mut start_buf = [0u8; MAX_RECORD_SIZE];
                self.flash.read(self.cfg.sector_offset(loc.sector), &mut start_buf[..record_size as usize])?;
                loc.sector_id = SectorStart::decode(&start_buf[..record_size as usize])
                    .map(|s| s.sec_id)
                    .unwrap_or(loc.sector_id.wrapping_add(1));
                loc.ate_offset = self.cfg.sector_size - record_size;
                continue;
            }

            let candidate_offset = loc.ate_offset;
            loc.ate_offset -= record_size;

            if let Some(ate) = Ate::decode(&buf[..record_size as usize]) {
                *loc = Location::for_read(loc.sector, loc.sector_id, candidate_offset, ate);
                return Ok(());
            }
            // invalid/corrupt ATE: skip and keep scanning downward
        }
    }

    /// Reads up to `buf.len()` bytes (bounded by the remaining payload)
    /// from `loc`, advancing its read cursor.
    pub fn read_loc(&mut self, loc: &mut Location, buf: &mut [u8]) -> Result<usize, Error<F::Error>> {
        let remaining = loc.len as u32 - loc.pos;
        let n = (buf.len() as u32).min(remaining) as usize;
        if n > 0 {
            let off = self.cfg.sector_offset(loc.sector) + loc.data_offset + loc.pos;
            self.flash.read(off, &mut buf[..n])?;
            loc.pos += n as u32;
        }
        Ok(n)
    }

    /// Re-appends the entry at `loc` to the current write location
    /// (internal open/write/close), used by compaction to keep a live
    /// entry across a rotation.
    pub fn copy_loc(&mut self, loc: &Location) -> Result<(), Error<F::Error>> {
        if loc.sector == self.wr_sector && loc.sector_id == self.wr_sector_id {
            return Err(Error::InvalidArgument);
        }
        let mut new_loc = self.open_loc(loc.id, loc.len)?;
        let mut remaining = loc.len as u32;
        let mut pos = 0u32;
        let mut buf = [0u8; 64];
        while remaining > 0 {
            let n = (buf.len() as u32).min(remaining) as usize;
            let off = self.cfg.sector_offset(loc.sector) + loc.data_offset + pos;
            self.flash.read(off, &mut buf[..n])?;
            self.write_loc(&mut new_loc, &buf[..n])?;
            pos += n as u32;
            remaining -= n as u32;
        }
        self.close_loc(new_loc)
    }

    /// Convenience wrapper: writes `data` under `id` in one call.
    pub fn write(&mut self, id: u16, data: &[u8]) -> Result<(), Error<F::Error>> {
        let mut loc = self.open_loc(id, data.len() as u16)?;
        self.write_loc(&mut loc, data)?;
        self.close_loc(loc)
    }

    /// Convenience wrapper: scans all entries oldest-to-newest, keeps the
    /// last one matching `id`, and reads it into `buf`.
    pub fn read(&mut self, id: u16, buf: &mut [u8]) -> Result<usize, Error<F::Error>> {
        let mut found: Option<Location> = None;
        let mut loc = match self.first_loc() {
            Ok(l) => l,
            Err(Error::NotFound) => return Err(Error::NotFound),
            Err(e) => return Err(e),
        };
        loop {
            if loc.id() == id {
                found = Some(Location::for_read(loc.sector, loc.sector_id, loc.ate_offset, Ate {
                    id: loc.id,
                    offset: loc.data_offset as u16,
                    len: loc.len,
                }));
            }
            match self.next_loc(&mut loc) {
                Ok(()) => continue,
                Err(Error::NotFound) => break,
                Err(e) => return Err(e),
            }
        }
        match found {
            Some(mut loc) => self.read_loc(&mut loc, buf),
            None => Err(Error::NotFound),
        }
    }
}
