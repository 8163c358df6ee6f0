//! DFU Receiver (spec.md §4.6): buffers incoming upload bytes into a
//! fixed-size block, and on the first full block parses the image
//! header to pick which slot area's UPGRADE view to write into.

use common::flash::Flash;
use common::slotmap::SlotArea;
use common::Error;

/// Default `DFU_BLOCK_BUF_SIZE` (spec.md §6): a power of two, sized so a
/// full image header always fits in the first block.
pub const DEFAULT_BLOCK_SIZE: usize = 512;

/// Buffers an incoming upload into `N`-byte blocks and writes them into
/// whichever slot area's UPGRADE view the header's `upload_offset`
/// names.
pub struct DfuReceiver<'a, const N: usize> {
    areas: &'a [SlotArea],
    area: Option<&'a SlotArea>,
    buf: heapless::Vec<u8, N>,
    cursor: u32,
}

impl<'a, const N: usize> DfuReceiver<'a, N> {
    pub fn new(areas: &'a [SlotArea]) -> Self {
        DfuReceiver { areas, area: None, buf: heapless::Vec::new(), cursor: 0 }
    }

    /// Total bytes written into UPGRADE so far.
    pub fn written(&self) -> u32 {
        self.cursor
    }

    /// Feeds `data` into the receiver, flushing full `N`-byte blocks to
    /// flash as they fill.
    pub fn push<F: Flash>(&mut self, flash: &mut F, mut data: &[u8]) -> Result<(), Error<F::Error>> {
        while !data.is_empty() {
            let room = N - self.buf.len();
            let take = core::cmp::min(room, data.len());
            self.buf.extend_from_slice(&data[..take]).ok().ok_or(Error::InvalidArgument)?;
            data = &data[take..];
            if self.buf.len() == N {
                self.flush_block(flash)?;
            }
        }
        Ok(())
    }

    /// Flushes whatever remains in the buffer, partial block allowed
    /// (spec.md §4.6: "final flush may be partial").
    pub fn finish<F: Flash>(&mut self, flash: &mut F) -> Result<(), Error<F::Error>> {
        if !self.buf.is_empty() {
            self.flush_block(flash)?;
        }
        Ok(())
    }

    fn flush_block<F: Flash>(&mut self, flash: &mut F) -> Result<(), Error<F::Error>> {
        if self.area.is_none() {
            self.resolve_area()?;
            let area = self.area.unwrap();
            if !area.is_inplace() {
                // Erase the verify region eagerly so a DFU transfer that
                // never completes can't leave a plausible-looking signed
                // image sitting in UPGRADE.
                flash.erase(area.upgrade.offset, area.sector_size())?;
            }
        }
        let area = self.area.ok_or(Error::InvalidImage)?;
        let sector_size = area.sector_size();

        if self.cursor % sector_size == 0 {
            flash.erase(area.upgrade.offset + self.cursor, sector_size)?;
        }

        // A trailing partial block still needs a WBS-aligned physical
        // write on devices that don't accept unaligned writes; pad with
        // the erased pattern rather than shrinking what's recorded as
        // written.
        let write_len = if flash.supports_unaligned_write() {
            self.buf.len() as u32
        } else {
            common::flash::align_up(self.buf.len() as u32, flash.write_block_size())
        };
        let mut padded = [0xFFu8; N];
        padded[..self.buf.len()].copy_from_slice(&self.buf);
        flash.write(area.upgrade.offset + self.cursor, &padded[..write_len as usize])?;
        self.cursor += self.buf.len() as u32;
        self.buf.clear();
        Ok(())
    }

    /// Parses `upload_offset` out of the buffered header bytes and picks
    /// the slot area whose UPGRADE view starts there.
    fn resolve_area<E>(&mut self) -> Result<(), Error<E>> {
        if self.buf.len() < 8 {
            return Err(Error::InvalidArgument);
        }
        let upload_offset = u32::from_le_bytes([self.buf[4], self.buf[5], self.buf[6], self.buf[7]]);
        self.area = self.areas.iter().find(|a| a.upgrade.offset == upload_offset);
        if self.area.is_none() {
            return Err(Error::InvalidImage);
        }
        Ok(())
    }
}
