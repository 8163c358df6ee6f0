//! Stage Loader (spec.md §4.5): the first code to run after reset.
//! Reads `RUN_0`'s header and verify trailer; if its CRC32 over header
//! and body checks out, its `run_offset` tells the loader what to do
//! next — jump straight in, or promote a self-upgraded `SWPR`/`LDR`
//! image out of `RUN_0` into its real slot before booting it. If
//! `RUN_0` doesn't check out, falls back to whichever of `SWPR`/`LDR`
//! passes its own verify-trailer check.
//!
//! `run_offset` here is compared directly against the well-known slot
//! base constants (`RUN_0_OFFSET`/`SWPR_OFFSET`/`LDR_OFFSET`) rather
//! than treated as a vector-table address the way ordinary application
//! images use it (see `image::read_image_info`'s `is_bootloader`
//! check) — `RUN_0`'s header encodes which role to chain into next, not
//! where its own code begins.

use common::flash::Flash;
use common::Error;

use crate::image::{self, StageHeader};

/// Which stage the loader picked to jump into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Run0,
    Swpr,
    Ldr,
}

/// Absolute flash offsets of the three candidate stages the loader may
/// chain into.
#[derive(Debug, Clone, Copy)]
pub struct StageOffsets {
    pub run0: u32,
    pub swpr: u32,
    pub ldr: u32,
}

/// Where to jump: the first byte of the chosen stage's vector table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JumpTarget {
    pub stage: Stage,
    pub vector_table: u32,
}

/// Picks the stage to boot into, performing a self-upgrade copy first
/// if `RUN_0` declares itself bound for `SWPR`/`LDR`.
pub fn select_stage<F: Flash>(flash: &mut F, offsets: StageOffsets) -> Result<JumpTarget, Error<F::Error>> {
    if let Some(run0) = image::verify_stage_crc32(flash, offsets.run0)? {
        if run0.run_offset == offsets.run0 {
            return Ok(JumpTarget { stage: Stage::Run0, vector_table: offsets.run0 + run0.hdr_size });
        }
        if run0.run_offset == offsets.swpr {
            promote(flash, offsets.run0, &run0, offsets.swpr)?;
            return Ok(JumpTarget { stage: Stage::Swpr, vector_table: offsets.swpr + run0.hdr_size });
        }
        if run0.run_offset == offsets.ldr {
            promote(flash, offsets.run0, &run0, offsets.ldr)?;
            return Ok(JumpTarget { stage: Stage::Ldr, vector_table: offsets.ldr + run0.hdr_size });
        }
    }

    for (stage, base) in [(Stage::Swpr, offsets.swpr), (Stage::Ldr, offsets.ldr)] {
        if let Some(hdr) = image::verify_stage_crc32(flash, base)? {
            return Ok(JumpTarget { stage, vector_table: base + hdr.hdr_size });
        }
    }
    Err(Error::NoFilesystem)
}

/// Copies `RUN_0`'s header+body into `dest` (its declared destination
/// slot), erasing sector-by-sector first. Used only for the bootloader's
/// own self-upgrade path (`IS_FSL`, spec.md §6).
const PROMOTE_CHUNK: usize = 64;

fn promote<F: Flash>(flash: &mut F, src_base: u32, hdr: &StageHeader, dest_base: u32) -> Result<(), Error<F::Error>> {
    let total = hdr.hdr_size + hdr.body_size;
    let page = flash.page_info(dest_base);
    let erase_len = common::flash::align_up(total, page.size);
    flash.erase(dest_base, erase_len)?;

    let mut buf = [0u8; PROMOTE_CHUNK];
    let mut done = 0u32;
    while done < total {
        let chunk = core::cmp::min(total - done, PROMOTE_CHUNK as u32) as usize;
        flash.read(src_base + done, &mut buf[..chunk])?;
        flash.write(dest_base + done, &buf[..chunk])?;
        done += chunk as u32;
    }
    Ok(())
}

/// Hands control to the vector table at `target`, never returning.
/// Implementations must disable interrupts and any peripheral clocks
/// the current stage enabled, then load the stack pointer and reset
/// vector from `target.vector_table` (spec.md §4.5's "pre-jump" steps).
///
/// # Safety
/// `target.vector_table` must point at a valid vector table whose
/// first two words are the initial stack pointer and reset handler
/// address; the caller is trusted to have validated this (stage
/// loader's CRC32 check, or the swap engine's full signature check).
pub unsafe trait BootTarget {
    unsafe fn jump(vector_table: u32) -> !;
}

#[cfg(feature = "arm")]
pub struct ArmTarget;

#[cfg(feature = "arm")]
unsafe impl BootTarget for ArmTarget {
    unsafe fn jump(vector_table: u32) -> ! {
        cortex_m::interrupt::disable();
        let msp = core::ptr::read_volatile(vector_table as *const u32);
        let reset_handler = core::ptr::read_volatile((vector_table + 4) as *const u32);
        cortex_m::register::msp::write(msp);
        let entry: extern "C" fn() -> ! = core::mem::transmute(reset_handler);
        entry()
    }
}

#[cfg(feature = "riscv-target")]
pub struct RiscvTarget;

#[cfg(feature = "riscv-target")]
unsafe impl BootTarget for RiscvTarget {
    unsafe fn jump(vector_table: u32) -> ! {
        riscv::interrupt::disable();
        let reset_handler = core::ptr::read_volatile(vector_table as *const u32);
        let entry: extern "C" fn() -> ! = core::mem::transmute(reset_handler);
        entry()
    }
}
