//! Classic swap lifecycle (spec.md §4.4, §8): resumability across a
//! simulated reboot, and the current (placeholder-root-key) behavior of
//! failing closed at the signature check before any `RUN` sector is
//! touched.
//!
//! `SlotArea::sector_size` is `move_.offset - run_.offset`, so a
//! physically non-overlapping layout (MOVE placed right after RUN) puts
//! `sector_count` at 1 — these areas are each a single erase/copy unit,
//! matching `common::slotmap`'s own worked example.

use common::test_flash::RamFlash;
use zb8::cmdlog::{Command, CommandLog, Phase, CMD1_SWAP};
use zb8::swap::{decide_resume_action, BootKeys, ResumeAction, SwapEngine};
use zb8::{Error, SlotArea, SlotView};

const SECTOR_SIZE: u32 = 256;

fn classic_area() -> SlotArea {
    SlotArea {
        name: "app0",
        run: SlotView { offset: 0, size: SECTOR_SIZE },
        move_: SlotView { offset: SECTOR_SIZE, size: SECTOR_SIZE },
        upgrade: SlotView { offset: SECTOR_SIZE * 2, size: SECTOR_SIZE },
        swpstat: SlotView { offset: SECTOR_SIZE * 3, size: 64 },
    }
}

fn boot_keys() -> BootKeys {
    BootKeys { ecdh_priv: [0u8; 32] }
}

fn fill_sector(flash: &mut RamFlash, offset: u32, byte: u8) {
    flash.write(offset, &[byte; SECTOR_SIZE as usize]).unwrap();
}

#[test]
fn classic_swap_fails_closed_at_signature_check_leaving_run2mov_backup_intact() {
    let area = classic_area();
    assert_eq!(area.sector_count(), 1);
    let mut flash = RamFlash::new(SECTOR_SIZE * 4, 16, 16).with_unaligned_write();
    fill_sector(&mut flash, area.run.offset, 0xA1);
    // UPGRADE is left erased: `read_image_info` will reject the missing
    // magic outright, before any cryptography even runs.

    let mut log = CommandLog::mount(&mut flash, area.swpstat, 16).unwrap();
    let mut engine = SwapEngine::new(&area);
    let result = engine.run_classic(&mut flash, &mut log, &boot_keys(), ResumeAction::NoSwapInProgress);
    assert_eq!(result, Err(Error::InvalidImage));

    // RUN2MOV's only sector must have been backed up to MOVE before the
    // UPG2RUN validation step ran and failed.
    let mut buf = [0u8; SECTOR_SIZE as usize];
    flash.read(area.move_.offset, &mut buf).unwrap();
    assert!(buf.iter().all(|&b| b == 0xA1));

    // The log must show RUN2MOV's sector 0 as the last durable command.
    let last = log.last().unwrap();
    assert_eq!(last, Command { cmd1: CMD1_SWAP, phase: Phase::Run2Mov, sector_index: 0 });
}

#[test]
fn resuming_after_run2mov_completed_skips_straight_to_upg2run() {
    let area = classic_area();
    let mut flash = RamFlash::new(SECTOR_SIZE * 4, 16, 16).with_unaligned_write();
    fill_sector(&mut flash, area.run.offset, 0xB1);
    // Simulate RUN2MOV having already finished on a prior boot: the
    // backup already sits in MOVE, and the log already durably recorded
    // it before the reboot that's being resumed from.
    fill_sector(&mut flash, area.move_.offset, 0xB1);
    let mut log = CommandLog::mount(&mut flash, area.swpstat, 16).unwrap();
    log.append(&mut flash, Command { cmd1: CMD1_SWAP, phase: Phase::Run2Mov, sector_index: 0 }).unwrap();

    let resume = decide_resume_action(&mut flash, &area, log.last()).unwrap();
    assert_eq!(resume, ResumeAction::Resume { phase: Phase::Run2Mov, sector_index: 0 });

    let erases_before = flash.erase_count;
    let mut engine = SwapEngine::new(&area);
    let result = engine.run_classic(&mut flash, &mut log, &boot_keys(), resume);
    // UPGRADE is still erased, so UPG2RUN's validation still fails
    // closed — the point is that RUN2MOV's single sector was *not*
    // re-copied (which would have shown up as an extra erase of MOVE).
    assert_eq!(result, Err(Error::InvalidImage));
    assert_eq!(flash.erase_count, erases_before);
}

#[test]
fn a_swpend_log_means_nothing_to_resume() {
    let area = classic_area();
    let mut flash = RamFlash::new(SECTOR_SIZE * 4, 16, 16).with_unaligned_write();
    let mut log = CommandLog::mount(&mut flash, area.swpstat, 16).unwrap();
    log.append(&mut flash, Command { cmd1: CMD1_SWAP, phase: Phase::SwpEnd, sector_index: 0 }).unwrap();
    // RUN is still erased here, so it can't be read back as a valid
    // image; treated as "nothing to resume" the same as a missing log.
    assert_eq!(decide_resume_action(&mut flash, &area, log.last()).unwrap(), ResumeAction::NoSwapInProgress);
}

#[test]
fn inplace_swap_with_no_swpstat_runs_unpersisted_and_fails_closed() {
    let inplace = SlotArea {
        name: "boot",
        run: SlotView { offset: 0, size: SECTOR_SIZE },
        move_: SlotView { offset: SECTOR_SIZE, size: SECTOR_SIZE },
        upgrade: SlotView { offset: SECTOR_SIZE, size: SECTOR_SIZE },
        swpstat: SlotView { offset: 0, size: 0 },
    };
    assert!(inplace.is_inplace());
    let mut flash = RamFlash::new(SECTOR_SIZE * 2, 16, 16).with_unaligned_write();
    fill_sector(&mut flash, inplace.run.offset, 0xC1);

    let mut engine = SwapEngine::new(&inplace);
    let result = engine.run_unpersisted(&mut flash, &boot_keys());
    assert_eq!(result, Err(Error::InvalidImage));
    // RUN itself is untouched since validation fails before any sector
    // copy starts.
    let mut buf = [0u8; SECTOR_SIZE as usize];
    flash.read(inplace.run.offset, &mut buf).unwrap();
    assert!(buf.iter().all(|&b| b == 0xC1));
}
