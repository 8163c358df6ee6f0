//! Stage loader boot-selection scenarios beyond the in-module unit
//! tests: chaining into LDR specifically, and falling through past a
//! corrupted SWPR to LDR when RUN_0 is also absent.

use common::test_flash::RamFlash;
use zb8::image;
use zb8::stage_loader::{select_stage, Stage, StageOffsets};

fn write_dummy_image(flash: &mut RamFlash, base: u32, run_offset: u32, body: &[u8]) {
    let hdr_size = image::FIXED_HEADER_SIZE + image::VERIFY_TRAILER_SIZE + 64;
    let mut region = heapless::Vec::<u8, 512>::new();
    region.extend_from_slice(&image::FSL_MAGIC.to_be_bytes()).unwrap();
    region.extend_from_slice(&0u32.to_le_bytes()).unwrap();
    region.extend_from_slice(&(hdr_size as u16).to_le_bytes()).unwrap();
    region.push(0).unwrap();
    region.push(64).unwrap();
    region.extend_from_slice(&(body.len() as u32).to_le_bytes()).unwrap();
    region.extend_from_slice(&run_offset.to_le_bytes()).unwrap();
    region.push(1).unwrap();
    region.push(0).unwrap();
    region.extend_from_slice(&0u16.to_le_bytes()).unwrap();
    region.extend_from_slice(&0u32.to_le_bytes()).unwrap();
    region.extend_from_slice(&0u32.to_le_bytes()).unwrap();

    let trailer_off = region.len();
    region.extend_from_slice(&image::VERI_MAGIC.to_be_bytes()).unwrap();

    let mut digest = common::crc::Crc32Digest::new();
    digest.update(&region[..trailer_off + 4]);
    digest.update(body);
    let crc = digest.finalize();

    region.extend_from_slice(&crc.to_le_bytes()).unwrap();
    region.extend_from_slice(&[0u8; 64]).unwrap();

    flash.write(base, &region).unwrap();
    flash.write(base + hdr_size as u32, body).unwrap();
}

#[test]
fn run0_self_upgrade_into_ldr_leaves_a_bootable_copy_at_ldr() {
    let mut flash = RamFlash::new(4096, 16, 16).with_unaligned_write();
    write_dummy_image(&mut flash, 0, 2048, b"newldr!!");
    let offsets = StageOffsets { run0: 0, swpr: 1024, ldr: 2048 };

    let target = select_stage(&mut flash, offsets).unwrap();
    assert_eq!(target.stage, Stage::Ldr);

    let promoted = image::verify_stage_crc32(&mut flash, 2048).unwrap().unwrap();
    assert_eq!(promoted.body_size, 8);
}

#[test]
fn falls_through_a_corrupted_swpr_to_a_good_ldr_when_run0_is_absent() {
    let mut flash = RamFlash::new(4096, 16, 16).with_unaligned_write();
    write_dummy_image(&mut flash, 1024, 1024, b"swprbody");
    write_dummy_image(&mut flash, 2048, 2048, b"ldrbody!");
    // Flip one body byte in SWPR so its trailer CRC32 no longer matches.
    let mut byte = [0u8; 1];
    flash.read(1024 + image::FIXED_HEADER_SIZE as u32 + image::VERIFY_TRAILER_SIZE as u32 + 64, &mut byte).unwrap();
    byte[0] ^= 0xFF;
    flash
        .write(1024 + image::FIXED_HEADER_SIZE as u32 + image::VERIFY_TRAILER_SIZE as u32 + 64, &byte)
        .unwrap();

    let offsets = StageOffsets { run0: 0, swpr: 1024, ldr: 2048 };
    let target = select_stage(&mut flash, offsets).unwrap();
    assert_eq!(target.stage, Stage::Ldr);
}
