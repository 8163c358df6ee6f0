//! Sketch of a DFU-over-BLE GATT consumer (spec.md §6): the
//! characteristic layout under one service UUID, with writes to the
//! firmware-data characteristic fed straight into [`zb8::dfu::DfuReceiver`].
//! This is a sketch of the wire layout, not a BLE stack — no radio, no
//! peripheral role, no notifications; a real port wires `on_write` up to
//! whatever GATT server the target's BLE host stack exposes.

use common::test_flash::RamFlash;
use zb8::dfu::DfuReceiver;
use zb8::{image, SlotArea, SlotView};

/// Service UUID carrying the three DFU characteristics below.
pub const SERVICE_UUID: &str = "23A07C4E-9E3B-4379-BD0D-2B03381274A4";

/// Write-only: successive chunks of the incoming image, handed straight
/// to [`DfuReceiver::push`].
pub const CHAR_FIRMWARE_DATA: u16 = 0x0001;
/// Write-only: a single byte, non-zero requests a reboot once the
/// current transfer's final block has been flushed.
pub const CHAR_REBOOT: u16 = 0x0002;
/// Write-only: selects which slot area the next transfer targets, by
/// index into the board's slot map.
pub const CHAR_MODE: u16 = 0x0003;

/// Dispatches incoming GATT writes to a `DfuReceiver`, tracking the
/// reboot request state a real implementation would hand off to the
/// stage loader on its next boot.
struct GattDfuConsumer<'a> {
    areas: &'a [SlotArea],
    receiver: DfuReceiver<'a, { zb8::dfu::DEFAULT_BLOCK_SIZE }>,
    reboot_requested: bool,
}

impl<'a> GattDfuConsumer<'a> {
    fn new(areas: &'a [SlotArea]) -> Self {
        GattDfuConsumer { areas, receiver: DfuReceiver::new(areas), reboot_requested: false }
    }

    /// Handles one GATT write, as if dispatched by the host's BLE stack.
    fn on_write<F: common::flash::Flash>(&mut self, flash: &mut F, characteristic: u16, value: &[u8]) {
        match characteristic {
            CHAR_FIRMWARE_DATA => {
                self.receiver.push(flash, value).expect("dfu chunk");
            }
            CHAR_REBOOT => {
                if value.first().copied().unwrap_or(0) != 0 {
                    self.receiver.finish(flash).expect("flush final dfu block");
                    self.reboot_requested = true;
                }
            }
            CHAR_MODE => {
                let _ = self.areas; // a real consumer would use this to pick the target area
            }
            _ => {}
        }
    }
}

/// Builds a well-formed `header + body` transfer the way a phone-side
/// DFU app would assemble one before streaming it chunk by chunk over
/// `CHAR_FIRMWARE_DATA`.
fn build_transfer(dest: u32, run_offset: u32, body: &[u8]) -> heapless::Vec<u8, 2048> {
    let hdr_size = image::FIXED_HEADER_SIZE + image::VERIFY_TRAILER_SIZE + 64;
    let mut region = heapless::Vec::<u8, 2048>::new();
    region.extend_from_slice(&image::FSL_MAGIC.to_be_bytes()).unwrap();
    region.extend_from_slice(&dest.to_le_bytes()).unwrap();
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

    region.extend_from_slice(body).unwrap();
    region
}

fn main() {
    let areas = [SlotArea {
        name: "app0",
        run: SlotView { offset: 0, size: 4096 },
        move_: SlotView { offset: 4096, size: 4096 },
        upgrade: SlotView { offset: 8192, size: 4096 },
        swpstat: SlotView { offset: 12288, size: 256 },
    }];
    let mut flash = RamFlash::new(12288 + 256, 256, 16).with_unaligned_write();

    let mut consumer = GattDfuConsumer::new(&areas);
    println!("advertising service {SERVICE_UUID}");

    let transfer = build_transfer(areas[0].upgrade.offset, 0x9000, &[0xABu8; 1500]);
    for chunk in transfer.chunks(180) {
        consumer.on_write(&mut flash, CHAR_FIRMWARE_DATA, chunk);
    }
    consumer.on_write(&mut flash, CHAR_REBOOT, &[1]);

    println!("wrote {} bytes, reboot requested: {}", consumer.receiver.written(), consumer.reboot_requested);
}
