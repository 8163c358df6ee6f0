//! Sample application for the boot-count scenario (spec.md §8 scenario
//! 1): increment a persisted counter on every boot and print it. Since
//! no hardware is wired up, each "boot" here is one pass over a
//! `RamFlash` instance kept alive across iterations of the loop below,
//! standing in for a device actually power-cycling.

use common::test_flash::RamFlash;
use sfcb::{Config, Sfcb};

const CFG: Config = Config { offset: 0, sector_size: 512, sector_cnt: 4, wbs: 8 };
const BOOT_COUNT_KEY: &str = "ps/bc";

fn read_boot_count<F: common::flash::Flash>(fs: &mut Sfcb<'_, F>) -> u32 {
    let mut count = 0u32;
    settings::load(fs, |name, value| {
        if name == BOOT_COUNT_KEY && value.len() == 4 {
            count = u32::from_le_bytes([value[0], value[1], value[2], value[3]]);
        }
    })
    .expect("settings load");
    count
}

fn main() {
    let mut flash = RamFlash::new(512 * 4, 512, 8);
    Sfcb::format(&mut flash, CFG).expect("format");
    let mut fs = Sfcb::mount(flash, CFG).expect("mount");
    let mut compressor = settings::SettingsCompressor;
    fs.set_compressor(&mut compressor);

    for _ in 0..20 {
        let mut count = read_boot_count(&mut fs);
        count += 1;
        settings::save_one(&mut fs, BOOT_COUNT_KEY, &count.to_le_bytes()).expect("save boot count");
        println!("boot #{count}");
    }
}
