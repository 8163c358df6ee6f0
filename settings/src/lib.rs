//! Settings key/value façade layered atop `sfcb` (spec.md §4.2). Each
//! setting is one SFCB entry with `id = 0xFFFF` and payload `name "="
//! value`; `load` dispatches only the latest non-tombstoned entry per
//! name to the caller's handler.
#![cfg_attr(not(test), no_std)]

use common::flash::Flash;
use common::Error;
use heapless::{String, Vec};
use sfcb::{Compressor, Sfcb};

/// The reserved SFCB entry id under which every setting is stored.
pub const SETTINGS_ID: u16 = 0xFFFF;

/// Upper bound on a setting's name, matching the `name=value` framing.
pub const MAX_NAME_LEN: usize = 32;
/// Upper bound on a setting's value.
pub const MAX_VALUE_LEN: usize = 96;
/// Upper bound on distinct settings tracked by one `load`/compaction
/// pass. A bare-metal deployment sizes this to its known key set.
pub const MAX_ENTRIES: usize = 64;

fn split_name_value(payload: &[u8]) -> Option<(&str, &[u8])> {
    let eq = payload.iter().position(|&b| b == b'=')?;
    let name = core::str::from_utf8(&payload[..eq]).ok()?;
    Some((name, &payload[eq + 1..]))
}

/// Writes `name=value` as one SFCB entry.
pub fn save_one<F: Flash>(fs: &mut Sfcb<'_, F>, name: &str, value: &[u8]) -> Result<(), Error<F::Error>> {
    let mut payload: Vec<u8, { MAX_NAME_LEN + 1 + MAX_VALUE_LEN }> = Vec::new();
    payload.extend_from_slice(name.as_bytes()).map_err(|_| Error::InvalidArgument)?;
    payload.push(b'=').map_err(|_| Error::InvalidArgument)?;
    payload.extend_from_slice(value).map_err(|_| Error::InvalidArgument)?;
    fs.write(SETTINGS_ID, &payload)
}

/// Tombstones `name`: a later `load` will not dispatch it.
pub fn delete<F: Flash>(fs: &mut Sfcb<'_, F>, name: &str) -> Result<(), Error<F::Error>> {
    common::debug!("settings: delete {}", name);
    save_one(fs, name, &[])
}

struct Record {
    name: String<MAX_NAME_LEN>,
    value: Vec<u8, MAX_VALUE_LEN>,
}

/// Collects every settings entry, oldest to newest, bounded by
/// `MAX_ENTRIES`.
fn collect<F: Flash>(fs: &mut Sfcb<'_, F>) -> Result<Vec<Record, MAX_ENTRIES>, Error<F::Error>> {
    let mut records: Vec<Record, MAX_ENTRIES> = Vec::new();
    let mut loc = match fs.first_loc() {
        Ok(loc) => loc,
        Err(Error::NotFound) => return Ok(records),
        Err(e) => return Err(e),
    };
    loop {
        if loc.id() == SETTINGS_ID {
            let mut buf = [0u8; MAX_NAME_LEN + 1 + MAX_VALUE_LEN];
            let n = fs.read_loc(&mut loc, &mut buf)?;
            if let Some((name, value)) = split_name_value(&buf[..n]) {
                if let Ok(name) = String::try_from(name) {
                    if let Ok(value) = Vec::from_slice(value) {
                        // capacity errors are dropped: malformed/oversized
                        // records behave as if never written.
                        let _ = records.push(Record { name, value });
                    }
                }
            }
        }
        match fs.next_loc(&mut loc) {
            Ok(()) => continue,
            Err(Error::NotFound) => break,
            Err(e) => return Err(e),
        }
    }
    Ok(records)
}

/// Iterates all entries oldest-to-newest and dispatches, for each
/// distinct name, only its latest entry — and only if that entry is not
/// a tombstone (`value.is_empty()`).
pub fn load<F: Flash>(fs: &mut Sfcb<'_, F>, mut handler: impl FnMut(&str, &[u8])) -> Result<(), Error<F::Error>> {
    let records = collect(fs)?;
    for (i, record) in records.iter().enumerate() {
        let has_later = records[i + 1..].iter().any(|r| r.name == record.name);
        if has_later {
            continue;
        }
        if record.value.is_empty() {
            continue;
        }
        handler(&record.name, &record.value);
    }
    Ok(())
}

/// Garbage collector for the settings façade: on rotation, re-appends
/// only the latest entry for each distinct name found in the sector
/// being reclaimed, dropping superseded and tombstoned ones.
pub struct SettingsCompressor;

impl<F: Flash> Compressor<F> for SettingsCompressor {
    fn compress(&mut self, fs: &mut Sfcb<'_, F>, target_sector: u16) -> Result<(), Error<F::Error>> {
        common::debug!("settings: compacting sector {}", target_sector);
        let records = collect(fs)?;
        let mut kept: Vec<String<MAX_NAME_LEN>, MAX_ENTRIES> = Vec::new();

        let mut loc = match fs.first_loc() {
            Ok(loc) => loc,
            Err(Error::NotFound) => return Ok(()),
            Err(e) => return Err(e),
        };
        loop {
            if loc.id() == SETTINGS_ID {
                // Only entries physically in the target sector need
                // saving; everything else already lives elsewhere.
                if loc.sector() == target_sector {
                    let mut buf = [0u8; MAX_NAME_LEN + 1 + MAX_VALUE_LEN];
                    let n = fs.read_loc(&mut loc, &mut buf)?;
                    if let Some((name, _value)) = split_name_value(&buf[..n]) {
                        let is_latest_overall = records
                            .iter()
                            .rposition(|r| r.name == name)
                            .map(|idx| &records[idx].value)
                            .map(|v| !v.is_empty())
                            .unwrap_or(false);
                        if is_latest_overall && kept.iter().all(|k| k.as_str() != name) {
                            fs.copy_loc(&loc)?;
                            let _ = kept.push(String::try_from(name).unwrap_or_default());
                        }
                    }
                }
            }
            match fs.next_loc(&mut loc) {
                Ok(()) => continue,
                Err(Error::NotFound) => break,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}
