//! Image Descriptor Reader (spec.md §4.3): parses a `zb_fsl_hdr`, checks
//! its verify trailer, validates its ECDSA-P256 signature, checks the
//! body hash, and walks its dependency TLVs.

use common::flash::Flash;
use common::tlv::{find_tlv, step_tlv};
use common::Error;

use crate::crypto::{self, HASH_BYTES, PUBKEY_BYTES, SIGNATURE_BYTES};

/// `"FSLH"` read as a big-endian `u32`.
pub const FSL_MAGIC: u32 = 0x4653_4C48;
/// `"VERI"` read as a big-endian `u32`.
pub const VERI_MAGIC: u32 = 0x5645_5249;

pub const TLV_BODY_HASH: u16 = 0x0100;
pub const TLV_EPHEMERAL_PUBKEY: u16 = 0x0200;
pub const TLV_DEPENDENCY: u16 = 0x0300;

/// Fixed size of `zb_fsl_hdr` itself, before the TLV region.
pub const FIXED_HEADER_SIZE: usize = 32;
/// Size of the verify trailer (`magic` + `crc32`).
pub const VERIFY_TRAILER_SIZE: usize = 8;
/// Upper bound on `hdr_size` this reader will buffer on the stack.
pub const MAX_HEADER_SIZE: usize = 512;

/// Offset (relative to `run_offset - hdr_size`) identifying the
/// bootloader's own run slot; any image whose computed header offset
/// equals this is treated as the bootloader (spec.md §4.3 step 3).
pub const BOOT_AREA_OFFSET: u32 = 0;

/// Packed `major.minor.rev` triple, the unit `ver_min`/`ver_max` compare
/// over. `build` is informational only and excluded from ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Version {
    pub major: u8,
    pub minor: u8,
    pub rev: u16,
}

impl Version {
    pub const fn pack(self) -> u32 {
        ((self.major as u32) << 24) | ((self.minor as u32) << 16) | (self.rev as u32)
    }

    pub const fn unpack(packed: u32) -> Self {
        Version {
            major: (packed >> 24) as u8,
            minor: (packed >> 16) as u8,
            rev: packed as u16,
        }
    }
}

/// One `TLV_DEPENDENCY` entry: another image's run slot must report a
/// version within `[ver_min, ver_max]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dependency {
    pub img_offset: u32,
    pub ver_min: u32,
    pub ver_max: u32,
}

/// Outcome of reading and validating one image header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageInfo {
    pub version: Version,
    pub build: u32,
    pub body_size: u32,
    pub run_offset: u32,
    pub is_bootloader: bool,
    /// Whether this header's own verify trailer already carries a valid
    /// `VERI` magic and CRC32 (spec.md §4.3 step 2) — distinct from
    /// whether the slot it lives in happens to be RUN. A missing or
    /// stale trailer is not a validation failure on its own; it only
    /// means this image has not yet been confirmed.
    pub confirmed: bool,
    /// Size of the fixed header + TLV region + verify trailer + signature,
    /// i.e. the offset of this image's body relative to its own base.
    /// Doubles as `enc_start` (spec.md §4.4) when `ephemeral_pubkey` is
    /// present: AES-CTR only ever applies from this offset onward.
    pub hdr_size: u32,
    pub ephemeral_pubkey: Option<[u8; PUBKEY_BYTES]>,
    pub dependencies: heapless::Vec<Dependency, 8>,
}

#[derive(Clone, Copy)]
struct FixedHeader {
    magic: u32,
    upload_offset: u32,
    hdr_size: u16,
    sig_type: u8,
    sig_len: u8,
    body_size: u32,
    run_offset: u32,
    major: u8,
    minor: u8,
    rev: u16,
    build: u32,
}

fn decode_fixed_header(buf: &[u8; FIXED_HEADER_SIZE]) -> FixedHeader {
    FixedHeader {
        magic: u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]),
        upload_offset: u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]),
        hdr_size: u16::from_le_bytes([buf[8], buf[9]]),
        sig_type: buf[10],
        sig_len: buf[11],
        body_size: u32::from_le_bytes([buf[12], buf[13], buf[14], buf[15]]),
        run_offset: u32::from_le_bytes([buf[16], buf[17], buf[18], buf[19]]),
        major: buf[20],
        minor: buf[21],
        rev: u16::from_le_bytes([buf[22], buf[23]]),
        build: u32::from_le_bytes([buf[24], buf[25], buf[26], buf[27]]),
        // buf[28..32] is `pad`.
    }
}

/// Header-only probe: does `base` hold something that looks like an
/// image at all? No signature, hash, or dependency checking — used by
/// the swap engine's inplace fast path to tell "empty" from "an image
/// sits here worth fully validating" (spec.md supplemented feature,
/// `zb_slt_has_img_hdr`).
pub fn probe_header<F: Flash>(flash: &mut F, base: u32) -> Result<bool, Error<F::Error>> {
    let mut buf = [0u8; FIXED_HEADER_SIZE];
    flash.read(base, &mut buf)?;
    Ok(decode_fixed_header(&buf).magic == FSL_MAGIC)
}

/// Result of a stage-loader CRC32-only check: enough to locate and jump
/// to the image, without the cost of a full signature/body-hash pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageHeader {
    pub run_offset: u32,
    pub hdr_size: u32,
    pub body_size: u32,
}

/// Cheap header+body check for the stage loader's boot-time path: magic
/// and verify-trailer CRC32 only (streamed over header and body, per
/// `zb_fsl_crc32`), no signature or per-TLV body hash. Returns `None` if
/// either check fails — the caller falls back to the next candidate
/// stage rather than treating this as fatal (spec.md §4.5).
pub fn verify_stage_crc32<F: Flash>(flash: &mut F, base: u32) -> Result<Option<StageHeader>, Error<F::Error>> {
    let mut fixed_buf = [0u8; FIXED_HEADER_SIZE];
    flash.read(base, &mut fixed_buf)?;
    let hdr = decode_fixed_header(&fixed_buf);
    if hdr.magic != FSL_MAGIC || hdr.sig_len as usize != SIGNATURE_BYTES {
        return Ok(None);
    }
    let hdr_size = hdr.hdr_size as usize;
    if hdr_size > MAX_HEADER_SIZE || hdr_size < FIXED_HEADER_SIZE + VERIFY_TRAILER_SIZE + hdr.sig_len as usize {
        return Ok(None);
    }

    let mut region = [0u8; MAX_HEADER_SIZE];
    let region = &mut region[..hdr_size];
    flash.read(base, region)?;

    let trailer_off = hdr_size - hdr.sig_len as usize - VERIFY_TRAILER_SIZE;
    let trailer = &region[trailer_off..trailer_off + VERIFY_TRAILER_SIZE];
    let trailer_magic = u32::from_be_bytes([trailer[0], trailer[1], trailer[2], trailer[3]]);
    if trailer_magic != VERI_MAGIC {
        return Ok(None);
    }
    let stored_crc = u32::from_le_bytes([trailer[4], trailer[5], trailer[6], trailer[7]]);

    let mut digest = common::crc::Crc32Digest::new();
    digest.update(&region[..trailer_off + 4]);
    let mut buf = [0u8; 64];
    let mut remaining = hdr.body_size;
    let mut off = base + hdr_size as u32;
    while remaining > 0 {
        let chunk = core::cmp::min(remaining, buf.len() as u32) as usize;
        flash.read(off, &mut buf[..chunk])?;
        digest.update(&buf[..chunk]);
        off += chunk as u32;
        remaining -= chunk as u32;
    }
    if stored_crc != digest.finalize() {
        return Ok(None);
    }
    Ok(Some(StageHeader { run_offset: hdr.run_offset, hdr_size: hdr_size as u32, body_size: hdr.body_size }))
}

/// Reads and fully validates the image header at `base`. `self_offset`
/// identifies this image's own RUN slot, used only to spot a
/// self-referential dependency TLV (see below).
///
/// The verify trailer (magic + CRC32 over header-prefix and body) is not
/// itself a pass/fail gate: per spec.md §4.3 step 2, a missing or stale
/// trailer just means the image hasn't been confirmed yet, reflected in
/// `ImageInfo::confirmed`. An unconfirmed image's self-referential
/// dependency (`dep.img_offset == self_offset`) has `ver_min` forced up
/// to `ver_max`, so a swap cannot be used to silently re-apply an older
/// signed image over a newer one once that image confirms itself.
pub fn read_image_info<F: Flash>(
    flash: &mut F,
    base: u32,
    self_offset: u32,
) -> Result<ImageInfo, Error<F::Error>> {
    let mut fixed_buf = [0u8; FIXED_HEADER_SIZE];
    flash.read(base, &mut fixed_buf)?;
    let hdr = decode_fixed_header(&fixed_buf);

    if hdr.magic != FSL_MAGIC {
        common::debug!("image: bad magic at offset {}", base);
        return Err(Error::InvalidImage);
    }
    if hdr.sig_len as usize != SIGNATURE_BYTES {
        common::debug!("image: unexpected sig_len at offset {}", base);
        return Err(Error::InvalidImage);
    }
    let hdr_size = hdr.hdr_size as usize;
    if hdr_size > MAX_HEADER_SIZE || hdr_size < FIXED_HEADER_SIZE + VERIFY_TRAILER_SIZE + hdr.sig_len as usize {
        common::debug!("image: hdr_size out of bounds at offset {}", base);
        return Err(Error::InvalidImage);
    }

    let mut region = [0u8; MAX_HEADER_SIZE];
    let region = &mut region[..hdr_size];
    flash.read(base, region)?;

    // Verify trailer: magic + crc32 over the header prefix and the full
    // body, immediately preceding the signature. Streamed the same way
    // `verify_stage_crc32` does, since both read the same stamped field.
    let trailer_off = hdr_size - hdr.sig_len as usize - VERIFY_TRAILER_SIZE;
    let trailer = &region[trailer_off..trailer_off + VERIFY_TRAILER_SIZE];
    let trailer_magic = u32::from_be_bytes([trailer[0], trailer[1], trailer[2], trailer[3]]);
    let stored_crc = u32::from_le_bytes([trailer[4], trailer[5], trailer[6], trailer[7]]);
    let mut digest = common::crc::Crc32Digest::new();
    digest.update(&region[..trailer_off + 4]);
    let mut crc_buf = [0u8; 64];
    let mut remaining = hdr.body_size;
    let mut off = base + hdr_size as u32;
    while remaining > 0 {
        let chunk = core::cmp::min(remaining, crc_buf.len() as u32) as usize;
        flash.read(off, &mut crc_buf[..chunk])?;
        digest.update(&crc_buf[..chunk]);
        off += chunk as u32;
        remaining -= chunk as u32;
    }
    let confirmed = trailer_magic == VERI_MAGIC && stored_crc == digest.finalize();
    if !confirmed {
        common::debug!("image: not yet confirmed at offset {}", base);
    }

    let is_bootloader = hdr.run_offset.wrapping_sub(hdr_size as u32) == BOOT_AREA_OFFSET;

    // The verify trailer sits between the signed region and the signature
    // itself, deliberately excluded from what's hashed: it's the one field
    // the bootloader rewrites post-signing (see `confirm`), the same way
    // an "image ok" byte sits outside a protected TLV area elsewhere.
    let sig_start = hdr_size - hdr.sig_len as usize;
    let digest = crypto::hash(&region[..trailer_off]);
    let mut signature = [0u8; SIGNATURE_BYTES];
    signature.copy_from_slice(&region[sig_start..hdr_size]);
    if !crypto::verify_against_roots(&digest, &signature) {
        common::debug!("image: signature verification failed at offset {}", base);
        return Err(Error::InvalidImage);
    }

    let tlv_region = &region[FIXED_HEADER_SIZE..trailer_off];

    if let Some(hash_tlv) = find_tlv(tlv_region, TLV_BODY_HASH, HASH_BYTES) {
        let mut body_hash = [0u8; HASH_BYTES];
        body_hash.copy_from_slice(hash_tlv.value);
        let actual = hash_body(flash, base + hdr_size as u32, hdr.body_size)?;
        if actual != body_hash {
            common::debug!("image: body hash mismatch at offset {}", base);
            return Err(Error::InvalidImage);
        }
    }

    let ephemeral_pubkey = find_tlv(tlv_region, TLV_EPHEMERAL_PUBKEY, PUBKEY_BYTES).map(|t| {
        let mut key = [0u8; PUBKEY_BYTES];
        key.copy_from_slice(t.value);
        key
    });

    let mut dependencies: heapless::Vec<Dependency, 8> = heapless::Vec::new();
    let mut off = 0usize;
    while let Some(entry) = step_tlv(tlv_region, &mut off) {
        if entry.ty != TLV_DEPENDENCY || entry.value.len() != 12 {
            continue;
        }
        let img_offset = u32::from_le_bytes([entry.value[0], entry.value[1], entry.value[2], entry.value[3]]);
        let mut ver_min = u32::from_le_bytes([entry.value[4], entry.value[5], entry.value[6], entry.value[7]]);
        let ver_max = u32::from_le_bytes([entry.value[8], entry.value[9], entry.value[10], entry.value[11]]);
        if !confirmed && img_offset == self_offset {
            ver_min = ver_max;
        }
        let _ = dependencies.push(Dependency { img_offset, ver_min, ver_max });
    }

    Ok(ImageInfo {
        version: Version { major: hdr.major, minor: hdr.minor, rev: hdr.rev },
        build: hdr.build,
        body_size: hdr.body_size,
        run_offset: hdr.run_offset,
        is_bootloader,
        confirmed,
        hdr_size: hdr_size as u32,
        ephemeral_pubkey,
        dependencies,
    })
}

/// Stamps a fresh `VERI` trailer (magic + CRC32 over the current header
/// prefix and body) onto the image at `base` (spec.md §4.4 FINALISE:
/// "stamp the VERI trailer on the new RUN so the stage loader accepts it
/// immediately"). The trailer sits outside the ECDSA-signed region (see
/// `read_image_info`), so rewriting it here never invalidates the
/// image's signature.
pub fn confirm<F: Flash>(flash: &mut F, base: u32) -> Result<(), Error<F::Error>> {
    let mut fixed_buf = [0u8; FIXED_HEADER_SIZE];
    flash.read(base, &mut fixed_buf)?;
    let hdr = decode_fixed_header(&fixed_buf);
    if hdr.magic != FSL_MAGIC {
        return Err(Error::InvalidImage);
    }
    let hdr_size = hdr.hdr_size as usize;
    let trailer_off = hdr_size - hdr.sig_len as usize - VERIFY_TRAILER_SIZE;

    let mut prefix_buf = [0u8; MAX_HEADER_SIZE];
    let prefix = &mut prefix_buf[..trailer_off];
    flash.read(base, prefix)?;

    let mut digest = common::crc::Crc32Digest::new();
    digest.update(prefix);
    digest.update(&VERI_MAGIC.to_be_bytes());
    let mut buf = [0u8; 64];
    let mut remaining = hdr.body_size;
    let mut off = base + hdr_size as u32;
    while remaining > 0 {
        let chunk = core::cmp::min(remaining, buf.len() as u32) as usize;
        flash.read(off, &mut buf[..chunk])?;
        digest.update(&buf[..chunk]);
        off += chunk as u32;
        remaining -= chunk as u32;
    }
    let crc = digest.finalize();

    let mut trailer = [0u8; VERIFY_TRAILER_SIZE];
    trailer[0..4].copy_from_slice(&VERI_MAGIC.to_be_bytes());
    trailer[4..8].copy_from_slice(&crc.to_le_bytes());

    if flash.supports_unaligned_write() {
        flash.write(base + trailer_off as u32, &trailer)?;
    } else {
        let wbs = flash.write_block_size();
        let aligned_off = common::flash::align_down(trailer_off as u32, wbs);
        let end = common::flash::align_up((trailer_off + VERIFY_TRAILER_SIZE) as u32, wbs);
        let mut chunk_buf = [0u8; MAX_HEADER_SIZE];
        let chunk = &mut chunk_buf[..(end - aligned_off) as usize];
        flash.read(base + aligned_off, chunk)?;
        let rel = (trailer_off as u32 - aligned_off) as usize;
        chunk[rel..rel + VERIFY_TRAILER_SIZE].copy_from_slice(&trailer);
        flash.write(base + aligned_off, chunk)?;
    }
    common::debug!("image: confirmed at offset {}", base);
    Ok(())
}

fn hash_body<F: Flash>(flash: &mut F, body_offset: u32, body_size: u32) -> Result<[u8; HASH_BYTES], Error<F::Error>> {
    let mut hasher = crypto::HashStream::new();
    let mut buf = [0u8; 64];
    let mut remaining = body_size;
    let mut off = body_offset;
    while remaining > 0 {
        let chunk = core::cmp::min(remaining, buf.len() as u32) as usize;
        flash.read(off, &mut buf[..chunk])?;
        hasher.update(&buf[..chunk]);
        off += chunk as u32;
        remaining -= chunk as u32;
    }
    Ok(hasher.finalize())
}

/// Checks whether a dependency is currently satisfied by reading the
/// version at `dep.img_offset` (another slot's RUN header, or a stage
/// loader slot). A region with no valid `FSLH` header (erased or never
/// written) is treated as satisfied: it cannot be checked and must not
/// block a swap that doesn't target it.
pub fn dependency_satisfied<F: Flash>(flash: &mut F, dep: &Dependency) -> Result<bool, Error<F::Error>> {
    let mut buf = [0u8; FIXED_HEADER_SIZE];
    flash.read(dep.img_offset, &mut buf)?;
    let hdr = decode_fixed_header(&buf);
    if hdr.magic != FSL_MAGIC {
        return Ok(true);
    }
    let version = Version { major: hdr.major, minor: hdr.minor, rev: hdr.rev }.pack();
    Ok(version >= dep.ver_min && version <= dep.ver_max)
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::test_flash::RamFlash;

    fn build_signed_image(
        flash: &mut RamFlash,
        base: u32,
        body: &[u8],
        run_offset: u32,
        version: Version,
        deps: &[Dependency],
    ) {
        let mut tlv = heapless::Vec::<u8, 256>::new();
        let body_hash = crypto::hash(body);
        push_tlv(&mut tlv, TLV_BODY_HASH, &body_hash);
        for dep in deps {
            let mut v = heapless::Vec::<u8, 12>::new();
            v.extend_from_slice(&dep.img_offset.to_le_bytes()).unwrap();
            v.extend_from_slice(&dep.ver_min.to_le_bytes()).unwrap();
            v.extend_from_slice(&dep.ver_max.to_le_bytes()).unwrap();
            push_tlv(&mut tlv, TLV_DEPENDENCY, &v);
        }
        tlv.extend_from_slice(&0u16.to_le_bytes()).unwrap();
        tlv.extend_from_slice(&0u16.to_le_bytes()).unwrap();

        let sig_len = SIGNATURE_BYTES;
        let hdr_size = FIXED_HEADER_SIZE + tlv.len() + VERIFY_TRAILER_SIZE + sig_len;

        let mut region = heapless::Vec::<u8, MAX_HEADER_SIZE>::new();
        region.extend_from_slice(&FSL_MAGIC.to_be_bytes()).unwrap();
        region.extend_from_slice(&0u32.to_le_bytes()).unwrap(); // upload_offset
        region.extend_from_slice(&(hdr_size as u16).to_le_bytes()).unwrap();
        region.push(0).unwrap(); // sig_type
        region.push(sig_len as u8).unwrap();
        region.extend_from_slice(&(body.len() as u32).to_le_bytes()).unwrap();
        region.extend_from_slice(&run_offset.to_le_bytes()).unwrap();
        region.push(version.major).unwrap();
        region.push(version.minor).unwrap();
        region.extend_from_slice(&version.rev.to_le_bytes()).unwrap();
        region.extend_from_slice(&0u32.to_le_bytes()).unwrap(); // build
        region.extend_from_slice(&0u32.to_le_bytes()).unwrap(); // pad
        region.extend_from_slice(&tlv).unwrap();

        let trailer_off = region.len();
        region.extend_from_slice(&VERI_MAGIC.to_be_bytes()).unwrap();
        let crc = common::crc::crc32_ieee(&region[..trailer_off + 4]);
        region.extend_from_slice(&crc.to_le_bytes()).unwrap();

        // Signature bytes are never checked against a real key here: the
        // compiled-in root key in `crypto` is a zero placeholder, so every
        // signature fails `verify_against_roots` — these tests exercise
        // the framing, not a production key pair.
        region.extend_from_slice(&[0u8; SIGNATURE_BYTES]).unwrap();

        flash.write(base, &region).unwrap();
        flash.write(base + hdr_size as u32, body).unwrap();
    }

    fn push_tlv(buf: &mut heapless::Vec<u8, 256>, ty: u16, value: &[u8]) {
        buf.extend_from_slice(&ty.to_le_bytes()).unwrap();
        buf.extend_from_slice(&(value.len() as u16).to_le_bytes()).unwrap();
        buf.extend_from_slice(value).unwrap();
    }

    #[test]
    fn probe_detects_magic_without_full_validation() {
        let mut flash = RamFlash::new(4096, 16, 16).with_unaligned_write();
        assert!(!probe_header(&mut flash, 0).unwrap());
        build_signed_image(&mut flash, 0, b"body", 0x1000, Version { major: 1, minor: 0, rev: 0 }, &[]);
        assert!(probe_header(&mut flash, 0).unwrap());
    }

    #[test]
    fn unsigned_placeholder_key_fails_signature_check() {
        let mut flash = RamFlash::new(4096, 16, 16).with_unaligned_write();
        build_signed_image(&mut flash, 0, b"body", 0x1000, Version { major: 1, minor: 0, rev: 0 }, &[]);
        let err = read_image_info(&mut flash, 0, 0).unwrap_err();
        assert_eq!(err, Error::InvalidImage);
    }

    #[test]
    fn erased_dependency_target_is_satisfied() {
        let mut flash = RamFlash::new(4096, 16, 16).with_unaligned_write();
        let dep = Dependency { img_offset: 0x2000, ver_min: 1, ver_max: 1 };
        assert!(dependency_satisfied(&mut flash, &dep).unwrap());
    }

    #[test]
    fn crc32_check_passes_on_well_formed_header_without_checking_signature() {
        let mut flash = RamFlash::new(4096, 16, 16).with_unaligned_write();
        build_signed_image(&mut flash, 0, b"body", 0x1000, Version { major: 1, minor: 0, rev: 0 }, &[]);
        let stage = verify_stage_crc32(&mut flash, 0).unwrap().unwrap();
        assert_eq!(stage.run_offset, 0x1000);
        assert_eq!(stage.body_size, 4);
    }

    #[test]
    fn crc32_check_fails_on_corrupted_body() {
        let mut flash = RamFlash::new(4096, 16, 16).with_unaligned_write();
        build_signed_image(&mut flash, 0, b"body", 0x1000, Version { major: 1, minor: 0, rev: 0 }, &[]);
        let stage = verify_stage_crc32(&mut flash, 0).unwrap().unwrap();
        flash.write(stage.hdr_size, b"XXXX").unwrap();
        assert!(verify_stage_crc32(&mut flash, 0).unwrap().is_none());
    }

    #[test]
    fn version_packing_round_trips() {
        let v = Version { major: 3, minor: 14, rev: 159 };
        assert_eq!(Version::unpack(v.pack()), v);
    }
}
