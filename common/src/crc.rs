//! CRC8-CCITT (ATE / SWPSTAT record guard) and CRC32-IEEE (stage-loader
//! image check) helpers, consumed from the `crc` crate rather than
//! hand-rolled, per the Non-goal excluding cryptographic/checksum
//! primitive implementations.

use crc::{Crc, Table};

/// CRC8-CCITT (poly 0x07, init 0xFF, no reflect) as used for ATEs and
/// sector-start records.
static CRC8_CCITT: Crc<u8, Table<1>> = Crc::<u8, Table<1>>::new(&crc::Algorithm {
    width: 8,
    poly: 0x07,
    init: 0xFF,
    refin: false,
    refout: false,
    xorout: 0x00,
    check: 0xF4,
    residue: 0x00,
});

/// CRC32-IEEE as used for the stage-loader's whole-image check.
static CRC32_IEEE: Crc<u32, Table<1>> = Crc::<u32, Table<1>>::new(&crc::CRC_32_ISO_HDLC);

/// Computes CRC8-CCITT over `data`.
pub fn crc8_ccitt(data: &[u8]) -> u8 {
    CRC8_CCITT.checksum(data)
}

/// Computes CRC32-IEEE over `data`.
pub fn crc32_ieee(data: &[u8]) -> u32 {
    CRC32_IEEE.checksum(data)
}

/// Streaming CRC32-IEEE digest, for checksumming an image without holding
/// it all in memory at once (mirrors `zb_fsl_crc32`'s chunked read).
pub struct Crc32Digest(crc::Digest<'static, u32, Table<1>>);

impl Crc32Digest {
    pub fn new() -> Self {
        Crc32Digest(CRC32_IEEE.digest())
    }

    pub fn update(&mut self, data: &[u8]) {
        self.0.update(data);
    }

    pub fn finalize(self) -> u32 {
        self.0.finalize()
    }
}

impl Default for Crc32Digest {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc8_is_deterministic_and_sensitive() {
        let a = crc8_ccitt(b"hello");
        let b = crc8_ccitt(b"hellp");
        assert_ne!(a, b);
        assert_eq!(a, crc8_ccitt(b"hello"));
    }

    #[test]
    fn crc32_streaming_matches_whole_buffer() {
        let data = [0x42u8; 97];
        let whole = crc32_ieee(&data);
        let mut digest = Crc32Digest::new();
        for chunk in data.chunks(17) {
            digest.update(chunk);
        }
        assert_eq!(whole, digest.finalize());
    }
}
