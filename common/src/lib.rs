//! Shared building blocks consumed by `sfcb`, `settings`, and the root
//! `zb8` crate: the flash driver contract, the error taxonomy, CRC helpers,
//! the TLV scanner, the slot map, and the debug-logging macro.
#![cfg_attr(not(test), no_std)]

pub mod crc;
pub mod debug;
pub mod error;
pub mod flash;
pub mod slotmap;
pub mod tlv;

#[cfg(any(test, feature = "test-flash"))]
pub mod test_flash;

pub use error::Error;
pub use flash::Flash;
