//! ZB8: secure-boot image verification and slot-swap management over a
//! raw NOR flash device, layered on top of `sfcb`'s circular log and
//! `common`'s flash/CRC/TLV/slot-map primitives.
#![cfg_attr(not(test), no_std)]

pub mod cmdlog;
pub mod crypto;
pub mod dfu;
pub mod image;
pub mod stage_loader;
pub mod swap;

pub use common::slotmap::{SlotArea, SlotView};
pub use common::Error;
pub use swap::{BootKeys, SwapEngine};
