//! # xenvm-core
//!
//! The crash-safe building blocks of the XenVM daemon: byte-addressed
//! block devices, LV-backed device windows, the persistent shared-block
//! ring queue and the redo journal layered on top of it.

pub mod dev;
pub mod journal;
pub mod lv_dev;
pub mod ring;
