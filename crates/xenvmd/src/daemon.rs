//! Daemon-wide state.
//!
//! One `Daemon` value is constructed sequentially at startup and shared by
//! every task; there is no global mutable state.

use std::sync::Arc;

use tokio::sync::Notify;
use tracing::error;
use xenvm_core::journal::Journal;
use xenvm_proto::op::FreeAllocation;

use crate::config::Config;
use crate::hosts::HostRegistry;
use crate::vgstore::VgStore;

/// Reserved name of the daemon's journal LV.
pub const JOURNAL_LV: &str = "xenvm_journal";

/// Size of each reserved LV: the journal and the per-host queues.
pub const RESERVED_LV_MIB: u64 = 4;

/// Reserved-LV size in extents for this VG, at least one extent.
pub fn reserved_lv_extents(vg: &xenvm_proto::Vg) -> u64 {
    (RESERVED_LV_MIB << 20)
        .div_ceil(vg.extent_size_bytes())
        .max(1)
}

pub struct Daemon {
    pub config: Config,
    pub vg: Arc<VgStore>,
    pub journal: Journal<FreeAllocation>,
    pub hosts: HostRegistry,
    pub shutdown: Arc<Notify>,
}

pub type SharedDaemon = Arc<Daemon>;

/// A fatal error leaves the on-disk state in a condition only an operator
/// can judge; log it and stop the process.
pub fn fatal(context: &str, err: &xenvm_proto::XvError) -> ! {
    error!("fatal: {context}: {err}");
    std::process::exit(1);
}
