//! Free-pool maintenance.
//!
//! The controller keeps every host's reservoir of unassigned extents above
//! the configured low-water mark. Each tick, in order: resend grants to
//! hosts whose local allocator restarted, top up reservoirs from VG free
//! space through the journal, then flush back the extents hosts have
//! already assigned to volumes. Resend runs first so a just-restarted
//! allocator is in sync before it is granted more.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use xenvm_core::journal::JournalApply;
use xenvm_core::ring::RingState;
use xenvm_proto::extent;
use xenvm_proto::op::{FreeAllocation, RedoOp};
use xenvm_proto::vg::areas_to_segments;
use xenvm_proto::{XvError, XvResult};

use crate::daemon::{fatal, Daemon, SharedDaemon};
use crate::hosts::{free_name, push_retrying, HostRegistry};
use crate::vgstore::VgStore;

/// Applies journalled `FreeAllocation` records: a VG expand of the host's
/// free LV followed by a push on its `fromLVM` ring.
///
/// Both steps are idempotent, which is what makes the at-least-once
/// journal safe: re-applied segments are skipped by the VG, and the
/// host-side consumer tolerates a duplicate grant. On the live path the
/// expand was already applied when the grant was reserved, so it replays
/// as a no-op; after a crash it reproduces the transfer.
pub struct FreePoolApply {
    vg: Arc<VgStore>,
    hosts: HostRegistry,
    retry: Duration,
}

impl FreePoolApply {
    pub fn new(vg: Arc<VgStore>, hosts: HostRegistry, retry: Duration) -> Self {
        Self { vg, hosts, retry }
    }

    async fn apply_one(&self, alloc: &FreeAllocation) -> XvResult<()> {
        let free = free_name(&alloc.host);
        let Some(free_id) = self.vg.read(|vg| vg.lv_id_by_name(&free)).await else {
            // the host was destroyed with a grant still in flight
            warn!("dropping grant for destroyed host {}", alloc.host);
            return Ok(());
        };
        let segments = alloc.segments.clone();
        self.vg
            .write(move |_| {
                Ok(RedoOp::LvExpand {
                    id: free_id,
                    segments,
                })
            })
            .await?;
        self.vg.sync().await?;

        // hand the extents to the host; a host that is not connected will
        // resynchronise from the resend path when it reconnects
        if let Some(h) = self.hosts.lookup(&alloc.host).await {
            let mut from_lvm = h.from_lvm.lock().await;
            push_retrying(&mut from_lvm, alloc, self.retry).await?;
        } else {
            debug!(
                "host {} not connected; grant recorded in the VG only",
                alloc.host
            );
        }
        Ok(())
    }
}

#[async_trait]
impl JournalApply<FreeAllocation> for FreePoolApply {
    async fn apply(&self, ops: Vec<FreeAllocation>) -> XvResult<()> {
        for op in &ops {
            self.apply_one(op).await?;
        }
        Ok(())
    }
}

/// The periodic controller task.
pub async fn run(daemon: SharedDaemon) {
    let mut ticker = tokio::time::interval(daemon.config.freepool_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = daemon.shutdown.notified() => {
                info!("free-pool controller stopping");
                return;
            }
        }
        if let Err(e) = tick(&daemon).await {
            if e.is_fatal() {
                fatal("free-pool controller", &e);
            }
            warn!("free-pool tick failed: {e}");
        }
    }
}

/// One controller pass: resend, top-up, flush.
pub async fn tick(daemon: &Daemon) -> XvResult<()> {
    resend(daemon).await?;
    top_up(daemon).await?;
    daemon.hosts.flush_all().await
}

/// Re-push the full free allocation of every host whose `fromLVM` ring is
/// suspended, once it comes back.
async fn resend(daemon: &Daemon) -> XvResult<()> {
    for (name, h) in daemon.hosts.connected_snapshot().await {
        let mut from_lvm = h.from_lvm.lock().await;
        if from_lvm.state()? == RingState::Suspended {
            daemon
                .hosts
                .resend_free(&name, &h.free_name, &mut from_lvm)
                .await?;
        }
    }
    Ok(())
}

/// Grant a quantum of extents to every host below the low-water mark,
/// awaiting each journal record before moving to the next host.
///
/// The grant's extents leave `free_space` here, inside a single VG write
/// that both finds and debits them, so a concurrent `create_lv` or
/// `resize_lv` can never pick the same physical runs while the record is
/// in flight. The journal applier's expand is then a no-op replay on the
/// live path. All size arithmetic is in bytes: an extent smaller than a
/// MiB must not divide anything by zero.
async fn top_up(daemon: &Daemon) -> XvResult<()> {
    let quantum_bytes = (daemon.config.host_allocation_quantum as u64) << 20;
    let low_water_bytes = (daemon.config.host_low_water_mark as u64) << 20;

    for (name, h) in daemon.hosts.connected_snapshot().await {
        let below = daemon
            .vg
            .read(|vg| {
                vg.lv_by_name(&h.free_name)
                    .map(|lv| lv.size_in_extents() * vg.extent_size_bytes() < low_water_bytes)
            })
            .await;
        if below != Some(true) {
            continue;
        }
        let free_name = h.free_name.clone();
        let reserved = daemon
            .vg
            .write(move |vg| {
                let lv = vg
                    .lv_by_name(&free_name)
                    .ok_or_else(|| XvError::NotFound(free_name.clone()))?;
                let want = quantum_bytes.div_ceil(vg.extent_size_bytes()).max(1);
                let areas = extent::find(&vg.free_space, want)?;
                Ok(RedoOp::LvExpand {
                    id: lv.id.clone(),
                    segments: areas_to_segments(lv.size_in_extents(), &areas),
                })
            })
            .await;
        let segments = match reserved {
            Ok(RedoOp::LvExpand { segments, .. }) => segments,
            Ok(_) => return Err(XvError::Msg("unexpected reservation op".to_string())),
            Err(XvError::OnlyThisMuchFree(k)) => {
                info!("host {name}: wanted a full quantum but only {k} extents free, skipping");
                continue;
            }
            Err(e) => return Err(e),
        };
        daemon.vg.sync().await?;
        let granted: u64 = segments.iter().map(|s| s.count).sum();
        info!("host {name}: free pool below low water, granting {granted} extent(s)");
        let alloc = FreeAllocation {
            host: name.clone(),
            segments,
        };
        daemon.journal.push(&alloc).await?.wait().await?;
    }
    Ok(())
}
