//! Shared fixtures for daemon tests.
//!
//! Everything runs against in-memory PVs with 1 MiB extents and
//! millisecond pacing, so the real control loops can be driven end to end.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use xenvm_core::dev::{BlockDev, MemDev};
use xenvm_core::journal::Journal;
use xenvm_core::ring::{Consumer, Producer};
use xenvm_proto::extent;
use xenvm_proto::op::{ExpandVolume, FreeAllocation};
use xenvm_proto::vg::areas_to_segments;

use crate::config::Config;
use crate::daemon::{reserved_lv_extents, Daemon, SharedDaemon, JOURNAL_LV};
use crate::freepool::FreePoolApply;
use crate::hosts::{free_name, from_lvm_name, to_lvm_name, HostRegistry};
use crate::vgstore::{new_lv_op, VgStore};

/// 1 MiB extents keep the in-memory PVs small.
pub(crate) const TEST_EXTENT_SECTORS: u64 = 2048;
pub(crate) const TEST_RETRY: Duration = Duration::from_millis(5);

pub(crate) fn test_config() -> Config {
    Config {
        listen_port: Some(4000),
        listen_path: None,
        host_allocation_quantum: 16,
        host_low_water_mark: 8,
        vg: "vg0".to_string(),
        devices: vec!["mem0".to_string()],
        retry_interval_ms: 5,
        freepool_interval_ms: 20,
    }
}

/// A formatted VG on one 65 MiB in-memory PV: 64 extents of 1 MiB.
pub(crate) fn test_store() -> Arc<VgStore> {
    let dev: Arc<dyn BlockDev> = Arc::new(MemDev::new(65 << 20));
    Arc::new(
        VgStore::format("vg0", TEST_EXTENT_SECTORS, vec![("mem0".to_string(), dev)]).unwrap(),
    )
}

/// Store plus registry with the journal LV created but the journal not
/// yet started; lets tests stage journal records "from a previous run".
pub(crate) async fn test_parts() -> (Arc<VgStore>, HostRegistry) {
    let vg = test_store();
    vg.write(|v| new_lv_op(v, JOURNAL_LV, reserved_lv_extents(v)))
        .await
        .unwrap();
    vg.sync().await.unwrap();
    let hosts = HostRegistry::new(vg.clone(), TEST_RETRY);
    (vg, hosts)
}

pub(crate) async fn test_daemon() -> SharedDaemon {
    let (vg, hosts) = test_parts().await;
    let applier = Arc::new(FreePoolApply::new(vg.clone(), hosts.clone(), TEST_RETRY));
    let jdev = vg.open_lv_device(JOURNAL_LV).await.unwrap();
    let journal = Journal::start(jdev, JOURNAL_LV, applier, TEST_RETRY)
        .await
        .unwrap();
    Arc::new(Daemon {
        config: test_config(),
        vg,
        journal,
        hosts,
        shutdown: Arc::new(Notify::new()),
    })
}

/// The remote (local-allocator) end of `host`'s `toLVM` ring.
pub(crate) async fn host_to_lvm_producer(daemon: &Daemon, host: &str) -> Producer<ExpandVolume> {
    let name = to_lvm_name(host);
    let dev = daemon.vg.open_lv_device(&name).await.unwrap();
    let (producer, _) = Producer::attach(dev, &name).unwrap();
    producer
}

/// The remote (local-allocator) end of `host`'s `fromLVM` ring.
pub(crate) async fn host_from_lvm_consumer(
    daemon: &Daemon,
    host: &str,
) -> Consumer<FreeAllocation> {
    let name = from_lvm_name(host);
    let dev = daemon.vg.open_lv_device(&name).await.unwrap();
    Consumer::attach(dev, &name)
        .unwrap()
        .with_retry_interval(TEST_RETRY)
}

/// Build the `ExpandVolume` a local allocator would send: the first
/// `count` extents of the host's free pool, placed at the end of
/// `volume`.
pub(crate) async fn expand_volume(
    daemon: &Daemon,
    host: &str,
    volume: &str,
    count: u64,
) -> ExpandVolume {
    daemon
        .vg
        .read(|vg| {
            let free = vg.lv_by_name(&free_name(host)).unwrap();
            let areas = extent::find(&free.areas(), count).unwrap();
            let start = vg
                .lv_by_name(volume)
                .map(|lv| lv.size_in_extents())
                .unwrap_or(0);
            ExpandVolume {
                volume: volume.to_string(),
                segments: areas_to_segments(start, &areas),
            }
        })
        .await
}

/// Drain a `fromLVM` consumer, advancing past everything read.
pub(crate) async fn drain_from_lvm(consumer: &mut Consumer<FreeAllocation>) -> Vec<FreeAllocation> {
    let (pos, items) = consumer
        .fold(Vec::new(), |mut acc, it| {
            acc.push(it);
            acc
        })
        .unwrap();
    consumer.advance(pos).unwrap();
    items
}
