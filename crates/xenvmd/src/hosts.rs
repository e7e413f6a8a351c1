//! Per-host queue lifecycle.
//!
//! Each host H owns three reserved LVs: `H-toLVM` carries expansion
//! requests from the host's local allocator to the daemon, `H-fromLVM`
//! carries extent grants the other way, and `H-free` holds the extents H
//! may hand to volumes. `H-free` is created last and its existence is the
//! commit marker for `create`; a crash mid-create is repaired by simply
//! running `create` again.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::{debug, info, warn};
use xenvm_core::dev::BlockDev;
use xenvm_core::ring::{self, Consumer, Producer, RingState};
use xenvm_proto::extent::Area;
use xenvm_proto::op::{ExpandVolume, FreeAllocation, RedoOp};
use xenvm_proto::rpc::{HostStatus, QueueStatus};
use xenvm_proto::vg::Segment;
use xenvm_proto::{XvError, XvResult};

use crate::daemon::reserved_lv_extents;
use crate::vgstore::{new_lv_op, VgStore};

pub fn to_lvm_name(host: &str) -> String {
    format!("{host}-toLVM")
}

pub fn from_lvm_name(host: &str) -> String {
    format!("{host}-fromLVM")
}

pub fn free_name(host: &str) -> String {
    format!("{host}-free")
}

/// Live handles for one connected host.
#[derive(Clone)]
pub struct ConnectedHost {
    pub to_lvm: Arc<Mutex<Consumer<ExpandVolume>>>,
    pub from_lvm: Arc<Mutex<Producer<FreeAllocation>>>,
    pub free_name: String,
    pub free_id: String,
}

/// The host registry: lifecycle state machine plus the flush path.
///
/// The flush lock is distinct from the VG lock: one flush performs many VG
/// writes, and the lock keeps the periodic controller and an explicit
/// disconnect from racing on the same host's queue while other operations
/// proceed.
#[derive(Clone)]
pub struct HostRegistry {
    vg: Arc<VgStore>,
    connected: Arc<Mutex<BTreeMap<String, ConnectedHost>>>,
    flush_lock: Arc<Mutex<()>>,
    retry: Duration,
}

impl HostRegistry {
    pub fn new(vg: Arc<VgStore>, retry: Duration) -> Self {
        Self {
            vg,
            connected: Arc::new(Mutex::new(BTreeMap::new())),
            flush_lock: Arc::new(Mutex::new(())),
            retry,
        }
    }

    pub async fn lookup(&self, host: &str) -> Option<ConnectedHost> {
        self.connected.lock().await.get(host).cloned()
    }

    pub async fn connected_snapshot(&self) -> Vec<(String, ConnectedHost)> {
        self.connected
            .lock()
            .await
            .iter()
            .map(|(name, h)| (name.clone(), h.clone()))
            .collect()
    }

    /// Create the host's three LVs and initialise both rings.
    ///
    /// Idempotent: an existing `H-free` means the host is fully created,
    /// and a partial earlier attempt is finished off by re-running the
    /// remaining steps.
    pub async fn create(&self, host: &str) -> XvResult<()> {
        if self
            .vg
            .read(|vg| vg.lv_by_name(&free_name(host)).is_some())
            .await
        {
            info!("host {host}: already created");
            return Ok(());
        }
        self.create_reserved_lv(&to_lvm_name(host)).await?;
        self.create_reserved_lv(&from_lvm_name(host)).await?;
        self.init_queue(&to_lvm_name(host)).await?;
        self.init_queue(&from_lvm_name(host)).await?;
        // created last: its existence commits the whole host
        self.create_reserved_lv(&free_name(host)).await?;
        info!("host {host}: created");
        Ok(())
    }

    /// Attach to the host's rings and register it.
    pub async fn connect(&self, host: &str) -> XvResult<()> {
        let mut connected = self.connected.lock().await;
        if connected.contains_key(host) {
            return Ok(());
        }
        let free = free_name(host);
        let free_id = self
            .vg
            .read(|vg| vg.lv_id_by_name(&free))
            .await
            .ok_or_else(|| XvError::HostNotCreated(host.to_string()))?;

        let to_dev = self.vg.open_lv_device(&to_lvm_name(host)).await?;
        let mut to_lvm = Consumer::<ExpandVolume>::attach(to_dev, &to_lvm_name(host))?
            .with_retry_interval(self.retry);
        // the previous daemon instance suspended the queue on disconnect
        to_lvm.resume().await?;

        let from_dev = self.vg.open_lv_device(&from_lvm_name(host)).await?;
        let (mut from_lvm, initial) =
            Producer::<FreeAllocation>::attach(from_dev, &from_lvm_name(host))?;
        if initial == RingState::Suspended {
            // a restarted local allocator resynchronises from a full grant
            self.resend_free(host, &free, &mut from_lvm).await?;
        }

        connected.insert(
            host.to_string(),
            ConnectedHost {
                to_lvm: Arc::new(Mutex::new(to_lvm)),
                from_lvm: Arc::new(Mutex::new(from_lvm)),
                free_name: free,
                free_id,
            },
        );
        info!("host {host}: connected");
        Ok(())
    }

    /// Suspend the host's `toLVM` queue, drain it, and deregister.
    /// Success when the host was not connected.
    pub async fn disconnect(&self, host: &str) -> XvResult<()> {
        let _guard = self.flush_lock.lock().await;
        let entry = self.connected.lock().await.get(host).cloned();
        let Some(h) = entry else {
            return Ok(());
        };
        h.to_lvm.lock().await.suspend().await?;
        self.flush_one_locked(host, &h).await?;
        self.connected.lock().await.remove(host);
        info!("host {host}: disconnected");
        Ok(())
    }

    /// Disconnect, then remove the host's three LVs from the VG.
    pub async fn destroy(&self, host: &str) -> XvResult<()> {
        self.disconnect(host).await?;
        for name in [to_lvm_name(host), from_lvm_name(host), free_name(host)] {
            // tolerate a partially-created host
            let id = self.vg.read(|vg| vg.lv_id_by_name(&name)).await;
            if let Some(id) = id {
                self.vg.write(move |_| Ok(RedoOp::LvRemove { id })).await?;
            }
        }
        self.vg.sync().await?;
        info!("host {host}: destroyed");
        Ok(())
    }

    /// Report every registered host with live ring states.
    pub async fn all(&self) -> XvResult<Vec<HostStatus>> {
        let mut out = Vec::new();
        for (name, h) in self.connected_snapshot().await {
            let to_suspended = h.to_lvm.lock().await.state()? == RingState::Suspended;
            let from_suspended = h.from_lvm.lock().await.state()? == RingState::Suspended;
            let free_extents = self
                .vg
                .read(|vg| vg.lv_by_name(&h.free_name).map(|lv| lv.size_in_extents()))
                .await
                .unwrap_or(0);
            out.push(HostStatus {
                name: name.clone(),
                from_lvm: QueueStatus {
                    lv: from_lvm_name(&name),
                    suspended: from_suspended,
                },
                to_lvm: QueueStatus {
                    lv: to_lvm_name(&name),
                    suspended: to_suspended,
                },
                free_extents,
            });
        }
        Ok(out)
    }

    /// Drain every connected host's `toLVM` queue, in registration order.
    ///
    /// The daemon keeps no host→LV index, so `flush(name)` means
    /// flush-all.
    pub async fn flush_all(&self) -> XvResult<()> {
        let _guard = self.flush_lock.lock().await;
        for (name, h) in self.connected_snapshot().await {
            self.flush_one_locked(&name, &h).await?;
        }
        Ok(())
    }

    /// Disconnect every host; used on daemon shutdown.
    pub async fn shutdown(&self) -> XvResult<()> {
        let names: Vec<String> = self.connected.lock().await.keys().cloned().collect();
        for name in names {
            self.disconnect(&name).await?;
        }
        Ok(())
    }

    /// Drain one host's `toLVM` queue. The caller holds the flush lock.
    ///
    /// Each `ExpandVolume` moves extents from the host's free LV into the
    /// named volume: an expand of the volume followed by a crop of the
    /// free LV, both under the VG lock.
    async fn flush_one_locked(&self, host: &str, h: &ConnectedHost) -> XvResult<()> {
        let mut to_lvm = h.to_lvm.lock().await;
        let (pos, items) = to_lvm.fold(Vec::new(), |mut acc, item: ExpandVolume| {
            acc.push(item);
            acc
        })?;
        for item in &items {
            let volume_id = self.vg.read(|vg| vg.lv_id_by_name(&item.volume)).await;
            let Some(volume_id) = volume_id else {
                warn!(
                    "host {host}: dropping expansion of unknown volume {}",
                    item.volume
                );
                continue;
            };
            let segments = item.segments.clone();
            let areas: Vec<Area> = segments.iter().map(Segment::area).collect();
            let moved: u64 = areas.iter().map(|a| a.count).sum();
            self.vg
                .write(move |_| {
                    Ok(RedoOp::LvExpand {
                        id: volume_id,
                        segments,
                    })
                })
                .await?;
            let free_id = h.free_id.clone();
            self.vg
                .write(move |_| Ok(RedoOp::LvCrop { id: free_id, areas }))
                .await?;
            debug!(
                "host {host}: volume {} extended by {moved} extent(s)",
                item.volume
            );
        }
        if !items.is_empty() {
            self.vg.sync().await?;
            info!("host {host}: flushed {} expansion(s)", items.len());
        }
        to_lvm.advance(pos)?;
        Ok(())
    }

    /// Push the full current allocation of the host's free LV onto its
    /// `fromLVM` ring, waiting (with the fixed back-off) for the ring to
    /// be running first. Used when a restarted local allocator needs to
    /// relearn what it owns.
    pub(crate) async fn resend_free(
        &self,
        host: &str,
        free: &str,
        from_lvm: &mut Producer<FreeAllocation>,
    ) -> XvResult<()> {
        loop {
            match from_lvm.state()? {
                RingState::Running => break,
                RingState::Suspended => {
                    debug!("host {host}: fromLVM suspended, waiting before resend");
                    sleep(self.retry).await;
                }
            }
        }
        let segments = self
            .vg
            .read(|vg| vg.lv_by_name(free).map(|lv| lv.segments.clone()))
            .await
            .ok_or_else(|| XvError::Msg(format!("free LV {free} vanished while resending")))?;
        if segments.is_empty() {
            return Ok(());
        }
        let alloc = FreeAllocation {
            host: host.to_string(),
            segments,
        };
        push_retrying(from_lvm, &alloc, self.retry).await?;
        info!("host {host}: resent current free allocation");
        Ok(())
    }

    async fn create_reserved_lv(&self, name: &str) -> XvResult<()> {
        // reuse a leftover from an interrupted create
        if self.vg.read(|vg| vg.lv_by_name(name).is_some()).await {
            debug!("reusing existing reserved LV {name}");
            return Ok(());
        }
        self.vg
            .write(|vg| new_lv_op(vg, name, reserved_lv_extents(vg)))
            .await?;
        // the open-by-name below depends on this create being visible
        self.vg.sync().await
    }

    async fn init_queue(&self, name: &str) -> XvResult<()> {
        let dev = self.vg.open_lv_device(name).await.map_err(|e| {
            XvError::Msg(format!(
                "VG store lost just-created LV {name}: {e}"
            ))
        })?;
        erase(dev.as_ref())?;
        ring::create(dev.as_ref())?;
        Ok(())
    }
}

/// Zero-fill a queue LV before handing it to the ring layer.
fn erase(dev: &dyn BlockDev) -> XvResult<()> {
    let zeros = vec![0u8; 64 * 1024];
    let mut off = 0u64;
    while off < dev.len() {
        let n = zeros.len().min((dev.len() - off) as usize);
        dev.write_at(off, &zeros[..n])?;
        off += n as u64;
    }
    dev.flush()
}

/// Push and publish one item, waiting out transient ring conditions with
/// the fixed back-off.
pub(crate) async fn push_retrying<T: Serialize + DeserializeOwned>(
    producer: &mut Producer<T>,
    item: &T,
    retry: Duration,
) -> XvResult<()> {
    loop {
        match producer.push(item) {
            Ok(pos) => return producer.advance(pos),
            Err(e) if e.is_transient() => {
                debug!("push held off: {e}");
                sleep(retry).await;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{expand_volume, host_to_lvm_producer, test_daemon};
    use xenvm_proto::extent;

    #[tokio::test]
    async fn test_create_is_idempotent_and_atomic() {
        let daemon = test_daemon().await;
        daemon.hosts.create("h1").await.unwrap();
        daemon.hosts.create("h1").await.unwrap();

        // all three LVs exist and both rings hold an initialised header
        daemon
            .vg
            .read(|vg| {
                for name in ["h1-toLVM", "h1-fromLVM", "h1-free"] {
                    assert!(vg.lv_by_name(name).is_some(), "{name} missing");
                }
            })
            .await;
        for name in ["h1-toLVM", "h1-fromLVM"] {
            let dev = daemon.vg.open_lv_device(name).await.unwrap();
            assert!(ring::initialized(dev.as_ref()).unwrap());
            let consumer = Consumer::<ExpandVolume>::attach(dev, name).unwrap();
            assert_eq!(consumer.state().unwrap(), RingState::Running);
        }
    }

    #[tokio::test]
    async fn test_partial_create_is_repaired() {
        let daemon = test_daemon().await;
        // simulate a crash after the first queue LV was created
        daemon
            .hosts
            .create_reserved_lv(&to_lvm_name("h1"))
            .await
            .unwrap();
        assert!(daemon
            .vg
            .read(|vg| vg.lv_by_name("h1-free").is_none())
            .await);

        daemon.hosts.create("h1").await.unwrap();
        assert!(daemon
            .vg
            .read(|vg| vg.lv_by_name("h1-free").is_some())
            .await);
    }

    #[tokio::test]
    async fn test_connect_requires_create() {
        let daemon = test_daemon().await;
        assert_eq!(
            daemon.hosts.connect("ghost").await,
            Err(XvError::HostNotCreated("ghost".into()))
        );
    }

    #[tokio::test]
    async fn test_bootstrap_reports_host_status() {
        let daemon = test_daemon().await;
        daemon.hosts.create("h1").await.unwrap();
        daemon.hosts.connect("h1").await.unwrap();

        let all = daemon.hosts.all().await.unwrap();
        assert_eq!(all.len(), 1);
        let h1 = &all[0];
        assert_eq!(h1.name, "h1");
        assert_eq!(h1.to_lvm.lv, "h1-toLVM");
        assert!(!h1.to_lvm.suspended);
        assert_eq!(h1.from_lvm.lv, "h1-fromLVM");
        assert!(!h1.from_lvm.suspended);
        // the 4 MiB free LV on a 1 MiB-extent VG
        assert_eq!(h1.free_extents, 4);

        // connecting again is a no-op
        daemon.hosts.connect("h1").await.unwrap();
        assert_eq!(daemon.hosts.all().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_flush_moves_extents_from_free_to_volume() {
        let daemon = test_daemon().await;
        daemon.hosts.create("h1").await.unwrap();
        daemon.hosts.connect("h1").await.unwrap();
        daemon
            .vg
            .write(|vg| new_lv_op(vg, "vol1", 0))
            .await
            .unwrap();

        let free_before = daemon
            .vg
            .read(|vg| vg.lv_by_name("h1-free").unwrap().size_in_extents())
            .await;

        // the host's allocator assigns 2 extents of its pool to vol1
        let mut producer = host_to_lvm_producer(&daemon, "h1").await;
        let item = expand_volume(&daemon, "h1", "vol1", 2).await;
        push_retrying(&mut producer, &item, Duration::from_millis(5))
            .await
            .unwrap();

        daemon.hosts.flush_all().await.unwrap();

        daemon
            .vg
            .read(|vg| {
                assert_eq!(vg.lv_by_name("vol1").unwrap().size_in_extents(), 2);
                assert_eq!(
                    vg.lv_by_name("h1-free").unwrap().size_in_extents(),
                    free_before - 2
                );
            })
            .await;

        // the queue was advanced past the item
        let h = daemon.hosts.lookup("h1").await.unwrap();
        let (_, left) = h
            .to_lvm
            .lock()
            .await
            .fold(Vec::new(), |mut acc, it: ExpandVolume| {
                acc.push(it);
                acc
            })
            .unwrap();
        assert!(left.is_empty());
    }

    #[tokio::test]
    async fn test_disconnect_flushes_and_suspends() {
        let daemon = test_daemon().await;
        daemon.hosts.create("h1").await.unwrap();
        daemon.hosts.connect("h1").await.unwrap();
        daemon
            .vg
            .write(|vg| new_lv_op(vg, "vol1", 0))
            .await
            .unwrap();

        let mut producer = host_to_lvm_producer(&daemon, "h1").await;
        for _ in 0..3 {
            let item = expand_volume(&daemon, "h1", "vol1", 1).await;
            push_retrying(&mut producer, &item, Duration::from_millis(5))
                .await
                .unwrap();
            // applying in between keeps the free-LV bookkeeping simple:
            // each item carves a different extent
            daemon.hosts.flush_all().await.unwrap();
        }
        let item = expand_volume(&daemon, "h1", "vol1", 1).await;
        push_retrying(&mut producer, &item, Duration::from_millis(5))
            .await
            .unwrap();

        daemon.hosts.disconnect("h1").await.unwrap();

        // all queued items were applied before disconnect returned
        assert_eq!(
            daemon
                .vg
                .read(|vg| vg.lv_by_name("vol1").unwrap().size_in_extents())
                .await,
            4
        );
        // the host is gone from the registry and its queue is suspended
        assert!(daemon.hosts.all().await.unwrap().is_empty());
        let dev = daemon.vg.open_lv_device("h1-toLVM").await.unwrap();
        let consumer = Consumer::<ExpandVolume>::attach(dev, "h1-toLVM").unwrap();
        assert_eq!(consumer.state().unwrap(), RingState::Suspended);

        // disconnecting an unknown host is success
        daemon.hosts.disconnect("h1").await.unwrap();
    }

    #[tokio::test]
    async fn test_destroy_removes_the_triple() {
        let daemon = test_daemon().await;
        let total = daemon.vg.read(|vg| vg.total_extents()).await;
        daemon.hosts.create("h1").await.unwrap();
        daemon.hosts.connect("h1").await.unwrap();
        daemon.hosts.destroy("h1").await.unwrap();

        daemon
            .vg
            .read(|vg| {
                for name in ["h1-toLVM", "h1-fromLVM", "h1-free"] {
                    assert!(vg.lv_by_name(name).is_none(), "{name} still present");
                }
                // every extent returned to free space (journal LV aside)
                let journal = vg.lv_by_name(crate::daemon::JOURNAL_LV).unwrap();
                assert_eq!(
                    extent::total(&vg.free_space) + journal.size_in_extents(),
                    total
                );
            })
            .await;
    }

    #[tokio::test]
    async fn test_flush_skips_unknown_volume() {
        let daemon = test_daemon().await;
        daemon.hosts.create("h1").await.unwrap();
        daemon.hosts.connect("h1").await.unwrap();

        let mut producer = host_to_lvm_producer(&daemon, "h1").await;
        let item = expand_volume(&daemon, "h1", "no-such-volume", 1).await;
        push_retrying(&mut producer, &item, Duration::from_millis(5))
            .await
            .unwrap();

        daemon.hosts.flush_all().await.unwrap();

        // the item was consumed, the free LV kept its extents
        assert_eq!(
            daemon
                .vg
                .read(|vg| vg.lv_by_name("h1-free").unwrap().size_in_extents())
                .await,
            4
        );
    }
}
