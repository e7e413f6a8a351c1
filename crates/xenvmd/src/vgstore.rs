//! The volume-group store: single-writer access to authoritative metadata.
//!
//! All reads and writes pass through one async mutex; the LVM on-disk
//! layout tolerates only one mutator and writes are rare next to ring
//! traffic, so the coarse lock is the simple and sufficient discipline.
//! A write maps a VG snapshot to a redo op; the op is applied in memory
//! and the serialized VG is rewritten to the metadata block of every PV
//! before the lock is released.

use std::collections::BTreeMap;
use std::sync::Arc;

use rand::Rng;
use tokio::sync::Mutex;
use tracing::{debug, info};
use xenvm_core::dev::BlockDev;
use xenvm_core::lv_dev::{LvDevice, PvDev};
use xenvm_proto::extent;
use xenvm_proto::op::RedoOp;
use xenvm_proto::vg::{areas_to_segments, Lv, LvStatus, Pv, Vg, SECTOR_SIZE};
use xenvm_proto::{XvError, XvResult};

const MD_MAGIC: u32 = 0x5845_4e4d; // "XENM"
/// The metadata block starts at sector 1; sector 0 is left alone.
const MD_OFFSET: u64 = SECTOR_SIZE;
/// Physical extent 0 begins 1 MiB into each PV, leaving room for the
/// metadata block to grow.
const PE_START_SECTORS: u64 = 2048;

pub struct VgStore {
    /// PV name → backing device.
    devices: BTreeMap<String, Arc<dyn BlockDev>>,
    inner: Mutex<Vg>,
}

impl VgStore {
    /// Create a brand-new VG across `devices` and persist it.
    ///
    /// The extent size must be at least 1 MiB: the allocation-quantum and
    /// low-water knobs are MiB-granular.
    pub fn format(
        name: &str,
        extent_size: u64,
        devices: Vec<(String, Arc<dyn BlockDev>)>,
    ) -> XvResult<VgStore> {
        if extent_size < (1 << 20) / SECTOR_SIZE {
            return Err(XvError::Msg(format!(
                "extent size of {extent_size} sectors is below the 1 MiB minimum"
            )));
        }
        let mut vg = Vg::new(name, extent_size);
        let mut map = BTreeMap::new();
        for (idx, (path, dev)) in devices.into_iter().enumerate() {
            let sectors = dev.len() / SECTOR_SIZE;
            if sectors <= PE_START_SECTORS {
                return Err(XvError::Msg(format!("device {path} is too small for a PV")));
            }
            let pe_count = (sectors - PE_START_SECTORS) / extent_size;
            if pe_count == 0 {
                return Err(XvError::Msg(format!(
                    "device {path} holds no complete extent"
                )));
            }
            let pv_name = format!("pv{idx}");
            vg.add_pv(Pv {
                name: pv_name.clone(),
                device: path,
                pe_start: PE_START_SECTORS,
                pe_count,
            });
            map.insert(pv_name, dev);
        }
        let store = VgStore {
            devices: map,
            inner: Mutex::new(vg.clone()),
        };
        store.persist(&vg)?;
        info!(
            "formatted VG {} with {} PV(s), {} extents",
            vg.name,
            vg.pvs.len(),
            vg.total_extents()
        );
        Ok(store)
    }

    /// Open an existing VG from its devices.
    pub fn open(devices: Vec<(String, Arc<dyn BlockDev>)>) -> XvResult<VgStore> {
        let mut found: Option<Vg> = None;
        for (_, dev) in &devices {
            match read_metadata(dev.as_ref()) {
                Ok(vg) => {
                    found = Some(vg);
                    break;
                }
                Err(XvError::NotFormatted) => continue,
                Err(e) => return Err(e),
            }
        }
        let vg = found.ok_or(XvError::NotFormatted)?;

        let mut map = BTreeMap::new();
        for pv in &vg.pvs {
            let dev = devices
                .iter()
                .find(|(path, _)| *path == pv.device)
                .map(|(_, d)| d.clone())
                .ok_or_else(|| {
                    XvError::Msg(format!(
                        "device {} backing PV {} was not supplied",
                        pv.device, pv.name
                    ))
                })?;
            map.insert(pv.name.clone(), dev);
        }
        info!(
            "opened VG {} ({} extents of {} MiB, {} LVs)",
            vg.name,
            vg.total_extents(),
            vg.extent_size_mib(),
            vg.lvs.len()
        );
        Ok(VgStore {
            devices: map,
            inner: Mutex::new(vg),
        })
    }

    /// Run `f` on a snapshot of the VG under the lock.
    pub async fn read<R>(&self, f: impl FnOnce(&Vg) -> R) -> R {
        let vg = self.inner.lock().await;
        f(&vg)
    }

    /// Apply one redo op under the VG lock and persist the result.
    ///
    /// `f` maps the current VG to the op; it runs under the same lock, so
    /// the op is applied to exactly the state it was computed from.
    pub async fn write(&self, f: impl FnOnce(&Vg) -> XvResult<RedoOp>) -> XvResult<RedoOp> {
        let mut vg = self.inner.lock().await;
        let op = f(&vg)?;
        vg.do_op(&op)?;
        self.persist(&vg)?;
        Ok(op)
    }

    /// Force buffered VG updates to stable storage.
    pub async fn sync(&self) -> XvResult<()> {
        let _vg = self.inner.lock().await;
        for dev in self.devices.values() {
            dev.flush()?;
        }
        Ok(())
    }

    /// Build the block-device window for a named LV.
    pub async fn open_lv_device(&self, name: &str) -> XvResult<Arc<LvDevice>> {
        let vg = self.inner.lock().await;
        let lv = vg
            .lv_by_name(name)
            .ok_or_else(|| XvError::NotFound(name.to_string()))?;
        let mut pvs = BTreeMap::new();
        for pv in &vg.pvs {
            let dev = self
                .devices
                .get(&pv.name)
                .ok_or_else(|| XvError::Msg(format!("no device for PV {}", pv.name)))?
                .clone();
            pvs.insert(
                pv.name.clone(),
                PvDev {
                    dev,
                    pe_start_bytes: pv.pe_start * SECTOR_SIZE,
                },
            );
        }
        Ok(Arc::new(LvDevice::new(
            vg.extent_size_bytes(),
            lv.segments.clone(),
            pvs,
        )?))
    }

    fn persist(&self, vg: &Vg) -> XvResult<()> {
        let blob =
            bincode::serialize(vg).map_err(|e| XvError::Msg(format!("encode VG metadata: {e}")))?;
        let mut buf = Vec::with_capacity(12 + blob.len());
        buf.extend_from_slice(&MD_MAGIC.to_le_bytes());
        buf.extend_from_slice(&(blob.len() as u64).to_le_bytes());
        buf.extend_from_slice(&blob);
        for pv in &vg.pvs {
            let reserved = pv.pe_start * SECTOR_SIZE - MD_OFFSET;
            if buf.len() as u64 > reserved {
                return Err(XvError::Msg(format!(
                    "VG metadata of {} bytes overflows the {reserved}-byte reserved area",
                    buf.len()
                )));
            }
            let dev = self
                .devices
                .get(&pv.name)
                .ok_or_else(|| XvError::Msg(format!("no device for PV {}", pv.name)))?;
            dev.write_at(MD_OFFSET, &buf)?;
        }
        debug!("persisted VG metadata ({} bytes)", buf.len());
        Ok(())
    }
}

fn read_metadata(dev: &dyn BlockDev) -> XvResult<Vg> {
    let mut hdr = [0u8; 12];
    dev.read_at(MD_OFFSET, &mut hdr)?;
    let magic = u32::from_le_bytes(hdr[0..4].try_into().unwrap());
    if magic != MD_MAGIC {
        return Err(XvError::NotFormatted);
    }
    let len = u64::from_le_bytes(hdr[4..12].try_into().unwrap());
    if len == 0 || MD_OFFSET + 12 + len > dev.len() {
        return Err(XvError::Msg(format!("corrupt VG metadata length {len}")));
    }
    let mut blob = vec![0u8; len as usize];
    dev.read_at(MD_OFFSET + 12, &mut blob)?;
    bincode::deserialize(&blob).map_err(|e| XvError::Msg(format!("corrupt VG metadata: {e}")))
}

/// Fresh LV identifier: 32 hex characters.
pub fn new_lv_id() -> String {
    const HEX: &[u8] = b"0123456789abcdef";
    let mut rng = rand::thread_rng();
    (0..32)
        .map(|_| HEX[rng.gen_range(0..HEX.len())] as char)
        .collect()
}

/// Build the create op for a fresh LV of `size_extents`, first-fit
/// allocated from the VG's free space.
pub fn new_lv_op(vg: &Vg, name: &str, size_extents: u64) -> XvResult<RedoOp> {
    if vg.lv_by_name(name).is_some() {
        return Err(XvError::AlreadyExists(name.to_string()));
    }
    let areas = extent::find(&vg.free_space, size_extents)?;
    Ok(RedoOp::LvCreate {
        lv: Lv {
            id: new_lv_id(),
            name: name.to_string(),
            status: vec![LvStatus::Read, LvStatus::Write, LvStatus::Visible],
            tags: Vec::new(),
            segments: areas_to_segments(0, &areas),
        },
    })
}
