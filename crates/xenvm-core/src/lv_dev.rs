//! LV-backed device windows.
//!
//! The rings and the journal are each "backed by a logical volume": this
//! module presents one LV as a [`BlockDev`], translating logical byte
//! offsets through the LV's segment map onto the underlying PV devices.
//! Kernel device-mapper is deliberately not involved; the daemon performs
//! the translation itself.

use std::collections::BTreeMap;
use std::sync::Arc;

use xenvm_proto::vg::Segment;
use xenvm_proto::{XvError, XvResult};

use crate::dev::BlockDev;

/// Where a PV's extents live: the device plus the byte offset of extent 0.
#[derive(Clone)]
pub struct PvDev {
    pub dev: Arc<dyn BlockDev>,
    pub pe_start_bytes: u64,
}

pub struct LvDevice {
    extent_size_bytes: u64,
    /// Segments ordered by logical start.
    segments: Vec<Segment>,
    pvs: BTreeMap<String, PvDev>,
}

impl LvDevice {
    pub fn new(
        extent_size_bytes: u64,
        mut segments: Vec<Segment>,
        pvs: BTreeMap<String, PvDev>,
    ) -> XvResult<Self> {
        segments.sort_by_key(|s| s.start);
        for seg in &segments {
            if !pvs.contains_key(&seg.pv) {
                return Err(XvError::Msg(format!(
                    "segment references unknown PV {}",
                    seg.pv
                )));
            }
        }
        Ok(Self {
            extent_size_bytes,
            segments,
            pvs,
        })
    }

    /// Resolve a logical offset to (device, device offset, bytes left in
    /// the containing segment).
    fn translate(&self, off: u64) -> XvResult<(Arc<dyn BlockDev>, u64, u64)> {
        let ext = self.extent_size_bytes;
        for seg in &self.segments {
            let seg_start = seg.start * ext;
            let seg_len = seg.count * ext;
            if off >= seg_start && off < seg_start + seg_len {
                let delta = off - seg_start;
                let pv = &self.pvs[&seg.pv];
                return Ok((
                    pv.dev.clone(),
                    pv.pe_start_bytes + seg.pstart * ext + delta,
                    seg_len - delta,
                ));
            }
        }
        Err(XvError::Io(format!(
            "offset {off} beyond end of logical volume"
        )))
    }
}

impl BlockDev for LvDevice {
    fn read_at(&self, mut off: u64, buf: &mut [u8]) -> XvResult<()> {
        let mut done = 0usize;
        while done < buf.len() {
            let (dev, dev_off, run) = self.translate(off)?;
            let n = (buf.len() - done).min(run as usize);
            dev.read_at(dev_off, &mut buf[done..done + n])?;
            done += n;
            off += n as u64;
        }
        Ok(())
    }

    fn write_at(&self, mut off: u64, data: &[u8]) -> XvResult<()> {
        let mut done = 0usize;
        while done < data.len() {
            let (dev, dev_off, run) = self.translate(off)?;
            let n = (data.len() - done).min(run as usize);
            dev.write_at(dev_off, &data[done..done + n])?;
            done += n;
            off += n as u64;
        }
        Ok(())
    }

    fn flush(&self) -> XvResult<()> {
        for pv in self.pvs.values() {
            pv.dev.flush()?;
        }
        Ok(())
    }

    fn len(&self) -> u64 {
        self.segments.iter().map(|s| s.count).sum::<u64>() * self.extent_size_bytes
    }
}
