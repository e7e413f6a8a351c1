//! Volume-group metadata model.
//!
//! The in-memory authoritative view of one LVM-compatible volume group.
//! Every mutation is expressed as a [`RedoOp`] and applied through
//! [`Vg::do_op`], which is written to be idempotent: the daemon journal
//! re-applies a suffix of operations after a crash.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{XvError, XvResult};
use crate::extent::{self, Area};
use crate::op::RedoOp;

/// Sector size in bytes. Extent sizes are expressed in sectors.
pub const SECTOR_SIZE: u64 = 512;

/// Access and visibility flags of a logical volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LvStatus {
    Read,
    Write,
    Visible,
}

/// One contiguous mapping from a run of the LV's logical extents onto a
/// run of physical extents on one PV.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segment {
    /// First logical extent covered.
    pub start: u64,
    /// Number of extents.
    pub count: u64,
    /// Name of the PV holding the physical run.
    pub pv: String,
    /// First physical extent on that PV.
    pub pstart: u64,
}

impl Segment {
    /// One past the last logical extent covered.
    pub fn end(&self) -> u64 {
        self.start + self.count
    }

    /// The physical extents backing this segment.
    pub fn area(&self) -> Area {
        Area::new(self.pv.clone(), self.pstart, self.count)
    }
}

/// Map `areas` onto consecutive logical extents starting at `logical_start`.
pub fn areas_to_segments(logical_start: u64, areas: &[Area]) -> Vec<Segment> {
    let mut logical = logical_start;
    areas
        .iter()
        .map(|a| {
            let seg = Segment {
                start: logical,
                count: a.count,
                pv: a.pv.clone(),
                pstart: a.start,
            };
            logical += a.count;
            seg
        })
        .collect()
}

/// A logical volume.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lv {
    /// Stable identifier (UUID); rename does not change it.
    pub id: String,
    pub name: String,
    pub status: Vec<LvStatus>,
    pub tags: Vec<String>,
    /// Mappings ordered by logical start.
    pub segments: Vec<Segment>,
}

impl Lv {
    pub fn size_in_extents(&self) -> u64 {
        self.segments.iter().map(|s| s.count).sum()
    }

    /// Physical extents owned by this LV, normalized.
    pub fn areas(&self) -> Vec<Area> {
        extent::normalize(self.segments.iter().map(|s| s.area()).collect())
    }

    fn sort_segments(&mut self) {
        self.segments.sort_by_key(|s| s.start);
    }
}

/// A physical volume contributing extents to the VG.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pv {
    pub name: String,
    /// Path of the backing block device.
    pub device: String,
    /// Sector offset of physical extent 0 on the device.
    pub pe_start: u64,
    /// Number of physical extents on this PV.
    pub pe_count: u64,
}

/// The volume group: the unit the daemon owns exclusively.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vg {
    pub name: String,
    /// Extent size in sectors. Immutable after creation.
    pub extent_size: u64,
    pub pvs: Vec<Pv>,
    /// Unallocated physical extents, normalized.
    pub free_space: Vec<Area>,
    /// Logical volumes keyed by id.
    pub lvs: BTreeMap<String, Lv>,
}

impl Vg {
    pub fn new(name: impl Into<String>, extent_size: u64) -> Self {
        Self {
            name: name.into(),
            extent_size,
            pvs: Vec::new(),
            free_space: Vec::new(),
            lvs: BTreeMap::new(),
        }
    }

    /// Register a PV and mark all its extents free.
    pub fn add_pv(&mut self, pv: Pv) {
        self.free_space = extent::add(
            &self.free_space,
            &[Area::new(pv.name.clone(), 0, pv.pe_count)],
        );
        self.pvs.push(pv);
    }

    pub fn extent_size_bytes(&self) -> u64 {
        self.extent_size * SECTOR_SIZE
    }

    pub fn extent_size_mib(&self) -> u64 {
        self.extent_size_bytes() >> 20
    }

    pub fn total_extents(&self) -> u64 {
        self.pvs.iter().map(|p| p.pe_count).sum()
    }

    pub fn lv(&self, id: &str) -> Option<&Lv> {
        self.lvs.get(id)
    }

    pub fn lv_by_name(&self, name: &str) -> Option<&Lv> {
        self.lvs.values().find(|lv| lv.name == name)
    }

    pub fn lv_id_by_name(&self, name: &str) -> Option<String> {
        self.lv_by_name(name).map(|lv| lv.id.clone())
    }

    /// A copy of this VG whose LV map holds only the named LV.
    pub fn with_single_lv(&self, name: &str) -> Option<Vg> {
        let lv = self.lv_by_name(name)?.clone();
        let mut vg = self.clone();
        vg.lvs.clear();
        vg.lvs.insert(lv.id.clone(), lv);
        Some(vg)
    }

    /// Apply one redo operation.
    ///
    /// Replayed operations must leave the VG unchanged: creates of an
    /// existing id, expands whose segments are already present and crops of
    /// extents already gone are all no-ops.
    pub fn do_op(&mut self, op: &RedoOp) -> XvResult<()> {
        match op {
            RedoOp::LvCreate { lv } => {
                if self.lvs.contains_key(&lv.id) {
                    return Ok(());
                }
                if self.lv_by_name(&lv.name).is_some() {
                    return Err(XvError::AlreadyExists(lv.name.clone()));
                }
                self.free_space = extent::sub(&self.free_space, &lv.areas());
                let mut lv = lv.clone();
                lv.sort_segments();
                self.lvs.insert(lv.id.clone(), lv);
            }
            RedoOp::LvRemove { id } => {
                if let Some(lv) = self.lvs.remove(id) {
                    self.free_space = extent::add(&self.free_space, &lv.areas());
                }
            }
            RedoOp::LvRename { id, new_name } => {
                if let Some(other) = self.lv_by_name(new_name) {
                    if other.id != *id {
                        return Err(XvError::AlreadyExists(new_name.clone()));
                    }
                }
                let lv = self
                    .lvs
                    .get_mut(id)
                    .ok_or_else(|| XvError::NotFound(id.clone()))?;
                lv.name = new_name.clone();
            }
            RedoOp::LvExpand { id, segments } => {
                let lv = self
                    .lvs
                    .get_mut(id)
                    .ok_or_else(|| XvError::NotFound(id.clone()))?;
                let mut fresh: Vec<Segment> = Vec::new();
                for seg in segments {
                    if lv.segments.iter().any(|s| s.start == seg.start) {
                        continue;
                    }
                    fresh.push(seg.clone());
                }
                lv.segments.extend(fresh.iter().cloned());
                lv.sort_segments();
                let areas: Vec<Area> = fresh.iter().map(|s| s.area()).collect();
                self.free_space = extent::sub(&self.free_space, &areas);
            }
            RedoOp::LvCrop { id, areas } => {
                // Ownership of the cropped extents transfers elsewhere:
                // free space is not credited.
                let lv = self
                    .lvs
                    .get_mut(id)
                    .ok_or_else(|| XvError::NotFound(id.clone()))?;
                let taken = extent::normalize(areas.clone());
                let mut pieces: Vec<Area> = Vec::new();
                for seg in &lv.segments {
                    pieces.extend(extent::sub(&[seg.area()], &taken));
                }
                let mut logical = 0;
                lv.segments = pieces
                    .into_iter()
                    .map(|a| {
                        let seg = Segment {
                            start: logical,
                            count: a.count,
                            pv: a.pv,
                            pstart: a.start,
                        };
                        logical += a.count;
                        seg
                    })
                    .collect();
            }
            RedoOp::LvReduce { id, new_size } => {
                let lv = self
                    .lvs
                    .get_mut(id)
                    .ok_or_else(|| XvError::NotFound(id.clone()))?;
                if lv.size_in_extents() <= *new_size {
                    return Ok(());
                }
                let mut kept: Vec<Segment> = Vec::new();
                let mut freed: Vec<Area> = Vec::new();
                let mut cum = 0u64;
                for seg in &lv.segments {
                    if cum + seg.count <= *new_size {
                        kept.push(seg.clone());
                    } else if cum < *new_size {
                        let keep = *new_size - cum;
                        kept.push(Segment {
                            start: seg.start,
                            count: keep,
                            pv: seg.pv.clone(),
                            pstart: seg.pstart,
                        });
                        freed.push(Area::new(seg.pv.clone(), seg.pstart + keep, seg.count - keep));
                    } else {
                        freed.push(seg.area());
                    }
                    cum += seg.count;
                }
                lv.segments = kept;
                self.free_space = extent::add(&self.free_space, &freed);
            }
            RedoOp::LvSetStatus { id, status } => {
                let lv = self
                    .lvs
                    .get_mut(id)
                    .ok_or_else(|| XvError::NotFound(id.clone()))?;
                lv.status = status.clone();
            }
            RedoOp::LvAddTag { id, tag } => {
                let lv = self
                    .lvs
                    .get_mut(id)
                    .ok_or_else(|| XvError::NotFound(id.clone()))?;
                if !lv.tags.contains(tag) {
                    lv.tags.push(tag.clone());
                }
            }
            RedoOp::LvRemoveTag { id, tag } => {
                let lv = self
                    .lvs
                    .get_mut(id)
                    .ok_or_else(|| XvError::NotFound(id.clone()))?;
                lv.tags.retain(|t| t != tag);
            }
        }
        Ok(())
    }
}
