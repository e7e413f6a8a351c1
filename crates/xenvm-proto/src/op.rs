//! Redo operations and queue items.
//!
//! A [`RedoOp`] is a single serialisable VG mutation; the two item types
//! below travel through the per-host shared-block rings and the daemon
//! journal.

use serde::{Deserialize, Serialize};

use crate::extent::Area;
use crate::vg::{Lv, LvStatus, Segment};

/// A single serialisable VG mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RedoOp {
    LvCreate {
        lv: Lv,
    },
    LvRemove {
        id: String,
    },
    LvRename {
        id: String,
        new_name: String,
    },
    LvExpand {
        id: String,
        segments: Vec<Segment>,
    },
    /// Remove the intersection with `areas`. Ownership of the removed
    /// extents transfers elsewhere, so free space is not credited.
    LvCrop {
        id: String,
        areas: Vec<Area>,
    },
    /// Shrink to `new_size` extents, returning the tail to free space.
    LvReduce {
        id: String,
        new_size: u64,
    },
    LvSetStatus {
        id: String,
        status: Vec<LvStatus>,
    },
    LvAddTag {
        id: String,
        tag: String,
    },
    LvRemoveTag {
        id: String,
        tag: String,
    },
}

/// Host → daemon (`toLVM` ring): extend `volume` with extents the host
/// carved from its free pool. The segments carry the placement within the
/// target volume.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExpandVolume {
    pub volume: String,
    pub segments: Vec<Segment>,
}

/// Daemon → host (`fromLVM` ring) and the daemon's journal record: extents
/// granted to `host`'s free pool.
///
/// The segments carry fixed logical starts, computed when the grant is
/// journalled, so that replaying the record is idempotent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FreeAllocation {
    pub host: String,
    pub segments: Vec<Segment>,
}
