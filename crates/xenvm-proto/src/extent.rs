//! Physical-extent arithmetic.
//!
//! Free space in a volume group is kept as a normalized list of areas:
//! sorted by `(pv, start)`, adjacent runs merged, empty runs dropped.
//! Every function here works on extent counts; sector and byte conversion
//! happens at the edges.

use serde::{Deserialize, Serialize};

use crate::error::{XvError, XvResult};

/// A contiguous run of physical extents on one PV.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Area {
    pub pv: String,
    pub start: u64,
    pub count: u64,
}

impl Area {
    pub fn new(pv: impl Into<String>, start: u64, count: u64) -> Self {
        Self {
            pv: pv.into(),
            start,
            count,
        }
    }

    /// One past the last extent covered.
    pub fn end(&self) -> u64 {
        self.start + self.count
    }

    pub fn overlaps(&self, other: &Area) -> bool {
        self.pv == other.pv && self.start < other.end() && other.start < self.end()
    }
}

/// Sort by `(pv, start)`, merge adjacent and overlapping runs, drop empties.
pub fn normalize(mut areas: Vec<Area>) -> Vec<Area> {
    areas.retain(|a| a.count > 0);
    areas.sort_by(|a, b| (&a.pv, a.start).cmp(&(&b.pv, b.start)));
    let mut out: Vec<Area> = Vec::with_capacity(areas.len());
    for a in areas {
        match out.last_mut() {
            Some(last) if last.pv == a.pv && a.start <= last.end() => {
                last.count = last.count.max(a.end() - last.start);
            }
            _ => out.push(a),
        }
    }
    out
}

/// Total number of extents covered.
pub fn total(areas: &[Area]) -> u64 {
    areas.iter().map(|a| a.count).sum()
}

/// Add `extra` to `free`, merging runs.
pub fn add(free: &[Area], extra: &[Area]) -> Vec<Area> {
    let mut all = free.to_vec();
    all.extend_from_slice(extra);
    normalize(all)
}

/// Remove from `free` every extent that appears in `taken`.
///
/// Extents in `taken` that are not present in `free` are ignored, which is
/// what makes redo-op replay idempotent.
pub fn sub(free: &[Area], taken: &[Area]) -> Vec<Area> {
    let taken = normalize(taken.to_vec());
    let mut out = Vec::new();
    for a in normalize(free.to_vec()) {
        let mut pieces = vec![a];
        for t in &taken {
            let mut next = Vec::new();
            for p in pieces {
                if !p.overlaps(t) {
                    next.push(p);
                    continue;
                }
                if t.start > p.start {
                    next.push(Area::new(p.pv.clone(), p.start, t.start - p.start));
                }
                if t.end() < p.end() {
                    next.push(Area::new(p.pv.clone(), t.end(), p.end() - t.end()));
                }
            }
            pieces = next;
        }
        out.extend(pieces);
    }
    normalize(out)
}

/// The extents present in both lists.
pub fn intersect(xs: &[Area], ys: &[Area]) -> Vec<Area> {
    let ys = normalize(ys.to_vec());
    let mut out = Vec::new();
    for x in normalize(xs.to_vec()) {
        for y in &ys {
            if x.overlaps(y) {
                let start = x.start.max(y.start);
                let end = x.end().min(y.end());
                out.push(Area::new(x.pv.clone(), start, end - start));
            }
        }
    }
    normalize(out)
}

/// First-fit allocation of `count` extents from `free`.
///
/// The result may span several runs. When the total free capacity is below
/// `count` the request fails with `OnlyThisMuchFree`; callers treat that as
/// "skip and retry later", never as a partial success.
pub fn find(free: &[Area], count: u64) -> XvResult<Vec<Area>> {
    if count == 0 {
        return Ok(Vec::new());
    }
    let mut picked = Vec::new();
    let mut remaining = count;
    for a in free {
        if remaining == 0 {
            break;
        }
        let take = remaining.min(a.count);
        if take > 0 {
            picked.push(Area::new(a.pv.clone(), a.start, take));
            remaining -= take;
        }
    }
    if remaining > 0 {
        return Err(XvError::OnlyThisMuchFree(total(free)));
    }
    Ok(picked)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn a(start: u64, count: u64) -> Area {
        Area::new("pv0", start, count)
    }

    #[test]
    fn test_normalize_merges_adjacent_runs() {
        let got = normalize(vec![a(10, 5), a(0, 10), a(20, 0)]);
        assert_eq!(got, vec![a(0, 15)]);
    }

    #[test]
    fn test_normalize_keeps_distinct_pvs_apart() {
        let got = normalize(vec![a(0, 5), Area::new("pv1", 5, 5)]);
        assert_eq!(got.len(), 2);
        assert_eq!(total(&got), 10);
    }

    #[test]
    fn test_sub_splits_a_run() {
        let free = vec![a(0, 100)];
        let got = sub(&free, &[a(40, 20)]);
        assert_eq!(got, vec![a(0, 40), a(60, 40)]);
        assert_eq!(total(&got), 80);
    }

    #[test]
    fn test_sub_ignores_extents_not_free() {
        let free = vec![a(0, 10)];
        let got = sub(&free, &[a(5, 20)]);
        assert_eq!(got, vec![a(0, 5)]);
        // subtracting again changes nothing
        assert_eq!(sub(&got, &[a(5, 20)]), got);
    }

    #[test]
    fn test_add_then_sub_round_trips() {
        let free = vec![a(0, 10), a(50, 10)];
        let grant = vec![a(50, 4)];
        let after = sub(&free, &grant);
        assert_eq!(add(&after, &grant), free);
    }

    #[test]
    fn test_intersect() {
        let xs = vec![a(0, 10), a(20, 10)];
        let ys = vec![a(5, 20)];
        assert_eq!(intersect(&xs, &ys), vec![a(5, 5), a(20, 5)]);
    }

    #[test]
    fn test_find_spans_runs_first_fit() {
        let free = vec![a(0, 4), a(10, 4)];
        let got = find(&free, 6).unwrap();
        assert_eq!(got, vec![a(0, 4), a(10, 2)]);
    }

    #[test]
    fn test_find_reports_total_free_when_short() {
        let free = vec![a(0, 4), a(10, 3)];
        match find(&free, 16) {
            Err(XvError::OnlyThisMuchFree(7)) => {}
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_find_zero_is_empty() {
        assert_eq!(find(&[], 0).unwrap(), Vec::<Area>::new());
    }
}
