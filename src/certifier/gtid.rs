//! Global transaction identifiers and snapshot versions (spec.md §3, §4.9).
//!
//! A `Gtid` is `(member_uuid, sequence_number)`; a `GtidSet` stores, per
//! member, a sorted run-length list of `sequence_number` intervals so a
//! snapshot with millions of committed transactions stays compact.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type Gno = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Gtid {
    pub member: Uuid,
    pub gno: Gno,
}

/// Inclusive `[start, end]` run of sequence numbers for one member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GnoInterval {
    pub start: Gno,
    pub end: Gno,
}

impl GnoInterval {
    pub fn contains(&self, gno: Gno) -> bool {
        gno >= self.start && gno <= self.end
    }
}

/// A set of committed transaction identifiers, represented as sorted,
/// merged `GnoInterval` runs per member UUID — the same shape as MySQL's
/// `Gtid_set`/`Sid_map` pairing, minus the separate group/global sid-map
/// split (see DESIGN.md for that Open Question's resolution).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GtidSet {
    members: BTreeMap<Uuid, Vec<GnoInterval>>,
}

impl GtidSet {
    pub fn new() -> Self {
        GtidSet::default()
    }

    pub fn contains(&self, gtid: &Gtid) -> bool {
        self.members
            .get(&gtid.member)
            .map(|intervals| intervals.iter().any(|i| i.contains(gtid.gno)))
            .unwrap_or(false)
    }

    /// `self ⊆ other`: every identifier in `self` is also in `other`.
    pub fn is_subset_of(&self, other: &GtidSet) -> bool {
        self.members.iter().all(|(member, intervals)| {
            intervals.iter().all(|i| {
                let other_intervals = other.members.get(member).map(Vec::as_slice).unwrap_or(&[]);
                interval_covered(*i, other_intervals)
            })
        })
    }

    /// `self == other`: strict subset means `self.is_subset_of(other) &&
    /// self != other` (used by the garbage collector's stable-set test).
    pub fn is_strict_subset_of(&self, other: &GtidSet) -> bool {
        self.is_subset_of(other) && self != other
    }

    pub fn add(&mut self, gtid: Gtid) {
        let intervals = self.members.entry(gtid.member).or_default();
        insert_and_merge(intervals, gtid.gno);
    }

    /// Intersection used by garbage collection's "stable set" computation.
    pub fn intersect(&self, other: &GtidSet) -> GtidSet {
        let mut result = GtidSet::new();
        for (member, intervals) in &self.members {
            let Some(other_intervals) = other.members.get(member) else { continue };
            for &a in intervals {
                for &b in other_intervals {
                    let lo = a.start.max(b.start);
                    let hi = a.end.min(b.end);
                    if lo <= hi {
                        for gno in lo..=hi {
                            result.add(Gtid { member: *member, gno });
                        }
                    }
                }
            }
        }
        result
    }

    pub fn is_empty(&self) -> bool {
        self.members.values().all(|v| v.is_empty())
    }

    pub fn members(&self) -> impl Iterator<Item = (&Uuid, &[GnoInterval])> {
        self.members.iter().map(|(m, v)| (m, v.as_slice()))
    }

    /// Reserve `count` consecutive sequence numbers for `member`, e.g. for
    /// `generate_view_change_gtid`'s block allocation, returning the first
    /// reserved `Gno`. Caller is responsible for adding the resulting
    /// GTIDs once the transaction actually commits.
    pub fn next_gno(&self, member: &Uuid) -> Gno {
        self.members
            .get(member)
            .and_then(|intervals| intervals.last())
            .map(|i| i.end + 1)
            .unwrap_or(1)
    }

    /// `SELECT @@GLOBAL.GTID_EXECUTED`-style text dump, used by
    /// `get_stable_set_text`: `uuid:start-end:start-end,uuid2:...`.
    pub fn to_text(&self) -> String {
        self.members
            .iter()
            .map(|(member, intervals)| {
                let ranges = intervals
                    .iter()
                    .map(|i| if i.start == i.end { format!("{}", i.start) } else { format!("{}-{}", i.start, i.end) })
                    .collect::<Vec<_>>()
                    .join(":");
                format!("{member}:{ranges}")
            })
            .collect::<Vec<_>>()
            .join(",")
    }
}

fn interval_covered(needle: GnoInterval, haystack: &[GnoInterval]) -> bool {
    let mut gno = needle.start;
    'outer: while gno <= needle.end {
        for hay in haystack {
            if hay.contains(gno) {
                gno = hay.end + 1;
                continue 'outer;
            }
        }
        return false;
    }
    true
}

fn insert_and_merge(intervals: &mut Vec<GnoInterval>, gno: Gno) {
    let pos = intervals.partition_point(|i| i.end + 1 < gno);
    if let Some(prev) = pos.checked_sub(1).and_then(|i| intervals.get(i)) {
        if prev.contains(gno) {
            return;
        }
    }
    if intervals.get(pos).is_some_and(|i| i.contains(gno)) {
        return;
    }
    intervals.insert(pos, GnoInterval { start: gno, end: gno });
    merge_adjacent(intervals, pos);
}

fn merge_adjacent(intervals: &mut Vec<GnoInterval>, around: usize) {
    let mut i = around.saturating_sub(1);
    while i + 1 < intervals.len() {
        if intervals[i].end + 1 >= intervals[i + 1].start {
            intervals[i].end = intervals[i].end.max(intervals[i + 1].end);
            intervals.remove(i + 1);
        } else {
            i += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uuid(n: u8) -> Uuid {
        Uuid::from_bytes([n; 16])
    }

    #[test]
    fn add_merges_adjacent_runs() {
        let mut set = GtidSet::new();
        let m = uuid(1);
        set.add(Gtid { member: m, gno: 1 });
        set.add(Gtid { member: m, gno: 2 });
        set.add(Gtid { member: m, gno: 3 });
        set.add(Gtid { member: m, gno: 5 });
        assert_eq!(set.members.get(&m).unwrap(), &[GnoInterval { start: 1, end: 3 }, GnoInterval { start: 5, end: 5 }]);
    }

    #[test]
    fn subset_check() {
        let m = uuid(2);
        let mut big = GtidSet::new();
        for g in 1..=5 {
            big.add(Gtid { member: m, gno: g });
        }
        let mut small = GtidSet::new();
        small.add(Gtid { member: m, gno: 2 });
        small.add(Gtid { member: m, gno: 4 });
        assert!(small.is_subset_of(&big));
        assert!(!big.is_subset_of(&small));
    }

    #[test]
    fn intersection_is_commutative_and_correct() {
        let m = uuid(3);
        let mut a = GtidSet::new();
        let mut b = GtidSet::new();
        for g in 1..=5 {
            a.add(Gtid { member: m, gno: g });
        }
        for g in 3..=8 {
            b.add(Gtid { member: m, gno: g });
        }
        let i1 = a.intersect(&b);
        let i2 = b.intersect(&a);
        assert_eq!(i1, i2);
        assert!(i1.contains(&Gtid { member: m, gno: 3 }));
        assert!(i1.contains(&Gtid { member: m, gno: 5 }));
        assert!(!i1.contains(&Gtid { member: m, gno: 6 }));
    }
}
