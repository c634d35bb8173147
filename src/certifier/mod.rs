//! Group-Replication-style certifier core (spec.md §4.9): optimistic
//! conflict detection over a write set plus global identifier assignment
//! and parallel-apply timestamp computation, independent of the block
//! cache above.

pub mod gtid;
pub mod wire;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{info, trace};
use uuid::Uuid;

use crate::error::{CacheError, Result};
use crate::CertifierConfig;
use gtid::{Gno, Gtid, GtidSet};

pub type Fingerprint = Vec<u8>;

/// Transactions touching more rows than this (or none at all) serialize
/// behind everything already certified, rather than running concurrently
/// with the last committed transaction on the same row set (spec.md §4.9
/// step 3). Kept as an internal constant rather than a config knob since
/// the configuration surface is fixed (see DESIGN.md).
const LARGE_WRITE_SET_THRESHOLD: usize = 1000;

/// One certification-table entry. Reference-counted (spec.md §3: "entries
/// are reference-counted so many fingerprints can share one version
/// object") since every fingerprint written by the same transaction ends
/// up pointing at the identical `(snapshot, sequence_number)` pair.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CertificationRecord {
    pub snapshot: GtidSet,
    pub sequence_number: u64,
}

/// Outcome of [`Certifier::certify`]. `Negative` is a normal conflict
/// abort; `Error` is reserved for allocation/serialisation failures
/// (spec.md §7: the two are distinct dispositions).
#[derive(Debug, Clone, PartialEq)]
pub enum CertifyOutcome {
    Positive {
        global_identifier: Gtid,
        last_committed: u64,
        sequence_number: u64,
    },
    Negative,
    Error(String),
}

/// Full certification-table dump, the payload of `get_certification_info`/
/// `set_certification_info` (spec.md §6, invariant 9: round-trips up to
/// equivalent encodings).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct CertificationInfo {
    pub entries: Vec<(Fingerprint, CertificationRecord)>,
    pub executed: GtidSet,
    pub parallel_applier_sequence_number: u64,
    pub parallel_applier_last_committed_global: u64,
}

struct Inner {
    table: HashMap<Fingerprint, Arc<CertificationRecord>>,
    executed: GtidSet,
    /// last executed set reported by each member, including ourselves;
    /// intersected for garbage collection.
    received_executed: HashMap<Uuid, GtidSet>,
    parallel_applier_sequence_number: u64,
    parallel_applier_last_committed_global: u64,
    conflict_detection_enabled: bool,
    local_block_next: Gno,
    local_block_remaining: u64,
    positive_count: u64,
    negative_count: u64,
    last_conflict_free_id: Option<Gtid>,
}

impl Inner {
    fn new() -> Self {
        Inner {
            table: HashMap::new(),
            executed: GtidSet::new(),
            received_executed: HashMap::new(),
            parallel_applier_sequence_number: 1,
            parallel_applier_last_committed_global: 0,
            conflict_detection_enabled: true,
            local_block_next: 1,
            local_block_remaining: 0,
            positive_count: 0,
            negative_count: 0,
            last_conflict_free_id: None,
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct CertifierStats {
    pub positive: u64,
    pub negative: u64,
    pub table_size: usize,
    pub last_conflict_free_id: Option<Gtid>,
}

pub struct Certifier {
    member: Uuid,
    config: CertifierConfig,
    inner: Mutex<Inner>,
    broadcast_running: Arc<AtomicBool>,
}

impl Certifier {
    pub fn new(member: Uuid, config: CertifierConfig) -> Self {
        Certifier {
            member,
            config,
            inner: Mutex::new(Inner::new()),
            broadcast_running: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn enable_conflict_detection(&self) {
        self.inner.lock().conflict_detection_enabled = true;
    }

    pub fn disable_conflict_detection(&self) {
        self.inner.lock().conflict_detection_enabled = false;
    }

    /// spec.md §4.9 algorithm, steps 1-4.
    pub fn certify(
        &self,
        mut snapshot_version: GtidSet,
        write_set: &[Fingerprint],
        specified: Option<Gtid>,
    ) -> CertifyOutcome {
        let mut inner = self.inner.lock();

        if inner.conflict_detection_enabled {
            for fp in write_set {
                if let Some(record) = inner.table.get(fp) {
                    if !record.snapshot.is_subset_of(&snapshot_version) {
                        inner.negative_count += 1;
                        trace!(?fp, "certify: stale snapshot, negative");
                        return CertifyOutcome::Negative;
                    }
                }
            }
        }

        let global_identifier = match specified {
            Some(gtid) => {
                if inner.executed.contains(&gtid) {
                    return CertifyOutcome::Error(format!("identifier collision on {gtid:?}"));
                }
                gtid
            }
            None => self.mint_global_identifier(&mut inner),
        };
        snapshot_version.add(global_identifier);
        inner.executed.add(global_identifier);

        let is_large = write_set.is_empty() || write_set.len() > LARGE_WRITE_SET_THRESHOLD;

        let previous_max_seq = write_set
            .iter()
            .filter_map(|fp| inner.table.get(fp))
            .map(|r| r.sequence_number)
            .max()
            .unwrap_or(0);

        let sequence_number = inner.parallel_applier_sequence_number;
        inner.parallel_applier_sequence_number += 1;

        let last_committed = if is_large {
            let lc = sequence_number.saturating_sub(1);
            inner.parallel_applier_last_committed_global = sequence_number;
            lc
        } else {
            previous_max_seq.max(inner.parallel_applier_last_committed_global)
        };

        let record = Arc::new(CertificationRecord {
            snapshot: snapshot_version,
            sequence_number,
        });
        for fp in write_set {
            inner.table.insert(fp.clone(), record.clone());
        }

        inner.positive_count += 1;
        inner.last_conflict_free_id = Some(global_identifier);

        if self.config.preemptive_garbage_collection
            && inner.table.len() > self.config.preemptive_garbage_collection_rows_threshold
        {
            self.garbage_collect_locked(&mut inner);
        }

        CertifyOutcome::Positive {
            global_identifier,
            last_committed,
            sequence_number,
        }
    }

    /// Per-member block allocator (spec.md §4.9 step 2, "mint one from a
    /// per-member block allocator"): reserve `gtid_assignment_block_size`
    /// sequence numbers at a time to cut down on metadata churn.
    fn mint_global_identifier(&self, inner: &mut Inner) -> Gtid {
        if inner.local_block_remaining == 0 {
            let floor = inner.executed.next_gno(&self.member).max(inner.local_block_next);
            inner.local_block_next = floor;
            inner.local_block_remaining = self.config.gtid_assignment_block_size.max(1);
        }
        let gno = inner.local_block_next;
        inner.local_block_next += 1;
        inner.local_block_remaining -= 1;
        Gtid { member: self.member, gno }
    }

    /// `add_gtid_to_executed`: record a GTID as applied without going
    /// through `certify` (used for transactions that bypass certification,
    /// e.g. during recovery replay).
    pub fn add_gtid_to_executed(&self, gtid: Gtid) {
        self.inner.lock().executed.add(gtid);
    }

    pub fn get_stable_set_text(&self) -> String {
        self.inner.lock().received_executed.values().fold(None, |acc: Option<GtidSet>, set| {
            Some(match acc {
                Some(a) => a.intersect(set),
                None => set.clone(),
            })
        }).unwrap_or_default().to_text()
    }

    /// Record a member's reported executed set (including our own via
    /// [`Self::local_executed_set`]) ahead of the next `run_gc` pass.
    pub fn record_reported_executed_set(&self, member: Uuid, set: GtidSet) {
        self.inner.lock().received_executed.insert(member, set);
    }

    pub fn local_executed_set(&self) -> GtidSet {
        self.inner.lock().executed.clone()
    }

    /// Garbage collection (spec.md §4.9): intersect every received
    /// executed set into the stable set, then drop any certification
    /// record whose snapshot is already covered by it — every member has
    /// applied everything that record could conflict with.
    pub fn run_gc(&self) {
        let mut inner = self.inner.lock();
        self.garbage_collect_locked(&mut inner);
    }

    fn garbage_collect_locked(&self, inner: &mut Inner) {
        if inner.received_executed.is_empty() {
            return;
        }
        let stable = inner
            .received_executed
            .values()
            .fold(None::<GtidSet>, |acc, set| Some(match acc {
                Some(a) => a.intersect(set),
                None => set.clone(),
            }))
            .unwrap_or_default();
        let before = inner.table.len();
        inner.table.retain(|_, record| !record.snapshot.is_strict_subset_of(&stable));
        let dropped = before - inner.table.len();
        if dropped > 0 {
            info!(dropped, remaining = inner.table.len(), "certifier garbage collection");
        }
    }

    /// `generate_view_change_gtid`: reserve a GTID for a view-change
    /// pseudo-transaction, marking it executed immediately (view changes
    /// never go through ordinary certify/commit).
    pub fn generate_view_change_gtid(&self) -> Gtid {
        let mut inner = self.inner.lock();
        let gtid = self.mint_global_identifier(&mut inner);
        inner.executed.add(gtid);
        gtid
    }

    /// `handle_view_change`: fold a newly observed primary's executed set
    /// into ours (both the "group" and "global" views collapse to the
    /// same `executed` set in this implementation — see DESIGN.md for why
    /// the original's two-map split isn't reproduced).
    pub fn handle_view_change(&self, primary_executed: &GtidSet) {
        let mut inner = self.inner.lock();
        for (member, intervals) in primary_executed.members() {
            for interval in intervals {
                let mut gno = interval.start;
                while gno <= interval.end {
                    inner.executed.add(Gtid { member: *member, gno });
                    gno += 1;
                }
            }
        }
    }

    pub fn get_certification_info(&self) -> CertificationInfo {
        let inner = self.inner.lock();
        CertificationInfo {
            entries: inner.table.iter().map(|(fp, rec)| (fp.clone(), (**rec).clone())).collect(),
            executed: inner.executed.clone(),
            parallel_applier_sequence_number: inner.parallel_applier_sequence_number,
            parallel_applier_last_committed_global: inner.parallel_applier_last_committed_global,
        }
    }

    pub fn set_certification_info(&self, info: CertificationInfo) {
        let mut inner = self.inner.lock();
        inner.table = info.entries.into_iter().map(|(fp, rec)| (fp, Arc::new(rec))).collect();
        inner.executed = info.executed;
        inner.parallel_applier_sequence_number = info.parallel_applier_sequence_number;
        inner.parallel_applier_last_committed_global = info.parallel_applier_last_committed_global;
    }

    pub fn certification_info_size(&self) -> Result<usize> {
        let info = self.get_certification_info();
        serde_json::to_vec(&info).map(|v| v.len()).map_err(CacheError::from)
    }

    pub fn stats(&self) -> CertifierStats {
        let inner = self.inner.lock();
        CertifierStats {
            positive: inner.positive_count,
            negative: inner.negative_count,
            table_size: inner.table.len(),
            last_conflict_free_id: inner.last_conflict_free_id,
        }
    }

    /// Background worker (spec.md §4.9 "Broadcast thread"): ticks once per
    /// second, and every 60th tick hands the local executed set to
    /// `on_broadcast` for transmission to the group. Mirrors the teacher's
    /// `start_tier_manager` shape (spawn, loop on an `AtomicBool`, sleep,
    /// do work).
    pub fn start_broadcast_thread<F>(self: &Arc<Self>, on_broadcast: F)
    where
        F: Fn(&GtidSet) + Send + 'static,
    {
        if self.broadcast_running.swap(true, Ordering::Acquire) {
            return;
        }
        let certifier = self.clone();
        let running = self.broadcast_running.clone();
        let period = self.config.certifier_broadcast_period;
        std::thread::spawn(move || {
            let mut ticks: u64 = 0;
            while running.load(Ordering::Acquire) {
                std::thread::sleep(period);
                ticks += 1;
                // flow-control accounting hook: the core doesn't interpret
                // throttling policy, just ticks the clock for it.
                if ticks % 60 == 0 {
                    let executed = certifier.local_executed_set();
                    on_broadcast(&executed);
                }
            }
        });
    }

    pub fn stop_broadcast_thread(&self) {
        self.broadcast_running.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member(n: u8) -> Uuid {
        Uuid::from_bytes([n; 16])
    }

    #[test]
    fn conflicting_writers_get_negative() {
        let certifier = Certifier::new(member(1), CertifierConfig::default());
        let a = member(0xA);
        let mut snapshot = GtidSet::new();
        for g in 1..=5 {
            snapshot.add(Gtid { member: a, gno: g });
        }
        let outcome1 = certifier.certify(snapshot.clone(), &[b"k".to_vec()], None);
        assert!(matches!(outcome1, CertifyOutcome::Positive { .. }));

        let outcome2 = certifier.certify(snapshot, &[b"k".to_vec()], None);
        assert_eq!(outcome2, CertifyOutcome::Negative);
    }

    #[test]
    fn non_conflicting_subset_certifies_positively() {
        let certifier = Certifier::new(member(2), CertifierConfig::default());
        let a = member(0xA);
        let mut snap1 = GtidSet::new();
        for g in 1..=5 {
            snap1.add(Gtid { member: a, gno: g });
        }
        let CertifyOutcome::Positive { global_identifier, .. } =
            certifier.certify(snap1.clone(), &[b"k".to_vec()], None)
        else {
            panic!("expected positive");
        };

        let mut snap3 = snap1.clone();
        snap3.add(global_identifier);
        let outcome3 = certifier.certify(snap3, &[b"k".to_vec()], None);
        assert!(matches!(outcome3, CertifyOutcome::Positive { .. }));

        let info = certifier.get_certification_info();
        let (_, record) = info.entries.iter().find(|(fp, _)| fp == b"k").unwrap();
        assert!(record.snapshot.contains(&global_identifier));
    }

    #[test]
    fn sequence_numbers_strictly_increase() {
        let certifier = Certifier::new(member(3), CertifierConfig::default());
        let mut last_seq = 0;
        for i in 0..5u64 {
            let outcome = certifier.certify(GtidSet::new(), &[format!("k{i}").into_bytes()], None);
            let CertifyOutcome::Positive { sequence_number, last_committed, .. } = outcome else {
                panic!("expected positive");
            };
            assert!(sequence_number > last_seq);
            assert!(last_committed < sequence_number);
            last_seq = sequence_number;
        }
    }

    #[test]
    fn large_write_set_serialises_behind_everything() {
        let certifier = Certifier::new(member(4), CertifierConfig::default());
        let big: Vec<Fingerprint> = (0..(LARGE_WRITE_SET_THRESHOLD + 1)).map(|i| format!("k{i}").into_bytes()).collect();
        let outcome = certifier.certify(GtidSet::new(), &big, None);
        let CertifyOutcome::Positive { last_committed, sequence_number, .. } = outcome else {
            panic!("expected positive");
        };
        assert_eq!(last_committed, sequence_number - 1);
    }

    #[test]
    fn gc_keeps_records_at_the_stable_set() {
        let certifier = Certifier::new(member(5), CertifierConfig::default());
        let outcome = certifier.certify(GtidSet::new(), &[b"k".to_vec()], None);
        assert!(matches!(outcome, CertifyOutcome::Positive { .. }));
        assert_eq!(certifier.stats().table_size, 1);

        // every member has caught up to exactly this record's snapshot:
        // not yet safe to drop, since a conflicting transaction could still
        // certify against it.
        let executed = certifier.local_executed_set();
        certifier.record_reported_executed_set(member(5), executed.clone());
        certifier.record_reported_executed_set(member(6), executed);
        certifier.run_gc();
        assert_eq!(certifier.stats().table_size, 1);
    }

    #[test]
    fn gc_drops_records_strictly_below_stable_set() {
        let certifier = Certifier::new(member(5), CertifierConfig::default());
        let outcome = certifier.certify(GtidSet::new(), &[b"k".to_vec()], None);
        assert!(matches!(outcome, CertifyOutcome::Positive { .. }));
        assert_eq!(certifier.stats().table_size, 1);

        // a later transaction advances the executed set past the first
        // record's snapshot; once every member reports having caught up
        // to that later point, the first record is safe to drop while the
        // later one, whose snapshot equals the new stable set, survives.
        let snapshot_so_far = certifier.local_executed_set();
        certifier.certify(snapshot_so_far, &[b"k2".to_vec()], None);
        let executed = certifier.local_executed_set();
        certifier.record_reported_executed_set(member(5), executed.clone());
        certifier.record_reported_executed_set(member(6), executed);
        certifier.run_gc();
        assert_eq!(certifier.stats().table_size, 1);
    }

    #[test]
    fn certification_info_round_trips() {
        let certifier = Certifier::new(member(7), CertifierConfig::default());
        certifier.certify(GtidSet::new(), &[b"k1".to_vec()], None);
        certifier.certify(GtidSet::new(), &[b"k2".to_vec()], None);
        let dumped = certifier.get_certification_info();

        let restored = Certifier::new(member(7), CertifierConfig::default());
        restored.set_certification_info(dumped.clone());
        assert_eq!(restored.get_certification_info(), dumped);
    }
}
