// Copyright 2017-2018 the authors. See the 'Copyright and license' section of the
// README.md file at the top-level directory of this repository.
//
// Licensed under the Apache License, Version 2.0 (the LICENSE-APACHE file) or
// the MIT license (the LICENSE-MIT file) at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Scanning roots at collection safepoints.
//!
//! A minor pass walks no slot at all: young roots are already in the remembered set, which the
//! collector clears afterwards. All that is left to do is to hand the minor free lists back to
//! the major free lists, since their slots are no longer remembered.
//!
//! A major pass reports every occupied slot of every pool to the collector's action. It then
//! moves parked pools that have room again back to the active ring, and releases empty pools,
//! keeping the first one so that a workload oscillating around a pool boundary does not map and
//! unmap a pool at every collection.

use core::sync::atomic::Ordering::Relaxed;
use std::time::Instant;

use crate::backing::PoolSource;
use crate::collector::{Collector, RootSlot, ScanAction};
use crate::pool::Pool;
use crate::ring::{Ring, Rings};
use crate::slot::SlotState;
use crate::Roots;

const RINGS: [Ring; 2] = [Ring::Active, Ring::Parked];

impl<C: Collector, S: PoolSource> Roots<C, S> {
    pub(crate) fn scan_minor(&self, rings: &Rings) {
        for &ring in RINGS.iter() {
            for id in rings.ids(ring) {
                rings.pool(id).flush_minor();
            }
        }
        trace!("minor scan: flushed {} pools", rings.live());
        if cfg!(feature = "validate-all") {
            self.validate_all(rings);
        }
    }

    pub(crate) fn scan_major(&self, rings: &mut Rings, action: &mut dyn ScanAction) {
        let start = Instant::now();
        if cfg!(debug_assertions) {
            self.validate_all(rings);
        }

        let (mut work, mut useful) = (0, 0);
        for &ring in RINGS.iter() {
            for id in rings.ids(ring) {
                let (w, u) = self.scan_pool(rings.pool(id), action);
                work += w;
                useful += u;
            }
        }
        self.demote_parked(rings);
        self.free_empty_pools(rings);

        let ns = start.elapsed().as_nanos() as u64;
        self.stats.total_scanning_work.fetch_add(work, Relaxed);
        self.stats.useful_scanning_work.fetch_add(useful, Relaxed);
        self.stats.major_scan_time(ns);
        trace!(
            "major scan: {} roots in {} slots, {} pools left, {}ns",
            useful,
            work,
            rings.live(),
            ns
        );
        if cfg!(debug_assertions) {
            self.validate_all(rings);
        }
    }

    /// Applies `action` to the occupied slots of `pool`. Returns the number of slots visited and
    /// the number of occupied ones.
    fn scan_pool(&self, pool: Pool, action: &mut dyn ScanAction) -> (u64, u64) {
        let live = pool.alloc_count();
        let (base, size) = (pool.base(), self.layout.size);
        // stop as soon as every occupied slot has been seen
        let mut to_find = live;
        let mut work = 0;
        for slot in pool.slots(&self.layout) {
            if to_find == 0 {
                break;
            }
            work += 1;
            if let SlotState::Occupied(v) = slot.state(base, size) {
                to_find -= 1;
                debug_assert!(
                    v.is_immediate() || !self.collector.is_young(v),
                    "young value {:?} in a root during a major scan",
                    v
                );
                action.visit(v, &RootSlot::new(slot));
            }
        }
        debug_assert_eq!(to_find, 0, "pool {:#x} has fewer roots than counted", base);
        (work, live as u64)
    }

    fn demote_parked(&self, rings: &mut Rings) {
        let threshold = self.layout.demote_threshold();
        for id in rings.ids(Ring::Parked) {
            if rings.pool(id).alloc_count() <= threshold {
                rings.remove(id);
                rings.push_back(id, Ring::Active);
                debug!("major scan: pool {} back in the active ring", id);
            }
        }
    }

    fn free_empty_pools(&self, rings: &mut Rings) {
        let mut kept = false;
        for id in rings.ids(Ring::Active) {
            if !rings.pool(id).is_empty() {
                continue;
            }
            if !kept {
                kept = true;
                continue;
            }
            self.free_pool(rings, id);
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::collector::{Pass, RootSlot, ScanAction, ScanRoots};
    use crate::tests::{init_logging, FakeGc};
    use crate::value::Value;
    use crate::{Root, RootsBuilder};

    struct Count(usize);

    impl ScanAction for Count {
        fn visit(&mut self, _old: Value, _slot: &RootSlot) {
            self.0 += 1;
        }
    }

    #[test]
    fn test_minor_scan_flushes() {
        init_logging();
        let gc = FakeGc::new();
        let roots = RootsBuilder::default().pool_log_size(9).build(gc.clone());
        assert!(roots.setup());

        let young = gc.alloc_young();
        let r = roots.create(young).unwrap();
        roots.delete(r);
        {
            let rings = roots.rings.lock();
            let pool = rings.pool(rings.head(crate::ring::Ring::Active).unwrap());
            assert!(pool.has_minor_free());
        }

        gc.minor();
        let rings = roots.rings.lock();
        let pool = rings.pool(rings.head(crate::ring::Ring::Active).unwrap());
        assert!(!pool.has_minor_free());
        let (major, minor) = pool.free_list_lens(&roots.layout);
        assert_eq!((major, minor), (roots.layout.capacity, 0));
    }

    #[test]
    fn test_major_scan_visits_every_root() {
        init_logging();
        let gc = FakeGc::new();
        let roots = RootsBuilder::default().pool_log_size(9).build(gc.clone());
        roots.setup();

        let n = roots.layout.capacity * 2 + 5;
        let mut held: Vec<Root> = (0..n)
            .map(|i| roots.create(Value::from_int(i as isize)).unwrap())
            .collect();
        // punch holes so that the walk has to skip free slots
        for i in (0..n).rev().step_by(3) {
            roots.delete(held.remove(i));
        }

        let mut count = Count(0);
        roots.scan_roots(&mut count, Pass::Major);
        assert_eq!(count.0, held.len());

        let stats = roots.stats();
        assert_eq!(stats.major_collections, 1);
        assert_eq!(stats.useful_scanning_work, held.len() as u64);
        assert!(stats.total_scanning_work >= stats.useful_scanning_work);

        // minor passes report nothing
        let mut count = Count(0);
        roots.scan_roots(&mut count, Pass::Minor);
        assert_eq!(count.0, 0);

        for r in held {
            roots.delete(r);
        }
    }

    #[test]
    fn test_major_scan_demotes_parked() {
        init_logging();
        let gc = FakeGc::new();
        let roots = RootsBuilder::default().pool_log_size(9).build(gc.clone());
        roots.setup();

        let cap = roots.layout.capacity;
        let mut first: Vec<Root> = (0..cap).map(|_| roots.create(Value::UNIT).unwrap()).collect();
        // the next create parks the full pool
        let extra = roots.create(Value::UNIT).unwrap();
        assert_eq!(roots.rings.lock().len(crate::ring::Ring::Parked), 1);

        // drop below the threshold without hitting it exactly on a delete
        let keep = roots.layout.demote_threshold() - 1;
        let removed: Vec<Root> = first.drain(keep..).collect();
        {
            // unlink the pool by hand so that deletes cannot demote it
            let mut rings = roots.rings.lock();
            let id = rings.head(crate::ring::Ring::Parked).unwrap();
            let pool = rings.pool(id);
            for r in removed {
                let slot = unsafe { r.0.as_ref() };
                pool.push_major(slot);
                core::mem::forget(r);
            }
            assert_eq!(rings.len(crate::ring::Ring::Parked), 1);
        }

        roots.scan_roots(&mut Count(0), Pass::Major);
        let rings = roots.rings.lock();
        assert_eq!(rings.len(crate::ring::Ring::Parked), 0);
        assert_eq!(rings.len(crate::ring::Ring::Active), 2);
        drop(rings);

        roots.delete(extra);
        for r in first {
            roots.delete(r);
        }
    }
}
