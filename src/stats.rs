// Copyright 2017-2018 the authors. See the 'Copyright and license' section of the
// README.md file at the top-level directory of this repository.
//
// Licensed under the Apache License, Version 2.0 (the LICENSE-APACHE file) or
// the MIT license (the LICENSE-MIT file) at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Counters describing the activity of a root allocator.
//!
//! Counters play no part in correctness. They are relaxed atomics, reset by `setup`, and a
//! snapshot taken while other threads are running may mix values from different instants.

use core::fmt::{self, Display, Formatter};
use core::sync::atomic::AtomicU64;
use core::sync::atomic::Ordering::Relaxed;

macro_rules! counters {
    ($($(#[$attr:meta])* $name:ident,)*) => {
        #[derive(Default)]
        pub struct Stats {
            $(pub $name: AtomicU64,)*
        }

        /// A copy of an allocator's counters at some point in time.
        #[derive(Copy, Clone, Default, Debug, PartialEq, Eq)]
        pub struct StatsSnapshot {
            $($(#[$attr])* pub $name: u64,)*
            /// Number of ring link rewrites.
            pub ring_operations: u64,
            /// `log2` of the pool size in bytes.
            pub pool_log_size: u32,
            /// Number of root slots in one pool.
            pub roots_per_pool: u64,
        }

        impl Stats {
            pub fn snapshot(&self) -> StatsSnapshot {
                StatsSnapshot {
                    $($name: self.$name.load(Relaxed),)*
                    ..StatsSnapshot::default()
                }
            }

            pub fn reset(&self) {
                $(self.$name.store(0, Relaxed);)*
            }
        }
    };
}

counters! {
    minor_collections,
    /// Major collections, and any other pass that is not minor.
    major_collections,
    total_create,
    total_delete,
    total_modify,
    /// Slots visited by major scans, free or not.
    total_scanning_work,
    /// Occupied slots visited by major scans.
    useful_scanning_work,
    total_major_time_ns,
    peak_major_time_ns,
    total_alloced_pools,
    total_freed_pools,
    live_pools,
    peak_pools,
    /// Slots registered with the remembered set.
    remember,
    find_available_pool,
    /// Pools inspected while looking for an available pool.
    find_available_pool_work,
}

#[inline]
pub fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Relaxed);
}

impl Stats {
    pub fn pool_alloced(&self) {
        bump(&self.total_alloced_pools);
        let live = self.live_pools.fetch_add(1, Relaxed) + 1;
        self.peak_pools.fetch_max(live, Relaxed);
    }

    pub fn pool_freed(&self) {
        bump(&self.total_freed_pools);
        self.live_pools.fetch_sub(1, Relaxed);
    }

    pub fn major_scan_time(&self, ns: u64) {
        self.total_major_time_ns.fetch_add(ns, Relaxed);
        self.peak_major_time_ns.fetch_max(ns, Relaxed);
    }
}

// round to nearest
fn average(total: u64, n: u64) -> Option<u64> {
    if n == 0 {
        None
    } else {
        Some((total + n / 2) / n)
    }
}

struct Avg(Option<u64>);

impl Display for Avg {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self.0 {
            Some(n) => write!(f, "{}", n),
            None => write!(f, "-"),
        }
    }
}

impl StatsSnapshot {
    /// Size of `count` pools, in units of `2^(10 * unit)` bytes (1 = KiB, 2 = MiB).
    fn size_of_pools(&self, count: u64, unit: u32) -> u64 {
        let log = self.pool_log_size as i64 - 10 * unit as i64;
        if log >= 0 {
            count << log
        } else {
            count >> -log
        }
    }

    /// Whether the allocator ever did anything worth reporting.
    pub fn used(&self) -> bool {
        self.total_alloced_pools > 0 || self.ring_operations > 0
    }
}

impl Display for StatsSnapshot {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        writeln!(f, "minor collections: {}", self.minor_collections)?;
        writeln!(f, "major collections (and others): {}", self.major_collections)?;
        if !self.used() {
            return Ok(());
        }

        writeln!(
            f,
            "pool log size: {} ({} KiB, {} roots/pool)",
            self.pool_log_size,
            self.size_of_pools(1, 1),
            self.roots_per_pool
        )?;
        writeln!(
            f,
            "total allocated pools: {} ({} MiB)",
            self.total_alloced_pools,
            self.size_of_pools(self.total_alloced_pools, 2)
        )?;
        writeln!(
            f,
            "peak allocated pools: {} ({} MiB)",
            self.peak_pools,
            self.size_of_pools(self.peak_pools, 2)
        )?;
        writeln!(
            f,
            "total freed pools: {} ({} MiB)",
            self.total_freed_pools,
            self.size_of_pools(self.total_freed_pools, 2)
        )?;

        let useful_pct = if self.total_scanning_work == 0 {
            100
        } else {
            self.useful_scanning_work * 100 / self.total_scanning_work
        };
        writeln!(
            f,
            "work per major: {} ({} useful)",
            Avg(average(self.total_scanning_work, self.major_collections)),
            Avg(average(self.useful_scanning_work, self.major_collections))
        )?;
        writeln!(
            f,
            "total scanning work: {} ({}% useful)",
            self.total_scanning_work, useful_pct
        )?;
        writeln!(
            f,
            "average time per major: {}ns",
            Avg(average(self.total_major_time_ns, self.major_collections))
        )?;
        writeln!(f, "peak time per major: {}ns", self.peak_major_time_ns)?;
        writeln!(f, "total ring operations: {}", self.ring_operations)?;
        writeln!(
            f,
            "ring operations per pool: {}",
            Avg(average(self.ring_operations, self.total_alloced_pools))
        )?;
        writeln!(f, "total created: {}", self.total_create)?;
        writeln!(f, "total deleted: {}", self.total_delete)?;
        writeln!(f, "total modified: {}", self.total_modify)?;
        writeln!(f, "remembered: {}", self.remember)?;
        writeln!(
            f,
            "find_available_pool: {} ({} work)",
            self.find_available_pool, self.find_available_pool_work
        )
    }
}
