// Copyright 2017-2018 the authors. See the 'Copyright and license' section of the
// README.md file at the top-level directory of this repository.
//
// Licensed under the Apache License, Version 2.0 (the LICENSE-APACHE file) or
// the MIT license (the LICENSE-MIT file) at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Stable roots into a generational, moving garbage collector.
//!
//! A `Root` is a handle that foreign code can hold on to for as long as it likes. It refers to
//! one word-sized slot owned by a `Roots` allocator; the collector updates the slot whenever the
//! object it refers to moves, so reading the root always yields the current location.
//!
//! # Design
//!
//! Slots are carved out of fixed-size pools aligned to their own size, in the manner of the
//! aligned slabs of a slab allocator. A root is just the address of its slot, and the pool owning
//! it is found by masking that address.
//!
//! Roots are cheap for the collector as well as for the mutator. Most roots point at young
//! objects and die young. Such roots are registered once in the collector's remembered set (the
//! set of old locations that point into the young generation) and a minor collection never
//! scans the pools at all. To keep that cheap, every pool has two free lists:
//!
//! * The *minor* free list holds slots freed while they pointed at a young object. They are still
//!   in the remembered set, so storing another young value there needs no new registration.
//! * The *major* free list holds every other free slot.
//!
//! At a minor collection the remembered set is cleared, and each minor free list is spliced onto
//! the major one in constant time. Only major collections walk the pools, reporting every
//! occupied slot to the collector.
//!
//! Pools live on two rings. Allocation is served from the head of the *active* ring; pools that
//! become full are *parked* on a second ring so that they do not slow down the search for a free
//! slot, and come back once a quarter of their slots have been freed. Empty pools are only
//! released by major collections, and one empty pool is always kept.
//!
//! # Concurrency
//!
//! `create` and `delete` take a global spin lock for a bounded amount of work. `get` and `modify`
//! are lock-free. Scans are expected to happen at stop-the-world safepoints, but they take the
//! lock as well.

#[macro_use]
extern crate lazy_static;
#[macro_use]
extern crate log;

pub mod backing;
pub mod collector;
mod error;
mod pool;
mod ring;
mod scan;
mod slot;
mod stats;
pub mod value;

use core::fmt::{self, Debug, Formatter};
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::ptr::NonNull;
use std::sync::{Arc, Weak};

use spin::Mutex;

#[cfg(all(unix, feature = "os"))]
pub use backing::MmapSource;
pub use backing::{HeapSource, PoolSource};
pub use collector::{Collector, Pass, RootSlot, ScanAction, ScanRoots};
pub use error::Error;
pub use pool::{MAX_POOL_LOG_SIZE, MIN_POOL_LOG_SIZE};
pub use stats::StatsSnapshot;
pub use value::Value;

use pool::{Pool, PoolLayout};
use ring::{Ring, Rings};
use slot::Slot;
use stats::{bump, Stats};

/// The default `log2` of the pool size: 16 KiB pools.
pub const DEFAULT_POOL_LOG_SIZE: u32 = 14;

// Identifies the allocator that owns a pool, so that debug builds can catch roots handed to the
// wrong allocator.
static NEXT_ID: AtomicUsize = AtomicUsize::new(1);

/// A builder for `Roots` allocators.
#[derive(Copy, Clone, Debug)]
pub struct RootsBuilder {
    pool_log_size: u32,
}

impl Default for RootsBuilder {
    fn default() -> RootsBuilder {
        RootsBuilder {
            pool_log_size: DEFAULT_POOL_LOG_SIZE,
        }
    }
}

impl RootsBuilder {
    /// Configures the size of pools to `2^log_size` bytes.
    ///
    /// Larger pools mean fewer pool allocations and ring operations, but more memory kept alive by
    /// a handful of long-lived roots.
    ///
    /// # Panics
    ///
    /// Panics if `log_size` is not between `MIN_POOL_LOG_SIZE` and `MAX_POOL_LOG_SIZE`.
    pub fn pool_log_size(mut self, log_size: u32) -> RootsBuilder {
        assert!(
            log_size >= MIN_POOL_LOG_SIZE && log_size <= MAX_POOL_LOG_SIZE,
            "pool log size {} out of range [{}, {}]",
            log_size,
            MIN_POOL_LOG_SIZE,
            MAX_POOL_LOG_SIZE
        );
        self.pool_log_size = log_size;
        self
    }

    /// Builds an allocator whose pools come from the global heap.
    pub fn build<C: Collector>(self, collector: C) -> Arc<Roots<C, HeapSource>> {
        self.build_source(collector, HeapSource)
    }

    /// Builds an allocator whose pools are mapped directly from the operating system.
    #[cfg(all(unix, feature = "os"))]
    pub fn build_mmap<C: Collector>(self, collector: C) -> Arc<Roots<C, MmapSource>> {
        self.build_source(collector, MmapSource)
    }

    pub fn build_source<C: Collector, S: PoolSource>(
        self,
        collector: C,
        source: S,
    ) -> Arc<Roots<C, S>> {
        Arc::new(Roots {
            collector,
            source,
            layout: PoolLayout::new(self.pool_log_size),
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            setup: AtomicBool::new(false),
            hooked: AtomicBool::new(false),
            rings: Mutex::new(Rings::new()),
            stats: Stats::default(),
        })
    }
}

/// A root allocator.
///
/// An allocator must be set up with `setup` before any root can be created. It registers itself
/// with its collector at that point, and is scanned at every safepoint from then on.
pub struct Roots<C: Collector, S: PoolSource = HeapSource> {
    collector: C,
    source: S,
    layout: PoolLayout,
    id: usize,
    setup: AtomicBool,
    // whether the scan hook was registered with the collector
    hooked: AtomicBool,
    rings: Mutex<Rings>,
    stats: Stats,
}

/// A handle to a root slot.
///
/// A `Root` is created by `Roots::create` and destroyed by `Roots::delete`; dropping it without
/// deleting it leaks the slot until the allocator is torn down. It does not borrow the
/// allocator, but it must not be used once the allocator has been torn down or dropped.
pub struct Root(NonNull<Slot>);

// The slot is atomic; structural changes to its pool happen under the allocator lock.
unsafe impl Send for Root {}
unsafe impl Sync for Root {}

impl Root {
    fn slot(&self) -> &Slot {
        unsafe { self.0.as_ref() }
    }

    /// Returns the value currently held by the root.
    pub fn get(&self) -> Value {
        self.slot().load()
    }

    /// Returns the address of the root's slot. It stays valid, and keeps designating this root,
    /// until the root is deleted.
    pub fn get_ref(&self) -> *const Value {
        self.0.as_ptr() as *const Value
    }
}

impl Debug for Root {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "Root({:?} @ {:?})", self.get(), self.0)
    }
}

impl<C: Collector, S: PoolSource> Roots<C, S> {
    /// Prepares the allocator for use and registers its scan hook with the collector.
    ///
    /// Returns `false` if the allocator was already set up, in which case nothing happens.
    /// Setting up resets statistics. An allocator may be set up again after `teardown`.
    pub fn setup(self: &Arc<Self>) -> bool
    where
        S: 'static,
    {
        {
            let mut rings = self.rings.lock();
            if self.setup.load(Ordering::Acquire) {
                return false;
            }
            debug_assert_eq!(rings.live(), 0);
            *rings = Rings::new();
            self.stats.reset();
            self.setup.store(true, Ordering::Release);
        }
        if !self.hooked.swap(true, Ordering::AcqRel) {
            let this: Arc<dyn ScanRoots> = self.clone();
            let hook: Weak<dyn ScanRoots> = Arc::downgrade(&this);
            self.collector.register_scan_hook(hook);
        }
        info!(
            "root allocator {} set up with {} roots per pool",
            self.id, self.layout.capacity
        );
        true
    }

    /// Releases every pool. Does nothing if the allocator is not set up.
    ///
    /// # Safety
    ///
    /// No root created by this allocator may be used afterwards, not even by `delete`.
    pub unsafe fn teardown(&self) {
        let mut rings = self.rings.lock();
        if !self.setup.swap(false, Ordering::AcqRel) {
            return;
        }
        let pools = rings.drain();
        let n = pools.len();
        for pool in pools {
            self.release(pool);
        }
        info!("root allocator {} torn down, released {} pools", self.id, n);
    }

    pub fn is_setup(&self) -> bool {
        self.setup.load(Ordering::Acquire)
    }

    pub fn collector(&self) -> &C {
        &self.collector
    }

    fn is_young(&self, v: Value) -> bool {
        v.is_block() && self.collector.is_young(v)
    }

    /// Creates a root holding `v`.
    ///
    /// Fails if the allocator is not set up, or if a new pool is needed and the pool source is out
    /// of memory. A failed `create` has no effect.
    pub fn create(&self, v: Value) -> Result<Root, Error> {
        if !self.is_setup() {
            error!("root allocator {} used before setup", self.id);
            return Err(Error::NotSetUp);
        }
        let young = self.is_young(v);

        let mut rings = self.rings.lock();
        let pool = self.find_available_pool(&mut rings)?;
        bump(&self.stats.total_create);

        // Young values prefer minor slots, which are already remembered. Old values take whatever
        // is left, favoring the major list.
        let from_minor = pool.has_minor_free() && (young || !pool.has_major_free());
        let slot = if from_minor {
            pool.pop_minor()
        } else {
            pool.pop_major()
        };
        slot.store(v);
        if young && !from_minor {
            self.remember(slot);
        }
        self.validate_touched(&rings, pool);
        Ok(Root(NonNull::from(slot)))
    }

    /// Returns the value held by `root`. Equivalent to `root.get()`.
    pub fn get(&self, root: &Root) -> Value {
        root.get()
    }

    /// Destroys `root`, returning its slot to its pool.
    pub fn delete(&self, root: Root) {
        let slot = root.slot();
        // Classify under the lock: a minor pass must not flush the minor lists between the check
        // and the push.
        let mut rings = self.rings.lock();
        let young = self.is_young(slot.load());
        let pool = self.layout.pool_of(root.0);
        debug_assert_eq!(
            pool.owner(),
            self.id,
            "{:?} was not created by root allocator {}",
            root,
            self.id
        );
        bump(&self.stats.total_delete);
        if young {
            pool.push_minor(slot);
        } else {
            pool.push_major(slot);
        }

        if pool.alloc_count() == self.layout.demote_threshold() {
            self.demote(&mut rings, pool);
        }
        self.validate_touched(&rings, pool);
    }

    /// Stores `v` in `root`. Never allocates and never takes the allocator lock.
    pub fn modify(&self, root: &mut Root, v: Value) {
        bump(&self.stats.total_modify);
        let slot = root.slot();
        if !self.is_young(v) {
            slot.store(v);
            return;
        }
        let old = slot.load();
        slot.store(v);
        // A slot that held a young value is already remembered.
        if !self.is_young(old) {
            self.remember(slot);
        }
    }

    /// Returns a snapshot of the allocator's counters.
    pub fn stats(&self) -> StatsSnapshot {
        let mut snap = self.stats.snapshot();
        snap.ring_operations = self.rings.lock().ops() as u64;
        snap.pool_log_size = self.layout.log_size;
        snap.roots_per_pool = self.layout.capacity as u64;
        snap
    }

    /// Prints the allocator's counters to standard output.
    pub fn print_stats(&self) {
        print!("{}", self.stats());
    }

    fn remember(&self, slot: &Slot) {
        bump(&self.stats.remember);
        let state = self.collector.current_thread_state();
        self.collector.remember(&state, slot.value_ptr());
    }

    /// Returns the head of the active ring, parking full pools on the way and allocating a new
    /// pool if none is left.
    fn find_available_pool(&self, rings: &mut Rings) -> Result<Pool, Error> {
        if let Some(head) = rings.head(Ring::Active) {
            let pool = rings.pool(head);
            if !pool.is_full(&self.layout) {
                return Ok(pool);
            }
        }

        bump(&self.stats.find_available_pool);
        while let Some(head) = rings.head(Ring::Active) {
            bump(&self.stats.find_available_pool_work);
            let pool = rings.pool(head);
            if !pool.is_full(&self.layout) {
                return Ok(pool);
            }
            let id = rings.pop(Ring::Active);
            rings.push_back(id, Ring::Parked);
            debug!("parked full pool {}", id);
        }
        let id = self.alloc_pool(rings)?;
        rings.push_back(id, Ring::Active);
        Ok(rings.pool(id))
    }

    fn alloc_pool(&self, rings: &mut Rings) -> Result<usize, Error> {
        let mem = match self.source.alloc_pool(self.layout.size) {
            Some(mem) => mem,
            None => {
                warn!("out of memory for a pool of {} bytes", self.layout.size);
                return Err(Error::Exhausted);
            }
        };
        let id = rings.reserve();
        let pool = unsafe { Pool::init(mem, &self.layout, id, self.id) };
        rings.attach(id, pool);
        self.stats.pool_alloced();
        trace!("allocated pool {} at {:#x}", id, pool.base());
        Ok(id)
    }

    /// Unlinks the empty pool `id` and gives its memory back to the source.
    pub(crate) fn free_pool(&self, rings: &mut Rings, id: usize) {
        let pool = rings.pool(id);
        debug_assert!(pool.is_empty(), "freeing pool {} with live roots", id);
        rings.remove(id);
        rings.release(id);
        self.release(pool);
        trace!("freed pool {}", id);
    }

    fn release(&self, pool: Pool) {
        unsafe { self.source.free_pool(pool.as_ptr(), self.layout.size) };
        self.stats.pool_freed();
    }

    /// Moves `pool` to the back of the active ring.
    fn demote(&self, rings: &mut Rings, pool: Pool) {
        let id = pool.id();
        rings.remove(id);
        rings.push_back(id, Ring::Active);
        debug!("pool {} back in the active ring", id);
    }

    fn validate_touched(&self, rings: &Rings, pool: Pool) {
        if cfg!(feature = "validate-all") {
            self.validate_all(rings);
        } else if cfg!(debug_assertions) {
            pool.validate(&self.layout);
            rings.validate();
        }
    }

    /// Checks the invariants of every pool and of both rings.
    pub(crate) fn validate_all(&self, rings: &Rings) {
        rings.validate();
        for &ring in [Ring::Active, Ring::Parked].iter() {
            for id in rings.ids(ring) {
                let pool = rings.pool(id);
                assert_eq!(pool.owner(), self.id, "pool {} of another allocator", id);
                pool.validate(&self.layout);
            }
        }
    }
}

impl<C: Collector, S: PoolSource> ScanRoots for Roots<C, S> {
    fn scan_roots(&self, action: &mut dyn ScanAction, pass: Pass) {
        if !self.is_setup() {
            return;
        }
        match pass {
            Pass::Minor => bump(&self.stats.minor_collections),
            Pass::Major => bump(&self.stats.major_collections),
        }
        let mut rings = self.rings.lock();
        // nothing was ever allocated
        if rings.live() == 0 && rings.ops() == 0 {
            return;
        }
        match pass {
            Pass::Minor => self.scan_minor(&rings),
            Pass::Major => self.scan_major(&mut rings, action),
        }
    }
}

impl<C: Collector, S: PoolSource> Drop for Roots<C, S> {
    fn drop(&mut self) {
        let pools = self.rings.get_mut().drain();
        for pool in pools {
            self.release(pool);
        }
    }
}
