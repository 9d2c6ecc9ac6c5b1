// Copyright 2017-2018 the authors. See the 'Copyright and license' section of the
// README.md file at the top-level directory of this repository.
//
// Licensed under the Apache License, Version 2.0 (the LICENSE-APACHE file) or
// the MIT license (the LICENSE-MIT file) at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Pools of root slots.
//!
//! A pool is a block of memory whose alignment is equal to its size. It starts with a
//! `PoolHeader` and is followed by an array of slots:
//!
//! ```text
//! <header> <slot 0> <slot 1> ... <slot capacity-1> <unused tail>
//! ```
//!
//! As with the aligned slabs of a slab allocator, the pool owning a slot is found by masking off
//! the low bits of the slot's address, so a root needs no back pointer.
//!
//! Free slots are threaded through two free lists (see the `slot` module for the encoding):
//!
//! - the *major* free list, whose slots may be reused for any value;
//! - the *minor* free list, whose slots held young values when they were freed and are therefore
//!   still in the collector's remembered set. Reusing them for young values saves a `remember`.
//!
//! The minor list keeps a pointer to its last slot so that it can be spliced onto the major list
//! in O(1) once a minor collection has emptied the remembered set.
//!
//! Every method of `Pool` must be called with the allocator lock held.

use core::mem;
use std::ptr::NonNull;
use std::slice;

use crate::slot::{self, Slot, SlotState};

/// Smallest and largest supported `log2` of the pool size.
pub const MIN_POOL_LOG_SIZE: u32 = 9;
pub const MAX_POOL_LOG_SIZE: u32 = 24;

/// Size and capacity of every pool of an allocator.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PoolLayout {
    pub log_size: u32,
    pub size: usize,
    pub capacity: usize,
}

impl PoolLayout {
    pub fn new(log_size: u32) -> PoolLayout {
        assert!(
            log_size >= MIN_POOL_LOG_SIZE && log_size <= MAX_POOL_LOG_SIZE,
            "pool log size {} out of range [{}, {}]",
            log_size,
            MIN_POOL_LOG_SIZE,
            MAX_POOL_LOG_SIZE
        );
        let size = 1usize << log_size;
        let capacity = (size - mem::size_of::<PoolHeader>()) / mem::size_of::<Slot>();
        PoolLayout {
            log_size,
            size,
            capacity,
        }
    }

    /// Once a parked pool drops to this many live slots, it goes back to the active ring.
    pub fn demote_threshold(&self) -> usize {
        self.capacity * 3 / 4
    }

    /// Locates the pool that owns `slot`.
    #[inline]
    pub fn pool_of(&self, slot: NonNull<Slot>) -> Pool {
        let base = slot.as_ptr() as usize & !(self.size - 1);
        Pool(NonNull::new(base as *mut PoolHeader).expect("slot address in the null pool"))
    }
}

/// The header at the start of every pool.
#[repr(C)]
pub struct PoolHeader {
    // index of the pool's link in the ring arena
    id: usize,
    // identifier of the allocator that owns the pool
    owner: usize,
    size: usize,
    major_free: usize,
    minor_free: usize,
    // last slot of the minor free list; only meaningful while that list is non-empty
    last_minor_free: usize,
    alloc_count: usize,
}

/// A handle to an initialized pool.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct Pool(NonNull<PoolHeader>);

// Pools are only touched with the allocator lock held.
unsafe impl Send for Pool {}

impl Pool {
    /// Initializes a pool in the fresh block `mem`, putting every slot on the major free list.
    ///
    /// # Safety
    ///
    /// `mem` must be valid for writes of `layout.size` bytes and aligned to `layout.size`.
    pub unsafe fn init(mem: NonNull<u8>, layout: &PoolLayout, id: usize, owner: usize) -> Pool {
        debug_assert_eq!(mem.as_ptr() as usize % layout.size, 0);
        let base = mem.as_ptr() as usize;
        let hd = mem.cast::<PoolHeader>();
        hd.as_ptr().write(PoolHeader {
            id,
            owner,
            size: layout.size,
            major_free: base,
            minor_free: base,
            last_minor_free: 0,
            alloc_count: 0,
        });
        let pool = Pool(hd);

        // Push in reverse so that allocation proceeds from the start of the pool.
        let first = pool.first_slot();
        for i in (0..layout.capacity).rev() {
            let s = &*first.as_ptr().add(i);
            s.set_link((*hd.as_ptr()).major_free);
            (*hd.as_ptr()).major_free = s.addr();
        }
        pool
    }

    pub fn base(self) -> usize {
        self.0.as_ptr() as usize
    }

    pub fn as_ptr(self) -> NonNull<u8> {
        self.0.cast()
    }

    pub fn id(self) -> usize {
        unsafe { (*self.0.as_ptr()).id }
    }

    pub fn owner(self) -> usize {
        unsafe { (*self.0.as_ptr()).owner }
    }

    pub fn alloc_count(self) -> usize {
        unsafe { (*self.0.as_ptr()).alloc_count }
    }

    pub fn is_full(self, layout: &PoolLayout) -> bool {
        self.alloc_count() == layout.capacity
    }

    pub fn is_empty(self) -> bool {
        self.alloc_count() == 0
    }

    fn first_slot(self) -> NonNull<Slot> {
        let addr = self.base() + mem::size_of::<PoolHeader>();
        unsafe { NonNull::new_unchecked(addr as *mut Slot) }
    }

    pub fn slots<'a>(self, layout: &PoolLayout) -> &'a [Slot] {
        unsafe { slice::from_raw_parts(self.first_slot().as_ptr(), layout.capacity) }
    }

    pub fn has_major_free(self) -> bool {
        unsafe { (*self.0.as_ptr()).major_free != self.base() }
    }

    pub fn has_minor_free(self) -> bool {
        unsafe { (*self.0.as_ptr()).minor_free != self.base() }
    }

    /// Takes a slot off the major free list, which must not be empty.
    pub fn pop_major<'a>(self) -> &'a Slot {
        debug_assert!(self.has_major_free());
        unsafe {
            let hd = self.0.as_ptr();
            let s = &*((*hd).major_free as *const Slot);
            (*hd).major_free = s.link();
            self.take(s)
        }
    }

    /// Takes a slot off the minor free list, which must not be empty.
    pub fn pop_minor<'a>(self) -> &'a Slot {
        debug_assert!(self.has_minor_free());
        unsafe {
            let hd = self.0.as_ptr();
            let s = &*((*hd).minor_free as *const Slot);
            (*hd).minor_free = s.link();
            self.take(s)
        }
    }

    unsafe fn take<'a>(self, s: &'a Slot) -> &'a Slot {
        debug_assert!(slot::is_free(s.raw(), self.base(), (*self.0.as_ptr()).size));
        (*self.0.as_ptr()).alloc_count += 1;
        s
    }

    /// Returns an occupied slot to the major free list.
    pub fn push_major(self, s: &Slot) {
        unsafe {
            let hd = self.0.as_ptr();
            s.set_link((*hd).major_free);
            (*hd).major_free = s.addr();
            self.give();
        }
    }

    /// Returns an occupied slot to the minor free list, remembering it as the tail if the list
    /// was empty.
    pub fn push_minor(self, s: &Slot) {
        unsafe {
            let hd = self.0.as_ptr();
            if (*hd).minor_free == self.base() {
                (*hd).last_minor_free = s.addr();
            }
            s.set_link((*hd).minor_free);
            (*hd).minor_free = s.addr();
            self.give();
        }
    }

    unsafe fn give(self) {
        let hd = self.0.as_ptr();
        debug_assert!((*hd).alloc_count > 0, "pool {:#x} freed more slots than it has", self.base());
        (*hd).alloc_count -= 1;
    }

    /// Moves the whole minor free list to the front of the major free list.
    pub fn flush_minor(self) {
        if !self.has_minor_free() {
            return;
        }
        unsafe {
            let hd = self.0.as_ptr();
            let last = &*((*hd).last_minor_free as *const Slot);
            debug_assert_eq!(last.link(), self.base(), "minor tail is not the end of the list");
            last.set_link((*hd).major_free);
            (*hd).major_free = (*hd).minor_free;
            (*hd).minor_free = self.base();
            (*hd).last_minor_free = 0;
        }
    }

    /// Counts the slots reachable from a free list head, checking that each one is a free slot
    /// of this pool.
    fn free_list_len(self, layout: &PoolLayout, head: usize) -> usize {
        let mut len = 0;
        let mut cur = head;
        while cur != self.base() {
            assert!(
                cur > self.base() && cur < self.base() + layout.size,
                "free list of pool {:#x} escapes the pool: {:#x}",
                self.base(),
                cur
            );
            let s = unsafe { &*(cur as *const Slot) };
            assert!(
                slot::is_free(s.raw(), self.base(), layout.size),
                "slot {:#x} on a free list is occupied",
                cur
            );
            len += 1;
            assert!(len <= layout.capacity, "cycle in a free list of pool {:#x}", self.base());
            cur = s.link();
        }
        len
    }

    /// Checks the pool's accounting: every slot is either occupied or on exactly one free list,
    /// and the live count matches the occupied slots.
    pub fn validate(self, layout: &PoolLayout) {
        let (mut free, mut full) = (0, 0);
        for s in self.slots(layout) {
            match s.state(self.base(), layout.size) {
                SlotState::Free(_) => free += 1,
                SlotState::Occupied(_) => full += 1,
            }
        }
        let (major, minor, last_minor) = unsafe {
            let hd = self.0.as_ptr();
            ((*hd).major_free, (*hd).minor_free, (*hd).last_minor_free)
        };
        let listed = self.free_list_len(layout, major) + self.free_list_len(layout, minor);
        if self.has_minor_free() {
            assert_ne!(last_minor, 0, "pool {:#x} lost its minor tail", self.base());
            let last = unsafe { &*(last_minor as *const Slot) };
            assert!(slot::is_free(last.raw(), self.base(), layout.size));
            assert_eq!(last.link(), self.base());
        }
        assert_eq!(free, listed, "pool {:#x}: free slots not on a free list", self.base());
        assert_eq!(full, self.alloc_count(), "pool {:#x}: bad live count", self.base());
        assert_eq!(free + full, layout.capacity);
    }

    /// Addresses of the slots on the minor free list, from its head.
    #[cfg(test)]
    pub fn minor_list(self) -> Vec<usize> {
        let mut slots = Vec::new();
        let mut cur = unsafe { (*self.0.as_ptr()).minor_free };
        while cur != self.base() {
            slots.push(cur);
            cur = unsafe { (*(cur as *const Slot)).link() };
        }
        slots
    }

    #[cfg(test)]
    pub fn free_list_lens(self, layout: &PoolLayout) -> (usize, usize) {
        let (major, minor) = unsafe {
            let hd = self.0.as_ptr();
            ((*hd).major_free, (*hd).minor_free)
        };
        (self.free_list_len(layout, major), self.free_list_len(layout, minor))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;
    use std::alloc::{alloc, dealloc, Layout};

    struct TestPool {
        layout: PoolLayout,
        pool: Pool,
    }

    impl TestPool {
        fn new(log_size: u32) -> TestPool {
            let layout = PoolLayout::new(log_size);
            let mem = unsafe { alloc(Layout::from_size_align(layout.size, layout.size).unwrap()) };
            let pool = unsafe { Pool::init(NonNull::new(mem).unwrap(), &layout, 7, 3) };
            TestPool { layout, pool }
        }
    }

    impl Drop for TestPool {
        fn drop(&mut self) {
            let l = Layout::from_size_align(self.layout.size, self.layout.size).unwrap();
            unsafe { dealloc(self.pool.as_ptr().as_ptr(), l) };
        }
    }

    #[test]
    fn test_layout() {
        let l = PoolLayout::new(14);
        assert_eq!(l.size, 16384);
        assert_eq!(l.capacity, (16384 - 56) / 8);
        assert_eq!(l.demote_threshold(), l.capacity * 3 / 4);
    }

    #[test]
    #[should_panic]
    fn test_layout_too_small() {
        PoolLayout::new(MIN_POOL_LOG_SIZE - 1);
    }

    #[test]
    fn test_init() {
        let t = TestPool::new(10);
        let (pool, layout) = (t.pool, t.layout);
        assert_eq!(pool.id(), 7);
        assert_eq!(pool.owner(), 3);
        assert!(pool.is_empty());
        assert!(!pool.has_minor_free());
        assert_eq!(pool.free_list_lens(&layout), (layout.capacity, 0));
        pool.validate(&layout);

        // slots come out in address order, and every one maps back to the pool
        let first = pool.pop_major();
        let second = pool.pop_major();
        assert_eq!(second.addr(), first.addr() + mem::size_of::<Slot>());
        assert_eq!(layout.pool_of(NonNull::from(second)), pool);
        first.store(Value::UNIT);
        second.store(Value::from_int(2));
        assert_eq!(pool.alloc_count(), 2);
        pool.validate(&layout);
    }

    #[test]
    fn test_fill_and_drain() {
        let t = TestPool::new(9);
        let (pool, layout) = (t.pool, t.layout);
        let mut taken = Vec::new();
        while pool.has_major_free() {
            let s = pool.pop_major();
            s.store(Value::from_int(taken.len() as isize));
            taken.push(s);
        }
        assert!(pool.is_full(&layout));
        assert_eq!(taken.len(), layout.capacity);
        pool.validate(&layout);

        for (i, s) in taken.iter().enumerate() {
            if i % 2 == 0 {
                pool.push_major(s);
            } else {
                pool.push_minor(s);
            }
        }
        assert!(pool.is_empty());
        let (major, minor) = pool.free_list_lens(&layout);
        assert_eq!(major + minor, layout.capacity);
        assert_eq!(minor, layout.capacity / 2);
        pool.validate(&layout);
    }

    #[test]
    fn test_flush_minor() {
        let t = TestPool::new(9);
        let (pool, layout) = (t.pool, t.layout);
        let a = pool.pop_major();
        let b = pool.pop_major();
        let c = pool.pop_major();
        for s in [a, b, c].iter() {
            s.store(Value::UNIT);
        }
        pool.push_minor(a);
        pool.push_minor(b);
        pool.push_major(c);
        assert_eq!(pool.free_list_lens(&layout), (layout.capacity - 2, 2));
        pool.validate(&layout);

        assert_eq!(pool.minor_list(), vec![b.addr(), a.addr()]);

        pool.flush_minor();
        assert!(!pool.has_minor_free());
        assert!(pool.minor_list().is_empty());
        assert_eq!(pool.free_list_lens(&layout), (layout.capacity, 0));
        pool.validate(&layout);

        // the spliced slots come first
        assert_eq!(pool.pop_major().addr(), b.addr());
        assert_eq!(pool.pop_major().addr(), a.addr());
        assert_eq!(pool.pop_major().addr(), c.addr());

        // flushing an empty minor list is a no-op
        pool.flush_minor();
        assert_eq!(pool.free_list_lens(&layout), (layout.capacity - 3, 0));
    }
}
