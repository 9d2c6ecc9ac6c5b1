// Copyright 2017-2018 the authors. See the 'Copyright and license' section of the
// README.md file at the top-level directory of this repository.
//
// Licensed under the Apache License, Version 2.0 (the LICENSE-APACHE file) or
// the MIT license (the LICENSE-MIT file) at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Root slots and the encoding of free slots.
//!
//! A slot is one word. It is either occupied by a `Value`, or free, in which case it holds a link
//! to the next free slot of the same free list. Links are tagged with the low bit, so that they
//! look like immediates to anyone reading the slot, and they always point into the pool that owns
//! the slot: either at another slot, or at the pool base, which stands for the end of the list.
//!
//! Because pools are aligned to their size, a word is a free link of pool `p` exactly when its
//! high bits are the address of `p` and its low bit is set. That is the test `is_free`
//! implements, and it is the only place besides `pool::pool_of` where the allocator does
//! arithmetic on addresses.

use core::sync::atomic::{AtomicUsize, Ordering};
use std::ptr::NonNull;

use crate::value::Value;

const TAG: usize = 1;

/// A single root cell.
///
/// The content is atomic so that lock-free reads and writes of a root (`get`, `modify`, the
/// collector's in-place update) never race with each other in the memory model. Structural
/// updates to free lists happen under the allocator lock, so relaxed ordering is enough.
#[repr(transparent)]
pub struct Slot(AtomicUsize);

/// The decoded content of a slot.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum SlotState {
    Occupied(Value),
    /// A free slot, with the next slot of its free list (`None` at the end of the list).
    Free(Option<NonNull<Slot>>),
}

impl Slot {
    #[inline]
    pub fn load(&self) -> Value {
        Value::from_raw(self.raw())
    }

    #[inline]
    pub fn store(&self, v: Value) {
        self.0.store(v.as_raw(), Ordering::Relaxed)
    }

    #[inline]
    pub fn raw(&self) -> usize {
        self.0.load(Ordering::Relaxed)
    }

    /// Makes this slot a free link to `next`, where `next` is either a slot of the same pool or
    /// the pool base.
    #[inline]
    pub fn set_link(&self, next: usize) {
        debug_assert_eq!(next & TAG, 0);
        self.0.store(next | TAG, Ordering::Relaxed)
    }

    /// Follows the free link stored in this slot. The slot must be free.
    #[inline]
    pub fn link(&self) -> usize {
        self.raw() & !TAG
    }

    pub fn value_ptr(&self) -> NonNull<Value> {
        NonNull::from(self).cast()
    }

    pub fn addr(&self) -> usize {
        self as *const Slot as usize
    }

    /// Decodes the slot, given the base address and size of its pool.
    pub fn state(&self, base: usize, pool_size: usize) -> SlotState {
        let raw = self.raw();
        if !is_free(raw, base, pool_size) {
            SlotState::Occupied(Value::from_raw(raw))
        } else if raw & !TAG == base {
            SlotState::Free(None)
        } else {
            SlotState::Free(NonNull::new((raw & !TAG) as *mut Slot))
        }
    }
}

/// Returns whether the word `raw` is a free link of the pool at `base`.
///
/// Masking with `pool_size - 2` clears the offset within the pool but keeps the tag bit, so the
/// comparison checks both that the word is tagged and that it points into the pool.
#[inline]
pub fn is_free(raw: usize, base: usize, pool_size: usize) -> bool {
    debug_assert!(pool_size.is_power_of_two());
    debug_assert_eq!(base & (pool_size - 1), 0);
    (base | TAG) == raw & !(pool_size - 2)
}

#[cfg(test)]
mod tests {
    use super::*;

    const POOL: usize = 1 << 12;
    const BASE: usize = 0x7f00_0000_0000 & !(POOL - 1);

    #[test]
    fn test_is_free() {
        // links to the base and to every slot of the pool are free
        for offset in (0..POOL).step_by(8) {
            assert!(is_free((BASE + offset) | TAG, BASE, POOL));
        }
        // untagged addresses inside the pool are not
        assert!(!is_free(BASE + 16, BASE, POOL));
        // tagged addresses of neighbouring pools are not
        assert!(!is_free((BASE + POOL) | TAG, BASE, POOL));
        assert!(!is_free((BASE - 8) | TAG, BASE, POOL));
        // ordinary immediates are not
        assert!(!is_free(Value::from_int(17).as_raw(), BASE, POOL));
        assert!(!is_free(Value::UNIT.as_raw(), BASE, POOL));
    }

    #[test]
    fn test_slot_state() {
        let cells: Vec<Slot> = (0..2).map(|_| Slot(AtomicUsize::new(0))).collect();
        let base = cells[0].addr() & !(POOL - 1);
        let (a, b) = (&cells[0], &cells[1]);

        a.store(Value::from_int(5));
        assert_eq!(a.state(base, POOL), SlotState::Occupied(Value::from_int(5)));

        a.set_link(base);
        assert_eq!(a.state(base, POOL), SlotState::Free(None));

        // `b` may sit just past a page boundary in an unlucky heap layout; the link only has to
        // stay within the same aligned block to decode as free.
        if b.addr() & !(POOL - 1) == base {
            a.set_link(b.addr());
            assert_eq!(a.state(base, POOL), SlotState::Free(Some(NonNull::from(b))));
            assert_eq!(a.link(), b.addr());
        }
    }
}
