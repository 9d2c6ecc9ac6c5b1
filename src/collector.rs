// Copyright 2017-2018 the authors. See the 'Copyright and license' section of the
// README.md file at the top-level directory of this repository.
//
// Licensed under the Apache License, Version 2.0 (the LICENSE-APACHE file) or
// the MIT license (the LICENSE-MIT file) at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The contract between the root allocator and the garbage collector that owns the values.
//!
//! The allocator never moves or traces objects itself. It relies on the collector for three
//! things: classifying values by generation (`is_young`), recording slots that may hold young
//! values (`remember`, the generational write barrier), and calling back into the allocator at
//! every safepoint (`register_scan_hook`). In return, the allocator reports every occupied slot
//! to the `ScanAction` supplied for a major pass, so that the collector can mark the value and
//! rewrite the slot if the object moved.

use std::ptr::NonNull;
use std::sync::Weak;

use crate::slot::Slot;
use crate::value::Value;

/// The kind of collection a safepoint belongs to.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Pass {
    /// A minor collection. Young roots are already covered by the remembered set.
    Minor,
    /// A major collection (or any other full traversal of roots). The young generation must be
    /// empty, as it is right after a minor collection.
    Major,
}

/// A generational, moving garbage collector.
///
/// Implementations must be callable from any mutator thread.
pub trait Collector: Send + Sync + 'static {
    /// Per-thread state needed to reach the remembered set. Single-threaded embeddings can use
    /// `()`.
    type ThreadState;

    /// Registers the hook to invoke at every collection safepoint.
    ///
    /// The collector must not upgrade the hook outside of a safepoint. A hook that fails to
    /// upgrade belongs to a dropped allocator and can be discarded.
    fn register_scan_hook(&self, hook: Weak<dyn ScanRoots>);

    /// Returns whether the block `v` lives in the young generation. Must be O(1).
    fn is_young(&self, v: Value) -> bool;

    fn current_thread_state(&self) -> Self::ThreadState;

    /// Adds `slot` to the remembered set. Registering a slot twice must be harmless.
    fn remember(&self, state: &Self::ThreadState, slot: NonNull<Value>);
}

/// An object that holds roots and must be scanned at every safepoint.
pub trait ScanRoots: Send + Sync {
    /// Applies `action` to roots as required by `pass`.
    ///
    /// Must only be called at a safepoint: no mutator may be creating, deleting or modifying
    /// roots of this allocator concurrently.
    fn scan_roots(&self, action: &mut dyn ScanAction, pass: Pass);
}

/// The per-root callback supplied by the collector for a major pass.
///
/// The allocator never stores an action; it is borrowed for the duration of one scan.
pub trait ScanAction {
    /// Visits one occupied root slot whose current content is `old`. The action may rewrite the
    /// slot through `slot.set` if the referenced object moved.
    fn visit(&mut self, old: Value, slot: &RootSlot);
}

impl<F: FnMut(Value, &RootSlot<'_>)> ScanAction for F {
    fn visit(&mut self, old: Value, slot: &RootSlot) {
        self(old, slot)
    }
}

/// An occupied root slot, lent to a `ScanAction` during a major pass.
pub struct RootSlot<'a> {
    slot: &'a Slot,
}

impl<'a> RootSlot<'a> {
    pub(crate) fn new(slot: &'a Slot) -> RootSlot<'a> {
        RootSlot { slot }
    }

    pub fn get(&self) -> Value {
        self.slot.load()
    }

    /// Rewrites the slot in place, typically with the new address of a moved object.
    pub fn set(&self, v: Value) {
        self.slot.store(v)
    }

    /// The stable address of the slot, as handed out by `Root::get_ref`.
    pub fn as_ptr(&self) -> NonNull<Value> {
        self.slot.value_ptr()
    }
}
