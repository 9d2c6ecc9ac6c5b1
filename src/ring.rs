// Copyright 2017-2018 the authors. See the 'Copyright and license' section of the
// README.md file at the top-level directory of this repository.
//
// Licensed under the Apache License, Version 2.0 (the LICENSE-APACHE file) or
// the MIT license (the LICENSE-MIT file) at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Rings of pools.
//!
//! A ring is a cyclic doubly-linked list. Every live pool belongs to exactly one of two rings:
//!
//! - the *active* ring, whose head is the pool allocations are served from;
//! - the *parked* ring, holding pools that were found full and that only come back once enough
//!   of their roots have been deleted.
//!
//! Links are kept in an arena indexed by pool id rather than inside the pools themselves, so
//! that relinking never dereferences pool memory. The id of a pool is stored in its header,
//! which is how a root finds its link: mask the root's address to get the pool, then read the
//! id.

use crate::pool::Pool;

/// Which of the two global rings.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Ring {
    Active,
    Parked,
}

struct Link {
    pool: Option<Pool>,
    prev: usize,
    next: usize,
}

#[derive(Default)]
pub struct Rings {
    links: Vec<Link>,
    free_ids: Vec<usize>,
    active: Option<usize>,
    parked: Option<usize>,
    // number of times a `next` link was rewritten
    ops: usize,
}

impl Rings {
    pub fn new() -> Rings {
        Rings::default()
    }

    /// Reserves an id for a pool that is about to be created.
    pub fn reserve(&mut self) -> usize {
        if let Some(id) = self.free_ids.pop() {
            id
        } else {
            self.links.push(Link {
                pool: None,
                prev: self.links.len(),
                next: self.links.len(),
            });
            self.links.len() - 1
        }
    }

    /// Gives back an id that was reserved or whose pool has been unlinked.
    pub fn release(&mut self, id: usize) {
        let l = &mut self.links[id];
        debug_assert!(l.prev == id && l.next == id, "releasing linked pool {}", id);
        l.pool = None;
        self.free_ids.push(id);
    }

    /// Attaches a pool to a reserved id, forming a singleton ring.
    pub fn attach(&mut self, id: usize, pool: Pool) {
        debug_assert!(self.links[id].pool.is_none());
        self.links[id].pool = Some(pool);
        self.link(id, id);
    }

    pub fn pool(&self, id: usize) -> Pool {
        self.links[id].pool.expect("id of a released pool")
    }

    pub fn head(&self, ring: Ring) -> Option<usize> {
        match ring {
            Ring::Active => self.active,
            Ring::Parked => self.parked,
        }
    }

    fn head_mut(&mut self, ring: Ring) -> &mut Option<usize> {
        match ring {
            Ring::Active => &mut self.active,
            Ring::Parked => &mut self.parked,
        }
    }

    #[cfg(test)]
    pub fn next(&self, id: usize) -> usize {
        self.links[id].next
    }

    pub fn ops(&self) -> usize {
        self.ops
    }

    fn link(&mut self, p: usize, q: usize) {
        self.links[p].next = q;
        self.links[q].prev = p;
        self.ops += 1;
    }

    /// Inserts the ring starting at `source` at the back of `target`.
    pub fn push_back(&mut self, source: usize, target: Ring) {
        match self.head(target) {
            None => *self.head_mut(target) = Some(source),
            Some(head) => {
                let target_last = self.links[head].prev;
                let source_last = self.links[source].prev;
                self.link(target_last, source);
                self.link(source_last, head);
            }
        }
    }

    /// Removes the first pool of `target` and returns it as a singleton ring.
    pub fn pop(&mut self, target: Ring) -> usize {
        let front = self.head(target).expect("pop from an empty ring");
        *self.head_mut(target) = self.unlink(front);
        front
    }

    /// Removes `id` from whichever ring holds it.
    pub fn remove(&mut self, id: usize) {
        let rest = self.unlink(id);
        for &ring in [Ring::Active, Ring::Parked].iter() {
            if self.head(ring) == Some(id) {
                *self.head_mut(ring) = rest;
            }
        }
    }

    // Unlinks `id` from its ring, leaving it as a singleton. Returns the rest of the ring.
    fn unlink(&mut self, id: usize) -> Option<usize> {
        let (prev, next) = (self.links[id].prev, self.links[id].next);
        if next == id {
            return None;
        }
        self.link(prev, next);
        self.link(id, id);
        Some(next)
    }

    /// Lists the pools of `ring` in order, starting from its head.
    pub fn ids(&self, ring: Ring) -> Vec<usize> {
        let mut ids = Vec::new();
        if let Some(head) = self.head(ring) {
            let mut cur = head;
            loop {
                ids.push(cur);
                cur = self.links[cur].next;
                if cur == head {
                    break;
                }
            }
        }
        ids
    }

    #[cfg(test)]
    pub fn len(&self, ring: Ring) -> usize {
        self.ids(ring).len()
    }

    /// Number of pools in either ring.
    pub fn live(&self) -> usize {
        self.links.len() - self.free_ids.len()
    }

    /// Checks that both rings are well-formed and that every attached pool is in exactly one of
    /// them.
    pub fn validate(&self) {
        let mut seen = vec![false; self.links.len()];
        for &ring in [Ring::Active, Ring::Parked].iter() {
            let head = match self.head(ring) {
                Some(head) => head,
                None => continue,
            };
            let mut cur = head;
            loop {
                let l = &self.links[cur];
                assert!(l.pool.is_some(), "released pool {} still in the {:?} ring", cur, ring);
                assert!(!seen[cur], "pool {} is reachable twice", cur);
                seen[cur] = true;
                assert_eq!(self.links[l.next].prev, cur, "broken link after pool {}", cur);
                assert_eq!(self.links[l.prev].next, cur, "broken link before pool {}", cur);
                assert_eq!(l.pool.map(|p| p.id()), Some(cur), "pool {} has the wrong id", cur);
                cur = l.next;
                if cur == head {
                    break;
                }
            }
        }
        let linked = seen.iter().filter(|s| **s).count();
        assert_eq!(linked, self.live(), "pools outside of both rings");
    }

    /// Empties both rings, returning every pool that was in them.
    pub fn drain(&mut self) -> Vec<Pool> {
        let mut pools = Vec::new();
        for &ring in [Ring::Active, Ring::Parked].iter() {
            while self.head(ring).is_some() {
                let id = self.pop(ring);
                pools.push(self.pool(id));
                self.release(id);
            }
        }
        pools
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::PoolLayout;
    use std::alloc::{alloc, dealloc, Layout};
    use std::ptr::NonNull;

    // Builds real pools so that `validate` can check ids.
    struct Fixture {
        layout: PoolLayout,
        rings: Rings,
        mem: Vec<*mut u8>,
    }

    impl Fixture {
        fn new() -> Fixture {
            Fixture {
                layout: PoolLayout::new(9),
                rings: Rings::new(),
                mem: Vec::new(),
            }
        }

        fn add(&mut self, ring: Ring) -> usize {
            let l = Layout::from_size_align(self.layout.size, self.layout.size).unwrap();
            let mem = unsafe { alloc(l) };
            self.mem.push(mem);
            let id = self.rings.reserve();
            let pool = unsafe { Pool::init(NonNull::new(mem).unwrap(), &self.layout, id, 0) };
            self.rings.attach(id, pool);
            self.rings.push_back(id, ring);
            id
        }
    }

    impl Drop for Fixture {
        fn drop(&mut self) {
            let l = Layout::from_size_align(self.layout.size, self.layout.size).unwrap();
            for m in self.mem.drain(..) {
                unsafe { dealloc(m, l) };
            }
        }
    }

    #[test]
    fn test_push_pop() {
        let mut f = Fixture::new();
        let a = f.add(Ring::Active);
        let b = f.add(Ring::Active);
        let c = f.add(Ring::Active);
        assert_eq!(f.rings.ids(Ring::Active), vec![a, b, c]);
        assert_eq!(f.rings.head(Ring::Parked), None);
        f.rings.validate();

        let popped = f.rings.pop(Ring::Active);
        assert_eq!(popped, a);
        f.rings.push_back(popped, Ring::Parked);
        assert_eq!(f.rings.ids(Ring::Active), vec![b, c]);
        assert_eq!(f.rings.ids(Ring::Parked), vec![a]);
        f.rings.validate();

        // traversal from any member returns to it after exactly `len` steps
        let mut cur = c;
        for _ in 0..f.rings.len(Ring::Active) {
            cur = f.rings.next(cur);
        }
        assert_eq!(cur, c);
    }

    #[test]
    fn test_remove() {
        let mut f = Fixture::new();
        let a = f.add(Ring::Active);
        let b = f.add(Ring::Active);
        let c = f.add(Ring::Parked);

        // removing the head moves the head forward
        f.rings.remove(a);
        assert_eq!(f.rings.head(Ring::Active), Some(b));
        f.rings.push_back(a, Ring::Active);
        assert_eq!(f.rings.ids(Ring::Active), vec![b, a]);

        // removing the only member empties the ring
        f.rings.remove(c);
        assert_eq!(f.rings.head(Ring::Parked), None);
        f.rings.release(c);
        assert_eq!(f.rings.live(), 2);
        f.rings.validate();

        // released ids are reused
        assert_eq!(f.rings.reserve(), c);
    }

    #[test]
    fn test_drain() {
        let mut f = Fixture::new();
        f.add(Ring::Active);
        f.add(Ring::Parked);
        f.add(Ring::Parked);
        assert_eq!(f.rings.drain().len(), 3);
        assert_eq!(f.rings.live(), 0);
        assert_eq!(f.rings.head(Ring::Active), None);
        assert_eq!(f.rings.head(Ring::Parked), None);
        f.rings.validate();
    }
}
