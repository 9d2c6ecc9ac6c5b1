// Copyright 2017-2018 the authors. See the 'Copyright and license' section of the
// README.md file at the top-level directory of this repository.
//
// Licensed under the Apache License, Version 2.0 (the LICENSE-APACHE file) or
// the MIT license (the LICENSE-MIT file) at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Word-sized managed values.

use core::fmt::{self, Debug, Formatter};

/// A managed reference or an unboxed immediate, exactly one machine word wide.
///
/// Immediates have their low bit set; blocks (references into the collector's heap) have it
/// clear. Only blocks are ever handed to `Collector::is_young`.
///
/// Root slots reuse the immediate tag for free-list links that point into the allocator's own
/// pools. Since pool memory never belongs to the collector's heap, no block can look like a free
/// link; immediates must likewise never encode an address inside a live pool.
#[repr(transparent)]
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct Value(usize);

impl Value {
    /// The immediate zero, a convenient "empty" value.
    pub const UNIT: Value = Value(1);

    pub const fn from_raw(raw: usize) -> Value {
        Value(raw)
    }

    pub const fn as_raw(self) -> usize {
        self.0
    }

    /// Builds an immediate integer. The top bit of `n` is lost.
    pub const fn from_int(n: isize) -> Value {
        Value(((n as usize) << 1) | 1)
    }

    /// Returns the integer encoded by an immediate.
    pub fn as_int(self) -> isize {
        debug_assert!(self.is_immediate());
        (self.0 as isize) >> 1
    }

    /// Builds a block from a heap address. The address must be at least 2-aligned.
    pub fn from_ptr<T>(ptr: *const T) -> Value {
        debug_assert_eq!(ptr as usize & 1, 0, "block address {:?} is not aligned", ptr);
        Value(ptr as usize)
    }

    pub fn is_immediate(self) -> bool {
        self.0 & 1 == 1
    }

    pub fn is_block(self) -> bool {
        !self.is_immediate()
    }
}

impl Debug for Value {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        if self.is_immediate() {
            write!(f, "Value::Int({})", self.as_int())
        } else {
            write!(f, "Value::Block({:#x})", self.0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_immediates() {
        for n in [-5isize, -1, 0, 1, 42, isize::MAX >> 1].iter() {
            let v = Value::from_int(*n);
            assert!(v.is_immediate());
            assert!(!v.is_block());
            assert_eq!(v.as_int(), *n);
        }
        assert_eq!(Value::UNIT, Value::from_int(0));
    }

    #[test]
    fn test_blocks() {
        let x = 0u64;
        let v = Value::from_ptr(&x);
        assert!(v.is_block());
        assert_eq!(v.as_raw(), &x as *const u64 as usize);
        assert_eq!(format!("{:?}", Value::from_int(3)), "Value::Int(3)");
    }
}
