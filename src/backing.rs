// Copyright 2017-2018 the authors. See the 'Copyright and license' section of the
// README.md file at the top-level directory of this repository.
//
// Licensed under the Apache License, Version 2.0 (the LICENSE-APACHE file) or
// the MIT license (the LICENSE-MIT file) at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Sources of pool memory.

use std::ptr::NonNull;

lazy_static! {
    pub static ref PAGE_SIZE: usize = pagesize::get();
}

/// A provider of the memory backing pools.
///
/// # Safety
///
/// Every block returned by `alloc_pool(size)` must be valid for reads and writes of `size` bytes,
/// must be aligned to `size` (which is always a power of two), and must stay valid until it is
/// passed to `free_pool` with the same size. The root allocator relies on the alignment to find
/// the pool of a root by masking its address.
pub unsafe trait PoolSource: Send + Sync {
    /// Allocates a block of `size` bytes aligned to `size`, or returns `None` if memory is
    /// exhausted.
    fn alloc_pool(&self, size: usize) -> Option<NonNull<u8>>;

    /// Releases a block previously returned by `alloc_pool(size)`.
    unsafe fn free_pool(&self, ptr: NonNull<u8>, size: usize);
}

/// A `PoolSource` that uses the global heap allocator.
#[derive(Copy, Clone, Default, Debug)]
pub struct HeapSource;

unsafe impl PoolSource for HeapSource {
    fn alloc_pool(&self, size: usize) -> Option<NonNull<u8>> {
        use std::alloc::{alloc, Layout};
        let layout = Layout::from_size_align(size, size).ok()?;
        NonNull::new(unsafe { alloc(layout) })
    }

    unsafe fn free_pool(&self, ptr: NonNull<u8>, size: usize) {
        use std::alloc::{dealloc, Layout};
        dealloc(ptr.as_ptr(), Layout::from_size_align_unchecked(size, size));
    }
}

#[cfg(all(unix, feature = "os"))]
pub use self::mmap::MmapSource;

/// A `PoolSource` that uses anonymous memory mappings.
#[cfg(all(unix, feature = "os"))]
mod mmap {
    use super::{PoolSource, PAGE_SIZE};
    use errno::errno;
    use std::ptr::{self, NonNull};

    /// Maps pools directly from the operating system.
    ///
    /// Pools no larger than a page are given a whole page, which is trivially aligned to their
    /// size. Larger pools are carved out of a mapping of twice their size, unmapping the unaligned
    /// head and the tail.
    #[derive(Copy, Clone, Default, Debug)]
    pub struct MmapSource;

    unsafe impl PoolSource for MmapSource {
        fn alloc_pool(&self, size: usize) -> Option<NonNull<u8>> {
            debug_assert!(size.is_power_of_two());
            let pagesize = *PAGE_SIZE;
            if size <= pagesize {
                return unsafe { map(pagesize) };
            }

            let mem = unsafe { map(2 * size)? };
            let addr = mem.as_ptr() as usize;
            debug_assert_eq!(addr % pagesize, 0);
            // region at the beginning that is not needed
            let head = (size - addr % size) % size;
            // region at the end that is not needed
            let tail = size - head;
            unsafe {
                if head > 0 {
                    unmap(mem.as_ptr(), head);
                }
                let res = mem.as_ptr().add(head);
                if tail > 0 {
                    unmap(res.add(size), tail);
                }
                trace!("carved pool {:?} of size {}", res, size);
                NonNull::new(res)
            }
        }

        unsafe fn free_pool(&self, ptr: NonNull<u8>, size: usize) {
            unmap(ptr.as_ptr(), next_multiple(size, *PAGE_SIZE));
        }
    }

    fn next_multiple(size: usize, unit: usize) -> usize {
        let remainder = size % unit;
        if remainder == 0 {
            size
        } else {
            size + (unit - remainder)
        }
    }

    unsafe fn map(size: usize) -> Option<NonNull<u8>> {
        use libc::{ENOMEM, MAP_ANON, MAP_FAILED, MAP_PRIVATE, PROT_READ, PROT_WRITE};

        let ptr = libc::mmap(
            ptr::null_mut(),
            size,
            PROT_READ | PROT_WRITE,
            MAP_ANON | MAP_PRIVATE,
            -1,
            0,
        );
        if ptr == MAP_FAILED {
            let err = errno();
            if err.0 == ENOMEM {
                None
            } else {
                panic!("mmap failed: {}", err)
            }
        } else {
            // mmap never returns NULL unless MAP_FIXED is passed
            assert_ne!(ptr, ptr::null_mut(), "mmap returned NULL");
            NonNull::new(ptr as *mut u8)
        }
    }

    unsafe fn unmap(ptr: *mut u8, size: usize) {
        // NOTE: Don't inline the call to munmap; then errno might be called before munmap.
        let ret = libc::munmap(ptr as *mut _, size);
        assert_eq!(ret, 0, "munmap failed: {}", errno());
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        unsafe fn test_write_read(ptr: *mut u8, size: usize) {
            for i in 0..size {
                *ptr.add(i) = (i & 0xff) as u8;
            }
            for i in 0..size {
                assert_eq!(*ptr.add(i), (i & 0xff) as u8, "mismatch at byte {} of {:?}", i, ptr);
            }
        }

        #[test]
        fn test_map_aligned() {
            for log in 9..22 {
                let size = 1usize << log;
                let p = MmapSource.alloc_pool(size).unwrap();
                assert_eq!(p.as_ptr() as usize % size, 0, "pool of size {} misaligned", size);
                unsafe {
                    test_write_read(p.as_ptr(), size);
                    MmapSource.free_pool(p, size);
                }
            }
        }

        #[test]
        fn test_next_multiple() {
            assert_eq!(next_multiple(1, 4096), 4096);
            assert_eq!(next_multiple(4096, 4096), 4096);
            assert_eq!(next_multiple(4097, 4096), 8192);
        }
    }
}

mod pagesize {
    #[cfg(unix)]
    pub fn get() -> usize {
        // sysconf(_SC_PAGESIZE) is required by POSIX 1003.1
        use errno::errno;
        use libc::{sysconf, EINVAL, _SC_PAGESIZE};
        let pagesize = unsafe { sysconf(_SC_PAGESIZE) };
        if pagesize < 1 {
            assert_eq!(errno().0, EINVAL);
            panic!("sysconf(_SC_PAGESIZE) returned EINVAL, but _SC_PAGESIZE is required by POSIX");
        }
        pagesize as usize
    }

    #[cfg(not(unix))]
    pub fn get() -> usize {
        4096
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heap_aligned() {
        for log in 9..20 {
            let size = 1usize << log;
            let p = HeapSource.alloc_pool(size).unwrap();
            assert_eq!(p.as_ptr() as usize % size, 0);
            unsafe { HeapSource.free_pool(p, size) };
        }
    }

    #[test]
    fn test_pagesize() {
        assert!(PAGE_SIZE.is_power_of_two());
    }
}
