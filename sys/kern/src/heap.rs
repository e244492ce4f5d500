// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The kernel heap: a priority-ceiling wrapper around the block
//! allocator.
//!
//! The heap exists to back dynamically allocated task stacks (and the
//! shell's heap diagnostics); it is not a general application allocator.
//! Every operation runs under the ceiling, so tasks and kernel paths can
//! share the pool without further coordination. Handlers above the
//! ceiling must not allocate.

use crate::arch::with_priority_ceiling;
use block_alloc::Heap;
use core::cell::UnsafeCell;
use core::ptr::NonNull;

pub use block_alloc::{HeapStats, IntegrityError};

/// Interior-mutable holder for the single kernel heap instance.
struct KernelHeap {
    inner: UnsafeCell<Heap>,
}

// Safety: all access goes through `with_heap`, which holds the priority
// ceiling; on this single-core system that serializes every context
// allowed to touch the heap.
unsafe impl Sync for KernelHeap {}

static HEAP: KernelHeap = KernelHeap {
    inner: UnsafeCell::new(Heap::empty()),
};

fn with_heap<R>(body: impl FnOnce(&mut Heap) -> R) -> R {
    with_priority_ceiling(|| {
        // Safety: the ceiling is held (see the Sync argument above), so
        // this reference is exclusive for the duration of `body`.
        body(unsafe { &mut *HEAP.inner.get() })
    })
}

/// Adopts `len` bytes at `pool` as the kernel heap.
///
/// # Safety
///
/// The region must be writable, unused by anything else, and outlive the
/// kernel. Call once, before tasks are created.
pub unsafe fn init(pool: *mut u8, len: usize) -> Result<(), ()> {
    with_heap(|h| unsafe { h.init(pool, len) })
}

pub fn is_initialized() -> bool {
    with_heap(|h| h.is_initialized())
}

/// Allocates `n` bytes, or `None` on exhaustion (or a zero-size request).
pub fn alloc(n: usize) -> Option<NonNull<u8>> {
    with_heap(|h| h.alloc(n))
}

/// Returns an allocation to the pool.
///
/// # Safety
///
/// `p` must have come from [`alloc`]/[`realloc`] and not be used again.
pub unsafe fn free(p: NonNull<u8>) {
    with_heap(|h| unsafe { h.free(p) })
}

/// Resizes an allocation, in place when possible.
///
/// # Safety
///
/// Same contract as [`free`]; on success the old pointer is dead.
pub unsafe fn realloc(p: NonNull<u8>, n: usize) -> Option<NonNull<u8>> {
    with_heap(|h| unsafe { h.realloc(p, n) })
}

/// Occupancy snapshot, or `None` before [`init`].
pub fn stats() -> Option<HeapStats> {
    with_heap(|h| h.is_initialized().then(|| h.stats()))
}

/// Full-pool integrity walk; `Err` means the pool is corrupt.
pub fn check_integrity() -> Result<(), IntegrityError> {
    with_heap(|h| h.check_integrity())
}
