/*
   midden, a deferred mark-and-sweep garbage collector for Rust.
   Copyright (C) 2026 The midden developers.

   This program is free software: you can redistribute it and/or modify
   it under the terms of the GNU General Public License as published by
   the Free Software Foundation, either version 3 of the License, or
   (at your option) any later version.

   This program is distributed in the hope that it will be useful,
   but WITHOUT ANY WARRANTY; without even the implied warranty of
   MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
   GNU General Public License for more details.

   You should have received a copy of the GNU General Public License
   along with this program.  If not, see <http://www.gnu.org/licenses/>.
*/

//! The allocation frontend: where chunks are made.
//!
//! An [`Allocator`] is a thin facade borrowed from one [`Heap`]. It lays
//! out a chunk, constructs the payload objects, writes the in-chunk
//! allocator copy and the control header, and hands ownership of the raw
//! memory to the heap. The caller gets back a non-owning [`DeferredPtr`];
//! from that moment on, only reachability keeps the objects alive.
//!
//! Construction is strongly exception safe: if the underlying allocator
//! fails nothing is registered and nothing leaks, and if constructing
//! element `k` of an array panics, elements `0..k` are dropped in reverse
//! order and the raw memory is released before the panic continues.

use std::alloc::Layout;
use std::mem;
use std::mem::size_of;
use std::ptr::NonNull;

use crate::alloc::{AllocError, RawAllocator, SystemAllocator};
use crate::chunk::{ChunkHeader, CHUNK_ALIGN, SIZE_FIELD_REGION};
use crate::heap::Heap;
use crate::helper::TypeHelper;
use crate::ptr::DeferredPtr;
use crate::Traceable;

/// The allocation frontend of one [`Heap`], obtained from
/// [`Heap::allocator`].
#[derive(Clone, Copy)]
pub struct Allocator<'heap> {
    /// The heap that will own every chunk this frontend produces.
    heap: &'heap Heap,
}

impl<'heap> Allocator<'heap> {
    /// Create the frontend for `heap`.
    pub(crate) fn new(heap: &'heap Heap) -> Self {
        Allocator { heap }
    }

    /// Allocate a single object on the deferred heap with the default
    /// system allocator.
    ///
    /// # Errors
    ///
    /// Returns [`AllocError`] if the underlying allocation fails; the heap
    /// is unchanged.
    ///
    /// # Examples
    ///
    /// ```
    /// use midden::Heap;
    ///
    /// let heap = Heap::new();
    /// let number = heap.allocator().make(2354).unwrap();
    /// assert_eq!(*number, 2354);
    /// assert_eq!(heap.stats().objects, 1);
    /// ```
    pub fn make<T: Traceable>(&self, value: T) -> Result<DeferredPtr<T>, AllocError> {
        self.allocate(SystemAllocator, value)
    }

    /// Allocate an array on the deferred heap with the default system
    /// allocator, broadcasting `value` to all `count` elements.
    ///
    /// # Errors
    ///
    /// Returns [`AllocError`] if the underlying allocation fails.
    ///
    /// # Panics
    ///
    /// Panics if `count` is zero: every chunk contains at least one object.
    pub fn make_array<T: Traceable + Clone>(
        &self,
        count: usize,
        value: T,
    ) -> Result<DeferredPtr<[T]>, AllocError> {
        self.allocate_array(SystemAllocator, count, value)
    }

    /// Allocate a single object with a caller-supplied allocator. A copy of
    /// the allocator travels inside the chunk and later frees it.
    ///
    /// # Errors
    ///
    /// Returns [`AllocError`] if `allocator` fails; the heap is unchanged.
    pub fn allocate<T: Traceable, A: RawAllocator>(
        &self,
        allocator: A,
        value: T,
    ) -> Result<DeferredPtr<T>, AllocError> {
        let mut value = Some(value);
        let (header, payload) = allocate_chunk::<T, A>(self.heap, &allocator, 1, false, || {
            value.take().expect("scalar chunks construct exactly one object")
        })?;
        Ok(DeferredPtr::from_raw_parts(header, payload))
    }

    /// Allocate a `count`-element array with a caller-supplied allocator,
    /// broadcasting `value` to every element.
    ///
    /// If cloning element `k` panics, elements `0..k` are dropped in
    /// reverse order, the raw memory is returned to `allocator`, and the
    /// panic propagates; the heap is unchanged.
    ///
    /// # Errors
    ///
    /// Returns [`AllocError`] if `allocator` fails; the heap is unchanged.
    ///
    /// # Panics
    ///
    /// Panics if `count` is zero.
    pub fn allocate_array<T: Traceable + Clone, A: RawAllocator>(
        &self,
        allocator: A,
        count: usize,
        value: T,
    ) -> Result<DeferredPtr<[T]>, AllocError> {
        self.allocate_array_with(allocator, count, || value.clone())
    }

    /// Allocate a `count`-element array, filling every element with
    /// `T::default()`.
    ///
    /// # Errors
    ///
    /// Returns [`AllocError`] if `allocator` fails.
    ///
    /// # Panics
    ///
    /// Panics if `count` is zero.
    pub fn allocate_array_default<T: Traceable + Default, A: RawAllocator>(
        &self,
        allocator: A,
        count: usize,
    ) -> Result<DeferredPtr<[T]>, AllocError> {
        self.allocate_array_with(allocator, count, T::default)
    }

    /// Allocate a `count`-element array, filling every element with a value
    /// produced by `fill`. The fill function takes no element index —
    /// every element is constructed the same way.
    ///
    /// # Errors
    ///
    /// Returns [`AllocError`] if `allocator` fails.
    ///
    /// # Panics
    ///
    /// Panics if `count` is zero.
    pub fn allocate_array_with<T: Traceable, A: RawAllocator>(
        &self,
        allocator: A,
        count: usize,
        fill: impl FnMut() -> T,
    ) -> Result<DeferredPtr<[T]>, AllocError> {
        let (header, payload) =
            allocate_chunk::<T, A>(self.heap, &allocator, count, true, fill)?;
        let slice = std::ptr::slice_from_raw_parts_mut(payload, count);
        Ok(DeferredPtr::from_raw_parts(header, slice))
    }

    /// Run the destructors of the object(s) behind `ptr` right now, ahead
    /// of collection.
    ///
    /// The chunk itself stays on the heap — unreachable and skipped by the
    /// tracer — until the next [`Heap::release_unreachable`] reclaims its
    /// memory. Destroying an already-destroyed or null handle is a no-op.
    pub fn destroy_deferred<T: ?Sized>(&self, ptr: DeferredPtr<T>) {
        // SAFETY: a non-null handle refers to a chunk still owned by its
        // heap.
        let Some(header) = (unsafe { ptr.header_ref() }) else {
            return;
        };
        debug_assert!(
            self.heap.owns(ptr.header()),
            "handle does not belong to this heap"
        );
        // SAFETY: the chunk is live and owned by this frontend's heap.
        unsafe { header.helper.destroy(header) };
    }
}

/// Tears down a partially constructed chunk when payload construction
/// panics: drops the `constructed` leading elements in reverse order and
/// returns the raw memory to the allocator.
struct ConstructGuard<'a, T, A: RawAllocator> {
    /// The raw allocation being built into a chunk.
    raw: NonNull<u8>,
    /// Layout of the raw allocation.
    layout: Layout,
    /// The allocator that produced `raw`.
    allocator: &'a A,
    /// First payload element.
    payload: *mut T,
    /// How many leading elements are fully constructed.
    constructed: usize,
}

impl<T, A: RawAllocator> Drop for ConstructGuard<'_, T, A> {
    fn drop(&mut self) {
        unsafe {
            for i in (0..self.constructed).rev() {
                std::ptr::drop_in_place(self.payload.add(i));
            }
            self.allocator.deallocate(self.raw, self.layout);
        }
    }
}

/// Allocate and fully prepare one chunk of `count` objects of `T`, handing
/// ownership to `heap` on success.
fn allocate_chunk<T: Traceable, A: RawAllocator>(
    heap: &Heap,
    allocator: &A,
    count: usize,
    is_array: bool,
    mut fill: impl FnMut() -> T,
) -> Result<(NonNull<ChunkHeader>, *mut T), AllocError> {
    assert!(count > 0, "deferred chunks contain at least one object");

    let helper = TypeHelper::of::<T, A>();
    let prefix = if is_array { SIZE_FIELD_REGION } else { 0 };
    let control = prefix + helper.bytes_per_allocator + size_of::<ChunkHeader>();
    let total = size_of::<T>()
        .checked_mul(count)
        .and_then(|payload| payload.checked_add(control))
        .ok_or(AllocError {
            size: usize::MAX,
            align: CHUNK_ALIGN,
        })?;
    let layout = Layout::from_size_align(total, CHUNK_ALIGN).map_err(|_| AllocError {
        size: total,
        align: CHUNK_ALIGN,
    })?;

    let raw = allocator.allocate(layout)?;
    let base = raw.as_ptr();
    // SAFETY: all offsets stay within the `total`-byte allocation, and
    // every region start is a multiple of its type's alignment by the
    // chunk layout rules.
    unsafe {
        let allocator_start = base.add(prefix);
        let header_ptr = allocator_start.add(helper.bytes_per_allocator).cast::<ChunkHeader>();
        let payload = header_ptr.add(1).cast::<T>();

        if is_array {
            // The element count lives immediately before the allocator
            // copy; the header reads it back as the size field.
            allocator_start.sub(size_of::<usize>()).cast::<usize>().write(count);
        }

        let mut guard = ConstructGuard {
            raw,
            layout,
            allocator,
            payload,
            constructed: 0,
        };
        for i in 0..count {
            let value = fill();
            payload.add(i).write(value);
            guard.constructed += 1;
        }
        mem::forget(guard);

        allocator_start.cast::<A>().write(allocator.clone());
        header_ptr.write(ChunkHeader::new(helper, is_array));

        let header = NonNull::new_unchecked(header_ptr);
        heap.receive_chunk(header);
        Ok((header, payload))
    }
}

#[cfg(test)]
mod tests {
    use std::cell::{Cell, RefCell};
    use std::panic::{catch_unwind, AssertUnwindSafe};

    use super::*;
    use crate::{Heap, Visitor};

    /// A forwarding allocator that counts paired allocate/deallocate calls.
    #[derive(Clone)]
    struct CountingAllocator<'a> {
        /// Completed allocations.
        allocated: &'a Cell<usize>,
        /// Completed deallocations.
        deallocated: &'a Cell<usize>,
    }

    impl RawAllocator for CountingAllocator<'_> {
        fn allocate(&self, layout: Layout) -> Result<NonNull<u8>, AllocError> {
            let ptr = SystemAllocator.allocate(layout)?;
            self.allocated.set(self.allocated.get() + 1);
            Ok(ptr)
        }

        unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
            SystemAllocator.deallocate(ptr, layout);
            self.deallocated.set(self.deallocated.get() + 1);
        }
    }

    /// An allocator that always refuses.
    #[derive(Clone)]
    struct FailingAllocator;

    impl RawAllocator for FailingAllocator {
        fn allocate(&self, layout: Layout) -> Result<NonNull<u8>, AllocError> {
            Err(AllocError::new(layout))
        }

        unsafe fn deallocate(&self, _: NonNull<u8>, _: Layout) {
            unreachable!("nothing to deallocate");
        }
    }

    /// Logs its construction id on drop.
    struct DropLogger<'a> {
        /// This element's id.
        id: usize,
        /// Shared log of dropped ids.
        log: &'a RefCell<Vec<usize>>,
    }

    impl Drop for DropLogger<'_> {
        fn drop(&mut self) {
            self.log.borrow_mut().push(self.id);
        }
    }

    unsafe impl Traceable for DropLogger<'_> {
        fn accept<V: Visitor>(&self, _: &mut V) -> Result<(), ()> {
            Ok(())
        }
    }

    /// A value whose clone detonates after a set number of copies.
    struct Explosive<'a> {
        /// Clones performed so far.
        clones: &'a Cell<usize>,
        /// Drops performed so far.
        drops: &'a Cell<usize>,
        /// The clone number that panics.
        fuse: usize,
    }

    impl Clone for Explosive<'_> {
        fn clone(&self) -> Self {
            let n = self.clones.get() + 1;
            self.clones.set(n);
            if n == self.fuse {
                panic!("clone fuse burned out");
            }
            Explosive {
                clones: self.clones,
                drops: self.drops,
                fuse: self.fuse,
            }
        }
    }

    impl Drop for Explosive<'_> {
        fn drop(&mut self) {
            self.drops.set(self.drops.get() + 1);
        }
    }

    unsafe impl Traceable for Explosive<'_> {
        fn accept<V: Visitor>(&self, _: &mut V) -> Result<(), ()> {
            Ok(())
        }
    }

    #[test]
    fn make_scalar() {
        let heap = Heap::new();
        let number = heap.allocator().make(2354_i32).unwrap();
        assert!(!number.is_null());
        assert_eq!(*number, 2354);

        let text = heap.allocator().make(String::from("rsrs4")).unwrap();
        assert_eq!(*text, "rsrs4");

        let stats = heap.stats();
        assert_eq!(stats.chunks, 2);
        assert_eq!(stats.objects, 2);
        assert_eq!(stats.root_chunks, 0);
    }

    #[test]
    fn array_of_two() {
        let counters = (Cell::new(0), Cell::new(0));
        let heap = Heap::new();
        let allocator = CountingAllocator {
            allocated: &counters.0,
            deallocated: &counters.1,
        };

        let pair = heap
            .allocator()
            .allocate_array(allocator.clone(), 2, 152_i32)
            .unwrap();
        assert_eq!(pair.len(), 2);
        assert_eq!(pair[0], 152);
        assert_eq!(pair[1], 152);

        let stats = heap.stats();
        assert_eq!(stats.chunks, 1);
        assert_eq!(stats.objects, 2);
        let expected_bytes = size_of::<i32>() * 2
            + size_of::<ChunkHeader>()
            + crate::chunk::allocator_region_bytes::<CountingAllocator<'_>>()
            + SIZE_FIELD_REGION;
        assert_eq!(stats.bytes, expected_bytes);

        let freed = heap.release_unreachable();
        assert_eq!(freed.chunks, 1);
        assert_eq!(freed.objects, 2);
        assert_eq!(freed.bytes, expected_bytes);
        assert_eq!(counters.0.get(), 1);
        assert_eq!(counters.1.get(), 1);
    }

    #[test]
    fn array_default_fill() {
        let heap = Heap::new();
        let zeroes = heap
            .allocator()
            .allocate_array_default::<u64, _>(SystemAllocator, 4)
            .unwrap();
        assert_eq!(*zeroes, [0, 0, 0, 0]);
    }

    #[test]
    #[should_panic(expected = "at least one object")]
    fn empty_array_is_rejected() {
        let heap = Heap::new();
        let _ = heap.allocator().make_array(0, 1_u8);
    }

    #[test]
    fn failed_allocation_leaves_no_trace() {
        let heap = Heap::new();
        let before = heap.stats();
        let err = heap.allocator().allocate(FailingAllocator, 5_u32);
        assert!(err.is_err());
        assert_eq!(heap.stats(), before);
    }

    #[test]
    fn destructors_run_in_reverse_order() {
        let log = RefCell::new(Vec::new());
        let heap = Heap::new();
        let mut next_id = 0;
        let arr = heap
            .allocator()
            .allocate_array_with(SystemAllocator, 3, || {
                let logger = DropLogger { id: next_id, log: &log };
                next_id += 1;
                logger
            })
            .unwrap();

        heap.allocator().destroy_deferred(arr);
        assert_eq!(*log.borrow(), [2, 1, 0]);

        // Destruction is idempotent; the memory goes at the next sweep.
        heap.allocator().destroy_deferred(arr);
        assert_eq!(log.borrow().len(), 3);
        assert_eq!(heap.release_unreachable().chunks, 1);
        assert_eq!(log.borrow().len(), 3);
    }

    #[test]
    fn construction_panic_is_strongly_safe() {
        let alloc_counters = (Cell::new(0), Cell::new(0));
        let heap = Heap::new();
        let allocator = CountingAllocator {
            allocated: &alloc_counters.0,
            deallocated: &alloc_counters.1,
        };
        let clones = Cell::new(0);
        let drops = Cell::new(0);
        let before = heap.stats();

        let outcome = catch_unwind(AssertUnwindSafe(|| {
            let value = Explosive {
                clones: &clones,
                drops: &drops,
                fuse: 3,
            };
            heap.allocator().allocate_array(allocator.clone(), 5, value)
        }));
        assert!(outcome.is_err());

        // The two constructed elements were dropped by the teardown, plus
        // the broadcast original during unwinding.
        assert_eq!(clones.get(), 3);
        assert_eq!(drops.get(), 3);

        // Nothing registered, nothing leaked.
        assert_eq!(heap.stats(), before);
        assert_eq!(alloc_counters.0.get(), 1);
        assert_eq!(alloc_counters.1.get(), 1);
    }
}
