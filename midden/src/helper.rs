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

//! Per-type descriptors the collector dispatches through.
//!
//! The heap stores chunks of arbitrary user types but must be able to trace,
//! destroy, and free any of them without knowing the type. Each chunk header
//! therefore carries a [`TypeHelper`]: a small vtable-like record with the
//! payload's size constants and three function pointers monomorphized for
//! the (object type, allocator type) pair the chunk was created with.
//!
//! Descriptors are process-wide immutable singletons. They are realized as
//! promoted `&'static` constants, so they cost nothing at runtime, outlive
//! every heap, and impose no `'static` bound on user types.

use std::alloc::Layout;
use std::mem::{align_of, size_of};
use std::ptr::{drop_in_place, NonNull};

use crate::alloc::RawAllocator;
use crate::chunk::{allocator_region_bytes, ChunkHeader, CHUNK_ALIGN};
use crate::ptr::DeferredPtr;
use crate::{Traceable, Visitor};

/// Hook enumerating a chunk's outgoing deferred handles; unvisited targets
/// are marked and pushed on the collector's work list.
type MarkFn = unsafe fn(&ChunkHeader, &mut Vec<NonNull<ChunkHeader>>);
/// Hook dropping every payload object, in reverse construction order.
type DestroyFn = unsafe fn(&ChunkHeader);
/// Hook releasing the raw allocation through the in-chunk allocator copy.
type DeallocFn = unsafe fn(*mut ChunkHeader);

/// The descriptor for one (object type, allocator type) pair.
pub(crate) struct TypeHelper {
    /// Size of one payload object.
    pub(crate) bytes_per_object: usize,
    /// Size of the in-chunk allocator region, already padded to the chunk
    /// alignment.
    pub(crate) bytes_per_allocator: usize,
    /// See [`MarkFn`].
    mark_fn: MarkFn,
    /// See [`DestroyFn`].
    destroy_fn: DestroyFn,
    /// See [`DeallocFn`].
    dealloc_fn: DeallocFn,
}

impl TypeHelper {
    /// Build the descriptor value for objects of type `T` allocated with
    /// `A`. Evaluated at compile time by [`TypeHelper::of`]; the alignment
    /// assertions reject unsupported types per instantiation.
    const fn new<T: Traceable, A: RawAllocator>() -> TypeHelper {
        assert!(
            align_of::<T>() <= CHUNK_ALIGN,
            "object types aligned above the chunk alignment are not supported"
        );
        assert!(
            align_of::<A>() <= CHUNK_ALIGN,
            "allocator types aligned above the chunk alignment are not supported"
        );
        TypeHelper {
            bytes_per_object: size_of::<T>(),
            bytes_per_allocator: allocator_region_bytes::<A>(),
            mark_fn: mark_chunk::<T>,
            destroy_fn: destroy_chunk::<T>,
            dealloc_fn: deallocate_chunk::<A>,
        }
    }

    /// The process-wide descriptor singleton for `(T, A)`, evaluated at
    /// compile time and promoted to static storage.
    pub(crate) fn of<T: Traceable, A: RawAllocator>() -> &'static TypeHelper {
        const { &TypeHelper::new::<T, A>() }
    }

    /// Trace one chunk: enumerate the outgoing deferred handles of every
    /// live payload object and enqueue unvisited targets on `pending`.
    /// Returns immediately for destroyed chunks, whose payload is not
    /// inspectable.
    ///
    /// # Safety
    ///
    /// `header` must be the header of a live chunk created with this
    /// descriptor, and every handle reachable from the payload must point
    /// at a live chunk of the same heap.
    pub(crate) unsafe fn mark_recursive(
        &self,
        header: &ChunkHeader,
        pending: &mut Vec<NonNull<ChunkHeader>>,
    ) {
        (self.mark_fn)(header, pending);
    }

    /// Run the payload's destructors if they have not run yet, then set
    /// `is_destroyed`. Idempotent.
    ///
    /// # Safety
    ///
    /// `header` must be the header of a chunk created with this descriptor
    /// whose memory is still owned by the heap.
    pub(crate) unsafe fn destroy(&self, header: &ChunkHeader) {
        if header.flags.is_destroyed() {
            return;
        }
        (self.destroy_fn)(header);
        header.flags.mark_destroyed();
    }

    /// Free the raw allocation behind `header` using the in-chunk allocator
    /// copy. A null header is a no-op. The payload destructors must already
    /// have run.
    ///
    /// # Safety
    ///
    /// `header` must be null or the header of a destroyed chunk created
    /// with this descriptor; the chunk memory must not be used afterwards.
    pub(crate) unsafe fn deallocate(&self, header: *mut ChunkHeader) {
        (self.dealloc_fn)(header);
    }
}

/// The visitor driving the mark phase.
///
/// Marks every unvisited target it sees and hands it to the collector's
/// work list; visited targets are skipped, which both terminates cycles and
/// keeps each chunk on the list at most once.
struct MarkVisitor<'a> {
    /// Chunks marked but not yet traced.
    pending: &'a mut Vec<NonNull<ChunkHeader>>,
}

impl Visitor for MarkVisitor<'_> {
    fn visit<T: Traceable + ?Sized>(&mut self, ptr: &DeferredPtr<T>) {
        // SAFETY: handles traced from a live chunk refer to live chunks of
        // the same heap.
        let Some(header) = (unsafe { ptr.header_ref() }) else {
            return;
        };
        if header.flags.is_visited() {
            return;
        }
        header.flags.mark_visited();
        self.pending.push(NonNull::from(header));
    }
}

/// Monomorphic body of [`TypeHelper::mark_recursive`] for payloads of `T`.
unsafe fn mark_chunk<T: Traceable>(header: &ChunkHeader, pending: &mut Vec<NonNull<ChunkHeader>>) {
    if header.flags.is_destroyed() {
        return;
    }
    let base = header.object_start().cast::<T>();
    let mut visitor = MarkVisitor { pending };
    for i in 0..header.object_count() {
        (*base.add(i))
            .accept(&mut visitor)
            .expect("object data was inaccessible while tracing the heap");
    }
}

/// Monomorphic body of [`TypeHelper::destroy`] for payloads of `T`: drop
/// each object in reverse construction order.
unsafe fn destroy_chunk<T>(header: &ChunkHeader) {
    let base = header.object_start().cast::<T>();
    for i in (0..header.object_count()).rev() {
        drop_in_place(base.add(i));
    }
}

/// Monomorphic body of [`TypeHelper::deallocate`] for chunks allocated with
/// `A`: clone the in-chunk allocator copy, drop the copy, and free the raw
/// allocation through the clone.
unsafe fn deallocate_chunk<A: RawAllocator>(header: *mut ChunkHeader) {
    if header.is_null() {
        return;
    }
    let bytes = (*header).bytes_allocated();
    let raw = (*header).raw_start();
    let allocator_slot = (*header).allocator_start().cast::<A>();
    let allocator = (*allocator_slot).clone();
    drop_in_place(allocator_slot);
    let layout = Layout::from_size_align_unchecked(bytes, CHUNK_ALIGN);
    allocator.deallocate(NonNull::new_unchecked(raw), layout);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::SystemAllocator;

    #[test]
    fn singletons_are_shared() {
        let a = TypeHelper::of::<u32, SystemAllocator>();
        let b = TypeHelper::of::<u32, SystemAllocator>();
        assert!(std::ptr::eq(a, b));
    }

    #[test]
    fn size_constants() {
        let helper = TypeHelper::of::<u32, SystemAllocator>();
        assert_eq!(helper.bytes_per_object, 4);
        assert_eq!(helper.bytes_per_allocator, 0);
    }
}
