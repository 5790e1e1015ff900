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

//! The heap itself: chunk ownership, statistics, and the collector.
//!
//! A [`Heap`] exclusively owns every chunk allocated through its frontend.
//! Collection is user-driven: [`Heap::release_unreachable`] runs one
//! synchronous clear / mark-from-roots / sweep cycle on the calling thread
//! and reports exactly what it freed. Nothing else ever removes a chunk.
//!
//! The heap is single-threaded and cooperative. All of its types keep raw
//! pointers and are therefore neither `Send` nor `Sync`; an embedder that
//! wants to share a heap across threads must wrap every operation — handle
//! lifecycle events included — in its own lock.

use std::cell::RefCell;
use std::fmt;
use std::ptr::NonNull;

use crate::allocator::Allocator;
use crate::chunk::ChunkHeader;

/// A snapshot of everything currently owned by a [`Heap`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HeapStats {
    /// Number of live chunks.
    pub chunks: usize,
    /// Number of live chunks pinned by at least one root handle.
    pub root_chunks: usize,
    /// Number of live objects across all chunks.
    pub objects: usize,
    /// Number of live objects in root-pinned chunks.
    pub root_objects: usize,
    /// Total bytes of raw memory backing live chunks.
    pub bytes: usize,
}

/// What one collection cycle reclaimed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReclaimStats {
    /// Chunks destroyed and freed.
    pub chunks: usize,
    /// Objects destroyed.
    pub objects: usize,
    /// Bytes of raw memory returned to the allocators.
    pub bytes: usize,
}

/// An owned chunk, held by its header address.
struct ChunkPtr(NonNull<ChunkHeader>);

impl ChunkPtr {
    /// Borrow the chunk's header.
    fn header(&self) -> &ChunkHeader {
        // SAFETY: the heap owns the chunk for as long as it sits in the
        // chunk list.
        unsafe { self.0.as_ref() }
    }
}

/// A deferred garbage-collected heap.
///
/// Created empty; filled through the [`Allocator`] frontend returned by
/// [`Heap::allocator`]; emptied only by [`Heap::release_unreachable`] and
/// by dropping the heap, which destroys and frees everything it still owns.
///
/// # Examples
///
/// ```
/// use midden::{Heap, RootPtr};
///
/// let heap = Heap::new();
/// let value = heap.allocator().make(5_i64).unwrap();
/// let root = RootPtr::new(value).unwrap();
///
/// // Pinned: the collection frees nothing.
/// assert_eq!(heap.release_unreachable().objects, 0);
///
/// drop(root);
/// assert_eq!(heap.release_unreachable().objects, 1);
/// assert_eq!(heap.stats().chunks, 0);
/// ```
pub struct Heap {
    /// Every chunk this heap owns, in insertion order. The order carries no
    /// meaning; only sweep and `receive_chunk` mutate the list.
    chunks: RefCell<Vec<ChunkPtr>>,
}

impl Heap {
    /// Create an empty heap.
    #[must_use]
    pub fn new() -> Heap {
        Heap {
            chunks: RefCell::new(Vec::new()),
        }
    }

    /// The allocation frontend bound to this heap.
    #[must_use]
    pub fn allocator(&self) -> Allocator<'_> {
        Allocator::new(self)
    }

    /// A snapshot of the chunks, objects, and bytes currently owned, and
    /// how many of them are root-pinned.
    #[must_use]
    pub fn stats(&self) -> HeapStats {
        let chunks = self.chunks.borrow();
        let mut stats = HeapStats::default();
        for chunk in chunks.iter() {
            let header = chunk.header();
            let objects = header.object_count();
            stats.chunks += 1;
            stats.objects += objects;
            stats.bytes += header.bytes_allocated();
            if header.flags.is_root() {
                stats.root_chunks += 1;
                stats.root_objects += objects;
            }
        }
        stats
    }

    /// Take ownership of a freshly prepared chunk. Only the allocation
    /// frontend calls this; from here on the heap frees the chunk, whatever
    /// else happens.
    pub(crate) fn receive_chunk(&self, chunk: NonNull<ChunkHeader>) {
        self.chunks.borrow_mut().push(ChunkPtr(chunk));
    }

    /// Whether `header` belongs to a chunk owned by this heap.
    pub(crate) fn owns(&self, header: *mut ChunkHeader) -> bool {
        self.chunks
            .borrow()
            .iter()
            .any(|chunk| chunk.0.as_ptr() == header)
    }

    /// Run one collection cycle: clear all marks, mark everything reachable
    /// from root-pinned chunks, then destroy and free the rest.
    ///
    /// Destructors run in reverse construction order within each chunk; the
    /// order across chunks is unspecified. All destructors of a cycle run
    /// before any of its memory is freed. A second call with no intervening
    /// allocation or handle mutation frees nothing.
    pub fn release_unreachable(&self) -> ReclaimStats {
        // Clear marks and seed the work list with the root-pinned chunks.
        let mut pending: Vec<NonNull<ChunkHeader>> = Vec::new();
        {
            let chunks = self.chunks.borrow();
            for chunk in chunks.iter() {
                chunk.header().flags.clear_visited();
            }
            for chunk in chunks.iter() {
                let header = chunk.header();
                if header.flags.is_root() {
                    header.flags.mark_visited();
                    pending.push(chunk.0);
                }
            }

            #[cfg(feature = "gc_logging")]
            tracing::debug!(
                target: "midden::heap",
                chunks = chunks.len(),
                roots = pending.len(),
                "collection cycle starting"
            );
        }

        // Mark. The chunk list is not borrowed here: tracing runs user
        // `accept` implementations, which are entitled to look at the heap.
        while let Some(chunk) = pending.pop() {
            // SAFETY: marked chunks are owned by this heap and alive; no
            // chunk is removed during the mark phase.
            unsafe {
                let header = chunk.as_ref();
                header.helper.mark_recursive(header, &mut pending);
            }
        }

        // Sweep: keep the visited chunks, pull out the doomed ones.
        let doomed: Vec<NonNull<ChunkHeader>> = {
            let mut chunks = self.chunks.borrow_mut();
            let mut doomed = Vec::new();
            chunks.retain(|chunk| {
                if chunk.header().flags.is_visited() {
                    true
                } else {
                    doomed.push(chunk.0);
                    false
                }
            });
            doomed
        };

        // All destructors run before any chunk is freed, so a dying cycle
        // never reaches into a freed neighbor.
        let mut freed = ReclaimStats::default();
        for chunk in &doomed {
            // SAFETY: doomed chunks are no longer in the list but their
            // memory is still intact.
            unsafe {
                let header = chunk.as_ref();
                freed.chunks += 1;
                freed.objects += header.object_count();
                freed.bytes += header.bytes_allocated();
                header.helper.destroy(header);
            }
        }
        for chunk in &doomed {
            // SAFETY: destroyed above, never used again.
            unsafe {
                let header = chunk.as_ptr();
                (*header).helper.deallocate(header);
            }
        }

        #[cfg(feature = "gc_logging")]
        tracing::info!(
            target: "midden::heap",
            chunks = freed.chunks,
            objects = freed.objects,
            bytes = freed.bytes,
            "collection cycle complete"
        );

        freed
    }
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Heap {
    /// Destroy and free every chunk the heap still owns, reachable or not.
    fn drop(&mut self) {
        let chunks = self.chunks.get_mut();
        for chunk in chunks.iter() {
            // SAFETY: the chunk is still owned and intact.
            unsafe {
                let header = chunk.header();
                header.helper.destroy(header);
            }
        }
        for chunk in chunks.drain(..) {
            // SAFETY: destroyed above, never used again.
            unsafe {
                let header = chunk.0.as_ptr();
                (*header).helper.deallocate(header);
            }
        }
    }
}

impl fmt::Debug for Heap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Heap").field("stats", &self.stats()).finish()
    }
}
