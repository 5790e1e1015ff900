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

//! The in-chunk control header.
//!
//! Every allocation made through a [`crate::Allocator`] is a single *chunk*
//! laid out, in address order, as
//!
//! ```text
//! [ size_field? | allocator_copy | header | payload(object[0..n)) ]
//! ```
//!
//! The header is the anchor of the whole system: it carries the type
//! descriptor the collector dispatches through, the mark/destroy/array
//! flags, and the root reference count that pins a chunk against
//! collection. All other addresses of the chunk are derived from the header
//! address and the descriptor's size constants; in particular the payload
//! starts exactly `size_of::<ChunkHeader>()` bytes after the header, so a
//! payload address can always be translated back to its header.

use std::cell::Cell;
use std::mem::size_of;

use thiserror::Error;

use crate::helper::TypeHelper;

/// Alignment of every chunk region.
///
/// The raw allocation, the allocator copy, the header, and the payload all
/// start on a multiple of this. Object and allocator types aligned above it
/// are rejected when their type descriptor is instantiated.
pub(crate) const CHUNK_ALIGN: usize = 16;

/// Bytes reserved in front of an array chunk for its element count.
///
/// The count itself is a `usize` stored in the last `size_of::<usize>()`
/// bytes of the region, immediately before the allocator copy; the region is
/// a full [`CHUNK_ALIGN`] so the rest of the chunk stays aligned.
pub(crate) const SIZE_FIELD_REGION: usize = CHUNK_ALIGN;

/// Round `bytes` up to the next multiple of `align` (a power of two).
pub(crate) const fn round_up(bytes: usize, align: usize) -> usize {
    (bytes + align - 1) & !(align - 1)
}

/// Size of the region holding the in-chunk copy of an allocator of type `A`.
///
/// Zero-sized allocators occupy no space at all, which keeps the common
/// system-allocator chunk layout at `[header | payload]`.
pub(crate) const fn allocator_region_bytes<A>() -> usize {
    round_up(size_of::<A>(), CHUNK_ALIGN)
}

/// The error returned when a chunk's root reference count is saturated and
/// one more root handle tries to pin it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("max number of root references reached")]
pub struct RootOverflow;

/// Bit marking a chunk as an array allocation.
const ARRAY_FLAG: u16 = 0x0001;
/// Bit marking a chunk whose destructors have already run.
const DESTROYED_FLAG: u16 = 0x0002;
/// Bit marking a chunk as reached during the current mark phase.
const VISITED_FLAG: u16 = 0x0004;

/// The mutable half of a chunk header: flag bits plus the root reference
/// count.
///
/// Handles mutate this state through shared references while the heap owns
/// the chunk, so both fields live in [`Cell`]s; the heap is single-threaded
/// by construction (nothing in this crate is `Send` or `Sync`).
pub(crate) struct ChunkFlags {
    /// The flag bits.
    data: Cell<u16>,
    /// How many live root handles currently pin this chunk.
    root_references: Cell<u16>,
}

impl ChunkFlags {
    /// Create the flags for a fresh chunk: not visited, not destroyed, no
    /// root references.
    fn new(is_array: bool) -> ChunkFlags {
        ChunkFlags {
            data: Cell::new(if is_array { ARRAY_FLAG } else { 0 }),
            root_references: Cell::new(0),
        }
    }

    /// Whether this chunk was reached during the current mark phase.
    pub(crate) fn is_visited(&self) -> bool {
        self.data.get() & VISITED_FLAG == VISITED_FLAG
    }

    /// Record that this chunk was reached during the current mark phase.
    pub(crate) fn mark_visited(&self) {
        self.data.set(self.data.get() | VISITED_FLAG);
    }

    /// Reset the visited bit at the start of a collection cycle.
    pub(crate) fn clear_visited(&self) {
        self.data.set(self.data.get() & !VISITED_FLAG);
    }

    /// Whether this chunk is an array allocation carrying a size field.
    pub(crate) fn is_array(&self) -> bool {
        self.data.get() & ARRAY_FLAG == ARRAY_FLAG
    }

    /// Whether the payload's destructors have already run.
    pub(crate) fn is_destroyed(&self) -> bool {
        self.data.get() & DESTROYED_FLAG == DESTROYED_FLAG
    }

    /// Record that the payload's destructors have run. Monotone: the bit is
    /// never cleared.
    pub(crate) fn mark_destroyed(&self) {
        self.data.set(self.data.get() | DESTROYED_FLAG);
    }

    /// Whether at least one live root handle pins this chunk.
    pub(crate) fn is_root(&self) -> bool {
        self.root_references.get() != 0
    }

    /// Add one root pin.
    ///
    /// # Errors
    ///
    /// Fails with [`RootOverflow`] when the counter is saturated; the count
    /// is left unchanged.
    pub(crate) fn increment_root_reference(&self) -> Result<(), RootOverflow> {
        let refs = self.root_references.get();
        if refs == u16::MAX {
            return Err(RootOverflow);
        }
        self.root_references.set(refs + 1);
        Ok(())
    }

    /// Remove one root pin. The count must be positive; decrementing a zero
    /// count is a contract violation.
    pub(crate) fn decrement_root_reference(&self) {
        let refs = self.root_references.get();
        debug_assert!(refs > 0, "decremented a zero root reference count");
        self.root_references.set(refs.wrapping_sub(1));
    }

    /// The current number of root pins.
    #[cfg(test)]
    pub(crate) fn root_references(&self) -> u16 {
        self.root_references.get()
    }
}

/// The per-chunk control block.
///
/// Embedded directly inside the allocation it describes, between the
/// allocator copy and the payload. The alignment keeps the payload (which
/// starts right after the header) suitably placed for any object type the
/// chunk protocol accepts.
#[repr(C, align(16))]
pub(crate) struct ChunkHeader {
    /// The type descriptor for the payload, chosen at allocation time and
    /// never changed.
    pub(crate) helper: &'static TypeHelper,
    /// Flags and root reference count.
    pub(crate) flags: ChunkFlags,
}

impl ChunkHeader {
    /// Create the header for a fresh chunk.
    pub(crate) fn new(helper: &'static TypeHelper, is_array: bool) -> ChunkHeader {
        ChunkHeader {
            helper,
            flags: ChunkFlags::new(is_array),
        }
    }

    /// The number of payload objects: 1 for scalar chunks, the stored size
    /// field for array chunks.
    pub(crate) fn object_count(&self) -> usize {
        if !self.flags.is_array() {
            return 1;
        }
        let size_ptr = self.allocator_start().wrapping_sub(size_of::<usize>());
        // SAFETY: array chunks always carry their element count in the
        // trailing bytes of the size-field region, written by the frontend
        // before the header was constructed.
        unsafe { *size_ptr.cast::<usize>() }
    }

    /// Address of the first payload object.
    pub(crate) fn object_start(&self) -> *mut u8 {
        let this: *const ChunkHeader = self;
        this.cast::<u8>().cast_mut().wrapping_add(size_of::<ChunkHeader>())
    }

    /// Address of the in-chunk allocator copy (equal to the header address
    /// when the allocator is zero-sized).
    pub(crate) fn allocator_start(&self) -> *mut u8 {
        let this: *const ChunkHeader = self;
        this.cast::<u8>()
            .cast_mut()
            .wrapping_sub(self.helper.bytes_per_allocator)
    }

    /// Address of the start of the raw allocation.
    pub(crate) fn raw_start(&self) -> *mut u8 {
        let allocator = self.allocator_start();
        if self.flags.is_array() {
            allocator.wrapping_sub(SIZE_FIELD_REGION)
        } else {
            allocator
        }
    }

    /// Total size of the raw allocation backing this chunk, in bytes.
    pub(crate) fn bytes_allocated(&self) -> usize {
        let mut bytes = self.helper.bytes_per_object * self.object_count();
        if self.flags.is_array() {
            bytes += SIZE_FIELD_REGION;
        }
        bytes + size_of::<ChunkHeader>() + self.helper.bytes_per_allocator
    }

    /// Derive the header address from a payload address.
    ///
    /// Valid for every payload address the frontend hands out, scalar or
    /// array: the payload always starts exactly one header past the header
    /// address.
    pub(crate) fn from_object_start(payload: *mut u8) -> *mut ChunkHeader {
        payload.wrapping_sub(size_of::<ChunkHeader>()).cast()
    }
}

#[cfg(test)]
mod tests {
    use std::mem::align_of;

    use super::*;
    use crate::alloc::SystemAllocator;

    #[test]
    fn header_layout() {
        assert_eq!(align_of::<ChunkHeader>(), CHUNK_ALIGN);
        assert_eq!(size_of::<ChunkHeader>() % CHUNK_ALIGN, 0);
    }

    #[test]
    fn region_rounding() {
        assert_eq!(round_up(0, 16), 0);
        assert_eq!(round_up(1, 16), 16);
        assert_eq!(round_up(16, 16), 16);
        assert_eq!(round_up(17, 16), 32);
        assert_eq!(allocator_region_bytes::<SystemAllocator>(), 0);
        assert_eq!(allocator_region_bytes::<[u8; 3]>(), 16);
        assert_eq!(allocator_region_bytes::<[u8; 24]>(), 32);
    }

    #[test]
    fn fresh_flags() {
        let flags = ChunkFlags::new(false);
        assert!(!flags.is_array());
        assert!(!flags.is_visited());
        assert!(!flags.is_destroyed());
        assert!(!flags.is_root());

        let flags = ChunkFlags::new(true);
        assert!(flags.is_array());
        assert!(!flags.is_visited());
    }

    #[test]
    fn visited_set_and_clear() {
        let flags = ChunkFlags::new(false);
        flags.mark_visited();
        assert!(flags.is_visited());
        flags.clear_visited();
        assert!(!flags.is_visited());
    }

    #[test]
    fn destroyed_is_monotone() {
        let flags = ChunkFlags::new(true);
        flags.mark_destroyed();
        assert!(flags.is_destroyed());
        flags.mark_visited();
        flags.clear_visited();
        assert!(flags.is_destroyed());
        assert!(flags.is_array());
    }

    #[test]
    fn root_reference_counting() {
        let flags = ChunkFlags::new(false);
        flags.increment_root_reference().unwrap();
        flags.increment_root_reference().unwrap();
        assert!(flags.is_root());
        assert_eq!(flags.root_references(), 2);
        flags.decrement_root_reference();
        assert!(flags.is_root());
        flags.decrement_root_reference();
        assert!(!flags.is_root());
    }

    #[test]
    fn root_reference_overflow() {
        let flags = ChunkFlags::new(false);
        for _ in 0..u16::MAX {
            flags.increment_root_reference().unwrap();
        }
        assert_eq!(flags.increment_root_reference(), Err(RootOverflow));
        assert_eq!(flags.root_references(), u16::MAX);
        flags.decrement_root_reference();
        flags.increment_root_reference().unwrap();
    }

    #[test]
    fn scalar_header_addresses() {
        let header = ChunkHeader::new(TypeHelper::of::<u64, SystemAllocator>(), false);
        assert_eq!(header.object_count(), 1);

        let header_addr: *const ChunkHeader = &header;
        let payload = header.object_start();
        assert_eq!(
            payload,
            header_addr.cast::<u8>().cast_mut().wrapping_add(size_of::<ChunkHeader>())
        );
        assert_eq!(ChunkHeader::from_object_start(payload), header_addr.cast_mut());

        // A zero-sized allocator occupies no region at all.
        assert_eq!(header.allocator_start(), header_addr.cast::<u8>().cast_mut());
        assert_eq!(header.raw_start(), header.allocator_start());
        assert_eq!(
            header.bytes_allocated(),
            size_of::<u64>() + size_of::<ChunkHeader>()
        );
    }
}
