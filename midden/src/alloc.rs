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

//! The raw-memory interface chunks are allocated through.
//!
//! Every chunk records, by value, a copy of the allocator that produced it,
//! so the sweep phase can free the memory with no external state. That is
//! the whole contract of [`RawAllocator`]: hand out raw bytes, take them
//! back, and guarantee that a clone can free what the original allocated.

use std::alloc::Layout;
use std::ptr::NonNull;

use thiserror::Error;

/// The error returned when an underlying allocator cannot satisfy a
/// request. Nothing is registered with the heap and nothing leaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("allocation of {size} bytes (align {align}) failed")]
pub struct AllocError {
    /// The size of the failed request, in bytes.
    pub size: usize,
    /// The required alignment of the failed request.
    pub align: usize,
}

impl AllocError {
    /// The error for a failed request of `layout`.
    pub(crate) fn new(layout: Layout) -> AllocError {
        AllocError {
            size: layout.size(),
            align: layout.align(),
        }
    }
}

/// A source of raw memory for deferred chunks.
///
/// Implementations must be cheap to clone, and a clone must be able to
/// deallocate memory allocated by the original: the frontend stores a copy
/// of the allocator inside each chunk, and the sweep frees the chunk
/// through that copy long after the original value is gone.
pub trait RawAllocator: Clone {
    /// Allocate a block of memory described by `layout`.
    ///
    /// # Errors
    ///
    /// Returns [`AllocError`] if the request cannot be satisfied; the
    /// allocator must be left in a usable state.
    fn allocate(&self, layout: Layout) -> Result<NonNull<u8>, AllocError>;

    /// Release a block previously returned by [`RawAllocator::allocate`]
    /// on this allocator (or a clone of it) with the same layout.
    ///
    /// # Safety
    ///
    /// `ptr` must denote such a block, and it must not be used afterwards.
    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout);
}

/// The default allocator: the global system allocator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SystemAllocator;

impl RawAllocator for SystemAllocator {
    fn allocate(&self, layout: Layout) -> Result<NonNull<u8>, AllocError> {
        // SAFETY: chunk layouts always contain at least a header, so the
        // size is never zero.
        let ptr = unsafe { std::alloc::alloc(layout) };
        NonNull::new(ptr).ok_or(AllocError::new(layout))
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        std::alloc::dealloc(ptr.as_ptr(), layout);
    }
}
