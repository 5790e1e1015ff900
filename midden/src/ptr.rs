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

//! The smart handles user code holds into the deferred heap.
//!
//! A [`DeferredPtr`] does not own its object — the heap does. It exists so
//! the collector can trace reachability: any deferred handle stored inside
//! a heap object is reported to the tracer by that object's [`Traceable`]
//! implementation. Copying one is two pointer copies and never touches the
//! heap.
//!
//! A [`RootPtr`] additionally *pins* its target: while it is live and
//! non-null, the referenced chunk counts as a root of the object graph and
//! survives every collection, as does everything reachable from it. Each
//! live root handle contributes exactly one pin; Rust moves transfer the
//! pin without touching the count.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::ops::Deref;
use std::ptr;

use crate::chunk::{ChunkHeader, RootOverflow};
use crate::{Traceable, Visitor};

/// A non-owning handle to an object (or array of objects) in a deferred
/// heap.
///
/// Obtained from [`crate::Allocator::make`] and friends. Dereferencing a
/// null handle is a contract violation and panics; a handle to a collected
/// or explicitly destroyed object is dangling, and dereferencing it is
/// undefined behavior — keeping handles valid is what root pins and the
/// tracer are for.
pub struct DeferredPtr<T: ?Sized> {
    /// The payload address; null exactly when `header` is null.
    ptr: *mut T,
    /// The control header of the chunk the payload lives in.
    header: *mut ChunkHeader,
}

impl<T: ?Sized> DeferredPtr<T> {
    /// Create a handle from the chunk parts produced by the frontend.
    pub(crate) fn from_raw_parts(header: ptr::NonNull<ChunkHeader>, payload: *mut T) -> Self {
        debug_assert_eq!(
            ChunkHeader::from_object_start(payload.cast::<u8>()),
            header.as_ptr(),
            "payload does not start one header past its chunk header"
        );
        DeferredPtr {
            ptr: payload,
            header: header.as_ptr(),
        }
    }

    /// Whether this handle is null. The payload and header references are
    /// always null together.
    pub fn is_null(&self) -> bool {
        self.header.is_null()
    }

    /// The raw payload pointer; null for a null handle.
    pub fn get(&self) -> *mut T {
        self.ptr
    }

    /// Reset the handle to null, clearing the payload and header references
    /// together.
    pub fn reset(&mut self) {
        self.ptr = self.ptr.with_addr(0);
        self.header = ptr::null_mut();
    }

    /// The payload address stripped of any metadata; the unit of handle
    /// equality and ordering.
    fn thin(&self) -> *mut u8 {
        self.ptr.cast::<u8>()
    }

    /// The chunk header pointer.
    pub(crate) fn header(&self) -> *mut ChunkHeader {
        self.header
    }

    /// Borrow the chunk header, or `None` for a null handle.
    ///
    /// # Safety
    ///
    /// For a non-null handle the chunk must still be owned by its heap; the
    /// returned borrow must not outlive that ownership.
    pub(crate) unsafe fn header_ref<'a>(&self) -> Option<&'a ChunkHeader> {
        self.header.as_ref()
    }
}

impl<T> DeferredPtr<T> {
    /// The null handle.
    #[must_use]
    pub const fn null() -> Self {
        DeferredPtr {
            ptr: ptr::null_mut(),
            header: ptr::null_mut(),
        }
    }
}

impl<T> DeferredPtr<[T]> {
    /// The null array handle.
    #[must_use]
    pub fn null() -> Self {
        DeferredPtr {
            ptr: ptr::slice_from_raw_parts_mut(ptr::null_mut(), 0),
            header: ptr::null_mut(),
        }
    }

    /// The number of elements in the referenced array; 0 for a null handle.
    pub fn len(&self) -> usize {
        if self.is_null() {
            0
        } else {
            self.ptr.len()
        }
    }

    /// Whether the handle is null or references an empty array (the latter
    /// cannot actually be allocated).
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// A handle to the first element of the array.
    ///
    /// The element handle shares the array's chunk: pinning it pins the
    /// whole array, and tracing through it traces every element.
    pub fn first_element(&self) -> DeferredPtr<T> {
        DeferredPtr {
            ptr: self.ptr.cast::<T>(),
            header: self.header,
        }
    }
}

impl<T: ?Sized> Clone for DeferredPtr<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T: ?Sized> Copy for DeferredPtr<T> {}

impl<T> Default for DeferredPtr<T> {
    fn default() -> Self {
        Self::null()
    }
}

impl<T: ?Sized> Deref for DeferredPtr<T> {
    type Target = T;

    fn deref(&self) -> &T {
        assert!(!self.is_null(), "dereferenced a null deferred pointer");
        // SAFETY: the handle is non-null, and the user contract requires
        // the chunk to be live while the handle is dereferenced.
        unsafe { &*self.ptr }
    }
}

impl<T: ?Sized> PartialEq for DeferredPtr<T> {
    fn eq(&self, other: &Self) -> bool {
        self.thin() == other.thin()
    }
}

impl<T: ?Sized> Eq for DeferredPtr<T> {}

impl<T: ?Sized> PartialOrd for DeferredPtr<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T: ?Sized> Ord for DeferredPtr<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.thin().cmp(&other.thin())
    }
}

impl<T: ?Sized> Hash for DeferredPtr<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.thin().hash(state);
    }
}

impl<T: ?Sized> fmt::Debug for DeferredPtr<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DeferredPtr({:p})", self.thin())
    }
}

// SAFETY: a deferred handle's only traceable content is itself.
unsafe impl<T: Traceable + ?Sized> Traceable for DeferredPtr<T> {
    fn accept<V: Visitor>(&self, visitor: &mut V) -> Result<(), ()> {
        visitor.visit(self);
        Ok(())
    }
}

/// Add one root pin to the chunk behind `target`, if any.
fn pin<T: ?Sized>(target: &DeferredPtr<T>) -> Result<(), RootOverflow> {
    // SAFETY: a non-null handle being pinned refers to a live chunk.
    if let Some(header) = unsafe { target.header_ref() } {
        header.flags.increment_root_reference()?;
    }
    Ok(())
}

/// Remove the root pin `target` contributed, if any.
fn unpin<T: ?Sized>(target: &DeferredPtr<T>) {
    // SAFETY: a non-null pinned handle refers to a live chunk — pinned
    // chunks are never collected.
    if let Some(header) = unsafe { target.header_ref() } {
        header.flags.decrement_root_reference();
    }
}

/// A deferred handle that pins its target.
///
/// While a non-null `RootPtr` is live, the referenced chunk is a root of
/// reachability tracing and cannot be collected. Dropping, clearing, or
/// reassigning the handle releases its pin. Moving a `RootPtr` transfers
/// the pin without touching the reference count.
pub struct RootPtr<T: ?Sized> {
    /// The non-pinning view of the target.
    inner: DeferredPtr<T>,
}

impl<T: ?Sized> RootPtr<T> {
    /// Pin `target` and wrap it in a root handle. A null target yields a
    /// null root handle and touches nothing.
    ///
    /// # Errors
    ///
    /// Fails with [`RootOverflow`] when the target chunk's root reference
    /// count is saturated; nothing is changed.
    pub fn new(target: DeferredPtr<T>) -> Result<Self, RootOverflow> {
        pin(&target)?;
        Ok(RootPtr { inner: target })
    }

    /// Re-point this handle at `target`: release the current pin, then pin
    /// the new target.
    ///
    /// # Errors
    ///
    /// Fails with [`RootOverflow`] when the new target's root reference
    /// count is saturated; the handle is left in its pre-assignment state,
    /// old pin included.
    pub fn assign(&mut self, target: DeferredPtr<T>) -> Result<(), RootOverflow> {
        unpin(&self.inner);
        if let Err(overflow) = pin(&target) {
            // Cannot fail: the pin released above left room on the old
            // target.
            let _ = pin(&self.inner);
            return Err(overflow);
        }
        self.inner = target;
        Ok(())
    }

    /// Reset the handle to null, releasing its pin.
    pub fn clear(&mut self) {
        unpin(&self.inner);
        self.inner.reset();
    }

    /// The non-pinning view of this handle's target.
    pub fn as_deferred(&self) -> DeferredPtr<T> {
        self.inner
    }

    /// Whether this handle is null.
    pub fn is_null(&self) -> bool {
        self.inner.is_null()
    }

    /// The raw payload pointer; null for a null handle.
    pub fn get(&self) -> *mut T {
        self.inner.get()
    }
}

impl<T> RootPtr<T> {
    /// The null root handle. Pins nothing.
    #[must_use]
    pub fn null() -> Self {
        RootPtr {
            inner: DeferredPtr::<T>::null(),
        }
    }
}

impl<T> RootPtr<[T]> {
    /// The null array root handle. Pins nothing.
    #[must_use]
    pub fn null() -> Self {
        RootPtr {
            inner: DeferredPtr::<[T]>::null(),
        }
    }
}

impl<T: ?Sized> Clone for RootPtr<T> {
    /// Clone the handle, adding one more pin to the target.
    ///
    /// # Panics
    ///
    /// Panics if the target chunk's root reference count is saturated; use
    /// [`RootPtr::new`] on [`RootPtr::as_deferred`] to handle the overflow.
    fn clone(&self) -> Self {
        RootPtr::new(self.inner).expect("root reference count overflow")
    }
}

impl<T: ?Sized> Drop for RootPtr<T> {
    fn drop(&mut self) {
        unpin(&self.inner);
    }
}

impl<T> Default for RootPtr<T> {
    fn default() -> Self {
        Self::null()
    }
}

impl<T: ?Sized> Deref for RootPtr<T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.inner.deref()
    }
}

impl<T: ?Sized> PartialEq for RootPtr<T> {
    fn eq(&self, other: &Self) -> bool {
        self.inner == other.inner
    }
}

impl<T: ?Sized> Eq for RootPtr<T> {}

impl<T: ?Sized> fmt::Debug for RootPtr<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RootPtr({:p})", self.inner.thin())
    }
}

// SAFETY: a root handle stored inside a heap object traces exactly like
// the deferred handle it wraps (its pin is tracked separately, through the
// root reference count).
unsafe impl<T: Traceable + ?Sized> Traceable for RootPtr<T> {
    fn accept<V: Visitor>(&self, visitor: &mut V) -> Result<(), ()> {
        visitor.visit(&self.inner);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Heap;

    /// The root reference count of the chunk behind `ptr`.
    fn root_refs<T: ?Sized>(ptr: &DeferredPtr<T>) -> u16 {
        unsafe { ptr.header_ref() }.expect("null handle").flags.root_references()
    }

    #[test]
    fn null_handles() {
        let mut ptr = DeferredPtr::<u32>::null();
        assert!(ptr.is_null());
        assert!(ptr.get().is_null());
        assert_eq!(ptr, DeferredPtr::default());
        ptr.reset();
        assert!(ptr.is_null());

        let arr = DeferredPtr::<[u32]>::null();
        assert!(arr.is_null());
        assert_eq!(arr.len(), 0);
        assert!(arr.is_empty());
    }

    #[test]
    #[should_panic(expected = "dereferenced a null deferred pointer")]
    fn null_deref_panics() {
        let ptr = DeferredPtr::<u32>::null();
        let _ = *ptr;
    }

    #[test]
    fn copies_share_the_target() {
        let heap = Heap::new();
        let ptr = heap.allocator().make(41_u32).unwrap();
        let copy = ptr;
        assert_eq!(ptr, copy);
        assert_eq!(*copy, 41);
        // Copying never pins.
        assert_eq!(root_refs(&ptr), 0);
    }

    #[test]
    fn equality_and_order_follow_payload_addresses() {
        let heap = Heap::new();
        let alloc = heap.allocator();
        let a = alloc.make(1_u32).unwrap();
        let b = alloc.make(2_u32).unwrap();
        assert_ne!(a, b);
        assert_eq!(a.cmp(&b), a.get().cmp(&b.get()));
        assert_eq!(DeferredPtr::<u32>::null(), DeferredPtr::<u32>::null());
    }

    #[test]
    fn root_pin_lifecycle() {
        let heap = Heap::new();
        let ptr = heap.allocator().make(7_u32).unwrap();

        let root = RootPtr::new(ptr).unwrap();
        assert_eq!(root_refs(&ptr), 1);
        assert_eq!(*root, 7);

        let clone = root.clone();
        assert_eq!(root_refs(&ptr), 2);
        drop(clone);
        assert_eq!(root_refs(&ptr), 1);

        drop(root);
        assert_eq!(root_refs(&ptr), 0);
    }

    #[test]
    fn moving_a_root_keeps_one_pin() {
        let heap = Heap::new();
        let ptr = heap.allocator().make(3_u32).unwrap();
        let root = RootPtr::new(ptr).unwrap();
        assert_eq!(root_refs(&ptr), 1);

        let moved = root;
        assert_eq!(root_refs(&ptr), 1);

        let boxed = vec![moved];
        assert_eq!(root_refs(&ptr), 1);
        drop(boxed);
        assert_eq!(root_refs(&ptr), 0);
    }

    #[test]
    fn assign_repins() {
        let heap = Heap::new();
        let alloc = heap.allocator();
        let a = alloc.make(1_u32).unwrap();
        let b = alloc.make(2_u32).unwrap();

        let mut root = RootPtr::new(a).unwrap();
        root.assign(b).unwrap();
        assert_eq!(root_refs(&a), 0);
        assert_eq!(root_refs(&b), 1);
        assert_eq!(*root, 2);

        root.clear();
        assert!(root.is_null());
        assert_eq!(root_refs(&b), 0);
    }

    #[test]
    fn null_root_pins_nothing() {
        let root = RootPtr::<u32>::new(DeferredPtr::<u32>::null()).unwrap();
        assert!(root.is_null());
        drop(root);

        let mut root = RootPtr::<u32>::null();
        root.clear();
        assert!(root.is_null());
    }

    #[test]
    fn array_first_shares_the_chunk() {
        let heap = Heap::new();
        let arr = heap
            .allocator()
            .make_array(3, 9_u32)
            .unwrap();
        let first = arr.first_element();
        assert_eq!(*first, 9);
        assert_eq!(first.header(), arr.header());

        let root = RootPtr::new(first).unwrap();
        assert_eq!(root_refs(&arr.first_element()), 1);
        drop(root);
        assert_eq!(root_refs(&arr.first_element()), 0);
    }
}
