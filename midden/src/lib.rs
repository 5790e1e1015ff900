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

//! A deferred mark-and-sweep garbage-collected heap with explicit roots.
//!
//! Rust's ownership model covers most programs, but object graphs with
//! arbitrary cross-links and cycles — interpreters, solvers, document
//! models — have no natural single owner. `midden` gives such graphs a heap
//! of their own. The [`Heap`] owns every allocation outright; user code
//! holds small, non-owning [`DeferredPtr`] handles and decides *when*
//! memory is reclaimed by calling [`Heap::release_unreachable`], which
//! traces the object graph from a set of pinned roots and frees everything
//! it cannot reach, cycles included.
//!
//! There is no background thread, no allocation threshold, and no pause you
//! did not ask for: a collection is an ordinary synchronous call, and its
//! return value tells you exactly how many chunks, objects, and bytes it
//! reclaimed.
//!
//! # Handles and roots
//!
//! [`DeferredPtr<T>`] is two words and `Copy`; copying or dropping one
//! never touches the heap. It exists so the tracer can see the edges of
//! your graph. [`RootPtr<T>`] is the pinning variant: while one is live and
//! non-null, its target (and everything reachable from it) survives every
//! collection. Pins are counted per chunk, so any number of root handles
//! may share a target.
//!
//! ```
//! use std::cell::Cell;
//! use midden::{DeferredPtr, Heap, RootPtr, Traceable};
//!
//! #[derive(Traceable)]
//! struct Node {
//!     next: Cell<DeferredPtr<Node>>,
//! }
//!
//! let heap = Heap::new();
//! let alloc = heap.allocator();
//!
//! // Two nodes in a cycle: a -> b -> a.
//! let a = alloc.make(Node { next: Cell::new(DeferredPtr::<Node>::null()) }).unwrap();
//! let b = alloc.make(Node { next: Cell::new(a) }).unwrap();
//! a.next.set(b);
//!
//! let root = RootPtr::new(a).unwrap();
//! assert_eq!(heap.release_unreachable().chunks, 0); // pinned, all kept
//!
//! drop(root);
//! assert_eq!(heap.release_unreachable().chunks, 2); // cycle reclaimed
//! ```
//!
//! # Making a type traceable
//!
//! The collector never inspects user types directly. Instead, every type
//! stored on the heap implements [`Traceable`], whose one job is to show a
//! [`Visitor`] every deferred handle directly reachable from a value. For
//! ordinary structs and enums, `#[derive(Traceable)]` visits every field in
//! declaration order; fields that cannot hold handles can opt out with
//! `#[traceable(skip)]`. Types that hide their handles behind raw storage
//! implement the trait by hand — the implementation *is* the visit hook.
//!
//! Standard library scalars, strings, and containers are already covered,
//! so a field like `RefCell<Vec<DeferredPtr<T>>>` traces with no extra
//! code.
//!
//! # Custom allocators
//!
//! Every allocation can be directed at a caller-supplied [`RawAllocator`].
//! A copy of the allocator is stored inside the chunk it allocated, so the
//! sweep can return the memory with no external bookkeeping — an allocator
//! value can go out of scope long before the chunks it produced die.
//!
//! # One heap, one thread
//!
//! A heap and all of its handles are confined to a single thread (none of
//! these types are `Send` or `Sync`), and operations never overlap:
//! allocation, handle updates, and collection all run to completion on the
//! calling thread. Separate heaps are fully independent, but a handle must
//! never lead from one heap into another.
//!
//! # Optional features
//!
//! - `derive` (default): re-exports `#[derive(Traceable)]` from
//!   `midden_derive`.
//! - `gc_logging`: emits `tracing` events for each collection cycle under
//!   the `midden::heap` target.
//!
//! # License
//!
//! `midden` is licensed under the GNU GPLv3 or later.

#![warn(clippy::pedantic)]
#![warn(clippy::cargo)]
#![warn(missing_docs)]
#![warn(clippy::missing_docs_in_private_items)]
#![allow(clippy::multiple_crate_versions, clippy::result_unit_err)]

mod alloc;
mod allocator;
mod chunk;
mod heap;
mod helper;
mod impls;
mod ptr;

pub use crate::alloc::{AllocError, RawAllocator, SystemAllocator};
pub use crate::allocator::Allocator;
pub use crate::chunk::RootOverflow;
pub use crate::heap::{Heap, HeapStats, ReclaimStats};
pub use crate::ptr::{DeferredPtr, RootPtr};

/// The trait of every type that can live on a deferred heap.
///
/// Its single obligation is to show the visitor every [`DeferredPtr`] (or
/// [`RootPtr`]) directly reachable from `self` — the value's outgoing edges
/// in the object graph. The collector drives this traversal to decide what
/// is still reachable; handles that are never reported are invisible to
/// it.
///
/// This trait should usually be implemented with `#[derive(Traceable)]`,
/// which delegates to every field in declaration order. Only types that
/// keep handles somewhere the derive cannot see should implement it by
/// hand.
///
/// # Safety
///
/// An implementation that fails to report a reachable handle leads the
/// collector to free a live object — a use-after-free. An implementation
/// must also report only handles actually owned by `self`, and must not
/// touch the heap (allocate, pin, destroy) while accepting a visitor.
///
/// # Examples
///
/// A type with no handles accepts trivially:
///
/// ```
/// use midden::{Traceable, Visitor};
///
/// struct Plain(u64);
///
/// unsafe impl Traceable for Plain {
///     fn accept<V: Visitor>(&self, _: &mut V) -> Result<(), ()> {
///         Ok(())
///     }
/// }
/// ```
///
/// A type owning handles delegates to each of its fields in a fixed order:
///
/// ```
/// use std::cell::Cell;
/// use midden::{DeferredPtr, Traceable, Visitor};
///
/// struct Pair {
///     left: Cell<DeferredPtr<Pair>>,
///     right: Cell<DeferredPtr<Pair>>,
/// }
///
/// unsafe impl Traceable for Pair {
///     fn accept<V: Visitor>(&self, visitor: &mut V) -> Result<(), ()> {
///         self.left.accept(visitor)?;
///         self.right.accept(visitor)?;
///         Ok(())
///     }
/// }
/// ```
pub unsafe trait Traceable {
    /// Report every deferred handle directly reachable from `self` to
    /// `visitor`, delegating to fields with `?` and returning `Ok(())` at
    /// the end.
    ///
    /// # Errors
    ///
    /// An error means some of the value's data is inaccessible — for
    /// example a [`RefCell`](std::cell::RefCell) that is mutably borrowed
    /// while the collector runs. During collection this is a contract
    /// violation and aborts the program with a panic.
    fn accept<V: Visitor>(&self, visitor: &mut V) -> Result<(), ()>;
}

/// The tracer handed to [`Traceable::accept`].
///
/// Implementations of `Traceable` call [`Visitor::visit`] on each handle
/// they own and do nothing else with the visitor. The concrete visitor is
/// an implementation detail of the collector; user code never constructs
/// one.
pub trait Visitor {
    /// Visit one deferred handle owned by the accepting value.
    fn visit<T: Traceable + ?Sized>(&mut self, ptr: &DeferredPtr<T>);
}

// Re-export #[derive(Traceable)].
#[cfg(feature = "derive")]
extern crate midden_derive;

/// Derive macro available if `midden` is built with `features = ["derive"]`.
#[cfg(feature = "derive")]
pub use midden_derive::Traceable;
