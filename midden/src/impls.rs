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

//! [`Traceable`] implementations for standard-library types.
//!
//! Scalars and strings contain no deferred handles, so their `accept` is a
//! no-op. Containers delegate to every element they hold, which is what
//! makes a field like `Vec<DeferredPtr<T>>` or
//! `RefCell<Option<DeferredPtr<T>>>` traversable without any user code.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, BTreeSet, BinaryHeap, HashMap, HashSet, LinkedList, VecDeque};
use std::ffi::{OsStr, OsString};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use crate::{Traceable, Visitor};

/// Implement a no-op [`Traceable`] for types containing no deferred
/// handles.
macro_rules! empty_traceable {
    ($($t:ty),* $(,)?) => {
        $(
            // SAFETY: the type cannot contain a deferred handle.
            unsafe impl Traceable for $t {
                fn accept<V: Visitor>(&self, _: &mut V) -> Result<(), ()> {
                    Ok(())
                }
            }
        )*
    };
}

empty_traceable!(
    (),
    bool,
    char,
    i8,
    i16,
    i32,
    i64,
    i128,
    isize,
    u8,
    u16,
    u32,
    u64,
    u128,
    usize,
    f32,
    f64,
    String,
    str,
    OsString,
    OsStr,
    PathBuf,
    Path,
);

// SAFETY: phantom data holds nothing at all.
unsafe impl<T: ?Sized> Traceable for PhantomData<T> {
    fn accept<V: Visitor>(&self, _: &mut V) -> Result<(), ()> {
        Ok(())
    }
}

// SAFETY: delegates to the contained value, if any.
unsafe impl<T: Traceable> Traceable for Option<T> {
    fn accept<V: Visitor>(&self, visitor: &mut V) -> Result<(), ()> {
        if let Some(value) = self {
            value.accept(visitor)?;
        }
        Ok(())
    }
}

// SAFETY: delegates to whichever variant is held.
unsafe impl<T: Traceable, E: Traceable> Traceable for Result<T, E> {
    fn accept<V: Visitor>(&self, visitor: &mut V) -> Result<(), ()> {
        match self {
            Ok(value) => value.accept(visitor),
            Err(error) => error.accept(visitor),
        }
    }
}

// SAFETY: delegates to the boxed value.
unsafe impl<T: Traceable + ?Sized> Traceable for Box<T> {
    fn accept<V: Visitor>(&self, visitor: &mut V) -> Result<(), ()> {
        (**self).accept(visitor)
    }
}

// SAFETY: a copy of the contained value is traced; handles are `Copy`, so
// the copy reports the same target chunk.
unsafe impl<T: Traceable + Copy> Traceable for Cell<T> {
    fn accept<V: Visitor>(&self, visitor: &mut V) -> Result<(), ()> {
        self.get().accept(visitor)
    }
}

// SAFETY: delegates to the contained value; fails (a program error during
// collection) when the cell is mutably borrowed.
unsafe impl<T: Traceable> Traceable for RefCell<T> {
    fn accept<V: Visitor>(&self, visitor: &mut V) -> Result<(), ()> {
        self.try_borrow().map_err(|_| ())?.accept(visitor)
    }
}

/// Implement [`Traceable`] for sequences by delegating to every element.
macro_rules! sequence_traceable {
    ($($t:ty [$($params:tt)*]),* $(,)?) => {
        $(
            // SAFETY: every element is traced.
            unsafe impl<$($params)*> Traceable for $t {
                fn accept<V: Visitor>(&self, visitor: &mut V) -> Result<(), ()> {
                    for element in self {
                        element.accept(visitor)?;
                    }
                    Ok(())
                }
            }
        )*
    };
}

sequence_traceable!(
    [T] [T: Traceable],
    [T; N] [T: Traceable, const N: usize],
    Vec<T> [T: Traceable],
    VecDeque<T> [T: Traceable],
    LinkedList<T> [T: Traceable],
    BinaryHeap<T> [T: Traceable],
    BTreeSet<T> [T: Traceable],
    HashSet<T, S> [T: Traceable, S],
);

// SAFETY: every key and value is traced.
unsafe impl<K: Traceable, V2: Traceable> Traceable for BTreeMap<K, V2> {
    fn accept<V: Visitor>(&self, visitor: &mut V) -> Result<(), ()> {
        for (key, value) in self {
            key.accept(visitor)?;
            value.accept(visitor)?;
        }
        Ok(())
    }
}

// SAFETY: every key and value is traced.
unsafe impl<K: Traceable, V2: Traceable, S> Traceable for HashMap<K, V2, S> {
    fn accept<V: Visitor>(&self, visitor: &mut V) -> Result<(), ()> {
        for (key, value) in self {
            key.accept(visitor)?;
            value.accept(visitor)?;
        }
        Ok(())
    }
}

/// Implement [`Traceable`] for tuples by delegating to every position.
macro_rules! tuple_traceable {
    ($($idx:tt : $t:ident),+) => {
        // SAFETY: every position is traced.
        unsafe impl<$($t: Traceable),+> Traceable for ($($t,)+) {
            fn accept<V: Visitor>(&self, visitor: &mut V) -> Result<(), ()> {
                $(self.$idx.accept(visitor)?;)+
                Ok(())
            }
        }
    };
}

tuple_traceable!(0: A);
tuple_traceable!(0: A, 1: B);
tuple_traceable!(0: A, 1: B, 2: C);
tuple_traceable!(0: A, 1: B, 2: C, 3: D);
tuple_traceable!(0: A, 1: B, 2: C, 3: D, 4: E);
tuple_traceable!(0: A, 1: B, 2: C, 3: D, 4: E, 5: F);

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use crate::{DeferredPtr, Heap, RootPtr, Traceable, Visitor};

    /// A bag of handles behind various std containers.
    struct Bag {
        /// Handles in a growable list.
        list: RefCell<Vec<DeferredPtr<u32>>>,
        /// An optional handle.
        maybe: Option<DeferredPtr<u32>>,
        /// A fixed pair of handles.
        pair: [DeferredPtr<u32>; 2],
    }

    unsafe impl Traceable for Bag {
        fn accept<V: Visitor>(&self, visitor: &mut V) -> Result<(), ()> {
            self.list.accept(visitor)?;
            self.maybe.accept(visitor)?;
            self.pair.accept(visitor)?;
            Ok(())
        }
    }

    #[test]
    fn containers_keep_their_targets_alive() {
        let heap = Heap::new();
        let alloc = heap.allocator();

        let in_list = alloc.make(1_u32).unwrap();
        let in_option = alloc.make(2_u32).unwrap();
        let in_array = alloc.make(3_u32).unwrap();
        let in_array2 = alloc.make(4_u32).unwrap();
        let garbage = alloc.make(5_u32).unwrap();
        assert!(!garbage.is_null());

        let bag = alloc
            .make(Bag {
                list: RefCell::new(vec![in_list]),
                maybe: Some(in_option),
                pair: [in_array, in_array2],
            })
            .unwrap();
        let _root = RootPtr::new(bag).unwrap();

        // Only the unreferenced scalar goes.
        let freed = heap.release_unreachable();
        assert_eq!(freed.chunks, 1);
        assert_eq!(heap.stats().chunks, 5);
        assert_eq!(*in_list, 1);
        assert_eq!(*in_option, 2);

        // Emptying the list strands its target at the next cycle.
        bag.list.borrow_mut().clear();
        assert_eq!(heap.release_unreachable().chunks, 1);
        assert_eq!(heap.stats().chunks, 4);
    }

    #[test]
    #[should_panic(expected = "inaccessible")]
    fn tracing_through_a_borrowed_cell_is_a_program_error() {
        let heap = Heap::new();
        let alloc = heap.allocator();
        let bag = alloc
            .make(Bag {
                list: RefCell::new(Vec::new()),
                maybe: None,
                pair: [DeferredPtr::<u32>::null(), DeferredPtr::<u32>::null()],
            })
            .unwrap();
        let _root = RootPtr::new(bag).unwrap();

        let _hold = bag.list.borrow_mut();
        let _ = heap.release_unreachable();
    }
}
