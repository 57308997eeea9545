//! Arena-based storage with typed handles.
//!
//! Values are appended once and never move. Removal is logical: a removed
//! slot keeps its index (so outstanding handles stay unambiguous) and is
//! skipped by lookup and iteration, but it is never reused.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::ops::{Index, IndexMut};

/// A typed handle into an [`Arena`].
///
/// Handles are lightweight identifiers (u32 index) that provide
/// type-safe access to arena-allocated values.
pub struct Handle<T> {
    index: u32,
    _phantom: PhantomData<T>,
}

impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Handle<T> {}

impl<T> PartialEq for Handle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index
    }
}

impl<T> Eq for Handle<T> {}

impl<T> PartialOrd for Handle<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Handle<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.index.cmp(&other.index)
    }
}

impl<T> Hash for Handle<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.index.hash(state);
    }
}

impl<T> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%{}", self.index)
    }
}

impl<T> fmt::Display for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%{}", self.index)
    }
}

impl<T> Handle<T> {
    /// Creates a new handle from a zero-based index.
    pub(crate) fn new(index: u32) -> Self {
        Self {
            index,
            _phantom: PhantomData,
        }
    }

    /// Returns the zero-based index of this handle.
    pub fn index(self) -> usize {
        self.index as usize
    }
}

/// An append-only arena with typed [`Handle`]-based access and logical removal.
#[derive(Clone, Debug)]
pub struct Arena<T> {
    data: Vec<T>,
    removed: Vec<bool>,
    live: usize,
}

impl<T> Default for Arena<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Arena<T> {
    /// Creates an empty arena.
    pub fn new() -> Self {
        Self {
            data: Vec::new(),
            removed: Vec::new(),
            live: 0,
        }
    }

    /// Returns the number of live (not removed) elements.
    pub fn len(&self) -> usize {
        self.live
    }

    /// Returns `true` if the arena holds no live elements.
    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Returns the number of slots ever allocated, removed ones included.
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Returns the handle that will be assigned to the next appended value.
    pub fn next_handle(&self) -> Handle<T> {
        Handle::new(self.checked_index())
    }

    /// Appends a value and returns its handle.
    pub fn append(&mut self, value: T) -> Handle<T> {
        let index = self.checked_index();
        self.data.push(value);
        self.removed.push(false);
        self.live += 1;
        Handle::new(index)
    }

    /// Logically removes a value. Returns `false` if it was already removed
    /// or the handle is unknown.
    pub fn remove(&mut self, handle: Handle<T>) -> bool {
        match self.removed.get_mut(handle.index()) {
            Some(flag) if !*flag => {
                *flag = true;
                self.live -= 1;
                true
            }
            _ => false,
        }
    }

    /// Returns `true` if the handle refers to a live value.
    pub fn contains(&self, handle: Handle<T>) -> bool {
        self.removed.get(handle.index()).is_some_and(|removed| !removed)
    }

    /// Returns a reference to the value if the handle is live.
    pub fn try_get(&self, handle: Handle<T>) -> Option<&T> {
        if self.contains(handle) {
            self.data.get(handle.index())
        } else {
            None
        }
    }

    /// Returns a mutable reference to the value if the handle is live.
    pub fn try_get_mut(&mut self, handle: Handle<T>) -> Option<&mut T> {
        if self.contains(handle) {
            self.data.get_mut(handle.index())
        } else {
            None
        }
    }

    /// Iterates over live `(handle, &value)` pairs in allocation order.
    pub fn iter(&self) -> impl Iterator<Item = (Handle<T>, &T)> {
        // Safety: arena size bounded by u32::MAX (enforced in append)
        self.data
            .iter()
            .zip(&self.removed)
            .enumerate()
            .filter(|(_, (_, removed))| !**removed)
            .map(|(i, (v, _))| (Handle::new(i as u32), v))
    }

    /// Iterates over live handles in allocation order.
    pub fn handles(&self) -> impl Iterator<Item = Handle<T>> + '_ {
        self.iter().map(|(h, _)| h)
    }

    fn checked_index(&self) -> u32 {
        u32::try_from(self.data.len()).unwrap_or_else(|_| {
            panic!("arena overflow: {} items exceeds u32::MAX", self.data.len())
        })
    }
}

impl<T> Index<Handle<T>> for Arena<T> {
    type Output = T;

    fn index(&self, handle: Handle<T>) -> &T {
        self.try_get(handle)
            .unwrap_or_else(|| panic!("stale arena handle {handle}"))
    }
}

impl<T> IndexMut<Handle<T>> for Arena<T> {
    fn index_mut(&mut self, handle: Handle<T>) -> &mut T {
        self.try_get_mut(handle)
            .unwrap_or_else(|| panic!("stale arena handle {handle}"))
    }
}
