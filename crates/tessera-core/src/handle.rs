//! # Generational Handle Tables
//!
//! Every client-visible identifier is a slot index paired with the slot's
//! generation. Removing an entry bumps the generation, so an identifier that
//! outlived its object never resolves to whatever reuses the slot.
//!
//! On the wire a handle is a nonzero `u32`:
//!
//! ```text
//!  31        20 19                 0
//! ┌────────────┬────────────────────┐
//! │ generation │     index + 1      │
//! └────────────┴────────────────────┘
//! ```
//!
//! A slot whose generation would wrap is retired and never handed out again.

use core::fmt;
use core::hash::{Hash, Hasher};
use core::marker::PhantomData;

use crate::error::{Error, Result};

const INDEX_BITS: u32 = 20;
const INDEX_MASK: u32 = (1 << INDEX_BITS) - 1;
const GENERATION_MAX: u32 = (1 << (32 - INDEX_BITS)) - 1;

/// Largest number of slots a table can address
pub const MAX_SLOTS: usize = (INDEX_MASK - 1) as usize;

// =============================================================================
// HANDLE
// =============================================================================

/// Typed generational handle
pub struct Handle<T> {
    index: u32,
    generation: u32,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Handle<T> {
    const fn new(index: u32, generation: u32) -> Self {
        Self {
            index,
            generation,
            _marker: PhantomData,
        }
    }

    /// Decode a wire identifier; zero and out-of-range values yield `None`
    pub const fn from_raw(raw: u32) -> Option<Self> {
        let slot = raw & INDEX_MASK;
        if slot == 0 {
            return None;
        }
        Some(Self::new(slot - 1, raw >> INDEX_BITS))
    }

    /// Encode as a wire identifier
    pub const fn to_raw(self) -> u32 {
        (self.generation << INDEX_BITS) | (self.index + 1)
    }

    /// Slot index
    pub const fn index(self) -> u32 {
        self.index
    }

    /// Slot generation
    pub const fn generation(self) -> u32 {
        self.generation
    }
}

impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Handle<T> {}

impl<T> PartialEq for Handle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index && self.generation == other.generation
    }
}

impl<T> Eq for Handle<T> {}

impl<T> Hash for Handle<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.to_raw().hash(state);
    }
}

impl<T> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handle({}v{})", self.index, self.generation)
    }
}

impl<T> fmt::Display for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_raw())
    }
}

// =============================================================================
// HANDLE TABLE
// =============================================================================

#[derive(Debug)]
enum Slot<T> {
    Occupied { generation: u32, value: T },
    Vacant { generation: u32 },
    Retired,
}

/// Arena of values addressed by generational handles
#[derive(Debug)]
pub struct HandleTable<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    len: usize,
    capacity: usize,
}

impl<T> HandleTable<T> {
    /// Create a table holding at most `capacity` live entries
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            len: 0,
            capacity: capacity.min(MAX_SLOTS),
        }
    }

    /// Number of live entries
    pub fn len(&self) -> usize {
        self.len
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Insert a value, returning its fresh handle
    pub fn insert(&mut self, value: T) -> Result<Handle<T>> {
        if self.len >= self.capacity {
            return Err(Error::OutOfResources);
        }

        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                if self.slots.len() >= MAX_SLOTS {
                    return Err(Error::OutOfResources);
                }
                self.slots.push(Slot::Vacant { generation: 0 });
                (self.slots.len() - 1) as u32
            }
        };

        let slot = &mut self.slots[index as usize];
        let generation = match *slot {
            Slot::Vacant { generation } => generation,
            _ => return Err(Error::OutOfResources),
        };
        *slot = Slot::Occupied { generation, value };
        self.len += 1;
        Ok(Handle::new(index, generation))
    }

    /// Look up a live entry
    pub fn get(&self, handle: Handle<T>) -> Option<&T> {
        match self.slots.get(handle.index as usize)? {
            Slot::Occupied { generation, value } if *generation == handle.generation => {
                Some(value)
            }
            _ => None,
        }
    }

    /// Look up a live entry mutably
    pub fn get_mut(&mut self, handle: Handle<T>) -> Option<&mut T> {
        match self.slots.get_mut(handle.index as usize)? {
            Slot::Occupied { generation, value } if *generation == handle.generation => {
                Some(value)
            }
            _ => None,
        }
    }

    /// Check whether a handle is live
    pub fn contains(&self, handle: Handle<T>) -> bool {
        self.get(handle).is_some()
    }

    /// Remove an entry, invalidating its handle
    pub fn remove(&mut self, handle: Handle<T>) -> Option<T> {
        let slot = self.slots.get_mut(handle.index as usize)?;
        match slot {
            Slot::Occupied { generation, .. } if *generation == handle.generation => {}
            _ => return None,
        }

        let next = handle.generation + 1;
        let old = if next > GENERATION_MAX {
            core::mem::replace(slot, Slot::Retired)
        } else {
            let old = core::mem::replace(slot, Slot::Vacant { generation: next });
            self.free.push(handle.index);
            old
        };
        self.len -= 1;

        match old {
            Slot::Occupied { value, .. } => Some(value),
            _ => None,
        }
    }

    /// Iterate over live entries
    pub fn iter(&self) -> impl Iterator<Item = (Handle<T>, &T)> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| match slot {
                Slot::Occupied { generation, value } => {
                    Some((Handle::new(index as u32, *generation), value))
                }
                _ => None,
            })
    }

    /// Handles of all live entries
    pub fn handles(&self) -> Vec<Handle<T>> {
        self.iter().map(|(handle, _)| handle).collect()
    }
}
