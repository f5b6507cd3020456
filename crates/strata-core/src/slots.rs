//! Generational slot table.
//!
//! Objects are owned by the table and addressed by [`SlotKey`]. Removing an
//! object bumps the slot's generation, so keys handed out before the removal
//! stop resolving even after the slot is reused.

use crate::error::{Error, Result};
use std::fmt;

/// Key of an occupied slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotKey {
    index: u32,
    generation: u32,
}

impl SlotKey {
    /// Slot index.
    #[inline]
    pub const fn index(self) -> u32 {
        self.index
    }

    /// Generation the key was issued for.
    #[inline]
    pub const fn generation(self) -> u32 {
        self.generation
    }
}

impl fmt::Display for SlotKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}v{}", self.index, self.generation)
    }
}

struct Entry<T> {
    generation: u32,
    value: Option<T>,
}

/// Arena owning values by stable generational key.
pub struct SlotTable<T> {
    entries: Vec<Entry<T>>,
    free: Vec<u32>,
    len: usize,
}

impl<T> Default for SlotTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> SlotTable<T> {
    /// Create an empty table.
    pub const fn new() -> Self {
        Self {
            entries: Vec::new(),
            free: Vec::new(),
            len: 0,
        }
    }

    /// Insert a value, reusing a free slot when one exists.
    pub fn insert(&mut self, value: T) -> Result<SlotKey> {
        self.insert_with(|_| value)
    }

    /// Insert a value that needs to know its own key.
    pub fn insert_with<F: FnOnce(SlotKey) -> T>(&mut self, f: F) -> Result<SlotKey> {
        let index = if let Some(index) = self.free.pop() {
            index
        } else {
            let index = u32::try_from(self.entries.len()).map_err(|_| Error::Exhausted)?;
            self.entries.push(Entry {
                generation: 0,
                value: None,
            });
            index
        };

        let entry = &mut self.entries[index as usize];
        let key = SlotKey {
            index,
            generation: entry.generation,
        };
        entry.value = Some(f(key));
        self.len += 1;
        Ok(key)
    }

    /// Look up a live value.
    pub fn get(&self, key: SlotKey) -> Option<&T> {
        self.entries
            .get(key.index as usize)
            .filter(|e| e.generation == key.generation)
            .and_then(|e| e.value.as_ref())
    }

    /// Whether `key` resolves to a live value.
    pub fn contains(&self, key: SlotKey) -> bool {
        self.get(key).is_some()
    }

    /// Remove a value, invalidating its key.
    pub fn remove(&mut self, key: SlotKey) -> Option<T> {
        let entry = self
            .entries
            .get_mut(key.index as usize)
            .filter(|e| e.generation == key.generation)?;
        let value = entry.value.take()?;
        entry.generation = entry.generation.wrapping_add(1);
        self.free.push(key.index);
        self.len -= 1;
        Some(value)
    }

    /// Number of live values.
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Whether no values are live.
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Iterate over live values with their keys.
    pub fn iter(&self) -> impl Iterator<Item = (SlotKey, &T)> {
        self.entries.iter().enumerate().filter_map(|(index, e)| {
            e.value.as_ref().map(|v| {
                (
                    SlotKey {
                        index: index as u32,
                        generation: e.generation,
                    },
                    v,
                )
            })
        })
    }

    /// Remove every live value.
    pub fn drain(&mut self) -> Vec<T> {
        let mut out = Vec::with_capacity(self.len);
        for (index, entry) in self.entries.iter_mut().enumerate() {
            if let Some(value) = entry.value.take() {
                entry.generation = entry.generation.wrapping_add(1);
                self.free.push(index as u32);
                out.push(value);
            }
        }
        self.len = 0;
        out
    }
}

/// Bound-check a slot index against a fixed slot count.
#[inline]
pub const fn check_slot(index: usize, len: usize) -> Result<()> {
    if index < len {
        Ok(())
    } else {
        Err(Error::OutOfBounds { index, len })
    }
}
