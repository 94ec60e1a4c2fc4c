//! Fixed-capacity slot table with generation-checked keys.
//!
//! Hardware tables (channels, filters) have a fixed number of entries and
//! the slot index is what gets programmed into the engine. Keys carry the
//! generation of the slot at insert time, so a key kept past `remove` can
//! never reach the slot's next occupant.

/// Key into a [`SlotTable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotKey {
    index: u16,
    generation: u32,
}

impl SlotKey {
    /// Slot index (the hardware table index).
    pub fn index(self) -> usize {
        self.index as usize
    }

    pub fn generation(self) -> u32 {
        self.generation
    }
}

/// Result of looking up a key that does not resolve.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lookup {
    /// Index is outside the table.
    OutOfRange,
    /// Slot was freed (or reused) since the key was issued.
    Stale,
}

#[derive(Debug)]
struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

/// Fixed-capacity arena with an O(1) free list.
#[derive(Debug)]
pub struct SlotTable<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u16>,
}

impl<T> SlotTable<T> {
    pub fn with_capacity(capacity: usize) -> Self {
        let slots = (0..capacity)
            .map(|_| Slot {
                generation: 0,
                value: None,
            })
            .collect();
        // Pop order hands out the lowest index first.
        let free = (0..capacity as u16).rev().collect();
        Self { slots, free }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn len(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.free.is_empty()
    }

    /// Insert a value, returning `None` when every slot is taken.
    pub fn insert(&mut self, value: T) -> Option<SlotKey> {
        let index = self.free.pop()?;
        let slot = &mut self.slots[index as usize];
        slot.value = Some(value);
        Some(SlotKey {
            index,
            generation: slot.generation,
        })
    }

    pub fn check(&self, key: SlotKey) -> Result<(), Lookup> {
        let slot = self.slots.get(key.index()).ok_or(Lookup::OutOfRange)?;
        if slot.generation == key.generation && slot.value.is_some() {
            Ok(())
        } else {
            Err(Lookup::Stale)
        }
    }

    pub fn contains(&self, key: SlotKey) -> bool {
        self.check(key).is_ok()
    }

    pub fn get(&self, key: SlotKey) -> Option<&T> {
        let slot = self.slots.get(key.index())?;
        if slot.generation != key.generation {
            return None;
        }
        slot.value.as_ref()
    }

    pub fn get_mut(&mut self, key: SlotKey) -> Option<&mut T> {
        let slot = self.slots.get_mut(key.index())?;
        if slot.generation != key.generation {
            return None;
        }
        slot.value.as_mut()
    }

    /// Remove the value and retire the key.
    pub fn remove(&mut self, key: SlotKey) -> Result<T, Lookup> {
        self.check(key)?;
        let slot = &mut self.slots[key.index()];
        let value = slot.value.take().ok_or(Lookup::Stale)?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(key.index);
        Ok(value)
    }

    /// Iterate over occupied slots in index order.
    pub fn iter(&self) -> impl Iterator<Item = (SlotKey, &T)> {
        self.slots.iter().enumerate().filter_map(|(i, slot)| {
            slot.value.as_ref().map(|v| {
                (
                    SlotKey {
                        index: i as u16,
                        generation: slot.generation,
                    },
                    v,
                )
            })
        })
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (SlotKey, &mut T)> {
        self.slots.iter_mut().enumerate().filter_map(|(i, slot)| {
            let generation = slot.generation;
            slot.value.as_mut().map(|v| {
                (
                    SlotKey {
                        index: i as u16,
                        generation,
                    },
                    v,
                )
            })
        })
    }

    pub fn keys(&self) -> Vec<SlotKey> {
        self.iter().map(|(k, _)| k).collect()
    }
}
