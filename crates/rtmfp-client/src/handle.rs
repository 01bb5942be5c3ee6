//! Generation-checked connection handles

use std::fmt;
use std::num::NonZeroU32;

/// Opaque connection handle
///
/// Low 16 bits hold the slot index plus one, high 16 bits the slot
/// generation, so a handle to a freed slot never matches its next occupant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Handle(NonZeroU32);

impl Handle {
    fn new(index: usize, generation: u16) -> Self {
        let raw = ((generation as u32) << 16) | (index as u32 + 1);
        // index + 1 is never zero
        Handle(NonZeroU32::new(raw).unwrap_or(NonZeroU32::MIN))
    }

    pub fn from_raw(raw: u32) -> Option<Self> {
        if raw & 0xFFFF == 0 {
            return None;
        }
        NonZeroU32::new(raw).map(Handle)
    }

    pub fn raw(self) -> u32 {
        self.0.get()
    }

    fn index(self) -> usize {
        (self.0.get() & 0xFFFF) as usize - 1
    }

    fn generation(self) -> u16 {
        (self.0.get() >> 16) as u16
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Largest number of simultaneous entries
pub const MAX_SLOTS: usize = 0xFFFF;

#[derive(Debug)]
struct Slot<T> {
    generation: u16,
    value: Option<T>,
}

/// Slot arena keyed by [`Handle`]
#[derive(Debug)]
pub struct Arena<T> {
    slots: Vec<Slot<T>>,
    free: Vec<usize>,
    len: usize,
}

impl<T> Default for Arena<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Arena<T> {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            len: 0,
        }
    }

    /// Insert a value; `None` when every slot is taken
    pub fn insert(&mut self, value: T) -> Option<Handle> {
        self.insert_with(|_| value)
    }

    /// Insert a value built from its own handle
    pub fn insert_with(&mut self, build: impl FnOnce(Handle) -> T) -> Option<Handle> {
        let index = match self.free.pop() {
            Some(index) => index,
            None if self.slots.len() < MAX_SLOTS => {
                self.slots.push(Slot {
                    generation: 0,
                    value: None,
                });
                self.slots.len() - 1
            }
            None => return None,
        };
        let slot = &mut self.slots[index];
        let handle = Handle::new(index, slot.generation);
        slot.value = Some(build(handle));
        self.len += 1;
        Some(handle)
    }

    pub fn get(&self, handle: Handle) -> Option<&T> {
        let slot = self.slots.get(handle.index())?;
        if slot.generation != handle.generation() {
            return None;
        }
        slot.value.as_ref()
    }

    pub fn contains(&self, handle: Handle) -> bool {
        self.get(handle).is_some()
    }

    /// Whether `handle` once referred to a slot that has since been freed
    pub fn is_stale(&self, handle: Handle) -> bool {
        self.slots
            .get(handle.index())
            .is_some_and(|slot| slot.generation != handle.generation())
    }

    pub fn remove(&mut self, handle: Handle) -> Option<T> {
        let slot = self.slots.get_mut(handle.index())?;
        if slot.generation != handle.generation() {
            return None;
        }
        let value = slot.value.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(handle.index());
        self.len -= 1;
        Some(value)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = (Handle, &T)> {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.value
                .as_ref()
                .map(|value| (Handle::new(index, slot.generation), value))
        })
    }

    /// Remove every entry
    pub fn drain(&mut self) -> Vec<(Handle, T)> {
        let handles: Vec<Handle> = self.iter().map(|(handle, _)| handle).collect();
        handles
            .into_iter()
            .filter_map(|handle| self.remove(handle).map(|value| (handle, value)))
            .collect()
    }
}
