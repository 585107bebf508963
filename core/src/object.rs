//! Arena of host objects referenced from instance data.
//!
//! Object fields never own what they point at. A raw [`ObjectHandle`] is a
//! generation-checked arena index that goes stale once the object is
//! collected; a [`SoftObjectPath`] is a lookup key that survives collection
//! and resolves again once an object with the same path is registered.

use ahash::AHashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectHandle {
    index: u32,
    generation: u32,
}

/// Path of an object; the empty path is the null reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SoftObjectPath(String);

impl SoftObjectPath {
    pub fn new(path: impl Into<String>) -> Self {
        SoftObjectPath(path.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_null(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for SoftObjectPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug)]
struct ObjectEntry {
    path: SoftObjectPath,
    class: String,
    released: bool,
}

#[derive(Debug, Default)]
struct Slot {
    generation: u32,
    entry: Option<ObjectEntry>,
}

#[derive(Debug, Default)]
struct Arena {
    slots: Vec<Slot>,
    free: Vec<u32>,
    by_path: AHashMap<SoftObjectPath, u32>,
}

/// Thread-safe object arena shared by execution contexts.
#[derive(Debug, Default)]
pub struct ObjectRegistry {
    arena: RwLock<Arena>,
}

impl ObjectRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a live object under `path`, replacing any previous object at that path.
    pub fn spawn(&self, path: impl Into<String>, class: impl Into<String>) -> ObjectHandle {
        let path = SoftObjectPath::new(path);
        let mut arena = self.arena.write();
        if let Some(old) = arena.by_path.get(&path).copied() {
            Self::free_slot(&mut arena, old);
        }
        let index = match arena.free.pop() {
            Some(index) => index,
            None => {
                arena.slots.push(Slot::default());
                (arena.slots.len() - 1) as u32
            }
        };
        let slot = &mut arena.slots[index as usize];
        slot.entry = Some(ObjectEntry {
            path: path.clone(),
            class: class.into(),
            released: false,
        });
        let handle = ObjectHandle {
            index,
            generation: slot.generation,
        };
        arena.by_path.insert(path, index);
        handle
    }

    pub fn is_alive(&self, handle: ObjectHandle) -> bool {
        let arena = self.arena.read();
        Self::entry(&arena, handle).is_some()
    }

    pub fn path_of(&self, handle: ObjectHandle) -> Option<SoftObjectPath> {
        let arena = self.arena.read();
        Self::entry(&arena, handle).map(|e| e.path.clone())
    }

    pub fn class_of(&self, handle: ObjectHandle) -> Option<String> {
        let arena = self.arena.read();
        Self::entry(&arena, handle).map(|e| e.class.clone())
    }

    /// Resolves a soft path to the object currently registered at it.
    pub fn resolve(&self, path: &SoftObjectPath) -> Option<ObjectHandle> {
        if path.is_null() {
            return None;
        }
        let arena = self.arena.read();
        let index = *arena.by_path.get(path)?;
        let slot = arena.slots.get(index as usize)?;
        slot.entry.as_ref().map(|_| ObjectHandle {
            index,
            generation: slot.generation,
        })
    }

    /// Marks an object as unreferenced; it is freed by the next collection.
    pub fn release(&self, handle: ObjectHandle) {
        let mut arena = self.arena.write();
        if let Some(slot) = arena.slots.get_mut(handle.index as usize) {
            if slot.generation == handle.generation {
                if let Some(entry) = slot.entry.as_mut() {
                    entry.released = true;
                }
            }
        }
    }

    /// Frees every released object. Returns how many were collected.
    pub fn collect_garbage(&self) -> usize {
        let mut arena = self.arena.write();
        let released: Vec<u32> = arena
            .slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.entry.as_ref().is_some_and(|e| e.released))
            .map(|(i, _)| i as u32)
            .collect();
        for index in &released {
            Self::free_slot(&mut arena, *index);
        }
        if !released.is_empty() {
            tracing::debug!(collected = released.len(), "object registry collected garbage");
        }
        released.len()
    }

    pub fn len(&self) -> usize {
        self.arena.read().by_path.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn entry(arena: &Arena, handle: ObjectHandle) -> Option<&ObjectEntry> {
        let slot = arena.slots.get(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.entry.as_ref()
    }

    fn free_slot(arena: &mut Arena, index: u32) {
        let Some(slot) = arena.slots.get_mut(index as usize) else {
            return;
        };
        if let Some(entry) = slot.entry.take() {
            slot.generation = slot.generation.wrapping_add(1);
            arena.by_path.remove(&entry.path);
            arena.free.push(index);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collected_handle_goes_stale_but_path_survives() {
        let registry = ObjectRegistry::new();
        let door = registry.spawn("/Game/Level.Door", "Door");
        let path = registry.path_of(door).unwrap_or_default();
        assert_eq!(path.as_str(), "/Game/Level.Door");

        registry.release(door);
        assert!(registry.is_alive(door));
        assert_eq!(registry.collect_garbage(), 1);
        assert!(!registry.is_alive(door));
        assert_eq!(registry.resolve(&path), None);

        let reloaded = registry.spawn("/Game/Level.Door", "Door");
        assert_ne!(reloaded, door);
        assert_eq!(registry.resolve(&path), Some(reloaded));
    }

    #[test]
    fn test_spawn_replaces_object_at_same_path() {
        let registry = ObjectRegistry::new();
        let first = registry.spawn("/A", "Thing");
        let second = registry.spawn("/A", "Thing");
        assert!(!registry.is_alive(first));
        assert!(registry.is_alive(second));
        assert_eq!(registry.len(), 1);
    }
}
