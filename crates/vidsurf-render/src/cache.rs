// SPDX-License-Identifier: CEPL-1.0
//! Fixed-capacity memo of imported external buffers.
//!
//! A slot is created the first time a buffer identity is seen and lives until
//! the decoder has reclaimed the buffer *and* no frame holds a sample of it.
//! Running out of slots is an error, never a reason to evict.
use std::{collections::HashMap, fmt};

use tracing::debug;

use crate::{
    error::{CacheError, RenderError},
    source::BufferId,
};

pub const CACHE_CAPACITY: usize = 64;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SlotId(usize);

impl SlotId {
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

struct Slot<V, S> {
    buffer: BufferId,
    resources: V,
    held: Option<S>,
    referenced_by_owner: bool,
}

/// `V` is whatever the backend derives from a buffer (GPU image, sampler,
/// pipeline...). `S` is the sample currently keeping the buffer on screen.
pub struct ImportCache<V, S> {
    slots: Vec<Option<Slot<V, S>>>,
    by_buffer: HashMap<BufferId, SlotId>,
    free: Vec<SlotId>,
}

impl<V, S> Default for ImportCache<V, S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V, S> ImportCache<V, S> {
    pub fn new() -> Self {
        Self::with_capacity(CACHE_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        ImportCache {
            slots: (0..capacity).map(|_| None).collect(),
            by_buffer: HashMap::with_capacity(capacity),
            // Popped from the back, so low slots go first.
            free: (0..capacity).rev().map(SlotId).collect(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn len(&self) -> usize {
        self.by_buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_buffer.is_empty()
    }

    pub fn lookup(&self, buffer: BufferId) -> Option<SlotId> {
        self.by_buffer.get(&buffer).copied()
    }

    pub fn resources(&self, slot: SlotId) -> Option<&V> {
        self.slot(slot).ok().map(|s| &s.resources)
    }

    pub fn is_held(&self, slot: SlotId) -> bool {
        self.slot(slot).is_ok_and(|s| s.held.is_some())
    }

    pub fn is_referenced(&self, slot: SlotId) -> bool {
        self.slot(slot).is_ok_and(|s| s.referenced_by_owner)
    }

    /// Returns the slot wrapping `buffer`, calling `create` to import it on a
    /// miss. `create` is not called when the cache is full.
    pub fn import_with(
        &mut self,
        buffer: BufferId,
        create: impl FnOnce() -> anyhow::Result<V>,
    ) -> Result<SlotId, RenderError> {
        if let Some(slot) = self.lookup(buffer) {
            if let Ok(entry) = self.slot_mut(slot) {
                if !entry.referenced_by_owner {
                    // Handed out again after a reclaim notice: it is live.
                    debug!(?buffer, %slot, "reclaimed buffer delivered again");
                    entry.referenced_by_owner = true;
                }
            }
            return Ok(slot);
        }

        let Some(&slot) = self.free.last() else {
            return Err(CacheError::Full {
                capacity: self.capacity(),
            }
            .into());
        };
        let resources = create()?;
        self.free.pop();
        self.slots[slot.0] = Some(Slot {
            buffer,
            resources,
            held: None,
            referenced_by_owner: true,
        });
        self.by_buffer.insert(buffer, slot);
        debug!(?buffer, %slot, live = self.len(), "imported");
        Ok(slot)
    }

    /// Pins the slot with the sample a frame is about to display.
    pub fn hold(&mut self, slot: SlotId, sample: S) -> Result<(), CacheError> {
        let entry = self.slot_mut(slot)?;
        if entry.held.is_some() {
            return Err(CacheError::AlreadyHeld(slot));
        }
        entry.held = Some(sample);
        Ok(())
    }

    /// Unpins the slot, returning the sample so the caller decides when it drops.
    pub fn release(&mut self, slot: SlotId) -> Option<S> {
        self.slot_mut(slot).ok().and_then(|s| s.held.take())
    }

    /// Records that the decoder let go of `buffer`. Unknown buffers are fine.
    pub fn mark_reclaimed(&mut self, buffer: BufferId) -> bool {
        let Some(slot) = self.lookup(buffer) else {
            return false;
        };
        match self.slot_mut(slot) {
            Ok(entry) => {
                entry.referenced_by_owner = false;
                debug!(?buffer, %slot, held = entry.held.is_some(), "reclaimed");
                true
            }
            Err(_) => false,
        }
    }

    /// Frees every slot that is both reclaimed and unheld. Never blocks.
    pub fn evict_dead(&mut self, mut destroy: impl FnMut(BufferId, V)) -> usize {
        let mut evicted = 0;
        for (index, entry) in self.slots.iter_mut().enumerate() {
            let dead = entry
                .as_ref()
                .is_some_and(|s| !s.referenced_by_owner && s.held.is_none());
            if !dead {
                continue;
            }
            if let Some(slot) = entry.take() {
                self.by_buffer.remove(&slot.buffer);
                self.free.push(SlotId(index));
                debug!(buffer = ?slot.buffer, slot = index, "evicted");
                destroy(slot.buffer, slot.resources);
                evicted += 1;
            }
        }
        evicted
    }

    /// Empties the cache regardless of state. Only for teardown, after the GPU is idle.
    pub fn drain(&mut self, mut destroy: impl FnMut(BufferId, V, Option<S>)) {
        for (index, entry) in self.slots.iter_mut().enumerate() {
            if let Some(slot) = entry.take() {
                self.free.push(SlotId(index));
                destroy(slot.buffer, slot.resources, slot.held);
            }
        }
        self.by_buffer.clear();
    }

    fn slot(&self, slot: SlotId) -> Result<&Slot<V, S>, CacheError> {
        self.slots
            .get(slot.0)
            .and_then(Option::as_ref)
            .ok_or(CacheError::Vacant(slot))
    }

    fn slot_mut(&mut self, slot: SlotId) -> Result<&mut Slot<V, S>, CacheError> {
        self.slots
            .get_mut(slot.0)
            .and_then(Option::as_mut)
            .ok_or(CacheError::Vacant(slot))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type Cache = ImportCache<u32, &'static str>;

    fn id(n: usize) -> BufferId {
        BufferId::new(0x1000 + n * 0x10)
    }

    #[test]
    fn import_is_idempotent_per_buffer() {
        let mut cache = Cache::new();
        let mut created = 0;
        let a = cache
            .import_with(id(1), || {
                created += 1;
                Ok(1)
            })
            .unwrap();
        let b = cache
            .import_with(id(1), || {
                created += 1;
                Ok(2)
            })
            .unwrap();
        assert_eq!(a, b);
        assert_eq!(created, 1);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.resources(a), Some(&1));
    }

    #[test]
    fn sixty_fifth_distinct_buffer_is_fatal() {
        let mut cache = Cache::new();
        for n in 0..CACHE_CAPACITY {
            cache.import_with(id(n), || Ok(n as u32)).unwrap();
        }
        assert_eq!(cache.len(), 64);

        let mut called = false;
        let err = cache
            .import_with(id(64), || {
                called = true;
                Ok(0)
            })
            .unwrap_err();
        assert!(matches!(
            err,
            RenderError::Cache(CacheError::Full { capacity: 64 })
        ));
        assert!(!called);
        // Known buffers still resolve.
        assert!(cache.import_with(id(3), || Ok(0)).is_ok());
    }

    #[test]
    fn failed_create_leaves_slot_free() {
        let mut cache = Cache::with_capacity(1);
        assert!(cache
            .import_with(id(0), || Err(anyhow::anyhow!("driver said no")))
            .is_err());
        assert!(cache.is_empty());
        assert!(cache.import_with(id(1), || Ok(7)).is_ok());
    }

    #[test]
    fn reclaimed_but_held_slot_survives_eviction() {
        let mut cache = Cache::new();
        let slot = cache.import_with(id(0), || Ok(0)).unwrap();
        cache.hold(slot, "on screen").unwrap();
        assert!(cache.mark_reclaimed(id(0)));

        let mut destroyed = Vec::new();
        assert_eq!(cache.evict_dead(|b, _| destroyed.push(b)), 0);
        assert!(destroyed.is_empty());

        assert_eq!(cache.release(slot), Some("on screen"));
        assert_eq!(cache.evict_dead(|b, _| destroyed.push(b)), 1);
        assert_eq!(destroyed, [id(0)]);
        assert_eq!(cache.lookup(id(0)), None);
    }

    #[test]
    fn unreclaimed_slot_is_kept_even_when_unheld() {
        let mut cache = Cache::new();
        cache.import_with(id(0), || Ok(0)).unwrap();
        assert_eq!(cache.evict_dead(|_, _| {}), 0);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn reclaiming_unknown_buffer_is_not_an_error() {
        let mut cache = Cache::new();
        assert!(!cache.mark_reclaimed(id(9)));
    }

    #[test]
    fn double_hold_is_rejected() {
        let mut cache = Cache::new();
        let slot = cache.import_with(id(0), || Ok(0)).unwrap();
        cache.hold(slot, "a").unwrap();
        assert_eq!(cache.hold(slot, "b"), Err(CacheError::AlreadyHeld(slot)));
    }

    #[test]
    fn redelivered_buffer_is_live_again() {
        let mut cache = Cache::new();
        let slot = cache.import_with(id(0), || Ok(0)).unwrap();
        cache.mark_reclaimed(id(0));
        assert!(!cache.is_referenced(slot));
        assert_eq!(cache.import_with(id(0), || Ok(1)).unwrap(), slot);
        assert!(cache.is_referenced(slot));
        assert_eq!(cache.evict_dead(|_, _| {}), 0);
    }

    #[test]
    fn evicted_slots_are_reused() {
        let mut cache = Cache::with_capacity(2);
        cache.import_with(id(0), || Ok(0)).unwrap();
        cache.import_with(id(1), || Ok(1)).unwrap();
        cache.mark_reclaimed(id(0));
        cache.evict_dead(|_, _| {});
        let slot = cache.import_with(id(2), || Ok(2)).unwrap();
        assert_eq!(slot.index(), 0);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn drain_hands_back_held_samples() {
        let mut cache = Cache::new();
        let a = cache.import_with(id(0), || Ok(0)).unwrap();
        cache.import_with(id(1), || Ok(1)).unwrap();
        cache.hold(a, "held").unwrap();

        let mut seen = Vec::new();
        cache.drain(|b, v, s| seen.push((b, v, s)));
        seen.sort_by_key(|(b, _, _)| *b);
        assert_eq!(seen, [(id(0), 0, Some("held")), (id(1), 1, None)]);
        assert!(cache.is_empty());
    }
}
