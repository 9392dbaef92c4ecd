//! Bidirectional map between user thread ids and native thread handles.

use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::thread::ThreadId;

use thiserror::Error;

/// Errors from registry insertion.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum RegistryError {
    #[error("thread id {thread_id} is already in use")]
    DuplicateUserId { thread_id: usize },

    #[error("native thread handle is already registered")]
    DuplicateNative,
}

/// Per-subscription state. Lives from subscribe to unsubscribe.
#[derive(Debug, Clone, Copy)]
pub struct ThreadState {
    /// User-assigned thread id.
    pub thread_id: usize,
    /// Process-unique value published in the active-runner slot.
    pub token: u64,
    /// Whether the thread is parked at a control point.
    pub in_control_point: bool,
}

/// Native-handle → state and user-id → native-handle, kept in lockstep.
///
/// The user-id side is a `BTreeMap` so decisions can reason about "ids
/// strictly greater than x" over an ordered view.
#[derive(Debug, Default)]
pub struct ThreadRegistry {
    by_native: HashMap<ThreadId, ThreadState>,
    by_id: BTreeMap<usize, ThreadId>,
}

impl ThreadRegistry {
    pub fn new() -> ThreadRegistry {
        ThreadRegistry::default()
    }

    pub fn len(&self) -> usize {
        debug_assert_eq!(self.by_native.len(), self.by_id.len());
        self.by_native.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_native.is_empty()
    }

    /// Register a subscription under both keys.
    pub fn insert(&mut self, native: ThreadId, state: ThreadState) -> Result<(), RegistryError> {
        if self.by_native.contains_key(&native) {
            return Err(RegistryError::DuplicateNative);
        }
        if self.by_id.contains_key(&state.thread_id) {
            return Err(RegistryError::DuplicateUserId {
                thread_id: state.thread_id,
            });
        }

        self.by_id.insert(state.thread_id, native);
        self.by_native.insert(native, state);
        Ok(())
    }

    /// Remove a subscription. `None` when the handle is not registered.
    pub fn remove(&mut self, native: ThreadId) -> Option<ThreadState> {
        let state = self.by_native.remove(&native)?;
        self.by_id.remove(&state.thread_id);
        Some(state)
    }

    pub fn get(&self, native: ThreadId) -> Option<&ThreadState> {
        self.by_native.get(&native)
    }

    pub fn get_mut(&mut self, native: ThreadId) -> Option<&mut ThreadState> {
        self.by_native.get_mut(&native)
    }

    pub fn native_for(&self, thread_id: usize) -> Option<ThreadId> {
        self.by_id.get(&thread_id).copied()
    }

    pub fn contains_id(&self, thread_id: usize) -> bool {
        self.by_id.contains_key(&thread_id)
    }

    /// Subscribed user ids in ascending order.
    pub fn user_ids(&self) -> impl Iterator<Item = usize> + '_ {
        self.by_id.keys().copied()
    }

    /// Smallest subscribed user id.
    pub fn first_id(&self) -> Option<usize> {
        self.user_ids().next()
    }

    /// Smallest subscribed user id at or above `thread_id`.
    pub fn first_id_at_or_above(&self, thread_id: usize) -> Option<usize> {
        self.by_id.range(thread_id..).next().map(|(id, _)| *id)
    }

    /// Count of subscribed ids strictly greater than `thread_id`.
    pub fn count_higher(&self, thread_id: usize) -> usize {
        self.by_id
            .range((Bound::Excluded(thread_id), Bound::Unbounded))
            .count()
    }

    /// Whether any subscribed thread is still executing user code.
    pub fn any_running(&self) -> bool {
        self.by_native.values().any(|state| !state.in_control_point)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Harvest distinct native handles without keeping threads around.
    fn native_handles(n: usize) -> Vec<ThreadId> {
        (0..n)
            .map(|_| {
                let handle = std::thread::spawn(|| {});
                let id = handle.thread().id();
                handle.join().unwrap();
                id
            })
            .collect()
    }

    fn state(thread_id: usize, token: u64) -> ThreadState {
        ThreadState {
            thread_id,
            token,
            in_control_point: false,
        }
    }

    #[test]
    fn insert_and_lookup_both_directions() {
        let natives = native_handles(2);
        let mut registry = ThreadRegistry::new();
        registry.insert(natives[0], state(5, 1)).unwrap();
        registry.insert(natives[1], state(2, 2)).unwrap();

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.get(natives[0]).unwrap().thread_id, 5);
        assert_eq!(registry.native_for(2), Some(natives[1]));
        assert_eq!(registry.native_for(9), None);
    }

    #[test]
    fn rejects_duplicate_keys() {
        let natives = native_handles(2);
        let mut registry = ThreadRegistry::new();
        registry.insert(natives[0], state(1, 1)).unwrap();

        assert_eq!(
            registry.insert(natives[0], state(2, 2)),
            Err(RegistryError::DuplicateNative)
        );
        assert_eq!(
            registry.insert(natives[1], state(1, 3)),
            Err(RegistryError::DuplicateUserId { thread_id: 1 })
        );
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn remove_is_a_noop_when_absent() {
        let natives = native_handles(1);
        let mut registry = ThreadRegistry::new();
        assert!(registry.remove(natives[0]).is_none());

        registry.insert(natives[0], state(1, 1)).unwrap();
        assert_eq!(registry.remove(natives[0]).unwrap().thread_id, 1);
        assert!(registry.remove(natives[0]).is_none());
        assert!(registry.is_empty());
        assert!(!registry.contains_id(1));
    }

    #[test]
    fn user_ids_are_ascending() {
        let natives = native_handles(3);
        let mut registry = ThreadRegistry::new();
        registry.insert(natives[0], state(30, 1)).unwrap();
        registry.insert(natives[1], state(10, 2)).unwrap();
        registry.insert(natives[2], state(20, 3)).unwrap();

        let ids: Vec<usize> = registry.user_ids().collect();
        assert_eq!(ids, vec![10, 20, 30]);
        assert_eq!(registry.first_id(), Some(10));
    }

    #[test]
    fn ordered_queries() {
        let natives = native_handles(3);
        let mut registry = ThreadRegistry::new();
        for (native, id) in natives.iter().zip([1usize, 3, 7]) {
            registry.insert(*native, state(id, id as u64)).unwrap();
        }

        assert_eq!(registry.count_higher(0), 3);
        assert_eq!(registry.count_higher(1), 2);
        assert_eq!(registry.count_higher(3), 1);
        assert_eq!(registry.count_higher(7), 0);

        assert_eq!(registry.first_id_at_or_above(2), Some(3));
        assert_eq!(registry.first_id_at_or_above(3), Some(3));
        assert_eq!(registry.first_id_at_or_above(8), None);
    }

    #[test]
    fn any_running_tracks_park_state() {
        let natives = native_handles(2);
        let mut registry = ThreadRegistry::new();
        registry.insert(natives[0], state(1, 1)).unwrap();
        registry.insert(natives[1], state(2, 2)).unwrap();
        assert!(registry.any_running());

        registry.get_mut(natives[0]).unwrap().in_control_point = true;
        assert!(registry.any_running());

        registry.get_mut(natives[1]).unwrap().in_control_point = true;
        assert!(!registry.any_running());
    }
}
