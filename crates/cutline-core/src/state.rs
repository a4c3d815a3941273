//! Application state store.
//!
//! Holds the most recent state handed in by the application as encoded
//! bytes. Every update and every capture goes through CBOR, so the stored
//! copy never aliases a live application value.
//!
//! The store has its own lock. The node may take it while holding its
//! node-wide lock (capture during marker handling); the reverse order never
//! happens.

use std::sync::{Mutex, PoisonError};

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::codec;
use crate::error::Result;

/// Thread-safe holder of the current application state.
#[derive(Debug, Default)]
pub struct StateStore {
    current: Mutex<Option<Bytes>>,
}

impl StateStore {
    /// Create an empty store. Captures return `None` until the first update.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the current state with a deep copy of `state`.
    ///
    /// Encoding happens before the lock is taken; the critical section is a
    /// pointer swap.
    pub fn update<S: Serialize>(&self, state: &S) -> Result<()> {
        let encoded = codec::encode(state)?;
        *self.current.lock().unwrap_or_else(PoisonError::into_inner) = Some(encoded);
        Ok(())
    }

    /// Apply `f` to the current state (or `S::default()` if none was
    /// stored yet) and store the result.
    ///
    /// Decode, change and encode all happen under the store lock, so
    /// concurrent modifications never lose an update.
    pub fn modify<S, F>(&self, f: F) -> Result<()>
    where
        S: Serialize + DeserializeOwned + Default,
        F: FnOnce(&mut S),
    {
        let mut current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        let mut state = match current.as_ref() {
            Some(bytes) => codec::decode(bytes)?,
            None => S::default(),
        };
        f(&mut state);
        *current = Some(codec::encode(&state)?);
        Ok(())
    }

    /// The encoded state current at the instant of the call.
    ///
    /// The returned bytes are immutable; later updates swap in a new buffer
    /// and never touch this one.
    pub fn capture_current(&self) -> Option<Bytes> {
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Put back previously captured bytes, or clear the store with `None`.
    pub fn restore(&self, captured: Option<Bytes>) {
        *self.current.lock().unwrap_or_else(PoisonError::into_inner) = captured;
    }

    /// Capture and decode into a fresh, independent value.
    pub fn capture_as<S: DeserializeOwned>(&self) -> Result<Option<S>> {
        self.capture_current()
            .map(|bytes| codec::decode(&bytes))
            .transpose()
    }

    /// Whether any state has been stored yet.
    pub fn is_empty(&self) -> bool {
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Tank {
        level: u32,
        log: Vec<String>,
    }

    #[test]
    fn test_empty_store_captures_none() {
        let store = StateStore::new();
        assert!(store.is_empty());
        assert!(store.capture_current().is_none());
        assert_eq!(store.capture_as::<Tank>().unwrap(), None);
    }

    #[test]
    fn test_mutating_live_state_does_not_touch_capture() {
        let store = StateStore::new();
        let mut live = Tank {
            level: 10,
            log: vec!["filled".into()],
        };
        store.update(&live).unwrap();

        live.level = 0;
        live.log.push("drained".into());

        let captured: Tank = store.capture_as().unwrap().unwrap();
        assert_eq!(captured.level, 10);
        assert_eq!(captured.log, vec!["filled".to_string()]);
    }

    #[test]
    fn test_mutating_capture_does_not_touch_store() {
        let store = StateStore::new();
        store
            .update(&Tank {
                level: 5,
                log: vec![],
            })
            .unwrap();

        let mut first: Tank = store.capture_as().unwrap().unwrap();
        first.level = 99;

        let second: Tank = store.capture_as().unwrap().unwrap();
        assert_eq!(second.level, 5);
    }

    #[test]
    fn test_modify_starts_from_default() {
        let store = StateStore::new();
        store.modify(|n: &mut u64| *n += 3).unwrap();
        store.modify(|n: &mut u64| *n *= 2).unwrap();
        assert_eq!(store.capture_as::<u64>().unwrap(), Some(6));
    }

    #[test]
    fn test_concurrent_modify_keeps_every_change() {
        let store = std::sync::Arc::new(StateStore::new());
        let workers: Vec<_> = (0..4)
            .map(|_| {
                let store = std::sync::Arc::clone(&store);
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        store.modify(|n: &mut u64| *n += 1).unwrap();
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }
        assert_eq!(store.capture_as::<u64>().unwrap(), Some(400));
    }

    #[test]
    fn test_earlier_capture_survives_update() {
        let store = StateStore::new();
        store.update(&1u32).unwrap();
        let before = store.capture_current().unwrap();
        store.update(&2u32).unwrap();

        assert_eq!(codec::decode::<u32>(&before).unwrap(), 1);
        assert_eq!(store.capture_as::<u32>().unwrap(), Some(2));
    }

    #[test]
    fn test_restore_puts_back_a_capture() {
        let store = StateStore::new();
        store.update(&1u32).unwrap();
        let captured = store.capture_current();
        store.update(&2u32).unwrap();

        store.restore(captured);
        assert_eq!(store.capture_as::<u32>().unwrap(), Some(1));

        store.restore(None);
        assert!(store.is_empty());
    }
}
