//! Per-name serialization of provisioning work.
//!
//! [`KeyedLocks`] hands out one async mutex per volume name. Callers working
//! on the same name queue behind the outstanding holder; callers on other
//! names never wait on each other. An entry lives only while someone holds
//! or waits for it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::OwnedMutexGuard;

type Slot = Arc<tokio::sync::Mutex<()>>;

#[derive(Debug, Default)]
pub struct KeyedLocks {
    slots: Mutex<HashMap<String, Slot>>,
}

/// Exclusive hold on one key. Dropping it releases the key.
#[derive(Debug)]
pub struct KeyGuard<'a> {
    key: String,
    guard: Option<OwnedMutexGuard<()>>,
    locks: &'a KeyedLocks,
}

impl KeyGuard<'_> {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for KeyGuard<'_> {
    fn drop(&mut self) {
        // Release before inspecting the count so a waiter's clone is the only
        // thing that can keep the slot alive.
        self.guard.take();
        self.locks.reclaim(&self.key);
    }
}

/// A queued [`KeyedLocks::lock`] call. Dropping it before the lock is granted
/// gives up the waiter's share of the slot.
struct Waiter<'a> {
    key: &'a str,
    slot: Option<Slot>,
    locks: &'a KeyedLocks,
}

impl Drop for Waiter<'_> {
    fn drop(&mut self) {
        self.slot.take();
        self.locks.reclaim(self.key);
    }
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<String, Slot>> {
        // The map is only touched in short non-panicking sections.
        self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Wait for exclusive access to `key`.
    pub async fn lock(&self, key: &str) -> KeyGuard<'_> {
        let slot = {
            let mut slots = self.slots();
            slots
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };

        let waiter = Waiter {
            key,
            slot: Some(slot.clone()),
            locks: self,
        };
        let guard = slot.lock_owned().await;
        drop(waiter);
        KeyGuard {
            key: key.to_string(),
            guard: Some(guard),
            locks: self,
        }
    }

    /// Take `key` only if nobody holds it.
    pub fn try_lock(&self, key: &str) -> Option<KeyGuard<'_>> {
        let slot = {
            let mut slots = self.slots();
            slots
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };

        match slot.try_lock_owned() {
            Ok(guard) => Some(KeyGuard {
                key: key.to_string(),
                guard: Some(guard),
                locks: self,
            }),
            Err(_) => {
                self.reclaim(key);
                None
            }
        }
    }

    /// Remove `key` once the map holds the only reference to its slot.
    fn reclaim(&self, key: &str) {
        let mut slots = self.slots();
        if let Some(slot) = slots.get(key)
            && Arc::strong_count(slot) == 1
        {
            slots.remove(key);
        }
    }

    /// Number of keys currently held or awaited.
    pub fn active_keys(&self) -> usize {
        self.slots().len()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn test_same_key_is_exclusive() {
        let locks = KeyedLocks::new();
        let guard = locks.lock("vol-a").await;
        assert_eq!(guard.key(), "vol-a");
        assert!(locks.try_lock("vol-a").is_none());
        drop(guard);
        assert!(locks.try_lock("vol-a").is_some());
    }

    #[tokio::test]
    async fn test_other_keys_proceed() {
        let locks = KeyedLocks::new();
        let _a = locks.lock("vol-a").await;
        let b = locks.try_lock("vol-b");
        assert!(b.is_some());
        assert_eq!(locks.active_keys(), 2);
    }

    #[tokio::test]
    async fn test_slots_are_reclaimed() {
        let locks = KeyedLocks::new();
        {
            let _a = locks.lock("vol-a").await;
            let _b = locks.lock("vol-b").await;
            assert_eq!(locks.active_keys(), 2);
        }
        assert_eq!(locks.active_keys(), 0);

        let held = locks.lock("vol-a").await;
        assert!(locks.try_lock("vol-a").is_none());
        assert_eq!(locks.active_keys(), 1);
        drop(held);
        assert_eq!(locks.active_keys(), 0);
    }

    #[tokio::test]
    async fn test_waiters_are_serialized() {
        let locks = Arc::new(KeyedLocks::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let max_inside = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..10 {
            let locks = locks.clone();
            let inside = inside.clone();
            let max_inside = max_inside.clone();
            handles.push(tokio::spawn(async move {
                let _guard = locks.lock("vol-a").await;
                let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                max_inside.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(2)).await;
                inside.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(max_inside.load(Ordering::SeqCst), 1);
        assert_eq!(locks.active_keys(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_waiter_releases_slot() {
        let locks = Arc::new(KeyedLocks::new());
        let held = locks.lock("vol-a").await;

        let waiter = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _guard = locks.lock("vol-a").await;
            })
        };
        tokio::task::yield_now().await;
        assert_eq!(locks.active_keys(), 1);

        // Handed the lock but never polled again
        drop(held);
        waiter.abort();
        assert!(waiter.await.unwrap_err().is_cancelled());
        assert_eq!(locks.active_keys(), 0);
    }
}
