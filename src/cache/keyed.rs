//! Per-key single-flight slots.
//!
//! [`KeyedSlots`] maps each key to its own [`OnceCell`] in a [`DashMap`].  A
//! shard lock is held only long enough to find or insert a key's cell; the
//! (slow) construction runs on the cell itself, so concurrent callers for the
//! same key wait on one builder while callers for other keys proceed
//! independently.
//!
//! A failed or cancelled construction removes its empty cell from the map.
//! The next caller for that key inserts a fresh cell and runs its own
//! initialiser, so a failure is never cached and never left behind.

use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::OnceCell;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Outcome of [`KeyedSlots::get_or_try_init`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lookup {
    /// The value already existed (or another caller built it while we waited).
    Hit,
    /// This caller ran the initialiser.
    Built,
}

pub struct KeyedSlots<K, V> {
    slots: DashMap<K, Arc<OnceCell<V>>>,
}

impl<K: Eq + Hash, V> Default for KeyedSlots<K, V> {
    fn default() -> Self {
        Self {
            slots: DashMap::new(),
        }
    }
}

enum Attempt<E> {
    Failed(E),
    /// The cell was detached from the map before this caller got to it.
    Detached,
}

/// Drops `cell` from the map unless disarmed.  Armed for the whole
/// initialiser, so an error or a dropped future both clean up.
struct EmptyCellGuard<'a, K: Eq + Hash, V> {
    slots: &'a DashMap<K, Arc<OnceCell<V>>>,
    key: &'a K,
    cell: Arc<OnceCell<V>>,
    armed: bool,
}

impl<K: Eq + Hash, V> EmptyCellGuard<'_, K, V> {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl<K: Eq + Hash, V> Drop for EmptyCellGuard<'_, K, V> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        self.slots.remove_if(self.key, |_, current| {
            Arc::ptr_eq(current, &self.cell) && !current.initialized()
        });
    }
}

impl<K, V> KeyedSlots<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new() -> Self {
        Self::default()
    }

    fn is_attached(&self, key: &K, cell: &Arc<OnceCell<V>>) -> bool {
        self.slots
            .get(key)
            .is_some_and(|current| Arc::ptr_eq(current.value(), cell))
    }

    /// Return the value for `key`, building it with `init` if absent.
    ///
    /// At most one `init` runs at a time per key.  Waiters observe the value
    /// produced by the winning initialiser.
    pub async fn get_or_try_init<F, Fut, E>(&self, key: &K, init: F) -> Result<(V, Lookup), E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        let mut init = Some(init);
        loop {
            let cell = Arc::clone(self.slots.entry(key.clone()).or_default().value());
            if let Some(value) = cell.get() {
                return Ok((value.clone(), Lookup::Hit));
            }

            let mut lookup = Lookup::Hit;
            let outcome = {
                let init = &mut init;
                let lookup = &mut lookup;
                let owned = Arc::clone(&cell);
                cell.get_or_try_init(|| async move {
                    // A waiter on a cell whose builder failed must not build
                    // into the detached cell.
                    if !self.is_attached(key, &owned) {
                        return Err(Attempt::Detached);
                    }
                    let Some(init) = init.take() else {
                        return Err(Attempt::Detached);
                    };
                    *lookup = Lookup::Built;
                    let mut guard = EmptyCellGuard {
                        slots: &self.slots,
                        key,
                        cell: owned,
                        armed: true,
                    };
                    let built: Result<V, E> = init().await;
                    // The cell is filled only after this future returns.
                    if built.is_ok() {
                        guard.disarm();
                    }
                    built.map_err(Attempt::Failed)
                })
                .await
                .cloned()
            };

            match outcome {
                Ok(value) => return Ok((value, lookup)),
                Err(Attempt::Failed(err)) => return Err(err),
                Err(Attempt::Detached) => continue,
            }
        }
    }

    /// Return the value for `key` if it has been fully built.
    pub fn get(&self, key: &K) -> Option<V> {
        self.slots
            .get(key)
            .and_then(|cell| cell.value().get().cloned())
    }

    /// Detach `key` from the map, returning its value if one had been built.
    ///
    /// A construction still in flight for `key` completes into the detached
    /// cell; its caller receives the value but it is no longer cached.
    pub fn remove(&self, key: &K) -> Option<V> {
        self.slots
            .remove(key)
            .and_then(|(_, cell)| cell.get().cloned())
    }

    /// Number of keys with a fully built value.
    pub fn len(&self) -> usize {
        self.slots
            .iter()
            .filter(|entry| entry.value().initialized())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn builds_once_and_then_hits() {
        let slots: KeyedSlots<u32, Arc<String>> = KeyedSlots::new();

        let (first, lookup) = slots
            .get_or_try_init(&1, || async { Ok::<_, ()>(Arc::new("one".to_string())) })
            .await
            .unwrap();
        assert_eq!(lookup, Lookup::Built);

        let (second, lookup) = slots
            .get_or_try_init(&1, || async { Ok::<_, ()>(Arc::new("other".to_string())) })
            .await
            .unwrap();
        assert_eq!(lookup, Lookup::Hit);
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn failure_is_not_cached() {
        let slots: KeyedSlots<&'static str, u32> = KeyedSlots::new();

        let err = slots
            .get_or_try_init(&"k", || async { Err::<u32, _>("boom") })
            .await
            .unwrap_err();
        assert_eq!(err, "boom");
        assert!(slots.get(&"k").is_none());
        assert!(slots.is_empty());
        assert_eq!(slots.slots.len(), 0, "failed cell must leave the map");

        let (value, lookup) = slots
            .get_or_try_init(&"k", || async { Ok::<_, &str>(7) })
            .await
            .unwrap();
        assert_eq!((value, lookup), (7, Lookup::Built));
    }

    #[tokio::test]
    async fn repeated_failures_do_not_grow_the_map() {
        let slots: KeyedSlots<String, u32> = KeyedSlots::new();
        for i in 0..100 {
            let key = format!("https://github.com/acme/missing-{i}");
            assert!(slots
                .get_or_try_init(&key, || async { Err::<u32, _>("clone failed") })
                .await
                .is_err());
        }
        assert_eq!(slots.slots.len(), 0);
    }

    #[tokio::test]
    async fn cancelled_init_leaves_no_cell() {
        let slots: KeyedSlots<u32, u32> = KeyedSlots::new();
        let stuck = slots.get_or_try_init(&3, std::future::pending::<Result<u32, ()>>);
        assert!(tokio::time::timeout(Duration::from_millis(20), stuck)
            .await
            .is_err());
        assert_eq!(slots.slots.len(), 0);

        let (value, lookup) = slots
            .get_or_try_init(&3, || async { Ok::<_, ()>(30) })
            .await
            .unwrap();
        assert_eq!((value, lookup), (30, Lookup::Built));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn waiters_retry_after_the_builder_fails() {
        let slots = Arc::new(KeyedSlots::<u32, u32>::new());

        let failing = {
            let slots = Arc::clone(&slots);
            tokio::spawn(async move {
                slots
                    .get_or_try_init(&8, || async {
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Err::<u32, _>("first builder failed")
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let (value, lookup) = slots
            .get_or_try_init(&8, || async { Ok::<_, &str>(80) })
            .await
            .unwrap();
        assert_eq!((value, lookup), (80, Lookup::Built));
        assert!(failing.await.unwrap().is_err());
        assert_eq!(slots.get(&8), Some(80));
        assert_eq!(slots.slots.len(), 1);
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let slots: KeyedSlots<u32, u32> = KeyedSlots::new();
        assert_eq!(slots.remove(&9), None);

        slots
            .get_or_try_init(&9, || async { Ok::<_, ()>(90) })
            .await
            .unwrap();
        assert_eq!(slots.remove(&9), Some(90));
        assert_eq!(slots.remove(&9), None);
        assert_eq!(slots.len(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_same_key_builds_once() {
        let slots = Arc::new(KeyedSlots::<u32, usize>::new());
        let builds = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let slots = Arc::clone(&slots);
            let builds = Arc::clone(&builds);
            handles.push(tokio::spawn(async move {
                slots
                    .get_or_try_init(&5, || async {
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok::<_, ()>(builds.fetch_add(1, Ordering::SeqCst))
                    })
                    .await
                    .unwrap()
                    .0
            }));
        }

        for handle in handles {
            assert_eq!(handle.await.unwrap(), 0);
        }
        assert_eq!(builds.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn different_keys_do_not_wait_on_each_other() {
        let slots = Arc::new(KeyedSlots::<u32, u32>::new());

        let slow = {
            let slots = Arc::clone(&slots);
            tokio::spawn(async move {
                slots
                    .get_or_try_init(&1, || async {
                        tokio::time::sleep(Duration::from_secs(5)).await;
                        Ok::<_, ()>(1)
                    })
                    .await
            })
        };

        // Give the slow builder time to take its cell.
        tokio::time::sleep(Duration::from_millis(20)).await;

        let fast = tokio::time::timeout(
            Duration::from_secs(1),
            slots.get_or_try_init(&2, || async { Ok::<_, ()>(2) }),
        )
        .await
        .expect("key 2 must not wait for key 1")
        .unwrap();
        assert_eq!(fast.0, 2);

        slow.abort();
    }
}
