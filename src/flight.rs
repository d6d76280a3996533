//! Single-flight: coalesce concurrent computations of the same key.
//!
//! The first caller for a key becomes the leader and runs the closure; every
//! caller that arrives while it runs blocks on a condition variable and
//! receives a clone of the leader's value. The key is released as soon as the
//! leader finishes, so a later call starts a fresh computation.
//!
//! The registry is a plain `Mutex<HashMap>`; it is held only to look up or
//! insert a slot, never during the computation itself.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

/// How a caller obtained its value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Flight<V> {
    /// This caller ran the computation.
    Led(V),
    /// Another caller ran it; this is a clone of its value.
    Joined(V),
    /// The leader unwound without producing a value.
    Abandoned,
}

enum State<V> {
    Pending,
    Done(V),
    Abandoned,
}

struct Call<V> {
    state: Mutex<State<V>>,
    done: Condvar,
}

impl<V: Clone> Call<V> {
    fn new() -> Self {
        Self {
            state: Mutex::new(State::Pending),
            done: Condvar::new(),
        }
    }

    fn settle(&self, outcome: State<V>) {
        *lock(&self.state) = outcome;
        self.done.notify_all();
    }

    fn wait(&self) -> Flight<V> {
        let mut state = lock(&self.state);
        loop {
            match &*state {
                State::Pending => {
                    state = self
                        .done
                        .wait(state)
                        .unwrap_or_else(PoisonError::into_inner);
                }
                State::Done(v) => return Flight::Joined(v.clone()),
                State::Abandoned => return Flight::Abandoned,
            }
        }
    }
}

/// Keyed single-flight registry.
pub struct FlightGroup<K, V> {
    calls: Mutex<HashMap<K, Arc<Call<V>>>>,
}

impl<K, V> Default for FlightGroup<K, V> {
    fn default() -> Self {
        Self {
            calls: Mutex::new(HashMap::new()),
        }
    }
}

impl<K: Eq + Hash + Clone, V: Clone> FlightGroup<K, V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `compute` for `key`, or wait for the run already in progress.
    ///
    /// A panic in `compute` propagates to the leader; its followers receive
    /// [`Flight::Abandoned`] and the key is released.
    pub fn run<F>(&self, key: &K, compute: F) -> Flight<V>
    where
        F: FnOnce() -> V,
    {
        let call = {
            let mut calls = lock(&self.calls);
            if let Some(existing) = calls.get(key) {
                let existing = Arc::clone(existing);
                drop(calls);
                return existing.wait();
            }
            let call = Arc::new(Call::new());
            calls.insert(key.clone(), Arc::clone(&call));
            call
        };

        let mut lead = Lead {
            group: self,
            key,
            call,
            settled: false,
        };
        let value = compute();
        lead.call.settle(State::Done(value.clone()));
        lead.settled = true;
        Flight::Led(value)
    }

    /// Number of keys currently being computed.
    pub fn in_flight(&self) -> usize {
        lock(&self.calls).len()
    }
}

/// Releases the leader's key on every exit path, including unwinding.
struct Lead<'a, K: Eq + Hash, V> {
    group: &'a FlightGroup<K, V>,
    key: &'a K,
    call: Arc<Call<V>>,
    settled: bool,
}

impl<K: Eq + Hash, V> Drop for Lead<'_, K, V> {
    fn drop(&mut self) {
        if !self.settled {
            *lock(&self.call.state) = State::Abandoned;
            self.call.done.notify_all();
        }
        let mut calls = lock(&self.group.calls);
        if calls
            .get(self.key)
            .is_some_and(|current| Arc::ptr_eq(current, &self.call))
        {
            calls.remove(self.key);
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn single_caller_leads() {
        let group: FlightGroup<u32, String> = FlightGroup::new();
        assert_eq!(group.run(&1, || "a".to_string()), Flight::Led("a".into()));
        assert_eq!(group.in_flight(), 0);
    }

    #[test]
    fn sequential_calls_recompute() {
        let group: FlightGroup<u32, usize> = FlightGroup::new();
        let runs = AtomicUsize::new(0);
        for _ in 0..3 {
            group.run(&7, || runs.fetch_add(1, Ordering::SeqCst));
        }
        assert_eq!(runs.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn concurrent_callers_share_one_computation() {
        const N: usize = 16;
        let group: Arc<FlightGroup<(String, u32), u64>> = Arc::new(FlightGroup::new());
        let runs = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(N));

        let handles: Vec<_> = (0..N)
            .map(|_| {
                let group = Arc::clone(&group);
                let runs = Arc::clone(&runs);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    group.run(&("xy987".to_string(), 1200), || {
                        runs.fetch_add(1, Ordering::SeqCst);
                        thread::sleep(Duration::from_millis(200));
                        42
                    })
                })
            })
            .collect();
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(runs.load(Ordering::SeqCst), 1);
        let leaders = results.iter().filter(|f| matches!(f, Flight::Led(_))).count();
        assert_eq!(leaders, 1);
        assert!(
            results
                .iter()
                .all(|f| matches!(f, Flight::Led(42) | Flight::Joined(42)))
        );
        assert_eq!(group.in_flight(), 0);
    }

    #[test]
    fn distinct_keys_do_not_block_each_other() {
        let group: Arc<FlightGroup<u32, u32>> = Arc::new(FlightGroup::new());
        let barrier = Arc::new(Barrier::new(2));
        let handles: Vec<_> = [800, 1600]
            .into_iter()
            .map(|width| {
                let group = Arc::clone(&group);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    group.run(&width, || {
                        // Both leaders must be inside their closures at once
                        barrier.wait();
                        width
                    })
                })
            })
            .collect();
        for h in handles {
            assert!(matches!(h.join().unwrap(), Flight::Led(_)));
        }
    }

    #[test]
    fn errors_are_shared_like_values() {
        let group: FlightGroup<u32, Result<u32, String>> = FlightGroup::new();
        let out = group.run(&1, || Err("decode failed".to_string()));
        assert_eq!(out, Flight::Led(Err("decode failed".into())));
        // Not remembered: next call runs again
        assert_eq!(group.run(&1, || Ok(5)), Flight::Led(Ok(5)));
    }

    #[test]
    fn leader_panic_releases_followers_and_key() {
        let group: Arc<FlightGroup<u32, u32>> = Arc::new(FlightGroup::new());
        let entered = Arc::new(Barrier::new(2));

        let leader = {
            let group = Arc::clone(&group);
            let entered = Arc::clone(&entered);
            thread::spawn(move || {
                group.run(&9, || {
                    entered.wait();
                    thread::sleep(Duration::from_millis(100));
                    panic!("worker died");
                })
            })
        };
        entered.wait();
        let follower = {
            let group = Arc::clone(&group);
            thread::spawn(move || group.run(&9, || 1))
        };

        assert!(leader.join().is_err());
        // Either joined the doomed call or arrived after release and led
        assert!(matches!(
            follower.join().unwrap(),
            Flight::Abandoned | Flight::Led(1)
        ));
        assert_eq!(group.in_flight(), 0);
        assert_eq!(group.run(&9, || 2), Flight::Led(2));
    }
}
