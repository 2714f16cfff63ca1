//! In-flight build coordination.
//!
//! At most one builder runs per name; concurrent callers for the same name
//! block on a rendezvous channel and receive the builder's artifact. The
//! builder publishes by looping non-blocking sends into the channel until
//! no receiver is ready, then removes the in-flight entry - all under the
//! queue mutex, so a caller can only enrol while the entry exists. A
//! waiter that enrolled but missed the broadcast observes the channel
//! disconnect and retries from the cache lookup, where it finds the
//! freshly installed artifact.

use std::sync::Arc;

use crossbeam::channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;

/// Outcome of asking the queue about `name`.
pub enum Claim<T> {
    /// The caller is the builder and must publish exactly once.
    Builder,
    /// Another thread built the artifact; here it is.
    Built(Arc<T>),
    /// The build completed between enrolment and receive; re-check the
    /// cache and claim again if still unsatisfied.
    Retry,
}

type Channels<T> = (Sender<Arc<T>>, Receiver<Arc<T>>);

/// Tracks the builds currently in flight, keyed by unit name.
pub struct BuildQueue<T> {
    inflight: Mutex<FxHashMap<String, Channels<T>>>,
}

impl<T> Default for BuildQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> BuildQueue<T> {
    pub fn new() -> Self {
        Self {
            inflight: Mutex::new(FxHashMap::default()),
        }
    }

    /// Claim the build for `name`, or wait for the in-flight one.
    pub fn claim(&self, name: &str) -> Claim<T> {
        let rx = {
            let mut inflight = self.inflight.lock();
            match inflight.get(name) {
                Some((_, rx)) => rx.clone(),
                None => {
                    // rendezvous channel: a send succeeds only while a
                    // receiver is blocked on it
                    inflight.insert(name.to_string(), bounded(0));
                    return Claim::Builder;
                }
            }
        };

        match rx.recv() {
            Ok(artifact) => Claim::Built(artifact),
            Err(_) => Claim::Retry,
        }
    }

    /// Publish the builder's artifact to every waiter and clear the
    /// in-flight entry. Must be called exactly once per `Claim::Builder`,
    /// after the artifact has been installed in the cache table.
    pub fn publish(&self, name: &str, artifact: &Arc<T>) {
        let mut inflight = self.inflight.lock();
        let Some((tx, _rx)) = inflight.remove(name) else {
            return;
        };

        // broadcast: serve every blocked waiter, then stop. Dropping the
        // sender afterwards disconnects any waiter that enrolled but has
        // not reached its receive yet; it will retry against the cache.
        while tx.try_send(artifact.clone()).is_ok() {}
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.inflight.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn test_single_claim_is_builder() {
        let q: BuildQueue<String> = BuildQueue::new();
        assert!(matches!(q.claim("a"), Claim::Builder));
        let v = Arc::new("built".to_string());
        q.publish("a", &v);
        assert_eq!(q.len(), 0);
    }

    #[test]
    fn test_waiters_receive_builders_artifact() {
        let q: Arc<BuildQueue<String>> = Arc::new(BuildQueue::new());
        assert!(matches!(q.claim("a"), Claim::Builder));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let q = q.clone();
            handles.push(std::thread::spawn(move || match q.claim("a") {
                Claim::Built(v) => Some(v),
                Claim::Retry => None,
                Claim::Builder => panic!("second builder for same name"),
            }));
        }

        // give the waiters time to block on the rendezvous channel
        std::thread::sleep(Duration::from_millis(100));
        let built = Arc::new("artifact".to_string());
        q.publish("a", &built);

        for h in handles {
            match h.join().unwrap() {
                Some(v) => assert!(Arc::ptr_eq(&v, &built)),
                // a waiter that missed the broadcast retries; the cache
                // table would satisfy it
                None => {}
            }
        }
        assert_eq!(q.len(), 0);
    }

    #[test]
    fn test_at_most_one_builder_under_contention() {
        let q: Arc<BuildQueue<usize>> = Arc::new(BuildQueue::new());
        let builders = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(std::sync::Barrier::new(16));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let q = q.clone();
            let builders = builders.clone();
            let barrier = barrier.clone();
            handles.push(std::thread::spawn(move || {
                barrier.wait();
                match q.claim("n") {
                    Claim::Builder => {
                        builders.fetch_add(1, Ordering::SeqCst);
                        // keep the build in flight long enough for every
                        // other thread to enrol as a waiter
                        std::thread::sleep(Duration::from_millis(300));
                        q.publish("n", &Arc::new(7));
                    }
                    Claim::Built(_) | Claim::Retry => {}
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(builders.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_distinct_names_build_independently() {
        let q: BuildQueue<u8> = BuildQueue::new();
        assert!(matches!(q.claim("a"), Claim::Builder));
        assert!(matches!(q.claim("b"), Claim::Builder));
        q.publish("a", &Arc::new(1));
        q.publish("b", &Arc::new(2));
        assert_eq!(q.len(), 0);
    }

    #[test]
    fn test_publish_without_waiters_draws_empty() {
        let q: BuildQueue<u8> = BuildQueue::new();
        assert!(matches!(q.claim("a"), Claim::Builder));
        // no waiter enrolled; the broadcast loop must terminate
        q.publish("a", &Arc::new(1));
        // the name is claimable again
        assert!(matches!(q.claim("a"), Claim::Builder));
        q.publish("a", &Arc::new(2));
    }
}
