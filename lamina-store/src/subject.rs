//! Per-key multicast subjects.
//!
//! A subject remembers the last payload it delivered along with the commit
//! sequence number that produced it, and drops anything older. That keeps
//! per-key delivery in commit order even when two batches notify from
//! different threads.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use lamina_core::CacheError;

use crate::cache_key::CacheKey;
use crate::observe::{Observer, Payload};

type SharedObserver = Arc<dyn Observer<Payload>>;

struct SubjectState {
    observers: Vec<(u64, SharedObserver)>,
    last: Option<(u64, Payload)>,
    next_id: u64,
    completed: bool,
}

/// Multicast channel for one cache key.
pub struct Subject {
    key: CacheKey,
    state: Mutex<SubjectState>,
}

impl Subject {
    pub fn new(key: CacheKey) -> Self {
        Self {
            key,
            state: Mutex::new(SubjectState {
                observers: Vec::new(),
                last: None,
                next_id: 1,
                completed: false,
            }),
        }
    }

    // Observer panics must not wedge the subject for everyone else.
    fn lock(&self) -> MutexGuard<'_, SubjectState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    /// Register an observer without delivering anything yet.
    pub fn add(&self, observer: SharedObserver) -> u64 {
        let mut state = self.lock();
        let id = state.next_id;
        state.next_id += 1;
        state.observers.push((id, observer));
        id
    }

    /// Deliver the current value to a freshly added observer.
    ///
    /// If a newer payload was already published, that one is sent instead.
    pub fn deliver_initial(&self, observer_id: u64, seq: u64, payload: Payload) {
        let (observer, payload) = {
            let mut state = self.lock();
            let observer = match state.observers.iter().find(|(id, _)| *id == observer_id) {
                Some((_, o)) => Arc::clone(o),
                None => return,
            };
            let payload = match &state.last {
                Some((last_seq, last)) if *last_seq >= seq => last.clone(),
                _ => {
                    state.last = Some((seq, payload.clone()));
                    payload
                }
            };
            (observer, payload)
        };
        observer.next(payload);
    }

    /// Publish a payload produced by commit `seq`.
    pub fn next(&self, seq: u64, payload: Payload) {
        let observers = {
            let mut state = self.lock();
            if state.completed {
                return;
            }
            if matches!(&state.last, Some((last_seq, _)) if *last_seq > seq) {
                return;
            }
            state.last = Some((seq, payload.clone()));
            snapshot(&state.observers)
        };
        for observer in observers {
            observer.next(payload.clone());
        }
    }

    pub fn error(&self, error: &CacheError) {
        let observers = snapshot(&self.lock().observers);
        for observer in observers {
            observer.error(error);
        }
    }

    /// Complete every observer and stop accepting values.
    pub fn complete(&self) {
        let observers = {
            let mut state = self.lock();
            state.completed = true;
            std::mem::take(&mut state.observers)
        };
        for (_, observer) in observers {
            observer.complete();
        }
    }

    pub fn remove(&self, observer_id: u64) -> bool {
        let mut state = self.lock();
        let before = state.observers.len();
        state.observers.retain(|(id, _)| *id != observer_id);
        state.observers.len() != before
    }

    pub fn observer_count(&self) -> usize {
        self.lock().observers.len()
    }

    /// The last payload published, if any.
    pub fn last(&self) -> Option<Payload> {
        self.lock().last.as_ref().map(|(_, p)| p.clone())
    }
}

fn snapshot(observers: &[(u64, SharedObserver)]) -> Vec<SharedObserver> {
    observers.iter().map(|(_, o)| Arc::clone(o)).collect()
}

/// Subjects keyed by cache key.
#[derive(Default)]
pub struct SubjectRegistry {
    subjects: Mutex<HashMap<CacheKey, Arc<Subject>>>,
}

impl SubjectRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<CacheKey, Arc<Subject>>> {
        self.subjects.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn get(&self, key: &CacheKey) -> Option<Arc<Subject>> {
        self.lock().get(key).cloned()
    }

    pub fn get_or_create(&self, key: &CacheKey) -> Arc<Subject> {
        Arc::clone(
            self.lock()
                .entry(key.clone())
                .or_insert_with(|| Arc::new(Subject::new(key.clone()))),
        )
    }

    /// Subjects for whichever of `keys` have one.
    pub fn existing<'a>(&self, keys: impl IntoIterator<Item = &'a CacheKey>) -> Vec<Arc<Subject>> {
        let subjects = self.lock();
        keys.into_iter()
            .filter_map(|k| subjects.get(k).cloned())
            .collect()
    }

    pub fn remove(&self, key: &CacheKey) -> Option<Arc<Subject>> {
        self.lock().remove(key)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
