//! Explicit reference counting for cache keys.
//!
//! Subscriptions retain their key and release it when they end. A key with
//! no references becomes collectable once it has been idle for the
//! keep-alive period. Keys that were never retained count as idle since
//! they were interned.

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

use crate::cache_key::CacheKey;

#[derive(Debug, Clone, Copy)]
enum Refs {
    Held(usize),
    Idle(Instant),
}

/// Reference counts per key.
#[derive(Debug, Default)]
pub struct RefCounts {
    refs: HashMap<CacheKey, Refs>,
}

impl RefCounts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn retain(&mut self, key: &CacheKey) {
        let refs = self.refs.entry(key.clone()).or_insert(Refs::Held(0));
        *refs = match *refs {
            Refs::Held(n) => Refs::Held(n + 1),
            Refs::Idle(_) => Refs::Held(1),
        };
    }

    /// Drop one reference; the last one starts the keep-alive clock.
    pub fn release(&mut self, key: &CacheKey, now: Instant) {
        if let Some(refs) = self.refs.get_mut(key) {
            *refs = match *refs {
                Refs::Held(n) if n > 1 => Refs::Held(n - 1),
                Refs::Held(_) => Refs::Idle(now),
                idle => idle,
            };
        }
    }

    /// Restart the keep-alive clock of an unreferenced key.
    pub fn touch(&mut self, key: &CacheKey, now: Instant) {
        match self.refs.get_mut(key) {
            Some(Refs::Held(_)) => {}
            Some(refs) => *refs = Refs::Idle(now),
            None => {
                self.refs.insert(key.clone(), Refs::Idle(now));
            }
        }
    }

    pub fn count(&self, key: &CacheKey) -> usize {
        match self.refs.get(key) {
            Some(Refs::Held(n)) => *n,
            _ => 0,
        }
    }

    /// Whether `key` has been unreferenced for at least `keep_alive`.
    pub fn is_collectable(&self, key: &CacheKey, now: Instant, keep_alive: Duration) -> bool {
        let idle_since = match self.refs.get(key) {
            Some(Refs::Held(_)) => return false,
            Some(Refs::Idle(since)) => *since,
            None => key.created_at(),
        };
        now.saturating_duration_since(idle_since) >= keep_alive
    }

    pub fn forget(&mut self, key: &CacheKey) {
        self.refs.remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache_key::KeyRegistry;
    use lamina_core::PrimaryKey;

    #[test]
    fn test_retain_release_keep_alive() {
        let keys = KeyRegistry::new();
        let key = keys.object("Employee", &PrimaryKey::from(1)).unwrap();
        let keep_alive = Duration::from_secs(60);
        let mut refs = RefCounts::new();

        refs.retain(&key);
        refs.retain(&key);
        assert_eq!(refs.count(&key), 2);

        let start = Instant::now();
        refs.release(&key, start);
        assert!(!refs.is_collectable(&key, start + keep_alive, keep_alive));

        refs.release(&key, start);
        assert_eq!(refs.count(&key), 0);
        assert!(!refs.is_collectable(&key, start + Duration::from_secs(59), keep_alive));
        assert!(refs.is_collectable(&key, start + keep_alive, keep_alive));

        refs.touch(&key, start + keep_alive);
        assert!(!refs.is_collectable(&key, start + keep_alive, keep_alive));
    }

    #[test]
    fn test_untracked_key_idle_since_creation() {
        let keys = KeyRegistry::new();
        let key = keys.object("Employee", &PrimaryKey::from(1)).unwrap();
        let refs = RefCounts::new();
        let later = key.created_at() + Duration::from_secs(61);
        assert!(refs.is_collectable(&key, later, Duration::from_secs(60)));
    }
}
