//! Framebuffer bookkeeping for the scanout chain

use parking_lot::Mutex;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Weak};

/// Display framebuffers registered for scanout buffers, keyed by buffer
/// identity. A buffer is registered once on first use and stays registered
/// until it is evicted, either directly or by dropping its [`EvictOnDrop`].
#[derive(Debug)]
pub struct FramebufferCache<K, F> {
    entries: HashMap<K, F>,
    dead: Arc<Mutex<Vec<K>>>,
}

/// Queues its key for eviction when dropped. Attached to a buffer so the
/// framebuffer goes away with the buffer it was registered for.
#[derive(Debug)]
pub struct EvictOnDrop<K> {
    key: Option<K>,
    dead: Weak<Mutex<Vec<K>>>,
}

impl<K> EvictOnDrop<K> {
    /// Drop without queueing the key
    pub fn disarm(mut self) {
        self.key = None;
    }
}

impl<K> Drop for EvictOnDrop<K> {
    fn drop(&mut self) {
        if let (Some(key), Some(dead)) = (self.key.take(), self.dead.upgrade()) {
            dead.lock().push(key);
        }
    }
}

impl<K: Eq + Hash, F: Copy> FramebufferCache<K, F> {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            dead: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// A guard that evicts `key` once dropped and the cache is reaped
    pub fn evict_on_drop(&self, key: K) -> EvictOnDrop<K> {
        EvictOnDrop {
            key: Some(key),
            dead: Arc::downgrade(&self.dead),
        }
    }

    /// Evict every key whose guard has been dropped, returning their
    /// framebuffers for the caller to unregister.
    pub fn reap(&mut self) -> Vec<F> {
        let dead = std::mem::take(&mut *self.dead.lock());
        dead.iter().filter_map(|key| self.entries.remove(key)).collect()
    }

    /// Return the framebuffer for `key`, registering it with `create` on a miss.
    pub fn get_or_try_insert<E>(
        &mut self,
        key: K,
        create: impl FnOnce() -> Result<F, E>,
    ) -> Result<F, E> {
        if let Some(fb) = self.entries.get(&key) {
            return Ok(*fb);
        }
        let fb = create()?;
        self.entries.insert(key, fb);
        Ok(fb)
    }

    /// Forget a buffer that is being destroyed, returning its framebuffer so
    /// the caller can unregister it.
    pub fn evict(&mut self, key: &K) -> Option<F> {
        self.entries.remove(key)
    }

    /// Evict everything
    pub fn drain(&mut self) -> Vec<F> {
        self.entries.drain().map(|(_, fb)| fb).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<K: Eq + Hash, F: Copy> Default for FramebufferCache<K, F> {
    fn default() -> Self {
        Self::new()
    }
}

/// Tracks which locked scanout buffers may still be read by the display.
///
/// When a new buffer is scheduled the one on screen becomes "retiring"; it is
/// handed back for release only when the *next* buffer is scheduled, one
/// frame later, so a flip still in flight never loses its source.
#[derive(Debug)]
pub struct FlipChain<T> {
    on_screen: Option<T>,
    retiring: Option<T>,
}

impl<T> FlipChain<T> {
    pub fn new() -> Self {
        Self {
            on_screen: None,
            retiring: None,
        }
    }

    /// Record `next` as the scheduled buffer. Returns the buffer that can be
    /// released now, if any.
    pub fn schedule(&mut self, next: T) -> Option<T> {
        let released = self.retiring.take();
        self.retiring = self.on_screen.replace(next);
        released
    }

    pub fn on_screen(&self) -> Option<&T> {
        self.on_screen.as_ref()
    }

    pub fn retiring(&self) -> Option<&T> {
        self.retiring.as_ref()
    }

    /// Take every held buffer, oldest first
    pub fn take_all(&mut self) -> Vec<T> {
        self.retiring
            .take()
            .into_iter()
            .chain(self.on_screen.take())
            .collect()
    }
}

impl<T> Default for FlipChain<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn release_is_delayed_by_one_frame() {
        let mut chain = FlipChain::new();
        assert_eq!(chain.schedule(1), None);
        assert_eq!(chain.schedule(2), None);
        assert_eq!(chain.on_screen(), Some(&2));
        assert_eq!(chain.retiring(), Some(&1));

        assert_eq!(chain.schedule(3), Some(1));
        assert_eq!(chain.schedule(4), Some(2));
        assert_eq!(chain.take_all(), vec![3, 4]);
        assert!(chain.on_screen().is_none());
    }

    #[test]
    fn at_most_two_buffers_are_held() {
        let mut chain = FlipChain::new();
        let mut released = Vec::new();
        for frame in 0..10 {
            released.extend(chain.schedule(frame));
            let held = chain.on_screen().is_some() as usize + chain.retiring().is_some() as usize;
            assert!(held <= 2);
        }
        assert_eq!(released, (0..8).collect::<Vec<_>>());
    }

    #[test]
    fn framebuffers_are_registered_once() {
        let mut cache: FramebufferCache<usize, u32> = FramebufferCache::new();
        let mut created = 0;
        for _ in 0..3 {
            let fb = cache
                .get_or_try_insert::<()>(0xdead, || {
                    created += 1;
                    Ok(7)
                })
                .unwrap();
            assert_eq!(fb, 7);
        }
        assert_eq!(created, 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn failed_registration_is_not_cached() {
        let mut cache: FramebufferCache<usize, u32> = FramebufferCache::new();
        assert_eq!(cache.get_or_try_insert(1, || Err("enospc")), Err("enospc"));
        assert!(cache.is_empty());
        assert_eq!(cache.get_or_try_insert::<&str>(1, || Ok(9)), Ok(9));
    }

    #[test]
    fn eviction_returns_the_framebuffer() {
        let mut cache: FramebufferCache<usize, u32> = FramebufferCache::new();
        cache.get_or_try_insert::<()>(1, || Ok(10)).unwrap();
        cache.get_or_try_insert::<()>(2, || Ok(20)).unwrap();
        assert_eq!(cache.evict(&1), Some(10));
        assert_eq!(cache.evict(&1), None);
        assert_eq!(cache.drain(), vec![20]);
        assert!(cache.is_empty());
    }

    #[test]
    fn dropped_guard_evicts_on_reap() {
        let mut cache: FramebufferCache<usize, u32> = FramebufferCache::new();
        cache.get_or_try_insert::<()>(1, || Ok(10)).unwrap();
        cache.get_or_try_insert::<()>(2, || Ok(20)).unwrap();
        let first = cache.evict_on_drop(1);
        let second = cache.evict_on_drop(2);

        assert!(cache.reap().is_empty());
        drop(first);
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.reap(), vec![10]);
        assert_eq!(cache.len(), 1);
        assert!(cache.reap().is_empty());

        second.disarm();
        assert!(cache.reap().is_empty());
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn reused_key_registers_a_new_framebuffer() {
        let mut cache: FramebufferCache<usize, u32> = FramebufferCache::new();
        cache.get_or_try_insert::<()>(0xbeef, || Ok(1)).unwrap();
        drop(cache.evict_on_drop(0xbeef));
        assert_eq!(cache.reap(), vec![1]);
        assert_eq!(cache.get_or_try_insert::<()>(0xbeef, || Ok(2)), Ok(2));
    }

    #[test]
    fn guard_outliving_the_cache_is_harmless() {
        let cache: FramebufferCache<usize, u32> = FramebufferCache::new();
        let guard = cache.evict_on_drop(3);
        drop(cache);
        drop(guard);
    }
}
