//! Lock-free holder for the last observed key version.

use arc_swap::ArcSwap;
use std::sync::Arc;

/// Atomically swapped, immutable key id.
///
/// Readers always see either the previous or the new value. Writers do not
/// coordinate; the last store wins.
#[derive(Debug)]
pub struct KeyIdSlot {
    inner: ArcSwap<String>,
}

impl KeyIdSlot {
    /// Creates an empty slot.
    #[must_use]
    pub fn new() -> Self {
        Self { inner: ArcSwap::from_pointee(String::new()) }
    }

    /// Returns the current key id. Empty until the first store.
    #[must_use]
    pub fn load(&self) -> String {
        self.inner.load().as_ref().clone()
    }

    /// Replaces the current key id.
    pub fn store(&self, key_id: impl Into<String>) {
        self.inner.store(Arc::new(key_id.into()));
    }

    /// Returns true if no key id has been stored yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.load().is_empty()
    }
}

impl Default for KeyIdSlot {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_starts_empty() {
        let slot = KeyIdSlot::new();
        assert!(slot.is_empty());
        assert_eq!(slot.load(), "");
    }

    #[test]
    fn test_slot_last_store_wins() {
        let slot = KeyIdSlot::new();
        slot.store("1");
        slot.store("2");
        assert_eq!(slot.load(), "2");
    }

    #[test]
    fn test_slot_concurrent_readers_see_whole_values() {
        let slot = Arc::new(KeyIdSlot::new());
        slot.store("version-a");

        let writer = {
            let slot = Arc::clone(&slot);
            std::thread::spawn(move || {
                for i in 0..1000 {
                    slot.store(if i % 2 == 0 { "version-a" } else { "version-b" });
                }
            })
        };

        for _ in 0..1000 {
            let seen = slot.load();
            assert!(seen == "version-a" || seen == "version-b", "torn value: {seen}");
        }
        writer.join().unwrap();
    }
}
