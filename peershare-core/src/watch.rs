//! Watched-socket bookkeeping: read and write interest, plus the highest watched key.

use std::collections::BTreeSet;

use crate::registry::SocketKey;

/// Read- and write-interest sets kept in ascending key order.
#[derive(Debug, Default, Clone)]
pub struct WatchSet {
    read: BTreeSet<SocketKey>,
    write: BTreeSet<SocketKey>,
    highest: Option<SocketKey>,
}

impl WatchSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn watch_read(&mut self, key: SocketKey) {
        self.read.insert(key);
        if self.highest.map_or(true, |h| key > h) {
            self.highest = Some(key);
        }
    }

    pub fn watch_write(&mut self, key: SocketKey) {
        self.write.insert(key);
    }

    pub fn unwatch_write(&mut self, key: SocketKey) {
        self.write.remove(&key);
    }

    /// Drop `key` from both sets. Removing the highest key recomputes it from what is
    /// still read-watched.
    pub fn remove(&mut self, key: SocketKey) {
        self.write.remove(&key);
        if !self.read.remove(&key) {
            return;
        }
        if self.highest == Some(key) {
            self.highest = self.read.iter().next_back().copied();
        }
    }

    pub fn is_read_watched(&self, key: SocketKey) -> bool {
        self.read.contains(&key)
    }

    pub fn is_write_watched(&self, key: SocketKey) -> bool {
        self.write.contains(&key)
    }

    /// Highest key in the read-interest set, `None` when nothing is watched.
    pub fn highest(&self) -> Option<SocketKey> {
        self.highest
    }

    pub fn read_keys(&self) -> impl Iterator<Item = SocketKey> + '_ {
        self.read.iter().copied()
    }

    pub fn write_keys(&self) -> impl Iterator<Item = SocketKey> + '_ {
        self.write.iter().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::seq::SliceRandom;

    #[test]
    fn removing_highest_recomputes() {
        let mut w = WatchSet::new();
        for k in [0, 1, 4, 7, 5] {
            w.watch_read(SocketKey(k));
        }
        assert_eq!(w.highest(), Some(SocketKey(7)));
        w.remove(SocketKey(7));
        assert_eq!(w.highest(), Some(SocketKey(5)));
        w.remove(SocketKey(1));
        assert_eq!(w.highest(), Some(SocketKey(5)));
        w.remove(SocketKey(5));
        w.remove(SocketKey(5));
        assert_eq!(w.highest(), Some(SocketKey(4)));
        w.remove(SocketKey(4));
        w.remove(SocketKey(0));
        assert_eq!(w.highest(), None);
    }

    #[test]
    fn write_interest_is_separate() {
        let mut w = WatchSet::new();
        w.watch_read(SocketKey(3));
        w.watch_write(SocketKey(3));
        assert!(w.is_write_watched(SocketKey(3)));
        w.unwatch_write(SocketKey(3));
        assert!(!w.is_write_watched(SocketKey(3)));
        assert!(w.is_read_watched(SocketKey(3)));
        w.watch_write(SocketKey(3));
        w.remove(SocketKey(3));
        assert!(!w.is_write_watched(SocketKey(3)));
        assert!(!w.is_read_watched(SocketKey(3)));
    }

    #[test]
    fn highest_matches_largest_remaining_in_any_order() {
        let mut rng = rand::thread_rng();
        for _ in 0..100 {
            let mut keys: Vec<usize> = (0..16).collect();
            keys.shuffle(&mut rng);
            let mut w = WatchSet::new();
            for &k in &keys {
                w.watch_read(SocketKey(k));
            }
            keys.shuffle(&mut rng);
            for (i, &k) in keys.iter().enumerate() {
                w.remove(SocketKey(k));
                let expected = keys[i + 1..].iter().max().map(|&m| SocketKey(m));
                assert_eq!(w.highest(), expected);
            }
        }
    }

    #[test]
    fn keys_iterate_ascending() {
        let mut w = WatchSet::new();
        for k in [9, 2, 6] {
            w.watch_read(SocketKey(k));
            w.watch_write(SocketKey(k));
        }
        let read: Vec<_> = w.read_keys().map(|k| k.0).collect();
        assert_eq!(read, vec![2, 6, 9]);
        let write: Vec<_> = w.write_keys().map(|k| k.0).collect();
        assert_eq!(write, vec![2, 6, 9]);
    }
}
