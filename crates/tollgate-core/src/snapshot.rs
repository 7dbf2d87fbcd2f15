use std::sync::Arc;

use arc_swap::ArcSwap;

/// Immutable value replaced wholesale by a single writer
///
/// Readers take the current `Arc` without locking and keep working on it
/// while a writer installs the next value. A reader never observes a
/// partially rebuilt value.
#[derive(Debug)]
pub struct Snapshot<T> {
    current: ArcSwap<T>,
}

impl<T> Snapshot<T> {
    pub fn new(value: T) -> Self {
        Self {
            current: ArcSwap::from_pointee(value),
        }
    }

    /// Current value
    pub fn load(&self) -> Arc<T> {
        self.current.load_full()
    }

    /// Install `value`, returning the one it replaced
    pub fn replace(&self, value: T) -> Arc<T> {
        self.current.swap(Arc::new(value))
    }
}

impl<T: Default> Default for Snapshot<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn readers_keep_their_snapshot_across_replace() {
        let snapshot = Snapshot::new(vec![1, 2, 3]);
        let before = snapshot.load();

        let previous = snapshot.replace(vec![4]);

        assert_eq!(*before, vec![1, 2, 3]);
        assert!(Arc::ptr_eq(&before, &previous));
        assert_eq!(*snapshot.load(), vec![4]);
    }

    #[test]
    fn concurrent_readers_see_whole_values() {
        let snapshot = Arc::new(Snapshot::new(vec![0u32; 64]));

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let snapshot = snapshot.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        let value = snapshot.load();
                        assert!(value.iter().all(|v| *v == value[0]));
                    }
                })
            })
            .collect();

        for round in 1..=100 {
            snapshot.replace(vec![round; 64]);
        }
        for reader in readers {
            reader.join().unwrap();
        }
        assert_eq!(snapshot.load()[0], 100);
    }
}
