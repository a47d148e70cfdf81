use parking_lot::lock_api::ArcMutexGuard;
use parking_lot::{Mutex, RawMutex};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Per-path mutual exclusion for resolve-then-mutate sequences.
///
/// Keys are the composed RW concrete paths. An entry lives only while some
/// thread holds or waits on it.
#[derive(Debug, Default)]
pub struct PathLockTable {
    locks: Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>,
}

/// Holds one path lock; releasing it drops the table entry when unused.
pub struct PathGuard<'a> {
    table: &'a PathLockTable,
    key: PathBuf,
    guard: Option<ArcMutexGuard<RawMutex, ()>>,
}

impl PathLockTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock(&self, key: &Path) -> PathGuard<'_> {
        let lock = {
            let mut locks = self.locks.lock();
            locks
                .entry(key.to_path_buf())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        let guard = lock.lock_arc();
        PathGuard {
            table: self,
            key: key.to_path_buf(),
            guard: Some(guard),
        }
    }

    /// Locks every key in sorted order. Duplicate keys take a single lock.
    pub fn lock_all(&self, mut keys: Vec<PathBuf>) -> Vec<PathGuard<'_>> {
        keys.sort();
        keys.dedup();
        keys.iter().map(|key| self.lock(key)).collect()
    }

    pub fn len(&self) -> usize {
        self.locks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for PathGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut locks = self.table.locks.lock();
        if let Some(lock) = locks.get(&self.key) {
            if Arc::strong_count(lock) == 1 {
                locks.remove(&self.key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_entries_dropped_after_release() {
        let table = PathLockTable::new();
        {
            let _a = table.lock(Path::new("/rw/a"));
            let _b = table.lock(Path::new("/rw/b"));
            assert_eq!(table.len(), 2);
        }
        assert!(table.is_empty());
    }

    #[test]
    fn test_same_path_is_exclusive() {
        let table = Arc::new(PathLockTable::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let max_inside = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let table = Arc::clone(&table);
                let inside = Arc::clone(&inside);
                let max_inside = Arc::clone(&max_inside);
                thread::spawn(move || {
                    for _ in 0..20 {
                        let _guard = table.lock(Path::new("/rw/shared"));
                        let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                        max_inside.fetch_max(now, Ordering::SeqCst);
                        thread::sleep(Duration::from_micros(50));
                        inside.fetch_sub(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(max_inside.load(Ordering::SeqCst), 1);
        assert!(table.is_empty());
    }

    #[test]
    fn test_lock_all_dedups_keys() {
        let table = PathLockTable::new();
        let guards = table.lock_all(vec![PathBuf::from("/rw/x"), PathBuf::from("/rw/x")]);
        assert_eq!(guards.len(), 1);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_lock_all_opposite_orders_do_not_deadlock() {
        let table = Arc::new(PathLockTable::new());
        let handles: Vec<_> = (0..4)
            .map(|i| {
                let table = Arc::clone(&table);
                thread::spawn(move || {
                    for _ in 0..50 {
                        let keys = if i % 2 == 0 {
                            vec![PathBuf::from("/rw/a"), PathBuf::from("/rw/b")]
                        } else {
                            vec![PathBuf::from("/rw/b"), PathBuf::from("/rw/a")]
                        };
                        let _guards = table.lock_all(keys);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert!(table.is_empty());
    }
}
