use std::sync::Mutex;
use tokio::sync::mpsc;

/// Holding pen for batches that could not be flushed when a pipeline stopped.
///
/// A later incarnation of the same pipeline takes the contents over and
/// replays them into its flush queue on start.
#[derive(Debug)]
pub struct FlushOutStore<T> {
    data: Mutex<Vec<T>>,
}

impl<T> Default for FlushOutStore<T> {
    fn default() -> Self {
        Self {
            data: Mutex::new(Vec::new()),
        }
    }
}

impl<T> FlushOutStore<T> {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<T>> {
        match self.data.lock() {
            Ok(d) => d,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn add(&self, items: impl IntoIterator<Item = T>) {
        self.lock().extend(items);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Remove and return everything.
    pub fn take(&self) -> Vec<T> {
        std::mem::take(&mut *self.lock())
    }

    /// Move the contents of `other` to the end of this store.
    pub fn merge(&self, other: &FlushOutStore<T>) {
        let moved = other.take();
        self.add(moved);
    }

    /// Replay into `queue` without blocking. Items that do not fit stay here.
    pub fn write(&self, queue: &mpsc::Sender<T>) -> usize {
        let mut data = self.lock();
        let mut written = 0;
        let mut rest = Vec::new();
        for item in data.drain(..) {
            if !rest.is_empty() {
                rest.push(item);
                continue;
            }
            match queue.try_send(item) {
                Ok(()) => written += 1,
                Err(mpsc::error::TrySendError::Full(item))
                | Err(mpsc::error::TrySendError::Closed(item)) => rest.push(item),
            }
        }
        *data = rest;
        written
    }
}

impl<T: Clone> FlushOutStore<T> {
    pub fn snapshot(&self) -> Vec<T> {
        self.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_moves_items() {
        let a = FlushOutStore::new();
        let b = FlushOutStore::new();
        a.add([1, 2]);
        b.add([3]);

        a.merge(&b);

        assert_eq!(a.snapshot(), vec![1, 2, 3]);
        assert!(b.is_empty());
    }

    #[tokio::test]
    async fn test_write_keeps_overflow_in_order() {
        let store = FlushOutStore::new();
        store.add([1, 2, 3]);
        let (tx, mut rx) = mpsc::channel(2);

        assert_eq!(store.write(&tx), 2);
        assert_eq!(store.snapshot(), vec![3]);
        assert_eq!(rx.recv().await, Some(1));
        assert_eq!(rx.recv().await, Some(2));
    }
}
