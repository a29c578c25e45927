use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

type KeyFn<T> = Arc<dyn Fn(&T) -> String + Send + Sync>;

/// Ordering discipline of a backlog
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BacklogMode {
    /// First in, first out (breadth-first crawling)
    Queue,
    /// Last in, first out (depth-first crawling)
    Stack,
}

struct Sequence<T> {
    items: VecDeque<T>,
    mode: BacklogMode,
}

/// Concurrent FIFO/LIFO container with O(1) key membership.
///
/// Items are always stored in insertion order; the mode only decides which
/// end `pop` takes from. The key map counts how many held items carry each
/// key, so a key stays present until the last item with it is popped.
/// No dedup happens here: callers check `contains_key` before pushing.
pub struct Backlog<T> {
    sequence: Mutex<Sequence<T>>,
    keys: DashMap<String, usize>,
    key_fn: Option<KeyFn<T>>,
}

impl<T: Clone> Backlog<T> {
    /// Create a backlog without key tracking
    pub fn new(mode: BacklogMode) -> Self {
        Self {
            sequence: Mutex::new(Sequence { items: VecDeque::new(), mode }),
            keys: DashMap::new(),
            key_fn: None,
        }
    }

    /// Create a backlog that tracks the key of every held item
    pub fn with_key<F>(mode: BacklogMode, key_fn: F) -> Self
    where
        F: Fn(&T) -> String + Send + Sync + 'static,
    {
        Self {
            sequence: Mutex::new(Sequence { items: VecDeque::new(), mode }),
            keys: DashMap::new(),
            key_fn: Some(Arc::new(key_fn)),
        }
    }

    pub fn mode(&self) -> BacklogMode {
        self.sequence.lock().mode
    }

    pub fn len(&self) -> usize {
        self.sequence.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sequence.lock().items.is_empty()
    }

    pub fn push(&self, item: T) {
        let mut sequence = self.sequence.lock();
        self.track(&item);
        sequence.items.push_back(item);
    }

    pub fn push_many<I: IntoIterator<Item = T>>(&self, items: I) {
        let mut sequence = self.sequence.lock();
        for item in items {
            self.track(&item);
            sequence.items.push_back(item);
        }
    }

    /// Remove and return the next item; never blocks
    pub fn pop(&self) -> Option<T> {
        let mut sequence = self.sequence.lock();
        let item = match sequence.mode {
            BacklogMode::Queue => sequence.items.pop_front(),
            BacklogMode::Stack => sequence.items.pop_back(),
        }?;
        self.untrack(&item);
        Some(item)
    }

    pub fn peek(&self) -> Option<T> {
        let sequence = self.sequence.lock();
        match sequence.mode {
            BacklogMode::Queue => sequence.items.front().cloned(),
            BacklogMode::Stack => sequence.items.back().cloned(),
        }
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.keys.contains_key(key)
    }

    /// Linear scan for an item matching `predicate`
    pub fn find<P>(&self, predicate: P) -> Option<T>
    where
        P: Fn(&T) -> bool,
    {
        self.sequence.lock().items.iter().find(|item| predicate(item)).cloned()
    }

    /// Switch ordering, keeping every item and the next item to be popped
    pub fn change_mode(&self, mode: BacklogMode) {
        let mut sequence = self.sequence.lock();
        if sequence.mode == mode {
            return;
        }

        // Re-seat so the item that would have popped next still pops next
        sequence.items.make_contiguous().reverse();
        sequence.mode = mode;
    }

    pub fn clear(&self) {
        let mut sequence = self.sequence.lock();
        sequence.items.clear();
        self.keys.clear();
    }

    /// Remove every item, returned in the order they would be re-pushed to
    /// rebuild the same backlog
    pub fn take_all(&self) -> Vec<T> {
        let mut sequence = self.sequence.lock();
        self.keys.clear();
        sequence.items.drain(..).collect()
    }

    fn track(&self, item: &T) {
        if let Some(key_fn) = &self.key_fn {
            *self.keys.entry(key_fn(item)).or_insert(0) += 1;
        }
    }

    fn untrack(&self, item: &T) {
        if let Some(key_fn) = &self.key_fn {
            let key = key_fn(item);
            let remove = match self.keys.get_mut(&key) {
                Some(mut count) => {
                    *count -= 1;
                    *count == 0
                }
                None => false,
            };
            if remove {
                self.keys.remove_if(&key, |_, count| *count == 0);
            }
        }
    }
}
