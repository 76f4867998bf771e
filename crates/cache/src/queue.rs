//! Insertion-ordered key queue with O(1) removal
//!
//! An intrusive doubly-linked list threaded through a `HashMap`: each key
//! stores the keys of its neighbours, so pushing, popping and removing an
//! arbitrary key never scans the queue.

use std::collections::HashMap;
use std::hash::Hash;

#[derive(Debug, Clone)]
struct Links<K> {
    prev: Option<K>,
    next: Option<K>,
}

/// FIFO queue of unique keys
///
/// # Example
///
/// ```
/// use reader_cache::KeyQueue;
///
/// let mut queue = KeyQueue::new();
/// queue.push_back("a");
/// queue.push_back("b");
/// queue.push_back("c");
///
/// // Removing from the middle is O(1)
/// assert!(queue.remove(&"b"));
///
/// // Pushing an existing key moves it to the back
/// queue.push_back("a");
/// assert_eq!(queue.iter().copied().collect::<Vec<_>>(), vec!["c", "a"]);
/// ```
#[derive(Debug, Clone)]
pub struct KeyQueue<K> {
    links: HashMap<K, Links<K>>,
    head: Option<K>,
    tail: Option<K>,
}

impl<K> Default for KeyQueue<K> {
    fn default() -> Self {
        Self {
            links: HashMap::new(),
            head: None,
            tail: None,
        }
    }
}

impl<K: Hash + Eq + Clone> KeyQueue<K> {
    /// Create an empty queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of queued keys
    pub fn len(&self) -> usize {
        self.links.len()
    }

    /// Check if the queue is empty
    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    /// Check if a key is queued
    pub fn contains(&self, key: &K) -> bool {
        self.links.contains_key(key)
    }

    /// Oldest key, if any
    pub fn front(&self) -> Option<&K> {
        self.head.as_ref()
    }

    /// Newest key, if any
    pub fn back(&self) -> Option<&K> {
        self.tail.as_ref()
    }

    /// Append a key, moving it to the back if already queued
    ///
    /// Returns `true` if the key was not queued before.
    pub fn push_back(&mut self, key: K) -> bool {
        let was_queued = self.remove(&key);

        if let Some(tail) = self.tail.as_ref().and_then(|t| self.links.get_mut(t)) {
            tail.next = Some(key.clone());
        } else {
            self.head = Some(key.clone());
        }
        self.links.insert(
            key.clone(),
            Links {
                prev: self.tail.take(),
                next: None,
            },
        );
        self.tail = Some(key);

        !was_queued
    }

    /// Remove a key from anywhere in the queue
    ///
    /// Returns `true` if the key was queued.
    pub fn remove(&mut self, key: &K) -> bool {
        let Some(Links { prev, next }) = self.links.remove(key) else {
            return false;
        };

        match prev.as_ref().and_then(|p| self.links.get_mut(p)) {
            Some(prev_links) => prev_links.next = next.clone(),
            None => self.head = next.clone(),
        }
        match next.as_ref().and_then(|n| self.links.get_mut(n)) {
            Some(next_links) => next_links.prev = prev,
            None => self.tail = prev,
        }
        true
    }

    /// Remove and return the oldest key
    pub fn pop_front(&mut self) -> Option<K> {
        let head = self.head.clone()?;
        self.remove(&head);
        Some(head)
    }

    /// Remove every key
    pub fn clear(&mut self) {
        self.links.clear();
        self.head = None;
        self.tail = None;
    }

    /// Iterate from oldest to newest
    pub fn iter(&self) -> Iter<'_, K> {
        Iter {
            queue: self,
            cursor: self.head.as_ref(),
        }
    }
}

/// Iterator returned by [`KeyQueue::iter`]
pub struct Iter<'a, K> {
    queue: &'a KeyQueue<K>,
    cursor: Option<&'a K>,
}

impl<'a, K: Hash + Eq> Iterator for Iter<'a, K> {
    type Item = &'a K;

    fn next(&mut self) -> Option<&'a K> {
        let key = self.cursor?;
        self.cursor = self.queue.links.get(key).and_then(|l| l.next.as_ref());
        Some(key)
    }
}
