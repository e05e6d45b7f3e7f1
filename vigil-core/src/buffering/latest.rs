//! Depth-1 latest-wins slot.
//!
//! Used between the coordinator and the classifier worker: a new item replaces
//! any unconsumed pending item, so a slow classifier never builds a backlog.

/// Holds at most one pending item; `put` supersedes whatever is waiting.
#[derive(Debug)]
pub struct LatestSlot<T> {
    item: Option<T>,
    superseded: u64,
}

impl<T> LatestSlot<T> {
    pub fn new() -> Self {
        Self {
            item: None,
            superseded: 0,
        }
    }

    /// Store `item`, returning the pending item it replaced (if any).
    pub fn put(&mut self, item: T) -> Option<T> {
        let previous = self.item.replace(item);
        if previous.is_some() {
            self.superseded += 1;
        }
        previous
    }

    pub fn take(&mut self) -> Option<T> {
        self.item.take()
    }

    pub fn peek(&self) -> Option<&T> {
        self.item.as_ref()
    }

    pub fn is_empty(&self) -> bool {
        self.item.is_none()
    }

    /// Total number of items dropped because a newer one arrived.
    pub fn superseded(&self) -> u64 {
        self.superseded
    }
}

impl<T> Default for LatestSlot<T> {
    fn default() -> Self {
        Self::new()
    }
}
