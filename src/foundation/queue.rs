use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::time::Duration;

/// Result of a non-blocking or timed pop.
#[derive(Debug, PartialEq, Eq)]
pub enum PopOutcome<T> {
    Item(T),
    Empty,
    Closed,
}

struct QueueState<T> {
    items: VecDeque<T>,
    closed: bool,
    sealed: bool,
}

/// Bounded FIFO shared between pipeline threads.
///
/// `push` blocks while the queue is full, `pop` blocks while it is empty. `close` drops queued
/// items and wakes every waiter on both sides with a closed result, which is how pipelines shut
/// down without leaving threads parked. `seal` is the graceful variant: pushes are refused but
/// consumers drain what is left before seeing the end.
pub struct ClosableQueue<T> {
    state: Mutex<QueueState<T>>,
    not_empty: Condvar,
    not_full: Condvar,
    capacity: usize,
}

impl<T> ClosableQueue<T> {
    /// `capacity` is clamped to at least one slot.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::with_capacity(capacity),
                closed: false,
                sealed: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            capacity,
        }
    }

    /// A queue pre-filled with `items`, sized to hold exactly that many.
    pub fn filled(items: impl IntoIterator<Item = T>) -> Self {
        let items: VecDeque<T> = items.into_iter().collect();
        let capacity = items.len().max(1);
        Self {
            state: Mutex::new(QueueState {
                items,
                closed: false,
                sealed: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Blocks while full. Returns the item back if the queue is (or becomes) closed.
    pub fn push(&self, item: T) -> Result<(), T> {
        let mut st = self.state.lock();
        while !st.closed && !st.sealed && st.items.len() >= self.capacity {
            self.not_full.wait(&mut st);
        }
        if st.closed || st.sealed {
            return Err(item);
        }
        st.items.push_back(item);
        drop(st);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Never blocks. Returns the item back when full or closed.
    pub fn try_push(&self, item: T) -> Result<(), T> {
        let mut st = self.state.lock();
        if st.closed || st.sealed || st.items.len() >= self.capacity {
            return Err(item);
        }
        st.items.push_back(item);
        drop(st);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Blocks while empty. `None` means the queue was closed, or sealed and drained.
    pub fn pop(&self) -> Option<T> {
        let mut st = self.state.lock();
        while !st.closed && !st.sealed && st.items.is_empty() {
            self.not_empty.wait(&mut st);
        }
        if st.closed {
            return None;
        }
        let item = st.items.pop_front();
        drop(st);
        self.not_full.notify_one();
        item
    }

    pub fn try_pop(&self) -> PopOutcome<T> {
        let mut st = self.state.lock();
        if st.closed {
            return PopOutcome::Closed;
        }
        match st.items.pop_front() {
            Some(item) => {
                drop(st);
                self.not_full.notify_one();
                PopOutcome::Item(item)
            }
            None if st.sealed => PopOutcome::Closed,
            None => PopOutcome::Empty,
        }
    }

    pub fn pop_timeout(&self, timeout: Duration) -> PopOutcome<T> {
        let mut st = self.state.lock();
        if !st.closed && !st.sealed && st.items.is_empty() {
            let _ = self.not_empty.wait_while_for(
                &mut st,
                |s| !s.closed && !s.sealed && s.items.is_empty(),
                timeout,
            );
        }
        if st.closed {
            return PopOutcome::Closed;
        }
        match st.items.pop_front() {
            Some(item) => {
                drop(st);
                self.not_full.notify_one();
                PopOutcome::Item(item)
            }
            None if st.sealed => PopOutcome::Closed,
            None => PopOutcome::Empty,
        }
    }

    /// Refuse further pushes; queued items stay poppable.
    pub fn seal(&self) {
        let mut st = self.state.lock();
        st.sealed = true;
        drop(st);
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    /// Drops queued items and wakes every waiter.
    pub fn close(&self) {
        let mut st = self.state.lock();
        st.items.clear();
        st.closed = true;
        drop(st);
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
