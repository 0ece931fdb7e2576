use std::sync::Mutex;

/// Anything that can live in a [`Pool`] must be able to reset itself back to
/// a zero-state before it is handed to a new borrower.
pub trait Poolable: Default {
    /// Called on `release`, before the object is pushed back onto the free
    /// list. Must clear every field that could otherwise leak state across a
    /// request boundary (spec §4.1, §8 "releasing then reacquiring yields a
    /// zeroed object").
    fn reset(&mut self);
}

/// A bounded, sanitizing free-list. `acquire` never blocks: on exhaustion it
/// allocates a fresh object instead of waiting. `release` past the
/// configured capacity drops the object instead of growing the pool
/// unbounded.
pub struct Pool<T: Poolable> {
    free: Mutex<Vec<Box<T>>>,
    cap: usize,
}

impl<T: Poolable> Pool<T> {
    pub fn new(cap: usize) -> Self {
        Self {
            free: Mutex::new(Vec::with_capacity(cap)),
            cap,
        }
    }

    pub fn acquire(&self) -> Box<T> {
        let popped = self.free.lock().expect("pool mutex poisoned").pop();
        popped.unwrap_or_default()
    }

    pub fn release(&self, mut item: Box<T>) {
        item.reset();
        let mut guard = self.free.lock().expect("pool mutex poisoned");
        if guard.len() < self.cap {
            guard.push(item);
        }
        // else: drop `item` — the pool is already at capacity.
    }

    pub fn len(&self) -> usize {
        self.free.lock().expect("pool mutex poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
