use std::sync::atomic::{AtomicU64, Ordering};

/// Remembers the last value seen and reports whether a new one differs.
#[derive(Debug, Clone, Default)]
pub struct Debounce<T> {
    last: T,
}

impl<T: PartialEq> Debounce<T> {
    pub fn new(initial: T) -> Self {
        Self { last: initial }
    }

    /// Stores `value`; true when it differs from the previous one.
    pub fn update(&mut self, value: T) -> bool {
        if self.last == value {
            return false;
        }
        self.last = value;
        true
    }

    pub fn get(&self) -> &T {
        &self.last
    }
}

/// Lock-free `Debounce` for prices.
#[derive(Debug, Default)]
pub struct AtomicDebounce {
    last: AtomicU64,
}

impl AtomicDebounce {
    pub fn update(&self, value: u64) -> bool {
        self.last.swap(value, Ordering::AcqRel) != value
    }

    pub fn get(&self) -> u64 {
        self.last.load(Ordering::Acquire)
    }
}
