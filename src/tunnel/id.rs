use std::sync::atomic::{AtomicU32, Ordering};

/// Thread-safe monotonically increasing id source.
///
/// The first id handed out is `start + 1`.
#[derive(Debug, Default)]
pub struct IdGenerator {
    current: AtomicU32,
}

impl IdGenerator {
    pub fn new(start: u32) -> Self {
        Self {
            current: AtomicU32::new(start),
        }
    }

    /// Increment and return the new value
    pub fn next(&self) -> u32 {
        self.current.fetch_add(1, Ordering::Relaxed).wrapping_add(1)
    }
}
