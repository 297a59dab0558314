use std::time::{Duration, Instant};

/// Quiet-window coalescing of qualifying events.
///
/// Every recorded event marks the state dirty and pushes the deadline out
/// by `delay`. Once the deadline passes with the dirty flag set, exactly one
/// signal fires and the flag clears. The flag survives until it is observed,
/// so a change is never lost between checks.
#[derive(Debug)]
pub struct Debouncer {
    delay: Duration,
    dirty: bool,
    deadline: Option<Instant>,
}

impl Debouncer {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            dirty: false,
            deadline: None,
        }
    }

    pub fn record(&mut self, now: Instant) {
        self.dirty = true;
        self.deadline = Some(now + self.delay);
    }

    /// When the current quiet window ends, if anything is pending.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline.filter(|_| self.dirty)
    }

    /// True exactly once per quiet window that saw at least one event.
    pub fn poll(&mut self, now: Instant) -> bool {
        match self.deadline() {
            Some(deadline) if now >= deadline => {
                self.dirty = false;
                self.deadline = None;
                true
            }
            _ => false,
        }
    }

    #[cfg(test)]
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }
}
