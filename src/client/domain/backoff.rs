//! Linear, capped backoff measured in ticks.

/// Wait schedule for resolution retries.
///
/// The first wait is one tick and every further consecutive failure adds
/// one tick, up to `cap`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    next: u64,
    cap: u64,
}

impl Backoff {
    /// Creates a schedule capped at `cap` ticks (at least one).
    #[must_use]
    pub fn new(cap: u64) -> Self {
        Self {
            next: 1,
            cap: cap.max(1),
        }
    }

    /// Returns the wait for the current failure and advances the schedule.
    pub fn next_wait(&mut self) -> u64 {
        let wait = self.next.min(self.cap);
        self.next = wait.saturating_add(1).min(self.cap);
        wait
    }

    /// Restarts the schedule at one tick.
    pub const fn reset(&mut self) {
        self.next = 1;
    }

    /// Upper bound of any single wait.
    #[must_use]
    pub const fn cap(&self) -> u64 {
        self.cap
    }
}
