//! Ticket pool bounding concurrent fetch-and-process cycles of one worker loop.

/// Fixed-size counter of consumption permits.
///
/// Owned by exactly one worker loop and mutated only from its task, so no
/// synchronization is needed. `available` stays within `[0, ceiling]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TicketPool {
    ceiling: usize,
    available: usize,
}

impl TicketPool {
    /// Create a full pool.
    #[must_use]
    pub const fn new(ceiling: usize) -> Self {
        Self {
            ceiling,
            available: ceiling,
        }
    }

    /// Consume one ticket. Returns `false` when the pool is empty.
    pub fn try_take(&mut self) -> bool {
        if self.available == 0 {
            return false;
        }
        self.available -= 1;
        true
    }

    /// Return one ticket to the pool.
    pub fn release(&mut self) {
        if self.available >= self.ceiling {
            tracing::error!(
                ceiling = self.ceiling,
                "ticket released into a full pool; ignoring"
            );
            return;
        }
        self.available += 1;
    }

    /// Tickets currently available.
    #[must_use]
    pub const fn available(&self) -> usize {
        self.available
    }

    /// Tickets currently consumed by in-flight cycles.
    #[must_use]
    pub const fn in_use(&self) -> usize {
        self.ceiling - self.available
    }

    /// Configured ceiling.
    #[must_use]
    pub const fn ceiling(&self) -> usize {
        self.ceiling
    }
}
