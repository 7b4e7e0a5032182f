use thiserror::Error;

/// Errors reported by the pooled allocator.
///
/// Allocation failures never terminate the process; they surface here and the
/// caller decides whether to fail the surrounding operation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AllocError {
    /// The configured memory budget would be exceeded by this allocation.
    #[error("allocation of {requested} bytes exceeds the memory budget of {budget} bytes")]
    OutOfMemory {
        /// Bytes the caller asked for.
        requested: usize,
        /// The configured budget.
        budget: usize,
    },

    /// A write or growth request went past the buffer's `max_capacity`.
    #[error("requested capacity {requested} exceeds max capacity {max}")]
    CapacityExceeded {
        /// The capacity that would be required.
        requested: usize,
        /// The buffer's immutable upper bound.
        max: usize,
    },

    /// `initial_capacity > max_capacity` at allocation time.
    #[error("initial capacity {initial} is larger than max capacity {max}")]
    InvalidCapacity {
        /// Requested initial capacity.
        initial: usize,
        /// Requested max capacity.
        max: usize,
    },
}
