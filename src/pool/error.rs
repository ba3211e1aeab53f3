use std::fmt;

/// Error taxonomy for the pool and the buffer views layered on top of it.
///
/// Argument and configuration errors are programmer mistakes reported before
/// any state mutation. Reference-count and accessibility errors indicate a
/// use-after-free or double-free bug in client code and are never silently
/// clamped. Mapping failures are resource exhaustion propagated to the
/// immediate caller; a failed chunk allocation leaves the arena untouched.
#[derive(Debug)]
pub enum PoolError {
    /// Invalid capacity argument (negative is unrepresentable in `usize`,
    /// but overflow past the representable maximum is not).
    InvalidCapacity { requested: usize, maximum: usize },
    /// `min_new_capacity` exceeded `max_capacity` in a growth computation.
    CapacityBounds { minimum: usize, maximum: usize },
    /// Invalid configuration value (non-power-of-two page size, zero arena
    /// count, chunk order out of range, ...).
    InvalidConfig(String),
    /// Retain/release with a non-positive delta, release below zero, or
    /// retain on a dead (zero) count.
    IllegalRefCount { count: u32 },
    /// Data access on a buffer whose reference count already reached zero.
    BufferInaccessible,
    /// Operation structurally impossible for this view kind
    /// (e.g. changing the capacity of a fixed-length slice).
    Unsupported(&'static str),
    /// Backing-store mapping failed (address space or memory exhaustion).
    MapFailed(std::io::Error),
    /// Unmapping a chunk's backing store failed.
    UnmapFailed(std::io::Error),
}

impl fmt::Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolError::InvalidCapacity { requested, maximum } => {
                write!(f, "invalid capacity {requested} (maximum {maximum})")
            }
            PoolError::CapacityBounds { minimum, maximum } => write!(
                f,
                "minimum new capacity {minimum} exceeds maximum capacity {maximum}"
            ),
            PoolError::InvalidConfig(msg) => write!(f, "invalid pool configuration: {msg}"),
            PoolError::IllegalRefCount { count } => {
                write!(f, "illegal reference count operation (count was {count})")
            }
            PoolError::BufferInaccessible => {
                write!(f, "buffer is inaccessible (reference count reached zero)")
            }
            PoolError::Unsupported(what) => {
                write!(f, "operation not supported for this view kind: {what}")
            }
            PoolError::MapFailed(e) => write!(f, "chunk mapping failed: {e}"),
            PoolError::UnmapFailed(e) => write!(f, "chunk unmapping failed: {e}"),
        }
    }
}

impl std::error::Error for PoolError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PoolError::MapFailed(e) | PoolError::UnmapFailed(e) => Some(e),
            _ => None,
        }
    }
}
