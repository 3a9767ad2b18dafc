use thiserror::Error;

pub type Result<T> = std::result::Result<T, RegCacheError>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegCacheError {
    #[error("invalid range [{start:#x}, {end:#x}): start must be less than end")]
    InvalidRange { start: u64, end: u64 },
    #[error(
        "range [{start:#x}, {end:#x}) overlaps [{existing_start:#x}, {existing_end:#x})"
    )]
    Overlap {
        start: u64,
        end: u64,
        existing_start: u64,
        existing_end: u64,
    },
    #[error("registering {len} bytes at {start:#x} failed: {reason}")]
    Registration {
        start: u64,
        len: usize,
        reason: String,
    },
    #[error(
        "copies diverged after {operation}: copy {copy} holds {found} ranges, not {expected}"
    )]
    Consistency {
        operation: &'static str,
        copy: usize,
        expected: usize,
        found: usize,
    },
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    #[error("batch length mismatch: bases={bases}, lens={lens}")]
    BatchLengthMismatch { bases: usize, lens: usize },
}

/// Exclusive end of `[base, base + len)`, rejecting empty and wrapping ranges.
pub(crate) fn range_end(base: u64, len: usize) -> Result<u64> {
    match base.checked_add(len as u64) {
        Some(end) if end > base => Ok(end),
        Some(end) => Err(RegCacheError::InvalidRange { start: base, end }),
        None => Err(RegCacheError::InvalidRange {
            start: base,
            end: base.wrapping_add(len as u64),
        }),
    }
}
