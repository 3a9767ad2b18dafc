use std::fmt;

use crate::{
    domain::{AccessFlags, MemoryRegion, RegistrationDomain},
    error::{RegCacheError, Result, range_end},
};

/// A registered `[start, end)` range and the descriptors a transfer needs to
/// use it. Immutable once built; shared between every index copy and any
/// reader holding a lookup result. The registration is released when the
/// last `Arc` goes away.
pub struct RegisteredRange<R: MemoryRegion> {
    start: u64,
    end: u64,
    region: R,
    // One slot per scatter/gather entry. Every slot is the same descriptor;
    // iovec-based transfer calls want a parallel descriptor array.
    descriptors: Box<[R::Descriptor]>,
}

impl<R: MemoryRegion> RegisteredRange<R> {
    pub(crate) fn new(start: u64, end: u64, region: R, iov_limit: usize) -> Self {
        debug_assert!(start < end);
        let descriptor = region.descriptor();
        Self {
            start,
            end,
            region,
            descriptors: vec![descriptor; iov_limit].into_boxed_slice(),
        }
    }

    /// Registers `[base, base + len)` with `domain` for datapath access.
    pub(crate) fn register<D>(domain: &D, base: u64, len: usize, iov_limit: usize) -> Result<Self>
    where
        D: RegistrationDomain<Region = R> + ?Sized,
    {
        if iov_limit == 0 {
            return Err(RegCacheError::InvalidArgument("iov_limit must be non-zero"));
        }
        let end = range_end(base, len)?;
        let region = domain
            .register_region(base, len, AccessFlags::DATAPATH)
            .map_err(|error| RegCacheError::Registration {
                start: base,
                len,
                reason: error.to_string(),
            })?;
        Ok(Self::new(base, end, region, iov_limit))
    }

    pub fn start(&self) -> u64 {
        self.start
    }

    pub fn end(&self) -> u64 {
        self.end
    }

    pub fn len(&self) -> usize {
        (self.end - self.start) as usize
    }

    pub fn region(&self) -> &R {
        &self.region
    }

    pub fn descriptors(&self) -> &[R::Descriptor] {
        &self.descriptors
    }

    /// Whether `[addr, addr + size)` lies entirely inside this range.
    pub fn contains(&self, addr: u64, size: usize) -> bool {
        match addr.checked_add(size as u64) {
            Some(end) => addr >= self.start && addr < end && end <= self.end,
            None => false,
        }
    }
}

impl<R: MemoryRegion> fmt::Debug for RegisteredRange<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisteredRange")
            .field("start", &format_args!("{:#x}", self.start))
            .field("end", &format_args!("{:#x}", self.end))
            .field("iov_slots", &self.descriptors.len())
            .finish()
    }
}

impl<R: MemoryRegion> Drop for RegisteredRange<R> {
    fn drop(&mut self) {
        log::trace!(
            "releasing registration [{:#x}, {:#x})",
            self.start,
            self.end
        );
    }
}

#[cfg(test)]
mod tests {
    use super::RegisteredRange;
    use crate::{
        error::RegCacheError,
        loopback::{LoopbackDomain, LoopbackKey},
    };

    #[test]
    fn descriptors_replicate_one_registration() {
        let domain = LoopbackDomain::new();
        let range = RegisteredRange::register(&domain, 0x1000, 0x1000, 4).expect("register");
        assert_eq!(range.start(), 0x1000);
        assert_eq!(range.end(), 0x2000);
        assert_eq!(range.len(), 0x1000);
        assert_eq!(range.descriptors().len(), 4);
        let key = range.region().key();
        assert!(range.descriptors().iter().all(|d| *d == key));
        assert_ne!(key, LoopbackKey(0));
    }

    #[test]
    fn drop_releases_registration() {
        let domain = LoopbackDomain::new();
        let range = RegisteredRange::register(&domain, 0x1000, 64, 1).expect("register");
        assert_eq!(domain.live_regions(), 1);
        drop(range);
        assert_eq!(domain.live_regions(), 0);
    }

    #[test]
    fn contains_checks_both_ends() {
        let domain = LoopbackDomain::new();
        let range = RegisteredRange::register(&domain, 0x1000, 0x1000, 1).expect("register");
        assert!(range.contains(0x1000, 0x1000));
        assert!(range.contains(0x1800, 0x100));
        assert!(!range.contains(0x1F80, 0x100));
        assert!(!range.contains(0x0F00, 0x200));
        assert!(!range.contains(0x1800, 0));
        assert!(!range.contains(u64::MAX, 2));
    }

    #[test]
    fn registration_failure_is_wrapped() {
        let domain = LoopbackDomain::with_limit(0);
        let err = RegisteredRange::register(&domain, 0x1000, 64, 1).expect_err("must fail");
        assert_eq!(
            err,
            RegCacheError::Registration {
                start: 0x1000,
                len: 64,
                reason: "region limit reached (0 live registrations)".to_string(),
            }
        );
    }

    #[test]
    fn zero_iov_limit_is_rejected_before_registering() {
        let domain = LoopbackDomain::new();
        let err = RegisteredRange::register(&domain, 0x1000, 64, 0).expect_err("must fail");
        assert_eq!(
            err,
            RegCacheError::InvalidArgument("iov_limit must be non-zero")
        );
        assert_eq!(domain.live_regions(), 0);
    }
}
