use std::{fmt, sync::Arc};

use crate::{
    config::RegCacheConfig,
    domain::{MemoryRegion, RegistrationDomain},
    error::{RegCacheError, Result, range_end},
    index::{Overlap, Relation},
    publisher::Publisher,
    region::RegisteredRange,
    tracker,
};

/// Registry of local buffers registered with the NIC, resolved on every
/// transfer to the descriptors that transfer needs.
///
/// `lookup` and friends never take a lock once the calling thread has read
/// from this cache before. `register`, `deregister` and `clear` are
/// serialized and wait for in-flight lookups on stale index copies; they must
/// not be called from inside a [`with_descriptors`](Self::with_descriptors)
/// closure.
///
/// Clones share the same cache.
pub struct RegistrationCache<R: MemoryRegion> {
    publisher: Arc<Publisher<R>>,
}

impl<R: MemoryRegion> RegistrationCache<R> {
    pub fn new(config: RegCacheConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            publisher: Arc::new(Publisher::new(&config)),
        })
    }

    pub fn with_copies(num_copies: usize) -> Result<Self> {
        Self::new(RegCacheConfig::with_copies(num_copies)?)
    }

    /// Registers `[base, base + len)` through `domain` and makes it visible to
    /// lookups. `iov_limit` is how many descriptor slots lookups return.
    pub fn register<D>(
        &self,
        base: u64,
        len: usize,
        domain: &D,
        iov_limit: usize,
    ) -> Result<Arc<RegisteredRange<R>>>
    where
        D: RegistrationDomain<Region = R> + ?Sized,
    {
        if iov_limit == 0 {
            return Err(RegCacheError::InvalidArgument("iov_limit must be non-zero"));
        }
        let end = range_end(base, len)?;
        self.ensure_not_reading()?;

        let mut writer = self.publisher.lock();
        match writer.staging().classify(base, end)? {
            Relation::Disjoint => {}
            Relation::Contains(existing) | Relation::Overlaps(existing) => {
                return Err(RegCacheError::Overlap {
                    start: base,
                    end,
                    existing_start: existing.start(),
                    existing_end: existing.end(),
                });
            }
        }

        let entry = Arc::new(RegisteredRange::register(domain, base, len, iov_limit)?);
        writer.apply("register", |index| {
            index.insert(Arc::clone(&entry));
        })?;
        log::debug!(
            "registered [{base:#x}, {end:#x}) len={len} iov_limit={iov_limit}, {} ranges",
            writer.staging().len()
        );
        Ok(entry)
    }

    /// Registers each `(bases[i], lens[i])` in order, stopping at the first
    /// failure. Ranges registered before the failure stay registered.
    pub fn register_batch<D>(
        &self,
        bases: &[u64],
        lens: &[usize],
        domain: &D,
        iov_limit: usize,
    ) -> Result<usize>
    where
        D: RegistrationDomain<Region = R> + ?Sized,
    {
        if bases.len() != lens.len() {
            return Err(RegCacheError::BatchLengthMismatch {
                bases: bases.len(),
                lens: lens.len(),
            });
        }
        for (base, len) in bases.iter().copied().zip(lens.iter().copied()) {
            self.register(base, len, domain, iov_limit)?;
        }
        Ok(bases.len())
    }

    /// Removes the range registered as exactly `[base, base + len)`.
    ///
    /// Returns `Ok(false)` and changes nothing when no such range exists. The
    /// registration is released once the last lookup result holding it is
    /// dropped.
    pub fn deregister(&self, base: u64, len: usize) -> Result<bool> {
        let Some(end) = base.checked_add(len as u64) else {
            log::debug!("deregister of wrapping range at {base:#x} len={len} ignored");
            return Ok(false);
        };
        self.ensure_not_reading()?;

        let mut writer = self.publisher.lock();
        let Some(entry) = writer.staging().get(base).cloned() else {
            log::debug!("deregister [{base:#x}, {end:#x}) ignored: not registered");
            return Ok(false);
        };
        if entry.end() != end {
            log::debug!(
                "deregister [{base:#x}, {end:#x}) ignored: registered range is [{:#x}, {:#x})",
                entry.start(),
                entry.end()
            );
            return Ok(false);
        }

        writer.apply("deregister", |index| {
            index.remove(base);
        })?;
        log::debug!(
            "deregistered local buffer [{base:#x}, {end:#x}), {} ranges",
            writer.staging().len()
        );
        drop(writer);
        drop(entry);
        Ok(true)
    }

    /// Deregisters every range. Returns how many were removed.
    pub fn clear(&self) -> Result<usize> {
        self.ensure_not_reading()?;
        let mut writer = self.publisher.lock();
        let removed = writer.staging().len();
        if removed == 0 {
            return Ok(0);
        }
        writer.apply("clear", |index| index.clear())?;
        log::debug!("cleared {removed} local buffer registrations");
        Ok(removed)
    }

    /// Resolves `[addr, addr + size)` to the range containing it, or `None`
    /// if no single registered range covers it.
    pub fn lookup(&self, addr: u64, size: usize) -> Option<Arc<RegisteredRange<R>>> {
        let end = addr.checked_add(size as u64)?;
        self.publisher.read(|index| match index.classify(addr, end) {
            Ok(Relation::Contains(entry)) => Some(Arc::clone(entry)),
            _ => None,
        })
    }

    /// Like [`lookup`](Self::lookup), but hands the descriptor slots to `f`
    /// without taking a reference on the range.
    pub fn with_descriptors<T>(
        &self,
        addr: u64,
        size: usize,
        f: impl FnOnce(&[R::Descriptor]) -> T,
    ) -> Option<T> {
        let end = addr.checked_add(size as u64)?;
        self.publisher.read(|index| match index.classify(addr, end) {
            Ok(Relation::Contains(entry)) => Some(f(entry.descriptors())),
            _ => None,
        })
    }

    /// How `[start, end)` relates to the registered ranges.
    pub fn query(&self, start: u64, end: u64) -> Result<Overlap> {
        self.publisher
            .read(|index| index.classify(start, end).map(|relation| relation.to_overlap()))
    }

    pub fn len(&self) -> usize {
        self.publisher.read(|index| index.len())
    }

    pub fn is_empty(&self) -> bool {
        self.publisher.read(|index| index.is_empty())
    }

    /// Registered `(start, end)` pairs in address order.
    pub fn ranges(&self) -> Vec<(u64, u64)> {
        self.publisher.read(|index| {
            index
                .entries()
                .map(|entry| (entry.start(), entry.end()))
                .collect()
        })
    }

    pub fn num_copies(&self) -> usize {
        self.publisher.num_copies()
    }

    /// Threads currently holding a read tracker for this cache.
    pub fn tracker_count(&self) -> usize {
        self.publisher.tracker_count()
    }

    fn ensure_not_reading(&self) -> Result<()> {
        if tracker::is_reading(self.publisher.id()) {
            return Err(RegCacheError::InvalidArgument(
                "cannot modify the registration cache from inside a lookup",
            ));
        }
        Ok(())
    }
}

impl<R: MemoryRegion> Default for RegistrationCache<R> {
    fn default() -> Self {
        Self {
            publisher: Arc::new(Publisher::new(RegCacheConfig::global())),
        }
    }
}

impl<R: MemoryRegion> Clone for RegistrationCache<R> {
    fn clone(&self) -> Self {
        Self {
            publisher: Arc::clone(&self.publisher),
        }
    }
}

impl<R: MemoryRegion> fmt::Debug for RegistrationCache<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistrationCache")
            .field("ranges", &self.len())
            .field("num_copies", &self.num_copies())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::RegistrationCache;
    use crate::{
        error::RegCacheError,
        index::Overlap,
        loopback::{LoopbackDomain, LoopbackRegion},
    };

    fn cache() -> RegistrationCache<LoopbackRegion> {
        RegistrationCache::with_copies(2).expect("valid config")
    }

    #[test]
    fn register_lookup_deregister_scenario() {
        let cache = cache();
        let domain = LoopbackDomain::new();

        let entry = cache
            .register(0x1000, 0x1000, &domain, 2)
            .expect("register");
        let found = cache.lookup(0x1800, 0x100).expect("contained");
        assert_eq!(found.start(), 0x1000);
        assert_eq!(found.descriptors(), entry.descriptors());
        drop(found);

        // Overlaps the end of the range: not usable for a transfer.
        assert!(cache.lookup(0x1F80, 0x100).is_none());

        let err = cache
            .register(0x1800, 0x1000, &domain, 2)
            .expect_err("overlap");
        assert_eq!(
            err,
            RegCacheError::Overlap {
                start: 0x1800,
                end: 0x2800,
                existing_start: 0x1000,
                existing_end: 0x2000,
            }
        );

        assert_eq!(cache.deregister(0x1000, 0x1000), Ok(true));
        assert!(cache.lookup(0x1800, 0x100).is_none());
        drop(entry);
        assert_eq!(domain.live_regions(), 0);
    }

    #[test]
    fn invalid_ranges_fail() {
        let cache = cache();
        let domain = LoopbackDomain::new();
        assert_eq!(
            cache.register(5, 0, &domain, 1).expect_err("empty"),
            RegCacheError::InvalidRange { start: 5, end: 5 }
        );
        assert_eq!(cache.query(10, 3), Err(RegCacheError::InvalidRange { start: 10, end: 3 }));
        assert!(matches!(
            cache.register(u64::MAX - 8, 64, &domain, 1),
            Err(RegCacheError::InvalidRange { .. })
        ));
        assert_eq!(
            cache.register(0x1000, 64, &domain, 0).expect_err("no iov slots"),
            RegCacheError::InvalidArgument("iov_limit must be non-zero")
        );
        assert_eq!(domain.live_regions(), 0);
    }

    #[test]
    fn nested_registration_is_rejected() {
        let cache = cache();
        let domain = LoopbackDomain::new();
        cache.register(0x1000, 0x1000, &domain, 1).expect("outer");
        let err = cache
            .register(0x1400, 0x100, &domain, 1)
            .expect_err("contained range");
        assert!(matches!(err, RegCacheError::Overlap { .. }));
        assert_eq!(cache.len(), 1);
        assert_eq!(domain.live_regions(), 1);
    }

    #[test]
    fn deregister_requires_exact_match() {
        let cache = cache();
        let domain = LoopbackDomain::new();
        cache.register(0x1000, 0x1000, &domain, 1).expect("register");

        assert_eq!(cache.deregister(0x1000, 0x800), Ok(false));
        assert_eq!(cache.deregister(0x1800, 0x800), Ok(false));
        assert_eq!(cache.deregister(0x9000, 0x10), Ok(false));
        assert_eq!(cache.deregister(u64::MAX, 2), Ok(false));
        assert_eq!(cache.len(), 1);

        assert_eq!(cache.deregister(0x1000, 0x1000), Ok(true));
        assert_eq!(cache.deregister(0x1000, 0x1000), Ok(false));
        assert!(cache.is_empty());
    }

    #[test]
    fn lookup_result_keeps_registration_alive() {
        let cache = cache();
        let domain = LoopbackDomain::new();
        drop(cache.register(0x1000, 0x1000, &domain, 1).expect("register"));

        let held = cache.lookup(0x1000, 0x10).expect("registered");
        assert!(cache.deregister(0x1000, 0x1000).expect("deregister"));
        assert_eq!(domain.live_regions(), 1);
        drop(held);
        assert_eq!(domain.live_regions(), 0);
    }

    #[test]
    fn with_descriptors_sees_iov_slots() {
        let cache = cache();
        let domain = LoopbackDomain::new();
        let entry = cache.register(0x4000, 0x1000, &domain, 3).expect("register");
        let key = entry.region().key();

        let slots = cache
            .with_descriptors(0x4000, 0x1000, |descs| descs.to_vec())
            .expect("registered");
        assert_eq!(slots, vec![key; 3]);
        assert!(cache.with_descriptors(0x3FFF, 2, |_| ()).is_none());
        assert!(cache.with_descriptors(0x4000, 0, |_| ()).is_none());
    }

    #[test]
    fn mutation_inside_lookup_is_rejected() {
        let cache = cache();
        let domain = LoopbackDomain::new();
        cache.register(0x1000, 0x1000, &domain, 1).expect("register");

        let result = cache
            .with_descriptors(0x1000, 0x10, |_| {
                (
                    cache.register(0x8000, 0x10, &domain, 1),
                    cache.deregister(0x1000, 0x1000),
                    // Nested reads are fine.
                    cache.lookup(0x1000, 0x10).is_some(),
                )
            })
            .expect("registered");
        assert!(matches!(result.0, Err(RegCacheError::InvalidArgument(_))));
        assert!(matches!(result.1, Err(RegCacheError::InvalidArgument(_))));
        assert!(result.2);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn batch_register_and_clear() {
        let cache = cache();
        let domain = LoopbackDomain::new();

        let err = cache
            .register_batch(&[0x1000, 0x2000], &[0x100], &domain, 1)
            .expect_err("mismatch");
        assert_eq!(err, RegCacheError::BatchLengthMismatch { bases: 2, lens: 1 });

        let registered = cache
            .register_batch(&[0x3000, 0x1000, 0x2000], &[0x100, 0x100, 0x100], &domain, 1)
            .expect("batch");
        assert_eq!(registered, 3);
        assert_eq!(
            cache.ranges(),
            vec![(0x1000, 0x1100), (0x2000, 0x2100), (0x3000, 0x3100)]
        );

        let err = cache
            .register_batch(&[0x5000, 0x2080], &[0x100, 0x100], &domain, 1)
            .expect_err("second overlaps");
        assert!(matches!(err, RegCacheError::Overlap { .. }));
        assert_eq!(cache.len(), 4);

        assert_eq!(cache.clear(), Ok(4));
        assert_eq!(cache.clear(), Ok(0));
        assert!(cache.is_empty());
        assert_eq!(domain.live_regions(), 0);
    }

    #[test]
    fn registration_failure_leaves_cache_untouched() {
        let cache = cache();
        let domain = LoopbackDomain::with_limit(1);
        cache.register(0x1000, 0x100, &domain, 1).expect("first");
        let err = cache
            .register(0x2000, 0x100, &domain, 1)
            .expect_err("exhausted");
        assert!(matches!(err, RegCacheError::Registration { start: 0x2000, len: 0x100, .. }));
        assert_eq!(cache.ranges(), vec![(0x1000, 0x1100)]);
    }

    #[test]
    fn query_reports_relationship() {
        let cache = cache();
        let domain = LoopbackDomain::new();
        cache.register(0x1000, 0x1000, &domain, 1).expect("register");
        assert_eq!(
            cache.query(0x1800, 0x1900),
            Ok(Overlap::Contains {
                start: 0x1000,
                end: 0x2000
            })
        );
        assert_eq!(
            cache.query(0x1F00, 0x2100),
            Ok(Overlap::Overlaps {
                start: 0x1000,
                end: 0x2000
            })
        );
        assert_eq!(cache.query(0x2000, 0x2100), Ok(Overlap::None));
    }

    #[test]
    fn independent_caches_do_not_share_state() {
        let first = cache();
        let second = RegistrationCache::with_copies(3).expect("valid config");
        let domain = LoopbackDomain::new();
        first.register(0x1000, 0x100, &domain, 1).expect("first");
        second.register(0x1000, 0x100, &domain, 1).expect("second");
        assert_eq!(second.num_copies(), 3);
        assert!(first.deregister(0x1000, 0x100).expect("deregister"));
        assert!(first.lookup(0x1000, 0x10).is_none());
        assert!(second.lookup(0x1000, 0x10).is_some());
    }

    #[test]
    fn rejects_too_few_copies() {
        assert!(matches!(
            RegistrationCache::<LoopbackRegion>::with_copies(1),
            Err(RegCacheError::InvalidArgument(_))
        ));
    }
}
