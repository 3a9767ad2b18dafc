//! Software registration domain for hosts without an RDMA NIC.
//!
//! Registrations are bookkeeping only: each one gets a fresh key and bumps a
//! live counter that drops back when the region is released. An optional
//! limit models a NIC running out of memory-region slots.

use std::sync::{
    Arc,
    atomic::{AtomicU32, AtomicUsize, Ordering},
};

use thiserror::Error;

use crate::domain::{AccessFlags, MemoryRegion, RegistrationDomain};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LoopbackError {
    #[error("region limit reached ({limit} live registrations)")]
    Exhausted { limit: usize },
    #[error("zero-length registration")]
    ZeroLength,
}

/// Local access key handed out by [`LoopbackDomain`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LoopbackKey(pub u32);

#[derive(Debug, Default)]
pub struct LoopbackDomain {
    next_key: AtomicU32,
    live: Arc<AtomicUsize>,
    limit: Option<usize>,
}

impl LoopbackDomain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails registrations once `limit` regions are live at the same time.
    pub fn with_limit(limit: usize) -> Self {
        Self {
            limit: Some(limit),
            ..Self::default()
        }
    }

    /// Registrations handed out and not yet dropped.
    pub fn live_regions(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    fn reserve_slot(&self) -> Result<(), LoopbackError> {
        let Some(limit) = self.limit else {
            self.live.fetch_add(1, Ordering::AcqRel);
            return Ok(());
        };
        self.live
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |live| {
                (live < limit).then_some(live + 1)
            })
            .map(|_| ())
            .map_err(|_| LoopbackError::Exhausted { limit })
    }
}

impl RegistrationDomain for LoopbackDomain {
    type Region = LoopbackRegion;
    type Error = LoopbackError;

    fn register_region(
        &self,
        base: u64,
        len: usize,
        access: AccessFlags,
    ) -> Result<LoopbackRegion, LoopbackError> {
        if len == 0 {
            return Err(LoopbackError::ZeroLength);
        }
        self.reserve_slot()?;
        // Keys wrap after u32::MAX registrations; live regions never get near that.
        let key = self.next_key.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        Ok(LoopbackRegion {
            base,
            len,
            access,
            key: LoopbackKey(key),
            live: Arc::clone(&self.live),
        })
    }
}

#[derive(Debug)]
pub struct LoopbackRegion {
    base: u64,
    len: usize,
    access: AccessFlags,
    key: LoopbackKey,
    live: Arc<AtomicUsize>,
}

impl LoopbackRegion {
    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn access(&self) -> AccessFlags {
        self.access
    }

    pub fn key(&self) -> LoopbackKey {
        self.key
    }
}

impl MemoryRegion for LoopbackRegion {
    type Descriptor = LoopbackKey;

    fn descriptor(&self) -> LoopbackKey {
        self.key
    }
}

impl Drop for LoopbackRegion {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::AcqRel);
    }
}
