//! Registration cache for local RDMA buffers.
//!
//! Every put/get that touches local memory has to find the registration
//! covering that memory. [`RegistrationCache`] keeps those registrations in
//! an address-ordered index that is replicated into several physical copies
//! (see `publisher`), so lookups from any thread run without locks while
//! registration and deregistration happen concurrently on other threads.
//!
//! ```
//! use pegaflow_regcache::{LoopbackDomain, RegistrationCache};
//!
//! let cache = RegistrationCache::with_copies(2).unwrap();
//! let domain = LoopbackDomain::new();
//! cache.register(0x1000, 0x1000, &domain, 4).unwrap();
//!
//! let range = cache.lookup(0x1800, 0x100).unwrap();
//! assert_eq!(range.descriptors().len(), 4);
//! assert!(cache.lookup(0x1F80, 0x100).is_none());
//!
//! assert!(cache.deregister(0x1000, 0x1000).unwrap());
//! ```

mod cache;
mod config;
mod domain;
mod error;
mod index;
mod logging;
mod loopback;
mod publisher;
mod region;
#[cfg(feature = "rdma")]
mod sideway_domain;
mod tracker;

pub use cache::RegistrationCache;
pub use config::{
    DEFAULT_NUM_COPIES, DEFAULT_SPIN_YIELD_INTERVAL, ENV_COPIES, ENV_SPIN_YIELD, MIN_NUM_COPIES,
    RegCacheConfig,
};
pub use domain::{AccessFlags, MemoryRegion, RegistrationDomain};
pub use error::{RegCacheError, Result};
pub use index::Overlap;
pub use loopback::{LoopbackDomain, LoopbackError, LoopbackKey, LoopbackRegion};
pub use region::RegisteredRange;
#[cfg(feature = "rdma")]
pub use sideway_domain::{SidewayDomain, SidewayDomainError, VerbsKey, VerbsRegion};

/// Installs the stderr logger, filtered by `RUST_LOG` or
/// `info,pegaflow_regcache=debug`. Does nothing if a logger is already set.
pub fn init_logging() {
    logging::ensure_initialized();
}

/// Like [`init_logging`], with a custom filter used when `RUST_LOG` is unset.
pub fn init_logging_with(default_filter: &str) {
    logging::ensure_initialized_with(default_filter);
}
