//! Process-wide tuning for the registration cache.
//!
//! The values are read from the environment once, the first time
//! [`RegCacheConfig::global`] is called, and never change afterwards. Tests
//! and embedders that need several independent caches build a config
//! explicitly instead.

use std::sync::OnceLock;

use crate::error::{RegCacheError, Result};

/// Number of physical index copies kept in sync.
pub const ENV_COPIES: &str = "PEGAFLOW_REGCACHE_COPIES";
/// Poll iterations between `yield_now` calls while a writer waits for readers.
pub const ENV_SPIN_YIELD: &str = "PEGAFLOW_REGCACHE_SPIN_YIELD";

pub const DEFAULT_NUM_COPIES: usize = 2;
pub const MIN_NUM_COPIES: usize = 2;
pub const DEFAULT_SPIN_YIELD_INTERVAL: u32 = 1000;

static GLOBAL: OnceLock<RegCacheConfig> = OnceLock::new();

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegCacheConfig {
    /// Physical copies of the range index. Must be at least two so a writer
    /// always has an unpublished copy to mutate.
    pub num_copies: usize,
    /// How many polls of a reader's sequence counter a writer spins through
    /// before yielding the processor.
    pub spin_yield_interval: u32,
}

impl Default for RegCacheConfig {
    fn default() -> Self {
        Self {
            num_copies: DEFAULT_NUM_COPIES,
            spin_yield_interval: DEFAULT_SPIN_YIELD_INTERVAL,
        }
    }
}

impl RegCacheConfig {
    pub fn new(num_copies: usize, spin_yield_interval: u32) -> Result<Self> {
        let config = Self {
            num_copies,
            spin_yield_interval,
        };
        config.validate()?;
        Ok(config)
    }

    /// Shorthand for the default config with a different copy count.
    pub fn with_copies(num_copies: usize) -> Result<Self> {
        Self::new(num_copies, DEFAULT_SPIN_YIELD_INTERVAL)
    }

    pub fn validate(&self) -> Result<()> {
        if self.num_copies < MIN_NUM_COPIES {
            return Err(RegCacheError::InvalidArgument(
                "num_copies must be at least 2",
            ));
        }
        if self.spin_yield_interval == 0 {
            return Err(RegCacheError::InvalidArgument(
                "spin_yield_interval must be non-zero",
            ));
        }
        Ok(())
    }

    /// Builds a config from the environment. Bad values are logged and
    /// replaced by defaults rather than failing startup.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// The process-wide config, resolved from the environment on first use.
    pub fn global() -> &'static RegCacheConfig {
        GLOBAL.get_or_init(Self::from_env)
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let num_copies = parse_var(&lookup, ENV_COPIES, defaults.num_copies)
            .filter(|copies| *copies >= MIN_NUM_COPIES)
            .unwrap_or_else(|| {
                log::warn!(
                    "{ENV_COPIES} must be an integer >= {MIN_NUM_COPIES}, using {}",
                    defaults.num_copies
                );
                defaults.num_copies
            });
        let spin_yield_interval =
            parse_var(&lookup, ENV_SPIN_YIELD, defaults.spin_yield_interval)
                .filter(|interval| *interval > 0)
                .unwrap_or_else(|| {
                    log::warn!(
                        "{ENV_SPIN_YIELD} must be a positive integer, using {}",
                        defaults.spin_yield_interval
                    );
                    defaults.spin_yield_interval
                });
        Self {
            num_copies,
            spin_yield_interval,
        }
    }
}

/// `Some(default)` when unset, `None` when set but unparsable.
fn parse_var<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
    default: T,
) -> Option<T> {
    match lookup(name) {
        None => Some(default),
        Some(raw) => {
            let trimmed = raw.trim();
            if trimmed.is_empty() {
                Some(default)
            } else {
                trimmed.parse().ok()
            }
        }
    }
}
