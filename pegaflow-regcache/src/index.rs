use std::{collections::BTreeMap, sync::Arc};

use crate::{
    domain::MemoryRegion,
    error::{RegCacheError, Result},
    region::RegisteredRange,
};

/// How a query range relates to the registered ranges.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Overlap {
    /// Touches no registered range.
    None,
    /// Lies entirely inside the registered range `[start, end)`.
    Contains { start: u64, end: u64 },
    /// Intersects `[start, end)` without being contained by it.
    Overlaps { start: u64, end: u64 },
}

/// Borrowing form of [`Overlap`] used internally, pointing at the entry.
pub(crate) enum Relation<'a, R: MemoryRegion> {
    Disjoint,
    Contains(&'a Arc<RegisteredRange<R>>),
    Overlaps(&'a Arc<RegisteredRange<R>>),
}

impl<R: MemoryRegion> Relation<'_, R> {
    pub(crate) fn to_overlap(&self) -> Overlap {
        match self {
            Relation::Disjoint => Overlap::None,
            Relation::Contains(entry) => Overlap::Contains {
                start: entry.start(),
                end: entry.end(),
            },
            Relation::Overlaps(entry) => Overlap::Overlaps {
                start: entry.start(),
                end: entry.end(),
            },
        }
    }
}

/// One physical copy of the start-address ordered range map. Entries never
/// overlap; that is enforced by the cache before inserting.
pub(crate) struct RangeIndex<R: MemoryRegion> {
    ranges: BTreeMap<u64, Arc<RegisteredRange<R>>>,
}

impl<R: MemoryRegion> Default for RangeIndex<R> {
    fn default() -> Self {
        Self {
            ranges: BTreeMap::new(),
        }
    }
}

impl<R: MemoryRegion> RangeIndex<R> {
    pub(crate) fn len(&self) -> usize {
        self.ranges.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub(crate) fn get(&self, start: u64) -> Option<&Arc<RegisteredRange<R>>> {
        self.ranges.get(&start)
    }

    pub(crate) fn insert(
        &mut self,
        entry: Arc<RegisteredRange<R>>,
    ) -> Option<Arc<RegisteredRange<R>>> {
        self.ranges.insert(entry.start(), entry)
    }

    pub(crate) fn remove(&mut self, start: u64) -> Option<Arc<RegisteredRange<R>>> {
        self.ranges.remove(&start)
    }

    pub(crate) fn clear(&mut self) {
        self.ranges.clear();
    }

    pub(crate) fn entries(&self) -> impl Iterator<Item = &Arc<RegisteredRange<R>>> {
        self.ranges.values()
    }

    /// Classifies `[start, end)` against the index.
    ///
    /// Only the entry starting at or just before `start` can contain the
    /// query, and only it or the first entry after `start` can overlap it,
    /// so at most two neighbours are inspected.
    pub(crate) fn classify(&self, start: u64, end: u64) -> Result<Relation<'_, R>> {
        if start >= end {
            return Err(RegCacheError::InvalidRange { start, end });
        }

        let candidate = match self.ranges.range(start..).next() {
            None => self.ranges.range(..start).next_back(),
            Some((&key, entry)) if start < key => {
                if end > key {
                    // Begins before this entry but runs into it.
                    return Ok(Relation::Overlaps(entry));
                }
                match self.ranges.range(..start).next_back() {
                    // Ends before the first entry.
                    None => return Ok(Relation::Disjoint),
                    previous => previous,
                }
            }
            exact => exact,
        };

        // Empty index.
        let Some((_, entry)) = candidate else {
            return Ok(Relation::Disjoint);
        };

        // entry.start() <= start from here on.
        if end <= entry.end() {
            Ok(Relation::Contains(entry))
        } else if start < entry.end() {
            Ok(Relation::Overlaps(entry))
        } else {
            Ok(Relation::Disjoint)
        }
    }
}
