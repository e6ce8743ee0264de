//! The extent ledger: bookkeeping for every byte of sound RAM.
//!
//! The sound RAM itself is never touched from here. The ledger only records
//! which `[address, address + size)` ranges are handed out and which are free,
//! and it lives entirely in main memory.

use alloc::vec::Vec;
use core::fmt;
use core::ops::Range;

use log::{debug, trace};
use static_assertions::const_assert;

use crate::error::PoolError;

/// Every extent address and size is a multiple of this many bytes.
pub const ALIGNMENT: u32 = 32;
const_assert!(ALIGNMENT.is_power_of_two());

/// Round `value` up to the nearest multiple of [`ALIGNMENT`].
///
/// Returns `None` if the rounded value does not fit in a `u32`.
pub const fn align_up(value: u32) -> Option<u32> {
    match value.checked_add(ALIGNMENT - 1) {
        Some(v) => Some(v & !(ALIGNMENT - 1)),
        None => None,
    }
}

/// Round `value` down to the nearest multiple of [`ALIGNMENT`].
pub const fn align_down(value: u32) -> u32 {
    value & !(ALIGNMENT - 1)
}

/// A contiguous range of sound RAM, either handed out or free.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extent {
    /// Offset of the first byte from the start of sound RAM.
    pub address: u32,
    /// Size in bytes.
    pub size: u32,
    /// Whether the extent is currently allocated.
    pub in_use: bool,
}

impl Extent {
    const fn free(address: u32, size: u32) -> Self {
        Extent {
            address,
            size,
            in_use: false,
        }
    }

    /// One past the last byte covered.
    ///
    /// Computed in 64 bits so a corrupt record can't wrap around.
    pub fn end(&self) -> u64 {
        u64::from(self.address) + u64::from(self.size)
    }

    pub fn as_range(&self) -> Range<u64> {
        u64::from(self.address)..self.end()
    }

    pub fn is_free(&self) -> bool {
        !self.in_use
    }

    fn relation(&self, other: &Self) -> Relation {
        let self_range = self.as_range();
        let other_range = other.as_range();

        if self_range.end < other_range.start {
            Relation::Before
        } else if self_range.end == other_range.start {
            Relation::AdjacentBefore
        } else if self_range.start < other_range.end {
            Relation::Overlapping
        } else if self_range.start == other_range.end {
            Relation::AdjacentAfter
        } else {
            Relation::After
        }
    }
}

impl fmt::Display for Extent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = if self.in_use { "in-use" } else { "unused" };
        write!(f, "{}({:#010x}, {})", state, self.address, self.size)
    }
}

/// How two extents sit relative to each other in address order.
enum Relation {
    Before,
    AdjacentBefore,
    Overlapping,
    AdjacentAfter,
    After,
}

/// `Validity` counts every broken ledger invariant found by
/// [`Ledger::stats`]. A healthy ledger has all zeros.
#[derive(Default, Debug, PartialEq, Eq)]
pub struct Validity {
    /// Holes between consecutive extents, plus a hole at either end of the
    /// managed range.
    pub gaps: usize,
    /// Extents claiming the same bytes as their predecessor.
    pub overlaps: usize,
    /// Extents whose address is lower than their predecessor's.
    pub out_of_orders: usize,
    /// Extents with an address or size that is not a multiple of
    /// [`ALIGNMENT`], or with a size of zero.
    pub misaligned: usize,
    /// Pairs of neighbouring extents that are both free and should have been
    /// merged.
    pub adjacent_free: usize,
    /// Whether the sizes add up to something other than the managed range.
    pub size_mismatch: bool,
}

impl Validity {
    /// Returns a boolean - a simple check if all cases are 0
    pub fn is_valid(&self) -> bool {
        self.gaps == 0
            && self.overlaps == 0
            && self.out_of_orders == 0
            && self.misaligned == 0
            && self.adjacent_free == 0
            && !self.size_mismatch
    }
}

impl From<Validity> for bool {
    fn from(v: Validity) -> bool {
        v.is_valid()
    }
}

#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stats {
    /// Number of records in the ledger.
    pub extents: usize,
    pub free_extents: usize,
    pub free_bytes: u64,
    pub used_bytes: u64,
    /// Size of the largest free extent.
    pub largest_free: u32,
}

/// An address-ordered list of extents covering `[base, end)` with no gaps.
///
/// It maintains a few internal invariants:
///
/// - Each extent starts where the previous one ends; the first starts at
///   `base` and the last ends at `end`.
/// - Every address and size is a multiple of [`ALIGNMENT`].
/// - After a release, no two neighbouring extents are both free.
#[derive(Debug)]
pub struct Ledger {
    extents: Vec<Extent>,
    base: u32,
    end: u32,
    max_extents: Option<usize>,
}

impl Ledger {
    /// Create a ledger holding one free extent spanning `[base, end)`.
    ///
    /// `max_extents` caps how many records the ledger may ever hold. Both
    /// bounds must be multiples of [`ALIGNMENT`] with `base < end`.
    pub fn new(base: u32, end: u32, max_extents: Option<usize>) -> Result<Self, PoolError> {
        for value in [base, end] {
            if value % ALIGNMENT != 0 {
                return Err(PoolError::Misaligned { value });
            }
        }
        if base >= end {
            return Err(PoolError::ReserveTooLarge {
                reserve: base,
                capacity: end,
            });
        }

        let mut ledger = Ledger {
            extents: Vec::new(),
            base,
            end,
            max_extents,
        };
        ledger.reserve_record()?;
        ledger.extents.push(Extent::free(base, end - base));
        Ok(ledger)
    }

    /// Make room for one more record, without changing anything else.
    fn reserve_record(&mut self) -> Result<(), PoolError> {
        if let Some(max) = self.max_extents {
            if self.extents.len() >= max {
                return Err(PoolError::OutOfControlMemory);
            }
        }
        self.extents
            .try_reserve(1)
            .map_err(|_| PoolError::OutOfControlMemory)
    }

    /// First managed offset.
    pub fn base(&self) -> u32 {
        self.base
    }

    /// One past the last managed offset.
    pub fn end(&self) -> u32 {
        self.end
    }

    pub fn len(&self) -> usize {
        self.extents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.extents.is_empty()
    }

    pub fn iter(&self) -> core::slice::Iter<'_, Extent> {
        self.extents.iter()
    }

    /// Index of the extent that starts exactly at `address`, if any.
    fn position(&self, address: u32) -> Option<usize> {
        self.extents
            .binary_search_by_key(&address, |e| e.address)
            .ok()
    }

    /// Find the smallest free extent of at least `size` bytes.
    ///
    /// Every extent is visited, in address order, and only a strictly smaller
    /// candidate replaces the current best, so ties go to the lowest address.
    fn best_fit(&self, size: u32) -> Option<usize> {
        let mut best: Option<(usize, u32)> = None;
        for (index, extent) in self.extents.iter().enumerate() {
            if extent.in_use || extent.size < size {
                continue;
            }
            trace!("  candidate {} for {} bytes", extent, size);
            match best {
                Some((_, best_size)) if best_size <= extent.size => {}
                _ => best = Some((index, extent.size)),
            }
        }
        best.map(|(index, _)| index)
    }

    /// Hand out an extent of exactly `size` bytes and return its address.
    ///
    /// `size` must already be a non-zero multiple of [`ALIGNMENT`]. On error
    /// the ledger is unchanged.
    pub fn allocate(&mut self, size: u32) -> Result<u32, PoolError> {
        if size == 0 || size % ALIGNMENT != 0 {
            return Err(PoolError::Misaligned { value: size });
        }

        let index = self.best_fit(size).ok_or_else(|| PoolError::OutOfSpace {
            requested: size,
            largest: self.largest_free(),
        })?;

        let best = self.extents[index];
        if best.size == size {
            debug!(
                "allocating perfect-fit at {:#010x} for size {}",
                best.address, best.size
            );
            self.extents[index].in_use = true;
            return Ok(best.address);
        }

        // The remainder needs a record of its own; get it before touching the
        // chosen extent so a failure leaves nothing to undo.
        self.reserve_record()?;
        let remainder = Extent::free(best.address + size, best.size - size);
        debug!(
            "allocating block {:#010x} for size {}, and leaving {} at {:#010x}",
            best.address, size, remainder.size, remainder.address
        );
        self.extents.insert(index + 1, remainder);

        let chosen = &mut self.extents[index];
        chosen.size = size;
        chosen.in_use = true;
        Ok(chosen.address)
    }

    /// Mark the extent starting at `address` free and merge it with free
    /// immediate neighbours.
    ///
    /// Only an in-use extent can be released; anything else is an
    /// [`InvalidFree`](PoolError::InvalidFree).
    pub fn release(&mut self, address: u32) -> Result<(), PoolError> {
        let mut index = self
            .position(address)
            .filter(|&index| self.extents[index].in_use)
            .ok_or(PoolError::InvalidFree { offset: address })?;

        debug!("freeing block at {:#010x}", address);
        self.extents[index].in_use = false;

        if index > 0 && self.extents[index - 1].is_free() {
            let absorbed = self.extents.remove(index);
            index -= 1;
            let previous = &mut self.extents[index];
            debug!("   coalescing with block at {:#010x}", previous.address);
            previous.size += absorbed.size;
        }

        if index + 1 < self.extents.len() && self.extents[index + 1].is_free() {
            let absorbed = self.extents.remove(index + 1);
            debug!("   coalescing with block at {:#010x}", absorbed.address);
            self.extents[index].size += absorbed.size;
        }

        Ok(())
    }

    /// Size of the largest free extent, or 0 if everything is in use.
    pub fn largest_free(&self) -> u32 {
        self.extents
            .iter()
            .filter(|e| e.is_free())
            .map(|e| e.size)
            .max()
            .unwrap_or(0)
    }

    /// Check every ledger invariant, and gather usage numbers along the way.
    pub fn stats(&self) -> (Validity, Stats) {
        let mut validity = Validity::default();
        let mut stats = Stats::default();

        let mut previous: Option<&Extent> = None;
        for extent in &self.extents {
            match previous.map(|p| p.relation(extent)) {
                Some(Relation::Before) => {
                    // Right order, but something is missing in between.
                    validity.gaps += 1;
                }
                Some(Relation::AdjacentBefore) => {
                    if previous.is_some_and(Extent::is_free) && extent.is_free() {
                        validity.adjacent_free += 1;
                    }
                }
                Some(Relation::Overlapping) => {
                    validity.overlaps += 1;
                }
                Some(Relation::AdjacentAfter | Relation::After) => {
                    validity.out_of_orders += 1;
                }
                None => {
                    if extent.address != self.base {
                        validity.gaps += 1;
                    }
                }
            }

            if extent.size == 0
                || extent.address % ALIGNMENT != 0
                || extent.size % ALIGNMENT != 0
            {
                validity.misaligned += 1;
            }

            stats.extents += 1;
            if extent.in_use {
                stats.used_bytes += u64::from(extent.size);
            } else {
                stats.free_extents += 1;
                stats.free_bytes += u64::from(extent.size);
                stats.largest_free = stats.largest_free.max(extent.size);
            }
            previous = Some(extent);
        }

        if previous.map_or(true, |last| last.end() != u64::from(self.end)) {
            validity.gaps += 1;
        }
        validity.size_mismatch =
            stats.free_bytes + stats.used_bytes != u64::from(self.end - self.base);

        (validity, stats)
    }
}

impl<'ledger> IntoIterator for &'ledger Ledger {
    type Item = &'ledger Extent;
    type IntoIter = core::slice::Iter<'ledger, Extent>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl fmt::Display for Ledger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Ledger(")?;
        let mut start = true;
        for extent in self {
            if !start {
                write!(f, ", ")?;
            } else {
                start = false;
            }
            write!(f, "{}", extent)?;
        }

        write!(f, ")")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use alloc::vec;
    use test_log::test;

    const MIB2: u32 = 2 * 1024 * 1024;

    fn snapshot(ledger: &Ledger) -> Vec<Extent> {
        ledger.iter().copied().collect()
    }

    fn assert_valid(ledger: &Ledger) {
        let (validity, _) = ledger.stats();
        log::info!("{}", ledger);
        assert!(validity.is_valid(), "{:?}", validity);
    }

    #[test]
    fn test_align() {
        assert_eq!(align_up(0), Some(0));
        assert_eq!(align_up(1), Some(32));
        assert_eq!(align_up(32), Some(32));
        assert_eq!(align_up(1000), Some(1024));
        assert_eq!(align_up(u32::MAX), None);
        assert_eq!(align_down(MIB2 + 31), MIB2);
    }

    #[test]
    fn test_split_and_perfect_fit() {
        let mut ledger = Ledger::new(0x1000, 0x2000, None).unwrap();
        assert_eq!(ledger.allocate(0x100), Ok(0x1000));
        assert_eq!(
            snapshot(&ledger),
            vec![
                Extent {
                    address: 0x1000,
                    size: 0x100,
                    in_use: true
                },
                Extent {
                    address: 0x1100,
                    size: 0xf00,
                    in_use: false
                },
            ]
        );
        assert_valid(&ledger);

        // Takes the rest of the ledger without creating another record.
        assert_eq!(ledger.allocate(0xf00), Ok(0x1100));
        assert_eq!(ledger.len(), 2);
        assert_eq!(ledger.largest_free(), 0);
        assert_valid(&ledger);
    }

    #[test]
    fn test_best_fit() {
        // Free extents of 128, 64 and 64 bytes (100, 50 and 40 rounded up),
        // separated by allocations.
        let mut ledger = Ledger::new(0, 0x1000, None).unwrap();
        let a = ledger.allocate(128).unwrap();
        let _keep1 = ledger.allocate(32).unwrap();
        let b = ledger.allocate(64).unwrap();
        let _keep2 = ledger.allocate(32).unwrap();
        let c = ledger.allocate(64).unwrap();
        let _keep3 = ledger.allocate(32).unwrap();
        ledger.release(a).unwrap();
        ledger.release(b).unwrap();
        ledger.release(c).unwrap();
        assert_valid(&ledger);

        // Both 64-byte holes fit perfectly; the lower address wins, and the
        // 128-byte hole is never split.
        assert_eq!(ledger.allocate(64), Ok(b));
        assert_eq!(ledger.allocate(64), Ok(c));
        assert_eq!(ledger.allocate(96), Ok(a));
        assert_valid(&ledger);
    }

    #[test]
    fn test_best_fit_scans_to_the_end() {
        // Holes of 128, 96 and 64 bytes in address order; the only perfect
        // fit is the last one.
        let mut ledger = Ledger::new(0, 0x1000, None).unwrap();
        let a = ledger.allocate(128).unwrap();
        let _keep1 = ledger.allocate(32).unwrap();
        let b = ledger.allocate(96).unwrap();
        let _keep2 = ledger.allocate(32).unwrap();
        let c = ledger.allocate(64).unwrap();
        let _keep3 = ledger.allocate(ledger.largest_free()).unwrap();
        ledger.release(a).unwrap();
        ledger.release(b).unwrap();
        ledger.release(c).unwrap();
        assert_valid(&ledger);
        let before = snapshot(&ledger);

        assert_eq!(ledger.allocate(64), Ok(c));
        // A perfect fit leaves the other holes alone.
        assert_eq!(ledger.len(), before.len());
        assert_eq!(ledger.allocate(96), Ok(b));
        assert_eq!(ledger.allocate(32), Ok(a));
        assert_valid(&ledger);
    }

    #[test]
    fn test_rejects_unaligned_requests() {
        let mut ledger = Ledger::new(0, 0x400, None).unwrap();
        let before = snapshot(&ledger);

        assert_eq!(ledger.allocate(33), Err(PoolError::Misaligned { value: 33 }));
        assert_eq!(ledger.allocate(0), Err(PoolError::Misaligned { value: 0 }));
        assert_eq!(snapshot(&ledger), before);
        assert_valid(&ledger);
    }

    #[test]
    fn test_rejects_bad_bounds() {
        assert_eq!(
            Ledger::new(0x100, 0x40, None).unwrap_err(),
            PoolError::ReserveTooLarge {
                reserve: 0x100,
                capacity: 0x40
            }
        );
        assert!(Ledger::new(0x40, 0x40, None)
            .unwrap_err()
            .is_reserve_too_large());
        assert_eq!(
            Ledger::new(0x21, 0x400, None).unwrap_err(),
            PoolError::Misaligned { value: 0x21 }
        );
        assert_eq!(
            Ledger::new(0, 0x401, None).unwrap_err(),
            PoolError::Misaligned { value: 0x401 }
        );
    }

    #[test]
    fn test_out_of_space_leaves_ledger() {
        let mut ledger = Ledger::new(0, 0x400, None).unwrap();
        ledger.allocate(0x100).unwrap();
        let before = snapshot(&ledger);
        assert_eq!(
            ledger.allocate(0x400),
            Err(PoolError::OutOfSpace {
                requested: 0x400,
                largest: 0x300
            })
        );
        assert_eq!(snapshot(&ledger), before);
    }

    #[test]
    fn test_record_limit_rolls_back() {
        let mut ledger = Ledger::new(0, 0x400, Some(2)).unwrap();
        assert_eq!(ledger.allocate(0x100), Ok(0));
        let before = snapshot(&ledger);

        // A split would need a third record.
        assert_eq!(ledger.allocate(0x100), Err(PoolError::OutOfControlMemory));
        assert_eq!(snapshot(&ledger), before);

        // A perfect fit needs no new record.
        assert_eq!(ledger.allocate(0x300), Ok(0x100));
        assert_valid(&ledger);
    }

    #[test]
    fn test_release_coalesces_both_ways() {
        let mut ledger = Ledger::new(0, 0x400, None).unwrap();
        let a = ledger.allocate(0x100).unwrap();
        let b = ledger.allocate(0x100).unwrap();
        let c = ledger.allocate(0x100).unwrap();

        ledger.release(a).unwrap();
        ledger.release(c).unwrap();
        // c merged forward with the tail.
        assert_eq!(ledger.len(), 3);
        assert_valid(&ledger);

        ledger.release(b).unwrap();
        assert_eq!(snapshot(&ledger), vec![Extent::free(0, 0x400)]);
    }

    #[test]
    fn test_invalid_release() {
        let mut ledger = Ledger::new(0, 0x400, None).unwrap();
        let a = ledger.allocate(0x100).unwrap();
        let before = snapshot(&ledger);

        assert_eq!(
            ledger.release(a + 32),
            Err(PoolError::InvalidFree { offset: a + 32 })
        );
        assert_eq!(snapshot(&ledger), before);
    }

    #[test]
    fn test_release_of_free_extent() {
        let mut ledger = Ledger::new(0x20, 0x420, None).unwrap();

        // The initial extent was never handed out.
        assert_eq!(
            ledger.release(0x20),
            Err(PoolError::InvalidFree { offset: 0x20 })
        );

        let a = ledger.allocate(0x100).unwrap();
        let before = snapshot(&ledger);

        // Neither was the remainder split off behind it.
        assert_eq!(
            ledger.release(0x120),
            Err(PoolError::InvalidFree { offset: 0x120 })
        );
        assert_eq!(snapshot(&ledger), before);

        ledger.release(a).unwrap();
        assert_eq!(
            ledger.release(a),
            Err(PoolError::InvalidFree { offset: a })
        );
        assert_eq!(snapshot(&ledger), vec![Extent::free(0x20, 0x400)]);
    }

    #[test]
    fn test_stats() {
        let mut ledger = Ledger::new(0x20, 0x420, None).unwrap();
        ledger.allocate(0x40).unwrap();
        let (validity, stats) = ledger.stats();
        assert!(validity.is_valid());
        assert_eq!(
            stats,
            Stats {
                extents: 2,
                free_extents: 1,
                free_bytes: 0x3c0,
                used_bytes: 0x40,
                largest_free: 0x3c0,
            }
        );
    }

    #[test]
    fn test_stats_catches_corruption() {
        let mut ledger = Ledger::new(0, 0x400, None).unwrap();
        ledger.extents.push(Extent::free(0x300, 0x10));
        let (validity, _) = ledger.stats();
        assert!(!validity.is_valid());
        assert_eq!(validity.overlaps, 1);
        assert_eq!(validity.misaligned, 1);
        assert!(validity.size_mismatch);
    }
}
