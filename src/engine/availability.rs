use crate::model::DateRange;

use super::EngineError;

// ── Availability Set ──────────────────────────────────────────────

/// The free date ranges of one listing.
///
/// Always in normal form: sorted by start, pairwise non-overlapping and
/// non-adjacent. Every mutation either fails leaving the set untouched or
/// completes with the set re-normalized.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AvailabilitySet {
    ranges: Vec<DateRange>,
}

impl AvailabilitySet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a set from arbitrary ranges, fusing whatever overlaps or touches.
    pub fn from_ranges(ranges: impl IntoIterator<Item = DateRange>) -> Self {
        Self {
            ranges: merge_fusible(ranges.into_iter().collect()),
        }
    }

    pub fn ranges(&self) -> &[DateRange] {
        &self.ranges
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Open new dates. Refuses anything identical to or overlapping an existing
    /// free range; fuses with adjacent neighbours.
    pub fn add(&mut self, range: DateRange) -> Result<(), EngineError> {
        for existing in &self.ranges {
            if range.is_identical(existing) {
                return Err(EngineError::DuplicateRange(range));
            }
            if range.overlaps(existing) {
                return Err(EngineError::Overlap {
                    requested: range,
                    existing: *existing,
                });
            }
        }
        self.insert_and_normalize(range);
        Ok(())
    }

    /// Index of the free range that fully contains `range`, if any.
    pub fn find_containing(&self, range: &DateRange) -> Option<usize> {
        // Ranges are sorted and disjoint: only the last one starting on or
        // before `range.start` can contain it.
        let idx = self
            .ranges
            .partition_point(|r| r.start() <= range.start())
            .checked_sub(1)?;
        self.ranges[idx].contains(range).then_some(idx)
    }

    /// Remove `range` from the free set, splitting its containing range into
    /// at most two remainders.
    pub fn carve(&mut self, range: DateRange) -> Result<(), EngineError> {
        let idx = self
            .find_containing(&range)
            .ok_or(EngineError::UnavailableRange(range))?;
        let free = self.ranges[idx];

        let left = range
            .start()
            .pred_opt()
            .and_then(|last| DateRange::new(free.start(), last));
        let right = range
            .end()
            .succ_opt()
            .and_then(|first| DateRange::new(first, free.end()));

        // Remainders stay at least one day away from the neighbours because
        // `free` already was.
        self.ranges.splice(idx..=idx, left.into_iter().chain(right));
        Ok(())
    }

    /// Put a previously carved range back. Overlap here means the listing's
    /// bookkeeping is already broken.
    pub fn restore(&mut self, range: DateRange) -> Result<(), EngineError> {
        if let Some(existing) = self.ranges.iter().find(|r| r.overlaps(&range)) {
            return Err(EngineError::FatalConsistency {
                restored: range,
                existing: *existing,
            });
        }
        self.insert_and_normalize(range);
        Ok(())
    }

    /// Fuse any overlapping or adjacent ranges. A no-op on a set that is
    /// already in normal form.
    pub fn normalize(&mut self) {
        let ranges = std::mem::take(&mut self.ranges);
        self.ranges = merge_fusible(ranges);
    }

    fn insert_and_normalize(&mut self, range: DateRange) {
        let pos = self.ranges.partition_point(|r| r.start() < range.start());
        self.ranges.insert(pos, range);
        self.fuse_around(pos);
    }

    /// Fuse the range at `pos` with its neighbours. Only the inserted range can
    /// break normal form, so at most one fuse per side is needed.
    fn fuse_around(&mut self, mut pos: usize) {
        if pos > 0 && self.ranges[pos - 1].is_fusible_with(&self.ranges[pos]) {
            let consumed = self.ranges.remove(pos);
            pos -= 1;
            self.ranges[pos].fuse_with(&consumed);
        }
        while pos + 1 < self.ranges.len() && self.ranges[pos].is_fusible_with(&self.ranges[pos + 1]) {
            let consumed = self.ranges.remove(pos + 1);
            self.ranges[pos].fuse_with(&consumed);
        }
    }
}

/// Sort by start and merge overlapping/adjacent ranges in one pass.
pub fn merge_fusible(mut ranges: Vec<DateRange>) -> Vec<DateRange> {
    ranges.sort_by_key(|r| r.start());
    let mut merged: Vec<DateRange> = Vec::with_capacity(ranges.len());
    for range in ranges {
        if let Some(last) = merged.last_mut()
            && last.is_fusible_with(&range) {
                last.fuse_with(&range);
                continue;
            }
        merged.push(range);
    }
    merged
}
