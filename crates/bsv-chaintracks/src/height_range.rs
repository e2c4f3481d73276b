//! Inclusive block height intervals.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{ChaintracksError, Result};
use crate::header::BlockHeader;

/// An inclusive range of block heights. A range whose `max_height` is below
/// its `min_height` is empty; all empty ranges compare equal.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeightRange {
    /// Lowest height in the range.
    pub min_height: u32,
    /// Highest height in the range.
    pub max_height: u32,
}

impl HeightRange {
    /// Create the range `min_height..=max_height`.
    pub const fn new(min_height: u32, max_height: u32) -> Self {
        HeightRange { min_height, max_height }
    }

    /// The canonical empty range.
    pub const fn empty() -> Self {
        HeightRange { min_height: 1, max_height: 0 }
    }

    /// The range covering `count` heights starting at `first`.
    pub fn from_count(first: u32, count: u32) -> Self {
        if count == 0 {
            return Self::empty();
        }
        HeightRange::new(first, first + (count - 1))
    }

    /// The smallest range covering every header's height.
    pub fn from_headers(headers: &[BlockHeader]) -> Self {
        let min = headers.iter().map(|h| h.height).min();
        let max = headers.iter().map(|h| h.height).max();
        match (min, max) {
            (Some(min), Some(max)) => HeightRange::new(min, max),
            _ => Self::empty(),
        }
    }

    /// True if the range holds no heights.
    pub const fn is_empty(&self) -> bool {
        self.max_height < self.min_height
    }

    /// Number of heights in the range.
    pub const fn length(&self) -> u32 {
        if self.is_empty() {
            0
        } else {
            self.max_height - self.min_height + 1
        }
    }

    /// True if `height` falls within the range.
    pub const fn contains(&self, height: u32) -> bool {
        !self.is_empty() && height >= self.min_height && height <= self.max_height
    }

    /// True if every height of `other` falls within this range.
    pub fn contains_range(&self, other: &HeightRange) -> bool {
        other.is_empty()
            || (!self.is_empty()
                && other.min_height >= self.min_height
                && other.max_height <= self.max_height)
    }

    /// True if the ranges share at least one height.
    pub fn overlaps(&self, other: &HeightRange) -> bool {
        !self.intersect(other).is_empty()
    }

    /// Heights present in both ranges.
    pub fn intersect(&self, other: &HeightRange) -> HeightRange {
        if self.is_empty() || other.is_empty() {
            return Self::empty();
        }
        let min = self.min_height.max(other.min_height);
        let max = self.max_height.min(other.max_height);
        if max < min {
            Self::empty()
        } else {
            HeightRange::new(min, max)
        }
    }

    /// Heights present in either range.
    ///
    /// # Returns
    /// An error if the ranges are separated by a gap, since the result
    /// would not be a single interval.
    pub fn union(&self, other: &HeightRange) -> Result<HeightRange> {
        if self.is_empty() {
            return Ok(*other);
        }
        if other.is_empty() {
            return Ok(*self);
        }
        let gap_above = self.max_height.saturating_add(1) < other.min_height;
        let gap_below = other.max_height.saturating_add(1) < self.min_height;
        if gap_above || gap_below {
            return Err(ChaintracksError::HeightRange(format!(
                "union of {} and {} leaves a gap",
                self, other
            )));
        }
        Ok(HeightRange::new(
            self.min_height.min(other.min_height),
            self.max_height.max(other.max_height),
        ))
    }

    /// Heights in this range but not in `other`.
    ///
    /// # Returns
    /// An error if `other` lies strictly inside this range, which would
    /// split it in two.
    pub fn subtract(&self, other: &HeightRange) -> Result<HeightRange> {
        let common = self.intersect(other);
        if common.is_empty() {
            return Ok(*self);
        }
        let keeps_low = common.min_height > self.min_height;
        let keeps_high = common.max_height < self.max_height;
        match (keeps_low, keeps_high) {
            (true, true) => Err(ChaintracksError::HeightRange(format!(
                "subtracting {} from {} splits the range",
                other, self
            ))),
            (true, false) => Ok(HeightRange::new(self.min_height, common.min_height - 1)),
            (false, true) => Ok(HeightRange::new(common.max_height + 1, self.max_height)),
            (false, false) => Ok(Self::empty()),
        }
    }
}

impl Default for HeightRange {
    fn default() -> Self {
        Self::empty()
    }
}

impl PartialEq for HeightRange {
    fn eq(&self, other: &Self) -> bool {
        (self.is_empty() && other.is_empty())
            || (self.min_height == other.min_height && self.max_height == other.max_height)
    }
}

impl Eq for HeightRange {}

impl fmt::Display for HeightRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            f.write_str("<empty>")
        } else {
            write!(f, "[{}, {}]", self.min_height, self.max_height)
        }
    }
}
