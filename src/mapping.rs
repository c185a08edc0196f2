//! Genomic Coordinates Module
//!
//! 1-based closed intervals with strand, and the sequence dictionary used to
//! order mappings across references.
//!
//! # Conventions
//! - Coordinates are 1-based and closed on both ends: `length = end - start + 1`.
//! - A zero-width interval is permitted only via `end = start - 1`.
//! - Strand ordering is `+` before `-`.
//!
//! # Examples
//! ```
//! use ampliseek::mapping::{Mapping, Strand};
//!
//! let m = Mapping::new("chr1", 100, 199, Strand::Plus).unwrap();
//! assert_eq!(m.length(), 100);
//! assert_eq!(m.project(150).unwrap(), 51);
//! ```

use rustc_hash::FxHashMap;
use std::cmp::Ordering;
use std::fmt;

use crate::error::{Error, Result};

// ============================================================================
// Strand
// ============================================================================

/// Strand of a genomic mapping. `Plus` orders before `Minus`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Strand {
    Plus,
    Minus,
}

impl Strand {
    pub fn is_negative(&self) -> bool {
        matches!(self, Strand::Minus)
    }

    pub fn as_char(&self) -> char {
        match self {
            Strand::Plus => '+',
            Strand::Minus => '-',
        }
    }

    pub fn from_char(c: char) -> Result<Self> {
        match c {
            '+' => Ok(Strand::Plus),
            '-' => Ok(Strand::Minus),
            other => Err(Error::InvalidMapping(format!("invalid strand: {}", other))),
        }
    }
}

impl fmt::Display for Strand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_char())
    }
}

// ============================================================================
// Mapping
// ============================================================================

/// A stranded interval on a named reference sequence, 1-based and closed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Mapping {
    pub ref_name: String,
    pub start: usize,
    pub end: usize,
    pub strand: Strand,
}

impl Mapping {
    /// Builds a mapping, validating `start >= 1` and `end >= start - 1`.
    pub fn new(ref_name: &str, start: usize, end: usize, strand: Strand) -> Result<Self> {
        if start < 1 {
            return Err(Error::InvalidMapping(format!(
                "start must be >= 1, got {}",
                start
            )));
        }
        if end + 1 < start {
            return Err(Error::InvalidMapping(format!(
                "end ({}) must be >= start - 1 ({})",
                end,
                start - 1
            )));
        }
        Ok(Self {
            ref_name: ref_name.to_string(),
            start,
            end,
            strand,
        })
    }

    /// Parses a `chrom:start-end` region string onto the plus strand.
    pub fn from_region_str(region: &str) -> Result<Self> {
        let (chrom, range) = region
            .rsplit_once(':')
            .ok_or_else(|| Error::InvalidMapping(format!("invalid region: {}", region)))?;
        let (start, end) = range
            .split_once('-')
            .ok_or_else(|| Error::InvalidMapping(format!("invalid region: {}", region)))?;
        let start: usize = start
            .replace(',', "")
            .parse()
            .map_err(|_| Error::InvalidMapping(format!("invalid region start: {}", region)))?;
        let end: usize = end
            .replace(',', "")
            .parse()
            .map_err(|_| Error::InvalidMapping(format!("invalid region end: {}", region)))?;
        Mapping::new(chrom, start, end, Strand::Plus)
    }

    pub fn length(&self) -> usize {
        self.end + 1 - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.length() == 0
    }

    /// Returns the sub-mapping at 1-based offset `start` within this mapping,
    /// of the given length, on the given strand.
    ///
    /// Fails if `start < 1`, `start` is past the end of this mapping, or the
    /// resolved interval would extend past `self.end`.
    pub fn resolve(&self, start: usize, length: usize, strand: Strand) -> Result<Mapping> {
        if start < 1 || start > self.length() {
            return Err(Error::InvalidMapping(format!(
                "resolve start {} out of range 1..={} on {}",
                start,
                self.length(),
                self
            )));
        }
        let abs_start = self.start + start - 1;
        let abs_end = abs_start + length - 1;
        if abs_end > self.end {
            return Err(Error::InvalidMapping(format!(
                "resolved end {} past end of {}",
                abs_end, self
            )));
        }
        Mapping::new(&self.ref_name, abs_start, abs_end, strand)
    }

    /// Projects an absolute reference position into this mapping's 1-based
    /// coordinate space.
    pub fn project(&self, pos: usize) -> Result<usize> {
        if pos < self.start || pos > self.end {
            return Err(Error::InvalidMapping(format!(
                "position {} outside {}",
                pos, self
            )));
        }
        Ok(pos - self.start + 1)
    }

    pub fn overlaps(&self, other: &Mapping) -> bool {
        self.ref_name == other.ref_name && self.start <= other.end && other.start <= self.end
    }

    pub fn contains(&self, other: &Mapping) -> bool {
        self.ref_name == other.ref_name && self.start <= other.start && other.end <= self.end
    }

    pub fn contains_position(&self, pos: usize) -> bool {
        self.start <= pos && pos <= self.end
    }

    /// True when the two mappings are adjacent in either direction on the
    /// same reference.
    pub fn abuts(&self, other: &Mapping) -> bool {
        self.ref_name == other.ref_name
            && (self.end + 1 == other.start || other.end + 1 == self.start)
    }

    /// Spanning union of two overlapping or abutting mappings.
    pub fn union(&self, other: &Mapping) -> Result<Mapping> {
        if self.ref_name != other.ref_name {
            return Err(Error::InvalidMapping(format!(
                "union across references: {} vs {}",
                self.ref_name, other.ref_name
            )));
        }
        if !self.overlaps(other) && !self.abuts(other) {
            return Err(Error::InvalidMapping(format!(
                "union of disjoint mappings: {} vs {}",
                self, other
            )));
        }
        Mapping::new(
            &self.ref_name,
            self.start.min(other.start),
            self.end.max(other.end),
            self.strand,
        )
    }

    /// Shifts the mapping by `delta` bases; the shifted start must stay >= 1.
    pub fn shift(&self, delta: isize) -> Result<Mapping> {
        let start = self.start as isize + delta;
        let end = self.end as isize + delta;
        if start < 1 {
            return Err(Error::InvalidMapping(format!(
                "shift by {} would move {} before position 1",
                delta, self
            )));
        }
        Mapping::new(&self.ref_name, start as usize, end as usize, self.strand)
    }

    /// The position of the 5' end: `start` on `+`, `end` on `-`.
    pub fn five_prime_position(&self) -> usize {
        match self.strand {
            Strand::Plus => self.start,
            Strand::Minus => self.end,
        }
    }

    /// Orders two mappings by (reference index, start, end, strand), with
    /// `+ < -`. Both references must be present in the dictionary.
    pub fn compare(&self, other: &Mapping, dict: &SequenceDictionary) -> Result<Ordering> {
        let self_idx = dict.index_of(&self.ref_name).ok_or_else(|| {
            Error::InvalidMapping(format!("{} not in sequence dictionary", self.ref_name))
        })?;
        let other_idx = dict.index_of(&other.ref_name).ok_or_else(|| {
            Error::InvalidMapping(format!("{} not in sequence dictionary", other.ref_name))
        })?;
        Ok(self_idx
            .cmp(&other_idx)
            .then(self.start.cmp(&other.start))
            .then(self.end.cmp(&other.end))
            .then(self.strand.cmp(&other.strand)))
    }

    /// Ordering within a single reference; no dictionary required.
    pub fn compare_same_ref(&self, other: &Mapping) -> Ordering {
        self.start
            .cmp(&other.start)
            .then(self.end.cmp(&other.end))
            .then(self.strand.cmp(&other.strand))
    }
}

impl fmt::Display for Mapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}-{}", self.ref_name, self.start, self.end)
    }
}

// ============================================================================
// Sequence Dictionary
// ============================================================================

/// Ordered catalog of reference sequences with lengths. Provides the
/// reference ordering used to compare mappings across references.
#[derive(Debug, Clone, Default)]
pub struct SequenceDictionary {
    entries: Vec<(String, usize)>,
    index: FxHashMap<String, usize>,
}

impl SequenceDictionary {
    pub fn new(entries: Vec<(String, usize)>) -> Self {
        let index = entries
            .iter()
            .enumerate()
            .map(|(i, (name, _))| (name.clone(), i))
            .collect();
        Self { entries, index }
    }

    pub fn index_of(&self, ref_name: &str) -> Option<usize> {
        self.index.get(ref_name).copied()
    }

    pub fn length_of(&self, ref_name: &str) -> Option<usize> {
        self.index_of(ref_name).map(|i| self.entries[i].1)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[(String, usize)] {
        &self.entries
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn m(start: usize, end: usize, strand: Strand) -> Mapping {
        Mapping::new("chr1", start, end, strand).unwrap()
    }

    #[test]
    fn test_length_and_zero_width() {
        assert_eq!(m(100, 199, Strand::Plus).length(), 100);
        // Zero-width interval via end = start - 1
        let empty = m(100, 99, Strand::Plus);
        assert_eq!(empty.length(), 0);
        assert!(empty.is_empty());
        // end < start - 1 is rejected
        assert!(Mapping::new("chr1", 100, 98, Strand::Plus).is_err());
        assert!(Mapping::new("chr1", 0, 10, Strand::Plus).is_err());
    }

    #[test]
    fn test_resolve_identity() {
        let map = m(100, 199, Strand::Plus);
        let same = map.resolve(1, map.length(), Strand::Plus).unwrap();
        assert_eq!(same, map);
    }

    #[test]
    fn test_resolve_sub_range() {
        let map = m(100, 199, Strand::Plus);
        let sub = map.resolve(11, 20, Strand::Minus).unwrap();
        assert_eq!(sub.start, 110);
        assert_eq!(sub.end, 129);
        assert_eq!(sub.strand, Strand::Minus);
    }

    #[test]
    fn test_resolve_out_of_range() {
        let map = m(100, 199, Strand::Plus);
        assert!(map.resolve(0, 10, Strand::Plus).is_err());
        assert!(map.resolve(101, 1, Strand::Plus).is_err());
        assert!(map.resolve(95, 10, Strand::Plus).is_err());
    }

    #[test]
    fn test_project() {
        let map = m(100, 199, Strand::Plus);
        assert_eq!(map.project(map.start).unwrap(), 1);
        assert_eq!(map.project(map.end).unwrap(), map.length());
        assert!(map.project(99).is_err());
        assert!(map.project(200).is_err());
    }

    #[test]
    fn test_overlaps_contains_abuts() {
        let a = m(100, 199, Strand::Plus);
        let b = m(150, 250, Strand::Plus);
        let c = m(200, 250, Strand::Plus);
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c));
        assert!(a.abuts(&c));
        assert!(c.abuts(&a));
        assert!(a.contains(&m(120, 130, Strand::Plus)));
        assert!(!a.contains(&b));

        let other_ref = Mapping::new("chr2", 100, 199, Strand::Plus).unwrap();
        assert!(!a.overlaps(&other_ref));
        assert!(!a.abuts(&other_ref));
    }

    #[test]
    fn test_union_commutative() {
        let a = m(100, 199, Strand::Plus);
        let b = m(150, 250, Strand::Plus);
        let ab = a.union(&b).unwrap();
        let ba = b.union(&a).unwrap();
        assert_eq!(ab.start, ba.start);
        assert_eq!(ab.end, ba.end);
        assert_eq!(ab.start, 100);
        assert_eq!(ab.end, 250);

        // Abutting intervals union too
        let c = m(200, 250, Strand::Plus);
        assert_eq!(a.union(&c).unwrap().end, 250);
        // Disjoint intervals do not
        assert!(a.union(&m(300, 400, Strand::Plus)).is_err());
    }

    #[test]
    fn test_shift() {
        let map = m(100, 199, Strand::Plus);
        let shifted = map.shift(-50).unwrap();
        assert_eq!(shifted.start, 50);
        assert_eq!(shifted.end, 149);
        assert!(map.shift(-100).is_err());
    }

    #[test]
    fn test_five_prime_position() {
        assert_eq!(m(100, 199, Strand::Plus).five_prime_position(), 100);
        assert_eq!(m(100, 199, Strand::Minus).five_prime_position(), 199);
    }

    #[test]
    fn test_compare_with_dict() {
        let dict = SequenceDictionary::new(vec![
            ("chr1".to_string(), 1000),
            ("chr2".to_string(), 1000),
        ]);
        let a = Mapping::new("chr2", 1, 10, Strand::Plus).unwrap();
        let b = Mapping::new("chr1", 500, 600, Strand::Plus).unwrap();
        assert_eq!(a.compare(&b, &dict).unwrap(), Ordering::Greater);

        let plus = m(100, 199, Strand::Plus);
        let minus = m(100, 199, Strand::Minus);
        assert_eq!(plus.compare(&minus, &dict).unwrap(), Ordering::Less);
        assert_eq!(plus.compare_same_ref(&minus), Ordering::Less);
    }

    #[test]
    fn test_from_region_str() {
        let map = Mapping::from_region_str("chr17:43,044,295-43,125,364").unwrap();
        assert_eq!(map.ref_name, "chr17");
        assert_eq!(map.start, 43044295);
        assert_eq!(map.end, 43125364);
        assert!(Mapping::from_region_str("chr17").is_err());
        assert!(Mapping::from_region_str("chr17:10").is_err());
    }
}
