//! Primer Value Types
//!
//! `Primer` and `PrimerPair` are immutable value objects produced by the
//! picker driver. Constructors enforce every structural invariant so that
//! downstream components can rely on them without re-checking.
//!
//! Both types implement structural equality and hashing (float fields by bit
//! pattern) so they can key the off-target caches.

use std::fmt;
use std::hash::{Hash, Hasher};

use crate::error::{Error, Result};
use crate::mapping::{Mapping, Strand};
use crate::params::DesignParameters;
use crate::seq;

// ============================================================================
// Primer
// ============================================================================

/// A single primer. `bases` is stated in the primer's own 5'->3' orientation,
/// i.e. reverse-complemented relative to the reference when the mapping is on
/// the negative strand. `bases` may be empty (unknown); otherwise its length
/// must equal the mapping length.
#[derive(Debug, Clone, PartialEq)]
pub struct Primer {
    pub bases: String,
    pub tm: f64,
    pub penalty: f64,
    pub mapping: Mapping,
    pub name: Option<String>,
    pub name_prefix: Option<String>,
    /// Optional 5' tail sequence, not part of the genomic mapping.
    pub tail: Option<String>,
    pub parameters: Option<DesignParameters>,
}

impl Primer {
    pub fn new(bases: &str, tm: f64, penalty: f64, mapping: Mapping) -> Result<Self> {
        Self::build(bases, tm, penalty, mapping, None, None, None, None)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn build(
        bases: &str,
        tm: f64,
        penalty: f64,
        mapping: Mapping,
        name: Option<String>,
        name_prefix: Option<String>,
        tail: Option<String>,
        parameters: Option<DesignParameters>,
    ) -> Result<Self> {
        if !bases.is_empty() && bases.len() != mapping.length() {
            return Err(Error::InvalidPrimer(format!(
                "bases length {} != mapping length {} at {}",
                bases.len(),
                mapping.length(),
                mapping
            )));
        }
        if name.is_some() && name_prefix.is_some() {
            return Err(Error::InvalidPrimer(
                "name and name_prefix are mutually exclusive".to_string(),
            ));
        }
        Ok(Self {
            bases: bases.to_string(),
            tm,
            penalty,
            mapping,
            name,
            name_prefix,
            tail,
            parameters,
        })
    }

    pub fn length(&self) -> usize {
        self.mapping.length()
    }

    /// GC content of the primer bases, 0-100.
    pub fn gc_percent(&self) -> f64 {
        seq::gc_percent(&self.bases)
    }

    /// The full sequence to synthesise: tail (if any) followed by bases.
    pub fn sequence_with_tail(&self) -> String {
        match &self.tail {
            Some(tail) => format!("{}{}", tail, self.bases),
            None => self.bases.clone(),
        }
    }

    /// Name for output rows: explicit name, else the prefix, else `.`.
    pub fn display_name(&self) -> &str {
        self.name
            .as_deref()
            .or(self.name_prefix.as_deref())
            .unwrap_or(".")
    }

    /// Tab-separated compact form: name, bases, tm, penalty, locus.
    pub fn to_compact_string(&self) -> String {
        format!(
            "{}\t{}\t{}\t{}\t{}:{}-{}:{}",
            self.display_name(),
            self.bases,
            self.tm,
            self.penalty,
            self.mapping.ref_name,
            self.mapping.start,
            self.mapping.end,
            self.mapping.strand,
        )
    }

    /// Parses the compact form produced by [`Primer::to_compact_string`].
    pub fn from_compact_string(s: &str) -> Result<Self> {
        let fields: Vec<&str> = s.trim_end().split('\t').collect();
        if fields.len() != 5 {
            return Err(Error::InvalidPrimer(format!(
                "compact primer needs 5 fields, got {}",
                fields.len()
            )));
        }
        let tm: f64 = fields[2]
            .parse()
            .map_err(|_| Error::InvalidPrimer(format!("invalid tm: {}", fields[2])))?;
        let penalty: f64 = fields[3]
            .parse()
            .map_err(|_| Error::InvalidPrimer(format!("invalid penalty: {}", fields[3])))?;
        let locus: Vec<&str> = fields[4].split(':').collect();
        if locus.len() != 3 {
            return Err(Error::InvalidPrimer(format!("invalid locus: {}", fields[4])));
        }
        let (start, end) = locus[1]
            .split_once('-')
            .ok_or_else(|| Error::InvalidPrimer(format!("invalid locus: {}", fields[4])))?;
        let mapping = Mapping::new(
            locus[0],
            start
                .parse()
                .map_err(|_| Error::InvalidPrimer(format!("invalid locus: {}", fields[4])))?,
            end.parse()
                .map_err(|_| Error::InvalidPrimer(format!("invalid locus: {}", fields[4])))?,
            Strand::from_char(locus[2].chars().next().unwrap_or('?'))?,
        )?;
        let name = match fields[0] {
            "." => None,
            n => Some(n.to_string()),
        };
        Self::build(fields[1], tm, penalty, mapping, name, None, None, None)
    }

    /// Renders the primer as a 12-column BED row (0-based half-open
    /// conversion happens here and only here).
    pub fn to_bed12(&self) -> String {
        let m = &self.mapping;
        format!(
            "{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}",
            m.ref_name,
            m.start - 1,
            m.end,
            self.display_name(),
            500,
            m.strand,
            m.start - 1,
            m.end,
            "100,100,100",
            1,
            m.length(),
            0,
        )
    }
}

impl Eq for Primer {}

impl Hash for Primer {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.bases.hash(state);
        self.tm.to_bits().hash(state);
        self.penalty.to_bits().hash(state);
        self.mapping.hash(state);
        self.name.hash(state);
        self.name_prefix.hash(state);
        self.tail.hash(state);
    }
}

impl fmt::Display for Primer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.display_name(), self.bases, self.mapping)
    }
}

// ============================================================================
// Primer Pair
// ============================================================================

/// A left/right primer pair bounding an amplicon. Left is always on `+`,
/// right on `-`; the amplicon spans from the left primer's first base to the
/// right primer's last base.
#[derive(Debug, Clone, PartialEq)]
pub struct PrimerPair {
    pub left: Primer,
    pub right: Primer,
    pub amplicon: Mapping,
    pub amplicon_sequence: String,
    pub tm: f64,
    pub penalty: f64,
    pub name: Option<String>,
    pub name_prefix: Option<String>,
    pub parameters: Option<DesignParameters>,
}

impl PrimerPair {
    pub fn new(
        left: Primer,
        right: Primer,
        amplicon: Mapping,
        amplicon_sequence: &str,
        tm: f64,
        penalty: f64,
    ) -> Result<Self> {
        Self::build(left, right, amplicon, amplicon_sequence, tm, penalty, None, None, None)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn build(
        left: Primer,
        right: Primer,
        amplicon: Mapping,
        amplicon_sequence: &str,
        tm: f64,
        penalty: f64,
        name: Option<String>,
        name_prefix: Option<String>,
        parameters: Option<DesignParameters>,
    ) -> Result<Self> {
        if left.mapping.ref_name != amplicon.ref_name
            || right.mapping.ref_name != amplicon.ref_name
        {
            return Err(Error::InvalidPrimerPair(format!(
                "primer references ({}, {}) do not match amplicon reference {}",
                left.mapping.ref_name, right.mapping.ref_name, amplicon.ref_name
            )));
        }
        if left.mapping.strand != Strand::Plus || right.mapping.strand != Strand::Minus {
            return Err(Error::InvalidPrimerPair(format!(
                "left must be on + and right on -, got {}/{}",
                left.mapping.strand, right.mapping.strand
            )));
        }
        if amplicon.start != left.mapping.start || amplicon.end != right.mapping.end {
            return Err(Error::InvalidPrimerPair(format!(
                "amplicon {} does not span primers {}..{}",
                amplicon, left.mapping, right.mapping
            )));
        }
        if !amplicon_sequence.is_empty() && amplicon_sequence.len() != amplicon.length() {
            return Err(Error::InvalidPrimerPair(format!(
                "amplicon sequence length {} != amplicon length {}",
                amplicon_sequence.len(),
                amplicon.length()
            )));
        }
        if name.is_some() && name_prefix.is_some() {
            return Err(Error::InvalidPrimerPair(
                "name and name_prefix are mutually exclusive".to_string(),
            ));
        }
        Ok(Self {
            left,
            right,
            amplicon,
            amplicon_sequence: amplicon_sequence.to_string(),
            tm,
            penalty,
            name,
            name_prefix,
            parameters,
        })
    }

    pub fn length(&self) -> usize {
        self.amplicon.length()
    }

    /// The region between the primers. When the primers overlap it collapses
    /// to the single midpoint position.
    pub fn inner(&self) -> Mapping {
        let left_end = self.left.mapping.end;
        let right_start = self.right.mapping.start;
        if left_end < right_start {
            Mapping {
                ref_name: self.amplicon.ref_name.clone(),
                start: left_end + 1,
                end: right_start - 1,
                strand: Strand::Plus,
            }
        } else {
            let mid = (self.amplicon.start + self.amplicon.end) / 2;
            Mapping {
                ref_name: self.amplicon.ref_name.clone(),
                start: mid,
                end: mid,
                strand: Strand::Plus,
            }
        }
    }

    pub fn display_name(&self) -> &str {
        self.name
            .as_deref()
            .or(self.name_prefix.as_deref())
            .unwrap_or(".")
    }

    /// Renders the pair as a 12-column BED row with one block per primer.
    pub fn to_bed12(&self) -> String {
        let a = &self.amplicon;
        format!(
            "{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{},{}\t{},{}",
            a.ref_name,
            a.start - 1,
            a.end,
            self.display_name(),
            500,
            Strand::Plus,
            a.start - 1,
            a.end,
            "100,100,100",
            2,
            self.left.length(),
            self.right.length(),
            0,
            self.right.mapping.start - a.start,
        )
    }
}

impl Eq for PrimerPair {}

impl Hash for PrimerPair {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.left.hash(state);
        self.right.hash(state);
        self.amplicon.hash(state);
        self.amplicon_sequence.hash(state);
        self.tm.to_bits().hash(state);
        self.penalty.to_bits().hash(state);
        self.name.hash(state);
        self.name_prefix.hash(state);
    }
}

impl fmt::Display for PrimerPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.display_name(), self.amplicon)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn plus(start: usize, end: usize) -> Mapping {
        Mapping::new("chr1", start, end, Strand::Plus).unwrap()
    }

    fn minus(start: usize, end: usize) -> Mapping {
        Mapping::new("chr1", start, end, Strand::Minus).unwrap()
    }

    fn left_primer() -> Primer {
        Primer::new("ACGTACGTAC", 60.0, 0.2, plus(100, 109)).unwrap()
    }

    fn right_primer() -> Primer {
        Primer::new("TTGCAATGCA", 61.0, 0.3, minus(190, 199)).unwrap()
    }

    fn pair() -> PrimerPair {
        let amplicon = plus(100, 199);
        PrimerPair::new(left_primer(), right_primer(), amplicon, "", 75.0, 0.5).unwrap()
    }

    #[test]
    fn test_primer_bases_length_invariant() {
        assert!(Primer::new("ACGT", 60.0, 0.0, plus(100, 103)).is_ok());
        assert!(Primer::new("", 60.0, 0.0, plus(100, 103)).is_ok());
        assert!(Primer::new("ACG", 60.0, 0.0, plus(100, 103)).is_err());
    }

    #[test]
    fn test_primer_name_exclusivity() {
        let err = Primer::build(
            "ACGT",
            60.0,
            0.0,
            plus(100, 103),
            Some("p1".to_string()),
            Some("prefix".to_string()),
            None,
            None,
        );
        assert!(err.is_err());
    }

    #[test]
    fn test_pair_invariants() {
        // Wrong amplicon span
        let bad = PrimerPair::new(left_primer(), right_primer(), plus(100, 200), "", 75.0, 0.5);
        assert!(bad.is_err());

        // Wrong strands
        let flipped = Primer::new("ACGTACGTAC", 60.0, 0.2, minus(100, 109)).unwrap();
        let bad = PrimerPair::new(flipped, right_primer(), plus(100, 199), "", 75.0, 0.5);
        assert!(bad.is_err());

        // Amplicon sequence length mismatch
        let bad = PrimerPair::new(left_primer(), right_primer(), plus(100, 199), "ACGT", 75.0, 0.5);
        assert!(bad.is_err());

        // Reference mismatch
        let other = Primer::new(
            "TTGCAATGCA",
            61.0,
            0.3,
            Mapping::new("chr2", 190, 199, Strand::Minus).unwrap(),
        )
        .unwrap();
        let bad = PrimerPair::new(left_primer(), other, plus(100, 199), "", 75.0, 0.5);
        assert!(bad.is_err());
    }

    #[test]
    fn test_inner_region() {
        let p = pair();
        let inner = p.inner();
        assert_eq!(inner.start, 110);
        assert_eq!(inner.end, 189);

        // Overlapping primers collapse to the midpoint
        let left = Primer::new("ACGTACGTAC", 60.0, 0.2, plus(100, 109)).unwrap();
        let right = Primer::new("TTGCAATGCA", 61.0, 0.3, minus(105, 114)).unwrap();
        let p = PrimerPair::new(left, right, plus(100, 114), "", 75.0, 0.5).unwrap();
        let inner = p.inner();
        assert_eq!(inner.start, 107);
        assert_eq!(inner.end, 107);
    }

    #[test]
    fn test_compact_string_round_trip() {
        let primer = Primer::build(
            "ACGTACGTAC",
            59.81,
            0.253,
            plus(100, 109),
            Some("exon2_L".to_string()),
            None,
            None,
            None,
        )
        .unwrap();
        let compact = primer.to_compact_string();
        let back = Primer::from_compact_string(&compact).unwrap();
        assert_eq!(back, primer);

        // Nameless primers round-trip through the `.` placeholder
        let anon = left_primer();
        assert_eq!(Primer::from_compact_string(&anon.to_compact_string()).unwrap(), anon);
    }

    #[test]
    fn test_bed12_field_count() {
        assert_eq!(pair().to_bed12().split('\t').count(), 12);
        assert_eq!(left_primer().to_bed12().split('\t').count(), 12);
    }

    #[test]
    fn test_bed12_pair_blocks() {
        let row = pair().to_bed12();
        let fields: Vec<&str> = row.split('\t').collect();
        assert_eq!(fields[0], "chr1");
        assert_eq!(fields[1], "99");
        assert_eq!(fields[2], "199");
        assert_eq!(fields[9], "2");
        assert_eq!(fields[10], "10,10");
        assert_eq!(fields[11], "0,90");
    }

    #[test]
    fn test_structural_hash_eq() {
        use rustc_hash::FxHashMap;
        let mut cache: FxHashMap<PrimerPair, bool> = FxHashMap::default();
        cache.insert(pair(), true);
        assert!(cache.contains_key(&pair()));
    }
}
