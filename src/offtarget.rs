//! Off-Target Detector
//!
//! Classifies primer pairs by how many places in the genome they could
//! amplify. Hits for each unique primer sequence come from the interactive
//! aligner; left and right hit sets are joined combinatorially into candidate
//! amplicons under orientation and size constraints.
//!
//! Both the per-primer hit sets and the per-pair verdicts are cached for the
//! lifetime of the detector; the caches only ever grow. The detector is not
//! safe for concurrent use; callers must serialize.

use rustc_hash::{FxHashMap, FxHashSet};

use crate::aligner::{AlignerHit, AlignerResult, BwaAlnInteractive};
use crate::error::{Error, Result};
use crate::mapping::{Mapping, Strand};
use crate::primer::PrimerPair;

/// Limits and retention flags for off-target classification.
#[derive(Debug, Clone)]
pub struct OffTargetOptions {
    /// A pair fails outright when either primer has more hits than this.
    pub max_primer_hits: usize,
    /// Maximum number of predicted amplicons for a passing pair.
    pub max_primer_pair_hits: usize,
    /// Maximum span of a predicted off-target amplicon.
    pub max_amplicon_size: usize,
    /// Retain predicted amplicon mappings in results.
    pub keep_amplicon_mappings: bool,
    /// Retain per-primer hit mappings in results.
    pub keep_primer_mappings: bool,
}

impl Default for OffTargetOptions {
    fn default() -> Self {
        Self {
            max_primer_hits: 500,
            max_primer_pair_hits: 1,
            max_amplicon_size: 600,
            keep_amplicon_mappings: true,
            keep_primer_mappings: false,
        }
    }
}

/// Verdict for one primer pair.
#[derive(Debug, Clone)]
pub struct OffTargetResult {
    pub pair: PrimerPair,
    pub passes: bool,
    /// Predicted amplicon mappings (when retained).
    pub mappings: Vec<Mapping>,
    pub left_primer_mappings: Option<Vec<Mapping>>,
    pub right_primer_mappings: Option<Vec<Mapping>>,
}

/// Joins left and right hit sets into candidate amplicons: hits must share a
/// reference, lie on opposite strands, with the minus-strand hit starting
/// past the plus-strand hit's end, and the span from the plus hit's start to
/// the minus hit's end within the size limit.
pub fn amplicons(
    left_hits: &[AlignerHit],
    right_hits: &[AlignerHit],
    max_amplicon_size: usize,
) -> Vec<Mapping> {
    let mut found = Vec::new();
    for h1 in left_hits {
        for h2 in right_hits {
            if h1.chrom != h2.chrom || h1.negative == h2.negative {
                continue;
            }
            let (plus, minus) = if h1.negative { (h2, h1) } else { (h1, h2) };
            if minus.start <= plus.end() {
                continue;
            }
            let length = minus.end() - plus.start + 1;
            if length > max_amplicon_size {
                continue;
            }
            found.push(Mapping {
                ref_name: plus.chrom.clone(),
                start: plus.start,
                end: minus.end(),
                strand: Strand::Plus,
            });
        }
    }
    found.sort_by(|a, b| {
        a.ref_name
            .cmp(&b.ref_name)
            .then_with(|| a.compare_same_ref(b))
    });
    found
}

/// The off-target detector. Exclusively owns one aligner wrapper.
pub struct OffTargetDetector {
    aligner: BwaAlnInteractive,
    options: OffTargetOptions,
    primer_cache: FxHashMap<String, AlignerResult>,
    pair_cache: FxHashMap<PrimerPair, OffTargetResult>,
}

impl OffTargetDetector {
    pub fn new(aligner: BwaAlnInteractive, options: OffTargetOptions) -> Self {
        Self {
            aligner,
            options,
            primer_cache: FxHashMap::default(),
            pair_cache: FxHashMap::default(),
        }
    }

    /// Classifies a batch of pairs, returning verdicts in input order.
    /// Primer sequences not already cached are submitted to the aligner as a
    /// single batch.
    pub fn check(&mut self, pairs: &[PrimerPair]) -> Result<Vec<OffTargetResult>> {
        let misses: Vec<&PrimerPair> = pairs
            .iter()
            .filter(|pair| !self.pair_cache.contains_key(*pair))
            .collect();

        // Gather the unique primer sequences the aligner has not yet seen
        let mut pending = Vec::new();
        let mut seen: FxHashSet<&str> = FxHashSet::default();
        for pair in &misses {
            for bases in [&pair.left.bases, &pair.right.bases] {
                if !self.primer_cache.contains_key(bases.as_str()) && seen.insert(bases) {
                    pending.push(bases.clone());
                }
            }
        }

        for result in self.aligner.map(&pending)? {
            self.primer_cache.insert(result.query.clone(), result);
        }

        for pair in misses {
            let result = self.verdict(pair)?;
            self.pair_cache.insert((*pair).clone(), result);
        }

        Ok(pairs
            .iter()
            .map(|pair| self.pair_cache[pair].clone())
            .collect())
    }

    /// Convenience wrapper around [`OffTargetDetector::check`] for one pair.
    pub fn check_one(&mut self, pair: &PrimerPair) -> Result<OffTargetResult> {
        Ok(self.check(std::slice::from_ref(pair))?.remove(0))
    }

    /// Builds the verdict for a pair whose primers are in the cache.
    fn verdict(&self, pair: &PrimerPair) -> Result<OffTargetResult> {
        let left = self.cached_result(&pair.left.bases)?;
        let right = self.cached_result(&pair.right.bases)?;

        if left.hit_count > self.options.max_primer_hits
            || right.hit_count > self.options.max_primer_hits
        {
            return Ok(OffTargetResult {
                pair: pair.clone(),
                passes: false,
                mappings: Vec::new(),
                left_primer_mappings: None,
                right_primer_mappings: None,
            });
        }

        let amps = amplicons(&left.hits, &right.hits, self.options.max_amplicon_size);
        let passes = amps.len() <= self.options.max_primer_pair_hits;

        let (left_spans, right_spans) = if self.options.keep_primer_mappings {
            (
                Some(left.hits.iter().map(|h| h.to_mapping()).collect()),
                Some(right.hits.iter().map(|h| h.to_mapping()).collect()),
            )
        } else {
            (None, None)
        };

        Ok(OffTargetResult {
            pair: pair.clone(),
            passes,
            mappings: if self.options.keep_amplicon_mappings {
                amps
            } else {
                Vec::new()
            },
            left_primer_mappings: left_spans,
            right_primer_mappings: right_spans,
        })
    }

    fn cached_result(&self, bases: &str) -> Result<&AlignerResult> {
        self.primer_cache.get(bases).ok_or_else(|| {
            Error::Aligner(format!("no aligner result cached for primer {:?}", bases))
        })
    }

    /// Closes the owned aligner. Idempotent.
    pub fn close(&mut self) {
        self.aligner.close();
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aligner::Cigar;

    fn hit(chrom: &str, start: usize, negative: bool, cigar: &str) -> AlignerHit {
        AlignerHit::new(chrom, start, negative, cigar.parse::<Cigar>().unwrap(), 0, false)
    }

    #[test]
    fn test_amplicon_join_literal() {
        // Left primer (24 bases) lands on + at chr1:781; the right primer
        // (22 bases) lands on - ending at chr1:1042. One amplicon of 262
        // bases results.
        let left = vec![hit("chr1", 781, false, "24M")];
        let right = vec![hit("chr1", 1021, true, "22M")];
        let amps = amplicons(&left, &right, 450);
        assert_eq!(amps.len(), 1);
        assert_eq!(amps[0].ref_name, "chr1");
        assert_eq!(amps[0].start, 781);
        assert_eq!(amps[0].end, 1042);
        assert_eq!(amps[0].length(), 262);
    }

    #[test]
    fn test_amplicon_join_constraints() {
        let plus = hit("chr1", 781, false, "24M");
        let minus = hit("chr1", 1021, true, "22M");

        // Same strand never joins
        assert!(amplicons(&[plus.clone()], &[plus.clone()], 450).is_empty());

        // Different chromosomes never join
        let other = hit("chr2", 1021, true, "22M");
        assert!(amplicons(&[plus.clone()], &[other], 450).is_empty());

        // Amplicon longer than the limit is rejected
        assert!(amplicons(&[plus.clone()], &[minus.clone()], 200).is_empty());

        // Minus hit starting inside (or before) the plus hit is rejected
        let inside = hit("chr1", 800, true, "22M");
        assert!(amplicons(&[plus.clone()], &[inside], 450).is_empty());

        // Role assignment follows the strand flags, not argument order
        let amps = amplicons(&[minus], &[plus], 450);
        assert_eq!(amps.len(), 1);
        assert_eq!(amps[0].start, 781);
        assert_eq!(amps[0].end, 1042);
    }

    #[test]
    fn test_amplicon_join_multiple_hits() {
        let left = vec![
            hit("chr1", 781, false, "24M"),
            hit("chr1", 5000, false, "24M"),
            hit("chr2", 100, false, "24M"),
        ];
        let right = vec![
            hit("chr1", 1021, true, "22M"),
            hit("chr1", 5200, true, "22M"),
            hit("chr2", 400, true, "22M"),
        ];
        let amps = amplicons(&left, &right, 450);
        assert_eq!(amps.len(), 3);
        // 781 x 5200 (span 4441) and 5000 x 1021 (minus before plus) are
        // rejected; the three in-range pairings remain, sorted per reference.
        assert_eq!(amps[0].start, 781);
        assert_eq!(amps[1].start, 5000);
        assert_eq!(amps[2].ref_name, "chr2");
    }
}
