//! Variant Catalog Module
//!
//! Known germline variants and the lookups used to find them under candidate
//! primer binding sites. Two lookup implementations share one contract: an
//! in-memory interval-tree index built eagerly from variant files, and a
//! file-backed form that issues positional fetches against indexed readers.
//!
//! # MAF derivation
//! The minor-allele frequency of an input record is derived in priority
//! order: `1 - first(CAF)`, then `sum(AF)`, then `sum(AC)/AN`, then the
//! fraction of non-reference, non-missing genotype calls, else missing.

use bio::data_structures::interval_tree::IntervalTree;
use rust_htslib::bcf::record::GenotypeAllele;
use rust_htslib::bcf::{self, Read};
use rustc_hash::FxHashMap;
use std::path::Path;

use crate::error::{Error, Result};
use crate::mapping::{Mapping, Strand};

// ============================================================================
// Variant
// ============================================================================

/// Classification of a variant by allele lengths.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VariantType {
    Snp,
    Insertion,
    Deletion,
    Other,
}

/// A germline variant with an optional minor-allele frequency.
#[derive(Debug, Clone, PartialEq)]
pub struct Variant {
    pub id: String,
    pub chrom: String,
    /// 1-based position of the first reference base.
    pub pos: usize,
    pub ref_allele: String,
    pub alt_allele: String,
    pub maf: Option<f64>,
}

impl Variant {
    pub fn new(
        id: &str,
        chrom: &str,
        pos: usize,
        ref_allele: &str,
        alt_allele: &str,
        maf: Option<f64>,
    ) -> Self {
        Self {
            id: id.to_string(),
            chrom: chrom.to_string(),
            pos,
            ref_allele: ref_allele.to_string(),
            alt_allele: alt_allele.to_string(),
            maf,
        }
    }

    pub fn variant_type(&self) -> VariantType {
        match (self.ref_allele.len(), self.alt_allele.len()) {
            (1, 1) => VariantType::Snp,
            (1, a) if a > 1 => VariantType::Insertion,
            (r, 1) if r > 1 => VariantType::Deletion,
            _ => VariantType::Other,
        }
    }

    /// The genomic span used for overlap queries: SNPs and insertions occupy
    /// only `pos`; deletions span the deleted reference bases; other events
    /// span one base past the reference allele.
    pub fn to_mapping(&self) -> Mapping {
        let (start, end) = match self.variant_type() {
            VariantType::Snp | VariantType::Insertion => (self.pos, self.pos),
            VariantType::Deletion => (self.pos, self.pos + self.ref_allele.len() - 1),
            VariantType::Other => (self.pos, self.pos + self.ref_allele.len()),
        };
        Mapping {
            ref_name: self.chrom.clone(),
            start,
            end,
            strand: Strand::Plus,
        }
    }
}

// ============================================================================
// MAF derivation and filtering
// ============================================================================

/// Derives a minor-allele frequency from the payloads of one input record.
pub fn derive_maf(
    caf_first: Option<&str>,
    afs: Option<&[f64]>,
    acs: Option<&[i64]>,
    an: Option<i64>,
    genotype_calls: Option<(usize, usize)>,
) -> Option<f64> {
    if let Some(caf) = caf_first {
        if let Ok(ref_af) = caf.trim().parse::<f64>() {
            return Some(1.0 - ref_af);
        }
    }
    if let Some(afs) = afs {
        if !afs.is_empty() {
            return Some(afs.iter().sum());
        }
    }
    if let (Some(acs), Some(an)) = (acs, an) {
        if an > 0 && !acs.is_empty() {
            let ac: i64 = acs.iter().sum();
            return Some(ac as f64 / an as f64);
        }
    }
    if let Some((non_ref, called)) = genotype_calls {
        if called > 0 {
            return Some(non_ref as f64 / called as f64);
        }
    }
    None
}

/// MAF acceptance: everything passes when `min_maf <= 0`; otherwise a present
/// MAF must reach the threshold, and missing MAFs pass only when requested.
pub fn passes_maf(variant: &Variant, min_maf: f64, include_missing_mafs: bool) -> bool {
    if min_maf <= 0.0 {
        return true;
    }
    match variant.maf {
        Some(maf) => maf >= min_maf,
        None => include_missing_mafs,
    }
}

// ============================================================================
// Lookup contract
// ============================================================================

/// Query for variants whose genomic span overlaps a closed interval, with
/// MAF filtering applied.
pub trait VariantLookup {
    fn query(
        &mut self,
        chrom: &str,
        start: usize,
        end: usize,
        min_maf: f64,
        include_missing_mafs: bool,
    ) -> Result<Vec<Variant>>;
}

// ============================================================================
// Cached lookup
// ============================================================================

/// Lookup over an in-memory interval-tree index, built once from variant
/// files (or directly from variants) at construction time.
pub struct CachedVariantLookup {
    trees: FxHashMap<String, IntervalTree<usize, Variant>>,
}

impl CachedVariantLookup {
    /// Indexes pre-converted variants.
    pub fn from_variants(variants: Vec<Variant>) -> Self {
        let mut trees: FxHashMap<String, IntervalTree<usize, Variant>> = FxHashMap::default();
        for variant in variants {
            let span = variant.to_mapping();
            trees
                .entry(variant.chrom.clone())
                .or_insert_with(IntervalTree::new)
                .insert(span.start..span.end + 1, variant);
        }
        Self { trees }
    }

    /// Reads one or more VCF/BCF files, keeps passing records, and indexes
    /// the converted variants.
    pub fn from_vcfs<P: AsRef<Path>>(paths: &[P]) -> Result<Self> {
        let mut variants = Vec::new();
        for path in paths {
            let mut reader = bcf::Reader::from_path(path.as_ref()).map_err(|e| {
                Error::VariantSource(format!("{}: {}", path.as_ref().display(), e))
            })?;
            for record in reader.records() {
                let record = record.map_err(|e| {
                    Error::VariantSource(format!("{}: {}", path.as_ref().display(), e))
                })?;
                if !record_passes_filters(&record) {
                    continue;
                }
                if let Some(variant) = variant_from_record(&record)? {
                    variants.push(variant);
                }
            }
        }
        Ok(Self::from_variants(variants))
    }
}

impl VariantLookup for CachedVariantLookup {
    fn query(
        &mut self,
        chrom: &str,
        start: usize,
        end: usize,
        min_maf: f64,
        include_missing_mafs: bool,
    ) -> Result<Vec<Variant>> {
        let mut found: Vec<Variant> = match self.trees.get(chrom) {
            Some(tree) => tree
                .find(start..end + 1)
                .map(|entry| entry.data().clone())
                .filter(|v| passes_maf(v, min_maf, include_missing_mafs))
                .collect(),
            None => Vec::new(),
        };
        found.sort_by_key(|v| v.pos);
        Ok(found)
    }
}

// ============================================================================
// File-backed lookup
// ============================================================================

/// Lookup holding open indexed readers; each query issues a positional fetch
/// against every file.
pub struct IndexedVariantLookup {
    readers: Vec<bcf::IndexedReader>,
}

impl IndexedVariantLookup {
    pub fn open<P: AsRef<Path>>(paths: &[P]) -> Result<Self> {
        let mut readers = Vec::with_capacity(paths.len());
        for path in paths {
            let reader = bcf::IndexedReader::from_path(path.as_ref()).map_err(|e| {
                Error::VariantSource(format!("{}: {}", path.as_ref().display(), e))
            })?;
            readers.push(reader);
        }
        Ok(Self { readers })
    }
}

impl VariantLookup for IndexedVariantLookup {
    fn query(
        &mut self,
        chrom: &str,
        start: usize,
        end: usize,
        min_maf: f64,
        include_missing_mafs: bool,
    ) -> Result<Vec<Variant>> {
        let mut found = Vec::new();
        for reader in &mut self.readers {
            let rid = match reader.header().name2rid(chrom.as_bytes()) {
                Ok(rid) => rid,
                // This file simply does not carry the contig
                Err(_) => continue,
            };
            reader.fetch(rid, (start - 1) as u64, Some(end as u64))?;
            for record in reader.records() {
                let record = record
                    .map_err(|e| Error::VariantSource(format!("read failed: {}", e)))?;
                if !record_passes_filters(&record) {
                    continue;
                }
                if let Some(variant) = variant_from_record(&record)? {
                    let span = variant.to_mapping();
                    if span.start <= end
                        && start <= span.end
                        && passes_maf(&variant, min_maf, include_missing_mafs)
                    {
                        found.push(variant);
                    }
                }
            }
        }
        found.sort_by_key(|v| v.pos);
        Ok(found)
    }
}

// ============================================================================
// Record conversion
// ============================================================================

/// True when the record's FILTER column is empty, missing, or PASS.
fn record_passes_filters(record: &bcf::Record) -> bool {
    let header = record.header();
    record
        .filters()
        .all(|id| matches!(header.id_to_name(id).as_slice(), b"PASS" | b"."))
}

/// Converts a VCF/BCF record to the internal form, deriving the MAF. Returns
/// `None` for records without a usable alternate allele.
fn variant_from_record(record: &bcf::Record) -> Result<Option<Variant>> {
    let rid = match record.rid() {
        Some(rid) => rid,
        None => return Ok(None),
    };
    let chrom = String::from_utf8_lossy(record.header().rid2name(rid)?).into_owned();
    let pos = record.pos() as usize + 1;

    let alleles = record.alleles();
    if alleles.len() < 2 {
        return Ok(None);
    }
    let ref_allele = String::from_utf8_lossy(alleles[0]).into_owned();
    let alt_allele = String::from_utf8_lossy(alleles[1]).into_owned();
    if alt_allele.starts_with('<') || alt_allele.contains('[') || alt_allele.contains(']') {
        // Symbolic and breakend alleles have no primer-masking footprint
        return Ok(None);
    }

    let id_bytes = record.id();
    let id = if id_bytes.is_empty() || id_bytes == b"." {
        format!("{}:{}", chrom, pos)
    } else {
        String::from_utf8_lossy(&id_bytes).into_owned()
    };

    let caf = record
        .info(b"CAF")
        .string()
        .ok()
        .flatten()
        .and_then(|values| values.first().map(|v| String::from_utf8_lossy(v).into_owned()));
    let afs = record
        .info(b"AF")
        .float()
        .ok()
        .flatten()
        .map(|values| values.iter().map(|f| *f as f64).collect::<Vec<f64>>());
    let acs = record
        .info(b"AC")
        .integer()
        .ok()
        .flatten()
        .map(|values| values.iter().map(|i| *i as i64).collect::<Vec<i64>>());
    let an = record
        .info(b"AN")
        .integer()
        .ok()
        .flatten()
        .and_then(|values| values.first().map(|i| *i as i64));
    let genotype_calls = count_genotype_calls(record);

    let maf = derive_maf(
        caf.as_deref(),
        afs.as_deref(),
        acs.as_deref(),
        an,
        genotype_calls,
    );

    Ok(Some(Variant::new(
        &id,
        &chrom,
        pos,
        &ref_allele,
        &alt_allele,
        maf,
    )))
}

/// Counts (non-reference, total) called alleles across all genotypes.
fn count_genotype_calls(record: &bcf::Record) -> Option<(usize, usize)> {
    let sample_count = record.sample_count() as usize;
    if sample_count == 0 {
        return None;
    }
    let genotypes = record.genotypes().ok()?;
    let mut called = 0usize;
    let mut non_ref = 0usize;
    for i in 0..sample_count {
        for allele in genotypes.get(i).iter() {
            match allele {
                GenotypeAllele::Unphased(a) | GenotypeAllele::Phased(a) => {
                    called += 1;
                    if *a > 0 {
                        non_ref += 1;
                    }
                }
                GenotypeAllele::UnphasedMissing | GenotypeAllele::PhasedMissing => {}
            }
        }
    }
    if called == 0 {
        None
    } else {
        Some((non_ref, called))
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn snp(pos: usize, maf: Option<f64>) -> Variant {
        Variant::new(&format!("rs{}", pos), "chr2", pos, "A", "C", maf)
    }

    #[test]
    fn test_variant_type() {
        assert_eq!(snp(10, None).variant_type(), VariantType::Snp);
        let ins = Variant::new("rs1", "chr1", 10, "A", "ACGT", None);
        assert_eq!(ins.variant_type(), VariantType::Insertion);
        let del = Variant::new("rs2", "chr1", 10, "CTA", "C", None);
        assert_eq!(del.variant_type(), VariantType::Deletion);
        let other = Variant::new("rs3", "chr1", 10, "CA", "GG", None);
        assert_eq!(other.variant_type(), VariantType::Other);
    }

    #[test]
    fn test_to_mapping_spans() {
        assert_eq!(snp(10, None).to_mapping().length(), 1);

        let ins = Variant::new("rs1", "chr1", 10, "A", "ACGT", None);
        let span = ins.to_mapping();
        assert_eq!((span.start, span.end), (10, 10));

        let del = Variant::new("rs2", "chr1", 10, "CTA", "C", None);
        let span = del.to_mapping();
        assert_eq!((span.start, span.end), (10, 12));

        let other = Variant::new("rs3", "chr1", 10, "CA", "GG", None);
        let span = other.to_mapping();
        assert_eq!((span.start, span.end), (10, 12));
    }

    #[test]
    fn test_derive_maf_priority() {
        // CAF wins over everything else
        let maf = derive_maf(Some("0.9988"), Some(&[0.5]), None, None, None).unwrap();
        assert!((maf - 0.0012).abs() < 1e-9);

        // Unparseable CAF falls through to AF
        let maf = derive_maf(Some("."), Some(&[0.1, 0.05]), None, None, None).unwrap();
        assert!((maf - 0.15).abs() < 1e-9);

        // AC/AN
        let maf = derive_maf(None, None, Some(&[3, 1]), Some(40), None).unwrap();
        assert!((maf - 0.1).abs() < 1e-9);

        // Genotype fraction
        let maf = derive_maf(None, None, None, None, Some((2, 8))).unwrap();
        assert!((maf - 0.25).abs() < 1e-9);

        // Nothing available
        assert!(derive_maf(None, None, None, Some(0), None).is_none());
    }

    #[test]
    fn test_passes_maf() {
        let common = snp(10, Some(0.2));
        let rare = snp(11, Some(0.0001));
        let unknown = snp(12, None);

        assert!(passes_maf(&rare, 0.0, false));
        assert!(passes_maf(&common, 0.01, false));
        assert!(!passes_maf(&rare, 0.01, false));
        assert!(!passes_maf(&unknown, 0.01, false));
        assert!(passes_maf(&unknown, 0.01, true));
    }

    #[test]
    fn test_cached_lookup_query() {
        let lookup_variants = vec![
            snp(100, Some(0.2)),
            snp(150, Some(0.001)),
            snp(300, Some(0.3)),
            Variant::new("rs_del", "chr2", 198, "CTA", "C", Some(0.2)),
            Variant::new("rs_other_chrom", "chr3", 100, "A", "C", Some(0.5)),
        ];
        let mut lookup = CachedVariantLookup::from_variants(lookup_variants);

        let hits = lookup.query("chr2", 90, 200, 0.01, false).unwrap();
        let ids: Vec<&str> = hits.iter().map(|v| v.id.as_str()).collect();
        assert_eq!(ids, vec!["rs100", "rs_del"]);

        // The deletion span (198-200) still overlaps a query starting at 200
        let hits = lookup.query("chr2", 200, 250, 0.01, false).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "rs_del");

        // min_maf <= 0 returns everything in range
        let hits = lookup.query("chr2", 90, 200, 0.0, false).unwrap();
        assert_eq!(hits.len(), 3);

        // Unknown chromosome is empty, not an error
        assert!(lookup.query("chrM", 1, 1000, 0.0, false).unwrap().is_empty());
    }
}
