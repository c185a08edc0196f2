//! Design Region and Masking
//!
//! Builds the template handed to the primer picker: the target expanded by
//! the maximum amplicon length (clamped to the chromosome), extracted
//! verbatim from the reference, plus a hard-masked copy in which positions
//! affected by qualifying variants are replaced with `N`.
//!
//! Masked positions per variant type:
//! - SNP: the variant position.
//! - Insertion: the position and the base after it.
//! - Deletion: the deleted bases (the anchor base is not masked).
//! - Other: the reference span plus one base.

use crate::error::Result;
use crate::mapping::{Mapping, Strand};
use crate::reference::ReferenceSource;
use crate::variant::{Variant, VariantLookup, VariantType};

/// The template for one design request. `soft_masked` is the reference slice
/// as retrieved (case preserved); `hard_masked` additionally carries `N` over
/// common-variant positions. Both strings have the region's length.
#[derive(Debug, Clone)]
pub struct DesignTemplate {
    pub target: Mapping,
    pub region: Mapping,
    pub soft_masked: String,
    pub hard_masked: String,
}

/// Expands the target symmetrically by `max_amplicon_length - target.length`
/// on each side, clamped to `[1, chromosome_length]`.
pub fn design_region(
    target: &Mapping,
    max_amplicon_length: usize,
    chromosome_length: usize,
) -> Result<Mapping> {
    let pad = max_amplicon_length.saturating_sub(target.length());
    let start = target.start.saturating_sub(pad).max(1);
    let end = (target.end + pad).min(chromosome_length);
    Mapping::new(&target.ref_name, start, end, Strand::Plus)
}

/// Builds the design template: fetches the region's bases and hard-masks the
/// positions of qualifying variants. Variants whose reconstructed positions
/// fall outside the region are ignored.
pub fn masked_template(
    target: &Mapping,
    region: &Mapping,
    reference: &mut dyn ReferenceSource,
    variants: Option<&mut dyn VariantLookup>,
    min_maf: f64,
    include_missing_mafs: bool,
) -> Result<DesignTemplate> {
    let soft_masked = reference.fetch(&region.ref_name, region.start, region.end)?;
    let mut hard = soft_masked.clone().into_bytes();

    if let Some(lookup) = variants {
        let overlapping = lookup.query(
            &region.ref_name,
            region.start,
            region.end,
            min_maf,
            include_missing_mafs,
        )?;
        for variant in &overlapping {
            for pos in mask_positions(variant) {
                if pos >= region.start && pos <= region.end {
                    hard[pos - region.start] = b'N';
                }
            }
        }
    }

    Ok(DesignTemplate {
        target: target.clone(),
        region: region.clone(),
        soft_masked,
        hard_masked: String::from_utf8(hard).expect("masking preserves UTF-8"),
    })
}

/// Reference positions to hard-mask for one variant.
fn mask_positions(variant: &Variant) -> Vec<usize> {
    let pos = variant.pos;
    match variant.variant_type() {
        VariantType::Snp => vec![pos],
        VariantType::Insertion => vec![pos, pos + 1],
        VariantType::Deletion => (pos + 1..pos + variant.ref_allele.len()).collect(),
        VariantType::Other => (pos..=pos + variant.ref_allele.len()).collect(),
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reference::InMemoryReference;
    use crate::variant::CachedVariantLookup;

    #[test]
    fn test_design_region_expansion() {
        let target = Mapping::new("chr1", 1000, 1099, Strand::Plus).unwrap();
        let region = design_region(&target, 250, 100_000).unwrap();
        assert_eq!(region.start, 850);
        assert_eq!(region.end, 1249);
    }

    #[test]
    fn test_design_region_clamped() {
        let target = Mapping::new("chr1", 50, 149, Strand::Plus).unwrap();
        let region = design_region(&target, 250, 250).unwrap();
        assert_eq!(region.start, 1);
        assert_eq!(region.end, 250);
    }

    const REGION_SEQ: &str = "AATATTCTTGCTGCTTATGCAGCTGACATTGTTGCCCTCCCTAAAGCAAC\
CAAGTAGCCTTTATTTCCCACAGTGAAAGAAAACGCTGGCCTATCAGTTACATTACAAAAG";

    const MASKED_SEQ: &str = "AATATTCTTGNTGCTTATGCNGCTGACATTGTTGCCCTCCCTAAAGCAAC\
NAAGTAGCCTNTATTTCCCANAGTGAAAGANNACGCTGGCCNNTCAGTTANNNTACAAAAG";

    fn scenario_reference() -> InMemoryReference {
        // chr2 with the literal design region placed at 9000-9110
        let chrom = format!("{}{}", "A".repeat(8999), REGION_SEQ);
        InMemoryReference::new(vec![("chr2".to_string(), chrom)])
    }

    fn scenario_variants() -> CachedVariantLookup {
        let common = Some(0.2);
        CachedVariantLookup::from_variants(vec![
            Variant::new("rs9000", "chr2", 9000, "A", "T", Some(0.0005)),
            Variant::new("rs9010", "chr2", 9010, "C", "T", common),
            Variant::new("rs9020", "chr2", 9020, "A", "G", common),
            Variant::new("rs9030", "chr2", 9030, "G", "C", Some(0.002)),
            Variant::new("rs9040", "chr2", 9040, "C", "A", Some(0.003)),
            Variant::new("rs9050", "chr2", 9050, "C", "G", Some(0.3)),
            Variant::new("rs9060", "chr2", 9060, "T", "C", common),
            Variant::new("rs9070", "chr2", 9070, "C", "A", common),
            Variant::new("rs9080", "chr2", 9080, "A", "ACGT", common),
            Variant::new("rs9090", "chr2", 9090, "CTA", "C", common),
            Variant::new("rs9100", "chr2", 9100, "CA", "GG", common),
        ])
    }

    #[test]
    fn test_masking_catalog() {
        let region = Mapping::new("chr2", 9000, 9110, Strand::Plus).unwrap();
        let target = Mapping::new("chr2", 9050, 9060, Strand::Plus).unwrap();
        let mut reference = scenario_reference();
        let mut variants = scenario_variants();

        let template = masked_template(
            &target,
            &region,
            &mut reference,
            Some(&mut variants),
            0.01,
            false,
        )
        .unwrap();

        assert_eq!(template.soft_masked, REGION_SEQ);
        assert_eq!(template.hard_masked, MASKED_SEQ);
    }

    #[test]
    fn test_masking_ignores_positions_outside_region() {
        // A deletion whose masked bases extend past the region end
        let region = Mapping::new("chr2", 9000, 9091, Strand::Plus).unwrap();
        let target = Mapping::new("chr2", 9050, 9060, Strand::Plus).unwrap();
        let mut reference = scenario_reference();
        let mut variants = CachedVariantLookup::from_variants(vec![Variant::new(
            "rs9090", "chr2", 9090, "CTA", "C",
            Some(0.2),
        )]);

        let template = masked_template(
            &target,
            &region,
            &mut reference,
            Some(&mut variants),
            0.01,
            false,
        )
        .unwrap();

        // Only 9091 is inside the region; 9092 is silently skipped
        let expected = {
            let mut bytes = REGION_SEQ[..92].as_bytes().to_vec();
            bytes[91] = b'N';
            String::from_utf8(bytes).unwrap()
        };
        assert_eq!(template.hard_masked, expected);
    }

    #[test]
    fn test_no_variant_lookup_leaves_template_unmasked() {
        let region = Mapping::new("chr2", 9000, 9110, Strand::Plus).unwrap();
        let target = Mapping::new("chr2", 9050, 9060, Strand::Plus).unwrap();
        let mut reference = scenario_reference();
        let template =
            masked_template(&target, &region, &mut reference, None, 0.01, false).unwrap();
        assert_eq!(template.hard_masked, template.soft_masked);
    }
}
