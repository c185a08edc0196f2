//! Design Parameters Module
//!
//! Parameter and weight bundles handed to the primer picker. Each bundle
//! serialises to `(tag, value)` pairs in a fixed order so that rendered
//! requests are stable across runs.

use crate::error::{Error, Result};

// ============================================================================
// Min/Opt/Max Triples
// ============================================================================

/// A min/optimal/max triple. `opt` equal to the type's zero value expresses
/// a disabled optimum (used by the amplicon-Tm constraint).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MinOptMax<T> {
    pub min: T,
    pub opt: T,
    pub max: T,
}

impl<T: PartialOrd + Default + Copy + std::fmt::Display> MinOptMax<T> {
    pub fn new(min: T, opt: T, max: T) -> Result<Self> {
        if min > max {
            return Err(Error::InvalidParameters(format!(
                "min ({}) > max ({})",
                min, max
            )));
        }
        let disabled = opt == T::default();
        if !disabled && (opt < min || opt > max) {
            return Err(Error::InvalidParameters(format!(
                "opt ({}) outside [{}, {}]",
                opt, min, max
            )));
        }
        Ok(Self { min, opt, max })
    }
}

// ============================================================================
// Design Parameters
// ============================================================================

/// Constraints for a single design request. Defaults follow the primer3
/// published defaults for primer size/Tm/GC; everything is overridable from
/// the command line.
#[derive(Debug, Clone, PartialEq)]
pub struct DesignParameters {
    /// Amplicon size constraint (bases).
    pub amplicon_sizes: MinOptMax<usize>,
    /// Amplicon melting temperature constraint; opt = 0 disables it.
    pub amplicon_tms: MinOptMax<f64>,
    /// Primer length constraint (bases).
    pub primer_sizes: MinOptMax<usize>,
    /// Primer melting temperature constraint (Celsius).
    pub primer_tms: MinOptMax<f64>,
    /// Primer GC content constraint (0-100).
    pub primer_gcs: MinOptMax<f64>,
    /// Minimum G/C count in the 3'-most five bases.
    pub gc_clamp: usize,
    /// Maximum G/C count in the 3'-most five bases.
    pub max_end_gc: usize,
    /// Maximum homopolymer length.
    pub primer_max_poly_x: usize,
    /// Maximum number of ambiguous bases per primer.
    pub primer_max_ns: usize,
    /// Maximum number of bases in a dinucleotide repeat run (post-filter;
    /// the picker cannot express this natively).
    pub primer_max_dinuc_bases: usize,
    /// Reject primers whose 3' end lands on soft-masked (lowercase) bases.
    pub avoid_masked_bases: bool,
    /// Number of candidates requested from the picker.
    pub num_to_return: usize,
}

impl Default for DesignParameters {
    fn default() -> Self {
        Self {
            amplicon_sizes: MinOptMax { min: 100, opt: 125, max: 150 },
            amplicon_tms: MinOptMax { min: 0.0, opt: 0.0, max: 100.0 },
            primer_sizes: MinOptMax { min: 18, opt: 21, max: 27 },
            primer_tms: MinOptMax { min: 57.0, opt: 60.0, max: 63.0 },
            primer_gcs: MinOptMax { min: 30.0, opt: 50.0, max: 65.0 },
            gc_clamp: 0,
            max_end_gc: 5,
            primer_max_poly_x: 5,
            primer_max_ns: 1,
            primer_max_dinuc_bases: 6,
            avoid_masked_bases: true,
            num_to_return: 200,
        }
    }
}

impl DesignParameters {
    /// Serialises the parameters to primer3 global tags in a fixed order.
    pub fn to_tags(&self) -> Vec<(String, String)> {
        let mut tags: Vec<(String, String)> = Vec::with_capacity(24);
        let mut push = |k: &str, v: String| tags.push((k.to_string(), v));

        push("PRIMER_NUM_RETURN", self.num_to_return.to_string());
        push(
            "PRIMER_PRODUCT_SIZE_RANGE",
            format!("{}-{}", self.amplicon_sizes.min, self.amplicon_sizes.max),
        );
        push(
            "PRIMER_PRODUCT_OPT_SIZE",
            self.amplicon_sizes.opt.to_string(),
        );
        if self.amplicon_tms.opt > 0.0 {
            push("PRIMER_PRODUCT_MIN_TM", format_float(self.amplicon_tms.min));
            push("PRIMER_PRODUCT_OPT_TM", format_float(self.amplicon_tms.opt));
            push("PRIMER_PRODUCT_MAX_TM", format_float(self.amplicon_tms.max));
        }
        push("PRIMER_MIN_SIZE", self.primer_sizes.min.to_string());
        push("PRIMER_OPT_SIZE", self.primer_sizes.opt.to_string());
        push("PRIMER_MAX_SIZE", self.primer_sizes.max.to_string());
        push("PRIMER_MIN_TM", format_float(self.primer_tms.min));
        push("PRIMER_OPT_TM", format_float(self.primer_tms.opt));
        push("PRIMER_MAX_TM", format_float(self.primer_tms.max));
        push("PRIMER_MIN_GC", format_float(self.primer_gcs.min));
        push("PRIMER_OPT_GC_PERCENT", format_float(self.primer_gcs.opt));
        push("PRIMER_MAX_GC", format_float(self.primer_gcs.max));
        push("PRIMER_GC_CLAMP", self.gc_clamp.to_string());
        push("PRIMER_MAX_END_GC", self.max_end_gc.to_string());
        push("PRIMER_MAX_POLY_X", self.primer_max_poly_x.to_string());
        push("PRIMER_MAX_NS_ACCEPTED", self.primer_max_ns.to_string());
        push(
            "PRIMER_LOWERCASE_MASKING",
            if self.avoid_masked_bases { "1" } else { "0" }.to_string(),
        );
        tags
    }
}

// ============================================================================
// Picker Weights
// ============================================================================

/// Per-criterion penalty multipliers for the picker's scoring function.
#[derive(Debug, Clone, PartialEq)]
pub struct PrimerWeights {
    pub product_size_lt: f64,
    pub product_size_gt: f64,
    pub product_tm_lt: f64,
    pub product_tm_gt: f64,
    pub end_stability: f64,
    pub gc_percent_lt: f64,
    pub gc_percent_gt: f64,
    pub self_any: f64,
    pub self_end: f64,
    pub size_lt: f64,
    pub size_gt: f64,
    pub tm_lt: f64,
    pub tm_gt: f64,
}

impl Default for PrimerWeights {
    fn default() -> Self {
        Self {
            product_size_lt: 1.0,
            product_size_gt: 1.0,
            product_tm_lt: 0.0,
            product_tm_gt: 0.0,
            end_stability: 0.25,
            gc_percent_lt: 0.25,
            gc_percent_gt: 0.25,
            self_any: 0.1,
            self_end: 0.1,
            size_lt: 0.15,
            size_gt: 0.15,
            tm_lt: 0.95,
            tm_gt: 0.95,
        }
    }
}

impl PrimerWeights {
    /// Serialises the weights to primer3 tags in a fixed order.
    pub fn to_tags(&self) -> Vec<(String, String)> {
        vec![
            ("PRIMER_PAIR_WT_PRODUCT_SIZE_LT".to_string(), format_float(self.product_size_lt)),
            ("PRIMER_PAIR_WT_PRODUCT_SIZE_GT".to_string(), format_float(self.product_size_gt)),
            ("PRIMER_PAIR_WT_PRODUCT_TM_LT".to_string(), format_float(self.product_tm_lt)),
            ("PRIMER_PAIR_WT_PRODUCT_TM_GT".to_string(), format_float(self.product_tm_gt)),
            ("PRIMER_WT_END_STABILITY".to_string(), format_float(self.end_stability)),
            ("PRIMER_WT_GC_PERCENT_LT".to_string(), format_float(self.gc_percent_lt)),
            ("PRIMER_WT_GC_PERCENT_GT".to_string(), format_float(self.gc_percent_gt)),
            ("PRIMER_WT_SELF_ANY".to_string(), format_float(self.self_any)),
            ("PRIMER_WT_SELF_END".to_string(), format_float(self.self_end)),
            ("PRIMER_WT_SIZE_LT".to_string(), format_float(self.size_lt)),
            ("PRIMER_WT_SIZE_GT".to_string(), format_float(self.size_gt)),
            ("PRIMER_WT_TM_LT".to_string(), format_float(self.tm_lt)),
            ("PRIMER_WT_TM_GT".to_string(), format_float(self.tm_gt)),
        ]
    }
}

/// Renders a float without a trailing `.0` ambiguity: whole values print as
/// integers, the rest with their natural precision.
fn format_float(v: f64) -> String {
    if v == v.trunc() {
        format!("{}", v as i64)
    } else {
        format!("{}", v)
    }
}
