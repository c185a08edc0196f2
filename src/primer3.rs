//! Primer Picker Driver
//!
//! A long-lived, stateful conversation with the primer3 executable. The
//! driver owns the child process, renders design requests into primer3's
//! tagged key/value format, reads tagged responses back, and turns them into
//! [`Primer`]/[`PrimerPair`] candidates plus a failure breakdown.
//!
//! # Protocol
//! Requests are `KEY=VALUE` lines terminated by a lone `=`; responses use the
//! same shape. The child is spawned with `-strict_tags` and stderr merged
//! into stdout, so any non-tag line in the response stream is tool error
//! text. Because primer3 echoes request tags back, only keys outside the
//! closed input-tag catalog are treated as response values.
//!
//! # Post-filters
//! primer3 cannot reject dinucleotide repeat runs natively, so candidates
//! whose longest run exceeds `primer_max_dinuc_bases` are dropped here and
//! surfaced in the failure breakdown as `LongDinuc`.

use log::warn;
use rustc_hash::{FxHashMap, FxHashSet};
use std::fmt;
use std::io::{pipe, BufRead, BufReader, LineWriter, PipeReader, Write};
use std::path::Path;
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::LazyLock;

use crate::error::{Error, Result};
use crate::mapping::{Mapping, Strand};
use crate::params::{DesignParameters, PrimerWeights};
use crate::primer::{Primer, PrimerPair};
use crate::reference::ReferenceSource;
use crate::region::{self, DesignTemplate};
use crate::seq;
use crate::variant::VariantLookup;

// ============================================================================
// Input Tag Catalog
// ============================================================================

/// Every valid primer3 input tag name, per the upstream manual. Used to tell
/// echoed request tags apart from response keys.
static INPUT_TAGS: LazyLock<FxHashSet<&'static str>> = LazyLock::new(|| {
    [
        // Sequence tags (scoped to a single design)
        "SEQUENCE_EXCLUDED_REGION",
        "SEQUENCE_FORCE_LEFT_END",
        "SEQUENCE_FORCE_LEFT_START",
        "SEQUENCE_FORCE_RIGHT_END",
        "SEQUENCE_FORCE_RIGHT_START",
        "SEQUENCE_ID",
        "SEQUENCE_INCLUDED_REGION",
        "SEQUENCE_INTERNAL_EXCLUDED_REGION",
        "SEQUENCE_INTERNAL_OLIGO",
        "SEQUENCE_OVERLAP_JUNCTION_LIST",
        "SEQUENCE_PRIMER",
        "SEQUENCE_PRIMER_PAIR_OK_REGION_LIST",
        "SEQUENCE_PRIMER_REVCOMP",
        "SEQUENCE_QUALITY",
        "SEQUENCE_START_CODON_POSITION",
        "SEQUENCE_TARGET",
        "SEQUENCE_TEMPLATE",
        // Global tags (persist across designs in one session)
        "PRIMER_DNA_CONC",
        "PRIMER_DNTP_CONC",
        "PRIMER_EXPLAIN_FLAG",
        "PRIMER_FIRST_BASE_INDEX",
        "PRIMER_GC_CLAMP",
        "PRIMER_INSIDE_PENALTY",
        "PRIMER_INTERNAL_DNA_CONC",
        "PRIMER_INTERNAL_DNTP_CONC",
        "PRIMER_INTERNAL_MAX_GC",
        "PRIMER_INTERNAL_MAX_HAIRPIN_TH",
        "PRIMER_INTERNAL_MAX_LIBRARY_MISHYB",
        "PRIMER_INTERNAL_MAX_NS_ACCEPTED",
        "PRIMER_INTERNAL_MAX_POLY_X",
        "PRIMER_INTERNAL_MAX_SELF_ANY",
        "PRIMER_INTERNAL_MAX_SELF_ANY_TH",
        "PRIMER_INTERNAL_MAX_SELF_END",
        "PRIMER_INTERNAL_MAX_SELF_END_TH",
        "PRIMER_INTERNAL_MAX_SIZE",
        "PRIMER_INTERNAL_MAX_TM",
        "PRIMER_INTERNAL_MIN_GC",
        "PRIMER_INTERNAL_MIN_QUALITY",
        "PRIMER_INTERNAL_MIN_SIZE",
        "PRIMER_INTERNAL_MIN_TM",
        "PRIMER_INTERNAL_MISHYB_LIBRARY",
        "PRIMER_INTERNAL_MUST_MATCH_FIVE_PRIME",
        "PRIMER_INTERNAL_MUST_MATCH_THREE_PRIME",
        "PRIMER_INTERNAL_OPT_GC_PERCENT",
        "PRIMER_INTERNAL_OPT_SIZE",
        "PRIMER_INTERNAL_OPT_TM",
        "PRIMER_INTERNAL_SALT_DIVALENT",
        "PRIMER_INTERNAL_SALT_MONOVALENT",
        "PRIMER_INTERNAL_WT_END_QUAL",
        "PRIMER_INTERNAL_WT_GC_PERCENT_GT",
        "PRIMER_INTERNAL_WT_GC_PERCENT_LT",
        "PRIMER_INTERNAL_WT_HAIRPIN_TH",
        "PRIMER_INTERNAL_WT_LIBRARY_MISHYB",
        "PRIMER_INTERNAL_WT_NUM_NS",
        "PRIMER_INTERNAL_WT_SELF_ANY",
        "PRIMER_INTERNAL_WT_SELF_ANY_TH",
        "PRIMER_INTERNAL_WT_SELF_END",
        "PRIMER_INTERNAL_WT_SELF_END_TH",
        "PRIMER_INTERNAL_WT_SEQ_QUAL",
        "PRIMER_INTERNAL_WT_SIZE_GT",
        "PRIMER_INTERNAL_WT_SIZE_LT",
        "PRIMER_INTERNAL_WT_TM_GT",
        "PRIMER_INTERNAL_WT_TM_LT",
        "PRIMER_LIBERAL_BASE",
        "PRIMER_LIB_AMBIGUITY_CODES_CONSENSUS",
        "PRIMER_LOWERCASE_MASKING",
        "PRIMER_MAX_END_GC",
        "PRIMER_MAX_END_STABILITY",
        "PRIMER_MAX_GC",
        "PRIMER_MAX_HAIRPIN_TH",
        "PRIMER_MAX_LIBRARY_MISPRIMING",
        "PRIMER_MAX_NS_ACCEPTED",
        "PRIMER_MAX_POLY_X",
        "PRIMER_MAX_SELF_ANY",
        "PRIMER_MAX_SELF_ANY_TH",
        "PRIMER_MAX_SELF_END",
        "PRIMER_MAX_SELF_END_TH",
        "PRIMER_MAX_SIZE",
        "PRIMER_MAX_TEMPLATE_MISPRIMING",
        "PRIMER_MAX_TEMPLATE_MISPRIMING_TH",
        "PRIMER_MAX_TM",
        "PRIMER_MIN_3_PRIME_OVERLAP_OF_JUNCTION",
        "PRIMER_MIN_5_PRIME_OVERLAP_OF_JUNCTION",
        "PRIMER_MIN_END_QUALITY",
        "PRIMER_MIN_GC",
        "PRIMER_MIN_LEFT_THREE_PRIME_DISTANCE",
        "PRIMER_MIN_QUALITY",
        "PRIMER_MIN_RIGHT_THREE_PRIME_DISTANCE",
        "PRIMER_MIN_SIZE",
        "PRIMER_MIN_THREE_PRIME_DISTANCE",
        "PRIMER_MIN_TM",
        "PRIMER_MISPRIMING_LIBRARY",
        "PRIMER_MUST_MATCH_FIVE_PRIME",
        "PRIMER_MUST_MATCH_THREE_PRIME",
        "PRIMER_NUM_RETURN",
        "PRIMER_OPT_GC_PERCENT",
        "PRIMER_OPT_SIZE",
        "PRIMER_OPT_TM",
        "PRIMER_OUTSIDE_PENALTY",
        "PRIMER_PAIR_MAX_COMPL_ANY",
        "PRIMER_PAIR_MAX_COMPL_ANY_TH",
        "PRIMER_PAIR_MAX_COMPL_END",
        "PRIMER_PAIR_MAX_COMPL_END_TH",
        "PRIMER_PAIR_MAX_DIFF_TM",
        "PRIMER_PAIR_MAX_LIBRARY_MISPRIMING",
        "PRIMER_PAIR_MAX_TEMPLATE_MISPRIMING",
        "PRIMER_PAIR_MAX_TEMPLATE_MISPRIMING_TH",
        "PRIMER_PAIR_WT_COMPL_ANY",
        "PRIMER_PAIR_WT_COMPL_ANY_TH",
        "PRIMER_PAIR_WT_COMPL_END",
        "PRIMER_PAIR_WT_COMPL_END_TH",
        "PRIMER_PAIR_WT_DIFF_TM",
        "PRIMER_PAIR_WT_IO_PENALTY",
        "PRIMER_PAIR_WT_LIBRARY_MISPRIMING",
        "PRIMER_PAIR_WT_PRODUCT_SIZE_GT",
        "PRIMER_PAIR_WT_PRODUCT_SIZE_LT",
        "PRIMER_PAIR_WT_PRODUCT_TM_GT",
        "PRIMER_PAIR_WT_PRODUCT_TM_LT",
        "PRIMER_PAIR_WT_PR_PENALTY",
        "PRIMER_PAIR_WT_TEMPLATE_MISPRIMING",
        "PRIMER_PAIR_WT_TEMPLATE_MISPRIMING_TH",
        "PRIMER_PICK_ANYWAY",
        "PRIMER_PICK_INTERNAL_OLIGO",
        "PRIMER_PICK_LEFT_PRIMER",
        "PRIMER_PICK_RIGHT_PRIMER",
        "PRIMER_PRODUCT_MAX_TM",
        "PRIMER_PRODUCT_MIN_TM",
        "PRIMER_PRODUCT_OPT_SIZE",
        "PRIMER_PRODUCT_OPT_TM",
        "PRIMER_PRODUCT_SIZE_RANGE",
        "PRIMER_QUALITY_RANGE_MAX",
        "PRIMER_QUALITY_RANGE_MIN",
        "PRIMER_SALT_CORRECTIONS",
        "PRIMER_SALT_DIVALENT",
        "PRIMER_SALT_MONOVALENT",
        "PRIMER_SEQUENCING_ACCURACY",
        "PRIMER_SEQUENCING_INTERVAL",
        "PRIMER_SEQUENCING_LEAD",
        "PRIMER_SEQUENCING_SPACING",
        "PRIMER_TASK",
        "PRIMER_THERMODYNAMIC_OLIGO_ALIGNMENT",
        "PRIMER_THERMODYNAMIC_PARAMETERS_PATH",
        "PRIMER_THERMODYNAMIC_TEMPLATE_ALIGNMENT",
        "PRIMER_TM_FORMULA",
        "PRIMER_WT_END_QUAL",
        "PRIMER_WT_END_STABILITY",
        "PRIMER_WT_GC_PERCENT_GT",
        "PRIMER_WT_GC_PERCENT_LT",
        "PRIMER_WT_HAIRPIN_TH",
        "PRIMER_WT_LIBRARY_MISPRIMING",
        "PRIMER_WT_NUM_NS",
        "PRIMER_WT_POS_PENALTY",
        "PRIMER_WT_SELF_ANY",
        "PRIMER_WT_SELF_ANY_TH",
        "PRIMER_WT_SELF_END",
        "PRIMER_WT_SELF_END_TH",
        "PRIMER_WT_SEQ_QUAL",
        "PRIMER_WT_SIZE_GT",
        "PRIMER_WT_SIZE_LT",
        "PRIMER_WT_TEMPLATE_MISPRIMING",
        "PRIMER_WT_TEMPLATE_MISPRIMING_TH",
        "PRIMER_WT_TM_GT",
        "PRIMER_WT_TM_LT",
    ]
    .into_iter()
    .collect()
});

// ============================================================================
// Design Tasks
// ============================================================================

/// What to ask the picker for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DesignTask {
    /// Left + right primers bounding the target.
    PairDesign,
    /// A list of left primers upstream of the target.
    LeftPrimers,
    /// A list of right primers downstream of the target.
    RightPrimers,
}

impl DesignTask {
    /// Task-specific request tags. Coordinates inside the request are
    /// region-relative and 1-based.
    fn tags(&self, target: &Mapping, design: &Mapping) -> Vec<(String, String)> {
        let target_start = target.start - design.start + 1;
        let target_end = target.end - design.start + 1;
        match self {
            DesignTask::PairDesign => vec![
                ("PRIMER_TASK".to_string(), "generic".to_string()),
                ("PRIMER_PICK_LEFT_PRIMER".to_string(), "1".to_string()),
                ("PRIMER_PICK_RIGHT_PRIMER".to_string(), "1".to_string()),
                ("PRIMER_PICK_INTERNAL_OLIGO".to_string(), "0".to_string()),
                (
                    "SEQUENCE_TARGET".to_string(),
                    format!("{},{}", target_start, target.length()),
                ),
            ],
            DesignTask::LeftPrimers => vec![
                ("PRIMER_TASK".to_string(), "pick_primer_list".to_string()),
                ("PRIMER_PICK_LEFT_PRIMER".to_string(), "1".to_string()),
                ("PRIMER_PICK_RIGHT_PRIMER".to_string(), "0".to_string()),
                ("PRIMER_PICK_INTERNAL_OLIGO".to_string(), "0".to_string()),
                (
                    "SEQUENCE_INCLUDED_REGION".to_string(),
                    format!("1,{}", target_start - 1),
                ),
            ],
            DesignTask::RightPrimers => vec![
                ("PRIMER_TASK".to_string(), "pick_primer_list".to_string()),
                ("PRIMER_PICK_LEFT_PRIMER".to_string(), "0".to_string()),
                ("PRIMER_PICK_RIGHT_PRIMER".to_string(), "1".to_string()),
                ("PRIMER_PICK_INTERNAL_OLIGO".to_string(), "0".to_string()),
                (
                    "SEQUENCE_INCLUDED_REGION".to_string(),
                    format!("{},{}", target_end + 1, design.length() - target_end),
                ),
            ],
        }
    }

    fn count_tag(&self) -> &'static str {
        match self {
            DesignTask::PairDesign => "PRIMER_PAIR_NUM_RETURNED",
            DesignTask::LeftPrimers => "PRIMER_LEFT_NUM_RETURNED",
            DesignTask::RightPrimers => "PRIMER_RIGHT_NUM_RETURNED",
        }
    }
}

// ============================================================================
// Failure Reasons
// ============================================================================

/// Why the picker rejected candidate primers, as a closed enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureReason {
    GcClamp,
    GcContent,
    Hairpin,
    HighAnyCompl,
    HighEndCompl,
    HighTm,
    LowTm,
    LongPolyX,
    LowercaseMasking,
    TooManyNs,
    InTarget,
    InExcludedRegion,
    /// Post-filter rejection: dinucleotide repeat run too long.
    LongDinuc,
}

impl FailureReason {
    /// Maps a primer3 explanation reason string to the enumeration.
    fn from_reason(reason: &str) -> Option<Self> {
        match reason {
            "GC clamp failed" => Some(FailureReason::GcClamp),
            "GC content failed" => Some(FailureReason::GcContent),
            "high hairpin stability" | "hairpin stability" => Some(FailureReason::Hairpin),
            "high any compl" => Some(FailureReason::HighAnyCompl),
            "high end compl" => Some(FailureReason::HighEndCompl),
            "high tm" => Some(FailureReason::HighTm),
            "low tm" => Some(FailureReason::LowTm),
            "long poly-x seq" => Some(FailureReason::LongPolyX),
            "lowercase masking of 3' end" => Some(FailureReason::LowercaseMasking),
            "too many Ns" => Some(FailureReason::TooManyNs),
            "in target" => Some(FailureReason::InTarget),
            "in excluded region" => Some(FailureReason::InExcludedRegion),
            _ => None,
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FailureReason::GcClamp => "GcClamp",
            FailureReason::GcContent => "GcContent",
            FailureReason::Hairpin => "Hairpin",
            FailureReason::HighAnyCompl => "HighAnyCompl",
            FailureReason::HighEndCompl => "HighEndCompl",
            FailureReason::HighTm => "HighTm",
            FailureReason::LowTm => "LowTm",
            FailureReason::LongPolyX => "LongPolyX",
            FailureReason::LowercaseMasking => "LowercaseMasking",
            FailureReason::TooManyNs => "TooManyNs",
            FailureReason::InTarget => "InTarget",
            FailureReason::InExcludedRegion => "InExcludedRegion",
            FailureReason::LongDinuc => "LongDinuc",
        };
        write!(f, "{}", name)
    }
}

/// One failure reason with its summed candidate count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailureCount {
    pub reason: FailureReason,
    pub count: usize,
}

/// Merges picker explanation strings into a failure breakdown, sorted by
/// count descending. Explanations are comma-delimited `<reason> <count>`
/// tokens; `ok` and `considered` are bookkeeping, not failures. Unknown
/// reasons are logged and dropped. `long_dinuc_count` is appended for the
/// post-filter when non-zero.
pub fn parse_failures(explanations: &[&str], long_dinuc_count: usize) -> Vec<FailureCount> {
    let mut counts: FxHashMap<FailureReason, usize> = FxHashMap::default();
    for explanation in explanations {
        for token in explanation.split(',') {
            let token = token.trim();
            if token.is_empty() {
                continue;
            }
            let parsed = token
                .rsplit_once(' ')
                .and_then(|(reason, count)| Some((reason.trim(), count.parse::<usize>().ok()?)));
            let (reason, count) = match parsed {
                Some(pair) => pair,
                None => {
                    warn!("malformed primer3 explanation token: {:?}", token);
                    continue;
                }
            };
            if reason == "ok" || reason == "considered" {
                continue;
            }
            match FailureReason::from_reason(reason) {
                Some(kind) => *counts.entry(kind).or_default() += count,
                None => warn!("unknown primer3 failure reason: {:?}", reason),
            }
        }
    }
    if long_dinuc_count > 0 {
        *counts.entry(FailureReason::LongDinuc).or_default() += long_dinuc_count;
    }
    let mut failures: Vec<FailureCount> = counts
        .into_iter()
        .map(|(reason, count)| FailureCount { reason, count })
        .collect();
    failures.sort_by(|a, b| {
        b.count
            .cmp(&a.count)
            .then_with(|| a.reason.to_string().cmp(&b.reason.to_string()))
    });
    failures
}

// ============================================================================
// Request / Response plumbing
// ============================================================================

/// Assembles the full request tag list: globals, task tags, parameters,
/// weights, and the template last. Later occurrences of a key override
/// earlier ones in place, keeping the emission order deterministic.
fn request_tags(
    params: &DesignParameters,
    weights: &PrimerWeights,
    template: &DesignTemplate,
    task: DesignTask,
) -> Vec<(String, String)> {
    fn add(tags: &mut Vec<(String, String)>, pairs: Vec<(String, String)>) {
        for (key, value) in pairs {
            match tags.iter_mut().find(|(k, _)| *k == key) {
                Some(slot) => slot.1 = value,
                None => tags.push((key, value)),
            }
        }
    }

    let mut tags: Vec<(String, String)> = Vec::with_capacity(48);
    add(
        &mut tags,
        vec![
            ("PRIMER_FIRST_BASE_INDEX".to_string(), "1".to_string()),
            ("PRIMER_EXPLAIN_FLAG".to_string(), "1".to_string()),
        ],
    );
    add(&mut tags, task.tags(&template.target, &template.region));
    add(&mut tags, params.to_tags());
    add(&mut tags, weights.to_tags());
    add(
        &mut tags,
        vec![("SEQUENCE_TEMPLATE".to_string(), template.hard_masked.clone())],
    );
    tags
}

/// A parsed picker response: the response-key map plus any non-tag lines.
struct Primer3Response {
    outputs: FxHashMap<String, String>,
    error_lines: Vec<String>,
}

/// Reads one tagged response up to the lone `=` terminator. Blank lines are
/// skipped; lines without `=` accumulate as error text; echoed input tags are
/// discarded so they cannot shadow response values.
fn read_response<R: BufRead>(reader: &mut R) -> Result<Primer3Response> {
    let mut outputs = FxHashMap::default();
    let mut error_lines = Vec::new();
    let mut line = String::with_capacity(256);
    loop {
        line.clear();
        if reader.read_line(&mut line)? == 0 {
            return Err(Error::Primer3 {
                message: "primer3 closed its output before the record terminator".to_string(),
                error_lines,
                primer3_error: None,
            });
        }
        let trimmed = line.trim_end_matches(['\r', '\n']);
        if trimmed == "=" {
            break;
        }
        if trimmed.is_empty() {
            continue;
        }
        match trimmed.split_once('=') {
            Some((key, value)) => {
                if !INPUT_TAGS.contains(key) {
                    outputs.insert(key.to_string(), value.to_string());
                }
            }
            None => error_lines.push(trimmed.to_string()),
        }
    }
    Ok(Primer3Response {
        outputs,
        error_lines,
    })
}

impl Primer3Response {
    /// Promotes accumulated error text or a `PRIMER_ERROR` payload to a
    /// failure.
    fn into_outputs(self) -> Result<FxHashMap<String, String>> {
        let primer3_error = self.outputs.get("PRIMER_ERROR").cloned();
        if !self.error_lines.is_empty() || primer3_error.is_some() {
            return Err(Error::Primer3 {
                message: primer3_error
                    .clone()
                    .unwrap_or_else(|| "primer3 wrote error text".to_string()),
                error_lines: self.error_lines,
                primer3_error,
            });
        }
        Ok(self.outputs)
    }
}

// ============================================================================
// Response parsing
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Left,
    Right,
}

impl Side {
    fn tag(&self) -> &'static str {
        match self {
            Side::Left => "LEFT",
            Side::Right => "RIGHT",
        }
    }
}

trait OutputMap {
    fn as_str(&self, key: &str) -> Result<&str>;
    fn as_usize(&self, key: &str) -> Result<usize>;
    fn as_f64(&self, key: &str) -> Result<f64>;
}

impl OutputMap for FxHashMap<String, String> {
    fn as_str(&self, key: &str) -> Result<&str> {
        self.get(key).map(|s| s.as_str()).ok_or_else(|| Error::Primer3 {
            message: format!("missing {} in primer3 response", key),
            error_lines: vec![],
            primer3_error: None,
        })
    }

    fn as_usize(&self, key: &str) -> Result<usize> {
        self.as_str(key)?.trim().parse().map_err(|_| Error::Primer3 {
            message: format!("non-integer {} in primer3 response", key),
            error_lines: vec![],
            primer3_error: None,
        })
    }

    fn as_f64(&self, key: &str) -> Result<f64> {
        self.as_str(key)?.trim().parse().map_err(|_| Error::Primer3 {
            message: format!("non-numeric {} in primer3 response", key),
            error_lines: vec![],
            primer3_error: None,
        })
    }
}

/// Builds the i-th primer of a side from the response. Positions in the
/// response are region-relative and 1-based; for the right side the reported
/// position is the 3'-most base and the length extends backwards. Bases come
/// from the un-masked region sequence, reverse-complemented on the negative
/// strand.
fn parse_primer(
    outputs: &FxHashMap<String, String>,
    side: Side,
    index: usize,
    template: &DesignTemplate,
) -> Result<Primer> {
    let key = format!("PRIMER_{}_{}", side.tag(), index);
    let value = outputs.as_str(&key)?;
    let (pos, len) = value
        .split_once(',')
        .and_then(|(p, l)| Some((p.trim().parse::<usize>().ok()?, l.trim().parse::<usize>().ok()?)))
        .ok_or_else(|| Error::Primer3 {
            message: format!("malformed {}: {:?}", key, value),
            error_lines: vec![],
            primer3_error: None,
        })?;

    let mapping = match side {
        Side::Left => template.region.resolve(pos, len, Strand::Plus)?,
        Side::Right => {
            // The reported position is the 3'-most base
            if len > pos {
                return Err(Error::Primer3 {
                    message: format!("{} extends before the design region: {:?}", key, value),
                    error_lines: vec![],
                    primer3_error: None,
                });
            }
            template.region.resolve(pos + 1 - len, len, Strand::Minus)?
        }
    };

    let offset = mapping.start - template.region.start;
    let slice = &template.soft_masked[offset..offset + mapping.length()];
    let bases = match mapping.strand {
        Strand::Plus => slice.to_string(),
        Strand::Minus => seq::reverse_complement(slice),
    };

    let tm = outputs.as_f64(&format!("{}_TM", key))?;
    let penalty = outputs.as_f64(&format!("{}_PENALTY", key))?;
    Primer::new(&bases, tm, penalty, mapping)
}

/// Builds the i-th pair: both primers, the amplicon spanning them, and the
/// amplicon sequence sliced from the un-masked template.
fn parse_pair(
    outputs: &FxHashMap<String, String>,
    index: usize,
    template: &DesignTemplate,
) -> Result<PrimerPair> {
    let left = parse_primer(outputs, Side::Left, index, template)?;
    let right = parse_primer(outputs, Side::Right, index, template)?;
    let amplicon = Mapping::new(
        &template.region.ref_name,
        left.mapping.start,
        right.mapping.end,
        Strand::Plus,
    )?;
    let offset = amplicon.start - template.region.start;
    let amplicon_sequence = &template.soft_masked[offset..offset + amplicon.length()];
    let tm = outputs.as_f64(&format!("PRIMER_PAIR_{}_PRODUCT_TM", index))?;
    let penalty = outputs.as_f64(&format!("PRIMER_PAIR_{}_PENALTY", index))?;
    PrimerPair::new(left, right, amplicon, amplicon_sequence, tm, penalty)
}

/// Explanation strings present in the response, in left/right/pair order.
fn explanations(outputs: &FxHashMap<String, String>) -> Vec<&str> {
    ["PRIMER_LEFT_EXPLAIN", "PRIMER_RIGHT_EXPLAIN", "PRIMER_PAIR_EXPLAIN"]
        .iter()
        .filter_map(|key| outputs.get(*key).map(|s| s.as_str()))
        .collect()
}

// ============================================================================
// Post-filters
// ============================================================================

/// Splits primers into keepers and the set of dropped sequences (deduplicated
/// by bases) under the dinucleotide-run limit.
fn filter_primers_by_dinuc(
    primers: Vec<Primer>,
    max_dinuc_bases: usize,
) -> (Vec<Primer>, FxHashSet<String>) {
    let mut dropped = FxHashSet::default();
    let kept = primers
        .into_iter()
        .filter(|primer| {
            if seq::longest_dinuc_run(&primer.bases) > max_dinuc_bases {
                dropped.insert(primer.bases.clone());
                false
            } else {
                true
            }
        })
        .collect();
    (kept, dropped)
}

/// Pair variant of the dinucleotide post-filter: a pair is dropped when
/// either primer fails; every failing primer counts once per unique sequence.
fn filter_pairs_by_dinuc(
    pairs: Vec<PrimerPair>,
    max_dinuc_bases: usize,
) -> (Vec<PrimerPair>, FxHashSet<String>) {
    let mut dropped = FxHashSet::default();
    let kept = pairs
        .into_iter()
        .filter(|pair| {
            let left_bad = seq::longest_dinuc_run(&pair.left.bases) > max_dinuc_bases;
            let right_bad = seq::longest_dinuc_run(&pair.right.bases) > max_dinuc_bases;
            if left_bad {
                dropped.insert(pair.left.bases.clone());
            }
            if right_bad {
                dropped.insert(pair.right.bases.clone());
            }
            !(left_bad || right_bad)
        })
        .collect();
    (kept, dropped)
}

// ============================================================================
// Driver
// ============================================================================

/// Result of a pair design request.
#[derive(Debug)]
pub struct PairDesignResult {
    pub pairs: Vec<PrimerPair>,
    pub failures: Vec<FailureCount>,
    pub template: DesignTemplate,
}

/// Result of a single-side design request.
#[derive(Debug)]
pub struct PrimerDesignResult {
    pub primers: Vec<Primer>,
    pub failures: Vec<FailureCount>,
    pub template: DesignTemplate,
}

/// The primer3 driver. Holds the child process for its lifetime; all design
/// requests are served over one stdin/stdout conversation.
pub struct Primer3 {
    child: Option<Child>,
    to_child: Option<LineWriter<ChildStdin>>,
    from_child: BufReader<PipeReader>,
    reference: Box<dyn ReferenceSource>,
    variants: Option<Box<dyn VariantLookup>>,
    pub params: DesignParameters,
    pub weights: PrimerWeights,
    min_maf: f64,
    include_missing_mafs: bool,
}

impl Primer3 {
    /// Spawns the picker with `-strict_tags`, merging its stderr into the
    /// response stream.
    #[allow(clippy::too_many_arguments)]
    pub fn spawn(
        executable: &Path,
        reference: Box<dyn ReferenceSource>,
        variants: Option<Box<dyn VariantLookup>>,
        params: DesignParameters,
        weights: PrimerWeights,
        min_maf: f64,
        include_missing_mafs: bool,
    ) -> Result<Self> {
        let (reader, writer) = pipe()?;
        let mut child = Command::new(executable)
            .arg("-strict_tags")
            .stdin(Stdio::piped())
            .stdout(writer.try_clone()?)
            .stderr(writer)
            .spawn()?;
        let stdin = child.stdin.take().expect("child stdin is piped");
        Ok(Self {
            child: Some(child),
            to_child: Some(LineWriter::new(stdin)),
            from_child: BufReader::new(reader),
            reference,
            variants,
            params,
            weights,
            min_maf,
            include_missing_mafs,
        })
    }

    /// Designs left+right primer pairs bounding the target.
    pub fn design_pairs(&mut self, target: &Mapping) -> Result<PairDesignResult> {
        let template = self.template_for(target)?;
        let outputs = self.roundtrip(&template, DesignTask::PairDesign)?;
        let count = outputs.as_usize(DesignTask::PairDesign.count_tag())?;
        let mut pairs = Vec::with_capacity(count);
        for i in 0..count {
            pairs.push(parse_pair(&outputs, i, &template)?);
        }
        let (pairs, dropped) = filter_pairs_by_dinuc(pairs, self.params.primer_max_dinuc_bases);
        let failures = parse_failures(&explanations(&outputs), dropped.len());
        Ok(PairDesignResult {
            pairs,
            failures,
            template,
        })
    }

    /// Designs a list of primers on one side of the target.
    pub fn design_primers(&mut self, target: &Mapping, task: DesignTask) -> Result<PrimerDesignResult> {
        let side = match task {
            DesignTask::LeftPrimers => Side::Left,
            DesignTask::RightPrimers => Side::Right,
            DesignTask::PairDesign => {
                return Err(Error::Primer3 {
                    message: "pair designs go through design_pairs".to_string(),
                    error_lines: vec![],
                    primer3_error: None,
                })
            }
        };
        let template = self.template_for(target)?;
        let outputs = self.roundtrip(&template, task)?;
        let count = outputs.as_usize(task.count_tag())?;
        let mut primers = Vec::with_capacity(count);
        for i in 0..count {
            primers.push(parse_primer(&outputs, side, i, &template)?);
        }
        let (primers, dropped) = filter_primers_by_dinuc(primers, self.params.primer_max_dinuc_bases);
        let failures = parse_failures(&explanations(&outputs), dropped.len());
        Ok(PrimerDesignResult {
            primers,
            failures,
            template,
        })
    }

    /// Builds the design region and masked template for a target.
    fn template_for(&mut self, target: &Mapping) -> Result<DesignTemplate> {
        let chromosome_length = self.reference.reference_length(&target.ref_name)?;
        let design = region::design_region(target, self.params.amplicon_sizes.max, chromosome_length)?;
        region::masked_template(
            target,
            &design,
            self.reference.as_mut(),
            self.variants.as_deref_mut(),
            self.min_maf,
            self.include_missing_mafs,
        )
    }

    /// Writes one request and reads the matching response.
    fn roundtrip(
        &mut self,
        template: &DesignTemplate,
        task: DesignTask,
    ) -> Result<FxHashMap<String, String>> {
        let tags = request_tags(&self.params, &self.weights, template, task);
        let writer = self.to_child.as_mut().ok_or_else(|| Error::Primer3 {
            message: "primer3 driver is closed".to_string(),
            error_lines: vec![],
            primer3_error: None,
        })?;
        for (key, value) in &tags {
            writeln!(writer, "{}={}", key, value)?;
        }
        writeln!(writer, "=")?;
        writer.flush()?;
        read_response(&mut self.from_child)?.into_outputs()
    }

    /// Terminates the child and closes both streams. Idempotent.
    pub fn close(&mut self) {
        self.to_child.take();
        if let Some(mut child) = self.child.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

impl Drop for Primer3 {
    fn drop(&mut self) {
        self.close();
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn template_with(region_seq: &str, region_start: usize, target: (usize, usize)) -> DesignTemplate {
        let region_end = region_start + region_seq.len() - 1;
        DesignTemplate {
            target: Mapping::new("chr1", target.0, target.1, Strand::Plus).unwrap(),
            region: Mapping::new("chr1", region_start, region_end, Strand::Plus).unwrap(),
            soft_masked: region_seq.to_string(),
            hard_masked: region_seq.to_string(),
        }
    }

    #[test]
    fn test_failure_merge() {
        let left = "considered 3285, GC clamp failed 16, low tm 24, long poly-x seq 12, \
lowercase masking of 3' end 3208, ok 25";
        let right = "considered 2992, GC clamp failed 26, low tm 28, high tm 32, \
long poly-x seq 13, lowercase masking of 3' end 2824, ok 61";
        let failures = parse_failures(&[left, right], 0);
        let expected = vec![
            (FailureReason::LowercaseMasking, 6032),
            (FailureReason::LowTm, 52),
            (FailureReason::GcClamp, 42),
            (FailureReason::HighTm, 32),
            (FailureReason::LongPolyX, 25),
        ];
        let got: Vec<(FailureReason, usize)> =
            failures.iter().map(|f| (f.reason, f.count)).collect();
        assert_eq!(got, expected);
    }

    #[test]
    fn test_unknown_reason_is_dropped() {
        let failures = parse_failures(&["considered 1000, wib-wobbled 100, ok 900"], 0);
        assert!(failures.is_empty());
    }

    #[test]
    fn test_considered_and_ok_are_not_failures() {
        let failures = parse_failures(&["considered 120, ok 120"], 0);
        assert!(failures.is_empty());
    }

    #[test]
    fn test_long_dinuc_appended() {
        let failures = parse_failures(&["considered 10, low tm 2, ok 8"], 5);
        let got: Vec<(FailureReason, usize)> =
            failures.iter().map(|f| (f.reason, f.count)).collect();
        assert_eq!(
            got,
            vec![(FailureReason::LongDinuc, 5), (FailureReason::LowTm, 2)]
        );
    }

    #[test]
    fn test_read_response_suppresses_echoes() {
        let body = "PRIMER_TASK=generic\nPRIMER_LEFT_NUM_RETURNED=1\n\nPRIMER_LEFT_0=10,20\n=\n";
        let mut cursor = Cursor::new(body);
        let response = read_response(&mut cursor).unwrap();
        // The echoed input tag must not appear among response keys
        assert!(!response.outputs.contains_key("PRIMER_TASK"));
        assert_eq!(response.outputs.get("PRIMER_LEFT_NUM_RETURNED").unwrap(), "1");
        assert_eq!(response.outputs.get("PRIMER_LEFT_0").unwrap(), "10,20");
        assert!(response.error_lines.is_empty());
    }

    #[test]
    fn test_read_response_collects_error_lines() {
        let body = "oops something broke\nPRIMER_LEFT_NUM_RETURNED=0\n=\n";
        let mut cursor = Cursor::new(body);
        let response = read_response(&mut cursor).unwrap();
        assert_eq!(response.error_lines, vec!["oops something broke".to_string()]);
        let err = response.into_outputs().unwrap_err();
        match err {
            Error::Primer3 { error_lines, .. } => {
                assert_eq!(error_lines.len(), 1);
            }
            other => panic!("expected Primer3 error, got {:?}", other),
        }
    }

    #[test]
    fn test_read_response_premature_close() {
        let body = "PRIMER_LEFT_NUM_RETURNED=0\n";
        let mut cursor = Cursor::new(body);
        assert!(read_response(&mut cursor).is_err());
    }

    #[test]
    fn test_primer_error_payload() {
        let body = "PRIMER_ERROR=SEQUENCE_TEMPLATE is missing\n=\n";
        let mut cursor = Cursor::new(body);
        let err = read_response(&mut cursor).unwrap().into_outputs().unwrap_err();
        match err {
            Error::Primer3 { primer3_error, .. } => {
                assert_eq!(primer3_error.as_deref(), Some("SEQUENCE_TEMPLATE is missing"));
            }
            other => panic!("expected Primer3 error, got {:?}", other),
        }
    }

    #[test]
    fn test_request_tags_template_last() {
        let template = template_with(&"ACGT".repeat(50), 1000, (1080, 1099));
        let tags = request_tags(
            &DesignParameters::default(),
            &PrimerWeights::default(),
            &template,
            DesignTask::PairDesign,
        );
        assert_eq!(tags[0].0, "PRIMER_FIRST_BASE_INDEX");
        assert_eq!(tags[1].0, "PRIMER_EXPLAIN_FLAG");
        let last = tags.last().unwrap();
        assert_eq!(last.0, "SEQUENCE_TEMPLATE");
        assert_eq!(last.1, template.hard_masked);
        // Every key appears once
        let mut keys: Vec<&str> = tags.iter().map(|(k, _)| k.as_str()).collect();
        keys.sort_unstable();
        keys.dedup();
        assert_eq!(keys.len(), tags.len());
        // All request keys are recognised input tags
        assert!(tags.iter().all(|(k, _)| INPUT_TAGS.contains(k.as_str())));
    }

    #[test]
    fn test_task_tags() {
        let template = template_with(&"ACGT".repeat(100), 1000, (1150, 1199));
        let tags = DesignTask::PairDesign.tags(&template.target, &template.region);
        assert!(tags.contains(&("SEQUENCE_TARGET".to_string(), "151,50".to_string())));

        let tags = DesignTask::LeftPrimers.tags(&template.target, &template.region);
        assert!(tags.contains(&("SEQUENCE_INCLUDED_REGION".to_string(), "1,150".to_string())));

        // Region is 400 long; the target ends at offset 200
        let tags = DesignTask::RightPrimers.tags(&template.target, &template.region);
        assert!(tags.contains(&("SEQUENCE_INCLUDED_REGION".to_string(), "201,200".to_string())));
    }

    #[test]
    fn test_parse_left_primer() {
        let region_seq = "AATATTCTTGCTGCTTATGCAGCTGACATTGTTGCCCTCCCTAAAGCAAC";
        let template = template_with(region_seq, 2000, (2030, 2039));
        let mut outputs: FxHashMap<String, String> = FxHashMap::default();
        outputs.insert("PRIMER_LEFT_0".to_string(), "3,10".to_string());
        outputs.insert("PRIMER_LEFT_0_TM".to_string(), "60.5".to_string());
        outputs.insert("PRIMER_LEFT_0_PENALTY".to_string(), "0.82".to_string());

        let primer = parse_primer(&outputs, Side::Left, 0, &template).unwrap();
        assert_eq!(primer.mapping.start, 2002);
        assert_eq!(primer.mapping.end, 2011);
        assert_eq!(primer.mapping.strand, Strand::Plus);
        assert_eq!(primer.bases, &region_seq[2..12]);
        assert_eq!(primer.tm, 60.5);
        assert_eq!(primer.penalty, 0.82);
    }

    #[test]
    fn test_parse_right_primer_extends_backwards() {
        let region_seq = "AATATTCTTGCTGCTTATGCAGCTGACATTGTTGCCCTCCCTAAAGCAAC";
        let template = template_with(region_seq, 2000, (2010, 2019));
        let mut outputs: FxHashMap<String, String> = FxHashMap::default();
        // 3'-most base at region offset 40, length 10: spans offsets 31-40
        outputs.insert("PRIMER_RIGHT_0".to_string(), "40,10".to_string());
        outputs.insert("PRIMER_RIGHT_0_TM".to_string(), "59.9".to_string());
        outputs.insert("PRIMER_RIGHT_0_PENALTY".to_string(), "1.1".to_string());

        let primer = parse_primer(&outputs, Side::Right, 0, &template).unwrap();
        assert_eq!(primer.mapping.start, 2030);
        assert_eq!(primer.mapping.end, 2039);
        assert_eq!(primer.mapping.strand, Strand::Minus);
        assert_eq!(primer.bases, seq::reverse_complement(&region_seq[30..40]));
    }

    #[test]
    fn test_parse_pair() {
        let region_seq = "AATATTCTTGCTGCTTATGCAGCTGACATTGTTGCCCTCCCTAAAGCAAC";
        let template = template_with(region_seq, 2000, (2015, 2024));
        let mut outputs: FxHashMap<String, String> = FxHashMap::default();
        outputs.insert("PRIMER_LEFT_0".to_string(), "1,10".to_string());
        outputs.insert("PRIMER_LEFT_0_TM".to_string(), "60.0".to_string());
        outputs.insert("PRIMER_LEFT_0_PENALTY".to_string(), "0.5".to_string());
        outputs.insert("PRIMER_RIGHT_0".to_string(), "50,10".to_string());
        outputs.insert("PRIMER_RIGHT_0_TM".to_string(), "61.0".to_string());
        outputs.insert("PRIMER_RIGHT_0_PENALTY".to_string(), "0.7".to_string());
        outputs.insert("PRIMER_PAIR_0_PRODUCT_TM".to_string(), "80.2".to_string());
        outputs.insert("PRIMER_PAIR_0_PENALTY".to_string(), "1.2".to_string());

        let pair = parse_pair(&outputs, 0, &template).unwrap();
        assert_eq!(pair.amplicon.start, 2000);
        assert_eq!(pair.amplicon.end, 2049);
        assert_eq!(pair.amplicon_sequence, region_seq);
        assert_eq!(pair.tm, 80.2);
        assert_eq!(pair.penalty, 1.2);
        assert_eq!(pair.left.mapping.start, 2000);
        assert_eq!(pair.right.mapping.end, 2049);
    }

    #[cfg(unix)]
    #[test]
    fn test_roundtrip_against_scripted_picker() {
        use crate::reference::InMemoryReference;
        use std::os::unix::fs::PermissionsExt;

        // A stand-in picker: consume one request, emit a canned response
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("fake_primer3");
        std::fs::write(
            &script,
            "#!/bin/sh\n\
while read line; do [ \"$line\" = '=' ] && break; done\n\
printf 'PRIMER_TASK=generic\\n'\n\
printf 'PRIMER_PAIR_NUM_RETURNED=0\\n'\n\
printf 'PRIMER_LEFT_EXPLAIN=considered 10, low tm 4, ok 6\\n'\n\
printf '=\\n'\n",
        )
        .unwrap();
        let mut perms = std::fs::metadata(&script).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&script, perms).unwrap();

        let reference = InMemoryReference::new(vec![(
            "chr1".to_string(),
            "ACGT".repeat(200),
        )]);
        let target = Mapping::new("chr1", 400, 420, Strand::Plus).unwrap();
        let mut picker = Primer3::spawn(
            &script,
            Box::new(reference),
            None,
            DesignParameters::default(),
            PrimerWeights::default(),
            0.01,
            false,
        )
        .unwrap();

        let result = picker.design_pairs(&target).unwrap();
        assert!(result.pairs.is_empty());
        assert_eq!(result.failures.len(), 1);
        assert_eq!(result.failures[0].reason, FailureReason::LowTm);
        assert_eq!(result.failures[0].count, 4);
        picker.close();
        // close() is idempotent
        picker.close();
    }

    #[test]
    fn test_dinuc_post_filter_on_pairs() {
        let region_seq = format!("{}{}", "ACACACACAC", "GGTTCCAATTGGCCAATTGGCCTTAAGGCCTTGCGCATAG");
        let template = template_with(&region_seq, 3000, (3015, 3024));
        let mut outputs: FxHashMap<String, String> = FxHashMap::default();
        // Pair 0's left primer is a pure AC repeat: dropped by the post-filter
        for (i, (left, right)) in [("1,10", "50,10"), ("11,10", "50,10")].iter().enumerate() {
            outputs.insert(format!("PRIMER_LEFT_{}", i), left.to_string());
            outputs.insert(format!("PRIMER_LEFT_{}_TM", i), "60.0".to_string());
            outputs.insert(format!("PRIMER_LEFT_{}_PENALTY", i), "0.5".to_string());
            outputs.insert(format!("PRIMER_RIGHT_{}", i), right.to_string());
            outputs.insert(format!("PRIMER_RIGHT_{}_TM", i), "61.0".to_string());
            outputs.insert(format!("PRIMER_RIGHT_{}_PENALTY", i), "0.7".to_string());
            outputs.insert(format!("PRIMER_PAIR_{}_PRODUCT_TM", i), "80.0".to_string());
            outputs.insert(format!("PRIMER_PAIR_{}_PENALTY", i), "1.0".to_string());
        }
        let pairs = vec![
            parse_pair(&outputs, 0, &template).unwrap(),
            parse_pair(&outputs, 1, &template).unwrap(),
        ];
        let (kept, dropped) = filter_pairs_by_dinuc(pairs, 6);
        assert_eq!(kept.len(), 1);
        assert_eq!(dropped.len(), 1);
        assert!(dropped.contains("ACACACACAC"));
    }
}
