use anyhow::{bail, Context, Result};
use clap::Parser;
use log::{info, warn};
use simple_logger::init_with_level;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::time::Instant;

use ampliseek::aligner::{BwaAlnInteractive, BwaAlnOptions};
use ampliseek::dimer::{NtThal, NtThalOptions};
use ampliseek::mapping::Mapping;
use ampliseek::offtarget::{OffTargetDetector, OffTargetOptions, OffTargetResult};
use ampliseek::params::{DesignParameters, MinOptMax, PrimerWeights};
use ampliseek::primer::PrimerPair;
use ampliseek::primer3::Primer3;
use ampliseek::reference::FaidxReference;
use ampliseek::variant::{CachedVariantLookup, IndexedVariantLookup, VariantLookup};

#[derive(Parser)]
#[command(name = "ampliseek")]
#[command(version)]
#[command(about = "Design PCR primer pairs for a genomic target")]
#[command(long_about = r#"
ampliseek - PCR primer-pair design for targeted assays

For one target interval the tool:
  1. Expands the target to a design region and masks common variants with N
  2. Asks primer3 for candidate primer pairs within the region
  3. Maps every candidate primer with bwa and joins the hits into potential
     off-target amplicons
  4. Scores primer-primer duplex Tm with ntthal

OUTPUT COLUMNS (TSV):
  rank, chrom, amplicon_start, amplicon_end, amplicon_length,
  left_primer, left_tm, left_gc, right_primer, right_tm, right_gc,
  product_tm, penalty, off_target_pass, off_target_amplicons, dimer_tm

EXAMPLES:
  # Design against GRCh38 with dbSNP masking
  ampliseek -r GRCh38.fa -t chr17:43094400-43094500 -V dbsnp.vcf.gz -o out.tsv

  # No variant masking, BED track of the designs
  ampliseek -r ref.fa -t chr2:9000-9100 --bed designs.bed
"#)]
struct Args {
    // ===== INPUT OPTIONS =====
    /// Reference genome FASTA (faidx-indexed; the bwa index must share the prefix)
    #[arg(short = 'r', long, value_name = "FILE", help_heading = "Input")]
    reference: PathBuf,

    /// Target interval, e.g. chr17:43094400-43094500
    #[arg(short = 't', long, value_name = "REGION", help_heading = "Input")]
    target: String,

    /// Variant catalogs (VCF/BCF) used to mask common variation
    #[arg(short = 'V', long = "variants", value_name = "FILE", help_heading = "Input")]
    variants: Vec<PathBuf>,

    /// Query variant files through their on-disk indexes instead of loading
    /// them into memory (for whole-genome catalogs like dbSNP)
    #[arg(long = "file-backed-variants", help_heading = "Input")]
    file_backed_variants: bool,

    /// Minimum minor-allele frequency for a variant to be masked
    #[arg(long = "min-maf", value_name = "FRAC", default_value = "0.01", help_heading = "Input")]
    min_maf: f64,

    /// Also mask variants with no usable allele-frequency annotation
    #[arg(long = "include-missing-mafs", help_heading = "Input")]
    include_missing_mafs: bool,

    // ===== DESIGN OPTIONS =====
    /// Amplicon size as min,opt,max
    #[arg(long = "amplicon-sizes", value_name = "MIN,OPT,MAX", default_value = "100,125,150", help_heading = "Design")]
    amplicon_sizes: String,

    /// Primer length as min,opt,max
    #[arg(long = "primer-sizes", value_name = "MIN,OPT,MAX", default_value = "18,21,27", help_heading = "Design")]
    primer_sizes: String,

    /// Primer melting temperature as min,opt,max (Celsius)
    #[arg(long = "primer-tms", value_name = "MIN,OPT,MAX", default_value = "57,60,63", help_heading = "Design")]
    primer_tms: String,

    /// Primer GC content as min,opt,max (percent)
    #[arg(long = "primer-gcs", value_name = "MIN,OPT,MAX", default_value = "30,50,65", help_heading = "Design")]
    primer_gcs: String,

    /// Number of candidate pairs to request from primer3
    #[arg(long = "num-candidates", value_name = "N", default_value = "200", help_heading = "Design")]
    num_candidates: usize,

    /// Minimum G/C count in the 3'-most five bases of a primer
    #[arg(long = "gc-clamp", value_name = "N", default_value = "0", help_heading = "Design")]
    gc_clamp: usize,

    /// Maximum G/C count in the 3'-most five bases of a primer
    #[arg(long = "max-end-gc", value_name = "N", default_value = "5", help_heading = "Design")]
    max_end_gc: usize,

    /// Maximum homopolymer length within a primer
    #[arg(long = "max-poly-x", value_name = "N", default_value = "5", help_heading = "Design")]
    max_poly_x: usize,

    /// Maximum number of ambiguous bases within a primer
    #[arg(long = "max-ns", value_name = "N", default_value = "1", help_heading = "Design")]
    max_ns: usize,

    /// Maximum bases in a dinucleotide repeat run within a primer
    #[arg(long = "max-dinuc-bases", value_name = "N", default_value = "6", help_heading = "Design")]
    max_dinuc_bases: usize,

    /// Place primers over soft-masked (lowercase) reference bases
    #[arg(long = "allow-masked-bases", help_heading = "Design")]
    allow_masked_bases: bool,

    // ===== OFF-TARGET OPTIONS =====
    /// Fail a pair when either primer has more genomic hits than this
    #[arg(long = "max-primer-hits", value_name = "N", default_value = "500", help_heading = "Off-target")]
    max_primer_hits: usize,

    /// Maximum predicted amplicons for a passing pair (1 = on-target only)
    #[arg(long = "max-pair-hits", value_name = "N", default_value = "1", help_heading = "Off-target")]
    max_primer_pair_hits: usize,

    /// Maximum span of a predicted off-target amplicon
    #[arg(long = "max-offtarget-size", value_name = "BP", default_value = "600", help_heading = "Off-target")]
    max_offtarget_size: usize,

    /// Aligner seed length
    #[arg(long = "seed-length", value_name = "N", default_value = "20", help_heading = "Off-target")]
    seed_length: usize,

    /// Maximum mismatches for a primer hit
    #[arg(long = "max-mismatches", value_name = "N", default_value = "3", help_heading = "Off-target")]
    max_mismatches: usize,

    /// Aligner threads
    #[arg(long = "threads", value_name = "N", default_value = "4", help_heading = "Off-target")]
    threads: usize,

    // ===== DIMER OPTIONS =====
    /// Skip the ntthal dimer screen
    #[arg(long = "skip-dimer", help_heading = "Dimer")]
    skip_dimer: bool,

    /// Report pairs whose primer-primer duplex Tm reaches this as dimers
    #[arg(long = "dimer-tm", value_name = "CELSIUS", default_value = "45", help_heading = "Dimer")]
    dimer_tm: f64,

    // ===== EXECUTABLES =====
    /// primer3 executable
    #[arg(long = "primer3-path", value_name = "PATH", default_value = "primer3_core", help_heading = "Executables")]
    primer3_path: PathBuf,

    /// Interactive bwa executable
    #[arg(long = "bwa-path", value_name = "PATH", default_value = "bwa", help_heading = "Executables")]
    bwa_path: PathBuf,

    /// ntthal executable
    #[arg(long = "ntthal-path", value_name = "PATH", default_value = "ntthal", help_heading = "Executables")]
    ntthal_path: PathBuf,

    // ===== OUTPUT OPTIONS =====
    /// Output TSV (stdout when omitted)
    #[arg(short = 'o', long, value_name = "FILE", help_heading = "Output")]
    output: Option<PathBuf>,

    /// Also write passing designs as a 12-column BED track
    #[arg(long = "bed", value_name = "FILE", help_heading = "Output")]
    bed: Option<PathBuf>,

    /// Verbose logging
    #[arg(short = 'v', long, help_heading = "Output")]
    verbose: bool,
}

/// Parses a `min,opt,max` triple off the command line.
fn parse_triple<T>(value: &str, flag: &str) -> Result<MinOptMax<T>>
where
    T: std::str::FromStr + PartialOrd + Default + Copy + std::fmt::Display,
{
    let parts: Vec<&str> = value.split(',').map(|p| p.trim()).collect();
    if parts.len() != 3 {
        bail!("--{} expects min,opt,max, got {:?}", flag, value);
    }
    let parse = |s: &str| {
        s.parse::<T>()
            .map_err(|_| anyhow::anyhow!("--{}: invalid number {:?}", flag, s))
    };
    MinOptMax::new(parse(parts[0])?, parse(parts[1])?, parse(parts[2])?)
        .with_context(|| format!("--{}", flag))
}

fn design_parameters(args: &Args) -> Result<DesignParameters> {
    Ok(DesignParameters {
        amplicon_sizes: parse_triple(&args.amplicon_sizes, "amplicon-sizes")?,
        primer_sizes: parse_triple(&args.primer_sizes, "primer-sizes")?,
        primer_tms: parse_triple(&args.primer_tms, "primer-tms")?,
        primer_gcs: parse_triple(&args.primer_gcs, "primer-gcs")?,
        num_to_return: args.num_candidates,
        gc_clamp: args.gc_clamp,
        max_end_gc: args.max_end_gc,
        primer_max_poly_x: args.max_poly_x,
        primer_max_ns: args.max_ns,
        primer_max_dinuc_bases: args.max_dinuc_bases,
        avoid_masked_bases: !args.allow_masked_bases,
        ..DesignParameters::default()
    })
}

fn variant_lookup(args: &Args) -> Result<Option<Box<dyn VariantLookup>>> {
    if args.variants.is_empty() {
        return Ok(None);
    }
    let lookup: Box<dyn VariantLookup> = if args.file_backed_variants {
        Box::new(IndexedVariantLookup::open(&args.variants)?)
    } else {
        info!("loading {} variant file(s) into memory", args.variants.len());
        Box::new(CachedVariantLookup::from_vcfs(&args.variants)?)
    };
    Ok(Some(lookup))
}

fn write_report(
    out: &mut dyn Write,
    results: &[(PrimerPair, OffTargetResult, Option<f64>)],
) -> Result<()> {
    writeln!(
        out,
        "rank\tchrom\tamplicon_start\tamplicon_end\tamplicon_length\tleft_primer\tleft_tm\tleft_gc\t\
right_primer\tright_tm\tright_gc\tproduct_tm\tpenalty\toff_target_pass\toff_target_amplicons\tdimer_tm"
    )?;
    for (rank, (pair, off_target, dimer_tm)) in results.iter().enumerate() {
        writeln!(
            out,
            "{}\t{}\t{}\t{}\t{}\t{}\t{:.2}\t{:.1}\t{}\t{:.2}\t{:.1}\t{:.2}\t{:.4}\t{}\t{}\t{}",
            rank + 1,
            pair.amplicon.ref_name,
            pair.amplicon.start,
            pair.amplicon.end,
            pair.amplicon.length(),
            pair.left.bases,
            pair.left.tm,
            pair.left.gc_percent(),
            pair.right.bases,
            pair.right.tm,
            pair.right.gc_percent(),
            pair.tm,
            pair.penalty,
            off_target.passes,
            off_target.mappings.len(),
            dimer_tm.map_or_else(|| ".".to_string(), |tm| format!("{:.2}", tm)),
        )?;
    }
    Ok(())
}

fn run(args: &Args) -> Result<()> {
    let started = Instant::now();
    let target = Mapping::from_region_str(&args.target)
        .with_context(|| format!("invalid --target {:?}", args.target))?;

    let reference = FaidxReference::open(&args.reference)
        .with_context(|| format!("opening reference {}", args.reference.display()))?;
    let variants = variant_lookup(args)?;
    let params = design_parameters(args)?;

    // Candidate pairs from primer3
    let mut picker = Primer3::spawn(
        &args.primer3_path,
        Box::new(reference),
        variants,
        params,
        PrimerWeights::default(),
        args.min_maf,
        args.include_missing_mafs,
    )
    .context("spawning primer3")?;
    let design = picker.design_pairs(&target);
    picker.close();
    let design = design.context("primer3 design failed")?;

    info!(
        "primer3 returned {} candidate pair(s) for {}",
        design.pairs.len(),
        target
    );
    for failure in &design.failures {
        info!("rejected candidates: {} {}", failure.reason, failure.count);
    }
    if design.pairs.is_empty() {
        warn!("no candidate pairs survived primer3 constraints for {}", target);
        return Ok(());
    }

    // Off-target screen over all candidates in one batch
    let aligner = BwaAlnInteractive::spawn(
        &args.bwa_path,
        &args.reference,
        BwaAlnOptions {
            seed_length: args.seed_length,
            max_mismatches: args.max_mismatches,
            max_hits: args.max_primer_hits,
            threads: args.threads,
            ..BwaAlnOptions::default()
        },
    )
    .context("spawning bwa")?;
    let mut detector = OffTargetDetector::new(
        aligner,
        OffTargetOptions {
            max_primer_hits: args.max_primer_hits,
            max_primer_pair_hits: args.max_primer_pair_hits,
            max_amplicon_size: args.max_offtarget_size,
            ..OffTargetOptions::default()
        },
    );
    let off_targets = detector.check(&design.pairs);
    detector.close();
    let off_targets = off_targets.context("off-target detection failed")?;

    let passing = off_targets.iter().filter(|r| r.passes).count();
    info!("{}/{} pair(s) pass the off-target screen", passing, off_targets.len());

    // Dimer Tm for each surviving pair
    let mut ntthal = NtThal::new(&args.ntthal_path, NtThalOptions::default());
    let mut results: Vec<(PrimerPair, OffTargetResult, Option<f64>)> = Vec::new();
    for (pair, off_target) in design.pairs.iter().zip(off_targets) {
        let dimer_tm = if args.skip_dimer || !off_target.passes {
            None
        } else {
            let tm = ntthal
                .tm_of(&pair.left.bases, &pair.right.bases)
                .context("ntthal failed")?;
            if tm >= args.dimer_tm {
                warn!("{} forms a primer dimer (Tm {:.2})", pair.amplicon, tm);
            }
            Some(tm)
        };
        results.push((pair.clone(), off_target, dimer_tm));
    }

    // Rank: off-target pass first, then picker penalty
    results.sort_by(|a, b| {
        b.1.passes
            .cmp(&a.1.passes)
            .then(a.0.penalty.partial_cmp(&b.0.penalty).unwrap_or(std::cmp::Ordering::Equal))
    });

    match &args.output {
        Some(path) => {
            let mut writer = BufWriter::new(
                File::create(path).with_context(|| format!("creating {}", path.display()))?,
            );
            write_report(&mut writer, &results)?;
        }
        None => {
            let stdout = std::io::stdout();
            let mut writer = BufWriter::new(stdout.lock());
            write_report(&mut writer, &results)?;
        }
    }

    if let Some(path) = &args.bed {
        let mut writer = BufWriter::new(
            File::create(path).with_context(|| format!("creating {}", path.display()))?,
        );
        for (pair, off_target, _) in &results {
            if off_target.passes {
                writeln!(writer, "{}", pair.to_bed12())?;
            }
        }
    }

    info!("done in {:.1}s", started.elapsed().as_secs_f64());
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();
    let level = if args.verbose {
        log::Level::Debug
    } else {
        log::Level::Info
    };
    init_with_level(level).expect("logger init");
    run(&args)
}
