//! Interactive Aligner Wrapper
//!
//! Drives the interactive `bwa aln` fork over stdin/stdout to enumerate all
//! genomic hits for candidate primer sequences. Queries are streamed in as
//! FASTQ records (the query sequence doubles as the read name), blank-line
//! flushes force the aligner to emit pending results, and records are read
//! back strictly in submission order.
//!
//! Per-record attributes consumed: `HN` (total hit count), `NM` (edits),
//! `XA` (semicolon-separated secondary alignments as
//! `chrom,±start,cigar,edits`).

use rustc_hash::FxHashSet;
use std::fmt;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::str::FromStr;

use crate::error::{Error, Result};
use crate::mapping::{Mapping, SequenceDictionary, Strand};
use crate::seq;

// ============================================================================
// CIGAR
// ============================================================================

/// One CIGAR element: an operation and its length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CigarElem {
    pub len: usize,
    pub op: char,
}

/// A parsed CIGAR string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Cigar(pub Vec<CigarElem>);

impl Cigar {
    /// Number of reference bases consumed by the alignment.
    pub fn reference_length(&self) -> usize {
        self.0
            .iter()
            .filter(|e| matches!(e.op, 'M' | 'D' | 'N' | '=' | 'X'))
            .map(|e| e.len)
            .sum()
    }

    /// Total inserted/deleted bases.
    pub fn indel_bases(&self) -> usize {
        self.0
            .iter()
            .filter(|e| matches!(e.op, 'I' | 'D'))
            .map(|e| e.len)
            .sum()
    }

    /// The element-reversed CIGAR, describing the reverse-complemented query.
    pub fn reversed(&self) -> Cigar {
        Cigar(self.0.iter().rev().copied().collect())
    }
}

impl FromStr for Cigar {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut elems = Vec::new();
        let mut len = 0usize;
        for c in s.chars() {
            if let Some(digit) = c.to_digit(10) {
                len = len * 10 + digit as usize;
            } else if matches!(c, 'M' | 'I' | 'D' | 'N' | 'S' | 'H' | 'P' | '=' | 'X') {
                if len == 0 {
                    return Err(Error::Aligner(format!("zero-length cigar element in {:?}", s)));
                }
                elems.push(CigarElem { len, op: c });
                len = 0;
            } else {
                return Err(Error::Aligner(format!("invalid cigar {:?}", s)));
            }
        }
        if len != 0 {
            return Err(Error::Aligner(format!("trailing length in cigar {:?}", s)));
        }
        Ok(Cigar(elems))
    }
}

impl fmt::Display for Cigar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for elem in &self.0 {
            write!(f, "{}{}", elem.len, elem.op)?;
        }
        Ok(())
    }
}

// ============================================================================
// Hits and Results
// ============================================================================

/// One alignment of a query to the reference. Coordinates always describe
/// the original (non-reverse-complemented) query: when the query was
/// submitted reverse-complemented, construct with `rc = true` to invert the
/// strand flag and reverse the CIGAR.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlignerHit {
    pub chrom: String,
    pub start: usize,
    pub negative: bool,
    pub cigar: Cigar,
    pub edits: usize,
}

impl AlignerHit {
    pub fn new(
        chrom: &str,
        start: usize,
        negative: bool,
        cigar: Cigar,
        edits: usize,
        rc: bool,
    ) -> Self {
        let (negative, cigar) = if rc {
            (!negative, cigar.reversed())
        } else {
            (negative, cigar)
        };
        Self {
            chrom: chrom.to_string(),
            start,
            negative,
            cigar,
            edits,
        }
    }

    pub fn end(&self) -> usize {
        self.start + self.cigar.reference_length() - 1
    }

    /// Mismatching bases: the edit count minus inserted/deleted bases.
    pub fn mismatches(&self) -> usize {
        self.edits.saturating_sub(self.cigar.indel_bases())
    }

    pub fn to_mapping(&self) -> Mapping {
        Mapping {
            ref_name: self.chrom.clone(),
            start: self.start,
            end: self.end(),
            strand: if self.negative { Strand::Minus } else { Strand::Plus },
        }
    }
}

/// All hits for one query. `hit_count` may exceed `hits.len()` when the
/// aligner found more hits than it was asked to report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlignerResult {
    pub query: String,
    pub hit_count: usize,
    pub hits: Vec<AlignerHit>,
}

// ============================================================================
// SAM records
// ============================================================================

const FLAG_UNMAPPED: u16 = 0x4;
const FLAG_NEGATIVE: u16 = 0x10;

#[derive(Debug, Clone)]
struct SamRecord {
    qname: String,
    flag: u16,
    rname: String,
    pos: usize,
    cigar: Cigar,
    hit_count: Option<usize>,
    edits: Option<usize>,
    xa: Option<String>,
}

impl SamRecord {
    fn is_unmapped(&self) -> bool {
        self.flag & FLAG_UNMAPPED != 0
    }

    fn is_negative(&self) -> bool {
        self.flag & FLAG_NEGATIVE != 0
    }
}

fn parse_sam_record(line: &str) -> Result<SamRecord> {
    let fields: Vec<&str> = line.split('\t').collect();
    if fields.len() < 11 {
        return Err(Error::Aligner(format!(
            "SAM record with {} fields: {:?}",
            fields.len(),
            line
        )));
    }
    let flag: u16 = fields[1]
        .parse()
        .map_err(|_| Error::Aligner(format!("invalid SAM flag {:?}", fields[1])))?;
    let pos: usize = fields[3]
        .parse()
        .map_err(|_| Error::Aligner(format!("invalid SAM position {:?}", fields[3])))?;
    let cigar = if fields[5] == "*" {
        Cigar::default()
    } else {
        fields[5].parse()?
    };

    let mut hit_count = None;
    let mut edits = None;
    let mut xa = None;
    for tag in &fields[11..] {
        let mut parts = tag.splitn(3, ':');
        let (name, _ty, value) = match (parts.next(), parts.next(), parts.next()) {
            (Some(n), Some(t), Some(v)) => (n, t, v),
            _ => continue,
        };
        match name {
            "HN" => {
                hit_count = Some(value.parse().map_err(|_| {
                    Error::Aligner(format!("non-integer HN attribute {:?}", value))
                })?)
            }
            "NM" => {
                edits = Some(value.parse().map_err(|_| {
                    Error::Aligner(format!("non-integer NM attribute {:?}", value))
                })?)
            }
            "XA" => xa = Some(value.to_string()),
            _ => {}
        }
    }

    Ok(SamRecord {
        qname: fields[0].to_string(),
        flag,
        rname: fields[2].to_string(),
        pos,
        cigar,
        hit_count,
        edits,
        xa,
    })
}

/// Parses an `XA` attribute: semicolon-separated `chrom,±start,cigar,edits`.
fn parse_xa(xa: &str, rc: bool) -> Result<Vec<AlignerHit>> {
    let mut hits = Vec::new();
    for entry in xa.split(';').filter(|e| !e.is_empty()) {
        let parts: Vec<&str> = entry.split(',').collect();
        if parts.len() != 4 {
            return Err(Error::Aligner(format!("malformed XA entry {:?}", entry)));
        }
        let (strand, start) = parts[1].split_at(1);
        let negative = match strand {
            "+" => false,
            "-" => true,
            _ => return Err(Error::Aligner(format!("malformed XA strand in {:?}", entry))),
        };
        let start: usize = start
            .parse()
            .map_err(|_| Error::Aligner(format!("malformed XA start in {:?}", entry)))?;
        let cigar: Cigar = parts[2].parse()?;
        let edits: usize = parts[3]
            .parse()
            .map_err(|_| Error::Aligner(format!("malformed XA edits in {:?}", entry)))?;
        hits.push(AlignerHit::new(parts[0], start, negative, cigar, edits, rc));
    }
    Ok(hits)
}

/// Reads SAM header lines up to and including the first `@PG` line.
fn consume_header<R: BufRead>(reader: &mut R) -> Result<Vec<String>> {
    let mut header_lines = Vec::new();
    let mut line = String::with_capacity(256);
    loop {
        line.clear();
        if reader.read_line(&mut line)? == 0 {
            return Err(Error::Aligner(
                "aligner exited before emitting its header".to_string(),
            ));
        }
        let trimmed = line.trim_end_matches(['\r', '\n']);
        header_lines.push(trimmed.to_string());
        if trimmed.starts_with("@PG") {
            return Ok(header_lines);
        }
    }
}

/// Builds a sequence dictionary from `@SQ` header lines.
fn dict_from_header(header_lines: &[String]) -> SequenceDictionary {
    let mut entries = Vec::new();
    for line in header_lines {
        if !line.starts_with("@SQ") {
            continue;
        }
        let mut name = None;
        let mut length = None;
        for field in line.split('\t').skip(1) {
            if let Some(sn) = field.strip_prefix("SN:") {
                name = Some(sn.to_string());
            } else if let Some(ln) = field.strip_prefix("LN:") {
                length = ln.parse::<usize>().ok();
            }
        }
        if let (Some(name), Some(length)) = (name, length) {
            entries.push((name, length));
        }
    }
    SequenceDictionary::new(entries)
}

// ============================================================================
// Wrapper
// ============================================================================

/// Options for the interactive aligner.
#[derive(Debug, Clone)]
pub struct BwaAlnOptions {
    pub seed_length: usize,
    pub max_seed_mismatches: usize,
    pub max_mismatches: usize,
    pub max_gap_opens: usize,
    pub max_gap_extensions: i32,
    /// Hits beyond this count are reported only as a total.
    pub max_hits: usize,
    pub threads: usize,
    /// Submit queries reverse-complemented; hits are flipped back so they
    /// always describe the original query.
    pub reverse_complement: bool,
    /// Keep hits on `*_alt` contigs.
    pub include_alt_contigs: bool,
}

impl Default for BwaAlnOptions {
    fn default() -> Self {
        Self {
            seed_length: 20,
            max_seed_mismatches: 3,
            max_mismatches: 3,
            max_gap_opens: 0,
            max_gap_extensions: -1,
            max_hits: 250,
            threads: 1,
            reverse_complement: false,
            include_alt_contigs: false,
        }
    }
}

/// The interactive aligner wrapper. Owns the child for its lifetime; every
/// call to [`BwaAlnInteractive::map`] is synchronous and returns only after
/// all submitted queries have been read back.
pub struct BwaAlnInteractive {
    child: Option<Child>,
    to_child: Option<BufWriter<ChildStdin>>,
    from_child: BufReader<ChildStdout>,
    dict: SequenceDictionary,
    options: BwaAlnOptions,
}

impl BwaAlnInteractive {
    /// Spawns the aligner against an indexed reference and consumes its SAM
    /// header through the first `@PG` line.
    pub fn spawn(executable: &Path, reference: &Path, options: BwaAlnOptions) -> Result<Self> {
        let mut child = Command::new(executable)
            .arg("aln")
            .args(["-N", "-S", "-Z"])
            .args(["-n", &options.max_mismatches.to_string()])
            .args(["-k", &options.max_seed_mismatches.to_string()])
            .args(["-l", &options.seed_length.to_string()])
            .args(["-o", &options.max_gap_opens.to_string()])
            .args(["-e", &options.max_gap_extensions.to_string()])
            .args(["-X", &options.max_hits.to_string()])
            .args(["-t", &options.threads.to_string()])
            .arg(reference)
            .arg("/dev/stdin")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()?;
        let stdin = child.stdin.take().expect("child stdin is piped");
        let stdout = child.stdout.take().expect("child stdout is piped");
        let mut from_child = BufReader::new(stdout);

        // The header must be fully consumed before any alignment reads
        let header_lines = match consume_header(&mut from_child) {
            Ok(lines) => lines,
            Err(e) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(e);
            }
        };

        Ok(Self {
            child: Some(child),
            to_child: Some(BufWriter::new(stdin)),
            from_child,
            dict: dict_from_header(&header_lines),
            options,
        })
    }

    /// The dictionary parsed from the aligner's `@SQ` header lines.
    pub fn dict(&self) -> &SequenceDictionary {
        &self.dict
    }

    pub fn max_hits(&self) -> usize {
        self.options.max_hits
    }

    /// Maps a batch of queries, returning one result per query in submission
    /// order. An empty batch returns immediately without touching the child.
    pub fn map(&mut self, queries: &[String]) -> Result<Vec<AlignerResult>> {
        if queries.is_empty() {
            return Ok(Vec::new());
        }
        let writer = self.to_child.as_mut().ok_or_else(|| {
            Error::Aligner("aligner wrapper is closed".to_string())
        })?;
        for query in queries {
            let bases = if self.options.reverse_complement {
                seq::reverse_complement(query)
            } else {
                query.clone()
            };
            write!(writer, "@{}\n{}\n+\n{}\n", query, bases, "H".repeat(bases.len()))?;
        }
        writer.flush()?;
        // Blank lines force the interactive aligner to process pending input
        for _ in 0..3 {
            writer.write_all(b"\n\n")?;
            writer.flush()?;
        }

        let mut results = Vec::with_capacity(queries.len());
        for query in queries {
            let record = self.read_record()?;
            if record.qname != *query {
                return Err(Error::Aligner(format!(
                    "out-of-order result: expected {:?}, got {:?}",
                    query, record.qname
                )));
            }
            results.push(self.result_from_record(query, record)?);
        }
        Ok(results)
    }

    fn read_record(&mut self) -> Result<SamRecord> {
        let mut line = String::with_capacity(512);
        loop {
            line.clear();
            if self.from_child.read_line(&mut line)? == 0 {
                return Err(Error::Aligner(
                    "aligner closed its output mid-batch".to_string(),
                ));
            }
            let trimmed = line.trim_end_matches(['\r', '\n']);
            if trimmed.is_empty() {
                continue;
            }
            return parse_sam_record(trimmed);
        }
    }

    fn result_from_record(&self, query: &str, record: SamRecord) -> Result<AlignerResult> {
        if record.is_unmapped() {
            return Ok(AlignerResult {
                query: query.to_string(),
                hit_count: 0,
                hits: Vec::new(),
            });
        }
        let total = record.hit_count.ok_or_else(|| {
            Error::Aligner(format!("mapped record without HN attribute: {:?}", query))
        })?;
        if total > self.options.max_hits {
            return Ok(AlignerResult {
                query: query.to_string(),
                hit_count: total,
                hits: Vec::new(),
            });
        }

        let rc = self.options.reverse_complement;
        let mut hits = vec![AlignerHit::new(
            &record.rname,
            record.pos,
            record.is_negative(),
            record.cigar.clone(),
            record.edits.unwrap_or(0),
            rc,
        )];
        if let Some(xa) = &record.xa {
            hits.extend(parse_xa(xa, rc)?);
        }
        if !self.options.include_alt_contigs {
            hits.retain(|h| !h.chrom.ends_with("_alt"));
        }

        let hit_count = if hits.is_empty() { total } else { hits.len() };
        Ok(AlignerResult {
            query: query.to_string(),
            hit_count,
            hits,
        })
    }

    /// Closes both streams and destroys the child. Idempotent.
    pub fn close(&mut self) {
        self.to_child.take();
        if let Some(mut child) = self.child.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

impl Drop for BwaAlnInteractive {
    fn drop(&mut self) {
        self.close();
    }
}

/// Deduplicates queries preserving first-seen order.
pub fn unique_queries(queries: &[String]) -> Vec<String> {
    let mut seen = FxHashSet::default();
    let mut unique = Vec::with_capacity(queries.len());
    for query in queries {
        if seen.insert(query.clone()) {
            unique.push(query.clone());
        }
    }
    unique
}

// ============================================================================
// Tests
// ============================================================================
