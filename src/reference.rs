//! Reference Sequence Access
//!
//! The design core consumes reference bases through the [`ReferenceSource`]
//! trait: a positional fetch, per-sequence lengths, and the reference
//! ordering. Two implementations are provided: an indexed on-disk FASTA
//! (faidx) and an in-memory map for small genomes and tests.
//!
//! Fetched bases keep their case: callers interpret upper-case as un-masked
//! and lower-case as soft-masked.

use rust_htslib::faidx;
use rustc_hash::FxHashMap;
use std::path::Path;

use crate::error::{Error, Result};
use crate::mapping::SequenceDictionary;

/// Read-only provider of reference bases. Coordinates are 1-based closed.
pub trait ReferenceSource {
    /// Returns the bases of `[start, end]` on the named reference, case
    /// preserved.
    fn fetch(&mut self, ref_name: &str, start: usize, end: usize) -> Result<String>;

    /// Total length of the named reference sequence.
    fn reference_length(&self, ref_name: &str) -> Result<usize>;

    /// The ordering and lengths of all reference sequences.
    fn dict(&self) -> &SequenceDictionary;
}

// ============================================================================
// Indexed FASTA
// ============================================================================

/// Reference source backed by a faidx-indexed FASTA file.
pub struct FaidxReference {
    reader: faidx::Reader,
    dict: SequenceDictionary,
}

impl FaidxReference {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let reader = faidx::Reader::from_path(path.as_ref())?;
        let mut entries = Vec::with_capacity(reader.n_seqs() as usize);
        for i in 0..reader.n_seqs() {
            let name = reader.seq_name(i as i64)?;
            let len = reader
                .fetch_seq_len(&name)
                .ok_or_else(|| Error::InvalidMapping(format!("no length for reference {}", name)))?;
            entries.push((name, len as usize));
        }
        Ok(Self {
            reader,
            dict: SequenceDictionary::new(entries),
        })
    }
}

impl ReferenceSource for FaidxReference {
    fn fetch(&mut self, ref_name: &str, start: usize, end: usize) -> Result<String> {
        if start < 1 || end < start {
            return Err(Error::InvalidMapping(format!(
                "invalid fetch range {}:{}-{}",
                ref_name, start, end
            )));
        }
        // faidx is 0-based with an inclusive end
        let bytes = self.reader.fetch_seq(ref_name, start - 1, end - 1)?;
        Ok(String::from_utf8_lossy(bytes).into_owned())
    }

    fn reference_length(&self, ref_name: &str) -> Result<usize> {
        self.dict
            .length_of(ref_name)
            .ok_or_else(|| Error::InvalidMapping(format!("unknown reference: {}", ref_name)))
    }

    fn dict(&self) -> &SequenceDictionary {
        &self.dict
    }
}

// ============================================================================
// In-memory
// ============================================================================

/// Reference source holding whole sequences in memory. Insertion order
/// defines the reference ordering.
pub struct InMemoryReference {
    seqs: FxHashMap<String, String>,
    dict: SequenceDictionary,
}

impl InMemoryReference {
    pub fn new(sequences: Vec<(String, String)>) -> Self {
        let entries = sequences
            .iter()
            .map(|(name, seq)| (name.clone(), seq.len()))
            .collect();
        let seqs = sequences.into_iter().collect();
        Self {
            seqs,
            dict: SequenceDictionary::new(entries),
        }
    }
}

impl ReferenceSource for InMemoryReference {
    fn fetch(&mut self, ref_name: &str, start: usize, end: usize) -> Result<String> {
        let seq = self
            .seqs
            .get(ref_name)
            .ok_or_else(|| Error::InvalidMapping(format!("unknown reference: {}", ref_name)))?;
        if start < 1 || end < start || end > seq.len() {
            return Err(Error::InvalidMapping(format!(
                "fetch range {}:{}-{} outside sequence of length {}",
                ref_name,
                start,
                end,
                seq.len()
            )));
        }
        Ok(seq[start - 1..end].to_string())
    }

    fn reference_length(&self, ref_name: &str) -> Result<usize> {
        self.dict
            .length_of(ref_name)
            .ok_or_else(|| Error::InvalidMapping(format!("unknown reference: {}", ref_name)))
    }

    fn dict(&self) -> &SequenceDictionary {
        &self.dict
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_memory_fetch() {
        let mut reference = InMemoryReference::new(vec![
            ("chr1".to_string(), "ACGTACGTGG".to_string()),
            ("chr2".to_string(), "TTTTGGGG".to_string()),
        ]);
        assert_eq!(reference.fetch("chr1", 1, 4).unwrap(), "ACGT");
        assert_eq!(reference.fetch("chr1", 9, 10).unwrap(), "GG");
        assert_eq!(reference.fetch("chr2", 5, 8).unwrap(), "GGGG");
        assert!(reference.fetch("chr1", 0, 4).is_err());
        assert!(reference.fetch("chr1", 5, 11).is_err());
        assert!(reference.fetch("chr3", 1, 2).is_err());
    }

    #[test]
    fn test_in_memory_dict_order() {
        let reference = InMemoryReference::new(vec![
            ("chr1".to_string(), "ACGT".to_string()),
            ("chr2".to_string(), "ACGTACGT".to_string()),
        ]);
        assert_eq!(reference.dict().index_of("chr1"), Some(0));
        assert_eq!(reference.dict().index_of("chr2"), Some(1));
        assert_eq!(reference.reference_length("chr2").unwrap(), 8);
    }

    #[test]
    fn test_case_preserved() {
        let mut reference =
            InMemoryReference::new(vec![("chr1".to_string(), "ACgtAC".to_string())]);
        assert_eq!(reference.fetch("chr1", 2, 5).unwrap(), "CgtA");
    }
}
