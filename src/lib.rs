//! ampliseek - PCR Primer Design for Targeted Genomic Assays
//!
//! Turns a target interval on a reference genome into ranked candidate
//! primer pairs that satisfy thermodynamic and compositional constraints,
//! avoid common germline variation in their binding sites, amplify nowhere
//! else in the genome, and do not form strong heterodimers.
//!
//! # Modules
//! - `mapping`: 1-based closed genomic intervals with strand
//! - `seq`: DNA sequence utilities
//! - `reference`: reference sequence providers (faidx / in-memory)
//! - `variant`: variant catalog and MAF-filtered lookups
//! - `region`: design-region expansion and variant masking
//! - `params`: design parameter and weight bundles
//! - `primer`: primer and primer-pair value types
//! - `primer3`: driver for the primer3 picker subprocess
//! - `aligner`: interactive bwa wrapper for hit enumeration
//! - `offtarget`: off-target amplicon detection with caching
//! - `dimer`: duplex-Tm invocation and dimer counting
//! - `error`: typed error taxonomy

pub mod aligner;
pub mod dimer;
pub mod error;
pub mod mapping;
pub mod offtarget;
pub mod params;
pub mod primer;
pub mod primer3;
pub mod reference;
pub mod region;
pub mod seq;
pub mod variant;
