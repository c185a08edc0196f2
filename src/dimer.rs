//! Duplex Tm and Dimer Checking
//!
//! On-demand invocation of the ntthal duplex-melting-temperature tool, with
//! a cache keyed by the lexicographically ordered sequence pair. Both the
//! cache key and the invocation use the canonical order, so cached and fresh
//! answers can never disagree.

use rustc_hash::FxHashMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use crate::error::{Error, Result};

/// Reaction conditions and invocation limits for the duplex-Tm tool.
#[derive(Debug, Clone)]
pub struct NtThalOptions {
    /// Monovalent cation concentration (mM).
    pub monovalent_mm: f64,
    /// Divalent cation concentration (mM).
    pub divalent_mm: f64,
    /// dNTP concentration (mM).
    pub dntp_mm: f64,
    /// DNA concentration (nM).
    pub dna_nm: f64,
    /// Reaction temperature (Celsius).
    pub temperature: f64,
    /// Per-invocation timeout; exceeding it is fatal.
    pub timeout: Duration,
    /// Cache Tm results per sequence pair.
    pub cache_results: bool,
}

impl Default for NtThalOptions {
    fn default() -> Self {
        Self {
            monovalent_mm: 50.0,
            divalent_mm: 0.0,
            dntp_mm: 0.0,
            dna_nm: 50.0,
            temperature: 37.0,
            timeout: Duration::from_secs(5),
            cache_results: true,
        }
    }
}

/// Orders a sequence pair lexicographically.
fn canonical_pair(a: &str, b: &str) -> (String, String) {
    if a <= b {
        (a.to_string(), b.to_string())
    } else {
        (b.to_string(), a.to_string())
    }
}

/// Parses the Tm from the tool's output: the first whitespace token of the
/// first line.
fn parse_tm(output: &str) -> Result<f64> {
    output
        .lines()
        .next()
        .and_then(|line| line.split_whitespace().next())
        .and_then(|token| token.parse::<f64>().ok())
        .ok_or_else(|| {
            Error::SubprocessIo(std::io::Error::other(format!(
                "unparseable ntthal output: {:?}",
                output.lines().next().unwrap_or("")
            )))
        })
}

/// Invoker of the ntthal executable.
pub struct NtThal {
    executable: PathBuf,
    options: NtThalOptions,
    cache: Option<FxHashMap<(String, String), f64>>,
}

impl NtThal {
    pub fn new(executable: &Path, options: NtThalOptions) -> Self {
        let cache = options.cache_results.then(FxHashMap::default);
        Self {
            executable: executable.to_path_buf(),
            options,
            cache,
        }
    }

    /// Melting temperature of the duplex formed by two sequences.
    pub fn tm_of(&mut self, a: &str, b: &str) -> Result<f64> {
        let key = canonical_pair(a, b);
        if let Some(cache) = &self.cache {
            if let Some(tm) = cache.get(&key) {
                return Ok(*tm);
            }
        }
        let tm = self.invoke(&key.0, &key.1)?;
        if let Some(cache) = &mut self.cache {
            cache.insert(key, tm);
        }
        Ok(tm)
    }

    /// Number of `targets` whose duplex Tm with `query` reaches `min_tm`.
    pub fn count_dimers(&mut self, query: &str, targets: &[String], min_tm: f64) -> Result<usize> {
        let mut count = 0;
        for target in targets {
            if self.tm_of(query, target)? >= min_tm {
                count += 1;
            }
        }
        Ok(count)
    }

    fn invoke(&self, s1: &str, s2: &str) -> Result<f64> {
        let mut child = Command::new(&self.executable)
            .arg("-r")
            .args(["-mv", &self.options.monovalent_mm.to_string()])
            .args(["-dv", &self.options.divalent_mm.to_string()])
            .args(["-n", &self.options.dntp_mm.to_string()])
            .args(["-d", &self.options.dna_nm.to_string()])
            .args(["-t", &self.options.temperature.to_string()])
            .args(["-s1", s1])
            .args(["-s2", s2])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()?;

        let deadline = Instant::now() + self.options.timeout;
        let status = loop {
            if let Some(status) = child.try_wait()? {
                break status;
            }
            if Instant::now() >= deadline {
                let _ = child.kill();
                let _ = child.wait();
                return Err(Error::Timeout {
                    tool: "ntthal".to_string(),
                    seconds: self.options.timeout.as_secs(),
                });
            }
            std::thread::sleep(Duration::from_millis(5));
        };
        if !status.success() {
            return Err(Error::SubprocessIo(std::io::Error::other(format!(
                "ntthal exited with {}",
                status
            ))));
        }

        let mut output = String::new();
        child
            .stdout
            .take()
            .expect("child stdout is piped")
            .read_to_string(&mut output)?;
        parse_tm(&output)
    }

    #[cfg(test)]
    fn seed(&mut self, a: &str, b: &str, tm: f64) {
        if let Some(cache) = &mut self.cache {
            cache.insert(canonical_pair(a, b), tm);
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
