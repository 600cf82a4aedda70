//! MS2 query-file parser with gzip support.
//!
//! MS2 is a line format: `H` header lines, an `S <scan> <scan> <precursor
//! m/z>` line opening each spectrum, optional `Z <charge> <M+H>` and
//! `I <tag> <value>` lines, then one `mz intensity` pair per peak. The
//! reader streams spectra in fixed-size chunks so whole files never sit in
//! memory.

use std::io::BufRead;
use std::path::Path;

use anyhow::{Context, Result};

use crate::mass::{scale_mz, PROTON};
use crate::parser::util::open_reader;
use crate::types::SpectrumBatch;

/// One spectrum mid-assembly.
#[derive(Debug, Default)]
struct RawSpectrum {
    /// Neutral precursor mass.
    mass: f64,
    charge: u8,
    rtime: f32,
    peaks: Vec<(u32, f32)>,
}

/// Streaming MS2 reader for chunked extraction.
pub struct Ms2Reader {
    reader: Box<dyn BufRead + Send>,
    scale: u32,
    min_mass: f64,
    max_mass: f64,
    current: Option<RawSpectrum>,
    done: bool,
}

impl Ms2Reader {
    /// Open an MS2 file (supports .gz). Spectra outside
    /// `[min_mass, max_mass]` are dropped during extraction.
    pub fn open(path: &Path, scale: u32, min_mass: f64, max_mass: f64) -> Result<Self> {
        Ok(Ms2Reader {
            reader: open_reader(path)?,
            scale,
            min_mass,
            max_mass,
            current: None,
            done: false,
        })
    }

    /// Pre-pass over a file: count of accepted spectra and the number of
    /// batches they will produce at the given chunk size.
    pub fn scan(
        path: &Path,
        min_mass: f64,
        max_mass: f64,
        qchunk: usize,
    ) -> Result<(usize, usize)> {
        let reader = open_reader(path)?;

        let mut count = 0usize;
        let mut mass = f64::NAN;
        let mut has_peaks = false;
        let mut accept = |mass: f64, has_peaks: bool| {
            if has_peaks && mass >= min_mass && mass <= max_mass {
                count += 1;
            }
        };

        for line_result in reader.lines() {
            let line = line_result.context("Failed to read MS2 line")?;
            let line = line.trim_end();
            if line.is_empty() || line.starts_with('H') || line.starts_with('I') {
                continue;
            }
            if let Some(rest) = line.strip_prefix("S\t").or_else(|| line.strip_prefix("S ")) {
                accept(mass, has_peaks);
                has_peaks = false;
                let pmz: f64 = rest
                    .split_ascii_whitespace()
                    .nth(2)
                    .and_then(|f| f.parse().ok())
                    .unwrap_or(f64::NAN);
                mass = pmz - PROTON;
            } else if let Some(rest) = line.strip_prefix("Z\t").or_else(|| line.strip_prefix("Z "))
            {
                let mut fields = rest.split_ascii_whitespace();
                let _charge = fields.next();
                if let Some(mh) = fields.next().and_then(|f| f.parse::<f64>().ok()) {
                    mass = mh - PROTON;
                }
            } else if !line.starts_with('S') && !line.starts_with('Z') {
                has_peaks = true;
            }
        }
        accept(mass, has_peaks);

        let batches = count.div_ceil(qchunk.max(1));
        Ok((count, batches))
    }

    /// Extract up to `qchunk` spectra into `batch`, which the caller has
    /// reset. Returns the number of spectra appended; 0 means EOF.
    pub fn read_chunk(&mut self, qchunk: usize, batch: &mut SpectrumBatch) -> Result<usize> {
        let mut appended = 0usize;
        let mut line = String::new();

        while appended < qchunk && !self.done {
            line.clear();
            let bytes_read = self
                .reader
                .read_line(&mut line)
                .context("Failed to read MS2 line")?;

            if bytes_read == 0 {
                self.done = true;
                if let Some(spec) = self.current.take() {
                    appended += self.finish(spec, batch) as usize;
                }
                break;
            }

            let trimmed = line.trim_end();
            if trimmed.is_empty() || trimmed.starts_with('H') {
                continue;
            }

            if let Some(rest) = trimmed
                .strip_prefix("S\t")
                .or_else(|| trimmed.strip_prefix("S "))
            {
                if let Some(spec) = self.current.take() {
                    appended += self.finish(spec, batch) as usize;
                }
                self.current = Some(parse_scan_header(rest));
            } else if let Some(spec) = self.current.as_mut() {
                if let Some(rest) = trimmed
                    .strip_prefix("Z\t")
                    .or_else(|| trimmed.strip_prefix("Z "))
                {
                    let mut fields = rest.split_ascii_whitespace();
                    if let Some(z) = fields.next().and_then(|f| f.parse::<u8>().ok()) {
                        spec.charge = z;
                    }
                    if let Some(mh) = fields.next().and_then(|f| f.parse::<f64>().ok()) {
                        spec.mass = mh - PROTON;
                    }
                } else if let Some(rest) = trimmed
                    .strip_prefix("I\t")
                    .or_else(|| trimmed.strip_prefix("I "))
                {
                    let mut fields = rest.split_ascii_whitespace();
                    if fields.next() == Some("RTime") {
                        if let Some(rt) = fields.next().and_then(|f| f.parse::<f32>().ok()) {
                            spec.rtime = rt;
                        }
                    }
                } else {
                    // A peak line: m/z and intensity.
                    let mut fields = trimmed.split_ascii_whitespace();
                    let mz: Option<f64> = fields.next().and_then(|f| f.parse().ok());
                    let inten: Option<f32> = fields.next().and_then(|f| f.parse().ok());
                    if let (Some(mz), Some(inten)) = (mz, inten) {
                        spec.peaks.push((scale_mz(mz, self.scale), inten));
                    }
                }
            }
        }

        Ok(appended)
    }

    /// Append a completed spectrum if it passes the acceptance window.
    fn finish(&self, spec: RawSpectrum, batch: &mut SpectrumBatch) -> bool {
        if spec.peaks.is_empty() || spec.mass < self.min_mass || spec.mass > self.max_mass {
            return false;
        }
        batch.push_spectrum(spec.mass, spec.charge, spec.rtime, &spec.peaks);
        true
    }
}

fn parse_scan_header(rest: &str) -> RawSpectrum {
    let pmz: f64 = rest
        .split_ascii_whitespace()
        .nth(2)
        .and_then(|f| f.parse().ok())
        .unwrap_or(f64::NAN);
    RawSpectrum {
        // Until a Z line supplies the charge state, assume singly charged.
        mass: pmz - PROTON,
        charge: 0,
        rtime: 0.0,
        peaks: Vec::new(),
    }
}
