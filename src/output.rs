//! Output formatting for accepted PSMs.
//!
//! One TSV record per reported peptide-spectrum match. In shared-memory
//! mode a single sink serializes all writers behind a lock; the
//! multi-shard path stages per-batch files instead and only the merge
//! pass writes through this sink.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};

use crate::index::FragmentIndex;
use crate::types::Psm;

/// Write the output header.
pub fn write_header<W: Write>(writer: &mut W) -> Result<()> {
    writeln!(
        writer,
        "QueryId\tPrecursorMass\tPeptide\tChunk\tEntry\tHyperscore\tSharedIons\tTotalIons\tCpsms\tEValue\tRTime\tCharge\tFileIndex"
    )?;
    Ok(())
}

/// Format a single PSM record.
pub fn format_psm_line(
    qid: u64,
    psm: &Psm,
    cpsms: u32,
    evalue: f64,
    index: &FragmentIndex,
) -> String {
    format!(
        "{}\t{:.4}\t{}\t{}\t{}\t{:.4}\t{}\t{}\t{}\t{:.4e}\t{:.2}\t{}\t{}",
        qid,
        psm.pmass,
        index.sequence(psm.chunk, psm.entry),
        psm.chunk,
        psm.entry,
        psm.hyperscore,
        psm.shared_ions,
        psm.total_ions,
        cpsms,
        evalue,
        psm.rtime,
        psm.charge,
        psm.file_index
    )
}

/// Serialized PSM writer with an expect-value ceiling.
pub struct PsmSink {
    inner: Mutex<(BufWriter<File>, usize)>,
    expect_max: f64,
}

impl PsmSink {
    /// Create the output file and write the header.
    pub fn create(path: &Path, expect_max: f64) -> Result<Self> {
        let file = File::create(path)
            .with_context(|| format!("Failed to create output file {}", path.display()))?;
        let mut writer = BufWriter::new(file);
        write_header(&mut writer)?;
        Ok(PsmSink {
            inner: Mutex::new((writer, 0)),
            expect_max,
        })
    }

    /// Write one PSM unless its e-value sits above the ceiling.
    /// Returns whether the record was emitted.
    pub fn submit(
        &self,
        qid: u64,
        psm: &Psm,
        cpsms: u32,
        evalue: f64,
        index: &FragmentIndex,
    ) -> Result<bool> {
        if evalue >= self.expect_max {
            return Ok(false);
        }
        let line = format_psm_line(qid, psm, cpsms, evalue, index);
        let mut guard = self.inner.lock().unwrap();
        writeln!(guard.0, "{}", line)?;
        guard.1 += 1;
        Ok(true)
    }

    /// Flush and report how many records were written.
    pub fn finish(&self) -> Result<usize> {
        let mut guard = self.inner.lock().unwrap();
        guard.0.flush()?;
        Ok(guard.1)
    }
}
