//! Query-file queue and the I/O worker loop.
//!
//! At startup every input file is scanned for its accepted-spectrum and
//! batch counts, and batch-number offsets are laid out so each batch any
//! file ever produces carries a globally unique, monotone number. Workers
//! pull files from a FIFO; a preempted worker parks its file, cursor
//! intact, and a later worker resumes it.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{bail, Context, Result};
use log::{debug, info, warn};

use crate::config::SearchConfig;
use crate::parser::Ms2Reader;
use crate::pipeline::SearchContext;
use crate::types::QCHUNK;

/// One input file and its read cursor.
pub struct QueryFile {
    pub path: PathBuf,
    pub file_index: u32,
    /// Spectra not yet extracted.
    pub remaining: usize,
    /// Batch number the next chunk will carry.
    pub next_batch: u64,
    reader: Option<Ms2Reader>,
}

impl QueryFile {
    fn ensure_open(&mut self, config: &SearchConfig) -> Result<&mut Ms2Reader> {
        if self.reader.is_none() {
            self.reader = Some(Ms2Reader::open(
                &self.path,
                config.scale,
                config.min_mass,
                config.max_mass,
            )?);
        }
        self.reader.as_mut().context("query file reader vanished")
    }
}

/// FIFO of unopened input files plus the park queue of preempted ones.
pub struct FileQueue {
    pending: Mutex<VecDeque<QueryFile>>,
    parked: Mutex<Vec<QueryFile>>,
    pub total_spectra: usize,
    pub total_batches: u64,
}

impl FileQueue {
    /// Scan the dataset and lay out batch-number offsets.
    pub fn scan_dataset(config: &SearchConfig) -> Result<FileQueue> {
        let paths = collect_files(&config.dataset)?;
        if paths.is_empty() {
            bail!("No MS2 files found at {}", config.dataset.display());
        }

        let mut pending = VecDeque::new();
        let mut next_batch = 0u64;
        let mut total_spectra = 0usize;
        for (i, path) in paths.iter().enumerate() {
            let (spectra, batches) =
                match Ms2Reader::scan(path, config.min_mass, config.max_mass, QCHUNK) {
                    Ok(counts) => counts,
                    Err(err) => {
                        warn!("skipping {}: {:#}", path.display(), err);
                        continue;
                    }
                };
            if spectra == 0 {
                warn!("skipping {}: no spectra in the mass window", path.display());
                continue;
            }

            info!(
                "queued {}: {} spectra, {} batches (first batch {})",
                path.display(),
                spectra,
                batches,
                next_batch
            );
            pending.push_back(QueryFile {
                path: path.clone(),
                file_index: i as u32,
                remaining: spectra,
                next_batch,
                reader: None,
            });
            next_batch += batches as u64;
            total_spectra += spectra;
        }

        Ok(FileQueue {
            pending: Mutex::new(pending),
            parked: Mutex::new(Vec::new()),
            total_spectra,
            total_batches: next_batch,
        })
    }

    /// Next file to work on: parked files (open cursors) before fresh ones.
    pub fn pop(&self) -> Option<QueryFile> {
        if let Some(f) = self.parked.lock().unwrap().pop() {
            return Some(f);
        }
        self.pending.lock().unwrap().pop_front()
    }

    /// Park a file mid-read so another worker can resume it.
    pub fn park(&self, file: QueryFile) {
        self.parked.lock().unwrap().push(file);
    }

    pub fn is_exhausted(&self) -> bool {
        self.pending.lock().unwrap().is_empty() && self.parked.lock().unwrap().is_empty()
    }
}

/// List the dataset's MS2 files: a single file as-is, a directory filtered
/// to `.ms2` / `.ms2.gz` in name order.
fn collect_files(dataset: &Path) -> Result<Vec<PathBuf>> {
    if dataset.is_file() {
        return Ok(vec![dataset.to_path_buf()]);
    }
    let mut paths = Vec::new();
    let entries = std::fs::read_dir(dataset)
        .with_context(|| format!("Failed to read dataset {}", dataset.display()))?;
    for entry in entries {
        let path = entry?.path();
        let name = path.file_name().map(|n| n.to_string_lossy().to_string());
        if let Some(name) = name {
            if name.ends_with(".ms2") || name.ends_with(".ms2.gz") {
                paths.push(path);
            }
        }
    }
    paths.sort();
    Ok(paths)
}

/// The I/O worker loop.
///
/// Pull a file, extract fixed-size chunks into wait buffers, publish them
/// ready. On preempt, or when the wait queue is dry, park the file and
/// yield the core back to compute. The worker that sees every queue empty
/// reports I/O complete on the way out.
pub fn io_worker(ctx: &SearchContext) {
    let mut current: Option<QueryFile> = None;

    loop {
        let mut file = match current.take().or_else(|| ctx.files.pop()) {
            Some(f) => f,
            None => {
                debug!("io worker: inputs drained");
                ctx.scheduler.mark_io_complete();
                return;
            }
        };

        if ctx.scheduler.check_preempt() {
            debug!("io worker: preempted, parking {}", file.path.display());
            ctx.files.park(file);
            ctx.scheduler.reopen_io();
            ctx.scheduler.yield_slot();
            return;
        }

        let mut buf = match ctx.pool.acquire_empty() {
            Some(b) => b,
            None => {
                ctx.files.park(file);
                ctx.scheduler.reopen_io();
                ctx.scheduler.yield_slot();
                return;
            }
        };
        buf.reset();

        let extracted = file
            .ensure_open(&ctx.config)
            .and_then(|reader| reader.read_chunk(QCHUNK, &mut buf));
        match extracted {
            Ok(0) => {
                // End of file; the buffer goes home untouched.
                ctx.pool.recycle(buf);
            }
            Ok(n) => {
                buf.batch = file.next_batch;
                buf.file_index = file.file_index;
                file.next_batch += 1;
                file.remaining = file.remaining.saturating_sub(n);

                if let Some(exchange) = &ctx.exchange {
                    exchange.register(buf.batch, n, file.file_index);
                }
                ctx.pool.publish(buf);

                if file.remaining > 0 {
                    current = Some(file);
                }
                continue;
            }
            Err(err) => {
                // Fatal for this file only; move on to the next.
                warn!("abandoning {}: {:#}", file.path.display(), err);
                ctx.pool.recycle(buf);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_file(dir: &Path, name: &str, spectra: usize) -> PathBuf {
        let path = dir.join(name);
        let mut f = std::fs::File::create(&path).unwrap();
        for i in 0..spectra {
            writeln!(f, "S\t{}\t{}\t751.0", i + 1, i + 1).unwrap();
            writeln!(f, "Z\t2\t1501.0").unwrap();
            writeln!(f, "400.0 7.0").unwrap();
        }
        path
    }

    fn test_config(dataset: &Path) -> SearchConfig {
        let mut config = SearchConfig::default();
        config.dataset = dataset.to_path_buf();
        config.clamp();
        config
    }

    #[test]
    fn test_scan_dataset_assigns_monotone_offsets() {
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), "a.ms2", 3);
        write_file(dir.path(), "b.ms2", 2);
        write_file(dir.path(), "notes.txt", 1);

        let queue = FileQueue::scan_dataset(&test_config(dir.path())).unwrap();
        assert_eq!(queue.total_spectra, 5);
        assert_eq!(queue.total_batches, 2);

        let first = queue.pop().unwrap();
        let second = queue.pop().unwrap();
        assert!(queue.pop().is_none());
        assert_eq!(first.next_batch, 0);
        assert_eq!(second.next_batch, 1);
        assert!(first.path.to_string_lossy().ends_with("a.ms2"));
    }

    #[test]
    fn test_parked_files_resume_first() {
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), "a.ms2", 1);
        write_file(dir.path(), "b.ms2", 1);

        let queue = FileQueue::scan_dataset(&test_config(dir.path())).unwrap();
        let a = queue.pop().unwrap();
        queue.park(a);
        assert!(!queue.is_exhausted());

        // The parked file comes back before the pending one.
        let resumed = queue.pop().unwrap();
        assert!(resumed.path.to_string_lossy().ends_with("a.ms2"));
        let b = queue.pop().unwrap();
        assert!(b.path.to_string_lossy().ends_with("b.ms2"));
        assert!(queue.is_exhausted());
    }

    #[test]
    fn test_single_file_dataset() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(dir.path(), "only.ms2", 2);
        let queue = FileQueue::scan_dataset(&test_config(&path)).unwrap();
        assert_eq!(queue.total_spectra, 2);
    }

    #[test]
    fn test_missing_dataset_errors() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir.path().join("nope"));
        assert!(FileQueue::scan_dataset(&config).is_err());
    }
}
