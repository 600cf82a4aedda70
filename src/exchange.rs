//! Multi-shard staging and merge.
//!
//! When the index is sharded, every shard scores all spectra against its
//! own peptides, so e-values are only correct against the union of shards.
//! Each scored batch stages a per-spectrum distribution descriptor plus a
//! 128-sample window of its survival histogram into a ring of reusable
//! slots; a single writer thread persists each slot to
//! `{workspace}/{batch}_{rank}.dat`. After the search loop a merge pass
//! reads every shard's files, sums histograms, combines descriptors, and
//! the caller re-runs the tail fit on the union.
//!
//! Slot ownership toggles strictly through the done flag: the producer
//! waits for done, clears it, fills the slot, and posts it; the writer
//! persists and re-arms done. Closing the post channel is the writer's
//! exit signal.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use ahash::AHashMap;
use anyhow::{Context, Result};
use crossbeam_channel::{bounded, Receiver, Sender};
use indexmap::IndexMap;
use log::{debug, warn};

use crate::scoring::SpectrumScore;
use crate::types::{
    score_bucket, PartialFit, SearchError, HISTOGRAM_SIZE, PARTIAL_FIT_BYTES, QCHUNK, XSAMPLES,
};

/// Staging ring depth.
pub const NIBUFFS: usize = 16;

#[derive(Default)]
struct SlotData {
    batch: u64,
    packs: Vec<PartialFit>,
    samples: Vec<u16>,
    /// Sample-block size, already in bytes.
    used_bytes: usize,
    done: bool,
}

struct StageSlot {
    data: Mutex<SlotData>,
    armed: Condvar,
}

impl StageSlot {
    fn new() -> Self {
        StageSlot {
            data: Mutex::new(SlotData {
                done: true,
                ..SlotData::default()
            }),
            armed: Condvar::new(),
        }
    }
}

/// The staging side of the exchange layer for one shard.
pub struct Exchange {
    slots: Arc<Vec<StageSlot>>,
    next_slot: AtomicU64,
    post: Mutex<Option<Sender<usize>>>,
    writer: Mutex<Option<JoinHandle<usize>>>,
    registry: Mutex<AHashMap<u64, (usize, u32)>>,
    workspace: PathBuf,
}

impl Exchange {
    /// Set up the slot ring and start the writer thread.
    pub fn new(workspace: &Path, rank: usize) -> Result<Self> {
        let slots: Arc<Vec<StageSlot>> = Arc::new((0..NIBUFFS).map(|_| StageSlot::new()).collect());
        let (post, posted): (Sender<usize>, Receiver<usize>) = bounded(NIBUFFS);

        let writer_slots = Arc::clone(&slots);
        let writer_dir = workspace.to_path_buf();
        let writer = std::thread::Builder::new()
            .name("stage-writer".to_string())
            .spawn(move || writer_loop(&writer_slots, posted, &writer_dir, rank))
            .map_err(|_| SearchError::Setup("staging writer thread".to_string()))?;

        Ok(Exchange {
            slots,
            next_slot: AtomicU64::new(0),
            post: Mutex::new(Some(post)),
            writer: Mutex::new(Some(writer)),
            registry: Mutex::new(AHashMap::new()),
            workspace: workspace.to_path_buf(),
        })
    }

    /// Record a produced batch: its spectrum count and source file.
    pub fn register(&self, batch: u64, count: usize, file_index: u32) {
        self.registry
            .lock()
            .unwrap()
            .insert(batch, (count, file_index));
    }

    /// Registered batches, ascending, with their spectrum counts.
    pub fn batches(&self) -> Vec<(u64, usize)> {
        let mut out: Vec<(u64, usize)> = self
            .registry
            .lock()
            .unwrap()
            .iter()
            .map(|(&b, &(count, _))| (b, count))
            .collect();
        out.sort();
        out
    }

    /// Stage one scored batch into the next ring slot and post it to the
    /// writer.
    pub fn stage_batch(&self, batch: u64, scores: &[SpectrumScore]) -> Result<()> {
        let idx = (self.next_slot.fetch_add(1, Ordering::AcqRel) as usize) % NIBUFFS;
        let slot = &self.slots[idx];

        let mut data = slot.data.lock().unwrap();
        while !data.done {
            data = slot.armed.wait(data).unwrap();
        }
        data.done = false;
        data.batch = batch;
        data.packs.clear();
        data.samples.clear();

        for (q, score) in scores.iter().enumerate() {
            let qid = (batch * QCHUNK as u64 + q as u64) as u32;
            let pack = score.partial(qid);
            // Samples window anchored at the lowest populated bucket.
            let base = if pack.n > 0 {
                score_bucket(pack.min as f64)
            } else {
                0
            };
            for i in 0..XSAMPLES {
                let v = score.survival.get(base + i).copied().unwrap_or(0);
                data.samples.push(v.min(u16::MAX as u32) as u16);
            }
            data.packs.push(pack);
        }
        data.used_bytes = scores.len() * XSAMPLES * std::mem::size_of::<u16>();
        drop(data);

        match self.post.lock().unwrap().as_ref() {
            Some(post) => post.send(idx).context("staging writer is gone"),
            None => Err(SearchError::Setup("staging writer channel".to_string()).into()),
        }
    }

    /// Close the ring and join the writer. Returns files written.
    pub fn finish(&self) -> usize {
        *self.post.lock().unwrap() = None;
        match self.writer.lock().unwrap().take() {
            Some(handle) => handle.join().unwrap_or_else(|_| {
                warn!("staging writer panicked");
                0
            }),
            None => 0,
        }
    }

    pub fn workspace(&self) -> &Path {
        &self.workspace
    }
}

impl Drop for Exchange {
    fn drop(&mut self) {
        self.finish();
    }
}

fn writer_loop(
    slots: &[StageSlot],
    posted: Receiver<usize>,
    workspace: &Path,
    rank: usize,
) -> usize {
    let mut written = 0usize;
    while let Ok(idx) = posted.recv() {
        let mut data = slots[idx].data.lock().unwrap();
        let path = workspace.join(format!("{}_{}.dat", data.batch, rank));
        match persist_slot(&path, &data) {
            Ok(()) => {
                debug!("staged batch {} to {}", data.batch, path.display());
                written += 1;
            }
            Err(err) => warn!("failed to stage {}: {:#}", path.display(), err),
        }
        data.done = true;
        drop(data);
        slots[idx].armed.notify_all();
    }
    written
}

/// Packs back-to-back, then the sample block, all little-endian.
fn persist_slot(path: &Path, data: &SlotData) -> Result<()> {
    let file = File::create(path)
        .with_context(|| format!("Failed to create staging file {}", path.display()))?;
    let mut w = BufWriter::new(file);
    for pack in &data.packs {
        w.write_all(&pack.to_le_bytes())?;
    }
    let samples = data.used_bytes / std::mem::size_of::<u16>();
    for s in &data.samples[..samples] {
        w.write_all(&s.to_le_bytes())?;
    }
    w.flush()?;
    Ok(())
}

/// A spectrum's score distribution merged across every shard.
pub struct MergedSpectrum {
    pub partial: PartialFit,
    pub survival: Vec<u32>,
}

impl MergedSpectrum {
    fn absorb(&mut self, pack: &PartialFit, samples: &[u16]) {
        if pack.n == 0 {
            return;
        }
        if self.partial.n == 0 {
            self.partial.min = pack.min;
            self.partial.max = pack.max;
            self.partial.max2 = pack.max2;
        } else {
            self.partial.min = self.partial.min.min(pack.min);
            // Global second-best is the runner-up of the union.
            let mut four = [self.partial.max, self.partial.max2, pack.max, pack.max2];
            four.sort_by(|a, b| b.total_cmp(a));
            self.partial.max = four[0];
            self.partial.max2 = four[1];
        }
        self.partial.n += pack.n;

        let base = score_bucket(pack.min as f64);
        for (i, &s) in samples.iter().enumerate() {
            let bucket = base + i;
            if bucket < HISTOGRAM_SIZE {
                self.survival[bucket] += s as u32;
            }
        }
    }
}

/// Read every shard's staging files for the given batches and merge
/// per-spectrum histograms and descriptors, in global query-id order.
pub fn merge_staged(
    workspace: &Path,
    shards: usize,
    batches: &[(u64, usize)],
) -> Result<IndexMap<u32, MergedSpectrum>> {
    let mut merged: IndexMap<u32, MergedSpectrum> = IndexMap::new();

    for &(batch, count) in batches {
        for rank in 0..shards {
            let path = workspace.join(format!("{}_{}.dat", batch, rank));
            let file = match File::open(&path) {
                Ok(f) => f,
                Err(_) => {
                    warn!("no staging file {} (shard down?)", path.display());
                    continue;
                }
            };
            let mut r = BufReader::new(file);

            let mut packs = Vec::with_capacity(count);
            for _ in 0..count {
                let mut raw = [0u8; PARTIAL_FIT_BYTES];
                r.read_exact(&mut raw)
                    .with_context(|| format!("truncated staging file {}", path.display()))?;
                packs.push(PartialFit::from_le_bytes(&raw));
            }
            let mut samples = vec![0u16; count * XSAMPLES];
            let mut raw = [0u8; 2];
            for s in &mut samples {
                r.read_exact(&mut raw)
                    .with_context(|| format!("truncated staging file {}", path.display()))?;
                *s = u16::from_le_bytes(raw);
            }

            for (q, pack) in packs.iter().enumerate() {
                let entry = merged
                    .entry(pack.qid)
                    .or_insert_with(|| MergedSpectrum {
                        partial: PartialFit {
                            qid: pack.qid,
                            ..PartialFit::default()
                        },
                        survival: vec![0; HISTOGRAM_SIZE],
                    });
                entry.absorb(pack, &samples[q * XSAMPLES..(q + 1) * XSAMPLES]);
            }
        }
    }

    Ok(merged)
}
