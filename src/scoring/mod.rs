//! The CPU scoring kernel.
//!
//! One ready batch at a time, a team of workers pulls small spectrum
//! ranges off a channel and runs each spectrum through the fragment-ion
//! index: precursor window lookup per length chunk, bin sweep over the
//! inverted index, b/y accumulation in a thread-private scorecard,
//! candidate extraction against the shared-peaks cut, and a bounded top-K
//! heap plus survival histogram per spectrum. Scorecards are cleared only
//! across the window each block touched.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::Arc;

use crossbeam_channel::{bounded, Receiver, Sender};

use crate::config::SearchConfig;
use crate::index::{FragmentIndex, PeakRecord};
use crate::tailfit;
use crate::types::{
    score_bucket, PartialFit, Psm, SearchError, SpectrumBatch, HISTOGRAM_SIZE, MAX_HYPERSCORE,
};

/// Spectra handed to a worker per task.
const SPECTRA_PER_TASK: usize = 4;

/// Factorial table size; match counts saturate at the last entry.
const FACT_TABLE: usize = 128;

/// Per-thread accumulators over the peptide entries of one length chunk.
pub struct Scorecard {
    bc: Vec<u16>,
    yc: Vec<u16>,
    ibc: Vec<f64>,
    iyc: Vec<f64>,
}

impl Scorecard {
    pub fn new(entries: usize) -> Self {
        Scorecard {
            bc: vec![0; entries],
            yc: vec![0; entries],
            ibc: vec![0.0; entries],
            iyc: vec![0.0; entries],
        }
    }

    pub fn len(&self) -> usize {
        self.bc.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bc.is_empty()
    }

    fn hit_b(&mut self, entry: usize, intensity: f64) {
        self.bc[entry] = self.bc[entry].saturating_add(1);
        self.ibc[entry] += intensity;
    }

    fn hit_y(&mut self, entry: usize, intensity: f64) {
        self.yc[entry] = self.yc[entry].saturating_add(1);
        self.iyc[entry] += intensity;
    }

    /// Zero only the touched window `[lo, hi]`.
    pub fn clear_window(&mut self, lo: usize, hi: usize) {
        self.bc[lo..=hi].fill(0);
        self.yc[lo..=hi].fill(0);
        self.ibc[lo..=hi].fill(0.0);
        self.iyc[lo..=hi].fill(0.0);
    }

    #[cfg(test)]
    fn counts(&self, entry: usize) -> (u16, u16, f64, f64) {
        (self.bc[entry], self.yc[entry], self.ibc[entry], self.iyc[entry])
    }
}

/// Per-spectrum scoring state: bounded top-K heap, survival histogram, and
/// the distribution extremes the multi-shard merge needs.
pub struct SpectrumScore {
    heap: BinaryHeap<Reverse<Psm>>,
    pub survival: Vec<u32>,
    pub cpsms: u32,
    pub max_hyp: f64,
    pub next_hyp: f64,
    pub min_hyp: f64,
}

impl SpectrumScore {
    pub fn new(topmatches: usize) -> Self {
        SpectrumScore {
            heap: BinaryHeap::with_capacity(topmatches + 1),
            survival: vec![0; HISTOGRAM_SIZE],
            cpsms: 0,
            max_hyp: 0.0,
            next_hyp: 0.0,
            min_hyp: f64::MAX,
        }
    }

    /// Record a candidate that already passed the shared-peaks cut with a
    /// positive hyperscore.
    pub fn push(&mut self, psm: Psm, topmatches: usize) {
        self.survival[score_bucket(psm.hyperscore)] += 1;
        self.cpsms += 1;

        if psm.hyperscore > self.max_hyp {
            self.next_hyp = self.max_hyp;
            self.max_hyp = psm.hyperscore;
        } else if psm.hyperscore > self.next_hyp {
            self.next_hyp = psm.hyperscore;
        }
        if psm.hyperscore < self.min_hyp {
            self.min_hyp = psm.hyperscore;
        }

        if self.heap.len() < topmatches {
            self.heap.push(Reverse(psm));
        } else if let Some(Reverse(bottom)) = self.heap.peek() {
            // Strictly better only: equal scores keep the earlier arrival.
            if psm > *bottom {
                self.heap.pop();
                self.heap.push(Reverse(psm));
            }
        }
    }

    /// Best candidate, if any survived.
    pub fn top(&self) -> Option<Psm> {
        self.heap.iter().map(|r| r.0).max()
    }

    /// Retained candidates, best first.
    pub fn ranked(&self) -> Vec<Psm> {
        self.heap
            .clone()
            .into_sorted_vec()
            .into_iter()
            .map(|r| r.0)
            .collect()
    }

    pub fn heap_len(&self) -> usize {
        self.heap.len()
    }

    /// Distribution descriptor for the multi-shard exchange.
    pub fn partial(&self, qid: u32) -> PartialFit {
        if self.cpsms == 0 {
            return PartialFit {
                qid,
                ..PartialFit::default()
            };
        }
        PartialFit {
            min: self.min_hyp as f32,
            max: self.max_hyp as f32,
            max2: self.next_hyp as f32,
            n: self.cpsms,
            qid,
        }
    }
}

/// The scoring capability: batch scoring plus the per-spectrum tail fit.
///
/// The CPU implementation below is the default; a device-offload variant
/// plugs in behind the same pair of operations.
pub trait ScoringBackend: Send + Sync {
    /// Score every spectrum of the batch with a team of `width` workers,
    /// returning per-spectrum results in spectrum order.
    fn score(
        &self,
        batch: &SpectrumBatch,
        index: &FragmentIndex,
        width: usize,
    ) -> Result<Vec<SpectrumScore>, SearchError>;

    /// Expect value of the spectrum's top hit.
    fn fit(&self, score: &SpectrumScore) -> f64;
}

pub struct CpuBackend {
    config: Arc<SearchConfig>,
    pool: rayon::ThreadPool,
    factorial: [f64; FACT_TABLE],
}

impl CpuBackend {
    pub fn new(config: Arc<SearchConfig>) -> Result<Self, SearchError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.threads.max(1))
            .build()
            .map_err(|_| SearchError::Setup("compute thread pool".to_string()))?;

        let mut factorial = [1.0f64; FACT_TABLE];
        for i in 1..FACT_TABLE {
            factorial[i] = factorial[i - 1] * i as f64;
        }
        debug_assert!(factorial[4] == 24.0);

        Ok(CpuBackend {
            config,
            pool,
            factorial,
        })
    }

    /// Worker-team width for a batch: the configured maximum minus active
    /// I/O threads, floored at 75% of the maximum so compute always makes
    /// progress.
    pub fn width(&self, active_io: usize) -> usize {
        let max = self.config.threads.max(1);
        let floor = (max * 3).div_ceil(4);
        max.saturating_sub(active_io).max(floor)
    }
}

impl ScoringBackend for CpuBackend {
    fn score(
        &self,
        batch: &SpectrumBatch,
        index: &FragmentIndex,
        width: usize,
    ) -> Result<Vec<SpectrumScore>, SearchError> {
        let width = width.clamp(1, self.config.threads.max(1));
        let entries = index.max_chunk_entries();

        // Scratch for every worker, validated before the sweep starts.
        let cards: Vec<Scorecard> = (0..width).map(|_| Scorecard::new(entries)).collect();
        if cards.len() < width || cards.iter().any(|c| c.len() < entries) {
            return Err(SearchError::ScratchMissing);
        }

        let (task_tx, task_rx): (Sender<(usize, usize)>, Receiver<(usize, usize)>) =
            bounded(width * 2);
        let (out_tx, out_rx): (Sender<(usize, SpectrumScore)>, Receiver<(usize, SpectrumScore)>) =
            bounded(batch.count.max(1));

        let config = &self.config;
        let factorial = &self.factorial;
        self.pool.scope(|s| {
            for mut card in cards {
                let task_rx = task_rx.clone();
                let out_tx = out_tx.clone();
                s.spawn(move |_| {
                    while let Ok((lo, hi)) = task_rx.recv() {
                        for q in lo..hi {
                            let score =
                                score_spectrum(q, batch, index, config, factorial, &mut card);
                            if out_tx.send((q, score)).is_err() {
                                return;
                            }
                        }
                    }
                });
            }

            for start in (0..batch.count).step_by(SPECTRA_PER_TASK) {
                let end = (start + SPECTRA_PER_TASK).min(batch.count);
                if task_tx.send((start, end)).is_err() {
                    break;
                }
            }
            drop(task_tx);
        });
        drop(out_tx);

        let mut results: Vec<Option<SpectrumScore>> = (0..batch.count).map(|_| None).collect();
        for (q, score) in out_rx.try_iter() {
            results[q] = Some(score);
        }
        results
            .into_iter()
            .map(|slot| slot.ok_or(SearchError::MissingWork))
            .collect()
    }

    fn fit(&self, score: &SpectrumScore) -> f64 {
        if self.config.gumbelfit {
            tailfit::gumbel(
                &score.survival,
                score.cpsms,
                score.max_hyp,
                self.config.min_cpsm,
            )
        } else {
            tailfit::log_linear(
                &score.survival,
                score.cpsms,
                score.max_hyp,
                self.config.min_cpsm,
            )
        }
    }
}

/// Score one spectrum against every length chunk of the index.
fn score_spectrum(
    q: usize,
    batch: &SpectrumBatch,
    index: &FragmentIndex,
    config: &SearchConfig,
    factorial: &[f64; FACT_TABLE],
    card: &mut Scorecard,
) -> SpectrumScore {
    let mut out = SpectrumScore::new(config.topmatches);
    let pmass = batch.precursors[q];
    let (mzs, intens) = batch.peaks(q);
    let df = config.df;
    // Peaks are swept only strictly inside (df, max_bin - 1 - df).
    let ceiling = index.max_bin.saturating_sub(1 + df);
    let charge_cap = if config.matchcharge && batch.charges[q] > 0 {
        batch.charges[q] as u32
    } else {
        u32::MAX
    };

    for (ci, chunk) in index.chunks.iter().enumerate() {
        if chunk.is_empty() {
            continue;
        }
        let (wmin, wmax, found) = chunk.precursor_window(pmass, config.dm);
        if !found {
            continue;
        }
        let speclen = chunk.speclen;

        for block in &chunk.blocks {
            for (k, &mz) in mzs.iter().enumerate() {
                if mz <= df || mz >= ceiling {
                    continue;
                }
                for bin in (mz - df)..=(mz + df) {
                    for &raw in block.bin_ions(bin as usize, wmin, wmax, speclen) {
                        let rec = PeakRecord(raw);
                        if charge_cap != u32::MAX
                            && rec.charge(speclen as u32, chunk.peplen as u32) > charge_cap
                        {
                            continue;
                        }
                        let entry = rec.entry(speclen as u32) as usize;
                        if rec.is_b(speclen as u32) {
                            card.hit_b(entry, intens[k] as f64);
                        } else {
                            card.hit_y(entry, intens[k] as f64);
                        }
                    }
                }
            }

            for entry in wmin..=wmax {
                let shared = card.bc[entry] as usize + card.yc[entry] as usize;
                if shared < config.min_shp {
                    continue;
                }
                let h = hyperscore(
                    factorial,
                    card.bc[entry],
                    card.yc[entry],
                    card.ibc[entry],
                    card.iyc[entry],
                );
                if h > 0.0 {
                    out.push(
                        Psm {
                            hyperscore: h,
                            chunk: ci as u16,
                            entry: entry as u32,
                            shared_ions: shared as u16,
                            total_ions: speclen as u16,
                            pmass,
                            rtime: batch.rtimes[q],
                            charge: batch.charges[q],
                            file_index: batch.file_index,
                        },
                        config.topmatches,
                    );
                }
            }

            card.clear_window(wmin, wmax);
        }
    }

    out
}

/// `log10(0.001 + bc! * yc! * ibc * iyc) - 6`, capped at the score ceiling.
fn hyperscore(factorial: &[f64; FACT_TABLE], bc: u16, yc: u16, ibc: f64, iyc: f64) -> f64 {
    let bf = factorial[(bc as usize).min(FACT_TABLE - 1)];
    let yf = factorial[(yc as usize).min(FACT_TABLE - 1)];
    let h = (0.001 + bf * yf * ibc * iyc).log10() - 6.0;
    h.min(MAX_HYPERSCORE)
}
