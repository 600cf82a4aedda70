//! The search pipeline manager.
//!
//! Three cooperating thread populations run the search: dynamic I/O
//! workers streaming spectrum batches off disk, the compute team scoring
//! ready batches, and (multi-shard) the staging writer. The consumer loop
//! here owns the iteration: it polls the ready queue, reports its stall
//! penalty to the scheduler so cores migrate between I/O and compute, and
//! finalizes every scored batch either straight into the output sink or
//! into the exchange layer.

pub mod pool;
pub mod reader;
pub mod scheduler;

use std::path::PathBuf;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use indexmap::IndexMap;
use log::{debug, info, warn};

use crate::config::SearchConfig;
use crate::exchange::{merge_staged, Exchange, MergedSpectrum};
use crate::index::FragmentIndex;
use crate::output::PsmSink;
use crate::scoring::{CpuBackend, ScoringBackend};
use crate::tailfit;
use crate::types::{Psm, QCHUNK};

use pool::BatchPool;
use reader::{io_worker, FileQueue};
use scheduler::{Directive, Scheduler};

/// Consumer poll interval on an empty ready queue.
pub const POLL_SLEEP: Duration = Duration::from_millis(100);

/// Shared state threaded through every pipeline participant; its lifetime
/// brackets the whole search.
pub struct SearchContext {
    pub config: Arc<SearchConfig>,
    pub pool: BatchPool,
    pub scheduler: Scheduler,
    pub files: FileQueue,
    pub exchange: Option<Exchange>,
}

/// Outcome counters of a finished search.
pub struct Summary {
    pub spectra: usize,
    pub batches: u64,
    pub psms_written: usize,
}

/// This shard's output file.
pub fn output_path(config: &SearchConfig) -> PathBuf {
    config.workspace.join(format!("psms_r{}.tsv", config.rank))
}

/// Run the whole search: stream, score, estimate, report.
pub fn run_search(config: SearchConfig, index: &FragmentIndex) -> Result<Summary> {
    let config = Arc::new(config);
    let files = FileQueue::scan_dataset(&config)?;
    info!(
        "dataset: {} spectra across {} batches",
        files.total_spectra, files.total_batches
    );

    let exchange = if config.shards > 1 {
        Some(Exchange::new(&config.workspace, config.rank)?)
    } else {
        None
    };

    let ctx = Arc::new(SearchContext {
        config: Arc::clone(&config),
        pool: BatchPool::new(config.pool_slots()),
        scheduler: Scheduler::new(config.prep_threads.max(1)),
        files,
        exchange,
    });

    let backend = select_backend(&config)?;
    let sink = PsmSink::create(&output_path(&config), config.expect_max)?;

    // Local best hit per global query id, kept for the merge pass.
    let mut local_tops: IndexMap<u32, (Psm, u32)> = IndexMap::new();

    let mut io_workers: Vec<JoinHandle<()>> = Vec::new();
    spawn_io(&ctx, &mut io_workers);

    let started = Instant::now();
    let mut scored_batches = 0u64;
    let mut scored_spectra = 0usize;

    loop {
        // Wait for a ready batch, accumulating the stall penalty so the
        // scheduler can grow the I/O side mid-stall.
        let mut penalty = Duration::ZERO;
        let taken = loop {
            if let Some(batch) = ctx.pool.take_ready() {
                break Some(batch);
            }
            if ctx.scheduler.check_signal() && ctx.pool.is_ready_empty() {
                break None;
            }
            std::thread::sleep(POLL_SLEEP);
            penalty += POLL_SLEEP;
            if ctx.scheduler.run_manager(penalty, ctx.pool.ready_level()) == Directive::SpawnIo {
                spawn_io(&ctx, &mut io_workers);
                penalty = Duration::ZERO;
            }
        };
        let Some(batch) = taken else { break };

        if ctx.scheduler.run_manager(penalty, ctx.pool.ready_level()) == Directive::SpawnIo {
            spawn_io(&ctx, &mut io_workers);
        }

        let width = backend.width(ctx.scheduler.active_io());
        let clock = Instant::now();
        let scores = backend.score(&batch, index, width)?;

        if let Some(exchange) = &ctx.exchange {
            exchange.stage_batch(batch.batch, &scores)?;
            for (q, score) in scores.iter().enumerate() {
                if let Some(top) = score.top() {
                    let qid = (batch.batch * QCHUNK as u64 + q as u64) as u32;
                    local_tops.insert(qid, (top, score.cpsms));
                }
            }
        } else {
            for (q, score) in scores.iter().enumerate() {
                if (score.cpsms as usize) < config.min_cpsm {
                    continue;
                }
                let Some(top) = score.top() else { continue };
                let evalue = backend.fit(score);
                let qid = batch.batch * QCHUNK as u64 + q as u64;
                sink.submit(qid, &top, score.cpsms, evalue, index)?;
            }
        }

        scored_batches += 1;
        scored_spectra += batch.count;
        if !config.noprogress {
            info!(
                "batch {}: {} spectra scored in {:.0?} ({} compute threads)",
                batch.batch,
                batch.count,
                clock.elapsed(),
                width
            );
        }
        ctx.pool.recycle(batch);
    }

    // Orderly teardown: workers first, then the staging writer, then the
    // buffer ring.
    for handle in io_workers {
        if handle.join().is_err() {
            warn!("an I/O worker panicked");
        }
    }
    let psms_written = match &ctx.exchange {
        Some(exchange) => {
            exchange.finish();
            merge_and_report(exchange, &config, index, &sink, &local_tops)?
        }
        None => sink.finish()?,
    };
    let drained = ctx.pool.drain();
    debug!("pool drained: {} buffers reclaimed", drained);

    info!(
        "search complete: {} spectra in {} batches, {} PSMs reported in {:.1?}",
        scored_spectra,
        scored_batches,
        psms_written,
        started.elapsed()
    );
    Ok(Summary {
        spectra: scored_spectra,
        batches: scored_batches,
        psms_written,
    })
}

/// Spawn one I/O worker and account it with the scheduler.
fn spawn_io(ctx: &Arc<SearchContext>, handles: &mut Vec<JoinHandle<()>>) {
    ctx.scheduler.register_io();
    let worker_ctx = Arc::clone(ctx);
    let spawned = std::thread::Builder::new()
        .name("io-worker".to_string())
        .spawn(move || io_worker(&worker_ctx));
    match spawned {
        Ok(handle) => handles.push(handle),
        Err(err) => {
            ctx.scheduler.yield_slot();
            warn!("could not spawn I/O worker: {}", err);
        }
    }
}

/// Pick the scoring backend for this run. Device offload is an extension
/// point; requests for it fall back to the CPU team.
fn select_backend(config: &Arc<SearchConfig>) -> Result<CpuBackend> {
    if config.gpu_threads > 0 && !config.nogpuindex {
        warn!("GPU offload not built in; scoring on CPU");
    }
    Ok(CpuBackend::new(Arc::clone(config))?)
}

/// Multi-shard epilogue: merge every shard's staged distributions and emit
/// the spectra whose global best hit was produced locally.
fn merge_and_report(
    exchange: &Exchange,
    config: &SearchConfig,
    index: &FragmentIndex,
    sink: &PsmSink,
    local_tops: &IndexMap<u32, (Psm, u32)>,
) -> Result<usize> {
    let batches = exchange.batches();
    let merged = merge_staged(exchange.workspace(), config.shards, &batches)
        .context("Failed to merge staged shard files")?;
    info!(
        "merging {} spectra across {} shards",
        merged.len(),
        config.shards
    );

    for (qid, m) in &merged {
        if (m.partial.n as usize) < config.min_cpsm {
            continue;
        }
        let Some((top, _)) = local_tops.get(qid) else {
            continue;
        };
        // Only the shard holding the global best emits the record.
        if (top.hyperscore as f32) < m.partial.max {
            continue;
        }
        let evalue = merged_evalue(m, config);
        sink.submit(*qid as u64, top, m.partial.n, evalue, index)?;
    }
    sink.finish()
}

fn merged_evalue(m: &MergedSpectrum, config: &SearchConfig) -> f64 {
    if config.gumbelfit {
        tailfit::gumbel(
            &m.survival,
            m.partial.n,
            m.partial.max as f64,
            config.min_cpsm,
        )
    } else {
        tailfit::log_linear(
            &m.survival,
            m.partial.n,
            m.partial.max as f64,
            config.min_cpsm,
        )
    }
}
