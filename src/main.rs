//! CLI entry point for psmatch.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;
use log::info;

use psmatch::config::SearchConfig;
use psmatch::index::builder;
use psmatch::pipeline::{output_path, run_search};
use psmatch::types::ShardPolicy;

/// Fragment-ion-index peptide-spectrum matching engine.
///
/// Searches MS2 spectra against an indexed peptide database and reports
/// expect-valued PSMs.
#[derive(Parser, Debug)]
#[command(name = "psmatch")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Peptide database list file (one sequence per line, .gz supported)
    #[arg(short = 'd', long = "dbpath")]
    dbpath: PathBuf,

    /// MS2 dataset: a file or a directory of .ms2/.ms2.gz files
    #[arg(short = 'i', long = "dataset")]
    dataset: PathBuf,

    /// Workspace directory for output, staging, and the index cache
    #[arg(short = 'w', long = "workspace")]
    workspace: PathBuf,

    /// Max concurrent compute threads (0 = auto-detect)
    #[arg(short = 'j', long = "threads", default_value = "8")]
    threads: usize,

    /// Max concurrent I/O threads
    #[arg(long = "prepthreads", default_value = "4")]
    prepthreads: usize,

    /// Max simultaneous GPU offload streams
    #[arg(long = "gputhreads", default_value = "0")]
    gputhreads: usize,

    /// Minimum peptide length
    #[arg(long = "min_len", default_value = "6")]
    min_len: usize,

    /// Maximum peptide length
    #[arg(long = "max_len", default_value = "40")]
    max_len: usize,

    /// Maximum fragment charge
    #[arg(short = 'z', long = "maxz", default_value = "3")]
    maxz: usize,

    /// m/z bin width in Da (clamped to 0.01 - 5.0)
    #[arg(short = 'r', long = "res", default_value = "0.01")]
    res: f64,

    /// Precursor mass window half-width in Da (negative disables the window)
    #[arg(long = "dm", default_value = "10.0", allow_hyphen_values = true)]
    dm: f64,

    /// Fragment m/z tolerance in Da
    #[arg(long = "df", default_value = "0.02")]
    df: f64,

    /// Minimum accepted precursor mass in Da
    #[arg(long = "min_mass", default_value = "500.0")]
    min_mass: f64,

    /// Maximum accepted precursor mass in Da
    #[arg(long = "max_mass", default_value = "5000.0")]
    max_mass: f64,

    /// Minimum shared b+y ions for candidacy
    #[arg(long = "min_shp", default_value = "4")]
    min_shp: usize,

    /// Minimum candidates to attempt the tail fit
    #[arg(long = "min_cpsm", default_value = "4")]
    min_cpsm: usize,

    /// Top matches kept per spectrum
    #[arg(short = 'k', long = "topmatches", default_value = "10")]
    topmatches: usize,

    /// E-value ceiling for reporting
    #[arg(short = 'e', long = "expect_max", default_value = "20.0")]
    expect_max: f64,

    /// Scratch memory budget in MB
    #[arg(long = "spadmem", default_value = "2048")]
    spadmem: usize,

    /// Index distribution policy: cyclic, chunk, or zigzag
    #[arg(short = 'p', long = "policy", default_value = "cyclic")]
    policy: String,

    /// Variable PTMs, comma-separated AA:MASS:NUM
    #[arg(short = 'm', long = "mods", default_value = "")]
    mods: String,

    /// This shard's rank
    #[arg(long = "rank", default_value = "0")]
    rank: usize,

    /// Total index shards
    #[arg(long = "shards", default_value = "1")]
    shards: usize,

    /// Skip building device-resident index structures
    #[arg(long = "nogpuindex")]
    nogpuindex: bool,

    /// Rebuild the index even if a cache exists
    #[arg(long = "reindex")]
    reindex: bool,

    /// Do not persist the built index
    #[arg(long = "nocache")]
    nocache: bool,

    /// Use the Gumbel estimator instead of the log-survival tail fit
    #[arg(long = "gumbelfit")]
    gumbelfit: bool,

    /// Restrict fragment matching to the spectrum's precursor charge
    #[arg(long = "matchcharge")]
    matchcharge: bool,

    /// Suppress per-batch progress lines
    #[arg(long = "noprogress")]
    noprogress: bool,

    /// Verbose logging
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let default_level = if args.verbose { "debug" } else { "info" };
    let env = env_logger::Env::default().filter_or("PSMATCH_LOG", default_level);
    env_logger::init_from_env(env);

    // Validate inputs
    if !args.dbpath.exists() {
        bail!("Peptide database not found: {}", args.dbpath.display());
    }
    if !args.dataset.exists() {
        bail!("Dataset not found: {}", args.dataset.display());
    }
    std::fs::create_dir_all(&args.workspace).with_context(|| {
        format!("Failed to create workspace {}", args.workspace.display())
    })?;

    let policy: ShardPolicy = args
        .policy
        .parse()
        .context("Policy can only be one of the following: cyclic, chunk or zigzag")?;

    if args.shards == 0 {
        bail!("The shard count cannot be 0.");
    }
    if args.rank >= args.shards {
        bail!("The rank must be below the shard count.");
    }

    // Determine thread count
    let threads = if args.threads == 0 {
        num_cpus::get()
    } else {
        args.threads
    };

    // Build configuration; out-of-range numerics are clamped, not rejected.
    let mut config = SearchConfig {
        dbpath: args.dbpath,
        dataset: args.dataset,
        workspace: args.workspace,
        threads,
        prep_threads: args.prepthreads.max(1),
        gpu_threads: args.gputhreads,
        min_len: args.min_len,
        max_len: args.max_len,
        maxz: args.maxz,
        res: args.res,
        dm: args.dm,
        min_mass: args.min_mass,
        max_mass: args.max_mass,
        min_shp: args.min_shp,
        min_cpsm: args.min_cpsm,
        topmatches: args.topmatches,
        expect_max: args.expect_max,
        spadmem_mb: args.spadmem,
        policy,
        rank: args.rank,
        shards: args.shards,
        nogpuindex: args.nogpuindex,
        reindex: args.reindex,
        nocache: args.nocache,
        gumbelfit: args.gumbelfit,
        matchcharge: args.matchcharge,
        noprogress: args.noprogress,
        verbose: args.verbose,
        ..SearchConfig::default()
    };
    if !config.parse_mods(&args.mods) {
        bail!("Mods not properly passed (expected AA:MASS:NUM, comma-separated).");
    }
    config.clamp();
    // Fragment tolerance is configured in Da but swept in scaled bins.
    config.df = (args.df.max(0.0) * config.scale as f64).round() as u32;

    let index = builder::load_or_build(&config)?;
    if index.total_peptides() == 0 {
        bail!(
            "The index is empty: no peptides of length {}..={} in {} - {} Da.",
            config.min_len,
            config.max_len,
            config.min_mass,
            config.max_mass
        );
    }

    let report = output_path(&config);
    let summary = run_search(config, &index)?;
    info!(
        "{} PSMs from {} spectra written to {}",
        summary.psms_written,
        summary.spectra,
        report.display()
    );

    eprintln!("Done!");
    Ok(())
}
