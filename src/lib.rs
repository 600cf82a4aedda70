//! psmatch - fragment-ion-index peptide-spectrum matching.
//!
//! This library scores tandem-MS spectra against an inverted fragment-ion
//! index of theoretical peptides and derives an expect value for each
//! spectrum's best hit from the tail of its score distribution.
//!
//! # Features
//!
//! - Stream MS2 files (with gzip support) in fixed-size columnar batches
//!   through a reusable buffer pool
//! - Trade CPU cores between I/O and compute online, driven by the
//!   consumer's measured stall penalty
//! - Two-sided precursor window search plus a bin sweep over the
//!   compressed-sparse-row fragment index, with per-thread scorecards
//! - Hyperscore ranking with a bounded top-K heap and per-spectrum
//!   survival histograms
//! - Log-survival tail fit (or Gumbel moment fit) for e-values
//! - Multi-shard staging files and a histogram merge pass for globally
//!   correct e-values
//!
//! # Example
//!
//! ```ignore
//! use psmatch::config::SearchConfig;
//! use psmatch::index::builder;
//! use psmatch::pipeline::run_search;
//!
//! let mut config = SearchConfig::default();
//! config.dbpath = "peptides.txt".into();
//! config.dataset = "spectra/".into();
//! config.workspace = "out/".into();
//! config.clamp();
//!
//! let index = builder::load_or_build(&config)?;
//! let summary = run_search(config, &index)?;
//! println!("{} PSMs reported", summary.psms_written);
//! ```

pub mod config;
pub mod exchange;
pub mod index;
pub mod mass;
pub mod output;
pub mod parser;
pub mod pipeline;
pub mod scoring;
pub mod tailfit;
pub mod types;

pub use config::SearchConfig;
pub use index::FragmentIndex;
pub use pipeline::{run_search, Summary};
pub use types::{PartialFit, Psm, ShardPolicy, SpectrumBatch};
