//! Fragment-ion index construction and caching.
//!
//! Builds the inverted index from a peptide list file (one sequence per
//! line, gzip supported): variable PTM expansion, length/mass filtering,
//! mass sort, shard selection, and the per-block bin layout. A built index
//! round-trips through a little-endian cache file in the workspace so
//! repeated runs skip the build.

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use log::{debug, info};
use rayon::prelude::*;

use crate::config::{PtmMod, SearchConfig};
use crate::index::{FragmentIndex, IonBlock, LengthChunk, PeakRecord};
use crate::mass::{residue_mass, scale_mz, H2O, PROTON};
use crate::parser::util::open_reader;
use crate::types::ShardPolicy;

/// Peptides per ion block.
pub const BLOCK_PEPTIDES: usize = 8192;

/// Cap on PTM variants generated per base peptide.
const MAX_VARIANTS: usize = 64;

const CACHE_MAGIC: &[u8; 8] = b"PSMIDX01";

/// A peptide ready for indexing: per-residue masses (modifications folded
/// in), display sequence, and neutral mass.
#[derive(Debug, Clone)]
struct Entry {
    residues: Vec<f64>,
    display: String,
    mass: f64,
}

/// Load the cached index for this shard, or build it from the peptide list
/// and cache the result.
pub fn load_or_build(config: &SearchConfig) -> Result<FragmentIndex> {
    let cache = cache_path(config);
    if !config.reindex {
        match try_read_cache(&cache, config) {
            Ok(Some(index)) => {
                info!(
                    "loaded cached index: {} peptides in {} chunks",
                    index.total_peptides(),
                    index.chunks.len()
                );
                return Ok(index);
            }
            Ok(None) => {}
            Err(err) => debug!("unreadable index cache ({}), rebuilding", err),
        }
    }

    let index = build(config)?;
    if !config.nocache {
        write_cache(&cache, &index, config)
            .with_context(|| format!("Failed to cache index to {}", cache.display()))?;
    }
    Ok(index)
}

fn cache_path(config: &SearchConfig) -> PathBuf {
    config
        .workspace
        .join(format!("index_r{}.pidx", config.rank))
}

/// Build the index for this shard from the configured peptide list.
pub fn build(config: &SearchConfig) -> Result<FragmentIndex> {
    let sequences = parse_peptide_list(&config.dbpath)?;
    if sequences.is_empty() {
        bail!(
            "No peptide sequences found in {}",
            config.dbpath.display()
        );
    }

    // Expand PTM variants and compute masses in parallel; the filters here
    // mirror the query acceptance window so index and spectra agree.
    let mut entries: Vec<Entry> = sequences
        .par_iter()
        .flat_map_iter(|seq| mod_variants(seq, &config.mods))
        .filter(|e| {
            e.residues.len() >= config.min_len
                && e.residues.len() <= config.max_len
                && e.mass >= config.min_mass
                && e.mass <= config.max_mass
        })
        .collect();

    entries.sort_by(|a, b| {
        a.residues
            .len()
            .cmp(&b.residues.len())
            .then(a.mass.total_cmp(&b.mass))
    });

    let max_bin = config.max_scaled_mz();
    let mut chunks = Vec::with_capacity(config.idxchunk());
    for peplen in config.min_len..=config.max_len {
        let group: Vec<&Entry> = entries
            .iter()
            .filter(|e| e.residues.len() == peplen)
            .collect();

        // Shard selection happens on the mass-sorted order so every shard
        // sees the full mass range under cyclic and zigzag policies.
        let mine: Vec<&Entry> = group
            .iter()
            .enumerate()
            .filter(|(i, _)| shard_owns(*i, group.len(), config.rank, config.shards, config.policy))
            .map(|(_, e)| *e)
            .collect();

        chunks.push(build_chunk(peplen, &mine, config, max_bin));
    }

    let index = FragmentIndex {
        chunks,
        scale: config.scale,
        maxz: config.maxz,
        max_bin,
    };
    info!(
        "built index: {} peptides in {} chunks (rank {}/{}, {})",
        index.total_peptides(),
        index.chunks.len(),
        config.rank,
        config.shards,
        config.policy.as_str()
    );
    Ok(index)
}

/// Whether `rank` owns sorted position `i` of `n` under the policy.
pub fn shard_owns(i: usize, n: usize, rank: usize, shards: usize, policy: ShardPolicy) -> bool {
    if shards <= 1 {
        return true;
    }
    match policy {
        ShardPolicy::Cyclic => i % shards == rank,
        ShardPolicy::Chunk => {
            let per = n.div_ceil(shards);
            i / per.max(1) == rank
        }
        ShardPolicy::Zigzag => {
            let pass = i / shards;
            let pos = i % shards;
            let owner = if pass % 2 == 0 { pos } else { shards - 1 - pos };
            owner == rank
        }
    }
}

fn build_chunk(peplen: usize, entries: &[&Entry], config: &SearchConfig, max_bin: u32) -> LengthChunk {
    let speclen = config.speclen(peplen);
    let n_blocks = entries.len().div_ceil(BLOCK_PEPTIDES);
    let mut blocks = Vec::with_capacity(n_blocks);

    for block_no in 0..n_blocks {
        let lo = block_no * BLOCK_PEPTIDES;
        let hi = (lo + BLOCK_PEPTIDES).min(entries.len());

        let mut per_bin: Vec<Vec<u32>> = vec![Vec::new(); max_bin as usize + 1];
        for entry_idx in lo..hi {
            // Slots are generated ascending, so records arrive sorted
            // within every bin without a separate sort pass.
            for (slot, bin) in ion_bins(&entries[entry_idx].residues, config, max_bin) {
                per_bin[bin as usize]
                    .push(PeakRecord::pack(entry_idx as u32, slot, speclen as u32).0);
            }
        }

        let mut bin_offsets = Vec::with_capacity(max_bin as usize + 2);
        let mut ions = Vec::new();
        bin_offsets.push(0);
        for bin in per_bin {
            ions.extend_from_slice(&bin);
            bin_offsets.push(ions.len() as u32);
        }
        blocks.push(IonBlock { bin_offsets, ions });
    }

    debug!(
        "chunk peplen={}: {} peptides, {} blocks",
        peplen,
        entries.len(),
        blocks.len()
    );
    LengthChunk {
        peplen,
        speclen,
        masses: entries.iter().map(|e| e.mass).collect(),
        sequences: entries.iter().map(|e| e.display.clone()).collect(),
        block_size: BLOCK_PEPTIDES,
        blocks,
    }
}

/// b- and y-ion `(slot, bin)` pairs for one peptide, slot ascending.
///
/// Slot layout per half: charge-major, `(z - 1) * (peplen - 1) + (k - 1)`.
fn ion_bins<'a>(
    residues: &'a [f64],
    config: &'a SearchConfig,
    max_bin: u32,
) -> impl Iterator<Item = (u32, u32)> + 'a {
    let peplen = residues.len();
    let half = (peplen - 1) * config.maxz;
    let scale = config.scale;

    let b_ions = (1..=config.maxz).flat_map(move |z| {
        let mut prefix = 0.0;
        residues[..peplen - 1]
            .iter()
            .enumerate()
            .map(move |(k, r)| {
                prefix += r;
                let mz = (prefix + z as f64 * PROTON) / z as f64;
                let slot = ((z - 1) * (peplen - 1) + k) as u32;
                (slot, scale_mz(mz, scale))
            })
            .collect::<Vec<_>>()
    });

    let y_ions = (1..=config.maxz).flat_map(move |z| {
        let mut suffix = 0.0;
        (1..peplen)
            .map(move |k| {
                suffix += residues[peplen - k];
                let mz = (suffix + H2O + z as f64 * PROTON) / z as f64;
                let slot = (half + (z - 1) * (peplen - 1) + (k - 1)) as u32;
                (slot, scale_mz(mz, scale))
            })
            .collect::<Vec<_>>()
    });

    b_ions
        .chain(y_ions)
        .filter(move |&(_, bin)| bin >= 1 && bin <= max_bin)
}

/// Expand a base sequence into its PTM variants (base included).
///
/// Modified sites are shown lowercase in the display sequence. Peptides
/// with characters outside the residue alphabet produce no entries.
fn mod_variants(seq: &str, mods: &[PtmMod]) -> Vec<Entry> {
    let base: Option<Vec<f64>> = seq.chars().map(residue_mass).collect();
    let base = match base {
        Some(r) => r,
        None => return Vec::new(),
    };
    let mass: f64 = base.iter().sum::<f64>() + H2O;

    let mut variants = vec![Entry {
        residues: base,
        display: seq.to_string(),
        mass,
    }];

    for m in mods {
        let positions: Vec<usize> = seq
            .char_indices()
            .filter(|(_, c)| *c == m.aa)
            .map(|(i, _)| i)
            .collect();
        if positions.is_empty() {
            continue;
        }

        let mut grown = Vec::new();
        for variant in &variants {
            for k in 1..=m.max_sites.min(positions.len()) {
                choose(&positions, k, 0, &mut Vec::new(), &mut |sites| {
                    if variants.len() + grown.len() >= MAX_VARIANTS {
                        return;
                    }
                    let mut v = variant.clone();
                    let mut display: Vec<char> = v.display.chars().collect();
                    for &site in sites {
                        v.residues[site] += m.mass;
                        v.mass += m.mass;
                        display[site] = display[site].to_ascii_lowercase();
                    }
                    v.display = display.into_iter().collect();
                    grown.push(v);
                });
            }
        }
        variants.extend(grown);
        if variants.len() >= MAX_VARIANTS {
            variants.truncate(MAX_VARIANTS);
            break;
        }
    }

    variants
}

fn choose(
    positions: &[usize],
    k: usize,
    start: usize,
    current: &mut Vec<usize>,
    emit: &mut impl FnMut(&[usize]),
) {
    if current.len() == k {
        emit(current);
        return;
    }
    for i in start..positions.len() {
        current.push(positions[i]);
        choose(positions, k, i + 1, current, emit);
        current.pop();
    }
}

/// Parse a peptide list file: one sequence per line, `#` comments and
/// non-residue lines skipped.
pub fn parse_peptide_list(path: &Path) -> Result<Vec<String>> {
    let reader = open_reader(path)
        .with_context(|| format!("Failed to open peptide list {}", path.display()))?;
    parse_peptide_reader(reader)
}

fn parse_peptide_reader<R: BufRead>(reader: R) -> Result<Vec<String>> {
    let mut sequences = Vec::new();
    for line_result in reader.lines() {
        let line = line_result.context("Failed to read peptide list line")?;
        let seq = line.trim();
        if seq.is_empty() || seq.starts_with('#') {
            continue;
        }
        let seq = seq.to_ascii_uppercase();
        if seq.chars().all(|c| residue_mass(c).is_some()) {
            sequences.push(seq);
        }
    }
    Ok(sequences)
}

// ------------------------------------------------------------------
// Cache
// ------------------------------------------------------------------

fn fingerprint(config: &SearchConfig) -> Vec<u8> {
    let mut fp = Vec::new();
    fp.extend_from_slice(&config.scale.to_le_bytes());
    fp.extend_from_slice(&(config.maxz as u32).to_le_bytes());
    fp.extend_from_slice(&(config.min_len as u32).to_le_bytes());
    fp.extend_from_slice(&(config.max_len as u32).to_le_bytes());
    fp.extend_from_slice(&config.max_scaled_mz().to_le_bytes());
    fp.extend_from_slice(&(config.rank as u32).to_le_bytes());
    fp.extend_from_slice(&(config.shards as u32).to_le_bytes());
    fp.push(config.policy.as_str().as_bytes()[0]);
    fp.extend_from_slice(&(config.mods.len() as u32).to_le_bytes());
    for m in &config.mods {
        fp.push(m.aa as u8);
        fp.extend_from_slice(&m.mass.to_le_bytes());
        fp.extend_from_slice(&(m.max_sites as u32).to_le_bytes());
    }
    fp
}

fn write_cache(path: &Path, index: &FragmentIndex, config: &SearchConfig) -> Result<()> {
    let file = File::create(path)?;
    let mut w = BufWriter::new(file);

    w.write_all(CACHE_MAGIC)?;
    let fp = fingerprint(config);
    w.write_all(&(fp.len() as u32).to_le_bytes())?;
    w.write_all(&fp)?;

    w.write_all(&index.scale.to_le_bytes())?;
    w.write_all(&(index.maxz as u32).to_le_bytes())?;
    w.write_all(&index.max_bin.to_le_bytes())?;
    w.write_all(&(index.chunks.len() as u32).to_le_bytes())?;
    for chunk in &index.chunks {
        w.write_all(&(chunk.peplen as u32).to_le_bytes())?;
        w.write_all(&(chunk.block_size as u64).to_le_bytes())?;
        w.write_all(&(chunk.len() as u64).to_le_bytes())?;
        for mass in &chunk.masses {
            w.write_all(&mass.to_le_bytes())?;
        }
        for seq in &chunk.sequences {
            w.write_all(&(seq.len() as u16).to_le_bytes())?;
            w.write_all(seq.as_bytes())?;
        }
        w.write_all(&(chunk.blocks.len() as u32).to_le_bytes())?;
        for block in &chunk.blocks {
            w.write_all(&(block.bin_offsets.len() as u64).to_le_bytes())?;
            for off in &block.bin_offsets {
                w.write_all(&off.to_le_bytes())?;
            }
            w.write_all(&(block.ions.len() as u64).to_le_bytes())?;
            for ion in &block.ions {
                w.write_all(&ion.to_le_bytes())?;
            }
        }
    }
    Ok(())
}

/// Read the cache if it exists and matches this configuration.
fn try_read_cache(path: &Path, config: &SearchConfig) -> Result<Option<FragmentIndex>> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(_) => return Ok(None),
    };
    let mut r = BufReader::new(file);

    let mut magic = [0u8; 8];
    if r.read_exact(&mut magic).is_err() || &magic != CACHE_MAGIC {
        return Ok(None);
    }
    let fp_len = read_u32(&mut r)? as usize;
    let mut fp = vec![0u8; fp_len];
    r.read_exact(&mut fp)?;
    if fp != fingerprint(config) {
        debug!("index cache fingerprint mismatch, rebuilding");
        return Ok(None);
    }

    let scale = read_u32(&mut r)?;
    let maxz = read_u32(&mut r)? as usize;
    let max_bin = read_u32(&mut r)?;
    let n_chunks = read_u32(&mut r)? as usize;
    let mut chunks = Vec::with_capacity(n_chunks);
    for _ in 0..n_chunks {
        let peplen = read_u32(&mut r)? as usize;
        let block_size = read_u64(&mut r)? as usize;
        let n_entries = read_u64(&mut r)? as usize;
        let mut masses = Vec::with_capacity(n_entries);
        for _ in 0..n_entries {
            masses.push(read_f64(&mut r)?);
        }
        let mut sequences = Vec::with_capacity(n_entries);
        for _ in 0..n_entries {
            let len = read_u16(&mut r)? as usize;
            let mut raw = vec![0u8; len];
            r.read_exact(&mut raw)?;
            sequences.push(String::from_utf8(raw).context("Corrupt sequence in index cache")?);
        }
        let n_blocks = read_u32(&mut r)? as usize;
        let mut blocks = Vec::with_capacity(n_blocks);
        for _ in 0..n_blocks {
            let n_offsets = read_u64(&mut r)? as usize;
            let mut bin_offsets = Vec::with_capacity(n_offsets);
            for _ in 0..n_offsets {
                bin_offsets.push(read_u32(&mut r)?);
            }
            let n_ions = read_u64(&mut r)? as usize;
            let mut ions = Vec::with_capacity(n_ions);
            for _ in 0..n_ions {
                ions.push(read_u32(&mut r)?);
            }
            blocks.push(IonBlock { bin_offsets, ions });
        }
        chunks.push(LengthChunk {
            peplen,
            speclen: (peplen - 1) * maxz * crate::types::ION_SERIES,
            masses,
            sequences,
            block_size,
            blocks,
        });
    }

    Ok(Some(FragmentIndex {
        chunks,
        scale,
        maxz,
        max_bin,
    }))
}

fn read_u16<R: Read>(r: &mut R) -> Result<u16> {
    let mut raw = [0u8; 2];
    r.read_exact(&mut raw)?;
    Ok(u16::from_le_bytes(raw))
}

fn read_u32<R: Read>(r: &mut R) -> Result<u32> {
    let mut raw = [0u8; 4];
    r.read_exact(&mut raw)?;
    Ok(u32::from_le_bytes(raw))
}

fn read_u64<R: Read>(r: &mut R) -> Result<u64> {
    let mut raw = [0u8; 8];
    r.read_exact(&mut raw)?;
    Ok(u64::from_le_bytes(raw))
}

fn read_f64<R: Read>(r: &mut R) -> Result<f64> {
    let mut raw = [0u8; 8];
    r.read_exact(&mut raw)?;
    Ok(f64::from_le_bytes(raw))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn test_config() -> SearchConfig {
        let mut config = SearchConfig::default();
        config.max_mass = 2000.0;
        config.clamp();
        config
    }

    #[test]
    fn test_parse_peptide_list() {
        let data = "PEPTIDE\n# comment\n\nseqwithx9\nACDEFGHIK\n";
        let seqs = parse_peptide_reader(Cursor::new(data)).unwrap();
        assert_eq!(seqs, vec!["PEPTIDE".to_string(), "ACDEFGHIK".to_string()]);
    }

    #[test]
    fn test_mod_variants_unmodified_only() {
        let variants = mod_variants("PEPTIDE", &[]);
        assert_eq!(variants.len(), 1);
        assert_eq!(variants[0].display, "PEPTIDE");
        assert!((variants[0].mass - crate::mass::peptide_mass("PEPTIDE")).abs() < 1e-9);
    }

    #[test]
    fn test_mod_variants_single_site() {
        let mods = [PtmMod {
            aa: 'M',
            mass: 15.99,
            max_sites: 1,
        }];
        let variants = mod_variants("AMSMK", &mods);
        // base + one variant per M site
        assert_eq!(variants.len(), 3);
        assert_eq!(variants[1].display, "AmSMK");
        assert_eq!(variants[2].display, "AMSmK");
        assert!((variants[1].mass - variants[0].mass - 15.99).abs() < 1e-9);
    }

    #[test]
    fn test_mod_variants_two_sites() {
        let mods = [PtmMod {
            aa: 'S',
            mass: 79.97,
            max_sites: 2,
        }];
        let variants = mod_variants("SAS", &mods);
        // base, two single-site, one double-site
        assert_eq!(variants.len(), 4);
        let doubly = variants.iter().find(|v| v.display == "sAs").unwrap();
        assert!((doubly.mass - variants[0].mass - 2.0 * 79.97).abs() < 1e-6);
    }

    #[test]
    fn test_shard_owns_cyclic_and_chunk() {
        let owners: Vec<usize> = (0..6)
            .map(|i| (0..3).find(|&r| shard_owns(i, 6, r, 3, ShardPolicy::Cyclic)).unwrap())
            .collect();
        assert_eq!(owners, vec![0, 1, 2, 0, 1, 2]);

        let owners: Vec<usize> = (0..6)
            .map(|i| (0..3).find(|&r| shard_owns(i, 6, r, 3, ShardPolicy::Chunk)).unwrap())
            .collect();
        assert_eq!(owners, vec![0, 0, 1, 1, 2, 2]);
    }

    #[test]
    fn test_shard_owns_zigzag_reverses_each_pass() {
        let owners: Vec<usize> = (0..6)
            .map(|i| (0..3).find(|&r| shard_owns(i, 6, r, 3, ShardPolicy::Zigzag)).unwrap())
            .collect();
        assert_eq!(owners, vec![0, 1, 2, 2, 1, 0]);
    }

    #[test]
    fn test_ion_bins_slots_ascend_and_count() {
        let config = test_config();
        let residues: Vec<f64> = "PEPTIDE".chars().map(|c| residue_mass(c).unwrap()).collect();
        let pairs: Vec<(u32, u32)> = ion_bins(&residues, &config, config.max_scaled_mz()).collect();

        // 6 fragment positions x 3 charges x 2 series, minus any outside
        // the bin range.
        assert!(pairs.len() <= 36);
        assert!(!pairs.is_empty());
        for w in pairs.windows(2) {
            assert!(w[0].0 < w[1].0, "slots must ascend");
        }
    }

    #[test]
    fn test_ion_bins_b1_value() {
        let config = test_config();
        let residues: Vec<f64> = "GAK".chars().map(|c| residue_mass(c).unwrap()).collect();
        let pairs: Vec<(u32, u32)> = ion_bins(&residues, &config, config.max_scaled_mz()).collect();
        // b1 at charge 1: G + PROTON
        let expected = scale_mz(residue_mass('G').unwrap() + PROTON, config.scale);
        assert_eq!(pairs[0], (0, expected));
    }

    #[test]
    fn test_build_and_query_window() {
        let config = test_config();
        let entries: Vec<Entry> = ["ACDEFK", "GHIKLM"]
            .iter()
            .map(|s| {
                let residues: Vec<f64> = s.chars().map(|c| residue_mass(c).unwrap()).collect();
                let mass = residues.iter().sum::<f64>() + H2O;
                Entry {
                    residues,
                    display: s.to_string(),
                    mass,
                }
            })
            .collect();
        let mut sorted: Vec<&Entry> = entries.iter().collect();
        sorted.sort_by(|a, b| a.mass.total_cmp(&b.mass));

        let chunk = build_chunk(6, &sorted, &config, config.max_scaled_mz());
        assert_eq!(chunk.len(), 2);
        assert_eq!(chunk.blocks.len(), 1);
        assert_eq!(
            chunk.blocks[0].bin_offsets.len(),
            config.max_scaled_mz() as usize + 2
        );

        let (min, max, found) = chunk.precursor_window(chunk.masses[0], 0.1);
        assert!(found);
        assert_eq!((min, max), (0, 0));
    }

    #[test]
    fn test_cache_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config();
        config.workspace = dir.path().to_path_buf();
        config.dbpath = dir.path().join("peps.txt");
        std::fs::write(&config.dbpath, "ACDEFK\nGHIKLM\nPEPTIDEK\n").unwrap();

        let built = build(&config).unwrap();
        let cache = cache_path(&config);
        write_cache(&cache, &built, &config).unwrap();

        let loaded = try_read_cache(&cache, &config).unwrap().unwrap();
        assert_eq!(loaded.total_peptides(), built.total_peptides());
        assert_eq!(loaded.chunks.len(), built.chunks.len());
        for (a, b) in loaded.chunks.iter().zip(built.chunks.iter()) {
            assert_eq!(a.masses, b.masses);
            assert_eq!(a.sequences, b.sequences);
            assert_eq!(a.blocks.len(), b.blocks.len());
            for (ba, bb) in a.blocks.iter().zip(b.blocks.iter()) {
                assert_eq!(ba.bin_offsets, bb.bin_offsets);
                assert_eq!(ba.ions, bb.ions);
            }
        }

        // A different fingerprint must miss.
        let mut other = config.clone();
        other.maxz = 2;
        other.clamp();
        assert!(try_read_cache(&cache, &other).unwrap().is_none());
    }
}
