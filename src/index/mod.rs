//! Fragment-ion inverted index.
//!
//! The index is an array of peptide-length chunks. Each chunk keeps its
//! peptide entries sorted by precursor mass and one or more ion blocks, a
//! compressed-sparse-row layout over scaled m/z bins: `bin_offsets[bin]`
//! and `bin_offsets[bin + 1]` delimit the bin's records inside the
//! flattened `ions` array.
//!
//! An ion record packs `entry * speclen + slot` into a u32, where `entry`
//! is the peptide's index within its length chunk and `slot` identifies the
//! fragment: b-ions occupy the lower `speclen / 2` slots, y-ions the upper
//! half, each half laid out charge-major.

pub mod builder;

/// Window size below which the range search finishes linearly.
const LINEAR_FINISH: usize = 20;

/// One theoretical fragment-ion record.
///
/// Thin accessor layer over the packed u32; records stay raw in memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeakRecord(pub u32);

impl PeakRecord {
    pub fn pack(entry: u32, slot: u32, speclen: u32) -> Self {
        PeakRecord(entry * speclen + slot)
    }

    /// Peptide entry index within the length chunk.
    pub fn entry(self, speclen: u32) -> u32 {
        self.0 / speclen
    }

    /// Ion slot within the peptide.
    pub fn slot(self, speclen: u32) -> u32 {
        self.0 % speclen
    }

    /// b-ions live in the lower half of the slot space.
    pub fn is_b(self, speclen: u32) -> bool {
        self.slot(speclen) < speclen / 2
    }

    /// Fragment charge encoded in the slot (1-based).
    pub fn charge(self, speclen: u32, peplen: u32) -> u32 {
        let half = speclen / 2;
        (self.slot(speclen) % half) / (peplen - 1) + 1
    }
}

/// A contiguous block of the chunk's inverted index.
#[derive(Debug, Default, Clone)]
pub struct IonBlock {
    /// Prefix sums over scaled m/z bins; `max_bin + 2` entries.
    pub bin_offsets: Vec<u32>,
    /// Flattened ion records, sorted ascending within each bin.
    pub ions: Vec<u32>,
}

impl IonBlock {
    /// Records of `bin` restricted to peptide entries `[wmin, wmax]`.
    ///
    /// Records within a bin are sorted by their packed value, so the entry
    /// window maps to a key range narrowed by partition point.
    pub fn bin_ions(&self, bin: usize, wmin: usize, wmax: usize, speclen: usize) -> &[u32] {
        let start = self.bin_offsets[bin] as usize;
        let end = self.bin_offsets[bin + 1] as usize;
        let recs = &self.ions[start..end];

        let lo_key = (wmin * speclen) as u32;
        let hi_key = ((wmax + 1) * speclen - 1) as u32;
        let lo = recs.partition_point(|&r| r < lo_key);
        let hi = recs.partition_point(|&r| r <= hi_key);
        &recs[lo..hi]
    }
}

/// All peptides of one length and their inverted fragment index.
#[derive(Debug, Default, Clone)]
pub struct LengthChunk {
    pub peplen: usize,
    /// Ion slots per peptide: `(peplen - 1) * maxz * 2`.
    pub speclen: usize,
    /// Precursor neutral masses, ascending.
    pub masses: Vec<f64>,
    /// Peptide sequences parallel to `masses` (modified sites lowercase).
    pub sequences: Vec<String>,
    /// Peptides per ion block (the last block may hold fewer).
    pub block_size: usize,
    pub blocks: Vec<IonBlock>,
}

impl LengthChunk {
    pub fn len(&self) -> usize {
        self.masses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.masses.is_empty()
    }

    /// Resolve the peptide-entry window for a precursor mass.
    ///
    /// Returns `(min, max, found)` such that when `found` every entry in
    /// `[min, max]` has mass within `pmass ± dm` and no entry outside does.
    /// A negative `dm` yields the full chunk, not-found. A query below the
    /// smallest entry yields `(0, 0, false)`; above the largest,
    /// `(last, last, false)`.
    pub fn precursor_window(&self, pmass: f64, dm: f64) -> (usize, usize, bool) {
        let n = self.masses.len();
        if n == 0 {
            return (0, 0, false);
        }
        if dm < 0.0 {
            return (0, n - 1, false);
        }

        let low = pmass - dm;
        let high = pmass + dm;
        if self.masses[n - 1] < low {
            return (n - 1, n - 1, false);
        }
        if self.masses[0] > high {
            return (0, 0, false);
        }

        let min = seek_lower(&self.masses, 0, n - 1, low);
        let max = seek_upper(&self.masses, 0, n - 1, high);
        let found = min <= max && self.masses[min] <= high && self.masses[max] >= low;
        (min, max, found)
    }
}

/// Leftmost index in `[lo, hi]` whose mass is >= `low`, walking left over
/// exact ties. Falls back to `hi` when every mass is below `low`.
fn seek_lower(masses: &[f64], lo: usize, hi: usize, low: f64) -> usize {
    if hi - lo < LINEAR_FINISH {
        for i in lo..=hi {
            if masses[i] >= low {
                return i;
            }
        }
        return hi;
    }

    let mid = lo + (hi - lo) / 2;
    if masses[mid] == low {
        let mut i = mid;
        while i > lo && masses[i - 1] == low {
            i -= 1;
        }
        i
    } else if masses[mid] < low {
        seek_lower(masses, mid + 1, hi, low)
    } else {
        seek_lower(masses, lo, mid, low)
    }
}

/// Rightmost index in `[lo, hi]` whose mass is <= `high`, walking right over
/// exact ties. Falls back to `lo` when every mass is above `high`.
fn seek_upper(masses: &[f64], lo: usize, hi: usize, high: f64) -> usize {
    if hi - lo < LINEAR_FINISH {
        for i in (lo..=hi).rev() {
            if masses[i] <= high {
                return i;
            }
        }
        return lo;
    }

    let mid = lo + (hi - lo + 1) / 2;
    if masses[mid] == high {
        let mut i = mid;
        while i < hi && masses[i + 1] == high {
            i += 1;
        }
        i
    } else if masses[mid] > high {
        seek_upper(masses, lo, mid - 1, high)
    } else {
        seek_upper(masses, mid, hi, high)
    }
}

/// The full fragment-ion index: one chunk per peptide length.
#[derive(Debug, Default)]
pub struct FragmentIndex {
    pub chunks: Vec<LengthChunk>,
    /// Integer m/z scale the bins were built with.
    pub scale: u32,
    pub maxz: usize,
    /// Highest scaled m/z bin.
    pub max_bin: u32,
}

impl FragmentIndex {
    /// Total peptides across all chunks.
    pub fn total_peptides(&self) -> usize {
        self.chunks.iter().map(|c| c.len()).sum()
    }

    /// Largest per-chunk peptide count, which sizes the scorecards.
    pub fn max_chunk_entries(&self) -> usize {
        self.chunks.iter().map(|c| c.len()).max().unwrap_or(0)
    }

    /// Peptide sequence for a scored candidate.
    pub fn sequence(&self, chunk: u16, entry: u32) -> &str {
        &self.chunks[chunk as usize].sequences[entry as usize]
    }
}
