//! Monoisotopic masses and m/z scaling.

pub const H2O: f64 = 18.010565;
pub const PROTON: f64 = 1.00727646;

/// Amino acids accepted in peptide list files.
pub const VALID_AA: [char; 20] = [
    'A', 'C', 'D', 'E', 'F', 'G', 'H', 'I', 'K', 'L', 'M', 'N', 'P', 'Q', 'R', 'S', 'T', 'V', 'W',
    'Y',
];

/// Monoisotopic residue mass, or `None` for characters that are not one of
/// the 20 standard amino acids.
pub fn residue_mass(aa: char) -> Option<f64> {
    let m = match aa {
        'A' => 71.03711,
        'R' => 156.10111,
        'N' => 114.04293,
        'D' => 115.02694,
        'C' => 103.009186,
        'E' => 129.04259,
        'Q' => 128.05858,
        'G' => 57.021465,
        'H' => 137.05891,
        'I' => 113.08406,
        'L' => 113.08406,
        'K' => 128.09496,
        'M' => 131.04048,
        'F' => 147.06842,
        'P' => 97.052765,
        'S' => 87.03203,
        'T' => 101.047676,
        'W' => 186.07932,
        'Y' => 163.06332,
        'V' => 99.06841,
        _ => return None,
    };
    Some(m)
}

/// Neutral monoisotopic mass of a peptide sequence, ignoring characters that
/// are not standard residues.
pub fn peptide_mass(sequence: &str) -> f64 {
    sequence.chars().filter_map(residue_mass).sum::<f64>() + H2O
}

/// Integer m/z scale for a bin width in Da: `scale = round(1 / res)`.
pub fn mz_scale(res: f64) -> u32 {
    (1.0 / res).round().max(1.0) as u32
}

/// Scale an m/z value into its integer bin.
pub fn scale_mz(mz: f64, scale: u32) -> u32 {
    (mz * scale as f64).round() as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn smoke() {
        for ch in VALID_AA {
            assert!(residue_mass(ch).unwrap() > 0.0);
        }
        assert!(residue_mass('B').is_none());
        assert!(residue_mass('X').is_none());
    }

    #[test]
    fn test_peptide_mass() {
        // G + G + H2O
        let m = peptide_mass("GG");
        assert!((m - (2.0 * 57.021465 + H2O)).abs() < 1e-9);
    }

    #[test]
    fn test_mz_scale() {
        assert_eq!(mz_scale(0.01), 100);
        assert_eq!(mz_scale(0.02), 50);
        assert_eq!(mz_scale(1.0), 1);
        assert_eq!(mz_scale(5.0), 1); // never below 1
    }

    #[test]
    fn test_scale_mz() {
        assert_eq!(scale_mz(500.015, 100), 50002);
        assert_eq!(scale_mz(500.0, 1), 500);
    }
}
