//! Expect-value estimation from the per-spectrum survival histogram.
//!
//! The default estimator fits a straight line to the left tail of the
//! log-survival function of hyperscores: cumulative counts become a
//! complementary distribution, the 22%/87% height markers bracket the
//! linear plateau, and an ordinary-least-squares fit extrapolates the
//! log-survival at the top hit's bucket. The e-value is
//! `n * 10^(slope * hyp + intercept)`. A Gumbel moment fit is available as
//! the alternate estimator.

use crate::types::{score_bucket, MAX_HYPERSCORE};

/// Smallest survival probability kept before the log transform.
const SURVIVAL_FLOOR: f64 = 1e-4;

/// Expect value of the top hit via the log-survival linear tail fit.
///
/// `survival` buckets hyperscore * 10 counts, `cpsms` is the candidate
/// count behind it, `top` the best hyperscore. Spectra with fewer than
/// `min_cpsm` candidates return the [`MAX_HYPERSCORE`] ceiling sentinel.
pub fn log_linear(survival: &[u32], cpsms: u32, top: f64, min_cpsm: usize) -> f64 {
    if (cpsms as usize) < min_cpsm {
        return MAX_HYPERSCORE;
    }

    let n = cpsms as f64;
    let hyp = score_bucket(top);

    // Populated window strictly below the top bucket.
    let mut end = 0usize;
    for i in (0..hyp).rev() {
        if survival[i] >= 1 {
            end = i;
            break;
        }
    }
    let mut stt = end;
    for (i, &count) in survival.iter().enumerate().take(end + 1) {
        if count >= 1 {
            stt = i;
            break;
        }
    }
    if stt == end {
        // Degenerate window: widen by one bucket so the fit has two points.
        end = (end + 1).min(survival.len() - 1);
    }
    let len = end - stt + 1;

    // Complementary cumulative distribution, clamped and floored.
    let mut sx = Vec::with_capacity(len);
    let mut cum = 0.0f64;
    for &count in &survival[stt..=end] {
        cum += count as f64;
        let mut s = 1.0 - cum / n;
        if s > 1.0 {
            s = 0.999;
        }
        sx.push(s);
    }
    let replacement = sx
        .iter()
        .rev()
        .find(|&&s| s >= SURVIVAL_FLOOR)
        .copied()
        .unwrap_or(SURVIVAL_FLOOR);
    for s in &mut sx {
        if *s <= 0.0 {
            *s = replacement;
        }
        *s = s.log10();
    }

    let (mark, mark2) = plateau_markers(&sx);

    let xs: Vec<f64> = (mark..=mark2).map(|j| (stt + j) as f64).collect();
    let ys = &sx[mark..=mark2];
    let (slope, intercept) = ols(&xs, ys);

    let lgs = slope * hyp as f64 + intercept;
    n * 10f64.powf(lgs)
}

/// Marker pair bracketing the 22%-87% drop of the log-survival curve.
///
/// The series is non-increasing; `mark` is the last point still above the
/// 22%-height threshold, `mark2` the last still above the 87% one.
fn plateau_markers(sx: &[f64]) -> (usize, usize) {
    let len = sx.len();
    if len < 3 {
        return (0, len - 1);
    }

    let hgt = sx[len - 1] - sx[0];
    let t1 = sx[0] + 0.22 * hgt;
    let t2 = sx[0] + 0.87 * hgt;

    let mut mark = 0;
    let mut mark2 = 0;
    for (j, &s) in sx.iter().enumerate() {
        if s >= t1 {
            mark = j;
        }
        if s >= t2 {
            mark2 = j;
        }
    }
    mark2 = mark2.min(len - 1);
    if len == 3 {
        mark2 = len - 1;
    }
    if mark >= mark2 {
        mark = mark2.saturating_sub(1);
    }
    (mark, mark2)
}

/// Ordinary least squares; a single point fixes slope 0 at its value.
fn ols(xs: &[f64], ys: &[f64]) -> (f64, f64) {
    if xs.len() <= 1 {
        return (0.0, ys.first().copied().unwrap_or(0.0));
    }

    let n = xs.len() as f64;
    let xm = xs.iter().sum::<f64>() / n;
    let ym = ys.iter().sum::<f64>() / n;
    let mut sxy = 0.0;
    let mut sxx = 0.0;
    for (x, y) in xs.iter().zip(ys.iter()) {
        sxy += (x - xm) * (y - ym);
        sxx += (x - xm) * (x - xm);
    }
    if sxx == 0.0 {
        return (0.0, ym);
    }
    let slope = sxy / sxx;
    (slope, ym - slope * xm)
}

/// Euler-Mascheroni constant for the Gumbel moment fit.
const EULER_GAMMA: f64 = 0.577_215_664_901_532_9;

/// Alternate estimator: fit a Gumbel distribution to the score histogram
/// by the method of moments and take the upper-tail probability at the top
/// hit.
pub fn gumbel(survival: &[u32], cpsms: u32, top: f64, min_cpsm: usize) -> f64 {
    if (cpsms as usize) < min_cpsm {
        return MAX_HYPERSCORE;
    }

    let n = cpsms as f64;
    let mut mean = 0.0;
    for (i, &count) in survival.iter().enumerate() {
        mean += (i as f64 / 10.0) * count as f64;
    }
    mean /= n;
    let mut var = 0.0;
    for (i, &count) in survival.iter().enumerate() {
        let d = i as f64 / 10.0 - mean;
        var += d * d * count as f64;
    }
    var /= n;

    let beta = (6.0 * var).sqrt() / std::f64::consts::PI;
    if beta <= f64::EPSILON {
        return if top > mean { 0.0 } else { n };
    }
    let mu = mean - EULER_GAMMA * beta;

    let z = (top - mu) / beta;
    let p_exceed = 1.0 - (-(-z).exp()).exp();
    n * p_exceed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::HISTOGRAM_SIZE;

    fn histogram(pairs: &[(usize, u32)]) -> Vec<u32> {
        let mut h = vec![0u32; HISTOGRAM_SIZE];
        for &(i, c) in pairs {
            h[i] = c;
        }
        h
    }

    #[test]
    fn test_too_few_candidates_returns_ceiling() {
        let h = histogram(&[(5, 1), (10, 1)]);
        assert_eq!(log_linear(&h, 2, 1.0, 4), MAX_HYPERSCORE);
        assert_eq!(gumbel(&h, 2, 1.0, 4), MAX_HYPERSCORE);
    }

    #[test]
    fn test_reference_histogram_evalue() {
        // survival = [0,0,1,2,3,0,1, 0..., 1 at bucket 10], n = 8, top = 1.0.
        let h = histogram(&[(2, 1), (3, 2), (4, 3), (6, 1), (10, 1)]);
        let e = log_linear(&h, 8, 1.0, 4);
        // Window [2,6]; sx = [.875,.625,.25,.25,.125]; markers bracket
        // buckets 3..5; OLS gives slope -0.19897, intercept 0.32647.
        assert!(e.is_finite());
        assert!((e - 0.17373).abs() < 1e-3, "e = {}", e);
    }

    #[test]
    fn test_steeper_tail_gives_smaller_evalue() {
        // Survival halves per bucket (slope -log10 2) versus thirds per
        // bucket (slope -log10 3); extrapolated to the same top bucket the
        // faster decay must predict the rarer hit.
        let halving = histogram(&[(2, 16), (3, 8), (4, 4), (5, 2), (6, 1), (30, 1)]);
        let thirding = histogram(&[(2, 162), (3, 54), (4, 18), (5, 6), (6, 2), (30, 1)]);
        let e_halving = log_linear(&halving, 32, 3.0, 4);
        let e_thirding = log_linear(&thirding, 243, 3.0, 4);
        assert!(e_thirding < e_halving);
        assert!(e_halving > 0.0);
    }

    #[test]
    fn test_degenerate_window_widens() {
        // Only one populated bucket below the top.
        let h = histogram(&[(0, 3), (1, 1)]);
        let e = log_linear(&h, 4, 0.1, 4);
        // sx over [0,1] = [0.25, 0]; the zero is floored to 0.25, so the
        // fit is flat: e = 4 * 0.25.
        assert!((e - 1.0).abs() < 1e-9, "e = {}", e);
    }

    #[test]
    fn test_all_mass_in_top_bucket() {
        let mut h = vec![0u32; HISTOGRAM_SIZE];
        h[HISTOGRAM_SIZE - 1] = 5;
        let e = log_linear(&h, 5, MAX_HYPERSCORE, 4);
        assert!(e.is_finite());
        assert!(e >= 0.0);
    }

    #[test]
    fn test_ols_single_point() {
        let (slope, intercept) = ols(&[3.0], &[-0.5]);
        assert_eq!(slope, 0.0);
        assert_eq!(intercept, -0.5);
    }

    #[test]
    fn test_ols_exact_line() {
        let xs = [1.0, 2.0, 3.0, 4.0];
        let ys = [-0.1, -0.3, -0.5, -0.7];
        let (slope, intercept) = ols(&xs, &ys);
        assert!((slope + 0.2).abs() < 1e-12);
        assert!((intercept - 0.1).abs() < 1e-12);
    }

    #[test]
    fn test_plateau_markers_descending() {
        // log-survival-like descending series
        let sx = [-0.05, -0.20, -0.60, -0.60, -0.90];
        let (mark, mark2) = plateau_markers(&sx);
        assert_eq!((mark, mark2), (1, 3));
    }

    #[test]
    fn test_plateau_markers_short_series() {
        assert_eq!(plateau_markers(&[-0.1, -0.2]), (0, 1));
        assert_eq!(plateau_markers(&[-0.1, -0.2, -0.3]), (0, 2));
    }

    #[test]
    fn test_gumbel_monotone_in_top_score() {
        let h = histogram(&[(10, 3), (12, 3), (14, 2), (20, 1)]);
        let e_low = gumbel(&h, 9, 2.0, 4);
        let e_high = gumbel(&h, 9, 5.0, 4);
        assert!(e_high < e_low);
        assert!(e_high >= 0.0);
    }
}
