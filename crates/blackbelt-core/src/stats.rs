//! Numeric helpers shared by the statistical tools.
//!
//! Everything here operates on plain `&[f64]` slices and is deterministic.
//! The Shapiro–Wilk test follows Royston's AS R94 approximation, valid for
//! sample sizes 3..=5000.

/// Arithmetic mean. Zero for an empty slice.
pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Sample standard deviation (divisor `n - 1`). Zero when `n < 2`.
pub fn sample_std(values: &[f64]) -> f64 {
    let n = values.len();
    if n < 2 {
        return 0.0;
    }
    let m = mean(values);
    let ss = values.iter().map(|v| (v - m) * (v - m)).sum::<f64>();
    (ss / (n - 1) as f64).sqrt()
}

/// Absolute differences between adjacent samples.
pub fn moving_ranges(values: &[f64]) -> Vec<f64> {
    values.windows(2).map(|w| (w[1] - w[0]).abs()).collect()
}

/// Quantile with linear interpolation between order statistics. `p` in
/// `[0, 1]`.
pub fn quantile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    if sorted.len() == 1 {
        return sorted[0];
    }
    let pos = p.clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let lower = pos.floor() as usize;
    let upper = pos.ceil() as usize;
    if lower == upper {
        return sorted[lower];
    }
    let frac = pos - lower as f64;
    sorted[lower] + (sorted[upper] - sorted[lower]) * frac
}

/// Median of an unsorted slice.
pub fn median(values: &[f64]) -> f64 {
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).expect("finite values"));
    quantile(&sorted, 0.5)
}

/// Population skewness (third standardised central moment).
pub fn skewness(values: &[f64]) -> f64 {
    let n = values.len() as f64;
    if n < 2.0 {
        return 0.0;
    }
    let m = mean(values);
    let m2 = values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / n;
    if m2 <= f64::EPSILON {
        return 0.0;
    }
    let m3 = values.iter().map(|v| (v - m).powi(3)).sum::<f64>() / n;
    m3 / m2.powf(1.5)
}

/// Excess kurtosis (fourth standardised central moment minus 3).
pub fn kurtosis(values: &[f64]) -> f64 {
    let n = values.len() as f64;
    if n < 2.0 {
        return 0.0;
    }
    let m = mean(values);
    let m2 = values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / n;
    if m2 <= f64::EPSILON {
        return 0.0;
    }
    let m4 = values.iter().map(|v| (v - m).powi(4)).sum::<f64>() / n;
    m4 / (m2 * m2) - 3.0
}

/// Standard normal CDF via the Abramowitz–Stegun erf approximation.
pub fn normal_cdf(z: f64) -> f64 {
    0.5 * erfc(-z / std::f64::consts::SQRT_2)
}

fn erfc(x: f64) -> f64 {
    // A&S 7.1.26, |error| <= 1.5e-7, extended to the full line by symmetry.
    let sign_negative = x < 0.0;
    let x = x.abs();
    let t = 1.0 / (1.0 + 0.3275911 * x);
    let poly = t
        * (0.254829592
            + t * (-0.284496736 + t * (1.421413741 + t * (-1.453152027 + t * 1.061405429))));
    let erf = 1.0 - poly * (-x * x).exp();
    if sign_negative {
        1.0 + erf
    } else {
        1.0 - erf
    }
}

/// Standard normal quantile (Acklam's rational approximation).
pub fn normal_quantile(p: f64) -> f64 {
    debug_assert!(p > 0.0 && p < 1.0);
    const A: [f64; 6] = [
        -3.969683028665376e+01,
        2.209460984245205e+02,
        -2.759285104469687e+02,
        1.383577518672690e+02,
        -3.066479806614716e+01,
        2.506628277459239e+00,
    ];
    const B: [f64; 5] = [
        -5.447609879822406e+01,
        1.615858368580409e+02,
        -1.556989798598866e+02,
        6.680131188771972e+01,
        -1.328068155288572e+01,
    ];
    const C: [f64; 6] = [
        -7.784894002430293e-03,
        -3.223964580411365e-01,
        -2.400758277161838e+00,
        -2.549732539343734e+00,
        4.374664141464968e+00,
        2.938163982698783e+00,
    ];
    const D: [f64; 4] = [
        7.784695709041462e-03,
        3.224671290700398e-01,
        2.445134137142996e+00,
        3.754408661907416e+00,
    ];
    const P_LOW: f64 = 0.02425;

    if p < P_LOW {
        let q = (-2.0 * p.ln()).sqrt();
        (((((C[0] * q + C[1]) * q + C[2]) * q + C[3]) * q + C[4]) * q + C[5])
            / ((((D[0] * q + D[1]) * q + D[2]) * q + D[3]) * q + 1.0)
    } else if p <= 1.0 - P_LOW {
        let q = p - 0.5;
        let r = q * q;
        (((((A[0] * r + A[1]) * r + A[2]) * r + A[3]) * r + A[4]) * r + A[5]) * q
            / (((((B[0] * r + B[1]) * r + B[2]) * r + B[3]) * r + B[4]) * r + 1.0)
    } else {
        let q = (-2.0 * (1.0 - p).ln()).sqrt();
        -(((((C[0] * q + C[1]) * q + C[2]) * q + C[3]) * q + C[4]) * q + C[5])
            / ((((D[0] * q + D[1]) * q + D[2]) * q + D[3]) * q + 1.0)
    }
}

/// Shapiro–Wilk normality test p-value (AS R94 approximation).
///
/// Returns `None` outside the supported range `3..=5000` or when the
/// sample is degenerate (zero variance).
pub fn shapiro_wilk_p(values: &[f64]) -> Option<f64> {
    let n = values.len();
    if !(3..=5000).contains(&n) {
        return None;
    }
    let mut x = values.to_vec();
    x.sort_by(|a, b| a.partial_cmp(b).expect("finite values"));

    let m = mean(&x);
    let ss = x.iter().map(|v| (v - m) * (v - m)).sum::<f64>();
    if ss <= f64::EPSILON {
        return None;
    }

    // Expected normal order statistics (Blom scores).
    let nf = n as f64;
    let mut mm = Vec::with_capacity(n);
    for i in 1..=n {
        mm.push(normal_quantile((i as f64 - 0.375) / (nf + 0.25)));
    }
    let m_sum_sq = mm.iter().map(|v| v * v).sum::<f64>();

    // Weight vector a.
    let mut a = vec![0.0; n];
    if n == 3 {
        a[0] = -std::f64::consts::FRAC_1_SQRT_2;
        a[2] = std::f64::consts::FRAC_1_SQRT_2;
    } else {
        let rsn = 1.0 / nf.sqrt();
        let c_n = mm[n - 1] / m_sum_sq.sqrt();
        let a_n = c_n + 0.221157 * rsn - 0.147981 * rsn.powi(2) - 2.071190 * rsn.powi(3)
            + 4.434685 * rsn.powi(4)
            - 2.706056 * rsn.powi(5);
        if n <= 5 {
            let phi = (m_sum_sq - 2.0 * mm[n - 1] * mm[n - 1]) / (1.0 - 2.0 * a_n * a_n);
            a[n - 1] = a_n;
            a[0] = -a_n;
            for i in 1..n - 1 {
                a[i] = mm[i] / phi.sqrt();
            }
        } else {
            let c_n1 = mm[n - 2] / m_sum_sq.sqrt();
            let a_n1 = c_n1 + 0.042981 * rsn - 0.293762 * rsn.powi(2) - 1.752461 * rsn.powi(3)
                + 5.682633 * rsn.powi(4)
                - 3.582633 * rsn.powi(5);
            let phi = (m_sum_sq
                - 2.0 * mm[n - 1] * mm[n - 1]
                - 2.0 * mm[n - 2] * mm[n - 2])
                / (1.0 - 2.0 * a_n * a_n - 2.0 * a_n1 * a_n1);
            a[n - 1] = a_n;
            a[n - 2] = a_n1;
            a[0] = -a_n;
            a[1] = -a_n1;
            for i in 2..n - 2 {
                a[i] = mm[i] / phi.sqrt();
            }
        }
    }

    let b = a.iter().zip(x.iter()).map(|(ai, xi)| ai * xi).sum::<f64>();
    let w = (b * b / ss).clamp(0.0, 1.0);

    // Significance level of W.
    if n == 3 {
        let p = 6.0 / std::f64::consts::PI
            * (w.sqrt().asin() - (0.75_f64).sqrt().asin());
        return Some(p.clamp(0.0, 1.0));
    }
    let ln1w = (1.0 - w).max(1e-12).ln();
    let z = if n <= 11 {
        let gamma = -2.273 + 0.459 * nf;
        let arg = gamma - ln1w;
        if arg <= 0.0 {
            // W below the supported range for small samples: decisively
            // non-normal.
            return Some(0.0);
        }
        let wt = -arg.ln();
        let mu = 0.5440 - 0.39978 * nf + 0.025054 * nf * nf - 0.0006714 * nf.powi(3);
        let sigma =
            (1.3822 - 0.77857 * nf + 0.062767 * nf * nf - 0.0020322 * nf.powi(3)).exp();
        (wt - mu) / sigma
    } else {
        let u = nf.ln();
        let mu = -1.5861 - 0.31082 * u - 0.083751 * u * u + 0.0038915 * u.powi(3);
        let sigma = (-0.4803 - 0.082676 * u + 0.0030302 * u * u).exp();
        (ln1w - mu) / sigma
    };
    Some((1.0 - normal_cdf(z)).clamp(0.0, 1.0))
}
