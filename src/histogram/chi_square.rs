//! Chi-square goodness-of-fit test
//!
//! Only what the histogram needs: the Pearson statistic with expected
//! counts rescaled to the observed total, and its upper-tail probability
//! under the chi-square distribution.

use statrs::distribution::{ChiSquared, ContinuousCDF};

/// Pearson chi-square statistic of `observed` against `expected`.
///
/// When the totals differ, expected counts are scaled to the observed total.
/// Returns `None` if any expected count is non-positive or nothing was observed.
pub fn chi_square_statistic(expected: &[f64], observed: &[u64]) -> Option<f64> {
    if expected.len() != observed.len() || expected.len() < 2 {
        return None;
    }
    if expected.iter().any(|e| !e.is_finite() || *e <= 0.0) {
        return None;
    }

    let sum_expected: f64 = expected.iter().sum();
    let sum_observed: f64 = observed.iter().map(|o| *o as f64).sum();
    if sum_observed <= 0.0 {
        return None;
    }

    let ratio = if (sum_expected - sum_observed).abs() > 1e-5 {
        sum_observed / sum_expected
    } else {
        1.0
    };

    Some(
        expected
            .iter()
            .zip(observed)
            .map(|(e, o)| {
                let scaled = ratio * e;
                let dev = *o as f64 - scaled;
                dev * dev / scaled
            })
            .sum(),
    )
}

/// Upper-tail probability of a chi-square statistic with `degrees_of_freedom`
pub fn chi_square_p_value(statistic: f64, degrees_of_freedom: usize) -> f64 {
    if statistic <= 0.0 || degrees_of_freedom == 0 {
        return 1.0;
    }
    match ChiSquared::new(degrees_of_freedom as f64) {
        Ok(distribution) => distribution.sf(statistic),
        Err(_) => 1.0,
    }
}

/// True if the hypothesis "observed matches expected" is rejected at `alpha`
pub fn chi_square_test(expected: &[f64], observed: &[u64], alpha: f64) -> bool {
    match chi_square_statistic(expected, observed) {
        Some(statistic) => chi_square_p_value(statistic, expected.len() - 1) < alpha,
        None => false,
    }
}
