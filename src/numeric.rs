use anyhow::Result;
use ndarray::{Array1, Array2, ArrayView1};
use ndarray_linalg::{Cholesky, Eigh, UPLO};
use statrs::distribution::{ContinuousCDF, Normal};

pub fn safe_div(num: f64, denom: f64) -> f64 {
    if denom == 0.0 {
        f64::NAN
    } else {
        num / denom
    }
}

pub fn norm2(v: &ArrayView1<f64>) -> f64 {
    v.dot(v).sqrt()
}

/// Log-determinant of a symmetric positive-definite matrix, NaN when the
/// Cholesky factorization fails.
pub fn logdet_spd(matrix: &Array2<f64>) -> f64 {
    match matrix.cholesky(UPLO::Lower) {
        Ok(l) => 2.0 * l.diag().iter().map(|v| v.ln()).sum::<f64>(),
        Err(_) => f64::NAN,
    }
}

pub fn inverse_from_eigh(
    eigvals: &Array1<f64>,
    eigvecs: &Array2<f64>,
    threshold: f64,
) -> Array2<f64> {
    let mut inv_vals = eigvals.to_vec();
    for v in &mut inv_vals {
        *v = if v.abs() <= threshold { 0.0 } else { 1.0 / *v };
    }
    let inv_diag = Array2::from_diag(&Array1::from_vec(inv_vals));
    eigvecs.dot(&inv_diag).dot(&eigvecs.t())
}

/// Eigendecomposition pseudo-inverse of a symmetric matrix. Eigenvalues below
/// `rel_threshold` times the largest magnitude are treated as zero.
pub fn pseudo_inverse(matrix: &Array2<f64>, rel_threshold: f64) -> Result<Array2<f64>> {
    let (eigvals, eigvecs) = matrix.eigh(UPLO::Lower)?;
    let max_abs = eigvals.iter().fold(0.0_f64, |acc, v| acc.max(v.abs()));
    Ok(inverse_from_eigh(&eigvals, &eigvecs, rel_threshold * max_abs))
}

/// Sample covariance of the rows of `rows` (observations in rows, variables
/// in columns), with the usual `B - 1` denominator. Fewer than two rows give
/// a zero matrix.
pub fn row_covariance(rows: &Array2<f64>) -> Array2<f64> {
    let (b, p) = rows.dim();
    let mut cov = Array2::<f64>::zeros((p, p));
    if b < 2 {
        return cov;
    }
    let mut means = Array1::<f64>::zeros(p);
    for row in rows.rows() {
        means = &means + &row;
    }
    means /= b as f64;
    for row in rows.rows() {
        let centered = &row - &means;
        for i in 0..p {
            for j in i..p {
                cov[(i, j)] += centered[i] * centered[j];
            }
        }
    }
    cov /= (b - 1) as f64;
    for i in 0..p {
        for j in (i + 1)..p {
            cov[(j, i)] = cov[(i, j)];
        }
    }
    cov
}

/// Two-tailed normal p-value for a z statistic.
pub fn two_tailed_p(z: f64) -> f64 {
    if z.is_nan() {
        return f64::NAN;
    }
    if z.is_infinite() {
        return 0.0;
    }
    match Normal::new(0.0, 1.0) {
        Ok(normal) => 2.0 * (1.0 - normal.cdf(z.abs())),
        Err(_) => f64::NAN,
    }
}

/// Delta-method variance of a scalar derived quantity: `jac' * cov * jac`.
pub fn quadratic_form(jac: &ArrayView1<f64>, cov: &Array2<f64>) -> f64 {
    jac.dot(&cov.dot(jac))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::array;

    #[test]
    fn pseudo_inverse_recovers_inverse() {
        let a = array![[4.0, 1.0], [1.0, 3.0]];
        let inv = pseudo_inverse(&a, 1e-12).expect("pinv");
        let prod = a.dot(&inv);
        assert_relative_eq!(prod[(0, 0)], 1.0, epsilon = 1e-10);
        assert_relative_eq!(prod[(1, 1)], 1.0, epsilon = 1e-10);
        assert_relative_eq!(prod[(0, 1)], 0.0, epsilon = 1e-10);
    }

    #[test]
    fn pseudo_inverse_drops_null_directions() {
        let a = array![[1.0, 0.0], [0.0, 0.0]];
        let inv = pseudo_inverse(&a, 1e-12).expect("pinv");
        assert_relative_eq!(inv[(0, 0)], 1.0, epsilon = 1e-10);
        assert_relative_eq!(inv[(1, 1)], 0.0, epsilon = 1e-10);
    }

    #[test]
    fn logdet_matches_known_value() {
        let a = array![[2.0, 0.0], [0.0, 8.0]];
        assert_relative_eq!(logdet_spd(&a), (16.0_f64).ln(), epsilon = 1e-10);
    }

    #[test]
    fn row_covariance_simple() {
        let rows = array![[1.0, 2.0], [3.0, 6.0], [5.0, 10.0]];
        let cov = row_covariance(&rows);
        assert_relative_eq!(cov[(0, 0)], 4.0, epsilon = 1e-10);
        assert_relative_eq!(cov[(0, 1)], 8.0, epsilon = 1e-10);
        assert_relative_eq!(cov[(1, 1)], 16.0, epsilon = 1e-10);
    }

    #[test]
    fn two_tailed_p_at_zero_is_one() {
        assert_relative_eq!(two_tailed_p(0.0), 1.0, epsilon = 1e-10);
        assert!(two_tailed_p(5.0) < 1e-5);
    }
}
