use ndarray::{Array1, Array2, ArrayView1, ArrayView2};

/// Link between annotation effects and per-variant heritability.
///
/// `value` must be non-negative and differentiable; `inverse` is used to seed
/// coefficients from target heritability levels.
pub trait LinkFn: Send + Sync {
    fn value(&self, x: f64) -> f64;
    fn deriv(&self, x: f64) -> f64;
    fn deriv2(&self, x: f64) -> f64;
    fn inverse(&self, y: f64) -> f64;
}

/// `g(x) = ln(1 + e^x)`, the default link.
#[derive(Debug, Clone, Copy)]
pub struct Softplus;

impl LinkFn for Softplus {
    fn value(&self, x: f64) -> f64 {
        if x > 30.0 {
            x
        } else {
            x.exp().ln_1p()
        }
    }

    fn deriv(&self, x: f64) -> f64 {
        1.0 / (1.0 + (-x).exp())
    }

    fn deriv2(&self, x: f64) -> f64 {
        let s = self.deriv(x);
        s * (1.0 - s)
    }

    fn inverse(&self, y: f64) -> f64 {
        if y > 30.0 {
            y
        } else {
            y.max(f64::MIN_POSITIVE).exp_m1().ln()
        }
    }
}

/// `g(x) = e^x`.
#[derive(Debug, Clone, Copy)]
pub struct Exp;

impl LinkFn for Exp {
    fn value(&self, x: f64) -> f64 {
        x.exp()
    }

    fn deriv(&self, x: f64) -> f64 {
        x.exp()
    }

    fn deriv2(&self, x: f64) -> f64 {
        x.exp()
    }

    fn inverse(&self, y: f64) -> f64 {
        y.max(f64::MIN_POSITIVE).ln()
    }
}

/// Link value and Jacobian aggregated from annotation rows onto
/// summary-statistic ordinals through the reconciliation map.
pub struct LinkEval {
    /// Per-ordinal heritability, length = number of ordinals.
    pub sigma2: Array1<f64>,
    /// Ordinal-by-parameter Jacobian of `sigma2`.
    pub jacobian: Array2<f64>,
}

pub fn eval_link(
    link: &dyn LinkFn,
    annotations: &ArrayView2<f64>,
    theta: &ArrayView1<f64>,
    map: &[usize],
    n_ordinals: usize,
) -> LinkEval {
    let p = annotations.ncols();
    let mut sigma2 = Array1::<f64>::zeros(n_ordinals);
    let mut jacobian = Array2::<f64>::zeros((n_ordinals, p));
    for (row, &ordinal) in map.iter().enumerate() {
        let a = annotations.row(row);
        let x = a.dot(theta);
        sigma2[ordinal] += link.value(x);
        let d = link.deriv(x);
        for j in 0..p {
            jacobian[(ordinal, j)] += d * a[j];
        }
    }
    LinkEval { sigma2, jacobian }
}

/// Second-derivative contribution to the parameter-space Hessian:
/// `sum_r scores[map[r]] * g''(a_r . theta) * a_r a_r'`.
pub fn curvature_term(
    link: &dyn LinkFn,
    annotations: &ArrayView2<f64>,
    theta: &ArrayView1<f64>,
    map: &[usize],
    scores: &ArrayView1<f64>,
) -> Array2<f64> {
    let p = annotations.ncols();
    let mut out = Array2::<f64>::zeros((p, p));
    for (row, &ordinal) in map.iter().enumerate() {
        let a = annotations.row(row);
        let w = scores[ordinal] * link.deriv2(a.dot(theta));
        if w == 0.0 {
            continue;
        }
        for i in 0..p {
            let wa = w * a[i];
            for j in i..p {
                out[(i, j)] += wa * a[j];
            }
        }
    }
    for i in 0..p {
        for j in (i + 1)..p {
            out[(j, i)] = out[(i, j)];
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::array;

    #[test]
    fn softplus_derivatives_match_finite_differences() {
        let link = Softplus;
        let eps = 1e-6;
        for &x in &[-4.0, -0.5, 0.0, 0.5, 4.0] {
            let fd = (link.value(x + eps) - link.value(x - eps)) / (2.0 * eps);
            assert_relative_eq!(link.deriv(x), fd, epsilon = 1e-6);
            let fd2 = (link.deriv(x + eps) - link.deriv(x - eps)) / (2.0 * eps);
            assert_relative_eq!(link.deriv2(x), fd2, epsilon = 1e-6);
        }
    }

    #[test]
    fn softplus_inverse_roundtrip() {
        let link = Softplus;
        for &y in &[1e-6, 0.01, 0.5, 2.0, 40.0] {
            assert_relative_eq!(link.value(link.inverse(y)), y, max_relative = 1e-9);
        }
    }

    #[test]
    fn exp_inverse_roundtrip() {
        let link = Exp;
        for &y in &[1e-8, 0.3, 5.0] {
            assert_relative_eq!(link.value(link.inverse(y)), y, max_relative = 1e-12);
        }
    }

    #[test]
    fn eval_link_aggregates_duplicate_rows() {
        let link = Exp;
        let annotations = array![[1.0, 0.0], [1.0, 1.0], [1.0, 0.0]];
        let theta = array![0.0, 1.0];
        // rows 0 and 2 both land on ordinal 0
        let map = vec![0, 1, 0];
        let eval = eval_link(&link, &annotations.view(), &theta.view(), &map, 2);
        assert_relative_eq!(eval.sigma2[0], 2.0, epsilon = 1e-12);
        assert_relative_eq!(eval.sigma2[1], 1.0_f64.exp(), epsilon = 1e-12);
        assert_relative_eq!(eval.jacobian[(0, 0)], 2.0, epsilon = 1e-12);
        assert_relative_eq!(eval.jacobian[(0, 1)], 0.0, epsilon = 1e-12);
    }
}
