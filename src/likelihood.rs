use anyhow::{anyhow, Result};
use ndarray::{s, Array1, Array2, ArrayView1};
use ndarray_linalg::{Inverse, Solve};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::block::Block;
use crate::link::{curvature_term, eval_link, LinkFn};
use crate::numeric::logdet_spd;

/// Read-only inputs for one block evaluation, passed explicitly so parallel
/// workers capture no shared mutable state.
#[derive(Debug, Clone)]
pub struct EvalRequest {
    pub sample_size: f64,
    pub intercept: f64,
    pub free_intercept: bool,
    /// Stochastic-trace probe count; 0 = exact.
    pub num_samples: usize,
    pub seed: u64,
    pub per_variant: bool,
}

/// Per-variant score and Hessian-diagonal contributions, collected under the
/// null-fit mode for downstream per-variant testing.
#[derive(Debug, Clone)]
pub struct PerVariant {
    pub score: Array1<f64>,
    pub hess_diag: Array1<f64>,
}

#[derive(Debug, Clone)]
pub struct BlockEval {
    pub nll: f64,
    pub grad: Array1<f64>,
    pub hess: Array2<f64>,
    pub per_variant: Option<PerVariant>,
}

impl BlockEval {
    fn degenerate(p: usize) -> Self {
        Self {
            nll: f64::INFINITY,
            grad: Array1::zeros(p),
            hess: Array2::zeros((p, p)),
            per_variant: None,
        }
    }
}

/// Per-block likelihood kernel: pure, block-local, side-effect-free.
pub trait BlockLikelihood: Send + Sync {
    fn evaluate(
        &self,
        block: &Block,
        link: &dyn LinkFn,
        theta: &ArrayView1<f64>,
        req: &EvalRequest,
    ) -> Result<BlockEval>;

    /// Negative log-likelihood only; `INFINITY` when the covariance is not
    /// positive definite at `theta`.
    fn objective(
        &self,
        block: &Block,
        link: &dyn LinkFn,
        theta: &ArrayView1<f64>,
        req: &EvalRequest,
    ) -> Result<f64>;
}

/// Reference Gaussian kernel.
///
/// With `y = P z`, the model covariance of `y` is `M = sigma0 P + n diag(sigma2)`,
/// which shares the precision matrix's sparsity. The exact path densifies and
/// inverts `M`; the stochastic path estimates the inverse entries from
/// Rademacher probes solved by conjugate gradient. The log-determinant is
/// always computed from the dense Cholesky factor.
#[derive(Debug, Clone, Copy)]
pub struct GaussianKernel;

impl BlockLikelihood for GaussianKernel {
    fn evaluate(
        &self,
        block: &Block,
        link: &dyn LinkFn,
        theta: &ArrayView1<f64>,
        req: &EvalRequest,
    ) -> Result<BlockEval> {
        let n_ord = block.n_ordinals();
        let p_annot = block.annotations.ncols();
        let p = p_annot + usize::from(req.free_intercept);
        if theta.len() != p {
            return Err(anyhow!(
                "parameter length {} does not match {p} (annotations {p_annot}, free intercept {})",
                theta.len(),
                req.free_intercept
            ));
        }
        if n_ord == 0 {
            return Ok(BlockEval {
                nll: 0.0,
                grad: Array1::zeros(p),
                hess: Array2::zeros((p, p)),
                per_variant: None,
            });
        }

        let theta_annot = theta.slice(s![..p_annot]);
        let sigma0 = if req.free_intercept {
            theta[p - 1]
        } else {
            req.intercept
        };
        let n = req.sample_size;
        let eval = eval_link(link, &block.annotations.view(), &theta_annot, &block.map, n_ord);

        let y = block.precision.matvec(&block.z.view());
        let p_dense = block.precision.to_dense();
        let mut m = p_dense.mapv(|v| v * sigma0);
        for i in 0..n_ord {
            m[(i, i)] += n * eval.sigma2[i];
        }

        let logdet = logdet_spd(&m);
        if !logdet.is_finite() {
            return Ok(BlockEval::degenerate(p));
        }

        let (minv, b) = if req.num_samples == 0 {
            let minv = match m.inv() {
                Ok(inv) => inv,
                Err(_) => return Ok(BlockEval::degenerate(p)),
            };
            let b = minv.dot(&y);
            (minv, b)
        } else {
            let diag = eval.sigma2.mapv(|v| n * v);
            let m_sparse = block.precision.scaled_plus_diag(sigma0, &diag.view());
            let b = match m_sparse.cg_solve(&y.view(), 1e-10, 20 * n_ord.max(10)) {
                Ok(b) => b,
                Err(_) => return Ok(BlockEval::degenerate(p)),
            };
            let mut rng = StdRng::seed_from_u64(req.seed);
            let mut est = Array2::<f64>::zeros((n_ord, n_ord));
            for _ in 0..req.num_samples {
                let u = Array1::from_shape_fn(n_ord, |_| if rng.gen::<bool>() { 1.0 } else { -1.0 });
                let v = match m_sparse.cg_solve(&u.view(), 1e-8, 20 * n_ord.max(10)) {
                    Ok(v) => v,
                    Err(_) => return Ok(BlockEval::degenerate(p)),
                };
                for i in 0..n_ord {
                    for j in 0..n_ord {
                        est[(i, j)] += v[i] * u[j];
                    }
                }
            }
            est /= req.num_samples as f64;
            let sym = 0.5 * (&est + &est.t());
            (sym, b)
        };

        let nll = 0.5 * (logdet + y.dot(&b));

        let mut scores = Array1::<f64>::zeros(n_ord);
        for i in 0..n_ord {
            scores[i] = 0.5 * n * (minv[(i, i)] - b[i] * b[i]);
        }
        let grad_annot = eval.jacobian.t().dot(&scores);

        let n2 = n * n;
        let mut h_sigma = Array2::<f64>::zeros((n_ord, n_ord));
        for i in 0..n_ord {
            for j in 0..n_ord {
                let mij = minv[(i, j)];
                h_sigma[(i, j)] = 0.5 * n2 * (2.0 * b[i] * mij * b[j] - mij * mij);
            }
        }
        let mut hess_annot = eval.jacobian.t().dot(&h_sigma.dot(&eval.jacobian));
        hess_annot = hess_annot
            + curvature_term(
                link,
                &block.annotations.view(),
                &theta_annot,
                &block.map,
                &scores.view(),
            );

        let per_variant = if req.per_variant {
            let mut hess_diag = Array1::<f64>::zeros(n_ord);
            for i in 0..n_ord {
                hess_diag[i] = h_sigma[(i, i)];
            }
            Some(PerVariant {
                score: scores.clone(),
                hess_diag,
            })
        } else {
            None
        };

        let mut grad = Array1::<f64>::zeros(p);
        let mut hess = Array2::<f64>::zeros((p, p));
        grad.slice_mut(s![..p_annot]).assign(&grad_annot);
        hess.slice_mut(s![..p_annot, ..p_annot]).assign(&hess_annot);

        if req.free_intercept {
            let pb = block.precision.matvec(&b.view());
            let mut tr_mp = 0.0;
            for (row, col, val) in block.precision.iter() {
                tr_mp += val * minv[(col, row)];
            }
            grad[p - 1] = 0.5 * (tr_mp - b.dot(&pb));

            let mp = minv.dot(&p_dense);
            let minv_pb = minv.dot(&pb);
            let mut cross_sigma = Array1::<f64>::zeros(n_ord);
            for i in 0..n_ord {
                let w_ii = mp.row(i).dot(&minv.column(i));
                cross_sigma[i] = 0.5 * n * (2.0 * b[i] * minv_pb[i] - w_ii);
            }
            let cross_annot = eval.jacobian.t().dot(&cross_sigma);
            for j in 0..p_annot {
                hess[(j, p - 1)] = cross_annot[j];
                hess[(p - 1, j)] = cross_annot[j];
            }
            let mut tr_mpmp = 0.0;
            for i in 0..n_ord {
                for j in 0..n_ord {
                    tr_mpmp += mp[(i, j)] * mp[(j, i)];
                }
            }
            hess[(p - 1, p - 1)] = 0.5 * (2.0 * pb.dot(&minv_pb) - tr_mpmp);
        }

        let hess = 0.5 * (&hess + &hess.t());
        Ok(BlockEval {
            nll,
            grad,
            hess,
            per_variant,
        })
    }

    fn objective(
        &self,
        block: &Block,
        link: &dyn LinkFn,
        theta: &ArrayView1<f64>,
        req: &EvalRequest,
    ) -> Result<f64> {
        let n_ord = block.n_ordinals();
        let p_annot = block.annotations.ncols();
        let p = p_annot + usize::from(req.free_intercept);
        if theta.len() != p {
            return Err(anyhow!(
                "parameter length {} does not match {p}",
                theta.len()
            ));
        }
        if n_ord == 0 {
            return Ok(0.0);
        }
        let theta_annot = theta.slice(s![..p_annot]);
        let sigma0 = if req.free_intercept {
            theta[p - 1]
        } else {
            req.intercept
        };
        let eval = eval_link(link, &block.annotations.view(), &theta_annot, &block.map, n_ord);

        let y = block.precision.matvec(&block.z.view());
        let mut m = block.precision.to_dense().mapv(|v| v * sigma0);
        for i in 0..n_ord {
            m[(i, i)] += req.sample_size * eval.sigma2[i];
        }
        let logdet = logdet_spd(&m);
        if !logdet.is_finite() {
            return Ok(f64::INFINITY);
        }
        let x = match m.solve(&y) {
            Ok(x) => x,
            Err(_) => return Ok(f64::INFINITY),
        };
        let nll = 0.5 * (logdet + y.dot(&x));
        Ok(if nll.is_finite() { nll } else { f64::INFINITY })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::Softplus;
    use crate::precision::PrecisionMatrix;
    use approx::assert_relative_eq;
    use ndarray::array;

    fn test_block() -> Block {
        let entries = vec![
            (0, 0, 1.2),
            (0, 1, -0.3),
            (1, 1, 1.4),
            (1, 2, -0.2),
            (2, 2, 1.1),
            (3, 3, 1.0),
        ];
        let precision = PrecisionMatrix::from_triplets(4, &entries).expect("precision");
        let annotations = array![
            [1.0, 0.0],
            [1.0, 1.0],
            [1.0, 1.0],
            [1.0, 0.0]
        ];
        let z = array![0.8, -1.5, 2.1, 0.4];
        let mut block = Block::new(precision, annotations, z).expect("block");
        block.reconcile(0).expect("reconcile");
        block
    }

    fn request(free_intercept: bool) -> EvalRequest {
        EvalRequest {
            sample_size: 1000.0,
            intercept: 1.0,
            free_intercept,
            num_samples: 0,
            seed: 0,
            per_variant: false,
        }
    }

    #[test]
    fn gradient_matches_finite_differences() {
        let block = test_block();
        let kernel = GaussianKernel;
        let link = Softplus;
        let req = request(false);
        let theta = array![-6.0, 0.8];
        let eval = kernel
            .evaluate(&block, &link, &theta.view(), &req)
            .expect("evaluate");

        let eps = 1e-6;
        for j in 0..theta.len() {
            let mut plus = theta.clone();
            let mut minus = theta.clone();
            plus[j] += eps;
            minus[j] -= eps;
            let f_plus = kernel
                .objective(&block, &link, &plus.view(), &req)
                .expect("objective");
            let f_minus = kernel
                .objective(&block, &link, &minus.view(), &req)
                .expect("objective");
            let fd = (f_plus - f_minus) / (2.0 * eps);
            assert_relative_eq!(eval.grad[j], fd, epsilon = 1e-5, max_relative = 1e-4);
        }
    }

    #[test]
    fn hessian_matches_finite_differences_of_gradient() {
        let block = test_block();
        let kernel = GaussianKernel;
        let link = Softplus;
        let req = request(false);
        let theta = array![-6.0, 0.8];
        let eval = kernel
            .evaluate(&block, &link, &theta.view(), &req)
            .expect("evaluate");

        let eps = 1e-5;
        for j in 0..theta.len() {
            let mut plus = theta.clone();
            let mut minus = theta.clone();
            plus[j] += eps;
            minus[j] -= eps;
            let g_plus = kernel
                .evaluate(&block, &link, &plus.view(), &req)
                .expect("evaluate")
                .grad;
            let g_minus = kernel
                .evaluate(&block, &link, &minus.view(), &req)
                .expect("evaluate")
                .grad;
            for i in 0..theta.len() {
                let fd = (g_plus[i] - g_minus[i]) / (2.0 * eps);
                assert_relative_eq!(eval.hess[(i, j)], fd, epsilon = 1e-4, max_relative = 1e-3);
            }
        }
    }

    #[test]
    fn free_intercept_gradient_matches_finite_differences() {
        let block = test_block();
        let kernel = GaussianKernel;
        let link = Softplus;
        let req = request(true);
        let theta = array![-6.0, 0.8, 1.1];
        let eval = kernel
            .evaluate(&block, &link, &theta.view(), &req)
            .expect("evaluate");

        let eps = 1e-6;
        for j in 0..theta.len() {
            let mut plus = theta.clone();
            let mut minus = theta.clone();
            plus[j] += eps;
            minus[j] -= eps;
            let f_plus = kernel
                .objective(&block, &link, &plus.view(), &req)
                .expect("objective");
            let f_minus = kernel
                .objective(&block, &link, &minus.view(), &req)
                .expect("objective");
            let fd = (f_plus - f_minus) / (2.0 * eps);
            assert_relative_eq!(eval.grad[j], fd, epsilon = 1e-5, max_relative = 1e-4);
        }
    }

    #[test]
    fn free_intercept_hessian_matches_finite_differences() {
        let block = test_block();
        let kernel = GaussianKernel;
        let link = Softplus;
        let req = request(true);
        let theta = array![-6.0, 0.8, 1.1];
        let eval = kernel
            .evaluate(&block, &link, &theta.view(), &req)
            .expect("evaluate");

        let eps = 1e-5;
        for j in 0..theta.len() {
            let mut plus = theta.clone();
            let mut minus = theta.clone();
            plus[j] += eps;
            minus[j] -= eps;
            let g_plus = kernel
                .evaluate(&block, &link, &plus.view(), &req)
                .expect("evaluate")
                .grad;
            let g_minus = kernel
                .evaluate(&block, &link, &minus.view(), &req)
                .expect("evaluate")
                .grad;
            for i in 0..theta.len() {
                let fd = (g_plus[i] - g_minus[i]) / (2.0 * eps);
                assert_relative_eq!(eval.hess[(i, j)], fd, epsilon = 1e-4, max_relative = 1e-3);
            }
        }
    }

    #[test]
    fn stochastic_matches_exact_for_diagonal_precision() {
        // With an identity precision matrix M is diagonal, so the probe
        // estimate of its inverse diagonal is exact for any probe count.
        let precision = PrecisionMatrix::identity(4);
        let annotations = array![[1.0], [1.0], [1.0], [1.0]];
        let z = array![0.5, -1.0, 1.5, 0.2];
        let mut block = Block::new(precision, annotations, z).expect("block");
        block.reconcile(0).expect("reconcile");

        let kernel = GaussianKernel;
        let link = Softplus;
        let theta = array![-5.0];
        let mut req = request(false);
        let exact = kernel
            .evaluate(&block, &link, &theta.view(), &req)
            .expect("exact");
        req.num_samples = 3;
        req.seed = 42;
        let stochastic = kernel
            .evaluate(&block, &link, &theta.view(), &req)
            .expect("stochastic");

        assert_relative_eq!(exact.nll, stochastic.nll, max_relative = 1e-8);
        assert_relative_eq!(exact.grad[0], stochastic.grad[0], max_relative = 1e-6);
    }

    #[test]
    fn per_variant_contributions_have_block_length() {
        let block = test_block();
        let kernel = GaussianKernel;
        let link = Softplus;
        let mut req = request(false);
        req.per_variant = true;
        let theta = array![-6.0, 0.8];
        let eval = kernel
            .evaluate(&block, &link, &theta.view(), &req)
            .expect("evaluate");
        let pv = eval.per_variant.expect("per-variant");
        assert_eq!(pv.score.len(), block.n_ordinals());
        assert_eq!(pv.hess_diag.len(), block.n_ordinals());
    }
}
