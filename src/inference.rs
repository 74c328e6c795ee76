use anyhow::{anyhow, Result};
use ndarray::{s, Array1, Array2, ArrayView1};
use ndarray_linalg::Solve;
use rayon::prelude::*;
use tracing::warn;

use crate::block::Block;
use crate::config::FitConfig;
use crate::likelihood::{BlockEval, BlockLikelihood, PerVariant};
use crate::link::LinkFn;
use crate::numeric::{pseudo_inverse, quadratic_form, row_covariance, safe_div, two_tailed_p};
use crate::optimize::block_request;
use crate::types::{CovarianceSet, Estimate, JackknifeOutput, SeTriple};

/// Heritability, its parameter Jacobian, and raw column sums, accumulated
/// over every annotation row of every block. `col_scale` undoes annotation
/// normalization so results are on the raw annotation scale.
fn annotation_stats(
    blocks: &[Block],
    link: &dyn LinkFn,
    theta_annot: &ArrayView1<f64>,
    col_scale: &[f64],
) -> (Array1<f64>, Array2<f64>, Array1<f64>) {
    let k = col_scale.len();
    let p = theta_annot.len();
    let mut h2 = Array1::<f64>::zeros(k);
    let mut jac = Array2::<f64>::zeros((k, p));
    let mut sums = Array1::<f64>::zeros(k);
    for block in blocks {
        for row in block.annotations.rows() {
            let x = row.dot(theta_annot);
            let value = link.value(x);
            let deriv = link.deriv(x);
            for a in 0..k {
                let raw = col_scale[a] * row[a];
                if raw == 0.0 {
                    continue;
                }
                h2[a] += raw * value;
                sums[a] += raw;
                for j in 0..p {
                    jac[(a, j)] += raw * deriv * row[j];
                }
            }
        }
    }
    (h2, jac, sums)
}

fn diag_se(cov: &Array2<f64>) -> Array1<f64> {
    cov.diag()
        .mapv(|v| if v.is_finite() && v >= 0.0 { v.sqrt() } else { f64::NAN })
}

fn se_and_p(values: &Array1<f64>, cov: &Array2<f64>, jac: &Array2<f64>) -> (Array1<f64>, Array1<f64>) {
    let k = values.len();
    let mut se = Array1::<f64>::zeros(k);
    let mut p = Array1::<f64>::zeros(k);
    for a in 0..k {
        let var = quadratic_form(&jac.row(a), cov);
        se[a] = if var.is_finite() && var >= 0.0 {
            var.sqrt()
        } else {
            f64::NAN
        };
        p[a] = two_tailed_p(safe_div(values[a], se[a]));
    }
    (se, p)
}

/// Post-fit inference: one more pass over the blocks at the converged
/// parameters, then jackknife, naive, and sandwich covariances propagated to
/// heritability and enrichment.
pub fn infer(
    blocks: &[Block],
    link: &dyn LinkFn,
    kernel: &dyn BlockLikelihood,
    theta: &Array1<f64>,
    config: &FitConfig,
    col_scale: &[f64],
) -> Result<(Estimate, CovarianceSet, JackknifeOutput)> {
    let n_blocks = blocks.len();
    if n_blocks == 0 {
        return Err(anyhow!("no blocks to infer from"));
    }
    let p = theta.len();
    let k = col_scale.len();
    let p_annot = p - usize::from(config.free_intercept);
    if config.reference_annotation >= k {
        return Err(anyhow!(
            "reference annotation {} out of range for {k} columns",
            config.reference_annotation
        ));
    }

    let evals: Vec<Result<BlockEval>> = blocks
        .par_iter()
        .enumerate()
        .map(|(idx, block)| {
            let req = block_request(config, config.max_iters, idx, config.null_fit);
            kernel.evaluate(block, link, &theta.view(), &req)
        })
        .collect();

    let mut nll = 0.0;
    let mut grad_tot = Array1::<f64>::zeros(p);
    let mut hess_tot = Array2::<f64>::zeros((p, p));
    let mut grads = Array2::<f64>::zeros((n_blocks, p));
    let mut block_evals = Vec::with_capacity(n_blocks);
    for (idx, eval) in evals.into_iter().enumerate() {
        let eval = eval?;
        nll += eval.nll;
        grad_tot += &eval.grad;
        hess_tot += &eval.hess;
        grads.row_mut(idx).assign(&eval.grad);
        block_evals.push(eval);
    }

    // One-step Newton approximation to refitting without each block.
    let eps = config.regularization.max(1e-12);
    let mut deleted_params = Array2::<f64>::zeros((n_blocks, p));
    let mut deleted_h2 = Array2::<f64>::zeros((n_blocks, k));
    for (idx, eval) in block_evals.iter().enumerate() {
        let mut reduced = &hess_tot - &eval.hess;
        for j in 0..p {
            reduced[(j, j)] += eps;
        }
        let rhs = &eval.grad - &grad_tot;
        let delta = reduced
            .solve(&rhs)
            .map_err(|e| anyhow!("jackknife solve failed for block {idx}: {e}"))?;
        let theta_b = theta + &delta;
        let (h2_b, _, _) =
            annotation_stats(blocks, link, &theta_b.slice(s![..p_annot]), col_scale);
        deleted_params.row_mut(idx).assign(&theta_b);
        deleted_h2.row_mut(idx).assign(&h2_b);
    }

    if n_blocks < 3 {
        warn!("jackknife covariance needs at least 3 blocks; got {n_blocks}");
    }
    let jack_factor = (n_blocks as f64 - 2.0).max(0.0);
    let jackknife_cov = jack_factor * row_covariance(&deleted_params);

    let mut fisher = hess_tot.clone();
    let mut bumped = false;
    for j in 0..p {
        if fisher[(j, j)] == 0.0 {
            fisher[(j, j)] = eps;
            bumped = true;
        }
    }
    if bumped {
        warn!("zero Fisher information on at least one parameter; diagonal regularized");
    }
    let naive = pseudo_inverse(&fisher, 1e-12)?;
    let sandwich = naive
        .dot(&(n_blocks as f64 * row_covariance(&grads)))
        .dot(&naive);

    let covariances = CovarianceSet {
        jackknife: jackknife_cov,
        sandwich,
        naive,
    };

    // Coefficient-level tests under each covariance.
    let coef_se = SeTriple {
        jackknife: diag_se(&covariances.jackknife),
        sandwich: diag_se(&covariances.sandwich),
        naive: diag_se(&covariances.naive),
    };
    let coef_p = SeTriple {
        jackknife: coef_p_values(theta, &coef_se.jackknife),
        sandwich: coef_p_values(theta, &coef_se.sandwich),
        naive: coef_p_values(theta, &coef_se.naive),
    };

    let (h2, jac_annot, sums) =
        annotation_stats(blocks, link, &theta.slice(s![..p_annot]), col_scale);
    let mut h2_jac = Array2::<f64>::zeros((k, p));
    h2_jac.slice_mut(s![.., ..p_annot]).assign(&jac_annot);

    let (h2_se_j, h2_p_j) = se_and_p(&h2, &covariances.jackknife, &h2_jac);
    let (h2_se_s, h2_p_s) = se_and_p(&h2, &covariances.sandwich, &h2_jac);
    let (h2_se_n, h2_p_n) = se_and_p(&h2, &covariances.naive, &h2_jac);

    let reference = config.reference_annotation;
    let h_ref = h2[reference];
    let m_ref = sums[reference];
    let mut enrichment = Array1::<f64>::zeros(k);
    let mut enrich_jac = Array2::<f64>::zeros((k, p));
    for a in 0..k {
        if a == reference {
            enrichment[a] = 1.0;
            // Quotient-rule gradient degenerates here; keep the raw sum.
            let row = h2_jac.row(a).mapv(|v| safe_div(v, h_ref));
            enrich_jac.row_mut(a).assign(&row);
            continue;
        }
        let share = safe_div(sums[a], m_ref);
        enrichment[a] = safe_div(safe_div(h2[a], h_ref), share);
        let scale = safe_div(m_ref, sums[a]);
        for j in 0..p {
            enrich_jac[(a, j)] = scale
                * safe_div(
                    h_ref * h2_jac[(a, j)] - h2[a] * h2_jac[(reference, j)],
                    h_ref * h_ref,
                );
        }
    }

    let enrich_se = |cov: &Array2<f64>| -> Array1<f64> {
        let mut se = Array1::<f64>::zeros(k);
        for a in 0..k {
            let var = quadratic_form(&enrich_jac.row(a), cov);
            se[a] = if var.is_finite() && var >= 0.0 {
                var.sqrt()
            } else {
                f64::NAN
            };
        }
        se
    };
    // Tests each annotation's heritability share against the reference's:
    // under the joint covariance of (h_a, h_ref) the quotient-rule gradient
    // gives the variance of the enrichment ratio, and the test is centered
    // at the null ratio of 1.
    let enrich_p = |cov: &Array2<f64>| -> Array1<f64> {
        let mut pv = Array1::<f64>::zeros(k);
        for a in 0..k {
            if a == reference {
                pv[a] = f64::NAN;
                continue;
            }
            let var = quadratic_form(&enrich_jac.row(a), cov);
            let se = if var.is_finite() && var > 0.0 {
                var.sqrt()
            } else {
                f64::NAN
            };
            pv[a] = two_tailed_p(safe_div(enrichment[a] - 1.0, se));
        }
        pv
    };

    let enrichment_se = SeTriple {
        jackknife: enrich_se(&covariances.jackknife),
        sandwich: enrich_se(&covariances.sandwich),
        naive: enrich_se(&covariances.naive),
    };
    let enrichment_p = SeTriple {
        jackknife: enrich_p(&covariances.jackknife),
        sandwich: enrich_p(&covariances.sandwich),
        naive: enrich_p(&covariances.naive),
    };

    let (intercept, intercept_se) = if config.free_intercept {
        let se = covariances.naive[(p - 1, p - 1)];
        (
            theta[p - 1],
            if se >= 0.0 { se.sqrt() } else { f64::NAN },
        )
    } else {
        (config.intercept, f64::NAN)
    };

    let per_variant = if config.null_fit {
        let collected: Option<Vec<PerVariant>> = block_evals
            .iter()
            .map(|eval| eval.per_variant.clone())
            .collect();
        collected
    } else {
        None
    };

    let estimate = Estimate {
        params: theta.clone(),
        loglik: -nll,
        intercept,
        intercept_se,
        heritability: h2,
        annotation_sums: sums,
        coef_se,
        coef_p,
        h2_se: SeTriple {
            jackknife: h2_se_j,
            sandwich: h2_se_s,
            naive: h2_se_n,
        },
        h2_p: SeTriple {
            jackknife: h2_p_j,
            sandwich: h2_p_s,
            naive: h2_p_n,
        },
        enrichment,
        enrichment_se,
        enrichment_p,
    };
    let jackknife = JackknifeOutput {
        deleted_params,
        deleted_h2,
        per_variant,
    };
    Ok((estimate, covariances, jackknife))
}

fn coef_p_values(theta: &Array1<f64>, se: &Array1<f64>) -> Array1<f64> {
    let mut out = Array1::<f64>::zeros(theta.len());
    for j in 0..theta.len() {
        out[j] = two_tailed_p(safe_div(theta[j], se[j]));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::likelihood::GaussianKernel;
    use crate::link::Softplus;
    use crate::precision::PrecisionMatrix;
    use ndarray::array;

    fn blocks_with_flag() -> Vec<Block> {
        let zs = [
            array![2.5, -1.8, 1.6, 0.9],
            array![-2.1, 1.4, 1.5, -1.3],
            array![1.9, -2.6, 1.2, 1.5],
        ];
        zs.into_iter()
            .map(|z| {
                let n = z.len();
                let precision = PrecisionMatrix::identity(n);
                let annotations = ndarray::Array2::from_shape_fn((n, 2), |(r, c)| {
                    if c == 0 {
                        1.0
                    } else if r < 2 {
                        1.0
                    } else {
                        0.0
                    }
                });
                let mut block = Block::new(precision, annotations, z).expect("block");
                block.reconcile(0).expect("reconcile");
                block
            })
            .collect()
    }

    #[test]
    fn one_deleted_estimate_per_block() {
        let blocks = blocks_with_flag();
        let config = FitConfig::new(1000.0);
        let theta = array![-5.0, 0.5];
        let (_, _, jackknife) = infer(
            &blocks,
            &Softplus,
            &GaussianKernel,
            &theta,
            &config,
            &[1.0, 1.0],
        )
        .expect("infer");
        assert_eq!(jackknife.deleted_params.nrows(), blocks.len());
        assert_eq!(jackknife.deleted_h2.nrows(), blocks.len());
        assert_eq!(jackknife.deleted_h2.ncols(), 2);
    }

    #[test]
    fn reference_enrichment_is_exactly_one() {
        let blocks = blocks_with_flag();
        let config = FitConfig::new(1000.0);
        let theta = array![-5.0, 0.5];
        let (estimate, _, _) = infer(
            &blocks,
            &Softplus,
            &GaussianKernel,
            &theta,
            &config,
            &[1.0, 1.0],
        )
        .expect("infer");
        assert_eq!(estimate.enrichment[0], 1.0);
        assert!(estimate.enrichment_p.naive[0].is_nan());
    }

    #[test]
    fn naive_covariance_has_positive_diagonal_at_the_optimum() {
        let blocks = blocks_with_flag();
        let config = FitConfig::new(1000.0);
        let fit = crate::optimize::run_newton(
            &blocks,
            &Softplus,
            &GaussianKernel,
            array![-6.0, 0.0],
            &config,
        )
        .expect("fit");
        let (_, covariances, _) = infer(
            &blocks,
            &Softplus,
            &GaussianKernel,
            &fit.params,
            &config,
            &[1.0, 1.0],
        )
        .expect("infer");
        for j in 0..2 {
            assert!(covariances.naive[(j, j)] > 0.0);
        }
    }

    #[test]
    fn per_variant_contributions_follow_null_fit_toggle() {
        let blocks = blocks_with_flag();
        let mut config = FitConfig::new(1000.0);
        let theta = array![-5.0, 0.5];
        let (_, _, jackknife) = infer(
            &blocks,
            &Softplus,
            &GaussianKernel,
            &theta,
            &config,
            &[1.0, 1.0],
        )
        .expect("infer");
        assert!(jackknife.per_variant.is_none());

        config.null_fit = true;
        let (_, _, jackknife) = infer(
            &blocks,
            &Softplus,
            &GaussianKernel,
            &theta,
            &config,
            &[1.0, 1.0],
        )
        .expect("infer");
        let pv = jackknife.per_variant.expect("per-variant");
        assert_eq!(pv.len(), blocks.len());
        assert_eq!(pv[0].score.len(), 4);
    }
}
