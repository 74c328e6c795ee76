use anyhow::{Context, Result};
use ndarray::Array1;
use tracing::{info, warn};

use crate::block::Block;
use crate::config::FitConfig;
use crate::error::PrecmlError;
use crate::inference::infer;
use crate::large_effect::apply_policy;
use crate::likelihood::GaussianKernel;
use crate::optimize::{run_newton, NewtonFit};
use crate::parallel::{resolve_threads, run_in_pool};
use crate::types::{CovarianceSet, Estimate, EstimateOutput, JackknifeOutput};

/// Fit the heritability model over a set of LD blocks.
///
/// Pipeline: validate the base annotation column, reconcile index spaces,
/// apply the large-effect policy, maximize the likelihood with the damped
/// Newton optimizer, then run post-fit inference at the converged
/// parameters.
pub fn estimate(mut blocks: Vec<Block>, config: &FitConfig) -> Result<EstimateOutput> {
    config.validate()?;
    if blocks.is_empty() {
        return Err(PrecmlError::NoBlocks.into());
    }

    // Fatal precondition, checked before any computation.
    let n_annot = blocks[0].annotations.ncols();
    for (b, block) in blocks.iter().enumerate() {
        if block.annotations.ncols() != n_annot {
            return Err(PrecmlError::DimensionMismatch(format!(
                "block {b} has {} annotation columns; expected {n_annot}",
                block.annotations.ncols()
            ))
            .into());
        }
        for (r, value) in block.annotations.column(0).iter().enumerate() {
            if *value != 1.0 {
                return Err(PrecmlError::BaseAnnotationNotConstant {
                    block: b,
                    row: r,
                    value: *value,
                }
                .into());
            }
        }
    }

    let mut proxies = Vec::new();
    for (idx, block) in blocks.iter_mut().enumerate() {
        let mut found = block
            .reconcile(idx)
            .with_context(|| format!("reconciling block {idx}"))?;
        proxies.append(&mut found);
    }
    if !proxies.is_empty() {
        info!("Resolved {} missing variant(s) through LD proxies", proxies.len());
    }

    let link = config.link.as_link();
    let threshold = config.resolved_threshold();
    let (filter, extra_param) = apply_policy(
        &mut blocks,
        config.policy,
        threshold,
        link,
        config.sample_size,
    )?;
    if blocks.is_empty() {
        return Err(PrecmlError::NoBlocks.into());
    }

    // Scale the original non-base columns to unit root-mean-square; raw
    // scales are kept so heritability and enrichment report on the original
    // annotation values. A policy-appended column stays unscaled.
    let k = blocks[0].annotations.ncols();
    let mut col_scale = vec![1.0; k];
    if config.normalize_annotations {
        for c in 1..n_annot {
            let mut sq_sum = 0.0;
            let mut rows = 0usize;
            for block in &blocks {
                for v in block.annotations.column(c) {
                    sq_sum += v * v;
                }
                rows += block.annotations.nrows();
            }
            let rms = if rows > 0 { (sq_sum / rows as f64).sqrt() } else { 0.0 };
            if rms > 0.0 {
                for block in blocks.iter_mut() {
                    block.annotations.column_mut(c).mapv_inplace(|v| v / rms);
                }
                col_scale[c] = rms;
            } else {
                warn!("annotation column {c} is identically zero; left unscaled");
            }
        }
    }

    let total_rows: usize = blocks.iter().map(|b| b.annotations.nrows()).sum();
    let mut theta0 = vec![0.0; k];
    theta0[0] = link.inverse((config.initial_h2 / total_rows.max(1) as f64).max(1e-12));
    if let Some(extra) = extra_param {
        theta0[k - 1] = extra;
    }
    if config.free_intercept {
        theta0.push(config.intercept);
    }
    let theta0 = Array1::from_vec(theta0);

    info!(
        "Fitting {} block(s), {k} annotation column(s), sample size {}",
        blocks.len(),
        config.sample_size
    );

    type Fitted = (NewtonFit, (Estimate, CovarianceSet, JackknifeOutput));
    let kernel = GaussianKernel;
    let cores = resolve_threads(config.cores, blocks.len());
    let fitted: Result<Fitted> = run_in_pool(cores, "build precml thread pool", || {
        let fit = run_newton(&blocks, link, &kernel, theta0, config)?;
        let inference = infer(&blocks, link, &kernel, &fit.params, config, &col_scale)?;
        Ok((fit, inference))
    })?;
    let (fit, (point, covariances, jackknife)) = fitted?;

    info!(
        "Optimization finished after {} iteration(s); log-likelihood {:.4}",
        fit.trace.len(),
        -fit.objective
    );

    Ok(EstimateOutput {
        estimate: point,
        status: fit.status,
        trace: fit.trace,
        proxies,
        jackknife,
        covariances,
        filter,
    })
}
