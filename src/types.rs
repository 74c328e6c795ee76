use ndarray::{Array1, Array2};

use crate::block::ProxyRecord;
use crate::large_effect::FilterSummary;
use crate::likelihood::PerVariant;
use crate::optimize::{IterationRecord, OptimizerStatus};

/// One value per parameter (or annotation) under each covariance estimator.
#[derive(Debug, Clone)]
pub struct SeTriple {
    pub jackknife: Array1<f64>,
    pub sandwich: Array1<f64>,
    pub naive: Array1<f64>,
}

/// Parameter covariance under each estimator.
#[derive(Debug, Clone)]
pub struct CovarianceSet {
    pub jackknife: Array2<f64>,
    pub sandwich: Array2<f64>,
    pub naive: Array2<f64>,
}

/// Point estimates and inference at the converged parameters.
#[derive(Debug, Clone)]
pub struct Estimate {
    pub params: Array1<f64>,
    pub loglik: f64,
    pub intercept: f64,
    /// NaN when the intercept is fixed.
    pub intercept_se: f64,
    /// Per-annotation heritability.
    pub heritability: Array1<f64>,
    /// Raw per-annotation column sums (variant shares for enrichment).
    pub annotation_sums: Array1<f64>,
    pub coef_se: SeTriple,
    pub coef_p: SeTriple,
    pub h2_se: SeTriple,
    pub h2_p: SeTriple,
    /// Enrichment per annotation; exactly 1 for the reference column.
    pub enrichment: Array1<f64>,
    pub enrichment_se: SeTriple,
    pub enrichment_p: SeTriple,
}

/// Leave-one-block-out record: one row per retained block.
#[derive(Debug, Clone)]
pub struct JackknifeOutput {
    pub deleted_params: Array2<f64>,
    pub deleted_h2: Array2<f64>,
    /// Per-variant score/Hessian contributions per block, under the
    /// null-fit mode.
    pub per_variant: Option<Vec<PerVariant>>,
}

/// Everything a fit produces.
#[derive(Debug, Clone)]
pub struct EstimateOutput {
    pub estimate: Estimate,
    pub status: OptimizerStatus,
    pub trace: Vec<IterationRecord>,
    pub proxies: Vec<ProxyRecord>,
    pub jackknife: JackknifeOutput,
    pub covariances: CovarianceSet,
    pub filter: FilterSummary,
}
