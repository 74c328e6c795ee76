//! Annotation-partitioned heritability from GWAS summary statistics and
//! sparse LD precision matrices.
//!
//! Inputs are per-block Z-scores, annotation matrices, and sparse symmetric
//! precision matrices over LD-independent regions. The model links
//! annotation values to per-variant heritability through a differentiable
//! link function and is fit by a damped/trust-region Newton method, with
//! jackknife, sandwich, and model-based covariance estimators propagated to
//! heritability and enrichment.

pub mod block;
pub mod config;
pub mod error;
pub mod estimate;
pub mod inference;
pub mod large_effect;
pub mod likelihood;
pub mod link;
pub mod logging;
pub mod numeric;
pub mod optimize;
pub mod parallel;
pub mod precision;
pub mod types;
