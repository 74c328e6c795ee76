use crate::error::{PrecmlError, Result};
use crate::large_effect::{default_threshold, LargeEffectPolicy};
use crate::link::{Exp, LinkFn, Softplus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkChoice {
    Softplus,
    Exp,
}

impl LinkChoice {
    pub fn as_link(&self) -> &'static dyn LinkFn {
        match self {
            LinkChoice::Softplus => &Softplus,
            LinkChoice::Exp => &Exp,
        }
    }
}

/// Every tunable of a fit, built once at entry and passed by reference
/// everywhere.
#[derive(Debug, Clone)]
pub struct FitConfig {
    /// GWAS sample size.
    pub sample_size: f64,
    /// Convergence tolerance on the objective.
    pub tol: f64,
    /// Iterations the convergence window looks back over.
    pub min_iters: usize,
    /// Hard iteration cap.
    pub max_iters: usize,
    /// Trust-region step control (false = fixed-ridge damping).
    pub trust_region: bool,
    /// Initial trust-region penalty lambda.
    pub trust_start: f64,
    /// Multiplier applied to lambda on shrink/expand.
    pub trust_scalar: f64,
    /// Accept a step when rho exceeds this bound.
    pub rho_lb: f64,
    /// Expand the trust region when rho exceeds this bound.
    pub rho_ub: f64,
    /// Reset lambda to `trust_start` each outer iteration.
    pub reset_trust: bool,
    /// Inner step attempts per outer iteration.
    pub step_maxiter: usize,
    /// Reject candidates whose gradient norm more than doubles.
    pub gradient_check: bool,
    /// Stochastic-trace probe count; 0 = exact.
    pub num_samples: usize,
    /// Intercept value (initial when free, fixed otherwise).
    pub intercept: f64,
    pub free_intercept: bool,
    pub policy: LargeEffectPolicy,
    /// Override for the large-effect chi-square threshold.
    pub chisq_threshold: Option<f64>,
    /// Scale non-base annotation columns to unit root-mean-square.
    pub normalize_annotations: bool,
    /// Annotation column enrichment is normalized against.
    pub reference_annotation: usize,
    /// Collect per-variant score/Hessian contributions at the optimum.
    pub null_fit: bool,
    /// Numerical ridge used in damping, jackknife, and zero-information
    /// bumps.
    pub regularization: f64,
    /// Total heritability used to seed the base coefficient.
    pub initial_h2: f64,
    pub link: LinkChoice,
    /// Seed for stochastic-trace probes.
    pub seed: u64,
    /// Rayon pool size (None = global pool).
    pub cores: Option<usize>,
}

impl FitConfig {
    pub fn new(sample_size: f64) -> Self {
        Self {
            sample_size,
            tol: 1e-6,
            min_iters: 2,
            max_iters: 100,
            trust_region: true,
            trust_start: 1e-3,
            trust_scalar: 10.0,
            rho_lb: 1e-4,
            rho_ub: 0.9,
            reset_trust: true,
            step_maxiter: 30,
            gradient_check: false,
            num_samples: 0,
            intercept: 1.0,
            free_intercept: false,
            policy: LargeEffectPolicy::Keep,
            chisq_threshold: None,
            normalize_annotations: false,
            reference_annotation: 0,
            null_fit: false,
            regularization: 1e-8,
            initial_h2: 0.1,
            link: LinkChoice::Softplus,
            seed: 0,
            cores: None,
        }
    }

    pub fn resolved_threshold(&self) -> f64 {
        self.chisq_threshold
            .unwrap_or_else(|| default_threshold(self.sample_size))
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.sample_size > 0.0) {
            return Err(PrecmlError::InvalidConfig(format!(
                "sample_size must be positive; got {}",
                self.sample_size
            )));
        }
        if !(self.tol > 0.0) {
            return Err(PrecmlError::InvalidConfig("tol must be positive".into()));
        }
        if self.max_iters == 0 || self.min_iters == 0 {
            return Err(PrecmlError::InvalidConfig(
                "min_iters and max_iters must be at least 1".into(),
            ));
        }
        if self.trust_scalar <= 1.0 {
            return Err(PrecmlError::InvalidConfig(
                "trust_scalar must exceed 1".into(),
            ));
        }
        if !(self.rho_lb < self.rho_ub) {
            return Err(PrecmlError::InvalidConfig(
                "rho_lb must be below rho_ub".into(),
            ));
        }
        if self.step_maxiter == 0 {
            return Err(PrecmlError::InvalidConfig(
                "step_maxiter must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        FitConfig::new(100_000.0).validate().expect("valid");
    }

    #[test]
    fn threshold_defaults_to_scaled_sample_size() {
        let config = FitConfig::new(500_000.0);
        assert_eq!(config.resolved_threshold(), 500.0);
        let config = FitConfig::new(10_000.0);
        assert_eq!(config.resolved_threshold(), 80.0);
    }

    #[test]
    fn rejects_bad_trust_scalar() {
        let mut config = FitConfig::new(100_000.0);
        config.trust_scalar = 0.5;
        assert!(config.validate().is_err());
    }
}
