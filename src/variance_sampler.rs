//! Conjugate inverse-gamma updates for a Gaussian variance.
//!
//! The prior is placed on the precision 1/sigsq ~ Gamma(alpha, beta) (shape,
//! rate).  An upper bound `sigma_max` on the standard deviation truncates the
//! posterior.

use rand::{Rng, RngCore};
use rand_distr::{Distribution, Gamma};
use statrs::distribution::{ContinuousCDF, Gamma as GammaDist};
use statrs::function::gamma::ln_gamma;

use crate::error::{Result, StateSpaceError};
use crate::observer::{ChangeObserver, UnivParam};
use crate::suf::{expected_variance_score, GaussianSuf};

/// Gamma(alpha, beta) prior on a precision, parameterised by shape and rate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GammaPrior {
    alpha: f64,
    beta: f64,
}

impl GammaPrior {
    pub fn new(alpha: f64, beta: f64) -> Result<Self> {
        if !(alpha > 0.0 && alpha.is_finite() && beta > 0.0 && beta.is_finite()) {
            return Err(StateSpaceError::Configuration(format!(
                "gamma prior needs positive finite shape and rate, got ({}, {})",
                alpha, beta
            )));
        }
        Ok(Self { alpha, beta })
    }

    /// Prior expressed as a guess at sigma and a prior sample size.
    pub fn from_sigma_guess(sigma_guess: f64, sample_size: f64) -> Result<Self> {
        let alpha = sample_size / 2.0;
        Self::new(alpha, alpha * sigma_guess * sigma_guess)
    }

    pub fn alpha(&self) -> f64 {
        self.alpha
    }

    pub fn beta(&self) -> f64 {
        self.beta
    }

    pub fn logp(&self, x: f64) -> f64 {
        if x <= 0.0 {
            return f64::NEG_INFINITY;
        }
        self.alpha * self.beta.ln() - ln_gamma(self.alpha) + (self.alpha - 1.0) * x.ln()
            - self.beta * x
    }
}

#[derive(Debug, Clone, Copy)]
pub struct GaussianVarianceSampler {
    prior: GammaPrior,
    sigma_max: f64,
}

impl GaussianVarianceSampler {
    pub fn new(prior: GammaPrior) -> Self {
        Self {
            prior,
            sigma_max: f64::INFINITY,
        }
    }

    pub fn with_sigma_max(prior: GammaPrior, sigma_max: f64) -> Result<Self> {
        let mut s = Self::new(prior);
        s.set_sigma_max(sigma_max)?;
        Ok(s)
    }

    pub fn set_sigma_max(&mut self, sigma_max: f64) -> Result<()> {
        if sigma_max.is_nan() || sigma_max < 0.0 {
            return Err(StateSpaceError::Configuration(format!(
                "sigma_max must be non-negative, got {}",
                sigma_max
            )));
        }
        self.sigma_max = sigma_max;
        Ok(())
    }

    pub fn prior(&self) -> &GammaPrior {
        &self.prior
    }

    pub fn sigma_max(&self) -> f64 {
        self.sigma_max
    }

    fn posterior_shape_rate(&self, data_df: f64, data_ss: f64) -> (f64, f64) {
        let df = data_df + 2.0 * self.prior.alpha;
        let ss = data_ss + 2.0 * self.prior.beta;
        (df / 2.0, ss / 2.0)
    }

    /// Draw sigsq from its posterior given `data_df` observations with sum
    /// of squares `data_ss`.
    pub fn draw(&self, rng: &mut dyn RngCore, data_df: f64, data_ss: f64) -> Result<f64> {
        if self.sigma_max == 0.0 {
            return Ok(0.0);
        }
        let (shape, rate) = self.posterior_shape_rate(data_df, data_ss);
        if self.sigma_max.is_infinite() {
            let gamma = Gamma::new(shape, 1.0 / rate).map_err(|e| {
                StateSpaceError::Configuration(format!("invalid posterior gamma: {}", e))
            })?;
            let precision: f64 = gamma.sample(&mut *rng);
            return Ok(1.0 / precision);
        }

        // Precision truncated below at 1 / sigma_max^2, drawn by inversion.
        let lower = 1.0 / (self.sigma_max * self.sigma_max);
        let dist = GammaDist::new(shape, rate).map_err(|e| {
            StateSpaceError::Configuration(format!("invalid posterior gamma: {}", e))
        })?;
        let p_lo = dist.cdf(lower);
        let u: f64 = rng.gen_range(0.0..1.0);
        let precision = dist.inverse_cdf(p_lo + u * (1.0 - p_lo));
        let precision = if precision.is_finite() && precision >= lower {
            precision
        } else {
            lower
        };
        Ok(1.0 / precision)
    }

    /// Mode of the inverse-gamma posterior, capped at sigma_max^2.
    pub fn posterior_mode(&self, data_df: f64, data_ss: f64) -> f64 {
        let (shape, rate) = self.posterior_shape_rate(data_df, data_ss);
        let mode = rate / (shape + 1.0);
        mode.min(self.sigma_max * self.sigma_max)
    }

    /// Log prior density of sigsq, including the Jacobian of 1/sigsq.
    pub fn log_prior(&self, sigsq: f64) -> f64 {
        if !(sigsq > 0.0) || sigsq > self.sigma_max * self.sigma_max {
            return f64::NEG_INFINITY;
        }
        self.prior.logp(1.0 / sigsq) - 2.0 * sigsq.ln()
    }
}

/// A variance parameter together with its complete-data sufficient
/// statistics and optional conjugate prior.
///
/// Client models own one of these per error variance.
#[derive(Debug, Clone)]
pub struct VarianceParameter {
    sigsq: UnivParam,
    suf: GaussianSuf,
    sampler: Option<GaussianVarianceSampler>,
}

impl VarianceParameter {
    pub fn new(sigsq: f64) -> Result<Self> {
        check_variance(sigsq)?;
        Ok(Self {
            sigsq: UnivParam::new(sigsq),
            suf: GaussianSuf::new(),
            sampler: None,
        })
    }

    pub fn value(&self) -> f64 {
        self.sigsq.value()
    }

    pub fn set(&mut self, sigsq: f64) -> Result<()> {
        check_variance(sigsq)?;
        self.sigsq.set(sigsq);
        Ok(())
    }

    pub fn set_prior(&mut self, sampler: GaussianVarianceSampler) {
        self.sampler = Some(sampler);
    }

    pub fn sampler(&self) -> Option<&GaussianVarianceSampler> {
        self.sampler.as_ref()
    }

    pub fn add_observer(&mut self, observer: ChangeObserver) {
        self.sigsq.add_observer(observer);
    }

    pub fn suf(&self) -> &GaussianSuf {
        &self.suf
    }

    pub fn clear_data(&mut self) {
        self.suf.clear();
    }

    /// Record a realised error.
    pub fn observe(&mut self, error: f64) {
        self.suf.add(error);
    }

    /// Record the smoothed moments of an error.
    pub fn observe_expected(&mut self, mean: f64, variance: f64) {
        self.suf.add_expected(mean, variance);
    }

    pub fn log_prior(&self) -> f64 {
        match &self.sampler {
            Some(s) => s.log_prior(self.value()),
            None => 0.0,
        }
    }

    /// Expected complete-data score for one error with the given moments.
    pub fn expected_score(&self, mean: f64, variance: f64) -> f64 {
        expected_variance_score(self.value(), mean, variance)
    }

    pub fn bounds(&self) -> (f64, f64) {
        match &self.sampler {
            Some(s) if s.sigma_max().is_finite() => (0.0, s.sigma_max() * s.sigma_max()),
            _ => (0.0, f64::INFINITY),
        }
    }

    /// Set the value to its complete-data posterior mode, or to the
    /// complete-data MLE when there is no prior.  Without data or a prior
    /// the value is left alone.
    pub fn find_posterior_mode(&mut self) -> Result<()> {
        let (n, ss) = (self.suf.n(), self.suf.sumsq());
        let mode = match &self.sampler {
            Some(s) => s.posterior_mode(n, ss),
            None if n > 0.0 => ss / n,
            None => return Ok(()),
        };
        self.set(mode)
    }

    pub fn sample_posterior(&mut self, rng: &mut dyn RngCore) -> Result<()> {
        let sampler = self.sampler.ok_or_else(|| {
            StateSpaceError::Configuration("no prior set for variance parameter".into())
        })?;
        let draw = sampler.draw(rng, self.suf.n(), self.suf.sumsq())?;
        self.set(draw)
    }
}

fn check_variance(sigsq: f64) -> Result<()> {
    if !(sigsq >= 0.0 && sigsq.is_finite()) {
        return Err(StateSpaceError::Configuration(format!(
            "variance must be non-negative and finite, got {}",
            sigsq
        )));
    }
    Ok(())
}
