use std::fmt::Debug;

use rand::RngCore;

use crate::error::{Result, StateSpaceError};
use crate::observer::{ChangeObserver, Observers};
use crate::state_models::check_param_length;
use crate::variance_sampler::{GaussianVarianceSampler, VarianceParameter};

/// The model for y[t] given the state contribution Z[t]' alpha[t].
pub trait ObservationModel: Send + Debug {
    fn time_dimension(&self) -> usize;

    /// H[t].  Must be answerable for t past the end of the data.
    fn observation_variance(&self, t: usize) -> f64;

    /// y[t] adjusted for anything not in the state.  +inf when missing.
    fn adjusted_observation(&self, t: usize) -> f64;
    fn is_missing_observation(&self, t: usize) -> bool;

    /// Record the observation error implied by an imputed state.
    fn observe_data_given_state(&mut self, t: usize, state_contribution: f64);
    fn clear_data(&mut self);

    fn parameter_dimension(&self) -> usize;
    fn vectorize_params(&self) -> Vec<f64>;
    fn unvectorize_params(&mut self, params: &[f64]) -> Result<()>;
    fn parameter_bounds(&self) -> Vec<(f64, f64)>;
    /// Attach `observer` to every parameter and to the data.
    fn observe_params(&mut self, observer: ChangeObserver);

    /// Add smoothed moments of eps[t] to the complete-data statistics.
    fn update_complete_data_sufficient_statistics(&mut self, t: usize, mean: f64, variance: f64);

    /// Add d/dtheta E log p(eps[t]) to `gradient` (length parameter_dimension).
    fn increment_expected_gradient(&self, gradient: &mut [f64], t: usize, mean: f64, variance: f64);

    fn log_prior(&self) -> f64 {
        0.0
    }

    fn can_find_posterior_mode(&self) -> bool {
        false
    }

    fn find_posterior_mode(&mut self, epsilon: f64) -> Result<()>;
    fn sample_posterior(&mut self, rng: &mut dyn RngCore) -> Result<()>;
}

/// y[t] = Z[t]' alpha[t] + eps[t], eps[t] ~ N(0, sigsq).
#[derive(Debug, Clone)]
pub struct GaussianObservationModel {
    y: Vec<f64>,
    missing: Vec<bool>,
    sigsq: VarianceParameter,
    data_observers: Observers,
}

impl GaussianObservationModel {
    /// Non-finite entries of `y` are treated as missing.
    pub fn new(y: Vec<f64>, sigsq: f64) -> Result<Self> {
        let missing = y.iter().map(|v| !v.is_finite()).collect();
        Ok(Self {
            y,
            missing,
            sigsq: VarianceParameter::new(sigsq)?,
            data_observers: Observers::new(),
        })
    }

    pub fn sigsq(&self) -> f64 {
        self.sigsq.value()
    }

    pub fn set_sigsq(&mut self, sigsq: f64) -> Result<()> {
        self.sigsq.set(sigsq)
    }

    pub fn set_prior(&mut self, sampler: GaussianVarianceSampler) {
        self.sigsq.set_prior(sampler);
    }

    pub fn observations(&self) -> &[f64] {
        &self.y
    }

    pub fn suf(&self) -> &crate::suf::GaussianSuf {
        self.sigsq.suf()
    }

    fn check_time(&self, t: usize) -> Result<()> {
        if t >= self.y.len() {
            return Err(StateSpaceError::DataError(format!(
                "time index {} out of range for {} observations",
                t,
                self.y.len()
            )));
        }
        Ok(())
    }

    /// Replace y[t].  A non-finite value marks the point missing.
    pub fn set_observation(&mut self, t: usize, y: f64) -> Result<()> {
        self.check_time(t)?;
        self.y[t] = y;
        self.missing[t] = !y.is_finite();
        self.data_observers.notify();
        Ok(())
    }

    pub fn set_missing(&mut self, t: usize, missing: bool) -> Result<()> {
        self.check_time(t)?;
        if !missing && !self.y[t].is_finite() {
            return Err(StateSpaceError::DataError(format!(
                "cannot mark non-finite observation {} at t = {} as observed",
                self.y[t], t
            )));
        }
        if self.missing[t] != missing {
            self.missing[t] = missing;
            self.data_observers.notify();
        }
        Ok(())
    }
}

impl ObservationModel for GaussianObservationModel {
    fn time_dimension(&self) -> usize {
        self.y.len()
    }

    fn observation_variance(&self, _t: usize) -> f64 {
        self.sigsq.value()
    }

    fn adjusted_observation(&self, t: usize) -> f64 {
        if self.is_missing_observation(t) {
            f64::INFINITY
        } else {
            self.y[t]
        }
    }

    fn is_missing_observation(&self, t: usize) -> bool {
        self.missing.get(t).copied().unwrap_or(true)
    }

    fn observe_data_given_state(&mut self, t: usize, state_contribution: f64) {
        if !self.is_missing_observation(t) {
            self.sigsq.observe(self.y[t] - state_contribution);
        }
    }

    fn clear_data(&mut self) {
        self.sigsq.clear_data();
    }

    fn parameter_dimension(&self) -> usize {
        1
    }
    fn vectorize_params(&self) -> Vec<f64> {
        vec![self.sigsq.value()]
    }
    fn unvectorize_params(&mut self, params: &[f64]) -> Result<()> {
        check_param_length(params, 1)?;
        self.sigsq.set(params[0])
    }
    fn parameter_bounds(&self) -> Vec<(f64, f64)> {
        vec![self.sigsq.bounds()]
    }
    fn observe_params(&mut self, observer: ChangeObserver) {
        self.sigsq.add_observer(observer.clone());
        self.data_observers.add(observer);
    }

    fn update_complete_data_sufficient_statistics(&mut self, _t: usize, mean: f64, variance: f64) {
        self.sigsq.observe_expected(mean, variance);
    }

    fn increment_expected_gradient(&self, gradient: &mut [f64], _t: usize, mean: f64, variance: f64) {
        gradient[0] += self.sigsq.expected_score(mean, variance);
    }

    fn log_prior(&self) -> f64 {
        self.sigsq.log_prior()
    }

    fn can_find_posterior_mode(&self) -> bool {
        true
    }

    fn find_posterior_mode(&mut self, _epsilon: f64) -> Result<()> {
        self.sigsq.find_posterior_mode()
    }

    fn sample_posterior(&mut self, rng: &mut dyn RngCore) -> Result<()> {
        self.sigsq.sample_posterior(rng)
    }
}
