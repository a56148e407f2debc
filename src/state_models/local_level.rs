use std::sync::Arc;

use nalgebra::{DMatrix, DVector};
use rand::RngCore;

use super::{check_param_length, StateModel};
use crate::error::Result;
use crate::initialization::InitialStateDistribution;
use crate::observer::ChangeObserver;
use crate::sparse::{ConstantMatrix, IdentityMatrix, SparseKalmanMatrix, SparseVector};
use crate::types::Behavior;
use crate::variance_sampler::{GaussianVarianceSampler, VarianceParameter};

/// Random walk level: mu[t+1] = mu[t] + eta[t], eta[t] ~ N(0, sigsq).
#[derive(Debug, Clone)]
pub struct LocalLevelStateModel {
    sigsq: VarianceParameter,
    initial: InitialStateDistribution,
    behavior: Behavior,
}

impl LocalLevelStateModel {
    pub fn new(sigsq: f64) -> Result<Self> {
        Ok(Self {
            sigsq: VarianceParameter::new(sigsq)?,
            initial: InitialStateDistribution::approximate_diffuse(
                1,
                InitialStateDistribution::default_kappa(),
            ),
            behavior: Behavior::default(),
        })
    }

    pub fn sigsq(&self) -> f64 {
        self.sigsq.value()
    }

    pub fn set_sigsq(&mut self, sigsq: f64) -> Result<()> {
        self.sigsq.set(sigsq)
    }

    pub fn set_initial_state(&mut self, mean: f64, variance: f64) -> Result<()> {
        self.initial = InitialStateDistribution::scalar(mean, variance)?;
        Ok(())
    }

    pub fn set_prior(&mut self, sampler: GaussianVarianceSampler) {
        self.sigsq.set_prior(sampler);
    }

    pub fn suf(&self) -> &crate::suf::GaussianSuf {
        self.sigsq.suf()
    }
}

impl StateModel for LocalLevelStateModel {
    fn state_dimension(&self) -> usize {
        1
    }
    fn state_error_dimension(&self) -> usize {
        1
    }
    fn state_transition_matrix(&self, _t: usize) -> Arc<dyn SparseKalmanMatrix> {
        Arc::new(IdentityMatrix::new(1))
    }
    fn state_variance_matrix(&self, _t: usize) -> Arc<dyn SparseKalmanMatrix> {
        Arc::new(ConstantMatrix::new(1, self.sigsq.value()))
    }
    fn state_error_expander(&self, _t: usize) -> Arc<dyn SparseKalmanMatrix> {
        Arc::new(IdentityMatrix::new(1))
    }
    fn state_error_variance(&self, _t: usize) -> Arc<dyn SparseKalmanMatrix> {
        Arc::new(ConstantMatrix::new(1, self.sigsq.value()))
    }
    fn observation_matrix(&self, _t: usize) -> SparseVector {
        SparseVector::unit(1, 0)
    }

    fn initial_state_mean(&self) -> DVector<f64> {
        self.initial.mean.clone()
    }
    fn initial_state_variance(&self) -> DMatrix<f64> {
        self.initial.variance.clone()
    }

    fn observe_state(&mut self, then: &DVector<f64>, now: &DVector<f64>, _t: usize) {
        self.sigsq.observe(now[0] - then[0]);
    }

    fn clear_data(&mut self) {
        self.sigsq.clear_data();
    }

    fn set_behavior(&mut self, behavior: Behavior) {
        self.behavior = behavior;
    }
    fn behavior(&self) -> Behavior {
        self.behavior
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
        self.sigsq.add_observer(observer);
    }

    fn update_complete_data_sufficient_statistics(
        &mut self,
        _t: usize,
        mean: &DVector<f64>,
        variance: &DMatrix<f64>,
    ) {
        self.sigsq.observe_expected(mean[0], variance[(0, 0)]);
    }

    fn increment_expected_gradient(
        &self,
        gradient: &mut [f64],
        _t: usize,
        mean: &DVector<f64>,
        variance: &DMatrix<f64>,
    ) {
        gradient[0] += self.sigsq.expected_score(mean[0], variance[(0, 0)]);
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
