use std::sync::Arc;

use nalgebra::{DMatrix, DVector};
use rand::RngCore;

use super::{check_param_length, StateModel};
use crate::error::Result;
use crate::initialization::InitialStateDistribution;
use crate::observer::ChangeObserver;
use crate::sparse::{DenseMatrix, DiagonalMatrix, IdentityMatrix, SparseKalmanMatrix, SparseVector};
use crate::types::Behavior;
use crate::variance_sampler::{GaussianVarianceSampler, VarianceParameter};

/// Level and slope:
///
///   mu[t+1]    = mu[t] + delta[t] + eta0[t]
///   delta[t+1] = delta[t] + eta1[t]
#[derive(Debug, Clone)]
pub struct LocalLinearTrendStateModel {
    level: VarianceParameter,
    slope: VarianceParameter,
    initial: InitialStateDistribution,
    behavior: Behavior,
}

impl LocalLinearTrendStateModel {
    pub fn new(level_sigsq: f64, slope_sigsq: f64) -> Result<Self> {
        Ok(Self {
            level: VarianceParameter::new(level_sigsq)?,
            slope: VarianceParameter::new(slope_sigsq)?,
            initial: InitialStateDistribution::approximate_diffuse(
                2,
                InitialStateDistribution::default_kappa(),
            ),
            behavior: Behavior::default(),
        })
    }

    pub fn level_sigsq(&self) -> f64 {
        self.level.value()
    }

    pub fn slope_sigsq(&self) -> f64 {
        self.slope.value()
    }

    pub fn set_initial_state(&mut self, initial: InitialStateDistribution) -> Result<()> {
        if initial.dimension() != 2 {
            return Err(crate::error::StateSpaceError::DimensionMismatch(format!(
                "local linear trend needs a 2-dimensional initial state, got {}",
                initial.dimension()
            )));
        }
        self.initial = initial;
        Ok(())
    }

    pub fn set_level_prior(&mut self, sampler: GaussianVarianceSampler) {
        self.level.set_prior(sampler);
    }

    pub fn set_slope_prior(&mut self, sampler: GaussianVarianceSampler) {
        self.slope.set_prior(sampler);
    }

    fn diagonal(&self) -> DVector<f64> {
        DVector::from_vec(vec![self.level.value(), self.slope.value()])
    }
}

impl StateModel for LocalLinearTrendStateModel {
    fn state_dimension(&self) -> usize {
        2
    }
    fn state_error_dimension(&self) -> usize {
        2
    }
    fn state_transition_matrix(&self, _t: usize) -> Arc<dyn SparseKalmanMatrix> {
        Arc::new(DenseMatrix::new(DMatrix::from_row_slice(
            2,
            2,
            &[1.0, 1.0, 0.0, 1.0],
        )))
    }
    fn state_variance_matrix(&self, _t: usize) -> Arc<dyn SparseKalmanMatrix> {
        Arc::new(DiagonalMatrix::new(self.diagonal()))
    }
    fn state_error_expander(&self, _t: usize) -> Arc<dyn SparseKalmanMatrix> {
        Arc::new(IdentityMatrix::new(2))
    }
    fn state_error_variance(&self, _t: usize) -> Arc<dyn SparseKalmanMatrix> {
        Arc::new(DiagonalMatrix::new(self.diagonal()))
    }
    fn observation_matrix(&self, _t: usize) -> SparseVector {
        SparseVector::unit(2, 0)
    }

    fn initial_state_mean(&self) -> DVector<f64> {
        self.initial.mean.clone()
    }
    fn initial_state_variance(&self) -> DMatrix<f64> {
        self.initial.variance.clone()
    }

    fn observe_state(&mut self, then: &DVector<f64>, now: &DVector<f64>, _t: usize) {
        self.level.observe(now[0] - then[0] - then[1]);
        self.slope.observe(now[1] - then[1]);
    }

    fn clear_data(&mut self) {
        self.level.clear_data();
        self.slope.clear_data();
    }

    fn set_behavior(&mut self, behavior: Behavior) {
        self.behavior = behavior;
    }
    fn behavior(&self) -> Behavior {
        self.behavior
    }

    fn parameter_dimension(&self) -> usize {
        2
    }
    fn vectorize_params(&self) -> Vec<f64> {
        vec![self.level.value(), self.slope.value()]
    }
    fn unvectorize_params(&mut self, params: &[f64]) -> Result<()> {
        check_param_length(params, 2)?;
        self.level.set(params[0])?;
        self.slope.set(params[1])
    }
    fn parameter_bounds(&self) -> Vec<(f64, f64)> {
        vec![self.level.bounds(), self.slope.bounds()]
    }
    fn observe_params(&mut self, observer: ChangeObserver) {
        self.level.add_observer(observer.clone());
        self.slope.add_observer(observer);
    }

    fn update_complete_data_sufficient_statistics(
        &mut self,
        _t: usize,
        mean: &DVector<f64>,
        variance: &DMatrix<f64>,
    ) {
        self.level.observe_expected(mean[0], variance[(0, 0)]);
        self.slope.observe_expected(mean[1], variance[(1, 1)]);
    }

    fn increment_expected_gradient(
        &self,
        gradient: &mut [f64],
        _t: usize,
        mean: &DVector<f64>,
        variance: &DMatrix<f64>,
    ) {
        gradient[0] += self.level.expected_score(mean[0], variance[(0, 0)]);
        gradient[1] += self.slope.expected_score(mean[1], variance[(1, 1)]);
    }

    fn log_prior(&self) -> f64 {
        self.level.log_prior() + self.slope.log_prior()
    }

    fn can_find_posterior_mode(&self) -> bool {
        true
    }

    fn find_posterior_mode(&mut self, _epsilon: f64) -> Result<()> {
        self.level.find_posterior_mode()?;
        self.slope.find_posterior_mode()
    }

    fn sample_posterior(&mut self, rng: &mut dyn RngCore) -> Result<()> {
        self.level.sample_posterior(rng)?;
        self.slope.sample_posterior(rng)
    }
}
