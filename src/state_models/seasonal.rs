use std::sync::Arc;

use nalgebra::{DMatrix, DVector};
use rand::RngCore;

use super::{check_param_length, StateModel};
use crate::error::{Result, StateSpaceError};
use crate::initialization::InitialStateDistribution;
use crate::observer::ChangeObserver;
use crate::sparse::{
    ConstantMatrix, SeasonalStateMatrix, SparseKalmanMatrix, SparseVector, UpperLeftCornerMatrix,
};
use crate::types::Behavior;
use crate::variance_sampler::{GaussianVarianceSampler, VarianceParameter};

/// Dummy-variable seasonal: the S seasonal effects sum to a N(0, sigsq)
/// error.  The state holds the most recent S-1 effects and only the first
/// element receives an error, so R[t] is a single column.
#[derive(Debug, Clone)]
pub struct SeasonalStateModel {
    nseasons: usize,
    sigsq: VarianceParameter,
    initial: InitialStateDistribution,
    behavior: Behavior,
}

impl SeasonalStateModel {
    pub fn new(nseasons: usize, sigsq: f64) -> Result<Self> {
        if nseasons < 2 {
            return Err(StateSpaceError::Configuration(format!(
                "a seasonal model needs at least 2 seasons, got {}",
                nseasons
            )));
        }
        Ok(Self {
            nseasons,
            sigsq: VarianceParameter::new(sigsq)?,
            initial: InitialStateDistribution::approximate_diffuse(
                nseasons - 1,
                InitialStateDistribution::default_kappa(),
            ),
            behavior: Behavior::default(),
        })
    }

    pub fn nseasons(&self) -> usize {
        self.nseasons
    }

    pub fn sigsq(&self) -> f64 {
        self.sigsq.value()
    }

    pub fn set_initial_state(&mut self, initial: InitialStateDistribution) -> Result<()> {
        if initial.dimension() != self.nseasons - 1 {
            return Err(StateSpaceError::DimensionMismatch(format!(
                "seasonal model with {} seasons needs a {}-dimensional initial state, got {}",
                self.nseasons,
                self.nseasons - 1,
                initial.dimension()
            )));
        }
        self.initial = initial;
        Ok(())
    }

    pub fn set_prior(&mut self, sampler: GaussianVarianceSampler) {
        self.sigsq.set_prior(sampler);
    }

    fn dim(&self) -> usize {
        self.nseasons - 1
    }
}

impl StateModel for SeasonalStateModel {
    fn state_dimension(&self) -> usize {
        self.dim()
    }
    fn state_error_dimension(&self) -> usize {
        1
    }
    fn state_transition_matrix(&self, _t: usize) -> Arc<dyn SparseKalmanMatrix> {
        Arc::new(SeasonalStateMatrix::new(self.dim()))
    }
    fn state_variance_matrix(&self, _t: usize) -> Arc<dyn SparseKalmanMatrix> {
        Arc::new(UpperLeftCornerMatrix::new(self.dim(), self.dim(), self.sigsq.value()))
    }
    fn state_error_expander(&self, _t: usize) -> Arc<dyn SparseKalmanMatrix> {
        Arc::new(UpperLeftCornerMatrix::new(self.dim(), 1, 1.0))
    }
    fn state_error_variance(&self, _t: usize) -> Arc<dyn SparseKalmanMatrix> {
        Arc::new(ConstantMatrix::new(1, self.sigsq.value()))
    }
    fn observation_matrix(&self, _t: usize) -> SparseVector {
        SparseVector::unit(self.dim(), 0)
    }

    fn initial_state_mean(&self) -> DVector<f64> {
        self.initial.mean.clone()
    }
    fn initial_state_variance(&self) -> DMatrix<f64> {
        self.initial.variance.clone()
    }

    fn observe_state(&mut self, then: &DVector<f64>, now: &DVector<f64>, _t: usize) {
        // now[0] = -sum(then) + eta
        self.sigsq.observe(now[0] + then.sum());
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_requires_two_seasons() {
        assert!(matches!(
            SeasonalStateModel::new(1, 1.0),
            Err(StateSpaceError::Configuration(_))
        ));
    }

    #[test]
    fn test_rank_deficient_variance() {
        let m = SeasonalStateModel::new(4, 0.3).unwrap();
        assert_eq!(m.state_dimension(), 3);
        assert_eq!(m.state_error_dimension(), 1);
        let r = m.state_error_expander(0).dense();
        let q = m.state_error_variance(0).dense();
        let rqr = &r * &q * r.transpose();
        let expected = m.state_variance_matrix(0).dense();
        for i in 0..3 {
            for j in 0..3 {
                assert!((rqr[(i, j)] - expected[(i, j)]).abs() < 1e-15);
            }
        }
    }

    #[test]
    fn test_seasonal_cycle() {
        // With no error the pattern repeats every S periods.
        let m = SeasonalStateModel::new(3, 0.0).unwrap();
        let tm = m.state_transition_matrix(0);
        let s0 = DVector::from_vec(vec![1.0, 2.0]);
        let s1 = tm.multiply(&s0);
        let s2 = tm.multiply(&s1);
        let s3 = tm.multiply(&s2);
        assert!((s1[0] + 3.0).abs() < 1e-15);
        for i in 0..2 {
            assert!((s3[i] - s0[i]).abs() < 1e-15);
        }
    }

    #[test]
    fn test_observe_state_error() {
        let mut m = SeasonalStateModel::new(3, 1.0).unwrap();
        let then = DVector::from_vec(vec![1.0, 2.0]);
        let now = DVector::from_vec(vec![-2.5, 1.0]);
        m.observe_state(&then, &now, 1);
        m.find_posterior_mode(1e-5).unwrap();
        assert!((m.sigsq() - 0.25).abs() < 1e-12);
    }
}
