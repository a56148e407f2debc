//! Client state models.
//!
//! A state model owns one block of the state vector: its slice of the
//! transition, variance and observation matrices, its initial distribution,
//! and the parameters and complete-data sufficient statistics for that
//! block.  The state space model composes them block-diagonally.

mod local_level;
mod local_linear_trend;
mod seasonal;

pub use local_level::LocalLevelStateModel;
pub use local_linear_trend::LocalLinearTrendStateModel;
pub use seasonal::SeasonalStateModel;

use std::fmt::Debug;
use std::sync::Arc;

use nalgebra::{DMatrix, DVector};
use rand::RngCore;

use crate::error::Result;
use crate::observer::ChangeObserver;
use crate::simulation::rmvn;
use crate::sparse::{SparseKalmanMatrix, SparseVector};
use crate::types::Behavior;

pub trait StateModel: Send + Debug {
    fn state_dimension(&self) -> usize;
    fn state_error_dimension(&self) -> usize;

    /// T[t] for this block.
    fn state_transition_matrix(&self, t: usize) -> Arc<dyn SparseKalmanMatrix>;
    /// R[t] Q[t] R[t]' for this block.
    fn state_variance_matrix(&self, t: usize) -> Arc<dyn SparseKalmanMatrix>;
    /// R[t]: state_dimension x state_error_dimension.
    fn state_error_expander(&self, t: usize) -> Arc<dyn SparseKalmanMatrix>;
    /// Q[t]: state_error_dimension square.
    fn state_error_variance(&self, t: usize) -> Arc<dyn SparseKalmanMatrix>;
    /// This block's slice of Z[t].
    fn observation_matrix(&self, t: usize) -> SparseVector;

    fn initial_state_mean(&self) -> DVector<f64>;
    fn initial_state_variance(&self) -> DMatrix<f64>;

    fn simulate_initial_state(&self, rng: &mut dyn RngCore) -> Result<DVector<f64>> {
        rmvn(rng, &self.initial_state_mean(), &self.initial_state_variance())
    }

    /// Draw eta[t] ~ N(0, Q[t]).
    fn simulate_state_error(&self, rng: &mut dyn RngCore, t: usize) -> Result<DVector<f64>> {
        let q = self.state_error_variance(t).dense();
        rmvn(rng, &DVector::zeros(q.nrows()), &q)
    }

    /// Record the transition from `then` (time t-1) to `now` (time t).
    fn observe_state(&mut self, then: &DVector<f64>, now: &DVector<f64>, t: usize);
    fn observe_initial_state(&mut self, _state: &DVector<f64>) {}
    fn clear_data(&mut self);

    fn set_behavior(&mut self, behavior: Behavior);
    fn behavior(&self) -> Behavior;

    fn parameter_dimension(&self) -> usize;
    fn vectorize_params(&self) -> Vec<f64>;
    fn unvectorize_params(&mut self, params: &[f64]) -> Result<()>;
    /// (lower, upper) per parameter, in `vectorize_params` order.
    fn parameter_bounds(&self) -> Vec<(f64, f64)>;
    /// Attach `observer` to every parameter of this model.
    fn observe_params(&mut self, observer: ChangeObserver);

    /// Add the smoothed moments of eta[t] to the complete-data statistics.
    fn update_complete_data_sufficient_statistics(
        &mut self,
        t: usize,
        state_error_mean: &DVector<f64>,
        state_error_variance: &DMatrix<f64>,
    );

    /// Add d/dtheta E log p(eta[t]) to `gradient` (length parameter_dimension).
    fn increment_expected_gradient(
        &self,
        gradient: &mut [f64],
        t: usize,
        state_error_mean: &DVector<f64>,
        state_error_variance: &DMatrix<f64>,
    );

    fn log_prior(&self) -> f64 {
        0.0
    }

    fn can_find_posterior_mode(&self) -> bool {
        false
    }

    /// M-step: maximise the complete-data log posterior.
    fn find_posterior_mode(&mut self, epsilon: f64) -> Result<()>;

    /// Draw parameters given the complete-data statistics.
    fn sample_posterior(&mut self, rng: &mut dyn RngCore) -> Result<()>;

    fn check_configuration(&self) -> Result<()> {
        Ok(())
    }
}

/// Check a parameter vector's length against what a model expects.
pub(crate) fn check_param_length(params: &[f64], expected: usize) -> Result<()> {
    if params.len() != expected {
        return Err(crate::error::StateSpaceError::ParamLengthMismatch {
            expected,
            got: params.len(),
        });
    }
    Ok(())
}
