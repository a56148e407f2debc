use std::cell::{Cell, RefCell};
use std::fmt;
use std::sync::Arc;

use log::debug;
use nalgebra::{DMatrix, DVector};
use rand::RngCore;

use crate::error::{Result, StateSpaceError};
use crate::kalman::{self, FilterOutput, KalmanStorage, KalmanSystem};
use crate::observation::{GaussianObservationModel, ObservationModel};
use crate::observer::ChangeCounter;
use crate::simulation;
use crate::smoother::{full_smoother, SmootherOutput};
use crate::sparse::{BlockDiagonalMatrix, SparseKalmanMatrix, SparseVector};
use crate::state_models::StateModel;
use crate::types::{Behavior, CompleteDataEvent};

/// Callback notified when the latent data behind an observation changes.
pub type DataObserver = Box<dyn FnMut(CompleteDataEvent) + Send>;

/// Filter and smoother output, each stamped with the parameter generation
/// it was computed at.
#[derive(Default)]
struct FilterCache {
    summary: Option<(u64, FilterOutput)>,
    full: Option<(u64, FilterOutput, Vec<KalmanStorage>)>,
    smoother: Option<(u64, SmootherOutput)>,
}

/// Linear Gaussian state space model with scalar observations, assembled
/// from an observation model and an ordered list of state models.
///
/// State equation:  alpha[t+1] = T[t] alpha[t] + R[t] eta[t]
/// Observation:     y[t]       = Z[t]' alpha[t] + eps[t]
///
/// T, R, Q and Z are block diagonal across state models.  Filter output is
/// cached and recomputed only after a parameter or datum has changed.
pub struct StateSpaceModel<O: ObservationModel = GaussianObservationModel> {
    observation_model: O,
    state_models: Vec<Box<dyn StateModel>>,
    state_positions: Vec<usize>,
    state_error_positions: Vec<usize>,
    state_dimension: usize,
    state_error_dimension: usize,

    changes: ChangeCounter,
    cache: RefCell<FilterCache>,
    filter_started: Cell<bool>,

    state: DMatrix<f64>,
    state_is_fixed: bool,
    data_observers: Vec<DataObserver>,
}

impl<O: ObservationModel> fmt::Debug for StateSpaceModel<O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateSpaceModel")
            .field("observation_model", &self.observation_model)
            .field("state_models", &self.state_models)
            .field("state_positions", &self.state_positions)
            .field("state_dimension", &self.state_dimension)
            .field("generation", &self.changes.current())
            .field("state_is_fixed", &self.state_is_fixed)
            .field("data_observers", &self.data_observers.len())
            .finish()
    }
}

impl<O: ObservationModel> StateSpaceModel<O> {
    pub fn new(mut observation_model: O) -> Self {
        let changes = ChangeCounter::new();
        observation_model.observe_params(changes.observer());
        Self {
            observation_model,
            state_models: Vec::new(),
            state_positions: Vec::new(),
            state_error_positions: Vec::new(),
            state_dimension: 0,
            state_error_dimension: 0,
            changes,
            cache: RefCell::new(FilterCache::default()),
            filter_started: Cell::new(false),
            state: DMatrix::zeros(0, 0),
            state_is_fixed: false,
            data_observers: Vec::new(),
        }
    }

    /// Append a state model.  Its block follows every block added before it.
    ///
    /// Fails once any filter has run, if the model reports an incomplete
    /// configuration, or if its matrices do not agree with its declared
    /// dimensions.  The stored state is reset to zeros of the new shape and
    /// is no longer fixed.
    pub fn add_state(&mut self, mut model: Box<dyn StateModel>) -> Result<()> {
        if self.filter_started.get() {
            return Err(StateSpaceError::Configuration(
                "state models cannot be added after the Kalman filter has run".into(),
            ));
        }
        model.check_configuration()?;
        validate_state_model(model.as_ref())?;

        model.observe_params(self.changes.observer());
        self.state_positions.push(self.state_dimension);
        self.state_error_positions.push(self.state_error_dimension);
        self.state_dimension += model.state_dimension();
        self.state_error_dimension += model.state_error_dimension();
        self.state_models.push(model);
        // A fixed state of the old shape no longer describes the model.
        self.state = DMatrix::zeros(self.state_dimension, self.time_dimension());
        self.state_is_fixed = false;
        self.changes.bump();
        Ok(())
    }

    // ------------------------------------------------------------------
    // Layout
    // ------------------------------------------------------------------

    pub fn nstate(&self) -> usize {
        self.state_models.len()
    }

    pub fn state_dimension(&self) -> usize {
        self.state_dimension
    }

    pub fn state_error_dimension(&self) -> usize {
        self.state_error_dimension
    }

    pub fn time_dimension(&self) -> usize {
        self.observation_model.time_dimension()
    }

    pub fn state_positions(&self) -> &[usize] {
        &self.state_positions
    }

    pub fn state_error_positions(&self) -> &[usize] {
        &self.state_error_positions
    }

    /// Panics if `s >= nstate()`.
    pub fn state_model(&self, s: usize) -> &dyn StateModel {
        self.state_models[s].as_ref()
    }

    /// Mutable access to state model `s`.  Cached filter output is
    /// invalidated, since changes made through the returned reference are
    /// not all observable.  Panics if `s >= nstate()`.
    pub fn state_model_mut(&mut self, s: usize) -> &mut dyn StateModel {
        self.changes.bump();
        self.state_models[s].as_mut()
    }

    pub fn state_models(&self) -> impl Iterator<Item = &dyn StateModel> {
        self.state_models.iter().map(|m| m.as_ref())
    }

    pub fn observation_model(&self) -> &O {
        &self.observation_model
    }

    /// Mutable access to the observation model.  Invalidates cached filter
    /// output.
    pub fn observation_model_mut(&mut self) -> &mut O {
        self.changes.bump();
        &mut self.observation_model
    }

    pub(crate) fn models_mut(&mut self) -> (&mut O, &mut [Box<dyn StateModel>]) {
        (&mut self.observation_model, &mut self.state_models)
    }

    // ------------------------------------------------------------------
    // Parameters
    // ------------------------------------------------------------------

    pub fn parameter_dimension(&self) -> usize {
        self.observation_model.parameter_dimension()
            + self
                .state_models
                .iter()
                .map(|m| m.parameter_dimension())
                .sum::<usize>()
    }

    /// Offset of each state model's slice in the parameter vector.  The
    /// observation model's parameters come first.
    pub fn parameter_positions(&self) -> Vec<usize> {
        let mut pos = self.observation_model.parameter_dimension();
        self.state_models
            .iter()
            .map(|m| {
                let start = pos;
                pos += m.parameter_dimension();
                start
            })
            .collect()
    }

    pub fn vectorize_params(&self) -> Vec<f64> {
        let mut params = self.observation_model.vectorize_params();
        for m in &self.state_models {
            params.extend(m.vectorize_params());
        }
        params
    }

    pub fn unvectorize_params(&mut self, params: &[f64]) -> Result<()> {
        let expected = self.parameter_dimension();
        if params.len() != expected {
            return Err(StateSpaceError::ParamLengthMismatch {
                expected,
                got: params.len(),
            });
        }
        let nobs = self.observation_model.parameter_dimension();
        self.observation_model.unvectorize_params(&params[..nobs])?;
        let mut pos = nobs;
        for m in self.state_models.iter_mut() {
            let k = m.parameter_dimension();
            m.unvectorize_params(&params[pos..pos + k])?;
            pos += k;
        }
        Ok(())
    }

    pub fn observation_parameter_component<'a>(&self, params: &'a [f64]) -> Result<&'a [f64]> {
        self.check_param_length(params)?;
        Ok(&params[..self.observation_model.parameter_dimension()])
    }

    pub fn state_parameter_component<'a>(&self, params: &'a [f64], s: usize) -> Result<&'a [f64]> {
        self.check_param_length(params)?;
        self.check_state_index(s)?;
        let start = self.parameter_positions()[s];
        Ok(&params[start..start + self.state_models[s].parameter_dimension()])
    }

    pub fn parameter_bounds(&self) -> Vec<(f64, f64)> {
        let mut bounds = self.observation_model.parameter_bounds();
        for m in &self.state_models {
            bounds.extend(m.parameter_bounds());
        }
        bounds
    }

    fn check_param_length(&self, params: &[f64]) -> Result<()> {
        let expected = self.parameter_dimension();
        if params.len() != expected {
            return Err(StateSpaceError::ParamLengthMismatch {
                expected,
                got: params.len(),
            });
        }
        Ok(())
    }

    fn check_state_index(&self, s: usize) -> Result<()> {
        if s >= self.state_models.len() {
            return Err(StateSpaceError::DataError(format!(
                "state model index {} out of range ({} state models)",
                s,
                self.state_models.len()
            )));
        }
        Ok(())
    }

    fn check_length(&self, got: usize, expected: usize, what: &str) -> Result<()> {
        if got != expected {
            return Err(StateSpaceError::DimensionMismatch(format!(
                "{} has length {}, expected {}",
                what, got, expected
            )));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // System matrices
    // ------------------------------------------------------------------

    fn block_diagonal<F>(&self, block: F) -> Arc<dyn SparseKalmanMatrix>
    where
        F: Fn(&dyn StateModel) -> Arc<dyn SparseKalmanMatrix>,
    {
        if self.state_models.len() == 1 {
            return block(self.state_models[0].as_ref());
        }
        let m: BlockDiagonalMatrix = self.state_models.iter().map(|m| block(m.as_ref())).collect();
        Arc::new(m)
    }

    pub fn state_transition_matrix(&self, t: usize) -> Arc<dyn SparseKalmanMatrix> {
        self.block_diagonal(|m| m.state_transition_matrix(t))
    }

    pub fn state_variance_matrix(&self, t: usize) -> Arc<dyn SparseKalmanMatrix> {
        self.block_diagonal(|m| m.state_variance_matrix(t))
    }

    pub fn state_error_expander(&self, t: usize) -> Arc<dyn SparseKalmanMatrix> {
        self.block_diagonal(|m| m.state_error_expander(t))
    }

    pub fn state_error_variance(&self, t: usize) -> Arc<dyn SparseKalmanMatrix> {
        self.block_diagonal(|m| m.state_error_variance(t))
    }

    pub fn observation_matrix(&self, t: usize) -> SparseVector {
        let mut z = SparseVector::new(0);
        for m in &self.state_models {
            z.concatenate(&m.observation_matrix(t));
        }
        z
    }

    pub fn initial_state_mean(&self) -> DVector<f64> {
        let mut mean = DVector::zeros(self.state_dimension);
        for (s, m) in self.state_models.iter().enumerate() {
            mean.rows_mut(self.state_positions[s], m.state_dimension())
                .copy_from(&m.initial_state_mean());
        }
        mean
    }

    pub fn initial_state_variance(&self) -> DMatrix<f64> {
        let mut var = DMatrix::zeros(self.state_dimension, self.state_dimension);
        for (s, m) in self.state_models.iter().enumerate() {
            let (pos, d) = (self.state_positions[s], m.state_dimension());
            var.view_mut((pos, pos), (d, d))
                .copy_from(&m.initial_state_variance());
        }
        var
    }

    // ------------------------------------------------------------------
    // Filtering and smoothing
    // ------------------------------------------------------------------

    fn check_ready(&self) -> Result<()> {
        if self.state_models.is_empty() {
            return Err(StateSpaceError::Configuration(
                "no state models have been added".into(),
            ));
        }
        Ok(())
    }

    /// True when cached filter output reflects the current parameters and data.
    pub fn kalman_filter_is_current(&self) -> bool {
        let generation = self.changes.current();
        let cache = self.cache.borrow();
        matches!(&cache.summary, Some((g, _)) if *g == generation)
            || matches!(&cache.full, Some((g, _, _)) if *g == generation)
    }

    fn ensure_full(&self) -> Result<()> {
        let generation = self.changes.current();
        if matches!(&self.cache.borrow().full, Some((g, _, _)) if *g == generation) {
            return Ok(());
        }
        self.check_ready()?;
        debug!(
            "running full Kalman filter: {} time points, state dimension {}",
            self.time_dimension(),
            self.state_dimension
        );
        self.filter_started.set(true);
        let (out, storage) = kalman::full_kalman_filter(self)?;
        self.cache.borrow_mut().full = Some((generation, out, storage));
        Ok(())
    }

    fn ensure_smoother(&self) -> Result<()> {
        let generation = self.changes.current();
        if matches!(&self.cache.borrow().smoother, Some((g, _)) if *g == generation) {
            return Ok(());
        }
        self.ensure_full()?;
        let smoothed = {
            let cache = self.cache.borrow();
            match &cache.full {
                Some((_, _, storage)) => full_smoother(self, storage),
                None => return Err(StateSpaceError::Configuration("filter output unavailable".into())),
            }
        };
        self.cache.borrow_mut().smoother = Some((generation, smoothed));
        Ok(())
    }

    /// Run `f` on current full filter output, filtering first if needed.
    pub(crate) fn with_full<R>(&self, f: impl FnOnce(&FilterOutput, &[KalmanStorage]) -> R) -> Result<R> {
        self.ensure_full()?;
        let cache = self.cache.borrow();
        match &cache.full {
            Some((_, out, storage)) => Ok(f(out, storage)),
            None => Err(StateSpaceError::Configuration("filter output unavailable".into())),
        }
    }

    pub(crate) fn with_smoother<R>(&self, f: impl FnOnce(&SmootherOutput) -> R) -> Result<R> {
        self.ensure_smoother()?;
        let cache = self.cache.borrow();
        match &cache.smoother {
            Some((_, out)) => Ok(f(out)),
            None => Err(StateSpaceError::Configuration("smoother output unavailable".into())),
        }
    }

    /// Log likelihood and the one-step-ahead moments past the end of the data.
    pub fn filter(&self) -> Result<FilterOutput> {
        let generation = self.changes.current();
        {
            let cache = self.cache.borrow();
            if let Some((g, out, _)) = &cache.full {
                if *g == generation {
                    return Ok(out.clone());
                }
            }
            if let Some((g, out)) = &cache.summary {
                if *g == generation {
                    return Ok(out.clone());
                }
            }
        }
        self.check_ready()?;
        debug!("running Kalman filter for the log likelihood");
        self.filter_started.set(true);
        let out = kalman::filter_log_likelihood(self)?;
        self.cache.borrow_mut().summary = Some((generation, out.clone()));
        Ok(out)
    }

    pub fn log_likelihood(&self) -> Result<f64> {
        Ok(self.filter()?.log_likelihood)
    }

    /// Run the full filter, returning its summary.
    pub fn full_kalman_filter(&self) -> Result<FilterOutput> {
        self.with_full(|out, _| out.clone())
    }

    /// v[t] for every t (zero where y[t] is missing).
    pub fn one_step_prediction_errors(&self) -> Result<Vec<f64>> {
        self.with_full(|_, storage| storage.iter().map(|s| s.light.prediction_error).collect())
    }

    /// F[t] for every t.
    pub fn one_step_prediction_variances(&self) -> Result<Vec<f64>> {
        self.with_full(|_, storage| storage.iter().map(|s| s.light.prediction_variance).collect())
    }

    /// Column t is a[t] = E(alpha[t] | y[0..t-1]).
    pub fn state_filtering_means(&self) -> Result<DMatrix<f64>> {
        self.with_full(|_, storage| {
            let mut out = DMatrix::zeros(self.state_dimension, storage.len());
            for (t, s) in storage.iter().enumerate() {
                out.set_column(t, &s.light.a);
            }
            out
        })
    }

    /// Column t is E(alpha[t] | y).
    pub fn state_posterior_means(&self) -> Result<DMatrix<f64>> {
        self.with_smoother(|s| s.state_means.clone())
    }

    /// Var(alpha[t] | y)
    pub fn state_posterior_variance(&self, t: usize) -> Result<DMatrix<f64>> {
        let n = self.time_dimension();
        if t >= n {
            return Err(StateSpaceError::DataError(format!(
                "time index {} out of range for {} observations",
                t, n
            )));
        }
        self.with_smoother(|s| s.state_variances[t].clone())
    }

    pub fn observation_error_means(&self) -> Result<Vec<f64>> {
        self.with_smoother(|s| s.observation_error_means.clone())
    }

    pub fn observation_error_variances(&self) -> Result<Vec<f64>> {
        self.with_smoother(|s| s.observation_error_variances.clone())
    }

    // ------------------------------------------------------------------
    // Simulation and imputation
    // ------------------------------------------------------------------

    pub fn simulate_initial_state(&self, rng: &mut dyn RngCore) -> Result<DVector<f64>> {
        let mut out = DVector::zeros(self.state_dimension);
        for (s, m) in self.state_models.iter().enumerate() {
            out.rows_mut(self.state_positions[s], m.state_dimension())
                .copy_from(&m.simulate_initial_state(rng)?);
        }
        Ok(out)
    }

    /// Draw eta[t], the full state error for the transition t -> t+1.
    pub fn simulate_state_error(&self, rng: &mut dyn RngCore, t: usize) -> Result<DVector<f64>> {
        let mut out = DVector::zeros(self.state_error_dimension);
        for (s, m) in self.state_models.iter().enumerate() {
            out.rows_mut(self.state_error_positions[s], m.state_error_dimension())
                .copy_from(&m.simulate_state_error(rng, t)?);
        }
        Ok(out)
    }

    /// alpha[t+1] given alpha[t] = `current`.
    pub fn simulate_next_state(
        &self,
        rng: &mut dyn RngCore,
        current: &DVector<f64>,
        t: usize,
    ) -> Result<DVector<f64>> {
        let eta = self.simulate_state_error(rng, t)?;
        let mut next = self.state_transition_matrix(t).multiply(current);
        next += self.state_error_expander(t).multiply(&eta);
        Ok(next)
    }

    /// Simulate a state path and data from the model with current parameters.
    pub fn simulate_forward(&self, rng: &mut dyn RngCore) -> Result<(DMatrix<f64>, Vec<f64>)> {
        self.check_ready()?;
        simulation::simulate_forward(self, rng)
    }

    /// Draw the state from p(alpha | y) and push it into the client models'
    /// complete-data statistics.
    ///
    /// Observers get a reset before the draw and one change per time point
    /// as the imputed state is observed.  With a permanently set state the
    /// draw is skipped and the fixed state is observed instead.
    pub fn impute_state(&mut self, rng: &mut dyn RngCore) -> Result<()> {
        self.check_ready()?;
        self.signal_complete_data_reset();
        self.clear_client_data();
        if !self.state_is_fixed {
            let this = &*self;
            let draw = this.with_full(|_, storage| simulation::simulation_smoother(this, storage, rng))??;
            self.state = draw;
        }
        self.observe_imputed_state();
        Ok(())
    }

    fn observe_imputed_state(&mut self) {
        let n = self.state.ncols();
        for t in 0..n {
            let now = self.state.column(t).into_owned();
            if t == 0 {
                for (s, m) in self.state_models.iter_mut().enumerate() {
                    let block = now.rows(self.state_positions[s], m.state_dimension()).into_owned();
                    m.observe_initial_state(&block);
                }
            } else {
                let then = self.state.column(t - 1).into_owned();
                for (s, m) in self.state_models.iter_mut().enumerate() {
                    let (pos, d) = (self.state_positions[s], m.state_dimension());
                    let then_s = then.rows(pos, d).into_owned();
                    let now_s = now.rows(pos, d).into_owned();
                    m.observe_state(&then_s, &now_s, t);
                }
            }
            let contribution = self.observation_matrix(t).dot(&now);
            self.observation_model.observe_data_given_state(t, contribution);
            self.signal_complete_data_change(t);
        }
    }

    /// Fix the state at `state` (state_dimension x time_dimension).
    /// Subsequent `impute_state` calls use it unchanged.
    pub fn permanently_set_state(&mut self, state: DMatrix<f64>) -> Result<()> {
        let (d, n) = (self.state_dimension, self.time_dimension());
        if state.nrows() != d || state.ncols() != n {
            return Err(StateSpaceError::DimensionMismatch(format!(
                "state must be {}x{}, got {}x{}",
                d,
                n,
                state.nrows(),
                state.ncols()
            )));
        }
        self.state = state;
        self.state_is_fixed = true;
        Ok(())
    }

    pub fn state_is_fixed(&self) -> bool {
        self.state_is_fixed
    }

    /// Replace the stored state with smoothed means.  A fixed state wins.
    pub(crate) fn store_smoothed_state(&mut self, means: DMatrix<f64>) {
        if !self.state_is_fixed {
            self.state = means;
        }
    }

    /// Refresh the client models' complete-data statistics from the fixed state.
    pub fn observe_fixed_state(&mut self) -> Result<()> {
        if !self.state_is_fixed {
            return Err(StateSpaceError::Configuration(
                "observe_fixed_state requires a permanently set state".into(),
            ));
        }
        self.signal_complete_data_reset();
        self.clear_client_data();
        self.observe_imputed_state();
        Ok(())
    }

    /// Imputed (or fixed) state: column t is alpha[t].
    pub fn state(&self) -> &DMatrix<f64> {
        &self.state
    }

    pub fn state_at(&self, t: usize) -> Result<DVector<f64>> {
        if t >= self.state.ncols() {
            return Err(StateSpaceError::DataError(format!(
                "time index {} out of range ({} time points)",
                t,
                self.state.ncols()
            )));
        }
        Ok(self.state.column(t).into_owned())
    }

    pub fn final_state(&self) -> Option<DVector<f64>> {
        let n = self.state.ncols();
        (n > 0).then(|| self.state.column(n - 1).into_owned())
    }

    /// Block `s` of a full state vector.
    pub fn state_component(&self, full_state: &DVector<f64>, s: usize) -> Result<DVector<f64>> {
        self.check_state_index(s)?;
        self.check_length(full_state.len(), self.state_dimension, "state vector")?;
        Ok(full_state
            .rows(self.state_positions[s], self.state_models[s].state_dimension())
            .into_owned())
    }

    /// Block `s` of a full state error vector.
    pub fn state_error_component(&self, full_error: &DVector<f64>, s: usize) -> Result<DVector<f64>> {
        self.check_state_index(s)?;
        self.check_length(full_error.len(), self.state_error_dimension, "state error vector")?;
        Ok(full_error
            .rows(self.state_error_positions[s], self.state_models[s].state_error_dimension())
            .into_owned())
    }

    /// Diagonal block `s` of a full state error variance.
    pub fn state_error_variance_component(&self, full_variance: &DMatrix<f64>, s: usize) -> Result<DMatrix<f64>> {
        self.check_state_index(s)?;
        self.check_length(full_variance.nrows(), self.state_error_dimension, "state error variance")?;
        self.check_length(full_variance.ncols(), self.state_error_dimension, "state error variance")?;
        let (pos, d) = (
            self.state_error_positions[s],
            self.state_models[s].state_error_dimension(),
        );
        Ok(full_variance.view((pos, pos), (d, d)).into_owned())
    }

    /// Rows of the imputed state belonging to state model `s`.
    pub fn full_state_subcomponent(&self, s: usize) -> Result<DMatrix<f64>> {
        self.check_state_index(s)?;
        let (pos, d) = (self.state_positions[s], self.state_models[s].state_dimension());
        Ok(self.state.rows(pos, d).into_owned())
    }

    /// Z_s[t]' alpha_s[t] for every t, from the imputed state.
    pub fn state_contribution(&self, s: usize) -> Result<Vec<f64>> {
        self.check_state_index(s)?;
        let (pos, d) = (self.state_positions[s], self.state_models[s].state_dimension());
        Ok((0..self.state.ncols())
            .map(|t| {
                let block = self.state.column(t).rows(pos, d).into_owned();
                self.state_models[s].observation_matrix(t).dot(&block)
            })
            .collect())
    }

    pub fn state_contributions(&self) -> Result<Vec<Vec<f64>>> {
        (0..self.nstate()).map(|s| self.state_contribution(s)).collect()
    }

    pub fn set_state_model_behavior(&mut self, behavior: Behavior) {
        for m in self.state_models.iter_mut() {
            m.set_behavior(behavior);
        }
        self.changes.bump();
    }

    pub fn clear_client_data(&mut self) {
        self.observation_model.clear_data();
        for m in self.state_models.iter_mut() {
            m.clear_data();
        }
    }

    /// One posterior draw: impute the state, then draw every client
    /// model's parameters given the complete data.
    pub fn sample_posterior(&mut self, rng: &mut dyn RngCore) -> Result<()> {
        self.impute_state(rng)?;
        self.observation_model.sample_posterior(rng)?;
        for m in self.state_models.iter_mut() {
            m.sample_posterior(rng)?;
        }
        Ok(())
    }

    /// Sum of the client models' log priors at the current parameters.
    pub fn log_prior(&self) -> f64 {
        self.observation_model.log_prior() + self.state_models.iter().map(|m| m.log_prior()).sum::<f64>()
    }

    // ------------------------------------------------------------------
    // Data observers
    // ------------------------------------------------------------------

    pub fn register_data_observer(&mut self, observer: DataObserver) {
        self.data_observers.push(observer);
    }

    pub fn signal_complete_data_change(&mut self, t: usize) {
        for obs in self.data_observers.iter_mut() {
            obs(CompleteDataEvent::Changed(t));
        }
    }

    pub fn signal_complete_data_reset(&mut self) {
        for obs in self.data_observers.iter_mut() {
            obs(CompleteDataEvent::Reset);
        }
    }
}

fn validate_state_model(model: &dyn StateModel) -> Result<()> {
    let d = model.state_dimension();
    let e = model.state_error_dimension();
    let shape_err = |what: &str, got: (usize, usize), want: (usize, usize)| {
        StateSpaceError::DimensionMismatch(format!(
            "state model {} is {}x{}, expected {}x{}",
            what, got.0, got.1, want.0, want.1
        ))
    };
    if e > d {
        return Err(StateSpaceError::DimensionMismatch(format!(
            "state error dimension {} exceeds state dimension {}",
            e, d
        )));
    }
    let checks: [(&str, Arc<dyn SparseKalmanMatrix>, (usize, usize)); 4] = [
        ("transition matrix", model.state_transition_matrix(0), (d, d)),
        ("state variance matrix", model.state_variance_matrix(0), (d, d)),
        ("error expander", model.state_error_expander(0), (d, e)),
        ("error variance", model.state_error_variance(0), (e, e)),
    ];
    for (what, m, want) in checks {
        if (m.nrow(), m.ncol()) != want {
            return Err(shape_err(what, (m.nrow(), m.ncol()), want));
        }
    }
    if model.observation_matrix(0).size() != d {
        return Err(StateSpaceError::DimensionMismatch(format!(
            "state model observation vector has length {}, expected {}",
            model.observation_matrix(0).size(),
            d
        )));
    }
    let p0 = model.initial_state_variance();
    if model.initial_state_mean().len() != d || p0.nrows() != d || p0.ncols() != d {
        return Err(StateSpaceError::DimensionMismatch(
            "state model initial distribution does not match its state dimension".into(),
        ));
    }
    if model.parameter_bounds().len() != model.parameter_dimension() {
        return Err(StateSpaceError::Configuration(
            "state model parameter bounds do not match its parameter dimension".into(),
        ));
    }
    Ok(())
}

impl<O: ObservationModel> KalmanSystem for StateSpaceModel<O> {
    fn time_dimension(&self) -> usize {
        self.observation_model.time_dimension()
    }
    fn state_dimension(&self) -> usize {
        self.state_dimension
    }
    fn state_transition_matrix(&self, t: usize) -> Arc<dyn SparseKalmanMatrix> {
        StateSpaceModel::state_transition_matrix(self, t)
    }
    fn state_variance_matrix(&self, t: usize) -> Arc<dyn SparseKalmanMatrix> {
        StateSpaceModel::state_variance_matrix(self, t)
    }
    fn state_error_expander(&self, t: usize) -> Arc<dyn SparseKalmanMatrix> {
        StateSpaceModel::state_error_expander(self, t)
    }
    fn state_error_variance(&self, t: usize) -> Arc<dyn SparseKalmanMatrix> {
        StateSpaceModel::state_error_variance(self, t)
    }
    fn observation_matrix(&self, t: usize) -> SparseVector {
        StateSpaceModel::observation_matrix(self, t)
    }
    fn observation_variance(&self, t: usize) -> f64 {
        self.observation_model.observation_variance(t)
    }
    fn observation(&self, t: usize) -> f64 {
        self.observation_model.adjusted_observation(t)
    }
    fn is_missing_observation(&self, t: usize) -> bool {
        self.observation_model.is_missing_observation(t)
    }
    fn initial_state_mean(&self) -> DVector<f64> {
        StateSpaceModel::initial_state_mean(self)
    }
    fn initial_state_variance(&self) -> DMatrix<f64> {
        StateSpaceModel::initial_state_variance(self)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::state_models::tests::RestrictedLevel;
    use crate::state_models::{LocalLevelStateModel, LocalLinearTrendStateModel, SeasonalStateModel};
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::sync::Mutex;

    pub(crate) fn local_level_model(y: &[f64], h: f64, q: f64) -> StateSpaceModel {
        let obs = GaussianObservationModel::new(y.to_vec(), h).unwrap();
        let mut model = StateSpaceModel::new(obs);
        let mut level = LocalLevelStateModel::new(q).unwrap();
        level.set_initial_state(y.iter().copied().find(|v| v.is_finite()).unwrap_or(0.0), 1e3).unwrap();
        model.add_state(Box::new(level)).unwrap();
        model
    }

    #[test]
    fn test_state_layout() {
        let obs = GaussianObservationModel::new(vec![1.0; 8], 1.0).unwrap();
        let mut model = StateSpaceModel::new(obs);
        model.add_state(Box::new(LocalLinearTrendStateModel::new(0.1, 0.01).unwrap())).unwrap();
        model.add_state(Box::new(SeasonalStateModel::new(4, 0.2).unwrap())).unwrap();
        model.add_state(Box::new(LocalLevelStateModel::new(0.3).unwrap())).unwrap();

        assert_eq!(model.nstate(), 3);
        assert_eq!(model.state_dimension(), 2 + 3 + 1);
        assert_eq!(model.state_error_dimension(), 2 + 1 + 1);
        assert_eq!(model.state_positions(), &[0, 2, 5]);
        assert_eq!(model.state_error_positions(), &[0, 2, 3]);
        assert_eq!(model.parameter_positions(), vec![1, 3, 4]);
        assert_eq!(model.parameter_dimension(), 5);

        let z = model.observation_matrix(0);
        assert_eq!(z.size(), 6);
        assert!((z.get(0) - 1.0).abs() < 1e-15);
        assert!(z.get(1).abs() < 1e-15);
        assert!((z.get(2) - 1.0).abs() < 1e-15);
        assert!((z.get(5) - 1.0).abs() < 1e-15);

        let r = model.state_error_expander(0);
        assert_eq!((r.nrow(), r.ncol()), (6, 4));
        let rqr = model.state_variance_matrix(0).dense();
        let expected = r.dense() * model.state_error_variance(0).dense() * r.dense().transpose();
        for i in 0..6 {
            for j in 0..6 {
                assert!((rqr[(i, j)] - expected[(i, j)]).abs() < 1e-15);
            }
        }
    }

    #[test]
    fn test_params_roundtrip() {
        let obs = GaussianObservationModel::new(vec![1.0, 2.0, 3.0], 1.5).unwrap();
        let mut model = StateSpaceModel::new(obs);
        model.add_state(Box::new(LocalLinearTrendStateModel::new(0.1, 0.01).unwrap())).unwrap();
        model.add_state(Box::new(LocalLevelStateModel::new(0.3).unwrap())).unwrap();

        let theta = vec![0.7, 0.2, 0.05, 0.9];
        model.unvectorize_params(&theta).unwrap();
        assert_eq!(model.vectorize_params(), theta);
        assert_eq!(model.observation_parameter_component(&theta).unwrap(), &[0.7]);
        assert_eq!(model.state_parameter_component(&theta, 0).unwrap(), &[0.2, 0.05]);
        assert_eq!(model.state_parameter_component(&theta, 1).unwrap(), &[0.9]);
        assert!(matches!(
            model.unvectorize_params(&theta[..3]),
            Err(StateSpaceError::ParamLengthMismatch { expected: 4, got: 3 })
        ));
    }

    #[test]
    fn test_add_state_after_filter_is_refused() {
        let mut model = local_level_model(&[1.0, 2.0], 1.0, 1.0);
        model.log_likelihood().unwrap();
        let err = model
            .add_state(Box::new(LocalLevelStateModel::new(1.0).unwrap()))
            .unwrap_err();
        assert!(matches!(err, StateSpaceError::Configuration(_)));
    }

    #[test]
    fn test_add_state_rejects_unconfigured_model() {
        let obs = GaussianObservationModel::new(vec![1.0, 2.0, 3.0], 1.0).unwrap();
        let mut model = StateSpaceModel::new(obs);
        model.add_state(Box::new(LocalLinearTrendStateModel::new(0.1, 0.01).unwrap())).unwrap();

        let unconfigured = RestrictedLevel::unconfigured(
            LocalLevelStateModel::new(0.5).unwrap(),
            "level prior not set",
        );
        let err = model.add_state(Box::new(unconfigured)).unwrap_err();
        assert!(matches!(err, StateSpaceError::Configuration(_)));

        // The rejected model leaves no trace in the layout.
        assert_eq!(model.nstate(), 1);
        assert_eq!(model.state_dimension(), 2);
        assert_eq!(model.state_error_dimension(), 2);
        assert_eq!(model.state_positions(), &[0]);
        assert_eq!(model.parameter_positions(), vec![1]);
        assert_eq!(model.parameter_dimension(), 3);
        assert_eq!(model.state().shape(), (2, 3));
    }

    #[test]
    fn test_add_state_releases_fixed_state() {
        let obs = GaussianObservationModel::new(vec![1.0, 2.0, 3.0], 1.0).unwrap();
        let mut model = StateSpaceModel::new(obs);
        model.add_state(Box::new(LocalLevelStateModel::new(0.5).unwrap())).unwrap();
        model
            .permanently_set_state(DMatrix::from_row_slice(1, 3, &[1.0, 2.0, 3.0]))
            .unwrap();
        assert!(model.state_is_fixed());

        model.add_state(Box::new(LocalLevelStateModel::new(0.2).unwrap())).unwrap();
        assert!(!model.state_is_fixed());
        assert_eq!(model.state().shape(), (2, 3));
        assert!(model.observe_fixed_state().is_err());

        // Imputation draws a fresh state instead of replaying zeros.
        let mut rng = StdRng::seed_from_u64(8);
        model.impute_state(&mut rng).unwrap();
        assert!(model.state().iter().any(|x| *x != 0.0));

        let fixed = DMatrix::from_row_slice(2, 3, &[1.0, 2.0, 3.0, 0.1, 0.2, 0.3]);
        model.permanently_set_state(fixed.clone()).unwrap();
        model.impute_state(&mut rng).unwrap();
        assert_eq!(model.state(), &fixed);
    }

    #[test]
    fn test_filter_without_state_models_is_error() {
        let obs = GaussianObservationModel::new(vec![1.0], 1.0).unwrap();
        let model = StateSpaceModel::new(obs);
        assert!(matches!(model.log_likelihood(), Err(StateSpaceError::Configuration(_))));
    }

    #[test]
    fn test_cache_invalidation() {
        let mut model = local_level_model(&[1.0, 2.0, 1.5], 1.0, 1.0);
        assert!(!model.kalman_filter_is_current());
        let ll1 = model.log_likelihood().unwrap();
        assert!(model.kalman_filter_is_current());

        // Same value: no invalidation.
        model.unvectorize_params(&[1.0, 1.0]).unwrap();
        assert!(model.kalman_filter_is_current());

        model.unvectorize_params(&[2.0, 1.0]).unwrap();
        assert!(!model.kalman_filter_is_current());
        let ll2 = model.log_likelihood().unwrap();
        assert!((ll1 - ll2).abs() > 1e-6);
        assert!(model.kalman_filter_is_current());

        model.observation_model_mut().set_observation(1, 5.0).unwrap();
        assert!(!model.kalman_filter_is_current());
    }

    #[test]
    fn test_log_likelihood_is_sum_of_contributions() {
        let y = [1.0, 2.0, 1.5, 0.7, 1.9];
        let model = local_level_model(&y, 0.8, 0.4);
        let v = model.one_step_prediction_errors().unwrap();
        let f = model.one_step_prediction_variances().unwrap();
        let total: f64 = v
            .iter()
            .zip(f.iter())
            .map(|(v, f)| -0.5 * ((2.0 * std::f64::consts::PI).ln() + f.ln() + v * v / f))
            .sum();
        let ll = model.log_likelihood().unwrap();
        assert!((total - ll).abs() < 1e-8 * ll.abs());
    }

    #[test]
    fn test_missing_observation_skips_update() {
        let y = [1.0, f64::NAN, 2.0, 1.5, f64::NAN];
        let model = local_level_model(&y, 1.0, 1.0);
        let a = model.state_filtering_means().unwrap();
        assert_eq!(a.ncols(), 5);
        // a[2] = T a[1] + 0: the missing point leaves the mean unchanged.
        assert!((a[(0, 2)] - a[(0, 1)]).abs() < 1e-15);
        let v = model.one_step_prediction_errors().unwrap();
        assert!(v[1].abs() < 1e-15 && v[4].abs() < 1e-15);
        assert!(model.log_likelihood().unwrap().is_finite());
    }

    #[test]
    fn test_fixed_state_is_unchanged_by_imputation() {
        let y = [1.0, 2.0, 1.5, 3.0];
        let mut model = local_level_model(&y, 1.0, 1.0);
        let fixed = DMatrix::from_row_slice(1, 4, &[1.1, 1.9, 1.6, 2.8]);
        model.permanently_set_state(fixed.clone()).unwrap();
        let mut rng = StdRng::seed_from_u64(1);
        for _ in 0..3 {
            model.impute_state(&mut rng).unwrap();
            assert_eq!(model.state(), &fixed);
        }
        model.observe_fixed_state().unwrap();
        assert!(model.permanently_set_state(DMatrix::zeros(1, 3)).is_err());
    }

    #[test]
    fn test_impute_state_signals_observers() {
        let y = [1.0, f64::NAN, 2.0];
        let mut model = local_level_model(&y, 1.0, 1.0);
        let events = Arc::new(Mutex::new(Vec::new()));
        let ev = Arc::clone(&events);
        model.register_data_observer(Box::new(move |e| ev.lock().unwrap().push(e)));

        let mut rng = StdRng::seed_from_u64(3);
        model.impute_state(&mut rng).unwrap();
        let got = events.lock().unwrap().clone();
        assert_eq!(
            got,
            vec![
                CompleteDataEvent::Reset,
                CompleteDataEvent::Changed(0),
                CompleteDataEvent::Changed(1),
                CompleteDataEvent::Changed(2),
            ]
        );
        assert_eq!(model.state().shape(), (1, 3));
        assert_eq!(model.state_contribution(0).unwrap().len(), 3);
        assert!(model.final_state().is_some());
        // Two observed points feed the observation model's statistics.
        assert!((model.observation_model().suf().n() - 2.0).abs() < 1e-15);
    }

    #[test]
    fn test_state_posterior_moments() {
        let y = [1.0, f64::NAN, 2.0, 1.5, f64::NAN];
        let model = local_level_model(&y, 1.0, 1.0);
        let means = model.state_posterior_means().unwrap();
        assert_eq!(means.shape(), (1, 5));
        let v = model.state_posterior_variance(1).unwrap();
        assert!(v[(0, 0)] > 0.0);
        assert!(model.state_posterior_variance(5).is_err());
        let eps = model.observation_error_means().unwrap();
        assert!((eps[0] - (1.0 - means[(0, 0)])).abs() < 1e-10);
    }

    #[test]
    fn test_simulation_helpers() {
        let obs = GaussianObservationModel::new(vec![1.0; 5], 1.0).unwrap();
        let mut model = StateSpaceModel::new(obs);
        model.add_state(Box::new(LocalLinearTrendStateModel::new(0.1, 0.01).unwrap())).unwrap();
        model.add_state(Box::new(SeasonalStateModel::new(3, 0.2).unwrap())).unwrap();
        let mut rng = StdRng::seed_from_u64(9);
        let a0 = model.simulate_initial_state(&mut rng).unwrap();
        assert_eq!(a0.len(), 4);
        let eta = model.simulate_state_error(&mut rng, 0).unwrap();
        assert_eq!(eta.len(), 3);
        let a1 = model.simulate_next_state(&mut rng, &a0, 0).unwrap();
        assert_eq!(a1.len(), 4);
        let (states, y) = model.simulate_forward(&mut rng).unwrap();
        assert_eq!(states.shape(), (4, 5));
        assert_eq!(y.len(), 5);
        assert_eq!(model.state_component(&a0, 1).unwrap().len(), 2);
        assert_eq!(model.state_error_component(&eta, 1).unwrap().len(), 1);

        model.permanently_set_state(states.clone()).unwrap();
        let trend = model.full_state_subcomponent(0).unwrap();
        let seasonal = model.full_state_subcomponent(1).unwrap();
        assert_eq!(trend.shape(), (2, 5));
        assert_eq!(seasonal.shape(), (2, 5));
        assert_eq!(trend, states.rows(0, 2).into_owned());
        assert_eq!(seasonal, states.rows(2, 2).into_owned());
    }

    #[test]
    fn test_out_of_range_accessors_are_errors() {
        let mut model = local_level_model(&[1.0, 2.0], 1.0, 1.0);
        let mut rng = StdRng::seed_from_u64(4);
        model.impute_state(&mut rng).unwrap();

        assert_eq!(model.state_at(1).unwrap().len(), 1);
        assert!(matches!(model.state_at(5), Err(StateSpaceError::DataError(_))));
        assert!(matches!(model.full_state_subcomponent(1), Err(StateSpaceError::DataError(_))));
        assert!(matches!(model.state_contribution(3), Err(StateSpaceError::DataError(_))));

        let alpha = DVector::from_element(1, 0.5);
        assert!(matches!(model.state_component(&alpha, 2), Err(StateSpaceError::DataError(_))));
        assert!(matches!(model.state_error_component(&alpha, 1), Err(StateSpaceError::DataError(_))));
        assert!(matches!(
            model.state_component(&DVector::zeros(3), 0),
            Err(StateSpaceError::DimensionMismatch(_))
        ));
        assert!(matches!(
            model.state_error_variance_component(&DMatrix::zeros(2, 2), 0),
            Err(StateSpaceError::DimensionMismatch(_))
        ));
        assert!(matches!(
            model.state_parameter_component(&[1.0, 1.0], 1),
            Err(StateSpaceError::DataError(_))
        ));
        assert_eq!(model.state_contributions().unwrap().len(), 1);
    }

    #[test]
    fn test_behavior_propagates() {
        let mut model = local_level_model(&[1.0], 1.0, 1.0);
        model.set_state_model_behavior(Behavior::Mixture);
        assert_eq!(model.state_model(0).behavior(), Behavior::Mixture);
    }
}
