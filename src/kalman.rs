use std::f64::consts::PI;
use std::sync::Arc;

use nalgebra::{DMatrix, DVector};

use crate::error::{Result, StateSpaceError};
use crate::sparse::{SparseKalmanMatrix, SparseVector};

/// What the filter and smoothers need to know about a linear Gaussian
/// state space model with scalar observations.
///
///   y[t]       = Z[t]' alpha[t] + eps[t],           eps[t] ~ N(0, H[t])
///   alpha[t+1] = T[t] alpha[t] + R[t] eta[t],       eta[t] ~ N(0, Q[t])
pub trait KalmanSystem {
    fn time_dimension(&self) -> usize;
    fn state_dimension(&self) -> usize;

    /// T[t]: maps alpha[t] to alpha[t+1].
    fn state_transition_matrix(&self, t: usize) -> Arc<dyn SparseKalmanMatrix>;
    /// R[t] Q[t] R[t]'
    fn state_variance_matrix(&self, t: usize) -> Arc<dyn SparseKalmanMatrix>;
    /// R[t]
    fn state_error_expander(&self, t: usize) -> Arc<dyn SparseKalmanMatrix>;
    /// Q[t]
    fn state_error_variance(&self, t: usize) -> Arc<dyn SparseKalmanMatrix>;
    /// Z[t]
    fn observation_matrix(&self, t: usize) -> SparseVector;
    /// H[t]
    fn observation_variance(&self, t: usize) -> f64;
    fn observation(&self, t: usize) -> f64;
    fn is_missing_observation(&self, t: usize) -> bool;

    fn initial_state_mean(&self) -> DVector<f64>;
    fn initial_state_variance(&self) -> DMatrix<f64>;
}

/// A system whose observations are replaced by simulated values, keeping the
/// model matrices and the missing-data pattern of `inner`.
pub struct SimulatedSystem<'a, S: KalmanSystem + ?Sized> {
    inner: &'a S,
    observations: &'a [f64],
}

impl<'a, S: KalmanSystem + ?Sized> SimulatedSystem<'a, S> {
    pub fn new(inner: &'a S, observations: &'a [f64]) -> Result<Self> {
        if observations.len() != inner.time_dimension() {
            return Err(StateSpaceError::DimensionMismatch(format!(
                "simulated data has length {}, model has {} time points",
                observations.len(),
                inner.time_dimension()
            )));
        }
        Ok(Self {
            inner,
            observations,
        })
    }
}

impl<'a, S: KalmanSystem + ?Sized> KalmanSystem for SimulatedSystem<'a, S> {
    fn time_dimension(&self) -> usize {
        self.inner.time_dimension()
    }
    fn state_dimension(&self) -> usize {
        self.inner.state_dimension()
    }
    fn state_transition_matrix(&self, t: usize) -> Arc<dyn SparseKalmanMatrix> {
        self.inner.state_transition_matrix(t)
    }
    fn state_variance_matrix(&self, t: usize) -> Arc<dyn SparseKalmanMatrix> {
        self.inner.state_variance_matrix(t)
    }
    fn state_error_expander(&self, t: usize) -> Arc<dyn SparseKalmanMatrix> {
        self.inner.state_error_expander(t)
    }
    fn state_error_variance(&self, t: usize) -> Arc<dyn SparseKalmanMatrix> {
        self.inner.state_error_variance(t)
    }
    fn observation_matrix(&self, t: usize) -> SparseVector {
        self.inner.observation_matrix(t)
    }
    fn observation_variance(&self, t: usize) -> f64 {
        self.inner.observation_variance(t)
    }
    fn observation(&self, t: usize) -> f64 {
        self.observations[t]
    }
    fn is_missing_observation(&self, t: usize) -> bool {
        self.inner.is_missing_observation(t)
    }
    fn initial_state_mean(&self) -> DVector<f64> {
        self.inner.initial_state_mean()
    }
    fn initial_state_variance(&self) -> DMatrix<f64> {
        self.inner.initial_state_variance()
    }
}

/// Per-time filter output needed by the fast disturbance smoother.
#[derive(Debug, Clone)]
pub struct LightKalmanStorage {
    /// Predicted state mean a[t] = E(alpha[t] | y[0..t-1]).
    pub a: DVector<f64>,
    /// Kalman gain K[t] = T[t] P[t] Z[t] / F[t].  Zero when missing.
    pub gain: DVector<f64>,
    /// One-step prediction error v[t].  Zero when missing.
    pub prediction_error: f64,
    /// One-step prediction variance F[t].
    pub prediction_variance: f64,
    pub missing: bool,
}

/// Light storage plus the predicted state variance P[t].
#[derive(Debug, Clone)]
pub struct KalmanStorage {
    pub light: LightKalmanStorage,
    pub p: DMatrix<f64>,
}

/// Common view of the two storage tiers.
pub trait FilterRecord {
    fn light(&self) -> &LightKalmanStorage;
}

impl FilterRecord for LightKalmanStorage {
    fn light(&self) -> &LightKalmanStorage {
        self
    }
}

impl FilterRecord for KalmanStorage {
    fn light(&self) -> &LightKalmanStorage {
        &self.light
    }
}

/// Summary of a forward filtering pass.
#[derive(Debug, Clone)]
pub struct FilterOutput {
    pub log_likelihood: f64,
    /// a[n], the one-step-ahead state mean past the end of the data.
    pub final_state: DVector<f64>,
    /// P[n]
    pub final_variance: DMatrix<f64>,
}

fn symmetrize(p: &mut DMatrix<f64>) {
    let n = p.nrows();
    for i in 0..n {
        for j in 0..i {
            let avg = 0.5 * (p[(i, j)] + p[(j, i)]);
            p[(i, j)] = avg;
            p[(j, i)] = avg;
        }
    }
}

/// Forward recursion shared by all storage tiers.
///
/// `record` receives the storage for time t together with P[t], before the
/// state is advanced to t+1.
fn run_filter<S, F>(sys: &S, mut record: F) -> Result<FilterOutput>
where
    S: KalmanSystem + ?Sized,
    F: FnMut(LightKalmanStorage, &DMatrix<f64>),
{
    let n = sys.time_dimension();
    let mut a = sys.initial_state_mean();
    let mut p = sys.initial_state_variance();
    let dim = sys.state_dimension();
    if a.len() != dim || p.nrows() != dim || p.ncols() != dim {
        return Err(StateSpaceError::DimensionMismatch(format!(
            "initial state has length {} and variance {}x{}, state dimension is {}",
            a.len(),
            p.nrows(),
            p.ncols(),
            dim
        )));
    }

    let log_2pi = (2.0 * PI).ln();
    let mut loglike = 0.0;

    for t in 0..n {
        let z = sys.observation_matrix(t);
        let tm = sys.state_transition_matrix(t);
        let missing = sys.is_missing_observation(t);

        let pz = z.matrix_product(&p);
        let f = z.dot(&pz) + sys.observation_variance(t);

        let (v, gain) = if missing {
            (0.0, DVector::zeros(dim))
        } else {
            let y = sys.observation(t);
            if !y.is_finite() {
                return Err(StateSpaceError::DataError(format!(
                    "non-finite observation {} at t = {} is not flagged missing",
                    y, t
                )));
            }
            if !(f > 0.0 && f.is_finite()) {
                return Err(StateSpaceError::NonPositivePredictionVariance { t, variance: f });
            }
            let v = y - z.dot(&a);
            loglike += -0.5 * (log_2pi + f.ln() + v * v / f);
            (v, tm.multiply(&pz) / f)
        };

        let mut next_a = tm.multiply(&a);
        next_a.axpy(v, &gain, 1.0);

        let mut next_p = tm.sandwich(&p);
        if !missing {
            next_p -= (&gain * gain.transpose()) * f;
        }
        sys.state_variance_matrix(t).add_to(&mut next_p);
        symmetrize(&mut next_p);

        record(
            LightKalmanStorage {
                a,
                gain,
                prediction_error: v,
                prediction_variance: f,
                missing,
            },
            &p,
        );

        a = next_a;
        p = next_p;
    }

    Ok(FilterOutput {
        log_likelihood: loglike,
        final_state: a,
        final_variance: p,
    })
}

/// Log likelihood and final moments without per-time storage.
pub fn filter_log_likelihood<S: KalmanSystem + ?Sized>(sys: &S) -> Result<FilterOutput> {
    run_filter(sys, |_, _| {})
}

/// Filter keeping what the fast disturbance smoother needs.
pub fn light_kalman_filter<S: KalmanSystem + ?Sized>(
    sys: &S,
) -> Result<(FilterOutput, Vec<LightKalmanStorage>)> {
    let mut storage = Vec::with_capacity(sys.time_dimension());
    let out = run_filter(sys, |s, _| storage.push(s))?;
    Ok((out, storage))
}

/// Filter keeping the predicted state variances as well.
pub fn full_kalman_filter<S: KalmanSystem + ?Sized>(
    sys: &S,
) -> Result<(FilterOutput, Vec<KalmanStorage>)> {
    let mut storage = Vec::with_capacity(sys.time_dimension());
    let out = run_filter(sys, |s, p| {
        storage.push(KalmanStorage {
            light: s,
            p: p.clone(),
        })
    })?;
    Ok((out, storage))
}

/// Backward disturbance smoother (Durbin and Koopman 2002).
///
/// Returns `(r0, r)` where `r[t]` is the scaled smoothed disturbance used to
/// move from alpha[t] to alpha[t+1], and `r0` is the value one step before
/// the first observation.
pub fn smooth_disturbances_fast<S, R>(sys: &S, records: &[R]) -> (DVector<f64>, Vec<DVector<f64>>)
where
    S: KalmanSystem + ?Sized,
    R: FilterRecord,
{
    let dim = sys.state_dimension();
    let n = records.len();
    let mut r = DVector::zeros(dim);
    let mut r_stored = vec![DVector::zeros(dim); n];

    for t in (0..n).rev() {
        let rec = records[t].light();
        let tm = sys.state_transition_matrix(t);
        let mut prev = tm.multiply_transpose(&r);
        if !rec.missing {
            let u = rec.prediction_error / rec.prediction_variance - rec.gain.dot(&r);
            sys.observation_matrix(t).add_scaled_to(&mut prev, u);
        }
        r_stored[t] = std::mem::replace(&mut r, prev);
    }
    (r, r_stored)
}

/// Forward pass of the fast state smoother.  Column t of the result is
/// E(alpha[t] | y).
pub fn fast_state_smoother<S: KalmanSystem + ?Sized>(
    sys: &S,
    r0: &DVector<f64>,
    r: &[DVector<f64>],
) -> DMatrix<f64> {
    let n = r.len();
    let dim = sys.state_dimension();
    let mut out = DMatrix::zeros(dim, n);
    if n == 0 {
        return out;
    }
    let mut alpha = sys.initial_state_mean() + sys.initial_state_variance() * r0;
    for t in 0..n {
        out.set_column(t, &alpha);
        if t + 1 < n {
            let mut next = sys.state_transition_matrix(t).multiply(&alpha);
            next += sys.state_variance_matrix(t).multiply(&r[t]);
            alpha = next;
        }
    }
    out
}
