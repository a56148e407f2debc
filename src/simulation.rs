use nalgebra::{DMatrix, DVector};
use rand::RngCore;
use rand_distr::{Distribution, StandardNormal};

use crate::error::{Result, StateSpaceError};
use crate::kalman::{
    light_kalman_filter, smooth_disturbances_fast, FilterRecord, KalmanSystem, SimulatedSystem,
};

/// Vector of independent standard normals.
pub fn standard_normal_vector(rng: &mut dyn RngCore, n: usize) -> DVector<f64> {
    DVector::from_fn(n, |_, _| StandardNormal.sample(&mut *rng))
}

/// Draw from N(mean, variance).
///
/// Uses the Cholesky factor when the variance is positive definite and
/// falls back to a symmetric eigen decomposition for positive semi-definite
/// (singular) variances, as arise with rank-deficient R[t].
pub fn rmvn(rng: &mut dyn RngCore, mean: &DVector<f64>, variance: &DMatrix<f64>) -> Result<DVector<f64>> {
    let n = mean.len();
    if variance.nrows() != n || variance.ncols() != n {
        return Err(StateSpaceError::DimensionMismatch(format!(
            "rmvn: mean has length {}, variance is {}x{}",
            n,
            variance.nrows(),
            variance.ncols()
        )));
    }
    if n == 0 {
        return Ok(mean.clone());
    }
    let z = standard_normal_vector(rng, n);

    if let Some(chol) = variance.clone().cholesky() {
        return Ok(mean + chol.l() * z);
    }

    let eigen = variance.clone().symmetric_eigen();
    let scale = eigen.eigenvalues.amax().max(1.0);
    let mut root = eigen.eigenvectors.clone();
    for (j, &lambda) in eigen.eigenvalues.iter().enumerate() {
        if lambda < -1e-8 * scale || !lambda.is_finite() {
            return Err(StateSpaceError::SingularMatrix(format!(
                "variance matrix is not positive semi-definite (eigenvalue {})",
                lambda
            )));
        }
        let s = lambda.max(0.0).sqrt();
        root.column_mut(j).scale_mut(s);
    }
    Ok(mean + root * z)
}

/// Simulate a state path and observations from the model's prior.
///
/// Returns the state matrix (column t is alpha[t]) and y[0..n].  Values are
/// simulated at every t; the caller's missing pattern is kept separately.
pub fn simulate_forward<S: KalmanSystem + ?Sized>(
    sys: &S,
    rng: &mut dyn RngCore,
) -> Result<(DMatrix<f64>, Vec<f64>)> {
    let n = sys.time_dimension();
    let dim = sys.state_dimension();
    let mut states = DMatrix::zeros(dim, n);
    let mut y = Vec::with_capacity(n);
    if n == 0 {
        return Ok((states, y));
    }

    let mut alpha = rmvn(rng, &sys.initial_state_mean(), &sys.initial_state_variance())?;
    for t in 0..n {
        states.set_column(t, &alpha);
        let h = sys.observation_variance(t);
        if !(h >= 0.0) {
            return Err(StateSpaceError::NonPositivePredictionVariance { t, variance: h });
        }
        let eps: f64 = StandardNormal.sample(&mut *rng);
        y.push(sys.observation_matrix(t).dot(&alpha) + h.sqrt() * eps);

        if t + 1 < n {
            let q = sys.state_error_variance(t).dense();
            let eta = rmvn(rng, &DVector::zeros(q.nrows()), &q)?;
            let mut next = sys.state_transition_matrix(t).multiply(&alpha);
            next += sys.state_error_expander(t).multiply(&eta);
            alpha = next;
        }
    }
    Ok((states, y))
}

/// Durbin and Koopman (2002) simulation smoother.
///
/// Draws alpha ~ p(alpha | y) given filter output for the real data.
pub fn simulation_smoother<S, R>(
    sys: &S,
    records: &[R],
    rng: &mut dyn RngCore,
) -> Result<DMatrix<f64>>
where
    S: KalmanSystem + ?Sized,
    R: FilterRecord,
{
    let n = sys.time_dimension();
    if records.len() != n {
        return Err(StateSpaceError::DimensionMismatch(format!(
            "filter storage has {} entries, model has {} time points",
            records.len(),
            n
        )));
    }
    let (r0_hat, r_hat) = smooth_disturbances_fast(sys, records);

    let (mut alpha_plus, y_plus) = simulate_forward(sys, rng)?;
    let fake = SimulatedSystem::new(sys, &y_plus)?;
    let (_, fake_records) = light_kalman_filter(&fake)?;
    let (r0_plus, r_plus) = smooth_disturbances_fast(&fake, &fake_records);

    if n == 0 {
        return Ok(alpha_plus);
    }

    // The smoother is linear in the data, so alpha_hat - alpha_plus_hat is
    // the fast state smoother run on the difference of the r sequences with
    // a zero initial mean.
    let mut d = sys.initial_state_variance() * (&r0_hat - &r0_plus);
    for t in 0..n {
        let mut col = alpha_plus.column_mut(t);
        col += &d;
        if t + 1 < n {
            let mut next = sys.state_transition_matrix(t).multiply(&d);
            next += sys.state_variance_matrix(t).multiply(&(&r_hat[t] - &r_plus[t]));
            d = next;
        }
    }
    Ok(alpha_plus)
}
