//! Full state and disturbance smoother.
//!
//! Runs the r and N recursions of Durbin and Koopman (2012, section 4.5)
//! backwards over full filter storage, producing smoothed moments of the
//! state, the observation errors and the state errors.

use nalgebra::{DMatrix, DVector};

use crate::kalman::{KalmanStorage, KalmanSystem};

#[derive(Debug, Clone)]
pub struct SmootherOutput {
    /// Column t is E(alpha[t] | y).
    pub state_means: DMatrix<f64>,
    /// Var(alpha[t] | y)
    pub state_variances: Vec<DMatrix<f64>>,
    /// E(eps[t] | y).  Zero where y[t] is missing.
    pub observation_error_means: Vec<f64>,
    /// Var(eps[t] | y).  Equal to H[t] where y[t] is missing.
    pub observation_error_variances: Vec<f64>,
    /// E(eta[t] | y) for the transition t -> t+1, t = 0..n-2.
    pub state_error_means: Vec<DVector<f64>>,
    /// Var(eta[t] | y) for the transition t -> t+1, t = 0..n-2.
    pub state_error_variances: Vec<DMatrix<f64>>,
    /// Scaled smoothed disturbance one step before the first observation.
    pub r0: DVector<f64>,
    pub n0: DMatrix<f64>,
}

fn symmetrize(m: &mut DMatrix<f64>) {
    let sym = (&*m + m.transpose()) * 0.5;
    *m = sym;
}

pub fn full_smoother<S: KalmanSystem + ?Sized>(sys: &S, storage: &[KalmanStorage]) -> SmootherOutput {
    let n = storage.len();
    let dim = sys.state_dimension();

    let mut r = DVector::zeros(dim);
    let mut nmat = DMatrix::zeros(dim, dim);

    let mut state_means = DMatrix::zeros(dim, n);
    let mut state_variances = vec![DMatrix::zeros(dim, dim); n];
    let mut obs_means = vec![0.0; n];
    let mut obs_vars = vec![0.0; n];
    let mut err_means = Vec::with_capacity(n.saturating_sub(1));
    let mut err_vars = Vec::with_capacity(n.saturating_sub(1));

    for t in (0..n).rev() {
        let rec = &storage[t];
        let light = &rec.light;
        let h = sys.observation_variance(t);

        if t + 1 < n {
            let q = sys.state_error_variance(t).dense();
            let rq = sys.state_error_expander(t).multiply_matrix(&q);
            err_means.push(rq.tr_mul(&r));
            let mut v = &q - rq.transpose() * &nmat * &rq;
            symmetrize(&mut v);
            err_vars.push(v);
        }

        let tm = sys.state_transition_matrix(t).dense();
        let tnt = tm.transpose() * &nmat * &tm;
        let (r_prev, n_prev) = if light.missing {
            obs_means[t] = 0.0;
            obs_vars[t] = h;
            (tm.tr_mul(&r), tnt)
        } else {
            let f = light.prediction_variance;
            let k = &light.gain;
            let z = sys.observation_matrix(t).dense();
            let nk = &nmat * k;
            let knk = k.dot(&nk);
            let u = light.prediction_error / f - k.dot(&r);

            obs_means[t] = h * u;
            obs_vars[t] = h - h * h * (1.0 / f + knk);

            let mut r_prev = tm.tr_mul(&r);
            r_prev.axpy(u, &z, 1.0);

            let w = tm.tr_mul(&nk);
            let zzt = &z * z.transpose();
            let n_prev = tnt - &w * z.transpose() - &z * w.transpose() + &zzt * (knk + 1.0 / f);
            (r_prev, n_prev)
        };

        let mut n_prev = n_prev;
        symmetrize(&mut n_prev);

        let p = &rec.p;
        let mean = &light.a + p * &r_prev;
        state_means.set_column(t, &mean);
        let mut v = p - p * &n_prev * p;
        symmetrize(&mut v);
        state_variances[t] = v;

        r = r_prev;
        nmat = n_prev;
    }

    err_means.reverse();
    err_vars.reverse();

    SmootherOutput {
        state_means,
        state_variances,
        observation_error_means: obs_means,
        observation_error_variances: obs_vars,
        state_error_means: err_means,
        state_error_variances: err_vars,
        r0: r,
        n0: nmat,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kalman::tests::FixedSystem;
    use crate::kalman::{fast_state_smoother, full_kalman_filter, smooth_disturbances_fast};

    fn brute_force_local_level(y: &[f64], h: f64, q: f64, p0: f64) -> (DVector<f64>, DMatrix<f64>) {
        // Condition on observed points only; a0 = 0.
        let n = y.len();
        let obs: Vec<usize> = (0..n).filter(|&t| y[t].is_finite()).collect();
        let va = DMatrix::from_fn(n, n, |i, j| p0 + q * i.min(j) as f64);
        let m = obs.len();
        let cay = DMatrix::from_fn(n, m, |i, j| va[(i, obs[j])]);
        let vy = DMatrix::from_fn(m, m, |i, j| va[(obs[i], obs[j])] + if i == j { h } else { 0.0 });
        let yv = DVector::from_fn(m, |i, _| y[obs[i]]);
        let vy_inv = vy.try_inverse().unwrap();
        let mean = &cay * &vy_inv * yv;
        let var = &va - &cay * &vy_inv * cay.transpose();
        (mean, var)
    }

    #[test]
    fn test_full_smoother_matches_brute_force() {
        let y = [1.0, f64::NAN, 2.0, 1.5, f64::NAN];
        let (h, q, p0) = (1.0, 1.0, 1e3);
        let sys = FixedSystem::local_level(&y, h, q, 0.0, p0);
        let (_, storage) = full_kalman_filter(&sys).unwrap();
        let out = full_smoother(&sys, &storage);
        let (mean, var) = brute_force_local_level(&y, h, q, p0);
        for t in 0..y.len() {
            assert!(
                (out.state_means[(0, t)] - mean[t]).abs() < 1e-8,
                "mean t={}: {} vs {}",
                t,
                out.state_means[(0, t)],
                mean[t]
            );
            assert!(
                (out.state_variances[t][(0, 0)] - var[(t, t)]).abs() < 1e-8,
                "var t={}: {} vs {}",
                t,
                out.state_variances[t][(0, 0)],
                var[(t, t)]
            );
        }
    }

    #[test]
    fn test_full_and_fast_smoothers_agree() {
        let y = [0.3, 1.2, f64::NAN, 0.8, 2.2, 1.9];
        let sys = FixedSystem::local_level(&y, 0.6, 0.25, 0.1, 5.0);
        let (_, storage) = full_kalman_filter(&sys).unwrap();
        let out = full_smoother(&sys, &storage);
        let (r0, r) = smooth_disturbances_fast(&sys, &storage);
        let fast = fast_state_smoother(&sys, &r0, &r);
        for t in 0..y.len() {
            assert!((out.state_means[(0, t)] - fast[(0, t)]).abs() < 1e-10);
        }
        assert!((out.r0[0] - r0[0]).abs() < 1e-12);
    }

    #[test]
    fn test_error_moments_local_level() {
        let y = [1.0, 3.0, f64::NAN, 2.0];
        let h = 0.7;
        let sys = FixedSystem::local_level(&y, h, 0.4, 0.0, 2.0);
        let (_, storage) = full_kalman_filter(&sys).unwrap();
        let out = full_smoother(&sys, &storage);

        for t in 0..y.len() {
            if y[t].is_finite() {
                // eps = y - alpha, so its smoothed moments follow from the state's.
                let expected = y[t] - out.state_means[(0, t)];
                assert!((out.observation_error_means[t] - expected).abs() < 1e-10);
                assert!(
                    (out.observation_error_variances[t] - out.state_variances[t][(0, 0)]).abs() < 1e-10
                );
            } else {
                assert!(out.observation_error_means[t].abs() < 1e-15);
                assert!((out.observation_error_variances[t] - h).abs() < 1e-15);
            }
        }

        assert_eq!(out.state_error_means.len(), y.len() - 1);
        for t in 0..y.len() - 1 {
            // eta[t] = alpha[t+1] - alpha[t]
            let expected = out.state_means[(0, t + 1)] - out.state_means[(0, t)];
            assert!((out.state_error_means[t][0] - expected).abs() < 1e-10);
            assert!(out.state_error_variances[t][(0, 0)] > 0.0);
            assert!(out.state_error_variances[t][(0, 0)] <= 0.4 + 1e-12);
        }
    }

    #[test]
    fn test_single_observation() {
        let sys = FixedSystem::local_level(&[2.0], 1.0, 0.5, 0.0, 3.0);
        let (_, storage) = full_kalman_filter(&sys).unwrap();
        let out = full_smoother(&sys, &storage);
        assert!((out.state_means[(0, 0)] - 1.5).abs() < 1e-12);
        // 3 - 9/4
        assert!((out.state_variances[0][(0, 0)] - 0.75).abs() < 1e-12);
        assert!(out.state_error_means.is_empty());
    }
}
