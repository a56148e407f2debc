use nalgebra::DVector;
use rand::RngCore;
use rand_distr::{Distribution, StandardNormal};
use statrs::distribution::{ContinuousCDF, Normal};

use crate::error::{Result, StateSpaceError};
use crate::observation::ObservationModel;
use crate::sparse::SparseKalmanMatrix;
use crate::state_space::StateSpaceModel;

/// H-step ahead forecast result.
#[derive(Debug, Clone)]
pub struct ForecastResult {
    pub mean: Vec<f64>,
    /// Predictive variance of y[n+h], observation noise included.
    pub variance: Vec<f64>,
    pub ci_lower: Vec<f64>,
    pub ci_upper: Vec<f64>,
}

/// One-step-ahead prediction errors.  Missing observations are NaN.
#[derive(Debug, Clone)]
pub struct ResidualOutput {
    pub residuals: Vec<f64>,
    pub standardized_residuals: Vec<f64>,
}

fn normal_quantile(p: f64) -> Result<f64> {
    let normal = Normal::new(0.0, 1.0).map_err(|e| StateSpaceError::Configuration(e.to_string()))?;
    Ok(normal.inverse_cdf(p))
}

/// Forecast y[n..n+horizon] from the filtered moments one step past the data.
///
/// Intervals cover `1 - alpha` of the normal predictive distribution.
pub fn forecast<O: ObservationModel>(
    model: &StateSpaceModel<O>,
    horizon: usize,
    alpha: f64,
) -> Result<ForecastResult> {
    if !(alpha > 0.0 && alpha < 1.0) {
        return Err(StateSpaceError::Configuration(format!(
            "alpha must be in (0, 1), got {}",
            alpha
        )));
    }
    let filtered = model.filter()?;
    let z_alpha = normal_quantile(1.0 - alpha / 2.0)?;
    let n = model.time_dimension();

    let mut a = filtered.final_state;
    let mut p = filtered.final_variance;

    let mut mean = Vec::with_capacity(horizon);
    let mut variance = Vec::with_capacity(horizon);
    let mut ci_lower = Vec::with_capacity(horizon);
    let mut ci_upper = Vec::with_capacity(horizon);

    for h in 0..horizon {
        let t = n + h;
        let z = model.observation_matrix(t);
        let y_hat = z.dot(&a);
        let f = (z.sandwich(&p) + model.observation_model().observation_variance(t)).max(0.0);

        let se = f.sqrt();
        mean.push(y_hat);
        variance.push(f);
        ci_lower.push(y_hat - z_alpha * se);
        ci_upper.push(y_hat + z_alpha * se);

        let transition = model.state_transition_matrix(t);
        a = transition.multiply(&a);
        p = transition.sandwich(&p);
        model.state_variance_matrix(t).add_to(&mut p);
    }

    Ok(ForecastResult {
        mean,
        variance,
        ci_lower,
        ci_upper,
    })
}

/// Simulate y[n..n+horizon] given the state at the last time point.
pub fn simulate_forecast<O: ObservationModel>(
    model: &StateSpaceModel<O>,
    rng: &mut dyn RngCore,
    horizon: usize,
    final_state: &DVector<f64>,
) -> Result<Vec<f64>> {
    if final_state.len() != model.state_dimension() {
        return Err(StateSpaceError::DimensionMismatch(format!(
            "final state has length {}, state dimension is {}",
            final_state.len(),
            model.state_dimension()
        )));
    }
    let n = model.time_dimension();
    let mut state = final_state.clone();
    let mut out = Vec::with_capacity(horizon);
    for h in 0..horizon {
        // alpha[n-1+h] -> alpha[n+h]
        let t = (n + h).saturating_sub(1);
        state = model.simulate_next_state(rng, &state, t)?;
        let h_var = model.observation_model().observation_variance(n + h);
        let noise: f64 = StandardNormal.sample(&mut *rng);
        out.push(model.observation_matrix(n + h).dot(&state) + h_var.sqrt() * noise);
    }
    Ok(out)
}

pub fn residuals<O: ObservationModel>(model: &StateSpaceModel<O>) -> Result<ResidualOutput> {
    let v = model.one_step_prediction_errors()?;
    let f = model.one_step_prediction_variances()?;
    let n = v.len();

    let mut residuals = Vec::with_capacity(n);
    let mut standardized = Vec::with_capacity(n);
    for t in 0..n {
        if model.observation_model().is_missing_observation(t) {
            residuals.push(f64::NAN);
            standardized.push(f64::NAN);
        } else {
            residuals.push(v[t]);
            standardized.push(if f[t] > 0.0 { v[t] / f[t].sqrt() } else { 0.0 });
        }
    }

    Ok(ResidualOutput {
        residuals,
        standardized_residuals: standardized,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state_space::tests::local_level_model;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_normal_quantile() {
        assert!((normal_quantile(0.975).unwrap() - 1.959964).abs() < 1e-5);
        assert!(normal_quantile(0.5).unwrap().abs() < 1e-12);
    }

    #[test]
    fn test_local_level_forecast() {
        let y = [1.0, 1.4, 0.9, 1.3, 1.1, f64::NAN, 1.2];
        let (h, q) = (0.5, 0.2);
        let model = local_level_model(&y, h, q);
        let filtered = model.filter().unwrap();
        let fc = forecast(&model, 4, 0.05).unwrap();

        let a_n = filtered.final_state[0];
        let p_n = filtered.final_variance[(0, 0)];
        for step in 0..4 {
            // The level is a random walk: flat mean, variance grows by q.
            assert!((fc.mean[step] - a_n).abs() < 1e-12);
            let expected = p_n + step as f64 * q + h;
            assert!((fc.variance[step] - expected).abs() < 1e-10);
        }
    }

    #[test]
    fn test_forecast_ci_symmetric() {
        let model = local_level_model(&[2.0, 2.5, 1.5, 2.2], 1.0, 0.1);
        let fc = forecast(&model, 3, 0.1).unwrap();
        for i in 0..3 {
            let lower = fc.mean[i] - fc.ci_lower[i];
            let upper = fc.ci_upper[i] - fc.mean[i];
            assert!((lower - upper).abs() < 1e-10);
            assert!(lower > 0.0);
        }
    }

    #[test]
    fn test_forecast_zero_steps_and_bad_alpha() {
        let model = local_level_model(&[1.0, 2.0], 1.0, 1.0);
        let fc = forecast(&model, 0, 0.05).unwrap();
        assert!(fc.mean.is_empty() && fc.variance.is_empty());
        assert!(matches!(forecast(&model, 2, 1.5), Err(StateSpaceError::Configuration(_))));
    }

    #[test]
    fn test_simulate_forecast_moments() {
        let model = local_level_model(&[0.0, 0.2, -0.1], 0.3, 0.2);
        let last = DVector::from_vec(vec![1.0]);
        let mut rng = StdRng::seed_from_u64(17);
        let draws = 20_000;
        let mut sum = 0.0;
        let mut sumsq = 0.0;
        for _ in 0..draws {
            let path = simulate_forecast(&model, &mut rng, 2, &last).unwrap();
            assert_eq!(path.len(), 2);
            sum += path[1];
            sumsq += path[1] * path[1];
        }
        let mean = sum / draws as f64;
        let var = sumsq / draws as f64 - mean * mean;
        // Two level steps plus observation noise.
        assert!((mean - 1.0).abs() < 0.03, "mean {}", mean);
        assert!((var - 0.7).abs() < 0.05, "variance {}", var);

        assert!(simulate_forecast(&model, &mut rng, 2, &DVector::zeros(3)).is_err());
    }

    #[test]
    fn test_residuals() {
        let y = [1.0, f64::NAN, 2.0, 1.5];
        let model = local_level_model(&y, 1.0, 0.5);
        let out = residuals(&model).unwrap();
        assert_eq!(out.residuals.len(), 4);
        assert!(out.residuals[1].is_nan());
        let f = model.one_step_prediction_variances().unwrap();
        for t in [0, 2, 3] {
            assert!((out.standardized_residuals[t] - out.residuals[t] / f[t].sqrt()).abs() < 1e-12);
        }
    }
}
