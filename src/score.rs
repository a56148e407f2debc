//! Log likelihood gradient via the disturbance smoother.
//!
//! By the Fisher identity the score equals the expected complete-data score
//! given the data:
//!
//!   d l / d theta = E[ d log p(y, alpha | theta) / d theta | y ]
//!
//! The complete-data log density splits into observation errors eps[t]
//! (observed t only) and state errors eta[t] (transitions inside the
//! sample), so each client model adds its own term from the smoothed
//! moments of its errors.

use crate::error::Result;
use crate::observation::ObservationModel;
use crate::state_space::StateSpaceModel;

impl<O: ObservationModel> StateSpaceModel<O> {
    /// Log likelihood and its gradient at the current parameters, laid out
    /// like `vectorize_params`.
    pub fn log_likelihood_derivatives(&self) -> Result<(f64, Vec<f64>)> {
        let loglike = self.with_full(|out, _| out.log_likelihood)?;
        let positions = self.parameter_positions();
        let nobs = self.observation_model().parameter_dimension();
        let mut gradient = vec![0.0; self.parameter_dimension()];

        self.with_smoother(|smoothed| -> Result<()> {
            let obs = self.observation_model();
            for t in 0..self.time_dimension() {
                if obs.is_missing_observation(t) {
                    continue;
                }
                obs.increment_expected_gradient(
                    &mut gradient[..nobs],
                    t,
                    smoothed.observation_error_means[t],
                    smoothed.observation_error_variances[t],
                );
            }

            for (t, (mean, variance)) in smoothed
                .state_error_means
                .iter()
                .zip(&smoothed.state_error_variances)
                .enumerate()
            {
                for (s, model) in self.state_models().enumerate() {
                    let start = positions[s];
                    let end = start + model.parameter_dimension();
                    let m = self.state_error_component(mean, s)?;
                    let v = self.state_error_variance_component(variance, s)?;
                    model.increment_expected_gradient(&mut gradient[start..end], t, &m, &v);
                }
            }
            Ok(())
        })??;

        Ok((loglike, gradient))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use crate::observation::GaussianObservationModel;
    use crate::state_models::{LocalLevelStateModel, LocalLinearTrendStateModel, SeasonalStateModel};
    use crate::state_space::tests::local_level_model;
    use crate::state_space::StateSpaceModel;

    fn numerical_gradient(model: &mut StateSpaceModel, params: &[f64]) -> Vec<f64> {
        let mut grad = vec![0.0; params.len()];
        for i in 0..params.len() {
            let h = 1e-6 * params[i].abs().max(1e-3);
            let mut up = params.to_vec();
            let mut down = params.to_vec();
            up[i] += h;
            down[i] -= h;
            let f_up = model.log_likelihood_at(&up).unwrap();
            let f_down = model.log_likelihood_at(&down).unwrap();
            grad[i] = (f_up - f_down) / (2.0 * h);
        }
        grad
    }

    fn assert_gradients_match(model: &mut StateSpaceModel, tol: f64) {
        let params = model.vectorize_params();
        let (_, analytic) = model.log_likelihood_derivatives().unwrap();
        let numeric = numerical_gradient(model, &params);
        for i in 0..params.len() {
            let scale = numeric[i].abs().max(1.0);
            assert!(
                (analytic[i] - numeric[i]).abs() < tol * scale,
                "param {}: analytic {} vs numeric {}",
                i,
                analytic[i],
                numeric[i]
            );
        }
    }

    #[test]
    fn test_local_level_gradient_matches_numerical() {
        let y = [1.0, 2.2, f64::NAN, 1.4, 0.9, 2.5, 1.7, f64::NAN, 2.0];
        let mut model = local_level_model(&y, 0.7, 0.3);
        assert_gradients_match(&mut model, 1e-4);
    }

    #[test]
    fn test_gradient_zero_at_mle_direction() {
        // Along the observation variance, the score changes sign across the optimum.
        let y = [0.1, -0.3, 0.4, 0.2, -0.1, 0.0, 0.3];
        let mut model = local_level_model(&y, 0.05, 0.01);
        let (_, g_small) = model.log_likelihood_derivatives_at(&[0.005, 0.01]).unwrap();
        let (_, g_large) = model.log_likelihood_derivatives_at(&[5.0, 0.01]).unwrap();
        assert!(g_small[0] > 0.0);
        assert!(g_large[0] < 0.0);
    }

    #[test]
    fn test_composite_model_gradient_matches_numerical() {
        let y: Vec<f64> = (0..24)
            .map(|t| {
                let season = [1.0, -0.5, -0.5][t % 3];
                if t == 7 {
                    f64::NAN
                } else {
                    0.2 * t as f64 + season + 0.1 * ((t * 7 % 5) as f64 - 2.0)
                }
            })
            .collect();
        let obs = GaussianObservationModel::new(y, 0.3).unwrap();
        let mut model = StateSpaceModel::new(obs);
        let mut trend = LocalLinearTrendStateModel::new(0.05, 0.01).unwrap();
        trend
            .set_initial_state(crate::initialization::InitialStateDistribution::approximate_diffuse(2, 10.0))
            .unwrap();
        model.add_state(Box::new(trend)).unwrap();
        let mut seasonal = SeasonalStateModel::new(3, 0.02).unwrap();
        seasonal
            .set_initial_state(crate::initialization::InitialStateDistribution::approximate_diffuse(2, 10.0))
            .unwrap();
        model.add_state(Box::new(seasonal)).unwrap();
        assert_gradients_match(&mut model, 1e-3);
    }

    #[test]
    fn test_two_level_gradient_layout() {
        let obs = GaussianObservationModel::new(vec![1.0, 1.5, 0.7, 1.1], 0.5).unwrap();
        let mut model = StateSpaceModel::new(obs);
        let mut a = LocalLevelStateModel::new(0.2).unwrap();
        a.set_initial_state(0.0, 5.0).unwrap();
        let mut b = LocalLevelStateModel::new(0.4).unwrap();
        b.set_initial_state(0.0, 5.0).unwrap();
        model.add_state(Box::new(a)).unwrap();
        model.add_state(Box::new(b)).unwrap();
        let (_, g) = model.log_likelihood_derivatives().unwrap();
        assert_eq!(g.len(), 3);
        assert_gradients_match(&mut model, 1e-4);
    }
}
