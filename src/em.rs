//! Expectation-maximisation for the client model parameters.
//!
//! The E-step runs the full smoother and hands every client model the
//! smoothed moments of its errors.  The M-step asks each client model to
//! maximise its expected complete-data log posterior.  With no priors set
//! that is the MLE, otherwise the MAP estimate.

use log::{debug, warn};

use crate::error::{Result, StateSpaceError};
use crate::observation::ObservationModel;
use crate::smoother::SmootherOutput;
use crate::state_space::StateSpaceModel;
use crate::types::{MleConfig, MleResult};

impl<O: ObservationModel> StateSpaceModel<O> {
    /// Fill the client models' complete-data statistics with expected
    /// values given the data.  Returns the log likelihood at the current
    /// parameters.
    ///
    /// With `save_state_distributions` the smoothed state means replace
    /// the stored state, unless the state is permanently set.
    pub fn e_step(&mut self, save_state_distributions: bool) -> Result<f64> {
        self.clear_client_data();
        let loglike = self.log_likelihood()?;
        let smoothed: SmootherOutput = self.with_smoother(|s| s.clone())?;

        let n = self.time_dimension();
        let error_blocks: Vec<(usize, usize)> = (0..self.nstate())
            .map(|s| {
                (
                    self.state_error_positions()[s],
                    self.state_model(s).state_error_dimension(),
                )
            })
            .collect();
        let missing: Vec<bool> = (0..n)
            .map(|t| self.observation_model().is_missing_observation(t))
            .collect();

        let (obs, states) = self.models_mut();
        for t in 0..n {
            if !missing[t] {
                obs.update_complete_data_sufficient_statistics(
                    t,
                    smoothed.observation_error_means[t],
                    smoothed.observation_error_variances[t],
                );
            }
        }
        for (t, (mean, variance)) in smoothed
            .state_error_means
            .iter()
            .zip(&smoothed.state_error_variances)
            .enumerate()
        {
            for (model, &(pos, d)) in states.iter_mut().zip(&error_blocks) {
                let m = mean.rows(pos, d).into_owned();
                let v = variance.view((pos, pos), (d, d)).into_owned();
                model.update_complete_data_sufficient_statistics(t, &m, &v);
            }
        }

        if save_state_distributions {
            self.store_smoothed_state(smoothed.state_means);
        }
        Ok(loglike)
    }

    /// Move every client model to the mode of its complete-data posterior.
    pub fn m_step(&mut self, epsilon: f64) -> Result<()> {
        let (obs, states) = self.models_mut();
        obs.find_posterior_mode(epsilon)?;
        for model in states.iter_mut() {
            model.find_posterior_mode(epsilon)?;
        }
        Ok(())
    }

    pub fn check_that_em_is_legal(&self) -> Result<()> {
        if !self.observation_model().can_find_posterior_mode() {
            return Err(StateSpaceError::EmNotLegal(
                "the observation model cannot find a posterior mode".into(),
            ));
        }
        for (s, model) in self.state_models().enumerate() {
            if !model.can_find_posterior_mode() {
                return Err(StateSpaceError::EmNotLegal(format!(
                    "state model {} cannot find a posterior mode",
                    s
                )));
            }
        }
        Ok(())
    }

    /// MAP estimate by EM, tracking the log posterior for convergence.
    pub fn find_posterior_mode_em(&mut self, config: &MleConfig) -> Result<MleResult> {
        self.run_em(config, true)
    }

    /// EM iterations until the tracked criterion changes by less than
    /// `config.epsilon` or the iteration budget runs out.
    pub(crate) fn run_em(&mut self, config: &MleConfig, track_posterior: bool) -> Result<MleResult> {
        self.check_that_em_is_legal()?;
        let mut previous = f64::NEG_INFINITY;
        let mut converged = false;
        let mut n_iter = 0;

        for iteration in 0..config.max_iterations {
            let loglike = self.e_step(false)?;
            let criterion = if track_posterior {
                loglike + self.log_prior()
            } else {
                loglike
            };
            n_iter = iteration + 1;
            debug!("EM iteration {}: criterion {:.8}", iteration, criterion);

            if criterion < previous - 1e-8 * previous.abs().max(1.0) {
                warn!(
                    "EM criterion decreased from {} to {} at iteration {}",
                    previous, criterion, iteration
                );
            }
            if (criterion - previous).abs() < config.epsilon {
                converged = true;
                break;
            }
            previous = criterion;
            self.m_step(config.epsilon)?;
        }

        Ok(MleResult {
            params: self.vectorize_params(),
            log_likelihood: self.log_likelihood()?,
            n_params: self.parameter_dimension(),
            n_iter,
            converged,
            method: if track_posterior { "em-map" } else { "em" }.to_string(),
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use crate::error::StateSpaceError;
    use crate::observation::GaussianObservationModel;
    use crate::state_models::tests::RestrictedLevel;
    use crate::state_models::LocalLevelStateModel;
    use crate::state_space::tests::local_level_model;
    use crate::state_space::StateSpaceModel;
    use crate::types::{MleConfig, MleMethod};
    use crate::variance_sampler::{GammaPrior, GaussianVarianceSampler};

    fn sample_series() -> Vec<f64> {
        vec![
            1.2, 0.8, 1.9, 2.3, 1.7, f64::NAN, 2.9, 3.4, 2.8, 3.9, 4.2, 3.6, 4.8, f64::NAN, 5.1,
            4.7, 5.9, 6.3, 5.5, 6.8,
        ]
    }

    #[test]
    fn test_e_step_fills_sufficient_statistics() {
        let y = sample_series();
        let mut model = local_level_model(&y, 0.5, 0.3);
        let ll = model.e_step(true).unwrap();
        assert!((ll - model.log_likelihood().unwrap()).abs() < 1e-12);
        // 18 observed points, 19 transitions.
        assert!((model.observation_model().suf().n() - 18.0).abs() < 1e-12);
        let means = model.state_posterior_means().unwrap();
        assert_eq!(model.state(), &means);

        // A second E-step starts from cleared statistics.
        model.e_step(false).unwrap();
        assert!((model.observation_model().suf().n() - 18.0).abs() < 1e-12);
    }

    #[test]
    fn test_em_increases_likelihood_monotonically() {
        let y = sample_series();
        let mut model = local_level_model(&y, 2.0, 0.01);
        let mut previous = f64::NEG_INFINITY;
        for _ in 0..15 {
            let ll = model.e_step(false).unwrap();
            assert!(ll >= previous - 1e-9, "EM decreased: {} -> {}", previous, ll);
            previous = ll;
            model.m_step(1e-5).unwrap();
        }
    }

    #[test]
    fn test_em_mle_converges() {
        let y = sample_series();
        let mut model = local_level_model(&y, 1.0, 1.0);
        let start = model.log_likelihood().unwrap();
        let config = MleConfig {
            method: MleMethod::Em,
            max_iterations: 2000,
            epsilon: 1e-6,
        };
        let result = model.run_em(&config, false).unwrap();
        assert!(result.n_iter <= 2000);
        assert_eq!(result.method, "em");
        assert!(result.log_likelihood > start);
        assert_eq!(result.params, model.vectorize_params());
        assert!(result.params.iter().all(|p| *p >= 0.0));
    }

    #[test]
    fn test_em_map_with_priors() {
        let y = sample_series();
        let obs = GaussianObservationModel::new(y.clone(), 1.0).unwrap();
        let mut model = StateSpaceModel::new(obs);
        let mut level = LocalLevelStateModel::new(1.0).unwrap();
        level.set_initial_state(1.2, 1e3).unwrap();
        level.set_prior(GaussianVarianceSampler::new(
            GammaPrior::from_sigma_guess(0.5, 1.0).unwrap(),
        ));
        model.add_state(Box::new(level)).unwrap();
        model.observation_model_mut().set_prior(GaussianVarianceSampler::new(
            GammaPrior::from_sigma_guess(0.5, 1.0).unwrap(),
        ));

        let config = MleConfig {
            method: MleMethod::Em,
            max_iterations: 500,
            epsilon: 1e-8,
        };
        let result = model.find_posterior_mode_em(&config).unwrap();
        assert_eq!(result.method, "em-map");
        assert!(model.log_prior().is_finite());
        assert!(result.params.iter().all(|p| *p > 0.0));
    }

    #[test]
    fn test_em_not_legal_fails_before_work() {
        let y = sample_series();
        let obs = GaussianObservationModel::new(y, 1.0).unwrap();
        let mut model = StateSpaceModel::new(obs);
        let mut level = LocalLevelStateModel::new(0.5).unwrap();
        level.set_initial_state(1.0, 100.0).unwrap();
        model.add_state(Box::new(RestrictedLevel::without_posterior_mode(level))).unwrap();

        assert!(matches!(
            model.check_that_em_is_legal(),
            Err(StateSpaceError::EmNotLegal(_))
        ));
        let err = model.find_posterior_mode_em(&MleConfig::default()).unwrap_err();
        assert!(matches!(err, StateSpaceError::EmNotLegal(_)));
        // Nothing was filtered.
        assert!(!model.kalman_filter_is_current());
    }
}
