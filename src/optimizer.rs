//! Maximum likelihood estimation via L-BFGS with Nelder-Mead fallback,
//! or via EM.
//!
//! The optimisers work in an unconstrained space built from each
//! parameter's bounds (see `params::ParameterTransforms`).  The analytic
//! gradient comes from the disturbance smoother and is carried through
//! the transform by the chain rule.

use std::cell::RefCell;

use argmin::core::{CostFunction, Executor, Gradient, State, TerminationReason};
use argmin::solver::linesearch::MoreThuenteLineSearch;
use argmin::solver::neldermead::NelderMead;
use argmin::solver::quasinewton::LBFGS;
use log::{debug, info, warn};

use crate::error::{Result, StateSpaceError};
use crate::observation::ObservationModel;
use crate::params::ParameterTransforms;
use crate::state_space::StateSpaceModel;
use crate::types::{MleConfig, MleMethod, MleResult};

// ---------------------------------------------------------------------------
// Objective function for argmin
// ---------------------------------------------------------------------------

/// Cached fused evaluation result (cost + gradient at same params).
struct CachedEval {
    params: Vec<f64>,
    cost: f64,
    gradient: Vec<f64>,
}

/// Negative log-likelihood of a model, as a function of unconstrained
/// parameters.  Every evaluation installs the parameters temporarily and
/// leaves the model's own parameters untouched.
struct ModelObjective<'a, 'b, O: ObservationModel> {
    model: &'a RefCell<&'b mut StateSpaceModel<O>>,
    transforms: ParameterTransforms,
    /// Populated by `gradient()`, consumed by `cost()` at the same params.
    cache: RefCell<Option<CachedEval>>,
}

impl<'a, 'b, O: ObservationModel> Clone for ModelObjective<'a, 'b, O> {
    fn clone(&self) -> Self {
        ModelObjective {
            model: self.model,
            transforms: self.transforms.clone(),
            cache: RefCell::new(None),
        }
    }
}

impl<'a, 'b, O: ObservationModel> ModelObjective<'a, 'b, O> {
    fn eval_negloglike(&self, unconstrained: &[f64]) -> std::result::Result<f64, String> {
        let theta = self.transforms.constrain(unconstrained);
        let ll = self
            .model
            .borrow_mut()
            .log_likelihood_at(&theta)
            .map_err(|e| e.to_string())?;
        if ll.is_finite() {
            Ok(-ll)
        } else {
            Err("non-finite log-likelihood".to_string())
        }
    }

    /// Negative log-likelihood and its gradient in unconstrained space.
    fn eval_negloglike_with_gradient(
        &self,
        unconstrained: &[f64],
    ) -> std::result::Result<(f64, Vec<f64>), String> {
        let theta = self.transforms.constrain(unconstrained);
        let (ll, score) = self
            .model
            .borrow_mut()
            .log_likelihood_derivatives_at(&theta)
            .map_err(|e| e.to_string())?;
        if !ll.is_finite() {
            return Err("non-finite log-likelihood".to_string());
        }
        // d(-ll)/du = -J' d ll / d theta, J diagonal.
        let grad = self.transforms.chain_rule(unconstrained, &score);
        Ok((-ll, grad.iter().map(|&g| -g).collect()))
    }
}

impl<'a, 'b, O: ObservationModel> CostFunction for ModelObjective<'a, 'b, O> {
    type Param = Vec<f64>;
    type Output = f64;

    fn cost(&self, param: &Vec<f64>) -> std::result::Result<f64, argmin::core::Error> {
        if let Some(ref cached) = *self.cache.borrow() {
            if cached.params == *param {
                return Ok(cached.cost);
            }
        }

        match self.eval_negloglike(param) {
            Ok(c) => Ok(c),
            Err(_) => Ok(f64::MAX / 2.0), // penalty for invalid parameters
        }
    }
}

impl<'a, 'b, O: ObservationModel> Gradient for ModelObjective<'a, 'b, O> {
    type Param = Vec<f64>;
    type Gradient = Vec<f64>;

    fn gradient(&self, param: &Vec<f64>) -> std::result::Result<Vec<f64>, argmin::core::Error> {
        if let Some(ref cached) = *self.cache.borrow() {
            if cached.params == *param {
                return Ok(cached.gradient.clone());
            }
        }

        if let Ok((negll, grad)) = self.eval_negloglike_with_gradient(param) {
            if negll.is_finite() && grad.iter().all(|g| g.is_finite()) {
                *self.cache.borrow_mut() = Some(CachedEval {
                    params: param.clone(),
                    cost: negll,
                    gradient: grad.clone(),
                });
                return Ok(grad);
            }
        }

        // Fallback: numerical forward-diff (n+1 filter evaluations)
        let n = param.len();
        let mut grad = vec![0.0; n];
        let eps = f64::EPSILON.sqrt();

        let f0 = self.cost(param)?;
        let mut p_work = param.clone();

        for i in 0..n {
            let orig = p_work[i];
            p_work[i] = orig + eps;
            let f_plus = self.cost(&p_work)?;
            p_work[i] = orig;

            grad[i] = (f_plus - f0) / eps;
            if !grad[i].is_finite() {
                grad[i] = 0.0;
            }
        }

        Ok(grad)
    }
}

type RunOutcome = (Vec<f64>, f64, u64, bool);

// ---------------------------------------------------------------------------
// L-BFGS optimization
// ---------------------------------------------------------------------------

fn run_lbfgs<O: ObservationModel>(
    objective: ModelObjective<'_, '_, O>,
    init_params: Vec<f64>,
    maxiter: u64,
) -> std::result::Result<RunOutcome, String> {
    let linesearch = MoreThuenteLineSearch::new();
    let solver = LBFGS::new(linesearch, 10)
        .with_tolerance_grad(1e-5)
        .map_err(|e| e.to_string())?
        .with_tolerance_cost(1e-9)
        .map_err(|e| e.to_string())?;

    let result = Executor::new(objective, solver)
        .configure(
            |state: argmin::core::IterState<Vec<f64>, Vec<f64>, (), (), (), f64>| {
                state.param(init_params).max_iters(maxiter)
            },
        )
        .run()
        .map_err(|e| format!("L-BFGS failed: {}", e))?;

    let state = result.state();
    let best_param = state
        .get_best_param()
        .ok_or("L-BFGS: no best parameter found")?
        .clone();
    let best_cost = state.get_best_cost();
    if !best_cost.is_finite() || best_cost >= f64::MAX / 4.0 {
        return Err("L-BFGS: no valid parameter found".to_string());
    }
    let n_iter = state.get_iter();
    let term_reason = state.get_termination_reason();
    let converged = term_reason == Some(&TerminationReason::SolverConverged)
        || term_reason == Some(&TerminationReason::TargetCostReached);

    Ok((best_param, best_cost, n_iter, converged))
}

// ---------------------------------------------------------------------------
// Nelder-Mead
// ---------------------------------------------------------------------------

fn run_nelder_mead<O: ObservationModel>(
    objective: ModelObjective<'_, '_, O>,
    init_params: Vec<f64>,
    maxiter: u64,
) -> std::result::Result<RunOutcome, String> {
    let n = init_params.len();

    // Build simplex: n+1 vertices
    let mut simplex = vec![init_params.clone()];
    for i in 0..n {
        let mut vertex = init_params.clone();
        let delta = if vertex[i].abs() > 1e-8 {
            vertex[i] * 0.05
        } else {
            0.00025
        };
        vertex[i] += delta;
        simplex.push(vertex);
    }

    let solver = NelderMead::new(simplex)
        .with_sd_tolerance(1e-6)
        .map_err(|e| e.to_string())?;

    let result = Executor::new(objective, solver)
        .configure(
            |state: argmin::core::IterState<Vec<f64>, (), (), (), (), f64>| {
                state.max_iters(maxiter)
            },
        )
        .run()
        .map_err(|e| format!("Nelder-Mead failed: {}", e))?;

    let state = result.state();
    let best_param = state
        .get_best_param()
        .ok_or("Nelder-Mead: no best parameter found")?
        .clone();
    let best_cost = state.get_best_cost();
    let n_iter = state.get_iter();
    let term_reason = state.get_termination_reason();
    let converged = term_reason == Some(&TerminationReason::SolverConverged)
        || term_reason == Some(&TerminationReason::TargetCostReached);

    Ok((best_param, best_cost, n_iter, converged))
}

// ---------------------------------------------------------------------------
// Public entry point
// ---------------------------------------------------------------------------

impl<O: ObservationModel> StateSpaceModel<O> {
    /// Maximum likelihood estimate of the model parameters.
    ///
    /// The model is left at the best parameters found.  With
    /// `MleMethod::Em`, client models that carry priors contribute them to
    /// the M-step, so the result is then a MAP estimate.
    pub fn mle(&mut self, config: &MleConfig) -> Result<MleResult> {
        let n_params = self.parameter_dimension();
        let start = self.vectorize_params();
        let start_loglike = self.log_likelihood()?;

        if n_params == 0 || config.max_iterations == 0 {
            return Ok(MleResult {
                params: start,
                log_likelihood: start_loglike,
                n_params,
                n_iter: 0,
                converged: false,
                method: config.method.name().to_string(),
            });
        }

        if config.method == MleMethod::Em {
            let result = self.run_em(config, false)?;
            info!(
                "EM finished after {} iterations: loglike {:.6} (converged: {})",
                result.n_iter, result.log_likelihood, result.converged
            );
            return Ok(result);
        }

        let transforms = ParameterTransforms::from_bounds(&self.parameter_bounds());
        let unconstrained_start = transforms.unconstrain(&start)?;
        debug!(
            "starting {} from {:?} (loglike {:.6})",
            config.method.name(),
            start,
            start_loglike
        );

        let (best_unconstrained, n_iter, converged, used_method) = {
            let cell = RefCell::new(&mut *self);
            let objective = ModelObjective {
                model: &cell,
                transforms: transforms.clone(),
                cache: RefCell::new(None),
            };
            match config.method {
                MleMethod::NelderMead => {
                    let (p, _, n, conv) =
                        run_nelder_mead(objective, unconstrained_start, config.max_iterations)
                            .map_err(StateSpaceError::OptimizationFailed)?;
                    (p, n, conv, "nelder-mead".to_string())
                }
                _ => match run_lbfgs(objective.clone(), unconstrained_start.clone(), config.max_iterations) {
                    Ok((p, _, n, conv)) => (p, n, conv, "lbfgs".to_string()),
                    Err(e) => {
                        warn!("L-BFGS failed ({}), falling back to Nelder-Mead", e);
                        let (p, _, n, conv) =
                            run_nelder_mead(objective, unconstrained_start, config.max_iterations)
                                .map_err(StateSpaceError::OptimizationFailed)?;
                        (p, n, conv, "nelder-mead (fallback)".to_string())
                    }
                },
            }
        };

        let best = transforms.constrain(&best_unconstrained);
        self.unvectorize_params(&best)?;
        let mut loglike = match self.log_likelihood() {
            Ok(ll) if ll.is_finite() => ll,
            _ => f64::NEG_INFINITY,
        };
        if loglike < start_loglike {
            warn!(
                "{} ended below its starting point ({} < {}); keeping the start",
                used_method, loglike, start_loglike
            );
            self.unvectorize_params(&start)?;
            loglike = start_loglike;
        }

        info!(
            "{} finished after {} iterations: loglike {:.6} (converged: {})",
            used_method, n_iter, loglike, converged
        );

        Ok(MleResult {
            params: self.vectorize_params(),
            log_likelihood: loglike,
            n_params,
            n_iter,
            converged,
            method: used_method,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
