use std::str::FromStr;

use crate::error::StateSpaceError;

/// How a state model presents itself to the Kalman filter.
///
/// Models that are conditionally Gaussian given a latent variable are put in
/// `Mixture` mode during data augmentation and `Marginal` mode for
/// forecasting.  Purely Gaussian models behave the same way in both.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Behavior {
    #[default]
    Marginal,
    Mixture,
}

/// Signal delivered to registered data observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompleteDataEvent {
    /// Complete data sufficient statistics must be rebuilt from scratch.
    Reset,
    /// The latent data for observation `t` has changed.
    Changed(usize),
}

/// Optimisation method used by `mle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MleMethod {
    Lbfgs,
    NelderMead,
    Em,
}

impl MleMethod {
    pub fn name(&self) -> &'static str {
        match self {
            MleMethod::Lbfgs => "lbfgs",
            MleMethod::NelderMead => "nelder-mead",
            MleMethod::Em => "em",
        }
    }
}

impl FromStr for MleMethod {
    type Err = StateSpaceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "lbfgs" | "bfgs" => Ok(MleMethod::Lbfgs),
            "nelder-mead" | "nm" => Ok(MleMethod::NelderMead),
            "em" => Ok(MleMethod::Em),
            other => Err(StateSpaceError::Configuration(format!(
                "unknown MLE method '{}'",
                other
            ))),
        }
    }
}

/// MLE configuration.
#[derive(Debug, Clone)]
pub struct MleConfig {
    pub method: MleMethod,
    /// Iteration budget for the optimiser (EM iterations for `Em`).
    pub max_iterations: u64,
    /// Convergence is declared when consecutive log likelihood values differ
    /// by less than `epsilon`.
    pub epsilon: f64,
}

impl Default for MleConfig {
    fn default() -> Self {
        Self {
            method: MleMethod::Lbfgs,
            max_iterations: 500,
            epsilon: 1e-5,
        }
    }
}

/// Result of an MLE or EM-MAP run.
#[derive(Debug, Clone)]
pub struct MleResult {
    pub params: Vec<f64>,
    pub log_likelihood: f64,
    pub n_params: usize,
    pub n_iter: u64,
    pub converged: bool,
    pub method: String,
}
