//! Structural time series in state space form.
//!
//! A [`StateSpaceModel`] is assembled from an observation model and an
//! ordered list of state models (local level, local linear trend,
//! seasonal, or your own [`StateModel`]).  It provides Kalman filtering
//! with missing data, disturbance and state smoothing, the simulation
//! smoother for Gibbs sampling, the log likelihood gradient, EM and
//! numerical MLE, and forecasting.

pub mod error;
pub mod types;
pub mod observer;
pub mod sparse;
pub mod initialization;
pub mod kalman;
pub mod smoother;
pub mod simulation;
pub mod suf;
pub mod variance_sampler;
pub mod state_models;
pub mod observation;
pub mod state_space;
pub mod params;
pub mod score;
pub mod em;
pub mod optimizer;
pub mod forecast;
pub mod hmm;
pub mod batch;

pub use error::{Result, StateSpaceError};
pub use forecast::{forecast, residuals, simulate_forecast, ForecastResult, ResidualOutput};
pub use initialization::InitialStateDistribution;
pub use observation::{GaussianObservationModel, ObservationModel};
pub use params::ParameterHolder;
pub use state_models::{LocalLevelStateModel, LocalLinearTrendStateModel, SeasonalStateModel, StateModel};
pub use state_space::StateSpaceModel;
pub use types::{Behavior, CompleteDataEvent, MleConfig, MleMethod, MleResult};
pub use variance_sampler::{GammaPrior, GaussianVarianceSampler};
