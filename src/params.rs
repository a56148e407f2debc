use std::ops::{Deref, DerefMut};

use log::error;

use crate::error::{Result, StateSpaceError};
use crate::observation::ObservationModel;
use crate::state_space::StateSpaceModel;

// ---------------------------------------------------------------------------
// Scoped parameter swap
// ---------------------------------------------------------------------------

/// Installs a parameter vector in a model for the lifetime of the holder
/// and restores the original parameters when dropped, on every exit path.
pub struct ParameterHolder<'a, O: ObservationModel> {
    model: &'a mut StateSpaceModel<O>,
    saved: Vec<f64>,
}

impl<'a, O: ObservationModel> ParameterHolder<'a, O> {
    pub fn new(model: &'a mut StateSpaceModel<O>, params: &[f64]) -> Result<Self> {
        let saved = model.vectorize_params();
        if let Err(e) = model.unvectorize_params(params) {
            // A partial install must not leak out.
            if let Err(restore) = model.unvectorize_params(&saved) {
                error!("failed to restore parameters after bad install: {}", restore);
            }
            return Err(e);
        }
        Ok(Self { model, saved })
    }

    pub fn saved_params(&self) -> &[f64] {
        &self.saved
    }
}

impl<'a, O: ObservationModel> Deref for ParameterHolder<'a, O> {
    type Target = StateSpaceModel<O>;

    fn deref(&self) -> &Self::Target {
        self.model
    }
}

impl<'a, O: ObservationModel> DerefMut for ParameterHolder<'a, O> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.model
    }
}

impl<'a, O: ObservationModel> Drop for ParameterHolder<'a, O> {
    fn drop(&mut self) {
        if let Err(e) = self.model.unvectorize_params(&self.saved) {
            error!("failed to restore model parameters: {}", e);
        }
    }
}

// ---------------------------------------------------------------------------
// Evaluation at arbitrary parameters
// ---------------------------------------------------------------------------

impl<O: ObservationModel> StateSpaceModel<O> {
    /// Log likelihood at `params`.  The model's own parameters are left
    /// unchanged.
    pub fn log_likelihood_at(&mut self, params: &[f64]) -> Result<f64> {
        let holder = ParameterHolder::new(self, params)?;
        holder.log_likelihood()
    }

    /// Log prior plus log likelihood at `params`.  The likelihood is not
    /// evaluated when the prior is zero.
    pub fn log_posterior_at(&mut self, params: &[f64]) -> Result<f64> {
        let holder = ParameterHolder::new(self, params)?;
        let log_prior = holder.log_prior();
        if log_prior == f64::NEG_INFINITY {
            return Ok(f64::NEG_INFINITY);
        }
        Ok(log_prior + holder.log_likelihood()?)
    }

    /// Log likelihood and its gradient at `params`.
    pub fn log_likelihood_derivatives_at(&mut self, params: &[f64]) -> Result<(f64, Vec<f64>)> {
        let holder = ParameterHolder::new(self, params)?;
        holder.log_likelihood_derivatives()
    }
}

// ---------------------------------------------------------------------------
// Transforms between bounded and unconstrained parameters
// ---------------------------------------------------------------------------

/// Constrain variance: unconstrained → positive (x^2).
pub fn constrain_variance(x: f64) -> f64 {
    x * x
}

/// Unconstrain variance: non-negative → unconstrained (sqrt).
/// Returns error if s < 0.
pub fn unconstrain_variance(s: f64) -> Result<f64> {
    if !(s >= 0.0) {
        return Err(StateSpaceError::DataError(format!(
            "variance must be non-negative, got {}",
            s
        )));
    }
    Ok(s.sqrt())
}

fn logistic(u: f64) -> f64 {
    1.0 / (1.0 + (-u).exp())
}

/// Map from an unconstrained real to a parameter within its bounds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ParamTransform {
    Identity,
    /// theta = lo + u^2
    LowerBounded(f64),
    /// theta = hi - u^2
    UpperBounded(f64),
    /// theta = lo + (hi - lo) * logistic(u)
    Interval(f64, f64),
}

impl ParamTransform {
    pub fn from_bounds(lo: f64, hi: f64) -> Self {
        match (lo.is_finite(), hi.is_finite()) {
            (false, false) => ParamTransform::Identity,
            (true, false) => ParamTransform::LowerBounded(lo),
            (false, true) => ParamTransform::UpperBounded(hi),
            (true, true) => ParamTransform::Interval(lo, hi),
        }
    }

    pub fn constrain(&self, u: f64) -> f64 {
        match *self {
            ParamTransform::Identity => u,
            ParamTransform::LowerBounded(lo) => lo + constrain_variance(u),
            ParamTransform::UpperBounded(hi) => hi - constrain_variance(u),
            ParamTransform::Interval(lo, hi) => lo + (hi - lo) * logistic(u),
        }
    }

    pub fn unconstrain(&self, theta: f64) -> Result<f64> {
        match *self {
            ParamTransform::Identity => Ok(theta),
            ParamTransform::LowerBounded(lo) => unconstrain_variance(theta - lo),
            ParamTransform::UpperBounded(hi) => unconstrain_variance(hi - theta),
            ParamTransform::Interval(lo, hi) => {
                if !(theta >= lo && theta <= hi) {
                    return Err(StateSpaceError::DataError(format!(
                        "parameter {} outside ({}, {})",
                        theta, lo, hi
                    )));
                }
                let p = ((theta - lo) / (hi - lo)).clamp(1e-12, 1.0 - 1e-12);
                Ok((p / (1.0 - p)).ln())
            }
        }
    }

    /// d theta / d u
    pub fn jacobian(&self, u: f64) -> f64 {
        match *self {
            ParamTransform::Identity => 1.0,
            ParamTransform::LowerBounded(_) => 2.0 * u,
            ParamTransform::UpperBounded(_) => -2.0 * u,
            ParamTransform::Interval(lo, hi) => {
                let s = logistic(u);
                (hi - lo) * s * (1.0 - s)
            }
        }
    }
}

/// Element-wise transforms for a whole parameter vector.
#[derive(Debug, Clone)]
pub struct ParameterTransforms {
    transforms: Vec<ParamTransform>,
}

impl ParameterTransforms {
    pub fn from_bounds(bounds: &[(f64, f64)]) -> Self {
        Self {
            transforms: bounds
                .iter()
                .map(|&(lo, hi)| ParamTransform::from_bounds(lo, hi))
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.transforms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transforms.is_empty()
    }

    pub fn constrain(&self, u: &[f64]) -> Vec<f64> {
        self.transforms
            .iter()
            .zip(u)
            .map(|(tr, &x)| tr.constrain(x))
            .collect()
    }

    pub fn unconstrain(&self, theta: &[f64]) -> Result<Vec<f64>> {
        if theta.len() != self.transforms.len() {
            return Err(StateSpaceError::ParamLengthMismatch {
                expected: self.transforms.len(),
                got: theta.len(),
            });
        }
        self.transforms
            .iter()
            .zip(theta)
            .map(|(tr, &x)| tr.unconstrain(x))
            .collect()
    }

    /// Gradient with respect to `u` given the gradient with respect to theta.
    pub fn chain_rule(&self, u: &[f64], grad_theta: &[f64]) -> Vec<f64> {
        self.transforms
            .iter()
            .zip(u.iter().zip(grad_theta))
            .map(|(tr, (&x, &g))| g * tr.jacobian(x))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
