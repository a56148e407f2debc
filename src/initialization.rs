use nalgebra::{DMatrix, DVector};

use crate::error::{Result, StateSpaceError};

/// Prior distribution of a state model's initial state, N(mean, variance).
#[derive(Debug, Clone)]
pub struct InitialStateDistribution {
    /// Initial state mean a_0.
    pub mean: DVector<f64>,
    /// Initial state variance P_0.
    pub variance: DMatrix<f64>,
}

impl InitialStateDistribution {
    /// Validates that the variance is square, conformable with the mean and
    /// symmetric with a non-negative diagonal.
    pub fn new(mean: DVector<f64>, variance: DMatrix<f64>) -> Result<Self> {
        let k = mean.len();
        if variance.nrows() != k || variance.ncols() != k {
            return Err(StateSpaceError::DimensionMismatch(format!(
                "initial state variance is {}x{}, mean has length {}",
                variance.nrows(),
                variance.ncols(),
                k
            )));
        }
        for i in 0..k {
            if !(variance[(i, i)] >= 0.0) {
                return Err(StateSpaceError::Configuration(format!(
                    "initial state variance has invalid diagonal element {} at {}",
                    variance[(i, i)],
                    i
                )));
            }
            for j in 0..i {
                let scale = variance[(i, j)].abs().max(variance[(j, i)].abs()).max(1.0);
                if (variance[(i, j)] - variance[(j, i)]).abs() > 1e-10 * scale {
                    return Err(StateSpaceError::Configuration(
                        "initial state variance is not symmetric".into(),
                    ));
                }
            }
        }
        Ok(Self { mean, variance })
    }

    /// Approximate diffuse initialization.
    /// - a_0 = 0
    /// - P_0 = kappa * I_{k_states}
    pub fn approximate_diffuse(k_states: usize, kappa: f64) -> Self {
        Self {
            mean: DVector::zeros(k_states),
            variance: DMatrix::identity(k_states, k_states) * kappa,
        }
    }

    /// Scalar N(mean, variance), the usual single-state prior.
    pub fn scalar(mean: f64, variance: f64) -> Result<Self> {
        Self::new(
            DVector::from_element(1, mean),
            DMatrix::from_element(1, 1, variance),
        )
    }

    pub fn dimension(&self) -> usize {
        self.mean.len()
    }

    /// Default kappa value for the approximate diffuse prior.
    pub fn default_kappa() -> f64 {
        1e6
    }
}
