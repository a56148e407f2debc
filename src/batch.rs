//! Rayon-based parallel batch processing for multiple independent models.
//!
//! Each model owns its own filter cache, so models are handed to workers
//! by `&mut` and never shared.

use rand::rngs::StdRng;
use rand::SeedableRng;
use rayon::prelude::*;

use crate::error::Result;
use crate::observation::ObservationModel;
use crate::state_space::StateSpaceModel;
use crate::types::{MleConfig, MleResult};

/// Log likelihood of every model at its current parameters.
pub fn batch_log_likelihood<O: ObservationModel>(models: &mut [StateSpaceModel<O>]) -> Vec<Result<f64>> {
    models.par_iter_mut().map(|m| m.log_likelihood()).collect()
}

/// Fit every model independently with the same configuration.
pub fn batch_mle<O: ObservationModel>(
    models: &mut [StateSpaceModel<O>],
    config: &MleConfig,
) -> Vec<Result<MleResult>> {
    models.par_iter_mut().map(|m| m.mle(config)).collect()
}

/// Impute the state of every model.  Model `i` draws from a generator
/// seeded with `seed + i`, so results do not depend on scheduling.
pub fn batch_impute_state<O: ObservationModel>(models: &mut [StateSpaceModel<O>], seed: u64) -> Vec<Result<()>> {
    models
        .par_iter_mut()
        .enumerate()
        .map(|(i, m)| {
            let mut rng = StdRng::seed_from_u64(seed.wrapping_add(i as u64));
            m.impute_state(&mut rng)
        })
        .collect()
}
