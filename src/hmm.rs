//! Hidden Markov model latent-data imputation.
//!
//! Each sequence is filtered forward with log-space scaling, then its
//! hidden path is drawn backwards.  The draws feed transition counts and
//! the mixture components' sufficient statistics.  Sequences are
//! independent given the parameters, so with more than one worker they are
//! split round-robin over a rayon pool.  Each worker owns a private
//! `HmmDataImputer` and the coordinator merges them after the join.

use std::fmt::Debug;

use log::debug;
use nalgebra::{DMatrix, DVector};
use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};
use rayon::prelude::*;

use crate::error::{Result, StateSpaceError};
use crate::suf::GaussianSuf;

/// Emission distribution of one hidden state.
pub trait MixtureComponent: Clone + Send + Debug {
    fn log_density(&self, y: f64) -> f64;
    fn add_data(&mut self, y: f64);
    fn clear_data(&mut self);
    /// Add another component's sufficient statistics to this one's.
    fn combine_data(&mut self, other: &Self);
}

/// N(mean, sigsq) emissions.
#[derive(Debug, Clone)]
pub struct GaussianMixtureComponent {
    mean: f64,
    sigsq: f64,
    suf: GaussianSuf,
}

impl GaussianMixtureComponent {
    pub fn new(mean: f64, sigsq: f64) -> Result<Self> {
        if !(sigsq > 0.0 && sigsq.is_finite()) || !mean.is_finite() {
            return Err(StateSpaceError::Configuration(format!(
                "invalid Gaussian component N({}, {})",
                mean, sigsq
            )));
        }
        Ok(Self {
            mean,
            sigsq,
            suf: GaussianSuf::new(),
        })
    }

    pub fn mean(&self) -> f64 {
        self.mean
    }

    pub fn sigsq(&self) -> f64 {
        self.sigsq
    }

    pub fn suf(&self) -> &GaussianSuf {
        &self.suf
    }

    /// Set the parameters to their complete-data MLE.  Needs two or more
    /// observations and a positive spread; otherwise nothing changes.
    pub fn mle(&mut self) {
        let n = self.suf.n();
        if n < 2.0 {
            return;
        }
        let mean = self.suf.mean();
        let sigsq = self.suf.centered_sumsq(mean) / n;
        if sigsq > 0.0 {
            self.mean = mean;
            self.sigsq = sigsq;
        }
    }
}

impl MixtureComponent for GaussianMixtureComponent {
    fn log_density(&self, y: f64) -> f64 {
        let r = y - self.mean;
        -0.5 * ((2.0 * std::f64::consts::PI * self.sigsq).ln() + r * r / self.sigsq)
    }

    fn add_data(&mut self, y: f64) {
        self.suf.add(y);
    }

    fn clear_data(&mut self) {
        self.suf.clear();
    }

    fn combine_data(&mut self, other: &Self) {
        self.suf.combine(&other.suf);
    }
}

// ---------------------------------------------------------------------------
// Forward filter / backward sampler
// ---------------------------------------------------------------------------

/// Filtered state probabilities for every t plus the log likelihood.
/// Non-finite observations carry no information.
fn forward<C: MixtureComponent>(
    y: &[f64],
    transition: &DMatrix<f64>,
    initial: &DVector<f64>,
    components: &[C],
) -> Result<(f64, Vec<DVector<f64>>)> {
    let nstates = initial.len();
    let mut loglike = 0.0;
    let mut filtered: Vec<DVector<f64>> = Vec::with_capacity(y.len());

    for (t, &obs) in y.iter().enumerate() {
        let log_emission = DVector::from_fn(nstates, |s, _| {
            if obs.is_finite() {
                components[s].log_density(obs)
            } else {
                0.0
            }
        });
        let shift = log_emission.max();
        let prior = match filtered.last() {
            None => initial.clone(),
            Some(previous) => transition.tr_mul(previous),
        };
        let mut probs = prior.zip_map(&log_emission, |p, l| p * (l - shift).exp());
        let total = probs.sum();
        if !(total > 0.0 && total.is_finite()) {
            return Err(StateSpaceError::DataError(format!(
                "observation {} at t = {} has zero probability under every state",
                obs, t
            )));
        }
        probs /= total;
        loglike += total.ln() + shift;
        filtered.push(probs);
    }
    Ok((loglike, filtered))
}

fn sample_index(rng: &mut dyn RngCore, weights: &DVector<f64>) -> usize {
    let total = weights.sum();
    let u = rng.gen_range(0.0..1.0) * total;
    let mut cumulative = 0.0;
    for (i, w) in weights.iter().enumerate() {
        cumulative += w;
        if u < cumulative {
            return i;
        }
    }
    weights.len() - 1
}

/// Per-worker accumulator for a disjoint subset of sequences.
#[derive(Debug)]
struct HmmDataImputer<C: MixtureComponent> {
    components: Vec<C>,
    transition_counts: DMatrix<f64>,
    initial_counts: DVector<f64>,
    sequences: Vec<usize>,
    rng: StdRng,
    loglike: f64,
}

impl<C: MixtureComponent> HmmDataImputer<C> {
    fn new(components: &[C], sequences: Vec<usize>, seed: u64) -> Self {
        let nstates = components.len();
        let mut components = components.to_vec();
        for c in components.iter_mut() {
            c.clear_data();
        }
        Self {
            components,
            transition_counts: DMatrix::zeros(nstates, nstates),
            initial_counts: DVector::zeros(nstates),
            sequences,
            rng: StdRng::seed_from_u64(seed),
            loglike: 0.0,
        }
    }

    fn impute(&mut self, data: &[Vec<f64>], transition: &DMatrix<f64>, initial: &DVector<f64>) -> Result<()> {
        for &i in &self.sequences {
            let y = &data[i];
            if y.is_empty() {
                continue;
            }
            let (loglike, filtered) = forward(y, transition, initial, &self.components)?;
            self.loglike += loglike;

            let last = y.len() - 1;
            let mut next = sample_index(&mut self.rng, &filtered[last]);
            if y[last].is_finite() {
                self.components[next].add_data(y[last]);
            }
            for t in (0..last).rev() {
                let weights = filtered[t].component_mul(&transition.column(next));
                let current = sample_index(&mut self.rng, &weights);
                self.transition_counts[(current, next)] += 1.0;
                if y[t].is_finite() {
                    self.components[current].add_data(y[t]);
                }
                next = current;
            }
            self.initial_counts[next] += 1.0;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Model
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct HiddenMarkovModel<C: MixtureComponent> {
    transition: DMatrix<f64>,
    initial: DVector<f64>,
    components: Vec<C>,
    sequences: Vec<Vec<f64>>,
    nthreads: usize,
    transition_counts: DMatrix<f64>,
    initial_counts: DVector<f64>,
    saved_loglike: f64,
}

impl<C: MixtureComponent> HiddenMarkovModel<C> {
    /// `transition[(r, s)]` is P(h[t+1] = s | h[t] = r).
    pub fn new(transition: DMatrix<f64>, initial: DVector<f64>, components: Vec<C>) -> Result<Self> {
        let nstates = components.len();
        if nstates == 0 {
            return Err(StateSpaceError::Configuration(
                "a hidden Markov model needs at least one state".into(),
            ));
        }
        if transition.nrows() != nstates || transition.ncols() != nstates || initial.len() != nstates {
            return Err(StateSpaceError::DimensionMismatch(format!(
                "{} components need a {}x{} transition matrix and {} initial probabilities",
                nstates, nstates, nstates, nstates
            )));
        }
        check_distribution(initial.iter().copied(), "initial distribution")?;
        for r in 0..nstates {
            check_distribution(transition.row(r).iter().copied(), "transition matrix row")?;
        }
        Ok(Self {
            transition,
            initial,
            components,
            sequences: Vec::new(),
            nthreads: 1,
            transition_counts: DMatrix::zeros(nstates, nstates),
            initial_counts: DVector::zeros(nstates),
            saved_loglike: f64::NEG_INFINITY,
        })
    }

    pub fn add_sequence(&mut self, y: Vec<f64>) {
        self.sequences.push(y);
    }

    pub fn nsequences(&self) -> usize {
        self.sequences.len()
    }

    pub fn nstates(&self) -> usize {
        self.components.len()
    }

    /// Worker count for `impute_latent_data`.  Zero is treated as one.
    pub fn set_nthreads(&mut self, n: usize) {
        self.nthreads = n.max(1);
    }

    pub fn nthreads(&self) -> usize {
        self.nthreads
    }

    pub fn components(&self) -> &[C] {
        &self.components
    }

    pub fn components_mut(&mut self) -> &mut [C] {
        &mut self.components
    }

    pub fn transition_matrix(&self) -> &DMatrix<f64> {
        &self.transition
    }

    pub fn transition_counts(&self) -> &DMatrix<f64> {
        &self.transition_counts
    }

    pub fn initial_counts(&self) -> &DVector<f64> {
        &self.initial_counts
    }

    /// Log likelihood recorded by the last imputation.
    pub fn saved_log_likelihood(&self) -> f64 {
        self.saved_loglike
    }

    /// Log likelihood of all sequences, forward pass only.
    pub fn log_likelihood(&self) -> Result<f64> {
        self.sequences
            .iter()
            .filter(|y| !y.is_empty())
            .map(|y| forward(y, &self.transition, &self.initial, &self.components).map(|(ll, _)| ll))
            .sum()
    }

    fn clear_data(&mut self) {
        self.transition_counts.fill(0.0);
        self.initial_counts.fill(0.0);
        for c in self.components.iter_mut() {
            c.clear_data();
        }
    }

    /// Draw every sequence's hidden path and rebuild the complete-data
    /// statistics from the draws.  Returns the log likelihood.
    pub fn impute_latent_data(&mut self, rng: &mut dyn RngCore) -> Result<f64> {
        let loglike = if self.nthreads > 1 && self.sequences.len() > 1 {
            self.impute_latent_data_with_threads(rng)?
        } else {
            self.clear_data();
            let mut imputer =
                HmmDataImputer::new(&self.components, (0..self.sequences.len()).collect(), rng.next_u64());
            imputer.impute(&self.sequences, &self.transition, &self.initial)?;
            self.merge(&imputer);
            imputer.loglike
        };
        self.saved_loglike = loglike;
        Ok(loglike)
    }

    fn impute_latent_data_with_threads(&mut self, rng: &mut dyn RngCore) -> Result<f64> {
        self.clear_data();
        let nworkers = self.nthreads.min(self.sequences.len());
        let mut imputers: Vec<HmmDataImputer<C>> = (0..nworkers)
            .map(|w| {
                let owned = (w..self.sequences.len()).step_by(nworkers).collect();
                HmmDataImputer::new(&self.components, owned, rng.next_u64())
            })
            .collect();

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(nworkers)
            .build()
            .map_err(|e| StateSpaceError::Configuration(format!("failed to build thread pool: {}", e)))?;
        debug!(
            "imputing {} sequences on {} workers",
            self.sequences.len(),
            nworkers
        );

        let (sequences, transition, initial) = (&self.sequences, &self.transition, &self.initial);
        pool.install(|| {
            imputers
                .par_iter_mut()
                .map(|imputer| imputer.impute(sequences, transition, initial))
                .collect::<Result<Vec<()>>>()
        })?;

        let mut loglike = 0.0;
        for imputer in &imputers {
            self.merge(imputer);
            loglike += imputer.loglike;
        }
        Ok(loglike)
    }

    fn merge(&mut self, imputer: &HmmDataImputer<C>) {
        self.transition_counts += &imputer.transition_counts;
        self.initial_counts += &imputer.initial_counts;
        for (mine, theirs) in self.components.iter_mut().zip(&imputer.components) {
            mine.combine_data(theirs);
        }
    }
}

fn check_distribution(probs: impl Iterator<Item = f64>, what: &str) -> Result<()> {
    let mut total = 0.0;
    for p in probs {
        if !(p >= 0.0 && p.is_finite()) {
            return Err(StateSpaceError::Configuration(format!(
                "{} has invalid probability {}",
                what, p
            )));
        }
        total += p;
    }
    if (total - 1.0).abs() > 1e-8 {
        return Err(StateSpaceError::Configuration(format!(
            "{} sums to {}, not 1",
            what, total
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn two_state_model() -> HiddenMarkovModel<GaussianMixtureComponent> {
        let transition = DMatrix::from_row_slice(2, 2, &[0.9, 0.1, 0.2, 0.8]);
        let initial = DVector::from_vec(vec![0.5, 0.5]);
        let components = vec![
            GaussianMixtureComponent::new(0.0, 1.0).unwrap(),
            GaussianMixtureComponent::new(5.0, 1.0).unwrap(),
        ];
        HiddenMarkovModel::new(transition, initial, components).unwrap()
    }

    fn add_sequences(model: &mut HiddenMarkovModel<GaussianMixtureComponent>, count: usize) {
        for k in 0..count {
            let y = (0..25)
                .map(|t| {
                    let base = if (t / 5 + k) % 2 == 0 { 0.0 } else { 5.0 };
                    base + 0.3 * (((t * 7 + k * 3) % 11) as f64 / 11.0 - 0.5)
                })
                .collect();
            model.add_sequence(y);
        }
    }

    #[test]
    fn test_forward_matches_brute_force() {
        // Two time points: sum over all four hidden paths.
        let model = two_state_model();
        let y = [0.3, 4.1];
        let c = model.components();
        let mut total = 0.0;
        for h0 in 0..2 {
            for h1 in 0..2 {
                total += model.initial[h0]
                    * c[h0].log_density(y[0]).exp()
                    * model.transition[(h0, h1)]
                    * c[h1].log_density(y[1]).exp();
            }
        }
        let (ll, filtered) = forward(&y, &model.transition, &model.initial, c).unwrap();
        assert!((ll - total.ln()).abs() < 1e-10);
        assert!((filtered[1].sum() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_missing_observation_is_uninformative() {
        let model = two_state_model();
        let c = model.components();
        let (ll_full, _) = forward(&[0.3], &model.transition, &model.initial, c).unwrap();
        let (ll_gap, _) = forward(&[0.3, f64::NAN], &model.transition, &model.initial, c).unwrap();
        assert!((ll_full - ll_gap).abs() < 1e-12);
    }

    #[test]
    fn test_invalid_configuration() {
        let bad_rows = HiddenMarkovModel::new(
            DMatrix::from_row_slice(2, 2, &[0.5, 0.6, 0.5, 0.5]),
            DVector::from_vec(vec![0.5, 0.5]),
            vec![
                GaussianMixtureComponent::new(0.0, 1.0).unwrap(),
                GaussianMixtureComponent::new(1.0, 1.0).unwrap(),
            ],
        );
        assert!(matches!(bad_rows, Err(StateSpaceError::Configuration(_))));
        assert!(GaussianMixtureComponent::new(0.0, 0.0).is_err());
    }

    #[test]
    fn test_sequential_imputation_counts() {
        let mut model = two_state_model();
        add_sequences(&mut model, 3);
        let mut rng = StdRng::seed_from_u64(5);
        let ll = model.impute_latent_data(&mut rng).unwrap();
        assert!((ll - model.log_likelihood().unwrap()).abs() < 1e-8);
        assert!((model.saved_log_likelihood() - ll).abs() < 1e-15);

        // 3 sequences of 25: 72 transitions, 3 initial states, 75 points.
        assert!((model.transition_counts().sum() - 72.0).abs() < 1e-12);
        assert!((model.initial_counts().sum() - 3.0).abs() < 1e-12);
        let n: f64 = model.components().iter().map(|c| c.suf().n()).sum();
        assert!((n - 75.0).abs() < 1e-12);

        // Well-separated states: the draws recover the emission means.
        let mut fitted = model.components_mut().to_vec();
        for c in fitted.iter_mut() {
            c.mle();
        }
        assert!(fitted[0].mean().abs() < 0.2);
        assert!((fitted[1].mean() - 5.0).abs() < 0.2);
    }

    #[test]
    fn test_threaded_imputation_matches_sequential_totals() {
        let mut sequential = two_state_model();
        let mut threaded = two_state_model();
        add_sequences(&mut sequential, 7);
        add_sequences(&mut threaded, 7);
        threaded.set_nthreads(3);
        assert_eq!(threaded.nthreads(), 3);

        let mut rng = StdRng::seed_from_u64(11);
        let ll_seq = sequential.impute_latent_data(&mut rng).unwrap();
        let ll_thr = threaded.impute_latent_data(&mut rng).unwrap();
        assert!((ll_seq - ll_thr).abs() < 1e-8);
        assert!((threaded.transition_counts().sum() - 7.0 * 24.0).abs() < 1e-12);
        assert!((threaded.initial_counts().sum() - 7.0).abs() < 1e-12);

        // A second round clears the previous statistics first.
        threaded.impute_latent_data(&mut rng).unwrap();
        assert!((threaded.initial_counts().sum() - 7.0).abs() < 1e-12);
    }

    #[test]
    fn test_threaded_imputation_is_reproducible() {
        let mut a = two_state_model();
        let mut b = two_state_model();
        add_sequences(&mut a, 6);
        add_sequences(&mut b, 6);
        a.set_nthreads(4);
        b.set_nthreads(4);
        a.impute_latent_data(&mut StdRng::seed_from_u64(99)).unwrap();
        b.impute_latent_data(&mut StdRng::seed_from_u64(99)).unwrap();
        assert_eq!(a.transition_counts(), b.transition_counts());
        assert_eq!(a.components()[0].suf(), b.components()[0].suf());
    }
}
