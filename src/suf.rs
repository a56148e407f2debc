/// Complete-data sufficient statistics for a zero-mean Gaussian error.
///
/// Besides realised draws (`add`), the EM algorithm feeds in smoothed
/// moments through `add_expected`, accumulating E(x^2) = mean^2 + variance.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct GaussianSuf {
    n: f64,
    sum: f64,
    sumsq: f64,
}

impl GaussianSuf {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }

    pub fn add(&mut self, x: f64) {
        self.n += 1.0;
        self.sum += x;
        self.sumsq += x * x;
    }

    pub fn add_expected(&mut self, mean: f64, variance: f64) {
        self.n += 1.0;
        self.sum += mean;
        self.sumsq += mean * mean + variance;
    }

    pub fn combine(&mut self, other: &GaussianSuf) {
        self.n += other.n;
        self.sum += other.sum;
        self.sumsq += other.sumsq;
    }

    pub fn n(&self) -> f64 {
        self.n
    }

    pub fn sum(&self) -> f64 {
        self.sum
    }

    pub fn sumsq(&self) -> f64 {
        self.sumsq
    }

    /// Sum of squares about `mu`.
    pub fn centered_sumsq(&self, mu: f64) -> f64 {
        self.sumsq - 2.0 * mu * self.sum + self.n * mu * mu
    }

    pub fn mean(&self) -> f64 {
        if self.n > 0.0 {
            self.sum / self.n
        } else {
            0.0
        }
    }
}

/// d/d(sigsq) of E log N(x | 0, sigsq) given E(x) = mean, Var(x) = variance.
pub fn expected_variance_score(sigsq: f64, mean: f64, variance: f64) -> f64 {
    -0.5 / sigsq + 0.5 * (mean * mean + variance) / (sigsq * sigsq)
}
