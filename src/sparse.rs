//! Structured system matrices for the Kalman recursions.
//!
//! State models describe their transition and variance matrices through
//! [`SparseKalmanMatrix`], so the filter can multiply by T[t] or add RQR'[t]
//! without materialising mostly-zero dense matrices.  The full-model
//! matrices are [`BlockDiagonalMatrix`] compositions of per-model blocks.

use std::fmt::Debug;
use std::sync::Arc;

use nalgebra::{DMatrix, DVector};

pub trait SparseKalmanMatrix: Send + Sync + Debug {
    fn nrow(&self) -> usize;
    fn ncol(&self) -> usize;

    /// `self * v`
    fn multiply(&self, v: &DVector<f64>) -> DVector<f64>;

    /// `self' * v`
    fn multiply_transpose(&self, v: &DVector<f64>) -> DVector<f64>;

    /// `m += self`.  `m` must be `nrow x ncol`.
    fn add_to(&self, m: &mut DMatrix<f64>);

    /// Explicit dense copy.
    fn dense(&self) -> DMatrix<f64> {
        let mut m = DMatrix::zeros(self.nrow(), self.ncol());
        self.add_to(&mut m);
        m
    }

    /// `self * m`, one column at a time.
    fn multiply_matrix(&self, m: &DMatrix<f64>) -> DMatrix<f64> {
        let mut out = DMatrix::zeros(self.nrow(), m.ncols());
        for j in 0..m.ncols() {
            let col = self.multiply(&m.column(j).into_owned());
            out.set_column(j, &col);
        }
        out
    }

    /// `self * p * self'` for symmetric `p`.
    fn sandwich(&self, p: &DMatrix<f64>) -> DMatrix<f64> {
        let tp = self.multiply_matrix(p);
        self.multiply_matrix(&tp.transpose())
    }
}

// ---------------------------------------------------------------------------
// Concrete matrices
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct DenseMatrix {
    m: DMatrix<f64>,
}

impl DenseMatrix {
    pub fn new(m: DMatrix<f64>) -> Self {
        Self { m }
    }

    pub fn matrix(&self) -> &DMatrix<f64> {
        &self.m
    }
}

impl SparseKalmanMatrix for DenseMatrix {
    fn nrow(&self) -> usize {
        self.m.nrows()
    }
    fn ncol(&self) -> usize {
        self.m.ncols()
    }
    fn multiply(&self, v: &DVector<f64>) -> DVector<f64> {
        &self.m * v
    }
    fn multiply_transpose(&self, v: &DVector<f64>) -> DVector<f64> {
        self.m.tr_mul(v)
    }
    fn add_to(&self, m: &mut DMatrix<f64>) {
        *m += &self.m;
    }
    fn multiply_matrix(&self, m: &DMatrix<f64>) -> DMatrix<f64> {
        &self.m * m
    }
    fn sandwich(&self, p: &DMatrix<f64>) -> DMatrix<f64> {
        &self.m * p * self.m.transpose()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct IdentityMatrix {
    dim: usize,
}

impl IdentityMatrix {
    pub fn new(dim: usize) -> Self {
        Self { dim }
    }
}

impl SparseKalmanMatrix for IdentityMatrix {
    fn nrow(&self) -> usize {
        self.dim
    }
    fn ncol(&self) -> usize {
        self.dim
    }
    fn multiply(&self, v: &DVector<f64>) -> DVector<f64> {
        v.clone()
    }
    fn multiply_transpose(&self, v: &DVector<f64>) -> DVector<f64> {
        v.clone()
    }
    fn add_to(&self, m: &mut DMatrix<f64>) {
        for i in 0..self.dim {
            m[(i, i)] += 1.0;
        }
    }
    fn multiply_matrix(&self, m: &DMatrix<f64>) -> DMatrix<f64> {
        m.clone()
    }
    fn sandwich(&self, p: &DMatrix<f64>) -> DMatrix<f64> {
        p.clone()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ZeroMatrix {
    nrow: usize,
    ncol: usize,
}

impl ZeroMatrix {
    pub fn new(nrow: usize, ncol: usize) -> Self {
        Self { nrow, ncol }
    }
}

impl SparseKalmanMatrix for ZeroMatrix {
    fn nrow(&self) -> usize {
        self.nrow
    }
    fn ncol(&self) -> usize {
        self.ncol
    }
    fn multiply(&self, _v: &DVector<f64>) -> DVector<f64> {
        DVector::zeros(self.nrow)
    }
    fn multiply_transpose(&self, _v: &DVector<f64>) -> DVector<f64> {
        DVector::zeros(self.ncol)
    }
    fn add_to(&self, _m: &mut DMatrix<f64>) {}
}

/// `value * I`
#[derive(Debug, Clone, Copy)]
pub struct ConstantMatrix {
    dim: usize,
    value: f64,
}

impl ConstantMatrix {
    pub fn new(dim: usize, value: f64) -> Self {
        Self { dim, value }
    }

    pub fn value(&self) -> f64 {
        self.value
    }
}

impl SparseKalmanMatrix for ConstantMatrix {
    fn nrow(&self) -> usize {
        self.dim
    }
    fn ncol(&self) -> usize {
        self.dim
    }
    fn multiply(&self, v: &DVector<f64>) -> DVector<f64> {
        v * self.value
    }
    fn multiply_transpose(&self, v: &DVector<f64>) -> DVector<f64> {
        v * self.value
    }
    fn add_to(&self, m: &mut DMatrix<f64>) {
        for i in 0..self.dim {
            m[(i, i)] += self.value;
        }
    }
    fn multiply_matrix(&self, m: &DMatrix<f64>) -> DMatrix<f64> {
        m * self.value
    }
    fn sandwich(&self, p: &DMatrix<f64>) -> DMatrix<f64> {
        p * (self.value * self.value)
    }
}

#[derive(Debug, Clone)]
pub struct DiagonalMatrix {
    diag: DVector<f64>,
}

impl DiagonalMatrix {
    pub fn new(diag: DVector<f64>) -> Self {
        Self { diag }
    }

    pub fn diagonal(&self) -> &DVector<f64> {
        &self.diag
    }
}

impl SparseKalmanMatrix for DiagonalMatrix {
    fn nrow(&self) -> usize {
        self.diag.len()
    }
    fn ncol(&self) -> usize {
        self.diag.len()
    }
    fn multiply(&self, v: &DVector<f64>) -> DVector<f64> {
        self.diag.component_mul(v)
    }
    fn multiply_transpose(&self, v: &DVector<f64>) -> DVector<f64> {
        self.diag.component_mul(v)
    }
    fn add_to(&self, m: &mut DMatrix<f64>) {
        for i in 0..self.diag.len() {
            m[(i, i)] += self.diag[i];
        }
    }
    fn sandwich(&self, p: &DMatrix<f64>) -> DMatrix<f64> {
        let n = self.diag.len();
        DMatrix::from_fn(n, n, |i, j| self.diag[i] * p[(i, j)] * self.diag[j])
    }
}

/// Transition matrix of a dummy-variable seasonal model.
///
/// First row is all -1 (the new season is minus the sum of the previous
/// S-1), with ones on the sub-diagonal shifting the remaining seasons down.
#[derive(Debug, Clone, Copy)]
pub struct SeasonalStateMatrix {
    dim: usize,
}

impl SeasonalStateMatrix {
    /// `dim` is the number of seasons minus one.
    pub fn new(dim: usize) -> Self {
        Self { dim }
    }
}

impl SparseKalmanMatrix for SeasonalStateMatrix {
    fn nrow(&self) -> usize {
        self.dim
    }
    fn ncol(&self) -> usize {
        self.dim
    }
    fn multiply(&self, v: &DVector<f64>) -> DVector<f64> {
        let mut out = DVector::zeros(self.dim);
        if self.dim == 0 {
            return out;
        }
        out[0] = -v.sum();
        for i in 1..self.dim {
            out[i] = v[i - 1];
        }
        out
    }
    fn multiply_transpose(&self, v: &DVector<f64>) -> DVector<f64> {
        let mut out = DVector::zeros(self.dim);
        if self.dim == 0 {
            return out;
        }
        for i in 0..self.dim {
            out[i] = -v[0];
            if i + 1 < self.dim {
                out[i] += v[i + 1];
            }
        }
        out
    }
    fn add_to(&self, m: &mut DMatrix<f64>) {
        for j in 0..self.dim {
            m[(0, j)] -= 1.0;
        }
        for i in 1..self.dim {
            m[(i, i - 1)] += 1.0;
        }
    }
}

/// A matrix whose only non-zero element is `value` at position (0, 0).
#[derive(Debug, Clone, Copy)]
pub struct UpperLeftCornerMatrix {
    nrow: usize,
    ncol: usize,
    value: f64,
}

impl UpperLeftCornerMatrix {
    pub fn new(nrow: usize, ncol: usize, value: f64) -> Self {
        Self { nrow, ncol, value }
    }
}

impl SparseKalmanMatrix for UpperLeftCornerMatrix {
    fn nrow(&self) -> usize {
        self.nrow
    }
    fn ncol(&self) -> usize {
        self.ncol
    }
    fn multiply(&self, v: &DVector<f64>) -> DVector<f64> {
        let mut out = DVector::zeros(self.nrow);
        if self.nrow > 0 && self.ncol > 0 {
            out[0] = self.value * v[0];
        }
        out
    }
    fn multiply_transpose(&self, v: &DVector<f64>) -> DVector<f64> {
        let mut out = DVector::zeros(self.ncol);
        if self.nrow > 0 && self.ncol > 0 {
            out[0] = self.value * v[0];
        }
        out
    }
    fn add_to(&self, m: &mut DMatrix<f64>) {
        if self.nrow > 0 && self.ncol > 0 {
            m[(0, 0)] += self.value;
        }
    }
}

// ---------------------------------------------------------------------------
// Block diagonal composition
// ---------------------------------------------------------------------------

/// Block diagonal matrix with (possibly rectangular) blocks.
#[derive(Debug, Clone, Default)]
pub struct BlockDiagonalMatrix {
    blocks: Vec<Arc<dyn SparseKalmanMatrix>>,
    row_positions: Vec<usize>,
    col_positions: Vec<usize>,
    nrow: usize,
    ncol: usize,
}

impl BlockDiagonalMatrix {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_block(&mut self, block: Arc<dyn SparseKalmanMatrix>) {
        self.row_positions.push(self.nrow);
        self.col_positions.push(self.ncol);
        self.nrow += block.nrow();
        self.ncol += block.ncol();
        self.blocks.push(block);
    }

    pub fn nblocks(&self) -> usize {
        self.blocks.len()
    }

    pub fn block(&self, i: usize) -> &Arc<dyn SparseKalmanMatrix> {
        &self.blocks[i]
    }
}

impl FromIterator<Arc<dyn SparseKalmanMatrix>> for BlockDiagonalMatrix {
    fn from_iter<I: IntoIterator<Item = Arc<dyn SparseKalmanMatrix>>>(iter: I) -> Self {
        let mut m = BlockDiagonalMatrix::new();
        for block in iter {
            m.add_block(block);
        }
        m
    }
}

impl SparseKalmanMatrix for BlockDiagonalMatrix {
    fn nrow(&self) -> usize {
        self.nrow
    }
    fn ncol(&self) -> usize {
        self.ncol
    }
    fn multiply(&self, v: &DVector<f64>) -> DVector<f64> {
        let mut out = DVector::zeros(self.nrow);
        for (i, block) in self.blocks.iter().enumerate() {
            let sub = v.rows(self.col_positions[i], block.ncol()).into_owned();
            out.rows_mut(self.row_positions[i], block.nrow())
                .copy_from(&block.multiply(&sub));
        }
        out
    }
    fn multiply_transpose(&self, v: &DVector<f64>) -> DVector<f64> {
        let mut out = DVector::zeros(self.ncol);
        for (i, block) in self.blocks.iter().enumerate() {
            let sub = v.rows(self.row_positions[i], block.nrow()).into_owned();
            out.rows_mut(self.col_positions[i], block.ncol())
                .copy_from(&block.multiply_transpose(&sub));
        }
        out
    }
    fn add_to(&self, m: &mut DMatrix<f64>) {
        for (i, block) in self.blocks.iter().enumerate() {
            let (r0, c0) = (self.row_positions[i], self.col_positions[i]);
            let mut sub = m.view((r0, c0), (block.nrow(), block.ncol())).into_owned();
            block.add_to(&mut sub);
            m.view_mut((r0, c0), (block.nrow(), block.ncol())).copy_from(&sub);
        }
    }
    fn sandwich(&self, p: &DMatrix<f64>) -> DMatrix<f64> {
        // Off-diagonal blocks of P are carried through as B_i P_ij B_j'.
        let n = self.blocks.len();
        let mut out = DMatrix::zeros(self.nrow, self.nrow);
        for i in 0..n {
            let bi = &self.blocks[i];
            for j in 0..n {
                let bj = &self.blocks[j];
                let pij = p
                    .view((self.col_positions[i], self.col_positions[j]), (bi.ncol(), bj.ncol()))
                    .into_owned();
                let left = bi.multiply_matrix(&pij);
                let full = bj.multiply_matrix(&left.transpose()).transpose();
                out.view_mut((self.row_positions[i], self.row_positions[j]), (bi.nrow(), bj.nrow()))
                    .copy_from(&full);
            }
        }
        out
    }
}

// ---------------------------------------------------------------------------
// Sparse observation vector
// ---------------------------------------------------------------------------

/// Sparse representation of the observation vector Z[t].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SparseVector {
    size: usize,
    elements: Vec<(usize, f64)>,
}

impl SparseVector {
    pub fn new(size: usize) -> Self {
        Self {
            size,
            elements: Vec::new(),
        }
    }

    /// Unit vector with a one in position `pos`.
    pub fn unit(size: usize, pos: usize) -> Self {
        let mut v = Self::new(size);
        v.set(pos, 1.0);
        v
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn set(&mut self, pos: usize, value: f64) {
        match self.elements.iter_mut().find(|(i, _)| *i == pos) {
            Some(e) => e.1 = value,
            None => {
                self.elements.push((pos, value));
                self.elements.sort_by_key(|(i, _)| *i);
            }
        }
    }

    pub fn get(&self, pos: usize) -> f64 {
        self.elements
            .iter()
            .find(|(i, _)| *i == pos)
            .map(|(_, v)| *v)
            .unwrap_or(0.0)
    }

    /// Append `other` after the current elements.
    pub fn concatenate(&mut self, other: &SparseVector) {
        let offset = self.size;
        self.elements
            .extend(other.elements.iter().map(|&(i, v)| (i + offset, v)));
        self.size += other.size;
    }

    pub fn dot(&self, v: &DVector<f64>) -> f64 {
        self.elements.iter().map(|&(i, z)| z * v[i]).sum()
    }

    /// `v += scale * z`
    pub fn add_scaled_to(&self, v: &mut DVector<f64>, scale: f64) {
        for &(i, z) in &self.elements {
            v[i] += scale * z;
        }
    }

    /// `P * z`
    pub fn matrix_product(&self, p: &DMatrix<f64>) -> DVector<f64> {
        let mut out = DVector::zeros(p.nrows());
        for &(j, z) in &self.elements {
            out.axpy(z, &p.column(j), 1.0);
        }
        out
    }

    /// `z' P z`
    pub fn sandwich(&self, p: &DMatrix<f64>) -> f64 {
        let mut total = 0.0;
        for &(i, zi) in &self.elements {
            for &(j, zj) in &self.elements {
                total += zi * p[(i, j)] * zj;
            }
        }
        total
    }

    pub fn dense(&self) -> DVector<f64> {
        let mut out = DVector::zeros(self.size);
        for &(i, v) in &self.elements {
            out[i] = v;
        }
        out
    }
}
