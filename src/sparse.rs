//! Simple sparse matrix and BiCGSTAB solver.
//!
//! This module provides a lightweight sparse matrix implementation (CSR
//! format) and a BiCGSTAB solver. The smoothing systems solved here are
//! row-normalized and therefore not symmetric, which rules out plain
//! conjugate gradients; they are strictly diagonally dominant, so
//! BiCGSTAB converges quickly, especially when warm-started.

use nalgebra::DVector;

use crate::error::{Result, SolveError};

/// Sparse matrix in compressed sparse row layout.
///
/// Each row's entries are stored contiguously, so matrix-vector products
/// and per-row neighbor scans walk a single slice.
#[derive(Debug, Clone)]
pub struct CsrMatrix {
    rows: usize,
    cols: usize,
    /// Offsets into `col_idx`/`values`; row `i` occupies the half-open
    /// range `row_ptr[i]..row_ptr[i + 1]`.
    row_ptr: Vec<usize>,
    col_idx: Vec<usize>,
    values: Vec<f64>,
}

impl CsrMatrix {
    /// Assemble from `(row, col, value)` triplets, in any order.
    ///
    /// Triplets landing on the same position are summed.
    pub fn from_triplets(rows: usize, cols: usize, mut triplets: Vec<(usize, usize, f64)>) -> Self {
        triplets.sort_unstable_by_key(|&(r, c, _)| (r, c));

        // Coalesce duplicates; sorting put them adjacent.
        let mut merged: Vec<(usize, usize, f64)> = Vec::with_capacity(triplets.len());
        for (row, col, val) in triplets {
            match merged.last_mut() {
                Some(last) if last.0 == row && last.1 == col => last.2 += val,
                _ => merged.push((row, col, val)),
            }
        }

        // Per-row counts, prefix-summed into offsets.
        let mut row_ptr = vec![0usize; rows + 1];
        for &(row, _, _) in &merged {
            row_ptr[row + 1] += 1;
        }
        for r in 0..rows {
            row_ptr[r + 1] += row_ptr[r];
        }

        let (col_idx, values) = merged.into_iter().map(|(_, c, v)| (c, v)).unzip();
        Self {
            rows,
            cols,
            row_ptr,
            col_idx,
            values,
        }
    }

    /// Row count.
    #[inline]
    pub fn nrows(&self) -> usize {
        self.rows
    }

    /// Column count.
    #[inline]
    pub fn ncols(&self) -> usize {
        self.cols
    }

    /// Number of stored entries.
    #[inline]
    pub fn nnz(&self) -> usize {
        self.values.len()
    }

    /// The stored entries of row `i` as `(column, value)` pairs.
    #[inline]
    pub fn row(&self, i: usize) -> impl Iterator<Item = (usize, f64)> + '_ {
        let span = self.row_ptr[i]..self.row_ptr[i + 1];
        self.col_idx[span.clone()]
            .iter()
            .copied()
            .zip(self.values[span].iter().copied())
    }

    /// The product `A * x`.
    pub fn mul_vec(&self, x: &DVector<f64>) -> DVector<f64> {
        assert_eq!(x.len(), self.cols, "vector length must match column count");
        DVector::from_fn(self.rows, |i, _| {
            self.row(i).map(|(j, v)| v * x[j]).sum()
        })
    }
}

/// Solve A*x = b using the BiCGSTAB method.
///
/// Works for general non-symmetric square systems; intended here for the
/// diagonally dominant smoothing operator, where convergence is fast.
///
/// # Arguments
///
/// * `a` - The system matrix (square)
/// * `b` - The right-hand side vector
/// * `x0` - Optional initial guess (zeros if None)
/// * `max_iter` - Maximum number of iterations
/// * `tolerance` - Convergence tolerance (relative residual norm)
///
/// # Returns
///
/// The solution vector x, or an error if convergence fails.
pub fn bicgstab(
    a: &CsrMatrix,
    b: &DVector<f64>,
    x0: Option<&DVector<f64>>,
    max_iter: usize,
    tolerance: f64,
) -> Result<DVector<f64>> {
    let n = b.len();
    assert_eq!(a.nrows(), n, "Matrix-vector dimension mismatch");
    assert_eq!(a.ncols(), n, "Matrix must be square");

    let mut x = match x0 {
        Some(x0) => x0.clone(),
        None => DVector::zeros(n),
    };

    let b_norm = b.norm();
    if b_norm < 1e-15 {
        return Ok(DVector::zeros(n));
    }

    // r = b - A*x
    let mut r = b - a.mul_vec(&x);
    if r.norm() / b_norm < tolerance {
        return Ok(x);
    }

    // Shadow residual, kept fixed
    let r_hat = r.clone();

    let mut rho = 1.0;
    let mut alpha = 1.0;
    let mut omega = 1.0;
    let mut v = DVector::zeros(n);
    let mut p = DVector::zeros(n);

    for _iter in 0..max_iter {
        let rho_next = r_hat.dot(&r);
        if rho_next.abs() < 1e-30 {
            // Breakdown: restart from the current residual
            r = b - a.mul_vec(&x);
            if r.norm() / b_norm < tolerance {
                return Ok(x);
            }
            break;
        }

        let beta = (rho_next / rho) * (alpha / omega);
        p = &r + beta * (&p - omega * &v);
        v = a.mul_vec(&p);

        let denom = r_hat.dot(&v);
        if denom.abs() < 1e-30 {
            break;
        }
        alpha = rho_next / denom;

        let s = &r - alpha * &v;
        if s.norm() / b_norm < tolerance {
            x += alpha * &p;
            return Ok(x);
        }

        let t = a.mul_vec(&s);
        let tt = t.dot(&t);
        if tt.abs() < 1e-30 {
            break;
        }
        omega = t.dot(&s) / tt;

        x += alpha * &p + omega * &s;
        r = s - omega * &t;

        if r.norm() / b_norm < tolerance {
            return Ok(x);
        }

        rho = rho_next;
    }

    Err(SolveError::ConvergenceFailed {
        iterations: max_iter,
    })
}
