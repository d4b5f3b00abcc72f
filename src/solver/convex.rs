//! Constrained least-squares solver for per-vertex weight fitting.
//!
//! Solves the small normal system `min 1/2 x'Ax - b'x` subject to
//! `x >= 0` and `sum(x) = 1`, the convex-combination constraint on a
//! vertex's bone influences. `A` is the regularized Gram matrix of the
//! candidate bones (at most `nnz` of them), so the systems stay tiny and
//! dense solves are cheap.
//!
//! A primal active-set method: solve the equality-constrained KKT system
//! on the free variables, take the longest feasible step toward that
//! solution (binding the first variable that hits zero), and release the
//! bound variable with the most negative multiplier once the free
//! solution is feasible. Singular KKT systems fall back to a uniform
//! distribution over the free set; the iteration count is capped, and
//! the result is always clamped and renormalized, so the routine cannot
//! fail — degenerate inputs yield a valid convex weight vector.

use nalgebra::{DMatrix, DVector};

const EPS: f64 = 1e-12;

/// Active-set solver for non-negative, sum-to-one least squares.
#[derive(Debug, Clone)]
pub struct ConvexSolver {
    max_size: usize,
}

impl ConvexSolver {
    /// Create a solver for systems of at most `max_size` variables.
    pub fn new(max_size: usize) -> Self {
        Self { max_size }
    }

    /// Maximum system size this solver was configured for.
    #[inline]
    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Solve `min 1/2 x'Ax - b'x` with `x >= 0`, `sum(x) = 1`.
    ///
    /// `x` carries the warm start in and the solution out. The warm
    /// start is first projected to a feasible point (clamped and
    /// renormalized, uniform if it has no mass).
    pub fn solve(&self, a: &DMatrix<f64>, b: &DVector<f64>, x: &mut DVector<f64>) {
        let n = a.nrows();
        debug_assert_eq!(a.ncols(), n);
        debug_assert_eq!(b.len(), n);
        debug_assert_eq!(x.len(), n);
        debug_assert!(n <= self.max_size);

        if n == 0 {
            return;
        }
        if n == 1 {
            x[0] = 1.0;
            return;
        }

        // Feasible starting point
        for i in 0..n {
            if x[i] < 0.0 {
                x[i] = 0.0;
            }
        }
        let sum = x.sum();
        if sum > EPS {
            *x /= sum;
        } else {
            x.fill(1.0 / n as f64);
        }

        let mut free: Vec<bool> = (0..n).map(|i| x[i] > EPS).collect();
        if !free.iter().any(|&f| f) {
            free.fill(true);
        }

        for _ in 0..(4 * n + 8) {
            let f: Vec<usize> = (0..n).filter(|&i| free[i]).collect();
            let nf = f.len();

            // Equality-constrained subproblem on the free set:
            // [ A_ff  1 ] [x_f]   [b_f]
            // [ 1^T   0 ] [ l ] = [ 1 ]
            let mut kkt = DMatrix::zeros(nf + 1, nf + 1);
            let mut rhs = DVector::zeros(nf + 1);
            for (r, &i) in f.iter().enumerate() {
                for (c, &j) in f.iter().enumerate() {
                    kkt[(r, c)] = a[(i, j)];
                }
                kkt[(r, nf)] = 1.0;
                kkt[(nf, r)] = 1.0;
                rhs[r] = b[i];
            }
            rhs[nf] = 1.0;

            let (xf, lambda) = match kkt.lu().solve(&rhs) {
                Some(sol) => (sol.rows(0, nf).into_owned(), sol[nf]),
                None => (DVector::from_element(nf, 1.0 / nf as f64), 0.0),
            };

            if xf.iter().all(|&v| v >= -EPS) {
                // Feasible: accept and test the bound multipliers.
                x.fill(0.0);
                for (t, &i) in f.iter().enumerate() {
                    x[i] = xf[t].max(0.0);
                }

                let grad = a * &*x - b;
                let mut worst = -EPS;
                let mut worst_i = None;
                for i in 0..n {
                    if !free[i] {
                        let mu = grad[i] + lambda;
                        if mu < worst {
                            worst = mu;
                            worst_i = Some(i);
                        }
                    }
                }
                match worst_i {
                    None => break,
                    Some(i) => free[i] = true,
                }
            } else {
                // Step from the current feasible x toward xf, stopping
                // at the first variable that reaches zero. Both points
                // sum to 1, so the segment stays on the constraint.
                let mut alpha = 1.0f64;
                let mut bind = None;
                for (t, &i) in f.iter().enumerate() {
                    if xf[t] < 0.0 && x[i] - xf[t] > EPS {
                        let r = x[i] / (x[i] - xf[t]);
                        if r < alpha {
                            alpha = r;
                            bind = Some(i);
                        }
                    }
                }
                for (t, &i) in f.iter().enumerate() {
                    x[i] += alpha * (xf[t] - x[i]);
                }
                if let Some(i) = bind {
                    x[i] = 0.0;
                    free[i] = false;
                    if !free.iter().any(|&fr| fr) {
                        free[i] = true;
                    }
                }
            }
        }

        // Final projection guards accumulated round-off.
        for i in 0..n {
            if x[i] < 0.0 {
                x[i] = 0.0;
            }
        }
        let sum = x.sum();
        if sum > EPS {
            *x /= sum;
        } else {
            x.fill(1.0 / n as f64);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solve(a: DMatrix<f64>, b: DVector<f64>, x0: Vec<f64>) -> DVector<f64> {
        let solver = ConvexSolver::new(8);
        let mut x = DVector::from_vec(x0);
        solver.solve(&a, &b, &mut x);
        x
    }

    fn assert_feasible(x: &DVector<f64>) {
        for &v in x.iter() {
            assert!(v >= 0.0, "negative weight {v}");
        }
        assert!((x.sum() - 1.0).abs() < 1e-9, "sum {} != 1", x.sum());
    }

    #[test]
    fn test_single_variable() {
        let x = solve(DMatrix::identity(1, 1), DVector::from_vec(vec![0.3]), vec![0.2]);
        assert!((x[0] - 1.0).abs() < 1e-15);
    }

    #[test]
    fn test_identity_system_projects_to_simplex() {
        // A = I: minimizer of ||x - b|| on the simplex.
        let a = DMatrix::identity(3, 3);
        let b = DVector::from_vec(vec![0.6, 0.3, 0.1]);
        let x = solve(a, b, vec![1.0 / 3.0; 3]);
        assert_feasible(&x);
        assert!((x[0] - 0.6).abs() < 1e-9);
        assert!((x[1] - 0.3).abs() < 1e-9);
        assert!((x[2] - 0.1).abs() < 1e-9);
    }

    #[test]
    fn test_active_constraint() {
        // Unconstrained minimizer has a negative coordinate; the solver
        // must clamp it to zero and redistribute.
        let a = DMatrix::identity(2, 2);
        let b = DVector::from_vec(vec![1.5, -0.5]);
        let x = solve(a, b, vec![0.5, 0.5]);
        assert_feasible(&x);
        assert!((x[0] - 1.0).abs() < 1e-9);
        assert!(x[1].abs() < 1e-9);
    }

    #[test]
    fn test_releases_wrongly_bound_variable() {
        // Warm start puts all mass on the wrong bone.
        let a = DMatrix::identity(2, 2);
        let b = DVector::from_vec(vec![0.1, 0.9]);
        let x = solve(a, b, vec![1.0, 0.0]);
        assert_feasible(&x);
        assert!((x[1] - 0.9).abs() < 1e-9);
    }

    #[test]
    fn test_general_spd_system() {
        // A = M'M for a random-ish M; compare against the KKT solution
        // of the equality-constrained problem (interior optimum).
        let m = DMatrix::from_row_slice(3, 3, &[2.0, 0.3, 0.1, 0.2, 1.5, 0.4, 0.1, 0.2, 1.8]);
        let a = m.transpose() * &m;
        let target = DVector::from_vec(vec![0.5, 0.3, 0.2]);
        let b = &a * &target;
        let x = solve(a, b, vec![1.0 / 3.0; 3]);
        assert_feasible(&x);
        // target is feasible and stationary, so it is the optimum
        assert!((x - target).norm() < 1e-8);
    }

    #[test]
    fn test_singular_system_still_feasible() {
        let a = DMatrix::zeros(3, 3);
        let b = DVector::zeros(3);
        let x = solve(a, b, vec![0.0, 0.0, 0.0]);
        assert_feasible(&x);
    }
}
