//! Skinning weight refinement.
//!
//! With transforms fixed, every vertex's weights solve a small
//! constrained least-squares problem: minimize the reconstruction error
//! of the skinned vertex over all frames, regularized toward the
//! Laplacian-smoothed weight field and away from dense supports,
//! subject to non-negativity and affinity (sum to one). Candidate bones
//! are ranked by the smoothed field and capped at `nnz` per vertex
//! before the solve, which keeps the dense subproblems tiny.
//!
//! Per-frame transform products (`mTm`) are aggregated per subject once
//! per refinement; the per-(bone, vertex) right-hand sides (`aTb`) are
//! filled lazily, only where the smoothed field says a bone plausibly
//! influences a vertex.
//!
//! The per-vertex lock blends the system toward the identity fit of the
//! current weights; a full lock bypasses the solve so the stored column
//! survives bit for bit.

use nalgebra::{DMatrix, DVector, Matrix4, Vector4};
use rayon::prelude::*;

use super::convex::ConvexSolver;
use super::{Decomposition, SolverEvent};
use crate::error::Result;
use crate::skin::WeightMatrix;

impl Decomposition {
    /// Refine skinning weights for `n_weights_iters` passes.
    ///
    /// Initializes missing weights/transforms first (see
    /// [`Decomposition::init`]). A zero iteration count skips the phase
    /// entirely.
    pub fn compute_weights(&mut self) -> Result<()> {
        if self.options.n_weights_iters == 0 {
            return Ok(());
        }
        self.init()?;
        self.progress.report(&SolverEvent::WeightsBegin);

        let num_bones = self.num_bones;
        let num_vertices = self.motion.num_vertices();
        let mtm = self.compute_mtm();
        let mut atb: Vec<DVector<f64>> = vec![DVector::zeros(num_bones); num_vertices];
        let solver = ConvexSolver::new(self.options.nnz);
        let reg_scale = self.scale() * self.scale() * self.motion.num_frames() as f64;

        for pass in 0..self.options.n_weights_iters {
            self.progress
                .report(&SolverEvent::WeightsIterBegin { iteration: pass });

            let ws = self.compute_ws()?;
            self.fill_atb(&ws, &mut atb);

            let columns: Vec<Vec<(usize, f64)>> = (0..num_vertices)
                .into_par_iter()
                .map(|i| {
                    let lock = self.lock_weight[i];
                    if lock >= 1.0 {
                        // Fully locked: the stored column survives as-is.
                        self.weights.col(i).to_vec()
                    } else {
                        self.solve_vertex(i, lock, &mtm, &ws, &atb[i], reg_scale, &solver)
                    }
                })
                .collect();

            let triplets = columns
                .into_iter()
                .enumerate()
                .flat_map(|(i, col)| col.into_iter().map(move |(j, w)| (j, i, w)));
            self.weights = WeightMatrix::from_triplets(num_bones, num_vertices, triplets);

            if self
                .progress
                .report(&SolverEvent::WeightsIterEnd { iteration: pass })
            {
                return Ok(());
            }
        }

        self.progress.report(&SolverEvent::WeightsEnd);
        Ok(())
    }

    /// Solve the constrained system of one (non-fully-locked) vertex.
    #[allow(clippy::too_many_arguments)]
    fn solve_vertex(
        &self,
        i: usize,
        lock: f64,
        mtm: &[Matrix4<f64>],
        ws: &DMatrix<f64>,
        atb_i: &DVector<f64>,
        reg_scale: f64,
        solver: &ConvexSolver,
    ) -> Vec<(usize, f64)> {
        let num_bones = self.num_bones;
        let current = self.weights.col_dense(i);
        let diag = self.options.weights_smooth - self.options.weights_sparseness;

        // Blend the data term with an identity system pinning the
        // current weights, proportionally to the lock.
        let mut a = self.compute_ata(i, mtm);
        a /= reg_scale;
        for j in 0..num_bones {
            a[(j, j)] += diag;
        }
        a *= 1.0 - lock;
        for j in 0..num_bones {
            a[(j, j)] += lock;
        }

        let mut b = DVector::zeros(num_bones);
        for j in 0..num_bones {
            b[j] = (1.0 - lock)
                * (atb_i[j] / reg_scale + self.options.weights_smooth * ws[(j, i)])
                + lock * current[j];
        }

        // Candidate bones: rank by the (lock-blended) smoothed field,
        // keep the top nnz, and drop trailing negligible candidates.
        let rank: Vec<f64> = (0..num_bones)
            .map(|j| (1.0 - lock) * ws[(j, i)] + lock * current[j])
            .collect();
        let mut idx: Vec<usize> = (0..num_bones).collect();
        idx.sort_by(|&j1, &j2| {
            rank[j2]
                .partial_cmp(&rank[j1])
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        let mut nnzi = self.options.nnz.min(num_bones);
        while nnzi > 1 && rank[idx[nnzi - 1]] < self.options.weight_eps {
            nnzi -= 1;
        }

        // Warm start from the current weights restricted to the
        // candidate set.
        let mut x = DVector::zeros(nnzi);
        for t in 0..nnzi {
            x[t] = current[idx[t]].max(0.0);
        }
        let sum = x.sum();
        if sum > 0.1 {
            x /= sum;
        } else {
            x.fill(1.0 / nnzi as f64);
        }

        let mut a_sub = DMatrix::zeros(nnzi, nnzi);
        let mut b_sub = DVector::zeros(nnzi);
        for r in 0..nnzi {
            for c in 0..nnzi {
                a_sub[(r, c)] = a[(idx[r], idx[c])];
            }
            b_sub[r] = b[idx[r]];
        }

        solver.solve(&a_sub, &b_sub, &mut x);

        (0..nnzi)
            .filter(|&t| x[t] != 0.0)
            .map(|t| (idx[t], x[t]))
            .collect()
    }

    /// Per-subject transform products: block `[s][j1][j2]` sums
    /// `(M_k_j1 top3)^T (M_k_j2 top3)` over the subject's frames.
    fn compute_mtm(&self) -> Vec<Matrix4<f64>> {
        let num_bones = self.num_bones;
        let num_subjects = self.motion.num_subjects();
        let mut mtm = vec![Matrix4::zeros(); num_subjects * num_bones * num_bones];

        for k in 0..self.motion.num_frames() {
            let s = self.motion.subject_of(k);
            for j1 in 0..num_bones {
                let m1 = self.transforms.get(k, j1).fixed_view::<3, 4>(0, 0);
                for j2 in j1..num_bones {
                    let m2 = self.transforms.get(k, j2).fixed_view::<3, 4>(0, 0);
                    mtm[s * num_bones * num_bones + j1 * num_bones + j2] += m1.transpose() * m2;
                }
            }
        }
        for s in 0..num_subjects {
            for j1 in 0..num_bones {
                for j2 in (j1 + 1)..num_bones {
                    mtm[s * num_bones * num_bones + j2 * num_bones + j1] =
                        mtm[s * num_bones * num_bones + j1 * num_bones + j2].transpose();
                }
            }
        }
        mtm
    }

    /// Gram matrix of vertex `i`'s bone columns, evaluated through the
    /// precomputed `mTm` blocks.
    fn compute_ata(&self, i: usize, mtm: &[Matrix4<f64>]) -> DMatrix<f64> {
        let num_bones = self.num_bones;
        let num_subjects = self.motion.num_subjects();
        let mut a = DMatrix::zeros(num_bones, num_bones);

        for s in 0..num_subjects {
            let u = self.motion.rest_pos(s, i);
            let uh = Vector4::new(u.x, u.y, u.z, 1.0);
            for j1 in 0..num_bones {
                for j2 in j1..num_bones {
                    let v = uh.dot(&(mtm[s * num_bones * num_bones + j1 * num_bones + j2] * uh));
                    a[(j1, j2)] += v;
                    if j1 != j2 {
                        a[(j2, j1)] += v;
                    }
                }
            }
        }
        a
    }

    /// Laplacian-smoothed weight field, clamped and renormalized per
    /// vertex. Columns whose smoothed mass nearly vanishes fall back to
    /// a uniform distribution.
    fn compute_ws(&self) -> Result<DMatrix<f64>> {
        let num_bones = self.num_bones;
        let num_vertices = self.motion.num_vertices();
        let op = self.smooth_operator();

        let rows: Vec<DVector<f64>> = (0..num_bones)
            .into_par_iter()
            .map(|j| {
                let mut field = DVector::zeros(num_vertices);
                for i in 0..num_vertices {
                    field[i] = self.weights.get(j, i);
                }
                op.smooth_column(&field)
            })
            .collect::<Result<Vec<_>>>()?;

        let mut ws = DMatrix::zeros(num_bones, num_vertices);
        for (j, row) in rows.iter().enumerate() {
            for i in 0..num_vertices {
                ws[(j, i)] = row[i];
            }
        }
        for i in 0..num_vertices {
            let mut col = ws.column_mut(i);
            for v in col.iter_mut() {
                if *v < 0.0 {
                    *v = 0.0;
                }
            }
            let sum = col.sum();
            if sum < 0.1 {
                col.fill(1.0 / num_bones as f64);
            } else {
                col /= sum;
            }
        }
        Ok(ws)
    }

    /// Lazily fill the per-vertex right-hand sides where the smoothed
    /// field indicates a plausible influence.
    fn fill_atb(&self, ws: &DMatrix<f64>, atb: &mut [DVector<f64>]) {
        let num_bones = self.num_bones;
        let num_frames = self.motion.num_frames();
        let weight_eps = self.options.weight_eps;

        atb.par_iter_mut().enumerate().for_each(|(i, col)| {
            for j in 0..num_bones {
                if col[j] == 0.0 && ws[(j, i)] > weight_eps {
                    let mut sum = 0.0;
                    for k in 0..num_frames {
                        let s = self.motion.subject_of(k);
                        let u = self.motion.rest_pos(s, i);
                        let m = self.transforms.get(k, j).fixed_view::<3, 4>(0, 0);
                        let transformed = m * Vector4::new(u.x, u.y, u.z, 1.0);
                        sum += self.motion.frame_pos(k, i).dot(&transformed);
                    }
                    col[j] = sum;
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use nalgebra::{Matrix4, Point3, Rotation3, Vector3};

    use crate::motion::MotionSequence;
    use crate::skin::{TransformSet, WeightMatrix};
    use crate::solver::{Decomposition, SolveOptions};

    /// A 2x5 strip of quads bending around the z axis at x = 2.
    fn bending_strip() -> MotionSequence {
        let mut rest = Vec::new();
        for r in 0..2 {
            for c in 0..5 {
                rest.push(Point3::new(c as f64, r as f64, 0.0));
            }
        }
        let polygons: Vec<Vec<usize>> = (0..4).map(|c| vec![c, c + 1, c + 6, c + 5]).collect();

        let pivot = Vector3::new(2.0, 0.0, 0.0);
        let mut frames = Vec::new();
        for k in 1..=3 {
            let rot = Rotation3::from_axis_angle(&Vector3::z_axis(), 0.3 * k as f64);
            let frame: Vec<Point3<f64>> = rest
                .iter()
                .map(|p| {
                    if p.x <= 2.0 {
                        *p
                    } else {
                        rot * (p - pivot) + pivot
                    }
                })
                .collect();
            frames.push(frame);
        }
        MotionSequence::single_subject(&rest, &frames, polygons).unwrap()
    }

    fn bending_transforms() -> TransformSet {
        let pivot = Vector3::new(2.0, 0.0, 0.0);
        let mut t = TransformSet::identity(3, 2);
        for k in 0..3 {
            let rot = Rotation3::from_axis_angle(&Vector3::z_axis(), 0.3 * (k + 1) as f64);
            let m = rot.into_inner();
            t.set_rigid(k, 1, &m, &(pivot - m * pivot));
        }
        t
    }

    fn one_hot_strip_weights() -> WeightMatrix {
        WeightMatrix::from_triplets(
            2,
            10,
            (0..10).map(|i| {
                let c = i % 5;
                (usize::from(c > 2), i, 1.0)
            }),
        )
    }

    #[test]
    fn test_weights_stay_convex_and_sparse() {
        let mut solver = Decomposition::new(
            bending_strip(),
            2,
            SolveOptions::default().with_max_influences(2),
        )
        .unwrap();
        solver.set_transforms(bending_transforms()).unwrap();
        solver.set_weights(one_hot_strip_weights()).unwrap();
        solver.compute_weights().unwrap();

        let w = solver.weights();
        for i in 0..10 {
            let col = w.col(i);
            assert!(!col.is_empty() && col.len() <= 2, "vertex {i}");
            let sum: f64 = col.iter().map(|&(_, v)| v).sum();
            assert!((sum - 1.0).abs() < 1e-9, "vertex {i} sums to {sum}");
            for &(_, v) in col {
                assert!(v >= 0.0, "vertex {i} has negative weight {v}");
            }
        }
    }

    #[test]
    fn test_weights_follow_the_motion() {
        let mut solver = Decomposition::new(bending_strip(), 2, SolveOptions::default()).unwrap();
        solver.set_transforms(bending_transforms()).unwrap();
        solver.set_weights(one_hot_strip_weights()).unwrap();
        solver.compute_weights().unwrap();

        let w = solver.weights();
        // Ends of the strip move exactly with one bone each.
        for i in [0, 5] {
            assert!(w.get(0, i) > 0.9, "static end vertex {i}: {}", w.get(0, i));
        }
        for i in [4, 9] {
            assert!(w.get(1, i) > 0.9, "moving end vertex {i}: {}", w.get(1, i));
        }
    }

    #[test]
    fn test_fully_locked_column_is_bitwise_stable() {
        let mut solver = Decomposition::new(bending_strip(), 2, SolveOptions::default()).unwrap();
        solver.set_transforms(bending_transforms()).unwrap();

        let mut weights = one_hot_strip_weights();
        // An intentionally unnormalized column; a solve would change it.
        weights.set_col(7, vec![(0, 0.25), (1, 0.5)]);
        solver.set_weights(weights).unwrap();
        let mut locks = vec![0.0; 10];
        locks[7] = 1.0;
        solver.set_lock_weights(locks).unwrap();

        solver.compute_weights().unwrap();
        assert_eq!(solver.weights().col(7), &[(0, 0.25), (1, 0.5)]);
    }

    #[test]
    fn test_single_bone_weights_are_all_ones() {
        let rest = vec![
            Point3::new(0.0, 0.0, 0.0),
            Point3::new(1.0, 0.0, 0.0),
            Point3::new(0.0, 1.0, 0.0),
        ];
        let frames = vec![rest.clone(), rest.clone()];
        let motion =
            MotionSequence::single_subject(&rest, &frames, vec![vec![0, 1, 2]]).unwrap();
        let mut solver = Decomposition::new(motion, 1, SolveOptions::default()).unwrap();
        solver
            .set_transforms(TransformSet::identity(2, 1))
            .unwrap();
        solver
            .set_weights(WeightMatrix::from_triplets(1, 3, (0..3).map(|i| (0, i, 1.0))))
            .unwrap();
        solver.compute_weights().unwrap();

        for i in 0..3 {
            assert_eq!(solver.weights().col(i), &[(0, 1.0)]);
        }
    }

    #[test]
    fn test_zero_iterations_skip_phase() {
        let mut solver = Decomposition::new(
            bending_strip(),
            2,
            SolveOptions::default().with_weight_iterations(0),
        )
        .unwrap();
        solver.compute_weights().unwrap();
        // Phase skipped: not even initialization ran.
        assert!(solver.weights().is_empty());
    }

    #[test]
    fn test_weight_refinement_reduces_rmse_from_perturbed_start() {
        // Blend the exact one-hot weights toward uniform so the start is
        // visibly wrong; the solve must recover most of the error. The
        // smoothness regularizer keeps the result off the exact optimum,
        // so the bound is absolute, not a non-increase check.
        let perturbed = WeightMatrix::from_triplets(
            2,
            10,
            (0..10).flat_map(|i| {
                let hot = usize::from(i % 5 > 2);
                [(hot, i, 0.7), (1 - hot, i, 0.3)]
            }),
        );

        let mut solver = Decomposition::new(bending_strip(), 2, SolveOptions::default()).unwrap();
        solver.set_transforms(bending_transforms()).unwrap();
        solver.set_weights(perturbed).unwrap();
        solver.init().unwrap();

        let before = solver.rmse();
        solver.compute_weights().unwrap();
        let after = solver.rmse();
        assert!(before > 1e-2, "start not perturbed enough: {before}");
        assert!(after < before, "rmse went from {before} to {after}");
        assert!(after < 1e-3, "rmse {after} above regularizer scale");
    }

    #[test]
    fn test_fractional_lock_blends_toward_current() {
        // Vertex 9 moves rigidly with bone 1 but its stored column says
        // bone 0. A free solve flips it, a full lock keeps it, and a
        // half lock must land strictly in between.
        let solve_with_lock = |lock: f64| {
            let mut solver = Decomposition::new(
                bending_strip(),
                2,
                SolveOptions::default().with_weight_iterations(1),
            )
            .unwrap();
            solver.set_transforms(bending_transforms()).unwrap();
            let mut weights = one_hot_strip_weights();
            weights.set_col(9, vec![(0, 1.0)]);
            solver.set_weights(weights).unwrap();
            let mut locks = vec![0.0; 10];
            locks[9] = lock;
            solver.set_lock_weights(locks).unwrap();
            solver.compute_weights().unwrap();
            solver.weights().get(1, 9)
        };

        let free = solve_with_lock(0.0);
        let half = solve_with_lock(0.5);
        let locked = solve_with_lock(1.0);

        assert!(free > 0.5, "free solve should favor bone 1: {free}");
        assert_eq!(locked, 0.0);
        assert!(
            half > locked && half < free,
            "half lock {half} not between {locked} and {free}"
        );
    }

    #[test]
    fn test_all_zero_weights_fall_back_to_uniform_field() {
        // A weight matrix with no stored entries smooths to a vanishing
        // field; the per-vertex normalization must substitute a uniform
        // distribution and the solve still produce convex columns.
        let mut solver = Decomposition::new(bending_strip(), 2, SolveOptions::default()).unwrap();
        solver.set_transforms(bending_transforms()).unwrap();
        solver
            .set_weights(WeightMatrix::from_triplets(2, 10, Vec::new()))
            .unwrap();
        solver.compute_weights().unwrap();

        let w = solver.weights();
        for i in 0..10 {
            let col = w.col(i);
            assert!(!col.is_empty(), "vertex {i} has no influences");
            let sum: f64 = col.iter().map(|&(_, v)| v).sum();
            assert!((sum - 1.0).abs() < 1e-9, "vertex {i} sums to {sum}");
            assert!(col.iter().all(|&(_, v)| v >= 0.0), "vertex {i}");
        }
    }

    #[test]
    fn test_bending_fixture_keeps_pivot_fixed() {
        // Bone 1's transform maps the pivot to itself in every frame.
        let t = bending_transforms();
        for k in 0..3 {
            let m: &Matrix4<f64> = t.get(k, 1);
            let p = m.fixed_view::<3, 3>(0, 0) * Vector3::new(2.0, 0.0, 0.0)
                + m.fixed_view::<3, 1>(0, 3);
            assert!((p - Vector3::new(2.0, 0.0, 0.0)).norm() < 1e-12);
        }
    }
}
