//! Rest-pose clustering initialization.
//!
//! When a session starts with neither weights nor transforms, bones are
//! bootstrapped by LBG-style vector quantization over the motion: start
//! from a single cluster covering the mesh, repeatedly split the
//! clusters that reconstruct their vertices poorly, refit per-cluster
//! rigid transforms, relabel vertices by propagating labels outward
//! from low-error seeds, and prune clusters that end up with too few
//! vertices. The result is a rigid binding (one bone per vertex) that
//! the alternating solve then softens.
//!
//! Splitting and pruning mean the final bone count can differ from the
//! requested one; callers read it back from the session.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use nalgebra::{DMatrix, Matrix4};
use rayon::prelude::*;

use super::rigid::{accumulate, fit_rigid};
use super::{Decomposition, SolverEvent};
use crate::skin::{TransformSet, WeightMatrix};

/// Minimum cluster size; smaller clusters are pruned, and only clusters
/// above twice this size may split.
const CLUSTER_THRESHOLD: usize = 3;

/// Candidate assignment of a vertex to a bone, ordered by fitting
/// error. The ordering is reversed so that `BinaryHeap` pops the
/// smallest error first.
#[derive(Debug, Clone, Copy, PartialEq)]
struct LabelCandidate {
    error: f64,
    vertex: usize,
    bone: usize,
}

impl Eq for LabelCandidate {}

impl Ord for LabelCandidate {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .error
            .partial_cmp(&self.error)
            .unwrap_or(Ordering::Equal)
    }
}

impl PartialOrd for LabelCandidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Decomposition {
    /// Bootstrap weights and transforms by rest-pose clustering.
    ///
    /// Runs split/refine/prune rounds until the requested bone count is
    /// reached or no split makes progress, then converts the final
    /// labeling into one-hot weights.
    pub(super) fn cluster_init(&mut self) {
        let target = self.num_bones;
        self.num_bones = 1;
        let mut labels: Vec<Option<usize>> = vec![Some(0); self.motion.num_vertices()];
        self.compute_trans_from_label(&labels);

        loop {
            self.progress.report(&SolverEvent::InitSplitBegin {
                num_bones: self.num_bones,
            });
            let prev = self.num_bones;
            self.split_clusters(&mut labels, target, CLUSTER_THRESHOLD);
            for _ in 0..self.options.n_init_iters {
                self.compute_trans_from_label(&labels);
                self.compute_label(&mut labels);
                self.prune_bones(&mut labels, CLUSTER_THRESHOLD);
            }
            self.progress.report(&SolverEvent::InitSplitEnd {
                num_bones: self.num_bones,
            });
            if self.num_bones >= target || self.num_bones <= prev {
                break;
            }
        }

        self.lock_bone = vec![false; self.num_bones];
        self.label_to_weights(&labels);
    }

    /// Initialize weights from existing transforms: bind every vertex
    /// rigidly to its best-fitting bone, then smooth the labeling by
    /// propagation.
    pub(super) fn init_weights_from_transforms(&mut self) {
        let num_bones = self.num_bones;
        let mut labels: Vec<Option<usize>> = (0..self.motion.num_vertices())
            .into_par_iter()
            .map(|i| {
                let mut best = None;
                let mut best_err = f64::INFINITY;
                for j in 0..num_bones {
                    let err = self.label_error(i, j);
                    if best.is_none() || err < best_err {
                        best_err = err;
                        best = Some(j);
                    }
                }
                best
            })
            .collect();
        self.compute_label(&mut labels);
        self.label_to_weights(&labels);
    }

    /// Total squared reconstruction error of vertex `i` when bound
    /// rigidly to bone `j`, over all frames.
    fn label_error(&self, i: usize, j: usize) -> f64 {
        let mut err = 0.0;
        for k in 0..self.motion.num_frames() {
            let s = self.motion.subject_of(k);
            let m = self.transforms.get(k, j);
            let rot = m.fixed_view::<3, 3>(0, 0);
            let t = m.fixed_view::<3, 1>(0, 3);
            err += (rot * self.motion.rest_pos(s, i) + t - self.motion.frame_pos(k, i))
                .norm_squared();
        }
        err
    }

    /// Reassign vertex labels by error-ordered propagation.
    ///
    /// Each bone seeds the propagation at its current best-fitting
    /// vertex; labels then grow outward along the edge graph, always
    /// expanding the globally smallest pending error, so clusters stay
    /// connected wherever connectivity allows. Vertices unreachable
    /// from any seed fall back to their individually best bone.
    fn compute_label(&self, labels: &mut [Option<usize>]) {
        let num_vertices = self.motion.num_vertices();
        let num_bones = self.num_bones;

        let mut errors: Vec<f64> = (0..num_vertices)
            .into_par_iter()
            .map(|i| match labels[i] {
                Some(j) => self.label_error(i, j),
                None => f64::INFINITY,
            })
            .collect();

        let mut seed: Vec<Option<usize>> = vec![None; num_bones];
        let mut seed_err = vec![f64::INFINITY; num_bones];
        for (i, label) in labels.iter().enumerate() {
            if let Some(j) = *label {
                if errors[i] < seed_err[j] {
                    seed_err[j] = errors[i];
                    seed[j] = Some(i);
                }
            }
        }

        let mut heap = BinaryHeap::new();
        for (j, s) in seed.iter().enumerate() {
            if let Some(i) = *s {
                heap.push(LabelCandidate {
                    error: errors[i],
                    vertex: i,
                    bone: j,
                });
            }
        }

        let op = self.smooth_operator();
        let mut dirty = vec![true; num_vertices];
        while let Some(top) = heap.pop() {
            if !dirty[top.vertex] {
                continue;
            }
            dirty[top.vertex] = false;
            labels[top.vertex] = Some(top.bone);
            errors[top.vertex] = top.error;
            for i2 in op.neighbors(top.vertex) {
                if dirty[i2] {
                    let error = if labels[i2] == Some(top.bone) {
                        errors[i2]
                    } else {
                        self.label_error(i2, top.bone)
                    };
                    heap.push(LabelCandidate {
                        error,
                        vertex: i2,
                        bone: top.bone,
                    });
                }
            }
        }

        // Vertices in components without a seed never get reached by
        // the propagation; bind them to their best bone directly.
        labels.par_iter_mut().enumerate().for_each(|(i, label)| {
            if label.is_none() {
                let mut best = 0;
                let mut best_err = f64::INFINITY;
                for j in 0..num_bones {
                    let err = self.label_error(i, j);
                    if err < best_err {
                        best_err = err;
                        best = j;
                    }
                }
                *label = Some(best);
            }
        });
    }

    /// Refit every (frame, bone) transform from the rigid labeling,
    /// replacing the whole transform set. Bones without labeled
    /// vertices stay at identity.
    fn compute_trans_from_label(&mut self, labels: &[Option<usize>]) {
        let num_bones = self.num_bones;
        let motion = &self.motion;
        let mut transforms = TransformSet::identity(motion.num_frames(), num_bones);
        transforms
            .as_mut_slice()
            .par_chunks_mut(num_bones)
            .enumerate()
            .for_each(|(k, frame)| {
                let s = motion.subject_of(k);
                let mut qpt = vec![Matrix4::zeros(); num_bones];
                for (i, label) in labels.iter().enumerate() {
                    if let Some(j) = *label {
                        accumulate(&mut qpt[j], 1.0, &motion.frame_pos(k, i), &motion.rest_pos(s, i));
                    }
                }
                for (j, q) in qpt.iter().enumerate() {
                    if let Some((rot, trans)) = fit_rigid(q) {
                        frame[j].fixed_view_mut::<3, 3>(0, 0).copy_from(&rot);
                        frame[j].fixed_view_mut::<3, 1>(0, 3).copy_from(&trans);
                    }
                }
            });
        self.transforms = transforms;
    }

    /// Split clusters that are both large and badly fit.
    ///
    /// The split seed is the cluster's most "extreme" vertex, scoring
    /// both distance from the rest-pose centroid and fitting error; the
    /// seed's whole adjacency ring is carved off into the new cluster
    /// so the next refit has enough vertices to work with.
    fn split_clusters(&mut self, labels: &mut [Option<usize>], max_bones: usize, threshold: usize) {
        let num_bones = self.num_bones;
        let num_vertices = self.motion.num_vertices();

        let mut centroids = DMatrix::zeros(3 * self.motion.num_subjects(), num_bones);
        let mut sizes = vec![0usize; num_bones];
        for (i, label) in labels.iter().enumerate() {
            if let Some(j) = *label {
                let mut col = centroids.column_mut(j);
                col += self.motion.rest_col(i);
                sizes[j] += 1;
            }
        }
        for (j, &size) in sizes.iter().enumerate() {
            if size > 0 {
                let mut col = centroids.column_mut(j);
                col /= size as f64;
            }
        }

        // Per-vertex distance to its cluster centroid and fitting error.
        let stats: Vec<(f64, f64)> = (0..num_vertices)
            .into_par_iter()
            .map(|i| match labels[i] {
                Some(j) => (
                    (self.motion.rest_col(i) - centroids.column(j)).norm(),
                    self.label_error(i, j).sqrt(),
                ),
                None => (0.0, 0.0),
            })
            .collect();

        let mut min_dist = vec![f64::MAX; num_bones];
        let mut min_err = vec![f64::MAX; num_bones];
        let mut total_err = vec![0.0f64; num_bones];
        for (i, label) in labels.iter().enumerate() {
            if let Some(j) = *label {
                let (d, e) = stats[i];
                min_dist[j] = min_dist[j].min(d);
                min_err[j] = min_err[j].min(e);
                total_err[j] += e;
            }
        }

        let mut seed: Vec<Option<usize>> = vec![None; num_bones];
        let mut seed_score = vec![f64::NEG_INFINITY; num_bones];
        for (i, label) in labels.iter().enumerate() {
            if let Some(j) = *label {
                let (d, e) = stats[i];
                let score = ((e - min_err[j]) * (d - min_dist[j])).abs();
                if seed[j].is_none() || score > seed_score[j] {
                    seed_score[j] = score;
                    seed[j] = Some(i);
                }
            }
        }

        let mut count = num_bones;
        let avg_err = total_err.iter().sum::<f64>() / num_bones as f64;
        for j in 0..num_bones {
            if count < max_bones && sizes[j] > threshold * 2 && total_err[j] > avg_err / 100.0 {
                if let Some(i) = seed[j] {
                    let new_label = count;
                    count += 1;
                    for i2 in self.smooth_operator().neighbors(i) {
                        labels[i2] = Some(new_label);
                    }
                }
            }
        }
        self.num_bones = count;
    }

    /// Remove clusters with fewer than `threshold` vertices, renumber
    /// the survivors and relabel their orphaned vertices. The last
    /// cluster is never pruned away entirely.
    fn prune_bones(&mut self, labels: &mut [Option<usize>], threshold: usize) {
        let num_bones = self.num_bones;
        let mut sizes = vec![0usize; num_bones];
        for label in labels.iter().flatten() {
            sizes[*label] += 1;
        }

        let mut new_id: Vec<Option<usize>> = vec![None; num_bones];
        let mut count = 0;
        for (j, &size) in sizes.iter().enumerate() {
            if size >= threshold {
                new_id[j] = Some(count);
                count += 1;
            }
        }
        if count == num_bones || count == 0 {
            return;
        }

        self.transforms.compact_bones(&new_id, count);
        self.num_bones = count;
        for label in labels.iter_mut() {
            *label = label.and_then(|j| new_id[j]);
        }
        self.compute_label(labels);
    }

    /// Convert a rigid labeling into one-hot weights and clear the
    /// weight locks.
    fn label_to_weights(&mut self, labels: &[Option<usize>]) {
        let triplets = labels
            .iter()
            .enumerate()
            .filter_map(|(i, label)| label.map(|j| (j, i, 1.0)));
        self.weights = WeightMatrix::from_triplets(self.num_bones, labels.len(), triplets);
        self.lock_weight = vec![0.0; labels.len()];
    }
}
