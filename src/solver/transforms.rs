//! Bone transform refinement.
//!
//! Given fixed skinning weights, refits every (frame, bone) rigid
//! transform. Two aggregates are precomputed once per refinement:
//!
//! - `vuT`: per (frame, bone), the weighted covariance between animated
//!   and rest positions, with a translation-affinity correction that
//!   pulls each bone's translation toward the p-norm-weighted centroid
//!   of its influenced vertices;
//! - `uuT`: per bone pair sharing at least one influenced vertex, the
//!   per-subject weighted rest-position correlation, used to subtract
//!   the other bones' share of a vertex before refitting one bone.
//!
//! Frames are independent of each other, so the refit loop runs one
//! rayon task per frame; bones within a frame update sequentially,
//! each seeing the current values of its peers.

use std::collections::BTreeMap;

use nalgebra::{Matrix4, Vector4};
use rayon::prelude::*;

use super::rigid::fit_rigid;
use super::{Decomposition, SolverEvent};
use crate::error::Result;

/// Per-subject rest correlation blocks for bone pairs that share a
/// vertex. `pairs[j]` maps a peer bone `j2` to one 4x4 block per
/// subject.
pub(super) struct BoneCorrelation {
    pairs: Vec<BTreeMap<usize, Vec<Matrix4<f64>>>>,
}

impl Decomposition {
    /// Refine bone transforms for `n_trans_iters` passes.
    ///
    /// Initializes missing weights/transforms first (see
    /// [`Decomposition::init`]). Locked bones are never modified. A
    /// zero iteration count skips the phase entirely.
    pub fn compute_transformations(&mut self) -> Result<()> {
        if self.options.n_trans_iters == 0 {
            return Ok(());
        }
        self.init()?;
        self.progress.report(&SolverEvent::TransformsBegin);

        let vut = self.compute_vut();
        let uut = self.compute_uut();

        for pass in 0..self.options.n_trans_iters {
            self.progress
                .report(&SolverEvent::TransformsIterBegin { iteration: pass });

            let num_bones = self.num_bones;
            let motion = &self.motion;
            let lock_bone = &self.lock_bone;
            self.transforms
                .as_mut_slice()
                .par_chunks_mut(num_bones)
                .enumerate()
                .for_each(|(k, frame)| {
                    let s = motion.subject_of(k);
                    for j in 0..num_bones {
                        if lock_bone[j] {
                            continue;
                        }
                        let mut qpt = vut[k * num_bones + j];
                        for (&j2, blocks) in &uut.pairs[j] {
                            if j2 != j {
                                qpt -= frame[j2] * blocks[s];
                            }
                        }
                        if let Some((rot, trans)) = fit_rigid(&qpt) {
                            frame[j].fixed_view_mut::<3, 3>(0, 0).copy_from(&rot);
                            frame[j].fixed_view_mut::<3, 1>(0, 3).copy_from(&trans);
                        }
                    }
                });

            if self
                .progress
                .report(&SolverEvent::TransformsIterEnd { iteration: pass })
            {
                return Ok(());
            }
        }

        self.progress.report(&SolverEvent::TransformsEnd);
        Ok(())
    }

    /// Weighted animated-vs-rest covariance per (frame, bone), plus the
    /// translation affinity correction.
    fn compute_vut(&self) -> Vec<Matrix4<f64>> {
        let num_bones = self.num_bones;
        let num_vertices = self.motion.num_vertices();
        let trans_affine = self.options.trans_affine;
        let p_norm = self.options.trans_affine_norm;
        let motion = &self.motion;
        let weights = &self.weights;

        let mut vut = vec![Matrix4::zeros(); motion.num_frames() * num_bones];
        vut.par_chunks_mut(num_bones)
            .enumerate()
            .for_each(|(k, row)| {
                let s = motion.subject_of(k);
                // p-norm-weighted accumulation for the affinity term
                let mut vutp = vec![Matrix4::zeros(); num_bones];
                for i in 0..num_vertices {
                    let v = motion.frame_pos(k, i);
                    let u = motion.rest_pos(s, i);
                    let tmp = Vector4::new(v.x, v.y, v.z, 1.0)
                        * Vector4::new(u.x, u.y, u.z, 1.0).transpose();
                    for &(j, w) in weights.col(i) {
                        row[j] += w * tmp;
                        vutp[j] += w.powf(p_norm) * tmp;
                    }
                }
                for j in 0..num_bones {
                    let total_p = vutp[j][(3, 3)];
                    if total_p != 0.0 {
                        row[j] += (trans_affine * row[j][(3, 3)] / total_p) * vutp[j];
                    }
                }
            });
        vut
    }

    /// Per-subject weighted rest correlations for bone pairs sharing a
    /// vertex.
    fn compute_uut(&self) -> BoneCorrelation {
        let num_subjects = self.motion.num_subjects();
        let mut pairs: Vec<BTreeMap<usize, Vec<Matrix4<f64>>>> = vec![BTreeMap::new(); self.num_bones];

        for i in 0..self.motion.num_vertices() {
            let col = self.weights.col(i);
            // Rest outer products of vertex i, one per subject
            let mut outer = Vec::with_capacity(num_subjects);
            for s in 0..num_subjects {
                let u = self.motion.rest_pos(s, i);
                let uh = Vector4::new(u.x, u.y, u.z, 1.0);
                outer.push(uh * uh.transpose());
            }
            for &(j1, w1) in col {
                for &(j2, w2) in col {
                    let blocks = pairs[j1]
                        .entry(j2)
                        .or_insert_with(|| vec![Matrix4::zeros(); num_subjects]);
                    for s in 0..num_subjects {
                        blocks[s] += w1 * w2 * outer[s];
                    }
                }
            }
        }

        BoneCorrelation { pairs }
    }
}
