//! Skinning decomposition engine.
//!
//! [`Decomposition`] owns the solver state for one animated sequence:
//! the motion data, the current weights and bone transforms, the lock
//! flags and the tuning parameters in [`SolveOptions`]. The solve
//! alternates two block updates until the reconstruction error stalls:
//!
//! 1. transform refinement ([`Decomposition::compute_transformations`]):
//!    with weights fixed, refit every (frame, bone) rigid transform;
//! 2. weight refinement ([`Decomposition::compute_weights`]): with
//!    transforms fixed, re-solve every vertex's sparse convex influence
//!    set.
//!
//! Warm starts are honored: weights and transforms supplied through the
//! setters before the first solve phase are used as-is, and whichever
//! half is missing is initialized from the other (or, when both are
//! missing, by rest-pose clustering — see the `cluster` submodule).

mod cluster;
mod convex;
mod laplacian;
mod rigid;
mod transforms;
mod weights;

pub use convex::ConvexSolver;
pub use laplacian::{build_smooth_operator, SmoothOperator};
pub use rigid::{accumulate, fit_rigid};

use rayon::prelude::*;

use crate::error::{Result, SolveError};
use crate::motion::MotionSequence;
use crate::skin::{TransformSet, WeightMatrix};

/// Tuning parameters for a decomposition solve.
///
/// The defaults are a production-tested starting point; the `with_*`
/// builders override individual knobs.
#[derive(Debug, Clone)]
pub struct SolveOptions {
    /// Number of outer alternation rounds.
    pub n_iters: usize,
    /// Refinement passes per clustering split round during
    /// initialization.
    pub n_init_iters: usize,
    /// Transform refinement passes per outer round. Zero skips the
    /// transform phase entirely.
    pub n_trans_iters: usize,
    /// Translation affinity strength: pulls each bone's translation
    /// toward the weighted centroid of its influenced vertices.
    pub trans_affine: f64,
    /// Exponent applied to weights when computing the affinity
    /// centroid; larger values favor strongly influenced vertices.
    pub trans_affine_norm: f64,
    /// Weight refinement passes per outer round. Zero skips the weight
    /// phase entirely.
    pub n_weights_iters: usize,
    /// Maximum number of nonzero bone influences per vertex.
    pub nnz: usize,
    /// Sparseness regularizer subtracted from the smoothness term in
    /// the per-vertex system diagonal.
    pub weights_sparseness: f64,
    /// Smoothness regularizer pulling each vertex's weights toward the
    /// Laplacian-smoothed field.
    pub weights_smooth: f64,
    /// Step size of the implicit Laplacian smoothing solve.
    pub weights_smooth_step: f64,
    /// Numerical floor below which a weight is treated as zero.
    pub weight_eps: f64,
    /// Number of consecutive stalled rounds tolerated before an early
    /// stop. Zero disables early stopping.
    pub patience: usize,
    /// Relative improvement threshold under which a round counts as
    /// stalled.
    pub tolerance: f64,
}

impl Default for SolveOptions {
    fn default() -> Self {
        Self {
            n_iters: 30,
            n_init_iters: 10,
            n_trans_iters: 5,
            trans_affine: 10.0,
            trans_affine_norm: 4.0,
            n_weights_iters: 3,
            nnz: 8,
            weights_sparseness: 1e-5,
            weights_smooth: 1e-4,
            weights_smooth_step: 1.0,
            weight_eps: 1e-15,
            patience: 3,
            tolerance: 1e-3,
        }
    }
}

impl SolveOptions {
    /// Set the number of outer alternation rounds.
    pub fn with_iterations(mut self, n: usize) -> Self {
        self.n_iters = n;
        self
    }

    /// Set the refinement passes per initialization split round.
    pub fn with_init_iterations(mut self, n: usize) -> Self {
        self.n_init_iters = n;
        self
    }

    /// Set the transform refinement passes per round.
    pub fn with_transform_iterations(mut self, n: usize) -> Self {
        self.n_trans_iters = n;
        self
    }

    /// Set the translation affinity strength.
    pub fn with_translation_affinity(mut self, affinity: f64) -> Self {
        self.trans_affine = affinity;
        self
    }

    /// Set the translation affinity weight exponent.
    pub fn with_translation_affinity_norm(mut self, norm: f64) -> Self {
        self.trans_affine_norm = norm;
        self
    }

    /// Set the weight refinement passes per round.
    pub fn with_weight_iterations(mut self, n: usize) -> Self {
        self.n_weights_iters = n;
        self
    }

    /// Set the maximum nonzero influences per vertex.
    pub fn with_max_influences(mut self, nnz: usize) -> Self {
        self.nnz = nnz;
        self
    }

    /// Set the sparseness regularizer.
    pub fn with_sparseness(mut self, sparseness: f64) -> Self {
        self.weights_sparseness = sparseness;
        self
    }

    /// Set the smoothness regularizer.
    pub fn with_smoothness(mut self, smooth: f64) -> Self {
        self.weights_smooth = smooth;
        self
    }

    /// Set the Laplacian smoothing step size.
    pub fn with_smoothing_step(mut self, step: f64) -> Self {
        self.weights_smooth_step = step;
        self
    }

    /// Set the early-stop patience (0 disables early stopping).
    pub fn with_patience(mut self, patience: usize) -> Self {
        self.patience = patience;
        self
    }

    /// Set the early-stop relative improvement threshold.
    pub fn with_tolerance(mut self, tolerance: f64) -> Self {
        self.tolerance = tolerance;
        self
    }
}

/// Milestones reported to a [`Progress`] callback during a solve.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SolverEvent {
    /// A clustering split round is starting with this many bones.
    InitSplitBegin {
        /// Bone count before the split.
        num_bones: usize,
    },
    /// A clustering split round finished with this many bones.
    InitSplitEnd {
        /// Bone count after splitting and pruning.
        num_bones: usize,
    },
    /// An outer alternation round is starting.
    IterBegin {
        /// Zero-based round index.
        iteration: usize,
    },
    /// An outer alternation round finished.
    IterEnd {
        /// Zero-based round index.
        iteration: usize,
        /// Reconstruction error after the round.
        rmse: f64,
    },
    /// The transform refinement phase is starting.
    TransformsBegin,
    /// One transform refinement pass is starting.
    TransformsIterBegin {
        /// Zero-based pass index.
        iteration: usize,
    },
    /// One transform refinement pass finished.
    TransformsIterEnd {
        /// Zero-based pass index.
        iteration: usize,
    },
    /// The transform refinement phase finished.
    TransformsEnd,
    /// The weight refinement phase is starting.
    WeightsBegin,
    /// One weight refinement pass is starting.
    WeightsIterBegin {
        /// Zero-based pass index.
        iteration: usize,
    },
    /// One weight refinement pass finished.
    WeightsIterEnd {
        /// Zero-based pass index.
        iteration: usize,
    },
    /// The weight refinement phase finished.
    WeightsEnd,
}

/// Progress callback for long-running solves.
///
/// The callback is invoked at every [`SolverEvent`]; returning `true`
/// from an `*End` event requests cancellation at the next safe point.
/// The solver state is always valid after a cancelled solve.
pub struct Progress {
    callback: Box<dyn Fn(&SolverEvent) -> bool + Send + Sync>,
}

impl Progress {
    /// Wrap a callback function.
    pub fn new<F>(callback: F) -> Self
    where
        F: Fn(&SolverEvent) -> bool + Send + Sync + 'static,
    {
        Self {
            callback: Box::new(callback),
        }
    }

    /// A callback that ignores all events and never cancels.
    pub fn none() -> Self {
        Self::new(|_| false)
    }

    #[inline]
    pub(crate) fn report(&self, event: &SolverEvent) -> bool {
        (self.callback)(event)
    }
}

impl Default for Progress {
    fn default() -> Self {
        Self::none()
    }
}

impl std::fmt::Debug for Progress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Progress")
    }
}

/// A skinning decomposition session over one [`MotionSequence`].
#[derive(Debug)]
pub struct Decomposition {
    motion: MotionSequence,
    options: SolveOptions,
    num_bones: usize,
    weights: WeightMatrix,
    transforms: TransformSet,
    lock_weight: Vec<f64>,
    lock_bone: Vec<bool>,
    model_size: Option<f64>,
    smooth: Option<SmoothOperator>,
    progress: Progress,
}

impl Decomposition {
    /// Create a session solving for `num_bones` bones.
    ///
    /// # Errors
    ///
    /// Returns an error if `num_bones` is zero or the options request
    /// zero influences per vertex.
    pub fn new(motion: MotionSequence, num_bones: usize, options: SolveOptions) -> Result<Self> {
        if num_bones == 0 {
            return Err(SolveError::invalid_param(
                "num_bones",
                num_bones,
                "at least one bone is required",
            ));
        }
        if options.nnz == 0 {
            return Err(SolveError::invalid_param(
                "nnz",
                options.nnz,
                "at least one influence per vertex is required",
            ));
        }
        Ok(Self {
            motion,
            options,
            num_bones,
            weights: WeightMatrix::empty(),
            transforms: TransformSet::empty(),
            lock_weight: Vec::new(),
            lock_bone: Vec::new(),
            model_size: None,
            smooth: None,
            progress: Progress::none(),
        })
    }

    /// Supply warm-start weights.
    ///
    /// # Errors
    ///
    /// Returns an error if the shape does not match the session's bone
    /// and vertex counts.
    pub fn set_weights(&mut self, weights: WeightMatrix) -> Result<()> {
        if weights.num_bones() != self.num_bones {
            return Err(SolveError::DimensionMismatch {
                name: "weights (bones)",
                expected: self.num_bones,
                actual: weights.num_bones(),
            });
        }
        if weights.num_vertices() != self.motion.num_vertices() {
            return Err(SolveError::DimensionMismatch {
                name: "weights (vertices)",
                expected: self.motion.num_vertices(),
                actual: weights.num_vertices(),
            });
        }
        self.weights = weights;
        Ok(())
    }

    /// Supply warm-start bone transforms.
    ///
    /// # Errors
    ///
    /// Returns an error if the shape does not match the session's frame
    /// and bone counts.
    pub fn set_transforms(&mut self, transforms: TransformSet) -> Result<()> {
        if transforms.num_frames() != self.motion.num_frames() {
            return Err(SolveError::DimensionMismatch {
                name: "transforms (frames)",
                expected: self.motion.num_frames(),
                actual: transforms.num_frames(),
            });
        }
        if transforms.num_bones() != self.num_bones {
            return Err(SolveError::DimensionMismatch {
                name: "transforms (bones)",
                expected: self.num_bones,
                actual: transforms.num_bones(),
            });
        }
        self.transforms = transforms;
        Ok(())
    }

    /// Set per-vertex weight locks in `[0, 1]`.
    ///
    /// A lock of 1 freezes the vertex's weights exactly; fractional
    /// locks blend the solved weights toward the current ones.
    ///
    /// # Errors
    ///
    /// Returns an error if the length does not match the vertex count.
    pub fn set_lock_weights(&mut self, lock: Vec<f64>) -> Result<()> {
        if lock.len() != self.motion.num_vertices() {
            return Err(SolveError::DimensionMismatch {
                name: "lock_weights",
                expected: self.motion.num_vertices(),
                actual: lock.len(),
            });
        }
        self.lock_weight = lock.into_iter().map(|l| l.clamp(0.0, 1.0)).collect();
        Ok(())
    }

    /// Set per-bone transform locks. Locked bones are never refit.
    ///
    /// # Errors
    ///
    /// Returns an error if the length does not match the bone count.
    pub fn set_lock_bones(&mut self, lock: Vec<bool>) -> Result<()> {
        if lock.len() != self.num_bones {
            return Err(SolveError::DimensionMismatch {
                name: "lock_bones",
                expected: self.num_bones,
                actual: lock.len(),
            });
        }
        self.lock_bone = lock;
        Ok(())
    }

    /// Install a progress callback.
    pub fn set_progress(&mut self, progress: Progress) {
        self.progress = progress;
    }

    /// Current skinning weights.
    #[inline]
    pub fn weights(&self) -> &WeightMatrix {
        &self.weights
    }

    /// Current bone transforms.
    #[inline]
    pub fn transforms(&self) -> &TransformSet {
        &self.transforms
    }

    /// Current bone count. May be lower than requested when rest-pose
    /// clustering pruned insignificant bones during initialization.
    #[inline]
    pub fn num_bones(&self) -> usize {
        self.num_bones
    }

    /// The motion data this session solves over.
    #[inline]
    pub fn motion(&self) -> &MotionSequence {
        &self.motion
    }

    /// The tuning parameters of this session.
    #[inline]
    pub fn options(&self) -> &SolveOptions {
        &self.options
    }

    /// Prepare the session for solving.
    ///
    /// Computes the model scale and the smoothness operator if missing,
    /// then fills in whichever of weights/transforms was not supplied:
    /// both missing runs rest-pose clustering (which may lower the bone
    /// count), missing weights are derived from the transforms by
    /// nearest-bone labeling, missing transforms start at identity.
    /// Idempotent once the session is initialized; called implicitly by
    /// the solve phases.
    pub fn init(&mut self) -> Result<()> {
        if self.model_size.is_none() {
            self.model_size = Some(self.motion.model_size());
        }
        let num_vertices = self.motion.num_vertices();
        if self
            .smooth
            .as_ref()
            .map_or(true, |op| op.num_vertices() != num_vertices)
        {
            self.smooth = Some(build_smooth_operator(
                &self.motion,
                self.options.weight_eps,
                self.options.weights_smooth_step,
            ));
        }

        match (self.weights.is_empty(), self.transforms.is_empty()) {
            (true, true) => self.cluster_init(),
            (true, false) => self.init_weights_from_transforms(),
            (false, true) => {
                self.transforms = TransformSet::identity(self.motion.num_frames(), self.num_bones);
            }
            (false, false) => {}
        }

        if self.lock_weight.len() != num_vertices {
            self.lock_weight = vec![0.0; num_vertices];
        }
        if self.lock_bone.len() != self.num_bones {
            self.lock_bone = vec![false; self.num_bones];
        }
        Ok(())
    }

    /// Run the full alternating solve.
    ///
    /// Alternates transform and weight refinement for up to `n_iters`
    /// rounds, stopping early when the reconstruction error has stalled
    /// for `patience` consecutive rounds or the progress callback
    /// requests cancellation. The first round never arms the stall
    /// counter: there is no previous error to compare against.
    pub fn compute(&mut self) -> Result<()> {
        self.init()?;

        let mut prev_rmse: Option<f64> = None;
        let mut patience_left = self.options.patience;
        for iteration in 0..self.options.n_iters {
            self.progress.report(&SolverEvent::IterBegin { iteration });

            self.compute_transformations()?;
            self.compute_weights()?;

            let rmse = self.rmse();
            if self
                .progress
                .report(&SolverEvent::IterEnd { iteration, rmse })
            {
                break;
            }

            if self.options.patience > 0 {
                if let Some(prev) = prev_rmse {
                    let stalled = rmse < prev * (1.0 + self.options.weight_eps)
                        && (prev - rmse) < self.options.tolerance * prev;
                    if stalled {
                        patience_left -= 1;
                        if patience_left == 0 {
                            break;
                        }
                    } else {
                        patience_left = self.options.patience;
                    }
                }
            }
            prev_rmse = Some(rmse);
        }
        Ok(())
    }

    /// Root-mean-square reconstruction error over all frames and
    /// vertices, comparing the skinned rest pose against the animated
    /// positions. Infinite before the session is initialized.
    pub fn rmse(&self) -> f64 {
        if self.weights.is_empty() || self.transforms.is_empty() {
            return f64::INFINITY;
        }
        let num_frames = self.motion.num_frames();
        let num_vertices = self.motion.num_vertices();
        if num_frames == 0 {
            return 0.0;
        }

        let total: f64 = (0..num_vertices)
            .into_par_iter()
            .map(|i| {
                let mut err = 0.0;
                for k in 0..num_frames {
                    let s = self.motion.subject_of(k);
                    let u = self.motion.rest_pos(s, i);
                    let mut p = nalgebra::Vector3::zeros();
                    for &(j, w) in self.weights.col(i) {
                        let m = self.transforms.get(k, j);
                        let rot = m.fixed_view::<3, 3>(0, 0);
                        let t = m.fixed_view::<3, 1>(0, 3);
                        p += w * (rot * u + t);
                    }
                    err += (self.motion.frame_pos(k, i) - p).norm_squared();
                }
                err
            })
            .sum();
        (total / (num_frames * num_vertices) as f64).sqrt()
    }

    /// Model scale, computed lazily at init. Degenerate geometry with
    /// zero spread falls back to unit scale so the weight regularizers
    /// stay finite.
    pub(crate) fn scale(&self) -> f64 {
        match self.model_size {
            Some(s) if s > 0.0 => s,
            _ => 1.0,
        }
    }

    /// The smoothness operator, available after init.
    pub(crate) fn smooth_operator(&self) -> &SmoothOperator {
        match &self.smooth {
            Some(op) => op,
            // init() always runs before any phase touches the operator.
            None => unreachable!("smoothness operator is built during init"),
        }
    }
}
