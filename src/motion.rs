//! Animated mesh sequence storage.
//!
//! A [`MotionSequence`] bundles everything the solver reads: rest-pose
//! geometry (one block of 3 rows per subject), the animated vertex
//! positions (one block of 3 rows per frame), the frame-to-subject
//! partition, and the polygon topology. All validation happens at
//! construction time; afterwards the data is immutable for the lifetime
//! of a solve session.

use nalgebra::{DMatrix, Point3, Vector3};

use crate::error::{Result, SolveError};

/// Rest geometry, animated frames and topology of one or more subjects.
///
/// Shapes follow the stacked-block convention:
/// - rest geometry is `[3 * num_subjects, num_vertices]`; rows `3s..3s+3`
///   of column `i` are the rest position of vertex `i` for subject `s`;
/// - animated frames are `[3 * num_frames, num_vertices]`; rows
///   `3k..3k+3` of column `i` are the position of vertex `i` at frame `k`.
///
/// `frame_start` has `num_subjects + 1` entries; frames
/// `frame_start[s]..frame_start[s + 1]` belong to subject `s`.
#[derive(Debug, Clone)]
pub struct MotionSequence {
    rest: DMatrix<f64>,
    frames: DMatrix<f64>,
    frame_start: Vec<usize>,
    frame_subject: Vec<usize>,
    polygons: Vec<Vec<usize>>,
}

impl MotionSequence {
    /// Create a sequence from stacked position matrices.
    ///
    /// # Errors
    ///
    /// Returns an error if the vertex counts of `rest` and `frames`
    /// disagree, either matrix does not stack 3-row blocks, the frame
    /// partition is not monotonic or does not cover all frames, or a
    /// polygon references an out-of-range vertex.
    pub fn new(
        rest: DMatrix<f64>,
        frames: DMatrix<f64>,
        frame_start: Vec<usize>,
        polygons: Vec<Vec<usize>>,
    ) -> Result<Self> {
        if rest.ncols() == 0 {
            return Err(SolveError::EmptyMesh);
        }
        if rest.ncols() != frames.ncols() {
            return Err(SolveError::VertexCountMismatch {
                rest: rest.ncols(),
                animated: frames.ncols(),
            });
        }
        if rest.nrows() == 0 || rest.nrows() % 3 != 0 {
            return Err(SolveError::MalformedPositions {
                name: "rest geometry",
                rows: rest.nrows(),
            });
        }
        if frames.nrows() % 3 != 0 {
            return Err(SolveError::MalformedPositions {
                name: "animated frames",
                rows: frames.nrows(),
            });
        }

        let num_subjects = rest.nrows() / 3;
        let num_frames = frames.nrows() / 3;
        if frame_start.len() != num_subjects + 1 {
            return Err(SolveError::DimensionMismatch {
                name: "frame_start",
                expected: num_subjects + 1,
                actual: frame_start.len(),
            });
        }
        if frame_start[0] != 0 || frame_start[num_subjects] != num_frames {
            return Err(SolveError::NonMonotonicFrames {
                subject: num_subjects,
                start: frame_start[0],
                end: frame_start[num_subjects],
            });
        }
        for s in 0..num_subjects {
            if frame_start[s] > frame_start[s + 1] {
                return Err(SolveError::NonMonotonicFrames {
                    subject: s,
                    start: frame_start[s],
                    end: frame_start[s + 1],
                });
            }
        }

        let num_vertices = rest.ncols();
        for (p, polygon) in polygons.iter().enumerate() {
            for &v in polygon {
                if v >= num_vertices {
                    return Err(SolveError::InvalidVertexIndex {
                        polygon: p,
                        vertex: v,
                    });
                }
            }
        }

        let mut frame_subject = vec![0usize; num_frames];
        for s in 0..num_subjects {
            for f in frame_subject
                .iter_mut()
                .take(frame_start[s + 1])
                .skip(frame_start[s])
            {
                *f = s;
            }
        }

        Ok(Self {
            rest,
            frames,
            frame_start,
            frame_subject,
            polygons,
        })
    }

    /// Create a single-subject sequence from point slices.
    ///
    /// Convenience constructor for the common one-subject case: `rest`
    /// holds the rest pose, `frames` one entry per animated frame, each
    /// with the same vertex count as `rest`.
    pub fn single_subject(
        rest: &[Point3<f64>],
        frames: &[Vec<Point3<f64>>],
        polygons: Vec<Vec<usize>>,
    ) -> Result<Self> {
        let n = rest.len();
        let mut rest_mat = DMatrix::zeros(3, n);
        for (i, p) in rest.iter().enumerate() {
            rest_mat.column_mut(i).copy_from(&p.coords);
        }

        let mut frame_mat = DMatrix::zeros(3 * frames.len(), n);
        for (k, frame) in frames.iter().enumerate() {
            if frame.len() != n {
                return Err(SolveError::VertexCountMismatch {
                    rest: n,
                    animated: frame.len(),
                });
            }
            for (i, p) in frame.iter().enumerate() {
                frame_mat
                    .view_mut((3 * k, i), (3, 1))
                    .copy_from(&p.coords);
            }
        }

        Self::new(rest_mat, frame_mat, vec![0, frames.len()], polygons)
    }

    /// Number of vertices.
    #[inline]
    pub fn num_vertices(&self) -> usize {
        self.rest.ncols()
    }

    /// Number of subjects.
    #[inline]
    pub fn num_subjects(&self) -> usize {
        self.rest.nrows() / 3
    }

    /// Total number of animated frames across all subjects.
    #[inline]
    pub fn num_frames(&self) -> usize {
        self.frames.nrows() / 3
    }

    /// Subject owning frame `k`.
    #[inline]
    pub fn subject_of(&self, k: usize) -> usize {
        self.frame_subject[k]
    }

    /// First frame index of subject `s` (one past the last for `s + 1`).
    #[inline]
    pub fn frame_start(&self, s: usize) -> usize {
        self.frame_start[s]
    }

    /// Rest position of vertex `i` for subject `s`.
    #[inline]
    pub fn rest_pos(&self, s: usize, i: usize) -> Vector3<f64> {
        Vector3::new(
            self.rest[(3 * s, i)],
            self.rest[(3 * s + 1, i)],
            self.rest[(3 * s + 2, i)],
        )
    }

    /// Full stacked rest column of vertex `i` (all subjects).
    #[inline]
    pub fn rest_col(&self, i: usize) -> nalgebra::DVectorView<'_, f64> {
        self.rest.column(i)
    }

    /// Animated position of vertex `i` at frame `k`.
    #[inline]
    pub fn frame_pos(&self, k: usize, i: usize) -> Vector3<f64> {
        Vector3::new(
            self.frames[(3 * k, i)],
            self.frames[(3 * k + 1, i)],
            self.frames[(3 * k + 2, i)],
        )
    }

    /// Polygon topology (face-vertex table).
    #[inline]
    pub fn polygons(&self) -> &[Vec<usize>] {
        &self.polygons
    }

    /// RMS distance of rest-pose vertices to their centroid.
    ///
    /// Used to make the weight regularizers scale-invariant across
    /// differently-sized models.
    pub fn model_size(&self) -> f64 {
        let n = self.num_vertices() as f64;
        let mut sq = 0.0;
        for r in 0..self.rest.nrows() {
            let row = self.rest.row(r);
            let mean = row.sum() / n;
            for c in 0..self.rest.ncols() {
                let d = self.rest[(r, c)] - mean;
                sq += d * d;
            }
        }
        (sq / n / self.num_subjects() as f64).sqrt()
    }
}
