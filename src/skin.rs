//! Skinning weight and bone transform containers.
//!
//! [`WeightMatrix`] is the sparse `[num_bones, num_vertices]` influence
//! table: column `i` holds the nonzero bone influences of vertex `i`.
//! [`TransformSet`] stores one relative rigid transform per (frame, bone)
//! pair as stacked 4x4 homogeneous blocks.

use nalgebra::{DVector, Matrix3, Matrix4, Vector3};

/// Sparse per-vertex skinning weights.
///
/// Entries are non-negative, and the nonzero support of each column is
/// intended to sum to 1 (exactly 1 unless blended under a partial lock).
#[derive(Debug, Clone, Default)]
pub struct WeightMatrix {
    num_bones: usize,
    /// Column `i` holds `(bone, weight)` pairs sorted by bone index.
    cols: Vec<Vec<(usize, f64)>>,
}

impl WeightMatrix {
    /// Create an empty (zero-size) weight matrix.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build from `(bone, vertex, weight)` triplets.
    ///
    /// Zero-valued triplets are dropped; duplicates at the same position
    /// are summed.
    pub fn from_triplets(
        num_bones: usize,
        num_vertices: usize,
        triplets: impl IntoIterator<Item = (usize, usize, f64)>,
    ) -> Self {
        let mut cols = vec![Vec::new(); num_vertices];
        for (j, i, w) in triplets {
            debug_assert!(j < num_bones, "bone index {j} out of range ({num_bones} bones)");
            if w != 0.0 {
                cols[i].push((j, w));
            }
        }
        for col in &mut cols {
            col.sort_by_key(|&(j, _)| j);
            col.dedup_by(|a, b| {
                if a.0 == b.0 {
                    b.1 += a.1;
                    true
                } else {
                    false
                }
            });
        }
        Self { num_bones, cols }
    }

    /// True if the matrix holds no data (not yet initialized).
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.cols.is_empty() || self.num_bones == 0
    }

    /// Number of bones (rows).
    #[inline]
    pub fn num_bones(&self) -> usize {
        self.num_bones
    }

    /// Number of vertices (columns).
    #[inline]
    pub fn num_vertices(&self) -> usize {
        self.cols.len()
    }

    /// Nonzero influences of vertex `i`, sorted by bone index.
    #[inline]
    pub fn col(&self, i: usize) -> &[(usize, f64)] {
        &self.cols[i]
    }

    /// Influence of bone `j` on vertex `i` (0 if absent).
    pub fn get(&self, j: usize, i: usize) -> f64 {
        self.cols[i]
            .iter()
            .find(|&&(b, _)| b == j)
            .map_or(0.0, |&(_, w)| w)
    }

    /// Column `i` as a dense vector of length `num_bones`.
    pub fn col_dense(&self, i: usize) -> DVector<f64> {
        let mut v = DVector::zeros(self.num_bones);
        for &(j, w) in &self.cols[i] {
            v[j] = w;
        }
        v
    }

    /// Replace column `i` with the given `(bone, weight)` pairs.
    pub fn set_col(&mut self, i: usize, mut entries: Vec<(usize, f64)>) {
        debug_assert!(
            entries.iter().all(|&(j, _)| j < self.num_bones),
            "bone index out of range ({} bones)",
            self.num_bones
        );
        entries.retain(|&(_, w)| w != 0.0);
        entries.sort_by_key(|&(j, _)| j);
        self.cols[i] = entries;
    }
}

/// Per-frame relative rigid transforms, one 4x4 block per (frame, bone).
///
/// Block `(k, j)` maps the rest pose of bone `j` to its pose at frame
/// `k`; transforms are relative, never composed with a parent.
#[derive(Debug, Clone, Default)]
pub struct TransformSet {
    num_frames: usize,
    num_bones: usize,
    mats: Vec<Matrix4<f64>>,
}

impl TransformSet {
    /// Create an empty (zero-size) transform set.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Create all-identity transforms for the given shape.
    pub fn identity(num_frames: usize, num_bones: usize) -> Self {
        Self {
            num_frames,
            num_bones,
            mats: vec![Matrix4::identity(); num_frames * num_bones],
        }
    }

    /// True if the set holds no data (not yet initialized).
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.mats.is_empty()
    }

    /// Number of frames.
    #[inline]
    pub fn num_frames(&self) -> usize {
        self.num_frames
    }

    /// Number of bones.
    #[inline]
    pub fn num_bones(&self) -> usize {
        self.num_bones
    }

    /// Transform of bone `j` at frame `k`.
    #[inline]
    pub fn get(&self, k: usize, j: usize) -> &Matrix4<f64> {
        &self.mats[k * self.num_bones + j]
    }

    /// Set the transform of bone `j` at frame `k`.
    #[inline]
    pub fn set(&mut self, k: usize, j: usize, m: Matrix4<f64>) {
        self.mats[k * self.num_bones + j] = m;
    }

    /// Set the rotation and translation blocks of bone `j` at frame `k`.
    pub fn set_rigid(&mut self, k: usize, j: usize, rot: &Matrix3<f64>, trans: &Vector3<f64>) {
        let m = &mut self.mats[k * self.num_bones + j];
        m.fixed_view_mut::<3, 3>(0, 0).copy_from(rot);
        m.fixed_view_mut::<3, 1>(0, 3).copy_from(trans);
    }

    /// Rotation block of bone `j` at frame `k`.
    #[inline]
    pub fn rotation(&self, k: usize, j: usize) -> Matrix3<f64> {
        self.get(k, j).fixed_view::<3, 3>(0, 0).into_owned()
    }

    /// Translation block of bone `j` at frame `k`.
    #[inline]
    pub fn translation(&self, k: usize, j: usize) -> Vector3<f64> {
        self.get(k, j).fixed_view::<3, 1>(0, 3).into_owned()
    }

    /// The frame-major storage as a mutable slice. Chunking by
    /// `num_bones` yields per-frame blocks, which the transform solver
    /// processes in parallel.
    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [Matrix4<f64>] {
        &mut self.mats
    }

    /// Keep only the bones with `new_id[j] != None`, renumbering
    /// contiguously to `new_count` bones.
    pub fn compact_bones(&mut self, new_id: &[Option<usize>], new_count: usize) {
        let mut mats = vec![Matrix4::identity(); self.num_frames * new_count];
        for k in 0..self.num_frames {
            for (j, id) in new_id.iter().enumerate() {
                if let Some(nj) = id {
                    mats[k * new_count + nj] = self.mats[k * self.num_bones + j];
                }
            }
        }
        self.num_bones = new_count;
        self.mats = mats;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_weights_from_triplets() {
        let w = WeightMatrix::from_triplets(3, 2, vec![(0, 0, 0.5), (2, 0, 0.5), (1, 1, 1.0)]);
        assert_eq!(w.num_bones(), 3);
        assert_eq!(w.num_vertices(), 2);
        assert_eq!(w.col(0), &[(0, 0.5), (2, 0.5)]);
        assert_eq!(w.get(1, 1), 1.0);
        assert_eq!(w.get(1, 0), 0.0);
    }

    #[test]
    fn test_weights_duplicates_summed_and_zeros_dropped() {
        let w = WeightMatrix::from_triplets(2, 1, vec![(0, 0, 0.25), (0, 0, 0.25), (1, 0, 0.0)]);
        assert_eq!(w.col(0), &[(0, 0.5)]);
    }

    #[test]
    #[should_panic(expected = "bone index")]
    fn test_weights_reject_out_of_range_bone() {
        WeightMatrix::from_triplets(2, 1, vec![(2, 0, 1.0)]);
    }

    #[test]
    fn test_weights_col_dense() {
        let w = WeightMatrix::from_triplets(4, 1, vec![(1, 0, 0.3), (3, 0, 0.7)]);
        let d = w.col_dense(0);
        assert_eq!(d.as_slice(), &[0.0, 0.3, 0.0, 0.7]);
    }

    #[test]
    fn test_transforms_identity_and_set() {
        let mut t = TransformSet::identity(2, 3);
        assert_eq!(t.num_frames(), 2);
        assert_eq!(t.num_bones(), 3);
        assert_eq!(t.rotation(1, 2), Matrix3::identity());

        let rot = Matrix3::new(0.0, -1.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 1.0);
        let trans = Vector3::new(1.0, 2.0, 3.0);
        t.set_rigid(1, 0, &rot, &trans);
        assert_eq!(t.rotation(1, 0), rot);
        assert_eq!(t.translation(1, 0), trans);
        // Bottom row stays homogeneous
        assert_eq!(t.get(1, 0)[(3, 3)], 1.0);
        assert_eq!(t.get(1, 0)[(3, 0)], 0.0);
    }

    #[test]
    fn test_transforms_compact_bones() {
        let mut t = TransformSet::identity(1, 3);
        let mut m = Matrix4::identity();
        m[(0, 3)] = 5.0;
        t.set(0, 2, m);

        t.compact_bones(&[Some(0), None, Some(1)], 2);
        assert_eq!(t.num_bones(), 2);
        assert_eq!(t.translation(0, 1), Vector3::new(5.0, 0.0, 0.0));
    }
}
