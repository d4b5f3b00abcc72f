//! # Marrow
//!
//! Skinning decomposition for animated meshes.
//!
//! Marrow takes an animated vertex sequence (a rest pose plus per-frame
//! positions over a shared topology) and factors it into a linear blend
//! skinning rig: a set of per-frame rigid bone transforms and a sparse,
//! convex skinning weight matrix whose blend reconstructs the animation.
//! The solver alternates between refitting bone transforms with weights
//! fixed and re-solving per-vertex weights with transforms fixed, after
//! bootstrapping bones by rest-pose clustering when no rig is supplied.
//!
//! ## Features
//!
//! - **Automatic rigging**: LBG-style clustering discovers bones from
//!   the motion alone; no skeleton or initial weights required
//! - **Warm starts**: existing weights and/or transforms are honored
//!   and refined instead of recomputed
//! - **Editing locks**: per-vertex weight locks (hard or fractional)
//!   and per-bone transform locks for incremental cleanup workflows
//! - **Sparse, convex weights**: per-vertex influence counts are
//!   bounded, and weights are non-negative and sum to one
//! - **Multiple subjects**: several characters sharing one topology can
//!   be decomposed into a common rig
//!
//! ## Quick Start
//!
//! ```
//! use marrow::prelude::*;
//! use nalgebra::Point3;
//!
//! // A quad that rotates 90 degrees around the z axis.
//! let rest = vec![
//!     Point3::new(0.0, 0.0, 0.0),
//!     Point3::new(1.0, 0.0, 0.0),
//!     Point3::new(1.0, 1.0, 0.0),
//!     Point3::new(0.0, 1.0, 0.0),
//! ];
//! let rotated: Vec<Point3<f64>> = rest
//!     .iter()
//!     .map(|p| Point3::new(-p.y, p.x, p.z))
//!     .collect();
//! let polygons = vec![vec![0, 1, 2, 3]];
//!
//! let motion = MotionSequence::single_subject(&rest, &[rest.clone(), rotated], polygons)?;
//! let mut solver = Decomposition::new(motion, 1, SolveOptions::default())?;
//! solver.compute()?;
//!
//! println!("bones: {}", solver.num_bones());
//! println!("rmse: {}", solver.rmse());
//! # Ok::<(), marrow::error::SolveError>(())
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod motion;
pub mod skin;
pub mod solver;
pub mod sparse;

/// Prelude module for convenient imports.
///
/// This module re-exports the most commonly used types:
///
/// ```
/// use marrow::prelude::*;
/// ```
pub mod prelude {
    pub use crate::error::{Result, SolveError};
    pub use crate::motion::MotionSequence;
    pub use crate::skin::{TransformSet, WeightMatrix};
    pub use crate::solver::{Decomposition, Progress, SolveOptions, SolverEvent};
}

// Re-export nalgebra types for convenience
pub use nalgebra;
