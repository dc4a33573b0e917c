//! Invertible building blocks of a conditional flow
//!
//! A flow is a stack of coupling blocks. Each block transforms one half
//! of its input conditioned on the other half and on external
//! conditions, then mixes coordinates with a fixed permutation.

pub mod coupling;
pub mod permutation;
pub mod spline;

pub use coupling::{CouplingBlock, CouplingBlockStack};
pub use permutation::Permutation;
pub use spline::SplineBounds;
