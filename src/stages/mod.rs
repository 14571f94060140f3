//! The three deliberation stages plus the optional normalization pass.
//!
//! Stages are strictly sequential: Stage 2 never starts before Stage 1
//! returns, and Stage 3 never starts before Stage 2 returns. Fan-out inside
//! a stage is the [`StageRunner`](crate::runner::StageRunner)'s job.

pub mod normalize;
pub mod rank;
pub mod respond;
pub mod synthesize;
