//! Multi-view synchronized diffusion sampling.
//!
//! Several coordinate views of one shared canvas are denoised together: at
//! every reverse step the per-view clean estimates are reconciled through the
//! canvas before each view takes its next DDIM step.

pub mod artifacts;
pub mod config;
pub mod error;
pub mod models;
pub mod pipeline;
pub mod sampler;
pub mod schedule;
pub mod sync;
pub mod tweedie;
pub mod views;

pub use error::{Result, SyncError};
