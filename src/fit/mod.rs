//! Least squares and simplex fitting

mod harmonics;
mod polyfit;
mod simplex;

pub use harmonics::HarmonicsFunc;
pub use polyfit::{polyfit, weighted_least_squares, LinearFit};
pub use simplex::{
    FitOutcome, FitVariable, ScoreError, Scorer, Simplex, StopSolving, Termination,
};

#[derive(Debug, thiserror::Error)]
pub enum FitError {
    #[error("not enough points to fit: {found} found, {needed} needed")]
    NotEnoughPoints { needed: usize, found: usize },
    #[error("singular fit: {0}")]
    Singular(String),
    #[error("simplex solver failed: {0}")]
    Solver(String),
    #[error("scoring failed: {0}")]
    Scorer(String),
    #[error("the fit was stopped")]
    Stopped,
}
