//! # Fit scorers
//!
//! The cavity fits minimize the mean squared difference between the measured BPM
//! phases and the phases predicted by the on-line model restricted to the active
//! cavity.
//! The fit variables are always, in that order, the live to model phase shift,
//! the input kinetic energy and the amplitude coefficient (model to live amplitude
//! ratio); each of them can be excluded from the fit.

use std::time::Duration;

use interface::{units::wrap_phase, ModelError};

use crate::{
    cavity::CavityWrapper,
    fit::{FitError, FitOutcome, FitVariable, ScoreError, Scorer, Simplex, Termination},
    progress::ScanProgress,
    run_state::RunState,
};

mod full_scan;
mod pasta;

pub use full_scan::{full_scan_diff2, FullScanScorer, MIN_FULL_SCAN_POINTS};
pub use pasta::{pasta_diff2, PastaMode, PastaRecord, PastaScorer, PastaSettings};

/// Index of the phase shift in the fit parameters
pub const PHASE_SHIFT: usize = 0;
/// Index of the input kinetic energy in the fit parameters
pub const EKIN_IN: usize = 1;
/// Index of the amplitude coefficient in the fit parameters
pub const AMP_COEFF: usize = 2;

/// Failure to compute a residual
#[derive(Debug, thiserror::Error)]
pub enum DiffError {
    /// the scan data cannot be fitted
    #[error("{0}")]
    Data(String),
    #[error("cannot track the probe")]
    Model(#[from] ModelError),
}
impl From<DiffError> for ScoreError {
    fn from(e: DiffError) -> Self {
        match e {
            DiffError::Data(msg) => ScoreError(msg),
            DiffError::Model(e) => ScoreError(format!("cannot track the probe: {e}")),
        }
    }
}

/// Initial simplex steps of the fit variables
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FitSteps {
    pub phase_shift: f64,
    pub ekin_in: f64,
    /// relative to the amplitude coefficient
    pub amp_coeff: f64,
}
impl FitSteps {
    /// 1°, 3 keV and 0.5%
    pub const PASTA: Self = Self {
        phase_shift: 1.,
        ekin_in: 0.003,
        amp_coeff: 0.005,
    };
    /// 1° and 1%, the input energy is not fitted
    pub const FULL_SCAN: Self = Self {
        phase_shift: 1.,
        ekin_in: 0.003,
        amp_coeff: 0.01,
    };
}

/// Fit variables initialized from the cavity guess
///
/// The input energy is fitted only if `fit_ekin_in` and the cavity allows it.
pub fn fit_variables(cav: &CavityWrapper, steps: FitSteps, fit_ekin_in: bool) -> Vec<FitVariable> {
    let phase_shift = wrap_phase(cav.phase_guess - cav.design_phase);
    vec![
        FitVariable::new("phase_shift", phase_shift, steps.phase_shift).used(cav.fit_phase_shift),
        FitVariable::new("ekin_in", cav.ekin_in, steps.ekin_in)
            .used(fit_ekin_in && cav.fit_ekin_in),
        FitVariable::new("amp_coeff", cav.amp_coeff, steps.amp_coeff * cav.amp_coeff)
            .used(cav.fit_amp_coeff),
    ]
}

/// Best fit parameters
#[derive(Debug, Clone, PartialEq)]
pub struct CavityFit {
    pub phase_shift: f64,
    pub ekin_in: f64,
    pub amp_coeff: f64,
    /// mean squared residual (degree²)
    pub diff2: f64,
    pub evaluations: usize,
    pub termination: Termination,
}
impl CavityFit {
    fn new(outcome: FitOutcome) -> Self {
        Self {
            phase_shift: outcome.params[PHASE_SHIFT],
            ekin_in: outcome.params[EKIN_IN],
            amp_coeff: outcome.params[AMP_COEFF],
            diff2: outcome.score,
            evaluations: outcome.evaluations,
            termination: outcome.termination,
        }
    }
    /// Root mean square residual (degree)
    pub fn avg_err(&self) -> f64 {
        self.diff2.sqrt()
    }
    /// Parameters in the scorer order
    pub fn params(&self) -> [f64; 3] {
        let mut params = [0.; 3];
        params[PHASE_SHIFT] = self.phase_shift;
        params[EKIN_IN] = self.ekin_in;
        params[AMP_COEFF] = self.amp_coeff;
        params
    }
}

/// Runs a time bounded simplex fit of a cavity scan
///
/// The best score is shown in the progress message while the fit is running.
pub fn run_cavity_fit(
    name: &str,
    scorer: &mut dyn Scorer,
    variables: &[FitVariable],
    max_time: f64,
    run_state: &std::sync::Arc<RunState>,
    progress: &ScanProgress,
) -> Result<CavityFit, FitError> {
    let simplex = Simplex::new()
        .max_time(Duration::from_secs_f64(max_time.max(0.)))
        .run_state(std::sync::Arc::clone(run_state));
    let outcome = simplex.minimize(scorer, variables, |n, min_diff2| {
        progress.set_message(format!("{name} fit #{n:<5} err={:.4} deg", min_diff2.sqrt()))
    })?;
    log::info!(
        "{name}: fit ended ({:?}) after {} evaluations with err={:.4} deg",
        outcome.termination,
        outcome.evaluations,
        outcome.score.sqrt()
    );
    Ok(CavityFit::new(outcome))
}
