//! 360° scan residual

use interface::units::make_phase_near;

use super::{DiffError, AMP_COEFF, EKIN_IN, PHASE_SHIFT};
use crate::{
    bpm::BpmScanData,
    fit::{ScoreError, Scorer},
    model::ActiveCavity,
};

/// Smallest 360° scan that can be fitted
pub const MIN_FULL_SCAN_POINTS: usize = 18;

/// Mean squared difference between the model and a 360° scan at the cavity amplitude `init_amp`
///
/// The BPM offset is unknown: the model curve is shifted by its mean difference to the
/// measured phases before the residual is computed and stored into the `phase_fit_gd` of the scan.
pub fn full_scan_diff2(
    active: &mut ActiveCavity,
    scan: &mut BpmScanData,
    init_amp: f64,
    params: &[f64],
) -> Result<f64, DiffError> {
    let (phase_shift, ekin_in, amp_coeff) = (params[PHASE_SHIFT], params[EKIN_IN], params[AMP_COEFF]);
    let n = scan.len();
    if n < MIN_FULL_SCAN_POINTS {
        return Err(DiffError::Data(format!(
            "Number of phase points in 360 deg scan is too low for fitting! N = {n} Stop."
        )));
    }
    let bpm = [scan.bpm.as_str()];
    active.set_model_amp_phase(amp_coeff * init_amp, scan.phase_gd.x(0), phase_shift)?;
    let mut model = Vec::with_capacity(n);
    let mut previous = 0.;
    for &cav_phase in scan.phase_gd.xs() {
        let phase = active.get_bpm_phases(ekin_in, cav_phase, phase_shift, &bpm)?[0];
        previous = make_phase_near(phase, previous);
        model.push(previous);
    }
    let offset = model
        .iter()
        .zip(scan.phase_gd.ys())
        .map(|(m, y)| m - y)
        .sum::<f64>()
        / n as f64;
    let mut diff2 = 0.;
    scan.phase_fit_gd.clear();
    for (i, m) in model.into_iter().enumerate() {
        let (x, y) = (scan.phase_gd.x(i), scan.phase_gd.y(i));
        let fit = m - offset;
        scan.phase_fit_gd.add_point(x, fit, 0.);
        diff2 += (fit - y).powi(2);
    }
    Ok(diff2 / n as f64)
}

/// Simplex objective of the 360° scan fit
pub struct FullScanScorer<'a, 'm> {
    active: &'a mut ActiveCavity<'m>,
    scan: &'a mut BpmScanData,
    init_amp: f64,
    min_diff2: f64,
}
impl<'a, 'm> FullScanScorer<'a, 'm> {
    pub fn new(active: &'a mut ActiveCavity<'m>, scan: &'a mut BpmScanData, init_amp: f64) -> Self {
        Self {
            active,
            scan,
            init_amp,
            min_diff2: f64::MAX,
        }
    }
    pub fn min_diff2(&self) -> f64 {
        self.min_diff2
    }
    pub fn diff2(&mut self, params: &[f64]) -> Result<f64, DiffError> {
        full_scan_diff2(self.active, self.scan, self.init_amp, params)
    }
}
impl Scorer for FullScanScorer<'_, '_> {
    fn score(&mut self, params: &[f64]) -> Result<f64, ScoreError> {
        let diff2 = self.diff2(params)?;
        self.min_diff2 = self.min_diff2.min(diff2);
        Ok(diff2)
    }
}
