//! Cavity phase analysis
//!
//! The output energy of a scanned cavity is measured at each phase from the slope of the
//! offset corrected BPM phases, then the model energy curve is fitted to it by varying the
//! input energy, the model amplitude and the live to model phase shift.

use std::{ops::Range, sync::Arc, time::Duration};

use interface::{
    units::{make_phase_near, wrap_phase},
    ModelError,
};

use super::{AnalysisError, Result, SclLinac};
use crate::{
    fit::{FitError, FitVariable, HarmonicsFunc, LinearFit, ScoreError, Scorer, Simplex, Termination},
    model::{ActiveCavity, ModelAdapter},
    progress::ScanProgress,
    stats::{AvgErr, GraphData},
};

/// BPMs needed to reject bad scan points
const MIN_BPMS: usize = 3;
/// Scan points with a BPM phase off the line may be removed up to this number
const MAX_BAD_POINTS: usize = 4;
/// floor of the line fit residuals (degree)
const MIN_PHASE_RMS: f64 = 0.01;
/// floor of the energy curve residuals (MeV)
const MIN_ENERGY_RMS: f64 = 0.001;

const EKIN_IN: usize = 0;
const AMP: usize = 1;
const PHASE_SHIFT: usize = 2;

fn model_energies(
    active: &mut ActiveCavity,
    phases: &[f64],
    params: &[f64],
) -> std::result::Result<Vec<f64>, ModelError> {
    let (ekin_in, amp, phase_shift) = (params[EKIN_IN], params[AMP], params[PHASE_SHIFT]);
    active.set_model_amp_phase(amp, phases[0], phase_shift)?;
    phases
        .iter()
        .map(|&phase| {
            active.set_model_phase(phase, phase_shift)?;
            active.track(ekin_in)?;
            active
                .ekin_out()
                .ok_or_else(|| ModelError::Tracking(format!("{}: empty trajectory", active.cavity())))
        })
        .collect()
}

/// Mean squared difference between the model and the measured output energies
pub struct EnergyCurveScorer<'a, 'm> {
    active: &'a mut ActiveCavity<'m>,
    energies: &'a GraphData,
}
impl<'a, 'm> EnergyCurveScorer<'a, 'm> {
    pub fn new(active: &'a mut ActiveCavity<'m>, energies: &'a GraphData) -> Self {
        Self { active, energies }
    }
}
impl Scorer for EnergyCurveScorer<'_, '_> {
    fn score(&mut self, params: &[f64]) -> std::result::Result<f64, ScoreError> {
        let model = model_energies(self.active, self.energies.xs(), params)?;
        let diff2 = model
            .iter()
            .zip(self.energies.ys())
            .map(|(m, e)| (m - e).powi(2))
            .sum::<f64>();
        Ok(diff2 / model.len().max(1) as f64)
    }
}

impl SclLinac {
    /// Output energy against the phase of cavity `k` from the BPMs after it
    ///
    /// Scan points where a BPM phase is off the line through the others are removed.
    fn measured_energies(&self, k: usize, ekin_guess: f64) -> Result<GraphData> {
        let source = self.offset_source;
        let alias = self.cavities[k].alias().to_string();
        let bpms: Vec<usize> = self
            .downstream_bpms(k)
            .filter(|&b| self.bpms[b].offset(source).is_ready)
            .collect();
        if bpms.len() < MIN_BPMS {
            return Err(AnalysisError::NotEnoughBpms(alias));
        }
        let guess = self
            .energy_guess(k, ekin_guess)
            .unwrap_or_else(|_| HarmonicsFunc::new([ekin_guess, 0., 0., 0., 0.]));
        let cav = &self.cavities[k];
        let mut lines = Vec::with_capacity(cav.n_points());
        let mut sum2 = 0.;
        for (j, &phase) in cav.scan_phases().iter().enumerate() {
            let (z, p) = self.scan_point(k, j, &bpms, source, guess.value(phase));
            let line = LinearFit::new(&z, &p)?;
            let residuals: Vec<f64> = z.iter().zip(&p).map(|(z, p)| p - line.value(*z)).collect();
            sum2 += residuals.iter().map(|r| r * r).sum::<f64>();
            let max = residuals.iter().fold(0f64, |m, r| m.max(r.abs()));
            lines.push((phase, line, max));
        }
        let rms = (sum2 / (lines.len() * bpms.len()).max(1) as f64).sqrt();
        let threshold = 3. * rms.max(MIN_PHASE_RMS);
        let mut gd = GraphData::new();
        let mut removed = 0;
        for (phase, line, max) in lines {
            match self.energy_from_line(&line) {
                Some((ekin, err)) if max <= threshold => {
                    gd.add_point(phase, ekin, err);
                }
                _ => removed += 1,
            }
        }
        if removed > MAX_BAD_POINTS {
            log::warn!("{alias}: {removed} bad scan points");
            return Err(AnalysisError::BadScan(alias));
        }
        Ok(gd)
    }

    /// Fits the model of cavity `k` to its measured energy curve
    ///
    /// `ekin_guess` is the expected input energy. The results are stored into the cavity wrapper.
    pub fn analyze_cavity(
        &mut self,
        model: &mut ModelAdapter,
        k: usize,
        ekin_guess: f64,
        progress: &ScanProgress,
    ) -> Result<()> {
        let alias = self.cavities[k].alias().to_string();
        if !self.cavities[k].is_measured {
            return Err(AnalysisError::NotMeasured(alias));
        }
        let mut gd = self.measured_energies(k, ekin_guess)?;
        let harm = fit_energy_curve(&alias, &mut gd)?;
        let live = self.cavities[k].live_phase;
        let stop = self
            .downstream_bpms(k)
            .next()
            .map(|b| self.bpms[b].alias().to_string())
            .ok_or_else(|| AnalysisError::NotEnoughBpms(alias.clone()))?;
        progress.set_message(format!("{alias}: model fit"));

        let mut active = model.activate(&alias, &stop)?;
        let ekin_in = harm.params[0];
        let mut amp = active.design_amp()?;
        if amp <= 0. {
            amp = 1.;
        }
        let mut shift = 0.;
        for _ in 0..2 {
            let curve = model_energies(&mut active, gd.xs(), &[ekin_in, amp, 0.])?;
            let model_harm = HarmonicsFunc::fit(gd.xs(), &curve)?;
            if model_harm.params[1] > 0. {
                amp *= harm.params[1] / model_harm.params[1];
            }
            shift = make_phase_near(harm.find_max() - model_harm.find_max(), 0.);
        }
        log::debug!("{alias}: start fit at Ekin_in={ekin_in:.3} MeV amp={amp:.4} shift={shift:.2} deg");
        let variables = [
            FitVariable::new("Ekin_in", ekin_in, 0.3),
            FitVariable::new("amp", amp, 0.01 * amp),
            FitVariable::new("phase_shift", shift, 1.),
        ];
        let simplex = Simplex::new()
            .max_evaluations(self.params.analysis_evaluations)
            .max_time(Duration::from_secs_f64(self.params.fit_time.max(0.)))
            .run_state(Arc::clone(self.run_state()));
        let outcome = {
            let mut scorer = EnergyCurveScorer::new(&mut active, &gd);
            simplex.minimize(&mut scorer, &variables, |evaluations, score| {
                progress.set_message(format!(
                    "{alias}: fit {evaluations} rms={:.4} MeV",
                    score.sqrt()
                ))
            })?
        };
        match outcome.termination {
            Termination::UserStop => return Err(AnalysisError::Interrupted),
            Termination::ScorerFailure(e) => return Err(FitError::Scorer(e).into()),
            _ => (),
        }
        let params = outcome.params;
        let (ekin_in, amp, shift) = (params[EKIN_IN], params[AMP], params[PHASE_SHIFT]);
        active.set_model_amp_phase(amp, live, shift)?;
        let trajectory = active.track(ekin_in)?;
        let ekin_out = active
            .ekin_out()
            .ok_or_else(|| ModelError::Tracking(format!("{alias}: empty trajectory")))?;
        let gap = format!("{alias}:");
        let gap_phases: Vec<f64> = trajectory
            .states()
            .iter()
            .filter(|s| s.node.starts_with(&gap))
            .filter_map(|s| s.gap_phase)
            .collect();
        drop(active);

        let cav = &mut self.cavities[k];
        cav.bpm_ekin_out = harm.value(live);
        cav.scan_phase_shift = wrap_phase(live - harm.find_max());
        cav.energy_harm = harm;
        cav.ekin_out_gd = gd;
        cav.fit_rms = outcome.score.sqrt();
        cav.avg_gap_phase = AvgErr::from_phases(&gap_phases).map_or(0., |a| a.avg);
        let wrapper = &mut cav.wrapper;
        wrapper.ekin_in = ekin_in;
        wrapper.ekin_out = ekin_out;
        wrapper.design_amp = amp;
        wrapper.phase_shift = shift;
        wrapper.design_phase = wrap_phase(live - shift);
        wrapper.is_analyzed = true;
        log::info!(
            "{alias}: Ekin_in={ekin_in:.3} MeV Ekin_out={ekin_out:.3} MeV amp={amp:.4} shift={shift:.2} deg rms={:.4} MeV",
            cav.fit_rms
        );
        Ok(())
    }

    /// Analyzes the cavities in `range` in order, the output energy of a cavity is the
    /// input energy guess of the next one
    pub fn analyze(
        &mut self,
        model: &mut ModelAdapter,
        range: Range<usize>,
        progress: &ScanProgress,
    ) -> Result<String> {
        let run_state = Arc::clone(self.run_state());
        let Some(_guard) = run_state.start() else {
            return Err(AnalysisError::AlreadyRunning);
        };
        let mut ekin = match range.start.checked_sub(1).map(|k| &self.cavities[k]) {
            Some(previous) if previous.wrapper.is_analyzed => previous.wrapper.ekin_out,
            _ if self.cavities[range.start].ekin_in_guess > 0. => {
                self.cavities[range.start].ekin_in_guess
            }
            _ => self.ekin_in,
        };
        for k in range {
            if run_state.should_stop() {
                return Err(AnalysisError::Interrupted);
            }
            if !self.cavities[k].is_good {
                continue;
            }
            self.analyze_cavity(model, k, ekin, progress)?;
            ekin = self.cavities[k].wrapper.ekin_out;
        }
        progress.finish();
        Ok("Analysis finished!".into())
    }
}

/// Two harmonics fit of the output energy, the points off the fit are removed
fn fit_energy_curve(alias: &str, gd: &mut GraphData) -> Result<HarmonicsFunc> {
    let n = gd.len();
    let harm = HarmonicsFunc::fit(gd.xs(), gd.ys())?;
    let limit = 2.8 * harm.rms_err.max(MIN_ENERGY_RMS);
    let bad: Vec<usize> = (0..n)
        .filter(|&i| (gd.y(i) - harm.value(gd.x(i))).abs() > limit)
        .collect();
    if bad.len() > (0.2 * n as f64) as usize {
        return Err(AnalysisError::BadScan(alias.to_string()));
    }
    if bad.is_empty() {
        return Ok(harm);
    }
    for &i in bad.iter().rev() {
        gd.remove_point(i);
    }
    Ok(HarmonicsFunc::fit(gd.xs(), gd.ys())?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        live::SimulationConfig,
        scl::{fixture, OffsetSource, PhaseOffset},
    };

    fn with_true_offsets(scl: &mut SclLinac) {
        for (bpm, (_, _, truth)) in scl.bpms.iter_mut().zip(fixture::BPMS) {
            bpm.backward = PhaseOffset {
                avg: truth,
                err: 0.,
                is_ready: true,
            };
        }
        scl.offset_source = OffsetSource::Backward;
    }

    #[test]
    fn model_parameters() {
        let (cs, mut scl) = fixture::measured(SimulationConfig::default());
        with_true_offsets(&mut scl);
        let mut model = fixture::model();
        let message = scl.analyze(&mut model, 0..3, &ScanProgress::hidden()).unwrap();
        assert_eq!(message, "Analysis finished!");
        for (cav, (_, _, offset)) in scl.cavities.iter().zip(fixture::CAVITIES) {
            let w = &cav.wrapper;
            assert!(w.is_analyzed);
            assert!(make_phase_near(w.phase_shift - offset, 0.).abs() < 1., "{} {}", w.alias, w.phase_shift);
            assert!((w.design_amp / 8. - 1.).abs() < 0.02, "{} {}", w.alias, w.design_amp);
            assert!((w.design_phase + 20.).abs() < 1., "{} {}", w.alias, w.design_phase);
            assert!(cav.fit_rms < 0.1, "{} {}", w.alias, cav.fit_rms);
        }
        let c1 = &scl.cavities[0].wrapper;
        assert!((c1.ekin_in - fixture::EKIN_IN).abs() < 0.2, "{}", c1.ekin_in);
        let last = &scl.cavities[2].wrapper;
        assert!((last.ekin_out - cs.final_energy().unwrap()).abs() < 0.2);
        // the model design is restored
        assert_eq!(model.cavity_amp("SCL_RF:Cav01a").unwrap(), 8.);
    }

    #[test]
    fn energy_curve_outliers() {
        let mut gd = GraphData::new();
        let h = HarmonicsFunc::new([200., 8., 30., 0.5, 10.]);
        for i in 0..36 {
            let x = -180. + 10. * i as f64;
            gd.add_point(x, h.value(x), 0.);
        }
        gd.remove_point(5);
        let (x, y, _) = gd.remove_point(10);
        let mut bad = gd.clone();
        bad.add_point(x, y + 3., 0.);
        let fit = fit_energy_curve("Cav", &mut bad).unwrap();
        assert_eq!(bad.len(), 34);
        assert!((fit.params[1] - 8.).abs() < 1e-6);

    }

    #[test]
    fn needs_three_bpms() {
        let (_cs, mut scl) = fixture::measured(SimulationConfig::default());
        with_true_offsets(&mut scl);
        scl.bpms[4].backward.is_ready = false;
        let mut model = fixture::model();
        assert!(matches!(
            scl.analyze_cavity(&mut model, 2, 190., &ScanProgress::hidden()),
            Err(AnalysisError::NotEnoughBpms(_))
        ));
        scl.cavities[1].is_measured = false;
        assert!(matches!(
            scl.analyze_cavity(&mut model, 1, 190., &ScanProgress::hidden()),
            Err(AnalysisError::NotMeasured(_))
        ));
    }
}
