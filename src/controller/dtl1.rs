//! DTL tank 1 set-up
//!
//! The first BPM after the tank sees the beam only when the tank phase is inside the
//! longitudinal acceptance: the phase of the rising edge of the BPM amplitude over a
//! 360° scan is a fixed distance from the design phase.
//! The guess is refined by a PASTA fit of the two BPMs after the tank.

use interface::{
    units::{make_phase_near, wrap_phase},
    DataAdaptor, XmlError,
};
use serde::{Deserialize, Serialize};

use super::{
    check_fit,
    commit_fit,
    dtl_ccl::{read_pasta_records, PastaData},
    xml_params, AmpPhaseScan, CommonParams, PhaseSweep, Result, SetupContext, SetupError,
};
use crate::{
    bpm::BpmScanData,
    cavity::CavityWrapper,
    scorer::{
        fit_variables, pasta_diff2, run_cavity_fit, FitSteps, PastaMode, PastaRecord, PastaScorer,
        PastaSettings,
    },
    stats::GraphData,
};

/// Smallest amplitude scan the front is searched in
const MIN_FRONT_POINTS: usize = 8;
/// Largest input energy correction from the PASTA phases (MeV)
const MAX_EKIN_CORRECTION: f64 = 0.025;
/// Number of points of the PASTA model curves kept for display
const PASTA_CURVE_POINTS: usize = 30;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Dtl1Params {
    pub full_scan_phase_step: f64,
    pub sleep_time: f64,
    pub min_amp: f64,
    pub max_amp: f64,
    pub n_amp_steps: usize,
    pub cav_phase_width: f64,
    pub phase_step: f64,
    pub min_bpm_amp: f64,
    pub min_phase_fit: f64,
    pub max_phase_fit: f64,
    pub n_points_fit: usize,
    pub fit_time: f64,
    /// distance from the BPM amplitude front to the tank phase (degree)
    pub phase_shift_from_front: f64,
}
impl Default for Dtl1Params {
    fn default() -> Self {
        Self {
            full_scan_phase_step: 15.,
            sleep_time: 2.2,
            min_amp: 0.,
            max_amp: 0.,
            n_amp_steps: 2,
            cav_phase_width: 30.,
            phase_step: 3.,
            min_bpm_amp: 1.,
            min_phase_fit: 0.,
            max_phase_fit: 0.,
            n_points_fit: 10,
            fit_time: 20.,
            phase_shift_from_front: 50.,
        }
    }
}
xml_params!(Dtl1Params {
    full_scan_phase_step: "full_scan_phase_step",
    sleep_time: "sleep_time",
    min_amp: "min_amp",
    max_amp: "max_amp",
    n_amp_steps: "n_amp_step",
    cav_phase_width: "cav_phase_width",
    phase_step: "phase_step",
    min_bpm_amp: "min_bpm_amp",
    min_phase_fit: "min_phase_fit",
    max_phase_fit: "max_phase_fit",
    n_points_fit: "fit_points",
    fit_time: "fit_time",
    phase_shift_from_front: "phase_shift_from_front",
});

/// Phase of the rising edge of the BPM amplitude
///
/// The points are taken by increasing phase starting at the smallest amplitude, the edge is
/// the first crossing of the mid amplitude, linearly interpolated.
pub fn amp_front_position(gd: &GraphData) -> Option<f64> {
    let n = gd.len();
    if n < MIN_FRONT_POINTS {
        return None;
    }
    let half = (gd.min_y()? + gd.max_y()?) / 2.;
    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&a, &b| gd.x(a).total_cmp(&gd.x(b)));
    let start = (0..n).min_by(|&a, &b| gd.y(order[a]).total_cmp(&gd.y(order[b])))?;
    order.rotate_left(start);
    let x0 = gd.x(order[0]);
    let x = |i: usize| x0 + (gd.x(i) - x0).rem_euclid(360.);
    order.windows(2).find_map(|w| {
        let (ya, yb) = (gd.y(w[0]), gd.y(w[1]));
        (ya < half && yb >= half).then(|| {
            let (xa, xb) = (x(w[0]), x(w[1]));
            wrap_phase(xa + (xb - xa) * (half - ya) / (yb - ya))
        })
    })
}

/// DTL1 controller and its scan data
#[derive(Debug, Clone, Default)]
pub struct Dtl1Controller {
    pub params: Dtl1Params,
    /// the two BPMs after the tank
    pub local_bpms: Vec<String>,
    /// 360° scan of the first BPM
    pub amp_scan: BpmScanData,
    pub amp_front_phase_pos: f64,
    /// input energy correction of the last set-up (MeV)
    pub ekin_correction: f64,
    pub pasta_records: Vec<PastaRecord>,
}

impl Dtl1Controller {
    pub fn new(local_bpms: Vec<String>) -> Self {
        Self {
            amp_scan: BpmScanData::new(local_bpms.first().cloned().unwrap_or_default(), 0.),
            local_bpms,
            ..Default::default()
        }
    }
    pub fn with_params(mut self, params: Dtl1Params) -> Self {
        self.params = params;
        self
    }
    pub(crate) fn init(&mut self, init_amp: f64) {
        self.params.min_amp = 0.975 * init_amp;
        self.params.max_amp = 1.025 * init_amp;
        self.params.n_amp_steps = 2;
    }
    pub(crate) fn uses_bpm(&self, bpm: &str) -> bool {
        self.local_bpms.iter().take(2).any(|alias| alias == bpm)
    }
    pub(crate) fn max_time(&self, common: &CommonParams) -> f64 {
        let p = &self.params;
        let n_amps = p.n_amp_steps as f64 + 1.;
        let wait = common.cav_amp_wait_time_mult;
        p.sleep_time * (1. + 360. / p.full_scan_phase_step)
            + p.sleep_time * n_amps * (1. + p.cav_phase_width / p.phase_step)
            + p.sleep_time * n_amps * wait
            + p.sleep_time * (common.cav_amp_backward_steps_mult + 1.) * wait
            + p.fit_time
    }

    pub(crate) fn run(
        &mut self,
        ctx: &mut SetupContext,
        cav: &mut CavityWrapper,
        common: &CommonParams,
    ) -> Result<()> {
        self.amp_scan.clear();
        self.pasta_records.clear();
        self.amp_front_phase_pos = 0.;
        self.ekin_correction = 0.;
        if self.local_bpms.len() < 2 {
            return Err(SetupError::UserInput(format!(
                "Cavity={} needs two BPMs after it!",
                cav.alias
            )));
        }
        for bpm in &self.local_bpms[..2] {
            if !ctx.bpm(bpm)?.is_on() {
                return Err(SetupError::UserInput(format!(
                    "We need them! BPM: {bpm} should be set to <Use> in the Main Table! Cavity={}",
                    cav.alias
                )));
            }
        }
        cav.set_live_amp(ctx.cs, cav.init_amp)
            .map_err(SetupError::hardware(format!("Cannot set amplitude of cavity={}", cav.alias)))?;
        self.amp_scan.cav_amp = cav.init_amp;
        let sweep = PhaseSweep {
            start: -180.,
            stop: 180.,
            step: self.params.full_scan_phase_step,
            sleep_time: self.params.sleep_time,
            failure: "Cannot get valid BPM data for 360 deg scan! Stop.",
        };
        let scan = &mut self.amp_scan;
        sweep.run(ctx, cav, |ctx, phase| {
            scan.add_point(phase, ctx.read_bpm(&scan.bpm)?, 0.);
            Ok(scan.check_last_data_point(0.))
        })?;

        self.amp_front_phase_pos = amp_front_position(&self.amp_scan.amp_gd).ok_or_else(|| {
            SetupError::DataInsufficient(format!(
                "Cannot find the half-hight bpm amplitude position! Cavity={}",
                cav.alias
            ))
        })?;
        cav.phase_guess = wrap_phase(self.amp_front_phase_pos + self.params.phase_shift_from_front);
        log::info!(
            "{}: amplitude front={:.2} deg, phase guess={:.2} deg",
            cav.alias,
            self.amp_front_phase_pos,
            cav.phase_guess
        );

        let p = &self.params;
        let scan = AmpPhaseScan {
            min_amp: p.min_amp,
            max_amp: p.max_amp,
            n_amp_steps: p.n_amp_steps,
            phase_center: cav.phase_guess,
            phase_width: p.cav_phase_width,
            phase_step: p.phase_step,
            sleep_time: p.sleep_time,
            failure: "Cannot get valid BPM data for PASTA scan! Stop.",
        };
        let mut data = PastaData {
            bpms: &self.local_bpms[..2],
            in_use: vec![true; 2],
            checked: vec![0, 1],
            min_bpm_amp: p.min_bpm_amp,
            records: &mut self.pasta_records,
        };
        scan.run(ctx, cav, common, &mut data)?;

        self.guess_pasta_params(ctx, cav)?;
        self.fit_pasta(ctx, cav, common)
    }

    fn pasta_settings(&self, n_points: usize) -> PastaSettings {
        PastaSettings {
            bpm_indices: (0, 1),
            mode: PastaMode::Difference,
            cav_off_phases: None,
            fit_range: (self.params.min_phase_fit, self.params.max_phase_fit),
            n_points,
        }
    }

    /// Amplitude coefficient and input energy guesses
    ///
    /// The input energy is corrected by the difference between the measured PASTA
    /// phase difference at the guessed phase and the design one: -12° for +20 keV.
    fn guess_pasta_params(&mut self, ctx: &mut SetupContext, cav: &mut CavityWrapper) -> Result<()> {
        cav.amp_coeff = cav.design_amp / cav.init_amp;
        let measured: Vec<f64> = self
            .pasta_records
            .iter()
            .filter_map(|r| {
                let p0 = r.scans.first()?.phase_gd.value_y(cav.phase_guess)?;
                let p1 = r.scans.get(1)?.phase_gd.value_y(cav.phase_guess)?;
                Some(make_phase_near(p1 - p0, 0.))
            })
            .collect();
        let Some(first) = self.pasta_records.first().map(|r| &r.scans[0].phase_gd) else {
            return Err(SetupError::DataInsufficient("No PASTA scan data! Stop.".into()));
        };
        if measured.is_empty() || first.is_empty() {
            return Err(SetupError::DataInsufficient("No PASTA scan data! Stop.".into()));
        }
        self.params.min_phase_fit = first.x(0);
        self.params.max_phase_fit = first.x(first.len() - 1);
        let measured = measured.iter().sum::<f64>() / measured.len() as f64;

        let bpms = &self.local_bpms[..2];
        let mut active = ctx.model.activate(&cav.alias, &bpms[1])?;
        let design = active.get_bpm_phases(cav.ekin_in_design, cav.design_phase, 0., bpms)?;
        let design = make_phase_near(design[1] - design[0], 0.);
        self.ekin_correction = -0.02 * (measured - design) / 12.;
        cav.ekin_in = cav.ekin_in_design + self.ekin_correction;
        active.set_model_amp_phase(cav.design_amp, cav.design_phase, 0.)?;
        active.track(cav.ekin_in)?;
        cav.ekin_out = active.ekin_out().unwrap_or(cav.ekin_out_design);

        let guess = [
            wrap_phase(cav.phase_guess - cav.design_phase),
            cav.ekin_in,
            cav.amp_coeff,
        ];
        let settings = self.pasta_settings(PASTA_CURVE_POINTS);
        cav.avg_fit_err = pasta_diff2(&mut active, &mut self.pasta_records, &settings, &guess)?.sqrt();
        drop(active);
        log::info!(
            "{}: input energy correction={:.4} MeV, PASTA initial err={:.3} deg",
            cav.alias,
            self.ekin_correction,
            cav.avg_fit_err
        );
        if self.ekin_correction.abs() > MAX_EKIN_CORRECTION {
            return Err(SetupError::DataInsufficient(format!(
                "The MEBT Reb 4 settings could be wrong! The DTL1 input energy is {:8.4}",
                cav.ekin_in
            )));
        }
        Ok(())
    }

    fn fit_pasta(
        &mut self,
        ctx: &mut SetupContext,
        cav: &mut CavityWrapper,
        common: &CommonParams,
    ) -> Result<()> {
        let stop = self.local_bpms[1].clone();
        let variables = fit_variables(cav, FitSteps::PASTA, true);
        let settings = self.pasta_settings(self.params.n_points_fit);
        let fit = {
            let mut active = ctx.model.activate(&cav.alias, &stop)?;
            let mut scorer = PastaScorer::new(&mut active, &mut self.pasta_records, settings);
            run_cavity_fit(
                &format!("{} PASTA", cav.alias),
                &mut scorer,
                &variables,
                self.params.fit_time,
                ctx.run_state,
                ctx.progress,
            )
        };
        let fit = check_fit(&cav.alias, fit)?;
        {
            let settings = self.pasta_settings(PASTA_CURVE_POINTS);
            let mut active = ctx.model.activate(&cav.alias, &stop)?;
            pasta_diff2(&mut active, &mut self.pasta_records, &settings, &fit.params())?;
        }
        commit_fit(ctx.model, cav, common, &fit)
    }

    pub(crate) fn write_bpms_xml(&self, da: &mut DataAdaptor) {
        da.set_value("amp_front_phase_pos", self.amp_front_phase_pos)
            .set_value("ekin_correction", self.ekin_correction);
        self.amp_scan.write_xml(da.create_child("amp_scan_data"));
        let pasta = da.create_child("pasta_scan_data");
        self.pasta_records.iter().for_each(|record| record.write_xml(pasta));
    }
    pub(crate) fn read_bpms_xml(&mut self, da: &DataAdaptor) -> std::result::Result<(), XmlError> {
        self.amp_front_phase_pos = da.value("amp_front_phase_pos")?;
        if da.has_attribute("ekin_correction") {
            self.ekin_correction = da.value("ekin_correction")?;
        }
        if let Some(scan) = da
            .child("amp_scan_data")
            .and_then(|sda| sda.children_named("BPM_SCAN_DATA").next())
        {
            self.amp_scan = BpmScanData::read_xml(scan)?;
        }
        self.pasta_records = read_pasta_records(da, &self.local_bpms)?;
        Ok(())
    }
}
