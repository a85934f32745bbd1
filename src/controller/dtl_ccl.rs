//! DTL and CCL tank set-up
//!
//! A 360° phase scan read by a BPM inside the tank is fitted with the model to get a
//! first estimate of the phase shift and of the amplitude coefficient.
//! The estimate is then refined by a PASTA scan: the phase window around the
//! estimate is scanned at a few amplitudes while two BPMs downstream of the tank are
//! read, and the model phase difference of these BPMs is fitted to the measured one
//! with the input energy free.

use interface::{
    units::{make_phase_near, wrap_phase},
    DataAdaptor, XmlError,
};
use serde::{Deserialize, Serialize};

use super::{
    check_fit, commit_fit, xml_params, AmpPhaseData, AmpPhaseScan, CommonParams, PhaseSweep,
    Result, SetupContext, SetupError,
};
use crate::{
    bpm::BpmScanData,
    cavity::CavityWrapper,
    model::ModelAdapter,
    scorer::{
        fit_variables, full_scan_diff2, pasta_diff2, run_cavity_fit, FitSteps, FullScanScorer,
        PastaMode, PastaRecord, PastaScorer, PastaSettings,
    },
};

/// Smallest 360° scan the first guess is made from
const MIN_GUESS_POINTS: usize = 10;
/// Largest number of bad BPM readings of the cavity off scan
const BAD_POINTS_MAX: usize = 5;
/// Number of points of the PASTA model curves kept for display
const PASTA_CURVE_POINTS: usize = 30;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DtlCclParams {
    pub full_scan_phase_step: f64,
    pub sleep_time: f64,
    /// time limit of the 360° scan fit (s)
    pub full_scan_fit_time: f64,
    pub use_pasta: bool,
    pub min_amp: f64,
    pub max_amp: f64,
    pub n_amp_steps: usize,
    pub cav_phase_width: f64,
    pub phase_step: f64,
    pub min_bpm_amp: f64,
    /// cavity phase range of the PASTA model curves, set by the scan
    pub min_phase_fit: f64,
    pub max_phase_fit: f64,
    /// number of points of the PASTA model curves during the fit
    pub n_points_fit: usize,
    /// time limit of the PASTA fit (s)
    pub fit_time: f64,
    /// the model BPM phases are normalized by the cavity off phases
    pub use_cav_off: bool,
    pub use_n1_bpm: bool,
    pub use_n2_bpm: bool,
    /// number of cavity off readings, no cavity off scan if 0
    pub cav_off_n_avg: usize,
}
impl Default for DtlCclParams {
    fn default() -> Self {
        Self {
            full_scan_phase_step: 10.,
            sleep_time: 1.9,
            full_scan_fit_time: 10.,
            use_pasta: true,
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
            use_cav_off: false,
            use_n1_bpm: false,
            use_n2_bpm: false,
            cav_off_n_avg: 0,
        }
    }
}
xml_params!(DtlCclParams {
    full_scan_phase_step: "full_scan_phase_step",
    sleep_time: "sleep_time",
    full_scan_fit_time: "full_scan_fit_time",
    use_pasta: "do_pasta_scan",
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
    use_cav_off: "use_cav_off",
    use_n1_bpm: "use_n1_bpm",
    use_n2_bpm: "use_n2_bpm",
    cav_off_n_avg: "cav_off_n_avg",
});

/// DTL and CCL tanks controller and its scan data
#[derive(Debug, Clone, Default)]
pub struct DtlCclController {
    pub params: DtlCclParams,
    /// local BPMs, the BPMs inside the tank first
    pub local_bpms: Vec<String>,
    pub n_inside: usize,
    /// local BPM of the 360° scan, inside the tank
    pub sin_wave_bpm_index: usize,
    pub pasta_bpm_0_index: usize,
    pub pasta_bpm_1_index: usize,
    /// 360° scans of the BPMs inside the tank
    pub full_scans: Vec<BpmScanData>,
    /// cavity off readings of every local BPM
    pub cav_off_scans: Vec<BpmScanData>,
    pub pasta_records: Vec<PastaRecord>,
}

impl DtlCclController {
    /// The first `n_inside` local BPMs are inside the tank, the PASTA BPMs are the
    /// two following ones
    pub fn new(local_bpms: Vec<String>, n_inside: usize) -> Self {
        let n_inside = n_inside.min(local_bpms.len());
        Self {
            full_scans: local_bpms[..n_inside]
                .iter()
                .map(|bpm| BpmScanData::new(bpm, 0.))
                .collect(),
            cav_off_scans: local_bpms.iter().map(|bpm| BpmScanData::new(bpm, 0.)).collect(),
            sin_wave_bpm_index: n_inside.saturating_sub(1).min(1),
            pasta_bpm_0_index: n_inside,
            pasta_bpm_1_index: n_inside + 1,
            n_inside,
            local_bpms,
            ..Default::default()
        }
    }
    pub fn with_params(mut self, params: DtlCclParams) -> Self {
        self.params = params;
        self
    }
    /// Selects the inside BPM of the 360° scan
    pub fn with_sin_wave_bpm(mut self, index: usize) -> Self {
        self.sin_wave_bpm_index = index.min(self.n_inside.saturating_sub(1));
        self
    }
    pub(crate) fn init(&mut self, init_amp: f64) {
        self.params.min_amp = 0.975 * init_amp;
        self.params.max_amp = 1.025 * init_amp;
        self.params.n_amp_steps = 2;
    }
    pub(crate) fn uses_bpm(&self, bpm: &str) -> bool {
        [
            self.sin_wave_bpm_index,
            self.pasta_bpm_0_index,
            self.pasta_bpm_1_index,
        ]
        .iter()
        .any(|&i| self.local_bpms.get(i).is_some_and(|alias| alias == bpm))
    }
    pub(crate) fn max_time(&self, common: &CommonParams) -> f64 {
        let p = &self.params;
        let mut time = p.sleep_time * (1. + 360. / p.full_scan_phase_step) + p.full_scan_fit_time;
        if p.use_pasta {
            let n_amps = p.n_amp_steps as f64 + 1.;
            let wait = common.cav_amp_wait_time_mult;
            time += p.sleep_time * n_amps * (1. + p.cav_phase_width / p.phase_step);
            time += p.sleep_time * n_amps * wait;
            time += p.sleep_time * (common.cav_amp_backward_steps_mult + 1.) * wait;
            if p.use_cav_off {
                time += p.sleep_time * p.cav_off_n_avg as f64;
            }
            time += p.fit_time;
        }
        time
    }
    fn clear(&mut self) {
        self.full_scans.iter_mut().for_each(BpmScanData::clear);
        self.clear_pasta();
    }
    fn clear_pasta(&mut self) {
        self.cav_off_scans.iter_mut().for_each(|scan| {
            scan.clear();
            scan.cav_off_amp = None;
            scan.cav_off_phase = None;
        });
        self.pasta_records.clear();
    }
    fn local_bpm(&self, index: usize, cav: &CavityWrapper) -> Result<&str> {
        self.local_bpms
            .get(index)
            .map(String::as_str)
            .ok_or_else(|| SetupError::UserInput(format!("No local BPM #{index} for cavity={}", cav.alias)))
    }

    pub(crate) fn run(
        &mut self,
        ctx: &mut SetupContext,
        cav: &mut CavityWrapper,
        common: &CommonParams,
    ) -> Result<()> {
        self.clear();
        if self.sin_wave_bpm_index >= self.n_inside {
            return Err(SetupError::UserInput(format!(
                "No BPM inside cavity={} for the 360 deg scan!",
                cav.alias
            )));
        }
        cav.set_live_amp(ctx.cs, cav.init_amp)
            .map_err(SetupError::hardware(format!("Cannot set amplitude of cavity={}", cav.alias)))?;
        self.full_scan(ctx, cav)?;
        self.guess_from_full_scan(ctx, cav)?;
        self.fit_full_scan(ctx, cav, common)?;
        if !self.params.use_pasta {
            return Ok(());
        }
        let pasta_bpms = [
            self.local_bpm(self.pasta_bpm_0_index, cav)?,
            self.local_bpm(self.pasta_bpm_1_index, cav)?,
        ];
        for bpm in pasta_bpms {
            if !ctx.bpm(bpm)?.is_on() {
                return Err(SetupError::UserInput(format!(
                    "We need it! BPM: {bpm} should be set to <Use> in the Main Table! Cavity={}",
                    cav.alias
                )));
            }
        }
        self.cav_off_scan(ctx, cav)?;
        self.pasta_scan(ctx, cav, common)?;
        self.fit_pasta(ctx, cav, common)
    }

    /// 360° scan of the BPMs inside the tank at the initial amplitude
    fn full_scan(&mut self, ctx: &SetupContext, cav: &mut CavityWrapper) -> Result<()> {
        let sweep = PhaseSweep {
            start: -180.,
            stop: 180.,
            step: self.params.full_scan_phase_step,
            sleep_time: self.params.sleep_time,
            failure: "Cannot get valid BPM data for 360 deg scan! Stop.",
        };
        for scan in self.full_scans.iter_mut() {
            scan.cav_amp = cav.init_amp;
        }
        let scans = &mut self.full_scans;
        sweep.run(ctx, cav, |ctx, phase| {
            for scan in scans.iter_mut() {
                let reading = ctx.read_bpm(&scan.bpm)?;
                scan.add_point(phase, reading, 0.);
            }
            let checks: Vec<bool> = scans
                .iter_mut()
                .map(|scan| scan.check_last_data_point(0.))
                .collect();
            if checks.iter().all(|&good| good) {
                return Ok(true);
            }
            scans
                .iter_mut()
                .zip(checks)
                .filter(|(_, good)| *good)
                .for_each(|(scan, _)| scan.remove_last_point());
            Ok(false)
        })
    }

    /// Phase shift and amplitude coefficient from the position of the BPM phase minimum and
    /// from the BPM phase swing compared to the model at the design settings
    fn guess_from_full_scan(&mut self, ctx: &mut SetupContext, cav: &mut CavityWrapper) -> Result<()> {
        let scan = &self.full_scans[self.sin_wave_bpm_index];
        let gd = &scan.phase_gd;
        if gd.len() < MIN_GUESS_POINTS {
            return Err(SetupError::DataInsufficient(format!(
                "Not enough point in the full 360 deg scan! Cav={}",
                cav.alias
            )));
        }
        let (meas_min_pos, meas_min) = gd
            .points()
            .map(|(x, y, _)| (x, y))
            .min_by(|a, b| a.1.total_cmp(&b.1))
            .unwrap_or_default();
        let meas_swing = gd.max_y().unwrap_or(meas_min) - meas_min;

        if cav.ekin_in_design > 0. {
            cav.ekin_in = cav.ekin_in_design;
            cav.ekin_out = cav.ekin_out_design;
        }
        let bpm = [scan.bpm.as_str()];
        let mut active = ctx.model.activate(&cav.alias, bpm[0])?;
        active.set_model_amp_phase(cav.design_amp, cav.design_phase, 0.)?;
        let mut previous = 0.;
        let (mut model_min_pos, mut model_min, mut model_max) = (0., f64::MAX, f64::MIN);
        for &cav_phase in gd.xs() {
            let phase = active.get_bpm_phases(cav.ekin_in, cav_phase, 0., &bpm)?[0];
            previous = make_phase_near(phase, previous);
            if previous < model_min {
                model_min = previous;
                model_min_pos = cav_phase;
            }
            model_max = model_max.max(previous);
        }
        drop(active);
        let model_swing = model_max - model_min;
        if !(model_swing > 0. && meas_swing > 0.) {
            return Err(SetupError::DataInsufficient(format!(
                "The 360 deg scan of BPM={} is flat! Cavity={}",
                bpm[0], cav.alias
            )));
        }
        let phase_shift = wrap_phase(meas_min_pos - model_min_pos);
        cav.phase_guess = wrap_phase(cav.design_phase + phase_shift);
        cav.amp_coeff = cav.design_amp * meas_swing / model_swing / cav.init_amp;
        log::info!(
            "{}: 360 deg scan guess phase={:.2} deg, amp coeff={:.5}",
            cav.alias,
            cav.phase_guess,
            cav.amp_coeff
        );
        Ok(())
    }

    fn fit_full_scan(
        &mut self,
        ctx: &mut SetupContext,
        cav: &mut CavityWrapper,
        common: &CommonParams,
    ) -> Result<()> {
        let variables = fit_variables(cav, FitSteps::FULL_SCAN, false);
        let scan = &mut self.full_scans[self.sin_wave_bpm_index];
        let bpm = scan.bpm.clone();
        let fit = {
            let mut active = ctx.model.activate(&cav.alias, &bpm)?;
            let mut scorer = FullScanScorer::new(&mut active, scan, cav.init_amp);
            run_cavity_fit(
                &format!("{} 360 deg", cav.alias),
                &mut scorer,
                &variables,
                self.params.full_scan_fit_time,
                ctx.run_state,
                ctx.progress,
            )
        };
        let fit = check_fit(&cav.alias, fit)?;
        {
            let mut active = ctx.model.activate(&cav.alias, &bpm)?;
            full_scan_diff2(&mut active, scan, cav.init_amp, &fit.params())?;
        }
        commit_fit(ctx.model, cav, common, &fit)
    }

    /// Readings of the local BPMs with the beam blanked in the cavity
    fn cav_off_scan(&mut self, ctx: &SetupContext, cav: &mut CavityWrapper) -> Result<()> {
        let n = self.params.cav_off_n_avg;
        if n == 0 {
            return Ok(());
        }
        let alias = cav.alias.clone();
        cav.set_blank_beam(ctx.cs, true)
            .map_err(SetupError::hardware(format!("Cannot blank beam of cavity={alias}")))?;
        let scan = self.cav_off_points(ctx, &alias, n);
        let unblank = cav
            .set_blank_beam(ctx.cs, false)
            .map_err(SetupError::hardware(format!("Cannot un-blank beam of cavity={alias}")));
        scan.and(unblank)?;
        for scan in self.cav_off_scans.iter_mut() {
            if let Some((amp, phase)) = scan.averages() {
                scan.cav_off_amp = Some(amp);
                scan.cav_off_phase = Some(phase);
            }
        }
        if let Some(ekin) = self.cav_off_energy(ctx.model, cav.ekin_in) {
            log::info!("{alias}: cavity off energy={ekin:.4} MeV");
        }
        Ok(())
    }
    fn cav_off_points(&mut self, ctx: &SetupContext, alias: &str, n: usize) -> Result<()> {
        let (mut i, mut bad) = (0, 0);
        let check = self.sin_wave_bpm_index;
        while i < n {
            ctx.sleep(self.params.sleep_time)?;
            for scan in self.cav_off_scans.iter_mut() {
                let reading = ctx.read_bpm(&scan.bpm)?;
                scan.add_point(i as f64, reading, 0.);
            }
            if self.cav_off_scans[check].check_last_data_point(self.params.min_bpm_amp) {
                i += 1;
            } else {
                self.cav_off_scans
                    .iter_mut()
                    .enumerate()
                    .filter(|(j, _)| *j != check)
                    .for_each(|(_, scan)| scan.remove_last_point());
                bad += 1;
            }
            if bad >= BAD_POINTS_MAX {
                return Err(SetupError::DataInsufficient(format!(
                    "Cannot get valid BPM data for cav. off. Cavity={alias}"
                )));
            }
            ctx.check_stop()?;
        }
        Ok(())
    }
    /// Beam energy from the cavity off phases of the two PASTA BPMs
    pub fn cav_off_energy(&self, model: &ModelAdapter, ekin_guess: f64) -> Option<f64> {
        let (i0, i1) = (self.pasta_bpm_0_index, self.pasta_bpm_1_index);
        let (s0, s1) = (self.cav_off_scans.get(i0)?, self.cav_off_scans.get(i1)?);
        let positions = (model.position(&s0.bpm).ok()?, model.position(&s1.bpm).ok()?);
        let phases = (s0.cav_off_phase?.avg, s1.cav_off_phase?.avg);
        model.calculate_ekin(positions, phases, ekin_guess)
    }

    fn pasta_scan(
        &mut self,
        ctx: &SetupContext,
        cav: &mut CavityWrapper,
        common: &CommonParams,
    ) -> Result<()> {
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
        let in_use = self
            .local_bpms
            .iter()
            .map(|bpm| ctx.bpm(bpm).map(|b| b.is_on()))
            .collect::<Result<Vec<bool>>>()?;
        let mut data = PastaData {
            bpms: &self.local_bpms,
            in_use,
            checked: vec![
                self.sin_wave_bpm_index,
                self.pasta_bpm_0_index,
                self.pasta_bpm_1_index,
            ],
            min_bpm_amp: p.min_bpm_amp,
            records: &mut self.pasta_records,
        };
        scan.run(ctx, cav, common, &mut data)
    }

    fn pasta_settings(&self, cav: &CavityWrapper) -> Result<PastaSettings> {
        let p = &self.params;
        let cav_off_phases = if p.use_cav_off {
            let phase = |i: usize| self.cav_off_scans.get(i).and_then(|s| s.cav_off_phase);
            match (phase(self.pasta_bpm_0_index), phase(self.pasta_bpm_1_index)) {
                (Some(p0), Some(p1)) => Some([p0.avg, p1.avg]),
                _ => {
                    return Err(SetupError::DataInsufficient(format!(
                        "No cavity off data for the PASTA BPMs! Cavity={}",
                        cav.alias
                    )))
                }
            }
        } else {
            None
        };
        Ok(PastaSettings {
            bpm_indices: (self.pasta_bpm_0_index, self.pasta_bpm_1_index),
            mode: PastaMode::new(p.use_cav_off, p.use_n1_bpm, p.use_n2_bpm),
            cav_off_phases,
            fit_range: (p.min_phase_fit, p.max_phase_fit),
            n_points: p.n_points_fit,
        })
    }

    fn fit_pasta(
        &mut self,
        ctx: &mut SetupContext,
        cav: &mut CavityWrapper,
        common: &CommonParams,
    ) -> Result<()> {
        let first = self
            .pasta_records
            .first()
            .and_then(|r| r.scans.get(self.pasta_bpm_0_index))
            .filter(|s| !s.is_empty())
            .ok_or_else(|| SetupError::DataInsufficient("No PASTA scan data! Stop.".into()))?;
        let gd = &first.phase_gd;
        self.params.min_phase_fit = gd.x(0);
        self.params.max_phase_fit = gd.x(gd.len() - 1);
        let settings = self.pasta_settings(cav)?;
        let curves = PastaSettings {
            n_points: PASTA_CURVE_POINTS,
            ..settings.clone()
        };
        let stop = self.local_bpm(self.pasta_bpm_1_index, cav)?.to_string();
        let variables = fit_variables(cav, FitSteps::PASTA, true);
        let guess: Vec<f64> = variables.iter().map(|v| v.value).collect();
        let fit = {
            let mut active = ctx.model.activate(&cav.alias, &stop)?;
            let diff2 = pasta_diff2(&mut active, &mut self.pasta_records, &curves, &guess)?;
            log::debug!("{}: PASTA initial err={:.3} deg", cav.alias, diff2.sqrt());
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
            let mut active = ctx.model.activate(&cav.alias, &stop)?;
            pasta_diff2(&mut active, &mut self.pasta_records, &curves, &fit.params())?;
        }
        commit_fit(ctx.model, cav, common, &fit)
    }

    pub(crate) fn write_bpms_xml(&self, da: &mut DataAdaptor) {
        da.set_value("sin_wave_bpm_index", self.sin_wave_bpm_index)
            .set_value("pasta_bpm_0_index", self.pasta_bpm_0_index)
            .set_value("pasta_bpm_1_index", self.pasta_bpm_1_index);
        let full = da.create_child("full_scan_data");
        self.full_scans.iter().for_each(|scan| scan.write_xml(full));
        let off = da.create_child("cav_off_scan_data");
        self.cav_off_scans.iter().for_each(|scan| scan.write_xml(off));
        let pasta = da.create_child("pasta_scan_data");
        self.pasta_records.iter().for_each(|record| record.write_xml(pasta));
    }
    pub(crate) fn read_bpms_xml(&mut self, da: &DataAdaptor) -> std::result::Result<(), XmlError> {
        self.sin_wave_bpm_index = da.value("sin_wave_bpm_index")?;
        self.pasta_bpm_0_index = da.value("pasta_bpm_0_index")?;
        self.pasta_bpm_1_index = da.value("pasta_bpm_1_index")?;
        if let Some(full) = da.child("full_scan_data") {
            read_scans(full, &mut self.full_scans)?;
        }
        if let Some(off) = da.child("cav_off_scan_data") {
            read_scans(off, &mut self.cav_off_scans)?;
        }
        self.pasta_records = read_pasta_records(da, &self.local_bpms)?;
        Ok(())
    }
}

/// PASTA records of the `pasta_scan_data` child of `da`
///
/// The record scans follow the order of `bpms` whatever the document order.
pub(super) fn read_pasta_records(
    da: &DataAdaptor,
    bpms: &[String],
) -> std::result::Result<Vec<PastaRecord>, XmlError> {
    let Some(pasta) = da.child("pasta_scan_data") else {
        return Ok(vec![]);
    };
    pasta
        .children_named("pasta_record")
        .map(|rda| {
            let read = PastaRecord::read_xml(rda)?;
            let mut record = PastaRecord::new(read.cav_amp, bpms);
            record.use_in_pasta = read.use_in_pasta;
            for scan in read.scans {
                if let Some(local) = record.scans.iter_mut().find(|s| s.bpm == scan.bpm) {
                    *local = scan;
                }
            }
            Ok(record)
        })
        .collect()
}

/// Replaces the scans by the ones of the same BPM in `da`
pub(super) fn read_scans(da: &DataAdaptor, scans: &mut [BpmScanData]) -> std::result::Result<(), XmlError> {
    for sda in da.children_named("BPM_SCAN_DATA") {
        let read = BpmScanData::read_xml(sda)?;
        if let Some(scan) = scans.iter_mut().find(|s| s.bpm == read.bpm) {
            *scan = read;
        }
    }
    Ok(())
}

/// PASTA points of the local BPMs in use
///
/// A point is rejected if the 360° scan BPM or one of the PASTA BPMs reads a low amplitude.
pub(super) struct PastaData<'a> {
    pub bpms: &'a [String],
    pub in_use: Vec<bool>,
    /// indices of the BPMs whose amplitude is checked
    pub checked: Vec<usize>,
    pub min_bpm_amp: f64,
    pub records: &'a mut Vec<PastaRecord>,
}
impl AmpPhaseData for PastaData<'_> {
    fn start_amplitude(&mut self, cav_amp: f64) {
        self.records.push(PastaRecord::new(cav_amp, self.bpms));
    }
    fn add_point(&mut self, ctx: &SetupContext, cav_phase: f64) -> Result<bool> {
        let Some(record) = self.records.last_mut() else {
            return Ok(true);
        };
        let in_use = &self.in_use;
        for (scan, _) in record.scans.iter_mut().zip(in_use).filter(|(_, &on)| on) {
            let reading = ctx.read_bpm(&scan.bpm)?;
            scan.add_point(cav_phase, reading, 0.);
        }
        let failed = self
            .checked
            .iter()
            .copied()
            .filter(|&i| in_use.get(i) == Some(&true))
            .find(|&i| !record.scans[i].check_last_data_point(self.min_bpm_amp));
        let Some(failed) = failed else {
            return Ok(true);
        };
        record
            .scans
            .iter_mut()
            .zip(in_use)
            .enumerate()
            .filter(|(i, (_, &on))| on && *i != failed)
            .for_each(|(_, (scan, _))| scan.remove_last_point());
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        bpm::BpmWrapper,
        controller::{CavityController, ScanKind},
        live::{CavityError, PlantCavity, SimulatedMachine, SimulationConfig},
        model::{BpmSpec, CavitySpec, LatticeSpec, ThinGapLinac},
        progress::ScanProgress,
    };
    use interface::{units::H_MINUS_MASS, ControlSystem};

    const BPMS: [(&str, f64); 3] = [("BPM_IN", 1.2), ("BPM_A", 2.), ("BPM_B", 3.5)];

    fn lattice() -> LatticeSpec {
        LatticeSpec {
            mass: H_MINUS_MASS,
            injection_energy: 7.5,
            cavities: vec![CavitySpec {
                alias: "CAV".into(),
                position: 1.,
                length: 1.,
                n_gaps: 10,
                rf_frequency: 402.5e6,
                amp: 1.5,
                phase: -30.,
            }],
            bpms: BPMS
                .iter()
                .map(|&(alias, position)| BpmSpec {
                    alias: alias.into(),
                    position,
                })
                .collect(),
        }
    }

    /// The live phase is 25° above the model phase and the live amplitude 25% above the
    /// model amplitude: the design live settings are (1.875, -5°)
    fn machine() -> SimulatedMachine {
        SimulatedMachine::new(
            lattice(),
            402.5e6,
            vec![PlantCavity {
                alias: "CAV".into(),
                llrf: "CAV".into(),
                net_pwr_pv: "CAV:NetPwr".into(),
                design_power: 1000.,
            }],
            SimulationConfig {
                cavities: vec![CavityError {
                    alias: "CAV".into(),
                    phase_offset: 25.,
                    amp_coeff: 0.8,
                    acceptance: None,
                }],
                ..Default::default()
            },
        )
        .unwrap()
    }

    fn model() -> ModelAdapter {
        ModelAdapter::new(Box::new(ThinGapLinac::new(lattice()).unwrap()), 402.5e6).unwrap()
    }

    fn bpms() -> Vec<BpmWrapper> {
        BPMS.iter()
            .map(|&(alias, position)| BpmWrapper::new(alias, position))
            .collect()
    }

    fn controller(params: DtlCclParams) -> CavityController {
        let mut cav = CavityWrapper::new("CAV", 1., "CAV", "CAV:NetPwr");
        cav.design_amp = 1.5;
        cav.design_phase = -30.;
        cav.ekin_in_design = 7.5;
        let dtl = DtlCclController::new(BPMS.iter().map(|(b, _)| b.to_string()).collect(), 1)
            .with_params(params);
        CavityController::new(cav, ScanKind::DtlCcl(dtl))
    }

    fn fast() -> DtlCclParams {
        DtlCclParams {
            sleep_time: 0.,
            full_scan_fit_time: 3.,
            fit_time: 5.,
            ..Default::default()
        }
    }

    #[test]
    fn bpm_indices() {
        let dtl = DtlCclController::new(
            ["I0", "I1", "I2", "D0", "D1"].map(String::from).to_vec(),
            3,
        );
        assert_eq!(dtl.sin_wave_bpm_index, 1);
        assert_eq!((dtl.pasta_bpm_0_index, dtl.pasta_bpm_1_index), (3, 4));
        assert!(dtl.uses_bpm("I1") && dtl.uses_bpm("D1") && !dtl.uses_bpm("I0"));
        assert_eq!(dtl.clone().with_sin_wave_bpm(7).sin_wave_bpm_index, 2);
        let one = DtlCclController::new(["I0", "D0", "D1"].map(String::from).to_vec(), 1);
        assert_eq!(one.sin_wave_bpm_index, 0);
    }

    #[test]
    fn full_scan_only() {
        let cs = machine();
        let mut model = model();
        let mut ctrl = controller(DtlCclParams {
            use_pasta: false,
            ..fast()
        });
        ctrl.init(&cs).unwrap();
        let report = ctrl
            .run_local(&cs, &mut model, &bpms(), &ScanProgress::hidden())
            .unwrap();
        assert!((report.new_phase + 5.).abs() < 0.5, "{report:?}");
        assert!((report.new_amp / 1.875 - 1.).abs() < 0.01, "{report:?}");
        assert_eq!(report.ekin_in, 7.5);
        let ScanKind::DtlCcl(dtl) = &ctrl.kind else {
            unreachable!()
        };
        assert_eq!(dtl.full_scans[0].len(), 37);
        assert_eq!(dtl.full_scans[0].phase_fit_gd.len(), 37);
        assert!(dtl.pasta_records.is_empty());
        assert_eq!(cs.live_settings("CAV"), cs.design_live_settings("CAV"));
    }

    #[test]
    fn pasta_with_cavity_off() {
        let cs = machine();
        let mut model = model();
        let mut ctrl = controller(DtlCclParams {
            use_cav_off: true,
            cav_off_n_avg: 3,
            ..fast()
        });
        ctrl.init(&cs).unwrap();
        let report = ctrl
            .run_local(&cs, &mut model, &bpms(), &ScanProgress::hidden())
            .unwrap();
        assert!((report.new_phase + 5.).abs() < 1., "{report:?}");
        assert!((report.new_amp / 1.875 - 1.).abs() < 0.02, "{report:?}");
        assert!((report.ekin_in - 7.5).abs() < 0.05, "{report:?}");
        let ScanKind::DtlCcl(dtl) = &ctrl.kind else {
            unreachable!()
        };
        assert_eq!(dtl.pasta_records.len(), 3);
        assert_eq!(dtl.pasta_records[1].scans[1].len(), 11);
        assert_eq!(dtl.pasta_records[0].scans[2].phase_fit_gd.len(), PASTA_CURVE_POINTS);
        assert_eq!(dtl.cav_off_scans[1].len(), 3);
        let ekin = dtl.cav_off_energy(&model, 7.4).unwrap();
        assert!((ekin - 7.5).abs() < 1e-3, "{ekin}");
        assert_eq!(cs.live_settings("CAV"), cs.design_live_settings("CAV"));
        assert_eq!(cs.get("CAV:BlnkBeam").unwrap(), 0.);
    }

    #[test]
    fn pasta_bpm_switched_off() {
        let cs = machine();
        let mut model = model();
        let mut ctrl = controller(fast());
        ctrl.init(&cs).unwrap();
        let bpms = bpms();
        bpms[2].set_on(false);
        let e = ctrl
            .run_local(&cs, &mut model, &bpms, &ScanProgress::hidden())
            .unwrap_err();
        assert!(matches!(e, SetupError::UserInput(_)), "{e}");
        assert!(e.to_string().contains("BPM_B"));
    }

    #[test]
    fn xml() {
        let cs = machine();
        let mut model = model();
        let mut ctrl = controller(DtlCclParams {
            full_scan_fit_time: 1.,
            fit_time: 1.,
            n_amp_steps: 1,
            ..fast()
        });
        ctrl.init(&cs).unwrap();
        ctrl.run_local(&cs, &mut model, &bpms(), &ScanProgress::hidden())
            .unwrap();
        let mut root = DataAdaptor::new("ROOT");
        ctrl.write_xml(&mut root);
        let root = DataAdaptor::parse(&root.to_xml_string()).unwrap();
        let mut other = controller(DtlCclParams::default());
        other.read_xml(&root).unwrap();
        let (ScanKind::DtlCcl(a), ScanKind::DtlCcl(b)) = (&ctrl.kind, &other.kind) else {
            unreachable!()
        };
        assert_eq!(a.params, b.params);
        assert_eq!(a.full_scans, b.full_scans);
        assert_eq!(a.pasta_records, b.pasta_records);
        assert_eq!(other.cavity.new_amp, ctrl.cavity.new_amp);
        assert_eq!(other.cavity.ekin_in, ctrl.cavity.ekin_in);
    }
}
