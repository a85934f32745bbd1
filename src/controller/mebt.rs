//! MEBT buncher set-up
//!
//! The zero-acceleration phase is first found from the harmonic fit of a sine-like 360°
//! scan, then refined either by the intersection of the BPM phase lines measured at
//! several cavity amplitudes or by iterating on the difference between the BPM phases
//! with the cavity on and off.

use std::f64::consts::PI;

use interface::{
    units::{beta, make_phase_near, wrap_phase, C_LIGHT},
    DataAdaptor, XmlError,
};
use serde::{Deserialize, Serialize};

use super::{
    xml_params, AmpPhaseData, AmpPhaseScan, CommonParams, PhaseSweep, Result, SetupContext,
    SetupError,
};
use crate::{
    bpm::{BpmReading, BpmScanData},
    cavity::CavityWrapper,
    fit::LinearFit,
    stats::{AvgErr, GraphData},
};

/// Largest number of bad BPM readings during one step of the iterative phase finder
const BAD_POINTS_MAX: usize = 5;

/// Second stage of the MEBT set-up
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MebtMode {
    /// the sine-like scan result is used as is
    None,
    #[default]
    CrossingScan,
    Iterative,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MebtParams {
    /// phase step of the sine-like scan
    pub full_scan_phase_step: f64,
    pub sleep_time: f64,
    /// BPM readings below this amplitude are rejected
    pub min_bpm_amp: f64,
    pub min_amp: f64,
    pub max_amp: f64,
    pub n_amp_steps: usize,
    /// phase window of the crossing scan centered on the zero-acceleration phase
    pub cav_phase_width: f64,
    pub phase_step: f64,
    pub mode: MebtMode,
    /// number of readings averaged with the cavity on and off
    pub iter_n_avg: usize,
    pub iter_n_steps: usize,
    /// local BPM of the sine-like scan
    pub work_sine_bpm_index: usize,
    /// local BPM of the crossing scan and of the iterative finder
    pub work_bpm_index: usize,
}
impl Default for MebtParams {
    fn default() -> Self {
        Self {
            full_scan_phase_step: 20.,
            sleep_time: 1.5,
            min_bpm_amp: 1.,
            min_amp: 0.,
            max_amp: 0.,
            n_amp_steps: 2,
            cav_phase_width: 30.,
            phase_step: 2.,
            mode: MebtMode::default(),
            iter_n_avg: 5,
            iter_n_steps: 2,
            work_sine_bpm_index: 0,
            work_bpm_index: 0,
        }
    }
}
impl MebtParams {
    pub fn write_xml(&self, da: &mut DataAdaptor) {
        da.set_value("sine_phase_step", self.full_scan_phase_step)
            .set_value("sleep_time", self.sleep_time)
            .set_value("min_bpm_amp", self.min_bpm_amp)
            .set_value("min_amp", self.min_amp)
            .set_value("max_amp", self.max_amp)
            .set_value("n_amp_step", self.n_amp_steps)
            .set_value("cav_phase_width", self.cav_phase_width)
            .set_value("phase_step", self.phase_step)
            .set_value("use_second_stage_scan", self.mode != MebtMode::None)
            .set_value("use_amp_phase_scan", self.mode != MebtMode::Iterative)
            .set_value("iter_n_avg", self.iter_n_avg)
            .set_value("iter_n_steps", self.iter_n_steps);
    }
    pub fn read_xml(&mut self, da: &DataAdaptor) -> std::result::Result<(), XmlError> {
        self.full_scan_phase_step = da.f64_value("sine_phase_step")?;
        self.sleep_time = da.f64_value("sleep_time")?;
        if da.has_attribute("min_bpm_amp") {
            self.min_bpm_amp = da.f64_value("min_bpm_amp")?;
        }
        self.min_amp = da.f64_value("min_amp")?;
        self.max_amp = da.f64_value("max_amp")?;
        self.n_amp_steps = da.value("n_amp_step")?;
        self.cav_phase_width = da.f64_value("cav_phase_width")?;
        self.phase_step = da.f64_value("phase_step")?;
        let second_stage = !da.has_attribute("use_second_stage_scan")
            || da.bool_value("use_second_stage_scan")?;
        let amp_phase_scan =
            !da.has_attribute("use_amp_phase_scan") || da.bool_value("use_amp_phase_scan")?;
        self.mode = match (second_stage, amp_phase_scan) {
            (false, _) => MebtMode::None,
            (true, true) => MebtMode::CrossingScan,
            (true, false) => MebtMode::Iterative,
        };
        if da.has_attribute("iter_n_avg") {
            self.iter_n_avg = da.value("iter_n_avg")?;
            self.iter_n_steps = da.value("iter_n_steps")?;
        }
        Ok(())
    }
}

/// Results of the MEBT set-up analysis
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MebtAnalysis {
    pub sine_min_acc_phase: f64,
    pub sine_max_acc_phase: f64,
    pub zero_acc_phase: f64,
    pub zero_acc_phase_err: f64,
    /// maximal energy gain (keV)
    pub cav_energy_gain: f64,
}
xml_params!(MebtAnalysis {
    sine_min_acc_phase: "sine_min_acc_phase",
    sine_max_acc_phase: "sine_max_acc_phase",
    zero_acc_phase: "zero_acc_phase",
    zero_acc_phase_err: "zero_acc_phase_err",
    cav_energy_gain: "cav_energy_gain",
});

/// MEBT buncher controller and its scan data
#[derive(Debug, Clone, Default)]
pub struct MebtController {
    pub params: MebtParams,
    pub analysis: MebtAnalysis,
    /// BPMs downstream of the cavity
    pub local_bpms: Vec<String>,
    pub in_use: Vec<bool>,
    /// sine-like scan of every local BPM
    pub sine_scans: Vec<BpmScanData>,
    /// crossing scans of every local BPM, one per cavity amplitude
    pub amp_phase_scans: Vec<Vec<BpmScanData>>,
    /// energy gain (keV) against the cavity amplitude
    pub calibration: GraphData,
    pub calibration_fit: GraphData,
}

impl MebtController {
    pub fn new(local_bpms: Vec<String>) -> Self {
        Self {
            in_use: vec![true; local_bpms.len()],
            sine_scans: local_bpms.iter().map(|bpm| BpmScanData::new(bpm, 0.)).collect(),
            amp_phase_scans: vec![vec![]; local_bpms.len()],
            local_bpms,
            ..Default::default()
        }
    }
    pub fn with_params(mut self, params: MebtParams) -> Self {
        self.params = params;
        self
    }
    pub(crate) fn init(&mut self, init_amp: f64) {
        self.params.min_amp = 0.75 * init_amp;
        self.params.max_amp = init_amp;
        self.params.n_amp_steps = 2;
    }
    pub(crate) fn uses_bpm(&self, bpm: &str) -> bool {
        [self.params.work_sine_bpm_index, self.params.work_bpm_index]
            .iter()
            .any(|&i| self.local_bpms.get(i).is_some_and(|alias| alias == bpm))
    }
    pub(crate) fn max_time(&self, common: &CommonParams) -> f64 {
        let p = &self.params;
        let mut time = p.sleep_time * (1. + 360. / p.full_scan_phase_step);
        let n_amps = p.n_amp_steps as f64 + 1.;
        match p.mode {
            MebtMode::None => (),
            MebtMode::CrossingScan => {
                time += p.sleep_time * n_amps * (1. + p.cav_phase_width / p.phase_step);
                time += p.sleep_time * n_amps * common.cav_amp_wait_time_mult;
                time += p.sleep_time
                    * n_amps
                    * common.cav_amp_backward_steps_mult
                    * common.cav_amp_wait_time_mult;
            }
            MebtMode::Iterative => {
                time += (2. * (p.iter_n_avg * p.iter_n_steps) as f64 + 1.) * p.sleep_time;
            }
        }
        time
    }
    fn clear(&mut self) {
        self.sine_scans.iter_mut().for_each(BpmScanData::clear);
        self.amp_phase_scans.iter_mut().for_each(Vec::clear);
        self.calibration.clear();
        self.calibration_fit.clear();
        self.analysis = MebtAnalysis::default();
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
        let sine_bpm = self.local_bpm(self.params.work_sine_bpm_index, cav)?.to_string();
        let work_bpm = self.local_bpm(self.params.work_bpm_index, cav)?.to_string();
        if !(ctx.bpm(&sine_bpm)?.is_on() && ctx.bpm(&work_bpm)?.is_on()) {
            return Err(SetupError::UserInput(format!(
                "We need them! BPMs: {sine_bpm} and {work_bpm} should be set to <Use> in the Main Table!"
            )));
        }
        cav.set_live_amp(ctx.cs, cav.init_amp)
            .map_err(SetupError::hardware(format!("Cannot set amplitude of cavity={}", cav.alias)))?;
        self.sine_like_scan(ctx, cav)?;
        let zero = self.analyze_sine_like_scan(ctx, cav, &sine_bpm, common)?;
        cav.new_amp = Some(cav.init_amp);
        cav.new_phase = Some(zero);
        // the refinements start from the measured crossing, they add the guess shift themselves
        let crossing = wrap_phase(zero - common.guess_phase_shift);
        match self.params.mode {
            MebtMode::None => Ok(()),
            MebtMode::CrossingScan => self.crossing_scan(ctx, cav, common, &work_bpm, crossing),
            MebtMode::Iterative => self.iterative_phase_finder(ctx, cav, common, &work_bpm, crossing),
        }
    }

    fn sine_like_scan(&mut self, ctx: &SetupContext, cav: &mut CavityWrapper) -> Result<()> {
        let sweep = PhaseSweep {
            start: -180.,
            stop: 180.,
            step: self.params.full_scan_phase_step,
            sleep_time: self.params.sleep_time,
            failure: "Cannot get valid BPM data for sine-like scan! Stop.",
        };
        for scan in self.sine_scans.iter_mut() {
            scan.cav_amp = cav.init_amp;
        }
        let (work, min_amp) = (self.params.work_sine_bpm_index, self.params.min_bpm_amp);
        let (bpms, scans) = (&self.local_bpms, &mut self.sine_scans);
        sweep.run(ctx, cav, |ctx, phase| {
            for (bpm, scan) in bpms.iter().zip(scans.iter_mut()) {
                scan.add_point(phase, ctx.read_bpm(bpm)?, 0.);
            }
            if scans[work].check_last_data_point(min_amp) {
                return Ok(true);
            }
            scans
                .iter_mut()
                .enumerate()
                .filter(|(i, _)| *i != work)
                .for_each(|(_, scan)| scan.remove_last_point());
            Ok(false)
        })
    }

    /// Harmonic fit of the sine-like scan, returns the zero-acceleration phase with the
    /// guess phase shift
    fn analyze_sine_like_scan(
        &mut self,
        ctx: &SetupContext,
        cav: &mut CavityWrapper,
        sine_bpm: &str,
        common: &CommonParams,
    ) -> Result<f64> {
        let scan = &mut self.sine_scans[self.params.work_sine_bpm_index];
        let harmonics = scan.make_harmonic_fit().map_err(|e| {
            log::warn!("{}: harmonic fit failed: {e}", cav.alias);
            SetupError::DataInsufficient(format!(
                "Cannot fit the sine-like scan data! Stop. Cavity={}",
                cav.alias
            ))
        })?;
        let zero = wrap_phase(harmonics.zero_accel_phase + common.guess_phase_shift);
        let coeff = energy_gain_coeff(ctx, cav, sine_bpm)?;
        let func = harmonics.func;
        let swing = 0.5
            * (func.value(harmonics.min_accel_phase) - func.value(harmonics.max_accel_phase)).abs()
            * PI
            / 180.;
        let energy_gain = 1000. * coeff * swing;
        self.analysis = MebtAnalysis {
            sine_min_acc_phase: harmonics.min_accel_phase,
            sine_max_acc_phase: harmonics.max_accel_phase,
            zero_acc_phase: zero,
            zero_acc_phase_err: 0.,
            cav_energy_gain: energy_gain,
        };
        cav.energy_gain = energy_gain;
        log::info!(
            "{}: sine-like scan zero acc. phase={zero:.2} deg, energy gain={energy_gain:.2} keV",
            cav.alias
        );
        Ok(zero)
    }

    fn crossing_scan(
        &mut self,
        ctx: &SetupContext,
        cav: &mut CavityWrapper,
        common: &CommonParams,
        work_bpm: &str,
        crossing: f64,
    ) -> Result<()> {
        let scan = AmpPhaseScan {
            min_amp: self.params.min_amp,
            max_amp: self.params.max_amp,
            n_amp_steps: self.params.n_amp_steps,
            phase_center: crossing,
            phase_width: self.params.cav_phase_width,
            phase_step: self.params.phase_step,
            sleep_time: self.params.sleep_time,
            failure: "Cannot get valid BPM data for sine-like scan! Stop.",
        };
        let mut data = CrossingData {
            bpms: &self.local_bpms,
            in_use: &self.in_use,
            scans: &mut self.amp_phase_scans,
            work: self.params.work_bpm_index,
            min_bpm_amp: self.params.min_bpm_amp,
        };
        scan.run(ctx, cav, common, &mut data)?;
        let coeff = energy_gain_coeff(ctx, cav, work_bpm)?;
        let (cross, err) = self.find_intersection(coeff).ok_or_else(|| {
            SetupError::DataInsufficient(format!(
                "Cannot find cavity phase from scan crossing! Stop. Cavity={}",
                cav.alias
            ))
        })?;
        let phase = wrap_phase(cross + common.guess_phase_shift);
        self.analysis.zero_acc_phase = phase;
        self.analysis.zero_acc_phase_err = err;
        cav.new_phase = Some(phase);
        log::info!(
            "{}: crossing scan zero acc. phase={phase:.2}±{err:.2} deg",
            cav.alias
        );
        Ok(())
    }

    /// Average of the intersections of the BPM phase lines of every pair of amplitudes
    ///
    /// The amplitude calibration (energy gain against amplitude) is filled on the way.
    fn find_intersection(&mut self, coeff: f64) -> Option<(f64, f64)> {
        self.calibration.clear();
        self.calibration_fit.clear();
        let records = self.amp_phase_scans.get_mut(self.params.work_bpm_index)?;
        if records.len() < 2 {
            return None;
        }
        if let Some(reference) = records.last().and_then(|r| r.phase_gd.ys().first().copied()) {
            records
                .iter_mut()
                .for_each(|r| r.phase_gd.unwrap_phases_near(reference));
        }
        let lines = records
            .iter_mut()
            .map(|r| r.make_linear_fit().ok())
            .collect::<Option<Vec<LinearFit>>>()?;
        for (record, line) in records.iter().zip(&lines) {
            self.calibration
                .add_point(record.cav_amp, 1000. * coeff * line.slope.abs(), 0.);
        }
        let (i_max, max_amp) = self
            .calibration
            .xs()
            .iter()
            .copied()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(&b.1))?;
        self.analysis.cav_energy_gain = self.calibration.y(i_max);
        let fit = LinearFit::new(self.calibration.xs(), self.calibration.ys()).ok()?;
        for i in 0..5 {
            let amp = max_amp * i as f64 / 4.;
            let err = fit.intercept_err.hypot(amp * fit.slope_err);
            self.calibration_fit.add_point(amp, fit.value(amp), err);
        }
        let crossings: Vec<f64> = lines
            .iter()
            .enumerate()
            .flat_map(|(i, a)| lines[i + 1..].iter().filter_map(|b| a.intersection(b)))
            .collect();
        AvgErr::from_samples(&crossings).map(|AvgErr { avg, err }| (avg, err))
    }

    fn iterative_phase_finder(
        &mut self,
        ctx: &SetupContext,
        cav: &mut CavityWrapper,
        common: &CommonParams,
        work_bpm: &str,
        zero: f64,
    ) -> Result<()> {
        let p = self.params.clone();
        let alias = cav.alias.clone();
        let scan = &mut self.sine_scans[p.work_bpm_index];
        scan.cav_off_amp = None;
        scan.cav_off_phase = None;
        scan.cav_on_amp = None;
        scan.cav_on_phase = None;
        // BPM phase derivative near the zero-acceleration phase
        let mut cav_phases = vec![];
        let mut bpm_phases: Vec<f64> = vec![];
        for (x, y, _) in scan.phase_gd.points() {
            let cav_phase = make_phase_near(x, zero);
            if (cav_phase - zero).abs() < 0.7 * p.cav_phase_width {
                let bpm_phase = bpm_phases.last().map_or(y, |&last| make_phase_near(y, last));
                cav_phases.push(cav_phase);
                bpm_phases.push(bpm_phase);
            }
        }
        let spread = cav_phases.iter().cloned().fold(f64::MIN, f64::max)
            - cav_phases.iter().cloned().fold(f64::MAX, f64::min);
        let line = if cav_phases.len() < 2 || spread < 1. {
            None
        } else {
            LinearFit::new(&cav_phases, &bpm_phases).ok()
        };
        let Some(line) = line else {
            return Err(SetupError::DataInsufficient(format!(
                "Cav.={alias}. Cannot calculate the BPM's phase derivative for BPM={work_bpm}"
            )));
        };
        let derivative = if line.slope != 0. { 1. / line.slope } else { 0. };

        let hardware = |what: &str| SetupError::hardware(format!("Cannot {what} of cavity={alias}"));
        cav.set_live_phase(ctx.cs, zero).map_err(hardware("set phase"))?;
        let mut phase_err = 0.;
        for step in 0..p.iter_n_steps {
            let mut bad_points = 0;
            let mut samples = [vec![], vec![]];
            for (blank, sink) in [false, true].into_iter().zip(samples.iter_mut()) {
                cav.set_blank_beam(ctx.cs, blank).map_err(hardware("blank beam"))?;
                while sink.len() < p.iter_n_avg && bad_points < BAD_POINTS_MAX {
                    ctx.sleep(p.sleep_time)?;
                    let reading = ctx.read_bpm(work_bpm)?;
                    if reading.amp > p.min_bpm_amp {
                        sink.push(reading);
                    } else {
                        bad_points += 1;
                    }
                }
            }
            cav.set_blank_beam(ctx.cs, false).map_err(hardware("un-blank beam"))?;
            if bad_points >= BAD_POINTS_MAX {
                return Err(SetupError::DataInsufficient(format!(
                    "Cav.={alias} A lot of bad BPM data. BPM={work_bpm}"
                )));
            }
            let [on, off] = samples.map(|s| average(&s));
            let (Some((on_amp, on_phase)), Some((off_amp, off_phase))) = (on, off) else {
                return Err(SetupError::DataInsufficient(format!(
                    "Cav.={alias}. Not enough data for the iterative fitting."
                )));
            };
            let delta = wrap_phase(on_phase.avg - off_phase.avg);
            let cav_phase = wrap_phase(cav.live_phase - derivative * delta);
            cav.set_live_phase(ctx.cs, cav_phase).map_err(hardware("set phase"))?;
            ctx.sleep(p.sleep_time)?;
            phase_err = (derivative
                * (delta.powi(2) + off_phase.err.powi(2) + on_phase.err.powi(2)).sqrt())
            .abs();
            scan.cav_on_amp = Some(on_amp);
            scan.cav_on_phase = Some(on_phase);
            scan.cav_off_amp = Some(off_amp);
            scan.cav_off_phase = Some(off_phase);
            log::debug!("{alias}: iteration #{step} delta={delta:.3} deg phase={cav_phase:.3} deg");
        }
        let phase = wrap_phase(cav.live_phase + common.guess_phase_shift);
        if let Some(h) = scan.harmonics.as_mut() {
            h.zero_accel_phase = cav.live_phase;
        }
        self.analysis.zero_acc_phase = phase;
        self.analysis.zero_acc_phase_err = phase_err;
        cav.new_phase = Some(phase);
        log::info!("{alias}: iterative zero acc. phase={phase:.2}±{phase_err:.2} deg");
        Ok(())
    }

    pub(crate) fn write_bpms_xml(&self, da: &mut DataAdaptor) {
        da.set_value("work_sine_bpm_index", self.params.work_sine_bpm_index)
            .set_value("work_bpm_index", self.params.work_bpm_index);
        self.calibration.write_xml(da, "amp_calibration_gd");
        self.calibration_fit.write_xml(da, "amp_calibration_fit_gd");
        for scan in &self.sine_scans {
            scan.write_xml(da);
        }
        for (bpm, scans) in self.local_bpms.iter().zip(&self.amp_phase_scans) {
            let sda = da.create_child(format!("amp_phase_scan_data_{bpm}"));
            for scan in scans {
                scan.write_xml(sda);
            }
        }
        let in_use: Vec<&str> = self
            .in_use
            .iter()
            .map(|&on| if on { "1" } else { "0" })
            .collect();
        da.create_child("inUse_bpms_arr")
            .set_value("arr", in_use.join(" "));
    }
    pub(crate) fn read_bpms_xml(&mut self, da: &DataAdaptor) -> std::result::Result<(), XmlError> {
        self.params.work_sine_bpm_index = da.value("work_sine_bpm_index")?;
        self.params.work_bpm_index = da.value("work_bpm_index")?;
        self.calibration = GraphData::read_xml(da, "amp_calibration_gd")?;
        self.calibration_fit = GraphData::read_xml(da, "amp_calibration_fit_gd")?;
        let sine_scans = da
            .children_named("BPM_SCAN_DATA")
            .map(BpmScanData::read_xml)
            .collect::<std::result::Result<Vec<_>, _>>()?;
        for (scan, read) in self.sine_scans.iter_mut().zip(sine_scans) {
            *scan = read;
        }
        for (bpm, scans) in self.local_bpms.iter().zip(self.amp_phase_scans.iter_mut()) {
            *scans = match da.child(&format!("amp_phase_scan_data_{bpm}")) {
                Some(sda) => sda
                    .children_named("BPM_SCAN_DATA")
                    .map(BpmScanData::read_xml)
                    .collect::<std::result::Result<Vec<_>, _>>()?,
                None => vec![],
            };
        }
        if let Some(arr) = da.child("inUse_bpms_arr") {
            let flags: Vec<bool> = arr.string_value("arr")?.split_whitespace().map(|s| s == "1").collect();
            for (in_use, flag) in self.in_use.iter_mut().zip(flags) {
                *in_use = flag;
            }
        }
        Ok(())
    }
}

/// Energy gain (MeV) per radian of BPM phase for a drift from the cavity to the BPM
fn energy_gain_coeff(ctx: &SetupContext, cav: &CavityWrapper, bpm: &str) -> Result<f64> {
    let length = ctx.bpm(bpm)?.position() - cav.position;
    if !(length > 0.) || !(cav.ekin_in_design > 0.) {
        return Err(SetupError::UserInput(format!(
            "BPM={bpm} should be downstream of cavity={} with a positive design energy",
            cav.alias
        )));
    }
    let ekin = cav.ekin_in_design;
    let beta = beta(ekin, ctx.model.mass());
    Ok(ekin * 2. * beta * C_LIGHT / (2. * PI * ctx.model.bpm_frequency() * length))
}

fn average(readings: &[BpmReading]) -> Option<(AvgErr, AvgErr)> {
    let amps: Vec<f64> = readings.iter().map(|r| r.amp).collect();
    let phases: Vec<f64> = readings.iter().map(|r| r.phase).collect();
    Some((AvgErr::from_samples(&amps)?, AvgErr::from_phases(&phases)?))
}

/// Crossing scan points of the local BPMs in use, checked on the work BPM
struct CrossingData<'a> {
    bpms: &'a [String],
    in_use: &'a [bool],
    scans: &'a mut Vec<Vec<BpmScanData>>,
    work: usize,
    min_bpm_amp: f64,
}
impl AmpPhaseData for CrossingData<'_> {
    fn start_amplitude(&mut self, cav_amp: f64) {
        for (bpm, scans) in self.bpms.iter().zip(self.scans.iter_mut()) {
            scans.push(BpmScanData::new(bpm, cav_amp));
        }
    }
    fn add_point(&mut self, ctx: &SetupContext, cav_phase: f64) -> Result<bool> {
        let (bpms, in_use) = (self.bpms, self.in_use);
        let active = || {
            bpms.iter()
                .zip(in_use)
                .enumerate()
                .filter(|(_, (_, &on))| on)
                .map(|(i, (bpm, _))| (i, bpm))
        };
        for (i, bpm) in active() {
            let reading = ctx.read_bpm(bpm)?;
            if let Some(scan) = self.scans[i].last_mut() {
                scan.add_point(cav_phase, reading, 0.);
            }
        }
        let work = self.work;
        let good = match self.scans.get_mut(work).and_then(|s| s.last_mut()) {
            Some(scan) if in_use.get(work) == Some(&true) => {
                scan.check_last_data_point(self.min_bpm_amp)
            }
            _ => true,
        };
        if !good {
            for (i, _) in active().filter(|(i, _)| *i != work) {
                if let Some(scan) = self.scans[i].last_mut() {
                    scan.remove_last_point();
                }
            }
        }
        Ok(good)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        bpm::BpmWrapper,
        controller::{
            testing::{adapter, ScriptedMachine},
            CavityController, ScanKind,
        },
        progress::ScanProgress,
    };

    const OFFSET: f64 = 40.;

    fn machine() -> ScriptedMachine {
        let response = |amp: f64, phase: f64, blanked: bool| {
            let kick = if blanked {
                0.
            } else {
                10. * amp * (phase - 30.).to_radians().sin()
            };
            (OFFSET + kick, 10.)
        };
        ScriptedMachine::new(1., -45.)
            .with_bpm("MEBT_Diag:BPM01", response)
            .with_bpm("MEBT_Diag:BPM02", response)
    }

    fn controller(mode: MebtMode) -> CavityController {
        let mut cav = CavityWrapper::new("CAV", 0.5, "CAV", "CAV:NetPwr");
        cav.safe_relative_amp_down = 50.;
        cav.ekin_in_design = 2.5;
        let mebt = MebtController::new(vec!["MEBT_Diag:BPM01".into(), "MEBT_Diag:BPM02".into()])
            .with_params(MebtParams {
                sleep_time: 0.,
                full_scan_phase_step: 10.,
                mode,
                ..Default::default()
            });
        CavityController::new(cav, ScanKind::Mebt(mebt))
    }

    fn bpms() -> Vec<BpmWrapper> {
        vec![
            BpmWrapper::new("MEBT_Diag:BPM01", 1.5),
            BpmWrapper::new("MEBT_Diag:BPM02", 2.5),
        ]
    }

    #[test]
    fn sine_like_scan_finds_zero_crossing() {
        let cs = machine();
        let mut model = adapter(&[("MEBT_Diag:BPM01", 1.5), ("MEBT_Diag:BPM02", 2.5)]);
        let mut ctrl = controller(MebtMode::None);
        ctrl.init(&cs).unwrap();
        let report = ctrl
            .run_local(&cs, &mut model, &bpms(), &ScanProgress::hidden())
            .unwrap();
        assert!((report.new_phase - 30.).abs() < 1., "{report:?}");
        assert_eq!(report.new_amp, 1.);
        assert_eq!(cs.live(), (1., -45., false));
        let ScanKind::Mebt(mebt) = &ctrl.kind else {
            unreachable!()
        };
        assert_eq!(mebt.sine_scans[0].len(), 37);
        assert!(ctrl.cavity.energy_gain > 0.);
    }

    #[test]
    fn crossing_scan() {
        let cs = machine();
        let mut model = adapter(&[("MEBT_Diag:BPM01", 1.5), ("MEBT_Diag:BPM02", 2.5)]);
        let mut ctrl = controller(MebtMode::CrossingScan);
        ctrl.common.guess_phase_shift = 1.5;
        ctrl.init(&cs).unwrap();
        let report = ctrl
            .run_local(&cs, &mut model, &bpms(), &ScanProgress::hidden())
            .unwrap();
        assert!((report.new_phase - 31.5).abs() < 0.3, "{report:?}");
        let ScanKind::Mebt(mebt) = &ctrl.kind else {
            unreachable!()
        };
        assert_eq!(mebt.amp_phase_scans[0].len(), 3);
        assert_eq!(mebt.calibration.len(), 3);
        assert!(mebt.calibration.y(0) > mebt.calibration.y(2));
        assert_eq!(cs.live(), (1., -45., false));
    }

    #[test]
    fn crossing_scan_around_the_measured_crossing() {
        let cs = machine();
        let mut model = adapter(&[("MEBT_Diag:BPM01", 1.5), ("MEBT_Diag:BPM02", 2.5)]);
        let mut ctrl = controller(MebtMode::CrossingScan);
        ctrl.common.guess_phase_shift = 12.;
        ctrl.init(&cs).unwrap();
        let report = ctrl
            .run_local(&cs, &mut model, &bpms(), &ScanProgress::hidden())
            .unwrap();
        assert!((report.new_phase - 42.).abs() < 0.3, "{report:?}");
        let ScanKind::Mebt(mebt) = &ctrl.kind else {
            unreachable!()
        };
        // the guess shift is applied once, to the result only
        let xs = mebt.amp_phase_scans[0][0].phase_gd.xs();
        let center = 0.5 * (xs[0] + xs[xs.len() - 1]);
        assert!((center - 30.).abs() < 1., "{xs:?}");
    }

    #[test]
    fn iterative_phase_finder() {
        let cs = machine();
        let mut model = adapter(&[("MEBT_Diag:BPM01", 1.5), ("MEBT_Diag:BPM02", 2.5)]);
        let mut ctrl = controller(MebtMode::Iterative);
        ctrl.init(&cs).unwrap();
        let report = ctrl
            .run_local(&cs, &mut model, &bpms(), &ScanProgress::hidden())
            .unwrap();
        assert!((report.new_phase - 30.).abs() < 0.5, "{report:?}");
        let ScanKind::Mebt(mebt) = &ctrl.kind else {
            unreachable!()
        };
        let off = mebt.sine_scans[0].cav_off_phase.unwrap();
        assert!((off.avg - OFFSET).abs() < 1e-9);
        assert!(!cs.live().2);
    }

    #[test]
    fn switched_off_bpm_is_refused() {
        let cs = machine();
        let mut model = adapter(&[("MEBT_Diag:BPM01", 1.5), ("MEBT_Diag:BPM02", 2.5)]);
        let mut ctrl = controller(MebtMode::None);
        ctrl.init(&cs).unwrap();
        let bpms = bpms();
        bpms[0].set_on(false);
        let e = ctrl
            .run_local(&cs, &mut model, &bpms, &ScanProgress::hidden())
            .unwrap_err();
        assert!(e.to_string().starts_with("We need them!"), "{e}");
        assert!(ctrl.check_bpm_usage("MEBT_Diag:BPM01"));
        assert!(!ctrl.check_bpm_usage("MEBT_Diag:BPM02"));
    }

    #[test]
    fn xml() {
        let cs = machine();
        let mut model = adapter(&[("MEBT_Diag:BPM01", 1.5), ("MEBT_Diag:BPM02", 2.5)]);
        let mut ctrl = controller(MebtMode::CrossingScan);
        ctrl.init(&cs).unwrap();
        ctrl.run_local(&cs, &mut model, &bpms(), &ScanProgress::hidden())
            .unwrap();
        let mut root = DataAdaptor::new("ROOT");
        ctrl.write_xml(&mut root);
        let root = DataAdaptor::parse(&root.to_xml_string()).unwrap();
        let mut other = controller(MebtMode::None);
        other.read_xml(&root).unwrap();
        let (ScanKind::Mebt(a), ScanKind::Mebt(b)) = (&ctrl.kind, &other.kind) else {
            unreachable!()
        };
        assert_eq!(a.params, b.params);
        assert_eq!(a.analysis, b.analysis);
        assert_eq!(a.sine_scans, b.sine_scans);
        assert_eq!(a.amp_phase_scans, b.amp_phase_scans);
        assert_eq!(other.cavity.new_phase, ctrl.cavity.new_phase);
    }
}
