//! # Cavity controllers
//!
//! A [CavityController] drives the set-up of one cavity: it scans the live cavity
//! phase (and amplitude) while reading the local BPMs, fits the scans against the
//! on-line model and stores the new amplitude and phase set-points into its
//! [CavityWrapper].
//! The controller never pushes the new set-points to the machine: the live cavity
//! is always returned to its initial amplitude and phase and the main loop decides
//! what to commit.
//!
//! The three scan algorithms are the variants of [ScanKind]:
//!  * [MebtController]: sine-like 360° scan followed by either a crossing lines scan
//!    or an iterative cavity on/off phase finder,
//!  * [Dtl1Controller]: BPM amplitude front scan followed by a PASTA fit,
//!  * [DtlCclController]: 360° scan fit followed by an optional PASTA fit.

use std::sync::Arc;

use interface::{ChannelError, ControlSystem, DataAdaptor, XmlError};
use serde::{Deserialize, Serialize};

use crate::{
    bpm::{BpmReading, BpmWrapper},
    cavity::CavityWrapper,
    fit::{FitError, Termination},
    model::ModelAdapter,
    progress::ScanProgress,
    run_state::{LocalScanRunState, RunState},
    scorer::{CavityFit, DiffError},
};

mod dtl1;
mod dtl_ccl;
mod mebt;

pub use dtl1::{amp_front_position, Dtl1Controller, Dtl1Params};
pub use dtl_ccl::{DtlCclController, DtlCclParams};
pub use mebt::{MebtAnalysis, MebtController, MebtMode, MebtParams};

/// Message of a cavity set-up interrupted by a stop request
pub const USER_STOP: &str = "user stop";
/// Largest number of consecutive invalid BPM readings at one scan point
pub const MISS_COUNT_MAX: usize = 5;

/// Cavity set-up failures
#[derive(Debug, thiserror::Error)]
pub enum SetupError {
    #[error("{0}")]
    UserInput(String),
    #[error("{0}")]
    DataInsufficient(String),
    #[error("{msg}")]
    Hardware {
        msg: String,
        #[source]
        source: ChannelError,
    },
    #[error("{0}")]
    ModelTracking(String),
    #[error("user stop")]
    UserStop,
}
pub type Result<T> = std::result::Result<T, SetupError>;

impl SetupError {
    pub fn hardware<S: Into<String>>(msg: S) -> impl FnOnce(ChannelError) -> Self {
        let msg = msg.into();
        move |source| Self::Hardware { msg, source }
    }
    pub fn is_user_stop(&self) -> bool {
        matches!(self, Self::UserStop)
    }
}
impl From<DiffError> for SetupError {
    fn from(e: DiffError) -> Self {
        match e {
            DiffError::Data(msg) => Self::DataInsufficient(msg),
            DiffError::Model(e) => Self::ModelTracking(format!("cannot track the probe: {e}")),
        }
    }
}
impl From<interface::ModelError> for SetupError {
    fn from(e: interface::ModelError) -> Self {
        Self::ModelTracking(format!("cannot track the probe: {e}"))
    }
}

/// Turns a fit outcome into a set-up result, an interrupted or failed fit is never committed
pub(crate) fn check_fit(
    cavity: &str,
    fit: std::result::Result<CavityFit, FitError>,
) -> Result<CavityFit> {
    match fit {
        Err(FitError::Stopped) => Err(SetupError::UserStop),
        Err(e) => Err(SetupError::ModelTracking(format!(
            "Cavity={cavity} fit inconclusive: {e}"
        ))),
        Ok(fit) => match &fit.termination {
            Termination::UserStop => Err(SetupError::UserStop),
            Termination::ScorerFailure(msg) => Err(SetupError::ModelTracking(format!(
                "Cavity={cavity} fit inconclusive: {msg}"
            ))),
            _ => Ok(fit),
        },
    }
}

/// Commits the fitted parameters with the historical corrections and
/// tracks the fitted input energy through the cavity at its design settings
pub(crate) fn commit_fit(
    model: &mut ModelAdapter,
    cav: &mut CavityWrapper,
    common: &CommonParams,
    fit: &CavityFit,
) -> Result<()> {
    cav.commit_fit(
        fit.phase_shift,
        fit.amp_coeff,
        common.guess_phase_shift,
        common.guess_cav_amp_shift,
    );
    cav.ekin_in = fit.ekin_in;
    cav.avg_fit_err = fit.avg_err();
    let mut active = model.activate(&cav.alias, &cav.alias)?;
    active.set_model_amp_phase(cav.design_amp, cav.design_phase, 0.)?;
    active.track(cav.ekin_in)?;
    cav.ekin_out = active
        .ekin_out()
        .ok_or_else(|| SetupError::ModelTracking(format!("Cavity={} empty trajectory", cav.alias)))?;
    log::info!(
        "{}: phase shift={:.2} deg, amp coeff={:.5}, Ekin in={:.4} MeV, out={:.4} MeV, err={:.3} deg",
        cav.alias,
        cav.phase_shift,
        cav.amp_coeff,
        cav.ekin_in,
        cav.ekin_out,
        cav.avg_fit_err
    );
    Ok(())
}

/// Outcome of a successful cavity set-up
#[derive(Debug, Clone, PartialEq)]
pub struct SetupReport {
    pub cavity: String,
    pub new_amp: f64,
    pub new_phase: f64,
    pub ekin_in: f64,
    pub ekin_out: f64,
    pub avg_fit_err: f64,
    pub message: String,
}

/// Parameters shared by all the controllers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommonParams {
    /// added to the phase found by the set-up (degree)
    pub guess_phase_shift: f64,
    /// scales the amplitude coefficient by `1 − 0.01·shift` (percent)
    pub guess_cav_amp_shift: f64,
    /// number of sub-steps of each amplitude step when the amplitude is raised back
    pub cav_amp_backward_steps_mult: f64,
    /// wait after an amplitude change in units of the sleep time
    pub cav_amp_wait_time_mult: f64,
}
impl Default for CommonParams {
    fn default() -> Self {
        Self {
            guess_phase_shift: 0.,
            guess_cav_amp_shift: 0.,
            cav_amp_backward_steps_mult: 4.,
            cav_amp_wait_time_mult: 2.,
        }
    }
}

/// Implements the XML attribute I/O of a parameters struct, missing attributes keep their value
macro_rules! xml_params {
    ($ty:ty { $($field:ident: $key:literal),* $(,)? }) => {
        impl $ty {
            pub fn write_xml(&self, da: &mut interface::DataAdaptor) {
                $(da.set_value($key, self.$field);)*
            }
            pub fn read_xml(
                &mut self,
                da: &interface::DataAdaptor,
            ) -> std::result::Result<(), interface::XmlError> {
                $(
                    if da.has_attribute($key) {
                        self.$field = da.value($key)?;
                    }
                )*
                Ok(())
            }
        }
    };
}
pub(crate) use xml_params;

xml_params!(CommonParams {
    guess_phase_shift: "guess_phase_shift",
    guess_cav_amp_shift: "guess_cav_amp_shift",
    cav_amp_backward_steps_mult: "cav_amp_backward_steps_mult",
    cav_amp_wait_time_mult: "cav_amp_wait_time_mult",
});

/// Resources borrowed by a cavity set-up
pub struct SetupContext<'a> {
    pub cs: &'a dyn ControlSystem,
    pub model: &'a mut ModelAdapter,
    pub bpms: &'a [BpmWrapper],
    pub run_state: &'a Arc<RunState>,
    pub progress: &'a ScanProgress,
}

impl SetupContext<'_> {
    pub fn should_stop(&self) -> bool {
        self.run_state.should_stop()
    }
    pub fn check_stop(&self) -> Result<()> {
        if self.should_stop() {
            Err(SetupError::UserStop)
        } else {
            Ok(())
        }
    }
    /// Waits for the machine, fails as soon as a stop is requested
    pub fn sleep(&self, seconds: f64) -> Result<()> {
        if self.progress.time_sleep(seconds, self.run_state) {
            Ok(())
        } else {
            Err(SetupError::UserStop)
        }
    }
    pub fn bpm(&self, alias: &str) -> Result<&BpmWrapper> {
        self.bpms
            .iter()
            .find(|bpm| bpm.alias() == alias)
            .ok_or_else(|| SetupError::UserInput(format!("Unknown BPM={alias}")))
    }
    pub fn read_bpm(&self, alias: &str) -> Result<BpmReading> {
        self.bpm(alias)?
            .read(self.cs)
            .map_err(SetupError::hardware(format!("Cannot read BPM={alias}")))
    }
}

/// Phase sweep of the live cavity
///
/// The points are `start + i·step` up to `stop` included.
pub(crate) struct PhaseSweep<'a> {
    pub start: f64,
    pub stop: f64,
    pub step: f64,
    pub sleep_time: f64,
    /// failure text when a point cannot be measured
    pub failure: &'a str,
}
impl PhaseSweep<'_> {
    pub fn n_points(&self) -> usize {
        ((self.stop - self.start) / self.step + 1e-9).floor() as usize + 1
    }
    /// Sets every phase, waits and calls `measure` until it returns `true`
    ///
    /// `measure` rejects a point by returning `false`, after [MISS_COUNT_MAX]
    /// consecutive rejections the sweep fails.
    pub fn run<F>(&self, ctx: &SetupContext, cav: &mut CavityWrapper, mut measure: F) -> Result<()>
    where
        F: FnMut(&SetupContext, f64) -> Result<bool>,
    {
        if !(self.step > 0.) {
            return Err(SetupError::UserInput(format!(
                "The phase step should be positive! Cavity={}",
                cav.alias
            )));
        }
        for i in 0..self.n_points() {
            let phase = self.start + i as f64 * self.step;
            let mut miss_count = 0;
            loop {
                ctx.check_stop()?;
                cav.set_live_phase(ctx.cs, phase)
                    .map_err(SetupError::hardware(format!("Cannot set phase of cavity={}", cav.alias)))?;
                ctx.sleep(self.sleep_time)?;
                if measure(ctx, phase)? {
                    break;
                }
                miss_count += 1;
                log::debug!("{}: bad BPM data at phase {phase:.1}, miss #{miss_count}", cav.alias);
                if miss_count > MISS_COUNT_MAX {
                    return Err(SetupError::DataInsufficient(format!(
                        "{} Cavity={}",
                        self.failure, cav.alias
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Sink of the points of an amplitude and phase scan
pub(crate) trait AmpPhaseData {
    /// A new cavity amplitude is scanned
    fn start_amplitude(&mut self, cav_amp: f64);
    /// Reads the BPMs at a cavity phase, returns `false` if the reading is rejected
    fn add_point(&mut self, ctx: &SetupContext, cav_phase: f64) -> Result<bool>;
}

/// Geometry of an amplitude and phase scan
pub(crate) struct AmpPhaseScan<'a> {
    pub min_amp: f64,
    pub max_amp: f64,
    pub n_amp_steps: usize,
    pub phase_center: f64,
    pub phase_width: f64,
    pub phase_step: f64,
    pub sleep_time: f64,
    pub failure: &'a str,
}
impl AmpPhaseScan<'_> {
    fn amp_step(&self) -> f64 {
        (self.max_amp - self.min_amp) / self.n_amp_steps.max(1) as f64
    }
    /// Scans the phase window at descending amplitudes, the amplitude is always raised
    /// back to the initial one by small steps afterwards
    pub fn run(
        &self,
        ctx: &SetupContext,
        cav: &mut CavityWrapper,
        common: &CommonParams,
        data: &mut dyn AmpPhaseData,
    ) -> Result<()> {
        let amp_step = self.amp_step();
        let wait = common.cav_amp_wait_time_mult * self.sleep_time;
        let scan = self.scan(ctx, cav, data, amp_step, wait);
        let back_step = amp_step / common.cav_amp_backward_steps_mult.max(1.);
        scan.and(raise_amplitude(ctx, cav, back_step, wait))
    }
    fn scan(
        &self,
        ctx: &SetupContext,
        cav: &mut CavityWrapper,
        data: &mut dyn AmpPhaseData,
        amp_step: f64,
        wait: f64,
    ) -> Result<()> {
        let sweep = PhaseSweep {
            start: self.phase_center - self.phase_width / 2.,
            stop: self.phase_center + self.phase_width / 2.,
            step: self.phase_step,
            sleep_time: self.sleep_time,
            failure: self.failure,
        };
        for i in 0..=self.n_amp_steps.max(1) {
            ctx.check_stop()?;
            let amp = cav
                .set_live_amp(ctx.cs, self.max_amp - i as f64 * amp_step)
                .map_err(SetupError::hardware(format!("Cannot set amplitude of cavity={}", cav.alias)))?;
            log::debug!("{}: scan at amplitude {amp:.5}", cav.alias);
            ctx.sleep(wait)?;
            data.start_amplitude(amp);
            sweep.run(ctx, cav, |ctx, phase| data.add_point(ctx, phase))?;
        }
        Ok(())
    }
}

/// Raises the live amplitude back to the initial one by `step`
///
/// A stop request skips the waits but not the steps.
fn raise_amplitude(ctx: &SetupContext, cav: &mut CavityWrapper, step: f64, wait: f64) -> Result<()> {
    let msg = format!("Cannot restore amplitude of cavity={}", cav.alias);
    let hardware = || SetupError::hardware(msg.clone());
    if step > 0. {
        let mut amp = cav.live_amp + step;
        while amp <= cav.init_amp * 1.0001 {
            cav.set_live_amp(ctx.cs, amp).map_err(hardware())?;
            ctx.progress.time_sleep(wait, ctx.run_state);
            amp += step;
        }
    }
    cav.set_live_amp(ctx.cs, cav.init_amp).map_err(hardware())?;
    ctx.progress.time_sleep(wait, ctx.run_state);
    Ok(())
}

/// Scan algorithm of a cavity
#[derive(Debug, Clone)]
pub enum ScanKind {
    Mebt(MebtController),
    Dtl1(Dtl1Controller),
    DtlCcl(DtlCclController),
}

/// Set-up of one cavity
#[derive(Debug, Clone)]
pub struct CavityController {
    pub cavity: CavityWrapper,
    pub common: CommonParams,
    pub kind: ScanKind,
    local_run_state: Arc<LocalScanRunState>,
}

impl CavityController {
    pub fn new(cavity: CavityWrapper, kind: ScanKind) -> Self {
        Self {
            cavity,
            common: CommonParams::default(),
            kind,
            local_run_state: RunState::new(),
        }
    }
    pub fn with_common(mut self, common: CommonParams) -> Self {
        self.common = common;
        self
    }
    pub fn alias(&self) -> &str {
        &self.cavity.alias
    }
    /// Run state of a set-up started with [CavityController::run_local]
    pub fn local_run_state(&self) -> &Arc<LocalScanRunState> {
        &self.local_run_state
    }
    /// Reads the live cavity settings and resets the scan ranges
    pub fn init(&mut self, cs: &dyn ControlSystem) -> Result<()> {
        self.cavity
            .init(cs)
            .map_err(SetupError::hardware(format!("Cannot read cavity={} PVs", self.cavity.alias)))?;
        if self.cavity.init_amp == 0. {
            return Err(SetupError::UserInput(format!(
                "The live amplitude of cavity={} is 0!",
                self.cavity.alias
            )));
        }
        let init_amp = self.cavity.init_amp;
        match &mut self.kind {
            ScanKind::Mebt(c) => c.init(init_amp),
            ScanKind::Dtl1(c) => c.init(init_amp),
            ScanKind::DtlCcl(c) => c.init(init_amp),
        }
        log::info!(
            "{}: init amp={:.5} phase={:.2}",
            self.cavity.alias,
            self.cavity.init_amp,
            self.cavity.init_phase
        );
        Ok(())
    }
    /// Upper bound of the set-up duration in seconds
    pub fn max_time(&self) -> f64 {
        match &self.kind {
            ScanKind::Mebt(c) => c.max_time(&self.common),
            ScanKind::Dtl1(c) => c.max_time(&self.common),
            ScanKind::DtlCcl(c) => c.max_time(&self.common),
        }
    }
    /// Whether the set-up reads the BPM
    pub fn check_bpm_usage(&self, bpm: &str) -> bool {
        match &self.kind {
            ScanKind::Mebt(c) => c.uses_bpm(bpm),
            ScanKind::Dtl1(c) => c.uses_bpm(bpm),
            ScanKind::DtlCcl(c) => c.uses_bpm(bpm),
        }
    }
    /// Runs the set-up algorithm
    ///
    /// On return, successful or not, the cavity is un-blanked and back to its initial
    /// amplitude and phase.
    pub fn run_setup(&mut self, ctx: &mut SetupContext) -> Result<SetupReport> {
        ctx.progress.set_max_time_count(self.max_time());
        if ctx.should_stop() {
            return Err(SetupError::UserStop);
        }
        if self.cavity.init_amp == 0. {
            return Err(SetupError::UserInput(format!(
                "Push Init Button First! Cavity={}",
                self.cavity.alias
            )));
        }
        self.cavity.new_amp = None;
        self.cavity.new_phase = None;
        self.cavity.is_analyzed = false;
        log::info!("{}: set-up started", self.cavity.alias);
        let cav = &mut self.cavity;
        let result = match &mut self.kind {
            ScanKind::Mebt(c) => c.run(ctx, cav, &self.common),
            ScanKind::Dtl1(c) => c.run(ctx, cav, &self.common),
            ScanKind::DtlCcl(c) => c.run(ctx, cav, &self.common),
        };
        let restored = cav
            .set_blank_beam(ctx.cs, false)
            .and_then(|_| cav.restore_initial(ctx.cs))
            .map_err(SetupError::hardware(format!(
                "Cannot restore the initial settings of cavity={}",
                cav.alias
            )));
        if let Err(e) = &result {
            log::warn!("{}: set-up failed: {e}", cav.alias);
        }
        result?;
        restored?;
        let (Some(new_amp), Some(new_phase)) = (cav.new_amp, cav.new_phase) else {
            return Err(SetupError::DataInsufficient(format!(
                "No new settings found for cavity={}",
                cav.alias
            )));
        };
        cav.is_analyzed = true;
        log::info!(
            "{}: new amp={new_amp:.5} new phase={new_phase:.2}",
            cav.alias
        );
        Ok(SetupReport {
            cavity: cav.alias.clone(),
            new_amp,
            new_phase,
            ekin_in: cav.ekin_in,
            ekin_out: cav.ekin_out,
            avg_fit_err: cav.avg_fit_err,
            message: String::new(),
        })
    }
    /// Runs the set-up of this cavity alone under its own run state
    pub fn run_local(
        &mut self,
        cs: &dyn ControlSystem,
        model: &mut ModelAdapter,
        bpms: &[BpmWrapper],
        progress: &ScanProgress,
    ) -> Result<SetupReport> {
        let run_state = Arc::clone(&self.local_run_state);
        let Some(_guard) = run_state.start() else {
            return Err(SetupError::UserInput(format!(
                "The scan of cavity={} is already running!",
                self.cavity.alias
            )));
        };
        let mut ctx = SetupContext {
            cs,
            model,
            bpms,
            run_state: &run_state,
            progress,
        };
        self.run_setup(&mut ctx)
    }

    pub fn write_xml(&self, parent: &mut DataAdaptor) {
        let da = parent.create_child(format!("CAVITY_CONTROLLER_{}", self.cavity.alias));
        let params = da.create_child("PARAMS");
        match &self.kind {
            ScanKind::Mebt(c) => c.params.write_xml(params),
            ScanKind::Dtl1(c) => c.params.write_xml(params),
            ScanKind::DtlCcl(c) => c.params.write_xml(params),
        }
        self.common.write_xml(da.create_child("COMMON_PARAMS"));
        if let ScanKind::Mebt(c) = &self.kind {
            c.analysis.write_xml(da.create_child("ANALYSIS_PARAMS"));
        }
        self.cavity.write_xml(da);
        let bpms = da.create_child("cavity_bpms_controller");
        bpms.set_value("cav", &self.cavity.alias);
        match &self.kind {
            ScanKind::Mebt(c) => c.write_bpms_xml(bpms),
            ScanKind::Dtl1(c) => c.write_bpms_xml(bpms),
            ScanKind::DtlCcl(c) => c.write_bpms_xml(bpms),
        }
    }
    /// Restores the controller from the `CAVITY_CONTROLLER_<alias>` child of `parent`
    pub fn read_xml(&mut self, parent: &DataAdaptor) -> std::result::Result<(), XmlError> {
        let da = parent.require_child(&format!("CAVITY_CONTROLLER_{}", self.cavity.alias))?;
        if let Some(params) = da.child("PARAMS") {
            match &mut self.kind {
                ScanKind::Mebt(c) => c.params.read_xml(params)?,
                ScanKind::Dtl1(c) => c.params.read_xml(params)?,
                ScanKind::DtlCcl(c) => c.params.read_xml(params)?,
            }
        }
        if let Some(common) = da.child("COMMON_PARAMS") {
            self.common.read_xml(common)?;
        }
        if let (ScanKind::Mebt(c), Some(analysis)) = (&mut self.kind, da.child("ANALYSIS_PARAMS")) {
            c.analysis.read_xml(analysis)?;
        }
        self.cavity.read_xml(da)?;
        if let Some(bpms) = da.child("cavity_bpms_controller") {
            match &mut self.kind {
                ScanKind::Mebt(c) => c.read_bpms_xml(bpms)?,
                ScanKind::Dtl1(c) => c.read_bpms_xml(bpms)?,
                ScanKind::DtlCcl(c) => c.read_bpms_xml(bpms)?,
            }
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! A scripted machine for the controller tests
    use std::sync::Mutex;

    use interface::{
        units::{wrap_phase, H_MINUS_MASS},
        ChannelError, ControlSystem,
    };

    use crate::model::{BpmSpec, CavitySpec, LatticeSpec, ModelAdapter, ThinGapLinac};

    /// Model of a short cavity `CAV` at 0.5 m followed by the BPMs
    pub fn adapter(bpms: &[(&str, f64)]) -> ModelAdapter {
        let model = ThinGapLinac::new(LatticeSpec {
            mass: H_MINUS_MASS,
            injection_energy: 2.5,
            cavities: vec![CavitySpec {
                alias: "CAV".into(),
                position: 0.5,
                length: 0.1,
                n_gaps: 2,
                rf_frequency: 402.5e6,
                amp: 0.1,
                phase: -90.,
            }],
            bpms: bpms
                .iter()
                .map(|&(alias, position)| BpmSpec {
                    alias: alias.into(),
                    position,
                })
                .collect(),
        })
        .unwrap();
        ModelAdapter::new(Box::new(model), 402.5e6).unwrap()
    }

    /// BPM response of the scripted machine to the cavity settings `(amp, phase, blanked)`
    pub type Response = Box<dyn Fn(f64, f64, bool) -> (f64, f64) + Send + Sync>;

    /// One cavity `CAV` (PV prefix `CAV`) and BPMs whose phase and amplitude are
    /// computed from the live cavity settings
    pub struct ScriptedMachine {
        pub state: Mutex<(f64, f64, bool)>,
        pub bpms: Vec<(String, Response)>,
    }
    impl ScriptedMachine {
        pub fn new(amp: f64, phase: f64) -> Self {
            Self {
                state: Mutex::new((amp, phase, false)),
                bpms: vec![],
            }
        }
        pub fn with_bpm<F>(mut self, alias: &str, response: F) -> Self
        where
            F: Fn(f64, f64, bool) -> (f64, f64) + Send + Sync + 'static,
        {
            self.bpms.push((alias.to_string(), Box::new(response)));
            self
        }
        pub fn live(&self) -> (f64, f64, bool) {
            *self.state.lock().unwrap()
        }
    }
    impl ControlSystem for ScriptedMachine {
        fn connect(&self, _pv: &str) -> Result<(), ChannelError> {
            Ok(())
        }
        fn get(&self, pv: &str) -> Result<f64, ChannelError> {
            let (amp, phase, blanked) = self.live();
            match pv {
                "CAV:CtlAmpSet" => return Ok(amp),
                "CAV:CtlPhaseSet" => return Ok(phase),
                "CAV:BlnkBeam" => return Ok(if blanked { 1. } else { 0. }),
                "CAV:NetPwr" => return Ok(100. * amp * amp),
                _ => (),
            }
            for (alias, response) in &self.bpms {
                if let Some(suffix) = pv.strip_prefix(alias.as_str()) {
                    let (bpm_phase, bpm_amp) = response(amp, phase, blanked);
                    return match suffix {
                        ":phaseAvg" => Ok(wrap_phase(bpm_phase)),
                        ":amplitudeAvg" => Ok(bpm_amp),
                        _ => Ok(0.),
                    };
                }
            }
            Err(ChannelError::Read(pv.to_string()))
        }
        fn put(&self, pv: &str, value: f64) -> Result<(), ChannelError> {
            let mut state = self.state.lock().unwrap();
            match pv {
                "CAV:CtlAmpSet" => state.0 = value,
                "CAV:CtlPhaseSet" => state.1 = value,
                "CAV:BlnkBeam" => state.2 = value != 0.,
                _ => {
                    return Err(ChannelError::Write {
                        pv: pv.to_string(),
                        value,
                    })
                }
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{testing::ScriptedMachine, *};

    fn adapter() -> ModelAdapter {
        testing::adapter(&[("BPM1", 1.5)])
    }

    #[test]
    fn sweep_retries_and_fails_on_bad_data() {
        let cs = ScriptedMachine::new(1., 10.).with_bpm("BPM1", |_, phase, _| {
            (phase, if phase > 0. { 0. } else { 5. })
        });
        let bpms = [BpmWrapper::new("BPM1", 1.5)];
        let mut model = adapter();
        let run_state = RunState::new();
        let progress = ScanProgress::hidden();
        let ctx = SetupContext {
            cs: &cs,
            model: &mut model,
            bpms: &bpms,
            run_state: &run_state,
            progress: &progress,
        };
        let mut cav = CavityWrapper::new("CAV", 0.5, "CAV", "CAV:NetPwr");
        cav.init(&cs).unwrap();
        let sweep = PhaseSweep {
            start: -20.,
            stop: 20.,
            step: 10.,
            sleep_time: 0.,
            failure: "Cannot get valid BPM data!",
        };
        assert_eq!(sweep.n_points(), 5);
        let mut points = vec![];
        let mut calls = 0;
        let e = sweep
            .run(&ctx, &mut cav, |ctx, phase| {
                calls += 1;
                let reading = ctx.read_bpm("BPM1")?;
                if reading.amp < 1. {
                    return Ok(false);
                }
                points.push(phase);
                Ok(true)
            })
            .unwrap_err();
        assert_eq!(points, vec![-20., -10., 0.]);
        assert_eq!(calls, 3 + MISS_COUNT_MAX + 1);
        assert_eq!(e.to_string(), "Cannot get valid BPM data! Cavity=CAV");
    }

    #[test]
    fn sweep_stops_on_request() {
        let cs = ScriptedMachine::new(1., 10.).with_bpm("BPM1", |_, phase, _| (phase, 5.));
        let bpms = [BpmWrapper::new("BPM1", 1.5)];
        let mut model = adapter();
        let run_state = RunState::new();
        let progress = ScanProgress::hidden();
        let ctx = SetupContext {
            cs: &cs,
            model: &mut model,
            bpms: &bpms,
            run_state: &run_state,
            progress: &progress,
        };
        let mut cav = CavityWrapper::new("CAV", 0.5, "CAV", "CAV:NetPwr");
        cav.init(&cs).unwrap();
        let sweep = PhaseSweep {
            start: -180.,
            stop: 180.,
            step: 10.,
            sleep_time: 0.,
            failure: "",
        };
        let mut n = 0;
        let e = sweep
            .run(&ctx, &mut cav, |_, phase| {
                n += 1;
                if phase >= 90. {
                    run_state.request_stop();
                }
                Ok(true)
            })
            .unwrap_err();
        assert!(e.is_user_stop());
        assert_eq!(e.to_string(), USER_STOP);
        assert_eq!(n, 28);
    }

    struct Recorder(Vec<(f64, Vec<f64>)>);
    impl AmpPhaseData for Recorder {
        fn start_amplitude(&mut self, cav_amp: f64) {
            self.0.push((cav_amp, vec![]));
        }
        fn add_point(&mut self, _ctx: &SetupContext, cav_phase: f64) -> Result<bool> {
            if let Some((_, phases)) = self.0.last_mut() {
                phases.push(cav_phase);
            }
            Ok(true)
        }
    }

    #[test]
    fn amp_phase_scan_descends_and_restores() {
        let cs = ScriptedMachine::new(1., 10.).with_bpm("BPM1", |_, phase, _| (phase, 5.));
        let bpms = [BpmWrapper::new("BPM1", 1.5)];
        let mut model = adapter();
        let run_state = RunState::new();
        let progress = ScanProgress::hidden();
        let ctx = SetupContext {
            cs: &cs,
            model: &mut model,
            bpms: &bpms,
            run_state: &run_state,
            progress: &progress,
        };
        let mut cav = CavityWrapper::new("CAV", 0.5, "CAV", "CAV:NetPwr");
        cav.safe_relative_amp_down = 50.;
        cav.init(&cs).unwrap();
        let scan = AmpPhaseScan {
            min_amp: 0.8,
            max_amp: 1.,
            n_amp_steps: 2,
            phase_center: 20.,
            phase_width: 10.,
            phase_step: 5.,
            sleep_time: 0.,
            failure: "",
        };
        let mut data = Recorder(vec![]);
        scan.run(&ctx, &mut cav, &CommonParams::default(), &mut data)
            .unwrap();
        let amps: Vec<f64> = data.0.iter().map(|(amp, _)| *amp).collect();
        assert_eq!(amps.len(), 3);
        assert!((amps[0] - 1.).abs() < 1e-12 && (amps[2] - 0.8).abs() < 1e-12);
        assert!(data.0.iter().all(|(_, phases)| phases == &vec![15., 20., 25.]));
        assert_eq!(cs.live().0, 1.);
        assert_eq!(cav.live_amp, 1.);
    }

    #[test]
    fn common_params_xml() {
        let common = CommonParams {
            guess_phase_shift: -6.,
            guess_cav_amp_shift: 0.7,
            ..Default::default()
        };
        let mut da = DataAdaptor::new("COMMON_PARAMS");
        common.write_xml(&mut da);
        let mut other = CommonParams::default();
        other.read_xml(&da).unwrap();
        assert_eq!(other, common);
    }
}
