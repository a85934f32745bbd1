//! # Simulated machine
//!
//! A [ControlSystem] backed by a "truth" thin gap model of the beamline.
//! The truth differs from the design through per-cavity live to model phase offsets and
//! amplitude coefficients, BPM phase offsets and Gaussian measurement noise.
//! Blanked cavities are off for the beam and a cavity may have a limited phase acceptance:
//! outside of it the beam is lost and the downstream BPM amplitudes drop.

use std::{collections::HashMap, sync::Mutex};

use interface::{
    units::{beta, wrap_phase, C_LIGHT},
    BlankBeam, BpmAmplitudeAvg, BpmPhaseAvg, BpmXAvg, BpmYAvg, Channel, ChannelError,
    ControlSystem, CtlAmpSet, CtlPhaseSet, ModelError, OnlineModel, UniqueIdentifier,
};
use rand::{rngs::StdRng, Rng, SeedableRng};
use rand_distr::{Distribution, Normal, NormalError};
use serde::{Deserialize, Serialize};

use crate::model::{bpm_amplitude_factor, bpm_phase, LatticeSpec, ThinGapLinac};

#[derive(Debug, thiserror::Error)]
pub enum SimulationError {
    #[error("failed to build the simulated lattice")]
    Model(#[from] ModelError),
    #[error("invalid noise level")]
    Noise(#[from] NormalError),
    #[error("{0} is not a cavity of the simulated lattice")]
    UnknownCavity(String),
}

/// Range of the first gap model phase, relative to the design phase, where the beam is transmitted
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Acceptance {
    /// phase of the rising edge (degree)
    pub front: f64,
    /// phase width of the window (degree)
    pub width: f64,
}
impl Acceptance {
    const EDGE: f64 = 3.;
    /// Fraction of the beam transmitted at `phase`
    pub fn transmission(&self, phase: f64) -> f64 {
        let d = wrap_phase(phase - self.front);
        let rise = 1. / (1. + (-d / Self::EDGE).exp());
        let fall = 1. / (1. + ((d - self.width) / Self::EDGE).exp());
        rise * fall
    }
}

/// Difference between the machine and its design model for one cavity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CavityError {
    pub alias: String,
    /// live phase minus model phase (degree)
    pub phase_offset: f64,
    /// model amplitude over live amplitude
    pub amp_coeff: f64,
    pub acceptance: Option<Acceptance>,
}
impl Default for CavityError {
    fn default() -> Self {
        Self {
            alias: String::new(),
            phase_offset: 0.,
            amp_coeff: 1.,
            acceptance: None,
        }
    }
}

/// Ring beam revolution frequency channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RingSpec {
    pub pv: String,
    /// ring circumference (m)
    pub circumference: f64,
}
impl Default for RingSpec {
    fn default() -> Self {
        Self {
            pv: "Ring_Diag:BCM_D09:FFT_peak2".into(),
            circumference: 248.,
        }
    }
}

/// Simulated machine settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    pub seed: u64,
    /// rms BPM phase noise (degree)
    pub phase_noise: f64,
    /// rms BPM amplitude noise (a.u.)
    pub amp_noise: f64,
    /// relative rms net power noise
    pub power_noise: f64,
    /// BPM amplitude of a point-like bunch (a.u.)
    pub bpm_amplitude: f64,
    /// BPM bore radius (m)
    pub bore_radius: f64,
    /// initial longitudinal second moments, the BPM amplitudes depend on the bunch length when set
    pub sigma: Option<[[f64; 2]; 2]>,
    pub cavities: Vec<CavityError>,
    /// BPM phase offsets (degree)
    pub bpm_offsets: Vec<(String, f64)>,
    /// live phase error of the initial settings with respect to the design (degree)
    pub initial_phase_error: f64,
    /// relative live amplitude error of the initial settings with respect to the design (%)
    pub initial_amp_error: f64,
    pub ring: Option<RingSpec>,
}
impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            seed: 0,
            phase_noise: 0.,
            amp_noise: 0.,
            power_noise: 0.,
            bpm_amplitude: 20.,
            bore_radius: 0.035,
            sigma: None,
            cavities: vec![],
            bpm_offsets: vec![],
            initial_phase_error: 0.,
            initial_amp_error: 0.,
            ring: None,
        }
    }
}

/// Control system identity of a simulated cavity
#[derive(Debug, Clone, PartialEq)]
pub struct PlantCavity {
    pub alias: String,
    /// LLRF PV prefix
    pub llrf: String,
    pub net_pwr_pv: String,
    /// net power at the design amplitude (kW)
    pub design_power: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Pv {
    Amp(usize),
    Phase(usize),
    Power(usize),
    Blank(usize),
    BpmPhase(usize),
    BpmAmp(usize),
    BpmX(usize),
    BpmY(usize),
    Ring,
}

#[derive(Debug, Clone)]
struct CavityState {
    alias: String,
    design_amp: f64,
    design_phase: f64,
    design_power: f64,
    error: CavityError,
    amp: f64,
    phase: f64,
    blanked: bool,
}
impl CavityState {
    fn model_amp(&self) -> f64 {
        if self.blanked {
            0.
        } else {
            self.error.amp_coeff * self.amp
        }
    }
    fn model_phase(&self) -> f64 {
        wrap_phase(self.phase - self.error.phase_offset)
    }
}

/// Beam observables at one BPM
#[derive(Debug, Clone, Copy, PartialEq)]
struct Signal {
    phase: f64,
    amp: f64,
}

struct Plant {
    model: ThinGapLinac,
    cavities: Vec<CavityState>,
    bpms: Vec<(String, f64)>,
    rng: StdRng,
    phase_noise: Normal<f64>,
    amp_noise: Normal<f64>,
    power_noise: Normal<f64>,
    signals: Option<Vec<Option<Signal>>>,
    final_ekin: Option<f64>,
}

/// Control system simulator
pub struct SimulatedMachine {
    pvs: HashMap<String, Pv>,
    bpm_frequency: f64,
    injection_energy: f64,
    config: SimulationConfig,
    plant: Mutex<Plant>,
}

impl std::fmt::Debug for SimulatedMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimulatedMachine")
            .field("bpm_frequency", &self.bpm_frequency)
            .field("config", &self.config)
            .finish()
    }
}

fn pv<U: UniqueIdentifier>(prefix: &str) -> String {
    Channel::<U>::new(prefix).pv().to_string()
}

impl SimulatedMachine {
    /// Builds the machine from the design lattice
    ///
    /// The initial live settings reproduce the design up to the configured initial errors.
    pub fn new(
        lattice: LatticeSpec,
        bpm_frequency: f64,
        cavities: Vec<PlantCavity>,
        config: SimulationConfig,
    ) -> Result<Self, SimulationError> {
        let injection_energy = lattice.injection_energy;
        let model = ThinGapLinac::new(lattice)?;
        let mut pvs = HashMap::new();
        let mut states = vec![];
        for (i, cav) in cavities.into_iter().enumerate() {
            let design_amp = model.cavity_amp(&cav.alias)?;
            let design_phase = model.cavity_phase(&cav.alias)?;
            let error = config
                .cavities
                .iter()
                .find(|e| e.alias == cav.alias)
                .cloned()
                .unwrap_or_else(|| CavityError {
                    alias: cav.alias.clone(),
                    ..Default::default()
                });
            pvs.insert(pv::<CtlAmpSet>(&cav.llrf), Pv::Amp(i));
            pvs.insert(pv::<CtlPhaseSet>(&cav.llrf), Pv::Phase(i));
            pvs.insert(pv::<BlankBeam>(&cav.llrf), Pv::Blank(i));
            pvs.insert(cav.net_pwr_pv.clone(), Pv::Power(i));
            states.push(CavityState {
                amp: design_amp / error.amp_coeff * (1. + 0.01 * config.initial_amp_error),
                phase: wrap_phase(design_phase + error.phase_offset + config.initial_phase_error),
                alias: cav.alias,
                design_amp,
                design_phase,
                design_power: cav.design_power,
                error,
                blanked: false,
            });
        }
        for e in &config.cavities {
            if !states.iter().any(|s| s.alias == e.alias) {
                return Err(SimulationError::UnknownCavity(e.alias.clone()));
            }
        }
        let mut bpms = vec![];
        for (i, alias) in model.bpms().into_iter().enumerate() {
            pvs.insert(pv::<BpmPhaseAvg>(&alias), Pv::BpmPhase(i));
            pvs.insert(pv::<BpmAmplitudeAvg>(&alias), Pv::BpmAmp(i));
            pvs.insert(pv::<BpmXAvg>(&alias), Pv::BpmX(i));
            pvs.insert(pv::<BpmYAvg>(&alias), Pv::BpmY(i));
            let offset = config
                .bpm_offsets
                .iter()
                .find(|(bpm, _)| *bpm == alias)
                .map_or(0., |(_, offset)| *offset);
            bpms.push((alias, offset));
        }
        if let Some(ring) = &config.ring {
            pvs.insert(ring.pv.clone(), Pv::Ring);
        }
        let plant = Plant {
            model,
            cavities: states,
            bpms,
            rng: StdRng::seed_from_u64(config.seed),
            phase_noise: Normal::new(0., config.phase_noise)?,
            amp_noise: Normal::new(0., config.amp_noise)?,
            power_noise: Normal::new(0., config.power_noise)?,
            signals: None,
            final_ekin: None,
        };
        log::info!(
            "simulated machine with {} cavities and {} BPMs",
            plant.cavities.len(),
            plant.bpms.len()
        );
        Ok(Self {
            pvs,
            bpm_frequency,
            injection_energy,
            config,
            plant: Mutex::new(plant),
        })
    }
    pub fn config(&self) -> &SimulationConfig {
        &self.config
    }
    fn plant(&self) -> std::sync::MutexGuard<'_, Plant> {
        // a panic while holding the lock leaves the plant consistent: recover it
        self.plant.lock().unwrap_or_else(|e| e.into_inner())
    }
    /// Live amplitude and phase that reproduce the design settings of a cavity
    pub fn design_live_settings(&self, cavity: &str) -> Option<(f64, f64)> {
        self.plant()
            .cavities
            .iter()
            .find(|c| c.alias == cavity)
            .map(|c| {
                (
                    c.design_amp / c.error.amp_coeff,
                    wrap_phase(c.design_phase + c.error.phase_offset),
                )
            })
    }
    /// Current live amplitude and phase of a cavity
    pub fn live_settings(&self, cavity: &str) -> Option<(f64, f64)> {
        self.plant()
            .cavities
            .iter()
            .find(|c| c.alias == cavity)
            .map(|c| (c.amp, c.phase))
    }
    /// Overwrites the live settings of a cavity
    pub fn set_live_settings(&self, cavity: &str, amp: f64, phase: f64) -> bool {
        let mut plant = self.plant();
        let found = match plant.cavities.iter_mut().find(|c| c.alias == cavity) {
            Some(c) => {
                c.amp = amp;
                c.phase = wrap_phase(phase);
                true
            }
            None => false,
        };
        plant.invalidate();
        found
    }
    /// Kinetic energy at the end of the lattice for the current settings
    pub fn final_energy(&self) -> Option<f64> {
        let mut plant = self.plant();
        plant.observe(self);
        plant.final_ekin
    }
}

impl Plant {
    fn invalidate(&mut self) {
        self.signals = None;
        self.final_ekin = None;
    }
    fn apply_settings(&mut self) -> Result<(), ModelError> {
        for c in &self.cavities {
            self.model.set_cavity_amp(&c.alias, c.model_amp())?;
            self.model.set_cavity_phase(&c.alias, c.model_phase())?;
        }
        Ok(())
    }
    /// Fraction of the beam reaching `position`
    fn transmission(&self, position: f64) -> f64 {
        self.cavities
            .iter()
            .filter(|c| !c.blanked && c.amp > 0.)
            .filter_map(|c| {
                let acceptance = c.error.acceptance?;
                let upstream = self.model.position(&c.alias).ok()? < position;
                upstream.then(|| {
                    Acceptance {
                        front: c.design_phase + acceptance.front,
                        ..acceptance
                    }
                    .transmission(c.model_phase())
                })
            })
            .product()
    }
    /// Tracks the beam through the machine and caches the BPM signals
    fn observe(&mut self, machine: &SimulatedMachine) {
        if self.signals.is_some() {
            return;
        }
        let f = machine.bpm_frequency;
        let ekin = machine.injection_energy;
        if let Err(e) = self.apply_settings() {
            log::warn!("simulated machine: {e}");
        }
        let last = last_bpm(&self.bpms, &self.model);
        let trajectory = last
            .as_ref()
            .and_then(|last| self.model.track_particle(None, last, ekin).ok());
        let envelope = match (machine.config.sigma, &last) {
            (Some(sigma), Some(last)) => self.model.track_envelope(None, last, ekin, sigma).ok(),
            _ => None,
        };
        self.final_ekin = trajectory
            .as_ref()
            .and_then(|t| t.final_state())
            .map(|s| s.ekin);
        let mut signals = vec![];
        for (alias, offset) in &self.bpms {
            let state = match &trajectory {
                Some(t) => t.state(alias).cloned(),
                // part of the beam may reach the upstream BPMs
                None => self
                    .model
                    .track_particle(None, alias, ekin)
                    .ok()
                    .and_then(|t| t.final_state().cloned()),
            };
            signals.push(state.map(|s| {
                let bunch = envelope
                    .as_ref()
                    .and_then(|env| env.iter().find(|e| e.node == *alias))
                    .map_or(1., |e| {
                        bpm_amplitude_factor(
                            f,
                            machine.config.bore_radius,
                            s.ekin,
                            self.model.mass(),
                            e.sigma[0][0].sqrt(),
                        )
                    });
                Signal {
                    phase: bpm_phase(f, s.time) + offset,
                    amp: machine.config.bpm_amplitude * bunch * self.transmission(s.position),
                }
            }));
        }
        self.signals = Some(signals);
    }
    fn signal(&mut self, machine: &SimulatedMachine, bpm: usize) -> Option<Signal> {
        self.observe(machine);
        self.signals.as_ref().and_then(|s| s[bpm])
    }
}

fn last_bpm(bpms: &[(String, f64)], model: &ThinGapLinac) -> Option<String> {
    bpms.iter()
        .filter_map(|(alias, _)| Some((alias, model.position(alias).ok()?)))
        .max_by(|a, b| a.1.total_cmp(&b.1))
        .map(|(alias, _)| alias.clone())
}

impl ControlSystem for SimulatedMachine {
    fn connect(&self, pv: &str) -> Result<(), ChannelError> {
        self.pvs
            .contains_key(pv)
            .then_some(())
            .ok_or_else(|| ChannelError::Connect(pv.to_string()))
    }
    fn get(&self, pv: &str) -> Result<f64, ChannelError> {
        let id = *self
            .pvs
            .get(pv)
            .ok_or_else(|| ChannelError::Read(pv.to_string()))?;
        let mut guard = self.plant();
        let plant = &mut *guard;
        let value = match id {
            Pv::Amp(i) => plant.cavities[i].amp,
            Pv::Phase(i) => plant.cavities[i].phase,
            Pv::Blank(i) => f64::from(u8::from(plant.cavities[i].blanked)),
            Pv::Power(i) => {
                let c = &plant.cavities[i];
                let ratio = c.error.amp_coeff * c.amp / c.design_amp;
                let noise = plant.power_noise.sample(&mut plant.rng);
                c.design_power * ratio * ratio * (1. + noise)
            }
            Pv::BpmPhase(i) => match plant.signal(self, i) {
                Some(s) => wrap_phase(s.phase + plant.phase_noise.sample(&mut plant.rng)),
                None => plant.rng.gen_range(-180.0..180.0),
            },
            Pv::BpmAmp(i) => {
                let amp = plant.signal(self, i).map_or(0., |s| s.amp);
                (amp + plant.amp_noise.sample(&mut plant.rng)).abs()
            }
            Pv::BpmX(_) | Pv::BpmY(_) => plant.amp_noise.sample(&mut plant.rng),
            Pv::Ring => {
                plant.observe(self);
                let ring = self.config.ring.as_ref().map_or(248., |r| r.circumference);
                plant
                    .final_ekin
                    .map(|ekin| beta(ekin, plant.model.mass()) * C_LIGHT / ring)
                    .ok_or_else(|| ChannelError::Read(pv.to_string()))?
            }
        };
        Ok(value)
    }
    fn put(&self, pv: &str, value: f64) -> Result<(), ChannelError> {
        let write_error = || ChannelError::Write {
            pv: pv.to_string(),
            value,
        };
        let id = *self.pvs.get(pv).ok_or_else(write_error)?;
        let mut plant = self.plant();
        match id {
            Pv::Amp(i) => plant.cavities[i].amp = value,
            Pv::Phase(i) => plant.cavities[i].phase = wrap_phase(value),
            Pv::Blank(i) => plant.cavities[i].blanked = value != 0.,
            _ => return Err(write_error()),
        }
        plant.invalidate();
        Ok(())
    }
}
