//! # Model adapter
//!
//! [ModelAdapter] owns the on-line model of the beamline and a snapshot of the design
//! amplitudes and phases of every cavity.
//! A cavity is made active with [ModelAdapter::activate]: the returned [ActiveCavity] guard
//! zeroes the amplitudes of all the other cavities and gives access to the model observables
//! of the active cavity; dropping the guard restores the design snapshot so the model is never
//! left dirty.
//!
//! ```
//! use linac_tuneup::model::{ModelAdapter, ThinGapLinac};
//! use linac_tuneup::config::TuneUpConfig;
//!
//! let config = TuneUpConfig::default();
//! let model = ThinGapLinac::new(config.lattice.clone()).unwrap();
//! let mut adapter = ModelAdapter::new(Box::new(model), config.bpm_frequency).unwrap();
//! {
//!     let mut cav = adapter.activate("DTL1", "DTL_Diag:BPM104").unwrap();
//!     cav.set_model_amp_phase(0., 0., 0.).unwrap();
//! }
//! assert!(adapter.cavity_amp("DTL1").unwrap() > 0.);
//! ```

use interface::{
    model::{Result, Sigma},
    print_info,
    units::{beta, make_phase_near, wrap_phase, C_LIGHT},
    EnvelopeState, ModelError, OnlineModel, Trajectory,
};

mod thin_gap;
pub use thin_gap::{BpmSpec, CavitySpec, LatticeSpec, ThinGapLinac};

#[derive(Debug, Clone, PartialEq)]
struct DesignSetting {
    cavity: String,
    amp: f64,
    phase: f64,
}

/// Typed facade over the on-line model
pub struct ModelAdapter {
    model: Box<dyn OnlineModel>,
    bpm_frequency: f64,
    design: Vec<DesignSetting>,
}

impl std::fmt::Debug for ModelAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelAdapter")
            .field("bpm_frequency", &self.bpm_frequency)
            .field("design", &self.design)
            .finish()
    }
}

impl ModelAdapter {
    /// Creates the adapter and records the design amplitudes and phases of the model
    pub fn new(model: Box<dyn OnlineModel>, bpm_frequency: f64) -> Result<Self> {
        let design = model
            .cavities()
            .into_iter()
            .map(|cavity| {
                Ok(DesignSetting {
                    amp: model.cavity_amp(&cavity)?,
                    phase: model.cavity_phase(&cavity)?,
                    cavity,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            model,
            bpm_frequency,
            design,
        })
    }
    /// BPM RF frequency (Hz)
    pub fn bpm_frequency(&self) -> f64 {
        self.bpm_frequency
    }
    pub fn mass(&self) -> f64 {
        self.model.mass()
    }
    pub fn position(&self, node: &str) -> Result<f64> {
        self.model.position(node)
    }
    pub fn cavities(&self) -> Vec<String> {
        self.model.cavities()
    }
    pub fn cavity_amp(&self, cavity: &str) -> Result<f64> {
        self.model.cavity_amp(cavity)
    }
    pub fn cavity_phase(&self, cavity: &str) -> Result<f64> {
        self.model.cavity_phase(cavity)
    }
    fn design(&self, cavity: &str) -> Result<&DesignSetting> {
        self.design
            .iter()
            .find(|d| d.cavity == cavity)
            .ok_or_else(|| ModelError::NotACavity(cavity.to_string()))
    }
    /// Design amplitude of a cavity in model units
    pub fn design_amp(&self, cavity: &str) -> Result<f64> {
        self.design(cavity).map(|d| d.amp)
    }
    /// Design phase of a cavity first gap
    pub fn design_phase(&self, cavity: &str) -> Result<f64> {
        self.design(cavity).map(|d| d.phase)
    }
    /// Reverts all the cavities to their design amplitudes and phases
    pub fn restore_design_amp_phases(&mut self) -> Result<()> {
        for d in &self.design {
            self.model.set_cavity_amp(&d.cavity, d.amp)?;
            self.model.set_cavity_phase(&d.cavity, d.phase)?;
        }
        Ok(())
    }
    /// Makes `cavity` the only powered cavity of the model, tracking stops at `stop`
    pub fn activate(&mut self, cavity: &str, stop: &str) -> Result<ActiveCavity<'_>> {
        self.restore_design_amp_phases()?;
        self.design(cavity)?;
        // BPMs inside the cavity are valid stops, the tracker checks the range
        self.model.position(stop)?;
        for d in self.design.iter().filter(|d| d.cavity != cavity) {
            self.model.set_cavity_amp(&d.cavity, 0.)?;
        }
        log::debug!("model: {cavity} is active up to {stop}");
        Ok(ActiveCavity {
            cavity: cavity.to_string(),
            stop: stop.to_string(),
            ekin_out: None,
            adapter: self,
        })
    }
    /// Design input and output kinetic energies of every cavity
    pub fn design_energies(&mut self, injection_energy: f64) -> Result<Vec<(String, f64, f64)>> {
        self.restore_design_amp_phases()?;
        let mut ekin_in = injection_energy;
        let mut energies = vec![];
        for d in &self.design {
            let ekin_out = self
                .model
                .track_particle(None, &d.cavity, injection_energy)?
                .final_state()
                .map(|s| s.ekin)
                .ok_or_else(|| ModelError::Tracking(format!("empty trajectory to {}", d.cavity)))?;
            energies.push((d.cavity.clone(), ekin_in, ekin_out));
            ekin_in = ekin_out;
        }
        Ok(energies)
    }
    /// Kinetic energy from the phases of two BPMs with the cavities off
    ///
    /// The phase difference is made near the value expected for `ekin_guess`
    /// and then solved for the velocity: `φ₀ − φ₁ = 360·f·L/(β·c)`.
    /// Returns `None` if the phase difference is not physical.
    pub fn calculate_ekin(
        &self,
        positions: (f64, f64),
        phases: (f64, f64),
        ekin_guess: f64,
    ) -> Option<f64> {
        calculate_ekin(
            self.bpm_frequency,
            self.mass(),
            positions,
            phases,
            ekin_guess,
        )
    }
}

/// Phase measured by a BPM for a bunch arriving at `time`
///
/// BPM phases are RF phase lags: they decrease downstream and an
/// accelerating kick upstream of the BPM raises them.
pub fn bpm_phase(bpm_frequency: f64, time: f64) -> f64 {
    wrap_phase(-360. * bpm_frequency * time)
}

/// Modified Bessel function of the first kind of order 0
pub fn bessel_i0(x: f64) -> f64 {
    let ax = x.abs();
    if ax < 3.75 {
        let y = (x / 3.75).powi(2);
        1. + y
            * (3.5156229
                + y * (3.0899424
                    + y * (1.2067492 + y * (0.2659732 + y * (0.360768e-1 + y * 0.45813e-2)))))
    } else {
        let y = 3.75 / ax;
        (ax.exp() / ax.sqrt())
            * (0.39894228
                + y * (0.1328592e-1
                    + y * (0.225319e-2
                        + y * (-0.157565e-2
                            + y * (0.916281e-2
                                + y * (-0.2057706e-1
                                    + y * (0.2635537e-1
                                        + y * (-0.1647633e-1 + y * 0.392377e-2))))))))
    }
}

/// BPM signal reduction of a Gaussian bunch of rms length `sigma_z` (m)
///
/// The bunch form factor `exp(-(2π·f·σ_t)²/2)` is divided by the
/// transit factor of the BPM bore `I₀(2π·f·r/(β·γ·c))`.
pub fn bpm_amplitude_factor(
    bpm_frequency: f64,
    bore_radius: f64,
    ekin: f64,
    mass: f64,
    sigma_z: f64,
) -> f64 {
    let b = beta(ekin, mass);
    let g = interface::units::gamma(ekin, mass);
    let omega = 2. * std::f64::consts::PI * bpm_frequency;
    let sigma_t = sigma_z / (b * C_LIGHT);
    (-0.5 * (omega * sigma_t).powi(2)).exp() / bessel_i0(omega * bore_radius / (b * g * C_LIGHT))
}

/// Kinetic energy from the phase advance between two positions
///
/// `phases` are the BPM phases at the upstream and the downstream positions.
pub fn calculate_ekin(
    bpm_frequency: f64,
    mass: f64,
    (pos0, pos1): (f64, f64),
    (phase0, phase1): (f64, f64),
    ekin_guess: f64,
) -> Option<f64> {
    let length = pos1 - pos0;
    if length <= 0. {
        return None;
    }
    let expected = 360. * bpm_frequency * length / (beta(ekin_guess, mass) * C_LIGHT);
    let delta = make_phase_near(phase0 - phase1, expected);
    if delta <= 0. {
        return None;
    }
    let b = 360. * bpm_frequency * length / (delta * C_LIGHT);
    if !(b > 0. && b < 1.) {
        return None;
    }
    Some(interface::units::ekin_from_beta(b, mass))
}

/// The model restricted to one powered cavity
///
/// Amplitudes are model amplitudes and phases are live phases: the model phase of the
/// first gap is `phase - phase_shift`.
pub struct ActiveCavity<'a> {
    adapter: &'a mut ModelAdapter,
    cavity: String,
    stop: String,
    ekin_out: Option<f64>,
}

impl Drop for ActiveCavity<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.adapter.restore_design_amp_phases() {
            print_info("cannot restore the model design settings", Some(&e));
        }
    }
}

impl ActiveCavity<'_> {
    pub fn cavity(&self) -> &str {
        &self.cavity
    }
    pub fn design_amp(&self) -> Result<f64> {
        self.adapter.design_amp(&self.cavity)
    }
    pub fn design_phase(&self) -> Result<f64> {
        self.adapter.design_phase(&self.cavity)
    }
    pub fn bpm_frequency(&self) -> f64 {
        self.adapter.bpm_frequency
    }
    pub fn mass(&self) -> f64 {
        self.adapter.mass()
    }
    pub fn position(&self, node: &str) -> Result<f64> {
        self.adapter.position(node)
    }
    /// Sets the model amplitude and the phase of the first gap
    pub fn set_model_amp_phase(&mut self, amp: f64, phase: f64, phase_shift: f64) -> Result<()> {
        self.adapter.model.set_cavity_amp(&self.cavity, amp)?;
        self.set_model_phase(phase, phase_shift)
    }
    /// Sets the phase of the first gap
    pub fn set_model_phase(&mut self, phase: f64, phase_shift: f64) -> Result<()> {
        self.adapter
            .model
            .set_cavity_phase(&self.cavity, wrap_phase(phase - phase_shift))
    }
    /// Powers one more cavity with a model amplitude and a model phase
    pub fn power_cavity(&mut self, cavity: &str, amp: f64, model_phase: f64) -> Result<()> {
        self.adapter.design(cavity)?;
        self.adapter.model.set_cavity_amp(cavity, amp)?;
        self.adapter.model.set_cavity_phase(cavity, wrap_phase(model_phase))
    }
    pub fn model_amp(&self) -> Result<f64> {
        self.adapter.model.cavity_amp(&self.cavity)
    }
    /// Tracks a particle entering the cavity with kinetic energy `ekin_in` up to the stop node
    pub fn track(&mut self, ekin_in: f64) -> Result<Trajectory> {
        let trajectory =
            self.adapter
                .model
                .track_particle(Some(&self.cavity), &self.stop, ekin_in)?;
        self.ekin_out = trajectory.final_state().map(|s| s.ekin);
        Ok(trajectory)
    }
    /// BPM phases at `bpms`, in the same order, for the given cavity phase
    pub fn get_bpm_phases<S: AsRef<str>>(
        &mut self,
        ekin_in: f64,
        cav_phase: f64,
        phase_shift: f64,
        bpms: &[S],
    ) -> Result<Vec<f64>> {
        self.set_model_phase(cav_phase, phase_shift)?;
        let trajectory = self.track(ekin_in)?;
        let f = self.adapter.bpm_frequency;
        bpms.iter()
            .map(|bpm| {
                trajectory
                    .state(bpm.as_ref())
                    .map(|s| bpm_phase(f, s.time))
                    .ok_or_else(|| ModelError::UnknownNode(bpm.as_ref().to_string()))
            })
            .collect()
    }
    /// BPM phases at `bpms` with the active cavity off
    pub fn get_cav_off_bpm_phases<S: AsRef<str>>(
        &mut self,
        ekin_in: f64,
        bpms: &[S],
    ) -> Result<Vec<f64>> {
        let amp = self.model_amp()?;
        self.adapter.model.set_cavity_amp(&self.cavity, 0.)?;
        let phase = self.adapter.model.cavity_phase(&self.cavity)?;
        let phases = self.get_bpm_phases(ekin_in, phase, 0., bpms);
        self.adapter.model.set_cavity_amp(&self.cavity, amp)?;
        phases
    }
    /// Kinetic energy at the final state of the last tracking
    pub fn ekin_out(&self) -> Option<f64> {
        self.ekin_out
    }
    /// Tracks the longitudinal envelope entering the cavity up to `stop`
    pub fn track_envelope(&self, stop: &str, ekin_in: f64, sigma: Sigma) -> Result<Vec<EnvelopeState>> {
        self.adapter
            .model
            .track_envelope(Some(&self.cavity), stop, ekin_in, sigma)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use interface::units::H_MINUS_MASS;

    fn adapter() -> ModelAdapter {
        let cavity = |alias: &str, position: f64| CavitySpec {
            alias: alias.into(),
            position,
            length: 0.3,
            n_gaps: 4,
            rf_frequency: 805e6,
            amp: 2.,
            phase: -20.,
        };
        let model = ThinGapLinac::new(LatticeSpec {
            mass: H_MINUS_MASS,
            injection_energy: 87.,
            cavities: vec![cavity("C1", 1.), cavity("C2", 3.)],
            bpms: vec![
                BpmSpec {
                    alias: "B1".into(),
                    position: 2.,
                },
                BpmSpec {
                    alias: "B2".into(),
                    position: 2.5,
                },
                BpmSpec {
                    alias: "B3".into(),
                    position: 4.,
                },
            ],
        })
        .unwrap();
        ModelAdapter::new(Box::new(model), 402.5e6).unwrap()
    }

    #[test]
    fn guard_restores_design() {
        let mut adapter = adapter();
        {
            let mut cav = adapter.activate("C1", "B3").unwrap();
            cav.set_model_amp_phase(3., 10., 5.).unwrap();
            assert_eq!(cav.model_amp().unwrap(), 3.);
            assert_eq!(cav.adapter.cavity_amp("C2").unwrap(), 0.);
            assert_eq!(cav.adapter.cavity_phase("C1").unwrap(), 5.);
        }
        assert_eq!(adapter.cavity_amp("C1").unwrap(), 2.);
        assert_eq!(adapter.cavity_amp("C2").unwrap(), 2.);
        assert_eq!(adapter.cavity_phase("C1").unwrap(), -20.);
        let mut upstream = adapter.activate("C2", "B1").unwrap();
        assert!(matches!(upstream.track(87.), Err(ModelError::Range { .. })));
    }

    #[test]
    fn cav_off_energy() {
        let mut adapter = adapter();
        let (p1, p2) = (adapter.position("B1").unwrap(), adapter.position("B2").unwrap());
        let mut cav = adapter.activate("C1", "B3").unwrap();
        let phases = cav.get_cav_off_bpm_phases(87., &["B1", "B2"]).unwrap();
        assert_eq!(cav.ekin_out(), Some(87.));
        assert_eq!(cav.model_amp().unwrap(), 2.);
        drop(cav);
        let ekin = adapter
            .calculate_ekin((p1, p2), (phases[0], phases[1]), 80.)
            .unwrap();
        assert!((ekin - 87.).abs() < 1e-6, "{ekin}");
        assert!(adapter
            .calculate_ekin((p2, p1), (phases[0], phases[1]), 80.)
            .is_none());
    }

    #[test]
    fn bessel() {
        assert_eq!(bessel_i0(0.), 1.);
        assert!((bessel_i0(1.) - 1.2660658).abs() < 1e-6);
        assert!((bessel_i0(5.) - 27.239872).abs() < 1e-4);
        let point = bpm_amplitude_factor(805e6, 0.035, 200., H_MINUS_MASS, 0.);
        let long = bpm_amplitude_factor(805e6, 0.035, 200., H_MINUS_MASS, 0.01);
        assert!(point < 1. && long < point);
    }

    #[test]
    fn design_energies_chain() {
        let mut adapter = adapter();
        let energies = adapter.design_energies(87.).unwrap();
        assert_eq!(energies.len(), 2);
        assert_eq!(energies[0].1, 87.);
        assert_eq!(energies[1].1, energies[0].2);
        let gain = 2. * (-20f64).to_radians().cos();
        assert!((energies[1].2 - 87. - 2. * gain).abs() < 1e-9);
    }
}
