//! RF cavity identity and set-points

use interface::{
    units::wrap_phase, BlankBeam, Channel, ChannelError, ControlSystem, CtlAmpSet, CtlPhaseSet,
    DataAdaptor, NetPwr, XmlError,
};

/// One RF cavity
///
/// Amplitudes are in live controller units unless noted, phases in degrees.
/// The model amplitude is `amp_coeff × live amplitude` and
/// the model phase is `live phase − phase_shift`.
#[derive(Debug, Clone)]
pub struct CavityWrapper {
    pub alias: String,
    pub position: f64,
    amp_set: Channel<CtlAmpSet>,
    phase_set: Channel<CtlPhaseSet>,
    net_pwr: Channel<NetPwr>,
    blank: Channel<BlankBeam>,
    /// design amplitude (model units)
    pub design_amp: f64,
    /// design phase (model phase)
    pub design_phase: f64,
    pub init_amp: f64,
    pub init_phase: f64,
    pub live_amp: f64,
    pub live_phase: f64,
    pub new_amp: Option<f64>,
    pub new_phase: Option<f64>,
    pub ekin_in_design: f64,
    pub ekin_out_design: f64,
    pub ekin_in_delta_design: f64,
    pub ekin_out_delta_design: f64,
    /// fitted input kinetic energy (MeV)
    pub ekin_in: f64,
    /// output kinetic energy tracked with the fitted parameters (MeV)
    pub ekin_out: f64,
    /// ratio of the model amplitude to the live amplitude
    pub amp_coeff: f64,
    /// live phase matching the design phase
    pub phase_guess: f64,
    /// live to model phase offset
    pub phase_shift: f64,
    /// average fit residual (degree)
    pub avg_fit_err: f64,
    /// energy gain from the sine-like scan (keV)
    pub energy_gain: f64,
    pub fit_ekin_in: bool,
    pub fit_amp_coeff: bool,
    pub fit_phase_shift: bool,
    pub net_pwr_goal: f64,
    pub net_pwr_avg: f64,
    pub net_pwr_sigma: f64,
    /// lower bound of the live amplitude in percent of the initial amplitude
    pub safe_relative_amp_down: f64,
    /// upper bound of the live amplitude in percent of the initial amplitude
    pub safe_relative_amp_up: f64,
    pub is_analyzed: bool,
}

impl CavityWrapper {
    /// Creates a cavity with the LLRF PV prefix and the net power PV
    pub fn new<S: Into<String>>(alias: S, position: f64, llrf: &str, net_pwr_pv: &str) -> Self {
        Self {
            alias: alias.into(),
            position,
            amp_set: Channel::new(llrf),
            phase_set: Channel::new(llrf),
            net_pwr: Channel::with_pv(net_pwr_pv),
            blank: Channel::new(llrf),
            design_amp: 0.,
            design_phase: 0.,
            init_amp: 0.,
            init_phase: 0.,
            live_amp: 0.,
            live_phase: 0.,
            new_amp: None,
            new_phase: None,
            ekin_in_design: 0.,
            ekin_out_design: 0.,
            ekin_in_delta_design: 0.,
            ekin_out_delta_design: 0.,
            ekin_in: 0.,
            ekin_out: 0.,
            amp_coeff: 1.,
            phase_guess: 0.,
            phase_shift: 0.,
            avg_fit_err: 0.,
            energy_gain: 0.,
            fit_ekin_in: true,
            fit_amp_coeff: true,
            fit_phase_shift: true,
            net_pwr_goal: 0.,
            net_pwr_avg: 0.,
            net_pwr_sigma: 0.,
            safe_relative_amp_down: 7.,
            safe_relative_amp_up: 7.,
            is_analyzed: false,
        }
    }
    pub fn connect(&self, cs: &dyn ControlSystem) -> Result<(), ChannelError> {
        self.amp_set.connect(cs)?;
        self.phase_set.connect(cs)?;
        self.net_pwr.connect(cs)?;
        self.blank.connect(cs)
    }
    /// Reads the live amplitude and phase
    pub fn read_live(&mut self, cs: &dyn ControlSystem) -> Result<(f64, f64), ChannelError> {
        self.live_amp = self.amp_set.get(cs)?;
        self.live_phase = wrap_phase(self.phase_set.get(cs)?);
        Ok((self.live_amp, self.live_phase))
    }
    /// Stores the live amplitude and phase as the initial ones and clears the new set-points
    pub fn init(&mut self, cs: &dyn ControlSystem) -> Result<(), ChannelError> {
        let (amp, phase) = self.read_live(cs)?;
        self.init_amp = amp;
        self.init_phase = phase;
        self.new_amp = None;
        self.new_phase = None;
        self.is_analyzed = false;
        Ok(())
    }
    /// Lowest and highest live amplitudes allowed
    pub fn safe_amp_range(&self) -> (f64, f64) {
        (
            self.init_amp * (1. - 0.01 * self.safe_relative_amp_down),
            self.init_amp * (1. + 0.01 * self.safe_relative_amp_up),
        )
    }
    /// Writes the live amplitude clamped to the safe range, returns the written value
    pub fn set_live_amp(&mut self, cs: &dyn ControlSystem, amp: f64) -> Result<f64, ChannelError> {
        let (low, high) = self.safe_amp_range();
        let safe = amp.clamp(low.min(high), high.max(low));
        if safe != amp {
            log::warn!(
                "{}: amplitude {amp:.5} is outside of the safe range, {safe:.5} is used",
                self.alias
            );
        }
        self.amp_set.put(cs, safe)?;
        self.live_amp = safe;
        Ok(safe)
    }
    /// Writes the live phase wrapped into [-180°,180°)
    pub fn set_live_phase(&mut self, cs: &dyn ControlSystem, phase: f64) -> Result<(), ChannelError> {
        let phase = wrap_phase(phase);
        self.phase_set.put(cs, phase)?;
        self.live_phase = phase;
        Ok(())
    }
    pub fn set_blank_beam(&self, cs: &dyn ControlSystem, blank: bool) -> Result<(), ChannelError> {
        self.blank.put(cs, blank)
    }
    pub fn is_blanked(&self, cs: &dyn ControlSystem) -> Result<bool, ChannelError> {
        self.blank.get(cs)
    }
    pub fn read_net_power(&self, cs: &dyn ControlSystem) -> Result<f64, ChannelError> {
        self.net_pwr.get(cs)
    }
    /// Writes back the initial amplitude and phase
    pub fn restore_initial(&mut self, cs: &dyn ControlSystem) -> Result<(), ChannelError> {
        self.amp_set.put(cs, self.init_amp)?;
        self.live_amp = self.init_amp;
        self.set_live_phase(cs, self.init_phase)
    }
    /// Commits the fitted phase shift and amplitude coefficient and derives the new set-points
    ///
    /// `guess_phase_shift` (degree) is added to the phase and `guess_cav_amp_shift` (percent)
    /// scales the amplitude coefficient by `1 − 0.01·shift`.
    pub fn commit_fit(
        &mut self,
        phase_shift: f64,
        amp_coeff: f64,
        guess_phase_shift: f64,
        guess_cav_amp_shift: f64,
    ) {
        self.phase_shift = wrap_phase(phase_shift + guess_phase_shift);
        self.amp_coeff = amp_coeff * (1. - 0.01 * guess_cav_amp_shift);
        self.phase_guess = wrap_phase(self.design_phase + self.phase_shift);
        self.new_phase = Some(self.phase_guess);
        self.new_amp = Some(self.design_amp / self.amp_coeff);
    }

    pub fn write_xml(&self, parent: &mut DataAdaptor) {
        let da = parent.create_child("CAV_WRAPPER_PARAMS");
        da.set_value("alias", &self.alias)
            .set_value("pos", self.position)
            .set_value("design_amp", self.design_amp)
            .set_value("design_phase", self.design_phase)
            .set_value("initAmp", self.init_amp)
            .set_value("initPhase", self.init_phase)
            .set_value("liveAmp", self.live_amp)
            .set_value("livePhase", self.live_phase);
        if let Some(amp) = self.new_amp {
            da.set_value("newAmp", amp);
        }
        if let Some(phase) = self.new_phase {
            da.set_value("newPhase", phase);
        }
        da.set_value("Ekin_in_design", self.ekin_in_design)
            .set_value("Ekin_out_design", self.ekin_out_design)
            .set_value("Ekin_in_delta_design", self.ekin_in_delta_design)
            .set_value("Ekin_out_delta_design", self.ekin_out_delta_design)
            .set_value("Ekin_in", self.ekin_in)
            .set_value("Ekin_out", self.ekin_out)
            .set_value("cav_amp_coeff", self.amp_coeff)
            .set_value("cav_phase_guess", self.phase_guess)
            .set_value("phase_shift", self.phase_shift)
            .set_value("avg_pasta_err", self.avg_fit_err)
            .set_value("energy_gain", self.energy_gain)
            .set_value("fit_Ekin_in", self.fit_ekin_in)
            .set_value("fit_amp_coeff", self.fit_amp_coeff)
            .set_value("fit_phase_shift", self.fit_phase_shift)
            .set_value("net_pwr_goal", self.net_pwr_goal)
            .set_value("net_pwr_avg", self.net_pwr_avg)
            .set_value("net_pwr_sigma", self.net_pwr_sigma)
            .set_value("safe_relative_amp_down", self.safe_relative_amp_down)
            .set_value("safe_relative_amp_up", self.safe_relative_amp_up)
            .set_value("is_analyzed", self.is_analyzed);
    }
    /// Restores the cavity state, the alias and the PVs are kept
    pub fn read_xml(&mut self, parent: &DataAdaptor) -> Result<(), XmlError> {
        let da = parent.require_child("CAV_WRAPPER_PARAMS")?;
        let optional = |key: &str| da.has_attribute(key).then(|| da.f64_value(key)).transpose();
        self.design_amp = da.f64_value("design_amp")?;
        self.design_phase = da.f64_value("design_phase")?;
        self.init_amp = da.f64_value("initAmp")?;
        self.init_phase = da.f64_value("initPhase")?;
        self.live_amp = da.f64_value("liveAmp")?;
        self.live_phase = da.f64_value("livePhase")?;
        self.new_amp = optional("newAmp")?;
        self.new_phase = optional("newPhase")?;
        self.ekin_in_design = da.f64_value("Ekin_in_design")?;
        self.ekin_out_design = da.f64_value("Ekin_out_design")?;
        self.ekin_in_delta_design = da.f64_value("Ekin_in_delta_design")?;
        self.ekin_out_delta_design = da.f64_value("Ekin_out_delta_design")?;
        self.ekin_in = da.f64_value("Ekin_in")?;
        self.ekin_out = da.f64_value("Ekin_out")?;
        self.amp_coeff = da.f64_value("cav_amp_coeff")?;
        self.phase_guess = da.f64_value("cav_phase_guess")?;
        self.phase_shift = optional("phase_shift")?.unwrap_or_default();
        self.avg_fit_err = da.f64_value("avg_pasta_err")?;
        self.energy_gain = optional("energy_gain")?.unwrap_or_default();
        self.fit_ekin_in = da.bool_value("fit_Ekin_in")?;
        self.fit_amp_coeff = da.bool_value("fit_amp_coeff")?;
        self.fit_phase_shift = da.bool_value("fit_phase_shift")?;
        self.net_pwr_goal = da.f64_value("net_pwr_goal")?;
        self.net_pwr_avg = optional("net_pwr_avg")?.unwrap_or_default();
        self.net_pwr_sigma = optional("net_pwr_sigma")?.unwrap_or_default();
        self.safe_relative_amp_down = da.f64_value("safe_relative_amp_down")?;
        self.safe_relative_amp_up = da.f64_value("safe_relative_amp_up")?;
        self.is_analyzed = da.bool_value("is_analyzed")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commit() {
        let mut cav = CavityWrapper::new("DTL3", 20., "DTL_LLRF:FCM3", "DTL_LLRF:FCM3:NetPwr");
        cav.design_amp = 2.;
        cav.design_phase = -30.;
        cav.commit_fit(175., 1.25, 10., 2.);
        assert_eq!(cav.phase_shift, -175.);
        assert!((cav.new_phase.unwrap() - 155.).abs() < 1e-12);
        let amp = cav.new_amp.unwrap();
        assert!((amp * cav.amp_coeff / cav.design_amp - 1.).abs() < 1e-12);
    }

    #[test]
    fn xml_round_trip() {
        let mut cav = CavityWrapper::new("CCL1", 50., "CCL_LLRF:FCM1", "CCL_LLRF:FCM1:NetPwr");
        cav.init_amp = 0.61;
        cav.new_amp = Some(0.6123456789);
        cav.ekin_in = 87.123456;
        cav.fit_amp_coeff = false;
        let mut root = DataAdaptor::new("ROOT");
        cav.write_xml(&mut root);
        let mut back = CavityWrapper::new("CCL1", 50., "CCL_LLRF:FCM1", "CCL_LLRF:FCM1:NetPwr");
        back.read_xml(&root).unwrap();
        assert_eq!(back.new_amp, cav.new_amp);
        assert_eq!(back.new_phase, None);
        assert_eq!(back.ekin_in, cav.ekin_in);
        assert!(!back.fit_amp_coeff);
    }
}
