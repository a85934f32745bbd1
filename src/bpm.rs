//! BPMs and BPM scan data

use std::sync::atomic::{AtomicBool, Ordering};

use interface::{
    units::{make_phase_near, wrap_phase},
    BpmAmplitudeAvg, BpmPhaseAvg, BpmXAvg, BpmYAvg, Channel, ChannelError, ControlSystem,
    DataAdaptor, XmlError,
};

use crate::{
    fit::{FitError, HarmonicsFunc, LinearFit},
    stats::{AvgErr, GraphData},
};

/// One BPM reading
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BpmReading {
    pub phase: f64,
    pub amp: f64,
}

/// A beam position monitor used as a longitudinal phase and amplitude pickup
#[derive(Debug)]
pub struct BpmWrapper {
    alias: String,
    position: f64,
    is_on: AtomicBool,
    phase: Channel<BpmPhaseAvg>,
    amp: Channel<BpmAmplitudeAvg>,
    x: Channel<BpmXAvg>,
    y: Channel<BpmYAvg>,
}

impl BpmWrapper {
    /// Creates a BPM, the PVs are prefixed with the BPM alias
    pub fn new<S: Into<String>>(alias: S, position: f64) -> Self {
        let alias = alias.into();
        Self {
            phase: Channel::new(&alias),
            amp: Channel::new(&alias),
            x: Channel::new(&alias),
            y: Channel::new(&alias),
            alias,
            position,
            is_on: AtomicBool::new(true),
        }
    }
    pub fn alias(&self) -> &str {
        &self.alias
    }
    pub fn position(&self) -> f64 {
        self.position
    }
    pub fn is_on(&self) -> bool {
        self.is_on.load(Ordering::Acquire)
    }
    pub(crate) fn set_on(&self, on: bool) {
        self.is_on.store(on, Ordering::Release);
    }
    pub fn write_xml(&self, parent: &mut DataAdaptor) {
        parent
            .create_child("BPM_WRAPPER")
            .set_value("name", &self.alias)
            .set_value("pos", self.position)
            .set_value("isOn", self.is_on());
    }
    /// Restores the on/off state from the `BPM_WRAPPER` child with the same name, if any
    pub fn read_xml(&self, parent: &DataAdaptor) -> Result<(), XmlError> {
        for da in parent.children_named("BPM_WRAPPER") {
            if da.string_value("name")? == self.alias {
                self.set_on(da.bool_value("isOn")?);
            }
        }
        Ok(())
    }
    pub fn connect(&self, cs: &dyn ControlSystem) -> Result<(), ChannelError> {
        self.phase.connect(cs)?;
        self.amp.connect(cs)?;
        self.x.connect(cs)?;
        self.y.connect(cs)
    }
    /// Reads the BPM phase and amplitude, the phase is wrapped into [-180°,180°)
    pub fn read(&self, cs: &dyn ControlSystem) -> Result<BpmReading, ChannelError> {
        Ok(BpmReading {
            phase: wrap_phase(*self.phase.read(cs)?),
            amp: *self.amp.read(cs)?,
        })
    }
}

/// Results of the harmonic fit of a 360° scan
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HarmonicsSummary {
    pub func: HarmonicsFunc,
    /// cavity phase of the BPM phase maximum
    pub min_accel_phase: f64,
    /// cavity phase of the BPM phase minimum
    pub max_accel_phase: f64,
    /// cavity phase of the rising mid crossing
    pub zero_accel_phase: f64,
}

/// Scan of one BPM for a given context (a cavity amplitude or the cavity off)
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BpmScanData {
    pub bpm: String,
    /// cavity amplitude of the scan context
    pub cav_amp: f64,
    pub amp_gd: GraphData,
    pub phase_gd: GraphData,
    pub amp_fit_gd: GraphData,
    pub phase_fit_gd: GraphData,
    pub cav_off_amp: Option<AvgErr>,
    pub cav_off_phase: Option<AvgErr>,
    pub cav_on_amp: Option<AvgErr>,
    pub cav_on_phase: Option<AvgErr>,
    /// slope of the linear fit of the BPM phase
    pub derivative: Option<f64>,
    pub harmonics: Option<HarmonicsSummary>,
}

impl BpmScanData {
    pub fn new<S: Into<String>>(bpm: S, cav_amp: f64) -> Self {
        Self {
            bpm: bpm.into(),
            cav_amp,
            ..Default::default()
        }
    }
    /// Appends a scan point to both the amplitude and the phase graphs
    ///
    /// The phase is made near the previous phase of the scan.
    pub fn add_point(&mut self, x: f64, reading: BpmReading, phase_err: f64) {
        let phase = match self.phase_gd.len() {
            0 => reading.phase,
            n => make_phase_near(reading.phase, self.phase_gd.y(n - 1)),
        };
        self.amp_gd.add_point(x, reading.amp, 0.);
        self.phase_gd.add_point(x, phase, phase_err);
    }
    pub fn len(&self) -> usize {
        self.phase_gd.len()
    }
    pub fn is_empty(&self) -> bool {
        self.phase_gd.is_empty()
    }
    pub fn remove_last_point(&mut self) {
        self.amp_gd.remove_last_point();
        self.phase_gd.remove_last_point();
    }
    /// Checks the amplitude of the last point, the point is removed from the scan if it is below `min_amp`
    pub fn check_last_data_point(&mut self, min_amp: f64) -> bool {
        match self.amp_gd.len() {
            0 => true,
            n if self.amp_gd.y(n - 1) < min_amp => {
                self.remove_last_point();
                false
            }
            _ => true,
        }
    }
    pub fn clear(&mut self) {
        self.amp_gd.clear();
        self.phase_gd.clear();
        self.amp_fit_gd.clear();
        self.phase_fit_gd.clear();
        self.derivative = None;
        self.harmonics = None;
    }
    /// Fits the BPM phase with a 2 harmonics function and fills the phase fit graph
    pub fn make_harmonic_fit(&mut self) -> Result<HarmonicsSummary, FitError> {
        let func = HarmonicsFunc::fit(self.phase_gd.xs(), self.phase_gd.ys())?;
        let summary = HarmonicsSummary {
            func,
            min_accel_phase: func.find_max(),
            max_accel_phase: func.find_min(),
            zero_accel_phase: func.rising_mid_crossing(),
        };
        self.phase_fit_gd.clear();
        for i in 0..=72 {
            let x = -180. + 5. * i as f64;
            self.phase_fit_gd.add_point(x, func.value(x), 0.);
        }
        self.harmonics = Some(summary);
        Ok(summary)
    }
    /// Fits the BPM phase with a straight line and fills the phase fit graph
    pub fn make_linear_fit(&mut self) -> Result<LinearFit, FitError> {
        let fit = LinearFit::new(self.phase_gd.xs(), self.phase_gd.ys())?;
        self.phase_fit_gd.clear();
        for x in self.phase_gd.xs().to_vec() {
            self.phase_fit_gd.add_point(x, fit.value(x), 0.);
        }
        self.derivative = Some(fit.slope);
        Ok(fit)
    }
    /// Averages of the amplitude and of the phase of all the points of the scan
    pub fn averages(&self) -> Option<(AvgErr, AvgErr)> {
        Some((
            AvgErr::from_samples(self.amp_gd.ys())?,
            AvgErr::from_phases(self.phase_gd.ys())?,
        ))
    }

    pub fn write_xml(&self, parent: &mut DataAdaptor) {
        let da = parent.create_child("BPM_SCAN_DATA");
        da.set_value("bpm", &self.bpm);
        da.set_value("cav_amp", self.cav_amp);
        if let Some(derivative) = self.derivative {
            da.set_value("derivative", derivative);
        }
        self.amp_gd.write_xml(da, "amp_gd");
        self.phase_gd.write_xml(da, "phase_gd");
        self.amp_fit_gd.write_xml(da, "amp_fit_gd");
        self.phase_fit_gd.write_xml(da, "phase_fit_gd");
        for (stat, name) in [
            (&self.cav_off_amp, "cav_off_amp"),
            (&self.cav_off_phase, "cav_off_phase"),
            (&self.cav_on_amp, "cav_on_amp"),
            (&self.cav_on_phase, "cav_on_phase"),
        ] {
            if let Some(stat) = stat {
                stat.write_xml(da, name);
            }
        }
        if let Some(h) = &self.harmonics {
            let hda = da.create_child("harmonics");
            hda.set_f64_array("params", &h.func.params);
            hda.set_value("rms_err", h.func.rms_err);
            hda.set_value("min_accel_phase", h.min_accel_phase);
            hda.set_value("max_accel_phase", h.max_accel_phase);
            hda.set_value("zero_accel_phase", h.zero_accel_phase);
        }
    }
    pub fn read_xml(da: &DataAdaptor) -> Result<Self, XmlError> {
        let harmonics = da
            .child("harmonics")
            .map(|hda| -> Result<HarmonicsSummary, XmlError> {
                let params = hda.f64_array("params")?;
                let params: [f64; 5] =
                    params
                        .try_into()
                        .map_err(|p: Vec<f64>| XmlError::InvalidValue {
                            element: "harmonics".into(),
                            attribute: "params".into(),
                            value: format!("{} values", p.len()),
                        })?;
                Ok(HarmonicsSummary {
                    func: HarmonicsFunc {
                        params,
                        rms_err: hda.f64_value("rms_err")?,
                    },
                    min_accel_phase: hda.f64_value("min_accel_phase")?,
                    max_accel_phase: hda.f64_value("max_accel_phase")?,
                    zero_accel_phase: hda.f64_value("zero_accel_phase")?,
                })
            })
            .transpose()?;
        Ok(Self {
            bpm: da.string_value("bpm")?.to_string(),
            cav_amp: da.f64_value("cav_amp")?,
            amp_gd: GraphData::read_xml(da, "amp_gd")?,
            phase_gd: GraphData::read_xml(da, "phase_gd")?,
            amp_fit_gd: GraphData::read_xml(da, "amp_fit_gd")?,
            phase_fit_gd: GraphData::read_xml(da, "phase_fit_gd")?,
            cav_off_amp: AvgErr::read_xml(da, "cav_off_amp")?,
            cav_off_phase: AvgErr::read_xml(da, "cav_off_phase")?,
            cav_on_amp: AvgErr::read_xml(da, "cav_on_amp")?,
            cav_on_phase: AvgErr::read_xml(da, "cav_on_phase")?,
            derivative: da
                .has_attribute("derivative")
                .then(|| da.f64_value("derivative"))
                .transpose()?,
            harmonics,
        })
    }
}
