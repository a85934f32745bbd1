//! PASTA (phase and amplitude two BPMs scan) residual

use interface::{units::make_phase_near, DataAdaptor, XmlError};

use super::{DiffError, AMP_COEFF, EKIN_IN, PHASE_SHIFT};
use crate::{
    bpm::BpmScanData,
    fit::{ScoreError, Scorer},
    model::ActiveCavity,
    stats::GraphData,
};

/// Phase scans of the local BPMs at one cavity amplitude
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PastaRecord {
    /// live cavity amplitude
    pub cav_amp: f64,
    pub use_in_pasta: bool,
    /// one scan per local BPM
    pub scans: Vec<BpmScanData>,
}
impl PastaRecord {
    pub fn new<S: AsRef<str>>(cav_amp: f64, bpms: &[S]) -> Self {
        Self {
            cav_amp,
            use_in_pasta: true,
            scans: bpms
                .iter()
                .map(|bpm| BpmScanData::new(bpm.as_ref(), cav_amp))
                .collect(),
        }
    }
    pub fn write_xml(&self, parent: &mut DataAdaptor) {
        let da = parent.create_child("pasta_record");
        da.set_value("cav_amp", self.cav_amp)
            .set_value("use_in_pasta", self.use_in_pasta);
        for scan in &self.scans {
            scan.write_xml(da);
        }
    }
    pub fn read_xml(da: &DataAdaptor) -> Result<Self, XmlError> {
        Ok(Self {
            cav_amp: da.f64_value("cav_amp")?,
            use_in_pasta: if da.has_attribute("use_in_pasta") {
                da.bool_value("use_in_pasta")?
            } else {
                true
            },
            scans: da
                .children_named("BPM_SCAN_DATA")
                .map(BpmScanData::read_xml)
                .collect::<Result<Vec<_>, _>>()?,
        })
    }
}

/// PASTA residual
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PastaMode {
    /// the model phase difference of the two BPMs against the measured one
    Difference,
    /// the absolute model phases of the selected BPMs against the measured ones
    OneBpm { use_n1: bool, use_n2: bool },
}
impl PastaMode {
    /// The absolute phases are compared only if the cavity off phases are used
    pub fn new(use_cav_off: bool, use_n1: bool, use_n2: bool) -> Self {
        if use_cav_off && (use_n1 || use_n2) {
            Self::OneBpm { use_n1, use_n2 }
        } else {
            Self::Difference
        }
    }
}

/// How the PASTA records are compared to the model
#[derive(Debug, Clone, PartialEq)]
pub struct PastaSettings {
    /// indices of the two BPMs in the records scans
    pub bpm_indices: (usize, usize),
    pub mode: PastaMode,
    /// measured phases of the two BPMs with the cavity off
    pub cav_off_phases: Option<[f64; 2]>,
    /// cavity phase range of the model curves
    pub fit_range: (f64, f64),
    /// number of points of the model curves
    pub n_points: usize,
}

fn value_at(gd: &GraphData, x: f64) -> Result<f64, DiffError> {
    gd.value_y(x)
        .ok_or_else(|| DiffError::Data("empty PASTA scan".into()))
}

/// Mean squared difference between the model and the PASTA records
///
/// The model curves of the two BPMs are computed on `settings.n_points` cavity phases evenly
/// spread over `settings.fit_range`, stored into the `phase_fit_gd` of the records scans and
/// interpolated at the measured cavity phases.
pub fn pasta_diff2(
    active: &mut ActiveCavity,
    records: &mut [PastaRecord],
    settings: &PastaSettings,
    params: &[f64],
) -> Result<f64, DiffError> {
    let (phase_shift, ekin_in, amp_coeff) = (params[PHASE_SHIFT], params[EKIN_IN], params[AMP_COEFF]);
    let n = settings.n_points;
    if n < 3 {
        return Err(DiffError::Data(format!(
            "Number of phase points for fitting is too low! N = {n} Stop."
        )));
    }
    let (i0, i1) = settings.bpm_indices;
    let out_of_range = || DiffError::Data(format!("PASTA BPM indices ({i0},{i1}) are out of range"));
    let no_data = || DiffError::Data("No PASTA scan data! Stop.".into());
    let bpms = match records.iter().find(|r| r.use_in_pasta) {
        None => return Err(no_data()),
        Some(record) => match (record.scans.get(i0), record.scans.get(i1)) {
            (Some(s0), Some(s1)) => [s0.bpm.clone(), s1.bpm.clone()],
            _ => return Err(out_of_range()),
        },
    };
    let cav_off_shift = match settings.cav_off_phases {
        Some(measured) => {
            let model = active.get_cav_off_bpm_phases(ekin_in, &bpms)?;
            Some([model[0] - measured[0], model[1] - measured[1]])
        }
        None => None,
    };
    let (phase_min, phase_max) = settings.fit_range;
    let phase_step = (phase_max - phase_min) / (n - 1) as f64;

    let mut diff2 = 0.;
    let mut count = 0usize;
    for record in records.iter_mut().filter(|r| r.use_in_pasta) {
        let (meas0, meas1) = match (record.scans.get(i0), record.scans.get(i1)) {
            (Some(s0), Some(s1)) if s0.is_empty() || s1.is_empty() => continue,
            (Some(s0), Some(s1)) => (&s0.phase_gd, &s1.phase_gd),
            _ => return Err(out_of_range()),
        };
        active.set_model_amp_phase(amp_coeff * record.cav_amp, phase_min, phase_shift)?;
        let mut fit0 = GraphData::new();
        let mut fit1 = GraphData::new();
        for i in 0..n {
            let cav_phase = phase_min + i as f64 * phase_step;
            let phases = active.get_bpm_phases(ekin_in, cav_phase, phase_shift, &bpms)?;
            let (mut p0, mut p1) = (phases[0], phases[1]);
            if let Some([s0, s1]) = cav_off_shift {
                p0 -= s0;
                p1 -= s1;
            }
            fit0.add_point(cav_phase, p0, 0.);
            fit1.add_point(cav_phase, p1, 0.);
        }
        fit0.unwrap_phases_near(meas0.y(0));
        fit1.unwrap_phases_near(meas1.y(0));
        for &cav_phase in meas0.xs() {
            count += 1;
            diff2 += match settings.mode {
                PastaMode::OneBpm { use_n1, use_n2 } => {
                    let mut d2 = 0.;
                    if use_n1 {
                        d2 += (value_at(&fit0, cav_phase)? - value_at(meas0, cav_phase)?).powi(2);
                    }
                    if use_n2 {
                        d2 += (value_at(&fit1, cav_phase)? - value_at(meas1, cav_phase)?).powi(2);
                    }
                    d2
                }
                PastaMode::Difference => {
                    let diff_fit = value_at(&fit1, cav_phase)? - value_at(&fit0, cav_phase)?;
                    let diff = make_phase_near(
                        value_at(meas1, cav_phase)? - value_at(meas0, cav_phase)?,
                        diff_fit,
                    );
                    (diff_fit - diff).powi(2)
                }
            };
        }
        if let Some(scan) = record.scans.get_mut(i0) {
            scan.phase_fit_gd = fit0;
        }
        if let Some(scan) = record.scans.get_mut(i1) {
            scan.phase_fit_gd = fit1;
        }
    }
    if count == 0 {
        return Err(no_data());
    }
    Ok(diff2 / count as f64)
}

/// Simplex objective of the PASTA fit
pub struct PastaScorer<'a, 'm> {
    active: &'a mut ActiveCavity<'m>,
    records: &'a mut [PastaRecord],
    settings: PastaSettings,
    min_diff2: f64,
}
impl<'a, 'm> PastaScorer<'a, 'm> {
    pub fn new(
        active: &'a mut ActiveCavity<'m>,
        records: &'a mut [PastaRecord],
        settings: PastaSettings,
    ) -> Self {
        Self {
            active,
            records,
            settings,
            min_diff2: f64::MAX,
        }
    }
    /// Smallest residual seen so far
    pub fn min_diff2(&self) -> f64 {
        self.min_diff2
    }
    /// Computes the residual, filling the fit curves, without updating the minimum
    pub fn diff2(&mut self, params: &[f64]) -> Result<f64, DiffError> {
        pasta_diff2(self.active, self.records, &self.settings, params)
    }
}
impl Scorer for PastaScorer<'_, '_> {
    fn score(&mut self, params: &[f64]) -> Result<f64, ScoreError> {
        let diff2 = self.diff2(params)?;
        self.min_diff2 = self.min_diff2.min(diff2);
        Ok(diff2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        bpm::BpmReading,
        model::{BpmSpec, CavitySpec, LatticeSpec, ModelAdapter, ThinGapLinac},
    };
    use interface::units::{wrap_phase, H_MINUS_MASS};

    fn adapter() -> ModelAdapter {
        let model = ThinGapLinac::new(LatticeSpec {
            mass: H_MINUS_MASS,
            injection_energy: 40.,
            cavities: vec![CavitySpec {
                alias: "CAV".into(),
                position: 1.,
                length: 1.,
                n_gaps: 10,
                rf_frequency: 402.5e6,
                amp: 1.5,
                phase: -30.,
            }],
            bpms: ["B0", "B1", "B2"]
                .iter()
                .zip([2., 3.5, 5.])
                .map(|(alias, position)| BpmSpec {
                    alias: alias.to_string(),
                    position,
                })
                .collect(),
        })
        .unwrap();
        ModelAdapter::new(Box::new(model), 402.5e6).unwrap()
    }

    fn records(active: &mut ActiveCavity, params: [f64; 3]) -> Vec<PastaRecord> {
        let bpms = ["B0", "B1", "B2"];
        [1.02, 1., 0.98]
            .into_iter()
            .map(|amp| {
                let mut record = PastaRecord::new(amp, &bpms);
                active
                    .set_model_amp_phase(params[AMP_COEFF] * amp, 0., params[PHASE_SHIFT])
                    .unwrap();
                for i in 0..11 {
                    let cav_phase = -20. + 3. * i as f64;
                    let phases = active
                        .get_bpm_phases(params[EKIN_IN], cav_phase, params[PHASE_SHIFT], &bpms)
                        .unwrap();
                    for (scan, phase) in record.scans.iter_mut().zip(phases) {
                        // BPM offsets cancel in the difference only if they are equal
                        scan.add_point(cav_phase, BpmReading { phase: wrap_phase(phase + 7.), amp: 1. }, 0.1);
                    }
                }
                record
            })
            .collect()
    }

    fn settings() -> PastaSettings {
        PastaSettings {
            bpm_indices: (1, 2),
            mode: PastaMode::Difference,
            cav_off_phases: None,
            fit_range: (-20., 10.),
            n_points: 30,
        }
    }

    #[test]
    fn zero_at_truth() {
        let mut adapter = adapter();
        let mut active = adapter.activate("CAV", "B2").unwrap();
        let truth = [4., 40.1, 1.2];
        let mut records = records(&mut active, truth);
        let diff2 = pasta_diff2(&mut active, &mut records, &settings(), &truth).unwrap();
        assert!(diff2 < 1e-3, "{diff2}");
        assert_eq!(records[0].scans[1].phase_fit_gd.len(), 30);
        let off = pasta_diff2(&mut active, &mut records, &settings(), &[9., 40.1, 1.2]).unwrap();
        assert!(off > 100. * diff2.max(1e-6), "{off}");
    }

    #[test]
    fn unused_records() {
        let mut adapter = adapter();
        let mut active = adapter.activate("CAV", "B2").unwrap();
        let truth = [0., 40., 1.];
        let mut records = records(&mut active, truth);
        records.iter_mut().for_each(|r| r.use_in_pasta = false);
        let e = pasta_diff2(&mut active, &mut records, &settings(), &truth).unwrap_err();
        assert_eq!(e.to_string(), "No PASTA scan data! Stop.");
    }

    #[test]
    fn empty_scans() {
        let mut adapter = adapter();
        let mut active = adapter.activate("CAV", "B2").unwrap();
        let truth = [0., 40., 1.];
        let mut empty = vec![PastaRecord::new(1., &["B0", "B1", "B2"]); 2];
        let e = pasta_diff2(&mut active, &mut empty, &settings(), &truth).unwrap_err();
        assert_eq!(e.to_string(), "No PASTA scan data! Stop.");
        // a record with fewer BPMs than the first one
        let mut records = records(&mut active, truth);
        records[2].scans.truncate(2);
        let e = pasta_diff2(&mut active, &mut records, &settings(), &truth).unwrap_err();
        assert_eq!(e.to_string(), "PASTA BPM indices (1,2) are out of range");
    }

    #[test]
    fn mode() {
        assert_eq!(PastaMode::new(false, true, true), PastaMode::Difference);
        assert_eq!(PastaMode::new(true, false, false), PastaMode::Difference);
        assert_eq!(
            PastaMode::new(true, false, true),
            PastaMode::OneBpm {
                use_n1: false,
                use_n2: true
            }
        );
    }

    #[test]
    fn record_xml() {
        let mut record = PastaRecord::new(0.7, &["B0", "B1"]);
        record.use_in_pasta = false;
        record.scans[1].add_point(3., BpmReading { phase: 10., amp: 2. }, 0.5);
        let mut root = DataAdaptor::new("pasta_scan_data");
        record.write_xml(&mut root);
        let back = PastaRecord::read_xml(root.require_child("pasta_record").unwrap()).unwrap();
        assert_eq!(back, record);
    }
}
